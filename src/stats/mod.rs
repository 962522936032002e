//! Statistics storage
//!
//! Collects latency measurements and detection counts coming out of a
//! session for reporting.

pub mod store;
