//! E2E tests for chirp round-trip latency measurement
//!
//! A session runs its chirp loop against a simulated acoustic loopback with
//! a known delay. Every measured latency should match that delay to within a
//! few samples, with emission and detection timed on the same sample clock.

use tonetimer::audio::session::{Session, SessionEvent};
use tonetimer::audio::simulator::LoopbackSimulator;
use tonetimer::config::{SessionConfig, ToneConfig};
use tonetimer::stats::store::StatsStore;
use tonetimer::LatencyResult;

const TARGET: f64 = 44100.0 / 2.3;

fn chirp_loop_config() -> SessionConfig {
    SessionConfig {
        tones: vec![ToneConfig {
            chirp: true,
            ..ToneConfig::new(TARGET)
        }],
        ..Default::default()
    }
}

/// Run the chirp loop for `samples` and collect latency measurements
fn measure(
    config: &SessionConfig,
    sim: &mut LoopbackSimulator,
    samples: u64,
) -> (Session, Vec<LatencyResult>) {
    let mut session = Session::new(config).unwrap();
    let events = session.events();
    session.start();

    let mut results = Vec::new();
    let end = session.now() + samples;
    while session.now() < end {
        sim.run_block(&mut session, config.block_size).unwrap();
        for event in events.drain() {
            if let SessionEvent::Measured(result) = event {
                results.push(result);
            }
        }
    }
    (session, results)
}

#[test]
fn test_measured_latency_matches_loopback_delay() {
    for delay in [1024usize, 2048, 4410, 10000] {
        let mut sim = LoopbackSimulator::new(delay, 1.0, 0.0);
        let (_, results) = measure(&chirp_loop_config(), &mut sim, 88200);

        assert!(results.len() >= 3, "delay {}: only {} results", delay, results.len());
        for result in &results {
            assert!(
                (result.latency_samples - delay as i64).abs() <= 3,
                "delay {}: measured {}",
                delay,
                result.latency_samples
            );
        }
    }
}

#[test]
fn test_latency_in_milliseconds() {
    let mut sim = LoopbackSimulator::new(4410, 1.0, 0.0);
    let (_, results) = measure(&chirp_loop_config(), &mut sim, 44100);

    assert!(!results.is_empty());
    for result in &results {
        assert!(
            (result.latency_ms - 100.0).abs() < 0.1,
            "expected about 100 ms, got {}",
            result.latency_ms
        );
    }
}

#[test]
fn test_chirps_follow_detections() {
    let config = chirp_loop_config();
    let mut sim = LoopbackSimulator::new(2048, 1.0, 0.0);
    let (_, results) = measure(&config, &mut sim, 88200);

    // First chirp one lead after start, every later one one lead after the
    // previous detection
    assert_eq!(results[0].scheduled_at, config.lead_samples());
    for pair in results.windows(2) {
        assert!(pair[1].scheduled_at > pair[0].mark as u64 + config.lead_samples());
    }
}

#[test]
fn test_attenuated_and_noisy_loopback() {
    let mut sim = LoopbackSimulator::new(3000, 0.1, 0.002);
    let (_, results) = measure(&chirp_loop_config(), &mut sim, 88200);

    assert!(results.len() >= 3);
    for result in &results {
        assert!(
            (result.latency_samples - 3000).abs() <= 4,
            "measured {}",
            result.latency_samples
        );
    }
}

#[test]
fn test_default_tones_do_not_cross_talk() {
    let config = SessionConfig::default();
    let low = config.tones[0].frequency;
    let mut session = Session::new(&config).unwrap();
    let events = session.events();
    let mut sim = LoopbackSimulator::new(2048, 1.0, 0.0);

    session.start();
    sim.run_for(&mut session, 3 * 44100).unwrap();

    let mut low_detections = 0;
    let mut high_detections = 0;
    let mut measured = 0;
    for event in events.drain() {
        match event {
            SessionEvent::Detected(d) if d.frequency == low => low_detections += 1,
            SessionEvent::Detected(_) => high_detections += 1,
            SessionEvent::Measured(result) => {
                assert_eq!(result.frequency, TARGET);
                assert!((result.latency_samples - 2048).abs() <= 3);
                measured += 1;
            }
        }
    }

    // Only the looping tone is ever emitted
    assert_eq!(low_detections, 0);
    assert!(measured >= 10, "only {} measurements", measured);
    assert_eq!(high_detections, measured);
    assert_eq!(session.detector(0).unwrap().detections(), 0);
}

#[test]
fn test_lost_chirp_stays_outstanding() {
    let mut sim = LoopbackSimulator::new(2048, 0.0, 0.0);
    let (session, results) = measure(&chirp_loop_config(), &mut sim, 44100);

    assert!(results.is_empty());
    let scheduler = session.scheduler(0).unwrap();
    let chirp = scheduler.outstanding().unwrap();
    assert_eq!(chirp.start, 4410);
    assert!(!chirp.answered);
    assert!(scheduler.is_waiting(session.now()));
}

#[test]
fn test_manual_trigger_measured_once() {
    let config = SessionConfig {
        tones: vec![ToneConfig::new(TARGET)],
        ..Default::default()
    };
    let mut session = Session::new(&config).unwrap();
    let events = session.events();
    let mut sim = LoopbackSimulator::new(2048, 1.0, 0.0);

    session.start();
    session.trigger_tone(0).unwrap();
    sim.run_for(&mut session, 44100).unwrap();

    let results: Vec<LatencyResult> = events
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::Measured(result) => Some(result),
            SessionEvent::Detected(_) => None,
        })
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].scheduled_at, 0);
    assert!((results[0].latency_samples - 2048).abs() <= 3);

    // No loop: the answered chirp is not replaced
    let chirp = session.scheduler(0).unwrap().outstanding().unwrap();
    assert!(chirp.answered);
    assert_eq!(chirp.start, 0);
}

#[test]
fn test_other_sample_rate() {
    let config = SessionConfig {
        sample_rate: 48000,
        tones: vec![ToneConfig {
            chirp: true,
            ..ToneConfig::new(48000.0 / 2.3)
        }],
        ..Default::default()
    };
    let mut sim = LoopbackSimulator::new(4800, 1.0, 0.0);
    let (_, results) = measure(&config, &mut sim, 96000);

    assert!(!results.is_empty());
    for result in &results {
        assert!((result.latency_samples - 4800).abs() <= 3);
        assert!((result.latency_ms - 100.0).abs() < 0.1);
    }
}

#[test]
fn test_results_feed_statistics() {
    let mut sim = LoopbackSimulator::new(2048, 1.0, 0.0);
    let (_, results) = measure(&chirp_loop_config(), &mut sim, 88200);

    let mut stats = StatsStore::new();
    for result in &results {
        stats.record_latency(result);
    }

    let tone = stats.tone(TARGET).unwrap();
    assert_eq!(tone.measurements, results.len() as u64);
    let expected_ms = 2048.0 / 44100.0 * 1000.0;
    assert!((tone.min_ms - expected_ms).abs() < 0.1);
    assert!((tone.max_ms - expected_ms).abs() < 0.1);
    assert!((tone.avg_ms - expected_ms).abs() < 0.1);
    assert_eq!(stats.history().len(), results.len());
}
