//! Tonetimer - tone detection and round-trip latency measurement
//!
//! Runs the chirp loop either against a simulated acoustic loopback or, with
//! the `device` feature, against a real audio interface.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tonetimer::audio::session::{Session, SessionEvent};
use tonetimer::audio::simulator::LoopbackSimulator;
use tonetimer::config::SessionConfig;
use tonetimer::stats::store::StatsStore;
use tracing::{info, warn};

/// Parsed command line
#[derive(Debug)]
struct Options {
    config: Option<PathBuf>,
    write_config: Option<PathBuf>,
    simulate: bool,
    delay: usize,
    noise: f32,
    gain: f32,
    seconds: Option<f64>,
    device: Option<String>,
    trigger: Option<usize>,
    json: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: None,
            write_config: None,
            simulate: false,
            delay: 2048,
            noise: 0.001,
            gain: 1.0,
            seconds: None,
            device: None,
            trigger: None,
            json: false,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tonetimer=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut options = Options::default();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--list" | "-l" => {
                list_devices()?;
                return Ok(());
            }
            "--version" | "-v" => {
                println!("tonetimer {}", tonetimer::VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--simulate" | "-s" => options.simulate = true,
            "--json" => options.json = true,
            "--config" | "-c" => options.config = Some(PathBuf::from(value(&args, i)?)),
            "--write-config" => options.write_config = Some(PathBuf::from(value(&args, i)?)),
            "--device" | "-d" => options.device = Some(value(&args, i)?.to_string()),
            "--delay" => options.delay = parse_value(&args, i)?,
            "--noise" => options.noise = parse_value(&args, i)?,
            "--gain" => options.gain = parse_value(&args, i)?,
            "--seconds" => options.seconds = Some(parse_value(&args, i)?),
            "--trigger" => options.trigger = Some(parse_value(&args, i)?),
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(());
            }
        }
        i += if takes_value(&args[i]) { 2 } else { 1 };
    }

    let config = match &options.config {
        Some(path) => SessionConfig::load_or_default(path),
        None => SessionConfig::default(),
    };

    if let Some(path) = &options.write_config {
        config.save(path)?;
        println!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    println!("Tonetimer v{}", tonetimer::VERSION);
    for (index, tone) in config.tones.iter().enumerate() {
        println!(
            "  [{}] {:.1} Hz{}",
            index,
            tone.frequency,
            if tone.chirp { " (chirp loop)" } else { "" }
        );
    }
    println!();

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    let stats = if options.simulate || (options.device.is_none() && !cfg!(feature = "device")) {
        run_simulation(&config, &options, &running)?
    } else {
        run_device(&config, &options, &running)?
    };

    print_summary(&stats, options.json)
}

fn takes_value(flag: &str) -> bool {
    matches!(
        flag,
        "--config"
            | "-c"
            | "--write-config"
            | "--device"
            | "-d"
            | "--delay"
            | "--noise"
            | "--gain"
            | "--seconds"
            | "--trigger"
    )
}

fn value(args: &[String], i: usize) -> Result<&str> {
    match args.get(i + 1) {
        Some(v) => Ok(v.as_str()),
        None => bail!("{} requires a value", args[i]),
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize) -> Result<T> {
    let raw = value(args, i)?;
    match raw.parse() {
        Ok(v) => Ok(v),
        Err(_) => bail!("Invalid value for {}: {}", args[i], raw),
    }
}

fn print_help() {
    println!("Usage: tonetimer [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config PATH       Load settings from a JSON file");
    println!("      --write-config PATH Write the effective settings and exit");
    println!("  -s, --simulate          Run against a simulated loopback");
    println!("      --delay N           Simulated loopback delay in samples (default: 2048)");
    println!("      --noise A           Simulated noise amplitude (default: 0.001)");
    println!("      --gain G            Simulated loopback gain (default: 1.0)");
    println!("      --seconds S         Stop after S seconds of audio");
    println!("      --trigger N         Emit tone N once at startup");
    println!("  -l, --list              List audio devices");
    println!("  -d, --device NAME       Use the named audio device");
    println!("      --json              Print the final statistics as JSON");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Set RUST_LOG=tonetimer=debug for detailed logs.");
}

/// Print one event and add it to the statistics
fn report(event: &SessionEvent, stats: &mut StatsStore) {
    match event {
        SessionEvent::Detected(detection) => {
            println!(
                "Saw {:.1} Hz at sample {} (peak {:.4}, run {})",
                detection.frequency, detection.mark, detection.peak_magnitude, detection.run_length
            );
            stats.record_detection(detection);
        }
        SessionEvent::Measured(result) => {
            println!(
                "Latency {:.1} Hz: {} samples ({:.2} ms)",
                result.frequency, result.latency_samples, result.latency_ms
            );
            stats.record_latency(result);
        }
    }
}

fn run_simulation(
    config: &SessionConfig,
    options: &Options,
    running: &AtomicBool,
) -> Result<StatsStore> {
    if options.delay < config.block_size {
        warn!(
            delay = options.delay,
            block_size = config.block_size,
            "delay shorter than one block is not reproduced exactly"
        );
    }

    let mut session = Session::new(config)?;
    let events = session.events();
    let mut simulator = LoopbackSimulator::new(options.delay, options.gain, options.noise);
    let mut stats = StatsStore::new();

    info!(
        delay = options.delay,
        gain = options.gain,
        noise = options.noise,
        "simulation_started"
    );
    session.start();
    if let Some(index) = options.trigger {
        session.trigger_tone(index)?;
    }

    let seconds = options.seconds.unwrap_or(10.0);
    let total = (seconds * config.sample_rate as f64).round() as u64;
    let mut missed_at: Vec<Option<u64>> = vec![None; session.tone_count()];

    while running.load(Ordering::SeqCst) && session.now() < total {
        simulator.run_block(&mut session, config.block_size)?;
        for event in events.drain() {
            report(&event, &mut stats);
        }
        check_missed(&session, &mut missed_at, &mut stats);
    }

    if session.dropped_events() > 0 {
        warn!(dropped = session.dropped_events(), "events dropped");
    }
    info!(samples = session.now(), "simulation_finished");
    Ok(stats)
}

/// Count a chirp as missed once it has been silent for a full second
fn check_missed(session: &Session, missed_at: &mut [Option<u64>], stats: &mut StatsStore) {
    let now = session.now();
    let patience = session.sample_rate() as u64;

    for (index, last) in missed_at.iter_mut().enumerate() {
        let Some(scheduler) = session.scheduler(index) else {
            continue;
        };
        let Some(chirp) = scheduler.outstanding() else {
            continue;
        };
        let end = chirp.start + scheduler.waveform().len() as u64;
        if scheduler.is_waiting(now) && now > end + patience && *last != Some(chirp.start) {
            *last = Some(chirp.start);
            warn!(
                frequency = %format!("{:.1}", scheduler.frequency()),
                start = chirp.start,
                "chirp_missed"
            );
            stats.record_missed(scheduler.frequency());
        }
    }
}

#[cfg(feature = "device")]
fn run_device(
    config: &SessionConfig,
    options: &Options,
    running: &AtomicBool,
) -> Result<StatsStore> {
    use std::time::{Duration, Instant};
    use tonetimer::audio::engine::AudioEngine;

    let mut engine = AudioEngine::new(config.clone());
    match &options.device {
        Some(name) => engine.select_device(name)?,
        None => engine.select_default_device()?,
    }
    engine.start()?;
    if let Some(index) = options.trigger {
        engine.trigger_tone(index)?;
    }
    println!("Measuring. Press Ctrl+C to stop.");

    let mut stats = StatsStore::new();
    let deadline = options
        .seconds
        .map(|s| Instant::now() + Duration::from_secs_f64(s));

    while running.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        for event in engine.drain_events() {
            report(&event, &mut stats);
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    engine.stop();
    Ok(stats)
}

#[cfg(not(feature = "device"))]
fn run_device(
    _config: &SessionConfig,
    _options: &Options,
    _running: &AtomicBool,
) -> Result<StatsStore> {
    bail!("built without the `device` feature; use --simulate")
}

#[cfg(feature = "device")]
fn list_devices() -> Result<()> {
    use tonetimer::audio::engine::AudioEngine;

    let devices = AudioEngine::list_devices()?;
    println!("Found {} device(s):", devices.len());
    for (i, device) in devices.iter().enumerate() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}. {}{}", i + 1, device.name, default_marker);
        println!(
            "     Channels: {} in, {} out",
            device.input_channels, device.output_channels
        );
        if !device.sample_rates.is_empty() {
            println!("     Sample rates: {:?}", device.sample_rates);
        }
    }
    Ok(())
}

#[cfg(not(feature = "device"))]
fn list_devices() -> Result<()> {
    bail!("built without the `device` feature")
}

fn print_summary(stats: &StatsStore, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats.stats())?);
        return Ok(());
    }

    println!();
    println!("Summary:");
    println!("────────────────────────────────────────");
    if stats.stats().is_empty() {
        println!("  No detections.");
    }
    for tone in stats.stats() {
        if tone.measurements == 0 {
            println!(
                "  {:.1} Hz: {} detections, no latency measurements",
                tone.frequency, tone.detections
            );
        } else {
            println!(
                "  {:.1} Hz: {} measurements, min {:.2} ms, avg {:.2} ms, max {:.2} ms, missed {}",
                tone.frequency,
                tone.measurements,
                tone.min_ms,
                tone.avg_ms,
                tone.max_ms,
                tone.missed
            );
        }
    }
    Ok(())
}
