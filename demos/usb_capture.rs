// Capture from a SucreLA over USB
//
// This example finds the analyzer on USB, prints its profile, captures a
// bounded frame and writes a short summary of every channel.

use clap::Parser;
use std::time::{Duration, Instant};
use sucrela_rs::{AcquisitionConfig, CaptureSink, RegisterMap, Sucrela};

#[derive(Parser)]
#[command(name = "usb_capture")]
#[command(version = "1.0")]
#[command(about = "Capture samples from a SucreLA over USB")]
struct Args {
    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 16_000_000)]
    samplerate: u64,

    /// Number of samples to capture, 0 to capture until the timeout
    #[arg(short, long, default_value_t = 1_000_000)]
    limit: u64,

    /// Give up after this many milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout: u64,

    /// Use the register map of gateware without capability registers
    #[arg(long)]
    v1: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let map = if args.v1 { RegisterMap::v1() } else { RegisterMap::v2() };
    let (sucrela, stream) = Sucrela::connect_usb(map)?;
    let profile = sucrela.profile();
    println!("Connected to {}", profile.identifier);
    println!("  native rate:  {} Hz", profile.native_samplerate);
    println!("  probes:       {}", profile.probe_count);
    println!("  oversampling: x{}", profile.oversampler_phy_ratio);
    println!("  frame counter: {:?}", profile.frame_counter);

    let config = AcquisitionConfig::new(args.samplerate).limit_samples(args.limit);
    let channels = config.plan(sucrela.profile())?.channels;
    let acquisition = sucrela
        .start_acquisition(&config, stream, CaptureSink::new())
        .map_err(|(_, e)| e)?;

    let deadline = Instant::now() + Duration::from_millis(args.timeout);
    while !acquisition.is_finished() && Instant::now() < deadline {
        acquisition.poll_events(Duration::from_millis(10));
    }
    if !acquisition.is_finished() {
        println!("Timeout reached, stopping");
        acquisition.request_stop();
    }

    let start = Instant::now();
    let finished = acquisition.wait()?;
    println!("Stopped in {:?}", start.elapsed());
    println!("Samples sent: {}", finished.report.samples_sent);
    println!("Counter gaps: {}", finished.report.counter_gaps);
    if let Some(e) = &finished.report.disable_error {
        println!("Stop error: {}", e);
    }

    for frame in finished.sink.frames() {
        let df = frame.to_dataframe(args.samplerate, channels)?;
        for bit in 0..channels {
            let high = df
                .column(&format!("bit_{}", bit))?
                .bool()?
                .into_no_null_iter()
                .filter(|b| *b)
                .count();
            println!("  bit_{:<2} high in {} of {} samples", bit, high, df.height());
        }
    }

    Ok(())
}
