// Capture from the simulated analyzer
//
// This example runs a complete acquisition against the in-process simulator:
// register programming, transfer pool, software trigger and frame output.

use clap::Parser;
use sucrela_rs::{
    AcquisitionConfig, AddressWidth, CaptureSink, ChannelCondition, CounterWidth, SimulatedDevice,
    StreamFault, Sucrela, TriggerSpec,
};

#[derive(Parser)]
#[command(name = "simulated_capture")]
#[command(version = "1.0")]
#[command(about = "Capture samples from a simulated SucreLA")]
struct Args {
    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    samplerate: u64,

    /// Number of samples to capture
    #[arg(short, long, default_value_t = 1024, value_parser = clap::value_parser!(u64).range(1..))]
    limit: u64,

    /// Trigger stages, e.g. "0=1,1=0->2=r" (conditions 0, 1, r, f)
    #[arg(short, long)]
    trigger: Option<String>,

    /// Share of the capture taken before the trigger point
    #[arg(long, default_value_t = 0)]
    pre_trigger: u8,

    /// Number of probes the simulated gateware is built with
    #[arg(long, default_value_t = 8)]
    probes: u32,

    /// Drop one packet to show frame counter checking
    #[arg(long)]
    drop_packet: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_trigger(text: &str, pre_trigger: u8) -> Result<TriggerSpec, String> {
    let mut builder = TriggerSpec::start_capturing_when().pre_trigger_percent(pre_trigger);
    for (i, stage) in text.split("->").enumerate() {
        if i > 0 {
            builder = builder.then();
        }
        for condition in stage.split(',') {
            let (channel, value) = condition
                .trim()
                .split_once('=')
                .ok_or_else(|| format!("Invalid condition: {}", condition))?;
            let channel: usize = channel
                .parse()
                .map_err(|_| format!("Invalid channel: {}", channel))?;
            let condition = match value {
                "0" => ChannelCondition::Zero,
                "1" => ChannelCondition::One,
                "r" => ChannelCondition::Rising,
                "f" => ChannelCondition::Falling,
                other => return Err(format!("Invalid channel condition: {}", other)),
            };
            builder = builder.channel(channel, condition);
        }
    }
    Ok(builder.build())
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

    println!("SucreLA Simulated Capture");
    println!("=========================\n");

    let device = SimulatedDevice::builder()
        .probe_count(args.probes)
        .oversampler_phy_ratio(4)
        .frame_counter(Some(CounterWidth::Two))
        .build();
    if args.drop_packet {
        device.stream().inject(StreamFault::DropPacket);
    }

    let sucrela = Sucrela::open(device.register_port(), device.register_map(), AddressWidth::Four)?;
    println!("Connected to {}", sucrela.identifier());
    println!("Supported sample rates: {:?}\n", sucrela.supported_samplerates());

    let mut config = AcquisitionConfig::new(args.samplerate).limit_samples(args.limit);
    if let Some(trigger) = &args.trigger {
        let trigger = parse_trigger(trigger, args.pre_trigger)?;
        println!("Trigger: {}", trigger);
        config = config.trigger(trigger);
    }

    let channels = config.plan(sucrela.profile())?.channels;
    let acquisition = sucrela
        .start_acquisition(&config, device.stream(), CaptureSink::new())
        .map_err(|(_, e)| e)?;
    let finished = acquisition.wait()?;

    println!("Frames:          {}", finished.report.frames);
    println!("Samples sent:    {}", finished.report.samples_sent);
    println!("Counter gaps:    {}", finished.report.counter_gaps);
    if let Some(e) = &finished.report.disable_error {
        println!("Stop error:      {}", e);
    }

    for (i, frame) in finished.sink.frames().iter().enumerate() {
        let df = frame.to_dataframe(args.samplerate, channels)?;
        println!("\nFrame {}: {} samples", i, frame.num_samples());
        println!("{}", df.head(Some(8)));
    }

    Ok(())
}
