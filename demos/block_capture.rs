// Block capture example
//
// Opens the unit at a bench location, captures one or more blocks on channels
// A and B and prints per-channel statistics. The last block can be saved as CSV.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use picoscope_rs::{
    Channel, MockPicoDriver, PicoConnector, PicoDriver, Ps2000Library, ScopeSettings, UnitInfo,
    UnitLocationTable, VoltageRange,
};

#[derive(Parser)]
#[command(name = "block_capture")]
#[command(version = "0.1")]
#[command(about = "Capture blocks from a PicoScope 2000-series unit")]
struct Args {
    /// Bench location of the unit to open
    #[arg(default_value = "left_bottom")]
    location: String,

    /// Input range for both channels (20MV ... 20V)
    #[arg(short, long, default_value = "2V")]
    range: VoltageRange,

    /// Timebase index; searched for automatically when omitted
    #[arg(short, long)]
    timebase: Option<u16>,

    /// Longest acceptable sample interval for the timebase search
    #[arg(long, default_value_t = 1000)]
    max_interval_ns: i32,

    /// Samples per block
    #[arg(short = 'n', long, default_value_t = 2000)]
    samples: u32,

    /// Number of blocks to capture
    #[arg(short, long, default_value_t = 1)]
    count: u32,

    /// Trigger channel
    #[arg(long, default_value = "a", value_parser = ["a", "b"])]
    trigger: String,

    /// Write the last block to this CSV file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seconds to wait for each block
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Use the built-in mock driver instead of real hardware
    #[arg(long)]
    mock: bool,

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

    let driver: Box<dyn PicoDriver> = if args.mock {
        Box::new(MockPicoDriver::new(vec![
            UnitInfo::new("JY214/1608", "2204A"),
            UnitInfo::new("JY214/1781", "2204A"),
        ]))
    } else {
        Box::new(Ps2000Library::load()?)
    };

    let settings = ScopeSettings::default()
        .with_range(args.range)
        .with_sample_count(args.samples)
        .with_ready_timeout(Duration::from_secs(args.timeout));

    println!("PicoScope Block Capture");
    println!("=======================\n");

    let mut scope = PicoConnector::connect(
        driver,
        &UnitLocationTable::default(),
        &args.location,
        settings,
    )?;
    println!("{}\n", scope);

    let timebase = match args.timebase {
        Some(timebase) => timebase,
        None => scope.find_optimal_timebase(args.max_interval_ns)?,
    };
    scope.set_timebase(timebase);

    let trigger_channel = if args.trigger == "b" { Channel::B } else { Channel::A };
    scope.setup_channels()?;
    scope.setup_simple_trigger(trigger_channel)?;

    let mut last = None;
    for block in 1..=args.count {
        let capture = scope.block_capture()?;
        scope.stop_capture()?;

        let [a, b] = capture.channel_statistics()?;
        println!(
            "Block {}: {} samples every {} ns",
            block,
            capture.len(),
            capture.timebase.time_interval_ns
        );
        println!(
            "  A: min {:>9.3} mV  max {:>9.3} mV  mean {:>9.3} mV{}",
            a.min_mv,
            a.max_mv,
            a.mean_mv,
            if capture.overflowed(Channel::A) { "  (over range)" } else { "" }
        );
        println!(
            "  B: min {:>9.3} mV  max {:>9.3} mV  mean {:>9.3} mV{}",
            b.min_mv,
            b.max_mv,
            b.mean_mv,
            if capture.overflowed(Channel::B) { "  (over range)" } else { "" }
        );
        last = Some(capture);
    }

    if let (Some(path), Some(capture)) = (&args.output, &last) {
        capture.write_csv(path)?;
        println!("\nSaved last block to {}", path.display());
    }

    if args.verbose {
        println!("\nDriver status codes:");
        for (label, result) in scope.status().iter() {
            println!("  {:<12} {}", label, result);
        }
    }

    scope.close()?;
    Ok(())
}
