// Unit discovery example
//
// Lists the PicoScope units attached to this machine and shows which bench
// location each one belongs to.

use clap::Parser;
use picoscope_rs::{
    MockPicoDriver, PicoConnector, PicoDriver, Ps2000Library, SlotAssignment, UnitInfo,
    UnitLocationTable,
};

#[derive(Parser)]
#[command(name = "unit_discovery")]
#[command(version = "0.1")]
#[command(about = "Match attached PicoScope units to bench locations")]
struct Args {
    /// Extra or replacement locations as LOCATION=SERIAL
    #[arg(short, long = "location", value_parser = parse_location)]
    locations: Vec<(String, String)>,

    /// Path to the ps2000 driver library
    #[arg(long)]
    driver_path: Option<String>,

    /// Use the built-in mock driver instead of real hardware
    #[arg(long)]
    mock: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_location(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(location, serial)| (location.trim().to_string(), serial.trim().to_string()))
        .ok_or_else(|| format!("expected LOCATION=SERIAL, got {}", value))
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

    let mut table = UnitLocationTable::default();
    for (location, serial) in args.locations {
        table.insert(location, serial);
    }

    let driver: Box<dyn PicoDriver> = if args.mock {
        Box::new(MockPicoDriver::new(vec![
            UnitInfo::new("JY214/1608", "2204A"),
            UnitInfo::new("JY214/1781", "2204A"),
            UnitInfo::new("CP900/0007", "2205A"),
        ]))
    } else if let Some(path) = &args.driver_path {
        Box::new(Ps2000Library::load_from(path)?)
    } else {
        Box::new(Ps2000Library::load()?)
    };

    println!("PicoScope Unit Discovery");
    println!("========================\n");

    let report = PicoConnector::discover(&driver, &table)?;
    println!("Found {} unit(s)\n", report.units_found());

    for (location, assignment) in report.slots() {
        match assignment {
            SlotAssignment::Matched(unit) => {
                println!("✓ {:<14} {} ({})", location, unit.serial, unit.variant)
            }
            SlotAssignment::Unmatched { expected_serial } => {
                println!("✗ {:<14} not connected (expected {})", location, expected_serial)
            }
        }
    }

    if !report.unrecognized().is_empty() {
        println!("\nUnits with no location:");
        for unit in report.unrecognized() {
            println!("  {}", unit);
        }
    }

    Ok(())
}
