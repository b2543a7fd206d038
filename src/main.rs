use bhive::input::parse_hex_tokens;
use bhive::{Harness, HarnessConfig, MetricsSink, TracingSink};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Measure the cycle cost of a basic block", long_about = None)]
struct Args {
    /// Block bytes in hex, e.g. `48 8b 03` or `488b03`
    #[arg(required = true)]
    hex: Vec<String>,

    /// Copies of the block laid out back to back
    #[arg(short, long, default_value_t = 100)]
    unroll: u32,

    /// Passes over the unrolled block
    #[arg(short, long)]
    iterations: Option<u64>,

    /// Counter to read, e.g. `cycles`, `instructions`, `r01c2`
    #[arg(short, long)]
    event: Option<String>,

    /// Faults serviced before giving up
    #[arg(long)]
    max_faults: Option<u32>,

    /// CPU to pin the subject to
    #[arg(long, conflicts_with = "no_pin")]
    cpu: Option<usize>,

    /// Do not pin the subject
    #[arg(long)]
    no_pin: bool,

    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<String>,

    /// Print the full measurement as JSON
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> bhive::Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_json_file(path)?,
        None => HarnessConfig::default(),
    };
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if let Some(event) = &args.event {
        config.event = event.clone();
    }
    if let Some(max_faults) = args.max_faults {
        config.max_faults = max_faults;
    }
    if args.no_pin {
        config.pin_to_core = None;
    } else if let Some(cpu) = args.cpu {
        config.pin_to_core = Some(cpu);
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args) -> bhive::Result<()> {
    let config = load_config(args)?;
    let block = parse_hex_tokens(&args.hex)?;
    info!(
        "Measuring {} byte block x{} over {} iterations ({})",
        block.len(),
        args.unroll,
        config.iterations,
        config.event
    );

    let harness = Harness::new(config)?.with_sink(Arc::new(MetricsSink::new(TracingSink)));
    let measurement = harness.measure(&block, args.unroll)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&measurement)?);
    } else {
        println!("{}", measurement.cycles);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("bhive: {}", e);
            ExitCode::FAILURE
        }
    }
}
