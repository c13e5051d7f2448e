//! Diagnostic Reconstruction CLI
//!
//! Replays recorded K-Line and CAN traffic through the diag-reconstruct
//! library and prints every reconstructed datagram:
//! - candump-style CAN logs and timestamped K-Line byte logs as input
//! - recorded time drives the K-Line idle timeout
//! - text or JSON lines output, statistics summary at the end

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

mod config;
mod output;
mod replay;

use config::{AppConfig, OutputFormat};
use output::DatagramWriter;

/// Diagnostic Reconstruction - rebuild K-Line and CAN diagnostic datagrams
#[derive(Parser, Debug)]
#[command(name = "diag-reconstruct")]
#[command(about = "Rebuild ISO14230, KW1281, ISO15765 and VWTP20 datagrams from recorded bus traffic", long_about = None)]
#[command(version)]
struct Args {
    /// candump-style CAN log (can be repeated)
    #[arg(long, value_name = "FILE")]
    can: Vec<PathBuf>,

    /// K-Line byte log, `<ms> <hex bytes>` per line (can be repeated)
    #[arg(long, value_name = "FILE")]
    kline: Vec<PathBuf>,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output file for datagrams (default: stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// Additional ISO15765 CAN ID in hex (can be repeated)
    #[arg(long = "iso15765-id", value_name = "ID", value_parser = parse_can_id)]
    iso15765_ids: Vec<u32>,

    /// CAN ID in hex to ignore (can be repeated)
    #[arg(long = "ignore-id", value_name = "ID", value_parser = parse_can_id)]
    ignored_ids: Vec<u32>,

    /// K-Line idle timeout in milliseconds
    #[arg(long, value_name = "MS")]
    idle_timeout: Option<u64>,

    /// Maximum number of bytes and frames to replay (for testing)
    #[arg(long, value_name = "COUNT")]
    max_events: Option<usize>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn parse_can_id(text: &str) -> std::result::Result<u32, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid CAN ID {:?}: {}", text, e))
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("Diagnostic Reconstruction CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using reconstruction library v{}", diag_reconstruct::VERSION);

    let mut app = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };
    apply_overrides(&mut app, &args);
    app.reconstruct
        .validate()
        .context("Invalid reconstruction settings")?;

    if app.input.can_logs.is_empty() && app.input.kline_logs.is_empty() {
        println!("Diagnostic Reconstruction - No input specified");
        println!("\nQuick Start:");
        println!("  diag-reconstruct --can trace.log");
        println!("  diag-reconstruct --kline kline.log --format json");
        println!("\nWith a configuration file:");
        println!("  diag-reconstruct --config config.toml");
        println!("\nUse --help for more options");
        return Ok(());
    }

    let mut sources = Vec::new();
    for path in &app.input.can_logs {
        sources.push(replay::load_can_log(path)?);
    }
    for path in &app.input.kline_logs {
        sources.push(replay::load_kline_log(path)?);
    }
    let mut events = replay::merge(sources);
    if let Some(max) = args.max_events {
        events.truncate(max);
    }
    log::debug!("Replaying {} events", events.len());

    let mut writer = DatagramWriter::create(app.output.path.as_deref(), app.output.format)?;
    let stats = replay::run(&events, app.reconstruct, &mut writer)?;

    if !args.quiet {
        output::print_summary(&stats);
    }
    Ok(())
}

/// Command-line flags take precedence over the configuration file
fn apply_overrides(app: &mut AppConfig, args: &Args) {
    app.input.can_logs.extend(args.can.iter().cloned());
    app.input.kline_logs.extend(args.kline.iter().cloned());

    if let Some(format) = args.format {
        app.output.format = format;
    }
    if let Some(path) = &args.output {
        app.output.path = Some(path.clone());
    }

    let mut reconstruct = std::mem::take(&mut app.reconstruct);
    for id in &args.iso15765_ids {
        if !reconstruct.is_iso15765_id(*id) {
            reconstruct.iso15765_ids.push(*id);
        }
    }
    for id in &args.ignored_ids {
        reconstruct = reconstruct.add_ignored_id(*id);
    }
    if let Some(timeout) = args.idle_timeout {
        reconstruct = reconstruct.with_kline_idle_timeout_ms(timeout);
    }
    app.reconstruct = reconstruct;
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
