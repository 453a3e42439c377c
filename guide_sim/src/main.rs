//! # Guide Simulator Binary
//!
//! # Usage
//!
//! ```bash
//! # Calibrate and print the result
//! guide_sim --config guide_sim/config/sim.toml calibrate
//!
//! # Measure Dec backlash and install the result as the compensation pulse
//! guide_sim measure-backlash --apply
//!
//! # Guide for 200 frames, JSON logs
//! guide_sim --json guide --frames 200
//! ```
//!
//! `measure-backlash` and `guide` calibrate first when the profile holds no
//! calibration.

#![deny(warnings)]

use clap::{Parser, Subcommand};
use guide_common::config::{ConfigLoader, LogLevel};
use guide_sim::{Session, SimConfig};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// Guide Simulator - calibration, backlash measurement and guiding on a simulated mount
#[derive(Parser, Debug)]
#[command(name = "guide_sim")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Run guiding sessions against a simulated mount")]
#[command(long_about = None)]
struct Args {
    /// Path to the simulator configuration file
    #[arg(short, long, default_value = "guide_sim/config/sim.toml")]
    config: PathBuf,

    /// Enable verbose logging (overrides shared.log_level)
    #[arg(short, long)]
    verbose: bool,

    /// Output logs and reports in JSON format
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate the mount on the current star
    Calibrate,

    /// Measure Dec backlash
    MeasureBacklash {
        /// Install a valid result as the compensation pulse
        #[arg(long)]
        apply: bool,
    },

    /// Guide on the current star
    Guide {
        /// Number of frames to guide
        #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..))]
        frames: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("guide_sim failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Tracing comes up before a config error is returned so it gets logged.
    let config = SimConfig::load(&args.config);
    let log_level = config.as_ref().map(|c| c.shared.log_level).unwrap_or_default();
    setup_tracing(&args, log_level);
    let config = config?;

    info!("Guide Simulator v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(config = %args.config.display(), service = %config.shared.service_name, "configuration loaded");

    let mut session = Session::new(config)?;
    match args.command {
        Command::Calibrate => {
            let report = session.calibrate()?;
            print_report(&args, "calibration", &report)?;
        }
        Command::MeasureBacklash { apply } => {
            ensure_calibrated(&args, &mut session)?;
            let report = session.measure_backlash(apply)?;
            print_report(&args, "backlash measurement", &report)?;
        }
        Command::Guide { frames } => {
            ensure_calibrated(&args, &mut session)?;
            let report = session.guide(frames)?;
            print_report(&args, "guiding", &report)?;
        }
    }

    info!(
        steps = session.sink().steps(),
        alerts = session.sink().alerts(),
        pulses = session.sim().pulse_count(),
        "Guide Simulator done"
    );
    Ok(())
}

fn ensure_calibrated(args: &Args, session: &mut Session) -> Result<(), Box<dyn std::error::Error>> {
    if session.mount().is_calibrated() {
        return Ok(());
    }
    info!("no stored calibration, calibrating first");
    let report = session.calibrate()?;
    print_report(args, "calibration", &report)?;
    Ok(())
}

/// Print a report as one JSON line, or log it field by field.
fn print_report<T: Serialize>(args: &Args, name: &str, report: &T) -> Result<(), Box<dyn std::error::Error>> {
    if args.json {
        println!("{}", serde_json::to_string(report)?);
    } else {
        info!("{name} report:\n{}", serde_json::to_string_pretty(report)?);
    }
    Ok(())
}

/// Log level from `--verbose` or the configured level.
fn tracing_level(verbose: bool, log_level: LogLevel) -> Level {
    if verbose {
        return Level::DEBUG;
    }
    log_level.as_directive().parse().unwrap_or(Level::INFO)
}

/// Setup tracing subscriber from the CLI flags and the configured level.
fn setup_tracing(args: &Args, log_level: LogLevel) {
    let level = tracing_level(args.verbose, log_level);
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_drives_filter() {
        assert_eq!(tracing_level(false, LogLevel::Trace), Level::TRACE);
        assert_eq!(tracing_level(false, LogLevel::Debug), Level::DEBUG);
        assert_eq!(tracing_level(false, LogLevel::Info), Level::INFO);
        assert_eq!(tracing_level(false, LogLevel::Warn), Level::WARN);
        assert_eq!(tracing_level(false, LogLevel::Error), Level::ERROR);
    }

    #[test]
    fn verbose_overrides_quieter_config() {
        assert_eq!(tracing_level(true, LogLevel::Error), Level::DEBUG);
    }
}
