//! Main application entry point.
//!
//! This module handles:
//! * Command line argument parsing
//! * Logging configuration
//! * Building the player settings
//! * Running the play queue to completion
//!
//! # Runtime Behavior
//!
//! The application:
//! 1. Parses arguments and initialises logging
//! 2. Queues every input target (file paths and `http(s)://` URLs)
//! 3. Plays the queue through the media pipeline
//! 4. Exits 0 on clean shutdown, 1 on fatal pipeline failure

use std::{process, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};

use minim::{
    config::{CrcMode, Settings},
    error::Result,
    player::Player,
};

/// Build profile indicator for logging.
///
/// Shows "debug" when built without optimizations.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";

/// Build profile indicator for logging.
///
/// Shows "release" when built with optimizations.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
///
/// Used by clap to ensure -q (quiet) and -v (verbose) flags
/// cannot be used together.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
///
/// All options can be set via environment variables with the `MINIM_`
/// prefix.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files or http(s) URLs to play, in order
    #[arg(required = true, value_name = "TARGET", value_hint = ValueHint::AnyPath)]
    inputs: Vec<String>,

    /// Checksum validation policy: disabled, enabled or strict
    ///
    /// Applies to FLAC frame CRCs and Ogg page CRCs. In enabled mode,
    /// mismatches are counted and checking auto-disables past a
    /// threshold; strict mode rejects mismatched units.
    #[arg(long, default_value_t = CrcMode::Enabled, env = "MINIM_CRC_MODE")]
    crc_mode: CrcMode,

    /// Cap on pooled demuxer buffers, in mebibytes
    #[arg(long, default_value_t = 32, value_parser = clap::value_parser!(u32).range(1..=1024), env = "MINIM_POOL_CAP")]
    pool_cap: u32,

    /// Decoded audio held between decode and playback, in samples
    #[arg(long, default_value_t = 48_000, value_parser = clap::value_parser!(u32).range(1024..), env = "MINIM_RING_CAPACITY")]
    ring_capacity: u32,

    /// Timeout for HTTP range reads, in seconds
    #[arg(long, default_value_t = 10, env = "MINIM_HTTP_TIMEOUT")]
    http_timeout: u64,

    /// Suppress all output except warnings and errors
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING, env = "MINIM_QUIET")]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Use -v for debug logging
    /// Use -vv for trace logging
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING, env = "MINIM_VERBOSE")]
    verbose: u8,
}

/// Initialize logging system.
///
/// Configures logging based on command line arguments and environment:
/// * `-q` sets Warning level
/// * `-v` sets Debug level
/// * `-vv` sets Trace level
/// * `RUST_LOG` environment variable provides defaults
/// * External crates are limited to Error level unless tracing
///
/// # Panics
///
/// Panics if logger is already initialized.
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let mut external_level = LevelFilter::Error;
    if args.quiet || args.verbose > 0 {
        let level = match args.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose`
                // is 0 by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::max(),
        };

        logger.filter_module("minim", level);

        if level == LevelFilter::Trace {
            external_level = LevelFilter::max();
        }
    }

    // Filter log messages of external crates.
    for external_module in ["lewton", "minimp3", "opus", "reqwest", "rodio", "cpal"] {
        logger.filter_module(external_module, external_level);
    }

    logger.init();
}

/// Builds the player and plays the queue.
fn run(args: Args) -> Result<()> {
    let settings = Settings {
        pool_cap_bytes: args.pool_cap as usize * 1024 * 1024,
        ring_capacity: args.ring_capacity as usize,
        crc_mode: args.crc_mode,
        http_timeout: Duration::from_secs(args.http_timeout),
    };

    let mut player = Player::new(settings)?;
    for input in &args.inputs {
        player.enqueue(input)?;
    }
    player.run()
}

/// Application entry point.
///
/// Exits with:
/// - 0 for clean shutdown
/// - 1 if an error occurs
fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {args:#?}");

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();
    info!("starting {name}/{version}; {BUILD_PROFILE}");

    match run(args) {
        Ok(()) => {
            info!("shut down gracefully");
            process::exit(0);
        }
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    }
}
