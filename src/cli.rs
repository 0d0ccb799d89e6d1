//! Command-line interface for voxbridge
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Audio core for a local voice assistant
#[derive(Parser, Debug)]
#[command(name = "voxbridge", version, about = "Audio core for a local voice assistant")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List audio input and output devices
    Devices,

    /// Print the speech segments found in a WAV file
    Segment {
        /// 16-bit PCM WAV file (any rate, any channel count)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Print segments as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Capture from the microphone and print segments until Ctrl-C
    Listen {
        /// Input device name or index (overrides config)
        #[arg(long, value_name = "DEVICE")]
        input: Option<String>,

        /// Output device name or index (overrides config)
        #[arg(long, value_name = "DEVICE")]
        output: Option<String>,

        /// Run without the barge-in detector
        #[arg(long)]
        no_barge_in: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

/// Log filter directive for the given verbosity flags.
///
/// `RUST_LOG` still wins when set; this is only the fallback.
pub fn log_filter(quiet: bool, verbose: u8) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "voxbridge=info,warn",
        1 => "voxbridge=debug,info",
        _ => "voxbridge=trace,debug",
    }
}
