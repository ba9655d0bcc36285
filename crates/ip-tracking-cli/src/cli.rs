//! Command-line argument parsing with clap.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// ip-tracking - request tracking and abuse mitigation administration.
#[derive(Parser, Debug, Clone)]
#[command(name = "ip-tracking")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory holding the request log, deny-list and flags.
    #[arg(short, long, env = "IP_TRACKING_DATA_DIR", default_value = "./ip-tracking-data")]
    pub data_dir: PathBuf,

    /// JSON configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "IP_TRACKING_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Add an address to the deny-list.
    Block {
        /// Address to block.
        #[arg(value_parser = parse_ip)]
        address: IpAddr,
    },

    /// Remove an address from the deny-list.
    Unblock {
        /// Address to unblock.
        #[arg(value_parser = parse_ip)]
        address: IpAddr,
    },

    /// List deny-listed addresses.
    Blocked,

    /// Run one anomaly scan over the configured window.
    Scan,

    /// Run the anomaly scanner periodically until interrupted.
    Watch {
        /// Seconds between scans. Overrides the configured period.
        #[arg(short, long)]
        period_secs: Option<u64>,
    },

    /// List flagged addresses.
    Flags {
        /// Only flags for this address.
        #[arg(short, long, value_parser = parse_ip)]
        address: Option<IpAddr>,
    },

    /// Show recorded requests.
    Requests(RequestsArgs),
}

/// Arguments for the requests command.
#[derive(Parser, Debug, Clone)]
pub struct RequestsArgs {
    /// Only requests from this address.
    #[arg(short, long, value_parser = parse_ip)]
    pub address: Option<IpAddr>,

    /// Only requests from the last N minutes.
    #[arg(short, long, default_value_t = 60)]
    pub since_minutes: u32,

    /// Show at most this many requests (most recent).
    #[arg(short, long, default_value_t = 50)]
    pub limit: usize,
}

fn parse_ip(raw: &str) -> Result<IpAddr, String> {
    ip_tracking::admin::parse_address(raw).map_err(|e| e.to_string())
}
