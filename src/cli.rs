//! CLI argument definitions for the service binary.

use std::path::PathBuf;

use clap::Parser;

/// Mirror streaming-service libraries into local audio via Soulseek.
#[derive(Debug, Parser)]
#[command(name = "soulspot", version, about)]
pub struct Args {
    /// Path to the SQLite database file.
    #[arg(long, default_value = "soulspot.db")]
    pub database: PathBuf,

    /// Address the HTTP API binds to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// slskd base URL; seeds the settings store when provided.
    #[arg(long)]
    pub slskd_url: Option<String>,

    /// slskd API key; seeds the settings store when provided.
    #[arg(long)]
    pub slskd_api_key: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long)]
    pub quiet: bool,
}
