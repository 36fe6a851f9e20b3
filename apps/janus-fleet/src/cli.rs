use std::path::PathBuf;

use clap::Parser;

/// Control-plane gateway for a pool of Janus videoroom instances.
#[derive(Parser, Debug)]
#[command(name = "janus-fleet", version, about)]
pub struct Cli {
    /// Path to the gateway TOML configuration.
    #[arg(short, long, default_value = "fleet.toml")]
    pub config: PathBuf,

    /// Override the listen port from the config file.
    #[arg(short, long)]
    pub port: Option<u16>,
}
