use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Dynamic observability configuration for the pods on a cluster node.
#[derive(Debug, Parser)]
#[command(name = "collectbeat", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Discover pods and drive metrics scraping
    Metricbeat(RunArgs),
    /// Discover pods and drive log collection
    Filebeat(RunArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the collectbeat configuration file
    #[arg(short = 'c', long = "config", default_value = "collectbeat.yml")]
    pub config: PathBuf,
}
