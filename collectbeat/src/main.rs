#[macro_use]
extern crate serde_derive;

mod beater;
mod cmd;

use clap::Parser;

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = cmd::Cli::parse();
    let result = match cli.command {
        cmd::Command::Metricbeat(args) => beater::metricbeat::run(&args).await,
        cmd::Command::Filebeat(args) => beater::filebeat::run(&args).await,
    };

    if let Err(error) = result {
        eprintln!("collectbeat: {:#}", error);
        std::process::exit(1);
    }
}
