use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

use meridian_rs::config::load_config;
use meridian_rs::machine::Machine;
use mdn_backend::sshkey::SshKeyMgr;
use mdn_backend::{select_driver, BaseDriver};
use mdn_hostagent::HostAgent;

#[derive(Parser, Debug)]
#[command(name = "meridian-vm", about = "Meridian per-machine host agent")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot a machine and serve its sandbox socket until it stops.
    Start(StartArgs),
}

#[derive(clap::Args, Debug)]
struct StartArgs {
    /// Machine name, must match the record.
    name: String,

    /// Path to the machine's `machine.json`.
    #[arg(short = 'c', long = "machine")]
    machine: PathBuf,

    /// Path to the TOML configuration file
    #[arg(long, env = "MERIDIAN_CONFIG")]
    config: Option<PathBuf>,
}

async fn start(args: StartArgs) -> Result<()> {
    let config = load_config(args.config.as_deref()).context("load configuration")?;

    let record = tokio::fs::canonicalize(&args.machine)
        .await
        .with_context(|| format!("resolve machine record {:?}", args.machine))?;
    let contents = tokio::fs::read(&record)
        .await
        .with_context(|| format!("read machine record {record:?}"))?;
    let machine: Machine = serde_json::from_slice(&contents)
        .with_context(|| format!("parse machine record {record:?}"))?;
    if machine.name != args.name {
        bail!(
            "machine record {record:?} describes {:?}, not {:?}",
            machine.name,
            args.name
        );
    }

    // <vms_root>/<name>/machine.json
    let vms_root = record
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.daemon.vms_dir());

    let driver = select_driver(BaseDriver::new(machine, &vms_root, &config));
    let keys = SshKeyMgr::new(&config.daemon.config_dir());
    Arc::new(HostAgent::new(driver, keys)).run().await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Command::Start(start_args) => {
            event!(Level::INFO, name = %start_args.name, "Meridian host agent, Hello World!");
            start(start_args).await
        }
    }
}
