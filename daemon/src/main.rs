use clap::{Parser, Subcommand};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

use mdn_daemon::serve::{serve, ServeCommand};

#[derive(Parser, Debug)]
#[command(name = "meridiand", about = "Meridian local VM daemon")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the management API until SIGINT or SIGTERM.
    Serve(ServeCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    event!(Level::INFO, "Meridian daemon, Hello World!");

    let args = Args::parse();
    match args.command {
        Command::Serve(serve_command) => serve(serve_command).await,
    }
}
