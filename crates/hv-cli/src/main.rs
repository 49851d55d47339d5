mod commands;
mod opts;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::checkout::CheckoutArgs;
use commands::create::CreateArgs;
use commands::query::ActorArgs;
use commands::send::SendArgs;
use opts::NodeOpts;

#[derive(Parser, Debug)]
#[command(name = "hv", version, about = "Actor hypervisor CLI")]
struct Cli {
    #[command(flatten)]
    opts: NodeOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an actor, optionally calling it
    Create(CreateArgs),

    /// Send a message to an actor
    Send(SendArgs),

    /// Commit and print the current state root
    Root,

    /// Move HEAD to a previously committed root
    Checkout(CheckoutArgs),

    /// Show an actor's child-creation nonce
    Nonce(ActorArgs),

    /// Show an actor's storage slots (hex)
    Storage(ActorArgs),

    /// Show an actor's code
    Code(ActorArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();
    let opts = &cli.opts;

    match cli.command {
        Command::Create(args) => commands::create::cmd_create(opts, &args).await,
        Command::Send(args) => commands::send::cmd_send(opts, &args).await,
        Command::Root => commands::root::cmd_root(opts).await,
        Command::Checkout(args) => commands::checkout::cmd_checkout(opts, &args).await,
        Command::Nonce(args) => commands::query::cmd_nonce(opts, &args).await,
        Command::Storage(args) => commands::query::cmd_storage(opts, &args).await,
        Command::Code(args) => commands::query::cmd_code(opts, &args).await,
    }
}

/// Logs go to stderr; `HV_LOG` takes an env-filter directive (default `warn`).
fn setup_logging() {
    let filter = EnvFilter::try_from_env("HV_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
