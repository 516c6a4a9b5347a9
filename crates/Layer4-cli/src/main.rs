//! dockhand CLI - Main entry point

mod cli;

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// dockhand - run Ansible in pooled containers with a per-node ssh-agent
#[derive(Parser, Debug)]
#[command(name = "dockhand")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Run against an in-memory simulated host instead of docker
    #[arg(long, global = true)]
    simulate: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a playbook against a target environment
    Run(cli::RunArgs),

    /// Reconcile leftover containers and ssh-agents on a node
    Discover {
        /// Node name
        #[arg(short, long, default_value = "local")]
        node: String,
    },

    /// List configured target environments
    Environments,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let output = cli::Output { json: args.json };
    let result = match args.command {
        Command::Run(run) => cli::run(run, args.simulate, output).await,
        Command::Discover { node } => cli::discover(&node, args.simulate, output)
            .await
            .map(|_| ExitCode::SUCCESS),
        Command::Environments => cli::list_environments(output).map(|_| ExitCode::SUCCESS),
    };
    result.or_else(cli::report)
}
