use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use ghost_comm::config::CoordinatorConfig;
use ghost_comm::logging;
use ghost_comm::{ChainClient, CommError, LockCycleCoordinator};

#[derive(Parser)]
#[command(name = "ghost-comm", version, about = "Rotating multi-hop proxy chain", propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lock cycle coordinator until Ctrl-C.
    Coordinator {
        /// TOML configuration file. Defaults apply when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Start a coordinator in process and push one message through its chain.
    Demo {
        #[arg(long, default_value_t = 3)]
        hops: usize,

        #[arg(long, default_value = "Hello Ghost-Comm!")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Coordinator { config } => run_coordinator(config).await,
        Commands::Demo { hops, message } => run_demo(hops, message).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "exiting");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_coordinator(path: Option<PathBuf>) -> Result<(), CommError> {
    let config = match path {
        Some(path) => CoordinatorConfig::load(&path)?,
        None => CoordinatorConfig::default(),
    };
    logging::init(&config.logging);

    let coordinator = LockCycleCoordinator::new(config);
    coordinator.start().await?;
    info!(address = %coordinator.address().await, "serving get_payload");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    coordinator.stop().await;
    Ok(())
}

async fn run_demo(hops: usize, message: String) -> Result<(), CommError> {
    let config = CoordinatorConfig {
        listen: ([127, 0, 0, 1], 0).into(),
        cohort_size: hops,
        ..CoordinatorConfig::default()
    };
    config.validate()?;
    logging::init(&config.logging);

    let coordinator = LockCycleCoordinator::new(config);
    coordinator.start().await?;

    let mut updates = coordinator.subscribe();
    while updates.borrow_and_update().epoch == 0 {
        updates
            .changed()
            .await
            .map_err(|_| CommError::InvalidTopology("coordinator stopped before the first rotation".into()))?;
    }

    let client = ChainClient::direct();
    let payload = client.fetch_topology(&coordinator.address().await).await?;
    let topology = payload.chain_topology;
    info!(hops = topology.len(), order = ?topology.node_order, "topology fetched");

    let output = client
        .process_remote(&topology, message.as_bytes(), Some("demo-sink"))
        .await;
    let expected = ChainClient::expected_output(&topology, message.as_bytes());
    coordinator.stop().await;

    let (output, expected) = (output?, expected?);
    info!(
        output = %hex::encode(&output),
        matches_local_fold = output == expected,
        "chain output"
    );
    Ok(())
}
