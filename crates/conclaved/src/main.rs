//! conclaved: the Conclave daemon.
//!
//! `run` hosts one coordination node: the node service on the base port,
//! the raft peer listener on base+1, and a periodic driver that keeps the
//! store running (resuming local state or joining a random reachable
//! peer). Every other subcommand is a one-shot operator command sent to
//! the local node's service.
//!
//! # Usage
//!
//! ```text
//! conclaved --config /etc/conclave/conclave.toml run
//! conclaved --config /etc/conclave/conclave.toml init --bootstrap
//! conclaved --config /etc/conclave/conclave.toml add n2
//! ```

mod node;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use conclave_cluster::{ClusterConfig, NodeDirectory, peer};

#[derive(Parser)]
#[command(name = "conclaved", about = "Conclave coordination daemon")]
struct Cli {
    /// Path to conclave.toml.
    #[arg(long, default_value = "/etc/conclave/conclave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node until interrupted.
    Run,
    /// Create a new single-member cluster rooted at this node.
    Init {
        /// Wipe local state first.
        #[arg(long)]
        bootstrap: bool,
    },
    /// Start the store from local state.
    Start,
    /// Stop the store.
    Stop,
    /// Stop the store and delete all local state.
    Wipe,
    /// Add a node (name, id or ip) to the cluster.
    Add { name: String },
    /// Remove a member by name or hex id.
    Remove { name: String },
    /// Transfer leadership to a member by name or hex id.
    MoveLeader { name: String },
    /// Join the cluster through a member.
    Join { name: String },
    /// Print the cluster descriptor.
    Cluster,
    /// Print the current leader.
    Leader,
    /// Print cluster info as JSON.
    Info,
    /// Print the pending work descriptor.
    GetWork,
    /// Store a pending work descriptor.
    PutWork { work: String },
    /// Clear the pending work descriptor.
    DeleteWork,
}

impl Command {
    fn control(&self) -> Option<(&'static str, String)> {
        let cmd = match self {
            Command::Run => return None,
            Command::Init { bootstrap } => {
                ("init", if *bootstrap { "bootstrap".to_string() } else { String::new() })
            }
            Command::Start => ("start", String::new()),
            Command::Stop => ("stop", String::new()),
            Command::Wipe => ("wipe", String::new()),
            Command::Add { name } => ("add", name.clone()),
            Command::Remove { name } => ("remove", name.clone()),
            Command::MoveLeader { name } => ("move-leader", name.clone()),
            Command::Join { name } => ("join", name.clone()),
            Command::Cluster => ("cluster", String::new()),
            Command::Leader => ("leader", String::new()),
            Command::Info => ("info", String::new()),
            Command::GetWork => ("get-work", String::new()),
            Command::PutWork { work } => ("put-work", work.clone()),
            Command::DeleteWork => ("delete-work", String::new()),
        };
        Some(cmd)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,conclave=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = ClusterConfig::from_file(&cli.config)?;

    let Some((command, arg)) = cli.command.control() else {
        return node::run(config).await;
    };

    let local = NodeDirectory::new(config.nodes.clone())
        .by_name(&config.name)
        .ok_or_else(|| anyhow::anyhow!("node {:?} is not in the directory", config.name))?;
    let url = format!("http://127.0.0.1:{}", local.port);
    let output = peer::control(&url, &config.cluster_token, command, &arg).await?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
