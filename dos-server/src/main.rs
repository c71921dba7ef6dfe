use clap::{Args, Parser, Subcommand};
use crate::config::{DataNodeConfig, NameNodeConfig, QueueBackend};
use dos_core::{DosClient, DosError};
use futures::StreamExt;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;
mod datanode;
mod lease_server;
mod server;

#[derive(Parser)]
#[command(name = "dos")]
#[command(about = "Replicated object store with lamport-ordered updates and lease notifications")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the name node
    Namenode {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,

        /// Listen address for clients and replicas
        #[arg(long)]
        bind: Option<String>,

        /// Replicas per object
        #[arg(long)]
        replication: Option<usize>,

        /// Ghost nodes required before accepting creates
        #[arg(long)]
        tolerance: Option<usize>,

        #[arg(long = "log-file")]
        log_file: Option<PathBuf>,

        /// Persist object names across restarts
        #[arg(long = "namespace-file")]
        namespace_file: Option<PathBuf>,
    },
    /// Run a data node
    Datanode(DataNodeArgs),
    /// Run a ghost node that stands by for recovery
    Ghost(DataNodeArgs),
    /// Talk to a running name node
    Client {
        #[arg(long = "name-node", default_value = "127.0.0.1:50051")]
        name_node: String,

        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Args)]
struct DataNodeArgs {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Node id
    #[arg(long)]
    node: Option<String>,

    /// Name node address, host:port
    #[arg(long = "name-node")]
    name_node: Option<String>,

    /// SQLite file for the local store
    #[arg(long)]
    store: Option<PathBuf>,

    /// Listen address for lease subscribers
    #[arg(long = "lease-addr")]
    lease_addr: Option<String>,

    #[arg(long = "initial-sequence")]
    initial_sequence: Option<u64>,

    #[arg(long, value_enum)]
    queue: Option<QueueBackend>,

    #[arg(long = "redis-url")]
    redis_url: Option<String>,

    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ClientAction {
    Create { object: String, data: String },
    Delete { object: String },
    Update { object: String, data: String },
    /// Follow notifications for an object from one of its holders
    Lease { object: String },
}

impl DataNodeArgs {
    fn into_config(self) -> dos_core::Result<DataNodeConfig> {
        let mut config: DataNodeConfig = crate::config::load(self.config.as_deref())?;
        if let Some(node) = self.node {
            config.node_id = node;
        }
        if let Some(name_node) = self.name_node {
            config.name_node = name_node;
        }
        if let Some(store) = self.store {
            config.store = store;
        }
        if let Some(lease_addr) = self.lease_addr {
            config.lease_addr = lease_addr;
        }
        if let Some(initial_sequence) = self.initial_sequence {
            config.initial_sequence = initial_sequence;
        }
        if let Some(queue) = self.queue {
            config.queue = queue;
        }
        if let Some(redis_url) = self.redis_url {
            config.redis_url = redis_url;
        }
        if self.log_file.is_some() {
            config.log_file = self.log_file;
        }
        Ok(config)
    }
}

fn init_tracing(log_file: Option<&Path>) {
    let file_layer = log_file.and_then(|path| {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            ),
            Err(error) => {
                eprintln!("cannot open log file {}: {}", path.display(), error);
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dos=info,dos_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
}

fn exit_with(context: &str, error: DosError) -> ! {
    tracing::error!("{}: {}", context, error);
    std::process::exit(1);
}

async fn run_client(name_node: &str, action: ClientAction) -> dos_core::Result<()> {
    let client = DosClient::new(name_node);
    match action {
        ClientAction::Create { object, data } => {
            let response = client.create_object(&object, data.as_bytes()).await?;
            println!("{} {} @lamport{}", response.status, object, response.sequence);
        }
        ClientAction::Delete { object } => {
            let response = client.delete_object(&object).await?;
            println!("{} {} @lamport{}", response.status, object, response.sequence);
        }
        ClientAction::Update { object, data } => {
            let response = client.update_object(&object, data.as_bytes()).await?;
            println!("{} {} @lamport{}", response.status, object, response.sequence);
        }
        ClientAction::Lease { object } => {
            let endpoints = client.lease_object(&object).await?;
            let endpoint = endpoints
                .choose(&mut rand::thread_rng())
                .ok_or_else(|| DosError::ObjectNotFound(object.clone()))?;
            follow_lease(endpoint, &object).await?;
        }
    }
    Ok(())
}

async fn follow_lease(endpoint: &str, object: &str) -> dos_core::Result<()> {
    let url = format!("{}/{}", endpoint.trim_end_matches('/'), object);
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|error| DosError::Transport(format!("connect {}: {}", url, error)))?;
    println!("following {} on {}", object, endpoint);

    let (_sink, mut stream) = socket.split();
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => println!("{}", text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => return Err(DosError::Transport(error.to_string())),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Namenode {
            config,
            bind,
            replication,
            tolerance,
            log_file,
            namespace_file,
        } => {
            let loaded: dos_core::Result<NameNodeConfig> = crate::config::load(config.as_deref());
            let mut cfg = match loaded {
                Ok(cfg) => cfg,
                Err(error) => {
                    init_tracing(None);
                    exit_with("Failed to load config", error);
                }
            };
            if let Some(bind) = bind {
                cfg.bind_addr = bind;
            }
            if let Some(replication) = replication {
                cfg.replication = replication;
            }
            if let Some(tolerance) = tolerance {
                cfg.tolerance = tolerance;
            }
            if log_file.is_some() {
                cfg.log_file = log_file;
            }
            if namespace_file.is_some() {
                cfg.namespace_file = namespace_file;
            }

            init_tracing(cfg.log_file.as_deref());
            if let Err(error) = server::run_namenode(cfg).await {
                exit_with("Name node error", error);
            }
        }
        Commands::Datanode(args) => {
            let cfg = match args.into_config() {
                Ok(cfg) => cfg,
                Err(error) => {
                    init_tracing(None);
                    exit_with("Failed to load config", error);
                }
            };
            init_tracing(cfg.log_file.as_deref());
            if let Err(error) = datanode::run_datanode(cfg).await {
                exit_with("Data node error", error);
            }
        }
        Commands::Ghost(args) => {
            let cfg = match args.into_config() {
                Ok(cfg) => cfg,
                Err(error) => {
                    init_tracing(None);
                    exit_with("Failed to load config", error);
                }
            };
            init_tracing(cfg.log_file.as_deref());
            if let Err(error) = datanode::run_ghost(cfg).await {
                exit_with("Ghost error", error);
            }
        }
        Commands::Client { name_node, action } => {
            init_tracing(None);
            if let Err(error) = run_client(&name_node, action).await {
                exit_with("Request failed", error);
            }
        }
    }
}
