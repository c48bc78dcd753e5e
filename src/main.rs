//! Bounded-buffer demo over TCP.
//!
//! # Usage
//!
//! ```bash
//! # run one peer of the table
//! hot-potato-monitor peer --name a --role producer
//!
//! # run every peer of the table as a child process
//! hot-potato-monitor spawn --peers-file peers.json
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use color_print::cformat;
use hot_potato_monitor::{
    MonitorBuilder, RATE,
    buffer::{BoundedBuffer, BufferMonitor, DEFAULT_CAPACITY},
    config::{Config, DEFAULT_PEERS_FILE_NAME},
    log,
    poisson::Poisson,
    transport::{Router, TcpTransport},
};
use std::error::Error;
use tokio::process::{Child, Command};

const BUFFER_TAG: &str = "bounded-buffer";

/// Distributed monitor demo
#[derive(Parser, Debug)]
#[command(name = "hot-potato-monitor")]
#[command(about = "Producer/consumer over a token-passing distributed monitor")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Run one peer of the table
    Peer {
        /// Name of the peer
        #[arg(short, long)]
        name: String,

        /// Path to the config file
        #[arg(long, default_value = DEFAULT_PEERS_FILE_NAME)]
        peers_file: String,

        /// What this peer does with the buffer
        #[arg(long, value_enum, default_value_t = Role::Idle)]
        role: Role,

        /// Number of items produced or consumed
        #[arg(long, default_value = "10")]
        iterations: u64,

        /// Buffer capacity, must match on every peer
        #[arg(long, default_value_t = DEFAULT_CAPACITY)]
        capacity: usize,
    },
    /// Spawn every peer of the table as a child process
    Spawn {
        /// Path to the config file
        #[arg(long, default_value = DEFAULT_PEERS_FILE_NAME)]
        peers_file: String,

        /// Number of items each producer/consumer pair moves
        #[arg(long, default_value = "10")]
        iterations: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    Producer,
    Consumer,
    /// Only relays the token
    Idle,
}

impl Role {
    fn as_arg(self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Consumer => "consumer",
            Self::Idle => "idle",
        }
    }
}

async fn run_peer(
    name: String,
    peers_file: String,
    role: Role,
    iterations: u64,
    capacity: usize,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = Config::from_file(&peers_file)?;
    let own_address = config.address_of(&name)?;

    let router = Router::new();
    let _listener = TcpTransport::listen(&format!("0.0.0.0:{}", own_address.port), router.clone()).await?;
    let transport = TcpTransport::connect(&config, &name);

    let buffer = BufferMonitor::build(
        MonitorBuilder::from_config(&config, &name).tag(BUFFER_TAG),
        BoundedBuffer::new(capacity),
        transport,
        &router,
    )?;
    log::info(&cformat!("Peer <bold>{name}</bold> joined as a <bold>{}</bold>.", role.as_arg()));

    let mut poisson = Poisson::for_peer(RATE, &name);
    for i in 0..iterations {
        tokio::time::sleep(poisson.next_delay()).await;
        match role {
            Role::Producer => buffer.produce(i).await?,
            Role::Consumer => {
                buffer.consume().await?;
            }
            Role::Idle => break,
        }
    }

    log::info(&cformat!("Peer <bold>{name}</bold> is done, relaying the token until Ctrl-C."));
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn spawn_peers(
    peers_file: String,
    iterations: u64,
    log_level: &str,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = Config::from_file(&peers_file)?;
    let executable = std::env::current_exe()?;
    let names = config.peer_names();

    log::info("Spawning peers");
    let mut children: Vec<Child> = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        // producers and consumers come in pairs, an odd one out only relays
        let role = if i % 2 == 1 {
            Role::Consumer
        } else if i + 1 < names.len() {
            Role::Producer
        } else {
            Role::Idle
        };

        let child = Command::new(&executable)
            .arg("peer")
            .arg(format!("--name={name}"))
            .arg(format!("--peers-file={peers_file}"))
            .arg(format!("--role={}", role.as_arg()))
            .arg(format!("--iterations={iterations}"))
            .arg(format!("--log-level={log_level}"))
            .kill_on_drop(true)
            .spawn()?;
        children.push(child);
    }

    tokio::signal::ctrl_c().await?;
    for child in &mut children {
        if let Err(e) = child.kill().await {
            log::error(&format!("Couldn't stop a peer: {e}"));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let args = Args::parse();
    log::init(&args.log_level);

    match args.command {
        Action::Peer {
            name,
            peers_file,
            role,
            iterations,
            capacity,
        } => run_peer(name, peers_file, role, iterations, capacity).await,
        Action::Spawn {
            peers_file,
            iterations,
        } => spawn_peers(peers_file, iterations, &args.log_level).await,
    }
}
