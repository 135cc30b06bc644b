//! Mini-Network CLI Application
//!
//! Opens peer channels (inbound or outbound) and keeps them alive with the
//! ping protocol. Useful for exercising the networking layer by hand.

use clap::{Parser, Subcommand};
use mini_network::network::{
    Acceptor, Channel, Connector, Endpoint, ProtocolPing, Settings,
};
use mini_network::utility::Threadpool;
use mini_network::NetworkError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// First pause after a failed accept; doubles per consecutive failure
const ACCEPT_RETRY_BASE: Duration = Duration::from_millis(100);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "network")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer connection tool for the mini-network layer", long_about = None)]
struct Cli {
    /// Settings file (JSON); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker threads in the pool
    #[arg(short, long, default_value = "4")]
    threads: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept inbound peers until interrupted
    Listen {
        /// Port to listen on (overrides the settings file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Connect to a single peer and stay connected
    Connect {
        /// Peer address, e.g. seed.example.org:8333
        peer: String,
    },

    /// Write the default settings to a file
    Config {
        #[arg(short, long, default_value = "network.json")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Config { output } => {
            Settings::default().save(&output)?;
            println!("Wrote default settings to {}", output.display());
            return Ok(());
        }
        Commands::Listen { port } => {
            let (pool, settings) = prepare(cli.config.as_deref(), cli.threads)?;
            let port = port.unwrap_or(settings.inbound_port);
            pool.block_on(run_listen(&pool, settings, port))
        }
        Commands::Connect { peer } => {
            let endpoint: Endpoint = peer.parse()?;
            let (pool, settings) = prepare(cli.config.as_deref(), cli.threads)?;
            pool.block_on(run_connect(&pool, settings, endpoint))
        }
    };

    result.map_err(|e| -> Box<dyn std::error::Error> { e })
}

/// Load settings (or defaults) and start the worker pool
fn prepare(
    config: Option<&Path>,
    threads: usize,
) -> Result<(Threadpool, Arc<Settings>), Box<dyn std::error::Error>> {
    let settings = match config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let pool = Threadpool::new(threads)?;
    Ok((pool, Arc::new(settings)))
}

type RunResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

async fn run_listen(pool: &Threadpool, settings: Arc<Settings>, port: u16) -> RunResult {
    let acceptor = Arc::new(Acceptor::new(pool.clone(), settings.clone()));

    let (tx, rx) = oneshot::channel();
    acceptor.listen(port, move |result| {
        let _ = tx.send(result);
    });
    rx.await??;

    if let Some(addr) = acceptor.local_addr() {
        println!("Listening on {}", addr);
    }

    accept_next(pool.clone(), acceptor.clone(), settings, 0);

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    acceptor.cancel();
    Ok(())
}

/// Arm one accept; each completion re-arms the next
///
/// Failures re-arm after a growing pause so a persistent error (such as
/// running out of descriptors) does not spin.
fn accept_next(pool: Threadpool, acceptor: Arc<Acceptor>, settings: Arc<Settings>, failures: u32) {
    let next = acceptor.clone();
    acceptor.accept(move |result| match result {
        Ok(channel) => {
            attach(&pool, channel, &settings);
            accept_next(pool, next, settings, 0);
        }
        Err(NetworkError::OperationCanceled) => {}
        Err(e) => {
            let delay = accept_retry_delay(failures);
            log::warn!("Accept failed: {}, retrying in {:?}", e, delay);
            let retry = pool.clone();
            pool.spawn(async move {
                tokio::time::sleep(delay).await;
                accept_next(retry, next, settings, failures.saturating_add(1));
            });
        }
    });
}

fn accept_retry_delay(failures: u32) -> Duration {
    ACCEPT_RETRY_BASE
        .checked_mul(1u32.checked_shl(failures).unwrap_or(u32::MAX))
        .map_or(ACCEPT_RETRY_MAX, |delay| delay.min(ACCEPT_RETRY_MAX))
}

async fn run_connect(pool: &Threadpool, settings: Arc<Settings>, endpoint: Endpoint) -> RunResult {
    let connector = Connector::new(pool.clone(), settings.clone());

    let (tx, rx) = oneshot::channel();
    connector.connect(endpoint.clone(), move |result| {
        let _ = tx.send(result);
    });

    let channel = tokio::select! {
        result = rx => result??,
        _ = tokio::signal::ctrl_c() => {
            connector.cancel();
            return Ok(());
        }
    };

    println!("Connected to {} ({})", endpoint, channel.authority());

    let (stop_tx, stop_rx) = oneshot::channel();
    channel.subscribe_stop(move |ec| {
        let _ = stop_tx.send(ec);
    });
    attach(pool, channel.clone(), &settings);

    tokio::select! {
        ec = stop_rx => {
            if let Ok(ec) = ec {
                println!("Disconnected: {}", ec);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            channel.stop(NetworkError::ChannelStopped);
        }
    }

    Ok(())
}

fn attach(pool: &Threadpool, channel: Arc<Channel>, settings: &Settings) {
    let authority = channel.authority();
    channel.subscribe_stop(move |ec| log::info!("Peer [{}] disconnected: {}", authority, ec));

    ProtocolPing::new(pool, channel.clone(), settings.heartbeat_interval()).start();
    channel.start();
}
