use anyhow::Result;
use clap::{Parser, Subcommand};
use coinjoin_coordinator::chain::BitcoindClient;
use coinjoin_coordinator::client::CoordinatorClient;
use coinjoin_coordinator::config::Config;
use coinjoin_coordinator::referee::UtxoReferee;
use coinjoin_coordinator::rpc::RpcServer;
use coinjoin_coordinator::storage::Storage;
use coinjoin_coordinator::{now, Coordinator};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "coordinator")]
#[command(about = "Chaumian CoinJoin coordinator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator
    Serve {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
        /// Defaults to <data_dir>/config.json
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "127.0.0.1:37127")]
        listen: SocketAddr,
        #[arg(long, default_value = "http://127.0.0.1:18443")]
        bitcoind_url: String,
        #[arg(long)]
        rpc_user: Option<String>,
        #[arg(long)]
        rpc_password: Option<String>,
    },

    /// Show the rounds of a running coordinator
    State {
        #[arg(long, default_value = "http://127.0.0.1:37127")]
        url: String,
    },

    /// List banned and noted outpoints (coordinator must be stopped)
    Bans {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coinjoin_coordinator=info,coordinator=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { data_dir, config, listen, bitcoind_url, rpc_user, rpc_password } => {
            let config_path = config.unwrap_or_else(|| data_dir.join("config.json"));
            let auth = rpc_user.zip(rpc_password);
            serve(data_dir, config_path, listen, bitcoind_url, auth).await
        }
        Command::State { url } => show_state(url).await,
        Command::Bans { data_dir } => show_bans(data_dir).await,
    }
}

async fn serve(
    data_dir: PathBuf,
    config_path: PathBuf,
    listen: SocketAddr,
    bitcoind_url: String,
    auth: Option<(String, String)>,
) -> Result<()> {
    let config = Config::load_or_create(&config_path)?;
    tracing::info!(
        "Network {}, denomination {}, anonymity set {}",
        config.network,
        config.round.denomination,
        config.round.anonymity_set
    );

    let storage = Storage::open(data_dir.join("bans"))?;
    let referee = UtxoReferee::open(storage, config.dos.clone())?;
    let bitcoind = Arc::new(BitcoindClient::new(bitcoind_url, auth)?);
    let coordinator = Coordinator::new(config, referee, bitcoind.clone(), bitcoind).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let rpc_server = RpcServer::new(listen);
    let rpc_coordinator = coordinator.clone();
    let rpc_shutdown = shutdown_rx.clone();
    let rpc_handle = tokio::spawn(async move {
        if let Err(e) = rpc_server.run(rpc_coordinator, rpc_shutdown).await {
            tracing::error!("RPC server error: {}", e);
        }
    });

    tokio::spawn(watch_config(coordinator.clone(), config_path, shutdown_rx.clone()));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received");
        }
        let _ = shutdown_tx.send(true);
    });

    tracing::info!("Coordinator started (rpc: {})", listen);
    coordinator.run(shutdown_rx).await?;
    let _ = rpc_handle.await;
    Ok(())
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Poll the config file; a changed round section applies to the next
/// round and restarts the rounds still gathering inputs.
async fn watch_config(coordinator: Arc<Coordinator>, path: PathBuf, mut shutdown: watch::Receiver<bool>) {
    let mut last = modified(&path);
    let mut interval = tokio::time::interval(CONFIG_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => return,
        }
        let current = modified(&path);
        if current == last {
            continue;
        }
        last = current;

        let config = match Config::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Ignoring config change: {:#}", e);
                continue;
            }
        };
        if coordinator.config().await.round == config.round {
            continue;
        }
        if let Err(e) = coordinator.update_round_config(config.round).await {
            tracing::error!("Ignoring config change: {:#}", e);
            continue;
        }
        coordinator.abort_all_rounds_in_input_registration("Configuration changed.").await;
        if let Err(e) = coordinator.ensure_open_round().await {
            tracing::error!("Could not open a round with the new config: {}", e);
        }
    }
}

async fn show_state(url: String) -> Result<()> {
    let client = CoordinatorClient::new(url);
    let states = client.states().await?;
    if states.is_empty() {
        println!("No active rounds.");
        return Ok(());
    }
    println!("{:<8} {:<24} {:<10} {:<14} {}", "ROUND", "PHASE", "PEERS", "DENOMINATION", "REMAINING");
    println!("{}", "-".repeat(70));
    for s in states {
        println!(
            "{:<8} {:<24} {:<10} {:<14} {}s",
            s.round_id,
            s.phase,
            format!("{}/{}", s.registered_peer_count, s.required_peer_count),
            s.denomination,
            s.remaining_registration_secs
        );
    }
    Ok(())
}

async fn show_bans(data_dir: PathBuf) -> Result<()> {
    let config = Config::load_or_create(&data_dir.join("config.json"))?;
    let storage = Storage::open(data_dir.join("bans"))?;
    let referee = UtxoReferee::open(storage, config.dos.clone())?;
    let bans = referee.list().await;
    if bans.is_empty() {
        println!("No banned outpoints.");
        return Ok(());
    }
    let now = now();
    println!("{:<70} {:<7} {:<9} {:<8} {}", "OUTPOINT", "NOTED", "OFFENSES", "ROUND", "REMAINING");
    println!("{}", "-".repeat(105));
    for ban in bans {
        let remaining = ban.remaining_secs(config.dos.duration_hours, now);
        println!(
            "{:<70} {:<7} {:<9} {:<8} {}m",
            ban.outpoint.to_string(),
            ban.is_noted,
            ban.offenses,
            ban.banned_for_round,
            remaining.div_ceil(60)
        );
    }
    Ok(())
}
