use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wabisabi::client::{CoordinatorApi, CoordinatorDescriptor, HttpCoordinatorClient};
use wabisabi::config::CoordinatorConfig;
use wabisabi::node::{self, Coordinator};
use wabisabi::prison::Prison;
use wabisabi::round::{EndRoundState, RoundState};
use wabisabi::rpc::{self, types::RoundStateRequest};
use wabisabi::utxo::MemoryUtxoSet;
use wabisabi::OutPoint;

#[derive(Parser)]
#[command(name = "wabisabi")]
#[command(about = "A WabiSabi CoinJoin coordinator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator
    Coordinator {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
        /// Defaults to <data-dir>/config.toml
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overrides the configured RPC port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show the rounds a coordinator is running
    Status {
        #[arg(long, default_value = "http://127.0.0.1:37127")]
        url: String,
    },

    /// Inspect or edit the ban list
    Prison {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
        /// Release an outpoint (<txid>:<index>)
        #[arg(long)]
        unban: Option<OutPoint>,
    },

    /// Validate and normalize a coordinator descriptor
    Descriptor { descriptor: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wabisabi=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Coordinator { data_dir, config, port } => run_coordinator(data_dir, config, port).await,
        Command::Status { url } => show_status(url).await,
        Command::Prison { data_dir, unban } => show_prison(data_dir, unban).await,
        Command::Descriptor { descriptor } => show_descriptor(&descriptor),
    }
}

async fn run_coordinator(data_dir: PathBuf, config_path: Option<PathBuf>, port: Option<u16>) -> Result<()> {
    let config_path = config_path.unwrap_or_else(|| data_dir.join(node::CONFIG_FILE));
    let config = CoordinatorConfig::load_or_create(&config_path)?;
    let rpc_port = port.unwrap_or(config.rpc_port);

    let coordinator = Coordinator::open(data_dir, config).await?;
    let handle = coordinator.create_handle();
    let arena = handle.arena().clone();
    let rpc_server = rpc::RpcServer::new(rpc_port);
    tokio::spawn(async move {
        if let Err(e) = rpc_server.run(handle).await {
            tracing::error!("RPC server error: {}", e);
        }
    });
    tracing::info!("Coordinator started (rpc: {})", rpc_port);

    tokio::select! {
        result = coordinator.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            arena.wait_for_broadcasts().await;
            Ok(())
        }
    }
}

async fn show_status(url: String) -> Result<()> {
    let client = HttpCoordinatorClient::new(url)?;
    let response = client
        .get_status(RoundStateRequest::default())
        .await
        .context("fetching round status")?;
    if response.round_states.is_empty() {
        println!("No rounds");
        return Ok(());
    }
    for delta in &response.round_states {
        let round = RoundState::from_delta(delta)?;
        let kind = match round.blame_of {
            Some(parent) => format!("blame of {}", parent.short()),
            None => "standard".to_string(),
        };
        println!("Round {} ({})", round.id, kind);
        println!("  Phase:      {:?}", round.phase);
        println!("  Started:    {}", round.input_registration_start);
        println!("  Inputs:     {}", round.coinjoin_state.inputs().len());
        println!("  Outputs:    {}", round.coinjoin_state.outputs().len());
        println!(
            "  Max amount: {} sat",
            round.coinjoin_state.parameters().max_suggested_amount
        );
        if round.end_round_state != EndRoundState::None {
            println!("  Result:     {:?}", round.end_round_state);
        }
    }
    Ok(())
}

async fn show_prison(data_dir: PathBuf, unban: Option<OutPoint>) -> Result<()> {
    let config = CoordinatorConfig::load_or_create(&data_dir.join(node::CONFIG_FILE))?;
    let utxos = MemoryUtxoSet::load_json(&data_dir.join(node::UTXO_FILE))?;
    let ban_duration = chrono::Duration::seconds(config.release_utxo_from_prison_after as i64);
    let prison = Prison::load(data_dir.join(node::PRISON_FILE), ban_duration, &utxos).await?;

    if let Some(outpoint) = unban {
        if prison.unban(&outpoint).await? {
            println!("Released {}", outpoint);
        } else {
            println!("{} is not in prison", outpoint);
        }
        return Ok(());
    }

    println!(
        "Prison: {} banned, {} noted",
        prison.count_banned().await,
        prison.count_noted().await
    );
    for inmate in prison.banned_utxos().await {
        println!(
            "  {} severity={} {} until {} (round {})",
            inmate.outpoint,
            inmate.severity,
            if inmate.is_noted { "noted" } else { "banned" },
            inmate.expires_at(ban_duration),
            inmate.banned_for_round.short()
        );
    }
    Ok(())
}

fn show_descriptor(descriptor: &str) -> Result<()> {
    let d: CoordinatorDescriptor = descriptor.parse()?;
    println!("Name:        {}", d.name);
    println!("Network:     {}", d.network);
    println!("Coordinator: {}", d.coordinator_uri);
    println!("Min inputs:  {}", d.absolute_min_input_count);
    println!("Read more:   {}", d.read_more);
    if let Some(rate) = d.coordination_fee_rate {
        println!("Fee rate:    {} ppm", rate);
    }
    if let Some(n) = d.min_input_count {
        println!("Min round:   {}", n);
    }
    for (k, v) in &d.extra {
        println!("  {} = {}", k, v);
    }
    println!("{}", d);
    Ok(())
}
