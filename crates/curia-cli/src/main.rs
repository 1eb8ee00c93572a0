//! # curiad
//!
//! The CuriaDB agency node daemon.
//!
//! ## Usage
//!
//! ```bash
//! # Single-node agency on the default bind address
//! curiad --single
//!
//! # Member 1 of a three-node agency
//! curiad --config agency.toml --id 1
//! ```

mod server;

use curia_agency::config::CuriaConfig;
use curia_agency::constituent::Constituent;
use curia_agency::metrics::MetricsRegistry;
use curia_agency::replicator::{ElectionLedger, LocalReplicator, Replicator};
use curia_agency::store::Store;
use curia_agency::transport::HttpTransport;
use curia_agency::{logging, sweeper};
use server::AppState;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info};

struct Args {
    config_path: Option<String>,
    id: Option<u64>,
    bind: Option<String>,
    single: bool,
}

fn print_help() {
    println!("curiad - CuriaDB agency node");
    println!();
    println!("USAGE:");
    println!("    curiad [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <FILE>   TOML configuration file");
    println!("    --id <N>          This node's agent id (overrides config)");
    println!("    --bind <ADDR>     Listen address (overrides the own endpoint)");
    println!("    --single          Run as a single-member agency (permanent leader)");
    println!("    --help            Print this help");
}

fn parse_args() -> Result<Args, String> {
    let mut args =
        Args { config_path: None, id: None, bind: None, single: false };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                args.config_path = Some(it.next().ok_or("--config requires a path")?);
            }
            "--id" => {
                let raw = it.next().ok_or("--id requires a number")?;
                args.id = Some(raw.parse().map_err(|_| format!("invalid id '{raw}'"))?);
            }
            "--bind" => {
                args.bind = Some(it.next().ok_or("--bind requires an address")?);
            }
            "--single" => args.single = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument '{other}' (see --help)")),
        }
    }
    Ok(args)
}

/// Strips the scheme off an endpoint to obtain a bind address.
fn bind_addr_of(endpoint: &str) -> String {
    endpoint
        .strip_prefix("http://")
        .or_else(|| endpoint.strip_prefix("https://"))
        .unwrap_or(endpoint)
        .to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    let mut config = CuriaConfig::load(args.config_path.as_deref())?;
    if let Some(id) = args.id {
        config.agency.id = id;
    }
    if args.single {
        let own = args
            .bind
            .clone()
            .map(|b| format!("http://{b}"))
            .or_else(|| {
                config
                    .agency
                    .endpoints
                    .get(config.agency.id as usize)
                    .cloned()
            })
            .unwrap_or_else(|| "http://127.0.0.1:4001".to_string());
        config.agency.id = 0;
        config.agency.endpoints = vec![own];
    }

    logging::init(&config.logging);

    let id = config.agency.id as usize;
    let own_endpoint = config
        .agency
        .endpoints
        .get(id)
        .cloned()
        .ok_or("agency.id does not index agency.endpoints")?;
    let bind = args.bind.unwrap_or_else(|| bind_addr_of(&own_endpoint));

    info!(id, endpoint = %own_endpoint, size = config.agency.endpoints.len(), "starting curiad");

    let metrics = Arc::new(MetricsRegistry::new()?);
    let transport = Arc::new(HttpTransport::new());
    let store = Arc::new(Store::new(transport.clone(), Arc::clone(&metrics)));

    std::fs::create_dir_all(&config.persistence.data_dir)?;
    let ledger_path = Path::new(&config.persistence.data_dir).join("election.db");
    let ledger = ElectionLedger::open(&ledger_path)?;
    let replicator =
        Arc::new(LocalReplicator::new(Arc::clone(&store)).with_ledger(ledger));

    let replicator_handle: Arc<dyn Replicator> = replicator.clone();
    let constituent = Constituent::new(
        config.election_config(),
        transport,
        Arc::clone(&replicator_handle),
        Arc::clone(&metrics),
    );
    replicator.bind_constituent(&constituent);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = tokio::spawn(Arc::clone(&constituent).run(shutdown_rx.clone()));
    let sweeper = sweeper::spawn_sweeper(
        Arc::clone(&store),
        Arc::clone(&replicator_handle),
        Duration::from_millis(config.store.sweep_interval_ms),
        shutdown_rx.clone(),
        Arc::clone(&metrics),
    );

    let state = Arc::new(AppState {
        store,
        constituent,
        replicator,
        metrics,
        start_time: Instant::now(),
    });
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "agency API listening");

    let mut shutdown_signal = shutdown_rx.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_signal.changed().await;
    });

    tokio::select! {
        result = async { serve.await } => {
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), engine).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), sweeper).await;
    info!("curiad stopped");
    Ok(())
}
