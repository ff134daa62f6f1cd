//! accrual-daemon: φ-accrual heartbeat monitor.
//!
//! `serve` runs the ingestion/health-query server and `beat` sends heartbeats
//! to one. `healthy` and `status` query a running server.

use accrual_core::Tags;
use accrual_daemon::{
    DaemonConfig, HealthQuery, HeartbeatClient, HeartbeatServer, IdentityStrategy, query_health, query_status,
};
use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "accrual-daemon")]
#[command(about = "Phi-accrual heartbeat failure detector")]
struct Args {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept heartbeats and answer health queries
    Serve {
        /// Directory containing config.json (created with defaults if missing)
        #[arg(short, long, default_value = "./config")]
        config: PathBuf,

        /// Address to listen on (overrides config)
        #[arg(short, long)]
        listen: Option<String>,

        /// How heartbeats are mapped to peer identities (overrides config)
        #[arg(long, value_enum)]
        identity: Option<IdentityStrategy>,

        /// Intervals retained per peer (overrides config)
        #[arg(long)]
        window_size: Option<usize>,

        /// Time between sweeps in milliseconds (overrides config)
        #[arg(long)]
        sweep_interval_ms: Option<u64>,

        /// Silence required before a saturated peer is reaped (overrides config)
        #[arg(long)]
        grace_period_ms: Option<u64>,
    },

    /// Send heartbeats to a server until interrupted
    Beat {
        /// Server URL
        #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
        server: String,

        /// Time between heartbeats in milliseconds
        #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
        interval_ms: u64,

        /// Identity token (generated if not provided)
        #[arg(long)]
        token: Option<String>,

        /// Tag attached to this peer, as key=value (repeatable)
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
    },

    /// Print the server's healthy peers, most trusted first
    Healthy {
        /// Server URL
        #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
        server: String,

        /// Exclusive upper bound on suspicion
        #[arg(long, default_value_t = 8.0)]
        threshold: f64,

        /// Maximum number of peers to list
        #[arg(long, default_value_t = 10)]
        limit: u32,

        /// Only peers whose `service` tag equals this label
        #[arg(long)]
        label: Option<String>,
    },

    /// Print the server's peer count, reap count and per-peer statistics
    Status {
        /// Server URL
        #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
        server: String,
    },
}

fn parse_tag(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected key=value, got {:?}", raw))?;
    if key.is_empty() {
        return Err(anyhow!("tag key cannot be empty"));
    }
    Ok((key.to_string(), value.to_string()))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until killed.
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,accrual_core=debug,accrual_daemon=debug"
    } else {
        "info,accrual_core=info,accrual_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Serve {
            config,
            listen,
            identity,
            window_size,
            sweep_interval_ms,
            grace_period_ms,
        } => {
            let mut daemon_config = DaemonConfig::load(&config)?;
            if let Some(listen) = listen {
                daemon_config.listen = listen;
            }
            if let Some(identity) = identity {
                daemon_config.identity = identity;
            }
            if let Some(window_size) = window_size {
                daemon_config.detector.window_size = window_size;
            }
            if let Some(sweep_interval_ms) = sweep_interval_ms {
                daemon_config.detector.sweep_interval_ms = sweep_interval_ms;
            }
            if let Some(grace_period_ms) = grace_period_ms {
                daemon_config.detector.grace_period_ms = grace_period_ms;
            }

            info!("Starting accrual-daemon");
            info!("Listen address: {}", daemon_config.listen);

            daemon_config.validate()?;
            let server = HeartbeatServer::new(daemon_config)?;
            let listener = HeartbeatServer::bind(server.listen_addr()).await?;
            server.run(listener, shutdown_signal()).await?;
        }

        Command::Beat {
            server,
            interval_ms,
            token,
            tags,
        } => {
            let token = token.unwrap_or_else(|| {
                let id = uuid::Uuid::new_v4().to_string();
                info!("Generated token: {}", id);
                id
            });
            let tags: Tags = tags.into_iter().collect();

            info!("Sending heartbeats to {} every {}ms as {}", server, interval_ms, token);
            let client = HeartbeatClient::new(server, Some(token), tags, Duration::from_millis(interval_ms))?;
            client.run(shutdown_signal()).await?;
        }

        Command::Healthy {
            server,
            threshold,
            limit,
            label,
        } => {
            let statuses = query_health(
                &server,
                HealthQuery {
                    threshold,
                    limit,
                    label,
                },
            )
            .await?;

            if statuses.is_empty() {
                println!("No healthy peers");
            }
            for status in statuses {
                println!("{}\t{:.4}", status.identity, status.suspicion);
            }
        }

        Command::Status { server } => {
            let report = query_status(&server).await?;

            println!("active peers: {}", report.active_peers);
            println!("reaped total: {}", report.reaped_total);
            for peer in report.peers {
                println!(
                    "{}\tsamples={}\tmean={:.2}\tstdev={:.2}\tsuspicion={:.4}",
                    peer.identity, peer.samples, peer.mean, peer.stdev, peer.suspicion
                );
            }
        }
    }

    info!("Shutting down");
    Ok(())
}
