mod availability;
mod cache;
mod channel;
mod collectors;
mod config;
mod control;
mod http;
mod metrics;
mod poller;
mod state;
#[cfg(test)]
mod testutil;

use availability::{HostAvailabilityMonitor, PingProbe};
use axum::serve;
use channel::privilege::Credentials;
use channel::ssh::SshConnector;
use channel::{ChannelPolicy, CommandChannel};
use clap::Parser;
use config::Config;
use control::ControlGateway;
use metrics::Metrics;
use poller::{Collectors, SnapshotAggregator};
use state::{now_unix, SnapshotStore, SystemSnapshot};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nasmond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Run a single poll cycle, print the snapshot as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let password = cfg.resolve_password();
    if password.is_none() {
        warn!(
            env = %cfg.password_env,
            "no ssh password configured, falling back to the ssh agent"
        );
    }

    info!(
        host = %cfg.host,
        port = cfg.port,
        listen = %cfg.listen,
        scan_interval_secs = cfg.scan_interval_secs,
        docker = cfg.enable_docker,
        "starting nasmond"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let connector = SshConnector::new(
        cfg.host.clone(),
        cfg.port,
        cfg.username.clone(),
        password.clone(),
        Duration::from_secs(cfg.channel.connect_timeout_secs),
    );
    let channel = Arc::new(CommandChannel::new(
        cfg.host.clone(),
        Arc::new(connector),
        Credentials {
            password,
            root_password: cfg.root_password.clone(),
        },
        ChannelPolicy::from_config(&cfg),
    ));
    let monitor = Arc::new(HostAvailabilityMonitor::new(
        cfg.host.clone(),
        Arc::new(PingProbe::new(Duration::from_secs(
            cfg.availability.probe_timeout_secs,
        ))),
        Duration::from_secs(cfg.availability.retry_interval_secs),
    ));
    let store = Arc::new(SnapshotStore::new(SystemSnapshot::offline_default(
        cfg.mac.clone(),
        now_unix(),
    )));
    let aggregator = Arc::new(SnapshotAggregator::new(
        channel.clone(),
        monitor.clone(),
        store.clone(),
        Collectors::from_config(&cfg),
        metrics.clone(),
        cfg.mac.clone(),
    ));
    let gateway = Arc::new(ControlGateway::new(
        channel.clone(),
        store.clone(),
        metrics.clone(),
        cfg.enable_docker,
    ));

    if cli.once {
        let outcome = aggregator.run_cycle().await;
        info!(outcome = outcome.label(), "single poll cycle finished");
        let snapshot = store.current().await;
        match serde_json::to_string_pretty(&*snapshot) {
            Ok(json) => println!("{json}"),
            Err(err) => error!(error = %err, "failed to serialise snapshot"),
        }
        monitor.shutdown();
        channel.shutdown().await;
        return;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_task = {
        let metrics = metrics.clone();
        let mut snapshots = store.subscribe();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            metrics.update_from_snapshot(&snapshots.borrow_and_update());
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = snapshots.borrow_and_update().clone();
                        metrics.update_from_snapshot(&snapshot);
                    }
                }
            }
        })
    };

    let http_task = {
        let cfg = cfg.clone();
        let app_state = http::HttpAppState {
            metrics: metrics.clone(),
            store: store.clone(),
            aggregator: aggregator.clone(),
            gateway,
        };
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(app_state);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start http server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "http server error");
            }
        })
    };

    let poll_task = tokio::spawn(
        aggregator
            .clone()
            .run(cfg.scan_interval(), shutdown_rx.clone()),
    );
    let ups_task = tokio::spawn(
        aggregator
            .clone()
            .run_ups(cfg.ups_scan_interval(), shutdown_rx.clone()),
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);
    monitor.shutdown();

    let _ = poll_task.await;
    let _ = ups_task.await;
    let _ = http_task.await;
    let _ = metrics_task.await;
    channel.shutdown().await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
