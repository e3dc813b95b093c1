//! multicluster-dns binary entry point.

use clap::Parser;
use multicluster_dns::controller::{client_from_config, Controller};
use multicluster_dns::{telemetry, Config, DnsServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Authoritative DNS for multi-cluster Kubernetes service discovery.
#[derive(Parser, Debug)]
#[command(name = "multicluster-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "multicluster-dns.toml")]
    config: PathBuf,
}

/// Resolve once SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()))
        .add_source(
            config::Environment::with_prefix("MULTICLUSTER_DNS")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("dns.zones")
                .with_list_parse_key("dns.fallthrough")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        listen_addr = %config.dns.listen_addr,
        zones = ?config.dns.zones,
        kubeconfig = ?config.kubernetes.kubeconfig,
        context = ?config.kubernetes.context,
        "Starting multicluster-dns"
    );

    let client = client_from_config(&config.kubernetes).await?;
    let controller = Arc::new(Controller::new(client, config.dns.endpoints));

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_tx.send_replace(true);
    });

    // Run DNS server
    let server = DnsServer::new(config.dns, controller);
    let result = server.run(shutdown_rx).await;

    // Shutdown telemetry
    telemetry::shutdown();

    if let Err(e) = result {
        error!("DNS server error: {}", e);
        return Err(e.into());
    }

    info!("multicluster-dns shutdown complete");
    Ok(())
}
