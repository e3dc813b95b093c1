//! DNS server setup and lifecycle management.

use hickory_server::authority::Catalog;
use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::DnsConfig;
use crate::controller::{Controller, Shutdown};
use crate::error::DnsError;
use crate::handler::{MultiClusterHandler, ResponseAssembler};
use crate::state::ClusterCache;

/// Interval for emitting state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Idle timeout of TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the start-up wait checks for a synced cache.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often the start-up wait reports that it is still waiting.
const SYNC_LOG_INTERVAL: Duration = Duration::from_millis(500);

/// Periodically emit state metrics.
async fn metrics_loop<C: ClusterCache + ?Sized>(cache: Arc<C>, mut shutdown: Shutdown) {
    let mut interval = interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                cache.emit_metrics();
                debug!(
                    services = cache.service_list().len(),
                    endpoints = cache.endpoints_list().len(),
                    synced = cache.has_synced(),
                    "emitted state metrics"
                );
            }
            _ = shutdown.changed() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// Result of waiting for the initial sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWait {
    /// Every collection finished its initial listing.
    Synced,
    /// The ceiling passed first. Serving starts anyway.
    TimedOut,
    /// Shutdown was requested while waiting.
    Shutdown,
}

/// Wait for `cache` to sync, at most `timeout`.
pub async fn wait_for_sync<C: ClusterCache + ?Sized>(
    cache: &C,
    timeout: Duration,
    shutdown: &mut Shutdown,
) -> SyncWait {
    let deadline = Instant::now() + timeout;
    let mut poll = interval(SYNC_POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_log = Instant::now();

    loop {
        if *shutdown.borrow() {
            return SyncWait::Shutdown;
        }
        if cache.has_synced() {
            return SyncWait::Synced;
        }
        if Instant::now() >= deadline {
            warn!(
                timeout_secs = timeout.as_secs_f64(),
                "starting server with unsynced Kubernetes API"
            );
            return SyncWait::TimedOut;
        }
        if last_log.elapsed() >= SYNC_LOG_INTERVAL {
            info!("waiting for Kubernetes API before starting server");
            last_log = Instant::now();
        }

        tokio::select! {
            _ = poll.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return SyncWait::Shutdown;
                }
            }
        }
    }
}

/// DNS server answering for the configured cluster zones.
pub struct DnsServer<C: ClusterCache + 'static = Controller> {
    config: DnsConfig,
    cache: Arc<C>,
}

impl<C: ClusterCache + 'static> DnsServer<C> {
    /// Create a server over `cache`. The cache is started by [`DnsServer::run`].
    pub fn new(config: DnsConfig, cache: Arc<C>) -> Self {
        Self { config, cache }
    }

    /// The cache backing this server.
    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    /// Bind UDP and TCP on the configured address and serve until shutdown.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), DnsError> {
        let udp_socket = UdpSocket::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "DNS UDP listening");

        let tcp_listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "DNS TCP listening");

        self.serve(udp_socket, tcp_listener, shutdown).await
    }

    /// Serve on already bound sockets until shutdown.
    ///
    /// Starts the cache, waits for its initial sync, answers queries and
    /// finally stops the cache and waits for it to finish.
    pub async fn serve(
        self,
        udp_socket: UdpSocket,
        tcp_listener: TcpListener,
        mut shutdown: Shutdown,
    ) -> Result<(), DnsError> {
        info!(
            zones = ?self.config.zones,
            fallthrough = ?self.config.fallthrough,
            ttl = self.config.ttl,
            endpoints = self.config.endpoints,
            "Starting multicluster-dns server"
        );

        let cache: Arc<dyn ClusterCache> = self.cache.clone();
        let assembler = ResponseAssembler::new(&self.config, cache)?;

        let cache_handle = tokio::spawn({
            let cache = self.cache.clone();
            async move {
                if let Err(e) = cache.run().await {
                    error!(error = %e, "cluster cache stopped with error");
                }
            }
        });

        info!("Waiting for initial cluster state sync...");
        match wait_for_sync(self.cache.as_ref(), self.config.sync_timeout(), &mut shutdown).await {
            SyncWait::Synced => {
                info!(
                    services = self.cache.service_list().len(),
                    endpoints = self.cache.endpoints_list().len(),
                    "Initial state sync complete"
                );
            }
            SyncWait::TimedOut => {}
            SyncWait::Shutdown => {
                info!("Shutdown requested before state sync completed");
                self.stop_cache(cache_handle).await;
                return Ok(());
            }
        }

        let handler = MultiClusterHandler::new(assembler, Catalog::new());
        let mut server = ServerFuture::new(handler);
        server.register_socket(udp_socket);
        server.register_listener(tcp_listener, TCP_TIMEOUT);

        info!(zones = ?self.config.zones, "DNS server ready to serve queries");

        let metrics_handle = tokio::spawn(metrics_loop(self.cache.clone(), shutdown.clone()));
        self.cache.emit_metrics();

        tokio::select! {
            _ = shutdown.changed() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!(error = %e, "DNS server error");
                }
            }
        }

        metrics_handle.abort();
        self.stop_cache(cache_handle).await;

        info!("DNS server stopped");
        Ok(())
    }

    async fn stop_cache(&self, handle: tokio::task::JoinHandle<()>) {
        if let Err(e) = self.cache.stop() {
            debug!(error = %e, "cluster cache already stopping");
        }

        info!("Waiting for cluster watches to stop...");
        if let Err(e) = handle.await {
            error!(error = %e, "cluster cache task panicked");
        }
    }
}
