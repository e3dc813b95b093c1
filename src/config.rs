//! Configuration types for multicluster-dns.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default TTL applied to every synthesized service and endpoint record.
pub const DEFAULT_TTL: u32 = 5;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS server configuration.
    pub dns: DnsConfig,

    /// Kubernetes API access.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for DNS server to listen on (UDP and TCP).
    pub listen_addr: SocketAddr,

    /// Zones this server is authoritative for (e.g. "clusterset.local.").
    pub zones: Vec<String>,

    /// Zones for which name errors are handed to the next handler instead of
    /// being answered. Empty disables fallthrough, "." matches every name.
    #[serde(default)]
    pub fallthrough: Vec<String>,

    /// TTL for DNS records in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Watch EndpointSlices. Without them headless services and endpoint
    /// queries resolve to nothing.
    #[serde(default = "default_endpoints")]
    pub endpoints: bool,

    /// Upper bound on how long start-up waits for the initial sync.
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,

    /// SOA record configuration.
    #[serde(default)]
    pub soa: SoaConfig,
}

impl DnsConfig {
    /// Config for the given zones with every other field defaulted.
    pub fn for_zones<I, S>(zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 53)),
            zones: zones.into_iter().map(Into::into).collect(),
            fallthrough: Vec::new(),
            ttl: default_ttl(),
            endpoints: default_endpoints(),
            sync_timeout_secs: default_sync_timeout_secs(),
            soa: SoaConfig::default(),
        }
    }

    /// Start-up sync ceiling as a duration.
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

/// Kubernetes client configuration. Both fields unset means in-cluster
/// config, falling back to the default kubeconfig.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Explicit kubeconfig file.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Context to use from the kubeconfig.
    #[serde(default)]
    pub context: Option<String>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "multicluster_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "multicluster-dns".to_string()
}

/// SOA timers. The primary nameserver and mailbox are derived from the zone
/// (`ns.dns.<zone>` and `hostmaster.<zone>`), the minimum is the record TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaConfig {
    /// Refresh interval in seconds.
    #[serde(default = "default_refresh")]
    pub refresh: i32,

    /// Retry interval in seconds.
    #[serde(default = "default_retry")]
    pub retry: i32,

    /// Expire time in seconds.
    #[serde(default = "default_expire")]
    pub expire: i32,
}

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

fn default_endpoints() -> bool {
    true
}

fn default_sync_timeout_secs() -> u64 {
    5
}

fn default_refresh() -> i32 {
    7200
}

fn default_retry() -> i32 {
    1800
}

fn default_expire() -> i32 {
    86400
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            refresh: default_refresh(),
            retry: default_retry(),
            expire: default_expire(),
        }
    }
}
