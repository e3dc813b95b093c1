//! multicluster-dns - Authoritative DNS for multi-cluster Kubernetes service
//! discovery.
//!
//! Serves the names of services imported through the Multi-Cluster Services
//! API (`ServiceImport` of `multicluster.x-k8s.io/v1alpha1`) and of the
//! EndpointSlices member clusters export for them. Cluster state is kept in
//! memory by kube watchers and every query is answered from that state.
//!
//! ## Features
//!
//! - A and AAAA records for ClusterSetIP services (one per cluster IP)
//! - Per-endpoint A/AAAA and SRV records for headless services
//! - `dns-version` TXT record, SOA and NS at the zone apex
//! - Fallthrough of negative answers to the next handler
//! - SERVFAIL instead of NXDOMAIN until the initial sync is complete
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                         multicluster-dns                           │
//! │                                                                    │
//! │  ┌──────────────────┐    ┌──────────────────┐                      │
//! │  │ Controller       │───▶│  ClusterState    │                      │
//! │  │ (kube watchers)  │    │  (in-memory)     │                      │
//! │  └──────────────────┘    └────────┬─────────┘                      │
//! │         │                         │ RecordResolver                 │
//! │         │ Watch:                  ▼                                │
//! │         │ - ServiceImports   ┌──────────────────┐                  │
//! │         │ - EndpointSlices   │ MultiCluster     │◀── UDP/TCP :53   │
//! │         │ - Namespaces       │ Handler          │───▶ next handler │
//! │         │                    └──────────────────┘                  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## DNS Resolution
//!
//! ```text
//! web.shop.svc.clusterset.local                   → cluster IPs of web.shop
//! _http._tcp.web.shop.svc.clusterset.local  SRV   → matching ports
//! pod-1.east.web.shop.svc.clusterset.local        → endpoint pod-1 in cluster east
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use multicluster_dns::controller::Controller;
//! use multicluster_dns::{DnsConfig, DnsServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = kube::Client::try_default().await.unwrap();
//!     let config = DnsConfig::for_zones(["clusterset.local."]);
//!     let controller = Arc::new(Controller::new(client, config.endpoints));
//!
//!     let (_tx, shutdown) = tokio::sync::watch::channel(false);
//!     DnsServer::new(config, controller).run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
pub mod mcs;
pub mod metrics;
pub mod object;
pub mod parse;
pub mod records;
pub mod resolver;
pub mod server;
pub mod state;
pub mod telemetry;

// Re-export main types
pub use config::{Config, DnsConfig, KubernetesConfig, SoaConfig, TelemetryConfig};
pub use controller::Controller;
pub use error::{DnsError, ResolveError};
pub use handler::{MultiClusterHandler, ResponseAssembler};
pub use resolver::RecordResolver;
pub use server::DnsServer;
pub use state::{ClusterCache, ClusterState, SerialTracker};
