//! The `ServiceImport` resource of the Multi-Cluster Services API
//! (`multicluster.x-k8s.io/v1alpha1`).

use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Spec of a `ServiceImport`: a service merged across the member clusters
/// of a cluster set.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "multicluster.x-k8s.io",
    version = "v1alpha1",
    kind = "ServiceImport",
    namespaced,
    status = "ServiceImportStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceImportSpec {
    /// Ports exposed by the imported service.
    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// Cluster set IPs. May hold one address per family.
    #[serde(default, rename = "ips")]
    pub ips: Vec<String>,

    /// ClusterSetIP or Headless.
    #[serde(default, rename = "type")]
    pub type_: ServiceImportType,

    /// Session affinity, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_affinity: Option<String>,
}

/// A named port of a `ServiceImport`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    /// Port name, the `_port` label of an SRV query.
    #[serde(default)]
    pub name: String,
    /// TCP, UDP or SCTP.
    #[serde(default)]
    pub protocol: String,
    /// Application protocol hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,
    /// Port number.
    pub port: i32,
}

/// How a `ServiceImport` is addressed.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ServiceImportType {
    /// Resolves to the cluster set IPs.
    #[default]
    ClusterSetIP,
    /// Resolves directly to the backing endpoint addresses.
    Headless,
}

/// Status of a `ServiceImport`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceImportStatus {
    /// Clusters currently exporting the service.
    #[serde(default)]
    pub clusters: Vec<ClusterStatus>,
}

/// One exporting cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterStatus {
    /// Cluster id.
    pub cluster: String,
}
