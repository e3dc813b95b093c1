//! Cached projections of the watched Kubernetes objects.
//!
//! Only the fields needed to answer queries are kept. Conversions never
//! fail, missing fields become empty.

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;

use crate::mcs::{ServiceImport, ServiceImportType};

/// Label carrying the name of the imported service on an EndpointSlice.
pub const LABEL_SERVICE_NAME: &str = "multicluster.kubernetes.io/service-name";

/// Label carrying the id of the cluster an EndpointSlice was exported from.
pub const LABEL_SOURCE_CLUSTER: &str = "multicluster.kubernetes.io/source-cluster";

/// Port number recorded for a slice that declares no ports.
pub const NO_PORT: i32 = -1;

/// Index key for a service import: `service.namespace`.
pub fn service_key(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}")
}

/// Index key for endpoint records: `service.namespace`.
pub fn endpoints_key(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}")
}

/// A port of a service import or an endpoint subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    /// Port name, may be empty.
    pub name: String,
    /// Protocol as reported by the API (`TCP`, `UDP`).
    pub protocol: String,
    /// Port number, [`NO_PORT`] for none.
    pub port: i32,
}

impl PortRecord {
    /// Create a port.
    pub fn new(name: &str, protocol: &str, port: i32) -> Self {
        Self {
            name: name.to_string(),
            protocol: protocol.to_string(),
            port,
        }
    }

    /// The placeholder port of a slice without ports.
    pub fn none() -> Self {
        Self::new("", "", NO_PORT)
    }
}

/// A service imported into this cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceImportRecord {
    /// Service name.
    pub name: String,
    /// Service namespace.
    pub namespace: String,
    /// `service.namespace`
    pub index: String,
    /// ClusterSetIP or Headless.
    pub kind: ServiceImportType,
    /// Cluster set IPs, in API order.
    pub cluster_ips: Vec<String>,
    /// Exposed ports.
    pub ports: Vec<PortRecord>,
    /// Resource version of the source object.
    pub resource_version: String,
}

impl ServiceImportRecord {
    /// Create a record with an empty resource version.
    pub fn new(name: &str, namespace: &str, kind: ServiceImportType) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            index: service_key(name, namespace),
            kind,
            cluster_ips: Vec::new(),
            ports: Vec::new(),
            resource_version: String::new(),
        }
    }

    /// Project a `ServiceImport`.
    pub fn from_resource(import: &ServiceImport) -> Self {
        let name = import.name_any();
        let namespace = import.namespace().unwrap_or_default();
        let ports = import
            .spec
            .ports
            .iter()
            .map(|p| PortRecord::new(&p.name, &p.protocol, p.port))
            .collect();

        Self {
            index: service_key(&name, &namespace),
            name,
            namespace,
            kind: import.spec.type_,
            cluster_ips: import.spec.ips.clone(),
            ports,
            resource_version: import.resource_version().unwrap_or_default(),
        }
    }

    /// Store key: `namespace/name`.
    pub fn object_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// True for headless imports.
    pub fn is_headless(&self) -> bool {
        self.kind == ServiceImportType::Headless
    }
}

/// One address of an endpoint subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    /// IPv4 or IPv6 address.
    pub ip: String,
    /// Explicit hostname of the endpoint.
    pub hostname: Option<String>,
}

impl EndpointAddress {
    /// An address without hostname.
    pub fn new(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            hostname: None,
        }
    }

    /// An address with an explicit hostname.
    pub fn with_hostname(ip: &str, hostname: &str) -> Self {
        Self {
            hostname: Some(hostname.to_string()),
            ..Self::new(ip)
        }
    }

    /// The label this address answers to under `<cluster>.<service>...`.
    ///
    /// The explicit hostname when set, otherwise the IP with its separators
    /// replaced by dashes (`10-0-0-1`, `fd00--1`).
    pub fn endpoint_hostname(&self) -> String {
        if let Some(hostname) = self.hostname.as_deref().filter(|h| !h.is_empty()) {
            return hostname.to_string();
        }
        if self.ip.contains('.') {
            return self.ip.replace('.', "-");
        }
        if self.ip.contains(':') {
            return self.ip.replace(':', "-");
        }
        String::new()
    }
}

/// Addresses sharing one port set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSubset {
    /// Ready addresses.
    pub addresses: Vec<EndpointAddress>,
    /// Ports served by every address.
    pub ports: Vec<PortRecord>,
}

/// The ready endpoints a member cluster exports for a service.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointRecord {
    /// Slice name.
    pub name: String,
    /// Slice namespace.
    pub namespace: String,
    /// `service.namespace`, from the service-name label.
    pub index: String,
    /// Exporting cluster, from the source-cluster label.
    pub cluster_id: String,
    /// Address groups.
    pub subsets: Vec<EndpointSubset>,
    /// Resource version of the source object.
    pub resource_version: String,
}

impl EndpointRecord {
    /// Create a record for a slice of `service` exported by `cluster_id`.
    pub fn new(
        name: &str,
        namespace: &str,
        service: &str,
        cluster_id: &str,
        subsets: Vec<EndpointSubset>,
    ) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            index: endpoints_key(service, namespace),
            cluster_id: cluster_id.to_string(),
            subsets,
            resource_version: String::new(),
        }
    }

    /// Project an EndpointSlice into a single subset.
    ///
    /// Endpoints whose ready condition is false are dropped, a missing
    /// condition counts as ready. A slice without ports gets [`NO_PORT`].
    pub fn from_slice(slice: &EndpointSlice) -> Self {
        let labels = slice.labels();
        let namespace = slice.namespace().unwrap_or_default();
        let service = labels.get(LABEL_SERVICE_NAME).cloned().unwrap_or_default();
        let cluster_id = labels
            .get(LABEL_SOURCE_CLUSTER)
            .cloned()
            .unwrap_or_default();

        let ports = match slice.ports.as_deref() {
            None | Some([]) => vec![PortRecord::none()],
            Some(ports) => ports
                .iter()
                .map(|p| PortRecord {
                    name: p.name.clone().unwrap_or_default(),
                    protocol: p.protocol.clone().unwrap_or_default(),
                    port: p.port.unwrap_or(NO_PORT),
                })
                .collect(),
        };

        let mut addresses = Vec::new();
        for endpoint in &slice.endpoints {
            let ready = endpoint
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true);
            if !ready {
                continue;
            }

            for ip in &endpoint.addresses {
                addresses.push(EndpointAddress {
                    ip: ip.clone(),
                    hostname: endpoint.hostname.clone(),
                });
            }
        }

        Self {
            name: slice.name_any(),
            index: endpoints_key(&service, &namespace),
            namespace,
            cluster_id,
            subsets: vec![EndpointSubset { addresses, ports }],
            resource_version: slice.resource_version().unwrap_or_default(),
        }
    }

    /// Store key: `namespace/name`.
    pub fn object_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether `other` would resolve to exactly the same records.
    ///
    /// Subsets are compared position by position. Slice name and resource
    /// version are ignored.
    pub fn equivalent(&self, other: &EndpointRecord) -> bool {
        if self.cluster_id != other.cluster_id || self.subsets.len() != other.subsets.len() {
            return false;
        }

        self.subsets.iter().zip(&other.subsets).all(|(a, b)| {
            a.addresses.len() == b.addresses.len()
                && a.ports.len() == b.ports.len()
                && a
                    .addresses
                    .iter()
                    .zip(&b.addresses)
                    .all(|(x, y)| x.ip == y.ip && x.hostname == y.hostname)
                && a.ports.iter().zip(&b.ports).all(|(x, y)| x == y)
        })
    }
}

/// A namespace. Presence in the cache means its services are exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRecord {
    /// Namespace name.
    pub name: String,
    /// Resource version of the source object.
    pub resource_version: String,
}

impl NamespaceRecord {
    /// Create a record with an empty resource version.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            resource_version: String::new(),
        }
    }

    /// Project a `Namespace`.
    pub fn from_namespace(namespace: &Namespace) -> Self {
        Self {
            name: namespace.name_any(),
            resource_version: namespace.resource_version().unwrap_or_default(),
        }
    }
}
