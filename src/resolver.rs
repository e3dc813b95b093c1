//! Record resolution against the cluster state.

use std::sync::Arc;
use tracing::trace;

use crate::error::ResolveError;
use crate::object::{endpoints_key, service_key};
use crate::parse::{parse_request, ParsedQuery, ANY, SVC};
use crate::state::ClusterCache;

/// Prefix of record keys.
pub const KEY_PREFIX: &str = "c";

/// One resolved address/port pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// IP address, textual.
    pub host: String,
    /// Port, [`crate::object::NO_PORT`] when the endpoint declares none.
    pub port: i32,
    /// TTL in seconds.
    pub ttl: u32,
    /// Stable key, see [`zone_path`] and [`key_to_domain`].
    pub key: String,
}

/// Key path of a zone: the prefix followed by the zone labels in reverse,
/// e.g. `/c/local/cluster` for `cluster.local.`.
pub fn zone_path(zone: &str) -> String {
    let mut path = format!("/{KEY_PREFIX}");
    for label in zone.trim_end_matches('.').rsplit('.').filter(|l| !l.is_empty()) {
        path.push('/');
        path.push_str(label);
    }
    path
}

/// Turn a record key back into a fully qualified domain name, dropping the
/// prefix: `/c/local/cluster/svc/ns/web` becomes `web.ns.svc.cluster.local.`.
pub fn key_to_domain(key: &str) -> String {
    let labels: Vec<&str> = key
        .trim_matches('/')
        .split('/')
        .skip(1)
        .collect();

    let mut domain = labels.into_iter().rev().collect::<Vec<_>>().join(".");
    domain.push('.');
    domain
}

/// True for names under `in-addr.arpa.` or `ip6.arpa.`.
pub fn is_reverse(name: &str) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    name.ends_with("in-addr.arpa") || name.ends_with("ip6.arpa")
}

fn matches(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn is_wildcard(s: &str) -> bool {
    s.is_empty() || s == ANY
}

/// Match a port and protocol from the query against a candidate.
/// Empty and `*` on the query side match anything.
pub fn match_port_and_protocol(
    query_port: &str,
    port: &str,
    query_protocol: &str,
    protocol: &str,
) -> bool {
    (is_wildcard(query_port) || matches(query_port, port))
        && (is_wildcard(query_protocol) || matches(query_protocol, protocol))
}

/// Resolves query names to [`ServiceRecord`]s.
#[derive(Clone)]
pub struct RecordResolver {
    cache: Arc<dyn ClusterCache>,
    ttl: u32,
}

impl RecordResolver {
    /// Create a resolver stamping records with `ttl`.
    pub fn new(cache: Arc<dyn ClusterCache>, ttl: u32) -> Self {
        Self { cache, ttl }
    }

    /// Records for `name` in `zone`.
    ///
    /// Apex queries resolve to nothing without error. Reverse names and
    /// unexposed namespaces are name errors.
    pub fn records(&self, name: &str, zone: &str) -> Result<Vec<ServiceRecord>, ResolveError> {
        let query = parse_request(name, zone)?;
        if query.is_apex() {
            return Ok(Vec::new());
        }

        if is_reverse(name) {
            return Err(ResolveError::NoItems);
        }

        if !self.namespace_exists(&query.namespace) {
            return Err(ResolveError::NamespaceNotExposed);
        }

        self.find_services(&query, zone)
    }

    /// Match a parsed query against the cached services and endpoints.
    ///
    /// The error stays [`ResolveError::NoItems`] until some candidate passes
    /// the port filter. For ClusterSetIP imports that clears it even if the
    /// import has no IPs.
    pub fn find_services(
        &self,
        query: &ParsedQuery,
        zone: &str,
    ) -> Result<Vec<ServiceRecord>, ResolveError> {
        if !self.namespace_exists(&query.namespace) {
            return Err(ResolveError::NoItems);
        }

        if query.service.is_empty() {
            return Ok(Vec::new());
        }

        let key = service_key(&query.service, &query.namespace);
        let zone_path = zone_path(zone);
        let mut endpoints = None;
        let mut records = Vec::new();
        let mut found = false;

        for svc in self.cache.svc_index(&key) {
            if !(matches(&query.namespace, &svc.namespace) && matches(&query.service, &svc.name)) {
                continue;
            }

            if svc.is_headless() || !query.endpoint.is_empty() {
                let endpoints = endpoints.get_or_insert_with(|| self.cache.ep_index(&key));
                let index = endpoints_key(&svc.name, &svc.namespace);

                for ep in endpoints.iter().filter(|ep| ep.index == index) {
                    for subset in &ep.subsets {
                        for addr in &subset.addresses {
                            let hostname = addr.endpoint_hostname();
                            if !query.endpoint.is_empty()
                                && !(matches(&query.cluster, &ep.cluster_id)
                                    && matches(&query.endpoint, &hostname))
                            {
                                continue;
                            }

                            for port in &subset.ports {
                                if !match_port_and_protocol(
                                    &query.port,
                                    &port.name,
                                    &query.protocol,
                                    &port.protocol,
                                ) {
                                    continue;
                                }

                                found = true;
                                records.push(ServiceRecord {
                                    host: addr.ip.clone(),
                                    port: port.port,
                                    ttl: self.ttl,
                                    key: format!(
                                        "{zone_path}/{SVC}/{}/{}/{}/{hostname}",
                                        svc.namespace, svc.name, ep.cluster_id
                                    ),
                                });
                            }
                        }
                    }
                }
                continue;
            }

            for port in &svc.ports {
                if !match_port_and_protocol(&query.port, &port.name, &query.protocol, &port.protocol)
                {
                    continue;
                }

                found = true;
                for ip in &svc.cluster_ips {
                    records.push(ServiceRecord {
                        host: ip.clone(),
                        port: port.port,
                        ttl: self.ttl,
                        key: format!("{zone_path}/{SVC}/{}/{}", svc.namespace, svc.name),
                    });
                }
            }
        }

        trace!(query = %query, records = records.len(), found, "find services");

        if found {
            Ok(records)
        } else {
            Err(ResolveError::NoItems)
        }
    }

    fn namespace_exists(&self, namespace: &str) -> bool {
        self.cache.namespace_by_name(namespace).is_some()
    }
}
