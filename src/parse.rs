//! Query name parsing.
//!
//! Three shapes are understood below a zone:
//!
//! ```text
//! _port._protocol.service.namespace.svc.<zone>
//! endpoint.cluster.service.namespace.svc.<zone>
//! service.namespace.svc.<zone>
//! ```
//!
//! `pod` is accepted in place of `svc`.

use std::fmt;

use crate::error::ResolveError;

/// Scope label for services.
pub const SVC: &str = "svc";

/// Scope label for pods.
pub const POD: &str = "pod";

/// Value of port and protocol when the query does not name them.
pub const ANY: &str = "*";

/// Scope of a query, the label right below the zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scope {
    /// Apex queries.
    #[default]
    Unset,
    /// `svc`
    Svc,
    /// `pod`
    Pod,
}

impl Scope {
    /// Label text, empty when unset.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Unset => "",
            Scope::Svc => SVC,
            Scope::Pod => POD,
        }
    }
}

/// A query name split into its parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedQuery {
    /// Named port of an SRV query, [`ANY`] otherwise.
    pub port: String,
    /// Protocol of an SRV query, [`ANY`] otherwise.
    pub protocol: String,
    /// Cluster id of an endpoint query.
    pub cluster: String,
    /// Endpoint hostname of an endpoint query.
    pub endpoint: String,
    /// Service name.
    pub service: String,
    /// Namespace.
    pub namespace: String,
    /// `svc` or `pod`, unset for apex queries.
    pub scope: Scope,
}

impl ParsedQuery {
    /// True for the zone itself and the bare `svc`/`pod` names.
    pub fn is_apex(&self) -> bool {
        self.scope == Scope::Unset
    }
}

impl fmt::Display for ParsedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}.{}.{}",
            self.port,
            self.protocol,
            self.endpoint,
            self.cluster,
            self.service,
            self.namespace,
            self.scope.as_str()
        )
    }
}

/// Parse `name` relative to `zone`.
///
/// Both are compared case-insensitively and may omit the trailing dot. A
/// name outside `zone` parses as an apex query.
pub fn parse_request(name: &str, zone: &str) -> Result<ParsedQuery, ResolveError> {
    let base = trim_zone(name, zone);
    if base.is_empty() || base == SVC || base == POD {
        return Ok(ParsedQuery::default());
    }

    let mut labels = base.rsplit('.');
    let mut query = ParsedQuery {
        port: ANY.to_string(),
        protocol: ANY.to_string(),
        ..Default::default()
    };

    query.scope = match labels.next() {
        Some(SVC) => Scope::Svc,
        Some(POD) => Scope::Pod,
        _ => return Err(ResolveError::InvalidRequest),
    };

    let Some(namespace) = labels.next() else {
        return Ok(query);
    };
    query.namespace = namespace.to_string();

    let Some(service) = labels.next() else {
        return Ok(query);
    };
    query.service = service.to_string();

    let rest: Vec<&str> = labels.collect();
    match rest.as_slice() {
        [] => Ok(query),
        // Read right to left: `rest[0]` is the label next to the service.
        [right, left] => {
            if right.starts_with('_') {
                query.port = strip_underscore(left).to_string();
                query.protocol = strip_underscore(right).to_string();
            } else {
                query.endpoint = strip_underscore(left).to_string();
                query.cluster = strip_underscore(right).to_string();
            }
            Ok(query)
        }
        _ => Err(ResolveError::InvalidRequest),
    }
}

/// Lower-cased `name` without the `zone` suffix and the joining dot.
fn trim_zone(name: &str, zone: &str) -> String {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    let zone = zone.trim_end_matches('.').to_ascii_lowercase();

    if zone.is_empty() {
        return name;
    }
    if name == zone {
        return String::new();
    }
    match name.strip_suffix(&zone) {
        Some(head) if head.ends_with('.') => head[..head.len() - 1].to_string(),
        _ => String::new(),
    }
}

fn strip_underscore(label: &str) -> &str {
    label.strip_prefix('_').unwrap_or(label)
}
