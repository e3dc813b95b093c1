//! Query handling: zone matching, record dispatch and response codes.
//!
//! [`ResponseAssembler`] decides what a question is answered with.
//! [`MultiClusterHandler`] wraps it in a hickory [`RequestHandler`] and hands
//! everything it does not answer to the next handler in the chain.

use async_trait::async_trait;
use hickory_proto::op::{Edns, Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{Name, Record, RecordType};
use hickory_server::authority::{Catalog, MessageResponseBuilder};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::config::{DnsConfig, SoaConfig};
use crate::error::{DnsError, ResolveError};
use crate::metrics::{self, QueryResult, Timer};
use crate::records::{
    address_records, dns_version_record, ns_host, ns_records, soa_record, srv_records,
    DNS_VERSION_LABEL,
};
use crate::resolver::RecordResolver;
use crate::state::{ClusterCache, SerialTracker};

/// What to do with a question.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Not ours to answer, pass it on.
    Delegate,
    /// Answer with this reply.
    Respond(Reply),
}

/// Sections and flags of a response.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Response code.
    pub rcode: ResponseCode,
    /// AA bit.
    pub authoritative: bool,
    /// Answer section.
    pub answers: Vec<Record>,
    /// Address records of SRV targets.
    pub additionals: Vec<Record>,
    /// SOA of the zone on negative and not-ready responses.
    pub authority: Vec<Record>,
    /// Error behind a SERVFAIL or NXDOMAIN, kept for logging.
    pub error: Option<ResolveError>,
}

impl Reply {
    fn answer(answers: Vec<Record>, additionals: Vec<Record>) -> Self {
        Self {
            rcode: ResponseCode::NoError,
            authoritative: true,
            answers,
            additionals,
            authority: Vec::new(),
            error: None,
        }
    }

    fn server_failure(error: ResolveError) -> Self {
        Self {
            rcode: ResponseCode::ServFail,
            authoritative: false,
            answers: Vec::new(),
            additionals: Vec::new(),
            authority: Vec::new(),
            error: Some(error),
        }
    }

    /// Classification used for query metrics.
    pub fn query_result(&self) -> QueryResult {
        match self.rcode {
            ResponseCode::NXDomain => QueryResult::NxDomain,
            ResponseCode::ServFail => match &self.error {
                Some(e) if e.is_name_error() => QueryResult::NotReady,
                _ => QueryResult::Error,
            },
            _ if self.answers.is_empty() => QueryResult::NoData,
            _ => QueryResult::Success,
        }
    }
}

/// EDNS version understood by this server.
const EDNS_VERSION: u8 = 0;

/// Smallest UDP payload size a response is limited to.
const MIN_UDP_PAYLOAD: u16 = 512;

type Answer = Result<(Vec<Record>, Vec<Record>), ResolveError>;

fn parse_zone(zone: &str) -> Result<Name, DnsError> {
    let mut name = Name::from_ascii(zone)
        .map_err(|e| DnsError::InvalidZone(format!("{zone}: {e}")))?
        .to_lowercase();
    name.set_fqdn(true);
    Ok(name)
}

fn internal(e: impl std::fmt::Display) -> ResolveError {
    ResolveError::Internal(e.to_string())
}

/// Maps resolver results onto DNS answers and response codes.
pub struct ResponseAssembler {
    zones: Vec<Name>,
    fallthrough: Vec<Name>,
    resolver: RecordResolver,
    cache: Arc<dyn ClusterCache>,
    serial: SerialTracker,
    ttl: u32,
    soa: SoaConfig,
}

impl ResponseAssembler {
    /// Create an assembler for the configured zones over `cache`.
    pub fn new(config: &DnsConfig, cache: Arc<dyn ClusterCache>) -> Result<Self, DnsError> {
        if config.zones.is_empty() {
            return Err(DnsError::Config("at least one zone is required".to_string()));
        }

        let zones = config
            .zones
            .iter()
            .map(|z| parse_zone(z))
            .collect::<Result<Vec<_>, _>>()?;
        let fallthrough = config
            .fallthrough
            .iter()
            .map(|z| parse_zone(z))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            zones,
            fallthrough,
            resolver: RecordResolver::new(cache.clone(), config.ttl),
            serial: SerialTracker::new(cache.clone()),
            cache,
            ttl: config.ttl,
            soa: config.soa.clone(),
        })
    }

    /// Longest configured zone containing `name`.
    pub fn zone_for(&self, name: &Name) -> Option<&Name> {
        self.zones
            .iter()
            .filter(|zone| zone.zone_of(name))
            .max_by_key(|zone| zone.num_labels())
    }

    /// True if negative answers for `name` go to the next handler.
    pub fn falls_through(&self, name: &Name) -> bool {
        self.fallthrough.iter().any(|zone| zone.zone_of(name))
    }

    /// Decide how to answer `name`/`record_type`.
    pub fn assemble(&self, name: &Name, record_type: RecordType) -> Outcome {
        let Some(matched) = self.zone_for(name) else {
            trace!(%name, "no matching zone");
            return Outcome::Delegate;
        };
        // Keep the case of the question in the zone owner name.
        let zone = name.trim_to(matched.num_labels() as usize);
        let is_apex = name.num_labels() == zone.num_labels();

        let answer = match record_type {
            RecordType::A | RecordType::AAAA => self.addresses(name, &zone, record_type),
            RecordType::TXT => self.txt(name, &zone),
            RecordType::SRV => self.srv(name, &zone),
            RecordType::SOA if is_apex => soa_record(&zone, self.serial.serial(), self.ttl, &self.soa)
                .map(|soa| (vec![soa], Vec::new()))
                .map_err(internal),
            RecordType::SOA => Ok((Vec::new(), Vec::new())),
            RecordType::NS if is_apex => self.nameservers(&zone),
            // Classify NXDOMAIN against NODATA with an A lookup.
            _ => self
                .addresses(name, &zone, RecordType::A)
                .map(|_| (Vec::new(), Vec::new())),
        };

        match answer {
            Err(e) if e.is_name_error() => {
                if self.falls_through(name) {
                    debug!(%name, error = %e, "falling through");
                    return Outcome::Delegate;
                }
                let rcode = if self.cache.has_synced() {
                    ResponseCode::NXDomain
                } else {
                    ResponseCode::ServFail
                };
                Outcome::Respond(self.negative(rcode, &zone, Some(e)))
            }
            Err(e) => Outcome::Respond(Reply::server_failure(e)),
            Ok((answers, _)) if answers.is_empty() => {
                Outcome::Respond(self.negative(ResponseCode::NoError, &zone, None))
            }
            Ok((answers, additionals)) => Outcome::Respond(Reply::answer(answers, additionals)),
        }
    }

    fn addresses(&self, name: &Name, zone: &Name, record_type: RecordType) -> Answer {
        let services = self.resolver.records(&name.to_string(), &zone.to_string())?;
        Ok((address_records(&services, name, record_type)?, Vec::new()))
    }

    /// The zone's nameserver is looked up like any other name under it.
    fn nameservers(&self, zone: &Name) -> Answer {
        let host = ns_host(zone).map_err(internal)?;
        let services = self.resolver.records(&host.to_string(), &zone.to_string())?;
        ns_records(&services, zone, &host)
    }

    fn srv(&self, name: &Name, zone: &Name) -> Answer {
        let services = self.resolver.records(&name.to_string(), &zone.to_string())?;
        srv_records(&services, name)
    }

    fn txt(&self, name: &Name, zone: &Name) -> Answer {
        let is_version = name.num_labels() == zone.num_labels() + 1
            && name
                .iter()
                .next()
                .is_some_and(|label| label.eq_ignore_ascii_case(DNS_VERSION_LABEL.as_bytes()));
        if is_version {
            return Ok((vec![dns_version_record(name)], Vec::new()));
        }

        // NODATA if the name exists for another type, NXDOMAIN otherwise.
        let services = self
            .resolver
            .records(&name.to_string(), &zone.to_string())
            .unwrap_or_default();
        if services.is_empty() {
            Err(ResolveError::NoItems)
        } else {
            Ok((Vec::new(), Vec::new()))
        }
    }

    fn negative(&self, rcode: ResponseCode, zone: &Name, error: Option<ResolveError>) -> Reply {
        let authority = match soa_record(zone, self.serial.serial(), self.ttl, &self.soa) {
            Ok(soa) => vec![soa],
            Err(e) => {
                warn!(%zone, error = %e, "failed to build SOA record");
                Vec::new()
            }
        };

        Reply {
            rcode,
            authoritative: true,
            answers: Vec::new(),
            additionals: Vec::new(),
            authority,
            error,
        }
    }
}

/// Request handler answering for the cluster zones, backed by `next`.
pub struct MultiClusterHandler<N = Catalog> {
    assembler: ResponseAssembler,
    next: N,
}

impl<N: RequestHandler> MultiClusterHandler<N> {
    /// Create a handler delegating unanswered questions to `next`.
    pub fn new(assembler: ResponseAssembler, next: N) -> Self {
        Self { assembler, next }
    }

    /// The assembler behind this handler.
    pub fn assembler(&self) -> &ResponseAssembler {
        &self.assembler
    }
}

/// Response OPT record for a request carrying `request_edns`.
///
/// The advertised payload size is kept so that UDP responses are truncated
/// to what the client accepts.
fn response_edns(request_edns: &Edns) -> Edns {
    let mut edns = Edns::new();
    edns.set_max_payload(request_edns.max_payload().max(MIN_UDP_PAYLOAD));
    edns.set_version(EDNS_VERSION);
    edns
}

async fn send_bad_version<R: ResponseHandler>(
    response_handle: &mut R,
    request: &Request,
    mut edns: Edns,
) -> ResponseInfo {
    let mut header = Header::response_from_request(request.header());
    header.set_response_code(ResponseCode::BADVERS);
    edns.set_rcode_high(ResponseCode::BADVERS.high());

    let mut builder = MessageResponseBuilder::from_message_request(request);
    builder.edns(edns);

    response_handle
        .send_response(builder.build_no_records(header))
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to send DNS response");
            header.into()
        })
}

async fn send<R: ResponseHandler>(
    response_handle: &mut R,
    request: &Request,
    header: Header,
    edns: Option<Edns>,
    reply: &Reply,
) -> ResponseInfo {
    let mut builder = MessageResponseBuilder::from_message_request(request);
    if let Some(edns) = edns {
        builder.edns(edns);
    }

    let response = builder.build(
        header,
        reply.answers.iter(),
        std::iter::empty(),
        reply.authority.iter(),
        reply.additionals.iter(),
    );

    response_handle
        .send_response(response)
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to send DNS response");
            header.into()
        })
}

#[async_trait]
impl<N: RequestHandler> RequestHandler for MultiClusterHandler<N> {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let timer = Timer::start();

        if request.header().message_type() != MessageType::Query
            || request.header().op_code() != OpCode::Query
        {
            return self.next.handle_request(request, response_handle).await;
        }

        let info = match request.request_info() {
            Ok(info) => info,
            Err(e) => {
                debug!(error = %e, "malformed request");
                let response = MessageResponseBuilder::from_message_request(request)
                    .error_msg(request.header(), ResponseCode::FormErr);
                return response_handle
                    .send_response(response)
                    .await
                    .unwrap_or_else(|e| {
                        error!(error = %e, "failed to send DNS response");
                        Header::response_from_request(request.header()).into()
                    });
            }
        };

        let query = info.query.original();
        let record_type = query.query_type();
        let rtype_str = record_type.to_string();
        trace!(name = %query.name(), rtype = %rtype_str, src = %info.src, "DNS query");

        let reply = match self.assembler.assemble(query.name(), record_type) {
            Outcome::Delegate => {
                metrics::record_query(&rtype_str, QueryResult::Delegated, timer.elapsed());
                return self.next.handle_request(request, response_handle).await;
            }
            Outcome::Respond(reply) => reply,
        };

        let edns = request.edns().map(response_edns);
        if let Some(version) = request.edns().map(Edns::version) {
            if version > EDNS_VERSION {
                warn!(version, "unsupported EDNS version");
                metrics::record_query(&rtype_str, QueryResult::Error, timer.elapsed());
                return send_bad_version(
                    &mut response_handle,
                    request,
                    edns.unwrap_or_default(),
                )
                .await;
            }
        }

        match &reply.error {
            Some(e) if !e.is_name_error() => {
                error!(name = %query.name(), rtype = %rtype_str, error = %e, "lookup failed");
            }
            Some(e) => {
                debug!(name = %query.name(), rtype = %rtype_str, rcode = %reply.rcode, error = %e, "negative answer");
            }
            None => {
                debug!(name = %query.name(), rtype = %rtype_str, answers = reply.answers.len(), "answer");
            }
        }

        let result = reply.query_result();
        if result == QueryResult::Success {
            metrics::record_answers_returned(reply.answers.len());
        }
        metrics::record_query(&rtype_str, result, timer.elapsed());

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(reply.authoritative);
        header.set_response_code(reply.rcode);

        send(&mut response_handle, request, header, edns, &reply).await
    }
}
