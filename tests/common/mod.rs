//! Shared test infrastructure for the DNS integration tests.

#![allow(dead_code)]

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse, MessageResponseBuilder};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};

use multicluster_dns::error::DnsError;
use multicluster_dns::mcs::ServiceImportType;
use multicluster_dns::object::{
    EndpointAddress, EndpointRecord, EndpointSubset, NamespaceRecord, PortRecord,
    ServiceImportRecord,
};
use multicluster_dns::{ClusterCache, ClusterState, DnsConfig, MultiClusterHandler, ResponseAssembler};

// --- Constants ---

pub const ZONE: &str = "cluster.local.";
pub const CLUSTER_ID: &str = "clusterid";

/// Headless service with [`LARGE_ENDPOINTS`] endpoints.
pub const LARGE_SERVICE: &str = "hdls-large.testns.svc.cluster.local.";
pub const LARGE_ENDPOINTS: usize = 200;

/// Modification time reported by [`FixtureCache`], the expected SOA serial.
pub const MODIFIED: i64 = 1499347823;

/// Namespaces [`FixtureCache`] reports as missing.
const MISSING_NAMESPACES: &[&str] = &["nsnoexist", "pod-nons"];

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// The response is serialized via `MessageResponse::destructive_emit()` and
/// stored as raw wire-format bytes, which can then be parsed with
/// `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(info)
    }
}

// --- Next handler ---

/// Next handler in the chain: counts calls and answers REFUSED.
#[derive(Clone, Default)]
pub struct NextHandler {
    calls: Arc<AtomicUsize>,
}

impl NextHandler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestHandler for NextHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = MessageResponseBuilder::from_message_request(request)
            .error_msg(request.header(), ResponseCode::Refused);
        response_handle
            .send_response(response)
            .await
            .expect("failed to send delegated response")
    }
}

// --- Fixture cache ---

/// Cluster cache over a fixed state.
///
/// Every namespace exists except the ones in [`MISSING_NAMESPACES`], and the
/// modification time is pinned to [`MODIFIED`].
pub struct FixtureCache {
    state: ClusterState,
    synced: bool,
}

impl FixtureCache {
    pub fn synced() -> Self {
        Self {
            state: fixture_state(),
            synced: true,
        }
    }

    pub fn not_synced() -> Self {
        Self {
            state: fixture_state(),
            synced: false,
        }
    }
}

#[async_trait]
impl ClusterCache for FixtureCache {
    fn service_list(&self) -> Vec<Arc<ServiceImportRecord>> {
        self.state.services()
    }

    fn svc_index(&self, key: &str) -> Vec<Arc<ServiceImportRecord>> {
        self.state.services_by_index(key)
    }

    fn endpoints_list(&self) -> Vec<Arc<EndpointRecord>> {
        self.state.endpoints()
    }

    fn ep_index(&self, key: &str) -> Vec<Arc<EndpointRecord>> {
        self.state.endpoints_by_index(key)
    }

    fn namespace_by_name(&self, name: &str) -> Option<Arc<NamespaceRecord>> {
        if MISSING_NAMESPACES.contains(&name) {
            return None;
        }
        Some(Arc::new(NamespaceRecord::new(name)))
    }

    fn has_synced(&self) -> bool {
        self.synced
    }

    fn modified(&self) -> i64 {
        MODIFIED
    }

    async fn run(&self) -> Result<(), DnsError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), DnsError> {
        Ok(())
    }
}

fn cluster_set_ip(name: &str, namespace: &str, ips: &[&str], ports: Vec<PortRecord>) -> ServiceImportRecord {
    ServiceImportRecord {
        cluster_ips: ips.iter().map(|ip| ip.to_string()).collect(),
        ports,
        ..ServiceImportRecord::new(name, namespace, ServiceImportType::ClusterSetIP)
    }
}

fn headless(name: &str, namespace: &str) -> ServiceImportRecord {
    ServiceImportRecord::new(name, namespace, ServiceImportType::Headless)
}

fn endpoints(
    slice: &str,
    namespace: &str,
    service: &str,
    addresses: Vec<EndpointAddress>,
    ports: Vec<PortRecord>,
) -> EndpointRecord {
    EndpointRecord::new(
        slice,
        namespace,
        service,
        CLUSTER_ID,
        vec![EndpointSubset { addresses, ports }],
    )
}

fn http() -> Vec<PortRecord> {
    vec![PortRecord::new("http", "tcp", 80)]
}

/// Services and endpoints of the `testns` and `kube-system` fixtures.
pub fn fixture_state() -> ClusterState {
    let state = ClusterState::new(true);

    state.apply(cluster_set_ip(
        "kubedns",
        "kube-system",
        &["10.0.0.10"],
        vec![PortRecord::new("dns", "udp", 53)],
    ));
    state.apply(cluster_set_ip("svc1", "testns", &["10.0.0.1"], http()));
    state.apply(cluster_set_ip("svcempty", "testns", &["10.0.0.1"], http()));
    state.apply(cluster_set_ip("svc6", "testns", &["1234:abcd::1"], http()));
    state.apply(headless("hdls1", "testns"));
    state.apply(headless("hdlsprtls", "testns"));
    state.apply(headless("hdls-large", "testns"));
    state.apply(cluster_set_ip(
        "svc-dual-stack",
        "testns",
        &["10.0.0.3", "10::3"],
        http(),
    ));

    state.apply(endpoints(
        "kubedns",
        "kube-system",
        "kubedns",
        vec![EndpointAddress::new("172.0.0.100")],
        vec![PortRecord::new("dns", "udp", 53)],
    ));
    state.apply(endpoints(
        "svc1-slice1",
        "testns",
        "svc1",
        vec![EndpointAddress::with_hostname("172.0.0.1", "ep1a")],
        http(),
    ));
    state.apply(endpoints("svcempty-slice1", "testns", "svcempty", Vec::new(), http()));
    state.apply(endpoints(
        "hdls1-slice1",
        "testns",
        "hdls1",
        vec![
            EndpointAddress::new("172.0.0.2"),
            EndpointAddress::new("172.0.0.3"),
            EndpointAddress::with_hostname("172.0.0.4", "dup-name"),
            EndpointAddress::with_hostname("172.0.0.5", "dup-name"),
            EndpointAddress::new("5678:abcd::1"),
            EndpointAddress::new("5678:abcd::2"),
        ],
        http(),
    ));
    state.apply(endpoints(
        "hdlsprtls-slice1",
        "testns",
        "hdlsprtls",
        vec![EndpointAddress::new("172.0.0.20")],
        vec![PortRecord::none()],
    ));
    state.apply(endpoints(
        "hdls-large-slice1",
        "testns",
        "hdls-large",
        (1..=LARGE_ENDPOINTS)
            .map(|i| EndpointAddress::new(&format!("172.1.0.{i}")))
            .collect(),
        http(),
    ));

    state
}

// --- Handler construction ---

pub fn test_dns_config() -> DnsConfig {
    DnsConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..DnsConfig::for_zones([ZONE])
    }
}

/// Build a handler over `cache` that delegates to a fresh [`NextHandler`].
pub fn build_handler(
    config: DnsConfig,
    cache: FixtureCache,
) -> (MultiClusterHandler<NextHandler>, NextHandler) {
    let assembler =
        ResponseAssembler::new(&config, Arc::new(cache)).expect("failed to create assembler");
    let next = NextHandler::default();
    (MultiClusterHandler::new(assembler, next.clone()), next)
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    build_query(name, record_type, id).to_vec().unwrap()
}

/// Build wire-format bytes for a DNS query with an OPT record.
pub fn build_edns_query_bytes(
    name: &str,
    record_type: RecordType,
    id: u16,
    max_payload: u16,
    version: u8,
) -> Vec<u8> {
    let mut edns = Edns::new();
    edns.set_max_payload(max_payload);
    edns.set_version(version);
    let mut msg = build_query(name, record_type, id);
    msg.set_edns(edns);
    msg.to_vec().unwrap()
}

fn build_query(name: &str, record_type: RecordType, id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` from wire bytes sent by a local client.
pub fn build_request(bytes: &[u8]) -> Request {
    let msg = parse_message_request(bytes);
    let src = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 12345);
    Request::new(msg, src, Protocol::Udp)
}

/// Run a query through `handler` and return the parsed response.
pub async fn execute_query<H: RequestHandler>(
    handler: &H,
    name: &str,
    record_type: RecordType,
) -> Message {
    execute_raw_query(handler, &build_query_bytes(name, record_type, 4242)).await
}

/// Run a query given as wire bytes through `handler`.
pub async fn execute_raw_query<H: RequestHandler>(handler: &H, bytes: &[u8]) -> Message {
    let request = build_request(bytes);
    let response = TestResponseHandler::new();
    handler.handle_request(&request, response.clone()).await;
    response.into_message()
}

// --- Response helpers ---

/// A addresses in the answer section, sorted.
pub fn extract_a_ips(msg: &Message) -> Vec<Ipv4Addr> {
    let mut ips: Vec<Ipv4Addr> = msg
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(Ipv4Addr::from(*a)),
            _ => None,
        })
        .collect();
    ips.sort();
    ips
}

/// AAAA addresses in the answer section, sorted.
pub fn extract_aaaa_ips(msg: &Message) -> Vec<Ipv6Addr> {
    let mut ips: Vec<Ipv6Addr> = msg
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::AAAA(aaaa) => Some(Ipv6Addr::from(*aaaa)),
            _ => None,
        })
        .collect();
    ips.sort();
    ips
}

/// `(priority, weight, port, target)` of every SRV answer, sorted.
pub fn extract_srv(msg: &Message) -> Vec<(u16, u16, u16, String)> {
    let mut srv: Vec<_> = msg
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::SRV(srv) => Some((
                srv.priority(),
                srv.weight(),
                srv.port(),
                srv.target().to_string(),
            )),
            _ => None,
        })
        .collect();
    srv.sort();
    srv
}

/// `(owner, address)` of every additional A/AAAA record, sorted.
pub fn extract_extras(msg: &Message) -> Vec<(String, IpAddr)> {
    let mut extras: Vec<_> = msg
        .additionals()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some((r.name().to_string(), IpAddr::V4(Ipv4Addr::from(*a)))),
            RData::AAAA(aaaa) => Some((r.name().to_string(), IpAddr::V6(Ipv6Addr::from(*aaaa)))),
            _ => None,
        })
        .collect();
    extras.sort();
    extras
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Assert the authority section holds exactly the fixture SOA of `zone`.
pub fn assert_soa(msg: &Message, zone: &str) {
    let authority = msg.name_servers();
    assert_eq!(authority.len(), 1, "expected one SOA, got {authority:?}");

    let record = &authority[0];
    assert_eq!(record.name().to_string(), zone);
    assert_eq!(record.ttl(), 5);

    let RData::SOA(soa) = record.data() else {
        panic!("expected SOA, got {:?}", record.data());
    };
    assert_soa_fields(soa, zone);
}

/// Assert the fields of an SOA built for `zone` with default timers.
pub fn assert_soa_fields(soa: &SOA, zone: &str) {
    assert_eq!(soa.mname().to_string(), format!("ns.dns.{zone}"));
    assert_eq!(soa.rname().to_string(), format!("hostmaster.{zone}"));
    assert_eq!(soa.serial(), MODIFIED as u32);
    assert_eq!(soa.refresh(), 7200);
    assert_eq!(soa.retry(), 1800);
    assert_eq!(soa.expire(), 86400);
    assert_eq!(soa.minimum(), 5);
}

/// Assert an authoritative NXDOMAIN carrying the zone SOA.
pub fn assert_nxdomain(msg: &Message) {
    assert_response_code(msg, ResponseCode::NXDomain);
    assert!(msg.header().authoritative());
    assert!(msg.answers().is_empty());
    assert_soa(msg, ZONE);
}

/// Assert an authoritative empty NOERROR carrying the zone SOA.
pub fn assert_nodata(msg: &Message) {
    assert_response_code(msg, ResponseCode::NoError);
    assert!(msg.header().authoritative());
    assert!(msg.answers().is_empty(), "unexpected answers {:?}", msg.answers());
    assert_soa(msg, ZONE);
}
