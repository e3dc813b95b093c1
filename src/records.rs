//! DNS record synthesis from resolved [`ServiceRecord`]s.

use hickory_proto::rr::rdata::{A, AAAA, NS, SOA, SRV, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::ProtoError;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::config::SoaConfig;
use crate::error::ResolveError;
use crate::object::NO_PORT;
use crate::resolver::{key_to_domain, ServiceRecord};

/// Schema version served at `dns-version.<zone>`.
pub const DNS_SCHEMA_VERSION: &str = "1.1.0";

/// TTL of the schema version record.
pub const DNS_VERSION_TTL: u32 = 28800;

/// Label of the schema version record.
pub const DNS_VERSION_LABEL: &str = "dns-version";

/// Upper bound on the TTL of the SOA record itself.
const MAX_SOA_TTL: u32 = 300;

fn make_record(name: Name, ttl: u32, rdata: RData) -> Record {
    let mut record = Record::from_rdata(name, ttl, rdata);
    record.set_dns_class(DNSClass::IN);
    record
}

fn parse_host(host: &str) -> Result<IpAddr, ResolveError> {
    host.parse()
        .map_err(|_| ResolveError::Internal(format!("invalid address {host:?}")))
}

fn address_rdata(ip: IpAddr) -> RData {
    match ip {
        IpAddr::V4(v4) => RData::A(A::from(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA::from(v6)),
    }
}

fn family_matches(ip: &IpAddr, record_type: RecordType) -> bool {
    matches!(
        (ip, record_type),
        (IpAddr::V4(_), RecordType::A) | (IpAddr::V6(_), RecordType::AAAA)
    )
}

/// A or AAAA records owned by `name`, one per distinct host of that family.
pub fn address_records(
    services: &[ServiceRecord],
    name: &Name,
    record_type: RecordType,
) -> Result<Vec<Record>, ResolveError> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for svc in services {
        let ip = parse_host(&svc.host)?;
        if !family_matches(&ip, record_type) || !seen.insert(ip) {
            continue;
        }
        records.push(make_record(name.clone(), svc.ttl, address_rdata(ip)));
    }

    Ok(records)
}

/// SRV answers owned by `name` plus the address records of their targets.
///
/// Every record gets priority 0 and an equal weight share. Records without a
/// port are skipped.
pub fn srv_records(
    services: &[ServiceRecord],
    name: &Name,
) -> Result<(Vec<Record>, Vec<Record>), ResolveError> {
    let weight = srv_weight(services.len());
    let mut seen_srv = HashSet::new();
    let mut seen_extra = HashSet::new();
    let mut answers = Vec::new();
    let mut extras = Vec::new();

    for svc in services {
        if svc.port == NO_PORT {
            continue;
        }

        let ip = parse_host(&svc.host)?;
        let target = Name::from_ascii(key_to_domain(&svc.key))
            .map_err(|e| ResolveError::Internal(format!("invalid SRV target: {e}")))?;
        let port = u16::try_from(svc.port)
            .map_err(|_| ResolveError::Internal(format!("invalid port {}", svc.port)))?;

        if seen_srv.insert((target.clone(), port)) {
            answers.push(make_record(
                name.clone(),
                svc.ttl,
                RData::SRV(SRV::new(0, weight, port, target.clone())),
            ));
        }

        if seen_extra.insert((target.clone(), ip)) {
            extras.push(make_record(target, svc.ttl, address_rdata(ip)));
        }
    }

    Ok((answers, extras))
}

/// `floor(100 / (100 * n) * 100)`, at least 1.
pub fn srv_weight(count: usize) -> u16 {
    if count <= 1 {
        return 100;
    }
    let weight = (100.0 / (100.0 * count as f64) * 100.0).floor() as u16;
    weight.max(1)
}

/// The schema version TXT record owned by `name`.
pub fn dns_version_record(name: &Name) -> Record {
    make_record(
        name.clone(),
        DNS_VERSION_TTL,
        RData::TXT(TXT::new(vec![DNS_SCHEMA_VERSION.to_string()])),
    )
}

fn zone_host(prefix: &str, zone: &Name) -> Result<Name, ProtoError> {
    Name::from_ascii(prefix)?.append_domain(zone)
}

/// Nameserver host of `zone`: `ns.dns.<zone>`.
pub fn ns_host(zone: &Name) -> Result<Name, ProtoError> {
    zone_host("ns.dns", zone)
}

/// SOA record for `zone`, primary `ns.dns.<zone>`, mailbox `hostmaster.<zone>`.
pub fn soa_record(zone: &Name, serial: u32, ttl: u32, soa: &SoaConfig) -> Result<Record, ProtoError> {
    let rdata = SOA::new(
        ns_host(zone)?,
        zone_host("hostmaster", zone)?,
        serial,
        soa.refresh,
        soa.retry,
        soa.expire,
        ttl,
    );
    Ok(make_record(
        zone.clone(),
        ttl.min(MAX_SOA_TTL),
        RData::SOA(rdata),
    ))
}

/// NS answer for `zone` naming `host`, with the resolved addresses of
/// `host` as extras. Nothing resolved means no NS record.
pub fn ns_records(
    services: &[ServiceRecord],
    zone: &Name,
    host: &Name,
) -> Result<(Vec<Record>, Vec<Record>), ResolveError> {
    let mut seen = HashSet::new();
    let mut answers = Vec::new();
    let mut extras = Vec::new();

    for svc in services {
        let ip = parse_host(&svc.host)?;
        if answers.is_empty() {
            answers.push(make_record(zone.clone(), svc.ttl, RData::NS(NS(host.clone()))));
        }
        if seen.insert(ip) {
            extras.push(make_record(host.clone(), svc.ttl, address_rdata(ip)));
        }
    }

    Ok((answers, extras))
}
