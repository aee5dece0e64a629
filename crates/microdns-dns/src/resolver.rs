//! Resolver (§4.12): the per-datagram pipeline — authoritative zone lookup,
//! then cache, then upstream forward — that backs the single DNS server
//! socket. Grounded on the donor's recursor resolve loop, adapted to the
//! `ZoneStore`/`Zone`/`ZoneRecord` model (raw pre-parse RDATA strings) in
//! place of the donor's typed `RecordData` enum and `Db` handle.

use crate::cache::{self, CacheKey, DnsCache};
use crate::forward::ForwardTable;
use crate::zones::ZoneStore;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{CNAME, NS, PTR, SOA};
use hickory_proto::rr::{Name, RData, Record as DnsRecord};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use microdns_core::types::{RecordType as MicroRecordType, Soa, Zone, ZoneRecord};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub struct Resolver {
    zones: Arc<ZoneStore>,
    cache: Arc<DnsCache>,
    forward_table: Arc<ForwardTable>,
    upstream: Vec<SocketAddr>,
    forward_timeout: Duration,
    default_cache_ttl: u32,
}

impl Resolver {
    pub fn new(
        zones: Arc<ZoneStore>,
        cache: Arc<DnsCache>,
        forward_table: Arc<ForwardTable>,
        upstream: Vec<SocketAddr>,
        forward_timeout: Duration,
        default_cache_ttl: u32,
    ) -> Self {
        Self {
            zones,
            cache,
            forward_table,
            upstream,
            forward_timeout,
            default_cache_ttl,
        }
    }

    /// Resolves a single query. Per §4.12 only the first question is
    /// honored; a multi-question message is rejected with `FormErr`.
    pub async fn resolve(&self, data: &[u8]) -> Vec<u8> {
        let request = match Message::from_bytes(data) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "dropping malformed dns query");
                return Vec::new();
            }
        };

        if request.op_code() != OpCode::Query {
            return self.error_response(&request, ResponseCode::NotImp);
        }

        let queries = request.queries();
        if queries.len() != 1 {
            return self.error_response(&request, ResponseCode::FormErr);
        }

        let query = &queries[0];
        let qname = query.name().to_string();
        let qname_lower = qname.trim_end_matches('.').to_lowercase();
        let qtype = query.query_type();
        let qtype_code: u16 = qtype.into();
        let qclass_code: u16 = query.query_class().into();

        debug!(name = %qname_lower, rtype = %qtype, "resolving query");

        // 1. Authoritative zones.
        if let Some(zone) = self.zones.find_zone_for_name(&qname_lower) {
            debug!(zone = %zone.name, "answering from authoritative zone");
            return self.resolve_from_zone(&request, zone, &qname_lower, qtype);
        }

        // 2. Cache.
        let cache_key = CacheKey::from_query(&qname_lower, qtype_code, qclass_code);
        if let Some(cached_bytes) = self.cache.get(&cache_key) {
            debug!(name = %qname_lower, "cache hit");
            return rewrite_response_id(&cached_bytes, request.id());
        }

        // 3. Upstream forward.
        let servers: Vec<SocketAddr> = self
            .forward_table
            .lookup(&qname_lower)
            .map(|s| s.to_vec())
            .unwrap_or_else(|| self.upstream.clone());

        if servers.is_empty() {
            return self.error_response(&request, ResponseCode::ServFail);
        }

        self.forward_query(data, &request, &servers, &cache_key).await
    }

    /// Only A/AAAA/CNAME/NS/PTR are answered directly from a zone (§4.12);
    /// everything else — including SOA itself — misses through to the
    /// forwarder, matching `RecordType::is_directly_answerable`.
    fn resolve_from_zone(
        &self,
        request: &Message,
        zone: &Zone,
        name: &str,
        qtype: hickory_proto::rr::RecordType,
    ) -> Vec<u8> {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_recursion_desired(request.recursion_desired());
        response.set_recursion_available(true);
        response.set_authoritative(true);
        for query in request.queries() {
            response.add_query(query.clone());
        }

        let micro_rtype = match MicroRecordType::from_code(qtype.into()) {
            Some(rt) if rt.is_directly_answerable() => rt,
            _ => {
                response.set_response_code(ResponseCode::NotImp);
                return response.to_bytes().unwrap_or_default();
            }
        };

        let records = self.zones.lookup(zone, name, micro_rtype);
        if records.is_empty() {
            if self.zones.has_any(zone, name) {
                response.set_response_code(ResponseCode::NoError);
            } else {
                if let Some(soa) = build_soa_record(zone) {
                    response.add_name_server(soa);
                }
                response.set_response_code(ResponseCode::NXDomain);
            }
            return response.to_bytes().unwrap_or_default();
        }

        for rec in records {
            if let Some(proto_rec) = record_to_proto(rec) {
                response.add_answer(proto_rec);
            }
        }
        response.set_response_code(ResponseCode::NoError);
        response.to_bytes().unwrap_or_default()
    }

    async fn forward_query(
        &self,
        raw_request: &[u8],
        request: &Message,
        servers: &[SocketAddr],
        cache_key: &CacheKey,
    ) -> Vec<u8> {
        for server in servers {
            match self.send_query(raw_request, *server).await {
                Ok(response_bytes) => {
                    if let Ok(resp_msg) = Message::from_bytes(&response_bytes) {
                        if resp_msg.response_code() == ResponseCode::NoError {
                            let ttl = cache::min_ttl_from_response(&resp_msg);
                            let ttl = if ttl > 0 { ttl } else { self.default_cache_ttl };
                            self.cache.insert(cache_key.clone(), response_bytes.clone(), ttl);
                        }
                    }
                    return rewrite_response_id(&response_bytes, request.id());
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "upstream forward failed");
                    continue;
                }
            }
        }

        self.error_response(request, ResponseCode::ServFail)
    }

    async fn send_query(&self, data: &[u8], server: SocketAddr) -> std::io::Result<Vec<u8>> {
        let bind_addr = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.send_to(data, server).await?;

        let mut buf = vec![0u8; 4096];
        let (n, _) = tokio::time::timeout(self.forward_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream forward timed out"))??;

        buf.truncate(n);
        Ok(buf)
    }

    fn error_response(&self, request: &Message, code: ResponseCode) -> Vec<u8> {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.set_recursion_desired(request.recursion_desired());
        response.set_recursion_available(true);
        response.set_response_code(code);
        for query in request.queries() {
            response.add_query(query.clone());
        }
        response.to_bytes().unwrap_or_default()
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }
}

/// The transaction id from the client is preserved in the cached bytes'
/// slot when served from cache — overwrite the first two bytes before send.
fn rewrite_response_id(response: &[u8], new_id: u16) -> Vec<u8> {
    if response.len() < 2 {
        return response.to_vec();
    }
    let mut result = response.to_vec();
    let id_bytes = new_id.to_be_bytes();
    result[0] = id_bytes[0];
    result[1] = id_bytes[1];
    result
}

fn record_to_proto(rec: &ZoneRecord) -> Option<DnsRecord> {
    let name = Name::from_str(&ensure_fqdn(&rec.name)).ok()?;

    let rdata = match rec.rtype {
        MicroRecordType::A => RData::A(rec.rdata.parse::<std::net::Ipv4Addr>().ok()?.into()),
        MicroRecordType::AAAA => RData::AAAA(rec.rdata.parse::<std::net::Ipv6Addr>().ok()?.into()),
        MicroRecordType::CNAME => RData::CNAME(CNAME(Name::from_str(&ensure_fqdn(&rec.rdata)).ok()?)),
        MicroRecordType::NS => RData::NS(NS(Name::from_str(&ensure_fqdn(&rec.rdata)).ok()?)),
        MicroRecordType::PTR => RData::PTR(PTR(Name::from_str(&ensure_fqdn(&rec.rdata)).ok()?)),
        _ => return None,
    };

    Some(DnsRecord::from_rdata(name, rec.ttl, rdata))
}

fn build_soa_record(zone: &Zone) -> Option<DnsRecord> {
    let soa: &Soa = &zone.soa;
    let zone_name = Name::from_str(&ensure_fqdn(&zone.name)).ok()?;
    let mname = Name::from_str(&ensure_fqdn(&soa.mname)).ok()?;
    let rname = Name::from_str(&ensure_fqdn(&soa.rname)).ok()?;

    let rdata = RData::SOA(SOA::new(
        mname,
        rname,
        soa.serial,
        soa.refresh as i32,
        soa.retry as i32,
        soa.expire as i32,
        soa.minimum,
    ));

    let mut record = DnsRecord::from_rdata(zone_name, zone.default_ttl, rdata);
    record.set_record_type(hickory_proto::rr::RecordType::SOA);
    Some(record)
}

fn ensure_fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::ForwardTable;
    use hickory_proto::op::{Message as ReqMessage, MessageType as ReqType, Query};
    use hickory_proto::rr::{Name as RrName, RecordType as RrRecordType};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn build_query(name: &str, rtype: RrRecordType) -> Vec<u8> {
        let mut msg = ReqMessage::new();
        msg.set_id(42);
        msg.set_message_type(ReqType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        let mut q = Query::new();
        q.set_name(RrName::from_str(name).unwrap());
        q.set_query_type(rtype);
        msg.add_query(q);
        msg.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn answers_a_record_from_zone_authoritatively() {
        let zone_id = Uuid::new_v4();
        let zone = Zone {
            id: zone_id,
            name: "example.com".to_string(),
            default_ttl: 3600,
            soa: Soa {
                mname: "ns1.example.com".to_string(),
                rname: "admin.example.com".to_string(),
                serial: 1,
                refresh: 3600,
                retry: 900,
                expire: 604800,
                minimum: 3600,
            },
        };
        let record = ZoneRecord {
            zone_id,
            name: "www.example.com".to_string(),
            rtype: MicroRecordType::A,
            ttl: 300,
            rdata: "192.0.2.10".to_string(),
        };

        let zones = Arc::new(crate::zones::ZoneStore::test_store(vec![zone], vec![record]));
        let cache = Arc::new(DnsCache::new(64));
        let forward = Arc::new(ForwardTable::from_config(&HashMap::new()));
        let resolver = Resolver::new(
            zones,
            cache,
            forward,
            vec!["127.0.0.1:1".parse().unwrap()],
            Duration::from_secs(2),
            60,
        );

        let query = build_query("www.example.com.", RrRecordType::A);
        let response = resolver.resolve(&query).await;
        let msg = Message::from_bytes(&response).unwrap();
        assert!(msg.authoritative());
        assert_eq!(msg.response_code(), ResponseCode::NoError);
        assert_eq!(msg.answers().len(), 1);
    }

    #[tokio::test]
    async fn nxdomain_within_zone_carries_soa_authority() {
        let zone_id = Uuid::new_v4();
        let zone = Zone {
            id: zone_id,
            name: "example.com".to_string(),
            default_ttl: 3600,
            soa: Soa {
                mname: "ns1.example.com".to_string(),
                rname: "admin.example.com".to_string(),
                serial: 1,
                refresh: 3600,
                retry: 900,
                expire: 604800,
                minimum: 3600,
            },
        };

        let zones = Arc::new(crate::zones::ZoneStore::test_store(vec![zone], vec![]));
        let cache = Arc::new(DnsCache::new(64));
        let forward = Arc::new(ForwardTable::from_config(&HashMap::new()));
        let resolver = Resolver::new(
            zones,
            cache,
            forward,
            vec!["127.0.0.1:1".parse().unwrap()],
            Duration::from_secs(2),
            60,
        );

        let query = build_query("missing.example.com.", RrRecordType::A);
        let response = resolver.resolve(&query).await;
        let msg = Message::from_bytes(&response).unwrap();
        assert_eq!(msg.response_code(), ResponseCode::NXDomain);
        assert_eq!(msg.name_servers().len(), 1);
    }
}
