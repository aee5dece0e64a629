use super::{atomic_write, format_isc_time, parse_isc_time};
use microdns_core::error::LeaseError;
use microdns_core::hex::{from_colon_hex, to_colon_hex};
use microdns_core::types::{Ia6Kind, LeaseState, LeaseV6};
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

/// In-memory DHCPv6 lease store covering both IA_NA leases and IA_PD
/// delegated-prefix leases, persisted under a shared `server-duid` header
/// line (§4.2/§6).
pub struct LeaseStoreV6 {
    path: PathBuf,
    server_duid: Vec<u8>,
    next_lease_id: u64,
    na_by_addr: HashMap<Ipv6Addr, LeaseV6>,
    pd_by_prefix: HashMap<(Ipv6Addr, u8), LeaseV6>,
}

impl LeaseStoreV6 {
    pub fn new(path: PathBuf, server_duid: Vec<u8>) -> Self {
        LeaseStoreV6 {
            path,
            server_duid,
            next_lease_id: 1,
            na_by_addr: HashMap::new(),
            pd_by_prefix: HashMap::new(),
        }
    }

    pub fn load(path: PathBuf, fallback_duid: Vec<u8>) -> Result<Self, LeaseError> {
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LeaseStoreV6::new(path, fallback_duid))
            }
            Err(e) => return Err(LeaseError::Io(e)),
        };

        let (server_duid, leases) = parse_leases(&text, fallback_duid)?;
        let mut store = LeaseStoreV6::new(path, server_duid);
        for lease in leases {
            store.next_lease_id = store.next_lease_id.max(lease.lease_id + 1);
            match lease.kind {
                Ia6Kind::Na => {
                    if let Some(addr) = lease.address {
                        store.na_by_addr.insert(addr, lease);
                    }
                }
                Ia6Kind::Pd => {
                    if let (Some(prefix), Some(plen)) = (lease.prefix, lease.prefix_len) {
                        store.pd_by_prefix.insert((prefix, plen), lease);
                    }
                }
            }
        }
        Ok(store)
    }

    pub fn save(&self) -> Result<(), LeaseError> {
        let mut na: Vec<&LeaseV6> = self.na_by_addr.values().collect();
        na.sort_by_key(|l| l.address);
        let mut pd: Vec<&LeaseV6> = self.pd_by_prefix.values().collect();
        pd.sort_by_key(|l| l.prefix);

        let text = render_leases(&self.server_duid, &na, &pd);
        atomic_write(&self.path, &text).map_err(LeaseError::Io)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn server_duid(&self) -> &[u8] {
        &self.server_duid
    }

    pub fn find_na_by_addr(&self, addr: Ipv6Addr) -> Option<&LeaseV6> {
        self.na_by_addr.get(&addr)
    }

    pub fn find_active_na_by_duid(&self, duid: &[u8], iaid: u32) -> Option<&LeaseV6> {
        self.na_by_addr
            .values()
            .find(|l| l.duid == duid && l.iaid == iaid && l.state == LeaseState::Active)
    }

    pub fn find_active_pd_by_duid(&self, duid: &[u8], iaid: u32) -> Option<&LeaseV6> {
        self.pd_by_prefix
            .values()
            .find(|l| l.duid == duid && l.iaid == iaid && l.state == LeaseState::Active)
    }

    pub fn upsert_na(&mut self, lease: LeaseV6) {
        self.next_lease_id = self.next_lease_id.max(lease.lease_id + 1);
        if let Some(addr) = lease.address {
            self.na_by_addr.insert(addr, lease);
        }
    }

    pub fn upsert_pd(&mut self, lease: LeaseV6) {
        self.next_lease_id = self.next_lease_id.max(lease.lease_id + 1);
        if let (Some(prefix), Some(plen)) = (lease.prefix, lease.prefix_len) {
            self.pd_by_prefix.insert((prefix, plen), lease);
        }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_lease_id;
        self.next_lease_id += 1;
        id
    }

    pub fn release_na(&mut self, addr: Ipv6Addr) -> Result<(), LeaseError> {
        let lease = self.na_by_addr.get_mut(&addr).ok_or(LeaseError::NotFound)?;
        lease.state = LeaseState::Released;
        Ok(())
    }

    pub fn release_pd(&mut self, prefix: Ipv6Addr, prefix_len: u8) -> Result<(), LeaseError> {
        let lease = self
            .pd_by_prefix
            .get_mut(&(prefix, prefix_len))
            .ok_or(LeaseError::NotFound)?;
        lease.state = LeaseState::Released;
        Ok(())
    }

    pub fn mark_abandoned_na(&mut self, addr: Ipv6Addr) -> Result<(), LeaseError> {
        let lease = self.na_by_addr.get_mut(&addr).ok_or(LeaseError::NotFound)?;
        lease.state = LeaseState::Abandoned;
        Ok(())
    }

    pub fn mark_abandoned_pd(&mut self, prefix: Ipv6Addr, prefix_len: u8) -> Result<(), LeaseError> {
        let lease = self
            .pd_by_prefix
            .get_mut(&(prefix, prefix_len))
            .ok_or(LeaseError::NotFound)?;
        lease.state = LeaseState::Abandoned;
        Ok(())
    }

    pub fn active_na_leases(&self) -> impl Iterator<Item = &LeaseV6> {
        self.na_by_addr.values().filter(|l| l.state == LeaseState::Active)
    }

    pub fn active_pd_leases(&self) -> impl Iterator<Item = &LeaseV6> {
        self.pd_by_prefix.values().filter(|l| l.state == LeaseState::Active)
    }

    /// Sweeps both IA_NA and IA_PD leases for entries past `ends`, flipping
    /// them to `Expired` (§4.4). Returns the combined count flipped.
    pub fn expire_old(&mut self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let mut count = 0;
        for lease in self.na_by_addr.values_mut() {
            if lease.state == LeaseState::Active && lease.expired(now) {
                lease.state = LeaseState::Expired;
                count += 1;
            }
        }
        for lease in self.pd_by_prefix.values_mut() {
            if lease.state == LeaseState::Active && lease.expired(now) {
                lease.state = LeaseState::Expired;
                count += 1;
            }
        }
        count
    }
}

fn render_leases(server_duid: &[u8], na: &[&LeaseV6], pd: &[&LeaseV6]) -> String {
    let mut out = String::new();
    out.push_str("# microdns dhcpv6 lease file\n");
    out.push_str(&format!("server-duid {};\n", to_colon_hex(server_duid)));

    for lease in na {
        let addr = lease.address.expect("na lease without address");
        out.push_str(&format!("lease {addr} {{\n"));
        write_common_fields(&mut out, lease);
        out.push_str("}\n");
    }

    for lease in pd {
        let prefix = lease.prefix.expect("pd lease without prefix");
        let plen = lease.prefix_len.expect("pd lease without prefix len");
        out.push_str(&format!("prefix {prefix}/{plen} {{\n"));
        write_common_fields(&mut out, lease);
        out.push_str("}\n");
    }

    out
}

fn write_common_fields(out: &mut String, lease: &LeaseV6) {
    out.push_str(&format!("  duid {};\n", to_colon_hex(&lease.duid)));
    out.push_str(&format!("  iaid {};\n", lease.iaid));
    out.push_str(&format!("  starts {};\n", format_isc_time(lease.starts)));
    out.push_str(&format!("  ends {};\n", format_isc_time(lease.ends)));
    out.push_str(&format!("  tstp {};\n", format_isc_time(lease.tstp)));
    out.push_str(&format!("  cltt {};\n", format_isc_time(lease.cltt)));
    if let Some(hostname) = &lease.hostname {
        out.push_str(&format!("  client-hostname \"{hostname}\";\n"));
    }
    if let Some(vendor) = &lease.vendor_class {
        out.push_str(&format!("  vendor-class-identifier \"{vendor}\";\n"));
    }
    if let Some(fqdn) = &lease.fqdn {
        out.push_str(&format!("  fqdn \"{fqdn}\";\n"));
    }
    out.push_str(&format!("  binding state {};\n", lease.state.as_str()));
}

fn parse_leases(
    text: &str,
    fallback_duid: Vec<u8>,
) -> Result<(Vec<u8>, Vec<LeaseV6>), LeaseError> {
    let mut server_duid = fallback_duid;
    let mut leases = Vec::new();
    let mut next_id = 1u64;
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("server-duid ") {
            let hex = rest.trim_end_matches(';').trim();
            if let Some(bytes) = from_colon_hex(hex) {
                server_duid = bytes;
            }
            continue;
        }

        let (kind, header_rest) = if let Some(rest) = line.strip_prefix("lease ") {
            (Ia6Kind::Na, rest)
        } else if let Some(rest) = line.strip_prefix("prefix ") {
            (Ia6Kind::Pd, rest)
        } else {
            continue;
        };

        let addr_token = header_rest
            .split_whitespace()
            .next()
            .ok_or_else(|| LeaseError::Malformed("missing lease address".into()))?;

        let (address, prefix, prefix_len) = match kind {
            Ia6Kind::Na => {
                let addr: Ipv6Addr = addr_token
                    .parse()
                    .map_err(|_| LeaseError::Malformed(format!("bad lease address: {addr_token}")))?;
                (Some(addr), None, None)
            }
            Ia6Kind::Pd => {
                let mut parts = addr_token.splitn(2, '/');
                let prefix: Ipv6Addr = parts
                    .next()
                    .unwrap()
                    .parse()
                    .map_err(|_| LeaseError::Malformed(format!("bad prefix: {addr_token}")))?;
                let plen: u8 = parts
                    .next()
                    .ok_or_else(|| LeaseError::Malformed("missing prefix length".into()))?
                    .parse()
                    .map_err(|_| LeaseError::Malformed("bad prefix length".into()))?;
                (None, Some(prefix), Some(plen))
            }
        };

        let mut duid = Vec::new();
        let mut iaid = 0u32;
        let mut starts = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        let mut ends = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        let mut tstp = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        let mut cltt = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        let mut hostname = None;
        let mut vendor_class = None;
        let mut fqdn = None;
        let mut state = LeaseState::Unknown;

        for body_line in lines.by_ref() {
            let body_line = body_line.trim().trim_end_matches(';');
            if body_line == "}" {
                break;
            }
            if let Some(rest) = body_line.strip_prefix("duid ") {
                duid = from_colon_hex(rest.trim()).unwrap_or_default();
            } else if let Some(rest) = body_line.strip_prefix("iaid ") {
                iaid = rest.trim().parse().unwrap_or(0);
            } else if let Some(rest) = body_line.strip_prefix("starts ") {
                starts = parse_isc_time(rest).unwrap_or(starts);
            } else if let Some(rest) = body_line.strip_prefix("ends ") {
                ends = parse_isc_time(rest).unwrap_or(ends);
            } else if let Some(rest) = body_line.strip_prefix("tstp ") {
                tstp = parse_isc_time(rest).unwrap_or(tstp);
            } else if let Some(rest) = body_line.strip_prefix("cltt ") {
                cltt = parse_isc_time(rest).unwrap_or(cltt);
            } else if let Some(rest) = body_line.strip_prefix("client-hostname ") {
                hostname = Some(rest.trim().trim_matches('"').to_string());
            } else if let Some(rest) = body_line.strip_prefix("vendor-class-identifier ") {
                vendor_class = Some(rest.trim().trim_matches('"').to_string());
            } else if let Some(rest) = body_line.strip_prefix("fqdn ") {
                fqdn = Some(rest.trim().trim_matches('"').to_string());
            } else if let Some(rest) = body_line.strip_prefix("binding state ") {
                state = LeaseState::from_str_lenient(rest.trim());
            }
        }

        let lease_id = next_id;
        next_id += 1;

        leases.push(LeaseV6 {
            lease_id,
            kind,
            duid,
            iaid,
            address,
            prefix,
            prefix_len,
            starts,
            ends,
            tstp,
            cltt,
            state,
            hostname,
            vendor_class,
            fqdn,
        });
    }

    Ok((server_duid, leases))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_na(addr: &str) -> LeaseV6 {
        let now = Utc::now();
        LeaseV6 {
            lease_id: 1,
            kind: Ia6Kind::Na,
            duid: vec![0, 1, 0, 1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
            iaid: 1,
            address: Some(addr.parse().unwrap()),
            prefix: None,
            prefix_len: None,
            starts: now,
            ends: now + chrono::Duration::seconds(3600),
            tstp: now,
            cltt: now,
            state: LeaseState::Active,
            hostname: Some("host6".to_string()),
            vendor_class: None,
            fqdn: None,
        }
    }

    fn sample_pd(prefix: &str, plen: u8) -> LeaseV6 {
        let mut l = sample_na("2001:db8:1::100");
        l.kind = Ia6Kind::Pd;
        l.address = None;
        l.prefix = Some(prefix.parse().unwrap());
        l.prefix_len = Some(plen);
        l
    }

    #[test]
    fn roundtrip_na_and_pd() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dhcpv6.leases");

        let mut store = LeaseStoreV6::new(path.clone(), vec![0, 1, 0, 1, 2, 3]);
        store.upsert_na(sample_na("2001:db8:1::100"));
        store.upsert_pd(sample_pd("2001:db8:3::", 56));
        store.save().unwrap();

        let reloaded = LeaseStoreV6::load(path, vec![]).unwrap();
        assert_eq!(reloaded.server_duid(), &[0, 1, 0, 1, 2, 3]);
        let na = reloaded
            .find_na_by_addr("2001:db8:1::100".parse().unwrap())
            .unwrap();
        assert_eq!(na.hostname.as_deref(), Some("host6"));
        assert_eq!(reloaded.active_pd_leases().count(), 1);
    }
}
