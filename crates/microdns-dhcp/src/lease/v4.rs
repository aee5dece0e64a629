use super::{atomic_write, format_isc_time, parse_isc_time};
use microdns_core::error::LeaseError;
use microdns_core::hex::{mac_from_colon_hex, to_colon_hex};
use microdns_core::types::{LeaseState, LeaseV4};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// In-memory DHCPv4 lease store, mirrored to an ISC-text lease file on every
/// mutation routed through the caller's persistence path (AsyncIOQueue, §4.3).
pub struct LeaseStoreV4 {
    path: PathBuf,
    next_lease_id: u64,
    by_ip: HashMap<Ipv4Addr, LeaseV4>,
}

impl LeaseStoreV4 {
    pub fn new(path: PathBuf) -> Self {
        LeaseStoreV4 {
            path,
            next_lease_id: 1,
            by_ip: HashMap::new(),
        }
    }

    /// Loads the lease file if present; a missing file is an empty store, not
    /// an error (first run on a fresh installation).
    pub fn load(path: PathBuf) -> Result<Self, LeaseError> {
        let mut store = LeaseStoreV4::new(path.clone());
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(e) => return Err(LeaseError::Io(e)),
        };

        for lease in parse_leases(&text)? {
            store.next_lease_id = store.next_lease_id.max(lease.lease_id + 1);
            store.by_ip.insert(lease.ip_addr, lease);
        }
        Ok(store)
    }

    pub fn save(&self) -> Result<(), LeaseError> {
        let mut leases: Vec<&LeaseV4> = self.by_ip.values().collect();
        leases.sort_by_key(|l| l.ip_addr);
        let text = render_leases(&leases);
        atomic_write(&self.path, &text).map_err(LeaseError::Io)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn find_by_ip(&self, ip: Ipv4Addr) -> Option<&LeaseV4> {
        self.by_ip.get(&ip)
    }

    pub fn find_active_by_mac(&self, mac: [u8; 6]) -> Option<&LeaseV4> {
        self.by_ip
            .values()
            .find(|l| l.mac_addr == mac && l.state == LeaseState::Active)
    }

    pub fn upsert(&mut self, lease: LeaseV4) {
        self.next_lease_id = self.next_lease_id.max(lease.lease_id + 1);
        self.by_ip.insert(lease.ip_addr, lease);
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_lease_id;
        self.next_lease_id += 1;
        id
    }

    pub fn release(&mut self, ip: Ipv4Addr) -> Result<(), LeaseError> {
        let lease = self.by_ip.get_mut(&ip).ok_or(LeaseError::NotFound)?;
        lease.state = LeaseState::Released;
        Ok(())
    }

    pub fn active_leases(&self) -> impl Iterator<Item = &LeaseV4> {
        self.by_ip.values().filter(|l| l.state == LeaseState::Active)
    }

    pub fn all_leases(&self) -> impl Iterator<Item = &LeaseV4> {
        self.by_ip.values()
    }

    /// Sweeps for active leases past `ends`, flipping them to `Expired`
    /// (§4.4). Returns the count flipped so the caller (`ExpirationTimer`)
    /// knows whether a full rewrite is warranted.
    pub fn expire_old(&mut self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let mut count = 0;
        for lease in self.by_ip.values_mut() {
            if lease.state == LeaseState::Active && lease.expired(now) {
                lease.state = LeaseState::Expired;
                count += 1;
            }
        }
        count
    }
}

fn render_leases(leases: &[&LeaseV4]) -> String {
    let mut out = String::new();
    out.push_str("# microdns dhcpv4 lease file\n");
    out.push_str("authoring-byte-order little-endian;\n");

    for lease in leases {
        out.push_str(&format!("lease {} {{\n", lease.ip_addr));
        out.push_str(&format!("  starts {};\n", format_isc_time(lease.starts)));
        out.push_str(&format!("  ends {};\n", format_isc_time(lease.ends)));
        out.push_str(&format!("  tstp {};\n", format_isc_time(lease.tstp)));
        out.push_str(&format!("  cltt {};\n", format_isc_time(lease.cltt)));
        out.push_str(&format!(
            "  hardware ethernet {};\n",
            to_colon_hex(&lease.mac_addr)
        ));
        if let Some(client_id) = &lease.client_id {
            out.push_str(&format!("  uid {};\n", quote_bytes(client_id)));
        }
        if let Some(hostname) = &lease.hostname {
            out.push_str(&format!("  client-hostname \"{hostname}\";\n"));
        }
        if let Some(vendor) = &lease.vendor_class {
            out.push_str(&format!("  vendor-class-identifier \"{vendor}\";\n"));
        }
        out.push_str(&format!(
            "  binding state {};\n",
            lease.state.as_str()
        ));
        out.push_str(&format!(
            "  next binding state {};\n",
            lease.next_binding_state.as_str()
        ));
        out.push_str(&format!(
            "  rewind binding state {};\n",
            lease.rewind_binding_state.as_str()
        ));
        if lease.is_abandoned {
            out.push_str("  abandoned;\n");
        }
        out.push_str("}\n");
    }

    out
}

fn quote_bytes(bytes: &[u8]) -> String {
    let mut s = String::from("\"");
    for b in bytes {
        if b.is_ascii_graphic() && *b != b'"' && *b != b'\\' {
            s.push(*b as char);
        } else {
            s.push_str(&format!("\\{:03o}", b));
        }
    }
    s.push('"');
    s
}

fn unquote_bytes(s: &str) -> Vec<u8> {
    let s = s.trim_matches('"');
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let octal: String = chars.by_ref().take(3).collect();
            if let Ok(b) = u8::from_str_radix(&octal, 8) {
                out.push(b);
                continue;
            }
        }
        out.push(c as u8);
    }
    out
}

fn parse_leases(text: &str) -> Result<Vec<LeaseV4>, LeaseError> {
    let mut leases = Vec::new();
    let mut lines = text.lines().peekable();
    let mut next_id = 1u64;

    while let Some(line) = lines.next() {
        let line = line.trim();
        if !line.starts_with("lease ") {
            continue;
        }
        let ip_str = line
            .strip_prefix("lease ")
            .and_then(|s| s.split_whitespace().next())
            .ok_or_else(|| LeaseError::Malformed("missing lease address".into()))?;
        let ip_addr: Ipv4Addr = ip_str
            .parse()
            .map_err(|_| LeaseError::Malformed(format!("bad lease address: {ip_str}")))?;

        let mut starts = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        let mut ends = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        let mut tstp = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        let mut cltt = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        let mut mac_addr = [0u8; 6];
        let mut client_id = None;
        let mut hostname = None;
        let mut vendor_class = None;
        let mut state = LeaseState::Unknown;
        let mut next_binding_state = LeaseState::Unknown;
        let mut rewind_binding_state = LeaseState::Unknown;
        let mut is_abandoned = false;

        for body_line in lines.by_ref() {
            let body_line = body_line.trim().trim_end_matches(';');
            if body_line == "}" {
                break;
            }
            if let Some(rest) = body_line.strip_prefix("starts ") {
                starts = parse_isc_time(rest).unwrap_or(starts);
            } else if let Some(rest) = body_line.strip_prefix("ends ") {
                ends = parse_isc_time(rest).unwrap_or(ends);
            } else if let Some(rest) = body_line.strip_prefix("tstp ") {
                tstp = parse_isc_time(rest).unwrap_or(tstp);
            } else if let Some(rest) = body_line.strip_prefix("cltt ") {
                cltt = parse_isc_time(rest).unwrap_or(cltt);
            } else if let Some(rest) = body_line.strip_prefix("hardware ethernet ") {
                mac_addr = mac_from_colon_hex(rest.trim()).unwrap_or(mac_addr);
            } else if let Some(rest) = body_line.strip_prefix("uid ") {
                client_id = Some(unquote_bytes(rest.trim()));
            } else if let Some(rest) = body_line.strip_prefix("client-hostname ") {
                hostname = Some(rest.trim().trim_matches('"').to_string());
            } else if let Some(rest) = body_line.strip_prefix("vendor-class-identifier ") {
                vendor_class = Some(rest.trim().trim_matches('"').to_string());
            } else if let Some(rest) = body_line.strip_prefix("binding state ") {
                state = LeaseState::from_str_lenient(rest.trim());
            } else if let Some(rest) = body_line.strip_prefix("next binding state ") {
                next_binding_state = LeaseState::from_str_lenient(rest.trim());
            } else if let Some(rest) = body_line.strip_prefix("rewind binding state ") {
                rewind_binding_state = LeaseState::from_str_lenient(rest.trim());
            } else if body_line == "abandoned" {
                is_abandoned = true;
            }
        }

        let lease_id = next_id;
        next_id += 1;

        leases.push(LeaseV4 {
            lease_id,
            ip_addr,
            mac_addr,
            starts,
            ends,
            tstp,
            cltt,
            state,
            next_binding_state,
            rewind_binding_state,
            client_id,
            hostname,
            vendor_class,
            is_abandoned,
            is_bootp: false,
        });
    }

    Ok(leases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_lease(ip: &str, mac: [u8; 6]) -> LeaseV4 {
        let now = Utc::now();
        LeaseV4 {
            lease_id: 1,
            ip_addr: ip.parse().unwrap(),
            mac_addr: mac,
            starts: now,
            ends: now + chrono::Duration::seconds(3600),
            tstp: now,
            cltt: now,
            state: LeaseState::Active,
            next_binding_state: LeaseState::Free,
            rewind_binding_state: LeaseState::Free,
            client_id: Some(vec![1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            hostname: Some("host1".to_string()),
            vendor_class: None,
            is_abandoned: false,
            is_bootp: false,
        }
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dhcpv4.leases");

        let mut store = LeaseStoreV4::new(path.clone());
        store.upsert(sample_lease("10.0.10.100", [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]));
        store.save().unwrap();

        let reloaded = LeaseStoreV4::load(path).unwrap();
        let lease = reloaded
            .find_by_ip("10.0.10.100".parse().unwrap())
            .unwrap();
        assert_eq!(lease.mac_addr, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(lease.hostname.as_deref(), Some("host1"));
        assert_eq!(lease.state, LeaseState::Active);
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("does-not-exist.leases");
        let store = LeaseStoreV4::load(path).unwrap();
        assert_eq!(store.all_leases().count(), 0);
    }

    #[test]
    fn expire_old_flips_past_due_active_leases() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dhcpv4.leases");
        let mut store = LeaseStoreV4::new(path);

        let mut lease = sample_lease("10.0.10.100", [1, 2, 3, 4, 5, 6]);
        lease.ends = Utc::now() - chrono::Duration::seconds(10);
        store.upsert(lease);

        let flipped = store.expire_old(Utc::now());
        assert_eq!(flipped, 1);
        assert_eq!(
            store.find_by_ip("10.0.10.100".parse().unwrap()).unwrap().state,
            LeaseState::Expired
        );
    }

    #[test]
    fn release_flips_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dhcpv4.leases");
        let mut store = LeaseStoreV4::new(path);
        store.upsert(sample_lease("10.0.10.100", [1, 2, 3, 4, 5, 6]));
        store.release("10.0.10.100".parse().unwrap()).unwrap();
        let lease = store.find_by_ip("10.0.10.100".parse().unwrap()).unwrap();
        assert_eq!(lease.state, LeaseState::Released);
    }
}
