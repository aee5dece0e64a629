use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

/// DNS record types served by the authoritative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    AAAA,
    CNAME,
    MX,
    NS,
    PTR,
    SOA,
    SRV,
    TXT,
    CAA,
}

impl RecordType {
    /// Wire-format query type code (RFC 1035 section 3.2.2 / RFC 3596).
    pub fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::CNAME => 5,
            RecordType::SOA => 6,
            RecordType::PTR => 12,
            RecordType::MX => 15,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::SRV => 33,
            RecordType::CAA => 257,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => RecordType::A,
            2 => RecordType::NS,
            5 => RecordType::CNAME,
            6 => RecordType::SOA,
            12 => RecordType::PTR,
            15 => RecordType::MX,
            16 => RecordType::TXT,
            28 => RecordType::AAAA,
            33 => RecordType::SRV,
            257 => RecordType::CAA,
            _ => return None,
        })
    }

    /// Types §4.12 answers authoritatively; everything else falls through to the forwarder.
    pub fn is_directly_answerable(self) -> bool {
        matches!(
            self,
            RecordType::A | RecordType::AAAA | RecordType::CNAME | RecordType::NS | RecordType::PTR
        )
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::AAAA => write!(f, "AAAA"),
            RecordType::CNAME => write!(f, "CNAME"),
            RecordType::MX => write!(f, "MX"),
            RecordType::NS => write!(f, "NS"),
            RecordType::PTR => write!(f, "PTR"),
            RecordType::SOA => write!(f, "SOA"),
            RecordType::SRV => write!(f, "SRV"),
            RecordType::TXT => write!(f, "TXT"),
            RecordType::CAA => write!(f, "CAA"),
        }
    }
}

impl std::str::FromStr for RecordType {
    type Err = crate::error::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::AAAA),
            "CNAME" => Ok(RecordType::CNAME),
            "MX" => Ok(RecordType::MX),
            "NS" => Ok(RecordType::NS),
            "PTR" => Ok(RecordType::PTR),
            "SOA" => Ok(RecordType::SOA),
            "SRV" => Ok(RecordType::SRV),
            "TXT" => Ok(RecordType::TXT),
            "CAA" => Ok(RecordType::CAA),
            other => Err(crate::error::ConfigError::InvalidValue(format!(
                "unknown record type: {other}"
            ))),
        }
    }
}

/// A DNS zone loaded from a zone file (ZoneLoader boundary, §2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: Uuid,
    pub name: String,
    pub default_ttl: u32,
    /// Start-of-authority fields, used to build the authority-section SOA
    /// record on an NXDOMAIN answer within this zone. SOA queries themselves
    /// are not directly answerable (§4.12) and fall through to the forwarder.
    pub soa: Soa,
}

/// Start-of-authority fields (RFC 1035 section 3.3.13).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Soa {
    pub mname: String,
    pub rname: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// A single record within a zone, kept as a raw pre-parse RDATA string per §3's
/// "DNS zone record" data model — the authoritative answer builder (§4.12) is the
/// only thing that interprets the string, per record type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub zone_id: Uuid,
    /// Fully-qualified owner name, lowercase, no trailing dot.
    pub name: String,
    pub rtype: RecordType,
    pub ttl: u32,
    pub rdata: String,
}

// --- DHCP lease data model (SPEC_FULL §3) -----------------------------------

/// Shared lease-state enum for v4 and v6 leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    Free,
    Active,
    Expired,
    Released,
    Abandoned,
    Reserved,
    Backup,
    Unknown,
}

impl LeaseState {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseState::Free => "free",
            LeaseState::Active => "active",
            LeaseState::Expired => "expired",
            LeaseState::Released => "released",
            LeaseState::Abandoned => "abandoned",
            LeaseState::Reserved => "reserved",
            LeaseState::Backup => "backup",
            LeaseState::Unknown => "unknown",
        }
    }

    pub fn from_str_lenient(s: &str) -> LeaseState {
        match s.trim() {
            "free" => LeaseState::Free,
            "active" => LeaseState::Active,
            "expired" => LeaseState::Expired,
            "released" => LeaseState::Released,
            "abandoned" => LeaseState::Abandoned,
            "reserved" => LeaseState::Reserved,
            "backup" => LeaseState::Backup,
            _ => LeaseState::Unknown,
        }
    }
}

/// DHCPv4 lease record, persisted in the ISC-text lease log (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseV4 {
    pub lease_id: u64,
    pub ip_addr: Ipv4Addr,
    pub mac_addr: [u8; 6],
    pub starts: DateTime<Utc>,
    pub ends: DateTime<Utc>,
    pub tstp: DateTime<Utc>,
    pub cltt: DateTime<Utc>,
    pub state: LeaseState,
    pub next_binding_state: LeaseState,
    pub rewind_binding_state: LeaseState,
    /// Option 61 client identifier, raw bytes.
    pub client_id: Option<Vec<u8>>,
    pub hostname: Option<String>,
    /// Option 60 vendor class identifier.
    pub vendor_class: Option<String>,
    pub is_abandoned: bool,
    pub is_bootp: bool,
}

impl LeaseV4 {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.state == LeaseState::Active && self.ends < now
    }
}

/// DHCPv6 identity-association kind: non-temporary address or delegated prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ia6Kind {
    Na,
    Pd,
}

/// DHCPv6 lease record. IA_NA leases carry `address`; IA_PD leases carry
/// `prefix`/`prefix_len`. See §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseV6 {
    pub lease_id: u64,
    pub kind: Ia6Kind,
    pub duid: Vec<u8>,
    pub iaid: u32,
    /// Valid for `kind == Na`.
    pub address: Option<Ipv6Addr>,
    /// Valid for `kind == Pd`.
    pub prefix: Option<Ipv6Addr>,
    pub prefix_len: Option<u8>,
    pub starts: DateTime<Utc>,
    pub ends: DateTime<Utc>,
    pub tstp: DateTime<Utc>,
    pub cltt: DateTime<Utc>,
    pub state: LeaseState,
    pub hostname: Option<String>,
    pub vendor_class: Option<String>,
    pub fqdn: Option<String>,
}

impl LeaseV6 {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.state == LeaseState::Active && self.ends < now
    }
}

// --- Pool data model (SPEC_FULL §3) -----------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolEntryState {
    Available,
    Allocated,
    Reserved,
    Excluded,
    Conflict,
    Unknown,
}

/// One slot of a DHCPv4 address pool.
#[derive(Debug, Clone)]
pub struct PoolEntryV4 {
    pub addr: Ipv4Addr,
    pub state: PoolEntryState,
    pub last_allocated: Option<DateTime<Utc>>,
    pub owner_mac: Option<[u8; 6]>,
    pub lease_id: u64,
}

/// One slot of a DHCPv6 address pool.
#[derive(Debug, Clone)]
pub struct PoolEntryV6 {
    pub addr: Ipv6Addr,
    pub state: PoolEntryState,
    pub last_allocated: Option<DateTime<Utc>>,
    pub owner_duid: Option<String>,
    pub lease_id: u64,
}

/// One slot of a delegated-prefix pool.
#[derive(Debug, Clone)]
pub struct PdPoolEntry {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub state: PoolEntryState,
    pub last_allocated: Option<DateTime<Utc>>,
    pub owner_duid: Option<String>,
    pub lease_id: u64,
}

/// The operating mode of this instance. Federation/coordinator modes from the
/// donor workspace are out of scope; this enum is kept single-variant so the
/// `Config` shape this was lifted from still round-trips through serde without
/// surprising an operator's existing config file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceMode {
    #[default]
    Standalone,
}
