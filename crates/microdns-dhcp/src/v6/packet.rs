//! DHCPv6 wire codec (§4.9). Header: 1-byte message type + 3-byte
//! transaction id, followed by `{code(u16), len(u16), value[len]}` options,
//! all big-endian.

use microdns_core::error::PacketError;
use std::net::Ipv6Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Dhcpv6MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
    Decline = 9,
    Reconfigure = 10,
    InformationRequest = 11,
}

impl Dhcpv6MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Solicit),
            2 => Some(Self::Advertise),
            3 => Some(Self::Request),
            4 => Some(Self::Confirm),
            5 => Some(Self::Renew),
            6 => Some(Self::Rebind),
            7 => Some(Self::Reply),
            8 => Some(Self::Release),
            9 => Some(Self::Decline),
            10 => Some(Self::Reconfigure),
            11 => Some(Self::InformationRequest),
            _ => None,
        }
    }
}

pub const OPT_CLIENTID: u16 = 1;
pub const OPT_SERVERID: u16 = 2;
pub const OPT_IA_NA: u16 = 3;
pub const OPT_IAADDR: u16 = 5;
pub const OPT_ORO: u16 = 6;
pub const OPT_PREFERENCE: u16 = 7;
pub const OPT_ELAPSED_TIME: u16 = 8;
pub const OPT_RELAY_MSG: u16 = 9;
pub const OPT_STATUS_CODE: u16 = 13;
pub const OPT_DNS_SERVERS: u16 = 23;
pub const OPT_DOMAIN_LIST: u16 = 24;
pub const OPT_IA_PD: u16 = 25;
pub const OPT_IAPREFIX: u16 = 26;
pub const OPT_SNTP_SERVERS: u16 = 31;
pub const OPT_INFO_REFRESH_TIME: u16 = 32;

pub const STATUS_SUCCESS: u16 = 0;
pub const STATUS_NO_ADDRS_AVAIL: u16 = 2;
pub const STATUS_NO_PREFIX_AVAIL: u16 = 6;

#[derive(Debug, Clone)]
pub struct Dhcpv6Packet {
    pub msg_type: u8,
    pub transaction_id: [u8; 3],
    pub options: Vec<Dhcpv6Option>,
}

#[derive(Debug, Clone)]
pub struct Dhcpv6Option {
    pub code: u16,
    pub data: Vec<u8>,
}

/// A requested IA_NA extracted from the client packet: the IAID plus an
/// optional hinted address from a nested IAADDR sub-option.
#[derive(Debug, Clone, Copy)]
pub struct RequestedIaNa {
    pub iaid: u32,
    pub hint: Option<Ipv6Addr>,
}

/// A requested IA_PD extracted from the client packet: the IAID plus an
/// optional hinted prefix/length from a nested IAPREFIX sub-option.
#[derive(Debug, Clone, Copy)]
pub struct RequestedIaPd {
    pub iaid: u32,
    pub hint: Option<(Ipv6Addr, u8)>,
}

impl Dhcpv6Packet {
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < 4 {
            return Err(PacketError::TooShort {
                expected: 4,
                actual: data.len(),
            });
        }

        let msg_type = data[0];
        let transaction_id = [data[1], data[2], data[3]];
        let options = parse_v6_options(&data[4..])?;

        Ok(Self {
            msg_type,
            transaction_id,
            options,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.msg_type);
        buf.extend_from_slice(&self.transaction_id);

        for opt in &self.options {
            buf.extend_from_slice(&opt.code.to_be_bytes());
            buf.extend_from_slice(&(opt.data.len() as u16).to_be_bytes());
            buf.extend_from_slice(&opt.data);
        }

        buf
    }

    pub fn message_type(&self) -> Option<Dhcpv6MessageType> {
        Dhcpv6MessageType::from_u8(self.msg_type)
    }

    pub fn get_option(&self, code: u16) -> Option<&Dhcpv6Option> {
        self.options.iter().find(|o| o.code == code)
    }

    pub fn client_id(&self) -> Option<Vec<u8>> {
        self.get_option(OPT_CLIENTID).map(|o| o.data.clone())
    }

    pub fn server_id(&self) -> Option<Vec<u8>> {
        self.get_option(OPT_SERVERID).map(|o| o.data.clone())
    }

    /// Extracts the top-level IA_NA's IAID and an optional hinted address
    /// from its nested IAADDR sub-option (offset 12 within the IA_NA body).
    pub fn requested_ia_na(&self) -> Option<RequestedIaNa> {
        let opt = self.get_option(OPT_IA_NA)?;
        if opt.data.len() < 12 {
            return None;
        }
        let iaid = u32::from_be_bytes([opt.data[0], opt.data[1], opt.data[2], opt.data[3]]);
        let hint = parse_sub_options(&opt.data[12..])
            .into_iter()
            .find(|o| o.code == OPT_IAADDR)
            .filter(|o| o.data.len() >= 16)
            .map(|o| {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&o.data[..16]);
                Ipv6Addr::from(octets)
            });
        Some(RequestedIaNa { iaid, hint })
    }

    /// Extracts the top-level IA_PD's IAID and an optional hinted
    /// prefix/length from its nested IAPREFIX sub-option.
    pub fn requested_ia_pd(&self) -> Option<RequestedIaPd> {
        let opt = self.get_option(OPT_IA_PD)?;
        if opt.data.len() < 12 {
            return None;
        }
        let iaid = u32::from_be_bytes([opt.data[0], opt.data[1], opt.data[2], opt.data[3]]);
        let hint = parse_sub_options(&opt.data[12..])
            .into_iter()
            .find(|o| o.code == OPT_IAPREFIX)
            .filter(|o| o.data.len() >= 25)
            .map(|o| {
                let plen = o.data[8];
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&o.data[9..25]);
                (Ipv6Addr::from(octets), plen)
            });
        Some(RequestedIaPd { iaid, hint })
    }
}

fn parse_sub_options(data: &[u8]) -> Vec<Dhcpv6Option> {
    parse_v6_options(data).unwrap_or_default()
}

fn parse_v6_options(data: &[u8]) -> Result<Vec<Dhcpv6Option>, PacketError> {
    let mut options = Vec::new();
    let mut i = 0;

    while i + 4 <= data.len() {
        let code = u16::from_be_bytes([data[i], data[i + 1]]);
        let len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
        i += 4;

        if i + len > data.len() {
            return Err(PacketError::TruncatedOption { offset: i });
        }

        options.push(Dhcpv6Option {
            code,
            data: data[i..i + len].to_vec(),
        });
        i += len;
    }

    Ok(options)
}

pub fn build_server_id(duid: &[u8]) -> Dhcpv6Option {
    Dhcpv6Option {
        code: OPT_SERVERID,
        data: duid.to_vec(),
    }
}

pub fn build_client_id_echo(duid: &[u8]) -> Dhcpv6Option {
    Dhcpv6Option {
        code: OPT_CLIENTID,
        data: duid.to_vec(),
    }
}

/// Builds a DUID-LL (type 3, Ethernet hardware type 1) from a MAC address —
/// this server's own stable identity for the lease file header and ServerID option.
pub fn duid_ll(mac: &[u8; 6]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&3u16.to_be_bytes());
    data.extend_from_slice(&1u16.to_be_bytes());
    data.extend_from_slice(mac);
    data
}

pub fn build_dns_option(servers: &[Ipv6Addr]) -> Dhcpv6Option {
    let mut data = Vec::new();
    for s in servers {
        data.extend_from_slice(&s.octets());
    }
    Dhcpv6Option {
        code: OPT_DNS_SERVERS,
        data,
    }
}

pub fn build_sntp_option(servers: &[Ipv6Addr]) -> Dhcpv6Option {
    let mut data = Vec::new();
    for s in servers {
        data.extend_from_slice(&s.octets());
    }
    Dhcpv6Option {
        code: OPT_SNTP_SERVERS,
        data,
    }
}

pub fn build_info_refresh_option(seconds: u32) -> Dhcpv6Option {
    Dhcpv6Option {
        code: OPT_INFO_REFRESH_TIME,
        data: seconds.to_be_bytes().to_vec(),
    }
}

pub fn build_preference_option(value: u8) -> Dhcpv6Option {
    Dhcpv6Option {
        code: OPT_PREFERENCE,
        data: vec![value],
    }
}

/// Builds a DOMAIN_LIST option (RFC 3646) from a comma-separated list of
/// search domains, RFC 1035 label-encoding each one.
pub fn build_domain_search_option(domains: &str) -> Dhcpv6Option {
    let mut data = Vec::new();
    for domain in domains.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        for label in domain.trim_end_matches('.').split('.') {
            let bytes = label.as_bytes();
            data.push(bytes.len() as u8);
            data.extend_from_slice(bytes);
        }
        data.push(0);
    }
    Dhcpv6Option {
        code: OPT_DOMAIN_LIST,
        data,
    }
}

/// Builds a top-level IA_NA with one nested IAADDR sub-option.
pub fn build_ia_na(iaid: u32, addr: Ipv6Addr, preferred: u32, valid: u32) -> Dhcpv6Option {
    let mut data = Vec::new();
    data.extend_from_slice(&iaid.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes()); // T1
    data.extend_from_slice(&0u32.to_be_bytes()); // T2

    let mut ia_addr = Vec::new();
    ia_addr.extend_from_slice(&addr.octets());
    ia_addr.extend_from_slice(&preferred.to_be_bytes());
    ia_addr.extend_from_slice(&valid.to_be_bytes());

    data.extend_from_slice(&OPT_IAADDR.to_be_bytes());
    data.extend_from_slice(&(ia_addr.len() as u16).to_be_bytes());
    data.extend_from_slice(&ia_addr);

    Dhcpv6Option {
        code: OPT_IA_NA,
        data,
    }
}

/// Builds a top-level IA_NA carrying a Status Code sub-option instead of an
/// address (used for NoAddrsAvail).
pub fn build_ia_na_status(iaid: u32, status: u16) -> Dhcpv6Option {
    let mut data = Vec::new();
    data.extend_from_slice(&iaid.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());

    let status_opt = status.to_be_bytes();
    data.extend_from_slice(&OPT_STATUS_CODE.to_be_bytes());
    data.extend_from_slice(&(status_opt.len() as u16).to_be_bytes());
    data.extend_from_slice(&status_opt);

    Dhcpv6Option {
        code: OPT_IA_NA,
        data,
    }
}

/// Builds a top-level IA_PD with one nested IAPREFIX sub-option.
pub fn build_ia_pd(iaid: u32, prefix: Ipv6Addr, plen: u8, preferred: u32, valid: u32) -> Dhcpv6Option {
    let mut data = Vec::new();
    data.extend_from_slice(&iaid.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());

    let mut ia_prefix = Vec::new();
    ia_prefix.extend_from_slice(&preferred.to_be_bytes());
    ia_prefix.extend_from_slice(&valid.to_be_bytes());
    ia_prefix.push(plen);
    ia_prefix.extend_from_slice(&prefix.octets());

    data.extend_from_slice(&OPT_IAPREFIX.to_be_bytes());
    data.extend_from_slice(&(ia_prefix.len() as u16).to_be_bytes());
    data.extend_from_slice(&ia_prefix);

    Dhcpv6Option {
        code: OPT_IA_PD,
        data,
    }
}

pub fn build_ia_pd_status(iaid: u32, status: u16) -> Dhcpv6Option {
    let mut data = Vec::new();
    data.extend_from_slice(&iaid.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());

    let status_opt = status.to_be_bytes();
    data.extend_from_slice(&OPT_STATUS_CODE.to_be_bytes());
    data.extend_from_slice(&(status_opt.len() as u16).to_be_bytes());
    data.extend_from_slice(&status_opt);

    Dhcpv6Option {
        code: OPT_IA_PD,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_client_id() {
        let packet = Dhcpv6Packet {
            msg_type: 1,
            transaction_id: [0x12, 0x34, 0x56],
            options: vec![Dhcpv6Option {
                code: OPT_CLIENTID,
                data: vec![0, 1, 0, 1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
            }],
        };

        let bytes = packet.to_bytes();
        let parsed = Dhcpv6Packet::parse(&bytes).unwrap();

        assert_eq!(parsed.msg_type, 1);
        assert_eq!(parsed.transaction_id, [0x12, 0x34, 0x56]);
        assert!(parsed.client_id().is_some());
    }

    #[test]
    fn requested_ia_na_extracts_hint() {
        let ia_na = build_ia_na(7, "2001:db8:1::100".parse().unwrap(), 3600, 7200);
        let packet = Dhcpv6Packet {
            msg_type: 3,
            transaction_id: [1, 2, 3],
            options: vec![ia_na],
        };
        let req = packet.requested_ia_na().unwrap();
        assert_eq!(req.iaid, 7);
        assert_eq!(req.hint, Some("2001:db8:1::100".parse().unwrap()));
    }

    #[test]
    fn requested_ia_pd_extracts_hint() {
        let ia_pd = build_ia_pd(9, "2001:db8:3::".parse().unwrap(), 56, 3600, 7200);
        let packet = Dhcpv6Packet {
            msg_type: 3,
            transaction_id: [1, 2, 3],
            options: vec![ia_pd],
        };
        let req = packet.requested_ia_pd().unwrap();
        assert_eq!(req.iaid, 9);
        assert_eq!(req.hint, Some(("2001:db8:3::".parse().unwrap(), 56)));
    }

    #[test]
    fn rejects_truncated_option() {
        let mut bytes = vec![1, 0, 0, 0];
        bytes.extend_from_slice(&OPT_CLIENTID.to_be_bytes());
        bytes.extend_from_slice(&10u16.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3]); // shorter than declared length
        assert!(matches!(
            Dhcpv6Packet::parse(&bytes),
            Err(PacketError::TruncatedOption { .. })
        ));
    }
}
