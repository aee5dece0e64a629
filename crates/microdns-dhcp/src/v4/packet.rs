//! DHCPv4 wire codec (§4.8). Packet layout: 236-byte BOOTP header + 4-byte
//! magic cookie + TLV options terminated by `END`.

use microdns_core::error::PacketError;
use std::net::Ipv4Addr;

/// DHCP message types (RFC 2132 section 9.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DhcpMessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl DhcpMessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            4 => Some(Self::Decline),
            5 => Some(Self::Ack),
            6 => Some(Self::Nak),
            7 => Some(Self::Release),
            8 => Some(Self::Inform),
            _ => None,
        }
    }
}

pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS_SERVER: u8 = 6;
pub const OPT_HOSTNAME: u8 = 12;
pub const OPT_DOMAIN_NAME: u8 = 15;
pub const OPT_BROADCAST: u8 = 28;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAMETER_LIST: u8 = 55;
pub const OPT_T1: u8 = 58;
pub const OPT_T2: u8 = 59;
pub const OPT_CLIENT_ID: u8 = 61;
pub const OPT_TFTP_SERVER: u8 = 66;
pub const OPT_BOOTFILE: u8 = 67;
pub const OPT_END: u8 = 255;
pub const OPT_PAD: u8 = 0;

const BOOTP_HEADER_LEN: usize = 236;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
/// §4.8: options area is up to 308 bytes, i.e. offset 312 is the overflow bound.
const MAX_PACKET_LEN: usize = BOOTP_HEADER_LEN + 4 + 308;

#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

#[derive(Debug, Clone)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl DhcpPacket {
    /// `validate` + parse in one step: rejects packets shorter than the BOOTP
    /// header plus magic cookie, and packets whose magic cookie is wrong.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < BOOTP_HEADER_LEN + 4 {
            return Err(PacketError::TooShort {
                expected: BOOTP_HEADER_LEN + 4,
                actual: data.len(),
            });
        }

        if data[BOOTP_HEADER_LEN..BOOTP_HEADER_LEN + 4] != MAGIC_COOKIE {
            return Err(PacketError::BadMagicCookie);
        }

        let op = data[0];
        let htype = data[1];
        let hlen = data[2];
        let hops = data[3];
        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);
        let ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        let options = parse_options(&data[240..]);

        Ok(DhcpPacket {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 240];

        buf[0] = self.op;
        buf[1] = self.htype;
        buf[2] = self.hlen;
        buf[3] = self.hops;
        buf[4..8].copy_from_slice(&self.xid.to_be_bytes());
        buf[8..10].copy_from_slice(&self.secs.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ciaddr.octets());
        buf[16..20].copy_from_slice(&self.yiaddr.octets());
        buf[20..24].copy_from_slice(&self.siaddr.octets());
        buf[24..28].copy_from_slice(&self.giaddr.octets());
        buf[28..44].copy_from_slice(&self.chaddr);
        buf[44..108].copy_from_slice(&self.sname);
        buf[108..236].copy_from_slice(&self.file);
        buf[236..240].copy_from_slice(&MAGIC_COOKIE);

        for opt in &self.options {
            buf.push(opt.code);
            if opt.code != OPT_END && opt.code != OPT_PAD {
                buf.push(opt.data.len() as u8);
                buf.extend_from_slice(&opt.data);
            }
        }

        if self.options.last().map(|o| o.code) != Some(OPT_END) {
            buf.push(OPT_END);
        }

        while buf.len() < 300 {
            buf.push(0);
        }

        buf
    }

    /// Appends an option at the current END, rewriting END after it, failing
    /// if the resulting offset would exceed the options-area bound.
    pub fn add_option(&mut self, code: u8, data: Vec<u8>) -> Result<(), PacketError> {
        let projected_len = 240
            + self.options.iter().map(|o| 2 + o.data.len()).sum::<usize>()
            + 2
            + data.len()
            + 1;
        if projected_len > MAX_PACKET_LEN {
            return Err(PacketError::OptionsOverflow { code });
        }
        if self.options.last().map(|o| o.code) == Some(OPT_END) {
            self.options.pop();
        }
        self.options.push(DhcpOption { code, data });
        self.options.push(DhcpOption {
            code: OPT_END,
            data: Vec::new(),
        });
        Ok(())
    }

    pub fn message_type(&self) -> Option<DhcpMessageType> {
        self.get_option(OPT_MESSAGE_TYPE)
            .and_then(|data| data.first().copied())
            .and_then(DhcpMessageType::from_u8)
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_REQUESTED_IP).and_then(|data| {
            if data.len() == 4 {
                Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
            } else {
                None
            }
        })
    }

    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_SERVER_ID).and_then(|data| {
            if data.len() == 4 {
                Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
            } else {
                None
            }
        })
    }

    pub fn hostname(&self) -> Option<String> {
        self.get_option(OPT_HOSTNAME)
            .and_then(|data| String::from_utf8(data.to_vec()).ok())
    }

    pub fn client_id(&self) -> Option<&[u8]> {
        self.get_option(OPT_CLIENT_ID)
    }

    pub fn get_option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.code == code)
            .map(|o| o.data.as_slice())
    }

    pub fn mac_address_bytes(&self) -> [u8; 6] {
        let len = (self.hlen as usize).min(6);
        let mut mac = [0u8; 6];
        mac[..len].copy_from_slice(&self.chaddr[..len]);
        mac
    }

    pub fn mac_address(&self) -> String {
        microdns_core::hex::to_colon_hex(&self.chaddr[..(self.hlen as usize).min(6)])
    }
}

fn parse_options(data: &[u8]) -> Vec<DhcpOption> {
    let mut options = Vec::new();
    let mut i = 0;

    while i < data.len() {
        let code = data[i];
        i += 1;

        if code == OPT_END {
            options.push(DhcpOption {
                code: OPT_END,
                data: Vec::new(),
            });
            break;
        }
        if code == OPT_PAD {
            continue;
        }
        if i >= data.len() {
            break;
        }

        let len = data[i] as usize;
        i += 1;
        if i + len > data.len() {
            break;
        }

        options.push(DhcpOption {
            code,
            data: data[i..i + len].to_vec(),
        });
        i += len;
    }

    options
}

pub fn ip_option(code: u8, addr: Ipv4Addr) -> DhcpOption {
    DhcpOption {
        code,
        data: addr.octets().to_vec(),
    }
}

pub fn u32_option(code: u8, val: u32) -> DhcpOption {
    DhcpOption {
        code,
        data: val.to_be_bytes().to_vec(),
    }
}

pub fn ip_list_option(code: u8, addrs: &[Ipv4Addr]) -> DhcpOption {
    let mut data = Vec::new();
    for addr in addrs {
        data.extend_from_slice(&addr.octets());
    }
    DhcpOption { code, data }
}

pub fn string_option(code: u8, s: &str) -> DhcpOption {
    DhcpOption {
        code,
        data: s.as_bytes().to_vec(),
    }
}

pub fn message_type_option(msg_type: DhcpMessageType) -> DhcpOption {
    DhcpOption {
        code: OPT_MESSAGE_TYPE,
        data: vec![msg_type as u8],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_packet(msg_type: DhcpMessageType) -> DhcpPacket {
        DhcpPacket {
            op: 1,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 0x1234_5678,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: {
                let mut c = [0u8; 16];
                c[0..6].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
                c
            },
            sname: [0u8; 64],
            file: [0u8; 128],
            options: vec![
                message_type_option(msg_type),
                DhcpOption {
                    code: OPT_END,
                    data: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn roundtrip() {
        let packet = base_packet(DhcpMessageType::Discover);
        let bytes = packet.to_bytes();
        let parsed = DhcpPacket::parse(&bytes).unwrap();

        assert_eq!(parsed.op, 1);
        assert_eq!(parsed.xid, 0x1234_5678);
        assert_eq!(parsed.flags, 0x8000);
        assert_eq!(parsed.message_type(), Some(DhcpMessageType::Discover));
        assert_eq!(parsed.mac_address(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(parsed.mac_address_bytes(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn rejects_bad_magic_cookie() {
        let packet = base_packet(DhcpMessageType::Discover);
        let mut bytes = packet.to_bytes();
        bytes[236] = 0;
        assert!(matches!(
            DhcpPacket::parse(&bytes),
            Err(PacketError::BadMagicCookie)
        ));
    }

    #[test]
    fn rejects_too_short() {
        assert!(matches!(
            DhcpPacket::parse(&[0u8; 10]),
            Err(PacketError::TooShort { .. })
        ));
    }

    #[test]
    fn t1_t2_and_client_id_roundtrip() {
        let mut packet = base_packet(DhcpMessageType::Request);
        packet
            .add_option(OPT_T1, 1800u32.to_be_bytes().to_vec())
            .unwrap();
        packet
            .add_option(OPT_T2, 3150u32.to_be_bytes().to_vec())
            .unwrap();
        packet
            .add_option(OPT_CLIENT_ID, vec![1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
            .unwrap();

        let bytes = packet.to_bytes();
        let parsed = DhcpPacket::parse(&bytes).unwrap();
        assert_eq!(
            parsed.get_option(OPT_T1).unwrap(),
            &1800u32.to_be_bytes()[..]
        );
        assert_eq!(
            parsed.client_id().unwrap(),
            &[1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff][..]
        );
    }

    #[test]
    fn pxe_fields_roundtrip() {
        let mut sname = [0u8; 64];
        let sname_str = b"pxeserver";
        sname[..sname_str.len()].copy_from_slice(sname_str);
        let mut file = [0u8; 128];
        let file_str = b"pxelinux.0";
        file[..file_str.len()].copy_from_slice(file_str);

        let mut packet = base_packet(DhcpMessageType::Offer);
        packet.yiaddr = "10.0.10.100".parse().unwrap();
        packet.siaddr = "10.0.10.5".parse().unwrap();
        packet.sname = sname;
        packet.file = file;

        let bytes = packet.to_bytes();
        let parsed = DhcpPacket::parse(&bytes).unwrap();

        assert_eq!(parsed.siaddr, "10.0.10.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(&parsed.sname[..sname_str.len()], sname_str);
        assert_eq!(&parsed.file[..file_str.len()], file_str);
    }
}
