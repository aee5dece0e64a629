//! ICMP/ICMPv6 echo probe (§4.7), used by the address pools to check a
//! candidate IP is genuinely unused before offering it. Grounded on
//! `bluecatengineering-dora/libs/icmp-ping`'s `icmp.rs` encode/decode shape,
//! built directly on blocking `socket2` raw sockets rather than dora's
//! `Future`-returning pinger (this probe is invoked from a `spawn_blocking`
//! context, not polled as its own future).

use pnet_packet::icmp::{self, echo_request::MutableEchoRequestPacket, IcmpTypes};
use pnet_packet::icmpv6::{self, Icmpv6Types};
use pnet_packet::Packet;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

const ICMP_HEADER_LEN: usize = 8;
const PAYLOAD: &[u8] = b"microdns-probe";

/// Sends one echo request to `ip` and waits up to `timeout` for a matching
/// reply. Returns `true` iff a reply matching this probe's id/seq arrives.
/// If the raw socket cannot be opened (no `CAP_NET_RAW`), returns `false`
/// immediately — probing is advisory and this is a deliberate fail-open,
/// unlike dora's unprivileged-DGRAM fallback.
pub fn ping(ip: IpAddr, timeout: Duration) -> bool {
    match ip {
        IpAddr::V4(addr) => ping_v4(addr, timeout),
        IpAddr::V6(addr) => ping_v6(addr, timeout),
    }
}

fn ping_v4(addr: Ipv4Addr, timeout: Duration) -> bool {
    let socket = match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let ident = (std::process::id() & 0xffff) as u16;
    let seq: u16 = 1;

    let mut buf = vec![0u8; ICMP_HEADER_LEN + PAYLOAD.len()];
    {
        let mut packet = match MutableEchoRequestPacket::new(&mut buf) {
            Some(p) => p,
            None => return false,
        };
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_identifier(ident);
        packet.set_sequence_number(seq);
        packet.set_payload(PAYLOAD);
        let checksum = icmp::checksum(&icmp::IcmpPacket::new(packet.packet()).unwrap());
        packet.set_checksum(checksum);
    }

    if socket.set_read_timeout(Some(timeout)).is_err() {
        return false;
    }

    let dest = SockAddr::from(SocketAddr::new(IpAddr::V4(addr), 0));
    if socket.send_to(&buf, &dest).is_err() {
        return false;
    }

    let deadline = std::time::Instant::now() + timeout;
    let mut recv_buf = [std::mem::MaybeUninit::uninit(); 128];

    while std::time::Instant::now() < deadline {
        match socket.recv_from(&mut recv_buf) {
            Ok((len, _from)) => {
                let bytes: Vec<u8> = recv_buf[..len]
                    .iter()
                    .map(|b| unsafe { b.assume_init() })
                    .collect();
                // IPv4 raw sockets deliver the IP header too; the IHL low
                // nibble of the first byte gives its length in 32-bit words.
                if bytes.is_empty() {
                    continue;
                }
                let ihl = (bytes[0] & 0x0f) as usize * 4;
                if bytes.len() < ihl + ICMP_HEADER_LEN {
                    continue;
                }
                let icmp_slice = &bytes[ihl..];
                if let Some(reply) = icmp::echo_reply::EchoReplyPacket::new(icmp_slice) {
                    if reply.get_icmp_type() == IcmpTypes::EchoReply
                        && reply.get_identifier() == ident
                        && reply.get_sequence_number() == seq
                    {
                        return true;
                    }
                }
            }
            Err(_) => break,
        }
    }

    false
}

fn ping_v6(addr: Ipv6Addr, timeout: Duration) -> bool {
    let socket = match Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6)) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let ident = (std::process::id() & 0xffff) as u16;
    let seq: u16 = 1;

    let mut buf = vec![0u8; ICMP_HEADER_LEN + PAYLOAD.len()];
    buf[0] = Icmpv6Types::EchoRequest.0;
    buf[1] = 0;
    buf[4..6].copy_from_slice(&ident.to_be_bytes());
    buf[6..8].copy_from_slice(&seq.to_be_bytes());
    buf[8..].copy_from_slice(PAYLOAD);
    // The kernel computes the ICMPv6 checksum over the pseudo-header for us
    // on a raw socket; we leave bytes 2..4 as zero.

    if socket.set_read_timeout(Some(timeout)).is_err() {
        return false;
    }

    let dest = SockAddr::from(SocketAddr::new(IpAddr::V6(addr), 0));
    if socket.send_to(&buf, &dest).is_err() {
        return false;
    }

    let deadline = std::time::Instant::now() + timeout;
    let mut recv_buf = [std::mem::MaybeUninit::uninit(); 128];

    while std::time::Instant::now() < deadline {
        match socket.recv_from(&mut recv_buf) {
            Ok((len, _from)) => {
                let bytes: Vec<u8> = recv_buf[..len]
                    .iter()
                    .map(|b| unsafe { b.assume_init() })
                    .collect();
                if let Some(packet) = icmpv6::Icmpv6Packet::new(&bytes) {
                    if packet.get_icmpv6_type() == Icmpv6Types::EchoReply {
                        let payload = packet.payload();
                        if payload.len() >= 4
                            && u16::from_be_bytes([payload[0], payload[1]]) == ident
                            && u16::from_be_bytes([payload[2], payload[3]]) == seq
                        {
                            return true;
                        }
                    }
                }
            }
            Err(_) => break,
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_target_times_out_quickly() {
        // Without CAP_NET_RAW this returns false immediately via the socket
        // open failure path; with it, a non-routable address should time out
        // within the bound rather than hang.
        let reachable = ping(
            IpAddr::V4("192.0.2.1".parse().unwrap()),
            Duration::from_millis(50),
        );
        assert!(!reachable);
    }
}
