//! DHCPv4 server state machine (§4.8). Dispatch by message type; allocation
//! routes through the `v4::pool::AddressPoolV4` priority rules, persistence
//! through the `AsyncIoQueue`, and inbound datagrams through the
//! `WorkerPool` rather than one bare `tokio::spawn` per packet.

use crate::icmp;
use crate::io_queue::{AsyncIoQueue, IoOp};
use crate::lease::v4::LeaseStoreV4;
use crate::v4::packet::*;
use crate::v4::pool::AddressPoolV4;
use crate::workerpool::{Datagram, WorkerPool};
use chrono::Utc;
use microdns_core::config::{DhcpReservation, DhcpV4Config, DhcpV4Pool};
use microdns_core::stats::ShmStats;
use microdns_core::types::{LeaseState, LeaseV4};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct PxeConfig {
    next_server: Ipv4Addr,
    boot_file: String,
}

struct PoolSlot {
    pool: AddressPoolV4,
    range_start: Ipv4Addr,
    range_end: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    router: Ipv4Addr,
    dns_servers: Vec<Ipv4Addr>,
    domain: Option<String>,
    default_lease_time: u32,
    t1: Option<u32>,
    t2: Option<u32>,
    ping_check: bool,
    ping_timeout_ms: u64,
    pxe: Option<PxeConfig>,
}

impl PoolSlot {
    fn contains(&self, addr: Ipv4Addr) -> bool {
        let start: u32 = self.range_start.into();
        let end: u32 = self.range_end.into();
        let ip: u32 = addr.into();
        ip >= start && ip <= end
    }
}

struct Dhcpv4State {
    pools: Vec<PoolSlot>,
    reservations: Vec<(u64, [u8; 6], Ipv4Addr, Option<String>)>,
}

pub struct Dhcpv4Server {
    state: Arc<Mutex<Dhcpv4State>>,
    lease_store: Arc<Mutex<LeaseStoreV4>>,
    io_queue: Arc<AsyncIoQueue<LeaseV4>>,
    stats: Option<Arc<ShmStats>>,
    server_ip: Ipv4Addr,
    workers: usize,
    queue_capacity: usize,
}

fn subnet_mask_from_prefix(prefix_len: u8) -> Ipv4Addr {
    if prefix_len == 0 {
        return Ipv4Addr::UNSPECIFIED;
    }
    if prefix_len >= 32 {
        return Ipv4Addr::BROADCAST;
    }
    let mask: u32 = !0u32 << (32 - prefix_len);
    Ipv4Addr::from(mask)
}

fn prefix_len_from_subnet(subnet: &str) -> u8 {
    subnet.split('/').nth(1).and_then(|s| s.parse().ok()).unwrap_or(24)
}

fn network_and_broadcast(subnet: &str) -> anyhow::Result<(Ipv4Addr, Ipv4Addr)> {
    let addr_str = subnet.split('/').next().unwrap_or(subnet);
    let addr: Ipv4Addr = addr_str.parse()?;
    let plen = prefix_len_from_subnet(subnet);
    let mask = subnet_mask_from_prefix(plen);
    let network = u32::from(addr) & u32::from(mask);
    let broadcast = network | !u32::from(mask);
    Ok((Ipv4Addr::from(network), Ipv4Addr::from(broadcast)))
}

/// Binds the privileged port first; on permission failure (running unprivileged,
/// §6's CLI note) falls back to the unprivileged port instead of aborting startup.
async fn bind_with_privileged_fallback(
    host: &str,
    privileged_port: u16,
    fallback_port: u16,
) -> anyhow::Result<UdpSocket> {
    match UdpSocket::bind((host, privileged_port)).await {
        Ok(socket) => Ok(socket),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            warn!(
                "cannot bind port {privileged_port} ({e}), falling back to port {fallback_port}"
            );
            Ok(UdpSocket::bind((host, fallback_port)).await?)
        }
        Err(e) => Err(e.into()),
    }
}

impl Dhcpv4Server {
    pub fn new(
        config: &DhcpV4Config,
        lease_store: LeaseStoreV4,
        stats: Option<Arc<ShmStats>>,
    ) -> anyhow::Result<Self> {
        let mut reservations = Vec::new();
        let mut next_res_id = 1u64;
        for res in &config.reservations {
            let mac = microdns_core::hex::mac_from_colon_hex(&res.mac)
                .ok_or_else(|| anyhow::anyhow!("bad reservation mac: {}", res.mac))?;
            let ip: Ipv4Addr = res.ip.parse()?;
            reservations.push((next_res_id, mac, ip, res.hostname.clone()));
            next_res_id += 1;
        }
        let reservation_pairs: Vec<([u8; 6], Ipv4Addr)> =
            reservations.iter().map(|(_, mac, ip, _)| (*mac, *ip)).collect();

        let mut pools = Vec::new();
        for pool_cfg in &config.pools {
            pools.push(build_pool_slot(pool_cfg, &reservation_pairs)?);
        }

        let server_ip = pools.first().map(|p| p.router).unwrap_or(Ipv4Addr::UNSPECIFIED);

        let state = Arc::new(Mutex::new(Dhcpv4State { pools, reservations }));
        {
            let mut guard = state.lock().unwrap();
            let active: Vec<LeaseV4> = lease_store.active_leases().cloned().collect();
            for pool in guard.pools.iter_mut() {
                pool.pool.sync_from_leases(&active);
            }
        }

        let lease_store = Arc::new(Mutex::new(lease_store));
        let lease_store_writer = lease_store.clone();
        let io_queue = Arc::new(AsyncIoQueue::spawn(
            config.queue_capacity,
            move |lease: LeaseV4| {
                let mut store = lease_store_writer.lock().unwrap();
                store.upsert(lease);
                if let Err(e) = store.save() {
                    error!("dhcpv4 lease save failed: {e}");
                }
            },
            {
                let lease_store_writer = lease_store.clone();
                move || {
                    let store = lease_store_writer.lock().unwrap();
                    if let Err(e) = store.save() {
                        error!("dhcpv4 full lease rewrite failed: {e}");
                    }
                }
            },
        ));

        Ok(Dhcpv4Server {
            state,
            lease_store,
            io_queue,
            stats,
            server_ip,
            workers: config.workers,
            queue_capacity: config.queue_capacity,
        })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let socket = Arc::new(bind_with_privileged_fallback("0.0.0.0", 67, 6767).await?);
        socket.set_broadcast(true)?;
        info!(addr = %socket.local_addr()?, "DHCPv4 server listening");

        let state = self.state.clone();
        let lease_store = self.lease_store.clone();
        let io_queue = self.io_queue.clone();
        let stats = self.stats.clone();
        let server_ip = self.server_ip;
        let send_socket = socket.clone();

        let pool = WorkerPool::create(self.workers, self.queue_capacity, move |datagram: Datagram| {
            let state = state.clone();
            let lease_store = lease_store.clone();
            let io_queue = io_queue.clone();
            let stats = stats.clone();
            let socket = send_socket.clone();
            async move {
                if let Some(s) = &stats {
                    s.stats().incr_received();
                }
                let outcome = tokio::task::spawn_blocking(move || {
                    handle_datagram(&state, &lease_store, &io_queue, server_ip, &datagram.bytes)
                })
                .await;

                match outcome {
                    Ok(Some((response, dest))) => {
                        if let Some(s) = &stats {
                            s.stats().incr_processed();
                        }
                        let bytes = response.to_bytes();
                        if let Err(e) = socket.send_to(&bytes, dest).await {
                            error!("failed to send DHCP response: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if let Some(s) = &stats {
                            s.stats().incr_errors();
                        }
                        error!("dhcpv4 worker panicked: {e}");
                    }
                }
            }
        });

        let mut buf = vec![0u8; 1500];
        let mut shutdown = shutdown;

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, peer) = result?;
                    if pool.dispatch(Datagram { bytes: buf[..len].to_vec(), peer }).is_err() {
                        warn!("dhcpv4 worker pool full, dropping datagram from {peer}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("DHCPv4 server shutting down");
                        break;
                    }
                }
            }
        }

        pool.destroy().await;
        self.io_queue.enqueue(IoOp::Shutdown);
        Ok(())
    }

    pub fn io_queue(&self) -> Arc<AsyncIoQueue<LeaseV4>> {
        self.io_queue.clone()
    }

    pub fn lease_store(&self) -> Arc<Mutex<LeaseStoreV4>> {
        self.lease_store.clone()
    }
}

fn build_pool_slot(
    cfg: &DhcpV4Pool,
    reservations: &[([u8; 6], Ipv4Addr)],
) -> anyhow::Result<PoolSlot> {
    let range_start: Ipv4Addr = cfg.range_start.parse()?;
    let range_end: Ipv4Addr = cfg.range_end.parse()?;
    let (network, broadcast) = network_and_broadcast(&cfg.subnet)?;
    let router: Ipv4Addr = cfg.router.parse()?;
    let plen = prefix_len_from_subnet(&cfg.subnet);
    let subnet_mask = subnet_mask_from_prefix(plen);

    let dns_servers: Vec<Ipv4Addr> = cfg.dns.iter().filter_map(|s| s.parse().ok()).collect();

    let pool_reservations: Vec<([u8; 6], Ipv4Addr)> = reservations
        .iter()
        .filter(|(_, ip)| {
            let ip_u32: u32 = (*ip).into();
            let start: u32 = range_start.into();
            let end: u32 = range_end.into();
            ip_u32 >= start && ip_u32 <= end
        })
        .cloned()
        .collect();

    let pool = AddressPoolV4::init(
        range_start,
        range_end,
        network,
        broadcast,
        router,
        &pool_reservations,
    );

    let pxe = match (&cfg.next_server, &cfg.boot_file) {
        (Some(ns), Some(bf)) => Some(PxeConfig {
            next_server: ns.parse()?,
            boot_file: bf.clone(),
        }),
        _ => None,
    };

    Ok(PoolSlot {
        pool,
        range_start,
        range_end,
        subnet_mask,
        router,
        dns_servers,
        domain: cfg.domain.clone(),
        default_lease_time: cfg.default_lease_time_secs,
        t1: cfg.t1_secs,
        t2: cfg.t2_secs,
        ping_check: cfg.ping_check,
        ping_timeout_ms: cfg.ping_timeout_ms,
        pxe,
    })
}

/// Runs the whole per-datagram state machine synchronously (invoked from
/// `spawn_blocking`, see §5's "no lock held across an await" rule — here
/// there is simply no `.await` in scope, including during ICMP probing).
fn handle_datagram(
    state: &Mutex<Dhcpv4State>,
    lease_store: &Mutex<LeaseStoreV4>,
    io_queue: &AsyncIoQueue<LeaseV4>,
    server_ip: Ipv4Addr,
    data: &[u8],
) -> Option<(DhcpPacket, SocketAddr)> {
    let request = match DhcpPacket::parse(data) {
        Ok(p) => p,
        Err(e) => {
            debug!("invalid DHCPv4 packet: {e}");
            return None;
        }
    };

    if request.op != 1 {
        return None;
    }

    let msg_type = request.message_type()?;
    let mac = request.mac_address_bytes();
    debug!(?msg_type, mac = %request.mac_address(), xid = request.xid, "dhcpv4 packet");

    let response = match msg_type {
        DhcpMessageType::Discover => handle_discover(state, lease_store, server_ip, &request, mac),
        DhcpMessageType::Request => handle_request(state, lease_store, io_queue, server_ip, &request, mac),
        DhcpMessageType::Release => {
            handle_release(state, lease_store, io_queue, &request, mac);
            None
        }
        _ => {
            warn!(?msg_type, "unhandled dhcpv4 message type");
            None
        }
    }?;

    let dest = response_destination(&request, &response);
    Some((response, dest))
}

fn response_destination(request: &DhcpPacket, response: &DhcpPacket) -> SocketAddr {
    if request.giaddr != Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(request.giaddr.into(), 67)
    } else if request.flags & 0x8000 != 0 || response.yiaddr == Ipv4Addr::UNSPECIFIED {
        SocketAddr::new(Ipv4Addr::BROADCAST.into(), 68)
    } else {
        SocketAddr::new(response.yiaddr.into(), 68)
    }
}

fn handle_discover(
    state: &Mutex<Dhcpv4State>,
    lease_store: &Mutex<LeaseStoreV4>,
    server_ip: Ipv4Addr,
    request: &DhcpPacket,
    mac: [u8; 6],
) -> Option<DhcpPacket> {
    // Existing lease by MAC takes priority over a fresh allocation.
    if let Some(ip) = {
        let store = lease_store.lock().unwrap();
        store.find_active_by_mac(mac).map(|l| l.ip_addr)
    } {
        let mut guard = state.lock().unwrap();
        if let Some(slot) = guard.pools.iter_mut().find(|s| s.contains(ip)) {
            return Some(build_response(request, slot, server_ip, ip, DhcpMessageType::Offer));
        }
    }

    let requested = request.requested_ip();
    let mut guard = state.lock().unwrap();
    let n_slots = guard.pools.len();
    for idx in 0..n_slots {
        let (ping_check, ping_timeout_ms) = {
            let slot = &guard.pools[idx];
            (slot.ping_check, slot.ping_timeout_ms)
        };
        let timeout = Duration::from_millis(ping_timeout_ms);
        let slot = &mut guard.pools[idx];
        let result = slot.pool.allocate(mac, requested, |addr| {
            ping_check && icmp::ping(addr.into(), timeout)
        });
        if let Ok(ip) = result {
            return Some(build_response(request, slot, server_ip, ip, DhcpMessageType::Offer));
        }
    }

    warn!(mac = %microdns_core::hex::to_colon_hex(&mac), "no available dhcpv4 address");
    None
}

fn handle_request(
    state: &Mutex<Dhcpv4State>,
    lease_store: &Mutex<LeaseStoreV4>,
    io_queue: &AsyncIoQueue<LeaseV4>,
    server_ip: Ipv4Addr,
    request: &DhcpPacket,
    mac: [u8; 6],
) -> Option<DhcpPacket> {
    let server_id = request.server_id();
    let selecting = server_id.is_some();

    let requested_ip = if selecting {
        request.requested_ip()
    } else if request.ciaddr != Ipv4Addr::UNSPECIFIED {
        Some(request.ciaddr)
    } else {
        request.requested_ip()
    };

    let ip = requested_ip?;

    // Confirm ownership: either the pool already has this address ALLOCATED
    // to this MAC, or we can freshly allocate it now (first REQUEST after a
    // DISCOVER that this process didn't retain pool-level commitment for).
    let mut guard = state.lock().unwrap();
    let slot_idx = guard.pools.iter().position(|s| s.contains(ip));
    let slot_idx = match slot_idx {
        Some(i) => i,
        None => return Some(build_nak(request, server_ip)),
    };

    {
        let (ping_check, ping_timeout_ms) = {
            let slot = &guard.pools[slot_idx];
            (slot.ping_check, slot.ping_timeout_ms)
        };
        let timeout = Duration::from_millis(ping_timeout_ms);
        let slot = &mut guard.pools[slot_idx];
        match slot.pool.allocate(mac, Some(ip), |addr| {
            ping_check && icmp::ping(addr.into(), timeout)
        }) {
            Ok(granted) if granted == ip => {}
            _ => {
                warn!(mac = %microdns_core::hex::to_colon_hex(&mac), %ip, "dhcpv4 request for unowned address, NAK");
                return Some(build_nak(request, server_ip));
            }
        }
    }

    let slot = &guard.pools[slot_idx];
    let now = Utc::now();
    let lease_id = {
        let mut store = lease_store.lock().unwrap();
        store.next_id()
    };
    let lease = LeaseV4 {
        lease_id,
        ip_addr: ip,
        mac_addr: mac,
        starts: now,
        ends: now + chrono::Duration::seconds(slot.default_lease_time as i64),
        tstp: now,
        cltt: now,
        state: LeaseState::Active,
        next_binding_state: LeaseState::Free,
        rewind_binding_state: LeaseState::Free,
        client_id: request.client_id().map(|c| c.to_vec()),
        hostname: request.hostname(),
        vendor_class: None,
        is_abandoned: false,
        is_bootp: false,
    };

    io_queue.save_one(lease);
    info!(%ip, mac = %microdns_core::hex::to_colon_hex(&mac), "dhcpv4 ack");

    Some(build_response(request, slot, server_ip, ip, DhcpMessageType::Ack))
}

fn handle_release(
    state: &Mutex<Dhcpv4State>,
    lease_store: &Mutex<LeaseStoreV4>,
    io_queue: &AsyncIoQueue<LeaseV4>,
    request: &DhcpPacket,
    _mac: [u8; 6],
) {
    let ip = request.ciaddr;
    if ip == Ipv4Addr::UNSPECIFIED {
        return;
    }

    {
        let mut guard = state.lock().unwrap();
        if let Some(slot) = guard.pools.iter_mut().find(|s| s.contains(ip)) {
            let _ = slot.pool.release_ip(ip);
        }
    }

    let mut store = lease_store.lock().unwrap();
    if store.release(ip).is_ok() {
        io_queue.save_all();
        info!(%ip, "dhcpv4 lease released");
    }
}

fn build_nak(request: &DhcpPacket, server_ip: Ipv4Addr) -> DhcpPacket {
    DhcpPacket {
        op: 2,
        htype: request.htype,
        hlen: request.hlen,
        hops: 0,
        xid: request.xid,
        secs: 0,
        flags: request.flags,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        siaddr: server_ip,
        giaddr: request.giaddr,
        chaddr: request.chaddr,
        sname: [0u8; 64],
        file: [0u8; 128],
        options: vec![
            message_type_option(DhcpMessageType::Nak),
            ip_option(OPT_SERVER_ID, server_ip),
            DhcpOption {
                code: OPT_END,
                data: Vec::new(),
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v4::packet::*;
    use microdns_core::config::{DhcpReservation, DhcpV4Config, DhcpV4Pool};
    use std::path::PathBuf;

    fn pool_cfg() -> DhcpV4Pool {
        DhcpV4Pool {
            range_start: "192.168.1.100".into(),
            range_end: "192.168.1.199".into(),
            subnet: "192.168.1.0/24".into(),
            router: "192.168.1.1".into(),
            dns: vec!["192.168.1.1".into()],
            ntp: Vec::new(),
            netbios: Vec::new(),
            domain: None,
            default_lease_time_secs: 3600,
            max_lease_time_secs: 7200,
            t1_secs: None,
            t2_secs: None,
            authoritative: true,
            ping_check: false,
            ping_timeout_ms: 500,
            ddns_update_style: None,
            next_server: None,
            boot_file: None,
        }
    }

    fn unique_lease_path() -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("microdns-v4-test-{}-{}.leases", std::process::id(), n))
    }

    fn test_config(reservations: Vec<DhcpReservation>) -> DhcpV4Config {
        DhcpV4Config {
            enabled: true,
            interface: "eth0".into(),
            lease_file: unique_lease_path(),
            workers: 4,
            queue_capacity: 64,
            expiration_check_interval_secs: 60,
            pools: vec![pool_cfg()],
            reservations,
        }
    }

    fn mac(n: u8) -> [u8; 6] {
        [0xaa, 0xbb, 0xcc, 0xdd, 0xee, n]
    }

    fn raw_packet(msg_type: DhcpMessageType, xid: u32, mac: [u8; 6], mut extra: Vec<DhcpOption>) -> Vec<u8> {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        let mut options = vec![message_type_option(msg_type)];
        options.append(&mut extra);
        options.push(DhcpOption {
            code: OPT_END,
            data: Vec::new(),
        });

        let packet = DhcpPacket {
            op: 1,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options,
        };
        packet.to_bytes()
    }

    #[tokio::test]
    async fn privileged_port_bind_falls_back_on_a_free_high_port() {
        // Bind an unprivileged port directly as the "privileged" target so the
        // first attempt succeeds without needing root; this only exercises the
        // success path, the permission-denied fallback is exercised manually
        // against a real privileged port outside test sandboxes.
        let socket = bind_with_privileged_fallback("127.0.0.1", 0, 0).await.unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn discover_request_ack_happy_path() {
        let config = test_config(Vec::new());
        let lease_store = LeaseStoreV4::new(config.lease_file.clone());
        let server = Dhcpv4Server::new(&config, lease_store, None).unwrap();
        let client = mac(1);

        let discover = raw_packet(DhcpMessageType::Discover, 0x1111, client, Vec::new());
        let (offer, _) =
            handle_datagram(&server.state, &server.lease_store, &server.io_queue, server.server_ip, &discover)
                .expect("offer expected");
        assert_eq!(offer.message_type(), Some(DhcpMessageType::Offer));
        assert_eq!(offer.yiaddr, "192.168.1.100".parse::<Ipv4Addr>().unwrap());
        assert_eq!(offer.get_option(OPT_ROUTER).unwrap(), &[192, 168, 1, 1][..]);

        let server_id = offer.get_option(OPT_SERVER_ID).unwrap().to_vec();
        let request = raw_packet(
            DhcpMessageType::Request,
            0x1111,
            client,
            vec![
                DhcpOption {
                    code: OPT_REQUESTED_IP,
                    data: offer.yiaddr.octets().to_vec(),
                },
                DhcpOption {
                    code: OPT_SERVER_ID,
                    data: server_id,
                },
            ],
        );
        let (ack, _) =
            handle_datagram(&server.state, &server.lease_store, &server.io_queue, server.server_ip, &request)
                .expect("ack expected");
        assert_eq!(ack.message_type(), Some(DhcpMessageType::Ack));
        assert_eq!(ack.yiaddr, offer.yiaddr);

        server.io_queue.shutdown().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let store = server.lease_store.lock().unwrap();
        let lease = store.find_by_ip(offer.yiaddr).expect("lease persisted");
        assert_eq!(lease.mac_addr, client);
        assert_eq!(lease.state, LeaseState::Active);
    }

    #[tokio::test]
    async fn static_reservation_wins_over_requested_ip() {
        let reserved_mac = mac(2);
        let config = test_config(vec![DhcpReservation {
            mac: microdns_core::hex::to_colon_hex(&reserved_mac),
            ip: "192.168.1.10".into(),
            hostname: None,
        }]);
        let lease_store = LeaseStoreV4::new(config.lease_file.clone());
        let server = Dhcpv4Server::new(&config, lease_store, None).unwrap();

        let discover = raw_packet(
            DhcpMessageType::Discover,
            0x2222,
            reserved_mac,
            vec![DhcpOption {
                code: OPT_REQUESTED_IP,
                data: "192.168.1.120".parse::<Ipv4Addr>().unwrap().octets().to_vec(),
            }],
        );
        let (offer, _) =
            handle_datagram(&server.state, &server.lease_store, &server.io_queue, server.server_ip, &discover)
                .expect("offer expected");
        assert_eq!(offer.yiaddr, "192.168.1.10".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn request_for_unowned_address_is_nak() {
        let config = test_config(Vec::new());
        let lease_store = LeaseStoreV4::new(config.lease_file.clone());
        let server = Dhcpv4Server::new(&config, lease_store, None).unwrap();

        // mac(1) takes .100 via DISCOVER/REQUEST first.
        let client_a = mac(1);
        let discover = raw_packet(DhcpMessageType::Discover, 0x3333, client_a, Vec::new());
        let (offer, _) =
            handle_datagram(&server.state, &server.lease_store, &server.io_queue, server.server_ip, &discover)
                .unwrap();
        let request = raw_packet(
            DhcpMessageType::Request,
            0x3333,
            client_a,
            vec![
                DhcpOption {
                    code: OPT_REQUESTED_IP,
                    data: offer.yiaddr.octets().to_vec(),
                },
                DhcpOption {
                    code: OPT_SERVER_ID,
                    data: offer.get_option(OPT_SERVER_ID).unwrap().to_vec(),
                },
            ],
        );
        handle_datagram(&server.state, &server.lease_store, &server.io_queue, server.server_ip, &request).unwrap();

        // mac(2) tries to REQUEST the same address a different server id claims to own.
        let client_b = mac(2);
        let bogus_request = raw_packet(
            DhcpMessageType::Request,
            0x4444,
            client_b,
            vec![
                DhcpOption {
                    code: OPT_REQUESTED_IP,
                    data: offer.yiaddr.octets().to_vec(),
                },
                DhcpOption {
                    code: OPT_SERVER_ID,
                    data: server.server_ip.octets().to_vec(),
                },
            ],
        );
        let (nak, _) = handle_datagram(
            &server.state,
            &server.lease_store,
            &server.io_queue,
            server.server_ip,
            &bogus_request,
        )
        .expect("nak expected");
        assert_eq!(nak.message_type(), Some(DhcpMessageType::Nak));
    }

    #[tokio::test]
    async fn release_frees_the_address_for_reallocation() {
        let config = test_config(Vec::new());
        let lease_store = LeaseStoreV4::new(config.lease_file.clone());
        let server = Dhcpv4Server::new(&config, lease_store, None).unwrap();
        let client = mac(1);

        let discover = raw_packet(DhcpMessageType::Discover, 0x5555, client, Vec::new());
        let (offer, _) =
            handle_datagram(&server.state, &server.lease_store, &server.io_queue, server.server_ip, &discover)
                .unwrap();
        let request = raw_packet(
            DhcpMessageType::Request,
            0x5555,
            client,
            vec![
                DhcpOption {
                    code: OPT_REQUESTED_IP,
                    data: offer.yiaddr.octets().to_vec(),
                },
                DhcpOption {
                    code: OPT_SERVER_ID,
                    data: offer.get_option(OPT_SERVER_ID).unwrap().to_vec(),
                },
            ],
        );
        handle_datagram(&server.state, &server.lease_store, &server.io_queue, server.server_ip, &request).unwrap();

        let release = DhcpPacket {
            op: 1,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 0x6666,
            secs: 0,
            flags: 0,
            ciaddr: offer.yiaddr,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: {
                let mut c = [0u8; 16];
                c[..6].copy_from_slice(&client);
                c
            },
            sname: [0u8; 64],
            file: [0u8; 128],
            options: vec![
                message_type_option(DhcpMessageType::Release),
                DhcpOption {
                    code: OPT_END,
                    data: Vec::new(),
                },
            ],
        };

        assert!(handle_datagram(
            &server.state,
            &server.lease_store,
            &server.io_queue,
            server.server_ip,
            &release.to_bytes()
        )
        .is_none());

        let another_client = mac(9);
        let discover2 = raw_packet(
            DhcpMessageType::Discover,
            0x7777,
            another_client,
            vec![DhcpOption {
                code: OPT_REQUESTED_IP,
                data: offer.yiaddr.octets().to_vec(),
            }],
        );
        let (offer2, _) =
            handle_datagram(&server.state, &server.lease_store, &server.io_queue, server.server_ip, &discover2)
                .unwrap();
        assert_eq!(offer2.yiaddr, offer.yiaddr);
    }
}

fn build_response(
    request: &DhcpPacket,
    slot: &PoolSlot,
    server_ip: Ipv4Addr,
    ip: Ipv4Addr,
    msg_type: DhcpMessageType,
) -> DhcpPacket {
    let mut options = vec![
        message_type_option(msg_type),
        ip_option(OPT_SERVER_ID, server_ip),
        ip_option(OPT_SUBNET_MASK, slot.subnet_mask),
        ip_option(OPT_ROUTER, slot.router),
        u32_option(OPT_LEASE_TIME, slot.default_lease_time),
    ];

    if let Some(t1) = slot.t1 {
        options.push(u32_option(OPT_T1, t1));
    }
    if let Some(t2) = slot.t2 {
        options.push(u32_option(OPT_T2, t2));
    }
    if !slot.dns_servers.is_empty() {
        options.push(ip_list_option(OPT_DNS_SERVER, &slot.dns_servers));
    }
    if let Some(domain) = &slot.domain {
        options.push(string_option(OPT_DOMAIN_NAME, domain));
    }

    let mut siaddr = server_ip;
    let mut sname = [0u8; 64];
    let mut file = [0u8; 128];

    if let Some(pxe) = &slot.pxe {
        siaddr = pxe.next_server;
        options.push(string_option(OPT_TFTP_SERVER, &pxe.next_server.to_string()));
        options.push(string_option(OPT_BOOTFILE, &pxe.boot_file));

        let ns_bytes = pxe.next_server.to_string();
        let ns_bytes = ns_bytes.as_bytes();
        let len = ns_bytes.len().min(63);
        sname[..len].copy_from_slice(&ns_bytes[..len]);

        let bf_bytes = pxe.boot_file.as_bytes();
        let len = bf_bytes.len().min(127);
        file[..len].copy_from_slice(&bf_bytes[..len]);
    }

    options.push(DhcpOption {
        code: OPT_END,
        data: Vec::new(),
    });

    DhcpPacket {
        op: 2,
        htype: request.htype,
        hlen: request.hlen,
        hops: 0,
        xid: request.xid,
        secs: 0,
        flags: request.flags,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr: ip,
        siaddr,
        giaddr: request.giaddr,
        chaddr: request.chaddr,
        sname,
        file,
        options,
    }
}
