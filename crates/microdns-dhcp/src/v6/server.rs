//! DHCPv6 server state machine (§4.9). Mirrors `v4::server`'s shape:
//! dispatch by message type, allocation through `pool::v6`'s IA_NA/IA_PD
//! pools, persistence through the `AsyncIoQueue`, inbound datagrams through
//! the `WorkerPool`.

use crate::icmp;
use crate::io_queue::{AsyncIoQueue, IoOp};
use crate::lease::v6::LeaseStoreV6;
use crate::pool::v6::{AddressPoolV6, PdPool};
use crate::v6::packet::*;
use crate::workerpool::{Datagram, WorkerPool};
use chrono::Utc;
use microdns_core::config::{DhcpV6Config, DhcpV6Pool};
use microdns_core::stats::ShmStats;
use microdns_core::types::{Ia6Kind, LeaseState, LeaseV6};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

struct PoolSlotV6 {
    pool: AddressPoolV6,
    range_start: Ipv6Addr,
    range_end: Ipv6Addr,
    pd_pool: Option<PdPool>,
    pd_range_start: Option<Ipv6Addr>,
    pd_range_end: Option<Ipv6Addr>,
    dns_servers: Vec<Ipv6Addr>,
    domain: Option<String>,
    sntp_servers: Vec<Ipv6Addr>,
    info_refresh_secs: Option<u32>,
    preference: Option<u8>,
    default_lease_time: u32,
    max_lease_time: u32,
    ping_check: bool,
    ping_timeout_ms: u64,
}

impl PoolSlotV6 {
    fn contains_addr(&self, addr: Ipv6Addr) -> bool {
        in_range(addr, self.range_start, self.range_end)
    }

    fn contains_prefix(&self, prefix: Ipv6Addr) -> bool {
        match (self.pd_range_start, self.pd_range_end) {
            (Some(s), Some(e)) => in_range(prefix, s, e),
            _ => false,
        }
    }
}

fn in_range(addr: Ipv6Addr, start: Ipv6Addr, end: Ipv6Addr) -> bool {
    let a = u128::from_be_bytes(addr.octets());
    let s = u128::from_be_bytes(start.octets());
    let e = u128::from_be_bytes(end.octets());
    a >= s && a <= e
}

struct Dhcpv6State {
    pools: Vec<PoolSlotV6>,
}

pub struct Dhcpv6Server {
    state: Arc<Mutex<Dhcpv6State>>,
    lease_store: Arc<Mutex<LeaseStoreV6>>,
    io_queue: Arc<AsyncIoQueue<LeaseV6>>,
    stats: Option<Arc<ShmStats>>,
    server_duid: Vec<u8>,
    workers: usize,
    queue_capacity: usize,
    /// Set by a SIGHUP handler; per the resolved open question on reload,
    /// this server only flags that a reload was requested and logs it — it
    /// never re-reads pools or the lease file while running.
    reload_requested: Arc<AtomicBool>,
}

/// Derives a stable pseudo-MAC from the interface name so the DUID-LL this
/// server advertises as its identity survives restarts without needing an
/// explicit config field; once a lease file exists, its `server-duid` line
/// takes priority over this fallback.
fn derive_pseudo_mac(interface: &str) -> [u8; 6] {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in interface.as_bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    let bytes = hash.to_be_bytes();
    let mut mac = [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]];
    mac[0] = (mac[0] | 0x02) & 0xfe;
    mac
}

impl Dhcpv6Server {
    pub fn new(
        config: &DhcpV6Config,
        lease_store: LeaseStoreV6,
        stats: Option<Arc<ShmStats>>,
    ) -> anyhow::Result<Self> {
        let fallback_duid = duid_ll(&derive_pseudo_mac(&config.interface));
        let server_duid = if lease_store.server_duid().is_empty() {
            fallback_duid
        } else {
            lease_store.server_duid().to_vec()
        };

        let mut pools = Vec::new();
        for pool_cfg in &config.pools {
            pools.push(build_pool_slot(pool_cfg)?);
        }

        let state = Arc::new(Mutex::new(Dhcpv6State { pools }));
        {
            let mut guard = state.lock().unwrap();
            let active_na: Vec<LeaseV6> = lease_store.active_na_leases().cloned().collect();
            let active_pd: Vec<LeaseV6> = lease_store.active_pd_leases().cloned().collect();
            for slot in guard.pools.iter_mut() {
                slot.pool.sync_from_leases(&active_na);
                if let Some(pd) = slot.pd_pool.as_mut() {
                    pd.sync_from_leases(&active_pd);
                }
            }
        }

        let lease_store = Arc::new(Mutex::new(lease_store));
        let lease_store_writer = lease_store.clone();
        let io_queue = Arc::new(AsyncIoQueue::spawn(
            config.queue_capacity,
            move |lease: LeaseV6| {
                let mut store = lease_store_writer.lock().unwrap();
                match lease.kind {
                    Ia6Kind::Na => store.upsert_na(lease),
                    Ia6Kind::Pd => store.upsert_pd(lease),
                }
                if let Err(e) = store.save() {
                    error!("dhcpv6 lease save failed: {e}");
                }
            },
            {
                let lease_store_writer = lease_store.clone();
                move || {
                    let store = lease_store_writer.lock().unwrap();
                    if let Err(e) = store.save() {
                        error!("dhcpv6 full lease rewrite failed: {e}");
                    }
                }
            },
        ));

        Ok(Dhcpv6Server {
            state,
            lease_store,
            io_queue,
            stats,
            server_duid,
            workers: config.workers,
            queue_capacity: config.queue_capacity,
            reload_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let socket = Arc::new(UdpSocket::bind("[::]:547").await?);
        info!("DHCPv6 server listening on [::]:547");

        spawn_sighup_listener(self.reload_requested.clone());

        let state = self.state.clone();
        let lease_store = self.lease_store.clone();
        let io_queue = self.io_queue.clone();
        let stats = self.stats.clone();
        let server_duid = self.server_duid.clone();
        let send_socket = socket.clone();

        let pool = WorkerPool::create(self.workers, self.queue_capacity, move |datagram: Datagram| {
            let state = state.clone();
            let lease_store = lease_store.clone();
            let io_queue = io_queue.clone();
            let stats = stats.clone();
            let server_duid = server_duid.clone();
            let socket = send_socket.clone();
            let peer = datagram.peer;
            async move {
                if let Some(s) = &stats {
                    s.stats().incr_received();
                }
                let outcome = tokio::task::spawn_blocking(move || {
                    handle_datagram(&state, &lease_store, &io_queue, &server_duid, &datagram.bytes, peer)
                })
                .await;

                match outcome {
                    Ok(Some((response, dest))) => {
                        if let Some(s) = &stats {
                            s.stats().incr_processed();
                        }
                        let bytes = response.to_bytes();
                        if let Err(e) = socket.send_to(&bytes, dest).await {
                            error!("failed to send DHCPv6 response: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if let Some(s) = &stats {
                            s.stats().incr_errors();
                        }
                        error!("dhcpv6 worker panicked: {e}");
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
                        warn!("dhcpv6 worker pool full, dropping datagram from {peer}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("DHCPv6 server shutting down");
                        break;
                    }
                }
            }
        }

        pool.destroy().await;
        self.io_queue.enqueue(IoOp::Shutdown);
        Ok(())
    }

    pub fn io_queue(&self) -> Arc<AsyncIoQueue<LeaseV6>> {
        self.io_queue.clone()
    }

    pub fn lease_store(&self) -> Arc<Mutex<LeaseStoreV6>> {
        self.lease_store.clone()
    }

    pub fn reload_requested(&self) -> bool {
        self.reload_requested.load(Ordering::Relaxed)
    }
}

#[cfg(unix)]
fn spawn_sighup_listener(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut stream = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot install dhcpv6 SIGHUP handler: {e}");
                return;
            }
        };
        loop {
            stream.recv().await;
            info!("SIGHUP received: dhcpv6 reload requested (flag only, not applied while running)");
            flag.store(true, Ordering::Relaxed);
        }
    });
}

#[cfg(not(unix))]
fn spawn_sighup_listener(_flag: Arc<AtomicBool>) {}

fn build_pool_slot(cfg: &DhcpV6Pool) -> anyhow::Result<PoolSlotV6> {
    let range_start: Ipv6Addr = cfg.range_start.parse()?;
    let range_end: Ipv6Addr = cfg.range_end.parse()?;
    let pool = AddressPoolV6::init(range_start, range_end);

    let (pd_pool, pd_range_start, pd_range_end) = match &cfg.pd {
        Some(pd_cfg) => {
            let start: Ipv6Addr = pd_cfg.range_start.parse()?;
            let end: Ipv6Addr = pd_cfg.range_end.parse()?;
            (
                Some(PdPool::init(start, end, pd_cfg.delegated_prefix_len)),
                Some(start),
                Some(end),
            )
        }
        None => (None, None, None),
    };

    let dns_servers: Vec<Ipv6Addr> = cfg.dns.iter().filter_map(|s| s.parse().ok()).collect();
    let sntp_servers: Vec<Ipv6Addr> = cfg.sntp.iter().filter_map(|s| s.parse().ok()).collect();

    Ok(PoolSlotV6 {
        pool,
        range_start,
        range_end,
        pd_pool,
        pd_range_start,
        pd_range_end,
        dns_servers,
        domain: cfg.domain.clone(),
        sntp_servers,
        info_refresh_secs: cfg.info_refresh_secs,
        preference: cfg.preference,
        default_lease_time: cfg.default_lease_time_secs,
        max_lease_time: cfg.max_lease_time_secs,
        ping_check: cfg.ping_check,
        ping_timeout_ms: cfg.ping_timeout_ms,
    })
}

/// Runs the per-datagram state machine synchronously (invoked from
/// `spawn_blocking`, no lock held across an `.await`).
fn handle_datagram(
    state: &Mutex<Dhcpv6State>,
    lease_store: &Mutex<LeaseStoreV6>,
    io_queue: &AsyncIoQueue<LeaseV6>,
    server_duid: &[u8],
    data: &[u8],
    peer: SocketAddr,
) -> Option<(Dhcpv6Packet, SocketAddr)> {
    let request = match Dhcpv6Packet::parse(data) {
        Ok(p) => p,
        Err(e) => {
            debug!("invalid DHCPv6 packet: {e}");
            return None;
        }
    };

    let msg_type = request.message_type()?;
    let reply_type = match msg_type {
        Dhcpv6MessageType::Solicit => Dhcpv6MessageType::Advertise,
        Dhcpv6MessageType::Request
        | Dhcpv6MessageType::Renew
        | Dhcpv6MessageType::Rebind
        | Dhcpv6MessageType::Release
        | Dhcpv6MessageType::Decline => Dhcpv6MessageType::Reply,
        _ => {
            warn!(?msg_type, "unhandled dhcpv6 message type");
            return None;
        }
    };

    let client_id = request.client_id();
    let duid: &[u8] = client_id.as_deref().unwrap_or(&[]);
    if duid.is_empty() {
        debug!("dhcpv6 request carries no client id, dropping");
        return None;
    }

    debug!(?msg_type, duid = %microdns_core::hex::to_colon_hex(duid), "dhcpv6 packet");

    let mut options = vec![build_server_id(server_duid)];
    if let Some(cid) = &client_id {
        options.push(build_client_id_echo(cid));
    }

    let mut any_ia = false;
    let mut option_slot: Option<usize> = None;

    if let Some(req_na) = request.requested_ia_na() {
        any_ia = true;
        let (opt, slot_idx) = handle_ia_na(msg_type, &req_na, duid, state, lease_store, io_queue);
        options.push(opt);
        option_slot = option_slot.or(slot_idx);
    }

    if let Some(req_pd) = request.requested_ia_pd() {
        any_ia = true;
        let (opt, slot_idx) = handle_ia_pd(msg_type, &req_pd, duid, state, lease_store, io_queue);
        options.push(opt);
        option_slot = option_slot.or(slot_idx);
    }

    if !any_ia {
        return None;
    }

    if let Some(idx) = option_slot {
        let guard = state.lock().unwrap();
        if let Some(slot) = guard.pools.get(idx) {
            append_configured_options(&mut options, slot);
        }
    }

    let reply = Dhcpv6Packet {
        msg_type: reply_type as u8,
        transaction_id: request.transaction_id,
        options,
    };

    Some((reply, peer))
}

fn append_configured_options(options: &mut Vec<Dhcpv6Option>, slot: &PoolSlotV6) {
    if !slot.dns_servers.is_empty() {
        options.push(build_dns_option(&slot.dns_servers));
    }
    if let Some(domain) = &slot.domain {
        options.push(build_domain_search_option(domain));
    }
    if !slot.sntp_servers.is_empty() {
        options.push(build_sntp_option(&slot.sntp_servers));
    }
    if let Some(secs) = slot.info_refresh_secs {
        options.push(build_info_refresh_option(secs));
    }
    if let Some(pref) = slot.preference {
        options.push(build_preference_option(pref));
    }
}

fn allocate_na(state: &Mutex<Dhcpv6State>, duid: &[u8], hint: Option<Ipv6Addr>) -> Option<(usize, Ipv6Addr, u32, u32)> {
    let mut guard = state.lock().unwrap();
    let n = guard.pools.len();
    for idx in 0..n {
        let (ping_check, ping_timeout_ms, default_lease, max_lease) = {
            let slot = &guard.pools[idx];
            (slot.ping_check, slot.ping_timeout_ms, slot.default_lease_time, slot.max_lease_time)
        };
        let timeout = Duration::from_millis(ping_timeout_ms);
        let slot = &mut guard.pools[idx];
        if let Ok(addr) = slot
            .pool
            .allocate(duid, hint, |addr| ping_check && icmp::ping(addr.into(), timeout))
        {
            return Some((idx, addr, default_lease, max_lease));
        }
    }
    None
}

fn allocate_pd(state: &Mutex<Dhcpv6State>, duid: &[u8]) -> Option<(usize, Ipv6Addr, u8, u32, u32)> {
    let mut guard = state.lock().unwrap();
    let n = guard.pools.len();
    for idx in 0..n {
        let (default_lease, max_lease) = {
            let slot = &guard.pools[idx];
            (slot.default_lease_time, slot.max_lease_time)
        };
        let Some(pd) = guard.pools[idx].pd_pool.as_mut() else {
            continue;
        };
        if let Ok((prefix, plen)) = pd.allocate(duid) {
            return Some((idx, prefix, plen, default_lease, max_lease));
        }
    }
    None
}

fn release_na_everywhere(state: &Mutex<Dhcpv6State>, addr: Ipv6Addr) {
    let mut guard = state.lock().unwrap();
    if let Some(slot) = guard.pools.iter_mut().find(|s| s.contains_addr(addr)) {
        let _ = slot.pool.release(addr);
    }
}

fn decline_na_everywhere(state: &Mutex<Dhcpv6State>, addr: Ipv6Addr) {
    let mut guard = state.lock().unwrap();
    if let Some(slot) = guard.pools.iter_mut().find(|s| s.contains_addr(addr)) {
        let _ = slot.pool.decline(addr);
    }
}

fn release_pd_everywhere(state: &Mutex<Dhcpv6State>, prefix: Ipv6Addr) {
    let mut guard = state.lock().unwrap();
    if let Some(slot) = guard.pools.iter_mut().find(|s| s.contains_prefix(prefix)) {
        if let Some(pd) = slot.pd_pool.as_mut() {
            let _ = pd.release(prefix);
        }
    }
}

fn decline_pd_everywhere(state: &Mutex<Dhcpv6State>, prefix: Ipv6Addr) {
    let mut guard = state.lock().unwrap();
    if let Some(slot) = guard.pools.iter_mut().find(|s| s.contains_prefix(prefix)) {
        if let Some(pd) = slot.pd_pool.as_mut() {
            let _ = pd.decline(prefix);
        }
    }
}

fn handle_ia_na(
    msg_type: Dhcpv6MessageType,
    req: &RequestedIaNa,
    duid: &[u8],
    state: &Mutex<Dhcpv6State>,
    lease_store: &Mutex<LeaseStoreV6>,
    io_queue: &AsyncIoQueue<LeaseV6>,
) -> (Dhcpv6Option, Option<usize>) {
    match msg_type {
        Dhcpv6MessageType::Release => {
            let addr = {
                let store = lease_store.lock().unwrap();
                store.find_active_na_by_duid(duid, req.iaid).and_then(|l| l.address)
            };
            if let Some(addr) = addr {
                release_na_everywhere(state, addr);
                let mut store = lease_store.lock().unwrap();
                let _ = store.release_na(addr);
                drop(store);
                io_queue.save_all();
                info!(%addr, duid = %microdns_core::hex::to_colon_hex(duid), "dhcpv6 na lease released");
            }
            (build_ia_na_status(req.iaid, STATUS_SUCCESS), None)
        }
        Dhcpv6MessageType::Decline => {
            let addr = {
                let store = lease_store.lock().unwrap();
                store.find_active_na_by_duid(duid, req.iaid).and_then(|l| l.address)
            };
            if let Some(addr) = addr {
                decline_na_everywhere(state, addr);
                let mut store = lease_store.lock().unwrap();
                let _ = store.mark_abandoned_na(addr);
                drop(store);
                io_queue.save_all();
                warn!(%addr, duid = %microdns_core::hex::to_colon_hex(duid), "dhcpv6 na address declined by client");
            }
            (build_ia_na_status(req.iaid, STATUS_SUCCESS), None)
        }
        Dhcpv6MessageType::Solicit
        | Dhcpv6MessageType::Request
        | Dhcpv6MessageType::Renew
        | Dhcpv6MessageType::Rebind => match allocate_na(state, duid, req.hint) {
            Some((slot_idx, addr, default_lease, max_lease)) => {
                if msg_type != Dhcpv6MessageType::Solicit {
                    persist_na(lease_store, io_queue, duid, req.iaid, addr, max_lease);
                }
                (build_ia_na(req.iaid, addr, default_lease, max_lease), Some(slot_idx))
            }
            None => {
                warn!(duid = %microdns_core::hex::to_colon_hex(duid), "no available dhcpv6 address");
                (build_ia_na_status(req.iaid, STATUS_NO_ADDRS_AVAIL), None)
            }
        },
        _ => (build_ia_na_status(req.iaid, STATUS_SUCCESS), None),
    }
}

fn handle_ia_pd(
    msg_type: Dhcpv6MessageType,
    req: &RequestedIaPd,
    duid: &[u8],
    state: &Mutex<Dhcpv6State>,
    lease_store: &Mutex<LeaseStoreV6>,
    io_queue: &AsyncIoQueue<LeaseV6>,
) -> (Dhcpv6Option, Option<usize>) {
    match msg_type {
        Dhcpv6MessageType::Release => {
            let prefix = {
                let store = lease_store.lock().unwrap();
                store
                    .find_active_pd_by_duid(duid, req.iaid)
                    .and_then(|l| l.prefix.map(|p| (p, l.prefix_len.unwrap_or(0))))
            };
            if let Some((prefix, plen)) = prefix {
                release_pd_everywhere(state, prefix);
                let mut store = lease_store.lock().unwrap();
                let _ = store.release_pd(prefix, plen);
                drop(store);
                io_queue.save_all();
                info!(%prefix, plen, duid = %microdns_core::hex::to_colon_hex(duid), "dhcpv6 pd lease released");
            }
            (build_ia_pd_status(req.iaid, STATUS_SUCCESS), None)
        }
        Dhcpv6MessageType::Decline => {
            let prefix = {
                let store = lease_store.lock().unwrap();
                store
                    .find_active_pd_by_duid(duid, req.iaid)
                    .and_then(|l| l.prefix.map(|p| (p, l.prefix_len.unwrap_or(0))))
            };
            if let Some((prefix, plen)) = prefix {
                decline_pd_everywhere(state, prefix);
                let mut store = lease_store.lock().unwrap();
                let _ = store.mark_abandoned_pd(prefix, plen);
                drop(store);
                io_queue.save_all();
                warn!(%prefix, plen, duid = %microdns_core::hex::to_colon_hex(duid), "dhcpv6 pd prefix declined by client");
            }
            (build_ia_pd_status(req.iaid, STATUS_SUCCESS), None)
        }
        Dhcpv6MessageType::Solicit
        | Dhcpv6MessageType::Request
        | Dhcpv6MessageType::Renew
        | Dhcpv6MessageType::Rebind => match allocate_pd(state, duid) {
            Some((slot_idx, prefix, plen, default_lease, max_lease)) => {
                if msg_type != Dhcpv6MessageType::Solicit {
                    persist_pd(lease_store, io_queue, duid, req.iaid, prefix, plen, max_lease);
                }
                (build_ia_pd(req.iaid, prefix, plen, default_lease, max_lease), Some(slot_idx))
            }
            None => {
                warn!(duid = %microdns_core::hex::to_colon_hex(duid), "no available dhcpv6 delegated prefix");
                (build_ia_pd_status(req.iaid, STATUS_NO_PREFIX_AVAIL), None)
            }
        },
        _ => (build_ia_pd_status(req.iaid, STATUS_SUCCESS), None),
    }
}

fn persist_na(
    lease_store: &Mutex<LeaseStoreV6>,
    io_queue: &AsyncIoQueue<LeaseV6>,
    duid: &[u8],
    iaid: u32,
    addr: Ipv6Addr,
    max_lease: u32,
) {
    let now = Utc::now();
    let lease_id = {
        let mut store = lease_store.lock().unwrap();
        let existing = store.find_active_na_by_duid(duid, iaid).map(|l| l.lease_id);
        existing.unwrap_or_else(|| store.next_id())
    };
    let lease = LeaseV6 {
        lease_id,
        kind: Ia6Kind::Na,
        duid: duid.to_vec(),
        iaid,
        address: Some(addr),
        prefix: None,
        prefix_len: None,
        starts: now,
        ends: now + chrono::Duration::seconds(max_lease as i64),
        tstp: now,
        cltt: now,
        state: LeaseState::Active,
        hostname: None,
        vendor_class: None,
        fqdn: None,
    };
    io_queue.save_one(lease);
    info!(%addr, duid = %microdns_core::hex::to_colon_hex(duid), "dhcpv6 na lease granted");
}

fn persist_pd(
    lease_store: &Mutex<LeaseStoreV6>,
    io_queue: &AsyncIoQueue<LeaseV6>,
    duid: &[u8],
    iaid: u32,
    prefix: Ipv6Addr,
    prefix_len: u8,
    max_lease: u32,
) {
    let now = Utc::now();
    let lease_id = {
        let mut store = lease_store.lock().unwrap();
        let existing = store.find_active_pd_by_duid(duid, iaid).map(|l| l.lease_id);
        existing.unwrap_or_else(|| store.next_id())
    };
    let lease = LeaseV6 {
        lease_id,
        kind: Ia6Kind::Pd,
        duid: duid.to_vec(),
        iaid,
        address: None,
        prefix: Some(prefix),
        prefix_len: Some(prefix_len),
        starts: now,
        ends: now + chrono::Duration::seconds(max_lease as i64),
        tstp: now,
        cltt: now,
        state: LeaseState::Active,
        hostname: None,
        vendor_class: None,
        fqdn: None,
    };
    io_queue.save_one(lease);
    info!(%prefix, prefix_len, duid = %microdns_core::hex::to_colon_hex(duid), "dhcpv6 pd lease granted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v6::packet::*;
    use microdns_core::config::{DhcpV6Config, DhcpV6PdPool, DhcpV6Pool};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn unique_lease_path() -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("microdns-v6-test-{}-{}.leases", std::process::id(), n))
    }

    fn pool_cfg() -> DhcpV6Pool {
        DhcpV6Pool {
            subnet: "2001:db8:1::".into(),
            subnet_prefix_len: 64,
            range_start: "2001:db8:1::100".into(),
            range_end: "2001:db8:1::1ff".into(),
            dns: Vec::new(),
            domain: None,
            default_lease_time_secs: 3600,
            max_lease_time_secs: 7200,
            ping_check: false,
            ping_timeout_ms: 500,
            pd: Some(DhcpV6PdPool {
                range_start: "2001:db8:3::".into(),
                range_end: "2001:db8:3:ff00::".into(),
                delegated_prefix_len: 56,
            }),
            sntp: Vec::new(),
            info_refresh_secs: None,
            preference: None,
        }
    }

    fn test_config() -> DhcpV6Config {
        DhcpV6Config {
            enabled: true,
            interface: "eth0".into(),
            lease_file: unique_lease_path(),
            workers: 4,
            queue_capacity: 64,
            expiration_check_interval_secs: 60,
            pools: vec![pool_cfg()],
        }
    }

    fn duid(n: u8) -> Vec<u8> {
        vec![0x00, 0x01, 0x00, 0x01, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, n]
    }

    /// A top-level IA_NA with no nested IAADDR, used when the client has no
    /// hinted address (fresh SOLICIT).
    fn ia_na_no_hint(iaid: u32) -> Dhcpv6Option {
        let mut data = Vec::new();
        data.extend_from_slice(&iaid.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        Dhcpv6Option {
            code: OPT_IA_NA,
            data,
        }
    }

    fn ia_pd_no_hint(iaid: u32) -> Dhcpv6Option {
        let mut data = Vec::new();
        data.extend_from_slice(&iaid.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        Dhcpv6Option {
            code: OPT_IA_PD,
            data,
        }
    }

    fn build_packet(msg_type: Dhcpv6MessageType, xid: [u8; 3], client_duid: &[u8], ia_opts: Vec<Dhcpv6Option>) -> Vec<u8> {
        let mut options = vec![build_client_id_echo(client_duid)];
        options.extend(ia_opts);
        Dhcpv6Packet {
            msg_type: msg_type as u8,
            transaction_id: xid,
            options,
        }
        .to_bytes()
    }

    #[tokio::test]
    async fn solicit_request_reply_grants_ia_na() {
        let config = test_config();
        let lease_store = LeaseStoreV6::new(config.lease_file.clone(), b"test-server-duid".to_vec());
        let server = Dhcpv6Server::new(&config, lease_store, None).unwrap();
        let client_duid = duid(1);

        let solicit = build_packet(Dhcpv6MessageType::Solicit, [1, 2, 3], &client_duid, vec![ia_na_no_hint(1)]);
        let (advertise, _) = handle_datagram(
            &server.state,
            &server.lease_store,
            &server.io_queue,
            &server.server_duid,
            &solicit,
            "[::1]:546".parse().unwrap(),
        )
        .expect("advertise expected");
        assert_eq!(advertise.message_type(), Some(Dhcpv6MessageType::Advertise));
        let advertised = advertise
            .requested_ia_na()
            .and_then(|r| r.hint)
            .expect("advertised address");
        assert!(in_range(
            advertised,
            "2001:db8:1::100".parse().unwrap(),
            "2001:db8:1::1ff".parse().unwrap()
        ));

        let request_ia = build_ia_na(1, advertised, 3600, 7200);
        let request = build_packet(Dhcpv6MessageType::Request, [1, 2, 3], &client_duid, vec![request_ia]);
        let (reply, _) = handle_datagram(
            &server.state,
            &server.lease_store,
            &server.io_queue,
            &server.server_duid,
            &request,
            "[::1]:546".parse().unwrap(),
        )
        .expect("reply expected");
        assert_eq!(reply.message_type(), Some(Dhcpv6MessageType::Reply));
        assert_eq!(reply.requested_ia_na().and_then(|r| r.hint), Some(advertised));

        server.io_queue.shutdown().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let store = server.lease_store.lock().unwrap();
        let lease = store.find_na_by_addr(advertised).expect("lease persisted");
        assert_eq!(lease.duid, client_duid);
        assert_eq!(lease.state, LeaseState::Active);
    }

    #[tokio::test]
    async fn solicit_request_reply_grants_ia_pd() {
        let config = test_config();
        let lease_store = LeaseStoreV6::new(config.lease_file.clone(), b"test-server-duid".to_vec());
        let server = Dhcpv6Server::new(&config, lease_store, None).unwrap();
        let client_duid = duid(2);

        let solicit = build_packet(Dhcpv6MessageType::Solicit, [4, 5, 6], &client_duid, vec![ia_pd_no_hint(2)]);
        let (advertise, _) = handle_datagram(
            &server.state,
            &server.lease_store,
            &server.io_queue,
            &server.server_duid,
            &solicit,
            "[::1]:546".parse().unwrap(),
        )
        .expect("advertise expected");
        let (prefix, plen) = advertise
            .requested_ia_pd()
            .and_then(|r| r.hint)
            .expect("advertised prefix");
        assert_eq!(plen, 56);

        let request_ia = build_ia_pd(2, prefix, plen, 3600, 7200);
        let request = build_packet(Dhcpv6MessageType::Request, [4, 5, 6], &client_duid, vec![request_ia]);
        let (reply, _) = handle_datagram(
            &server.state,
            &server.lease_store,
            &server.io_queue,
            &server.server_duid,
            &request,
            "[::1]:546".parse().unwrap(),
        )
        .expect("reply expected");
        assert_eq!(reply.message_type(), Some(Dhcpv6MessageType::Reply));
        assert_eq!(reply.requested_ia_pd().and_then(|r| r.hint), Some((prefix, plen)));

        server.io_queue.shutdown().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let store = server.lease_store.lock().unwrap();
        let lease = store
            .active_pd_leases()
            .find(|l| l.prefix == Some(prefix))
            .expect("pd lease persisted");
        assert_eq!(lease.duid, client_duid);
    }

    #[tokio::test]
    async fn release_frees_the_address() {
        let config = test_config();
        let lease_store = LeaseStoreV6::new(config.lease_file.clone(), b"test-server-duid".to_vec());
        let server = Dhcpv6Server::new(&config, lease_store, None).unwrap();
        let client_duid = duid(3);
        let peer: SocketAddr = "[::1]:546".parse().unwrap();

        let solicit = build_packet(Dhcpv6MessageType::Solicit, [7, 8, 9], &client_duid, vec![ia_na_no_hint(3)]);
        let (advertise, _) =
            handle_datagram(&server.state, &server.lease_store, &server.io_queue, &server.server_duid, &solicit, peer)
                .unwrap();
        let advertised = advertise.requested_ia_na().and_then(|r| r.hint).unwrap();

        let request = build_packet(
            Dhcpv6MessageType::Request,
            [7, 8, 9],
            &client_duid,
            vec![build_ia_na(3, advertised, 3600, 7200)],
        );
        handle_datagram(&server.state, &server.lease_store, &server.io_queue, &server.server_duid, &request, peer)
            .unwrap();

        let release = build_packet(
            Dhcpv6MessageType::Release,
            [7, 8, 9],
            &client_duid,
            vec![build_ia_na(3, advertised, 3600, 7200)],
        );
        let (reply, _) =
            handle_datagram(&server.state, &server.lease_store, &server.io_queue, &server.server_duid, &release, peer)
                .expect("release reply expected");
        assert_eq!(reply.message_type(), Some(Dhcpv6MessageType::Reply));

        server.io_queue.shutdown().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let store = server.lease_store.lock().unwrap();
        assert!(store.active_na_leases().all(|l| l.address != Some(advertised)));

        // Address should be available for a different client now.
        drop(store);
        let another_duid = duid(4);
        let solicit2 = build_packet(Dhcpv6MessageType::Solicit, [1, 1, 1], &another_duid, vec![ia_na_no_hint(1)]);
        let (advertise2, _) = handle_datagram(
            &server.state,
            &server.lease_store,
            &server.io_queue,
            &server.server_duid,
            &solicit2,
            peer,
        )
        .unwrap();
        assert!(advertise2.requested_ia_na().and_then(|r| r.hint).is_some());
    }
}
