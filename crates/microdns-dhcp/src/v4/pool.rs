//! DHCPv4 AddressPool (§4.5): fixed slot array over `[range_start, range_end]`
//! with reservation/conflict tracking and a fixed allocation priority order.

use microdns_core::error::PoolError;
use microdns_core::types::{LeaseState, LeaseV4, PoolEntryState, PoolEntryV4};
use std::collections::HashMap;
use std::net::Ipv4Addr;

pub struct AddressPoolV4 {
    range_start: Ipv4Addr,
    range_end: Ipv4Addr,
    entries: Vec<PoolEntryV4>,
    /// mac -> index into `entries`, kept in sync with `owner_mac`.
    by_mac: HashMap<[u8; 6], usize>,
    available: u32,
    allocated: u32,
    reserved: u32,
}

impl AddressPoolV4 {
    /// Builds one entry per address in range; excludes the network address,
    /// broadcast address, and the router; marks host reservations RESERVED.
    pub fn init(
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
        network: Ipv4Addr,
        broadcast: Ipv4Addr,
        router: Ipv4Addr,
        reservations: &[([u8; 6], Ipv4Addr)],
    ) -> Self {
        let start: u32 = range_start.into();
        let end: u32 = range_end.into();

        let reserved_ips: HashMap<Ipv4Addr, [u8; 6]> = reservations
            .iter()
            .map(|(mac, ip)| (*ip, *mac))
            .collect();

        let mut entries = Vec::with_capacity((end - start + 1) as usize);
        let mut available = 0u32;
        let mut reserved = 0u32;

        for ip_u32 in start..=end {
            let addr = Ipv4Addr::from(ip_u32);
            let (state, owner_mac) = if addr == network || addr == broadcast || addr == router {
                (PoolEntryState::Excluded, None)
            } else if let Some(mac) = reserved_ips.get(&addr) {
                reserved += 1;
                (PoolEntryState::Reserved, Some(*mac))
            } else {
                available += 1;
                (PoolEntryState::Available, None)
            };

            entries.push(PoolEntryV4 {
                addr,
                state,
                last_allocated: None,
                owner_mac,
                lease_id: 0,
            });
        }

        let mut by_mac = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            if let Some(mac) = entry.owner_mac {
                by_mac.insert(mac, idx);
            }
        }

        AddressPoolV4 {
            range_start,
            range_end,
            entries,
            by_mac,
            available,
            allocated: 0,
            reserved,
        }
    }

    /// Synchronizes from the restored lease set: ACTIVE leases in range flip
    /// their entry to ALLOCATED and record the owning MAC.
    pub fn sync_from_leases(&mut self, leases: &[LeaseV4]) {
        for lease in leases {
            if lease.state != LeaseState::Active {
                continue;
            }
            if let Some(idx) = self.index_of(lease.ip_addr) {
                let entry = &mut self.entries[idx];
                if entry.state == PoolEntryState::Excluded {
                    continue;
                }
                if entry.state == PoolEntryState::Available {
                    self.available -= 1;
                } else if entry.state == PoolEntryState::Reserved {
                    self.reserved -= 1;
                }
                entry.state = PoolEntryState::Allocated;
                entry.owner_mac = Some(lease.mac_addr);
                entry.last_allocated = Some(lease.cltt);
                entry.lease_id = lease.lease_id;
                self.allocated += 1;
                self.by_mac.insert(lease.mac_addr, idx);
            }
        }
    }

    fn index_of(&self, addr: Ipv4Addr) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        let start: u32 = self.range_start.into();
        let idx: u32 = u32::from(addr) - start;
        Some(idx as usize)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let start: u32 = self.range_start.into();
        let end: u32 = self.range_end.into();
        let ip: u32 = addr.into();
        ip >= start && ip <= end
    }

    /// Applies the five-rule priority order from §4.5 and returns the chosen
    /// address. `probe` is called only for AVAILABLE candidates; `true` means
    /// "host answered, treat as conflict".
    pub fn allocate(
        &mut self,
        mac: [u8; 6],
        requested_ip: Option<Ipv4Addr>,
        mut probe: impl FnMut(Ipv4Addr) -> bool,
    ) -> Result<Ipv4Addr, PoolError> {
        // 1. Static host reservation.
        if let Some(&idx) = self.by_mac.get(&mac) {
            if self.entries[idx].state == PoolEntryState::Reserved {
                return Ok(self.entries[idx].addr);
            }
        }

        // 2. Already allocated to this MAC: idempotent re-offer.
        if let Some(&idx) = self.by_mac.get(&mac) {
            if self.entries[idx].state == PoolEntryState::Allocated {
                return Ok(self.entries[idx].addr);
            }
        }

        // 3. Requested IP, in range, AVAILABLE.
        if let Some(req) = requested_ip {
            if !req.is_unspecified() {
                if let Some(idx) = self.index_of(req) {
                    if self.entries[idx].state == PoolEntryState::Available {
                        if probe(req) {
                            self.mark_conflict(idx);
                        } else {
                            return Ok(self.reserve_index(idx, mac));
                        }
                    }
                }
            }
        }

        // 4. Linear scan for the first AVAILABLE entry.
        let mut chosen = None;
        for idx in 0..self.entries.len() {
            if self.entries[idx].state != PoolEntryState::Available {
                continue;
            }
            let addr = self.entries[idx].addr;
            if probe(addr) {
                self.mark_conflict(idx);
                continue;
            }
            chosen = Some(idx);
            break;
        }

        match chosen {
            Some(idx) => Ok(self.reserve_index(idx, mac)),
            None => Err(PoolError::Exhausted),
        }
    }

    fn reserve_index(&mut self, idx: usize, mac: [u8; 6]) -> Ipv4Addr {
        self.available -= 1;
        self.allocated += 1;
        let entry = &mut self.entries[idx];
        entry.state = PoolEntryState::Allocated;
        entry.owner_mac = Some(mac);
        self.by_mac.insert(mac, idx);
        entry.addr
    }

    fn mark_conflict(&mut self, idx: usize) {
        self.available -= 1;
        self.entries[idx].state = PoolEntryState::Conflict;
    }

    pub fn release_ip(&mut self, addr: Ipv4Addr) -> Result<(), PoolError> {
        let idx = self.index_of(addr).ok_or(PoolError::OutOfRange)?;
        let entry = &mut self.entries[idx];
        match entry.state {
            PoolEntryState::Allocated => {
                self.allocated -= 1;
                self.available += 1;
                entry.state = PoolEntryState::Available;
                if let Some(mac) = entry.owner_mac.take() {
                    self.by_mac.remove(&mac);
                }
                Ok(())
            }
            _ => Err(PoolError::NotAvailable),
        }
    }

    pub fn available_count(&self) -> u32 {
        self.available
    }

    pub fn allocated_count(&self) -> u32 {
        self.allocated
    }

    pub fn reserved_count(&self) -> u32 {
        self.reserved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> [u8; 6] {
        [0, 0, 0, 0, 0, n]
    }

    fn pool() -> AddressPoolV4 {
        AddressPoolV4::init(
            "10.0.10.100".parse().unwrap(),
            "10.0.10.103".parse().unwrap(),
            "10.0.10.0".parse().unwrap(),
            "10.0.10.255".parse().unwrap(),
            "10.0.10.1".parse().unwrap(),
            &[(mac(99), "10.0.10.102".parse().unwrap())],
        )
    }

    #[test]
    fn counters_match_histogram() {
        let p = pool();
        assert_eq!(p.available_count(), 3);
        assert_eq!(p.reserved_count(), 1);
        assert_eq!(p.allocated_count(), 0);
    }

    #[test]
    fn static_reservation_wins() {
        let mut p = pool();
        let ip = p.allocate(mac(99), None, |_| false).unwrap();
        assert_eq!(ip, "10.0.10.102".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn repeat_request_is_idempotent() {
        let mut p = pool();
        let first = p.allocate(mac(1), None, |_| false).unwrap();
        let second = p.allocate(mac(1), None, |_| false).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn probe_reply_marks_conflict_and_continues() {
        let mut p = pool();
        let conflicted = "10.0.10.100".parse::<Ipv4Addr>().unwrap();
        let ip = p
            .allocate(mac(2), None, move |addr| addr == conflicted)
            .unwrap();
        assert_ne!(ip, conflicted);
        assert_eq!(p.available_count(), 1); // 100 conflicted, 101 allocated, 102 reserved
    }

    #[test]
    fn pool_exhaustion_errors() {
        let mut p = pool();
        p.allocate(mac(1), None, |_| false).unwrap();
        p.allocate(mac(2), None, |_| false).unwrap();
        // 102 is reserved for mac(99), so only 100/101 are plain-available.
        assert!(matches!(
            p.allocate(mac(3), None, |_| false),
            Err(PoolError::Exhausted)
        ));
    }

    #[test]
    fn release_then_reallocate() {
        let mut p = pool();
        let ip = p.allocate(mac(1), None, |_| false).unwrap();
        p.release_ip(ip).unwrap();
        assert_eq!(p.available_count(), 2);
        let ip2 = p.allocate(mac(2), None, |_| false).unwrap();
        assert_eq!(ip, ip2);
    }
}
