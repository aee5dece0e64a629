//! IA_NA AddressPool and IA_PD PDPool (§4.6). Both pools enumerate by
//! incrementing a 128-bit value; the PDPool increments at bit position
//! `delegated_plen - 1` rather than the low bit, mirroring
//! `original_source/DHCP_Server/DHCPv6/sources/pd_pool.c`'s `increment_prefix`.

use microdns_core::error::PoolError;
use microdns_core::types::{Ia6Kind, LeaseState, LeaseV6, PdPoolEntry, PoolEntryState, PoolEntryV6};
use std::collections::HashMap;
use std::net::Ipv6Addr;

/// Hard ceiling on materialized pool entries, matching the source's
/// `MAX_PD_POOL_SIZE`-style compile-time guard against pathological configs
/// (e.g. a /48 delegating /64s would otherwise enumerate 65536 entries).
pub const MAX_POOL_SIZE: usize = 65536;

fn addr_to_u128(addr: Ipv6Addr) -> u128 {
    u128::from_be_bytes(addr.octets())
}

fn u128_to_addr(v: u128) -> Ipv6Addr {
    Ipv6Addr::from(v.to_be_bytes())
}

/// Adds one unit at bit position `plen - 1` (1-indexed from the MSB),
/// carrying toward bit 0. Returns `None` on overflow (the bit-math
/// equivalent of the C helper's "no carry out of the top" check).
fn increment_prefix(cur: u128, plen: u8) -> Option<u128> {
    if plen == 0 || plen > 128 {
        return None;
    }
    let add: u128 = 1u128 << (128 - plen as u32);
    let next = cur.checked_add(add)?;
    if next <= cur {
        return None;
    }
    Some(next)
}

pub struct AddressPoolV6 {
    entries: Vec<PoolEntryV6>,
    by_duid: HashMap<Vec<u8>, usize>,
    available: u32,
    allocated: u32,
}

impl AddressPoolV6 {
    pub fn init(pool_start: Ipv6Addr, pool_end: Ipv6Addr) -> Self {
        let start = addr_to_u128(pool_start);
        let end = addr_to_u128(pool_end);

        let mut entries = Vec::new();
        let mut cur = start;
        while cur <= end && entries.len() < MAX_POOL_SIZE {
            entries.push(PoolEntryV6 {
                addr: u128_to_addr(cur),
                state: PoolEntryState::Available,
                last_allocated: None,
                owner_duid: None,
                lease_id: 0,
            });
            match cur.checked_add(1) {
                Some(next) => cur = next,
                None => break,
            }
        }

        let available = entries.len() as u32;
        AddressPoolV6 {
            entries,
            by_duid: HashMap::new(),
            available,
            allocated: 0,
        }
    }

    fn index_of(&self, addr: Ipv6Addr) -> Option<usize> {
        self.entries.iter().position(|e| e.addr == addr)
    }

    pub fn allocate(
        &mut self,
        duid: &[u8],
        requested: Option<Ipv6Addr>,
        mut probe: impl FnMut(Ipv6Addr) -> bool,
    ) -> Result<Ipv6Addr, PoolError> {
        if let Some(&idx) = self.by_duid.get(duid) {
            if self.entries[idx].state == PoolEntryState::Allocated {
                return Ok(self.entries[idx].addr);
            }
        }

        if let Some(req) = requested {
            if let Some(idx) = self.index_of(req) {
                if self.entries[idx].state == PoolEntryState::Available {
                    if probe(req) {
                        self.mark_abandoned(idx);
                    } else {
                        return Ok(self.reserve_index(idx, duid));
                    }
                }
            }
        }

        let mut chosen = None;
        for idx in 0..self.entries.len() {
            if self.entries[idx].state != PoolEntryState::Available {
                continue;
            }
            let addr = self.entries[idx].addr;
            if probe(addr) {
                self.mark_abandoned(idx);
                continue;
            }
            chosen = Some(idx);
            break;
        }

        match chosen {
            Some(idx) => Ok(self.reserve_index(idx, duid)),
            None => Err(PoolError::Exhausted),
        }
    }

    fn reserve_index(&mut self, idx: usize, duid: &[u8]) -> Ipv6Addr {
        self.available -= 1;
        self.allocated += 1;
        let entry = &mut self.entries[idx];
        entry.state = PoolEntryState::Allocated;
        entry.owner_duid = Some(microdns_core::hex::to_colon_hex(duid));
        self.by_duid.insert(duid.to_vec(), idx);
        entry.addr
    }

    fn mark_abandoned(&mut self, idx: usize) {
        self.available -= 1;
        self.entries[idx].state = PoolEntryState::Conflict;
    }

    pub fn release(&mut self, addr: Ipv6Addr) -> Result<(), PoolError> {
        let idx = self.index_of(addr).ok_or(PoolError::OutOfRange)?;
        match self.entries[idx].state {
            PoolEntryState::Allocated => {
                self.allocated -= 1;
                self.available += 1;
                let entry = &mut self.entries[idx];
                entry.state = PoolEntryState::Available;
                if let Some(duid_hex) = entry.owner_duid.take() {
                    self.by_duid.retain(|_, &mut i| i != idx);
                    let _ = duid_hex;
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

    /// Marks an allocated address CONFLICT following a client DECLINE,
    /// taking it out of circulation the same way a failed ping probe does.
    pub fn decline(&mut self, addr: Ipv6Addr) -> Result<(), PoolError> {
        let idx = self.index_of(addr).ok_or(PoolError::OutOfRange)?;
        match self.entries[idx].state {
            PoolEntryState::Allocated => {
                self.allocated -= 1;
                let entry = &mut self.entries[idx];
                entry.state = PoolEntryState::Conflict;
                if entry.owner_duid.take().is_some() {
                    self.by_duid.retain(|_, &mut i| i != idx);
                }
                Ok(())
            }
            _ => Err(PoolError::NotAvailable),
        }
    }

    /// Reconciles entry state against the lease store at startup, per the
    /// mapping in §4.6: ACTIVE leases mark their address ALLOCATED, RESERVED
    /// stays RESERVED, ABANDONED becomes CONFLICT, everything else is left
    /// AVAILABLE.
    pub fn sync_from_leases(&mut self, leases: &[LeaseV6]) {
        for lease in leases {
            if lease.kind != Ia6Kind::Na {
                continue;
            }
            let Some(addr) = lease.address else { continue };
            let Some(idx) = self.index_of(addr) else { continue };

            let new_state = match lease.state {
                LeaseState::Active => PoolEntryState::Allocated,
                LeaseState::Reserved => PoolEntryState::Reserved,
                LeaseState::Abandoned => PoolEntryState::Conflict,
                _ => PoolEntryState::Available,
            };

            if self.entries[idx].state == PoolEntryState::Available
                && new_state != PoolEntryState::Available
            {
                self.available -= 1;
            }
            if new_state == PoolEntryState::Allocated {
                self.allocated += 1;
                self.by_duid.insert(lease.duid.clone(), idx);
            }

            let entry = &mut self.entries[idx];
            entry.state = new_state;
            entry.owner_duid = Some(microdns_core::hex::to_colon_hex(&lease.duid));
            entry.lease_id = lease.lease_id;
            entry.last_allocated = Some(lease.cltt);
        }
    }
}

pub struct PdPool {
    delegated_plen: u8,
    entries: Vec<PdPoolEntry>,
    by_duid: HashMap<Vec<u8>, usize>,
    available: u32,
    allocated: u32,
}

impl PdPool {
    pub fn init(pool_start: Ipv6Addr, pool_end: Ipv6Addr, delegated_plen: u8) -> Self {
        let end = addr_to_u128(pool_end);
        let mut entries = Vec::new();
        let mut cur = addr_to_u128(pool_start);

        loop {
            if cur > end || entries.len() >= MAX_POOL_SIZE {
                break;
            }
            entries.push(PdPoolEntry {
                prefix: u128_to_addr(cur),
                prefix_len: delegated_plen,
                state: PoolEntryState::Available,
                last_allocated: None,
                owner_duid: None,
                lease_id: 0,
            });
            match increment_prefix(cur, delegated_plen) {
                Some(next) if next <= end => cur = next,
                _ => break,
            }
        }

        let available = entries.len() as u32;
        PdPool {
            delegated_plen,
            entries,
            by_duid: HashMap::new(),
            available,
            allocated: 0,
        }
    }

    pub fn delegated_prefix_len(&self) -> u8 {
        self.delegated_plen
    }

    fn index_of(&self, prefix: Ipv6Addr) -> Option<usize> {
        self.entries.iter().position(|e| e.prefix == prefix)
    }

    pub fn allocate(&mut self, duid: &[u8]) -> Result<(Ipv6Addr, u8), PoolError> {
        if let Some(&idx) = self.by_duid.get(duid) {
            if self.entries[idx].state == PoolEntryState::Allocated {
                let e = &self.entries[idx];
                return Ok((e.prefix, e.prefix_len));
            }
        }

        let idx = (0..self.entries.len())
            .find(|&i| self.entries[i].state == PoolEntryState::Available)
            .ok_or(PoolError::Exhausted)?;

        self.available -= 1;
        self.allocated += 1;
        let entry = &mut self.entries[idx];
        entry.state = PoolEntryState::Allocated;
        entry.owner_duid = Some(microdns_core::hex::to_colon_hex(duid));
        self.by_duid.insert(duid.to_vec(), idx);
        Ok((entry.prefix, entry.prefix_len))
    }

    pub fn release(&mut self, prefix: Ipv6Addr) -> Result<(), PoolError> {
        let idx = self.index_of(prefix).ok_or(PoolError::OutOfRange)?;
        match self.entries[idx].state {
            PoolEntryState::Allocated => {
                self.allocated -= 1;
                self.available += 1;
                self.entries[idx].state = PoolEntryState::Available;
                self.by_duid.retain(|_, &mut i| i != idx);
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

    pub fn decline(&mut self, prefix: Ipv6Addr) -> Result<(), PoolError> {
        let idx = self.index_of(prefix).ok_or(PoolError::OutOfRange)?;
        match self.entries[idx].state {
            PoolEntryState::Allocated => {
                self.allocated -= 1;
                let entry = &mut self.entries[idx];
                entry.state = PoolEntryState::Conflict;
                self.by_duid.retain(|_, &mut i| i != idx);
                Ok(())
            }
            _ => Err(PoolError::NotAvailable),
        }
    }

    pub fn sync_from_leases(&mut self, leases: &[LeaseV6]) {
        for lease in leases {
            if lease.kind != Ia6Kind::Pd {
                continue;
            }
            let (Some(prefix), Some(_plen)) = (lease.prefix, lease.prefix_len) else {
                continue;
            };
            let Some(idx) = self.index_of(prefix) else { continue };

            let new_state = match lease.state {
                LeaseState::Active => PoolEntryState::Allocated,
                LeaseState::Reserved => PoolEntryState::Reserved,
                LeaseState::Abandoned => PoolEntryState::Conflict,
                _ => PoolEntryState::Available,
            };

            if self.entries[idx].state == PoolEntryState::Available
                && new_state != PoolEntryState::Available
            {
                self.available -= 1;
            }
            if new_state == PoolEntryState::Allocated {
                self.allocated += 1;
                self.by_duid.insert(lease.duid.clone(), idx);
            }

            let entry = &mut self.entries[idx];
            entry.state = new_state;
            entry.owner_duid = Some(microdns_core::hex::to_colon_hex(&lease.duid));
            entry.lease_id = lease.lease_id;
            entry.last_allocated = Some(lease.cltt);
        }
    }
}
