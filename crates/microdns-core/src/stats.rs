//! Shared-memory `StatsExporter` (§4.13). A fixed-layout struct written with
//! atomic increments by the owning server and read without locks by the
//! `monitor` binary, matching
//! `original_source/DHCP_Server/DHCPv4/include/src/shm_stats.h` byte-for-byte.

use crate::error::StatsError;
use std::ffi::CString;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub const DHCPV4_STATS_NAME: &str = "/dhcpv4_stats";
pub const DHCPV6_STATS_NAME: &str = "/dhcpv6_stats";

/// `#[repr(C)]` mirror of `struct server_v4_stats_t` / `server_v6_stats_t`:
/// `{ time_t start_time; u64 pkt_received; u64 pkt_processed; u64 leases_active; u64 errors_count; }`.
#[repr(C)]
pub struct ServerStats {
    pub start_time: AtomicI64,
    pub pkt_received: AtomicU64,
    pub pkt_processed: AtomicU64,
    pub leases_active: AtomicU64,
    pub errors_count: AtomicU64,
}

impl ServerStats {
    pub fn reset(&self, start_time: i64) {
        self.start_time.store(start_time, Ordering::Relaxed);
        self.pkt_received.store(0, Ordering::Relaxed);
        self.pkt_processed.store(0, Ordering::Relaxed);
        self.leases_active.store(0, Ordering::Relaxed);
        self.errors_count.store(0, Ordering::Relaxed);
    }

    pub fn incr_received(&self) {
        self.pkt_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_processed(&self) {
        self.pkt_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_errors(&self) {
        self.errors_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_leases_active(&self, n: u64) {
        self.leases_active.store(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            start_time: self.start_time.load(Ordering::Relaxed),
            pkt_received: self.pkt_received.load(Ordering::Relaxed),
            pkt_processed: self.pkt_processed.load(Ordering::Relaxed),
            leases_active: self.leases_active.load(Ordering::Relaxed),
            errors_count: self.errors_count.load(Ordering::Relaxed),
        }
    }
}

/// A plain-data copy of a `ServerStats` read, for the `monitor` dashboard.
#[derive(Debug, Clone, Copy)]
pub struct ServerStatsSnapshot {
    pub start_time: i64,
    pub pkt_received: u64,
    pub pkt_processed: u64,
    pub leases_active: u64,
    pub errors_count: u64,
}

/// An owning handle to a mapped POSIX shared-memory region holding one
/// `ServerStats`. The writer side (`create`) owns the region for the life of
/// the server; the reader side (`open_readonly`, used by `monitor`) never
/// unlinks it.
pub struct ShmStats {
    ptr: *mut ServerStats,
    len: usize,
    writable: bool,
}

// SAFETY: ServerStats is composed entirely of atomics; concurrent access from
// multiple threads/processes is the documented usage pattern (§4.13).
unsafe impl Send for ShmStats {}
unsafe impl Sync for ShmStats {}

impl ShmStats {
    /// Creates (or re-opens) the named region read-write, sized for one
    /// `ServerStats`, and resets its counters with `start_time = now`.
    pub fn create(name: &str, start_time: i64) -> Result<Self, StatsError> {
        let this = Self::open(name, true)?;
        unsafe { (*this.ptr).reset(start_time) };
        Ok(this)
    }

    /// Opens an existing named region read-only, for the `monitor` binary.
    pub fn open_readonly(name: &str) -> Result<Self, StatsError> {
        Self::open(name, false)
    }

    fn open(name: &str, writable: bool) -> Result<Self, StatsError> {
        let len = std::mem::size_of::<ServerStats>();
        let c_name = CString::new(name).expect("shm name must not contain NUL");

        let oflag = if writable {
            libc::O_RDWR | libc::O_CREAT
        } else {
            libc::O_RDONLY | libc::O_CREAT
        };

        // SAFETY: c_name is a valid NUL-terminated C string for the duration of this call.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, 0o666) };
        if fd < 0 {
            return Err(StatsError::ShmOpen(std::io::Error::last_os_error()));
        }

        if writable {
            // SAFETY: fd is a valid, open file descriptor.
            let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(StatsError::Truncate(err));
            }
        }

        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };

        // SAFETY: fd is open and sized to at least `len` bytes.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(StatsError::Mmap(std::io::Error::last_os_error()));
        }

        Ok(ShmStats {
            ptr: ptr as *mut ServerStats,
            len,
            writable,
        })
    }

    pub fn stats(&self) -> &ServerStats {
        // SAFETY: ptr is valid and mapped for `len` bytes for the life of self.
        unsafe { &*self.ptr }
    }
}

impl Drop for ShmStats {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in `open`.
        unsafe {
            libc::munmap(self.ptr as *mut _, self.len);
        }
        let _ = self.writable; // unlinking is left to the operator (matches monitor.c, which never unlinks either).
    }
}
