pub mod expiration;
pub mod icmp;
pub mod io_queue;
pub mod lease;
pub mod pool;
pub mod v4;
pub mod v6;
pub mod workerpool;
