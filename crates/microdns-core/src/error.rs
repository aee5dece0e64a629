use thiserror::Error;

/// Errors from loading and validating the config tree (§7 "Fatal init").
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Errors from the lease store (§4.1/§4.2, §7 "Persistence failure" and
/// "Malformed input").
#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("lease file io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed lease block: {0}")]
    Malformed(String),

    #[error("lease not found")]
    NotFound,

    #[error("lease store is full")]
    Full,
}

/// Errors from the address pool (§4.5/§4.6, §7 "Client violation" and
/// "Resource exhaustion").
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no available addresses")]
    Exhausted,

    #[error("requested address is outside the pool range")]
    OutOfRange,

    #[error("requested address is not available")]
    NotAvailable,

    #[error(transparent)]
    Lease(#[from] LeaseError),
}

/// Errors from DHCPv4/v6 wire (de)serialization (§4.8/§4.9, §7 "Malformed
/// input").
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("bad magic cookie")]
    BadMagicCookie,

    #[error("option {code} would overflow the options area")]
    OptionsOverflow { code: u8 },

    #[error("truncated option at offset {offset}")]
    TruncatedOption { offset: usize },
}

/// Errors from the bounded work queues (§4.3/§4.10, §7 "Resource exhaustion").
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("queue is closed")]
    Closed,
}

/// Errors from the DNS cache/resolver/zone store (§4.11/§4.12).
#[derive(Error, Debug)]
pub enum DnsError {
    #[error("query name contains a character outside the cache alphabet: {0:?}")]
    UncacheableName(char),

    #[error("upstream forward timed out")]
    UpstreamTimeout,

    #[error("upstream forward failed: {0}")]
    Upstream(#[from] std::io::Error),

    #[error("malformed dns message: {0}")]
    Malformed(#[from] hickory_proto::error::ProtoError),

    #[error("cannot read zone file {path}: {source}")]
    ZoneLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address: {0}")]
    InvalidListen(String),
}

/// Errors from the shared-memory stats region (§4.13).
#[derive(Error, Debug)]
pub enum StatsError {
    #[error("shm_open failed: {0}")]
    ShmOpen(std::io::Error),

    #[error("ftruncate failed: {0}")]
    Truncate(std::io::Error),

    #[error("mmap failed: {0}")]
    Mmap(std::io::Error),
}
