pub mod cache;
pub mod forward;
pub mod resolver;
pub mod zones;

use cache::DnsCache;
use forward::ForwardTable;
use microdns_core::config::DnsConfig;
use microdns_core::error::DnsError;
use resolver::Resolver;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};
use zones::ZoneStore;

/// Maximum concurrent query tasks; a burst past this is dropped rather than
/// spawning unbounded tasks (§5 "Non-goals: transport over anything other
/// than UDP" — the donor's TCP listener is dropped entirely here).
const MAX_CONCURRENT_QUERIES: usize = 10_000;

pub struct DnsServer {
    listen_addr: SocketAddr,
    resolver: Arc<Resolver>,
}

impl DnsServer {
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        let listen_addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|_| DnsError::InvalidListen(config.listen.clone()))?;

        let zones = Arc::new(ZoneStore::load(&config.zones)?);
        let cache = Arc::new(DnsCache::new(config.cache_size));
        let forward_table = Arc::new(ForwardTable::from_config(&config.forward_zones));
        let upstream: Vec<SocketAddr> = config
            .upstream
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();

        let resolver = Arc::new(Resolver::new(
            zones,
            cache,
            forward_table,
            upstream,
            Duration::from_secs(config.forward_timeout_secs),
            config.cache_ttl_secs,
        ));

        Ok(Self {
            listen_addr,
            resolver,
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.listen_addr).await?);
        info!(addr = %self.listen_addr, "dns server listening");

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_QUERIES));
        let mut buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, src) = result?;
                    let data = buf[..len].to_vec();
                    let resolver = self.resolver.clone();
                    let socket = socket.clone();

                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            warn!(peer = %src, "dns query concurrency limit reached, dropping");
                            continue;
                        }
                    };

                    tokio::spawn(async move {
                        let response = resolver.resolve(&data).await;
                        if !response.is_empty() {
                            if let Err(e) = socket.send_to(&response, src).await {
                                error!(peer = %src, error = %e, "failed to send dns response");
                            }
                        }
                        drop(permit);
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("dns server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }
}
