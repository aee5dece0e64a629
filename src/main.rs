use anyhow::Result;
use clap::Parser;
use microdns_core::config::Config;
use microdns_core::stats::{ShmStats, DHCPV4_STATS_NAME, DHCPV6_STATS_NAME};
use microdns_dhcp::expiration::ExpirationTimer;
use microdns_dhcp::io_queue::IoOp;
use microdns_dhcp::lease::v4::LeaseStoreV4;
use microdns_dhcp::lease::v6::LeaseStoreV6;
use microdns_dhcp::v4::server::Dhcpv4Server;
use microdns_dhcp::v6::server::Dhcpv6Server;
use microdns_dns::DnsServer;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "microdns", about = "Authoritative/recursive DNS and DHCPv4/v6 in one process")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/microdns/microdns.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;

    init_logging(&config.logging);
    info!(instance_id = %config.instance.id, "starting microdns");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if config.dns.enabled {
        let server = DnsServer::new(&config.dns)?;
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run(rx).await {
                error!("dns server error: {e}");
            }
        }));
        info!("dns server task spawned");
    }

    if let Some(ref dhcp_config) = config.dhcp {
        if let Some(ref v4_config) = dhcp_config.v4 {
            if v4_config.enabled {
                let lease_store = LeaseStoreV4::load(v4_config.lease_file.clone())?;
                let stats = match ShmStats::create(DHCPV4_STATS_NAME, now_unix()) {
                    Ok(s) => Some(std::sync::Arc::new(s)),
                    Err(e) => {
                        error!("dhcpv4 shared stats unavailable: {e}");
                        None
                    }
                };
                let server = Dhcpv4Server::new(v4_config, lease_store, stats.clone())?;

                let lease_store_for_timer = server.lease_store();
                let io_queue_for_timer = server.io_queue();
                let check_interval = Duration::from_secs(v4_config.expiration_check_interval_secs);
                let _timer = ExpirationTimer::spawn(
                    check_interval,
                    shutdown_rx.clone(),
                    move || {
                        let mut store = lease_store_for_timer.lock().unwrap();
                        let flipped = store.expire_old(chrono::Utc::now());
                        if let Some(s) = &stats {
                            s.stats().set_leases_active(store.active_leases().count() as u64);
                        }
                        flipped
                    },
                    move || io_queue_for_timer.enqueue(IoOp::SaveAll),
                );

                let rx = shutdown_rx.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = server.run(rx).await {
                        error!("dhcpv4 server error: {e}");
                    }
                }));
                info!("dhcpv4 server task spawned");
            }
        }

        if let Some(ref v6_config) = dhcp_config.v6 {
            if v6_config.enabled {
                // Empty fallback: if no lease file exists yet, `Dhcpv6Server::new`
                // derives a stable DUID-LL from the interface name instead.
                let lease_store = LeaseStoreV6::load(v6_config.lease_file.clone(), Vec::new())?;
                let stats = match ShmStats::create(DHCPV6_STATS_NAME, now_unix()) {
                    Ok(s) => Some(std::sync::Arc::new(s)),
                    Err(e) => {
                        error!("dhcpv6 shared stats unavailable: {e}");
                        None
                    }
                };
                let server = Dhcpv6Server::new(v6_config, lease_store, stats.clone())?;

                let lease_store_for_timer = server.lease_store();
                let io_queue_for_timer = server.io_queue();
                let check_interval = Duration::from_secs(v6_config.expiration_check_interval_secs);
                let _timer = ExpirationTimer::spawn(
                    check_interval,
                    shutdown_rx.clone(),
                    move || {
                        let mut store = lease_store_for_timer.lock().unwrap();
                        let flipped = store.expire_old(chrono::Utc::now());
                        if let Some(s) = &stats {
                            let count = store.active_na_leases().count() + store.active_pd_leases().count();
                            s.stats().set_leases_active(count as u64);
                        }
                        flipped
                    },
                    move || io_queue_for_timer.enqueue(IoOp::SaveAll),
                );

                let rx = shutdown_rx.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = server.run(rx).await {
                        error!("dhcpv6 server error: {e}");
                    }
                }));
                info!("dhcpv6 server task spawned");
            }
        }
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping services...");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }

    info!("microdns stopped");
    Ok(())
}

/// Waits for either SIGINT or SIGTERM (§6 "Signals"); on non-Unix targets
/// only ctrl_c is available.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn init_logging(config: &microdns_core::config::LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
