//! Reads the shared-memory stats region a running `microdns` DHCP server
//! exports and renders a periodically refreshed text dashboard, mirroring
//! `original_source/DHCP_Server/DHCPv4/src/monitor.c`'s read-only mmap loop.

use clap::{Parser, ValueEnum};
use microdns_core::stats::{ShmStats, DHCPV4_STATS_NAME, DHCPV6_STATS_NAME};
use std::time::Duration;

#[derive(Copy, Clone, ValueEnum)]
enum Protocol {
    V4,
    V6,
}

#[derive(Parser)]
#[command(name = "monitor", about = "Dashboard for a running microdns DHCP server's shared stats")]
struct Cli {
    /// Which server's shared-memory region to read
    #[arg(value_enum, default_value_t = Protocol::V4)]
    protocol: Protocol,

    /// Refresh interval in seconds
    #[arg(short, long, default_value_t = 1)]
    interval: u64,

    /// Print one snapshot and exit instead of refreshing in a loop
    #[arg(long)]
    once: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let name = match cli.protocol {
        Protocol::V4 => DHCPV4_STATS_NAME,
        Protocol::V6 => DHCPV6_STATS_NAME,
    };

    let stats = ShmStats::open_readonly(name)
        .map_err(|e| anyhow::anyhow!("cannot open {name}: {e} (is the server running?)"))?;

    loop {
        let snap = stats.stats().snapshot();
        let now = chrono::Utc::now().timestamp();
        let uptime = (now - snap.start_time).max(0);

        print!("\x1B[2J\x1B[1;1H");
        println!("microdns {name}");
        println!("uptime:          {uptime}s");
        println!("packets received: {}", snap.pkt_received);
        println!("packets processed:{}", snap.pkt_processed);
        println!("active leases:   {}", snap.leases_active);
        println!("errors:          {}", snap.errors_count);

        if cli.once {
            break;
        }
        std::thread::sleep(Duration::from_secs(cli.interval.max(1)));
    }

    Ok(())
}
