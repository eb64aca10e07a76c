#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use apimux::server;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "apimux",
    about = "Credential-rotating reverse proxy for upstream HTTP APIs"
)]
struct Cli {
    /// Path to the configuration document (.toml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address; defaults to [server] host:port from the config
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address (health/metrics/stats)
    #[arg(long)]
    admin_listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_thread_count())
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}

/// Tokio worker threads: `APIMUX_WORKER_THREADS` when set, else the cgroup
/// v2 cpu quota when the process runs in a limited container, else the
/// host's parallelism. Without the quota check a container capped at a few
/// cores would get a thread per host core.
fn worker_thread_count() -> usize {
    if let Some(n) = std::env::var("APIMUX_WORKER_THREADS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        return n.max(1);
    }
    if let Some(n) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
        .ok()
        .and_then(|raw| parse_cpu_max(&raw))
    {
        return n;
    }
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// `cpu.max` holds "<quota> <period>" in microseconds, or "max" for
/// unlimited. A fractional quota rounds up so a 1.5-core cap still gets
/// two threads.
fn parse_cpu_max(raw: &str) -> Option<usize> {
    let mut fields = raw.split_whitespace();
    let quota: u64 = fields.next()?.parse().ok()?;
    let period: u64 = fields.next()?.parse().ok()?;
    if period == 0 {
        return None;
    }
    Some((quota.div_ceil(period)).max(1) as usize)
}

#[cfg(test)]
mod tests {
    use super::parse_cpu_max;

    #[test]
    fn quota_rounds_up_to_whole_threads() {
        assert_eq!(parse_cpu_max("400000 100000"), Some(4));
        assert_eq!(parse_cpu_max("150000 100000"), Some(2));
        assert_eq!(parse_cpu_max("50000 100000"), Some(1));
    }

    #[test]
    fn unlimited_or_malformed_defers_to_host_count() {
        assert_eq!(parse_cpu_max("max 100000"), None);
        assert_eq!(parse_cpu_max(""), None);
        assert_eq!(parse_cpu_max("100000 0"), None);
    }
}
