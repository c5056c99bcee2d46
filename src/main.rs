#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use failover_gateway::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "failover-gateway",
    about = "Reverse proxy with circuit-breaker failover from a primary to a fallback backend"
)]
struct Cli {
    /// Path to gateway config file (.toml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Admin API listen address (health, metrics, circuits)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cpu = server::runtime::get_container_cpu_limit();
    eprintln!(
        "[runtime] Using CPU limit from {}: {} threads",
        cpu.source, cpu.threads
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cpu.threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}
