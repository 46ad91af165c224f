use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::{error, warn};
use portracker_core::{CollectError, CollectionContext, Report, collect_report};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "portracker",
    version,
    about = "Listening-port inventory with container and platform attribution",
    author = "Portracker Team"
)]
struct Cli {
    /// Output format: json or a human-readable summary
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// First candidate for the kernel proc interface (e.g. /host/proc)
    #[arg(long)]
    proc_root: Option<PathBuf>,

    /// Container engine endpoint (unix://, npipe://, or tcp://)
    #[arg(long)]
    docker_endpoint: Option<String>,

    /// Verify the engine endpoint with mutual TLS
    #[arg(long)]
    tls_verify: bool,

    /// Directory holding ca.pem, cert.pem, and key.pem for mutual TLS
    #[arg(long)]
    cert_path: Option<PathBuf>,

    /// Platform control-plane API key (falls back to PORTRACKER_API_KEY)
    #[arg(long)]
    platform_key: Option<String>,

    /// Platform control-plane URL
    #[arg(long)]
    platform_url: Option<String>,

    /// Include every listening UDP port, not just the known-service set
    #[arg(long)]
    include_udp: bool,

    /// TTL for the upper-layer caches, in milliseconds
    #[arg(long, default_value_t = 60_000)]
    cache_timeout_ms: u64,

    /// Bypass the TTL cache entirely
    #[arg(long)]
    disable_cache: bool,

    /// The agent's own HTTP port, for self-attribution
    #[arg(long)]
    listen_port: Option<u16>,

    /// Container name the agent expects to run under
    #[arg(long, default_value = "portracker")]
    self_container_name: String,

    /// Re-collect every N seconds instead of exiting after one pass
    #[arg(long)]
    watch: Option<u64>,
}

#[derive(Clone, Debug, ValueEnum)]
enum OutputFormat {
    Json,
    Summary,
}

impl Cli {
    fn to_context(&self) -> CollectionContext {
        CollectionContext {
            proc_root: self
                .proc_root
                .clone()
                .or_else(|| std::env::var("PORTRACKER_PROC_ROOT").ok().map(PathBuf::from)),
            docker_endpoint: self
                .docker_endpoint
                .clone()
                .or_else(|| std::env::var("PORTRACKER_DOCKER_ENDPOINT").ok()),
            tls_verify: self.tls_verify,
            cert_path: self.cert_path.clone(),
            platform_api_key: self
                .platform_key
                .clone()
                .or_else(|| std::env::var("PORTRACKER_API_KEY").ok()),
            platform_url: self.platform_url.clone(),
            include_udp: self.include_udp,
            cache_timeout_ms: self.cache_timeout_ms,
            disable_cache: self.disable_cache,
            listen_port: self.listen_port,
            self_container_name: self.self_container_name.clone(),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let ctx = cli.to_context();

    loop {
        let failed = match collect_report(&ctx) {
            Ok(report) => {
                print_report(&report, &cli.format)?;
                false
            }
            Err(CollectError::Fatal { report }) => {
                error!("collection failed on every source");
                print_report(&report, &cli.format)?;
                true
            }
            Err(err) => {
                error!("collection failed: {err:#}");
                true
            }
        };

        match cli.watch {
            Some(seconds) => std::thread::sleep(Duration::from_secs(seconds.max(1))),
            None => {
                if failed {
                    std::process::exit(1);
                }
                return Ok(());
            }
        }
    }
}

fn print_report(report: &Report, format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Summary => print_summary(report),
    }
    Ok(())
}

fn print_summary(report: &Report) {
    println!(
        "{} collector: {} ports, {} apps, {} vms",
        report.platform,
        report.ports.len(),
        report.applications.len(),
        report.vms.len()
    );
    if let Some(name) = &report.platform_name {
        println!("platform: {name}");
    }
    if let Some(error) = &report.error {
        warn!("degraded: {error}");
    }
    for record in &report.ports {
        let owner = match (&record.container_id, record.pid) {
            (Some(id), _) => format!("{} [{}]", record.owner, id),
            (None, Some(pid)) => format!("{} (pid {pid})", record.owner),
            (None, None) => record.owner.clone(),
        };
        let marker = if record.internal { " internal" } else { "" };
        println!(
            "{:>5}/{} {:<15} {}{}",
            record.host_port, record.protocol, record.host_ip, owner, marker
        );
    }
}
