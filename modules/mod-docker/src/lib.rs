//! Container engine source over the HTTP/JSON API.
//!
//! Endpoint discovery prefers an explicit URI (`unix://`, `npipe://`,
//! `tcp://` with optional mutual TLS) and falls back to the OS-default local
//! socket. All read methods route through the shared TTL cache; a connect
//! failure is surfaced to the caller while per-container failures degrade to
//! empty port metadata.

use anyhow::{Context as _, Result, bail};
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, StatsOptions, TopOptions,
};
use bollard::models::{ContainerInspectResponse, ContainerSummary};
use bollard::{API_DEFAULT_VERSION, Docker};
use chrono::DateTime;
use futures_util::StreamExt as _;
use log::{debug, warn};
use portracker_sdk::{
    BoundPort, Cache, CollectionContext, ContainerInfo, ContainerRef, PortRecord, Protocol, Source,
};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

const LIST_TTL: Duration = Duration::from_secs(4);
const INSPECT_TTL: Duration = Duration::from_secs(5);
const STATS_TTL: Duration = Duration::from_millis(1500);
const HOST_PID_MAP_TTL: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// How the engine endpoint was reached; recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPattern {
    Socket,
    NamedPipe,
    Proxy,
}

impl fmt::Display for DeployPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            DeployPattern::Socket => "socket",
            DeployPattern::NamedPipe => "npipe",
            DeployPattern::Proxy => "proxy",
        };
        f.write_str(value)
    }
}

/// CPU and memory percentages from one non-streaming stats sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerStats {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
}

#[derive(Clone)]
pub struct DockerSource {
    docker: Docker,
    pub deploy_pattern: DeployPattern,
}

// The engine paths use explicit get/set instead of `get_or_set` because the
// fetches are async; the disable flag has to be honored here as well.
fn cache_get<T: Send + Sync + 'static>(cache: &Cache, key: &str) -> Option<std::sync::Arc<T>> {
    if portracker_sdk::cache::disabled() {
        return None;
    }
    cache.get(key)
}

fn cache_put<T: Send + Sync + 'static>(cache: &Cache, key: &str, value: T, ttl: Duration) {
    if !portracker_sdk::cache::disabled() {
        cache.set(key, value, Some(ttl));
    }
}

impl DockerSource {
    /// Resolves the endpoint and builds a pooled client. TLS material that
    /// fails to load downgrades the connection to plaintext with a warning
    /// instead of failing the connect.
    pub fn connect(ctx: &CollectionContext) -> Result<Self> {
        let (docker, deploy_pattern) = match ctx.docker_endpoint.as_deref() {
            None => (
                Docker::connect_with_local_defaults()
                    .context("connecting to the default engine socket")?,
                DeployPattern::Socket,
            ),
            Some(uri) if uri.starts_with("unix://") => {
                let path = uri.trim_start_matches("unix://");
                (
                    Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
                        .with_context(|| format!("connecting to engine socket {path}"))?,
                    DeployPattern::Socket,
                )
            }
            Some(uri) if uri.starts_with("npipe://") => Self::connect_named_pipe(uri)?,
            Some(uri) if uri.starts_with("tcp://") || uri.starts_with("http://") => {
                (Self::connect_tcp(ctx, uri)?, DeployPattern::Proxy)
            }
            Some(other) => bail!("unsupported engine endpoint {other}"),
        };
        debug!("engine endpoint resolved via {deploy_pattern} pattern");
        Ok(DockerSource {
            docker,
            deploy_pattern,
        })
    }

    #[cfg(windows)]
    fn connect_named_pipe(uri: &str) -> Result<(Docker, DeployPattern)> {
        let path = uri.trim_start_matches("npipe://");
        Ok((
            Docker::connect_with_named_pipe(path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
                .with_context(|| format!("connecting to named pipe {path}"))?,
            DeployPattern::NamedPipe,
        ))
    }

    #[cfg(not(windows))]
    fn connect_named_pipe(uri: &str) -> Result<(Docker, DeployPattern)> {
        bail!("named-pipe endpoint {uri} is only supported on Windows")
    }

    fn connect_tcp(ctx: &CollectionContext, uri: &str) -> Result<Docker> {
        if ctx.tls_verify {
            if let Some(cert_dir) = ctx.cert_path.as_deref() {
                let key = cert_dir.join("key.pem");
                let cert = cert_dir.join("cert.pem");
                let ca = cert_dir.join("ca.pem");
                if key.is_file() && cert.is_file() && ca.is_file() {
                    match Docker::connect_with_ssl(
                        uri,
                        &key,
                        &cert,
                        &ca,
                        CONNECT_TIMEOUT_SECS,
                        API_DEFAULT_VERSION,
                    ) {
                        Ok(docker) => return Ok(docker),
                        Err(err) => {
                            warn!("TLS setup for {uri} failed ({err}), downgrading to plaintext")
                        }
                    }
                } else {
                    warn!(
                        "TLS material incomplete under {}, downgrading to plaintext",
                        cert_dir.display()
                    );
                }
            }
        }
        Docker::connect_with_http(uri, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .with_context(|| format!("connecting to engine endpoint {uri}"))
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await.context("engine ping")?;
        Ok(())
    }

    /// Engine version plus host OS from the version and info endpoints,
    /// e.g. `Docker 24.0.7 (Debian GNU/Linux 12)`.
    pub async fn engine_summary(&self) -> Option<String> {
        let version = self.docker.version().await.ok().and_then(|v| v.version)?;
        match self
            .docker
            .info()
            .await
            .ok()
            .and_then(|info| info.operating_system)
        {
            Some(os) => Some(format!("Docker {version} ({os})")),
            None => Some(format!("Docker {version}")),
        }
    }

    /// Lists containers; cached ≈4 s per `all` flag.
    pub async fn list_containers(&self, all: bool, cache: &Cache) -> Result<Vec<ContainerInfo>> {
        let key = if all {
            "docker:list:all"
        } else {
            "docker:list:running"
        };
        if let Some(hit) = cache_get::<Vec<ContainerInfo>>(cache, key) {
            return Ok((*hit).clone());
        }

        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .context("listing containers")?;
        let containers: Vec<ContainerInfo> = summaries.into_iter().map(summary_to_info).collect();
        cache_put(cache, key, containers.clone(), LIST_TTL);
        Ok(containers)
    }

    /// Inspects one container; cached ≈5 s unless the size flag is set
    /// (size computations are expensive and always fresh).
    pub async fn inspect_container(
        &self,
        summary: &ContainerInfo,
        size: bool,
        cache: &Cache,
    ) -> Result<ContainerInfo> {
        let key = format!("docker:inspect:{}", summary.id);
        if !size {
            if let Some(hit) = cache_get::<ContainerInfo>(cache, &key) {
                return Ok((*hit).clone());
            }
        }

        let response = self
            .docker
            .inspect_container(&summary.id, Some(InspectContainerOptions { size }))
            .await
            .with_context(|| format!("inspecting container {}", summary.short_id()))?;
        let info = merge_inspect(summary.clone(), response);
        if !size {
            cache_put(cache, &key, info.clone(), INSPECT_TTL);
        }
        Ok(info)
    }

    /// Health state straight from the (cached) inspect result.
    pub async fn container_health(&self, summary: &ContainerInfo, cache: &Cache) -> Option<String> {
        self.inspect_container(summary, false, cache)
            .await
            .ok()
            .and_then(|info| info.health)
    }

    /// Host-visible pids of a container's processes via the engine's `top`.
    pub async fn container_processes(&self, id: &str) -> Result<Vec<i32>> {
        let top = self
            .docker
            .top_processes(id, Some(TopOptions { ps_args: "-eo pid" }))
            .await
            .with_context(|| format!("listing processes of {id}"))?;
        Ok(parse_top_pids(
            top.titles.as_deref().unwrap_or_default(),
            top.processes.as_deref().unwrap_or_default(),
        ))
    }

    /// One non-streaming stats sample; cached ≈1.5 s.
    pub async fn container_stats(
        &self,
        summary: &ContainerInfo,
        cache: &Cache,
    ) -> Result<ContainerStats> {
        let key = format!("docker:stats:{}", summary.id);
        if let Some(hit) = cache_get::<ContainerStats>(cache, &key) {
            return Ok(*hit);
        }

        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut samples = Box::pin(self.docker.stats(&summary.id, Some(options)));
        let sample = samples
            .next()
            .await
            .transpose()
            .with_context(|| format!("sampling stats of {}", summary.short_id()))?
            .ok_or_else(|| anyhow::anyhow!("engine returned no stats sample"))?;

        let stats = ContainerStats {
            cpu_percent: cpu_percent(
                sample.cpu_stats.cpu_usage.total_usage,
                sample.precpu_stats.cpu_usage.total_usage,
                sample.cpu_stats.system_cpu_usage,
                sample.precpu_stats.system_cpu_usage,
                sample.cpu_stats.online_cpus,
            ),
            memory_percent: memory_percent(sample.memory_stats.usage, sample.memory_stats.limit),
        };
        cache_put(cache, &key, stats, STATS_TTL);
        Ok(stats)
    }

    /// `pid → container` for every host-networked container. Their listeners
    /// only ever appear in the kernel tables, so this map is the single way
    /// they get attributed. Cached 120 s.
    pub async fn host_networked_pid_map(
        &self,
        containers: &[ContainerInfo],
        cache: &Cache,
    ) -> HashMap<i32, ContainerRef> {
        if let Some(hit) = cache_get::<HashMap<i32, ContainerRef>>(cache, "docker:hostnet_pids") {
            return (*hit).clone();
        }

        let mut map = HashMap::new();
        for container in containers.iter().filter(|c| c.is_host_networked()) {
            match self.container_processes(&container.id).await {
                Ok(pids) => {
                    for pid in pids {
                        map.entry(pid).or_insert_with(|| ContainerRef {
                            id: container.id.clone(),
                            name: container.name.clone(),
                        });
                    }
                }
                Err(err) => warn!(
                    "top failed for host-networked container {}: {err:#}",
                    container.short_id()
                ),
            }
        }
        cache_put(cache, "docker:hostnet_pids", map.clone(), HOST_PID_MAP_TTL);
        map
    }
}

/// Converts a list row into the normalized container shape. Port metadata
/// stays empty until the inspect pass fills it.
fn summary_to_info(summary: ContainerSummary) -> ContainerInfo {
    let names: Vec<String> = summary
        .names
        .unwrap_or_default()
        .iter()
        .map(|name| name.trim_start_matches('/').to_string())
        .collect();
    let name = if names.is_empty() {
        summary
            .id
            .as_deref()
            .map(|id| id.chars().take(12).collect())
            .unwrap_or_default()
    } else {
        names.join(", ")
    };

    ContainerInfo {
        id: summary.id.unwrap_or_default(),
        name,
        names,
        image: summary.image.unwrap_or_default(),
        command: summary.command,
        created: summary
            .created
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.to_rfc3339()),
        state: summary.state.unwrap_or_default(),
        network_mode: summary.host_config.and_then(|hc| hc.network_mode),
        pid: None,
        port_bindings: Vec::new(),
        exposed_ports: Vec::new(),
        health: None,
    }
}

/// Folds an inspect response into the summary-derived container. Bindings
/// come from `HostConfig.PortBindings` and declared ports from
/// `Config.ExposedPorts`; a missing binding ip defaults to `0.0.0.0`.
fn merge_inspect(mut info: ContainerInfo, response: ContainerInspectResponse) -> ContainerInfo {
    if let Some(name) = response.name {
        let name = name.trim_start_matches('/').to_string();
        if !name.is_empty() {
            info.name = name.clone();
            info.names = vec![name];
        }
    }
    if let Some(created) = response
        .created
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
    {
        info.created = Some(created.to_rfc3339());
    }
    if let Some(state) = response.state.as_ref() {
        if let Some(status) = state.status.as_ref() {
            info.state = status.to_string();
        }
        info.pid = state.pid.filter(|pid| *pid > 0).map(|pid| pid as i32);
        info.health = state
            .health
            .as_ref()
            .and_then(|h| h.status.as_ref())
            .map(|s| s.to_string());
    }
    if let Some(host_config) = response.host_config {
        if host_config.network_mode.is_some() {
            info.network_mode = host_config.network_mode;
        }
        for (port_key, bindings) in host_config.port_bindings.unwrap_or_default() {
            let Some((container_port, protocol)) = parse_port_key(&port_key) else {
                continue;
            };
            for binding in bindings.unwrap_or_default() {
                let Some(host_port) = binding
                    .host_port
                    .as_deref()
                    .and_then(|p| p.parse::<u16>().ok())
                else {
                    continue;
                };
                let host_ip = match binding.host_ip.as_deref() {
                    None | Some("") => "0.0.0.0".to_string(),
                    Some(ip) => ip.to_string(),
                };
                info.port_bindings.push(BoundPort {
                    container_port,
                    protocol,
                    host_ip,
                    host_port,
                });
            }
        }
    }
    if let Some(config) = response.config {
        info.exposed_ports = config
            .exposed_ports
            .unwrap_or_default()
            .keys()
            .filter_map(|key| parse_port_key(key))
            .collect();
        info.exposed_ports.sort_unstable();
    }
    info
}

/// Splits an engine port key such as `5432/tcp`.
fn parse_port_key(key: &str) -> Option<(u16, Protocol)> {
    let (port, protocol) = key.split_once('/')?;
    Some((port.parse::<u16>().ok()?, Protocol::parse(protocol)?))
}

fn parse_top_pids(titles: &[String], processes: &[Vec<String>]) -> Vec<i32> {
    let pid_column = titles
        .iter()
        .position(|title| title.eq_ignore_ascii_case("pid"))
        .unwrap_or(0);
    processes
        .iter()
        .filter_map(|row| row.get(pid_column))
        .filter_map(|pid| pid.trim().parse::<i32>().ok())
        .collect()
}

/// Engine-sourced port records: one per published binding plus an internal
/// record for every exposed port that lacks a binding.
pub fn container_port_records(container: &ContainerInfo) -> Vec<PortRecord> {
    let short_id = container.short_id();
    let mut records: Vec<PortRecord> = container
        .port_bindings
        .iter()
        .map(|binding| PortRecord {
            source: Source::Container,
            protocol: binding.protocol,
            host_ip: binding.host_ip.clone(),
            host_port: binding.host_port,
            target: Some(binding.container_port.to_string()),
            owner: container.name.clone(),
            container_id: Some(short_id.clone()),
            app_id: Some(short_id.clone()),
            pid: None,
            created: container.created.clone(),
            internal: false,
        })
        .collect();

    for (container_port, protocol) in &container.exposed_ports {
        let published = container
            .port_bindings
            .iter()
            .any(|b| b.container_port == *container_port && b.protocol == *protocol);
        if published {
            continue;
        }
        records.push(PortRecord {
            source: Source::Container,
            protocol: *protocol,
            host_ip: "0.0.0.0".to_string(),
            host_port: *container_port,
            target: Some(format!("{short_id}:{container_port}(internal)")),
            owner: container.name.clone(),
            container_id: Some(short_id.clone()),
            app_id: Some(short_id.clone()),
            pid: None,
            created: container.created.clone(),
            internal: true,
        });
    }

    records
}

/// CPU percentage from successive snapshots:
/// `(cpuDelta / systemDelta) × onlineCPUs × 100`. Any zero or missing
/// factor yields `None`, never a fabricated zero.
pub fn cpu_percent(
    cpu_total: u64,
    precpu_total: u64,
    system_usage: Option<u64>,
    presystem_usage: Option<u64>,
    online_cpus: Option<u64>,
) -> Option<f64> {
    let cpu_delta = cpu_total.checked_sub(precpu_total)?;
    let system_delta = system_usage?.checked_sub(presystem_usage?)?;
    let online = online_cpus?;
    if cpu_delta == 0 || system_delta == 0 || online == 0 {
        return None;
    }
    Some(cpu_delta as f64 / system_delta as f64 * online as f64 * 100.0)
}

/// `usage/limit × 100` when a limit is actually set.
pub fn memory_percent(usage: Option<u64>, limit: Option<u64>) -> Option<f64> {
    let usage = usage?;
    let limit = limit.filter(|l| *l > 0)?;
    Some(usage as f64 / limit as f64 * 100.0)
}
