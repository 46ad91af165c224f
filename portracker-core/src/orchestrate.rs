//! Drives one refresh: fans the sources out, joins them, reconciles, and
//! emits the report.
//!
//! The platform phase runs fire-and-forget under its own 15 s deadline and
//! never blocks the rest; kernel scans run on the blocking pool while the
//! engine is queried; per-container inspections are bounded by
//! `min(16, cpu count)` permits.

use crate::reconcile::{ContainerMatch, ReconcileInput, merge_platform_ports, reconcile};
use chrono::Utc;
use log::{debug, warn};
use mod_docker::{DockerSource, container_port_records};
use mod_platform::{PLATFORM_PHASE_TIMEOUT, PlatformClient, PlatformData};
use mod_sockets::{ProcRoots, enumerate_listeners};
use portracker_sdk::{
    CollectError, CollectionContext, ContainerInfo, ContainerRef, Listener, Report, cache,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// What a collector asks the orchestrator to drive.
pub(crate) struct CollectorPlan {
    pub id: &'static str,
    pub use_docker: bool,
    pub use_platform: bool,
}

pub(crate) async fn orchestrate(
    ctx: &CollectionContext,
    plan: CollectorPlan,
) -> Result<Report, CollectError> {
    cache::set_disabled(ctx.disable_cache);
    let cache = cache::shared();
    let mut report = Report::empty(plan.id, Utc::now().to_rfc3339());

    // Platform phase: spawned first, awaited last.
    let platform_task = if plan.use_platform && ctx.platform_enabled() {
        let key = ctx.platform_api_key.clone().unwrap_or_default();
        match PlatformClient::new(ctx.platform_url.as_deref(), &key) {
            Ok(client) => Some(tokio::spawn(async move {
                tokio::time::timeout(PLATFORM_PHASE_TIMEOUT, client.collect()).await
            })),
            Err(err) => {
                warn!("platform client setup failed: {err:#}");
                None
            }
        }
    } else {
        None
    };

    // Kernel scans are plain file I/O; keep them off the async workers.
    let proc_root = ctx.proc_root.clone();
    let include_udp = ctx.include_udp;
    let listener_task = tokio::task::spawn_blocking(move || -> anyhow::Result<(ProcRoots, Vec<Listener>)> {
        let roots = ProcRoots::detect(proc_root.as_deref())?;
        let mut listeners = enumerate_listeners(&roots, include_udp)?;
        mod_procs::resolve_owners(&roots, &mut listeners, cache::shared());
        Ok((roots, listeners))
    });
    let ttl_ms = ctx.cache_timeout_ms;
    let sysinfo_task =
        tokio::task::spawn_blocking(move || mod_hostinfo::system_info(cache::shared(), ttl_ms));

    // Container source: list, then inspect with bounded concurrency.
    let mut docker_ok = false;
    let mut containers: Vec<ContainerInfo> = Vec::new();
    let docker = if plan.use_docker {
        match DockerSource::connect(ctx) {
            Ok(source) => Some(source),
            Err(err) => {
                warn!("container engine unavailable: {err:#}");
                report.error = Some(format!("container engine unavailable: {err:#}"));
                None
            }
        }
    } else {
        None
    };
    if let Some(source) = &docker {
        match source.ping().await {
            Ok(()) => match source.list_containers(true, cache).await {
                Ok(summaries) => {
                    docker_ok = true;
                    containers = inspect_all(source, summaries, cache).await;
                }
                Err(err) => {
                    warn!("container listing failed: {err:#}");
                    report.error = Some(format!("container listing failed: {err:#}"));
                }
            },
            Err(err) => {
                warn!("engine did not answer ping: {err:#}");
                report.error = Some(format!("container engine unavailable: {err:#}"));
            }
        }
    }

    let mut sockets_ok = false;
    let (roots, listeners) = match listener_task.await {
        Ok(Ok((roots, listeners))) => {
            sockets_ok = true;
            (Some(roots), listeners)
        }
        Ok(Err(err)) => {
            warn!("socket enumeration failed: {err:#}");
            (None, Vec::new())
        }
        Err(join_err) => {
            warn!("socket enumeration panicked: {join_err}");
            (None, Vec::new())
        }
    };
    report.system_info = sysinfo_task.await.ok();

    // Attribution maps: container PID-1s, host-networked pids, and the
    // cgroup fallback for anything both of those missed.
    let mut pid_to_container: HashMap<i32, ContainerRef> = HashMap::new();
    for container in &containers {
        if let Some(pid) = container.pid {
            pid_to_container.insert(
                pid,
                ContainerRef {
                    id: container.id.clone(),
                    name: container.name.clone(),
                },
            );
        }
    }
    let host_proc_to_container = match &docker {
        Some(source) => source.host_networked_pid_map(&containers, cache).await,
        None => HashMap::new(),
    };
    if let Some(roots) = &roots {
        for listener in &listeners {
            let Some(pid) = listener.pid else { continue };
            if pid_to_container.contains_key(&pid) || host_proc_to_container.contains_key(&pid) {
                continue;
            }
            let Some(cgroup_id) = mod_procs::container_id_from_cgroup(roots, pid) else {
                continue;
            };
            if let Some(container) = containers.iter().find(|c| c.id == cgroup_id) {
                pid_to_container.insert(
                    pid,
                    ContainerRef {
                        id: container.id.clone(),
                        name: container.name.clone(),
                    },
                );
            }
        }
    }

    let container_created: HashMap<String, String> = containers
        .iter()
        .filter_map(|c| c.created.clone().map(|t| (c.short_id(), t)))
        .collect();
    let pids: Vec<i32> = listeners.iter().filter_map(|l| l.pid).collect();
    let process_started = roots
        .as_ref()
        .map(|roots| mod_procs::process_start_times(roots, &pids))
        .unwrap_or_default();

    let docker_ports = containers.iter().flat_map(container_port_records).collect();
    let matches: Vec<ContainerMatch> = containers
        .iter()
        .map(|c| ContainerMatch {
            id: c.id.clone(),
            name: c.name.clone(),
            image: c.image.clone(),
        })
        .collect();

    report.ports = reconcile(ReconcileInput {
        docker_ports,
        system_listeners: listeners,
        pid_to_container,
        host_proc_to_container,
        container_created,
        process_started,
        containers: matches,
        self_port: ctx.listen_port,
        self_container_name: ctx.self_container_name.clone(),
        include_udp: ctx.include_udp,
    });

    // Join the platform phase; a timeout or failure only costs the enhanced
    // fields, never the rest of the report.
    let mut enhanced = false;
    if let Some(task) = platform_task {
        match task.await {
            Ok(Ok(Ok(data))) => {
                enhanced = true;
                apply_platform_data(&mut report, data);
            }
            Ok(Ok(Err(err))) => warn!("platform phase failed: {err:#}"),
            Ok(Err(_)) => warn!(
                "platform phase exceeded its {}s deadline",
                PLATFORM_PHASE_TIMEOUT.as_secs()
            ),
            Err(join_err) => warn!("platform phase panicked: {join_err}"),
        }
    }
    report.enhanced_features_enabled = enhanced;

    if report.platform_name.is_none() {
        report.platform_name = match &docker {
            Some(source) if docker_ok => source.engine_summary().await,
            _ => report.system_info.as_ref().and_then(|si| si.os_name.clone()),
        };
    }

    if !sockets_ok && !docker_ok && !enhanced {
        report.error = Some("every source failed; report is empty".to_string());
        return Err(CollectError::Fatal {
            report: Box::new(report),
        });
    }
    debug!(
        "collected {} ports, {} apps, {} vms",
        report.ports.len(),
        report.applications.len(),
        report.vms.len()
    );
    Ok(report)
}

fn apply_platform_data(report: &mut Report, data: PlatformData) {
    report.platform_name = match (&data.product, &data.version) {
        (Some(product), Some(version)) => Some(format!("{product} {version}")),
        (Some(product), None) => Some(product.clone()),
        (None, version) => version.clone(),
    };
    if let (Some(info), Some(hostname)) = (report.system_info.as_mut(), data.hostname) {
        info.hostname = Some(hostname);
    }
    merge_platform_ports(&mut report.ports, &data.apps);
    report.applications = data.apps;
    report.vms = data.vms;
}

/// Inspects every listed container concurrently, bounded by
/// `min(16, cpu count)` permits. A failed inspect keeps the summary row
/// with empty port metadata instead of dropping the container.
async fn inspect_all(
    source: &DockerSource,
    summaries: Vec<ContainerInfo>,
    cache: &'static portracker_sdk::Cache,
) -> Vec<ContainerInfo> {
    let limit = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(16);
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut tasks = JoinSet::new();

    for summary in summaries {
        let source = source.clone();
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            match source.inspect_container(&summary, false, cache).await {
                Ok(info) => info,
                Err(err) => {
                    warn!("inspect failed for {}: {err:#}", summary.short_id());
                    summary
                }
            }
        });
    }

    let mut containers = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(info) => containers.push(info),
            Err(join_err) => warn!("inspection task panicked: {join_err}"),
        }
    }
    containers.sort_by(|a, b| a.name.cmp(&b.name));
    containers
}
