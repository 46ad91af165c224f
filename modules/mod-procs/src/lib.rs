//! Socket-inode to process attribution.
//!
//! The primary path scans per-process fd symlinks under every candidate proc
//! root and builds an `inode → (pid, name)` map. Two fallbacks cover hosts
//! where the full scan underperforms: a targeted rescan limited to the
//! unresolved inodes, then the host's `ss` utility. Per-pid errors are
//! swallowed throughout; the resolver degrades to partial attribution, it
//! never fails a collection.

use chrono::DateTime;
use log::{debug, warn};
use mod_sockets::ProcRoots;
use once_cell::sync::Lazy;
use portracker_sdk::{Cache, Listener};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

/// The full fd scan is cached briefly to amortize repeated resolutions
/// within one refresh.
const INODE_MAP_TTL: Duration = Duration::from_secs(2);

/// Below this share of resolved listeners the targeted rescan kicks in.
const FULL_SCAN_MIN_RATIO: f64 = 0.5;
/// Below this share of rescan hits the external tool is consulted.
const RESCAN_MIN_RATIO: f64 = 0.25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOwner {
    pub pid: i32,
    pub name: String,
}

static SOCKET_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^socket:\[(\d+)\]$").expect("socket link regex"));
static SS_INODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"ino:(\d+)").expect("ss inode regex"));
static SS_USER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"users:\(\("([^"]+)",pid=(\d+)"#).expect("ss users regex"));
static CGROUP_DOCKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"docker[/-]([a-f0-9]{64})").expect("cgroup regex"));

/// Enriches listeners with `pid` and `owner`.
///
/// Stage 1: cached full fd scan. Stage 2: targeted rescan when less than
/// half of the listeners resolved. Stage 3: `ss` when the rescan recovered
/// less than a quarter of what was still missing. A containerized agent
/// whose own namespace yields nothing skips straight to `ss`.
pub fn resolve_owners(roots: &ProcRoots, listeners: &mut [Listener], cache: &Cache) {
    if listeners.is_empty() {
        return;
    }

    let cache_key = format!("procs:inode_map:{}", roots.net_dir.display());
    let map = cache
        .get_or_set(&cache_key, Some(INODE_MAP_TTL), || {
            Some(scan_inode_map(roots, None))
        })
        .unwrap_or_default();

    if map.is_empty() && roots.host_namespace {
        // fd links under the container's own namespace do not cover host
        // sockets; go straight to the external tool.
        apply_owners(listeners, &ss_owner_map(roots, wants_udp(listeners)));
        return;
    }

    apply_owners(listeners, &map);

    let total = listeners.len();
    let resolved = listeners.iter().filter(|l| l.pid.is_some()).count();
    if resolved as f64 >= total as f64 * FULL_SCAN_MIN_RATIO {
        return;
    }

    let missing: HashSet<u64> = listeners
        .iter()
        .filter(|l| l.pid.is_none())
        .map(|l| l.inode)
        .collect();
    debug!(
        "inode map resolved {resolved}/{total} listeners, rescanning {} inodes",
        missing.len()
    );
    let targeted = scan_inode_map(roots, Some(&missing));
    apply_owners(listeners, &targeted);

    let recovered = targeted.len();
    if !missing.is_empty() && (recovered as f64 / missing.len() as f64) < RESCAN_MIN_RATIO {
        apply_owners(listeners, &ss_owner_map(roots, wants_udp(listeners)));
    }
}

fn wants_udp(listeners: &[Listener]) -> bool {
    listeners
        .iter()
        .any(|l| l.protocol == portracker_sdk::Protocol::Udp && l.pid.is_none())
}

fn apply_owners(listeners: &mut [Listener], map: &HashMap<u64, ProcessOwner>) {
    for listener in listeners.iter_mut() {
        if listener.pid.is_some() {
            continue;
        }
        if let Some(owner) = map.get(&listener.inode) {
            listener.pid = Some(owner.pid);
            listener.owner = Some(owner.name.clone());
        }
    }
}

/// Scans fd symlinks under every candidate root. With `targets` set the scan
/// only records those inodes and short-circuits once all are matched. The
/// first root to claim an inode keeps it.
pub fn scan_inode_map(
    roots: &ProcRoots,
    targets: Option<&HashSet<u64>>,
) -> HashMap<u64, ProcessOwner> {
    let mut map = HashMap::new();

    'roots: for root in &roots.roots {
        let Ok(entries) = std::fs::read_dir(root) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            let proc_dir = entry.path();
            let Some(name) = process_name(&proc_dir) else {
                continue;
            };

            let Ok(fds) = std::fs::read_dir(proc_dir.join("fd")) else {
                continue;
            };
            for fd in fds.filter_map(|e| e.ok()) {
                let Ok(link) = std::fs::read_link(fd.path()) else {
                    continue;
                };
                let Some(inode) = SOCKET_LINK
                    .captures(&link.to_string_lossy())
                    .and_then(|c| c[1].parse::<u64>().ok())
                else {
                    continue;
                };
                if let Some(targets) = targets {
                    if !targets.contains(&inode) {
                        continue;
                    }
                }
                map.entry(inode).or_insert_with(|| ProcessOwner {
                    pid,
                    name: name.clone(),
                });
                if targets.is_some_and(|t| map.len() == t.len()) {
                    break 'roots;
                }
            }
        }
    }

    map
}

/// Process display name: the `comm` shortname, falling back to the basename
/// of the first `cmdline` token.
fn process_name(proc_dir: &Path) -> Option<String> {
    if let Ok(comm) = std::fs::read_to_string(proc_dir.join("comm")) {
        let comm = comm.trim();
        if !comm.is_empty() {
            return Some(comm.to_string());
        }
    }
    let cmdline = std::fs::read(proc_dir.join("cmdline")).ok()?;
    let first = cmdline.split(|b| *b == 0).next()?;
    let first = String::from_utf8_lossy(first);
    let name = first.rsplit('/').next().unwrap_or(&first).trim().to_string();
    (!name.is_empty()).then_some(name)
}

/// External-tool fallback: `ss -tinp` (and `-uinp` when UDP listeners are
/// still unresolved), entered through the init namespace when the agent
/// reads a host-mounted proc tree.
fn ss_owner_map(roots: &ProcRoots, include_udp: bool) -> HashMap<u64, ProcessOwner> {
    let mut map = HashMap::new();
    parse_ss_output(&run_ss(roots, "-tinp"), &mut map);
    if include_udp {
        parse_ss_output(&run_ss(roots, "-uinp"), &mut map);
    }
    map
}

fn run_ss(roots: &ProcRoots, flags: &str) -> String {
    let mut command = if roots.host_namespace {
        let mut c = Command::new("nsenter");
        c.args(["-t", "1", "-n", "ss", flags]);
        c
    } else {
        let mut c = Command::new("ss");
        c.arg(flags);
        c
    };
    match command.output() {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).into_owned()
        }
        Ok(output) => {
            warn!("ss {flags} exited with {}", output.status);
            String::new()
        }
        Err(err) => {
            warn!("ss {flags} failed to start: {err}");
            String::new()
        }
    }
}

/// Pulls `ino:<n>` and `users:(("name",pid=N,..))` pairs out of `ss` output.
fn parse_ss_output(output: &str, map: &mut HashMap<u64, ProcessOwner>) {
    for line in output.lines() {
        let Some(inode) = SS_INODE
            .captures(line)
            .and_then(|c| c[1].parse::<u64>().ok())
        else {
            continue;
        };
        let Some(user) = SS_USER.captures(line) else {
            continue;
        };
        let Ok(pid) = user[2].parse::<i32>() else {
            continue;
        };
        map.entry(inode).or_insert_with(|| ProcessOwner {
            pid,
            name: user[1].to_string(),
        });
    }
}

/// RFC 3339 start timestamps for the given pids, derived from the proc
/// tree's boot time plus each process's start tick.
pub fn process_start_times(roots: &ProcRoots, pids: &[i32]) -> HashMap<i32, String> {
    let ticks_per_second = procfs::ticks_per_second();
    let mut times = HashMap::new();

    for root in &roots.roots {
        let Some(boot_time) = read_boot_time(root) else {
            continue;
        };
        for pid in pids {
            if times.contains_key(pid) {
                continue;
            }
            let Ok(stat) = std::fs::read_to_string(root.join(pid.to_string()).join("stat")) else {
                continue;
            };
            let Some(start_ticks) = parse_start_ticks(&stat) else {
                continue;
            };
            let started = boot_time + (start_ticks / ticks_per_second.max(1)) as i64;
            if let Some(timestamp) = DateTime::from_timestamp(started, 0) {
                times.insert(*pid, timestamp.to_rfc3339());
            }
        }
    }

    times
}

fn read_boot_time(root: &Path) -> Option<i64> {
    let stat = std::fs::read_to_string(root.join("stat")).ok()?;
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|v| v.trim().parse::<i64>().ok())
}

/// Field 22 of `/proc/<pid>/stat` (starttime), parsed after the closing
/// paren so a comm containing spaces cannot shift the columns.
fn parse_start_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(19)?.parse::<u64>().ok()
}

/// Scans a pid's cgroup file for a 64-char container id; the last-ditch
/// attribution method when fd and engine evidence both fail.
pub fn container_id_from_cgroup(roots: &ProcRoots, pid: i32) -> Option<String> {
    for root in &roots.roots {
        let Ok(cgroup) = std::fs::read_to_string(root.join(pid.to_string()).join("cgroup")) else {
            continue;
        };
        if let Some(captures) = CGROUP_DOCKER.captures(&cgroup) {
            return Some(captures[1].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use portracker_sdk::Protocol;
    use std::os::unix::fs::symlink;

    fn fixture_roots(root: &Path) -> ProcRoots {
        ProcRoots {
            roots: vec![root.to_path_buf()],
            net_dir: root.join("net"),
            host_namespace: false,
        }
    }

    fn write_process(root: &Path, pid: i32, comm: &str, socket_inodes: &[u64]) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(dir.join("fd")).unwrap();
        std::fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        for (fd, inode) in socket_inodes.iter().enumerate() {
            symlink(format!("socket:[{inode}]"), dir.join("fd").join(fd.to_string())).unwrap();
        }
    }

    fn listener(protocol: Protocol, port: u16, inode: u64) -> Listener {
        Listener {
            protocol,
            host_ip: "0.0.0.0".to_string(),
            host_port: port,
            inode,
            pid: None,
            owner: None,
        }
    }

    #[test]
    fn full_scan_maps_socket_inodes() {
        let dir = tempfile::tempdir().unwrap();
        write_process(dir.path(), 100, "nginx", &[4242, 4243]);
        write_process(dir.path(), 200, "sshd", &[5000]);

        let map = scan_inode_map(&fixture_roots(dir.path()), None);
        assert_eq!(map.get(&4242).map(|o| o.name.as_str()), Some("nginx"));
        assert_eq!(map.get(&5000).map(|o| o.pid), Some(200));
    }

    #[test]
    fn first_root_wins_on_duplicate_inodes() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_process(a.path(), 10, "first", &[77]);
        write_process(b.path(), 20, "second", &[77]);

        let roots = ProcRoots {
            roots: vec![a.path().to_path_buf(), b.path().to_path_buf()],
            net_dir: a.path().join("net"),
            host_namespace: false,
        };
        let map = scan_inode_map(&roots, None);
        assert_eq!(map.get(&77).map(|o| o.name.as_str()), Some("first"));
    }

    #[test]
    fn targeted_scan_only_records_requested_inodes() {
        let dir = tempfile::tempdir().unwrap();
        write_process(dir.path(), 100, "nginx", &[1, 2, 3]);

        let targets = HashSet::from([2u64]);
        let map = scan_inode_map(&fixture_roots(dir.path()), Some(&targets));
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&2));
    }

    #[test]
    fn resolve_owners_enriches_listeners() {
        let dir = tempfile::tempdir().unwrap();
        write_process(dir.path(), 321, "redis-server", &[9001]);

        let mut listeners = vec![listener(Protocol::Tcp, 6379, 9001)];
        resolve_owners(&fixture_roots(dir.path()), &mut listeners, &Cache::new());
        assert_eq!(listeners[0].pid, Some(321));
        assert_eq!(listeners[0].owner.as_deref(), Some("redis-server"));
    }

    #[test]
    fn process_name_falls_back_to_cmdline_basename() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("55");
        std::fs::create_dir_all(&proc_dir).unwrap();
        std::fs::write(proc_dir.join("comm"), "\n").unwrap();
        std::fs::write(
            proc_dir.join("cmdline"),
            b"/usr/local/bin/redis-server\0--port\x006379\0",
        )
        .unwrap();
        assert_eq!(process_name(&proc_dir).as_deref(), Some("redis-server"));
    }

    #[test]
    fn ss_output_yields_inode_owner_pairs() {
        let output = concat!(
            "State  Recv-Q Send-Q Local Address:Port Peer Address:Port\n",
            "LISTEN 0      128    0.0.0.0:22        0.0.0.0:*    users:((\"sshd\",pid=800,fd=3)) ino:18000 sk:1\n",
            "LISTEN 0      511    127.0.0.1:6379    0.0.0.0:*    users:((\"redis-server\",pid=900,fd=6),(\"redis-server\",pid=901,fd=6)) ino:18001 sk:2\n",
            "LISTEN 0      4096   0.0.0.0:111       0.0.0.0:*    ino:18002 sk:3\n",
        );
        let mut map = HashMap::new();
        parse_ss_output(output, &mut map);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&18000).map(|o| o.pid), Some(800));
        assert_eq!(
            map.get(&18001).map(|o| o.name.as_str()),
            Some("redis-server")
        );
    }

    #[test]
    fn start_ticks_survive_spaces_in_comm() {
        let stat = "1234 (tmux: server) S 1 1234 1234 0 -1 4194560 2486 0 0 0 3 7 0 0 20 0 1 0 5310829 12345 678 18446744073709551615";
        assert_eq!(parse_start_ticks(stat), Some(5310829));
    }

    #[test]
    fn start_times_combine_btime_and_ticks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("stat"),
            "cpu  1 2 3 4\nbtime 1700000000\nprocesses 999\n",
        )
        .unwrap();
        let proc_dir = dir.path().join("42");
        std::fs::create_dir_all(&proc_dir).unwrap();
        std::fs::write(
            proc_dir.join("stat"),
            "42 (svc) S 1 42 42 0 -1 4194560 0 0 0 0 0 0 0 0 20 0 1 0 0 1000 10 18446744073709551615",
        )
        .unwrap();

        let times = process_start_times(&fixture_roots(dir.path()), &[42]);
        // starttime 0 ticks puts the process exactly at boot.
        assert_eq!(times.get(&42).map(String::as_str), Some("2023-11-14T22:13:20+00:00"));
    }

    #[test]
    fn cgroup_scan_extracts_container_id() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("77");
        std::fs::create_dir_all(&proc_dir).unwrap();
        let id = "a".repeat(64);
        std::fs::write(
            proc_dir.join("cgroup"),
            format!("0::/system.slice/docker-{id}.scope\n"),
        )
        .unwrap();
        assert_eq!(
            container_id_from_cgroup(&fixture_roots(dir.path()), 77).as_deref(),
            Some(id.as_str())
        );

        let missing: Option<String> = container_id_from_cgroup(&fixture_roots(dir.path()), 78);
        assert!(missing.is_none());
    }
}
