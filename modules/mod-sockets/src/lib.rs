//! Kernel listening-socket enumeration.
//!
//! Reads the space-separated socket tables under `<procRoot>/net/{tcp,tcp6,
//! udp,udp6}` the way `ss` does, keeping TCP rows in the LISTEN state and
//! UDP rows with a bound local address.
//!
//! <https://www.kernel.org/doc/Documentation/networking/proc_net_tcp.txt>

use anyhow::{Result, bail};
use log::{debug, warn};
use portracker_sdk::{Listener, Protocol};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

/// Hex state code for TCP LISTEN.
const TCP_STATE_LISTEN: &str = "0A";

/// UDP ports retained even when generic UDP collection is disabled: DNS,
/// DHCP client/server, NTP, NetBIOS, SNMP (+traps), IKE, syslog, OpenVPN
/// (+alt), IKE NAT-T, and WireGuard (+two common extra instances).
pub const KNOWN_UDP_PORTS: [u16; 16] = [
    53, 67, 68, 123, 137, 138, 161, 162, 500, 514, 1194, 1198, 4500, 51820, 51821, 51822,
];

pub fn is_known_udp_port(port: u16) -> bool {
    KNOWN_UDP_PORTS.contains(&port)
}

/// Resolved view of the kernel proc interface.
///
/// `roots` keeps every existing candidate in probe order so the process
/// resolver can merge pid scans across them; `net_dir` is the directory the
/// socket tables are read from.
#[derive(Debug, Clone)]
pub struct ProcRoots {
    pub roots: Vec<PathBuf>,
    pub net_dir: PathBuf,
    /// True when the agent is containerized but reads the host's init
    /// namespace through a host-mounted proc tree.
    pub host_namespace: bool,
}

impl ProcRoots {
    /// Probes the candidate roots (operator override, `/host/proc`,
    /// `/hostproc`, `/proc`) and picks the first that exposes the
    /// listening-socket tables.
    pub fn detect(override_root: Option<&Path>) -> Result<ProcRoots> {
        let candidates = candidate_roots(override_root);
        let roots: Vec<PathBuf> = candidates.into_iter().filter(|p| p.is_dir()).collect();

        for root in &roots {
            if !root.join("net/tcp").is_file() && !root.join("1/net/tcp").is_file() {
                continue;
            }
            // Inside a container the agent's own /proc/net belongs to the
            // container netns; a host proc tree lets us read pid 1's tables.
            let host_namespace = agent_in_container()
                && proc_entry_count(root) > 100
                && root.join("1/net/tcp").is_file();
            let net_dir = if host_namespace {
                root.join("1/net")
            } else {
                root.join("net")
            };
            debug!(
                "using proc root {} (net tables at {})",
                root.display(),
                net_dir.display()
            );
            return Ok(ProcRoots {
                roots: roots.clone(),
                net_dir,
                host_namespace,
            });
        }

        bail!("no candidate proc root exposes the kernel socket tables")
    }
}

fn candidate_roots(override_root: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(root) = override_root {
        candidates.push(root.to_path_buf());
    }
    candidates.push(PathBuf::from("/host/proc"));
    candidates.push(PathBuf::from("/hostproc"));
    candidates.push(PathBuf::from("/proc"));
    candidates
}

/// Container marker files written by the common runtimes.
pub fn agent_in_container() -> bool {
    Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists()
}

/// Number of numeric pid directories under a proc root. A containerized
/// agent looking at its own namespace sees a handful; a host tree has
/// hundreds.
pub fn proc_entry_count(root: &Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
                })
                .count()
        })
        .unwrap_or(0)
}

/// Parses the kernel tables and returns every listening endpoint.
///
/// A missing table is logged and skipped; only a total inability to read
/// any table is an error.
pub fn enumerate_listeners(roots: &ProcRoots, include_udp: bool) -> Result<Vec<Listener>> {
    let mut listeners = Vec::new();
    let mut readable = 0usize;

    for (file, protocol) in [
        ("tcp", Protocol::Tcp),
        ("tcp6", Protocol::Tcp),
        ("udp", Protocol::Udp),
        ("udp6", Protocol::Udp),
    ] {
        let path = roots.net_dir.join(file);
        match std::fs::read_to_string(&path) {
            Ok(table) => {
                readable += 1;
                parse_table(&table, protocol, include_udp, &mut listeners);
            }
            Err(err) => warn!("skipping unreadable socket table {}: {err}", path.display()),
        }
    }

    if readable == 0 {
        bail!(
            "no socket table readable under {}",
            roots.net_dir.display()
        );
    }
    Ok(listeners)
}

fn parse_table(table: &str, protocol: Protocol, include_udp: bool, out: &mut Vec<Listener>) {
    for line in table.lines().skip(1) {
        if let Some(listener) = parse_row(line, protocol) {
            if protocol == Protocol::Udp && !include_udp && !is_known_udp_port(listener.host_port)
            {
                continue;
            }
            out.push(listener);
        }
    }
}

/// Parses one table row. Fields of interest: local address (col 2), state
/// (col 4), inode (col 10). TCP rows are kept only in LISTEN state; UDP has
/// no listen state, so any row with a usable local address is kept.
fn parse_row(line: &str, protocol: Protocol) -> Option<Listener> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    if protocol == Protocol::Tcp && !fields[3].eq_ignore_ascii_case(TCP_STATE_LISTEN) {
        return None;
    }

    let (host_ip, host_port) = parse_local_address(fields[1])?;
    if host_port == 0 {
        return None;
    }
    let inode = fields[9].parse::<u64>().ok()?;

    Some(Listener {
        protocol,
        host_ip,
        host_port,
        inode,
        pid: None,
        owner: None,
    })
}

/// Splits a `HEXADDR:HEXPORT` column into a printable address and a port.
pub fn parse_local_address(value: &str) -> Option<(String, u16)> {
    let (addr_hex, port_hex) = value.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let addr = match addr_hex.len() {
        8 => parse_ipv4_hex(addr_hex)?.to_string(),
        32 => parse_ipv6_hex(addr_hex)?.to_string(),
        _ => return None,
    };
    Some((addr, port))
}

/// 8-hex IPv4 address in little-endian byte order: `0100007F` → 127.0.0.1.
pub fn parse_ipv4_hex(hex: &str) -> Option<Ipv4Addr> {
    if hex.len() != 8 {
        return None;
    }
    let raw = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(raw.swap_bytes()))
}

/// 32-hex IPv6 address stored as four little-endian 32-bit groups.
pub fn parse_ipv6_hex(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 16];
    for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
        let group = u32::from_str_radix(&hex[i * 8..(i + 1) * 8], 16).ok()?;
        chunk.copy_from_slice(&group.swap_bytes().to_be_bytes());
    }
    Some(Ipv6Addr::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const TCP_TABLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
         0: 0100007F:0F46 00000000:0000 0A 00000000:00000000 00:00000000 00000000   101        0 21010 1 0000000000000000 100 0 0 10 0\n\
         1: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 18000 1 0000000000000000 100 0 0 10 0\n\
         2: 0100007F:9470 0100007F:0F46 01 00000000:00000000 00:00000000 00000000  1000        0 99999 1 0000000000000000 20 4 30 10 -1\n";

    const UDP_TABLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops\n\
         0: 00000000:0035 00000000:0000 07 00000000:00000000 00:00000000 00000000   102        0 15000 2 0000000000000000 0\n\
         1: 00000000:2382 00000000:0000 07 00000000:00000000 00:00000000 00000000  1000        0 15001 2 0000000000000000 0\n";

    fn format_ipv4_hex(ip: Ipv4Addr) -> String {
        format!("{:08X}", u32::from(ip).swap_bytes())
    }

    #[test]
    fn ipv4_hex_parser_inverts_kernel_formatting() {
        for ip in [
            Ipv4Addr::new(0, 0, 0, 0),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(10, 0, 42, 7),
            Ipv4Addr::new(192, 168, 1, 254),
            Ipv4Addr::new(255, 255, 255, 255),
        ] {
            let hex = format_ipv4_hex(ip);
            assert_eq!(parse_ipv4_hex(&hex), Some(ip), "round-trip of {ip}");
        }
        assert_eq!(
            parse_ipv4_hex("00000000"),
            Some(Ipv4Addr::new(0, 0, 0, 0))
        );
    }

    #[test]
    fn ipv6_any_parses_to_unspecified() {
        let addr = parse_ipv6_hex("00000000000000000000000000000000").unwrap();
        assert_eq!(addr.to_string(), "::");
    }

    #[test]
    fn ipv6_loopback_parses() {
        // ::1 as the kernel writes it: last group holds 0x01000000.
        let addr = parse_ipv6_hex("00000000000000000000000001000000").unwrap();
        assert_eq!(addr, Ipv6Addr::LOCALHOST);
    }

    #[test]
    fn tcp_rows_keep_only_listen_state() {
        let mut out = Vec::new();
        parse_table(TCP_TABLE, Protocol::Tcp, false, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].host_ip, "127.0.0.1");
        assert_eq!(out[0].host_port, 3910);
        assert_eq!(out[0].inode, 21010);
        assert_eq!(out[1].host_port, 22);
    }

    #[test]
    fn udp_rows_filter_to_allow_list_by_default() {
        let mut out = Vec::new();
        parse_table(UDP_TABLE, Protocol::Udp, false, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].host_port, 53);

        out.clear();
        parse_table(UDP_TABLE, Protocol::Udp, true, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].host_port, 0x2382);
    }

    #[test]
    fn zero_port_rows_are_discarded() {
        let row = "   3: 00000000:0000 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 123 1 0000000000000000 100 0 0 10 0";
        assert!(parse_row(row, Protocol::Tcp).is_none());
    }

    #[test]
    fn detect_uses_override_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        let mut tcp = std::fs::File::create(dir.path().join("net/tcp")).unwrap();
        tcp.write_all(TCP_TABLE.as_bytes()).unwrap();

        let roots = ProcRoots::detect(Some(dir.path())).unwrap();
        assert_eq!(roots.net_dir, dir.path().join("net"));
        assert!(!roots.host_namespace);

        let listeners = enumerate_listeners(&roots, false).unwrap();
        assert!(listeners.iter().any(|l| l.host_port == 22));
    }

    #[test]
    fn enumerate_skips_missing_tables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        std::fs::write(dir.path().join("net/tcp"), TCP_TABLE).unwrap();
        // tcp6/udp/udp6 intentionally absent.
        let roots = ProcRoots::detect(Some(dir.path())).unwrap();
        let listeners = enumerate_listeners(&roots, true).unwrap();
        assert_eq!(listeners.len(), 2);
    }
}
