//! The central merge engine.
//!
//! Consumes the engine-sourced port records, the resolved kernel listeners,
//! and the pid attribution maps, and collapses them into one canonical list.
//! Published ports are deduplicated on `(protocol, host_ip, host_port)` and
//! unpublished internal ports on `(container_id, host_port, protocol)`.
//! A container's claim on an endpoint always outranks the bare system view
//! of the same socket.

use mod_sockets::is_known_udp_port;
use once_cell::sync::Lazy;
use portracker_sdk::{ContainerRef, Listener, PlatformApp, PortRecord, Protocol, Source};
use std::collections::HashMap;

/// Owner label for listeners whose process could not be resolved.
const UNKNOWN_OWNER: &str = "unknown";

/// A container the enrichment passes can match against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMatch {
    /// Full container id.
    pub id: String,
    pub name: String,
    pub image: String,
}

/// Everything one reconciliation pass consumes. All maps key on OS pids or
/// short container ids; values are collection-scoped.
#[derive(Debug, Default)]
pub struct ReconcileInput {
    pub docker_ports: Vec<PortRecord>,
    pub system_listeners: Vec<Listener>,
    /// PID-1 of each container.
    pub pid_to_container: HashMap<i32, ContainerRef>,
    /// Every host-visible pid of each host-networked container.
    pub host_proc_to_container: HashMap<i32, ContainerRef>,
    /// Short container id → RFC 3339 creation time.
    pub container_created: HashMap<String, String>,
    /// pid → RFC 3339 process start time.
    pub process_started: HashMap<i32, String>,
    pub containers: Vec<ContainerMatch>,
    pub self_port: Option<u16>,
    pub self_container_name: String,
    pub include_udp: bool,
}

pub fn reconcile(input: ReconcileInput) -> Vec<PortRecord> {
    let mut records: HashMap<String, PortRecord> = HashMap::new();

    // 1. Engine-sourced ports seed the map; the first claim on a key wins.
    for mut record in input.docker_ports {
        if record.created.is_none() {
            record.created = record
                .container_id
                .as_deref()
                .and_then(|id| input.container_created.get(id).cloned());
        }
        records.entry(dedup_key(&record)).or_insert(record);
    }

    // 2. Merge the kernel view. A collision with a container-owned endpoint
    // only contributes the pid; everything else re-attributes or stays
    // system-owned.
    for listener in &input.system_listeners {
        if let Some(key) = existing_key(&records, listener) {
            if let Some(existing) = records.get_mut(&key) {
                if existing.pid.is_none() {
                    existing.pid = listener.pid;
                }
            }
            continue;
        }

        let mut record = PortRecord {
            source: Source::System,
            protocol: listener.protocol,
            host_ip: listener.host_ip.clone(),
            host_port: listener.host_port,
            target: None,
            owner: listener
                .owner
                .clone()
                .unwrap_or_else(|| UNKNOWN_OWNER.to_string()),
            container_id: None,
            app_id: None,
            pid: listener.pid,
            created: None,
            internal: false,
        };

        if let Some(pid) = listener.pid {
            let attribution = input
                .pid_to_container
                .get(&pid)
                .or_else(|| input.host_proc_to_container.get(&pid));
            if let Some(owner) = attribution {
                promote(&mut record, &short_id(&owner.id), &owner.name);
            }
            record.created = input.process_started.get(&pid).cloned().or_else(|| {
                record
                    .container_id
                    .as_deref()
                    .and_then(|id| input.container_created.get(id).cloned())
            });
        }

        records.insert(dedup_key(&record), record);
    }

    // 3. The agent's own port: a bare system record on the configured listen
    // port belongs to the container the agent runs in, if one exists.
    if let Some(self_port) = input.self_port {
        let own_container = input
            .containers
            .iter()
            .find(|c| c.name == input.self_container_name);
        if let Some(own) = own_container {
            for record in records.values_mut() {
                if record.source == Source::System && record.host_port == self_port {
                    promote(record, &short_id(&own.id), &own.name);
                }
            }
        }
    }

    // 4. Known-service enrichment for system ports the pid maps missed.
    for record in records.values_mut() {
        if record.source != Source::System {
            continue;
        }
        let Some(service) = KNOWN_SERVICES.get(&record.host_port) else {
            continue;
        };
        if let Some(matched) = service.best_match(&input.containers) {
            promote(record, &short_id(&matched.id), &matched.name);
        }
    }

    // 5. Protocol filter: TCP always; UDP only when attributed, allow-listed,
    // or explicitly opted in.
    records.retain(|_, record| match record.protocol {
        Protocol::Tcp => true,
        Protocol::Udp => {
            record.source != Source::System
                || is_known_udp_port(record.host_port)
                || input.include_udp
        }
    });

    // 6. Normalization.
    for record in records.values_mut() {
        normalize(record);
    }
    records.retain(|_, record| !record.host_ip.ends_with(".255"));

    // 7. Stable order for testability.
    let mut out: Vec<PortRecord> = records.into_values().collect();
    sort_records(&mut out);
    out
}

/// Folds the platform phase's app port tuples into an already reconciled
/// list: a tuple matching an existing endpoint only contributes the app id,
/// anything else appears as a platform-sourced record.
pub fn merge_platform_ports(records: &mut Vec<PortRecord>, apps: &[PlatformApp]) {
    for app in apps {
        for port in &app.ports {
            let host_ip = match port.host_ip.as_deref() {
                None | Some("*") | Some("") => "0.0.0.0".to_string(),
                Some(ip) => ip.to_string(),
            };
            let existing = records.iter_mut().find(|r| {
                !r.internal
                    && r.protocol == port.protocol
                    && r.host_ip == host_ip
                    && r.host_port == port.host_port
            });
            match existing {
                Some(record) => {
                    if record.app_id.is_none() {
                        record.app_id = Some(app.id.clone());
                    }
                }
                None => records.push(PortRecord {
                    source: Source::Platform,
                    protocol: port.protocol,
                    host_ip,
                    host_port: port.host_port,
                    target: Some(port.container_port.to_string()),
                    owner: app.name.clone(),
                    container_id: None,
                    app_id: Some(app.id.clone()),
                    pid: None,
                    created: None,
                    internal: false,
                }),
            }
        }
    }
    sort_records(records);
}

fn sort_records(records: &mut [PortRecord]) {
    records.sort_by(|a, b| {
        (&a.host_ip, a.host_port, &a.container_id, a.protocol).cmp(&(
            &b.host_ip,
            b.host_port,
            &b.container_id,
            b.protocol,
        ))
    });
}

fn promote(record: &mut PortRecord, short_id: &str, name: &str) {
    record.source = Source::Container;
    record.container_id = Some(short_id.to_string());
    record.app_id = Some(short_id.to_string());
    record.owner = name.to_string();
    if record.target.is_none() {
        record.target = Some(record.host_port.to_string());
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

fn dedup_key(record: &PortRecord) -> String {
    if record.internal {
        format!(
            "{}:{}:{}:internal",
            record.container_id.as_deref().unwrap_or_default(),
            record.host_port,
            record.protocol
        )
    } else {
        format!(
            "{}:{}:{}",
            record.protocol, record.host_ip, record.host_port
        )
    }
}

/// Finds the key of the record a kernel listener collides with. A wildcard
/// listener matches the wildcard of either address family: the engine
/// publishes on `0.0.0.0` while the kernel may report the same proxy socket
/// under `::`.
fn existing_key(records: &HashMap<String, PortRecord>, listener: &Listener) -> Option<String> {
    let exact = format!(
        "{}:{}:{}",
        listener.protocol, listener.host_ip, listener.host_port
    );
    if records.contains_key(&exact) {
        return Some(exact);
    }
    if listener.host_ip == "::" || listener.host_ip == "0.0.0.0" {
        let twin_ip = if listener.host_ip == "::" {
            "0.0.0.0"
        } else {
            "::"
        };
        let twin = format!("{}:{}:{}", listener.protocol, twin_ip, listener.host_port);
        if records.contains_key(&twin) {
            return Some(twin);
        }
    }
    None
}

fn normalize(record: &mut PortRecord) {
    if record.host_ip == "*" {
        record.host_ip = "0.0.0.0".to_string();
    }
    if record.internal {
        if let Some(container_id) = record.container_id.as_deref() {
            record.target = Some(format!("{container_id}:{}(internal)", record.host_port));
        }
    }
}

struct ServiceHints {
    /// Substring candidates matched against container names and images.
    hints: &'static [&'static str],
    /// Names promoted outright when several containers match.
    exact: &'static [&'static str],
}

impl ServiceHints {
    /// Exactly one substring match promotes it; with several, only an exact
    /// name match breaks the tie. Ambiguity leaves the record alone.
    fn best_match<'a>(&self, containers: &'a [ContainerMatch]) -> Option<&'a ContainerMatch> {
        let matched: Vec<&ContainerMatch> = containers
            .iter()
            .filter(|c| {
                self.hints
                    .iter()
                    .any(|hint| c.name.contains(hint) || c.image.contains(hint))
            })
            .collect();
        match matched.len() {
            0 => None,
            1 => Some(matched[0]),
            _ => matched
                .into_iter()
                .find(|c| self.exact.contains(&c.name.as_str())),
        }
    }
}

/// Well-known service ports mapped to the container name/image substrings
/// that identify their usual owners.
static KNOWN_SERVICES: Lazy<HashMap<u16, ServiceHints>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(
        53,
        ServiceHints {
            hints: &["pihole", "adguard", "dnsmasq", "unbound", "bind"],
            exact: &["pihole", "adguard"],
        },
    );
    map.insert(
        123,
        ServiceHints {
            hints: &["chrony", "ntp"],
            exact: &["chrony"],
        },
    );
    map.insert(
        161,
        ServiceHints {
            hints: &["snmp"],
            exact: &[],
        },
    );
    map.insert(
        514,
        ServiceHints {
            hints: &["syslog"],
            exact: &[],
        },
    );
    for port in [500u16, 4500] {
        map.insert(
            port,
            ServiceHints {
                hints: &["strongswan", "ipsec"],
                exact: &["strongswan"],
            },
        );
    }
    for port in [1194u16, 1198] {
        map.insert(
            port,
            ServiceHints {
                hints: &["openvpn"],
                exact: &["openvpn"],
            },
        );
    }
    for port in [51820u16, 51821, 51822] {
        map.insert(
            port,
            ServiceHints {
                hints: &["wg-easy", "wireguard", "wg"],
                exact: &["wg-easy", "wireguard"],
            },
        );
    }
    map
});

#[cfg(test)]
mod tests {
    use super::*;

    fn docker_record(
        host_ip: &str,
        host_port: u16,
        container_port: u16,
        protocol: Protocol,
        name: &str,
        id: &str,
    ) -> PortRecord {
        PortRecord {
            source: Source::Container,
            protocol,
            host_ip: host_ip.to_string(),
            host_port,
            target: Some(container_port.to_string()),
            owner: name.to_string(),
            container_id: Some(short_id(id)),
            app_id: Some(short_id(id)),
            pid: None,
            created: None,
            internal: false,
        }
    }

    fn internal_record(container_port: u16, protocol: Protocol, name: &str, id: &str) -> PortRecord {
        PortRecord {
            source: Source::Container,
            protocol,
            host_ip: "0.0.0.0".to_string(),
            host_port: container_port,
            target: Some(format!("{}:{container_port}(internal)", short_id(id))),
            owner: name.to_string(),
            container_id: Some(short_id(id)),
            app_id: Some(short_id(id)),
            pid: None,
            created: None,
            internal: true,
        }
    }

    fn listener(
        protocol: Protocol,
        host_ip: &str,
        host_port: u16,
        pid: Option<i32>,
        owner: Option<&str>,
    ) -> Listener {
        Listener {
            protocol,
            host_ip: host_ip.to_string(),
            host_port,
            inode: u64::from(host_port) + 10_000,
            pid,
            owner: owner.map(ToOwned::to_owned),
        }
    }

    fn full_id(seed: char) -> String {
        std::iter::repeat(seed).take(64).collect()
    }

    #[test]
    fn published_port_keeps_container_ownership_and_gains_pid() {
        let web_id = full_id('a');
        let input = ReconcileInput {
            docker_ports: vec![docker_record("0.0.0.0", 8080, 80, Protocol::Tcp, "web", &web_id)],
            system_listeners: vec![listener(
                Protocol::Tcp,
                "0.0.0.0",
                8080,
                Some(1234),
                Some("docker-proxy"),
            )],
            pid_to_container: HashMap::from([(
                1234,
                ContainerRef {
                    id: web_id.clone(),
                    name: "web".to_string(),
                },
            )]),
            container_created: HashMap::from([(
                short_id(&web_id),
                "2024-05-01T00:00:00+00:00".to_string(),
            )]),
            ..Default::default()
        };

        let records = reconcile(input);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.source, Source::Container);
        assert_eq!(record.host_port, 8080);
        assert_eq!(record.target.as_deref(), Some("80"));
        assert_eq!(record.owner, "web");
        assert_eq!(record.container_id.as_deref(), Some("aaaaaaaaaaaa"));
        assert_eq!(record.pid, Some(1234));
        assert_eq!(record.created.as_deref(), Some("2024-05-01T00:00:00+00:00"));
    }

    #[test]
    fn unpublished_exposed_port_stays_internal() {
        let db_id = full_id('b');
        let input = ReconcileInput {
            docker_ports: vec![internal_record(5432, Protocol::Tcp, "db", &db_id)],
            ..Default::default()
        };

        let records = reconcile(input);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.internal);
        assert_eq!(record.host_port, 5432);
        assert_eq!(record.owner, "db");
        assert_eq!(
            record.target.as_deref(),
            Some("bbbbbbbbbbbb:5432(internal)")
        );
    }

    #[test]
    fn host_networked_container_is_attributed_through_pid_map() {
        let dns_id = full_id('c');
        let input = ReconcileInput {
            system_listeners: vec![listener(
                Protocol::Udp,
                "0.0.0.0",
                53,
                Some(9000),
                Some("dnsmasq"),
            )],
            host_proc_to_container: HashMap::from([(
                9000,
                ContainerRef {
                    id: dns_id,
                    name: "dns".to_string(),
                },
            )]),
            ..Default::default()
        };

        let records = reconcile(input);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.source, Source::Container);
        assert_eq!(record.owner, "dns");
        assert_eq!(record.protocol, Protocol::Udp);
        assert_eq!(record.host_port, 53);
        assert_eq!(record.pid, Some(9000));
    }

    #[test]
    fn bare_metal_daemon_stays_system_with_start_time() {
        let input = ReconcileInput {
            system_listeners: vec![listener(
                Protocol::Tcp,
                "0.0.0.0",
                22,
                Some(500),
                Some("sshd"),
            )],
            process_started: HashMap::from([(500, "2024-04-01T08:00:00+00:00".to_string())]),
            ..Default::default()
        };

        let records = reconcile(input);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.source, Source::System);
        assert_eq!(record.owner, "sshd");
        assert_eq!(record.pid, Some(500));
        assert_eq!(record.created.as_deref(), Some("2024-04-01T08:00:00+00:00"));
        assert!(record.container_id.is_none());
    }

    #[test]
    fn known_service_port_fuzzy_matches_container() {
        let wg_id = full_id('d');
        let input = ReconcileInput {
            system_listeners: vec![listener(Protocol::Udp, "0.0.0.0", 51820, None, None)],
            containers: vec![ContainerMatch {
                id: wg_id,
                name: "wg-easy".to_string(),
                image: "ghcr.io/wg-easy/wg-easy:latest".to_string(),
            }],
            ..Default::default()
        };

        let records = reconcile(input);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.source, Source::Container);
        assert_eq!(record.owner, "wg-easy");
        assert_eq!(record.protocol, Protocol::Udp);
        assert_eq!(record.host_port, 51820);
    }

    #[test]
    fn ambiguous_fuzzy_match_prefers_exact_names() {
        let input = ReconcileInput {
            system_listeners: vec![listener(Protocol::Udp, "0.0.0.0", 51820, None, None)],
            containers: vec![
                ContainerMatch {
                    id: full_id('e'),
                    name: "wg-dashboard".to_string(),
                    image: "wireguard-ui".to_string(),
                },
                ContainerMatch {
                    id: full_id('f'),
                    name: "wireguard".to_string(),
                    image: "linuxserver/wireguard".to_string(),
                },
            ],
            ..Default::default()
        };

        let records = reconcile(input);
        assert_eq!(records[0].owner, "wireguard");
        assert_eq!(records[0].container_id.as_deref(), Some("ffffffffffff"));
    }

    #[test]
    fn self_port_is_attributed_to_the_agent_container() {
        let own_id = full_id('1');
        let input = ReconcileInput {
            system_listeners: vec![listener(
                Protocol::Tcp,
                "0.0.0.0",
                4999,
                Some(77),
                Some("portracker"),
            )],
            containers: vec![ContainerMatch {
                id: own_id,
                name: "portracker".to_string(),
                image: "portracker:latest".to_string(),
            }],
            self_port: Some(4999),
            self_container_name: "portracker".to_string(),
            ..Default::default()
        };

        let records = reconcile(input);
        assert_eq!(records[0].source, Source::Container);
        assert_eq!(records[0].container_id.as_deref(), Some("111111111111"));
    }

    #[test]
    fn udp_filter_keeps_allow_list_and_container_ports_only() {
        let game_id = full_id('2');
        let input = ReconcileInput {
            docker_ports: vec![docker_record(
                "0.0.0.0",
                27015,
                27015,
                Protocol::Udp,
                "game",
                &game_id,
            )],
            system_listeners: vec![
                listener(Protocol::Udp, "0.0.0.0", 123, Some(10), Some("chronyd")),
                listener(Protocol::Udp, "0.0.0.0", 40000, Some(11), Some("mystery")),
            ],
            ..Default::default()
        };

        let records = reconcile(input);
        let udp_ports: Vec<u16> = records.iter().map(|r| r.host_port).collect();
        assert!(udp_ports.contains(&27015), "container UDP survives");
        assert!(udp_ports.contains(&123), "allow-listed UDP survives");
        assert!(!udp_ports.contains(&40000), "generic UDP is dropped");
    }

    #[test]
    fn include_udp_keeps_generic_system_udp() {
        let input = ReconcileInput {
            system_listeners: vec![listener(
                Protocol::Udp,
                "0.0.0.0",
                40000,
                Some(11),
                Some("mystery"),
            )],
            include_udp: true,
            ..Default::default()
        };
        assert_eq!(reconcile(input).len(), 1);
    }

    #[test]
    fn wildcard_and_broadcast_addresses_normalize() {
        let app_id = full_id('3');
        let mut starred = docker_record("0.0.0.0", 9000, 80, Protocol::Tcp, "app", &app_id);
        starred.host_ip = "*".to_string();
        let input = ReconcileInput {
            docker_ports: vec![starred],
            system_listeners: vec![listener(
                Protocol::Tcp,
                "192.168.1.255",
                8000,
                Some(5),
                Some("cups"),
            )],
            ..Default::default()
        };

        let records = reconcile(input);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].host_ip, "0.0.0.0");
        assert_eq!(records[0].host_port, 9000);
    }

    #[test]
    fn ipv6_wildcard_listener_merges_into_ipv4_binding() {
        let web_id = full_id('4');
        let input = ReconcileInput {
            docker_ports: vec![docker_record("0.0.0.0", 8080, 80, Protocol::Tcp, "web", &web_id)],
            system_listeners: vec![listener(
                Protocol::Tcp,
                "::",
                8080,
                Some(600),
                Some("docker-proxy"),
            )],
            ..Default::default()
        };

        let records = reconcile(input);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, Some(600));
        assert_eq!(records[0].owner, "web");
    }

    #[test]
    fn same_port_different_protocols_both_survive() {
        let dns_id = full_id('5');
        let input = ReconcileInput {
            docker_ports: vec![
                docker_record("0.0.0.0", 53, 53, Protocol::Tcp, "dns", &dns_id),
                docker_record("0.0.0.0", 53, 53, Protocol::Udp, "dns", &dns_id),
            ],
            ..Default::default()
        };
        assert_eq!(reconcile(input).len(), 2);
    }

    #[test]
    fn non_internal_records_are_unique_per_endpoint() {
        let a = full_id('6');
        let b = full_id('7');
        let input = ReconcileInput {
            docker_ports: vec![
                docker_record("0.0.0.0", 8080, 80, Protocol::Tcp, "first", &a),
                docker_record("0.0.0.0", 8080, 81, Protocol::Tcp, "second", &b),
            ],
            system_listeners: vec![listener(Protocol::Tcp, "0.0.0.0", 8080, Some(1), None)],
            ..Default::default()
        };

        let records = reconcile(input);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].owner, "first", "first claim wins");

        let mut seen = std::collections::HashSet::new();
        for record in records.iter().filter(|r| !r.internal) {
            assert!(seen.insert((
                record.host_ip.clone(),
                record.host_port,
                record.protocol
            )));
        }
    }

    #[test]
    fn output_order_is_stable_across_runs() {
        let make_input = || ReconcileInput {
            system_listeners: vec![
                listener(Protocol::Tcp, "127.0.0.1", 9090, Some(2), Some("b")),
                listener(Protocol::Tcp, "0.0.0.0", 22, Some(1), Some("a")),
                listener(Protocol::Udp, "0.0.0.0", 53, Some(3), Some("c")),
            ],
            ..Default::default()
        };
        let first = reconcile(make_input());
        let second = reconcile(make_input());
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| {
            (&w[0].host_ip, w[0].host_port) <= (&w[1].host_ip, w[1].host_port)
        }));
    }

    #[test]
    fn platform_ports_merge_without_duplicating_endpoints() {
        let mut records = vec![PortRecord {
            source: Source::Container,
            protocol: Protocol::Tcp,
            host_ip: "0.0.0.0".to_string(),
            host_port: 32400,
            target: Some("32400".to_string()),
            owner: "plex".to_string(),
            container_id: Some("aaaaaaaaaaaa".to_string()),
            app_id: None,
            pid: None,
            created: None,
            internal: false,
        }];
        let apps = vec![PlatformApp {
            id: "plex".to_string(),
            name: "plex".to_string(),
            state: "RUNNING".to_string(),
            ports: vec![
                portracker_sdk::AppPort {
                    host_ip: None,
                    host_port: 32400,
                    container_port: 32400,
                    protocol: Protocol::Tcp,
                },
                portracker_sdk::AppPort {
                    host_ip: Some("*".to_string()),
                    host_port: 32469,
                    container_port: 32469,
                    protocol: Protocol::Tcp,
                },
            ],
        }];

        merge_platform_ports(&mut records, &apps);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].app_id.as_deref(), Some("plex"));
        let added = records.iter().find(|r| r.host_port == 32469).unwrap();
        assert_eq!(added.source, Source::Platform);
        assert_eq!(added.host_ip, "0.0.0.0");
    }

    #[test]
    fn every_record_is_well_formed() {
        let mixed_id = full_id('8');
        let input = ReconcileInput {
            docker_ports: vec![
                docker_record("0.0.0.0", 443, 8443, Protocol::Tcp, "proxy", &mixed_id),
                internal_record(9001, Protocol::Tcp, "proxy", &mixed_id),
            ],
            system_listeners: vec![
                listener(Protocol::Tcp, "0.0.0.0", 22, Some(1), Some("sshd")),
                listener(Protocol::Udp, "0.0.0.0", 53, Some(2), Some("unbound")),
            ],
            ..Default::default()
        };

        for record in reconcile(input) {
            assert!(record.host_port >= 1);
            assert!(matches!(record.protocol, Protocol::Tcp | Protocol::Udp));
            assert_ne!(record.host_ip, "*");
            if record.container_id.is_some() {
                assert_eq!(record.source, Source::Container);
            }
        }
    }
}
