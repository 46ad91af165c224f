use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport protocol of a listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// Parses the `tcp`/`udp` suffix of engine port keys such as `80/tcp`.
    pub fn parse(value: &str) -> Option<Protocol> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authoritative producer of a record after reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Container,
    System,
    Platform,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Source::Container => "container",
            Source::System => "system",
            Source::Platform => "platform",
        };
        f.write_str(value)
    }
}

/// Canonical output entity: one listening endpoint with resolved ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRecord {
    pub source: Source,
    pub protocol: Protocol,
    pub host_ip: String,
    pub host_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub internal: bool,
}

/// Raw socket-enumerator row, before and after owner resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub protocol: Protocol,
    pub host_ip: String,
    pub host_port: u16,
    pub inode: u64,
    pub pid: Option<i32>,
    pub owner: Option<String>,
}

/// A published container port: host side plus the container-internal port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundPort {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_ip: String,
    pub host_port: u16,
}

/// Normalized view of one container, merged from list and inspect results.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ContainerInfo {
    /// Full 64-char id; truncate to 12 for display only.
    pub id: String,
    /// Display name: leading slashes stripped, multi-name lists comma-joined.
    pub name: String,
    pub names: Vec<String>,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub port_bindings: Vec<BoundPort>,
    pub exposed_ports: Vec<(u16, Protocol)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
}

impl ContainerInfo {
    pub fn short_id(&self) -> String {
        self.id.chars().take(12).collect()
    }

    pub fn is_host_networked(&self) -> bool {
        self.network_mode.as_deref() == Some("host")
    }
}

/// Identifies the container a pid was attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
}

/// Basic host facts for the report header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SystemInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_available_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
}

/// Port tuple reported by the platform control plane for a native app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppPort {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

/// A platform-native application (e.g. a TrueNAS SCALE app).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformApp {
    pub id: String,
    pub name: String,
    pub state: String,
    pub ports: Vec<AppPort>,
}

/// A virtual machine reported by the platform control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: String,
    pub name: String,
    pub state: String,
}

/// Final collection document emitted by one `collect` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Id of the collector that produced the report.
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_info: Option<SystemInfo>,
    pub applications: Vec<PlatformApp>,
    pub ports: Vec<PortRecord>,
    pub vms: Vec<VmInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub enhanced_features_enabled: bool,
    pub generated_at: String,
}

impl Report {
    pub fn empty(platform: &str, generated_at: String) -> Self {
        Report {
            platform: platform.to_string(),
            platform_name: None,
            system_info: None,
            applications: Vec::new(),
            ports: Vec::new(),
            vms: Vec::new(),
            error: None,
            enhanced_features_enabled: false,
            generated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parses_engine_suffix() {
        assert_eq!(Protocol::parse("tcp"), Some(Protocol::Tcp));
        assert_eq!(Protocol::parse("UDP"), Some(Protocol::Udp));
        assert_eq!(Protocol::parse("sctp"), None);
    }

    #[test]
    fn short_id_truncates_to_twelve() {
        let container = ContainerInfo {
            id: "0123456789abcdef0123456789abcdef".to_string(),
            ..Default::default()
        };
        assert_eq!(container.short_id(), "0123456789ab");
    }

    #[test]
    fn port_record_serializes_lowercase_enums() {
        let record = PortRecord {
            source: Source::Container,
            protocol: Protocol::Udp,
            host_ip: "0.0.0.0".to_string(),
            host_port: 53,
            target: Some("53".to_string()),
            owner: "dns".to_string(),
            container_id: Some("abc123def456".to_string()),
            app_id: Some("abc123def456".to_string()),
            pid: None,
            created: None,
            internal: false,
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["source"], "container");
        assert_eq!(json["protocol"], "udp");
        assert!(json.get("pid").is_none());
    }
}
