//! Basic host facts from `/etc/os-release`, `uname`, and `/proc`.
//!
//! Everything here is best-effort: a field that cannot be read is simply
//! absent from the result.

use etc_os_release::OsRelease;
use log::debug;
use portracker_sdk::{Cache, SystemInfo};
use procfs::{Current, CpuInfo, Meminfo, Uptime};
use rustix::system::uname;
use std::time::Duration;

/// Identity signals the collector selector scores against.
#[derive(Debug, Clone, Default)]
pub struct HostFingerprint {
    pub kernel_release: String,
    pub hostname: String,
    pub os_name: Option<String>,
    pub os_pretty_name: Option<String>,
}

impl HostFingerprint {
    /// Case-insensitive match against the kernel release string.
    pub fn kernel_contains(&self, needle: &str) -> bool {
        self.kernel_release
            .to_ascii_lowercase()
            .contains(&needle.to_ascii_lowercase())
    }

    /// Case-insensitive match against the os-release name and pretty name.
    pub fn os_release_contains(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        self.os_name
            .as_deref()
            .is_some_and(|v| v.to_ascii_lowercase().contains(&needle))
            || self
                .os_pretty_name
                .as_deref()
                .is_some_and(|v| v.to_ascii_lowercase().contains(&needle))
    }
}

pub fn fingerprint() -> HostFingerprint {
    let uname = uname();
    let os_release = OsRelease::open().ok();
    HostFingerprint {
        kernel_release: uname.release().to_string_lossy().to_string(),
        hostname: uname.nodename().to_string_lossy().to_string(),
        os_name: os_release.as_ref().map(|os| os.name().to_string()),
        os_pretty_name: os_release.as_ref().map(|os| os.pretty_name().to_string()),
    }
}

/// System info for the report header: memory from the memory-info file, CPU
/// model from the CPU-info file, uptime from the uptime file. Cached under
/// the operator-configurable upper-layer TTL.
pub fn system_info(cache: &Cache, ttl_ms: u64) -> SystemInfo {
    cache
        .get_or_set("hostinfo:system", Some(Duration::from_millis(ttl_ms)), || {
            Some(read_system_info())
        })
        .map(|arc| (*arc).clone())
        .unwrap_or_default()
}

fn read_system_info() -> SystemInfo {
    let fp = fingerprint();
    let meminfo = Meminfo::current().ok();
    let uptime = Uptime::current().ok();
    let cpu_model = CpuInfo::current()
        .ok()
        .and_then(|info| info.model_name(0).map(ToOwned::to_owned));
    debug!("collected host facts for {}", fp.hostname);

    SystemInfo {
        hostname: Some(fp.hostname),
        os_name: fp.os_pretty_name,
        kernel: Some(fp.kernel_release),
        cpu_model,
        memory_total_bytes: meminfo.as_ref().map(|m| m.mem_total),
        memory_available_bytes: meminfo.as_ref().and_then(|m| m.mem_available),
        uptime_seconds: uptime.map(|u| u.uptime as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_matching_is_case_insensitive() {
        let fp = HostFingerprint {
            kernel_release: "6.6.44-production+truenas".to_string(),
            hostname: "nas".to_string(),
            os_name: Some("Debian GNU/Linux".to_string()),
            os_pretty_name: Some("TrueNAS SCALE 24.04".to_string()),
        };
        assert!(fp.kernel_contains("TrueNAS"));
        assert!(fp.os_release_contains("truenas scale"));
        assert!(!fp.os_release_contains("ubuntu"));
    }

    #[test]
    fn empty_fingerprint_matches_nothing() {
        let fp = HostFingerprint::default();
        assert!(!fp.kernel_contains("truenas"));
        assert!(!fp.os_release_contains("truenas"));
    }
}
