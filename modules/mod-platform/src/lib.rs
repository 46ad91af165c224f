//! Optional platform control-plane source.
//!
//! Talks JSON-RPC 2.0 over HTTP to the platform middleware (TrueNAS SCALE
//! style), authenticated with a bearer key. The whole phase runs under one
//! hard deadline owned by the orchestrator; a total failure only costs the
//! enhanced report fields.

use anyhow::{Context as _, Result, bail};
use log::warn;
use portracker_sdk::{AppPort, PlatformApp, Protocol, VmInfo};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Hard deadline for the whole platform phase.
pub const PLATFORM_PHASE_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_BASE_URL: &str = "http://127.0.0.1/api/jsonrpc";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the platform phase contributes to a report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlatformData {
    pub product: Option<String>,
    pub version: Option<String>,
    pub hostname: Option<String>,
    pub apps: Vec<PlatformApp>,
    pub vms: Vec<VmInfo>,
}

/// One client per collection; dropped when the phase ends so a dead RPC
/// socket can never leak into the next refresh.
pub struct PlatformClient {
    http: Client,
    base_url: String,
    api_key: String,
    next_id: AtomicU64,
}

impl PlatformClient {
    pub fn new(base_url: Option<&str>, api_key: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building platform RPC client")?;
        Ok(PlatformClient {
            http,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).to_string(),
            api_key: api_key.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let payload: Value = self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("calling {method}"))?
            .error_for_status()
            .with_context(|| format!("{method} rejected"))?
            .json()
            .await
            .with_context(|| format!("decoding {method} response"))?;

        if let Some(error) = payload.get("error") {
            bail!("{method} returned an error: {error}");
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Queries system info, native apps, and VMs. `system.info` doubles as
    /// the availability probe; the app and VM queries degrade individually.
    pub async fn collect(&self) -> Result<PlatformData> {
        let system = self.call("system.info", json!([])).await?;
        let mut data = parse_system_info(&system);

        match self.call("app.query", json!([])).await {
            Ok(result) => data.apps = parse_apps(&result),
            Err(err) => warn!("app query failed: {err:#}"),
        }
        match self.call("virt.instance.query", json!([])).await {
            Ok(result) => data.vms = parse_vms(&result),
            Err(err) => warn!("vm query failed: {err:#}"),
        }
        Ok(data)
    }
}

fn parse_system_info(result: &Value) -> PlatformData {
    PlatformData {
        product: result
            .get("system_product")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        version: result
            .get("version")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        hostname: result
            .get("hostname")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        apps: Vec::new(),
        vms: Vec::new(),
    }
}

#[derive(Debug, Deserialize)]
struct RawApp {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    active_workloads: RawWorkloads,
}

#[derive(Debug, Default, Deserialize)]
struct RawWorkloads {
    #[serde(default)]
    used_ports: Vec<RawUsedPort>,
}

#[derive(Debug, Deserialize)]
struct RawUsedPort {
    #[serde(default)]
    container_port: Option<u16>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    host_ports: Vec<RawHostPort>,
}

#[derive(Debug, Deserialize)]
struct RawHostPort {
    #[serde(default)]
    host_port: Option<u16>,
    #[serde(default)]
    host_ip: Option<String>,
}

fn parse_apps(result: &Value) -> Vec<PlatformApp> {
    let Some(items) = result.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let raw: RawApp = serde_json::from_value(item.clone()).ok()?;
            if raw.name.is_empty() {
                return None;
            }
            let mut ports = Vec::new();
            for used in &raw.active_workloads.used_ports {
                let Some(container_port) = used.container_port else {
                    continue;
                };
                let Some(protocol) = used.protocol.as_deref().and_then(Protocol::parse) else {
                    continue;
                };
                for host in &used.host_ports {
                    let Some(host_port) = host.host_port.filter(|p| *p > 0) else {
                        continue;
                    };
                    ports.push(AppPort {
                        // A missing host ip means "all interfaces"; it stays
                        // unset here and normalizes to 0.0.0.0 downstream.
                        host_ip: host.host_ip.clone().filter(|ip| !ip.is_empty()),
                        host_port,
                        container_port,
                        protocol,
                    });
                }
            }
            Some(PlatformApp {
                id: value_to_id(raw.id.as_ref()).unwrap_or_else(|| raw.name.clone()),
                name: raw.name,
                state: raw.state,
                ports,
            })
        })
        .collect()
}

fn parse_vms(result: &Value) -> Vec<VmInfo> {
    let Some(items) = result.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = item.get("name").and_then(Value::as_str)?;
            let state = item
                .get("status")
                .or_else(|| item.get("state"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            Some(VmInfo {
                id: value_to_id(item.get("id")).unwrap_or_else(|| name.to_string()),
                name: name.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

fn value_to_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
