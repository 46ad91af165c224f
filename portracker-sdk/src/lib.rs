pub mod cache;
pub mod error;
pub mod types;

pub use cache::Cache;
pub use error::CollectError;
pub use types::{
    AppPort, BoundPort, ContainerInfo, ContainerRef, Listener, PlatformApp, PortRecord, Protocol,
    Report, Source, SystemInfo, VmInfo,
};

use std::path::PathBuf;

/// Collection configuration, resolved once by the caller and passed down to
/// every source. Field meanings follow the operator-facing option names.
#[derive(Debug, Clone)]
pub struct CollectionContext {
    /// First candidate for the kernel-socket tables; `/host/proc`,
    /// `/hostproc`, and `/proc` are probed after it.
    pub proc_root: Option<PathBuf>,
    /// Engine endpoint URI (`unix://`, `npipe://`, or `tcp://`); the
    /// OS-default local socket is used when unset.
    pub docker_endpoint: Option<String>,
    pub tls_verify: bool,
    pub cert_path: Option<PathBuf>,
    /// Bearer key for the platform control plane; enables the platform phase.
    pub platform_api_key: Option<String>,
    pub platform_url: Option<String>,
    /// When false, only the known-UDP allow-list is kept.
    pub include_udp: bool,
    pub cache_timeout_ms: u64,
    pub disable_cache: bool,
    /// The agent's own HTTP port, used for self-attribution.
    pub listen_port: Option<u16>,
    /// Container name the agent expects to run under when containerized.
    pub self_container_name: String,
}

impl Default for CollectionContext {
    fn default() -> Self {
        CollectionContext {
            proc_root: None,
            docker_endpoint: None,
            tls_verify: false,
            cert_path: None,
            platform_api_key: None,
            platform_url: None,
            include_udp: false,
            cache_timeout_ms: 60_000,
            disable_cache: false,
            listen_port: None,
            self_container_name: "portracker".to_string(),
        }
    }
}

impl CollectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn platform_enabled(&self) -> bool {
        self.platform_api_key
            .as_deref()
            .is_some_and(|key| !key.is_empty())
    }
}

/// Collector metadata used for selection and logging.
#[derive(Debug, Clone, Copy)]
pub struct CollectorMetadata {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    /// Tie-break for equal compatibility scores; lower wins.
    pub rank: u8,
}

/// Common interface for platform-specific collectors.
///
/// `compatibility` scores how well the collector fits the host (0 = not at
/// all, 100 = purpose-built for it); the selector picks the highest strictly
/// positive score. `collect` drives one full refresh and always produces a
/// structurally valid report, degrading per source rather than failing.
pub trait Collector: Send + Sync + 'static {
    fn metadata(&self) -> CollectorMetadata;
    fn compatibility(&self, ctx: &CollectionContext) -> u8;
    fn collect(&self, ctx: &CollectionContext) -> Result<Report, CollectError>;
}

/// Descriptor of a compile-time registry entry.
pub struct CollectorRegistration {
    pub constructor: fn() -> Box<dyn Collector>,
}

inventory::collect!(CollectorRegistration);

pub use inventory;

/// Helper macro to register a collector inside a module.
#[macro_export]
macro_rules! register_collector {
    ($ctor:expr) => {
        ::portracker_sdk::inventory::submit! {
            ::portracker_sdk::CollectorRegistration {
                constructor: $ctor,
            }
        }
    };
}

pub fn iter_registered_collectors() -> impl Iterator<Item = &'static CollectorRegistration> {
    inventory::iter::<CollectorRegistration>.into_iter()
}
