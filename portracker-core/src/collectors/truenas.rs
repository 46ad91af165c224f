//! Collector for TrueNAS SCALE hosts. On top of the engine and kernel
//! sources it runs the middleware RPC phase for native apps, VMs, and
//! richer system info.

use crate::orchestrate::{CollectorPlan, orchestrate};
use portracker_sdk::{
    CollectError, CollectionContext, Collector, CollectorMetadata, Report, register_collector,
};
use std::path::Path;

/// Middleware socket directory present on SCALE installs.
const MIDDLEWARE_DIR: &str = "/run/middleware";

pub struct TrueNasCollector;

impl Collector for TrueNasCollector {
    fn metadata(&self) -> CollectorMetadata {
        CollectorMetadata {
            id: "truenas",
            title: "TrueNAS SCALE",
            description: "Middleware apps and VMs on top of the container host view",
            rank: 0,
        }
    }

    /// Cumulative signals, capped at 100: kernel release substring,
    /// os-release content, middleware socket directory, credential.
    fn compatibility(&self, ctx: &CollectionContext) -> u8 {
        let fingerprint = mod_hostinfo::fingerprint();
        let mut score = 0u8;
        if fingerprint.kernel_contains("truenas") {
            score += 25;
        }
        if fingerprint.os_release_contains("truenas") {
            score += 25;
        }
        if Path::new(MIDDLEWARE_DIR).is_dir() {
            score += 25;
        }
        if ctx.platform_enabled() {
            score += 25;
        }
        score.min(100)
    }

    fn collect(&self, ctx: &CollectionContext) -> Result<Report, CollectError> {
        crate::runtime().block_on(orchestrate(
            ctx,
            CollectorPlan {
                id: "truenas",
                use_docker: true,
                use_platform: true,
            },
        ))
    }
}

fn create_collector() -> Box<dyn Collector> {
    Box::new(TrueNasCollector)
}

register_collector!(create_collector);
