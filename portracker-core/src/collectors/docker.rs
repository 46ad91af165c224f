//! Collector for hosts running a reachable container engine. Adds the
//! engine source on top of the generic kernel view.

use crate::orchestrate::{CollectorPlan, orchestrate};
use portracker_sdk::{
    CollectError, CollectionContext, Collector, CollectorMetadata, Report, register_collector,
};
use std::path::Path;

const DEFAULT_SOCKETS: [&str; 2] = ["/var/run/docker.sock", "/run/docker.sock"];

pub struct DockerCollector;

impl Collector for DockerCollector {
    fn metadata(&self) -> CollectorMetadata {
        CollectorMetadata {
            id: "docker",
            title: "Container host",
            description: "Engine port bindings reconciled with the kernel view",
            rank: 1,
        }
    }

    fn compatibility(&self, ctx: &CollectionContext) -> u8 {
        let mut score = 0u8;
        if ctx.docker_endpoint.is_some() {
            score += 60;
        } else if DEFAULT_SOCKETS.iter().any(|path| Path::new(path).exists()) {
            score += 60;
        }
        score.min(100)
    }

    fn collect(&self, ctx: &CollectionContext) -> Result<Report, CollectError> {
        crate::runtime().block_on(orchestrate(
            ctx,
            CollectorPlan {
                id: "docker",
                use_docker: true,
                use_platform: false,
            },
        ))
    }
}

fn create_collector() -> Box<dyn Collector> {
    Box::new(DockerCollector)
}

register_collector!(create_collector);
