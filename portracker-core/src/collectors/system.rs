//! Fallback collector for any host with a readable proc tree. No engine, no
//! platform phase; every port it reports is kernel-sourced.

use crate::orchestrate::{CollectorPlan, orchestrate};
use mod_sockets::ProcRoots;
use portracker_sdk::{
    CollectError, CollectionContext, Collector, CollectorMetadata, Report, register_collector,
};

pub struct SystemCollector;

impl Collector for SystemCollector {
    fn metadata(&self) -> CollectorMetadata {
        CollectorMetadata {
            id: "system",
            title: "Generic host",
            description: "Kernel socket tables and process attribution",
            rank: 2,
        }
    }

    fn compatibility(&self, ctx: &CollectionContext) -> u8 {
        match ProcRoots::detect(ctx.proc_root.as_deref()) {
            Ok(_) => 10,
            Err(_) => 0,
        }
    }

    fn collect(&self, ctx: &CollectionContext) -> Result<Report, CollectError> {
        crate::runtime().block_on(orchestrate(
            ctx,
            CollectorPlan {
                id: "system",
                use_docker: false,
                use_platform: false,
            },
        ))
    }
}

fn create_collector() -> Box<dyn Collector> {
    Box::new(SystemCollector)
}

register_collector!(create_collector);
