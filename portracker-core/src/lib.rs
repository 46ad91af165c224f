//! Collection core: collector selection, the concurrent orchestrator, and
//! the reconciliation engine behind a single [`collect_report`] entry point.

use log::info;
use once_cell::sync::Lazy;
use tokio::runtime::Runtime;

mod collectors;
mod orchestrate;
pub mod reconcile;
pub mod schema;
mod selector;

pub use portracker_sdk::{
    CollectError, CollectionContext, Collector, PortRecord, Protocol, Report, Source, SystemInfo,
};
pub use selector::detect;

pub use collectors::SystemCollector;
pub use collectors::docker::DockerCollector;
pub use collectors::truenas::TrueNasCollector;

/// One shared multi-thread runtime; collectors are synchronous from the
/// caller's perspective and fan out internally.
static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("building the collection runtime")
});

pub(crate) fn runtime() -> &'static Runtime {
    &RUNTIME
}

/// Runs one refresh with the most specific collector for this host.
///
/// The report is structurally valid even when individual sources degrade;
/// only a collection where every source failed returns an error, and that
/// error still carries the partial report.
pub fn collect_report(ctx: &CollectionContext) -> Result<Report, CollectError> {
    let collector = selector::detect(ctx);
    let metadata = collector.metadata();
    info!("collecting with the {} collector", metadata.id);
    collector.collect(ctx)
}
