//! Picks the most specific collector for this host.

use crate::collectors::SystemCollector;
use log::debug;
use portracker_sdk::{CollectionContext, Collector, iter_registered_collectors};

/// Scores every registered collector and returns the winner. The highest
/// strictly positive score wins; equal scores break on the collector's
/// declared rank (platform before engine before generic). When everything
/// scores zero the generic host collector is returned anyway.
pub fn detect(ctx: &CollectionContext) -> Box<dyn Collector> {
    let mut best: Option<(u8, u8, Box<dyn Collector>)> = None;

    for entry in iter_registered_collectors() {
        let collector = (entry.constructor)();
        let metadata = collector.metadata();
        let score = collector.compatibility(ctx);
        debug!("collector {} scored {score}", metadata.id);
        if score == 0 {
            continue;
        }
        let wins = match &best {
            None => true,
            Some((best_score, best_rank, _)) => {
                score > *best_score || (score == *best_score && metadata.rank < *best_rank)
            }
        };
        if wins {
            best = Some((score, metadata.rank, collector));
        }
    }

    best.map(|(_, _, collector)| collector)
        .unwrap_or_else(|| Box::new(SystemCollector))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_always_returns_a_collector() {
        let collector = detect(&CollectionContext::new());
        assert!(!collector.metadata().id.is_empty());
    }
}
