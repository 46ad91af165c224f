use crate::types::Report;
use thiserror::Error;

/// Errors crossing the `collect` boundary.
///
/// Everything milder than these degrades in place: per-item failures are
/// logged and the item keeps empty metadata, unattributable pids stay
/// `source=system`, and a platform timeout only clears the enhanced flag.
#[derive(Debug, Error)]
pub enum CollectError {
    /// A mandatory source could not be reached at all (engine unreachable,
    /// no readable proc tables).
    #[error("{source_id} unavailable: {message}")]
    SourceUnavailable {
        source_id: &'static str,
        message: String,
    },

    /// Every source failed catastrophically. The partial report is still
    /// structurally valid and should be surfaced alongside the error.
    #[error("no source produced any port records")]
    Fatal { report: Box<Report> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CollectError {
    /// The partial report carried by a fatal error, if any.
    pub fn into_partial_report(self) -> Option<Report> {
        match self {
            CollectError::Fatal { report } => Some(*report),
            _ => None,
        }
    }
}
