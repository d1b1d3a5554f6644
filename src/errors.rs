//! Error taxonomy for the ingestion core.
//!
//! Each variant maps to a distinct recovery policy: validation failures are
//! fatal for the offending operation, duplicates are dropped silently,
//! gaps are recorded and recovered later, venue and sidecar failures retry
//! with backoff, and timeouts surface to the caller without mutating state.

use thiserror::Error;

/// A single violated candle invariant, reported by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRule(pub String);

impl std::fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// Candle failed invariant checks; lists every violated rule.
    #[error("candle validation failed: {}", .rules.iter().map(|r| r.0.as_str()).collect::<Vec<_>>().join("; "))]
    Validation { rules: Vec<ValidationRule> },

    /// Trade id at or below the deduplication floor.
    #[error("duplicate trade {symbol} id={trade_id} (floor={floor})")]
    DuplicateTrade {
        symbol: String,
        trade_id: u64,
        floor: u64,
    },

    /// Trade ids skipped; interval recorded for later recovery.
    #[error("trade id gap on {symbol}: ({after}, {before})")]
    GapDetected {
        symbol: String,
        after: u64,
        before: u64,
    },

    /// Transient venue failure (network, 5xx, 429). Retry with backoff.
    #[error("venue transient error: {0}")]
    VenueTransient(String),

    /// Sidecar socket unreachable; dirty state buffers in memory.
    #[error("sidecar unavailable: {0}")]
    SidecarUnavailable(String),

    /// Worker task exited abnormally.
    #[error("worker {worker_id} crashed: {detail}")]
    WorkerCrash { worker_id: usize, detail: String },

    /// A start operation could not be completed; caller may retry.
    #[error("startup failure: {0}")]
    StartupFailure(String),

    /// An RPC deadline elapsed. State was not mutated.
    #[error("timeout after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    #[error("storage error: {0}")]
    Storage(String),
}

impl IngestError {
    pub fn validation(rules: Vec<String>) -> Self {
        Self::Validation {
            rules: rules.into_iter().map(ValidationRule).collect(),
        }
    }

    pub fn timeout(operation: impl Into<String>, millis: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            millis,
        }
    }

    /// True for kinds that callers retry in place.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::VenueTransient(_) | Self::SidecarUnavailable(_) | Self::Timeout { .. }
        )
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_lists_every_rule() {
        let err = IngestError::validation(vec![
            "low > open".to_string(),
            "volume identity violated".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("low > open"));
        assert!(msg.contains("volume identity violated"));
    }

    #[test]
    fn transient_classification() {
        assert!(IngestError::VenueTransient("503".into()).is_transient());
        assert!(IngestError::timeout("worker rpc", 30_000).is_transient());
        assert!(!IngestError::validation(vec!["x".into()]).is_transient());
    }

    #[test]
    fn stream_error_tags() {
        let dup = IngestError::DuplicateTrade {
            symbol: "BTCUSDT".to_string(),
            trade_id: 5,
            floor: 7,
        };
        assert!(dup.to_string().contains("id=5"));
        assert!(!dup.is_transient());

        let gap = IngestError::GapDetected {
            symbol: "BTCUSDT".to_string(),
            after: 10,
            before: 13,
        };
        assert!(gap.to_string().contains("(10, 13)"));
    }
}
