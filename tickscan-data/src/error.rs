use crate::event::{EventKind, Symbol, TickKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `tickscan-data`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum ScanError {
    #[error("malformed tick: {0}")]
    MalformedTick(String),

    #[error(
        "\
        NonMonotonicTimestamp: {symbol} tick at {timestamp} precedes the last accepted \
        tick at {last_timestamp} \
    "
    )]
    NonMonotonicTimestamp {
        symbol: Symbol,
        timestamp: DateTime<Utc>,
        last_timestamp: DateTime<Utc>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{kind} detector failed for {symbol}: {reason}")]
    Detector {
        kind: EventKind,
        symbol: Symbol,
        reason: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage sink error: {0}")]
    Sink(String),

    #[error("{0} channel closed")]
    ChannelClosed(TickKind),

    #[error("operation timed out after {0}ms")]
    Timeout(u64),
}

impl ScanError {
    /// Determine if an operation that failed with this error is worth retrying.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_recoverable(&self) -> bool {
        match self {
            ScanError::Transport(_) | ScanError::Sink(_) | ScanError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<ConfigError> for ScanError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

/// Fatal configuration errors raised while loading or validating a
/// [`ScanConfig`](crate::config::ScanConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_error_is_recoverable() {
        struct TestCase {
            input: ScanError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: transport failures are retried
                input: ScanError::Transport("connection reset".to_string()),
                expected: true,
            },
            TestCase {
                // TC1: sink failures are retried
                input: ScanError::Sink("503 Service Unavailable".to_string()),
                expected: true,
            },
            TestCase {
                // TC2: timeouts are retried
                input: ScanError::Timeout(2000),
                expected: true,
            },
            TestCase {
                // TC3: malformed ticks are never retried
                input: ScanError::MalformedTick("missing ticker".to_string()),
                expected: false,
            },
            TestCase {
                // TC4: configuration errors are fatal
                input: ScanError::from(ConfigError::invalid("router.workers", "must be > 0")),
                expected: false,
            },
            TestCase {
                // TC5: a closed channel is not recoverable
                input: ScanError::ChannelClosed(TickKind::Trade),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_recoverable();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::invalid("thresholds.buckets.boundaries", "must be ascending");
        assert_eq!(
            error.to_string(),
            "invalid thresholds.buckets.boundaries: must be ascending"
        );
    }
}
