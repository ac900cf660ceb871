use super::{EventTransport, limiter::TokenBucket};
use crate::{
    config::BroadcastConfig, error::ScanError, event::DetectionEvent, subscription::SubscriberId,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Why a connection worker stopped.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Disconnected by the broadcaster or the connection owner.
    Requested,
    /// The connection's outbox overflowed because it could not keep up.
    Backlog,
    /// Every sender of the outbox was dropped.
    OutboxClosed,
    /// Too many consecutive batch writes failed.
    WriteFailures(ScanError),
}

/// Live counters of a single connection, shared between its worker and the broadcaster.
#[derive(Debug, Default)]
pub struct ConnectionState {
    delivered: AtomicU64,
    batches: AtomicU64,
    failed_batches: AtomicU64,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
}

impl ConnectionState {
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, subscriber: SubscriberId, queued: usize) -> ConnectionStatus {
        ConnectionStatus {
            subscriber,
            queued,
            delivered: self.delivered.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
        }
    }

    fn record_success(&self, events: usize) -> bool {
        self.delivered.fetch_add(events as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.degraded.swap(false, Ordering::Relaxed)
    }

    fn record_failure(&self) -> u32 {
        self.failed_batches.fetch_add(1, Ordering::Relaxed);
        self.degraded.store(true, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Point-in-time view of a connection.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct ConnectionStatus {
    pub subscriber: SubscriberId,
    /// Events waiting in the outbox.
    pub queued: usize,
    pub delivered: u64,
    pub batches: u64,
    pub failed_batches: u64,
    pub consecutive_failures: u32,
    pub degraded: bool,
}

/// Drain `outbox` into batched writes on `transport` until cancelled, closed, or failed.
///
/// A batch is opened by the first event received and closed once the batch window elapses or
/// it reaches the maximum batch size. Cancellation drops any events still pending.
pub(super) async fn run(
    subscriber: SubscriberId,
    transport: Arc<dyn EventTransport>,
    mut outbox: mpsc::Receiver<Arc<DetectionEvent>>,
    mut cancel: oneshot::Receiver<DisconnectReason>,
    config: BroadcastConfig,
    state: Arc<ConnectionState>,
) -> DisconnectReason {
    let window = Duration::from_millis(config.batch_window_ms);
    let mut limiter = TokenBucket::new(config.max_batches_per_sec);
    let mut batch = Vec::with_capacity(config.max_batch_size);

    debug!(%subscriber, "connection worker running");

    loop {
        let first = tokio::select! {
            biased;
            reason = &mut cancel => return reason.unwrap_or(DisconnectReason::Requested),
            event = outbox.recv() => match event {
                Some(event) => event,
                None => return DisconnectReason::OutboxClosed,
            },
        };
        batch.push(first);

        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        while batch.len() < config.max_batch_size {
            tokio::select! {
                biased;
                reason = &mut cancel => return reason.unwrap_or(DisconnectReason::Requested),
                _ = &mut deadline => break,
                event = outbox.recv() => match event {
                    Some(event) => batch.push(event),
                    None => break,
                },
            }
        }

        tokio::select! {
            biased;
            reason = &mut cancel => return reason.unwrap_or(DisconnectReason::Requested),
            _ = limiter.acquire() => {}
        }

        match write_batch(transport.as_ref(), &batch, &config).await {
            Ok(()) => {
                if state.record_success(batch.len()) {
                    info!(%subscriber, "connection recovered");
                }
            }
            Err(error) => {
                let failures = state.record_failure();
                if failures >= config.max_consecutive_failures {
                    warn!(%subscriber, failures, %error, "connection failed too often");
                    return DisconnectReason::WriteFailures(error);
                }
                warn!(
                    %subscriber,
                    failures,
                    dropped = batch.len(),
                    %error,
                    "connection degraded"
                );
            }
        }
        batch.clear();
    }
}

/// Write one batch with a per-attempt timeout, retrying recoverable errors with exponential
/// backoff.
async fn write_batch(
    transport: &dyn EventTransport,
    batch: &[Arc<DetectionEvent>],
    config: &BroadcastConfig,
) -> Result<(), ScanError> {
    let timeout = Duration::from_millis(config.write_timeout_ms);
    let mut attempt = 1;

    loop {
        let result = tokio::time::timeout(timeout, transport.send(batch))
            .await
            .unwrap_or(Err(ScanError::Timeout(config.write_timeout_ms)));

        match result {
            Ok(()) => return Ok(()),
            Err(error) if error.is_recoverable() && attempt < config.write_attempts => {
                let backoff = backoff(config.retry_backoff_ms, attempt);
                debug!(attempt, ?backoff, %error, "retrying batch write");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// `base_ms * 2^(attempt - 1)`, saturating.
pub(crate) fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1_u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TickKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[test]
    fn test_backoff() {
        struct TestCase {
            input: (u64, u32),
            expected: Duration,
        }

        let tests = vec![
            TestCase {
                // TC0: first retry waits the base delay
                input: (50, 1),
                expected: Duration::from_millis(50),
            },
            TestCase {
                // TC1: doubles per attempt
                input: (50, 3),
                expected: Duration::from_millis(200),
            },
            TestCase {
                // TC2: sink base delay, fifth attempt
                input: (250, 5),
                expected: Duration::from_millis(4_000),
            },
            TestCase {
                // TC3: saturates rather than overflowing
                input: (250, 80),
                expected: Duration::from_millis(u64::MAX),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = backoff(test.input.0, test.input.1);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    /// Fails the first `failures` sends, then records every batch.
    struct FlakyTransport {
        failures: Mutex<usize>,
        error: ScanError,
        calls: Mutex<usize>,
    }

    impl FlakyTransport {
        fn new(failures: usize, error: ScanError) -> Self {
            Self {
                failures: Mutex::new(failures),
                error,
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl EventTransport for FlakyTransport {
        async fn send(&self, _: &[Arc<DetectionEvent>]) -> Result<(), ScanError> {
            *self.calls.lock() += 1;
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(self.error.clone());
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_batch_retries_recoverable_errors() {
        let config = BroadcastConfig::default();

        // Two failures then success fits within three attempts
        let transport = FlakyTransport::new(2, ScanError::Transport("reset".to_string()));
        assert_eq!(write_batch(&transport, &[], &config).await, Ok(()));
        assert_eq!(*transport.calls.lock(), 3);

        // Three failures exhaust the attempts
        let transport = FlakyTransport::new(3, ScanError::Transport("reset".to_string()));
        assert_eq!(
            write_batch(&transport, &[], &config).await,
            Err(ScanError::Transport("reset".to_string()))
        );
        assert_eq!(*transport.calls.lock(), 3);

        // Non-recoverable errors are not retried
        let transport = FlakyTransport::new(1, ScanError::ChannelClosed(TickKind::Trade));
        assert!(write_batch(&transport, &[], &config).await.is_err());
        assert_eq!(*transport.calls.lock(), 1);
    }

    struct StalledTransport;

    #[async_trait]
    impl EventTransport for StalledTransport {
        async fn send(&self, _: &[Arc<DetectionEvent>]) -> Result<(), ScanError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_batch_times_out() {
        let config = BroadcastConfig::default();
        let actual = write_batch(&StalledTransport, &[], &config).await;
        assert_eq!(actual, Err(ScanError::Timeout(config.write_timeout_ms)));
    }

    #[test]
    fn test_connection_state_degrades_and_recovers() {
        let state = ConnectionState::default();
        assert_eq!(state.record_failure(), 1);
        assert_eq!(state.record_failure(), 2);
        assert!(state.is_degraded());

        assert!(state.record_success(4));
        assert!(!state.is_degraded());

        let status = state.snapshot(SubscriberId(9), 3);
        assert_eq!(status.delivered, 4);
        assert_eq!(status.batches, 1);
        assert_eq!(status.failed_batches, 2);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.queued, 3);
    }
}
