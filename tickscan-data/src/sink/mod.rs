//! Periodic persistence of detection activity to an external store.

use crate::{
    broadcast::connection::backoff,
    config::SinkConfig,
    error::ScanError,
    event::{DetectionEvent, Symbol},
    state::EventCounters,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, warn};
use url::Url;

/// Bounded [`Accumulator`](accumulator::Accumulator) of counters and events between flushes.
pub mod accumulator;

use accumulator::Accumulator;

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct SymbolSummary {
    pub symbol: Symbol,
    pub counters: EventCounters,
}

/// Everything accumulated since the previous successful flush.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct FlushBatch {
    pub generated_at: DateTime<Utc>,
    /// Per-symbol counters, sorted by symbol.
    pub symbols: Vec<SymbolSummary>,
    pub events: Vec<DetectionEvent>,
    /// Events dropped because the accumulator was full.
    pub overflowed: u64,
}

/// External store receiving [`FlushBatch`]es.
#[async_trait]
pub trait StorageSink: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn flush(&self, batch: &FlushBatch) -> Result<(), ScanError>;
}

/// POSTs each [`FlushBatch`] as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: Client,
    endpoint: Url,
}

impl HttpSink {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, ScanError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ScanError::Sink(error.to_string()))?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl StorageSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn flush(&self, batch: &FlushBatch) -> Result<(), ScanError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(batch)
            .send()
            .await
            .map_err(|error| ScanError::Sink(error.to_string()))?;

        response.error_for_status().map_err(|status_err| {
            ScanError::Sink(format!("{} rejected flush: {status_err}", self.endpoint))
        })?;
        Ok(())
    }
}

/// Logs a summary of each [`FlushBatch`] instead of persisting it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl StorageSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn flush(&self, batch: &FlushBatch) -> Result<(), ScanError> {
        let busiest = batch
            .symbols
            .iter()
            .max_by_key(|summary| summary.counters.events())
            .map(|summary| summary.symbol.as_str());

        info!(
            symbols = batch.symbols.len(),
            events = batch.events.len(),
            overflowed = batch.overflowed,
            busiest,
            "detection summary"
        );
        Ok(())
    }
}

/// Moves accumulated activity into a [`StorageSink`] on an interval, with a per-attempt
/// timeout and bounded retry. A batch that exhausts its attempts is restored for the next
/// cycle.
pub struct SinkFlusher {
    config: SinkConfig,
    accumulator: Arc<Accumulator>,
    sink: Arc<dyn StorageSink>,
}

impl std::fmt::Debug for SinkFlusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkFlusher")
            .field("config", &self.config)
            .field("accumulator", &self.accumulator)
            .field("sink", &self.sink.name())
            .finish()
    }
}

impl SinkFlusher {
    pub fn new(
        config: &SinkConfig,
        accumulator: Arc<Accumulator>,
        sink: Arc<dyn StorageSink>,
    ) -> Self {
        Self {
            config: config.clone(),
            accumulator,
            sink,
        }
    }

    pub fn accumulator(&self) -> &Arc<Accumulator> {
        &self.accumulator
    }

    /// Flush everything pending, returning the number of events written.
    pub async fn flush_once(&self) -> Result<usize, ScanError> {
        let Some(batch) = self.accumulator.take() else {
            return Ok(0);
        };

        match self.flush_with_retry(&batch).await {
            Ok(()) => {
                debug!(
                    sink = self.sink.name(),
                    symbols = batch.symbols.len(),
                    events = batch.events.len(),
                    "flushed detection batch"
                );
                Ok(batch.events.len())
            }
            Err(error) => {
                error!(
                    sink = self.sink.name(),
                    attempts = self.config.max_attempts,
                    %error,
                    "sink flush failed, batch restored for next cycle"
                );
                self.accumulator.restore(batch);
                Err(error)
            }
        }
    }

    async fn flush_with_retry(&self, batch: &FlushBatch) -> Result<(), ScanError> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut attempt = 1;

        loop {
            let result = tokio::time::timeout(timeout, self.sink.flush(batch))
                .await
                .unwrap_or(Err(ScanError::Timeout(self.config.timeout_ms)));

            match result {
                Ok(()) => return Ok(()),
                Err(error) if error.is_recoverable() && attempt < self.config.max_attempts => {
                    let jitter = rand::rng().random_range(0..=self.config.backoff_base_ms / 2);
                    let delay = backoff(self.config.backoff_base_ms, attempt)
                        + Duration::from_millis(jitter);
                    warn!(
                        sink = self.sink.name(),
                        attempt,
                        ?delay,
                        %error,
                        "sink flush failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Spawn the periodic flush task. Stopping it performs one final flush.
    pub fn spawn(self: Arc<Self>) -> FlusherHandle {
        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let period = Duration::from_secs(self.config.flush_interval_secs);

        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            info!(sink = self.sink.name(), ?period, "sink flusher running");

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = timer.tick() => {
                        // Failures are logged and restored by flush_once
                        let _ = self.flush_once().await;
                    }
                }
            }

            match self.flush_once().await {
                Ok(events) => info!(sink = self.sink.name(), events, "final sink flush complete"),
                Err(error) => error!(sink = self.sink.name(), %error, "final sink flush failed"),
            }
        });

        FlusherHandle {
            stop: Some(stop),
            task,
        }
    }
}

/// Handle to the task spawned by [`SinkFlusher::spawn`].
#[derive(Debug)]
pub struct FlusherHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl FlusherHandle {
    /// Stop the periodic flush and wait for the final flush to complete.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(error) = self.task.await {
            warn!(?error, "sink flusher terminated abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::EventKind, orchestrator::DetectionBatch, state::TickUpdate,
        test_utils::detection_event,
    };
    use parking_lot::Mutex;

    /// Fails the first `failures` flushes, then records every batch.
    #[derive(Default)]
    struct MemorySink {
        failures: Mutex<usize>,
        attempts: Mutex<usize>,
        flushed: Mutex<Vec<FlushBatch>>,
    }

    impl MemorySink {
        fn failing(failures: usize) -> Self {
            Self {
                failures: Mutex::new(failures),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl StorageSink for MemorySink {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn flush(&self, batch: &FlushBatch) -> Result<(), ScanError> {
            *self.attempts.lock() += 1;
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ScanError::Sink("503 Service Unavailable".to_string()));
            }
            self.flushed.lock().push(batch.clone());
            Ok(())
        }
    }

    fn record(accumulator: &Accumulator, symbol: &str, kind: EventKind) {
        accumulator.record(&DetectionBatch {
            symbol: Symbol::new(symbol),
            update: TickUpdate::default(),
            events: vec![detection_event(kind, symbol, 42.0)],
            errors: Vec::new(),
        });
    }

    fn flusher(sink: Arc<MemorySink>) -> SinkFlusher {
        SinkFlusher::new(&SinkConfig::default(), Arc::new(Accumulator::new(100)), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_once_retries_then_succeeds() {
        let sink = Arc::new(MemorySink::failing(2));
        let flusher = flusher(Arc::clone(&sink));
        record(flusher.accumulator(), "AAPL", EventKind::High);

        assert_eq!(flusher.flush_once().await, Ok(1));
        assert_eq!(*sink.attempts.lock(), 3);
        assert_eq!(sink.flushed.lock().len(), 1);
        assert!(flusher.accumulator().is_empty());

        // Nothing pending
        assert_eq!(flusher.flush_once().await, Ok(0));
        assert_eq!(*sink.attempts.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_flush_restores_batch() {
        let sink = Arc::new(MemorySink::failing(5));
        let flusher = flusher(Arc::clone(&sink));
        record(flusher.accumulator(), "AAPL", EventKind::Surge);

        assert!(flusher.flush_once().await.is_err());
        assert_eq!(*sink.attempts.lock(), 5);
        assert_eq!(flusher.accumulator().len(), 1);

        record(flusher.accumulator(), "AAPL", EventKind::Trend);
        assert_eq!(flusher.flush_once().await, Ok(2));

        let flushed = sink.flushed.lock();
        let kinds = flushed[0].events.iter().map(|event| event.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![EventKind::Surge, EventKind::Trend]);
        assert_eq!(flushed[0].symbols[0].counters.ticks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_performs_final_flush() {
        let sink = Arc::new(MemorySink::default());
        let flusher = Arc::new(flusher(Arc::clone(&sink)));
        record(flusher.accumulator(), "MSFT", EventKind::Low);

        let handle = Arc::clone(&flusher).spawn();
        handle.shutdown().await;

        assert_eq!(sink.flushed.lock().len(), 1);
        assert!(flusher.accumulator().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_periodically() {
        let sink = Arc::new(MemorySink::default());
        let flusher = Arc::new(flusher(Arc::clone(&sink)));
        let handle = Arc::clone(&flusher).spawn();

        record(flusher.accumulator(), "NVDA", EventKind::High);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(sink.flushed.lock().len(), 1);

        handle.shutdown().await;
        // Nothing new to flush on shutdown
        assert_eq!(sink.flushed.lock().len(), 1);
    }
}
