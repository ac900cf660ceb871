use crate::{
    broadcast::{BroadcastStats, Broadcaster, DispatchHandle},
    config::ScanConfig,
    egress::EgressBus,
    error::ScanError,
    event::Tick,
    orchestrator::EventOrchestrator,
    router::{ChannelRouter, RouteOutcome, TickHandler, metrics::ChannelHealth},
    sink::{FlusherHandle, SinkFlusher, StorageSink, accumulator::Accumulator},
    state::SymbolStateStore,
    subscription::SubscriptionIndex,
    threshold::ExchangeClock,
    wire::RawTickMessage,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::{debug, info};

/// [`TickHandler`] running detection on a router worker, then publishing the results.
#[derive(Debug)]
struct DetectionHandler {
    orchestrator: EventOrchestrator,
    egress: EgressBus,
    accumulator: Arc<Accumulator>,
}

impl TickHandler for DetectionHandler {
    fn handle(&self, tick: Tick) -> Result<(), ScanError> {
        let batch = self.orchestrator.process(&tick);
        self.accumulator.record(&batch);

        for event in batch.events {
            self.egress.publish(Arc::new(event));
        }

        // Each failure was already logged by the orchestrator
        match batch.errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Health of the whole pipeline.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct PipelineHealth {
    pub channels: Vec<ChannelHealth>,
    pub broadcast: BroadcastStats,
    pub symbols: usize,
    /// Feed messages that could not be decoded or normalised into a [`Tick`].
    pub malformed: u64,
    /// Events awaiting the next sink flush.
    pub buffered_events: usize,
}

/// Fully wired detection pipeline: router, detection, egress, broadcast and sink flushing.
///
/// Every task is spawned by [`Pipeline::new`]; [`Pipeline::shutdown`] stops them in order.
#[derive(Debug)]
pub struct Pipeline {
    clock: ExchangeClock,
    store: Arc<SymbolStateStore>,
    accumulator: Arc<Accumulator>,
    egress: EgressBus,
    router: ChannelRouter,
    broadcaster: Broadcaster,
    dispatch: Mutex<Option<DispatchHandle>>,
    flusher: Mutex<Option<FlusherHandle>>,
    malformed: AtomicU64,
}

impl Pipeline {
    /// Validate `config` and start the pipeline on the current tokio runtime.
    pub fn new(config: ScanConfig, sink: Arc<dyn StorageSink>) -> Result<Self, ScanError> {
        config.validate()?;

        let store = Arc::new(SymbolStateStore::new(config.state));
        let accumulator = Arc::new(Accumulator::new(config.sink.max_buffered_events));
        let egress = EgressBus::new(config.broadcast.egress_capacity);

        let broadcaster = Broadcaster::new(&config.broadcast, Arc::new(SubscriptionIndex::new()));
        let dispatch = broadcaster.spawn_dispatch(egress.subscribe_all());

        let flusher = Arc::new(SinkFlusher::new(
            &config.sink,
            Arc::clone(&accumulator),
            sink,
        ))
        .spawn();

        let handler = Arc::new(DetectionHandler {
            orchestrator: EventOrchestrator::new(&config, Arc::clone(&store)),
            egress: egress.clone(),
            accumulator: Arc::clone(&accumulator),
        });
        let router = ChannelRouter::start(&config.router, handler);

        info!("detection pipeline started");

        Ok(Self {
            clock: ExchangeClock::new(&config.clock, config.thresholds.windows),
            store,
            accumulator,
            egress,
            router,
            broadcaster,
            dispatch: Mutex::new(Some(dispatch)),
            flusher: Mutex::new(Some(flusher)),
            malformed: AtomicU64::new(0),
        })
    }

    /// Validate and route a [`Tick`] to its processing channel.
    pub fn ingest(&self, tick: Tick) -> Result<RouteOutcome, ScanError> {
        self.router.route(tick)
    }

    /// Normalise a feed message and [`ingest`](Self::ingest) it.
    ///
    /// Normalisation failures count towards [`PipelineHealth::malformed`]; validation failures
    /// after that are counted by the channel instead.
    pub fn ingest_raw(&self, raw: RawTickMessage) -> Result<RouteOutcome, ScanError> {
        let tick = raw.into_tick(&self.clock).inspect_err(|error| {
            self.record_malformed(error);
        })?;
        self.ingest(tick)
    }

    /// Count a feed message that never became a [`Tick`].
    pub fn record_malformed(&self, error: &ScanError) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        debug!(%error, "malformed feed message");
    }

    pub fn clock(&self) -> &ExchangeClock {
        &self.clock
    }

    pub fn store(&self) -> &Arc<SymbolStateStore> {
        &self.store
    }

    pub fn egress(&self) -> &EgressBus {
        &self.egress
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn health(&self) -> PipelineHealth {
        PipelineHealth {
            channels: self.router.health(),
            broadcast: self.broadcaster.stats(),
            symbols: self.store.len(),
            malformed: self.malformed.load(Ordering::Relaxed),
            buffered_events: self.accumulator.len(),
        }
    }

    /// Drain the router through detection, stop dispatch, disconnect every connection, then
    /// flush the sink one final time. Ticks ingested after this is called are rejected.
    pub async fn shutdown(&self) {
        info!("shutting down detection pipeline");
        self.router.shutdown().await;

        let dispatch = self.dispatch.lock().take();
        if let Some(dispatch) = dispatch {
            dispatch.stop().await;
        }
        self.broadcaster.disconnect_all().await;

        let flusher = self.flusher.lock().take();
        if let Some(flusher) = flusher {
            flusher.shutdown().await;
        }
        info!("detection pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::TickKind, sink::LogSink, test_utils::midday};
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let mut config = ScanConfig::default();
        config.router.workers_per_channel = 0;

        let error = assert_err!(Pipeline::new(config, Arc::new(LogSink)));
        assert!(matches!(error, ScanError::Config(_)));
    }

    #[tokio::test]
    async fn test_ingest_raw_counts_malformed() {
        struct TestCase {
            input: &'static str,
            expected: u64,
        }

        let pipeline = assert_ok!(Pipeline::new(ScanConfig::default(), Arc::new(LogSink)));

        // 2024-07-09 16:00:00 UTC in epoch millis
        let tests = vec![
            TestCase {
                // TC0: valid tick
                input: r#"{"ticker":"spy","price":550.0,"timestamp":1720540800000,"event_type":"T"}"#,
                expected: 0,
            },
            TestCase {
                // TC1: unknown event type
                input: r#"{"ticker":"spy","price":550.0,"timestamp":1720540801000,"event_type":"X"}"#,
                expected: 1,
            },
            TestCase {
                // TC2: unknown session
                input: r#"{"ticker":"spy","price":550.0,"timestamp":1720540802000,"event_type":"T","session":"lunch"}"#,
                expected: 2,
            },
            TestCase {
                // TC3: non-positive price is a channel rejection, not malformed
                input: r#"{"ticker":"spy","price":0.0,"timestamp":1720540803000,"event_type":"T"}"#,
                expected: 2,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let raw = serde_json::from_str::<RawTickMessage>(test.input).unwrap();
            let _ = pipeline.ingest_raw(raw);
            assert_eq!(pipeline.health().malformed, test.expected, "TC{} failed", index);
        }

        pipeline.record_malformed(&ScanError::MalformedTick("undecodable".to_string()));
        assert_eq!(pipeline.health().malformed, 3);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_ingest_after_shutdown_is_rejected() {
        let pipeline = assert_ok!(Pipeline::new(ScanConfig::default(), Arc::new(LogSink)));
        pipeline.shutdown().await;

        let tick = Tick::new("AAPL", TickKind::Trade, 100.0, 10.0, midday());
        assert!(matches!(pipeline.ingest(tick), Err(ScanError::ChannelClosed(_))));

        // Shutting down twice is harmless
        pipeline.shutdown().await;
    }
}
