use crate::{
    config::RouterConfig,
    error::ScanError,
    event::{Symbol, Tick, TickKind},
};
use chrono::{DateTime, Utc};
use fnv::{FnvHashMap, FnvHashSet, FnvHasher};
use metrics::{ChannelHealth, ChannelMetrics};
use parking_lot::Mutex;
use queue::{Priority, PriorityBacklog, PushOutcome};
use std::{
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, info, warn};

/// Lock-free per-channel counters and [`ChannelHealth`] snapshots.
pub mod metrics;

/// Bounded [`PriorityBacklog`] with load shedding.
pub mod queue;

/// Number of shards the per-symbol last-timestamp map is split across.
const TIMESTAMP_SHARDS: usize = 16;

/// Consumes validated ticks on a channel worker.
///
/// Called synchronously; implementations must not block on I/O.
pub trait TickHandler: Send + Sync + 'static {
    fn handle(&self, tick: Tick) -> Result<(), ScanError>;
}

/// What happened to a tick passed to [`ChannelRouter::route`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RouteOutcome {
    Queued,
    /// Queued after shedding an older, lower-priority tick.
    QueuedWithShed,
    /// Dropped because the backlog was full of higher-priority ticks.
    Dropped,
}

#[derive(Debug)]
struct WorkerQueue {
    backlog: Mutex<PriorityBacklog<Tick>>,
    notify: Notify,
    closed: AtomicBool,
}

impl WorkerQueue {
    fn new(high_water_mark: usize, capacity: usize) -> Self {
        Self {
            backlog: Mutex::new(PriorityBacklog::new(high_water_mark, capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct Channel {
    workers: Vec<Arc<WorkerQueue>>,
    metrics: Arc<ChannelMetrics>,
}

impl Channel {
    fn depth(&self) -> usize {
        self.workers.iter().map(|worker| worker.backlog.lock().len()).sum()
    }
}

/// Validates ticks at ingress and routes them by [`TickKind`] to per-channel worker pools.
///
/// Ticks are sharded to workers by symbol hash so per-symbol order is preserved. Ingestion
/// never blocks: past its share of the high-water mark a worker backlog sheds lower-priority
/// ticks, and at its share of the channel capacity it drops incoming ones.
#[derive(Debug)]
pub struct ChannelRouter {
    channels: FnvHashMap<TickKind, Channel>,
    priorities: FnvHashMap<TickKind, Priority>,
    priority_symbols: FnvHashSet<Symbol>,
    last_seen: Vec<Mutex<FnvHashMap<Symbol, DateTime<Utc>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelRouter {
    /// Construct every channel and spawn its workers onto the current tokio runtime.
    pub fn start<Handler>(config: &RouterConfig, handler: Arc<Handler>) -> Self
    where
        Handler: TickHandler,
    {
        let workers = config.workers_per_channel.max(1);
        let high_water_mark = (config.high_water_mark / workers).max(1);
        let capacity = (config.channel_capacity / workers).max(high_water_mark);

        let mut tasks = Vec::with_capacity(TickKind::ALL.len() * workers);
        let channels = TickKind::ALL
            .into_iter()
            .map(|kind| {
                let metrics = Arc::new(ChannelMetrics::new(kind));
                let queues = (0..workers)
                    .map(|index| {
                        let queue = Arc::new(WorkerQueue::new(high_water_mark, capacity));
                        tasks.push(tokio::spawn(run_worker(
                            kind,
                            index,
                            Arc::clone(&queue),
                            Arc::clone(&metrics),
                            Arc::clone(&handler),
                        )));
                        queue
                    })
                    .collect();

                (
                    kind,
                    Channel {
                        workers: queues,
                        metrics,
                    },
                )
            })
            .collect();

        info!(
            workers_per_channel = workers,
            high_water_mark = config.high_water_mark,
            channel_capacity = config.channel_capacity,
            "started channel router"
        );

        Self {
            channels,
            priorities: FnvHashMap::from_iter([
                (TickKind::Aggregate, config.priorities.aggregate),
                (TickKind::Trade, config.priorities.trade),
                (TickKind::Quote, config.priorities.quote),
            ]),
            priority_symbols: config.priority_symbols.iter().cloned().collect(),
            last_seen: (0..TIMESTAMP_SHARDS)
                .map(|_| Mutex::new(FnvHashMap::default()))
                .collect(),
            tasks: Mutex::new(tasks),
        }
    }

    /// Validate and enqueue a [`Tick`] onto its channel.
    pub fn route(&self, tick: Tick) -> Result<RouteOutcome, ScanError> {
        let channel = self
            .channels
            .get(&tick.kind)
            .ok_or(ScanError::ChannelClosed(tick.kind))?;

        if let Err(error) = validate(&tick).and_then(|()| self.check_monotonic(&tick)) {
            channel.metrics.record_rejected();
            warn!(symbol = %tick.symbol, channel = %tick.kind, %error, "rejected tick");
            return Err(error);
        }

        let priority = if self.priority_symbols.contains(&tick.symbol) {
            Priority::Critical
        } else {
            self.priorities.get(&tick.kind).copied().unwrap_or_default()
        };

        let shard = (symbol_hash(&tick.symbol) % channel.workers.len() as u64) as usize;
        let worker = &channel.workers[shard];
        if worker.closed.load(Ordering::Acquire) {
            return Err(ScanError::ChannelClosed(tick.kind));
        }

        let (kind, symbol, timestamp) = (tick.kind, tick.symbol.clone(), tick.timestamp);
        let outcome = worker.backlog.lock().push(tick, priority);
        let outcome = match outcome {
            PushOutcome::Accepted => {
                channel.metrics.record_accepted();
                RouteOutcome::Queued
            }
            PushOutcome::Shed(shed) => {
                channel.metrics.record_accepted();
                channel.metrics.record_shed();
                warn!(
                    channel = %kind,
                    worker = shard,
                    shed_symbol = %shed.symbol,
                    "backlog past high-water mark, shed oldest lower-priority tick"
                );
                RouteOutcome::QueuedWithShed
            }
            PushOutcome::Dropped(dropped) => {
                channel.metrics.record_shed();
                warn!(
                    channel = %kind,
                    worker = shard,
                    symbol = %dropped.symbol,
                    "backlog at capacity, dropped incoming tick"
                );
                return Ok(RouteOutcome::Dropped);
            }
        };

        self.record_watermark(symbol, timestamp);
        worker.notify.notify_one();
        Ok(outcome)
    }

    fn timestamp_shard(&self, symbol: &Symbol) -> &Mutex<FnvHashMap<Symbol, DateTime<Utc>>> {
        &self.last_seen[(symbol_hash(symbol) % TIMESTAMP_SHARDS as u64) as usize]
    }

    fn check_monotonic(&self, tick: &Tick) -> Result<(), ScanError> {
        match self.timestamp_shard(&tick.symbol).lock().get(&tick.symbol) {
            Some(last) if tick.timestamp < *last => Err(ScanError::NonMonotonicTimestamp {
                symbol: tick.symbol.clone(),
                timestamp: tick.timestamp,
                last_timestamp: *last,
            }),
            _ => Ok(()),
        }
    }

    /// Advance the symbol's last queued timestamp. Only queued ticks move it.
    fn record_watermark(&self, symbol: Symbol, timestamp: DateTime<Utc>) {
        self.timestamp_shard(&symbol)
            .lock()
            .entry(symbol)
            .and_modify(|last| *last = (*last).max(timestamp))
            .or_insert(timestamp);
    }

    /// Health of every channel, in [`TickKind::ALL`] order.
    pub fn health(&self) -> Vec<ChannelHealth> {
        TickKind::ALL
            .iter()
            .filter_map(|kind| self.channels.get(kind))
            .map(|channel| channel.metrics.snapshot(channel.depth()))
            .collect()
    }

    /// Stop accepting ticks, then wait for every worker to drain its backlog.
    pub async fn shutdown(&self) {
        for channel in self.channels.values() {
            for worker in &channel.workers {
                worker.close();
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(error) = task.await {
                warn!(?error, "channel worker terminated abnormally");
            }
        }
        info!("channel router drained");
    }
}

/// Reject ticks with missing or non-physical fields.
pub fn validate(tick: &Tick) -> Result<(), ScanError> {
    if tick.symbol.trim().is_empty() {
        return Err(ScanError::MalformedTick("empty symbol".to_string()));
    }
    if !tick.price.is_finite() || tick.price <= 0.0 {
        return Err(ScanError::MalformedTick(format!(
            "{} price must be finite and positive, got {}",
            tick.symbol, tick.price
        )));
    }
    if !tick.volume.is_finite() || tick.volume < 0.0 {
        return Err(ScanError::MalformedTick(format!(
            "{} volume must be finite and non-negative, got {}",
            tick.symbol, tick.volume
        )));
    }
    Ok(())
}

fn symbol_hash(symbol: &Symbol) -> u64 {
    let mut hasher = FnvHasher::default();
    symbol.hash(&mut hasher);
    hasher.finish()
}

async fn run_worker<Handler>(
    kind: TickKind,
    index: usize,
    queue: Arc<WorkerQueue>,
    metrics: Arc<ChannelMetrics>,
    handler: Arc<Handler>,
) where
    Handler: TickHandler,
{
    debug!(channel = %kind, worker = index, "channel worker running");

    loop {
        let next = queue.backlog.lock().pop();
        match next {
            Some(tick) => {
                let symbol = tick.symbol.clone();
                let result = handler.handle(tick);
                if let Err(error) = &result {
                    warn!(channel = %kind, worker = index, %symbol, %error, "tick handler failed");
                }
                metrics.record_processed(result.is_err());
            }
            None if queue.closed.load(Ordering::Acquire) => break,
            None => queue.notify.notified().await,
        }
    }

    debug!(channel = %kind, worker = index, "channel worker drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[derive(Default)]
    struct Recorder {
        ticks: Mutex<Vec<Tick>>,
    }

    impl TickHandler for Recorder {
        fn handle(&self, tick: Tick) -> Result<(), ScanError> {
            self.ticks.lock().push(tick);
            Ok(())
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 9, 16, 0, 0).unwrap()
    }

    fn tick(symbol: &str, kind: TickKind, secs: i64, price: f64) -> Tick {
        Tick::new(symbol, kind, price, 100.0, base() + Duration::seconds(secs))
    }

    #[test]
    fn test_validate() {
        struct TestCase {
            input: Tick,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: valid
                input: tick("AAPL", TickKind::Trade, 0, 10.0),
                expected: true,
            },
            TestCase {
                // TC1: empty symbol
                input: tick(" ", TickKind::Trade, 0, 10.0),
                expected: false,
            },
            TestCase {
                // TC2: zero price
                input: tick("AAPL", TickKind::Trade, 0, 0.0),
                expected: false,
            },
            TestCase {
                // TC3: NaN price
                input: tick("AAPL", TickKind::Trade, 0, f64::NAN),
                expected: false,
            },
            TestCase {
                // TC4: negative volume
                input: Tick {
                    volume: -1.0,
                    ..tick("AAPL", TickKind::Trade, 0, 10.0)
                },
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = validate(&test.input).is_ok();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[tokio::test]
    async fn test_route_preserves_per_symbol_order() {
        let recorder = Arc::new(Recorder::default());
        let router = ChannelRouter::start(&RouterConfig::default(), Arc::clone(&recorder));

        for secs in 0..50 {
            for symbol in ["AAPL", "MSFT", "NVDA"] {
                let outcome = router.route(tick(symbol, TickKind::Trade, secs, 100.0 + secs as f64));
                assert_eq!(outcome, Ok(RouteOutcome::Queued));
            }
        }
        router.shutdown().await;

        let ticks = recorder.ticks.lock();
        assert_eq!(ticks.len(), 150);
        for symbol in ["AAPL", "MSFT", "NVDA"] {
            let timestamps = ticks
                .iter()
                .filter(|tick| tick.symbol == symbol)
                .map(|tick| tick.timestamp)
                .collect::<Vec<_>>();
            assert_eq!(timestamps.len(), 50);
            assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));
        }

        let trade = router.health()[1];
        assert_eq!(trade.kind, TickKind::Trade);
        assert_eq!(trade.processed, 150);
        assert_eq!(trade.depth, 0);
    }

    #[tokio::test]
    async fn test_route_rejects_malformed_and_non_monotonic() {
        let recorder = Arc::new(Recorder::default());
        let router = ChannelRouter::start(&RouterConfig::default(), Arc::clone(&recorder));

        assert!(router.route(tick("AAPL", TickKind::Aggregate, 10, 100.0)).is_ok());
        assert!(matches!(
            router.route(tick("AAPL", TickKind::Aggregate, 5, 100.0)),
            Err(ScanError::NonMonotonicTimestamp { .. })
        ));
        assert!(matches!(
            router.route(tick("AAPL", TickKind::Aggregate, 11, -1.0)),
            Err(ScanError::MalformedTick(_))
        ));
        // Equal timestamps are accepted
        assert!(router.route(tick("AAPL", TickKind::Aggregate, 10, 100.5)).is_ok());

        router.shutdown().await;

        let aggregate = router.health()[0];
        assert_eq!(aggregate.rejected, 2);
        assert_eq!(aggregate.processed, 2);
        assert_eq!(recorder.ticks.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_route_bounds_backlog_at_capacity() {
        let config = RouterConfig {
            channel_capacity: 4,
            high_water_mark: 2,
            workers_per_channel: 1,
            ..RouterConfig::default()
        };
        let recorder = Arc::new(Recorder::default());
        let router = ChannelRouter::start(&config, Arc::clone(&recorder));

        // Workers only run once the test yields, so the backlog fills up
        let outcomes = ["AAPL", "MSFT", "NVDA", "AMD", "TSLA"]
            .into_iter()
            .map(|symbol| router.route(tick(symbol, TickKind::Trade, 20, 10.0)))
            .collect::<Vec<_>>();
        assert_eq!(
            outcomes,
            vec![
                Ok(RouteOutcome::Queued),
                Ok(RouteOutcome::Queued),
                Ok(RouteOutcome::Queued),
                Ok(RouteOutcome::Queued),
                Ok(RouteOutcome::Dropped),
            ]
        );
        assert_eq!(router.health()[1].depth, 4);

        while router.health()[1].depth > 0 {
            tokio::task::yield_now().await;
        }

        // The dropped tick never advanced the symbol's watermark
        assert_eq!(
            router.route(tick("TSLA", TickKind::Trade, 10, 10.0)),
            Ok(RouteOutcome::Queued)
        );
        // Queued ones did
        assert!(matches!(
            router.route(tick("AAPL", TickKind::Trade, 10, 10.0)),
            Err(ScanError::NonMonotonicTimestamp { .. })
        ));

        router.shutdown().await;
        assert_eq!(recorder.ticks.lock().len(), 5);

        let trade = router.health()[1];
        assert_eq!(trade.accepted, 5);
        assert_eq!(trade.shed, 1);
        assert_eq!(trade.rejected, 1);
    }

    #[tokio::test]
    async fn test_route_after_shutdown_is_closed() {
        let router = ChannelRouter::start(&RouterConfig::default(), Arc::new(Recorder::default()));
        router.shutdown().await;

        assert_eq!(
            router.route(tick("AAPL", TickKind::Quote, 0, 10.0)),
            Err(ScanError::ChannelClosed(TickKind::Quote))
        );
    }
}
