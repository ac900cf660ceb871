use crate::{
    config::ScanConfig,
    detector::{Detector, HighLowDetector, SurgeDetector, TrendDetector},
    error::ScanError,
    event::{DetectionEvent, Symbol, Tick},
    state::{SymbolStateStore, TickUpdate},
    threshold::ThresholdResolver,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Output of running every detector over one [`Tick`].
#[derive(Clone, PartialEq, Debug, Default)]
pub struct DetectionBatch {
    pub symbol: Symbol,
    pub update: TickUpdate,
    pub events: Vec<DetectionEvent>,
    /// Errors returned by detectors for this tick.
    pub errors: Vec<ScanError>,
}

impl DetectionBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Applies ticks to per-symbol state and runs HighLow, Trend then Surge detection under the
/// symbol's lock.
#[derive(Debug)]
pub struct EventOrchestrator {
    store: Arc<SymbolStateStore>,
    resolver: ThresholdResolver,
    high_low: HighLowDetector,
    trend: TrendDetector,
    surge: SurgeDetector,
    volatility_points: usize,
}

impl EventOrchestrator {
    pub fn new(config: &ScanConfig, store: Arc<SymbolStateStore>) -> Self {
        let trend = TrendDetector::new(config.trend);
        let surge = SurgeDetector::new(config.surge);
        Self {
            store,
            resolver: ThresholdResolver::new(config),
            high_low: HighLowDetector::new(config.high_low, trend, surge),
            trend,
            surge,
            volatility_points: config.thresholds.volatility.window_points,
        }
    }

    pub fn store(&self) -> &Arc<SymbolStateStore> {
        &self.store
    }

    pub fn resolver(&self) -> &ThresholdResolver {
        &self.resolver
    }

    /// Process a validated [`Tick`].
    ///
    /// Each detector runs in isolation: a failing detector is logged and skipped while the
    /// others still run.
    pub fn process(&self, tick: &Tick) -> DetectionBatch {
        let state = self.store.get_or_insert(&tick.symbol);
        let mut state = state.lock();

        let update = state.apply_tick(tick);
        let recent_prices = state.history().recent_prices(self.volatility_points);
        let thresholds = self
            .resolver
            .resolve(tick.price, tick.timestamp, &recent_prices);

        let detectors: [&dyn Detector; 3] = [&self.high_low, &self.trend, &self.surge];

        let mut batch = DetectionBatch {
            symbol: tick.symbol.clone(),
            update,
            events: Vec::new(),
            errors: Vec::new(),
        };

        for detector in detectors {
            match detector.detect(&mut state, tick, &thresholds) {
                Ok(Some(event)) => {
                    debug!(
                        symbol = %tick.symbol,
                        kind = %event.kind,
                        direction = ?event.direction,
                        magnitude = event.magnitude,
                        "detected event"
                    );
                    state.record_event(event.kind);
                    batch.events.push(event);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        symbol = %tick.symbol,
                        detector = detector.name(),
                        price = tick.price,
                        timestamp = %tick.timestamp,
                        ?error,
                        "detector failed, continuing with remaining detectors"
                    );
                    batch.errors.push(error);
                }
            }
        }

        batch
    }
}
