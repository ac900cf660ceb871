use crate::{
    error::ScanError,
    event::{DetectionEvent, EventKind, Tick},
    state::SymbolState,
    threshold::ResolvedThresholds,
};

/// Session high/low detection with reversal classification.
pub mod high_low;

/// Swing pivot analysis used to classify high/low reversals.
pub mod reversal;

/// Volume/price surge detection over a short lookback.
pub mod surge;

/// Multi-window directional trend detection.
pub mod trend;

pub use high_low::HighLowDetector;
pub use surge::SurgeDetector;
pub use trend::TrendDetector;

/// Detects one family of market micro-event from a symbol's [`SymbolState`].
///
/// The [`Tick`] has already been applied to the state. Cooldown bookkeeping is written back
/// into the state when an event is emitted.
pub trait Detector {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn detect(
        &self,
        state: &mut SymbolState,
        tick: &Tick,
        thresholds: &ResolvedThresholds,
    ) -> Result<Option<DetectionEvent>, ScanError>;
}

/// Percent change from `from` to `to`.
pub(crate) fn pct_change(from: f64, to: f64) -> f64 {
    if from == 0.0 {
        0.0
    } else {
        (to - from) / from * 100.0
    }
}

/// Reject ticks no detector can reason about.
pub(crate) fn ensure_finite(tick: &Tick, kind: EventKind) -> Result<(), ScanError> {
    if tick.price.is_finite() && tick.price > 0.0 && tick.volume.is_finite() {
        Ok(())
    } else {
        Err(ScanError::Detector {
            kind,
            symbol: tick.symbol.clone(),
            reason: format!("non-finite tick price {} volume {}", tick.price, tick.volume),
        })
    }
}
