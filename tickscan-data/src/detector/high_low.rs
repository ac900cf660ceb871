use super::{
    Detector, ensure_finite, pct_change, reversal, surge::SurgeDetector, trend::TrendDetector,
};
use crate::{
    config::HighLowConfig,
    error::ScanError,
    event::{
        ContextFlags, DetectionEvent, Direction, EventKind, HighLowThresholds, Strength,
        ThresholdsUsed, Tick,
    },
    state::SymbolState,
    threshold::ResolvedThresholds,
};
use chrono::Duration;

/// Points awarded to each significance component at its maximum.
const MAX_COMPONENT_POINTS: f64 = 50.0;

/// Minimum significance of a [`Strength::Strong`] breakout.
pub const STRONG_SIGNIFICANCE: f64 = 70.0;

/// Minimum significance of a [`Strength::Moderate`] breakout.
pub const MODERATE_SIGNIFICANCE: f64 = 40.0;

/// Emits HIGH/LOW events when a new session extreme moves far enough beyond the last reported
/// one.
///
/// The trend and surge detectors are only peeked to attach [`ContextFlags`]; they never emit
/// from here.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct HighLowDetector {
    config: HighLowConfig,
    trend: TrendDetector,
    surge: SurgeDetector,
}

impl HighLowDetector {
    pub fn new(config: HighLowConfig, trend: TrendDetector, surge: SurgeDetector) -> Self {
        Self {
            config,
            trend,
            surge,
        }
    }

    /// Determine if the move from `anchor` to `price` satisfies both the percent and dollar
    /// minimums, scaled by the market factor.
    pub fn exceeds_band(&self, anchor: f64, price: f64, thresholds: &HighLowThresholds) -> bool {
        let dollar = (price - anchor).abs();
        let percent = pct_change(anchor, price).abs();
        percent >= thresholds.min_percent * thresholds.market_factor
            && dollar >= thresholds.min_dollar * thresholds.market_factor
    }

    /// Blend of price distance and relative volume, 0 to 100.
    pub fn significance(&self, percent: f64, volume: f64, average_volume: Option<f64>) -> f64 {
        let price_points = (percent / self.config.pct_for_max_points * MAX_COMPONENT_POINTS)
            .min(MAX_COMPONENT_POINTS);

        let volume_points = match average_volume {
            Some(average) if average > 0.0 => ((volume / average)
                / self.config.volume_ratio_for_max_points
                * MAX_COMPONENT_POINTS)
                .min(MAX_COMPONENT_POINTS),
            _ => 0.0,
        };

        let weight = self.config.volume_weight;
        (2.0 * ((1.0 - weight) * price_points + weight * volume_points)).clamp(0.0, 100.0)
    }

    fn strength(significance: f64) -> Strength {
        if significance >= STRONG_SIGNIFICANCE {
            Strength::Strong
        } else if significance >= MODERATE_SIGNIFICANCE {
            Strength::Moderate
        } else {
            Strength::Weak
        }
    }

    fn flags(
        &self,
        state: &SymbolState,
        tick: &Tick,
        thresholds: &ResolvedThresholds,
    ) -> ContextFlags {
        ContextFlags {
            trend: self
                .trend
                .peek(state, tick, thresholds)
                .map(|signal| signal.direction)
                .filter(Direction::is_directional),
            surge: self
                .surge
                .peek(state, tick, &thresholds.surge)
                .map(|signal| signal.direction),
        }
    }
}

impl Detector for HighLowDetector {
    fn name(&self) -> &'static str {
        "high_low"
    }

    fn detect(
        &self,
        state: &mut SymbolState,
        tick: &Tick,
        thresholds: &ResolvedThresholds,
    ) -> Result<Option<DetectionEvent>, ScanError> {
        let update = state.last_update();
        let (kind, anchor, direction) = if update.new_high {
            (EventKind::High, state.high_anchor, Direction::Up)
        } else if update.new_low {
            (EventKind::Low, state.low_anchor, Direction::Down)
        } else {
            return Ok(None);
        };
        ensure_finite(tick, kind)?;

        let anchor = anchor.ok_or_else(|| ScanError::Detector {
            kind,
            symbol: tick.symbol.clone(),
            reason: "session extreme updated before the session was seeded".to_string(),
        })?;

        let used = thresholds.high_low;
        if !self.exceeds_band(anchor, tick.price, &used) {
            return Ok(None);
        }

        // One cooldown spans both directions
        let cooled = [EventKind::High, EventKind::Low]
            .into_iter()
            .all(|kind| state.last_emissions.elapsed(kind, tick.timestamp, used.cooldown_ms));
        if !cooled {
            return Ok(None);
        }

        state.last_emissions.set(kind, tick.timestamp);
        match kind {
            EventKind::High => state.high_anchor = Some(tick.price),
            _ => state.low_anchor = Some(tick.price),
        }

        let percent = pct_change(anchor, tick.price).abs();
        let significance =
            self.significance(percent, tick.volume, state.history().baseline_volume());

        let window = Duration::seconds(self.config.reversal.window_secs as i64);
        let reversal = reversal::classify(
            state.history().since(tick.timestamp - window),
            kind,
            tick.price,
            tick.timestamp,
            &self.config.reversal,
        );

        let mut event = DetectionEvent::new(
            kind,
            tick.symbol.clone(),
            tick.price,
            tick.timestamp,
            direction,
            percent,
            Self::strength(significance),
            thresholds.context,
            ThresholdsUsed::HighLow(used),
        );
        event.score = significance;
        event.significance = significance;
        event.flags = self.flags(state, tick, thresholds);
        event.reversal = reversal;

        Ok(Some(event))
    }
}
