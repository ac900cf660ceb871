use super::{Detector, ensure_finite, pct_change};
use crate::{
    config::SurgeConfig,
    error::ScanError,
    event::{
        DetectionEvent, Direction, EventKind, Strength, SurgeDetails, SurgeMode, SurgeThresholds,
        SurgeTrigger, ThresholdsUsed, Tick,
    },
    state::SymbolState,
    threshold::ResolvedThresholds,
};
use chrono::Duration;

/// Points awarded per multiple of a threshold, before the per-component cap.
const POINTS_PER_RATIO: f64 = 25.0;

/// Surge reading for the latest tick, produced without emitting.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct SurgeSignal {
    pub direction: Direction,
    pub strength: Strength,
    pub score: f64,
    pub details: SurgeDetails,
}

/// Compares the latest tick against the sample `lookback_secs` ago in the surge ring.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct SurgeDetector {
    config: SurgeConfig,
}

impl SurgeDetector {
    pub fn new(config: SurgeConfig) -> Self {
        Self { config }
    }

    /// Determine if the price and volume threshold ratios trigger under `mode`.
    pub fn triggers(&self, mode: SurgeMode, price_ratio: f64, volume_ratio: f64) -> bool {
        let price = price_ratio >= 1.0;
        let volume = volume_ratio >= 1.0;
        match mode {
            SurgeMode::Or => price || volume,
            SurgeMode::Strict => price && volume,
            SurgeMode::Adaptive => {
                (price && volume)
                    || (price_ratio >= self.config.strong_ratio
                        && volume_ratio >= self.config.partial_ratio)
                    || (volume_ratio >= self.config.strong_ratio
                        && price_ratio >= self.config.partial_ratio)
            }
        }
    }

    fn strength(&self, score: f64) -> Strength {
        if score >= self.config.strong_score {
            Strength::Strong
        } else if score >= self.config.moderate_score {
            Strength::Moderate
        } else {
            Strength::Weak
        }
    }

    /// Non-emitting variant of [`Detector::detect`], ignoring the cooldown.
    pub fn peek(
        &self,
        state: &SymbolState,
        tick: &Tick,
        thresholds: &SurgeThresholds,
    ) -> Option<SurgeSignal> {
        let ring = state.surge_ring();
        if ring.len() < 2 {
            return None;
        }

        let target = tick.timestamp - Duration::seconds(thresholds.lookback_secs as i64);
        let reference = ring
            .reference_at(target)
            .filter(|reference| reference.timestamp < tick.timestamp)?;

        let price_change_pct = pct_change(reference.price, tick.price);
        let volume_multiplier = match ring.baseline_volume() {
            Some(baseline) if baseline > 0.0 => tick.volume / baseline,
            _ => 0.0,
        };

        let price_ratio = price_change_pct.abs() / thresholds.price_threshold_pct;
        let volume_ratio = volume_multiplier / thresholds.volume_multiplier;
        if !self.triggers(thresholds.mode, price_ratio, volume_ratio) {
            return None;
        }

        let trigger = if price_ratio >= 1.0 && volume_ratio >= 1.0 {
            SurgeTrigger::Balanced
        } else if price_ratio >= volume_ratio {
            SurgeTrigger::PriceDriven
        } else {
            SurgeTrigger::VolumeDriven
        };

        let cap = self.config.component_cap;
        let score =
            (price_ratio * POINTS_PER_RATIO).min(cap) + (volume_ratio * POINTS_PER_RATIO).min(cap);

        Some(SurgeSignal {
            direction: Direction::from_sign(price_change_pct),
            strength: self.strength(score),
            score,
            details: SurgeDetails {
                trigger,
                price_change_pct,
                volume_multiplier,
                reference_price: reference.price,
                reference_time: reference.timestamp,
            },
        })
    }
}

impl Detector for SurgeDetector {
    fn name(&self) -> &'static str {
        "surge"
    }

    fn detect(
        &self,
        state: &mut SymbolState,
        tick: &Tick,
        thresholds: &ResolvedThresholds,
    ) -> Result<Option<DetectionEvent>, ScanError> {
        ensure_finite(tick, EventKind::Surge)?;
        let used = thresholds.surge;

        let Some(signal) = self.peek(state, tick, &used) else {
            return Ok(None);
        };

        if !state
            .last_emissions
            .elapsed(EventKind::Surge, tick.timestamp, used.cooldown_secs * 1_000)
        {
            return Ok(None);
        }
        state.last_emissions.set(EventKind::Surge, tick.timestamp);

        let mut event = DetectionEvent::new(
            EventKind::Surge,
            tick.symbol.clone(),
            tick.price,
            tick.timestamp,
            signal.direction,
            signal.details.price_change_pct.abs(),
            signal.strength,
            thresholds.context,
            ThresholdsUsed::Surge(used),
        );
        event.score = signal.score;
        event.significance = signal.score;
        event.surge = Some(signal.details);

        Ok(Some(event))
    }
}
