use super::{Detector, ensure_finite, pct_change};
use crate::{
    config::TrendConfig,
    error::ScanError,
    event::{DetectionEvent, Direction, EventKind, Strength, ThresholdsUsed, Tick},
    state::{SymbolState, TrendTrack, window::PricePoint},
    threshold::ResolvedThresholds,
};
use chrono::Duration;
use tracing::debug;

/// Number of most recent points the volume amplification compares against the window.
const RECENT_VOLUME_POINTS: usize = 3;

/// Directional reading of a symbol's recent price action, produced without emitting.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct TrendSignal {
    pub direction: Direction,
    pub strength: Strength,
    pub score: f64,
}

/// Scores price momentum, VWAP divergence and volume confirmation over three windows.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct TrendDetector {
    config: TrendConfig,
}

impl TrendDetector {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    /// Weighted combined score across the configured windows.
    ///
    /// Windows with fewer than two points are skipped and the remaining weights renormalised.
    pub fn score(&self, state: &SymbolState, tick: &Tick) -> Option<f64> {
        let (weighted, total_weight) = self
            .config
            .window_secs
            .iter()
            .zip(self.config.window_weights)
            .filter_map(|(secs, weight)| {
                let cutoff = tick.timestamp - Duration::seconds(*secs as i64);
                let points = state.history().since(cutoff).copied().collect::<Vec<_>>();
                self.window_score(&points).map(|score| (score, weight))
            })
            .fold((0.0, 0.0), |(weighted, total), (score, weight)| {
                (weighted + score * weight, total + weight)
            });

        (total_weight > 0.0).then(|| weighted / total_weight)
    }

    fn window_score(&self, points: &[PricePoint]) -> Option<f64> {
        if points.len() < 2 {
            return None;
        }

        let returns = points
            .windows(2)
            .map(|pair| pct_change(pair[0].price, pair[1].price))
            .collect::<Vec<_>>();

        let momentum = self.momentum(&returns);
        let vwap = vwap_divergence(points);
        let volume = volume_confirmation(points, &returns);

        Some(
            self.config.momentum_weight * momentum
                + self.config.vwap_weight * vwap
                + self.config.volume_weight * volume,
        )
    }

    /// Recency weighted mean of per-step percent returns.
    fn momentum(&self, returns: &[f64]) -> f64 {
        let (weighted, total) = returns.iter().rev().enumerate().fold(
            (0.0, 0.0),
            |(weighted, total), (age, value)| {
                let weight = self.config.momentum_decay.powi(age as i32);
                (weighted + value * weight, total + weight)
            },
        );

        if total > 0.0 { weighted / total } else { 0.0 }
    }

    /// Classify a combined score against the resolved direction threshold.
    pub fn classify(&self, score: f64, direction_threshold: f64) -> Option<(Direction, Strength)> {
        if direction_threshold <= 0.0 || !score.is_finite() {
            return None;
        }

        let ratio = score.abs() / direction_threshold;
        let strength = if ratio >= self.config.strong_multiple {
            Strength::Strong
        } else if ratio >= self.config.moderate_multiple {
            Strength::Moderate
        } else if ratio >= 1.0 {
            Strength::Weak
        } else {
            return None;
        };

        Some((Direction::from_sign(score), strength))
    }

    /// Non-emitting variant of [`Detector::detect`], ignoring warm-up and emission spacing.
    pub fn peek(
        &self,
        state: &SymbolState,
        tick: &Tick,
        thresholds: &ResolvedThresholds,
    ) -> Option<TrendSignal> {
        if state.history().len() < thresholds.trend.min_history_points {
            return None;
        }

        let score = self.score(state, tick)?;
        self.classify(score, thresholds.trend.direction_threshold)
            .map(|(direction, strength)| TrendSignal {
                direction,
                strength,
                score,
            })
    }

    /// Update the in-progress trend track and report whether it was invalidated by a
    /// retracement beyond `fraction`.
    fn track(
        &self,
        state: &mut SymbolState,
        tick: &Tick,
        signal: Option<&TrendSignal>,
        fraction: f64,
    ) -> bool {
        if let Some(track) = state.trend_track.as_mut() {
            track.observe(tick.price);
            if track.retracement(tick.price) > fraction {
                debug!(
                    symbol = %tick.symbol,
                    direction = ?track.direction,
                    extreme = track.extreme_price,
                    price = tick.price,
                    "trend invalidated by retracement"
                );
                state.trend_track = None;
                return true;
            }
        }

        if let Some(signal) = signal {
            let continuing = state
                .trend_track
                .is_some_and(|track| track.direction == signal.direction);
            if !continuing {
                let short_window = Duration::seconds(self.config.window_secs[0] as i64);
                let start_price = state
                    .history()
                    .since(tick.timestamp - short_window)
                    .next()
                    .map_or(tick.price, |point| point.price);

                let mut track = TrendTrack::new(signal.direction, start_price, tick.timestamp);
                track.observe(tick.price);
                state.trend_track = Some(track);
            }
        }

        false
    }
}

impl Detector for TrendDetector {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn detect(
        &self,
        state: &mut SymbolState,
        tick: &Tick,
        thresholds: &ResolvedThresholds,
    ) -> Result<Option<DetectionEvent>, ScanError> {
        ensure_finite(tick, EventKind::Trend)?;
        let used = thresholds.trend;

        let signal = self
            .peek(state, tick, thresholds)
            .filter(|signal| signal.direction.is_directional());

        if self.track(state, tick, signal.as_ref(), used.retracement_fraction) {
            return Ok(None);
        }

        let Some(signal) = signal else {
            return Ok(None);
        };

        let warmed_up = state.first_tick_at().is_some_and(|first| {
            tick.timestamp - first >= Duration::seconds(used.warmup_secs as i64)
        });
        if !warmed_up {
            return Ok(None);
        }

        let reversal = state
            .last_trend_direction
            .is_some_and(|last| last != signal.direction);
        let spaced = state.last_emissions.elapsed(
            EventKind::Trend,
            tick.timestamp,
            used.min_emission_interval_secs * 1_000,
        );
        if !(reversal || spaced) {
            return Ok(None);
        }

        state.last_emissions.set(EventKind::Trend, tick.timestamp);
        state.last_trend_direction = Some(signal.direction);

        let mut event = DetectionEvent::new(
            EventKind::Trend,
            tick.symbol.clone(),
            tick.price,
            tick.timestamp,
            signal.direction,
            signal.score.abs(),
            signal.strength,
            thresholds.context,
            ThresholdsUsed::Trend(used),
        );
        event.score = signal.score;
        event.significance = (signal.score.abs() / used.strength_threshold * 50.0).clamp(0.0, 100.0);

        Ok(Some(event))
    }
}

/// Static position against VWAP blended with how fast that divergence is changing.
fn vwap_divergence(points: &[PricePoint]) -> f64 {
    let divergence = |point: &PricePoint| {
        if point.vwap > 0.0 {
            pct_change(point.vwap, point.price)
        } else {
            0.0
        }
    };

    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return 0.0;
    };

    let steps = (points.len() - 1).max(1) as f64;
    let end = divergence(last);
    let start = divergence(first);
    (end / steps + (end - start) / steps) / 2.0
}

/// Volume-weighted directional return amplified by recent relative volume.
fn volume_confirmation(points: &[PricePoint], returns: &[f64]) -> f64 {
    let (weighted, total_volume) = points[1..]
        .iter()
        .zip(returns)
        .fold((0.0, 0.0), |(weighted, total), (point, value)| {
            (weighted + point.volume * value, total + point.volume)
        });

    let directional = if total_volume > 0.0 {
        weighted / total_volume
    } else {
        returns.iter().sum::<f64>() / returns.len().max(1) as f64
    };

    let average = points.iter().map(|point| point.volume).sum::<f64>() / points.len() as f64;
    let recent = &points[points.len().saturating_sub(RECENT_VOLUME_POINTS)..];
    let recent_average = recent.iter().map(|point| point.volume).sum::<f64>() / recent.len() as f64;

    let amplification = if average > 0.0 {
        (recent_average / average).clamp(0.5, 2.0)
    } else {
        1.0
    };

    directional * amplification
}
