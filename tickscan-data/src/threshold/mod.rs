use crate::{
    config::{ScanConfig, ThresholdConfig},
    event::{
        HighLowThresholds, MarketPeriod, PriceBucket, SurgeThresholds, ThresholdContext,
        TrendThresholds, VolatilityClass,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exchange-local time conversion and [`MarketPeriod`] classification.
pub mod clock;

pub use clock::ExchangeClock;

/// Thresholds for every detector family, resolved for one [`ThresholdContext`].
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ResolvedThresholds {
    pub context: ThresholdContext,
    pub trend: TrendThresholds,
    pub surge: SurgeThresholds,
    pub high_low: HighLowThresholds,
}

/// Resolves context-adaptive detector thresholds.
///
/// Pure and deterministic: the same price, instant and recent prices always produce the same
/// [`ResolvedThresholds`].
#[derive(Clone, PartialEq, Debug)]
pub struct ThresholdResolver {
    clock: ExchangeClock,
    tables: ThresholdConfig,
    strong_multiple: f64,
    retracement_bounds: (f64, f64),
    high_low_cooldown_ms: u64,
    surge_cooldown_secs: u64,
}

impl ThresholdResolver {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            clock: ExchangeClock::new(&config.clock, config.thresholds.windows),
            tables: config.thresholds.clone(),
            strong_multiple: config.trend.strong_multiple,
            retracement_bounds: (config.trend.retracement_min, config.trend.retracement_max),
            high_low_cooldown_ms: config.high_low.cooldown_ms,
            surge_cooldown_secs: config.surge.cooldown_secs,
        }
    }

    pub fn clock(&self) -> &ExchangeClock {
        &self.clock
    }

    /// Resolve thresholds for a price observed at `at`, given the most recent prices
    /// (oldest first) the volatility class is measured over.
    pub fn resolve(
        &self,
        price: f64,
        at: DateTime<Utc>,
        recent_prices: &[f64],
    ) -> ResolvedThresholds {
        self.resolve_context(&self.context(price, at, recent_prices))
    }

    pub fn context(&self, price: f64, at: DateTime<Utc>, recent_prices: &[f64]) -> ThresholdContext {
        ThresholdContext {
            period: self.clock.period_at(at),
            bucket: self.tables.buckets.classify(price),
            volatility: self.classify_volatility(recent_prices),
            price,
        }
    }

    pub fn resolve_context(&self, context: &ThresholdContext) -> ResolvedThresholds {
        ResolvedThresholds {
            context: *context,
            trend: self.trend(context.period, context.bucket, context.volatility),
            surge: self.surge(context.period, context.bucket, context.volatility),
            high_low: self.high_low(context.period, context.bucket),
        }
    }

    /// Coefficient of variation over the last `window_points` prices.
    ///
    /// Too little history, or a non-positive mean, classifies as [`VolatilityClass::Normal`].
    pub fn classify_volatility(&self, recent_prices: &[f64]) -> VolatilityClass {
        let config = &self.tables.volatility;
        let window = &recent_prices[recent_prices.len().saturating_sub(config.window_points)..];

        let Some(cv) = coefficient_of_variation(window) else {
            return VolatilityClass::Normal;
        };

        if cv >= config.high_cv {
            VolatilityClass::High
        } else if cv <= config.low_cv {
            VolatilityClass::Low
        } else {
            VolatilityClass::Normal
        }
    }

    fn trend(
        &self,
        period: MarketPeriod,
        bucket: PriceBucket,
        volatility: VolatilityClass,
    ) -> TrendThresholds {
        let period_profile = self.tables.periods.get(period);
        let bucket_profile = self.tables.buckets.get(bucket);
        let sensitivity =
            self.tables.volatility.trend.get(volatility) * self.tables.global_sensitivity;

        let direction_threshold = period_profile
            .trend_direction_threshold
            .min(bucket_profile.trend_direction_threshold)
            * sensitivity;

        let (retracement_min, retracement_max) = self.retracement_bounds;
        let retracement_fraction = (period_profile.trend_retracement_fraction
            * bucket_profile.retracement_adjust)
            .clamp(retracement_min, retracement_max);

        TrendThresholds {
            direction_threshold,
            strength_threshold: direction_threshold * self.strong_multiple,
            sensitivity_multiplier: sensitivity,
            min_history_points: period_profile.trend_min_history_points,
            warmup_secs: period_profile.trend_warmup_secs,
            min_emission_interval_secs: period_profile.trend_min_emission_interval_secs,
            retracement_fraction,
        }
    }

    fn surge(
        &self,
        period: MarketPeriod,
        bucket: PriceBucket,
        volatility: VolatilityClass,
    ) -> SurgeThresholds {
        let period_profile = self.tables.periods.get(period);
        let bucket_profile = self.tables.buckets.get(bucket);
        let sensitivity =
            self.tables.volatility.surge.get(volatility) * self.tables.global_sensitivity;

        SurgeThresholds {
            price_threshold_pct: period_profile
                .surge_price_pct
                .min(bucket_profile.surge_price_pct)
                * sensitivity,
            volume_multiplier: period_profile.surge_volume_multiplier
                * self.tables.global_sensitivity,
            mode: period_profile.surge_mode,
            lookback_secs: period_profile.surge_lookback_secs,
            sensitivity_multiplier: sensitivity,
            cooldown_secs: self.surge_cooldown_secs,
        }
    }

    fn high_low(&self, period: MarketPeriod, bucket: PriceBucket) -> HighLowThresholds {
        let bucket_profile = self.tables.buckets.get(bucket);
        HighLowThresholds {
            min_percent: bucket_profile.high_low_min_percent,
            min_dollar: bucket_profile.high_low_min_dollar,
            market_factor: self.tables.periods.get(period).sensitivity
                * self.tables.global_sensitivity,
            cooldown_ms: self.high_low_cooldown_ms,
        }
    }
}

fn coefficient_of_variation(prices: &[f64]) -> Option<f64> {
    if prices.len() < 2 {
        return None;
    }

    let count = prices.len() as f64;
    let mean = prices.iter().sum::<f64>() / count;
    if mean <= 0.0 {
        return None;
    }

    let variance = prices.iter().map(|price| (price - mean).powi(2)).sum::<f64>() / count;
    Some(variance.sqrt() / mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SurgeMode;
    use chrono::TimeZone;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn context(
        period: MarketPeriod,
        bucket: PriceBucket,
        volatility: VolatilityClass,
        price: f64,
    ) -> ThresholdContext {
        ThresholdContext {
            period,
            bucket,
            volatility,
            price,
        }
    }

    #[test]
    fn test_resolve_surge_thresholds() {
        struct TestCase {
            input: ThresholdContext,
            expected_pct: f64,
            expected_mode: SurgeMode,
        }

        let resolver = ThresholdResolver::new(&ScanConfig::default());

        let tests = vec![
            TestCase {
                // TC0: midday, $15, low volatility
                input: context(MarketPeriod::Midday, PriceBucket::Low, VolatilityClass::Low, 15.0),
                expected_pct: 1.5,
                expected_mode: SurgeMode::Or,
            },
            TestCase {
                // TC1: opening, $450, high volatility
                input: context(
                    MarketPeriod::Opening,
                    PriceBucket::High,
                    VolatilityClass::High,
                    450.0,
                ),
                expected_pct: 0.7,
                expected_mode: SurgeMode::Strict,
            },
            TestCase {
                // TC2: premarket penny stock keeps the period threshold
                input: context(
                    MarketPeriod::Premarket,
                    PriceBucket::Penny,
                    VolatilityClass::Normal,
                    2.0,
                ),
                expected_pct: 3.0,
                expected_mode: SurgeMode::Adaptive,
            },
            TestCase {
                // TC3: closed market is strict
                input: context(MarketPeriod::Closed, PriceBucket::Ultra, VolatilityClass::Normal, 900.0),
                expected_pct: 0.5,
                expected_mode: SurgeMode::Strict,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = resolver.resolve_context(&test.input);
            assert!(
                approx_eq(actual.surge.price_threshold_pct, test.expected_pct),
                "TC{} failed: {}",
                index,
                actual.surge.price_threshold_pct
            );
            assert_eq!(actual.surge.mode, test.expected_mode, "TC{} failed", index);
        }
    }

    #[test]
    fn test_resolve_trend_thresholds() {
        let resolver = ThresholdResolver::new(&ScanConfig::default());

        let midday = resolver.resolve_context(&context(
            MarketPeriod::Midday,
            PriceBucket::High,
            VolatilityClass::Normal,
            150.0,
        ));
        assert!(approx_eq(midday.trend.direction_threshold, 0.008));
        assert!(approx_eq(midday.trend.strength_threshold, 0.016));
        assert_eq!(midday.trend.min_history_points, 5);
        assert!(approx_eq(midday.trend.retracement_fraction, 0.36));

        let penny_premarket = resolver.resolve_context(&context(
            MarketPeriod::Premarket,
            PriceBucket::Penny,
            VolatilityClass::High,
            1.0,
        ));
        assert!(approx_eq(penny_premarket.trend.direction_threshold, 0.0075));
        // 0.8 * 1.25 clamps to the upper bound
        assert!(approx_eq(penny_premarket.trend.retracement_fraction, 0.8));
    }

    #[test]
    fn test_resolve_high_low_market_factor() {
        let resolver = ThresholdResolver::new(&ScanConfig::default());

        let factor = |period| {
            resolver
                .resolve_context(&context(period, PriceBucket::Mid, VolatilityClass::Normal, 50.0))
                .high_low
                .market_factor
        };

        assert!(approx_eq(factor(MarketPeriod::Premarket), 2.0));
        assert!(approx_eq(factor(MarketPeriod::Opening), 1.5));
        assert!(approx_eq(factor(MarketPeriod::Midday), 1.0));
        assert!(approx_eq(factor(MarketPeriod::Afterhours), 2.0));
    }

    #[test]
    fn test_classify_volatility() {
        struct TestCase {
            input: Vec<f64>,
            expected: VolatilityClass,
        }

        let resolver = ThresholdResolver::new(&ScanConfig::default());

        let tests = vec![
            TestCase {
                // TC0: flat prices
                input: vec![100.0; 20],
                expected: VolatilityClass::Low,
            },
            TestCase {
                // TC1: +/- 2% swings
                input: (0..20).map(|i| if i % 2 == 0 { 98.0 } else { 102.0 }).collect(),
                expected: VolatilityClass::High,
            },
            TestCase {
                // TC2: +/- 0.5% swings
                input: (0..20).map(|i| if i % 2 == 0 { 99.5 } else { 100.5 }).collect(),
                expected: VolatilityClass::Normal,
            },
            TestCase {
                // TC3: insufficient history
                input: vec![100.0],
                expected: VolatilityClass::Normal,
            },
            TestCase {
                // TC4: only the last window_points prices count
                input: (0..40)
                    .map(|i| if i < 20 { if i % 2 == 0 { 50.0 } else { 150.0 } } else { 100.0 })
                    .collect(),
                expected: VolatilityClass::Low,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = resolver.classify_volatility(&test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let resolver = ThresholdResolver::new(&ScanConfig::default());
        let at = Utc.with_ymd_and_hms(2024, 7, 9, 16, 0, 0).unwrap();
        let prices = [14.9, 15.0, 15.05, 15.02, 15.1];

        let first = resolver.resolve(15.0, at, &prices);
        let second = resolver.resolve(15.0, at, &prices);
        assert_eq!(first, second);
        assert_eq!(first.context.period, MarketPeriod::Midday);
        assert_eq!(first.context.bucket, PriceBucket::Low);

        // Resolving the recorded context reproduces the same snapshot
        assert_eq!(resolver.resolve_context(&first.context), first);
    }

    #[test]
    fn test_global_sensitivity_scales_thresholds() {
        let mut config = ScanConfig::default();
        config.thresholds.global_sensitivity = 2.0;
        let resolver = ThresholdResolver::new(&config);

        let resolved = resolver.resolve_context(&context(
            MarketPeriod::Midday,
            PriceBucket::Low,
            VolatilityClass::Normal,
            15.0,
        ));
        assert!(approx_eq(resolved.surge.price_threshold_pct, 2.0));
        assert!(approx_eq(resolved.surge.volume_multiplier, 4.0));
        assert!(approx_eq(resolved.trend.direction_threshold, 0.016));
    }
}
