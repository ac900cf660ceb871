//! Startup configuration for the detection pipeline.
//!
//! Loaded once, validated eagerly, immutable for the lifetime of the process. Every section
//! falls back to its [`Default`] so a partial JSON document only overrides what it names.

use crate::{
    error::ConfigError,
    event::{MarketPeriod, PriceBucket, Symbol, SurgeMode, VolatilityClass},
    router::queue::Priority,
};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    pub clock: ClockConfig,
    pub thresholds: ThresholdConfig,
    pub high_low: HighLowConfig,
    pub trend: TrendConfig,
    pub surge: SurgeConfig,
    pub state: StateConfig,
    pub router: RouterConfig,
    pub broadcast: BroadcastConfig,
    pub sink: SinkConfig,
}

impl ScanConfig {
    /// Load a JSON configuration file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config = serde_json::from_str::<Self>(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every table for internal consistency.
    ///
    /// A process must never start with thresholds that silently suppress detection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.clock.validate()?;
        self.thresholds.validate()?;
        self.high_low.validate()?;
        self.trend.validate()?;
        self.surge.validate()?;
        self.state.validate()?;
        self.router.validate()?;
        self.broadcast.validate()?;
        self.sink.validate()
    }
}

fn ensure_positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be > 0, got {value}")))
    }
}

fn ensure_nonzero(field: &str, value: u64) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be > 0"))
    }
}

fn ensure_fraction(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("must be within [0, 1], got {value}"),
        ))
    }
}

fn ensure_weights(field: &str, weights: &[f64]) -> Result<(), ConfigError> {
    for weight in weights {
        ensure_fraction(field, *weight)?;
    }
    let total = weights.iter().sum::<f64>();
    if (total - 1.0).abs() > 1e-6 {
        return Err(ConfigError::invalid(
            field,
            format!("weights must sum to 1.0, got {total}"),
        ));
    }
    Ok(())
}

/// Exchange-local time conversion.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Standard-time offset from UTC, eg/ -300 for US Eastern.
    pub utc_offset_minutes: i32,
    /// Apply US daylight saving rules (second Sunday of March to first Sunday of November).
    pub observe_us_dst: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: -300,
            observe_us_dst: true,
        }
    }
}

impl ClockConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.utc_offset_minutes.abs() > 14 * 60 {
            return Err(ConfigError::invalid(
                "clock.utc_offset_minutes",
                "must be within +/- 14 hours",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub global_sensitivity: f64,
    pub windows: PeriodWindows,
    pub periods: PeriodTable,
    pub buckets: BucketTable,
    pub volatility: VolatilityConfig,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            global_sensitivity: 1.0,
            windows: PeriodWindows::default(),
            periods: PeriodTable::default(),
            buckets: BucketTable::default(),
            volatility: VolatilityConfig::default(),
        }
    }
}

impl ThresholdConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("thresholds.global_sensitivity", self.global_sensitivity)?;
        self.windows.validate()?;
        self.periods.validate()?;
        self.buckets.validate()?;
        self.volatility.validate()
    }
}

/// Exchange-local start times of each [`MarketPeriod`]. Anything outside
/// `premarket_open..afterhours_close` is [`MarketPeriod::Closed`].
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PeriodWindows {
    pub premarket_open: NaiveTime,
    pub market_open: NaiveTime,
    pub midday_start: NaiveTime,
    pub closing_start: NaiveTime,
    pub market_close: NaiveTime,
    pub afterhours_close: NaiveTime,
}

impl Default for PeriodWindows {
    fn default() -> Self {
        let hm = |hour, minute| NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default();
        Self {
            premarket_open: hm(4, 0),
            market_open: hm(9, 30),
            midday_start: hm(10, 30),
            closing_start: hm(15, 0),
            market_close: hm(16, 0),
            afterhours_close: hm(20, 0),
        }
    }
}

impl PeriodWindows {
    fn validate(&self) -> Result<(), ConfigError> {
        let ordered = [
            self.premarket_open,
            self.market_open,
            self.midday_start,
            self.closing_start,
            self.market_close,
            self.afterhours_close,
        ];
        if ordered.windows(2).all(|pair| pair[0] < pair[1]) {
            Ok(())
        } else {
            Err(ConfigError::invalid(
                "thresholds.windows",
                "period start times must be strictly ascending",
            ))
        }
    }
}

/// Base thresholds for one [`MarketPeriod`].
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct PeriodProfile {
    /// Market-awareness factor applied to high/low thresholds.
    pub sensitivity: f64,
    pub surge_price_pct: f64,
    pub surge_volume_multiplier: f64,
    pub surge_lookback_secs: u64,
    pub surge_mode: SurgeMode,
    pub trend_direction_threshold: f64,
    pub trend_min_history_points: usize,
    pub trend_warmup_secs: u64,
    pub trend_min_emission_interval_secs: u64,
    pub trend_retracement_fraction: f64,
}

impl PeriodProfile {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let field = |suffix: &str| format!("thresholds.periods.{name}.{suffix}");
        ensure_positive(&field("sensitivity"), self.sensitivity)?;
        ensure_positive(&field("surge_price_pct"), self.surge_price_pct)?;
        ensure_positive(&field("surge_volume_multiplier"), self.surge_volume_multiplier)?;
        ensure_nonzero(&field("surge_lookback_secs"), self.surge_lookback_secs)?;
        ensure_positive(&field("trend_direction_threshold"), self.trend_direction_threshold)?;
        if self.trend_min_history_points < 2 {
            return Err(ConfigError::invalid(
                field("trend_min_history_points"),
                "must be >= 2",
            ));
        }
        ensure_fraction(&field("trend_retracement_fraction"), self.trend_retracement_fraction)
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PeriodTable {
    pub premarket: PeriodProfile,
    pub opening: PeriodProfile,
    pub midday: PeriodProfile,
    pub closing: PeriodProfile,
    pub afterhours: PeriodProfile,
    pub closed: PeriodProfile,
}

impl PeriodTable {
    pub fn get(&self, period: MarketPeriod) -> &PeriodProfile {
        match period {
            MarketPeriod::Premarket => &self.premarket,
            MarketPeriod::Opening => &self.opening,
            MarketPeriod::Midday => &self.midday,
            MarketPeriod::Closing => &self.closing,
            MarketPeriod::Afterhours => &self.afterhours,
            MarketPeriod::Closed => &self.closed,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.premarket.validate("premarket")?;
        self.opening.validate("opening")?;
        self.midday.validate("midday")?;
        self.closing.validate("closing")?;
        self.afterhours.validate("afterhours")?;
        self.closed.validate("closed")
    }
}

impl Default for PeriodTable {
    fn default() -> Self {
        let extended = PeriodProfile {
            sensitivity: 2.0,
            surge_price_pct: 3.0,
            surge_volume_multiplier: 4.0,
            surge_lookback_secs: 10,
            surge_mode: SurgeMode::Adaptive,
            trend_direction_threshold: 0.015,
            trend_min_history_points: 10,
            trend_warmup_secs: 180,
            trend_min_emission_interval_secs: 120,
            trend_retracement_fraction: 0.8,
        };

        Self {
            premarket: extended,
            opening: PeriodProfile {
                sensitivity: 1.5,
                surge_price_pct: 2.0,
                surge_volume_multiplier: 3.0,
                surge_lookback_secs: 2,
                surge_mode: SurgeMode::Strict,
                trend_direction_threshold: 0.012,
                trend_min_history_points: 3,
                trend_warmup_secs: 20,
                trend_min_emission_interval_secs: 20,
                trend_retracement_fraction: 0.6,
            },
            midday: PeriodProfile {
                sensitivity: 1.0,
                surge_price_pct: 1.0,
                surge_volume_multiplier: 2.0,
                surge_lookback_secs: 5,
                surge_mode: SurgeMode::Or,
                trend_direction_threshold: 0.008,
                trend_min_history_points: 5,
                trend_warmup_secs: 30,
                trend_min_emission_interval_secs: 60,
                trend_retracement_fraction: 0.4,
            },
            closing: PeriodProfile {
                sensitivity: 1.0,
                surge_price_pct: 1.5,
                surge_volume_multiplier: 2.5,
                surge_lookback_secs: 3,
                surge_mode: SurgeMode::Strict,
                trend_direction_threshold: 0.010,
                trend_min_history_points: 4,
                trend_warmup_secs: 45,
                trend_min_emission_interval_secs: 30,
                trend_retracement_fraction: 0.5,
            },
            afterhours: extended,
            closed: PeriodProfile {
                surge_volume_multiplier: 5.0,
                surge_mode: SurgeMode::Strict,
                trend_direction_threshold: 0.02,
                ..extended
            },
        }
    }
}

/// Base thresholds for one [`PriceBucket`].
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct BucketProfile {
    pub surge_price_pct: f64,
    pub trend_direction_threshold: f64,
    pub high_low_min_percent: f64,
    pub high_low_min_dollar: f64,
    /// Multiplier applied to the period retracement fraction.
    pub retracement_adjust: f64,
}

impl BucketProfile {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let field = |suffix: &str| format!("thresholds.buckets.{name}.{suffix}");
        ensure_positive(&field("surge_price_pct"), self.surge_price_pct)?;
        ensure_positive(&field("trend_direction_threshold"), self.trend_direction_threshold)?;
        ensure_positive(&field("high_low_min_percent"), self.high_low_min_percent)?;
        ensure_positive(&field("high_low_min_dollar"), self.high_low_min_dollar)?;
        ensure_positive(&field("retracement_adjust"), self.retracement_adjust)
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BucketTable {
    /// Upper price bounds (exclusive) of PENNY, LOW, MID and HIGH; anything above is ULTRA.
    pub boundaries: [f64; 4],
    pub penny: BucketProfile,
    pub low: BucketProfile,
    pub mid: BucketProfile,
    pub high: BucketProfile,
    pub ultra: BucketProfile,
}

impl BucketTable {
    pub fn classify(&self, price: f64) -> PriceBucket {
        let [penny, low, mid, high] = self.boundaries;
        if price < penny {
            PriceBucket::Penny
        } else if price < low {
            PriceBucket::Low
        } else if price < mid {
            PriceBucket::Mid
        } else if price < high {
            PriceBucket::High
        } else {
            PriceBucket::Ultra
        }
    }

    pub fn get(&self, bucket: PriceBucket) -> &BucketProfile {
        match bucket {
            PriceBucket::Penny => &self.penny,
            PriceBucket::Low => &self.low,
            PriceBucket::Mid => &self.mid,
            PriceBucket::High => &self.high,
            PriceBucket::Ultra => &self.ultra,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for boundary in self.boundaries {
            ensure_positive("thresholds.buckets.boundaries", boundary)?;
        }
        if !self.boundaries.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(ConfigError::invalid(
                "thresholds.buckets.boundaries",
                "must be strictly ascending",
            ));
        }
        self.penny.validate("penny")?;
        self.low.validate("low")?;
        self.mid.validate("mid")?;
        self.high.validate("high")?;
        self.ultra.validate("ultra")
    }
}

impl Default for BucketTable {
    fn default() -> Self {
        Self {
            boundaries: [5.0, 20.0, 100.0, 500.0],
            penny: BucketProfile {
                surge_price_pct: 5.0,
                trend_direction_threshold: 0.02,
                high_low_min_percent: 0.5,
                high_low_min_dollar: 0.01,
                retracement_adjust: 1.25,
            },
            low: BucketProfile {
                surge_price_pct: 2.0,
                trend_direction_threshold: 0.012,
                high_low_min_percent: 0.2,
                high_low_min_dollar: 0.02,
                retracement_adjust: 1.1,
            },
            mid: BucketProfile {
                surge_price_pct: 1.5,
                trend_direction_threshold: 0.010,
                high_low_min_percent: 0.1,
                high_low_min_dollar: 0.05,
                retracement_adjust: 1.0,
            },
            high: BucketProfile {
                surge_price_pct: 1.0,
                trend_direction_threshold: 0.008,
                high_low_min_percent: 0.05,
                high_low_min_dollar: 0.05,
                retracement_adjust: 0.9,
            },
            ultra: BucketProfile {
                surge_price_pct: 0.5,
                trend_direction_threshold: 0.006,
                high_low_min_percent: 0.03,
                high_low_min_dollar: 0.25,
                retracement_adjust: 0.8,
            },
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct VolatilityMultipliers {
    pub high: f64,
    pub normal: f64,
    pub low: f64,
}

impl VolatilityMultipliers {
    pub fn get(&self, class: VolatilityClass) -> f64 {
        match class {
            VolatilityClass::High => self.high,
            VolatilityClass::Normal => self.normal,
            VolatilityClass::Low => self.low,
        }
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        ensure_positive(&format!("{field}.high"), self.high)?;
        ensure_positive(&format!("{field}.normal"), self.normal)?;
        ensure_positive(&format!("{field}.low"), self.low)
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct VolatilityConfig {
    /// Number of most recent prices the coefficient of variation is measured over.
    pub window_points: usize,
    /// Coefficient of variation at or above which volatility is HIGH.
    pub high_cv: f64,
    /// Coefficient of variation at or below which volatility is LOW.
    pub low_cv: f64,
    pub trend: VolatilityMultipliers,
    pub surge: VolatilityMultipliers,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            window_points: 20,
            high_cv: 0.01,
            low_cv: 0.002,
            trend: VolatilityMultipliers {
                high: 0.5,
                normal: 1.0,
                low: 2.0,
            },
            surge: VolatilityMultipliers {
                high: 0.7,
                normal: 1.0,
                low: 1.5,
            },
        }
    }
}

impl VolatilityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_points < 2 {
            return Err(ConfigError::invalid(
                "thresholds.volatility.window_points",
                "must be >= 2",
            ));
        }
        ensure_positive("thresholds.volatility.high_cv", self.high_cv)?;
        ensure_positive("thresholds.volatility.low_cv", self.low_cv)?;
        if self.low_cv >= self.high_cv {
            return Err(ConfigError::invalid(
                "thresholds.volatility",
                "low_cv must be below high_cv",
            ));
        }
        self.trend.validate("thresholds.volatility.trend")?;
        self.surge.validate("thresholds.volatility.surge")
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct HighLowConfig {
    pub cooldown_ms: u64,
    /// Weight of the volume component in the significance score.
    pub volume_weight: f64,
    /// Percent change worth the full 50 price points.
    pub pct_for_max_points: f64,
    /// Volume relative to its rolling average worth the full 50 volume points.
    pub volume_ratio_for_max_points: f64,
    pub reversal: ReversalConfig,
}

impl Default for HighLowConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 1_000,
            volume_weight: 0.5,
            pct_for_max_points: 5.0,
            volume_ratio_for_max_points: 2.0,
            reversal: ReversalConfig::default(),
        }
    }
}

impl HighLowConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        ensure_fraction("high_low.volume_weight", self.volume_weight)?;
        ensure_positive("high_low.pct_for_max_points", self.pct_for_max_points)?;
        ensure_positive(
            "high_low.volume_ratio_for_max_points",
            self.volume_ratio_for_max_points,
        )?;
        self.reversal.validate()
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ReversalConfig {
    pub window_secs: u64,
    pub rapid_secs: u64,
    /// Minimum percent swing for a pivot to count.
    pub min_swing_pct: f64,
    /// Maximum percent difference between the two extremes of an M-top or W-bottom.
    pub double_tolerance_pct: f64,
}

impl Default for ReversalConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            rapid_secs: 60,
            min_swing_pct: 0.3,
            double_tolerance_pct: 0.5,
        }
    }
}

impl ReversalConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        ensure_nonzero("high_low.reversal.window_secs", self.window_secs)?;
        if self.rapid_secs > self.window_secs {
            return Err(ConfigError::invalid(
                "high_low.reversal.rapid_secs",
                "must not exceed window_secs",
            ));
        }
        ensure_positive("high_low.reversal.min_swing_pct", self.min_swing_pct)?;
        ensure_positive(
            "high_low.reversal.double_tolerance_pct",
            self.double_tolerance_pct,
        )
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Short, medium and long analysis windows.
    pub window_secs: [u64; 3],
    pub window_weights: [f64; 3],
    pub momentum_weight: f64,
    pub vwap_weight: f64,
    pub volume_weight: f64,
    /// Recency decay applied per step when weighting momentum returns.
    pub momentum_decay: f64,
    pub moderate_multiple: f64,
    pub strong_multiple: f64,
    pub retracement_min: f64,
    pub retracement_max: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            window_secs: [180, 360, 600],
            window_weights: [0.3, 0.4, 0.3],
            momentum_weight: 0.5,
            vwap_weight: 0.3,
            volume_weight: 0.2,
            momentum_decay: 0.9,
            moderate_multiple: 1.5,
            strong_multiple: 2.0,
            retracement_min: 0.2,
            retracement_max: 0.8,
        }
    }
}

impl TrendConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_secs[0] == 0 || !self.window_secs.windows(2).all(|w| w[0] < w[1]) {
            return Err(ConfigError::invalid(
                "trend.window_secs",
                "must be non-zero and strictly ascending",
            ));
        }
        ensure_weights("trend.window_weights", &self.window_weights)?;
        ensure_weights(
            "trend component weights",
            &[self.momentum_weight, self.vwap_weight, self.volume_weight],
        )?;
        ensure_fraction("trend.momentum_decay", self.momentum_decay)?;
        if !(1.0 < self.moderate_multiple && self.moderate_multiple < self.strong_multiple) {
            return Err(ConfigError::invalid(
                "trend strength multiples",
                "require 1.0 < moderate_multiple < strong_multiple",
            ));
        }
        ensure_fraction("trend.retracement_min", self.retracement_min)?;
        ensure_fraction("trend.retracement_max", self.retracement_max)?;
        if self.retracement_min > self.retracement_max {
            return Err(ConfigError::invalid(
                "trend.retracement_min",
                "must not exceed retracement_max",
            ));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SurgeConfig {
    pub cooldown_secs: u64,
    /// Adaptive mode: ratio of threshold a dominant axis must reach.
    pub strong_ratio: f64,
    /// Adaptive mode: ratio of threshold the weaker axis must still reach.
    pub partial_ratio: f64,
    /// Cap on each of the price and volume score components.
    pub component_cap: f64,
    pub moderate_score: f64,
    pub strong_score: f64,
}

impl Default for SurgeConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            strong_ratio: 1.5,
            partial_ratio: 0.7,
            component_cap: 50.0,
            moderate_score: 60.0,
            strong_score: 80.0,
        }
    }
}

impl SurgeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.strong_ratio < 1.0 {
            return Err(ConfigError::invalid("surge.strong_ratio", "must be >= 1.0"));
        }
        ensure_fraction("surge.partial_ratio", self.partial_ratio)?;
        ensure_positive("surge.component_cap", self.component_cap)?;
        if !(0.0 < self.moderate_score && self.moderate_score < self.strong_score) {
            return Err(ConfigError::invalid(
                "surge scores",
                "require 0 < moderate_score < strong_score",
            ));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StateConfig {
    pub history_capacity: usize,
    pub surge_capacity: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            history_capacity: 300,
            surge_capacity: 20,
        }
    }
}

impl StateConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity < 10 {
            return Err(ConfigError::invalid("state.history_capacity", "must be >= 10"));
        }
        if self.surge_capacity < 3 {
            return Err(ConfigError::invalid("state.surge_capacity", "must be >= 3"));
        }
        Ok(())
    }
}

/// Default [`Priority`] per tick kind.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct KindPriorities {
    pub aggregate: Priority,
    pub trade: Priority,
    pub quote: Priority,
}

impl Default for KindPriorities {
    fn default() -> Self {
        Self {
            aggregate: Priority::Normal,
            trade: Priority::High,
            quote: Priority::Low,
        }
    }
}

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Backlog capacity per channel, split evenly across its workers.
    pub channel_capacity: usize,
    /// Backlog depth per channel at which load shedding starts.
    pub high_water_mark: usize,
    pub workers_per_channel: usize,
    pub priorities: KindPriorities,
    /// Symbols always routed at [`Priority::Critical`].
    pub priority_symbols: Vec<Symbol>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 10_000,
            high_water_mark: 8_000,
            workers_per_channel: 4,
            priorities: KindPriorities::default(),
            priority_symbols: Vec::new(),
        }
    }
}

impl RouterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        ensure_nonzero("router.workers_per_channel", self.workers_per_channel as u64)?;
        ensure_nonzero("router.channel_capacity", self.channel_capacity as u64)?;
        if self.high_water_mark == 0 || self.high_water_mark > self.channel_capacity {
            return Err(ConfigError::invalid(
                "router.high_water_mark",
                "must be within 1..=channel_capacity",
            ));
        }
        if self.high_water_mark < self.workers_per_channel {
            return Err(ConfigError::invalid(
                "router.high_water_mark",
                "must allow at least one queued tick per worker",
            ));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub batch_window_ms: u64,
    pub max_batch_size: usize,
    /// Per-connection backlog; a connection that fills it is disconnected.
    pub outbox_capacity: usize,
    pub max_batches_per_sec: f64,
    pub write_timeout_ms: u64,
    pub write_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_consecutive_failures: u32,
    /// Capacity of each egress category channel.
    pub egress_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 50,
            max_batch_size: 100,
            outbox_capacity: 1_024,
            max_batches_per_sec: 20.0,
            write_timeout_ms: 2_000,
            write_attempts: 3,
            retry_backoff_ms: 50,
            max_consecutive_failures: 5,
            egress_capacity: 10_000,
        }
    }
}

impl BroadcastConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        ensure_nonzero("broadcast.batch_window_ms", self.batch_window_ms)?;
        ensure_nonzero("broadcast.max_batch_size", self.max_batch_size as u64)?;
        ensure_nonzero("broadcast.outbox_capacity", self.outbox_capacity as u64)?;
        ensure_positive("broadcast.max_batches_per_sec", self.max_batches_per_sec)?;
        ensure_nonzero("broadcast.write_timeout_ms", self.write_timeout_ms)?;
        ensure_nonzero("broadcast.write_attempts", self.write_attempts as u64)?;
        ensure_nonzero(
            "broadcast.max_consecutive_failures",
            self.max_consecutive_failures as u64,
        )?;
        ensure_nonzero("broadcast.egress_capacity", self.egress_capacity as u64)
    }
}

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SinkConfig {
    /// HTTP endpoint receiving flush batches; `None` logs batches instead.
    pub endpoint: Option<String>,
    pub flush_interval_secs: u64,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub max_buffered_events: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            flush_interval_secs: 30,
            timeout_ms: 5_000,
            max_attempts: 5,
            backoff_base_ms: 250,
            max_buffered_events: 10_000,
        }
    }
}

impl SinkConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(endpoint) = &self.endpoint {
            url::Url::parse(endpoint)
                .map_err(|error| ConfigError::invalid("sink.endpoint", error.to_string()))?;
        }
        ensure_nonzero("sink.flush_interval_secs", self.flush_interval_secs)?;
        ensure_nonzero("sink.timeout_ms", self.timeout_ms)?;
        ensure_nonzero("sink.max_attempts", self.max_attempts as u64)?;
        ensure_nonzero("sink.max_buffered_events", self.max_buffered_events as u64)
    }
}
