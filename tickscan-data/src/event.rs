//! Shared data types flowing through every layer: inbound [`Tick`]s, outbound
//! [`DetectionEvent`]s and the [`ThresholdContext`] they were detected under.
//!
//! This module depends on nothing else in the crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

/// Ticker symbol, eg/ "AAPL".
pub type Symbol = SmolStr;

/// Declared data type of an inbound [`Tick`], used to route it to a processing channel.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    Aggregate,
    Trade,
    Quote,
}

impl TickKind {
    pub const ALL: [TickKind; 3] = [TickKind::Aggregate, TickKind::Trade, TickKind::Quote];

    pub fn as_str(&self) -> &'static str {
        match self {
            TickKind::Aggregate => "aggregate",
            TickKind::Trade => "trade",
            TickKind::Quote => "quote",
        }
    }
}

impl std::fmt::Display for TickKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trading session a [`Tick`] belongs to.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTag {
    Pre,
    Regular,
    Post,
}

impl SessionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionTag::Pre => "pre",
            SessionTag::Regular => "regular",
            SessionTag::Post => "post",
        }
    }
}

/// Normalised price/volume observation for a single symbol.
///
/// Produced by the ingress bridge, consumed once by the detection pipeline.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
    pub kind: TickKind,
    pub session: SessionTag,
    pub source: Option<SmolStr>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub vwap: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
}

impl Tick {
    /// Construct a regular-session [`Tick`] with no optional fields populated.
    pub fn new(
        symbol: impl Into<Symbol>,
        kind: TickKind,
        price: f64,
        volume: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume,
            timestamp,
            kind,
            session: SessionTag::Regular,
            source: None,
            open: None,
            high: None,
            low: None,
            close: None,
            vwap: None,
            bid: None,
            ask: None,
        }
    }

    pub fn with_session(mut self, session: SessionTag) -> Self {
        self.session = session;
        self
    }

    pub fn with_open(mut self, open: f64) -> Self {
        self.open = Some(open);
        self
    }

    pub fn with_vwap(mut self, vwap: f64) -> Self {
        self.vwap = Some(vwap);
        self
    }
}

/// Kind of market micro-event detected.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    High,
    Low,
    Trend,
    Surge,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::High,
        EventKind::Low,
        EventKind::Trend,
        EventKind::Surge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::High => "high",
            EventKind::Low => "low",
            EventKind::Trend => "trend",
            EventKind::Surge => "surge",
        }
    }

    /// Single-bit mask used by the subscription index.
    pub fn bit(&self) -> u8 {
        match self {
            EventKind::High => 0b0001,
            EventKind::Low => 0b0010,
            EventKind::Trend => 0b0100,
            EventKind::Surge => 0b1000,
        }
    }

    /// Egress [`EventCategory`] this kind is published on.
    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::Trend => EventCategory::INDICATOR,
            EventKind::High | EventKind::Low | EventKind::Surge => EventCategory::PATTERN,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "high" | "highs" => Ok(EventKind::High),
            "low" | "lows" => Ok(EventKind::Low),
            "trend" | "trends" => Ok(EventKind::Trend),
            "surge" | "surges" => Ok(EventKind::Surge),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Logical egress channel a [`DetectionEvent`] is published on.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct EventCategory(pub &'static str);

impl EventCategory {
    /// Price pattern events: session highs/lows and surges.
    pub const PATTERN: Self = Self("pattern");

    /// Indicator events: trends.
    pub const INDICATOR: Self = Self("indicator");

    pub const ALL: [EventCategory; 2] = [EventCategory::PATTERN, EventCategory::INDICATOR];
}

impl AsRef<str> for EventCategory {
    fn as_ref(&self) -> &str {
        self.0
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    #[default]
    Neutral,
}

impl Direction {
    pub fn from_sign(value: f64) -> Self {
        if value > 0.0 {
            Direction::Up
        } else if value < 0.0 {
            Direction::Down
        } else {
            Direction::Neutral
        }
    }

    pub fn is_directional(&self) -> bool {
        !matches!(self, Direction::Neutral)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strength {
    Weak,
    Moderate,
    Strong,
}

/// Time-of-day trading phase in exchange-local time.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketPeriod {
    Premarket,
    Opening,
    Midday,
    Closing,
    Afterhours,
    Closed,
}

impl MarketPeriod {
    pub fn is_extended_hours(&self) -> bool {
        matches!(self, MarketPeriod::Premarket | MarketPeriod::Afterhours)
    }

    /// Session tag implied by this period, used when a tick does not declare one.
    pub fn session(&self) -> SessionTag {
        match self {
            MarketPeriod::Premarket => SessionTag::Pre,
            MarketPeriod::Opening | MarketPeriod::Midday | MarketPeriod::Closing => {
                SessionTag::Regular
            }
            MarketPeriod::Afterhours | MarketPeriod::Closed => SessionTag::Post,
        }
    }
}

/// Classification of a symbol by absolute price level.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceBucket {
    Penny,
    Low,
    Mid,
    High,
    Ultra,
}

/// Recent price volatility regime.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolatilityClass {
    High,
    Normal,
    Low,
}

/// Inputs the adaptive thresholds were resolved from.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ThresholdContext {
    pub period: MarketPeriod,
    pub bucket: PriceBucket,
    pub volatility: VolatilityClass,
    pub price: f64,
}

/// How price and volume breaches combine to trigger a surge.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurgeMode {
    /// Either breach triggers.
    Or,
    /// Both breaches are required.
    Strict,
    /// A strong breach on one axis compensates for a partial breach on the other.
    Adaptive,
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct TrendThresholds {
    pub direction_threshold: f64,
    pub strength_threshold: f64,
    pub sensitivity_multiplier: f64,
    pub min_history_points: usize,
    pub warmup_secs: u64,
    pub min_emission_interval_secs: u64,
    pub retracement_fraction: f64,
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct SurgeThresholds {
    pub price_threshold_pct: f64,
    pub volume_multiplier: f64,
    pub mode: SurgeMode,
    pub lookback_secs: u64,
    pub sensitivity_multiplier: f64,
    pub cooldown_secs: u64,
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct HighLowThresholds {
    pub min_percent: f64,
    pub min_dollar: f64,
    pub market_factor: f64,
    pub cooldown_ms: u64,
}

/// Snapshot of the thresholds a detector applied when it emitted an event.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ThresholdsUsed {
    HighLow(HighLowThresholds),
    Trend(TrendThresholds),
    Surge(SurgeThresholds),
}

/// Lightweight trend/surge context attached to high/low events.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct ContextFlags {
    pub trend: Option<Direction>,
    pub surge: Option<Direction>,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReversalPattern {
    VBottom,
    VTop,
    MTop,
    WBottom,
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ReversalInfo {
    pub pattern: ReversalPattern,
    /// Price of the swing point the reversal turned at.
    pub turn_price: f64,
    pub turn_time: DateTime<Utc>,
    pub secs_since_turn: f64,
    /// Percent move from the turning point to the current price.
    pub swing_pct: f64,
    pub rapid: bool,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SurgeTrigger {
    PriceDriven,
    VolumeDriven,
    Balanced,
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct SurgeDetails {
    pub trigger: SurgeTrigger,
    pub price_change_pct: f64,
    pub volume_multiplier: f64,
    pub reference_price: f64,
    pub reference_time: DateTime<Utc>,
}

/// Market micro-event emitted by a detector. Immutable once emitted.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct DetectionEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub symbol: Symbol,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    /// Percent change for high/low/surge events, combined score for trends.
    pub magnitude: f64,
    pub strength: Strength,
    /// Detector specific score: trend combined score or surge composite (0-100).
    pub score: f64,
    /// Cross-detector significance (0-100).
    pub significance: f64,
    pub flags: ContextFlags,
    pub reversal: Option<ReversalInfo>,
    pub surge: Option<SurgeDetails>,
    pub context: ThresholdContext,
    pub thresholds_used: ThresholdsUsed,
}

impl DetectionEvent {
    /// Construct a [`DetectionEvent`] with default flags and no optional metadata.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: EventKind,
        symbol: Symbol,
        price: f64,
        timestamp: DateTime<Utc>,
        direction: Direction,
        magnitude: f64,
        strength: Strength,
        context: ThresholdContext,
        thresholds_used: ThresholdsUsed,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            symbol,
            price,
            timestamp,
            direction,
            magnitude,
            strength,
            score: 0.0,
            significance: 0.0,
            flags: ContextFlags::default(),
            reversal: None,
            surge: None,
            context,
            thresholds_used,
        }
    }

    pub fn category(&self) -> EventCategory {
        self.kind.category()
    }
}
