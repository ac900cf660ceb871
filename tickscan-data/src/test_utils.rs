use crate::event::{
    DetectionEvent, Direction, EventKind, HighLowThresholds, MarketPeriod, PriceBucket, Strength,
    Symbol, ThresholdContext, ThresholdsUsed, VolatilityClass,
};
use chrono::{DateTime, TimeZone, Utc};

/// 2024-07-09 16:00:00 UTC, midday in New York.
pub fn midday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 9, 16, 0, 0).unwrap()
}

pub fn detection_event(kind: EventKind, symbol: &str, price: f64) -> DetectionEvent {
    DetectionEvent::new(
        kind,
        Symbol::new(symbol),
        price,
        midday(),
        Direction::Up,
        0.5,
        Strength::Moderate,
        ThresholdContext {
            period: MarketPeriod::Midday,
            bucket: PriceBucket::High,
            volatility: VolatilityClass::Normal,
            price,
        },
        ThresholdsUsed::HighLow(HighLowThresholds {
            min_percent: 0.05,
            min_dollar: 0.05,
            market_factor: 1.0,
            cooldown_ms: 1_000,
        }),
    )
}
