use super::pct_change;
use crate::{
    config::ReversalConfig,
    event::{EventKind, ReversalInfo, ReversalPattern},
    state::window::PricePoint,
};
use chrono::{DateTime, Utc};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum PivotKind {
    Peak,
    Trough,
}

#[derive(Copy, Clone, PartialEq, Debug)]
struct Pivot {
    kind: PivotKind,
    price: f64,
    time: DateTime<Utc>,
}

impl Pivot {
    fn new(kind: PivotKind, point: &PricePoint) -> Self {
        Self {
            kind,
            price: point.price,
            time: point.timestamp,
        }
    }
}

/// Confirmed swing pivots, oldest first. A pivot is confirmed once price moves away from it
/// by at least `min_swing_pct`. The trailing leg is never included.
fn zigzag<'a>(points: impl IntoIterator<Item = &'a PricePoint>, min_swing_pct: f64) -> Vec<Pivot> {
    let mut points = points.into_iter();
    let Some(first) = points.next() else {
        return Vec::new();
    };

    let mut pivots = Vec::new();
    let mut leg: Option<PivotKind> = None;
    let (mut high, mut low, mut extreme) = (first, first, first);

    for point in points {
        match leg {
            None => {
                if point.price > high.price {
                    high = point;
                }
                if point.price < low.price {
                    low = point;
                }
                if point.price >= high.price && pct_change(low.price, point.price) >= min_swing_pct {
                    pivots.push(Pivot::new(PivotKind::Trough, low));
                    leg = Some(PivotKind::Peak);
                    extreme = point;
                } else if point.price <= low.price
                    && pct_change(high.price, point.price) <= -min_swing_pct
                {
                    pivots.push(Pivot::new(PivotKind::Peak, high));
                    leg = Some(PivotKind::Trough);
                    extreme = point;
                }
            }
            // Rising leg, searching for the next peak
            Some(PivotKind::Peak) => {
                if point.price >= extreme.price {
                    extreme = point;
                } else if pct_change(extreme.price, point.price) <= -min_swing_pct {
                    pivots.push(Pivot::new(PivotKind::Peak, extreme));
                    leg = Some(PivotKind::Trough);
                    extreme = point;
                }
            }
            // Falling leg, searching for the next trough
            Some(PivotKind::Trough) => {
                if point.price <= extreme.price {
                    extreme = point;
                } else if pct_change(extreme.price, point.price) >= min_swing_pct {
                    pivots.push(Pivot::new(PivotKind::Trough, extreme));
                    leg = Some(PivotKind::Peak);
                    extreme = point;
                }
            }
        }
    }

    pivots
}

/// Classify the reversal, if any, that led to a new session high or low at `price`.
///
/// `points` are the observations within the reversal window, oldest first, including the
/// tick that made the new extreme.
pub fn classify<'a>(
    points: impl IntoIterator<Item = &'a PricePoint>,
    kind: EventKind,
    price: f64,
    now: DateTime<Utc>,
    config: &ReversalConfig,
) -> Option<ReversalInfo> {
    let pivots = zigzag(points, config.min_swing_pct);

    let (turn_kind, pair_kind, double, single) = match kind {
        EventKind::High => (
            PivotKind::Trough,
            PivotKind::Peak,
            ReversalPattern::WBottom,
            ReversalPattern::VBottom,
        ),
        EventKind::Low => (
            PivotKind::Peak,
            PivotKind::Trough,
            ReversalPattern::MTop,
            ReversalPattern::VTop,
        ),
        EventKind::Trend | EventKind::Surge => return None,
    };

    let pattern = match pivots.as_slice() {
        [.., first, middle, turn]
            if first.kind == turn_kind
                && middle.kind == pair_kind
                && turn.kind == turn_kind
                && pct_change(first.price, turn.price).abs() <= config.double_tolerance_pct =>
        {
            double
        }
        [.., middle, turn] if middle.kind == pair_kind && turn.kind == turn_kind => single,
        _ => return None,
    };

    let turn = pivots.last()?;
    let secs_since_turn = (now - turn.time).num_milliseconds() as f64 / 1_000.0;

    Some(ReversalInfo {
        pattern,
        turn_price: turn.price,
        turn_time: turn.time,
        secs_since_turn,
        swing_pct: pct_change(turn.price, price).abs(),
        rapid: secs_since_turn < config.rapid_secs as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 9, 16, 0, 0).unwrap()
    }

    fn series(prices: &[(i64, f64)]) -> Vec<PricePoint> {
        prices
            .iter()
            .map(|(secs, price)| PricePoint {
                timestamp: base() + Duration::seconds(*secs),
                price: *price,
                volume: 100.0,
                vwap: *price,
            })
            .collect()
    }

    #[test]
    fn test_classify_reversal() {
        struct TestCase {
            kind: EventKind,
            input: Vec<(i64, f64)>,
            expected: Option<(ReversalPattern, bool)>,
        }

        let tests = vec![
            TestCase {
                // TC0: fall then rally to a new high is a V-bottom, turn 30s ago is rapid
                kind: EventKind::High,
                input: vec![(0, 100.0), (60, 101.0), (120, 99.0), (150, 101.5)],
                expected: Some((ReversalPattern::VBottom, true)),
            },
            TestCase {
                // TC1: two troughs within tolerance is a W-bottom
                kind: EventKind::High,
                input: vec![
                    (0, 100.0),
                    (30, 101.0),
                    (60, 99.0),
                    (90, 100.5),
                    (120, 99.1),
                    (240, 101.5),
                ],
                expected: Some((ReversalPattern::WBottom, false)),
            },
            TestCase {
                // TC2: rally then collapse to a new low is a V-top
                kind: EventKind::Low,
                input: vec![(0, 100.0), (30, 99.0), (60, 101.0), (200, 98.5)],
                expected: Some((ReversalPattern::VTop, false)),
            },
            TestCase {
                // TC3: two peaks within tolerance is an M-top
                kind: EventKind::Low,
                input: vec![
                    (0, 100.0),
                    (20, 99.0),
                    (40, 101.0),
                    (60, 100.0),
                    (80, 101.2),
                    (100, 98.0),
                ],
                expected: Some((ReversalPattern::MTop, true)),
            },
            TestCase {
                // TC4: monotonic climb has no reversal
                kind: EventKind::High,
                input: vec![(0, 100.0), (30, 100.5), (60, 101.0), (90, 101.5)],
                expected: None,
            },
            TestCase {
                // TC5: wiggles below the minimum swing are ignored
                kind: EventKind::High,
                input: vec![(0, 100.0), (30, 100.1), (60, 99.95), (90, 100.2)],
                expected: None,
            },
        ];

        let config = ReversalConfig::default();

        for (index, test) in tests.into_iter().enumerate() {
            let points = series(&test.input);
            let last = points.last().unwrap();
            let actual = classify(&points, test.kind, last.price, last.timestamp, &config)
                .map(|info| (info.pattern, info.rapid));
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_classify_reports_turn_point() {
        let points = series(&[(0, 100.0), (60, 101.0), (120, 99.0), (150, 101.5)]);
        let info = classify(
            &points,
            EventKind::High,
            101.5,
            base() + Duration::seconds(150),
            &ReversalConfig::default(),
        )
        .unwrap();

        assert_eq!(info.turn_price, 99.0);
        assert_eq!(info.turn_time, base() + Duration::seconds(120));
        assert_eq!(info.secs_since_turn, 30.0);
        assert!((info.swing_pct - 2.525_252_525).abs() < 1e-6);
    }
}
