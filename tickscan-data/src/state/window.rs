use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Single price/volume observation retained in a [`PriceWindow`].
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
    /// Session VWAP at the time of the observation.
    pub vwap: f64,
}

/// Calculate VWAP from `(price, volume)` pairs.
pub fn calculate_vwap(points: impl IntoIterator<Item = (f64, f64)>) -> Option<f64> {
    let (sum_pv, sum_v) = points
        .into_iter()
        .fold((0.0, 0.0), |(sum_pv, sum_v), (price, volume)| {
            (sum_pv + price * volume, sum_v + volume)
        });

    if sum_v > 0.0 {
        Some(sum_pv / sum_v)
    } else {
        None
    }
}

/// Bounded, time-ordered ring of [`PricePoint`]s with a running volume total.
#[derive(Debug, Clone)]
pub struct PriceWindow {
    capacity: usize,
    points: VecDeque<PricePoint>,
    total_volume: f64,
}

impl PriceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            points: VecDeque::with_capacity(capacity),
            total_volume: 0.0,
        }
    }

    pub fn push(&mut self, point: PricePoint) {
        if self.points.len() >= self.capacity {
            if let Some(evicted) = self.points.pop_front() {
                self.total_volume -= evicted.volume;
            }
        }

        self.total_volume += point.volume;
        self.points.push_back(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn latest(&self) -> Option<&PricePoint> {
        self.points.back()
    }

    pub fn oldest(&self) -> Option<&PricePoint> {
        self.points.front()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &PricePoint> + ExactSizeIterator {
        self.points.iter()
    }

    /// Points observed at or after `cutoff`, oldest first.
    pub fn since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl DoubleEndedIterator<Item = &PricePoint> + ExactSizeIterator {
        let start = self.points.partition_point(|point| point.timestamp < cutoff);
        self.points.range(start..)
    }

    /// Most recent `count` prices, oldest first.
    pub fn recent_prices(&self, count: usize) -> Vec<f64> {
        let skip = self.points.len().saturating_sub(count);
        self.points.iter().skip(skip).map(|point| point.price).collect()
    }

    /// Newest point at or before `target`, otherwise the oldest point retained.
    pub fn reference_at(&self, target: DateTime<Utc>) -> Option<&PricePoint> {
        let end = self.points.partition_point(|point| point.timestamp <= target);
        match end {
            0 => self.points.front(),
            end => self.points.get(end - 1),
        }
    }

    pub fn total_volume(&self) -> f64 {
        self.total_volume.max(0.0)
    }

    pub fn average_volume(&self) -> Option<f64> {
        if self.points.is_empty() {
            None
        } else {
            Some(self.total_volume() / self.points.len() as f64)
        }
    }

    /// Average volume of every point except the most recent one.
    pub fn baseline_volume(&self) -> Option<f64> {
        let latest = self.points.back()?;
        let count = self.points.len() - 1;
        if count == 0 {
            return None;
        }
        Some(((self.total_volume - latest.volume) / count as f64).max(0.0))
    }

    pub fn vwap(&self) -> Option<f64> {
        calculate_vwap(self.points.iter().map(|point| (point.price, point.volume)))
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.total_volume = 0.0;
    }
}

/// Cumulative session VWAP accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionVwap {
    sum_pv: f64,
    sum_v: f64,
}

impl SessionVwap {
    /// Accumulate an observation and return the updated VWAP.
    ///
    /// Zero volume sessions report the last price instead.
    pub fn update(&mut self, price: f64, volume: f64) -> f64 {
        self.sum_pv += price * volume;
        self.sum_v += volume;
        self.value().unwrap_or(price)
    }

    pub fn value(&self) -> Option<f64> {
        (self.sum_v > 0.0).then(|| self.sum_pv / self.sum_v)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn point(secs: i64, price: f64, volume: f64) -> PricePoint {
        PricePoint {
            timestamp: Utc.with_ymd_and_hms(2024, 7, 9, 16, 0, 0).unwrap() + Duration::seconds(secs),
            price,
            volume,
            vwap: price,
        }
    }

    #[test]
    fn test_price_window_evicts_oldest() {
        let mut window = PriceWindow::new(3);

        window.push(point(0, 100.0, 1.0));
        window.push(point(1, 101.0, 2.0));
        window.push(point(2, 99.0, 1.0));

        assert_eq!(window.len(), 3);
        assert_eq!(window.total_volume(), 4.0);
        assert_eq!(window.latest().map(|p| p.price), Some(99.0));

        let vwap = window.vwap().unwrap();
        assert!((vwap - 100.25).abs() < 0.01);

        window.push(point(3, 102.0, 1.0));
        assert_eq!(window.len(), 3);
        assert_eq!(window.oldest().map(|p| p.price), Some(101.0));
        assert_eq!(window.total_volume(), 4.0);
    }

    #[test]
    fn test_reference_at() {
        struct TestCase {
            input: i64,
            expected: Option<f64>,
        }

        let mut window = PriceWindow::new(10);
        window.push(point(0, 10.0, 1.0));
        window.push(point(5, 11.0, 1.0));
        window.push(point(10, 12.0, 1.0));

        let base = Utc.with_ymd_and_hms(2024, 7, 9, 16, 0, 0).unwrap();

        let tests = vec![
            TestCase {
                // TC0: exact match
                input: 5,
                expected: Some(11.0),
            },
            TestCase {
                // TC1: newest sample at or before the target
                input: 7,
                expected: Some(11.0),
            },
            TestCase {
                // TC2: target precedes every sample, fall back to the oldest
                input: -3,
                expected: Some(10.0),
            },
            TestCase {
                // TC3: target after every sample
                input: 60,
                expected: Some(12.0),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = window
                .reference_at(base + Duration::seconds(test.input))
                .map(|point| point.price);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }

        assert!(PriceWindow::new(3).reference_at(base).is_none());
    }

    #[test]
    fn test_since_and_baseline_volume() {
        let mut window = PriceWindow::new(10);
        window.push(point(0, 10.0, 100.0));
        window.push(point(30, 10.1, 200.0));
        window.push(point(60, 10.2, 900.0));

        let base = Utc.with_ymd_and_hms(2024, 7, 9, 16, 0, 0).unwrap();
        let recent = window
            .since(base + Duration::seconds(30))
            .map(|point| point.price)
            .collect::<Vec<_>>();
        assert_eq!(recent, vec![10.1, 10.2]);

        assert_eq!(window.baseline_volume(), Some(150.0));
        assert_eq!(window.recent_prices(2), vec![10.1, 10.2]);
    }

    #[test]
    fn test_session_vwap() {
        let mut vwap = SessionVwap::default();
        assert_eq!(vwap.update(10.0, 0.0), 10.0);
        assert_eq!(vwap.update(10.0, 100.0), 10.0);
        assert_eq!(vwap.update(12.0, 100.0), 11.0);

        vwap.reset();
        assert_eq!(vwap.value(), None);
    }

    #[test]
    fn test_calculate_vwap_empty() {
        assert_eq!(calculate_vwap(std::iter::empty()), None);
        assert_eq!(calculate_vwap([(10.0, 0.0)]), None);
    }
}
