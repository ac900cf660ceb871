use crate::{
    config::StateConfig,
    event::{Direction, EventKind, SessionTag, Symbol, Tick},
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Bounded price windows and VWAP accumulation.
pub mod window;

use window::{PricePoint, PriceWindow, SessionVwap};

/// Number of events emitted per [`EventKind`], plus ticks applied.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct EventCounters {
    pub ticks: u64,
    pub high: u64,
    pub low: u64,
    pub trend: u64,
    pub surge: u64,
}

impl EventCounters {
    pub fn record(&mut self, kind: EventKind) {
        match kind {
            EventKind::High => self.high += 1,
            EventKind::Low => self.low += 1,
            EventKind::Trend => self.trend += 1,
            EventKind::Surge => self.surge += 1,
        }
    }

    pub fn events(&self) -> u64 {
        self.high + self.low + self.trend + self.surge
    }

    pub fn merge(&mut self, other: &Self) {
        self.ticks += other.ticks;
        self.high += other.high;
        self.low += other.low;
        self.trend += other.trend;
        self.surge += other.surge;
    }
}

/// Last emission instant per detector, used for cooldown bookkeeping.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct LastEmissions {
    high: Option<DateTime<Utc>>,
    low: Option<DateTime<Utc>>,
    trend: Option<DateTime<Utc>>,
    surge: Option<DateTime<Utc>>,
}

impl LastEmissions {
    pub fn get(&self, kind: EventKind) -> Option<DateTime<Utc>> {
        match kind {
            EventKind::High => self.high,
            EventKind::Low => self.low,
            EventKind::Trend => self.trend,
            EventKind::Surge => self.surge,
        }
    }

    pub fn set(&mut self, kind: EventKind, at: DateTime<Utc>) {
        let slot = match kind {
            EventKind::High => &mut self.high,
            EventKind::Low => &mut self.low,
            EventKind::Trend => &mut self.trend,
            EventKind::Surge => &mut self.surge,
        };
        *slot = Some(at);
    }

    /// Determine if at least `cooldown_ms` has elapsed since `kind` last emitted.
    pub fn elapsed(&self, kind: EventKind, now: DateTime<Utc>, cooldown_ms: u64) -> bool {
        match self.get(kind) {
            Some(last) => (now - last).num_milliseconds() >= cooldown_ms as i64,
            None => true,
        }
    }
}

/// In-progress trend, tracked to measure retracement from its extreme.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct TrendTrack {
    pub direction: Direction,
    pub start_price: f64,
    pub extreme_price: f64,
    pub started_at: DateTime<Utc>,
}

impl TrendTrack {
    pub fn new(direction: Direction, start_price: f64, started_at: DateTime<Utc>) -> Self {
        Self {
            direction,
            start_price,
            extreme_price: start_price,
            started_at,
        }
    }

    /// Extend the extreme in the trend direction with a new price.
    pub fn observe(&mut self, price: f64) {
        match self.direction {
            Direction::Up => self.extreme_price = self.extreme_price.max(price),
            Direction::Down => self.extreme_price = self.extreme_price.min(price),
            Direction::Neutral => {}
        }
    }

    /// Fraction of the move from start to extreme that `price` has given back.
    pub fn retracement(&self, price: f64) -> f64 {
        let travelled = (self.extreme_price - self.start_price).abs();
        if travelled <= f64::EPSILON {
            return 0.0;
        }
        let given_back = match self.direction {
            Direction::Up => self.extreme_price - price,
            Direction::Down => price - self.extreme_price,
            Direction::Neutral => 0.0,
        };
        given_back.max(0.0) / travelled
    }
}

/// How applying a [`Tick`] changed the session extremes.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct TickUpdate {
    pub session_reset: bool,
    pub new_high: bool,
    pub new_low: bool,
}

/// Detection state for one symbol. Owned by the [`SymbolStateStore`] and only mutated through
/// its per-symbol lock.
#[derive(Debug, Clone)]
pub struct SymbolState {
    symbol: Symbol,
    history: PriceWindow,
    surge_ring: PriceWindow,
    session: Option<SessionTag>,
    session_high: Option<f64>,
    session_low: Option<f64>,
    previous_high: Option<f64>,
    previous_low: Option<f64>,
    pub(crate) high_anchor: Option<f64>,
    pub(crate) low_anchor: Option<f64>,
    pub(crate) last_emissions: LastEmissions,
    pub(crate) trend_track: Option<TrendTrack>,
    pub(crate) last_trend_direction: Option<Direction>,
    counters: EventCounters,
    first_tick_at: Option<DateTime<Utc>>,
    vwap: SessionVwap,
    last_update: TickUpdate,
}

impl SymbolState {
    pub fn new(symbol: Symbol, config: &StateConfig) -> Self {
        Self {
            symbol,
            history: PriceWindow::new(config.history_capacity),
            surge_ring: PriceWindow::new(config.surge_capacity),
            session: None,
            session_high: None,
            session_low: None,
            previous_high: None,
            previous_low: None,
            high_anchor: None,
            low_anchor: None,
            last_emissions: LastEmissions::default(),
            trend_track: None,
            last_trend_direction: None,
            counters: EventCounters::default(),
            first_tick_at: None,
            vwap: SessionVwap::default(),
            last_update: TickUpdate::default(),
        }
    }

    /// Apply a [`Tick`]: reset on session transitions, then update extremes, VWAP, history and
    /// the surge ring.
    pub fn apply_tick(&mut self, tick: &Tick) -> TickUpdate {
        let session_reset = match self.session {
            None => {
                self.seed(tick);
                false
            }
            Some(current) if is_session_transition(current, tick.session) => {
                debug!(
                    symbol = %self.symbol,
                    from = current.as_str(),
                    to = tick.session.as_str(),
                    "session transition, resetting extremes"
                );
                self.previous_high = self.session_high;
                self.previous_low = self.session_low;
                self.seed(tick);
                true
            }
            Some(_) => false,
        };
        self.session = Some(tick.session);

        let new_high = self.session_high.is_none_or(|high| tick.price > high);
        if new_high {
            self.session_high = Some(tick.price);
        }
        let new_low = self.session_low.is_none_or(|low| tick.price < low);
        if new_low {
            self.session_low = Some(tick.price);
        }

        // Feed supplied VWAP takes precedence over the locally accumulated one
        let session_vwap = self.vwap.update(tick.price, tick.volume);
        let vwap = tick
            .vwap
            .filter(|vwap| vwap.is_finite() && *vwap > 0.0)
            .unwrap_or(session_vwap);

        let point = PricePoint {
            timestamp: tick.timestamp,
            price: tick.price,
            volume: tick.volume,
            vwap,
        };
        self.history.push(point);
        self.surge_ring.push(point);
        self.counters.ticks += 1;

        self.last_update = TickUpdate {
            session_reset,
            new_high,
            new_low,
        };
        self.last_update
    }

    fn seed(&mut self, tick: &Tick) {
        let seed = tick.open.filter(|open| open.is_finite() && *open > 0.0).unwrap_or(tick.price);
        self.session_high = Some(seed);
        self.session_low = Some(seed);
        self.high_anchor = Some(seed);
        self.low_anchor = Some(seed);
        self.vwap.reset();
        self.trend_track = None;
        self.last_trend_direction = None;
        self.first_tick_at = Some(tick.timestamp);
    }

    /// Count an emitted event.
    pub fn record_event(&mut self, kind: EventKind) {
        self.counters.record(kind);
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn history(&self) -> &PriceWindow {
        &self.history
    }

    pub fn surge_ring(&self) -> &PriceWindow {
        &self.surge_ring
    }

    pub fn session(&self) -> Option<SessionTag> {
        self.session
    }

    pub fn session_high(&self) -> Option<f64> {
        self.session_high
    }

    pub fn session_low(&self) -> Option<f64> {
        self.session_low
    }

    pub fn previous_high(&self) -> Option<f64> {
        self.previous_high
    }

    pub fn previous_low(&self) -> Option<f64> {
        self.previous_low
    }

    pub fn high_anchor(&self) -> Option<f64> {
        self.high_anchor
    }

    pub fn low_anchor(&self) -> Option<f64> {
        self.low_anchor
    }

    pub fn last_emissions(&self) -> &LastEmissions {
        &self.last_emissions
    }

    pub fn trend_track(&self) -> Option<&TrendTrack> {
        self.trend_track.as_ref()
    }

    pub fn counters(&self) -> EventCounters {
        self.counters
    }

    pub fn first_tick_at(&self) -> Option<DateTime<Utc>> {
        self.first_tick_at
    }

    pub fn session_vwap(&self) -> Option<f64> {
        self.vwap.value()
    }

    pub fn last_update(&self) -> TickUpdate {
        self.last_update
    }
}

fn is_session_transition(from: SessionTag, to: SessionTag) -> bool {
    matches!(
        (from, to),
        (SessionTag::Pre, SessionTag::Regular)
            | (SessionTag::Regular, SessionTag::Post)
            | (SessionTag::Post, SessionTag::Pre)
    )
}

/// Partitioned map of [`SymbolState`]s.
///
/// The outer lock is only held to find or insert an entry, each symbol has its own mutex.
#[derive(Debug, Default)]
pub struct SymbolStateStore {
    config: StateConfig,
    states: RwLock<FnvHashMap<Symbol, Arc<Mutex<SymbolState>>>>,
}

impl SymbolStateStore {
    pub fn new(config: StateConfig) -> Self {
        Self {
            config,
            states: RwLock::new(FnvHashMap::default()),
        }
    }

    /// Fetch the state for `symbol`, inserting a fresh [`SymbolState`] if it is unseen.
    pub fn get_or_insert(&self, symbol: &Symbol) -> Arc<Mutex<SymbolState>> {
        if let Some(state) = self.states.read().get(symbol) {
            return Arc::clone(state);
        }

        let mut states = self.states.write();
        Arc::clone(states.entry(symbol.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(SymbolState::new(symbol.clone(), &self.config)))
        }))
    }

    pub fn get(&self, symbol: &Symbol) -> Option<Arc<Mutex<SymbolState>>> {
        self.states.read().get(symbol).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// Per-symbol [`EventCounters`], sorted by symbol.
    pub fn counters(&self) -> Vec<(Symbol, EventCounters)> {
        let states = self
            .states
            .read()
            .iter()
            .map(|(symbol, state)| (symbol.clone(), Arc::clone(state)))
            .collect::<Vec<_>>();

        let mut counters = states
            .into_iter()
            .map(|(symbol, state)| (symbol, state.lock().counters()))
            .collect::<Vec<_>>();
        counters.sort_by(|(a, _), (b, _)| a.cmp(b));
        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TickKind;
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 9, 16, 0, 0).unwrap()
    }

    fn tick(secs: i64, price: f64, session: SessionTag) -> Tick {
        Tick::new("AAPL", TickKind::Trade, price, 100.0, base() + Duration::seconds(secs))
            .with_session(session)
    }

    #[test]
    fn test_apply_tick_tracks_session_extremes() {
        let mut state = SymbolState::new(Symbol::new("AAPL"), &StateConfig::default());
        let prices = [100.0, 101.0, 99.5, 100.5, 102.0, 98.0];

        for (index, price) in prices.iter().enumerate() {
            state.apply_tick(&tick(index as i64, *price, SessionTag::Regular));
            let seen = &prices[..=index];
            let high = seen.iter().copied().fold(f64::MIN, f64::max);
            let low = seen.iter().copied().fold(f64::MAX, f64::min);
            assert_eq!(state.session_high(), Some(high));
            assert_eq!(state.session_low(), Some(low));
        }

        assert_eq!(state.counters().ticks, prices.len() as u64);
        assert_eq!(state.history().len(), prices.len());
    }

    #[test]
    fn test_apply_tick_reports_new_extremes() {
        struct TestCase {
            input: f64,
            expected: TickUpdate,
        }

        let mut state = SymbolState::new(Symbol::new("AAPL"), &StateConfig::default());

        let tests = vec![
            TestCase {
                // TC0: first tick seeds, neither extreme is new
                input: 100.0,
                expected: TickUpdate::default(),
            },
            TestCase {
                // TC1: new high
                input: 100.5,
                expected: TickUpdate {
                    new_high: true,
                    ..TickUpdate::default()
                },
            },
            TestCase {
                // TC2: inside range
                input: 100.2,
                expected: TickUpdate::default(),
            },
            TestCase {
                // TC3: new low
                input: 99.9,
                expected: TickUpdate {
                    new_low: true,
                    ..TickUpdate::default()
                },
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = state.apply_tick(&tick(index as i64, test.input, SessionTag::Regular));
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_session_transition_resets_extremes() {
        let mut state = SymbolState::new(Symbol::new("AAPL"), &StateConfig::default());
        state.apply_tick(&tick(0, 50.0, SessionTag::Pre));
        state.apply_tick(&tick(1, 52.0, SessionTag::Pre));
        state.apply_tick(&tick(2, 49.0, SessionTag::Pre));

        let open = tick(3, 51.5, SessionTag::Regular).with_open(51.0);
        let update = state.apply_tick(&open);

        assert!(update.session_reset);
        assert_eq!(state.previous_high(), Some(52.0));
        assert_eq!(state.previous_low(), Some(49.0));
        assert_eq!(state.session_high(), Some(51.5));
        assert_eq!(state.session_low(), Some(51.0));
        assert_eq!(state.high_anchor(), Some(51.0));
        assert_eq!(state.first_tick_at(), Some(open.timestamp));

        // Staying in the regular session does not reset again
        let update = state.apply_tick(&tick(4, 51.2, SessionTag::Regular));
        assert!(!update.session_reset);
        assert_eq!(state.session_low(), Some(51.0));
    }

    #[test]
    fn test_last_emissions_elapsed() {
        let mut emissions = LastEmissions::default();
        assert!(emissions.elapsed(EventKind::High, base(), 1_000));

        emissions.set(EventKind::High, base());
        assert!(!emissions.elapsed(EventKind::High, base() + Duration::milliseconds(999), 1_000));
        assert!(emissions.elapsed(EventKind::High, base() + Duration::milliseconds(1_000), 1_000));
        assert!(emissions.elapsed(EventKind::Low, base(), 1_000));
    }

    #[test]
    fn test_trend_track_retracement() {
        let mut track = TrendTrack::new(Direction::Up, 100.0, base());
        track.observe(102.0);
        track.observe(101.0);
        assert_eq!(track.extreme_price, 102.0);
        assert!((track.retracement(101.0) - 0.5).abs() < 1e-9);
        assert_eq!(track.retracement(103.0), 0.0);

        let mut track = TrendTrack::new(Direction::Down, 100.0, base());
        track.observe(96.0);
        assert!((track.retracement(99.0) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_store_get_or_insert_is_shared() {
        let store = SymbolStateStore::new(StateConfig::default());
        let symbol = Symbol::new("MSFT");

        let first = store.get_or_insert(&symbol);
        first.lock().record_event(EventKind::Surge);

        let second = store.get_or_insert(&symbol);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);

        store.get_or_insert(&Symbol::new("AAPL"));
        let counters = store.counters();
        assert_eq!(counters[0].0, "AAPL");
        assert_eq!(counters[1].1.surge, 1);
    }
}
