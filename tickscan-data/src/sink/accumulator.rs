use super::{FlushBatch, SymbolSummary};
use crate::{
    event::{DetectionEvent, Symbol},
    orchestrator::DetectionBatch,
    state::EventCounters,
};
use chrono::Utc;
use fnv::FnvHashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug, Default)]
struct Pending {
    counters: FnvHashMap<Symbol, EventCounters>,
    events: VecDeque<DetectionEvent>,
    overflowed: u64,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.events.is_empty() && self.overflowed == 0
    }
}

/// Bounded buffer of detection activity awaiting the next sink flush.
///
/// Per-symbol counters are unbounded (one entry per symbol). Events are capped: once full the
/// oldest events are dropped and counted as overflowed.
#[derive(Debug)]
pub struct Accumulator {
    max_events: usize,
    pending: Mutex<Pending>,
}

impl Accumulator {
    pub fn new(max_events: usize) -> Self {
        Self {
            max_events,
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Count the tick behind `batch` and buffer its events.
    pub fn record(&self, batch: &DetectionBatch) {
        let mut pending = self.pending.lock();

        let counters = pending.counters.entry(batch.symbol.clone()).or_default();
        counters.ticks += 1;
        for event in &batch.events {
            counters.record(event.kind);
        }

        pending.events.extend(batch.events.iter().cloned());
        let dropped = self.trim(&mut pending);
        if dropped > 0 {
            warn!(
                symbol = %batch.symbol,
                dropped,
                capacity = self.max_events,
                "sink accumulator full, dropping oldest events"
            );
        }
    }

    /// Take everything pending, leaving the accumulator empty.
    pub fn take(&self) -> Option<FlushBatch> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return None;
        }

        let Pending {
            counters,
            events,
            overflowed,
        } = std::mem::take(&mut *pending);

        let symbols = counters
            .into_iter()
            .map(|(symbol, counters)| SymbolSummary { symbol, counters })
            .sorted_by(|a, b| a.symbol.cmp(&b.symbol))
            .collect();

        Some(FlushBatch {
            generated_at: Utc::now(),
            symbols,
            events: events.into(),
            overflowed,
        })
    }

    /// Put back a batch that could not be flushed, ahead of anything recorded since.
    pub fn restore(&self, batch: FlushBatch) {
        let mut pending = self.pending.lock();

        for summary in &batch.symbols {
            pending
                .counters
                .entry(summary.symbol.clone())
                .or_default()
                .merge(&summary.counters);
        }
        pending.overflowed += batch.overflowed;

        let newer = std::mem::take(&mut pending.events);
        pending.events = batch.events.into_iter().chain(newer).collect();
        self.trim(&mut pending);
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.pending.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn trim(&self, pending: &mut Pending) -> usize {
        let excess = pending.events.len().saturating_sub(self.max_events);
        pending.events.drain(..excess);
        pending.overflowed += excess as u64;
        excess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::EventKind, state::TickUpdate, test_utils::detection_event};

    fn batch(symbol: &str, kinds: &[EventKind]) -> DetectionBatch {
        DetectionBatch {
            symbol: Symbol::new(symbol),
            update: TickUpdate::default(),
            events: kinds
                .iter()
                .map(|kind| detection_event(*kind, symbol, 10.0))
                .collect(),
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_take_summarises_per_symbol() {
        let accumulator = Accumulator::new(100);
        assert!(accumulator.take().is_none());

        accumulator.record(&batch("MSFT", &[]));
        accumulator.record(&batch("AAPL", &[EventKind::High, EventKind::Surge]));
        accumulator.record(&batch("AAPL", &[EventKind::High]));

        let flushed = accumulator.take().unwrap();
        assert!(accumulator.is_empty());
        assert_eq!(flushed.events.len(), 3);
        assert_eq!(flushed.symbols.len(), 2);

        let aapl = &flushed.symbols[0];
        assert_eq!(aapl.symbol, Symbol::new("AAPL"));
        assert_eq!(
            aapl.counters,
            EventCounters {
                ticks: 2,
                high: 2,
                low: 0,
                trend: 0,
                surge: 1,
            }
        );
        assert_eq!(flushed.symbols[1].counters.ticks, 1);
    }

    #[test]
    fn test_events_are_bounded() {
        let accumulator = Accumulator::new(2);
        accumulator.record(&batch("TSLA", &[EventKind::High, EventKind::Low, EventKind::Surge]));

        let flushed = accumulator.take().unwrap();
        let kinds = flushed.events.iter().map(|event| event.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![EventKind::Low, EventKind::Surge]);
        assert_eq!(flushed.overflowed, 1);
        assert_eq!(flushed.symbols[0].counters.events(), 3);
    }

    #[test]
    fn test_restore_keeps_failed_batch_ahead_of_newer_events() {
        let accumulator = Accumulator::new(3);
        accumulator.record(&batch("NVDA", &[EventKind::High, EventKind::Trend]));
        let failed = accumulator.take().unwrap();

        accumulator.record(&batch("NVDA", &[EventKind::Low, EventKind::Surge]));
        accumulator.restore(failed);

        let flushed = accumulator.take().unwrap();
        let kinds = flushed.events.iter().map(|event| event.kind).collect::<Vec<_>>();
        // Oldest restored event is dropped to stay within capacity
        assert_eq!(kinds, vec![EventKind::Trend, EventKind::Low, EventKind::Surge]);
        assert_eq!(flushed.overflowed, 1);
        assert_eq!(flushed.symbols[0].counters.ticks, 2);
        assert_eq!(flushed.symbols[0].counters.events(), 4);
    }
}
