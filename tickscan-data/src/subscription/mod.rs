//! Inverted index from (symbol, [`EventKind`]) to interested subscribers.
//!
//! Readers clone an `Arc` of the current [`IndexSnapshot`] and never wait on writers beyond
//! that pointer copy. Writers are serialised, build a modified copy, then swap it in.

use crate::event::{DetectionEvent, EventKind, Symbol};
use derive_more::{Display, From};
use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Unique identifier of a connected subscriber.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Display,
    From,
    Deserialize,
    Serialize,
)]
pub struct SubscriberId(pub u64);

/// Set of [`EventKind`]s, one bit per kind.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Deserialize, Serialize)]
pub struct KindMask(u8);

impl KindMask {
    pub const ALL: Self = Self(0b1111);
    pub const NONE: Self = Self(0);

    pub fn contains(&self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn kinds(&self) -> impl Iterator<Item = EventKind> + '_ {
        EventKind::ALL.into_iter().filter(|kind| self.contains(*kind))
    }
}

impl FromIterator<EventKind> for KindMask {
    fn from_iter<Iter: IntoIterator<Item = EventKind>>(iter: Iter) -> Self {
        Self(iter.into_iter().fold(0, |mask, kind| mask | kind.bit()))
    }
}

impl From<EventKind> for KindMask {
    fn from(kind: EventKind) -> Self {
        Self(kind.bit())
    }
}

#[derive(Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolFilter {
    All,
    Symbol(Symbol),
}

/// One (symbol filter) x (event-kind filter) pair a subscriber is interested in.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub struct Interest {
    pub symbols: SymbolFilter,
    pub kinds: KindMask,
}

impl Interest {
    pub fn new(symbols: SymbolFilter, kinds: impl Into<KindMask>) -> Self {
        Self {
            symbols,
            kinds: kinds.into(),
        }
    }

    pub fn matches(&self, kind: EventKind, symbol: &Symbol) -> bool {
        self.kinds.contains(kind)
            && match &self.symbols {
                SymbolFilter::All => true,
                SymbolFilter::Symbol(filter) => filter == symbol,
            }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Subscription {
    pub subscriber: SubscriberId,
    pub interests: Vec<Interest>,
}

/// Immutable materialisation of every active [`Subscription`].
#[derive(Clone, Debug, Default)]
pub struct IndexSnapshot {
    by_symbol: FnvHashMap<Symbol, FnvHashMap<SubscriberId, KindMask>>,
    by_kind: FnvHashMap<EventKind, FnvHashSet<SubscriberId>>,
    subscriptions: FnvHashMap<SubscriberId, Vec<Interest>>,
}

impl IndexSnapshot {
    /// Subscribers interested in a `kind` event for `symbol`, sorted by id.
    pub fn lookup(&self, kind: EventKind, symbol: &Symbol) -> Vec<SubscriberId> {
        let wildcard = self.by_kind.get(&kind).into_iter().flatten().copied();
        let specific = self
            .by_symbol
            .get(symbol)
            .into_iter()
            .flatten()
            .filter(|(_, mask)| mask.contains(kind))
            .map(|(subscriber, _)| *subscriber);

        let mut targets = wildcard.chain(specific).collect::<Vec<_>>();
        targets.sort_unstable();
        targets.dedup();
        targets
    }

    pub fn contains(&self, subscriber: SubscriberId) -> bool {
        self.subscriptions.contains_key(&subscriber)
    }

    pub fn interests(&self, subscriber: SubscriberId) -> Option<&[Interest]> {
        self.subscriptions.get(&subscriber).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Determine if `subscriber` appears anywhere in the inverted maps.
    fn references(&self, subscriber: SubscriberId) -> bool {
        self.by_symbol
            .values()
            .any(|entries| entries.contains_key(&subscriber))
            || self.by_kind.values().any(|ids| ids.contains(&subscriber))
    }

    fn remove(&mut self, subscriber: SubscriberId) -> bool {
        let Some(interests) = self.subscriptions.remove(&subscriber) else {
            return false;
        };

        for interest in interests {
            match interest.symbols {
                SymbolFilter::All => {
                    for kind in interest.kinds.kinds() {
                        if let Some(ids) = self.by_kind.get_mut(&kind) {
                            ids.remove(&subscriber);
                            if ids.is_empty() {
                                self.by_kind.remove(&kind);
                            }
                        }
                    }
                }
                SymbolFilter::Symbol(symbol) => {
                    if let Some(entries) = self.by_symbol.get_mut(&symbol) {
                        entries.remove(&subscriber);
                        if entries.is_empty() {
                            self.by_symbol.remove(&symbol);
                        }
                    }
                }
            }
        }
        true
    }

    fn insert(&mut self, subscription: Subscription) {
        let interests = subscription
            .interests
            .into_iter()
            .filter(|interest| !interest.kinds.is_empty())
            .collect::<Vec<_>>();

        for interest in &interests {
            match &interest.symbols {
                SymbolFilter::All => {
                    for kind in interest.kinds.kinds() {
                        self.by_kind
                            .entry(kind)
                            .or_default()
                            .insert(subscription.subscriber);
                    }
                }
                SymbolFilter::Symbol(symbol) => {
                    let mask = self
                        .by_symbol
                        .entry(symbol.clone())
                        .or_default()
                        .entry(subscription.subscriber)
                        .or_default();
                    *mask = mask.union(interest.kinds);
                }
            }
        }

        self.subscriptions.insert(subscription.subscriber, interests);
    }
}

/// Copy-on-write [`IndexSnapshot`] shared between the broadcaster and connection handlers.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    current: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Replace the subscriber's interests with `subscription` (last writer wins).
    pub fn subscribe(&self, subscription: Subscription) {
        self.update(|snapshot| {
            snapshot.remove(subscription.subscriber);
            snapshot.insert(subscription);
        });
    }

    /// Remove every entry for `subscriber`, returning whether it was subscribed.
    pub fn unsubscribe(&self, subscriber: SubscriberId) -> bool {
        let mut removed = false;
        self.update(|snapshot| {
            removed = snapshot.remove(subscriber);
            debug_assert!(!snapshot.references(subscriber));
        });
        removed
    }

    /// Subscribers the [`DetectionEvent`] should be delivered to.
    pub fn targets(&self, event: &DetectionEvent) -> Vec<SubscriberId> {
        self.snapshot().lookup(event.kind, &event.symbol)
    }

    fn update(&self, mutate: impl FnOnce(&mut IndexSnapshot)) {
        let _writer = self.writer.lock();
        let mut next = IndexSnapshot::clone(&self.current.read());
        mutate(&mut next);
        *self.current.write() = Arc::new(next);
    }
}
