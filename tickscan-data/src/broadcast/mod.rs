//! Fan-out of [`DetectionEvent`]s to subscribed connections.
//!
//! A single dispatch task consumes the egress channels, resolves each event's subscribers via
//! the [`SubscriptionIndex`] and hands the event to every target connection's bounded outbox
//! without awaiting. Each connection then batches, rate limits and writes through its own
//! [`EventTransport`] on its own task, so a slow or failing connection never stalls another.

use crate::{
    config::BroadcastConfig,
    error::ScanError,
    event::DetectionEvent,
    subscription::{Interest, SubscriberId, Subscription, SubscriptionIndex},
};
use async_trait::async_trait;
use connection::{ConnectionState, ConnectionStatus, DisconnectReason};
use fnv::FnvHashMap;
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::{debug, info, warn};

/// Per-connection batching writer and [`ConnectionStatus`].
pub mod connection;

/// [`TokenBucket`](limiter::TokenBucket) write limiter.
pub mod limiter;

/// Destination a connection's event batches are written to, eg/ a WebSocket sink.
#[async_trait]
pub trait EventTransport: Send + Sync + 'static {
    async fn send(&self, events: &[Arc<DetectionEvent>]) -> Result<(), ScanError>;

    /// Called once after the connection is removed from the broadcaster.
    async fn close(&self) {}
}

#[derive(Debug)]
struct Connection {
    outbox: mpsc::Sender<Arc<DetectionEvent>>,
    cancel: oneshot::Sender<DisconnectReason>,
    state: Arc<ConnectionState>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct BroadcastMetrics {
    received: AtomicU64,
    delivered: AtomicU64,
    unrouted: AtomicU64,
    lagged: AtomicU64,
    backlog_disconnects: AtomicU64,
    failure_disconnects: AtomicU64,
}

/// Point-in-time broadcaster counters.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct BroadcastStats {
    pub connections: usize,
    /// Events taken off the egress channels.
    pub received: u64,
    /// Event deliveries into connection outboxes.
    pub delivered: u64,
    /// Events no subscriber was interested in.
    pub unrouted: u64,
    /// Events skipped because dispatch fell behind an egress channel.
    pub lagged: u64,
    pub backlog_disconnects: u64,
    pub failure_disconnects: u64,
}

#[derive(Debug)]
struct Shared {
    config: BroadcastConfig,
    index: Arc<SubscriptionIndex>,
    connections: RwLock<FnvHashMap<SubscriberId, Connection>>,
    next_id: AtomicU64,
    metrics: BroadcastMetrics,
}

impl Shared {
    /// Remove the connection and every subscription it holds, signalling its worker to stop.
    fn remove(
        &self,
        subscriber: SubscriberId,
        reason: DisconnectReason,
    ) -> Option<JoinHandle<()>> {
        let connection = self.connections.write().remove(&subscriber)?;
        self.index.unsubscribe(subscriber);
        self.record_disconnect(&reason);

        info!(%subscriber, ?reason, "disconnected subscriber");
        let _ = connection.cancel.send(reason);
        Some(connection.task)
    }

    /// Clean up after a worker that stopped by itself.
    fn release(&self, subscriber: SubscriberId, reason: &DisconnectReason) {
        if self.connections.write().remove(&subscriber).is_some() {
            self.index.unsubscribe(subscriber);
            self.record_disconnect(reason);
            info!(%subscriber, ?reason, "connection worker stopped");
        }
    }

    fn record_disconnect(&self, reason: &DisconnectReason) {
        match reason {
            DisconnectReason::Backlog => {
                self.metrics.backlog_disconnects.fetch_add(1, Ordering::Relaxed);
            }
            DisconnectReason::WriteFailures(_) => {
                self.metrics.failure_disconnects.fetch_add(1, Ordering::Relaxed);
            }
            DisconnectReason::Requested | DisconnectReason::OutboxClosed => {}
        }
    }
}

/// Registry of live connections plus the [`SubscriptionIndex`] that routes events to them.
///
/// Cheap to clone; clones share the same registry.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    pub fn new(config: &BroadcastConfig, index: Arc<SubscriptionIndex>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: *config,
                index,
                connections: RwLock::new(FnvHashMap::default()),
                next_id: AtomicU64::new(1),
                metrics: BroadcastMetrics::default(),
            }),
        }
    }

    pub fn index(&self) -> &Arc<SubscriptionIndex> {
        &self.shared.index
    }

    /// Register a connection and spawn its writer task, returning the new [`SubscriberId`].
    ///
    /// The connection receives nothing until it [`subscribe`](Self::subscribe)s.
    pub fn connect(&self, transport: Arc<dyn EventTransport>) -> SubscriberId {
        let subscriber = SubscriberId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbox, outbox_rx) = mpsc::channel(self.shared.config.outbox_capacity);
        let (cancel, cancel_rx) = oneshot::channel();
        let state = Arc::new(ConnectionState::default());

        let shared = Arc::clone(&self.shared);
        let worker_state = Arc::clone(&state);
        let config = self.shared.config;
        let task = tokio::spawn(async move {
            let reason = connection::run(
                subscriber,
                Arc::clone(&transport),
                outbox_rx,
                cancel_rx,
                config,
                worker_state,
            )
            .await;
            shared.release(subscriber, &reason);
            transport.close().await;
            debug!(%subscriber, "connection closed");
        });

        self.shared.connections.write().insert(
            subscriber,
            Connection {
                outbox,
                cancel,
                state,
                task,
            },
        );

        info!(%subscriber, "registered connection");
        subscriber
    }

    /// Replace the connection's interests. Returns `false` if it is not connected.
    pub fn subscribe(&self, subscriber: SubscriberId, interests: Vec<Interest>) -> bool {
        if !self.shared.connections.read().contains_key(&subscriber) {
            return false;
        }

        debug!(%subscriber, interests = interests.len(), "updated subscription");
        self.shared.index.subscribe(Subscription {
            subscriber,
            interests,
        });
        true
    }

    /// Drop every interest of the connection while keeping it connected.
    pub fn unsubscribe(&self, subscriber: SubscriberId) -> bool {
        self.shared.index.unsubscribe(subscriber)
    }

    /// Disconnect the connection, discarding any events still queued for it.
    pub fn disconnect(&self, subscriber: SubscriberId) -> bool {
        self.shared
            .remove(subscriber, DisconnectReason::Requested)
            .is_some()
    }

    /// Disconnect every connection and wait for their writer tasks to finish.
    pub async fn disconnect_all(&self) {
        let subscribers = self
            .shared
            .connections
            .read()
            .keys()
            .copied()
            .collect::<Vec<_>>();

        let tasks = subscribers
            .into_iter()
            .filter_map(|subscriber| self.shared.remove(subscriber, DisconnectReason::Requested))
            .collect::<Vec<_>>();

        for task in tasks {
            if let Err(error) = task.await {
                warn!(?error, "connection worker terminated abnormally");
            }
        }
    }

    /// Hand `event` to every interested connection's outbox without waiting.
    ///
    /// A connection whose outbox is full is disconnected and unsubscribed. Returns the number
    /// of connections the event was queued for.
    pub fn deliver(&self, event: Arc<DetectionEvent>) -> usize {
        let metrics = &self.shared.metrics;
        metrics.received.fetch_add(1, Ordering::Relaxed);

        let targets = self.shared.index.targets(&event);
        if targets.is_empty() {
            metrics.unrouted.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let mut delivered = 0;
        let mut overflowed = Vec::new();
        {
            let connections = self.shared.connections.read();
            for subscriber in targets {
                let Some(connection) = connections.get(&subscriber) else {
                    continue;
                };
                match connection.outbox.try_send(Arc::clone(&event)) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        overflowed.push((subscriber, DisconnectReason::Backlog));
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        overflowed.push((subscriber, DisconnectReason::OutboxClosed));
                    }
                }
            }
        }

        for (subscriber, reason) in overflowed {
            if reason == DisconnectReason::Backlog {
                warn!(
                    %subscriber,
                    capacity = self.shared.config.outbox_capacity,
                    "connection outbox full, disconnecting slow subscriber"
                );
            }
            self.shared.remove(subscriber, reason);
        }

        metrics
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Spawn the dispatch task that merges the egress `receivers` and [`deliver`](Self::deliver)s
    /// every event they carry.
    pub fn spawn_dispatch<Receivers>(&self, receivers: Receivers) -> DispatchHandle
    where
        Receivers: IntoIterator<Item = broadcast::Receiver<Arc<DetectionEvent>>>,
    {
        let mut events =
            futures::stream::select_all(receivers.into_iter().map(BroadcastStream::new));
        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let broadcaster = self.clone();

        let task = tokio::spawn(async move {
            info!("broadcast dispatch running");
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        // Deliver whatever is already buffered before stopping
                        while let Some(Some(next)) = events.next().now_or_never() {
                            broadcaster.dispatch(next);
                        }
                        break;
                    }
                    next = events.next() => match next {
                        Some(next) => broadcaster.dispatch(next),
                        None => break,
                    },
                }
            }
            info!("broadcast dispatch stopped");
        });

        DispatchHandle {
            stop: Some(stop),
            task,
        }
    }

    fn dispatch(&self, next: Result<Arc<DetectionEvent>, BroadcastStreamRecvError>) {
        match next {
            Ok(event) => {
                self.deliver(event);
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                self.shared
                    .metrics
                    .lagged
                    .fetch_add(skipped, Ordering::Relaxed);
                warn!(skipped, "broadcast dispatch lagged behind egress");
            }
        }
    }

    /// Status of every live connection, sorted by [`SubscriberId`].
    pub fn connections(&self) -> Vec<ConnectionStatus> {
        let mut statuses = self
            .shared
            .connections
            .read()
            .iter()
            .map(|(subscriber, connection)| {
                let queued = connection.outbox.max_capacity() - connection.outbox.capacity();
                connection.state.snapshot(*subscriber, queued)
            })
            .collect::<Vec<_>>();
        statuses.sort_by_key(|status| status.subscriber);
        statuses
    }

    pub fn stats(&self) -> BroadcastStats {
        let metrics = &self.shared.metrics;
        BroadcastStats {
            connections: self.shared.connections.read().len(),
            received: metrics.received.load(Ordering::Relaxed),
            delivered: metrics.delivered.load(Ordering::Relaxed),
            unrouted: metrics.unrouted.load(Ordering::Relaxed),
            lagged: metrics.lagged.load(Ordering::Relaxed),
            backlog_disconnects: metrics.backlog_disconnects.load(Ordering::Relaxed),
            failure_disconnects: metrics.failure_disconnects.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running dispatch task spawned by [`Broadcaster::spawn_dispatch`].
#[derive(Debug)]
pub struct DispatchHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl DispatchHandle {
    /// Deliver anything already buffered on the egress channels, then stop dispatching.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(error) = self.task.await {
            warn!(?error, "broadcast dispatch terminated abnormally");
        }
    }
}
