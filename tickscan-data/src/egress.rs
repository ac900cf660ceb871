use crate::event::{DetectionEvent, EventCategory};
use fnv::FnvHashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// In-process pub-sub bus with one broadcast channel per [`EventCategory`].
///
/// Publishing never blocks. A receiver that falls more than the channel capacity behind skips
/// the oldest events and observes a lag on its next receive.
#[derive(Debug, Clone)]
pub struct EgressBus {
    channels: FnvHashMap<EventCategory, broadcast::Sender<Arc<DetectionEvent>>>,
}

impl EgressBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: EventCategory::ALL
                .into_iter()
                .map(|category| (category, broadcast::channel(capacity.max(1)).0))
                .collect(),
        }
    }

    /// Publish `event` on its category channel, returning how many receivers it reached.
    pub fn publish(&self, event: Arc<DetectionEvent>) -> usize {
        let category = event.category();
        let Some(channel) = self.channels.get(&category) else {
            return 0;
        };

        // Err only means nobody is listening yet
        match channel.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!(category = category.as_ref(), "no egress receivers");
                0
            }
        }
    }

    pub fn subscribe(
        &self,
        category: EventCategory,
    ) -> Option<broadcast::Receiver<Arc<DetectionEvent>>> {
        self.channels.get(&category).map(broadcast::Sender::subscribe)
    }

    /// One receiver per category, in [`EventCategory::ALL`] order.
    pub fn subscribe_all(&self) -> Vec<broadcast::Receiver<Arc<DetectionEvent>>> {
        EventCategory::ALL
            .iter()
            .filter_map(|category| self.subscribe(*category))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{event::EventKind, test_utils::detection_event};
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_publish_routes_by_category() {
        let bus = EgressBus::new(8);
        let mut patterns = bus.subscribe(EventCategory::PATTERN).unwrap();
        let mut indicators = bus.subscribe(EventCategory::INDICATOR).unwrap();

        assert_eq!(bus.publish(Arc::new(detection_event(EventKind::Surge, "AAPL", 190.0))), 1);
        assert_eq!(bus.publish(Arc::new(detection_event(EventKind::Trend, "AAPL", 190.0))), 1);

        assert_eq!(patterns.try_recv().unwrap().kind, EventKind::Surge);
        assert_eq!(patterns.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(indicators.try_recv().unwrap().kind, EventKind::Trend);
    }

    #[test]
    fn test_publish_without_receivers() {
        let bus = EgressBus::new(8);
        assert_eq!(bus.publish(Arc::new(detection_event(EventKind::High, "MSFT", 410.0))), 0);
    }

    #[test]
    fn test_slow_receiver_lags() {
        let bus = EgressBus::new(2);
        let mut patterns = bus.subscribe(EventCategory::PATTERN).unwrap();
        for price in [1.0, 2.0, 3.0] {
            bus.publish(Arc::new(detection_event(EventKind::Low, "SIRI", price)));
        }

        assert_eq!(patterns.try_recv().unwrap_err(), TryRecvError::Lagged(1));
        assert_eq!(patterns.try_recv().unwrap().price, 2.0);
    }
}
