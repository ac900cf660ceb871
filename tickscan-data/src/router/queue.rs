use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Processing priority of a queued tick. Higher priorities are dequeued first and shed last.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    fn index(&self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

/// Result of pushing onto a [`PriorityBacklog`].
#[derive(Clone, PartialEq, Debug)]
pub enum PushOutcome<T> {
    Accepted,
    /// Accepted after shedding the oldest item of a lower queued priority.
    Shed(T),
    /// The backlog was at capacity with nothing of lower priority to shed.
    Dropped(T),
}

/// Bounded FIFO-per-priority backlog that never blocks the producer.
///
/// Below `high_water_mark` every item is accepted. Past it, an incoming item sheds the oldest
/// item of the lowest queued priority strictly below its own, or is appended into the headroom
/// if there is none. At `capacity` an item that cannot shed anything is dropped.
#[derive(Debug)]
pub struct PriorityBacklog<T> {
    lanes: [VecDeque<T>; 4],
    len: usize,
    high_water_mark: usize,
    capacity: usize,
}

impl<T> PriorityBacklog<T> {
    pub fn new(high_water_mark: usize, capacity: usize) -> Self {
        let high_water_mark = high_water_mark.max(1);
        Self {
            lanes: Default::default(),
            len: 0,
            high_water_mark,
            capacity: capacity.max(high_water_mark),
        }
    }

    pub fn push(&mut self, item: T, priority: Priority) -> PushOutcome<T> {
        if self.len < self.high_water_mark {
            self.enqueue(item, priority);
            return PushOutcome::Accepted;
        }

        let lowest = Priority::ALL
            .into_iter()
            .find(|candidate| !self.lanes[candidate.index()].is_empty())
            .filter(|lowest| *lowest < priority);

        if let Some(shed) = lowest.and_then(|lowest| self.lanes[lowest.index()].pop_front()) {
            self.lanes[priority.index()].push_back(item);
            return PushOutcome::Shed(shed);
        }

        if self.len < self.capacity {
            self.enqueue(item, priority);
            PushOutcome::Accepted
        } else {
            PushOutcome::Dropped(item)
        }
    }

    fn enqueue(&mut self, item: T, priority: Priority) {
        self.lanes[priority.index()].push_back(item);
        self.len += 1;
    }

    /// Dequeue the oldest item of the highest non-empty priority.
    pub fn pop(&mut self) -> Option<T> {
        let item = self.lanes.iter_mut().rev().find_map(VecDeque::pop_front)?;
        self.len -= 1;
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
