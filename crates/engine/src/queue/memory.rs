use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use herald_common::error::AppError;
use herald_common::types::{Priority, QueueEntry};

use super::{QueueDepth, WeightedRoundRobin, WorkQueue};

/// In-process queue. Both lanes and the delayed set live under one mutex, so
/// promotion and the weighted pop happen as a single step.
pub struct MemoryQueue {
    lanes: Mutex<Lanes>,
}

struct Lanes {
    high: VecDeque<QueueEntry>,
    normal: VecDeque<QueueEntry>,
    /// Keyed by (ready time, insertion sequence) so equal deadlines stay FIFO.
    delayed: BTreeMap<(Instant, u64), QueueEntry>,
    seq: u64,
    wrr: WeightedRoundRobin,
}

impl Lanes {
    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<QueueEntry> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let entry = entry.remove();
            self.lane_mut(entry.priority).push_back(entry);
        }
    }

    fn pop_at(&mut self, now: Instant) -> Option<QueueEntry> {
        self.promote_due(now);
        let lane = self.wrr.pick(!self.high.is_empty(), !self.normal.is_empty())?;
        self.lane_mut(lane).pop_front()
    }

    fn push_delayed(&mut self, entry: QueueEntry, ready_at: Instant) {
        self.seq += 1;
        self.delayed.insert((ready_at, self.seq), entry);
    }
}

impl MemoryQueue {
    pub fn new(high_weight: u32) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                delayed: BTreeMap::new(),
                seq: 0,
                wrr: WeightedRoundRobin::new(high_weight),
            }),
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, entry: &QueueEntry) -> Result<(), AppError> {
        self.lanes
            .lock()
            .lane_mut(entry.priority)
            .push_back(entry.clone());
        Ok(())
    }

    async fn enqueue_delayed(&self, entry: &QueueEntry, delay: Duration) -> Result<(), AppError> {
        self.lanes
            .lock()
            .push_delayed(entry.clone(), Instant::now() + delay);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueueEntry>, AppError> {
        Ok(self.lanes.lock().pop_at(Instant::now()))
    }

    async fn depth(&self) -> Result<QueueDepth, AppError> {
        let lanes = self.lanes.lock();
        Ok(QueueDepth {
            high: lanes.high.len() as u64,
            normal: lanes.normal.len() as u64,
            delayed: lanes.delayed.len() as u64,
        })
    }

    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}
