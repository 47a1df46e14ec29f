//! Five-band bounded priority queue
//!
//! One FIFO ring per priority band; `pop` scans bands from `Critical` down so
//! a ready higher-priority item strictly precedes lower ones. Overflow applies
//! the configured policy, with the invariant that a `Critical` item is never
//! the victim of a drop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

use super::domain_types::{MessagePriority, OverflowPolicy};

/// Outcome of a successful push
#[derive(Debug)]
pub enum Pushed<T> {
    /// The item was enqueued with room to spare
    Accepted,
    /// The item was enqueued by displacing a lower-value victim
    Displaced {
        /// The dropped item, for dead-lettering
        victim: T,
        /// The victim's priority band
        victim_priority: MessagePriority,
    },
}

/// Push rejected because the queue is at its high-watermark
#[derive(Debug)]
pub struct QueueFull<T>(pub T);

struct Item<T> {
    seq: u64,
    value: T,
}

struct Bands<T> {
    bands: [VecDeque<Item<T>>; 5],
    next_seq: u64,
    len: usize,
}

impl<T> Bands<T> {
    fn new() -> Self {
        Self {
            bands: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            next_seq: 0,
            len: 0,
        }
    }

    fn push(&mut self, priority: MessagePriority, value: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.bands[priority.band()].push_back(Item { seq, value });
        self.len += 1;
    }

    fn pop_highest(&mut self) -> Option<(MessagePriority, T)> {
        for priority in MessagePriority::ALL {
            if let Some(item) = self.bands[priority.band()].pop_front() {
                self.len -= 1;
                return Some((priority, item.value));
            }
        }
        None
    }

    /// Oldest non-critical item across all bands, by enqueue sequence
    fn drop_oldest(&mut self) -> Option<(MessagePriority, T)> {
        let mut best: Option<(usize, u64)> = None;
        for priority in MessagePriority::ALL {
            if priority == MessagePriority::Critical {
                continue;
            }
            if let Some(front) = self.bands[priority.band()].front() {
                if best.map_or(true, |(_, seq)| front.seq < seq) {
                    best = Some((priority.band(), front.seq));
                }
            }
        }
        let (band, _) = best?;
        let item = self.bands[band].pop_front()?;
        self.len -= 1;
        Some((band_priority(band), item.value))
    }

    /// Oldest item from the lowest-priority non-empty band, never critical
    fn drop_lowest(&mut self) -> Option<(MessagePriority, T)> {
        for priority in MessagePriority::ALL.iter().rev() {
            if *priority == MessagePriority::Critical {
                continue;
            }
            if let Some(item) = self.bands[priority.band()].pop_front() {
                self.len -= 1;
                return Some((*priority, item.value));
            }
        }
        None
    }
}

fn band_priority(band: usize) -> MessagePriority {
    MessagePriority::ALL[band]
}

/// Bounded MPMC priority queue with a high-watermark
pub struct PriorityQueue<T> {
    inner: Mutex<Bands<T>>,
    notify: Notify,
    high_watermark: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
}

impl<T> PriorityQueue<T> {
    /// Creates a queue with the given watermark and overflow policy
    #[must_use]
    pub fn new(capacity: usize, high_watermark_fraction: f64, policy: OverflowPolicy) -> Self {
        let watermark = ((capacity as f64) * high_watermark_fraction).ceil() as usize;
        Self {
            inner: Mutex::new(Bands::new()),
            notify: Notify::new(),
            high_watermark: watermark.clamp(1, capacity.max(1)),
            policy,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues an item, applying the overflow policy at the high-watermark
    ///
    /// # Errors
    /// Returns the item back inside [`QueueFull`] when the policy is `Reject`
    /// or no non-critical victim exists.
    pub fn push(&self, priority: MessagePriority, value: T) -> Result<Pushed<T>, QueueFull<T>> {
        let result = {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if inner.len < self.high_watermark {
                inner.push(priority, value);
                Ok(Pushed::Accepted)
            } else {
                let victim = match self.policy {
                    OverflowPolicy::Reject => None,
                    OverflowPolicy::DropOldest => inner.drop_oldest(),
                    OverflowPolicy::DropLowestPriority => inner.drop_lowest(),
                };
                match victim {
                    Some((victim_priority, victim)) => {
                        inner.push(priority, value);
                        Ok(Pushed::Displaced {
                            victim,
                            victim_priority,
                        })
                    }
                    None => Err(QueueFull(value)),
                }
            }
        };
        if result.is_ok() {
            self.notify.notify_one();
        }
        result
    }

    /// Dequeues the highest-priority item without waiting
    pub fn try_pop(&self) -> Option<(MessagePriority, T)> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_highest()
    }

    /// Dequeues the highest-priority item, waiting until one is available
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<(MessagePriority, T)> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Marks the queue closed; blocked `pop` calls drain then return `None`
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Current number of queued items
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len
    }

    /// Whether the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue depth per priority band, highest first
    pub fn depths(&self) -> [usize; 5] {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        [
            inner.bands[0].len(),
            inner.bands[1].len(),
            inner.bands[2].len(),
            inner.bands[3].len(),
            inner.bands[4].len(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize, policy: OverflowPolicy) -> PriorityQueue<u32> {
        PriorityQueue::new(capacity, 1.0, policy)
    }

    #[test]
    fn pops_higher_priority_first() {
        let q = queue(10, OverflowPolicy::Reject);
        q.push(MessagePriority::Normal, 1).unwrap();
        q.push(MessagePriority::Low, 2).unwrap();
        q.push(MessagePriority::Critical, 3).unwrap();

        assert_eq!(q.try_pop().unwrap(), (MessagePriority::Critical, 3));
        assert_eq!(q.try_pop().unwrap(), (MessagePriority::Normal, 1));
        assert_eq!(q.try_pop().unwrap(), (MessagePriority::Low, 2));
    }

    #[test]
    fn fifo_within_a_band() {
        let q = queue(10, OverflowPolicy::Reject);
        for n in 0..5 {
            q.push(MessagePriority::Normal, n).unwrap();
        }
        for n in 0..5 {
            assert_eq!(q.try_pop().unwrap().1, n);
        }
    }

    #[test]
    fn reject_policy_returns_item() {
        let q = queue(2, OverflowPolicy::Reject);
        q.push(MessagePriority::Normal, 1).unwrap();
        q.push(MessagePriority::Normal, 2).unwrap();
        let err = q.push(MessagePriority::Normal, 3).unwrap_err();
        assert_eq!(err.0, 3);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn drop_lowest_spares_critical() {
        let q = queue(2, OverflowPolicy::DropLowestPriority);
        q.push(MessagePriority::Critical, 1).unwrap();
        q.push(MessagePriority::Low, 2).unwrap();
        match q.push(MessagePriority::Normal, 3).unwrap() {
            Pushed::Displaced {
                victim,
                victim_priority,
            } => {
                assert_eq!(victim, 2);
                assert_eq!(victim_priority, MessagePriority::Low);
            }
            Pushed::Accepted => panic!("expected displacement"),
        }
        // Only critical items left as victims: reject instead of dropping one.
        q.push(MessagePriority::Critical, 4).unwrap();
        let q2 = queue(1, OverflowPolicy::DropLowestPriority);
        q2.push(MessagePriority::Critical, 1).unwrap();
        assert!(q2.push(MessagePriority::Critical, 2).is_err());
    }

    #[test]
    fn drop_oldest_takes_earliest_sequence() {
        let q = queue(2, OverflowPolicy::DropOldest);
        q.push(MessagePriority::Low, 1).unwrap();
        q.push(MessagePriority::Normal, 2).unwrap();
        match q.push(MessagePriority::Normal, 3).unwrap() {
            Pushed::Displaced { victim, .. } => assert_eq!(victim, 1),
            Pushed::Accepted => panic!("expected displacement"),
        }
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let q = std::sync::Arc::new(queue(4, OverflowPolicy::Reject));
        let popper = {
            let q = std::sync::Arc::clone(&q);
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        q.push(MessagePriority::High, 42).unwrap();
        let (priority, value) = popper.await.unwrap().unwrap();
        assert_eq!(priority, MessagePriority::High);
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = queue(4, OverflowPolicy::Reject);
        q.push(MessagePriority::Normal, 7).unwrap();
        q.close();
        assert_eq!(q.pop().await.unwrap().1, 7);
        assert!(q.pop().await.is_none());
    }
}
