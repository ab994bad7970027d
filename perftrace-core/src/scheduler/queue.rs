//! Bounded hand-off between the tick loop and the store writer.

use crate::collector::MetricSample;
use crate::store::TargetEvent;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Everything one tick produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub tick: u64,
    pub samples: Vec<MetricSample>,
    pub events: Vec<TargetEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The oldest batch was discarded to make room.
    DroppedOldest { samples: usize },
    /// The consumer is gone; the batch was not queued.
    Closed,
}

#[derive(Debug, PartialEq)]
pub enum Pop {
    Batch(Batch),
    Timeout,
    /// Closed and fully drained.
    Closed,
}

struct Inner {
    batches: VecDeque<Batch>,
    closed: bool,
    dropped_samples: u64,
}

/// Mutex + condvar ring of tick batches with drop-oldest overflow.
///
/// Events of a dropped batch are moved onto the next queued batch so target
/// lifecycle records survive backpressure.
pub struct SampleQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
    capacity: usize,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                batches: VecDeque::new(),
                closed: false,
                dropped_samples: 0,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, mut batch: Batch) -> PushOutcome {
        let mut inner = self.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }

        let mut outcome = PushOutcome::Queued;
        if inner.batches.len() >= self.capacity {
            if let Some(oldest) = inner.batches.pop_front() {
                let samples = oldest.samples.len();
                inner.dropped_samples += samples as u64;
                match inner.batches.front_mut() {
                    Some(next) => {
                        let mut events = oldest.events;
                        events.append(&mut next.events);
                        next.events = events;
                    }
                    None => {
                        let mut events = oldest.events;
                        events.append(&mut batch.events);
                        batch.events = events;
                    }
                }
                outcome = PushOutcome::DroppedOldest { samples };
            }
        }

        inner.batches.push_back(batch);
        drop(inner);
        self.ready.notify_one();
        outcome
    }

    /// Waits up to `timeout` for a batch. Remaining batches are handed out
    /// before `Closed` is reported.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        let inner = self.lock();
        let (mut inner, _) = self
            .ready
            .wait_timeout_while(inner, timeout, |inner| {
                inner.batches.is_empty() && !inner.closed
            })
            .unwrap_or_else(PoisonError::into_inner);

        match inner.batches.pop_front() {
            Some(batch) => Pop::Batch(batch),
            None if inner.closed => Pop::Closed,
            None => Pop::Timeout,
        }
    }

    /// Refuses further pushes and wakes the consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_samples(&self) -> u64 {
        self.lock().dropped_samples
    }
}
