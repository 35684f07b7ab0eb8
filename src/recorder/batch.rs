//! # Batch queue
//!
//! In-memory FIFO of events waiting to be written. A flush is due when the
//! queue reaches `batch_size` or `batch_flush_interval` has passed since the
//! last flush. Only one flush runs at a time; events of a failed flush go back
//! to the head of the queue in their original order.

use crate::events::TriggerEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug)]
struct QueueState {
    events: VecDeque<TriggerEvent>,
    last_flush: Instant,
}

/// Counters describing the queue since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub pending: usize,
    /// Flushes that had at least one event to write
    pub flushes: u64,
    pub flushed_events: u64,
    pub requeued_events: u64,
    pub dropped_events: u64,
    pub flushing: bool,
}

/// Bounded FIFO of pending events
#[derive(Debug)]
pub struct BatchQueue {
    state: Mutex<QueueState>,
    batch_size: usize,
    max_pending: usize,
    flush_interval: Duration,
    flushing: AtomicBool,
    flushes: AtomicU64,
    flushed_events: AtomicU64,
    requeued_events: AtomicU64,
    dropped_events: AtomicU64,
}

/// Exclusive right to flush, released on drop
#[derive(Debug)]
pub struct FlushGuard<'a> {
    queue: &'a BatchQueue,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.queue.flushing.store(false, Ordering::Release);
    }
}

impl BatchQueue {
    pub fn new(batch_size: usize, max_pending: usize, flush_interval: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(batch_size),
                last_flush: Instant::now(),
            }),
            batch_size: batch_size.max(1),
            max_pending: max_pending.max(batch_size).max(1),
            flush_interval,
            flushing: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
            flushed_events: AtomicU64::new(0),
            requeued_events: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Append an event; returns true when the queue has reached `batch_size`
    pub fn push(&self, event: TriggerEvent) -> bool {
        let mut state = self.state.lock();
        state.events.push_back(event);
        self.enforce_bound(&mut state);
        state.events.len() >= self.batch_size
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// When the next interval flush is due
    pub fn next_deadline(&self) -> Instant {
        self.state.lock().last_flush + self.flush_interval
    }

    /// Restart the interval without flushing (the queue was empty when it expired)
    pub fn touch(&self) {
        self.state.lock().last_flush = Instant::now();
    }

    /// Claim the flush, or `None` if another flush is running
    pub fn try_begin_flush(&self) -> Option<FlushGuard<'_>> {
        self.flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushGuard { queue: self })
    }

    /// Take every pending event in arrival order and restart the interval.
    /// Requires the flush guard so two flushes never interleave.
    pub fn drain(&self, _guard: &FlushGuard<'_>) -> Vec<TriggerEvent> {
        let mut state = self.state.lock();
        state.last_flush = Instant::now();
        let drained: Vec<TriggerEvent> = state.events.drain(..).collect();
        if !drained.is_empty() {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
        drained
    }

    /// Record the outcome of a drained flush, returning failed events to the head
    pub fn complete(&self, _guard: &FlushGuard<'_>, written: usize, failed: Vec<TriggerEvent>) {
        self.flushed_events
            .fetch_add(written as u64, Ordering::Relaxed);
        if failed.is_empty() {
            return;
        }

        self.requeued_events
            .fetch_add(failed.len() as u64, Ordering::Relaxed);
        let mut state = self.state.lock();
        for event in failed.into_iter().rev() {
            state.events.push_front(event);
        }
        self.enforce_bound(&mut state);
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            pending: self.len(),
            flushes: self.flushes.load(Ordering::Relaxed),
            flushed_events: self.flushed_events.load(Ordering::Relaxed),
            requeued_events: self.requeued_events.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            flushing: self.flushing.load(Ordering::Acquire),
        }
    }

    fn enforce_bound(&self, state: &mut QueueState) {
        let overflow = state.events.len().saturating_sub(self.max_pending);
        if overflow == 0 {
            return;
        }
        for dropped in state.events.drain(..overflow) {
            warn!(
                trigger_id = %dropped.trigger_id,
                bot_name = %dropped.bot_name,
                max_pending = self.max_pending,
                "Pending event queue full, dropping oldest event"
            );
        }
        self.dropped_events
            .fetch_add(overflow as u64, Ordering::Relaxed);
    }
}
