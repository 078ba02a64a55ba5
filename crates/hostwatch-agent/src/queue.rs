// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO between the collection loop and the synchronizer.
//!
//! Producers never block: once the queue holds `capacity` entries, the
//! oldest entry is discarded to make room. The consumer awaits entries with
//! [`DeliveryQueue::get`].

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

/// Capacity used by the agent for its delivery queue.
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    unfinished: usize,
}

/// Drop-oldest bounded queue, safe for concurrent producers and a consumer.
#[derive(Debug)]
pub struct DeliveryQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Notify,
    capacity: usize,
}

impl<T> DeliveryQueue<T> {
    /// Creates an empty queue. A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                unfinished: 0,
            }),
            available: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `item`, discarding the oldest entry first when the queue is
    /// full. Returns the discarded entry, if any.
    pub fn put(&self, item: T) -> Option<T> {
        let shed = {
            let mut state = self.lock();
            let shed = if state.items.len() >= self.capacity {
                let oldest = state.items.pop_front();
                if oldest.is_some() {
                    state.unfinished = state.unfinished.saturating_sub(1);
                }
                oldest
            } else {
                None
            };
            state.items.push_back(item);
            state.unfinished += 1;
            shed
        };
        if shed.is_some() {
            debug!(capacity = self.capacity, "Delivery queue full, discarded oldest entry");
        }
        self.available.notify_one();
        shed
    }

    /// Waits until an entry is available and removes it.
    pub async fn get(&self) -> T {
        loop {
            let notified = self.available.notified();
            if let Some(item) = self.try_get() {
                return item;
            }
            notified.await;
        }
    }

    /// Removes the oldest entry without waiting.
    pub fn try_get(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Atomically drops every pending entry and resets the unfinished-task
    /// counter.
    pub fn clear(&self) {
        let mut state = self.lock();
        let dropped = state.items.len();
        state.items.clear();
        state.unfinished = 0;
        if dropped > 0 {
            debug!(dropped, "Delivery queue cleared");
        }
    }

    /// Marks one previously retrieved entry as processed.
    pub fn task_done(&self) {
        let mut state = self.lock();
        state.unfinished = state.unfinished.saturating_sub(1);
    }

    /// Number of entries put but not yet marked done.
    pub fn unfinished(&self) -> usize {
        self.lock().unfinished
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
