//! Multi-producer, single-consumer playback queue.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::{QueueItem, SpeakRequest};

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    /// Bumped by every preempting insert.
    epoch: u64,
}

#[derive(Debug, Default)]
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the tail.
    pub fn push(&self, mut request: SpeakRequest) {
        let mut state = self.lock();
        request.epoch = state.epoch;
        state.items.push_back(QueueItem::Speak(request));
        self.available.notify_one();
    }

    /// Discard every queued request and make `request` the new head, in one
    /// step with respect to other producers. A pending termination marker is
    /// kept behind the new head. Returns the discarded requests.
    pub fn preempt(&self, mut request: SpeakRequest) -> Vec<SpeakRequest> {
        let mut state = self.lock();
        state.epoch += 1;
        request.epoch = state.epoch;

        let mut discarded = Vec::new();
        let mut kept = VecDeque::new();
        for item in state.items.drain(..) {
            match item {
                QueueItem::Speak(old) => discarded.push(old),
                QueueItem::Terminate => kept.push_back(QueueItem::Terminate),
            }
        }
        kept.push_front(QueueItem::Speak(request));
        state.items = kept;
        self.available.notify_one();
        discarded
    }

    pub fn push_terminate(&self) {
        self.lock().items.push_back(QueueItem::Terminate);
        self.available.notify_one();
    }

    /// Block until an item is available and remove it.
    pub fn pop(&self) -> QueueItem {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return item;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<QueueItem> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.pop());
        };
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self
                .available
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn try_pop(&self) -> Option<QueueItem> {
        self.lock().items.pop_front()
    }

    /// Current playback epoch. Requests stamped with an older epoch have
    /// been superseded by an immediate enqueue.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}
