//! Blocking handoff between the engine and synchronous callers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::response::Response;

/// A FIFO of completed responses.
///
/// Producers (the dispatcher and timer threads) never block. Consumers block
/// in [`get_item`](Self::get_item) until a response is available. Any number
/// of consumers may wait at once; each insert wakes exactly one of them, and
/// each woken consumer claims exactly one response.
#[derive(Default)]
pub struct ResponseQueue {
    state: Mutex<State>,
    available: Condvar,
}

#[derive(Default)]
struct State {
    items: VecDeque<Response>,
    waiting: usize,
}

impl ResponseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a response and wake one blocked consumer.
    pub fn insert(&self, response: Response) {
        self.lock().items.push_back(response);
        self.available.notify_one();
    }

    /// Remove and return the oldest response, blocking until there is one.
    pub fn get_item(&self) -> Response {
        let mut state = self.lock();
        loop {
            if let Some(response) = state.items.pop_front() {
                return response;
            }
            state.waiting += 1;
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            state.waiting -= 1;
        }
    }

    /// Like [`get_item`](Self::get_item) but gives up after `timeout`.
    pub fn get_item_timeout(&self, timeout: Duration) -> Option<Response> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(response) = state.items.pop_front() {
                return Some(response);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            state.waiting += 1;
            let (guard, _) = self
                .available
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            state.waiting -= 1;
        }
    }

    pub fn try_get_item(&self) -> Option<Response> {
        self.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Number of consumers currently blocked.
    pub fn waiting(&self) -> usize {
        self.lock().waiting
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
