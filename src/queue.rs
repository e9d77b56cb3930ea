use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::chunk::Message;
use crate::error::PoolError;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The pool's outgoing queue, shared by every link writer.
pub(crate) struct ChunkQueue {
    capacity: Option<usize>,
    state: Mutex<QueueState>,
    readable: Condvar,
    writable: Condvar,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Message>,
    closed: bool,
    // No link is left and the pool fails fast.
    stalled: bool,
}

impl ChunkQueue {
    pub(crate) fn new(capacity: Option<usize>) -> ChunkQueue {
        ChunkQueue {
            capacity,
            state: Mutex::new(QueueState::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    /// Appends a message, waiting while a bounded queue is full.
    pub(crate) fn push(&self, message: Message) -> Result<(), PoolError> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }
            if state.stalled {
                return Err(PoolError::Exhausted);
            }
            if self.capacity.is_none_or(|cap| state.items.len() < cap) {
                break;
            }
            state = self
                .writable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.items.push_back(message);
        self.readable.notify_one();
        Ok(())
    }

    /// Puts a message that failed on one link back at the head of the queue.
    /// Capacity is ignored: the message already held a slot.
    pub(crate) fn requeue(&self, message: Message) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.items.push_front(message);
        self.readable.notify_one();
    }

    /// Takes the next message, waiting until one is available.
    /// Returns `None` once the queue is closed.
    pub(crate) fn pop(&self) -> Option<Message> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return None;
            }
            if let Some(message) = state.items.pop_front() {
                self.writable.notify_one();
                return Some(message);
            }
            state = self
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn set_stalled(&self, stalled: bool) {
        let mut state = lock(&self.state);
        state.stalled = stalled;
        if stalled {
            self.writable.notify_all();
        }
    }

    pub(crate) fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.items.clear();
        self.readable.notify_all();
        self.writable.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).items.len()
    }
}
