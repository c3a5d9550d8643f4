use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Orders request ids; the records themselves stay in the `TaskCache`.
///
/// Both queues are plain FIFO. The task priority is not consulted.
pub struct TaskQueue {
    max_pending: usize,
    max_processing: usize,
    pending: Mutex<VecDeque<String>>,
    processing: Mutex<VecDeque<String>>,
}

fn guard(queue: &Mutex<VecDeque<String>>) -> MutexGuard<'_, VecDeque<String>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_id(queue: &mut VecDeque<String>, request_id: &str) -> bool {
    match queue.iter().position(|id| id == request_id) {
        Some(pos) => {
            queue.remove(pos);
            true
        }
        None => false,
    }
}

impl TaskQueue {
    pub fn new(max_pending: usize, max_processing: usize) -> Self {
        Self {
            max_pending,
            max_processing,
            pending: Mutex::new(VecDeque::with_capacity(max_pending)),
            processing: Mutex::new(VecDeque::with_capacity(max_processing)),
        }
    }

    pub fn enqueue_pending(&self, request_id: &str) -> bool {
        let mut queue = guard(&self.pending);
        if queue.len() >= self.max_pending {
            return false;
        }
        queue.push_back(request_id.to_string());
        true
    }

    pub fn dequeue_pending(&self) -> Option<String> {
        guard(&self.pending).pop_front()
    }

    /// Idempotent.
    pub fn remove_from_pending(&self, request_id: &str) -> bool {
        remove_id(&mut guard(&self.pending), request_id)
    }

    pub fn enqueue_processing(&self, request_id: &str) -> bool {
        let mut queue = guard(&self.processing);
        if queue.len() >= self.max_processing {
            return false;
        }
        queue.push_back(request_id.to_string());
        true
    }

    /// O(n) and idempotent: completion and a timeout sweep may both try.
    pub fn remove_from_processing(&self, request_id: &str) -> bool {
        remove_id(&mut guard(&self.processing), request_id)
    }

    #[cfg(test)]
    pub fn processing_contains(&self, request_id: &str) -> bool {
        guard(&self.processing).iter().any(|id| id == request_id)
    }

    pub fn pending_len(&self) -> usize {
        guard(&self.pending).len()
    }

    pub fn processing_len(&self) -> usize {
        guard(&self.processing).len()
    }

    pub fn is_pending_empty(&self) -> bool {
        guard(&self.pending).is_empty()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn max_processing(&self) -> usize {
        self.max_processing
    }
}
