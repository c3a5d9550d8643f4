use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::errors::AdmissionError;
use crate::task::{now_millis, ConnectionId, TaskPayload, TaskRecord, TaskStatus};

/// Bounded store of live tasks. The only place a `TaskRecord` lives; every
/// other component refers to it by request id.
pub struct TaskCache {
    capacity: usize,
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl TaskCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tasks: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(
        &self,
        request_id: &str,
        owning_connection: ConnectionId,
        payload: TaskPayload,
        priority: i32,
    ) -> Result<TaskRecord, AdmissionError> {
        let mut tasks = self.lock();
        if tasks.contains_key(request_id) {
            return Err(AdmissionError::DuplicateRequest {
                request_id: request_id.to_string(),
            });
        }
        if tasks.len() >= self.capacity {
            return Err(AdmissionError::Rejected {
                capacity: self.capacity,
            });
        }

        let record = TaskRecord::new(request_id.to_string(), owning_connection, payload, priority);
        tasks.insert(request_id.to_string(), record.clone());
        Ok(record)
    }

    pub fn get(&self, request_id: &str) -> Option<TaskRecord> {
        self.lock().get(request_id).cloned()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    /// Silently ignores unknown ids and moves the lifecycle does not allow: a
    /// late worker message racing a completion is expected.
    pub fn update_status(&self, request_id: &str, status: TaskStatus) {
        self.transition(request_id, status);
    }

    /// Runs `f` on the record under the cache lock. Returns `None` when absent.
    pub fn update<R>(&self, request_id: &str, f: impl FnOnce(&mut TaskRecord) -> R) -> Option<R> {
        self.lock().get_mut(request_id).map(f)
    }

    /// Moves a live record to `next` if the lifecycle allows it. Returns the
    /// updated record, or `None` when absent or the move is not legal.
    pub fn transition(&self, request_id: &str, next: TaskStatus) -> Option<TaskRecord> {
        let mut tasks = self.lock();
        let record = tasks.get_mut(request_id)?;
        if !record.status.can_transition_to(next) {
            return None;
        }
        record.status = next;
        match next {
            TaskStatus::Assigning => {
                record.assigned_at = now_millis();
                record.last_progress_at = record.assigned_at;
            }
            s if s.is_terminal() => record.completed_at = now_millis(),
            _ => {}
        }
        Some(record.clone())
    }

    /// The only deallocation point for a record. Callers have already taken it
    /// out of any queue.
    pub fn remove(&self, request_id: &str) -> Option<TaskRecord> {
        self.lock().remove(request_id)
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Vec<TaskRecord> {
        self.lock()
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect()
    }

    pub fn list_by_owner(&self, owner: ConnectionId) -> Vec<TaskRecord> {
        self.lock()
            .values()
            .filter(|record| record.owning_connection == owner)
            .cloned()
            .collect()
    }

    pub fn list_by_worker(&self, worker: usize) -> Vec<TaskRecord> {
        self.lock()
            .values()
            .filter(|record| record.worker == Some(worker))
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<TaskRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
