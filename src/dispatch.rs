use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use gateway_control_models::{GatewaySnapshot, TaskStatusCounts};
use gateway_protocol::{decode, encode, InferenceRequest, TaskAssignment, TokenResponse, WireMessage};
use mio::Waker;
use tracing::{debug, info, warn};

use crate::errors::AdmissionError;
use crate::task::{generate_request_id, now_millis, ConnectionId, TaskPayload, TaskRecord, TaskStatus};
use crate::task_cache::TaskCache;
use crate::task_queue::TaskQueue;
use crate::token_stream::TokenStreamBuffer;
use crate::worker_pool::WorkerPool;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of one assignment step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// Nothing pending.
    Idle,
    /// The processing queue is at its bound; pending work waits.
    Saturated,
    /// The dequeued id no longer had a live record.
    Skipped { request_id: String },
    Assigned { request_id: String, worker: usize },
    Failed { request_id: String, reason: String },
}

/// What a single worker line did to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Appended { request_id: String },
    Finished { request_id: String },
    Failed { request_id: String },
    /// No live record for the id; the message was dropped.
    Orphaned { request_id: String },
    StatusUpdated,
    Heartbeat,
    Ignored,
    DecodeFailed,
}

impl IngestOutcome {
    /// True when a client-facing buffer changed.
    pub fn touches_stream(&self) -> bool {
        matches!(
            self,
            Self::Appended { .. } | Self::Finished { .. } | Self::Failed { .. }
        )
    }
}

/// Next step for a client waiting on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drain {
    Fragment(String),
    /// Stream finished and every fragment was handed out.
    Finished,
    /// The task ended in FAILED or TIMEOUT; the buffer is released.
    Failed(String),
    /// Nothing new yet.
    Nothing,
}

/// Ties the cache, the queues, the worker pool and the per-request output
/// buffers together.
///
/// Lock order: `txn`, then `streams`, then the cache and queue locks (which
/// are only ever held inside their own methods). No lock is held across a
/// worker write.
pub struct Dispatcher {
    cache: TaskCache,
    queue: TaskQueue,
    pool: Arc<WorkerPool>,
    streams: Mutex<HashMap<String, TokenStreamBuffer>>,
    txn: Mutex<()>,
    waker: Mutex<Option<Arc<Waker>>>,
}

impl Dispatcher {
    pub fn new(cache: TaskCache, queue: TaskQueue, pool: Arc<WorkerPool>) -> Self {
        Self {
            cache,
            queue,
            pool,
            streams: Mutex::new(HashMap::new()),
            txn: Mutex::new(()),
            waker: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &TaskCache {
        &self.cache
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn set_waker(&self, waker: Arc<Waker>) {
        *lock(&self.waker) = Some(waker);
    }

    /// Wakes the multiplexer so it runs a delivery sweep.
    pub fn notify(&self) {
        if let Some(waker) = lock(&self.waker).as_ref() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "failed to wake multiplexer");
            }
        }
    }

    /// Creates the record and queues it as PENDING.
    pub fn admit(
        &self,
        request: &InferenceRequest,
        owner: ConnectionId,
    ) -> Result<TaskRecord, AdmissionError> {
        let request_id = request
            .requested_id()
            .map(str::to_string)
            .unwrap_or_else(generate_request_id);

        let _txn = lock(&self.txn);

        // A failed task keeps its buffer until the client read the error.
        if lock(&self.streams).contains_key(&request_id) {
            return Err(AdmissionError::DuplicateRequest { request_id });
        }

        let record = self.cache.create(
            &request_id,
            owner,
            TaskPayload::from(request),
            request.priority,
        )?;

        if !self.queue.enqueue_pending(&request_id) {
            self.cache.remove(&request_id);
            return Err(AdmissionError::QueueFull {
                capacity: self.queue.max_pending(),
            });
        }

        debug!(
            request_id = %record.request_id,
            owner,
            model = %record.payload.model,
            stream = record.payload.stream,
            "request admitted"
        );
        Ok(record)
    }

    /// Moves at most one pending task to a worker.
    pub fn assign_next(&self) -> Assignment {
        if self.queue.processing_len() >= self.queue.max_processing() {
            return Assignment::Saturated;
        }

        let Some(request_id) = self.queue.dequeue_pending() else {
            return Assignment::Idle;
        };

        let Some(record) = self.cache.transition(&request_id, TaskStatus::Assigning) else {
            debug!(%request_id, "pending id has no live record, skipping");
            return Assignment::Skipped { request_id };
        };

        let Some(worker) = self.pool.select_worker() else {
            let reason = "no worker available".to_string();
            self.fail_task(&request_id, TaskStatus::Failed, &reason);
            return Assignment::Failed { request_id, reason };
        };
        self.cache.update(&request_id, |r| r.worker = Some(worker));

        let task = WireMessage::Task(TaskAssignment {
            id: record.request_id.clone(),
            client_socket: record.owning_connection,
            model: record.payload.model.clone(),
            prompt: record.payload.prompt.clone(),
            max_tokens: record.payload.max_tokens,
            stream: record.payload.stream,
        });
        let bytes = match encode(&task) {
            Ok(bytes) => bytes,
            Err(e) => {
                let reason = format!("failed to encode task: {e}");
                self.fail_task(&request_id, TaskStatus::Failed, &reason);
                return Assignment::Failed { request_id, reason };
            }
        };

        if let Err(e) = self.pool.send(worker, &bytes) {
            let reason = e.to_string();
            self.fail_task(&request_id, TaskStatus::Failed, &reason);
            return Assignment::Failed { request_id, reason };
        }

        let _txn = lock(&self.txn);
        let live = self
            .cache
            .update(&request_id, |r| {
                if r.status == TaskStatus::Assigning {
                    r.status = TaskStatus::Processing;
                }
            })
            .is_some();
        if live && !self.queue.enqueue_processing(&request_id) {
            warn!(%request_id, "processing queue full after dispatch");
        }

        info!(%request_id, worker, "task dispatched");
        Assignment::Assigned { request_id, worker }
    }

    /// Applies one raw line received from `worker`.
    pub fn ingest_worker_message(&self, worker: usize, raw: &str) -> IngestOutcome {
        let message = match decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(worker, error = %e, "dropping undecodable worker message");
                return IngestOutcome::DecodeFailed;
            }
        };
        self.pool.touch(worker);

        match message {
            WireMessage::Response(response) => self.ingest_response(worker, response),
            WireMessage::Error(report) => {
                if report.id.is_empty() {
                    warn!(worker, message = %report.message, "worker reported an error without a request id");
                    return IngestOutcome::Ignored;
                }
                if self.fail_task(&report.id, TaskStatus::Failed, &report.message) {
                    IngestOutcome::Failed {
                        request_id: report.id,
                    }
                } else {
                    debug!(worker, request_id = %report.id, "error for unknown request dropped");
                    IngestOutcome::Orphaned {
                        request_id: report.id,
                    }
                }
            }
            WireMessage::Status(status) => {
                self.pool
                    .update_status(worker, &status.node_id, status.available, status.load);
                IngestOutcome::StatusUpdated
            }
            WireMessage::Heartbeat => IngestOutcome::Heartbeat,
            other => {
                debug!(worker, kind = other.kind(), "unexpected message from worker");
                IngestOutcome::Ignored
            }
        }
    }

    /// Record check and buffer update both happen under `txn`.
    fn ingest_response(&self, worker: usize, response: TokenResponse) -> IngestOutcome {
        let request_id = response.id;
        let _txn = lock(&self.txn);

        let now = now_millis();
        let Some(status) = self.cache.update(&request_id, |record| {
            record.last_progress_at = now;
            record.status
        }) else {
            debug!(worker, %request_id, "orphaned delivery dropped");
            return IngestOutcome::Orphaned { request_id };
        };
        if status == TaskStatus::Assigning {
            self.cache.transition(&request_id, TaskStatus::Processing);
        }

        if self.stream_finished(&request_id) {
            debug!(worker, %request_id, "late fragment after stream end dropped");
            return IngestOutcome::Ignored;
        }
        if let Some(fragment) = response.token.or(response.result) {
            self.add_token(&request_id, &fragment);
        }
        if response.finished {
            self.mark_stream_finished(&request_id);
            debug!(worker, %request_id, "stream finished");
            IngestOutcome::Finished { request_id }
        } else {
            IngestOutcome::Appended { request_id }
        }
    }

    /// Appends one fragment, creating the buffer on first use.
    pub fn add_token(&self, request_id: &str, token: &str) -> bool {
        lock(&self.streams)
            .entry(request_id.to_string())
            .or_default()
            .append(token)
    }

    pub fn mark_stream_finished(&self, request_id: &str) {
        lock(&self.streams)
            .entry(request_id.to_string())
            .or_default()
            .mark_finished();
    }

    pub fn get_token_list(&self, request_id: &str) -> Vec<String> {
        lock(&self.streams)
            .get(request_id)
            .map(|buffer| buffer.fragments().to_vec())
            .unwrap_or_default()
    }

    /// The only place a buffer is released.
    pub fn clear_token_list(&self, request_id: &str) {
        lock(&self.streams).remove(request_id);
    }

    /// Hands out the next undelivered fragment for `request_id`.
    pub fn next_fragment(&self, request_id: &str) -> Drain {
        let mut streams = lock(&self.streams);
        let Some(buffer) = streams.get_mut(request_id) else {
            if self.cache.contains(request_id) {
                return Drain::Nothing;
            }
            return Drain::Failed("request is no longer tracked".to_string());
        };

        if let Some(failure) = buffer.failure().map(str::to_string) {
            drop(streams);
            self.clear_token_list(request_id);
            return Drain::Failed(failure);
        }
        let next = buffer.next_unread().map(str::to_string);
        if let Some(fragment) = next {
            drop(streams);
            self.cache
                .update(request_id, |r| r.delivered_fragments += 1);
            return Drain::Fragment(fragment);
        }
        if buffer.is_completely_finished() {
            return Drain::Finished;
        }
        Drain::Nothing
    }

    /// Closes out a fully delivered stream: COMPLETED, then released from the
    /// queues, the cache and the buffer map.
    pub fn finish_delivery(&self, request_id: &str) {
        let _txn = lock(&self.txn);
        let record = self.cache.transition(request_id, TaskStatus::Completed);
        self.queue.remove_from_processing(request_id);
        self.queue.remove_from_pending(request_id);
        self.cache.remove(request_id);
        self.clear_token_list(request_id);

        if let Some(record) = record {
            info!(
                request_id,
                worker = ?record.worker,
                fragments = record.delivered_fragments,
                elapsed_ms = record.completed_at.saturating_sub(record.created_at),
                "request completed"
            );
        }
    }

    /// Moves a live task to FAILED/TIMEOUT/CANCELLED and releases it. Failed
    /// and timed out tasks leave a failed buffer behind so the client is told.
    fn fail_task(&self, request_id: &str, status: TaskStatus, message: &str) -> bool {
        let _txn = lock(&self.txn);
        let Some(record) = self.cache.transition(request_id, status) else {
            return false;
        };
        self.queue.remove_from_pending(request_id);
        self.queue.remove_from_processing(request_id);
        self.cache.remove(request_id);

        if status == TaskStatus::Cancelled {
            self.clear_token_list(request_id);
        } else {
            lock(&self.streams)
                .entry(request_id.to_string())
                .or_default()
                .fail(message);
        }

        match status {
            TaskStatus::Cancelled => debug!(request_id, owner = record.owning_connection, "task cancelled"),
            _ => warn!(request_id, %status, worker = ?record.worker, reason = message, "task ended"),
        }
        true
    }

    /// Cancels every task owned by a closed connection. Workers are not told;
    /// their late output is dropped as orphaned.
    pub fn cancel_connection(&self, owner: ConnectionId) -> usize {
        let cancelled = self
            .cache
            .list_by_owner(owner)
            .into_iter()
            .filter(|record| self.fail_task(&record.request_id, TaskStatus::Cancelled, "client disconnected"))
            .count();
        if cancelled > 0 {
            info!(owner, cancelled, "cancelled tasks of closed connection");
        }
        cancelled
    }

    /// Fails the tasks a lost worker was serving, except streams that already
    /// finished and are only waiting to be drained.
    pub fn fail_worker_tasks(&self, worker: usize) -> usize {
        let reason = format!("worker {worker} disconnected");
        let failed = self
            .cache
            .list_by_worker(worker)
            .into_iter()
            .filter(|record| !self.stream_finished(&record.request_id))
            .filter(|record| self.fail_task(&record.request_id, TaskStatus::Failed, &reason))
            .count();
        if failed > 0 {
            self.notify();
        }
        failed
    }

    /// Moves tasks that made no progress for `timeout_ms` to TIMEOUT.
    pub fn sweep_timeouts(&self, now: i64, timeout_ms: u64) -> usize {
        let limit = i64::try_from(timeout_ms).unwrap_or(i64::MAX);
        let reason = format!("no progress for {timeout_ms} ms");
        let expired = self
            .cache
            .list_all()
            .into_iter()
            .filter(|record| record.idle_millis(now) > limit)
            .filter(|record| !self.stream_finished(&record.request_id))
            .filter(|record| self.fail_task(&record.request_id, TaskStatus::Timeout, &reason))
            .count();
        if expired > 0 {
            self.notify();
        }
        expired
    }

    fn stream_finished(&self, request_id: &str) -> bool {
        lock(&self.streams)
            .get(request_id)
            .map(TokenStreamBuffer::is_finished)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        let records = self.cache.list_all();
        let count = |status: TaskStatus| records.iter().filter(|r| r.status == status).count();

        GatewaySnapshot {
            taken_at_ms: now_millis(),
            cached_tasks: records.len(),
            task_capacity: self.cache.capacity(),
            pending_queue: self.queue.pending_len(),
            processing_queue: self.queue.processing_len(),
            open_streams: lock(&self.streams).len(),
            statuses: TaskStatusCounts {
                pending: count(TaskStatus::Pending),
                assigning: count(TaskStatus::Assigning),
                processing: count(TaskStatus::Processing),
            },
            workers: self.pool.snapshot(),
        }
    }
}
