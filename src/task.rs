use std::fmt;

use gateway_protocol::InferenceRequest;

/// Weak reference to a client connection: the multiplexer token value. Only
/// used for lookup, never to reach the socket.
pub type ConnectionId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Assigning,
    Processing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// PENDING is entry-only; terminal states are exits from any live state.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Pending => false,
            Self::Assigning => self == Self::Pending,
            Self::Processing => matches!(self, Self::Assigning | Self::Processing),
            Self::Completed => self == Self::Processing,
            Self::Failed | Self::Timeout | Self::Cancelled => true,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Assigning => "ASSIGNING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// What the client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPayload {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub stream: bool,
}

impl From<&InferenceRequest> for TaskPayload {
    fn from(req: &InferenceRequest) -> Self {
        Self {
            model: req.model.clone(),
            prompt: req.prompt.clone(),
            max_tokens: req.max_tokens,
            stream: req.stream,
        }
    }
}

/// State of one in-flight request. Timestamps are unix milliseconds, 0 when
/// not reached yet. `last_progress_at` moves on admission, assignment and
/// every worker response. `priority`: higher is more urgent; carried only, the
/// queues are FIFO.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub request_id: String,
    pub owning_connection: ConnectionId,
    pub payload: TaskPayload,
    pub worker: Option<usize>,
    pub delivered_fragments: usize,
    pub status: TaskStatus,
    pub priority: i32,
    pub created_at: i64,
    pub assigned_at: i64,
    pub completed_at: i64,
    pub last_progress_at: i64,
    pub error_message: Option<String>,
}

impl TaskRecord {
    pub fn new(
        request_id: String,
        owning_connection: ConnectionId,
        payload: TaskPayload,
        priority: i32,
    ) -> Self {
        let created_at = now_millis();
        Self {
            request_id,
            owning_connection,
            payload,
            worker: None,
            delivered_fragments: 0,
            status: TaskStatus::Pending,
            priority,
            created_at,
            assigned_at: 0,
            completed_at: 0,
            last_progress_at: created_at,
            error_message: None,
        }
    }

    /// Time since the task last moved forward.
    pub fn idle_millis(&self, now: i64) -> i64 {
        now.saturating_sub(self.last_progress_at)
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `<unix-ms>-<random u64>`: unique without coordination between producers.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 8];
    let random = match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes),
        // Entropy source unavailable: fall back to a process-local counter so
        // ids stay unique within this process.
        Err(_) => fallback_sequence(),
    };
    format!("{}-{}", now_millis(), random)
}

fn fallback_sequence() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(1);
    SEQ.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generated_ids_are_unique_and_timestamped() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_request_id()).collect();
        assert_eq!(ids.len(), 1000);

        let sample = ids.iter().next().expect("one id");
        let (ts, rnd) = sample.split_once('-').expect("dash separated");
        assert!(ts.parse::<i64>().expect("numeric timestamp") > 0);
        assert!(rnd.parse::<u64>().is_ok());
    }

    #[test]
    fn pending_is_never_reentered() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Assigning,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert!(!status.can_transition_to(TaskStatus::Pending));
        }
    }

    #[test]
    fn lifecycle_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Assigning));
        assert!(TaskStatus::Assigning.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Assigning.can_transition_to(TaskStatus::Failed));

        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Processing));
    }

    #[test]
    fn new_record_starts_pending() {
        let record = TaskRecord::new(
            "r1".to_string(),
            7,
            TaskPayload {
                model: "llama2-7b".to_string(),
                prompt: "hi".to_string(),
                max_tokens: 16,
                stream: true,
            },
            0,
        );
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.owning_connection, 7);
        assert!(record.created_at > 0);
        assert_eq!(record.assigned_at, 0);
        assert_eq!(record.last_progress_at, record.created_at);
        assert_eq!(record.idle_millis(record.created_at + 250), 250);
        assert!(record.worker.is_none());
    }
}
