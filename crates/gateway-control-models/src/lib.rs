use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusCounts {
    pub pending: usize,
    pub assigning: usize,
    pub processing: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub index: usize,
    pub address: String,
    pub node_id: Option<String>,
    pub connected: bool,
    pub available: bool,
    pub load: f32,
    pub last_seen_ms: i64,
}

/// Point-in-time view of the dispatch engine, used for diagnostics logging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewaySnapshot {
    pub taken_at_ms: i64,
    pub cached_tasks: usize,
    pub task_capacity: usize,
    pub pending_queue: usize,
    pub processing_queue: usize,
    pub open_streams: usize,
    pub statuses: TaskStatusCounts,
    pub workers: Vec<WorkerSnapshot>,
}

impl GatewaySnapshot {
    pub fn connected_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.connected).count()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}
