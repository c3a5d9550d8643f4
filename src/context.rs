use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::task_cache::TaskCache;
use crate::task_queue::TaskQueue;
use crate::worker_pool::WorkerPool;

/// Everything the multiplexer and the background loops share. Built once at
/// startup and handed around as `Arc<GatewayContext>`.
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub pool: Arc<WorkerPool>,
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: Arc<AtomicBool>,
}

impl GatewayContext {
    pub fn new(config: GatewayConfig) -> Self {
        let limits = &config.limits;
        let pool = Arc::new(WorkerPool::new(
            limits.max_workers,
            Duration::from_millis(config.workers.connect_timeout_ms),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            TaskCache::new(limits.max_tasks),
            TaskQueue::new(limits.max_pending, limits.max_processing),
            Arc::clone(&pool),
        ));

        Self {
            config,
            pool,
            dispatcher,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connects every configured worker address. Failures are logged and
    /// skipped; the gateway keeps serving with whatever connected.
    pub fn connect_workers(&self) -> usize {
        let mut connected = 0;
        for address in &self.config.workers.addresses {
            match self.pool.add_worker(address) {
                Ok(index) => {
                    connected += 1;
                    info!(worker = index, %address, "worker registered");
                }
                Err(e) => warn!(%address, error = %e, "worker not registered"),
            }
        }
        connected
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.dispatcher.notify();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
