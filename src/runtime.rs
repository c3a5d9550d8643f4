use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::context::GatewayContext;
use crate::dispatch::Assignment;
use crate::task::now_millis;

/// The two background threads. Both exit once the shutdown flag is set.
pub struct LoopHandles {
    assignment: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

impl LoopHandles {
    pub fn join(self) {
        if self.assignment.join().is_err() {
            warn!("assignment loop panicked");
        }
        if self.delivery.join().is_err() {
            warn!("delivery loop panicked");
        }
    }
}

pub fn spawn_loops(ctx: &Arc<GatewayContext>) -> io::Result<LoopHandles> {
    let assignment_ctx = Arc::clone(ctx);
    let assignment = thread::Builder::new()
        .name("gateway_assign".to_string())
        .spawn(move || run_assignment_loop(&assignment_ctx))?;

    let delivery_ctx = Arc::clone(ctx);
    let delivery = thread::Builder::new()
        .name("gateway_deliver".to_string())
        .spawn(move || run_delivery_loop(&delivery_ctx))?;

    Ok(LoopHandles {
        assignment,
        delivery,
    })
}

pub fn run_assignment_loop(ctx: &GatewayContext) {
    let backoff = ctx.config.dispatch.idle_backoff();
    debug!("assignment loop started");
    while !ctx.is_shutting_down() {
        if !assignment_tick(ctx) {
            thread::sleep(backoff);
        }
    }
    debug!("assignment loop stopped");
}

/// One assignment attempt. Returns false when there was nothing to do.
///
/// While workers are connected but all report busy, pending work waits.
/// With no worker connected at all the task fails straight away.
pub fn assignment_tick(ctx: &GatewayContext) -> bool {
    let dispatcher = &ctx.dispatcher;
    if dispatcher.queue().is_pending_empty() {
        return false;
    }
    if ctx.pool.connected_count() > 0 && !ctx.pool.has_available_worker() {
        return false;
    }

    match dispatcher.assign_next() {
        Assignment::Idle | Assignment::Saturated => false,
        Assignment::Failed { .. } => {
            dispatcher.notify();
            true
        }
        Assignment::Assigned { .. } | Assignment::Skipped { .. } => true,
    }
}

pub fn run_delivery_loop(ctx: &GatewayContext) {
    let backoff = ctx.config.dispatch.idle_backoff();
    let snapshot_every = Duration::from_secs(ctx.config.dispatch.snapshot_interval_secs);
    let mut last_snapshot = Instant::now();

    debug!("delivery loop started");
    while !ctx.is_shutting_down() {
        let busy = delivery_tick(ctx);

        if !snapshot_every.is_zero() && last_snapshot.elapsed() >= snapshot_every {
            log_snapshot(ctx);
            last_snapshot = Instant::now();
        }
        if !busy {
            thread::sleep(backoff);
        }
    }
    debug!("delivery loop stopped");
}

/// Polls every worker once and applies what arrived. Returns false when no
/// worker had anything to say.
pub fn delivery_tick(ctx: &GatewayContext) -> bool {
    let dispatcher = &ctx.dispatcher;
    let messages = ctx.pool.poll_all();

    let mut touched = false;
    for (worker, raw) in &messages {
        touched |= dispatcher.ingest_worker_message(*worker, raw).touches_stream();
    }

    for worker in ctx.pool.drain_disconnected() {
        let failed = dispatcher.fail_worker_tasks(worker);
        warn!(worker, failed, "worker lost");
    }

    if let Some(timeout_ms) = ctx.config.dispatch.task_timeout_ms {
        let expired = dispatcher.sweep_timeouts(now_millis(), timeout_ms);
        if expired > 0 {
            warn!(expired, timeout_ms, "tasks timed out");
        }
    }

    if touched {
        dispatcher.notify();
    }
    !messages.is_empty()
}

fn log_snapshot(ctx: &GatewayContext) {
    let snapshot = ctx.dispatcher.snapshot();
    info!(
        cached = snapshot.cached_tasks,
        pending = snapshot.pending_queue,
        processing = snapshot.processing_queue,
        streams = snapshot.open_streams,
        workers = snapshot.connected_workers(),
        "gateway snapshot"
    );
    debug!(snapshot = %snapshot.to_json(), "gateway snapshot detail");
}
