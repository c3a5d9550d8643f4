use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use inference_gateway::config::GatewayConfig;
use inference_gateway::context::GatewayContext;
use inference_gateway::logging;
use inference_gateway::multiplexer::Multiplexer;
use inference_gateway::runtime::spawn_loops;

fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::resolve(std::env::args().nth(1))
        .context("failed to load gateway configuration")?;
    logging::init(&config.logging.filter);

    let ctx = Arc::new(GatewayContext::new(config));
    let connected = ctx.connect_workers();
    info!(
        connected,
        configured = ctx.config.workers.addresses.len(),
        max_workers = ctx.config.limits.max_workers,
        "worker pool ready"
    );

    let mut multiplexer =
        Multiplexer::bind(Arc::clone(&ctx)).context("failed to bind client listener")?;
    let loops = spawn_loops(&ctx).context("failed to start dispatch loops")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_tasks = ctx.config.limits.max_tasks,
        "inference gateway ready"
    );
    let result = multiplexer.run();

    ctx.request_shutdown();
    loops.join();
    ctx.pool.close_all();
    result.context("client multiplexer failed")?;
    Ok(())
}
