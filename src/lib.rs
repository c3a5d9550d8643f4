pub mod config;
pub mod context;
pub mod dispatch;
pub mod errors;
pub mod logging;
pub mod multiplexer;
pub mod runtime;
pub mod task;
pub mod task_cache;
pub mod task_queue;
pub mod token_stream;
pub mod transport;
pub mod worker_pool;
