//! Buffer pools and metrics.

pub mod memory_pool;
pub mod metrics;

pub use memory_pool::{i32_pool, i8_pool, BufferPool, PooledBuffer};
pub use metrics::{top_k, GenerationMetrics, Profiler};
