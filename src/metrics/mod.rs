//! Prometheus metrics for the dispatch engine.
//!
//! Scoped to what the core dispatch pipeline itself produces: request latency, upstream
//! status class, cache hit/miss for the Store Client's read-through caches, and per-source
//! concurrency occupancy. No token-counting metrics — the base spec excludes token counting
//! as a feature, and nothing downstream of the relay parses token counts for metrics purposes.

mod dispatch;

pub use dispatch::DispatchMetrics;
