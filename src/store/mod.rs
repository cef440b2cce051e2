//! Shared concurrent stores
//!
//! Every store is safe for concurrent single-key access from any number of
//! task loops and from the HTTP facade. Locking is sharded per key through
//! `DashMap`; nothing spans more than one key or more than one store.

mod counter;
mod log_buffer;
mod nested_metrics;
mod result_cache;

pub use counter::CounterStore;
pub use log_buffer::LogBuffers;
pub use nested_metrics::NestedMetricsStore;
pub use result_cache::ResultCache;
