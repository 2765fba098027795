//! Bounded worker pool shared by the push and pull engines.
//!
//! A fixed number of workers drain a queue of `2 * workers` jobs; every job
//! reports through its own result channel.

pub mod worker_pool;

pub use worker_pool::{JobHandle, WorkerPool, DEFAULT_QUEUE_WAIT};
