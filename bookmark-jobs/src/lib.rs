#![doc = include_str!("../README.md")]

pub mod bookmark;
pub mod core;
pub mod service;

/// Job-type to handler routing.
pub mod registry {
    pub mod handler_registry;
    pub mod wrapped_job;
}

/// Bounded worker pool and its lifecycle guard.
#[cfg(feature = "runner")]
pub mod runner {
    pub mod config;
    pub mod job_runner;
}


/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::core::{
        job::{Job, JobDescriptor, JobFilter, JobStatus, Outcome},
        job_handle::JobHandle,
        job_processor::{JobError, JobProcessor},
        memory_store::MemoryJobStore,
        store::{JobStore, QueueError},
        Duration, Xid,
    };
    pub use super::registry::handler_registry::{HandlerRegistry, RunnerError};
    #[cfg(feature = "runner")]
    pub use super::runner::{
        config::RunnerConfig,
        job_runner::{DrainSummary, JobRunner},
    };
    pub use super::service::JobService;
    pub use bincode::{Decode, Encode};
}
