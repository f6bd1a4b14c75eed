//! # Voxflow Worker
//!
//! The durable workflow layer of the Voxflow batch speech-to-text pipeline:
//! an in-process workflow runtime with activity retries, heartbeats, child
//! workflows and cancellation; the transcription and storage activities;
//! the four workflow families (single-file, batch, batch-with-retry,
//! fallback/smart-fallback); the object-store client; and the worker host
//! with its HTTP health surface.
//!
//! The [`voxflow_providers_sdk`] crate supplies the provider framework this
//! worker drives.

pub mod activities;
pub mod config;
pub mod engine;
pub mod health;
pub mod storage;
pub mod worker;
pub mod workflows;

#[cfg(test)]
pub(crate) mod testutil;

pub use activities::Activities;
pub use engine::{ActivityContext, ActivityOptions, RetryPolicy, Runtime, WorkflowContext, WorkflowError};
pub use storage::{MemoryObjectStore, ObjectStore, S3ObjectStore};
pub use worker::WorkerHost;
