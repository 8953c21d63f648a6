//! facegrid-core — shared building blocks for the facegrid pipeline.
//!
//! The gateway, the workers, and the autoscaler never talk to each other
//! directly. They meet at three external services (a message queue, a
//! blob store, and a compute-instance API) plus the recognition function.
//! This crate defines those boundaries as traits, the messages that cross
//! them, the TOML configuration shared by every role, and in-memory
//! implementations used by tests and by `facegridd standalone`.
//!
//! # Message formats
//!
//! ```text
//! request queue   "<filename>"          e.g. "photo.jpg"
//! response queue  "<job_id>:<label>"    e.g. "photo:alice"
//! input blob      key = filename        bytes of the upload
//! output blob     key = job_id          label as UTF-8
//! ```

pub mod config;
pub mod error;
pub mod memory;
pub mod service;
pub mod types;

pub use config::{FacegridConfig, Role};
pub use error::{ConfigError, PipelineError, PipelineResult};
pub use service::{BlobStore, InstanceProvider, QueueService, Recognizer};
pub use types::*;
