//! Resumable chunked uploads.
//!
//! A task goes through digest, resume probe, a windowed chunk transfer and
//! finally a watch of server-side transcoding. [`TaskRegistry`] owns the
//! tasks and is the entry point for callers.

pub mod chunk;
mod config;
pub mod digest;
pub mod error;
mod pipeline;
pub mod probe;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod transcode;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use chunk::{ChunkInfo, ChunkPlan};
pub use config::UploaderConfig;
pub use error::{ErrorKind, TaskError, UploadError, UploadResult};
pub use registry::{BatchReport, TaskRegistry};
pub use task::{FileSource, TaskId, TaskSnapshot, TaskStatus};
