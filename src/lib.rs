pub mod events;
pub mod logging;
pub mod quota;
pub mod uploader;

// Re-export commonly used types
pub use events::{Event, EventBroadcaster};
pub use logging::{LogConfig, LogGuard, init_logging};
pub use quota::SpaceMonitor;
pub use uploader::{
    BatchReport, ErrorKind, FileSource, TaskError, TaskId, TaskRegistry, TaskSnapshot, TaskStatus, UploadError,
    UploadResult, UploaderConfig,
};
