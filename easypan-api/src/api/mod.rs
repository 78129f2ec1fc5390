pub mod upload;
pub mod user;

// Re-export for convenience
pub use upload::{TranscodeSubscription, UploadApi};
pub use user::UserApi;
