//! # EasyPan API Client
//!
//! Rust client for the EasyPan REST API, covering the endpoints used by
//! the chunked uploader.
//!
//! ## Features
//!
//! - Response envelope decoding with typed errors
//! - Streamed multipart chunk uploads
//! - Transcode status subscriptions over server-sent events
//!
//! ## Example
//!
//! ```no_run
//! use easypan_api::{Client, ClientConfig};
//! use easypan_api::api::{UploadApi, UserApi};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(ClientConfig::new("https://pan.example.com/api"))?;
//!     client.set_token("session-token").await;
//!
//!     let space = client.get_use_space().await?;
//!     println!("{} of {} bytes used", space.use_space, space.total_space);
//!
//!     let held = client.probe_uploaded_chunks("Ab3dE6gH9jK2", "0").await?;
//!     println!("server holds {} chunks", held.len());
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod client;
pub mod error;
pub mod models;

pub use client::{Client, ClientConfig, RequestOptions};
pub use error::{ApiError, ApiResult};
