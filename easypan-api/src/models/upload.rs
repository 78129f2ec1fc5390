use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::pin::Pin;

/// Streaming body of a single chunk
pub type ChunkBody = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send + 'static>>;

/// Status reported by the server after receiving a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// More chunks are expected
    Uploading,
    /// The last chunk arrived and the file has been assembled
    UploadFinish,
    /// The server already had the content, nothing else needs to be sent
    UploadSeconds,
    /// Anything this client does not know about
    #[serde(other)]
    Unknown,
}

/// Response to a chunk upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    /// Server-side upload identity; may differ from the one that was sent
    #[serde(default)]
    pub file_id: Option<String>,
    pub status: UploadStatus,
}

/// Form fields of a chunk upload request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkUploadForm {
    /// Upload identity
    pub file_id: String,
    /// Destination folder
    pub file_pid: String,
    /// Declared file name
    pub file_name: String,
    /// Hex MD5 of the whole file
    pub file_md5: String,
    /// Zero-based chunk index
    pub chunk_index: u32,
    /// Total number of chunks
    pub chunks: u32,
}

/// A chunk upload request: form fields plus the streamed chunk bytes
pub struct ChunkUpload {
    pub form: ChunkUploadForm,
    /// Exact number of bytes `body` yields
    pub length: u64,
    pub body: ChunkBody,
}

impl fmt::Debug for ChunkUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkUpload")
            .field("form", &self.form)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Server-side processing status of an uploaded file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscodeStatus {
    /// Still being processed
    Pending,
    /// Processing failed
    Failed,
    /// Processing finished, the file is usable
    Done,
}

impl TranscodeStatus {
    /// Map the numeric file status used by the server
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => TranscodeStatus::Failed,
            2 => TranscodeStatus::Done,
            _ => TranscodeStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TranscodeStatus::Pending)
    }
}

/// Payload of a transcode status push event
#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct TranscodePayload {
    pub status: i32,
}
