//! Chunk layout and streaming chunk bodies

use bytes::Bytes;
use futures::Stream;
use std::io;
use std::ops::{Range, RangeInclusive};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader, SeekFrom, Take};
use tokio_util::io::ReaderStream;

/// Buffer size for streaming reads (64KB)
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// How a file of a given size splits into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    /// `chunk_size` must be non-zero
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        Self {
            total_size,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// `ceil(total_size / chunk_size)`
    pub fn chunk_count(&self) -> u32 {
        self.total_size.div_ceil(self.chunk_size) as u32
    }

    /// Byte range covered by chunk `index`
    pub fn range(&self, index: u32) -> Range<u64> {
        let start = (index as u64 * self.chunk_size).min(self.total_size);
        let end = (start + self.chunk_size).min(self.total_size);
        start..end
    }

    pub fn chunk_len(&self, index: u32) -> u64 {
        let range = self.range(index);
        range.end - range.start
    }

    pub fn chunk(&self, index: u32) -> ChunkInfo {
        let range = self.range(index);
        ChunkInfo::new(index, range.start, range.end - range.start)
    }

    pub fn contains(&self, index: u32) -> bool {
        index < self.chunk_count()
    }

    /// Send phases in order: the first chunk alone, the middle window,
    /// then the last chunk alone
    pub fn phases(&self) -> Vec<RangeInclusive<u32>> {
        match self.chunk_count() {
            0 => Vec::new(),
            1 => vec![0..=0],
            2 => vec![0..=0, 1..=1],
            count => vec![0..=0, 1..=count - 2, count - 1..=count - 1],
        }
    }
}

/// Metadata about a single chunk (without the data)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Chunk index
    pub index: u32,
    /// Byte offset in file
    pub offset: u64,
    /// Expected chunk size
    pub size: u64,
}

impl ChunkInfo {
    pub fn new(index: u32, offset: u64, size: u64) -> Self {
        Self {
            index,
            offset,
            size,
        }
    }
}

/// Callback receiving the cumulative number of bytes read for one chunk
pub type ReadProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Streams one chunk's byte range from disk, reporting bytes as they are
/// handed to the request body.
///
/// Fails with `UnexpectedEof` if the file ends before the declared size.
pub struct ChunkStream {
    inner: ReaderStream<Take<BufReader<File>>>,
    expected: u64,
    sent: u64,
    finished: bool,
    on_read: ReadProgress,
}

impl ChunkStream {
    /// Open a stream over `chunk` in the file at `path`
    pub async fn open(path: &Path, chunk: &ChunkInfo, on_read: ReadProgress) -> io::Result<Self> {
        let file = File::open(path).await?;
        let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, file);
        reader.seek(SeekFrom::Start(chunk.offset)).await?;

        Ok(Self {
            inner: ReaderStream::with_capacity(reader.take(chunk.size), STREAM_BUFFER_SIZE),
            expected: chunk.size,
            sent: 0,
            finished: false,
            on_read,
        })
    }
}

impl Stream for ChunkStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.sent += bytes.len() as u64;
                (self.on_read)(self.sent);
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                if self.sent < self.expected {
                    let message = format!(
                        "file ended after {} of {} chunk bytes",
                        self.sent, self.expected
                    );
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        message,
                    ))));
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
