use crate::client::{Client, RequestOptions};
use crate::error::{ApiError, ApiResult};
use crate::models::upload::*;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::Body;
use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use serde::Serialize;

/// Chunked upload API methods
#[async_trait]
pub trait UploadApi: Send + Sync {
    /// List the chunk indices the server already holds for an upload
    async fn probe_uploaded_chunks(&self, file_id: &str, file_pid: &str) -> ApiResult<Vec<u32>>;

    /// Upload one chunk
    async fn upload_chunk(&self, upload: ChunkUpload) -> ApiResult<UploadResult>;

    /// Open a server-push stream of transcode status for a file
    async fn subscribe_transcode_status(&self, file_id: &str) -> ApiResult<TranscodeSubscription>;
}

/// A live transcode status subscription.
///
/// Dropping the subscription closes the underlying connection.
pub struct TranscodeSubscription {
    inner: BoxStream<'static, ApiResult<TranscodeStatus>>,
}

impl TranscodeSubscription {
    /// Wrap any stream of statuses
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = ApiResult<TranscodeStatus>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    /// Wait for the next status. `Ok(None)` means the server closed the stream.
    pub async fn next_event(&mut self) -> ApiResult<Option<TranscodeStatus>> {
        self.inner.next().await.transpose()
    }
}

impl std::fmt::Debug for TranscodeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeSubscription").finish_non_exhaustive()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadedChunksQuery<'a> {
    file_id: &'a str,
    file_pid: &'a str,
}

/// Decode the `data:` field of one push event
fn parse_transcode_event(data: &str) -> ApiResult<TranscodeStatus> {
    let payload: TranscodePayload = serde_json::from_str(data)?;
    Ok(TranscodeStatus::from_code(payload.status))
}

#[async_trait]
impl UploadApi for Client {
    async fn probe_uploaded_chunks(&self, file_id: &str, file_pid: &str) -> ApiResult<Vec<u32>> {
        let chunks: Option<Vec<u32>> = self
            .post_form(
                "/file/uploadedChunks",
                &UploadedChunksQuery { file_id, file_pid },
                RequestOptions::new(),
            )
            .await?;
        Ok(chunks.unwrap_or_default())
    }

    async fn upload_chunk(&self, upload: ChunkUpload) -> ApiResult<UploadResult> {
        let ChunkUpload { form, length, body } = upload;
        let url = self.build_url("/file/uploadFile");

        tracing::trace!(
            target: "api",
            file_id = %form.file_id,
            chunk = form.chunk_index,
            chunks = form.chunks,
            length,
            "Uploading chunk"
        );

        let part = Part::stream_with_length(Body::wrap_stream(body), length)
            .file_name(form.file_name.clone())
            .mime_str("application/octet-stream")?;

        let multipart = Form::new()
            .text("fileId", form.file_id)
            .text("filePid", form.file_pid)
            .text("fileName", form.file_name)
            .text("fileMd5", form.file_md5)
            .text("chunkIndex", form.chunk_index.to_string())
            .text("chunks", form.chunks.to_string())
            .part("file", part);

        let builder = self
            .prepare(self.http_client.post(&url).multipart(multipart), &RequestOptions::new())
            .await;

        let result: Option<UploadResult> = self.execute(builder).await?;
        result.ok_or_else(|| ApiError::Other("API returned success but no data".to_string()))
    }

    async fn subscribe_transcode_status(&self, file_id: &str) -> ApiResult<TranscodeSubscription> {
        let url = self.build_url("/file/transferStatusSse");
        let opts = RequestOptions::new().with_timeout(self.config().stream_timeout);

        let builder = self
            .prepare(
                self.http_client
                    .get(&url)
                    .query(&[("fileId", file_id)])
                    .header(ACCEPT, "text/event-stream"),
                &opts,
            )
            .await;

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }

        tracing::debug!(target: "api", file_id = %file_id, "Transcode status stream opened");

        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| {
                let item = match event {
                    // Keep-alives carry no data
                    Ok(event) if event.data.trim().is_empty() => None,
                    Ok(event) => Some(parse_transcode_event(&event.data)),
                    Err(e) => Some(Err(ApiError::Http(e.to_string()))),
                };
                futures::future::ready(item)
            });

        Ok(TranscodeSubscription::from_stream(stream))
    }
}
