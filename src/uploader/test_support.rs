//! Scripted server used by the uploader tests

use crate::uploader::UploaderConfig;
use crate::uploader::registry::TaskRegistry;
use crate::uploader::task::TaskSnapshot;
use async_trait::async_trait;
use easypan_api::api::{TranscodeSubscription, UploadApi, UserApi};
use easypan_api::models::upload::{ChunkUpload, TranscodeStatus, UploadResult, UploadStatus};
use easypan_api::models::user::UseSpace;
use easypan_api::{ApiError, ApiResult};
use futures::{StreamExt, stream};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Scripted answer to one chunk send
pub(crate) enum Reply {
    Status(UploadStatus, Option<String>),
    Error(ApiError),
}

/// What the transcode status channel does once subscribed
#[derive(Clone)]
pub(crate) enum TranscodeScript {
    /// Emit these statuses, then close
    Events(Vec<TranscodeStatus>),
    /// Never emit anything
    Pending,
    /// Refuse the subscription
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockEvent {
    Start(u32),
    End(u32),
}

/// One received chunk attempt
#[derive(Debug, Clone)]
pub(crate) struct SentChunk {
    pub file_id: String,
    pub folder_id: String,
    pub file_name: String,
    pub index: u32,
    pub bytes: u64,
}

struct Hold {
    index: u32,
    used: AtomicBool,
    reached: Notify,
    release: Notify,
}

#[derive(Default)]
struct Concurrency {
    current: usize,
    max: usize,
}

pub(crate) struct MockApi {
    resume: Vec<u32>,
    probe_failure: bool,
    delay: Duration,
    transcode: TranscodeScript,
    hold: Option<Hold>,
    replies: Mutex<HashMap<(Option<String>, u32), VecDeque<Reply>>>,
    space: Mutex<UseSpace>,
    space_failure: AtomicBool,

    probes: AtomicUsize,
    space_calls: AtomicUsize,
    sent: Mutex<Vec<SentChunk>>,
    log: Mutex<Vec<MockEvent>>,
    subscriptions: Mutex<Vec<String>>,
    per_file: Mutex<HashMap<String, Concurrency>>,
    global: Mutex<Concurrency>,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            resume: Vec::new(),
            probe_failure: false,
            delay: Duration::ZERO,
            transcode: TranscodeScript::Events(vec![TranscodeStatus::Pending, TranscodeStatus::Done]),
            hold: None,
            replies: Mutex::new(HashMap::new()),
            space: Mutex::new(UseSpace {
                use_space: 1024,
                total_space: 4096,
            }),
            space_failure: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
            space_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            per_file: Mutex::new(HashMap::new()),
            global: Mutex::new(Concurrency::default()),
        }
    }

    /// Indices the server claims to already hold
    pub fn with_resume(mut self, indices: Vec<u32>) -> Self {
        self.resume = indices;
        self
    }

    pub fn with_probe_failure(mut self) -> Self {
        self.probe_failure = true;
        self
    }

    /// Latency of every chunk send, after the body is read
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Replies for `index` of any file, consumed in order
    pub fn with_replies(self, index: u32, replies: Vec<Reply>) -> Self {
        self.replies.lock().unwrap().insert((None, index), replies.into());
        self
    }

    /// Replies for `index` of the named file only
    pub fn with_replies_for(self, file_name: &str, index: u32, replies: Vec<Reply>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert((Some(file_name.to_string()), index), replies.into());
        self
    }

    /// Block the first send of `index` until [`MockApi::release`]
    pub fn with_hold(mut self, index: u32) -> Self {
        self.hold = Some(Hold {
            index,
            used: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        });
        self
    }

    pub fn with_transcode(mut self, script: TranscodeScript) -> Self {
        self.transcode = script;
        self
    }

    pub fn set_space(&self, space: UseSpace) {
        *self.space.lock().unwrap() = space;
    }

    pub fn fail_space(&self, fail: bool) {
        self.space_failure.store(fail, Ordering::SeqCst);
    }

    /// Wait until the held chunk has arrived
    pub async fn wait_reached(&self) {
        if let Some(hold) = &self.hold {
            hold.reached.notified().await;
        }
    }

    pub fn release(&self) {
        if let Some(hold) = &self.hold {
            hold.release.notify_one();
        }
    }

    pub fn probe_calls(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn space_calls(&self) -> usize {
        self.space_calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentChunk> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_indices(&self) -> Vec<u32> {
        self.sent().iter().map(|c| c.index).collect()
    }

    pub fn send_count(&self, index: u32) -> usize {
        self.sent().iter().filter(|c| c.index == index).count()
    }

    pub fn sent_bytes(&self, index: u32) -> Vec<u64> {
        self.sent().iter().filter(|c| c.index == index).map(|c| c.bytes).collect()
    }

    pub fn log(&self) -> Vec<MockEvent> {
        self.log.lock().unwrap().clone()
    }

    pub fn transcode_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Highest number of simultaneous sends for one file
    pub fn max_in_flight(&self, file_name: &str) -> usize {
        self.per_file.lock().unwrap().get(file_name).map(|c| c.max).unwrap_or(0)
    }

    pub fn global_max_in_flight(&self) -> usize {
        self.global.lock().unwrap().max
    }

    fn enter(&self, file_name: &str) {
        let mut per_file = self.per_file.lock().unwrap();
        let file = per_file.entry(file_name.to_string()).or_default();
        file.current += 1;
        file.max = file.max.max(file.current);

        let mut global = self.global.lock().unwrap();
        global.current += 1;
        global.max = global.max.max(global.current);
    }

    fn leave(&self, file_name: &str) {
        if let Some(file) = self.per_file.lock().unwrap().get_mut(file_name) {
            file.current -= 1;
        }
        self.global.lock().unwrap().current -= 1;
    }

    fn next_reply(&self, file_name: &str, index: u32) -> Option<Reply> {
        let mut replies = self.replies.lock().unwrap();
        if let Some(reply) = replies
            .get_mut(&(Some(file_name.to_string()), index))
            .and_then(VecDeque::pop_front)
        {
            return Some(reply);
        }
        replies.get_mut(&(None, index)).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl UploadApi for MockApi {
    async fn probe_uploaded_chunks(&self, _file_id: &str, _file_pid: &str) -> ApiResult<Vec<u32>> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_failure {
            return Err(ApiError::Http("probe unavailable".to_string()));
        }
        Ok(self.resume.clone())
    }

    async fn upload_chunk(&self, upload: ChunkUpload) -> ApiResult<UploadResult> {
        let ChunkUpload { form, mut body, .. } = upload;
        let index = form.chunk_index;
        self.log.lock().unwrap().push(MockEvent::Start(index));
        self.enter(&form.file_name);

        let mut bytes = 0u64;
        let mut read_error = None;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => bytes += chunk.len() as u64,
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            }
        }

        if let Some(hold) = &self.hold {
            if hold.index == index && !hold.used.swap(true, Ordering::SeqCst) {
                hold.reached.notify_one();
                hold.release.notified().await;
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.leave(&form.file_name);
        self.sent.lock().unwrap().push(SentChunk {
            file_id: form.file_id.clone(),
            folder_id: form.file_pid.clone(),
            file_name: form.file_name.clone(),
            index,
            bytes,
        });
        self.log.lock().unwrap().push(MockEvent::End(index));

        if let Some(e) = read_error {
            return Err(ApiError::Http(e.to_string()));
        }

        match self.next_reply(&form.file_name, index) {
            Some(Reply::Error(e)) => Err(e),
            Some(Reply::Status(status, file_id)) => Ok(UploadResult { file_id, status }),
            None => Ok(UploadResult {
                file_id: None,
                status: if index + 1 == form.chunks {
                    UploadStatus::UploadFinish
                } else {
                    UploadStatus::Uploading
                },
            }),
        }
    }

    async fn subscribe_transcode_status(&self, file_id: &str) -> ApiResult<TranscodeSubscription> {
        self.subscriptions.lock().unwrap().push(file_id.to_string());
        match &self.transcode {
            TranscodeScript::Events(events) => Ok(TranscodeSubscription::from_stream(stream::iter(
                events.clone().into_iter().map(Ok),
            ))),
            TranscodeScript::Pending => Ok(TranscodeSubscription::from_stream(stream::pending())),
            TranscodeScript::Unavailable => Err(ApiError::Http("status channel unavailable".to_string())),
        }
    }
}

#[async_trait]
impl UserApi for MockApi {
    async fn get_use_space(&self) -> ApiResult<UseSpace> {
        self.space_calls.fetch_add(1, Ordering::SeqCst);
        if self.space_failure.load(Ordering::SeqCst) {
            return Err(ApiError::Timeout("getUseSpace".to_string()));
        }
        Ok(*self.space.lock().unwrap())
    }
}

/// Fast retries and a roomy event buffer
pub(crate) fn test_config(chunk_size: u64) -> UploaderConfig {
    UploaderConfig {
        chunk_size,
        max_concurrent_chunks: 3,
        max_attempts: 3,
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(5),
        event_capacity: 1000,
        quota_refresh_interval: Duration::from_millis(20),
        log_to_file: false,
        ..Default::default()
    }
}

/// Write a file of `size` patterned bytes
pub(crate) fn write_source(dir: &tempfile::TempDir, name: &str, size: usize) -> PathBuf {
    let path = dir.path().join(name);
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

/// Poll until the task's snapshot satisfies `done`
pub(crate) async fn wait_for(
    registry: &TaskRegistry,
    id: &str,
    done: impl Fn(&TaskSnapshot) -> bool,
) -> TaskSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(snapshot) = registry.snapshot(id) {
            if done(&snapshot) {
                return snapshot;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("task {id} did not settle: {:?}", registry.snapshot(id));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
