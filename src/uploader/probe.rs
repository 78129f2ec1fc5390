//! Asks the server which chunks of an upload it already holds

use crate::uploader::chunk::ChunkPlan;
use easypan_api::api::UploadApi;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Chunk indices the server already has, restricted to the chunk plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeSet {
    indices: BTreeSet<u32>,
}

impl ResumeSet {
    /// Drop indices outside `[0, chunk_count)` and collapse duplicates
    pub fn from_indices(indices: impl IntoIterator<Item = u32>, plan: &ChunkPlan) -> Self {
        let mut discarded = 0usize;
        let indices = indices
            .into_iter()
            .filter(|index| {
                let keep = plan.contains(*index);
                if !keep {
                    discarded += 1;
                }
                keep
            })
            .collect();

        if discarded > 0 {
            tracing::warn!(
                target: "uploader::probe",
                discarded,
                chunk_count = plan.chunk_count(),
                "Server reported chunk indices outside the plan"
            );
        }

        Self { indices }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.indices.contains(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.indices.iter().copied()
    }
}

/// Resume probe backed by the upload API
pub struct ResumeProbe {
    api: Arc<dyn UploadApi>,
}

impl ResumeProbe {
    pub fn new(api: Arc<dyn UploadApi>) -> Self {
        Self { api }
    }

    /// Query held chunks for `(upload_id, folder_id)`.
    ///
    /// Any failure yields an empty set so the upload starts from scratch.
    pub async fn probe(&self, upload_id: &str, folder_id: &str, plan: &ChunkPlan) -> ResumeSet {
        match self.api.probe_uploaded_chunks(upload_id, folder_id).await {
            Ok(indices) => {
                let set = ResumeSet::from_indices(indices, plan);
                tracing::debug!(
                    target: "uploader::probe",
                    upload_id = %upload_id,
                    held = set.len(),
                    chunk_count = plan.chunk_count(),
                    "Resume probe finished"
                );
                set
            }
            Err(e) => {
                tracing::warn!(
                    target: "uploader::probe",
                    upload_id = %upload_id,
                    error = %e,
                    "Resume probe failed, uploading all chunks"
                );
                ResumeSet::default()
            }
        }
    }
}
