//! Multipart upload: initiate, bounded-concurrency part uploads, ordered
//! completion.

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::ops::Range;

use crate::client::{CreateMultipartUploadRequest, ProviderClient, UploadPartRequest};
use crate::error::{StorageError, StorageResult};
use crate::traits::Transport;
use crate::types::{CompletedPart, UploadOptions, UploadProgress};

/// Providers reject part numbers above this.
pub const MAX_PARTS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartState {
    Initiated,
    PartsUploading,
    Completing,
    Completed,
    Failed,
}

impl fmt::Display for MultipartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MultipartState::Initiated => "initiated",
            MultipartState::PartsUploading => "parts-uploading",
            MultipartState::Completing => "completing",
            MultipartState::Completed => "completed",
            MultipartState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// In-memory record of one multipart upload. Never persisted.
#[derive(Debug, Clone)]
pub struct MultipartSession {
    key: String,
    upload_id: String,
    part_size: u64,
    total_parts: u32,
    parts: Vec<CompletedPart>,
    state: MultipartState,
}

impl MultipartSession {
    pub fn new(
        key: impl Into<String>,
        upload_id: impl Into<String>,
        part_size: u64,
        total_parts: u32,
    ) -> Self {
        Self {
            key: key.into(),
            upload_id: upload_id.into(),
            part_size,
            total_parts,
            parts: Vec::with_capacity(total_parts as usize),
            state: MultipartState::Initiated,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn total_parts(&self) -> u32 {
        self.total_parts
    }

    pub fn state(&self) -> MultipartState {
        self.state
    }

    /// Parts in the order they finished.
    pub fn parts(&self) -> &[CompletedPart] {
        &self.parts
    }

    pub fn begin_parts(&mut self) -> StorageResult<()> {
        self.transition(MultipartState::Initiated, MultipartState::PartsUploading)
    }

    pub fn record_part(&mut self, part: CompletedPart) -> StorageResult<()> {
        if self.state != MultipartState::PartsUploading {
            return Err(self.illegal("record a part"));
        }
        if part.part_number == 0 || part.part_number > self.total_parts {
            return Err(StorageError::InvalidArgument(format!(
                "part number {} outside 1..={}",
                part.part_number, self.total_parts
            )));
        }
        if self.parts.iter().any(|p| p.part_number == part.part_number) {
            return Err(StorageError::InvalidArgument(format!(
                "part {} recorded twice",
                part.part_number
            )));
        }

        self.parts.push(part);
        Ok(())
    }

    /// Move to `Completing` and return the manifest, ascending by part number.
    pub fn begin_completion(&mut self) -> StorageResult<Vec<CompletedPart>> {
        if self.parts.len() != self.total_parts as usize {
            return Err(StorageError::InvalidArgument(format!(
                "{} of {} parts uploaded",
                self.parts.len(),
                self.total_parts
            )));
        }
        self.transition(MultipartState::PartsUploading, MultipartState::Completing)?;

        let mut manifest = self.parts.clone();
        manifest.sort_by_key(|p| p.part_number);
        Ok(manifest)
    }

    pub fn complete(&mut self) -> StorageResult<()> {
        self.transition(MultipartState::Completing, MultipartState::Completed)
    }

    /// Terminal. Allowed from any non-terminal state.
    pub fn fail(&mut self) {
        if self.state != MultipartState::Completed {
            self.state = MultipartState::Failed;
        }
    }

    fn transition(&mut self, from: MultipartState, to: MultipartState) -> StorageResult<()> {
        if self.state != from {
            return Err(self.illegal(&format!("move to {}", to)));
        }
        self.state = to;
        Ok(())
    }

    fn illegal(&self, action: &str) -> StorageError {
        StorageError::InvalidArgument(format!(
            "cannot {} while upload {} is {}",
            action, self.upload_id, self.state
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    pub part_number: u32,
    pub range: Range<usize>,
}

/// Split `size` bytes into contiguous parts of `part_size`, the last one
/// possibly shorter. An empty payload is a single empty part.
pub fn plan_parts(size: u64, part_size: u64) -> StorageResult<Vec<PartPlan>> {
    if part_size == 0 {
        return Err(StorageError::InvalidArgument(
            "part size must be greater than zero".to_string(),
        ));
    }

    let count = size.div_ceil(part_size).max(1);
    if count > MAX_PARTS {
        return Err(StorageError::InvalidArgument(format!(
            "{} bytes in {} byte parts needs {} parts, more than {}",
            size, part_size, count, MAX_PARTS
        )));
    }

    Ok((0..count)
        .map(|index| {
            let start = index * part_size;
            let end = (start + part_size).min(size);
            PartPlan {
                part_number: index as u32 + 1,
                range: start as usize..end as usize,
            }
        })
        .collect())
}

/// Upload `data` to `key` in parts. Returns the raw ETag of the assembled
/// object. Failures after initiation come back as
/// [`StorageError::MultipartAborted`] carrying the upload id; the remote
/// session is left for the caller to abort.
pub(crate) async fn upload_in_parts<T: Transport>(
    client: &ProviderClient<T>,
    key: &str,
    data: Bytes,
    content_type: &str,
    options: &UploadOptions,
) -> StorageResult<String> {
    let tuning = client.config().tuning();
    let plan = plan_parts(data.len() as u64, tuning.part_size)?;
    let total_parts = plan.len() as u32;

    let upload_id = client
        .create_multipart_upload(CreateMultipartUploadRequest {
            key: key.to_string(),
            content_type: content_type.to_string(),
            metadata: options.metadata.clone(),
            is_public: options.is_public,
        })
        .await?;

    tracing::info!(
        bucket = %client.config().bucket(),
        key = %key,
        upload_id = %upload_id,
        total_parts,
        size_bytes = data.len() as u64,
        "Multipart upload initiated"
    );

    let mut session = MultipartSession::new(key, upload_id.clone(), tuning.part_size, total_parts);
    match drive_session(client, &mut session, data, plan, tuning.parallelism, options).await {
        Ok(etag) => Ok(etag),
        Err(source) => {
            session.fail();
            tracing::error!(
                bucket = %client.config().bucket(),
                key = %key,
                upload_id = %upload_id,
                parts_done = session.parts().len(),
                error = %source,
                "Multipart upload failed"
            );
            Err(StorageError::MultipartAborted {
                key: key.to_string(),
                upload_id,
                source: Box::new(source),
            })
        }
    }
}

async fn drive_session<T: Transport>(
    client: &ProviderClient<T>,
    session: &mut MultipartSession,
    data: Bytes,
    plan: Vec<PartPlan>,
    parallelism: usize,
    options: &UploadOptions,
) -> StorageResult<String> {
    let key = session.key().to_string();
    let upload_id = session.upload_id().to_string();
    let total_parts = session.total_parts();
    let total_bytes = data.len() as u64;

    session.begin_parts()?;

    let mut uploads = stream::iter(plan.into_iter().map(|part| {
        let request = UploadPartRequest {
            key: key.clone(),
            upload_id: upload_id.clone(),
            part_number: part.part_number,
            data: data.slice(part.range),
        };
        async move {
            let part_number = request.part_number;
            let len = request.data.len() as u64;
            let etag = client.upload_part(request).await?;
            Ok::<_, StorageError>((CompletedPart { part_number, etag }, len))
        }
    }))
    .buffer_unordered(parallelism.max(1));

    let mut bytes_uploaded = 0u64;
    while let Some(result) = uploads.next().await {
        let (part, len) = result?;
        bytes_uploaded += len;

        tracing::debug!(
            key = %key,
            upload_id = %upload_id,
            part_number = part.part_number,
            size_bytes = len,
            "Part uploaded"
        );

        session.record_part(part)?;
        if let Some(on_progress) = &options.on_progress {
            on_progress(UploadProgress {
                completed_parts: session.parts().len() as u32,
                total_parts,
                bytes_uploaded,
                total_bytes,
            });
        }
    }
    drop(uploads);

    let manifest = session.begin_completion()?;
    let etag = client
        .complete_multipart_upload(&key, &upload_id, &manifest)
        .await?;
    session.complete()?;

    Ok(etag)
}
