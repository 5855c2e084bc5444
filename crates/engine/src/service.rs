use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

use crate::client::{ProviderClient, PutObjectRequest};
use crate::config::{StorageConfig, StorageSettings};
use crate::error::StorageResult;
use crate::http::HttpTransport;
use crate::keys::{generate_object_key, guess_content_type};
use crate::multipart;
use crate::traits::Transport;
use crate::types::{UploadOptions, UploadProgress, UploadResult};
use crate::xml::normalize_etag;

/// Provider-agnostic entry point for uploads, object operations and URLs.
///
/// Construct one per bucket and share it behind an `Arc`.
pub struct StorageService<T: Transport = HttpTransport> {
    pub(crate) client: ProviderClient<T>,
}

impl StorageService<HttpTransport> {
    pub fn new(config: StorageConfig) -> StorageResult<Self> {
        let transport = HttpTransport::new(config.tuning().request_timeout())?;
        Ok(Self::with_transport(config, transport))
    }

    /// Validate `settings` and build a service over HTTPS.
    pub fn from_settings(settings: StorageSettings) -> StorageResult<Self> {
        Self::new(StorageConfig::from_settings(settings)?)
    }
}

impl<T: Transport> StorageService<T> {
    pub fn with_transport(config: StorageConfig, transport: T) -> Self {
        tracing::info!(
            provider = %config.provider(),
            bucket = %config.bucket(),
            region = %config.region(),
            endpoint = %config.endpoint(),
            cdn = config.cdn_domain().is_some(),
            "Storage service initialized"
        );

        Self {
            client: ProviderClient::new(Arc::new(config), Arc::new(transport)),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        self.client.config()
    }

    /// Store `data` under a fresh key. Payloads above the multipart threshold
    /// are uploaded in parts.
    pub async fn upload(
        &self,
        data: impl Into<Bytes>,
        filename: &str,
        options: UploadOptions,
    ) -> StorageResult<UploadResult> {
        self.upload_with(data.into(), filename, options, false).await
    }

    /// Always use the multipart path, whatever the size.
    pub async fn upload_multipart(
        &self,
        data: impl Into<Bytes>,
        filename: &str,
        options: UploadOptions,
    ) -> StorageResult<UploadResult> {
        self.upload_with(data.into(), filename, options, true).await
    }

    /// Discard a multipart upload left behind by a failed
    /// [`upload`](Self::upload).
    pub async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.client.abort_multipart_upload(key, upload_id).await?;
        tracing::info!(
            bucket = %self.config().bucket(),
            key = %key,
            upload_id = %upload_id,
            "Multipart upload aborted"
        );
        Ok(())
    }

    async fn upload_with(
        &self,
        data: Bytes,
        filename: &str,
        options: UploadOptions,
        force_multipart: bool,
    ) -> StorageResult<UploadResult> {
        let size = data.len() as u64;
        let key = generate_object_key(&options.category, filename);
        let content_type = if options.content_type.trim().is_empty() {
            guess_content_type(filename).to_string()
        } else {
            options.content_type.trim().to_string()
        };

        let multipart = force_multipart || size > self.config().tuning().multipart_threshold;
        let started = Instant::now();

        let outcome = if multipart {
            multipart::upload_in_parts(&self.client, &key, data, &content_type, &options).await
        } else {
            self.put_single(&key, data, &content_type, &options).await
        };

        let etag = match outcome {
            Ok(etag) => etag,
            Err(e) => {
                tracing::error!(
                    bucket = %self.config().bucket(),
                    key = %key,
                    size_bytes = size,
                    multipart,
                    error = %e,
                    "Upload failed"
                );
                return Err(e);
            }
        };

        tracing::info!(
            bucket = %self.config().bucket(),
            key = %key,
            size_bytes = size,
            multipart,
            duration_ms = started.elapsed().as_millis() as u64,
            "Object uploaded"
        );

        Ok(UploadResult {
            public_url: self.public_url(&key),
            cdn_url: self.cdn_url(&key),
            object_key: key,
            size,
            etag: normalize_etag(&etag),
            content_type,
        })
    }

    async fn put_single(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        options: &UploadOptions,
    ) -> StorageResult<String> {
        let size = data.len() as u64;
        let etag = self
            .client
            .put_object(PutObjectRequest {
                key: key.to_string(),
                content_type: content_type.to_string(),
                metadata: options.metadata.clone(),
                is_public: options.is_public,
                data,
            })
            .await?;

        if let Some(on_progress) = &options.on_progress {
            on_progress(UploadProgress {
                completed_parts: 1,
                total_parts: 1,
                bytes_uploaded: size,
                total_bytes: size,
            });
        }

        Ok(etag)
    }
}
