use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::traits::Method;

/// Receives progress after each finished part, and once after a single PUT.
pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub completed_parts: u32,
    pub total_parts: u32,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.bytes_uploaded as f64 * 100.0 / self.total_bytes as f64
    }
}

#[derive(Clone, Default)]
pub struct UploadOptions {
    /// First key segment. Does not affect anything but the key.
    pub category: String,
    /// Inferred from the file name when empty.
    pub content_type: String,
    pub is_public: bool,
    pub metadata: BTreeMap<String, String>,
    pub on_progress: Option<ProgressCallback>,
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("category", &self.category)
            .field("content_type", &self.content_type)
            .field("is_public", &self.is_public)
            .field("metadata", &self.metadata)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

impl UploadOptions {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            ..Default::default()
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn public(mut self, is_public: bool) -> Self {
        self.is_public = is_public;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(UploadProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub object_key: String,
    pub public_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cdn_url: Option<String>,
    pub size: u64,
    /// Without the surrounding quotes.
    pub etag: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub object_key: String,
    pub size: u64,
    /// Listing entries carry no content type.
    pub content_type: Option<String>,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub max_keys: Option<u32>,
    pub marker: Option<String>,
}

impl ListOptions {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    pub(crate) fn to_query(&self) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(prefix) = self.prefix.as_ref().filter(|p| !p.is_empty()) {
            query.push(("prefix".to_string(), prefix.clone()));
        }
        if let Some(delimiter) = self.delimiter.as_ref().filter(|d| !d.is_empty()) {
            query.push(("delimiter".to_string(), delimiter.clone()));
        }
        if let Some(max_keys) = self.max_keys {
            query.push(("max-keys".to_string(), max_keys.to_string()));
        }
        if let Some(marker) = self.marker.as_ref().filter(|m| !m.is_empty()) {
            query.push(("marker".to_string(), marker.clone()));
        }
        query
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult {
    pub objects: Vec<FileMetadata>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

/// A key the provider refused to delete in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    /// As returned by the provider, quotes included.
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrlOptions {
    pub expires_in: Duration,
    pub method: Method,
    pub response_content_type: Option<String>,
    pub response_content_disposition: Option<String>,
}

impl SignedUrlOptions {
    pub fn expires_in(expires_in: Duration) -> Self {
        Self {
            expires_in,
            ..Default::default()
        }
    }
}

impl Default for SignedUrlOptions {
    fn default() -> Self {
        Self {
            expires_in: Duration::from_secs(crate::config::DEFAULT_SIGNED_URL_TTL_SECS),
            method: Method::Get,
            response_content_type: None,
            response_content_disposition: None,
        }
    }
}
