//! Signed provider calls. One method per provider operation; higher-level
//! semantics (404 handling, batching, orchestration) live in the service.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cloudstash_auth::{Provider, RequestSigner, Signer, SigningRequest};
use md5::{Digest, Md5};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::keys::encode_key_path;
use crate::traits::{HttpRequest, HttpResponse, Method, Transport};
use crate::types::{CompletedPart, DeleteFailure, FileMetadata, ListOptions, ListResult};
use crate::xml;

/// An unsigned call against the configured bucket.
#[derive(Debug, Clone)]
pub struct ObjectRequest {
    pub method: Method,
    /// Empty for bucket-level calls.
    pub key: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl ObjectRequest {
    pub fn new(method: Method, key: impl Into<String>) -> Self {
        Self {
            method,
            key: key.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Valueless sub-resource such as `uploads` or `delete`.
    pub fn flag(self, name: impl Into<String>) -> Self {
        self.query(name, "")
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.to_ascii_lowercase(), value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

pub struct PutObjectRequest {
    pub key: String,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
    pub is_public: bool,
    pub data: Bytes,
}

pub struct CreateMultipartUploadRequest {
    pub key: String,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
    pub is_public: bool,
}

pub struct UploadPartRequest {
    pub key: String,
    pub upload_id: String,
    pub part_number: u32,
    pub data: Bytes,
}

/// Signs and sends calls for one bucket.
pub struct ProviderClient<T> {
    transport: Arc<T>,
    signer: Signer,
    config: Arc<StorageConfig>,
}

impl<T> Clone for ProviderClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            signer: self.signer.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<T: Transport> ProviderClient<T> {
    pub fn new(config: Arc<StorageConfig>, transport: Arc<T>) -> Self {
        let signer = Signer::new(config.provider(), config.credentials().clone())
            .with_request_ttl(config.tuning().request_ttl());

        Self {
            transport,
            signer,
            config,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Sign and send. Every HTTP status is returned as a response.
    pub async fn send(&self, request: ObjectRequest) -> StorageResult<HttpResponse> {
        let ObjectRequest {
            method,
            key,
            query,
            mut headers,
            body,
        } = request;

        if matches!(method, Method::Put | Method::Post) {
            headers.insert("content-length".to_string(), body.len().to_string());
        }

        let authorization = self.signer.sign(
            &SigningRequest {
                method: method.as_str(),
                bucket: self.config.bucket(),
                key: &key,
                query: &query,
                headers: &headers,
            },
            Utc::now(),
        );
        for (name, value) in authorization.headers {
            headers.insert(name, value);
        }

        let http = HttpRequest {
            method,
            url: object_url(&self.config.endpoint(), &key, &query),
            headers,
            body,
        };

        let started = Instant::now();
        let response = match self.transport.send(http).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    method = %method,
                    bucket = %self.config.bucket(),
                    key = %key,
                    error = %e,
                    "Provider request failed"
                );
                return Err(e);
            }
        };

        tracing::debug!(
            method = %method,
            bucket = %self.config.bucket(),
            key = %key,
            status = response.status,
            duration_ms = started.elapsed().as_millis() as u64,
            "Provider request finished"
        );

        Ok(response)
    }

    /// Like [`send`](Self::send), but non-2xx statuses become
    /// [`StorageError::Provider`].
    pub async fn execute(&self, request: ObjectRequest) -> StorageResult<HttpResponse> {
        let response = self.send(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(StorageError::Provider {
                status: response.status,
                body: response.body_text(),
            })
        }
    }

    /// Returns the raw ETag of the stored object.
    pub async fn put_object(&self, request: PutObjectRequest) -> StorageResult<String> {
        ensure_object_key(&request.key)?;
        let headers = self.object_headers(&request.content_type, &request.metadata, request.is_public);
        let response = self
            .execute(
                ObjectRequest::new(Method::Put, request.key)
                    .headers(headers)
                    .body(request.data),
            )
            .await?;

        Ok(response.header("etag").unwrap_or_default().to_string())
    }

    pub async fn head_object(&self, key: &str) -> StorageResult<FileMetadata> {
        ensure_object_key(key)?;
        let response = self.send(ObjectRequest::new(Method::Head, key)).await?;
        match response.status {
            404 => Err(StorageError::NotFound(key.to_string())),
            _ if response.is_success() => Ok(parse_object_metadata(
                key,
                &response,
                self.config.provider(),
            )),
            status => Err(StorageError::Provider {
                status,
                body: response.body_text(),
            }),
        }
    }

    /// `false` when the object did not exist.
    pub async fn delete_object(&self, key: &str) -> StorageResult<bool> {
        ensure_object_key(key)?;
        let response = self.send(ObjectRequest::new(Method::Delete, key)).await?;
        match response.status {
            404 => Ok(false),
            _ if response.is_success() => Ok(true),
            status => Err(StorageError::Provider {
                status,
                body: response.body_text(),
            }),
        }
    }

    /// Server-side copy within the bucket. Returns the raw ETag of the copy.
    pub async fn copy_object(&self, source: &str, target: &str) -> StorageResult<String> {
        ensure_object_key(source)?;
        ensure_object_key(target)?;
        let (header, value) = match self.config.provider() {
            Provider::Oss => (
                "x-oss-copy-source",
                format!("/{}/{}", self.config.bucket(), encode_key_path(source)),
            ),
            Provider::Cos => (
                "x-cos-copy-source",
                format!("{}/{}", self.config.public_host(), encode_key_path(source)),
            ),
        };

        let response = self
            .execute(ObjectRequest::new(Method::Put, target).header(header, value))
            .await?;

        let body = response.body_text();
        if body.trim().is_empty() {
            return Ok(response.header("etag").unwrap_or_default().to_string());
        }
        xml::parse_copy_etag(&body)
    }

    pub async fn create_multipart_upload(
        &self,
        request: CreateMultipartUploadRequest,
    ) -> StorageResult<String> {
        ensure_object_key(&request.key)?;
        let headers = self.object_headers(&request.content_type, &request.metadata, request.is_public);
        let response = self
            .execute(
                ObjectRequest::new(Method::Post, request.key)
                    .flag("uploads")
                    .headers(headers),
            )
            .await?;

        xml::parse_upload_id(&response.body_text())
    }

    /// Returns the raw ETag of the part.
    pub async fn upload_part(&self, request: UploadPartRequest) -> StorageResult<String> {
        ensure_object_key(&request.key)?;
        let response = self
            .execute(
                ObjectRequest::new(Method::Put, request.key)
                    .query("partNumber", request.part_number.to_string())
                    .query("uploadId", request.upload_id)
                    .body(request.data),
            )
            .await?;

        match response.header("etag") {
            Some(etag) if !etag.is_empty() => Ok(etag.to_string()),
            _ => Err(StorageError::Decode(format!(
                "part {} response carries no ETag",
                request.part_number
            ))),
        }
    }

    /// `parts` must be sorted by part number.
    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<String> {
        ensure_object_key(key)?;
        let body = xml::complete_multipart_body(parts)?;
        let response = self
            .execute(
                ObjectRequest::new(Method::Post, key)
                    .query("uploadId", upload_id)
                    .header("content-type", "application/xml")
                    .body(body),
            )
            .await?;

        let body = response.body_text();
        if body.trim().is_empty() {
            return Ok(response.header("etag").unwrap_or_default().to_string());
        }
        xml::parse_complete_etag(&body)
    }

    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        ensure_object_key(key)?;
        self.execute(ObjectRequest::new(Method::Delete, key).query("uploadId", upload_id))
            .await?;
        Ok(())
    }

    /// One quiet batch delete call. The caller bounds the batch size.
    pub async fn delete_objects(&self, keys: &[String]) -> StorageResult<Vec<DeleteFailure>> {
        for key in keys {
            ensure_object_key(key)?;
        }
        let body = xml::delete_objects_body(keys)?;
        let response = self
            .execute(
                ObjectRequest::new(Method::Post, "")
                    .flag("delete")
                    .header("content-type", "application/xml")
                    .header("content-md5", content_md5(body.as_bytes()))
                    .body(body),
            )
            .await?;

        xml::parse_delete_failures(&response.body_text())
    }

    pub async fn list_objects(&self, options: &ListOptions) -> StorageResult<ListResult> {
        let mut request = ObjectRequest::new(Method::Get, "");
        request.query = options.to_query();

        let response = self.execute(request).await?;
        xml::parse_list_result(&response.body_text())
    }

    /// Content type, user metadata and ACL headers shared by simple and
    /// multipart uploads.
    fn object_headers(
        &self,
        content_type: &str,
        metadata: &BTreeMap<String, String>,
        is_public: bool,
    ) -> BTreeMap<String, String> {
        let provider = self.config.provider();
        let mut headers = BTreeMap::new();

        headers.insert("content-type".to_string(), content_type.to_string());
        for (name, value) in metadata {
            headers.insert(
                format!("{}{}", provider.meta_prefix(), name.to_ascii_lowercase()),
                value.clone(),
            );
        }
        if is_public {
            let acl_header = match provider {
                Provider::Oss => "x-oss-object-acl",
                Provider::Cos => "x-cos-acl",
            };
            headers.insert(acl_header.to_string(), "public-read".to_string());
        }

        headers
    }
}

/// Object calls with an empty key would address the bucket itself.
pub(crate) fn ensure_object_key(key: &str) -> StorageResult<()> {
    if key.trim_matches('/').is_empty() {
        return Err(StorageError::InvalidArgument(format!(
            "object key must not be empty, got '{}'",
            key
        )));
    }
    Ok(())
}

/// `{origin}/{encoded key}[?query]`. Valueless pairs render as a bare name.
pub fn object_url(origin: &str, key: &str, query: &[(String, String)]) -> String {
    let mut url = format!("{}/{}", origin.trim_end_matches('/'), encode_key_path(key));

    if !query.is_empty() {
        let rendered: Vec<String> = query
            .iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    urlencoding::encode(name).into_owned()
                } else {
                    format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
                }
            })
            .collect();
        url.push('?');
        url.push_str(&rendered.join("&"));
    }

    url
}

/// base64 of the MD5 digest, as the `Content-MD5` header expects.
pub fn content_md5(body: &[u8]) -> String {
    BASE64.encode(Md5::digest(body))
}

fn parse_object_metadata(key: &str, response: &HttpResponse, provider: Provider) -> FileMetadata {
    let meta_prefix = provider.meta_prefix();

    let metadata = response
        .headers
        .iter()
        .filter_map(|(name, value)| {
            name.strip_prefix(meta_prefix)
                .map(|stripped| (stripped.to_string(), value.clone()))
        })
        .collect();

    FileMetadata {
        object_key: key.to_string(),
        size: response
            .header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0),
        content_type: response.header("content-type").map(str::to_string),
        etag: xml::normalize_etag(response.header("etag").unwrap_or_default()),
        last_modified: response.header("last-modified").and_then(|v| {
            DateTime::parse_from_rfc2822(v.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
        metadata,
    }
}
