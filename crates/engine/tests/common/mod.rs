//! In-memory provider that speaks the OSS/COS wire protocol closely enough
//! to drive [`StorageService`] end to end. Every request is recorded and its
//! signature checked against the auth crate.

#![allow(dead_code)]

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use cloudstash_auth::{
    CosAuthorization, CosSigner, Credentials, OssSigner, Provider, RequestSigner, SigningRequest,
};
use cloudstash_engine::{
    HttpRequest, HttpResponse, Method, StorageConfig, StorageResult, StorageService,
    StorageSettings, Transport, UploadTuning,
};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ACCESS_KEY_ID: &str = "AKIDEXAMPLE";
pub const ACCESS_KEY_SECRET: &str = "secret-key-example";

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub key: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn has_query(&self, name: &str) -> bool {
        self.query.iter().any(|(k, _)| k == name)
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_part_upload(&self) -> bool {
        self.method == Method::Put && self.has_query("partNumber")
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
    pub etag: String,
    pub headers: BTreeMap<String, String>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    content_type: String,
    headers: BTreeMap<String, String>,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    requests: Vec<RecordedRequest>,
    manifests: Vec<Vec<u32>>,
    next_upload: u32,
    fail_part: Option<u32>,
    fail_complete: bool,
    refuse_delete: BTreeSet<String>,
    omit_next_marker: bool,
    staggered_parts: bool,
}

struct Inner {
    provider: Provider,
    credentials: Credentials,
    state: Mutex<State>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MockProvider {
    inner: Arc<Inner>,
}

impl MockProvider {
    pub fn new(provider: Provider) -> Self {
        Self::with_credentials(provider, Credentials::new(ACCESS_KEY_ID, ACCESS_KEY_SECRET))
    }

    pub fn with_credentials(provider: Provider, credentials: Credentials) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                credentials,
                state: Mutex::new(State::default()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state().requests.len()
    }

    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state().objects.get(key).cloned()
    }

    pub fn object_keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    pub fn insert_object(&self, key: &str, data: &[u8], content_type: &str) {
        let object = StoredObject {
            data: Bytes::copy_from_slice(data),
            content_type: content_type.to_string(),
            etag: quoted_md5(data),
            headers: BTreeMap::new(),
            last_modified: Utc::now(),
        };
        self.state().objects.insert(key.to_string(), object);
    }

    pub fn pending_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    /// Part numbers of every completion manifest received, in request order.
    pub fn manifests(&self) -> Vec<Vec<u32>> {
        self.state().manifests.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fail_part(&self, part_number: u32) {
        self.state().fail_part = Some(part_number);
    }

    pub fn fail_complete(&self) {
        self.state().fail_complete = true;
    }

    pub fn refuse_delete(&self, key: &str) {
        self.state().refuse_delete.insert(key.to_string());
    }

    pub fn omit_next_marker(&self) {
        self.state().omit_next_marker = true;
    }

    /// Delay parts so that higher part numbers finish first.
    pub fn stagger_parts(&self) {
        self.state().staggered_parts = true;
    }

    fn verify_signature(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        headers: &BTreeMap<String, String>,
    ) -> bool {
        let Some(authorization) = headers.get("authorization") else {
            return false;
        };

        let mut signed_headers = headers.clone();
        signed_headers.remove("authorization");

        match self.inner.provider {
            Provider::Oss => {
                let Some(date) = signed_headers
                    .remove("date")
                    .and_then(|d| DateTime::parse_from_rfc2822(&d).ok())
                else {
                    return false;
                };
                let request = SigningRequest {
                    method: method.as_str(),
                    bucket: "my-bucket",
                    key,
                    query,
                    headers: &signed_headers,
                };
                let expected = OssSigner::new(self.inner.credentials.clone())
                    .sign(&request, date.with_timezone(&Utc));
                expected.header("authorization") == Some(authorization.as_str())
            }
            Provider::Cos => {
                let Ok(auth) = CosAuthorization::parse(authorization) else {
                    return false;
                };
                let now = Utc::now().timestamp();
                let in_window = auth
                    .window()
                    .is_some_and(|(start, end)| start <= now && now <= end);
                let request = SigningRequest {
                    method: method.as_str(),
                    bucket: "media-1250000000",
                    key,
                    query,
                    headers: &signed_headers,
                };
                in_window
                    && auth.access_key_id == self.inner.credentials.access_key_id
                    && CosSigner::new(self.inner.credentials.clone()).verify(&request, &auth)
            }
        }
    }

    fn handle(&self, recorded: &RecordedRequest) -> HttpResponse {
        let mut state = self.state();
        let meta_prefix = self.inner.provider.meta_prefix();
        let key = recorded.key.as_str();

        match recorded.method {
            Method::Put if recorded.has_query("partNumber") => {
                let part_number: u32 = recorded
                    .query_value("partNumber")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                if state.fail_part == Some(part_number) {
                    return error_response(500, "InternalError");
                }
                let upload_id = recorded.query_value("uploadId").unwrap_or_default();
                let Some(upload) = state.uploads.get_mut(upload_id) else {
                    return error_response(404, "NoSuchUpload");
                };
                let etag = quoted_md5(&recorded.body);
                upload
                    .parts
                    .insert(part_number, (etag.clone(), recorded.body.clone()));
                response(200, &[("etag", etag)], "")
            }
            Method::Put if copy_source(&recorded.headers).is_some() => {
                let source = copy_source(&recorded.headers).unwrap_or_default();
                let source = match self.inner.provider {
                    Provider::Oss => source
                        .strip_prefix("/my-bucket/")
                        .map(str::to_string)
                        .unwrap_or_default(),
                    Provider::Cos => source
                        .split_once('/')
                        .map(|(_, k)| k.to_string())
                        .unwrap_or_default(),
                };
                let source = urlencoding::decode(&source)
                    .map(|s| s.into_owned())
                    .unwrap_or_default();
                let Some(mut object) = state.objects.get(&source).cloned() else {
                    return error_response(404, "NoSuchKey");
                };
                object.last_modified = Utc::now();
                let etag = object.etag.clone();
                state.objects.insert(key.to_string(), object);
                response(
                    200,
                    &[],
                    &format!(
                        "<CopyObjectResult><ETag>{}</ETag><LastModified>2024-01-01T00:00:00.000Z</LastModified></CopyObjectResult>",
                        etag
                    ),
                )
            }
            Method::Put => {
                let object = StoredObject {
                    etag: quoted_md5(&recorded.body),
                    data: recorded.body.clone(),
                    content_type: recorded
                        .headers
                        .get("content-type")
                        .cloned()
                        .unwrap_or_default(),
                    headers: provider_headers(&recorded.headers, self.inner.provider),
                    last_modified: Utc::now(),
                };
                let etag = object.etag.clone();
                state.objects.insert(key.to_string(), object);
                response(200, &[("etag", etag)], "")
            }
            Method::Post if recorded.has_query("uploads") => {
                state.next_upload += 1;
                let upload_id = format!("upload-{:04}", state.next_upload);
                state.uploads.insert(
                    upload_id.clone(),
                    PendingUpload {
                        key: key.to_string(),
                        content_type: recorded
                            .headers
                            .get("content-type")
                            .cloned()
                            .unwrap_or_default(),
                        headers: provider_headers(&recorded.headers, self.inner.provider),
                        parts: BTreeMap::new(),
                    },
                );
                response(
                    200,
                    &[],
                    &format!(
                        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<InitiateMultipartUploadResult><Bucket>b</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                        key, upload_id
                    ),
                )
            }
            Method::Post if recorded.has_query("uploadId") => {
                if state.fail_complete {
                    return error_response(500, "InternalError");
                }
                let upload_id = recorded.query_value("uploadId").unwrap_or_default().to_string();
                let body = String::from_utf8_lossy(&recorded.body).into_owned();
                let numbers: Vec<u32> = tag_values(&body, "PartNumber")
                    .iter()
                    .filter_map(|n| n.parse().ok())
                    .collect();
                let etags = tag_values(&body, "ETag");
                state.manifests.push(numbers.clone());

                if numbers.windows(2).any(|w| w[0] >= w[1]) {
                    return error_response(400, "InvalidPartOrder");
                }
                let Some(upload) = state.uploads.remove(&upload_id) else {
                    return error_response(404, "NoSuchUpload");
                };

                let mut data = Vec::new();
                for (number, etag) in numbers.iter().zip(&etags) {
                    match upload.parts.get(number) {
                        Some((stored, bytes)) if stored == etag => data.extend_from_slice(bytes),
                        _ => return error_response(400, "InvalidPart"),
                    }
                }

                let etag = format!("\"{}-{}\"", md5_hex(&data), numbers.len());
                state.objects.insert(
                    upload.key.clone(),
                    StoredObject {
                        data: Bytes::from(data),
                        content_type: upload.content_type,
                        etag: etag.clone(),
                        headers: upload.headers,
                        last_modified: Utc::now(),
                    },
                );
                response(
                    200,
                    &[],
                    &format!(
                        "<CompleteMultipartUploadResult><Key>{}</Key><ETag>{}</ETag></CompleteMultipartUploadResult>",
                        upload.key, etag
                    ),
                )
            }
            Method::Post if recorded.has_query("delete") => {
                let expected_md5 = BASE64.encode(Md5::digest(&recorded.body));
                if recorded.headers.get("content-md5") != Some(&expected_md5) {
                    return error_response(400, "InvalidDigest");
                }
                let body = String::from_utf8_lossy(&recorded.body).into_owned();
                if !body.contains("<Quiet>true</Quiet>") {
                    return error_response(400, "MalformedXML");
                }

                let mut errors = String::new();
                for key in tag_values(&body, "Key") {
                    if state.refuse_delete.contains(&key) {
                        errors.push_str(&format!(
                            "<Error><Key>{}</Key><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
                            key
                        ));
                    } else {
                        state.objects.remove(&key);
                    }
                }
                response(200, &[], &format!("<DeleteResult>{}</DeleteResult>", errors))
            }
            Method::Delete if recorded.has_query("uploadId") => {
                let upload_id = recorded.query_value("uploadId").unwrap_or_default();
                match state.uploads.remove(upload_id) {
                    Some(_) => response(204, &[], ""),
                    None => error_response(404, "NoSuchUpload"),
                }
            }
            Method::Delete => match state.objects.remove(key) {
                Some(_) => response(204, &[], ""),
                None => error_response(404, "NoSuchKey"),
            },
            Method::Head => match state.objects.get(key) {
                Some(object) => {
                    let headers = vec![
                        ("content-length", object.data.len().to_string()),
                        ("content-type", object.content_type.clone()),
                        ("etag", object.etag.clone()),
                        (
                            "last-modified",
                            object
                                .last_modified
                                .format("%a, %d %b %Y %H:%M:%S GMT")
                                .to_string(),
                        ),
                    ];
                    let meta: Vec<(String, String)> = object
                        .headers
                        .iter()
                        .filter(|(k, _)| k.starts_with(meta_prefix))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    let mut resp = response(200, &headers, "");
                    resp.headers.extend(meta);
                    resp
                }
                None => response(404, &[], ""),
            },
            Method::Get if key.is_empty() => list_objects(&state, recorded),
            Method::Get => match state.objects.get(key) {
                Some(object) => {
                    let object = object.clone();
                    let mut resp = response(200, &[("etag", object.etag)], "");
                    resp.body = object.data;
                    resp
                }
                None => error_response(404, "NoSuchKey"),
            },
            _ => error_response(405, "MethodNotAllowed"),
        }
    }
}

impl Transport for MockProvider {
    async fn send(&self, request: HttpRequest) -> StorageResult<HttpResponse> {
        let url = url::Url::parse(&request.url).expect("valid request url");
        let key = urlencoding::decode(url.path().trim_start_matches('/'))
            .expect("utf-8 path")
            .into_owned();
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let recorded = RecordedRequest {
            method: request.method,
            url: request.url.clone(),
            key: key.clone(),
            query: query.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        };
        self.state().requests.push(recorded.clone());

        if !self.verify_signature(request.method, &key, &query, &request.headers) {
            return Ok(error_response(403, "SignatureDoesNotMatch"));
        }

        if recorded.is_part_upload() {
            let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let staggered = self.state().staggered_parts;
            let part_number: u64 = recorded
                .query_value("partNumber")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            let delay = if staggered { 100 / part_number } else { 1 };
            tokio::time::sleep(Duration::from_millis(delay)).await;

            self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        Ok(self.handle(&recorded))
    }
}

fn list_objects(state: &State, recorded: &RecordedRequest) -> HttpResponse {
    let prefix = recorded.query_value("prefix").unwrap_or_default();
    let delimiter = recorded.query_value("delimiter").unwrap_or_default();
    let marker = recorded.query_value("marker").unwrap_or_default();
    let max_keys: usize = recorded
        .query_value("max-keys")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);

    let mut contents = Vec::new();
    let mut prefixes = BTreeSet::new();
    let mut truncated = false;
    let mut last = None;

    for (key, object) in state.objects.range::<str, _>((
        std::ops::Bound::Excluded(marker),
        std::ops::Bound::Unbounded,
    )) {
        if !key.starts_with(prefix) {
            continue;
        }
        if contents.len() + prefixes.len() >= max_keys {
            truncated = true;
            break;
        }
        let rest = &key[prefix.len()..];
        if !delimiter.is_empty() {
            if let Some(index) = rest.find(delimiter) {
                prefixes.insert(format!("{}{}", prefix, &rest[..index + delimiter.len()]));
                last = Some(key.clone());
                continue;
            }
        }
        contents.push(format!(
            "<Contents><Key>{}</Key><LastModified>{}</LastModified><ETag>{}</ETag><Size>{}</Size><StorageClass>Standard</StorageClass></Contents>",
            key,
            object.last_modified.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            object.etag,
            object.data.len()
        ));
        last = Some(key.clone());
    }

    let next_marker = match (&last, truncated && !state.omit_next_marker) {
        (Some(last), true) => format!("<NextMarker>{}</NextMarker>", last),
        _ => String::new(),
    };
    let common: String = prefixes
        .iter()
        .map(|p| format!("<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>", p))
        .collect();

    response(
        200,
        &[],
        &format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<ListBucketResult><Name>bucket</Name><Prefix>{}</Prefix><Marker>{}</Marker><MaxKeys>{}</MaxKeys><IsTruncated>{}</IsTruncated>{}{}{}</ListBucketResult>",
            prefix,
            marker,
            max_keys,
            truncated,
            next_marker,
            contents.concat(),
            common
        ),
    )
}

fn copy_source(headers: &BTreeMap<String, String>) -> Option<String> {
    headers
        .get("x-oss-copy-source")
        .or_else(|| headers.get("x-cos-copy-source"))
        .cloned()
}

fn provider_headers(headers: &BTreeMap<String, String>, provider: Provider) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(k, _)| k.starts_with(provider.header_prefix()) && !k.ends_with("security-token"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn tag_values(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    body.split(&open)
        .skip(1)
        .filter_map(|chunk| chunk.split_once(&close).map(|(v, _)| unescape(v)))
        .collect()
}

fn unescape(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

fn quoted_md5(data: &[u8]) -> String {
    format!("\"{}\"", md5_hex(data).to_uppercase())
}

fn response(status: u16, headers: &[(&str, String)], body: &str) -> HttpResponse {
    HttpResponse {
        status,
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        body: Bytes::from(body.to_string()),
    }
}

fn error_response(status: u16, code: &str) -> HttpResponse {
    response(
        status,
        &[],
        &format!("<Error><Code>{}</Code><Message>{}</Message></Error>", code, code),
    )
}

/// Small thresholds so multipart paths run on kilobytes.
pub fn test_tuning() -> UploadTuning {
    UploadTuning {
        multipart_threshold: 1024,
        part_size: 256,
        parallelism: 3,
        cdn_threshold: 100,
        ..UploadTuning::default()
    }
}

pub fn oss_settings() -> StorageSettings {
    StorageSettings::new("oss", "region-1", "my-bucket", ACCESS_KEY_ID, ACCESS_KEY_SECRET)
        .tuning(test_tuning())
}

pub fn cos_settings() -> StorageSettings {
    StorageSettings::new(
        "cos",
        "ap-guangzhou",
        "media-1250000000",
        ACCESS_KEY_ID,
        ACCESS_KEY_SECRET,
    )
    .tuning(test_tuning())
}

pub fn service(settings: StorageSettings) -> (StorageService<MockProvider>, MockProvider) {
    let config = StorageConfig::from_settings(settings).expect("valid settings");
    let mock = MockProvider::new(config.provider());
    (StorageService::with_transport(config, mock.clone()), mock)
}

pub fn oss_service() -> (StorageService<MockProvider>, MockProvider) {
    service(oss_settings())
}

pub fn cos_service() -> (StorageService<MockProvider>, MockProvider) {
    service(cos_settings())
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
