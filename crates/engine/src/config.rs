//! Connection settings, validation and endpoint derivation.
//!
//! [`StorageSettings`] is the raw, possibly incomplete input (TOML file or
//! environment). [`StorageConfig`] only exists once every check passed.

use cloudstash_auth::{Credentials, Provider};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{StorageError, StorageResult};

pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;
pub const DEFAULT_PARALLELISM: usize = 4;
pub const DEFAULT_CDN_THRESHOLD: u64 = 100 * 1024;
pub const DEFAULT_SIGNED_URL_TTL_SECS: u64 = 3600;
pub const DEFAULT_REQUEST_TTL_SECS: u64 = 600;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

const OSS_REGIONS: &[&str] = &[
    "oss-cn-hangzhou",
    "oss-cn-shanghai",
    "oss-cn-nanjing",
    "oss-cn-fuzhou",
    "oss-cn-qingdao",
    "oss-cn-beijing",
    "oss-cn-zhangjiakou",
    "oss-cn-huhehaote",
    "oss-cn-wulanchabu",
    "oss-cn-shenzhen",
    "oss-cn-heyuan",
    "oss-cn-guangzhou",
    "oss-cn-chengdu",
    "oss-cn-hongkong",
    "oss-us-west-1",
    "oss-us-east-1",
    "oss-ap-southeast-1",
    "oss-ap-southeast-3",
    "oss-ap-southeast-5",
    "oss-ap-northeast-1",
    "oss-eu-central-1",
    "oss-eu-west-1",
    "oss-me-east-1",
];

const COS_REGIONS: &[&str] = &[
    "ap-beijing",
    "ap-nanjing",
    "ap-shanghai",
    "ap-guangzhou",
    "ap-chengdu",
    "ap-chongqing",
    "ap-hongkong",
    "ap-singapore",
    "ap-jakarta",
    "ap-seoul",
    "ap-bangkok",
    "ap-tokyo",
    "na-siliconvalley",
    "na-ashburn",
    "sa-saopaulo",
    "eu-frankfurt",
];

/// Size thresholds, concurrency and lifetimes used by the upload and URL paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadTuning {
    /// Payloads strictly larger than this go through multipart upload.
    pub multipart_threshold: u64,
    pub part_size: u64,
    /// Maximum number of part uploads in flight.
    pub parallelism: usize,
    /// Objects larger than this are served through the CDN when one is configured.
    pub cdn_threshold: u64,
    pub signed_url_ttl_secs: u64,
    /// Validity window of header-signed requests (COS only).
    pub request_ttl_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for UploadTuning {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            cdn_threshold: DEFAULT_CDN_THRESHOLD,
            signed_url_ttl_secs: DEFAULT_SIGNED_URL_TTL_SECS,
            request_ttl_secs: DEFAULT_REQUEST_TTL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl UploadTuning {
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_secs(self.request_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Unvalidated connection settings.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub provider: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub access_key_secret: Option<String>,
    pub security_token: Option<String>,
    pub cdn_domain: Option<String>,
    /// Bucket origin to use instead of the derived one, e.g. a bound custom domain.
    pub endpoint: Option<String>,
    /// Route API traffic over the provider's internal network.
    pub internal: bool,
    pub tuning: UploadTuning,
}

impl fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSettings")
            .field("provider", &self.provider)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &self.access_key_secret.as_ref().map(|_| "<redacted>"))
            .field("security_token", &self.security_token.as_ref().map(|_| "<redacted>"))
            .field("cdn_domain", &self.cdn_domain)
            .field("endpoint", &self.endpoint)
            .field("internal", &self.internal)
            .field("tuning", &self.tuning)
            .finish()
    }
}

impl StorageSettings {
    pub fn new(
        provider: impl Into<String>,
        region: impl Into<String>,
        bucket: impl Into<String>,
        access_key_id: impl Into<String>,
        access_key_secret: impl Into<String>,
    ) -> Self {
        Self {
            provider: Some(provider.into()),
            region: Some(region.into()),
            bucket: Some(bucket.into()),
            access_key_id: Some(access_key_id.into()),
            access_key_secret: Some(access_key_secret.into()),
            ..Default::default()
        }
    }

    pub fn cdn_domain(mut self, domain: impl Into<String>) -> Self {
        self.cdn_domain = Some(domain.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn security_token(mut self, token: impl Into<String>) -> Self {
        self.security_token = Some(token.into());
        self
    }

    pub fn tuning(mut self, tuning: UploadTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Read `STORAGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Self {
            provider: get("STORAGE_PROVIDER"),
            region: get("STORAGE_REGION"),
            bucket: get("STORAGE_BUCKET"),
            access_key_id: get("STORAGE_ACCESS_KEY_ID"),
            access_key_secret: get("STORAGE_ACCESS_KEY_SECRET"),
            security_token: get("STORAGE_SECURITY_TOKEN"),
            cdn_domain: get("STORAGE_CDN_DOMAIN"),
            endpoint: get("STORAGE_ENDPOINT"),
            internal: get("STORAGE_INTERNAL")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            tuning: UploadTuning::default(),
        }
    }
}

/// Outcome of [`validate`]: every error and warning found, not just the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Check settings without touching the network.
pub fn validate(settings: &StorageSettings) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let provider = match non_empty(&settings.provider) {
        None => {
            errors.push("provider is required".to_string());
            None
        }
        Some(raw) => match raw.parse::<Provider>() {
            Ok(provider) => Some(provider),
            Err(e) => {
                errors.push(e.to_string());
                None
            }
        },
    };

    match non_empty(&settings.region) {
        None => errors.push("region is required".to_string()),
        Some(region) => {
            if let Some(provider) = provider {
                if !known_regions(provider).contains(&region) {
                    warnings.push(format!(
                        "region '{}' is not a known {} region",
                        region, provider
                    ));
                }
            }
        }
    }

    match non_empty(&settings.bucket) {
        None => errors.push("bucket is required".to_string()),
        Some(bucket) => {
            if let Err(reason) = validate_bucket_name(bucket) {
                errors.push(format!("bucket '{}' is invalid: {}", bucket, reason));
            }
        }
    }

    if non_empty(&settings.access_key_id).is_none() {
        errors.push("access_key_id is required".to_string());
    }
    if non_empty(&settings.access_key_secret).is_none() {
        errors.push("access_key_secret is required".to_string());
    }

    if let Some(cdn) = non_empty(&settings.cdn_domain) {
        if !is_valid_host(cdn) {
            errors.push(format!("cdn_domain '{}' is not a valid host name", cdn));
        }
    }

    if let Some(endpoint) = non_empty(&settings.endpoint) {
        if url::Url::parse(&normalize_endpoint(endpoint))
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .is_none()
        {
            errors.push(format!("endpoint '{}' is not a valid URL", endpoint));
        }
        if settings.internal {
            warnings.push("internal is ignored when an explicit endpoint is set".to_string());
        }
    }

    let tuning = &settings.tuning;
    if tuning.part_size == 0 {
        errors.push("tuning.part_size must be greater than zero".to_string());
    }
    if tuning.parallelism == 0 {
        errors.push("tuning.parallelism must be greater than zero".to_string());
    }
    if tuning.signed_url_ttl_secs == 0 {
        errors.push("tuning.signed_url_ttl_secs must be greater than zero".to_string());
    }
    if tuning.request_ttl_secs == 0 {
        errors.push("tuning.request_ttl_secs must be greater than zero".to_string());
    }
    if tuning.request_timeout_secs == 0 {
        errors.push("tuning.request_timeout_secs must be greater than zero".to_string());
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Validated, immutable connection settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    provider: Provider,
    region: String,
    bucket: String,
    credentials: Credentials,
    cdn_domain: Option<String>,
    endpoint_override: Option<String>,
    use_internal_endpoint: bool,
    tuning: UploadTuning,
}

impl StorageConfig {
    pub fn from_settings(settings: StorageSettings) -> StorageResult<Self> {
        let report = validate(&settings);
        for warning in &report.warnings {
            tracing::warn!(warning = %warning, "Storage configuration warning");
        }
        if !report.valid {
            return Err(StorageError::ConfigValidation(report.errors));
        }

        // validate() guarantees every required field below is present.
        let required = |value: Option<String>| value.map(|v| v.trim().to_string()).unwrap_or_default();
        let provider = required(settings.provider)
            .parse::<Provider>()
            .map_err(|e| StorageError::ConfigValidation(vec![e.to_string()]))?;

        let mut credentials = Credentials::new(
            required(settings.access_key_id),
            required(settings.access_key_secret),
        );
        if let Some(token) = settings.security_token {
            credentials = credentials.with_security_token(token);
        }

        Ok(Self {
            provider,
            region: required(settings.region),
            bucket: required(settings.bucket),
            credentials,
            cdn_domain: settings
                .cdn_domain
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            endpoint_override: settings
                .endpoint
                .filter(|e| !e.trim().is_empty())
                .map(|e| normalize_endpoint(&e)),
            use_internal_endpoint: settings.internal,
            tuning: settings.tuning,
        })
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn cdn_domain(&self) -> Option<&str> {
        self.cdn_domain.as_deref()
    }

    pub fn use_internal_endpoint(&self) -> bool {
        self.use_internal_endpoint
    }

    pub fn tuning(&self) -> &UploadTuning {
        &self.tuning
    }

    /// Origin for API traffic, honouring the internal-network flag.
    pub fn endpoint(&self) -> String {
        match &self.endpoint_override {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://{}", self.host(self.use_internal_endpoint)),
        }
    }

    /// Origin for URLs handed to clients outside the provider network.
    pub fn public_endpoint(&self) -> String {
        match &self.endpoint_override {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://{}", self.host(false)),
        }
    }

    /// Public bucket host, without scheme.
    pub fn public_host(&self) -> String {
        self.host(false)
    }

    fn host(&self, internal: bool) -> String {
        match (self.provider, internal) {
            (Provider::Oss, false) => format!("{}.{}.aliyuncs.com", self.bucket, self.region),
            (Provider::Oss, true) => {
                format!("{}.{}-internal.aliyuncs.com", self.bucket, self.region)
            }
            (Provider::Cos, false) => format!("{}.cos.{}.myqcloud.com", self.bucket, self.region),
            (Provider::Cos, true) => {
                format!("{}.cos-internal.{}.tencentcos.cn", self.bucket, self.region)
            }
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn known_regions(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::Oss => OSS_REGIONS,
        Provider::Cos => COS_REGIONS,
    }
}

fn validate_bucket_name(name: &str) -> Result<(), &'static str> {
    if name.len() < 3 || name.len() > 63 {
        return Err("must be between 3 and 63 characters long");
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err("may only contain lowercase letters, numbers, and hyphens");
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err("must not start or end with a hyphen");
    }

    Ok(())
}

fn is_valid_host(host: &str) -> bool {
    if host.contains("://") || host.contains('/') || host.contains('?') || host.contains('#') {
        return false;
    }

    match url::Url::parse(&format!("https://{}", host)) {
        Ok(parsed) => parsed
            .host_str()
            .is_some_and(|h| !h.is_empty() && h.eq_ignore_ascii_case(host.split(':').next().unwrap_or(""))),
        Err(_) => false,
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    }
}
