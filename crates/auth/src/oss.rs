use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use ring::hmac;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::{AuthError, Authorization, Credentials, RequestSigner, SigningRequest};

pub const OSS_SECURITY_TOKEN_HEADER: &str = "x-oss-security-token";

const OSS_HEADER_PREFIX: &str = "x-oss-";

/// Query keys that belong to the canonical resource. Anything else, such as
/// listing parameters, is left out of the signature.
const SUBRESOURCES: &[&str] = &[
    "acl",
    "append",
    "bucketInfo",
    "cname",
    "comp",
    "cors",
    "delete",
    "endTime",
    "img",
    "lifecycle",
    "live",
    "location",
    "logging",
    "objectMeta",
    "partNumber",
    "position",
    "qos",
    "referer",
    "replication",
    "replicationLocation",
    "replicationProgress",
    "response-cache-control",
    "response-content-disposition",
    "response-content-encoding",
    "response-content-language",
    "response-content-type",
    "response-expires",
    "restore",
    "security-token",
    "startTime",
    "status",
    "style",
    "styleName",
    "symlink",
    "tagging",
    "udf",
    "uploadId",
    "uploads",
    "vod",
    "website",
    "x-oss-process",
];

/// Header-MAC signer: `Authorization: OSS <ak>:<base64(hmac-sha1)>`.
#[derive(Debug, Clone)]
pub struct OssSigner {
    credentials: Credentials,
}

impl OssSigner {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Build the string to sign. `date` is the `Date` header for header
    /// authentication, or the expiry Unix timestamp for signed URLs.
    pub fn string_to_sign(request: &SigningRequest<'_>, date: &str) -> String {
        let header = |name: &str| request.headers.get(name).map(String::as_str).unwrap_or("");

        format!(
            "{}\n{}\n{}\n{}\n{}{}",
            request.method.to_ascii_uppercase(),
            header("content-md5"),
            header("content-type"),
            date,
            Self::canonical_headers(request.headers),
            Self::canonical_resource(request.bucket, request.key, request.query),
        )
    }

    /// Check a signed URL's signature against the `Expires` value it carries.
    /// `request` is the one given to `presign`; the security token is added
    /// here the same way.
    pub fn verify_presigned(&self, request: &SigningRequest<'_>, expires: i64, signature: &str) -> bool {
        let Ok(tag) = BASE64.decode(signature) else {
            return false;
        };

        let query = self.presigned_query(request.query);
        let signed = SigningRequest {
            query: &query,
            ..*request
        };
        let string_to_sign = Self::string_to_sign(&signed, &expires.to_string());
        let key = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            self.credentials.access_key_secret.as_bytes(),
        );

        hmac::verify(&key, string_to_sign.as_bytes(), &tag).is_ok()
    }

    /// Query signed into a URL: the caller's pairs plus the STS token.
    fn presigned_query(&self, query: &[(String, String)]) -> Vec<(String, String)> {
        let mut query = query.to_vec();
        let carries_token = query.iter().any(|(name, _)| name == "security-token");
        if let (Some(token), false) = (&self.credentials.security_token, carries_token) {
            query.push(("security-token".to_string(), token.clone()));
        }
        query
    }

        fn calculate_signature(&self, string_to_sign: &str) -> String {
        let key = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            self.credentials.access_key_secret.as_bytes(),
        );
        BASE64.encode(hmac::sign(&key, string_to_sign.as_bytes()).as_ref())
    }

    fn canonical_headers(headers: &BTreeMap<String, String>) -> String {
        // BTreeMap iteration is already sorted by the lowercase name.
        headers
            .iter()
            .filter(|(k, _)| k.starts_with(OSS_HEADER_PREFIX))
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect()
    }

    fn canonical_resource(bucket: &str, key: &str, query: &[(String, String)]) -> String {
        let mut resource = if bucket.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/{}", bucket, key)
        };

        let mut subresources: Vec<_> = query
            .iter()
            .filter(|(k, _)| SUBRESOURCES.contains(&k.as_str()))
            .collect();
        subresources.sort_by(|a, b| a.0.cmp(&b.0));

        if !subresources.is_empty() {
            let joined = subresources
                .into_iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        k.clone()
                    } else {
                        format!("{}={}", k, v)
                    }
                })
                .collect::<Vec<_>>()
                .join("&");
            resource.push('?');
            resource.push_str(&joined);
        }

        resource
    }

    fn headers_with_token(&self, headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut headers = headers.clone();
        if let Some(token) = &self.credentials.security_token {
            headers.insert(OSS_SECURITY_TOKEN_HEADER.to_string(), token.clone());
        }
        headers
    }
}

impl RequestSigner for OssSigner {
    fn sign(&self, request: &SigningRequest<'_>, now: DateTime<Utc>) -> Authorization {
        let date = http_date(now);
        let headers = self.headers_with_token(request.headers);
        let signed = SigningRequest {
            headers: &headers,
            ..*request
        };

        let signature = self.calculate_signature(&Self::string_to_sign(&signed, &date));

        let mut out = vec![
            (
                "authorization".to_string(),
                format!("OSS {}:{}", self.credentials.access_key_id, signature),
            ),
            ("date".to_string(), date),
        ];
        if let Some(token) = &self.credentials.security_token {
            out.push((OSS_SECURITY_TOKEN_HEADER.to_string(), token.clone()));
        }

        Authorization { headers: out }
    }

    fn presign(
        &self,
        request: &SigningRequest<'_>,
        expires_in: Duration,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let expires = now.timestamp() + expires_in.as_secs() as i64;

        let query = self.presigned_query(request.query);
        let signed = SigningRequest {
            query: &query,
            ..*request
        };

        let signature = self.calculate_signature(&Self::string_to_sign(&signed, &expires.to_string()));

        let mut params = vec![
            (
                "OSSAccessKeyId".to_string(),
                self.credentials.access_key_id.clone(),
            ),
            ("Expires".to_string(), expires.to_string()),
            ("Signature".to_string(), signature),
        ];
        if let Some(token) = &self.credentials.security_token {
            params.push(("security-token".to_string(), token.clone()));
        }
        params
    }
}

/// RFC 1123 date in GMT, the only format the `Date` header accepts.
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Split an `OSS <ak>:<signature>` header into its two parts.
pub fn parse_authorization_header(auth_header: &str) -> Result<(String, String), AuthError> {
    let credential = auth_header
        .strip_prefix("OSS ")
        .ok_or_else(|| AuthError::Malformed("missing OSS scheme".to_string()))?;

    let (access_key_id, signature) = credential
        .split_once(':')
        .ok_or_else(|| AuthError::Malformed("missing signature separator".to_string()))?;

    if access_key_id.is_empty() || signature.is_empty() {
        return Err(AuthError::Malformed("empty access key or signature".to_string()));
    }

    Ok((access_key_id.to_string(), signature.to_string()))
}
