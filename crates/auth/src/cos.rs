use chrono::{DateTime, Utc};
use ring::{digest, hmac};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::{AuthError, Authorization, Credentials, RequestSigner, SigningRequest};

pub const COS_SECURITY_TOKEN_HEADER: &str = "x-cos-security-token";

/// Window for header-authenticated requests unless configured otherwise.
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(600);

const COS_HEADER_PREFIX: &str = "x-cos-";
const SIGN_ALGORITHM: &str = "sha1";

/// Time-window signer producing `q-sign-algorithm=sha1&q-ak=...` credentials.
#[derive(Debug, Clone)]
pub struct CosSigner {
    credentials: Credentials,
    request_ttl: Duration,
}

/// A parsed or freshly computed COS credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosAuthorization {
    pub access_key_id: String,
    /// `"{start};{end}"` in Unix seconds.
    pub key_time: String,
    /// Names of the headers that were signed, in signing order.
    pub header_list: Vec<String>,
    /// Names of the query parameters that were signed, in signing order.
    pub url_param_list: Vec<String>,
    pub signature: String,
}

impl CosSigner {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            request_ttl: DEFAULT_REQUEST_TTL,
        }
    }

    pub fn with_request_ttl(mut self, ttl: Duration) -> Self {
        self.request_ttl = ttl;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Compute the credential for an explicit validity window.
    pub fn authorization(&self, request: &SigningRequest<'_>, start: i64, end: i64) -> CosAuthorization {
        let key_time = format!("{};{}", start, end);
        let (http_string, header_list, url_param_list) = Self::http_string(request);
        let signature = self.calculate_signature(&key_time, &http_string);

        CosAuthorization {
            access_key_id: self.credentials.access_key_id.clone(),
            key_time,
            header_list,
            url_param_list,
            signature,
        }
    }

    /// Recompute the signature for the window and lists a credential claims.
    ///
    /// The header and parameter lists must match what the request actually
    /// carries, otherwise verification fails.
    pub fn verify(&self, request: &SigningRequest<'_>, auth: &CosAuthorization) -> bool {
        let (http_string, header_list, url_param_list) = Self::http_string(request);
        if header_list != auth.header_list || url_param_list != auth.url_param_list {
            return false;
        }
        let Ok(tag) = hex::decode(&auth.signature) else {
            return false;
        };

        let string_to_sign = Self::string_to_sign(&auth.key_time, &http_string);
        let key = self.signing_key(&auth.key_time);
        hmac::verify(&key, string_to_sign.as_bytes(), &tag).is_ok()
    }

    /// `lower(method)\npath\nparams\nheaders\n` plus the signed name lists.
    pub fn http_string(request: &SigningRequest<'_>) -> (String, Vec<String>, Vec<String>) {
        let (params, param_list) = Self::format_pairs(
            request
                .query
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        let (headers, header_list) = Self::format_pairs(
            request
                .headers
                .iter()
                .filter(|(k, _)| is_signed_header(k))
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );

        let http_string = format!(
            "{}\n/{}\n{}\n{}\n",
            request.method.to_ascii_lowercase(),
            request.key,
            params,
            headers
        );

        (http_string, header_list, param_list)
    }

    pub fn string_to_sign(key_time: &str, http_string: &str) -> String {
        let hashed = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, http_string.as_bytes());
        format!("{}\n{}\n{}\n", SIGN_ALGORITHM, key_time, hex::encode(hashed.as_ref()))
    }

    fn signing_key(&self, key_time: &str) -> hmac::Key {
        let secret = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            self.credentials.access_key_secret.as_bytes(),
        );
        let sign_key = hex::encode(hmac::sign(&secret, key_time.as_bytes()).as_ref());
        hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, sign_key.as_bytes())
    }

    fn calculate_signature(&self, key_time: &str, http_string: &str) -> String {
        let string_to_sign = Self::string_to_sign(key_time, http_string);
        let signature = hmac::sign(&self.signing_key(key_time), string_to_sign.as_bytes());
        hex::encode(signature.as_ref())
    }

    /// Encode, lowercase and sort key/value pairs. Returns the `k=v&...`
    /// string and the `;`-joinable key list.
    fn format_pairs<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> (String, Vec<String>) {
        let mut encoded: Vec<(String, String)> = pairs
            .map(|(k, v)| {
                (
                    urlencoding::encode(k).to_lowercase(),
                    urlencoding::encode(v.trim()).into_owned(),
                )
            })
            .collect();
        encoded.sort_by(|a, b| a.0.cmp(&b.0));

        let joined = encoded
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let names = encoded.into_iter().map(|(k, _)| k).collect();

        (joined, names)
    }

    fn headers_with_token(&self, headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut headers = headers.clone();
        if let Some(token) = &self.credentials.security_token {
            headers.insert(COS_SECURITY_TOKEN_HEADER.to_string(), token.clone());
        }
        headers
    }
}

impl RequestSigner for CosSigner {
    fn sign(&self, request: &SigningRequest<'_>, now: DateTime<Utc>) -> Authorization {
        let headers = self.headers_with_token(request.headers);
        let signed = SigningRequest {
            headers: &headers,
            ..*request
        };

        let start = now.timestamp();
        let end = start + self.request_ttl.as_secs() as i64;
        let auth = self.authorization(&signed, start, end);

        let mut out = vec![("authorization".to_string(), auth.to_string())];
        if let Some(token) = &self.credentials.security_token {
            out.push((COS_SECURITY_TOKEN_HEADER.to_string(), token.clone()));
        }

        Authorization { headers: out }
    }

    fn presign(
        &self,
        request: &SigningRequest<'_>,
        expires_in: Duration,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let start = now.timestamp();
        let end = start + expires_in.as_secs() as i64;

        let mut params = self.authorization(request, start, end).to_query_pairs();
        if let Some(token) = &self.credentials.security_token {
            params.push((COS_SECURITY_TOKEN_HEADER.to_string(), token.clone()));
        }
        params
    }
}

impl CosAuthorization {
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("q-sign-algorithm".to_string(), SIGN_ALGORITHM.to_string()),
            ("q-ak".to_string(), self.access_key_id.clone()),
            ("q-sign-time".to_string(), self.key_time.clone()),
            ("q-key-time".to_string(), self.key_time.clone()),
            ("q-header-list".to_string(), self.header_list.join(";")),
            ("q-url-param-list".to_string(), self.url_param_list.join(";")),
            ("q-signature".to_string(), self.signature.clone()),
        ]
    }

    /// Parse the `&`-joined form found in an `Authorization` header.
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        for part in value.split('&') {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            fields.insert(k, v);
        }

        let field = |name: &str| {
            fields
                .get(name)
                .copied()
                .ok_or_else(|| AuthError::Malformed(format!("missing {}", name)))
        };

        if field("q-sign-algorithm")? != SIGN_ALGORITHM {
            return Err(AuthError::Malformed("unsupported sign algorithm".to_string()));
        }

        let split_list = |list: &str| {
            list.split(';')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        };

        Ok(Self {
            access_key_id: field("q-ak")?.to_string(),
            key_time: field("q-key-time")?.to_string(),
            header_list: split_list(field("q-header-list")?),
            url_param_list: split_list(field("q-url-param-list")?),
            signature: field("q-signature")?.to_string(),
        })
    }

    /// The `(start, end)` window in Unix seconds.
    pub fn window(&self) -> Option<(i64, i64)> {
        let (start, end) = self.key_time.split_once(';')?;
        Some((start.parse().ok()?, end.parse().ok()?))
    }
}

impl fmt::Display for CosAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .to_query_pairs()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        f.write_str(&joined)
    }
}

fn is_signed_header(name: &str) -> bool {
    matches!(name, "content-type" | "content-length" | "content-md5")
        || name.starts_with(COS_HEADER_PREFIX)
}
