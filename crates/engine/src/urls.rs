use chrono::{DateTime, Utc};
use cloudstash_auth::{RequestSigner, SigningRequest};
use std::collections::BTreeMap;

use crate::client::object_url;
use crate::keys::encode_key_path;
use crate::service::StorageService;
use crate::traits::Transport;
use crate::types::SignedUrlOptions;

impl<T: Transport> StorageService<T> {
    /// Direct URL on the bucket's public origin. Only readable if the object
    /// is public.
    pub fn public_url(&self, key: &str) -> String {
        object_url(&self.config().public_endpoint(), key, &[])
    }

    pub fn cdn_url(&self, key: &str) -> Option<String> {
        self.config()
            .cdn_domain()
            .map(|domain| format!("https://{}/{}", domain, encode_key_path(key)))
    }

    /// Time-limited URL that needs no further credentials.
    pub fn signed_url(&self, key: &str, options: &SignedUrlOptions) -> String {
        self.signed_url_at(key, options, Utc::now())
    }

    /// [`signed_url`](Self::signed_url) with an explicit clock.
    pub fn signed_url_at(&self, key: &str, options: &SignedUrlOptions, now: DateTime<Utc>) -> String {
        let mut query = Vec::new();
        if let Some(content_type) = &options.response_content_type {
            query.push(("response-content-type".to_string(), content_type.clone()));
        }
        if let Some(disposition) = &options.response_content_disposition {
            query.push((
                "response-content-disposition".to_string(),
                disposition.clone(),
            ));
        }

        let headers = BTreeMap::new();
        let auth = self.client.signer().presign(
            &SigningRequest {
                method: options.method.as_str(),
                bucket: self.config().bucket(),
                key,
                query: &query,
                headers: &headers,
            },
            options.expires_in,
            now,
        );
        query.extend(auth);

        object_url(&self.config().public_endpoint(), key, &query)
    }

    /// CDN URL for objects above the CDN threshold when a CDN is configured,
    /// the public URL otherwise. Without `size_hint` the size is fetched; a
    /// failed fetch falls back to the public URL.
    pub async fn best_url(&self, key: &str, size_hint: Option<u64>) -> String {
        let Some(cdn_url) = self.cdn_url(key) else {
            return self.public_url(key);
        };

        let size = match size_hint {
            Some(size) => size,
            None => match self.get_metadata(key).await {
                Ok(meta) => meta.size,
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Size lookup failed, using public URL");
                    return self.public_url(key);
                }
            },
        };

        if size > self.config().tuning().cdn_threshold {
            cdn_url
        } else {
            self.public_url(key)
        }
    }
}
