use std::time::Instant;

use crate::client::ensure_object_key;
use crate::error::{StorageError, StorageResult};
use crate::service::StorageService;
use crate::traits::Transport;
use crate::types::{DeleteFailure, FileMetadata, ListOptions, ListResult};
use crate::xml::normalize_etag;

/// Largest key count a single batch delete call accepts.
pub const MAX_DELETE_BATCH: usize = 1000;

const LIST_PAGE_SIZE: u32 = 1000;

impl<T: Transport> StorageService<T> {
    /// Remove one object. Deleting a missing key succeeds.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let existed = self.client.delete_object(key).await?;
        tracing::info!(
            bucket = %self.config().bucket(),
            key = %key,
            existed,
            "Object deleted"
        );
        Ok(())
    }

    /// Quiet batch delete. Returns the keys the provider refused; an empty
    /// list means every key is gone.
    pub async fn delete_multiple(&self, keys: &[String]) -> StorageResult<Vec<DeleteFailure>> {
        // Every key is checked before the first call goes out.
        for key in keys {
            ensure_object_key(key)?;
        }

        let mut failures = Vec::new();
        for chunk in keys.chunks(MAX_DELETE_BATCH) {
            failures.extend(self.client.delete_objects(chunk).await?);
        }

        if failures.is_empty() {
            tracing::info!(bucket = %self.config().bucket(), count = keys.len(), "Objects deleted");
        } else {
            tracing::warn!(
                bucket = %self.config().bucket(),
                count = keys.len(),
                failed = failures.len(),
                "Batch delete partially failed"
            );
        }

        Ok(failures)
    }

    /// Server-side copy. Returns the ETag of `target`.
    pub async fn copy(&self, source: &str, target: &str) -> StorageResult<String> {
        let etag = self.client.copy_object(source, target).await?;
        tracing::info!(
            bucket = %self.config().bucket(),
            source = %source,
            target = %target,
            "Object copied"
        );
        Ok(normalize_etag(&etag))
    }

    /// Copy then delete the source. Not atomic: if the delete fails both
    /// objects exist.
    pub async fn move_object(&self, source: &str, target: &str) -> StorageResult<String> {
        let etag = self.copy(source, target).await?;
        self.delete(source).await?;
        Ok(etag)
    }

    /// Any failure, not just a 404, reads as absent.
    pub async fn exists(&self, key: &str) -> bool {
        match self.client.head_object(key).await {
            Ok(_) => true,
            Err(StorageError::NotFound(_)) => false,
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Existence probe failed");
                false
            }
        }
    }

    pub async fn get_metadata(&self, key: &str) -> StorageResult<FileMetadata> {
        self.client.head_object(key).await
    }

    /// One page of keys.
    pub async fn list(&self, options: &ListOptions) -> StorageResult<ListResult> {
        self.client.list_objects(options).await
    }

    /// Every object under `prefix`, following continuation markers.
    pub async fn list_all(&self, prefix: &str) -> StorageResult<Vec<FileMetadata>> {
        let started = Instant::now();
        let mut options = ListOptions {
            prefix: Some(prefix.to_string()),
            max_keys: Some(LIST_PAGE_SIZE),
            ..Default::default()
        };
        let mut objects = Vec::new();
        let mut pages = 0u32;

        loop {
            let page = self.list(&options).await?;
            pages += 1;
            objects.extend(page.objects);

            match page.next_marker {
                Some(marker)
                    if page.is_truncated && options.marker.as_deref() != Some(marker.as_str()) =>
                {
                    options.marker = Some(marker);
                }
                _ => break,
            }
        }

        tracing::debug!(
            bucket = %self.config().bucket(),
            prefix = %prefix,
            pages,
            count = objects.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Listing finished"
        );

        Ok(objects)
    }
}
