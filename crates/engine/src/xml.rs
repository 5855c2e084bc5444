//! Provider XML documents and their conversion into the wire-independent
//! model. Nothing outside this module sees the document shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::types::{CompletedPart, DeleteFailure, FileMetadata, ListResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
struct CompleteMultipartUploadResult {
    #[serde(rename = "ETag", default)]
    etag: String,
}

#[derive(Debug, Deserialize)]
struct CopyObjectResult {
    #[serde(rename = "ETag", default)]
    etag: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_marker: Option<String>,
    #[serde(default)]
    contents: Vec<ObjectEntry>,
    #[serde(default)]
    common_prefixes: Vec<CommonPrefix>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectEntry {
    key: String,
    #[serde(default)]
    last_modified: Option<String>,
    #[serde(rename = "ETag", default)]
    etag: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommonPrefix {
    prefix: String,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteResult {
    #[serde(rename = "Error", default)]
    errors: Vec<DeleteError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteError {
    key: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    parts: Vec<PartEntry<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PartEntry<'a> {
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Delete<'a> {
    quiet: bool,
    #[serde(rename = "Object")]
    objects: Vec<DeleteObject<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteObject<'a> {
    key: &'a str,
}

pub fn parse_upload_id(body: &str) -> StorageResult<String> {
    let doc: InitiateMultipartUploadResult = quick_xml::de::from_str(body)?;
    if doc.upload_id.trim().is_empty() {
        return Err(StorageError::Decode("empty UploadId".to_string()));
    }
    Ok(doc.upload_id.trim().to_string())
}

pub fn parse_complete_etag(body: &str) -> StorageResult<String> {
    let doc: CompleteMultipartUploadResult = quick_xml::de::from_str(body)?;
    Ok(doc.etag)
}

pub fn parse_copy_etag(body: &str) -> StorageResult<String> {
    let doc: CopyObjectResult = quick_xml::de::from_str(body)?;
    Ok(doc.etag)
}

pub fn parse_list_result(body: &str) -> StorageResult<ListResult> {
    let doc: ListBucketResult = quick_xml::de::from_str(body)?;

    let objects: Vec<FileMetadata> = doc
        .contents
        .into_iter()
        .map(|entry| FileMetadata {
            object_key: entry.key,
            size: entry.size,
            content_type: None,
            etag: normalize_etag(&entry.etag),
            last_modified: entry.last_modified.as_deref().and_then(parse_iso8601),
            metadata: Default::default(),
        })
        .collect();

    let next_marker = doc
        .next_marker
        .filter(|m| !m.is_empty())
        .or_else(|| {
            // Some responses omit NextMarker without a delimiter; the last key continues the listing.
            if doc.is_truncated {
                objects.last().map(|o| o.object_key.clone())
            } else {
                None
            }
        });

    Ok(ListResult {
        objects,
        common_prefixes: doc.common_prefixes.into_iter().map(|p| p.prefix).collect(),
        is_truncated: doc.is_truncated,
        next_marker: if doc.is_truncated { next_marker } else { None },
    })
}

pub fn parse_delete_failures(body: &str) -> StorageResult<Vec<DeleteFailure>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let doc: DeleteResult = quick_xml::de::from_str(body)?;
    Ok(doc
        .errors
        .into_iter()
        .map(|e| DeleteFailure {
            key: e.key,
            code: e.code,
            message: e.message,
        })
        .collect())
}

/// Manifest for the completion call. Parts must already be in ascending order.
pub fn complete_multipart_body(parts: &[CompletedPart]) -> StorageResult<String> {
    let doc = CompleteMultipartUpload {
        parts: parts
            .iter()
            .map(|p| PartEntry {
                part_number: p.part_number,
                etag: &p.etag,
            })
            .collect(),
    };
    Ok(quick_xml::se::to_string_with_root("CompleteMultipartUpload", &doc)?)
}

pub fn delete_objects_body(keys: &[String]) -> StorageResult<String> {
    let doc = Delete {
        quiet: true,
        objects: keys.iter().map(|key| DeleteObject { key }).collect(),
    };
    Ok(quick_xml::se::to_string_with_root("Delete", &doc)?)
}

/// Strip the quotes providers wrap around ETags.
pub fn normalize_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}

fn parse_iso8601(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
