//! Object key layout: `category/YYYY/MM/<uuid>[.ext]`.
//!
//! The year/month partition keeps later archival tractable; the random
//! identifier makes keys collision-free without coordination.

use chrono::{DateTime, Datelike, Utc};
use std::path::Path;
use uuid::Uuid;

/// Generate a fresh key for an upload in `category`.
pub fn generate_object_key(category: &str, filename: &str) -> String {
    generate_object_key_at(category, filename, Utc::now())
}

/// Same as [`generate_object_key`] with an explicit clock.
pub fn generate_object_key_at(category: &str, filename: &str, now: DateTime<Utc>) -> String {
    let id = Uuid::new_v4();
    let name = match extension(filename) {
        Some(ext) => format!("{}.{}", id, ext),
        None => id.to_string(),
    };

    let category = category.trim().trim_matches('/');
    if category.is_empty() {
        format!("{:04}/{:02}/{}", now.year(), now.month(), name)
    } else {
        format!("{}/{:04}/{:02}/{}", category, now.year(), now.month(), name)
    }
}

/// Lower-cased extension of the last path component, if any.
pub fn extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(str::to_ascii_lowercase)
}

/// Best-effort MIME type from a file name.
pub fn guess_content_type(filename: &str) -> &'static str {
    match extension(filename).as_deref().unwrap_or("") {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

/// Percent-encode each path segment of a key, keeping the `/` separators.
pub fn encode_key_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
