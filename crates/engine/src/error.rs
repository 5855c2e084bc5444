use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid storage configuration: {}", .0.join("; "))]
    ConfigValidation(Vec<String>),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Provider returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Multipart upload {upload_id} for {key} aborted: {source}")]
    MultipartAborted {
        key: String,
        upload_id: String,
        #[source]
        source: Box<StorageError>,
    },

    #[error("Malformed provider response: {0}")]
    Decode(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StorageError {
    /// HTTP status carried by a provider error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            StorageError::Provider { status, .. } => Some(*status),
            StorageError::NotFound(_) => Some(404),
            StorageError::MultipartAborted { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        StorageError::Transport(e.to_string())
    }
}

impl From<quick_xml::de::DeError> for StorageError {
    fn from(e: quick_xml::de::DeError) -> Self {
        StorageError::Decode(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
