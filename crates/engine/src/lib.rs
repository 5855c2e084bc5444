//! Object storage over OSS- and COS-style providers behind one
//! [`StorageService`].

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod keys;
pub mod multipart;
pub mod objects;
pub mod service;
pub mod traits;
pub mod types;
pub mod urls;
mod xml;

pub use cloudstash_auth::{Credentials, Provider};
pub use config::*;
pub use error::*;
pub use http::HttpTransport;
pub use keys::{generate_object_key, guess_content_type};
pub use multipart::{MultipartSession, MultipartState, plan_parts};
pub use service::StorageService;
pub use traits::*;
pub use types::*;
