//! Represents objects written to a bucket and grants issued against them.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Request to store a single object (blob) within a bucket.
#[derive(Clone, Debug)]
pub struct ObjectUpload {
    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Payload bytes.
    pub content: Bytes,

    /// Content type (MIME type).
    pub content_type: String,

    /// `Cache-Control` header stored with the object.
    pub cache_control: Option<String>,
}

impl ObjectUpload {
    /// Hex-encoded MD5 of the payload, as reported in the object's ETag.
    pub fn md5_hex(&self) -> String {
        format!("{:x}", md5::compute(&self.content))
    }
}

/// Metadata returned after a successful upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,

    /// Size in bytes.
    pub size_bytes: u64,

    /// MD5 checksum (hex) for integrity verification.
    pub etag: String,
}

/// The single action a signed grant may authorize.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignedAction {
    Read,
}

impl SignedAction {
    pub fn http_method(self) -> &'static str {
        match self {
            SignedAction::Read => "GET",
        }
    }
}

/// Parameters of a signed access grant.
#[derive(Clone, Copy, Debug)]
pub struct SignRequest {
    pub action: SignedAction,
    pub issued_at: DateTime<Utc>,
    pub expires_in: Duration,
}

impl SignRequest {
    /// A read grant issued now and valid for `expires_in`.
    pub fn read(expires_in: Duration) -> Self {
        Self {
            action: SignedAction::Read,
            issued_at: Utc::now(),
            expires_in,
        }
    }
}

/// A capability-bearing URL. Generated and consumed within one run; never persisted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    pub action: SignedAction,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of an unauthenticated HTTP fetch.
#[derive(Clone, Debug)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
