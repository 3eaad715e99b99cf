//! The capability interface the verifier runs against.
//!
//! Every operation is asynchronous and returns a boxed future so the trait
//! stays object-safe; the verifier holds a `&dyn ObjectStore` and never knows
//! whether it is talking to Cloud Storage or to the in-memory fake.

use crate::{
    credentials::CredentialsError,
    models::{
        bucket::{BucketMetadata, Policy},
        object::{FetchResponse, ObjectUpload, SignRequest, SignedUrl, StoredObject},
    },
    signing::SigningError,
};
use futures::future::BoxFuture;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("permission denied (HTTP {status}): {message}")]
    PermissionDenied { status: u16, message: String },
    #[error("unexpected response (HTTP {status}): {message}")]
    Unexpected { status: u16, message: String },
    #[error("network failure: {0}")]
    Transport(String),
    #[error("invalid endpoint `{0}`")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
}

impl StoreError {
    /// HTTP status behind the error, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            StoreError::BucketNotFound(_) | StoreError::ObjectNotFound { .. } => Some(404),
            StoreError::PermissionDenied { status, .. } | StoreError::Unexpected { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::BucketNotFound(_) | StoreError::ObjectNotFound { .. }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub type StoreFuture<'a, T> = BoxFuture<'a, StoreResult<T>>;

/// Operations the verifier needs from an object store.
pub trait ObjectStore: Send + Sync {
    /// Whether `bucket` exists. Permission errors are returned, not folded into `false`.
    fn bucket_exists<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, bool>;

    fn bucket_metadata<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, BucketMetadata>;

    fn bucket_policy<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, Policy>;

    fn upload<'a>(&'a self, bucket: &'a str, object: ObjectUpload) -> StoreFuture<'a, StoredObject>;

    /// The unauthenticated URL form of an object.
    fn public_url(&self, bucket: &str, key: &str) -> String;

    fn signed_url<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        request: SignRequest,
    ) -> StoreFuture<'a, SignedUrl>;

    /// Unauthenticated GET. Any HTTP response is `Ok`; only transport failures are `Err`.
    fn fetch<'a>(&'a self, url: &'a str) -> StoreFuture<'a, FetchResponse>;

    fn delete<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, ()>;
}
