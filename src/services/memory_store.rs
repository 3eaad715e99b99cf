//! In-memory object store.
//!
//! Holds buckets, their IAM policies, legacy ACLs and object payloads in
//! process memory and
//! answers anonymous and signed-URL fetches against that state with the same
//! status codes Cloud Storage uses. Backs both the unit tests of the verifier
//! and the local emulator. `Faults` lets tests make individual operations
//! misbehave.

use crate::{
    credentials::Credentials,
    errors::gcs_error_xml,
    models::{
        bucket::{BucketMetadata, Policy},
        object::{FetchResponse, ObjectUpload, SignRequest, SignedUrl, StoredObject},
    },
    services::store::{ObjectStore, StoreError, StoreFuture, StoreResult},
    signing::{self, IncomingRequest, PARAM_SIGNATURE, Signer, SigningError},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock},
};
use tracing::debug;
use url::Url;

/// Failure modes a test can switch on.
#[derive(Clone, Copy, Debug, Default)]
pub struct Faults {
    /// Every authenticated bucket and object operation answers 403.
    pub deny_access: bool,
    /// IAM policy reads answer 403, as they do for a key lacking
    /// `storage.buckets.getIamPolicy`.
    pub policy_unreadable: bool,
    /// Uploads answer 403 while other operations succeed.
    pub deny_uploads: bool,
    /// Anonymous reads succeed even though the policy is private.
    pub leak_anonymous_reads: bool,
    /// `fetch` fails before any response is received.
    pub network_down: bool,
    /// Deletes answer 503.
    pub fail_deletes: bool,
}

/// A stored payload and the metadata written with it.
#[derive(Clone, Debug)]
pub struct StoredBlob {
    pub content: Bytes,
    pub content_type: String,
    pub cache_control: Option<String>,
    pub etag: String,
    pub updated: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct MemoryBucket {
    metadata: BucketMetadata,
    iam: Policy,
    acl: Policy,
    /// Uniform bucket-level access: ACLs neither grant access nor can be read.
    uniform_access: bool,
    objects: BTreeMap<String, StoredBlob>,
}

impl MemoryBucket {
    fn readable_by_anyone(&self) -> bool {
        self.iam.is_public_readable() || (!self.uniform_access && self.acl.is_public_readable())
    }
}

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, MemoryBucket>,
    faults: Faults,
}

#[derive(Clone, Debug)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    signer: Signer,
    endpoint: Url,
}

impl MemoryStore {
    /// Create an empty store that signs with `credentials` and addresses
    /// objects under `endpoint`.
    pub fn new(credentials: impl Into<Credentials>, endpoint: Url) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            signer: Signer::new(credentials),
            endpoint,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        self.signer.credentials()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Create (or replace) a bucket with IAM policy `policy` and a private ACL.
    pub fn create_bucket(&self, name: &str, location: &str, storage_class: &str, policy: Policy) {
        let bucket = MemoryBucket {
            metadata: BucketMetadata {
                name: name.to_string(),
                location: location.to_string(),
                storage_class: storage_class.to_string(),
            },
            iam: policy,
            acl: Policy::private(),
            uniform_access: false,
            objects: BTreeMap::new(),
        };
        self.write().buckets.insert(name.to_string(), bucket);
        debug!("created in-memory bucket {}", name);
    }

    pub fn set_policy(&self, bucket: &str, policy: Policy) -> StoreResult<()> {
        self.update(bucket, |record| record.iam = policy)
    }

    pub fn set_acl(&self, bucket: &str, acl: Policy) -> StoreResult<()> {
        self.update(bucket, |record| record.acl = acl)
    }

    pub fn set_uniform_access(&self, bucket: &str, enabled: bool) -> StoreResult<()> {
        self.update(bucket, |record| record.uniform_access = enabled)
    }

    fn update(&self, bucket: &str, change: impl FnOnce(&mut MemoryBucket)) -> StoreResult<()> {
        let mut inner = self.write();
        let record = inner
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        change(record);
        Ok(())
    }

    pub fn set_faults(&self, faults: Faults) {
        self.write().faults = faults;
    }

    pub fn faults(&self) -> Faults {
        self.read().faults
    }

    /// Snapshot of a stored object, for inspection.
    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredBlob> {
        self.read()
            .buckets
            .get(bucket)
            .and_then(|record| record.objects.get(key).cloned())
    }

    pub fn object_count(&self, bucket: &str) -> usize {
        self.read()
            .buckets
            .get(bucket)
            .map(|record| record.objects.len())
            .unwrap_or(0)
    }

    pub fn head_bucket(&self, bucket: &str) -> StoreResult<bool> {
        let inner = self.read();
        deny_if(inner.faults.deny_access)?;
        Ok(inner.buckets.contains_key(bucket))
    }

    pub fn metadata(&self, bucket: &str) -> StoreResult<BucketMetadata> {
        let inner = self.read();
        deny_if(inner.faults.deny_access)?;
        inner
            .buckets
            .get(bucket)
            .map(|record| record.metadata.clone())
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))
    }

    pub fn iam_policy(&self, bucket: &str) -> StoreResult<Policy> {
        let inner = self.read();
        deny_if(inner.faults.deny_access)?;
        if inner.faults.policy_unreadable {
            return Err(StoreError::PermissionDenied {
                status: 403,
                message: "caller does not have storage.buckets.getIamPolicy access".into(),
            });
        }
        inner
            .buckets
            .get(bucket)
            .map(|record| record.iam.clone())
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))
    }

    /// Legacy bucket ACL; refused on buckets with uniform bucket-level access.
    pub fn acl(&self, bucket: &str) -> StoreResult<Policy> {
        let inner = self.read();
        deny_if(inner.faults.deny_access)?;
        let record = inner
            .buckets
            .get(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        if record.uniform_access {
            return Err(StoreError::Unexpected {
                status: 400,
                message: "Cannot get legacy ACL for a bucket that has uniform bucket-level access."
                    .into(),
            });
        }
        Ok(record.acl.clone())
    }

    /// The IAM policy plus whatever the ACL grants, when the ACL is readable.
    pub fn policy(&self, bucket: &str) -> StoreResult<Policy> {
        let iam = self.iam_policy(bucket)?;
        Ok(match self.acl(bucket) {
            Ok(acl) => iam.merged_with(&acl),
            Err(_) => iam,
        })
    }

    pub fn put(&self, bucket: &str, object: ObjectUpload) -> StoreResult<StoredObject> {
        let mut inner = self.write();
        deny_if(inner.faults.deny_access || inner.faults.deny_uploads)?;
        let record = inner
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;

        let etag = object.md5_hex();
        let stored = StoredObject {
            key: object.key.clone(),
            size_bytes: object.content.len() as u64,
            etag: etag.clone(),
        };
        record.objects.insert(
            object.key,
            StoredBlob {
                content: object.content,
                content_type: object.content_type,
                cache_control: object.cache_control,
                etag,
                updated: Utc::now(),
            },
        );
        Ok(stored)
    }

    /// Authenticated read.
    pub fn get(&self, bucket: &str, key: &str) -> StoreResult<StoredBlob> {
        let inner = self.read();
        deny_if(inner.faults.deny_access)?;
        lookup(&inner, bucket, key)
    }

    pub fn remove(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let mut inner = self.write();
        deny_if(inner.faults.deny_access)?;
        if inner.faults.fail_deletes {
            return Err(StoreError::Unexpected {
                status: 503,
                message: "backend unavailable".into(),
            });
        }
        let record = inner
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        record
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    /// Answer an unauthenticated GET the way Cloud Storage would.
    ///
    /// Requests carrying `X-Goog-Signature` are checked as signed URLs; all
    /// others are served only when the bucket policy is public.
    pub fn serve_anonymous(
        &self,
        request: &IncomingRequest<'_>,
        now: DateTime<Utc>,
    ) -> (u16, String, Bytes) {
        let Some((bucket, key)) = self.split_path(request.path) else {
            return error_response(400, "InvalidURI", "Couldn't parse the specified URI.");
        };

        let signed = request.query.iter().any(|(k, _)| k == PARAM_SIGNATURE);
        if signed {
            if let Err(err) = signing::verify_signed_url(self.credentials(), request, now) {
                debug!("rejected signed url for {}/{}: {}", bucket, key, err);
                return match err {
                    SigningError::Expired(_) => {
                        error_response(400, "ExpiredToken", "The provided token has expired.")
                    }
                    SigningError::SignatureMismatch | SigningError::UnknownAccessId(_) => {
                        error_response(
                            403,
                            "SignatureDoesNotMatch",
                            "The request signature we calculated does not match the signature you provided.",
                        )
                    }
                    other => error_response(400, "AuthorizationQueryParametersError", &other.to_string()),
                };
            }
        }

        let inner = self.read();
        let Some(record) = inner.buckets.get(&bucket) else {
            return error_response(404, "NoSuchBucket", "The specified bucket does not exist.");
        };
        if !signed && !record.readable_by_anyone() && !inner.faults.leak_anonymous_reads {
            return error_response(
                403,
                "AccessDenied",
                "Anonymous caller does not have storage.objects.get access to the Google Cloud Storage object.",
            );
        }
        match record.objects.get(&key) {
            Some(blob) => (200, blob.content_type.clone(), blob.content.clone()),
            None => error_response(404, "NoSuchKey", "The specified key does not exist."),
        }
    }

    /// Split a wire path below the endpoint into decoded `(bucket, key)`.
    fn split_path(&self, path: &str) -> Option<(String, String)> {
        let base = self.endpoint.path().trim_end_matches('/');
        let rest = path.strip_prefix(base)?.strip_prefix('/')?;
        let (bucket, key) = rest.split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        Some((signing::percent_decode(bucket), signing::percent_decode(key)))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn deny_if(denied: bool) -> StoreResult<()> {
    if denied {
        Err(StoreError::PermissionDenied {
            status: 403,
            message: "caller does not have storage access".into(),
        })
    } else {
        Ok(())
    }
}

fn lookup(inner: &Inner, bucket: &str, key: &str) -> StoreResult<StoredBlob> {
    let record = inner
        .buckets
        .get(bucket)
        .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
    record
        .objects
        .get(key)
        .cloned()
        .ok_or_else(|| StoreError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
}

fn error_response(status: u16, code: &str, message: &str) -> (u16, String, Bytes) {
    (
        status,
        "application/xml".to_string(),
        Bytes::from(gcs_error_xml(code, message)),
    )
}

impl ObjectStore for MemoryStore {
    fn bucket_exists<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, bool> {
        async move { self.head_bucket(bucket) }.boxed()
    }

    fn bucket_metadata<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, BucketMetadata> {
        async move { self.metadata(bucket) }.boxed()
    }

    fn bucket_policy<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, Policy> {
        async move { self.policy(bucket) }.boxed()
    }

    fn upload<'a>(&'a self, bucket: &'a str, object: ObjectUpload) -> StoreFuture<'a, StoredObject> {
        async move { self.put(bucket, object) }.boxed()
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}{}",
            self.endpoint.origin().ascii_serialization(),
            signing::object_path(&self.endpoint, bucket, Some(key))
        )
    }

    fn signed_url<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        request: SignRequest,
    ) -> StoreFuture<'a, SignedUrl> {
        async move {
            let url = self.signer.sign_url(
                &self.endpoint,
                request.action.http_method(),
                bucket,
                key,
                request.issued_at,
                request.expires_in,
            )?;
            Ok(SignedUrl {
                url,
                action: request.action,
                issued_at: request.issued_at,
                expires_at: request.issued_at + request.expires_in,
            })
        }
        .boxed()
    }

    fn fetch<'a>(&'a self, url: &'a str) -> StoreFuture<'a, FetchResponse> {
        async move {
            if self.faults().network_down {
                return Err(StoreError::Transport("connection reset by peer".into()));
            }
            let parsed =
                Url::parse(url).map_err(|err| StoreError::Transport(format!("{url}: {err}")))?;
            if parsed.origin() != self.endpoint.origin() {
                return Err(StoreError::Transport(format!("no route to {}", parsed.origin().ascii_serialization())));
            }

            let host = signing::host_header(&parsed)?;
            let query: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
            let request = IncomingRequest {
                method: "GET",
                host: &host,
                path: parsed.path(),
                query: &query,
            };
            let (status, _content_type, body) = self.serve_anonymous(&request, Utc::now());
            Ok(FetchResponse { status, body })
        }
        .boxed()
    }

    fn delete<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, ()> {
        async move { self.remove(bucket, key) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const BUCKET: &str = "eventhub-payment-proofs";

    fn store(policy: Policy) -> MemoryStore {
        let store = MemoryStore::new(
            crate::credentials::HmacKey::new("GOOG1TEST", "test-secret"),
            Url::parse("https://storage.googleapis.com").unwrap(),
        );
        store.create_bucket(BUCKET, "ASIA-SOUTH1", "STANDARD", policy);
        store
    }

    fn upload(key: &str, body: &'static str) -> ObjectUpload {
        ObjectUpload {
            key: key.to_string(),
            content: Bytes::from_static(body.as_bytes()),
            content_type: "text/plain".into(),
            cache_control: Some("private, max-age=60".into()),
        }
    }

    #[tokio::test]
    async fn anonymous_fetch_of_private_object_is_forbidden() {
        let store = store(Policy::private());
        store.upload(BUCKET, upload("receipts/a.txt", "paid")).await.unwrap();

        let url = store.public_url(BUCKET, "receipts/a.txt");
        assert_eq!(
            url,
            "https://storage.googleapis.com/eventhub-payment-proofs/receipts/a.txt"
        );
        let response = store.fetch(&url).await.unwrap();
        assert_eq!(response.status, 403);
        assert!(String::from_utf8_lossy(&response.body).contains("AccessDenied"));
    }

    #[tokio::test]
    async fn anonymous_fetch_of_public_object_succeeds() {
        let store = store(Policy::public_read());
        store.upload(BUCKET, upload("receipts/a.txt", "paid")).await.unwrap();

        let response = store.fetch(&store.public_url(BUCKET, "receipts/a.txt")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"paid");
    }

    #[tokio::test]
    async fn signed_url_reads_private_object() {
        let store = store(Policy::private());
        store.upload(BUCKET, upload("receipts/team a.txt", "paid")).await.unwrap();

        let grant = store
            .signed_url(BUCKET, "receipts/team a.txt", SignRequest::read(Duration::minutes(15)))
            .await
            .unwrap();
        assert_eq!(grant.expires_at - grant.issued_at, Duration::minutes(15));

        let response = store.fetch(&grant.url).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"paid");
    }

    #[tokio::test]
    async fn expired_signed_url_is_rejected() {
        let store = store(Policy::private());
        store.upload(BUCKET, upload("a.txt", "paid")).await.unwrap();

        let request = SignRequest {
            issued_at: Utc::now() - Duration::minutes(16),
            ..SignRequest::read(Duration::minutes(15))
        };
        let grant = store.signed_url(BUCKET, "a.txt", request).await.unwrap();
        let response = store.fetch(&grant.url).await.unwrap();
        assert_eq!(response.status, 400);
        assert!(String::from_utf8_lossy(&response.body).contains("ExpiredToken"));
    }

    #[tokio::test]
    async fn fetch_to_foreign_host_is_a_transport_error() {
        let store = store(Policy::private());
        let err = store.fetch("https://example.com/x/y").await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
    }

    #[tokio::test]
    async fn faults_shape_responses() {
        let store = store(Policy::private());
        store.set_faults(Faults {
            deny_access: true,
            ..Faults::default()
        });
        let err = store.bucket_exists(BUCKET).await.unwrap_err();
        assert_eq!(err.status(), Some(403));

        store.set_faults(Faults {
            network_down: true,
            ..Faults::default()
        });
        assert!(matches!(
            store.fetch(&store.public_url(BUCKET, "a.txt")).await,
            Err(StoreError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn missing_bucket_reports_false_then_not_found() {
        let store = store(Policy::private());
        assert!(!store.bucket_exists("someone-elses-bucket").await.unwrap());
        assert!(store.bucket_metadata("someone-elses-bucket").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_removes_object() {
        let store = store(Policy::private());
        store.upload(BUCKET, upload("a.txt", "paid")).await.unwrap();
        assert_eq!(store.object_count(BUCKET), 1);
        store.delete(BUCKET, "a.txt").await.unwrap();
        assert_eq!(store.object_count(BUCKET), 0);
        assert!(store.delete(BUCKET, "a.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn public_acl_serves_objects_until_uniform_access_is_enabled() {
        let store = store(Policy::private());
        store.set_acl(BUCKET, Policy::public_read()).unwrap();
        store.upload(BUCKET, upload("a.txt", "paid")).await.unwrap();
        let url = store.public_url(BUCKET, "a.txt");

        assert_eq!(store.fetch(&url).await.unwrap().status, 200);
        assert!(store.bucket_policy(BUCKET).await.unwrap().is_public_readable());

        store.set_uniform_access(BUCKET, true).unwrap();
        assert_eq!(store.fetch(&url).await.unwrap().status, 403);
        assert_eq!(store.acl(BUCKET).unwrap_err().status(), Some(400));
        assert!(!store.bucket_policy(BUCKET).await.unwrap().is_public_readable());
    }

    #[tokio::test]
    async fn unreadable_iam_policy_is_permission_denied() {
        let store = store(Policy::private());
        store.set_faults(Faults {
            policy_unreadable: true,
            ..Faults::default()
        });
        let err = store.bucket_policy(BUCKET).await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied { status: 403, .. }));
        // the ACL stays readable on its own
        assert_eq!(store.acl(BUCKET).unwrap(), Policy::private());
    }
}
