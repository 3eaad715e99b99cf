//! The individual verification checks.
//!
//! Each check is a named unit run against an `ObjectStore`. Checks share a
//! `ProbeContext` so later steps can use what earlier ones produced (the probe
//! object, the signed URL).

use crate::{
    models::{
        bucket::Policy,
        object::{ObjectUpload, SignRequest, SignedUrl, StoredObject},
    },
    services::store::{ObjectStore, StoreError},
    signing::{PARAM_EXPIRES, PARAM_SIGNATURE},
    verifier::report::{CheckOutcome, FailureKind},
};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::{FutureExt, future::BoxFuture};
use url::Url;

/// Prefix under which probe objects are written.
pub const PROBE_PREFIX: &str = "test-uploads";
pub const PROBE_CONTENT_TYPE: &str = "text/plain";
pub const PROBE_CACHE_CONTROL: &str = "private, max-age=60";

/// Validity window of the signed read grant.
pub fn default_signed_url_ttl() -> Duration {
    Duration::minutes(15)
}

/// `test-uploads/test-<epoch-millis>.txt`
pub fn probe_key(at: DateTime<Utc>) -> String {
    format!("{PROBE_PREFIX}/test-{}.txt", at.timestamp_millis())
}

/// State carried from one check to the next.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub bucket: String,
    pub started_at: DateTime<Utc>,
    pub signed_url_ttl: Duration,
    pub probe: Option<ObjectUpload>,
    pub uploaded: Option<StoredObject>,
    pub signed_url: Option<SignedUrl>,
}

impl ProbeContext {
    pub fn new(bucket: impl Into<String>, started_at: DateTime<Utc>, signed_url_ttl: Duration) -> Self {
        Self {
            bucket: bucket.into(),
            started_at,
            signed_url_ttl,
            probe: None,
            uploaded: None,
            signed_url: None,
        }
    }

    fn probe_key(&self) -> String {
        self.probe
            .as_ref()
            .map(|probe| probe.key.clone())
            .unwrap_or_else(|| probe_key(self.started_at))
    }
}

/// A named verification step.
pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;

    fn run<'a>(
        &'a self,
        store: &'a dyn ObjectStore,
        ctx: &'a mut ProbeContext,
    ) -> BoxFuture<'a, CheckOutcome>;
}

/// Failure category for a store error.
pub fn classify(err: &StoreError) -> FailureKind {
    match err {
        StoreError::BucketNotFound(_) | StoreError::ObjectNotFound { .. } => FailureKind::Deployment,
        StoreError::PermissionDenied { .. } => FailureKind::Authorization,
        StoreError::Transport(_) => FailureKind::Transient,
        StoreError::Credentials(_) | StoreError::InvalidEndpoint(_) | StoreError::Signing(_) => {
            FailureKind::Configuration
        }
        StoreError::Unexpected { .. } => FailureKind::Internal,
    }
}

pub struct BucketExists;

impl Check for BucketExists {
    fn name(&self) -> &'static str {
        "bucket-exists"
    }

    fn run<'a>(
        &'a self,
        store: &'a dyn ObjectStore,
        ctx: &'a mut ProbeContext,
    ) -> BoxFuture<'a, CheckOutcome> {
        async move {
            match store.bucket_exists(&ctx.bucket).await {
                Ok(true) => CheckOutcome::pass(format!("bucket `{}` exists", ctx.bucket)),
                Ok(false) => CheckOutcome::fail(
                    FailureKind::Deployment,
                    format!("bucket `{}` does not exist", ctx.bucket),
                ),
                Err(err) => CheckOutcome::fail(classify(&err), err.to_string()),
            }
        }
        .boxed()
    }
}

pub struct BucketMetadataCheck;

impl Check for BucketMetadataCheck {
    fn name(&self) -> &'static str {
        "bucket-metadata"
    }

    fn run<'a>(
        &'a self,
        store: &'a dyn ObjectStore,
        ctx: &'a mut ProbeContext,
    ) -> BoxFuture<'a, CheckOutcome> {
        async move {
            match store.bucket_metadata(&ctx.bucket).await {
                Ok(meta) => CheckOutcome::pass(format!(
                    "location {}, storage class {}",
                    meta.location, meta.storage_class
                )),
                Err(err) => CheckOutcome::fail(classify(&err), err.to_string()),
            }
        }
        .boxed()
    }
}

/// Flags public read grants. Never aborts the run.
pub struct PrivacyAudit;

impl PrivacyAudit {
    fn judge(policy: &Policy) -> CheckOutcome {
        let grants = policy.public_read_grants();
        if grants.is_empty() {
            return CheckOutcome::pass(format!(
                "no public principals among {} binding(s)",
                policy.bindings.len()
            ));
        }
        let listed: Vec<String> = grants
            .iter()
            .map(|(member, role)| format!("{member} -> {role}"))
            .collect();
        CheckOutcome::warn(
            FailureKind::Security,
            format!("bucket grants public read: {}", listed.join(", ")),
        )
    }
}

impl Check for PrivacyAudit {
    fn name(&self) -> &'static str {
        "privacy-audit"
    }

    fn run<'a>(
        &'a self,
        store: &'a dyn ObjectStore,
        ctx: &'a mut ProbeContext,
    ) -> BoxFuture<'a, CheckOutcome> {
        async move {
            match store.bucket_policy(&ctx.bucket).await {
                Ok(policy) => Self::judge(&policy),
                Err(err) => CheckOutcome::warn(
                    classify(&err),
                    format!("bucket policy could not be read: {err}"),
                ),
            }
        }
        .boxed()
    }
}

pub struct UploadProbe;

impl UploadProbe {
    fn probe(ctx: &ProbeContext) -> ObjectUpload {
        let content = format!(
            "EventHub storage verification probe\ncreated: {}\n",
            ctx.started_at.to_rfc3339()
        );
        ObjectUpload {
            key: probe_key(ctx.started_at),
            content: Bytes::from(content),
            content_type: PROBE_CONTENT_TYPE.to_string(),
            cache_control: Some(PROBE_CACHE_CONTROL.to_string()),
        }
    }
}

impl Check for UploadProbe {
    fn name(&self) -> &'static str {
        "upload-probe"
    }

    fn run<'a>(
        &'a self,
        store: &'a dyn ObjectStore,
        ctx: &'a mut ProbeContext,
    ) -> BoxFuture<'a, CheckOutcome> {
        async move {
            let probe = Self::probe(ctx);
            ctx.probe = Some(probe.clone());
            match store.upload(&ctx.bucket, probe).await {
                Ok(stored) => {
                    let outcome = CheckOutcome::pass(format!(
                        "uploaded {} ({} bytes, etag {})",
                        stored.key, stored.size_bytes, stored.etag
                    ));
                    ctx.uploaded = Some(stored);
                    outcome
                }
                Err(err) => CheckOutcome::fail(classify(&err), format!("upload failed: {err}")),
            }
        }
        .boxed()
    }
}

/// An unauthenticated fetch must not succeed.
///
/// A transport failure also passes: no response means no data leaked. The
/// detail says so, because it proves nothing about access control.
pub struct DirectAccess;

impl Check for DirectAccess {
    fn name(&self) -> &'static str {
        "direct-access"
    }

    fn run<'a>(
        &'a self,
        store: &'a dyn ObjectStore,
        ctx: &'a mut ProbeContext,
    ) -> BoxFuture<'a, CheckOutcome> {
        async move {
            let url = store.public_url(&ctx.bucket, &ctx.probe_key());
            match store.fetch(&url).await {
                Ok(response) if response.is_success() => CheckOutcome::warn(
                    FailureKind::Security,
                    format!("object is publicly readable at {url} (HTTP {})", response.status),
                ),
                Ok(response) => CheckOutcome::pass(format!(
                    "anonymous access rejected (HTTP {})",
                    response.status
                )),
                Err(err) => CheckOutcome::pass(format!(
                    "anonymous request failed without a response ({err}); \
                     network failure, not proof of access control"
                )),
            }
        }
        .boxed()
    }
}

pub struct SignedUrlIssue;

impl SignedUrlIssue {
    fn validate(grant: &SignedUrl, ttl: Duration) -> Result<(), String> {
        let url = Url::parse(&grant.url).map_err(|err| format!("signed URL is not a URL: {err}"))?;
        let param = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };
        let signature = param(PARAM_SIGNATURE).ok_or("signed URL carries no signature")?;
        if signature.is_empty() || hex::decode(&signature).is_err() {
            return Err("signed URL signature is not hex".into());
        }
        let expires = param(PARAM_EXPIRES).ok_or("signed URL carries no expiry")?;
        if expires != ttl.num_seconds().to_string() {
            return Err(format!(
                "signed URL expires after {expires}s, expected {}s",
                ttl.num_seconds()
            ));
        }
        if grant.expires_at - grant.issued_at != ttl {
            return Err("grant expiry does not match the requested window".into());
        }
        Ok(())
    }
}

impl Check for SignedUrlIssue {
    fn name(&self) -> &'static str {
        "signed-url-issue"
    }

    fn run<'a>(
        &'a self,
        store: &'a dyn ObjectStore,
        ctx: &'a mut ProbeContext,
    ) -> BoxFuture<'a, CheckOutcome> {
        async move {
            let key = ctx.probe_key();
            let request = SignRequest::read(ctx.signed_url_ttl);
            match store.signed_url(&ctx.bucket, &key, request).await {
                Ok(grant) => match Self::validate(&grant, ctx.signed_url_ttl) {
                    Ok(()) => {
                        let outcome = CheckOutcome::pass(format!(
                            "v4 read grant valid until {}",
                            grant.expires_at.to_rfc3339()
                        ));
                        ctx.signed_url = Some(grant);
                        outcome
                    }
                    Err(reason) => CheckOutcome::warn(FailureKind::Security, reason),
                },
                Err(err) => CheckOutcome::warn(
                    FailureKind::Security,
                    format!("signed URL could not be issued: {err}"),
                ),
            }
        }
        .boxed()
    }
}

pub struct SignedUrlRedeem;

impl Check for SignedUrlRedeem {
    fn name(&self) -> &'static str {
        "signed-url-redeem"
    }

    fn run<'a>(
        &'a self,
        store: &'a dyn ObjectStore,
        ctx: &'a mut ProbeContext,
    ) -> BoxFuture<'a, CheckOutcome> {
        async move {
            let Some(grant) = ctx.signed_url.as_ref() else {
                return CheckOutcome::warn(
                    FailureKind::Security,
                    "skipped: no signed URL was issued",
                );
            };
            let expected = ctx
                .probe
                .as_ref()
                .map(|probe| probe.content.clone())
                .unwrap_or_default();

            match store.fetch(&grant.url).await {
                Ok(response) if !response.is_success() => CheckOutcome::warn(
                    FailureKind::Security,
                    format!("signed URL rejected with HTTP {}", response.status),
                ),
                Ok(response) if response.body != expected => CheckOutcome::warn(
                    FailureKind::Security,
                    format!(
                        "signed URL returned {} bytes that differ from the {} uploaded",
                        response.body.len(),
                        expected.len()
                    ),
                ),
                Ok(response) => CheckOutcome::pass(format!(
                    "HTTP {}, {} bytes identical to upload",
                    response.status,
                    response.body.len()
                )),
                Err(err) => CheckOutcome::warn(
                    FailureKind::Transient,
                    format!("signed URL fetch failed: {err}"),
                ),
            }
        }
        .boxed()
    }
}

/// Deletes the probe object. Runs whenever the upload succeeded.
pub struct Cleanup;

impl Check for Cleanup {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn run<'a>(
        &'a self,
        store: &'a dyn ObjectStore,
        ctx: &'a mut ProbeContext,
    ) -> BoxFuture<'a, CheckOutcome> {
        async move {
            let Some(uploaded) = ctx.uploaded.as_ref() else {
                return CheckOutcome::pass("nothing to clean up");
            };
            match store.delete(&ctx.bucket, &uploaded.key).await {
                Ok(()) => CheckOutcome::pass(format!("deleted {}", uploaded.key)),
                Err(err) => CheckOutcome::warn(
                    classify(&err),
                    format!("probe object {} left behind: {err}", uploaded.key),
                ),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn probe_key_uses_epoch_millis() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        assert_eq!(probe_key(at), "test-uploads/test-1700000000000.txt");
    }

    #[test]
    fn classify_maps_store_errors() {
        assert_eq!(
            classify(&StoreError::BucketNotFound("b".into())),
            FailureKind::Deployment
        );
        assert_eq!(
            classify(&StoreError::PermissionDenied {
                status: 403,
                message: String::new()
            }),
            FailureKind::Authorization
        );
        assert_eq!(
            classify(&StoreError::Transport("reset".into())),
            FailureKind::Transient
        );
    }

    #[test]
    fn signed_url_without_signature_is_rejected() {
        let now = Utc::now();
        let grant = SignedUrl {
            url: "https://storage.googleapis.com/b/k?X-Goog-Expires=900".into(),
            action: crate::models::object::SignedAction::Read,
            issued_at: now,
            expires_at: now + default_signed_url_ttl(),
        };
        assert_eq!(
            SignedUrlIssue::validate(&grant, default_signed_url_ttl()),
            Err("signed URL carries no signature".to_string())
        );
    }
}
