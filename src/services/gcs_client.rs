//! Live Cloud Storage client.
//!
//! Objects and bucket metadata go through the XML API; the bucket IAM policy
//! comes from the JSON API. With a service-account key every authenticated
//! request carries an OAuth bearer token; with an HMAC key it carries a
//! GOOG4-HMAC-SHA256 `Authorization` header instead. Anonymous fetches go out
//! on the same connection pool with no credentials attached.

use crate::{
    credentials::Credentials,
    models::{
        bucket::{BucketMetadata, Policy},
        object::{FetchResponse, ObjectUpload, SignRequest, SignedUrl, StoredObject},
    },
    services::{
        oauth::TokenSource,
        store::{ObjectStore, StoreError, StoreFuture, StoreResult},
        xml,
    },
    signing::{self, Signer, UNSIGNED_PAYLOAD},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use reqwest::{Method, StatusCode, header};
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone)]
pub struct GcsClient {
    http: reqwest::Client,
    signer: Signer,
    tokens: Option<TokenSource>,
    endpoint: Url,
}

impl GcsClient {
    /// Build a client for `endpoint` (normally `https://storage.googleapis.com`).
    pub fn new(
        credentials: impl Into<Credentials>,
        endpoint: &str,
        timeout: Duration,
    ) -> StoreResult<Self> {
        let endpoint =
            Url::parse(endpoint).map_err(|_| StoreError::InvalidEndpoint(endpoint.to_string()))?;
        if endpoint.host_str().is_none() || !matches!(endpoint.scheme(), "http" | "https") {
            return Err(StoreError::InvalidEndpoint(endpoint.to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StoreError::Transport(err.to_string()))?;

        let credentials = credentials.into();
        let tokens = match &credentials {
            Credentials::ServiceAccount(key) => Some(TokenSource::new(http.clone(), key.clone())),
            Credentials::Hmac(_) => None,
        };

        Ok(Self {
            http,
            signer: Signer::new(credentials),
            tokens,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, bucket: &str, key: Option<&str>, query: Option<&str>) -> StoreResult<Url> {
        let mut raw = format!(
            "{}{}",
            self.endpoint.origin().ascii_serialization(),
            signing::object_path(&self.endpoint, bucket, key)
        );
        if let Some(query) = query {
            raw.push('?');
            raw.push_str(query);
        }
        Url::parse(&raw).map_err(|_| StoreError::InvalidEndpoint(raw))
    }

    /// Send an authenticated request. With an HMAC key the `extra` headers are
    /// covered by the signature.
    async fn send(
        &self,
        method: Method,
        url: Url,
        extra: Vec<(String, String)>,
        body: Option<Bytes>,
    ) -> StoreResult<reqwest::Response> {
        let auth = match &self.tokens {
            Some(tokens) => vec![(
                "authorization".to_string(),
                format!("Bearer {}", tokens.token().await?),
            )],
            None => {
                let payload_hash = body
                    .as_deref()
                    .map(signing::payload_sha256)
                    .unwrap_or_else(|| UNSIGNED_PAYLOAD.to_string());
                self.signer
                    .authorize(method.as_str(), &url, &extra, &payload_hash, Utc::now())?
            }
        };

        debug!("{} {}", method, url);
        let mut request = self.http.request(method, url);
        for (name, value) in extra.iter().chain(auth.iter()) {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        request
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))
    }

    /// Map non-success responses onto `StoreError`.
    async fn check(
        response: reqwest::Response,
        bucket: &str,
        key: Option<&str>,
    ) -> StoreResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let code = xml::element_text(&body, "Code").unwrap_or_default();
        let message = xml::element_text(&body, "Message")
            .or_else(|| json_error_message(&body))
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_default();

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::PermissionDenied {
                status: status.as_u16(),
                message,
            },
            StatusCode::NOT_FOUND => match key {
                Some(key) if code != "NoSuchBucket" => StoreError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                },
                _ => StoreError::BucketNotFound(bucket.to_string()),
            },
            _ => StoreError::Unexpected {
                status: status.as_u16(),
                message: if code.is_empty() {
                    message
                } else {
                    format!("{code}: {message}")
                },
            },
        })
    }

    /// GET a bucket sub-resource (`?location`, `?acl`, ...) and return its body.
    async fn bucket_document(&self, bucket: &str, resource: &str) -> StoreResult<String> {
        let url = self.url(bucket, None, Some(resource))?;
        let response = self.send(Method::GET, url, Vec::new(), None).await?;
        let response = Self::check(response, bucket, None).await?;
        response
            .text()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))
    }

    /// GET the bucket's IAM policy from the JSON API.
    async fn iam_policy(&self, bucket: &str) -> StoreResult<Policy> {
        let raw = format!(
            "{}{}/storage/v1/b/{}/iam",
            self.endpoint.origin().ascii_serialization(),
            self.endpoint.path().trim_end_matches('/'),
            signing::uri_encode(bucket, true)
        );
        let url = Url::parse(&raw).map_err(|_| StoreError::InvalidEndpoint(raw))?;
        let response = self.send(Method::GET, url, Vec::new(), None).await?;
        let response = Self::check(response, bucket, None).await?;
        response
            .json::<Policy>()
            .await
            .map_err(|err| StoreError::Unexpected {
                status: 200,
                message: format!("unreadable IAM policy: {err}"),
            })
    }
}

/// `error.message` of a JSON API error body.
fn json_error_message(body: &str) -> Option<String> {
    let document: serde_json::Value = serde_json::from_str(body).ok()?;
    document["error"]["message"].as_str().map(str::to_string)
}

fn missing_element(element: &str) -> StoreError {
    StoreError::Unexpected {
        status: 200,
        message: format!("response has no <{element}> element"),
    }
}

impl ObjectStore for GcsClient {
    fn bucket_exists<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, bool> {
        async move {
            let url = self.url(bucket, None, None)?;
            let response = self.send(Method::HEAD, url, Vec::new(), None).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(false);
            }
            Self::check(response, bucket, None).await.map(|_| true)
        }
        .boxed()
    }

    fn bucket_metadata<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, BucketMetadata> {
        async move {
            let location = self.bucket_document(bucket, "location").await?;
            let storage_class = self.bucket_document(bucket, "storageClass").await?;
            Ok(BucketMetadata {
                name: bucket.to_string(),
                location: xml::element_text(&location, "LocationConstraint")
                    .ok_or_else(|| missing_element("LocationConstraint"))?,
                storage_class: xml::element_text(&storage_class, "StorageClass")
                    .ok_or_else(|| missing_element("StorageClass"))?,
            })
        }
        .boxed()
    }

    fn bucket_policy<'a>(&'a self, bucket: &'a str) -> StoreFuture<'a, Policy> {
        async move {
            let policy = self.iam_policy(bucket).await?;
            // Buckets with uniform bucket-level access refuse ACL reads.
            match self.bucket_document(bucket, "acl").await {
                Ok(acl) => Ok(policy.merged_with(&xml::policy_from_acl_xml(&acl))),
                Err(err) => {
                    debug!("bucket ACL of {} not merged: {}", bucket, err);
                    Ok(policy)
                }
            }
        }
        .boxed()
    }

    fn upload<'a>(&'a self, bucket: &'a str, object: ObjectUpload) -> StoreFuture<'a, StoredObject> {
        async move {
            let url = self.url(bucket, Some(&object.key), None)?;
            let digest = md5::compute(&object.content);
            let mut extra = vec![
                ("content-type".to_string(), object.content_type.clone()),
                (
                    "content-md5".to_string(),
                    general_purpose::STANDARD.encode(digest.0),
                ),
            ];
            if let Some(cache_control) = &object.cache_control {
                extra.push(("cache-control".to_string(), cache_control.clone()));
            }

            let size_bytes = object.content.len() as u64;
            let response = self
                .send(Method::PUT, url, extra, Some(object.content.clone()))
                .await?;
            let response = Self::check(response, bucket, Some(&object.key)).await?;

            let etag = response
                .headers()
                .get(header::ETAG)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim_matches('"').to_string())
                .unwrap_or_else(|| format!("{digest:x}"));

            Ok(StoredObject {
                key: object.key,
                size_bytes,
                etag,
            })
        }
        .boxed()
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
            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|err| StoreError::Transport(err.to_string()))?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|err| StoreError::Transport(err.to_string()))?;
            Ok(FetchResponse { status, body })
        }
        .boxed()
    }

    fn delete<'a>(&'a self, bucket: &'a str, key: &'a str) -> StoreFuture<'a, ()> {
        async move {
            let url = self.url(bucket, Some(key), None)?;
            let response = self.send(Method::DELETE, url, Vec::new(), None).await?;
            Self::check(response, bucket, Some(key)).await.map(|_| ())
        }
        .boxed()
    }
}
