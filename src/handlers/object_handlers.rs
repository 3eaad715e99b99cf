//! HTTP handlers for the bucket, object, IAM and token endpoints of the
//! emulator. Authenticated requests carry either a bearer token from `/token`
//! or a GOOG4-HMAC-SHA256 signature; anonymous and signed-URL reads are
//! delegated to `MemoryStore`.

use crate::{
    credentials::Credentials,
    emulator::{EmulatorState, TOKEN_LIFETIME_SECS},
    errors::AppError,
    models::{bucket::Policy, object::ObjectUpload},
    services::{
        oauth::{self, JWT_BEARER_GRANT, TokenResponse},
        xml,
    },
    signing::{self, HEADER_CONTENT_SHA256, IncomingRequest, UNSIGNED_PAYLOAD},
};
use axum::{
    Form, Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Method, host, raw path and decoded query of a request.
struct RequestParts {
    method: String,
    host: String,
    path: String,
    query: Vec<(String, String)>,
}

impl RequestParts {
    fn new(method: &Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| uri.authority().map(|a| a.as_str()))
            .unwrap_or_default()
            .to_string();
        let query = uri
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        Self {
            method: method.as_str().to_string(),
            host,
            path: uri.path().to_string(),
            query,
        }
    }

    fn incoming(&self) -> IncomingRequest<'_> {
        IncomingRequest {
            method: &self.method,
            host: &self.host,
            path: &self.path,
            query: &self.query,
        }
    }

    fn has_param(&self, name: &str) -> bool {
        self.query.iter().any(|(k, _)| k == name)
    }
}

/// Require a live bearer token or a valid GOOG4-HMAC-SHA256 `Authorization` header.
fn authenticate(
    state: &EmulatorState,
    parts: &RequestParts,
    headers: &HeaderMap,
) -> Result<(), AppError> {
    let Some(authorization) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return Err(AppError::access_denied(
            "Anonymous caller does not have storage access to this resource.",
        ));
    };

    if let Some(token) = authorization.strip_prefix("Bearer ") {
        if state.token_valid(token.trim(), Utc::now()) {
            return Ok(());
        }
        debug!("rejected bearer token on {} {}", parts.method, parts.path);
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "AuthenticationRequired",
            "Invalid Credentials",
        ));
    }

    let Credentials::Hmac(key) = state.store.credentials() else {
        return Err(AppError::access_denied(
            "Only bearer tokens are accepted for service-account access.",
        ));
    };
    signing::verify_authorization(
        key,
        &parts.incoming(),
        |name| headers.get(name).and_then(|v| v.to_str().ok()),
        Utc::now(),
    )
    .map_err(|err| {
        debug!("rejected {} {}: {}", parts.method, parts.path, err);
        AppError::from(err)
    })
}

/// `Last-Modified` form of a timestamp (RFC 7231 IMF-fixdate).
fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn xml_response(body: String) -> Response {
    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    response
}

/// HEAD `/{bucket}`: 200 when the bucket exists, 404 otherwise.
pub async fn head_bucket(
    State(state): State<EmulatorState>,
    Path(bucket): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let parts = RequestParts::new(&method, &uri, &headers);
    authenticate(&state, &parts, &headers)?;

    let status = if state.store.head_bucket(&bucket)? {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok(status.into_response())
}

/// GET `/{bucket}?location|storageClass|acl`: bucket sub-resources.
pub async fn get_bucket(
    State(state): State<EmulatorState>,
    Path(bucket): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let parts = RequestParts::new(&method, &uri, &headers);
    authenticate(&state, &parts, &headers)?;

    if parts.has_param("location") {
        let meta = state.store.metadata(&bucket)?;
        Ok(xml_response(xml::location_xml(&meta.location)))
    } else if parts.has_param("storageClass") {
        let meta = state.store.metadata(&bucket)?;
        Ok(xml_response(xml::storage_class_xml(&meta.storage_class)))
    } else if parts.has_param("acl") {
        let acl = state.store.acl(&bucket)?;
        Ok(xml_response(xml::policy_to_acl_xml(&acl)))
    } else {
        Err(AppError::new(
            StatusCode::NOT_IMPLEMENTED,
            "NotImplemented",
            "Only the location, storageClass and acl sub-resources are emulated.",
        ))
    }
}

/// PUT `/{bucket}/{*key}`: store an object.
pub async fn put_object(
    State(state): State<EmulatorState>,
    Path((bucket, key)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let parts = RequestParts::new(&method, &uri, &headers);
    authenticate(&state, &parts, &headers)?;

    let header_str = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    if let Some(expected) = header_str(HeaderName::from_static("content-md5")) {
        let actual = general_purpose::STANDARD.encode(md5::compute(&body).0);
        if expected != actual {
            return Err(AppError::bad_request(
                "BadDigest",
                "The Content-MD5 you specified did not match what we received.",
            ));
        }
    }
    if let Some(expected) = header_str(HeaderName::from_static(HEADER_CONTENT_SHA256)) {
        if expected != UNSIGNED_PAYLOAD && expected != signing::payload_sha256(&body) {
            return Err(AppError::bad_request(
                "BadDigest",
                "The x-goog-content-sha256 you specified did not match what we received.",
            ));
        }
    }

    let upload = ObjectUpload {
        key,
        content: body,
        content_type: header_str(header::CONTENT_TYPE)
            .unwrap_or_else(|| "application/octet-stream".into()),
        cache_control: header_str(header::CACHE_CONTROL),
    };
    let stored = state.store.put(&bucket, upload)?;
    debug!("stored {}/{} ({} bytes)", bucket, stored.key, stored.size_bytes);

    let mut response = Response::new(Body::empty());
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", stored.etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// GET `/{bucket}/{*key}`: authenticated, signed-URL or anonymous read.
pub async fn get_object(
    State(state): State<EmulatorState>,
    Path((bucket, key)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let parts = RequestParts::new(&method, &uri, &headers);

    if !headers.contains_key(header::AUTHORIZATION) {
        let (status, content_type, body) =
            state.store.serve_anonymous(&parts.incoming(), Utc::now());
        let mut response = Response::new(Body::from(body));
        *response.status_mut() =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        return Ok(response);
    }

    authenticate(&state, &parts, &headers)?;
    let blob = state.store.get(&bucket, &key)?;

    let md5_b64 = general_purpose::STANDARD.encode(md5::compute(&blob.content).0);
    let mut response = Response::new(Body::from(blob.content));
    let out = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&blob.content_type) {
        out.insert(header::CONTENT_TYPE, value);
    }
    if let Some(value) = blob
        .cache_control
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        out.insert(header::CACHE_CONTROL, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", blob.etag)) {
        out.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("md5={md5_b64}")) {
        out.insert(HeaderName::from_static("x-goog-hash"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&http_date(blob.updated)) {
        out.insert(header::LAST_MODIFIED, value);
    }
    Ok(response)
}

/// DELETE `/{bucket}/{*key}`
pub async fn delete_object(
    State(state): State<EmulatorState>,
    Path((bucket, key)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let parts = RequestParts::new(&method, &uri, &headers);
    authenticate(&state, &parts, &headers)?;
    state.store.remove(&bucket, &key)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// JSON API `storage#policy` resource.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IamPolicyDocument {
    kind: &'static str,
    resource_id: String,
    version: u8,
    etag: String,
    #[serde(flatten)]
    policy: Policy,
}

/// GET `/storage/v1/b/{bucket}/iam`: the bucket IAM policy.
pub async fn get_iam_policy(
    State(state): State<EmulatorState>,
    Path(bucket): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let parts = RequestParts::new(&method, &uri, &headers);
    authenticate(&state, &parts, &headers)?;

    let policy = state.store.iam_policy(&bucket)?;
    let etag = serde_json::to_vec(&policy)
        .map(|raw| general_purpose::STANDARD.encode(md5::compute(raw).0))
        .unwrap_or_default();
    Ok(Json(IamPolicyDocument {
        kind: "storage#policy",
        resource_id: format!("projects/_/buckets/{bucket}"),
        version: 1,
        etag,
        policy,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    grant_type: String,
    assertion: String,
}

fn oauth_error(error: &str, description: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "error": error,
            "error_description": description.into(),
        })),
    )
        .into_response()
}

/// POST `/token`: exchange a service-account JWT assertion for an access token.
pub async fn issue_token(
    State(state): State<EmulatorState>,
    Form(request): Form<TokenRequest>,
) -> Response {
    if request.grant_type != JWT_BEARER_GRANT {
        return oauth_error("unsupported_grant_type", "Invalid grant_type.");
    }
    let Credentials::ServiceAccount(key) = state.store.credentials() else {
        return oauth_error("invalid_client", "The emulator is not holding a service-account key.");
    };

    let now = Utc::now();
    match oauth::verify_assertion(key, &request.assertion, now) {
        Ok(claims) => {
            debug!("issued access token to {}", claims.iss);
            Json(TokenResponse {
                access_token: state.issue_token(now),
                expires_in: TOKEN_LIFETIME_SECS,
                token_type: "Bearer".into(),
            })
            .into_response()
        }
        Err(err) => oauth_error("invalid_grant", err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn last_modified_uses_imf_fixdate() {
        let at = Utc.with_ymd_and_hms(2023, 11, 4, 9, 5, 7).unwrap();
        assert_eq!(http_date(at), "Sat, 04 Nov 2023 09:05:07 GMT");
    }
}
