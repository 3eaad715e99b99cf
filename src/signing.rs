//! V4 request signing.
//!
//! Service-account keys sign URLs with GOOG4-RSA-SHA256 (RSASSA-PKCS1-v1_5
//! over the string-to-sign). HMAC keys use GOOG4-HMAC-SHA256, both for
//! query-string signed URLs and for the `Authorization` header of API calls.
//! Verification lives here too so the in-memory store and the local emulator
//! enforce exactly what the signer produces.

use crate::credentials::{Credentials, HmacKey, ServiceAccountKey};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::Algorithm;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

pub const HMAC_ALGORITHM: &str = "GOOG4-HMAC-SHA256";
pub const RSA_ALGORITHM: &str = "GOOG4-RSA-SHA256";
pub const REGION: &str = "auto";
pub const SERVICE: &str = "storage";
pub const REQUEST_TYPE: &str = "goog4_request";
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Longest validity Cloud Storage accepts for a signed URL (7 days).
pub const MAX_EXPIRES_SECS: i64 = 604_800;

/// Allowed distance between a header-signed request's date and the server clock.
pub const MAX_CLOCK_SKEW_SECS: i64 = 900;

pub const HEADER_DATE: &str = "x-goog-date";
pub const HEADER_CONTENT_SHA256: &str = "x-goog-content-sha256";

pub const PARAM_ALGORITHM: &str = "X-Goog-Algorithm";
pub const PARAM_CREDENTIAL: &str = "X-Goog-Credential";
pub const PARAM_DATE: &str = "X-Goog-Date";
pub const PARAM_EXPIRES: &str = "X-Goog-Expires";
pub const PARAM_SIGNED_HEADERS: &str = "X-Goog-SignedHeaders";
pub const PARAM_SIGNATURE: &str = "X-Goog-Signature";

const DATE_FORMAT: &str = "%Y%m%d";
const DATETIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// RFC 3986 unreserved characters pass through; everything else is escaped.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Object names keep their `/` separators.
const UNRESERVED_PATH: &AsciiSet = &UNRESERVED.remove(b'/');

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("expiry must be between 1 and {MAX_EXPIRES_SECS} seconds, got {0}")]
    InvalidExpiry(i64),
    #[error("url `{0}` has no host")]
    MissingHost(String),
    #[error("missing signing parameter `{0}`")]
    MissingParameter(&'static str),
    #[error("malformed signing parameter `{0}`")]
    MalformedParameter(&'static str),
    #[error("unsupported signing algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    #[error("unknown signer `{0}`")]
    UnknownAccessId(String),
    #[error("header authentication needs an HMAC key")]
    HeaderAuthRequiresHmac,
    #[error("RSA signing failed: {0}")]
    Rsa(String),
    #[error("request date is more than {MAX_CLOCK_SKEW_SECS} seconds from server time")]
    ClockSkew,
    #[error("signed grant expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("signature does not match")]
    SignatureMismatch,
}

/// The pieces of a request that the signature covers.
#[derive(Debug, Clone)]
pub struct CanonicalRequest<'a> {
    pub method: &'a str,
    /// Percent-encoded absolute path, as sent on the wire.
    pub path: &'a str,
    /// Decoded query parameters, excluding the signature itself.
    pub query: Vec<(String, String)>,
    /// Signed headers; names are lowercased when rendered.
    pub headers: Vec<(String, String)>,
    pub payload_hash: &'a str,
}

impl CanonicalRequest<'_> {
    fn canonical_query(&self) -> String {
        let mut pairs: Vec<(String, String)> = self
            .query
            .iter()
            .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
            .collect();
        pairs.sort();
        pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn sorted_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), normalize_header_value(value)))
            .collect();
        headers.sort();
        headers
    }

    pub fn signed_headers(&self) -> String {
        self.sorted_headers()
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn render(&self) -> String {
        let headers: String = self
            .sorted_headers()
            .into_iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            self.path,
            self.canonical_query(),
            headers,
            self.signed_headers(),
            self.payload_hash
        )
    }
}

/// Signs requests and URLs with one key.
#[derive(Debug, Clone)]
pub struct Signer {
    credentials: Credentials,
}

impl Signer {
    pub fn new(credentials: impl Into<Credentials>) -> Self {
        Self {
            credentials: credentials.into(),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Build a query-string signed URL for `method` on `bucket/key`.
    pub fn sign_url(
        &self,
        endpoint: &Url,
        method: &str,
        bucket: &str,
        key: &str,
        issued_at: DateTime<Utc>,
        expires_in: Duration,
    ) -> Result<String, SigningError> {
        let expires = expires_in.num_seconds();
        if !(1..=MAX_EXPIRES_SECS).contains(&expires) {
            return Err(SigningError::InvalidExpiry(expires));
        }

        let host = host_header(endpoint)?;
        let path = object_path(endpoint, bucket, Some(key));
        let datetime = issued_at.format(DATETIME_FORMAT).to_string();
        let scope = credential_scope(issued_at);

        let algorithm = algorithm(&self.credentials);

        let query = vec![
            (PARAM_ALGORITHM.to_string(), algorithm.to_string()),
            (
                PARAM_CREDENTIAL.to_string(),
                format!("{}/{}", self.credentials.signer_id(), scope),
            ),
            (PARAM_DATE.to_string(), datetime.clone()),
            (PARAM_EXPIRES.to_string(), expires.to_string()),
            (PARAM_SIGNED_HEADERS.to_string(), "host".to_string()),
        ];
        let request = CanonicalRequest {
            method,
            path: &path,
            query,
            headers: vec![("host".to_string(), host)],
            payload_hash: UNSIGNED_PAYLOAD,
        };
        let string_to_sign = string_to_sign(algorithm, &datetime, &scope, &request);
        let signature = match &self.credentials {
            Credentials::Hmac(key) => compute_signature(&key.secret, issued_at, &string_to_sign),
            Credentials::ServiceAccount(key) => hex::encode(rsa_signature(key, &string_to_sign)?),
        };

        Ok(format!(
            "{}{}?{}&{}={}",
            origin(endpoint),
            path,
            request.canonical_query(),
            PARAM_SIGNATURE,
            signature
        ))
    }

    /// Headers that authenticate a request to `url`.
    ///
    /// `extra` are additional headers the caller sends and wants covered by the
    /// signature (for example `content-type` or `content-md5`). Only HMAC keys
    /// sign headers; service accounts authenticate API calls with a bearer token.
    pub fn authorize(
        &self,
        method: &str,
        url: &Url,
        extra: &[(String, String)],
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>, SigningError> {
        let Credentials::Hmac(key) = &self.credentials else {
            return Err(SigningError::HeaderAuthRequiresHmac);
        };
        let datetime = now.format(DATETIME_FORMAT).to_string();
        let scope = credential_scope(now);

        let mut headers = vec![
            ("host".to_string(), host_header(url)?),
            (HEADER_DATE.to_string(), datetime.clone()),
            (HEADER_CONTENT_SHA256.to_string(), payload_hash.to_string()),
        ];
        headers.extend(extra.iter().cloned());

        let request = CanonicalRequest {
            method,
            path: url.path(),
            query: url.query_pairs().into_owned().collect(),
            headers,
            payload_hash,
        };
        let string_to_sign = string_to_sign(HMAC_ALGORITHM, &datetime, &scope, &request);
        let signature = compute_signature(&key.secret, now, &string_to_sign);
        let authorization = format!(
            "{HMAC_ALGORITHM} Credential={}/{}, SignedHeaders={}, Signature={}",
            key.access_id,
            scope,
            request.signed_headers(),
            signature
        );

        Ok(vec![
            (HEADER_DATE.to_string(), datetime),
            (HEADER_CONTENT_SHA256.to_string(), payload_hash.to_string()),
            ("authorization".to_string(), authorization),
        ])
    }
}

/// A request as received by a server, for verification.
#[derive(Debug, Clone)]
pub struct IncomingRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    /// Raw percent-encoded path.
    pub path: &'a str,
    /// Decoded query parameters, including any signature parameters.
    pub query: &'a [(String, String)],
}

/// Verify a query-string signed URL request.
pub fn verify_signed_url(
    credentials: &Credentials,
    request: &IncomingRequest<'_>,
    now: DateTime<Utc>,
) -> Result<(), SigningError> {
    let param = |name: &'static str| {
        request
            .query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .ok_or(SigningError::MissingParameter(name))
    };

    let algorithm = param(PARAM_ALGORITHM)?;
    if algorithm != self::algorithm(credentials) {
        return Err(SigningError::UnsupportedAlgorithm(algorithm.to_string()));
    }
    let datetime = param(PARAM_DATE)?;
    let issued_at = parse_datetime(datetime).ok_or(SigningError::MalformedParameter(PARAM_DATE))?;
    let scope = check_credential(credentials.signer_id(), param(PARAM_CREDENTIAL)?, issued_at)?;

    let expires: i64 = param(PARAM_EXPIRES)?
        .parse()
        .map_err(|_| SigningError::MalformedParameter(PARAM_EXPIRES))?;
    if !(1..=MAX_EXPIRES_SECS).contains(&expires) {
        return Err(SigningError::InvalidExpiry(expires));
    }
    let expires_at = issued_at + Duration::seconds(expires);
    if now > expires_at {
        return Err(SigningError::Expired(expires_at));
    }

    let signed_headers = param(PARAM_SIGNED_HEADERS)?;
    if signed_headers != "host" {
        return Err(SigningError::MalformedParameter(PARAM_SIGNED_HEADERS));
    }
    let provided = hex::decode(param(PARAM_SIGNATURE)?)
        .map_err(|_| SigningError::MalformedParameter(PARAM_SIGNATURE))?;

    let canonical = CanonicalRequest {
        method: request.method,
        path: request.path,
        query: request
            .query
            .iter()
            .filter(|(k, _)| k != PARAM_SIGNATURE)
            .cloned()
            .collect(),
        headers: vec![("host".to_string(), request.host.to_string())],
        payload_hash: UNSIGNED_PAYLOAD,
    };
    let string_to_sign = string_to_sign(algorithm, datetime, &scope, &canonical);
    match credentials {
        Credentials::Hmac(key) => check_signature(&key.secret, issued_at, &string_to_sign, &provided),
        // PKCS#1 v1.5 signatures are deterministic.
        Credentials::ServiceAccount(key) => {
            if rsa_signature(key, &string_to_sign)? == provided {
                Ok(())
            } else {
                Err(SigningError::SignatureMismatch)
            }
        }
    }
}

/// Verify a header-authenticated request.
///
/// `header` looks up a request header by lowercase name.
pub fn verify_authorization<'h>(
    key: &HmacKey,
    request: &IncomingRequest<'_>,
    header: impl Fn(&str) -> Option<&'h str>,
    now: DateTime<Utc>,
) -> Result<(), SigningError> {
    let authorization = header("authorization").ok_or(SigningError::MissingParameter("authorization"))?;
    let fields = authorization
        .strip_prefix(HMAC_ALGORITHM)
        .ok_or_else(|| {
            SigningError::UnsupportedAlgorithm(
                authorization.split_whitespace().next().unwrap_or_default().to_string(),
            )
        })?
        .trim();

    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;
    for field in fields.split(',') {
        match field.trim().split_once('=') {
            Some(("Credential", value)) => credential = Some(value),
            Some(("SignedHeaders", value)) => signed_headers = Some(value),
            Some(("Signature", value)) => signature = Some(value),
            _ => return Err(SigningError::MalformedParameter("authorization")),
        }
    }
    let credential = credential.ok_or(SigningError::MissingParameter("Credential"))?;
    let signed_headers = signed_headers.ok_or(SigningError::MissingParameter("SignedHeaders"))?;
    let provided = hex::decode(signature.ok_or(SigningError::MissingParameter("Signature"))?)
        .map_err(|_| SigningError::MalformedParameter("Signature"))?;

    let datetime = header(HEADER_DATE).ok_or(SigningError::MissingParameter(HEADER_DATE))?;
    let issued_at = parse_datetime(datetime).ok_or(SigningError::MalformedParameter(HEADER_DATE))?;
    if (now - issued_at).num_seconds().abs() > MAX_CLOCK_SKEW_SECS {
        return Err(SigningError::ClockSkew);
    }
    let scope = check_credential(&key.access_id, credential, issued_at)?;
    let payload_hash =
        header(HEADER_CONTENT_SHA256).ok_or(SigningError::MissingParameter(HEADER_CONTENT_SHA256))?;

    let mut headers = Vec::new();
    for name in signed_headers.split(';') {
        let value = if name == "host" {
            Some(request.host)
        } else {
            header(name)
        };
        let value = value.ok_or(SigningError::MalformedParameter("SignedHeaders"))?;
        headers.push((name.to_string(), value.to_string()));
    }
    if !headers.iter().any(|(name, _)| name == "host") {
        return Err(SigningError::MalformedParameter("SignedHeaders"));
    }

    let canonical = CanonicalRequest {
        method: request.method,
        path: request.path,
        query: request.query.to_vec(),
        headers,
        payload_hash,
    };
    let string_to_sign = string_to_sign(HMAC_ALGORITHM, datetime, &scope, &canonical);
    check_signature(&key.secret, issued_at, &string_to_sign, &provided)
}

/// Hex SHA-256 of a payload, for `x-goog-content-sha256`.
pub fn payload_sha256(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// `{path-prefix}/{bucket}[/{key}]`, percent-encoded for the wire.
pub fn object_path(endpoint: &Url, bucket: &str, key: Option<&str>) -> String {
    let base = endpoint.path().trim_end_matches('/');
    match key {
        Some(key) => format!("{base}/{}/{}", uri_encode(bucket, true), uri_encode(key, false)),
        None => format!("{base}/{}", uri_encode(bucket, true)),
    }
}

/// Value of the `Host` header a client sends for `url`.
pub fn host_header(url: &Url) -> Result<String, SigningError> {
    let host = url
        .host_str()
        .ok_or_else(|| SigningError::MissingHost(url.to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let set = if encode_slash { UNRESERVED } else { UNRESERVED_PATH };
    utf8_percent_encode(input, set).to_string()
}

/// Decode `%XX` escapes; malformed escapes are kept verbatim.
pub fn percent_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

pub fn algorithm(credentials: &Credentials) -> &'static str {
    match credentials {
        Credentials::ServiceAccount(_) => RSA_ALGORITHM,
        Credentials::Hmac(_) => HMAC_ALGORITHM,
    }
}

fn origin(url: &Url) -> String {
    url.origin().ascii_serialization()
}

fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn credential_scope(at: DateTime<Utc>) -> String {
    format!("{}/{REGION}/{SERVICE}/{REQUEST_TYPE}", at.format(DATE_FORMAT))
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Validate `{signer}/{scope}` and return the scope.
fn check_credential(
    signer_id: &str,
    credential: &str,
    issued_at: DateTime<Utc>,
) -> Result<String, SigningError> {
    let (signer, scope) = credential
        .split_once('/')
        .ok_or(SigningError::MalformedParameter(PARAM_CREDENTIAL))?;
    if signer != signer_id {
        return Err(SigningError::UnknownAccessId(signer.to_string()));
    }
    if scope != credential_scope(issued_at) {
        return Err(SigningError::MalformedParameter(PARAM_CREDENTIAL));
    }
    Ok(scope.to_string())
}

fn string_to_sign(
    algorithm: &str,
    datetime: &str,
    scope: &str,
    request: &CanonicalRequest<'_>,
) -> String {
    let hashed = hex::encode(Sha256::digest(request.render().as_bytes()));
    format!("{algorithm}\n{datetime}\n{scope}\n{hashed}")
}

/// Raw RSASSA-PKCS1-v1_5 SHA-256 signature bytes.
fn rsa_signature(key: &ServiceAccountKey, string_to_sign: &str) -> Result<Vec<u8>, SigningError> {
    let encoded = jsonwebtoken::crypto::sign(
        string_to_sign.as_bytes(),
        key.encoding_key(),
        Algorithm::RS256,
    )
    .map_err(|err| SigningError::Rsa(err.to_string()))?;
    URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|err| SigningError::Rsa(err.to_string()))
}

fn signing_mac(secret: &str, at: DateTime<Utc>) -> HmacSha256 {
    let date = at.format(DATE_FORMAT).to_string();
    let k_date = hmac(format!("GOOG4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, REGION.as_bytes());
    let k_service = hmac(&k_region, SERVICE.as_bytes());
    let k_signing = hmac(&k_service, REQUEST_TYPE.as_bytes());
    new_mac(&k_signing)
}

fn compute_signature(secret: &str, at: DateTime<Utc>, string_to_sign: &str) -> String {
    let mut mac = signing_mac(secret, at);
    mac.update(string_to_sign.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn check_signature(
    secret: &str,
    at: DateTime<Utc>,
    string_to_sign: &str,
    provided: &[u8],
) -> Result<(), SigningError> {
    let mut mac = signing_mac(secret, at);
    mac.update(string_to_sign.as_bytes());
    mac.verify_slice(provided)
        .map_err(|_| SigningError::SignatureMismatch)
}

fn new_mac(key: &[u8]) -> HmacSha256 {
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = new_mac(key);
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
