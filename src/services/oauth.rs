//! OAuth 2.0 access tokens for a service account (JWT-bearer grant).
//!
//! The client signs an RS256 assertion with the service-account key, posts it
//! to the key's `token_uri` and uses the returned bearer token for JSON and
//! XML API calls until shortly before it expires.

use crate::{
    credentials::ServiceAccountKey,
    services::store::{StoreError, StoreResult},
    signing::SigningError,
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, Header};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

pub const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.full_control";
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime of an assertion; Google rejects anything longer than an hour.
pub const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssertionClaims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Token endpoint response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default = "bearer")]
    pub token_type: String,
}

fn bearer() -> String {
    "Bearer".to_string()
}

/// Sign a JWT-bearer assertion for `key`, valid from `now`.
pub fn assertion(key: &ServiceAccountKey, now: DateTime<Utc>) -> Result<String, SigningError> {
    let claims = AssertionClaims {
        iss: key.client_email.clone(),
        scope: STORAGE_SCOPE.to_string(),
        aud: key.token_uri.clone(),
        iat: now.timestamp(),
        exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
    };
    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();

    jsonwebtoken::encode(&header, &claims, key.encoding_key())
        .map_err(|err| SigningError::Rsa(err.to_string()))
}

/// Check an assertion the way a token endpoint holding the same key would.
pub fn verify_assertion(
    key: &ServiceAccountKey,
    jwt: &str,
    now: DateTime<Utc>,
) -> Result<AssertionClaims, SigningError> {
    let malformed = || SigningError::MalformedParameter("assertion");

    let (signing_input, signature) = jwt.rsplit_once('.').ok_or_else(malformed)?;
    let expected = jsonwebtoken::crypto::sign(
        signing_input.as_bytes(),
        key.encoding_key(),
        Algorithm::RS256,
    )
    .map_err(|err| SigningError::Rsa(err.to_string()))?;
    if expected != signature {
        return Err(SigningError::SignatureMismatch);
    }

    let (_, payload) = signing_input.split_once('.').ok_or_else(malformed)?;
    let payload = URL_SAFE_NO_PAD.decode(payload).map_err(|_| malformed())?;
    let claims: AssertionClaims = serde_json::from_slice(&payload).map_err(|_| malformed())?;

    if claims.iss != key.client_email {
        return Err(SigningError::UnknownAccessId(claims.iss));
    }
    if claims.aud != key.token_uri {
        return Err(SigningError::MalformedParameter("aud"));
    }
    if claims.exp < now.timestamp() {
        return Err(SigningError::Expired(
            DateTime::from_timestamp(claims.exp, 0).unwrap_or(now),
        ));
    }
    Ok(claims)
}

struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Mints and caches access tokens for one service account.
#[derive(Clone)]
pub struct TokenSource {
    http: reqwest::Client,
    key: ServiceAccountKey,
    cached: Arc<Mutex<Option<AccessToken>>>,
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSource")
            .field("client_email", &self.key.client_email)
            .field("token_uri", &self.key.token_uri)
            .finish_non_exhaustive()
    }
}

impl TokenSource {
    pub fn new(http: reqwest::Client, key: ServiceAccountKey) -> Self {
        Self {
            http,
            key,
            cached: Arc::new(Mutex::new(None)),
        }
    }

    /// A valid access token, exchanging a fresh assertion when needed.
    pub async fn token(&self) -> StoreResult<String> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > now {
                return Ok(token.value.clone());
            }
        }

        let token = self.exchange(now).await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn exchange(&self, now: DateTime<Utc>) -> StoreResult<AccessToken> {
        let assertion = assertion(&self.key, now)?;
        debug!("POST {} for {}", self.key.token_uri, self.key.client_email);

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                400 | 401 | 403 => StoreError::PermissionDenied {
                    status: status.as_u16(),
                    message: format!("token exchange refused: {message}"),
                },
                code => StoreError::Unexpected {
                    status: code,
                    message: format!("token exchange failed: {message}"),
                },
            });
        }

        let body: TokenResponse = response.json().await.map_err(|err| StoreError::Unexpected {
            status: status.as_u16(),
            message: format!("token response: {err}"),
        })?;
        Ok(AccessToken {
            value: body.access_token,
            expires_at: now + Duration::seconds(body.expires_in),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> ServiceAccountKey {
        ServiceAccountKey::from_pem(
            "uploader@eventhub-prod.iam.gserviceaccount.com",
            include_str!("../../tests/fixtures/service-account-key.pem"),
            "http://127.0.0.1:4443/token",
        )
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn assertion_carries_scope_and_audience() {
        let jwt = assertion(&key(), now()).unwrap();
        let claims = verify_assertion(&key(), &jwt, now()).unwrap();
        assert_eq!(claims.scope, STORAGE_SCOPE);
        assert_eq!(claims.aud, "http://127.0.0.1:4443/token");
        assert_eq!(claims.exp - claims.iat, ASSERTION_LIFETIME_SECS);
    }

    #[test]
    fn stale_or_altered_assertions_fail() {
        let jwt = assertion(&key(), now()).unwrap();
        assert!(matches!(
            verify_assertion(&key(), &jwt, now() + Duration::hours(2)),
            Err(SigningError::Expired(_))
        ));

        let mut parts: Vec<&str> = jwt.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&AssertionClaims {
                iss: "intruder@example.com".into(),
                scope: STORAGE_SCOPE.into(),
                aud: "http://127.0.0.1:4443/token".into(),
                iat: now().timestamp(),
                exp: now().timestamp() + 60,
            })
            .unwrap(),
        );
        parts[1] = &forged;
        assert_eq!(
            verify_assertion(&key(), &parts.join("."), now()),
            Err(SigningError::SignatureMismatch)
        );
    }
}
