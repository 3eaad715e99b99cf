//! Local Cloud Storage emulator.
//!
//! Serves the XML API subset the verifier uses, the JSON API bucket IAM
//! resource and an OAuth token endpoint on top of a `MemoryStore`, so a full
//! verification run can be exercised without a real bucket.

use crate::{
    config::ServeConfig,
    credentials::Credentials,
    models::bucket::Policy,
    routes,
    services::memory_store::MemoryStore,
};
use anyhow::{Context, Result};
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use std::{
    collections::HashMap,
    io::ErrorKind,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::net::TcpListener;
use url::Url;
use uuid::Uuid;

pub const SEED_LOCATION: &str = "ASIA-SOUTH1";
pub const SEED_STORAGE_CLASS: &str = "STANDARD";

/// Lifetime of the access tokens `/token` hands out.
pub const TOKEN_LIFETIME_SECS: i64 = 3600;

/// Shared handler state.
#[derive(Clone, Debug)]
pub struct EmulatorState {
    pub store: MemoryStore,
    /// Bucket created at startup; `/readyz` probes it.
    pub seed_bucket: String,
    /// Bearer tokens issued by `/token` and their expiry.
    tokens: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl EmulatorState {
    /// Build a store for `credentials` addressed at `endpoint` and create
    /// `bucket` in it. A public bucket grants `allUsers` read through IAM.
    pub fn seeded(
        credentials: impl Into<Credentials>,
        endpoint: Url,
        bucket: &str,
        public: bool,
    ) -> Self {
        let store = MemoryStore::new(credentials, endpoint);
        let policy = if public {
            Policy::public_read()
        } else {
            Policy::private()
        };
        store.create_bucket(bucket, SEED_LOCATION, SEED_STORAGE_CLASS, policy);
        Self {
            store,
            seed_bucket: bucket.to_string(),
            tokens: Arc::default(),
        }
    }

    /// Record a new access token valid from `now`.
    pub fn issue_token(&self, now: DateTime<Utc>) -> String {
        let token = format!("ya29.emulator-{}", Uuid::new_v4().simple());
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.retain(|_, expires_at| *expires_at > now);
        tokens.insert(token.clone(), now + Duration::seconds(TOKEN_LIFETIME_SECS));
        token
    }

    pub fn token_valid(&self, token: &str, now: DateTime<Utc>) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .is_some_and(|expires_at| *expires_at > now)
    }
}

pub fn router(state: EmulatorState) -> Router {
    routes::routes::routes().with_state(state)
}

/// Bind `host:port`, retrying on loopback when a wildcard bind is refused.
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{host}:{port}");
    match TcpListener::bind(&addr).await {
        Ok(listener) => Ok(listener),
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied && matches!(host, "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{port}");
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr)
                .await
                .with_context(|| format!("binding {fallback_addr}"))
        }
        Err(err) => Err(err).with_context(|| format!("binding {addr}")),
    }
}

/// Run the emulator until the process is stopped.
pub async fn serve(config: ServeConfig) -> Result<()> {
    let credentials = Credentials::load(&config.key_file)?;
    let listener = bind(&config.host, config.port).await?;
    let local = listener.local_addr()?;
    let endpoint = Url::parse(&format!("http://{local}"))
        .with_context(|| format!("building endpoint for {local}"))?;

    tracing::info!(
        bucket = %config.bucket,
        public = config.public,
        signer = %credentials.signer_id(),
        "seeding emulator bucket"
    );
    let state = EmulatorState::seeded(credentials, endpoint, &config.bucket, config.public);

    tracing::info!("Emulator listening on http://{}", local);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
