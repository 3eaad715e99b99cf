use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::{env, path::PathBuf, time::Duration};

pub const DEFAULT_KEY_FILE: &str = "./gcs-key.json";
pub const DEFAULT_BUCKET: &str = "eventhub-payment-proofs";
pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_EMULATOR_HOST: &str = "127.0.0.1";
pub const DEFAULT_EMULATOR_PORT: u16 = 4443;

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Verify the payment-proof bucket, run a local Cloud Storage emulator, or render the navigation menu"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the storage verification checks (default)
    Verify(VerifyArgs),
    /// Serve an in-memory Cloud Storage emulator
    Serve(ServeArgs),
    /// Print the navigation menu for a session file
    Menu(MenuArgs),
}

#[derive(ClapArgs, Debug, Default)]
pub struct VerifyArgs {
    /// Service-account or HMAC key file (overrides GCS_KEY_FILE)
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Bucket to verify (overrides GCS_BUCKET_NAME)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Storage endpoint (overrides GCS_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// HTTP timeout in seconds (overrides GCS_TIMEOUT_SECS)
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Exit non-zero when any check warns
    #[arg(long)]
    pub strict: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(ClapArgs, Debug, Default)]
pub struct ServeArgs {
    /// Host to bind to (overrides EMULATOR_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides EMULATOR_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Key file the emulator verifies signatures and token assertions with (overrides GCS_KEY_FILE)
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Bucket created at startup (overrides GCS_BUCKET_NAME)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Seed the bucket with a public-read policy
    #[arg(long)]
    pub public: bool,
}

#[derive(ClapArgs, Debug)]
pub struct MenuArgs {
    /// JSON session file, e.g. {"user":{"email":"a@b.c","role":"participant"}}
    #[arg(long)]
    pub session: PathBuf,

    /// Clear the session file and print the entry route
    #[arg(long)]
    pub logout: bool,
}

/// Resolved settings for `verify`.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    pub key_file: PathBuf,
    pub bucket: String,
    pub endpoint: String,
    pub timeout: Duration,
    pub strict: bool,
    pub json: bool,
}

/// Resolved settings for `serve`.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
    pub key_file: PathBuf,
    pub bucket: String,
    pub public: bool,
}

impl VerifyConfig {
    /// Merge CLI args over environment variables read through `var`.
    pub fn resolve(args: VerifyArgs, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let timeout_secs = match args.timeout_secs {
            Some(secs) => secs,
            None => parse_var(&var, "GCS_TIMEOUT_SECS")?.unwrap_or(DEFAULT_TIMEOUT_SECS),
        };

        Ok(Self {
            key_file: args
                .key_file
                .or_else(|| var("GCS_KEY_FILE").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_FILE)),
            bucket: args
                .bucket
                .or_else(|| var("GCS_BUCKET_NAME"))
                .unwrap_or_else(|| DEFAULT_BUCKET.into()),
            endpoint: args
                .endpoint
                .or_else(|| var("GCS_ENDPOINT"))
                .unwrap_or_else(|| DEFAULT_ENDPOINT.into()),
            timeout: Duration::from_secs(timeout_secs),
            strict: args.strict,
            json: args.json,
        })
    }
}

impl ServeConfig {
    /// Merge CLI args over environment variables read through `var`.
    pub fn resolve(args: ServeArgs, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match args.port {
            Some(port) => port,
            None => parse_var(&var, "EMULATOR_PORT")?.unwrap_or(DEFAULT_EMULATOR_PORT),
        };

        Ok(Self {
            host: args
                .host
                .or_else(|| var("EMULATOR_HOST"))
                .unwrap_or_else(|| DEFAULT_EMULATOR_HOST.into()),
            port,
            key_file: args
                .key_file
                .or_else(|| var("GCS_KEY_FILE").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_FILE)),
            bucket: args
                .bucket
                .or_else(|| var("GCS_BUCKET_NAME"))
                .unwrap_or_else(|| DEFAULT_BUCKET.into()),
            public: args.public,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Process environment lookup for `resolve`.
pub fn process_env(name: &str) -> Option<String> {
    env::var(name).ok()
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn verify_defaults() {
        let cfg = VerifyConfig::resolve(VerifyArgs::default(), env_of(&[])).unwrap();
        assert_eq!(cfg.key_file, PathBuf::from(DEFAULT_KEY_FILE));
        assert_eq!(cfg.bucket, DEFAULT_BUCKET);
        assert_eq!(cfg.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(cfg.timeout, Duration::from_secs(30));
    }

    #[test]
    fn args_override_environment() {
        let env = env_of(&[("GCS_BUCKET_NAME", "from-env"), ("GCS_TIMEOUT_SECS", "5")]);
        let args = VerifyArgs {
            bucket: Some("from-args".into()),
            ..VerifyArgs::default()
        };
        let cfg = VerifyConfig::resolve(args, env).unwrap();
        assert_eq!(cfg.bucket, "from-args");
        assert_eq!(cfg.timeout, Duration::from_secs(5));
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = VerifyConfig::resolve(
            VerifyArgs::default(),
            env_of(&[("GCS_TIMEOUT_SECS", "soon")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("GCS_TIMEOUT_SECS"));

        assert!(
            ServeConfig::resolve(ServeArgs::default(), env_of(&[("EMULATOR_PORT", "70000")]))
                .is_err()
        );
    }

    #[test]
    fn serve_addr() {
        let cfg = ServeConfig::resolve(ServeArgs::default(), env_of(&[])).unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:4443");
        assert!(!cfg.public);
    }
}
