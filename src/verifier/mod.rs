//! Proof-of-storage verifier.
//!
//! Runs the checks in order against one bucket. A failing check aborts the
//! remaining ones; warnings are collected. Once the probe object has been
//! uploaded, cleanup always runs, whatever happened afterwards.

pub mod checks;
pub mod report;

use crate::{
    config::VerifyConfig,
    credentials::Credentials,
    services::{gcs_client::GcsClient, store::ObjectStore},
    verifier::{
        checks::{
            BucketExists, BucketMetadataCheck, Check, Cleanup, DirectAccess, PrivacyAudit,
            ProbeContext, SignedUrlIssue, SignedUrlRedeem, UploadProbe,
        },
        report::{CheckOutcome, FailureKind, Report},
    },
};
use chrono::{DateTime, Duration, Utc};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

/// Name of the pre-flight credential check.
pub const CREDENTIALS_CHECK: &str = "credentials";

/// The checks run against every bucket, in order. Cleanup is handled separately.
pub fn standard_checks() -> Vec<Box<dyn Check>> {
    vec![
        Box::new(BucketExists),
        Box::new(BucketMetadataCheck),
        Box::new(PrivacyAudit),
        Box::new(UploadProbe),
        Box::new(DirectAccess),
        Box::new(SignedUrlIssue),
        Box::new(SignedUrlRedeem),
    ]
}

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub bucket: String,
    /// Timestamp the probe key is derived from.
    pub started_at: DateTime<Utc>,
    pub signed_url_ttl: Duration,
}

impl VerifyOptions {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            started_at: Utc::now(),
            signed_url_ttl: checks::default_signed_url_ttl(),
        }
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = at;
        self
    }
}

pub struct Verifier<'s> {
    store: &'s dyn ObjectStore,
    checks: Vec<Box<dyn Check>>,
    cleanup: Cleanup,
    options: VerifyOptions,
}

impl<'s> Verifier<'s> {
    pub fn new(store: &'s dyn ObjectStore, options: VerifyOptions) -> Self {
        Self {
            store,
            checks: standard_checks(),
            cleanup: Cleanup,
            options,
        }
    }

    /// Run every check and return the report.
    pub async fn run(&self) -> Report {
        let run_id = Uuid::new_v4();
        let mut report = Report::new(run_id, &self.options.bucket, self.options.started_at);
        self.run_into(&mut report)
            .instrument(info_span!("verify", %run_id, bucket = %self.options.bucket))
            .await;
        report
    }

    /// Run the checks, appending to an existing report.
    pub async fn run_into(&self, report: &mut Report) {
        let mut ctx = ProbeContext::new(
            &self.options.bucket,
            self.options.started_at,
            self.options.signed_url_ttl,
        );

        let mut aborted = false;
        for check in &self.checks {
            if aborted {
                report.skipped.push(check.name());
                continue;
            }
            let outcome = check.run(self.store, &mut ctx).await;
            log_outcome(check.name(), &outcome);
            aborted = outcome.is_fail();
            report.record(check.name(), outcome);
        }

        report.probe_key = ctx.probe.as_ref().map(|probe| probe.key.clone());

        if ctx.uploaded.is_some() {
            let outcome = self.cleanup.run(self.store, &mut ctx).await;
            log_outcome(self.cleanup.name(), &outcome);
            report.record(self.cleanup.name(), outcome);
        } else {
            report.skipped.push(self.cleanup.name());
        }
    }
}

fn log_outcome(name: &str, outcome: &CheckOutcome) {
    match outcome {
        CheckOutcome::Pass { detail } => info!(check = name, "{}", detail),
        CheckOutcome::Warn { kind, detail } => warn!(check = name, ?kind, "{}", detail),
        CheckOutcome::Fail { kind, detail } => error!(check = name, ?kind, "{}", detail),
    }
}

/// Verify the bucket named in `config` against the live service.
///
/// Loads the key file first (service account or HMAC key); a missing or
/// malformed key ends the run with a configuration failure before any request
/// is made.
pub async fn verify(config: &VerifyConfig) -> Report {
    let options = VerifyOptions::new(&config.bucket);
    let run_id = Uuid::new_v4();
    let mut report = Report::new(run_id, &options.bucket, options.started_at);
    let span = info_span!("verify", %run_id, bucket = %options.bucket);

    let credentials = match Credentials::load(&config.key_file) {
        Ok(credentials) => credentials,
        Err(err) => {
            let outcome = CheckOutcome::fail(FailureKind::Configuration, err.to_string());
            span.in_scope(|| log_outcome(CREDENTIALS_CHECK, &outcome));
            report.record(CREDENTIALS_CHECK, outcome);
            report.skipped.extend(standard_checks().iter().map(|c| c.name()));
            report.skipped.push(Cleanup.name());
            return report;
        }
    };
    let detail = format!(
        "{} {} loaded from {}",
        credentials.kind(),
        credentials.signer_id(),
        config.key_file.display()
    );

    let client = match GcsClient::new(credentials, &config.endpoint, config.timeout) {
        Ok(client) => client,
        Err(err) => {
            let outcome = CheckOutcome::fail(FailureKind::Configuration, err.to_string());
            span.in_scope(|| log_outcome(CREDENTIALS_CHECK, &outcome));
            report.record(CREDENTIALS_CHECK, outcome);
            report.skipped.extend(standard_checks().iter().map(|c| c.name()));
            report.skipped.push(Cleanup.name());
            return report;
        }
    };
    let outcome = CheckOutcome::pass(detail);
    span.in_scope(|| log_outcome(CREDENTIALS_CHECK, &outcome));
    report.record(CREDENTIALS_CHECK, outcome);

    Verifier::new(&client, options)
        .run_into(&mut report)
        .instrument(span)
        .await;
    report
}
