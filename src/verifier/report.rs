//! Check outcomes and the run report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Failure categories, each with its own remediation guidance.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Local credential material is missing or malformed.
    Configuration,
    /// The bucket does not exist.
    Deployment,
    /// The credentials lack permission.
    Authorization,
    /// The bucket or signed access behaves less privately than it should.
    Security,
    /// A network failure during a single probe.
    Transient,
    /// Anything the store answered that fits none of the above.
    Internal,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            FailureKind::Configuration => "configuration error",
            FailureKind::Deployment => "deployment error",
            FailureKind::Authorization => "authorization error",
            FailureKind::Security => "security warning",
            FailureKind::Transient => "transient error",
            FailureKind::Internal => "unexpected error",
        }
    }

    pub fn guidance(self) -> &'static str {
        match self {
            FailureKind::Configuration => {
                "Download a service-account key (`gcloud iam service-accounts keys create`) \
                 to GCS_KEY_FILE, or save an HMAC key as {\"access_id\", \"secret\"} JSON there."
            }
            FailureKind::Deployment => {
                "Create the bucket (`gcloud storage buckets create gs://<name>`) or point \
                 GCS_BUCKET_NAME at an existing one."
            }
            FailureKind::Authorization => {
                "Grant the service account roles/storage.objectAdmin on the bucket (plus \
                 storage.buckets.getIamPolicy for the privacy audit) and make sure the key is active."
            }
            FailureKind::Security => {
                "Remove allUsers/allAuthenticatedUsers bindings and enable public access \
                 prevention on the bucket."
            }
            FailureKind::Transient => "Check network connectivity to the storage endpoint and re-run.",
            FailureKind::Internal => "Re-run with RUST_LOG=debug and inspect the storage responses.",
        }
    }

    /// Process exit code when a check of this kind fails.
    pub fn exit_code(self) -> i32 {
        match self {
            FailureKind::Configuration => 2,
            FailureKind::Deployment => 3,
            FailureKind::Authorization => 4,
            _ => 1,
        }
    }
}

/// Exit code for `--strict` runs that finished with warnings.
pub const EXIT_WARNINGS: i32 = 5;

/// Tri-state result of one check.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CheckOutcome {
    Pass { detail: String },
    Warn { kind: FailureKind, detail: String },
    Fail { kind: FailureKind, detail: String },
}

impl CheckOutcome {
    pub fn pass(detail: impl Into<String>) -> Self {
        CheckOutcome::Pass {
            detail: detail.into(),
        }
    }

    pub fn warn(kind: FailureKind, detail: impl Into<String>) -> Self {
        CheckOutcome::Warn {
            kind,
            detail: detail.into(),
        }
    }

    pub fn fail(kind: FailureKind, detail: impl Into<String>) -> Self {
        CheckOutcome::Fail {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, CheckOutcome::Pass { .. })
    }

    pub fn is_warn(&self) -> bool {
        matches!(self, CheckOutcome::Warn { .. })
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, CheckOutcome::Fail { .. })
    }

    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            CheckOutcome::Pass { .. } => None,
            CheckOutcome::Warn { kind, .. } | CheckOutcome::Fail { kind, .. } => Some(*kind),
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            CheckOutcome::Pass { detail }
            | CheckOutcome::Warn { detail, .. }
            | CheckOutcome::Fail { detail, .. } => detail,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            CheckOutcome::Pass { .. } => "PASS",
            CheckOutcome::Warn { .. } => "WARN",
            CheckOutcome::Fail { .. } => "FAIL",
        }
    }
}

/// One executed check.
#[derive(Serialize, Clone, Debug)]
pub struct CheckRecord {
    pub name: &'static str,
    #[serde(flatten)]
    pub outcome: CheckOutcome,
    /// Remediation for warnings and failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'static str>,
}

/// Everything a verification run observed.
#[derive(Serialize, Clone, Debug)]
pub struct Report {
    pub run_id: Uuid,
    pub bucket: String,
    pub started_at: DateTime<Utc>,
    pub probe_key: Option<String>,
    pub checks: Vec<CheckRecord>,
    /// Checks never reached because an earlier check failed.
    pub skipped: Vec<&'static str>,
}

impl Report {
    pub fn new(run_id: Uuid, bucket: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            bucket: bucket.into(),
            started_at,
            probe_key: None,
            checks: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn record(&mut self, name: &'static str, outcome: CheckOutcome) {
        let hint = outcome.kind().map(FailureKind::guidance);
        self.checks.push(CheckRecord {
            name,
            outcome,
            hint,
        });
    }

    pub fn outcome(&self, name: &str) -> Option<&CheckOutcome> {
        self.checks
            .iter()
            .find(|record| record.name == name)
            .map(|record| &record.outcome)
    }

    /// The check that aborted the run, if any.
    pub fn fatal(&self) -> Option<&CheckRecord> {
        self.checks.iter().find(|record| record.outcome.is_fail())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CheckRecord> {
        self.checks.iter().filter(|record| record.outcome.is_warn())
    }

    pub fn succeeded(&self) -> bool {
        self.fatal().is_none()
    }

    pub fn exit_code(&self, strict: bool) -> i32 {
        match self.fatal().and_then(|record| record.outcome.kind()) {
            Some(kind) => kind.exit_code(),
            None if strict && self.warnings().next().is_some() => EXIT_WARNINGS,
            None => 0,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Storage verification for bucket `{}` (run {})",
            self.bucket, self.run_id
        )?;
        for record in &self.checks {
            writeln!(
                f,
                "  [{}] {:<18} {}",
                record.outcome.tag(),
                record.name,
                record.outcome.detail()
            )?;
        }
        for name in &self.skipped {
            writeln!(f, "  [SKIP] {:<18} not run", name)?;
        }

        let passed = self.checks.iter().filter(|r| r.outcome.is_pass()).count();
        let warnings = self.warnings().count();
        writeln!(
            f,
            "{} passed, {} warning(s), {} skipped",
            passed,
            warnings,
            self.skipped.len()
        )?;

        match self.fatal() {
            Some(record) => {
                let kind = record.outcome.kind().unwrap_or(FailureKind::Internal);
                writeln!(f, "Result: FAILED at {} ({})", record.name, kind.label())?;
                writeln!(f, "Hint: {}", kind.guidance())
            }
            None if warnings > 0 => {
                writeln!(f, "Result: PASSED with warnings")?;
                let mut kinds: Vec<FailureKind> = Vec::new();
                for kind in self.warnings().filter_map(|r| r.outcome.kind()) {
                    if !kinds.contains(&kind) {
                        kinds.push(kind);
                    }
                }
                for kind in kinds {
                    writeln!(f, "Hint ({}): {}", kind.label(), kind.guidance())?;
                }
                Ok(())
            }
            None => writeln!(f, "Result: PASSED"),
        }
    }
}
