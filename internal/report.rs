use crate::meta::catalog::write_atomic;
use crate::meta::models::{CheckOutcome, DrTestRun, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Success,
    Partial,
    Failure,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Backup,
    Replication,
    Health,
    Retention,
    DrRun,
}

impl CycleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Replication => "replication",
            Self::Health => "health",
            Self::Retention => "retention",
            Self::DrRun => "dr",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCheck {
    pub name: String,
    pub outcome: CheckOutcome,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Machine-readable outcome of one cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub timestamp: DateTime<Utc>,
    pub status: CycleStatus,
    pub checks: Vec<ReportCheck>,
    pub summary: ReportSummary,
}

impl CycleReport {
    pub fn new(timestamp: DateTime<Utc>, checks: Vec<ReportCheck>) -> Self {
        let summary = ReportSummary {
            total: checks.len(),
            passed: checks
                .iter()
                .filter(|check| check.outcome == CheckOutcome::Passed)
                .count(),
            failed: checks
                .iter()
                .filter(|check| check.outcome == CheckOutcome::Failed)
                .count(),
        };
        Self {
            timestamp,
            status: derive_status(&checks),
            checks,
            summary,
        }
    }

    pub fn from_run(run: &DrTestRun) -> Self {
        let checks = run
            .checks
            .iter()
            .map(|check| ReportCheck {
                name: check.name.clone(),
                outcome: check.outcome,
                detail: check.detail.clone(),
            })
            .collect();
        let mut report = Self::new(run.finished_at.unwrap_or(run.started_at), checks);
        if !run.passed() && report.status == CycleStatus::Success {
            report.status = CycleStatus::Failure;
        }
        report
    }
}

impl DrTestRun {
    pub fn report(&self) -> CycleReport {
        CycleReport::from_run(self)
    }
}

/// Failure when every check that ran failed, partial when some did, success
/// otherwise. Warnings never fail a cycle.
pub fn derive_status(checks: &[ReportCheck]) -> CycleStatus {
    let ran: Vec<&ReportCheck> = checks
        .iter()
        .filter(|check| check.outcome != CheckOutcome::Skipped)
        .collect();
    let failed = ran
        .iter()
        .filter(|check| check.outcome == CheckOutcome::Failed)
        .count();
    if failed == 0 {
        CycleStatus::Success
    } else if failed == ran.len() {
        CycleStatus::Failure
    } else {
        CycleStatus::Partial
    }
}

pub fn check(name: impl Into<String>, outcome: CheckOutcome, detail: impl Into<String>) -> ReportCheck {
    ReportCheck {
        name: name.into(),
        outcome,
        detail: detail.into(),
    }
}

pub fn severity_outcome(severity: Severity) -> CheckOutcome {
    match severity {
        Severity::Ok => CheckOutcome::Passed,
        Severity::Warning => CheckOutcome::Warning,
        Severity::Critical => CheckOutcome::Failed,
    }
}

pub fn report_file_name(kind: CycleKind, timestamp: DateTime<Utc>) -> String {
    format!("{}-{}.json", kind.as_str(), timestamp.format("%Y%m%dT%H%M%SZ"))
}

/// Writes `{dir}/{kind}-{timestamp}.json`; a second report in the same second
/// gets a numeric suffix instead of overwriting the first.
pub async fn persist(dir: &Path, kind: CycleKind, report: &CycleReport) -> Result<PathBuf, String> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| format!("mkdir {} failed: {err}", dir.display()))?;
    let payload = serde_json::to_vec_pretty(report)
        .map_err(|err| format!("report encode failed: {err}"))?;
    let base = report_file_name(kind, report.timestamp);
    let mut path = dir.join(&base);
    let mut attempt = 1;
    while tokio::fs::try_exists(&path).await.unwrap_or(false) {
        attempt += 1;
        path = dir.join(base.replace(".json", &format!("-{attempt}.json")));
    }
    write_atomic(&path, &payload).await?;
    tracing::debug!(path = %path.display(), status = report.status.as_str(), "cycle report written");
    Ok(path)
}
