use crate::api::AppState;
use crate::meta::models::{Alert, AlertCategory, CheckOutcome, Severity, StrategyKind};
use crate::monitor::Signal;
use crate::report::{self, check, severity_outcome, CycleKind, CycleReport, CycleStatus, ReportCheck};
use crate::validate::Verdict;
use chrono::{DateTime, Utc};
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinSet;
use tokio::time::sleep;

#[cfg(test)]
static BACKUP_CYCLES: AtomicUsize = AtomicUsize::new(0);

pub fn start_background_jobs(state: AppState) {
    start_backup_scheduler(state.clone());
    start_replication_scheduler(state.clone());
    start_monitor_scheduler(state.clone());
    start_retention_scheduler(state);
}

fn start_backup_scheduler(state: AppState) {
    tokio::spawn(async move {
        loop {
            run_backup_cycle_once(&state).await;
            sleep(state.config.backup_interval).await;
        }
    });
}

fn start_replication_scheduler(state: AppState) {
    tokio::spawn(async move {
        loop {
            sleep(state.config.replication_interval).await;
            run_replication_cycle_once(&state).await;
        }
    });
}

fn start_monitor_scheduler(state: AppState) {
    tokio::spawn(async move {
        loop {
            sleep(state.config.monitor_interval).await;
            run_monitor_cycle_once(&state).await;
        }
    });
}

fn start_retention_scheduler(state: AppState) {
    tokio::spawn(async move {
        loop {
            sleep(state.config.retention_interval).await;
            run_retention_cycle_once(&state).await;
        }
    });
}

/// Every cycle once, in pipeline order. Used by `--once`.
pub async fn run_all_cycles_once(state: &AppState) -> Vec<(CycleKind, CycleReport)> {
    vec![
        (CycleKind::Backup, run_backup_cycle_once(state).await),
        (CycleKind::Replication, run_replication_cycle_once(state).await),
        (CycleKind::Retention, run_retention_cycle_once(state).await),
        (CycleKind::Health, run_monitor_cycle_once(state).await),
    ]
}

/// Runs one pipeline per service in parallel; strategies within a service run
/// in order. A failure in one service never blocks another.
pub async fn run_backup_cycle_once(state: &AppState) -> CycleReport {
    #[cfg(test)]
    BACKUP_CYCLES.fetch_add(1, Ordering::Relaxed);
    let now = Utc::now();
    let mut checks: Vec<ReportCheck> = state
        .unreachable
        .iter()
        .map(|(service, err)| check(format!("{service}/connect"), CheckOutcome::Failed, err.as_str()))
        .collect();

    let mut pipelines = JoinSet::new();
    for service in state.executor.service_names() {
        let state = state.clone();
        pipelines.spawn(async move { backup_service(&state, &service, now).await });
    }
    while let Some(joined) = pipelines.join_next().await {
        match joined {
            Ok(mut service_checks) => checks.append(&mut service_checks),
            Err(err) => {
                tracing::error!(error = %err, "backup pipeline task failed");
                checks.push(check(
                    "backup/pipeline",
                    CheckOutcome::Failed,
                    format!("pipeline task failed: {err}"),
                ));
            }
        }
    }
    checks.sort_by(|a, b| a.name.cmp(&b.name));
    finish_cycle(state, CycleKind::Backup, now, checks).await
}

async fn backup_service(state: &AppState, service: &str, now: DateTime<Utc>) -> Vec<ReportCheck> {
    let Some(config) = state.executor.service(service).cloned() else {
        return Vec::new();
    };
    let mut checks = Vec::new();
    for entry in &config.strategies {
        let name = format!("{service}/{}", entry.kind.as_str());
        let last = match state
            .catalog
            .latest_validated(service, Some(entry.kind))
            .await
        {
            Ok(latest) => latest.map(|artifact| artifact.created_at),
            Err(err) => {
                checks.push(check(name, CheckOutcome::Failed, err));
                continue;
            }
        };
        if !entry.schedule.is_due(last, now) {
            tracing::debug!(service, strategy = entry.kind.as_str(), "backup not due");
            checks.push(check(name, CheckOutcome::Skipped, "not due"));
            continue;
        }
        checks.push(produce_and_validate(state, service, entry.kind, name).await);
    }
    checks
}

async fn produce_and_validate(
    state: &AppState,
    service: &str,
    strategy: StrategyKind,
    name: String,
) -> ReportCheck {
    let mut artifact = match state.executor.produce(service, strategy).await {
        Ok(artifact) => artifact,
        Err(err) => {
            raise_backup_failure(state, service, err.to_string()).await;
            return check(name, CheckOutcome::Failed, err.to_string());
        }
    };
    match state
        .validator
        .validate_and_record(&state.catalog, &mut artifact)
        .await
    {
        Ok(Verdict::Valid) => check(
            name,
            CheckOutcome::Passed,
            format!("{} ({} bytes)", artifact.name, artifact.size_bytes),
        ),
        Ok(Verdict::Invalid(failure)) => {
            raise_backup_failure(state, service, failure.to_string()).await;
            check(name, CheckOutcome::Failed, failure.to_string())
        }
        Err(err) => check(name, CheckOutcome::Failed, err),
    }
}

async fn raise_backup_failure(state: &AppState, service: &str, detail: String) {
    let alert = Alert::new(
        Severity::Warning,
        service,
        AlertCategory::BackupFailure,
        detail,
        Utc::now(),
    );
    state.alerts.raise(alert).await;
}

/// Syncs every category whose cadence is due. A failed region fails its own
/// check and retries on the next cycle; its alert stays a warning.
pub async fn run_replication_cycle_once(state: &AppState) -> CycleReport {
    let now = Utc::now();
    let mut checks = Vec::new();
    for category in state.replicator.categories() {
        match state.replicator.sync(&category, now).await {
            Ok(sync) if !sync.due => {
                checks.push(check(category, CheckOutcome::Skipped, "not due"));
            }
            Ok(sync) => {
                let failed: Vec<String> = sync
                    .failures()
                    .into_iter()
                    .map(|failure| format!("replication:{}@{}", failure.category, failure.region))
                    .collect();
                for signal in state.monitor.check_replication(&sync, now).await {
                    let mut entry = signal_check(signal);
                    if failed.contains(&entry.name) {
                        entry.outcome = CheckOutcome::Failed;
                    }
                    checks.push(entry);
                }
            }
            Err(err) => {
                tracing::error!(category = %category, error = %err, "replication sync failed");
                checks.push(check(category, CheckOutcome::Failed, err));
            }
        }
    }
    finish_cycle(state, CycleKind::Replication, now, checks).await
}

/// Freshness and integrity per configured service, then storage and
/// per-region reconciliation signals.
pub async fn run_monitor_cycle_once(state: &AppState) -> CycleReport {
    let now = Utc::now();
    let mut checks = Vec::new();
    for service in &state.config.topology.services {
        match state.monitor.check_service(&service.name, now).await {
            Ok(result) => {
                let detail = if result.findings.is_empty() {
                    match result.age_hours {
                        Some(age) => format!("latest validated artifact {age:.1}h old"),
                        None => "no validated artifact".to_string(),
                    }
                } else {
                    result.findings.join("; ")
                };
                checks.push(check(
                    format!("health:{}", service.name),
                    severity_outcome(result.severity),
                    detail,
                ));
            }
            Err(err) => {
                tracing::error!(service = %service.name, error = %err, "health check failed");
                checks.push(check(format!("health:{}", service.name), CheckOutcome::Failed, err));
            }
        }
    }
    if let Some(signal) = state.monitor.check_storage(now).await {
        checks.push(signal_check(signal));
    }
    for region in &state.config.topology.regions {
        match state.replicator.verify(&region.name).await {
            Ok(reconciliation) => {
                let signals = state.monitor.check_reconciliation(&reconciliation, now).await;
                checks.extend(signals.into_iter().map(signal_check));
            }
            Err(err) => {
                tracing::warn!(region = %region.name, error = %err, "reconciliation failed");
                checks.push(check(
                    format!("reconcile:{}", region.name),
                    CheckOutcome::Warning,
                    err,
                ));
            }
        }
    }
    finish_cycle(state, CycleKind::Health, now, checks).await
}

pub async fn run_retention_cycle_once(state: &AppState) -> CycleReport {
    let now = Utc::now();
    let mut checks = Vec::new();
    for category in &state.config.topology.categories {
        let policy = category.retention_policy();
        match state.retention.enforce(&policy, now).await {
            Ok(outcome) => {
                let outcome_kind = if outcome.errors.is_empty() {
                    CheckOutcome::Passed
                } else {
                    CheckOutcome::Warning
                };
                let mut detail = format!(
                    "{} local and {} remote deleted, {} unvalidated kept",
                    outcome.local_deleted.len(),
                    outcome.remote_deleted.len(),
                    outcome.kept_unvalidated.len()
                );
                if !outcome.errors.is_empty() {
                    detail.push_str(&format!("; errors: {}", outcome.errors.join("; ")));
                }
                checks.push(check(format!("retention:{}", category.name), outcome_kind, detail));
            }
            Err(err) => {
                tracing::error!(category = %category.name, error = %err, "retention failed");
                checks.push(check(
                    format!("retention:{}", category.name),
                    CheckOutcome::Failed,
                    err,
                ));
            }
        }
    }
    finish_cycle(state, CycleKind::Retention, now, checks).await
}

fn signal_check(signal: Signal) -> ReportCheck {
    check(signal.name, severity_outcome(signal.severity), signal.detail)
}

async fn finish_cycle(
    state: &AppState,
    kind: CycleKind,
    started: DateTime<Utc>,
    checks: Vec<ReportCheck>,
) -> CycleReport {
    let report = CycleReport::new(started, checks);
    match report.status {
        CycleStatus::Success => tracing::info!(
            cycle = kind.as_str(),
            checks = report.summary.total,
            "cycle completed"
        ),
        CycleStatus::Partial | CycleStatus::Failure => tracing::error!(
            cycle = kind.as_str(),
            status = report.status.as_str(),
            failed = report.summary.failed,
            checks = report.summary.total,
            "cycle completed with failures"
        ),
    }
    if let Err(err) = report::persist(&state.config.reports_dir, kind, &report).await {
        tracing::warn!(cycle = kind.as_str(), error = %err, "cycle report not persisted");
    }
    report
}
