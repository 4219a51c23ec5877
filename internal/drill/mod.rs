pub mod environment;
pub mod sandbox;

use crate::alerts::AlertManager;
use crate::backup::volume::VolumeSource;
use crate::backup::{BackupExecutor, EngineConnector, EngineHandle};
use crate::errors::EnvironmentFailure;
use crate::meta::models::{
    Alert, AlertCategory, BackupArtifact, CheckOutcome, DrCheck, DrRunState, DrTestKind,
    DrTestRun, EngineKind, Severity,
};
use crate::obs::Metrics;
use crate::util::config::{Config, ServiceConfig};
use crate::util::poll::{poll_until, PollError, PollSettings};
use crate::validate::{IntegrityValidator, Verdict};
use chrono::Utc;
use environment::EnvironmentControl;
use futures_util::future::join_all;
use futures_util::FutureExt;
use sandbox::{SandboxProvider, SandboxScope};
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct DrillSettings {
    pub health_endpoints: Vec<String>,
    pub restore_services: Vec<String>,
    pub primary_component: Option<String>,
    pub failover_wait: Duration,
    pub recovery_target: Duration,
    pub rebuild_timeout: Duration,
    pub probe_timeout: Duration,
    pub availability_threshold: f64,
    pub poll_interval: Duration,
    pub max_age_hours: f64,
}

impl DrillSettings {
    pub fn from_config(config: &Config) -> Self {
        let drill = &config.topology.drill;
        Self {
            health_endpoints: drill.health_endpoints.clone(),
            restore_services: drill.restore_services.clone(),
            primary_component: drill.primary_component.clone(),
            failover_wait: Duration::from_secs(drill.failover_wait_seconds),
            recovery_target: Duration::from_secs(drill.recovery_target_seconds),
            rebuild_timeout: Duration::from_secs(drill.rebuild_timeout_seconds),
            probe_timeout: Duration::from_secs(drill.probe_timeout_seconds),
            availability_threshold: drill.availability_threshold,
            poll_interval: config.poll_interval,
            max_age_hours: config.max_age_hours,
        }
    }
}

struct StagedRestore {
    service: ServiceConfig,
    artifact: BackupArtifact,
    data_dir: PathBuf,
    endpoint: Option<String>,
}

#[derive(Default)]
struct Prepared {
    restores: Vec<StagedRestore>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Availability {
    healthy: usize,
    total: usize,
}

impl Availability {
    fn ratio(self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.healthy as f64 / self.total as f64
    }

    fn describe(self) -> String {
        format!("{:.1}% ({}/{})", self.ratio() * 100.0, self.healthy, self.total)
    }
}

/// Runs scripted drills. Every run ends in `TornDown`, whatever the checks
/// did, and sandboxes acquired along the way are released before returning.
pub struct DrHarness {
    executor: Arc<BackupExecutor>,
    validator: IntegrityValidator,
    connector: Arc<dyn EngineConnector>,
    sandbox: Arc<dyn SandboxProvider>,
    environment: Option<Arc<dyn EnvironmentControl>>,
    alerts: Option<AlertManager>,
    metrics: Option<Arc<Metrics>>,
    settings: DrillSettings,
    http: reqwest::Client,
}

impl DrHarness {
    pub fn new(
        executor: Arc<BackupExecutor>,
        validator: IntegrityValidator,
        connector: Arc<dyn EngineConnector>,
        sandbox: Arc<dyn SandboxProvider>,
        settings: DrillSettings,
    ) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(settings.probe_timeout)
            .build()
            .map_err(|err| format!("probe client init failed: {err}"))?;
        Ok(Self {
            executor,
            validator,
            connector,
            sandbox,
            environment: None,
            alerts: None,
            metrics: None,
            settings,
            http,
        })
    }

    pub fn with_environment(mut self, environment: Arc<dyn EnvironmentControl>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_alerts(mut self, alerts: AlertManager) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn run(&self, kind: DrTestKind) -> DrTestRun {
        let mut run = DrTestRun::new(kind, Utc::now());
        run.environment = self.fingerprint(kind);
        let mut scope = SandboxScope::new(self.sandbox.clone());
        let mut stopped: Option<String> = None;

        advance(&mut run, DrRunState::Provisioning);
        let (prepared, mut checks) =
            match AssertUnwindSafe(self.prepare(kind, run.id, &mut scope))
                .catch_unwind()
                .await
            {
                Ok(prepared) => prepared,
                Err(panic) => (Prepared::default(), vec![panic_check("provision", panic)]),
            };

        advance(&mut run, DrRunState::Running);
        match AssertUnwindSafe(self.execute(kind, prepared, &mut stopped))
            .catch_unwind()
            .await
        {
            Ok(mut executed) => checks.append(&mut executed),
            Err(panic) => checks.push(panic_check("running", panic)),
        }
        run.checks = checks;
        let outcome = if run.all_checks_passed() {
            DrRunState::Passed
        } else {
            DrRunState::Failed
        };
        advance(&mut run, outcome);

        let failures = self.teardown(&mut scope, stopped).await;
        run.teardown_errors = failures.iter().map(ToString::to_string).collect();
        advance(&mut run, DrRunState::TornDown);
        run.finished_at = Some(Utc::now());
        self.finish(&run).await;
        run
    }

    async fn teardown(
        &self,
        scope: &mut SandboxScope,
        stopped: Option<String>,
    ) -> Vec<EnvironmentFailure> {
        let mut failures = Vec::new();
        if let (Some(component), Some(environment)) = (stopped, &self.environment) {
            if let Err(err) = environment.start(&component).await {
                failures.push(err);
            }
        }
        failures.extend(scope.release_all().await);
        for failure in &failures {
            tracing::warn!(error = %failure, "drill teardown step failed");
        }
        failures
    }

    async fn finish(&self, run: &DrTestRun) {
        let result = if run.passed() { "passed" } else { "failed" };
        if let Some(metrics) = &self.metrics {
            metrics
                .dr_runs
                .with_label_values(&[run.kind.as_str(), result])
                .inc();
        }
        if run.passed() {
            tracing::info!(run = %run.id, kind = run.kind.as_str(), checks = run.checks.len(), "drill passed");
            return;
        }
        let failed: Vec<&str> = run
            .checks
            .iter()
            .filter(|check| check.outcome == CheckOutcome::Failed)
            .map(|check| check.name.as_str())
            .collect();
        tracing::error!(run = %run.id, kind = run.kind.as_str(), failed = ?failed, "drill failed");
        if let Some(alerts) = &self.alerts {
            let alert = Alert::new(
                Severity::Critical,
                &format!("dr:{}", run.kind.as_str()),
                AlertCategory::DrDrill,
                format!("{} drill failed: {}", run.kind.as_str(), failed.join(", ")),
                Utc::now(),
            );
            alerts.raise(alert).await;
        }
    }

    fn fingerprint(&self, kind: DrTestKind) -> BTreeMap<String, String> {
        let mut fingerprint = BTreeMap::new();
        fingerprint.insert("kind".to_string(), kind.as_str().to_string());
        fingerprint.insert(
            "version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        if let Ok(host) = std::env::var("HOSTNAME") {
            fingerprint.insert("host".to_string(), host);
        }
        fingerprint.insert(
            "healthEndpoints".to_string(),
            self.settings.health_endpoints.len().to_string(),
        );
        fingerprint.insert(
            "services".to_string(),
            self.executor.service_names().join(","),
        );
        if let Some(environment) = &self.environment {
            fingerprint.extend(environment.fingerprint());
        }
        fingerprint
    }

    async fn prepare(
        &self,
        kind: DrTestKind,
        run_id: Uuid,
        scope: &mut SandboxScope,
    ) -> (Prepared, Vec<DrCheck>) {
        let mut prepared = Prepared::default();
        let mut checks = Vec::new();
        if kind != DrTestKind::Restore {
            return (prepared, checks);
        }
        let run_dir = self
            .executor
            .catalog()
            .work_dir()
            .join(format!("drill-{}", run_id.simple()));
        scope.track_dir(run_dir.clone());
        for name in self.restore_targets() {
            let started = Instant::now();
            match self.stage_one(&name, run_id, &run_dir, scope).await {
                Ok(staged) => {
                    checks.push(finished(
                        format!("provision:{name}"),
                        CheckOutcome::Passed,
                        format!("staged {}", staged.artifact.name),
                        started,
                    ));
                    prepared.restores.push(staged);
                }
                Err(detail) => checks.push(finished(
                    format!("provision:{name}"),
                    CheckOutcome::Failed,
                    detail,
                    started,
                )),
            }
        }
        if prepared.restores.is_empty() && checks.is_empty() {
            checks.push(finished(
                "provision",
                CheckOutcome::Failed,
                "no restorable services configured",
                Instant::now(),
            ));
        }
        (prepared, checks)
    }

    fn restore_targets(&self) -> Vec<String> {
        if !self.settings.restore_services.is_empty() {
            return self.settings.restore_services.clone();
        }
        self.executor
            .service_names()
            .into_iter()
            .filter(|name| {
                self.executor.service(name).is_some_and(|config| {
                    config.engine == EngineKind::Volume || config.sandbox.is_some()
                })
            })
            .collect()
    }

    async fn stage_one(
        &self,
        name: &str,
        run_id: Uuid,
        run_dir: &std::path::Path,
        scope: &mut SandboxScope,
    ) -> Result<StagedRestore, String> {
        let service = self
            .executor
            .service(name)
            .cloned()
            .ok_or_else(|| format!("service '{name}' is not configured"))?;
        let artifact = self
            .executor
            .catalog()
            .restore_candidates(name, None)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| "no validated artifact to restore".to_string())?;
        let data_dir = run_dir.join(name);
        self.executor
            .stage_restore(&artifact, &data_dir)
            .await
            .map_err(|err| err.to_string())?;
        let endpoint = if service.engine == EngineKind::Volume {
            None
        } else {
            let spec = service
                .sandbox
                .as_ref()
                .ok_or_else(|| format!("service '{name}' has no sandbox spec"))?;
            let lease = scope
                .provider()
                .provision(run_id, &service, spec, &data_dir)
                .await
                .map_err(|err| err.to_string())?;
            let endpoint = lease.endpoint.clone();
            scope.track(lease);
            Some(endpoint)
        };
        Ok(StagedRestore {
            service,
            artifact,
            data_dir,
            endpoint,
        })
    }

    async fn execute(
        &self,
        kind: DrTestKind,
        prepared: Prepared,
        stopped: &mut Option<String>,
    ) -> Vec<DrCheck> {
        match kind {
            DrTestKind::Backup => self.verify_backups().await,
            DrTestKind::Restore => self.verify_restores(prepared).await,
            DrTestKind::Failover => self.simulate_failover(stopped).await,
            DrTestKind::FullDr => self.simulate_full_dr().await,
        }
    }

    async fn verify_backups(&self) -> Vec<DrCheck> {
        let mut checks = Vec::new();
        for name in self.executor.service_names() {
            let check = timed(format!("backup:{name}"), self.verify_backup(&name)).await;
            checks.push(check);
        }
        if checks.is_empty() {
            checks.push(finished("backup", CheckOutcome::Failed, "no services configured", Instant::now()));
        }
        checks
    }

    async fn verify_backup(&self, service: &str) -> (CheckOutcome, String) {
        let latest = match self.executor.catalog().latest_validated(service, None).await {
            Ok(Some(latest)) => latest,
            Ok(None) => return (CheckOutcome::Failed, "no validated artifact".to_string()),
            Err(err) => return (CheckOutcome::Failed, err),
        };
        let age = latest.age_hours(Utc::now());
        if age > self.settings.max_age_hours {
            return (
                CheckOutcome::Failed,
                format!(
                    "latest validated artifact is {age:.1}h old (limit {:.1}h)",
                    self.settings.max_age_hours
                ),
            );
        }
        match self.validator.validate(&latest).await {
            Verdict::Valid => (
                CheckOutcome::Passed,
                format!("{} is {age:.1}h old and intact", latest.name),
            ),
            Verdict::Invalid(failure) => (CheckOutcome::Failed, failure.to_string()),
        }
    }

    async fn verify_restores(&self, prepared: Prepared) -> Vec<DrCheck> {
        let mut checks = Vec::new();
        for staged in prepared.restores {
            let name = format!("restore:{}", staged.service.name);
            checks.push(timed(name, self.verify_restore(&staged)).await);
        }
        checks
    }

    async fn verify_restore(&self, staged: &StagedRestore) -> (CheckOutcome, String) {
        let engine = match &staged.endpoint {
            None => EngineHandle::Volume(VolumeSource::new(staged.data_dir.clone())),
            Some(endpoint) => match self.connector.connect(&staged.service, Some(endpoint)).await {
                Ok(engine) => engine,
                Err(err) => return (CheckOutcome::Failed, format!("sandbox connect failed: {err}")),
            },
        };
        match self
            .executor
            .complete_restore(&staged.artifact, &engine, &staged.data_dir)
            .await
        {
            Ok((count, item_kind)) if count > 0 => (
                CheckOutcome::Passed,
                format!("{count} {item_kind} restored from {}", staged.artifact.name),
            ),
            Ok((_, item_kind)) => (
                CheckOutcome::Failed,
                format!("restored instance holds 0 {item_kind}"),
            ),
            Err(err) => (CheckOutcome::Failed, err.to_string()),
        }
    }

    async fn simulate_failover(&self, stopped: &mut Option<String>) -> Vec<DrCheck> {
        let mut checks = Vec::new();
        let (Some(environment), Some(primary)) =
            (&self.environment, self.settings.primary_component.clone())
        else {
            checks.push(finished(
                "failover",
                CheckOutcome::Failed,
                "failover drill needs an environment and a primary component",
                Instant::now(),
            ));
            return checks;
        };

        let started = Instant::now();
        let baseline = self.availability().await;
        let baseline_ok = baseline.total > 0 && baseline.ratio() >= self.settings.availability_threshold;
        checks.push(finished(
            "baseline",
            if baseline_ok { CheckOutcome::Passed } else { CheckOutcome::Failed },
            baseline.describe(),
            started,
        ));
        if !baseline_ok {
            return checks;
        }

        let started = Instant::now();
        if let Err(err) = environment.stop(&primary).await {
            checks.push(finished(format!("stop:{primary}"), CheckOutcome::Failed, err.to_string(), started));
            return checks;
        }
        *stopped = Some(primary.clone());
        checks.push(finished(format!("stop:{primary}"), CheckOutcome::Passed, "stopped", started));

        let outage = Instant::now();
        let automatic = self.wait_for_availability(self.settings.failover_wait).await;
        let (outcome, detail) = match automatic {
            Ok(observed) => (
                within_target(outage.elapsed(), self.settings.recovery_target),
                format!(
                    "automatic recovery in {:.1}s, {}",
                    outage.elapsed().as_secs_f64(),
                    observed.describe()
                ),
            ),
            Err(_) => {
                tracing::warn!(component = %primary, "no automatic recovery, starting explicitly");
                match environment.start(&primary).await {
                    Err(err) => (CheckOutcome::Failed, format!("explicit recovery failed: {err}")),
                    Ok(()) => {
                        *stopped = None;
                        let remaining = self
                            .settings
                            .recovery_target
                            .saturating_sub(outage.elapsed())
                            .max(self.settings.poll_interval);
                        match self.wait_for_availability(remaining).await {
                            Ok(observed) => (
                                within_target(outage.elapsed(), self.settings.recovery_target),
                                format!(
                                    "explicit recovery in {:.1}s, {}",
                                    outage.elapsed().as_secs_f64(),
                                    observed.describe()
                                ),
                            ),
                            Err(observed) => (
                                CheckOutcome::Failed,
                                format!("not recovered within target, {}", observed.describe()),
                            ),
                        }
                    }
                }
            }
        };
        checks.push(DrCheck {
            name: "recovery".to_string(),
            outcome,
            duration_ms: outage.elapsed().as_millis() as u64,
            detail,
        });
        checks
    }

    async fn simulate_full_dr(&self) -> Vec<DrCheck> {
        let mut checks = Vec::new();
        let Some(environment) = &self.environment else {
            checks.push(finished(
                "full_dr",
                CheckOutcome::Failed,
                "full DR drill needs an environment",
                Instant::now(),
            ));
            return checks;
        };

        checks.push(
            timed("assess:before", async {
                match environment.assess().await {
                    Ok(assessment) => (CheckOutcome::Passed, assessment.summary()),
                    Err(err) => (CheckOutcome::Failed, err.to_string()),
                }
            })
            .await,
        );
        checks.push(
            timed("teardown-environment", async {
                match environment.teardown().await {
                    Ok(()) => (CheckOutcome::Passed, "environment torn down".to_string()),
                    Err(err) => (CheckOutcome::Failed, err.to_string()),
                }
            })
            .await,
        );

        let rebuild_started = Instant::now();
        let rebuilt = environment.rebuild().await;
        checks.push(finished(
            "rebuild",
            if rebuilt.is_ok() { CheckOutcome::Passed } else { CheckOutcome::Failed },
            match &rebuilt {
                Ok(()) => "environment rebuilt".to_string(),
                Err(err) => err.to_string(),
            },
            rebuild_started,
        ));

        if self.settings.health_endpoints.is_empty() {
            checks.push(finished(
                "availability",
                CheckOutcome::Failed,
                "no health endpoints configured",
                Instant::now(),
            ));
        } else {
            let remaining = self
                .settings
                .rebuild_timeout
                .saturating_sub(rebuild_started.elapsed())
                .max(self.settings.poll_interval);
            let (outcome, detail) = match self.wait_for_availability(remaining).await {
                Ok(observed) => (
                    CheckOutcome::Passed,
                    format!(
                        "{} available {:.1}s after rebuild",
                        observed.describe(),
                        rebuild_started.elapsed().as_secs_f64()
                    ),
                ),
                Err(observed) => (
                    CheckOutcome::Failed,
                    format!(
                        "{} available, below {:.1}% within {}s",
                        observed.describe(),
                        self.settings.availability_threshold * 100.0,
                        self.settings.rebuild_timeout.as_secs()
                    ),
                ),
            };
            checks.push(finished("availability", outcome, detail, rebuild_started));
        }

        checks.push(
            timed("assess:after", async {
                match environment.assess().await {
                    Ok(assessment) if assessment.running() == assessment.components.len() => {
                        (CheckOutcome::Passed, assessment.summary())
                    }
                    Ok(assessment) => (CheckOutcome::Warning, assessment.summary()),
                    Err(err) => (CheckOutcome::Warning, err.to_string()),
                }
            })
            .await,
        );
        checks
    }

    async fn probe(&self, url: &str) -> bool {
        match self.http.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!(endpoint = %url, error = %err, "health probe failed");
                false
            }
        }
    }

    async fn availability(&self) -> Availability {
        let results = join_all(
            self.settings
                .health_endpoints
                .iter()
                .map(|url| self.probe(url)),
        )
        .await;
        Availability {
            healthy: results.iter().filter(|healthy| **healthy).count(),
            total: results.len(),
        }
    }

    /// Polls the health endpoints until availability reaches the threshold.
    /// The error carries the last observation.
    async fn wait_for_availability(&self, max_wait: Duration) -> Result<Availability, Availability> {
        let settings = PollSettings::fixed(self.settings.poll_interval, max_wait);
        let threshold = self.settings.availability_threshold;
        let last = std::sync::Mutex::new(Availability { healthy: 0, total: 0 });
        let last_ref = &last;
        let result = poll_until(settings, move || async move {
            let observed = self.availability().await;
            if let Ok(mut slot) = last_ref.lock() {
                *slot = observed;
            }
            if observed.total > 0 && observed.ratio() >= threshold {
                Ok(Some(observed))
            } else {
                Ok(None)
            }
        })
        .await;
        let last_seen = last
            .lock()
            .map(|slot| *slot)
            .unwrap_or(Availability { healthy: 0, total: 0 });
        match result {
            Ok(observed) => Ok(observed),
            Err(PollError::Timeout { .. }) | Err(PollError::Probe(_)) => Err(last_seen),
        }
    }
}

fn advance(run: &mut DrTestRun, next: DrRunState) {
    if let Err(err) = run.transition(next) {
        tracing::error!(run = %run.id, error = %err, "drill state machine rejected transition");
    }
}

fn within_target(elapsed: Duration, target: Duration) -> CheckOutcome {
    if elapsed <= target {
        CheckOutcome::Passed
    } else {
        CheckOutcome::Failed
    }
}

fn finished(
    name: impl Into<String>,
    outcome: CheckOutcome,
    detail: impl Into<String>,
    started: Instant,
) -> DrCheck {
    DrCheck {
        name: name.into(),
        outcome,
        duration_ms: started.elapsed().as_millis() as u64,
        detail: detail.into(),
    }
}

async fn timed<F>(name: impl Into<String>, check: F) -> DrCheck
where
    F: Future<Output = (CheckOutcome, String)>,
{
    let started = Instant::now();
    let (outcome, detail) = check.await;
    finished(name, outcome, detail, started)
}

fn panic_check(phase: &str, panic: Box<dyn Any + Send>) -> DrCheck {
    let message = panic
        .downcast_ref::<&str>()
        .map(|msg| msg.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(phase, error = %message, "drill step panicked");
    DrCheck {
        name: format!("{phase}:exception"),
        outcome: CheckOutcome::Failed,
        duration_ms: 0,
        detail: message,
    }
}

#[cfg(test)]
mod tests {
    use super::{DrHarness, DrillSettings};
    use crate::backup::{BackupExecutor, EngineConnector, EngineHandle};
    use crate::meta::catalog::ArtifactCatalog;
    use crate::meta::models::{CheckOutcome, DrRunState, DrTestKind};
    use crate::test_support::{self, FakeEnvironment, FakeSandbox};
    use crate::validate::IntegrityValidator;
    use async_trait::async_trait;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;
    use std::time::Duration;

    struct PanickingConnector;

    #[async_trait]
    impl EngineConnector for PanickingConnector {
        async fn connect(
            &self,
            _service: &crate::util::config::ServiceConfig,
            _endpoint: Option<&str>,
        ) -> Result<EngineHandle, String> {
            panic!("sandbox engine exploded");
        }
    }

    fn health_app(environment: Arc<FakeEnvironment>, needs: &'static [&'static str]) -> Router {
        Router::new()
            .route(
                "/health",
                get(move |State(env): State<Arc<FakeEnvironment>>| async move {
                    if needs.iter().all(|component| env.is_running(component)) {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }),
            )
            .with_state(environment)
    }

    fn settings(endpoints: Vec<String>) -> DrillSettings {
        DrillSettings {
            health_endpoints: endpoints,
            restore_services: Vec::new(),
            primary_component: Some("postgres".to_string()),
            failover_wait: Duration::from_millis(200),
            recovery_target: Duration::from_secs(5),
            rebuild_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(1),
            availability_threshold: 0.95,
            poll_interval: Duration::from_millis(20),
            max_age_hours: 24.0,
        }
    }

    fn harness(
        executor: BackupExecutor,
        connector: Arc<dyn EngineConnector>,
        sandbox: Arc<FakeSandbox>,
        endpoints: Vec<String>,
    ) -> DrHarness {
        DrHarness::new(
            Arc::new(executor),
            IntegrityValidator::new(),
            connector,
            sandbox,
            settings(endpoints),
        )
        .expect("harness")
    }

    #[tokio::test]
    async fn backup_drill_fails_without_artifacts_and_still_tears_down() {
        let dirs = test_support::TempDirs::new();
        let source = dirs.scratch("files-src");
        let mut executor = BackupExecutor::new(
            ArtifactCatalog::new(dirs.base()),
            test_support::executor_settings(),
        );
        executor.register(
            test_support::volume_service("files", "bulk", &source),
            EngineHandle::Volume(crate::backup::volume::VolumeSource::new(source.clone())),
        );
        let sandbox = Arc::new(FakeSandbox::default());
        let harness = harness(executor, Arc::new(PanickingConnector), sandbox, Vec::new());
        let run = harness.run(DrTestKind::Backup).await;
        assert_eq!(run.outcome, Some(DrRunState::Failed));
        assert_eq!(run.state, DrRunState::TornDown);
        assert_eq!(run.checks[0].name, "backup:files");
        assert_eq!(run.checks[0].outcome, CheckOutcome::Failed);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn volume_restore_drill_passes() {
        let dirs = test_support::TempDirs::new();
        let source = dirs.scratch("files-src");
        std::fs::write(source.join("a.txt"), test_support::noisy_bytes(4096)).expect("write");
        let catalog = ArtifactCatalog::new(dirs.base());
        let mut executor = BackupExecutor::new(catalog.clone(), test_support::executor_settings());
        executor.register(
            test_support::volume_service("files", "bulk", &source),
            EngineHandle::Volume(crate::backup::volume::VolumeSource::new(source.clone())),
        );
        let mut artifact = executor
            .produce("files", crate::meta::models::StrategyKind::VolumeArchive)
            .await
            .expect("produce");
        IntegrityValidator::new()
            .validate_and_record(&catalog, &mut artifact)
            .await
            .expect("validate");

        let sandbox = Arc::new(FakeSandbox::default());
        let harness = harness(executor, Arc::new(PanickingConnector), sandbox.clone(), Vec::new());
        let run = harness.run(DrTestKind::Restore).await;
        assert!(run.passed(), "checks: {:?}", run.checks);
        assert_eq!(run.state, DrRunState::TornDown);
        let restore = run
            .checks
            .iter()
            .find(|check| check.name == "restore:files")
            .expect("restore check");
        assert!(restore.detail.starts_with("1 files restored"));
        assert_eq!(sandbox.active(), 0);
        assert!(!catalog.work_dir().join(format!("drill-{}", run.id.simple())).exists());
    }

    #[tokio::test]
    async fn exception_during_running_still_releases_sandboxes() {
        let dirs = test_support::TempDirs::new();
        let catalog = ArtifactCatalog::new(dirs.base());
        let mut executor = BackupExecutor::new(catalog.clone(), test_support::executor_settings());
        let mut service = test_support::keyvalue_service("cache", "caches");
        service.sandbox = Some(test_support::sandbox_spec());
        executor.register(service, test_support::memory_keyvalue_engine(&dirs.scratch("cache-data")));
        crate::meta::catalog::tests::seed_artifact(
            &catalog,
            "cache",
            "caches",
            crate::meta::models::StrategyKind::Snapshot,
            chrono::Utc::now(),
            crate::meta::models::Validity::Validated,
            &test_support::rdb_bytes(b"restore-me"),
        )
        .await;

        let sandbox = Arc::new(FakeSandbox::default());
        let harness = harness(executor, Arc::new(PanickingConnector), sandbox.clone(), Vec::new());
        let run = harness.run(DrTestKind::Restore).await;
        assert_eq!(run.outcome, Some(DrRunState::Failed));
        assert_eq!(run.state, DrRunState::TornDown);
        assert_eq!(sandbox.provisioned(), 1);
        assert_eq!(sandbox.active(), 0);
        let exception = run
            .checks
            .iter()
            .find(|check| check.name == "running:exception")
            .expect("exception check");
        assert!(exception.detail.contains("sandbox engine exploded"));
    }

    #[tokio::test]
    async fn failover_falls_back_to_explicit_recovery() {
        let environment = Arc::new(FakeEnvironment::new(&["postgres", "redis"]));
        let (base_url, server) =
            test_support::spawn_http(health_app(environment.clone(), &["postgres"])).await;
        let dirs = test_support::TempDirs::new();
        let executor = BackupExecutor::new(
            ArtifactCatalog::new(dirs.base()),
            test_support::executor_settings(),
        );
        let harness = harness(
            executor,
            Arc::new(PanickingConnector),
            Arc::new(FakeSandbox::default()),
            vec![format!("{base_url}/health")],
        )
        .with_environment(environment.clone());
        let run = harness.run(DrTestKind::Failover).await;
        server.shutdown().await;
        assert!(run.passed(), "checks: {:?}", run.checks);
        let recovery = run
            .checks
            .iter()
            .find(|check| check.name == "recovery")
            .expect("recovery");
        assert!(recovery.detail.starts_with("explicit recovery"));
        assert!(environment.is_running("postgres"));
        assert_eq!(run.state, DrRunState::TornDown);
    }

    #[tokio::test]
    async fn full_dr_rebuilds_and_measures_availability() {
        let environment = Arc::new(FakeEnvironment::new(&["postgres", "redis", "mongo"]));
        let (base_url, server) = test_support::spawn_http(health_app(
            environment.clone(),
            &["postgres", "redis", "mongo"],
        ))
        .await;
        let dirs = test_support::TempDirs::new();
        let executor = BackupExecutor::new(
            ArtifactCatalog::new(dirs.base()),
            test_support::executor_settings(),
        );
        let harness = harness(
            executor,
            Arc::new(PanickingConnector),
            Arc::new(FakeSandbox::default()),
            vec![format!("{base_url}/health"), format!("{base_url}/health")],
        )
        .with_environment(environment.clone());
        let run = harness.run(DrTestKind::FullDr).await;
        server.shutdown().await;
        assert!(run.passed(), "checks: {:?}", run.checks);
        assert_eq!(environment.rebuilds(), 1);
        let availability = run
            .checks
            .iter()
            .find(|check| check.name == "availability")
            .expect("availability");
        assert!(availability.detail.starts_with("100.0% (2/2)"));
        let names: Vec<&str> = run.checks.iter().map(|check| check.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["assess:before", "teardown-environment", "rebuild", "availability", "assess:after"]
        );
    }

    #[tokio::test]
    async fn failover_without_environment_fails_cleanly() {
        let dirs = test_support::TempDirs::new();
        let executor = BackupExecutor::new(
            ArtifactCatalog::new(dirs.base()),
            test_support::executor_settings(),
        );
        let harness = harness(
            executor,
            Arc::new(PanickingConnector),
            Arc::new(FakeSandbox::default()),
            Vec::new(),
        );
        let run = harness.run(DrTestKind::Failover).await;
        assert_eq!(run.outcome, Some(DrRunState::Failed));
        assert_eq!(run.state, DrRunState::TornDown);
        assert_eq!(run.checks.len(), 1);
    }
}
