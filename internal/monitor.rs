use crate::alerts::AlertManager;
use crate::errors::ThresholdBreach;
use crate::meta::catalog::ArtifactCatalog;
use crate::meta::models::{
    AlertCategory, BackupArtifact, HealthCheckResult, Severity, Validity,
};
use crate::obs::Metrics;
use crate::replication::{CategorySync, ReconciliationResult};
use crate::util::config::{Config, ServiceConfig};
use crate::util::storage_volume::path_usage;
use crate::validate::{IntegrityValidator, Verdict};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const STORAGE_SERVICE_LABEL: &str = "backup-storage";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MonitorThresholds {
    pub max_age_hours: f64,
    pub critical_age_factor: f64,
    /// Fraction in `0.0..=1.0`.
    pub pass_rate: f64,
    pub sample_window: usize,
    pub min_samples: usize,
    pub storage_warning_percent: f64,
    pub storage_critical_percent: f64,
    pub drift_warning: f64,
    pub drift_critical: f64,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            max_age_hours: 24.0,
            critical_age_factor: 1.5,
            pass_rate: 0.85,
            sample_window: 20,
            min_samples: 5,
            storage_warning_percent: 80.0,
            storage_critical_percent: 90.0,
            drift_warning: 0.10,
            drift_critical: 0.25,
        }
    }
}

impl MonitorThresholds {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_age_hours: config.max_age_hours,
            pass_rate: config.integrity_pass_rate,
            ..Self::default()
        }
    }
}

/// A secondary indicator folded into a monitor cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub name: String,
    pub severity: Severity,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq)]
struct SampleStats {
    passed: usize,
    total: usize,
}

impl SampleStats {
    fn from_history(artifacts: &[BackupArtifact], window: usize) -> Self {
        let decided = artifacts
            .iter()
            .filter(|artifact| artifact.validity != Validity::Created)
            .take(window);
        let mut stats = Self { passed: 0, total: 0 };
        for artifact in decided {
            stats.total += 1;
            if artifact.validity == Validity::Validated {
                stats.passed += 1;
            }
        }
        stats
    }

    fn rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.passed as f64 / self.total as f64
    }
}

/// Scores recency and integrity of each service's artifacts and raises graded
/// alerts through the dedupe window.
pub struct HealthMonitor {
    catalog: ArtifactCatalog,
    validator: IntegrityValidator,
    alerts: AlertManager,
    thresholds: MonitorThresholds,
    services: BTreeMap<String, ServiceConfig>,
    metrics: Option<Arc<Metrics>>,
}

impl HealthMonitor {
    pub fn new(
        catalog: ArtifactCatalog,
        validator: IntegrityValidator,
        alerts: AlertManager,
        thresholds: MonitorThresholds,
    ) -> Self {
        Self {
            catalog,
            validator,
            alerts,
            thresholds,
            services: BTreeMap::new(),
            metrics: None,
        }
    }

    pub fn with_services(mut self, services: &[ServiceConfig]) -> Self {
        self.services = services
            .iter()
            .map(|service| (service.name.clone(), service.clone()))
            .collect();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn thresholds(&self) -> &MonitorThresholds {
        &self.thresholds
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    /// Freshness limit for a service: the global maximum, stretched to the
    /// shortest schedule when the service is backed up less often than that.
    pub fn max_age_hours(&self, service: &str) -> f64 {
        let scheduled = self.services.get(service).and_then(|config| {
            config
                .strategies
                .iter()
                .filter_map(|entry| entry.schedule.period())
                .min()
        });
        match scheduled {
            Some(period) => self
                .thresholds
                .max_age_hours
                .max(period.num_minutes() as f64 / 60.0),
            None => self.thresholds.max_age_hours,
        }
    }

    pub async fn check_service(
        &self,
        service: &str,
        now: DateTime<Utc>,
    ) -> Result<HealthCheckResult, String> {
        let mut history = self.catalog.list_service(service).await?;
        let spot_check = self.spot_check(&mut history).await?;
        let stats = SampleStats::from_history(&history, self.thresholds.sample_window);
        let latest = history
            .iter()
            .find(|artifact| artifact.validity == Validity::Validated);
        let age_hours = latest.map(|artifact| artifact.age_hours(now));

        let breaches = self.evaluate(service, age_hours, spot_check, &stats);
        let severity = breaches
            .iter()
            .map(|breach| breach.level)
            .max()
            .unwrap_or(Severity::Ok);
        for breach in &breaches {
            self.alerts.raise_breach(breach, now).await;
        }

        if let Some(metrics) = &self.metrics {
            if let Some(hours) = age_hours {
                metrics
                    .artifact_age
                    .with_label_values(&[service])
                    .set(hours * 3600.0);
            }
            metrics
                .integrity_pass_rate
                .with_label_values(&[service])
                .set(stats.rate());
        }
        tracing::info!(
            service = %service,
            severity = severity.as_str(),
            age_hours = age_hours.unwrap_or(-1.0),
            pass_rate = stats.rate(),
            samples = stats.total,
            "health checked"
        );
        Ok(HealthCheckResult {
            service: service.to_string(),
            timestamp: now,
            age_hours,
            integrity_sample_pass_rate: stats.rate(),
            severity,
            findings: breaches.iter().map(ToString::to_string).collect(),
        })
    }

    /// Re-inspects the newest artifact. Returns `None` when the service has
    /// no artifacts at all.
    async fn spot_check(&self, history: &mut [BackupArtifact]) -> Result<Option<bool>, String> {
        let Some(newest) = history.first_mut() else {
            return Ok(None);
        };
        if newest.validity == Validity::Invalid {
            return Ok(Some(false));
        }
        let verdict = self
            .validator
            .validate_and_record(&self.catalog, newest)
            .await?;
        Ok(Some(matches!(verdict, Verdict::Valid)))
    }

    fn evaluate(
        &self,
        service: &str,
        age_hours: Option<f64>,
        spot_check: Option<bool>,
        stats: &SampleStats,
    ) -> Vec<ThresholdBreach> {
        let max_age = self.max_age_hours(service);
        let mut breaches = Vec::new();
        match age_hours {
            None => breaches.push(ThresholdBreach {
                service: service.to_string(),
                category: AlertCategory::MissingBackup,
                level: Severity::Critical,
                observed: 0.0,
                limit: 1.0,
                message: "no validated artifact".to_string(),
            }),
            Some(age) => {
                let critical_age = max_age * self.thresholds.critical_age_factor;
                let level = if age > critical_age {
                    Some((Severity::Critical, critical_age))
                } else if age > max_age {
                    Some((Severity::Warning, max_age))
                } else {
                    None
                };
                if let Some((level, limit)) = level {
                    breaches.push(ThresholdBreach {
                        service: service.to_string(),
                        category: AlertCategory::Staleness,
                        level,
                        observed: age,
                        limit,
                        message: format!("latest validated artifact is {age:.1}h old"),
                    });
                }
            }
        }

        let rate_breached =
            stats.total >= self.thresholds.min_samples && stats.rate() < self.thresholds.pass_rate;
        if rate_breached {
            breaches.push(ThresholdBreach {
                service: service.to_string(),
                category: AlertCategory::Integrity,
                level: Severity::Critical,
                observed: stats.rate(),
                limit: self.thresholds.pass_rate,
                message: format!(
                    "{} of {} recent artifacts passed integrity checks",
                    stats.passed, stats.total
                ),
            });
        } else if spot_check == Some(false) {
            breaches.push(ThresholdBreach {
                service: service.to_string(),
                category: AlertCategory::Integrity,
                level: Severity::Warning,
                observed: stats.rate(),
                limit: self.thresholds.pass_rate,
                message: "newest artifact failed its integrity spot-check".to_string(),
            });
        }
        breaches
    }

    /// Utilisation of the volume holding the artifact base directory.
    pub async fn check_storage(&self, now: DateTime<Utc>) -> Option<Signal> {
        let base = self.catalog.base_dir().to_path_buf();
        let usage = tokio::task::spawn_blocking(move || path_usage(&base))
            .await
            .ok()
            .flatten()?;
        Some(self.storage_signal(usage.used_percent(), now).await)
    }

    pub async fn storage_signal(&self, used_percent: f64, now: DateTime<Utc>) -> Signal {
        let path = self.catalog.base_dir().display().to_string();
        if let Some(metrics) = &self.metrics {
            metrics
                .storage_used
                .with_label_values(&[path.as_str()])
                .set(used_percent);
        }
        let graded = if used_percent >= self.thresholds.storage_critical_percent {
            Some((Severity::Critical, self.thresholds.storage_critical_percent))
        } else if used_percent >= self.thresholds.storage_warning_percent {
            Some((Severity::Warning, self.thresholds.storage_warning_percent))
        } else {
            None
        };
        let detail = format!("{path} is {used_percent:.1}% full");
        if let Some((level, limit)) = graded {
            let breach = ThresholdBreach {
                service: STORAGE_SERVICE_LABEL.to_string(),
                category: AlertCategory::StorageUtilization,
                level,
                observed: used_percent,
                limit,
                message: detail.clone(),
            };
            self.alerts.raise_breach(&breach, now).await;
        }
        Signal {
            name: "storage:utilization".to_string(),
            severity: graded.map(|(level, _)| level).unwrap_or(Severity::Ok),
            detail,
        }
    }

    /// Grades each region of a finished sync: a failed region is a warning,
    /// object-count drift is graded against the drift thresholds.
    pub async fn check_replication(&self, sync: &CategorySync, now: DateTime<Utc>) -> Vec<Signal> {
        let mut signals = Vec::new();
        for result in &sync.results {
            let target = format!("{}@{}", sync.category, result.region);
            if let Some(error) = &result.error {
                let breach = ThresholdBreach {
                    service: target.clone(),
                    category: AlertCategory::Replication,
                    level: Severity::Warning,
                    observed: 1.0,
                    limit: 0.0,
                    message: format!("sync failed, retrying next cycle: {error}"),
                };
                self.alerts.raise_breach(&breach, now).await;
                signals.push(Signal {
                    name: format!("replication:{target}"),
                    severity: Severity::Warning,
                    detail: error.clone(),
                });
                continue;
            }
            signals.push(
                self.drift_signal(&target, result.primary_count, result.secondary_count, now)
                    .await,
            );
        }
        signals
    }

    pub async fn check_reconciliation(
        &self,
        reconciliation: &ReconciliationResult,
        now: DateTime<Utc>,
    ) -> Vec<Signal> {
        let mut signals = Vec::new();
        for entry in &reconciliation.entries {
            let target = format!("{}@{}", entry.category, reconciliation.region);
            signals.push(
                self.drift_signal(&target, entry.primary, entry.secondary, now)
                    .await,
            );
        }
        signals
    }

    async fn drift_signal(
        &self,
        target: &str,
        primary: u64,
        secondary: u64,
        now: DateTime<Utc>,
    ) -> Signal {
        let drift = crate::replication::drift(primary, secondary);
        let graded = if drift > self.thresholds.drift_critical {
            Some((Severity::Critical, self.thresholds.drift_critical))
        } else if drift > self.thresholds.drift_warning {
            Some((Severity::Warning, self.thresholds.drift_warning))
        } else {
            None
        };
        let detail = format!(
            "primary {primary} vs secondary {secondary} ({:.1}% drift)",
            drift * 100.0
        );
        if let Some((level, limit)) = graded {
            let breach = ThresholdBreach {
                service: target.to_string(),
                category: AlertCategory::ReplicationDrift,
                level,
                observed: drift,
                limit,
                message: detail.clone(),
            };
            self.alerts.raise_breach(&breach, now).await;
        }
        Signal {
            name: format!("replication:{target}"),
            severity: graded.map(|(level, _)| level).unwrap_or(Severity::Ok),
            detail,
        }
    }
}
