use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Relational,
    KeyValue,
    Document,
    Volume,
}

impl EngineKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "relational" | "postgres" => Some(Self::Relational),
            "key_value" | "keyvalue" | "redis" => Some(Self::KeyValue),
            "document" | "mongo" => Some(Self::Document),
            "volume" | "files" => Some(Self::Volume),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::KeyValue => "key_value",
            Self::Document => "document",
            Self::Volume => "volume",
        }
    }

    pub fn strategies(self) -> &'static [StrategyKind] {
        match self {
            Self::Relational => &[StrategyKind::BaseBackup, StrategyKind::LogArchive],
            Self::KeyValue => &[
                StrategyKind::Snapshot,
                StrategyKind::AppendLogRewrite,
                StrategyKind::KeyspaceExport,
            ],
            Self::Document => &[StrategyKind::LogicalDump],
            Self::Volume => &[StrategyKind::VolumeArchive],
        }
    }

    pub fn supports(self, strategy: StrategyKind) -> bool {
        self.strategies().contains(&strategy)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    BaseBackup,
    LogArchive,
    Snapshot,
    AppendLogRewrite,
    KeyspaceExport,
    LogicalDump,
    VolumeArchive,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 7] = [
        StrategyKind::BaseBackup,
        StrategyKind::LogArchive,
        StrategyKind::Snapshot,
        StrategyKind::AppendLogRewrite,
        StrategyKind::KeyspaceExport,
        StrategyKind::LogicalDump,
        StrategyKind::VolumeArchive,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim().to_ascii_lowercase())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BaseBackup => "base_backup",
            Self::LogArchive => "log_archive",
            Self::Snapshot => "snapshot",
            Self::AppendLogRewrite => "append_log_rewrite",
            Self::KeyspaceExport => "keyspace_export",
            Self::LogicalDump => "logical_dump",
            Self::VolumeArchive => "volume_archive",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Snapshot => "rdb",
            Self::KeyspaceExport => "json.gz",
            _ => "tar.gz",
        }
    }

    /// Strategies whose artifact can seed a fresh instance on its own.
    pub fn is_restorable(self) -> bool {
        !matches!(self, Self::LogArchive)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    OnDemand,
}

impl Schedule {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "on_demand" | "manual" => Some(Self::OnDemand),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::OnDemand => "on_demand",
        }
    }

    pub fn period(self) -> Option<Duration> {
        match self {
            Self::Hourly => Some(Duration::hours(1)),
            Self::Daily => Some(Duration::days(1)),
            Self::Weekly => Some(Duration::weeks(1)),
            Self::Monthly => Some(Duration::days(30)),
            Self::OnDemand => None,
        }
    }

    /// Due once a full period has elapsed since the last success. Never-run work
    /// is due immediately; on-demand work only when forced.
    pub fn is_due(self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(period) = self.period() else {
            return false;
        };
        match last {
            None => true,
            Some(last) => now - last >= period,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Created,
    Validated,
    Invalid,
}

impl Validity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Validated => "validated",
            Self::Invalid => "invalid",
        }
    }

    pub fn can_transition_to(self, next: Validity) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Validated) | (Self::Created, Self::Invalid)
        ) || (self == Self::Validated && next == Self::Invalid)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageLocations {
    pub local_path: PathBuf,
    #[serde(default)]
    pub remote_uris: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub engine: Option<EngineKind>,
    pub tool: String,
    #[serde(default)]
    pub source_engine_version: Option<String>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupArtifact {
    pub id: Uuid,
    pub name: String,
    pub service: String,
    pub category: String,
    pub strategy: StrategyKind,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub checksum: String,
    pub validity: Validity,
    #[serde(default)]
    pub invalid_reason: Option<String>,
    #[serde(default)]
    pub validated_at: Option<DateTime<Utc>>,
    pub locations: StorageLocations,
    #[serde(flatten)]
    pub provenance: Provenance,
}

impl BackupArtifact {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        self.age(now).num_milliseconds().max(0) as f64 / 3_600_000.0
    }

    pub fn is_restore_candidate(&self) -> bool {
        self.validity == Validity::Validated && self.strategy.is_restorable()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub service_class: String,
    pub primary_max_age_days: u32,
    pub secondary_max_age_days: u32,
}

impl RetentionPolicy {
    pub fn new(
        service_class: &str,
        primary_max_age_days: u32,
        secondary_max_age_days: u32,
    ) -> Result<Self, String> {
        let policy = Self {
            service_class: service_class.to_string(),
            primary_max_age_days,
            secondary_max_age_days,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.primary_max_age_days == 0 {
            return Err(format!(
                "retention for '{}' needs primaryMaxAgeDays >= 1",
                self.service_class
            ));
        }
        if self.secondary_max_age_days < self.primary_max_age_days {
            return Err(format!(
                "retention for '{}': secondaryMaxAgeDays must be >= primaryMaxAgeDays",
                self.service_class
            ));
        }
        Ok(())
    }

    pub fn primary_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.primary_max_age_days))
    }

    pub fn secondary_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.secondary_max_age_days))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationTarget {
    pub category: String,
    pub region: String,
    pub storage_location: String,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub object_count: u64,
    pub total_size_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Staleness,
    Integrity,
    MissingBackup,
    BackupFailure,
    Replication,
    ReplicationDrift,
    StorageUtilization,
    DrDrill,
}

impl AlertCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staleness => "staleness",
            Self::Integrity => "integrity",
            Self::MissingBackup => "missing_backup",
            Self::BackupFailure => "backup_failure",
            Self::Replication => "replication",
            Self::ReplicationDrift => "replication_drift",
            Self::StorageUtilization => "storage_utilization",
            Self::DrDrill => "dr_drill",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub age_hours: Option<f64>,
    pub integrity_sample_pass_rate: f64,
    pub severity: Severity,
    #[serde(default)]
    pub findings: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrTestKind {
    Backup,
    Restore,
    Failover,
    FullDr,
}

impl DrTestKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "backup" => Some(Self::Backup),
            "restore" => Some(Self::Restore),
            "failover" => Some(Self::Failover),
            "full_dr" | "full-dr" => Some(Self::FullDr),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Failover => "failover",
            Self::FullDr => "full_dr",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrRunState {
    Pending,
    Provisioning,
    Running,
    Passed,
    Failed,
    TornDown,
}

impl DrRunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::TornDown => "torn_down",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed)
    }

    fn allows(self, next: DrRunState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Provisioning)
                | (Self::Provisioning, Self::Running)
                | (Self::Running, Self::Passed)
                | (Self::Running, Self::Failed)
                | (Self::Passed, Self::TornDown)
                | (Self::Failed, Self::TornDown)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    #[serde(rename = "pass")]
    Passed,
    #[serde(rename = "fail")]
    Failed,
    #[serde(rename = "warn")]
    Warning,
    #[serde(rename = "skip")]
    Skipped,
}

impl CheckOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "pass",
            Self::Failed => "fail",
            Self::Warning => "warn",
            Self::Skipped => "skip",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrCheck {
    pub name: String,
    pub outcome: CheckOutcome,
    pub duration_ms: u64,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrTestRun {
    pub id: Uuid,
    pub kind: DrTestKind,
    pub state: DrRunState,
    pub outcome: Option<DrRunState>,
    pub checks: Vec<DrCheck>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub teardown_errors: Vec<String>,
}

impl DrTestRun {
    pub fn new(kind: DrTestKind, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: DrRunState::Pending,
            outcome: None,
            checks: Vec::new(),
            started_at,
            finished_at: None,
            environment: BTreeMap::new(),
            teardown_errors: Vec::new(),
        }
    }

    pub fn transition(&mut self, next: DrRunState) -> Result<(), String> {
        if !self.state.allows(next) {
            return Err(format!(
                "illegal drill transition {} -> {}",
                self.state.as_str(),
                next.as_str()
            ));
        }
        if next.is_terminal() {
            self.outcome = Some(next);
        }
        self.state = next;
        Ok(())
    }

    pub fn passed(&self) -> bool {
        self.outcome == Some(DrRunState::Passed)
    }

    pub fn all_checks_passed(&self) -> bool {
        !self.checks.is_empty()
            && self
                .checks
                .iter()
                .all(|check| matches!(check.outcome, CheckOutcome::Passed | CheckOutcome::Skipped))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub level: Severity,
    pub service: String,
    pub category: AlertCategory,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub dedupe_window_seconds: u64,
}

impl Alert {
    pub fn new(
        level: Severity,
        service: &str,
        category: AlertCategory,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            service: service.to_string(),
            category,
            message: message.into(),
            timestamp,
            dedupe_window_seconds: 0,
        }
    }
}
