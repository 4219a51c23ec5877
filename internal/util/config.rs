use crate::meta::models::{EngineKind, RetentionPolicy, Schedule, StrategyKind};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub base_dir: PathBuf,
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub topology_file: PathBuf,
    pub metrics_listen: String,
    pub backup_interval: Duration,
    pub monitor_interval: Duration,
    pub replication_interval: Duration,
    pub retention_interval: Duration,
    pub tool_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_max_wait: Duration,
    pub keyspace_export_max_keys: usize,
    pub max_age_hours: f64,
    pub integrity_pass_rate: f64,
    pub alert_cooldown: Duration,
    pub alert_webhook_url: Option<String>,
    pub rabbit_url: Option<String>,
    pub log_level: String,
    pub topology: Topology,
}

impl Config {
    pub fn load() -> Result<Self, String> {
        let paths = PathsConfig::from_env()?;
        let schedules = ScheduleConfig::from_env();
        let bounds = BoundsConfig::from_env();
        let thresholds = ThresholdConfig::from_env()?;
        let sinks = SinkConfig::from_env();
        let topology = Topology::load(&paths.topology_file)?;
        let config = Self {
            base_dir: paths.base_dir,
            state_dir: paths.state_dir,
            reports_dir: paths.reports_dir,
            topology_file: paths.topology_file,
            metrics_listen: paths.metrics_listen,
            backup_interval: schedules.backup_interval,
            monitor_interval: schedules.monitor_interval,
            replication_interval: schedules.replication_interval,
            retention_interval: schedules.retention_interval,
            tool_timeout: bounds.tool_timeout,
            poll_interval: bounds.poll_interval,
            poll_max_wait: bounds.poll_max_wait,
            keyspace_export_max_keys: bounds.keyspace_export_max_keys,
            max_age_hours: thresholds.max_age_hours,
            integrity_pass_rate: thresholds.integrity_pass_rate,
            alert_cooldown: thresholds.alert_cooldown,
            alert_webhook_url: sinks.alert_webhook_url,
            rabbit_url: sinks.rabbit_url,
            log_level: sinks.log_level,
            topology,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval.is_zero() {
            return Err("BDR_POLL_INTERVAL_MS must be greater than zero".into());
        }
        if self.poll_max_wait < self.poll_interval {
            return Err("BDR_POLL_MAX_WAIT_SECONDS must cover at least one poll interval".into());
        }
        if self.keyspace_export_max_keys == 0 {
            return Err("BDR_KEYSPACE_EXPORT_MAX_KEYS must be greater than zero".into());
        }
        if let Some(url) = &self.alert_webhook_url {
            validate_http_url("BDR_ALERT_WEBHOOK_URL", url)?;
        }
        if let Some(url) = &self.rabbit_url {
            if !url.starts_with("amqp://") && !url.starts_with("amqps://") {
                return Err("BDR_RABBIT_URL must be an amqp:// or amqps:// URL".into());
            }
        }
        self.topology.validate()
    }

    pub fn cursor_file(&self) -> PathBuf {
        self.state_dir.join("replication-cursors.json")
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.topology.services.iter().find(|service| service.name == name)
    }

    pub fn category(&self, name: &str) -> Option<&CategoryConfig> {
        self.topology
            .categories
            .iter()
            .find(|category| category.name == name)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub services: Vec<ServiceConfig>,
    pub categories: Vec<CategoryConfig>,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
    #[serde(default)]
    pub drill: DrillConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    pub engine: EngineKind,
    pub category: String,
    #[serde(default)]
    pub connection: ConnectionConfig,
    pub strategies: Vec<StrategySchedule>,
    #[serde(default)]
    pub min_artifact_bytes: Option<u64>,
    #[serde(default)]
    pub sandbox: Option<SandboxSpec>,
}

impl ServiceConfig {
    pub fn scheduled(&self, strategy: StrategyKind) -> Option<Schedule> {
        self.strategies
            .iter()
            .find(|entry| entry.kind == strategy)
            .map(|entry| entry.schedule)
    }
}

/// Engine-specific connection details; each engine reads the fields it needs.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub collections: Vec<String>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategySchedule {
    pub kind: StrategyKind,
    pub schedule: Schedule,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    pub image: String,
    pub port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub data_mount: String,
    /// Endpoint template; `{host}` and `{port}` are substituted after provisioning.
    pub endpoint: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryConfig {
    pub name: String,
    pub cadence: Schedule,
    #[serde(default)]
    pub regions: Vec<String>,
    pub retention: RetentionSpec,
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance: f64,
}

impl CategoryConfig {
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            service_class: self.name.clone(),
            primary_max_age_days: self.retention.primary_max_age_days,
            secondary_max_age_days: self.retention.secondary_max_age_days,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionSpec {
    pub primary_max_age_days: u32,
    pub secondary_max_age_days: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionConfig {
    pub name: String,
    pub root: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrillConfig {
    #[serde(default)]
    pub compose_file: Option<PathBuf>,
    #[serde(default)]
    pub compose_project: Option<String>,
    #[serde(default)]
    pub primary_component: Option<String>,
    #[serde(default)]
    pub health_endpoints: Vec<String>,
    #[serde(default)]
    pub restore_services: Vec<String>,
    #[serde(default = "default_failover_wait_seconds")]
    pub failover_wait_seconds: u64,
    #[serde(default = "default_recovery_target_seconds")]
    pub recovery_target_seconds: u64,
    #[serde(default = "default_rebuild_timeout_seconds")]
    pub rebuild_timeout_seconds: u64,
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    #[serde(default = "default_availability_threshold")]
    pub availability_threshold: f64,
    #[serde(default = "default_sandbox_host")]
    pub sandbox_host: String,
}

impl Default for DrillConfig {
    fn default() -> Self {
        Self {
            compose_file: None,
            compose_project: None,
            primary_component: None,
            health_endpoints: Vec::new(),
            restore_services: Vec::new(),
            failover_wait_seconds: default_failover_wait_seconds(),
            recovery_target_seconds: default_recovery_target_seconds(),
            rebuild_timeout_seconds: default_rebuild_timeout_seconds(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
            availability_threshold: default_availability_threshold(),
            sandbox_host: default_sandbox_host(),
        }
    }
}

fn default_drift_tolerance() -> f64 {
    0.10
}

fn default_failover_wait_seconds() -> u64 {
    60
}

fn default_recovery_target_seconds() -> u64 {
    300
}

fn default_rebuild_timeout_seconds() -> u64 {
    900
}

fn default_probe_timeout_seconds() -> u64 {
    5
}

fn default_availability_threshold() -> f64 {
    0.95
}

fn default_sandbox_host() -> String {
    "127.0.0.1".to_string()
}

impl Topology {
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read(path)
            .map_err(|err| format!("BDR_TOPOLOGY_FILE {} unreadable: {err}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(raw).map_err(|err| format!("topology parse failed: {err}"))
    }

    pub fn validate(&self) -> Result<(), String> {
        let categories = unique_names(
            "category",
            self.categories.iter().map(|category| category.name.as_str()),
        )?;
        let regions = unique_names("region", self.regions.iter().map(|region| region.name.as_str()))?;
        unique_names("service", self.services.iter().map(|service| service.name.as_str()))?;
        for service in &self.services {
            validate_service(service, &categories)?;
        }
        for category in &self.categories {
            validate_category(category, &regions)?;
        }
        validate_drill(&self.drill, &self.services)
    }
}

fn unique_names<'a>(
    kind: &str,
    names: impl Iterator<Item = &'a str>,
) -> Result<HashSet<&'a str>, String> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(format!("{kind} name must not be empty"));
        }
        if name.contains('/') || name.starts_with('.') {
            return Err(format!("{kind} name '{name}' must not contain '/' or start with '.'"));
        }
        if !seen.insert(name) {
            return Err(format!("duplicate {kind} '{name}'"));
        }
    }
    Ok(seen)
}

fn validate_service(service: &ServiceConfig, categories: &HashSet<&str>) -> Result<(), String> {
    if !categories.contains(service.category.as_str()) {
        return Err(format!(
            "service '{}' references unknown category '{}'",
            service.name, service.category
        ));
    }
    if service.strategies.is_empty() {
        return Err(format!("service '{}' needs at least one strategy", service.name));
    }
    let mut seen = HashSet::new();
    for entry in &service.strategies {
        if !service.engine.supports(entry.kind) {
            return Err(format!(
                "service '{}': strategy {} is not supported by {} engines",
                service.name,
                entry.kind.as_str(),
                service.engine.as_str()
            ));
        }
        if !seen.insert(entry.kind) {
            return Err(format!(
                "service '{}' lists strategy {} twice",
                service.name,
                entry.kind.as_str()
            ));
        }
    }
    match service.engine {
        EngineKind::Volume if service.connection.data_dir.is_none() => Err(format!(
            "service '{}' needs connection.dataDir for volume archives",
            service.name
        )),
        EngineKind::Relational | EngineKind::KeyValue | EngineKind::Document
            if service.connection.url.is_none() =>
        {
            Err(format!("service '{}' needs connection.url", service.name))
        }
        EngineKind::Relational
            if service.strategies.iter().any(|s| s.kind == StrategyKind::LogArchive)
                && service.connection.archive_dir.is_none() =>
        {
            Err(format!(
                "service '{}' needs connection.archiveDir for log archiving",
                service.name
            ))
        }
        _ => Ok(()),
    }
}

fn validate_category(category: &CategoryConfig, regions: &HashSet<&str>) -> Result<(), String> {
    category.retention_policy().validate()?;
    if !(0.0..1.0).contains(&category.drift_tolerance) {
        return Err(format!(
            "category '{}': driftTolerance must be within [0, 1)",
            category.name
        ));
    }
    for region in &category.regions {
        if !regions.contains(region.as_str()) {
            return Err(format!(
                "category '{}' references unknown region '{region}'",
                category.name
            ));
        }
    }
    Ok(())
}

fn validate_drill(drill: &DrillConfig, services: &[ServiceConfig]) -> Result<(), String> {
    for endpoint in &drill.health_endpoints {
        validate_http_url("drill.healthEndpoints", endpoint)?;
    }
    for name in &drill.restore_services {
        if !services.iter().any(|service| &service.name == name) {
            return Err(format!("drill.restoreServices references unknown service '{name}'"));
        }
    }
    if !(0.0..=1.0).contains(&drill.availability_threshold) {
        return Err("drill.availabilityThreshold must be within [0, 1]".into());
    }
    Ok(())
}

fn validate_http_url(field: &str, value: &str) -> Result<(), String> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(format!("{field} must be an absolute http/https URL"));
    }
    Ok(())
}

struct PathsConfig {
    base_dir: PathBuf,
    state_dir: PathBuf,
    reports_dir: PathBuf,
    topology_file: PathBuf,
    metrics_listen: String,
}

impl PathsConfig {
    fn from_env() -> Result<Self, String> {
        let base_dir = PathBuf::from(required_env("BDR_BASE_DIR", "BDR_BASE_DIR is required")?);
        Ok(Self {
            state_dir: env::var("BDR_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| base_dir.join(".state")),
            reports_dir: env::var("BDR_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| base_dir.join(".reports")),
            topology_file: PathBuf::from(required_env(
                "BDR_TOPOLOGY_FILE",
                "BDR_TOPOLOGY_FILE is required",
            )?),
            metrics_listen: normalize_listen_addr(env_or_default("BDR_METRICS_LISTEN", ":9108")),
            base_dir,
        })
    }
}

struct ScheduleConfig {
    backup_interval: Duration,
    monitor_interval: Duration,
    replication_interval: Duration,
    retention_interval: Duration,
}

impl ScheduleConfig {
    fn from_env() -> Self {
        Self {
            backup_interval: seconds_env("BDR_BACKUP_INTERVAL_SECONDS", 3600),
            monitor_interval: seconds_env("BDR_MONITOR_INTERVAL_SECONDS", 300),
            replication_interval: seconds_env("BDR_REPLICATION_INTERVAL_SECONDS", 300),
            retention_interval: seconds_env("BDR_RETENTION_INTERVAL_SECONDS", 86_400),
        }
    }
}

struct BoundsConfig {
    tool_timeout: Duration,
    poll_interval: Duration,
    poll_max_wait: Duration,
    keyspace_export_max_keys: usize,
}

impl BoundsConfig {
    fn from_env() -> Self {
        Self {
            tool_timeout: seconds_env("BDR_TOOL_TIMEOUT_SECONDS", 3600),
            poll_interval: Duration::from_millis(parse_env("BDR_POLL_INTERVAL_MS").unwrap_or(1000)),
            poll_max_wait: seconds_env("BDR_POLL_MAX_WAIT_SECONDS", 300),
            keyspace_export_max_keys: parse_env("BDR_KEYSPACE_EXPORT_MAX_KEYS").unwrap_or(10_000),
        }
    }
}

struct ThresholdConfig {
    max_age_hours: f64,
    integrity_pass_rate: f64,
    alert_cooldown: Duration,
}

impl ThresholdConfig {
    fn from_env() -> Result<Self, String> {
        let max_age_hours: f64 = parse_env("BDR_MAX_AGE_HOURS").unwrap_or(24.0);
        if max_age_hours <= 0.0 {
            return Err("BDR_MAX_AGE_HOURS must be positive".into());
        }
        let pass_rate_percent: f64 = parse_env("BDR_INTEGRITY_PASS_RATE").unwrap_or(85.0);
        if !(0.0..=100.0).contains(&pass_rate_percent) {
            return Err("BDR_INTEGRITY_PASS_RATE must be a percentage".into());
        }
        Ok(Self {
            max_age_hours,
            integrity_pass_rate: pass_rate_percent / 100.0,
            alert_cooldown: seconds_env("BDR_ALERT_COOLDOWN_SECONDS", 3600),
        })
    }
}

struct SinkConfig {
    alert_webhook_url: Option<String>,
    rabbit_url: Option<String>,
    log_level: String,
}

impl SinkConfig {
    fn from_env() -> Self {
        Self {
            alert_webhook_url: non_empty_env("BDR_ALERT_WEBHOOK_URL"),
            rabbit_url: non_empty_env("BDR_RABBIT_URL"),
            log_level: env_or_default("BDR_LOG_LEVEL", "info"),
        }
    }
}

fn required_env(key: &str, missing_message: &str) -> Result<String, String> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| missing_message.to_string())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_or_default(key: &str, default_value: &str) -> String {
    env::var(key).unwrap_or_else(|_| default_value.to_string())
}

fn parse_env<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn seconds_env(key: &str, default_seconds: u64) -> Duration {
    Duration::from_secs(parse_env(key).unwrap_or(default_seconds))
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn normalize_listen_addr(value: String) -> String {
    if value.starts_with(':') {
        format!("0.0.0.0{}", value)
    } else {
        value
    }
}
