pub mod archive;
pub mod document;
pub mod keyvalue;
pub mod relational;
pub mod volume;

use crate::errors::{BackupFailure, BackupFailureReason};
use crate::meta::catalog::{remove_if_exists, ArtifactCatalog};
use crate::meta::models::{
    BackupArtifact, EngineKind, Provenance, StorageLocations, StrategyKind, Validity,
};
use crate::obs::Metrics;
use crate::storage::checksum::{Checksum, ChecksumAlgo};
use crate::util::config::{Config, ServiceConfig};
use crate::util::poll::{poll_until, PollError, PollSettings};
use crate::util::process::ToolError;
use async_trait::async_trait;
use chrono::Utc;
use document::{DocumentEngine, MongoToolsEngine};
use keyvalue::{KeyValueEngine, RedisEngine};
use relational::{PgToolsEngine, RelationalEngine};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use volume::VolumeSource;

/// Error raised inside an engine adapter, classified into a
/// [`BackupFailureReason`] at the executor boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Timeout { waited: Duration },
    Tool(ToolError),
    Io(String),
    Command(String),
    Unsupported,
}

impl EngineError {
    pub fn into_reason(self) -> BackupFailureReason {
        match self {
            Self::Timeout { waited } => BackupFailureReason::Timeout { waited },
            Self::Tool(ToolError::Timeout(limit)) => BackupFailureReason::Timeout { waited: limit },
            Self::Tool(err) => BackupFailureReason::Tool(err.to_string()),
            Self::Io(msg) => BackupFailureReason::Io(msg),
            Self::Command(msg) => BackupFailureReason::Engine(msg),
            Self::Unsupported => BackupFailureReason::Unsupported,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { waited } => write!(f, "timed out after {}ms", waited.as_millis()),
            Self::Tool(err) => write!(f, "tool {err}"),
            Self::Io(msg) | Self::Command(msg) => f.write_str(msg),
            Self::Unsupported => f.write_str("unsupported strategy"),
        }
    }
}

impl From<PollError> for EngineError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::Timeout { waited, .. } => Self::Timeout { waited },
            PollError::Probe(msg) => Self::Command(msg),
        }
    }
}

/// Connected engine for one service.
#[derive(Clone)]
pub enum EngineHandle {
    Relational(Arc<dyn RelationalEngine>),
    KeyValue(Arc<dyn KeyValueEngine>),
    Document(Arc<dyn DocumentEngine>),
    Volume(VolumeSource),
}

impl EngineHandle {
    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Relational(_) => EngineKind::Relational,
            Self::KeyValue(_) => EngineKind::KeyValue,
            Self::Document(_) => EngineKind::Document,
            Self::Volume(_) => EngineKind::Volume,
        }
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineHandle({})", self.kind().as_str())
    }
}

/// Opens engine clients. `endpoint` overrides the configured URL, which is how
/// drills point a restore at a sandbox instance.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(
        &self,
        service: &ServiceConfig,
        endpoint: Option<&str>,
    ) -> Result<EngineHandle, String>;
}

pub struct LiveConnector {
    tool_timeout: Duration,
}

impl LiveConnector {
    pub fn new(tool_timeout: Duration) -> Self {
        Self { tool_timeout }
    }
}

#[async_trait]
impl EngineConnector for LiveConnector {
    async fn connect(
        &self,
        service: &ServiceConfig,
        endpoint: Option<&str>,
    ) -> Result<EngineHandle, String> {
        let conn = &service.connection;
        let url = endpoint.map(str::to_string).or_else(|| conn.url.clone());
        let require_url = || {
            url.clone()
                .ok_or_else(|| format!("service '{}' has no connection url", service.name))
        };
        match service.engine {
            EngineKind::Relational => {
                let engine =
                    PgToolsEngine::new(&require_url()?, conn.archive_dir.clone(), self.tool_timeout)?;
                Ok(EngineHandle::Relational(Arc::new(engine)))
            }
            EngineKind::KeyValue => {
                let data_dir = if endpoint.is_some() {
                    None
                } else {
                    conn.data_dir.clone()
                };
                let engine = RedisEngine::connect(&require_url()?, data_dir).await?;
                Ok(EngineHandle::KeyValue(Arc::new(engine)))
            }
            EngineKind::Document => {
                let engine = MongoToolsEngine::new(
                    &require_url()?,
                    conn.database.clone(),
                    conn.collections.clone(),
                    self.tool_timeout,
                );
                Ok(EngineHandle::Document(Arc::new(engine)))
            }
            EngineKind::Volume => {
                let root = conn.data_dir.clone().ok_or_else(|| {
                    format!("service '{}' has no connection.dataDir", service.name)
                })?;
                Ok(EngineHandle::Volume(VolumeSource::new(root)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub tool_timeout: Duration,
    pub poll: PollSettings,
    pub keyspace_export_max_keys: usize,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tool_timeout: config.tool_timeout,
            poll: PollSettings::with_backoff(
                config.poll_interval,
                config.poll_interval.saturating_mul(8),
                config.poll_max_wait,
            ),
            keyspace_export_max_keys: config.keyspace_export_max_keys,
        }
    }
}

pub struct ProduceContext<'a> {
    pub service: &'a str,
    pub strategy: StrategyKind,
    pub dest: &'a Path,
    pub work_dir: PathBuf,
    pub settings: &'a ExecutorSettings,
    pub catalog: &'a ArtifactCatalog,
}

pub struct Produced {
    pub provenance: Provenance,
}

pub(crate) async fn blocking<T, F>(task: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, String> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| EngineError::Io(format!("blocking task failed: {err}")))?
        .map_err(EngineError::Io)
}

#[derive(Clone, Debug)]
struct ServiceBinding {
    config: ServiceConfig,
    engine: EngineHandle,
}

/// Where a restore lands: a data directory for file-based staging, plus an
/// engine handle for the load and post-condition steps.
#[derive(Clone, Debug)]
pub struct RestoreTarget {
    pub data_dir: PathBuf,
    pub engine: Option<EngineHandle>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub artifact_id: Uuid,
    pub service: String,
    pub strategy: StrategyKind,
    pub staged_files: u64,
    pub restored_items: u64,
    pub item_kind: &'static str,
    pub duration_ms: u64,
}

pub struct BackupExecutor {
    catalog: ArtifactCatalog,
    services: BTreeMap<String, ServiceBinding>,
    settings: ExecutorSettings,
    metrics: Option<Arc<Metrics>>,
}

impl BackupExecutor {
    pub fn new(catalog: ArtifactCatalog, settings: ExecutorSettings) -> Self {
        Self {
            catalog,
            services: BTreeMap::new(),
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn register(&mut self, config: ServiceConfig, engine: EngineHandle) {
        self.services
            .insert(config.name.clone(), ServiceBinding { config, engine });
    }

    /// Connects every configured service; services whose engine cannot be
    /// reached are returned with the error and left unregistered.
    pub async fn connect_all(
        &mut self,
        services: &[ServiceConfig],
        connector: &dyn EngineConnector,
    ) -> Vec<(String, String)> {
        let mut failed = Vec::new();
        for service in services {
            match connector.connect(service, None).await {
                Ok(engine) => self.register(service.clone(), engine),
                Err(err) => {
                    tracing::warn!(service = %service.name, error = %err, "engine connect failed");
                    failed.push((service.name.clone(), err));
                }
            }
        }
        failed
    }

    pub fn catalog(&self) -> &ArtifactCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name).map(|binding| &binding.config)
    }

    pub fn engine(&self, name: &str) -> Option<&EngineHandle> {
        self.services.get(name).map(|binding| &binding.engine)
    }

    pub async fn produce(
        &self,
        service: &str,
        strategy: StrategyKind,
    ) -> Result<BackupArtifact, BackupFailure> {
        let started = Instant::now();
        let result = self.produce_inner(service, strategy).await;
        self.observe_produce(service, strategy, started, &result);
        result
    }

    async fn produce_inner(
        &self,
        service: &str,
        strategy: StrategyKind,
    ) -> Result<BackupArtifact, BackupFailure> {
        let fail = |reason| BackupFailure::new(service, strategy, reason);
        let binding = self
            .services
            .get(service)
            .ok_or_else(|| fail(BackupFailureReason::UnknownService))?;
        if !binding.engine.kind().supports(strategy) {
            return Err(fail(BackupFailureReason::Unsupported));
        }

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let (name, dest) = self.catalog.artifact_path(service, strategy, created_at, id);
        let work_dir = self.catalog.work_dir().join(id.to_string());
        for dir in [dest.parent().unwrap_or(self.catalog.base_dir()), work_dir.as_path()] {
            tokio::fs::create_dir_all(dir).await.map_err(|err| {
                fail(BackupFailureReason::Io(format!(
                    "mkdir {} failed: {err}",
                    dir.display()
                )))
            })?;
        }
        let ctx = ProduceContext {
            service,
            strategy,
            dest: &dest,
            work_dir: work_dir.clone(),
            settings: &self.settings,
            catalog: &self.catalog,
        };

        let deadline = self.settings.tool_timeout;
        let outcome = match tokio::time::timeout(deadline, produce_with(&binding.engine, &ctx)).await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout { waited: deadline }),
        };
        if let Err(err) = tokio::fs::remove_dir_all(&work_dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(service, path = %work_dir.display(), error = %err, "work dir cleanup failed");
            }
        }
        let produced = match outcome {
            Ok(produced) => produced,
            Err(err) => {
                if let Err(cleanup) = remove_if_exists(&dest).await {
                    tracing::warn!(service, error = %cleanup, "partial artifact cleanup failed");
                }
                return Err(fail(err.into_reason()));
            }
        };

        let path = dest.clone();
        let (size_bytes, checksum) = blocking(move || {
            let size = std::fs::metadata(&path)
                .map_err(|err| format!("stat {} failed: {err}", path.display()))?
                .len();
            let checksum = Checksum::compute_file(ChecksumAlgo::Sha256, &path)?;
            Ok((size, checksum.to_tagged()))
        })
        .await
        .map_err(|err| fail(err.into_reason()))?;

        let artifact = BackupArtifact {
            id,
            name,
            service: service.to_string(),
            category: binding.config.category.clone(),
            strategy,
            created_at,
            size_bytes,
            checksum,
            validity: Validity::Created,
            invalid_reason: None,
            validated_at: None,
            locations: StorageLocations {
                local_path: dest,
                remote_uris: Vec::new(),
            },
            provenance: produced.provenance,
        };
        self.catalog
            .record(&artifact)
            .await
            .map_err(|err| fail(BackupFailureReason::Io(err)))?;
        Ok(artifact)
    }

    fn observe_produce(
        &self,
        service: &str,
        strategy: StrategyKind,
        started: Instant,
        result: &Result<BackupArtifact, BackupFailure>,
    ) {
        let elapsed = started.elapsed();
        let label = match result {
            Ok(artifact) => {
                tracing::info!(
                    service,
                    strategy = strategy.as_str(),
                    artifact = %artifact.name,
                    size_bytes = artifact.size_bytes,
                    duration_ms = elapsed.as_millis() as u64,
                    "backup artifact produced"
                );
                "success"
            }
            Err(err) => {
                tracing::error!(service, strategy = strategy.as_str(), error = %err, "backup failed");
                err.reason.code()
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics
                .backup_runs
                .with_label_values(&[service, strategy.as_str(), label])
                .inc();
            metrics
                .backup_duration
                .with_label_values(&[service, strategy.as_str()])
                .observe(elapsed.as_secs_f64());
        }
    }

    /// File-level half of a restore: places the artifact contents in
    /// `data_dir` before the target instance starts. Returns the number of
    /// files staged.
    pub async fn stage_restore(
        &self,
        artifact: &BackupArtifact,
        data_dir: &Path,
    ) -> Result<u64, BackupFailure> {
        ensure_restorable(artifact)?;
        let fail = |err: EngineError| {
            BackupFailure::new(&artifact.service, artifact.strategy, err.into_reason())
        };
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|err| fail(EngineError::Io(format!("mkdir {} failed: {err}", data_dir.display()))))?;
        let source = artifact.locations.local_path.clone();
        let target = data_dir.to_path_buf();
        let strategy = artifact.strategy;
        blocking(move || match strategy {
            StrategyKind::BaseBackup => relational::stage_base_backup(&source, &target),
            StrategyKind::Snapshot
            | StrategyKind::AppendLogRewrite
            | StrategyKind::KeyspaceExport => keyvalue::stage(strategy, &source, &target),
            StrategyKind::LogicalDump => Ok(0),
            StrategyKind::VolumeArchive => archive::unpack_tar_gz(&source, &target),
            StrategyKind::LogArchive => Err("log archives cannot seed a restore".to_string()),
        })
        .await
        .map_err(fail)
    }

    /// Engine-level half of a restore: loads logical artifacts into the
    /// running instance and reads back the post-condition count.
    pub async fn complete_restore(
        &self,
        artifact: &BackupArtifact,
        engine: &EngineHandle,
        data_dir: &Path,
    ) -> Result<(u64, &'static str), BackupFailure> {
        ensure_restorable(artifact)?;
        let fail = |err: EngineError| {
            BackupFailure::new(&artifact.service, artifact.strategy, err.into_reason())
        };
        if !engine.kind().supports(artifact.strategy) {
            return Err(fail(EngineError::Unsupported));
        }
        let poll = self.settings.poll;
        let path = artifact.locations.local_path.as_path();
        let outcome = match engine {
            EngineHandle::Relational(engine) => {
                let tables = await_ready(poll, move || engine.count_tables()).await;
                tables.map(|count| (count, "tables"))
            }
            EngineHandle::KeyValue(engine) => {
                let ready = await_ready(poll, move || engine.key_count()).await;
                match (ready, artifact.strategy) {
                    (Ok(_), StrategyKind::KeyspaceExport) => {
                        match keyvalue::load_export(engine.as_ref(), path).await {
                            Ok(_) => engine.key_count().await.map(|count| (count, "keys")),
                            Err(err) => Err(err),
                        }
                    }
                    (ready, _) => ready.map(|count| (count, "keys")),
                }
            }
            EngineHandle::Document(engine) => {
                match await_ready(poll, move || engine.count_documents()).await {
                    Ok(_) => document::restore_dump(engine.as_ref(), path, &self.catalog.work_dir())
                        .await
                        .map(|count| (count, "documents")),
                    Err(err) => Err(err),
                }
            }
            EngineHandle::Volume(_) => {
                let root = data_dir.to_path_buf();
                blocking(move || archive::count_files(&root))
                    .await
                    .map(|count| (count, "files"))
            }
        };
        outcome.map_err(fail)
    }

    /// Inverse of [`BackupExecutor::produce`]. Only validated artifacts are
    /// restore candidates.
    pub async fn restore(
        &self,
        artifact: &BackupArtifact,
        target: &RestoreTarget,
    ) -> Result<RestoreSummary, BackupFailure> {
        let started = Instant::now();
        let staged_files = self.stage_restore(artifact, &target.data_dir).await?;
        let engine = match &target.engine {
            Some(engine) => engine.clone(),
            None => EngineHandle::Volume(VolumeSource::new(target.data_dir.clone())),
        };
        let (restored_items, item_kind) = self
            .complete_restore(artifact, &engine, &target.data_dir)
            .await?;
        let summary = RestoreSummary {
            artifact_id: artifact.id,
            service: artifact.service.clone(),
            strategy: artifact.strategy,
            staged_files,
            restored_items,
            item_kind,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            service = %artifact.service,
            artifact = %artifact.name,
            restored_items,
            item_kind,
            "artifact restored"
        );
        Ok(summary)
    }
}

fn ensure_restorable(artifact: &BackupArtifact) -> Result<(), BackupFailure> {
    let fail = |msg: String| {
        BackupFailure::new(
            &artifact.service,
            artifact.strategy,
            BackupFailureReason::Engine(msg),
        )
    };
    if !artifact.is_restore_candidate() {
        return Err(fail(format!(
            "artifact {} is {} and not a restore candidate",
            artifact.name,
            artifact.validity.as_str()
        )));
    }
    if !artifact.strategy.is_restorable() {
        return Err(BackupFailure::new(
            &artifact.service,
            artifact.strategy,
            BackupFailureReason::Unsupported,
        ));
    }
    Ok(())
}

async fn produce_with(
    engine: &EngineHandle,
    ctx: &ProduceContext<'_>,
) -> Result<Produced, EngineError> {
    match engine {
        EngineHandle::Relational(engine) => relational::produce(engine.as_ref(), ctx).await,
        EngineHandle::KeyValue(engine) => keyvalue::produce(engine.as_ref(), ctx).await,
        EngineHandle::Document(engine) => document::produce(engine.as_ref(), ctx).await,
        EngineHandle::Volume(source) => volume::produce(source, ctx).await,
    }
}

/// Retries `probe` until the freshly started instance answers; errors count as
/// "not ready yet" until the poll deadline.
async fn await_ready<T, F, Fut>(poll: PollSettings, mut probe: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, EngineError>>,
{
    let last_error: std::sync::Mutex<Option<String>> = std::sync::Mutex::new(None);
    let last = &last_error;
    let result = poll_until(poll, move || {
        let attempt = probe();
        async move {
            match attempt.await {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    tracing::debug!(error = %err, "restore target not ready");
                    if let Ok(mut slot) = last.lock() {
                        *slot = Some(err.to_string());
                    }
                    Ok(None)
                }
            }
        }
    })
    .await;
    match result {
        Ok(value) => Ok(value),
        Err(PollError::Timeout { waited, .. }) => {
            let detail = last_error.lock().ok().and_then(|mut slot| slot.take());
            Err(match detail {
                Some(msg) => EngineError::Command(format!(
                    "target not ready after {}ms: {msg}",
                    waited.as_millis()
                )),
                None => EngineError::Timeout { waited },
            })
        }
        Err(err) => Err(err.into()),
    }
}
