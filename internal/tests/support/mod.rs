#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use bdr_core::backup::relational::{RelationalEngine, BASE_MEMBER, WAL_MEMBER};
use bdr_core::backup::{EngineConnector, EngineError, EngineHandle};
use bdr_core::drill::environment::{ComponentState, EnvironmentAssessment, EnvironmentControl};
use bdr_core::drill::sandbox::{SandboxLease, SandboxProvider};
use bdr_core::errors::{EnvironmentFailure, EnvironmentPhase};
use bdr_core::meta::catalog::ArtifactCatalog;
use bdr_core::meta::models::{
    BackupArtifact, EngineKind, Provenance, Schedule, StorageLocations, StrategyKind, Validity,
};
use bdr_core::storage::checksum::{Checksum, ChecksumAlgo};
use bdr_core::util::config::{
    CategoryConfig, Config, ConnectionConfig, RetentionSpec, SandboxSpec, ServiceConfig,
    StrategySchedule, Topology,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub fn config(root: &Path, topology: Topology) -> Config {
    Config {
        base_dir: root.join("backups"),
        state_dir: root.join("state"),
        reports_dir: root.join("reports"),
        topology_file: root.join("topology.json"),
        metrics_listen: "127.0.0.1:0".to_string(),
        backup_interval: Duration::from_secs(300),
        monitor_interval: Duration::from_secs(60),
        replication_interval: Duration::from_secs(900),
        retention_interval: Duration::from_secs(3600),
        tool_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_millis(10),
        poll_max_wait: Duration::from_secs(2),
        keyspace_export_max_keys: 1000,
        max_age_hours: 24.0,
        integrity_pass_rate: 0.85,
        alert_cooldown: Duration::from_secs(3600),
        alert_webhook_url: None,
        rabbit_url: None,
        log_level: "info".to_string(),
        topology,
    }
}

pub fn service(
    name: &str,
    engine: EngineKind,
    category: &str,
    strategies: &[(StrategyKind, Schedule)],
) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        engine,
        category: category.to_string(),
        connection: ConnectionConfig::default(),
        strategies: strategies
            .iter()
            .map(|(kind, schedule)| StrategySchedule {
                kind: *kind,
                schedule: *schedule,
            })
            .collect(),
        min_artifact_bytes: None,
        sandbox: None::<SandboxSpec>,
    }
}

pub fn category(name: &str, regions: &[&str]) -> CategoryConfig {
    CategoryConfig {
        name: name.to_string(),
        cadence: Schedule::Hourly,
        regions: regions.iter().map(|region| region.to_string()).collect(),
        retention: RetentionSpec {
            primary_max_age_days: 7,
            secondary_max_age_days: 30,
        },
        drift_tolerance: 0.10,
    }
}

/// Bytes gzip cannot shrink much, so archives clear the size floors.
pub fn noisy_bytes(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_F491;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state & 0xFF) as u8
        })
        .collect()
}

pub fn rdb_bytes(body: &[u8]) -> Vec<u8> {
    let mut bytes = b"REDIS0011".to_vec();
    bytes.extend_from_slice(body);
    bytes.push(0xFF);
    bytes.extend_from_slice(&[0u8; 8]);
    bytes
}

/// Writes `content` into the catalog as an artifact of `service` and records
/// its sidecar. The checksum is taken over `checksummed`, which lets callers
/// simulate a file cut short after the producer hashed it.
pub async fn seed_artifact(
    catalog: &ArtifactCatalog,
    service: &str,
    category: &str,
    strategy: StrategyKind,
    created_at: DateTime<Utc>,
    checksummed: &[u8],
    content: &[u8],
    validity: Validity,
) -> BackupArtifact {
    let id = Uuid::new_v4();
    let (name, path) = catalog.artifact_path(service, strategy, created_at, id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.expect("mkdir");
    }
    tokio::fs::write(&path, content).await.expect("write artifact");
    let artifact = BackupArtifact {
        id,
        name,
        service: service.to_string(),
        category: category.to_string(),
        strategy,
        created_at,
        size_bytes: content.len() as u64,
        checksum: Checksum::compute(ChecksumAlgo::Sha256, checksummed).to_tagged(),
        validity,
        invalid_reason: None,
        validated_at: (validity != Validity::Created).then_some(created_at),
        locations: StorageLocations {
            local_path: path,
            remote_uris: Vec::new(),
        },
        provenance: Provenance::default(),
    };
    catalog.record(&artifact).await.expect("record sidecar");
    artifact
}

/// Hands out pre-built engines by service name.
#[derive(Default)]
pub struct StaticConnector {
    engines: BTreeMap<String, EngineHandle>,
}

impl StaticConnector {
    pub fn with(mut self, service: &str, engine: EngineHandle) -> Self {
        self.engines.insert(service.to_string(), engine);
        self
    }
}

#[async_trait]
impl EngineConnector for StaticConnector {
    async fn connect(
        &self,
        service: &ServiceConfig,
        _endpoint: Option<&str>,
    ) -> Result<EngineHandle, String> {
        self.engines
            .get(&service.name)
            .cloned()
            .ok_or_else(|| format!("connection refused for '{}'", service.name))
    }
}

/// Relational engine whose base copy is two gzip members of noise.
pub struct FakePostgres {
    pub base_backups: AtomicUsize,
}

impl FakePostgres {
    pub fn new() -> Self {
        Self {
            base_backups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RelationalEngine for FakePostgres {
    async fn base_backup(&self, dest_dir: &Path) -> Result<(), EngineError> {
        for member in [BASE_MEMBER, WAL_MEMBER] {
            tokio::fs::write(dest_dir.join(member), noisy_bytes(4096))
                .await
                .map_err(|err| EngineError::Io(err.to_string()))?;
        }
        self.base_backups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn switch_log(&self) -> Result<String, EngineError> {
        Ok("000000010000000000000001".to_string())
    }

    fn archive_dir(&self) -> Option<&Path> {
        None
    }

    async fn server_version(&self) -> Result<String, EngineError> {
        Ok("16.2".to_string())
    }

    async fn count_tables(&self) -> Result<u64, EngineError> {
        Ok(12)
    }
}

#[derive(Default)]
pub struct NoSandbox;

#[async_trait]
impl SandboxProvider for NoSandbox {
    async fn provision(
        &self,
        _run_id: Uuid,
        service: &ServiceConfig,
        _spec: &SandboxSpec,
        _data_dir: &Path,
    ) -> Result<SandboxLease, EnvironmentFailure> {
        Err(EnvironmentFailure::new(
            EnvironmentPhase::Provision,
            format!("no sandbox runtime for '{}'", service.name),
        ))
    }

    async fn release(&self, _lease: &SandboxLease) -> Result<(), EnvironmentFailure> {
        Ok(())
    }
}

/// Components that go down on teardown and come back on rebuild.
pub struct Stack {
    components: Mutex<BTreeMap<String, bool>>,
    pub rebuilds: AtomicUsize,
    pub teardowns: AtomicUsize,
}

impl Stack {
    pub fn new(components: &[&str]) -> Self {
        Self {
            components: Mutex::new(
                components
                    .iter()
                    .map(|name| (name.to_string(), true))
                    .collect(),
            ),
            rebuilds: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
        }
    }

    pub fn is_running(&self, component: &str) -> bool {
        self.components
            .lock()
            .expect("lock")
            .get(component)
            .copied()
            .unwrap_or(false)
    }

    fn set_all(&self, running: bool) {
        for state in self.components.lock().expect("lock").values_mut() {
            *state = running;
        }
    }

    fn set(&self, component: &str, running: bool) -> Result<(), EnvironmentFailure> {
        match self.components.lock().expect("lock").get_mut(component) {
            Some(state) => {
                *state = running;
                Ok(())
            }
            None => Err(EnvironmentFailure::new(
                EnvironmentPhase::Control,
                format!("unknown component '{component}'"),
            )),
        }
    }
}

#[async_trait]
impl EnvironmentControl for Stack {
    async fn stop(&self, component: &str) -> Result<(), EnvironmentFailure> {
        self.set(component, false)
    }

    async fn start(&self, component: &str) -> Result<(), EnvironmentFailure> {
        self.set(component, true)
    }

    async fn teardown(&self) -> Result<(), EnvironmentFailure> {
        self.set_all(false);
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rebuild(&self) -> Result<(), EnvironmentFailure> {
        self.set_all(true);
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn assess(&self) -> Result<EnvironmentAssessment, EnvironmentFailure> {
        let components = self
            .components
            .lock()
            .expect("lock")
            .iter()
            .map(|(name, running)| ComponentState {
                name: name.clone(),
                running: *running,
            })
            .collect();
        Ok(EnvironmentAssessment { components })
    }

    fn fingerprint(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("environment".to_string(), "integration".to_string())])
    }
}

pub struct TestServer {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl TestServer {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

pub async fn spawn_http(app: Router) -> (String, TestServer) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });
    (
        format!("http://{addr}"),
        TestServer {
            shutdown: Some(shutdown_tx),
            join,
        },
    )
}

pub fn temp_root() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("bdr-it-")
        .tempdir()
        .expect("temp dir")
}

pub fn path_in(root: &tempfile::TempDir, name: &str) -> PathBuf {
    let path = root.path().join(name);
    std::fs::create_dir_all(&path).expect("mkdir");
    path
}
