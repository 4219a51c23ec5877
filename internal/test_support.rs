use crate::backup::keyvalue::{KeyValueEngine, PersistencePaths};
use crate::backup::{EngineError, EngineHandle, ExecutorSettings};
use crate::drill::environment::{ComponentState, EnvironmentAssessment, EnvironmentControl};
use crate::drill::sandbox::{SandboxLease, SandboxProvider};
use crate::errors::{EnvironmentFailure, EnvironmentPhase};
use crate::meta::models::{
    BackupArtifact, EngineKind, Provenance, Schedule, StorageLocations, StrategyKind, Validity,
};
use crate::util::config::{
    CategoryConfig, Config, ConnectionConfig, RetentionSpec, SandboxSpec, ServiceConfig,
    StrategySchedule, Topology,
};
use crate::util::poll::PollSettings;
use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A throwaway root with a catalog base directory and named scratch dirs
/// that sit outside it.
pub struct TempDirs {
    root: tempfile::TempDir,
}

impl TempDirs {
    pub fn new() -> Self {
        let root = tempfile::Builder::new()
            .prefix("bdr-test-")
            .tempdir()
            .expect("create temp dir");
        std::fs::create_dir_all(root.path().join("backups")).expect("create base dir");
        Self { root }
    }

    pub fn base(&self) -> PathBuf {
        self.root.path().join("backups")
    }

    pub fn scratch(&self, name: &str) -> PathBuf {
        let dir = self.root.path().join("scratch").join(name);
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }
}

pub fn executor_settings() -> ExecutorSettings {
    ExecutorSettings {
        tool_timeout: Duration::from_secs(30),
        poll: PollSettings::fixed(Duration::from_millis(10), Duration::from_secs(2)),
        keyspace_export_max_keys: 1000,
    }
}

pub fn base_config(dir: &Path) -> Config {
    Config {
        base_dir: dir.join("backups"),
        state_dir: dir.join("state"),
        reports_dir: dir.join("reports"),
        topology_file: dir.join("topology.json"),
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
        topology: Topology::default(),
    }
}

pub fn volume_service(name: &str, category: &str, root: &Path) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        engine: EngineKind::Volume,
        category: category.to_string(),
        connection: ConnectionConfig {
            data_dir: Some(root.to_path_buf()),
            ..ConnectionConfig::default()
        },
        strategies: vec![StrategySchedule {
            kind: StrategyKind::VolumeArchive,
            schedule: Schedule::Daily,
        }],
        min_artifact_bytes: None,
        sandbox: None,
    }
}

pub fn keyvalue_service(name: &str, category: &str) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        engine: EngineKind::KeyValue,
        category: category.to_string(),
        connection: ConnectionConfig {
            url: Some("redis://127.0.0.1:6379/0".to_string()),
            ..ConnectionConfig::default()
        },
        strategies: vec![
            StrategySchedule {
                kind: StrategyKind::Snapshot,
                schedule: Schedule::Hourly,
            },
            StrategySchedule {
                kind: StrategyKind::KeyspaceExport,
                schedule: Schedule::Daily,
            },
        ],
        min_artifact_bytes: None,
        sandbox: None,
    }
}

pub fn category(name: &str, cadence: Schedule, regions: &[&str]) -> CategoryConfig {
    CategoryConfig {
        name: name.to_string(),
        cadence,
        regions: regions.iter().map(|region| region.to_string()).collect(),
        retention: RetentionSpec {
            primary_max_age_days: 7,
            secondary_max_age_days: 30,
        },
        drift_tolerance: 0.10,
    }
}

pub fn sandbox_spec() -> SandboxSpec {
    SandboxSpec {
        image: "redis:7".to_string(),
        port: 6379,
        env: BTreeMap::new(),
        data_mount: "/data".to_string(),
        endpoint: "redis://{host}:{port}/0".to_string(),
    }
}

pub fn bare_artifact(service: &str, strategy: StrategyKind) -> BackupArtifact {
    let id = Uuid::new_v4();
    BackupArtifact {
        id,
        name: format!("{service}-{}-{id}", strategy.as_str()),
        service: service.to_string(),
        category: "test".to_string(),
        strategy,
        created_at: Utc::now(),
        size_bytes: 0,
        checksum: String::new(),
        validity: Validity::Created,
        invalid_reason: None,
        validated_at: None,
        locations: StorageLocations {
            local_path: PathBuf::from("/nonexistent"),
            remote_uris: Vec::new(),
        },
        provenance: Provenance::default(),
    }
}

/// Smallest byte string the snapshot checks accept: magic, body, EOF opcode
/// and an eight byte checksum.
pub fn rdb_bytes(body: &[u8]) -> Vec<u8> {
    let mut bytes = b"REDIS0011".to_vec();
    bytes.extend_from_slice(body);
    bytes.push(0xFF);
    bytes.extend_from_slice(&[0u8; 8]);
    bytes
}

/// Deterministic bytes that gzip cannot shrink much.
pub fn noisy_bytes(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x9E37_79B9;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state & 0xFF) as u8
        })
        .collect()
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

#[derive(Default)]
struct MemoryKeyValueState {
    keys: BTreeMap<String, Vec<u8>>,
    last_save: i64,
}

/// Key-value engine kept in memory; `BGSAVE` writes an RDB-shaped file into
/// its data dir.
pub struct MemoryKeyValue {
    data_dir: PathBuf,
    state: Mutex<MemoryKeyValueState>,
}

impl MemoryKeyValue {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            state: Mutex::new(MemoryKeyValueState::default()),
        }
    }

    pub fn insert(&self, key: &str, value: &[u8]) {
        self.state
            .lock()
            .expect("lock")
            .keys
            .insert(key.to_string(), value.to_vec());
    }
}

#[async_trait]
impl KeyValueEngine for MemoryKeyValue {
    async fn last_save(&self) -> Result<i64, EngineError> {
        Ok(self.state.lock().expect("lock").last_save)
    }

    async fn background_save(&self) -> Result<(), EngineError> {
        let body: Vec<u8> = {
            let state = self.state.lock().expect("lock");
            state
                .keys
                .iter()
                .flat_map(|(key, value)| key.bytes().chain(value.iter().copied()))
                .collect()
        };
        std::fs::create_dir_all(&self.data_dir)
            .and_then(|_| std::fs::write(self.data_dir.join("dump.rdb"), rdb_bytes(&body)))
            .map_err(|err| EngineError::Io(err.to_string()))?;
        self.state.lock().expect("lock").last_save += 1;
        Ok(())
    }

    async fn rewrite_append_log(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn rewrite_in_progress(&self) -> Result<bool, EngineError> {
        Ok(false)
    }

    async fn persistence_paths(&self) -> Result<PersistencePaths, EngineError> {
        Ok(PersistencePaths {
            snapshot: self.data_dir.join("dump.rdb"),
            append_dir: None,
            append_files: Vec::new(),
        })
    }

    async fn scan(&self, _cursor: u64, _count: usize) -> Result<(u64, Vec<String>), EngineError> {
        let keys = self.state.lock().expect("lock").keys.keys().cloned().collect();
        Ok((0, keys))
    }

    async fn value_type(&self, key: &str) -> Result<String, EngineError> {
        let exists = self.state.lock().expect("lock").keys.contains_key(key);
        Ok(if exists { "string" } else { "none" }.to_string())
    }

    async fn get_scalar(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.state.lock().expect("lock").keys.get(key).cloned())
    }

    async fn set_scalar(&self, key: &str, value: &[u8]) -> Result<(), EngineError> {
        self.insert(key, value);
        Ok(())
    }

    async fn key_count(&self) -> Result<u64, EngineError> {
        Ok(self.state.lock().expect("lock").keys.len() as u64)
    }

    async fn server_version(&self) -> Result<String, EngineError> {
        Ok("7.2.0-memory".to_string())
    }
}

pub fn memory_keyvalue_engine(data_dir: &Path) -> EngineHandle {
    EngineHandle::KeyValue(Arc::new(MemoryKeyValue::new(data_dir)))
}

#[derive(Default)]
pub struct FakeSandbox {
    leases: Mutex<BTreeMap<String, SandboxLease>>,
    provisioned: AtomicUsize,
}

impl FakeSandbox {
    pub fn active(&self) -> usize {
        self.leases.lock().expect("lock").len()
    }

    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for FakeSandbox {
    async fn provision(
        &self,
        run_id: Uuid,
        service: &ServiceConfig,
        _spec: &SandboxSpec,
        _data_dir: &Path,
    ) -> Result<SandboxLease, EnvironmentFailure> {
        let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
        let lease = SandboxLease {
            id: format!("{}-{n}", crate::drill::sandbox::sandbox_name(run_id, &service.name)),
            service: service.name.clone(),
            endpoint: format!("fake://{}/{n}", service.name),
        };
        self.leases
            .lock()
            .expect("lock")
            .insert(lease.id.clone(), lease.clone());
        Ok(lease)
    }

    async fn release(&self, lease: &SandboxLease) -> Result<(), EnvironmentFailure> {
        self.leases.lock().expect("lock").remove(&lease.id);
        Ok(())
    }
}

pub struct FakeEnvironment {
    components: Mutex<BTreeMap<String, bool>>,
    rebuilds: AtomicUsize,
}

impl FakeEnvironment {
    pub fn new(components: &[&str]) -> Self {
        Self {
            components: Mutex::new(
                components
                    .iter()
                    .map(|name| (name.to_string(), true))
                    .collect(),
            ),
            rebuilds: AtomicUsize::new(0),
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

    pub fn rebuilds(&self) -> usize {
        self.rebuilds.load(Ordering::SeqCst)
    }

    fn set(&self, component: &str, running: bool) -> Result<(), EnvironmentFailure> {
        let mut components = self.components.lock().expect("lock");
        match components.get_mut(component) {
            Some(state) => {
                *state = running;
                Ok(())
            }
            None => Err(EnvironmentFailure::new(
                EnvironmentPhase::Control,
                format!("no such component '{component}'"),
            )),
        }
    }
}

#[async_trait]
impl EnvironmentControl for FakeEnvironment {
    async fn stop(&self, component: &str) -> Result<(), EnvironmentFailure> {
        self.set(component, false)
    }

    async fn start(&self, component: &str) -> Result<(), EnvironmentFailure> {
        self.set(component, true)
    }

    async fn teardown(&self) -> Result<(), EnvironmentFailure> {
        for state in self.components.lock().expect("lock").values_mut() {
            *state = false;
        }
        Ok(())
    }

    async fn rebuild(&self) -> Result<(), EnvironmentFailure> {
        for state in self.components.lock().expect("lock").values_mut() {
            *state = true;
        }
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
        BTreeMap::from([("environment".to_string(), "fake".to_string())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_dirs_live_outside_the_catalog_base() {
        let dirs = TempDirs::new();
        let scratch = dirs.scratch("region");
        assert!(scratch.exists());
        assert!(!scratch.starts_with(dirs.base()));
    }

    #[tokio::test]
    async fn memory_engine_snapshots_are_valid_rdb_files() {
        let dirs = TempDirs::new();
        let engine = MemoryKeyValue::new(&dirs.scratch("kv"));
        engine.insert("a", b"1");
        let before = engine.last_save().await.expect("last save");
        engine.background_save().await.expect("save");
        assert!(engine.last_save().await.expect("last save") > before);
        let raw = std::fs::read(dirs.scratch("kv").join("dump.rdb")).expect("read");
        assert!(raw.starts_with(b"REDIS"));
        assert_eq!(raw[raw.len() - 9], 0xFF);
    }
}
