use crate::backup::archive::{self, ArchiveEntry};
use crate::backup::{blocking, EngineError, ProduceContext, Produced};
use crate::meta::models::{EngineKind, Provenance, StrategyKind};
use crate::util::poll::poll_until;
use async_trait::async_trait;
use chrono::Utc;
use flate2::Compression;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const EXPORT_FORMAT: &str = "bdr-keyspace-export";
const SCAN_BATCH: usize = 500;
const SNAPSHOT_RESTORE_NAME: &str = "dump.rdb";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistencePaths {
    pub snapshot: PathBuf,
    /// Directory name holding multi-part append logs, relative to the data dir.
    pub append_dir: Option<String>,
    pub append_files: Vec<PathBuf>,
}

#[async_trait]
pub trait KeyValueEngine: Send + Sync {
    async fn last_save(&self) -> Result<i64, EngineError>;
    async fn background_save(&self) -> Result<(), EngineError>;
    async fn rewrite_append_log(&self) -> Result<(), EngineError>;
    async fn rewrite_in_progress(&self) -> Result<bool, EngineError>;
    async fn persistence_paths(&self) -> Result<PersistencePaths, EngineError>;
    async fn scan(&self, cursor: u64, count: usize) -> Result<(u64, Vec<String>), EngineError>;
    async fn value_type(&self, key: &str) -> Result<String, EngineError>;
    async fn get_scalar(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError>;
    async fn set_scalar(&self, key: &str, value: &[u8]) -> Result<(), EngineError>;
    async fn key_count(&self) -> Result<u64, EngineError>;
    async fn server_version(&self) -> Result<String, EngineError>;
}

pub struct RedisEngine {
    connection: Arc<Mutex<redis::aio::ConnectionManager>>,
    data_dir_override: Option<PathBuf>,
}

impl RedisEngine {
    pub async fn connect(url: &str, data_dir_override: Option<PathBuf>) -> Result<Self, String> {
        let client = redis::Client::open(url).map_err(|err| format!("redis error: {err}"))?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|err| format!("redis connect failed: {err}"))?;
        Ok(Self {
            connection: Arc::new(Mutex::new(manager)),
            data_dir_override,
        })
    }

    async fn config_get(&self, key: &str) -> Result<Option<String>, EngineError> {
        let mut conn = self.connection.lock().await;
        let pairs: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok(pairs.into_iter().nth(1).filter(|value| !value.is_empty()))
    }

    async fn info_persistence(&self) -> Result<BTreeMap<String, String>, EngineError> {
        let mut conn = self.connection.lock().await;
        let raw: String = redis::cmd("INFO")
            .arg("persistence")
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok(parse_info(&raw))
    }
}

#[async_trait]
impl KeyValueEngine for RedisEngine {
    async fn last_save(&self) -> Result<i64, EngineError> {
        let mut conn = self.connection.lock().await;
        let value: i64 = redis::cmd("LASTSAVE")
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok(value)
    }

    async fn background_save(&self) -> Result<(), EngineError> {
        let mut conn = self.connection.lock().await;
        let result: Result<String, redis::RedisError> =
            redis::cmd("BGSAVE").query_async(&mut *conn).await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("already in progress") => Ok(()),
            Err(err) => Err(map_redis_error(err)),
        }
    }

    async fn rewrite_append_log(&self) -> Result<(), EngineError> {
        let mut conn = self.connection.lock().await;
        let _: String = redis::cmd("BGREWRITEAOF")
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn rewrite_in_progress(&self) -> Result<bool, EngineError> {
        let info = self.info_persistence().await?;
        let flag = |key: &str| info.get(key).is_some_and(|value| value == "1");
        Ok(flag("aof_rewrite_in_progress") || flag("aof_rewrite_scheduled"))
    }

    async fn persistence_paths(&self) -> Result<PersistencePaths, EngineError> {
        let dir = match &self.data_dir_override {
            Some(dir) => dir.clone(),
            None => PathBuf::from(
                self.config_get("dir")
                    .await?
                    .ok_or_else(|| EngineError::Command("redis dir is not set".into()))?,
            ),
        };
        let snapshot_name = self
            .config_get("dbfilename")
            .await?
            .unwrap_or_else(|| SNAPSHOT_RESTORE_NAME.to_string());
        let append_dir = self.config_get("appenddirname").await?;
        let append_files = match &append_dir {
            Some(name) => list_files(&dir.join(name)).await?,
            None => {
                let file = self
                    .config_get("appendfilename")
                    .await?
                    .unwrap_or_else(|| "appendonly.aof".to_string());
                let path = dir.join(file);
                if path.exists() {
                    vec![path]
                } else {
                    Vec::new()
                }
            }
        };
        Ok(PersistencePaths {
            snapshot: dir.join(snapshot_name),
            append_dir,
            append_files,
        })
    }

    async fn scan(&self, cursor: u64, count: usize) -> Result<(u64, Vec<String>), EngineError> {
        let mut conn = self.connection.lock().await;
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok((next, keys))
    }

    async fn value_type(&self, key: &str) -> Result<String, EngineError> {
        let mut conn = self.connection.lock().await;
        let kind: String = redis::cmd("TYPE")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok(kind)
    }

    async fn get_scalar(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let mut conn = self.connection.lock().await;
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(map_redis_error)?;
        Ok(value)
    }

    async fn set_scalar(&self, key: &str, value: &[u8]) -> Result<(), EngineError> {
        let mut conn = self.connection.lock().await;
        let _: () = conn.set(key, value).await.map_err(map_redis_error)?;
        Ok(())
    }

    async fn key_count(&self) -> Result<u64, EngineError> {
        let mut conn = self.connection.lock().await;
        let count: u64 = redis::cmd("DBSIZE")
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        Ok(count)
    }

    async fn server_version(&self) -> Result<String, EngineError> {
        let mut conn = self.connection.lock().await;
        let raw: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut *conn)
            .await
            .map_err(map_redis_error)?;
        parse_info(&raw)
            .remove("redis_version")
            .ok_or_else(|| EngineError::Command("redis_version missing from INFO".into()))
    }
}

fn map_redis_error(err: redis::RedisError) -> EngineError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        return EngineError::Io(format!("redis io failed: {err}"));
    }
    EngineError::Command(format!("redis command failed: {err}"))
}

pub fn parse_info(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

async fn list_files(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(EngineError::Io(format!("read {} failed: {err}", dir.display()))),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| EngineError::Io(format!("scan {} failed: {err}", dir.display())))?
    {
        if entry.file_type().await.is_ok_and(|kind| kind.is_file()) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Keyspace export document. Only string values are captured; every other
/// type is recorded as a typed placeholder, so a restore from an export
/// reproduces scalar keys only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyspaceExport {
    pub format: String,
    pub version: u32,
    pub service: String,
    pub created_at: String,
    pub key_count: u64,
    pub max_keys: usize,
    pub truncated: bool,
    pub captured_scalars: usize,
    pub placeholders: usize,
    pub entries: Vec<ExportEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEntry {
    pub key: String,
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default)]
    pub placeholder: bool,
}

impl ExportEntry {
    pub fn scalar_bytes(&self) -> Result<Option<Vec<u8>>, String> {
        let Some(value) = &self.value else {
            return Ok(None);
        };
        match self.encoding.as_deref() {
            Some("hex") => hex::decode(value)
                .map(Some)
                .map_err(|err| format!("key {} has bad hex value: {err}", self.key)),
            _ => Ok(Some(value.as_bytes().to_vec())),
        }
    }
}

pub(crate) async fn produce(
    engine: &dyn KeyValueEngine,
    ctx: &ProduceContext<'_>,
) -> Result<Produced, EngineError> {
    let mut details = BTreeMap::new();
    let tool = match ctx.strategy {
        StrategyKind::Snapshot => {
            produce_snapshot(engine, ctx, &mut details).await?;
            "BGSAVE"
        }
        StrategyKind::AppendLogRewrite => {
            produce_append_log(engine, ctx, &mut details).await?;
            "BGREWRITEAOF"
        }
        StrategyKind::KeyspaceExport => {
            produce_export(engine, ctx, &mut details).await?;
            "SCAN"
        }
        _ => return Err(EngineError::Unsupported),
    };
    Ok(Produced {
        provenance: Provenance {
            engine: Some(EngineKind::KeyValue),
            tool: tool.to_string(),
            source_engine_version: engine.server_version().await.ok(),
            details,
        },
    })
}

async fn produce_snapshot(
    engine: &dyn KeyValueEngine,
    ctx: &ProduceContext<'_>,
    details: &mut BTreeMap<String, String>,
) -> Result<(), EngineError> {
    let before = engine.last_save().await?;
    engine.background_save().await?;
    let saved_at = poll_until(ctx.settings.poll, || async move {
        let token = engine.last_save().await.map_err(|err| err.to_string())?;
        Ok((token > before).then_some(token))
    })
    .await?;
    let paths = engine.persistence_paths().await?;
    let source = paths.snapshot.clone();
    let dest = ctx.dest.to_path_buf();
    blocking(move || archive::copy_file(&source, &dest)).await?;
    details.insert("lastSave".to_string(), saved_at.to_string());
    details.insert(
        "sourceFile".to_string(),
        paths.snapshot.to_string_lossy().to_string(),
    );
    Ok(())
}

async fn produce_append_log(
    engine: &dyn KeyValueEngine,
    ctx: &ProduceContext<'_>,
    details: &mut BTreeMap<String, String>,
) -> Result<(), EngineError> {
    engine.rewrite_append_log().await?;
    poll_until(ctx.settings.poll, || async move {
        let busy = engine
            .rewrite_in_progress()
            .await
            .map_err(|err| err.to_string())?;
        Ok((!busy).then_some(()))
    })
    .await?;
    let paths = engine.persistence_paths().await?;
    if paths.append_files.is_empty() {
        return Err(EngineError::Command("append log is not enabled".into()));
    }
    let now = Utc::now();
    let entries: Vec<ArchiveEntry> = paths
        .append_files
        .iter()
        .map(|file| {
            let name = file
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "appendonly.aof".to_string());
            let member = match &paths.append_dir {
                Some(dir) => format!("{dir}/{name}"),
                None => name,
            };
            ArchiveEntry::file(member, file.clone(), now)
        })
        .collect();
    details.insert("files".to_string(), entries.len().to_string());
    if let Some(dir) = &paths.append_dir {
        details.insert("appendDir".to_string(), dir.clone());
    }
    let dest = ctx.dest.to_path_buf();
    blocking(move || archive::pack_entries(&dest, &entries, Compression::default())).await?;
    Ok(())
}

async fn produce_export(
    engine: &dyn KeyValueEngine,
    ctx: &ProduceContext<'_>,
    details: &mut BTreeMap<String, String>,
) -> Result<(), EngineError> {
    let max_keys = ctx.settings.keyspace_export_max_keys;
    let key_count = engine.key_count().await?;
    let (keys, truncated) = scan_capped(engine, max_keys).await?;
    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        entries.push(export_entry(engine, key).await?);
    }
    let captured_scalars = entries.iter().filter(|entry| !entry.placeholder).count();
    let export = KeyspaceExport {
        format: EXPORT_FORMAT.to_string(),
        version: 1,
        service: ctx.service.to_string(),
        created_at: Utc::now().to_rfc3339(),
        key_count,
        max_keys,
        truncated,
        captured_scalars,
        placeholders: entries.len() - captured_scalars,
        entries,
    };
    if truncated {
        tracing::warn!(
            service = %ctx.service,
            max_keys,
            key_count,
            "keyspace export truncated at cardinality cap"
        );
    }
    details.insert("truncated".to_string(), truncated.to_string());
    details.insert("capturedScalars".to_string(), captured_scalars.to_string());
    details.insert("placeholders".to_string(), export.placeholders.to_string());
    let payload = serde_json::to_vec(&export)
        .map_err(|err| EngineError::Io(format!("export encode failed: {err}")))?;
    let dest = ctx.dest.to_path_buf();
    blocking(move || archive::gzip_to_file(&dest, &payload, Compression::default())).await?;
    Ok(())
}

async fn scan_capped(
    engine: &dyn KeyValueEngine,
    max_keys: usize,
) -> Result<(Vec<String>, bool), EngineError> {
    let mut keys = BTreeSet::new();
    let mut cursor = 0u64;
    loop {
        let (next, batch) = engine.scan(cursor, SCAN_BATCH).await?;
        for key in batch {
            if keys.len() >= max_keys && !keys.contains(&key) {
                return Ok((keys.into_iter().collect(), true));
            }
            keys.insert(key);
        }
        if next == 0 {
            return Ok((keys.into_iter().collect(), false));
        }
        cursor = next;
    }
}

async fn export_entry(engine: &dyn KeyValueEngine, key: String) -> Result<ExportEntry, EngineError> {
    let value_type = engine.value_type(&key).await?;
    if value_type != "string" {
        return Ok(ExportEntry {
            key,
            value_type,
            value: None,
            encoding: None,
            placeholder: true,
        });
    }
    let (value, encoding) = match engine.get_scalar(&key).await? {
        Some(bytes) => match String::from_utf8(bytes) {
            Ok(text) => (Some(text), Some("utf8".to_string())),
            Err(err) => (Some(hex::encode(err.into_bytes())), Some("hex".to_string())),
        },
        None => (None, None),
    };
    Ok(ExportEntry {
        key,
        value_type,
        placeholder: value.is_none(),
        value,
        encoding,
    })
}

pub fn read_export(path: &Path) -> Result<KeyspaceExport, String> {
    let raw = archive::gunzip_file(path)?;
    serde_json::from_slice(&raw).map_err(|err| format!("export parse failed: {err}"))
}

/// Places persistence files in `data_dir` so a fresh instance loads them on start.
pub(crate) fn stage(strategy: StrategyKind, artifact: &Path, data_dir: &Path) -> Result<u64, String> {
    match strategy {
        StrategyKind::Snapshot => {
            archive::copy_file(artifact, &data_dir.join(SNAPSHOT_RESTORE_NAME))?;
            Ok(1)
        }
        StrategyKind::AppendLogRewrite => archive::unpack_tar_gz(artifact, data_dir),
        _ => Ok(0),
    }
}

pub(crate) async fn load_export(
    engine: &dyn KeyValueEngine,
    artifact: &Path,
) -> Result<u64, EngineError> {
    let path = artifact.to_path_buf();
    let export = blocking(move || read_export(&path)).await?;
    let mut written = 0u64;
    for entry in &export.entries {
        let Some(bytes) = entry.scalar_bytes().map_err(EngineError::Command)? else {
            continue;
        };
        engine.set_scalar(&entry.key, &bytes).await?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::{
        parse_info, produce, read_export, ExportEntry, KeyValueEngine, PersistencePaths,
    };
    use crate::backup::{EngineError, ExecutorSettings, ProduceContext};
    use crate::meta::catalog::ArtifactCatalog;
    use crate::meta::models::StrategyKind;
    use crate::test_support;
    use crate::util::poll::PollSettings;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Engine whose save token never moves and whose rewrite never finishes.
    struct ScriptedEngine {
        keys: Vec<(String, &'static str)>,
        saves: AtomicUsize,
        rewrites: AtomicUsize,
    }

    impl ScriptedEngine {
        fn new(keys: Vec<(String, &'static str)>) -> Self {
            Self {
                keys,
                saves: AtomicUsize::new(0),
                rewrites: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl KeyValueEngine for ScriptedEngine {
        async fn last_save(&self) -> Result<i64, EngineError> {
            Ok(1_700_000_000)
        }

        async fn background_save(&self) -> Result<(), EngineError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rewrite_append_log(&self) -> Result<(), EngineError> {
            self.rewrites.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rewrite_in_progress(&self) -> Result<bool, EngineError> {
            Ok(true)
        }

        async fn persistence_paths(&self) -> Result<PersistencePaths, EngineError> {
            Err(EngineError::Command("persistence paths not scripted".into()))
        }

        async fn scan(&self, cursor: u64, count: usize) -> Result<(u64, Vec<String>), EngineError> {
            let start = cursor as usize;
            let end = (start + count.min(6)).min(self.keys.len());
            let batch = self.keys[start..end].iter().map(|(key, _)| key.clone()).collect();
            let next = if end == self.keys.len() { 0 } else { end as u64 };
            Ok((next, batch))
        }

        async fn value_type(&self, key: &str) -> Result<String, EngineError> {
            self.keys
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, kind)| kind.to_string())
                .ok_or_else(|| EngineError::Command(format!("no such key {key}")))
        }

        async fn get_scalar(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
            Ok(Some(format!("value-of-{key}").into_bytes()))
        }

        async fn set_scalar(&self, _key: &str, _value: &[u8]) -> Result<(), EngineError> {
            Ok(())
        }

        async fn key_count(&self) -> Result<u64, EngineError> {
            Ok(self.keys.len() as u64)
        }

        async fn server_version(&self) -> Result<String, EngineError> {
            Ok("7.2.4".to_string())
        }
    }

    fn short_poll(max_keys: usize) -> ExecutorSettings {
        ExecutorSettings {
            poll: PollSettings::fixed(Duration::from_millis(10), Duration::from_millis(200)),
            keyspace_export_max_keys: max_keys,
            ..test_support::executor_settings()
        }
    }

    async fn run(
        engine: &ScriptedEngine,
        strategy: StrategyKind,
        settings: &ExecutorSettings,
        dirs: &test_support::TempDirs,
    ) -> (Result<(), EngineError>, std::path::PathBuf) {
        let catalog = ArtifactCatalog::new(dirs.base());
        let dest = dirs.scratch("out").join("artifact");
        let ctx = ProduceContext {
            service: "cache",
            strategy,
            dest: &dest,
            work_dir: dirs.scratch("work"),
            settings,
            catalog: &catalog,
        };
        let result = produce(engine, &ctx).await.map(|_| ());
        (result, dest)
    }

    #[tokio::test]
    async fn snapshot_times_out_when_save_token_never_advances() {
        let dirs = test_support::TempDirs::new();
        let engine = ScriptedEngine::new(Vec::new());
        let (result, dest) = run(&engine, StrategyKind::Snapshot, &short_poll(1000), &dirs).await;
        match result {
            Err(EngineError::Timeout { waited }) => assert!(waited >= Duration::from_millis(200)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(engine.saves.load(Ordering::SeqCst), 1);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn append_log_rewrite_times_out_while_rewrite_stays_in_progress() {
        let dirs = test_support::TempDirs::new();
        let engine = ScriptedEngine::new(Vec::new());
        let (result, dest) =
            run(&engine, StrategyKind::AppendLogRewrite, &short_poll(1000), &dirs).await;
        assert!(matches!(result, Err(EngineError::Timeout { .. })), "{result:?}");
        assert_eq!(engine.rewrites.load(Ordering::SeqCst), 1);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn export_stops_at_the_key_cap_and_marks_non_scalars() {
        let dirs = test_support::TempDirs::new();
        let mut keys: Vec<(String, &'static str)> =
            (0..11).map(|n| (format!("session:{n:02}"), "string")).collect();
        keys.insert(2, ("profile:7".to_string(), "hash"));
        let engine = ScriptedEngine::new(keys);

        let (result, dest) = run(&engine, StrategyKind::KeyspaceExport, &short_poll(5), &dirs).await;
        result.expect("export");
        let export = read_export(&dest).expect("read export");
        assert!(export.truncated);
        assert_eq!(export.key_count, 12);
        assert_eq!(export.max_keys, 5);
        assert_eq!(export.entries.len(), 5);
        assert_eq!(export.captured_scalars, 4);
        assert_eq!(export.placeholders, 1);
        let hash = export
            .entries
            .iter()
            .find(|entry| entry.key == "profile:7")
            .expect("hash entry");
        assert!(hash.placeholder);
        assert_eq!(hash.value_type, "hash");
        assert_eq!(hash.value, None);
    }

    #[test]
    fn parse_info_reads_key_value_lines() {
        let info = parse_info(
            "# Persistence\r\nloading:0\r\naof_rewrite_in_progress:1\r\nrdb_last_save_time:1700000000\r\n",
        );
        assert_eq!(info.get("aof_rewrite_in_progress").map(String::as_str), Some("1"));
        assert_eq!(
            info.get("rdb_last_save_time").map(String::as_str),
            Some("1700000000")
        );
        assert!(!info.contains_key("# Persistence"));
    }

    #[test]
    fn export_entries_decode_hex_values() {
        let entry = ExportEntry {
            key: "bin".into(),
            value_type: "string".into(),
            value: Some("ff00".into()),
            encoding: Some("hex".into()),
            placeholder: false,
        };
        assert_eq!(entry.scalar_bytes().expect("bytes"), Some(vec![0xff, 0x00]));
        let placeholder = ExportEntry {
            key: "list".into(),
            value_type: "list".into(),
            value: None,
            encoding: None,
            placeholder: true,
        };
        assert_eq!(placeholder.scalar_bytes().expect("bytes"), None);
    }
}
