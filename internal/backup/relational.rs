use crate::backup::archive::{self, ArchiveEntry};
use crate::backup::{blocking, EngineError, ProduceContext, Produced};
use crate::meta::models::{EngineKind, Provenance, StrategyKind};
use crate::util::poll::poll_until;
use crate::util::process::{run_tool, ToolCommand};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::Compression;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const BASE_MEMBER: &str = "base.tar.gz";
pub const WAL_MEMBER: &str = "pg_wal.tar.gz";
pub const LAST_SEGMENT_DETAIL: &str = "lastSegment";
const SEGMENT_NAME_LEN: usize = 24;

/// Streaming base copy plus continuous log archiving.
#[async_trait]
pub trait RelationalEngine: Send + Sync {
    /// Writes `base.tar.gz` and `pg_wal.tar.gz` into `dest_dir`.
    async fn base_backup(&self, dest_dir: &Path) -> Result<(), EngineError>;
    /// Closes the current log segment and returns its name.
    async fn switch_log(&self) -> Result<String, EngineError>;
    fn archive_dir(&self) -> Option<&Path>;
    async fn server_version(&self) -> Result<String, EngineError>;
    async fn count_tables(&self) -> Result<u64, EngineError>;
}

pub struct PgToolsEngine {
    url: String,
    archive_dir: Option<PathBuf>,
    tool_timeout: Duration,
    pool: PgPool,
}

impl PgToolsEngine {
    pub fn new(
        url: &str,
        archive_dir: Option<PathBuf>,
        tool_timeout: Duration,
    ) -> Result<Self, String> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(url)
            .map_err(|err| format!("postgres dsn invalid: {err}"))?;
        Ok(Self {
            url: url.to_string(),
            archive_dir,
            tool_timeout,
            pool,
        })
    }
}

#[async_trait]
impl RelationalEngine for PgToolsEngine {
    async fn base_backup(&self, dest_dir: &Path) -> Result<(), EngineError> {
        let command = ToolCommand::new("pg_basebackup", self.tool_timeout)
            .args(["-d", self.url.as_str(), "-D"])
            .arg(dest_dir.to_string_lossy())
            .args(["-Ft", "-z", "-X", "stream", "--checkpoint=fast", "--no-password"]);
        run_tool(command).await.map_err(EngineError::Tool)?;
        Ok(())
    }

    async fn switch_log(&self) -> Result<String, EngineError> {
        sqlx::query_scalar::<_, String>("SELECT pg_walfile_name(pg_switch_wal())")
            .fetch_one(&self.pool)
            .await
            .map_err(|err| EngineError::Command(format!("pg_switch_wal failed: {err}")))
    }

    fn archive_dir(&self) -> Option<&Path> {
        self.archive_dir.as_deref()
    }

    async fn server_version(&self) -> Result<String, EngineError> {
        sqlx::query_scalar::<_, String>("SHOW server_version")
            .fetch_one(&self.pool)
            .await
            .map_err(|err| EngineError::Command(format!("server_version failed: {err}")))
    }

    async fn count_tables(&self) -> Result<u64, EngineError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM information_schema.tables \
             WHERE table_type = 'BASE TABLE' \
             AND table_schema NOT IN ('pg_catalog', 'information_schema')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|err| EngineError::Command(format!("table count failed: {err}")))?;
        Ok(count.max(0) as u64)
    }
}

pub(crate) async fn produce(
    engine: &dyn RelationalEngine,
    ctx: &ProduceContext<'_>,
) -> Result<Produced, EngineError> {
    match ctx.strategy {
        StrategyKind::BaseBackup => produce_base_backup(engine, ctx).await,
        StrategyKind::LogArchive => produce_log_archive(engine, ctx).await,
        _ => Err(EngineError::Unsupported),
    }
}

async fn produce_base_backup(
    engine: &dyn RelationalEngine,
    ctx: &ProduceContext<'_>,
) -> Result<Produced, EngineError> {
    let stage = ctx.work_dir.join("base");
    tokio::fs::create_dir_all(&stage)
        .await
        .map_err(|err| EngineError::Io(format!("mkdir {} failed: {err}", stage.display())))?;
    engine.base_backup(&stage).await?;
    if !stage.join(BASE_MEMBER).exists() {
        return Err(EngineError::Command(format!(
            "base copy produced no {BASE_MEMBER}"
        )));
    }
    let dest = ctx.dest.to_path_buf();
    let summary = blocking(move || {
        let entries = archive::collect_directory(&stage, "")?;
        archive::pack_entries(&dest, &entries, Compression::fast())
    })
    .await?;
    let mut details = BTreeMap::new();
    details.insert("checkpoint".to_string(), "fast".to_string());
    details.insert("walMethod".to_string(), "stream".to_string());
    details.insert("members".to_string(), summary.files.to_string());
    Ok(Produced {
        provenance: Provenance {
            engine: Some(EngineKind::Relational),
            tool: "pg_basebackup".to_string(),
            source_engine_version: engine.server_version().await.ok(),
            details,
        },
    })
}

async fn produce_log_archive(
    engine: &dyn RelationalEngine,
    ctx: &ProduceContext<'_>,
) -> Result<Produced, EngineError> {
    let archive_dir = engine
        .archive_dir()
        .ok_or_else(|| EngineError::Command("no log archive directory configured".into()))?
        .to_path_buf();
    let previous = last_archived_segment(ctx).await;
    let switched = engine.switch_log().await?;
    tracing::debug!(service = %ctx.service, segment = %switched, "log segment switched");

    let dir = archive_dir.clone();
    let target = switched.clone();
    let segments = poll_until(ctx.settings.poll, move || {
        let dir = dir.clone();
        let target = target.clone();
        async move {
            let segments = list_segments(&dir).await?;
            let archived = segments.last().is_some_and(|newest| newest.0 >= target);
            Ok(archived.then_some(segments))
        }
    })
    .await?;

    let mut selected: Vec<(String, DateTime<Utc>)> = segments
        .iter()
        .filter(|(name, _)| previous.as_ref().is_none_or(|last| name > last))
        .cloned()
        .collect();
    let overlap = selected.is_empty();
    if overlap {
        selected.extend(segments.last().cloned());
    }
    let newest = selected
        .last()
        .map(|(name, _)| name.clone())
        .ok_or_else(|| EngineError::Command("log archive directory holds no segments".into()))?;
    let entries: Vec<ArchiveEntry> = selected
        .iter()
        .map(|(name, modified)| {
            ArchiveEntry::file(format!("pg_wal/{name}"), archive_dir.join(name), *modified)
        })
        .collect();
    let dest = ctx.dest.to_path_buf();
    let count = entries.len();
    blocking(move || archive::pack_entries(&dest, &entries, Compression::default())).await?;

    let mut details = BTreeMap::new();
    details.insert(LAST_SEGMENT_DETAIL.to_string(), newest);
    details.insert("segments".to_string(), count.to_string());
    if overlap {
        details.insert("overlap".to_string(), "true".to_string());
    }
    Ok(Produced {
        provenance: Provenance {
            engine: Some(EngineKind::Relational),
            tool: "pg_switch_wal".to_string(),
            source_engine_version: engine.server_version().await.ok(),
            details,
        },
    })
}

async fn last_archived_segment(ctx: &ProduceContext<'_>) -> Option<String> {
    let previous = ctx
        .catalog
        .list(ctx.service, StrategyKind::LogArchive)
        .await
        .ok()?;
    previous
        .iter()
        .find_map(|artifact| artifact.provenance.details.get(LAST_SEGMENT_DETAIL).cloned())
}

pub fn is_segment_name(name: &str) -> bool {
    name.len() == SEGMENT_NAME_LEN && name.chars().all(|ch| ch.is_ascii_hexdigit())
}

async fn list_segments(dir: &Path) -> Result<Vec<(String, DateTime<Utc>)>, String> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| format!("read {} failed: {err}", dir.display()))?;
    let mut segments = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| format!("scan {} failed: {err}", dir.display()))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_segment_name(&name) {
            continue;
        }
        let modified = entry
            .metadata()
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);
        segments.push((name, modified));
    }
    segments.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(segments)
}

/// Unpacks the base copy into `data_dir` so a fresh instance can start from it.
pub(crate) fn stage_base_backup(artifact_path: &Path, data_dir: &Path) -> Result<u64, String> {
    let scratch = tempfile::tempdir_in(data_dir.parent().unwrap_or(data_dir))
        .map_err(|err| format!("scratch dir failed: {err}"))?;
    archive::unpack_tar_gz(artifact_path, scratch.path())?;
    let base = scratch.path().join(BASE_MEMBER);
    if !base.exists() {
        return Err(format!("{BASE_MEMBER} missing from artifact"));
    }
    let mut files = archive::unpack_tar_gz(&base, data_dir)?;
    let wal = scratch.path().join(WAL_MEMBER);
    if wal.exists() {
        files += archive::unpack_tar_gz(&wal, &data_dir.join("pg_wal"))?;
    }
    Ok(files)
}
