use crate::backup::archive::{self, ArchiveEntry};
use crate::backup::{blocking, EngineError, ProduceContext, Produced};
use crate::meta::models::{EngineKind, Provenance, StrategyKind};
use crate::util::process::{run_tool, ToolCommand};
use async_trait::async_trait;
use chrono::Utc;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DUMP_FORMAT: &str = "bdr-logical-dump";
pub const MANIFEST_MEMBER: &str = "manifest.json";
const COLLECTIONS_DIR: &str = "collections";

/// Collection-granular logical export and import.
#[async_trait]
pub trait DocumentEngine: Send + Sync {
    fn database(&self) -> &str;
    async fn list_collections(&self) -> Result<Vec<String>, EngineError>;
    /// Writes one JSON document per line to `dest`.
    async fn export_collection(&self, collection: &str, dest: &Path) -> Result<(), EngineError>;
    /// Replaces `collection` with the documents in `source`; returns how many were loaded.
    async fn import_collection(&self, collection: &str, source: &Path)
        -> Result<u64, EngineError>;
    async fn count_documents(&self) -> Result<u64, EngineError>;
    async fn server_version(&self) -> Result<String, EngineError>;
}

pub struct MongoToolsEngine {
    url: String,
    database: String,
    collections: Vec<String>,
    tool_timeout: Duration,
}

impl MongoToolsEngine {
    pub fn new(
        url: &str,
        database: Option<String>,
        collections: Vec<String>,
        tool_timeout: Duration,
    ) -> Self {
        let database = database.unwrap_or_else(|| database_from_url(url));
        Self {
            url: url.to_string(),
            database,
            collections,
            tool_timeout,
        }
    }

    async fn eval(&self, script: &str) -> Result<String, EngineError> {
        let command = ToolCommand::new("mongosh", self.tool_timeout)
            .arg(self.url.as_str())
            .args(["--quiet", "--eval"])
            .arg(script);
        let output = run_tool(command).await.map_err(EngineError::Tool)?;
        Ok(output.stdout_text())
    }

    fn db_expr(&self) -> String {
        format!("db.getSiblingDB({})", js_string(&self.database))
    }
}

#[async_trait]
impl DocumentEngine for MongoToolsEngine {
    fn database(&self) -> &str {
        &self.database
    }

    async fn list_collections(&self) -> Result<Vec<String>, EngineError> {
        if !self.collections.is_empty() {
            return Ok(self.collections.clone());
        }
        let raw = self
            .eval(&format!(
                "JSON.stringify({}.getCollectionNames())",
                self.db_expr()
            ))
            .await?;
        let mut names: Vec<String> = serde_json::from_str(raw.trim())
            .map_err(|err| EngineError::Command(format!("collection list parse failed: {err}")))?;
        names.retain(|name| !name.starts_with("system."));
        names.sort();
        Ok(names)
    }

    async fn export_collection(&self, collection: &str, dest: &Path) -> Result<(), EngineError> {
        let command = ToolCommand::new("mongoexport", self.tool_timeout)
            .arg(format!("--uri={}", self.url))
            .arg(format!("--db={}", self.database))
            .arg(format!("--collection={collection}"))
            .arg(format!("--out={}", dest.display()))
            .arg("--quiet");
        run_tool(command).await.map_err(EngineError::Tool)?;
        Ok(())
    }

    async fn import_collection(
        &self,
        collection: &str,
        source: &Path,
    ) -> Result<u64, EngineError> {
        let command = ToolCommand::new("mongoimport", self.tool_timeout)
            .arg(format!("--uri={}", self.url))
            .arg(format!("--db={}", self.database))
            .arg(format!("--collection={collection}"))
            .arg(format!("--file={}", source.display()))
            .args(["--drop", "--quiet"]);
        run_tool(command).await.map_err(EngineError::Tool)?;
        let path = source.to_path_buf();
        blocking(move || count_documents_in(&path)).await
    }

    async fn count_documents(&self) -> Result<u64, EngineError> {
        let db = self.db_expr();
        let raw = self
            .eval(&format!(
                "{db}.getCollectionNames().reduce((n, c) => n + {db}.getCollection(c).countDocuments({{}}), 0)"
            ))
            .await?;
        raw.trim()
            .parse::<u64>()
            .map_err(|err| EngineError::Command(format!("document count parse failed: {err}")))
    }

    async fn server_version(&self) -> Result<String, EngineError> {
        Ok(self.eval("db.version()").await?.trim().to_string())
    }
}

fn database_from_url(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    let after_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    after_scheme
        .split_once('/')
        .map(|(_, db)| db.trim_matches('/'))
        .filter(|db| !db.is_empty())
        .unwrap_or("admin")
        .to_string()
}

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("'{value}'"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpManifest {
    pub format: String,
    pub version: u32,
    pub service: String,
    pub database: String,
    pub created_at: String,
    pub collections: Vec<DumpCollection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpCollection {
    pub name: String,
    pub file: String,
    pub documents: u64,
}

impl DumpManifest {
    pub fn total_documents(&self) -> u64 {
        self.collections.iter().map(|entry| entry.documents).sum()
    }
}

/// Counts non-blank lines; each line of an export holds one document.
pub fn count_documents_in(path: &Path) -> Result<u64, String> {
    let file = File::open(path).map_err(|err| format!("open {} failed: {err}", path.display()))?;
    count_document_lines(BufReader::new(file))
}

pub fn count_document_lines(reader: impl BufRead) -> Result<u64, String> {
    let mut count = 0u64;
    for line in reader.lines() {
        let line = line.map_err(|err| format!("read export failed: {err}"))?;
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

pub(crate) async fn produce(
    engine: &dyn DocumentEngine,
    ctx: &ProduceContext<'_>,
) -> Result<Produced, EngineError> {
    if ctx.strategy != StrategyKind::LogicalDump {
        return Err(EngineError::Unsupported);
    }
    let stage = ctx.work_dir.join(COLLECTIONS_DIR);
    tokio::fs::create_dir_all(&stage)
        .await
        .map_err(|err| EngineError::Io(format!("mkdir {} failed: {err}", stage.display())))?;

    let now = Utc::now();
    let mut collections = Vec::new();
    let mut entries = Vec::new();
    for name in engine.list_collections().await? {
        let member = archive::sanitize_archive_path(COLLECTIONS_DIR, &format!("{name}.jsonl"));
        let local = stage.join(format!("{}.jsonl", collections.len()));
        engine.export_collection(&name, &local).await?;
        let counted = local.clone();
        let documents = blocking(move || count_documents_in(&counted)).await?;
        tracing::debug!(service = %ctx.service, collection = %name, documents, "collection exported");
        entries.push(ArchiveEntry::file(member.clone(), local, now));
        collections.push(DumpCollection {
            name,
            file: member,
            documents,
        });
    }

    let manifest = DumpManifest {
        format: DUMP_FORMAT.to_string(),
        version: 1,
        service: ctx.service.to_string(),
        database: engine.database().to_string(),
        created_at: now.to_rfc3339(),
        collections,
    };
    let encoded = serde_json::to_vec_pretty(&manifest)
        .map_err(|err| EngineError::Io(format!("manifest encode failed: {err}")))?;
    entries.insert(0, ArchiveEntry::bytes(MANIFEST_MEMBER, encoded, now));

    let dest = ctx.dest.to_path_buf();
    blocking(move || archive::pack_entries(&dest, &entries, Compression::default())).await?;

    let mut details = BTreeMap::new();
    details.insert("database".to_string(), manifest.database.clone());
    details.insert(
        "collections".to_string(),
        manifest.collections.len().to_string(),
    );
    details.insert(
        "documents".to_string(),
        manifest.total_documents().to_string(),
    );
    Ok(Produced {
        provenance: Provenance {
            engine: Some(EngineKind::Document),
            tool: "mongoexport".to_string(),
            source_engine_version: engine.server_version().await.ok(),
            details,
        },
    })
}

pub fn read_manifest(artifact: &Path) -> Result<DumpManifest, String> {
    let raw = archive::read_member(artifact, MANIFEST_MEMBER)?
        .ok_or_else(|| format!("{MANIFEST_MEMBER} missing from dump"))?;
    serde_json::from_slice(&raw).map_err(|err| format!("manifest parse failed: {err}"))
}

/// Imports every collection listed in the dump manifest and returns the
/// engine's document count afterwards.
pub(crate) async fn restore_dump(
    engine: &dyn DocumentEngine,
    artifact: &Path,
    work_root: &Path,
) -> Result<u64, EngineError> {
    tokio::fs::create_dir_all(work_root)
        .await
        .map_err(|err| EngineError::Io(format!("mkdir {} failed: {err}", work_root.display())))?;
    let scratch = tempfile::tempdir_in(work_root)
        .map_err(|err| EngineError::Io(format!("scratch dir failed: {err}")))?;
    let source = artifact.to_path_buf();
    let target: PathBuf = scratch.path().to_path_buf();
    let manifest = blocking(move || {
        archive::unpack_tar_gz(&source, &target)?;
        read_manifest(&source)
    })
    .await?;
    for collection in &manifest.collections {
        let file = scratch.path().join(&collection.file);
        let loaded = engine.import_collection(&collection.name, &file).await?;
        if loaded != collection.documents {
            tracing::warn!(
                collection = %collection.name,
                expected = collection.documents,
                loaded,
                "imported document count differs from manifest"
            );
        }
    }
    engine.count_documents().await
}

#[cfg(test)]
mod tests {
    use super::{count_document_lines, database_from_url, js_string};
    use std::io::Cursor;

    #[test]
    fn database_name_comes_from_url_path() {
        assert_eq!(database_from_url("mongodb://db:27017/orders?authSource=admin"), "orders");
        assert_eq!(database_from_url("mongodb://db:27017"), "admin");
        assert_eq!(database_from_url("mongodb://db:27017/"), "admin");
    }

    #[test]
    fn document_lines_skip_blank_lines() {
        let raw = "{\"a\":1}\n\n{\"a\":2}\n   \n{\"a\":3}";
        assert_eq!(count_document_lines(Cursor::new(raw)).expect("count"), 3);
    }

    #[test]
    fn js_strings_are_quoted() {
        assert_eq!(js_string("orders"), "\"orders\"");
        assert_eq!(js_string("o'rders"), "\"o'rders\"");
    }
}
