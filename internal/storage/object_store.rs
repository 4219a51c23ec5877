use crate::meta::models::{BackupArtifact, StrategyKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;

const TMP_SUFFIX: &str = ".partial";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// Secondary-region storage. Keys are `/`-separated and relative to the
/// region root.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn region(&self) -> &str;
    fn uri(&self, key: &str) -> String;
    async fn put_file(&self, key: &str, source: &Path) -> Result<ObjectInfo, String>;
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, String>;
    async fn delete(&self, key: &str) -> Result<(), String>;
}

/// Remote key of an artifact: partitioned by category, then strategy.
pub fn remote_key(category: &str, strategy: StrategyKind, name: &str) -> String {
    format!("{category}/{}/{name}", strategy.as_str())
}

pub fn artifact_key(artifact: &BackupArtifact) -> String {
    remote_key(&artifact.category, artifact.strategy, &artifact.name)
}

pub fn category_prefix(category: &str) -> String {
    format!("{category}/")
}

pub fn key_file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(format!("invalid object key '{key}'"));
    }
    if key
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(format!("invalid object key '{key}'"));
    }
    Ok(())
}

/// Region backed by a mounted directory.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    region: String,
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(region: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            region: region.to_string(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, String> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn region(&self) -> &str {
        &self.region
    }

    fn uri(&self, key: &str) -> String {
        format!("file://{}/{key}", self.root.display())
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<ObjectInfo, String> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| format!("mkdir {} failed: {err}", parent.display()))?;
        }
        let tmp = PathBuf::from(format!("{}{TMP_SUFFIX}", path.display()));
        let size_bytes = fs::copy(source, &tmp)
            .await
            .map_err(|err| format!("upload {key} failed: {err}"))?;
        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(format!("commit {key} failed: {err}"));
        }
        Ok(ObjectInfo {
            key: key.to_string(),
            size_bytes,
            modified_at: Utc::now(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, String> {
        let start = if prefix.trim_matches('/').is_empty() {
            self.root.clone()
        } else {
            self.object_path(prefix.trim_end_matches('/'))?
        };
        let mut objects = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(format!("list {} failed: {err}", dir.display())),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| format!("list {} failed: {err}", dir.display()))?
            {
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|err| format!("stat {} failed: {err}", entry.path().display()))?;
                if meta.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let path = entry.path();
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|part| part.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !meta.is_file() || key.ends_with(TMP_SUFFIX) {
                    continue;
                }
                objects.push(ObjectInfo {
                    key,
                    size_bytes: meta.len(),
                    modified_at: meta
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now()),
                });
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(format!("delete {key} failed: {err}")),
        }
    }
}
