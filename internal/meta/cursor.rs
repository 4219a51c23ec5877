use crate::meta::catalog::write_atomic;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-category "last successful sync" markers, persisted as one JSON map.
#[derive(Clone, Debug)]
pub struct SyncCursorStore {
    path: PathBuf,
    entries: Arc<Mutex<BTreeMap<String, DateTime<Utc>>>>,
}

impl SyncCursorStore {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, String> {
        let path = path.into();
        let entries = read_entries(&path).await?;
        Ok(Self {
            path,
            entries: Arc::new(Mutex::new(entries)),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            entries: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub async fn last(&self, category: &str) -> Option<DateTime<Utc>> {
        self.entries.lock().await.get(category).copied()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, DateTime<Utc>> {
        self.entries.lock().await.clone()
    }

    /// Moves the cursor forward; an older timestamp never rewinds it.
    pub async fn advance(&self, category: &str, at: DateTime<Utc>) -> Result<(), String> {
        let mut entries = self.entries.lock().await;
        let current = entries.get(category).copied();
        if current.is_some_and(|current| current >= at) {
            return Ok(());
        }
        entries.insert(category.to_string(), at);
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_vec_pretty(&*entries)
            .map_err(|err| format!("cursor encode failed: {err}"))?;
        if let Err(err) = write_atomic(&self.path, &payload).await {
            match current {
                Some(previous) => entries.insert(category.to_string(), previous),
                None => entries.remove(category),
            };
            return Err(err);
        }
        Ok(())
    }
}

async fn read_entries(path: &Path) -> Result<BTreeMap<String, DateTime<Utc>>, String> {
    match tokio::fs::read(path).await {
        Ok(raw) if raw.is_empty() => Ok(BTreeMap::new()),
        Ok(raw) => {
            serde_json::from_slice(&raw).map_err(|err| format!("cursor parse failed: {err}"))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(format!("cursor read {} failed: {err}", path.display())),
    }
}
