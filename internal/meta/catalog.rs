use crate::meta::models::{BackupArtifact, StrategyKind, Validity};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

const SIDECAR_SUFFIX: &str = ".metadata.json";
const NAME_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Local artifact store laid out as `{base}/{service}/{strategy}/{artifact}` with a
/// `{artifact}.metadata.json` sidecar next to every artifact.
#[derive(Clone, Debug)]
pub struct ArtifactCatalog {
    base_dir: PathBuf,
}

impl ArtifactCatalog {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn work_dir(&self) -> PathBuf {
        self.base_dir.join(".work")
    }

    pub fn artifact_dir(&self, service: &str, strategy: StrategyKind) -> PathBuf {
        self.base_dir.join(service).join(strategy.as_str())
    }

    pub fn artifact_path(
        &self,
        service: &str,
        strategy: StrategyKind,
        created_at: DateTime<Utc>,
        id: Uuid,
    ) -> (String, PathBuf) {
        let name = artifact_name(service, strategy, created_at, id);
        let path = self.artifact_dir(service, strategy).join(&name);
        (name, path)
    }

    pub async fn record(&self, artifact: &BackupArtifact) -> Result<(), String> {
        let sidecar = sidecar_path(&artifact.locations.local_path);
        let payload = serde_json::to_vec_pretty(artifact)
            .map_err(|err| format!("sidecar encode failed: {err}"))?;
        write_atomic(&sidecar, &payload).await
    }

    pub async fn mark(
        &self,
        artifact: &mut BackupArtifact,
        validity: Validity,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if artifact.validity == validity {
            return Ok(());
        }
        if !artifact.validity.can_transition_to(validity) {
            return Err(format!(
                "artifact {} cannot move from {} to {}",
                artifact.name,
                artifact.validity.as_str(),
                validity.as_str()
            ));
        }
        artifact.validity = validity;
        artifact.invalid_reason = reason;
        artifact.validated_at = Some(now);
        self.record(artifact).await
    }

    pub async fn list(
        &self,
        service: &str,
        strategy: StrategyKind,
    ) -> Result<Vec<BackupArtifact>, String> {
        let mut artifacts = read_sidecars(&self.artifact_dir(service, strategy)).await?;
        sort_newest_first(&mut artifacts);
        Ok(artifacts)
    }

    pub async fn list_service(&self, service: &str) -> Result<Vec<BackupArtifact>, String> {
        let mut artifacts = Vec::new();
        for strategy in StrategyKind::ALL {
            artifacts.extend(read_sidecars(&self.artifact_dir(service, strategy)).await?);
        }
        sort_newest_first(&mut artifacts);
        Ok(artifacts)
    }

    pub async fn list_all(&self) -> Result<Vec<BackupArtifact>, String> {
        let mut artifacts = Vec::new();
        for service in list_service_dirs(&self.base_dir).await? {
            artifacts.extend(self.list_service(&service).await?);
        }
        sort_newest_first(&mut artifacts);
        Ok(artifacts)
    }

    pub async fn list_category(&self, category: &str) -> Result<Vec<BackupArtifact>, String> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|artifact| artifact.category == category)
            .collect())
    }

    pub async fn latest_validated(
        &self,
        service: &str,
        strategy: Option<StrategyKind>,
    ) -> Result<Option<BackupArtifact>, String> {
        let artifacts = match strategy {
            Some(strategy) => self.list(service, strategy).await?,
            None => self.list_service(service).await?,
        };
        Ok(artifacts
            .into_iter()
            .find(|artifact| artifact.validity == Validity::Validated))
    }

    pub async fn latest_any(&self, service: &str) -> Result<Option<BackupArtifact>, String> {
        Ok(self.list_service(service).await?.into_iter().next())
    }

    pub async fn latest_created(
        &self,
        service: &str,
        strategy: StrategyKind,
    ) -> Result<Option<DateTime<Utc>>, String> {
        Ok(self
            .list(service, strategy)
            .await?
            .first()
            .map(|artifact| artifact.created_at))
    }

    pub async fn restore_candidates(
        &self,
        service: &str,
        strategy: Option<StrategyKind>,
    ) -> Result<Vec<BackupArtifact>, String> {
        let artifacts = match strategy {
            Some(strategy) => self.list(service, strategy).await?,
            None => self.list_service(service).await?,
        };
        Ok(artifacts
            .into_iter()
            .filter(BackupArtifact::is_restore_candidate)
            .collect())
    }

    pub async fn remove(&self, artifact: &BackupArtifact) -> Result<(), String> {
        let path = &artifact.locations.local_path;
        remove_if_exists(path).await?;
        remove_if_exists(&sidecar_path(path)).await
    }
}

pub fn artifact_name(
    service: &str,
    strategy: StrategyKind,
    created_at: DateTime<Utc>,
    id: Uuid,
) -> String {
    let short_id = &id.simple().to_string()[..8];
    format!(
        "{service}-{}-{}-{short_id}.{}",
        strategy.as_str(),
        created_at.format(NAME_TIMESTAMP_FORMAT),
        strategy.extension()
    )
}

/// Recovers the creation time embedded in an artifact name.
pub fn parse_artifact_timestamp(name: &str) -> Option<DateTime<Utc>> {
    name.split(['-', '.']).find_map(|token| {
        if token.len() != 16 {
            return None;
        }
        NaiveDateTime::parse_from_str(token, NAME_TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    })
}

pub fn sidecar_path(artifact_path: &Path) -> PathBuf {
    let mut raw = artifact_path.as_os_str().to_os_string();
    raw.push(SIDECAR_SUFFIX);
    PathBuf::from(raw)
}

pub fn is_sidecar_name(name: &str) -> bool {
    name.ends_with(SIDECAR_SUFFIX)
}

pub fn sidecar_name(artifact_name: &str) -> String {
    format!("{artifact_name}{SIDECAR_SUFFIX}")
}

fn sort_newest_first(artifacts: &mut [BackupArtifact]) {
    artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.name.cmp(&a.name)));
}

async fn list_service_dirs(base_dir: &Path) -> Result<Vec<String>, String> {
    let mut entries = match fs::read_dir(base_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(format!("catalog read {} failed: {err}", base_dir.display())),
    };
    let mut services = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| format!("catalog scan failed: {err}"))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry
            .file_type()
            .await
            .map(|kind| kind.is_dir())
            .unwrap_or(false);
        if is_dir {
            services.push(name);
        }
    }
    services.sort();
    Ok(services)
}

async fn read_sidecars(dir: &Path) -> Result<Vec<BackupArtifact>, String> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(format!("catalog read {} failed: {err}", dir.display())),
    };
    let mut artifacts = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| format!("catalog scan failed: {err}"))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_sidecar_name(&name) {
            continue;
        }
        match load_sidecar(&entry.path()).await {
            Ok(artifact) => artifacts.push(artifact),
            Err(err) => tracing::warn!(path = %entry.path().display(), error = %err, "skipping unreadable sidecar"),
        }
    }
    Ok(artifacts)
}

async fn load_sidecar(path: &Path) -> Result<BackupArtifact, String> {
    let raw = fs::read(path)
        .await
        .map_err(|err| format!("sidecar read failed: {err}"))?;
    let mut artifact: BackupArtifact =
        serde_json::from_slice(&raw).map_err(|err| format!("sidecar parse failed: {err}"))?;
    if let Some(dir) = path.parent() {
        artifact.locations.local_path = dir.join(&artifact.name);
    }
    Ok(artifact)
}

pub(crate) async fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| format!("mkdir {} failed: {err}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(format!(".tmp-{}", Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, payload)
        .await
        .map_err(|err| format!("write {} failed: {err}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|err| format!("rename into {} failed: {err}", path.display()))
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<(), String> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(format!("remove {} failed: {err}", path.display())),
    }
}
