use crate::backup::archive;
use crate::backup::{blocking, EngineError, ProduceContext, Produced};
use crate::meta::models::{EngineKind, Provenance, StrategyKind};
use flate2::Compression;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Bulk file tree backed up as a whole.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeSource {
    root: PathBuf,
}

impl VolumeSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

pub(crate) async fn produce(
    source: &VolumeSource,
    ctx: &ProduceContext<'_>,
) -> Result<Produced, EngineError> {
    if ctx.strategy != StrategyKind::VolumeArchive {
        return Err(EngineError::Unsupported);
    }
    let root = source.root.clone();
    let dest = ctx.dest.to_path_buf();
    let summary = blocking(move || {
        let entries = archive::collect_directory(&root, "")?;
        archive::pack_entries(&dest, &entries, Compression::default())
    })
    .await?;
    if summary.files == 0 {
        tracing::warn!(service = %ctx.service, root = %source.root.display(), "volume archive is empty");
    }
    let mut details = BTreeMap::new();
    details.insert("files".to_string(), summary.files.to_string());
    details.insert("payloadBytes".to_string(), summary.payload_bytes.to_string());
    details.insert(
        "root".to_string(),
        source.root.to_string_lossy().to_string(),
    );
    Ok(Produced {
        provenance: Provenance {
            engine: Some(EngineKind::Volume),
            tool: "tar".to_string(),
            source_engine_version: None,
            details,
        },
    })
}
