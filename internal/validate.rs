use crate::backup::document::{self, DumpManifest, MANIFEST_MEMBER};
use crate::backup::keyvalue::{KeyspaceExport, EXPORT_FORMAT};
use crate::backup::relational::{is_segment_name, BASE_MEMBER};
use crate::errors::{IntegrityFailure, InvalidReason};
use crate::meta::catalog::ArtifactCatalog;
use crate::meta::models::{BackupArtifact, StrategyKind, Validity};
use crate::obs::Metrics;
use crate::storage::checksum::parse_checksum;
use crate::util::config::ServiceConfig;
use chrono::Utc;
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tar::Archive;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const RDB_MAGIC: &[u8] = b"REDIS";
const RDB_EOF_OPCODE: u8 = 0xff;
const RDB_CHECKSUM_LEN: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(IntegrityFailure),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Smallest artifact each strategy can produce for a non-empty source.
pub fn default_min_size(strategy: StrategyKind) -> u64 {
    match strategy {
        StrategyKind::Snapshot => 18,
        StrategyKind::KeyspaceExport => 20,
        _ => 64,
    }
}

/// Classifies artifacts from their bytes alone; nothing the producer
/// reported is trusted except the recorded checksum.
#[derive(Clone, Default)]
pub struct IntegrityValidator {
    min_sizes: BTreeMap<String, u64>,
    metrics: Option<Arc<Metrics>>,
}

impl IntegrityValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_services(services: &[ServiceConfig]) -> Self {
        let min_sizes = services
            .iter()
            .filter_map(|service| {
                service
                    .min_artifact_bytes
                    .map(|bytes| (service.name.clone(), bytes))
            })
            .collect();
        Self {
            min_sizes,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn min_size(&self, artifact: &BackupArtifact) -> u64 {
        self.min_sizes
            .get(&artifact.service)
            .copied()
            .unwrap_or_else(|| default_min_size(artifact.strategy))
    }

    pub async fn validate(&self, artifact: &BackupArtifact) -> Verdict {
        let path = artifact.locations.local_path.clone();
        let strategy = artifact.strategy;
        let min_size = self.min_size(artifact);
        let checksum = artifact.checksum.clone();
        let inspected =
            tokio::task::spawn_blocking(move || inspect(&path, strategy, min_size, &checksum))
                .await
                .unwrap_or_else(|err| {
                    Err((InvalidReason::Unreadable, format!("inspection aborted: {err}")))
                });
        let verdict = match inspected {
            Ok(()) => Verdict::Valid,
            Err((reason, detail)) => Verdict::Invalid(IntegrityFailure {
                artifact_id: artifact.id,
                reason,
                detail,
            }),
        };
        if let Some(metrics) = &self.metrics {
            let result = match &verdict {
                Verdict::Valid => "valid",
                Verdict::Invalid(failure) => failure.reason.code(),
            };
            metrics
                .validation
                .with_label_values(&[strategy.as_str(), result])
                .inc();
        }
        verdict
    }

    /// Validates and persists the resulting state in the sidecar. An artifact
    /// already marked invalid stays invalid whatever the verdict.
    pub async fn validate_and_record(
        &self,
        catalog: &ArtifactCatalog,
        artifact: &mut BackupArtifact,
    ) -> Result<Verdict, String> {
        let verdict = self.validate(artifact).await;
        match &verdict {
            Verdict::Valid => {
                if artifact.validity == Validity::Created {
                    catalog
                        .mark(artifact, Validity::Validated, None, Utc::now())
                        .await?;
                }
                tracing::info!(
                    service = %artifact.service,
                    artifact = %artifact.name,
                    "artifact validated"
                );
            }
            Verdict::Invalid(failure) => {
                let reason = format!("{}: {}", failure.reason.code(), failure.detail);
                catalog
                    .mark(artifact, Validity::Invalid, Some(reason), Utc::now())
                    .await?;
                tracing::warn!(
                    service = %artifact.service,
                    artifact = %artifact.name,
                    error = %failure,
                    "artifact rejected"
                );
            }
        }
        Ok(verdict)
    }
}

type Rejection = (InvalidReason, String);

pub fn inspect(
    path: &Path,
    strategy: StrategyKind,
    min_size: u64,
    checksum: &str,
) -> Result<(), Rejection> {
    let mut file = File::open(path)
        .map_err(|err| reject(InvalidReason::Unreadable, format!("open failed: {err}")))?;
    let size = file
        .metadata()
        .map_err(|err| reject(InvalidReason::Unreadable, format!("stat failed: {err}")))?
        .len();

    check_magic(&mut file, strategy)?;
    let listing = match strategy {
        StrategyKind::Snapshot => None,
        StrategyKind::KeyspaceExport => {
            check_export(path)?;
            None
        }
        _ => Some(scan_tar(path)?),
    };
    if size < min_size {
        return Err(reject(
            InvalidReason::TooSmall,
            format!("{size} bytes is below the {min_size} byte minimum"),
        ));
    }
    match strategy {
        StrategyKind::Snapshot => check_rdb_trailer(&mut file, size)?,
        StrategyKind::KeyspaceExport => {}
        _ => {
            if let Some(listing) = &listing {
                check_structure(strategy, listing)?;
            }
        }
    }
    check_checksum(path, checksum)
}

fn reject(reason: InvalidReason, detail: impl Into<String>) -> Rejection {
    (reason, detail.into())
}

fn check_magic(file: &mut File, strategy: StrategyKind) -> Result<(), Rejection> {
    let expected: &[u8] = match strategy {
        StrategyKind::Snapshot => RDB_MAGIC,
        _ => &GZIP_MAGIC,
    };
    let mut header = vec![0u8; expected.len()];
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) => {
                return Err(reject(InvalidReason::Unreadable, format!("read failed: {err}")))
            }
        }
    }
    if filled < expected.len() || header != expected {
        return Err(reject(
            InvalidReason::BadMagic,
            format!("header {} does not match {}", hex::encode(&header[..filled]), hex::encode(expected)),
        ));
    }
    Ok(())
}

fn check_rdb_trailer(file: &mut File, size: u64) -> Result<(), Rejection> {
    if size < RDB_CHECKSUM_LEN + 1 {
        return Err(reject(InvalidReason::Truncated, "snapshot has no trailer"));
    }
    let mut opcode = [0u8; 1];
    file.seek(SeekFrom::Start(size - RDB_CHECKSUM_LEN - 1))
        .and_then(|_| file.read_exact(&mut opcode))
        .map_err(|err| reject(InvalidReason::Unreadable, format!("trailer read failed: {err}")))?;
    if opcode[0] != RDB_EOF_OPCODE {
        return Err(reject(
            InvalidReason::Truncated,
            "snapshot end-of-file marker missing",
        ));
    }
    Ok(())
}

fn check_export(path: &Path) -> Result<(), Rejection> {
    let file = File::open(path)
        .map_err(|err| reject(InvalidReason::Unreadable, format!("open failed: {err}")))?;
    let mut raw = Vec::new();
    GzDecoder::new(file)
        .read_to_end(&mut raw)
        .map_err(|err| reject(InvalidReason::Undecodable, format!("gzip decode failed: {err}")))?;
    let export: KeyspaceExport = serde_json::from_slice(&raw)
        .map_err(|err| reject(InvalidReason::Incomplete, format!("export parse failed: {err}")))?;
    if export.format != EXPORT_FORMAT {
        return Err(reject(
            InvalidReason::Incomplete,
            format!("unexpected export format '{}'", export.format),
        ));
    }
    if export.entries.len() != export.captured_scalars + export.placeholders {
        return Err(reject(
            InvalidReason::Incomplete,
            format!(
                "export lists {} entries but counts {} scalars and {} placeholders",
                export.entries.len(),
                export.captured_scalars,
                export.placeholders
            ),
        ));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct TarListing {
    files: Vec<String>,
    line_counts: BTreeMap<String, u64>,
    manifest: Option<Vec<u8>>,
}

/// Reads the archive end to end, which exercises the gzip CRC and every tar
/// header, and records what the structural checks need.
fn scan_tar(path: &Path) -> Result<TarListing, Rejection> {
    let file = File::open(path)
        .map_err(|err| reject(InvalidReason::Unreadable, format!("open failed: {err}")))?;
    let undecodable = |err: io::Error| reject(InvalidReason::Undecodable, format!("archive decode failed: {err}"));
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut listing = TarListing::default();
    for entry in archive.entries().map_err(undecodable)? {
        let mut entry = entry.map_err(undecodable)?;
        let name = entry.path().map_err(undecodable)?.to_string_lossy().to_string();
        if !entry.header().entry_type().is_file() {
            io::copy(&mut entry, &mut io::sink()).map_err(undecodable)?;
            continue;
        }
        if name == MANIFEST_MEMBER {
            let mut raw = Vec::new();
            entry.read_to_end(&mut raw).map_err(undecodable)?;
            listing.manifest = Some(raw);
        } else if name.ends_with(".jsonl") {
            let lines = document::count_document_lines(BufReader::new(&mut entry))
                .map_err(|err| reject(InvalidReason::Undecodable, err))?;
            listing.line_counts.insert(name.clone(), lines);
        } else {
            io::copy(&mut entry, &mut io::sink()).map_err(undecodable)?;
        }
        listing.files.push(name);
    }
    Ok(listing)
}

fn check_structure(strategy: StrategyKind, listing: &TarListing) -> Result<(), Rejection> {
    let incomplete = |detail: String| Err(reject(InvalidReason::Incomplete, detail));
    match strategy {
        StrategyKind::BaseBackup => {
            if !listing.files.iter().any(|name| name == BASE_MEMBER) {
                return incomplete(format!("{BASE_MEMBER} missing from base backup"));
            }
        }
        StrategyKind::LogArchive => {
            let segments = listing
                .files
                .iter()
                .filter_map(|name| name.strip_prefix("pg_wal/"))
                .filter(|name| is_segment_name(name))
                .count();
            if segments == 0 {
                return incomplete("log archive holds no segments".to_string());
            }
        }
        StrategyKind::AppendLogRewrite | StrategyKind::VolumeArchive => {
            if listing.files.is_empty() {
                return incomplete("archive holds no files".to_string());
            }
        }
        StrategyKind::LogicalDump => check_dump(listing)?,
        StrategyKind::Snapshot | StrategyKind::KeyspaceExport => {}
    }
    Ok(())
}

fn check_dump(listing: &TarListing) -> Result<(), Rejection> {
    let raw = listing
        .manifest
        .as_ref()
        .ok_or_else(|| reject(InvalidReason::Incomplete, format!("{MANIFEST_MEMBER} missing")))?;
    let manifest: DumpManifest = serde_json::from_slice(raw)
        .map_err(|err| reject(InvalidReason::Incomplete, format!("manifest parse failed: {err}")))?;
    if manifest.format != document::DUMP_FORMAT {
        return Err(reject(
            InvalidReason::Incomplete,
            format!("unexpected dump format '{}'", manifest.format),
        ));
    }
    for collection in &manifest.collections {
        match listing.line_counts.get(&collection.file) {
            None => {
                return Err(reject(
                    InvalidReason::Incomplete,
                    format!("collection '{}' missing from dump", collection.name),
                ))
            }
            Some(lines) if *lines != collection.documents => {
                return Err(reject(
                    InvalidReason::Incomplete,
                    format!(
                        "collection '{}' holds {lines} documents, manifest expects {}",
                        collection.name, collection.documents
                    ),
                ))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn check_checksum(path: &Path, recorded: &str) -> Result<(), Rejection> {
    let checksum = parse_checksum(recorded)
        .map_err(|err| reject(InvalidReason::ChecksumMismatch, format!("recorded checksum unusable: {err}")))?;
    let matches = checksum
        .verify_file(path)
        .map_err(|err| reject(InvalidReason::Unreadable, err))?;
    if !matches {
        return Err(reject(
            InvalidReason::ChecksumMismatch,
            "content differs from recorded checksum",
        ));
    }
    Ok(())
}
