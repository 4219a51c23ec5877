use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::{AtomicU8, Ordering};
use tar::{Archive, Builder, EntryType, Header};

#[cfg(test)]
static ARCHIVE_FAILPOINT: AtomicU8 = AtomicU8::new(0);

#[cfg(test)]
fn archive_failpoint(step: u8) -> bool {
    if ARCHIVE_FAILPOINT.load(Ordering::SeqCst) == step {
        ARCHIVE_FAILPOINT.store(0, Ordering::SeqCst);
        true
    } else {
        false
    }
}

#[cfg(test)]
pub(crate) struct ArchiveFailpointGuard;

#[cfg(test)]
impl Drop for ArchiveFailpointGuard {
    fn drop(&mut self) {
        ARCHIVE_FAILPOINT.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
pub(crate) fn archive_failpoint_guard(step: u8) -> ArchiveFailpointGuard {
    ARCHIVE_FAILPOINT.store(step, Ordering::SeqCst);
    ArchiveFailpointGuard
}

#[derive(Debug, Clone)]
pub enum EntrySource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: String,
    pub source: EntrySource,
    pub modified_at: DateTime<Utc>,
}

impl ArchiveEntry {
    pub fn file(path: impl Into<String>, source: impl Into<PathBuf>, modified_at: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            source: EntrySource::File(source.into()),
            modified_at,
        }
    }

    pub fn bytes(path: impl Into<String>, data: Vec<u8>, modified_at: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            source: EntrySource::Bytes(data),
            modified_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackSummary {
    pub files: u64,
    pub payload_bytes: u64,
    pub archive_bytes: u64,
}

/// Writes `entries` as a gzip-compressed tar at `dest`. A partial file is
/// removed when writing fails.
pub fn pack_entries(
    dest: &Path,
    entries: &[ArchiveEntry],
    level: Compression,
) -> Result<PackSummary, String> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("mkdir {} failed: {err}", parent.display()))?;
    }
    let result = write_tar_gz(dest, entries, level);
    if result.is_err() {
        let _ = fs::remove_file(dest);
    }
    result
}

fn write_tar_gz(
    dest: &Path,
    entries: &[ArchiveEntry],
    level: Compression,
) -> Result<PackSummary, String> {
    let file = File::create(dest).map_err(|err| format!("create {} failed: {err}", dest.display()))?;
    let encoder = GzEncoder::new(BufWriter::new(file), level);
    let mut builder = Builder::new(encoder);
    let mut summary = PackSummary::default();
    for entry in entries {
        #[cfg(test)]
        if archive_failpoint(1) {
            return Err("tar append failed: failpoint".to_string());
        }
        summary.payload_bytes += append_entry(&mut builder, entry)?;
        summary.files += 1;
    }
    let encoder = builder.into_inner().map_err(map_tar_finalize_error)?;
    let mut writer = encoder.finish().map_err(map_gzip_finish_error)?;
    writer.flush().map_err(map_gzip_finish_error)?;
    drop(writer);
    summary.archive_bytes = fs::metadata(dest)
        .map_err(|err| format!("stat {} failed: {err}", dest.display()))?
        .len();
    Ok(summary)
}

fn append_entry(builder: &mut Builder<impl Write>, entry: &ArchiveEntry) -> Result<u64, String> {
    let mut header = Header::new_gnu();
    header.set_mode(0o600);
    header.set_mtime(entry.modified_at.timestamp().max(0) as u64);
    match &entry.source {
        EntrySource::Bytes(data) => {
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder
                .append_data(&mut header, &entry.path, data.as_slice())
                .map_err(map_tar_append_error)?;
            Ok(data.len() as u64)
        }
        EntrySource::File(source) => {
            let file = File::open(source)
                .map_err(|err| format!("open {} failed: {err}", source.display()))?;
            let size = file
                .metadata()
                .map_err(|err| format!("stat {} failed: {err}", source.display()))?
                .len();
            header.set_size(size);
            header.set_cksum();
            builder
                .append_data(&mut header, &entry.path, file)
                .map_err(map_tar_append_error)?;
            Ok(size)
        }
    }
}

/// Collects regular files below `root` as archive entries under `prefix`.
/// Symlinks and special files are skipped.
pub fn collect_directory(root: &Path, prefix: &str) -> Result<Vec<ArchiveEntry>, String> {
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let listing =
            fs::read_dir(&dir).map_err(|err| format!("read {} failed: {err}", dir.display()))?;
        for item in listing {
            let item = item.map_err(|err| format!("scan {} failed: {err}", dir.display()))?;
            let kind = item
                .file_type()
                .map_err(|err| format!("stat {} failed: {err}", item.path().display()))?;
            let path = item.path();
            if kind.is_dir() {
                pending.push(path);
                continue;
            }
            if !kind.is_file() {
                continue;
            }
            let relative = path
                .strip_prefix(root)
                .map_err(|_| format!("{} escaped {}", path.display(), root.display()))?;
            let modified_at = item
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);
            entries.push(ArchiveEntry::file(
                sanitize_archive_path(prefix, &relative.to_string_lossy()),
                path,
                modified_at,
            ));
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

pub fn sanitize_archive_path(prefix: &str, relative: &str) -> String {
    let clean = relative
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect::<Vec<_>>()
        .join("/");
    let clean = if clean.is_empty() {
        "unnamed".to_string()
    } else {
        clean
    };
    if prefix.is_empty() {
        clean
    } else {
        format!("{prefix}/{clean}")
    }
}

/// Unpacks a tar.gz into `target`, refusing entries that would escape it.
/// Returns the number of regular files written.
pub fn unpack_tar_gz(archive: &Path, target: &Path) -> Result<u64, String> {
    let file =
        File::open(archive).map_err(|err| format!("open {} failed: {err}", archive.display()))?;
    unpack_tar_reader(GzDecoder::new(file), target)
}

pub fn unpack_tar_reader(reader: impl Read, target: &Path) -> Result<u64, String> {
    fs::create_dir_all(target)
        .map_err(|err| format!("mkdir {} failed: {err}", target.display()))?;
    let mut archive = Archive::new(reader);
    let mut files = 0u64;
    for entry in archive.entries().map_err(map_tar_read_error)? {
        let mut entry = entry.map_err(map_tar_read_error)?;
        let is_file = entry.header().entry_type() == EntryType::Regular;
        let unpacked = entry.unpack_in(target).map_err(map_tar_read_error)?;
        if !unpacked {
            return Err("tar entry escapes restore target".to_string());
        }
        if is_file {
            files += 1;
        }
    }
    Ok(files)
}

/// Reads one named member of a tar.gz into memory.
pub fn read_member(archive: &Path, member: &str) -> Result<Option<Vec<u8>>, String> {
    let file =
        File::open(archive).map_err(|err| format!("open {} failed: {err}", archive.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    for entry in archive.entries().map_err(map_tar_read_error)? {
        let mut entry = entry.map_err(map_tar_read_error)?;
        let path = entry.path().map_err(map_tar_read_error)?;
        if path.to_string_lossy() == member {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).map_err(map_tar_read_error)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}

pub fn gzip_to_file(dest: &Path, data: &[u8], level: Compression) -> Result<u64, String> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("mkdir {} failed: {err}", parent.display()))?;
    }
    let file = File::create(dest).map_err(|err| format!("create {} failed: {err}", dest.display()))?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), level);
    let written = encoder
        .write_all(data)
        .map_err(map_gzip_write_error)
        .and_then(|()| encoder.finish().map_err(map_gzip_finish_error))
        .and_then(|mut writer| writer.flush().map_err(map_gzip_finish_error));
    if let Err(err) = written {
        let _ = fs::remove_file(dest);
        return Err(err);
    }
    fs::metadata(dest)
        .map(|meta| meta.len())
        .map_err(|err| format!("stat {} failed: {err}", dest.display()))
}

pub fn gunzip_file(path: &Path) -> Result<Vec<u8>, String> {
    let file = File::open(path).map_err(|err| format!("open {} failed: {err}", path.display()))?;
    let mut out = Vec::new();
    GzDecoder::new(file)
        .read_to_end(&mut out)
        .map_err(|err| format!("gzip decode failed: {err}"))?;
    Ok(out)
}

pub fn copy_file(source: &Path, dest: &Path) -> Result<u64, String> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("mkdir {} failed: {err}", parent.display()))?;
    }
    fs::copy(source, dest).map_err(|err| {
        format!(
            "copy {} -> {} failed: {err}",
            source.display(),
            dest.display()
        )
    })
}

pub fn count_files(root: &Path) -> Result<u64, String> {
    let mut count = 0u64;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let listing = match fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(format!("read {} failed: {err}", dir.display())),
        };
        for item in listing {
            let item = item.map_err(|err| format!("scan {} failed: {err}", dir.display()))?;
            let kind = item
                .file_type()
                .map_err(|err| format!("stat {} failed: {err}", item.path().display()))?;
            if kind.is_dir() {
                pending.push(item.path());
            } else if kind.is_file() {
                count += 1;
            }
        }
    }
    Ok(count)
}

fn map_tar_append_error(err: io::Error) -> String {
    format!("tar append failed: {err}")
}

fn map_tar_finalize_error(err: io::Error) -> String {
    format!("tar finalize failed: {err}")
}

fn map_tar_read_error(err: io::Error) -> String {
    format!("tar read failed: {err}")
}

fn map_gzip_write_error(err: io::Error) -> String {
    format!("gzip write failed: {err}")
}

fn map_gzip_finish_error(err: io::Error) -> String {
    format!("gzip finish failed: {err}")
}
