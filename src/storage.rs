//! On-disk storage for staged uploads and produced artifacts.
//!
//! [`StorageManager`] owns two areas under its root:
//!
//! ```text
//! <root>/staging/<uuid>          uploaded bytes, deleted when the attempt ends
//! <root>/artifacts/<uuid>.gif    produced GIF
//! <root>/artifacts/<uuid>.json   its metadata sidecar
//! ```
//!
//! Every name is a freshly generated UUID v4; nothing the uploader supplies
//! ever reaches a path. Writes land in a temporary file first and are
//! renamed into place, so concurrent readers never observe partial data and
//! no in-memory index or lock is shared between requests.

use std::ffi::OsStr;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::fs::{self, File};
use std::io::{self, ErrorKind as IoErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::configuration::{FrameRate, ServiceConfig};
use crate::error::ConversionError;
use crate::progress::CancellationToken;
use crate::resample::Clamp;

const STAGING_DIR: &str = "staging";
const ARTIFACT_DIR: &str = "artifacts";
const ARTIFACT_EXTENSION: &str = "gif";
const METADATA_EXTENSION: &str = "json";
const STAGE_CHUNK_BYTES: usize = 64 * 1024;

/// Opaque identifier of a staged upload. Never shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(Uuid);

impl SourceId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Opaque identifier of a produced GIF.
///
/// Parse untrusted input with [`FromStr`]; anything that is not a UUID can
/// never name an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ArtifactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for ArtifactId {
    type Err = ConversionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|_| ConversionError::NotFound(value.to_string()))
    }
}

/// An upload persisted to the staging area.
///
/// The handle owns the file: dropping it (or calling
/// [`release`](StagedSource::release)) deletes it, so every staged source has
/// exactly one cleanup no matter how the conversion ends.
#[derive(Debug)]
pub struct StagedSource {
    id: SourceId,
    path: PathBuf,
    size_bytes: u64,
}

impl StagedSource {
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Path of the staged bytes, for decoders that open files themselves.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Delete the staged bytes now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for StagedSource {
    fn drop(&mut self) {
        match remove_if_present(&self.path) {
            Ok(()) => log::debug!("Released staged source {}", self.id),
            Err(error) => log::warn!(
                "Failed to remove staged source {} at {}: {error}",
                self.id,
                self.path.display(),
            ),
        }
    }
}

/// Descriptive data stored next to every artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub size_bytes: u64,
    pub frame_count: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    pub looping: bool,
    pub created_at: SystemTime,
    /// The staged source this artifact was produced from.
    pub source_id: SourceId,
    /// Limits that reduced the requested output. Empty if none applied.
    #[serde(default)]
    pub clamps: Vec<Clamp>,
    /// Sanitised download name derived from the uploader's filename hint.
    pub suggested_filename: String,
}

/// A registered artifact: its identifier plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionArtifact {
    pub id: ArtifactId,
    pub metadata: ArtifactMetadata,
}

/// Everything [`StorageManager::register_artifact`] needs besides the bytes.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub frame_count: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    pub looping: bool,
    pub source_id: SourceId,
    pub clamps: Vec<Clamp>,
    pub suggested_filename: String,
}

/// Outcome of one [`StorageManager::evict`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Artifacts removed because they outlived the TTL.
    pub expired: usize,
    /// Artifacts removed because the count cap was exceeded.
    pub over_capacity: usize,
    /// Artifacts still present after the pass.
    pub retained: usize,
}

impl EvictionReport {
    pub fn removed(&self) -> usize {
        self.expired + self.over_capacity
    }
}

/// Filesystem-backed staging and artifact store.
#[derive(Debug, Clone)]
pub struct StorageManager {
    root: PathBuf,
    max_upload_bytes: u64,
    artifact_ttl: Duration,
    max_artifact_count: Option<usize>,
}

impl StorageManager {
    /// Create both storage areas under `config.storage_root`.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InternalStorageError`] if a directory
    /// cannot be created.
    pub fn open(config: &ServiceConfig) -> Result<Self, ConversionError> {
        let storage = Self {
            root: config.storage_root.clone(),
            max_upload_bytes: config.max_upload_bytes,
            artifact_ttl: config.artifact_ttl,
            max_artifact_count: config.max_artifact_count,
        };
        for dir in [storage.staging_dir(), storage.artifact_dir()] {
            fs::create_dir_all(&dir).map_err(|error| {
                ConversionError::InternalStorageError(format!(
                    "Failed to create {}: {error}",
                    dir.display()
                ))
            })?;
        }
        log::debug!("Opened artifact storage at {}", storage.root.display());
        Ok(storage)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.root.join(ARTIFACT_DIR)
    }

    /// Stream `reader` into the staging area.
    ///
    /// At most `max_upload_bytes + 1` bytes are read; if the extra byte
    /// arrives the partial file is discarded.
    ///
    /// # Errors
    ///
    /// - [`ConversionError::PayloadTooLarge`] if the stream is over the limit.
    /// - [`ConversionError::InternalStorageError`] on I/O failure.
    pub fn stage<R: Read>(&self, reader: R) -> Result<StagedSource, ConversionError> {
        self.stage_with_cancellation(reader, &CancellationToken::new())
    }

    /// [`stage`](StorageManager::stage), checking `cancellation` between
    /// every chunk read from `reader`.
    ///
    /// A slow reader can therefore hold a worker for at most one read after
    /// cancellation. The partial spool is discarded on every error.
    ///
    /// # Errors
    ///
    /// As [`stage`](StorageManager::stage), plus
    /// [`ConversionError::Cancelled`] once the token fires.
    pub fn stage_with_cancellation<R: Read>(
        &self,
        reader: R,
        cancellation: &CancellationToken,
    ) -> Result<StagedSource, ConversionError> {
        let mut spool = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(self.staging_dir())?;

        let mut limited = reader.take(self.max_upload_bytes.saturating_add(1));
        let mut buffer = vec![0u8; STAGE_CHUNK_BYTES];
        let mut written = 0u64;
        loop {
            cancellation.check()?;
            let read = match limited.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(error) if error.kind() == IoErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            };
            spool.as_file_mut().write_all(&buffer[..read])?;
            written += read as u64;
        }
        if written > self.max_upload_bytes {
            log::info!(
                "Rejected upload over {} bytes; partial spool discarded",
                self.max_upload_bytes
            );
            return Err(ConversionError::PayloadTooLarge {
                limit: self.max_upload_bytes,
            });
        }
        spool.as_file_mut().flush()?;

        let id = SourceId::generate();
        let path = self.staging_dir().join(id.to_string());
        spool
            .persist_noclobber(&path)
            .map_err(|error| ConversionError::InternalStorageError(error.error.to_string()))?;

        log::debug!("Staged {written} bytes as source {id}");
        Ok(StagedSource {
            id,
            path,
            size_bytes: written,
        })
    }

    /// Persist GIF bytes and their metadata under a fresh identifier.
    ///
    /// The GIF and its sidecar are written to temporary files and renamed
    /// into place; if the sidecar cannot be placed the GIF is removed again.
    pub fn register_artifact(
        &self,
        bytes: &[u8],
        artifact: NewArtifact,
    ) -> Result<ConversionArtifact, ConversionError> {
        let id = ArtifactId::generate();
        let metadata = ArtifactMetadata {
            size_bytes: bytes.len() as u64,
            frame_count: artifact.frame_count,
            width: artifact.width,
            height: artifact.height,
            frame_rate: artifact.frame_rate,
            looping: artifact.looping,
            created_at: SystemTime::now(),
            source_id: artifact.source_id,
            clamps: artifact.clamps,
            suggested_filename: artifact.suggested_filename,
        };

        let sidecar = serde_json::to_vec_pretty(&metadata).map_err(|error| {
            ConversionError::InternalStorageError(format!("Failed to serialise metadata: {error}"))
        })?;

        let gif_spool = self.spool_artifact_file(bytes)?;
        let json_spool = self.spool_artifact_file(&sidecar)?;

        let gif_path = self.artifact_path(&id);
        gif_spool
            .persist_noclobber(&gif_path)
            .map_err(|error| ConversionError::InternalStorageError(error.error.to_string()))?;

        if let Err(error) = json_spool.persist_noclobber(self.metadata_path(&id)) {
            let _ = remove_if_present(&gif_path);
            return Err(ConversionError::InternalStorageError(error.error.to_string()));
        }

        log::info!(
            "Registered artifact {id} ({} bytes, {} frames) from source {}",
            metadata.size_bytes,
            metadata.frame_count,
            metadata.source_id,
        );
        Ok(ConversionArtifact { id, metadata })
    }

    /// Read an artifact's GIF bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::NotFound`] if no such artifact exists.
    pub fn fetch(&self, id: &ArtifactId) -> Result<Vec<u8>, ConversionError> {
        fs::read(self.artifact_path(id)).map_err(|error| not_found_or_storage(id, error))
    }

    /// Open an artifact for streaming instead of reading it whole.
    pub fn open_artifact(&self, id: &ArtifactId) -> Result<File, ConversionError> {
        File::open(self.artifact_path(id)).map_err(|error| not_found_or_storage(id, error))
    }

    /// Read an artifact's metadata sidecar.
    pub fn metadata(&self, id: &ArtifactId) -> Result<ArtifactMetadata, ConversionError> {
        let raw = fs::read(self.metadata_path(id)).map_err(|error| not_found_or_storage(id, error))?;
        serde_json::from_slice(&raw).map_err(|error| {
            ConversionError::InternalStorageError(format!("Corrupt metadata for artifact {id}: {error}"))
        })
    }

    /// Delete an artifact. Unknown or already-deleted identifiers are a no-op.
    pub fn release(&self, id: &ArtifactId) -> Result<(), ConversionError> {
        remove_if_present(&self.artifact_path(id))?;
        remove_if_present(&self.metadata_path(id))?;
        log::debug!("Released artifact {id}");
        Ok(())
    }

    /// Identifiers of every artifact with a readable sidecar, oldest first.
    pub fn list(&self) -> Result<Vec<ConversionArtifact>, ConversionError> {
        let mut artifacts = Vec::new();
        for entry in fs::read_dir(self.artifact_dir())? {
            let path = entry?.path();
            if path.extension() != Some(OsStr::new(METADATA_EXTENSION)) {
                continue;
            }
            let Some(id) = artifact_id_from_path(&path) else {
                continue;
            };
            match self.metadata(&id) {
                Ok(metadata) => artifacts.push(ConversionArtifact { id, metadata }),
                // Released concurrently between read_dir and read.
                Err(ConversionError::NotFound(_)) => {}
                Err(error) => log::warn!("Skipping artifact {id}: {error}"),
            }
        }
        artifacts.sort_by(|a, b| {
            a.metadata
                .created_at
                .cmp(&b.metadata.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(artifacts)
    }

    /// Apply the retention policy.
    ///
    /// Artifacts older than the TTL are released first; if more than
    /// `max_artifact_count` remain, the oldest are released until the cap
    /// holds. GIFs whose sidecar is missing are released once their file
    /// age exceeds the TTL. Staged sources are never touched.
    pub fn evict(&self) -> Result<EvictionReport, ConversionError> {
        self.evict_at(SystemTime::now())
    }

    /// [`evict`](StorageManager::evict) with an explicit notion of "now".
    pub fn evict_at(&self, now: SystemTime) -> Result<EvictionReport, ConversionError> {
        let mut report = EvictionReport::default();
        let mut survivors = Vec::new();

        for artifact in self.list()? {
            let age = now
                .duration_since(artifact.metadata.created_at)
                .unwrap_or(Duration::ZERO);
            if age > self.artifact_ttl {
                self.release(&artifact.id)?;
                report.expired += 1;
            } else {
                survivors.push(artifact.id);
            }
        }

        if let Some(cap) = self.max_artifact_count {
            let excess = survivors.len().saturating_sub(cap);
            for id in survivors.drain(..excess) {
                self.release(&id)?;
                report.over_capacity += 1;
            }
        }
        report.retained = survivors.len();

        report.expired += self.evict_orphaned_gifs(now)?;

        if report.removed() > 0 {
            log::info!(
                "Evicted {} expired and {} over-capacity artifacts ({} retained)",
                report.expired,
                report.over_capacity,
                report.retained,
            );
        }
        Ok(report)
    }

    /// Remove staging files older than `max_age`.
    ///
    /// Staged sources are normally deleted by their handle. Files survive
    /// only if the process died mid-conversion; call this at startup to
    /// reclaim them. Returns the number of files removed.
    pub fn sweep_orphaned_staging(&self, max_age: Duration) -> Result<usize, ConversionError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in fs::read_dir(self.staging_dir())? {
            let entry = entry?;
            let age = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .map(|modified| now.duration_since(modified).unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::ZERO);
            if age > max_age {
                remove_if_present(&entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            log::warn!("Purged {removed} stale staging files");
        }
        Ok(removed)
    }

    fn evict_orphaned_gifs(&self, now: SystemTime) -> Result<usize, ConversionError> {
        let mut removed = 0;
        for entry in fs::read_dir(self.artifact_dir())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension() != Some(OsStr::new(ARTIFACT_EXTENSION)) {
                continue;
            }
            let Some(id) = artifact_id_from_path(&path) else {
                continue;
            };
            if self.metadata_path(&id).exists() {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .map(|modified| now.duration_since(modified).unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::ZERO);
            if age > self.artifact_ttl {
                self.release(&id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn spool_artifact_file(&self, bytes: &[u8]) -> Result<NamedTempFile, ConversionError> {
        let mut spool = tempfile::Builder::new()
            .prefix(".artifact-")
            .tempfile_in(self.artifact_dir())?;
        spool.write_all(bytes)?;
        spool.flush()?;
        Ok(spool)
    }

    fn artifact_path(&self, id: &ArtifactId) -> PathBuf {
        self.artifact_dir().join(format!("{id}.{ARTIFACT_EXTENSION}"))
    }

    fn metadata_path(&self, id: &ArtifactId) -> PathBuf {
        self.artifact_dir().join(format!("{id}.{METADATA_EXTENSION}"))
    }
}

fn artifact_id_from_path(path: &Path) -> Option<ArtifactId> {
    let stem = path.file_stem()?.to_str()?;
    Uuid::parse_str(stem).ok().map(ArtifactId)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(error) if error.kind() != IoErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

fn not_found_or_storage(id: &ArtifactId, error: io::Error) -> ConversionError {
    if error.kind() == IoErrorKind::NotFound {
        ConversionError::NotFound(id.to_string())
    } else {
        ConversionError::InternalStorageError(format!("Failed to read artifact {id}: {error}"))
    }
}

/// Turn an untrusted upload filename into a safe `.gif` download name.
///
/// Only ASCII alphanumerics, `-`, `_`, and `.` survive; path components
/// and leading dots are stripped. Falls back to `animation.gif`.
pub fn suggested_gif_name(filename_hint: Option<&str>) -> String {
    let base = filename_hint
        .and_then(|hint| hint.rsplit(['/', '\\']).next())
        .unwrap_or_default();
    let stem = match base.rsplit_once('.') {
        Some((stem, _extension)) if !stem.is_empty() => stem,
        _ => base,
    };

    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .take(100)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim_end_matches('.');

    if cleaned.is_empty() {
        "animation.gif".to_string()
    } else {
        format!("{cleaned}.gif")
    }
}
