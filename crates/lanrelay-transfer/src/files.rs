//! Filesystem side of a transfer: opening and hashing the source, checking
//! room at the destination, writing and verifying the received file.

use std::fs::File;
use std::path::{Path, PathBuf};

use lanrelay_crypto::{digest_eq_ignore_case, md5_hex_reader};
use lanrelay_protocol::FileTransferRequest;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::{progress_fraction, TransferError};

// ============================================================================
// Sending side
// ============================================================================

/// A source file, hashed and rewound, plus the request announcing it.
pub struct OutgoingFile {
    pub request: FileTransferRequest,
    pub path: PathBuf,
    pub file: File,
}

impl OutgoingFile {
    /// Open `path`, hash its full contents and build a request with a fresh id.
    /// Blocking; call from a blocking context.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let mut file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => TransferError::NotFound(path.to_path_buf()),
            _ => TransferError::Io(e),
        })?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(TransferError::NotAFile(path.to_path_buf()));
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::InvalidFileName(path.display().to_string()))?
            .to_string();

        let md5_hash = md5_hex_reader(&mut file)?;

        Ok(Self {
            request: FileTransferRequest {
                transfer_id: Uuid::new_v4(),
                file_name,
                file_size: metadata.len(),
                md5_hash,
            },
            path: path.to_path_buf(),
            file,
        })
    }
}

// ============================================================================
// Receiving side
// ============================================================================

/// Free space query for a destination directory.
pub trait DiskSpace: Send + Sync {
    fn available(&self, dir: &Path) -> std::io::Result<u64>;
}

/// Asks the OS through `fs2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fs2DiskSpace;

impl DiskSpace for Fs2DiskSpace {
    fn available(&self, dir: &Path) -> std::io::Result<u64> {
        // The download directory may not exist yet; ask about its nearest ancestor.
        let mut existing = dir;
        while !existing.exists() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }
        fs2::available_space(existing)
    }
}

/// Fails with `InsufficientSpace` unless `dir` has at least `required` bytes free.
pub fn check_disk_space(
    space: &dyn DiskSpace,
    dir: &Path,
    required: u64,
) -> Result<(), TransferError> {
    let available = space.available(dir)?;
    if available < required {
        return Err(TransferError::InsufficientSpace {
            required,
            available,
        });
    }
    Ok(())
}

/// Where an announced file lands: the last path component of `file_name`
/// inside `download_dir`, with a ` (n)` suffix if that name is taken.
pub fn save_path_for(download_dir: &Path, file_name: &str) -> Result<PathBuf, TransferError> {
    let name = Path::new(file_name)
        .file_name()
        .ok_or_else(|| TransferError::InvalidFileName(file_name.to_string()))?;

    let candidate = download_dir.join(name);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for n in 1..1000 {
        let candidate = download_dir.join(format!("{stem} ({n}){ext}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(TransferError::InvalidFileName(file_name.to_string()))
}

/// Re-hash the file at `path` and compare with `expected_md5`, ignoring case.
/// Blocking.
pub fn verify_file(path: &Path, expected_md5: &str) -> Result<(), TransferError> {
    let mut file = File::open(path)?;
    let actual = md5_hex_reader(&mut file)?;
    if !digest_eq_ignore_case(&actual, expected_md5) {
        return Err(TransferError::HashMismatch {
            expected: expected_md5.to_string(),
            actual,
        });
    }
    Ok(())
}

/// A file being received.
pub struct IncomingFile {
    transfer_id: Uuid,
    path: PathBuf,
    file: tokio::fs::File,
    expected_size: u64,
    expected_md5: String,
    written: u64,
}

impl IncomingFile {
    /// Create (truncate) the destination for `request`, creating parent dirs.
    pub async fn create(request: &FileTransferRequest, path: PathBuf) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            transfer_id: request.transfer_id,
            path,
            file,
            expected_size: request.file_size,
            expected_md5: request.md5_hash.clone(),
            written: 0,
        })
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.expected_size
    }

    pub fn progress(&self) -> f64 {
        progress_fraction(self.written, self.expected_size)
    }

    /// Append a chunk. Returns progress after the write.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<f64, TransferError> {
        let received = self.written + chunk.len() as u64;
        if received > self.expected_size {
            return Err(TransferError::Overrun {
                expected: self.expected_size,
                received,
            });
        }
        self.file.write_all(chunk).await?;
        self.written = received;
        Ok(self.progress())
    }

    /// Flush buffered data to the OS.
    pub async fn flush(&mut self) -> Result<(), TransferError> {
        self.file.flush().await?;
        Ok(())
    }

    /// Close the file and verify what is on disk against the announced hash.
    pub async fn finish(mut self) -> Result<PathBuf, TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        let path = self.path.clone();
        let expected = self.expected_md5.clone();
        tokio::task::spawn_blocking(move || verify_file(&path, &expected))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;
        Ok(self.path)
    }

    /// Close and delete the partial file.
    pub async fn abort(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::debug!(path = %self.path.display(), error = %e, "transfer: partial file cleanup failed");
        }
    }
}
