//! Object reader and writer
//!
//! Parts are read and written at absolute offsets on one shared file handle,
//! so concurrent workers never share a cursor. Blocking file calls run on
//! the blocking thread pool.
//!
//! Downloads land in a staging file next to the target (`<file>.s3part`)
//! and replace the target only once every part is on disk.

use super::store::ByteRange;
use super::TransferError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Source of upload bytes
#[async_trait]
pub trait ObjectReader: Send + Sync {
    /// Read exactly `range`
    async fn read_range(&self, range: ByteRange) -> Result<Bytes, TransferError>;
}

/// Sink for download bytes
#[async_trait]
pub trait ObjectWriter: Send + Sync {
    /// Write `data` starting at `offset`
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), TransferError>;

    /// Flush file contents to disk
    async fn sync(&self) -> Result<(), TransferError>;

    /// Move the finished object to its final location
    async fn persist(&self) -> Result<(), TransferError> {
        Ok(())
    }

    /// Drop partially written data
    async fn discard(&self) {}
}

const STAGING_SUFFIX: &str = ".s3part";

/// Staging file a download of `target` is written to
pub fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

/// Size and modification time of a local file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMetadata {
    pub size: u64,
    /// Nanoseconds since the Unix epoch, when the platform reports it
    pub modified: Option<i128>,
}

/// Stat `path`
pub async fn local_metadata(path: &Path) -> Result<LocalMetadata, TransferError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| TransferError::local_io(path, e))?;
    if !meta.is_file() {
        return Err(TransferError::local_io(path, "not a regular file"));
    }
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i128);
    Ok(LocalMetadata {
        size: meta.len(),
        modified,
    })
}

/// A local file opened for positional access
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    file: Arc<File>,
}

impl LocalFile {
    /// Open an existing file for reading
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let owned = path.to_path_buf();
        let file = blocking(path, move || File::open(&owned)).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(file),
        })
    }

    /// Open `path` for writing and size it to `len`. Existing contents are
    /// kept when `keep_existing` is set (resumed downloads).
    pub async fn create(path: &Path, len: u64, keep_existing: bool) -> Result<Self, TransferError> {
        let owned = path.to_path_buf();
        let file = blocking(path, move || {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(!keep_existing)
                .open(&owned)?;
            file.set_len(len)?;
            Ok(file)
        })
        .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ObjectReader for LocalFile {
    async fn read_range(&self, range: ByteRange) -> Result<Bytes, TransferError> {
        let file = Arc::clone(&self.file);
        let len = usize::try_from(range.len())
            .map_err(|_| TransferError::local_io(&self.path, "part does not fit in memory"))?;
        let buf = blocking(&self.path, move || {
            let mut buf = vec![0u8; len];
            read_exact_at(&file, &mut buf, range.start)?;
            Ok(buf)
        })
        .await?;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl ObjectWriter for LocalFile {
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), TransferError> {
        let file = Arc::clone(&self.file);
        blocking(&self.path, move || write_all_at(&file, &data, offset)).await
    }

    async fn sync(&self) -> Result<(), TransferError> {
        let file = Arc::clone(&self.file);
        blocking(&self.path, move || file.sync_all()).await
    }
}

/// Download sink that leaves the target untouched until [`persist`]
///
/// [`persist`]: ObjectWriter::persist
#[derive(Debug, Clone)]
pub struct StagedFile {
    staging: LocalFile,
    target: PathBuf,
}

impl StagedFile {
    /// Open the staging file for `target`, sized to `len`. A partial
    /// staging file is kept when `keep_existing` is set.
    pub async fn create(
        target: &Path,
        len: u64,
        keep_existing: bool,
    ) -> Result<Self, TransferError> {
        let staging = LocalFile::create(&staging_path(target), len, keep_existing).await?;
        Ok(Self {
            staging,
            target: target.to_path_buf(),
        })
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

#[async_trait]
impl ObjectWriter for StagedFile {
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), TransferError> {
        self.staging.write_at(offset, data).await
    }

    async fn sync(&self) -> Result<(), TransferError> {
        self.staging.sync().await
    }

    async fn persist(&self) -> Result<(), TransferError> {
        tokio::fs::rename(self.staging.path(), &self.target)
            .await
            .map_err(|e| TransferError::local_io(&self.target, e))?;
        tracing::debug!(path = %self.target.display(), "Download moved into place");
        Ok(())
    }

    async fn discard(&self) {
        match tokio::fs::remove_file(self.staging.path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.staging.path().display(),
                error = %e,
                "Failed to remove partial download"
            ),
        }
    }
}

async fn blocking<T, F>(path: &Path, f: F) -> Result<T, TransferError>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransferError::local_io(path, e))?
        .map_err(|e| TransferError::local_io(path, e))
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let file = LocalFile::open(&path).await.unwrap();
        let bytes = file.read_range(ByteRange::new(3, 7)).await.unwrap();
        assert_eq!(&bytes[..], b"3456");
    }

    #[tokio::test]
    async fn test_read_past_end_is_local_io_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();

        let file = LocalFile::open(&path).await.unwrap();
        let err = file.read_range(ByteRange::new(0, 10)).await.unwrap_err();
        assert!(matches!(err, TransferError::LocalIo { .. }));
    }

    #[tokio::test]
    async fn test_out_of_order_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target.bin");

        let file = LocalFile::create(&path, 9, false).await.unwrap();
        file.write_at(6, Bytes::from_static(b"ghi")).await.unwrap();
        file.write_at(0, Bytes::from_static(b"abc")).await.unwrap();
        file.write_at(3, Bytes::from_static(b"def")).await.unwrap();
        file.sync().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefghi");
    }

    #[tokio::test]
    async fn test_create_keeps_existing_when_resuming() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"abc").unwrap();

        let file = LocalFile::create(&path, 6, true).await.unwrap();
        file.write_at(3, Bytes::from_static(b"def")).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");

        let _file = LocalFile::create(&path, 2, false).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0u8; 2]);
    }

    #[tokio::test]
    async fn test_staged_file_replaces_target_on_persist() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("report.csv");
        std::fs::write(&target, b"old contents").unwrap();

        let file = StagedFile::create(&target, 6, false).await.unwrap();
        assert_eq!(file.staging_path(), dir.path().join("report.csv.s3part"));
        file.write_at(0, Bytes::from_static(b"fresh!")).await.unwrap();
        file.sync().await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"old contents");

        file.persist().await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"fresh!");
        assert!(!file.staging_path().exists());
    }

    #[tokio::test]
    async fn test_staged_file_discard_keeps_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("report.csv");
        std::fs::write(&target, b"old contents").unwrap();

        let file = StagedFile::create(&target, 1024, false).await.unwrap();
        file.write_at(0, Bytes::from_static(b"partial")).await.unwrap();
        file.discard().await;
        file.discard().await;

        assert_eq!(std::fs::read(&target).unwrap(), b"old contents");
        assert!(!staging_path(&target).exists());
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = LocalFile::open(&dir.path().join("missing")).await.unwrap_err();
        assert_eq!(err.kind(), super::super::ErrorKind::LocalIo);
    }

    #[tokio::test]
    async fn test_local_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.bin");
        std::fs::write(&path, vec![1u8; 1234]).unwrap();

        let meta = local_metadata(&path).await.unwrap();
        assert_eq!(meta.size, 1234);
        assert!(meta.modified.is_some());
        assert!(local_metadata(dir.path()).await.is_err());
    }
}
