//! Blob content storage.
//!
//! A blob's bytes live either as a view into the seekable input stream
//! the repository was parsed from, or as a file under the repository's
//! scratch directory. Scratch files are partitioned by a three-level
//! numeric prefix (`NNN/NNN/NNN`) so no single directory grows large,
//! and are optionally gzip-compressed. The scratch directory is owned
//! by the repository and removed when it is dropped.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::config::LogMask;
use crate::errors::Result;

/// Sentinel offset meaning "no stream position": content must go to a
/// backing file.
pub const NO_OFFSET: i64 = -1;

/// Anything the parser can hand out blob views into.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Shared handle to the seekable source a repository was parsed from.
pub type StreamHandle = Arc<Mutex<Box<dyn ReadSeek>>>;

/// Wrap an owned seekable reader as a shareable stream handle.
pub fn stream_handle<R: ReadSeek + 'static>(source: R) -> StreamHandle {
    Arc::new(Mutex::new(Box::new(source)))
}

/// Where a blob's bytes live.
#[derive(Clone)]
pub enum BlobBody {
    /// No content recorded yet.
    Empty,
    /// `[offset, offset+size)` of the shared input stream.
    Stream {
        source: StreamHandle,
        offset: u64,
        size: u64,
    },
    /// An owned regular file under the scratch directory.
    File {
        path: PathBuf,
        size: u64,
        compressed: bool,
    },
}

impl std::fmt::Debug for BlobBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobBody::Empty => write!(f, "BlobBody::Empty"),
            BlobBody::Stream { offset, size, .. } => {
                write!(f, "BlobBody::Stream {{ offset: {offset}, size: {size} }}")
            }
            BlobBody::File { path, size, .. } => {
                write!(f, "BlobBody::File {{ path: {path:?}, size: {size} }}")
            }
        }
    }
}

impl BlobBody {
    /// Content size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            BlobBody::Empty => 0,
            BlobBody::Stream { size, .. } => *size,
            BlobBody::File { size, .. } => *size,
        }
    }

    /// True if the content can be updated in place as a stream view.
    pub fn is_stream(&self) -> bool {
        matches!(self, BlobBody::Stream { .. })
    }

    /// Fetch the content bytes. Any I/O failure is a `Storage` error
    /// fatal to the enclosing operator.
    pub fn fetch(&self) -> Result<Vec<u8>> {
        match self {
            BlobBody::Empty => Ok(Vec::new()),
            BlobBody::Stream {
                source,
                offset,
                size,
            } => {
                let mut guard = source.lock().expect("stream source poisoned");
                guard.seek(SeekFrom::Start(*offset))?;
                let mut buf = vec![0; *size as usize];
                guard.read_exact(&mut buf)?;
                Ok(buf)
            }
            BlobBody::File {
                path, compressed, ..
            } => {
                let f = fs::File::open(path)?;
                let mut buf = Vec::new();
                if *compressed {
                    GzDecoder::new(f).read_to_end(&mut buf)?;
                } else {
                    let mut f = f;
                    f.read_to_end(&mut buf)?;
                }
                Ok(buf)
            }
        }
    }
}

/// Scratch-directory blob storage owned by one repository.
#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
    compress: bool,
    logmask: LogMask,
}

impl BlobStore {
    /// Create a store rooted at `<scratch>/blobs`.
    pub fn new(scratch: &Path, compress: bool, logmask: LogMask) -> BlobStore {
        BlobStore {
            root: scratch.join("blobs"),
            compress,
            logmask,
        }
    }

    /// Path of the backing file for blob sequence number `seq`,
    /// partitioned `NNN/NNN/NNN`.
    pub fn path_for(&self, seq: u64) -> PathBuf {
        self.root
            .join(format!("{:03}", seq / 1_000_000 % 1000))
            .join(format!("{:03}", seq / 1000 % 1000))
            .join(format!("{:03}", seq % 1000))
    }

    /// Write content to the backing file for `seq` and return the
    /// resulting file body.
    pub fn write(&self, seq: u64, data: &[u8]) -> Result<BlobBody> {
        let path = self.path_for(seq);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if self.compress {
            let f = fs::File::create(&path)?;
            let mut enc = GzEncoder::new(f, Compression::default());
            enc.write_all(data)?;
            enc.finish()?;
        } else {
            fs::write(&path, data)?;
        }
        if self.logmask.contains(LogMask::BLOB) {
            debug!(seq, bytes = data.len(), "materialized blob file");
        }
        Ok(BlobBody::File {
            path,
            size: data.len() as u64,
            compressed: self.compress,
        })
    }

    /// Store new content for a body. A real offset on a stream-viewable
    /// body just moves the view; anything else materializes a file.
    pub fn set_content(
        &self,
        body: &mut BlobBody,
        seq: u64,
        data: &[u8],
        offset: i64,
    ) -> Result<()> {
        if offset != NO_OFFSET && body.is_stream() {
            if let BlobBody::Stream {
                offset: o, size: s, ..
            } = body
            {
                *o = offset as u64;
                *s = data.len() as u64;
            }
            return Ok(());
        }
        *body = self.write(seq, data)?;
        Ok(())
    }

    /// Force a body into file-backed mode, fetching through the stream
    /// view if necessary.
    pub fn materialize(&self, body: &mut BlobBody, seq: u64) -> Result<()> {
        if matches!(body, BlobBody::File { .. }) {
            return Ok(());
        }
        let data = body.fetch()?;
        *body = self.write(seq, &data)?;
        Ok(())
    }

    /// Clone a body for a new blob with sequence `seq`. Stream views
    /// share the source; file bodies hard-link where possible and fall
    /// back to a copy.
    pub fn clone_body(&self, body: &BlobBody, seq: u64) -> Result<BlobBody> {
        match body {
            BlobBody::File {
                path,
                size,
                compressed,
            } => {
                let new_path = self.path_for(seq);
                if let Some(parent) = new_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                if fs::hard_link(path, &new_path).is_err() {
                    fs::copy(path, &new_path)?;
                }
                Ok(BlobBody::File {
                    path: new_path,
                    size: *size,
                    compressed: *compressed,
                })
            }
            other => Ok(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn memory_stream(data: &[u8]) -> StreamHandle {
        stream_handle(Cursor::new(data.to_vec()))
    }

    #[test]
    fn test_stream_view_fetch() {
        let source = memory_stream(b"0123456789");
        let body = BlobBody::Stream {
            source,
            offset: 2,
            size: 5,
        };
        assert_eq!(body.fetch().unwrap(), b"23456");
        assert_eq!(body.size(), 5);
    }

    #[test]
    fn test_file_write_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), false, LogMask::default());
        let body = store.write(7, b"hello blob").unwrap();
        assert_eq!(body.fetch().unwrap(), b"hello blob");
        assert_eq!(body.size(), 10);
    }

    #[test]
    fn test_compressed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), true, LogMask::default());
        let payload = vec![b'a'; 4096];
        let body = store.write(1, &payload).unwrap();
        assert_eq!(body.fetch().unwrap(), payload);
        if let BlobBody::File { path, .. } = &body {
            // gzip of 4k of 'a' is much smaller on disk
            assert!(fs::metadata(path).unwrap().len() < 4096);
        } else {
            panic!("expected file body");
        }
    }

    #[test]
    fn test_partitioned_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), false, LogMask::default());
        let p = store.path_for(1_002_003);
        assert!(p.ends_with("001/002/003"));
        let p0 = store.path_for(42);
        assert!(p0.ends_with("000/000/042"));
    }

    #[test]
    fn test_set_content_moves_stream_view() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), false, LogMask::default());
        let source = memory_stream(b"aaaa bbbb cccc");
        let mut body = BlobBody::Stream {
            source,
            offset: 0,
            size: 4,
        };
        store.set_content(&mut body, 1, b"bbbb", 5).unwrap();
        assert_eq!(body.fetch().unwrap(), b"bbbb");
        assert!(body.is_stream());
        // sentinel offset forces materialization
        store.set_content(&mut body, 1, b"fresh", NO_OFFSET).unwrap();
        assert!(!body.is_stream());
        assert_eq!(body.fetch().unwrap(), b"fresh");
    }

    #[test]
    fn test_materialize_and_clone() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), false, LogMask::default());
        let source = memory_stream(b"streamed content");
        let mut body = BlobBody::Stream {
            source,
            offset: 0,
            size: 8,
        };
        store.materialize(&mut body, 3).unwrap();
        assert_eq!(body.fetch().unwrap(), b"streamed");
        let cloned = store.clone_body(&body, 4).unwrap();
        assert_eq!(cloned.fetch().unwrap(), b"streamed");
    }
}
