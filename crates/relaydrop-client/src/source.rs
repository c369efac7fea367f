//! Sender-side file data.
//!
//! The sender must be able to re-read any chunk for the whole life of the
//! room, because receivers ask for resends at arbitrary times. A
//! [`FileSource`] is that random-access view.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use relaydrop_proto::payloads::room::FileSpec;
use thiserror::Error;

/// File source failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Reading the underlying file failed.
    #[error("source I/O error: {0}")]
    Io(String),

    /// No file at this index.
    #[error("unknown source file {file_index}")]
    UnknownFile {
        /// Requested index
        file_index: u32,
    },

    /// Range extends past the end of the file.
    #[error("range {start}..{end} out of bounds for file {file_index} ({size} bytes)")]
    OutOfRange {
        /// File index
        file_index: u32,
        /// Range start
        start: u64,
        /// Range end (exclusive)
        end: u64,
        /// File size
        size: u64,
    },
}

/// Random-access file data for the sender.
///
/// `specs()` fixes the manifest: index `i` of the returned list is file
/// index `i`. The sizes must not change while the room is alive.
pub trait FileSource: Send + 'static {
    /// Name and size of every file, in manifest order.
    fn specs(&self) -> Vec<FileSpec>;

    /// Bytes `range` of file `file_index`.
    fn read_range(&self, file_index: u32, range: Range<u64>) -> Result<Bytes, SourceError>;
}

fn check_range(file_index: u32, range: &Range<u64>, size: u64) -> Result<(), SourceError> {
    if range.start > range.end || range.end > size {
        return Err(SourceError::OutOfRange {
            file_index,
            start: range.start,
            end: range.end,
            size,
        });
    }
    Ok(())
}

/// Files held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: Vec<(String, Bytes)>,
}

impl MemorySource {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a file; its index is the number of files added before it.
    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.files.push((name.into(), data.into()));
        self
    }

    /// Contents of a file.
    pub fn data(&self, file_index: u32) -> Option<&Bytes> {
        self.files.get(file_index as usize).map(|(_, data)| data)
    }
}

impl FileSource for MemorySource {
    fn specs(&self) -> Vec<FileSpec> {
        self.files
            .iter()
            .map(|(name, data)| FileSpec { name: name.clone(), size: data.len() as u64 })
            .collect()
    }

    fn read_range(&self, file_index: u32, range: Range<u64>) -> Result<Bytes, SourceError> {
        let data = self.data(file_index).ok_or(SourceError::UnknownFile { file_index })?;
        check_range(file_index, &range, data.len() as u64)?;
        Ok(data.slice(range.start as usize..range.end as usize))
    }
}

/// Files read from disk on demand.
///
/// Sizes are captured when the source is opened. Each read opens the file,
/// so the source holds no descriptors between chunks.
#[derive(Debug, Clone)]
pub struct FsSource {
    files: Vec<FsFile>,
}

#[derive(Debug, Clone)]
struct FsFile {
    name: String,
    path: PathBuf,
    size: u64,
}

impl FsSource {
    /// Open `paths` in order. The manifest name of each file is its final
    /// path component.
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self, SourceError> {
        let files = paths
            .iter()
            .map(|p| {
                let path = p.as_ref();
                let meta = std::fs::metadata(path)
                    .map_err(|e| SourceError::Io(format!("{}: {e}", path.display())))?;

                if !meta.is_file() {
                    return Err(SourceError::Io(format!("{}: not a regular file", path.display())));
                }

                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| SourceError::Io(format!("{}: no file name", path.display())))?;

                Ok(FsFile { name, path: path.to_path_buf(), size: meta.len() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { files })
    }
}

impl FileSource for FsSource {
    fn specs(&self) -> Vec<FileSpec> {
        self.files.iter().map(|f| FileSpec { name: f.name.clone(), size: f.size }).collect()
    }

    fn read_range(&self, file_index: u32, range: Range<u64>) -> Result<Bytes, SourceError> {
        let file = self.files.get(file_index as usize).ok_or(SourceError::UnknownFile { file_index })?;
        check_range(file_index, &range, file.size)?;

        let io = |e: std::io::Error| SourceError::Io(format!("{}: {e}", file.path.display()));

        let mut handle = File::open(&file.path).map_err(io)?;
        handle.seek(SeekFrom::Start(range.start)).map_err(io)?;

        let mut buf = vec![0u8; (range.end - range.start) as usize];
        handle.read_exact(&mut buf).map_err(io)?;

        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn memory_source_slices() {
        let source = MemorySource::new().with_file("a.txt", b"hello world".to_vec());

        assert_eq!(source.specs(), vec![FileSpec { name: "a.txt".to_string(), size: 11 }]);
        assert_eq!(source.read_range(0, 6..11).unwrap(), Bytes::from_static(b"world"));
        assert_eq!(source.read_range(1, 0..1), Err(SourceError::UnknownFile { file_index: 1 }));
        assert!(matches!(source.read_range(0, 6..12), Err(SourceError::OutOfRange { .. })));
    }

    #[test]
    fn fs_source_reads_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        File::create(&path).unwrap().write_all(&(0u8..=255).collect::<Vec<_>>()).unwrap();

        let source = FsSource::open(&[&path]).unwrap();
        assert_eq!(source.specs(), vec![FileSpec { name: "data.bin".to_string(), size: 256 }]);
        assert_eq!(source.read_range(0, 250..256).unwrap().as_ref(), &[250, 251, 252, 253, 254, 255]);
    }

    #[test]
    fn fs_source_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(FsSource::open(&[dir.path().join("nope")]), Err(SourceError::Io(_))));
    }
}
