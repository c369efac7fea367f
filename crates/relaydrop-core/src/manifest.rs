//! Transfer manifest and chunk arithmetic.
//!
//! A manifest is fixed when the room is created: file indexes are dense
//! `0..N-1` and never change for the room's lifetime. Every other component
//! derives chunk counts and byte ranges from here, so the arithmetic lives in
//! one place.

use std::ops::Range;

use relaydrop_proto::payloads::room::{FileEntry, FileSpec};

use crate::error::TransferError;

/// Fixed chunk size in bytes (256 KiB). The final chunk of a file is shorter.
pub const CHUNK_SIZE: u64 = 262_144;

/// Largest file a manifest accepts: the chunk count must fit a `u32`.
pub const MAX_FILE_SIZE: u64 = 0xFFFF_FFFF * CHUNK_SIZE;

/// Number of chunks needed for `byte_size` bytes: `ceil(byte_size / CHUNK_SIZE)`.
///
/// An empty file has zero chunks and is complete as soon as it is known.
/// `None` if the count does not fit a `u32` (`byte_size > MAX_FILE_SIZE`).
#[must_use]
pub fn total_chunks(byte_size: u64) -> Option<u32> {
    u32::try_from(byte_size.div_ceil(CHUNK_SIZE)).ok()
}

/// One file in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Position in the manifest
    pub index: u32,
    /// File name
    pub name: String,
    /// Size in bytes
    pub byte_size: u64,
}

impl FileDescriptor {
    /// Chunks in this file.
    ///
    /// Manifests never hold a file past [`MAX_FILE_SIZE`]; a descriptor built
    /// by hand past that size saturates at `u32::MAX`.
    #[must_use]
    pub fn total_chunks(&self) -> u32 {
        total_chunks(self.byte_size).unwrap_or(u32::MAX)
    }

    fn checked(index: u32, name: &str, byte_size: u64) -> Result<Self, TransferError> {
        if total_chunks(byte_size).is_none() {
            return Err(TransferError::InvalidManifest(format!(
                "file {index} is {byte_size} bytes, limit is {MAX_FILE_SIZE}"
            )));
        }
        Ok(Self { index, name: name.to_string(), byte_size })
    }

    /// Byte range covered by `chunk_index`. `None` past the last chunk.
    #[must_use]
    pub fn chunk_range(&self, chunk_index: u32) -> Option<Range<u64>> {
        if chunk_index >= self.total_chunks() {
            return None;
        }

        let start = u64::from(chunk_index) * CHUNK_SIZE;
        let end = (start + CHUNK_SIZE).min(self.byte_size);
        Some(start..end)
    }

    /// Expected payload length of `chunk_index`. `None` past the last chunk.
    #[must_use]
    pub fn chunk_len(&self, chunk_index: u32) -> Option<usize> {
        self.chunk_range(chunk_index).map(|range| (range.end - range.start) as usize)
    }

    /// Chunk indexes not in `held`, ascending.
    ///
    /// `held` may be unsorted, contain duplicates, or contain out-of-range
    /// indexes; none of that changes the result.
    #[must_use]
    pub fn missing_chunks(&self, held: &[u32]) -> Vec<u32> {
        let total = self.total_chunks();
        let mut have = vec![false; total as usize];
        for &index in held {
            if let Some(slot) = have.get_mut(index as usize) {
                *slot = true;
            }
        }

        (0..total).filter(|index| !have[*index as usize]).collect()
    }

    /// Wire form delivered to receivers.
    #[must_use]
    pub fn to_entry(&self) -> FileEntry {
        FileEntry { index: self.index, name: self.name.clone(), size: self.byte_size }
    }

    /// Wire form sent by the sender at room creation.
    #[must_use]
    pub fn to_spec(&self) -> FileSpec {
        FileSpec { name: self.name.clone(), size: self.byte_size }
    }
}

/// Immutable ordered list of files shared in a room.
///
/// # Invariants
///
/// - Non-empty.
/// - `files[i].index == i` for every file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferManifest {
    files: Vec<FileDescriptor>,
}

impl TransferManifest {
    /// Build from the sender's file list, assigning indexes in order.
    ///
    /// # Errors
    ///
    /// - `TransferError::InvalidManifest` if `specs` is empty, holds more
    ///   than `u32::MAX` files, or a file is larger than [`MAX_FILE_SIZE`]
    pub fn from_specs(specs: &[FileSpec]) -> Result<Self, TransferError> {
        if specs.is_empty() {
            return Err(TransferError::InvalidManifest("no files".to_string()));
        }
        if u32::try_from(specs.len()).is_err() {
            return Err(TransferError::InvalidManifest("too many files".to_string()));
        }

        let files = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| FileDescriptor::checked(i as u32, &spec.name, spec.size))
            .collect::<Result<_, _>>()?;

        Ok(Self { files })
    }

    /// Build from the relay's `file_list`, checking indexes are dense.
    ///
    /// # Errors
    ///
    /// - `TransferError::InvalidManifest` if `entries` is empty,
    ///   `entries[i].index != i`, or a file is larger than [`MAX_FILE_SIZE`]
    pub fn from_entries(entries: &[FileEntry]) -> Result<Self, TransferError> {
        if entries.is_empty() {
            return Err(TransferError::InvalidManifest("no files".to_string()));
        }

        let mut files = Vec::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            if entry.index as usize != position {
                return Err(TransferError::InvalidManifest(format!(
                    "entry {position} has index {}",
                    entry.index
                )));
            }
            files.push(FileDescriptor::checked(entry.index, &entry.name, entry.size)?);
        }

        Ok(Self { files })
    }

    /// Files in index order.
    #[must_use]
    pub fn files(&self) -> &[FileDescriptor] {
        &self.files
    }

    /// File at `index`. `None` if out of range.
    #[must_use]
    pub fn file(&self, index: u32) -> Option<&FileDescriptor> {
        self.files.get(index as usize)
    }

    /// File at `index`, or `UnknownFileIndex`.
    ///
    /// # Errors
    ///
    /// - `TransferError::UnknownFileIndex` if `index` is out of range
    pub fn require_file(&self, index: u32) -> Result<&FileDescriptor, TransferError> {
        self.file(index).ok_or(TransferError::UnknownFileIndex {
            file_index: index,
            file_count: self.files.len(),
        })
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Always false for a constructed manifest.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total size of all files in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().fold(0, |total, f| total.saturating_add(f.byte_size))
    }

    /// Stable byte encoding of the manifest, used to tell whether stored
    /// chunks belong to this transfer.
    ///
    /// Per file: `[index:u32 BE][size:u64 BE][name_len:u32 BE][name]`.
    #[must_use]
    pub fn fingerprint(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for file in &self.files {
            out.extend_from_slice(&file.index.to_be_bytes());
            out.extend_from_slice(&file.byte_size.to_be_bytes());
            out.extend_from_slice(&(file.name.len() as u32).to_be_bytes());
            out.extend_from_slice(file.name.as_bytes());
        }
        out
    }

    /// Checks that `(file_index, chunk_index)` addresses a chunk.
    ///
    /// # Errors
    ///
    /// - `TransferError::UnknownFileIndex` if the file is out of range
    /// - `TransferError::UnknownChunkIndex` if the chunk is out of range
    pub fn check_chunk(&self, file_index: u32, chunk_index: u32) -> Result<(), TransferError> {
        let file = self.require_file(file_index)?;
        let total = file.total_chunks();
        if chunk_index >= total {
            return Err(TransferError::UnknownChunkIndex { file_index, chunk_index, total });
        }
        Ok(())
    }

    /// Wire form delivered to receivers.
    #[must_use]
    pub fn to_entries(&self) -> Vec<FileEntry> {
        self.files.iter().map(FileDescriptor::to_entry).collect()
    }

    /// Wire form sent by the sender.
    #[must_use]
    pub fn to_specs(&self) -> Vec<FileSpec> {
        self.files.iter().map(FileDescriptor::to_spec).collect()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn spec(name: &str, size: u64) -> FileSpec {
        FileSpec { name: name.to_string(), size }
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(total_chunks(0), Some(0));
        assert_eq!(total_chunks(1), Some(1));
        assert_eq!(total_chunks(CHUNK_SIZE), Some(1));
        assert_eq!(total_chunks(CHUNK_SIZE + 1), Some(2));
        assert_eq!(total_chunks(600_000), Some(3));
    }

    #[test]
    fn chunk_count_past_u32_is_none() {
        assert_eq!(total_chunks(MAX_FILE_SIZE), Some(u32::MAX));
        assert_eq!(total_chunks(MAX_FILE_SIZE + 1), None);
        assert_eq!(total_chunks(1 << 50), None);
        assert_eq!(total_chunks(u64::MAX), None);
    }

    #[test]
    fn oversize_file_rejected() {
        assert!(matches!(
            TransferManifest::from_specs(&[spec("a", 10), spec("huge", 1 << 50)]),
            Err(TransferError::InvalidManifest(_))
        ));

        let entries = vec![FileEntry { index: 0, name: "huge".to_string(), size: 1 << 50 }];
        assert!(matches!(
            TransferManifest::from_entries(&entries),
            Err(TransferError::InvalidManifest(_))
        ));

        assert!(TransferManifest::from_specs(&[spec("max", MAX_FILE_SIZE)]).is_ok());
    }

    #[test]
    fn hand_built_oversize_descriptor_never_completes() {
        let file = FileDescriptor { index: 0, name: "huge".to_string(), byte_size: 1 << 50 };

        assert_eq!(file.total_chunks(), u32::MAX);
        assert_eq!(file.chunk_len(0), Some(CHUNK_SIZE as usize));
    }

    #[test]
    fn fingerprint_tracks_every_field() {
        let base = TransferManifest::from_specs(&[spec("a", 10), spec("b", 20)]).unwrap();
        let renamed = TransferManifest::from_specs(&[spec("a", 10), spec("c", 20)]).unwrap();
        let resized = TransferManifest::from_specs(&[spec("a", 10), spec("b", 21)]).unwrap();
        let merged = TransferManifest::from_specs(&[spec("ab", 10)]).unwrap();

        assert_eq!(base.fingerprint(), base.clone().fingerprint());
        assert_ne!(base.fingerprint(), renamed.fingerprint());
        assert_ne!(base.fingerprint(), resized.fingerprint());
        assert_ne!(base.fingerprint(), merged.fingerprint());
    }

    #[test]
    fn last_chunk_is_short() {
        let manifest = TransferManifest::from_specs(&[spec("a.bin", 600_000)]).unwrap();
        let file = manifest.file(0).unwrap();

        assert_eq!(file.chunk_range(0), Some(0..CHUNK_SIZE));
        assert_eq!(file.chunk_range(2), Some(2 * CHUNK_SIZE..600_000));
        assert_eq!(file.chunk_len(2), Some(600_000 - 2 * CHUNK_SIZE as usize));
        assert_eq!(file.chunk_range(3), None);
    }

    #[test]
    fn missing_is_complement_of_held() {
        let manifest = TransferManifest::from_specs(&[spec("a.bin", 600_000)]).unwrap();
        let file = manifest.file(0).unwrap();

        assert_eq!(file.missing_chunks(&[0, 2]), vec![1]);
        assert_eq!(file.missing_chunks(&[2, 2, 0, 99]), vec![1]);
        assert_eq!(file.missing_chunks(&[]), vec![0, 1, 2]);
        assert!(file.missing_chunks(&[0, 1, 2]).is_empty());
    }

    #[test]
    fn empty_manifest_rejected() {
        assert!(matches!(
            TransferManifest::from_specs(&[]),
            Err(TransferError::InvalidManifest(_))
        ));
    }

    #[test]
    fn sparse_entries_rejected() {
        let entries = vec![
            FileEntry { index: 0, name: "a".to_string(), size: 1 },
            FileEntry { index: 2, name: "b".to_string(), size: 1 },
        ];
        assert!(matches!(
            TransferManifest::from_entries(&entries),
            Err(TransferError::InvalidManifest(_))
        ));
    }

    #[test]
    fn entries_round_trip_through_manifest() {
        let manifest =
            TransferManifest::from_specs(&[spec("a", 10), spec("b", CHUNK_SIZE * 3)]).unwrap();
        let rebuilt = TransferManifest::from_entries(&manifest.to_entries()).unwrap();
        assert_eq!(manifest, rebuilt);
        assert_eq!(rebuilt.total_bytes(), 10 + CHUNK_SIZE * 3);
    }

    #[test]
    fn check_chunk_bounds() {
        let manifest = TransferManifest::from_specs(&[spec("a", 600_000)]).unwrap();

        assert!(manifest.check_chunk(0, 2).is_ok());
        assert_eq!(
            manifest.check_chunk(0, 3),
            Err(TransferError::UnknownChunkIndex { file_index: 0, chunk_index: 3, total: 3 })
        );
        assert_eq!(
            manifest.check_chunk(1, 0),
            Err(TransferError::UnknownFileIndex { file_index: 1, file_count: 1 })
        );
    }

    proptest! {
        #[test]
        fn chunk_ranges_tile_the_file(size in 0u64..(CHUNK_SIZE * 8)) {
            let file = FileDescriptor { index: 0, name: "f".to_string(), byte_size: size };

            let mut next = 0;
            for chunk_index in 0..file.total_chunks() {
                let range = file.chunk_range(chunk_index).unwrap();
                prop_assert_eq!(range.start, next);
                prop_assert!(range.end > range.start);
                prop_assert!(range.end - range.start <= CHUNK_SIZE);
                next = range.end;
            }
            prop_assert_eq!(next, size);
        }

        #[test]
        fn missing_and_held_partition_the_file(
            size in 1u64..(CHUNK_SIZE * 16),
            held in prop::collection::vec(0u32..20, 0..20),
        ) {
            let file = FileDescriptor { index: 0, name: "f".to_string(), byte_size: size };
            let missing = file.missing_chunks(&held);

            for index in 0..file.total_chunks() {
                prop_assert_eq!(missing.contains(&index), !held.contains(&index));
            }
            prop_assert!(missing.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
