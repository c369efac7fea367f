//! Redb-backed durable chunk store.
//!
//! Every `put_chunk` is its own write transaction, committed with redb's
//! default immediate durability before returning. A crash between receipt and
//! commit loses the chunk, never reports it.

use std::{path::Path, sync::Arc};

use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use relaydrop_core::RoomCode;

use super::{ChunkStore, StoreError, decode_chunk_index, encode_chunk_key};

/// Table: chunks
/// Key: `[room_len:u8][room][file_index:u32 BE][chunk_index:u32 BE]`
/// Value: raw chunk bytes
const CHUNKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("chunks");

/// Table: manifests
/// Key: `[room_len:u8][room]`
/// Value: manifest fingerprint
const MANIFESTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("manifests");

/// Durable chunk store backed by redb.
///
/// Thread-safe through redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbChunkStore {
    db: Arc<Database>,
}

impl RedbChunkStore {
    /// Open or create a database at `path`.
    ///
    /// # Errors
    ///
    /// `StoreError::Io` if the database cannot be opened or the tables
    /// cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        txn.open_table(CHUNKS).map_err(io)?;
        txn.open_table(MANIFESTS).map_err(io)?;
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn scan<T>(
        &self,
        start: &[u8],
        end: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> Result<T, StoreError>,
    ) -> Result<Vec<T>, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(CHUNKS).map_err(io)?;

        let mut out = Vec::new();
        for entry in table.range(start..=end).map_err(io)? {
            let (key, value) = entry.map_err(io)?;
            out.push(visit(key.value(), value.value())?);
        }

        Ok(out)
    }
}

impl std::fmt::Debug for RedbChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbChunkStore").finish_non_exhaustive()
    }
}

impl ChunkStore for RedbChunkStore {
    fn put_chunk(
        &self,
        room: &RoomCode,
        file_index: u32,
        chunk_index: u32,
        payload: &[u8],
    ) -> Result<(), StoreError> {
        let key = encode_chunk_key(room, file_index, chunk_index);

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(CHUNKS).map_err(io)?;
            table.insert(key.as_slice(), payload).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn chunk_indexes(&self, room: &RoomCode, file_index: u32) -> Result<Vec<u32>, StoreError> {
        let start = encode_chunk_key(room, file_index, 0);
        let end = encode_chunk_key(room, file_index, u32::MAX);

        self.scan(&start, &end, |key, _| decode_chunk_index(key))
    }

    fn load_chunk(
        &self,
        room: &RoomCode,
        file_index: u32,
        chunk_index: u32,
    ) -> Result<Option<Bytes>, StoreError> {
        let key = encode_chunk_key(room, file_index, chunk_index);

        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(CHUNKS).map_err(io)?;

        Ok(table.get(key.as_slice()).map_err(io)?.map(|v| Bytes::copy_from_slice(v.value())))
    }

    fn load_file(
        &self,
        room: &RoomCode,
        file_index: u32,
    ) -> Result<Vec<(u32, Bytes)>, StoreError> {
        let start = encode_chunk_key(room, file_index, 0);
        let end = encode_chunk_key(room, file_index, u32::MAX);

        self.scan(&start, &end, |key, value| {
            Ok((decode_chunk_index(key)?, Bytes::copy_from_slice(value)))
        })
    }

    fn manifest_fingerprint(&self, room: &RoomCode) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MANIFESTS).map_err(io)?;

        Ok(table.get(room.key_prefix().as_slice()).map_err(io)?.map(|v| v.value().to_vec()))
    }

    fn set_manifest_fingerprint(
        &self,
        room: &RoomCode,
        fingerprint: &[u8],
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(MANIFESTS).map_err(io)?;
            table.insert(room.key_prefix().as_slice(), fingerprint).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn purge_room(&self, room: &RoomCode) -> Result<usize, StoreError> {
        let start = encode_chunk_key(room, 0, 0);
        let end = encode_chunk_key(room, u32::MAX, u32::MAX);

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut manifests = txn.open_table(MANIFESTS).map_err(io)?;
            manifests.remove(room.key_prefix().as_slice()).map_err(io)?;
        }
        let removed = {
            let mut table = txn.open_table(CHUNKS).map_err(io)?;

            let mut keys = Vec::new();
            for entry in table.range(start.as_slice()..=end.as_slice()).map_err(io)? {
                let (key, _) = entry.map_err(io)?;
                keys.push(key.value().to_vec());
            }

            for key in &keys {
                table.remove(key.as_slice()).map_err(io)?;
            }

            keys.len()
        };
        txn.commit().map_err(io)?;

        Ok(removed)
    }
}

fn io(err: impl std::fmt::Display) -> StoreError {
    StoreError::Io(err.to_string())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn put_and_enumerate() {
        let dir = tempdir().unwrap();
        let store = RedbChunkStore::open(dir.path().join("chunks.redb")).unwrap();
        let room = RoomCode::parse("k3x9qa").unwrap();

        store.put_chunk(&room, 0, 2, b"two").unwrap();
        store.put_chunk(&room, 0, 0, b"zero").unwrap();
        store.put_chunk(&room, 1, 0, b"other").unwrap();

        assert_eq!(store.chunk_indexes(&room, 0).unwrap(), vec![0, 2]);
        assert_eq!(store.received_count(&room, 1).unwrap(), 1);
        assert_eq!(store.load_chunk(&room, 0, 2).unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(store.load_chunk(&room, 0, 1).unwrap(), None);
    }

    #[test]
    fn purge_removes_only_that_room() {
        let dir = tempdir().unwrap();
        let store = RedbChunkStore::open(dir.path().join("chunks.redb")).unwrap();
        let a = RoomCode::parse("ab").unwrap();
        let b = RoomCode::parse("abc").unwrap();

        store.put_chunk(&a, 0, 0, b"a0").unwrap();
        store.put_chunk(&a, 3, 1, b"a1").unwrap();
        store.put_chunk(&b, 0, 0, b"b0").unwrap();

        assert_eq!(store.purge_room(&a).unwrap(), 2);
        assert!(store.chunk_indexes(&a, 0).unwrap().is_empty());
        assert_eq!(store.chunk_indexes(&b, 0).unwrap(), vec![0]);
    }

    #[test]
    fn fingerprint_survives_reopen_until_purge() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.redb");
        let room = RoomCode::parse("k3x9qa").unwrap();

        {
            let store = RedbChunkStore::open(&path).unwrap();
            assert_eq!(store.manifest_fingerprint(&room).unwrap(), None);
            store.set_manifest_fingerprint(&room, b"manifest-v1").unwrap();
            store.put_chunk(&room, 0, 0, b"zero").unwrap();
        }

        let store = RedbChunkStore::open(&path).unwrap();
        assert_eq!(store.manifest_fingerprint(&room).unwrap(), Some(b"manifest-v1".to_vec()));

        assert_eq!(store.purge_room(&room).unwrap(), 1);
        assert_eq!(store.manifest_fingerprint(&room).unwrap(), None);
    }
}
