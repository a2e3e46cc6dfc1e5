use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};

use crate::error::Result;

const EMBEDDINGS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("embeddings");

/// Header size: 4 bytes dimension.
const HEADER_SIZE: usize = 4;

/// Raw chapter embeddings keyed by row id, kept next to a vector index as an
/// audit copy. Queries never read it.
///
/// Binary format per entry:
/// - 4 bytes: embedding dimension D (u32 LE)
/// - D * 4 bytes: f32 LE values
pub struct EmbeddingDb {
    db: Database,
}

impl EmbeddingDb {
    /// Open or create an embeddings database at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use chapterindex::EmbeddingDb;
    ///
    /// let db = EmbeddingDb::open(&tmp.path().join("embeddings.redb")).unwrap();
    /// assert_eq!(db.count().unwrap(), 0);
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(EMBEDDINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Open an existing database without creating or modifying it.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let db = Database::open(path)?;
        Ok(Self { db })
    }

    /// Store vectors under row ids `0..vectors.len()` in a single
    /// transaction, replacing whatever was stored before.
    pub fn store_all(&self, vectors: &[Vec<f32>]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EMBEDDINGS)?;
            table.retain(|_, _| false)?;
            for (row_id, vector) in vectors.iter().enumerate() {
                let byte_len = HEADER_SIZE + std::mem::size_of_val(vector.as_slice());
                let mut guard = table.insert_reserve(row_id as u64, byte_len)?;
                let dest = guard.as_mut();

                dest[0..4].copy_from_slice(&(vector.len() as u32).to_le_bytes());
                dest[HEADER_SIZE..].copy_from_slice(bytemuck::cast_slice(vector));
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Retrieve the vector stored for a row, or `None` if absent or
    /// malformed.
    pub fn load(&self, row_id: u64) -> Result<Option<Vec<f32>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;

        let Some(guard) = table.get(row_id)? else {
            return Ok(None);
        };
        Ok(decode(guard.value()))
    }

    /// All well-formed vectors in row order.
    pub fn load_all(&self) -> Result<Vec<(u64, Vec<f32>)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            if let Some(vector) = decode(v.value()) {
                result.push((k.value(), vector));
            }
        }
        Ok(result)
    }

    /// Number of stored entries.
    pub fn count(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        Ok(table.len()?)
    }
}

fn decode(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[0..4]);
    let dimension = u32::from_le_bytes(word) as usize;

    if bytes.len() != HEADER_SIZE + dimension * 4 {
        return None;
    }
    Some(bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE..]))
}

impl std::fmt::Debug for EmbeddingDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingDb").finish_non_exhaustive()
    }
}
