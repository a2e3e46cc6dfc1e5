use std::{io::Write, path::Path};

use rayon::prelude::*;

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"CHVI";
const FORMAT_VERSION: u32 = 1;

/// Header size: 4 bytes magic + 4 bytes version + 4 bytes dimension +
/// 4 bytes vector count.
const HEADER_SIZE: usize = 16;

/// One search hit: the row of a stored vector and its squared L2 distance
/// to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub row_id: usize,
    pub distance: f32,
}

/// Exact nearest-neighbor index over a small set of equal-length vectors.
///
/// Vectors are kept in one flat row-major buffer and every query scans all
/// of them, so results are exact. Textbooks have tens of chapters, which
/// keeps the O(N * dim) scan well under a millisecond.
///
/// Binary format (all integers little endian):
/// - 4 bytes: magic `CHVI`
/// - 4 bytes: format version
/// - 4 bytes: dimension D
/// - 4 bytes: vector count N
/// - N * D * 4 bytes: f32 values in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl VectorIndex {
    /// Build an index from vectors; row `i` is the `i`-th input vector.
    ///
    /// # Examples
    ///
    /// ```
    /// use chapterindex::VectorIndex;
    ///
    /// let index = VectorIndex::build(&[
    ///     vec![1.0, 0.0],
    ///     vec![0.0, 1.0],
    ///     vec![0.9, 0.1],
    /// ])
    /// .unwrap();
    /// let hits = index.search(&[1.0, 0.0], 2).unwrap();
    /// assert_eq!(hits[0].row_id, 0);
    /// assert_eq!(hits[1].row_id, 2);
    /// ```
    pub fn build(vectors: &[Vec<f32>]) -> Result<Self> {
        let Some(first) = vectors.first() else {
            return Err(Error::EmptyInput);
        };
        let dimension = first.len();
        if dimension == 0 {
            return Err(Error::DimensionMismatch {
                expected: 1,
                actual: 0,
            });
        }

        let mut data = Vec::with_capacity(dimension * vectors.len());
        for (row_id, vector) in vectors.iter().enumerate() {
            if vector.len() != dimension {
                return Err(Error::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                });
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(Error::InvalidVector { row_id });
            }
            data.extend_from_slice(vector);
        }

        Ok(Self { dimension, data })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The stored vector for a row.
    pub fn vector(&self, row_id: usize) -> Result<&[f32]> {
        if row_id >= self.len() {
            return Err(Error::RowNotFound {
                row_id,
                len: self.len(),
            });
        }
        let start = row_id * self.dimension;
        Ok(&self.data[start..start + self.dimension])
    }

    /// Return the `min(k, len)` rows closest to `query`, closest first.
    ///
    /// Equal distances are ordered by ascending row id so results are
    /// reproducible.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if k == 0 {
            return Err(Error::InvalidTopK);
        }
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut hits: Vec<Neighbor> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(row_id, stored)| Neighbor {
                row_id,
                distance: squared_l2(query, stored),
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.row_id.cmp(&b.row_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Run [`search`](Self::search) for several queries in parallel.
    ///
    /// Output order matches input order. Fails on the first bad query.
    pub fn search_batch(
        &self,
        queries: &[Vec<f32>],
        k: usize,
    ) -> Result<Vec<Vec<Neighbor>>> {
        queries.par_iter().map(|q| self.search(q, k)).collect()
    }

    /// Write the index to `path`, syncing it to disk before returning.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut bytes =
            Vec::with_capacity(HEADER_SIZE + std::mem::size_of_val(&*self.data));
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&header_u32(self.dimension)?.to_le_bytes());
        bytes.extend_from_slice(&header_u32(self.len())?.to_le_bytes());
        bytes.extend_from_slice(bytemuck::cast_slice(&self.data));

        let mut file = std::fs::File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read an index written by [`write_to`](Self::write_to).
    ///
    /// A missing file surfaces as `Io`; anything malformed is reported via
    /// `CorruptIndex` with `textbook_id` as context.
    pub fn read_from(path: &Path, textbook_id: &str) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes).map_err(|reason| Error::CorruptIndex {
            textbook_id: textbook_id.to_string(),
            reason: format!("{}: {reason}", path.display()),
        })
    }

    fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < HEADER_SIZE {
            return Err(format!("file too short ({} bytes)", bytes.len()));
        }
        if &bytes[0..4] != MAGIC {
            return Err("bad magic".to_string());
        }

        let read_u32 = |at: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(word)
        };
        let version = read_u32(4);
        if version != FORMAT_VERSION {
            return Err(format!("unsupported format version {version}"));
        }
        let dimension = read_u32(8) as usize;
        let count = read_u32(12) as usize;
        if dimension == 0 || count == 0 {
            return Err(format!(
                "empty index (dimension {dimension}, count {count})"
            ));
        }

        let expected_len = dimension
            .checked_mul(count)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or_else(|| "header sizes overflow".to_string())?;
        if bytes.len() != expected_len {
            return Err(format!(
                "expected {expected_len} bytes for {count}x{dimension}, found {}",
                bytes.len()
            ));
        }

        let data: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE..]);
        if let Some(pos) = data.iter().position(|v| !v.is_finite()) {
            return Err(format!("non-finite value in row {}", pos / dimension));
        }

        Ok(Self { dimension, data })
    }
}

fn header_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        Error::Config(format!("index too large to serialize: {value}"))
    })
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}
