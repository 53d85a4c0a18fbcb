use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use redb::{
    Database,
    ReadOnlyDatabase,
    ReadableDatabase,
    ReadableTableMetadata,
    TableDefinition,
};

use crate::{
    chunk::{Chunk, EmbeddedChunk},
    error::{Error, Result},
    vector,
};

/// Bumped whenever the on-disk layout of the index file changes.
pub const FORMAT_VERSION: u64 = 1;

const HEADER: TableDefinition<&str, u64> = TableDefinition::new("header");
const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");

const KEY_VERSION: &str = "format_version";
const KEY_DIMENSION: &str = "dimension";
const KEY_COUNT: &str = "count";

/// Unit vectors of a fixed dimension, addressed by dense ids `0..len()` in
/// insertion order.
///
/// Stored as one flat row-major buffer: vector `i` is
/// `data[i * dimension..(i + 1) * dimension]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    dimension: usize,
    data: Vec<f32>,
}

impl Index {
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The stored vector for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id >= self.len()`.
    pub fn vector(&self, id: usize) -> &[f32] {
        let start = id * self.dimension;
        &self.data[start..start + self.dimension]
    }

    pub fn as_flat(&self) -> &[f32] {
        &self.data
    }

    /// Persist the index as a redb database at `path`.
    ///
    /// Layout:
    /// - `header` table: `format_version`, `dimension`, `count`
    /// - `vectors` table: id -> `dimension` f32 values (native byte order)
    pub fn write(&self, path: &Path) -> Result<()> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        {
            let mut header = txn.open_table(HEADER)?;
            header.insert(KEY_VERSION, FORMAT_VERSION)?;
            header.insert(KEY_DIMENSION, self.dimension as u64)?;
            header.insert(KEY_COUNT, self.len() as u64)?;

            let mut vectors = txn.open_table(VECTORS)?;
            for id in 0..self.len() {
                let bytes: &[u8] = bytemuck::cast_slice(self.vector(id));
                vectors.insert(id as u64, bytes)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Load an index written by [`Index::write`].
    ///
    /// The file is opened read-only, so any number of processes can load the
    /// same published index at once. Any structural problem (missing file, unknown format version, missing
    /// or mis-sized vector, non-finite value) is reported as
    /// [`Error::IndexLoad`].
    pub fn read(path: &Path) -> Result<Self> {
        read_index_file(path).map_err(|e| match e {
            Error::IndexLoad(reason) => {
                Error::IndexLoad(format!("{}: {reason}", path.display()))
            }
            other => Error::IndexLoad(format!("{}: {other}", path.display())),
        })
    }
}

fn read_index_file(path: &Path) -> Result<Index> {
    let db = ReadOnlyDatabase::open(path)?;
    let txn = db.begin_read()?;

    let header = txn.open_table(HEADER)?;
    let read_header = |key: &str| -> Result<u64> {
        header
            .get(key)?
            .map(|v| v.value())
            .ok_or_else(|| Error::IndexLoad(format!("header is missing '{key}'")))
    };

    let version = read_header(KEY_VERSION)?;
    if version != FORMAT_VERSION {
        return Err(Error::IndexLoad(format!(
            "unsupported format version {version} (expected {FORMAT_VERSION})"
        )));
    }
    let dimension = header_usize(KEY_DIMENSION, read_header(KEY_DIMENSION)?)?;
    let count = header_usize(KEY_COUNT, read_header(KEY_COUNT)?)?;
    if dimension == 0 {
        return Err(Error::IndexLoad("dimension is zero".to_string()));
    }

    let vectors = txn.open_table(VECTORS)?;
    let stored = vectors.len()?;
    if stored != count as u64 {
        return Err(Error::IndexLoad(format!(
            "header declares {count} vectors but {stored} are stored"
        )));
    }

    let row_bytes = dimension
        .checked_mul(std::mem::size_of::<f32>())
        .ok_or_else(|| Error::IndexLoad(format!("dimension {dimension} is too large")))?;
    let total = count.checked_mul(dimension).ok_or_else(|| {
        Error::IndexLoad(format!("{count} vectors of dimension {dimension} overflow"))
    })?;

    let read_row = |id: usize| -> Result<Vec<f32>> {
        let guard = vectors
            .get(id as u64)?
            .ok_or_else(|| Error::IndexLoad(format!("vector {id} is missing")))?;
        let bytes = guard.value();
        if bytes.len() != row_bytes {
            return Err(Error::IndexLoad(format!(
                "vector {id} has {} bytes, expected {row_bytes}",
                bytes.len()
            )));
        }
        let row: Vec<f32> = bytemuck::pod_collect_to_vec(bytes);
        if row.iter().any(|x| !x.is_finite()) {
            return Err(Error::IndexLoad(format!(
                "vector {id} contains non-finite values"
            )));
        }
        Ok(row)
    };

    if count == 0 {
        return Ok(Index {
            dimension,
            data: Vec::new(),
        });
    }

    // The header is only trusted for allocation once a stored row matches it.
    let first = read_row(0)?;
    let mut data = Vec::with_capacity(total);
    data.extend_from_slice(&first);
    for id in 1..count {
        data.extend_from_slice(&read_row(id)?);
    }

    Ok(Index { dimension, data })
}

fn header_usize(key: &str, value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| Error::IndexLoad(format!("header '{key}' value {value} is out of range")))
}

/// Chunk records positionally aligned with [`Index`] ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataStore {
    chunks: Vec<Chunk>,
}

impl MetadataStore {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    /// Write one JSON object per line; line `i` describes vector `i`.
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        for chunk in &self.chunks {
            serde_json::to_writer(&mut writer, chunk)?;
            writer.write_all(b"\n")?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    /// Read a metadata file. Blank lines are rejected because they would
    /// shift every following record off its vector id.
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::IndexLoad(format!("{}: {e}", path.display()))
        })?;

        let mut chunks = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| {
                Error::IndexLoad(format!("{}: {e}", path.display()))
            })?;
            if line.trim().is_empty() {
                return Err(Error::IndexLoad(format!(
                    "{}: blank line {}",
                    path.display(),
                    line_no + 1
                )));
            }
            let chunk: Chunk = serde_json::from_str(&line).map_err(|e| {
                Error::IndexLoad(format!(
                    "{}: line {}: {e}",
                    path.display(),
                    line_no + 1
                ))
            })?;
            chunks.push(chunk);
        }

        Ok(Self { chunks })
    }
}

impl From<Vec<Chunk>> for MetadataStore {
    fn from(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }
}

/// Build an index and its aligned metadata from embedded chunks.
///
/// The dimension is taken from the first chunk; the first chunk whose
/// embedding differs fails the whole build. Every embedding is re-normalized
/// to unit length. Ids follow input order.
pub fn build(chunks: Vec<EmbeddedChunk>) -> Result<(Index, MetadataStore)> {
    let Some(first) = chunks.first() else {
        return Err(Error::InvalidArgument(
            "cannot build an index from zero chunks".to_string(),
        ));
    };
    let dimension = first.embedding.len();
    if dimension == 0 {
        return Err(Error::InvalidArgument(format!(
            "chunk {} has an empty embedding",
            first.chunk.label()
        )));
    }

    let mut data = Vec::with_capacity(chunks.len() * dimension);
    let mut metadata = Vec::with_capacity(chunks.len());

    for (position, EmbeddedChunk { chunk, mut embedding }) in
        chunks.into_iter().enumerate()
    {
        if embedding.len() != dimension {
            return Err(Error::DimensionMismatch {
                subject: format!("chunk {} at position {position}", chunk.label()),
                expected: dimension,
                found: embedding.len(),
            });
        }
        if !vector::normalize(&mut embedding) {
            return Err(Error::InvalidArgument(format!(
                "chunk {} at position {position} has a zero or non-finite embedding",
                chunk.label()
            )));
        }
        data.extend_from_slice(&embedding);
        metadata.push(chunk);
    }

    tracing::debug!(count = metadata.len(), dimension, "built index");
    Ok((Index { dimension, data }, MetadataStore { chunks: metadata }))
}
