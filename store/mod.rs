//! The on-disk columnar genotype store.
//!
//! A store is a directory holding a `store.json` metadata document and one
//! gzip-compressed chunk file per block of variants under `calldata/GT/`. Each
//! chunk is a variant-major `rows × samples × ploidy` array of `i8` allele
//! calls where `-1` marks a missing call. Stores are written once (by the
//! converter) and opened read-only by the benchmark.

pub mod convert;

use crate::shared::files::STORE_METADATA_FILE;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::{Array3, ArrayView3, Axis, concatenate};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const STORE_FORMAT_VERSION: u32 = 1;
pub const GENOTYPE_CHUNK_DIR: &str = "calldata/GT";
pub const MISSING_CALL: i8 = -1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid store metadata in {path}: {source}")]
    Metadata {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} is not a genotype store (missing {STORE_METADATA_FILE})")]
    NotAStore { path: String },
    #[error("unsupported store format version {found} in {path}")]
    UnsupportedVersion { path: String, found: u32 },
    #[error("chunk {index} of {path} holds {actual} calls, expected {expected}")]
    ChunkLength {
        path: String,
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("chunk {index} is out of range for a store with {n_chunks} chunks")]
    ChunkOutOfRange { index: usize, n_chunks: usize },
    #[error("invalid chunk shape: {0}")]
    ChunkShape(String),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub format_version: u32,
    pub n_variants: usize,
    pub n_samples: usize,
    pub ploidy: usize,
    pub chunk_length: usize,
    pub chunk_width: usize,
    pub alt_number: usize,
    /// Highest allele index observed in any call, `-1` when every call is missing.
    pub max_allele: i8,
    pub compression_level: u32,
    pub samples: Vec<String>,
}

impl StoreMetadata {
    pub fn n_chunks(&self) -> usize {
        self.n_variants.div_ceil(self.chunk_length.max(1))
    }

    /// Variant rows covered by chunk `index`.
    pub fn chunk_rows(&self, index: usize) -> Range<usize> {
        let start = index * self.chunk_length;
        let end = (start + self.chunk_length).min(self.n_variants);
        start..end
    }
}

/// Geometry and labelling shared by every chunk of a store being written.
#[derive(Clone, Debug)]
pub struct StoreLayout {
    pub samples: Vec<String>,
    pub ploidy: usize,
    pub chunk_length: usize,
    pub chunk_width: usize,
    pub alt_number: usize,
    pub compression_level: u32,
}

/// Read-only handle to an opened store.
#[derive(Debug)]
pub struct StoreHandle {
    path: PathBuf,
    metadata: StoreMetadata,
}

pub fn open_store(path: &Path) -> Result<StoreHandle, StoreError> {
    let metadata_path = path.join(STORE_METADATA_FILE);
    if !metadata_path.is_file() {
        return Err(StoreError::NotAStore {
            path: path.display().to_string(),
        });
    }

    let file = File::open(&metadata_path).map_err(|e| StoreError::io(&metadata_path, e))?;
    let metadata: StoreMetadata =
        serde_json::from_reader(BufReader::new(file)).map_err(|source| StoreError::Metadata {
            path: metadata_path.display().to_string(),
            source,
        })?;

    if metadata.format_version != STORE_FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            path: path.display().to_string(),
            found: metadata.format_version,
        });
    }

    Ok(StoreHandle {
        path: path.to_path_buf(),
        metadata,
    })
}

impl StoreHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    pub fn n_variants(&self) -> usize {
        self.metadata.n_variants
    }

    pub fn n_samples(&self) -> usize {
        self.metadata.n_samples
    }

    pub fn ploidy(&self) -> usize {
        self.metadata.ploidy
    }

    pub fn n_chunks(&self) -> usize {
        self.metadata.n_chunks()
    }

    pub fn read_chunk(&self, index: usize) -> Result<Array3<i8>, StoreError> {
        let n_chunks = self.n_chunks();
        if index >= n_chunks {
            return Err(StoreError::ChunkOutOfRange { index, n_chunks });
        }

        let rows = self.metadata.chunk_rows(index).len();
        let expected = rows * self.metadata.n_samples * self.metadata.ploidy;
        let chunk_path = chunk_path(&self.path, index);
        let file = File::open(&chunk_path).map_err(|e| StoreError::io(&chunk_path, e))?;

        let mut raw = Vec::with_capacity(expected);
        GzDecoder::new(BufReader::new(file))
            .read_to_end(&mut raw)
            .map_err(|e| StoreError::io(&chunk_path, e))?;

        if raw.len() != expected {
            return Err(StoreError::ChunkLength {
                path: self.path.display().to_string(),
                index,
                expected,
                actual: raw.len(),
            });
        }

        let calls: Vec<i8> = raw.into_iter().map(|b| b as i8).collect();
        Array3::from_shape_vec(
            (rows, self.metadata.n_samples, self.metadata.ploidy),
            calls,
        )
        .map_err(|e| StoreError::ChunkShape(e.to_string()))
    }

    /// Reads every chunk and stacks them into one in-memory array.
    pub fn read_all(&self) -> Result<Array3<i8>, StoreError> {
        let chunks = (0..self.n_chunks())
            .map(|index| self.read_chunk(index))
            .collect::<Result<Vec<_>, _>>()?;
        if chunks.is_empty() {
            return Ok(Array3::from_elem(
                (0, self.metadata.n_samples, self.metadata.ploidy),
                MISSING_CALL,
            ));
        }
        let views: Vec<ArrayView3<'_, i8>> = chunks.iter().map(|c| c.view()).collect();
        concatenate(Axis(0), &views).map_err(|e| StoreError::ChunkShape(e.to_string()))
    }
}

fn chunk_path(store: &Path, index: usize) -> PathBuf {
    store.join(GENOTYPE_CHUNK_DIR).join(index.to_string())
}

/// Streams chunks into a new store directory.
pub struct StoreWriter {
    path: PathBuf,
    layout: StoreLayout,
    chunks_written: usize,
    variants_written: usize,
    max_allele: i8,
    saw_short_chunk: bool,
}

impl StoreWriter {
    pub fn create(path: &Path, layout: StoreLayout) -> Result<Self, StoreError> {
        if layout.chunk_length == 0 || layout.ploidy == 0 {
            return Err(StoreError::ChunkShape(
                "chunk length and ploidy must be positive".to_string(),
            ));
        }
        let chunk_dir = path.join(GENOTYPE_CHUNK_DIR);
        fs::create_dir_all(&chunk_dir).map_err(|e| StoreError::io(&chunk_dir, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            layout,
            chunks_written: 0,
            variants_written: 0,
            max_allele: MISSING_CALL,
            saw_short_chunk: false,
        })
    }

    /// Appends one chunk. Every chunk except the last must hold exactly
    /// `chunk_length` variants.
    pub fn write_chunk(&mut self, calls: ArrayView3<'_, i8>) -> Result<(), StoreError> {
        let (rows, samples, ploidy) = calls.dim();
        if samples != self.layout.samples.len() || ploidy != self.layout.ploidy {
            return Err(StoreError::ChunkShape(format!(
                "chunk has {samples} samples × ploidy {ploidy}, store expects {} × {}",
                self.layout.samples.len(),
                self.layout.ploidy
            )));
        }
        if rows == 0 {
            return Ok(());
        }
        if self.saw_short_chunk || rows > self.layout.chunk_length {
            return Err(StoreError::ChunkShape(format!(
                "chunk {} has {rows} variants but the chunk length is {} and only the final chunk may be shorter",
                self.chunks_written, self.layout.chunk_length
            )));
        }
        self.saw_short_chunk = rows < self.layout.chunk_length;

        let chunk_path = chunk_path(&self.path, self.chunks_written);
        let file = File::create(&chunk_path).map_err(|e| StoreError::io(&chunk_path, e))?;
        let mut encoder = GzEncoder::new(
            BufWriter::new(file),
            Compression::new(self.layout.compression_level),
        );
        let bytes: Vec<u8> = calls.iter().map(|&c| c as u8).collect();
        encoder
            .write_all(&bytes)
            .and_then(|_| encoder.finish())
            .and_then(|mut inner| inner.flush())
            .map_err(|e| StoreError::io(&chunk_path, e))?;

        if let Some(&max) = calls.iter().max() {
            self.max_allele = self.max_allele.max(max);
        }
        self.chunks_written += 1;
        self.variants_written += rows;
        Ok(())
    }

    pub fn finish(self) -> Result<StoreHandle, StoreError> {
        let metadata = StoreMetadata {
            format_version: STORE_FORMAT_VERSION,
            n_variants: self.variants_written,
            n_samples: self.layout.samples.len(),
            ploidy: self.layout.ploidy,
            chunk_length: self.layout.chunk_length,
            chunk_width: self.layout.chunk_width,
            alt_number: self.layout.alt_number,
            max_allele: self.max_allele,
            compression_level: self.layout.compression_level,
            samples: self.layout.samples,
        };

        let metadata_path = self.path.join(STORE_METADATA_FILE);
        let file = File::create(&metadata_path).map_err(|e| StoreError::io(&metadata_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &metadata).map_err(|source| {
            StoreError::Metadata {
                path: metadata_path.display().to_string(),
                source,
            }
        })?;
        writer
            .flush()
            .map_err(|e| StoreError::io(&metadata_path, e))?;

        Ok(StoreHandle {
            path: self.path,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, s};

    fn layout(n_samples: usize, chunk_length: usize) -> StoreLayout {
        StoreLayout {
            samples: (0..n_samples).map(|i| format!("S{i}")).collect(),
            ploidy: 2,
            chunk_length,
            chunk_width: 2,
            alt_number: 1,
            compression_level: 1,
        }
    }

    fn calls(rows: usize, samples: usize) -> Array3<i8> {
        Array3::from_shape_fn((rows, samples, 2), |(v, s, p)| ((v + s + p) % 3) as i8 - 1)
    }

    #[test]
    fn chunks_are_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let data = calls(5, 3);

        let mut writer = StoreWriter::create(&path, layout(3, 2)).unwrap();
        writer.write_chunk(data.slice(s![0..2, .., ..])).unwrap();
        writer.write_chunk(data.slice(s![2..4, .., ..])).unwrap();
        writer.write_chunk(data.slice(s![4..5, .., ..])).unwrap();
        let written = writer.finish().unwrap();
        assert_eq!(written.n_chunks(), 3);

        let handle = open_store(&path).unwrap();
        assert_eq!(handle.metadata(), written.metadata());
        assert_eq!(handle.metadata().chunk_rows(2), 4..5);
        assert_eq!(handle.read_chunk(1).unwrap(), data.slice(s![2..4, .., ..]));
        assert_eq!(handle.read_all().unwrap(), data);
        assert_eq!(handle.metadata().max_allele, 1);
    }

    #[test]
    fn short_chunk_must_be_last() {
        let dir = tempfile::tempdir().unwrap();
        let data = calls(3, 2);
        let mut writer = StoreWriter::create(&dir.path().join("s"), layout(2, 2)).unwrap();
        writer.write_chunk(data.slice(s![0..1, .., ..])).unwrap();
        assert!(matches!(
            writer.write_chunk(data.slice(s![1..3, .., ..])),
            Err(StoreError::ChunkShape(_))
        ));
    }

    #[test]
    fn opening_a_plain_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            open_store(dir.path()),
            Err(StoreError::NotAStore { .. })
        ));
    }

    #[test]
    fn truncated_chunk_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let mut writer = StoreWriter::create(&path, layout(2, 4)).unwrap();
        writer.write_chunk(calls(4, 2).view()).unwrap();
        writer.finish().unwrap();

        let mut encoder = GzEncoder::new(
            File::create(path.join(GENOTYPE_CHUNK_DIR).join("0")).unwrap(),
            Compression::default(),
        );
        encoder.write_all(&[0u8; 3]).unwrap();
        encoder.finish().unwrap();

        let handle = open_store(&path).unwrap();
        assert!(matches!(
            handle.read_chunk(0),
            Err(StoreError::ChunkLength { expected: 16, actual: 3, .. })
        ));
    }
}
