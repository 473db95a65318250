//! Block geometry shared by the chunked and distributed backends.
//!
//! A [`BlockLayout`] describes a genotype array as an ordered list of variant
//! blocks, each made of row segments of stored (or in-memory) chunks. Nothing is
//! read until a block is loaded, so rechunking and prefix truncation only rewrite
//! the segment lists. [`DosageBlocks`] is the materialized counterpart used once
//! genotypes have been reduced to dosages.

use super::{DosageRows, GenotypeError, Parallelism, check_indices, check_mask};
use crate::store::{StoreError, StoreHandle};
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, concatenate, s};
use rayon::prelude::*;
use std::ops::Range;
use std::sync::Arc;

#[derive(Clone, Debug)]
enum ChunkSource {
    Stored { store: Arc<StoreHandle>, chunk: usize },
    Memory(Arc<Array3<i8>>),
}

#[derive(Clone, Debug)]
struct Segment {
    source: ChunkSource,
    /// Rows of the source chunk covered by this segment.
    rows: Range<usize>,
}

/// One unit of work: a run of consecutive variants.
#[derive(Clone, Debug)]
pub struct Block {
    segments: Vec<Segment>,
    n_samples: usize,
}

impl Block {
    pub fn n_variants(&self) -> usize {
        self.segments.iter().map(|s| s.rows.len()).sum()
    }

    /// Reads the block's calls, limited to the layout's sample prefix.
    pub fn load(&self) -> Result<Array3<i8>, StoreError> {
        let mut parts = self
            .segments
            .iter()
            .map(|segment| {
                let rows = segment.rows.clone();
                let slice = s![rows, ..self.n_samples, ..];
                match &segment.source {
                    ChunkSource::Stored { store, chunk } => {
                        let full = store.read_chunk(*chunk)?;
                        if segment.rows.start == 0
                            && segment.rows.end == full.len_of(Axis(0))
                            && self.n_samples == full.len_of(Axis(1))
                        {
                            Ok(full)
                        } else {
                            Ok(full.slice(slice).to_owned())
                        }
                    }
                    ChunkSource::Memory(calls) => Ok(calls.slice(slice).to_owned()),
                }
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        if parts.len() == 1 {
            return Ok(parts.swap_remove(0));
        }
        let views: Vec<ArrayView3<'_, i8>> = parts.iter().map(|p| p.view()).collect();
        concatenate(Axis(0), &views).map_err(|e| StoreError::ChunkShape(e.to_string()))
    }
}

#[derive(Clone, Debug)]
pub struct BlockLayout {
    blocks: Vec<Block>,
    n_samples: usize,
    ploidy: usize,
    max_allele: i8,
    sample_chunk: Option<usize>,
}

impl BlockLayout {
    /// One block per stored chunk, stores concatenated in order.
    pub fn from_stores(stores: &[Arc<StoreHandle>]) -> Self {
        let n_samples = stores.first().map_or(0, |s| s.n_samples());
        let ploidy = stores.first().map_or(0, |s| s.ploidy());
        let max_allele = stores
            .iter()
            .map(|s| s.metadata().max_allele)
            .max()
            .unwrap_or(-1);
        let sample_chunk = stores.first().map(|s| s.metadata().chunk_width);

        let blocks = stores
            .iter()
            .flat_map(|store| {
                (0..store.n_chunks()).map(move |chunk| Block {
                    segments: vec![Segment {
                        source: ChunkSource::Stored {
                            store: Arc::clone(store),
                            chunk,
                        },
                        rows: 0..store.metadata().chunk_rows(chunk).len(),
                    }],
                    n_samples,
                })
            })
            .collect();

        Self {
            blocks,
            n_samples,
            ploidy,
            max_allele,
            sample_chunk,
        }
    }

    /// Wraps already-computed chunks, one block each.
    pub fn from_memory(chunks: Vec<Array3<i8>>, template: &BlockLayout) -> Self {
        let blocks = chunks
            .into_iter()
            .filter(|c| c.len_of(Axis(0)) > 0)
            .map(|chunk| {
                let rows = 0..chunk.len_of(Axis(0));
                Block {
                    segments: vec![Segment {
                        source: ChunkSource::Memory(Arc::new(chunk)),
                        rows,
                    }],
                    n_samples: template.n_samples,
                }
            })
            .collect();
        Self {
            blocks,
            ..template.clone_geometry()
        }
    }

    fn clone_geometry(&self) -> Self {
        Self {
            blocks: Vec::new(),
            n_samples: self.n_samples,
            ploidy: self.ploidy,
            max_allele: self.max_allele,
            sample_chunk: self.sample_chunk,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn n_variants(&self) -> usize {
        self.blocks.iter().map(Block::n_variants).sum()
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn ploidy(&self) -> usize {
        self.ploidy
    }

    /// Width of the allele-count table: every allele up to the highest stored index.
    pub fn n_alleles(&self) -> usize {
        (self.max_allele as i32 + 1).max(1) as usize
    }

    /// Length of the leading block, the nominal variant chunk length.
    pub fn variant_chunk(&self) -> Option<usize> {
        self.blocks.first().map(Block::n_variants)
    }

    /// Column ranges of the sample tiles within each block.
    pub fn sample_tiles(&self) -> Vec<Range<usize>> {
        let width = self.sample_chunk.unwrap_or(self.n_samples).max(1);
        (0..self.n_samples)
            .step_by(width)
            .map(|start| start..(start + width).min(self.n_samples))
            .collect()
    }

    /// Regroups rows into blocks of `variants` rows and records the sample tile width.
    pub fn regroup(&self, variants: Option<usize>, samples: Option<usize>) -> Self {
        let mut layout = match variants {
            Some(chunk_len) => self.regroup_variants(chunk_len),
            None => self.clone(),
        };
        if samples.is_some() {
            layout.sample_chunk = samples;
        }
        layout
    }

    fn regroup_variants(&self, chunk_len: usize) -> Self {
        let chunk_len = chunk_len.max(1);
        let mut blocks = Vec::new();
        let mut current: Vec<Segment> = Vec::new();
        let mut filled = 0;

        for segment in self.blocks.iter().flat_map(|b| b.segments.iter()) {
            let mut start = segment.rows.start;
            while start < segment.rows.end {
                let take = (chunk_len - filled).min(segment.rows.end - start);
                current.push(Segment {
                    source: segment.source.clone(),
                    rows: start..start + take,
                });
                start += take;
                filled += take;
                if filled == chunk_len {
                    blocks.push(Block {
                        segments: std::mem::take(&mut current),
                        n_samples: self.n_samples,
                    });
                    filled = 0;
                }
            }
        }
        if !current.is_empty() {
            blocks.push(Block {
                segments: current,
                n_samples: self.n_samples,
            });
        }

        Self {
            blocks,
            ..self.clone_geometry()
        }
    }

    /// Keeps the first `variants` rows and `samples` columns.
    pub fn truncate(&self, variants: usize, samples: usize) -> Self {
        let n_samples = samples.min(self.n_samples);
        let mut remaining = variants;
        let mut blocks = Vec::new();

        for block in &self.blocks {
            if remaining == 0 {
                break;
            }
            let mut segments = Vec::new();
            for segment in &block.segments {
                if remaining == 0 {
                    break;
                }
                let take = segment.rows.len().min(remaining);
                segments.push(Segment {
                    source: segment.source.clone(),
                    rows: segment.rows.start..segment.rows.start + take,
                });
                remaining -= take;
            }
            blocks.push(Block {
                segments,
                n_samples,
            });
        }

        Self {
            blocks,
            n_samples,
            ..self.clone_geometry()
        }
    }

    /// Loads every block and applies `f` to its calls together with the block's
    /// first global variant index.
    pub fn map_blocks<T, F>(&self, parallelism: Parallelism, f: F) -> Result<Vec<T>, StoreError>
    where
        T: Send,
        F: Fn(usize, ArrayView3<'_, i8>) -> T + Sync + Send,
    {
        let work: Vec<(&Block, usize)> = self.blocks.iter().zip(self.block_starts()).collect();
        let run = |(block, start): &(&Block, usize)| -> Result<T, StoreError> {
            let calls = block.load()?;
            Ok(f(*start, calls.view()))
        };
        match parallelism {
            Parallelism::Sequential => work.iter().map(run).collect(),
            Parallelism::Pool => work.par_iter().map(run).collect(),
        }
    }

    /// First global variant index of every block.
    pub fn block_starts(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .scan(0, |next, block| {
                let start = *next;
                *next += block.n_variants();
                Some(start)
            })
            .collect()
    }
}

/// Dosage matrix held as variant blocks (`rows × samples` each).
#[derive(Clone, Debug)]
pub struct DosageBlocks {
    blocks: Vec<Arc<Array2<u8>>>,
    starts: Vec<usize>,
    n_variants: usize,
    n_samples: usize,
    ploidy: usize,
}

impl DosageBlocks {
    pub fn new(blocks: Vec<Array2<u8>>, n_samples: usize, ploidy: usize) -> Self {
        let blocks: Vec<Arc<Array2<u8>>> = blocks
            .into_iter()
            .filter(|b| b.nrows() > 0)
            .map(Arc::new)
            .collect();
        let mut starts = Vec::with_capacity(blocks.len());
        let mut n_variants = 0;
        for block in &blocks {
            starts.push(n_variants);
            n_variants += block.nrows();
        }
        Self {
            blocks,
            starts,
            n_variants,
            n_samples,
            ploidy,
        }
    }

    pub fn n_variants(&self) -> usize {
        self.n_variants
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn ploidy(&self) -> usize {
        self.ploidy
    }

    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn views(&self) -> Vec<ArrayView2<'_, u8>> {
        self.blocks.iter().map(|b| b.view()).collect()
    }

    pub fn variant_chunk(&self) -> Option<usize> {
        match self.blocks.len() {
            0 | 1 => None,
            _ => Some(self.blocks[0].nrows()),
        }
    }

    fn locate(&self, row: usize) -> (usize, usize) {
        let block = self.starts.partition_point(|&start| start <= row) - 1;
        (block, row - self.starts[block])
    }

    /// Gathers `indices`; consecutive picks from the same block stay together.
    pub fn take(&self, indices: &[usize]) -> Result<Self, GenotypeError> {
        check_indices(indices, self.n_variants)?;
        let mut out: Vec<Array2<u8>> = Vec::new();
        let mut run: Vec<usize> = Vec::new();
        let mut run_block = None;

        for &index in indices {
            let (block, offset) = self.locate(index);
            if run_block != Some(block) && !run.is_empty() {
                if let Some(b) = run_block {
                    out.push(self.blocks[b].select(Axis(0), &run));
                }
                run.clear();
            }
            run_block = Some(block);
            run.push(offset);
        }
        if let Some(b) = run_block {
            out.push(self.blocks[b].select(Axis(0), &run));
        }
        Ok(Self::new(out, self.n_samples, self.ploidy))
    }

    pub fn compress(&self, mask: &[bool]) -> Result<Self, GenotypeError> {
        check_mask(mask, self.n_variants)?;
        let out = self
            .blocks
            .iter()
            .zip(&self.starts)
            .map(|(block, &start)| {
                let keep: Vec<usize> = (0..block.nrows())
                    .filter(|&row| mask[start + row])
                    .collect();
                block.select(Axis(0), &keep)
            })
            .collect();
        Ok(Self::new(out, self.n_samples, self.ploidy))
    }

    /// Regroups rows into blocks of `chunk` rows, or a single block for `None`.
    pub fn regroup(&self, chunk: Option<usize>) -> Self {
        let views = self.views();
        let Ok(all) = concatenate(Axis(0), &views) else {
            return self.clone();
        };
        let chunk = chunk.unwrap_or(self.n_variants).max(1);
        let blocks = (0..self.n_variants)
            .step_by(chunk)
            .map(|start| {
                all.slice(s![start..(start + chunk).min(self.n_variants), ..])
                    .to_owned()
            })
            .collect();
        Self::new(blocks, self.n_samples, self.ploidy)
    }
}

impl DosageRows for DosageBlocks {
    fn n_rows(&self) -> usize {
        self.n_variants
    }

    fn row(&self, index: usize) -> ArrayView1<'_, u8> {
        let (block, offset) = self.locate(index);
        self.blocks[block].row(offset)
    }
}
