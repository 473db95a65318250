//! Chunked backend: calls stay in their stores and are streamed one block at a
//! time on the calling thread. Results are computed eagerly.

use super::blocks::{BlockLayout, DosageBlocks};
use super::kernels::{self, AlleleCounts};
use super::{
    Backend, CountAxis, DosageOps, DosageRows, GenotypeError, GenotypeOps, Parallelism,
    RechunkTarget, Realize, check_mask,
};
use crate::pca::fit::{self, PcaError, PcaFit, PcaMethod, PcaOptions};
use crate::store::StoreHandle;
use ndarray::{Array1, Array3, ArrayView1, Axis};
use std::sync::Arc;

pub struct ChunkedGenotypes {
    layout: BlockLayout,
}

impl ChunkedGenotypes {
    pub fn from_stores(stores: &[Arc<StoreHandle>]) -> Self {
        Self {
            layout: BlockLayout::from_stores(stores),
        }
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    fn count_along(
        &self,
        axis: CountAxis,
        kernel: fn(ndarray::ArrayView3<'_, i8>, CountAxis) -> Array1<u32>,
    ) -> Result<Array1<u32>, GenotypeError> {
        let parts = self
            .layout
            .map_blocks(Parallelism::Sequential, |_, calls| kernel(calls, axis))?;
        Ok(kernels::combine_axis_counts(
            parts,
            axis,
            self.layout.n_samples(),
        ))
    }
}

impl Realize for ChunkedGenotypes {
    type Pending<T: Send + 'static> = T;

    fn realize<T: Send + 'static>(&self, pending: T) -> T {
        pending
    }
}

impl GenotypeOps for ChunkedGenotypes {
    type Dosage = ChunkedDosage;

    const BACKEND: Backend = Backend::Chunked;

    fn n_variants(&self) -> usize {
        self.layout.n_variants()
    }

    fn n_samples(&self) -> usize {
        self.layout.n_samples()
    }

    fn ploidy(&self) -> usize {
        self.layout.ploidy()
    }

    fn count_alleles(&self) -> Result<AlleleCounts, GenotypeError> {
        let n_alleles = self.layout.n_alleles();
        let parts = self.layout.map_blocks(Parallelism::Sequential, |_, calls| {
            kernels::count_alleles(calls, n_alleles)
        })?;
        Ok(AlleleCounts::stack(&parts, n_alleles))
    }

    fn count_het(&self, axis: CountAxis) -> Result<Array1<u32>, GenotypeError> {
        self.count_along(axis, kernels::count_het)
    }

    fn count_hom(&self, axis: CountAxis) -> Result<Array1<u32>, GenotypeError> {
        self.count_along(axis, kernels::count_hom)
    }

    fn select(&self, mask: &[bool]) -> Result<Self, GenotypeError> {
        check_mask(mask, self.n_variants())?;
        let chunks = self
            .layout
            .map_blocks(Parallelism::Sequential, |start, calls| {
                select_rows(start, calls, mask)
            })?;
        Ok(Self {
            layout: BlockLayout::from_memory(chunks, &self.layout),
        })
    }

    fn to_dosage(&self) -> Result<ChunkedDosage, GenotypeError> {
        let blocks = self
            .layout
            .map_blocks(Parallelism::Sequential, |_, calls| kernels::to_dosage(calls))?;
        Ok(ChunkedDosage {
            blocks: DosageBlocks::new(blocks, self.n_samples(), self.ploidy()),
        })
    }

    fn variant_chunk(&self) -> Option<usize> {
        self.layout.variant_chunk()
    }

    fn rechunk(self, target: RechunkTarget) -> Self {
        Self {
            layout: self.layout.regroup(target.variants, target.samples),
        }
    }

    fn truncate(self, variants: usize, samples: usize) -> Self {
        Self {
            layout: self.layout.truncate(variants, samples),
        }
    }
}

/// Rows of one block whose global mask entry is set.
fn select_rows(
    start: usize,
    calls: ndarray::ArrayView3<'_, i8>,
    mask: &[bool],
) -> Array3<i8> {
    let rows: Vec<usize> = (0..calls.len_of(Axis(0)))
        .filter(|&row| mask[start + row])
        .collect();
    calls.select(Axis(0), &rows)
}

pub struct ChunkedDosage {
    blocks: DosageBlocks,
}

impl ChunkedDosage {
    pub fn blocks(&self) -> &DosageBlocks {
        &self.blocks
    }
}

impl Realize for ChunkedDosage {
    type Pending<T: Send + 'static> = T;

    fn realize<T: Send + 'static>(&self, pending: T) -> T {
        pending
    }
}

impl DosageRows for ChunkedDosage {
    fn n_rows(&self) -> usize {
        self.blocks.n_rows()
    }

    fn row(&self, index: usize) -> ArrayView1<'_, u8> {
        self.blocks.row(index)
    }
}

impl DosageOps for ChunkedDosage {
    fn n_variants(&self) -> usize {
        self.blocks.n_variants()
    }

    fn n_samples(&self) -> usize {
        self.blocks.n_samples()
    }

    fn take(&self, indices: &[usize]) -> Result<Self, GenotypeError> {
        Ok(Self {
            blocks: self.blocks.take(indices)?,
        })
    }

    fn compress(self, mask: &[bool]) -> Result<Self, GenotypeError> {
        Ok(Self {
            blocks: self.blocks.compress(mask)?,
        })
    }

    fn ld_rows(&self) -> Option<&dyn DosageRows> {
        Some(self)
    }

    fn variant_chunk(&self) -> Option<usize> {
        self.blocks.variant_chunk()
    }

    fn rechunk_variants(self, chunk: Option<usize>) -> Self {
        Self {
            blocks: self.blocks.regroup(chunk),
        }
    }

    fn pca(&self, method: PcaMethod, options: &PcaOptions) -> Result<PcaFit, PcaError> {
        fit::fit(
            &self.blocks.views(),
            self.blocks.ploidy(),
            method,
            options,
            Parallelism::Sequential,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genotype::DenseGenotypes;
    use crate::store::{StoreLayout, StoreWriter};
    use ndarray::s;

    fn calls() -> Array3<i8> {
        Array3::from_shape_fn((9, 5, 2), |(v, s, p)| {
            if v == 7 && s == 2 {
                -1
            } else {
                ((v * 7 + s * 3 + p * (v % 3)) % 4 % 3) as i8
            }
        })
    }

    fn store_for(dir: &std::path::Path, calls: &Array3<i8>) -> Arc<StoreHandle> {
        let mut writer = StoreWriter::create(
            &dir.join("chunked"),
            StoreLayout {
                samples: (0..5).map(|i| format!("S{i}")).collect(),
                ploidy: 2,
                chunk_length: 4,
                chunk_width: 2,
                alt_number: 2,
                compression_level: 1,
            },
        )
        .unwrap();
        for start in (0..9).step_by(4) {
            let end = (start + 4).min(9);
            writer.write_chunk(calls.slice(s![start..end, .., ..])).unwrap();
        }
        Arc::new(writer.finish().unwrap())
    }

    #[test]
    fn streamed_counts_match_dense_counts() {
        let dir = tempfile::tempdir().unwrap();
        let calls = calls();
        let store = store_for(dir.path(), &calls);
        let chunked = ChunkedGenotypes::from_stores(&[store]);
        let dense = DenseGenotypes::new(calls);

        assert_eq!(
            chunked.count_alleles().unwrap(),
            dense.count_alleles().unwrap()
        );
        for axis in [CountAxis::Variants, CountAxis::Samples] {
            assert_eq!(chunked.count_het(axis).unwrap(), dense.count_het(axis).unwrap());
            assert_eq!(chunked.count_hom(axis).unwrap(), dense.count_hom(axis).unwrap());
        }
    }

    #[test]
    fn select_then_dosage_across_block_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let calls = calls();
        let store = store_for(dir.path(), &calls);
        let chunked = ChunkedGenotypes::from_stores(&[store]).rechunk(RechunkTarget {
            variants: Some(3),
            samples: None,
        });
        let mask: Vec<bool> = (0..9).map(|v| v % 2 == 1).collect();

        let picked = chunked.select(&mask).unwrap();
        assert_eq!(picked.n_variants(), 4);
        let dosage = picked.to_dosage().unwrap();
        let expected = kernels::to_dosage(calls.view());
        assert_eq!(dosage.row(3), expected.row(7));
        assert_eq!(dosage.variant_chunk(), Some(1));
    }

    #[test]
    fn truncated_layout_reports_prefix_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_for(dir.path(), &calls());
        let chunked = ChunkedGenotypes::from_stores(&[store]).truncate(5, 3);
        assert_eq!((chunked.n_variants(), chunked.n_samples()), (5, 3));
        assert_eq!(chunked.count_het(CountAxis::Samples).unwrap().len(), 3);
    }
}
