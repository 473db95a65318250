//! Distributed backend.
//!
//! Operations build a task graph over variant blocks and sample tiles but run
//! nothing. The returned [`Deferred`] closure is executed on the cluster's worker
//! pool by [`Realize::realize`], where blocks (and tiles within a block) are
//! processed in parallel.

use super::blocks::{BlockLayout, DosageBlocks};
use super::kernels::{self, AlleleCounts};
use super::{
    Backend, CountAxis, DosageOps, DosageRows, GenotypeError, GenotypeOps, Parallelism,
    RechunkTarget, Realize, check_indices, check_mask,
};
use crate::pca::fit::{self, PcaError, PcaFit, PcaMethod, PcaOptions};
use crate::store::StoreHandle;
use log::info;
use ndarray::{Array1, Array2, Array3, ArrayView3, Axis, concatenate, s};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::Range;
use std::sync::Arc;

/// A task that has been described but not yet run.
pub type Deferred<T> = Box<dyn FnOnce() -> T + Send>;

/// A local pool of worker threads that executes deferred tasks.
#[derive(Clone, Debug)]
pub struct ComputeCluster {
    pool: Arc<ThreadPool>,
    workers: usize,
}

impl ComputeCluster {
    /// Starts `workers` threads; `0` means one per logical CPU.
    pub fn new(workers: usize) -> Result<Self, GenotypeError> {
        let workers = if workers == 0 {
            num_cpus::get()
        } else {
            workers
        };
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("genben-worker-{i}"))
            .build()
            .map_err(|e| GenotypeError::Cluster(e.to_string()))?;
        info!("Started compute cluster with {workers} workers");
        Ok(Self {
            pool: Arc::new(pool),
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn run<T: Send>(&self, task: impl FnOnce() -> T + Send) -> T {
        self.pool.install(task)
    }
}

pub struct DistributedGenotypes {
    layout: BlockLayout,
    cluster: ComputeCluster,
}

impl DistributedGenotypes {
    pub fn from_stores(stores: &[Arc<StoreHandle>], cluster: ComputeCluster) -> Self {
        Self {
            layout: BlockLayout::from_stores(stores),
            cluster,
        }
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    fn count_along(
        &self,
        axis: CountAxis,
        kernel: fn(ArrayView3<'_, i8>, CountAxis) -> Array1<u32>,
    ) -> Deferred<Result<Array1<u32>, GenotypeError>> {
        let layout = self.layout.clone();
        Box::new(move || -> Result<Array1<u32>, GenotypeError> {
            let tiles = layout.sample_tiles();
            let parts = layout.map_blocks(Parallelism::Pool, |_, calls| {
                let per_tile = over_tiles(calls, &tiles, |tile| kernel(tile, axis));
                match axis {
                    // each tile sees every variant of the block
                    CountAxis::Variants => per_tile
                        .into_iter()
                        .fold(Array1::<u32>::zeros(calls.len_of(Axis(0))), |acc, part| acc + part),
                    CountAxis::Samples => per_tile.iter().flat_map(|p| p.iter().copied()).collect(),
                }
            })?;
            Ok(kernels::combine_axis_counts(parts, axis, layout.n_samples()))
        })
    }
}

/// Applies `f` to every sample tile of one block in parallel.
fn over_tiles<T, F>(calls: ArrayView3<'_, i8>, tiles: &[Range<usize>], f: F) -> Vec<T>
where
    T: Send,
    F: Fn(ArrayView3<'_, i8>) -> T + Sync + Send,
{
    tiles
        .par_iter()
        .map(|tile| f(calls.slice(s![.., tile.clone(), ..])))
        .collect()
}

impl Realize for DistributedGenotypes {
    type Pending<T: Send + 'static> = Deferred<T>;

    fn realize<T: Send + 'static>(&self, pending: Deferred<T>) -> T {
        self.cluster.run(pending)
    }
}

impl GenotypeOps for DistributedGenotypes {
    type Dosage = DistributedDosage;

    const BACKEND: Backend = Backend::Distributed;

    fn n_variants(&self) -> usize {
        self.layout.n_variants()
    }

    fn n_samples(&self) -> usize {
        self.layout.n_samples()
    }

    fn ploidy(&self) -> usize {
        self.layout.ploidy()
    }

    fn count_alleles(&self) -> Deferred<Result<AlleleCounts, GenotypeError>> {
        let layout = self.layout.clone();
        Box::new(move || -> Result<AlleleCounts, GenotypeError> {
            let n_alleles = layout.n_alleles();
            let tiles = layout.sample_tiles();
            let parts = layout.map_blocks(Parallelism::Pool, |_, calls| {
                over_tiles(calls, &tiles, |tile| kernels::count_alleles(tile, n_alleles))
                    .into_iter()
                    .fold(
                        Array2::<u32>::zeros((calls.len_of(Axis(0)), n_alleles)),
                        |acc, part| acc + part,
                    )
            })?;
            Ok(AlleleCounts::stack(&parts, n_alleles))
        })
    }

    fn count_het(&self, axis: CountAxis) -> Deferred<Result<Array1<u32>, GenotypeError>> {
        self.count_along(axis, kernels::count_het)
    }

    fn count_hom(&self, axis: CountAxis) -> Deferred<Result<Array1<u32>, GenotypeError>> {
        self.count_along(axis, kernels::count_hom)
    }

    fn select(&self, mask: &[bool]) -> Deferred<Result<Self, GenotypeError>> {
        let layout = self.layout.clone();
        let cluster = self.cluster.clone();
        let mask = mask.to_vec();
        Box::new(move || -> Result<Self, GenotypeError> {
            check_mask(&mask, layout.n_variants())?;
            // the tiled graph selects rows by index
            let indices: Vec<usize> = mask
                .iter()
                .enumerate()
                .filter_map(|(i, &keep)| keep.then_some(i))
                .collect();
            let chunks = layout.map_blocks(Parallelism::Pool, |start, calls| {
                take_rows(start, calls, &indices)
            })?;
            Ok(Self {
                layout: BlockLayout::from_memory(chunks, &layout),
                cluster,
            })
        })
    }

    fn to_dosage(&self) -> Deferred<Result<DistributedDosage, GenotypeError>> {
        let layout = self.layout.clone();
        let cluster = self.cluster.clone();
        Box::new(move || -> Result<DistributedDosage, GenotypeError> {
            let tiles = layout.sample_tiles();
            let blocks = layout.map_blocks(Parallelism::Pool, |_, calls| {
                let per_tile = over_tiles(calls, &tiles, kernels::to_dosage);
                let views: Vec<_> = per_tile.iter().map(|d| d.view()).collect();
                concatenate(Axis(1), &views)
                    .unwrap_or_else(|_| Array2::zeros((calls.len_of(Axis(0)), 0)))
            })?;
            Ok(DistributedDosage {
                blocks: DosageBlocks::new(blocks, layout.n_samples(), layout.ploidy()),
                cluster,
            })
        })
    }

    fn variant_chunk(&self) -> Option<usize> {
        self.layout.variant_chunk()
    }

    fn rechunk(self, target: RechunkTarget) -> Self {
        Self {
            layout: self.layout.regroup(target.variants, target.samples),
            cluster: self.cluster,
        }
    }

    fn truncate(self, variants: usize, samples: usize) -> Self {
        Self {
            layout: self.layout.truncate(variants, samples),
            cluster: self.cluster,
        }
    }
}

pub struct DistributedDosage {
    blocks: DosageBlocks,
    cluster: ComputeCluster,
}

impl DistributedDosage {
    pub fn blocks(&self) -> &DosageBlocks {
        &self.blocks
    }
}

impl Realize for DistributedDosage {
    type Pending<T: Send + 'static> = Deferred<T>;

    fn realize<T: Send + 'static>(&self, pending: Deferred<T>) -> T {
        self.cluster.run(pending)
    }
}

impl DosageOps for DistributedDosage {
    fn n_variants(&self) -> usize {
        self.blocks.n_variants()
    }

    fn n_samples(&self) -> usize {
        self.blocks.n_samples()
    }

    fn take(&self, indices: &[usize]) -> Deferred<Result<Self, GenotypeError>> {
        let blocks = self.blocks.clone();
        let cluster = self.cluster.clone();
        let indices = indices.to_vec();
        Box::new(move || -> Result<Self, GenotypeError> {
            check_indices(&indices, blocks.n_variants())?;
            Ok(Self {
                blocks: blocks.take(&indices)?,
                cluster,
            })
        })
    }

    fn compress(self, mask: &[bool]) -> Result<Self, GenotypeError> {
        Ok(Self {
            blocks: self.blocks.compress(mask)?,
            cluster: self.cluster,
        })
    }

    fn ld_rows(&self) -> Option<&dyn DosageRows> {
        None
    }

    fn variant_chunk(&self) -> Option<usize> {
        self.blocks.variant_chunk()
    }

    fn rechunk_variants(self, chunk: Option<usize>) -> Self {
        Self {
            blocks: self.blocks.regroup(chunk),
            cluster: self.cluster,
        }
    }

    fn pca(&self, method: PcaMethod, options: &PcaOptions) -> Deferred<Result<PcaFit, PcaError>> {
        let blocks = self.blocks.clone();
        let options = options.clone();
        Box::new(move || {
            fit::fit(
                &blocks.views(),
                blocks.ploidy(),
                method,
                &options,
                Parallelism::Pool,
            )
        })
    }
}

/// Rows of `calls` (which starts at global row `start`) named by the sorted
/// global `indices`.
fn take_rows(start: usize, calls: ArrayView3<'_, i8>, indices: &[usize]) -> Array3<i8> {
    let end = start + calls.len_of(Axis(0));
    let lo = indices.partition_point(|&i| i < start);
    let hi = indices.partition_point(|&i| i < end);
    let local: Vec<usize> = indices[lo..hi].iter().map(|&i| i - start).collect();
    calls.select(Axis(0), &local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genotype::DenseGenotypes;
    use crate::pca::fit::Scaler;
    use crate::store::{StoreLayout, StoreWriter};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn calls() -> Array3<i8> {
        Array3::from_shape_fn((11, 7, 2), |(v, s, p)| {
            if (v + s) % 9 == 0 {
                -1
            } else {
                ((v * 5 + s * 3 + p * (s % 2)) % 5 % 3) as i8
            }
        })
    }

    fn distributed(dir: &std::path::Path, calls: &Array3<i8>) -> DistributedGenotypes {
        let mut writer = StoreWriter::create(
            &dir.join("distributed"),
            StoreLayout {
                samples: (0..7).map(|i| format!("S{i}")).collect(),
                ploidy: 2,
                chunk_length: 4,
                chunk_width: 3,
                alt_number: 2,
                compression_level: 1,
            },
        )
        .unwrap();
        for start in (0..11).step_by(4) {
            let end = (start + 4).min(11);
            writer.write_chunk(calls.slice(s![start..end, .., ..])).unwrap();
        }
        let store = Arc::new(writer.finish().unwrap());
        DistributedGenotypes::from_stores(&[store], ComputeCluster::new(2).unwrap())
    }

    #[test]
    fn zero_workers_means_every_cpu() {
        let cluster = ComputeCluster::new(0).unwrap();
        assert_eq!(cluster.workers(), num_cpus::get());
    }

    #[test]
    fn deferred_work_runs_only_when_realized() {
        let cluster = ComputeCluster::new(1).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let task: Deferred<usize> = Box::new(move || {
            flag.store(true, Ordering::SeqCst);
            rayon::current_num_threads()
        });
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(cluster.run(task), 1);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn tiled_counts_match_dense_counts() {
        let dir = tempfile::tempdir().unwrap();
        let calls = calls();
        let gt = distributed(dir.path(), &calls);
        let dense = DenseGenotypes::new(calls);

        assert_eq!(
            gt.realize(gt.count_alleles()).unwrap(),
            dense.count_alleles().unwrap()
        );
        for axis in [CountAxis::Variants, CountAxis::Samples] {
            assert_eq!(
                gt.realize(gt.count_het(axis)).unwrap(),
                dense.count_het(axis).unwrap()
            );
            assert_eq!(
                gt.realize(gt.count_hom(axis)).unwrap(),
                dense.count_hom(axis).unwrap()
            );
        }
    }

    #[test]
    fn dosage_pipeline_after_rechunk() {
        let dir = tempfile::tempdir().unwrap();
        let calls = calls();
        let gt = distributed(dir.path(), &calls).rechunk(RechunkTarget {
            variants: Some(5),
            samples: Some(2),
        });
        let dosage = gt.realize(gt.to_dosage()).unwrap();
        assert_eq!(dosage.variant_chunk(), Some(5));
        assert!(dosage.ld_rows().is_none());

        let expected = kernels::to_dosage(calls.view());
        assert_eq!(dosage.blocks().row(10), expected.row(10));

        let subset = dosage.realize(dosage.take(&[9, 0, 4])).unwrap();
        assert_eq!(subset.n_variants(), 3);
        assert_eq!(subset.blocks().row(0), expected.row(9));

        let single = subset.rechunk_variants(None);
        assert_eq!(single.variant_chunk(), None);
        let options = PcaOptions {
            n_components: 2,
            scaler: Scaler::Standard,
            iterated_power: 3,
            seed: Some(7),
        };
        let fit = single
            .realize(single.pca(PcaMethod::Conventional, &options))
            .unwrap();
        assert_eq!(fit.coords.nrows(), 7);
    }

    #[test]
    fn select_with_bad_mask_fails_on_realize() {
        let dir = tempfile::tempdir().unwrap();
        let gt = distributed(dir.path(), &calls());
        let pending = gt.select(&[true, false]);
        assert!(matches!(
            gt.realize(pending),
            Err(GenotypeError::MaskLength { mask: 2, variants: 11 })
        ));
    }
}
