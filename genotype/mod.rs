//! The genotype-array capability surface and its three backends.
//!
//! Every backend answers the same questions (allele counts, per-axis genotype
//! counts, row selection, dosage transform, rechunking) through [`GenotypeOps`].
//! What differs is *when* the work happens: the dense and chunked backends compute
//! eagerly, while the distributed backend hands back a deferred task that only runs
//! on its compute pool when [`Realize::realize`] is called. Benchmark code therefore
//! always pairs an operation with `realize` inside the timed region.

pub mod blocks;
pub mod chunked;
pub mod dense;
pub mod distributed;
pub mod kernels;

pub use chunked::{ChunkedDosage, ChunkedGenotypes};
pub use dense::{DenseDosage, DenseGenotypes};
pub use distributed::{ComputeCluster, DistributedDosage, DistributedGenotypes};
pub use kernels::AlleleCounts;

use crate::pca::fit::{PcaError, PcaFit, PcaMethod, PcaOptions};
use crate::store::{StoreError, StoreHandle};
use ndarray::{Array1, ArrayView1};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenotypeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("selection mask has {mask} entries but the array holds {variants} variants")]
    MaskLength { mask: usize, variants: usize },
    #[error("variant index {index} is out of range for {variants} variants")]
    IndexOutOfRange { index: usize, variants: usize },
    #[error("cannot combine stores: {0}")]
    Incompatible(String),
    #[error("the distributed backend needs a compute cluster")]
    NoCluster,
    #[error("failed to start compute cluster: {0}")]
    Cluster(String),
}

/// Execution strategy behind a [`GenotypeArray`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[serde(alias = "normal")]
    Dense,
    Chunked,
    #[serde(alias = "dask")]
    Distributed,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Dense => "dense",
            Backend::Chunked => "chunked",
            Backend::Distributed => "distributed",
        };
        f.write_str(name)
    }
}

/// Which axis a genotype count is reported along.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountAxis {
    /// One count per variant, summed over samples.
    Variants,
    /// One count per sample, summed over variants.
    Samples,
}

/// How block-wise work is scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parallelism {
    Sequential,
    /// Fan block work out on the current rayon pool.
    Pool,
}

/// Requested chunk geometry. `None` keeps the current extent on that axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RechunkTarget {
    pub variants: Option<usize>,
    pub samples: Option<usize>,
}

impl RechunkTarget {
    pub fn is_requested(&self) -> bool {
        self.variants.is_some() || self.samples.is_some()
    }
}

/// Materializes a backend's possibly-deferred results.
pub trait Realize {
    type Pending<T: Send + 'static>;

    /// Blocks until `pending` has been computed. Identity for eager backends.
    fn realize<T: Send + 'static>(&self, pending: Self::Pending<T>) -> T;
}

pub trait GenotypeOps: Realize + Sized + Send + 'static {
    type Dosage: DosageOps;

    const BACKEND: Backend;

    fn n_variants(&self) -> usize;
    fn n_samples(&self) -> usize;
    fn ploidy(&self) -> usize;

    /// Stored variant chunk length, `None` for unchunked arrays.
    fn variant_chunk(&self) -> Option<usize>;

    fn count_alleles(&self) -> Self::Pending<Result<AlleleCounts, GenotypeError>>;
    fn count_het(&self, axis: CountAxis) -> Self::Pending<Result<Array1<u32>, GenotypeError>>;
    fn count_hom(&self, axis: CountAxis) -> Self::Pending<Result<Array1<u32>, GenotypeError>>;

    /// Keeps the variants whose mask entry is `true`, in order.
    fn select(&self, mask: &[bool]) -> Self::Pending<Result<Self, GenotypeError>>;

    fn to_dosage(&self) -> Self::Pending<Result<Self::Dosage, GenotypeError>>;

    fn rechunk(self, target: RechunkTarget) -> Self;

    /// Keeps the first `variants` variants and the first `samples` samples.
    fn truncate(self, variants: usize, samples: usize) -> Self;
}

/// Row access to a dosage matrix, as needed by LD pruning.
pub trait DosageRows {
    fn n_rows(&self) -> usize;
    fn row(&self, index: usize) -> ArrayView1<'_, u8>;
}

/// Alternate-allele dosage matrix (variants × samples) in backend form.
pub trait DosageOps: Realize + Sized + Send + 'static {
    fn n_variants(&self) -> usize;
    fn n_samples(&self) -> usize;

    /// Keeps the listed variant rows, in the given order.
    fn take(&self, indices: &[usize]) -> Self::Pending<Result<Self, GenotypeError>>;

    /// Keeps the rows whose mask entry is `true`.
    fn compress(self, mask: &[bool]) -> Result<Self, GenotypeError>;

    /// Row view for LD pruning; `None` when the backend cannot provide one.
    fn ld_rows(&self) -> Option<&dyn DosageRows>;

    /// Current variant chunk length, `None` when unchunked.
    fn variant_chunk(&self) -> Option<usize>;

    /// Regroups rows into blocks of `chunk` variants, or one block for `None`.
    fn rechunk_variants(self, chunk: Option<usize>) -> Self;

    fn pca(
        &self,
        method: PcaMethod,
        options: &PcaOptions,
    ) -> Self::Pending<Result<PcaFit, PcaError>>;
}

pub(crate) fn check_mask(mask: &[bool], variants: usize) -> Result<(), GenotypeError> {
    if mask.len() == variants {
        Ok(())
    } else {
        Err(GenotypeError::MaskLength {
            mask: mask.len(),
            variants,
        })
    }
}

pub(crate) fn check_indices(indices: &[usize], variants: usize) -> Result<(), GenotypeError> {
    match indices.iter().find(|&&i| i >= variants) {
        Some(&index) => Err(GenotypeError::IndexOutOfRange { index, variants }),
        None => Ok(()),
    }
}

/// A genotype array bound to one concrete backend.
pub enum GenotypeArray {
    Dense(DenseGenotypes),
    Chunked(ChunkedGenotypes),
    Distributed(DistributedGenotypes),
}

impl GenotypeArray {
    /// Builds the backend's view of one or more stores, concatenated along the
    /// variant axis in the given order.
    pub fn from_stores(
        backend: Backend,
        stores: &[Arc<StoreHandle>],
        cluster: Option<&ComputeCluster>,
    ) -> Result<Self, GenotypeError> {
        check_compatible(stores)?;
        Ok(match backend {
            Backend::Dense => GenotypeArray::Dense(DenseGenotypes::from_stores(stores)?),
            Backend::Chunked => GenotypeArray::Chunked(ChunkedGenotypes::from_stores(stores)),
            Backend::Distributed => {
                let cluster = cluster.ok_or(GenotypeError::NoCluster)?;
                GenotypeArray::Distributed(DistributedGenotypes::from_stores(
                    stores,
                    cluster.clone(),
                ))
            }
        })
    }

    pub fn backend(&self) -> Backend {
        match self {
            GenotypeArray::Dense(_) => Backend::Dense,
            GenotypeArray::Chunked(_) => Backend::Chunked,
            GenotypeArray::Distributed(_) => Backend::Distributed,
        }
    }

    pub fn n_variants(&self) -> usize {
        match self {
            GenotypeArray::Dense(g) => g.n_variants(),
            GenotypeArray::Chunked(g) => g.n_variants(),
            GenotypeArray::Distributed(g) => g.n_variants(),
        }
    }

    pub fn n_samples(&self) -> usize {
        match self {
            GenotypeArray::Dense(g) => g.n_samples(),
            GenotypeArray::Chunked(g) => g.n_samples(),
            GenotypeArray::Distributed(g) => g.n_samples(),
        }
    }

    pub fn truncate(self, variants: usize, samples: usize) -> Self {
        match self {
            GenotypeArray::Dense(g) => GenotypeArray::Dense(g.truncate(variants, samples)),
            GenotypeArray::Chunked(g) => GenotypeArray::Chunked(g.truncate(variants, samples)),
            GenotypeArray::Distributed(g) => {
                GenotypeArray::Distributed(g.truncate(variants, samples))
            }
        }
    }

    pub fn rechunk(self, target: RechunkTarget) -> Self {
        match self {
            GenotypeArray::Dense(g) => GenotypeArray::Dense(g.rechunk(target)),
            GenotypeArray::Chunked(g) => GenotypeArray::Chunked(g.rechunk(target)),
            GenotypeArray::Distributed(g) => GenotypeArray::Distributed(g.rechunk(target)),
        }
    }
}

pub fn check_compatible(stores: &[Arc<StoreHandle>]) -> Result<(), GenotypeError> {
    let Some(first) = stores.first() else {
        return Err(GenotypeError::Incompatible("no stores given".to_string()));
    };
    for other in &stores[1..] {
        if other.n_samples() != first.n_samples() || other.ploidy() != first.ploidy() {
            return Err(GenotypeError::Incompatible(format!(
                "{} has {} samples × ploidy {} but {} has {} × {}",
                first.path().display(),
                first.n_samples(),
                first.ploidy(),
                other.path().display(),
                other.n_samples(),
                other.ploidy()
            )));
        }
    }
    Ok(())
}
