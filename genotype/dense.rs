//! Dense in-memory backend: the whole call matrix is loaded up front and every
//! operation runs eagerly on the calling thread.

use super::kernels::{self, AlleleCounts};
use super::{
    Backend, CountAxis, DosageOps, DosageRows, GenotypeError, GenotypeOps, Parallelism,
    RechunkTarget, Realize, check_indices, check_mask,
};
use crate::pca::fit::{self, PcaError, PcaFit, PcaMethod, PcaOptions};
use crate::store::StoreHandle;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView3, Axis, concatenate, s};
use std::sync::Arc;

pub struct DenseGenotypes {
    calls: Array3<i8>,
    max_allele: i8,
}

impl DenseGenotypes {
    pub fn new(calls: Array3<i8>) -> Self {
        let max_allele = kernels::max_allele(calls.view());
        Self { calls, max_allele }
    }

    /// Reads every store fully and stacks them along the variant axis.
    pub fn from_stores(stores: &[Arc<StoreHandle>]) -> Result<Self, GenotypeError> {
        let arrays = stores
            .iter()
            .map(|store| store.read_all())
            .collect::<Result<Vec<_>, _>>()?;
        let views: Vec<ArrayView3<'_, i8>> = arrays.iter().map(|a| a.view()).collect();
        let calls = concatenate(Axis(0), &views)
            .map_err(|e| GenotypeError::Incompatible(e.to_string()))?;
        let max_allele = stores
            .iter()
            .map(|s| s.metadata().max_allele)
            .max()
            .unwrap_or(-1);
        Ok(Self { calls, max_allele })
    }

    pub fn calls(&self) -> ArrayView3<'_, i8> {
        self.calls.view()
    }

    fn n_alleles(&self) -> usize {
        (self.max_allele as i32 + 1).max(1) as usize
    }
}

impl Realize for DenseGenotypes {
    type Pending<T: Send + 'static> = T;

    fn realize<T: Send + 'static>(&self, pending: T) -> T {
        pending
    }
}

impl GenotypeOps for DenseGenotypes {
    type Dosage = DenseDosage;

    const BACKEND: Backend = Backend::Dense;

    fn n_variants(&self) -> usize {
        self.calls.len_of(Axis(0))
    }

    fn n_samples(&self) -> usize {
        self.calls.len_of(Axis(1))
    }

    fn ploidy(&self) -> usize {
        self.calls.len_of(Axis(2))
    }

    fn count_alleles(&self) -> Result<AlleleCounts, GenotypeError> {
        Ok(AlleleCounts::new(kernels::count_alleles(
            self.calls.view(),
            self.n_alleles(),
        )))
    }

    fn count_het(&self, axis: CountAxis) -> Result<Array1<u32>, GenotypeError> {
        Ok(kernels::count_het(self.calls.view(), axis))
    }

    fn count_hom(&self, axis: CountAxis) -> Result<Array1<u32>, GenotypeError> {
        Ok(kernels::count_hom(self.calls.view(), axis))
    }

    fn select(&self, mask: &[bool]) -> Result<Self, GenotypeError> {
        check_mask(mask, self.n_variants())?;
        let rows: Vec<usize> = (0..mask.len()).filter(|&i| mask[i]).collect();
        Ok(Self {
            calls: self.calls.select(Axis(0), &rows),
            max_allele: self.max_allele,
        })
    }

    fn to_dosage(&self) -> Result<DenseDosage, GenotypeError> {
        Ok(DenseDosage {
            dosage: kernels::to_dosage(self.calls.view()),
            ploidy: self.ploidy(),
        })
    }

    fn variant_chunk(&self) -> Option<usize> {
        None
    }

    fn rechunk(self, _target: RechunkTarget) -> Self {
        self
    }

    fn truncate(self, variants: usize, samples: usize) -> Self {
        let variants = variants.min(self.n_variants());
        let samples = samples.min(self.n_samples());
        Self {
            calls: self.calls.slice(s![..variants, ..samples, ..]).to_owned(),
            max_allele: self.max_allele,
        }
    }
}

pub struct DenseDosage {
    dosage: Array2<u8>,
    ploidy: usize,
}

impl DenseDosage {
    pub fn new(dosage: Array2<u8>, ploidy: usize) -> Self {
        Self { dosage, ploidy }
    }
}

impl Realize for DenseDosage {
    type Pending<T: Send + 'static> = T;

    fn realize<T: Send + 'static>(&self, pending: T) -> T {
        pending
    }
}

impl DosageRows for DenseDosage {
    fn n_rows(&self) -> usize {
        self.dosage.nrows()
    }

    fn row(&self, index: usize) -> ArrayView1<'_, u8> {
        self.dosage.row(index)
    }
}

impl DosageOps for DenseDosage {
    fn n_variants(&self) -> usize {
        self.dosage.nrows()
    }

    fn n_samples(&self) -> usize {
        self.dosage.ncols()
    }

    fn take(&self, indices: &[usize]) -> Result<Self, GenotypeError> {
        check_indices(indices, self.n_variants())?;
        Ok(Self {
            dosage: self.dosage.select(Axis(0), indices),
            ploidy: self.ploidy,
        })
    }

    fn compress(self, mask: &[bool]) -> Result<Self, GenotypeError> {
        check_mask(mask, self.n_variants())?;
        let rows: Vec<usize> = (0..mask.len()).filter(|&i| mask[i]).collect();
        Ok(Self {
            dosage: self.dosage.select(Axis(0), &rows),
            ploidy: self.ploidy,
        })
    }

    fn ld_rows(&self) -> Option<&dyn DosageRows> {
        Some(self)
    }

    fn variant_chunk(&self) -> Option<usize> {
        None
    }

    fn rechunk_variants(self, _chunk: Option<usize>) -> Self {
        self
    }

    fn pca(&self, method: PcaMethod, options: &PcaOptions) -> Result<PcaFit, PcaError> {
        fit::fit(
            &[self.dosage.view()],
            self.ploidy,
            method,
            options,
            Parallelism::Sequential,
        )
    }
}
