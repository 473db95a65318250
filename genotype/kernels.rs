//! Counting and transform kernels over one block of genotype calls
//! (`variants × samples × ploidy`, negative = missing).

use super::CountAxis;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis, concatenate};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Zygosity {
    Missing,
    Homozygous,
    Heterozygous,
}

fn classify(call: ArrayView1<'_, i8>) -> Zygosity {
    let Some(&first) = call.first() else {
        return Zygosity::Missing;
    };
    if call.iter().any(|&a| a < 0) {
        Zygosity::Missing
    } else if call.iter().all(|&a| a == first) {
        Zygosity::Homozygous
    } else {
        Zygosity::Heterozygous
    }
}

/// Per-variant allele counts with `n_alleles` columns. Missing alleles and
/// alleles at or beyond `n_alleles` are not counted.
pub fn count_alleles(calls: ArrayView3<'_, i8>, n_alleles: usize) -> Array2<u32> {
    let mut counts = Array2::<u32>::zeros((calls.len_of(Axis(0)), n_alleles));
    for (mut row, variant) in counts.outer_iter_mut().zip(calls.outer_iter()) {
        for &allele in variant.iter() {
            if allele >= 0 && (allele as usize) < n_alleles {
                row[allele as usize] += 1;
            }
        }
    }
    counts
}

pub fn count_het(calls: ArrayView3<'_, i8>, axis: CountAxis) -> Array1<u32> {
    count_zygosity(calls, axis, Zygosity::Heterozygous)
}

pub fn count_hom(calls: ArrayView3<'_, i8>, axis: CountAxis) -> Array1<u32> {
    count_zygosity(calls, axis, Zygosity::Homozygous)
}

fn count_zygosity(calls: ArrayView3<'_, i8>, axis: CountAxis, target: Zygosity) -> Array1<u32> {
    let (n_variants, n_samples, _) = calls.dim();
    let len = match axis {
        CountAxis::Variants => n_variants,
        CountAxis::Samples => n_samples,
    };
    let mut out = Array1::<u32>::zeros(len);
    for (v, variant) in calls.outer_iter().enumerate() {
        for (s, call) in variant.outer_iter().enumerate() {
            if classify(call) == target {
                match axis {
                    CountAxis::Variants => out[v] += 1,
                    CountAxis::Samples => out[s] += 1,
                }
            }
        }
    }
    out
}

/// Number of non-reference alleles per call. Missing alleles contribute zero.
pub fn to_dosage(calls: ArrayView3<'_, i8>) -> Array2<u8> {
    let (n_variants, n_samples, _) = calls.dim();
    let mut dosage = Array2::<u8>::zeros((n_variants, n_samples));
    for (mut row, variant) in dosage.outer_iter_mut().zip(calls.outer_iter()) {
        for (value, call) in row.iter_mut().zip(variant.outer_iter()) {
            *value = call.iter().filter(|&&a| a > 0).count() as u8;
        }
    }
    dosage
}

/// Highest allele index present, `-1` when every call is missing.
pub fn max_allele(calls: ArrayView3<'_, i8>) -> i8 {
    calls.iter().copied().max().unwrap_or(-1).max(-1)
}

/// Joins per-block results computed along `axis`: per-variant counts are
/// concatenated, per-sample counts are summed.
pub fn combine_axis_counts(
    parts: Vec<Array1<u32>>,
    axis: CountAxis,
    n_samples: usize,
) -> Array1<u32> {
    match axis {
        CountAxis::Variants => parts.iter().flat_map(|p| p.iter().copied()).collect(),
        CountAxis::Samples => parts
            .into_iter()
            .fold(Array1::zeros(n_samples), |acc, part| acc + part),
    }
}

/// Allele counts for a set of variants (`variants × alleles`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlleleCounts {
    counts: Array2<u32>,
}

impl AlleleCounts {
    pub fn new(counts: Array2<u32>) -> Self {
        Self { counts }
    }

    /// Stacks per-block counts that share the same allele width.
    pub fn stack(blocks: &[Array2<u32>], n_alleles: usize) -> Self {
        let views: Vec<ArrayView2<'_, u32>> = blocks.iter().map(|b| b.view()).collect();
        let counts = concatenate(Axis(0), &views)
            .unwrap_or_else(|_| Array2::zeros((0, n_alleles)));
        Self { counts }
    }

    pub fn counts(&self) -> ArrayView2<'_, u32> {
        self.counts.view()
    }

    pub fn n_variants(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_alleles(&self) -> usize {
        self.counts.ncols()
    }

    /// Highest allele index with a nonzero count per variant, `-1` if none.
    pub fn max_allele(&self) -> Array1<i32> {
        self.counts
            .outer_iter()
            .map(|row| {
                row.iter()
                    .rposition(|&c| c > 0)
                    .map_or(-1, |i| i as i32)
            })
            .collect()
    }

    pub fn count_multiallelic(&self) -> usize {
        self.max_allele().iter().filter(|&&m| m > 1).count()
    }

    /// Biallelic variants whose alternate allele is seen exactly once.
    pub fn count_biallelic_singletons(&self) -> usize {
        if self.n_alleles() < 2 {
            return 0;
        }
        self.max_allele()
            .iter()
            .zip(self.counts.column(1))
            .filter(|&(&m, &alt)| m == 1 && alt == 1)
            .count()
    }

    /// Biallelic variants where neither allele is a singleton.
    pub fn biallelic_filter(&self) -> Vec<bool> {
        if self.n_alleles() < 2 {
            return vec![false; self.n_variants()];
        }
        self.max_allele()
            .iter()
            .zip(self.counts.outer_iter())
            .map(|(&m, row)| m == 1 && row[0].min(row[1]) > 1)
            .collect()
    }
}
