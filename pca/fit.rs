// ========================================================================================
//
//                     Conventional and randomized PCA kernels
//
// ========================================================================================
//
// Both kernels work on a dosage matrix held as variant blocks (`rows × samples`,
// u8) and return per-sample coordinates. Each block is scaled per variant, then
// the blocks only ever meet through sums of small `samples × samples` or
// `samples × l` products, so the same code serves every backend: eager backends
// reduce the blocks in order, the distributed backend reduces them on its pool.

use crate::genotype::Parallelism;
use faer::diag::DiagRef;
use faer::{Mat, MatRef, Side};
use log::warn;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Eigenvalues at or below this are treated as numerical noise.
const EIGENVALUE_EPSILON: f64 = 1e-9;
/// Per-variant scale factors below this leave the centred row unscaled.
const SCALE_FLOOR: f64 = 1e-12;
/// Extra random directions sampled beyond the requested components.
const OVERSAMPLES: usize = 10;

#[derive(Debug, Error)]
pub enum PcaError {
    #[error("PCA needs at least one variant and two samples, got {variants} × {samples}")]
    TooSmall { variants: usize, samples: usize },
    #[error("eigendecomposition failed: {0}")]
    Eigen(String),
}

/// Per-variant transform applied to dosages before decomposition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scaler {
    /// Centre only.
    None,
    /// Centre and divide by the standard deviation.
    Standard,
    /// Centre and divide by `sqrt(p(1 - p))` with `p` the alternate allele frequency.
    Patterson,
}

impl fmt::Display for Scaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scaler::None => "none",
            Scaler::Standard => "standard",
            Scaler::Patterson => "patterson",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcaMethod {
    Conventional,
    Randomized,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PcaOptions {
    pub n_components: usize,
    pub scaler: Scaler,
    /// Power iterations for the randomized kernel.
    pub iterated_power: usize,
    pub seed: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct PcaFit {
    /// `samples × components`
    pub coords: Array2<f64>,
    pub explained_variance: Array1<f64>,
    pub explained_variance_ratio: Array1<f64>,
}

impl PcaFit {
    pub fn n_components(&self) -> usize {
        self.coords.ncols()
    }
}

/// Fits `method` to the dosage blocks of a `ploidy`-ploid genotype matrix.
pub fn fit(
    blocks: &[ArrayView2<'_, u8>],
    ploidy: usize,
    method: PcaMethod,
    options: &PcaOptions,
    parallelism: Parallelism,
) -> Result<PcaFit, PcaError> {
    let n_samples = blocks.first().map_or(0, |b| b.ncols());
    let n_variants: usize = blocks.iter().map(|b| b.nrows()).sum();
    if n_variants == 0 || n_samples < 2 {
        return Err(PcaError::TooSmall {
            variants: n_variants,
            samples: n_samples,
        });
    }

    let max_components = n_samples.min(n_variants);
    let n_components = if options.n_components > max_components {
        warn!(
            "Requested {} components but the data supports at most {max_components}; using {max_components}",
            options.n_components
        );
        max_components
    } else {
        options.n_components.max(1)
    };

    let scaled = map_blocks(blocks, parallelism, |block| {
        scale_block(block, options.scaler, ploidy)
    });
    let total_variance =
        map_blocks(&scaled, parallelism, |x| x.iter().map(|v| v * v).sum::<f64>())
            .into_iter()
            .sum::<f64>()
            / n_samples as f64;

    let (coords, eigenvalues) = match method {
        PcaMethod::Conventional => conventional(&scaled, n_samples, n_components, parallelism)?,
        PcaMethod::Randomized => {
            randomized(&scaled, n_samples, n_components, options, parallelism)?
        }
    };

    let explained_variance = eigenvalues.mapv(|l| l / n_samples as f64);
    let explained_variance_ratio = if total_variance > 0.0 {
        explained_variance.mapv(|v| v / total_variance)
    } else {
        Array1::zeros(explained_variance.len())
    };

    Ok(PcaFit {
        coords,
        explained_variance,
        explained_variance_ratio,
    })
}

/// Runs `f` over every block, in order or on the current pool.
fn map_blocks<B, T, F>(blocks: &[B], parallelism: Parallelism, f: F) -> Vec<T>
where
    B: Sync,
    T: Send,
    F: Fn(&B) -> T + Sync + Send,
{
    match parallelism {
        Parallelism::Sequential => blocks.iter().map(f).collect(),
        Parallelism::Pool => blocks.par_iter().map(f).collect(),
    }
}

fn sum_matrices(parts: Vec<Array2<f64>>, rows: usize, cols: usize) -> Array2<f64> {
    parts
        .into_iter()
        .fold(Array2::zeros((rows, cols)), |acc, part| acc + part)
}

pub fn scale_block(block: &ArrayView2<'_, u8>, scaler: Scaler, ploidy: usize) -> Array2<f64> {
    let mut x = block.mapv(f64::from);
    let n = x.ncols() as f64;
    for mut row in x.axis_iter_mut(Axis(0)) {
        let mean = row.sum() / n;
        let scale = match scaler {
            Scaler::None => 1.0,
            Scaler::Standard => (row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt(),
            Scaler::Patterson => {
                let p = mean / ploidy.max(1) as f64;
                (p * (1.0 - p)).sqrt()
            }
        };
        let scale = if scale > SCALE_FLOOR { scale } else { 1.0 };
        row.mapv_inplace(|v| (v - mean) / scale);
    }
    x
}

/// Eigen-decomposes the `samples × samples` Gram matrix.
fn conventional(
    scaled: &[Array2<f64>],
    n_samples: usize,
    n_components: usize,
    parallelism: Parallelism,
) -> Result<(Array2<f64>, Array1<f64>), PcaError> {
    let gram = sum_matrices(
        map_blocks(scaled, parallelism, |x| x.t().dot(x)),
        n_samples,
        n_samples,
    );
    let (values, vectors) = symmetric_eigen(&gram)?;
    Ok(project(&vectors, &values, n_components))
}

/// Halko-style randomized range finder over the sample space.
fn randomized(
    scaled: &[Array2<f64>],
    n_samples: usize,
    n_components: usize,
    options: &PcaOptions,
    parallelism: Parallelism,
) -> Result<(Array2<f64>, Array1<f64>), PcaError> {
    let n_variants: usize = scaled.iter().map(|x| x.nrows()).sum();
    let width = (n_components + OVERSAMPLES).min(n_samples).min(n_variants);

    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let omegas: Vec<Array2<f64>> = scaled
        .iter()
        .map(|x| Array2::from_shape_simple_fn((x.nrows(), width), || StandardNormal.sample(&mut rng)))
        .collect();

    let pairs: Vec<(&Array2<f64>, &Array2<f64>)> = scaled.iter().zip(&omegas).collect();
    let sketch = sum_matrices(
        map_blocks(&pairs, parallelism, |(x, omega)| x.t().dot(*omega)),
        n_samples,
        width,
    );
    let mut basis = orthonormalize(&sketch)?;

    for _ in 0..options.iterated_power {
        let cols = basis.ncols();
        let next = sum_matrices(
            map_blocks(scaled, parallelism, |x| x.t().dot(&x.dot(&basis))),
            n_samples,
            cols,
        );
        basis = orthonormalize(&next)?;
    }

    let cols = basis.ncols();
    let small = sum_matrices(
        map_blocks(scaled, parallelism, |x| {
            let z = x.dot(&basis);
            z.t().dot(&z)
        }),
        cols,
        cols,
    );
    let (values, vectors) = symmetric_eigen(&small)?;
    let left = basis.dot(&vectors);
    Ok(project(&left, &values, n_components))
}

/// Orthonormal basis for the column space of `y`, dropping null directions.
/// The second pass restores orthogonality lost to the squared condition number.
fn orthonormalize(y: &Array2<f64>) -> Result<Array2<f64>, PcaError> {
    let once = orthonormalize_once(y)?;
    orthonormalize_once(&once)
}

fn orthonormalize_once(y: &Array2<f64>) -> Result<Array2<f64>, PcaError> {
    let (values, vectors) = symmetric_eigen(&y.t().dot(y))?;
    let threshold = values.first().copied().unwrap_or(0.0) * EIGENVALUE_EPSILON;
    let keep: Vec<usize> = (0..values.len())
        .filter(|&i| values[i] > threshold.max(EIGENVALUE_EPSILON))
        .collect();

    let mut q = Array2::zeros((y.nrows(), keep.len()));
    for (out, &i) in keep.iter().enumerate() {
        let column = y.dot(&vectors.column(i)) / values[i].sqrt();
        q.column_mut(out).assign(&column);
    }
    Ok(q)
}

/// Coordinates `U · sqrt(Λ)` for the leading components with positive eigenvalues.
fn project(
    vectors: &Array2<f64>,
    values: &Array1<f64>,
    n_components: usize,
) -> (Array2<f64>, Array1<f64>) {
    let k = n_components.min(values.len());
    let mut coords = Array2::zeros((vectors.nrows(), k));
    let mut kept = Array1::zeros(k);
    for c in 0..k {
        let value = values[c].max(0.0);
        kept[c] = value;
        coords
            .column_mut(c)
            .assign(&vectors.column(c).mapv(|u| u * value.sqrt()));
    }
    (coords, kept)
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

/// Eigenpairs of a symmetric matrix, sorted by descending eigenvalue.
fn symmetric_eigen(matrix: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>), PcaError> {
    let n = matrix.nrows();
    if n == 0 {
        return Ok((Array1::zeros(0), Array2::zeros((0, 0))));
    }
    let mat = Mat::<f64>::from_fn(n, n, |i, j| matrix[[i, j]]);
    let eig = mat
        .self_adjoint_eigen(Side::Lower)
        .map_err(|err| PcaError::Eigen(format!("{err:?}")))?;
    let values = diag_to_array(eig.S());
    let vectors = mat_to_array(eig.U());

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(Ordering::Equal));

    let sorted_values = order.iter().map(|&i| values[i]).collect();
    let sorted_vectors = vectors.select(Axis(1), &order);
    Ok((sorted_values, sorted_vectors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array, s};

    fn options(n_components: usize, scaler: Scaler) -> PcaOptions {
        PcaOptions {
            n_components,
            scaler,
            iterated_power: 3,
            seed: Some(42),
        }
    }

    // 6 variants × 5 samples with one dominant axis separating samples 0-1 from 3-4.
    fn dosage() -> Array2<u8> {
        array![
            [0, 0, 1, 2, 2],
            [0, 1, 1, 2, 2],
            [0, 0, 1, 1, 2],
            [2, 2, 1, 0, 0],
            [1, 0, 1, 0, 1],
            [0, 1, 0, 1, 0],
        ]
    }

    #[test]
    fn patterson_scaling_centres_each_variant() {
        let x = scale_block(&dosage().view(), Scaler::Patterson, 2);
        for row in x.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-12);
        }
        // mean 1.0, p = 0.5, scale 0.5
        assert_abs_diff_eq!(x[[0, 0]], -2.0, epsilon = 1e-12);
    }

    #[test]
    fn constant_variant_is_left_at_zero() {
        let block = array![[1u8, 1, 1]];
        let x = scale_block(&block.view(), Scaler::Standard, 2);
        assert_eq!(x, array![[0.0, 0.0, 0.0]]);
    }

    #[test]
    fn conventional_ratios_sum_to_one_with_full_rank() {
        let data = dosage();
        let fit = fit(
            &[data.view()],
            2,
            PcaMethod::Conventional,
            &options(4, Scaler::None),
            Parallelism::Sequential,
        )
        .unwrap();
        assert_eq!(fit.coords.dim(), (5, 4));
        assert_abs_diff_eq!(fit.explained_variance_ratio.sum(), 1.0, epsilon = 1e-9);
        assert!(fit.explained_variance[0] >= fit.explained_variance[1]);
        // first axis separates the two groups
        assert!(fit.coords[[0, 0]] * fit.coords[[4, 0]] < 0.0);
    }

    #[test]
    fn blocked_input_matches_single_block() {
        let data = dosage();
        let whole = fit(
            &[data.view()],
            2,
            PcaMethod::Conventional,
            &options(2, Scaler::Patterson),
            Parallelism::Sequential,
        )
        .unwrap();
        let split = fit(
            &[data.slice(s![..2, ..]), data.slice(s![2.., ..])],
            2,
            PcaMethod::Conventional,
            &options(2, Scaler::Patterson),
            Parallelism::Pool,
        )
        .unwrap();
        for (a, b) in whole
            .explained_variance
            .iter()
            .zip(split.explained_variance.iter())
        {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
        for c in 0..2 {
            for i in 0..5 {
                assert_abs_diff_eq!(
                    whole.coords[[i, c]].abs(),
                    split.coords[[i, c]].abs(),
                    epsilon = 1e-9
                );
            }
        }
    }

    #[test]
    fn randomized_recovers_leading_variance() {
        let data = dosage();
        let exact = fit(
            &[data.view()],
            2,
            PcaMethod::Conventional,
            &options(2, Scaler::Standard),
            Parallelism::Sequential,
        )
        .unwrap();
        let approx = fit(
            &[data.slice(s![..3, ..]), data.slice(s![3.., ..])],
            2,
            PcaMethod::Randomized,
            &options(2, Scaler::Standard),
            Parallelism::Sequential,
        )
        .unwrap();
        // the sketch spans the whole sample space here, so the result is exact
        for c in 0..2 {
            assert_abs_diff_eq!(
                exact.explained_variance[c],
                approx.explained_variance[c],
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn oversized_component_request_is_clamped() {
        let data = dosage();
        let fit = fit(
            &[data.view()],
            2,
            PcaMethod::Randomized,
            &options(50, Scaler::None),
            Parallelism::Sequential,
        )
        .unwrap();
        assert!(fit.n_components() <= 5);
    }

    #[test]
    fn empty_input_is_rejected() {
        let data = Array2::<u8>::zeros((0, 4));
        assert!(matches!(
            fit(
                &[data.view()],
                2,
                PcaMethod::Conventional,
                &options(2, Scaler::None),
                Parallelism::Sequential
            ),
            Err(PcaError::TooSmall { variants: 0, .. })
        ));
    }
}
