//! Sliding-window linkage-disequilibrium pruning.

use crate::genotype::DosageRows;
use ndarray::ArrayView1;

/// Marks a subset of variants that are mutually unlinked within each window.
///
/// Windows of `size` variants start every `step` variants. Inside a window each
/// retained variant knocks out every later retained variant whose squared
/// correlation with it exceeds `threshold`. Rows with zero variance never exceed
/// the threshold and are kept.
pub fn locate_unlinked(rows: &dyn DosageRows, size: usize, step: usize, threshold: f64) -> Vec<bool> {
    let n = rows.n_rows();
    let mut keep = vec![true; n];
    let size = size.max(1);
    let step = step.max(1);

    for window_start in (0..n).step_by(step) {
        let window_stop = (window_start + size).min(n);
        for i in window_start..window_stop {
            if !keep[i] {
                continue;
            }
            let left = rows.row(i);
            for j in i + 1..window_stop {
                if keep[j] && r_squared(left, rows.row(j)) > threshold {
                    keep[j] = false;
                }
            }
        }
    }
    keep
}

fn r_squared(a: ArrayView1<'_, u8>, b: ArrayView1<'_, u8>) -> f64 {
    let n = a.len() as f64;
    if n == 0.0 {
        return f64::NAN;
    }
    let mean_a = a.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let mean_b = b.iter().map(|&v| f64::from(v)).sum::<f64>() / n;

    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let dx = f64::from(x) - mean_a;
        let dy = f64::from(y) - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    let r = cov / (var_a * var_b).sqrt();
    r * r
}
