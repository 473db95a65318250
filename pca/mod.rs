//! The benchmarked PCA pipeline.
//!
//! Every step below is its own timed operation and the operation names are the
//! keys result consumers search for, so they must not change:
//!
//! 1. count alleles
//! 2. count multiallelic variants (diagnostic)
//! 3. count biallelic singletons (diagnostic)
//! 4. drop singletons and multiallelic variants
//! 5. transform to dosage
//! 6. subset variants
//! 7. LD pruning (skipped on backends without row access)
//! 8. conventional PCA
//! 9. randomized PCA

pub mod fit;
pub mod ld;

use crate::config::{EmptyFilterPolicy, LdPruningConfig, PcaConfig, SubsetSize};
use crate::genotype::{AlleleCounts, Backend, DosageOps, GenotypeError, GenotypeOps};
use crate::profiler::BenchmarkProfiler;
use fit::{PcaError, PcaFit, PcaMethod, PcaOptions, Scaler};
use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;

pub const COUNT_ALLELES: &str = "PCA: Count alleles";
pub const COUNT_MULTIALLELIC: &str = "PCA: Count multiallelic SNPs";
pub const COUNT_SINGLETONS: &str = "PCA: Count biallelic singletons";
pub const FILTER_VARIANTS: &str = "PCA: Remove singletons and multiallelic SNPs";
pub const TRANSFORM_DOSAGE: &str = "PCA: Transform genotype data for PCA";
pub const SUBSET_VARIANTS: &str = "PCA: Subset variants";
pub const LD_PRUNING: &str = "PCA: Apply LD pruning";

/// Power iterations used by the randomized solver.
const RANDOMIZED_POWER_ITERATIONS: usize = 3;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Genotype(#[from] GenotypeError),
    #[error(transparent)]
    Pca(#[from] PcaError),
    #[error("removing singletons and multiallelic variants left no variants")]
    FilterEmptied,
}

pub fn conventional_operation(scaler: Scaler) -> String {
    format!("PCA: Run conventional PCA analysis (scaler: {scaler})")
}

pub fn randomized_operation(scaler: Scaler) -> String {
    format!("PCA: Run randomized PCA analysis (scaler: {scaler})")
}

/// Both decompositions from one pipeline pass.
#[derive(Clone, Debug)]
pub struct PcaOutcome {
    pub conventional: PcaFit,
    pub randomized: PcaFit,
    /// Variants that entered the decompositions.
    pub n_variants: usize,
    /// Variant chunk length the randomized decomposition ran on.
    pub randomized_variant_chunk: Option<usize>,
}

pub fn run_pca_pipeline<G: GenotypeOps>(
    genotypes: &G,
    config: &PcaConfig,
    profiler: &mut BenchmarkProfiler,
) -> Result<PcaOutcome, PipelineError> {
    // restored before randomized PCA on the distributed backend
    let original_chunk = genotypes.variant_chunk();

    let allele_counts = profiler.measure::<G, AlleleCounts, GenotypeError>(
        COUNT_ALLELES,
        genotypes,
        |g| g.count_alleles(),
    )?;

    let multiallelic = profiler.time(COUNT_MULTIALLELIC, || {
        Ok::<_, PipelineError>(allele_counts.count_multiallelic())
    })?;
    debug!("{multiallelic} multiallelic variants");

    let singletons = profiler.time(COUNT_SINGLETONS, || {
        Ok::<_, PipelineError>(allele_counts.count_biallelic_singletons())
    })?;
    debug!("{singletons} biallelic singletons");

    let filtered = profiler.time(FILTER_VARIANTS, || -> Result<Option<G>, PipelineError> {
        let mask = allele_counts.biallelic_filter();
        if !mask.iter().any(|&keep| keep) {
            return match config.empty_filter {
                EmptyFilterPolicy::Fallback => {
                    warn!(
                        "Filtering singletons and multiallelic variants removed all {} variants; continuing with the unfiltered data",
                        mask.len()
                    );
                    Ok(None)
                }
                EmptyFilterPolicy::Abort => Err(PipelineError::FilterEmptied),
            };
        }
        Ok(Some(
            genotypes.realize::<Result<G, GenotypeError>>(genotypes.select(&mask))?,
        ))
    })?;
    let source = filtered.as_ref().unwrap_or(genotypes);

    let dosage = profiler.measure::<G, G::Dosage, GenotypeError>(
        TRANSFORM_DOSAGE,
        source,
        |g| g.to_dosage(),
    )?;

    let mut dosage = profiler.time(SUBSET_VARIANTS, || subset_variants(dosage, config))?;

    if config.ld_pruning.enabled {
        if dosage.ld_rows().is_some() {
            dosage = profiler.time(LD_PRUNING, || ld_prune(dosage, &config.ld_pruning))?;
        } else {
            warn!(
                "LD pruning is not supported on the {} backend; skipping",
                G::BACKEND
            );
        }
    }

    let options = PcaOptions {
        n_components: config.n_components,
        scaler: config.scaler,
        iterated_power: RANDOMIZED_POWER_ITERATIONS,
        seed: config.seed,
    };
    let distributed = G::BACKEND == Backend::Distributed;

    // conventional PCA wants every variant in one block
    if distributed {
        dosage = dosage.rechunk_variants(None);
    }
    let conventional = profiler.measure::<G::Dosage, PcaFit, PcaError>(
        &conventional_operation(config.scaler),
        &dosage,
        |d| d.pca(PcaMethod::Conventional, &options),
    )?;

    if distributed {
        dosage = dosage.rechunk_variants(original_chunk);
    }
    let randomized = profiler.measure::<G::Dosage, PcaFit, PcaError>(
        &randomized_operation(config.scaler),
        &dosage,
        |d| d.pca(PcaMethod::Randomized, &options),
    )?;

    info!(
        "PCA on {} variants × {} samples, leading explained variance ratio {:.4}",
        dosage.n_variants(),
        dosage.n_samples(),
        conventional
            .explained_variance_ratio
            .first()
            .copied()
            .unwrap_or(0.0)
    );

    Ok(PcaOutcome {
        conventional,
        randomized,
        n_variants: dosage.n_variants(),
        randomized_variant_chunk: dosage.variant_chunk(),
    })
}

/// Uniform random subset of variant rows, kept in ascending order.
fn subset_variants<D: DosageOps>(dosage: D, config: &PcaConfig) -> Result<D, PipelineError> {
    let available = dosage.n_variants();
    let size = match config.subset {
        SubsetSize::All => return Ok(dosage),
        SubsetSize::Count(size) => size,
    };
    if size >= available {
        if size > available {
            warn!(
                "Requested a subset of {size} variants but only {available} are available; using all of them"
            );
        }
        return Ok(dosage);
    }

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut indices = rand::seq::index::sample(&mut rng, available, size).into_vec();
    indices.sort_unstable();
    Ok(dosage.realize::<Result<D, GenotypeError>>(dosage.take(&indices))?)
}

fn ld_prune<D: DosageOps>(mut dosage: D, ld: &LdPruningConfig) -> Result<D, PipelineError> {
    for round in 1..=ld.iterations {
        let Some(rows) = dosage.ld_rows() else {
            break;
        };
        let keep = ld::locate_unlinked(rows, ld.window, ld.step, ld.threshold);
        let retained = keep.iter().filter(|&&k| k).count();
        info!(
            "LD pruning round {round}: retained {retained}, removed {}",
            keep.len() - retained
        );
        dosage = dosage.compress(&keep)?;
    }
    Ok(dosage)
}
