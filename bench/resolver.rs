//! Turns the run configuration into a ready genotype array for one iteration.
//!
//! Raw-source input converts the named VCF into the scratch directory first;
//! prebuilt-store input opens one named store or every store in the store
//! directory. Loading and array construction are timed, then the variant and
//! sample caps and any requested rechunking are applied.

use crate::config::{
    Configuration, DataDirectories, DatasetSelector, InputMode, RunConfiguration,
};
use crate::genotype::{self, ComputeCluster, GenotypeArray, GenotypeError};
use crate::profiler::BenchmarkProfiler;
use crate::shared::files::{is_store_dir, list_store_candidates, vcf_stem};
use crate::store::convert::{self, ConversionConfig, ConvertError};
use crate::store::{StoreError, open_store};
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub const LOAD_DATASET_OPERATION: &str = "Load Dataset";
pub const CREATE_ARRAY_OPERATION: &str = "Create Genotype Array";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("the \"*\" dataset wildcard cannot be combined with raw-source input")]
    WildcardWithRawSource,
    #[error("dataset {dataset} not found: expected a VCF file at {expected}")]
    MissingSource { dataset: String, expected: String },
    #[error("no genotype store at {path}")]
    MissingStore { path: String },
    #[error("no genotype stores found in {path}")]
    NoStoresFound { path: String },
    #[error("stores cannot be concatenated: {0}")]
    IncompatibleStores(String),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Genotype(#[from] GenotypeError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

pub struct DatasetResolver<'a> {
    run: &'a RunConfiguration,
    conversion: &'a ConversionConfig,
    directories: &'a DataDirectories,
}

impl<'a> DatasetResolver<'a> {
    pub fn new(config: &'a Configuration) -> Self {
        Self {
            run: &config.run,
            conversion: &config.conversion,
            directories: &config.directories,
        }
    }

    /// Produces the iteration's genotype array. `cluster` must be given for the
    /// distributed backend.
    pub fn resolve(
        &self,
        profiler: &mut BenchmarkProfiler,
        cluster: Option<&ComputeCluster>,
    ) -> Result<GenotypeArray, ResolveError> {
        let paths = match self.run.input {
            InputMode::RawSource => vec![self.convert_source(profiler)?],
            InputMode::PrebuiltStore => self.store_paths()?,
        };

        let stores = profiler.time(LOAD_DATASET_OPERATION, || {
            paths
                .iter()
                .map(|path| open_store(path).map(Arc::new))
                .collect::<Result<Vec<_>, StoreError>>()
        })?;
        genotype::check_compatible(&stores)
            .map_err(|e| ResolveError::IncompatibleStores(e.to_string()))?;

        let backend = self.run.backend;
        let mut array = profiler.time(CREATE_ARRAY_OPERATION, || {
            GenotypeArray::from_stores(backend, &stores, cluster)
        })?;
        info!(
            "Loaded {} variants × {} samples from {} store(s) into the {backend} backend",
            array.n_variants(),
            array.n_samples(),
            stores.len()
        );

        let n_variants = apply_cap("variant", self.run.variant_cap, array.n_variants());
        let n_samples = apply_cap("sample", self.run.sample_cap, array.n_samples());
        if n_variants < array.n_variants() || n_samples < array.n_samples() {
            array = array.truncate(n_variants, n_samples);
            debug!("Limited dataset to {n_variants} variants × {n_samples} samples");
        }

        let target = self.run.rechunk;
        if target.is_requested() {
            debug!(
                "Rechunking to {:?} variants × {:?} samples",
                target.variants, target.samples
            );
            array = array.rechunk(target);
        }
        Ok(array)
    }

    /// Converts the configured VCF into the scratch directory.
    fn convert_source(&self, profiler: &mut BenchmarkProfiler) -> Result<PathBuf, ResolveError> {
        let name = match &self.run.dataset {
            DatasetSelector::All => return Err(ResolveError::WildcardWithRawSource),
            DatasetSelector::Named(name) => name,
        };
        let source = self.directories.vcf.join(name);
        if !source.is_file() {
            return Err(ResolveError::MissingSource {
                dataset: name.clone(),
                expected: source.display().to_string(),
            });
        }

        let scratch = &self.directories.scratch;
        fs::create_dir_all(scratch).map_err(|source| ResolveError::Io {
            path: scratch.display().to_string(),
            source,
        })?;
        let destination = scratch.join(vcf_stem(name));
        convert::convert(&source, &destination, self.conversion, profiler)?;
        Ok(destination)
    }

    fn store_paths(&self) -> Result<Vec<PathBuf>, ResolveError> {
        let store_dir = &self.directories.store;
        match &self.run.dataset {
            DatasetSelector::All => {
                let no_stores = || ResolveError::NoStoresFound {
                    path: store_dir.display().to_string(),
                };
                let candidates = list_store_candidates(store_dir).map_err(|_| no_stores())?;
                let stores: Vec<PathBuf> = candidates
                    .into_iter()
                    .filter(|path| {
                        let valid = is_store_dir(path);
                        if !valid {
                            debug!("Skipping {}: not a genotype store", path.display());
                        }
                        valid
                    })
                    .collect();
                if stores.is_empty() {
                    return Err(no_stores());
                }
                info!("Concatenating {} stores from {}", stores.len(), store_dir.display());
                Ok(stores)
            }
            DatasetSelector::Named(name) => {
                let path = store_dir.join(name);
                if !is_store_dir(&path) {
                    return Err(ResolveError::MissingStore {
                        path: path.display().to_string(),
                    });
                }
                Ok(vec![path])
            }
        }
    }
}

/// Clamps a configured cap to what is available, warning when it does not fit.
fn apply_cap(axis: &str, cap: Option<usize>, available: usize) -> usize {
    match cap {
        Some(cap) if cap > available => {
            warn!(
                "Requested {cap} {axis}s but the dataset only has {available}; using all {available}"
            );
            available
        }
        Some(cap) => cap,
        None => available,
    }
}
