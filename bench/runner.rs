// ========================================================================================
//
//                                 Benchmark runner
//
// ========================================================================================
//
// Drives the configured number of iterations. Each iteration wipes the scratch
// directory, tags the profiler with the iteration number, resolves a fresh genotype
// array and runs the enabled operation groups against it. Any error ends the whole
// run; nothing half-measured is ever recorded.

use crate::config::Configuration;
use crate::genotype::{
    AlleleCounts, Backend, ComputeCluster, CountAxis, GenotypeArray, GenotypeError, GenotypeOps,
};
use crate::pca::{PipelineError, run_pca_pipeline};
use crate::profiler::BenchmarkProfiler;
use crate::resolver::{DatasetResolver, ResolveError};
use crate::shared::files::remove_directory_tree;
use crate::sinks::{SinkError, build_sinks};
use log::{debug, info};
use ndarray::Array1;
use std::io;
use thiserror::Error;

pub const ALLELE_COUNT_OPERATION: &str = "Allele Count (All Samples)";
pub const HET_PER_VARIANT_OPERATION: &str = "Genotype Count: Heterozygous per Variant";
pub const HOM_PER_VARIANT_OPERATION: &str = "Genotype Count: Homozygous per Variant";
pub const HET_PER_SAMPLE_OPERATION: &str = "Genotype Count: Heterozygous per Sample";
pub const HOM_PER_SAMPLE_OPERATION: &str = "Genotype Count: Homozygous per Sample";

/// The aggregation operations in the order they run.
pub const AGGREGATION_OPERATIONS: [&str; 5] = [
    ALLELE_COUNT_OPERATION,
    HET_PER_VARIANT_OPERATION,
    HOM_PER_VARIANT_OPERATION,
    HET_PER_SAMPLE_OPERATION,
    HOM_PER_SAMPLE_OPERATION,
];

#[derive(Debug, Error)]
pub enum BenchmarkError {
    #[error("failed to open result sink: {0}")]
    Sink(#[from] SinkError),
    #[error("failed to resolve dataset: {0}")]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Genotype(#[from] GenotypeError),
    #[error("PCA pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("failed to clear scratch directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Preparing,
    Resolving,
    RunningOperations,
    Recorded,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u32,
    pub operations_recorded: usize,
}

pub struct BenchmarkRunner {
    config: Configuration,
    label: String,
    profiler: BenchmarkProfiler,
    cluster: Option<ComputeCluster>,
    state: RunnerState,
}

impl BenchmarkRunner {
    /// Opens the sinks enabled in the output configuration under `label`.
    pub fn new(config: Configuration, label: &str) -> Result<Self, BenchmarkError> {
        let sinks = build_sinks(&config.output, label)?;
        Ok(Self::with_profiler(config, label, BenchmarkProfiler::new(sinks)))
    }

    pub fn with_profiler(config: Configuration, label: &str, profiler: BenchmarkProfiler) -> Self {
        Self {
            config,
            label: label.to_string(),
            profiler,
            cluster: None,
            state: RunnerState::Idle,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn profiler(&self) -> &BenchmarkProfiler {
        &self.profiler
    }

    fn transition(&mut self, next: RunnerState) {
        debug!("Runner state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub fn run(&mut self) -> Result<RunSummary, BenchmarkError> {
        let iterations = self.config.run.iterations;
        info!(
            "Starting benchmark '{}': {iterations} iteration(s) on the {} backend",
            self.label, self.config.run.backend
        );

        if self.config.run.backend == Backend::Distributed && self.cluster.is_none() {
            self.cluster = Some(ComputeCluster::new(self.config.cluster.workers)?);
        }

        for iteration in 1..=iterations {
            self.transition(RunnerState::Preparing);
            let scratch = &self.config.directories.scratch;
            remove_directory_tree(scratch).map_err(|source| BenchmarkError::Io {
                path: scratch.display().to_string(),
                source,
            })?;
            self.profiler.set_run_number(iteration);
            info!("Iteration {iteration}/{iterations}");

            self.transition(RunnerState::Resolving);
            let array = DatasetResolver::new(&self.config)
                .resolve(&mut self.profiler, self.cluster.as_ref())?;

            self.transition(RunnerState::RunningOperations);
            match &array {
                GenotypeArray::Dense(genotypes) => self.run_operations(genotypes)?,
                GenotypeArray::Chunked(genotypes) => self.run_operations(genotypes)?,
                GenotypeArray::Distributed(genotypes) => self.run_operations(genotypes)?,
            }
            self.transition(RunnerState::Recorded);
        }

        self.transition(RunnerState::Done);
        let summary = RunSummary {
            iterations,
            operations_recorded: self.profiler.recorded(),
        };
        info!(
            "Benchmark '{}' finished: {} operations recorded",
            self.label, summary.operations_recorded
        );
        Ok(summary)
    }

    fn run_operations<G: GenotypeOps>(&mut self, genotypes: &G) -> Result<(), BenchmarkError> {
        if self.config.run.run_aggregations {
            run_aggregations(genotypes, &mut self.profiler)?;
        }
        if self.config.run.run_pca {
            let outcome = run_pca_pipeline(genotypes, &self.config.run.pca, &mut self.profiler)?;
            debug!(
                "PCA produced {} conventional and {} randomized components",
                outcome.conventional.n_components(),
                outcome.randomized.n_components()
            );
        }
        Ok(())
    }
}

/// Times the five aggregation operations, in order.
pub fn run_aggregations<G: GenotypeOps>(
    genotypes: &G,
    profiler: &mut BenchmarkProfiler,
) -> Result<(), GenotypeError> {
    profiler.measure::<G, AlleleCounts, GenotypeError>(ALLELE_COUNT_OPERATION, genotypes, |g| {
        g.count_alleles()
    })?;
    for (name, axis, heterozygous) in [
        (HET_PER_VARIANT_OPERATION, CountAxis::Variants, true),
        (HOM_PER_VARIANT_OPERATION, CountAxis::Variants, false),
        (HET_PER_SAMPLE_OPERATION, CountAxis::Samples, true),
        (HOM_PER_SAMPLE_OPERATION, CountAxis::Samples, false),
    ] {
        profiler.measure::<G, Array1<u32>, GenotypeError>(name, genotypes, |g| {
            if heterozygous {
                g.count_het(axis)
            } else {
                g.count_hom(axis)
            }
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::MemorySink;
    use crate::store::{StoreLayout, StoreWriter};
    use ndarray::{Array3, s};
    use std::path::Path;

    fn write_store(path: &Path) {
        let calls = Array3::from_shape_fn((12, 8, 2), |(v, s, p)| i8::from((v + 2 * s + p) % 4 == 0));
        let mut writer = StoreWriter::create(
            path,
            StoreLayout {
                samples: (0..8).map(|i| format!("S{i}")).collect(),
                ploidy: 2,
                chunk_length: 5,
                chunk_width: 4,
                alt_number: 1,
                compression_level: 1,
            },
        )
        .unwrap();
        for start in (0..12).step_by(5) {
            let end = (start + 5).min(12);
            writer.write_chunk(calls.slice(s![start..end, .., ..])).unwrap();
        }
        writer.finish().unwrap();
    }

    fn runner(root: &Path, benchmark: &str) -> (BenchmarkRunner, MemorySink) {
        write_store(&root.join("store").join("toy"));
        let text = format!(
            "[benchmark]\ninput = \"prebuilt-store\"\ndataset = \"toy\"\npca = false\n{benchmark}\n\
             [output]\ncsv = false\n\
             [directories]\nstore = {store:?}\nscratch = {scratch:?}\n",
            store = root.join("store").display().to_string(),
            scratch = root.join("scratch").display().to_string(),
        );
        let config = Configuration::from_toml_str(&text).unwrap();
        let sink = MemorySink::default();
        let profiler = BenchmarkProfiler::new(vec![Box::new(sink.clone())]);
        (BenchmarkRunner::with_profiler(config, "unit", profiler), sink)
    }

    #[test]
    fn aggregations_run_in_order_for_every_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, sink) = runner(dir.path(), "iterations = 2\naggregations = true");
        assert_eq!(runner.state(), RunnerState::Idle);

        let summary = runner.run().unwrap();
        assert_eq!(runner.state(), RunnerState::Done);
        assert_eq!(summary.iterations, 2);
        // load + create + five aggregations per iteration
        assert_eq!(summary.operations_recorded, 14);

        let entries = sink.entries();
        let aggregations: Vec<(u32, &str)> = entries
            .iter()
            .filter(|e| AGGREGATION_OPERATIONS.contains(&e.operation_name.as_str()))
            .map(|e| (e.run_number, e.operation_name.as_str()))
            .collect();
        let expected: Vec<(u32, &str)> = [1, 2]
            .into_iter()
            .flat_map(|run| AGGREGATION_OPERATIONS.iter().map(move |&name| (run, name)))
            .collect();
        assert_eq!(aggregations, expected);
    }

    #[test]
    fn scratch_directory_is_wiped_before_each_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let leftover = dir.path().join("scratch").join("old");
        std::fs::create_dir_all(&leftover).unwrap();
        let (mut runner, _) = runner(dir.path(), "iterations = 1");
        runner.run().unwrap();
        assert!(!leftover.exists());
    }

    #[test]
    fn resolution_failure_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, sink) = runner(dir.path(), "");
        runner.config.run.dataset = crate::config::DatasetSelector::Named("missing".into());
        assert!(matches!(
            runner.run(),
            Err(BenchmarkError::Resolve(ResolveError::MissingStore { .. }))
        ));
        assert_eq!(runner.state(), RunnerState::Resolving);
        assert!(sink.entries().is_empty());
    }
}
