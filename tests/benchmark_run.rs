use std::fs;
use std::path::{Path, PathBuf};

use genben::config::{ConfigError, Configuration};
use genben::pca::LD_PRUNING;
use genben::profiler::BenchmarkProfiler;
use genben::resolver::{CREATE_ARRAY_OPERATION, DatasetResolver, LOAD_DATASET_OPERATION};
use genben::runner::{AGGREGATION_OPERATIONS, BenchmarkRunner, RunnerState};
use genben::sinks::{CSV_HEADER, MemorySink};
use genben::store::convert::{ConversionConfig, setup_stores};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

const VARIANTS: usize = 48;
const SAMPLES: usize = 14;

/// Biallelic diploid calls with per-variant allele frequencies between 0.2 and 0.8.
fn write_synthetic_vcf(path: &Path, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut text = String::from(
        "##fileformat=VCFv4.2\n##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
         #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT",
    );
    for sample in 0..SAMPLES {
        text.push_str(&format!("\tS{sample}"));
    }
    text.push('\n');
    for variant in 0..VARIANTS {
        let frequency: f64 = rng.gen_range(0.2..0.8);
        let calls: Vec<String> = (0..SAMPLES)
            .map(|_| {
                let a = u8::from(rng.gen_bool(frequency));
                let b = u8::from(rng.gen_bool(frequency));
                format!("{a}/{b}")
            })
            .collect();
        text.push_str(&format!(
            "1\t{}\t.\tA\tG\t.\tPASS\t.\tGT\t{}\n",
            1000 + variant * 17,
            calls.join("\t")
        ));
    }
    fs::write(path, text).expect("write vcf");
}

struct Workspace {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Workspace {
    /// A VCF directory with `cohort.vcf` and its prebuilt store.
    fn new() -> Self {
        let dir = tempdir().expect("temporary directory");
        let root = dir.path().to_path_buf();
        let vcf = root.join("vcf");
        fs::create_dir_all(&vcf).expect("vcf directory");
        write_synthetic_vcf(&vcf.join("cohort.vcf"), 7);
        let options = ConversionConfig {
            chunk_length: 10,
            chunk_width: 4,
            ..ConversionConfig::default()
        };
        let created = setup_stores(&vcf, &root.join("store"), &options).expect("setup stores");
        assert_eq!(created.len(), 1);
        Self { _dir: dir, root }
    }

    fn config(&self, benchmark: &str, pca: &str, output: &str) -> Configuration {
        let text = format!(
            "[benchmark]\n{benchmark}\n[pca]\n{pca}\n[output]\n{output}\n[cluster]\nworkers = 2\n\
             [directories]\nvcf = {vcf:?}\nstore = {store:?}\nscratch = {scratch:?}\n",
            vcf = self.root.join("vcf").display().to_string(),
            store = self.root.join("store").display().to_string(),
            scratch = self.root.join("scratch").display().to_string(),
        );
        Configuration::from_toml_str(&text).expect("valid configuration")
    }
}

fn run_in_memory(config: Configuration) -> (Vec<String>, RunnerState) {
    let sink = MemorySink::default();
    let profiler = BenchmarkProfiler::new(vec![Box::new(sink.clone())]);
    let mut runner = BenchmarkRunner::with_profiler(config, "integration", profiler);
    runner.run().expect("benchmark run");
    (sink.operation_names(), runner.state())
}

#[test]
fn aggregations_are_recorded_in_order_on_every_backend() {
    let workspace = Workspace::new();
    for backend in ["dense", "chunked", "distributed"] {
        let config = workspace.config(
            &format!(
                "iterations = 1\ninput = \"prebuilt-store\"\ndataset = \"cohort\"\n\
                 aggregations = true\nbackend = \"{backend}\"\nchunk_variants = 16"
            ),
            "",
            "csv = false",
        );
        let (names, state) = run_in_memory(config);
        assert_eq!(state, RunnerState::Done);

        let mut expected = vec![LOAD_DATASET_OPERATION, CREATE_ARRAY_OPERATION];
        expected.extend(AGGREGATION_OPERATIONS);
        assert_eq!(names, expected, "backend {backend}");
    }
}

#[test]
fn pca_pipeline_skips_ld_pruning_only_on_the_distributed_backend() {
    let workspace = Workspace::new();
    for (backend, expected_steps) in [("dense", 9), ("chunked", 9), ("distributed", 8)] {
        let config = workspace.config(
            &format!(
                "iterations = 1\ninput = \"prebuilt-store\"\ndataset = \"*\"\n\
                 pca = true\nbackend = \"{backend}\""
            ),
            "components = 3\nsubset = 30\nld_prune = true\nld_window = 10\nld_step = 5\n\
             ld_threshold = 0.5\nseed = 5",
            "csv = false",
        );
        let (names, _) = run_in_memory(config);
        let pca_steps: Vec<&String> = names.iter().filter(|n| n.starts_with("PCA: ")).collect();
        assert_eq!(pca_steps.len(), expected_steps, "backend {backend}");
        assert_eq!(
            pca_steps.iter().any(|n| n.as_str() == LD_PRUNING),
            expected_steps == 9
        );
        assert_eq!(
            pca_steps.last().map(|n| n.as_str()),
            Some("PCA: Run randomized PCA analysis (scaler: patterson)")
        );
    }
}

#[test]
fn raw_source_input_converts_before_loading() {
    let workspace = Workspace::new();
    let config = workspace.config(
        "iterations = 2\ninput = \"raw-source\"\ndataset = \"cohort.vcf\"\naggregations = true",
        "",
        "csv = false",
    );
    let (names, _) = run_in_memory(config);
    assert_eq!(names.len(), 2 * (4 + AGGREGATION_OPERATIONS.len()));
    let loads = names
        .iter()
        .filter(|n| n.as_str() == LOAD_DATASET_OPERATION)
        .count();
    assert_eq!(loads, 2);
    assert!(workspace.root.join("scratch").join("cohort").exists());
}

#[test]
fn wildcard_dataset_is_rejected_for_raw_source_input() {
    let text = "[benchmark]\ninput = \"raw-source\"\ndataset = \"*\"\n";
    match Configuration::from_toml_str(text) {
        Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, "benchmark.dataset"),
        other => panic!("expected a configuration error, got {other:?}"),
    }
}

#[test]
fn caps_larger_than_the_dataset_keep_everything() {
    let workspace = Workspace::new();
    let config = workspace.config(
        "input = \"prebuilt-store\"\ndataset = \"cohort\"\nvariants = 1000\nsamples = 500",
        "",
        "csv = false",
    );
    let mut profiler = BenchmarkProfiler::new(Vec::new());
    let array = DatasetResolver::new(&config)
        .resolve(&mut profiler, None)
        .expect("resolve");
    assert_eq!(array.n_variants(), VARIANTS);
    assert_eq!(array.n_samples(), SAMPLES);
}

#[test]
fn delimited_results_have_a_header_and_one_row_per_entry() {
    let workspace = Workspace::new();
    let results = workspace.root.join("results");
    let config = workspace.config(
        "iterations = 2\ninput = \"prebuilt-store\"\ndataset = \"cohort\"\naggregations = true",
        "",
        &format!(
            "csv = true\ndelimiter = \"|\"\ndirectory = {:?}",
            results.display().to_string()
        ),
    );
    let mut runner = BenchmarkRunner::new(config, "csv_check").expect("runner");
    let summary = runner.run().expect("benchmark run");
    assert_eq!(summary.operations_recorded, 2 * (2 + AGGREGATION_OPERATIONS.len()));

    let contents = fs::read_to_string(results.join("csv_check.psv")).expect("results file");
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), summary.operations_recorded + 1);
    assert_eq!(lines[0], CSV_HEADER.join("|"));
    for line in &lines[1..] {
        let fields: Vec<&str> = line.split('|').collect();
        assert_eq!(fields.len(), 4, "row {line}");
        assert!(fields[1] == "1" || fields[1] == "2");
        assert!(fields[3].parse::<f64>().expect("exec time") >= 0.0);
    }
}
