// ========================================================================================
//
//                                  Configuration
//
// ========================================================================================
//
// The TOML file is deserialized into `Raw*` mirrors of its sections, then validated
// once into the immutable value objects the rest of the crate consumes. Every
// usage error is reported here, before a run starts.

use crate::genotype::{Backend, RechunkTarget};
use crate::pca::fit::Scaler;
use crate::store::convert::{AltNumber, ConversionConfig};
use log::{info, warn};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Contents of the configuration written by `genben config`.
pub const DEFAULT_CONFIG: &str = include_str!("../config/genben.default.toml");

/// Dataset name that selects every store in the store directory.
pub const DATASET_WILDCARD: &str = "*";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: String, message: String },
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.into(),
    }
}

// ========================================================================================
//                                  Value objects
// ========================================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum InputMode {
    /// Convert the dataset's VCF into the scratch directory every iteration.
    #[serde(rename = "raw-source", alias = "vcf")]
    RawSource,
    /// Load stores prepared ahead of time.
    #[serde(rename = "prebuilt-store", alias = "zarr", alias = "store")]
    PrebuiltStore,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatasetSelector {
    Named(String),
    /// Every store in the store directory, concatenated.
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubsetSize {
    All,
    Count(usize),
}

/// What the PCA pipeline does when the variant filter keeps nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyFilterPolicy {
    /// Warn and continue with the unfiltered array.
    Fallback,
    Abort,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LdPruningConfig {
    pub enabled: bool,
    pub window: usize,
    pub step: usize,
    pub threshold: f64,
    pub iterations: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PcaConfig {
    pub n_components: usize,
    pub scaler: Scaler,
    pub subset: SubsetSize,
    pub ld_pruning: LdPruningConfig,
    pub empty_filter: EmptyFilterPolicy,
    pub seed: Option<u64>,
}

/// Everything that shapes one benchmark run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfiguration {
    pub iterations: u32,
    pub input: InputMode,
    pub dataset: DatasetSelector,
    pub variant_cap: Option<usize>,
    pub sample_cap: Option<usize>,
    pub run_aggregations: bool,
    pub run_pca: bool,
    pub backend: Backend,
    pub rechunk: RechunkTarget,
    pub pca: PcaConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfluxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub benchmark_group: String,
    pub device_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputConfig {
    pub csv_enabled: bool,
    pub delimiter: u8,
    pub directory: PathBuf,
    /// `Some` when the time-series sink is enabled.
    pub influxdb: Option<InfluxConfig>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterConfig {
    /// `0` sizes the pool to the number of logical CPUs.
    pub workers: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataDirectories {
    pub vcf: PathBuf,
    pub store: PathBuf,
    /// Per-iteration conversion output, wiped before every iteration.
    pub scratch: PathBuf,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Configuration {
    pub run: RunConfiguration,
    pub conversion: ConversionConfig,
    pub output: OutputConfig,
    pub cluster: ClusterConfig,
    pub directories: DataDirectories,
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        raw.validate()
    }
}

/// Writes the default configuration to `path`. Returns `false` without touching
/// an existing file unless `overwrite` is set.
pub fn generate_default_config(path: &Path, overwrite: bool) -> Result<bool, ConfigError> {
    let io_error = |source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    };
    if path.exists() && !overwrite {
        warn!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
        return Ok(false);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    fs::write(path, DEFAULT_CONFIG).map_err(io_error)?;
    info!("Wrote default configuration to {}", path.display());
    Ok(true)
}

// ========================================================================================
//                                  Raw file layout
// ========================================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawConfig {
    benchmark: RawBenchmark,
    pca: RawPca,
    conversion: RawConversion,
    output: RawOutput,
    cluster: RawCluster,
    directories: RawDirectories,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawBenchmark {
    iterations: i64,
    input: InputMode,
    dataset: String,
    variants: Option<i64>,
    samples: Option<i64>,
    aggregations: bool,
    pca: bool,
    backend: Backend,
    chunk_variants: Option<i64>,
    chunk_samples: Option<i64>,
}

impl Default for RawBenchmark {
    fn default() -> Self {
        Self {
            iterations: 5,
            input: InputMode::RawSource,
            dataset: String::new(),
            variants: None,
            samples: None,
            aggregations: false,
            pca: false,
            backend: Backend::Dense,
            chunk_variants: None,
            chunk_samples: None,
        }
    }
}

/// A keyword such as `"all"` or `"auto"`, or a count.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCountOrKeyword {
    Count(i64),
    Keyword(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawPca {
    components: i64,
    scaler: Scaler,
    subset: RawCountOrKeyword,
    ld_prune: bool,
    ld_window: i64,
    ld_step: i64,
    ld_threshold: f64,
    ld_iterations: i64,
    empty_filter: EmptyFilterPolicy,
    seed: Option<u64>,
}

impl Default for RawPca {
    fn default() -> Self {
        Self {
            components: 10,
            scaler: Scaler::Patterson,
            subset: RawCountOrKeyword::Keyword("all".to_string()),
            ld_prune: false,
            ld_window: 100,
            ld_step: 20,
            ld_threshold: 0.1,
            ld_iterations: 1,
            empty_filter: EmptyFilterPolicy::Fallback,
            seed: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawConversion {
    alt_number: RawCountOrKeyword,
    chunk_length: i64,
    chunk_width: i64,
    compression_level: i64,
}

impl Default for RawConversion {
    fn default() -> Self {
        let defaults = ConversionConfig::default();
        Self {
            alt_number: RawCountOrKeyword::Keyword("auto".to_string()),
            chunk_length: defaults.chunk_length as i64,
            chunk_width: defaults.chunk_width as i64,
            compression_level: i64::from(defaults.compression_level),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawOutput {
    csv: bool,
    delimiter: String,
    directory: PathBuf,
    influxdb: RawInflux,
}

impl Default for RawOutput {
    fn default() -> Self {
        Self {
            csv: true,
            delimiter: "|".to_string(),
            directory: PathBuf::from("./results/"),
            influxdb: RawInflux::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawInflux {
    enabled: bool,
    host: String,
    port: i64,
    username: String,
    password: String,
    database: String,
    benchmark_group: String,
    device_name: String,
}

impl Default for RawInflux {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 8086,
            username: String::new(),
            password: String::new(),
            database: "genben".to_string(),
            benchmark_group: String::new(),
            device_name: String::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawCluster {
    workers: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawDirectories {
    vcf: PathBuf,
    store: PathBuf,
    scratch: PathBuf,
}

impl Default for RawDirectories {
    fn default() -> Self {
        Self {
            vcf: PathBuf::from("./data/vcf/"),
            store: PathBuf::from("./data/store/"),
            scratch: PathBuf::from("./data/store_benchmark/"),
        }
    }
}

// ========================================================================================
//                                    Validation
// ========================================================================================

/// A count that must be at least `min`.
fn at_least(key: &str, value: i64, min: i64) -> Result<usize, ConfigError> {
    if value < min {
        return Err(invalid(key, format!("must be at least {min}, got {value}")));
    }
    usize::try_from(value).map_err(|_| invalid(key, format!("{value} is out of range")))
}

/// A limit where `-1` or an absent key means "no limit".
fn optional_limit(key: &str, value: Option<i64>) -> Result<Option<usize>, ConfigError> {
    match value {
        None | Some(-1) => Ok(None),
        Some(v) => at_least(key, v, 1).map(Some),
    }
}

impl RawConfig {
    fn validate(self) -> Result<Configuration, ConfigError> {
        let pca = self.pca.validate()?;
        Ok(Configuration {
            run: self.benchmark.validate(pca)?,
            conversion: self.conversion.validate()?,
            output: self.output.validate()?,
            cluster: ClusterConfig {
                workers: at_least("cluster.workers", self.cluster.workers, 0)?,
            },
            directories: DataDirectories {
                vcf: self.directories.vcf,
                store: self.directories.store,
                scratch: self.directories.scratch,
            },
        })
    }
}

impl RawBenchmark {
    fn validate(self, pca: PcaConfig) -> Result<RunConfiguration, ConfigError> {
        let iterations = at_least("benchmark.iterations", self.iterations, 1)?;
        let iterations = u32::try_from(iterations)
            .map_err(|_| invalid("benchmark.iterations", "too many iterations"))?;

        let dataset = match self.dataset.trim() {
            "" => return Err(invalid("benchmark.dataset", "a dataset name is required")),
            DATASET_WILDCARD => DatasetSelector::All,
            name => DatasetSelector::Named(name.to_string()),
        };
        if dataset == DatasetSelector::All && self.input == InputMode::RawSource {
            return Err(invalid(
                "benchmark.dataset",
                "the \"*\" wildcard only works with prebuilt-store input; conversion needs one source file",
            ));
        }

        Ok(RunConfiguration {
            iterations,
            input: self.input,
            dataset,
            variant_cap: optional_limit("benchmark.variants", self.variants)?,
            sample_cap: optional_limit("benchmark.samples", self.samples)?,
            run_aggregations: self.aggregations,
            run_pca: self.pca,
            backend: self.backend,
            rechunk: RechunkTarget {
                variants: optional_limit("benchmark.chunk_variants", self.chunk_variants)?,
                samples: optional_limit("benchmark.chunk_samples", self.chunk_samples)?,
            },
            pca,
        })
    }
}

impl RawPca {
    fn validate(self) -> Result<PcaConfig, ConfigError> {
        let subset = match self.subset {
            RawCountOrKeyword::Keyword(k) if k.eq_ignore_ascii_case("all") => SubsetSize::All,
            RawCountOrKeyword::Keyword(k) => {
                return Err(invalid("pca.subset", format!("expected \"all\" or a count, got {k:?}")));
            }
            RawCountOrKeyword::Count(n) => SubsetSize::Count(at_least("pca.subset", n, 1)?),
        };
        if !(self.ld_threshold > 0.0 && self.ld_threshold <= 1.0) {
            return Err(invalid(
                "pca.ld_threshold",
                format!("must be in (0, 1], got {}", self.ld_threshold),
            ));
        }
        Ok(PcaConfig {
            n_components: at_least("pca.components", self.components, 1)?,
            scaler: self.scaler,
            subset,
            ld_pruning: LdPruningConfig {
                enabled: self.ld_prune,
                window: at_least("pca.ld_window", self.ld_window, 2)?,
                step: at_least("pca.ld_step", self.ld_step, 1)?,
                threshold: self.ld_threshold,
                iterations: at_least("pca.ld_iterations", self.ld_iterations, 1)?,
            },
            empty_filter: self.empty_filter,
            seed: self.seed,
        })
    }
}

impl RawConversion {
    fn validate(self) -> Result<ConversionConfig, ConfigError> {
        let alt_number = match self.alt_number {
            RawCountOrKeyword::Keyword(k) if k.eq_ignore_ascii_case("auto") => AltNumber::Auto,
            RawCountOrKeyword::Keyword(k) => {
                return Err(invalid(
                    "conversion.alt_number",
                    format!("expected \"auto\" or a count, got {k:?}"),
                ));
            }
            RawCountOrKeyword::Count(n) => {
                AltNumber::Fixed(at_least("conversion.alt_number", n, 1)?)
            }
        };
        let compression_level = self.compression_level;
        if !(0..=9).contains(&compression_level) {
            return Err(invalid(
                "conversion.compression_level",
                format!("must be between 0 and 9, got {compression_level}"),
            ));
        }
        Ok(ConversionConfig {
            alt_number,
            chunk_length: at_least("conversion.chunk_length", self.chunk_length, 1)?,
            chunk_width: at_least("conversion.chunk_width", self.chunk_width, 1)?,
            compression_level: compression_level as u32,
        })
    }
}

impl RawOutput {
    fn validate(self) -> Result<OutputConfig, ConfigError> {
        let delimiter = match self.delimiter.as_bytes() {
            [byte] if byte.is_ascii() => *byte,
            _ => {
                return Err(invalid(
                    "output.delimiter",
                    format!("must be a single ASCII character, got {:?}", self.delimiter),
                ));
            }
        };
        let influxdb = if self.influxdb.enabled {
            let raw = self.influxdb;
            let port = u16::try_from(raw.port)
                .ok()
                .filter(|&p| p != 0)
                .ok_or_else(|| invalid("output.influxdb.port", format!("{} is not a valid port", raw.port)))?;
            if raw.host.is_empty() {
                return Err(invalid("output.influxdb.host", "a host is required"));
            }
            if raw.database.is_empty() {
                return Err(invalid("output.influxdb.database", "a database is required"));
            }
            Some(InfluxConfig {
                host: raw.host,
                port,
                username: raw.username,
                password: raw.password,
                database: raw.database,
                benchmark_group: raw.benchmark_group,
                device_name: raw.device_name,
            })
        } else {
            None
        };
        Ok(OutputConfig {
            csv_enabled: self.csv,
            delimiter,
            directory: self.directory,
            influxdb,
        })
    }
}
