#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod profiler;
pub mod resolver;
pub mod runner;
pub mod sinks;

#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod shared {
    pub use super::shared_files as files;
}

#[path = "../genotype/mod.rs"]
pub mod genotype;

#[path = "../store/mod.rs"]
pub mod store;

#[path = "../pca/mod.rs"]
pub mod pca;

pub use config::{Configuration, RunConfiguration};
pub use profiler::{BenchmarkProfiler, ResultEntry};
pub use runner::{BenchmarkError, BenchmarkRunner};
