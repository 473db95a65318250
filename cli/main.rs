#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::info;
use std::path::PathBuf;
use std::process;

use genben::config::{Configuration, generate_default_config};
use genben::runner::BenchmarkRunner;
use genben::store::convert::setup_stores;

#[derive(Parser)]
#[command(
    name = "genben",
    about = "Benchmark harness for genomic variant processing backends",
    long_about = "Converts VCF files into chunked genotype stores and times allele counting, \
                 genotype counting and a PCA pipeline across dense, chunked and distributed \
                 array backends."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration file
    #[command(about = "Write a default configuration file")]
    Config(ConfigArgs),
    /// Convert every VCF in the configured directory into a genotype store
    #[command(about = "Convert raw VCF files into genotype stores")]
    Setup(ConfigFileArgs),
    /// Run the benchmark described by a configuration file
    #[command(about = "Execute a benchmark run")]
    Exec(ExecArgs),
    /// Print version information
    Version,
}

#[derive(Args)]
struct ConfigArgs {
    /// Where to write the configuration
    #[arg(long = "output-config", value_name = "PATH")]
    output_config: PathBuf,

    /// Overwrite an existing file
    #[arg(short, long)]
    force: bool,
}

#[derive(Args)]
struct ConfigFileArgs {
    #[arg(long = "config-file", value_name = "PATH")]
    config_file: PathBuf,
}

#[derive(Args)]
struct ExecArgs {
    #[arg(long = "config-file", value_name = "PATH")]
    config_file: PathBuf,

    /// Names the result files; defaults to a timestamp
    #[arg(long)]
    label: Option<String>,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Config(args) => write_config(args),
        Commands::Setup(args) => setup(args),
        Commands::Exec(args) => exec(args),
        Commands::Version => {
            println!("genben {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn write_config(args: ConfigArgs) -> Result<(), Box<dyn std::error::Error>> {
    if generate_default_config(&args.output_config, args.force)? {
        println!("Configuration written to {}", args.output_config.display());
    }
    Ok(())
}

fn setup(args: ConfigFileArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Configuration::load(&args.config_file)?;
    let created = setup_stores(
        &config.directories.vcf,
        &config.directories.store,
        &config.conversion,
    )?;
    println!(
        "{} store(s) ready in {}",
        created.len(),
        config.directories.store.display()
    );
    Ok(())
}

fn exec(args: ExecArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Configuration::load(&args.config_file)?;
    let label = args.label.unwrap_or_else(default_label);
    info!("Benchmark label: {label}");

    let mut runner = BenchmarkRunner::new(config, &label)?;
    let summary = runner.run()?;
    println!(
        "Recorded {} operations over {} iteration(s) as '{}'",
        summary.operations_recorded,
        summary.iterations,
        runner.label()
    );
    Ok(())
}

fn default_label() -> String {
    chrono::Local::now()
        .format("run_%Y-%m-%d_%H-%M-%S")
        .to_string()
}
