// ========================================================================================
//
//                               Result sinks
//
// ========================================================================================
//
// Durable destinations for completed measurements. Every sink receives each entry
// independently and synchronously; the profiler logs a failing write and moves on.

use crate::config::{InfluxConfig, OutputConfig};
use crate::profiler::ResultEntry;
use chrono::SecondsFormat;
use log::debug;
use reqwest::blocking::Client;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub const CSV_HEADER: [&str; 4] = ["start_time", "run_number", "operation_name", "exec_time"];
pub const INFLUX_MEASUREMENT: &str = "benchmark";

const INFLUX_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write delimited record: {0}")]
    Csv(#[from] csv::Error),
    #[error("time-series request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("time-series database answered {status}: {body}")]
    Status { status: u16, body: String },
}

pub trait ResultSink: Send {
    fn name(&self) -> &str;
    fn write(&mut self, entry: &ResultEntry) -> Result<(), SinkError>;
}

/// Builds every sink enabled in `output` for the benchmark `label`.
pub fn build_sinks(
    output: &OutputConfig,
    label: &str,
) -> Result<Vec<Box<dyn ResultSink>>, SinkError> {
    let mut sinks: Vec<Box<dyn ResultSink>> = Vec::new();
    if output.csv_enabled {
        sinks.push(Box::new(CsvSink::create(
            &output.directory,
            label,
            output.delimiter,
        )?));
    }
    if let Some(influx) = &output.influxdb {
        sinks.push(Box::new(InfluxSink::new(influx.clone(), label)?));
    }
    Ok(sinks)
}

// ========================================================================================
//                                   Delimited file
// ========================================================================================

/// Appends one row per entry to `<directory>/<label>.<ext>`.
pub struct CsvSink {
    path: PathBuf,
    delimiter: u8,
}

impl CsvSink {
    pub fn create(directory: &Path, label: &str, delimiter: u8) -> Result<Self, SinkError> {
        fs::create_dir_all(directory).map_err(|source| SinkError::Io {
            path: directory.display().to_string(),
            source,
        })?;
        let path = directory.join(format!("{label}.{}", extension_for(delimiter)));
        debug!("Recording results to {}", path.display());
        Ok(Self { path, delimiter })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn extension_for(delimiter: u8) -> &'static str {
    match delimiter {
        b'|' => "psv",
        b'\t' => "tsv",
        _ => "csv",
    }
}

impl ResultSink for CsvSink {
    fn name(&self) -> &str {
        "delimited file"
    }

    fn write(&mut self, entry: &ResultEntry) -> Result<(), SinkError> {
        let write_header = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| SinkError::Io {
                path: self.path.display().to_string(),
                source,
            })?;

        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .from_writer(file);
        if write_header {
            writer.write_record(CSV_HEADER)?;
        }
        writer.write_record([
            entry
                .start_time
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            entry.run_number.to_string(),
            entry.operation_name.clone(),
            entry.exec_time.as_secs_f64().to_string(),
        ])?;
        writer.flush().map_err(|source| SinkError::Io {
            path: self.path.display().to_string(),
            source,
        })
    }
}

// ========================================================================================
//                                 Time-series database
// ========================================================================================

/// Writes one line-protocol point per entry to an InfluxDB 1.x endpoint.
pub struct InfluxSink {
    client: Client,
    config: InfluxConfig,
    label: String,
}

impl InfluxSink {
    pub fn new(config: InfluxConfig, label: &str) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(INFLUX_TIMEOUT)
            .user_agent(format!("genben/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            config,
            label: label.to_string(),
        })
    }

    fn write_url(&self) -> String {
        format!("http://{}:{}/write", self.config.host, self.config.port)
    }
}

impl ResultSink for InfluxSink {
    fn name(&self) -> &str {
        "time-series"
    }

    fn write(&mut self, entry: &ResultEntry) -> Result<(), SinkError> {
        let body = line_protocol(entry, &self.label, &self.config);
        let response = self
            .client
            .post(self.write_url())
            .query(&[
                ("db", self.config.database.as_str()),
                ("precision", "ns"),
                ("u", self.config.username.as_str()),
                ("p", self.config.password.as_str()),
            ])
            .body(body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Formats `entry` as one InfluxDB line-protocol point. Empty tags are omitted.
pub fn line_protocol(entry: &ResultEntry, label: &str, config: &InfluxConfig) -> String {
    let mut line = String::from(INFLUX_MEASUREMENT);
    let tags = [
        ("operation_name", entry.operation_name.as_str()),
        ("benchmark_label", label),
        ("benchmark_group", config.benchmark_group.as_str()),
        ("device_name", config.device_name.as_str()),
    ];
    for (key, value) in tags {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(key);
        line.push('=');
        line.push_str(&escape_tag(value));
    }
    line.push_str(&format!(
        " run_number={}i,exec_time={}",
        entry.run_number,
        entry.exec_time.as_secs_f64()
    ));
    let timestamp = entry.start_time.timestamp_nanos_opt().unwrap_or_default();
    line.push_str(&format!(" {timestamp}"));
    line
}

fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ========================================================================================
//                                     In memory
// ========================================================================================

/// Collects entries in process. Clones share one buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<ResultEntry>>>,
}

impl MemorySink {
    pub fn entries(&self) -> Vec<ResultEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn operation_names(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .map(|e| e.operation_name)
            .collect()
    }
}

impl ResultSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn write(&mut self, entry: &ResultEntry) -> Result<(), SinkError> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.clone());
        }
        Ok(())
    }
}
