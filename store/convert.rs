// ========================================================================================
//
//                      VCF to columnar store conversion
//
// ========================================================================================
//
// Streams a plain or gzip-compressed VCF into a genotype store, one chunk of
// `chunk_length` variants at a time. Only the GT calls are kept. Both phases of the
// conversion are timed through the caller's profiler so they land in the same result
// stream as the benchmark operations.

use super::{MISSING_CALL, StoreError, StoreLayout, StoreWriter};
use crate::profiler::BenchmarkProfiler;
use crate::shared::files::{list_vcf_files, open_text_reader, remove_directory_tree, vcf_stem};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use memchr::memchr_iter;
use ndarray::Array3;
use std::fs;
use std::io::{self, BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETERMINE_ALT_NUMBER_OPERATION: &str = "Convert VCF: Determine Alt Number";
pub const CONVERT_OPERATION: &str = "Convert VCF to Store";

/// Calls are always stored diploid; haploid calls are padded with a missing allele.
pub const STORE_PLOIDY: usize = 2;

const FIXED_COLUMNS: usize = 9;
const ALT_COLUMN: usize = 4;
const FORMAT_COLUMN: usize = 8;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{path}: no #CHROM header line before the first record")]
    MissingHeader { path: String },
    #[error("{path}, line {line}: {message}")]
    Malformed {
        path: String,
        line: usize,
        message: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AltNumber {
    /// Scan the source once to find the largest number of ALT alleles.
    Auto,
    Fixed(usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversionConfig {
    pub alt_number: AltNumber,
    pub chunk_length: usize,
    pub chunk_width: usize,
    pub compression_level: u32,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            alt_number: AltNumber::Auto,
            chunk_length: 65_536,
            chunk_width: 64,
            compression_level: 1,
        }
    }
}

/// Converts `source` into a new store at `destination`.
pub fn convert(
    source: &Path,
    destination: &Path,
    options: &ConversionConfig,
    profiler: &mut BenchmarkProfiler,
) -> Result<(), ConvertError> {
    let alt_number = match options.alt_number {
        AltNumber::Fixed(n) => n,
        AltNumber::Auto => {
            let n = profiler.time(DETERMINE_ALT_NUMBER_OPERATION, || determine_alt_number(source))?;
            info!("Determined alt number for {}: {n}", source.display());
            n
        }
    };

    profiler.time(CONVERT_OPERATION, || {
        write_store(source, destination, options, alt_number)
    })?;
    Ok(())
}

/// Converts every VCF under `vcf_dir` into a store of the same stem under `store_dir`.
pub fn setup_stores(
    vcf_dir: &Path,
    store_dir: &Path,
    options: &ConversionConfig,
) -> Result<Vec<PathBuf>, ConvertError> {
    let read_error = |path: &Path, source: io::Error| ConvertError::Read {
        path: path.display().to_string(),
        source,
    };

    let sources = list_vcf_files(vcf_dir).map_err(|e| read_error(vcf_dir, e))?;
    if sources.is_empty() {
        warn!("No VCF files found in {}", vcf_dir.display());
        return Ok(Vec::new());
    }
    fs::create_dir_all(store_dir).map_err(|e| read_error(store_dir, e))?;

    let pb = create_progress_bar(sources.len() as u64, "Converting VCF files");
    let mut profiler = BenchmarkProfiler::new(Vec::new());
    let mut created = Vec::with_capacity(sources.len());

    for source in &sources {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let destination = store_dir.join(vcf_stem(&file_name));
        remove_directory_tree(&destination).map_err(|e| read_error(&destination, e))?;

        pb.set_message(file_name.clone());
        convert(source, &destination, options, &mut profiler)?;
        created.push(destination);
        pb.inc(1);
    }

    pb.finish_with_message("Conversion complete");
    Ok(created)
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

fn determine_alt_number(source: &Path) -> Result<usize, ConvertError> {
    let mut records = VcfRecords::open(source)?;
    let mut max_alts = 0usize;
    while records.next_record()? {
        let fields = split_tabs(&records.line);
        let alt = fields.get(ALT_COLUMN).copied().unwrap_or(b".");
        let alts = if alt == b"." {
            0
        } else {
            memchr_iter(b',', alt).count() + 1
        };
        max_alts = max_alts.max(alts);
    }
    Ok(max_alts)
}

fn write_store(
    source: &Path,
    destination: &Path,
    options: &ConversionConfig,
    alt_number: usize,
) -> Result<(), ConvertError> {
    let mut records = VcfRecords::open(source)?;
    let samples = records.samples.clone();
    let n_samples = samples.len();
    let chunk_length = options.chunk_length.max(1);

    let mut writer = StoreWriter::create(
        destination,
        StoreLayout {
            samples,
            ploidy: STORE_PLOIDY,
            chunk_length,
            chunk_width: options.chunk_width,
            alt_number,
            compression_level: options.compression_level,
        },
    )?;

    let row_len = n_samples * STORE_PLOIDY;
    let mut buffer: Vec<i8> = Vec::with_capacity(chunk_length * row_len);
    let mut rows = 0usize;
    let mut clipped = 0usize;

    while records.next_record()? {
        let line_number = records.line_number;
        let fields = split_tabs(&records.line);
        let row_start = buffer.len();
        buffer.resize(row_start + row_len, MISSING_CALL);

        if n_samples > 0 {
            if fields.len() != FIXED_COLUMNS + n_samples {
                return Err(records.malformed(
                    line_number,
                    format!(
                        "expected {} columns, found {}",
                        FIXED_COLUMNS + n_samples,
                        fields.len()
                    ),
                ));
            }
            if let Some(gt_index) = gt_position(fields[FORMAT_COLUMN]) {
                for (sample, field) in fields[FIXED_COLUMNS..].iter().enumerate() {
                    let call = &mut buffer[row_start + sample * STORE_PLOIDY..][..STORE_PLOIDY];
                    let gt = field.split(|&b| b == b':').nth(gt_index).unwrap_or(b".");
                    clipped += parse_genotype(gt, alt_number, call)
                        .map_err(|message| records.malformed(line_number, message))?;
                }
            }
        }

        rows += 1;
        if rows == chunk_length {
            flush_chunk(&mut writer, &mut buffer, rows, n_samples)?;
            rows = 0;
        }
    }
    if rows > 0 {
        flush_chunk(&mut writer, &mut buffer, rows, n_samples)?;
    }

    if clipped > 0 {
        warn!(
            "{clipped} allele calls in {} exceeded alt number {alt_number} and were stored as missing",
            source.display()
        );
    }
    let handle = writer.finish()?;
    debug!(
        "Wrote store {} ({} variants × {} samples in {} chunks)",
        destination.display(),
        handle.n_variants(),
        handle.n_samples(),
        handle.n_chunks()
    );
    Ok(())
}

fn flush_chunk(
    writer: &mut StoreWriter,
    buffer: &mut Vec<i8>,
    rows: usize,
    n_samples: usize,
) -> Result<(), ConvertError> {
    let calls = Array3::from_shape_vec((rows, n_samples, STORE_PLOIDY), std::mem::take(buffer))
        .map_err(|e| StoreError::ChunkShape(e.to_string()))?;
    writer.write_chunk(calls.view())?;
    *buffer = calls.into_raw_vec_and_offset().0;
    buffer.clear();
    Ok(())
}

fn split_tabs(line: &[u8]) -> Vec<&[u8]> {
    let mut fields = Vec::with_capacity(16);
    let mut start = 0;
    for tab in memchr_iter(b'\t', line) {
        fields.push(&line[start..tab]);
        start = tab + 1;
    }
    fields.push(&line[start..]);
    fields
}

fn gt_position(format: &[u8]) -> Option<usize> {
    format.split(|&b| b == b':').position(|key| key == b"GT")
}

/// Parses one GT value into `call`, returning how many alleles were clipped to
/// missing because they exceed `alt_number`.
fn parse_genotype(gt: &[u8], alt_number: usize, call: &mut [i8]) -> Result<usize, String> {
    let mut clipped = 0;
    let mut position = 0;
    for allele in gt.split(|&b| b == b'/' || b == b'|') {
        if position == call.len() {
            return Err(format!(
                "genotype '{}' has more than {} alleles",
                String::from_utf8_lossy(gt),
                call.len()
            ));
        }
        call[position] = if allele == b"." || allele.is_empty() {
            MISSING_CALL
        } else {
            let index: usize = std::str::from_utf8(allele)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| format!("invalid allele '{}'", String::from_utf8_lossy(allele)))?;
            if index > alt_number || index > i8::MAX as usize {
                clipped += 1;
                MISSING_CALL
            } else {
                index as i8
            }
        };
        position += 1;
    }
    Ok(clipped)
}

/// Line reader over the data records of a VCF, with the sample names taken from
/// the `#CHROM` header.
struct VcfRecords {
    path: String,
    reader: Box<dyn BufRead + Send>,
    line: Vec<u8>,
    line_number: usize,
    samples: Vec<String>,
}

impl VcfRecords {
    fn open(source: &Path) -> Result<Self, ConvertError> {
        let path = source.display().to_string();
        let reader = open_text_reader(source).map_err(|e| ConvertError::Read {
            path: path.clone(),
            source: e,
        })?;
        let mut records = Self {
            path,
            reader,
            line: Vec::new(),
            line_number: 0,
            samples: Vec::new(),
        };

        loop {
            if !records.read_line()? {
                return Err(ConvertError::MissingHeader { path: records.path });
            }
            if records.line.starts_with(b"##") {
                continue;
            }
            if records.line.starts_with(b"#CHROM") {
                records.samples = split_tabs(&records.line)
                    .iter()
                    .skip(FIXED_COLUMNS)
                    .map(|name| String::from_utf8_lossy(name).into_owned())
                    .collect();
                return Ok(records);
            }
            return Err(ConvertError::MissingHeader { path: records.path });
        }
    }

    fn read_line(&mut self) -> Result<bool, ConvertError> {
        self.line.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.line)
            .map_err(|source| ConvertError::Read {
                path: self.path.clone(),
                source,
            })?;
        if read == 0 {
            return Ok(false);
        }
        self.line_number += 1;
        while matches!(self.line.last(), Some(b'\n' | b'\r')) {
            self.line.pop();
        }
        Ok(true)
    }

    /// Advances to the next data record, leaving it in `self.line`.
    fn next_record(&mut self) -> Result<bool, ConvertError> {
        loop {
            if !self.read_line()? {
                return Ok(false);
            }
            if self.line.first().is_some_and(|&b| b != b'#') {
                return Ok(true);
            }
        }
    }

    fn malformed(&self, line: usize, message: String) -> ConvertError {
        ConvertError::Malformed {
            path: self.path.clone(),
            line,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::MemorySink;
    use crate::store::open_store;

    const VCF: &str = "##fileformat=VCFv4.2\n\
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tA\tB\tC\n\
1\t100\t.\tA\tG\t.\tPASS\t.\tGT\t0/0\t0/1\t1|1\n\
1\t200\t.\tC\tT,G\t.\tPASS\t.\tGT:DP\t0/2:3\t./.:0\t1/2:7\n\
1\t300\t.\tG\t.\t.\tPASS\t.\tGT\t0\t0/0\t.\n";

    fn write_vcf(dir: &Path) -> PathBuf {
        let path = dir.join("toy.vcf");
        fs::write(&path, VCF).unwrap();
        path
    }

    #[test]
    fn converts_calls_and_times_both_phases() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_vcf(dir.path());
        let destination = dir.path().join("toy");

        let sink = MemorySink::default();
        let mut profiler = BenchmarkProfiler::new(vec![Box::new(sink.clone())]);
        let options = ConversionConfig {
            chunk_length: 2,
            ..ConversionConfig::default()
        };
        convert(&source, &destination, &options, &mut profiler).unwrap();

        let names: Vec<String> = sink.entries().into_iter().map(|e| e.operation_name).collect();
        assert_eq!(names, vec![DETERMINE_ALT_NUMBER_OPERATION, CONVERT_OPERATION]);

        let store = open_store(&destination).unwrap();
        let meta = store.metadata();
        assert_eq!(meta.samples, vec!["A", "B", "C"]);
        assert_eq!(meta.alt_number, 2);
        assert_eq!(meta.n_chunks(), 2);
        assert_eq!(meta.max_allele, 2);

        let calls = store.read_all().unwrap();
        assert_eq!(calls.dim(), (3, 3, 2));
        assert_eq!(calls[[0, 2, 0]], 1);
        assert_eq!(calls[[1, 0, 1]], 2);
        assert_eq!(calls[[1, 1, 0]], MISSING_CALL);
        // haploid call padded with missing
        assert_eq!(calls[[2, 0, 0]], 0);
        assert_eq!(calls[[2, 0, 1]], MISSING_CALL);
    }

    #[test]
    fn fixed_alt_number_skips_the_scan_and_clips_alleles() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_vcf(dir.path());
        let destination = dir.path().join("toy");

        let sink = MemorySink::default();
        let mut profiler = BenchmarkProfiler::new(vec![Box::new(sink.clone())]);
        let options = ConversionConfig {
            alt_number: AltNumber::Fixed(1),
            ..ConversionConfig::default()
        };
        convert(&source, &destination, &options, &mut profiler).unwrap();

        assert_eq!(sink.entries().len(), 1);
        let calls = open_store(&destination).unwrap().read_all().unwrap();
        assert_eq!(calls[[1, 0, 1]], MISSING_CALL);
        assert_eq!(calls[[1, 2, 0]], 1);
    }

    #[test]
    fn malformed_record_cancels_the_open_timer() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("bad.vcf");
        fs::write(
            &source,
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tA\n1\t1\t.\tA\tG\t.\t.\t.\tGT\tx/1\n",
        )
        .unwrap();

        let sink = MemorySink::default();
        let mut profiler = BenchmarkProfiler::new(vec![Box::new(sink.clone())]);
        let options = ConversionConfig {
            alt_number: AltNumber::Fixed(1),
            ..ConversionConfig::default()
        };
        let err = convert(&source, &dir.path().join("bad"), &options, &mut profiler).unwrap_err();

        assert!(matches!(err, ConvertError::Malformed { line: 2, .. }));
        assert!(!profiler.is_running());
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn setup_converts_every_vcf_in_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let vcf_dir = dir.path().join("vcf");
        fs::create_dir_all(&vcf_dir).unwrap();
        write_vcf(&vcf_dir);
        fs::copy(vcf_dir.join("toy.vcf"), vcf_dir.join("other.vcf")).unwrap();

        let store_dir = dir.path().join("store");
        let created = setup_stores(&vcf_dir, &store_dir, &ConversionConfig::default()).unwrap();
        assert_eq!(created, vec![store_dir.join("other"), store_dir.join("toy")]);
        assert!(open_store(&store_dir.join("toy")).is_ok());
    }
}
