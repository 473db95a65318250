use flate2::read::MultiGzDecoder;
use log::debug;
use natord::compare;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Marker file that identifies a directory as a columnar genotype store.
pub const STORE_METADATA_FILE: &str = "store.json";

/// Removes a directory and everything under it. A missing directory is not an error.
pub fn remove_directory_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!("Removed directory tree {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn is_store_dir(path: &Path) -> bool {
    path.is_dir() && path.join(STORE_METADATA_FILE).is_file()
}

/// Lists every entry of `dir` in natural order (`chr2` sorts before `chr10`).
///
/// Entries that are not valid stores are still returned so that the caller can
/// report them; use [`is_store_dir`] to check each one.
pub fn list_store_candidates(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            entries.push(path);
        }
    }
    entries.sort_by(|a, b| compare_paths(a, b));
    Ok(entries)
}

/// Lists the VCF files (`.vcf`, `.vcf.gz`) directly under `dir`, naturally ordered.
pub fn list_vcf_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && has_vcf_extension(&path) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| compare_paths(a, b));
    Ok(files)
}

pub fn has_vcf_extension(path: &Path) -> bool {
    let lower = path.to_string_lossy().to_ascii_lowercase();
    lower.ends_with(".vcf") || lower.ends_with(".vcf.gz") || lower.ends_with(".vcf.bgz")
}

/// Strips the VCF extension from a file name: `trio.vcf.gz` becomes `trio`.
pub fn vcf_stem(file_name: &str) -> &str {
    let lower = file_name.to_ascii_lowercase();
    for suffix in [".vcf.gz", ".vcf.bgz", ".vcf"] {
        if lower.ends_with(suffix) {
            return &file_name[..file_name.len() - suffix.len()];
        }
    }
    file_name
}

/// Opens a text file for buffered line reading, transparently inflating gzip/BGZF input.
pub fn open_text_reader(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let bytes_read = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    if bytes_read == 2 && is_gzip_magic(&magic) {
        debug!("Reading {} as gzip", path.display());
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn is_gzip_magic(magic: &[u8; 2]) -> bool {
    magic[0] == 0x1F && magic[1] == 0x8B
}

fn compare_paths(a: &Path, b: &Path) -> std::cmp::Ordering {
    let a_str = a
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| a.to_string_lossy().into_owned());
    let b_str = b
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| b.to_string_lossy().into_owned());
    compare(&a_str, &b_str)
}
