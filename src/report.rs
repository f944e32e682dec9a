use crate::error::{CarveError, Result};
use crate::types::ExtractionRecord;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};

/// One carved output in the run report.
#[derive(Debug, Serialize)]
pub struct ReportEntry {
    pub output_path: PathBuf,
    pub source_path: PathBuf,
    pub format: &'static str,
    pub byte_count: u64,
    pub sha256: String,
}

/// Machine-readable record of a whole run, written alongside the outputs.
/// The digest per entry lets a later pass verify nothing was altered or
/// truncated after extraction.
#[derive(Debug, Serialize)]
pub struct ExtractionReport {
    pub generated_at: String,
    pub tool: &'static str,
    pub version: &'static str,
    pub sources_scanned: u64,
    pub segments_extracted: u64,
    pub bytes_extracted: u64,
    pub entries: Vec<ReportEntry>,
}

impl ExtractionReport {
    /// Builds the report, hashing every output file.
    pub fn build(records: &[ExtractionRecord], sources_scanned: u64) -> Result<Self> {
        let mut entries = Vec::with_capacity(records.len());
        let mut bytes_extracted = 0u64;

        for record in records {
            entries.push(ReportEntry {
                output_path: record.output_path.clone(),
                source_path: record.source_path.clone(),
                format: record.format,
                byte_count: record.byte_count,
                sha256: sha256_file(&record.output_path)?,
            });
            bytes_extracted += record.byte_count;
        }

        Ok(Self {
            generated_at: Utc::now().to_rfc3339(),
            tool: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            sources_scanned,
            segments_extracted: records.len() as u64,
            bytes_extracted,
            entries,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let map_err = |source: std::io::Error| CarveError::WriteFailure {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(map_err)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| map_err(std::io::Error::other(e)))?;
        Ok(())
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|source| CarveError::SourceUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
