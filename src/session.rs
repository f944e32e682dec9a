use crate::decoder::ExternalDecoder;
use crate::descriptor::{FormatDescriptor, ValidationRule};
use crate::error::{CarveError, Result};
use crate::io::ByteSource;
use crate::naming::NameRegistry;
use crate::resolver::resolve_boundary;
use crate::scanner::{dominant_signature, tally, ByteScanner};
use crate::types::{Candidate, ExtractionRecord, Segment, SessionStats};
use crate::validator::{confirm, CandidateView};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Sources at or below this size are materialized and scanned buffered;
/// larger ones are scanned in streaming blocks.
const BUFFER_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Window handed to validators and length-field resolution.
const HEADER_WINDOW: usize = 4096;

/// Cap on the tentative-span view for negative-evidence rules; bounds cost
/// on huge spans.
const SPAN_VIEW: usize = 1024 * 1024;

const COPY_CHUNK: usize = 64 * 1024;

/// Carves every segment of one format out of one source file.
///
/// Candidates are processed in strictly ascending source order and the
/// next-scan offset advances past each accepted segment, so claimed bytes
/// are never re-carved and self-similar data cannot loop.
pub struct CarvingSession<'a> {
    descriptor: &'a FormatDescriptor,
    registry: &'a NameRegistry,
    output_dir: &'a Path,
    cancel: &'a AtomicBool,
    decoder: Option<&'a dyn ExternalDecoder>,
    stats: SessionStats,
}

enum Local<'s, S: ByteSource> {
    Mem(Vec<u8>),
    Ext(&'s mut S),
}

impl<S: ByteSource> ByteSource for Local<'_, S> {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        match self {
            Local::Mem(v) => v.read_at(offset, buffer),
            Local::Ext(s) => s.read_at(offset, buffer),
        }
    }

    fn len(&self) -> u64 {
        match self {
            Local::Mem(v) => ByteSource::len(v),
            Local::Ext(s) => s.len(),
        }
    }
}

impl<'a> CarvingSession<'a> {
    #[must_use]
    pub fn new(
        descriptor: &'a FormatDescriptor,
        registry: &'a NameRegistry,
        output_dir: &'a Path,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            descriptor,
            registry,
            output_dir,
            cancel,
            decoder: None,
            stats: SessionStats::default(),
        }
    }

    /// Hands each carved segment's path to an external decode capability
    /// for formats whose payload this tool cannot interpret.
    #[must_use]
    pub fn with_decoder(mut self, decoder: &'a dyn ExternalDecoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    #[inline]
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Scans, validates, resolves, and writes. Records are emitted in
    /// ascending source-offset order; per-segment failures are recovered
    /// locally and only source-level I/O errors or cancellation abort the
    /// session.
    pub fn run<S: ByteSource>(
        &mut self,
        source: &mut S,
        source_path: &Path,
        mut on_record: impl FnMut(&ExtractionRecord),
    ) -> Result<Vec<ExtractionRecord>> {
        let scanner = ByteScanner::new(&self.descriptor.signatures);
        let source_len = source.len();

        // Small sources are scanned fully in memory; large ones in blocks
        // with signature carry-over. Results are identical either way.
        let (candidates, mut local) = if source_len <= BUFFER_THRESHOLD {
            let mut data = vec![0u8; source_len as usize];
            let n = source.read_at(0, &mut data)?;
            data.truncate(n);
            let candidates = scanner.scan_buffer(&data);
            (candidates, Local::Mem(data))
        } else {
            let candidates =
                scanner.scan_stream(source, self.descriptor.block_size, self.cancel)?;
            (candidates, Local::Ext(source))
        };

        // All signature families are counted; only the dominant one is
        // genuine payload, the rest are false positives in unrelated data.
        let counts = tally(&candidates, self.descriptor.signatures.len());
        let Some(family) = dominant_signature(&counts) else {
            return Ok(Vec::new());
        };
        debug!(
            format = self.descriptor.id,
            family,
            hits = counts[family],
            "selected dominant signature family"
        );

        let family_candidates: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| c.signature == family)
            .collect();
        let signature_len = self.descriptor.signatures[family].len();

        let stem = source_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("source")
            .to_string();

        let needs_span = self
            .descriptor
            .rules
            .iter()
            .any(|r| matches!(r, ValidationRule::NegativeEvidence { .. }));

        // Validation pass first: a rejected candidate is a coincidental
        // byte run inside real data and must not anchor any boundary.
        // Negative-evidence spans still use the raw next hit; rejected or
        // not, those bytes belong to the span under test.
        let mut accepted: Vec<u64> = Vec::new();
        for (i, candidate) in family_candidates.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(CarveError::Cancelled);
            }
            self.stats.candidates_seen += 1;

            let remaining = source_len - candidate.offset;
            let header = read_window(&mut local, candidate.offset, HEADER_WINDOW)?;

            let span = if needs_span {
                let span_end = family_candidates
                    .get(i + 1)
                    .map_or(source_len, |c| c.offset);
                let span_len = ((span_end - candidate.offset) as usize).min(SPAN_VIEW);
                read_window(&mut local, candidate.offset, span_len)?
            } else {
                Vec::new()
            };

            let view = CandidateView {
                header: &header,
                span: if needs_span { &span } else { &header },
                remaining,
                signature_len,
            };
            if confirm(&self.descriptor.rules, &view) {
                accepted.push(candidate.offset);
            } else {
                self.stats.candidates_rejected += 1;
                debug!(
                    format = self.descriptor.id,
                    offset = candidate.offset,
                    "candidate rejected by validators"
                );
            }
        }

        let mut records = Vec::new();
        let mut next_scan_offset: u64 = 0;

        for (i, &start) in accepted.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(CarveError::Cancelled);
            }
            if start < next_scan_offset {
                continue;
            }

            // Boundaries anchor on the next *accepted* candidate; offsets
            // are strictly ascending so that is simply the next entry.
            let next_same_family = accepted.get(i + 1).copied();
            let header = read_window(&mut local, start, HEADER_WINDOW)?;

            let resolution = match resolve_boundary(
                &self.descriptor.boundary,
                start,
                signature_len,
                &header,
                next_same_family,
                &mut local,
            ) {
                Ok(r) => r,
                Err(CarveError::BoundaryOverflow { end, source_len }) => {
                    self.stats.overflows += 1;
                    warn!(
                        format = self.descriptor.id,
                        offset = start,
                        end,
                        source_len,
                        "segment boundary overflows source, skipping candidate"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            let segment = Segment {
                format: self.descriptor.id,
                start,
                end: resolution.end,
                pad: resolution.pad,
                source: source_path.to_path_buf(),
            };

            let seq = self.stats.segments_written as usize;
            let output_path =
                self.registry
                    .claim(self.output_dir, &stem, seq, self.descriptor.extension);

            match write_segment(&mut local, &segment, &output_path) {
                Ok(written) => {
                    self.stats.segments_written += 1;
                    self.stats.bytes_written += written;

                    let record = ExtractionRecord {
                        output_path: output_path.clone(),
                        byte_count: written,
                        source_path: source_path.to_path_buf(),
                        format: self.descriptor.id,
                    };
                    on_record(&record);
                    records.push(record);

                    if self.descriptor.external_decoder {
                        if let Some(decoder) = self.decoder {
                            if let Err(e) = decoder.decode(&output_path) {
                                warn!(
                                    path = %output_path.display(),
                                    error = %e,
                                    "external decoder failed"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    // A partial file must not be left looking complete.
                    self.stats.write_failures += 1;
                    let _ = fs::remove_file(&output_path);
                    self.registry.release(&output_path);
                    warn!(
                        path = %output_path.display(),
                        error = %e,
                        "failed to write segment, continuing"
                    );
                }
            }

            next_scan_offset = segment.end;
        }

        Ok(records)
    }
}

fn read_window<S: ByteSource>(source: &mut S, offset: u64, want: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; want];
    let n = source.read_at(offset, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

/// Copies `[start, end)` to `path` plus any synthetic zero padding.
/// Byte-for-byte identical to the resolved slice of the source.
fn write_segment<S: ByteSource>(
    source: &mut S,
    segment: &Segment,
    path: &Path,
) -> Result<u64> {
    let map_err = |source: std::io::Error| CarveError::WriteFailure {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(map_err)?;
    let mut writer = BufWriter::with_capacity(COPY_CHUNK, file);

    let mut chunk = vec![0u8; COPY_CHUNK];
    let mut offset = segment.start;
    while offset < segment.end {
        let want = COPY_CHUNK.min((segment.end - offset) as usize);
        let n = source.read_at(offset, &mut chunk[..want])?;
        if n == 0 {
            // Source shrank underneath us; treat as a write failure so the
            // truncated output is removed.
            return Err(map_err(std::io::Error::other("source truncated mid-copy")));
        }
        writer.write_all(&chunk[..n]).map_err(map_err)?;
        offset += n as u64;
    }

    if segment.pad > 0 {
        writer.write_all(&vec![0u8; segment.pad]).map_err(map_err)?;
    }
    writer.flush().map_err(map_err)?;
    Ok(segment.output_len())
}

/// Convenience entry point: open `source_path`, carve with `descriptor`
/// into `output_dir`.
pub fn carve_file(
    descriptor: &FormatDescriptor,
    registry: &NameRegistry,
    source_path: &Path,
    output_dir: &Path,
    cancel: &AtomicBool,
) -> Result<Vec<ExtractionRecord>> {
    let mut source = crate::io::Source::open(source_path)?;
    let mut session = CarvingSession::new(descriptor, registry, output_dir, cancel);
    session.run(&mut source, source_path, |_| {})
}
