use crate::error::{CarveError, Result};
use crate::io::ByteSource;
use crate::types::{Candidate, Signature};
use memchr::memmem::Finder;
use std::sync::atomic::{AtomicBool, Ordering};

/// Streaming block-size window. Sources range from kilobytes to gigabytes,
/// so formats may tune the block size within these bounds.
pub const MIN_BLOCK_SIZE: usize = 8 * 1024;
pub const MAX_BLOCK_SIZE: usize = 80 * 1024;
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

#[must_use]
pub fn clamp_block_size(requested: usize) -> usize {
    requested.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
}

/// Finds every occurrence of a set of signatures in a byte source, in
/// ascending offset order (ties broken by declared signature order).
///
/// Masked signatures are located by substring search on their longest
/// fully-fixed run, then confirmed against the whole pattern.
pub struct ByteScanner<'s> {
    signatures: &'s [Signature],
    finders: Vec<(usize, Finder<'s>)>,
    max_len: usize,
}

impl<'s> ByteScanner<'s> {
    #[must_use]
    pub fn new(signatures: &'s [Signature]) -> Self {
        assert!(!signatures.is_empty(), "scanner needs at least one signature");
        let finders = signatures
            .iter()
            .map(|sig| {
                let (needle_offset, needle) = sig.fixed_needle();
                (needle_offset, Finder::new(needle))
            })
            .collect();
        let max_len = signatures.iter().map(Signature::len).max().unwrap_or(0);
        Self {
            signatures,
            finders,
            max_len,
        }
    }

    #[inline]
    #[must_use]
    pub fn max_signature_len(&self) -> usize {
        self.max_len
    }

    /// Buffered mode: scan a fully materialized source.
    #[must_use]
    pub fn scan_buffer(&self, data: &[u8]) -> Vec<Candidate> {
        let mut out = Vec::new();
        self.scan_into(data, 0, 0, &mut out);
        out.sort_by_key(|c| (c.offset, c.signature));
        out
    }

    /// Streaming mode: scan in fixed-size blocks, carrying the trailing
    /// `max_signature_len - 1` bytes across block boundaries so a match
    /// straddling a boundary is never missed. Cancellation is observed once
    /// per block read.
    pub fn scan_stream<S: ByteSource>(
        &self,
        source: &mut S,
        block_size: usize,
        cancel: &AtomicBool,
    ) -> Result<Vec<Candidate>> {
        let block_size = clamp_block_size(block_size);
        let carry_cap = self.max_len.saturating_sub(1);

        let mut out = Vec::new();
        let mut window = Vec::with_capacity(carry_cap + block_size);
        let mut block = vec![0u8; block_size];
        let mut pos: u64 = 0;

        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(CarveError::Cancelled);
            }

            let n = source.read_at(pos, &mut block)?;
            if n == 0 {
                break;
            }

            let carry_len = window.len();
            let window_base = pos - carry_len as u64;
            window.extend_from_slice(&block[..n]);

            // Matches ending inside the carry were reported by the previous
            // block; report only those reaching into the fresh bytes.
            self.scan_into(&window, window_base, carry_len, &mut out);

            let keep = carry_cap.min(window.len());
            window.drain(..window.len() - keep);
            pos += n as u64;
        }

        out.sort_by_key(|c| (c.offset, c.signature));
        Ok(out)
    }

    fn scan_into(&self, data: &[u8], base: u64, skip_end_before: usize, out: &mut Vec<Candidate>) {
        for (idx, (needle_offset, finder)) in self.finders.iter().enumerate() {
            let sig = &self.signatures[idx];
            for hit in finder.find_iter(data) {
                let Some(start) = hit.checked_sub(*needle_offset) else {
                    continue;
                };
                if start + sig.len() <= skip_end_before {
                    continue;
                }
                if sig.matches_at(&data[start..]) {
                    out.push(Candidate {
                        signature: idx,
                        offset: base + start as u64,
                    });
                }
            }
        }
    }
}

/// Occurrence count per signature, indexed by declared order. The caller
/// carves with the dominant signature family.
#[must_use]
pub fn tally(candidates: &[Candidate], signature_count: usize) -> Vec<usize> {
    let mut counts = vec![0usize; signature_count];
    for c in candidates {
        counts[c.signature] += 1;
    }
    counts
}

/// Index of the signature with the most occurrences; ties go to the
/// first-declared signature. `None` when nothing matched at all.
#[must_use]
pub fn dominant_signature(counts: &[usize]) -> Option<usize> {
    let (idx, &max) = counts
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))?;
    (max > 0).then_some(idx)
}
