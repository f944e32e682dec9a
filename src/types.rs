use std::path::PathBuf;

/// A fixed byte pattern, optionally with a "don't care" mask for formats
/// whose header interleaves fixed and variable fields (endianness markers,
/// RIFF form sizes).
///
/// When `mask` is present it has the same length as `bytes`; a `0xFF` mask
/// byte must match exactly, a `0x00` byte matches anything. Partial masks
/// compare only the set bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    bytes: Vec<u8>,
    mask: Option<Vec<u8>>,
}

impl Signature {
    #[must_use]
    pub fn exact(bytes: &[u8]) -> Self {
        assert!(!bytes.is_empty(), "empty signature");
        Self {
            bytes: bytes.to_vec(),
            mask: None,
        }
    }

    #[must_use]
    pub fn masked(bytes: &[u8], mask: &[u8]) -> Self {
        assert_eq!(bytes.len(), mask.len(), "mask length mismatch");
        assert!(
            mask.iter().any(|&m| m == 0xFF),
            "signature needs at least one fully fixed byte"
        );
        Self {
            bytes: bytes.to_vec(),
            mask: Some(mask.to_vec()),
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    #[must_use]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Longest run of fully-fixed bytes, and its offset within the pattern.
    /// Used as the needle for fast substring search; masked positions are
    /// re-checked by [`Signature::matches_at`].
    #[must_use]
    pub fn fixed_needle(&self) -> (usize, &[u8]) {
        let Some(mask) = &self.mask else {
            return (0, &self.bytes);
        };
        let mut best = 0usize..0usize;
        let mut run_start = None;
        for (i, &m) in mask.iter().chain(std::iter::once(&0)).enumerate() {
            match (m == 0xFF, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(s)) => {
                    if i - s > best.len() {
                        best = s..i;
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
        (best.start, &self.bytes[best])
    }

    /// Whether the pattern matches at the start of `window`. False if the
    /// window is shorter than the pattern.
    #[must_use]
    pub fn matches_at(&self, window: &[u8]) -> bool {
        if window.len() < self.bytes.len() {
            return false;
        }
        match &self.mask {
            None => &window[..self.bytes.len()] == self.bytes.as_slice(),
            Some(mask) => self
                .bytes
                .iter()
                .zip(mask)
                .zip(window)
                .all(|((&b, &m), &w)| (w ^ b) & m == 0),
        }
    }
}

/// A raw signature hit, not yet confirmed as a genuine segment start.
/// `signature` indexes the matching signature in its descriptor's declared
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub signature: usize,
    pub offset: u64,
}

/// The resolved, validated extent of one sub-file. `pad` counts synthetic
/// zero bytes appended after `end` by the trailing-padding strategy when
/// the source itself lacks the required run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub format: &'static str,
    pub start: u64,
    pub end: u64,
    pub pad: usize,
    pub source: PathBuf,
}

impl Segment {
    /// Bytes the emitted file will contain, padding included.
    #[inline]
    #[must_use]
    pub fn output_len(&self) -> u64 {
        (self.end - self.start) + self.pad as u64
    }
}

/// One successfully written output, the unit reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRecord {
    pub output_path: PathBuf,
    pub byte_count: u64,
    pub source_path: PathBuf,
    pub format: &'static str,
}

/// Per-source-file counters, owned by exactly one session.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub candidates_seen: u64,
    pub candidates_rejected: u64,
    pub segments_written: u64,
    pub bytes_written: u64,
    pub overflows: u64,
    pub write_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_signature_matches() {
        let sig = Signature::exact(b"RIFF");
        assert!(sig.matches_at(b"RIFFxxxx"));
        assert!(!sig.matches_at(b"RIFX"));
        assert!(!sig.matches_at(b"RI"));
    }

    #[test]
    fn masked_signature_ignores_wildcard_bytes() {
        let sig = Signature::masked(
            b"RIFF\x00\x00\x00\x00WAVE",
            &[
                0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF,
            ],
        );
        assert!(sig.matches_at(b"RIFF\x12\x34\x56\x78WAVEdata"));
        assert!(!sig.matches_at(b"RIFF\x12\x34\x56\x78XWMA"));
    }

    #[test]
    fn fixed_needle_picks_longest_run() {
        let sig = Signature::masked(
            b"RIFF\x00\x00\x00\x00XWMAfmt ",
            &[
                0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
                0xFF, 0xFF, 0xFF,
            ],
        );
        let (offset, needle) = sig.fixed_needle();
        assert_eq!(offset, 8);
        assert_eq!(needle, b"XWMAfmt ");
    }

    #[test]
    fn fixed_needle_of_exact_signature_is_whole_pattern() {
        let sig = Signature::exact(b"VAGp");
        assert_eq!(sig.fixed_needle(), (0, &b"VAGp"[..]));
    }

    #[test]
    fn segment_output_len_includes_padding() {
        let seg = Segment {
            format: "kvs",
            start: 10,
            end: 110,
            pad: 16,
            source: PathBuf::from("a.bin"),
        };
        assert_eq!(seg.output_len(), 116);
    }
}
