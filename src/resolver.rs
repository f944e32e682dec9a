use crate::descriptor::BoundaryStrategy;
use crate::error::{CarveError, Result};
use crate::io::ByteSource;
use memchr::memmem;

/// Backward search window for the trailing-padding strategy. Padding runs
/// sit at the very tail of a record; searching the whole provisional span
/// would be wasted I/O on multi-hundred-megabyte segments.
const TAIL_WINDOW: usize = 64 * 1024;

/// Forward-search block for the end-marker strategy.
const SEARCH_BLOCK: usize = 64 * 1024;

/// A resolved extent: `[start, end)` plus synthetic zero padding appended
/// on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub end: u64,
    pub pad: usize,
}

/// Computes the end of the segment starting at `start`.
///
/// `header` is a bounded window of source bytes beginning at `start`;
/// `next_same_family` is the offset of the next accepted candidate of the
/// same signature family, if any. Any strategy whose computed end would
/// exceed the source length fails with `BoundaryOverflow` — the caller
/// skips the candidate rather than emitting a corrupt segment.
pub fn resolve_boundary<S: ByteSource>(
    strategy: &BoundaryStrategy,
    start: u64,
    signature_len: usize,
    header: &[u8],
    next_same_family: Option<u64>,
    source: &mut S,
) -> Result<Resolution> {
    let source_len = source.len();
    let resolution = match strategy {
        BoundaryStrategy::NextSignature => Resolution {
            end: next_same_family.unwrap_or(source_len),
            pad: 0,
        },
        BoundaryStrategy::LengthField(field) => {
            let stored = field.read(header).unwrap_or(u64::MAX);
            let mut span = stored.saturating_add(field.base);
            if field.align > 1 {
                span = span.div_ceil(field.align) * field.align;
            }
            Resolution {
                end: start.saturating_add(span),
                pad: 0,
            }
        }
        BoundaryStrategy::EndMarker {
            marker,
            window,
            fallback,
        } => {
            let search_from = start + signature_len as u64;
            let limit = start.saturating_add(*window).min(source_len);
            match find_forward(source, search_from, limit, marker)? {
                Some(pos) => Resolution {
                    end: pos + marker.len() as u64,
                    pad: 0,
                },
                None => Resolution {
                    // The fallback is a maximum span, clamped at source end.
                    end: start.saturating_add(*fallback).min(source_len),
                    pad: 0,
                },
            }
        }
        BoundaryStrategy::TrailingPadding { run_len } => {
            let provisional = next_same_family.unwrap_or(source_len);
            if provisional <= start {
                return Err(CarveError::BoundaryOverflow {
                    end: provisional,
                    source_len,
                });
            }
            match find_padding_run(source, start, provisional, *run_len)? {
                Some(run_start) => Resolution {
                    end: run_start + *run_len as u64,
                    pad: 0,
                },
                None => Resolution {
                    end: provisional,
                    pad: *run_len,
                },
            }
        }
    };

    if resolution.end > source_len || resolution.end <= start {
        return Err(CarveError::BoundaryOverflow {
            end: resolution.end,
            source_len,
        });
    }
    Ok(resolution)
}

/// First occurrence of `marker` in `[from, limit)`, reading in blocks with
/// a `marker.len() - 1` carry so boundary-straddling hits are kept.
fn find_forward<S: ByteSource>(
    source: &mut S,
    from: u64,
    limit: u64,
    marker: &[u8],
) -> Result<Option<u64>> {
    if from >= limit || marker.is_empty() {
        return Ok(None);
    }
    let finder = memmem::Finder::new(marker);
    let carry_cap = marker.len() - 1;

    let mut window: Vec<u8> = Vec::with_capacity(carry_cap + SEARCH_BLOCK);
    let mut block = vec![0u8; SEARCH_BLOCK];
    let mut pos = from;

    while pos < limit {
        let want = SEARCH_BLOCK.min((limit - pos) as usize);
        let n = source.read_at(pos, &mut block[..want])?;
        if n == 0 {
            break;
        }
        let window_base = pos - window.len() as u64;
        window.extend_from_slice(&block[..n]);

        if let Some(hit) = finder.find(&window) {
            return Ok(Some(window_base + hit as u64));
        }

        let keep = carry_cap.min(window.len());
        window.drain(..window.len() - keep);
        pos += n as u64;
    }
    Ok(None)
}

/// Start of the `run_len` zero-byte run nearest the provisional end, inside
/// the final `TAIL_WINDOW` bytes of the span. `None` when no full run
/// exists there.
fn find_padding_run<S: ByteSource>(
    source: &mut S,
    start: u64,
    provisional_end: u64,
    run_len: usize,
) -> Result<Option<u64>> {
    if run_len == 0 {
        return Ok(None);
    }
    let span = provisional_end - start;
    let tail_len = (span as usize).min(TAIL_WINDOW);
    let tail_start = provisional_end - tail_len as u64;

    let mut tail = vec![0u8; tail_len];
    let n = source.read_at(tail_start, &mut tail)?;
    tail.truncate(n);
    if tail.len() < run_len {
        return Ok(None);
    }

    // One pass; the latest position with `run_len` zeros ending at it wins,
    // so the run nearest the provisional end is the one that truncates.
    let mut zeros = 0usize;
    let mut best: Option<usize> = None;
    for (i, &b) in tail.iter().enumerate() {
        if b == 0 {
            zeros += 1;
            if zeros >= run_len {
                best = Some(i + 1 - run_len);
            }
        } else {
            zeros = 0;
        }
    }
    Ok(best.map(|p| tail_start + p as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Endian, LengthField};

    fn next_sig() -> BoundaryStrategy {
        BoundaryStrategy::NextSignature
    }

    #[test]
    fn next_signature_delta() {
        let mut src = vec![0u8; 100];
        let r = resolve_boundary(&next_sig(), 10, 4, &[], Some(60), &mut src).unwrap();
        assert_eq!(r, Resolution { end: 60, pad: 0 });

        // No next candidate: runs to source end.
        let r = resolve_boundary(&next_sig(), 10, 4, &[], None, &mut src).unwrap();
        assert_eq!(r, Resolution { end: 100, pad: 0 });
    }

    #[test]
    fn length_field_exact_and_aligned() {
        let field = LengthField {
            offset: 4,
            width: 4,
            endian: Endian::Little,
            base: 8,
            align: 2,
        };
        let strategy = BoundaryStrategy::LengthField(field);

        let mut header = b"RIFF".to_vec();
        header.extend_from_slice(&101u32.to_le_bytes());
        let mut src = vec![0u8; 1000];

        // 8 + 101 = 109, rounded up to even = 110.
        let r = resolve_boundary(&strategy, 0, 4, &header, None, &mut src).unwrap();
        assert_eq!(r, Resolution { end: 110, pad: 0 });
    }

    #[test]
    fn length_field_overflow_rejected() {
        let field = LengthField {
            offset: 4,
            width: 4,
            endian: Endian::Little,
            base: 8,
            align: 0,
        };
        let strategy = BoundaryStrategy::LengthField(field);

        let mut header = b"RIFF".to_vec();
        header.extend_from_slice(&5000u32.to_le_bytes());
        let mut src = vec![0u8; 100];

        let err = resolve_boundary(&strategy, 0, 4, &header, None, &mut src).unwrap_err();
        assert!(matches!(err, CarveError::BoundaryOverflow { .. }));

        // Header window too short to read the field at all.
        let err = resolve_boundary(&strategy, 0, 4, b"RIFF\x01", None, &mut src).unwrap_err();
        assert!(matches!(err, CarveError::BoundaryOverflow { .. }));
    }

    #[test]
    fn end_marker_found() {
        let strategy = BoundaryStrategy::EndMarker {
            marker: b"TAIL",
            window: 1024,
            fallback: 512,
        };
        let mut src = vec![0u8; 200];
        src[5..9].copy_from_slice(b"HEAD");
        src[150..154].copy_from_slice(b"TAIL");

        let r = resolve_boundary(&strategy, 5, 4, &src.clone()[5..], None, &mut src).unwrap();
        assert_eq!(r, Resolution { end: 154, pad: 0 });
    }

    #[test]
    fn end_marker_straddles_search_block() {
        let strategy = BoundaryStrategy::EndMarker {
            marker: b"ENDMARK",
            window: (SEARCH_BLOCK * 3) as u64,
            fallback: 128,
        };
        let mut src = vec![0u8; SEARCH_BLOCK * 2];
        let place = SEARCH_BLOCK - 3;
        src[place..place + 7].copy_from_slice(b"ENDMARK");

        let r = resolve_boundary(&strategy, 0, 4, &[], None, &mut src).unwrap();
        assert_eq!(r.end, (place + 7) as u64);
    }

    #[test]
    fn end_marker_fallback_span() {
        let strategy = BoundaryStrategy::EndMarker {
            marker: b"TAIL",
            window: 1024,
            fallback: 64,
        };
        let mut src = vec![0xAAu8; 200];

        let r = resolve_boundary(&strategy, 10, 4, &[], None, &mut src).unwrap();
        assert_eq!(r, Resolution { end: 74, pad: 0 });

        // Fallback clamps at source end.
        let r = resolve_boundary(&strategy, 180, 4, &[], None, &mut src).unwrap();
        assert_eq!(r, Resolution { end: 200, pad: 0 });
    }

    #[test]
    fn trailing_padding_truncates_after_run() {
        let strategy = BoundaryStrategy::TrailingPadding { run_len: 8 };
        // Record bytes, an 8-zero padding run, then trailing garbage the
        // naive next-signature delta over-captured.
        let mut src = vec![0xCCu8; 100];
        for b in &mut src[60..68] {
            *b = 0;
        }

        let r = resolve_boundary(&strategy, 0, 4, &[], Some(100), &mut src).unwrap();
        assert_eq!(r, Resolution { end: 68, pad: 0 });
    }

    #[test]
    fn trailing_padding_appends_when_run_missing() {
        let strategy = BoundaryStrategy::TrailingPadding { run_len: 8 };
        let mut src = vec![0xCCu8; 100];

        let r = resolve_boundary(&strategy, 0, 4, &[], Some(100), &mut src).unwrap();
        assert_eq!(r, Resolution { end: 100, pad: 8 });
    }

    #[test]
    fn trailing_padding_picks_run_nearest_end() {
        let strategy = BoundaryStrategy::TrailingPadding { run_len: 4 };
        let mut src = vec![0xCCu8; 64];
        for b in &mut src[10..14] {
            *b = 0;
        }
        for b in &mut src[40..44] {
            *b = 0;
        }

        let r = resolve_boundary(&strategy, 0, 4, &[], Some(64), &mut src).unwrap();
        assert_eq!(r, Resolution { end: 44, pad: 0 });
    }

    #[test]
    fn trailing_padding_long_run_keeps_tail_end() {
        // Zeros all the way to the provisional end: nothing to drop.
        let strategy = BoundaryStrategy::TrailingPadding { run_len: 4 };
        let mut src = vec![0xCCu8; 32];
        for b in &mut src[20..32] {
            *b = 0;
        }

        let r = resolve_boundary(&strategy, 0, 4, &[], Some(32), &mut src).unwrap();
        assert_eq!(r, Resolution { end: 32, pad: 0 });
    }

    #[test]
    fn degenerate_extents_rejected() {
        let mut src = vec![0u8; 50];
        let err = resolve_boundary(&next_sig(), 50, 4, &[], None, &mut src).unwrap_err();
        assert!(matches!(err, CarveError::BoundaryOverflow { .. }));
    }
}
