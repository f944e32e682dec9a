use crate::scanner::DEFAULT_BLOCK_SIZE;
use crate::types::Signature;
use aho_corasick::AhoCorasick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// An integer length field at a fixed offset from the segment start.
#[derive(Debug, Clone, Copy)]
pub struct LengthField {
    pub offset: usize,
    pub width: usize,
    pub endian: Endian,
    /// Fixed number of bytes (header) added on top of the stored length.
    pub base: u64,
    /// Round the resolved end up to this alignment (RIFF chunks pad to
    /// even). Zero or one means no alignment.
    pub align: u64,
}

impl LengthField {
    /// Reads the field from a window beginning at the segment start.
    /// `None` when the window is too short.
    #[must_use]
    pub fn read(&self, window: &[u8]) -> Option<u64> {
        let bytes = window.get(self.offset..self.offset + self.width)?;
        let mut value: u64 = 0;
        match self.endian {
            Endian::Little => {
                for &b in bytes.iter().rev() {
                    value = (value << 8) | u64::from(b);
                }
            }
            Endian::Big => {
                for &b in bytes {
                    value = (value << 8) | u64::from(b);
                }
            }
        }
        Some(value)
    }
}

/// How the end of a segment is located once its start is confirmed.
#[derive(Debug, Clone)]
pub enum BoundaryStrategy {
    /// End at the next accepted candidate of the same signature family, or
    /// at source end. For concatenated-blob containers with no internal
    /// length field.
    NextSignature,
    /// The format's own header states its size.
    LengthField(LengthField),
    /// Bounded forward search for a distinct end-of-record marker;
    /// `fallback` caps the span when the marker is absent.
    EndMarker {
        marker: &'static [u8],
        window: u64,
        fallback: u64,
    },
    /// Next-signature span, then normalize the tail to end with exactly
    /// `run_len` zero bytes: truncate after an existing run, or append a
    /// synthetic run when none exists.
    TrailingPadding { run_len: usize },
}

/// Structural checks that separate genuine segment starts from coincidental
/// byte runs. Pure functions of the bytes in view; composable per format.
#[derive(Debug, Clone)]
pub enum ValidationRule {
    /// A second fixed marker must appear within `window` bytes after the
    /// primary signature.
    SubMarker {
        marker: &'static [u8],
        window: usize,
    },
    /// The embedded length must be plausible: non-zero, within the
    /// remaining source, and at most `max`.
    LengthSanity { field: LengthField, max: u64 },
    /// A marker belonging to an incompatible format must not occur inside
    /// the tentative span.
    NegativeEvidence { marker: &'static [u8] },
}

/// Declarative per-format record. Built once at startup, shared read-only
/// across sessions; carving behavior is entirely strategy selection.
#[derive(Debug, Clone)]
pub struct FormatDescriptor {
    pub id: &'static str,
    pub signatures: Vec<Signature>,
    pub boundary: BoundaryStrategy,
    pub rules: Vec<ValidationRule>,
    pub extension: &'static str,
    /// Detection order when several formats are present in one source;
    /// higher carves first.
    pub priority: u8,
    /// Streaming block size, clamped to the scanner's bounds.
    pub block_size: usize,
    /// Payload is opaque to this tool; carved segments are handed to an
    /// external decoder.
    pub external_decoder: bool,
}

const MAX_SUB_ASSET: u64 = 100 * 1024 * 1024;

const RIFF_FORM_MASK: &[u8] = &[
    0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF,
];

const RIFF_LENGTH: LengthField = LengthField {
    offset: 4,
    width: 4,
    endian: Endian::Little,
    base: 8,
    align: 2,
};

/// The built-in corpus. Each entry replaces one of the legacy hand-written
/// per-format scanning loops.
#[must_use]
pub fn builtin_descriptors() -> Vec<FormatDescriptor> {
    vec![
        FormatDescriptor {
            id: "wem",
            signatures: vec![Signature::masked(b"RIFF\x00\x00\x00\x00WAVE", RIFF_FORM_MASK)],
            boundary: BoundaryStrategy::LengthField(RIFF_LENGTH),
            rules: vec![ValidationRule::LengthSanity {
                field: RIFF_LENGTH,
                max: MAX_SUB_ASSET,
            }],
            extension: "wem",
            priority: 60,
            block_size: DEFAULT_BLOCK_SIZE,
            external_decoder: false,
        },
        FormatDescriptor {
            id: "xwma",
            signatures: vec![Signature::masked(b"RIFF\x00\x00\x00\x00XWMA", RIFF_FORM_MASK)],
            boundary: BoundaryStrategy::LengthField(RIFF_LENGTH),
            rules: vec![ValidationRule::LengthSanity {
                field: RIFF_LENGTH,
                max: MAX_SUB_ASSET,
            }],
            extension: "xwma",
            priority: 60,
            block_size: DEFAULT_BLOCK_SIZE,
            external_decoder: false,
        },
        FormatDescriptor {
            id: "webp",
            signatures: vec![Signature::masked(b"RIFF\x00\x00\x00\x00WEBP", RIFF_FORM_MASK)],
            boundary: BoundaryStrategy::LengthField(RIFF_LENGTH),
            rules: vec![ValidationRule::LengthSanity {
                field: RIFF_LENGTH,
                max: MAX_SUB_ASSET,
            }],
            extension: "webp",
            priority: 50,
            block_size: DEFAULT_BLOCK_SIZE,
            external_decoder: false,
        },
        FormatDescriptor {
            id: "vag",
            signatures: vec![Signature::exact(b"VAGp")],
            boundary: BoundaryStrategy::LengthField(LengthField {
                offset: 12,
                width: 4,
                endian: Endian::Big,
                base: 48,
                align: 0,
            }),
            rules: vec![ValidationRule::LengthSanity {
                field: LengthField {
                    offset: 12,
                    width: 4,
                    endian: Endian::Big,
                    base: 0,
                    align: 0,
                },
                max: MAX_SUB_ASSET,
            }],
            extension: "vag",
            priority: 40,
            block_size: 16 * 1024,
            external_decoder: false,
        },
        FormatDescriptor {
            // Version byte after the magic varies across consoles.
            id: "msf",
            signatures: vec![Signature::masked(b"MSF\x00", &[0xFF, 0xFF, 0xFF, 0x00])],
            boundary: BoundaryStrategy::LengthField(LengthField {
                offset: 12,
                width: 4,
                endian: Endian::Big,
                base: 64,
                align: 0,
            }),
            rules: vec![ValidationRule::LengthSanity {
                field: LengthField {
                    offset: 12,
                    width: 4,
                    endian: Endian::Big,
                    base: 0,
                    align: 0,
                },
                max: MAX_SUB_ASSET,
            }],
            extension: "msf",
            priority: 40,
            block_size: DEFAULT_BLOCK_SIZE,
            external_decoder: true,
        },
        FormatDescriptor {
            // One logical container-audio format with four alternate magics;
            // the dominant family in a source is the one carved.
            id: "kvs",
            signatures: vec![
                Signature::exact(b"KOVS"),
                Signature::exact(b"KTSS"),
                Signature::exact(b"AT3 "),
                Signature::exact(b"KTAC"),
            ],
            boundary: BoundaryStrategy::TrailingPadding { run_len: 16 },
            rules: vec![ValidationRule::NegativeEvidence { marker: b"RIFF" }],
            extension: "kvs",
            priority: 30,
            block_size: DEFAULT_BLOCK_SIZE,
            external_decoder: true,
        },
        FormatDescriptor {
            id: "tm2",
            signatures: vec![Signature::exact(b"TIM2")],
            boundary: BoundaryStrategy::NextSignature,
            rules: vec![],
            extension: "tm2",
            priority: 20,
            block_size: DEFAULT_BLOCK_SIZE,
            external_decoder: false,
        },
        FormatDescriptor {
            // IEND length+type+CRC is a fixed 12-byte tail, so the whole
            // chunk serves as the end-of-record marker.
            id: "png",
            signatures: vec![Signature::exact(&[
                0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A,
            ])],
            boundary: BoundaryStrategy::EndMarker {
                marker: &[
                    0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
                ],
                window: 64 * 1024 * 1024,
                fallback: 1024 * 1024,
            },
            rules: vec![ValidationRule::SubMarker {
                marker: b"IHDR",
                window: 8,
            }],
            extension: "png",
            priority: 10,
            block_size: DEFAULT_BLOCK_SIZE,
            external_decoder: false,
        },
    ]
}

/// Looks up one descriptor by id.
#[must_use]
pub fn find<'d>(descriptors: &'d [FormatDescriptor], id: &str) -> Option<&'d FormatDescriptor> {
    descriptors.iter().find(|d| d.id == id)
}

/// Multi-pattern prefilter: which descriptors have at least one signature
/// hit anywhere in `data`. One Aho-Corasick pass over the buffer instead of
/// a full scan per format; hits are confirmed against the masked patterns.
/// Returned descriptors are ordered by descending priority, declaration
/// order on ties.
#[must_use]
pub fn detect<'d>(data: &[u8], descriptors: &'d [FormatDescriptor]) -> Vec<&'d FormatDescriptor> {
    let mut needles = Vec::new();
    let mut owner = Vec::new();
    for (di, desc) in descriptors.iter().enumerate() {
        for sig in &desc.signatures {
            let (needle_offset, needle) = sig.fixed_needle();
            needles.push(needle.to_vec());
            owner.push((di, needle_offset, sig));
        }
    }

    let ac = AhoCorasick::new(&needles).expect("descriptor signatures are valid patterns");
    let mut hit = vec![false; descriptors.len()];
    for m in ac.find_overlapping_iter(data) {
        let (di, needle_offset, sig) = owner[m.pattern().as_usize()];
        if hit[di] {
            continue;
        }
        if let Some(start) = m.start().checked_sub(needle_offset) {
            if sig.matches_at(&data[start..]) {
                hit[di] = true;
            }
        }
    }

    let mut found: Vec<&FormatDescriptor> = descriptors
        .iter()
        .enumerate()
        .filter(|(i, _)| hit[*i])
        .map(|(_, d)| d)
        .collect();
    found.sort_by(|a, b| b.priority.cmp(&a.priority));
    found
}
