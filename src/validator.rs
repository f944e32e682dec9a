use crate::descriptor::ValidationRule;
use memchr::memmem;

/// Bytes in view around one candidate. The session materializes these
/// windows; rules themselves never touch I/O.
pub struct CandidateView<'a> {
    /// Bounded window starting at the candidate offset.
    pub header: &'a [u8],
    /// Bounded view of the tentative span (candidate offset up to the next
    /// same-family candidate, or source end).
    pub span: &'a [u8],
    /// Bytes from the candidate offset to the end of the source.
    pub remaining: u64,
    /// Length of the signature that produced the candidate.
    pub signature_len: usize,
}

/// Applies every rule; a candidate is genuine only if all accept.
/// Rejection is the expected, common case of coincidental byte runs and is
/// not an error.
#[must_use]
pub fn confirm(rules: &[ValidationRule], view: &CandidateView<'_>) -> bool {
    rules.iter().all(|rule| check(rule, view))
}

fn check(rule: &ValidationRule, view: &CandidateView<'_>) -> bool {
    match rule {
        ValidationRule::SubMarker { marker, window } => {
            let from = view.signature_len;
            let to = from
                .saturating_add(*window)
                .saturating_add(marker.len())
                .min(view.header.len());
            if from >= to {
                return false;
            }
            memmem::find(&view.header[from..to], marker)
                .is_some_and(|pos| pos <= *window)
        }
        ValidationRule::LengthSanity { field, max } => match field.read(view.header) {
            Some(len) => len > 0 && len <= view.remaining && len <= *max,
            None => false,
        },
        ValidationRule::NegativeEvidence { marker } => {
            let body = view.span.get(view.signature_len..).unwrap_or(&[]);
            memmem::find(body, marker).is_none()
        }
    }
}
