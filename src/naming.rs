use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Pure unique-name computation: `{stem}_{seq}.{ext}`, then
/// `{stem}_{seq}_dup{n}.{ext}` with the smallest free `n`. The existence
/// check is injected so the function is testable without a filesystem.
pub fn next_unique_path(
    dir: &Path,
    stem: &str,
    seq: usize,
    ext: &str,
    exists: impl Fn(&Path) -> bool,
) -> PathBuf {
    let first = dir.join(format!("{stem}_{seq}.{ext}"));
    if !exists(&first) {
        return first;
    }
    let mut n = 1usize;
    loop {
        let candidate = dir.join(format!("{stem}_{seq}_dup{n}.{ext}"));
        if !exists(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Output names claimed during one batch run. Sessions writing into the
/// same directory race on "does this path exist, else bump counter", so
/// claiming is serialized; the on-disk check additionally protects prior
/// runs' outputs from being overwritten.
#[derive(Debug, Default)]
pub struct NameRegistry {
    used: Mutex<HashSet<PathBuf>>,
}

impl NameRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves and returns a unique output path.
    pub fn claim(&self, dir: &Path, stem: &str, seq: usize, ext: &str) -> PathBuf {
        let mut used = self.used.lock();
        let path = next_unique_path(dir, stem, seq, ext, |p| used.contains(p) || p.exists());
        used.insert(path.clone());
        path
    }

    /// Releases a claim whose write failed, so the name can be reused.
    pub fn release(&self, path: &Path) {
        self.used.lock().remove(path);
    }
}
