use crate::error::{CarveError, Result};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Random-access byte source a session carves from. Sources are opened
/// read-only and never mutated; `read_at` may return fewer bytes than
/// requested at end of source.
pub trait ByteSource {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize>;

    /// Total source length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Plain file-backed source. Used when mmap is unavailable (pipes, some
/// network filesystems) and for very large archives scanned in blocks.
pub struct FileSource {
    file: File,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(false)
            .open(path)
            .map_err(|source| CarveError::SourceUnreadable {
                path: path.to_path_buf(),
                source,
            })?;

        #[cfg(target_os = "linux")]
        {
            use rustix::fs::{fadvise, Advice};
            let _ = fadvise(&file, 0, None, Advice::Sequential);
        }

        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        Ok(Self { file, len })
    }
}

impl ByteSource for FileSource {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        // Loop: short reads are legal before EOF on some filesystems.
        while total < buffer.len() {
            match self.file.read(&mut buffer[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    #[inline]
    fn len(&self) -> u64 {
        self.len
    }
}

/// Memory-mapped source for archives that fit comfortably in address space.
pub struct MmapSource {
    mmap: Mmap,
}

impl MmapSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| CarveError::SourceUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let meta = file.metadata()?;
        if meta.len() == 0 {
            return Err(CarveError::SourceUnreadable {
                path: path.to_path_buf(),
                source: std::io::Error::other("cannot mmap empty file"),
            });
        }
        let mmap = unsafe { Mmap::map(&file) }?;

        #[cfg(target_os = "linux")]
        {
            use memmap2::Advice;
            let _ = mmap.advise(Advice::Sequential);
        }

        Ok(Self { mmap })
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }
}

impl ByteSource for MmapSource {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        let start = offset as usize;
        if start >= self.mmap.len() {
            return Ok(0);
        }
        let end = start.saturating_add(buffer.len()).min(self.mmap.len());
        let n = end - start;
        buffer[..n].copy_from_slice(&self.mmap[start..end]);
        Ok(n)
    }

    #[inline]
    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }
}

/// Preferred opener: mmap when possible, buffered file reads otherwise.
pub enum Source {
    Mmap(MmapSource),
    File(FileSource),
}

impl Source {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match MmapSource::open(path) {
            Ok(s) => Ok(Source::Mmap(s)),
            Err(_) => Ok(Source::File(FileSource::open(path)?)),
        }
    }
}

impl ByteSource for Source {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        match self {
            Source::Mmap(s) => s.read_at(offset, buffer),
            Source::File(s) => s.read_at(offset, buffer),
        }
    }

    #[inline]
    fn len(&self) -> u64 {
        match self {
            Source::Mmap(s) => s.len(),
            Source::File(s) => s.len(),
        }
    }
}

/// In-memory source, mainly for tests and fully-buffered carving.
impl ByteSource for Vec<u8> {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        let start = offset as usize;
        if start >= Vec::len(self) {
            return Ok(0);
        }
        let end = start.saturating_add(buffer.len()).min(Vec::len(self));
        let n = end - start;
        buffer[..n].copy_from_slice(&self[start..end]);
        Ok(n)
    }

    #[inline]
    fn len(&self) -> u64 {
        Vec::len(self) as u64
    }
}
