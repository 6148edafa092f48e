//! Filesystem shim and open-descriptor accounting.
//!
//! Every file the orchestrators touch goes through [`FileSystem`], so hosts
//! with a sandboxed virtual filesystem (and tests) can substitute their own.

use std::cell::Cell;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

/// Kind of a directory entry, as reported without following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Readable and seekable file handle.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

pub trait FileSystem {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write>>;
    /// List one directory. Returns every entry; callers decide what to visit.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// The host operating system's filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl FileSystem for OsFs {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn Write>> {
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let kind = if file_type.is_file() {
                EntryKind::File
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::Other
            };
            entries.push(DirEntry {
                path: entry.path(),
                kind,
            });
        }
        Ok(entries)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// Ceiling on descriptors held open at once by one operation.
///
/// Single-threaded: a `Cell` counter, handed out as RAII guards.
#[derive(Debug)]
pub struct DescriptorBudget {
    limit: usize,
    open: Cell<usize>,
}

impl DescriptorBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            open: Cell::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        self.open.get()
    }

    /// Reserve one descriptor. Fails with an I/O error once the ceiling is hit.
    pub fn acquire(&self) -> io::Result<DescriptorGuard<'_>> {
        let open = self.open.get();
        if open >= self.limit {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("open descriptor limit reached ({})", self.limit),
            ));
        }
        self.open.set(open + 1);
        Ok(DescriptorGuard { budget: self })
    }
}

impl Default for DescriptorBudget {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Releases its descriptor slot on drop.
#[derive(Debug)]
pub struct DescriptorGuard<'b> {
    budget: &'b DescriptorBudget,
}

impl Drop for DescriptorGuard<'_> {
    fn drop(&mut self) {
        self.budget.open.set(self.budget.open.get().saturating_sub(1));
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input.
pub(crate) fn read_up_to<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_enforces_ceiling() {
        let budget = DescriptorBudget::new(2);
        let a = budget.acquire().unwrap();
        let _b = budget.acquire().unwrap();
        assert!(budget.acquire().is_err());
        drop(a);
        assert_eq!(budget.in_use(), 1);
        assert!(budget.acquire().is_ok());
    }

    #[test]
    fn test_default_budget_is_five() {
        assert_eq!(DescriptorBudget::default().limit(), 5);
    }

    #[test]
    fn test_read_up_to_fills_across_short_reads() {
        // Chain yields its two halves in separate reads
        let mut reader = (&b"abc"[..]).chain(&b"defg"[..]);
        let mut buf = [0u8; 5];
        assert_eq!(read_up_to(&mut reader, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"abcde");
        assert_eq!(read_up_to(&mut reader, &mut buf).unwrap(), 2);
    }

    #[test]
    fn test_os_fs_reports_kinds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();

        let mut entries = OsFs.read_dir(dir.path()).unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        let kinds: Vec<EntryKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EntryKind::Dir, EntryKind::File]);
    }
}
