//! Depth-first walk over regular files.
//!
//! Each directory listing is read completely (and its descriptor released)
//! before any of its entries are visited, so a walk of any depth holds at
//! most one listing descriptor from the shared [`DescriptorBudget`].

use std::path::Path;

use tracing::debug;

use c4gh_core::C4ghResult;

use crate::fs::{DescriptorBudget, EntryKind, FileSystem};

/// Visit every regular file under `root` in sorted depth-first order.
///
/// Symlinks and special files are skipped. The first error returned by
/// `visit` stops the walk and is returned as is.
pub fn walk_files<F>(
    fs: &dyn FileSystem,
    root: &Path,
    budget: &DescriptorBudget,
    mut visit: F,
) -> C4ghResult<()>
where
    F: FnMut(&Path) -> C4ghResult<()>,
{
    walk_dir(fs, root, budget, &mut visit)
}

fn walk_dir<F>(
    fs: &dyn FileSystem,
    dir: &Path,
    budget: &DescriptorBudget,
    visit: &mut F,
) -> C4ghResult<()>
where
    F: FnMut(&Path) -> C4ghResult<()>,
{
    let mut entries = {
        let _slot = budget.acquire()?;
        fs.read_dir(dir)?
    };
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    for entry in entries {
        match entry.kind {
            EntryKind::File => visit(&entry.path)?,
            EntryKind::Dir => walk_dir(fs, &entry.path, budget, visit)?,
            EntryKind::Other => debug!(path = %entry.path.display(), "skipping non-regular entry"),
        }
    }
    Ok(())
}

/// Collect every regular file under `root`, in walk order.
pub fn list_files(
    fs: &dyn FileSystem,
    root: &Path,
    budget: &DescriptorBudget,
) -> C4ghResult<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    walk_files(fs, root, budget, |path| {
        files.push(path.to_path_buf());
        Ok(())
    })?;
    Ok(files)
}
