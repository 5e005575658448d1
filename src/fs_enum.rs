use std::io;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

// Directory listing and path resolution for served and local directories

/// Names of the regular, non-hidden files directly inside `dir`, sorted.
/// Symlinks count when they point at a regular file inside `dir`, the same
/// rule `servable_file` applies.
pub fn list_files(dir: &Path) -> io::Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        ));
    }
    let root = dir.canonicalize()?;
    let mut names = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        // Dangling links and racing deletes are simply not listed
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path_is_symlink() && !points_under(&root, entry.path()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        names.push(name.into_owned());
    }
    Ok(names)
}

fn points_under(root: &Path, link: &Path) -> bool {
    link.canonicalize().map(|p| p.starts_with(root)).unwrap_or(false)
}

/// Resolve a client-supplied name to a path under `root`.
/// Absolute paths and `..` components are refused, as are symlinks that
/// lead outside the root. `root` must already be canonical.
pub fn resolve_under_root(root: &Path, name: &str) -> Option<PathBuf> {
    if name.contains('\0') {
        return None;
    }
    let mut safe = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(s) => safe.push(s),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if safe.as_os_str().is_empty() {
        return None;
    }
    let joined = root.join(&safe);
    let final_path = if joined.exists() {
        joined.canonicalize().ok()?
    } else {
        joined
    };
    final_path.starts_with(root).then_some(final_path)
}

/// Existing regular file under `root`, or `None` when the name cannot be served.
pub fn servable_file(root: &Path, name: &str) -> Option<PathBuf> {
    resolve_under_root(root, name).filter(|p| p.is_file())
}

/// Final path component of `name`; uploads always land directly in the
/// receiving directory.
pub fn base_name(name: &str) -> Option<String> {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && !n.contains('\0'))
}
