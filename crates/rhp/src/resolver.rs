//! Include reference resolution.
//!
//! An include reference maps to a concrete file through a three-tier search.
//! The root directory is fixed at the start of the outermost `process` call;
//! the working directory follows the file currently being processed.

use std::path::{Path, PathBuf};

/// Resolves an include reference against the working and root directories.
///
/// First match wins:
///
///  1. a reference starting with `/` resolves under the root directory and
///     nowhere else;
///  2. a host-absolute reference resolves to itself;
///  3. otherwise relative to the working directory;
///  4. then, when the working directory differs from the root, relative to
///     the root.
///
/// @return The existing file's path, or `None` when every tier misses.
pub(crate) fn resolve(reference: &str, cwd: &Path, root: &Path) -> Option<PathBuf> {
    if let Some(under_root) = reference.strip_prefix('/') {
        let candidate = root.join(under_root);
        return candidate.is_file().then_some(candidate);
    }

    let as_path = Path::new(reference);
    if as_path.is_absolute() {
        return as_path.is_file().then(|| as_path.to_path_buf());
    }

    let candidate = cwd.join(reference);
    if candidate.is_file() {
        return Some(candidate);
    }

    if cwd != root {
        let candidate = root.join(reference);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[test]
    fn root_relative_does_not_fall_through() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let sub = root.join("pages");
        fs::create_dir(&sub).unwrap();
        fs::write(root.join("header.html"), "x").unwrap();
        fs::write(sub.join("local.html"), "x").unwrap();

        assert_eq!(
            resolve("/header.html", &sub, root),
            Some(root.join("header.html"))
        );
        // `/local.html` only exists under `pages/`, so the root-relative
        // form fails even though tier 3 would have found it.
        assert_eq!(resolve("/local.html", &sub, root), None);
    }

    #[test]
    fn cwd_then_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let sub = root.join("pages");
        fs::create_dir(&sub).unwrap();
        fs::write(root.join("shared.html"), "x").unwrap();
        fs::write(sub.join("local.html"), "x").unwrap();

        assert_eq!(
            resolve("local.html", &sub, root),
            Some(sub.join("local.html"))
        );
        assert_eq!(
            resolve("shared.html", &sub, root),
            Some(root.join("shared.html"))
        );
        assert_eq!(resolve("missing.html", &sub, root), None);
    }

    #[test]
    fn absolute_reference() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("abs.html");
        fs::write(&file, "x").unwrap();

        let elsewhere = tempfile::tempdir().unwrap();
        let reference = file.to_string_lossy().to_string();
        // On Unix an absolute path also starts with '/', so tier 1 applies
        // first and misses; strip the leading slash to exercise tier 2 only
        // when the platform allows, otherwise assert the tier-1 contract.
        let resolved = resolve(&reference, elsewhere.path(), elsewhere.path());
        if reference.starts_with('/') {
            assert_eq!(resolved, None);
        } else {
            assert_eq!(resolved, Some(file.clone()));
        }
    }

    #[test]
    fn relative_navigation() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let sub = root.join("a");
        fs::create_dir(&sub).unwrap();
        fs::write(root.join("up.html"), "x").unwrap();

        assert_eq!(resolve("../up.html", &sub, root), Some(sub.join("../up.html")));
    }
}
