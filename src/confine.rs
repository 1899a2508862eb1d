// Scripted Gateway - Path Confinement
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// The only place a client-supplied path becomes a file-system path.
// Every file and command access goes through resolve(); nothing else
// joins request segments onto a root.
//
// Pipeline:
//   1. Normalize: drop "" and "." segments, reject "..", absolute
//      prefixes, backslashes and NUL outright
//   2. Canonicalize the root (symlinked roots are fine)
//   3. Canonicalize the deepest existing ancestor of the target
//   4. Containment: canonical ancestor must be the root or below it
//
// Every failure is the same PathEscape. Callers never learn which step failed.

use crate::error::{GatewayError, GatewayResult};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// A path verified to lie inside its project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfinedPath {
    root: PathBuf,
    relative: PathBuf,
    absolute: PathBuf,
}

impl ConfinedPath {
    /// Canonical project root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path below the root, after symlink resolution. Empty for the root itself.
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    pub fn absolute(&self) -> &Path {
        &self.absolute
    }

    pub fn is_root(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }

    /// Relative path with forward slashes, for events and payloads
    pub fn display_relative(&self) -> String {
        self.relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Lexical normalization of a client path. No file-system access.
pub fn normalize_relative(relative: &str) -> GatewayResult<PathBuf> {
    if relative.contains('\0') || relative.contains('\\') {
        return Err(GatewayError::PathEscape);
    }
    if relative.starts_with('/') {
        return Err(GatewayError::PathEscape);
    }

    let mut out = PathBuf::new();
    for part in relative.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(GatewayError::PathEscape),
            _ => {
                // Each segment must be exactly one plain component (no drive prefix)
                let mut comps = Path::new(part).components();
                match (comps.next(), comps.next()) {
                    (Some(Component::Normal(c)), None) => out.push(c),
                    _ => return Err(GatewayError::PathEscape),
                }
            }
        }
    }
    Ok(out)
}

/// Confine `relative` to `root`. Blocking: call from a blocking context.
pub fn resolve(root: &Path, relative: &str) -> GatewayResult<ConfinedPath> {
    let normalized = normalize_relative(relative)?;
    let canonical_root = root.canonicalize().map_err(|_| GatewayError::PathEscape)?;
    let target = canonical_root.join(&normalized);

    // Walk up until something exists. The canonical root always does.
    let mut existing: &Path = &target;
    let mut missing: Vec<&OsStr> = Vec::new();
    loop {
        match std::fs::symlink_metadata(existing) {
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                missing.push(existing.file_name().ok_or(GatewayError::PathEscape)?);
                existing = existing.parent().ok_or(GatewayError::PathEscape)?;
            }
            Err(_) => return Err(GatewayError::PathEscape),
        }
    }

    // Broken symlinks fail here
    let mut absolute = existing.canonicalize().map_err(|_| GatewayError::PathEscape)?;
    if !absolute.starts_with(&canonical_root) {
        return Err(GatewayError::PathEscape);
    }
    for part in missing.iter().rev() {
        absolute.push(part);
    }

    let relative = absolute
        .strip_prefix(&canonical_root)
        .map_err(|_| GatewayError::PathEscape)?
        .to_path_buf();

    Ok(ConfinedPath { root: canonical_root, relative, absolute })
}

/// Async wrapper: runs resolve() on the blocking pool.
pub async fn resolve_async(root: PathBuf, relative: String) -> GatewayResult<ConfinedPath> {
    tokio::task::spawn_blocking(move || resolve(&root, &relative))
        .await
        .map_err(|e| GatewayError::Internal(format!("resolver task failed: {}", e)))?
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn project() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/lib")).unwrap();
        std::fs::write(dir.path().join("src/main.js"), b"main").unwrap();
        dir
    }

    #[test]
    fn normalize_collapses_dot_and_empty() {
        assert_eq!(normalize_relative("").unwrap(), PathBuf::new());
        assert_eq!(normalize_relative("src//./main.js").unwrap(), PathBuf::from("src/main.js"));
        assert_eq!(normalize_relative("src/").unwrap(), PathBuf::from("src"));
    }

    #[test]
    fn normalize_rejects_traversal_and_absolute() {
        for bad in ["..", "../etc/passwd", "src/../../x", "src/..", "/etc/passwd", "a\\b", "a\0b"] {
            assert!(
                matches!(normalize_relative(bad), Err(GatewayError::PathEscape)),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn existing_file_resolves_inside_root() {
        let dir = project();
        let confined = resolve(dir.path(), "src/main.js").unwrap();
        assert_eq!(confined.relative(), Path::new("src/main.js"));
        assert!(confined.absolute().starts_with(confined.root()));
        assert_eq!(confined.display_relative(), "src/main.js");
    }

    #[test]
    fn empty_path_is_root() {
        let dir = project();
        let confined = resolve(dir.path(), "").unwrap();
        assert!(confined.is_root());
        assert_eq!(confined.absolute(), confined.root());
    }

    #[test]
    fn missing_targets_still_confine() {
        let dir = project();
        let confined = resolve(dir.path(), "src/new/deeper/file.js").unwrap();
        assert_eq!(confined.relative(), Path::new("src/new/deeper/file.js"));
    }

    #[test]
    fn traversal_rejected_even_when_target_exists() {
        let dir = project();
        let inner = dir.path().join("src");
        // Target exists on disk, still rejected
        assert!(matches!(resolve(&inner, "../src/main.js"), Err(GatewayError::PathEscape)));
        assert!(matches!(resolve(dir.path(), "../../etc/passwd"), Err(GatewayError::PathEscape)));
    }

    #[test]
    fn missing_root_is_escape() {
        let dir = project();
        let gone = dir.path().join("not-here");
        assert!(matches!(resolve(&gone, "x"), Err(GatewayError::PathEscape)));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_rejected() {
        let outside = tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();

        let dir = project();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), dir.path().join("secret")).unwrap();

        assert!(matches!(resolve(dir.path(), "link/secret"), Err(GatewayError::PathEscape)));
        assert!(matches!(resolve(dir.path(), "secret"), Err(GatewayError::PathEscape)));
        // New file beneath an escaping directory link
        assert!(matches!(resolve(dir.path(), "link/new.txt"), Err(GatewayError::PathEscape)));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_within_root_allowed() {
        let dir = project();
        std::os::unix::fs::symlink(dir.path().join("src"), dir.path().join("alias")).unwrap();

        let confined = resolve(dir.path(), "alias/main.js").unwrap();
        assert_eq!(confined.relative(), Path::new("src/main.js"));
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_rejected() {
        let dir = project();
        std::os::unix::fs::symlink(dir.path().join("nowhere"), dir.path().join("dangling")).unwrap();
        assert!(matches!(resolve(dir.path(), "dangling"), Err(GatewayError::PathEscape)));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_root_is_followed() {
        let dir = project();
        let holder = tempdir().unwrap();
        let link = holder.path().join("proj");
        std::os::unix::fs::symlink(dir.path(), &link).unwrap();

        let confined = resolve(&link, "src/main.js").unwrap();
        assert_eq!(confined.relative(), Path::new("src/main.js"));
    }

    proptest! {
        #[test]
        fn any_parent_segment_is_escape(
            before in proptest::collection::vec("[a-z]{1,6}", 0..4),
            after in proptest::collection::vec("[a-z]{1,6}", 0..4),
        ) {
            let dir = project();
            let mut parts = before.clone();
            parts.push("..".to_string());
            parts.extend(after.clone());
            let rel = parts.join("/");
            prop_assert!(matches!(resolve(dir.path(), &rel), Err(GatewayError::PathEscape)));
        }

        #[test]
        fn any_absolute_path_is_escape(parts in proptest::collection::vec("[a-z]{1,6}", 0..4)) {
            let dir = project();
            let rel = format!("/{}", parts.join("/"));
            prop_assert!(matches!(resolve(dir.path(), &rel), Err(GatewayError::PathEscape)));
        }
    }
}
