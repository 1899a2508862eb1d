// Scripted Gateway - File Resource Service
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Read / save / delete against a ConfinedPath.
// Provides: directory listing, negotiated file views, optimistic
// concurrency via SHA256 version markers, atomic replace on save.
//
// Save and Delete hold a per-path async mutex across the marker check and
// the write. Two writers with the same marker: one wins, one gets Conflict.

use crate::analysis::Analyzer;
use crate::confine::ConfinedPath;
use crate::error::{GatewayError, GatewayResult};
use crate::negotiate::{Accept, ContentKind};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

// ============================================================================
// TYPES
// ============================================================================

/// Content hash of a file, rendered as a quoted ETag on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionMarker(String);

impl VersionMarker {
    pub fn of(data: &[u8]) -> Self {
        Self(sha256_hex(data))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `"<hex>"`
    pub fn to_etag(&self) -> String {
        format!("\"{}\"", self.0)
    }

    /// Accepts quoted, weak (`W/"..."`) or bare values.
    pub fn from_etag(value: &str) -> Option<Self> {
        let v = value.trim();
        let v = v.strip_prefix("W/").unwrap_or(v);
        let v = v.trim_matches('"');
        if v.is_empty() {
            None
        } else {
            Some(Self(v.to_string()))
        }
    }
}

/// What the client believes about the resource before a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// No file exists (`If-None-Match: *`, or no precondition at all)
    Absent,
    /// Some file exists, any version (`If-Match: *`)
    Exists,
    /// The file is at exactly this version (`If-Match: "<marker>"`)
    Version(VersionMarker),
}

impl Expect {
    /// Build from the If-Match header. Without one the client is creating
    /// a file, which is also what `If-None-Match: *` says.
    pub fn from_if_match(if_match: Option<&str>) -> Self {
        match if_match.map(str::trim) {
            Some("*") => Expect::Exists,
            Some(value) => match VersionMarker::from_etag(value) {
                Some(marker) => Expect::Version(marker),
                // Unusable marker never matches
                None => Expect::Version(VersionMarker(String::new())),
            },
            None => Expect::Absent,
        }
    }

    fn check(&self, current: Option<&VersionMarker>) -> GatewayResult<()> {
        match (self, current) {
            (Expect::Absent, None) => Ok(()),
            (Expect::Exists, Some(_)) => Ok(()),
            (Expect::Version(want), Some(have)) if want == have => Ok(()),
            _ => Err(GatewayError::Conflict),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Result of a read, one variant per content kind
#[derive(Debug, Clone, PartialEq)]
pub enum Representation {
    Raw { bytes: Vec<u8>, version: VersionMarker },
    Directory(Vec<DirEntry>),
    Lint(Value),
    Dependencies(Value),
}

impl Representation {
    pub fn kind(&self) -> ContentKind {
        match self {
            Representation::Raw { .. } => ContentKind::Raw,
            Representation::Directory(_) => ContentKind::Directory,
            Representation::Lint(_) => ContentKind::Lint,
            Representation::Dependencies(_) => ContentKind::Dependencies,
        }
    }
}

// ============================================================================
// FILE SERVICE
// ============================================================================

pub struct FileService {
    analyzer: Arc<dyn Analyzer>,
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileService {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self { analyzer, locks: Arc::new(DashMap::new()) }
    }

    /// Read a file or directory, choosing the representation from `accept`.
    pub async fn read(&self, path: &ConfinedPath, accept: &Accept) -> GatewayResult<Representation> {
        let meta = match tokio::fs::metadata(path.absolute()).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(GatewayError::NotFound),
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            return Ok(Representation::Directory(list_dir(path).await?));
        }
        if !meta.is_file() {
            return Err(GatewayError::NotFound);
        }

        let kind = accept.select_file_kind().ok_or(GatewayError::NotAcceptable)?;
        let absolute = path.absolute().to_path_buf();

        match kind {
            ContentKind::Raw => {
                let (bytes, version) = blocking(move || {
                    let bytes = read_file(&absolute)?;
                    let version = VersionMarker::of(&bytes);
                    Ok((bytes, version))
                })
                .await?;
                Ok(Representation::Raw { bytes, version })
            }
            ContentKind::Lint | ContentKind::Dependencies => {
                let analyzer = Arc::clone(&self.analyzer);
                let relative = path.relative().to_path_buf();
                blocking(move || {
                    let bytes = read_file(&absolute)?;
                    let source = String::from_utf8(bytes).map_err(|_| GatewayError::NotAcceptable)?;
                    Ok(if kind == ContentKind::Lint {
                        Representation::Lint(analyzer.lint(&relative, &source))
                    } else {
                        Representation::Dependencies(analyzer.dependencies(&relative, &source))
                    })
                })
                .await
            }
            ContentKind::Directory => Err(GatewayError::NotAcceptable),
        }
    }

    /// Replace the file's content if `expect` still holds. Returns the new marker.
    pub async fn save(
        &self,
        path: &ConfinedPath,
        content: Vec<u8>,
        expect: &Expect,
    ) -> GatewayResult<VersionMarker> {
        if path.is_root() {
            return Err(GatewayError::NotFound);
        }

        let absolute = path.absolute().to_path_buf();
        let expect = expect.clone();
        self.with_path_lock(&absolute, move |abs| {
            let current = current_version(abs)?;
            expect.check(current.as_ref())?;
            write_atomic(abs, &content)?;
            Ok(VersionMarker::of(&content))
        })
        .await
    }

    /// Remove a file if `expect` still holds. Directories are not deleted.
    pub async fn delete(&self, path: &ConfinedPath, expect: &Expect) -> GatewayResult<()> {
        if path.is_root() {
            return Err(GatewayError::NotFound);
        }

        let absolute = path.absolute().to_path_buf();
        let expect = expect.clone();
        self.with_path_lock(&absolute, move |abs| {
            let current = current_version(abs)?.ok_or(GatewayError::NotFound)?;
            expect.check(Some(&current))?;
            std::fs::remove_file(abs).map_err(map_not_found)
        })
        .await
    }

    /// Paths currently holding a write lock entry
    pub fn locked_paths(&self) -> usize {
        self.locks.len()
    }

    /// Runs `op` on the blocking pool while holding the path's lock. The
    /// lease travels with the blocking task, so a dropped request cannot
    /// release the lock before the disk work is done.
    async fn with_path_lock<T, F>(&self, absolute: &Path, op: F) -> GatewayResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> GatewayResult<T> + Send + 'static,
    {
        let mut lease = PathLease { locks: Arc::clone(&self.locks), path: absolute.to_path_buf(), guard: None };
        let lock = self
            .locks
            .entry(absolute.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lease.guard = Some(lock.lock_owned().await);

        blocking(move || {
            let lease = lease;
            op(&lease.path)
        })
        .await
    }
}

/// Held lock on one path. Dropping it unlocks and prunes the table entry
/// once nobody else refers to it.
struct PathLease {
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathLease {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.remove_if(&self.path, |_, lock| Arc::strong_count(lock) == 1);
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

async fn list_dir(path: &ConfinedPath) -> GatewayResult<Vec<DirEntry>> {
    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(path.absolute()).await?;

    while let Some(entry) = dir.next_entry().await? {
        let file_type = entry.file_type().await?;
        let kind = if file_type.is_symlink() {
            // Links are listed by what they point at, and only if that stays inside the root
            match tokio::fs::canonicalize(entry.path()).await {
                Ok(target) if target.starts_with(path.root()) => match tokio::fs::metadata(&target).await {
                    Ok(m) if m.is_dir() => EntryKind::Directory,
                    Ok(m) if m.is_file() => EntryKind::File,
                    _ => continue,
                },
                _ => continue,
            }
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            continue;
        };

        entries.push(DirEntry { name: entry.file_name().to_string_lossy().to_string(), kind });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Marker of the file on disk. None when absent; NotFound for non-files.
fn current_version(path: &Path) -> GatewayResult<Option<VersionMarker>> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(VersionMarker::of(&read_file(path)?))),
        Ok(_) => Err(GatewayError::NotFound),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write to a temp file beside the target, then rename over it.
/// The parent must already exist: no implicit directory creation.
fn write_atomic(path: &Path, content: &[u8]) -> GatewayResult<()> {
    let parent = path.parent().ok_or(GatewayError::NotFound)?;
    if !parent.is_dir() {
        return Err(GatewayError::NotFound);
    }

    let existing = std::fs::metadata(path).ok().map(|m| m.permissions());

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;

    match existing {
        Some(perms) => std::fs::set_permissions(tmp.path(), perms)?,
        None => set_default_permissions(tmp.path())?,
    }

    tmp.persist(path).map_err(|e| GatewayError::Io(e.error))?;
    Ok(())
}

#[cfg(unix)]
fn set_default_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_default_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn read_file(path: &Path) -> GatewayResult<Vec<u8>> {
    std::fs::read(path).map_err(map_not_found)
}

fn map_not_found(e: std::io::Error) -> GatewayError {
    if e.kind() == std::io::ErrorKind::NotFound {
        GatewayError::NotFound
    } else {
        GatewayError::Io(e)
    }
}

async fn blocking<T, F>(f: F) -> GatewayResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> GatewayResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GatewayError::Internal(format!("file task failed: {}", e)))?
}

/// SHA256 hash as hex string
fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SourceAnalyzer;
    use crate::confine::resolve;
    use tempfile::{tempdir, TempDir};

    fn project() -> TempDir {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/lib")).unwrap();
        std::fs::write(dir.path().join("src/main.js"), b"var x = require('./lib/util');\n").unwrap();
        std::fs::write(dir.path().join("README"), b"readme").unwrap();
        dir
    }

    fn service() -> FileService {
        FileService::new(Arc::new(SourceAnalyzer))
    }

    fn raw() -> Accept {
        Accept::parse(Some("application/vnd.scripted.raw"))
    }

    #[test]
    fn etag_round_trip() {
        let marker = VersionMarker::of(b"hello");
        assert_eq!(marker.as_str().len(), 64);
        assert_eq!(VersionMarker::from_etag(&marker.to_etag()), Some(marker.clone()));
        assert_eq!(VersionMarker::from_etag(&format!("W/{}", marker.to_etag())), Some(marker));
        assert_eq!(VersionMarker::from_etag("\"\""), None);
    }

    #[test]
    fn expect_from_if_match() {
        assert_eq!(Expect::from_if_match(None), Expect::Absent);
        assert_eq!(Expect::from_if_match(Some("*")), Expect::Exists);
        assert_eq!(
            Expect::from_if_match(Some("\"abc\"")),
            Expect::Version(VersionMarker("abc".into()))
        );
        assert_eq!(Expect::from_if_match(Some("\"\"")), Expect::Version(VersionMarker(String::new())));
    }

    #[tokio::test]
    async fn read_raw_returns_bytes_and_marker() {
        let dir = project();
        let path = resolve(dir.path(), "README").unwrap();
        match service().read(&path, &raw()).await.unwrap() {
            Representation::Raw { bytes, version } => {
                assert_eq!(bytes, b"readme");
                assert_eq!(version, VersionMarker::of(b"readme"));
            }
            other => panic!("expected raw, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_directory_is_sorted_and_tagged() {
        let dir = project();
        let svc = service();
        let path = resolve(dir.path(), "").unwrap();

        let first = svc.read(&path, &raw()).await.unwrap();
        let second = svc.read(&path, &raw()).await.unwrap();
        assert_eq!(first, second);

        assert_eq!(
            first,
            Representation::Directory(vec![
                DirEntry { name: "README".into(), kind: EntryKind::File },
                DirEntry { name: "src".into(), kind: EntryKind::Directory },
            ])
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn listing_hides_links_out_of_root() {
        let outside = tempdir().unwrap();
        let dir = project();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("src"), dir.path().join("alias")).unwrap();

        let path = resolve(dir.path(), "").unwrap();
        let Representation::Directory(entries) = service().read(&path, &raw()).await.unwrap() else {
            panic!("expected directory");
        };
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["README", "alias", "src"]);
        assert_eq!(entries[1].kind, EntryKind::Directory);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = project();
        let path = resolve(dir.path(), "nope.js").unwrap();
        assert!(matches!(service().read(&path, &raw()).await, Err(GatewayError::NotFound)));
    }

    #[tokio::test]
    async fn unacceptable_file_kind() {
        let dir = project();
        let path = resolve(dir.path(), "README").unwrap();
        let accept = Accept::parse(Some("text/html"));
        assert!(matches!(service().read(&path, &accept).await, Err(GatewayError::NotAcceptable)));
    }

    #[tokio::test]
    async fn lint_and_dependency_views() {
        let dir = project();
        let svc = service();
        let path = resolve(dir.path(), "src/main.js").unwrap();

        let lint = svc.read(&path, &Accept::parse(Some("application/vnd.scripted.lint"))).await.unwrap();
        let Representation::Lint(value) = lint else { panic!("expected lint") };
        assert_eq!(value["count"], 0);

        let deps = svc
            .read(&path, &Accept::parse(Some("application/vnd.scripted.dependencies")))
            .await
            .unwrap();
        let Representation::Dependencies(value) = deps else { panic!("expected dependencies") };
        assert_eq!(value["dependencies"][0]["ref"], "./lib/util");
    }

    #[tokio::test]
    async fn binary_file_has_no_lint_view() {
        let dir = project();
        std::fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, 0x00]).unwrap();
        let path = resolve(dir.path(), "blob.bin").unwrap();
        let accept = Accept::parse(Some("application/vnd.scripted.lint"));
        assert!(matches!(service().read(&path, &accept).await, Err(GatewayError::NotAcceptable)));
    }

    #[tokio::test]
    async fn save_round_trip_then_stale_conflict() {
        let dir = project();
        let svc = service();
        let path = resolve(dir.path(), "README").unwrap();
        let original = Expect::Version(VersionMarker::of(b"readme"));

        let marker = svc.save(&path, b"updated".to_vec(), &original).await.unwrap();
        assert_eq!(marker, VersionMarker::of(b"updated"));

        match svc.read(&path, &raw()).await.unwrap() {
            Representation::Raw { bytes, version } => {
                assert_eq!(bytes, b"updated");
                assert_eq!(version, marker);
            }
            other => panic!("expected raw, got {:?}", other),
        }

        let stale = svc.save(&path, b"again".to_vec(), &original).await;
        assert!(matches!(stale, Err(GatewayError::Conflict)));
        assert_eq!(std::fs::read(dir.path().join("README")).unwrap(), b"updated");
    }

    #[tokio::test]
    async fn save_new_file_requires_absent() {
        let dir = project();
        let svc = service();
        let path = resolve(dir.path(), "src/new.js").unwrap();

        svc.save(&path, b"one".to_vec(), &Expect::Absent).await.unwrap();
        let second = svc.save(&path, b"two".to_vec(), &Expect::Absent).await;
        assert!(matches!(second, Err(GatewayError::Conflict)));

        svc.save(&path, b"three".to_vec(), &Expect::Exists).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("src/new.js")).unwrap(), b"three");
    }

    #[tokio::test]
    async fn save_without_parent_is_not_found() {
        let dir = project();
        let path = resolve(dir.path(), "missing/dir/file.js").unwrap();
        let result = service().save(&path, b"x".to_vec(), &Expect::Absent).await;
        assert!(matches!(result, Err(GatewayError::NotFound)));
        assert!(!dir.path().join("missing").exists());
    }

    #[tokio::test]
    async fn save_over_directory_is_not_found() {
        let dir = project();
        let path = resolve(dir.path(), "src").unwrap();
        let result = service().save(&path, b"x".to_vec(), &Expect::Exists).await;
        assert!(matches!(result, Err(GatewayError::NotFound)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn save_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = project();
        let file = dir.path().join("run.sh");
        std::fs::write(&file, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path = resolve(dir.path(), "run.sh").unwrap();
        service()
            .save(&path, b"#!/bin/sh\necho hi\n".to_vec(), &Expect::Exists)
            .await
            .unwrap();

        let mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_one_wins() {
        let dir = project();
        let svc = Arc::new(service());
        let path = resolve(dir.path(), "README").unwrap();
        let expect = Expect::Version(VersionMarker::of(b"readme"));

        let mut handles = Vec::new();
        for i in 0..8 {
            let svc = Arc::clone(&svc);
            let path = path.clone();
            let expect = expect.clone();
            handles.push(tokio::spawn(async move {
                svc.save(&path, format!("writer {}", i).into_bytes(), &expect).await
            }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(GatewayError::Conflict) => conflicts += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(svc.locked_paths(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aborted_writer_holds_lock_until_disk_work_ends() {
        let dir = project();
        let svc = Arc::new(service());
        let path = resolve(dir.path(), "README").unwrap();
        let original = VersionMarker::of(b"readme");

        let (checked_tx, checked_rx) = tokio::sync::oneshot::channel();
        let slow_writer = {
            let svc = Arc::clone(&svc);
            let absolute = path.absolute().to_path_buf();
            let expect = Expect::Version(original.clone());
            tokio::spawn(async move {
                svc.with_path_lock(&absolute, move |p| {
                    expect.check(current_version(p)?.as_ref())?;
                    let _ = checked_tx.send(());
                    std::thread::sleep(std::time::Duration::from_millis(200));
                    write_atomic(p, b"A")
                })
                .await
            })
        };

        // Marker checked, write still pending: drop the request
        checked_rx.await.unwrap();
        slow_writer.abort();

        let result = svc.save(&path, b"B".to_vec(), &Expect::Version(original)).await;
        assert!(matches!(result, Err(GatewayError::Conflict)), "{:?}", result);
        assert_eq!(std::fs::read(path.absolute()).unwrap(), b"A");
        assert_eq!(svc.locked_paths(), 0);
    }

    #[tokio::test]
    async fn delete_checks_marker() {
        let dir = project();
        let svc = service();
        let path = resolve(dir.path(), "README").unwrap();

        let stale = Expect::Version(VersionMarker::of(b"something else"));
        assert!(matches!(svc.delete(&path, &stale).await, Err(GatewayError::Conflict)));
        assert!(dir.path().join("README").exists());

        let current = Expect::Version(VersionMarker::of(b"readme"));
        svc.delete(&path, &current).await.unwrap();
        assert!(!dir.path().join("README").exists());

        assert!(matches!(svc.delete(&path, &current).await, Err(GatewayError::NotFound)));
    }

    #[tokio::test]
    async fn delete_directory_is_not_found() {
        let dir = project();
        let path = resolve(dir.path(), "src/lib").unwrap();
        assert!(matches!(service().delete(&path, &Expect::Exists).await, Err(GatewayError::NotFound)));
        assert!(dir.path().join("src/lib").is_dir());
    }
}
