//! Restore a manifest into a local directory tree.
//!
//! Three phases, in order: directories are created first (the scanner emits
//! them before their children, so `mkdir -p` order holds), then file
//! contents and symlinks, then modes and modification times. Permission
//! errors during metadata application are warnings, not failures.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use rayon::prelude::*;
use tracing::warn;

use crate::cancel::CancelFlag;
use crate::chunker;
use crate::compress;
use crate::error::{Result, SkiffError};
use crate::manifest::{Entry, EntryKind, Manifest};

/// Capability interface for block retrieval, so the engine is testable
/// against in-memory fakes. Returns the stored (possibly compressed) bytes.
pub trait BlockFetcher: Send + Sync {
    fn fetch_block(&self, cid: &str) -> Result<Vec<u8>>;
}

/// Default size of the download worker pool.
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 4;

#[derive(Debug, Default)]
pub struct RestoreStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub bytes_written: u64,
}

pub struct Restorer<'a> {
    fetcher: &'a dyn BlockFetcher,
    concurrency: usize,
}

impl<'a> Restorer<'a> {
    pub fn new(fetcher: &'a dyn BlockFetcher) -> Self {
        Self {
            fetcher,
            concurrency: DEFAULT_DOWNLOAD_WORKERS,
        }
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    /// Restore `manifest` under `output`. A cancelled restore leaves partial
    /// files on disk; the caller is responsible for cleanup on retry.
    pub fn restore(
        &self,
        manifest: &Manifest,
        output: &Path,
        cancel: &CancelFlag,
    ) -> Result<RestoreStats> {
        std::fs::create_dir_all(output)?;
        let root = output
            .canonicalize()
            .map_err(|e| SkiffError::Other(format!("invalid destination {}: {e}", output.display())))?;

        let mut stats = RestoreStats::default();

        // Resolve and validate every target path once.
        let mut targets: HashMap<&str, PathBuf> = HashMap::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            let rel = sanitize_entry_path(&entry.path)?;
            targets.insert(entry.path.as_str(), root.join(rel));
        }

        // Phase 1: directories, with their mode bits.
        for entry in &manifest.entries {
            if entry.kind != EntryKind::Dir {
                continue;
            }
            let target = &targets[entry.path.as_str()];
            std::fs::create_dir_all(target)?;
            apply_mode(target, entry.mode);
            stats.dirs += 1;
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .build()
            .map_err(|e| SkiffError::Other(format!("failed to build download pool: {e}")))?;

        // Phase 2: file contents and symlinks.
        for entry in &manifest.entries {
            if cancel.is_cancelled() {
                return Err(SkiffError::Cancelled);
            }
            let target = &targets[entry.path.as_str()];
            match entry.kind {
                EntryKind::File => {
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    stats.bytes_written += self.restore_file(&pool, entry, target)?;
                    stats.files += 1;
                }
                EntryKind::Symlink => {
                    create_symlink(entry, target)?;
                    stats.symlinks += 1;
                }
                EntryKind::Dir => {}
            }
        }

        // Phase 3: modes and mtimes. Symlink mtime is not portable and is
        // skipped along with symlink modes.
        for entry in &manifest.entries {
            if entry.kind == EntryKind::Symlink {
                continue;
            }
            let target = &targets[entry.path.as_str()];
            apply_mode(target, entry.mode);
            let (secs, nanos) = split_unix_nanos(entry.mtime);
            let mtime = filetime::FileTime::from_unix_time(secs, nanos);
            if let Err(e) = filetime::set_file_mtime(target, mtime) {
                warn!(path = %entry.path, error = %e, "failed to set mtime");
            }
        }

        Ok(stats)
    }

    /// Download the blocks of one file in parallel and write them to the
    /// destination in block-list order.
    fn restore_file(&self, pool: &rayon::ThreadPool, entry: &Entry, target: &Path) -> Result<u64> {
        if entry.blocks.is_empty() {
            std::fs::write(target, [])?;
            return Ok(0);
        }

        // Ordered collect keeps slot `i` at index `i` regardless of which
        // worker finishes first.
        let blocks: Vec<Vec<u8>> = pool.install(|| {
            entry
                .blocks
                .par_iter()
                .enumerate()
                .map(|(index, cid)| -> Result<Vec<u8>> {
                    let stored = self.fetcher.fetch_block(cid)?;
                    let expected = chunker::block_original_size(entry.size, index) as usize;
                    compress::decompress(&stored, expected)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut file = std::fs::File::create(target)?;
        let mut written: u64 = 0;
        for block in &blocks {
            file.write_all(block)?;
            written += block.len() as u64;
        }

        if written != entry.size {
            return Err(SkiffError::Integrity(format!(
                "{}: restored {written} bytes, manifest declares {}",
                entry.path, entry.size
            )));
        }
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Reject absolute paths and parent-directory traversal before joining a
/// manifest path onto the destination root.
fn sanitize_entry_path(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(SkiffError::Other(format!(
            "refusing to restore absolute path: {raw}"
        )));
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SkiffError::Other(format!(
                    "refusing to restore unsafe path: {raw}"
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(SkiffError::Other(format!(
            "refusing to restore empty path: {raw}"
        )));
    }
    Ok(out)
}

fn apply_mode(target: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode))
        {
            warn!(path = %target.display(), error = %e, "failed to set permissions");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (target, mode);
    }
}

#[cfg(unix)]
fn create_symlink(entry: &Entry, target: &Path) -> Result<()> {
    let link_target = entry
        .link_target
        .as_deref()
        .ok_or_else(|| SkiffError::Other(format!("symlink entry without target: {}", entry.path)))?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(target);
    std::os::unix::fs::symlink(link_target, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_symlink(entry: &Entry, _target: &Path) -> Result<()> {
    warn!(path = %entry.path, "symlinks are not restored on this platform");
    Ok(())
}

fn split_unix_nanos(total_nanos: i64) -> (i64, u32) {
    let secs = total_nanos.div_euclid(1_000_000_000);
    let nanos = total_nanos.rem_euclid(1_000_000_000) as u32;
    (secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemoryFetcher {
        blocks: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryFetcher {
        fn new() -> Self {
            Self {
                blocks: Mutex::new(HashMap::new()),
            }
        }

        /// Store `content` as chunked, compressed blocks and return the CID list.
        fn insert_file(&self, content: &[u8]) -> Vec<String> {
            let mut cids = Vec::new();
            for window in content.chunks(chunker::CHUNK_SIZE) {
                let cid = crate::cid::generate(window);
                let data = compress::compress(window);
                self.blocks.lock().unwrap().insert(cid.clone(), data);
                cids.push(cid);
            }
            cids
        }
    }

    impl BlockFetcher for MemoryFetcher {
        fn fetch_block(&self, cid: &str) -> Result<Vec<u8>> {
            self.blocks
                .lock()
                .unwrap()
                .get(cid)
                .cloned()
                .ok_or_else(|| SkiffError::NotFound(format!("block {cid}")))
        }
    }

    fn manifest_with(entries: Vec<Entry>) -> Manifest {
        let mut m = Manifest::new(BTreeMap::new(), "/src");
        for e in entries {
            m.push(e);
        }
        m
    }

    #[test]
    fn restores_file_contents_and_structure() {
        let fetcher = MemoryFetcher::new();
        let content = b"the quick brown fox jumps over the lazy dog".repeat(64);
        let cids = fetcher.insert_file(&content);

        let mut file_entry = Entry::file("docs/fox.txt".into(), 0o640, 1_700_000_000_000_000_000, content.len() as u64);
        file_entry.blocks = cids;
        let manifest = manifest_with(vec![
            Entry::dir("docs".into(), 0o750, 1_700_000_000_000_000_000),
            file_entry,
        ]);

        let out = tempfile::tempdir().unwrap();
        let stats = Restorer::new(&fetcher)
            .restore(&manifest, out.path(), &CancelFlag::new())
            .unwrap();

        assert_eq!(stats.dirs, 1);
        assert_eq!(stats.files, 1);
        let restored = std::fs::read(out.path().join("docs/fox.txt")).unwrap();
        assert_eq!(restored, content);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(out.path().join("docs/fox.txt"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o640);
        }
    }

    #[test]
    fn restores_empty_file() {
        let fetcher = MemoryFetcher::new();
        let manifest = manifest_with(vec![Entry::file("empty".into(), 0o644, 0, 0)]);

        let out = tempfile::tempdir().unwrap();
        Restorer::new(&fetcher)
            .restore(&manifest, out.path(), &CancelFlag::new())
            .unwrap();

        let meta = std::fs::metadata(out.path().join("empty")).unwrap();
        assert_eq!(meta.len(), 0);
    }

    #[test]
    fn restores_mtime() {
        let fetcher = MemoryFetcher::new();
        let mtime_ns: i64 = 1_600_000_000_123_456_789;
        let manifest = manifest_with(vec![Entry::file("f".into(), 0o644, mtime_ns, 0)]);

        let out = tempfile::tempdir().unwrap();
        Restorer::new(&fetcher)
            .restore(&manifest, out.path(), &CancelFlag::new())
            .unwrap();

        let meta = std::fs::metadata(out.path().join("f")).unwrap();
        let got = filetime::FileTime::from_last_modification_time(&meta);
        assert_eq!(got.unix_seconds(), 1_600_000_000);
    }

    #[cfg(unix)]
    #[test]
    fn restores_symlink() {
        let fetcher = MemoryFetcher::new();
        let manifest = manifest_with(vec![Entry::symlink(
            "ln".into(),
            0o777,
            0,
            "somewhere/else".into(),
        )]);

        let out = tempfile::tempdir().unwrap();
        let stats = Restorer::new(&fetcher)
            .restore(&manifest, out.path(), &CancelFlag::new())
            .unwrap();

        assert_eq!(stats.symlinks, 1);
        let target = std::fs::read_link(out.path().join("ln")).unwrap();
        assert_eq!(target, PathBuf::from("somewhere/else"));
    }

    #[test]
    fn missing_block_fails_restore() {
        let fetcher = MemoryFetcher::new();
        let mut entry = Entry::file("f".into(), 0o644, 0, 10);
        entry.blocks = vec!["bafy-missing".into()];
        let manifest = manifest_with(vec![entry]);

        let out = tempfile::tempdir().unwrap();
        let err = Restorer::new(&fetcher)
            .restore(&manifest, out.path(), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, SkiffError::NotFound(_)));
    }

    #[test]
    fn size_mismatch_is_integrity_error() {
        let fetcher = MemoryFetcher::new();
        let cids = fetcher.insert_file(b"short");
        let mut entry = Entry::file("f".into(), 0o644, 0, 5);
        entry.blocks = cids;
        // Lie about the size: decompression is pinned to the declared size.
        entry.size = 9999;
        let manifest = manifest_with(vec![entry]);

        let out = tempfile::tempdir().unwrap();
        let err = Restorer::new(&fetcher)
            .restore(&manifest, out.path(), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(
            err,
            SkiffError::Decompression(_) | SkiffError::Integrity(_)
        ));
    }

    #[test]
    fn rejects_traversal_paths() {
        assert!(sanitize_entry_path("../etc/passwd").is_err());
        assert!(sanitize_entry_path("/abs/path").is_err());
        assert!(sanitize_entry_path("a/../../b").is_err());
        assert!(sanitize_entry_path("").is_err());
        assert_eq!(
            sanitize_entry_path("a/./b").unwrap(),
            PathBuf::from("a/b")
        );
    }

    #[test]
    fn split_unix_nanos_handles_negative_values() {
        let (secs, nanos) = split_unix_nanos(-1);
        assert_eq!(secs, -1);
        assert_eq!(nanos, 999_999_999);
    }
}
