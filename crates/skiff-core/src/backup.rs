//! Backup creation: scan, incremental diff against a prior manifest, and
//! bounded concurrent upload with dedup probing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::cancel::CancelFlag;
use crate::chunker::FileChunks;
use crate::error::{Result, SkiffError};
use crate::manifest::{Entry, EntryKind, Manifest};
use crate::scanner::Scanner;

/// Capability interface for the dedup probe and block upload, so the engine
/// is testable against in-memory fakes.
pub trait BlockUploader: Send + Sync {
    fn block_exists(&self, cid: &str) -> Result<bool>;
    fn upload_block(&self, cid: &str, data: &[u8], original_size: u64) -> Result<()>;
}

/// Default size of the upload worker pool.
pub const DEFAULT_UPLOAD_WORKERS: usize = 16;

/// Interval between progress reports.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Counters updated atomically by workers; the reporter samples them on a
/// periodic tick.
#[derive(Debug, Default)]
pub struct Progress {
    pub total_files: AtomicU64,
    pub processed_files: AtomicU64,
    /// Files unchanged since the previous manifest (no chunking, no network).
    pub skipped_files: AtomicU64,
    /// Files dropped after soft errors (permission denied).
    pub error_files: AtomicU64,
    pub total_bytes: AtomicU64,
    pub uploaded_bytes: AtomicU64,
    /// Bytes served by dedup instead of upload.
    pub skipped_bytes: AtomicU64,
    pub blocks_uploaded: AtomicU64,
    pub blocks_existing: AtomicU64,
    current_file: Mutex<String>,
}

impl Progress {
    fn set_current_file(&self, path: &str) {
        if let Ok(mut cur) = self.current_file.lock() {
            cur.clear();
            cur.push_str(path);
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total_files: self.total_files.load(Relaxed),
            processed_files: self.processed_files.load(Relaxed),
            skipped_files: self.skipped_files.load(Relaxed),
            error_files: self.error_files.load(Relaxed),
            total_bytes: self.total_bytes.load(Relaxed),
            uploaded_bytes: self.uploaded_bytes.load(Relaxed),
            skipped_bytes: self.skipped_bytes.load(Relaxed),
            blocks_uploaded: self.blocks_uploaded.load(Relaxed),
            blocks_existing: self.blocks_existing.load(Relaxed),
            current_file: self
                .current_file
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub total_files: u64,
    pub processed_files: u64,
    pub skipped_files: u64,
    pub error_files: u64,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub skipped_bytes: u64,
    pub blocks_uploaded: u64,
    pub blocks_existing: u64,
    pub current_file: String,
}

/// Final statistics for one backup run.
#[derive(Debug, Clone, Default)]
pub struct BackupStats {
    pub total_files: u64,
    pub skipped_files: u64,
    pub error_files: u64,
    pub uploaded_bytes: u64,
    pub skipped_bytes: u64,
    pub blocks_uploaded: u64,
    pub blocks_existing: u64,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct BackupOutcome {
    pub manifest: Manifest,
    pub stats: BackupStats,
}

// ---------------------------------------------------------------------------
// Creator
// ---------------------------------------------------------------------------

pub struct Creator<'a> {
    uploader: &'a dyn BlockUploader,
    concurrency: usize,
    excludes: Vec<String>,
}

impl<'a> Creator<'a> {
    pub fn new(uploader: &'a dyn BlockUploader) -> Self {
        Self {
            uploader,
            concurrency: DEFAULT_UPLOAD_WORKERS,
            excludes: Vec::new(),
        }
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    pub fn with_excludes(mut self, patterns: &[String]) -> Self {
        self.excludes = patterns.to_vec();
        self
    }

    /// Create a backup of `root`.
    ///
    /// When `prev` is supplied, files whose modification time and size are
    /// unchanged inherit the prior block list verbatim without touching the
    /// chunker or the network. The manifest is assembled in memory and
    /// returned; the caller uploads it once all blocks are known present.
    pub fn create(
        &self,
        root: &Path,
        tags: BTreeMap<String, String>,
        prev: Option<&Manifest>,
        cancel: &CancelFlag,
    ) -> Result<BackupOutcome> {
        let started = Instant::now();
        let abs_root = root
            .canonicalize()
            .map_err(|e| SkiffError::Other(format!("invalid backup root {}: {e}", root.display())))?;

        let progress = Arc::new(Progress::default());

        // Scan the whole tree up front so the worker pool sees a fixed set.
        let scanner = Scanner::new(&abs_root).with_excludes(&self.excludes);
        let mut entries: Vec<Entry> = Vec::new();
        for item in scanner.scan()? {
            match item {
                Ok(entry) => {
                    if entry.kind == EntryKind::File {
                        progress.total_files.fetch_add(1, Relaxed);
                        progress.total_bytes.fetch_add(entry.size, Relaxed);
                    }
                    entries.push(entry);
                }
                Err(e) => warn!("scan error: {e}"),
            }
        }
        info!(
            files = progress.total_files.load(Relaxed),
            bytes = progress.total_bytes.load(Relaxed),
            "scan complete"
        );

        let prev_index = prev.map(|m| m.index_by_path());

        // Partition into entries that are ready as-is (directories, symlinks,
        // unchanged files) and files that need chunking and upload. Original
        // scan order is preserved through the index.
        let mut ready: Vec<(usize, Entry)> = Vec::new();
        let mut work: Vec<(usize, Entry)> = Vec::new();
        for (idx, mut entry) in entries.into_iter().enumerate() {
            if entry.kind != EntryKind::File {
                ready.push((idx, entry));
                continue;
            }
            if let Some(index) = &prev_index {
                if let Some(prev_entry) = index.get(entry.path.as_str()) {
                    if prev_entry.mtime == entry.mtime && prev_entry.size == entry.size {
                        entry.blocks = prev_entry.blocks.clone();
                        progress.processed_files.fetch_add(1, Relaxed);
                        progress.skipped_files.fetch_add(1, Relaxed);
                        progress.skipped_bytes.fetch_add(entry.size, Relaxed);
                        ready.push((idx, entry));
                        continue;
                    }
                }
            }
            work.push((idx, entry));
        }

        let reporter = Reporter::start(progress.clone());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .build()
            .map_err(|e| SkiffError::Other(format!("failed to build upload pool: {e}")))?;

        let first_error: Mutex<Option<SkiffError>> = Mutex::new(None);
        let aborted = AtomicBool::new(false);

        let processed: Vec<(usize, Option<Entry>)> = pool.install(|| {
            work.into_par_iter()
                .map(|(idx, entry)| {
                    if cancel.is_cancelled() || aborted.load(Relaxed) {
                        return (idx, None);
                    }
                    match self.process_file(&abs_root, entry, &progress, cancel) {
                        Ok(done) => (idx, done),
                        Err(e) => {
                            aborted.store(true, Relaxed);
                            if let Ok(mut slot) = first_error.lock() {
                                if slot.is_none() {
                                    *slot = Some(e);
                                }
                            }
                            (idx, None)
                        }
                    }
                })
                .collect()
        });

        reporter.stop();

        if let Ok(mut slot) = first_error.lock() {
            if let Some(err) = slot.take() {
                return Err(err);
            }
        }
        if cancel.is_cancelled() {
            return Err(SkiffError::Cancelled);
        }

        let mut merged = ready;
        merged.extend(
            processed
                .into_iter()
                .filter_map(|(idx, entry)| entry.map(|e| (idx, e))),
        );
        merged.sort_by_key(|(idx, _)| *idx);

        let mut manifest = Manifest::new(tags, abs_root.to_string_lossy());
        for (_, entry) in merged {
            manifest.push(entry);
        }

        let snap = progress.snapshot();
        let stats = BackupStats {
            total_files: snap.total_files,
            skipped_files: snap.skipped_files,
            error_files: snap.error_files,
            uploaded_bytes: snap.uploaded_bytes,
            skipped_bytes: snap.skipped_bytes,
            blocks_uploaded: snap.blocks_uploaded,
            blocks_existing: snap.blocks_existing,
            elapsed: started.elapsed(),
        };

        info!(
            files = stats.total_files,
            unchanged = stats.skipped_files,
            errors = stats.error_files,
            uploaded_bytes = stats.uploaded_bytes,
            dedup_bytes = stats.skipped_bytes,
            "backup complete"
        );

        Ok(BackupOutcome { manifest, stats })
    }

    /// Chunk one file and upload blocks the server does not already have.
    ///
    /// Returns `Ok(None)` for soft failures (permission denied): the file is
    /// logged, counted, and excluded from the manifest. Any other error
    /// aborts the backup.
    fn process_file(
        &self,
        root: &Path,
        mut entry: Entry,
        progress: &Progress,
        cancel: &CancelFlag,
    ) -> Result<Option<Entry>> {
        progress.set_current_file(&entry.path);
        let abs = join_rel(root, &entry.path);

        let chunks = match FileChunks::open(&abs) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Ok(self.soft_skip(&entry, &e, progress));
            }
            Err(e) => return Err(e.into()),
        };

        let mut blocks = Vec::new();
        for item in chunks {
            if cancel.is_cancelled() {
                return Err(SkiffError::Cancelled);
            }
            let chunk = match item {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    return Ok(self.soft_skip(&entry, &e, progress));
                }
                Err(e) => return Err(e.into()),
            };

            if self.uploader.block_exists(&chunk.cid)? {
                progress.blocks_existing.fetch_add(1, Relaxed);
                progress.skipped_bytes.fetch_add(chunk.original_size, Relaxed);
            } else {
                self.uploader
                    .upload_block(&chunk.cid, &chunk.data, chunk.original_size)?;
                progress.blocks_uploaded.fetch_add(1, Relaxed);
                progress
                    .uploaded_bytes
                    .fetch_add(chunk.data.len() as u64, Relaxed);
            }
            blocks.push(chunk.cid);
        }

        entry.blocks = blocks;
        progress.processed_files.fetch_add(1, Relaxed);
        Ok(Some(entry))
    }

    fn soft_skip(&self, entry: &Entry, err: &std::io::Error, progress: &Progress) -> Option<Entry> {
        warn!(path = %entry.path, error = %err, "skipping unreadable file");
        progress.error_files.fetch_add(1, Relaxed);
        progress.processed_files.fetch_add(1, Relaxed);
        None
    }
}

fn join_rel(root: &Path, rel: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in rel.split('/') {
        out.push(part);
    }
    out
}

// ---------------------------------------------------------------------------
// Progress reporter
// ---------------------------------------------------------------------------

struct Reporter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reporter {
    fn start(progress: Arc<Progress>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            loop {
                // Sleep in small steps so shutdown is prompt.
                let tick = Instant::now();
                while tick.elapsed() < REPORT_INTERVAL {
                    if stop_flag.load(Relaxed) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(200));
                }
                let snap = progress.snapshot();
                info!(
                    elapsed_secs = started.elapsed().as_secs(),
                    processed = snap.processed_files,
                    total = snap.total_files,
                    uploaded_bytes = snap.uploaded_bytes,
                    dedup_bytes = snap.skipped_bytes,
                    blocks_uploaded = snap.blocks_uploaded,
                    blocks_existing = snap.blocks_existing,
                    errors = snap.error_files,
                    current = %snap.current_file,
                    "backup progress"
                );
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.stop.store(true, Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[derive(Default)]
    struct MemoryUploader {
        blocks: Mutex<HashMap<String, (Vec<u8>, u64)>>,
        uploads: AtomicU64,
        probes: AtomicU64,
    }

    impl MemoryUploader {
        fn block_count(&self) -> usize {
            self.blocks.lock().unwrap().len()
        }
    }

    impl BlockUploader for MemoryUploader {
        fn block_exists(&self, cid: &str) -> Result<bool> {
            self.probes.fetch_add(1, Relaxed);
            Ok(self.blocks.lock().unwrap().contains_key(cid))
        }

        fn upload_block(&self, cid: &str, data: &[u8], original_size: u64) -> Result<()> {
            self.uploads.fetch_add(1, Relaxed);
            self.blocks
                .lock()
                .unwrap()
                .insert(cid.to_string(), (data.to_vec(), original_size));
            Ok(())
        }
    }

    struct FailingUploader;

    impl BlockUploader for FailingUploader {
        fn block_exists(&self, _cid: &str) -> Result<bool> {
            Err(SkiffError::Transient("probe: connection refused".into()))
        }

        fn upload_block(&self, _cid: &str, _data: &[u8], _original_size: u64) -> Result<()> {
            Err(SkiffError::Transient("upload: connection refused".into()))
        }
    }

    fn name_tags() -> BTreeMap<String, String> {
        [("name".to_string(), "test".to_string())].into_iter().collect()
    }

    #[test]
    fn single_file_backup() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), b"hello\n").unwrap();

        let uploader = MemoryUploader::default();
        let outcome = Creator::new(&uploader)
            .create(tmp.path(), name_tags(), None, &CancelFlag::new())
            .unwrap();

        let entry = outcome.manifest.find_entry("a.txt").unwrap();
        assert_eq!(entry.size, 6);
        assert_eq!(entry.blocks, vec![crate::cid::generate(b"hello\n")]);
        assert_eq!(outcome.stats.blocks_uploaded, 1);
        assert_eq!(uploader.block_count(), 1);
    }

    #[test]
    fn identical_content_is_uploaded_once() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.bin"), vec![9u8; 4096]).unwrap();
        fs::write(tmp.path().join("b.bin"), vec![9u8; 4096]).unwrap();

        let uploader = MemoryUploader::default();
        let outcome = Creator::new(&uploader)
            .with_concurrency(1)
            .create(tmp.path(), name_tags(), None, &CancelFlag::new())
            .unwrap();

        assert_eq!(uploader.block_count(), 1);
        assert_eq!(outcome.stats.blocks_uploaded, 1);
        assert_eq!(outcome.stats.blocks_existing, 1);
    }

    #[test]
    fn unchanged_tree_skips_all_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), b"stable content").unwrap();

        let uploader = MemoryUploader::default();
        let creator = Creator::new(&uploader);
        let first = creator
            .create(tmp.path(), name_tags(), None, &CancelFlag::new())
            .unwrap();
        let second = creator
            .create(
                tmp.path(),
                name_tags(),
                Some(&first.manifest),
                &CancelFlag::new(),
            )
            .unwrap();

        assert_ne!(first.manifest.id, second.manifest.id);
        assert_eq!(second.stats.skipped_files, 1);
        assert_eq!(second.stats.blocks_uploaded, 0);
        assert_eq!(
            first.manifest.find_entry("a.txt").unwrap().blocks,
            second.manifest.find_entry("a.txt").unwrap().blocks,
        );
    }

    #[test]
    fn modified_file_is_rechunked() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.txt");
        fs::write(&path, b"version one").unwrap();

        let uploader = MemoryUploader::default();
        let creator = Creator::new(&uploader);
        let first = creator
            .create(tmp.path(), name_tags(), None, &CancelFlag::new())
            .unwrap();

        fs::write(&path, b"version two!").unwrap();
        // Size differs, so the entry cannot be inherited even if mtime
        // granularity is coarse.
        let second = creator
            .create(
                tmp.path(),
                name_tags(),
                Some(&first.manifest),
                &CancelFlag::new(),
            )
            .unwrap();

        assert_eq!(second.stats.skipped_files, 0);
        assert_eq!(second.stats.blocks_uploaded, 1);
        assert_ne!(
            first.manifest.find_entry("a.txt").unwrap().blocks,
            second.manifest.find_entry("a.txt").unwrap().blocks,
        );
    }

    #[test]
    fn empty_file_has_no_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("empty"), b"").unwrap();

        let uploader = MemoryUploader::default();
        let outcome = Creator::new(&uploader)
            .create(tmp.path(), name_tags(), None, &CancelFlag::new())
            .unwrap();

        let entry = outcome.manifest.find_entry("empty").unwrap();
        assert_eq!(entry.size, 0);
        assert!(entry.blocks.is_empty());
        assert_eq!(uploader.block_count(), 0);
    }

    #[test]
    fn directories_and_symlinks_are_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/x"), b"x").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("sub/x", tmp.path().join("ln")).unwrap();

        let uploader = MemoryUploader::default();
        let outcome = Creator::new(&uploader)
            .create(tmp.path(), name_tags(), None, &CancelFlag::new())
            .unwrap();

        let dir = outcome.manifest.find_entry("sub").unwrap();
        assert_eq!(dir.kind, EntryKind::Dir);
        #[cfg(unix)]
        {
            let link = outcome.manifest.find_entry("ln").unwrap();
            assert_eq!(link.kind, EntryKind::Symlink);
            assert_eq!(link.link_target.as_deref(), Some("sub/x"));
        }
        // Directory entry precedes its child in the manifest.
        let dir_pos = outcome
            .manifest
            .entries
            .iter()
            .position(|e| e.path == "sub")
            .unwrap();
        let child_pos = outcome
            .manifest
            .entries
            .iter()
            .position(|e| e.path == "sub/x")
            .unwrap();
        assert!(dir_pos < child_pos);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_is_elided_and_counted() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let locked = tmp.path().join("locked");
        fs::write(&locked, b"secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users can read anything; nothing to assert then.
        if fs::File::open(&locked).is_ok() {
            return;
        }
        fs::write(tmp.path().join("open"), b"fine").unwrap();

        let uploader = MemoryUploader::default();
        let outcome = Creator::new(&uploader)
            .create(tmp.path(), name_tags(), None, &CancelFlag::new())
            .unwrap();

        assert!(outcome.manifest.find_entry("locked").is_none());
        assert!(outcome.manifest.find_entry("open").is_some());
        assert_eq!(outcome.stats.error_files, 1);
    }

    #[test]
    fn network_error_aborts_backup() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), b"data").unwrap();

        let err = Creator::new(&FailingUploader)
            .create(tmp.path(), name_tags(), None, &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, SkiffError::Transient(_)));
    }

    #[test]
    fn cancelled_backup_returns_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), b"data").unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = Creator::new(&MemoryUploader::default())
            .create(tmp.path(), name_tags(), None, &cancel)
            .unwrap_err();
        assert!(matches!(err, SkiffError::Cancelled));
    }
}
