//! Streaming downloads: whole-tree and per-folder archives (tar.gz or
//! zip) and single-file streams, produced directly from stored blocks.
//!
//! Archives never buffer a whole file: each entry's blocks are fetched,
//! decompressed, and written into the archive writer one at a time. A
//! tar.gz streams straight into the response through a channel-backed
//! writer; zip output needs a seekable sink for its central directory, so
//! it spools to an unnamed temp file and streams from there. A client
//! disconnect closes the channel, which surfaces as a broken pipe at the
//! next write and stops the producer promptly.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use flate2::write::GzEncoder;
use tokio::sync::mpsc::Sender;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use skiff_core::compress;
use skiff_core::manifest::{Entry, EntryKind, Manifest};

use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::Storage;

use super::decode_manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    fn extension(self) -> &'static str {
        match self {
            Self::TarGz => ".tar.gz",
            Self::Zip => ".zip",
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Self::TarGz => "application/gzip",
            Self::Zip => "application/zip",
        }
    }
}

/// Split a trailing archive extension off a path segment. No extension
/// means tar.gz.
fn split_format(raw: &str) -> (&str, ArchiveFormat) {
    if let Some(name) = raw.strip_suffix(".zip") {
        (name, ArchiveFormat::Zip)
    } else if let Some(name) = raw.strip_suffix(".tar.gz") {
        (name, ArchiveFormat::TarGz)
    } else {
        (raw, ArchiveFormat::TarGz)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

async fn fetch_manifest(state: &AppState, id: String) -> Result<Manifest, ApiError> {
    let storage = state.storage();
    let blob = tokio::task::spawn_blocking(move || storage.get_manifest(&id)).await??;
    decode_manifest(&blob)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/download/{id}[.tar.gz|.zip] — the whole tree as an archive.
pub async fn archive(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Response, ApiError> {
    let (id, format) = split_format(&raw_id);
    let manifest = fetch_manifest(&state, id.to_string()).await?;
    Ok(archive_response(&state, manifest, None, format, id))
}

/// GET /api/download/{id}/folder/{*path}[.tar.gz|.zip] — a filtered
/// archive. Entries under the prefix are re-rooted under its basename.
pub async fn folder(
    State(state): State<AppState>,
    Path((id, raw_path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let raw = raw_path.trim_start_matches('/');
    let (folder, format) = split_format(raw);
    if folder.is_empty() {
        return Err(ApiError::BadRequest("empty folder path".into()));
    }

    let manifest = fetch_manifest(&state, id).await?;

    let child_prefix = format!("{folder}/");
    let entries: Vec<Entry> = manifest
        .entries
        .iter()
        .filter(|e| e.path == folder || e.path.starts_with(&child_prefix))
        .cloned()
        .collect();
    if entries.is_empty() {
        return Err(ApiError::NotFound(format!("folder {folder} in backup")));
    }

    let filtered = Manifest {
        id: manifest.id,
        tags: manifest.tags,
        created_at: manifest.created_at,
        root_path: manifest.root_path,
        entries,
    };
    let name = basename(folder).to_string();
    Ok(archive_response(
        &state,
        filtered,
        Some(folder.to_string()),
        format,
        &name,
    ))
}

/// GET /api/download/{id}/file/{*path} — stream one file's contents.
pub async fn file(
    State(state): State<AppState>,
    Path((id, raw_path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let path = raw_path.trim_start_matches('/').to_string();
    let manifest = fetch_manifest(&state, id).await?;

    let entry = manifest
        .find_entry(&path)
        .ok_or_else(|| ApiError::NotFound(format!("file {path} in backup")))?;
    if entry.kind != EntryKind::File {
        return Err(ApiError::BadRequest(format!("{path} is not a file")));
    }
    let entry = entry.clone();

    let headers = [
        (
            header::CONTENT_TYPE,
            "application/octet-stream".to_string(),
        ),
        (header::CONTENT_LENGTH, entry.size.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", basename(&path)),
        ),
    ];

    let storage = state.storage();
    let body = streamed(move |tx| {
        let mut reader = EntryReader::new(&storage, &entry);
        let mut writer = ChannelWriter { tx };
        io::copy(&mut reader, &mut writer).map(|_| ())
    });

    Ok((StatusCode::OK, headers, body).into_response())
}

/// GET /cli/{os}/{arch} — prebuilt client binaries from the configured
/// distribution directory.
pub async fn cli_binary(
    State(state): State<AppState>,
    Path((os, arch)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let dist = &state.inner.config.client_dist_dir;
    if dist.is_empty() || !is_safe_component(&os) || !is_safe_component(&arch) {
        return Err(ApiError::NotFound(format!("binary for {os}/{arch}")));
    }

    let mut filename = format!("skiff-{os}-{arch}");
    if os == "windows" {
        filename.push_str(".exe");
    }
    let full = std::path::Path::new(dist).join(&filename);

    let data = tokio::fs::read(&full)
        .await
        .map_err(|_| ApiError::NotFound(format!("binary for {os}/{arch}")))?;

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/octet-stream".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        data,
    )
        .into_response())
}

fn is_safe_component(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ---------------------------------------------------------------------------
// Archive production
// ---------------------------------------------------------------------------

fn archive_response(
    state: &AppState,
    manifest: Manifest,
    strip_prefix: Option<String>,
    format: ArchiveFormat,
    filename_base: &str,
) -> Response {
    let filename = format!("{filename_base}{}", format.extension());
    let storage = state.storage();

    let body = streamed(move |tx| match format {
        ArchiveFormat::TarGz => {
            let writer = ChannelWriter { tx };
            write_tar_gz(&storage, &manifest, strip_prefix.as_deref(), writer)
        }
        ArchiveFormat::Zip => spool_zip(&storage, &manifest, strip_prefix.as_deref(), &tx),
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        body,
    )
        .into_response()
}

/// Run a blocking producer against a channel bridged to the response body.
fn streamed<F>(producer: F) -> Body
where
    F: FnOnce(Sender<io::Result<Bytes>>) -> io::Result<()> + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel::<io::Result<Bytes>>(8);
    tokio::task::spawn_blocking(move || {
        let err_tx = tx.clone();
        if let Err(e) = producer(tx) {
            if e.kind() == io::ErrorKind::BrokenPipe {
                debug!("download stream: client disconnected");
            } else {
                error!(error = %e, "download stream aborted");
                let _ = err_tx.blocking_send(Err(e));
            }
        }
    });
    Body::from_stream(ReceiverStream::new(rx))
}

/// `io::Write` adapter that forwards chunks into the response channel.
/// A dropped receiver (client gone) turns into a broken pipe.
struct ChannelWriter {
    tx: Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn write_tar_gz<W: Write>(
    storage: &Storage,
    manifest: &Manifest,
    strip_prefix: Option<&str>,
    out: W,
) -> io::Result<()> {
    let gz = GzEncoder::new(out, flate2::Compression::default());
    let mut builder = tar::Builder::new(gz);

    for entry in &manifest.entries {
        let name = archived_path(&entry.path, strip_prefix);
        let mut header = tar::Header::new_gnu();
        header.set_mode(entry.mode);
        header.set_mtime(mtime_secs(entry.mtime));

        match entry.kind {
            EntryKind::Dir => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, format!("{name}/"), io::empty())?;
            }
            EntryKind::Symlink => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                let target = entry.link_target.as_deref().unwrap_or_default();
                builder.append_link(&mut header, &name, target)?;
            }
            EntryKind::File => {
                header.set_entry_type(tar::EntryType::Regular);
                // Declared size from the manifest; EntryReader aborts the
                // stream if the blocks do not produce exactly this much.
                header.set_size(entry.size);
                let reader = EntryReader::new(storage, entry);
                builder.append_data(&mut header, &name, reader)?;
            }
        }
    }

    let gz = builder.into_inner()?;
    gz.finish()?;
    Ok(())
}

/// Zip needs `Seek` to finalize its central directory, so the archive is
/// written to an unnamed temp file and streamed from there. Memory stays
/// bounded by one block either way.
fn spool_zip(
    storage: &Storage,
    manifest: &Manifest,
    strip_prefix: Option<&str>,
    tx: &Sender<io::Result<Bytes>>,
) -> io::Result<()> {
    let mut spool = tempfile::tempfile()?;
    write_zip(storage, manifest, strip_prefix, &mut spool)?;
    spool.seek(SeekFrom::Start(0))?;

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = spool.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        if tx
            .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
            .is_err()
        {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "client disconnected",
            ));
        }
    }
}

fn write_zip<W: Write + Seek>(
    storage: &Storage,
    manifest: &Manifest,
    strip_prefix: Option<&str>,
    out: W,
) -> io::Result<()> {
    let mut zip = zip::ZipWriter::new(out);

    for entry in &manifest.entries {
        let name = archived_path(&entry.path, strip_prefix);
        match entry.kind {
            EntryKind::Dir => {
                let options = zip::write::SimpleFileOptions::default()
                    .unix_permissions(entry.mode);
                zip.add_directory(name, options).map_err(io::Error::other)?;
            }
            EntryKind::Symlink => {
                // Zip has no portable symlink; write a stub file holding
                // the target text.
                let options = zip::write::SimpleFileOptions::default();
                zip.start_file(format!("{name}.symlink"), options)
                    .map_err(io::Error::other)?;
                zip.write_all(entry.link_target.as_deref().unwrap_or_default().as_bytes())?;
            }
            EntryKind::File => {
                let options = zip::write::SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Deflated)
                    .unix_permissions(entry.mode)
                    .large_file(entry.size >= u32::MAX as u64);
                zip.start_file(name, options).map_err(io::Error::other)?;
                let mut reader = EntryReader::new(storage, entry);
                io::copy(&mut reader, &mut zip)?;
            }
        }
    }

    zip.finish().map_err(io::Error::other)?;
    Ok(())
}

/// Archive path for an entry, re-rooting under the prefix basename when a
/// folder filter is active: the prefix itself becomes its basename, and
/// everything below it is re-parented under that basename.
fn archived_path(path: &str, strip_prefix: Option<&str>) -> String {
    match strip_prefix {
        None => path.to_string(),
        Some(prefix) => {
            let base = basename(prefix);
            if path == prefix {
                base.to_string()
            } else if let Some(rest) = path.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) {
                format!("{base}/{rest}")
            } else {
                path.to_string()
            }
        }
    }
}

fn mtime_secs(mtime_nanos: i64) -> u64 {
    (mtime_nanos / 1_000_000_000).max(0) as u64
}

// ---------------------------------------------------------------------------
// Block streaming
// ---------------------------------------------------------------------------

/// Streams one file entry's decompressed bytes block by block.
///
/// The total is checked against the manifest-declared size; producing more
/// or fewer bytes aborts with an error instead of emitting a malformed
/// archive.
struct EntryReader<'a> {
    storage: &'a Storage,
    entry: &'a Entry,
    next_block: usize,
    current: Vec<u8>,
    offset: usize,
    produced: u64,
}

impl<'a> EntryReader<'a> {
    fn new(storage: &'a Storage, entry: &'a Entry) -> Self {
        Self {
            storage,
            entry,
            next_block: 0,
            current: Vec::new(),
            offset: 0,
            produced: 0,
        }
    }
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.offset < self.current.len() {
                let n = buf.len().min(self.current.len() - self.offset);
                buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }

            if self.next_block >= self.entry.blocks.len() {
                if self.produced != self.entry.size {
                    return Err(io::Error::other(format!(
                        "{}: blocks produced {} bytes, manifest declares {}",
                        self.entry.path, self.produced, self.entry.size
                    )));
                }
                return Ok(0);
            }

            let cid = &self.entry.blocks[self.next_block];
            let stored = self.storage.get_block(cid).map_err(io::Error::other)?;
            let plain = compress::decompress(&stored.data, stored.original_size as usize)
                .map_err(io::Error::other)?;
            self.next_block += 1;
            self.produced += plain.len() as u64;
            if self.produced > self.entry.size {
                return Err(io::Error::other(format!(
                    "{}: blocks exceed declared size {}",
                    self.entry.path, self.entry.size
                )));
            }
            self.current = plain;
            self.offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_format_variants() {
        assert_eq!(split_format("abc.zip"), ("abc", ArchiveFormat::Zip));
        assert_eq!(split_format("abc.tar.gz"), ("abc", ArchiveFormat::TarGz));
        assert_eq!(split_format("abc"), ("abc", ArchiveFormat::TarGz));
    }

    #[test]
    fn archived_path_reroots_under_basename() {
        assert_eq!(archived_path("proj/src", Some("proj/src")), "src");
        assert_eq!(
            archived_path("proj/src/main.rs", Some("proj/src")),
            "src/main.rs"
        );
        assert_eq!(archived_path("a/b", None), "a/b");
        // A sibling that merely shares the string prefix is untouched.
        assert_eq!(archived_path("proj/srcfoo", Some("proj/src")), "proj/srcfoo");
    }

    #[test]
    fn safe_component_check() {
        assert!(is_safe_component("linux"));
        assert!(is_safe_component("x86_64"));
        assert!(!is_safe_component("../etc"));
        assert!(!is_safe_component(""));
    }

    #[test]
    fn mtime_secs_clamps_negative() {
        assert_eq!(mtime_secs(-5), 0);
        assert_eq!(mtime_secs(1_500_000_000 * 1_000_000_000), 1_500_000_000);
    }
}
