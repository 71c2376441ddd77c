//! Fixed-size chunking of files into compressed, content-addressed blocks.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::cid;
use crate::compress;

/// Chunk window size. Fixed-size windows keep dedup granularity and the
/// archive-streaming memory bound at 8 MiB; the final window may be shorter.
pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// One chunk of a file.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Identifier of the uncompressed window bytes.
    pub cid: String,
    /// Stored bytes: LZ4-compressed, or the raw window when compression
    /// did not shrink it.
    pub data: Vec<u8>,
    /// Uncompressed window length.
    pub original_size: u64,
}

/// Lazy sequence of the chunks of one file.
///
/// Reads sequentially in `CHUNK_SIZE` windows. The CID is computed from the
/// uncompressed bytes before compression, so changing compressor parameters
/// never invalidates existing blocks. A read error terminates the sequence.
/// Each emitted chunk owns a fresh buffer; the internal window is reused but
/// never handed out.
pub struct FileChunks {
    file: File,
    window: Vec<u8>,
    done: bool,
}

impl FileChunks {
    /// Open `path` for chunking. Open failures (including permission denied)
    /// surface here; read failures surface as the final iterator item.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            window: vec![0u8; CHUNK_SIZE],
            done: false,
        })
    }
}

impl Iterator for FileChunks {
    type Item = std::io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // Fill the window; short reads before EOF are retried.
        let mut filled = 0;
        while filled < CHUNK_SIZE {
            match self.file.read(&mut self.window[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        if filled == 0 {
            self.done = true;
            return None;
        }
        if filled < CHUNK_SIZE {
            // Short window means EOF; stop after emitting it.
            self.done = true;
        }

        let window = &self.window[..filled];
        let chunk_cid = cid::generate(window);
        let data = compress::compress(window);

        Some(Ok(Chunk {
            cid: chunk_cid,
            data,
            original_size: filled as u64,
        }))
    }
}

/// Uncompressed size of block `index` within a file of `file_size` bytes.
///
/// Fixed-size chunking makes this derivable without per-block bookkeeping:
/// every block is `CHUNK_SIZE` long except the final remainder.
pub fn block_original_size(file_size: u64, index: usize) -> u64 {
    let offset = index as u64 * CHUNK_SIZE as u64;
    file_size.saturating_sub(offset).min(CHUNK_SIZE as u64)
}
