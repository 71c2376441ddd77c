//! The storage engine: block, manifest, and reference persistence.
//!
//! Metadata and small blocks live in a single-file SQLite database (WAL
//! mode, 10 s busy timeout); large blocks live in external object storage
//! keyed by CID. Block reachability is governed solely by `block_refs`
//! rows; when the last referencing manifest goes away, orphan GC removes
//! the block and its object.
//!
//! All mutations serialize through a process-local write gate. Reads go
//! straight to the connection pool and never take the gate.

pub mod object_store;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use thiserror::Error;
use tracing::{info, warn};

use skiff_core::manifest::{matches_tags, Manifest, ManifestInfo};

use self::object_store::ObjectStore;

/// Stored blocks below this many bytes are inlined in SQLite; at or above
/// it they go to the object store. Measured on the stored (possibly
/// compressed) length.
pub const INLINE_THRESHOLD: usize = 256 * 1024;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// A block row as read back from the store.
pub struct StoredBlock {
    /// Stored (possibly compressed) bytes.
    pub data: Vec<u8>,
    pub original_size: u64,
}

pub struct Storage {
    pool: r2d2::Pool<SqliteConnectionManager>,
    store: Arc<dyn ObjectStore>,
    /// Process-local write gate. SQLite's write concurrency is a single
    /// writer anyway; serializing here keeps latency predictable instead of
    /// leaning on the busy timeout.
    write_gate: Mutex<()>,
}

impl Storage {
    pub fn open(db_path: &str, store: Arc<dyn ObjectStore>) -> StorageResult<Self> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 10000;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = r2d2::Pool::builder().max_size(8).build(manager)?;

        let storage = Self {
            pool,
            store,
            write_gate: Mutex::new(()),
        };
        storage.migrate()?;
        Ok(storage)
    }

    fn migrate(&self) -> StorageResult<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocks (
                 cid           TEXT PRIMARY KEY,
                 size          INTEGER NOT NULL,
                 original_size INTEGER NOT NULL,
                 inline_data   BLOB,
                 object_key    TEXT,
                 created_at    INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS manifests (
                 id         TEXT PRIMARY KEY,
                 tags       TEXT NOT NULL,
                 created_at INTEGER NOT NULL,
                 data       BLOB NOT NULL
             );

             CREATE TABLE IF NOT EXISTS block_refs (
                 manifest_id TEXT NOT NULL,
                 cid         TEXT NOT NULL,
                 PRIMARY KEY (manifest_id, cid),
                 FOREIGN KEY (manifest_id) REFERENCES manifests(id) ON DELETE CASCADE
             );

             CREATE INDEX IF NOT EXISTS idx_manifests_created_at ON manifests(created_at);
             CREATE INDEX IF NOT EXISTS idx_block_refs_cid ON block_refs(cid);",
        )?;
        Ok(())
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        match self.write_gate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("write gate poisoned; continuing");
                poisoned.into_inner()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Blocks
    // -----------------------------------------------------------------------

    /// Persist one block. Small blocks are inlined; larger ones are uploaded
    /// to the object store first, so a block row never references an object
    /// that was not written.
    ///
    /// The row insert uses `INSERT OR IGNORE`: two clients uploading the same
    /// block race harmlessly, because the object key is the CID itself and
    /// the second object write is an idempotent overwrite.
    pub fn save_block(&self, cid: &str, data: &[u8], original_size: u64) -> StorageResult<()> {
        let (inline_data, object_key) = if data.len() < INLINE_THRESHOLD {
            (Some(data), None)
        } else {
            self.store.put(cid, data)?;
            (None, Some(cid))
        };

        let _gate = self.gate();
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO blocks (cid, size, original_size, inline_data, object_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                cid,
                data.len() as i64,
                original_size as i64,
                inline_data,
                object_key,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a block's stored bytes and original size.
    pub fn get_block(&self, cid: &str) -> StorageResult<StoredBlock> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT inline_data, object_key, original_size FROM blocks WHERE cid = ?1",
                params![cid],
                |row| {
                    Ok((
                        row.get::<_, Option<Vec<u8>>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        let (inline_data, object_key, original_size) =
            row.ok_or_else(|| StorageError::NotFound(format!("block {cid}")))?;
        let original_size = original_size as u64;

        if let Some(data) = inline_data {
            return Ok(StoredBlock {
                data,
                original_size,
            });
        }
        if let Some(key) = object_key {
            return Ok(StoredBlock {
                data: self.store.get(&key)?,
                original_size,
            });
        }
        Err(StorageError::Corrupt(format!(
            "block {cid} has neither inline data nor an object key"
        )))
    }

    pub fn block_exists(&self, cid: &str) -> StorageResult<bool> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM blocks WHERE cid = ?1",
            params![cid],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // -----------------------------------------------------------------------
    // Manifests
    // -----------------------------------------------------------------------

    /// Persist a manifest and its block references in one transaction.
    ///
    /// `compressed_data` is the serialized manifest after compression.
    /// Duplicate `(manifest, cid)` pairs within one manifest are collapsed by
    /// `INSERT OR IGNORE`.
    pub fn save_manifest(&self, manifest: &Manifest, compressed_data: &[u8]) -> StorageResult<()> {
        let tags_json = serde_json::to_string(&manifest.tags)
            .map_err(|e| StorageError::Corrupt(format!("tags serialize: {e}")))?;

        let _gate = self.gate();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO manifests (id, tags, created_at, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                manifest.id,
                tags_json,
                manifest.created_at.timestamp(),
                compressed_data,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO block_refs (manifest_id, cid) VALUES (?1, ?2)",
            )?;
            for entry in &manifest.entries {
                for cid in &entry.blocks {
                    stmt.execute(params![manifest.id, cid])?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// The stored (compressed) manifest blob.
    pub fn get_manifest(&self, id: &str) -> StorageResult<Vec<u8>> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT data FROM manifests WHERE id = ?1",
            params![id],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?
        .ok_or_else(|| StorageError::NotFound(format!("manifest {id}")))
    }

    /// All manifests newest-first, filtered by tags.
    ///
    /// A manifest matches when its tag map contains every `(k, v)` pair of
    /// the filter. Filtering happens here rather than in SQL because tags
    /// are an opaque JSON map to the database.
    pub fn list_manifests(
        &self,
        filter: &BTreeMap<String, String>,
    ) -> StorageResult<Vec<ManifestInfo>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, tags, created_at FROM manifests ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (id, tags_json, created_at) = row?;
            let tags: BTreeMap<String, String> = serde_json::from_str(&tags_json)
                .map_err(|e| StorageError::Corrupt(format!("manifest {id} tags: {e}")))?;
            if matches_tags(&tags, filter) {
                result.push(ManifestInfo {
                    id,
                    tags,
                    created_at: timestamp_to_utc(created_at),
                });
            }
        }
        Ok(result)
    }

    /// The stored blob of the newest manifest matching the filter.
    pub fn get_latest_manifest(
        &self,
        filter: &BTreeMap<String, String>,
    ) -> StorageResult<Vec<u8>> {
        let manifests = self.list_manifests(filter)?;
        let first = manifests
            .first()
            .ok_or_else(|| StorageError::NotFound("matching manifest".into()))?;
        self.get_manifest(&first.id)
    }

    /// Delete one manifest and garbage-collect any blocks it orphaned.
    pub fn delete_manifest(&self, id: &str) -> StorageResult<()> {
        let _gate = self.gate();
        let conn = self.pool.get()?;
        let deleted = conn.execute("DELETE FROM manifests WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StorageError::NotFound(format!("manifest {id}")));
        }
        self.collect_orphans_locked(&conn)
    }

    // -----------------------------------------------------------------------
    // Pruning and GC
    // -----------------------------------------------------------------------

    /// Remove manifests created before `cutoff`, then collect orphaned
    /// blocks. The cascade on `block_refs` drops the references; the
    /// left-join scan below runs inside the same write gate hold, so no
    /// reader can acquire a reference between the check and the delete.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> StorageResult<PruneStats> {
        let _gate = self.gate();
        let conn = self.pool.get()?;

        let manifests_removed = conn.execute(
            "DELETE FROM manifests WHERE created_at < ?1",
            params![cutoff.timestamp()],
        )?;
        if manifests_removed > 0 {
            info!(manifests = manifests_removed, "pruned expired manifests");
        }

        self.collect_orphans_locked(&conn)?;
        Ok(PruneStats {
            manifests_removed: manifests_removed as u64,
        })
    }

    /// Must be called with the write gate held.
    ///
    /// Object-store deletes are best effort: a transient failure leaks at
    /// most one CID-keyed object, and the block row is removed regardless so
    /// retries cannot accumulate work.
    fn collect_orphans_locked(
        &self,
        conn: &r2d2::PooledConnection<SqliteConnectionManager>,
    ) -> StorageResult<()> {
        let mut stmt = conn.prepare(
            "SELECT b.cid, b.object_key FROM blocks b
             LEFT JOIN block_refs br ON b.cid = br.cid
             WHERE br.cid IS NULL",
        )?;
        let orphans: Vec<(String, Option<String>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        if orphans.is_empty() {
            return Ok(());
        }

        for (cid, object_key) in &orphans {
            if let Some(key) = object_key {
                if let Err(e) = self.store.delete(key) {
                    warn!(key = %key, error = %e, "failed to delete orphaned object");
                }
            }
            conn.execute("DELETE FROM blocks WHERE cid = ?1", params![cid])?;
        }

        info!(blocks = orphans.len(), "collected orphaned blocks");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection (tests and diagnostics)
    // -----------------------------------------------------------------------

    pub fn block_count(&self) -> StorageResult<u64> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn block_ref_count(&self) -> StorageResult<u64> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM block_refs", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneStats {
    pub manifests_removed: u64,
}

fn timestamp_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap_or_default())
}
