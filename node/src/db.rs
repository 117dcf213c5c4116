//! SQLite metadata repository.
//!
//! Holds everything about a node that is not file content: the node's
//! encryption keys, file rows (logical name, wire hash, size, local path),
//! share rows (which file went to or came from which peer), and the peer
//! address book that feeds gossip.
//!
//! The store is optional at the coordinator level — a node without a
//! database still replicates and serves files, it just loses the CLI
//! listings, key persistence, and gossip sourcing.
//!
//! Schema:
//! - `keys(id, label, algo, key_bytes, created_at)`
//! - `files(id, name, hash, size, local_path, created_at)`
//! - `file_keys(file_id, key_id)`
//! - `peers(id, address, status, last_seen)`
//! - `shares(id, file_id, peer_id, direction, created_at)`
//!
//! All timestamps are Unix seconds.

use common::now_secs;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

/// Algorithm tag recorded for generated encryption keys.
pub const KEY_ALGO: &str = "AES-CTR-256";

/// Identifier of the node's default encryption key.
pub const DEFAULT_KEY_ID: &str = "default";

/// A `files` row. `id` and `hash` are both the wire identifier `H(K)`;
/// `name` is the user-chosen logical key, kept for display and reverse
/// lookup.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FileRow {
    pub id: String,
    pub name: String,
    pub hash: String,
    pub size: i64,
    pub local_path: String,
    pub created_at: i64,
}

/// A `peers` row, keyed by remote address.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PeerRow {
    pub id: String,
    pub address: String,
    pub status: String,
    pub last_seen: Option<i64>,
}

/// A `shares` row recording one replication event.
#[derive(Debug, Clone)]
pub struct ShareRow {
    pub id: String,
    pub file_id: String,
    pub peer_id: String,
    pub direction: String,
}

/// A share joined against its file row for CLI output. The file columns are
/// optional: incoming replicas have no local `files` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ShareListing {
    pub file_id: String,
    pub file_name: Option<String>,
    pub peer_id: String,
    pub direction: String,
    pub file_size: Option<i64>,
    pub created_at: i64,
}

/// Handle to the node's metadata database.
#[derive(Debug, Clone)]
pub struct MetaStore {
    pool: SqlitePool,
}

impl MetaStore {
    /// Opens (creating if missing) the database at `path` with WAL
    /// journaling and a 5-second busy timeout.
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Applies the schema. Idempotent.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS keys (
                id TEXT PRIMARY KEY,
                label TEXT,
                algo TEXT NOT NULL,
                key_bytes BLOB NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
            )",
            "CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                local_path TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
            )",
            "CREATE TABLE IF NOT EXISTS file_keys (
                file_id TEXT NOT NULL,
                key_id TEXT NOT NULL,
                PRIMARY KEY (file_id, key_id)
            )",
            "CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                last_seen INTEGER
            )",
            "CREATE TABLE IF NOT EXISTS shares (
                id TEXT PRIMARY KEY,
                file_id TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
            )",
        ];

        let mut tx = self.pool.begin().await?;
        for stmt in statements {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        tx.commit().await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================================================================
    // Keys
    // ========================================================================

    /// Returns the bytes of the `"default"` key, creating it with `gen` on
    /// first use.
    pub async fn get_or_create_default_key<F>(&self, gen: F) -> Result<Vec<u8>, sqlx::Error>
    where
        F: FnOnce() -> [u8; common::crypto::KEY_SIZE],
    {
        let existing: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT key_bytes FROM keys WHERE id = ?")
                .bind(DEFAULT_KEY_ID)
                .fetch_optional(&self.pool)
                .await?;

        if let Some(bytes) = existing {
            return Ok(bytes);
        }

        let key_bytes = gen();
        sqlx::query(
            "INSERT INTO keys (id, label, algo, key_bytes) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 label = excluded.label,
                 algo = excluded.algo,
                 key_bytes = excluded.key_bytes",
        )
        .bind(DEFAULT_KEY_ID)
        .bind(DEFAULT_KEY_ID)
        .bind(KEY_ALGO)
        .bind(&key_bytes[..])
        .execute(&self.pool)
        .await?;

        Ok(key_bytes.to_vec())
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Inserts a file row and its key link in one transaction. Re-inserting
    /// an existing id is an error the caller may ignore.
    pub async fn insert_file_with_key(
        &self,
        file: &FileRow,
        key_id: &str,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO files (id, name, hash, size, local_path) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&file.id)
        .bind(&file.name)
        .bind(&file.hash)
        .bind(file.size)
        .bind(&file.local_path)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO file_keys (file_id, key_id) VALUES (?, ?)")
            .bind(&file.id)
            .bind(key_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    /// Deletes a file row, cascading to `file_keys` and `shares`, in one
    /// transaction. Deleting an absent id is a no-op.
    pub async fn delete_file(&self, id: &str) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM file_keys WHERE file_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM shares WHERE file_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    /// All known files, newest first.
    pub async fn list_files(&self) -> Result<Vec<FileRow>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, name, hash, size, local_path, created_at
             FROM files ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Point lookup by wire hash.
    pub async fn find_file_by_hash(&self, hash: &str) -> Result<Option<FileRow>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, name, hash, size, local_path, created_at
             FROM files WHERE hash = ? LIMIT 1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Inserts or refreshes a peer row, unique by address.
    pub async fn upsert_peer(&self, peer: &PeerRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO peers (id, address, status, last_seen) VALUES (?, ?, ?, ?)
             ON CONFLICT(address) DO UPDATE SET
                 status = excluded.status,
                 last_seen = excluded.last_seen",
        )
        .bind(&peer.id)
        .bind(&peer.address)
        .bind(&peer.status)
        .bind(peer.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Peers seen within `max_age`, most recent first, capped at `limit`.
    pub async fn get_active_peers(
        &self,
        max_age: Duration,
        limit: i64,
    ) -> Result<Vec<PeerRow>, sqlx::Error> {
        let cutoff = now_secs().saturating_sub(max_age.as_secs()) as i64;
        sqlx::query_as(
            "SELECT id, address, status, last_seen FROM peers
             WHERE last_seen IS NOT NULL AND last_seen >= ?
             ORDER BY last_seen DESC LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    /// Removes peers never seen or not seen within `threshold`. Returns the
    /// number of rows removed.
    pub async fn cleanup_stale_peers(&self, threshold: Duration) -> Result<u64, sqlx::Error> {
        let cutoff = now_secs().saturating_sub(threshold.as_secs()) as i64;
        let result = sqlx::query("DELETE FROM peers WHERE last_seen IS NULL OR last_seen < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Shares
    // ========================================================================

    /// Records one replication event.
    pub async fn insert_share(&self, share: &ShareRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR REPLACE INTO shares (id, file_id, peer_id, direction)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&share.id)
        .bind(&share.file_id)
        .bind(&share.peer_id)
        .bind(&share.direction)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All shares joined against their file rows, newest first. Incoming
    /// replicas have no file row; their file columns come back NULL.
    pub async fn list_shares(&self) -> Result<Vec<ShareListing>, sqlx::Error> {
        sqlx::query_as(
            "SELECT s.file_id AS file_id, f.name AS file_name, s.peer_id AS peer_id,
                    s.direction AS direction, f.size AS file_size, s.created_at AS created_at
             FROM shares s LEFT JOIN files f ON f.id = s.file_id
             ORDER BY s.created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
    }
}
