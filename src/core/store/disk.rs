//! Disk store: payload files plus a SQLite metadata table.
//!
//! Layout under the cache directory:
//!
//! ```text
//! index.db              records (one row per digest) and origin aliases (WAL mode)
//! objects/ab/cdef...    payload bytes, named by their SHA-256
//! tmp/                  in-flight writes and removals, cleared on open
//! ```
//!
//! Payloads are written to `tmp/`, fsynced and renamed into place before
//! the metadata row is inserted. If the insert fails the payload is removed
//! again. Removal runs the other way round: the payload is parked in `tmp/`,
//! the rows are deleted, and only then is the parked file unlinked; a failed
//! delete puts the payload back. Whatever a crash leaves behind is
//! reconciled on the next `open`.

use super::{ImageRecord, ImageStore, MonotonicClock, RecordMetadata, RecoveryReport};
use crate::core::hasher::{ContentDigest, ContentHasher, PerceptualSignature};
use crate::error::{IndexError, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

const INDEX_FILE: &str = "index.db";
const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";

/// Origin recorded for payloads re-adopted during recovery
pub const RECOVERED_ORIGIN: &str = "recovered";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        digest TEXT PRIMARY KEY,
        signature INTEGER NOT NULL,
        size_bytes INTEGER NOT NULL,
        origin_id TEXT NOT NULL,
        stored_at INTEGER NOT NULL,
        last_accessed_at INTEGER NOT NULL,
        ref_count INTEGER NOT NULL DEFAULT 1
    );
    CREATE INDEX IF NOT EXISTS idx_records_lru ON records(last_accessed_at, stored_at);
    CREATE TABLE IF NOT EXISTS origins (
        origin_id TEXT PRIMARY KEY,
        digest TEXT NOT NULL,
        recorded_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_origins_digest ON origins(digest);
";

const COLUMNS: &str =
    "digest, signature, size_bytes, origin_id, stored_at, last_accessed_at, ref_count";

/// Persistent content-addressed store
pub struct DiskStore {
    root: PathBuf,
    conn: Mutex<Connection>,
    total_bytes: AtomicU64,
    clock: MonotonicClock,
    recovery: RecoveryReport,
}

impl DiskStore {
    /// Open or create a store rooted at `root`.
    ///
    /// An unreadable `index.db` is moved aside to `index.db.corrupt-<time>`
    /// and rebuilt from the payload files; the details end up in
    /// [`ImageStore::recovery_report`].
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        for dir in [root.join(OBJECTS_DIR), root.join(TMP_DIR)] {
            fs::create_dir_all(&dir).map_err(|source| StoreError::Io { path: dir, source })?;
        }
        clear_partial_writes(&root.join(TMP_DIR));

        let db_path = root.join(INDEX_FILE);
        let mut recovery = RecoveryReport::default();

        let loaded = open_index(&db_path).and_then(|conn| {
            let rows = load_rows(&conn, &db_path)?;
            Ok((conn, rows))
        });
        let (conn, rows) = match loaded {
            Ok(loaded) => loaded,
            Err(IndexError::Corrupted { path, reason }) => {
                tracing::warn!(
                    path = %path.display(),
                    reason = %reason,
                    "Metadata index unreadable, rebuilding from payloads"
                );
                let quarantined = quarantine(&db_path)?;
                recovery.corruption = Some(reason);
                recovery.quarantined_to = Some(quarantined);
                let conn =
                    open_index(&db_path).map_err(|e| StoreError::Database(e.to_string()))?;
                (conn, Vec::new())
            }
            Err(e) => return Err(StoreError::Database(e.to_string())),
        };

        let clock = MonotonicClock::new();
        let total = reconcile(root, &conn, &clock, rows, &mut recovery)?;

        if !recovery.is_clean() {
            tracing::info!(
                dropped = recovery.dropped_records,
                recovered = recovery.recovered_payloads,
                discarded = recovery.discarded_payloads,
                "Store reconciled on open"
            );
        }

        Ok(Self {
            root: root.to_path_buf(),
            conn: Mutex::new(conn),
            total_bytes: AtomicU64::new(total),
            clock,
            recovery,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the payload for `digest` lives (whether or not it exists)
    pub fn object_path(&self, digest: &ContentDigest) -> PathBuf {
        object_path(&self.root, digest)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Corrupted {
            path: self.root.join(INDEX_FILE),
        })
    }

    fn write_payload(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp_dir = self.root.join(TMP_DIR);
        let mut file = tempfile::NamedTempFile::new_in(&tmp_dir).map_err(|source| StoreError::Io {
            path: tmp_dir.clone(),
            source,
        })?;
        file.write_all(bytes)
            .map_err(|source| StoreError::Io { path: tmp_dir.clone(), source })?;
        file.as_file()
            .sync_all()
            .map_err(|source| StoreError::Io { path: tmp_dir.clone(), source })?;
        file.persist(path).map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    fn read_payload(&self, digest: &ContentDigest) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(digest);
        fs::read(&path).map_err(|source| StoreError::Io { path, source })
    }

    fn fetch(conn: &Connection, digest: &ContentDigest) -> Result<Option<ImageRecord>, StoreError> {
        let sql = format!("SELECT {} FROM records WHERE digest = ?1", COLUMNS);
        let raw = conn
            .query_row(&sql, params![digest.to_hex()], RawRow::read)
            .optional()?;
        match raw {
            None => Ok(None),
            Some(raw) => raw.into_record().map(Some).ok_or_else(|| {
                StoreError::Database(format!("Malformed metadata row for {}", digest))
            }),
        }
    }

    fn select_all(&self, order_by: &str) -> Result<Vec<ImageRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM records ORDER BY {}", COLUMNS, order_by);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], RawRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().filter_map(RawRow::into_record).collect())
    }
}

impl ImageStore for DiskStore {
    fn put(
        &self,
        digest: &ContentDigest,
        bytes: &[u8],
        metadata: RecordMetadata,
    ) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        if Self::fetch(&conn, digest)?.is_some() {
            return Ok(false);
        }

        let path = self.object_path(digest);
        self.write_payload(&path, bytes)?;

        let now = micros(self.clock.now());
        if let Err(e) = insert_record(&mut conn, digest, &metadata, bytes.len() as u64, now) {
            if let Err(cleanup) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %cleanup, "Could not remove orphaned payload");
            }
            return Err(e.into());
        }

        self.total_bytes.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        tracing::debug!(digest = %digest.short(), size = bytes.len(), "Stored payload");
        Ok(true)
    }

    fn get(&self, digest: &ContentDigest) -> Result<Vec<u8>, StoreError> {
        let conn = self.lock()?;
        if Self::fetch(&conn, digest)?.is_none() {
            return Err(not_found(digest));
        }
        let bytes = self.read_payload(digest)?;
        conn.execute(
            "UPDATE records SET last_accessed_at = max(last_accessed_at, ?1) WHERE digest = ?2",
            params![micros(self.clock.now()), digest.to_hex()],
        )?;
        Ok(bytes)
    }

    fn peek(&self, digest: &ContentDigest) -> Result<Vec<u8>, StoreError> {
        let conn = self.lock()?;
        if Self::fetch(&conn, digest)?.is_none() {
            return Err(not_found(digest));
        }
        self.read_payload(digest)
    }

    fn record(&self, digest: &ContentDigest) -> Result<Option<ImageRecord>, StoreError> {
        let conn = self.lock()?;
        Self::fetch(&conn, digest)
    }

    fn record_hit(
        &self,
        digest: &ContentDigest,
        origin_id: Option<&str>,
    ) -> Result<ImageRecord, StoreError> {
        let mut conn = self.lock()?;
        let now = micros(self.clock.now());
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE records
             SET ref_count = ref_count + 1, last_accessed_at = max(last_accessed_at, ?1)
             WHERE digest = ?2",
            params![now, digest.to_hex()],
        )?;
        if changed == 0 {
            return Err(not_found(digest));
        }
        if let Some(origin_id) = origin_id {
            alias_origin(&tx, origin_id, digest, now)?;
        }
        tx.commit()?;
        Self::fetch(&conn, digest)?.ok_or_else(|| not_found(digest))
    }

    fn lookup_origin(&self, origin_id: &str) -> Result<Option<ImageRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM records WHERE digest = (SELECT digest FROM origins WHERE origin_id = ?1)",
            COLUMNS
        );
        let raw = conn
            .query_row(&sql, params![origin_id], RawRow::read)
            .optional()?;
        Ok(raw.and_then(RawRow::into_record))
    }

    fn remove(&self, digest: &ContentDigest) -> Result<Option<u64>, StoreError> {
        let mut conn = self.lock()?;
        let Some(record) = Self::fetch(&conn, digest)? else {
            return Ok(None);
        };

        let path = self.object_path(digest);
        let parked = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.removing", digest.to_hex()));
        let moved = match fs::rename(&path, &parked) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        if let Err(e) = delete_record(&mut conn, digest) {
            if moved {
                if let Err(restore) = fs::rename(&parked, &path) {
                    tracing::warn!(
                        digest = %digest.short(),
                        error = %restore,
                        "Could not restore payload after failed removal"
                    );
                }
            }
            return Err(e.into());
        }

        self.total_bytes.fetch_sub(record.size_bytes, Ordering::SeqCst);
        if moved {
            if let Err(e) = fs::remove_file(&parked) {
                tracing::warn!(path = %parked.display(), error = %e, "Removed payload left in tmp until next open");
            }
        }
        tracing::debug!(digest = %digest.short(), size = record.size_bytes, "Removed payload");
        Ok(Some(record.size_bytes))
    }

    fn total_size(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    fn records(&self) -> Result<Vec<ImageRecord>, StoreError> {
        self.select_all("stored_at, digest")
    }

    fn eviction_order(&self) -> Result<Vec<ImageRecord>, StoreError> {
        self.select_all("last_accessed_at, stored_at, digest")
    }

    fn recovery_report(&self) -> RecoveryReport {
        self.recovery.clone()
    }
}

/// Row as stored, before validation
struct RawRow {
    digest: String,
    signature: i64,
    size_bytes: i64,
    origin_id: String,
    stored_at: i64,
    last_accessed_at: i64,
    ref_count: i64,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            digest: row.get(0)?,
            signature: row.get(1)?,
            size_bytes: row.get(2)?,
            origin_id: row.get(3)?,
            stored_at: row.get(4)?,
            last_accessed_at: row.get(5)?,
            ref_count: row.get(6)?,
        })
    }

    fn into_record(self) -> Option<ImageRecord> {
        Some(ImageRecord {
            content_digest: self.digest.parse().ok()?,
            perceptual_signature: PerceptualSignature::new(self.signature as u64),
            size_bytes: u64::try_from(self.size_bytes).ok()?,
            origin_id: self.origin_id,
            stored_at: DateTime::from_timestamp_micros(self.stored_at)?,
            last_accessed_at: DateTime::from_timestamp_micros(self.last_accessed_at)?,
            ref_count: u64::try_from(self.ref_count).ok()?.max(1),
        })
    }
}

/// Record row plus its origin alias, committed together
fn insert_record(
    conn: &mut Connection,
    digest: &ContentDigest,
    metadata: &RecordMetadata,
    size_bytes: u64,
    now: i64,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO records (digest, signature, size_bytes, origin_id, stored_at, last_accessed_at, ref_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
        params![
            digest.to_hex(),
            metadata.perceptual_signature.bits() as i64,
            size_bytes as i64,
            metadata.origin_id,
            now,
            now,
        ],
    )?;
    alias_origin(&tx, &metadata.origin_id, digest, now)?;
    tx.commit()
}

fn alias_origin(
    conn: &Connection,
    origin_id: &str,
    digest: &ContentDigest,
    now: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO origins (origin_id, digest, recorded_at) VALUES (?1, ?2, ?3)",
        params![origin_id, digest.to_hex(), now],
    )?;
    Ok(())
}

fn delete_record(conn: &mut Connection, digest: &ContentDigest) -> rusqlite::Result<()> {
    let hex = digest.to_hex();
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM origins WHERE digest = ?1", params![hex])?;
    tx.execute("DELETE FROM records WHERE digest = ?1", params![hex])?;
    tx.commit()
}

fn micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

fn not_found(digest: &ContentDigest) -> StoreError {
    StoreError::NotFound {
        digest: digest.to_hex(),
    }
}

fn object_path(root: &Path, digest: &ContentDigest) -> PathBuf {
    let hex = digest.to_hex();
    root.join(OBJECTS_DIR).join(&hex[..2]).join(&hex[2..])
}

fn open_index(path: &Path) -> Result<Connection, IndexError> {
    let corrupted = |e: rusqlite::Error| IndexError::Corrupted {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let conn = Connection::open(path).map_err(corrupted)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(corrupted)?;

    let check: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(corrupted)?;
    if check != "ok" {
        return Err(IndexError::Corrupted {
            path: path.to_path_buf(),
            reason: check,
        });
    }

    conn.execute_batch(SCHEMA).map_err(corrupted)?;
    Ok(conn)
}

fn load_rows(conn: &Connection, path: &Path) -> Result<Vec<RawRow>, IndexError> {
    let corrupted = |e: rusqlite::Error| IndexError::Corrupted {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let sql = format!("SELECT {} FROM records", COLUMNS);
    let mut stmt = conn.prepare(&sql).map_err(corrupted)?;
    let rows = stmt
        .query_map([], RawRow::read)
        .map_err(corrupted)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(corrupted)?;
    Ok(rows)
}

/// Move a broken database (and its WAL sidecars) out of the way
fn quarantine(db_path: &Path) -> Result<PathBuf, StoreError> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
    let target = db_path.with_file_name(format!("{}.corrupt-{}", INDEX_FILE, stamp));

    fs::rename(db_path, &target).map_err(|source| StoreError::Io {
        path: db_path.to_path_buf(),
        source,
    })?;

    for suffix in ["-wal", "-shm"] {
        let sidecar = PathBuf::from(format!("{}{}", db_path.display(), suffix));
        if sidecar.exists() {
            let moved = PathBuf::from(format!("{}{}", target.display(), suffix));
            if let Err(e) = fs::rename(&sidecar, &moved) {
                tracing::warn!(path = %sidecar.display(), error = %e, "Could not move index sidecar");
            }
        }
    }
    Ok(target)
}

fn clear_partial_writes(tmp_dir: &Path) {
    let Ok(entries) = fs::read_dir(tmp_dir) else {
        return;
    };
    for entry in entries.flatten() {
        if let Err(e) = fs::remove_file(entry.path()) {
            tracing::warn!(path = %entry.path().display(), error = %e, "Could not clear partial write");
        }
    }
}

/// Make metadata and payload files agree again.
///
/// Rows without an intact payload are dropped. Payloads without a row are
/// re-hashed and adopted when their bytes match their name, deleted
/// otherwise. Returns the total stored size.
fn reconcile(
    root: &Path,
    conn: &Connection,
    clock: &MonotonicClock,
    rows: Vec<RawRow>,
    report: &mut RecoveryReport,
) -> Result<u64, StoreError> {
    let mut total = 0u64;
    let mut known = HashSet::new();

    for raw in rows {
        let digest_text = raw.digest.clone();
        let intact = raw.into_record().filter(|record| {
            fs::metadata(object_path(root, &record.content_digest))
                .map(|meta| meta.is_file() && meta.len() == record.size_bytes)
                .unwrap_or(false)
        });
        match intact {
            Some(record) => {
                clock.observe(record.last_accessed_at);
                clock.observe(record.stored_at);
                total += record.size_bytes;
                known.insert(record.content_digest);
            }
            None => {
                tracing::warn!(digest = %digest_text, "Dropping metadata row without intact payload");
                conn.execute("DELETE FROM records WHERE digest = ?1", params![digest_text])?;
                report.dropped_records += 1;
            }
        }
    }

    for (digest, path) in payload_files(root)? {
        if known.contains(&digest) {
            continue;
        }
        match inspect_orphan(&digest, &path) {
            Ok((signature, size, stored_at)) => {
                let stored = micros(stored_at);
                conn.execute(
                    "INSERT OR REPLACE INTO records (digest, signature, size_bytes, origin_id, stored_at, last_accessed_at, ref_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
                    params![
                        digest.to_hex(),
                        signature.bits() as i64,
                        size as i64,
                        RECOVERED_ORIGIN,
                        stored,
                        stored,
                    ],
                )?;
                clock.observe(stored_at);
                total += size;
                report.recovered_payloads += 1;
            }
            Err(reason) => {
                tracing::warn!(path = %path.display(), reason = %reason, "Discarding unusable payload");
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "Could not remove payload");
                }
                report.discarded_payloads += 1;
            }
        }
    }

    let dangling = conn.execute(
        "DELETE FROM origins WHERE digest NOT IN (SELECT digest FROM records)",
        [],
    )?;
    if dangling > 0 {
        tracing::debug!(dangling, "Dropped origin aliases without a record");
    }

    Ok(total)
}

/// Verify an unindexed payload and compute what its row needs
fn inspect_orphan(
    digest: &ContentDigest,
    path: &Path,
) -> Result<(PerceptualSignature, u64, DateTime<Utc>), String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    let fingerprint = ContentHasher::fingerprint(&bytes).map_err(|e| e.to_string())?;
    if fingerprint.content_digest != *digest {
        return Err(format!("content hashes to {}", fingerprint.content_digest.short()));
    }
    let stored_at = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok((fingerprint.perceptual_signature, bytes.len() as u64, stored_at))
}

/// Every `objects/xx/yyyy...` file whose name parses as a digest
fn payload_files(root: &Path) -> Result<Vec<(ContentDigest, PathBuf)>, StoreError> {
    let objects = root.join(OBJECTS_DIR);
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| StoreError::Io { path, source }
    };

    let mut found = Vec::new();
    for shard in fs::read_dir(&objects).map_err(io_error(&objects))? {
        let shard = shard.map_err(io_error(&objects))?;
        let shard_path = shard.path();
        if !shard_path.is_dir() {
            continue;
        }
        let prefix = shard.file_name().to_string_lossy().into_owned();
        for entry in fs::read_dir(&shard_path).map_err(io_error(&shard_path))? {
            let entry = entry.map_err(io_error(&shard_path))?;
            let name = format!("{}{}", prefix, entry.file_name().to_string_lossy());
            match name.parse::<ContentDigest>() {
                Ok(digest) => found.push((digest, entry.path())),
                Err(_) => {
                    tracing::warn!(path = %entry.path().display(), "Ignoring unrecognised file in object store");
                }
            }
        }
    }
    Ok(found)
}
