//! Durable fragment store and persistent embedding-cache tier.
//!
//! Single sqlite database, schema versioned through `PRAGMA
//! user_version`. A version mismatch means the on-disk layout predates
//! this build; the store is rebuilt from scratch and the caller
//! re-indexes. Fragment metadata is stored as JSON columns so schema
//! churn in the metadata enums never needs a migration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::model::types::{
    Fragment, FragmentId, OperationalMetadata, StructuralMetadata,
};

const SCHEMA_VERSION: i64 = 1;

/// Cached embeddings older than this read as a miss and get recomputed
/// on the next lookup. 30 days.
const EMBED_CACHE_MAX_AGE_SECS: i64 = 30 * 24 * 60 * 60;

pub struct FragmentStore {
    conn: Mutex<Connection>,
}

impl FragmentStore {
    /// Open the store, rebuilding the database file when the schema
    /// version does not match this build.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = match Self::try_open(path) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "rebuilding fragment store");
                std::fs::remove_file(path).ok();
                Self::try_open(path)?
            }
        };
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn try_open(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            r"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version == 0 {
            Self::create_schema(&conn)?;
            info!(path = %path.display(), "created fragment store");
        } else if version != SCHEMA_VERSION {
            anyhow::bail!("schema version {version}, expected {SCHEMA_VERSION}");
        }
        Ok(conn)
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE fragments (
                id            TEXT PRIMARY KEY,
                path          TEXT NOT NULL,
                start_line    INTEGER NOT NULL,
                end_line      INTEGER NOT NULL,
                content       TEXT NOT NULL,
                enriched      TEXT NOT NULL,
                content_hash  TEXT NOT NULL,
                structural    TEXT NOT NULL,
                operational   TEXT NOT NULL
            );
            CREATE INDEX idx_fragments_path ON fragments(path);

            CREATE TABLE embedding_cache (
                key        TEXT PRIMARY KEY,
                vector     BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// Insert or replace a batch in one transaction.
    pub fn upsert_fragments(&self, fragments: &[Fragment]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO fragments
                 (id, path, start_line, end_line, content, enriched,
                  content_hash, structural, operational)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for frag in fragments {
                stmt.execute(params![
                    frag.id.to_hex(),
                    frag.source_path.to_string_lossy(),
                    frag.line_range.0,
                    frag.line_range.1,
                    frag.content,
                    frag.enriched_content,
                    hex::encode(frag.content_hash),
                    serde_json::to_string(&frag.structural)?,
                    serde_json::to_string(&frag.operational)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove_fragments(&self, ids: &[FragmentId]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM fragments WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![id.to_hex()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete and upsert one batch in a single transaction, so a reader
    /// sees the rows before or after the batch, never in between.
    pub fn apply_batch(&self, removals: &[FragmentId], upserts: &[Fragment]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut delete = tx.prepare_cached("DELETE FROM fragments WHERE id = ?1")?;
            for id in removals {
                delete.execute(params![id.to_hex()])?;
            }
            let mut insert = tx.prepare_cached(
                "INSERT OR REPLACE INTO fragments
                 (id, path, start_line, end_line, content, enriched,
                  content_hash, structural, operational)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for frag in upserts {
                insert.execute(params![
                    frag.id.to_hex(),
                    frag.source_path.to_string_lossy(),
                    frag.line_range.0,
                    frag.line_range.1,
                    frag.content,
                    frag.enriched_content,
                    hex::encode(frag.content_hash),
                    serde_json::to_string(&frag.structural)?,
                    serde_json::to_string(&frag.operational)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn fragment(&self, id: FragmentId) -> Result<Option<Fragment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, path, start_line, end_line, content, enriched,
                    content_hash, structural, operational
             FROM fragments WHERE id = ?1",
        )?;
        stmt.query_row(params![id.to_hex()], row_to_fragment)
            .optional()
            .context("reading fragment")
    }

    /// Resolve a batch of ids, skipping ids with no row.
    pub fn fragments(&self, ids: &[FragmentId]) -> Result<Vec<Fragment>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(frag) = self.fragment(id)? {
                out.push(frag);
            }
        }
        Ok(out)
    }

    /// All fragment ids currently stored for a path, in line order.
    pub fn ids_for_path(&self, path: &Path) -> Result<Vec<FragmentId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM fragments WHERE path = ?1 ORDER BY start_line",
        )?;
        let rows = stmt.query_map(params![path.to_string_lossy()], |r| {
            r.get::<_, String>(0)
        })?;
        let mut ids = Vec::new();
        for row in rows {
            let hex = row?;
            if let Some(id) = FragmentId::from_hex(&hex) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub fn all_fragments(&self) -> Result<Vec<Fragment>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, path, start_line, end_line, content, enriched,
                    content_hash, structural, operational
             FROM fragments ORDER BY path, start_line",
        )?;
        let rows = stmt.query_map([], row_to_fragment)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn fragment_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM fragments", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Expired entries read as a miss; the caller recomputes and the
    /// rewrite replaces the stale row. Nothing is purged eagerly.
    pub fn cached_embedding(&self, key: &str, dimension: usize) -> Result<Option<Vec<f32>>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT vector, created_at FROM embedding_cache WHERE key = ?1")?;
        let row: Option<(Vec<u8>, i64)> = stmt
            .query_row(params![key], |r| Ok((r.get(0)?, r.get(1)?)))
            .optional()?;
        let Some((blob, created_at)) = row else {
            return Ok(None);
        };
        if chrono::Utc::now().timestamp() - created_at > EMBED_CACHE_MAX_AGE_SECS {
            return Ok(None);
        }
        if blob.len() != dimension * 4 {
            // Stale entry from a different embedder dimension.
            return Ok(None);
        }
        let vec = blob
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Some(vec))
    }

    pub fn put_cached_embedding(&self, key: &str, vector: &[f32]) -> Result<()> {
        let blob: Vec<u8> = vector.iter().flat_map(|v| v.to_le_bytes()).collect();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO embedding_cache (key, vector, created_at)
             VALUES (?1, ?2, ?3)",
            params![key, blob, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()
        .context("reading meta")
    }

    pub fn set_last_reindex(&self, when: chrono::DateTime<chrono::Utc>) -> Result<()> {
        self.set_meta("last_reindex", &when.to_rfc3339())
    }

    pub fn last_reindex(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let Some(raw) = self.meta("last_reindex")? else {
            return Ok(None);
        };
        Ok(chrono::DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc)))
    }
}

fn row_to_fragment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fragment> {
    let invalid = |msg: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            msg.to_string().into(),
        )
    };

    let id_hex: String = row.get(0)?;
    let path: String = row.get(1)?;
    let start: u32 = row.get(2)?;
    let end: u32 = row.get(3)?;
    let content: String = row.get(4)?;
    let enriched: String = row.get(5)?;
    let hash_hex: String = row.get(6)?;
    let structural_json: String = row.get(7)?;
    let operational_json: String = row.get(8)?;

    let id = FragmentId::from_hex(&id_hex).ok_or_else(|| invalid("bad fragment id"))?;
    let mut content_hash = [0u8; 32];
    let bytes = hex::decode(&hash_hex).map_err(|_| invalid("bad content hash"))?;
    if bytes.len() != 32 {
        return Err(invalid("bad content hash length"));
    }
    content_hash.copy_from_slice(&bytes);
    let structural: StructuralMetadata =
        serde_json::from_str(&structural_json).map_err(|_| invalid("bad structural json"))?;
    let operational: OperationalMetadata =
        serde_json::from_str(&operational_json).map_err(|_| invalid("bad operational json"))?;

    Ok(Fragment {
        id,
        content,
        enriched_content: enriched,
        source_path: PathBuf::from(path),
        line_range: (start, end),
        structural,
        operational,
        content_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::ContentKind;

    fn fragment(path: &str, range: (u32, u32), content: &str) -> Fragment {
        Fragment::new(
            PathBuf::from(path),
            range,
            content.to_string(),
            content.to_string(),
            StructuralMetadata::DocSection {
                heading: "h".into(),
                level: 1,
            },
        )
    }

    #[test]
    fn round_trips_a_fragment() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::open(&dir.path().join("s.db")).unwrap();
        let frag = fragment("docs/a.md", (1, 4), "# h\n\nbody");
        store.upsert_fragments(std::slice::from_ref(&frag)).unwrap();

        let loaded = store.fragment(frag.id).unwrap().unwrap();
        assert_eq!(loaded, frag);
        assert_eq!(loaded.kind(), ContentKind::DocSection);
    }

    #[test]
    fn ids_for_path_ordered_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::open(&dir.path().join("s.db")).unwrap();
        let a = fragment("src/x.rs", (10, 20), "fn b() {}");
        let b = fragment("src/x.rs", (1, 5), "fn a() {}");
        let other = fragment("src/y.rs", (1, 2), "fn c() {}");
        store.upsert_fragments(&[a.clone(), b.clone(), other]).unwrap();

        let ids = store.ids_for_path(Path::new("src/x.rs")).unwrap();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[test]
    fn remove_deletes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::open(&dir.path().join("s.db")).unwrap();
        let frag = fragment("a.md", (1, 1), "x");
        store.upsert_fragments(std::slice::from_ref(&frag)).unwrap();
        store.remove_fragments(&[frag.id]).unwrap();
        assert!(store.fragment(frag.id).unwrap().is_none());
        assert_eq!(store.fragment_count().unwrap(), 0);
    }

    #[test]
    fn apply_batch_removes_and_upserts_in_one_step() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::open(&dir.path().join("s.db")).unwrap();
        let old = fragment("a.md", (1, 2), "old body");
        let new = fragment("a.md", (1, 2), "new body");
        store.upsert_fragments(std::slice::from_ref(&old)).unwrap();

        store.apply_batch(&[old.id], std::slice::from_ref(&new)).unwrap();
        assert!(store.fragment(old.id).unwrap().is_none());
        assert_eq!(store.fragment(new.id).unwrap().unwrap(), new);
        assert_eq!(store.fragment_count().unwrap(), 1);
    }

    #[test]
    fn embedding_cache_round_trip_and_dimension_guard() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::open(&dir.path().join("s.db")).unwrap();
        store.put_cached_embedding("k1", &[1.0, -2.5, 0.0]).unwrap();
        assert_eq!(
            store.cached_embedding("k1", 3).unwrap(),
            Some(vec![1.0, -2.5, 0.0])
        );
        // Wrong dimension reads as a miss.
        assert_eq!(store.cached_embedding("k1", 4).unwrap(), None);
        assert_eq!(store.cached_embedding("absent", 3).unwrap(), None);
    }

    #[test]
    fn expired_embedding_reads_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::open(&dir.path().join("s.db")).unwrap();
        store.put_cached_embedding("k1", &[1.0, 2.0]).unwrap();
        assert!(store.cached_embedding("k1", 2).unwrap().is_some());

        let stale = chrono::Utc::now().timestamp() - EMBED_CACHE_MAX_AGE_SECS - 1;
        store
            .conn
            .lock()
            .execute(
                "UPDATE embedding_cache SET created_at = ?1 WHERE key = 'k1'",
                params![stale],
            )
            .unwrap();
        assert_eq!(store.cached_embedding("k1", 2).unwrap(), None);

        // Recomputing overwrites the stale row.
        store.put_cached_embedding("k1", &[1.0, 2.0]).unwrap();
        assert!(store.cached_embedding("k1", 2).unwrap().is_some());
    }

    #[test]
    fn corrupt_database_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.db");
        std::fs::write(&path, b"not a sqlite file at all").unwrap();
        let store = FragmentStore::open(&path).unwrap();
        assert_eq!(store.fragment_count().unwrap(), 0);
    }

    #[test]
    fn last_reindex_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FragmentStore::open(&dir.path().join("s.db")).unwrap();
        assert!(store.last_reindex().unwrap().is_none());
        let now = chrono::Utc::now();
        store.set_last_reindex(now).unwrap();
        let loaded = store.last_reindex().unwrap().unwrap();
        assert!((loaded - now).num_seconds().abs() < 2);
    }
}
