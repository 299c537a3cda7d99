//! Knowledge Store - rusqlite passage storage
//!
//! Passages are written under a generation tag and become visible only once
//! `file_generations` points at that tag. Every read goes through the
//! `live_passages` view, so staged or superseded rows never leak into
//! results.
//!
//! Location: <data_local_dir>/.knowledge-rag/knowledge.db

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;

use super::error::{KnowledgeError, KnowledgeResult};
use super::keywords::escape_like;
use super::vector::{
    cosine_similarity, decode_embedding, encode_embedding, PassageFilter, VectorEntry,
    VectorMatch, VectorStore,
};

// ============================================================================
// Data Directory
// ============================================================================

/// Default data directory (<data_local_dir>/.knowledge-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".knowledge-rag")
}

// ============================================================================
// Types
// ============================================================================

/// Stored passage (embedding omitted)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Passage {
    pub id: i64,
    pub owner_id: i64,
    pub file_name: String,
    pub chunk_index: usize,
    pub content: String,
    pub preview: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub display_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Keyword search hit
#[derive(Debug, Clone)]
pub struct KeywordMatch {
    pub passage: Passage,
    /// Number of keywords contained in the passage
    pub match_count: usize,
}

/// One grouped row of the file listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    /// Representative (latest) passage id
    pub id: i64,
    pub file_name: String,
    pub preview: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub display_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub passage_count: usize,
    pub file_count: usize,
    pub owner_count: usize,
    pub total_content_bytes: usize,
    /// Rows written by ingestions that have not been published (or were abandoned)
    pub staged_count: usize,
    pub db_path: PathBuf,
}

const PASSAGE_COLUMNS: &str = "id, owner_id, file_name, chunk_index, content, preview, size, \
                               display_type, created_at, updated_at";

// ============================================================================
// KnowledgeStore
// ============================================================================

/// SQLite passage store
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct KnowledgeStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl KnowledgeStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> KnowledgeResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    KnowledgeError::Storage(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Self::from_connection(conn, path.to_path_buf())
    }

    /// Private in-memory database
    pub fn open_in_memory() -> KnowledgeResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    /// Open at the default location
    pub fn open_default() -> KnowledgeResult<Self> {
        Self::open(&get_data_dir().join("knowledge.db"))
    }

    fn from_connection(conn: Connection, db_path: PathBuf) -> KnowledgeResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        };
        store.initialize()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> KnowledgeResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| KnowledgeError::Storage(format!("Lock error: {}", e)))
    }

    /// Run a synchronous store call on the blocking pool
    pub async fn run_blocking<T, F>(&self, f: F) -> KnowledgeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&KnowledgeStore) -> KnowledgeResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    fn initialize(&self) -> KnowledgeResult<()> {
        let conn = self.conn()?;

        // rarray() table-valued function for bound keyword / type lists
        rusqlite::vtab::array::load_module(&conn)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS passages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL,
                file_name TEXT NOT NULL,
                generation TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL CHECK (length(content) > 0),
                preview TEXT NOT NULL,
                size INTEGER NOT NULL,
                display_type TEXT NOT NULL,
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_passages_owner_file
                ON passages(owner_id, file_name, generation);

            CREATE TABLE IF NOT EXISTS file_generations (
                owner_id INTEGER NOT NULL,
                file_name TEXT NOT NULL,
                generation TEXT NOT NULL,
                published_at TEXT NOT NULL,
                PRIMARY KEY (owner_id, file_name)
            );

            CREATE VIEW IF NOT EXISTS live_passages AS
                SELECT p.*
                FROM passages p
                JOIN file_generations g
                  ON g.owner_id = p.owner_id
                 AND g.file_name = p.file_name
                 AND g.generation = p.generation;
            "#,
        )?;

        tracing::debug!("Knowledge store initialized at {:?}", self.db_path);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Generations
    // ------------------------------------------------------------------------

    /// Insert staged rows (invisible until their generation is published)
    pub fn insert_passages(&self, entries: &[VectorEntry]) -> KnowledgeResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = now_rfc3339();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO passages (owner_id, file_name, generation, chunk_index, content,
                                       preview, size, display_type, embedding, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            )?;

            for entry in entries {
                stmt.execute(params![
                    entry.owner_id,
                    entry.file_name,
                    entry.generation,
                    entry.chunk_index as i64,
                    entry.content,
                    entry.preview,
                    entry.size as i64,
                    entry.display_type,
                    encode_embedding(&entry.embedding),
                    now,
                ])?;
            }
        }

        tx.commit()?;
        Ok(entries.len())
    }

    /// Make `generation` the current one for the file and drop every other
    /// generation of it, in one transaction. Returns the number of rows removed.
    pub fn publish_generation(
        &self,
        owner_id: i64,
        file_name: &str,
        generation: &str,
    ) -> KnowledgeResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO file_generations (owner_id, file_name, generation, published_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner_id, file_name)
             DO UPDATE SET generation = excluded.generation, published_at = excluded.published_at",
            params![owner_id, file_name, generation, now_rfc3339()],
        )?;

        let removed = tx.execute(
            "DELETE FROM passages WHERE owner_id = ?1 AND file_name = ?2 AND generation <> ?3",
            params![owner_id, file_name, generation],
        )?;

        tx.commit()?;
        Ok(removed)
    }

    /// Drop the staged rows of an abandoned ingestion
    pub fn discard_generation(
        &self,
        owner_id: i64,
        file_name: &str,
        generation: &str,
    ) -> KnowledgeResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM passages
             WHERE owner_id = ?1 AND file_name = ?2 AND generation = ?3
               AND NOT EXISTS (
                   SELECT 1 FROM file_generations g
                   WHERE g.owner_id = ?1 AND g.file_name = ?2 AND g.generation = ?3
               )",
            params![owner_id, file_name, generation],
        )?;
        Ok(removed)
    }

    /// Delete every passage and generation pointer matching the filter
    pub fn delete_passages(&self, filter: &PassageFilter) -> KnowledgeResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let removed = match &filter.file_name {
            Some(file_name) => {
                tx.execute(
                    "DELETE FROM file_generations WHERE owner_id = ?1 AND file_name = ?2",
                    params![filter.owner_id, file_name],
                )?;
                tx.execute(
                    "DELETE FROM passages WHERE owner_id = ?1 AND file_name = ?2",
                    params![filter.owner_id, file_name],
                )?
            }
            None => {
                tx.execute(
                    "DELETE FROM file_generations WHERE owner_id = ?1",
                    params![filter.owner_id],
                )?;
                tx.execute(
                    "DELETE FROM passages WHERE owner_id = ?1",
                    params![filter.owner_id],
                )?
            }
        };

        tx.commit()?;
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Reads (live generation only)
    // ------------------------------------------------------------------------

    /// Passage by id, scoped to its owner
    pub fn find_passage(&self, owner_id: i64, id: i64) -> KnowledgeResult<Option<Passage>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM live_passages WHERE id = ?1 AND owner_id = ?2",
            PASSAGE_COLUMNS
        );

        let passage = conn
            .query_row(&sql, params![id, owner_id], row_to_passage)
            .optional()?;
        Ok(passage)
    }

    /// Whether a passage with this (owner, id, file name) exists
    pub fn passage_exists(&self, owner_id: i64, id: i64, file_name: &str) -> KnowledgeResult<bool> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM live_passages WHERE id = ?1 AND owner_id = ?2 AND file_name = ?3
             )",
            params![id, owner_id, file_name],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// All passages of one file in id order
    pub fn file_passages(&self, owner_id: i64, file_name: &str) -> KnowledgeResult<Vec<Passage>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM live_passages WHERE owner_id = ?1 AND file_name = ?2 ORDER BY id ASC",
            PASSAGE_COLUMNS
        );

        let mut stmt = conn.prepare(&sql)?;
        let passages = stmt
            .query_map(params![owner_id, file_name], row_to_passage)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(passages)
    }

    /// Files of an owner grouped by name, newest first.
    ///
    /// An empty `types` slice disables type filtering. Returns the page and
    /// the distinct file count after filtering.
    pub fn list_files(
        &self,
        owner_id: i64,
        types: &[String],
        limit: usize,
        offset: usize,
    ) -> KnowledgeResult<(Vec<FileSummary>, usize)> {
        let limit = i64::try_from(limit)
            .map_err(|_| KnowledgeError::Validation("page size is out of range".to_string()))?;
        let offset = i64::try_from(offset)
            .map_err(|_| KnowledgeError::Validation("page is out of range".to_string()))?;

        let conn = self.conn()?;
        let filter_types = !types.is_empty();
        let type_values: Rc<Vec<Value>> =
            Rc::new(types.iter().cloned().map(Value::from).collect());

        let total: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT file_name) FROM live_passages
             WHERE owner_id = ?1 AND (?2 = 0 OR display_type IN rarray(?3))",
            params![owner_id, filter_types, type_values],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT MAX(id) AS id, file_name, preview, size, display_type,
                    MAX(created_at) AS created_at, MAX(updated_at) AS updated_at
             FROM live_passages
             WHERE owner_id = ?1 AND (?2 = 0 OR display_type IN rarray(?3))
             GROUP BY file_name
             ORDER BY created_at DESC, id DESC
             LIMIT ?4 OFFSET ?5",
        )?;

        let items = stmt
            .query_map(
                params![
                    owner_id,
                    filter_types,
                    type_values,
                    limit,
                    offset
                ],
                |row| {
                    Ok(FileSummary {
                        id: row.get(0)?,
                        file_name: row.get(1)?,
                        preview: row.get(2)?,
                        size: row.get::<_, i64>(3)?.max(0) as u64,
                        display_type: row.get(4)?,
                        created_at: datetime_column(row, 5)?,
                        updated_at: datetime_column(row, 6)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((items, total.max(0) as usize))
    }

    /// Keyword search: passages containing at least one keyword, ranked by
    /// how many keywords they contain, ties by id.
    ///
    /// The keyword list is bound as one array parameter; each keyword is
    /// escaped for `LIKE` so `%`, `_` and `\` match literally. ASCII matching
    /// is case-insensitive.
    pub fn search_keywords(
        &self,
        owner_id: i64,
        keywords: &[String],
        limit: usize,
    ) -> KnowledgeResult<Vec<KeywordMatch>> {
        if keywords.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let conn = self.conn()?;
        let patterns: Rc<Vec<Value>> = Rc::new(
            keywords
                .iter()
                .map(|kw| Value::from(format!("%{}%", escape_like(&kw.to_lowercase()))))
                .collect(),
        );

        let sql = format!(
            r#"
            SELECT {columns}, match_count FROM (
                SELECT p.*,
                       (SELECT COUNT(*) FROM rarray(?2) kw
                        WHERE p.content LIKE kw.value ESCAPE '\') AS match_count
                FROM live_passages p
                WHERE p.owner_id = ?1
            )
            WHERE match_count > 0
            ORDER BY match_count DESC, id ASC
            LIMIT ?3
            "#,
            columns = PASSAGE_COLUMNS
        );

        let mut stmt = conn.prepare(&sql)?;
        let matches = stmt
            .query_map(params![owner_id, patterns, limit as i64], |row| {
                Ok(KeywordMatch {
                    passage: row_to_passage(row)?,
                    match_count: row.get::<_, i64>(10)?.max(0) as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(matches)
    }

    /// Owner-scoped similarity ranking, descending, ties by id
    pub fn similar_passages(
        &self,
        owner_id: i64,
        query_embedding: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> KnowledgeResult<Vec<VectorMatch>> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let conn = self.conn()?;
        let sql = format!(
            "SELECT {}, embedding FROM live_passages WHERE owner_id = ?1",
            PASSAGE_COLUMNS
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![owner_id], |row| {
                let passage = row_to_passage(row)?;
                let blob: Vec<u8> = row.get(10)?;
                Ok((passage, blob))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut matches: Vec<VectorMatch> = rows
            .into_iter()
            .map(|(passage, blob)| VectorMatch {
                similarity: cosine_similarity(query_embedding, &decode_embedding(&blob)),
                passage,
            })
            .filter(|hit| threshold.map_or(true, |min| hit.similarity >= min))
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.passage.id.cmp(&b.passage.id))
        });
        matches.truncate(limit);

        Ok(matches)
    }

    /// Store statistics
    pub fn stats(&self) -> KnowledgeResult<StoreStats> {
        let conn = self.conn()?;

        let (passage_count, owner_count, total_bytes): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT owner_id),
                    COALESCE(SUM(LENGTH(CAST(content AS BLOB))), 0)
             FROM live_passages",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let file_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM file_generations", [], |row| row.get(0))?;

        let all_rows: i64 = conn.query_row("SELECT COUNT(*) FROM passages", [], |row| row.get(0))?;

        Ok(StoreStats {
            passage_count: passage_count as usize,
            file_count: file_count as usize,
            owner_count: owner_count as usize,
            total_content_bytes: total_bytes as usize,
            staged_count: (all_rows - passage_count).max(0) as usize,
            db_path: self.db_path.clone(),
        })
    }
}

#[async_trait]
impl VectorStore for KnowledgeStore {
    async fn insert_batch(&self, entries: &[VectorEntry]) -> KnowledgeResult<usize> {
        let entries = entries.to_vec();
        self.run_blocking(move |store| store.insert_passages(&entries))
            .await
    }

    async fn delete_by_filter(&self, filter: &PassageFilter) -> KnowledgeResult<usize> {
        let filter = filter.clone();
        self.run_blocking(move |store| store.delete_passages(&filter))
            .await
    }

    async fn query_similar(
        &self,
        owner_id: i64,
        query_embedding: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> KnowledgeResult<Vec<VectorMatch>> {
        let query = query_embedding.to_vec();
        self.run_blocking(move |store| store.similar_passages(owner_id, &query, limit, threshold))
            .await
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn row_to_passage(row: &Row<'_>) -> rusqlite::Result<Passage> {
    Ok(Passage {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        file_name: row.get(2)?,
        chunk_index: row.get::<_, i64>(3)?.max(0) as usize,
        content: row.get(4)?,
        preview: row.get(5)?,
        size: row.get::<_, i64>(6)?.max(0) as u64,
        display_type: row.get(7)?,
        created_at: datetime_column(row, 8)?,
        updated_at: datetime_column(row, 9)?,
    })
}

/// Fixed-width UTC timestamp, so string order equals time order
fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// RFC3339 column as DateTime<Utc>; unparseable text is a conversion error
fn datetime_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, KnowledgeStore) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let store = KnowledgeStore::open(&db_path).unwrap();
        (dir, store)
    }

    fn entry(owner_id: i64, file_name: &str, generation: &str, idx: usize, content: &str) -> VectorEntry {
        VectorEntry {
            owner_id,
            file_name: file_name.to_string(),
            generation: generation.to_string(),
            chunk_index: idx,
            content: content.to_string(),
            preview: content.chars().take(20).collect(),
            size: 100,
            display_type: "text".to_string(),
            embedding: vec![1.0, idx as f32, 0.0],
        }
    }

    fn ingest(store: &KnowledgeStore, owner_id: i64, file_name: &str, generation: &str, chunks: &[&str]) {
        let entries: Vec<_> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| entry(owner_id, file_name, generation, i, c))
            .collect();
        store.insert_passages(&entries).unwrap();
        store.publish_generation(owner_id, file_name, generation).unwrap();
    }

    fn keywords(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_staged_rows_invisible_until_published() {
        let (_dir, store) = create_test_store();
        let entries = vec![entry(1, "a.txt", "g1", 0, "pump manual")];
        store.insert_passages(&entries).unwrap();

        assert!(store.file_passages(1, "a.txt").unwrap().is_empty());
        assert_eq!(store.stats().unwrap().staged_count, 1);

        store.publish_generation(1, "a.txt", "g1").unwrap();
        assert_eq!(store.file_passages(1, "a.txt").unwrap().len(), 1);
    }

    #[test]
    fn test_publish_replaces_previous_generation() {
        let (_dir, store) = create_test_store();
        ingest(&store, 1, "a.txt", "g1", &["old one", "old two"]);

        store
            .insert_passages(&[entry(1, "a.txt", "g2", 0, "new content")])
            .unwrap();
        // old generation still served while the new one is staged
        assert_eq!(store.file_passages(1, "a.txt").unwrap()[0].content, "old one");

        let removed = store.publish_generation(1, "a.txt", "g2").unwrap();
        assert_eq!(removed, 2);

        let passages = store.file_passages(1, "a.txt").unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].content, "new content");
    }

    #[test]
    fn test_discard_keeps_live_generation() {
        let (_dir, store) = create_test_store();
        ingest(&store, 1, "a.txt", "g1", &["live"]);
        store
            .insert_passages(&[entry(1, "a.txt", "g2", 0, "abandoned")])
            .unwrap();

        assert_eq!(store.discard_generation(1, "a.txt", "g2").unwrap(), 1);
        // discarding the published generation is a no-op
        assert_eq!(store.discard_generation(1, "a.txt", "g1").unwrap(), 0);

        let passages = store.file_passages(1, "a.txt").unwrap();
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].content, "live");
        assert_eq!(store.stats().unwrap().staged_count, 0);
    }

    #[test]
    fn test_owner_scoping() {
        let (_dir, store) = create_test_store();
        ingest(&store, 1, "a.txt", "g1", &["hydraulic pump"]);

        let id = store.file_passages(1, "a.txt").unwrap()[0].id;
        assert!(store.find_passage(1, id).unwrap().is_some());
        assert!(store.find_passage(2, id).unwrap().is_none());
        assert!(store.passage_exists(1, id, "a.txt").unwrap());
        assert!(!store.passage_exists(2, id, "a.txt").unwrap());
        assert!(!store.passage_exists(1, id, "b.txt").unwrap());

        assert!(store
            .search_keywords(2, &keywords(&["pump"]), 10)
            .unwrap()
            .is_empty());
        assert!(store.similar_passages(2, &[1.0, 0.0, 0.0], 10, None).unwrap().is_empty());
    }

    #[test]
    fn test_keyword_ranking_by_match_count_then_id() {
        let (_dir, store) = create_test_store();
        ingest(
            &store,
            1,
            "a.txt",
            "g1",
            &["valve only", "Pump and valve", "pump only", "nothing here"],
        );

        let hits = store
            .search_keywords(1, &keywords(&["pump", "valve"]), 10)
            .unwrap();

        let contents: Vec<_> = hits.iter().map(|h| h.passage.content.as_str()).collect();
        assert_eq!(contents, vec!["Pump and valve", "valve only", "pump only"]);
        assert_eq!(hits[0].match_count, 2);
        assert_eq!(hits[1].match_count, 1);

        let limited = store.search_keywords(1, &keywords(&["pump", "valve"]), 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_keyword_wildcards_match_literally() {
        let (_dir, store) = create_test_store();
        ingest(&store, 1, "a.txt", "g1", &["rate is 50% now", "file_name field", "plain"]);

        let percent = store.search_keywords(1, &keywords(&["50%"]), 10).unwrap();
        assert_eq!(percent.len(), 1);

        let underscore = store.search_keywords(1, &keywords(&["e_n"]), 10).unwrap();
        assert_eq!(underscore.len(), 1);
        assert_eq!(underscore[0].passage.content, "file_name field");

        let injection = store
            .search_keywords(1, &keywords(&["' OR 1=1 --", "%"]), 10)
            .unwrap();
        assert_eq!(injection.len(), 1);
        assert_eq!(injection[0].passage.content, "rate is 50% now");
    }

    #[test]
    fn test_similarity_threshold_and_order() {
        let (_dir, store) = create_test_store();
        ingest(&store, 1, "a.txt", "g1", &["zero", "one", "two"]);

        // embeddings are [1, idx, 0]
        let all = store.similar_passages(1, &[1.0, 0.0, 0.0], 10, None).unwrap();
        let contents: Vec<_> = all.iter().map(|m| m.passage.content.as_str()).collect();
        assert_eq!(contents, vec!["zero", "one", "two"]);
        assert!((all[0].similarity - 1.0).abs() < 1e-5);

        let strict = store
            .similar_passages(1, &[1.0, 0.0, 0.0], 10, Some(0.9))
            .unwrap();
        assert_eq!(strict.len(), 1);

        let capped = store.similar_passages(1, &[1.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn test_list_files_groups_and_filters() {
        let (_dir, store) = create_test_store();
        ingest(&store, 1, "a.txt", "g1", &["a1", "a2", "a3"]);
        ingest(&store, 1, "b.txt", "g2", &["b1"]);

        let mut pdf = entry(1, "c.pdf", "g3", 0, "c1");
        pdf.display_type = "pdf".to_string();
        store.insert_passages(&[pdf]).unwrap();
        store.publish_generation(1, "c.pdf", "g3").unwrap();

        let (items, total) = store.list_files(1, &[], 10, 0).unwrap();
        assert_eq!(total, 3);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].file_name, "c.pdf");

        let a = items.iter().find(|i| i.file_name == "a.txt").unwrap();
        let last_a = store.file_passages(1, "a.txt").unwrap().last().unwrap().id;
        assert_eq!(a.id, last_a);

        let (page, total) = store.list_files(1, &[], 2, 2).unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);

        let (pdfs, total) = store.list_files(1, &["pdf".to_string()], 10, 0).unwrap();
        assert_eq!(total, 1);
        assert_eq!(pdfs[0].display_type, "pdf");

        let (other_owner, total) = store.list_files(2, &[], 10, 0).unwrap();
        assert!(other_owner.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn test_delete_by_file_and_owner() {
        let (_dir, store) = create_test_store();
        ingest(&store, 1, "a.txt", "g1", &["a1", "a2"]);
        ingest(&store, 1, "b.txt", "g2", &["b1"]);
        ingest(&store, 2, "a.txt", "g3", &["other"]);

        assert_eq!(store.delete_passages(&PassageFilter::file(1, "a.txt")).unwrap(), 2);
        assert!(store.file_passages(1, "a.txt").unwrap().is_empty());
        assert_eq!(store.file_passages(2, "a.txt").unwrap().len(), 1);

        assert_eq!(store.delete_passages(&PassageFilter::owner(1)).unwrap(), 1);
        let stats = store.stats().unwrap();
        assert_eq!(stats.passage_count, 1);
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.owner_count, 1);
    }

    #[test]
    fn test_stats_counts_bytes() {
        let store = KnowledgeStore::open_in_memory().unwrap();
        ingest(&store, 1, "a.txt", "g1", &["1234567890", "한글"]);

        let stats = store.stats().unwrap();
        assert_eq!(stats.passage_count, 2);
        assert_eq!(stats.total_content_bytes, 10 + 6);
    }

    #[test]
    fn test_passage_serializes_camel_case() {
        let store = KnowledgeStore::open_in_memory().unwrap();
        ingest(&store, 1, "a.txt", "g1", &["content"]);

        let passage = &store.file_passages(1, "a.txt").unwrap()[0];
        let json = serde_json::to_value(passage).unwrap();
        assert_eq!(json["fileName"], "a.txt");
        assert_eq!(json["type"], "text");
        assert!(json.get("createdAt").is_some());
    }

    #[tokio::test]
    async fn test_vector_store_trait() {
        let (_dir, store) = create_test_store();
        let vector: &dyn VectorStore = &store;

        let written = vector
            .insert_batch(&[entry(1, "a.txt", "g1", 0, "alpha")])
            .await
            .unwrap();
        assert_eq!(written, 1);
        store.publish_generation(1, "a.txt", "g1").unwrap();

        let hits = vector.query_similar(1, &[1.0, 0.0, 0.0], 5, Some(0.5)).await.unwrap();
        assert_eq!(hits.len(), 1);

        let removed = vector.delete_by_filter(&PassageFilter::owner(1)).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_corrupt_timestamp_is_storage_error() {
        let (_dir, store) = create_test_store();
        ingest(&store, 1, "a.txt", "g1", &["content"]);
        let id = store.file_passages(1, "a.txt").unwrap()[0].id;

        store
            .conn()
            .unwrap()
            .execute("UPDATE passages SET created_at = 'not a date'", [])
            .unwrap();

        assert!(matches!(
            store.list_files(1, &[], 10, 0),
            Err(KnowledgeError::Storage(_))
        ));
        assert!(matches!(
            store.find_passage(1, id),
            Err(KnowledgeError::Storage(_))
        ));
    }

    #[test]
    fn test_list_files_rejects_unrepresentable_offset() {
        let (_dir, store) = create_test_store();
        ingest(&store, 1, "a.txt", "g1", &["content"]);

        let err = store.list_files(1, &[], 10, usize::MAX).unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let (items, total) = store.list_files(1, &[], 10, 0).unwrap();
        assert_eq!((items.len(), total), (1, 1));
    }
}
