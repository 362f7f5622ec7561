use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::model::{decode_embedding, encode_embedding, Chunk};

/// Relational store of chunks and per-file ingest progress. Single writer,
/// multi-reader: all writes go through `conn` behind a mutex, matching the
/// spec's "process-wide writer lock" requirement; reads that only need a
/// consistent snapshot also go through the same connection since sqlite
/// itself serializes access per-connection, but the mutex additionally
/// guarantees no caller observes a transaction mid-flight.
pub struct ChunkStore {
    conn: Mutex<Connection>,
}

pub struct IngestProgress {
    pub last_offset: u64,
    pub last_timestamp: Option<String>,
    pub chunk_count: u64,
}

impl ChunkStore {
    pub fn open(path: &str) -> Result<Self, AppError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Create tables/indexes if absent; verify integrity if present.
    /// Corruption here is `CorpusCorrupt`, a fatal startup error (spec §7).
    fn ensure_schema(&self) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                locator TEXT NOT NULL,
                span TEXT,
                text TEXT NOT NULL,
                embedding BLOB,
                content_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(content_hash);
            CREATE INDEX IF NOT EXISTS idx_chunks_source_locator ON chunks(source, locator);

            CREATE TABLE IF NOT EXISTS ingest_progress (
                path TEXT PRIMARY KEY,
                last_offset INTEGER NOT NULL DEFAULT 0,
                last_timestamp TEXT,
                chunk_count INTEGER NOT NULL DEFAULT 0
            );",
        )?;

        let check: String = conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .map_err(|e| AppError::CorpusCorrupt(e.to_string()))?;
        if check != "ok" {
            return Err(AppError::CorpusCorrupt(format!(
                "sqlite integrity_check reported: {check}"
            )));
        }
        Ok(())
    }

    /// Upsert a batch of chunks for one ingest transaction (spec §4.2,
    /// §4.5). Chunks that carry no embedding reuse an existing row's
    /// embedding when `content_hash` matches; a locator collision with a
    /// different hash replaces the row. All-or-nothing per call.
    pub fn upsert_batch(&self, chunks: &[Chunk]) -> Result<Vec<i64>, AppError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let existing_by_hash: Option<(i64, Option<Vec<u8>>)> = tx
                .query_row(
                    "SELECT id, embedding FROM chunks WHERE content_hash = ?1 LIMIT 1",
                    params![chunk.content_hash],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((_, embedding)) = &existing_by_hash {
                // Reuse the existing embedding for an identical chunk body,
                // but the new row still needs its own (source, locator).
                let blob = embedding.clone();
                let id = upsert_row(&tx, chunk, blob)?;
                ids.push(id);
                continue;
            }

            let blob = chunk.embedding.as_deref().map(encode_embedding);
            let id = upsert_row(&tx, chunk, blob)?;
            ids.push(id);
        }

        tx.commit()?;
        Ok(ids)
    }

    /// Delete all chunks for a source whose locator starts with the given
    /// prefix (used for incremental/full reindex of a single file).
    pub fn delete_by_source(&self, source: &str, locator_prefix: &str) -> Result<usize, AppError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM chunks WHERE source = ?1 AND locator LIKE ?2",
            params![source, format!("{locator_prefix}%")],
        )?;
        Ok(n)
    }

    /// Stream all `(id, embedding_bytes)` pairs for a source, used only
    /// during Vector Index (re)load. Rows without an embedding are skipped
    /// (invariant I3).
    pub fn iterate_all(&self, source: &str) -> Result<Vec<(i64, Vec<f32>)>, AppError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, embedding FROM chunks WHERE source = ?1 AND embedding IS NOT NULL",
        )?;
        let rows = stmt
            .query_map(params![source], |row| {
                let id: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, blob))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, blob)| (id, decode_embedding(&blob)))
            .collect())
    }

    /// Materialize full chunk rows for a set of ids, used to assemble RAG
    /// hits after a vector search returns ids + scores.
    pub fn read_by_ids(&self, ids: &[i64]) -> Result<Vec<Chunk>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, source, locator, text, embedding, content_hash, created_at \
             FROM chunks WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let rows = stmt
            .query_map(params.as_slice(), |row| {
                let embedding: Option<Vec<u8>> = row.get(4)?;
                Ok(Chunk {
                    id: row.get(0)?,
                    source: row.get(1)?,
                    locator: row.get(2)?,
                    text: row.get(3)?,
                    embedding: embedding.as_deref().map(decode_embedding),
                    content_hash: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Look up a chunk's embedding by content hash, used to skip embedding
    /// calls for unchanged chunks during ingest (spec P5).
    pub fn find_embedding_by_hash(&self, content_hash: &str) -> Result<Option<Vec<f32>>, AppError> {
        let conn = self.conn.lock();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT embedding FROM chunks WHERE content_hash = ?1 AND embedding IS NOT NULL LIMIT 1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.as_deref().map(decode_embedding))
    }

    pub fn get_ingest_offset(&self, path: &str) -> Result<IngestProgress, AppError> {
        let conn = self.conn.lock();
        let row: Option<(i64, Option<String>, i64)> = conn
            .query_row(
                "SELECT last_offset, last_timestamp, chunk_count FROM ingest_progress WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(match row {
            Some((offset, ts, count)) => IngestProgress {
                last_offset: offset as u64,
                last_timestamp: ts,
                chunk_count: count as u64,
            },
            None => IngestProgress {
                last_offset: 0,
                last_timestamp: None,
                chunk_count: 0,
            },
        })
    }

    /// Set the ingest offset atomically with the chunk inserts it
    /// describes (called within the same transaction as `upsert_batch`
    /// conceptually; here exposed as a companion call the watcher issues
    /// inside its own transaction boundary via `with_ingest_transaction`).
    pub fn set_ingest_offset(
        &self,
        path: &str,
        offset: u64,
        last_timestamp: Option<&str>,
        added_chunk_count: u64,
    ) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ingest_progress (path, last_offset, last_timestamp, chunk_count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET
               last_offset = excluded.last_offset,
               last_timestamp = excluded.last_timestamp,
               chunk_count = ingest_progress.chunk_count + excluded.chunk_count",
            params![path, offset as i64, last_timestamp, added_chunk_count as i64],
        )?;
        Ok(())
    }

    /// Perform an ingest batch (chunk upserts + offset advance) as a single
    /// transaction: spec §4.5 requires the offset to move only if the
    /// chunks it describes committed too.
    pub fn commit_ingest_batch(
        &self,
        path: &str,
        chunks: &[Chunk],
        new_offset: u64,
        last_timestamp: Option<&str>,
    ) -> Result<Vec<i64>, AppError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let blob = chunk.embedding.as_deref().map(encode_embedding);
            let id = upsert_row(&tx, chunk, blob)?;
            ids.push(id);
        }
        tx.execute(
            "INSERT INTO ingest_progress (path, last_offset, last_timestamp, chunk_count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET
               last_offset = excluded.last_offset,
               last_timestamp = excluded.last_timestamp,
               chunk_count = ingest_progress.chunk_count + excluded.chunk_count",
            params![path, new_offset as i64, last_timestamp, chunks.len() as i64],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    /// Drop the tracked byte offset for a file so the next watcher tick
    /// re-reads it from byte zero (used by `POST /reindex`).
    pub fn reset_ingest_progress(&self, path: &str) -> Result<(), AppError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM ingest_progress WHERE path = ?1", params![path])?;
        Ok(())
    }

    pub fn chunk_count(&self, source: Option<&str>) -> Result<usize, AppError> {
        let conn = self.conn.lock();
        let count: i64 = match source {
            Some(s) => conn.query_row(
                "SELECT COUNT(*) FROM chunks WHERE source = ?1",
                params![s],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?,
        };
        Ok(count as usize)
    }

    /// Direct cosine-similarity scan over the store, used as the Vector
    /// Index's degraded-mode fallback and as the independent oracle P2
    /// compares the in-memory index against.
    pub fn linear_scan(
        &self,
        source: Option<&str>,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(i64, f32)>, AppError> {
        let rows = match source {
            Some(s) => self.iterate_all(s)?,
            None => {
                let mut all = Vec::new();
                for s in crate::config::SOURCES {
                    all.extend(self.iterate_all(s)?);
                }
                all
            }
        };
        let norm = l2_norm(query);
        let mut scored: Vec<(i64, f32)> = rows
            .into_iter()
            .map(|(id, vec)| {
                let row_norm = l2_norm(&vec);
                let score = if norm > 0.0 && row_norm > 0.0 {
                    dot(query, &vec) / (norm * row_norm)
                } else {
                    0.0
                };
                (id, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(top_k);
        Ok(scored)
    }
}

fn upsert_row(
    tx: &rusqlite::Transaction,
    chunk: &Chunk,
    embedding: Option<Vec<u8>>,
) -> Result<i64, AppError> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM chunks WHERE source = ?1 AND locator = ?2",
            params![chunk.source, chunk.locator],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        tx.execute(
            "UPDATE chunks SET text = ?1, embedding = ?2, content_hash = ?3, created_at = ?4, span = ?5
             WHERE id = ?6",
            params![
                chunk.text,
                embedding,
                chunk.content_hash,
                chunk.created_at,
                chunk.locator,
                id
            ],
        )?;
        Ok(id)
    } else {
        tx.execute(
            "INSERT INTO chunks (source, locator, span, text, embedding, content_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chunk.source,
                chunk.locator,
                chunk.locator,
                chunk.text,
                embedding,
                chunk.content_hash,
                chunk.created_at
            ],
        )?;
        Ok(tx.last_insert_rowid())
    }
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn l2_norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
