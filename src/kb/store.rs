//! SQLite persistence for documents, versions, chunks, and relationships.
//!
//! All access goes through one [`tokio_rusqlite::Connection`], which
//! serializes structural writes on its background thread. Multi-row
//! writes (document plus version plus chunk set) run inside a single
//! transaction.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_rusqlite::{Connection, OptionalExtension};

use crate::types::{Metadata, Relationship};

use super::{ChangeKind, Document, KbError, Version};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    doc_id          TEXT PRIMARY KEY,
    content         TEXT NOT NULL,
    content_hash    TEXT NOT NULL,
    metadata        TEXT NOT NULL,
    current_version INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(content_hash);

CREATE TABLE IF NOT EXISTS versions (
    version_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id       TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    change_kind  TEXT NOT NULL,
    size_delta   INTEGER NOT NULL,
    metadata     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_versions_doc ON versions(doc_id);

CREATE TABLE IF NOT EXISTS chunks (
    chunk_id TEXT PRIMARY KEY,
    doc_id   TEXT NOT NULL,
    position INTEGER NOT NULL,
    content  TEXT NOT NULL,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id);

CREATE TABLE IF NOT EXISTS relationships (
    source_id         TEXT NOT NULL,
    target_id         TEXT NOT NULL,
    relationship_type TEXT NOT NULL,
    properties        TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id, relationship_type)
);
";

/// Row counts across the authoritative tables.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct KbCounts {
    pub documents: usize,
    pub versions: usize,
    pub chunks: usize,
    pub relationships: usize,
}

/// One document's identity row, without content or history.
#[derive(Clone, Debug, Serialize)]
pub struct DocumentSummary {
    pub doc_id: String,
    pub metadata: Metadata,
    pub current_version: i64,
}

pub(crate) struct DocumentStore {
    conn: Connection,
}

impl DocumentStore {
    pub(crate) async fn open(path: &Path) -> Result<Self, KbError> {
        let conn = Connection::open(path)
            .await
            .map_err(|err| KbError::Storage(err.to_string()))?;
        Self::init(&conn).await?;
        Ok(Self { conn })
    }

    pub(crate) async fn open_in_memory() -> Result<Self, KbError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|err| KbError::Storage(err.to_string()))?;
        Self::init(&conn).await?;
        Ok(Self { conn })
    }

    async fn init(conn: &Connection) -> Result<(), KbError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)
                .map_err(tokio_rusqlite::Error::Rusqlite)
        })
        .await
        .map_err(|err| KbError::Storage(err.to_string()))
    }

    /// Id and current version of the document whose current content has
    /// `content_hash`.
    pub(crate) async fn find_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<(String, i64)>, KbError> {
        let content_hash = content_hash.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT doc_id, current_version FROM documents WHERE content_hash = ?1 LIMIT 1",
                    [&content_hash],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    /// Current content, hash, and version id for one document.
    pub(crate) async fn document_content(
        &self,
        doc_id: &str,
    ) -> Result<Option<(String, String, i64)>, KbError> {
        let doc_id = doc_id.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT content, content_hash, current_version FROM documents WHERE doc_id = ?1",
                    [&doc_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    /// `(doc_id, content)` for every document, used by the near-duplicate
    /// scan.
    pub(crate) async fn all_contents(&self) -> Result<Vec<(String, String)>, KbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT doc_id, content FROM documents ORDER BY rowid")
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut contents = Vec::new();
                for row in rows {
                    contents.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(contents)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    /// Creates a document with its first version, chunk set, and
    /// relationship rows in one transaction. Returns the version id.
    pub(crate) async fn insert_document(
        &self,
        doc_id: &str,
        content: &str,
        content_hash: &str,
        metadata: &Metadata,
        chunks: &[String],
        relationships: &[Relationship],
    ) -> Result<i64, KbError> {
        let doc_id = doc_id.to_string();
        let content = content.to_string();
        let content_hash = content_hash.to_string();
        let metadata_json = metadata_json(metadata)?;
        let chunks = chunks.to_vec();
        let relationships = relationship_rows(relationships)?;
        let created_at = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute(
                    "INSERT INTO versions (doc_id, content_hash, created_at, change_kind, size_delta, metadata) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    (
                        &doc_id,
                        &content_hash,
                        &created_at,
                        ChangeKind::Creation.as_str(),
                        0i64,
                        &metadata_json,
                    ),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let version_id = tx.last_insert_rowid();

                tx.execute(
                    "INSERT INTO documents (doc_id, content, content_hash, metadata, current_version) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    (&doc_id, &content, &content_hash, &metadata_json, version_id),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;

                insert_chunk_rows(&tx, &doc_id, &chunks, &metadata_json)?;
                insert_relationship_rows(&tx, &relationships)?;

                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(version_id)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    /// Appends a new version and atomically replaces the chunk and
    /// relationship sets. Returns the new version id.
    pub(crate) async fn apply_update(
        &self,
        doc_id: &str,
        content: &str,
        content_hash: &str,
        metadata: &Metadata,
        chunks: &[String],
        relationships: &[Relationship],
        size_delta: i64,
    ) -> Result<i64, KbError> {
        let doc_id = doc_id.to_string();
        let content = content.to_string();
        let content_hash = content_hash.to_string();
        let metadata_json = metadata_json(metadata)?;
        let chunks = chunks.to_vec();
        let relationships = relationship_rows(relationships)?;
        let created_at = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute(
                    "INSERT INTO versions (doc_id, content_hash, created_at, change_kind, size_delta, metadata) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    (
                        &doc_id,
                        &content_hash,
                        &created_at,
                        ChangeKind::Update.as_str(),
                        size_delta,
                        &metadata_json,
                    ),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let version_id = tx.last_insert_rowid();

                tx.execute(
                    "UPDATE documents \
                     SET content = ?1, content_hash = ?2, metadata = ?3, current_version = ?4 \
                     WHERE doc_id = ?5",
                    (&content, &content_hash, &metadata_json, version_id, &doc_id),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;

                tx.execute("DELETE FROM chunks WHERE doc_id = ?1", [&doc_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                insert_chunk_rows(&tx, &doc_id, &chunks, &metadata_json)?;

                tx.execute("DELETE FROM relationships WHERE source_id = ?1", [&doc_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                insert_relationship_rows(&tx, &relationships)?;

                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(version_id)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    /// Fetches a document with its full version history and chunk set,
    /// current version resolved.
    pub(crate) async fn get_document(&self, doc_id: &str) -> Result<Option<Document>, KbError> {
        let doc_id = doc_id.to_string();
        self.conn
            .call(move |conn| {
                let head = conn
                    .query_row(
                        "SELECT content, metadata, current_version FROM documents WHERE doc_id = ?1",
                        [&doc_id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, i64>(2)?,
                            ))
                        },
                    )
                    .optional()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let Some((content, metadata_raw, current_id)) = head else {
                    return Ok(None);
                };

                let mut stmt = conn
                    .prepare(
                        "SELECT version_id, content_hash, created_at, change_kind, size_delta, metadata \
                         FROM versions WHERE doc_id = ?1 ORDER BY version_id",
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([&doc_id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;

                let mut version_history = Vec::new();
                for row in rows {
                    let (version_id, content_hash, created_at, change_kind, size_delta, metadata) =
                        row.map_err(tokio_rusqlite::Error::Rusqlite)?;
                    version_history.push(Version {
                        version_id,
                        content_hash,
                        created_at: parse_timestamp(&created_at)
                            .map_err(|err| tokio_rusqlite::Error::Other(Box::new(err)))?,
                        change_kind: ChangeKind::from(change_kind.as_str()),
                        size_delta,
                        metadata: parse_metadata(&metadata),
                    });
                }

                let mut stmt = conn
                    .prepare("SELECT content FROM chunks WHERE doc_id = ?1 ORDER BY position")
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([&doc_id], |row| row.get::<_, String>(0))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut chunks = Vec::new();
                for row in rows {
                    chunks.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }

                let current_version = version_history
                    .iter()
                    .find(|version| version.version_id == current_id)
                    .cloned()
                    .ok_or_else(|| {
                        tokio_rusqlite::Error::Other(Box::new(std::io::Error::other(format!(
                            "document {doc_id} is missing its current version row"
                        ))))
                    })?;

                Ok(Some(Document {
                    doc_id: doc_id.clone(),
                    content,
                    chunks,
                    metadata: parse_metadata(&metadata_raw),
                    current_version,
                    version_history,
                }))
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    /// Removes a document, its versions and chunks, and every relationship
    /// edge incident to it. Returns whether a document row existed.
    pub(crate) async fn delete_document(&self, doc_id: &str) -> Result<bool, KbError> {
        let doc_id = doc_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let removed = tx
                    .execute("DELETE FROM documents WHERE doc_id = ?1", [&doc_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute("DELETE FROM versions WHERE doc_id = ?1", [&doc_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute("DELETE FROM chunks WHERE doc_id = ?1", [&doc_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.execute(
                    "DELETE FROM relationships WHERE source_id = ?1 OR target_id = ?1",
                    [&doc_id],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(removed > 0)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    pub(crate) async fn list_documents(&self) -> Result<Vec<DocumentSummary>, KbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT doc_id, metadata, current_version FROM documents ORDER BY rowid",
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut summaries = Vec::new();
                for row in rows {
                    let (doc_id, metadata, current_version) =
                        row.map_err(tokio_rusqlite::Error::Rusqlite)?;
                    summaries.push(DocumentSummary {
                        doc_id,
                        metadata: parse_metadata(&metadata),
                        current_version,
                    });
                }
                Ok(summaries)
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }

    pub(crate) async fn counts(&self) -> Result<KbCounts, KbError> {
        self.conn
            .call(|conn| {
                let count = |table: &str| -> Result<usize, tokio_rusqlite::Error> {
                    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                        row.get::<_, i64>(0)
                    })
                    .map(|n| n as usize)
                    .map_err(tokio_rusqlite::Error::Rusqlite)
                };
                Ok(KbCounts {
                    documents: count("documents")?,
                    versions: count("versions")?,
                    chunks: count("chunks")?,
                    relationships: count("relationships")?,
                })
            })
            .await
            .map_err(|err| KbError::Storage(err.to_string()))
    }
}

fn insert_chunk_rows(
    tx: &tokio_rusqlite::Transaction<'_>,
    doc_id: &str,
    chunks: &[String],
    metadata_json: &str,
) -> Result<(), tokio_rusqlite::Error> {
    for (position, chunk) in chunks.iter().enumerate() {
        tx.execute(
            "INSERT INTO chunks (chunk_id, doc_id, position, content, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                format!("{doc_id}_chunk_{position}"),
                doc_id,
                position as i64,
                chunk,
                metadata_json,
            ),
        )
        .map_err(tokio_rusqlite::Error::Rusqlite)?;
    }
    Ok(())
}

fn insert_relationship_rows(
    tx: &tokio_rusqlite::Transaction<'_>,
    rows: &[(String, String, String, String)],
) -> Result<(), tokio_rusqlite::Error> {
    for (source_id, target_id, relationship_type, properties) in rows {
        tx.execute(
            "INSERT OR REPLACE INTO relationships (source_id, target_id, relationship_type, properties) \
             VALUES (?1, ?2, ?3, ?4)",
            (source_id, target_id, relationship_type, properties),
        )
        .map_err(tokio_rusqlite::Error::Rusqlite)?;
    }
    Ok(())
}

fn relationship_rows(
    relationships: &[Relationship],
) -> Result<Vec<(String, String, String, String)>, KbError> {
    relationships
        .iter()
        .map(|rel| {
            let properties = serde_json::to_string(&rel.properties)
                .map_err(|err| KbError::Storage(err.to_string()))?;
            Ok((
                rel.source_id.clone(),
                rel.target_id.clone(),
                rel.kind.as_str().to_string(),
                properties,
            ))
        })
        .collect()
}

fn metadata_json(metadata: &Metadata) -> Result<String, KbError> {
    serde_json::to_string(metadata).map_err(|err| KbError::Storage(err.to_string()))
}

fn parse_metadata(raw: &str) -> Metadata {
    serde_json::from_str(raw).unwrap_or_default()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}
