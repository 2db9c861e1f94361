//! PostgreSQL with the pgvector extension.
//!
//! One table holds every chunk. Similarity is cosine: `1 - (embedding <=> $1)`.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{VectorBackend, VectorStoreError, VectorStoreResult, check_dimensions};
use crate::models::{Chunk, OwnerScope, SearchResult, StoredChunk};

pub struct PgvectorStore {
    pool: PgPool,
    table_name: String,
    dimensions: usize,
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    id: Uuid,
    filename: String,
    content: String,
    metadata: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ScoredRow {
    #[sqlx(flatten)]
    chunk: ChunkRow,
    similarity: f64,
}

impl From<ChunkRow> for StoredChunk {
    fn from(row: ChunkRow) -> Self {
        Self {
            id: row.id,
            filename: row.filename,
            content: row.content,
            metadata: row
                .metadata
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            created_at: row.created_at,
        }
    }
}

impl PgvectorStore {
    /// `table_name` must be a plain SQL identifier; configuration validates it.
    pub fn new(pool: PgPool, table_name: String, dimensions: usize) -> Self {
        Self {
            pool,
            table_name,
            dimensions,
        }
    }

    /// Create the extension, the chunk table and its indexes.
    ///
    /// This should be called once during application startup.
    #[instrument(skip(self), fields(backend = "pgvector", operation = "initialize"))]
    pub async fn initialize(&self) -> VectorStoreResult<()> {
        let start = Instant::now();
        info!(
            stage = "vector_operation_started",
            backend = "pgvector",
            operation = "initialize",
            table_name = %self.table_name,
            dimensions = self.dimensions,
            "Starting pgvector initialization"
        );

        let statements = [
            "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id UUID PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    conversation_id TEXT NOT NULL,
                    filename TEXT NOT NULL,
                    content TEXT NOT NULL,
                    embedding vector({dims}) NOT NULL,
                    metadata JSONB,
                    created_at TIMESTAMPTZ NOT NULL
                )
                "#,
                table = self.table_name,
                dims = self.dimensions
            ),
            format!(
                r#"
                CREATE INDEX IF NOT EXISTS {table}_embedding_idx ON {table}
                USING hnsw (embedding vector_cosine_ops)
                WITH (m = 16, ef_construction = 64)
                "#,
                table = self.table_name
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_scope_idx \
                 ON {table} (user_id, conversation_id, created_at DESC)",
                table = self.table_name
            ),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| VectorStoreError::Database(e.to_string()))?;
        }

        info!(
            stage = "vector_operation_completed",
            backend = "pgvector",
            operation = "initialize",
            status = "success",
            duration_ms = start.elapsed().as_millis() as u64,
            "Pgvector initialization completed"
        );
        Ok(())
    }

    /// Convert f64 slice to the format expected by pgvector.
    fn vec_to_pgvector(vec: &[f64]) -> String {
        let values: Vec<String> = vec.iter().map(|v| v.to_string()).collect();
        format!("[{}]", values.join(","))
    }

    async fn scoped_rows(
        &self,
        operation: &'static str,
        scope: &OwnerScope,
        limit: usize,
    ) -> VectorStoreResult<Vec<StoredChunk>> {
        let start = Instant::now();
        let query = format!(
            r#"
            SELECT id, filename, content, metadata::TEXT AS metadata, created_at
            FROM {}
            WHERE user_id = $1 AND conversation_id = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
            self.table_name
        );
        let result: Result<Vec<ChunkRow>, _> = sqlx::query_as(&query)
            .bind(&scope.user_id)
            .bind(&scope.conversation_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await;

        let rows = log_outcome(operation, start, result)?;
        Ok(rows.into_iter().map(StoredChunk::from).collect())
    }
}

fn log_outcome<T>(
    operation: &'static str,
    start: Instant,
    result: Result<T, sqlx::Error>,
) -> VectorStoreResult<T> {
    let duration_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(value) => {
            debug!(
                stage = "vector_operation_completed",
                backend = "pgvector",
                operation,
                status = "success",
                duration_ms,
                "Vector store operation completed"
            );
            Ok(value)
        }
        Err(e) => {
            warn!(
                stage = "vector_operation_completed",
                backend = "pgvector",
                operation,
                status = "error",
                duration_ms,
                error = %e,
                "Vector store operation failed"
            );
            Err(VectorStoreError::Database(e.to_string()))
        }
    }
}

#[async_trait]
impl VectorBackend for PgvectorStore {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    #[instrument(
        skip(self, chunk),
        fields(backend = "pgvector", operation = "insert", id = %chunk.id)
    )]
    async fn insert(&self, chunk: Chunk) -> VectorStoreResult<()> {
        check_dimensions(self.dimensions, &chunk.embedding)?;
        let start = Instant::now();
        let query = format!(
            r#"
            INSERT INTO {}
                (id, user_id, conversation_id, filename, content, embedding, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6::vector, $7, $8)
            "#,
            self.table_name
        );
        let result = sqlx::query(&query)
            .bind(chunk.id)
            .bind(&chunk.scope.user_id)
            .bind(&chunk.scope.conversation_id)
            .bind(&chunk.filename)
            .bind(&chunk.content)
            .bind(Self::vec_to_pgvector(&chunk.embedding))
            .bind(serde_json::Value::Object(chunk.metadata))
            .bind(chunk.created_at)
            .execute(&self.pool)
            .await;
        log_outcome("insert", start, result).map(|_| ())
    }

    #[instrument(
        skip(self, embedding),
        fields(backend = "pgvector", operation = "search", scope = %scope, limit)
    )]
    async fn search(
        &self,
        embedding: &[f64],
        scope: &OwnerScope,
        threshold: f64,
        limit: usize,
    ) -> VectorStoreResult<Vec<SearchResult>> {
        check_dimensions(self.dimensions, embedding)?;
        let start = Instant::now();
        let query = format!(
            r#"
            SELECT id, filename, content, metadata::TEXT AS metadata, created_at,
                   (1 - (embedding <=> $1::vector))::FLOAT8 AS similarity
            FROM {}
            WHERE user_id = $2 AND conversation_id = $3
              AND 1 - (embedding <=> $1::vector) >= $4
            ORDER BY embedding <=> $1::vector
            LIMIT $5
            "#,
            self.table_name
        );
        let result: Result<Vec<ScoredRow>, _> = sqlx::query_as(&query)
            .bind(Self::vec_to_pgvector(embedding))
            .bind(&scope.user_id)
            .bind(&scope.conversation_id)
            .bind(threshold)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await;

        let rows = log_outcome("search", start, result)?;
        Ok(rows
            .into_iter()
            .map(|row| SearchResult::new(row.chunk.into(), row.similarity.clamp(0.0, 1.0)))
            .collect())
    }

    async fn recent(
        &self,
        scope: &OwnerScope,
        limit: usize,
    ) -> VectorStoreResult<Vec<StoredChunk>> {
        self.scoped_rows("recent", scope, limit).await
    }

    async fn all(&self, scope: &OwnerScope, cap: usize) -> VectorStoreResult<Vec<StoredChunk>> {
        self.scoped_rows("all", scope, cap).await
    }

    #[instrument(
        skip(self),
        fields(backend = "pgvector", operation = "delete_conversation", scope = %scope)
    )]
    async fn delete_conversation(&self, scope: &OwnerScope) -> VectorStoreResult<u64> {
        let start = Instant::now();
        let query = format!(
            "DELETE FROM {} WHERE user_id = $1 AND conversation_id = $2",
            self.table_name
        );
        let result = sqlx::query(&query)
            .bind(&scope.user_id)
            .bind(&scope.conversation_id)
            .execute(&self.pool)
            .await;
        log_outcome("delete_conversation", start, result).map(|r| r.rows_affected())
    }

    #[instrument(
        skip(self),
        fields(backend = "pgvector", operation = "delete_document", scope = %scope)
    )]
    async fn delete_document(
        &self,
        scope: &OwnerScope,
        filename: &str,
    ) -> VectorStoreResult<u64> {
        let start = Instant::now();
        let query = format!(
            "DELETE FROM {} WHERE user_id = $1 AND conversation_id = $2 AND filename = $3",
            self.table_name
        );
        let result = sqlx::query(&query)
            .bind(&scope.user_id)
            .bind(&scope.conversation_id)
            .bind(filename)
            .execute(&self.pool)
            .await;
        log_outcome("delete_document", start, result).map(|r| r.rows_affected())
    }

    async fn health_check(&self) -> VectorStoreResult<()> {
        let start = Instant::now();
        let query = format!("SELECT EXISTS(SELECT 1 FROM {} LIMIT 1)", self.table_name);
        let result = sqlx::query(&query).execute(&self.pool).await;
        log_outcome("health_check", start, result).map(|_| ())
    }
}
