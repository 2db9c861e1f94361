//! Query-time retrieval with bounded fallbacks.
//!
//! Tiers, first non-empty wins:
//!
//! 1. `similarity` at the caller's threshold
//! 2. `relaxed`, once, at the floor threshold (only when the caller's
//!    threshold is above it)
//! 3. `recent` chunks for the scope, scored with a neutral similarity
//! 4. `all` chunks for the scope, capped and newest first
//!
//! The similarity tiers are skipped when the query cannot be embedded.
//! Every tier is scoped to the caller's (user, conversation) pair.

use std::{collections::HashMap, sync::Arc, time::Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{
    cache::{
        EmbeddingService, EmbeddingSource,
        vector_store::{VectorBackend, VectorStoreError, VectorStoreResult},
    },
    config::RetrievalConfig,
    fallback::{FallbackChain, FallbackError},
    models::{OwnerScope, SearchResult, StoredChunk},
};

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("vector store error: {0}")]
    Store(#[from] VectorStoreError),
}

#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub scope: OwnerScope,
    pub query: String,
    /// Minimum similarity; the configured default applies when unset.
    pub threshold: Option<f64>,
    pub limit: Option<usize>,
}

impl RetrievalQuery {
    pub fn new(scope: OwnerScope, query: impl Into<String>) -> Self {
        Self {
            scope,
            query: query.into(),
            threshold: None,
            limit: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Which tier produced the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalTier {
    Similarity,
    Relaxed,
    Recent,
    All,
}

impl RetrievalTier {
    const SIMILARITY: &'static str = "similarity";
    const RELAXED: &'static str = "relaxed";
    const RECENT: &'static str = "recent";
    const ALL: &'static str = "all";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Similarity => Self::SIMILARITY,
            Self::Relaxed => Self::RELAXED,
            Self::Recent => Self::RECENT,
            Self::All => Self::ALL,
        }
    }

    fn from_strategy(name: &str) -> Self {
        match name {
            Self::SIMILARITY => Self::Similarity,
            Self::RELAXED => Self::Relaxed,
            Self::RECENT => Self::Recent,
            _ => Self::All,
        }
    }

    /// Whether results carry computed similarity scores.
    pub fn is_scored(&self) -> bool {
        matches!(self, Self::Similarity | Self::Relaxed)
    }
}

/// Results of one query, grouped by source document.
#[derive(Debug, Clone, Serialize)]
pub struct Retrieval {
    pub results: Vec<SearchResult>,
    pub tier: RetrievalTier,
    /// Tiers run, including the one that produced `results`.
    pub attempts: usize,
    /// Threshold that produced the results, for the scored tiers.
    pub threshold: Option<f64>,
    /// Source of the query embedding, when the query was embedded.
    pub embedding_source: Option<EmbeddingSource>,
}

impl Retrieval {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn context(&self) -> String {
        assemble_context(&self.results)
    }
}

pub struct RetrievalService {
    embeddings: Arc<EmbeddingService>,
    store: Arc<dyn VectorBackend>,
    config: RetrievalConfig,
}

impl RetrievalService {
    pub fn new(
        embeddings: Arc<EmbeddingService>,
        store: Arc<dyn VectorBackend>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embeddings,
            store,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    #[instrument(skip(self, query), fields(scope = %query.scope, query_len = query.query.len()))]
    pub async fn retrieve(&self, query: RetrievalQuery) -> Result<Retrieval, RetrievalError> {
        let start = Instant::now();
        let threshold = query.threshold.unwrap_or(self.config.default_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(RetrievalError::InvalidQuery(format!(
                "threshold must be within 0..=1, got {threshold}"
            )));
        }
        let limit = query.limit.unwrap_or(self.config.default_limit);
        if limit == 0 {
            return Err(RetrievalError::InvalidQuery("limit must be positive".into()));
        }

        let embedding = if query.query.trim().is_empty() {
            None
        } else {
            match self.embeddings.embed(&query.query).await {
                Ok(embedding) => Some(embedding),
                Err(e) => {
                    warn!(
                        stage = "query_embedding_failed",
                        error = %e,
                        "Query embedding failed, using unscored fallbacks"
                    );
                    None
                }
            }
        };

        let scope = &query.scope;
        let vector = embedding.as_ref().map(|e| e.vector.as_slice());
        let floor = self.config.floor_threshold;
        let relax = vector.is_some() && threshold > floor;

        let resolved = FallbackChain::new()
            .then_if(vector.is_some(), RetrievalTier::SIMILARITY, move || {
                self.similarity(vector, scope, threshold, limit)
            })
            .then_if(relax, RetrievalTier::RELAXED, move || {
                self.similarity(vector, scope, floor, limit)
            })
            .then(RetrievalTier::RECENT, || {
                self.unscored(scope, self.config.recent_limit, UnscoredTier::Recent)
            })
            .then(RetrievalTier::ALL, || {
                self.unscored(scope, self.config.all_chunks_cap, UnscoredTier::All)
            })
            .accept_when(|rows: &Vec<SearchResult>| !rows.is_empty())
            .run()
            .await
            .map_err(|e| match e {
                FallbackError::Empty => {
                    RetrievalError::InvalidQuery("no retrieval tiers available".into())
                }
                other => other
                    .into_last()
                    .map(RetrievalError::Store)
                    .unwrap_or_else(|| RetrievalError::InvalidQuery("retrieval failed".into())),
            })?;

        let tier = RetrievalTier::from_strategy(resolved.strategy);
        let results = group_by_document(resolved.value);
        info!(
            stage = "retrieval_completed",
            tier = tier.as_str(),
            attempts = resolved.attempts,
            result_count = results.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Retrieval completed"
        );

        Ok(Retrieval {
            results,
            tier,
            attempts: resolved.attempts,
            threshold: match tier {
                RetrievalTier::Similarity => Some(threshold),
                RetrievalTier::Relaxed => Some(floor),
                _ => None,
            },
            embedding_source: embedding.map(|e| e.source),
        })
    }

    async fn similarity(
        &self,
        vector: Option<&[f64]>,
        scope: &OwnerScope,
        threshold: f64,
        limit: usize,
    ) -> VectorStoreResult<Vec<SearchResult>> {
        match vector {
            Some(vector) => self.store.search(vector, scope, threshold, limit).await,
            None => Ok(Vec::new()),
        }
    }

    async fn unscored(
        &self,
        scope: &OwnerScope,
        limit: usize,
        tier: UnscoredTier,
    ) -> VectorStoreResult<Vec<SearchResult>> {
        let rows: Vec<StoredChunk> = match tier {
            UnscoredTier::Recent => self.store.recent(scope, limit).await?,
            UnscoredTier::All => self.store.all(scope, limit).await?,
        };
        let neutral = self.config.neutral_similarity;
        Ok(rows
            .into_iter()
            .map(|chunk| SearchResult::new(chunk, neutral))
            .collect())
    }
}

impl std::fmt::Debug for RetrievalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalService")
            .field("config", &self.config)
            .field("embeddings", &self.embeddings)
            .finish()
    }
}

#[derive(Clone, Copy)]
enum UnscoredTier {
    Recent,
    All,
}

/// Group rows by filename. Groups are ordered by their best score and rows
/// within a group by similarity, descending; ties keep store order.
pub fn group_by_document(mut rows: Vec<SearchResult>) -> Vec<SearchResult> {
    rows.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<SearchResult>> = HashMap::new();
    for row in rows {
        let filename = row.chunk.filename.clone();
        groups
            .entry(filename.clone())
            .or_insert_with(|| {
                order.push(filename);
                Vec::new()
            })
            .push(row);
    }

    order
        .into_iter()
        .filter_map(|filename| groups.remove(&filename))
        .flatten()
        .collect()
}

/// Build prompt context from grouped results.
///
/// With more than one source document each group is prefixed with a short
/// header naming the document; a single source is emitted as plain passages.
pub fn assemble_context(results: &[SearchResult]) -> String {
    let mut groups: Vec<(&str, Vec<&SearchResult>)> = Vec::new();
    for row in results {
        match groups.last_mut() {
            Some((filename, rows)) if *filename == row.chunk.filename => rows.push(row),
            _ => groups.push((row.chunk.filename.as_str(), vec![row])),
        }
    }

    if groups.len() <= 1 {
        return results
            .iter()
            .map(|r| r.chunk.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
    }

    groups
        .iter()
        .map(|(filename, rows)| {
            let best = rows.iter().map(|r| r.similarity).fold(0.0, f64::max);
            let passages = rows
                .iter()
                .map(|r| r.chunk.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            format!(
                "[Document: {filename} | {} passage{} | relevance {best:.2}]\n{passages}",
                rows.len(),
                if rows.len() == 1 { "" } else { "s" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::Map;
    use uuid::Uuid;

    use super::*;
    use crate::{
        cache::vector_store::InMemoryVectorStore, config::EmbeddingConfig, models::Chunk,
    };

    const DIMS: usize = 256;

    struct Fixture {
        service: RetrievalService,
        embeddings: Arc<EmbeddingService>,
        store: Arc<InMemoryVectorStore>,
    }

    fn fixture_with(config: RetrievalConfig, store_dims: usize) -> Fixture {
        let embeddings = Arc::new(EmbeddingService::new(
            &EmbeddingConfig {
                dimensions: DIMS,
                ..Default::default()
            },
            reqwest::Client::new(),
        ));
        let store = Arc::new(InMemoryVectorStore::new(store_dims));
        Fixture {
            service: RetrievalService::new(embeddings.clone(), store.clone(), config),
            embeddings,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RetrievalConfig::default(), DIMS)
    }

    fn scope() -> OwnerScope {
        OwnerScope::new("alice", "conv-1")
    }

    fn chunk(
        scope: &OwnerScope,
        filename: &str,
        content: &str,
        embedding: Vec<f64>,
        age_secs: i64,
    ) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            scope: scope.clone(),
            filename: filename.into(),
            content: content.into(),
            embedding,
            metadata: Map::new(),
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    impl Fixture {
        async fn store_text(&self, scope: &OwnerScope, filename: &str, content: &str) {
            let vector = self.embeddings.embed(content).await.unwrap().vector;
            self.store
                .insert(chunk(scope, filename, content, vector, 0))
                .await
                .unwrap();
        }
    }

    fn normalize(v: Vec<f64>) -> Vec<f64> {
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        v.into_iter().map(|x| x / norm).collect()
    }

    fn row(filename: &str, content: &str, similarity: f64) -> SearchResult {
        let c = chunk(&scope(), filename, content, Vec::new(), 0);
        SearchResult::new(StoredChunk::from(&c), similarity)
    }

    #[tokio::test]
    async fn test_exact_text_found_by_similarity() {
        let f = fixture();
        let text = "The mitochondria is the powerhouse of the cell.";
        f.store_text(&scope(), "bio.txt", text).await;
        f.store_text(&scope(), "bio.txt", "Unrelated passage about tax law.").await;

        let retrieval = f
            .service
            .retrieve(RetrievalQuery::new(scope(), text))
            .await
            .unwrap();

        assert_eq!(retrieval.tier, RetrievalTier::Similarity);
        assert_eq!(retrieval.attempts, 1);
        assert_eq!(retrieval.results[0].chunk.content, text);
        assert!(retrieval.results[0].similarity > 0.99);
        assert_eq!(retrieval.threshold, Some(0.7));
        assert_eq!(retrieval.embedding_source, Some(EmbeddingSource::Fallback));
    }

    #[tokio::test]
    async fn test_relaxed_tier_runs_once_at_floor() {
        let f = fixture();
        let query = "What did the committee decide?";
        let q = f.embeddings.embed(query).await.unwrap().vector;
        let noise = f.embeddings.embed("an unrelated sentence").await.unwrap().vector;
        // Roughly 0.45 similar to the query
        let blended = normalize(q.iter().zip(&noise).map(|(a, b)| 0.5 * a + b).collect());
        let content = "The committee approved the budget.";
        f.store
            .insert(chunk(&scope(), "minutes.txt", content, blended, 0))
            .await
            .unwrap();

        let retrieval = f
            .service
            .retrieve(RetrievalQuery::new(scope(), query))
            .await
            .unwrap();

        assert_eq!(retrieval.tier, RetrievalTier::Relaxed);
        assert_eq!(retrieval.attempts, 2);
        assert_eq!(retrieval.threshold, Some(0.3));
        let similarity = retrieval.results[0].similarity;
        assert!((0.3..0.7).contains(&similarity), "{similarity}");
    }

    #[tokio::test]
    async fn test_unmatched_query_falls_back_to_recent() {
        let f = fixture();
        f.store_text(&scope(), "a.txt", "Completely different content.").await;

        let retrieval = f
            .service
            .retrieve(RetrievalQuery::new(scope(), "quantum chromodynamics"))
            .await
            .unwrap();

        assert_eq!(retrieval.tier, RetrievalTier::Recent);
        assert_eq!(retrieval.attempts, 3);
        assert_eq!(retrieval.results.len(), 1);
        assert_eq!(retrieval.results[0].similarity, 0.5);
        assert!(retrieval.threshold.is_none());
    }

    #[tokio::test]
    async fn test_no_relaxation_at_floor_threshold() {
        let f = fixture();
        f.store_text(&scope(), "a.txt", "Completely different content.").await;

        let retrieval = f
            .service
            .retrieve(RetrievalQuery::new(scope(), "quantum chromodynamics").with_threshold(0.3))
            .await
            .unwrap();

        assert_eq!(retrieval.tier, RetrievalTier::Recent);
        assert_eq!(retrieval.attempts, 2);
    }

    #[tokio::test]
    async fn test_all_tier_when_recent_is_empty() {
        let f = fixture_with(
            RetrievalConfig {
                recent_limit: 0,
                ..Default::default()
            },
            DIMS,
        );
        f.store_text(&scope(), "a.txt", "Completely different content.").await;

        let retrieval = f
            .service
            .retrieve(RetrievalQuery::new(scope(), "quantum chromodynamics"))
            .await
            .unwrap();

        assert_eq!(retrieval.tier, RetrievalTier::All);
        assert_eq!(retrieval.attempts, 4);
        assert_eq!(retrieval.results.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_scope_returns_nothing() {
        let f = fixture();
        let retrieval = f
            .service
            .retrieve(RetrievalQuery::new(scope(), "anything"))
            .await
            .unwrap();

        assert!(retrieval.is_empty());
        assert_eq!(retrieval.tier, RetrievalTier::All);
        assert_eq!(retrieval.attempts, 4);
    }

    #[tokio::test]
    async fn test_other_scopes_are_never_visible() {
        let f = fixture();
        let text = "Bob's private salary figures.";
        f.store_text(&OwnerScope::new("bob", "conv-1"), "salary.txt", text).await;
        f.store_text(&OwnerScope::new("alice", "conv-2"), "salary.txt", text).await;

        let retrieval = f
            .service
            .retrieve(RetrievalQuery::new(scope(), text))
            .await
            .unwrap();

        assert!(retrieval.is_empty());
    }

    #[tokio::test]
    async fn test_search_failure_falls_through_to_recent() {
        // Store vectors are shorter than query embeddings, so search fails
        let f = fixture_with(RetrievalConfig::default(), 4);
        f.store
            .insert(chunk(&scope(), "a.txt", "stored", vec![1.0, 0.0, 0.0, 0.0], 0))
            .await
            .unwrap();

        let retrieval = f
            .service
            .retrieve(RetrievalQuery::new(scope(), "stored"))
            .await
            .unwrap();

        assert_eq!(retrieval.tier, RetrievalTier::Recent);
        assert_eq!(retrieval.results[0].chunk.content, "stored");
    }

    #[tokio::test]
    async fn test_blank_query_skips_similarity() {
        let f = fixture();
        f.store_text(&scope(), "a.txt", "Some text.").await;

        let retrieval = f
            .service
            .retrieve(RetrievalQuery::new(scope(), "   "))
            .await
            .unwrap();

        assert_eq!(retrieval.tier, RetrievalTier::Recent);
        assert_eq!(retrieval.attempts, 1);
        assert!(retrieval.embedding_source.is_none());
    }

    #[tokio::test]
    async fn test_invalid_threshold_rejected() {
        let f = fixture();
        let err = f
            .service
            .retrieve(RetrievalQuery::new(scope(), "q").with_threshold(1.5))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn test_recent_tier_newest_first() {
        let f = fixture();
        for (age, content) in [(30, "oldest"), (20, "middle"), (10, "newest")] {
            let vector = f.embeddings.embed(content).await.unwrap().vector;
            f.store
                .insert(chunk(&scope(), "log.txt", content, vector, age))
                .await
                .unwrap();
        }

        let retrieval = f
            .service
            .retrieve(RetrievalQuery::new(scope(), "unrelated question"))
            .await
            .unwrap();

        let contents: Vec<&str> = retrieval
            .results
            .iter()
            .map(|r| r.chunk.content.as_str())
            .collect();
        assert_eq!(contents, ["newest", "middle", "oldest"]);
    }

    #[test]
    fn test_group_by_document() {
        let grouped = group_by_document(vec![
            row("b.txt", "b1", 0.6),
            row("a.txt", "a1", 0.9),
            row("b.txt", "b2", 0.8),
            row("a.txt", "a2", 0.7),
        ]);
        let order: Vec<&str> = grouped.iter().map(|r| r.chunk.content.as_str()).collect();
        assert_eq!(order, ["a1", "a2", "b2", "b1"]);
    }

    #[test]
    fn test_context_single_source_has_no_header() {
        let context = assemble_context(&[row("a.txt", "first", 0.9), row("a.txt", "second", 0.8)]);
        assert_eq!(context, "first\n\nsecond");
    }

    #[test]
    fn test_context_multiple_sources_have_headers() {
        let results = group_by_document(vec![
            row("a.txt", "alpha", 0.9),
            row("b.txt", "beta", 0.8),
            row("a.txt", "gamma", 0.7),
        ]);
        let context = assemble_context(&results);
        assert_eq!(
            context,
            "[Document: a.txt | 2 passages | relevance 0.90]\nalpha\n\ngamma\n\n\
             [Document: b.txt | 1 passage | relevance 0.80]\nbeta"
        );
    }

    #[test]
    fn test_context_empty() {
        assert_eq!(assemble_context(&[]), "");
    }
}
