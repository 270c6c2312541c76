//! Pattern store: similarity retrieval plus the Laplace learning loop.
//!
//! Patterns live in an in-memory map guarded by an async `RwLock`, so lookups
//! from concurrent jobs never block each other. Writers are serialized per
//! fingerprint with a dedicated mutex; two jobs learning different sites do
//! not contend. Every mutation is written through to the configured
//! [`PatternRepository`].
//!
//! Similarity is delegated to a [`SimilarityIndex`]. The default
//! [`HashedTrigramIndex`] embeds fingerprints as hashed character trigrams.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use adaptcrawl_shared::{
    AdaptError, Pattern, PatternConfig, PatternId, PatternRepository, Result, SelectorSpec,
    SimilarityIndex,
};

// ---------------------------------------------------------------------------
// Similarity index
// ---------------------------------------------------------------------------

/// In-process cosine index over L2-normalised trigram hash vectors.
#[derive(Debug)]
pub struct HashedTrigramIndex {
    dim: usize,
    vectors: RwLock<HashMap<PatternId, Vec<f32>>>,
}

impl HashedTrigramIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim: dim.max(1),
            vectors: RwLock::new(HashMap::new()),
        }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let padded: Vec<char> = format!("  {} ", text.trim().to_lowercase()).chars().collect();
        for window in padded.windows(3) {
            let mut hasher = DefaultHasher::new();
            window.hash(&mut hasher);
            let slot = (hasher.finish() % self.dim as u64) as usize;
            vector[slot] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl SimilarityIndex for HashedTrigramIndex {
    async fn embed(&self, fingerprint_text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(fingerprint_text))
    }

    async fn index(&self, id: PatternId, vector: Vec<f32>) -> Result<()> {
        self.vectors.write().await.insert(id, vector);
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(PatternId, f32)>> {
        let vectors = self.vectors.read().await;
        let mut scored: Vec<(PatternId, f32)> = vectors
            .iter()
            .map(|(id, v)| (*id, v.iter().zip(vector).map(|(a, b)| a * b).sum()))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }
}

// ---------------------------------------------------------------------------
// Pattern store
// ---------------------------------------------------------------------------

/// A retrieved pattern with its similarity to the query fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPattern {
    pub pattern: Pattern,
    pub similarity: f32,
}

/// Shared pattern store used by every job.
pub struct PatternStore {
    patterns: RwLock<HashMap<PatternId, Pattern>>,
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    index: Arc<dyn SimilarityIndex>,
    repository: Option<Arc<dyn PatternRepository>>,
    min_reuse_confidence: f64,
}

impl PatternStore {
    pub fn new(
        config: &PatternConfig,
        index: Arc<dyn SimilarityIndex>,
        repository: Option<Arc<dyn PatternRepository>>,
    ) -> Self {
        Self {
            patterns: RwLock::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
            index,
            repository,
            min_reuse_confidence: config.min_reuse_confidence,
        }
    }

    /// In-memory store with the built-in trigram index and no persistence.
    pub fn in_memory(config: &PatternConfig) -> Self {
        Self::new(config, Arc::new(HashedTrigramIndex::new(config.embedding_dim)), None)
    }

    /// Load every persisted pattern into memory and the similarity index.
    pub async fn load(&self) -> Result<usize> {
        let Some(repository) = &self.repository else {
            return Ok(0);
        };
        let loaded = repository.load_patterns().await?;
        let count = loaded.len();
        for pattern in loaded {
            let vector = self.index.embed(&pattern.fingerprint).await?;
            self.index.index(pattern.id, vector).await?;
            self.patterns.write().await.insert(pattern.id, pattern);
        }
        info!(count, "patterns loaded");
        Ok(count)
    }

    pub async fn get(&self, id: PatternId) -> Option<Pattern> {
        self.patterns.read().await.get(&id).cloned()
    }

    /// All patterns, superseded ones included, by fingerprint then age.
    pub async fn list(&self) -> Vec<Pattern> {
        let mut all: Vec<Pattern> = self.patterns.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            a.fingerprint
                .cmp(&b.fingerprint)
                .then(a.created_at.cmp(&b.created_at))
        });
        all
    }

    /// Up to `k` live patterns most similar to `fingerprint`, best first,
    /// restricted to `confidence >= min_reuse_confidence`.
    #[instrument(skip_all, fields(fingerprint = %fingerprint, k = k))]
    pub async fn retrieve(&self, fingerprint: &str, k: usize) -> Result<Vec<ScoredPattern>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.index.embed(fingerprint).await?;
        let candidates = {
            let patterns = self.patterns.read().await;
            patterns.len()
        };
        let ranked = self.index.query(&vector, candidates).await?;

        let patterns = self.patterns.read().await;
        let hits: Vec<ScoredPattern> = ranked
            .into_iter()
            .filter_map(|(id, similarity)| {
                patterns
                    .get(&id)
                    .filter(|p| p.is_live() && p.confidence() >= self.min_reuse_confidence)
                    .map(|p| ScoredPattern {
                        pattern: p.clone(),
                        similarity,
                    })
            })
            .take(k)
            .collect();
        debug!(hits = hits.len(), "patterns retrieved");
        Ok(hits)
    }

    /// Write back the outcome of using `selector_spec` on `fingerprint`.
    ///
    /// With `Some(id)` the existing pattern is tallied. With `None` a live
    /// pattern for the same fingerprint and identical spec is tallied if one
    /// exists, otherwise a new pattern is created from this first use.
    /// Afterwards, live patterns of the fingerprint that now have strictly
    /// lower confidence than the updated one are superseded by it.
    #[instrument(skip_all, fields(fingerprint = %fingerprint, success = success))]
    pub async fn record_outcome(
        &self,
        pattern_id: Option<PatternId>,
        fingerprint: &str,
        selector_spec: SelectorSpec,
        success: bool,
    ) -> Result<Pattern> {
        let writer = self.writer_for(fingerprint).await;
        let _guard = writer.lock().await;

        let (updated, superseded, created) = {
            let mut patterns = self.patterns.write().await;

            let existing = match pattern_id {
                Some(id) if patterns.contains_key(&id) => Some(id),
                Some(id) => {
                    warn!(%id, "unknown pattern id, matching by fingerprint instead");
                    find_match(&patterns, fingerprint, &selector_spec)
                }
                None => find_match(&patterns, fingerprint, &selector_spec),
            };

            let (id, created) = match existing.and_then(|id| patterns.get_mut(&id)) {
                Some(pattern) => {
                    pattern.record_use(success);
                    (pattern.id, false)
                }
                None => {
                    let pattern = Pattern::first_use(fingerprint, selector_spec, success);
                    let id = pattern.id;
                    patterns.insert(id, pattern);
                    (id, true)
                }
            };

            let superseded = supersede_weaker(&mut patterns, id);
            let updated = patterns.get(&id).cloned();
            (updated, superseded, created)
        };

        let Some(updated) = updated else {
            return Err(AdaptError::Internal(
                "pattern vanished during update".into(),
            ));
        };

        if created {
            let vector = self.index.embed(fingerprint).await?;
            self.index.index(updated.id, vector).await?;
            info!(pattern_id = %updated.id, "new pattern learned");
        }

        if let Some(repository) = &self.repository {
            repository.save_pattern(&updated).await?;
            for pattern in &superseded {
                repository.save_pattern(pattern).await?;
            }
        }

        debug!(
            pattern_id = %updated.id,
            confidence = updated.confidence(),
            uses = updated.use_count(),
            superseded = superseded.len(),
            "pattern outcome recorded"
        );
        Ok(updated)
    }

    async fn writer_for(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        self.writers
            .lock()
            .await
            .entry(fingerprint.to_string())
            .or_default()
            .clone()
    }
}

fn find_match(
    patterns: &HashMap<PatternId, Pattern>,
    fingerprint: &str,
    spec: &SelectorSpec,
) -> Option<PatternId> {
    patterns
        .values()
        .find(|p| p.is_live() && p.fingerprint == fingerprint && &p.selector_spec == spec)
        .map(|p| p.id)
}

/// Mark live same-fingerprint patterns weaker than `winner` as superseded.
fn supersede_weaker(patterns: &mut HashMap<PatternId, Pattern>, winner: PatternId) -> Vec<Pattern> {
    let Some((fingerprint, confidence, live)) = patterns
        .get(&winner)
        .map(|p| (p.fingerprint.clone(), p.confidence(), p.is_live()))
    else {
        return Vec::new();
    };
    if !live {
        return Vec::new();
    }

    let mut superseded = Vec::new();
    for pattern in patterns.values_mut() {
        if pattern.id != winner
            && pattern.is_live()
            && pattern.fingerprint == fingerprint
            && pattern.confidence() < confidence
        {
            pattern.superseded_by = Some(winner);
            superseded.push(pattern.clone());
        }
    }
    superseded
}
