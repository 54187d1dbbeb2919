use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::MatchingConfig;
use crate::embedding::{build_embedding_text, EmbeddingPipeline, EmbeddingProvider};
use crate::errors::MatchError;
use crate::profile::Profile;
use crate::retrieval::{retrieve_candidates, DEFAULT_CANDIDATE_POOL};
use crate::scoring::{component_scores, rank_candidates, ComponentScores, MatchWeights};
use crate::similarity::cosine_similarity;
use crate::store::{ProfileStore, UserDirectory, VectorIndex};

/// Engine-level defaults applied when a query leaves a parameter unset.
#[derive(Debug, Clone, Copy)]
pub struct MatchDefaults {
    pub limit: usize,
    pub min_score: f32,
    pub candidate_pool: usize,
    pub weights: MatchWeights,
}

impl Default for MatchDefaults {
    fn default() -> Self {
        Self {
            limit: 50,
            min_score: 0.1,
            candidate_pool: DEFAULT_CANDIDATE_POOL,
            weights: MatchWeights::default(),
        }
    }
}

impl From<&MatchingConfig> for MatchDefaults {
    fn from(config: &MatchingConfig) -> Self {
        Self {
            limit: config.limit,
            min_score: config.min_score,
            candidate_pool: config.candidate_pool,
            weights: config.weights,
        }
    }
}

/// One match request. Unset fields fall back to the engine defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchQuery {
    pub user_id: String,
    #[serde(default)]
    pub weights: Option<MatchWeights>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EffectiveParams {
    pub weights: MatchWeights,
    pub limit: usize,
    pub min_score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub user_id: String,
    pub display_name: String,
    pub hybrid_score: f32,
    pub components: ComponentScores,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResponse {
    pub matches: Vec<MatchResult>,
    pub count: usize,
    pub params: EffectiveParams,
}

/// The hybrid matching engine. All collaborators are injected; the engine
/// holds no ambient state and every request reads its own snapshot.
pub struct MatchEngine {
    store: Arc<dyn ProfileStore>,
    index: Arc<dyn VectorIndex>,
    directory: Arc<dyn UserDirectory>,
    pipeline: EmbeddingPipeline,
    defaults: MatchDefaults,
}

impl MatchEngine {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        provider: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        directory: Arc<dyn UserDirectory>,
        defaults: MatchDefaults,
    ) -> Self {
        let pipeline = EmbeddingPipeline::new(store.clone(), provider);
        Self {
            store,
            index,
            directory,
            pipeline,
            defaults,
        }
    }

    pub fn pipeline(&self) -> &EmbeddingPipeline {
        &self.pipeline
    }

    /// Writes a preference update. If the update changes the embedding text,
    /// the cached embedding is cleared so stale vectors never reach scoring;
    /// an unchanged text keeps the stored embedding.
    pub async fn save_preferences(&self, mut profile: Profile) -> Result<Profile, MatchError> {
        let text = build_embedding_text(&profile);

        match self.store.get_profile(&profile.user_id).await? {
            Some(existing) if existing.embedding_text == text => {
                profile.embedding = existing.embedding;
                profile.embedding_version = existing.embedding_version;
            }
            _ => {
                debug!(user_id = %profile.user_id, "preferences changed, invalidating embedding");
                profile.embedding = None;
                profile.embedding_version = String::new();
            }
        }

        profile.embedding_text = text;
        self.store.upsert_profile(&profile).await?;
        Ok(profile)
    }

    /// Ranks commute-partner candidates for one user.
    #[tracing::instrument(skip(self, query), fields(user_id = %query.user_id))]
    pub async fn find_matches(&self, query: &MatchQuery) -> Result<MatchResponse, MatchError> {
        let requester = self
            .store
            .get_profile(&query.user_id)
            .await?
            .ok_or_else(|| MatchError::ProfileNotFound(query.user_id.clone()))?;

        let params = EffectiveParams {
            weights: query.weights.unwrap_or(self.defaults.weights),
            limit: query.limit.unwrap_or(self.defaults.limit),
            min_score: query.min_score.unwrap_or(self.defaults.min_score),
        };

        let pool = retrieve_candidates(
            self.store.as_ref(),
            self.index.as_ref(),
            &requester,
            self.defaults.candidate_pool,
        )
        .await?;

        let ranked = rank_candidates(
            &requester,
            pool,
            &params.weights,
            params.min_score,
            params.limit,
        );

        let mut matches = Vec::with_capacity(ranked.len());
        for scored in ranked {
            let display_name = self
                .directory
                .display_name(&scored.profile.user_id)
                .await?
                .unwrap_or_else(|| scored.profile.user_id.clone());
            matches.push(MatchResult {
                user_id: scored.profile.user_id,
                display_name,
                hybrid_score: scored.hybrid_score,
                components: scored.components,
            });
        }

        info!(count = matches.len(), "match request complete");
        Ok(MatchResponse {
            count: matches.len(),
            matches,
            params,
        })
    }

    /// Raw component values between two specific users, with cosine
    /// recomputed from their stored embeddings. No weighting, no ranking.
    pub async fn similarity_metrics(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<ComponentScores, MatchError> {
        let a = self
            .store
            .get_profile(user_a)
            .await?
            .ok_or_else(|| MatchError::ProfileNotFound(user_a.to_string()))?;
        let b = self
            .store
            .get_profile(user_b)
            .await?
            .ok_or_else(|| MatchError::ProfileNotFound(user_b.to_string()))?;

        let sem_sim = match (a.embedding.as_deref(), b.embedding.as_deref()) {
            (Some(va), Some(vb)) => cosine_similarity(va, vb),
            _ => 0.0,
        };

        Ok(component_scores(&a, &b, sem_sim))
    }
}
