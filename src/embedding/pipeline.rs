use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedding::provider::EmbeddingProvider;
use crate::embedding::text::build_embedding_text;
use crate::errors::MatchError;
use crate::profile::Profile;
use crate::store::ProfileStore;

/// Outcome of a bulk backfill run. Failures are counted per profile, never
/// aborting the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EmbeddingStats {
    pub total_users: usize,
    pub users_with_embeddings: usize,
    pub users_without_embeddings: usize,
    /// Percentage with two decimals, 0.0 when there are no users.
    pub embedding_coverage: f64,
}

/// Orchestrates embedding generation and persistence for profiles that lack
/// a current vector.
pub struct EmbeddingPipeline {
    store: Arc<dyn ProfileStore>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingPipeline {
    pub fn new(store: Arc<dyn ProfileStore>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, provider }
    }

    pub async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, MatchError> {
        self.provider.embed(text).await
    }

    /// Builds the canonical embedding text for a profile and embeds it.
    pub async fn generate_preferences_embedding(
        &self,
        profile: &Profile,
    ) -> Result<(String, Vec<f32>), MatchError> {
        let text = build_embedding_text(profile);
        let vector = self.provider.embed(&text).await?;
        Ok((text, vector))
    }

    /// Generates and persists the embedding for one user.
    pub async fn refresh_user(&self, user_id: &str) -> Result<(), MatchError> {
        let profile = self
            .store
            .get_profile(user_id)
            .await?
            .ok_or_else(|| MatchError::ProfileNotFound(user_id.to_string()))?;

        let (text, vector) = self.generate_preferences_embedding(&profile).await?;
        self.store
            .update_embedding(user_id, &text, &vector, self.provider.model())
            .await?;
        debug!(user_id, "embedding refreshed");
        Ok(())
    }

    pub async fn find_profiles_without_embeddings(
        &self,
        limit: usize,
    ) -> Result<Vec<Profile>, MatchError> {
        self.store.profiles_missing_embedding(limit).await
    }

    /// Backfills embeddings for up to `limit` profiles. One profile's
    /// provider failure is logged and counted without stopping the rest.
    pub async fn bulk_generate_embeddings(&self, limit: usize) -> Result<BulkReport, MatchError> {
        let pending = self.store.profiles_missing_embedding(limit).await?;
        info!(count = pending.len(), "starting bulk embedding generation");

        let mut report = BulkReport {
            processed: 0,
            successful: 0,
            failed: 0,
        };

        for profile in pending {
            report.processed += 1;
            match self.generate_preferences_embedding(&profile).await {
                Ok((text, vector)) => {
                    match self
                        .store
                        .update_embedding(&profile.user_id, &text, &vector, self.provider.model())
                        .await
                    {
                        Ok(()) => report.successful += 1,
                        Err(e) => {
                            warn!(user_id = %profile.user_id, error = %e, "failed to persist embedding");
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(user_id = %profile.user_id, error = %e, "embedding generation failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            processed = report.processed,
            successful = report.successful,
            failed = report.failed,
            "bulk embedding generation finished"
        );
        Ok(report)
    }

    pub async fn stats(&self) -> Result<EmbeddingStats, MatchError> {
        let total_users = self.store.count_profiles().await?;
        let users_with_embeddings = self.store.count_profiles_with_embedding().await?;
        let users_without_embeddings = total_users.saturating_sub(users_with_embeddings);

        let embedding_coverage = if total_users == 0 {
            0.0
        } else {
            let percent = users_with_embeddings as f64 / total_users as f64 * 100.0;
            (percent * 100.0).round() / 100.0
        };

        Ok(EmbeddingStats {
            total_users,
            users_with_embeddings,
            users_without_embeddings,
            embedding_coverage,
        })
    }
}
