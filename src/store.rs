//! Collaborator capabilities the engine is built against. Concrete
//! implementations (LanceDB, in-memory test doubles) are injected at
//! construction time; the engine never reaches for ambient state.

use async_trait::async_trait;

use crate::errors::MatchError;
use crate::profile::Profile;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, MatchError>;

    /// Batch fetch preserving no particular order; callers re-associate by id.
    async fn get_profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>, MatchError>;

    /// Profiles whose embedding or embedding text is absent, for backfill.
    async fn profiles_missing_embedding(&self, limit: usize)
        -> Result<Vec<Profile>, MatchError>;

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), MatchError>;

    /// Persists a freshly generated embedding together with the text and
    /// provider version it was generated from.
    async fn update_embedding(
        &self,
        user_id: &str,
        text: &str,
        vector: &[f32],
        version: &str,
    ) -> Result<(), MatchError>;

    async fn count_profiles(&self) -> Result<usize, MatchError>;

    async fn count_profiles_with_embedding(&self) -> Result<usize, MatchError>;
}

/// One approximate-nearest-neighbor hit, with the index's reported
/// similarity (already in cosine terms for normalized embeddings).
#[derive(Debug, Clone)]
pub struct ScoredId {
    pub user_id: String,
    pub similarity: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn top_k(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>, MatchError>;
}

/// Resolves display names for result presentation only; never scored.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_name(&self, user_id: &str) -> Result<Option<String>, MatchError>;
}
