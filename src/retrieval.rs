//! Candidate retrieval: bound the pool via approximate nearest-neighbor
//! search, then apply cheap pre-filters. No hybrid scoring happens here.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::errors::MatchError;
use crate::profile::{Profile, Weekday};
use crate::store::{ProfileStore, VectorIndex};

/// Oversized ANN pool fetched before filtering and scoring.
pub const DEFAULT_CANDIDATE_POOL: usize = 200;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub profile: Profile,
    /// Similarity reported by the vector index for this candidate.
    pub reported_similarity: f32,
}

/// Drops the requester themselves, candidates without an embedding, and —
/// when the requester has commute days — candidates whose days do not
/// intersect them. Day filtering here is a coarse gate; the day Jaccard term
/// still runs during scoring.
pub fn prefilter_candidates(requester: &Profile, pool: Vec<Candidate>) -> Vec<Candidate> {
    let wanted_days: HashSet<Weekday> = requester.commute_days.iter().copied().collect();

    pool.into_iter()
        .filter(|c| c.profile.user_id != requester.user_id)
        .filter(|c| c.profile.has_embedding())
        .filter(|c| {
            wanted_days.is_empty()
                || c.profile.commute_days.iter().any(|d| wanted_days.contains(d))
        })
        .collect()
}

/// Fetches the ANN pool for the requester and pre-filters it. The requester
/// must already have an embedding; a missing one is a hard precondition
/// failure, not an empty result.
pub async fn retrieve_candidates(
    store: &dyn ProfileStore,
    index: &dyn VectorIndex,
    requester: &Profile,
    pool_size: usize,
) -> Result<Vec<Candidate>, MatchError> {
    let Some(embedding) = requester.embedding.as_deref().filter(|v| !v.is_empty()) else {
        return Err(MatchError::MissingEmbedding(requester.user_id.clone()));
    };

    let hits = index.top_k(embedding, pool_size).await?;
    debug!(user_id = %requester.user_id, hits = hits.len(), "vector index returned pool");

    let ids: Vec<String> = hits.iter().map(|h| h.user_id.clone()).collect();
    let mut by_id: HashMap<String, Profile> = store
        .get_profiles(&ids)
        .await?
        .into_iter()
        .map(|p| (p.user_id.clone(), p))
        .collect();

    // Keep the index's reported order and similarity.
    let pool: Vec<Candidate> = hits
        .into_iter()
        .filter_map(|hit| {
            by_id.remove(&hit.user_id).map(|profile| Candidate {
                profile,
                reported_similarity: hit.similarity,
            })
        })
        .collect();

    let filtered = prefilter_candidates(requester, pool);
    debug!(user_id = %requester.user_id, candidates = filtered.len(), "pool after pre-filters");
    Ok(filtered)
}
