//! Engine-level scenarios running against in-memory collaborators: a
//! HashMap-backed profile store, a brute-force cosine index, and a
//! deterministic stub embedding provider.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use crate::engine::{MatchDefaults, MatchEngine, MatchQuery};
use crate::errors::MatchError;
use crate::profile::{CommuteWindow, Profile, Weekday};
use crate::similarity::cosine_similarity;
use crate::store::{ProfileStore, ScoredId, UserDirectory, VectorIndex};
use crate::EmbeddingProvider;

#[derive(Default)]
struct MemoryStore {
    profiles: Mutex<HashMap<String, Profile>>,
}

impl MemoryStore {
    fn insert(&self, profile: Profile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.user_id.clone(), profile);
    }

    fn get(&self, user_id: &str) -> Option<Profile> {
        self.profiles.lock().unwrap().get(user_id).cloned()
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, MatchError> {
        Ok(self.get(user_id))
    }

    async fn get_profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>, MatchError> {
        let guard = self.profiles.lock().unwrap();
        Ok(user_ids
            .iter()
            .filter_map(|id| guard.get(id).cloned())
            .collect())
    }

    async fn profiles_missing_embedding(
        &self,
        limit: usize,
    ) -> Result<Vec<Profile>, MatchError> {
        let guard = self.profiles.lock().unwrap();
        let mut pending: Vec<Profile> = guard
            .values()
            .filter(|p| !p.has_embedding() || p.embedding_text.is_empty())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), MatchError> {
        self.insert(profile.clone());
        Ok(())
    }

    async fn update_embedding(
        &self,
        user_id: &str,
        text: &str,
        vector: &[f32],
        version: &str,
    ) -> Result<(), MatchError> {
        let mut guard = self.profiles.lock().unwrap();
        let profile = guard
            .get_mut(user_id)
            .ok_or_else(|| MatchError::ProfileNotFound(user_id.to_string()))?;
        profile.embedding_text = text.to_string();
        profile.embedding = Some(vector.to_vec());
        profile.embedding_version = version.to_string();
        Ok(())
    }

    async fn count_profiles(&self) -> Result<usize, MatchError> {
        Ok(self.profiles.lock().unwrap().len())
    }

    async fn count_profiles_with_embedding(&self) -> Result<usize, MatchError> {
        Ok(self
            .profiles
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.has_embedding())
            .count())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn display_name(&self, user_id: &str) -> Result<Option<String>, MatchError> {
        Ok(self
            .get(user_id)
            .map(|p| p.display_name)
            .filter(|name| !name.is_empty()))
    }
}

/// Exact cosine search over everything in the store; stands in for the
/// approximate index.
struct BruteForceIndex {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl VectorIndex for BruteForceIndex {
    async fn top_k(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>, MatchError> {
        let guard = self.store.profiles.lock().unwrap();
        let mut hits: Vec<ScoredId> = guard
            .values()
            .filter_map(|p| {
                p.embedding.as_ref().map(|e| ScoredId {
                    user_id: p.user_id.clone(),
                    similarity: cosine_similarity(query, e),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap()
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

/// Deterministic text-to-vector stub; fails for texts containing
/// `fail_marker` to simulate a provider outage.
struct StubProvider {
    dimension: usize,
    fail_marker: Option<&'static str>,
}

impl StubProvider {
    fn reliable(dimension: usize) -> Self {
        Self {
            dimension,
            fail_marker: None,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for StubProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError> {
        if let Some(marker) = self.fail_marker {
            if text.contains(marker) {
                return Err(MatchError::Provider("stubbed provider outage".to_string()));
            }
        }

        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|i| {
                text.bytes()
                    .enumerate()
                    .map(|(j, b)| ((usize::from(b) * (i + j + 3)) % 101) as f32 / 101.0)
                    .sum::<f32>()
            })
            .collect();
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        for x in &mut vector {
            *x /= norm;
        }
        Ok(vector)
    }

    fn model(&self) -> &str {
        "stub-embedding-v1"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn engine_with(store: Arc<MemoryStore>, provider: StubProvider) -> MatchEngine {
    let index = Arc::new(BruteForceIndex {
        store: store.clone(),
    });
    MatchEngine::new(
        store.clone(),
        Arc::new(provider),
        index,
        store,
        MatchDefaults::default(),
    )
}

fn profile(id: &str) -> Profile {
    Profile {
        user_id: id.to_string(),
        display_name: String::new(),
        profession: String::new(),
        about_me: String::new(),
        languages: Vec::new(),
        interests: Vec::new(),
        commute_window: None,
        commute_days: Vec::new(),
        embedding_text: "seeded".to_string(),
        embedding: Some(vec![1.0, 0.0]),
        embedding_version: "stub-embedding-v1".to_string(),
    }
}

fn query(user_id: &str) -> MatchQuery {
    MatchQuery {
        user_id: user_id.to_string(),
        weights: None,
        limit: None,
        min_score: None,
    }
}

#[tokio::test]
async fn ranks_the_reference_scenario() -> Result<(), MatchError> {
    let store = Arc::new(MemoryStore::default());

    let mut alice = profile("alice");
    alice.commute_window = Some(CommuteWindow {
        start: "08:00".to_string(),
        end: "09:00".to_string(),
    });
    alice.commute_days = vec![Weekday::Monday, Weekday::Wednesday];
    alice.languages = vec!["English".to_string()];

    let mut bob = profile("bob");
    bob.display_name = "Bob".to_string();
    bob.commute_window = Some(CommuteWindow {
        start: "08:15".to_string(),
        end: "09:15".to_string(),
    });
    bob.commute_days = vec![Weekday::Monday, Weekday::Friday];
    bob.languages = vec!["English".to_string(), "Spanish".to_string()];

    store.insert(alice);
    store.insert(bob);

    let engine = engine_with(store, StubProvider::reliable(2));
    let response = engine.find_matches(&query("alice")).await?;

    assert_eq!(response.count, 1);
    let top = &response.matches[0];
    assert_eq!(top.user_id, "bob");
    assert_eq!(top.display_name, "Bob");

    let c = &top.components;
    assert!((c.time_ratio - 0.75).abs() < 1e-6);
    assert!((c.day_jac - 1.0 / 3.0).abs() < 1e-6);
    assert!((c.lang_jac - 0.5).abs() < 1e-6);
    assert!((c.sem_sim - 1.0).abs() < 1e-5);
    assert_eq!(c.ints_jac, 0.0);
    assert_eq!(c.prof_match, 0.0);

    // 0.30*0.75 + 0.20*(1/3) + 0.10*0.5 + 0.20*1.0
    assert!((top.hybrid_score - 0.541_666_7).abs() < 1e-5);
    Ok(())
}

#[tokio::test]
async fn min_score_above_any_achievable_score_returns_nothing() -> Result<(), MatchError> {
    let store = Arc::new(MemoryStore::default());
    store.insert(profile("alice"));
    store.insert(profile("bob"));

    let engine = engine_with(store, StubProvider::reliable(2));
    let mut q = query("alice");
    q.min_score = Some(1.1);
    let response = engine.find_matches(&q).await?;

    assert_eq!(response.count, 0);
    assert!(response.matches.is_empty());
    assert_eq!(response.params.min_score, 1.1);
    Ok(())
}

#[tokio::test]
async fn requester_without_embedding_is_a_precondition_failure() {
    let store = Arc::new(MemoryStore::default());
    let mut alice = profile("alice");
    alice.embedding = None;
    store.insert(alice);
    store.insert(profile("bob"));

    let engine = engine_with(store, StubProvider::reliable(2));
    let err = engine.find_matches(&query("alice")).await.unwrap_err();
    assert!(matches!(err, MatchError::MissingEmbedding(id) if id == "alice"));
}

#[tokio::test]
async fn unknown_requester_is_not_found() {
    let store = Arc::new(MemoryStore::default());
    let engine = engine_with(store, StubProvider::reliable(2));
    let err = engine.find_matches(&query("ghost")).await.unwrap_err();
    assert!(matches!(err, MatchError::ProfileNotFound(id) if id == "ghost"));
}

#[tokio::test]
async fn requester_never_matches_themselves() -> Result<(), MatchError> {
    let store = Arc::new(MemoryStore::default());
    store.insert(profile("alice"));

    let engine = engine_with(store, StubProvider::reliable(2));
    let response = engine.find_matches(&query("alice")).await?;
    assert_eq!(response.count, 0);
    Ok(())
}

#[tokio::test]
async fn day_prefilter_drops_candidates_with_disjoint_days() -> Result<(), MatchError> {
    let store = Arc::new(MemoryStore::default());

    let mut alice = profile("alice");
    alice.commute_days = vec![Weekday::Monday];
    let mut weekend = profile("weekend");
    weekend.commute_days = vec![Weekday::Saturday, Weekday::Sunday];
    store.insert(alice);
    store.insert(weekend);

    let engine = engine_with(store, StubProvider::reliable(2));
    let response = engine.find_matches(&query("alice")).await?;
    assert_eq!(response.count, 0);
    Ok(())
}

#[tokio::test]
async fn bulk_generation_isolates_per_profile_failures() -> Result<(), MatchError> {
    let store = Arc::new(MemoryStore::default());
    for id in ["a", "b", "c"] {
        let mut p = profile(id);
        p.embedding = None;
        p.embedding_text.clear();
        if id == "b" {
            p.about_me = "OUTAGE trigger".to_string();
        }
        store.insert(p);
    }

    let engine = engine_with(
        store.clone(),
        StubProvider {
            dimension: 4,
            fail_marker: Some("OUTAGE"),
        },
    );

    let report = engine.pipeline().bulk_generate_embeddings(10).await?;
    assert_eq!(report.processed, 3);
    assert_eq!(report.successful, 2);
    assert_eq!(report.failed, 1);

    assert!(store.get("a").unwrap().has_embedding());
    assert!(!store.get("b").unwrap().has_embedding());
    assert!(store.get("c").unwrap().has_embedding());

    let stats = engine.pipeline().stats().await?;
    assert_eq!(stats.total_users, 3);
    assert_eq!(stats.users_with_embeddings, 2);
    assert_eq!(stats.users_without_embeddings, 1);
    assert_eq!(stats.embedding_coverage, 66.67);
    Ok(())
}

#[tokio::test]
async fn coverage_is_rounded_to_two_decimals() -> Result<(), MatchError> {
    let store = Arc::new(MemoryStore::default());
    store.insert(profile("a"));
    let mut b = profile("b");
    b.embedding = None;
    let mut c = profile("c");
    c.embedding = None;
    store.insert(b);
    store.insert(c);

    let engine = engine_with(store, StubProvider::reliable(2));
    let stats = engine.pipeline().stats().await?;
    assert_eq!(stats.embedding_coverage, 33.33);
    Ok(())
}

#[tokio::test]
async fn empty_store_has_zero_coverage() -> Result<(), MatchError> {
    let store = Arc::new(MemoryStore::default());
    let engine = engine_with(store, StubProvider::reliable(2));
    let stats = engine.pipeline().stats().await?;
    assert_eq!(stats.total_users, 0);
    assert_eq!(stats.embedding_coverage, 0.0);
    Ok(())
}

#[tokio::test]
async fn saving_changed_preferences_invalidates_the_embedding() -> Result<(), MatchError> {
    let store = Arc::new(MemoryStore::default());
    let engine = engine_with(store.clone(), StubProvider::reliable(4));

    let mut p = profile("alice");
    p.embedding = None;
    p.embedding_text.clear();
    p.interests = vec!["chess".to_string()];

    let saved = engine.save_preferences(p.clone()).await?;
    assert!(!saved.embedding_text.is_empty());
    assert!(saved.embedding.is_none());

    engine.pipeline().refresh_user("alice").await?;
    assert!(store.get("alice").unwrap().has_embedding());

    // Re-saving identical preferences keeps the stored embedding.
    let mut unchanged = p.clone();
    unchanged.embedding = None;
    let resaved = engine.save_preferences(unchanged).await?;
    assert!(resaved.embedding.is_some());

    // A preference change clears it.
    let mut changed = p.clone();
    changed.interests.push("cycling".to_string());
    let invalidated = engine.save_preferences(changed).await?;
    assert!(invalidated.embedding.is_none());
    assert!(!store.get("alice").unwrap().has_embedding());
    Ok(())
}

#[tokio::test]
async fn backfill_then_match_round_trip() -> Result<(), MatchError> {
    let store = Arc::new(MemoryStore::default());
    let engine = engine_with(store.clone(), StubProvider::reliable(8));

    for (id, interest) in [("alice", "chess"), ("bob", "chess")] {
        let mut p = profile(id);
        p.embedding = None;
        p.embedding_text.clear();
        p.interests = vec![interest.to_string()];
        engine.save_preferences(p).await?;
    }

    let report = engine.pipeline().bulk_generate_embeddings(10).await?;
    assert_eq!(report.successful, 2);

    let response = engine.find_matches(&query("alice")).await?;
    assert_eq!(response.count, 1);
    assert_eq!(response.matches[0].user_id, "bob");
    assert!(response.matches[0].components.sem_sim > 0.9);
    Ok(())
}

#[tokio::test]
async fn pairwise_metrics_recompute_cosine_from_storage() -> Result<(), MatchError> {
    let store = Arc::new(MemoryStore::default());
    let mut alice = profile("alice");
    alice.embedding = Some(vec![1.0, 0.0]);
    alice.languages = vec!["English".to_string()];
    let mut bob = profile("bob");
    bob.embedding = Some(vec![0.0, 1.0]);
    bob.languages = vec!["english".to_string()];
    store.insert(alice);
    store.insert(bob);

    let engine = engine_with(store, StubProvider::reliable(2));
    let metrics = engine.similarity_metrics("alice", "bob").await?;
    assert!(metrics.sem_sim.abs() < 1e-6);
    assert_eq!(metrics.lang_jac, 1.0);

    let err = engine.similarity_metrics("alice", "ghost").await.unwrap_err();
    assert!(matches!(err, MatchError::ProfileNotFound(id) if id == "ghost"));
    Ok(())
}

#[tokio::test]
async fn pairwise_metrics_degrade_to_zero_without_embeddings() -> Result<(), MatchError> {
    let store = Arc::new(MemoryStore::default());
    let mut alice = profile("alice");
    alice.embedding = None;
    store.insert(alice);
    store.insert(profile("bob"));

    let engine = engine_with(store, StubProvider::reliable(2));
    let metrics = engine.similarity_metrics("alice", "bob").await?;
    assert_eq!(metrics.sem_sim, 0.0);
    Ok(())
}
