//! Hybrid scoring and ranking over an in-memory candidate pool: pure
//! functions, no database in sight.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::profile::Profile;
use crate::retrieval::Candidate;
use crate::similarity::{jaccard, profession_match, time_overlap_ratio};

/// Relative contribution of each component. Weights need not sum to 1; the
/// hybrid score is the plain weighted sum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchWeights {
    #[serde(default = "default_time")]
    pub time: f32,
    #[serde(default = "default_days")]
    pub days: f32,
    #[serde(default = "default_lang")]
    pub lang: f32,
    #[serde(default = "default_ints")]
    pub ints: f32,
    #[serde(default = "default_sem")]
    pub sem: f32,
    #[serde(default = "default_prof")]
    pub prof: f32,
}

fn default_time() -> f32 {
    0.30
}
fn default_days() -> f32 {
    0.20
}
fn default_lang() -> f32 {
    0.10
}
fn default_ints() -> f32 {
    0.15
}
fn default_sem() -> f32 {
    0.20
}
fn default_prof() -> f32 {
    0.05
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            time: default_time(),
            days: default_days(),
            lang: default_lang(),
            ints: default_ints(),
            sem: default_sem(),
            prof: default_prof(),
        }
    }
}

/// Raw per-component values, returned alongside the hybrid score so callers
/// can explain a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComponentScores {
    pub sem_sim: f32,
    pub time_ratio: f32,
    pub day_jac: f32,
    pub lang_jac: f32,
    pub ints_jac: f32,
    pub prof_match: f32,
}

impl ComponentScores {
    pub fn hybrid(&self, weights: &MatchWeights) -> f32 {
        weights.time * self.time_ratio
            + weights.days * self.day_jac
            + weights.lang * self.lang_jac
            + weights.ints * self.ints_jac
            + weights.sem * self.sem_sim
            + weights.prof * self.prof_match
    }
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub profile: Profile,
    pub hybrid_score: f32,
    pub components: ComponentScores,
}

/// Computes the heuristic components between two profiles. `sem_sim` is
/// passed in: the ranking path uses the index-reported similarity, the
/// pairwise diagnostic recomputes cosine from stored embeddings.
pub fn component_scores(requester: &Profile, candidate: &Profile, sem_sim: f32) -> ComponentScores {
    ComponentScores {
        sem_sim,
        time_ratio: time_overlap_ratio(&requester.commute_segments(), &candidate.commute_segments()),
        day_jac: jaccard(&requester.day_names(), &candidate.day_names()),
        lang_jac: jaccard(&requester.languages, &candidate.languages),
        ints_jac: jaccard(&requester.interests, &candidate.interests),
        prof_match: profession_match(&requester.profession, &candidate.profession),
    }
}

/// Scores the pool, drops candidates under `min_score`, sorts by hybrid
/// score descending with a user-id tie-break, and truncates to `limit`.
pub fn rank_candidates(
    requester: &Profile,
    pool: Vec<Candidate>,
    weights: &MatchWeights,
    min_score: f32,
    limit: usize,
) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = pool
        .into_iter()
        .map(|c| {
            let components = component_scores(requester, &c.profile, c.reported_similarity);
            ScoredCandidate {
                hybrid_score: components.hybrid(weights),
                components,
                profile: c.profile,
            }
        })
        .filter(|s| s.hybrid_score >= min_score)
        .collect();

    scored.sort_by(|a, b| {
        b.hybrid_score
            .partial_cmp(&a.hybrid_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.profile.user_id.cmp(&b.profile.user_id))
    });
    scored.truncate(limit);
    scored
}
