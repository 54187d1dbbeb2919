mod cli;
mod config;
mod database;
mod embedding;
mod engine;
mod errors;
mod profile;
mod retrieval;
mod scoring;
mod similarity;
mod store;
mod time_window;

#[cfg(test)]
mod tests;

pub use cli::{parse_args, Args, Command};
pub use config::{Config, DatabaseConfig, EmbeddingConfig, MatchingConfig};
pub use database::VectorDB;
pub use embedding::{
    build_embedding_text, BulkReport, EmbeddingPipeline, EmbeddingProvider, EmbeddingStats,
    HttpEmbeddingClient,
};
pub use engine::{
    EffectiveParams, MatchDefaults, MatchEngine, MatchQuery, MatchResponse, MatchResult,
};
pub use errors::MatchError;
pub use profile::{CommuteWindow, Profile, Weekday};
pub use retrieval::{Candidate, DEFAULT_CANDIDATE_POOL};
pub use scoring::{ComponentScores, MatchWeights};
pub use similarity::{cosine_similarity, jaccard, profession_match, time_overlap_ratio};
pub use store::{ProfileStore, ScoredId, UserDirectory, VectorIndex};
pub use time_window::{minute_of_day, normalize_window, CommuteSegment, MINUTES_PER_DAY};
