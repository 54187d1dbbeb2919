use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::profile::Profile;
use crate::scoring::MatchWeights;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "data/commutedb".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Environment variable holding the provider API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            dimension: default_dimension(),
        }
    }
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimension() -> usize {
    1536
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,
    #[serde(default)]
    pub weights: MatchWeights,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            min_score: default_min_score(),
            candidate_pool: default_candidate_pool(),
            weights: MatchWeights::default(),
        }
    }
}

fn default_limit() -> usize {
    50
}

fn default_min_score() -> f32 {
    0.1
}

fn default_candidate_pool() -> usize {
    200
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    /// Seed profiles loaded by the `import` command.
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

impl Config {
    pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let f = std::fs::File::open(path)?;
        let config: Config = serde_yaml::from_reader(f)?;
        config.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be positive".to_string());
        }
        if self.matching.limit == 0 {
            return Err("matching.limit must be positive".to_string());
        }
        if self.matching.candidate_pool == 0 {
            return Err("matching.candidate_pool must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.matching.min_score) {
            return Err("matching.min_score must be within [0, 1]".to_string());
        }

        let w = &self.matching.weights;
        for (name, value) in [
            ("time", w.time),
            ("days", w.days),
            ("lang", w.lang),
            ("ints", w.ints),
            ("sem", w.sem),
            ("prof", w.prof),
        ] {
            if value < 0.0 {
                return Err(format!("matching.weights.{name} must not be negative"));
            }
        }

        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if profile.user_id.trim().is_empty() {
                return Err("seed profile with empty user_id".to_string());
            }
            if !seen.insert(profile.user_id.as_str()) {
                return Err(format!("duplicate seed profile: {}", profile.user_id));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_fills_defaults() {
        let config = Config::from_yaml_str("{}").unwrap();
        assert_eq!(config.database.path, "data/commutedb");
        assert_eq!(config.embedding.dimension, 1536);
        assert_eq!(config.matching.limit, 50);
        assert_eq!(config.matching.min_score, 0.1);
        assert_eq!(config.matching.weights, MatchWeights::default());
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn parses_full_config_with_seed_profiles() {
        let yaml = r#"
database:
  path: data/test
embedding:
  model: text-embedding-3-small
  dimension: 8
matching:
  limit: 10
  min_score: 0.2
  weights:
    time: 0.5
    sem: 0.5
profiles:
  - user_id: alice
    display_name: Alice
    profession: teacher
    languages: [English]
    commute_window: { start: "08:00", end: "09:00" }
    commute_days: [MONDAY, WEDNESDAY]
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.embedding.dimension, 8);
        assert_eq!(config.matching.weights.time, 0.5);
        // Unspecified weights keep their defaults.
        assert_eq!(config.matching.weights.days, 0.20);
        assert_eq!(config.profiles.len(), 1);
        assert_eq!(config.profiles[0].commute_days.len(), 2);
    }

    #[test]
    fn rejects_invalid_min_score() {
        let err = Config::from_yaml_str("matching:\n  min_score: 1.5\n").unwrap_err();
        assert!(err.to_string().contains("min_score"));
    }

    #[test]
    fn rejects_duplicate_seed_profiles() {
        let yaml = "profiles:\n  - user_id: bob\n  - user_id: bob\n";
        let err = Config::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
