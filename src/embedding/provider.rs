use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::errors::MatchError;

/// External text-to-vector provider. The engine never implements the model
/// itself; failures propagate as `MatchError::Provider` and the caller
/// decides retry policy.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError>;

    /// Provider/model identifier, persisted as the embedding version so
    /// stale vectors can be told apart after a model change.
    fn model(&self) -> &str;

    fn dimension(&self) -> usize;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

/// HTTP client for an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbeddingClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
}

impl HttpEmbeddingClient {
    pub fn new(config: &EmbeddingConfig, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key,
            model: config.model.clone(),
            dimension: config.dimension,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MatchError> {
        debug!(chars = text.len(), model = %self.model, "requesting embedding");

        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
            });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?.error_for_status()?;
        let body: EmbeddingResponse = response.json().await?;

        let embedding = body
            .data
            .into_iter()
            .next()
            .map(|row| row.embedding)
            .ok_or_else(|| MatchError::Provider("provider returned no embeddings".to_string()))?;

        if embedding.len() != self.dimension {
            return Err(MatchError::Provider(format!(
                "unexpected embedding dimension: expected {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }

        Ok(embedding)
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_to_provider_wire_shape() {
        let request = EmbeddingRequest {
            model: "text-embedding-3-small",
            input: "Profession: teacher",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "text-embedding-3-small");
        assert_eq!(json["input"], "Profession: teacher");
    }

    #[test]
    fn response_parses_first_embedding() {
        let body = r#"{"data":[{"embedding":[0.1,0.2,0.3]}],"model":"m","usage":{}}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data[0].embedding, vec![0.1, 0.2, 0.3]);
    }
}
