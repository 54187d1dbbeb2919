mod pipeline;
mod provider;
mod text;

pub use pipeline::{BulkReport, EmbeddingPipeline, EmbeddingStats};
pub use provider::{EmbeddingProvider, HttpEmbeddingClient};
pub use text::build_embedding_text;
