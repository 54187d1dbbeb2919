use std::sync::Arc;

use anyhow::Result as AnyhowResult;
use tracing::info;
use tracing_subscriber::EnvFilter;

use commute_matcher::{
    parse_args, Command, Config, HttpEmbeddingClient, MatchDefaults, MatchEngine, MatchQuery,
    VectorDB,
};

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let args = parse_args();

    let default_filter = if args.debug {
        "commute_matcher=debug"
    } else {
        "commute_matcher=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::load_from_yaml(&args.config)?;

    let db = Arc::new(VectorDB::new(&config.database.path, config.embedding.dimension as i32).await?);
    let api_key = std::env::var(&config.embedding.api_key_env).ok();
    let provider = Arc::new(HttpEmbeddingClient::new(&config.embedding, api_key));

    let engine = MatchEngine::new(
        db.clone(),
        provider,
        db.clone(),
        db.clone(),
        MatchDefaults::from(&config.matching),
    );

    match args.command {
        Command::Import => {
            db.replace_all(&config.profiles).await?;
            info!(count = config.profiles.len(), "seed profiles imported");
        }
        Command::BulkEmbed { limit } => {
            let report = engine.pipeline().bulk_generate_embeddings(limit).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats => {
            let stats = engine.pipeline().stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Match {
            user,
            limit,
            min_score,
        } => {
            let response = engine
                .find_matches(&MatchQuery {
                    user_id: user,
                    weights: None,
                    limit,
                    min_score,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Compare { user_a, user_b } => {
            let metrics = engine.similarity_metrics(&user_a, &user_b).await?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
    }

    Ok(())
}
