use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "commute-matcher",
    about = "Rank commute-partner candidates by hybrid similarity",
    long_about = "Backend engine for commute-partner matching: maintains profile \
                  embeddings in a LanceDB table and ranks candidates by a weighted \
                  combination of semantic and heuristic similarity.",
    version
)]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: String,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Replace the profiles table with the seed profiles from the config
    Import,

    /// Generate embeddings for profiles that are missing one
    BulkEmbed {
        /// Maximum number of profiles to process
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Report embedding coverage statistics
    Stats,

    /// Rank commute-partner candidates for a user
    Match {
        /// Requesting user id
        #[arg(short, long)]
        user: String,

        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum hybrid score, in [0, 1]
        #[arg(long)]
        min_score: Option<f32>,
    },

    /// Show the raw similarity components between two users
    Compare {
        #[arg(long)]
        user_a: String,

        #[arg(long)]
        user_b: String,
    },
}

pub fn parse_args() -> Args {
    Args::parse()
}
