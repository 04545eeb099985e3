//! Command-line surface for the `quoracle` binary.
//!
//! Grounded on the teacher's `cli_args.rs` (`clap::Parser` derive, one flat
//! struct of global options); the teacher's provider/auth/embed subcommands
//! have no counterpart here, so this stays to a single run mode.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "quoracle",
    about = "Spawn a root Quoracle agent and drive it from stdin/stdout"
)]
pub struct CliArgs {
    /// Path to a TOML runtime config (model catalog, MCP servers, ACE
    /// tuning). Falls back to a bundled minimal default when absent.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Profile name used to resolve capability_groups / max_refinement_rounds.
    #[arg(long, default_value = "default")]
    pub profile: String,

    /// Task identifier carried on the root agent's config.
    #[arg(long, default_value = "root-task")]
    pub task_id: String,

    /// Model spec(s) making up the root agent's pool, e.g. `openai/gpt-4o`.
    /// Repeat the flag for a multi-model pool.
    #[arg(long = "model", required = true)]
    pub models: Vec<String>,

    /// System role the root agent is told to play.
    #[arg(long, default_value = "a helpful assistant")]
    pub role: String,

    /// Base URL for the OpenAI-compatible chat/embeddings endpoint.
    #[arg(long, default_value = "https://api.openai.com/v1")]
    pub base_url: String,

    /// API key for the provider. Falls back to `QUORACLE_API_KEY` if unset.
    #[arg(long)]
    pub api_key: Option<String>,

    /// Model spec used for embeddings (Lesson Manager dedup, History
    /// Transfer source selection).
    #[arg(long, default_value = "text-embedding-3-small")]
    pub embedding_model: String,
}
