use std::{path::PathBuf, sync::Arc};

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::{
    embedding::{DEFAULT_DIMENSION, Embedder},
    model_manager::ModelManager,
    search::DEFAULT_TOP_K,
    trigram::TrigramEmbedder,
};

#[derive(Debug, Parser)]
#[command(
    name = "chapterindex",
    about = "Map questions to textbook chapters by semantic similarity"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the ColBERT model ID or local model path
    #[arg(long, global = true, env = "CHAPTERINDEX_MODEL")]
    pub model: Option<String>,

    /// Embedding backend used to build and query indexes
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = EmbedderKind::Colbert,
        env = "CHAPTERINDEX_EMBEDDER"
    )]
    pub embedder: EmbedderKind,

    /// Vector dimension of the trigram embedder
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_DIMENSION,
        env = "CHAPTERINDEX_DIMENSION"
    )]
    pub dimension: usize,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbedderKind {
    /// Mean-pooled ColBERT embeddings (downloads the model on first use)
    Colbert,
    /// Deterministic character-trigram hashing, no model required
    Trigram,
}

impl Cli {
    /// Construct the embedder selected by `--embedder`.
    pub fn build_embedder(&self) -> Arc<dyn Embedder> {
        match self.embedder {
            EmbedderKind::Colbert => Arc::new(
                self.model
                    .clone()
                    .map(ModelManager::with_model_id)
                    .unwrap_or_default(),
            ),
            EmbedderKind::Trigram => {
                Arc::new(TrigramEmbedder::new(self.dimension))
            }
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build or rebuild the chapter index of a textbook
    Build(BuildArgs),
    /// Find the chapters closest to a query
    Search(SearchArgs),
    /// Map a file of questions to their closest chapters
    Map(MapArgs),
    /// Check the on-disk state of a textbook index
    Health(HealthArgs),
    /// Delete a textbook index
    Delete(DeleteArgs),
    /// Show indexed textbooks and configuration
    Status(StatusArgs),
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Build --

#[derive(Debug, Parser)]
pub struct BuildArgs {
    /// Textbook identifier
    pub textbook: String,

    /// JSON file holding an array of chapters
    #[arg(short = 'c', long)]
    pub chapters: PathBuf,

    /// Output the build summary as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// Textbook identifier
    pub textbook: String,

    /// The search query
    pub query: String,

    /// Number of chapters to return
    #[arg(short = 'n', long, default_value_t = DEFAULT_TOP_K)]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Map --

#[derive(Debug, Parser)]
pub struct MapArgs {
    /// Textbook identifier
    pub textbook: String,

    /// JSON file holding an array of `{"id", "text"}` questions
    #[arg(long)]
    pub questions: PathBuf,

    /// Number of chapters per question
    #[arg(short = 'n', long, default_value_t = DEFAULT_TOP_K)]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Health --

#[derive(Debug, Parser)]
pub struct HealthArgs {
    /// Textbook identifier
    pub textbook: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Delete --

#[derive(Debug, Parser)]
pub struct DeleteArgs {
    /// Textbook identifier
    pub textbook: String,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "chapterindex",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["chapterindex", "search", "7", "entropy"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.textbook, "7");
                assert_eq!(args.query, "entropy");
                assert_eq!(args.count, DEFAULT_TOP_K);
                assert!(!args.json);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "chapterindex",
            "map",
            "bio",
            "--questions",
            "q.json",
            "-n",
            "5",
            "--embedder",
            "trigram",
            "--dimension",
            "64",
            "-vv",
        ]);
        assert_eq!(cli.embedder, EmbedderKind::Trigram);
        assert_eq!(cli.dimension, 64);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Map(args) => {
                assert_eq!(args.questions, PathBuf::from("q.json"));
                assert_eq!(args.count, 5);
            }
            _ => panic!("expected map command"),
        }
    }

    #[test]
    fn build_requires_chapters_file() {
        assert!(Cli::try_parse_from(["chapterindex", "build", "7"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
