use std::{net::SocketAddr, path::PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "ARCHIVIST_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "archivist",
    version,
    about = "Ask questions of a lore archive, answered from its own passages"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Answer a question from the archive
    Ask(AskArgs),
    /// Retrieve and rerank passages without generating an answer
    Search(SearchArgs),
    /// Show the published index and resolved settings
    Status(StatusArgs),
    /// Manage persistent settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Serve the HTTP API
    Serve(ServeArgs),
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The question to answer
    pub question: String,

    /// Also print the passages the answer was built from
    #[arg(long)]
    pub sources: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The question to retrieve passages for
    pub question: String,

    /// Number of passages to return (default: the search_top_k setting)
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Address to bind the HTTP server to (host:port)
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub bind: SocketAddr,

    /// Deadline for a whole pipeline run, in seconds
    #[arg(long, default_value_t = 120)]
    pub timeout_secs: u64,

    /// Allowed CORS origin (repeatable; `*` allows any)
    #[arg(long = "allow-origin")]
    pub allow_origins: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show every setting with its resolved value and source
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting in config.redb
    Set {
        /// Setting key, e.g. generation_model
        key: String,
        /// New value
        value: String,
    },
    /// Remove a stored setting (revert to default)
    Clear {
        /// Setting key
        key: String,
    },
}

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
            "archivist",
            &mut std::io::stdout(),
        );
    }
}

/// Command line of the offline index builder.
#[derive(Debug, Parser)]
#[command(
    name = "archivist-index",
    version,
    about = "Build and publish a search index from embedded chunks (JSONL)"
)]
pub struct IndexCli {
    /// JSONL file with doc_id, chunk_index, text and embedding per line
    pub input: PathBuf,

    /// Override the XDG data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Number of newest generations to keep (the previously current one is
    /// always kept as well)
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub keep: u32,

    /// Output the build summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

/// Install the global subscriber. `ARCHIVIST_LOG` takes precedence over the
/// verbosity flags.
pub fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}
