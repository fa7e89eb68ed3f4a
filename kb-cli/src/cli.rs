use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "kb", version, about = "Ingest documents into a knowledge base and query it")]
pub struct Cli {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(long, global = true, env = "KB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Use local hashing embeddings instead of the configured backend
    #[arg(long, global = true, default_value_t = false)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Chunk, embed and index text files
    Ingest {
        /// Files to ingest; each path becomes a document id
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Value for the `type` metadata key
        #[arg(long = "type")]
        doc_type: Option<String>,

        /// Value for the `category` metadata key
        #[arg(long)]
        category: Option<String>,

        /// Value for the `source` metadata key
        #[arg(long)]
        source: Option<String>,

        /// Split on blank lines instead of fixed-size windows
        #[arg(long, default_value_t = false)]
        paragraphs: bool,
    },

    /// Rank indexed chunks against a question
    Query {
        /// Free-text query
        text: String,

        /// Number of results; the configured default when omitted
        #[arg(long)]
        top_k: Option<usize>,

        /// Metadata filter as key=value; repeatable
        #[arg(long = "filter", value_parser = parse_pair)]
        filters: Vec<(String, String)>,

        /// Only print the formatted context
        #[arg(long, default_value_t = false)]
        context_only: bool,
    },

    /// Show ingestion records of the indexed documents
    Status {
        /// A single document id
        document: Option<String>,
    },

    /// Check filter keys against the declared metadata keys
    ValidateFilters {
        /// Filters as key=value
        #[arg(required = true, value_parser = parse_pair)]
        filters: Vec<(String, String)>,
    },
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}
