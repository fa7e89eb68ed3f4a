mod cli;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use kb_rag::{
    EmbeddingBackend, KnowledgeBase, Metadata, MetadataKey, ParagraphChunker, QueryEngine,
    RagConfig, provider_from_config,
};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::ValidateFilters { filters } => {
            let kb = knowledge_base(config)?;
            print_json(&kb.validate_filters(filters))
        }
        Command::Ingest { files, doc_type, category, source, paragraphs } => {
            let mut kb = knowledge_base(config)?;
            if paragraphs {
                let chunker =
                    ParagraphChunker::new(kb.config().chunk_size, kb.config().chunk_overlap)?;
                kb = kb.with_chunker(Arc::new(chunker));
            }
            kb.open(&[]).await?;

            let mut metadata = Metadata::new();
            for (key, value) in [
                (MetadataKey::Type, doc_type),
                (MetadataKey::Category, category),
                (MetadataKey::Source, source),
            ] {
                if let Some(value) = value {
                    metadata.insert(key, value);
                }
            }

            let records = kb.ingest_files(&files, &metadata).await;
            kb.shutdown().await?;
            print_json(&records)?;

            let failed =
                records.iter().filter(|r| r.status == kb_rag::IngestionStatus::Error).count();
            if failed > 0 {
                bail!("{failed} of {} documents failed", files.len());
            }
            Ok(())
        }
        Command::Query { text, top_k, filters, context_only } => {
            let kb = Arc::new(knowledge_base(config)?);
            kb.open(&[]).await?;
            let top_k = top_k.unwrap_or(kb.config().top_k);

            let engine = QueryEngine::new(kb);
            let response = engine.query_raw(&text, top_k, filters).await?;
            if context_only {
                println!("{}", response.context);
                Ok(())
            } else {
                print_json(&response)
            }
        }
        Command::Status { document } => {
            let kb = knowledge_base(config)?;
            kb.open(&[]).await?;
            match document {
                Some(id) => match kb.status(&id).await {
                    Some(record) => print_json(&record),
                    None => bail!("no ingestion record for '{id}'"),
                },
                None => print_json(&kb.records().await),
            }
        }
    }
}

fn load_config(cli: &Cli) -> Result<RagConfig> {
    let mut config = match &cli.config {
        Some(path) => RagConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => RagConfig::default(),
    };
    if cli.offline {
        config.embedding.provider = EmbeddingBackend::Hashing;
    }
    if config.embedding.provider == EmbeddingBackend::OpenAi && config.embedding.api_key.is_none() {
        config.embedding.api_key = std::env::var("OPENAI_API_KEY").ok();
    }
    Ok(config)
}

fn knowledge_base(config: RagConfig) -> Result<KnowledgeBase> {
    let provider = provider_from_config(&config.embedding)
        .context("cannot construct the embedding provider; set OPENAI_API_KEY or pass --offline")?;
    Ok(KnowledgeBase::new(config, provider)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
