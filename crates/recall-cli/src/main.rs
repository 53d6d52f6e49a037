use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use recall_core::{EngineConfig, OwnerId};
use recall_engine::{EmbeddingProvider, EngineStorage, LocalEmbedding, RetrievalEngine};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "recall", about = "Recall: hybrid retrieval, semantic cache and session memory")]
struct Cli {
    /// Path to config file (defaults apply if it does not exist)
    #[arg(short, long, default_value = "recall.toml")]
    config: PathBuf,

    /// Directory holding the record files
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add knowledge for an owner. Files are split into paragraph chunks.
    Ingest {
        #[arg(long)]
        owner: u64,
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        text: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        /// Metadata as key=value; values are parsed as JSON when possible
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, Value)>,
    },
    /// Hybrid query over an owner's knowledge
    Query {
        #[arg(long)]
        owner: u64,
        #[arg(long)]
        text: String,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
    /// Store or replace a session fact
    Remember {
        #[arg(long)]
        session: Uuid,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        content: String,
        #[arg(long, default_value = "")]
        source: String,
    },
    /// List a session's facts
    Facts {
        #[arg(long)]
        session: Uuid,
    },
    /// Recall the session facts closest to a text
    Recall {
        #[arg(long)]
        session: Uuid,
        #[arg(long)]
        text: String,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
    /// Expire cache entries, compact indexes and record files
    Compact,
    /// Print the effective configuration as TOML
    Config,
}

fn parse_meta(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty metadata key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

async fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => EngineConfig::from_toml(&text)
            .with_context(|| format!("Invalid config file '{}'", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EngineConfig::default()),
        Err(e) => Err(anyhow::anyhow!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        )),
    }
}

#[cfg(feature = "http-embeddings")]
fn http_embedder(config: &EngineConfig) -> anyhow::Result<Option<Arc<dyn EmbeddingProvider>>> {
    let Some(http) = recall_engine::HttpEmbedding::from_config(config)? else {
        return Ok(None);
    };
    info!(endpoint = ?config.embedding.endpoint, "using HTTP embedding provider");
    Ok(Some(Arc::new(http)))
}

#[cfg(not(feature = "http-embeddings"))]
fn http_embedder(config: &EngineConfig) -> anyhow::Result<Option<Arc<dyn EmbeddingProvider>>> {
    if config.embedding.endpoint.is_some() {
        tracing::warn!("embedding.endpoint is set but HTTP embeddings are not compiled in; using local embeddings");
    }
    Ok(None)
}

fn build_embedder(config: &EngineConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match http_embedder(config)? {
        Some(provider) => Ok(provider),
        None => Ok(Arc::new(LocalEmbedding::new(config.dimension))),
    }
}

fn paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

async fn run(engine: &RetrievalEngine, command: Commands) -> anyhow::Result<Value> {
    let out = match command {
        Commands::Ingest {
            owner,
            text,
            file,
            meta,
        } => {
            let chunks = match (text, file) {
                (Some(text), _) => vec![text],
                (None, Some(path)) => {
                    let body = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Failed to read '{}'", path.display()))?;
                    paragraphs(&body)
                }
                (None, None) => anyhow::bail!("either --text or --file is required"),
            };
            let metadata: HashMap<String, Value> = meta.into_iter().collect();
            let mut ids = Vec::with_capacity(chunks.len());
            for chunk in &chunks {
                ids.push(engine.add_knowledge(OwnerId(owner), chunk, metadata.clone()).await?);
            }
            info!(owner, chunks = ids.len(), "knowledge ingested");
            json!({ "ids": ids })
        }
        Commands::Query { owner, text, top_k } => {
            serde_json::to_value(engine.query_knowledge_text(OwnerId(owner), &text, top_k).await?)?
        }
        Commands::Remember {
            session,
            topic,
            content,
            source,
        } => serde_json::to_value(engine.memory_upsert(session, &topic, &content, &source).await?)?,
        Commands::Facts { session } => serde_json::to_value(engine.memory_list(session))?,
        Commands::Recall { session, text, top_k } => {
            serde_json::to_value(engine.memory_recall_text(session, &text, top_k).await?)?
        }
        Commands::Compact => {
            let report = engine.maintain().await?;
            engine.flush().await?;
            json!({ "maintenance": report, "stats": engine.stats().await? })
        }
        Commands::Config => Value::String(engine.config().to_toml()?),
    };
    Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;
    config.validate()?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tokio::fs::create_dir_all(&cli.data_dir)
        .await
        .with_context(|| format!("Failed to create data dir '{}'", cli.data_dir.display()))?;
    let storage = EngineStorage::file(&cli.data_dir).await?;
    let embedder = build_embedder(&config)?;
    let engine = RetrievalEngine::open(config, storage, embedder).await?;

    let out = run(&engine, cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
