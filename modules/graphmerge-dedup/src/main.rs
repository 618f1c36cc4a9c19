use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ai_client::{ChatAgent, Claude, EmbedAgent, OpenAi};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use graphmerge_core::{load_config, DedupConfig, LlmProvider, Secrets};
use graphmerge_dedup::{load_artifact, CachedChat, DedupDriver, DedupResultsFile, ReplayEngine};
use graphmerge_graph::{load_graph, save_graph, EventDiscovery};

#[derive(Parser)]
#[command(name = "graphmerge", about = "Semantic deduplication for extracted knowledge graphs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full dedup pipeline.
    Run {
        #[arg(long)]
        graph: PathBuf,
        /// Path to config TOML file
        #[arg(long, default_value = "./config/graphmerge.toml")]
        config: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Re-apply recorded merges (and event discovery, if the run used it)
    /// without calling the model.
    Replay {
        #[arg(long)]
        graph: PathBuf,
        #[arg(long = "artifact")]
        artifacts: Vec<PathBuf>,
        /// Externally prepared `{"clusters": [...]}` file.
        #[arg(long)]
        dedup_results: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        output: PathBuf,
    },
    /// Event pattern discovery only.
    Events {
        #[arg(long)]
        graph: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("graphmerge=info".parse()?))
        .init();

    match Cli::parse().command {
        Command::Run { graph, config, output } => run(graph, config, output).await,
        Command::Replay {
            graph,
            artifacts,
            dedup_results,
            config,
            output,
        } => replay(graph, artifacts, dedup_results, config, output),
        Command::Events { graph, config, output } => events(graph, config, output),
    }
}

fn optional_config(path: Option<PathBuf>) -> Result<DedupConfig> {
    match path {
        Some(path) => load_config(&path),
        None => Ok(DedupConfig::default()),
    }
}

async fn run(graph_path: PathBuf, config_path: PathBuf, output: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    info!(config = %config_path.display(), dataset = %config.dataset, "Loaded config");

    let secrets = Secrets::from_env()?;
    secrets.log_redacted();
    let timeout = Duration::from_secs(config.llm.timeout_secs);

    let mut embedder = OpenAi::new(&secrets.embedding_api_key, &config.llm.model)
        .with_embedding_model(&config.embedding_model)
        .with_timeout(timeout);
    if let Some(url) = &secrets.embedding_base_url {
        embedder = embedder.with_base_url(url);
    }
    let embed: Arc<dyn EmbedAgent> = Arc::new(embedder);

    let base_url = config.llm.base_url.clone().or_else(|| secrets.llm_base_url.clone());
    let chat: Arc<dyn ChatAgent> = match (&config.semantic_dedup.cached_results_path, config.llm.provider) {
        (Some(path), _) => Arc::new(CachedChat::from_path(path)?),
        (None, LlmProvider::OpenAi) => {
            let mut client = OpenAi::new(&secrets.llm_api_key, &config.llm.model).with_timeout(timeout);
            if let Some(url) = &base_url {
                client = client.with_base_url(url);
            }
            Arc::new(client)
        }
        (None, LlmProvider::Claude) => {
            let mut client = Claude::new(&secrets.llm_api_key, &config.llm.model).with_timeout(timeout);
            if let Some(url) = &base_url {
                client = client.with_base_url(url);
            }
            Arc::new(client)
        }
    };

    let mut graph = load_graph(&graph_path)?;
    let driver = DedupDriver::new(config, chat, embed)?;

    let cancel = driver.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight calls");
            cancel.cancel();
        }
    });

    let report = driver.run(&mut graph).await?;
    save_graph(&graph, &output).with_context(|| format!("Failed to write graph: {}", output.display()))?;
    for path in &report.written {
        info!(path = %path.display(), "Wrote artifact");
    }
    info!(output = %output.display(), "Dedup complete");
    Ok(())
}

fn replay(
    graph_path: PathBuf,
    artifacts: Vec<PathBuf>,
    dedup_results: Option<PathBuf>,
    config: Option<PathBuf>,
    output: PathBuf,
) -> Result<()> {
    let config = optional_config(config)?;
    let mut graph = load_graph(&graph_path)?;
    let engine = ReplayEngine::from_config(&config.graph);

    let loaded = artifacts
        .iter()
        .map(|path| load_artifact(path).with_context(|| format!("Failed to load artifact: {}", path.display())))
        .collect::<Result<Vec<_>>>()?;
    if !loaded.is_empty() {
        let stats = engine.replay_artifacts(&mut graph, &loaded);
        info!(artifacts = loaded.len(), %stats, "Replayed artifacts");
    }
    if let Some(path) = dedup_results {
        let results = DedupResultsFile::load(&path)?;
        let stats = engine.replay_dedup_results(&mut graph, &results);
        info!(path = %path.display(), %stats, "Replayed dedup results");
    }

    save_graph(&graph, &output).with_context(|| format!("Failed to write graph: {}", output.display()))?;
    info!(output = %output.display(), nodes = graph.node_count(), edges = graph.edge_count(), "Replay complete");
    Ok(())
}

fn events(graph_path: PathBuf, config: Option<PathBuf>, output: PathBuf) -> Result<()> {
    let config = optional_config(config)?;
    let mut graph = load_graph(&graph_path)?;
    let (patterns, stats) = EventDiscovery::from_config(&config.events).discover(&mut graph);
    info!(
        patterns = patterns.len(),
        events = stats.events,
        nodes_created = stats.nodes_created,
        propagated = stats.propagated,
        "Event discovery complete"
    );
    save_graph(&graph, &output).with_context(|| format!("Failed to write graph: {}", output.display()))?;
    Ok(())
}
