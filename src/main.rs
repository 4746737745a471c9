use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::BoxFuture;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crewforge_core::config::{default_store_path, Bindings, CrewConfig};
use crewforge_core::error::{CrewError, Result as CrewResult};
use crewforge_core::task::Condition;
use crewforge_core::traits::{CompletionClient, Tool};
use crewforge_core::types::{summarize, Completion, CompletionRequest};

use crewforge_engine::{Crew, OutputStore};

#[derive(Parser)]
#[command(name = "crewforge", version, about = "Multi-agent task orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Construct and validate a crew definition without running it
    Validate {
        /// Path to the crew definition
        #[arg(default_value = "crew.toml")]
        config: PathBuf,
    },
    /// List the task outputs stored by the latest kickoff
    Outputs {
        /// Output store file (default: ~/.crewforge/latest_kickoff_task_outputs.db)
        #[arg(long)]
        store: Option<PathBuf>,
        /// Print full raw outputs instead of one-line previews
        #[arg(long)]
        full: bool,
    },
    /// Delete every stored task output
    ResetOutputs {
        /// Output store file (default: ~/.crewforge/latest_kickoff_task_outputs.db)
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("crewforge=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Outputs { store, full } => {
            let store = open_store(store)?;
            let records = store.load()?;
            if records.is_empty() {
                println!("No stored task outputs.");
                return Ok(());
            }
            for record in &records {
                println!(
                    "[{}] {}  agent: {}{}  ({})",
                    record.task_index,
                    record.task_id,
                    record.output.agent,
                    if record.was_replayed { "  [replayed]" } else { "" },
                    record.timestamp.to_rfc3339()
                );
                println!("    {}", record.output.summary.as_deref().unwrap_or_default());
                if full {
                    println!("{}\n", record.output.raw);
                } else {
                    println!("    {}", preview(&record.output.raw, 100));
                }
            }
            Ok(())
        }
        Commands::ResetOutputs { store } => {
            let store = open_store(store)?;
            let count = store.load()?.len();
            store.reset()?;
            info!(count, "Stored task outputs deleted");
            println!("Deleted {} stored task output(s).", count);
            Ok(())
        }
    }
}

fn open_store(path: Option<PathBuf>) -> anyhow::Result<OutputStore> {
    let path = path.unwrap_or_else(default_store_path);
    if !path.exists() {
        warn!(path = %path.display(), "Output store does not exist yet; creating it");
    }
    Ok(OutputStore::open(&path)?)
}

fn preview(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max_chars || text.lines().nth(1).is_some() {
        let cut: String = line.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let mut config = CrewConfig::load(path)?;
    // Validation must not touch the store or the log directory.
    config.store.path = None;
    config.log = None;

    let bindings = offline_bindings(&config);
    let crew = Crew::from_config(&config, &bindings)?;

    println!(
        "Crew '{}' is valid ({} process, {} agents, {} tasks)",
        crew.name(),
        crew.process(),
        crew.agents().len(),
        crew.tasks().len()
    );
    for (index, task) in crew.tasks().iter().enumerate() {
        let agent = task
            .agent
            .and_then(|id| crew.agents().iter().find(|a| a.id == id))
            .map(|a| a.role())
            .unwrap_or("-");
        let mut flags = Vec::new();
        if task.async_execution {
            flags.push("async");
        }
        if task.is_conditional() {
            flags.push("conditional");
        }
        if task.output_json {
            flags.push("json");
        }
        println!(
            "  {:>2}. {:<40} agent: {:<20} {}",
            index + 1,
            summarize(task.label()),
            agent,
            flags.join(", ")
        );
    }
    Ok(())
}

/// Bindings that satisfy every name a definition references without
/// contacting any service.
fn offline_bindings(config: &CrewConfig) -> Bindings {
    let offline: Arc<dyn CompletionClient> = Arc::new(OfflineLlm);
    let mut bindings = Bindings::new().with_default_llm(offline.clone());

    let llms: BTreeSet<&str> = config
        .agents
        .iter()
        .chain(config.manager.iter())
        .filter_map(|a| a.llm.as_deref())
        .chain(config.crew.manager_llm.as_deref())
        .collect();
    for name in llms {
        bindings = bindings.with_llm(name, offline.clone());
    }

    let tools: BTreeSet<&str> = config
        .agents
        .iter()
        .chain(config.manager.iter())
        .flat_map(|a| a.tools.iter())
        .chain(config.tasks.iter().flat_map(|t| t.tools.iter()))
        .map(String::as_str)
        .collect();
    for name in tools {
        bindings = bindings.with_tool(Arc::new(OfflineTool {
            name: name.to_string(),
        }));
    }

    for name in config.tasks.iter().filter_map(|t| t.condition.as_deref()) {
        bindings = bindings.with_condition(name, Condition::from_fn(|_| true));
    }
    bindings
}

struct OfflineLlm;

impl CompletionClient for OfflineLlm {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, CrewResult<Completion>> {
        Box::pin(async move {
            Err(CrewError::Completion {
                agent: request.agent.role,
                message: "no completion service in offline validation".into(),
            })
        })
    }
}

struct OfflineTool {
    name: String,
}

impl Tool for OfflineTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Offline placeholder"
    }

    fn invoke(&self, _input: serde_json::Value) -> BoxFuture<'_, CrewResult<serde_json::Value>> {
        Box::pin(async move {
            Err(CrewError::ToolExecution {
                tool: self.name.clone(),
                message: "tools are not available in offline validation".into(),
            })
        })
    }
}
