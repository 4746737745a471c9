use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::error::{CrewError, Result};
use crate::task::{Condition, Task};
use crate::traits::{CompletionClient, Tool};
use crate::types::{Process, TaskId};

/// Crew definition file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrewConfig {
    #[serde(default)]
    pub crew: CrewSettings,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Explicit manager for hierarchical crews.
    #[serde(default)]
    pub manager: Option<AgentConfig>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewSettings {
    #[serde(default = "default_crew_name")]
    pub name: String,
    #[serde(default)]
    pub process: Process,
    /// Crew-wide request rate; overrides per-agent limits.
    #[serde(default)]
    pub max_rpm: Option<u32>,
    #[serde(default = "default_cache")]
    pub cache: bool,
    /// Worker pool size for asynchronous tasks.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Completion binding used to auto-build the hierarchical manager.
    #[serde(default)]
    pub manager_llm: Option<String>,
}

impl Default for CrewSettings {
    fn default() -> Self {
        Self {
            name: default_crew_name(),
            process: Process::default(),
            max_rpm: None,
            cache: true,
            max_concurrent_tasks: default_max_concurrent_tasks(),
            manager_llm: None,
        }
    }
}

fn default_crew_name() -> String { "crew".to_string() }
fn default_cache() -> bool { true }
fn default_max_concurrent_tasks() -> usize { 4 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file for task outputs. Outputs stay in memory when unset.
    #[serde(default)]
    pub path: Option<String>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.as_deref().map(expand_home)
    }
}

/// Store location used by the CLI when none is given.
pub fn default_store_path() -> PathBuf {
    expand_home("~/.crewforge/latest_kickoff_task_outputs.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for run logs. Default: ~/.crewforge/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = crew events, 2 = task events, 3 = agent and tool events (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

impl LogConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(self.log_dir.as_deref().unwrap_or("~/.crewforge/logs"))
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub role: String,
    pub goal: String,
    #[serde(default)]
    pub backstory: String,
    #[serde(default)]
    pub allow_delegation: bool,
    /// Names of bound tools.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub max_rpm: Option<u32>,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_cache")]
    pub cache: bool,
    /// Name of a bound completion client; falls back to the default binding.
    #[serde(default)]
    pub llm: Option<String>,
}

fn default_max_iter() -> usize { 25 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Referenced by other tasks' `context`.
    #[serde(default)]
    pub name: Option<String>,
    pub description: String,
    pub expected_output: String,
    /// Role of the responsible agent.
    #[serde(default)]
    pub agent: Option<String>,
    /// Names of upstream tasks.
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub async_execution: bool,
    #[serde(default)]
    pub output_json: bool,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Name of a bound skip predicate; makes the task conditional.
    #[serde(default)]
    pub condition: Option<String>,
}

/// Runtime collaborators referenced by name from a [`CrewConfig`].
#[derive(Clone, Default)]
pub struct Bindings {
    pub default_llm: Option<Arc<dyn CompletionClient>>,
    pub llms: HashMap<String, Arc<dyn CompletionClient>>,
    pub tools: HashMap<String, Arc<dyn Tool>>,
    pub conditions: HashMap<String, Condition>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_llm(mut self, llm: Arc<dyn CompletionClient>) -> Self {
        self.default_llm = Some(llm);
        self
    }

    pub fn with_llm(mut self, name: impl Into<String>, llm: Arc<dyn CompletionClient>) -> Self {
        self.llms.insert(name.into(), llm);
        self
    }

    /// Bind a tool under its own name.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn with_condition(mut self, name: impl Into<String>, condition: Condition) -> Self {
        self.conditions.insert(name.into(), condition);
        self
    }

    /// Look up a named client, or the default when `name` is None.
    pub fn llm(&self, name: Option<&str>) -> Result<Option<Arc<dyn CompletionClient>>> {
        match name {
            Some(n) => self
                .llms
                .get(n)
                .cloned()
                .map(Some)
                .ok_or_else(|| CrewError::config(format!("Unknown completion binding '{}'", n))),
            None => Ok(self.default_llm.clone()),
        }
    }

    fn tools(&self, names: &[String]) -> Result<Vec<Arc<dyn Tool>>> {
        names
            .iter()
            .map(|n| {
                self.tools
                    .get(n)
                    .cloned()
                    .ok_or_else(|| CrewError::config(format!("Unknown tool binding '{}'", n)))
            })
            .collect()
    }
}

/// Agents and tasks produced from a config, before crew validation.
pub struct Definitions {
    pub agents: Vec<Agent>,
    pub manager: Option<Agent>,
    pub tasks: Vec<Task>,
}

impl CrewConfig {
    /// Load configuration from a TOML file, expanding `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CrewError::ConfigNotFound(path.display().to_string()))?;
        debug!(path = %path.display(), "Loading crew definition");
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| CrewError::config(e.to_string()))
    }

    /// Typed construction of agents and tasks, resolving every name reference.
    pub fn build(&self, bindings: &Bindings) -> Result<Definitions> {
        let mut agents = Vec::with_capacity(self.agents.len());
        let mut by_role = HashMap::new();
        for cfg in &self.agents {
            if by_role.contains_key(&cfg.role) {
                return Err(CrewError::config(format!("Duplicate agent role '{}'", cfg.role)));
            }
            let agent = build_agent(cfg, bindings)?;
            by_role.insert(cfg.role.clone(), agent.id);
            agents.push(agent);
        }

        let manager = self
            .manager
            .as_ref()
            .map(|cfg| build_agent(cfg, bindings))
            .transpose()?;

        let mut tasks: Vec<Task> = Vec::with_capacity(self.tasks.len());
        let mut by_name: HashMap<&str, TaskId> = HashMap::new();
        for (index, cfg) in self.tasks.iter().enumerate() {
            let key = cfg.name.as_deref().unwrap_or(&cfg.description);
            let mut task = Task::new(&cfg.description, &cfg.expected_output)
                .with_id(TaskId::derived(&self.crew.name, index, key));
            if let Some(name) = &cfg.name {
                if by_name.contains_key(name.as_str()) {
                    return Err(CrewError::config(format!("Duplicate task name '{}'", name)));
                }
                by_name.insert(name, task.id);
                task = task.with_name(name);
            }
            if let Some(role) = &cfg.agent {
                let id = by_role.get(role).ok_or_else(|| {
                    CrewError::config(format!(
                        "Task '{}' references unknown agent '{}'",
                        task.label(),
                        role
                    ))
                })?;
                task = task.with_agent_id(*id);
            }

            // Only earlier names resolve, so forward references surface here.
            let context = cfg
                .context
                .iter()
                .map(|name| {
                    by_name.get(name.as_str()).copied().ok_or_else(|| {
                        CrewError::graph(format!(
                            "Task '{}' has a context dependency on a future or unknown task '{}', which is not allowed.",
                            task.label(),
                            name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            task = task.with_context_ids(context);

            if cfg.async_execution {
                task = task.asynchronous();
            }
            if cfg.output_json {
                task = task.with_output_json();
            }
            if !cfg.tools.is_empty() {
                task = task.with_tools(bindings.tools(&cfg.tools)?);
            }
            if let Some(cond) = &cfg.condition {
                let condition = bindings.conditions.get(cond).cloned().ok_or_else(|| {
                    CrewError::config(format!("Unknown condition binding '{}'", cond))
                })?;
                task = task.with_condition(condition);
            }
            tasks.push(task);
        }

        Ok(Definitions {
            agents,
            manager,
            tasks,
        })
    }
}

fn build_agent(cfg: &AgentConfig, bindings: &Bindings) -> Result<Agent> {
    let mut agent = Agent::new(&cfg.role, &cfg.goal, &cfg.backstory)
        .with_delegation(cfg.allow_delegation)
        .with_tools(bindings.tools(&cfg.tools)?)
        .with_max_iter(cfg.max_iter)
        .with_cache(cfg.cache);
    if let Some(rpm) = cfg.max_rpm {
        agent = agent.with_max_rpm(rpm);
    }
    if let Some(llm) = bindings.llm(cfg.llm.as_deref())? {
        agent = agent.with_llm(llm);
    }
    Ok(agent)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    warn!(var = %var_name, "Environment variable not set; leaving reference in place");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
