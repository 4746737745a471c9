use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info, warn};

use crewforge_core::agent::Agent;
use crewforge_core::error::{CrewError, ErrorKind, Result};
use crewforge_core::event::{CrewEvent, EventBus};
use crewforge_core::task::Task;
use crewforge_core::traits::{CompletionClient, Tool};
use crewforge_core::types::{
    AgentId, ChatMessage, Completion, CompletionRequest, TaskOutput, ToolCall, UsageMetrics,
};

use crate::cache::CacheHandler;
use crate::rate_limit::RpmLimiter;

const FORCE_FINAL_ANSWER: &str = "Now it's time you MUST give your absolute best final answer. \
You'll ignore all previous instructions, stop using any tools, and just return your absolute BEST Final answer.";

/// Shared state behind every agent execution of one crew.
///
/// Owns the tool cache, the rate limiters, and the usage counters. Held by
/// `Arc` so asynchronous tasks and delegation tools can reach it.
pub struct AgentRuntime {
    crew: String,
    event_bus: Arc<EventBus>,
    cache: Arc<CacheHandler>,
    cache_enabled: bool,
    default_llm: Option<Arc<dyn CompletionClient>>,
    shared_limiter: Option<Arc<RpmLimiter>>,
    limiters: HashMap<AgentId, Arc<RpmLimiter>>,
    usage: Mutex<UsageMetrics>,
}

impl AgentRuntime {
    pub fn new(crew: impl Into<String>, event_bus: Arc<EventBus>) -> Self {
        Self {
            crew: crew.into(),
            event_bus,
            cache: Arc::new(CacheHandler::new()),
            cache_enabled: true,
            default_llm: None,
            shared_limiter: None,
            limiters: HashMap::new(),
            usage: Mutex::new(UsageMetrics::default()),
        }
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_default_llm(mut self, llm: Option<Arc<dyn CompletionClient>>) -> Self {
        self.default_llm = llm;
        self
    }

    /// Install rate limiters: one shared limiter when the crew sets `max_rpm`,
    /// else one per agent that sets its own.
    pub fn with_rate_limits<'a>(
        mut self,
        crew_max_rpm: Option<u32>,
        agents: impl IntoIterator<Item = &'a Agent>,
    ) -> Self {
        match crew_max_rpm {
            Some(rpm) => self.shared_limiter = Some(Arc::new(RpmLimiter::new(rpm))),
            None => {
                for agent in agents {
                    if let Some(rpm) = agent.max_rpm {
                        self.limiters.insert(agent.id, Arc::new(RpmLimiter::new(rpm)));
                    }
                }
            }
        }
        self
    }

    pub fn crew_name(&self) -> &str {
        &self.crew
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn cache(&self) -> &Arc<CacheHandler> {
        &self.cache
    }

    pub fn limiter_for(&self, agent: AgentId) -> Option<&Arc<RpmLimiter>> {
        self.shared_limiter.as_ref().or_else(|| self.limiters.get(&agent))
    }

    pub fn has_llm(&self, agent: &Agent) -> bool {
        agent.llm.is_some() || self.default_llm.is_some()
    }

    pub fn usage(&self) -> UsageMetrics {
        *self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Clear per-run state before a kickoff or replay.
    pub fn reset_run(&self) {
        self.cache.clear();
        *self.usage.lock().unwrap_or_else(|e| e.into_inner()) = UsageMetrics::default();
    }

    fn emit(&self, event: CrewEvent) {
        self.event_bus.emit(&self.crew, event);
    }

    /// Have `agent` carry out `task` with the given context and tool set.
    pub async fn execute_task(
        &self,
        agent: &Agent,
        task: &Task,
        context: Option<&str>,
        tools: &[Arc<dyn Tool>],
    ) -> Result<TaskOutput> {
        self.emit(CrewEvent::AgentExecutionStarted {
            agent: agent.role().to_string(),
            task_id: task.id,
        });

        let result = self.run_loop(agent, task, context, tools).await.and_then(|raw| {
            build_output(task, agent, raw)
        });

        match &result {
            Ok(output) => self.emit(CrewEvent::AgentExecutionCompleted {
                agent: agent.role().to_string(),
                task_id: task.id,
                output: output.raw.clone(),
            }),
            Err(e) => self.emit(CrewEvent::AgentExecutionFailed {
                agent: agent.role().to_string(),
                task_id: task.id,
                error: e.to_string(),
            }),
        }
        result
    }

    /// Reason/act loop. Returns the raw final answer.
    async fn run_loop(
        &self,
        agent: &Agent,
        task: &Task,
        context: Option<&str>,
        tools: &[Arc<dyn Tool>],
    ) -> Result<String> {
        let llm = agent
            .llm
            .clone()
            .or_else(|| self.default_llm.clone())
            .ok_or_else(|| CrewError::Completion {
                agent: agent.role().to_string(),
                message: "no completion service bound".into(),
            })?;

        let mut messages = vec![
            ChatMessage::system(agent.system_prompt()),
            ChatMessage::user(task_prompt(task, context)),
        ];
        let descriptors: Vec<_> = tools.iter().map(|t| t.descriptor()).collect();

        for iteration in 1..=agent.max_iter {
            let completion = self
                .complete(agent, &llm, messages.clone(), descriptors.clone())
                .await?;

            let Some(call) = completion.tool_call else {
                debug!(agent = %agent.role(), iteration, "Final answer produced");
                return Ok(completion.content);
            };

            messages.push(ChatMessage::assistant(format!(
                "{}\nAction: {}\nAction Input: {}",
                completion.content, call.name, call.input
            )));
            let observation = self.use_tool(agent, tools, &call).await?;
            messages.push(ChatMessage::user(format!("Observation: {}", observation)));
        }

        warn!(agent = %agent.role(), max_iter = agent.max_iter, "Max iterations reached, forcing final answer");
        messages.push(ChatMessage::user(FORCE_FINAL_ANSWER));
        let completion = self.complete(agent, &llm, messages, vec![]).await?;
        Ok(completion.content)
    }

    async fn complete(
        &self,
        agent: &Agent,
        llm: &Arc<dyn CompletionClient>,
        messages: Vec<ChatMessage>,
        tools: Vec<crewforge_core::types::ToolDescriptor>,
    ) -> Result<Completion> {
        if let Some(limiter) = self.limiter_for(agent.id) {
            limiter.acquire().await;
        }

        let request = CompletionRequest {
            agent: agent.profile(),
            messages,
            tools,
        };
        let completion = llm.complete(request).await.map_err(|e| match e.kind() {
            ErrorKind::Execution => e,
            _ => CrewError::Completion {
                agent: agent.role().to_string(),
                message: e.to_string(),
            },
        })?;

        self.usage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(completion.usage);
        Ok(completion)
    }

    /// Invoke a tool through the cache. Returns the observation text.
    async fn use_tool(
        &self,
        agent: &Agent,
        tools: &[Arc<dyn Tool>],
        call: &ToolCall,
    ) -> Result<String> {
        let role = agent.role().to_string();
        self.emit(CrewEvent::ToolUsageStarted {
            agent: role.clone(),
            tool: call.name.clone(),
            input: call.input.clone(),
        });

        let Some(tool) = tools.iter().find(|t| t.name() == call.name) else {
            let available: Vec<&str> = tools.iter().map(|t| t.name()).collect();
            let message = format!(
                "Action '{}' don't exist, these are the only available Actions: {}",
                call.name,
                available.join(", ")
            );
            self.emit(CrewEvent::ToolUsageFailed {
                agent: role,
                tool: call.name.clone(),
                error: message.clone(),
            });
            return Ok(message);
        };

        let use_cache = self.cache_enabled && agent.cache;
        if use_cache {
            if let Some(hit) = self.cache.read(&call.name, &call.input) {
                debug!(tool = %call.name, "Tool result served from cache");
                self.emit(CrewEvent::ToolUsageFinished {
                    agent: role,
                    tool: call.name.clone(),
                    from_cache: true,
                });
                return Ok(observation_text(&hit));
            }
        }

        info!(agent = %role, tool = %call.name, "Invoking tool");
        let output = match tool.invoke(call.input.clone()).await {
            Ok(output) => output,
            Err(e) => {
                self.emit(CrewEvent::ToolUsageFailed {
                    agent: role,
                    tool: call.name.clone(),
                    error: e.to_string(),
                });
                return Err(match e {
                    CrewError::ToolExecution { .. } => e,
                    other => CrewError::ToolExecution {
                        tool: call.name.clone(),
                        message: other.to_string(),
                    },
                });
            }
        };

        if use_cache && tool.should_cache(&call.input, &output) {
            self.cache.add(&call.name, &call.input, output.clone());
        }
        self.emit(CrewEvent::ToolUsageFinished {
            agent: role,
            tool: call.name.clone(),
            from_cache: false,
        });
        Ok(observation_text(&output))
    }
}

/// Task instructions plus the resolved context block.
pub fn task_prompt(task: &Task, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.trim().is_empty() => format!(
            "{}\n\nThis is the context you're working with:\n{}",
            task.prompt(),
            ctx
        ),
        _ => task.prompt(),
    }
}

fn observation_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn build_output(task: &Task, agent: &Agent, raw: String) -> Result<TaskOutput> {
    let output = TaskOutput::new(task.description(), raw, agent.role());
    if !task.output_json {
        return Ok(output);
    }
    let structured: Value = serde_json::from_str(extract_json(&output.raw)).map_err(|e| {
        CrewError::OutputFormat {
            task: task.label().to_string(),
            message: e.to_string(),
        }
    })?;
    Ok(output.with_structured(structured))
}

/// Extract JSON from a response that may contain markdown code fences.
pub(crate) fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}').filter(|&end| end > start) {
            return &trimmed[start..=end];
        }
    }
    trimmed
}
