use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use crewforge_core::agent::Agent;
use crewforge_core::config::{Bindings, CrewConfig};
use crewforge_core::error::{CrewError, Result};
use crewforge_core::event::{CrewEvent, EventBus};
use crewforge_core::task::Task;
use crewforge_core::traits::{CompletionClient, Tool};
use crewforge_core::types::{
    AgentId, Inputs, Process, TaskId, TaskOutput, ToolDescriptor, UsageMetrics,
};

use crate::conditional::{self, Gate};
use crate::delegation::{delegation_tools, manager_tool_descriptors};
use crate::evaluator::{CrewEvaluator, EvaluationReport};
use crate::output_store::{OutputStore, StoredOutputRecord};
use crate::run_log::{RunLogAttachment, RunLogger};
use crate::runtime::AgentRuntime;
use crate::scheduler::{AsyncScheduler, Resolved};
use crate::training::{TrainedAgent, TrainingCollector, TrainingData, TrainingEvaluator};
use crate::validator::validate_tasks;

/// Separator between aggregated context outputs.
pub const CONTEXT_SEPARATOR: &str = "\n\n----------\n\n";

const MANAGER_ROLE: &str = "Crew Manager";
const MANAGER_GOAL: &str = "Manage the team to complete the task in the best way possible.";
const MANAGER_BACKSTORY: &str = "You are a seasoned manager with a knack for getting the best out of your team.\n\
You are also known for your ability to delegate work to the right people, and to ask the right questions to get the best out of your team.\n\
Even though you don't perform tasks by yourself, you have a lot of experience in the field, which allows you to properly evaluate the work of your team members.";

/// Invoked with every completed task output.
pub type TaskCallback = Arc<dyn Fn(&TaskOutput) + Send + Sync>;

/// Result of a kickoff or replay.
#[derive(Debug, Clone, PartialEq)]
pub struct CrewOutput {
    /// Raw text of the final output.
    pub raw: String,
    pub structured: Option<Value>,
    /// Outputs of every task that produced one, in task order.
    pub tasks_output: Vec<TaskOutput>,
    pub token_usage: UsageMetrics,
}

impl std::fmt::Display for CrewOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.structured {
            Some(value) => write!(f, "{}", value),
            None => f.write_str(&self.raw),
        }
    }
}

/// Builder for [`Crew`]. `build` runs every construction-time check.
pub struct CrewBuilder {
    name: String,
    agents: Vec<Agent>,
    tasks: Vec<Task>,
    process: Process,
    manager_agent: Option<Agent>,
    manager_llm: Option<Arc<dyn CompletionClient>>,
    default_llm: Option<Arc<dyn CompletionClient>>,
    max_rpm: Option<u32>,
    cache: bool,
    max_concurrent_tasks: usize,
    event_bus: Option<Arc<EventBus>>,
    output_store: Option<Arc<OutputStore>>,
    task_callback: Option<TaskCallback>,
    run_logger: Option<RunLogger>,
}

impl Default for CrewBuilder {
    fn default() -> Self {
        Self {
            name: "crew".to_string(),
            agents: vec![],
            tasks: vec![],
            process: Process::Sequential,
            manager_agent: None,
            manager_llm: None,
            default_llm: None,
            max_rpm: None,
            cache: true,
            max_concurrent_tasks: 4,
            event_bus: None,
            output_store: None,
            task_callback: None,
            run_logger: None,
        }
    }
}

impl CrewBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn agents(mut self, agents: Vec<Agent>) -> Self {
        self.agents = agents;
        self
    }

    pub fn agent(mut self, agent: Agent) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn tasks(mut self, tasks: Vec<Task>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn process(mut self, process: Process) -> Self {
        self.process = process;
        self
    }

    pub fn manager_agent(mut self, manager: Agent) -> Self {
        self.manager_agent = Some(manager);
        self
    }

    pub fn manager_llm(mut self, llm: Arc<dyn CompletionClient>) -> Self {
        self.manager_llm = Some(llm);
        self
    }

    /// Completion client for agents without their own binding.
    pub fn default_llm(mut self, llm: Arc<dyn CompletionClient>) -> Self {
        self.default_llm = Some(llm);
        self
    }

    pub fn max_rpm(mut self, max_rpm: u32) -> Self {
        self.max_rpm = Some(max_rpm);
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    pub fn max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n.max(1);
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn output_store(mut self, store: Arc<OutputStore>) -> Self {
        self.output_store = Some(store);
        self
    }

    pub fn task_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskOutput) + Send + Sync + 'static,
    {
        self.task_callback = Some(Arc::new(callback));
        self
    }

    pub fn run_logger(mut self, logger: RunLogger) -> Self {
        self.run_logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<Crew> {
        validate_tasks(&self.tasks, &self.agents, self.process)?;

        let manager = match self.process {
            Process::Sequential => None,
            Process::Hierarchical => Some(build_manager(
                self.manager_agent,
                self.manager_llm,
                self.default_llm.clone(),
                &self.agents,
            )?),
        };

        if self.default_llm.is_none() {
            if let Some(agent) = self.agents.iter().find(|a| a.llm.is_none()) {
                return Err(CrewError::config(format!(
                    "Agent '{}' has no completion binding and the crew has no default.",
                    agent.role()
                )));
            }
        }

        let event_bus = self.event_bus.unwrap_or_default();
        let runtime = AgentRuntime::new(&self.name, event_bus.clone())
            .with_cache(self.cache)
            .with_default_llm(self.default_llm)
            .with_rate_limits(self.max_rpm, self.agents.iter().chain(manager.iter()));

        let output_store = match self.output_store {
            Some(store) => store,
            None => Arc::new(OutputStore::open_in_memory()?),
        };
        let run_log = self
            .run_logger
            .map(|logger| logger.attach(&event_bus, &self.name))
            .transpose()?;

        info!(
            crew = %self.name,
            process = %self.process,
            agents = self.agents.len(),
            tasks = self.tasks.len(),
            "Crew assembled"
        );

        Ok(Crew {
            name: self.name,
            agents: self.agents,
            tasks: self.tasks,
            process: self.process,
            manager,
            max_concurrent_tasks: self.max_concurrent_tasks,
            event_bus,
            runtime: Arc::new(runtime),
            output_store,
            task_callback: self.task_callback,
            run_log,
            inputs: Inputs::new(),
        })
    }
}

fn build_manager(
    explicit: Option<Agent>,
    manager_llm: Option<Arc<dyn CompletionClient>>,
    default_llm: Option<Arc<dyn CompletionClient>>,
    roster: &[Agent],
) -> Result<Agent> {
    match explicit {
        Some(manager) => {
            if roster.iter().any(|a| a.id == manager.id) {
                return Err(CrewError::config(
                    "Manager agent should not be included in the agents list.",
                ));
            }
            if !manager.tools.is_empty() {
                return Err(CrewError::config("Manager agent should not have tools."));
            }
            if manager.llm.is_some() {
                return Ok(manager);
            }
            match manager_llm.or(default_llm) {
                Some(llm) => Ok(manager.with_llm(llm)),
                None => Err(CrewError::config(format!(
                    "Manager agent '{}' has no completion binding.",
                    manager.role()
                ))),
            }
        }
        None => {
            let llm = manager_llm.ok_or_else(|| {
                CrewError::config(
                    "Attribute `manager_llm` or `manager_agent` is required when using hierarchical process.",
                )
            })?;
            Ok(Agent::new(MANAGER_ROLE, MANAGER_GOAL, MANAGER_BACKSTORY)
                .with_delegation(true)
                .with_llm(llm))
        }
    }
}

/// Progress of one run, carried across tasks.
#[derive(Default)]
struct Progress {
    /// Most recently completed output, sync or async. Conditional tasks gate on it.
    last_output: Option<TaskOutput>,
    /// Raw output of the most recent synchronous task; implicit context.
    last_sync_raw: Option<String>,
}

impl Progress {
    /// Seed from rehydrated outputs of the tasks before a replay point.
    fn seeded(earlier: &[Task]) -> Self {
        let last = earlier.iter().rev().find_map(Task::output).cloned();
        Self {
            last_sync_raw: last.as_ref().map(|o| o.raw.clone()),
            last_output: last,
        }
    }
}

type AsyncResult = (TaskOutput, u64);

/// An ordered task list, an agent roster, and a process strategy.
pub struct Crew {
    name: String,
    agents: Vec<Agent>,
    tasks: Vec<Task>,
    process: Process,
    manager: Option<Agent>,
    max_concurrent_tasks: usize,
    event_bus: Arc<EventBus>,
    runtime: Arc<AgentRuntime>,
    output_store: Arc<OutputStore>,
    task_callback: Option<TaskCallback>,
    run_log: Option<RunLogAttachment>,
    inputs: Inputs,
}

impl Crew {
    pub fn builder() -> CrewBuilder {
        CrewBuilder::default()
    }

    /// Construct and validate a crew from a definition file.
    pub fn from_config(config: &CrewConfig, bindings: &Bindings) -> Result<Self> {
        let definitions = config.build(bindings)?;
        let settings = &config.crew;

        let mut builder = Crew::builder()
            .name(&settings.name)
            .process(settings.process)
            .cache(settings.cache)
            .max_concurrent_tasks(settings.max_concurrent_tasks)
            .agents(definitions.agents)
            .tasks(definitions.tasks);
        if let Some(rpm) = settings.max_rpm {
            builder = builder.max_rpm(rpm);
        }
        if let Some(manager) = definitions.manager {
            builder = builder.manager_agent(manager);
        }
        if let Some(name) = settings.manager_llm.as_deref() {
            if let Some(llm) = bindings.llm(Some(name))? {
                builder = builder.manager_llm(llm);
            }
        }
        if let Some(llm) = &bindings.default_llm {
            builder = builder.default_llm(llm.clone());
        }
        if let Some(path) = config.store.resolved_path() {
            builder = builder.output_store(Arc::new(OutputStore::open(&path)?));
        }
        if let Some(log) = config.log.as_ref().filter(|l| l.enabled) {
            builder = builder.run_logger(RunLogger::new(log.resolved_dir(), log.level));
        }
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process(&self) -> Process {
        self.process
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// The manager; present only for hierarchical crews.
    pub fn manager(&self) -> Option<&Agent> {
        self.manager.as_ref()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn output_store(&self) -> &Arc<OutputStore> {
        &self.output_store
    }

    /// Inputs of the latest kickoff or replay.
    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    /// Usage accumulated by the latest kickoff or replay.
    pub fn usage(&self) -> UsageMetrics {
        self.runtime.usage()
    }

    pub fn run_log_path(&self) -> Option<&Path> {
        self.run_log.as_ref().map(RunLogAttachment::path)
    }

    /// The manager's two tool descriptors for the task at `index`.
    ///
    /// None for sequential crews or an out-of-range index.
    pub fn manager_tools_for(&self, index: usize) -> Option<[ToolDescriptor; 2]> {
        if self.manager.is_none() {
            return None;
        }
        let task = self.tasks.get(index)?;
        let roster: Vec<&Agent> = self.agents.iter().collect();
        let assigned = task.agent.and_then(|id| self.agent(id));
        Some(manager_tool_descriptors(&roster, assigned))
    }

    fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == id)
    }

    fn emit(&self, event: CrewEvent) {
        self.event_bus.emit(&self.name, event);
    }

    fn interpolate(&mut self, inputs: &Inputs) {
        if inputs.is_empty() {
            return;
        }
        for agent in self.agents.iter_mut().chain(self.manager.iter_mut()) {
            agent.interpolate(inputs);
        }
        for task in &mut self.tasks {
            task.interpolate(inputs);
        }
    }

    /// Run every task and return the final output.
    pub async fn kickoff(&mut self, inputs: Inputs) -> Result<CrewOutput> {
        self.emit(CrewEvent::CrewKickoffStarted {
            crew: self.name.clone(),
            inputs: inputs.clone(),
        });
        info!(crew = %self.name, process = %self.process, "Kickoff started");

        self.interpolate(&inputs);
        self.inputs = inputs;
        for task in &mut self.tasks {
            task.clear_output();
            task.set_prompt_context(None);
        }
        self.runtime.reset_run();

        let result = match self.output_store.reset() {
            Ok(()) => self.run_from(0, false).await,
            Err(e) => Err(e),
        };
        self.finish_kickoff(result)
    }

    /// Kick off once per input map, in order.
    pub async fn kickoff_for_each(&mut self, inputs: Vec<Inputs>) -> Result<Vec<CrewOutput>> {
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            outputs.push(self.kickoff(input).await?);
        }
        Ok(outputs)
    }

    /// Re-run from `task_id` onward, reusing stored outputs for earlier tasks.
    ///
    /// Uses the inputs stored with the original run unless `inputs` overrides them.
    pub async fn replay(&mut self, task_id: TaskId, inputs: Option<Inputs>) -> Result<CrewOutput> {
        let index = self
            .tasks
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| CrewError::ReplayNotFound(task_id.to_string()))?;

        let inputs = match inputs {
            Some(inputs) => inputs,
            None => self.stored_inputs(task_id)?,
        };
        self.emit(CrewEvent::CrewKickoffStarted {
            crew: self.name.clone(),
            inputs: inputs.clone(),
        });
        info!(crew = %self.name, task = %self.tasks[index].label(), index, "Replay started");

        let result = match self.rehydrate(index, inputs) {
            Ok(()) => self.run_from(index, true).await,
            Err(e) => Err(e),
        };
        self.finish_kickoff(result)
    }

    fn stored_inputs(&self, task_id: TaskId) -> Result<Inputs> {
        if let Some(record) = self.output_store.latest_for(task_id)? {
            return Ok(record.inputs);
        }
        let records = self.output_store.load()?;
        Ok(records
            .into_iter()
            .next()
            .map(|r| r.inputs)
            .unwrap_or_else(|| self.inputs.clone()))
    }

    /// Restore outputs before `index` from the store and drop later records.
    fn rehydrate(&mut self, index: usize, inputs: Inputs) -> Result<()> {
        self.interpolate(&inputs);
        self.inputs = inputs;

        for task in &mut self.tasks {
            task.clear_output();
            task.set_prompt_context(None);
        }
        for position in 0..index {
            let task_id = self.tasks[position].id;
            match self.output_store.latest_for(task_id)? {
                Some(record) => self.tasks[position].set_output(record.output),
                // Skipped conditional tasks leave no record.
                None if self.tasks[position].is_conditional() => {}
                None => return Err(CrewError::MissingStoredOutput(task_id.to_string())),
            }
        }

        let dropped = self.output_store.truncate_from(index)?;
        debug!(index, dropped, "Dropped stored outputs from the replay point");
        self.runtime.reset_run();
        Ok(())
    }

    fn finish_kickoff(&self, result: Result<CrewOutput>) -> Result<CrewOutput> {
        match result {
            Ok(output) => {
                info!(
                    crew = %self.name,
                    tasks = output.tasks_output.len(),
                    tokens = output.token_usage.total_tokens,
                    "Kickoff completed"
                );
                self.emit(CrewEvent::CrewKickoffCompleted {
                    crew: self.name.clone(),
                    output: output.raw.clone(),
                    total_tokens: output.token_usage.total_tokens,
                });
                Ok(output)
            }
            Err(e) => {
                warn!(crew = %self.name, error = %e, "Kickoff failed");
                self.emit(CrewEvent::CrewKickoffFailed {
                    crew: self.name.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_from(&mut self, start: usize, replaying: bool) -> Result<CrewOutput> {
        let mut scheduler: AsyncScheduler<AsyncResult> =
            AsyncScheduler::new(self.max_concurrent_tasks);
        let mut progress = Progress::seeded(&self.tasks[..start]);

        for index in start..self.tasks.len() {
            if self.tasks[index].is_conditional() {
                // Gate on everything dispatched so far.
                for resolved in scheduler.drain().await {
                    self.finish_async(resolved, replaying, &mut progress)?;
                }
                let gate = conditional::evaluate(&self.tasks[index], progress.last_output.as_ref())
                    .inspect_err(|e| self.task_failed(index, e))?;
                if gate == Gate::Skip {
                    let task = &self.tasks[index];
                    info!(task = %task.label(), index, "Condition not met, skipping task");
                    self.emit(CrewEvent::TaskSkipped {
                        task_id: task.id,
                        description: task.description().to_string(),
                    });
                    continue;
                }
            }

            let context = self
                .resolve_context(index, &mut scheduler, replaying, &mut progress)
                .await?;
            self.tasks[index].set_prompt_context(context.clone());
            let (agent, tools) = self.assignment(index)?;

            let task = &self.tasks[index];
            info!(task = %task.label(), index, agent = %agent.role(), "Task started");
            self.emit(CrewEvent::TaskStarted {
                task_id: task.id,
                description: task.description().to_string(),
                agent: agent.role().to_string(),
            });

            if task.async_execution {
                let runtime = self.runtime.clone();
                let task = task.clone();
                scheduler.submit(task.id, index, task.label().to_string(), async move {
                    let started = Instant::now();
                    let output = runtime
                        .execute_task(&agent, &task, context.as_deref(), &tools)
                        .await?;
                    Ok((output, started.elapsed().as_millis() as u64))
                });
                continue;
            }

            let started = Instant::now();
            let output = self
                .runtime
                .execute_task(&agent, task, context.as_deref(), &tools)
                .await
                .inspect_err(|e| self.task_failed(index, e))?;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            progress.last_sync_raw = Some(output.raw.clone());
            self.complete_task(index, output, elapsed_ms, replaying, &mut progress)?;
        }

        for resolved in scheduler.drain().await {
            self.finish_async(resolved, replaying, &mut progress)?;
        }
        Ok(self.crew_output())
    }

    /// Context string for the task at `index`.
    ///
    /// Declared context aggregates the upstream outputs, awaiting any that are
    /// still running. Without declared context the latest synchronous output is used.
    async fn resolve_context(
        &mut self,
        index: usize,
        scheduler: &mut AsyncScheduler<AsyncResult>,
        replaying: bool,
        progress: &mut Progress,
    ) -> Result<Option<String>> {
        let upstream = self.tasks[index].context.clone();
        if upstream.is_empty() {
            return Ok(progress.last_sync_raw.clone());
        }

        let mut parts = Vec::with_capacity(upstream.len());
        for id in upstream {
            if let Some(resolved) = scheduler.resolve(id).await {
                self.finish_async(resolved, replaying, progress)?;
            }
            if let Some(output) = self.tasks.iter().find(|t| t.id == id).and_then(Task::output) {
                parts.push(output.raw.clone());
            }
        }
        Ok((!parts.is_empty()).then(|| parts.join(CONTEXT_SEPARATOR)))
    }

    /// Responsible agent and its tool set for the task at `index`.
    fn assignment(&self, index: usize) -> Result<(Agent, Vec<Arc<dyn Tool>>)> {
        let task = &self.tasks[index];
        let bound = task.agent.and_then(|id| self.agent(id));

        if let Some(manager) = &self.manager {
            let roster: Vec<&Agent> = self.agents.iter().collect();
            let tools = delegation_tools(&self.runtime, &roster, bound);
            return Ok((manager.clone(), tools));
        }

        let agent = bound.ok_or_else(|| CrewError::TaskExecution {
            task: task.label().to_string(),
            message: "no agent bound to the task".into(),
        })?;
        let mut tools = if task.tools.is_empty() {
            agent.tools.clone()
        } else {
            task.tools.clone()
        };
        if agent.allow_delegation && self.agents.len() > 1 {
            let coworkers: Vec<&Agent> = self.agents.iter().filter(|a| a.id != agent.id).collect();
            tools.extend(delegation_tools(&self.runtime, &coworkers, None));
        }
        Ok((agent.clone(), tools))
    }

    fn finish_async(
        &mut self,
        resolved: Resolved<AsyncResult>,
        replaying: bool,
        progress: &mut Progress,
    ) -> Result<()> {
        match resolved.result {
            Ok((output, elapsed_ms)) => {
                self.complete_task(resolved.index, output, elapsed_ms, replaying, progress)
            }
            Err(e) => {
                self.task_failed(resolved.index, &e);
                Err(e)
            }
        }
    }

    fn complete_task(
        &mut self,
        index: usize,
        output: TaskOutput,
        elapsed_ms: u64,
        replaying: bool,
        progress: &mut Progress,
    ) -> Result<()> {
        let task = &mut self.tasks[index];
        task.set_output(output.clone());
        let record = StoredOutputRecord::new(
            task.id,
            index,
            task.expected_output(),
            output.clone(),
            self.inputs.clone(),
        )
        .replayed(replaying);
        let task_id = task.id;
        self.output_store.append(&record)?;

        debug!(task_id = %task_id, index, elapsed_ms, "Task completed");
        if let Some(callback) = &self.task_callback {
            callback(&output);
        }
        self.emit(CrewEvent::TaskCompleted {
            task_id,
            output: output.clone(),
            elapsed_ms,
        });
        progress.last_output = Some(output);
        Ok(())
    }

    fn task_failed(&self, index: usize, error: &CrewError) {
        let task = &self.tasks[index];
        warn!(task = %task.label(), index, error = %error, "Task failed");
        self.emit(CrewEvent::TaskFailed {
            task_id: task.id,
            error: error.to_string(),
        });
    }

    fn crew_output(&self) -> CrewOutput {
        let tasks_output: Vec<TaskOutput> =
            self.tasks.iter().filter_map(Task::output).cloned().collect();
        let (raw, structured) = match tasks_output.last() {
            Some(last) => (last.raw.clone(), last.structured.clone()),
            None => (String::new(), None),
        };
        CrewOutput {
            raw,
            structured,
            tasks_output,
            token_usage: self.runtime.usage(),
        }
    }

    /// Run `n_iterations` kickoffs and score every task output.
    pub async fn test(
        &mut self,
        n_iterations: usize,
        evaluator_llm: Arc<dyn CompletionClient>,
        inputs: Inputs,
    ) -> Result<EvaluationReport> {
        self.emit(CrewEvent::CrewTestStarted {
            crew: self.name.clone(),
            n_iterations,
        });

        // The evaluator snapshots descriptions, so they must carry these inputs.
        self.interpolate(&inputs);
        let evaluator = Arc::new(CrewEvaluator::new(evaluator_llm, &self.tasks, &self.agents));
        let handler = evaluator.attach(&self.event_bus);
        let result = self.test_iterations(&evaluator, n_iterations, &inputs).await;
        self.event_bus.deregister(handler);
        result?;

        self.emit(CrewEvent::CrewTestCompleted {
            crew: self.name.clone(),
            n_iterations,
        });
        Ok(evaluator.report(n_iterations))
    }

    async fn test_iterations(
        &mut self,
        evaluator: &CrewEvaluator,
        n_iterations: usize,
        inputs: &Inputs,
    ) -> Result<()> {
        for iteration in 1..=n_iterations {
            evaluator.set_iteration(iteration);
            let started = Instant::now();
            self.kickoff(inputs.clone()).await?;
            evaluator.record_execution_time(iteration, started.elapsed().as_millis() as u64);
            evaluator.evaluate_iteration(iteration).await?;
        }
        Ok(())
    }

    /// Run `n_iterations` kickoffs with delegation disabled, collect feedback
    /// on each agent's outputs, and save the result as JSON at `path`.
    pub async fn train(
        &mut self,
        n_iterations: usize,
        inputs: Inputs,
        path: impl Into<PathBuf>,
        evaluator: &dyn TrainingEvaluator,
    ) -> Result<TrainingData> {
        let path = path.into();
        self.emit(CrewEvent::CrewTrainStarted {
            crew: self.name.clone(),
            n_iterations,
        });

        let delegation: Vec<bool> = self.agents.iter().map(|a| a.allow_delegation).collect();
        for agent in &mut self.agents {
            agent.allow_delegation = false;
        }
        let collector = Arc::new(TrainingCollector::new());
        let handler = collector.attach(&self.event_bus);

        let mut result = Ok(());
        for iteration in 0..n_iterations {
            collector.set_iteration(iteration);
            if let Err(e) = self.kickoff(inputs.clone()).await {
                result = Err(e);
                break;
            }
        }

        self.event_bus.deregister(handler);
        for (agent, allow) in self.agents.iter_mut().zip(delegation) {
            agent.allow_delegation = allow;
        }
        result?;

        let mut data = TrainingData {
            crew: self.name.clone(),
            n_iterations,
            ..Default::default()
        };
        for agent in self.agents.iter().chain(self.manager.iter()) {
            let iterations = collector.outputs_for(agent.role());
            if iterations.is_empty() {
                continue;
            }
            let outputs: Vec<Vec<String>> = iterations.values().cloned().collect();
            let feedback = evaluator.evaluate(&agent.profile(), &outputs).await?;
            info!(agent = %agent.role(), quality = feedback.quality, "Training feedback received");
            data.agents.insert(
                agent.role().to_string(),
                TrainedAgent {
                    role: agent.role().to_string(),
                    iterations,
                    feedback,
                },
            );
        }
        data.save(&path)?;

        self.emit(CrewEvent::CrewTrainCompleted {
            crew: self.name.clone(),
            n_iterations,
        });
        Ok(data)
    }
}

impl Drop for Crew {
    fn drop(&mut self) {
        if let Some(log) = self.run_log.take() {
            log.detach(&self.event_bus);
        }
    }
}
