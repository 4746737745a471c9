use std::sync::Arc;

use crate::agent::Agent;
use crate::traits::Tool;
use crate::types::{interpolate, AgentId, Inputs, TaskId, TaskOutput};

type ConditionFn = dyn Fn(&TaskOutput) -> std::result::Result<bool, String> + Send + Sync;

/// Skip predicate of a conditional task, evaluated over the previous output.
#[derive(Clone)]
pub struct Condition(Arc<ConditionFn>);

impl Condition {
    /// Wrap a fallible predicate. An `Err` aborts the run.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&TaskOutput) -> std::result::Result<bool, String> + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Wrap an infallible predicate.
    pub fn from_fn<F>(predicate: F) -> Self
    where
        F: Fn(&TaskOutput) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(move |output| Ok(predicate(output))))
    }

    pub fn evaluate(&self, output: &TaskOutput) -> std::result::Result<bool, String> {
        (self.0)(output)
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Condition(..)")
    }
}

/// A declared unit of work.
///
/// Description and expected output are templates interpolated per kickoff.
/// The `output` slot is owned by the engine: it is cleared at the start of a
/// fresh run and written once when the task completes.
#[derive(Clone)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,
    /// Optional short name, used by crew configs to reference context.
    pub name: Option<String>,
    description_template: String,
    expected_output_template: String,
    description: String,
    expected_output: String,
    /// Bound agent; required unless the crew is hierarchical.
    pub agent: Option<AgentId>,
    /// Upstream tasks whose outputs feed this one.
    pub context: Vec<TaskId>,
    /// Run off the main control flow.
    pub async_execution: bool,
    /// Present on conditional tasks.
    pub condition: Option<Condition>,
    /// Parse the final answer as JSON.
    pub output_json: bool,
    /// Task-specific tools; when non-empty they replace the agent's tools.
    pub tools: Vec<Arc<dyn Tool>>,
    output: Option<TaskOutput>,
    prompt_context: Option<String>,
}

impl Task {
    pub fn new(description: impl Into<String>, expected_output: impl Into<String>) -> Self {
        let description = description.into();
        let expected_output = expected_output.into();
        Self {
            id: TaskId::new(),
            name: None,
            description_template: description.clone(),
            expected_output_template: expected_output.clone(),
            description,
            expected_output,
            agent: None,
            context: vec![],
            async_execution: false,
            condition: None,
            output_json: false,
            tools: vec![],
            output: None,
            prompt_context: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_agent(mut self, agent: &Agent) -> Self {
        self.agent = Some(agent.id);
        self
    }

    pub fn with_agent_id(mut self, agent: AgentId) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_context(mut self, upstream: &[&Task]) -> Self {
        self.context = upstream.iter().map(|t| t.id).collect();
        self
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_context_ids(mut self, upstream: Vec<TaskId>) -> Self {
        self.context = upstream;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.async_execution = true;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_output_json(mut self) -> Self {
        self.output_json = true;
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn expected_output(&self) -> &str {
        &self.expected_output
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    /// Display label used in validation messages and logs.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.description)
    }

    pub fn output(&self) -> Option<&TaskOutput> {
        self.output.as_ref()
    }

    /// Context string resolved for the latest execution.
    pub fn prompt_context(&self) -> Option<&str> {
        self.prompt_context.as_deref()
    }

    pub fn set_output(&mut self, output: TaskOutput) {
        self.output = Some(output);
    }

    pub fn clear_output(&mut self) {
        self.output = None;
    }

    pub fn set_prompt_context(&mut self, context: Option<String>) {
        self.prompt_context = context;
    }

    /// Fill description and expected output from the original templates.
    pub fn interpolate(&mut self, inputs: &Inputs) {
        self.description = interpolate(&self.description_template, inputs);
        self.expected_output = interpolate(&self.expected_output_template, inputs);
    }

    /// Task instructions without context.
    pub fn prompt(&self) -> String {
        format!(
            "{}\n\nThis is the expected criteria for your final answer: {}\n\
             You MUST return the actual complete content as the final answer, not a summary.",
            self.description, self.expected_output
        )
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("description", &self.description)
            .field("agent", &self.agent)
            .field("context", &self.context)
            .field("async_execution", &self.async_execution)
            .field("conditional", &self.is_conditional())
            .field("output", &self.output)
            .finish()
    }
}
