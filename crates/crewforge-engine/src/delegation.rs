use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::info;

use crewforge_core::agent::Agent;
use crewforge_core::error::Result;
use crewforge_core::task::Task;
use crewforge_core::traits::Tool;
use crewforge_core::types::ToolDescriptor;

use crate::runtime::AgentRuntime;

pub const DELEGATE_WORK: &str = "Delegate work to coworker";
pub const ASK_QUESTION: &str = "Ask question to coworker";

const COWORKER_EXPECTED_OUTPUT: &str =
    "Your best answer to your coworker asking you this, accounting for the context shared.";

/// Narrow the roster to the assigned agent when there is one.
fn coworkers<'a>(roster: &[&'a Agent], assigned: Option<&'a Agent>) -> Vec<&'a Agent> {
    match assigned {
        Some(agent) => vec![agent],
        None => roster.to_vec(),
    }
}

fn role_list(coworkers: &[&Agent]) -> String {
    coworkers
        .iter()
        .map(|a| a.role())
        .collect::<Vec<_>>()
        .join(", ")
}

fn delegate_description(roles: &str) -> String {
    format!(
        "Delegate a specific task to one of the following coworkers: {}\n\
         The input to this tool should be the coworker, the task you want them to do, and ALL \
         necessary context to execute the task, they know nothing about the task, so share \
         absolute everything you know, don't reference things but instead explain them.",
        roles
    )
}

fn ask_description(roles: &str) -> String {
    format!(
        "Ask a specific question to one of the following coworkers: {}\n\
         The input to this tool should be the coworker, the question you have for them, and ALL \
         necessary context to ask the question properly, they know nothing about the question, \
         so share absolute everything you know, don't reference things but instead explain them.",
        roles
    )
}

fn delegate_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "task": { "type": "string", "description": "The task to delegate" },
            "context": { "type": "string", "description": "The context for the task" },
            "coworker": { "type": "string", "description": "The role/name of the coworker to delegate to" }
        },
        "required": ["task", "context", "coworker"]
    })
}

fn ask_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "question": { "type": "string", "description": "The question to ask" },
            "context": { "type": "string", "description": "The context for the question" },
            "coworker": { "type": "string", "description": "The role/name of the coworker to ask" }
        },
        "required": ["question", "context", "coworker"]
    })
}

/// The two manager tool descriptors for a roster.
///
/// Pure data: the delegate and ask descriptions each enumerate the coworker
/// roles, narrowed to `assigned` when it is given.
pub fn manager_tool_descriptors(
    roster: &[&Agent],
    assigned: Option<&Agent>,
) -> [ToolDescriptor; 2] {
    let roles = role_list(&coworkers(roster, assigned));
    [
        ToolDescriptor {
            name: DELEGATE_WORK.to_string(),
            description: delegate_description(&roles),
            input_schema: delegate_schema(),
        },
        ToolDescriptor {
            name: ASK_QUESTION.to_string(),
            description: ask_description(&roles),
            input_schema: ask_schema(),
        },
    ]
}

/// Executable delegation tools over the same coworker set as
/// [`manager_tool_descriptors`].
pub fn delegation_tools(
    runtime: &Arc<AgentRuntime>,
    roster: &[&Agent],
    assigned: Option<&Agent>,
) -> Vec<Arc<dyn Tool>> {
    let coworkers: Vec<Agent> = coworkers(roster, assigned).into_iter().cloned().collect();
    let [delegate, ask] = manager_tool_descriptors(roster, assigned);
    vec![
        Arc::new(CoworkerTool {
            descriptor: delegate,
            request_field: "task",
            runtime: runtime.clone(),
            coworkers: coworkers.clone(),
        }),
        Arc::new(CoworkerTool {
            descriptor: ask,
            request_field: "question",
            runtime: runtime.clone(),
            coworkers,
        }),
    ]
}

/// Hands a request to a coworker and returns the coworker's answer.
struct CoworkerTool {
    descriptor: ToolDescriptor,
    /// `task` for delegation, `question` for asking.
    request_field: &'static str,
    runtime: Arc<AgentRuntime>,
    coworkers: Vec<Agent>,
}

fn normalize(role: &str) -> String {
    role.trim().trim_matches('"').trim().to_lowercase()
}

impl CoworkerTool {
    fn find(&self, name: &str) -> Option<&Agent> {
        let wanted = normalize(name);
        self.coworkers.iter().find(|a| normalize(a.role()) == wanted)
    }

    fn not_found(&self) -> String {
        let options: Vec<String> = self
            .coworkers
            .iter()
            .map(|a| format!("- {}", normalize(a.role())))
            .collect();
        format!(
            "\nError executing tool. coworker mentioned not found, it must be one of the following options:\n{}\n",
            options.join("\n")
        )
    }

    async fn run(&self, input: Value) -> Result<Value> {
        let field = |key: &str| input.get(key).and_then(Value::as_str).unwrap_or_default();
        let request = field(self.request_field);
        let context = field("context");

        let Some(coworker) = self.find(field("coworker")) else {
            return Ok(Value::String(self.not_found()));
        };

        info!(coworker = %coworker.role(), tool = %self.descriptor.name, "Delegating to coworker");
        let task = Task::new(request, COWORKER_EXPECTED_OUTPUT).with_agent(coworker);
        let context = (!context.is_empty()).then_some(context);
        // Coworkers answer with their own tools only, never with delegation tools.
        let output = self
            .runtime
            .execute_task(coworker, &task, context, &coworker.tools)
            .await?;
        Ok(Value::String(output.raw))
    }
}

impl Tool for CoworkerTool {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn input_schema(&self) -> Value {
        self.descriptor.input_schema.clone()
    }

    fn invoke(&self, input: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(self.run(input))
    }

    fn should_cache(&self, _input: &Value, _output: &Value) -> bool {
        false
    }
}
