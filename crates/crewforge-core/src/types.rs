use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Interpolation inputs supplied to `kickoff`.
pub type Inputs = HashMap<String, serde_json::Value>;

/// Unique agent identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique task identifier.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id for a task declared in a definition file, so a crew
    /// rebuilt from the same file addresses the same stored outputs.
    pub fn derived(crew: &str, index: usize, key: &str) -> Self {
        let name = format!("{}/{}/{}", crew, index, key);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    /// Parse a task id from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution strategy of a crew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Process {
    /// Tasks run in declared order, each by its bound agent.
    #[default]
    Sequential,
    /// Every task is handed to a manager agent that delegates to the roster.
    Hierarchical,
}

impl Process {
    pub fn as_str(&self) -> &'static str {
        match self {
            Process::Sequential => "sequential",
            Process::Hierarchical => "hierarchical",
        }
    }
}

impl std::fmt::Display for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format tag of a task output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Raw,
    Json,
}

/// Result of one task execution. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub description: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub raw: String,
    #[serde(default, rename = "structured_form")]
    pub structured: Option<serde_json::Value>,
    #[serde(default)]
    pub output_format: OutputFormat,
    pub agent: String,
}

impl TaskOutput {
    /// Create a raw output; the summary is derived from the description.
    pub fn new(
        description: impl Into<String>,
        raw: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        let description = description.into();
        Self {
            summary: Some(summarize(&description)),
            description,
            raw: raw.into(),
            structured: None,
            output_format: OutputFormat::Raw,
            agent: agent.into(),
        }
    }

    /// Attach a structured JSON form and switch the format tag to JSON.
    pub fn with_structured(mut self, value: serde_json::Value) -> Self {
        self.structured = Some(value);
        self.output_format = OutputFormat::Json;
        self
    }
}

impl std::fmt::Display for TaskOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.structured {
            Some(value) => write!(f, "{}", value),
            None => f.write_str(&self.raw),
        }
    }
}

/// First ten words of a description followed by an ellipsis.
pub fn summarize(description: &str) -> String {
    let words: Vec<&str> = description.split_whitespace().take(10).collect();
    format!("{}...", words.join(" "))
}

/// Token accounting for completion calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub successful_requests: u64,
}

impl UsageMetrics {
    /// Fold one completion's usage into the running totals.
    pub fn record(&mut self, usage: TokenUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.prompt_tokens + usage.completion_tokens;
        self.successful_requests += 1;
    }

    pub fn add(&mut self, other: &UsageMetrics) {
        self.total_tokens += other.total_tokens;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.successful_requests += other.successful_requests;
    }
}

/// Usage reported by a single completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Role in an agent conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message exchanged with the completion service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Tool description sent to the completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool invocation requested by the completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Agent identity passed alongside each completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub role: String,
    pub goal: String,
    pub backstory: String,
}

/// Request sent to a completion collaborator.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub agent: AgentProfile,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
}

impl CompletionRequest {
    /// Concatenated content of every message, for matching in tests and logs.
    pub fn prompt(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Response from a completion collaborator.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// Text content; the final answer when no tool call is requested.
    pub content: String,
    /// Tool the model wants to invoke before answering.
    pub tool_call: Option<ToolCall>,
    pub usage: TokenUsage,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_call: None,
            usage: TokenUsage::default(),
        }
    }

    pub fn tool(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            content: String::new(),
            tool_call: Some(ToolCall {
                name: name.into(),
                input,
            }),
            usage: TokenUsage::default(),
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = TokenUsage {
            prompt_tokens,
            completion_tokens,
        };
        self
    }
}

/// Replace `{name}` placeholders with values from `inputs`.
///
/// Unknown placeholders are left intact. String values are inserted verbatim,
/// other JSON values in their compact textual form.
pub fn interpolate(template: &str, inputs: &Inputs) -> String {
    static PLACEHOLDER: OnceLock<Option<regex::Regex>> = OnceLock::new();
    let Some(re) = PLACEHOLDER
        .get_or_init(|| regex::Regex::new(r"\{([A-Za-z_][A-Za-z0-9_\-]*)\}").ok())
        .as_ref()
    else {
        return template.to_string();
    };

    re.replace_all(template, |caps: &regex::Captures<'_>| match inputs.get(&caps[1]) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => caps[0].to_string(),
    })
    .into_owned()
}
