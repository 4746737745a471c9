use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{Completion, CompletionRequest, ToolDescriptor};

/// Completion service: turns a prompt into text, optionally requesting a tool call.
pub trait CompletionClient: Send + Sync + 'static {
    /// Run one completion for the agent named in the request.
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>>;
}

/// Extensible capability an agent can invoke.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in tool calls and cache keys).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    /// Invoke the tool with the given input.
    fn invoke(&self, input: serde_json::Value) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Whether a freshly produced output may be cached (default: always).
    fn should_cache(&self, input: &serde_json::Value, output: &serde_json::Value) -> bool {
        let _ = (input, output);
        true
    }

    /// Descriptor sent to the completion service.
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}
