use std::sync::Arc;

use crate::traits::{CompletionClient, Tool};
use crate::types::{interpolate, AgentId, AgentProfile, Inputs};

fn default_max_iter() -> usize {
    25
}

/// An actor with a role, goal, and backstory that executes tasks.
///
/// Role, goal, and backstory are templates: `{placeholder}` tokens are filled
/// from the kickoff inputs by [`Agent::interpolate`], which always starts from
/// the original template so repeated kickoffs do not compound.
#[derive(Clone)]
pub struct Agent {
    /// Unique agent identifier.
    pub id: AgentId,
    role_template: String,
    goal_template: String,
    backstory_template: String,
    role: String,
    goal: String,
    backstory: String,
    /// Whether the agent may hand work to coworkers.
    pub allow_delegation: bool,
    /// Tools the agent can call.
    pub tools: Vec<Arc<dyn Tool>>,
    /// Maximum completion requests per minute (None = unlimited).
    pub max_rpm: Option<u32>,
    /// Maximum reason/act iterations before a final answer is forced.
    pub max_iter: usize,
    /// Whether tool results go through the crew cache.
    pub cache: bool,
    /// Completion binding; falls back to the crew default when absent.
    pub llm: Option<Arc<dyn CompletionClient>>,
}

impl Agent {
    pub fn new(
        role: impl Into<String>,
        goal: impl Into<String>,
        backstory: impl Into<String>,
    ) -> Self {
        let role = role.into();
        let goal = goal.into();
        let backstory = backstory.into();
        Self {
            id: AgentId::new(),
            role_template: role.clone(),
            goal_template: goal.clone(),
            backstory_template: backstory.clone(),
            role,
            goal,
            backstory,
            allow_delegation: false,
            tools: vec![],
            max_rpm: None,
            max_iter: default_max_iter(),
            cache: true,
            llm: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn CompletionClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_delegation(mut self, allow: bool) -> Self {
        self.allow_delegation = allow;
        self
    }

    pub fn with_max_rpm(mut self, max_rpm: u32) -> Self {
        self.max_rpm = Some(max_rpm);
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter.max(1);
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn backstory(&self) -> &str {
        &self.backstory
    }

    /// Fill role, goal, and backstory from the original templates.
    pub fn interpolate(&mut self, inputs: &Inputs) {
        self.role = interpolate(&self.role_template, inputs);
        self.goal = interpolate(&self.goal_template, inputs);
        self.backstory = interpolate(&self.backstory_template, inputs);
    }

    /// Identity sent with every completion request.
    pub fn profile(&self) -> AgentProfile {
        AgentProfile {
            id: self.id,
            role: self.role.clone(),
            goal: self.goal.clone(),
            backstory: self.backstory.clone(),
        }
    }

    pub fn system_prompt(&self) -> String {
        format!(
            "You are {}. {}\nYour personal goal is: {}",
            self.role, self.backstory, self.goal
        )
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("goal", &self.goal)
            .field("allow_delegation", &self.allow_delegation)
            .field("tools", &self.tool_names())
            .field("max_rpm", &self.max_rpm)
            .field("max_iter", &self.max_iter)
            .field("cache", &self.cache)
            .field("has_llm", &self.llm.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_builder() {
        let agent = Agent::new("Researcher", "Find facts", "You dig deep.")
            .with_delegation(true)
            .with_max_rpm(10)
            .with_max_iter(0);

        assert_eq!(agent.role(), "Researcher");
        assert!(agent.allow_delegation);
        assert_eq!(agent.max_rpm, Some(10));
        assert_eq!(agent.max_iter, 1);
        assert!(agent.cache);
        assert!(agent.tools.is_empty());
    }

    #[test]
    fn test_interpolate_uses_templates() {
        let mut agent = Agent::new(
            "{topic} Researcher",
            "Express hot takes on {topic}.",
            "You have a lot of experience with {topic}.",
        );

        let mut inputs = Inputs::new();
        inputs.insert("topic".into(), serde_json::json!("AI"));
        agent.interpolate(&inputs);
        assert_eq!(agent.role(), "AI Researcher");
        assert_eq!(agent.goal(), "Express hot takes on AI.");
        assert_eq!(agent.backstory(), "You have a lot of experience with AI.");

        inputs.insert("topic".into(), serde_json::json!("Rust"));
        agent.interpolate(&inputs);
        assert_eq!(agent.role(), "Rust Researcher");
    }

    #[test]
    fn test_system_prompt() {
        let agent = Agent::new("Writer", "Write well", "You love prose.");
        let prompt = agent.system_prompt();
        assert!(prompt.starts_with("You are Writer. You love prose."));
        assert!(prompt.contains("Your personal goal is: Write well"));
    }
}
