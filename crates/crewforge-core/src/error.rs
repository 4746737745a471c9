use thiserror::Error;

/// Coarse classification of a [`CrewError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Structural problem in the task list, detected before any execution.
    GraphValidation,
    /// Invalid crew/manager/agent wiring.
    Configuration,
    /// Agent, tool, or predicate failure during a run.
    Execution,
    /// Replay requested for a task the crew does not contain.
    ReplayNotFound,
    /// Output store or file-system failure.
    Storage,
}

#[derive(Debug, Error)]
pub enum CrewError {
    // Construction errors
    #[error("Graph validation failed: {0}")]
    GraphValidation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Execution errors
    #[error("Completion request failed for agent '{agent}': {message}")]
    Completion { agent: String, message: String },

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Condition evaluation failed for task '{task}': {message}")]
    Condition { task: String, message: String },

    #[error("Task execution failed: {task}: {message}")]
    TaskExecution { task: String, message: String },

    #[error("Task output for '{task}' is not valid JSON: {message}")]
    OutputFormat { task: String, message: String },

    // Replay errors
    #[error("Task with id {0} not found in the crew's tasks")]
    ReplayNotFound(String),

    #[error("No stored output found for task {0}")]
    MissingStoredOutput(String),

    // Storage errors
    #[error("Output store error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CrewError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrewError::GraphValidation(_) => ErrorKind::GraphValidation,
            CrewError::Configuration(_) | CrewError::ConfigNotFound(_) => {
                ErrorKind::Configuration
            }
            CrewError::Completion { .. }
            | CrewError::ToolExecution { .. }
            | CrewError::Condition { .. }
            | CrewError::TaskExecution { .. }
            | CrewError::OutputFormat { .. } => ErrorKind::Execution,
            CrewError::ReplayNotFound(_) | CrewError::MissingStoredOutput(_) => {
                ErrorKind::ReplayNotFound
            }
            CrewError::Storage(_) | CrewError::Io(_) | CrewError::Json(_) => ErrorKind::Storage,
        }
    }

    /// Shorthand for a graph validation failure.
    pub fn graph(message: impl Into<String>) -> Self {
        CrewError::GraphValidation(message.into())
    }

    /// Shorthand for a configuration failure.
    pub fn config(message: impl Into<String>) -> Self {
        CrewError::Configuration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, CrewError>;
