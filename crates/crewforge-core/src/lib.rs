pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod task;
pub mod traits;
pub mod types;

pub use agent::Agent;
pub use config::{Bindings, CrewConfig};
pub use error::{CrewError, ErrorKind, Result};
pub use event::{CrewEvent, EventBus, EventKind, HandlerId};
pub use task::{Condition, Task};
pub use traits::{CompletionClient, Tool};
pub use types::*;
