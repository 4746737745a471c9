use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use crewforge_core::error::{CrewError, Result};
use crewforge_core::event::{CrewEvent, EventBus, EventKind, HandlerId};

/// JSONL run logger.
///
/// Registers on the event bus and writes one JSON object per lifecycle event.
/// Lines are flushed as they are written, so a crashed run keeps every entry
/// logged before the crash.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    source: &'a str,
    #[serde(flatten)]
    event: &'a CrewEvent,
}

/// Live registration of a [`RunLogger`]; detach to stop logging.
pub struct RunLogAttachment {
    path: PathBuf,
    handlers: Vec<HandlerId>,
}

impl RunLogAttachment {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn detach(self, bus: &EventBus) {
        for id in self.handlers {
            bus.deregister(id);
        }
    }
}

impl RunLogger {
    /// `level` controls verbosity: 1 = crew events, 2 = task events, 3 = agent and tool events.
    pub fn new(log_dir: impl Into<PathBuf>, level: u8) -> Self {
        Self {
            log_dir: log_dir.into(),
            level,
        }
    }

    /// Event kinds logged at this level.
    pub fn kinds(&self) -> Vec<EventKind> {
        let mut kinds = vec![
            EventKind::CrewKickoffStarted,
            EventKind::CrewKickoffCompleted,
            EventKind::CrewKickoffFailed,
            EventKind::CrewTrainStarted,
            EventKind::CrewTrainCompleted,
            EventKind::CrewTestStarted,
            EventKind::CrewTestCompleted,
        ];
        if self.level >= 2 {
            kinds.extend([
                EventKind::TaskStarted,
                EventKind::TaskCompleted,
                EventKind::TaskFailed,
                EventKind::TaskSkipped,
            ]);
        }
        if self.level >= 3 {
            kinds.extend([
                EventKind::AgentExecutionStarted,
                EventKind::AgentExecutionCompleted,
                EventKind::AgentExecutionFailed,
                EventKind::ToolUsageStarted,
                EventKind::ToolUsageFinished,
                EventKind::ToolUsageFailed,
            ]);
        }
        kinds
    }

    /// Open `{log_dir}/{crew}/{timestamp}.jsonl` and start logging into it.
    pub fn attach(&self, bus: &EventBus, crew: &str) -> Result<RunLogAttachment> {
        let crew_dir = self.log_dir.join(crew);
        std::fs::create_dir_all(&crew_dir)?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%.3f").to_string();
        let path = crew_dir.join(format!("{}.jsonl", timestamp));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CrewError::Storage(format!("Failed to open log file: {}", e)))?;
        info!(path = %path.display(), level = self.level, "Run log attached");

        let writer: Arc<Mutex<BufWriter<File>>> = Arc::new(Mutex::new(BufWriter::new(file)));
        let handlers = bus.register_many(&self.kinds(), move |source, event| {
            let entry = LogEntry {
                timestamp: Utc::now().to_rfc3339(),
                source,
                event,
            };
            let Ok(json) = serde_json::to_string(&entry) else {
                return;
            };
            let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = writeln!(writer, "{}", json).and_then(|_| writer.flush()) {
                error!(error = %e, "Failed to write log entry");
            }
        });

        Ok(RunLogAttachment { path, handlers })
    }
}
