//! Mocks shared by the crewforge test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crewforge_core::error::{CrewError, Result};
use crewforge_core::traits::{CompletionClient, Tool};
use crewforge_core::types::{Completion, CompletionRequest};

type Responder = dyn Fn(&CompletionRequest) -> Result<Completion> + Send + Sync;

/// Completion client driven by a closure or a script.
///
/// Every request is recorded so tests can inspect prompts and tool lists.
pub struct MockLlm {
    responder: Box<Responder>,
    script: Mutex<VecDeque<Completion>>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Option<Duration>,
}

impl MockLlm {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<Completion> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Always answer with the same text.
    pub fn fixed(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(Completion::text(text.clone())))
    }

    /// Answer with each completion in turn; fails once the script runs out.
    pub fn scripted(completions: Vec<Completion>) -> Self {
        let mock = Self::new(|req| {
            Err(CrewError::Completion {
                agent: req.agent.role.clone(),
                message: "mock script exhausted".into(),
            })
        });
        *mock.script.lock().unwrap() = completions.into();
        mock
    }

    /// Every call fails with the given message.
    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(move |req| {
            Err(CrewError::Completion {
                agent: req.agent.role.clone(),
                message: message.clone(),
            })
        })
    }

    /// Sleep before answering, to exercise concurrent execution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Concatenated prompt text of each request.
    pub fn prompts(&self) -> Vec<String> {
        self.requests().iter().map(|r| r.prompt()).collect()
    }

    fn respond(&self, request: &CompletionRequest) -> Result<Completion> {
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return Ok(next);
        }
        (self.responder)(request)
    }
}

impl CompletionClient for MockLlm {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let result = self.respond(&request);
            self.requests.lock().unwrap().push(request);
            result
        })
    }
}

type ToolFn = dyn Fn(Value) -> Result<Value> + Send + Sync;
type CachePredicate = dyn Fn(&Value, &Value) -> bool + Send + Sync;

/// Tool backed by a closure, counting its invocations.
pub struct FnTool {
    name: String,
    description: String,
    func: Box<ToolFn>,
    cache_predicate: Option<Box<CachePredicate>>,
    calls: AtomicUsize,
}

impl FnTool {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            func: Box::new(func),
            cache_predicate: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// `multiply(first_number, second_number)`, a common fixture.
    pub fn multiplier() -> Self {
        Self::new(
            "multiplier",
            "Useful for when you need to multiply two numbers together.",
            |input| {
                let a = input["first_number"].as_i64().unwrap_or(0);
                let b = input["second_number"].as_i64().unwrap_or(0);
                Ok(Value::from(a * b))
            },
        )
    }

    pub fn with_cache_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        self.cache_predicate = Some(Box::new(predicate));
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn invoke(&self, input: Value) -> BoxFuture<'_, Result<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = (self.func)(input);
        Box::pin(futures::future::ready(result))
    }

    fn should_cache(&self, input: &Value, output: &Value) -> bool {
        match &self.cache_predicate {
            Some(p) => p(input, output),
            None => true,
        }
    }
}
