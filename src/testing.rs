// Test doubles shared by the unit tests
use crate::engine::{ExecutionEngine, LiveOperation, RawResponse};
use crate::result::{ExecutionResult, ResultHandler};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Scripted execution engine.
///
/// Responses are taken from a queue first, then from the fallback, which
/// carries a subscribe token by default. A gated engine holds every
/// execution until a permit is added to its semaphore.
pub(crate) struct MockEngine {
    responses: Mutex<VecDeque<Result<RawResponse>>>,
    fallback: RawResponse,
    executed: Mutex<Vec<Value>>,
    directives: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<String>>,
    establishes: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl MockEngine {
    fn with_fallback(fallback: RawResponse, gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback,
            executed: Mutex::new(Vec::new()),
            directives: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            establishes: AtomicUsize::new(0),
            gate,
        }
    }

    pub(crate) fn with_server_id(server_id: &str) -> Self {
        Self::with_fallback(
            RawResponse::data(json!({"subscribe": server_id, "todos": [{"id": 1}]})),
            None,
        )
    }

    pub(crate) fn without_server_id() -> Self {
        Self::with_fallback(RawResponse::data(json!({"todos": []})), None)
    }

    pub(crate) fn gated(server_id: &str) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let engine = Self::with_fallback(
            RawResponse::data(json!({"subscribe": server_id, "todos": []})),
            Some(gate.clone()),
        );
        (engine, gate)
    }

    pub(crate) fn push_response(&self, response: Result<RawResponse>) {
        self.responses.lock().push_back(response);
    }

    pub(crate) fn fail_directive(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    /// Executions started, including ones still waiting on the gate
    pub(crate) fn execution_count(&self) -> usize {
        self.executed.lock().len()
    }

    pub(crate) fn executed_variables(&self) -> Vec<Value> {
        self.executed.lock().clone()
    }

    pub(crate) fn establish_count(&self) -> usize {
        self.establishes.load(Ordering::SeqCst)
    }

    pub(crate) fn directives(&self) -> Vec<(String, String)> {
        self.directives.lock().clone()
    }

    pub(crate) fn directive_count(&self, name: &str) -> usize {
        self.directives
            .lock()
            .iter()
            .filter(|(directive, _)| directive == name)
            .count()
    }
}

#[async_trait::async_trait]
impl ExecutionEngine for MockEngine {
    async fn execute(&self, _operation: &LiveOperation, variables: &Value) -> Result<RawResponse> {
        self.executed.lock().push(variables.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        let queued = self.responses.lock().pop_front();
        queued.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    async fn establish(
        &self,
        operation: &LiveOperation,
        variables: &Value,
    ) -> Result<futures::stream::BoxStream<'static, Result<RawResponse>>> {
        use futures::StreamExt;

        self.establishes.fetch_add(1, Ordering::SeqCst);
        let first = self.execute(operation, variables).await;
        Ok(futures::stream::once(async move { first }).boxed())
    }

    async fn directive(&self, name: &str, server_id: &str) -> Result<()> {
        self.directives
            .lock()
            .push((name.to_string(), server_id.to_string()));
        if self.failing.lock().contains(name) {
            return Err(Error::Server {
                status: 500,
                message: format!("{} rejected", name),
            });
        }
        Ok(())
    }
}

/// Result handler that keeps everything it receives
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    results: Arc<Mutex<Vec<ExecutionResult>>>,
}

impl Recorder {
    pub(crate) fn results(&self) -> Vec<ExecutionResult> {
        self.results.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.results.lock().len()
    }
}

impl ResultHandler for Recorder {
    fn on_result(&self, result: ExecutionResult) {
        self.results.lock().push(result);
    }
}

/// Install a test log writer once
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
