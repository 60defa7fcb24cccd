//! Live query state machine
//!
//! A [`Subscription`] is one live query instance. All of its lifecycle
//! operations (refetch, pause, resume, unsubscribe) go through a per-instance
//! operation chain: an unbounded FIFO queue drained by a dedicated worker
//! task. An operation starts only once every operation submitted before it
//! has settled, so `unsubscribe` issued behind a queued `refetch` can never
//! race it.
//!
//! Operations are submitted when the method is called, not when the returned
//! future is first polled. Preconditions are checked when the operation
//! reaches the front of the chain; an operation whose preconditions no longer
//! hold becomes a no-op.
//!
//! [`reset`](Subscription::reset) starts a new chain epoch. A worker of an
//! older epoch may still be running when the reset happens, so every side
//! effect (adopting a server id, delivering a result, changing state) is
//! applied under the instance's apply lock and only if the operation's epoch
//! is still current.
//!
//! Non-forced refetches requested while the live query is paused are dropped
//! rather than deferred until resume. Change notifications that arrive while
//! paused are therefore lost; `resume` followed by an explicit refetch picks
//! up the current data.

use crate::engine::{
    ExecutionEngine, LiveOperation, RawResponse, PAUSE_DIRECTIVE, RESUME_DIRECTIVE,
    UNSUBSCRIBE_DIRECTIVE,
};
use crate::metrics::SyncMetrics;
use crate::registry::SubscriptionRegistry;
use crate::result::{ErrorChannel, ExecutionResult, GraphQLError, ResultHandler, ResultProcessor};
use crate::{Error, Result};
use futures::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Process-unique identifier of a live query instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a live query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Subscribed,
    Paused,
    Unsubscribed,
}

impl SubscriptionState {
    /// State reached by applying a directive, `None` if it is not allowed
    pub fn after(self, directive: Directive) -> Option<Self> {
        match (self, directive) {
            (SubscriptionState::Subscribed, Directive::Pause) => Some(SubscriptionState::Paused),
            (SubscriptionState::Paused, Directive::Resume) => Some(SubscriptionState::Subscribed),
            (
                SubscriptionState::Subscribed | SubscriptionState::Paused,
                Directive::Unsubscribe,
            ) => Some(SubscriptionState::Unsubscribed),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Subscribed => "subscribed",
            SubscriptionState::Paused => "paused",
            SubscriptionState::Unsubscribed => "unsubscribed",
        };
        f.write_str(name)
    }
}

/// Side-channel requests that change server-side tracking of a live query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    Pause,
    Resume,
    Unsubscribe,
}

impl Directive {
    /// Wire name of the directive
    pub fn name(self) -> &'static str {
        match self {
            Directive::Pause => PAUSE_DIRECTIVE,
            Directive::Resume => RESUME_DIRECTIVE,
            Directive::Unsubscribe => UNSUBSCRIBE_DIRECTIVE,
        }
    }
}

/// Collaborators shared by every live query of a client
pub(crate) struct SyncContext {
    pub(crate) engine: Arc<dyn ExecutionEngine>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) errors: ErrorChannel,
    pub(crate) subscribe_field: String,
    pub(crate) metrics: Arc<SyncMetrics>,
}

enum Command {
    Establish,
    Refetch { force: bool },
    Directive(Directive),
}

impl Command {
    fn holds_refetch_flag(&self) -> bool {
        matches!(self, Command::Refetch { force: false })
    }
}

struct Job {
    command: Command,
    epoch: u64,
    reply: oneshot::Sender<Result<bool>>,
}

struct Chain {
    sender: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

/// One live query instance.
///
/// Created through [`LiveQueryClient`](crate::LiveQueryClient); must be
/// created inside a Tokio runtime, since its operation chain runs as a task.
pub struct Subscription {
    this: Weak<Subscription>,
    local_id: LocalId,
    operation: LiveOperation,
    variables: RwLock<Value>,
    state: Mutex<SubscriptionState>,
    server_id: Mutex<Option<String>>,
    refetch_in_flight: AtomicBool,
    epoch: AtomicU64,
    chain: Mutex<Option<Chain>>,
    applying: Mutex<()>,
    processor: ResultProcessor,
    handler: Arc<dyn ResultHandler>,
    context: Arc<SyncContext>,
}

impl Subscription {
    pub(crate) fn spawn(
        context: Arc<SyncContext>,
        operation: LiveOperation,
        variables: Value,
        processor: ResultProcessor,
        handler: Arc<dyn ResultHandler>,
    ) -> Arc<Self> {
        let subscription = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            local_id: LocalId::new(),
            operation,
            variables: RwLock::new(variables),
            state: Mutex::new(SubscriptionState::Subscribed),
            server_id: Mutex::new(None),
            refetch_in_flight: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            chain: Mutex::new(None),
            applying: Mutex::new(()),
            processor,
            handler,
            context,
        });
        subscription.install_chain();
        subscription
    }

    /// Process-unique id of this instance
    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    /// Server subscription id, `None` until the first successful fetch
    pub fn server_id(&self) -> Option<String> {
        self.server_id.lock().clone()
    }

    /// The live operation this instance re-executes
    pub fn operation(&self) -> &LiveOperation {
        &self.operation
    }

    /// Variables used by the next refetch
    pub fn variables(&self) -> Value {
        self.variables.read().clone()
    }

    /// Replace the variables used by subsequent refetches
    pub fn set_variables(&self, variables: Value) {
        *self.variables.write() = variables;
    }

    /// Run the initial fetch through the engine's establish stream
    pub(crate) fn establish(&self) -> impl Future<Output = Result<bool>> + Send + 'static {
        settle(self.submit(Command::Establish))
    }

    /// Re-execute the query.
    ///
    /// A non-forced refetch requires the instance to be registered and
    /// subscribed when it runs, and is a no-op while another non-forced
    /// refetch is pending. Resolves `true` when a round-trip was performed.
    pub fn refetch(&self, force: bool) -> impl Future<Output = Result<bool>> + Send + 'static {
        let submitted = if !force && self.refetch_in_flight.swap(true, Ordering::AcqRel) {
            debug!("Coalescing refetch for live query {}", self.local_id);
            SyncMetrics::incr(&self.context.metrics.refetches_coalesced);
            None
        } else {
            self.submit(Command::Refetch { force })
        };
        settle(submitted)
    }

    /// Ask the server to stop tracking changes. Requires `Subscribed`.
    pub fn pause(&self) -> impl Future<Output = Result<bool>> + Send + 'static {
        settle(self.submit(Command::Directive(Directive::Pause)))
    }

    /// Ask the server to track changes again. Requires `Paused`.
    pub fn resume(&self) -> impl Future<Output = Result<bool>> + Send + 'static {
        settle(self.submit(Command::Directive(Directive::Resume)))
    }

    /// Stop the live query for good. Local teardown happens even when the
    /// server does not acknowledge the directive.
    pub fn unsubscribe(&self) -> impl Future<Output = Result<bool>> + Send + 'static {
        settle(self.submit(Command::Directive(Directive::Unsubscribe)))
    }

    /// Discard every queued and in-flight operation without touching the
    /// network. Discarded operations resolve `false`.
    pub(crate) fn reset(&self) {
        self.install_chain();
        self.refetch_in_flight.store(false, Ordering::Release);
        debug!("Reset operation chain of live query {}", self.local_id);
    }

    fn install_chain(&self) {
        let (sender, jobs) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_chain(self.this.clone(), jobs));
        let previous = {
            let mut chain = self.chain.lock();
            // Jobs submitted from now on carry the new epoch
            self.epoch.fetch_add(1, Ordering::AcqRel);
            chain.replace(Chain { sender, worker })
        };
        if let Some(previous) = previous {
            previous.worker.abort();
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch
    }

    fn submit(&self, command: Command) -> Option<oneshot::Receiver<Result<bool>>> {
        let (reply, receiver) = oneshot::channel();
        let chain = self.chain.lock();
        let epoch = self.epoch.load(Ordering::Acquire);
        chain
            .as_ref()?
            .sender
            .send(Job {
                command,
                epoch,
                reply,
            })
            .ok()?;
        Some(receiver)
    }

    async fn execute(&self, command: Command, epoch: u64) -> Result<bool> {
        match command {
            Command::Establish => self.run_refetch(true, true, epoch).await,
            Command::Refetch { force } => {
                let outcome = self.run_refetch(force, false, epoch).await;
                if !force {
                    self.release_refetch_flag(epoch);
                }
                outcome
            }
            Command::Directive(directive) => self.run_directive(directive, epoch).await,
        }
    }

    fn release_refetch_flag(&self, epoch: u64) {
        // A reset already cleared the flag for the new epoch
        if self.is_current(epoch) {
            self.refetch_in_flight.store(false, Ordering::Release);
        }
    }

    async fn run_refetch(&self, force: bool, establish: bool, epoch: u64) -> Result<bool> {
        let state = self.state();
        if state == SubscriptionState::Unsubscribed
            || (!force && (state != SubscriptionState::Subscribed || !self.is_registered()))
        {
            debug!(
                "Dropping refetch for live query {} ({}, registered: {})",
                self.local_id,
                state,
                self.is_registered()
            );
            SyncMetrics::incr(&self.context.metrics.operations_dropped);
            return Ok(false);
        }

        let variables = self.variables();
        SyncMetrics::incr(&self.context.metrics.refetches_executed);
        let outcome = if establish {
            self.first_result(&variables).await
        } else {
            self.context.engine.execute(&self.operation, &variables).await
        };

        let _applying = self.applying.lock();
        if !self.is_current(epoch) {
            debug!("Discarding stale result of live query {}", self.local_id);
            return Ok(false);
        }

        let outcome = match outcome {
            Ok(mut response) => {
                if let Some(token) = response.take_subscribe_token(&self.context.subscribe_field) {
                    self.adopt_server_id(token);
                }
                Ok(response)
            }
            Err(e) => {
                warn!("Refetch of live query {} failed: {}", self.local_id, e);
                Err(e)
            }
        };

        self.deliver(ExecutionResult::from_outcome(outcome));
        Ok(true)
    }

    /// Run the result through the processor and the handler. Both are caller
    /// code; a panic in either is logged and does not take the chain down.
    fn deliver(&self, result: ExecutionResult) {
        let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(result) = self.processor.process(result) {
                self.handler.on_result(result);
            }
        }));
        if delivered.is_err() {
            warn!(
                "Result handler of live query {} panicked, result dropped",
                self.local_id
            );
        }
    }

    async fn first_result(&self, variables: &Value) -> Result<RawResponse> {
        let mut results = self
            .context
            .engine
            .establish(&self.operation, variables)
            .await?;
        match results.next().await {
            Some(first) => first,
            None => Err(Error::Execution {
                message: "Live query ended before its first result".to_string(),
            }),
        }
    }

    fn adopt_server_id(&self, token: String) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let previous = self.server_id.lock().replace(token.clone());
        match previous {
            Some(previous) if previous == token => {}
            Some(previous) => {
                self.context.registry.unregister(&previous, self.local_id);
                info!(
                    "Live query {} moved from {} to {}",
                    self.local_id, previous, token
                );
            }
            None => info!("Live query {} established as {}", self.local_id, token),
        }
        self.context.registry.register(&token, self.local_id, &this);
    }

    fn is_registered(&self) -> bool {
        match self.server_id() {
            Some(server_id) => self.context.registry.contains(&server_id, self.local_id),
            None => false,
        }
    }

    async fn run_directive(&self, directive: Directive, epoch: u64) -> Result<bool> {
        let state = self.state();
        let Some(next) = state.after(directive) else {
            return Err(Error::InvalidState {
                operation: directive.name(),
                state,
            });
        };
        if !self.is_current(epoch) {
            return Ok(false);
        }

        let server_id = self.server_id();
        let outcome = match &server_id {
            Some(server_id) => self
                .context
                .engine
                .directive(directive.name(), server_id)
                .await
                .map_err(|e| (server_id.as_str(), e)),
            // Never established: nothing is tracked server-side
            None => Ok(()),
        };

        let _applying = self.applying.lock();
        if !self.is_current(epoch) {
            debug!(
                "Discarding stale {} of live query {}",
                directive.name(),
                self.local_id
            );
            return Ok(false);
        }

        let acknowledged = match outcome {
            Ok(()) => true,
            Err((server_id, e)) => {
                warn!(
                    "{} directive for {} failed: {}",
                    directive.name(),
                    server_id,
                    e
                );
                self.context.errors.emit(GraphQLError::from(&e));
                false
            }
        };

        if directive == Directive::Unsubscribe {
            if let Some(server_id) = &server_id {
                self.context.registry.unregister(server_id, self.local_id);
            }
            *self.state.lock() = SubscriptionState::Unsubscribed;
            debug!("Live query {} unsubscribed", self.local_id);
            return Ok(acknowledged);
        }

        if acknowledged {
            *self.state.lock() = next;
        }
        Ok(acknowledged)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("local_id", &self.local_id)
            .field("server_id", &self.server_id())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(chain) = self.chain.get_mut().take() {
            chain.worker.abort();
        }
        if let Some(server_id) = self.server_id.get_mut().take() {
            self.context.registry.unregister(&server_id, self.local_id);
            debug!("Dropped live query {} ({})", self.local_id, server_id);
        }
    }
}

async fn settle(submitted: Option<oneshot::Receiver<Result<bool>>>) -> Result<bool> {
    match submitted {
        // A dropped reply means the chain was reset underneath the operation
        Some(receiver) => receiver.await.unwrap_or(Ok(false)),
        None => Ok(false),
    }
}

async fn run_chain(this: Weak<Subscription>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let Some(subscription) = this.upgrade() else {
            break;
        };
        let holds_refetch_flag = job.command.holds_refetch_flag();
        let outcome = AssertUnwindSafe(subscription.execute(job.command, job.epoch))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                warn!(
                    "Operation of live query {} panicked",
                    subscription.local_id
                );
                if holds_refetch_flag {
                    subscription.release_refetch_flag(job.epoch);
                }
                Ok(false)
            });
        let _ = job.reply.send(outcome);
    }
}
