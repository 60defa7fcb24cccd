//! Live query client
//!
//! [`LiveQueryClient`] wires the pieces together: it opens live queries
//! against an [`ExecutionEngine`], routes transport events to the coalescer
//! and the lifecycle handler, and hands out [`LiveQuery`] handles.

use crate::coalescer::{NotificationCoalescer, RegistryDispatch};
use crate::config::LiveQueryConfig;
use crate::engine::{ExecutionEngine, LiveOperation};
use crate::lifecycle::ConnectionLifecycleHandler;
use crate::metrics::SyncMetrics;
use crate::registry::SubscriptionRegistry;
use crate::result::{ErrorChannel, ResultHandler, ResultOptions, ResultProcessor};
use crate::subscription::{LocalId, Subscription, SubscriptionState, SyncContext};
use crate::transport::{InboundMessage, TransportEvent};
use crate::{Error, Result};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point for opening and synchronizing live queries
pub struct LiveQueryClient {
    context: Arc<SyncContext>,
    coalescer: Arc<NotificationCoalescer>,
    lifecycle: ConnectionLifecycleHandler,
    config: LiveQueryConfig,
}

impl LiveQueryClient {
    /// Create a new client builder
    pub fn builder() -> LiveQueryClientBuilder {
        LiveQueryClientBuilder::new()
    }

    /// Create a client with default configuration
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Result<Self> {
        Self::builder().engine(engine).build()
    }

    /// Execute `operation` once and keep it in sync until unsubscribed or
    /// dropped. The handler receives every delivered result, starting with
    /// the initial one.
    pub async fn open<H>(
        &self,
        operation: LiveOperation,
        variables: Value,
        handler: H,
    ) -> Result<LiveQuery>
    where
        H: ResultHandler + 'static,
    {
        self.live_query(operation)
            .variables(variables)
            .open(handler)
            .await
    }

    /// Start building a live query with per-query options
    pub fn live_query(&self, operation: LiveOperation) -> LiveQueryBuilder<'_> {
        LiveQueryBuilder {
            client: self,
            operation,
            variables: Value::Object(Default::default()),
            options: None,
        }
    }

    /// React to one transport event. Must be called inside a Tokio runtime.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                self.lifecycle.on_open();
            }
            TransportEvent::Close => self.lifecycle.on_close(),
            TransportEvent::Receive(InboundMessage::Invalidate { ids }) => {
                SyncMetrics::incr(&self.context.metrics.notifications_received);
                debug!("Received invalidation for {} ids", ids.len());
                self.coalescer.push(ids);
            }
            TransportEvent::Receive(InboundMessage::Unknown) => {
                debug!("Ignoring unrecognized inbound message");
            }
        }
    }

    /// Drive the client from a stream of transport events until it ends
    pub async fn run<S>(&self, events: S)
    where
        S: Stream<Item = TransportEvent>,
    {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            self.handle_event(event);
        }
        debug!("Transport event stream ended");
    }

    /// Dispatch pending invalidations without waiting for the window to close
    pub fn flush(&self) {
        self.coalescer.flush();
    }

    /// Registry of every established live query
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.context.registry
    }

    /// Synchronization counters
    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.context.metrics
    }

    /// Channel errors of this client are published on
    pub fn errors(&self) -> &ErrorChannel {
        &self.context.errors
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &LiveQueryConfig {
        &self.config
    }
}

/// Builder for [`LiveQueryClient`]
pub struct LiveQueryClientBuilder {
    engine: Option<Arc<dyn ExecutionEngine>>,
    config: Option<LiveQueryConfig>,
    errors: Option<ErrorChannel>,
    isolated_errors: bool,
}

impl LiveQueryClientBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self {
            engine: None,
            config: None,
            errors: None,
            isolated_errors: false,
        }
    }

    /// Set the execution engine
    pub fn engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the configuration
    pub fn config(mut self, config: LiveQueryConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Publish errors on the given channel instead of the global one
    pub fn error_channel(mut self, errors: ErrorChannel) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Publish errors on a channel owned by this client, sized by
    /// `error_channel_capacity`
    pub fn isolated_errors(mut self) -> Self {
        self.isolated_errors = true;
        self
    }

    /// Validate the configuration and build the client
    pub fn build(self) -> Result<LiveQueryClient> {
        let engine = self.engine.ok_or_else(|| Error::Configuration {
            message: "An execution engine is required".to_string(),
        })?;
        let config = self.config.unwrap_or_default().validated()?;

        let errors = match self.errors {
            Some(errors) => errors,
            None if self.isolated_errors => ErrorChannel::new(config.error_channel_capacity),
            None => ErrorChannel::global(),
        };

        let registry = Arc::new(SubscriptionRegistry::new());
        let metrics = Arc::new(SyncMetrics::new());
        let context = Arc::new(SyncContext {
            engine,
            registry: registry.clone(),
            errors,
            subscribe_field: config.subscribe_field.clone(),
            metrics: metrics.clone(),
        });

        let sink = Arc::new(RegistryDispatch::new(registry.clone(), metrics.clone()));
        let coalescer = NotificationCoalescer::new(config.throttle(), sink);
        let lifecycle = ConnectionLifecycleHandler::new(registry, metrics);

        info!(
            "Live query client ready (throttle {}ms, subscribe field '{}')",
            config.throttle_ms, config.subscribe_field
        );

        Ok(LiveQueryClient {
            context,
            coalescer,
            lifecycle,
            config,
        })
    }
}

impl Default for LiveQueryClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a single live query
pub struct LiveQueryBuilder<'a> {
    client: &'a LiveQueryClient,
    operation: LiveOperation,
    variables: Value,
    options: Option<ResultOptions>,
}

impl<'a> LiveQueryBuilder<'a> {
    /// Set the initial variables
    pub fn variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    /// Override the client's default result options
    pub fn options(mut self, options: ResultOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Run the initial fetch and return the handle
    pub async fn open<H>(self, handler: H) -> Result<LiveQuery>
    where
        H: ResultHandler + 'static,
    {
        let client = self.client;
        let options = self
            .options
            .unwrap_or_else(|| client.config.default_result_options());
        let processor = ResultProcessor::new(options, client.context.errors.clone());

        let subscription = Subscription::spawn(
            client.context.clone(),
            self.operation,
            self.variables,
            processor,
            Arc::new(handler),
        );
        subscription.establish().await?;

        Ok(LiveQuery { subscription })
    }
}

/// Handle to an open live query.
///
/// Dropping the last handle stops synchronization locally without sending
/// an unsubscribe directive.
#[derive(Debug, Clone)]
pub struct LiveQuery {
    subscription: Arc<Subscription>,
}

impl LiveQuery {
    /// Process-unique id of the live query
    pub fn local_id(&self) -> LocalId {
        self.subscription.local_id()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    /// Server subscription id, once established
    pub fn server_id(&self) -> Option<String> {
        self.subscription.server_id()
    }

    /// Variables used by the next refetch
    pub fn variables(&self) -> Value {
        self.subscription.variables()
    }

    /// Replace the variables; takes effect on the next refetch
    pub fn set_variables(&self, variables: Value) {
        self.subscription.set_variables(variables);
    }

    /// Refetch if subscribed, coalescing with any pending refetch
    pub fn refetch(&self) -> impl Future<Output = Result<bool>> + Send + 'static {
        self.subscription.refetch(false)
    }

    /// Refetch regardless of state or pending refetches, unless unsubscribed
    pub fn force_refetch(&self) -> impl Future<Output = Result<bool>> + Send + 'static {
        self.subscription.refetch(true)
    }

    /// Ask the server to stop tracking changes
    pub fn pause(&self) -> impl Future<Output = Result<bool>> + Send + 'static {
        self.subscription.pause()
    }

    /// Ask the server to track changes again
    pub fn resume(&self) -> impl Future<Output = Result<bool>> + Send + 'static {
        self.subscription.resume()
    }

    /// Stop the live query for good
    pub fn unsubscribe(&self) -> impl Future<Output = Result<bool>> + Send + 'static {
        self.subscription.unsubscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockEngine, Recorder};
    use serde_json::json;

    #[test]
    fn test_builder_requires_engine() {
        let result = LiveQueryClient::builder().build();
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let result = LiveQueryClient::builder()
            .engine(Arc::new(MockEngine::with_server_id("sub-1")))
            .config(LiveQueryConfig {
                throttle_ms: 0,
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_open_delivers_initial_result() {
        let client = LiveQueryClient::builder()
            .engine(Arc::new(MockEngine::with_server_id("sub-1")))
            .isolated_errors()
            .build()
            .unwrap();
        let recorder = Recorder::default();

        let live = client
            .open(
                LiveOperation::new("query Todos { todos { id } }"),
                json!({}),
                recorder.clone(),
            )
            .await
            .unwrap();

        assert_eq!(live.state(), SubscriptionState::Subscribed);
        assert_eq!(live.server_id().as_deref(), Some("sub-1"));
        assert_eq!(recorder.len(), 1);
        assert!(client.registry().contains("sub-1", live.local_id()));
    }

    #[tokio::test]
    async fn test_custom_subscribe_field() {
        let engine = Arc::new(MockEngine::without_server_id());
        engine.push_response(Ok(crate::engine::RawResponse::data(
            json!({"liveId": "sub-4", "todos": []}),
        )));
        let client = LiveQueryClient::builder()
            .engine(engine)
            .config(LiveQueryConfig {
                subscribe_field: "liveId".to_string(),
                ..Default::default()
            })
            .isolated_errors()
            .build()
            .unwrap();
        let recorder = Recorder::default();

        let live = client
            .live_query(LiveOperation::new("{ todos { id } }"))
            .open(recorder.clone())
            .await
            .unwrap();

        assert_eq!(live.server_id().as_deref(), Some("sub-4"));
        assert_eq!(recorder.results()[0].data, Some(json!({"todos": []})));
    }

    #[tokio::test]
    async fn test_dropping_handle_unregisters() {
        let client = LiveQueryClient::builder()
            .engine(Arc::new(MockEngine::with_server_id("sub-1")))
            .isolated_errors()
            .build()
            .unwrap();

        let live = client
            .open(LiveOperation::new("{ a }"), json!({}), Recorder::default())
            .await
            .unwrap();
        assert_eq!(client.registry().len(), 1);

        drop(live);
        assert!(client.registry().is_empty());
    }
}
