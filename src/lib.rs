//! Live Query Synchronization
//!
//! A client library that keeps GraphQL live queries in sync with the server.
//! A live query is executed once, registered under the subscription id the
//! server hands back, and re-executed whenever the server reports that the
//! data behind it changed. Invalidations are coalesced per throttle window,
//! every live query runs its lifecycle operations strictly in order, and all
//! live queries are refetched after the connection comes back.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use live_query_sync::{HttpExecutor, LiveOperation, LiveQueryClient, TransportEvent};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> live_query_sync::Result<()> {
//!     let executor = HttpExecutor::builder()
//!         .endpoint("http://localhost:4000/graphql")?
//!         .build()?;
//!
//!     let client = LiveQueryClient::builder()
//!         .engine(Arc::new(executor))
//!         .build()?;
//!
//!     let live = client
//!         .open(
//!             LiveOperation::new("query Todos { todos { id title } }"),
//!             serde_json::json!({}),
//!             |result: live_query_sync::ExecutionResult| println!("{:?}", result.data),
//!         )
//!         .await?;
//!
//!     // Feed transport events from your connection into the client
//!     client.handle_event(TransportEvent::Open);
//!
//!     live.pause().await?;
//!     live.resume().await?;
//!     live.unsubscribe().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod coalescer;
pub mod config;
pub mod engine;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod registry;
pub mod result;
pub mod subscription;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;


pub use client::{LiveQuery, LiveQueryBuilder, LiveQueryClient, LiveQueryClientBuilder};
pub use coalescer::{NotificationBatch, NotificationCoalescer, NotificationSink};
pub use config::LiveQueryConfig;
pub use engine::{ExecutionEngine, LiveOperation, RawResponse};
pub use http::{HttpExecutor, HttpExecutorBuilder, HttpExecutorConfig};
pub use lifecycle::ConnectionLifecycleHandler;
pub use metrics::SyncMetrics;
pub use registry::SubscriptionRegistry;
pub use result::{
    ErrorChannel, ExecutionResult, GraphQLError, JsonSchemaValidator, ResultHandler,
    ResultOptions, ResultProcessor, ShapeValidator,
};
pub use subscription::{LocalId, Subscription, SubscriptionState};
pub use transport::{InboundMessage, TransportEvent};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Parse error: {message}")]
    Parse { message: String },

    /// A lifecycle operation was attempted from a state that does not allow it.
    #[error("Cannot {operation} a live query that is {state}")]
    InvalidState {
        operation: &'static str,
        state: SubscriptionState,
    },

    #[error("Execution error: {message}")]
    Execution { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },
}

impl Error {
    /// Whether this error rejects an operation instead of being folded into a result
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() {
            Error::Network {
                message: format!("Connection failed: {}", error),
            }
        } else {
            Error::Network {
                message: error.to_string(),
            }
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Self {
        Error::Configuration {
            message: format!("Invalid URL: {}", error),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Parse {
            message: format!("JSON parse error: {}", error),
        }
    }
}

impl From<::config::ConfigError> for Error {
    fn from(error: ::config::ConfigError) -> Self {
        Error::Configuration {
            message: error.to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(error: validator::ValidationErrors) -> Self {
        Error::Configuration {
            message: error.to_string(),
        }
    }
}
