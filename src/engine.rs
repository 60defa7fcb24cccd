//! Execution engine seam
//!
//! The synchronization layer never talks to the network itself. It drives an
//! [`ExecutionEngine`], which executes operations and sends directives over
//! whatever connection the application maintains.

use crate::result::GraphQLError;
use crate::Result;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Directive pausing server-side change tracking for a subscription id
pub const PAUSE_DIRECTIVE: &str = "pause";

/// Directive resuming server-side change tracking
pub const RESUME_DIRECTIVE: &str = "resume";

/// Directive ending server-side change tracking
pub const UNSUBSCRIBE_DIRECTIVE: &str = "unsubscribe";

/// A live query operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveOperation {
    pub query: String,
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl LiveOperation {
    /// Create an anonymous operation
    pub fn new<S: Into<String>>(query: S) -> Self {
        Self {
            query: query.into(),
            operation_name: None,
        }
    }

    /// Create an operation with an `operationName`
    pub fn named<S: Into<String>, N: Into<String>>(query: S, operation_name: N) -> Self {
        Self {
            query: query.into(),
            operation_name: Some(operation_name.into()),
        }
    }
}

/// Response envelope as returned by the engine, before normalization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQLError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl RawResponse {
    /// Response carrying only `data`
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Remove the subscribe token from the top level of `data`.
    ///
    /// Only string tokens are recognised; any other value under the field is
    /// left in place.
    pub fn take_subscribe_token(&mut self, field: &str) -> Option<String> {
        let object = self.data.as_mut()?.as_object_mut()?;
        if !object.get(field)?.is_string() {
            return None;
        }
        match object.remove(field) {
            Some(Value::String(token)) if !token.is_empty() => Some(token),
            _ => None,
        }
    }
}

/// Executes operations and directives for live queries
#[async_trait::async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Execute an operation once
    async fn execute(&self, operation: &LiveOperation, variables: &Value) -> Result<RawResponse>;

    /// Establish a live query, yielding its successive results.
    ///
    /// Only the first item is consumed: it carries the subscribe token that
    /// registers the live query. The default performs a single [`execute`].
    ///
    /// [`execute`]: ExecutionEngine::execute
    async fn establish(
        &self,
        operation: &LiveOperation,
        variables: &Value,
    ) -> Result<BoxStream<'static, Result<RawResponse>>> {
        let first = self.execute(operation, variables).await;
        Ok(stream::once(async move { first }).boxed())
    }

    /// Send a directive for a server subscription id
    async fn directive(&self, name: &str, server_id: &str) -> Result<()>;
}
