//! GraphQL over HTTP execution engine
//!
//! [`HttpExecutor`] implements [`ExecutionEngine`] with plain POST requests.
//! Operations are sent as `{query, variables, operationName}`; directives are
//! sent as a mutation named after the directive taking the server
//! subscription id:
//!
//! ```graphql
//! mutation pause($serverId: String!) { pause(serverId: $serverId) }
//! ```

use crate::engine::{ExecutionEngine, LiveOperation, RawResponse};
use crate::{Error, Result};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::Client as HttpClient;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Default GraphQL endpoint
pub const DEFAULT_ENDPOINT: &str = "http://localhost:4000/graphql";

/// Configuration for the HTTP execution engine
#[derive(Debug, Clone)]
pub struct HttpExecutorConfig {
    pub endpoint: Url,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub user_agent: String,
    pub headers: HashMap<String, String>,
}

impl HttpExecutorConfig {
    /// Configuration with default timeout and user agent for `endpoint`
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            api_key: None,
            timeout_ms: 30000,
            user_agent: format!("live-query-sync/{}", crate::VERSION),
            headers: HashMap::new(),
        }
    }
}

#[derive(Serialize)]
struct GraphQLRequest<'a> {
    query: &'a str,
    variables: &'a Value,
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    operation_name: Option<&'a str>,
}

/// Execution engine speaking GraphQL over HTTP
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    config: HttpExecutorConfig,
    http_client: HttpClient,
}

fn configuration_error(what: &str, error: impl std::fmt::Display) -> Error {
    Error::Configuration {
        message: format!("Invalid {}: {}", what, error),
    }
}

/// Headers sent with every request: user agent, bearer token and the
/// caller's extra headers, validated up front
fn default_headers(config: &HttpExecutorConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let user_agent = HeaderValue::from_str(&config.user_agent)
        .map_err(|e| configuration_error("user agent", e))?;
    headers.insert(header::USER_AGENT, user_agent);

    if let Some(api_key) = &config.api_key {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| configuration_error("API key", e))?;
        headers.insert(header::AUTHORIZATION, bearer);
    }

    for (key, value) in &config.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| configuration_error(&format!("header name '{}'", key), e))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| configuration_error(&format!("header value for '{}'", key), e))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

impl HttpExecutor {
    /// Create an executor with the given configuration
    pub fn new(config: HttpExecutorConfig) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(default_headers(&config)?)
            .build()
            .map_err(|e| Error::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Create a new executor builder
    pub fn builder() -> HttpExecutorBuilder {
        HttpExecutorBuilder::new()
    }

    /// The GraphQL endpoint requests are sent to
    pub fn endpoint(&self) -> &Url {
        &self.config.endpoint
    }

    async fn post(&self, request: &GraphQLRequest<'_>) -> Result<RawResponse> {
        let response = self
            .http_client
            .post(self.config.endpoint.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Network {
                        message: format!(
                            "GraphQL request timed out after {}ms",
                            self.config.timeout_ms
                        ),
                    }
                } else {
                    Error::from(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::Server {
                status: response.status().as_u16(),
                message: format!("GraphQL server error: {}", response.status()),
            });
        }

        response.json().await.map_err(|e| Error::Parse {
            message: format!("Failed to parse GraphQL response: {}", e),
        })
    }
}

#[async_trait::async_trait]
impl ExecutionEngine for HttpExecutor {
    async fn execute(&self, operation: &LiveOperation, variables: &Value) -> Result<RawResponse> {
        self.post(&GraphQLRequest {
            query: &operation.query,
            variables,
            operation_name: operation.operation_name.as_deref(),
        })
        .await
    }

    async fn directive(&self, name: &str, server_id: &str) -> Result<()> {
        let query = format!(
            "mutation {name}($serverId: String!) {{ {name}(serverId: $serverId) }}",
            name = name
        );
        let variables = serde_json::json!({ "serverId": server_id });

        let response = self
            .post(&GraphQLRequest {
                query: &query,
                variables: &variables,
                operation_name: Some(name),
            })
            .await?;

        match response.errors.as_deref() {
            Some([first, ..]) => Err(Error::Execution {
                message: format!("{} directive rejected: {}", name, first.message),
            }),
            _ => {
                debug!("{} directive acknowledged for {}", name, server_id);
                Ok(())
            }
        }
    }
}

/// Builder for [`HttpExecutor`]
pub struct HttpExecutorBuilder {
    endpoint: Option<Url>,
    api_key: Option<String>,
    timeout_ms: Option<u64>,
    headers: HashMap<String, String>,
}

impl HttpExecutorBuilder {
    /// Create a builder with no endpoint, key or headers set
    pub fn new() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_ms: None,
            headers: HashMap::new(),
        }
    }

    /// Set the GraphQL endpoint
    pub fn endpoint(mut self, endpoint: &str) -> Result<Self> {
        self.endpoint = Some(Url::parse(endpoint)?);
        Ok(self)
    }

    /// Set the bearer token
    pub fn api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Add a custom header
    pub fn header(mut self, key: String, value: String) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Build the executor, defaulting the endpoint to [`DEFAULT_ENDPOINT`]
    pub fn build(self) -> Result<HttpExecutor> {
        let endpoint = match self.endpoint {
            Some(endpoint) => endpoint,
            None => Url::parse(DEFAULT_ENDPOINT)?,
        };
        let mut config = HttpExecutorConfig::new(endpoint);
        config.api_key = self.api_key;
        config.headers = self.headers;
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        HttpExecutor::new(config)
    }
}

impl Default for HttpExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
