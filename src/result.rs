//! Result normalization
//!
//! Every outcome of a live query round-trip, successful or not, is turned into
//! an [`ExecutionResult`] and run through a [`ResultProcessor`] before the
//! caller's handler sees it. The processor applies, in this order:
//!
//! 1. shape validation of `data` (violations become errors),
//! 2. emission of the first error on the [`ErrorChannel`],
//! 3. data strictness (`data` dropped when errors are present),
//! 4. error stripping,
//! 5. suppression of results that carry neither data nor errors.

use crate::engine::RawResponse;
use crate::{Error, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// `extensions.code` attached to errors produced by a failed round-trip
pub const EXECUTION_ERROR_CODE: &str = "EXECUTION_ERROR";

/// `extensions.code` attached to shape validation violations
pub const VALIDATION_ERROR_CODE: &str = "VALIDATION_ERROR";

/// A GraphQL error entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    /// Create an error with only a message
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    /// Create an error tagged with an `extensions.code`
    pub fn with_code<S: Into<String>>(message: S, code: &str) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: Some(serde_json::json!({ "code": code })),
        }
    }

    /// The `extensions.code` of this error, if any
    pub fn code(&self) -> Option<&str> {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(|code| code.as_str())
    }
}

impl From<&Error> for GraphQLError {
    fn from(error: &Error) -> Self {
        GraphQLError::with_code(error.to_string(), EXECUTION_ERROR_CODE)
    }
}

/// Canonical `{data, errors}` shape handed to result handlers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<GraphQLError>,
}

impl ExecutionResult {
    /// Normalize the outcome of an engine round-trip.
    ///
    /// A failed round-trip becomes a result with no data and a single
    /// execution error; `data: null` is treated as absent.
    pub fn from_outcome(outcome: Result<RawResponse>) -> Self {
        match outcome {
            Ok(response) => Self {
                data: response.data.filter(|data| !data.is_null()),
                errors: response.errors.unwrap_or_default(),
            },
            Err(error) => Self {
                data: None,
                errors: vec![GraphQLError::from(&error)],
            },
        }
    }

    /// Whether `data` is present
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Whether any error is present
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Checks the shape of result data, returning one message per violation
pub trait ShapeValidator: Send + Sync {
    fn validate(&self, data: &Value) -> Vec<String>;
}

impl<F> ShapeValidator for F
where
    F: Fn(&Value) -> Vec<String> + Send + Sync,
{
    fn validate(&self, data: &Value) -> Vec<String> {
        (self)(data)
    }
}

/// Shape validator backed by a JSON Schema document
pub struct JsonSchemaValidator {
    schema: jsonschema::JSONSchema,
}

impl JsonSchemaValidator {
    /// Compile a schema. A malformed schema is a configuration error.
    pub fn new(schema: &Value) -> Result<Self> {
        let compiled = jsonschema::JSONSchema::compile(schema).map_err(|e| {
            Error::Configuration {
                message: format!("Invalid result schema: {}", e),
            }
        })?;
        Ok(Self { schema: compiled })
    }
}

impl ShapeValidator for JsonSchemaValidator {
    fn validate(&self, data: &Value) -> Vec<String> {
        match self.schema.validate(data) {
            Ok(()) => Vec::new(),
            Err(violations) => violations
                .map(|violation| format!("{} at '{}'", violation, violation.instance_path))
                .collect(),
        }
    }
}

/// Per-live-query result policy
#[derive(Clone)]
pub struct ResultOptions {
    /// Publish the first error of a result on the error channel
    pub errors_emit: bool,
    /// Keep errors in the delivered result
    pub errors_pass: bool,
    /// Drop data whenever errors are present
    pub data_strict: bool,
    /// Optional shape check on `data`
    pub data_require: Option<Arc<dyn ShapeValidator>>,
}

impl Default for ResultOptions {
    fn default() -> Self {
        Self {
            errors_emit: true,
            errors_pass: true,
            data_strict: false,
            data_require: None,
        }
    }
}

impl fmt::Debug for ResultOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultOptions")
            .field("errors_emit", &self.errors_emit)
            .field("errors_pass", &self.errors_pass)
            .field("data_strict", &self.data_strict)
            .field("data_require", &self.data_require.is_some())
            .finish()
    }
}

impl ResultOptions {
    /// Publish the first error on the error channel
    pub fn errors_emit(mut self, enabled: bool) -> Self {
        self.errors_emit = enabled;
        self
    }

    /// Keep errors in delivered results
    pub fn errors_pass(mut self, enabled: bool) -> Self {
        self.errors_pass = enabled;
        self
    }

    /// Drop data when errors are present
    pub fn data_strict(mut self, enabled: bool) -> Self {
        self.data_strict = enabled;
        self
    }

    /// Check data with `validator` before delivery
    pub fn data_require<V: ShapeValidator + 'static>(mut self, validator: V) -> Self {
        self.data_require = Some(Arc::new(validator));
        self
    }
}

static GLOBAL_ERRORS: Lazy<ErrorChannel> = Lazy::new(|| ErrorChannel::new(100));

/// Broadcast bus for errors surfaced by live queries
#[derive(Debug, Clone)]
pub struct ErrorChannel {
    sender: broadcast::Sender<GraphQLError>,
}

impl ErrorChannel {
    /// Create a new channel buffering up to `capacity` errors per receiver
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// The process-wide channel
    pub fn global() -> Self {
        GLOBAL_ERRORS.clone()
    }

    /// Publish an error to all current receivers
    pub fn emit(&self, error: GraphQLError) {
        // No receivers is not an error
        let _ = self.sender.send(error);
    }

    /// Receive every error published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<GraphQLError> {
        self.sender.subscribe()
    }
}

/// Receives the normalized results of a live query
pub trait ResultHandler: Send + Sync {
    fn on_result(&self, result: ExecutionResult);
}

impl<F> ResultHandler for F
where
    F: Fn(ExecutionResult) + Send + Sync,
{
    fn on_result(&self, result: ExecutionResult) {
        (self)(result)
    }
}

/// Applies [`ResultOptions`] to normalized results
#[derive(Debug, Clone)]
pub struct ResultProcessor {
    options: ResultOptions,
    errors: ErrorChannel,
}

impl ResultProcessor {
    /// Create a processor publishing on `errors`
    pub fn new(options: ResultOptions, errors: ErrorChannel) -> Self {
        Self { options, errors }
    }

    /// Options this processor applies
    pub fn options(&self) -> &ResultOptions {
        &self.options
    }

    /// Process a result. `None` means there is nothing to deliver.
    pub fn process(&self, mut result: ExecutionResult) -> Option<ExecutionResult> {
        if let (Some(validator), Some(data)) = (&self.options.data_require, &result.data) {
            let violations = validator.validate(data);
            result.errors.extend(
                violations
                    .into_iter()
                    .map(|message| GraphQLError::with_code(message, VALIDATION_ERROR_CODE)),
            );
        }

        if self.options.errors_emit {
            if let Some(first) = result.errors.first() {
                self.errors.emit(first.clone());
            }
        }

        if self.options.data_strict && result.has_errors() {
            result.data = None;
        }

        if !self.options.errors_pass {
            result.errors.clear();
        }

        if result.has_data() || result.has_errors() {
            Some(result)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn processor(options: ResultOptions) -> (ResultProcessor, broadcast::Receiver<GraphQLError>) {
        let channel = ErrorChannel::new(8);
        let receiver = channel.subscribe();
        (ResultProcessor::new(options, channel), receiver)
    }

    fn raw(data: Value, errors: Vec<GraphQLError>) -> ExecutionResult {
        ExecutionResult::from_outcome(Ok(RawResponse {
            data: Some(data),
            errors: Some(errors),
            extensions: None,
        }))
    }

    #[test]
    fn test_strict_data_dropped_when_errors_present() {
        let (processor, _rx) = processor(ResultOptions::default().data_strict(true));
        let error = GraphQLError::new("boom");

        let delivered = processor
            .process(raw(json!({"x": 1}), vec![error.clone()]))
            .unwrap();

        assert_eq!(delivered.data, None);
        assert_eq!(delivered.errors, vec![error]);
    }

    #[test]
    fn test_strict_without_passing_errors_suppresses_everything() {
        let (processor, mut rx) = processor(
            ResultOptions::default()
                .data_strict(true)
                .errors_pass(false),
        );

        let delivered = processor.process(raw(json!({"x": 1}), vec![GraphQLError::new("boom")]));

        assert!(delivered.is_none());
        // Still emitted before being stripped
        assert_eq!(rx.try_recv().unwrap().message, "boom");
    }

    #[test]
    fn test_errors_stripped_but_data_kept() {
        let (processor, _rx) = processor(ResultOptions::default().errors_pass(false));
        let delivered = processor
            .process(raw(json!({"x": 1}), vec![GraphQLError::new("partial")]))
            .unwrap();
        assert_eq!(delivered.data, Some(json!({"x": 1})));
        assert!(delivered.errors.is_empty());
    }

    #[test]
    fn test_empty_result_suppressed() {
        let (processor, _rx) = processor(ResultOptions::default());
        assert!(processor.process(raw(Value::Null, vec![])).is_none());

        let absent = ExecutionResult::from_outcome(Ok(RawResponse::default()));
        assert!(processor.process(absent).is_none());
    }

    #[test]
    fn test_only_first_error_emitted() {
        let (processor, mut rx) = processor(ResultOptions::default());
        processor.process(raw(
            json!({}),
            vec![GraphQLError::new("first"), GraphQLError::new("second")],
        ));

        assert_eq!(rx.try_recv().unwrap().message, "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emission_disabled() {
        let (processor, mut rx) = processor(ResultOptions::default().errors_emit(false));
        let delivered = processor
            .process(raw(json!({}), vec![GraphQLError::new("quiet")]))
            .unwrap();
        assert_eq!(delivered.errors.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_execution_failure_becomes_error_result() {
        let (processor, _rx) = processor(ResultOptions::default());
        let outcome = Err(Error::Network {
            message: "connection reset".to_string(),
        });

        let delivered = processor
            .process(ExecutionResult::from_outcome(outcome))
            .unwrap();

        assert!(delivered.data.is_none());
        assert_eq!(delivered.errors[0].code(), Some(EXECUTION_ERROR_CODE));
        assert!(delivered.errors[0].message.contains("connection reset"));
    }

    #[test]
    fn test_validation_violations_appended() {
        let options = ResultOptions::default().data_require(|data: &Value| {
            if data.get("todos").is_some() {
                Vec::new()
            } else {
                vec!["missing todos".to_string()]
            }
        });
        let (processor, _rx) = processor(options);

        let delivered = processor.process(raw(json!({"other": 1}), vec![])).unwrap();
        assert_eq!(delivered.errors.len(), 1);
        assert_eq!(delivered.errors[0].code(), Some(VALIDATION_ERROR_CODE));
        assert_eq!(delivered.data, Some(json!({"other": 1})));

        let clean = processor.process(raw(json!({"todos": []}), vec![])).unwrap();
        assert!(clean.errors.is_empty());
    }

    #[test]
    fn test_validation_failure_with_strict_data() {
        let options = ResultOptions::default()
            .data_strict(true)
            .data_require(|_: &Value| vec!["never valid".to_string()]);
        let (processor, _rx) = processor(options);

        let delivered = processor.process(raw(json!({"x": 1}), vec![])).unwrap();
        assert!(delivered.data.is_none());
        assert_eq!(delivered.errors[0].message, "never valid");
    }

    #[test]
    fn test_json_schema_validator() {
        let validator = JsonSchemaValidator::new(&json!({
            "type": "object",
            "required": ["todos"],
            "properties": { "todos": { "type": "array" } }
        }))
        .unwrap();

        assert!(validator.validate(&json!({"todos": []})).is_empty());
        assert_eq!(validator.validate(&json!({"todos": 3})).len(), 1);
        assert!(!validator.validate(&json!({})).is_empty());
    }

    #[test]
    fn test_malformed_schema_rejected() {
        let result = JsonSchemaValidator::new(&json!({"type": 12}));
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_graphql_error_deserialization() {
        let error: GraphQLError = serde_json::from_str(
            r#"{"message": "denied", "path": ["todos", 0], "extensions": {"code": "FORBIDDEN"}}"#,
        )
        .unwrap();
        assert_eq!(error.message, "denied");
        assert_eq!(error.code(), Some("FORBIDDEN"));
        assert_eq!(error.path.unwrap().len(), 2);
    }
}
