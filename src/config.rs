//! Client configuration
//!
//! [`LiveQueryConfig`] holds the knobs of the synchronization layer. It can be
//! built in code, or loaded from `LIVE_QUERY_*` environment variables:
//!
//! ```text
//! LIVE_QUERY_THROTTLE_MS=100
//! LIVE_QUERY_SUBSCRIBE_FIELD=subscribe
//! LIVE_QUERY_DATA_STRICT=true
//! ```

use crate::result::ResultOptions;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Environment variable prefix used by [`LiveQueryConfig::from_env`]
pub const ENV_PREFIX: &str = "LIVE_QUERY";

/// Configuration for the live query client
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LiveQueryConfig {
    /// Invalidation coalescing window in milliseconds
    #[validate(range(min = 1))]
    pub throttle_ms: u64,

    /// Top-level `data` field carrying the server subscription id
    #[validate(length(min = 1))]
    pub subscribe_field: String,

    /// Buffer size of the error broadcast channel
    #[validate(range(min = 1))]
    pub error_channel_capacity: usize,

    /// Default for [`ResultOptions::errors_emit`]
    pub errors_emit: bool,

    /// Default for [`ResultOptions::errors_pass`]
    pub errors_pass: bool,

    /// Default for [`ResultOptions::data_strict`]
    pub data_strict: bool,
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 250,
            subscribe_field: "subscribe".to_string(),
            error_channel_capacity: 100,
            errors_emit: true,
            errors_pass: true,
            data_strict: false,
        }
    }
}

impl LiveQueryConfig {
    /// Load configuration from `LIVE_QUERY_*` environment variables,
    /// falling back to defaults for anything unset
    pub fn from_env() -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validated()
    }

    /// Validate and return the configuration
    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    /// Coalescing window as a [`Duration`]
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    /// Result options every live query starts from
    pub fn default_result_options(&self) -> ResultOptions {
        ResultOptions {
            errors_emit: self.errors_emit,
            errors_pass: self.errors_pass,
            data_strict: self.data_strict,
            data_require: None,
        }
    }
}
