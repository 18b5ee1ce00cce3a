//! Layered runtime configuration.
//!
//! Sources are merged in order, later sources overriding earlier ones:
//!
//!  1. Built-in defaults on every settings struct
//!  2. `./config/bus-runtime.yaml` if present
//!  3. An explicit file passed by the host, which must exist
//!  4. Environment variables prefixed `BUS__` with `__` between levels,
//!     e.g. `BUS__OUTBOX__POLL_BATCH_SIZE=100`
//!
//! Durations are expressed in milliseconds (`timeout_ms`, `sweep_interval_ms`, ...).

use crate::bus::MessageBusBuilder;
use crate::error::{BusError, ConfigurationError};
use crate::outbox::OutboxSettings;
use crate::settings::{PendingRequestSettings, RequestResponseSettings};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Default configuration file, relative to the working directory, without extension
pub const DEFAULT_CONFIG_FILE: &str = "config/bus-runtime";

/// Prefix of environment variables overriding file settings
pub const ENV_PREFIX: &str = "BUS";

/// Settings for the runtime as a whole
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Present when buses built from this configuration accept `send`
    pub request_response: Option<RequestResponseSettings>,
    pub pending_requests: PendingRequestSettings,
    pub outbox: OutboxSettings,
}

impl RuntimeConfig {
    /// Load from the default file, an optional explicit file and the environment
    pub fn load(explicit_path: Option<&str>) -> Result<Self, BusError> {
        let mut builder = config::Config::builder().add_source(
            config::File::with_name(DEFAULT_CONFIG_FILE)
                .required(false)
                .format(config::FileFormat::Yaml),
        );

        if let Some(path) = explicit_path.filter(|path| !path.is_empty()) {
            info!(path = %path, "Loading configuration from explicit path");
            builder = builder.add_source(
                config::File::with_name(path)
                    .required(true)
                    .format(config::FileFormat::Yaml),
            );
        }

        Self::from_builder(builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        ))
    }

    /// Parse a YAML document on top of the built-in defaults
    pub fn from_yaml(document: &str) -> Result<Self, BusError> {
        Self::from_builder(
            config::Config::builder()
                .add_source(config::File::from_str(document, config::FileFormat::Yaml)),
        )
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, BusError> {
        let config: Self = builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if let Some(request_response) = &self.request_response {
            request_response.validate()?;
        }
        self.pending_requests.validate()?;
        self.outbox.validate()
    }

    /// Apply the bus-level sections to a bus builder
    pub fn configure(&self, builder: MessageBusBuilder) -> MessageBusBuilder {
        let builder = builder.pending_requests(self.pending_requests.clone());
        match &self.request_response {
            Some(settings) => builder.request_response(settings.clone()),
            None => builder,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
