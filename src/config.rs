// Copyright 2020 Joyent, Inc.

use std::io::{Error, ErrorKind};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;

/// Tunables for an [`Engine`](crate::Engine).
///
/// Every field has a default, so a JSON document only needs to name the
/// values it overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastRpcConfig {
    /// How long an inbound Query waits for room in the worker queue
    /// before it is answered as dropped.
    pub queue_push_timeout_ms: u64,
    /// Largest encoded JSON payload accepted or sent, in bytes.
    pub max_message_size: u32,
    /// How long `call` waits for an Answer.
    pub remote_execution_timeout_ms: u64,
    /// Extra attempts `call` makes to find a connection that is not
    /// (yet) registered.
    pub remote_execution_disconnected_tries: u32,
    pub disconnected_retry_interval_ms: u64,
    pub ping_interval_secs: u64,
    /// Read and write timeout on the underlying stream.
    pub socket_timeout_secs: u64,
    /// Queries executed concurrently.
    pub workers: usize,
    /// Queries accepted beyond `workers` while every worker is busy.
    pub queue_capacity: usize,
    /// Cap on queued plus running Queries from a single connection.
    pub max_queued_per_key: Option<usize>,
    /// Answer oversized results with `ExecutionStatus::Oversized`
    /// instead of an empty successful payload. Both peers must agree.
    pub report_oversized_answers: bool,
}

impl Default for FastRpcConfig {
    fn default() -> Self {
        FastRpcConfig {
            queue_push_timeout_ms: 2000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            remote_execution_timeout_ms: 5000,
            remote_execution_disconnected_tries: 10,
            disconnected_retry_interval_ms: 1000,
            ping_interval_secs: 20,
            socket_timeout_secs: 40,
            workers: 8,
            queue_capacity: 1024,
            max_queued_per_key: None,
            report_oversized_answers: false,
        }
    }
}

impl FastRpcConfig {
    /// Parses a JSON object naming the fields to override.
    pub fn from_json(s: &str) -> Result<FastRpcConfig, Error> {
        let parse_error = |e: serde_json::Error| {
            let msg = format!("failed to parse configuration: {}", e);
            Error::new(ErrorKind::InvalidInput, msg)
        };
        // serde would also fill the struct positionally from an array.
        let value: Value = serde_json::from_str(s).map_err(parse_error)?;
        if !value.is_object() {
            let msg = "configuration must be a JSON object";
            return Err(Error::new(ErrorKind::InvalidInput, msg));
        }
        let config: FastRpcConfig =
            serde_json::from_value(value).map_err(parse_error)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let problem = if self.workers == 0 {
            Some("workers must be at least 1")
        } else if self.ping_interval_secs == 0 {
            Some("ping_interval_secs must be at least 1")
        } else if self.socket_timeout_secs == 0 {
            Some("socket_timeout_secs must be at least 1")
        } else if self.max_message_size == 0 {
            Some("max_message_size must be at least 1")
        } else {
            None
        };

        match problem {
            Some(msg) => Err(Error::new(ErrorKind::InvalidInput, msg)),
            None => Ok(()),
        }
    }

    pub fn queue_push_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_push_timeout_ms)
    }

    pub fn remote_execution_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_execution_timeout_ms)
    }

    pub fn disconnected_retry_interval(&self) -> Duration {
        Duration::from_millis(self.disconnected_retry_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }
}
