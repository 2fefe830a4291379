// Copyright 2020 Joyent, Inc.

//! Outbound side: calling a method on a connected peer and waiting for its
//! Answer.

use std::fmt;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde_json::Value;
use slog::{debug, warn};

use crate::connection::{Answer, Connection, WaitOutcome};
use crate::engine::Engine;
use crate::protocol::{encode_payload, ExecutionStatus, FastFrame, MAX_METHOD_NAME_LEN};
use crate::table::OpenElement;

/// Why a `call` did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum CallErrorCode {
    Success = 0,
    /// Rejected locally before any I/O.
    PayloadTooLarge = 1,
    /// No connection with the requested key appeared in time.
    NotConnected = 2,
    /// No Answer arrived before the deadline.
    TimedOut = 3,
    /// The peer's worker queue was full.
    RemoteQueueFull = 4,
    MethodNotFound = 5,
    /// The connection went away while waiting for the Answer.
    ConnectionClosed = 6,
    /// The peer's result exceeded its maximum message size.
    AnswerTooLarge = 7,
    Unknown = 99,
}

impl CallErrorCode {
    pub fn code(self) -> i32 {
        ToPrimitive::to_i32(&self).unwrap_or(99)
    }

    pub fn from_code(code: i32) -> CallErrorCode {
        FromPrimitive::from_i32(code).unwrap_or(CallErrorCode::Unknown)
    }
}

impl fmt::Display for CallErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self {
            CallErrorCode::Success => "success",
            CallErrorCode::PayloadTooLarge => "request too large",
            CallErrorCode::NotConnected => "remote peer not connected",
            CallErrorCode::TimedOut => "no answer before the deadline",
            CallErrorCode::RemoteQueueFull => "remote worker queue full",
            CallErrorCode::MethodNotFound => "remote method not found",
            CallErrorCode::ConnectionClosed => "connection closed while waiting for the answer",
            CallErrorCode::AnswerTooLarge => "remote answer too large",
            CallErrorCode::Unknown => "unknown failure",
        };
        write!(f, "{}", desc)
    }
}

/// Outcome of [`Engine::call`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub payload: Value,
    pub succeeded: bool,
    pub error_code: CallErrorCode,
    pub error_message: String,
}

impl CallResult {
    pub fn success(payload: Value) -> CallResult {
        CallResult {
            payload,
            succeeded: true,
            error_code: CallErrorCode::Success,
            error_message: String::new(),
        }
    }

    pub fn failure(error_code: CallErrorCode, error_message: String) -> CallResult {
        CallResult {
            payload: Value::Null,
            succeeded: false,
            error_code,
            error_message,
        }
    }

    fn from_answer(answer: Answer) -> CallResult {
        match ExecutionStatus::from_byte(answer.status) {
            Some(ExecutionStatus::Executed) => CallResult::success(answer.payload),
            Some(ExecutionStatus::Dropped) => CallResult::failure(
                CallErrorCode::RemoteQueueFull,
                CallErrorCode::RemoteQueueFull.to_string(),
            ),
            Some(ExecutionStatus::NotFound) => CallResult::failure(
                CallErrorCode::MethodNotFound,
                CallErrorCode::MethodNotFound.to_string(),
            ),
            Some(ExecutionStatus::Oversized) => CallResult::failure(
                CallErrorCode::AnswerTooLarge,
                CallErrorCode::AnswerTooLarge.to_string(),
            ),
            None => CallResult::failure(
                CallErrorCode::Unknown,
                format!("unexpected execution status {}", answer.status),
            ),
        }
    }
}

impl Engine {
    /// Runs `method` on the peer connected as `key` and waits for its
    /// result.
    ///
    /// Never fails with an `Err`: every failure is reported through the
    /// returned `CallResult`.
    pub async fn call(&self, key: &str, method: &str, payload: &Value) -> CallResult {
        let inner = &self.inner;
        let body = match encode_payload(payload) {
            Ok(body) => body,
            Err(e) => return CallResult::failure(CallErrorCode::Unknown, e.to_string()),
        };
        if body.len() > inner.config.max_message_size as usize {
            let msg = format!(
                "payload of {} bytes exceeds the {} byte limit",
                body.len(),
                inner.config.max_message_size
            );
            return CallResult::failure(CallErrorCode::PayloadTooLarge, msg);
        }
        if method.len() > MAX_METHOD_NAME_LEN {
            let msg = format!("method name longer than {} bytes", MAX_METHOD_NAME_LEN);
            return CallResult::failure(CallErrorCode::PayloadTooLarge, msg);
        }

        let connection = match self.open_with_retries(key).await {
            Some(connection) => connection,
            None => {
                warn!(inner.log, "remote peer not connected"; "key" => key, "method" => method);
                inner.hooks.on_remote_peer_disconnected(key, method);
                return CallResult::failure(
                    CallErrorCode::NotConnected,
                    format!("remote peer {} not connected", key),
                );
            }
        };

        let mut pending = match connection.register_request() {
            Ok(pending) => pending,
            Err(_) => {
                return CallResult::failure(
                    CallErrorCode::ConnectionClosed,
                    CallErrorCode::ConnectionClosed.to_string(),
                )
            }
        };
        let request_id = pending.request_id();
        let log = connection.log();
        debug!(log, "sending query"; "id" => request_id, "method" => method);

        if let Err(e) = connection
            .send(FastFrame::query(request_id, method, body))
            .await
        {
            warn!(log, "failed to send query"; "id" => request_id, "err" => %e);
            return CallResult::failure(
                CallErrorCode::ConnectionClosed,
                format!("failed to send query: {}", e),
            );
        }

        match pending.wait(inner.config.remote_execution_timeout()).await {
            WaitOutcome::Answered(answer) => CallResult::from_answer(answer),
            WaitOutcome::TimedOut => {
                warn!(log, "remote execution timed out"; "id" => request_id, "method" => method);
                inner
                    .hooks
                    .on_remote_execution_timed_out(key, method, request_id);
                CallResult::failure(
                    CallErrorCode::TimedOut,
                    CallErrorCode::TimedOut.to_string(),
                )
            }
            WaitOutcome::Terminated => CallResult::failure(
                CallErrorCode::ConnectionClosed,
                CallErrorCode::ConnectionClosed.to_string(),
            ),
        }
    }

    /// Asks the peer connected as `key` to close the connection. Returns
    /// `false` if no such connection is open or the frame could not be
    /// written.
    pub async fn close_remote(&self, key: &str) -> bool {
        let connection = match self.open_live(key) {
            Some(connection) => connection,
            None => return false,
        };
        debug!(connection.log(), "sending shutdown");
        connection.send(FastFrame::Shutdown).await.is_ok()
    }

    fn open_live(&self, key: &str) -> Option<OpenElement<'_, Connection>> {
        self.inner
            .connections
            .open_element(key)
            .filter(|connection| !connection.is_terminated())
    }

    async fn open_with_retries(&self, key: &str) -> Option<OpenElement<'_, Connection>> {
        let tries = self.inner.config.remote_execution_disconnected_tries;
        let backoff = self.inner.config.disconnected_retry_interval();
        let mut attempt = 0;
        loop {
            if let Some(connection) = self.open_live(key) {
                return Some(connection);
            }
            if attempt >= tries {
                return None;
            }
            attempt += 1;
            tokio::time::sleep(backoff).await;
        }
    }
}
