// Copyright 2020 Joyent, Inc.

//! Inbound side of a connection: the dispatcher that owns the read half of
//! the stream, and the tasks that execute inbound Queries.

use std::io::{Error, ErrorKind};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use slog::{debug, error, info, o, trace, warn, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::OwnedRwLockReadGuard;
use tokio_util::codec::FramedRead;

use crate::connection::{Answer, Connection};
use crate::engine::{Engine, EngineInner};
use crate::protocol::{decode_payload, encode_payload, ExecutionStatus, FastFrame, FastRpc};
use crate::registry::{Invocation, MethodRegistry};
use crate::table::ConnectionTable;

/// Why `process_connection` stopped reading a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionExit {
    /// The peer sent a Shutdown frame.
    PeerShutdown,
    /// The stream ended cleanly between two frames.
    StreamClosed,
    /// Nothing arrived within the socket timeout.
    ReadTimeout,
    /// The stream failed, or ended in the middle of a frame.
    ReadError,
    /// The peer sent something that is not a valid frame.
    ProtocolError,
    /// A frame write on this connection failed.
    WriteFailed,
}

/// An inbound Query admitted to the worker pool.
struct OutgoingTask {
    request_id: u64,
    method: String,
    payload: Value,
    connection: Arc<Connection>,
    registry: Arc<MethodRegistry>,
    max_message_size: u32,
    report_oversized: bool,
    /// Held until the Answer has been written, so the dispatcher's drain
    /// waits for this task.
    _in_flight: OwnedRwLockReadGuard<()>,
}

impl OutgoingTask {
    async fn run(self) {
        let OutgoingTask {
            request_id,
            method,
            payload,
            connection,
            registry,
            max_message_size,
            report_oversized,
            _in_flight,
        } = self;
        let log = connection.log().new(o!("id" => request_id, "method" => method.clone()));

        let caller = connection.key().to_string();
        let name = method.clone();
        let invocation = tokio::task::spawn_blocking(move || {
            registry.invoke_local(&name, &caller, payload)
        })
        .await
        .unwrap_or(Invocation::Panicked);

        let (status, body) = match invocation {
            Invocation::Executed(value) => {
                answer_body(&value, max_message_size, report_oversized, &log)
            }
            Invocation::NotFound => {
                debug!(log, "method not found");
                (ExecutionStatus::NotFound, Bytes::new())
            }
            Invocation::Panicked => {
                error!(log, "method handler panicked");
                (ExecutionStatus::NotFound, Bytes::new())
            }
        };

        trace!(log, "sending answer"; "status" => ?status, "len" => body.len());
        if let Err(e) = connection
            .send(FastFrame::answer(request_id, status, body))
            .await
        {
            warn!(log, "failed to send answer"; "err" => %e);
        }
    }
}

/// Encodes a handler result, degrading it to an empty payload when it is
/// larger than the peer accepts.
fn answer_body(
    value: &Value,
    max_message_size: u32,
    report_oversized: bool,
    log: &Logger,
) -> (ExecutionStatus, Bytes) {
    let body = match encode_payload(value) {
        Ok(body) => body,
        Err(e) => {
            error!(log, "failed to encode method result"; "err" => %e);
            return (ExecutionStatus::NotFound, Bytes::new());
        }
    };

    if body.len() <= max_message_size as usize {
        return (ExecutionStatus::Executed, body);
    }

    warn!(log, "method result exceeds max message size";
          "len" => body.len(), "max" => max_message_size);
    if report_oversized {
        (ExecutionStatus::Oversized, Bytes::new())
    } else {
        (ExecutionStatus::Executed, Bytes::new())
    }
}

/// Holds a connection's table entry while its dispatcher runs. Dropping
/// it terminates the connection and frees the key, so a dispatcher that is
/// cancelled or panics cannot leave the key registered.
struct Registration<'a> {
    connections: &'a ConnectionTable<Connection>,
    key: &'a str,
    connection: Arc<Connection>,
    log: Logger,
}

impl<'a> Drop for Registration<'a> {
    fn drop(&mut self) {
        if self.connections.remove_element(self.key, &self.connection) {
            warn!(self.log, "connection dropped before it was drained");
        }
        self.connection.terminate();
    }
}

/// Runs a hook on the dispatcher. A panicking hook is logged and does not
/// take the connection down.
fn run_hook<F: FnOnce()>(log: &Logger, hook: &str, f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(log, "hook panicked"; "hook" => hook);
    }
}

impl Engine {
    /// Serves `stream` as the connection named `key` until the peer shuts
    /// down, the stream fails, or the peer violates the protocol.
    ///
    /// Before returning, waits for every inbound Query still executing,
    /// shuts the stream down and wakes every `call` waiting on it. Fails
    /// with `AlreadyExists` if `key` is already connected.
    pub async fn process_connection<S>(
        &self,
        stream: S,
        key: &str,
    ) -> Result<ConnectionExit, Error>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let inner = &self.inner;
        let codec = FastRpc::new(inner.config.max_message_size);
        let (read_half, write_half) = tokio::io::split(stream);
        let log = inner.log.new(o!("connection" => key.to_string()));
        let connection = Arc::new(Connection::new(
            key,
            Box::new(write_half),
            codec,
            inner.config.socket_timeout(),
            log.clone(),
        ));

        if !inner.connections.add_element(key, Arc::clone(&connection)) {
            warn!(log, "connection key already in use");
            let msg = format!("connection key {} already in use", key);
            return Err(Error::new(ErrorKind::AlreadyExists, msg));
        }
        let _registration = Registration {
            connections: &inner.connections,
            key,
            connection: Arc::clone(&connection),
            log: log.clone(),
        };
        info!(log, "connection established");

        let hooks = Arc::clone(&inner.hooks);
        let established_key = key.to_string();
        tokio::task::spawn_blocking(move || {
            hooks.on_connection_established(&established_key)
        });

        let mut reader = FramedRead::new(read_half, codec);
        let exit = dispatch_frames(inner, &connection, &mut reader, &log).await;
        drop(reader);

        match exit {
            ConnectionExit::PeerShutdown | ConnectionExit::StreamClosed => {
                info!(log, "connection closing"; "reason" => ?exit)
            }
            _ => error!(log, "connection failed"; "reason" => ?exit),
        }

        let drained = connection.in_flight().write().await;
        debug!(log, "in-flight queries drained");
        connection.shutdown_transport().await;
        connection.terminate();
        drop(drained);

        inner.connections.destroy_element(key).await;
        info!(log, "connection removed");

        Ok(exit)
    }
}

async fn dispatch_frames<R>(
    inner: &EngineInner,
    connection: &Arc<Connection>,
    reader: &mut FramedRead<R, FastRpc>,
    log: &Logger,
) -> ConnectionExit
where
    R: AsyncRead + Unpin,
{
    let read_timeout = inner.config.socket_timeout();
    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(read_timeout, reader.next()) => Some(next),
            _ = connection.write_failure() => None,
        };

        let frame = match next {
            None => return ConnectionExit::WriteFailed,
            Some(Err(_)) => return ConnectionExit::ReadTimeout,
            Some(Ok(None)) => return ConnectionExit::StreamClosed,
            Some(Ok(Some(Err(e)))) => {
                error!(log, "failed to read frame"; "err" => %e);
                if e.kind() == ErrorKind::InvalidData {
                    return ConnectionExit::ProtocolError;
                }
                return ConnectionExit::ReadError;
            }
            Some(Ok(Some(Ok(frame)))) => frame,
        };

        match frame {
            FastFrame::Query {
                request_id,
                method,
                payload,
            } => {
                if let Err(exit) =
                    dispatch_query(inner, connection, request_id, method, payload, log)
                        .await
                {
                    return exit;
                }
            }
            FastFrame::Answer {
                request_id,
                status,
                payload,
            } => deliver_answer(inner, connection, request_id, status, &payload, log),
            FastFrame::Ping => trace!(log, "received keepalive ping"),
            FastFrame::Shutdown => return ConnectionExit::PeerShutdown,
        }
    }
}

async fn dispatch_query(
    inner: &EngineInner,
    connection: &Arc<Connection>,
    request_id: u64,
    method: String,
    payload: Bytes,
    log: &Logger,
) -> Result<(), ConnectionExit> {
    let payload = decode_payload(&payload).map_err(|e| {
        error!(log, "undecodable query payload"; "id" => request_id, "err" => %e);
        ConnectionExit::ProtocolError
    })?;
    debug!(log, "received query"; "id" => request_id, "method" => &method);

    let priority = inner.registry.priority(&method);
    let in_flight = Arc::clone(connection.in_flight()).read_owned().await;
    let task = OutgoingTask {
        request_id,
        method: method.clone(),
        payload,
        connection: Arc::clone(connection),
        registry: Arc::clone(&inner.registry),
        max_message_size: inner.config.max_message_size,
        report_oversized: inner.config.report_oversized_answers,
        _in_flight: in_flight,
    };

    let submitted = inner
        .pool
        .submit(
            connection.key(),
            priority,
            task.run().boxed(),
            inner.config.queue_push_timeout(),
        )
        .await;

    if let Err(rejected) = submitted {
        // Dropping the task releases its in-flight hold.
        drop(rejected);
        warn!(log, "worker queue full, dropping query";
              "id" => request_id, "method" => &method);
        run_hook(log, "on_queue_full", || {
            inner.hooks.on_queue_full(connection.key(), &method, request_id)
        });
        let answer = FastFrame::answer(request_id, ExecutionStatus::Dropped, Bytes::new());
        connection
            .send(answer)
            .await
            .map_err(|_| ConnectionExit::WriteFailed)?;
    }
    Ok(())
}

fn deliver_answer(
    inner: &EngineInner,
    connection: &Connection,
    request_id: u64,
    status: u8,
    payload: &[u8],
    log: &Logger,
) {
    let payload = match decode_payload(payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(log, "discarding undecodable answer"; "id" => request_id, "err" => %e);
            connection.discard_answer(request_id);
            return;
        }
    };

    debug!(log, "received answer"; "id" => request_id, "status" => status);
    if !connection.deliver_answer(request_id, Answer { status, payload }) {
        warn!(log, "unexpected answer"; "id" => request_id);
        run_hook(log, "on_unexpected_answer", || {
            inner.hooks.on_unexpected_answer(connection.key(), request_id)
        });
    }
}
