// Copyright 2020 Joyent, Inc.

//! Per-peer state shared by the dispatcher, the workers answering its
//! Queries and every caller sending Queries over it.

use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use parking_lot::Mutex;
use serde_json::Value;
use slog::{debug, error, Logger};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify, RwLock};
use tokio_util::codec::FramedWrite;

use crate::protocol::{FastFrame, FastRpc};

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A decoded Answer handed to the caller that sent the Query.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub status: u8,
    pub payload: Value,
}

pub struct Connection {
    key: String,
    writer: AsyncMutex<FramedWrite<BoxedWriter, FastRpc>>,
    io_timeout: Duration,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Answer>>>,
    in_flight: Arc<RwLock<()>>,
    terminated: AtomicBool,
    write_failed: AtomicBool,
    write_failure: Notify,
    terminated_signal: Notify,
    log: Logger,
}

impl Connection {
    pub(crate) fn new(
        key: &str,
        writer: BoxedWriter,
        codec: FastRpc,
        io_timeout: Duration,
        log: Logger,
    ) -> Connection {
        Connection {
            key: key.to_string(),
            writer: AsyncMutex::new(FramedWrite::new(writer, codec)),
            io_timeout,
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            in_flight: Arc::new(RwLock::new(())),
            terminated: AtomicBool::new(false),
            write_failed: AtomicBool::new(false),
            write_failure: Notify::new(),
            terminated_signal: Notify::new(),
            log,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    pub(crate) fn in_flight(&self) -> &Arc<RwLock<()>> {
        &self.in_flight
    }

    /// Allocates a request id and starts waiting for its Answer. Fails if
    /// the connection is already terminated.
    pub(crate) fn register_request(&self) -> Result<PendingRequest<'_>, Error> {
        let mut pending = self.pending.lock();
        if self.is_terminated() {
            return Err(closed_error());
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.insert(request_id, tx);
        Ok(PendingRequest {
            connection: self,
            request_id,
            answer: rx,
        })
    }

    /// Hands an Answer to its waiting caller. Returns `false` if nobody is
    /// waiting for `request_id`.
    pub(crate) fn deliver_answer(&self, request_id: u64, answer: Answer) -> bool {
        match self.pending.lock().remove(&request_id) {
            Some(tx) => tx.send(answer).is_ok(),
            None => false,
        }
    }

    /// Forgets `request_id` without answering it. The caller keeps
    /// waiting until its deadline.
    pub(crate) fn discard_answer(&self, request_id: u64) -> bool {
        self.pending.lock().remove(&request_id).is_some()
    }

    fn forget_request(&self, request_id: u64) {
        self.pending.lock().remove(&request_id);
    }

    /// Writes one frame under the socket lock. A failed or timed out write
    /// leaves the stream in an unknown state, so it poisons the connection
    /// and wakes the dispatcher.
    pub(crate) async fn send(&self, frame: FastFrame) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        if self.write_failed.load(Ordering::Acquire) || self.is_terminated() {
            return Err(closed_error());
        }

        let result = match tokio::time::timeout(self.io_timeout, writer.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorKind::TimedOut, "frame write timed out")),
        };

        if let Err(ref e) = result {
            error!(self.log, "frame write failed"; "err" => %e);
            self.write_failed.store(true, Ordering::Release);
            self.write_failure.notify_one();
        }
        result
    }

    /// Resolves once a write on this connection has failed.
    pub(crate) async fn write_failure(&self) {
        self.write_failure.notified().await
    }

    pub(crate) async fn shutdown_transport(&self) {
        let mut writer = self.writer.lock().await;
        let shutdown = writer.get_mut().shutdown();
        match tokio::time::timeout(self.io_timeout, shutdown).await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => debug!(self.log, "transport shutdown failed"; "err" => %e),
            Err(_) => debug!(self.log, "transport shutdown timed out"),
        }
    }

    /// Marks the connection dead and wakes every caller still waiting on
    /// it. Later `register_request` calls fail.
    pub(crate) fn terminate(&self) {
        let mut pending = self.pending.lock();
        self.terminated.store(true, Ordering::Release);
        let abandoned = pending.len();
        pending.clear();
        self.terminated_signal.notify_waiters();
        if abandoned > 0 {
            debug!(self.log, "abandoning pending requests"; "count" => abandoned);
        }
    }
}

fn closed_error() -> Error {
    Error::new(ErrorKind::NotConnected, "connection closed")
}

/// A request id awaiting its Answer. Dropping it removes the id from the
/// connection's pending set, whatever the outcome.
pub(crate) struct PendingRequest<'a> {
    connection: &'a Connection,
    request_id: u64,
    answer: oneshot::Receiver<Answer>,
}

pub(crate) enum WaitOutcome {
    Answered(Answer),
    TimedOut,
    Terminated,
}

impl<'a> PendingRequest<'a> {
    pub(crate) fn request_id(&self) -> u64 {
        self.request_id
    }

    pub(crate) async fn wait(&mut self, timeout: Duration) -> WaitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, &mut self.answer).await {
            Ok(Ok(answer)) => WaitOutcome::Answered(answer),
            Ok(Err(_)) if self.connection.is_terminated() => WaitOutcome::Terminated,
            Ok(Err(_)) => {
                // The Answer was discarded. The caller learns of it at its
                // deadline, unless the connection goes away first.
                let terminated = self.connection.terminated_signal.notified();
                tokio::pin!(terminated);
                terminated.as_mut().enable();
                if self.connection.is_terminated() {
                    return WaitOutcome::Terminated;
                }
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => WaitOutcome::TimedOut,
                    _ = terminated => WaitOutcome::Terminated,
                }
            }
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}

impl<'a> Drop for PendingRequest<'a> {
    fn drop(&mut self) {
        self.connection.forget_request(self.request_id);
    }
}
