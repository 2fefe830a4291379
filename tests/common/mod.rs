// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;

use fast_rpc_peer::{ConnectionExit, Engine, EngineHooks, FastRpcConfig};

pub type ServeHandle = JoinHandle<io::Result<ConnectionExit>>;

pub fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Warning,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

/// Defaults scaled down so failures show up in milliseconds.
pub fn quick_config() -> FastRpcConfig {
    FastRpcConfig {
        queue_push_timeout_ms: 200,
        remote_execution_timeout_ms: 3000,
        remote_execution_disconnected_tries: 100,
        disconnected_retry_interval_ms: 10,
        workers: 4,
        queue_capacity: 16,
        ..FastRpcConfig::default()
    }
}

pub fn serve<S>(engine: &Engine, stream: S, key: &str) -> ServeHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let engine = engine.clone();
    let key = key.to_string();
    tokio::spawn(async move { engine.process_connection(stream, &key).await })
}

/// Joins `a` and `b` over an in-memory stream. `a` knows its peer as "B"
/// and `b` knows its peer as "A".
pub async fn connect_pair(a: &Engine, b: &Engine) -> (ServeHandle, ServeHandle) {
    let (a_side, b_side) = tokio::io::duplex(256 * 1024);
    let a_handle = serve(a, a_side, "B");
    let b_handle = serve(b, b_side, "A");
    wait_for(|| a.is_connected("B") && b.is_connected("A")).await;
    (a_handle, b_handle)
}

pub async fn wait_for<F: Fn() -> bool>(cond: F) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met within 5s");
}

#[derive(Default)]
pub struct CountingHooks {
    pub unexpected_answers: AtomicUsize,
    pub queue_full: AtomicUsize,
    pub peer_disconnected: AtomicUsize,
    pub timed_out: AtomicUsize,
    pub established: AtomicUsize,
}

impl CountingHooks {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl EngineHooks for CountingHooks {
    fn on_unexpected_answer(&self, _key: &str, _request_id: u64) {
        self.unexpected_answers.fetch_add(1, Ordering::SeqCst);
    }

    fn on_queue_full(&self, _key: &str, _method: &str, _request_id: u64) {
        self.queue_full.fetch_add(1, Ordering::SeqCst);
    }

    fn on_remote_peer_disconnected(&self, _key: &str, _method: &str) {
        self.peer_disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_remote_execution_timed_out(&self, _key: &str, _method: &str, _request_id: u64) {
        self.timed_out.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connection_established(&self, _key: &str) {
        self.established.fetch_add(1, Ordering::SeqCst);
    }
}

/// A stream that counts every byte written to it.
pub struct RecordingStream {
    inner: DuplexStream,
    written: Arc<AtomicUsize>,
}

impl RecordingStream {
    pub fn new(inner: DuplexStream) -> (RecordingStream, Arc<AtomicUsize>) {
        let written = Arc::new(AtomicUsize::new(0));
        let stream = RecordingStream {
            inner,
            written: Arc::clone(&written),
        };
        (stream, written)
    }
}

impl AsyncRead for RecordingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RecordingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = polled {
            self.written.fetch_add(n, Ordering::SeqCst);
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
