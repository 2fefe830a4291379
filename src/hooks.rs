// Copyright 2020 Joyent, Inc.

/// Notifications raised by an [`Engine`](crate::Engine). Every method
/// defaults to a no-op; override the ones worth logging or counting.
pub trait EngineHooks: Send + Sync {
    /// An Answer arrived for a request nobody is waiting on, usually one
    /// whose caller already timed out.
    fn on_unexpected_answer(&self, _key: &str, _request_id: u64) {}

    /// An inbound Query was answered as dropped because the worker queue
    /// stayed full.
    fn on_queue_full(&self, _key: &str, _method: &str, _request_id: u64) {}

    /// `call` gave up because `key` never became reachable.
    fn on_remote_peer_disconnected(&self, _key: &str, _method: &str) {}

    fn on_remote_execution_timed_out(
        &self,
        _key: &str,
        _method: &str,
        _request_id: u64,
    ) {
    }

    /// Runs on a blocking task, never on the connection's dispatcher.
    fn on_connection_established(&self, _key: &str) {}
}

pub struct NoopHooks;

impl EngineHooks for NoopHooks {}
