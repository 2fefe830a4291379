// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use slog::{info, o, Drain, Logger};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::FastRpcConfig;
use crate::connection::Connection;
use crate::hooks::{EngineHooks, NoopHooks};
use crate::keepalive;
use crate::pool::WorkerPool;
use crate::registry::MethodRegistry;
use crate::table::ConnectionTable;

pub(crate) struct EngineInner {
    pub(crate) config: FastRpcConfig,
    pub(crate) registry: Arc<MethodRegistry>,
    pub(crate) connections: ConnectionTable<Connection>,
    pub(crate) pool: WorkerPool,
    pub(crate) hooks: Arc<dyn EngineHooks>,
    pub(crate) log: Logger,
    stop: watch::Sender<bool>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

/// One endpoint of the protocol: serves its registered methods to every
/// connected peer and calls methods on them.
///
/// Cloning an `Engine` is cheap; clones share all state.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: FastRpcConfig, log: Option<&Logger>) -> Engine {
        Engine::with_hooks(config, Arc::new(NoopHooks), log)
    }

    pub fn with_hooks(
        config: FastRpcConfig,
        hooks: Arc<dyn EngineHooks>,
        log: Option<&Logger>,
    ) -> Engine {
        let log = log
            .map(|l| l.new(o!("component" => "FastRpcEngine")))
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let pool = WorkerPool::new(
            config.workers,
            config.queue_capacity,
            config.max_queued_per_key,
        );
        let (stop, _) = watch::channel(false);

        Engine {
            inner: Arc::new(EngineInner {
                config,
                registry: Arc::new(MethodRegistry::new()),
                connections: ConnectionTable::new(),
                pool,
                hooks,
                log,
                stop,
                keepalive: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &FastRpcConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.inner.registry
    }

    /// See [`MethodRegistry::add_method`].
    pub fn add_method<F>(&self, name: &str, handler: F) -> bool
    where
        F: Fn(&str, Value) -> Value + Send + Sync + 'static,
    {
        self.inner.registry.add_method(name, handler)
    }

    pub fn add_method_with_priority<F>(
        &self,
        name: &str,
        priority: i32,
        handler: F,
    ) -> bool
    where
        F: Fn(&str, Value) -> Value + Send + Sync + 'static,
    {
        self.inner
            .registry
            .add_method_with_priority(name, priority, handler)
    }

    pub fn remove_method(&self, name: &str) -> bool {
        self.inner.registry.remove_method(name)
    }

    /// Keys of every currently registered connection.
    pub fn connection_keys(&self) -> Vec<String> {
        self.inner.connections.get_keys()
    }

    pub fn is_connected(&self, key: &str) -> bool {
        self.inner.connections.check_element(key)
    }

    /// Starts pinging every connection each `ping_interval`. Calling it
    /// again while the loop runs has no effect.
    pub fn start_keepalive(&self) {
        let mut keepalive = self.inner.keepalive.lock();
        if keepalive.is_some() || *self.inner.stop.borrow() {
            return;
        }
        let stop = self.inner.stop.subscribe();
        *keepalive = Some(tokio::spawn(keepalive::run(
            Arc::clone(&self.inner),
            stop,
        )));
    }

    /// Stops the keepalive loop at once and refuses further inbound
    /// Queries; Queries already admitted still run. Connections stay open.
    pub fn stop(&self) {
        info!(self.inner.log, "stopping engine");
        self.inner.stop.send_replace(true);
        self.inner.pool.stop();
    }

    /// Waits for the keepalive loop to exit after `stop`.
    pub async fn join_keepalive(&self) {
        let handle = self.inner.keepalive.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
