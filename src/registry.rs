// Copyright 2020 Joyent, Inc.

//! Named methods that remote peers may invoke.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// A registered method. It receives the key of the calling connection and
/// the decoded Query payload, and returns the Answer payload.
pub type MethodHandler = Arc<dyn Fn(&str, Value) -> Value + Send + Sync>;

struct Registration {
    handler: MethodHandler,
    priority: i32,
}

/// Result of running a method locally.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Executed(Value),
    NotFound,
    /// The handler panicked; the panic did not escape the worker.
    Panicked,
}

#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Registration>>,
}

impl MethodRegistry {
    pub fn new() -> MethodRegistry {
        MethodRegistry::default()
    }

    /// Registers `handler` under `name`. Returns `false`, leaving the
    /// existing registration in place, if `name` is already taken.
    pub fn add_method<F>(&self, name: &str, handler: F) -> bool
    where
        F: Fn(&str, Value) -> Value + Send + Sync + 'static,
    {
        self.add_method_with_priority(name, 0, handler)
    }

    /// Like `add_method`; inbound Queries for this method are scheduled
    /// ahead of queued Queries with a lower priority.
    pub fn add_method_with_priority<F>(
        &self,
        name: &str,
        priority: i32,
        handler: F,
    ) -> bool
    where
        F: Fn(&str, Value) -> Value + Send + Sync + 'static,
    {
        let mut methods = self.methods.write();
        if methods.contains_key(name) {
            return false;
        }
        methods.insert(
            name.to_string(),
            Registration {
                handler: Arc::new(handler),
                priority,
            },
        );
        true
    }

    pub fn remove_method(&self, name: &str) -> bool {
        self.methods.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    /// Scheduling priority of `name`, 0 for unknown methods.
    pub fn priority(&self, name: &str) -> i32 {
        self.methods
            .read()
            .get(name)
            .map(|r| r.priority)
            .unwrap_or(0)
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.methods.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Runs `name` with the registry lock released, so a long-running
    /// handler never blocks registration.
    pub fn invoke_local(
        &self,
        name: &str,
        caller_key: &str,
        payload: Value,
    ) -> Invocation {
        let handler = match self.methods.read().get(name) {
            Some(registration) => Arc::clone(&registration.handler),
            None => return Invocation::NotFound,
        };

        match panic::catch_unwind(AssertUnwindSafe(|| (*handler)(caller_key, payload))) {
            Ok(value) => Invocation::Executed(value),
            Err(_) => Invocation::Panicked,
        }
    }
}
