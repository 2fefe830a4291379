// Copyright 2020 Joyent, Inc.

//! Registry of live connections keyed by peer name.
//!
//! Lookups hand out an [`OpenElement`] that counts as an outstanding
//! reference until it is dropped; `destroy_element` waits for every
//! outstanding reference before removing the entry.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct TableEntry<T> {
    element: Arc<T>,
    open: usize,
}

pub struct ConnectionTable<T> {
    entries: Mutex<HashMap<String, TableEntry<T>>>,
    released: Notify,
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        ConnectionTable {
            entries: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }
}

impl<T> ConnectionTable<T> {
    pub fn new() -> ConnectionTable<T> {
        ConnectionTable::default()
    }

    /// Returns `false` if `key` already has an element.
    pub fn add_element(&self, key: &str, element: Arc<T>) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(key.to_string(), TableEntry { element, open: 0 });
        true
    }

    /// Looks up `key`. The entry cannot be destroyed until the returned
    /// handle is dropped.
    pub fn open_element(&self, key: &str) -> Option<OpenElement<'_, T>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.open += 1;
        Some(OpenElement {
            table: self,
            key: key.to_string(),
            element: Arc::clone(&entry.element),
        })
    }

    fn close_element(&self, key: &str, element: &Arc<T>) {
        let mut entries = self.entries.lock();
        // The entry may have been removed and the key reused meanwhile.
        if let Some(entry) = entries
            .get_mut(key)
            .filter(|entry| Arc::ptr_eq(&entry.element, element))
        {
            entry.open -= 1;
            if entry.open == 0 {
                self.released.notify_waiters();
            }
        }
    }

    /// Removes `key` once no handle to it is open.
    pub async fn destroy_element(&self, key: &str) -> Option<Arc<T>> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut entries = self.entries.lock();
                match entries.get(key) {
                    None => return None,
                    Some(entry) if entry.open == 0 => {
                        return entries.remove(key).map(|e| e.element)
                    }
                    Some(_) => (),
                }
            }

            released.await;
        }
    }

    /// Removes `key` at once, open handles or not, provided it still maps
    /// to `element`. Handles opened earlier stay usable but no longer
    /// count against any entry.
    pub fn remove_element(&self, key: &str, element: &Arc<T>) -> bool {
        let mut entries = self.entries.lock();
        let owned = entries
            .get(key)
            .map_or(false, |entry| Arc::ptr_eq(&entry.element, element));
        if owned {
            entries.remove(key);
            self.released.notify_waiters();
        }
        owned
    }

    pub fn check_element(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn get_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn open_count(&self, key: &str) -> usize {
        self.entries.lock().get(key).map_or(0, |e| e.open)
    }
}

/// An open reference to a table element, released on drop.
pub struct OpenElement<'a, T> {
    table: &'a ConnectionTable<T>,
    key: String,
    element: Arc<T>,
}

impl<'a, T> OpenElement<'a, T> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<'a, T> Deref for OpenElement<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.element
    }
}

impl<'a, T> Drop for OpenElement<'a, T> {
    fn drop(&mut self) {
        self.table.close_element(&self.key, &self.element);
    }
}
