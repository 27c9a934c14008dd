//  Copyright 2025 Osier Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Numeric handle bindings.
//!
//! Handles are assigned monotonically by the peer that binds them; both
//! sides therefore agree on handle values without negotiation. A handle can
//! be freed only once every in-flight message that references it has been
//! processed, which the reference count tracks.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct HandleState<T> {
    value: T,
    refs: u64,
    marked_for_freeing: bool,
}

struct Inner<T> {
    next: u64,
    map: HashMap<u64, HandleState<T>>,
}

pub struct HandleStore<T> {
    inner: Mutex<Inner<T>>,
    bound: Notify,
}

impl<T> Default for HandleStore<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next: 0,
                map: HashMap::new(),
            }),
            bound: Notify::new(),
        }
    }
}

impl<T: Clone> HandleStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, value: T) -> u64 {
        let handle = {
            let mut inner = self.inner.lock();
            let handle = inner.next;
            inner.next += 1;
            let _ = inner.map.insert(
                handle,
                HandleState {
                    value,
                    refs: 0,
                    marked_for_freeing: false,
                },
            );
            handle
        };
        self.bound.notify_waiters();
        handle
    }

    pub fn get(&self, handle: u64) -> Option<T> {
        self.inner
            .lock()
            .map
            .get(&handle)
            .map(|state| state.value.clone())
    }

    /// Resolves as soon as the handle is bound. Callers referencing a
    /// handle from an in-flight message should hold a reference on it while
    /// they wait and work.
    pub async fn get_eventually(&self, handle: u64) -> T {
        loop {
            let waiter = self.bound.notified();
            tokio::pin!(waiter);
            // Register before checking, so a bind between the check and the
            // await cannot be missed.
            waiter.as_mut().enable();
            if let Some(value) = self.get(handle) {
                return value;
            }
            waiter.await;
        }
    }

    pub fn can_use(&self, handle: u64) -> bool {
        self.inner
            .lock()
            .map
            .get(&handle)
            .is_some_and(|state| !state.marked_for_freeing)
    }

    pub fn increment_reference(&self, handle: u64) {
        if let Some(state) = self.inner.lock().map.get_mut(&handle) {
            state.refs += 1;
        }
    }

    pub fn decrement_reference(&self, handle: u64) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.map.get_mut(&handle) {
            state.refs = state.refs.saturating_sub(1);
            if state.marked_for_freeing && state.refs == 0 {
                let _ = inner.map.remove(&handle);
            }
        }
    }

    /// Hide the handle from new users; the entry disappears once in-flight
    /// references drain.
    pub fn mark_for_freeing(&self, handle: u64) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.map.get_mut(&handle) {
            state.marked_for_freeing = true;
            if state.refs == 0 {
                let _ = inner.map.remove(&handle);
            }
        }
    }

    /// Live bindings, in handle order.
    pub fn entries(&self) -> Vec<(u64, T)> {
        let inner = self.inner.lock();
        let mut entries: Vec<_> = inner
            .map
            .iter()
            .filter(|(_, state)| !state.marked_for_freeing)
            .map(|(handle, state)| (*handle, state.value.clone()))
            .collect();
        entries.sort_by_key(|(handle, _)| *handle);
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
