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

//! The set of per-namespace stores a session can reach. Shared between
//! sessions; stores serialise their own mutations.

use std::collections::HashMap;
use std::sync::Arc;

use osier_common::Schemes;
use osier_storage::{KvStore, PayloadDriver, Store};
use parking_lot::RwLock;

pub struct StoreMap<S: Schemes, K: KvStore, P: PayloadDriver<S>> {
    stores: RwLock<HashMap<S::NamespaceId, Arc<Store<S, K, P>>>>,
}

impl<S: Schemes, K: KvStore, P: PayloadDriver<S>> Default for StoreMap<S, K, P> {
    fn default() -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
        }
    }
}

impl<S: Schemes, K: KvStore, P: PayloadDriver<S>> StoreMap<S, K, P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, store: Arc<Store<S, K, P>>) {
        let _ = self
            .stores
            .write()
            .insert(store.namespace().clone(), store);
    }

    pub fn get(&self, namespace: &S::NamespaceId) -> Option<Arc<Store<S, K, P>>> {
        self.stores.read().get(namespace).cloned()
    }

    pub fn namespaces(&self) -> Vec<S::NamespaceId> {
        self.stores.read().keys().cloned().collect()
    }
}
