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

//! The ordered key-value engine the entry index is built on.
//!
//! The engine is pluggable; all index structures only need point reads,
//! point writes and lexicographic range scans. Scans return a snapshot:
//! they may race with concurrent mutation and miss or include entries
//! written during the scan, but never yield torn values.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::error::Result;

pub trait KvStore: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Entries with `start <= key < end`, in key order (reversed when
    /// `reverse`).
    fn scan(&self, start: &[u8], end: &[u8], reverse: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory engine over a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let _ = self.map.write().insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let _ = self.map.write().remove(key);
        Ok(())
    }

    fn scan(&self, start: &[u8], end: &[u8], reverse: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.read();
        let range = map.range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)));
        let mut snapshot: Vec<_> = range.map(|(k, v)| (k.clone(), v.clone())).collect();
        if reverse {
            snapshot.reverse();
        }
        Ok(snapshot)
    }
}
