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

//! Re-assembly of payloads arriving over a channel.
//!
//! The sender interleaves entry headers and payload chunks on one channel,
//! so the ingester is a little state machine: `target` names the entry the
//! next chunks belong to, `push` feeds them into the store, `terminate`
//! cancels. An entry that was targeted but received no bytes before the
//! next target is handed back as a candidate, so the session can fetch its
//! payload explicitly instead.

use std::sync::Arc;

use bytes::Bytes;
use osier_common::Schemes;
use osier_storage::{IngestPayloadEvent, KvStore, PayloadDriver, SchemeEntry};
use tracing::trace;

use crate::data_sender::PayloadTransform;
use crate::error::{Result, SyncError};
use crate::store_map::StoreMap;

enum IngesterState<S: Schemes> {
    Uninitialised,
    /// Targeted, no bytes yet.
    Pending {
        entry: SchemeEntry<S>,
        offset: u64,
        request_if_immediately_terminated: bool,
    },
    Active {
        entry: SchemeEntry<S>,
        cursor: u64,
    },
    Cancelled,
}

pub struct PayloadIngester<S: Schemes, K: KvStore, P: PayloadDriver<S>> {
    state: IngesterState<S>,
    stores: Arc<StoreMap<S, K, P>>,
    transform: Option<PayloadTransform>,
}

impl<S: Schemes, K: KvStore, P: PayloadDriver<S>> PayloadIngester<S, K, P> {
    pub fn new(stores: Arc<StoreMap<S, K, P>>, transform: Option<PayloadTransform>) -> Self {
        Self {
            state: IngesterState::Uninitialised,
            stores,
            transform,
        }
    }

    /// Aim the ingester at the entry whose payload may arrive next.
    /// Returns the previously-targeted entry if it never received a byte
    /// and asked to be requested in that case.
    pub fn target(
        &mut self,
        entry: SchemeEntry<S>,
        offset: u64,
        request_if_immediately_terminated: bool,
    ) -> Option<SchemeEntry<S>> {
        let previous = std::mem::replace(
            &mut self.state,
            IngesterState::Pending {
                entry,
                offset,
                request_if_immediately_terminated,
            },
        );
        match previous {
            IngesterState::Pending {
                entry,
                request_if_immediately_terminated: true,
                ..
            } => Some(entry),
            _ => None,
        }
    }

    /// Feed a chunk to the targeted entry. `end` declares the sender is
    /// done with this payload.
    pub async fn push(&mut self, bytes: Bytes, end: bool) -> Result<IngestPayloadEvent> {
        let (entry, cursor) = match std::mem::replace(&mut self.state, IngesterState::Cancelled) {
            IngesterState::Pending { entry, offset, .. } => (entry, offset),
            IngesterState::Active { entry, cursor } => (entry, cursor),
            other => {
                self.state = other;
                return Err(SyncError::protocol("payload bytes without a targeted entry"));
            }
        };
        let bytes = match &self.transform {
            Some(transform) => transform(bytes),
            None => bytes,
        };
        let amount = bytes.len() as u64;
        if cursor + amount > entry.payload_length {
            return Err(SyncError::protocol(
                "more payload bytes than the entry declares",
            ));
        }
        let store = self
            .stores
            .get(&entry.namespace_id)
            .ok_or_else(|| SyncError::protocol("payload for an unknown namespace"))?;
        // The targeted entry may have been superseded while its payload was
        // in flight; the remaining bytes are then dropped, not an error.
        let still_stored = store
            .entry_at(&entry.subspace_id, &entry.path)?
            .is_some_and(|(stored, _)| stored == entry);
        let event = if still_stored {
            store
                .ingest_payload(&entry.subspace_id, &entry.path, bytes, cursor)
                .await?
        } else {
            IngestPayloadEvent::AlreadyHave
        };
        trace!(?event, cursor, amount, "ingested payload chunk");
        self.state = if end || matches!(event, IngestPayloadEvent::Accepted { complete: true }) {
            IngesterState::Uninitialised
        } else {
            IngesterState::Active {
                entry,
                cursor: cursor + amount,
            }
        };
        Ok(event)
    }

    /// Cancel the in-flight ingestion, returning the candidate entry whose
    /// payload should be requested explicitly.
    pub fn terminate(&mut self) -> Option<SchemeEntry<S>> {
        match std::mem::replace(&mut self.state, IngesterState::Cancelled) {
            IngesterState::Pending {
                entry,
                request_if_immediately_terminated: true,
                ..
            } => Some(entry),
            _ => None,
        }
    }

    /// The entry bytes are currently flowing toward, if any.
    pub fn current_entry(&self) -> Option<&SchemeEntry<S>> {
        match &self.state {
            IngesterState::Pending { entry, .. } | IngesterState::Active { entry, .. } => {
                Some(entry)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osier_common::testing::{id8, TestPayloadHasher, TestSchemes};
    use osier_common::{Path, PayloadHasher};
    use osier_storage::{MemoryKv, MemoryPayloadDriver, Store};

    type Stores = StoreMap<TestSchemes, MemoryKv, MemoryPayloadDriver<TestSchemes>>;

    async fn fixtures(payload: &[u8]) -> (Arc<Stores>, SchemeEntry<TestSchemes>) {
        let store = Store::new(
            id8("family"),
            Arc::new(MemoryKv::new()),
            MemoryPayloadDriver::new(),
        )
        .await
        .unwrap();
        let entry = SchemeEntry::<TestSchemes> {
            namespace_id: id8("family"),
            subspace_id: id8("gemma"),
            path: Path::new([b"p".to_vec()]),
            timestamp: 3,
            payload_length: payload.len() as u64,
            payload_digest: TestPayloadHasher::digest_of(payload),
        };
        let token = TestSchemes::authorise(&entry, &id8("gemma")).unwrap();
        assert!(store
            .ingest_entry(entry.clone(), token, Some("peer".into()))
            .await
            .unwrap()
            .is_success());
        let stores = Arc::new(StoreMap::new());
        stores.insert(Arc::new(store));
        (stores, entry)
    }

    #[tokio::test]
    async fn chunks_flow_into_the_store() {
        let (stores, entry) = fixtures(b"abcdef").await;
        let mut ingester = PayloadIngester::new(stores.clone(), None);
        assert!(ingester.target(entry.clone(), 0, true).is_none());
        let event = ingester.push(Bytes::from_static(b"abc"), false).await.unwrap();
        assert_eq!(event, IngestPayloadEvent::Accepted { complete: false });
        let event = ingester.push(Bytes::from_static(b"def"), false).await.unwrap();
        assert_eq!(event, IngestPayloadEvent::Accepted { complete: true });

        let store = stores.get(&id8("family")).unwrap();
        let payload = store.payload(&entry.payload_digest).await.unwrap().unwrap();
        assert_eq!(payload.bytes(), Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn retargeting_untouched_entry_yields_a_candidate() {
        let (stores, entry) = fixtures(b"xy").await;
        let mut ingester = PayloadIngester::new(stores, None);
        assert!(ingester.target(entry.clone(), 0, true).is_none());
        // No bytes arrive before the next entry header.
        let candidate = ingester.target(entry.clone(), 0, false).unwrap();
        assert_eq!(candidate, entry);
        assert!(ingester.terminate().is_none());
    }

    #[tokio::test]
    async fn push_without_target_is_a_protocol_error() {
        let (stores, _) = fixtures(b"z").await;
        let mut ingester = PayloadIngester::new(stores, None);
        assert!(ingester.push(Bytes::from_static(b"z"), false).await.is_err());
    }
}
