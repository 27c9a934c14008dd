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

//! Entry and payload streaming outside reconciliation.
//!
//! Serves two queues: payload-request replies (a `DataReplyPayload` header
//! followed by the payload in chunks) and pushed entries (a
//! `DataSendEntry` followed by whatever payload bytes are held locally).
//! Every chunk passes through the payload transform, the hook an encrypting
//! deployment uses.

use std::sync::Arc;

use bytes::Bytes;
use osier_common::Schemes;
use osier_storage::{KvStore, PayloadDriver, SchemeEntry};
use tracing::trace;

use crate::error::{Result, SyncError};
use crate::handle_store::HandleStore;
use crate::store_map::StoreMap;
use crate::wire::Message;

/// A payload request bound by the peer.
pub struct PayloadRequest<S: Schemes> {
    pub entry: SchemeEntry<S>,
    pub offset: u64,
}

impl<S: Schemes> Clone for PayloadRequest<S> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            offset: self.offset,
        }
    }
}

pub type PayloadTransform = Arc<dyn Fn(Bytes) -> Bytes + Send + Sync>;

pub struct DataSender<S: Schemes, K: KvStore, P: PayloadDriver<S>> {
    stores: Arc<StoreMap<S, K, P>>,
    payload_requests_theirs: Arc<HandleStore<PayloadRequest<S>>>,
    transform: Option<PayloadTransform>,
}

impl<S: Schemes, K: KvStore, P: PayloadDriver<S>> DataSender<S, K, P> {
    pub fn new(
        stores: Arc<StoreMap<S, K, P>>,
        payload_requests_theirs: Arc<HandleStore<PayloadRequest<S>>>,
        transform: Option<PayloadTransform>,
    ) -> Self {
        Self {
            stores,
            payload_requests_theirs,
            transform,
        }
    }

    fn transform_chunk(&self, chunk: Bytes) -> Bytes {
        match &self.transform {
            Some(transform) => transform(chunk),
            None => chunk,
        }
    }

    /// Messages answering a payload request the peer bound: the reply
    /// header, then the payload from the requested offset.
    pub async fn queue_payload_request(
        &self,
        handle: u64,
        chunk_size: usize,
    ) -> Result<Vec<Message<S>>> {
        let request = self
            .payload_requests_theirs
            .get(handle)
            .ok_or_else(|| SyncError::protocol("payload reply cites an unbound request"))?;
        let store = self
            .stores
            .get(&request.entry.namespace_id)
            .ok_or_else(|| SyncError::protocol("payload request for an unknown namespace"))?;
        let payload = store
            .payload(&request.entry.payload_digest)
            .await?
            .ok_or_else(|| {
                SyncError::protocol("payload request for a payload this peer never offered")
            })?;

        let mut messages = vec![Message::DataReplyPayload { handle }];
        for chunk in payload.chunks(request.offset, chunk_size) {
            let chunk = self.transform_chunk(chunk);
            messages.push(Message::DataSendPayload {
                amount: chunk.len() as u64,
                bytes: chunk,
            });
        }
        trace!(handle, chunks = messages.len() - 1, "queued payload reply");
        Ok(messages)
    }

    /// Messages pushing one entry to the peer: the entry header, then any
    /// locally-held payload bytes from `offset`.
    pub async fn queue_entry(
        &self,
        entry: SchemeEntry<S>,
        static_token_handle: u64,
        dynamic_token: S::DynamicToken,
        offset: u64,
        chunk_size: usize,
    ) -> Result<Vec<Message<S>>> {
        let store = self
            .stores
            .get(&entry.namespace_id)
            .ok_or_else(|| SyncError::protocol("entry push for an unknown namespace"))?;
        let payload = store.payload(&entry.payload_digest).await?;

        let mut messages = vec![Message::DataSendEntry {
            entry,
            offset,
            static_token_handle,
            dynamic_token,
        }];
        if let Some(payload) = payload {
            for chunk in payload.chunks(offset, chunk_size) {
                let chunk = self.transform_chunk(chunk);
                messages.push(Message::DataSendPayload {
                    amount: chunk.len() as u64,
                    bytes: chunk,
                });
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osier_common::testing::{id8, TestSchemes};
    use osier_common::Path;
    use osier_storage::{MemoryKv, MemoryPayloadDriver, SetInput, Store};

    async fn fixtures() -> (
        Arc<StoreMap<TestSchemes, MemoryKv, MemoryPayloadDriver<TestSchemes>>>,
        SchemeEntry<TestSchemes>,
    ) {
        let store = Store::new(
            id8("family"),
            Arc::new(MemoryKv::new()),
            MemoryPayloadDriver::new(),
        )
        .await
        .unwrap();
        let event = store
            .set(
                SetInput {
                    subspace: id8("gemma"),
                    path: Path::new([b"p".to_vec()]),
                    payload: Bytes::from_static(b"0123456789"),
                    timestamp: Some(5),
                },
                &id8("gemma"),
            )
            .await
            .unwrap();
        let osier_storage::IngestEvent::Success { entry, .. } = event else {
            panic!("expected success");
        };
        let stores = Arc::new(StoreMap::new());
        stores.insert(Arc::new(store));
        (stores, entry)
    }

    #[tokio::test]
    async fn payload_replies_chunk_from_the_offset() {
        let (stores, entry) = fixtures().await;
        let requests = Arc::new(HandleStore::new());
        let handle = requests.bind(PayloadRequest {
            entry: entry.clone(),
            offset: 4,
        });
        let sender = DataSender::new(stores, requests, None);
        let messages = sender.queue_payload_request(handle, 4).await.unwrap();
        assert!(matches!(messages[0], Message::DataReplyPayload { .. }));
        let chunks: Vec<&Bytes> = messages[1..]
            .iter()
            .map(|message| match message {
                Message::DataSendPayload { bytes, .. } => bytes,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(chunks, vec![&Bytes::from_static(b"4567"), &Bytes::from_static(b"89")]);
    }

    #[tokio::test]
    async fn transform_applies_to_every_chunk() {
        let (stores, entry) = fixtures().await;
        let requests = Arc::new(HandleStore::new());
        let handle = requests.bind(PayloadRequest { entry, offset: 0 });
        let transform: PayloadTransform = Arc::new(|chunk: Bytes| {
            Bytes::from(chunk.iter().map(|b| b ^ 0xff).collect::<Vec<u8>>())
        });
        let sender = DataSender::new(stores, requests, Some(transform));
        let messages = sender.queue_payload_request(handle, 64).await.unwrap();
        let Message::DataSendPayload { bytes, .. } = &messages[1] else {
            panic!("expected a payload chunk");
        };
        assert_eq!(bytes[0], b'0' ^ 0xff);
    }

    #[tokio::test]
    async fn unbound_request_handles_are_protocol_errors() {
        let (stores, _) = fixtures().await;
        let sender = DataSender::new(stores, Arc::new(HandleStore::new()), None);
        assert!(sender.queue_payload_request(5, 16).await.is_err());
    }
}
