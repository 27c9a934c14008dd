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

//! The per-namespace store.
//!
//! Ingestion enforces the prefix-pruning invariant: a newer entry whose
//! path is a prefix of older entries supersedes them, and an entry with a
//! newer entry on one of its own prefixes is refused. Mutations run under
//! one ingestion lock per store; queries scan engine snapshots without it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use osier_common::{
    Area, AreaOfInterest, Decode, Encode, End, LengthyEntry, Path, Range3d, Schemes, Timestamp,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, instrument, trace, warn};

use crate::driver::{
    EntryDriver, EntryRecord, QueryOrder, RangeOfInterest, SchemeEntry, Summary,
};
use crate::error::{Result, StorageError};
use crate::kv::KvStore;
use crate::payload::{Payload, PayloadDriver, PayloadReceipt};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// A locally authored write.
pub struct SetInput<S: Schemes> {
    pub subspace: S::SubspaceId,
    pub path: Path,
    pub payload: Bytes,
    /// Wall-clock microseconds when absent.
    pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    NewerPrefixFound,
    ObsoleteFromSameSubspace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    WrongNamespace,
    Unauthorised,
}

pub enum IngestEvent<S: Schemes> {
    Success {
        entry: SchemeEntry<S>,
        pruned: Vec<SchemeEntry<S>>,
        token: S::AuthorisationToken,
        source: Option<String>,
    },
    NoOp(NoOpReason),
    Rejected(RejectReason),
}

impl<S: Schemes> IngestEvent<S> {
    pub fn is_success(&self) -> bool {
        matches!(self, IngestEvent::Success { .. })
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self, IngestEvent::NoOp(_))
    }
}

impl<S: Schemes> std::fmt::Debug for IngestEvent<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestEvent::Success { entry, pruned, .. } => f
                .debug_struct("Success")
                .field("entry", entry)
                .field("pruned", &pruned.len())
                .finish(),
            IngestEvent::NoOp(reason) => f.debug_tuple("NoOp").field(reason).finish(),
            IngestEvent::Rejected(reason) => f.debug_tuple("Rejected").field(reason).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPayloadEvent {
    NoEntry,
    AlreadyHave,
    DataMismatch,
    Accepted { complete: bool },
}

/// Observable store mutations.
pub enum StoreEvent<S: Schemes> {
    EntryIngested {
        entry: SchemeEntry<S>,
        source: String,
    },
    EntryRemoved {
        removed: SchemeEntry<S>,
        /// The entry whose ingestion caused the removal, when one did.
        by: Option<SchemeEntry<S>>,
    },
    PayloadIngested {
        entry: SchemeEntry<S>,
    },
}

impl<S: Schemes> Clone for StoreEvent<S> {
    fn clone(&self) -> Self {
        match self {
            StoreEvent::EntryIngested { entry, source } => StoreEvent::EntryIngested {
                entry: entry.clone(),
                source: source.clone(),
            },
            StoreEvent::EntryRemoved { removed, by } => StoreEvent::EntryRemoved {
                removed: removed.clone(),
                by: by.clone(),
            },
            StoreEvent::PayloadIngested { entry } => StoreEvent::PayloadIngested {
                entry: entry.clone(),
            },
        }
    }
}

impl<S: Schemes> std::fmt::Debug for StoreEvent<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreEvent::EntryIngested { entry, source } => f
                .debug_struct("EntryIngested")
                .field("entry", entry)
                .field("source", source)
                .finish(),
            StoreEvent::EntryRemoved { removed, .. } => {
                f.debug_struct("EntryRemoved").field("removed", removed).finish()
            }
            StoreEvent::PayloadIngested { entry } => {
                f.debug_struct("PayloadIngested").field("entry", entry).finish()
            }
        }
    }
}

/// One row of a query: the entry, its token, and the payload when asked
/// for.
pub struct QueryHit<S: Schemes> {
    pub lengthy_entry: LengthyEntry<S::NamespaceId, S::SubspaceId, S::PayloadDigest>,
    pub token: S::AuthorisationToken,
    pub payload: Option<Payload>,
}

pub struct Store<S: Schemes, K: KvStore, P: PayloadDriver<S>> {
    driver: EntryDriver<S, K>,
    payloads: P,
    ingest_lock: Mutex<()>,
    events: broadcast::Sender<StoreEvent<S>>,
}

impl<S: Schemes, K: KvStore, P: PayloadDriver<S>> Store<S, K, P> {
    /// Open a store, replaying at most one write-ahead-flagged operation
    /// left behind by a crash.
    pub async fn new(namespace: S::NamespaceId, kv: Arc<K>, payloads: P) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Self {
            driver: EntryDriver::new(namespace, kv),
            payloads,
            ingest_lock: Mutex::new(()),
            events,
        };
        store.recover().await?;
        Ok(store)
    }

    pub fn namespace(&self) -> &S::NamespaceId {
        self.driver.storage.namespace()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent<S>> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent<S>) {
        let _ = self.events.send(event);
    }

    async fn recover(&self) -> Result<()> {
        if let Some((entry, _auth_digest)) = self.driver.wal.was_removing()? {
            warn!(?entry, "replaying interrupted removal");
            if let Some((stored, record)) = self
                .driver
                .storage
                .get(&entry.subspace_id, &entry.path)?
            {
                if stored == entry {
                    self.remove_stored(&stored, &record).await?;
                }
            }
            self.driver.wal.unflag_removal()?;
        }
        if let Some((entry, auth_digest)) = self.driver.wal.was_inserting()? {
            warn!(?entry, "replaying interrupted insertion");
            match self.driver.storage.get(&entry.subspace_id, &entry.path)? {
                Some((stored, _)) if stored == entry => {
                    // The index writes landed before the crash; nothing to
                    // replay.
                }
                _ => {
                    let token_bytes = self
                        .payloads
                        .get(&auth_digest)
                        .await?
                        .ok_or_else(|| {
                            StorageError::corruption("flagged insertion lost its token blob")
                        })?
                        .bytes();
                    let token = S::AuthorisationToken::decode_all(&token_bytes)?;
                    let _ = self.insert_entry(&entry, &token).await?;
                }
            }
            self.driver.wal.unflag_insertion()?;
        }
        Ok(())
    }

    /// Author an entry locally: stage the payload, build and authorise the
    /// entry, then ingest it.
    #[instrument(skip(self, input, opts))]
    pub async fn set(
        &self,
        input: SetInput<S>,
        opts: &S::AuthorisationOpts,
    ) -> Result<IngestEvent<S>> {
        let timestamp = input.timestamp.unwrap_or_else(now_micros);
        let (payload_digest, payload_length) = self.payloads.set(input.payload).await?;
        let entry = SchemeEntry::<S> {
            namespace_id: self.namespace().clone(),
            subspace_id: input.subspace,
            path: input.path,
            timestamp,
            payload_length,
            payload_digest: payload_digest.clone(),
        };
        let Some(token) = S::authorise(&entry, opts) else {
            self.erase_if_unreferenced(&payload_digest).await?;
            return Ok(IngestEvent::Rejected(RejectReason::Unauthorised));
        };
        let event = self.ingest_entry(entry, token, None).await?;
        if !event.is_success() {
            self.erase_if_unreferenced(&payload_digest).await?;
        }
        Ok(event)
    }

    async fn erase_if_unreferenced(&self, digest: &S::PayloadDigest) -> Result<()> {
        if self.driver.refcounts.count(digest)? == 0 {
            let _ = self.payloads.erase(digest).await?;
        }
        Ok(())
    }

    /// Ingest an entry, locally authored or remote.
    #[instrument(skip(self, entry, token, source), fields(timestamp = entry.timestamp))]
    pub async fn ingest_entry(
        &self,
        entry: SchemeEntry<S>,
        token: S::AuthorisationToken,
        source: Option<String>,
    ) -> Result<IngestEvent<S>> {
        let _guard = self.ingest_lock.lock().await;

        if entry.namespace_id != *self.namespace() {
            return Ok(IngestEvent::Rejected(RejectReason::WrongNamespace));
        }
        if !S::is_authorised_write(&entry, &token) {
            return Ok(IngestEvent::Rejected(RejectReason::Unauthorised));
        }

        // A same-or-newer entry on a prefix of this path supersedes it.
        for (prefix, time) in self
            .driver
            .prefixes
            .prefixes_of(&entry.subspace_id, &entry.path)?
        {
            if time >= entry.timestamp {
                trace!(?prefix, "newer prefix found");
                return Ok(IngestEvent::NoOp(NoOpReason::NewerPrefixFound));
            }
        }

        // Tie-break against the entry already at this cell, if any.
        if let Some((existing, record)) = self
            .driver
            .storage
            .get(&entry.subspace_id, &entry.path)?
        {
            let obsolete = existing.timestamp > entry.timestamp
                || (existing.timestamp == entry.timestamp
                    && entry.payload_digest < existing.payload_digest)
                || (existing.timestamp == entry.timestamp
                    && entry.payload_digest == existing.payload_digest
                    && entry.payload_length <= existing.payload_length);
            if obsolete {
                return Ok(IngestEvent::NoOp(NoOpReason::ObsoleteFromSameSubspace));
            }
            self.driver.wal.flag_removal(&existing, &record.auth_digest)?;
            self.remove_stored(&existing, &record).await?;
            self.emit(StoreEvent::EntryRemoved {
                removed: existing,
                by: Some(entry.clone()),
            });
            self.driver.wal.unflag_removal()?;
        }

        let pruned = self.insert_entry(&entry, &token).await?;
        if let Some(source) = &source {
            self.emit(StoreEvent::EntryIngested {
                entry: entry.clone(),
                source: source.clone(),
            });
        }
        Ok(IngestEvent::Success {
            entry,
            pruned,
            token,
            source,
        })
    }

    /// Write the entry into every index and prune the older entries it
    /// supersedes. Callers hold the ingestion lock.
    async fn insert_entry(
        &self,
        entry: &SchemeEntry<S>,
        token: &S::AuthorisationToken,
    ) -> Result<Vec<SchemeEntry<S>>> {
        let (auth_digest, _) = self.payloads.set(Bytes::from(token.encoded())).await?;
        self.driver.wal.flag_insertion(entry, &auth_digest)?;

        let stored = self.payloads.length(&entry.payload_digest).await?;
        let available = stored.min(entry.payload_length);
        self.driver.storage.insert(entry, available, &auth_digest)?;
        self.driver
            .prefixes
            .insert(&entry.subspace_id, &entry.path, entry.timestamp)?;
        let _ = self.driver.refcounts.increment(&entry.payload_digest)?;
        let _ = self.driver.refcounts.increment(&auth_digest)?;

        let mut pruned = Vec::new();
        for (path, time) in self
            .driver
            .prefixes
            .prefixed_by(&entry.subspace_id, &entry.path)?
        {
            if time >= entry.timestamp {
                continue;
            }
            let Some((victim, record)) = self.driver.storage.get(&entry.subspace_id, &path)?
            else {
                return Err(StorageError::corruption(
                    "prefix index references a missing entry",
                ));
            };
            self.driver.wal.flag_removal(&victim, &record.auth_digest)?;
            self.remove_stored(&victim, &record).await?;
            self.emit(StoreEvent::EntryRemoved {
                removed: victim.clone(),
                by: Some(entry.clone()),
            });
            self.driver.wal.unflag_removal()?;
            pruned.push(victim);
        }

        self.driver.wal.unflag_insertion()?;
        debug!(pruned = pruned.len(), "inserted entry");
        Ok(pruned)
    }

    /// Drop an entry from every index, releasing payload and token blobs
    /// that lose their last reference.
    async fn remove_stored(
        &self,
        entry: &SchemeEntry<S>,
        record: &EntryRecord<S>,
    ) -> Result<()> {
        let _ = self
            .driver
            .storage
            .remove(&entry.subspace_id, &entry.path)?;
        self.driver
            .prefixes
            .remove(&entry.subspace_id, &entry.path)?;
        if self.driver.refcounts.decrement(&entry.payload_digest)? == 0 {
            let _ = self.payloads.erase(&entry.payload_digest).await?;
        }
        if self.driver.refcounts.decrement(&record.auth_digest)? == 0 {
            let _ = self.payloads.erase(&record.auth_digest).await?;
        }
        Ok(())
    }

    /// Feed payload bytes for a stored entry, committing them once the full
    /// length has arrived and its digest checks out.
    #[instrument(skip(self, bytes), fields(amount = bytes.len()))]
    pub async fn ingest_payload(
        &self,
        subspace: &S::SubspaceId,
        path: &Path,
        bytes: Bytes,
        offset: u64,
    ) -> Result<IngestPayloadEvent> {
        let Some((entry, record)) = self.driver.storage.get(subspace, path)? else {
            return Ok(IngestPayloadEvent::NoEntry);
        };
        if record.available == entry.payload_length
            && self.payloads.length(&entry.payload_digest).await? == entry.payload_length
        {
            return Ok(IngestPayloadEvent::AlreadyHave);
        }

        let receipt = self
            .payloads
            .receive(bytes, offset, entry.payload_length, &entry.payload_digest)
            .await?;
        if receipt.length() > entry.payload_length {
            receipt.reject().await?;
            return Ok(IngestPayloadEvent::DataMismatch);
        }
        let complete = receipt.length() == entry.payload_length;
        if complete {
            if *receipt.digest() != entry.payload_digest {
                receipt.reject().await?;
                return Ok(IngestPayloadEvent::DataMismatch);
            }
            let length = receipt.length();
            receipt.commit(true).await?;
            let _guard = self.ingest_lock.lock().await;
            let _ = self
                .driver
                .storage
                .update_available(subspace, path, length)?;
            self.emit(StoreEvent::PayloadIngested { entry });
        } else {
            let length = receipt.length();
            receipt.commit(false).await?;
            let _guard = self.ingest_lock.lock().await;
            let _ = self
                .driver
                .storage
                .update_available(subspace, path, length)?;
        }
        Ok(IngestPayloadEvent::Accepted { complete })
    }

    pub async fn payload(&self, digest: &S::PayloadDigest) -> Result<Option<Payload>> {
        self.payloads.get(digest).await
    }

    async fn token_for(&self, record: &EntryRecord<S>) -> Result<S::AuthorisationToken> {
        let blob = self.payloads.get(&record.auth_digest).await?.ok_or_else(|| {
            StorageError::corruption("entry record references a missing token blob")
        })?;
        Ok(S::AuthorisationToken::decode_all(&blob.bytes())?)
    }

    /// Entries of an area of interest, with tokens and (when held)
    /// payloads.
    pub async fn query(
        &self,
        aoi: &AreaOfInterest<S::SubspaceId>,
        order: QueryOrder,
        reverse: bool,
    ) -> Result<Vec<QueryHit<S>>> {
        let range = self.area_of_interest_to_range(aoi)?;
        let interest = RangeOfInterest::<S> {
            range,
            max_count: aoi.max_count,
            max_size: aoi.max_size,
        };
        let rows = self.driver.storage.query(&interest, order, reverse)?;
        let mut hits = Vec::with_capacity(rows.len());
        for (lengthy_entry, record) in rows {
            let token = self.token_for(&record).await?;
            let payload = self.payloads.get(&record.payload_digest).await?;
            hits.push(QueryHit {
                lengthy_entry,
                token,
                payload,
            });
        }
        Ok(hits)
    }

    /// Entries of a range in timestamp order, oldest or newest first.
    pub async fn query_range(
        &self,
        range: &Range3d<S::SubspaceId>,
        newest_first: bool,
    ) -> Result<Vec<(LengthyEntry<S::NamespaceId, S::SubspaceId, S::PayloadDigest>, S::AuthorisationToken)>>
    {
        let interest = RangeOfInterest::<S>::uncapped(range.clone());
        let rows = self
            .driver
            .storage
            .query(&interest, QueryOrder::Timestamp, newest_first)?;
        let mut hits = Vec::with_capacity(rows.len());
        for (lengthy_entry, record) in rows {
            let token = self.token_for(&record).await?;
            hits.push((lengthy_entry, token));
        }
        Ok(hits)
    }

    pub fn summarise(&self, range: &Range3d<S::SubspaceId>) -> Result<Summary<S>> {
        self.driver.storage.summarise(range)
    }

    pub fn split_range(
        &self,
        range: &Range3d<S::SubspaceId>,
        known_size: u64,
    ) -> Result<(Range3d<S::SubspaceId>, Range3d<S::SubspaceId>)> {
        self.driver.storage.split_range(range, known_size)
    }

    pub fn entry_at(
        &self,
        subspace: &S::SubspaceId,
        path: &Path,
    ) -> Result<Option<(SchemeEntry<S>, EntryRecord<S>)>> {
        self.driver.storage.get(subspace, path)
    }

    /// The authorisation token of the entry at a cell, if one is stored.
    pub async fn token_at(
        &self,
        subspace: &S::SubspaceId,
        path: &Path,
    ) -> Result<Option<S::AuthorisationToken>> {
        match self.driver.storage.get(subspace, path)? {
            Some((_, record)) => Ok(Some(self.token_for(&record).await?)),
            None => Ok(None),
        }
    }

    /// Normalise an area of interest to the range its caps actually cover:
    /// with caps set, the time range shrinks to the newest entries that fit
    /// them.
    pub fn area_of_interest_to_range(
        &self,
        aoi: &AreaOfInterest<S::SubspaceId>,
    ) -> Result<Range3d<S::SubspaceId>> {
        let mut range = aoi.area.to_range3d();
        if aoi.max_count == 0 && aoi.max_size == 0 {
            return Ok(range);
        }
        let interest = RangeOfInterest::<S>::uncapped(range.clone());
        let newest_first = self
            .driver
            .storage
            .query(&interest, QueryOrder::Timestamp, true)?;
        let mut included = 0u64;
        let mut total_size = 0u64;
        let mut oldest = None;
        for (lengthy, _) in newest_first {
            if aoi.max_count > 0 && included >= aoi.max_count {
                break;
            }
            if aoi.max_size > 0 && total_size + lengthy.entry.payload_length > aoi.max_size {
                break;
            }
            included += 1;
            total_size += lengthy.entry.payload_length;
            oldest = Some(lengthy.entry.timestamp);
        }
        match oldest {
            Some(oldest) => range.times.start = range.times.start.max(oldest),
            None => range.times.end = End::Closed(range.times.start),
        }
        Ok(range)
    }

    /// The area covering everything this store could hold.
    pub fn full_area(&self) -> Area<S::SubspaceId> {
        Area::full()
    }
}

fn now_micros() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::WriteAheadFlag;
    use crate::kv::MemoryKv;
    use crate::payload::MemoryPayloadDriver;
    use osier_common::testing::{id8, TestPayloadHasher, TestSchemes};
    use osier_common::{AreaSubspace, PayloadHasher, Range};

    type TestStore = Store<TestSchemes, MemoryKv, MemoryPayloadDriver<TestSchemes>>;

    async fn open_store() -> TestStore {
        Store::new(
            id8("family"),
            Arc::new(MemoryKv::new()),
            MemoryPayloadDriver::new(),
        )
        .await
        .unwrap()
    }

    fn path(components: &[&[u8]]) -> Path {
        Path::new(components.iter().map(|c| c.to_vec()))
    }

    fn aoi_for(subspace: [u8; 8]) -> AreaOfInterest<[u8; 8]> {
        AreaOfInterest::uncapped(Area {
            subspace: AreaSubspace::Id(subspace),
            path_prefix: Path::empty(),
            times: Range::full_time(),
        })
    }

    async fn set(
        store: &TestStore,
        subspace: &str,
        p: &Path,
        payload: &[u8],
        timestamp: u64,
    ) -> IngestEvent<TestSchemes> {
        store
            .set(
                SetInput {
                    subspace: id8(subspace),
                    path: p.clone(),
                    payload: Bytes::copy_from_slice(payload),
                    timestamp: Some(timestamp),
                },
                &id8(subspace),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn set_and_read_back() {
        let store = open_store().await;
        let event = set(&store, "gemma", &path(&[&[0x01]]), b"hi", 100).await;
        assert!(event.is_success());

        let hits = store
            .query(&aoi_for(id8("gemma")), QueryOrder::Path, false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].lengthy_entry.entry.path, path(&[&[0x01]]));
        assert!(hits[0].lengthy_entry.is_fully_available());
        assert_eq!(
            hits[0].payload.as_ref().unwrap().bytes(),
            Bytes::from_static(b"hi")
        );
        assert_eq!(store.summarise(&Range3d::full()).unwrap().size, 1);
    }

    #[tokio::test]
    async fn newer_prefix_prunes_older_extension() {
        let store = open_store().await;
        let mut events = store.subscribe();
        let deep = path(&[&[0x01], &[0x02]]);
        let shallow = path(&[&[0x01]]);

        assert!(set(&store, "gemma", &deep, b"old", 10).await.is_success());
        let old_digest = TestPayloadHasher::digest_of(b"old");
        assert!(store.payload(&old_digest).await.unwrap().is_some());

        let event = set(&store, "gemma", &shallow, b"new", 20).await;
        let IngestEvent::Success { pruned, .. } = event else {
            panic!("expected success");
        };
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].path, deep);

        // Only the newer prefix survives, and the pruned payload is gone.
        assert_eq!(store.summarise(&Range3d::full()).unwrap().size, 1);
        assert!(store.entry_at(&id8("gemma"), &deep).unwrap().is_none());
        assert!(store.payload(&old_digest).await.unwrap().is_none());

        let mut removals = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, StoreEvent::EntryRemoved { .. }) {
                removals += 1;
            }
        }
        assert_eq!(removals, 1);
    }

    #[tokio::test]
    async fn extension_under_newer_prefix_is_refused() {
        let store = open_store().await;
        assert!(set(&store, "gemma", &path(&[&[0x01]]), b"top", 20)
            .await
            .is_success());
        let event = set(&store, "gemma", &path(&[&[0x01], &[0x02]]), b"sub", 10).await;
        assert!(matches!(
            event,
            IngestEvent::NoOp(NoOpReason::NewerPrefixFound)
        ));
        assert_eq!(store.summarise(&Range3d::full()).unwrap().size, 1);
    }

    #[tokio::test]
    async fn equal_timestamps_break_ties_on_digest() {
        // b"b" hashes above b"a" or below; order of arrival must not matter.
        let digest_a = TestPayloadHasher::digest_of(b"a");
        let digest_b = TestPayloadHasher::digest_of(b"b");
        let (lo, hi): (&[u8], &[u8]) = if digest_a < digest_b {
            (b"a", b"b")
        } else {
            (b"b", b"a")
        };
        let winner = TestPayloadHasher::digest_of(hi);

        for order in [[lo, hi], [hi, lo]] {
            let store = open_store().await;
            for payload in order {
                let _ = set(&store, "gemma", &path(&[&[0x01]]), payload, 77).await;
            }
            let (entry, _) = store
                .entry_at(&id8("gemma"), &path(&[&[0x01]]))
                .unwrap()
                .unwrap();
            assert_eq!(entry.payload_digest, winner);
            assert_eq!(store.summarise(&Range3d::full()).unwrap().size, 1);
        }
    }

    #[tokio::test]
    async fn ingesting_the_same_entry_twice_is_a_no_op() {
        let store = open_store().await;
        let event = set(&store, "gemma", &path(&[&[0x01]]), b"hi", 5).await;
        let IngestEvent::Success { entry, token, .. } = event else {
            panic!("expected success");
        };
        let repeat = store
            .ingest_entry(entry, token, Some("test".into()))
            .await
            .unwrap();
        assert!(matches!(
            repeat,
            IngestEvent::NoOp(NoOpReason::ObsoleteFromSameSubspace)
        ));
    }

    #[tokio::test]
    async fn wrong_namespace_and_bad_token_are_rejected() {
        let store = open_store().await;
        let entry = SchemeEntry::<TestSchemes> {
            namespace_id: id8("other"),
            subspace_id: id8("gemma"),
            path: path(&[&[1]]),
            timestamp: 1,
            payload_length: 0,
            payload_digest: TestPayloadHasher::digest_of(b""),
        };
        let token = TestSchemes::authorise(&entry, &id8("gemma")).unwrap();
        let event = store.ingest_entry(entry.clone(), token, None).await.unwrap();
        assert!(matches!(
            event,
            IngestEvent::Rejected(RejectReason::WrongNamespace)
        ));

        let mut home = entry;
        home.namespace_id = id8("family");
        let forged = TestSchemes::authorise(&home, &id8("gemma")).unwrap();
        let mut tampered = home.clone();
        tampered.timestamp = 2;
        let event = store.ingest_entry(tampered, forged, None).await.unwrap();
        assert!(matches!(
            event,
            IngestEvent::Rejected(RejectReason::Unauthorised)
        ));
    }

    #[tokio::test]
    async fn payload_ingestion_by_chunks() {
        let store = open_store().await;
        // Ingest the entry without its payload, as a session would.
        let payload = b"hello world";
        let digest = TestPayloadHasher::digest_of(payload);
        let entry = SchemeEntry::<TestSchemes> {
            namespace_id: id8("family"),
            subspace_id: id8("gemma"),
            path: path(&[&[9]]),
            timestamp: 4,
            payload_length: payload.len() as u64,
            payload_digest: digest,
        };
        let token = TestSchemes::authorise(&entry, &id8("gemma")).unwrap();
        assert!(store
            .ingest_entry(entry.clone(), token, Some("peer".into()))
            .await
            .unwrap()
            .is_success());

        let gemma = id8("gemma");
        let event = store
            .ingest_payload(&gemma, &entry.path, Bytes::from_static(b"hello "), 0)
            .await
            .unwrap();
        assert_eq!(event, IngestPayloadEvent::Accepted { complete: false });
        let event = store
            .ingest_payload(&gemma, &entry.path, Bytes::from_static(b"world"), 6)
            .await
            .unwrap();
        assert_eq!(event, IngestPayloadEvent::Accepted { complete: true });
        let event = store
            .ingest_payload(&gemma, &entry.path, Bytes::from_static(b"x"), 0)
            .await
            .unwrap();
        assert_eq!(event, IngestPayloadEvent::AlreadyHave);

        let stored = store.payload(&digest).await.unwrap().unwrap();
        assert_eq!(stored.bytes(), Bytes::copy_from_slice(payload));
    }

    #[tokio::test]
    async fn mismatched_payload_is_refused() {
        let store = open_store().await;
        let entry = SchemeEntry::<TestSchemes> {
            namespace_id: id8("family"),
            subspace_id: id8("gemma"),
            path: path(&[&[9]]),
            timestamp: 4,
            payload_length: 2,
            payload_digest: TestPayloadHasher::digest_of(b"ok"),
        };
        let token = TestSchemes::authorise(&entry, &id8("gemma")).unwrap();
        assert!(store
            .ingest_entry(entry.clone(), token, None)
            .await
            .unwrap()
            .is_success());
        let event = store
            .ingest_payload(&id8("gemma"), &entry.path, Bytes::from_static(b"no"), 0)
            .await
            .unwrap();
        assert_eq!(event, IngestPayloadEvent::DataMismatch);
    }

    #[tokio::test]
    async fn recovery_replays_a_flagged_insertion() {
        let kv = Arc::new(MemoryKv::new());
        let payloads = MemoryPayloadDriver::<TestSchemes>::new();

        let entry = SchemeEntry::<TestSchemes> {
            namespace_id: id8("family"),
            subspace_id: id8("gemma"),
            path: path(&[&[1]]),
            timestamp: 9,
            payload_length: 0,
            payload_digest: TestPayloadHasher::digest_of(b""),
        };
        let token = TestSchemes::authorise(&entry, &id8("gemma")).unwrap();
        // Crash just after flagging: the token blob landed in the payload
        // store, no index was touched yet.
        let (auth_digest, _) = payloads.set(Bytes::from(token.encoded())).await.unwrap();
        WriteAheadFlag::<TestSchemes, _>::new(kv.clone())
            .flag_insertion(&entry, &auth_digest)
            .unwrap();

        let store = Store::<TestSchemes, _, _>::new(id8("family"), kv, payloads)
            .await
            .unwrap();
        let (stored, _) = store
            .entry_at(&id8("gemma"), &entry.path)
            .unwrap()
            .unwrap();
        assert_eq!(stored, entry);
        // Replaying twice must not happen: the flag is cleared.
        assert_eq!(store.summarise(&Range3d::full()).unwrap().size, 1);
    }

    #[tokio::test]
    async fn refcounts_keep_shared_payloads_alive() {
        let store = open_store().await;
        // Two entries share one payload.
        assert!(set(&store, "gemma", &path(&[&[1]]), b"shared", 5)
            .await
            .is_success());
        assert!(set(&store, "gemma", &path(&[&[2]]), b"shared", 5)
            .await
            .is_success());
        let digest = TestPayloadHasher::digest_of(b"shared");

        // Pruning one of them must keep the blob.
        assert!(set(&store, "gemma", &path(&[&[1]]), b"newer", 6)
            .await
            .is_success());
        assert!(store.payload(&digest).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn prefix_invariant_holds_under_mixed_writes() {
        let store = open_store().await;
        // Writes arriving in an adversarial order: extensions before and
        // after their prefixes, replacements, a second subspace.
        let writes: &[(&str, &[&[u8]], u64)] = &[
            ("gemma", &[&[1], &[1]], 30),
            ("gemma", &[&[1]], 10),
            ("gemma", &[&[1], &[2]], 40),
            ("gemma", &[&[1]], 20),
            ("gemma", &[&[2], &[1], &[1]], 15),
            ("gemma", &[&[2]], 50),
            ("dalton", &[&[1]], 90),
            ("gemma", &[&[1], &[1], &[1]], 35),
        ];
        for (author, p, time) in writes {
            let _ = set(&store, author, &path(p), b"w", *time).await;
        }

        let aoi = AreaOfInterest::uncapped(Area::full());
        let hits = store.query(&aoi, QueryOrder::Subspace, false).await.unwrap();
        for a in &hits {
            for b in &hits {
                let (ea, eb) = (&a.lengthy_entry.entry, &b.lengthy_entry.entry);
                if ea.subspace_id == eb.subspace_id && ea.path.is_strict_prefix_of(&eb.path) {
                    // A surviving prefix is always older than its surviving
                    // extensions; otherwise the extension would have been
                    // pruned or refused.
                    assert!(
                        ea.timestamp < eb.timestamp,
                        "prefix {ea:?} should predate extension {eb:?}"
                    );
                }
            }
            // Every stored entry keeps its payload blob referenced.
            assert!(a.payload.is_some());
        }
        // The subtree under [2] was pruned by the newer write at [2].
        assert!(store
            .entry_at(&id8("gemma"), &path(&[&[2], &[1], &[1]]))
            .unwrap()
            .is_none());
        // The other subspace is untouched by gemma's churn.
        assert!(store.entry_at(&id8("dalton"), &path(&[&[1]])).unwrap().is_some());
    }

    #[tokio::test]
    async fn query_range_orders_by_time_in_both_directions() {
        let store = open_store().await;
        for (i, time) in [(1u8, 30u64), (2, 10), (3, 20)] {
            assert!(set(&store, "gemma", &path(&[&[i]]), b"x", time)
                .await
                .is_success());
        }
        let range = Range3d::full();
        let oldest: Vec<u64> = store
            .query_range(&range, false)
            .await
            .unwrap()
            .iter()
            .map(|(entry, _)| entry.entry.timestamp)
            .collect();
        assert_eq!(oldest, vec![10, 20, 30]);
        let newest: Vec<u64> = store
            .query_range(&range, true)
            .await
            .unwrap()
            .iter()
            .map(|(entry, _)| entry.entry.timestamp)
            .collect();
        assert_eq!(newest, vec![30, 20, 10]);
        // Tokens come back intact for every row.
        for (entry, token) in store.query_range(&range, false).await.unwrap() {
            assert!(TestSchemes::is_authorised_write(&entry.entry, &token));
        }
    }

    #[tokio::test]
    async fn aoi_caps_narrow_the_range_to_the_newest() {
        let store = open_store().await;
        for (i, time) in [(1u8, 10u64), (2, 20), (3, 30)] {
            assert!(set(&store, "gemma", &path(&[&[i]]), b"xx", time)
                .await
                .is_success());
        }
        let mut aoi = aoi_for(id8("gemma"));
        aoi.max_count = 2;
        let range = store.area_of_interest_to_range(&aoi).unwrap();
        assert_eq!(range.times.start, 20);
        let hits = store.query(&aoi, QueryOrder::Timestamp, false).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].lengthy_entry.entry.timestamp, 20);
    }
}
