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

//! The three-dimensional entry index.
//!
//! Each entry is stored under three composite keys, one per dimension
//! ordering, so that any query order is a single range scan over the
//! engine. Summaries fold the scheme's fingerprint monoid over a scan;
//! splitting picks a boundary out of the same scan.

use std::marker::PhantomData;
use std::sync::Arc;

use itertools::Itertools;
use osier_common::{
    End, Entry, LengthyEntry, Path, Range3d, Schemes, SortedEncode, Timestamp,
};
use tracing::trace;

use super::{EntryRecord, SchemeEntry};
use crate::error::{Result, StorageError};
use crate::keys::{self, ParsedKey};
use crate::kv::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrder {
    Subspace,
    Path,
    Timestamp,
}

/// A range plus caps on how much of it a query wants. Zero means uncapped.
pub struct RangeOfInterest<S: Schemes> {
    pub range: Range3d<S::SubspaceId>,
    pub max_count: u64,
    pub max_size: u64,
}

impl<S: Schemes> RangeOfInterest<S> {
    pub fn uncapped(range: Range3d<S::SubspaceId>) -> Self {
        Self {
            range,
            max_count: 0,
            max_size: 0,
        }
    }
}

pub struct Summary<S: Schemes> {
    pub fingerprint: S::Fingerprint,
    pub size: u64,
}

pub struct Storage3d<S: Schemes, K> {
    namespace: S::NamespaceId,
    kv: Arc<K>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Schemes, K: KvStore> Storage3d<S, K> {
    pub fn new(namespace: S::NamespaceId, kv: Arc<K>) -> Self {
        Self {
            namespace,
            kv,
            _marker: PhantomData,
        }
    }

    pub fn namespace(&self) -> &S::NamespaceId {
        &self.namespace
    }

    fn entry_keys(&self, subspace: &S::SubspaceId, path: &Path, time: Timestamp) -> [Vec<u8>; 3] {
        [
            keys::spt_key::<S>(subspace, path, time),
            keys::pst_key::<S>(subspace, path, time),
            keys::tsp_key::<S>(subspace, path, time),
        ]
    }

    pub fn insert(
        &self,
        entry: &SchemeEntry<S>,
        available: u64,
        auth_digest: &S::PayloadDigest,
    ) -> Result<()> {
        let record = EntryRecord::<S> {
            payload_digest: entry.payload_digest.clone(),
            payload_length: entry.payload_length,
            available,
            auth_digest: auth_digest.clone(),
        };
        let value = record.encode();
        for key in self.entry_keys(&entry.subspace_id, &entry.path, entry.timestamp) {
            self.kv.put(&key, value.clone())?;
        }
        Ok(())
    }

    pub fn remove(&self, subspace: &S::SubspaceId, path: &Path) -> Result<Option<EntryRecord<S>>> {
        let Some((entry, record)) = self.get(subspace, path)? else {
            return Ok(None);
        };
        for key in self.entry_keys(subspace, path, entry.timestamp) {
            self.kv.delete(&key)?;
        }
        Ok(Some(record))
    }

    pub fn get(
        &self,
        subspace: &S::SubspaceId,
        path: &Path,
    ) -> Result<Option<(SchemeEntry<S>, EntryRecord<S>)>> {
        let mut prefix = vec![keys::TAG_SPT];
        subspace.write_sorted(&mut prefix);
        keys::push_escaped_path(&mut prefix, path);
        let (start, end) = keys::prefix_bounds(&prefix);
        for (key, value) in self.kv.scan(&start, &end, false)? {
            // Extensions of `path` share the prefix; the exact cell is the
            // key with only the timestamp after it.
            if key.len() != prefix.len() + 8 {
                continue;
            }
            let parsed = keys::parse_entry_key::<S>(&key)?;
            let record = EntryRecord::<S>::decode(&value)?;
            return Ok(Some((self.build_entry(&parsed, &record), record)));
        }
        Ok(None)
    }

    fn build_entry(&self, parsed: &ParsedKey<S>, record: &EntryRecord<S>) -> SchemeEntry<S> {
        Entry {
            namespace_id: self.namespace.clone(),
            subspace_id: parsed.subspace.clone(),
            path: parsed.path.clone(),
            timestamp: parsed.time,
            payload_length: record.payload_length,
            payload_digest: record.payload_digest.clone(),
        }
    }

    fn scan_bounds(range: &Range3d<S::SubspaceId>, order: QueryOrder) -> (Vec<u8>, Vec<u8>) {
        match order {
            QueryOrder::Subspace => {
                let mut start = vec![keys::TAG_SPT];
                range.subspaces.start.write_sorted(&mut start);
                let end = match &range.subspaces.end {
                    End::Closed(subspace) => {
                        let mut end = vec![keys::TAG_SPT];
                        subspace.write_sorted(&mut end);
                        end
                    }
                    End::Open => vec![keys::TAG_SPT + 1],
                };
                (start, end)
            }
            QueryOrder::Path => {
                let mut start = vec![keys::TAG_PST];
                keys::push_escaped_path(&mut start, &range.paths.start);
                let end = match &range.paths.end {
                    End::Closed(path) => {
                        let mut end = vec![keys::TAG_PST];
                        keys::push_escaped_path(&mut end, path);
                        end
                    }
                    End::Open => vec![keys::TAG_PST + 1],
                };
                (start, end)
            }
            QueryOrder::Timestamp => {
                let mut start = vec![keys::TAG_TSP];
                start.extend_from_slice(&range.times.start.to_be_bytes());
                let end = match &range.times.end {
                    End::Closed(time) => {
                        let mut end = vec![keys::TAG_TSP];
                        end.extend_from_slice(&time.to_be_bytes());
                        end
                    }
                    End::Open => vec![keys::TAG_TSP + 1],
                };
                (start, end)
            }
        }
    }

    /// All entries in the range of interest, in the given order, with their
    /// records. Caps apply in iteration order.
    pub fn query(
        &self,
        interest: &RangeOfInterest<S>,
        order: QueryOrder,
        reverse: bool,
    ) -> Result<Vec<(LengthyEntry<S::NamespaceId, S::SubspaceId, S::PayloadDigest>, EntryRecord<S>)>>
    {
        let range = &interest.range;
        let (start, end) = Self::scan_bounds(range, order);
        let mut hits = Vec::new();
        let mut total_size: u64 = 0;
        for (key, value) in self.kv.scan(&start, &end, reverse)? {
            let parsed = keys::parse_entry_key::<S>(&key)?;
            if !range.subspaces.includes(&parsed.subspace)
                || !range.paths.includes(&parsed.path)
                || !range.times.includes(&parsed.time)
            {
                continue;
            }
            let record = EntryRecord::<S>::decode(&value)?;
            if interest.max_count > 0 && hits.len() as u64 >= interest.max_count {
                break;
            }
            if interest.max_size > 0 && total_size + record.payload_length > interest.max_size {
                break;
            }
            total_size += record.payload_length;
            let entry = self.build_entry(&parsed, &record);
            hits.push((LengthyEntry::new(entry, record.available), record));
        }
        Ok(hits)
    }

    /// Fold the fingerprint monoid over the range.
    pub fn summarise(&self, range: &Range3d<S::SubspaceId>) -> Result<Summary<S>> {
        let mut pre = S::fingerprint_neutral();
        let mut size = 0u64;
        let interest = RangeOfInterest::<S>::uncapped(range.clone());
        for (lengthy, _) in self.query(&interest, QueryOrder::Subspace, false)? {
            pre = S::fingerprint_combine(&pre, &S::fingerprint_singleton(&lengthy));
            size += 1;
        }
        trace!(size, "summarised range");
        Ok(Summary {
            fingerprint: S::fingerprint_finalise(&pre),
            size,
        })
    }

    /// Split the range into two halves holding roughly equal entry counts.
    ///
    /// The boundary is the subspace-run edge closest to the median when the
    /// range spans several subspaces; otherwise the median path, which
    /// always exists because paths are unique within one subspace.
    pub fn split_range(
        &self,
        range: &Range3d<S::SubspaceId>,
        known_size: u64,
    ) -> Result<(Range3d<S::SubspaceId>, Range3d<S::SubspaceId>)> {
        let interest = RangeOfInterest::<S>::uncapped(range.clone());
        let locations = self
            .query(&interest, QueryOrder::Subspace, false)?
            .into_iter()
            .map(|(lengthy, _)| (lengthy.entry.subspace_id, lengthy.entry.path))
            .collect_vec();
        if locations.len() < 2 {
            return Err(StorageError::corruption(format!(
                "cannot split a range of {} entries (summarised as {known_size})",
                locations.len(),
            )));
        }
        let mid = locations.len() / 2;

        // Subspace-run boundaries: indices where the subspace changes.
        let mut best: Option<usize> = None;
        for index in 1..locations.len() {
            if locations[index].0 != locations[index - 1].0 {
                let better = match best {
                    Some(current) => index.abs_diff(mid) < current.abs_diff(mid),
                    None => true,
                };
                if better {
                    best = Some(index);
                }
            }
        }
        if let Some(boundary) = best {
            let split = locations[boundary].0.clone();
            let mut left = range.clone();
            left.subspaces.end = End::Closed(split.clone());
            let mut right = range.clone();
            right.subspaces.start = split;
            return Ok((left, right));
        }

        // One subspace: the scan is path-ordered and paths are distinct.
        let split = locations[mid].1.clone();
        debug_assert_ne!(split, locations[0].1);
        let mut left = range.clone();
        left.paths.end = End::Closed(split.clone());
        let mut right = range.clone();
        right.paths.start = split;
        Ok((left, right))
    }

    /// Refresh the recorded availability after payload bytes arrive.
    pub fn update_available(
        &self,
        subspace: &S::SubspaceId,
        path: &Path,
        available: u64,
    ) -> Result<bool> {
        let Some((entry, mut record)) = self.get(subspace, path)? else {
            return Ok(false);
        };
        record.available = available;
        let value = record.encode();
        for key in self.entry_keys(subspace, path, entry.timestamp) {
            self.kv.put(&key, value.clone())?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use osier_common::testing::{id8, TestPayloadHasher, TestSchemes};
    use osier_common::{PayloadHasher, Range};

    fn storage() -> Storage3d<TestSchemes, MemoryKv> {
        Storage3d::new(id8("ns"), Arc::new(MemoryKv::new()))
    }

    fn path(components: &[&[u8]]) -> Path {
        Path::new(components.iter().map(|c| c.to_vec()))
    }

    fn entry(subspace: &str, p: &Path, time: u64) -> SchemeEntry<TestSchemes> {
        Entry {
            namespace_id: id8("ns"),
            subspace_id: id8(subspace),
            path: p.clone(),
            timestamp: time,
            payload_length: 4,
            payload_digest: TestPayloadHasher::digest_of(p.components().first().map_or(b"" as &[u8], |c| c)),
        }
    }

    fn insert(storage: &Storage3d<TestSchemes, MemoryKv>, e: &SchemeEntry<TestSchemes>) {
        let auth = TestPayloadHasher::digest_of(b"auth");
        storage.insert(e, 0, &auth).unwrap();
    }

    #[test]
    fn get_ignores_extensions() {
        let s = storage();
        insert(&s, &entry("alfie", &path(&[b"a"]), 1));
        insert(&s, &entry("alfie", &path(&[b"a", b"b"]), 2));
        let (found, _) = s.get(&id8("alfie"), &path(&[b"a"])).unwrap().unwrap();
        assert_eq!(found.path, path(&[b"a"]));
        assert_eq!(found.timestamp, 1);
        assert!(s.get(&id8("alfie"), &path(&[b"z"])).unwrap().is_none());
    }

    #[test]
    fn query_orders_and_caps() {
        let s = storage();
        insert(&s, &entry("betty", &path(&[b"b"]), 10));
        insert(&s, &entry("alfie", &path(&[b"z"]), 30));
        insert(&s, &entry("alfie", &path(&[b"a"]), 20));

        let all = RangeOfInterest::<TestSchemes>::uncapped(Range3d::full());
        let by_time: Vec<u64> = s
            .query(&all, QueryOrder::Timestamp, false)
            .unwrap()
            .iter()
            .map(|(l, _)| l.entry.timestamp)
            .collect();
        assert_eq!(by_time, vec![10, 20, 30]);

        let by_path: Vec<Path> = s
            .query(&all, QueryOrder::Path, false)
            .unwrap()
            .iter()
            .map(|(l, _)| l.entry.path.clone())
            .collect();
        assert_eq!(by_path, vec![path(&[b"a"]), path(&[b"b"]), path(&[b"z"])]);

        let capped = RangeOfInterest::<TestSchemes> {
            range: Range3d::full(),
            max_count: 2,
            max_size: 0,
        };
        assert_eq!(s.query(&capped, QueryOrder::Timestamp, false).unwrap().len(), 2);

        let sized = RangeOfInterest::<TestSchemes> {
            range: Range3d::full(),
            max_count: 0,
            max_size: 5,
        };
        // Each payload is 4 bytes; a 5-byte budget admits exactly one.
        assert_eq!(s.query(&sized, QueryOrder::Timestamp, false).unwrap().len(), 1);
    }

    #[test]
    fn summarise_matches_entry_count_and_commutes() {
        let s1 = storage();
        let s2 = storage();
        let entries = [
            entry("alfie", &path(&[b"a"]), 1),
            entry("alfie", &path(&[b"b"]), 2),
            entry("betty", &path(&[b"c"]), 3),
        ];
        for e in &entries {
            insert(&s1, e);
        }
        for e in entries.iter().rev() {
            insert(&s2, e);
        }
        let full = Range3d::full();
        let a = s1.summarise(&full).unwrap();
        let b = s2.summarise(&full).unwrap();
        assert_eq!(a.size, 3);
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn split_prefers_subspace_boundary() {
        let s = storage();
        for i in 0..4u8 {
            insert(&s, &entry("alfie", &path(&[&[i]]), u64::from(i)));
        }
        for i in 0..4u8 {
            insert(&s, &entry("betty", &path(&[&[i]]), u64::from(i)));
        }
        let full = Range3d::full();
        let (left, right) = s.split_range(&full, 8).unwrap();
        let left_size = s.summarise(&left).unwrap().size;
        let right_size = s.summarise(&right).unwrap().size;
        assert_eq!(left_size + right_size, 8);
        assert!(left_size >= 1 && right_size >= 1);
        assert_eq!(left_size, 4);
    }

    #[test]
    fn split_single_subspace_uses_paths() {
        let s = storage();
        for i in 0..5u8 {
            insert(&s, &entry("alfie", &path(&[&[i]]), 7));
        }
        let full = Range3d::full();
        let (left, right) = s.split_range(&full, 5).unwrap();
        let left_size = s.summarise(&left).unwrap().size;
        let right_size = s.summarise(&right).unwrap().size;
        assert_eq!(left_size + right_size, 5);
        assert!(left_size >= 1 && right_size >= 1);
    }

    #[test]
    fn update_available_rewrites_all_orderings() {
        let s = storage();
        let e = entry("alfie", &path(&[b"a"]), 5);
        insert(&s, &e);
        assert!(s.update_available(&id8("alfie"), &path(&[b"a"]), 4).unwrap());
        let all = RangeOfInterest::<TestSchemes>::uncapped(Range3d::full());
        for order in [QueryOrder::Subspace, QueryOrder::Path, QueryOrder::Timestamp] {
            let hits = s.query(&all, order, false).unwrap();
            assert_eq!(hits[0].0.available, 4);
        }
        let narrow = Range3d {
            subspaces: Range::new(id8("alfie"), End::Closed(id8("alfif"))),
            paths: Range::open(Path::empty()),
            times: Range::full_time(),
        };
        assert_eq!(s.summarise(&narrow).unwrap().size, 1);
    }
}
