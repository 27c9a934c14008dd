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

//! The entry driver: every index structure a [`Store`](crate::store::Store)
//! mutates, bundled over one key-value engine.

use std::hash::Hasher;
use std::marker::PhantomData;
use std::sync::Arc;

use osier_common::{CodeError, Decode, Encode, Entry, Path, Reader, Schemes, Timestamp};
use twox_hash::XxHash64;

use crate::error::{Result, StorageError};
use crate::keys;
use crate::kv::KvStore;

mod storage3d;
pub use storage3d::{QueryOrder, RangeOfInterest, Storage3d, Summary};

pub type SchemeEntry<S> =
    Entry<<S as Schemes>::NamespaceId, <S as Schemes>::SubspaceId, <S as Schemes>::PayloadDigest>;

/// The value stored under each of an entry's three index keys.
pub struct EntryRecord<S: Schemes> {
    pub payload_digest: S::PayloadDigest,
    pub payload_length: u64,
    /// Payload bytes held locally, `<= payload_length`.
    pub available: u64,
    /// Digest of the encoded authorisation token in the payload store.
    pub auth_digest: S::PayloadDigest,
}

impl<S: Schemes> std::fmt::Debug for EntryRecord<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryRecord")
            .field("payload_digest", &self.payload_digest)
            .field("payload_length", &self.payload_length)
            .field("available", &self.available)
            .field("auth_digest", &self.auth_digest)
            .finish()
    }
}

impl<S: Schemes> Clone for EntryRecord<S> {
    fn clone(&self) -> Self {
        Self {
            payload_digest: self.payload_digest.clone(),
            payload_length: self.payload_length,
            available: self.available,
            auth_digest: self.auth_digest.clone(),
        }
    }
}

impl<S: Schemes> PartialEq for EntryRecord<S> {
    fn eq(&self, other: &Self) -> bool {
        self.payload_digest == other.payload_digest
            && self.payload_length == other.payload_length
            && self.available == other.available
            && self.auth_digest == other.auth_digest
    }
}

impl<S: Schemes> EntryRecord<S> {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.payload_digest.encode(&mut out);
        self.payload_length.encode(&mut out);
        self.available.encode(&mut out);
        self.auth_digest.encode(&mut out);
        out
    }

    fn decode(bytes: &[u8]) -> std::result::Result<Self, CodeError> {
        let mut reader = Reader::new(bytes);
        let record = Self {
            payload_digest: S::PayloadDigest::decode(&mut reader)?,
            payload_length: u64::decode(&mut reader)?,
            available: u64::decode(&mut reader)?,
            auth_digest: S::PayloadDigest::decode(&mut reader)?,
        };
        if !reader.is_empty() {
            return Err(CodeError::Invalid("trailing bytes in entry record"));
        }
        Ok(record)
    }
}

fn checksum(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

const WAL_INSERTION: u8 = 0x00;
const WAL_REMOVAL: u8 = 0x01;

/// Records the entry about to be inserted or removed before the index
/// mutation happens, so that a crash in between is recoverable. At most one
/// operation is in flight per store; recovery replays exactly one.
pub struct WriteAheadFlag<S: Schemes, K> {
    kv: Arc<K>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Schemes, K: KvStore> WriteAheadFlag<S, K> {
    pub fn new(kv: Arc<K>) -> Self {
        Self {
            kv,
            _marker: PhantomData,
        }
    }

    fn key(kind: u8) -> Vec<u8> {
        vec![keys::TAG_WAL, kind]
    }

    fn record(entry: &SchemeEntry<S>, auth_digest: &S::PayloadDigest) -> Vec<u8> {
        let mut out = Vec::new();
        entry.encode(&mut out);
        auth_digest.encode(&mut out);
        let sum = checksum(&out);
        out.extend_from_slice(&sum.to_be_bytes());
        out
    }

    fn parse(bytes: &[u8]) -> Result<(SchemeEntry<S>, S::PayloadDigest)> {
        if bytes.len() < 8 {
            return Err(StorageError::corruption("write-ahead record too short"));
        }
        let (body, sum_bytes) = bytes.split_at(bytes.len() - 8);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(sum_bytes);
        if checksum(body) != u64::from_be_bytes(raw) {
            return Err(StorageError::corruption("write-ahead record checksum mismatch"));
        }
        let mut reader = Reader::new(body);
        let entry = SchemeEntry::<S>::decode(&mut reader)?;
        let auth_digest = S::PayloadDigest::decode(&mut reader)?;
        Ok((entry, auth_digest))
    }

    pub fn flag_insertion(
        &self,
        entry: &SchemeEntry<S>,
        auth_digest: &S::PayloadDigest,
    ) -> Result<()> {
        self.kv
            .put(&Self::key(WAL_INSERTION), Self::record(entry, auth_digest))
    }

    pub fn unflag_insertion(&self) -> Result<()> {
        self.kv.delete(&Self::key(WAL_INSERTION))
    }

    pub fn flag_removal(
        &self,
        entry: &SchemeEntry<S>,
        auth_digest: &S::PayloadDigest,
    ) -> Result<()> {
        self.kv
            .put(&Self::key(WAL_REMOVAL), Self::record(entry, auth_digest))
    }

    pub fn unflag_removal(&self) -> Result<()> {
        self.kv.delete(&Self::key(WAL_REMOVAL))
    }

    pub fn was_inserting(&self) -> Result<Option<(SchemeEntry<S>, S::PayloadDigest)>> {
        match self.kv.get(&Self::key(WAL_INSERTION))? {
            Some(bytes) => Self::parse(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn was_removing(&self) -> Result<Option<(SchemeEntry<S>, S::PayloadDigest)>> {
        match self.kv.get(&Self::key(WAL_REMOVAL))? {
            Some(bytes) => Self::parse(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// Maps `(subspace, path)` to the stored entry's timestamp, so that both
/// "is there a newer entry on a prefix of mine" and "which older extensions
/// must be pruned" are cheap.
pub struct PrefixIndex<S: Schemes, K> {
    kv: Arc<K>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Schemes, K: KvStore> PrefixIndex<S, K> {
    pub fn new(kv: Arc<K>) -> Self {
        Self {
            kv,
            _marker: PhantomData,
        }
    }

    pub fn insert(&self, subspace: &S::SubspaceId, path: &Path, time: Timestamp) -> Result<()> {
        self.kv.put(
            &keys::prefix_key::<S>(subspace, path),
            time.to_be_bytes().to_vec(),
        )
    }

    pub fn remove(&self, subspace: &S::SubspaceId, path: &Path) -> Result<()> {
        self.kv.delete(&keys::prefix_key::<S>(subspace, path))
    }

    /// Proper prefixes of `path` that hold an entry, with their timestamps.
    pub fn prefixes_of(
        &self,
        subspace: &S::SubspaceId,
        path: &Path,
    ) -> Result<Vec<(Path, Timestamp)>> {
        let mut hits = Vec::new();
        for prefix in path.strict_prefixes() {
            if let Some(value) = self.kv.get(&keys::prefix_key::<S>(subspace, &prefix))? {
                hits.push((prefix, parse_time(&value)?));
            }
        }
        Ok(hits)
    }

    /// Strict extensions of `path` that hold an entry, with their
    /// timestamps.
    pub fn prefixed_by(
        &self,
        subspace: &S::SubspaceId,
        path: &Path,
    ) -> Result<Vec<(Path, Timestamp)>> {
        let base = keys::prefix_key::<S>(subspace, path);
        let (start, end) = keys::prefix_bounds(&base);
        let mut hits = Vec::new();
        for (key, value) in self.kv.scan(&start, &end, false)? {
            if key == base {
                continue;
            }
            let width = 1 + <S::SubspaceId as osier_common::SortedEncode>::WIDTH;
            let stored = keys::unescape_path(&key[width..])?;
            hits.push((stored, parse_time(&value)?));
        }
        Ok(hits)
    }
}

fn parse_time(value: &[u8]) -> Result<Timestamp> {
    let raw: [u8; 8] = value
        .try_into()
        .map_err(|_| StorageError::corruption("prefix index value is not a timestamp"))?;
    Ok(u64::from_be_bytes(raw))
}

/// Per-digest reference counts shared by payloads and encoded tokens.
pub struct PayloadRefCounter<S: Schemes, K> {
    kv: Arc<K>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Schemes, K: KvStore> PayloadRefCounter<S, K> {
    pub fn new(kv: Arc<K>) -> Self {
        Self {
            kv,
            _marker: PhantomData,
        }
    }

    pub fn count(&self, digest: &S::PayloadDigest) -> Result<u64> {
        match self.kv.get(&keys::refcount_key::<S>(digest))? {
            Some(value) => parse_time(&value),
            None => Ok(0),
        }
    }

    pub fn increment(&self, digest: &S::PayloadDigest) -> Result<u64> {
        let next = self.count(digest)? + 1;
        self.kv
            .put(&keys::refcount_key::<S>(digest), next.to_be_bytes().to_vec())?;
        Ok(next)
    }

    pub fn decrement(&self, digest: &S::PayloadDigest) -> Result<u64> {
        let current = self.count(digest)?;
        let Some(next) = current.checked_sub(1) else {
            return Err(StorageError::corruption(
                "decremented a zero payload reference count",
            ));
        };
        let key = keys::refcount_key::<S>(digest);
        if next == 0 {
            self.kv.delete(&key)?;
        } else {
            self.kv.put(&key, next.to_be_bytes().to_vec())?;
        }
        Ok(next)
    }
}

/// The full driver bundle over one engine.
pub struct EntryDriver<S: Schemes, K> {
    pub wal: WriteAheadFlag<S, K>,
    pub prefixes: PrefixIndex<S, K>,
    pub refcounts: PayloadRefCounter<S, K>,
    pub storage: Storage3d<S, K>,
}

impl<S: Schemes, K: KvStore> EntryDriver<S, K> {
    pub fn new(namespace: S::NamespaceId, kv: Arc<K>) -> Self {
        Self {
            wal: WriteAheadFlag::new(kv.clone()),
            prefixes: PrefixIndex::new(kv.clone()),
            refcounts: PayloadRefCounter::new(kv.clone()),
            storage: Storage3d::new(namespace, kv),
        }
    }
}
