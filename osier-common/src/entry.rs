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

//! Entries, the atomic unit of the data model.

use crate::code::{CodeError, Decode, Encode, Reader};
use crate::path::Path;
use crate::Timestamp;

/// An entry in a namespace: a 3-D location `(subspace, path, timestamp)`
/// plus the digest and length of the payload stored there.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entry<N, S, D> {
    pub namespace_id: N,
    pub subspace_id: S,
    pub path: Path,
    pub timestamp: Timestamp,
    pub payload_length: u64,
    pub payload_digest: D,
}

impl<N, S, D: Ord> Entry<N, S, D> {
    /// Total tie-break order between entries at the same `(namespace,
    /// subspace, path)`: later timestamp wins, then greater digest, then
    /// greater payload length. Equal entries are not newer than each other.
    pub fn is_newer_than(&self, other: &Self) -> bool {
        (
            self.timestamp,
            &self.payload_digest,
            self.payload_length,
        ) > (
            other.timestamp,
            &other.payload_digest,
            other.payload_length,
        )
    }
}

impl<N: Encode, S: Encode, D: Encode> Encode for Entry<N, S, D> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.namespace_id.encode(out);
        self.subspace_id.encode(out);
        self.path.encode(out);
        self.timestamp.encode(out);
        self.payload_length.encode(out);
        self.payload_digest.encode(out);
    }
}

impl<N: Decode, S: Decode, D: Decode> Decode for Entry<N, S, D> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodeError> {
        Ok(Self {
            namespace_id: N::decode(reader)?,
            subspace_id: S::decode(reader)?,
            path: Path::decode(reader)?,
            timestamp: Timestamp::decode(reader)?,
            payload_length: u64::decode(reader)?,
            payload_digest: D::decode(reader)?,
        })
    }
}

/// An entry together with how many of its payload bytes the holder actually
/// has, which may be less than `payload_length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthyEntry<N, S, D> {
    pub entry: Entry<N, S, D>,
    pub available: u64,
}

impl<N, S, D> LengthyEntry<N, S, D> {
    pub fn new(entry: Entry<N, S, D>, available: u64) -> Self {
        Self { entry, available }
    }

    pub fn is_fully_available(&self) -> bool {
        self.available == self.entry.payload_length
    }
}

impl<N: Encode, S: Encode, D: Encode> Encode for LengthyEntry<N, S, D> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.entry.encode(out);
        self.available.encode(out);
    }
}

impl<N: Decode, S: Decode, D: Decode> Decode for LengthyEntry<N, S, D> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodeError> {
        Ok(Self {
            entry: Entry::decode(reader)?,
            available: u64::decode(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(timestamp: u64, digest: u8, length: u64) -> Entry<u8, u8, [u8; 4]> {
        Entry {
            namespace_id: 0,
            subspace_id: 0,
            path: Path::empty(),
            timestamp,
            payload_length: length,
            payload_digest: [digest; 4],
        }
    }

    #[test]
    fn newer_prefers_timestamp_then_digest_then_length() {
        assert!(entry(2, 0, 0).is_newer_than(&entry(1, 9, 9)));
        assert!(entry(1, 2, 0).is_newer_than(&entry(1, 1, 9)));
        assert!(entry(1, 1, 2).is_newer_than(&entry(1, 1, 1)));
        assert!(!entry(1, 1, 1).is_newer_than(&entry(1, 1, 1)));
    }
}
