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

//! Content-addressed payload storage.
//!
//! Complete blobs are keyed by their digest. Incoming blobs may arrive in
//! pieces: `receive` assembles bytes in a staging area keyed by the
//! *expected* digest and hands back a two-phase receipt. Until a receipt is
//! committed as complete, nothing is visible to `get`.

use std::future::Future;

use bytes::Bytes;
use osier_common::Schemes;

use crate::error::{Result, StorageError};

mod fs;
mod memory;

pub use fs::FsPayloadDriver;
pub use memory::MemoryPayloadDriver;

/// A complete payload held by a driver.
#[derive(Debug, Clone)]
pub struct Payload {
    bytes: Bytes,
}

impl Payload {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn length(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn bytes_from(&self, offset: u64) -> Bytes {
        let offset = (offset as usize).min(self.bytes.len());
        self.bytes.slice(offset..)
    }

    /// The payload from `offset` onward, in chunks of at most `chunk_size`
    /// bytes.
    pub fn chunks(&self, offset: u64, chunk_size: usize) -> impl Iterator<Item = Bytes> + '_ {
        let remainder = self.bytes_from(offset);
        let chunk_size = chunk_size.max(1);
        let count = remainder.len().div_ceil(chunk_size);
        (0..count).map(move |i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(remainder.len());
            remainder.slice(start..end)
        })
    }
}

pub trait PayloadDriver<S: Schemes>: Send + Sync + 'static {
    type Receipt: PayloadReceipt<S>;

    fn get(
        &self,
        digest: &S::PayloadDigest,
    ) -> impl Future<Output = Result<Option<Payload>>> + Send;

    /// Stored length of the complete blob, 0 when absent.
    fn length(&self, digest: &S::PayloadDigest) -> impl Future<Output = Result<u64>> + Send;

    /// Hash and store a complete blob.
    fn set(&self, bytes: Bytes) -> impl Future<Output = Result<(S::PayloadDigest, u64)>> + Send;

    /// Append `bytes` at `offset` to the staged partial for
    /// `expected_digest` and return a receipt over the assembled bytes.
    /// Offsets at or below the staged length are accepted (the overlap is a
    /// duplicate and is dropped); offsets beyond it are an error. Nothing
    /// is persisted until the receipt is resolved.
    fn receive(
        &self,
        bytes: Bytes,
        offset: u64,
        expected_length: u64,
        expected_digest: &S::PayloadDigest,
    ) -> impl Future<Output = Result<Self::Receipt>> + Send;

    /// Drop a complete blob. `false` when it was not stored.
    fn erase(&self, digest: &S::PayloadDigest) -> impl Future<Output = Result<bool>> + Send;
}

/// Second phase of [`PayloadDriver::receive`].
///
/// `commit(true)` promotes the assembled bytes to the complete store,
/// `commit(false)` keeps them staged, `reject` discards the staged partial.
/// Dropping a receipt unresolved leaves the staging area untouched.
pub trait PayloadReceipt<S: Schemes>: Send {
    /// Digest over the assembled bytes so far.
    fn digest(&self) -> &S::PayloadDigest;

    /// Length of the assembled bytes so far.
    fn length(&self) -> u64;

    fn commit(self, is_complete: bool) -> impl Future<Output = Result<()>> + Send;

    fn reject(self) -> impl Future<Output = Result<()>> + Send;
}

/// Splice `bytes` at `offset` into the staged prefix, tolerating duplicate
/// delivery of already-staged ranges.
pub(crate) fn assemble(staged: &mut Vec<u8>, bytes: &[u8], offset: u64) -> Result<()> {
    let staged_len = staged.len() as u64;
    if offset > staged_len {
        return Err(StorageError::PayloadOffset {
            offset,
            staged: staged_len,
        });
    }
    let skip = (staged_len - offset) as usize;
    if skip < bytes.len() {
        staged.extend_from_slice(&bytes[skip..]);
    }
    Ok(())
}
