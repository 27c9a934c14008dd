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

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use osier_common::{PayloadHasher, Schemes};
use parking_lot::RwLock;

use super::{assemble, Payload, PayloadDriver, PayloadReceipt};
use crate::error::Result;

struct Shelves<S: Schemes> {
    complete: HashMap<S::PayloadDigest, Bytes>,
    staged: HashMap<S::PayloadDigest, Vec<u8>>,
}

/// Payload storage in process memory.
pub struct MemoryPayloadDriver<S: Schemes> {
    shelves: Arc<RwLock<Shelves<S>>>,
}

impl<S: Schemes> Default for MemoryPayloadDriver<S> {
    fn default() -> Self {
        Self {
            shelves: Arc::new(RwLock::new(Shelves {
                complete: HashMap::new(),
                staged: HashMap::new(),
            })),
        }
    }
}

impl<S: Schemes> MemoryPayloadDriver<S> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S: Schemes> PayloadDriver<S> for MemoryPayloadDriver<S> {
    type Receipt = MemoryReceipt<S>;

    async fn get(&self, digest: &S::PayloadDigest) -> Result<Option<Payload>> {
        Ok(self
            .shelves
            .read()
            .complete
            .get(digest)
            .cloned()
            .map(Payload::new))
    }

    async fn length(&self, digest: &S::PayloadDigest) -> Result<u64> {
        Ok(self
            .shelves
            .read()
            .complete
            .get(digest)
            .map_or(0, |bytes| bytes.len() as u64))
    }

    async fn set(&self, bytes: Bytes) -> Result<(S::PayloadDigest, u64)> {
        let digest = S::PayloadHasher::digest_of(&bytes);
        let length = bytes.len() as u64;
        let _ = self.shelves.write().complete.insert(digest.clone(), bytes);
        Ok((digest, length))
    }

    async fn receive(
        &self,
        bytes: Bytes,
        offset: u64,
        _expected_length: u64,
        expected_digest: &S::PayloadDigest,
    ) -> Result<MemoryReceipt<S>> {
        let mut assembled = self
            .shelves
            .read()
            .staged
            .get(expected_digest)
            .cloned()
            .unwrap_or_default();
        assemble(&mut assembled, &bytes, offset)?;
        let digest = S::PayloadHasher::digest_of(&assembled);
        Ok(MemoryReceipt {
            shelves: self.shelves.clone(),
            expected_digest: expected_digest.clone(),
            digest,
            assembled,
        })
    }

    async fn erase(&self, digest: &S::PayloadDigest) -> Result<bool> {
        Ok(self.shelves.write().complete.remove(digest).is_some())
    }
}

pub struct MemoryReceipt<S: Schemes> {
    shelves: Arc<RwLock<Shelves<S>>>,
    expected_digest: S::PayloadDigest,
    digest: S::PayloadDigest,
    assembled: Vec<u8>,
}

impl<S: Schemes> PayloadReceipt<S> for MemoryReceipt<S> {
    fn digest(&self) -> &S::PayloadDigest {
        &self.digest
    }

    fn length(&self) -> u64 {
        self.assembled.len() as u64
    }

    async fn commit(self, is_complete: bool) -> Result<()> {
        let mut shelves = self.shelves.write();
        if is_complete {
            let _ = shelves.staged.remove(&self.expected_digest);
            let _ = shelves
                .complete
                .insert(self.digest, Bytes::from(self.assembled));
        } else {
            let _ = shelves.staged.insert(self.expected_digest, self.assembled);
        }
        Ok(())
    }

    async fn reject(self) -> Result<()> {
        let _ = self.shelves.write().staged.remove(&self.expected_digest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osier_common::testing::{TestPayloadHasher, TestSchemes};

    #[tokio::test]
    async fn staged_bytes_stay_invisible_until_complete() {
        let driver = MemoryPayloadDriver::<TestSchemes>::new();
        let expected = TestPayloadHasher::digest_of(b"hello");

        let receipt = driver
            .receive(Bytes::from_static(b"hel"), 0, 5, &expected)
            .await
            .unwrap();
        assert_eq!(receipt.length(), 3);
        receipt.commit(false).await.unwrap();
        assert!(driver.get(&expected).await.unwrap().is_none());

        let receipt = driver
            .receive(Bytes::from_static(b"llo"), 2, 5, &expected)
            .await
            .unwrap();
        assert_eq!(receipt.length(), 5);
        assert_eq!(*receipt.digest(), expected);
        receipt.commit(true).await.unwrap();
        let payload = driver.get(&expected).await.unwrap().unwrap();
        assert_eq!(payload.bytes(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn reject_discards_the_partial() {
        let driver = MemoryPayloadDriver::<TestSchemes>::new();
        let expected = TestPayloadHasher::digest_of(b"xy");
        let receipt = driver
            .receive(Bytes::from_static(b"x"), 0, 2, &expected)
            .await
            .unwrap();
        receipt.commit(false).await.unwrap();
        let receipt = driver
            .receive(Bytes::from_static(b"y"), 1, 2, &expected)
            .await
            .unwrap();
        receipt.reject().await.unwrap();
        // Staging is empty again: a fresh receive starts from offset zero.
        let receipt = driver
            .receive(Bytes::from_static(b"x"), 0, 2, &expected)
            .await
            .unwrap();
        assert_eq!(receipt.length(), 1);
    }

    #[tokio::test]
    async fn set_and_erase_round_trip() {
        let driver = MemoryPayloadDriver::<TestSchemes>::new();
        let (digest, length) = driver.set(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(length, 2);
        assert_eq!(driver.length(&digest).await.unwrap(), 2);
        assert!(driver.erase(&digest).await.unwrap());
        assert!(!driver.erase(&digest).await.unwrap());
        assert_eq!(driver.length(&digest).await.unwrap(), 0);
    }
}
