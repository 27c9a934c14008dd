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

//! Filesystem payload storage.
//!
//! Complete blobs live under `blobs/`, partials under `staging/`, both
//! named by the hex of the relevant digest. Every write lands in a
//! temporary file that is synced and renamed into place, so a crash leaves
//! either the old file or the new one. Staged partials survive restarts and
//! resume by expected digest.

use std::marker::PhantomData;
use std::path::PathBuf;

use bytes::Bytes;
use osier_common::{Encode, PayloadHasher, Schemes};
use tracing::debug;

use super::{assemble, Payload, PayloadDriver, PayloadReceipt};
use crate::error::Result;

pub struct FsPayloadDriver<S: Schemes> {
    blobs: PathBuf,
    staging: PathBuf,
    _marker: PhantomData<fn() -> S>,
}

fn file_name<D: Encode>(digest: &D) -> String {
    hex::encode(digest.encoded())
}

async fn write_atomic(dir: &PathBuf, name: &str, bytes: &[u8]) -> Result<()> {
    let temp = dir.join(format!("{name}.tmp"));
    let target = dir.join(name);
    tokio::fs::write(&temp, bytes).await?;
    let file = tokio::fs::File::open(&temp).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&temp, &target).await?;
    Ok(())
}

async fn read_optional(path: PathBuf) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

impl<S: Schemes> FsPayloadDriver<S> {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let blobs = root.join("blobs");
        let staging = root.join("staging");
        tokio::fs::create_dir_all(&blobs).await?;
        tokio::fs::create_dir_all(&staging).await?;
        debug!(root = %root.display(), "opened payload store");
        Ok(Self {
            blobs,
            staging,
            _marker: PhantomData,
        })
    }

    fn blob_path(&self, digest: &S::PayloadDigest) -> PathBuf {
        self.blobs.join(file_name(digest))
    }

    fn staging_path(&self, digest: &S::PayloadDigest) -> PathBuf {
        self.staging.join(file_name(digest))
    }
}

impl<S: Schemes> PayloadDriver<S> for FsPayloadDriver<S> {
    type Receipt = FsReceipt<S>;

    async fn get(&self, digest: &S::PayloadDigest) -> Result<Option<Payload>> {
        Ok(read_optional(self.blob_path(digest))
            .await?
            .map(|bytes| Payload::new(Bytes::from(bytes))))
    }

    async fn length(&self, digest: &S::PayloadDigest) -> Result<u64> {
        match tokio::fs::metadata(self.blob_path(digest)).await {
            Ok(meta) => Ok(meta.len()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(error) => Err(error.into()),
        }
    }

    async fn set(&self, bytes: Bytes) -> Result<(S::PayloadDigest, u64)> {
        let digest = S::PayloadHasher::digest_of(&bytes);
        let length = bytes.len() as u64;
        write_atomic(&self.blobs, &file_name(&digest), &bytes).await?;
        Ok((digest, length))
    }

    async fn receive(
        &self,
        bytes: Bytes,
        offset: u64,
        _expected_length: u64,
        expected_digest: &S::PayloadDigest,
    ) -> Result<FsReceipt<S>> {
        let mut assembled = read_optional(self.staging_path(expected_digest))
            .await?
            .unwrap_or_default();
        assemble(&mut assembled, &bytes, offset)?;
        let digest = S::PayloadHasher::digest_of(&assembled);
        Ok(FsReceipt {
            blobs: self.blobs.clone(),
            staging: self.staging.clone(),
            expected_digest: expected_digest.clone(),
            digest,
            assembled,
        })
    }

    async fn erase(&self, digest: &S::PayloadDigest) -> Result<bool> {
        match tokio::fs::remove_file(self.blob_path(digest)).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

pub struct FsReceipt<S: Schemes> {
    blobs: PathBuf,
    staging: PathBuf,
    expected_digest: S::PayloadDigest,
    digest: S::PayloadDigest,
    assembled: Vec<u8>,
}

async fn remove_if_present(path: PathBuf) -> Result<()> {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

impl<S: Schemes> PayloadReceipt<S> for FsReceipt<S> {
    fn digest(&self) -> &S::PayloadDigest {
        &self.digest
    }

    fn length(&self) -> u64 {
        self.assembled.len() as u64
    }

    async fn commit(self, is_complete: bool) -> Result<()> {
        if is_complete {
            write_atomic(&self.blobs, &file_name(&self.digest), &self.assembled).await?;
            remove_if_present(self.staging.join(file_name(&self.expected_digest))).await
        } else {
            write_atomic(
                &self.staging,
                &file_name(&self.expected_digest),
                &self.assembled,
            )
            .await
        }
    }

    async fn reject(self) -> Result<()> {
        remove_if_present(self.staging.join(file_name(&self.expected_digest))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osier_common::testing::{TestPayloadHasher, TestSchemes};

    #[tokio::test]
    async fn partials_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let expected = TestPayloadHasher::digest_of(b"payload");
        {
            let driver = FsPayloadDriver::<TestSchemes>::open(dir.path()).await.unwrap();
            let receipt = driver
                .receive(Bytes::from_static(b"pay"), 0, 7, &expected)
                .await
                .unwrap();
            receipt.commit(false).await.unwrap();
        }
        let driver = FsPayloadDriver::<TestSchemes>::open(dir.path()).await.unwrap();
        assert!(driver.get(&expected).await.unwrap().is_none());
        let receipt = driver
            .receive(Bytes::from_static(b"load"), 3, 7, &expected)
            .await
            .unwrap();
        assert_eq!(*receipt.digest(), expected);
        receipt.commit(true).await.unwrap();
        let payload = driver.get(&expected).await.unwrap().unwrap();
        assert_eq!(payload.bytes(), Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn set_get_erase() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FsPayloadDriver::<TestSchemes>::open(dir.path()).await.unwrap();
        let (digest, length) = driver.set(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(length, 5);
        assert_eq!(driver.length(&digest).await.unwrap(), 5);
        assert_eq!(
            driver.get(&digest).await.unwrap().unwrap().bytes(),
            Bytes::from_static(b"hello")
        );
        assert!(driver.erase(&digest).await.unwrap());
        assert_eq!(driver.length(&digest).await.unwrap(), 0);
    }
}
