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

use osier_common::CodeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key-value engine error: {0}")]
    Kv(#[source] anyhow::Error),

    /// The index and the entries it references disagree. Fatal for the
    /// operation that observed it; never retried.
    #[error("storage corruption: {0}")]
    Corruption(String),

    #[error("stored bytes failed to decode: {0}")]
    Code(#[from] CodeError),

    #[error("payload bytes do not match the entry's digest or length")]
    PayloadMismatch,

    #[error("payload offset {offset} does not continue the staged partial of length {staged}")]
    PayloadOffset { offset: u64, staged: u64 },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    pub fn corruption(message: impl Into<String>) -> Self {
        StorageError::Corruption(message.into())
    }
}
