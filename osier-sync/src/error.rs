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
use osier_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Local input failed a precondition. The session is unaffected.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The peer broke the wire contract. The session terminates.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An entry or capability failed its cryptographic checks. Treated as a
    /// protocol violation.
    #[error("authorisation failed: {0}")]
    Authorisation(String),

    #[error("transport closed or failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Store(#[from] StorageError),

    #[error("undecodable message: {0}")]
    Code(#[from] CodeError),
}

impl SyncError {
    pub fn protocol(message: impl Into<String>) -> Self {
        SyncError::Protocol(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::Validation(message.into())
    }

    pub fn authorisation(message: impl Into<String>) -> Self {
        SyncError::Authorisation(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        SyncError::Transport(message.into())
    }
}
