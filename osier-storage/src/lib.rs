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

//! Entry and payload storage.
//!
//! A [`Store`] owns one namespace. Entries live in a three-ordering index
//! over an ordered key-value engine; payloads (and encoded authorisation
//! tokens) live in a content-addressed payload store with reference
//! counting and a staging area for partial receipt. Mutations are covered
//! by a write-ahead flag so that a crash mid-ingestion recovers to a
//! consistent state.

pub mod driver;
pub mod error;
pub mod keys;
pub mod kv;
pub mod payload;
pub mod store;

pub use driver::{
    EntryDriver, EntryRecord, PayloadRefCounter, PrefixIndex, QueryOrder, RangeOfInterest,
    SchemeEntry, Storage3d, Summary, WriteAheadFlag,
};
pub use error::StorageError;
pub use kv::{KvStore, MemoryKv};
pub use payload::{FsPayloadDriver, MemoryPayloadDriver, Payload, PayloadDriver, PayloadReceipt};
pub use store::{
    IngestEvent, IngestPayloadEvent, NoOpReason, QueryHit, RejectReason, SetInput, Store,
    StoreEvent,
};
