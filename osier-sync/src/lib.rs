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

//! Peer-to-peer synchronisation sessions.
//!
//! Two peers on a bidirectional byte stream reconcile the subsets of their
//! stores both are authorised to read. A session multiplexes seven logical
//! channels over the transport under flow-control guarantees, negotiates
//! shared interests through private area intersection, reconciles ranges by
//! comparing fingerprints, and streams the missing entries and payloads.

pub mod aoi_finder;
pub mod announcer;
pub mod data_sender;
pub mod error;
pub mod guaranteed_queue;
pub mod handle_store;
pub mod messenger;
pub mod pai;
pub mod payload_ingester;
pub mod reconciler;
pub mod store_map;
pub mod transport;
pub mod wire;

pub use aoi_finder::{AoiIntersection, AoiIntersectionFinder};
pub use announcer::{Announcement, AnnouncementPack, Announcer};
pub use data_sender::{DataSender, PayloadRequest, PayloadTransform};
pub use error::SyncError;
pub use guaranteed_queue::GuaranteedQueue;
pub use handle_store::HandleStore;
pub use messenger::{SessionConfig, SyncInterest, WgpsMessenger};
pub use pai::{PaiAction, PaiFinder};
pub use payload_ingester::PayloadIngester;
pub use reconciler::{Reconciler, ReconcilerOutput, SEND_ENTRIES_THRESHOLD};
pub use store_map::StoreMap;
pub use transport::{duplex, DuplexTransport, Preamble, ReadyTransport, Role, Transport};
pub use wire::{Channel, FrameDecoder, HandleType, Message};
