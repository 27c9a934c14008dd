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

//! Data model and scheme contracts shared by the osier storage and sync
//! crates.
//!
//! Willow is a higher-order protocol: the concrete namespace, subspace,
//! digest, fingerprint, authorisation, capability and group types are all
//! supplied by an implementation of [`Schemes`]. Everything else in this
//! crate is scheme-agnostic: paths, entries, areas, three-dimensional
//! ranges, and the byte codec they share.

pub mod area;
pub mod code;
pub mod entry;
pub mod path;
pub mod range;
pub mod schemes;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use area::{Area, AreaOfInterest, AreaSubspace};
pub use code::{CodeError, Decode, Encode, Reader};
pub use entry::{Entry, LengthyEntry};
pub use path::{Component, Path};
pub use range::{End, Range, Range3d};
pub use schemes::{Fragment, FragmentSet, Least, PayloadHasher, Schemes, SortedEncode, Successor};

/// Microseconds since the Unix epoch.
pub type Timestamp = u64;
