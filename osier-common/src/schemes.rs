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

//! The pluggable parameterisation of the protocol.
//!
//! [`Schemes`] gathers every choice the protocol leaves open: identifier
//! types, payload hashing, the fingerprint monoid, authorisation tokens and
//! their static/dynamic decomposition, read and subspace capabilities, the
//! commutative group for private area intersection, and the handshake
//! challenge hash. Stores and sessions are generic over one `Schemes`
//! implementation; two peers must agree on it to interoperate.

use std::fmt::Debug;
use std::hash::Hash;

use crate::area::Area;
use crate::code::{CodeError, Decode, Encode, Reader};
use crate::entry::{Entry, LengthyEntry};
use crate::path::Path;

/// Fixed-width encoding whose byte order agrees with the value order. Used
/// to build lexicographic composite storage keys.
pub trait SortedEncode: Sized {
    const WIDTH: usize;

    fn write_sorted(&self, out: &mut Vec<u8>);
    fn read_sorted(bytes: &[u8]) -> Result<Self, CodeError>;
}

impl SortedEncode for u64 {
    const WIDTH: usize = 8;

    fn write_sorted(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_be_bytes());
    }

    fn read_sorted(bytes: &[u8]) -> Result<Self, CodeError> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CodeError::Invalid("sorted u64 must be 8 bytes"))?;
        Ok(u64::from_be_bytes(raw))
    }
}

impl<const N: usize> SortedEncode for [u8; N] {
    const WIDTH: usize = N;

    fn write_sorted(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn read_sorted(bytes: &[u8]) -> Result<Self, CodeError> {
        bytes
            .try_into()
            .map_err(|_| CodeError::Invalid("sorted array width mismatch"))
    }
}

/// Types with a least value, the start of open ranges.
pub trait Least {
    fn least() -> Self;
}

impl Least for u64 {
    fn least() -> Self {
        0
    }
}

impl<const N: usize> Least for [u8; N] {
    fn least() -> Self {
        [0; N]
    }
}

/// Types with an immediate successor in their order, `None` at the maximum.
pub trait Successor: Sized {
    fn successor(&self) -> Option<Self>;
}

impl Successor for u64 {
    fn successor(&self) -> Option<Self> {
        self.checked_add(1)
    }
}

impl<const N: usize> Successor for [u8; N] {
    fn successor(&self) -> Option<Self> {
        let mut next = *self;
        for byte in next.iter_mut().rev() {
            let (bumped, overflow) = byte.overflowing_add(1);
            *byte = bumped;
            if !overflow {
                return Some(next);
            }
        }
        None
    }
}

/// Incremental payload hashing.
pub trait PayloadHasher: Default + Send {
    type Digest;

    fn update(&mut self, chunk: &[u8]);
    fn finalise(self) -> Self::Digest;

    fn digest_of(bytes: &[u8]) -> Self::Digest {
        let mut hasher = Self::default();
        hasher.update(bytes);
        hasher.finalise()
    }
}

/// A fragment of a read capability, as exchanged (in blinded form) during
/// private area intersection. A pair leaves the subspace open; a triple
/// pins it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fragment<N, S> {
    Pair { namespace: N, path: Path },
    Triple { namespace: N, subspace: S, path: Path },
}

impl<N: Encode, S: Encode> Encode for Fragment<N, S> {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Fragment::Pair { namespace, path } => {
                out.push(0);
                namespace.encode(out);
                path.encode(out);
            }
            Fragment::Triple {
                namespace,
                subspace,
                path,
            } => {
                out.push(1);
                namespace.encode(out);
                subspace.encode(out);
                path.encode(out);
            }
        }
    }
}

impl<N: Decode, S: Decode> Decode for Fragment<N, S> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodeError> {
        match reader.get_u8()? {
            0 => Ok(Fragment::Pair {
                namespace: N::decode(reader)?,
                path: Path::decode(reader)?,
            }),
            1 => Ok(Fragment::Triple {
                namespace: N::decode(reader)?,
                subspace: S::decode(reader)?,
                path: Path::decode(reader)?,
            }),
            _ => Err(CodeError::Invalid("fragment tag out of range")),
        }
    }
}

/// The fragments a capability dissolves into.
///
/// A capability over a whole namespace (subspace `Any`) yields `Complete`:
/// one pair per path prefix. A subspace-restricted capability yields
/// `Selective`: triples as its primary fragments and pairs as secondary
/// ones, the latter only matchable against a peer that can prove namespace
/// access via a subspace capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentSet<N, S> {
    Complete {
        pairs: Vec<Fragment<N, S>>,
    },
    Selective {
        primary: Vec<Fragment<N, S>>,
        secondary: Vec<Fragment<N, S>>,
    },
}

/// Everything the protocol is parameterised over.
pub trait Schemes: Sized + Send + Sync + 'static {
    type NamespaceId: Clone + Eq + Ord + Hash + Debug + Send + Sync + Encode + Decode;
    type SubspaceId: Clone
        + Eq
        + Ord
        + Hash
        + Debug
        + Send
        + Sync
        + Encode
        + Decode
        + SortedEncode
        + Least
        + Successor;
    type PayloadDigest: Clone + Eq + Ord + Hash + Debug + Send + Sync + Encode + Decode + SortedEncode;
    type PayloadHasher: PayloadHasher<Digest = Self::PayloadDigest>;

    const MAX_COMPONENT_LENGTH: usize;
    const MAX_COMPONENT_COUNT: usize;
    const MAX_PATH_LENGTH: usize;

    fn path_is_valid(path: &Path) -> bool {
        path.component_count() <= Self::MAX_COMPONENT_COUNT
            && path.total_length() <= Self::MAX_PATH_LENGTH
            && path
                .components()
                .iter()
                .all(|c| c.len() <= Self::MAX_COMPONENT_LENGTH)
    }

    // Fingerprints: a commutative monoid over lengthy entries with a final
    // map applied before comparison on the wire.
    type FingerprintPre: Clone + PartialEq + Debug + Send + Sync;
    type Fingerprint: Clone + PartialEq + Eq + Debug + Send + Sync + Encode + Decode;

    fn fingerprint_neutral() -> Self::FingerprintPre;
    fn fingerprint_singleton(
        entry: &LengthyEntry<Self::NamespaceId, Self::SubspaceId, Self::PayloadDigest>,
    ) -> Self::FingerprintPre;
    fn fingerprint_combine(
        a: &Self::FingerprintPre,
        b: &Self::FingerprintPre,
    ) -> Self::FingerprintPre;
    fn fingerprint_finalise(pre: &Self::FingerprintPre) -> Self::Fingerprint;

    // Authorisation.
    type AuthorisationToken: Clone + Debug + Send + Sync + Encode + Decode;
    type AuthorisationOpts: Send + Sync;
    type StaticToken: Clone + Eq + Hash + Debug + Send + Sync + Encode + Decode;
    type DynamicToken: Clone + Debug + Send + Sync + Encode + Decode;

    /// Produce a token proving the local writer may store `entry`, or
    /// `None` when `opts` cannot authorise it.
    fn authorise(
        entry: &Entry<Self::NamespaceId, Self::SubspaceId, Self::PayloadDigest>,
        opts: &Self::AuthorisationOpts,
    ) -> Option<Self::AuthorisationToken>;
    fn is_authorised_write(
        entry: &Entry<Self::NamespaceId, Self::SubspaceId, Self::PayloadDigest>,
        token: &Self::AuthorisationToken,
    ) -> bool;
    fn decompose_token(token: &Self::AuthorisationToken) -> (Self::StaticToken, Self::DynamicToken);
    fn recompose_token(
        static_token: &Self::StaticToken,
        dynamic_token: &Self::DynamicToken,
    ) -> Self::AuthorisationToken;

    // Read capabilities.
    type ReadCapability: Clone + Debug + Send + Sync + Encode + Decode;
    type Receiver: Clone + Eq + Debug + Send + Sync;
    type ReceiverSecret: Clone + Send + Sync;
    type Signature: Clone + Debug + Send + Sync + Encode + Decode;

    fn granted_namespace(cap: &Self::ReadCapability) -> Self::NamespaceId;
    fn granted_area(cap: &Self::ReadCapability) -> Area<Self::SubspaceId>;
    fn is_valid_capability(cap: &Self::ReadCapability) -> bool;
    fn cap_receiver(cap: &Self::ReadCapability) -> Self::Receiver;
    fn sign_challenge(secret: &Self::ReceiverSecret, challenge: &[u8]) -> Self::Signature;
    fn verify_challenge(
        receiver: &Self::Receiver,
        challenge: &[u8],
        signature: &Self::Signature,
    ) -> bool;

    // Subspace capabilities: prove namespace membership without revealing
    // which subspace a selective capability is restricted to.
    type SubspaceCapability: Clone + Debug + Send + Sync + Encode + Decode;

    fn subspace_cap_namespace(cap: &Self::SubspaceCapability) -> Self::NamespaceId;
    fn subspace_cap_receiver(cap: &Self::SubspaceCapability) -> Self::Receiver;
    fn is_valid_subspace_cap(cap: &Self::SubspaceCapability) -> bool;
    /// The subspace capability to present when a secondary fragment of
    /// `cap` intersects, if the scheme can derive one.
    fn subspace_cap_for(cap: &Self::ReadCapability) -> Option<Self::SubspaceCapability>;

    // Private area intersection over a commutative group.
    type GroupMember: Clone + Eq + Hash + Debug + Send + Sync + Encode + Decode;
    type Scalar: Clone + Send + Sync;

    /// A fresh secret scalar for this session.
    fn pai_scalar() -> Self::Scalar;
    fn pai_fragment_to_member(
        fragment: &Fragment<Self::NamespaceId, Self::SubspaceId>,
    ) -> Self::GroupMember;
    fn pai_scalar_mult(member: &Self::GroupMember, scalar: &Self::Scalar) -> Self::GroupMember;
    fn pai_fragments(cap: &Self::ReadCapability) -> FragmentSet<Self::NamespaceId, Self::SubspaceId>;

    // Handshake.
    const CHALLENGE_LENGTH: usize;
    const CHALLENGE_HASH_LENGTH: usize;

    fn challenge_hash(input: &[u8]) -> Vec<u8>;
}

/// Derives the path-prefix fragments for a capability area: one fragment
/// per prefix of the granted path, the empty path included.
pub fn prefix_fragments<N: Clone, S: Clone>(
    namespace: &N,
    subspace: Option<&S>,
    path: &Path,
) -> Vec<Fragment<N, S>> {
    path.prefixes()
        .map(|prefix| match subspace {
            None => Fragment::Pair {
                namespace: namespace.clone(),
                path: prefix,
            },
            Some(subspace) => Fragment::Triple {
                namespace: namespace.clone(),
                subspace: subspace.clone(),
                path: prefix,
            },
        })
        .collect()
}
