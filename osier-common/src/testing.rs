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

//! A small, self-contained [`Schemes`] implementation for tests.
//!
//! Identifiers are fixed-width byte arrays, digests are Blake2b-256, the
//! fingerprint monoid is XOR over per-entry hashes, and "signatures" are
//! keyed hashes where the public key doubles as the secret. Nothing here is
//! cryptographically meaningful; the shapes are.

use blake2_rfc::blake2b::Blake2b;
use rand::Rng;

use crate::area::{Area, AreaSubspace};
use crate::code::{put_bool, CodeError, Decode, Encode, Reader};
use crate::entry::{Entry, LengthyEntry};
use crate::path::Path;
use crate::range::Range;
use crate::schemes::{prefix_fragments, Fragment, FragmentSet, PayloadHasher, Schemes};

pub type TestNamespaceId = [u8; 8];
pub type TestSubspaceId = [u8; 8];
pub type TestDigest = [u8; 32];

pub type TestEntry = Entry<TestNamespaceId, TestSubspaceId, TestDigest>;

/// Pad or truncate a label into an 8-byte identifier.
pub fn id8(label: &str) -> [u8; 8] {
    let mut id = [0u8; 8];
    let bytes = label.as_bytes();
    let n = bytes.len().min(8);
    id[..n].copy_from_slice(&bytes[..n]);
    id
}

fn blake2_256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b::new(32);
    for part in parts {
        hasher.update(part);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(hasher.finalize().as_bytes());
    digest
}

#[derive(Default)]
pub struct TestPayloadHasher {
    state: Option<Blake2b>,
}

impl PayloadHasher for TestPayloadHasher {
    type Digest = TestDigest;

    fn update(&mut self, chunk: &[u8]) {
        self.state
            .get_or_insert_with(|| Blake2b::new(32))
            .update(chunk);
    }

    fn finalise(self) -> TestDigest {
        let hasher = self.state.unwrap_or_else(|| Blake2b::new(32));
        let mut digest = [0u8; 32];
        digest.copy_from_slice(hasher.finalize().as_bytes());
        digest
    }
}

/// Token: the writing subspace plus a keyed hash over the entry. The
/// subspace identifier is its own secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestToken {
    pub author: TestSubspaceId,
    pub mac: [u8; 32],
}

impl Encode for TestToken {
    fn encode(&self, out: &mut Vec<u8>) {
        self.author.encode(out);
        self.mac.encode(out);
    }
}

impl Decode for TestToken {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodeError> {
        Ok(Self {
            author: <[u8; 8]>::decode(reader)?,
            mac: <[u8; 32]>::decode(reader)?,
        })
    }
}

/// A read capability granting an area of one namespace to a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCapability {
    pub namespace: TestNamespaceId,
    pub subspace: Option<TestSubspaceId>,
    pub path: Path,
    pub receiver: [u8; 8],
}

impl TestCapability {
    pub fn full(namespace: TestNamespaceId, receiver: [u8; 8]) -> Self {
        Self {
            namespace,
            subspace: None,
            path: Path::empty(),
            receiver,
        }
    }
}

impl Encode for TestCapability {
    fn encode(&self, out: &mut Vec<u8>) {
        self.namespace.encode(out);
        match &self.subspace {
            Some(subspace) => {
                put_bool(out, true);
                subspace.encode(out);
            }
            None => put_bool(out, false),
        }
        self.path.encode(out);
        self.receiver.encode(out);
    }
}

impl Decode for TestCapability {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodeError> {
        Ok(Self {
            namespace: <[u8; 8]>::decode(reader)?,
            subspace: if reader.get_bool()? {
                Some(<[u8; 8]>::decode(reader)?)
            } else {
                None
            },
            path: Path::decode(reader)?,
            receiver: <[u8; 8]>::decode(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSubspaceCapability {
    pub namespace: TestNamespaceId,
    pub receiver: [u8; 8],
}

impl Encode for TestSubspaceCapability {
    fn encode(&self, out: &mut Vec<u8>) {
        self.namespace.encode(out);
        self.receiver.encode(out);
    }
}

impl Decode for TestSubspaceCapability {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodeError> {
        Ok(Self {
            namespace: <[u8; 8]>::decode(reader)?,
            receiver: <[u8; 8]>::decode(reader)?,
        })
    }
}

/// 2^61 - 1, a Mersenne prime; the PAI group is Z_p under multiplication.
const PAI_MODULUS: u64 = 2_305_843_009_213_693_951;

fn modpow(base: u64, mut exp: u64, modulus: u64) -> u64 {
    let mut acc: u128 = 1;
    let mut b: u128 = u128::from(base % modulus);
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc * b % u128::from(modulus);
        }
        b = b * b % u128::from(modulus);
        exp >>= 1;
    }
    acc as u64
}

pub struct TestSchemes;

impl Schemes for TestSchemes {
    type NamespaceId = TestNamespaceId;
    type SubspaceId = TestSubspaceId;
    type PayloadDigest = TestDigest;
    type PayloadHasher = TestPayloadHasher;

    const MAX_COMPONENT_LENGTH: usize = 64;
    const MAX_COMPONENT_COUNT: usize = 32;
    const MAX_PATH_LENGTH: usize = 512;

    type FingerprintPre = [u8; 32];
    type Fingerprint = [u8; 32];

    fn fingerprint_neutral() -> [u8; 32] {
        [0; 32]
    }

    fn fingerprint_singleton(
        entry: &LengthyEntry<TestNamespaceId, TestSubspaceId, TestDigest>,
    ) -> [u8; 32] {
        // Availability is deliberately left out so that two stores holding
        // the same entries agree even while payloads are still in flight.
        blake2_256(&[&entry.entry.encoded()])
    }

    fn fingerprint_combine(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
        let mut combined = *a;
        for (lhs, rhs) in combined.iter_mut().zip(b) {
            *lhs ^= rhs;
        }
        combined
    }

    fn fingerprint_finalise(pre: &[u8; 32]) -> [u8; 32] {
        blake2_256(&[pre])
    }

    type AuthorisationToken = TestToken;
    type AuthorisationOpts = TestSubspaceId;
    type StaticToken = TestSubspaceId;
    type DynamicToken = [u8; 32];

    fn authorise(entry: &TestEntry, opts: &TestSubspaceId) -> Option<TestToken> {
        if entry.subspace_id != *opts {
            return None;
        }
        Some(TestToken {
            author: *opts,
            mac: blake2_256(&[opts, &entry.encoded()]),
        })
    }

    fn is_authorised_write(entry: &TestEntry, token: &TestToken) -> bool {
        token.author == entry.subspace_id
            && token.mac == blake2_256(&[&token.author, &entry.encoded()])
    }

    fn decompose_token(token: &TestToken) -> (TestSubspaceId, [u8; 32]) {
        (token.author, token.mac)
    }

    fn recompose_token(static_token: &TestSubspaceId, dynamic_token: &[u8; 32]) -> TestToken {
        TestToken {
            author: *static_token,
            mac: *dynamic_token,
        }
    }

    type ReadCapability = TestCapability;
    type Receiver = [u8; 8];
    type ReceiverSecret = [u8; 8];
    type Signature = [u8; 32];

    fn granted_namespace(cap: &TestCapability) -> TestNamespaceId {
        cap.namespace
    }

    fn granted_area(cap: &TestCapability) -> Area<TestSubspaceId> {
        Area {
            subspace: match cap.subspace {
                Some(id) => AreaSubspace::Id(id),
                None => AreaSubspace::Any,
            },
            path_prefix: cap.path.clone(),
            times: Range::full_time(),
        }
    }

    fn is_valid_capability(_cap: &TestCapability) -> bool {
        true
    }

    fn cap_receiver(cap: &TestCapability) -> [u8; 8] {
        cap.receiver
    }

    fn sign_challenge(secret: &[u8; 8], challenge: &[u8]) -> [u8; 32] {
        blake2_256(&[secret, challenge])
    }

    fn verify_challenge(receiver: &[u8; 8], challenge: &[u8], signature: &[u8; 32]) -> bool {
        *signature == blake2_256(&[receiver, challenge])
    }

    type SubspaceCapability = TestSubspaceCapability;

    fn subspace_cap_namespace(cap: &TestSubspaceCapability) -> TestNamespaceId {
        cap.namespace
    }

    fn subspace_cap_receiver(cap: &TestSubspaceCapability) -> [u8; 8] {
        cap.receiver
    }

    fn is_valid_subspace_cap(_cap: &TestSubspaceCapability) -> bool {
        true
    }

    fn subspace_cap_for(cap: &TestCapability) -> Option<TestSubspaceCapability> {
        // Only a namespace-wide capability entitles its receiver to learn
        // about arbitrary subspaces.
        match cap.subspace {
            None => Some(TestSubspaceCapability {
                namespace: cap.namespace,
                receiver: cap.receiver,
            }),
            Some(_) => None,
        }
    }

    type GroupMember = u64;
    type Scalar = u64;

    fn pai_scalar() -> u64 {
        rand::thread_rng().gen_range(2..PAI_MODULUS - 1)
    }

    fn pai_fragment_to_member(fragment: &Fragment<TestNamespaceId, TestSubspaceId>) -> u64 {
        let digest = blake2_256(&[&fragment.encoded()]);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(raw) % (PAI_MODULUS - 2) + 2
    }

    fn pai_scalar_mult(member: &u64, scalar: &u64) -> u64 {
        modpow(*member, *scalar, PAI_MODULUS)
    }

    fn pai_fragments(cap: &TestCapability) -> FragmentSet<TestNamespaceId, TestSubspaceId> {
        match &cap.subspace {
            None => FragmentSet::Complete {
                pairs: prefix_fragments::<_, TestSubspaceId>(&cap.namespace, None, &cap.path),
            },
            Some(subspace) => FragmentSet::Selective {
                primary: prefix_fragments(&cap.namespace, Some(subspace), &cap.path),
                secondary: prefix_fragments::<_, TestSubspaceId>(&cap.namespace, None, &cap.path),
            },
        }
    }

    const CHALLENGE_LENGTH: usize = 16;
    const CHALLENGE_HASH_LENGTH: usize = 32;

    fn challenge_hash(input: &[u8]) -> Vec<u8> {
        blake2_256(&[input]).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LengthyEntry;

    fn entry(subspace: &str, timestamp: u64) -> TestEntry {
        Entry {
            namespace_id: id8("family"),
            subspace_id: id8(subspace),
            path: Path::new([b"p".to_vec()]),
            timestamp,
            payload_length: 2,
            payload_digest: TestPayloadHasher::digest_of(b"hi"),
        }
    }

    #[test]
    fn token_round_trips_through_decomposition() {
        let e = entry("alfie", 10);
        let token = TestSchemes::authorise(&e, &id8("alfie")).unwrap();
        assert!(TestSchemes::is_authorised_write(&e, &token));
        let (static_token, dynamic_token) = TestSchemes::decompose_token(&token);
        let rebuilt = TestSchemes::recompose_token(&static_token, &dynamic_token);
        assert!(TestSchemes::is_authorised_write(&e, &rebuilt));
        assert!(!TestSchemes::is_authorised_write(&entry("alfie", 11), &token));
    }

    #[test]
    fn fingerprint_is_commutative() {
        let a = TestSchemes::fingerprint_singleton(&LengthyEntry::new(entry("alfie", 1), 0));
        let b = TestSchemes::fingerprint_singleton(&LengthyEntry::new(entry("betty", 2), 0));
        let ab = TestSchemes::fingerprint_combine(&a, &b);
        let ba = TestSchemes::fingerprint_combine(&b, &a);
        assert_eq!(
            TestSchemes::fingerprint_finalise(&ab),
            TestSchemes::fingerprint_finalise(&ba)
        );
        let with_neutral = TestSchemes::fingerprint_combine(&ab, &TestSchemes::fingerprint_neutral());
        assert_eq!(with_neutral, ab);
    }

    #[test]
    fn pai_exponentiation_commutes() {
        let fragment = Fragment::<_, TestSubspaceId>::Pair {
            namespace: id8("family"),
            path: Path::empty(),
        };
        let g = TestSchemes::pai_fragment_to_member(&fragment);
        let a = TestSchemes::pai_scalar();
        let b = TestSchemes::pai_scalar();
        let ab = TestSchemes::pai_scalar_mult(&TestSchemes::pai_scalar_mult(&g, &a), &b);
        let ba = TestSchemes::pai_scalar_mult(&TestSchemes::pai_scalar_mult(&g, &b), &a);
        assert_eq!(ab, ba);
    }
}
