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

//! Willow paths: ordered sequences of byte-string components.
//!
//! Paths are totally ordered component-wise, with a path sorting before all
//! of its extensions. The two successor operations are the workhorses of
//! range construction: [`Path::successor`] bounds a singleton path range,
//! [`Path::greater_but_not_prefixed`] bounds the range of all extensions of
//! a prefix.

use std::fmt;

use bytes::Bytes;

use crate::code::{get_bytes, put_bytes, put_varint, CodeError, Decode, Encode, Reader};

/// One path component.
pub type Component = Bytes;

#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
    components: Vec<Component>,
}

impl Path {
    pub fn new(components: impl IntoIterator<Item = impl Into<Component>>) -> Self {
        Self {
            components: components.into_iter().map(Into::into).collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Sum of component lengths in bytes.
    pub fn total_length(&self) -> usize {
        self.components.iter().map(Bytes::len).sum()
    }

    /// True when `self` is a (non-strict) prefix of `other`.
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        self.components.len() <= other.components.len()
            && self
                .components
                .iter()
                .zip(&other.components)
                .all(|(a, b)| a == b)
    }

    /// True when `self` is a prefix of `other` and the two differ.
    pub fn is_strict_prefix_of(&self, other: &Path) -> bool {
        self.components.len() < other.components.len() && self.is_prefix_of(other)
    }

    pub fn append(&self, component: impl Into<Component>) -> Self {
        let mut components = self.components.clone();
        components.push(component.into());
        Self { components }
    }

    /// All prefixes of `self` that are strictly shorter, starting with the
    /// empty path.
    pub fn strict_prefixes(&self) -> impl Iterator<Item = Path> + '_ {
        (0..self.components.len()).map(|n| Path {
            components: self.components[..n].to_vec(),
        })
    }

    /// All prefixes of `self`, starting with the empty path and ending with
    /// `self` itself.
    pub fn prefixes(&self) -> impl Iterator<Item = Path> + '_ {
        (0..=self.components.len()).map(|n| Path {
            components: self.components[..n].to_vec(),
        })
    }

    /// The least path strictly greater than `self`: `self` with an empty
    /// component appended. `[self, self.successor())` is the singleton range
    /// holding exactly `self`.
    pub fn successor(&self) -> Path {
        self.append(Bytes::new())
    }

    /// The least path strictly greater than `self` that does not have `self`
    /// as a prefix, obtained by extending the final component with a zero
    /// byte. `None` for the empty path, which every path extends.
    pub fn greater_but_not_prefixed(&self) -> Option<Path> {
        let (last, init) = self.components.split_last()?;
        let mut bumped = Vec::with_capacity(last.len() + 1);
        bumped.extend_from_slice(last);
        bumped.push(0x00);
        let mut components = init.to_vec();
        components.push(Bytes::from(bumped));
        Some(Path { components })
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path[")?;
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", hex::encode(component))?;
        }
        write!(f, "]")
    }
}

impl Encode for Path {
    fn encode(&self, out: &mut Vec<u8>) {
        put_varint(out, self.components.len() as u64);
        for component in &self.components {
            put_bytes(out, component);
        }
    }
}

impl Decode for Path {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodeError> {
        let count = reader.get_varint()?;
        let count = usize::try_from(count).map_err(|_| CodeError::VarintOverflow)?;
        // Bound the pre-allocation; the true size check happens against the
        // scheme's path limits at the session layer.
        let mut components = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            components.push(Bytes::copy_from_slice(get_bytes(reader)?));
        }
        Ok(Self { components })
    }
}
