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

//! Areas: the grouping shape used by capabilities and interests.
//!
//! An area fixes a subspace (or leaves it open), a path prefix, and a time
//! range. Unlike a [`Range3d`](crate::range::Range3d) it is closed under
//! capability delegation, which is why capabilities grant areas and
//! reconciliation runs over ranges.

use crate::code::{put_bool, CodeError, Decode, Encode, Reader};
use crate::entry::Entry;
use crate::path::Path;
use crate::range::{End, Range, Range3d};
use crate::schemes::{Least, Successor};
use crate::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AreaSubspace<S> {
    /// Every subspace in the namespace.
    Any,
    Id(S),
}

impl<S: Eq> AreaSubspace<S> {
    pub fn includes(&self, subspace: &S) -> bool {
        match self {
            AreaSubspace::Any => true,
            AreaSubspace::Id(id) => id == subspace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Area<S> {
    pub subspace: AreaSubspace<S>,
    pub path_prefix: Path,
    pub times: Range<Timestamp>,
}

impl<S: Clone + Ord> Area<S> {
    /// The area covering the whole namespace.
    pub fn full() -> Self {
        Self {
            subspace: AreaSubspace::Any,
            path_prefix: Path::empty(),
            times: Range::full_time(),
        }
    }

    /// The area covering one subspace entirely.
    pub fn subspace(id: S) -> Self {
        Self {
            subspace: AreaSubspace::Id(id),
            path_prefix: Path::empty(),
            times: Range::full_time(),
        }
    }

    pub fn includes_entry<N, D>(&self, entry: &Entry<N, S, D>) -> bool {
        self.subspace.includes(&entry.subspace_id)
            && self.path_prefix.is_prefix_of(&entry.path)
            && self.times.includes(&entry.timestamp)
    }

    /// True when every entry included in `other` is included in `self`.
    pub fn includes_area(&self, other: &Area<S>) -> bool {
        let subspace_ok = match (&self.subspace, &other.subspace) {
            (AreaSubspace::Any, _) => true,
            (AreaSubspace::Id(_), AreaSubspace::Any) => false,
            (AreaSubspace::Id(a), AreaSubspace::Id(b)) => a == b,
        };
        subspace_ok
            && self.path_prefix.is_prefix_of(&other.path_prefix)
            && other.times.start >= self.times.start
            && match (&self.times.end, &other.times.end) {
                (End::Open, _) => true,
                (End::Closed(_), End::Open) => false,
                (End::Closed(a), End::Closed(b)) => b <= a,
            }
    }

    /// The area of entries included in both, or `None` when the two cannot
    /// share entries.
    pub fn intersect(&self, other: &Area<S>) -> Option<Area<S>> {
        let subspace = match (&self.subspace, &other.subspace) {
            (AreaSubspace::Any, s) | (s, AreaSubspace::Any) => s.clone(),
            (AreaSubspace::Id(a), AreaSubspace::Id(b)) => {
                if a == b {
                    AreaSubspace::Id(a.clone())
                } else {
                    return None;
                }
            }
        };
        let path_prefix = if self.path_prefix.is_prefix_of(&other.path_prefix) {
            other.path_prefix.clone()
        } else if other.path_prefix.is_prefix_of(&self.path_prefix) {
            self.path_prefix.clone()
        } else {
            return None;
        };
        let times = self.times.intersection(&other.times);
        if times.is_empty() {
            return None;
        }
        Some(Area {
            subspace,
            path_prefix,
            times,
        })
    }

    /// The smallest [`Range3d`] covering exactly the entries of this area.
    pub fn to_range3d(&self) -> Range3d<S>
    where
        S: Least + Successor,
    {
        let subspaces = match &self.subspace {
            AreaSubspace::Any => Range::open(S::least()),
            AreaSubspace::Id(id) => Range {
                start: id.clone(),
                end: match id.successor() {
                    Some(next) => End::Closed(next),
                    None => End::Open,
                },
            },
        };
        let paths = Range {
            start: self.path_prefix.clone(),
            end: match self.path_prefix.greater_but_not_prefixed() {
                Some(bound) => End::Closed(bound),
                None => End::Open,
            },
        };
        Range3d {
            subspaces,
            paths,
            times: self.times.clone(),
        }
    }
}

/// An area plus caps on how many entries, and how many payload bytes, the
/// interest-holder wants. Zero means uncapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaOfInterest<S> {
    pub area: Area<S>,
    pub max_count: u64,
    pub max_size: u64,
}

impl<S> AreaOfInterest<S> {
    pub fn uncapped(area: Area<S>) -> Self {
        Self {
            area,
            max_count: 0,
            max_size: 0,
        }
    }
}

impl<S: Encode> Encode for AreaSubspace<S> {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            AreaSubspace::Any => put_bool(out, false),
            AreaSubspace::Id(id) => {
                put_bool(out, true);
                id.encode(out);
            }
        }
    }
}

impl<S: Decode> Decode for AreaSubspace<S> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodeError> {
        Ok(if reader.get_bool()? {
            AreaSubspace::Id(S::decode(reader)?)
        } else {
            AreaSubspace::Any
        })
    }
}

impl<S: Encode> Encode for Area<S> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.subspace.encode(out);
        self.path_prefix.encode(out);
        self.times.encode(out);
    }
}

impl<S: Decode> Decode for Area<S> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodeError> {
        Ok(Self {
            subspace: AreaSubspace::decode(reader)?,
            path_prefix: Path::decode(reader)?,
            times: Range::decode(reader)?,
        })
    }
}

impl<S: Encode> Encode for AreaOfInterest<S> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.area.encode(out);
        self.max_count.encode(out);
        self.max_size.encode(out);
    }
}

impl<S: Decode> Decode for AreaOfInterest<S> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodeError> {
        Ok(Self {
            area: Area::decode(reader)?,
            max_count: u64::decode(reader)?,
            max_size: u64::decode(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(components: &[&[u8]]) -> Path {
        Path::new(components.iter().map(|c| c.to_vec()))
    }

    fn area(subspace: Option<u64>, prefix: &[&[u8]]) -> Area<u64> {
        Area {
            subspace: match subspace {
                Some(id) => AreaSubspace::Id(id),
                None => AreaSubspace::Any,
            },
            path_prefix: path(prefix),
            times: Range::full_time(),
        }
    }

    #[test]
    fn intersect_takes_the_longer_prefix() {
        let broad = area(None, &[b"blog"]);
        let narrow = area(Some(7), &[b"blog", b"posts"]);
        let got = broad.intersect(&narrow).unwrap();
        assert_eq!(got.subspace, AreaSubspace::Id(7));
        assert_eq!(got.path_prefix, path(&[b"blog", b"posts"]));
        assert!(area(None, &[b"blog"])
            .intersect(&area(None, &[b"wiki"]))
            .is_none());
        assert!(area(Some(1), &[]).intersect(&area(Some(2), &[])).is_none());
    }

    #[test]
    fn includes_area_is_containment() {
        let outer = area(None, &[b"blog"]);
        let inner = area(Some(3), &[b"blog", b"posts"]);
        assert!(outer.includes_area(&inner));
        assert!(!inner.includes_area(&outer));
    }

    #[test]
    fn to_range3d_covers_exactly_the_area() {
        let a = area(Some(5), &[b"blog"]);
        let range = a.to_range3d();
        let inside = Entry {
            namespace_id: 0u8,
            subspace_id: 5u64,
            path: path(&[b"blog", b"x"]),
            timestamp: 12,
            payload_length: 0,
            payload_digest: 0u64,
        };
        assert!(a.includes_entry(&inside));
        assert!(range.includes_entry(&inside));
        let outside = Entry {
            subspace_id: 6,
            ..inside.clone()
        };
        assert!(!a.includes_entry(&outside));
        assert!(!range.includes_entry(&outside));
        let sibling = Entry {
            path: path(&[b"blogx"]),
            ..inside
        };
        assert!(!a.includes_entry(&sibling));
        assert!(!range.includes_entry(&sibling));
    }
}
