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

//! Half-open ranges and the three-dimensional boxes built from them.

use crate::code::{put_bool, CodeError, Decode, Encode, Reader};
use crate::entry::Entry;
use crate::path::Path;
use crate::schemes::Least;
use crate::Timestamp;

/// Upper bound of a half-open range: either exclusive, or the distinguished
/// open end covering everything upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum End<T> {
    Closed(T),
    Open,
}

impl<T: Ord> End<T> {
    fn admits(&self, value: &T) -> bool {
        match self {
            End::Closed(end) => value < end,
            End::Open => true,
        }
    }

    /// The smaller of two upper bounds.
    fn min(self, other: Self) -> Self {
        match (self, other) {
            (End::Open, end) | (end, End::Open) => end,
            (End::Closed(a), End::Closed(b)) => End::Closed(a.min(b)),
        }
    }
}

/// `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Range<T> {
    pub start: T,
    pub end: End<T>,
}

impl<T: Ord> Range<T> {
    pub fn new(start: T, end: End<T>) -> Self {
        Self { start, end }
    }

    pub fn open(start: T) -> Self {
        Self {
            start,
            end: End::Open,
        }
    }

    pub fn includes(&self, value: &T) -> bool {
        *value >= self.start && self.end.admits(value)
    }

    pub fn is_empty(&self) -> bool {
        match &self.end {
            End::Closed(end) => *end <= self.start,
            End::Open => false,
        }
    }

    pub fn intersection(&self, other: &Self) -> Self
    where
        T: Clone,
    {
        Range {
            start: self.start.clone().max(other.start.clone()),
            end: self.end.clone().min(other.end.clone()),
        }
    }
}

impl Range<Timestamp> {
    pub fn full_time() -> Self {
        Range::open(0)
    }
}

/// A box in `(subspace, path, time)` space, the unit of fingerprint
/// summarisation. Includes every entry included by all three ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range3d<S> {
    pub subspaces: Range<S>,
    pub paths: Range<Path>,
    pub times: Range<Timestamp>,
}

impl<S: Ord> Range3d<S> {
    /// The range covering the whole namespace.
    pub fn full() -> Self
    where
        S: Least,
    {
        Self {
            subspaces: Range::open(S::least()),
            paths: Range::open(Path::empty()),
            times: Range::full_time(),
        }
    }

    pub fn includes_entry<N, D>(&self, entry: &Entry<N, S, D>) -> bool {
        self.subspaces.includes(&entry.subspace_id)
            && self.paths.includes(&entry.path)
            && self.times.includes(&entry.timestamp)
    }

    pub fn is_empty(&self) -> bool {
        self.subspaces.is_empty() || self.paths.is_empty() || self.times.is_empty()
    }

    pub fn intersection(&self, other: &Self) -> Self
    where
        S: Clone,
    {
        Self {
            subspaces: self.subspaces.intersection(&other.subspaces),
            paths: self.paths.intersection(&other.paths),
            times: self.times.intersection(&other.times),
        }
    }
}

impl<T: Encode> Encode for Range<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.start.encode(out);
        match &self.end {
            End::Closed(end) => {
                put_bool(out, true);
                end.encode(out);
            }
            End::Open => put_bool(out, false),
        }
    }
}

impl<T: Decode> Decode for Range<T> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodeError> {
        let start = T::decode(reader)?;
        let end = if reader.get_bool()? {
            End::Closed(T::decode(reader)?)
        } else {
            End::Open
        };
        Ok(Self { start, end })
    }
}

impl<S: Encode> Encode for Range3d<S> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.subspaces.encode(out);
        self.paths.encode(out);
        self.times.encode(out);
    }
}

impl<S: Decode> Decode for Range3d<S> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodeError> {
        Ok(Self {
            subspaces: Range::decode(reader)?,
            paths: Range::decode(reader)?,
            times: Range::decode(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_membership() {
        let range = Range::new(10u64, End::Closed(20));
        assert!(!range.includes(&9));
        assert!(range.includes(&10));
        assert!(range.includes(&19));
        assert!(!range.includes(&20));
        assert!(Range::open(10u64).includes(&u64::MAX));
    }

    #[test]
    fn intersection_narrows_both_bounds() {
        let a = Range::new(0u64, End::Closed(15));
        let b = Range::new(10u64, End::Open);
        let i = a.intersection(&b);
        assert_eq!(i, Range::new(10, End::Closed(15)));
        assert!(Range::new(0u64, End::Closed(5))
            .intersection(&Range::new(5, End::Closed(9)))
            .is_empty());
    }

    #[test]
    fn range3d_round_trip() {
        let range: Range3d<u64> = Range3d {
            subspaces: Range::new(3, End::Closed(9)),
            paths: Range::new(
                Path::new([b"a".to_vec()]),
                End::Closed(Path::new([b"b".to_vec()])),
            ),
            times: Range::full_time(),
        };
        let encoded = range.encoded();
        assert_eq!(Range3d::<u64>::decode_all(&encoded).unwrap(), range);
    }
}
