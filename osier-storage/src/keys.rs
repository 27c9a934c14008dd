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

//! Composite key construction for the entry index.
//!
//! One key-value engine holds every index family, distinguished by a
//! leading tag byte. Entry keys exist in three orderings so that each query
//! order is a plain range scan:
//!
//! ```text
//! spt: tag ‖ subspace ‖ path ‖ time      (subspace order)
//! pst: tag ‖ path ‖ subspace ‖ time      (path order)
//! tsp: tag ‖ time ‖ subspace ‖ path      (timestamp order)
//! ```
//!
//! Subspaces use their fixed-width sorted encoding, times are 8-byte
//! big-endian, and paths are escaped so that bytewise key order equals
//! component-wise path order: a zero byte inside a component becomes
//! `00 01` and every component ends with `00 00`.

use bytes::Bytes;
use osier_common::{Path, Schemes, SortedEncode, Timestamp};

use crate::error::{Result, StorageError};

pub const TAG_SPT: u8 = 0x01;
pub const TAG_PST: u8 = 0x02;
pub const TAG_TSP: u8 = 0x03;
pub const TAG_PREFIX: u8 = 0x04;
pub const TAG_WAL: u8 = 0x05;
pub const TAG_REFCOUNT: u8 = 0x06;

pub fn push_escaped_path(out: &mut Vec<u8>, path: &Path) {
    for component in path.components() {
        for &byte in component.iter() {
            if byte == 0x00 {
                out.push(0x00);
                out.push(0x01);
            } else {
                out.push(byte);
            }
        }
        out.push(0x00);
        out.push(0x00);
    }
}

pub fn unescape_path(bytes: &[u8]) -> Result<Path> {
    let mut components = Vec::new();
    let mut current = Vec::new();
    let mut cursor = bytes.iter();
    while let Some(&byte) = cursor.next() {
        if byte != 0x00 {
            current.push(byte);
            continue;
        }
        match cursor.next() {
            Some(0x00) => components.push(Bytes::from(std::mem::take(&mut current))),
            Some(0x01) => current.push(0x00),
            _ => return Err(StorageError::corruption("malformed escaped path")),
        }
    }
    if !current.is_empty() {
        return Err(StorageError::corruption("unterminated path component"));
    }
    Ok(Path::new(components))
}

pub fn escaped_path(path: &Path) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.total_length() + 2 * path.component_count());
    push_escaped_path(&mut out, path);
    out
}

pub fn spt_key<S: Schemes>(subspace: &S::SubspaceId, path: &Path, time: Timestamp) -> Vec<u8> {
    let mut key = vec![TAG_SPT];
    subspace.write_sorted(&mut key);
    push_escaped_path(&mut key, path);
    key.extend_from_slice(&time.to_be_bytes());
    key
}

pub fn pst_key<S: Schemes>(subspace: &S::SubspaceId, path: &Path, time: Timestamp) -> Vec<u8> {
    let mut key = vec![TAG_PST];
    push_escaped_path(&mut key, path);
    subspace.write_sorted(&mut key);
    key.extend_from_slice(&time.to_be_bytes());
    key
}

pub fn tsp_key<S: Schemes>(subspace: &S::SubspaceId, path: &Path, time: Timestamp) -> Vec<u8> {
    let mut key = vec![TAG_TSP];
    key.extend_from_slice(&time.to_be_bytes());
    subspace.write_sorted(&mut key);
    push_escaped_path(&mut key, path);
    key
}

/// The `(subspace, path, time)` location parsed back out of an entry key.
pub struct ParsedKey<S: Schemes> {
    pub subspace: S::SubspaceId,
    pub path: Path,
    pub time: Timestamp,
}

pub fn parse_entry_key<S: Schemes>(key: &[u8]) -> Result<ParsedKey<S>> {
    let width = <S::SubspaceId as SortedEncode>::WIDTH;
    let corrupt = || StorageError::corruption("entry key too short");
    let (tag, rest) = key.split_first().ok_or_else(corrupt)?;
    if rest.len() < width + 8 {
        return Err(corrupt());
    }
    let (subspace_bytes, path_bytes, time_bytes) = match *tag {
        TAG_SPT => {
            let (subspace, rest) = rest.split_at(width);
            let (path, time) = rest.split_at(rest.len() - 8);
            (subspace, path, time)
        }
        TAG_PST => {
            let (rest, time) = rest.split_at(rest.len() - 8);
            let (path, subspace) = rest.split_at(rest.len() - width);
            (subspace, path, time)
        }
        TAG_TSP => {
            let (time, rest) = rest.split_at(8);
            let (subspace, path) = rest.split_at(width);
            (subspace, path, time)
        }
        _ => return Err(StorageError::corruption("unknown entry key tag")),
    };
    let subspace = S::SubspaceId::read_sorted(subspace_bytes)
        .map_err(|_| StorageError::corruption("bad subspace in entry key"))?;
    let path = unescape_path(path_bytes)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(time_bytes);
    Ok(ParsedKey {
        subspace,
        path,
        time: u64::from_be_bytes(raw),
    })
}

pub fn prefix_key<S: Schemes>(subspace: &S::SubspaceId, path: &Path) -> Vec<u8> {
    let mut key = vec![TAG_PREFIX];
    subspace.write_sorted(&mut key);
    push_escaped_path(&mut key, path);
    key
}

pub fn refcount_key<S: Schemes>(digest: &S::PayloadDigest) -> Vec<u8> {
    let mut key = vec![TAG_REFCOUNT];
    digest.write_sorted(&mut key);
    key
}

/// `[start, end)` scan bounds covering every key beginning with `prefix`.
pub fn prefix_bounds(prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let start = prefix.to_vec();
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return (start, end);
        }
        let _ = end.pop();
    }
    // All-0xff prefix: unbounded above within the keyspace.
    (start, vec![0xff; prefix.len() + 9])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(components: &[&[u8]]) -> Path {
        Path::new(components.iter().map(|c| c.to_vec()))
    }

    #[test]
    fn escape_round_trip() {
        for p in [
            path(&[]),
            path(&[b""]),
            path(&[b"a", b"b"]),
            path(&[b"\x00", b"x\x00y"]),
        ] {
            assert_eq!(unescape_path(&escaped_path(&p)).unwrap(), p);
        }
    }

    #[test]
    fn escaped_order_matches_path_order() {
        let mut paths = vec![
            path(&[b"a"]),
            path(&[b"a", b"b"]),
            path(&[b"ab"]),
            path(&[b"a", b""]),
            path(&[]),
            path(&[b"a\x00"]),
        ];
        let mut by_encoding = paths.clone();
        paths.sort();
        by_encoding.sort_by(|x, y| escaped_path(x).cmp(&escaped_path(y)));
        assert_eq!(paths, by_encoding);
    }

    #[test]
    fn extensions_share_the_escaped_prefix() {
        let base = escaped_path(&path(&[b"a"]));
        assert!(escaped_path(&path(&[b"a", b"b"])).starts_with(&base));
        assert!(!escaped_path(&path(&[b"ab"])).starts_with(&base));
    }
}
