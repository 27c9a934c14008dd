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

//! Recursive three-dimensional range-based set reconciliation.
//!
//! One reconciler runs per intersecting pair of areas of interest. Ranges
//! whose fingerprints agree are acknowledged; small diverging ranges are
//! resolved by sending their entries outright; large ones are split and
//! recursed into. Incoming ranges are numbered so that responses can cite
//! which range they close.

use std::sync::Arc;

use osier_common::{Range3d, Schemes};
use osier_storage::{KvStore, PayloadDriver, Store};
use tracing::trace;

use crate::error::Result;

/// Ranges at most this many entries wide are resolved by sending entries
/// instead of recursing further.
pub const SEND_ENTRIES_THRESHOLD: u64 = 8;

/// What the session must transmit on behalf of a reconciler step.
#[derive(Debug)]
pub enum ReconcilerOutput<S: Schemes> {
    Fingerprint {
        range: Range3d<S::SubspaceId>,
        fingerprint: S::Fingerprint,
        covers: Option<u64>,
    },
    /// Announce `count` entries of `range`; the announcer follows up with
    /// the entries themselves.
    Announce {
        range: Range3d<S::SubspaceId>,
        count: u64,
        want_response: bool,
        covers: Option<u64>,
    },
}

pub struct Reconciler<S: Schemes, K: KvStore, P: PayloadDriver<S>> {
    store: Arc<Store<S, K, P>>,
    ours_handle: u64,
    theirs_handle: u64,
    received_ranges: u64,
}

impl<S: Schemes, K: KvStore, P: PayloadDriver<S>> Reconciler<S, K, P> {
    pub fn new(store: Arc<Store<S, K, P>>, ours_handle: u64, theirs_handle: u64) -> Self {
        Self {
            store,
            ours_handle,
            theirs_handle,
            received_ranges: 0,
        }
    }

    pub fn handles(&self) -> (u64, u64) {
        (self.ours_handle, self.theirs_handle)
    }

    /// Number an incoming range so the response can cite it.
    pub fn note_received_range(&mut self) -> u64 {
        let number = self.received_ranges;
        self.received_ranges += 1;
        number
    }

    /// The initiator opens with a fingerprint over the whole intersection.
    pub fn initiate(
        &mut self,
        initial_range: &Range3d<S::SubspaceId>,
    ) -> Result<Vec<ReconcilerOutput<S>>> {
        let summary = self.store.summarise(initial_range)?;
        trace!(size = summary.size, "initiating reconciliation");
        Ok(vec![ReconcilerOutput::Fingerprint {
            range: initial_range.clone(),
            fingerprint: summary.fingerprint,
            covers: None,
        }])
    }

    /// React to the peer's fingerprint over `range`.
    pub fn respond(
        &mut self,
        range: &Range3d<S::SubspaceId>,
        their_fingerprint: &S::Fingerprint,
        their_range_number: u64,
    ) -> Result<Vec<ReconcilerOutput<S>>> {
        let summary = self.store.summarise(range)?;

        if summary.fingerprint == *their_fingerprint {
            trace!(size = summary.size, "range converged");
            return Ok(vec![ReconcilerOutput::Announce {
                range: range.clone(),
                count: 0,
                want_response: false,
                covers: Some(their_range_number),
            }]);
        }

        if summary.size <= SEND_ENTRIES_THRESHOLD {
            trace!(size = summary.size, "sending entries for diverging range");
            return Ok(vec![ReconcilerOutput::Announce {
                range: range.clone(),
                count: summary.size,
                want_response: true,
                covers: Some(their_range_number),
            }]);
        }

        let (left, right) = self.store.split_range(range, summary.size)?;
        let left_summary = self.store.summarise(&left)?;
        let right_summary = self.store.summarise(&right)?;
        trace!(
            left = left_summary.size,
            right = right_summary.size,
            "splitting diverging range"
        );
        Ok(vec![
            ReconcilerOutput::Fingerprint {
                range: left,
                fingerprint: left_summary.fingerprint,
                covers: None,
            },
            ReconcilerOutput::Fingerprint {
                range: right,
                fingerprint: right_summary.fingerprint,
                covers: Some(their_range_number),
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use osier_common::testing::{id8, TestSchemes};
    use osier_common::Path;
    use osier_storage::{MemoryKv, MemoryPayloadDriver, SetInput};

    type TestStore = Store<TestSchemes, MemoryKv, MemoryPayloadDriver<TestSchemes>>;

    async fn store_with(paths: &[&[u8]]) -> Arc<TestStore> {
        let store = Store::new(
            id8("family"),
            Arc::new(MemoryKv::new()),
            MemoryPayloadDriver::new(),
        )
        .await
        .unwrap();
        for (i, component) in paths.iter().enumerate() {
            let event = store
                .set(
                    SetInput {
                        subspace: id8("gemma"),
                        path: Path::new([component.to_vec()]),
                        payload: Bytes::copy_from_slice(component),
                        timestamp: Some(100 + i as u64),
                    },
                    &id8("gemma"),
                )
                .await
                .unwrap();
            assert!(event.is_success());
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn matching_fingerprints_acknowledge_without_entries() {
        let ours = store_with(&[b"a", b"b"]).await;
        let theirs = store_with(&[b"a", b"b"]).await;
        let range = Range3d::full();
        let their_fp = theirs.summarise(&range).unwrap().fingerprint;

        let mut reconciler = Reconciler::new(ours, 0, 0);
        let number = reconciler.note_received_range();
        let outputs = reconciler.respond(&range, &their_fp, number).unwrap();
        assert_eq!(outputs.len(), 1);
        let ReconcilerOutput::Announce {
            count,
            want_response,
            covers,
            ..
        } = &outputs[0]
        else {
            panic!("expected an announce");
        };
        assert_eq!(*count, 0);
        assert!(!want_response);
        assert_eq!(*covers, Some(0));
    }

    #[tokio::test]
    async fn small_diverging_ranges_send_entries() {
        let ours = store_with(&[b"a", b"b", b"c"]).await;
        let theirs = store_with(&[b"a"]).await;
        let range = Range3d::full();
        let their_fp = theirs.summarise(&range).unwrap().fingerprint;

        let mut reconciler = Reconciler::new(ours, 0, 0);
        let number = reconciler.note_received_range();
        let outputs = reconciler.respond(&range, &their_fp, number).unwrap();
        let ReconcilerOutput::Announce {
            count,
            want_response,
            ..
        } = &outputs[0]
        else {
            panic!("expected an announce");
        };
        assert_eq!(*count, 3);
        assert!(want_response);
    }

    #[tokio::test]
    async fn large_diverging_ranges_split() {
        let paths: Vec<Vec<u8>> = (0u8..12).map(|i| vec![i]).collect();
        let path_refs: Vec<&[u8]> = paths.iter().map(Vec::as_slice).collect();
        let ours = store_with(&path_refs).await;
        let theirs = store_with(&[b"zz"]).await;
        let range = Range3d::full();
        let their_fp = theirs.summarise(&range).unwrap().fingerprint;

        let mut reconciler = Reconciler::new(ours.clone(), 0, 0);
        let number = reconciler.note_received_range();
        let outputs = reconciler.respond(&range, &their_fp, number).unwrap();
        assert_eq!(outputs.len(), 2);
        let (mut total, mut covers_seen) = (0, 0);
        for output in &outputs {
            let ReconcilerOutput::Fingerprint { range, covers, .. } = output else {
                panic!("expected fingerprints");
            };
            total += ours.summarise(range).unwrap().size;
            if covers.is_some() {
                covers_seen += 1;
            }
        }
        assert_eq!(total, 12);
        // Only the second half cites the incoming range.
        assert_eq!(covers_seen, 1);
    }
}
