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

//! Per-channel outbound flow control.
//!
//! A chunk may only leave once the peer has guaranteed enough bytes to
//! absorb it whole; chunks are never split. Pleading lets the peer claw
//! unused guarantees back.

use std::collections::VecDeque;

use bytes::Bytes;

#[derive(Debug, Default)]
pub struct GuaranteedQueue {
    guarantees: u64,
    pending: VecDeque<Bytes>,
    outgoing: VecDeque<Bytes>,
}

impl GuaranteedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guarantees(&self) -> u64 {
        self.guarantees
    }

    pub fn push(&mut self, bytes: Bytes) {
        self.pending.push_back(bytes);
        self.drain_pending();
    }

    pub fn add_guarantees(&mut self, amount: u64) {
        self.guarantees = self.guarantees.saturating_add(amount);
        self.drain_pending();
    }

    /// Reduce guarantees to `target`, returning the amount absolved.
    pub fn plead(&mut self, target: u64) -> u64 {
        if self.guarantees <= target {
            return 0;
        }
        let absolved = self.guarantees - target;
        self.guarantees = target;
        absolved
    }

    fn drain_pending(&mut self) {
        while let Some(head) = self.pending.front() {
            let size = head.len() as u64;
            if size > self.guarantees {
                break;
            }
            self.guarantees -= size;
            let chunk = self.pending.pop_front().unwrap_or_default();
            self.outgoing.push_back(chunk);
        }
    }

    pub fn pop_outgoing(&mut self) -> Option<Bytes> {
        self.outgoing.pop_front()
    }

    /// Chunks ready for the transport, in order.
    pub fn take_outgoing(&mut self) -> Vec<Bytes> {
        self.outgoing.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
