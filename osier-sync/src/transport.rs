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

//! The byte transport underneath a session, and the handshake framing
//! around it.
//!
//! A [`Transport`] delivers opaque byte chunks in order. [`ReadyTransport`]
//! peels the session preamble off the inbound stream: one byte declaring
//! the peer's maximum payload size as a power of two, then the peer's
//! challenge commitment. Everything after flows through untouched.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use osier_common::Schemes;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};

/// Which end of the session this peer is. The initiator is traditionally
/// called Alfie and the responder Betty; the role decides challenge parity
/// and who opens reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Alfie,
    Betty,
}

impl Role {
    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Alfie)
    }
}

pub trait Transport: Send + Sync + 'static {
    fn role(&self) -> Role;

    fn send(&self, bytes: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// The next inbound chunk, or `None` once the peer is gone.
    fn recv(&self) -> impl Future<Output = Result<Option<Bytes>>> + Send;

    fn close(&self);
}

/// An in-memory duplex transport: two ends joined by byte channels. Used by
/// tests and local sessions.
pub struct DuplexTransport {
    role: Role,
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    receiver: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: AtomicBool,
}

/// A connected pair; the first end is the initiator.
pub fn duplex() -> (DuplexTransport, DuplexTransport) {
    let (alfie_tx, betty_rx) = mpsc::unbounded_channel();
    let (betty_tx, alfie_rx) = mpsc::unbounded_channel();
    (
        DuplexTransport {
            role: Role::Alfie,
            sender: parking_lot::Mutex::new(Some(alfie_tx)),
            receiver: Mutex::new(alfie_rx),
            closed: AtomicBool::new(false),
        },
        DuplexTransport {
            role: Role::Betty,
            sender: parking_lot::Mutex::new(Some(betty_tx)),
            receiver: Mutex::new(betty_rx),
            closed: AtomicBool::new(false),
        },
    )
}

impl Transport for DuplexTransport {
    fn role(&self) -> Role {
        self.role
    }

    async fn send(&self, bytes: Bytes) -> Result<()> {
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender
                .send(bytes)
                .map_err(|_| SyncError::transport("peer receiver dropped")),
            None => Err(SyncError::transport("transport closed")),
        }
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(self.receiver.lock().await.recv().await)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.sender.lock().take();
    }
}

/// The preamble parsed off an inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    pub max_payload_size: u64,
    pub received_commitment: Vec<u8>,
}

/// Handshake framing around a raw transport. `ready()` must resolve before
/// the first `recv()`.
pub struct ReadyTransport<S: Schemes, T> {
    inner: T,
    buffer: Mutex<BytesMut>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Schemes, T: Transport> ReadyTransport<S, T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buffer: Mutex::new(BytesMut::new()),
            _marker: PhantomData,
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role()
    }

    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        self.inner.send(bytes).await
    }

    pub fn close(&self) {
        self.inner.close();
    }

    /// Accumulate and parse the preamble: a power byte, then exactly
    /// `CHALLENGE_HASH_LENGTH` commitment bytes.
    pub async fn ready(&self) -> Result<Preamble> {
        let needed = 1 + S::CHALLENGE_HASH_LENGTH;
        let mut buffer = self.buffer.lock().await;
        while buffer.len() < needed {
            let Some(chunk) = self.inner.recv().await? else {
                return Err(SyncError::transport("transport closed during preamble"));
            };
            buffer.extend_from_slice(&chunk);
        }
        let power = buffer[0];
        if power > 64 {
            return Err(SyncError::validation(format!(
                "max payload size power {power} exceeds 64"
            )));
        }
        let max_payload_size = if power == 64 { u64::MAX } else { 1u64 << power };
        let received_commitment = buffer[1..needed].to_vec();
        let _ = buffer.split_to(needed);
        Ok(Preamble {
            max_payload_size,
            received_commitment,
        })
    }

    /// Post-preamble chunks, leftovers first.
    pub async fn recv(&self) -> Result<Option<Bytes>> {
        {
            let mut buffer = self.buffer.lock().await;
            if !buffer.is_empty() {
                let chunk = buffer.split().freeze();
                return Ok(Some(chunk));
            }
        }
        self.inner.recv().await
    }
}
