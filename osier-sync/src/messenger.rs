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

//! The session coordinator.
//!
//! One messenger drives one session: it performs the handshake, fans
//! decoded messages out to per-channel handler tasks, funnels outbound
//! messages through the per-channel guaranteed queues, and wires the
//! private-area-intersection finder, interest pairing, reconcilers,
//! announcer, data sender and payload ingesters together over shared
//! handle stores.
//!
//! Any protocol violation tears the whole session down; the caller may
//! open a fresh one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use bytes::Bytes;
use itertools::Itertools;
use osier_common::{AreaOfInterest, Schemes};
use osier_storage::{IngestEvent, IngestPayloadEvent, KvStore, PayloadDriver, SchemeEntry, StoreEvent};
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::aoi_finder::{AoiIntersection, AoiIntersectionFinder};
use crate::announcer::Announcer;
use crate::data_sender::{DataSender, PayloadRequest, PayloadTransform};
use crate::error::{Result, SyncError};
use crate::guaranteed_queue::GuaranteedQueue;
use crate::handle_store::HandleStore;
use crate::pai::{PaiAction, PaiFinder};
use crate::payload_ingester::PayloadIngester;
use crate::reconciler::{Reconciler, ReconcilerOutput};
use crate::store_map::StoreMap;
use crate::transport::{ReadyTransport, Role, Transport};
use crate::wire::{Channel, FrameDecoder, HandleType, Message};

const PAYLOAD_CHUNK_SIZE: usize = 32 * 1024;

/// One read authorisation this peer brings to the session.
pub struct SyncInterest<S: Schemes> {
    pub capability: S::ReadCapability,
    pub secret: S::ReceiverSecret,
    pub aois: Vec<AreaOfInterest<S::SubspaceId>>,
}

pub struct SessionConfig<S: Schemes> {
    pub interests: Vec<SyncInterest<S>>,
    pub max_payload_size_power: u8,
    /// Applied to every outgoing payload chunk.
    pub transform_outgoing: Option<PayloadTransform>,
    /// Applied to every incoming payload chunk.
    pub transform_incoming: Option<PayloadTransform>,
}

impl<S: Schemes> SessionConfig<S> {
    pub fn new(interests: Vec<SyncInterest<S>>) -> Self {
        Self {
            interests,
            max_payload_size_power: 32,
            transform_outgoing: None,
            transform_incoming: None,
        }
    }
}

struct Challenges {
    ours: Vec<u8>,
    theirs: Vec<u8>,
}

struct CapBinding<S: Schemes> {
    capability: S::ReadCapability,
}

impl<S: Schemes> Clone for CapBinding<S> {
    fn clone(&self) -> Self {
        Self {
            capability: self.capability.clone(),
        }
    }
}

struct AoiBinding<S: Schemes> {
    aoi: AreaOfInterest<S::SubspaceId>,
    namespace: S::NamespaceId,
}

impl<S: Schemes> Clone for AoiBinding<S> {
    fn clone(&self) -> Self {
        Self {
            aoi: self.aoi.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

/// The range currently receiving announced entries.
struct ReceivingEntries<S: Schemes> {
    namespace: S::NamespaceId,
    range: osier_common::Range3d<S::SubspaceId>,
    remaining: u64,
}

struct SessionState<S: Schemes, K: KvStore, P: PayloadDriver<S>, T: Transport> {
    transport: ReadyTransport<S, T>,
    role: Role,
    source_tag: String,
    stores: Arc<StoreMap<S, K, P>>,
    interests: Vec<SyncInterest<S>>,
    nonce: Vec<u8>,

    peer_max_payload: OnceLock<u64>,
    received_commitment: OnceLock<Vec<u8>>,
    challenges: OnceLock<Challenges>,
    challenges_ready: Notify,

    out_tx: mpsc::UnboundedSender<Bytes>,
    out_queues: [parking_lot::Mutex<GuaranteedQueue>; 7],

    intersections_ours: Arc<HandleStore<S::GroupMember>>,
    intersections_theirs: Arc<HandleStore<S::GroupMember>>,
    caps_ours: Arc<HandleStore<CapBinding<S>>>,
    caps_theirs: Arc<HandleStore<S::ReadCapability>>,
    aois_ours: Arc<HandleStore<AoiBinding<S>>>,
    aois_theirs: Arc<HandleStore<AoiBinding<S>>>,
    statics_ours: Arc<HandleStore<S::StaticToken>>,
    statics_theirs: Arc<HandleStore<S::StaticToken>>,
    payload_requests_ours: Arc<HandleStore<PayloadRequest<S>>>,
    payload_requests_theirs: Arc<HandleStore<PayloadRequest<S>>>,

    pai: parking_lot::Mutex<PaiFinder<S>>,
    aoi_finder: parking_lot::Mutex<AoiIntersectionFinder<S>>,
    reconcilers: tokio::sync::Mutex<HashMap<(u64, u64), Reconciler<S, K, P>>>,
    reconcilers_changed: Notify,
    announcer: tokio::sync::Mutex<Announcer<S>>,
    data_sender: DataSender<S, K, P>,
    reconciliation_ingester: tokio::sync::Mutex<PayloadIngester<S, K, P>>,
    data_ingester: tokio::sync::Mutex<PayloadIngester<S, K, P>>,
    /// Serialises multi-message sends on the data channel, so payload
    /// chunks from one batch cannot interleave with another's.
    data_send_lock: tokio::sync::Mutex<()>,
    /// Handle values are implicit in bind-message order, so allocating a
    /// handle and emitting its bind message must not interleave across
    /// tasks.
    bind_send_lock: tokio::sync::Mutex<()>,
    receiving: tokio::sync::Mutex<Option<ReceivingEntries<S>>>,

    error: parking_lot::Mutex<Option<SyncError>>,
    closed: Notify,
}

pub struct WgpsMessenger<S: Schemes, K: KvStore, P: PayloadDriver<S>, T: Transport> {
    state: Arc<SessionState<S, K, P, T>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Schemes, K: KvStore, P: PayloadDriver<S>, T: Transport> WgpsMessenger<S, K, P, T> {
    /// Validate the configuration, run the handshake preamble, and spawn
    /// the session tasks.
    pub fn open(
        transport: T,
        config: SessionConfig<S>,
        stores: Arc<StoreMap<S, K, P>>,
    ) -> Result<Self> {
        if config.max_payload_size_power > 64 {
            return Err(SyncError::validation(
                "max payload size power exceeds 64",
            ));
        }
        for interest in &config.interests {
            let granted = S::granted_area(&interest.capability);
            for aoi in &interest.aois {
                if !granted.includes_area(&aoi.area) {
                    return Err(SyncError::validation(
                        "area of interest is not contained in its capability's granted area",
                    ));
                }
            }
            let namespace = S::granted_namespace(&interest.capability);
            if stores.get(&namespace).is_none() {
                return Err(SyncError::validation(
                    "no store for an interest's namespace",
                ));
            }
        }

        let mut nonce = vec![0u8; S::CHALLENGE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);
        let source_tag = format!("sync-{}", hex::encode(&nonce[..4.min(nonce.len())]));

        let role = transport.role();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let intersections_ours = Arc::new(HandleStore::new());
        let intersections_theirs = Arc::new(HandleStore::new());
        let payload_requests_theirs = Arc::new(HandleStore::new());
        let statics_ours = Arc::new(HandleStore::new());

        let state = Arc::new(SessionState {
            transport: ReadyTransport::new(transport),
            role,
            source_tag,
            stores: stores.clone(),
            interests: config.interests,
            nonce,
            peer_max_payload: OnceLock::new(),
            received_commitment: OnceLock::new(),
            challenges: OnceLock::new(),
            challenges_ready: Notify::new(),
            out_tx,
            out_queues: std::array::from_fn(|_| parking_lot::Mutex::new(GuaranteedQueue::new())),
            pai: parking_lot::Mutex::new(PaiFinder::new(
                intersections_ours.clone(),
                intersections_theirs.clone(),
            )),
            intersections_ours,
            intersections_theirs,
            caps_ours: Arc::new(HandleStore::new()),
            caps_theirs: Arc::new(HandleStore::new()),
            aois_ours: Arc::new(HandleStore::new()),
            aois_theirs: Arc::new(HandleStore::new()),
            statics_theirs: Arc::new(HandleStore::new()),
            payload_requests_ours: Arc::new(HandleStore::new()),
            aoi_finder: parking_lot::Mutex::new(AoiIntersectionFinder::new()),
            reconcilers: tokio::sync::Mutex::new(HashMap::new()),
            reconcilers_changed: Notify::new(),
            announcer: tokio::sync::Mutex::new(Announcer::new(statics_ours.clone())),
            statics_ours,
            data_sender: DataSender::new(
                stores.clone(),
                payload_requests_theirs.clone(),
                config.transform_outgoing,
            ),
            payload_requests_theirs,
            reconciliation_ingester: tokio::sync::Mutex::new(PayloadIngester::new(
                stores.clone(),
                config.transform_incoming.clone(),
            )),
            data_ingester: tokio::sync::Mutex::new(PayloadIngester::new(
                stores,
                config.transform_incoming,
            )),
            data_send_lock: tokio::sync::Mutex::new(()),
            bind_send_lock: tokio::sync::Mutex::new(()),
            receiving: tokio::sync::Mutex::new(None),
            error: parking_lot::Mutex::new(None),
            closed: Notify::new(),
        });

        let messenger = Self {
            state: state.clone(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        };

        // Preamble: one power byte, then our commitment.
        let commitment = S::challenge_hash(&state.nonce);
        let mut preamble = Vec::with_capacity(1 + commitment.len());
        preamble.push(config.max_payload_size_power);
        preamble.extend_from_slice(&commitment);
        if state.out_tx.send(Bytes::from(preamble)).is_err() {
            return Err(SyncError::transport("writer gone before handshake"));
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Self::run_writer(state.clone(), out_rx)));

        let (channel_txs, channel_rxs): (Vec<_>, Vec<_>) =
            (0..8).map(|_| mpsc::unbounded_channel()).unzip();
        for (index, rx) in channel_rxs.into_iter().enumerate() {
            tasks.push(tokio::spawn(Self::run_handler(state.clone(), rx, index)));
        }
        tasks.push(tokio::spawn(Self::run_reader(state.clone(), channel_txs)));
        tasks.push(tokio::spawn(Self::run_forwarder(state.clone())));

        *messenger.tasks.lock() = tasks;
        Ok(messenger)
    }

    pub fn close(&self) {
        self.state.transport.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Close the session and wait for every task to wind down.
    pub async fn shutdown(self) {
        self.state.transport.close();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        let _ = futures::future::join_all(tasks).await;
    }

    /// The error that terminated the session, if one has.
    pub fn error(&self) -> Option<String> {
        self.state.error.lock().as_ref().map(|e| e.to_string())
    }

    /// Resolves when the session has terminated.
    pub async fn closed(&self) {
        self.state.closed.notified().await;
    }

    async fn run_writer(
        state: Arc<SessionState<S, K, P, T>>,
        mut out_rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        while let Some(chunk) = out_rx.recv().await {
            if let Err(error) = state.transport.send(chunk).await {
                state.fail(error);
                return;
            }
        }
    }

    async fn run_reader(
        state: Arc<SessionState<S, K, P, T>>,
        channel_txs: Vec<mpsc::UnboundedSender<Message<S>>>,
    ) {
        if let Err(error) = Self::read_loop(&state, &channel_txs).await {
            state.fail(error);
        }
        state.closed.notify_waiters();
    }

    async fn read_loop(
        state: &Arc<SessionState<S, K, P, T>>,
        channel_txs: &[mpsc::UnboundedSender<Message<S>>],
    ) -> Result<()> {
        let preamble = state.transport.ready().await?;
        let _ = state.peer_max_payload.set(preamble.max_payload_size);
        let _ = state
            .received_commitment
            .set(preamble.received_commitment);
        debug!(
            max_payload = preamble.max_payload_size,
            "received session preamble"
        );

        state.send_message(Message::CommitmentReveal {
            nonce: state.nonce.clone(),
        })?;
        // No backpressure: hand the peer unbounded guarantees on every
        // channel up front.
        for channel in Channel::ALL {
            state.send_message(Message::ControlIssueGuarantee {
                channel,
                amount: u64::MAX,
            })?;
        }

        // Dissolve our capabilities into blinded fragments.
        let actions: Vec<PaiAction<S>> = {
            let mut pai = state.pai.lock();
            let mut actions = Vec::new();
            for (index, interest) in state.interests.iter().enumerate() {
                actions.extend(pai.submit_capability(index, &interest.capability));
            }
            actions
        };
        state.process_pai_actions(actions).await?;

        let mut decoder = FrameDecoder::new();
        loop {
            let Some(chunk) = state.transport.recv().await? else {
                return Ok(());
            };
            decoder.push_chunk(&chunk);
            while let Some(message) = decoder.next_message::<S>()? {
                trace!(kind = message.kind_name(), "received message");
                let index = message.channel().map_or(7, Channel::index);
                channel_txs[index]
                    .send(message)
                    .map_err(|_| SyncError::transport("channel handler gone"))?;
            }
        }
    }

    async fn run_handler(
        state: Arc<SessionState<S, K, P, T>>,
        mut rx: mpsc::UnboundedReceiver<Message<S>>,
        index: usize,
    ) {
        while let Some(message) = rx.recv().await {
            if let Err(error) = state.handle_message(message).await {
                warn!(channel = index, %error, "session failed");
                state.fail(error);
                return;
            }
        }
    }

    /// Push entries ingested outside this session to the peer when its
    /// interests cover them.
    async fn run_forwarder(state: Arc<SessionState<S, K, P, T>>) {
        let mut subscriptions = Vec::new();
        let mut seen = Vec::new();
        for interest in &state.interests {
            let namespace = S::granted_namespace(&interest.capability);
            if seen.contains(&namespace) {
                continue;
            }
            if let Some(store) = state.stores.get(&namespace) {
                subscriptions.push(store.subscribe());
                seen.push(namespace);
            }
        }
        if subscriptions.is_empty() {
            return;
        }
        // One merged loop over every subscribed store.
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        for mut subscription in subscriptions {
            let event_tx = event_tx.clone();
            let _ = tokio::spawn(async move {
                loop {
                    match subscription.recv().await {
                        Ok(event) => {
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            });
        }
        drop(event_tx);
        while let Some(event) = event_rx.recv().await {
            if let StoreEvent::EntryIngested { entry, source } = event {
                if source == state.source_tag {
                    continue;
                }
                if let Err(error) = state.forward_entry(entry).await {
                    state.fail(error);
                    return;
                }
            }
        }
    }
}

impl<S: Schemes, K: KvStore, P: PayloadDriver<S>, T: Transport> SessionState<S, K, P, T> {
    fn fail(&self, error: SyncError) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.transport.close();
        self.closed.notify_waiters();
    }

    fn send_message(&self, message: Message<S>) -> Result<()> {
        trace!(kind = message.kind_name(), "sending message");
        let frame = message.to_frame();
        match message.channel() {
            None => self
                .out_tx
                .send(frame)
                .map_err(|_| SyncError::transport("writer gone")),
            Some(channel) => {
                let ready = {
                    let mut queue = self.out_queues[channel.index()].lock();
                    queue.push(frame);
                    queue.take_outgoing()
                };
                for chunk in ready {
                    self.out_tx
                        .send(chunk)
                        .map_err(|_| SyncError::transport("writer gone"))?;
                }
                Ok(())
            }
        }
    }

    async fn challenges(&self) -> &Challenges {
        loop {
            let waiter = self.challenges_ready.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();
            if let Some(challenges) = self.challenges.get() {
                return challenges;
            }
            waiter.await;
        }
    }

    fn chunk_size(&self) -> usize {
        let peer_max = self.peer_max_payload.get().copied().unwrap_or(u64::MAX);
        usize::try_from(peer_max.min(PAYLOAD_CHUNK_SIZE as u64)).unwrap_or(PAYLOAD_CHUNK_SIZE)
    }

    async fn handle_message(self: &Arc<Self>, message: Message<S>) -> Result<()> {
        match message {
            Message::CommitmentReveal { nonce } => self.handle_commitment_reveal(nonce),
            Message::ControlIssueGuarantee { channel, amount } => {
                let ready = {
                    let mut queue = self.out_queues[channel.index()].lock();
                    queue.add_guarantees(amount);
                    queue.take_outgoing()
                };
                for chunk in ready {
                    self.out_tx
                        .send(chunk)
                        .map_err(|_| SyncError::transport("writer gone"))?;
                }
                Ok(())
            }
            Message::ControlAbsolve { .. } => Ok(()),
            Message::ControlPlead { channel, target } => {
                let amount = self.out_queues[channel.index()].lock().plead(target);
                self.send_message(Message::ControlAbsolve { channel, amount })
            }
            Message::ControlAnnounceDropping { .. } | Message::ControlApologise { .. } => {
                Err(SyncError::protocol(
                    "optimistic dropping is never negotiated in this session",
                ))
            }
            Message::ControlFree {
                handle,
                handle_type,
                mine,
            } => self.handle_free(handle, handle_type, mine),
            Message::DataSetMetadata { .. } => {
                trace!("ignoring metadata");
                Ok(())
            }
            Message::PaiBindFragment {
                group_member,
                is_secondary,
            } => {
                let actions = self.pai.lock().received_bind(group_member, is_secondary);
                self.process_pai_actions(actions).await
            }
            Message::PaiReplyFragment {
                handle,
                group_member,
            } => {
                self.intersections_ours.increment_reference(handle);
                let result = self.pai.lock().received_reply(handle, group_member);
                self.intersections_ours.decrement_reference(handle);
                self.process_pai_actions(result?).await
            }
            Message::PaiRequestSubspaceCapability { handle } => {
                self.intersections_ours.increment_reference(handle);
                let action = self.pai.lock().received_subspace_request(handle);
                self.intersections_ours.decrement_reference(handle);
                self.process_pai_actions(vec![action?]).await
            }
            Message::PaiReplySubspaceCapability {
                handle,
                capability,
                signature,
            } => {
                if !S::is_valid_subspace_cap(&capability) {
                    return Err(SyncError::authorisation("invalid subspace capability"));
                }
                let challenges = self.challenges().await;
                if !S::verify_challenge(
                    &S::subspace_cap_receiver(&capability),
                    &challenges.theirs,
                    &signature,
                ) {
                    return Err(SyncError::authorisation(
                        "subspace capability signature does not match the challenge",
                    ));
                }
                let actions = self
                    .pai
                    .lock()
                    .received_subspace_reply(handle, &capability)?;
                self.process_pai_actions(actions).await
            }
            Message::SetupBindReadCapability {
                capability,
                handle,
                signature,
            } => {
                self.handle_bind_read_capability(capability, handle, signature)
                    .await
            }
            Message::SetupBindAreaOfInterest {
                area_of_interest,
                authorisation,
            } => {
                self.handle_bind_aoi(area_of_interest, authorisation).await
            }
            Message::SetupBindStaticToken { static_token } => {
                let _ = self.statics_theirs.bind(static_token);
                Ok(())
            }
            Message::ReconciliationSendFingerprint {
                range,
                fingerprint,
                sender_handle,
                receiver_handle,
                covers: _,
            } => {
                let key = (receiver_handle, sender_handle);
                let outputs = {
                    let mut reconcilers = self.reconciler_eventually(key).await;
                    let reconciler = reconcilers
                        .get_mut(&key)
                        .expect("reconciler_eventually guarantees presence");
                    let number = reconciler.note_received_range();
                    reconciler.respond(&range, &fingerprint, number)?
                };
                self.process_reconciler_outputs(receiver_handle, sender_handle, outputs)
                    .await
            }
            Message::ReconciliationAnnounceEntries {
                range,
                count,
                want_response,
                will_sort: _,
                sender_handle,
                receiver_handle,
                covers: _,
            } => {
                self.handle_announce_entries(
                    range,
                    count,
                    want_response,
                    sender_handle,
                    receiver_handle,
                )
                .await
            }
            Message::ReconciliationSendEntry {
                entry,
                static_token_handle,
                dynamic_token,
            } => {
                self.handle_reconciliation_entry(entry, static_token_handle, dynamic_token)
                    .await
            }
            Message::ReconciliationSendPayload { amount, bytes } => {
                if bytes.len() as u64 != amount {
                    return Err(SyncError::protocol("payload chunk length mismatch"));
                }
                let event = self
                    .reconciliation_ingester
                    .lock()
                    .await
                    .push(bytes, false)
                    .await?;
                check_payload_event(event)
            }
            Message::DataSendEntry {
                entry,
                offset,
                static_token_handle,
                dynamic_token,
            } => {
                self.handle_data_entry(entry, offset, static_token_handle, dynamic_token)
                    .await
            }
            Message::DataSendPayload { amount, bytes } => {
                if bytes.len() as u64 != amount {
                    return Err(SyncError::protocol("payload chunk length mismatch"));
                }
                let event = self.data_ingester.lock().await.push(bytes, false).await?;
                check_payload_event(event)
            }
            Message::DataBindPayloadRequest {
                entry,
                offset,
                capability,
            } => {
                self.handle_bind_payload_request(entry, offset, capability)
                    .await
            }
            Message::DataReplyPayload { handle } => {
                self.payload_requests_ours.increment_reference(handle);
                let request = self.payload_requests_ours.get_eventually(handle).await;
                self.payload_requests_ours.decrement_reference(handle);
                let _ = self
                    .data_ingester
                    .lock()
                    .await
                    .target(request.entry, request.offset, false);
                Ok(())
            }
        }
    }

    fn handle_commitment_reveal(&self, their_nonce: Vec<u8>) -> Result<()> {
        if self.challenges.get().is_some() {
            return Err(SyncError::protocol("commitment revealed twice"));
        }
        let received = self
            .received_commitment
            .get()
            .ok_or_else(|| SyncError::protocol("reveal before commitment"))?;
        if S::challenge_hash(&their_nonce) != *received {
            return Err(SyncError::authorisation(
                "revealed nonce does not hash to the commitment",
            ));
        }
        if their_nonce.len() != self.nonce.len() {
            return Err(SyncError::protocol("nonce length mismatch"));
        }
        let xor: Vec<u8> = self
            .nonce
            .iter()
            .zip(&their_nonce)
            .map(|(a, b)| a ^ b)
            .collect();
        let complement: Vec<u8> = xor.iter().map(|b| !b).collect();
        let challenges = if self.role.is_initiator() {
            Challenges {
                ours: xor,
                theirs: complement,
            }
        } else {
            Challenges {
                ours: complement,
                theirs: xor,
            }
        };
        let _ = self.challenges.set(challenges);
        self.challenges_ready.notify_waiters();
        info!(role = ?self.role, "handshake complete");
        Ok(())
    }

    fn handle_free(&self, handle: u64, handle_type: HandleType, mine: bool) -> Result<()> {
        // `mine` speaks from the sender's perspective: true frees a handle
        // the sender bound, false asks us to free one of ours and expects
        // an echo.
        match (handle_type, mine) {
            (HandleType::Intersection, true) => self.intersections_theirs.mark_for_freeing(handle),
            (HandleType::Intersection, false) => self.intersections_ours.mark_for_freeing(handle),
            (HandleType::Capability, true) => self.caps_theirs.mark_for_freeing(handle),
            (HandleType::Capability, false) => self.caps_ours.mark_for_freeing(handle),
            (HandleType::AreaOfInterest, true) => self.aois_theirs.mark_for_freeing(handle),
            (HandleType::AreaOfInterest, false) => self.aois_ours.mark_for_freeing(handle),
            (HandleType::PayloadRequest, true) => {
                self.payload_requests_theirs.mark_for_freeing(handle)
            }
            (HandleType::PayloadRequest, false) => {
                self.payload_requests_ours.mark_for_freeing(handle)
            }
            (HandleType::StaticToken, true) => self.statics_theirs.mark_for_freeing(handle),
            (HandleType::StaticToken, false) => self.statics_ours.mark_for_freeing(handle),
        }
        if !mine {
            self.send_message(Message::ControlFree {
                handle,
                handle_type,
                mine: true,
            })?;
        }
        Ok(())
    }

    async fn process_pai_actions(self: &Arc<Self>, actions: Vec<PaiAction<S>>) -> Result<()> {
        for action in actions {
            match action {
                PaiAction::Send(message) => self.send_message(message)?,
                PaiAction::Intersection {
                    interest,
                    our_handle,
                } => {
                    self.bind_and_send_capability(interest, our_handle).await?;
                }
                PaiAction::ReplySubspaceCapability {
                    our_handle,
                    interest,
                } => {
                    let capability = &self.interests[interest].capability;
                    let subspace_cap = S::subspace_cap_for(capability).ok_or_else(|| {
                        SyncError::protocol(
                            "peer requested a subspace proof this capability cannot give",
                        )
                    })?;
                    let challenges = self.challenges().await;
                    let signature =
                        S::sign_challenge(&self.interests[interest].secret, &challenges.ours);
                    self.send_message(Message::PaiReplySubspaceCapability {
                        handle: our_handle,
                        capability: subspace_cap,
                        signature,
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Reveal one of our capabilities and bind its areas of interest.
    async fn bind_and_send_capability(
        self: &Arc<Self>,
        interest_index: usize,
        intersection_handle: u64,
    ) -> Result<()> {
        let interest = &self.interests[interest_index];
        let namespace = S::granted_namespace(&interest.capability);
        let challenges = self.challenges().await;
        let signature = S::sign_challenge(&interest.secret, &challenges.ours);
        let _guard = self.bind_send_lock.lock().await;
        let cap_handle = self.caps_ours.bind(CapBinding {
            capability: interest.capability.clone(),
        });
        debug!(cap_handle, "revealing capability");
        self.send_message(Message::SetupBindReadCapability {
            capability: interest.capability.clone(),
            handle: intersection_handle,
            signature,
        })?;

        for aoi in &interest.aois {
            let aoi_handle = self.aois_ours.bind(AoiBinding {
                aoi: aoi.clone(),
                namespace: namespace.clone(),
            });
            self.send_message(Message::SetupBindAreaOfInterest {
                area_of_interest: aoi.clone(),
                authorisation: cap_handle,
            })?;
            let intersections = self.aoi_finder.lock().add_ours(
                aoi_handle,
                namespace.clone(),
                aoi.clone(),
            );
            for intersection in intersections {
                self.start_reconciler(intersection).await?;
            }
        }
        Ok(())
    }

    async fn handle_bind_read_capability(
        self: &Arc<Self>,
        capability: S::ReadCapability,
        handle: u64,
        signature: S::Signature,
    ) -> Result<()> {
        self.intersections_theirs.increment_reference(handle);
        let _member = self.intersections_theirs.get_eventually(handle).await;
        self.intersections_theirs.decrement_reference(handle);

        if !S::is_valid_capability(&capability) {
            return Err(SyncError::authorisation("invalid read capability"));
        }
        let challenges = self.challenges().await;
        if !S::verify_challenge(
            &S::cap_receiver(&capability),
            &challenges.theirs,
            &signature,
        ) {
            return Err(SyncError::authorisation(
                "capability signature does not match the challenge",
            ));
        }
        let namespace = S::granted_namespace(&capability);
        if let Some(fragment) = self.pai.lock().intersection_context(handle) {
            let fragment_namespace = match &fragment {
                osier_common::Fragment::Pair { namespace, .. }
                | osier_common::Fragment::Triple { namespace, .. } => namespace.clone(),
            };
            if fragment_namespace != namespace {
                return Err(SyncError::protocol(
                    "capability namespace differs from the intersected fragment",
                ));
            }
        }
        let granted = S::granted_area(&capability);
        let _ = self.caps_theirs.bind(capability);
        debug!("peer revealed a capability");

        // The peer has proven read access; any of our still-hidden
        // interests overlapping it may now be revealed too.
        let reactive = {
            let mut pai = self.pai.lock();
            self.interests
                .iter()
                .enumerate()
                .filter(|(_, interest)| {
                    S::granted_namespace(&interest.capability) == namespace
                        && S::granted_area(&interest.capability)
                            .intersect(&granted)
                            .is_some()
                })
                .filter_map(|(index, _)| {
                    pai.take_reactive_emission(index)
                        .map(|handle| (index, handle))
                })
                .collect_vec()
        };
        for (index, our_handle) in reactive {
            self.bind_and_send_capability(index, our_handle).await?;
        }
        Ok(())
    }

    async fn handle_bind_aoi(
        self: &Arc<Self>,
        aoi: AreaOfInterest<S::SubspaceId>,
        authorisation: u64,
    ) -> Result<()> {
        if !S::path_is_valid(&aoi.area.path_prefix) {
            return Err(SyncError::protocol("area path exceeds the path limits"));
        }
        self.caps_theirs.increment_reference(authorisation);
        let capability = self.caps_theirs.get_eventually(authorisation).await;
        self.caps_theirs.decrement_reference(authorisation);

        if !S::granted_area(&capability).includes_area(&aoi.area) {
            return Err(SyncError::authorisation(
                "area of interest escapes the capability's granted area",
            ));
        }
        let namespace = S::granted_namespace(&capability);
        let handle = self.aois_theirs.bind(AoiBinding {
            aoi: aoi.clone(),
            namespace: namespace.clone(),
        });
        let intersections = self
            .aoi_finder
            .lock()
            .add_theirs(handle, namespace, aoi);
        for intersection in intersections {
            self.start_reconciler(intersection).await?;
        }
        Ok(())
    }

    async fn start_reconciler(self: &Arc<Self>, intersection: AoiIntersection<S>) -> Result<()> {
        let store = self
            .stores
            .get(&intersection.namespace)
            .ok_or_else(|| SyncError::protocol("interest pair in an unknown namespace"))?;
        let ours = self
            .aois_ours
            .get(intersection.ours)
            .ok_or_else(|| SyncError::protocol("paired local interest vanished"))?;
        let theirs = self
            .aois_theirs
            .get(intersection.theirs)
            .ok_or_else(|| SyncError::protocol("paired remote interest vanished"))?;

        let initial = store
            .area_of_interest_to_range(&ours.aoi)?
            .intersection(&store.area_of_interest_to_range(&theirs.aoi)?);

        let key = (intersection.ours, intersection.theirs);
        let mut reconcilers = self.reconcilers.lock().await;
        if reconcilers.contains_key(&key) {
            return Ok(());
        }
        let mut reconciler = Reconciler::new(store, intersection.ours, intersection.theirs);
        info!(
            ours = intersection.ours,
            theirs = intersection.theirs,
            "interest pair established"
        );
        let outputs = if self.role.is_initiator() {
            reconciler.initiate(&initial)?
        } else {
            Vec::new()
        };
        let _ = reconcilers.insert(key, reconciler);
        drop(reconcilers);
        self.reconcilers_changed.notify_waiters();
        self.process_reconciler_outputs(intersection.ours, intersection.theirs, outputs)
            .await
    }

    /// Lock the reconciler map once the pair exists; fingerprints can
    /// overtake the interest bind that creates it.
    async fn reconciler_eventually(
        &self,
        key: (u64, u64),
    ) -> tokio::sync::MutexGuard<'_, HashMap<(u64, u64), Reconciler<S, K, P>>> {
        loop {
            let waiter = self.reconcilers_changed.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();
            let guard = self.reconcilers.lock().await;
            if guard.contains_key(&key) {
                return guard;
            }
            drop(guard);
            waiter.await;
        }
    }

    async fn process_reconciler_outputs(
        self: &Arc<Self>,
        ours_handle: u64,
        theirs_handle: u64,
        outputs: Vec<ReconcilerOutput<S>>,
    ) -> Result<()> {
        for output in outputs {
            match output {
                ReconcilerOutput::Fingerprint {
                    range,
                    fingerprint,
                    covers,
                } => {
                    self.send_message(Message::ReconciliationSendFingerprint {
                        range,
                        fingerprint,
                        sender_handle: ours_handle,
                        receiver_handle: theirs_handle,
                        covers,
                    })?;
                }
                ReconcilerOutput::Announce {
                    range,
                    count: _,
                    want_response,
                    covers,
                } => {
                    self.send_announcement(
                        ours_handle,
                        theirs_handle,
                        &range,
                        want_response,
                        covers,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn send_announcement(
        self: &Arc<Self>,
        ours_handle: u64,
        theirs_handle: u64,
        range: &osier_common::Range3d<S::SubspaceId>,
        want_response: bool,
        covers: Option<u64>,
    ) -> Result<()> {
        let ours = self
            .aois_ours
            .get(ours_handle)
            .ok_or_else(|| SyncError::protocol("announcing for a freed interest"))?;
        let store = self
            .stores
            .get(&ours.namespace)
            .ok_or_else(|| SyncError::protocol("announcing for an unknown namespace"))?;
        // Hold the announcer across the sends: static-token handles are
        // implicit in bind-message order.
        let mut announcer = self.announcer.lock().await;
        let pack = announcer
            .queue_announce(
                &store,
                range,
                want_response,
                covers,
                ours_handle,
                theirs_handle,
            )
            .await?;
        for message in pack.into_messages() {
            self.send_message(message)?;
        }
        Ok(())
    }

    async fn handle_announce_entries(
        self: &Arc<Self>,
        range: osier_common::Range3d<S::SubspaceId>,
        count: u64,
        want_response: bool,
        sender_handle: u64,
        receiver_handle: u64,
    ) -> Result<()> {
        let key = (receiver_handle, sender_handle);
        let number = {
            let mut reconcilers = self.reconciler_eventually(key).await;
            let reconciler = reconcilers
                .get_mut(&key)
                .expect("reconciler_eventually guarantees presence");
            reconciler.note_received_range()
        };
        let namespace = self
            .aois_ours
            .get(receiver_handle)
            .ok_or_else(|| SyncError::protocol("announcement cites a freed interest"))?
            .namespace;

        {
            let mut receiving = self.receiving.lock().await;
            if let Some(previous) = receiving.as_ref() {
                if previous.remaining > 0 {
                    return Err(SyncError::protocol(
                        "new announcement before the previous range's entries all arrived",
                    ));
                }
            }
            *receiving = Some(ReceivingEntries {
                namespace,
                range: range.clone(),
                remaining: count,
            });
        }
        // An inline payload cut short by this announcement is fetched
        // explicitly instead.
        let candidate = self.reconciliation_ingester.lock().await.terminate();
        if let Some(entry) = candidate {
            self.request_payload(entry).await?;
        }

        if want_response {
            self.send_announcement(receiver_handle, sender_handle, &range, false, Some(number))
                .await?;
        }
        Ok(())
    }

    async fn handle_reconciliation_entry(
        self: &Arc<Self>,
        lengthy: crate::wire::SchemeLengthyEntry<S>,
        static_token_handle: u64,
        dynamic_token: S::DynamicToken,
    ) -> Result<()> {
        {
            let mut receiving = self.receiving.lock().await;
            let Some(state) = receiving.as_mut() else {
                return Err(SyncError::protocol("entry outside any announced range"));
            };
            if state.remaining == 0 {
                return Err(SyncError::protocol(
                    "more entries than the announcement declared",
                ));
            }
            if lengthy.entry.namespace_id != state.namespace
                || !state.range.includes_entry(&lengthy.entry)
            {
                return Err(SyncError::protocol("entry outside the announced range"));
            }
            state.remaining -= 1;
        }

        if !S::path_is_valid(&lengthy.entry.path) {
            return Err(SyncError::protocol("entry path exceeds the path limits"));
        }

        self.statics_theirs.increment_reference(static_token_handle);
        let static_token = self
            .statics_theirs
            .get_eventually(static_token_handle)
            .await;
        self.statics_theirs.decrement_reference(static_token_handle);
        let token = S::recompose_token(&static_token, &dynamic_token);

        let store = self
            .stores
            .get(&lengthy.entry.namespace_id)
            .ok_or_else(|| SyncError::protocol("entry for an unknown namespace"))?;
        let event = store
            .ingest_entry(
                lengthy.entry.clone(),
                token,
                Some(self.source_tag.clone()),
            )
            .await?;
        if let IngestEvent::Rejected(reason) = event {
            return Err(SyncError::authorisation(format!(
                "peer sent an unacceptable entry: {reason:?}"
            )));
        }

        // Aim the inline-payload ingester at this entry, and fetch the
        // payload explicitly when the peer holds all of it and we do not.
        let held = store
            .entry_at(&lengthy.entry.subspace_id, &lengthy.entry.path)?
            .filter(|(stored, _)| *stored == lengthy.entry);
        if let Some((_, record)) = held {
            let _ = self.reconciliation_ingester.lock().await.target(
                lengthy.entry.clone(),
                record.available,
                false,
            );
            if lengthy.entry.payload_length > 0
                && record.available < lengthy.entry.payload_length
                && lengthy.available == lengthy.entry.payload_length
            {
                self.request_payload(lengthy.entry).await?;
            }
        }
        Ok(())
    }

    /// Bind a payload request for `entry` and ask the peer to stream it.
    async fn request_payload(self: &Arc<Self>, entry: SchemeEntry<S>) -> Result<()> {
        let Some(capability) = self.cap_for_entry(&entry) else {
            // Without a capability handle covering the entry the request
            // cannot be authorised; reconciliation already delivered the
            // metadata, so just skip the payload.
            warn!("no capability covers a payload we want; skipping request");
            return Ok(());
        };
        let _guard = self.bind_send_lock.lock().await;
        let handle = self.payload_requests_ours.bind(PayloadRequest {
            entry: entry.clone(),
            offset: 0,
        });
        trace!(handle, "requesting payload");
        self.send_message(Message::DataBindPayloadRequest {
            entry,
            offset: 0,
            capability,
        })
    }

    /// CapFinder: the handle of one of our bound capabilities covering an
    /// entry.
    fn cap_for_entry(&self, entry: &SchemeEntry<S>) -> Option<u64> {
        self.caps_ours
            .entries()
            .into_iter()
            .find(|(_, binding)| {
                S::granted_namespace(&binding.capability) == entry.namespace_id
                    && S::granted_area(&binding.capability).includes_entry(entry)
            })
            .map(|(handle, _)| handle)
    }

    async fn handle_data_entry(
        self: &Arc<Self>,
        entry: SchemeEntry<S>,
        offset: u64,
        static_token_handle: u64,
        dynamic_token: S::DynamicToken,
    ) -> Result<()> {
        if !S::path_is_valid(&entry.path) {
            return Err(SyncError::protocol("entry path exceeds the path limits"));
        }
        self.statics_theirs.increment_reference(static_token_handle);
        let static_token = self
            .statics_theirs
            .get_eventually(static_token_handle)
            .await;
        self.statics_theirs.decrement_reference(static_token_handle);
        let token = S::recompose_token(&static_token, &dynamic_token);

        let store = self
            .stores
            .get(&entry.namespace_id)
            .ok_or_else(|| SyncError::protocol("entry for an unknown namespace"))?;
        let event = store
            .ingest_entry(entry.clone(), token, Some(self.source_tag.clone()))
            .await?;
        if let IngestEvent::Rejected(reason) = event {
            return Err(SyncError::authorisation(format!(
                "peer pushed an unacceptable entry: {reason:?}"
            )));
        }

        let candidate = self
            .data_ingester
            .lock()
            .await
            .target(entry, offset, true);
        if let Some(previous) = candidate {
            self.request_payload(previous).await?;
        }
        Ok(())
    }

    async fn handle_bind_payload_request(
        self: &Arc<Self>,
        entry: SchemeEntry<S>,
        offset: u64,
        capability: u64,
    ) -> Result<()> {
        self.caps_theirs.increment_reference(capability);
        let cap = self.caps_theirs.get_eventually(capability).await;
        self.caps_theirs.decrement_reference(capability);
        if S::granted_namespace(&cap) != entry.namespace_id
            || !S::granted_area(&cap).includes_entry(&entry)
        {
            return Err(SyncError::authorisation(
                "payload request is not covered by the cited capability",
            ));
        }
        let handle = self
            .payload_requests_theirs
            .bind(PayloadRequest { entry, offset });
        let messages = self
            .data_sender
            .queue_payload_request(handle, self.chunk_size())
            .await?;
        let _guard = self.data_send_lock.lock().await;
        for message in messages {
            self.send_message(message)?;
        }
        Ok(())
    }

    /// Push an entry ingested by another session to this peer, when its
    /// interests cover it.
    async fn forward_entry(self: &Arc<Self>, entry: SchemeEntry<S>) -> Result<()> {
        let wanted = self.aois_theirs.entries().into_iter().any(|(_, binding)| {
            binding.namespace == entry.namespace_id && binding.aoi.area.includes_entry(&entry)
        });
        if !wanted {
            return Ok(());
        }
        let store = self
            .stores
            .get(&entry.namespace_id)
            .ok_or_else(|| SyncError::protocol("forwarding from an unknown namespace"))?;
        let Some(token) = store.token_at(&entry.subspace_id, &entry.path).await? else {
            return Ok(());
        };
        let (static_token, dynamic_token) = S::decompose_token(&token);
        let static_handle = {
            let mut announcer = self.announcer.lock().await;
            let (static_handle, fresh) = announcer.intern(static_token.clone());
            if fresh {
                self.send_message(Message::SetupBindStaticToken { static_token })?;
            }
            static_handle
        };
        let messages = self
            .data_sender
            .queue_entry(entry, static_handle, dynamic_token, 0, self.chunk_size())
            .await?;
        let _guard = self.data_send_lock.lock().await;
        for message in messages {
            self.send_message(message)?;
        }
        Ok(())
    }
}

fn check_payload_event(event: IngestPayloadEvent) -> Result<()> {
    match event {
        // NoEntry means a concurrent prune won the race; the bytes are
        // stale, not hostile.
        IngestPayloadEvent::Accepted { .. }
        | IngestPayloadEvent::AlreadyHave
        | IngestPayloadEvent::NoEntry => Ok(()),
        IngestPayloadEvent::DataMismatch => Err(SyncError::protocol(
            "payload bytes disagree with the entry's digest or length",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osier_common::testing::{id8, TestCapability, TestSchemes};
    use osier_common::Area;
    use osier_storage::{MemoryKv, MemoryPayloadDriver, Store};
    use std::time::Duration;

    use crate::transport::{duplex, DuplexTransport};

    type TestMessenger =
        WgpsMessenger<TestSchemes, MemoryKv, MemoryPayloadDriver<TestSchemes>, DuplexTransport>;
    type TestStores = StoreMap<TestSchemes, MemoryKv, MemoryPayloadDriver<TestSchemes>>;

    async fn stores_with(namespace: &str) -> Arc<TestStores> {
        let stores = Arc::new(StoreMap::new());
        stores.insert(Arc::new(
            Store::new(
                id8(namespace),
                Arc::new(MemoryKv::new()),
                MemoryPayloadDriver::new(),
            )
            .await
            .unwrap(),
        ));
        stores
    }

    async fn wait_for_error(messenger: &TestMessenger) -> String {
        for _ in 0..400 {
            if let Some(error) = messenger.error() {
                return error;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session did not fail in time");
    }

    /// Send the raw preamble a peer would: power byte, then the commitment
    /// over `nonce`.
    async fn send_preamble(transport: &DuplexTransport, nonce: &[u8]) {
        let commitment = TestSchemes::challenge_hash(nonce);
        let mut preamble = vec![32u8];
        preamble.extend_from_slice(&commitment);
        transport.send(Bytes::from(preamble)).await.unwrap();
    }

    #[tokio::test]
    async fn aoi_outside_the_granted_area_is_refused_at_open() {
        let (ours, _theirs) = duplex();
        let interest = SyncInterest::<TestSchemes> {
            capability: TestCapability {
                namespace: id8("family"),
                subspace: None,
                path: osier_common::Path::new([b"blog".to_vec()]),
                receiver: id8("alfie"),
            },
            secret: id8("alfie"),
            // The area escapes the granted path prefix.
            aois: vec![AreaOfInterest::uncapped(Area::full())],
        };
        let result = TestMessenger::open(
            ours,
            SessionConfig::new(vec![interest]),
            stores_with("family").await,
        );
        assert!(matches!(result, Err(SyncError::Validation(_))));
    }

    #[tokio::test]
    async fn forged_commitment_reveal_terminates_the_session() {
        let (ours, theirs) = duplex();
        let messenger =
            TestMessenger::open(ours, SessionConfig::new(Vec::new()), Arc::new(StoreMap::new()))
                .unwrap();

        let nonce = vec![7u8; TestSchemes::CHALLENGE_LENGTH];
        send_preamble(&theirs, &nonce).await;
        // Reveal a nonce that does not hash to the commitment.
        let reveal = Message::<TestSchemes>::CommitmentReveal {
            nonce: vec![8u8; TestSchemes::CHALLENGE_LENGTH],
        };
        theirs.send(reveal.to_frame()).await.unwrap();

        let error = wait_for_error(&messenger).await;
        assert!(error.contains("commitment"), "unexpected error: {error}");
        messenger.close();
    }

    #[tokio::test]
    async fn announce_dropping_is_a_protocol_error() {
        let (ours, theirs) = duplex();
        let messenger =
            TestMessenger::open(ours, SessionConfig::new(Vec::new()), Arc::new(StoreMap::new()))
                .unwrap();

        let nonce = vec![7u8; TestSchemes::CHALLENGE_LENGTH];
        send_preamble(&theirs, &nonce).await;
        theirs
            .send(
                Message::<TestSchemes>::CommitmentReveal { nonce }
                    .to_frame(),
            )
            .await
            .unwrap();
        theirs
            .send(
                Message::<TestSchemes>::ControlAnnounceDropping {
                    channel: Channel::Data,
                }
                .to_frame(),
            )
            .await
            .unwrap();

        let error = wait_for_error(&messenger).await;
        assert!(error.contains("protocol"), "unexpected error: {error}");
        messenger.close();
    }

    #[tokio::test]
    async fn undecodable_frames_terminate_the_session() {
        let (ours, theirs) = duplex();
        let messenger =
            TestMessenger::open(ours, SessionConfig::new(Vec::new()), Arc::new(StoreMap::new()))
                .unwrap();

        send_preamble(&theirs, &[7u8; 16]).await;
        // A frame with an unknown kind byte.
        theirs.send(Bytes::from_static(&[1, 0xee])).await.unwrap();

        let error = wait_for_error(&messenger).await;
        assert!(error.contains("protocol"), "unexpected error: {error}");
        messenger.close();
    }
}
