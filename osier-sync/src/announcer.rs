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

//! Entry announcements.
//!
//! When a reconciler decides a range's entries must be sent, the announcer
//! walks them oldest-first, decomposes each authorisation token, interns
//! the shareable static part into the static-token handle space, and emits
//! a pack: first any fresh static-token binds, then the announcement, then
//! one entry message per entry.

use std::collections::HashMap;
use std::sync::Arc;

use osier_common::{Range3d, Schemes};
use osier_storage::{KvStore, PayloadDriver, Store};
use tracing::trace;

use crate::error::Result;
use crate::handle_store::HandleStore;
use crate::wire::{Message, SchemeLengthyEntry};

pub struct Announcement<S: Schemes> {
    pub range: Range3d<S::SubspaceId>,
    pub count: u64,
    pub want_response: bool,
    pub sender_handle: u64,
    pub receiver_handle: u64,
    pub covers: Option<u64>,
}

pub struct AnnouncementPack<S: Schemes> {
    pub static_token_binds: Vec<S::StaticToken>,
    pub announcement: Announcement<S>,
    pub entries: Vec<(SchemeLengthyEntry<S>, u64, S::DynamicToken)>,
}

impl<S: Schemes> AnnouncementPack<S> {
    /// The pack in wire order. Static-token binds travel on their own
    /// channel; the receiving side blocks on the handle until the bind
    /// lands.
    pub fn into_messages(self) -> Vec<Message<S>> {
        let mut messages: Vec<Message<S>> = self
            .static_token_binds
            .into_iter()
            .map(|static_token| Message::SetupBindStaticToken { static_token })
            .collect();
        messages.push(Message::ReconciliationAnnounceEntries {
            range: self.announcement.range,
            count: self.announcement.count,
            want_response: self.announcement.want_response,
            will_sort: true,
            sender_handle: self.announcement.sender_handle,
            receiver_handle: self.announcement.receiver_handle,
            covers: self.announcement.covers,
        });
        for (entry, static_token_handle, dynamic_token) in self.entries {
            messages.push(Message::ReconciliationSendEntry {
                entry,
                static_token_handle,
                dynamic_token,
            });
        }
        messages
    }
}

pub struct Announcer<S: Schemes> {
    static_tokens_ours: Arc<HandleStore<S::StaticToken>>,
    interned: HashMap<S::StaticToken, u64>,
}

impl<S: Schemes> Announcer<S> {
    pub fn new(static_tokens_ours: Arc<HandleStore<S::StaticToken>>) -> Self {
        Self {
            static_tokens_ours,
            interned: HashMap::new(),
        }
    }

    /// Intern a static token, reporting whether the peer has yet to see it.
    pub fn intern(&mut self, static_token: S::StaticToken) -> (u64, bool) {
        if let Some(&handle) = self.interned.get(&static_token) {
            if self.static_tokens_ours.can_use(handle) {
                return (handle, false);
            }
        }
        let handle = self.static_tokens_ours.bind(static_token.clone());
        let _ = self.interned.insert(static_token, handle);
        (handle, true)
    }

    /// Build the pack answering one reconciler announce decision.
    #[allow(clippy::too_many_arguments)]
    pub async fn queue_announce<K: KvStore, P: PayloadDriver<S>>(
        &mut self,
        store: &Store<S, K, P>,
        range: &Range3d<S::SubspaceId>,
        want_response: bool,
        covers: Option<u64>,
        sender_handle: u64,
        receiver_handle: u64,
    ) -> Result<AnnouncementPack<S>> {
        let rows = store.query_range(range, false).await?;
        let mut static_token_binds = Vec::new();
        let mut entries = Vec::with_capacity(rows.len());
        for (lengthy_entry, token) in rows {
            let (static_token, dynamic_token) = S::decompose_token(&token);
            let (handle, fresh) = self.intern(static_token);
            if fresh {
                static_token_binds.push(
                    self.static_tokens_ours
                        .get(handle)
                        .expect("token interned just above"),
                );
            }
            entries.push((lengthy_entry, handle, dynamic_token));
        }
        trace!(
            count = entries.len(),
            fresh_tokens = static_token_binds.len(),
            "queued announcement"
        );
        Ok(AnnouncementPack {
            announcement: Announcement {
                range: range.clone(),
                count: entries.len() as u64,
                want_response,
                sender_handle,
                receiver_handle,
                covers,
            },
            static_token_binds,
            entries,
        })
    }
}
