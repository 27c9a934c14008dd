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

//! Private area intersection.
//!
//! Each read capability dissolves into fragments, one per prefix of its
//! granted path. A fragment is sent as `a·g` where `g` derives from the
//! fragment bytes and `a` is this session's secret scalar; the peer replies
//! with `b·(a·g)`. Because the group is commutative, both sides can compare
//! `ab·g` values: equality means the same fragment, without either side
//! revealing fragments the other does not hold.
//!
//! A capability whose most specific primary fragment matched is safe to
//! reveal. A selective capability whose *secondary* fragment matched first
//! asks the peer for a subspace capability before revealing which subspace
//! it is restricted to.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use osier_common::{Fragment, FragmentSet, Schemes};
use tracing::trace;

use crate::error::{Result, SyncError};
use crate::handle_store::HandleStore;
use crate::wire::Message;

struct LocalFragment<S: Schemes> {
    fragment: Fragment<S::NamespaceId, S::SubspaceId>,
    interest: usize,
    is_most_specific: bool,
    is_secondary: bool,
    /// `b·(a·g)`, once the peer has replied.
    complete: Option<S::GroupMember>,
}

struct RemoteBind<S: Schemes> {
    /// `a·(b·g)`, computed on receipt.
    computed: S::GroupMember,
    is_secondary: bool,
}

/// What the session must do in response to a PAI step.
pub enum PaiAction<S: Schemes> {
    Send(Message<S>),
    /// A capability may now be revealed, citing our fragment bind.
    Intersection { interest: usize, our_handle: u64 },
    /// The peer asked us to prove namespace-wide access for the fragment we
    /// bound under `our_handle`.
    ReplySubspaceCapability { our_handle: u64, interest: usize },
}

pub struct PaiFinder<S: Schemes> {
    scalar: S::Scalar,
    ours_store: Arc<HandleStore<S::GroupMember>>,
    theirs_store: Arc<HandleStore<S::GroupMember>>,
    ours: HashMap<u64, LocalFragment<S>>,
    theirs: HashMap<u64, RemoteBind<S>>,
    matched: HashSet<(u64, u64)>,
    emitted: HashSet<usize>,
    pending_subspace_requests: HashSet<u64>,
}

impl<S: Schemes> PaiFinder<S> {
    pub fn new(
        ours_store: Arc<HandleStore<S::GroupMember>>,
        theirs_store: Arc<HandleStore<S::GroupMember>>,
    ) -> Self {
        Self {
            scalar: S::pai_scalar(),
            ours_store,
            theirs_store,
            ours: HashMap::new(),
            theirs: HashMap::new(),
            matched: HashSet::new(),
            emitted: HashSet::new(),
            pending_subspace_requests: HashSet::new(),
        }
    }

    /// Dissolve a capability into fragments and bind each one.
    pub fn submit_capability(
        &mut self,
        interest: usize,
        capability: &S::ReadCapability,
    ) -> Vec<PaiAction<S>> {
        let mut fragments = Vec::new();
        match S::pai_fragments(capability) {
            FragmentSet::Complete { pairs } => {
                let last = pairs.len().saturating_sub(1);
                for (index, fragment) in pairs.into_iter().enumerate() {
                    fragments.push((fragment, index == last, false));
                }
            }
            FragmentSet::Selective { primary, secondary } => {
                let last = primary.len().saturating_sub(1);
                for (index, fragment) in primary.into_iter().enumerate() {
                    fragments.push((fragment, index == last, false));
                }
                let last = secondary.len().saturating_sub(1);
                for (index, fragment) in secondary.into_iter().enumerate() {
                    fragments.push((fragment, index == last, true));
                }
            }
        }

        let mut actions = Vec::new();
        for (fragment, is_most_specific, is_secondary) in fragments {
            let unmixed = S::pai_fragment_to_member(&fragment);
            let mixed = S::pai_scalar_mult(&unmixed, &self.scalar);
            let handle = self.ours_store.bind(mixed.clone());
            let _ = self.ours.insert(
                handle,
                LocalFragment {
                    fragment,
                    interest,
                    is_most_specific,
                    is_secondary,
                    complete: None,
                },
            );
            actions.push(PaiAction::Send(Message::PaiBindFragment {
                group_member: mixed,
                is_secondary,
            }));
        }
        actions
    }

    /// The peer bound a fragment: mix it with our scalar, reply, and see
    /// whether anything of ours now matches.
    pub fn received_bind(
        &mut self,
        group_member: S::GroupMember,
        is_secondary: bool,
    ) -> Vec<PaiAction<S>> {
        let computed = S::pai_scalar_mult(&group_member, &self.scalar);
        let handle = self.theirs_store.bind(group_member);
        let _ = self.theirs.insert(
            handle,
            RemoteBind {
                computed: computed.clone(),
                is_secondary,
            },
        );
        let mut actions = vec![PaiAction::Send(Message::PaiReplyFragment {
            handle,
            group_member: computed,
        })];
        actions.extend(self.find_matches());
        actions
    }

    /// The peer mixed one of our binds; its value is now comparable.
    pub fn received_reply(
        &mut self,
        handle: u64,
        group_member: S::GroupMember,
    ) -> Result<Vec<PaiAction<S>>> {
        let fragment = self
            .ours
            .get_mut(&handle)
            .ok_or_else(|| SyncError::protocol("fragment reply cites an unbound handle"))?;
        if fragment.complete.is_some() {
            return Err(SyncError::protocol("fragment reply repeated"));
        }
        fragment.complete = Some(group_member);
        Ok(self.find_matches())
    }

    fn find_matches(&mut self) -> Vec<PaiAction<S>> {
        let mut fresh = Vec::new();
        for (&our_handle, ours) in &self.ours {
            let Some(complete) = &ours.complete else {
                continue;
            };
            for (&their_handle, theirs) in &self.theirs {
                if *complete == theirs.computed
                    && !self.matched.contains(&(our_handle, their_handle))
                {
                    fresh.push((our_handle, their_handle));
                }
            }
        }
        let mut actions = Vec::new();
        for (our_handle, their_handle) in fresh {
            let _ = self.matched.insert((our_handle, their_handle));
            trace!(our_handle, their_handle, "pai fragments matched");
            actions.extend(self.evaluate_match(our_handle, their_handle));
        }
        actions
    }

    fn evaluate_match(&mut self, our_handle: u64, their_handle: u64) -> Vec<PaiAction<S>> {
        let ours = &self.ours[&our_handle];
        if !ours.is_most_specific || self.emitted.contains(&ours.interest) {
            return Vec::new();
        }
        if !ours.is_secondary {
            let interest = ours.interest;
            let _ = self.emitted.insert(interest);
            return vec![PaiAction::Intersection {
                interest,
                our_handle,
            }];
        }
        // Our secondary fragment met the peer's primary one: before
        // revealing the subspace, make the peer prove namespace-wide
        // access.
        let their_is_primary = self
            .theirs
            .get(&their_handle)
            .is_some_and(|bind| !bind.is_secondary);
        if their_is_primary && self.pending_subspace_requests.insert(their_handle) {
            return vec![PaiAction::Send(Message::PaiRequestSubspaceCapability {
                handle: their_handle,
            })];
        }
        Vec::new()
    }

    /// The peer asked for a subspace capability for one of our binds.
    pub fn received_subspace_request(&mut self, handle: u64) -> Result<PaiAction<S>> {
        let ours = self
            .ours
            .get(&handle)
            .ok_or_else(|| SyncError::protocol("subspace request cites an unbound handle"))?;
        Ok(PaiAction::ReplySubspaceCapability {
            our_handle: handle,
            interest: ours.interest,
        })
    }

    /// A subspace capability arrived for a request of ours. The messenger
    /// has already checked validity and signature; the finder checks the
    /// namespace and releases the held-back intersection.
    pub fn received_subspace_reply(
        &mut self,
        their_handle: u64,
        capability: &S::SubspaceCapability,
    ) -> Result<Vec<PaiAction<S>>> {
        if !self.pending_subspace_requests.remove(&their_handle) {
            return Err(SyncError::protocol(
                "subspace capability reply without a pending request",
            ));
        }
        let namespace = S::subspace_cap_namespace(capability);
        let mut actions = Vec::new();
        let mut releases = Vec::new();
        for (&our_handle, ours) in &self.ours {
            if !self.matched.contains(&(our_handle, their_handle)) {
                continue;
            }
            let fragment_namespace = match &ours.fragment {
                Fragment::Pair { namespace, .. } | Fragment::Triple { namespace, .. } => namespace,
            };
            if *fragment_namespace != namespace {
                return Err(SyncError::protocol(
                    "subspace capability namespace does not match the fragment",
                ));
            }
            if ours.is_most_specific && ours.is_secondary && !self.emitted.contains(&ours.interest)
            {
                releases.push((ours.interest, our_handle));
            }
        }
        for (interest, our_handle) in releases {
            let _ = self.emitted.insert(interest);
            actions.push(PaiAction::Intersection {
                interest,
                our_handle,
            });
        }
        Ok(actions)
    }

    /// Interest context for a fragment bound by us, used when replying to a
    /// subspace capability request.
    pub fn interest_of(&self, our_handle: u64) -> Option<usize> {
        self.ours.get(&our_handle).map(|fragment| fragment.interest)
    }

    /// The fragment content behind one of the peer's binds, known exactly
    /// when it matched one of ours.
    pub fn intersection_context(
        &self,
        their_handle: u64,
    ) -> Option<Fragment<S::NamespaceId, S::SubspaceId>> {
        self.matched
            .iter()
            .find(|(_, theirs)| *theirs == their_handle)
            .and_then(|(ours, _)| self.ours.get(ours))
            .map(|fragment| fragment.fragment.clone())
    }

    /// Claim the right to reveal `interest` outside the usual match flow,
    /// after the peer has already revealed a covering capability of its
    /// own. Returns the fragment handle to cite, or `None` when the
    /// interest was already revealed.
    pub fn take_reactive_emission(&mut self, interest: usize) -> Option<u64> {
        if self.emitted.contains(&interest) {
            return None;
        }
        let handle = self
            .ours
            .iter()
            .find(|(_, fragment)| {
                fragment.interest == interest && fragment.is_most_specific && !fragment.is_secondary
            })
            .map(|(handle, _)| *handle)?;
        let _ = self.emitted.insert(interest);
        Some(handle)
    }

    pub fn theirs_is_bound(&self, handle: u64) -> bool {
        self.theirs.contains_key(&handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osier_common::testing::{id8, TestCapability, TestSchemes};
    use osier_common::Path;

    fn drive(
        a: &mut PaiFinder<TestSchemes>,
        b: &mut PaiFinder<TestSchemes>,
        caps: [&TestCapability; 2],
        from_a: Vec<PaiAction<TestSchemes>>,
        from_b: Vec<PaiAction<TestSchemes>>,
    ) -> (Vec<(usize, u64)>, Vec<(usize, u64)>) {
        let mut queue: Vec<(bool, Message<TestSchemes>)> = Vec::new();
        // intersections[0] is a's, intersections[1] is b's.
        let mut intersections = [Vec::new(), Vec::new()];
        let mut sink =
            |actions: Vec<PaiAction<TestSchemes>>,
             on_a: bool,
             queue: &mut Vec<(bool, Message<TestSchemes>)>,
             intersections: &mut [Vec<(usize, u64)>; 2]| {
                for action in actions {
                    match action {
                        PaiAction::Send(message) => queue.push((!on_a, message)),
                        PaiAction::Intersection {
                            interest,
                            our_handle,
                        } => intersections[usize::from(!on_a)].push((interest, our_handle)),
                        PaiAction::ReplySubspaceCapability { our_handle, .. } => {
                            let cap = caps[usize::from(!on_a)];
                            let capability = TestSchemes::subspace_cap_for(cap)
                                .expect("capability cannot prove namespace access");
                            queue.push((
                                !on_a,
                                Message::PaiReplySubspaceCapability {
                                    handle: our_handle,
                                    capability,
                                    signature: [0; 32],
                                },
                            ));
                        }
                    }
                }
            };
        sink(from_a, true, &mut queue, &mut intersections);
        sink(from_b, false, &mut queue, &mut intersections);
        while let Some((to_a, message)) = queue.pop() {
            let target = if to_a { &mut *a } else { &mut *b };
            let actions = match message {
                Message::PaiBindFragment {
                    group_member,
                    is_secondary,
                } => target.received_bind(group_member, is_secondary),
                Message::PaiReplyFragment {
                    handle,
                    group_member,
                } => target.received_reply(handle, group_member).unwrap(),
                Message::PaiRequestSubspaceCapability { handle } => {
                    vec![target.received_subspace_request(handle).unwrap()]
                }
                Message::PaiReplySubspaceCapability {
                    handle, capability, ..
                } => target.received_subspace_reply(handle, &capability).unwrap(),
                other => panic!("unexpected message {other:?}"),
            };
            sink(actions, to_a, &mut queue, &mut intersections);
        }
        let [ia, ib] = intersections;
        (ia, ib)
    }

    fn finder() -> PaiFinder<TestSchemes> {
        PaiFinder::new(Arc::new(HandleStore::new()), Arc::new(HandleStore::new()))
    }

    #[test]
    fn equal_complete_capabilities_intersect_on_both_sides() {
        let mut a = finder();
        let mut b = finder();
        let cap = TestCapability {
            namespace: id8("family"),
            subspace: None,
            path: Path::new([b"blog".to_vec()]),
            receiver: id8("alfie"),
        };
        let from_a = a.submit_capability(0, &cap);
        let from_b = b.submit_capability(0, &cap);
        let (ia, ib) = drive(&mut a, &mut b, [&cap, &cap], from_a, from_b);
        assert_eq!(ia.len(), 1);
        assert_eq!(ib.len(), 1);
        assert_eq!(ia[0].0, 0);
    }

    #[test]
    fn disjoint_namespaces_never_intersect() {
        let mut a = finder();
        let mut b = finder();
        let cap_a = TestCapability::full(id8("family"), id8("alfie"));
        let cap_b = TestCapability::full(id8("project"), id8("betty"));
        let from_a = a.submit_capability(0, &cap_a);
        let from_b = b.submit_capability(0, &cap_b);
        let (ia, ib) = drive(&mut a, &mut b, [&cap_a, &cap_b], from_a, from_b);
        assert!(ia.is_empty());
        assert!(ib.is_empty());
    }

    #[test]
    fn selective_capability_asks_for_a_subspace_proof_first() {
        let mut a = finder();
        let mut b = finder();
        // a's capability is restricted to one subspace; b's covers the
        // namespace.
        let cap_a = TestCapability {
            namespace: id8("family"),
            subspace: Some(id8("gemma")),
            path: Path::empty(),
            receiver: id8("alfie"),
        };
        let cap_b = TestCapability::full(id8("family"), id8("betty"));
        let from_a = a.submit_capability(0, &cap_a);
        let from_b = b.submit_capability(0, &cap_b);
        let (ia, ib) = drive(&mut a, &mut b, [&cap_a, &cap_b], from_a, from_b);
        // b's primary fragment matched directly; a revealed only after the
        // subspace capability came back.
        assert_eq!(ib.len(), 1);
        assert_eq!(ia.len(), 1);
    }

    #[test]
    fn unknown_reply_handle_is_a_protocol_error() {
        let mut finder = finder();
        assert!(finder.received_reply(3, 12345).is_err());
    }
}
