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

//! Pairing of local and remote areas of interest.
//!
//! Every time either side binds an area of interest, the other side's
//! bindings in the same namespace are scanned for area overlap. Each
//! overlapping pair seeds one reconciliation.

use std::collections::HashMap;

use osier_common::{AreaOfInterest, Schemes};

/// An overlapping pair of interest handles sharing a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AoiIntersection<S: Schemes> {
    pub namespace: S::NamespaceId,
    pub ours: u64,
    pub theirs: u64,
}

pub struct AoiIntersectionFinder<S: Schemes> {
    ours: HashMap<u64, (S::NamespaceId, AreaOfInterest<S::SubspaceId>)>,
    theirs: HashMap<u64, (S::NamespaceId, AreaOfInterest<S::SubspaceId>)>,
}

impl<S: Schemes> Default for AoiIntersectionFinder<S> {
    fn default() -> Self {
        Self {
            ours: HashMap::new(),
            theirs: HashMap::new(),
        }
    }
}

impl<S: Schemes> AoiIntersectionFinder<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ours(
        &mut self,
        handle: u64,
        namespace: S::NamespaceId,
        aoi: AreaOfInterest<S::SubspaceId>,
    ) -> Vec<AoiIntersection<S>> {
        let found = self.scan(&namespace, &aoi, true, handle);
        let _ = self.ours.insert(handle, (namespace, aoi));
        found
    }

    pub fn add_theirs(
        &mut self,
        handle: u64,
        namespace: S::NamespaceId,
        aoi: AreaOfInterest<S::SubspaceId>,
    ) -> Vec<AoiIntersection<S>> {
        let found = self.scan(&namespace, &aoi, false, handle);
        let _ = self.theirs.insert(handle, (namespace, aoi));
        found
    }

    pub fn ours(&self, handle: u64) -> Option<&(S::NamespaceId, AreaOfInterest<S::SubspaceId>)> {
        self.ours.get(&handle)
    }

    pub fn theirs(&self, handle: u64) -> Option<&(S::NamespaceId, AreaOfInterest<S::SubspaceId>)> {
        self.theirs.get(&handle)
    }

    fn scan(
        &self,
        namespace: &S::NamespaceId,
        aoi: &AreaOfInterest<S::SubspaceId>,
        added_ours: bool,
        added_handle: u64,
    ) -> Vec<AoiIntersection<S>> {
        let other_side = if added_ours { &self.theirs } else { &self.ours };
        let mut found = Vec::new();
        for (&other_handle, (other_namespace, other_aoi)) in other_side {
            if other_namespace != namespace {
                continue;
            }
            if aoi.area.intersect(&other_aoi.area).is_none() {
                continue;
            }
            found.push(if added_ours {
                AoiIntersection {
                    namespace: namespace.clone(),
                    ours: added_handle,
                    theirs: other_handle,
                }
            } else {
                AoiIntersection {
                    namespace: namespace.clone(),
                    ours: other_handle,
                    theirs: added_handle,
                }
            });
        }
        found
    }
}
