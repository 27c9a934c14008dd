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

//! Whole-session tests: two peers over an in-memory duplex transport.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use osier_common::testing::{id8, TestCapability, TestSchemes};
use osier_common::{Area, AreaOfInterest, AreaSubspace, Path, Range, Range3d};
use osier_storage::{MemoryKv, MemoryPayloadDriver, QueryOrder, SetInput, Store};
use osier_sync::{duplex, SessionConfig, StoreMap, SyncInterest, WgpsMessenger};

type TestStore = Store<TestSchemes, MemoryKv, MemoryPayloadDriver<TestSchemes>>;
type TestStores = StoreMap<TestSchemes, MemoryKv, MemoryPayloadDriver<TestSchemes>>;

async fn open_store(namespace: &str) -> Arc<TestStore> {
    Arc::new(
        Store::new(
            id8(namespace),
            Arc::new(MemoryKv::new()),
            MemoryPayloadDriver::new(),
        )
        .await
        .unwrap(),
    )
}

async fn seed(store: &TestStore, author: &str, path: &[&[u8]], payload: &[u8], timestamp: u64) {
    let event = store
        .set(
            SetInput {
                subspace: id8(author),
                path: Path::new(path.iter().map(|c| c.to_vec())),
                payload: Bytes::copy_from_slice(payload),
                timestamp: Some(timestamp),
            },
            &id8(author),
        )
        .await
        .unwrap();
    assert!(event.is_success(), "seeding failed");
}

fn prefix_interest(namespace: &str, receiver: &str, prefix: &[&[u8]]) -> SyncInterest<TestSchemes> {
    let path = Path::new(prefix.iter().map(|c| c.to_vec()));
    SyncInterest {
        capability: TestCapability {
            namespace: id8(namespace),
            subspace: None,
            path: path.clone(),
            receiver: id8(receiver),
        },
        secret: id8(receiver),
        aois: vec![AreaOfInterest::uncapped(Area {
            subspace: AreaSubspace::Any,
            path_prefix: path,
            times: Range::full_time(),
        })],
    }
}

async fn store_is_complete(store: &TestStore, expected: u64) -> bool {
    if store.summarise(&Range3d::full()).unwrap().size != expected {
        return false;
    }
    let aoi = AreaOfInterest::uncapped(Area::full());
    let hits = store.query(&aoi, QueryOrder::Path, false).await.unwrap();
    hits.len() as u64 == expected
        && hits
            .iter()
            .all(|hit| hit.lengthy_entry.is_fully_available() && hit.payload.is_some())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_reconciliation_exchanges_entries_and_payloads() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let alfie_store = open_store("family").await;
        let betty_store = open_store("family").await;

        // Alfie writes under [0x01], Betty deeper under [0x01, 0x02].
        for i in 0u8..10 {
            seed(
                &alfie_store,
                "alfie",
                &[&[0x01], &[i]],
                format!("alfie payload {i}").as_bytes(),
                100 + u64::from(i),
            )
            .await;
            seed(
                &betty_store,
                "betty",
                &[&[0x01], &[0x02], &[i]],
                format!("betty payload {i}").as_bytes(),
                1_000 + u64::from(i),
            )
            .await;
        }

        let alfie_stores: Arc<TestStores> = Arc::new(StoreMap::new());
        alfie_stores.insert(alfie_store.clone());
        let betty_stores: Arc<TestStores> = Arc::new(StoreMap::new());
        betty_stores.insert(betty_store.clone());

        let (alfie_end, betty_end) = duplex();
        let alfie = WgpsMessenger::open(
            alfie_end,
            SessionConfig::new(vec![prefix_interest("family", "alfie", &[&[0x01]])]),
            alfie_stores,
        )
        .unwrap();
        let betty = WgpsMessenger::open(
            betty_end,
            SessionConfig::new(vec![prefix_interest("family", "betty", &[&[0x01]])]),
            betty_stores,
        )
        .unwrap();

        loop {
            if store_is_complete(&alfie_store, 20).await
                && store_is_complete(&betty_store, 20).await
            {
                break;
            }
            assert!(alfie.error().is_none(), "alfie failed: {:?}", alfie.error());
            assert!(betty.error().is_none(), "betty failed: {:?}", betty.error());
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        // Convergence: identical summaries over the shared range.
        let range = Range3d::full();
        let ours = alfie_store.summarise(&range).unwrap();
        let theirs = betty_store.summarise(&range).unwrap();
        assert_eq!(ours.size, theirs.size);
        assert_eq!(ours.fingerprint, theirs.fingerprint);

        alfie.shutdown().await;
        betty.shutdown().await;
    })
    .await
    .expect("session did not converge in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_namespaces_exchange_nothing() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let family = open_store("family").await;
        let project = open_store("project").await;
        for i in 0u8..10 {
            seed(&family, "alfie", &[&[i]], b"f", 10 + u64::from(i)).await;
            seed(&project, "betty", &[&[i]], b"p", 10 + u64::from(i)).await;
        }

        let alfie_stores: Arc<TestStores> = Arc::new(StoreMap::new());
        alfie_stores.insert(family.clone());
        let betty_stores: Arc<TestStores> = Arc::new(StoreMap::new());
        betty_stores.insert(project.clone());

        let (alfie_end, betty_end) = duplex();
        let alfie = WgpsMessenger::open(
            alfie_end,
            SessionConfig::new(vec![prefix_interest("family", "alfie", &[])]),
            alfie_stores,
        )
        .unwrap();
        let betty = WgpsMessenger::open(
            betty_end,
            SessionConfig::new(vec![prefix_interest("project", "betty", &[])]),
            betty_stores,
        )
        .unwrap();

        // Give the handshake and intersection attempts time to complete.
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(alfie.error().is_none());
        assert!(betty.error().is_none());
        assert_eq!(family.summarise(&Range3d::full()).unwrap().size, 10);
        assert_eq!(project.summarise(&Range3d::full()).unwrap().size, 10);

        alfie.shutdown().await;
        betty.shutdown().await;
    })
    .await
    .expect("session stalled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn content_flows_to_an_empty_peer() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let alfie_store = open_store("family").await;
        let betty_store = open_store("family").await;
        for i in 0u8..4 {
            seed(&alfie_store, "alfie", &[&[i]], b"x", 50 + u64::from(i)).await;
        }

        let alfie_stores: Arc<TestStores> = Arc::new(StoreMap::new());
        alfie_stores.insert(alfie_store.clone());
        let betty_stores: Arc<TestStores> = Arc::new(StoreMap::new());
        betty_stores.insert(betty_store.clone());

        let (alfie_end, betty_end) = duplex();
        let alfie = WgpsMessenger::open(
            alfie_end,
            SessionConfig::new(vec![prefix_interest("family", "alfie", &[])]),
            alfie_stores,
        )
        .unwrap();
        let betty = WgpsMessenger::open(
            betty_end,
            SessionConfig::new(vec![prefix_interest("family", "betty", &[])]),
            betty_stores,
        )
        .unwrap();

        loop {
            if store_is_complete(&betty_store, 4).await {
                break;
            }
            assert!(alfie.error().is_none(), "alfie failed: {:?}", alfie.error());
            assert!(betty.error().is_none(), "betty failed: {:?}", betty.error());
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        alfie.shutdown().await;
        betty.shutdown().await;
    })
    .await
    .expect("session did not converge in time");
}
