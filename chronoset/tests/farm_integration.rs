//! Builds whole `Cluster`/`Farm` instances over `MemoryBackend` and drives
//! them through the public API, the way a caller linking against this
//! crate would.
use std::sync::Arc;
use std::time::Duration;

use chronoset::cluster::{Cluster, KeysCursor};
use chronoset::farm::{AllRepairs, Farm, ReadStrategy};
use chronoset::model::{KeyMember, KeyScoreMember, Presence};
use chronoset::storage::memory::MemoryBackend;
use chronoset::storage::OrderedSetStore;

fn cluster(node_count: usize, max_size: usize) -> Arc<Cluster> {
    let nodes: Vec<Arc<dyn OrderedSetStore>> = (0..node_count)
        .map(|i| Arc::new(MemoryBackend::new(format!("mem-{i}"))) as Arc<dyn OrderedSetStore>)
        .collect();
    Arc::new(Cluster::new(nodes, max_size))
}

fn farm(cluster_count: usize, nodes_per_cluster: usize, write_quorum: usize) -> Farm {
    let clusters = (0..cluster_count)
        .map(|_| cluster(nodes_per_cluster, 100))
        .collect();
    Farm::new(
        clusters,
        write_quorum,
        ReadStrategy::SendAllReadAll,
        Arc::new(AllRepairs),
    )
}

#[tokio::test]
async fn insert_is_visible_across_every_cluster() {
    let farm = farm(3, 2, 2);
    let ksm = KeyScoreMember::new(b"k".to_vec(), 1.0, b"m".to_vec());
    assert!(farm.insert(&ksm).await.unwrap());

    // Quorum is 2 of 3, but give the detached third write a moment to land
    // before asserting full convergence.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let presence = farm.score(&ksm.key_member()).await.unwrap();
    assert_eq!(presence, Presence::Present { inserted: true, score: 1.0 });
}

#[tokio::test]
async fn delete_wins_over_equal_score_insert() {
    let farm = farm(2, 1, 2);
    let key = b"k".to_vec();
    let member = b"m".to_vec();
    farm.insert(&KeyScoreMember::new(key.clone(), 5.0, member.clone()))
        .await
        .unwrap();
    farm.delete(&KeyScoreMember::new(key.clone(), 5.0, member.clone()))
        .await
        .unwrap();

    let presence = farm.score(&KeyMember::new(key, member)).await.unwrap();
    assert_eq!(presence, Presence::Present { inserted: false, score: 5.0 });
}

#[tokio::test]
async fn score_repairs_a_divergent_replica() {
    // Two clusters; write only reaches one directly, then insert a stale
    // copy on the other by hand to simulate a replica that fell behind.
    let lagging = cluster(1, 100);
    let caught_up = cluster(1, 100);
    let farm = Farm::new(
        vec![caught_up.clone(), lagging.clone()],
        1,
        ReadStrategy::SendAllReadAll,
        Arc::new(AllRepairs),
    );

    let key = b"k".to_vec();
    let member = b"m".to_vec();
    caught_up
        .insert(&KeyScoreMember::new(key.clone(), 9.0, member.clone()))
        .await
        .unwrap();

    // `lagging` has never seen this member; score() should see the winner
    // from `caught_up` and queue + apply a repair to `lagging`.
    let km = KeyMember::new(key.clone(), member.clone());
    let presence = farm.score(&km).await.unwrap();
    assert_eq!(presence, Presence::Present { inserted: true, score: 9.0 });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let lagging_presence = lagging.score(&km).await.unwrap();
    assert_eq!(lagging_presence, Presence::Present { inserted: true, score: 9.0 });
}

#[tokio::test]
async fn select_offset_merges_pages_across_clusters() {
    let farm = farm(2, 1, 2);
    for (score, member) in [(1.0, "a"), (2.0, "b"), (3.0, "c")] {
        farm.insert(&KeyScoreMember::new(b"k".to_vec(), score, member.as_bytes().to_vec()))
            .await
            .unwrap();
    }
    let page = farm.select_offset(b"k", 0, 2).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].member, b"c");
    assert_eq!(page[1].member, b"b");
}

#[tokio::test]
async fn select_range_pages_to_completion_across_clusters() {
    let farm = farm(2, 1, 2);
    for i in 0..10u32 {
        farm.insert(&KeyScoreMember::new(
            b"k".to_vec(),
            i as f64,
            format!("m{i}").into_bytes(),
        ))
        .await
        .unwrap();
    }

    let mut collected = Vec::new();
    let mut cursor = None;
    loop {
        let (page, next) = farm.select_range(b"k", cursor.clone(), 3).await.unwrap();
        collected.extend(page);
        match next {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }
    assert_eq!(collected.len(), 10);
    assert_eq!(collected[0].member, b"m9");
    assert_eq!(collected[9].member, b"m0");
}

#[tokio::test]
async fn keys_lists_from_the_first_cluster() {
    let farm = farm(2, 2, 1);
    for i in 0..5u32 {
        farm.insert(&KeyScoreMember::new(
            format!("k{i}").into_bytes(),
            1.0,
            b"m".to_vec(),
        ))
        .await
        .unwrap();
    }

    let mut all = Vec::new();
    let mut cursor = KeysCursor::default();
    loop {
        let (batch, next) = farm.keys(cursor, 2).await.unwrap();
        all.extend(batch);
        match next {
            Some(c) => cursor = c,
            None => break,
        }
    }
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 5);
}

#[tokio::test]
async fn write_quorum_unreachable_errors() {
    // Every cluster has zero storage nodes, so every write errors out and
    // quorum can never be reached.
    let clusters: Vec<Arc<Cluster>> = (0..2).map(|_| cluster(0, 100)).collect();
    let farm = Farm::new(clusters, 1, ReadStrategy::SendAllReadAll, Arc::new(AllRepairs));
    let ksm = KeyScoreMember::new(b"k".to_vec(), 1.0, b"m".to_vec());
    let result = farm.insert(&ksm).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let farm = farm(2, 1, 2);
    farm.shutdown().await;
    farm.shutdown().await;
}
