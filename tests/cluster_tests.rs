//! Coordination tests: offer claiming, leadership leases and watches
//! against the in-memory store.


use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chronos_lite::cluster::{ClusterClient, MemoryClusterClient, MemoryStore};
use chronos_lite::scheduler::Job;
use test_harness::{test_cluster_config, wait_for};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn connected(store: &Arc<MemoryStore>) -> Arc<MemoryClusterClient> {
    let client = Arc::new(MemoryClusterClient::new(
        store.clone(),
        test_cluster_config(),
    ));
    client.connect().await.unwrap();
    client
}

fn job(id: &str) -> Job {
    Job::once(id, "true", Utc::now())
}

#[tokio::test]
async fn test_two_takers_one_winner() {
    let store = MemoryStore::new();
    let leader = connected(&store).await;
    let a = connected(&store).await;
    let b = connected(&store).await;

    let offered = job("report");
    leader.make_job_offer(&offered).await.unwrap();

    let (took_a, took_b) = tokio::join!(
        a.take_job_offer(&offered, "10.0.0.1"),
        b.take_job_offer(&offered, "10.0.0.2")
    );
    let wins = [took_a.unwrap(), took_b.unwrap()];
    assert_eq!(wins.iter().filter(|won| **won).count(), 1);

    let config = test_cluster_config();
    assert_eq!(store.get(&config.offer_key("report")).unwrap(), None);
    assert_eq!(store.get(&config.job_lock_key("report")).unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_takers_one_winner() {
    let store = MemoryStore::new();
    let leader = connected(&store).await;
    let offered = job("backup");
    leader.make_job_offer(&offered).await.unwrap();

    let mut takers = Vec::new();
    for i in 0..10 {
        let client = connected(&store).await;
        let offered = offered.clone();
        takers.push(tokio::spawn(async move {
            client
                .take_job_offer(&offered, &format!("10.0.0.{}", i))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for taker in takers {
        if taker.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "Exactly one taker should claim the offer");
}

#[tokio::test]
async fn test_next_occurrence_can_be_claimed_again() {
    let store = MemoryStore::new();
    let client = connected(&store).await;

    let first = job("ping");
    client.make_job_offer(&first).await.unwrap();
    assert!(client.take_job_offer(&first, "10.0.0.1").await.unwrap());

    let mut second = first.clone();
    second.next_run_at = first.next_run_at + chrono::Duration::seconds(1);
    client.make_job_offer(&second).await.unwrap();
    assert!(!client.take_job_offer(&first, "10.0.0.1").await.unwrap());
    assert!(client.take_job_offer(&second, "10.0.0.2").await.unwrap());
}

#[tokio::test]
async fn test_offer_watch_replays_pending_then_streams() {
    let store = MemoryStore::new();
    let leader = connected(&store).await;
    let executor = connected(&store).await;
    leader.make_job_offer(&job("pending")).await.unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let stop = CancellationToken::new();
    let watcher = {
        let executor = executor.clone();
        let stop = stop.clone();
        tokio::spawn(async move { executor.watch_job_offers(tx, stop).await })
    };

    let replayed = rx.recv().await.unwrap();
    assert_eq!(replayed.id, "pending");

    leader.make_job_offer(&job("fresh")).await.unwrap();
    let streamed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(streamed.id, "fresh");

    stop.cancel();
    watcher.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_job_watch_replays_registry_and_skips_removals() {
    let store = MemoryStore::new();
    let admin = connected(&store).await;
    let leader = connected(&store).await;
    admin.register_job(&job("a")).await.unwrap();
    admin.register_job(&job("b")).await.unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let stop = CancellationToken::new();
    let watcher = {
        let leader = leader.clone();
        let stop = stop.clone();
        tokio::spawn(async move { leader.watch_jobs_to_schedule(tx, stop).await })
    };

    let mut replayed = vec![rx.recv().await.unwrap().id, rx.recv().await.unwrap().id];
    replayed.sort();
    assert_eq!(replayed, vec!["a", "b"]);

    assert!(admin.unregister_job("a").await.unwrap());
    admin.register_job(&job("c")).await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.id, "c", "Removals are not streamed");

    stop.cancel();
    watcher.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failure_watcher_fires_on_lease_expiry() {
    let store = MemoryStore::with_reaper(Duration::from_millis(20));
    let leader = connected(&store).await;
    let follower = connected(&store).await;
    assert!(leader.register_as_scheduler("10.0.0.1").await.unwrap());

    let (tx, mut rx) = mpsc::channel(1);
    let stop = CancellationToken::new();
    let watcher = {
        let follower = follower.clone();
        let stop = stop.clone();
        tokio::spawn(async move { follower.scheduler_failure_watcher(tx, stop).await })
    };

    // No renewals: the lease runs out after the scheduler TTL
    let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
    assert!(matches!(fired, Ok(Some(()))), "Watcher should report the lost leader");
    watcher.await.unwrap().unwrap();
    assert_eq!(follower.current_scheduler().await.unwrap(), None);
}

#[tokio::test]
async fn test_renewal_after_expiry_is_rejected() {
    let store = MemoryStore::new();
    let leader = connected(&store).await;
    assert!(leader.register_as_scheduler("10.0.0.1").await.unwrap());
    assert!(leader.renew_scheduler("10.0.0.1").await.unwrap());

    tokio::time::sleep(test_cluster_config().scheduler_ttl + Duration::from_millis(100)).await;
    assert!(!leader.renew_scheduler("10.0.0.1").await.unwrap());

    // Anyone may take over a lapsed lease
    let other = connected(&store).await;
    assert!(other.register_as_scheduler("10.0.0.2").await.unwrap());
}

#[tokio::test]
async fn test_executor_presence_expires() {
    let store = MemoryStore::with_reaper(Duration::from_millis(20));
    let client = connected(&store).await;
    client.register_as_executor("agent-1", "10.0.0.1").await.unwrap();
    assert_eq!(client.executors().await.unwrap().len(), 1);

    let gone = wait_for(
        || async { client.executors().await.unwrap().is_empty() },
        Duration::from_secs(2),
        Duration::from_millis(50),
    )
    .await;
    assert!(gone, "Presence should lapse without refreshes");
}
