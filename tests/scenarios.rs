use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use leaderwatch::store::mock::MemoryStore;
use leaderwatch::{Client, ClientConfig, Error};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn client(store: MemoryStore) -> Client {
    Client::new(ClientConfig::new().with_store(Arc::new(store))).unwrap()
}

#[tokio::test(start_paused = true)]
async fn a_solo_voter_becomes_and_stays_leader() {
    let store = MemoryStore::new();
    let c = client(store.clone());
    let cancel = CancellationToken::new();

    c.add_voter("/leader", "node-a", Duration::from_secs(10), &cancel).await.unwrap();
    tokio::time::advance(Duration::from_millis(10)).await;

    let got = store.get("/leader").await.unwrap();
    assert_eq!(got.value, "node-a");

    // Advance well past the first renewal tick; the lease must never lapse.
    tokio::time::advance(Duration::from_secs(30)).await;
    let got = store.get("/leader").await.unwrap();
    assert_eq!(got.value, "node-a");

    c.close();
}

#[tokio::test(start_paused = true)]
async fn a_contender_defers_to_the_sitting_leader() {
    let store = MemoryStore::new();
    let a = client(store.clone());
    let b = client(store.clone());
    let cancel = CancellationToken::new();

    a.add_voter("/leader", "node-a", Duration::from_secs(10), &cancel).await.unwrap();
    tokio::time::advance(Duration::from_millis(10)).await;

    b.add_voter("/leader", "node-b", Duration::from_secs(10), &cancel).await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;

    assert_eq!(store.get("/leader").await.unwrap().value, "node-a");

    a.close();
    b.close();
}

#[tokio::test(start_paused = true)]
async fn step_down_hands_off_to_a_waiting_contender() {
    let store = MemoryStore::new();
    let a = client(store.clone());
    let b = client(store.clone());
    let cancel = CancellationToken::new();

    a.add_voter("/leader", "node-a", Duration::from_millis(200), &cancel).await.unwrap();
    tokio::time::advance(Duration::from_millis(10)).await;
    b.add_voter("/leader", "node-b", Duration::from_millis(200), &cancel).await.unwrap();
    tokio::time::advance(Duration::from_millis(10)).await;
    assert_eq!(store.get("/leader").await.unwrap().value, "node-a");

    a.step_down();
    // Force the lease to look expired so b can take over on its very next tick, instead of
    // waiting out a's full step-down cooldown as well as the TTL.
    store.expire_now("/leader");
    tokio::time::advance(Duration::from_millis(60)).await;

    assert_eq!(store.get("/leader").await.unwrap().value, "node-b");

    a.close();
    b.close();
}

#[tokio::test(start_paused = true)]
async fn watch_bootstraps_on_a_key_that_does_not_exist_yet() {
    let store = MemoryStore::new();
    let c = client(store.clone());
    let (tx, mut rx) = mpsc::channel(4);
    c.add_watch("/config", Duration::from_millis(50), tx);

    tokio::time::advance(Duration::from_millis(120)).await;
    assert!(rx.try_recv().is_err(), "nothing should be delivered before the key exists");

    store
        .set(
            "/config",
            "v1".to_string(),
            leaderwatch::store::SetOptions {
                ttl: Duration::from_secs(30),
                condition: leaderwatch::store::SetCondition::PrevAbsent,
            },
        )
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(100)).await;

    assert_eq!(rx.recv().await.unwrap(), "v1");
    c.close();
}

#[tokio::test(start_paused = true)]
async fn close_during_bootstrap_stops_the_watch_cleanly() {
    let store = MemoryStore::new();
    let c = client(store.clone());
    let (tx, rx) = mpsc::channel(4);
    c.add_watch("/never-appears", Duration::from_millis(50), tx);

    tokio::time::advance(Duration::from_millis(20)).await;
    c.close();
    tokio::time::advance(Duration::from_millis(200)).await;

    drop(rx);
}

#[tokio::test(start_paused = true)]
async fn add_voter_is_idempotent_for_matching_arguments_and_rejects_mismatches() {
    let store = MemoryStore::new();
    let c = client(store);
    let cancel = CancellationToken::new();

    c.add_voter("/leader", "node-a", Duration::from_secs(10), &cancel).await.unwrap();
    c.add_voter("/leader", "node-a", Duration::from_secs(10), &cancel).await.unwrap();

    let err = c.add_voter("/leader", "node-b", Duration::from_secs(10), &cancel).await.unwrap_err();
    assert!(matches!(err, Error::VoterAlreadyStarted));

    c.close();
}

#[tokio::test(start_paused = true)]
async fn watch_recovers_from_history_loss_and_keeps_delivering() {
    use leaderwatch::store::{SetCondition, SetOptions};

    let store = MemoryStore::new();
    store
        .set("/k", "v0".to_string(), SetOptions { ttl: Duration::from_secs(60), condition: SetCondition::PrevAbsent })
        .await
        .unwrap();

    let c = client(store.clone());
    let (tx, mut rx) = mpsc::channel(8);
    c.add_watch("/k", Duration::from_millis(20), tx);

    tokio::time::advance(Duration::from_millis(10)).await;
    assert_eq!(rx.recv().await.unwrap(), "v0", "bootstrap value must be delivered before anything else");

    // Drive far more writes than the store's retained history/broadcast backlog can hold, with
    // no `.await` yield point in between, so the watch's live subscription is guaranteed to fall
    // behind and observe history-lost on its next read rather than replaying every value.
    let mut prev_value = "v0".to_string();
    let mut prev_index = 1u64;
    for i in 1..=500u64 {
        let new_value = format!("v{i}");
        store
            .set(
                "/k",
                new_value.clone(),
                SetOptions {
                    ttl: Duration::from_secs(60),
                    condition: SetCondition::Prev { value: prev_value.clone(), mod_index: prev_index },
                },
            )
            .await
            .unwrap();
        prev_value = new_value;
        prev_index += 1;
    }

    tokio::time::advance(Duration::from_millis(200)).await;

    // The watcher must transparently re-bootstrap on history loss and deliver the current value
    // exactly once, skipping the intermediate values it could no longer replay.
    assert_eq!(rx.recv().await.unwrap(), "v500");

    // And it must keep delivering genuinely new values afterwards.
    store
        .set(
            "/k",
            "v501".to_string(),
            SetOptions { ttl: Duration::from_secs(60), condition: SetCondition::Prev { value: "v500".to_string(), mod_index: 501 } },
        )
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(50)).await;
    assert_eq!(rx.recv().await.unwrap(), "v501");

    c.close();
}

#[tokio::test(start_paused = true)]
async fn callback_suppresses_duplicate_values_but_not_genuine_flips() {
    let store = MemoryStore::new();
    store
        .set(
            "/flag",
            "off".to_string(),
            leaderwatch::store::SetOptions {
                ttl: Duration::from_secs(60),
                condition: leaderwatch::store::SetCondition::PrevAbsent,
            },
        )
        .await
        .unwrap();

    let c = client(store.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let calls_clone = calls.clone();
    let seen_clone = seen.clone();
    c.add_watch_callback("/flag", Duration::from_millis(20), move |_key, prev, new| {
        calls_clone.fetch_add(1, Ordering::SeqCst);
        seen_clone.lock().push((prev.to_string(), new.to_string()));
    });

    tokio::time::advance(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    store
        .set(
            "/flag",
            "off".to_string(),
            leaderwatch::store::SetOptions {
                ttl: Duration::from_secs(60),
                condition: leaderwatch::store::SetCondition::Prev { value: "off".to_string(), mod_index: 1 },
            },
        )
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "re-setting the same value must not trigger a callback");

    store
        .set(
            "/flag",
            "on".to_string(),
            leaderwatch::store::SetOptions {
                ttl: Duration::from_secs(60),
                condition: leaderwatch::store::SetCondition::Prev { value: "off".to_string(), mod_index: 2 },
            },
        )
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(seen.lock().last().unwrap(), &("off".to_string(), "on".to_string()));

    c.close();
}
