use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use field_bus::{Bus, LocalBus};
use field_sync::channel::{
    BusTransport, ChannelMultiplexer, ConnectionState, EventFilter, TopicKey,
};
use field_sync::config::AppConfig;
use field_sync::coordinator::FieldCoordinator;
use field_sync::identity::{Actor, StaticDirectory};
use field_sync::lease::{FloorLeaseManager, LeaseError};
use field_sync::metrics;
use field_sync::queue::{
    ApplyError, EntityType, HandlerRegistry, InMemoryQueueStore, MutationAction, MutationQueue,
    PendingMutation, QueueStore,
};
use lease_store::{FloorKey, InMemoryLeaseStore, LeaseStore};
use parking_lot::Mutex;
use serde_json::{json, Value};

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn coordinator_on(
    bus: Arc<LocalBus>,
    store: Arc<InMemoryLeaseStore>,
    registry: HandlerRegistry,
) -> Result<Arc<FieldCoordinator>, Box<dyn std::error::Error>> {
    let cfg = AppConfig {
        team_id: Some("north".into()),
        ..AppConfig::default()
    };
    // Shared profile directory: every device resolves the same names.
    let profiles = StaticDirectory(HashMap::from([(
        "volunteer-a".to_string(),
        "Ada".to_string(),
    )]));
    Ok(FieldCoordinator::with_stores(
        &cfg,
        bus,
        store,
        InMemoryQueueStore::new(),
        registry,
        Arc::new(profiles),
    )
    .await?)
}

fn manager(bus: Arc<LocalBus>, store: Arc<dyn LeaseStore>) -> FloorLeaseManager {
    let channels = ChannelMultiplexer::new(BusTransport::new(bus));
    FloorLeaseManager::new(
        store,
        channels,
        Arc::new(StaticDirectory(HashMap::new())),
        Duration::from_secs(1_800),
    )
}

/// Handler that records every payload it applies, keyed by entity id.
fn recording_registry(seen: Arc<Mutex<Vec<(String, Value)>>>) -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    registry.register_handler(EntityType::Room, move |m: PendingMutation| {
        let seen = seen.clone();
        async move {
            seen.lock().push((m.entity_id.clone(), m.payload.clone()));
            Ok::<_, ApplyError>(m.payload)
        }
    });
    registry
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn second_volunteer_gets_already_claimed() -> TestResult {
    let bus = Arc::new(LocalBus::new());
    let store = InMemoryLeaseStore::with_feed(bus.clone());
    let a = coordinator_on(bus.clone(), store.clone(), HandlerRegistry::new()).await?;
    let b = coordinator_on(bus, store, HandlerRegistry::new()).await?;
    a.sign_in(Actor::new("volunteer-a", None));
    b.sign_in(Actor::new("volunteer-b", None));

    a.claim_floor("B1", 3).await?;
    let err = b.claim_floor("B1", 3).await.unwrap_err();
    assert!(matches!(
        err,
        LeaseError::Conflict { ref building_id, floor: 3 } if building_id == "B1"
    ));
    assert_eq!(err.to_string(), "Floor is already claimed.");

    let claims = b.list_claims("B1").await?;
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].lease.holder_id, "volunteer-a");
    assert_eq!(claims[0].holder_name.as_deref(), Some("Ada"));
    Ok(())
}

#[tokio::test]
async fn offline_update_is_applied_once_after_reconnect() -> TestResult {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let bus = Arc::new(LocalBus::new());
    let coord = coordinator_on(
        bus.clone(),
        InMemoryLeaseStore::with_feed(bus),
        recording_registry(seen.clone()),
    )
    .await?;

    let ack = coord
        .sync_update(
            EntityType::Room,
            "r1",
            json!({"id": "r1", "status": "donated", "amount": 500}),
        )
        .await?;
    assert!(ack.success);
    assert!(ack.queued);
    assert!(seen.lock().is_empty());

    coord.start().await;
    wait_until(|| seen.lock().len() == 1).await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while !coord.sync().queue().is_empty().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    let again = coord.drain_now().await;
    assert_eq!(again.applied, 0);
    assert_eq!(again.remaining, 0);
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].1["amount"], 500);
    Ok(())
}

#[tokio::test]
async fn queued_updates_for_one_room_replay_in_order() -> TestResult {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let bus = Arc::new(LocalBus::new());
    let coord = coordinator_on(
        bus.clone(),
        InMemoryLeaseStore::with_feed(bus),
        recording_registry(seen.clone()),
    )
    .await?;

    coord
        .sync_update(EntityType::Room, "r7", json!({"status": "callback"}))
        .await?;
    coord
        .sync_update(EntityType::Room, "r7", json!({"status": "donated"}))
        .await?;

    coord.start().await;
    wait_until(|| seen.lock().len() == 2).await;
    let statuses: Vec<Value> = seen.lock().iter().map(|(_, p)| p["status"].clone()).collect();
    assert_eq!(statuses, vec![json!("callback"), json!("donated")]);
    Ok(())
}

#[tokio::test]
async fn failed_heartbeat_does_not_reach_the_caller() -> TestResult {
    let bus = Arc::new(LocalBus::new());
    let store = InMemoryLeaseStore::with_feed(bus.clone());
    let coord = coordinator_on(bus, store.clone(), HandlerRegistry::new()).await?;
    coord.sign_in(Actor::new("volunteer-a", None));
    coord.claim_floor("B1", 4).await?;

    let failures_before = metrics::HEARTBEAT_FAILURES.get();
    store.set_offline(true);
    coord.heartbeat_claim("B1", 4)?;
    wait_until(|| metrics::HEARTBEAT_FAILURES.get() > failures_before).await;
    store.set_offline(false);

    let claims = coord.list_claims("B1").await?;
    assert_eq!(claims.len(), 1);
    coord.release_floor("B1", 4).await?;
    Ok(())
}

#[tokio::test]
async fn building_without_leases_lists_nothing() -> TestResult {
    let bus = Arc::new(LocalBus::new());
    let store = InMemoryLeaseStore::with_feed(bus.clone());
    let coord = coordinator_on(bus, store, HandlerRegistry::new()).await?;
    assert!(coord.list_claims("B1").await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_exactly_one_winner() -> TestResult {
    let bus = Arc::new(LocalBus::new());
    let store: Arc<dyn LeaseStore> = InMemoryLeaseStore::with_feed(bus.clone());
    let leases = manager(bus, store);

    let attempts: Vec<_> = (0..16)
        .map(|i| {
            let leases = leases.clone();
            tokio::spawn(async move { leases.claim("B9", 1, &format!("volunteer-{i}")).await })
        })
        .collect();
    let results = futures::future::join_all(attempts).await;

    let mut won = 0;
    let mut conflicts = 0;
    for result in results {
        match result? {
            Ok(_) => won += 1,
            Err(LeaseError::Conflict { .. }) => conflicts += 1,
            Err(other) => return Err(other.into()),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 15);
    Ok(())
}

#[tokio::test]
async fn release_is_idempotent_and_scoped() -> TestResult {
    let bus = Arc::new(LocalBus::new());
    let store: Arc<dyn LeaseStore> = InMemoryLeaseStore::with_feed(bus.clone());
    let leases = manager(bus, store);

    leases.claim("B1", 1, "volunteer-a").await?;
    leases.claim("B1", 2, "volunteer-a").await?;

    leases.release("B1", 1, "volunteer-a").await?;
    leases.release("B1", 1, "volunteer-a").await?;
    leases.release("B1", 9, "volunteer-a").await?;
    leases.release("B1", 2, "volunteer-b").await?;

    let active = leases.list_active("B1").await?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].lease.floor, 2);
    assert_eq!(active[0].lease.holder_id, "volunteer-a");
    Ok(())
}

#[tokio::test]
async fn heartbeat_only_moves_last_activity() -> TestResult {
    let bus = Arc::new(LocalBus::new());
    let store: Arc<dyn LeaseStore> = InMemoryLeaseStore::with_feed(bus.clone());
    let leases = manager(bus, store.clone());

    let claimed = leases.claim("B1", 5, "volunteer-a").await?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    leases.heartbeat("B1", 5, "volunteer-a");

    let key = FloorKey::new("B1", 5);
    let mut after = None;
    for _ in 0..200 {
        let rows = store.list_for_building("B1").await?;
        if let Some(row) = rows.into_iter().find(|l| l.key() == key) {
            if row.last_activity_at > claimed.last_activity_at {
                after = Some(row);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let after = after.ok_or("heartbeat never landed")?;
    assert_eq!(after.holder_id, claimed.holder_id);
    assert_eq!(after.claimed_at, claimed.claimed_at);
    Ok(())
}

#[tokio::test]
async fn replaying_an_unremoved_entry_converges() -> TestResult {
    let state: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));
    let registry = HandlerRegistry::new();
    let target = state.clone();
    registry.register_handler(EntityType::Room, move |m: PendingMutation| {
        let target = target.clone();
        async move {
            target.lock().insert(m.entity_id.clone(), m.payload.clone());
            Ok::<_, ApplyError>(m.payload)
        }
    });

    let first_store = InMemoryQueueStore::new();
    let queue = MutationQueue::open(first_store.clone(), 100).await?;
    queue
        .enqueue(
            EntityType::Room,
            MutationAction::Update,
            "r1",
            json!({"status": "callback"}),
            None,
        )
        .await?;
    queue
        .enqueue(EntityType::Room, MutationAction::Update, "r1", json!({"status": "donated"}), None)
        .await?;
    let snapshot = first_store.persisted();

    queue.drain(&registry).await;
    let once = state.lock().clone();

    // Same entries again, as if the process died before they were removed.
    let replay_store = InMemoryQueueStore::new();
    replay_store.save(&snapshot).await?;
    let replay = MutationQueue::open(replay_store, 100).await?;
    let report = replay.drain(&registry).await;
    assert_eq!(report.applied, 2);

    assert_eq!(*state.lock(), once);
    assert_eq!(once["r1"]["status"], "donated");
    Ok(())
}

#[tokio::test]
async fn emitted_states_follow_the_state_machine() -> TestResult {
    let bus = Arc::new(LocalBus::new());
    let transport = BusTransport::new(bus.clone() as Arc<dyn Bus>);
    let channels = ChannelMultiplexer::new(transport.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _listener = channels.on_connection_state_change(move |state| sink.lock().push(state));
    assert_eq!(seen.lock().as_slice(), &[ConnectionState::Disconnected]);

    let _sub = channels
        .subscribe(TopicKey::Building("B1".into()), EventFilter::All, |_| {})
        .await;
    transport.set_online(false);
    wait_until(|| channels.state() == ConnectionState::Reconnecting).await;
    transport.set_online(true);
    wait_until(|| channels.state() == ConnectionState::Connected).await;
    channels.unsubscribe_all().await;

    let states = seen.lock().clone();
    assert_eq!(
        states,
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ]
    );
    for pair in states.windows(2) {
        assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
    }

    // A late listener still hears the current state first.
    let late = Arc::new(Mutex::new(None));
    let slot = late.clone();
    let _late = channels.on_connection_state_change(move |state| {
        slot.lock().get_or_insert(state);
    });
    assert_eq!(*late.lock(), Some(ConnectionState::Disconnected));
    Ok(())
}
