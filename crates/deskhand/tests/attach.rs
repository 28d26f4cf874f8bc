//! Attach-flow integration: indexing, subscription, and the observer pipeline
//! running against the in-process fake DAW over real UDP.

use std::sync::Arc;
use std::time::Duration;

use deskconf::ObserverConfig;
use deskhand::events::SessionEvent;
use deskhand::indexer;
use deskhand::sessions::{SessionRegistry, SessionState};
use liveosc::testing::{FakeDevice, FakeLive, FakeParam, FakeTrack};
use liveosc::{bridge, LiveBridge, OscTransport, ParamKey};
use pretty_assertions::assert_eq;

fn fixture() -> Vec<FakeTrack> {
    vec![
        FakeTrack::new(
            "Drums",
            vec![FakeDevice::new(
                "Kit",
                "DrumGroupDevice",
                vec![FakeParam::new("Volume", 0.8, 0.0, 1.0)],
            )],
        ),
        FakeTrack::new(
            "Bass",
            vec![
                FakeDevice::new(
                    "Op",
                    "InstrumentDevice",
                    vec![
                        FakeParam::new("Osc Level", 0.5, 0.0, 1.0),
                        FakeParam::new("Filter Freq", 440.0, 20.0, 20_000.0),
                    ],
                ),
                FakeDevice::new(
                    "Comp",
                    "Compressor2",
                    vec![FakeParam::new("Threshold", -12.0, -60.0, 0.0)],
                ),
            ],
        ),
    ]
}

async fn setup() -> (FakeLive, Arc<LiveBridge>, Arc<SessionRegistry>) {
    let fake = FakeLive::spawn(fixture()).await.unwrap();
    let transport = Arc::new(OscTransport::bind(0, fake.addr()).await.unwrap());
    let bridge = Arc::new(LiveBridge::new(
        transport,
        Duration::from_millis(500),
        Duration::from_millis(500),
    ));
    let registry = Arc::new(SessionRegistry::new(
        bridge.clone(),
        ObserverConfig {
            history_window_secs: 60,
            debounce_ms: 150,
        },
    ));
    (fake, bridge, registry)
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn settle() {
    // Let UDP round-trips (synthetic notifications etc.) flush through.
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn attach_indexes_mirror_and_subscribes_every_parameter() {
    let (fake, bridge, registry) = setup().await;
    let (session, _) = registry.get_or_create("s1", "p1");
    let mut rx = session.subscribe();

    indexer::run(session.clone(), bridge.clone()).await;

    let mut progress = Vec::new();
    let mut finished = false;
    for event in drain(&mut rx) {
        match event {
            SessionEvent::IndexingStatus {
                is_indexing: true,
                progress: Some(p),
            } => progress.push(p),
            SessionEvent::IndexingStatus {
                is_indexing: false,
                progress: p,
            } => {
                assert_eq!(p, Some(100));
                finished = true;
            }
            _ => {}
        }
    }
    assert!(finished);
    // Enumerate milestones, then one subscribe milestone per track.
    assert_eq!(progress, vec![0, 10, 20, 50, 75, 100]);

    let snapshot = session.mirror.load().unwrap();
    assert_eq!(snapshot.tracks.len(), 2);
    assert_eq!(snapshot.parameter_count(), 4);
    assert_eq!(
        snapshot.parameter(ParamKey::new(1, 0, 1)).unwrap().name,
        "Filter Freq"
    );

    assert_eq!(session.observer.observation_count(), 4);

    settle().await; // let the fire-and-forget start_listen datagrams land
    assert_eq!(fake.listen_count(), 4);
}

#[tokio::test]
async fn knob_sweep_coalesces_into_one_history_entry() {
    let (fake, bridge, registry) = setup().await;
    let (session, _) = registry.get_or_create("s1", "p1");
    let mut rx = session.subscribe();

    indexer::run(session.clone(), bridge.clone()).await;
    settle().await; // synthetic per-subscribe notifications get eaten here
    drain(&mut rx);

    // Sweep Drums/Kit/Volume (raw index 2): 0.8 -> 0.7 in four steps.
    for value in [0.5, 0.55, 0.6, 0.7] {
        fake.notify(0, 0, 2, value).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    let changes = session.observer.recent_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].old_value, 0.8);
    assert_eq!(changes[0].new_value, 0.7);
    assert_eq!(changes[0].track_name, "Drums");
    assert_eq!(changes[0].device_name, "Kit");
    assert_eq!(changes[0].param_name, "Volume");
    assert_eq!(changes[0].param_id, 0);

    let events = drain(&mut rx);
    let change_events: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ParameterChange { .. }))
        .collect();
    assert_eq!(change_events.len(), 1);
}

#[tokio::test]
async fn reindex_resubscribes_and_retains_history() {
    let (fake, bridge, registry) = setup().await;
    let (session, _) = registry.get_or_create("s1", "p1");

    indexer::run(session.clone(), bridge.clone()).await;
    settle().await;

    fake.notify(0, 0, 2, 0.3).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(session.observer.recent_changes().len(), 1);

    indexer::run(session.clone(), bridge.clone()).await;
    settle().await;

    // History survived; subscriptions were torn down and rebuilt.
    assert_eq!(session.observer.recent_changes().len(), 1);
    assert_eq!(session.observer.observation_count(), 4);
    assert_eq!(fake.listen_count(), 4);
}

#[tokio::test]
async fn failed_reindex_keeps_the_prior_snapshot() {
    let (fake, bridge, registry) = setup().await;
    let (session, _) = registry.get_or_create("s1", "p1");
    let mut rx = session.subscribe();

    indexer::run(session.clone(), bridge.clone()).await;
    let before = session.mirror.load().unwrap();
    drain(&mut rx);

    fake.mute(bridge::ADDR_PARAMS_NAME);
    indexer::run(session.clone(), bridge.clone()).await;

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Error { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::IndexingStatus {
            is_indexing: false,
            progress: None
        }
    )));

    let after = session.mirror.load().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
}

#[tokio::test]
async fn shutdown_unsubscribes_best_effort() {
    let (fake, bridge, registry) = setup().await;
    let (session, _): (Arc<SessionState>, _) = registry.get_or_create("s1", "p1");

    indexer::run(session.clone(), bridge.clone()).await;
    settle().await;
    assert_eq!(fake.listen_count(), 4);

    registry.shutdown().await;
    settle().await;
    assert_eq!(fake.listen_count(), 0);
    assert_eq!(session.observer.observation_count(), 0);
}
