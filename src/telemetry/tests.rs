use super::*;
use crate::objects::Metadata;
use crate::uavtalk::mocks::{LinkCall, MockLink};
use crate::uavtalk::LinkStats;
use std::time::Duration;
use tokio::time::advance;

const SEED: u64 = 42;

fn engine_for(
    registry: &Arc<ObjectRegistry>,
    link: &Arc<MockLink>,
    status: ConnectionStatus,
) -> (Telemetry, TelemetryHandle, watch::Sender<ConnectionStatus>) {
    let (status_tx, status_rx) = watch::channel(status);
    let (engine, handle) = Telemetry::new(
        Arc::clone(registry),
        Arc::clone(link) as Arc<dyn UavTalkLink>,
        status_rx,
        SEED,
    );
    link.attach(handle.clone());
    (engine, handle, status_tx)
}

fn spawn_engine(
    registry: &Arc<ObjectRegistry>,
    link: &Arc<MockLink>,
    status: ConnectionStatus,
) -> (TelemetryHandle, watch::Sender<ConnectionStatus>) {
    let (engine, handle, status_tx) = engine_for(registry, link, status);
    tokio::spawn(engine.run());
    (handle, status_tx)
}

fn on_change_mask() -> EventMask {
    EventMask::UPDATED | EventMask::UPDATED_MANUAL | EventMask::UPDATE_REQUESTED
}

// ── Subscription binder ───────────────────────────────────────────────

#[tokio::test]
async fn binder_masks_follow_update_mode() {
    let registry = ObjectRegistry::new();
    let periodic = registry
        .register("AttitudeState", ObjId(0x1000), Metadata::periodic(100, false))
        .unwrap();
    let on_change = registry
        .register("SystemSettings", ObjId(0x1010), Metadata::on_change(true))
        .unwrap();
    let throttled = registry
        .register("EstimatedPosition", ObjId(0x1020), Metadata::throttled(500, false))
        .unwrap();
    let manual = registry
        .register("ObjectPersistence", ObjId(0x1030), Metadata::manual(true))
        .unwrap();

    let link = MockLink::new();
    let (engine, _handle, _status) = engine_for(&registry, &link, ConnectionStatus::Connected);

    assert_eq!(
        engine.subscriptions.mask(periodic.id(), 0),
        EventMask::UPDATED_MANUAL | EventMask::UPDATE_REQUESTED | EventMask::UPDATED_PERIODIC
    );
    assert_eq!(engine.subscriptions.mask(on_change.id(), 0), on_change_mask());
    assert_eq!(
        engine.subscriptions.mask(throttled.id(), 0),
        on_change_mask() | EventMask::UPDATED_PERIODIC
    );
    assert_eq!(
        engine.subscriptions.mask(manual.id(), 0),
        EventMask::UPDATED_MANUAL | EventMask::UPDATE_REQUESTED
    );
    // Meta siblings observe remote edits on top of their on-change mask
    assert_eq!(
        engine.subscriptions.mask(periodic.id().meta_id(), 0),
        on_change_mask() | EventMask::UNPACKED
    );
}

#[tokio::test]
async fn binder_covers_every_instance() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("ActuatorCommand", ObjId(0x1100), Metadata::on_change(false))
        .unwrap();
    registry.add_instance(obj.id()).unwrap();
    registry.add_instance(obj.id()).unwrap();

    let link = MockLink::new();
    let (engine, _handle, _status) = engine_for(&registry, &link, ConnectionStatus::Connected);

    for instance in 0..3u16 {
        assert_eq!(engine.subscriptions.mask(obj.id(), instance), on_change_mask());
    }
}

#[tokio::test]
async fn mode_round_trip_restores_subscriptions() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("SystemSettings", ObjId(0x1200), Metadata::on_change(true))
        .unwrap();
    let meta = registry.get(obj.id().meta_id()).unwrap();

    let link = MockLink::new();
    let (mut engine, _handle, _status) = engine_for(&registry, &link, ConnectionStatus::Connected);
    let initial = engine.subscriptions.mask(obj.id(), 0);

    // A remote metadata edit arrives as an unpacked meta-object
    obj.set_metadata(Metadata::manual(true));
    engine.dispatch(Command::ObjectEvent {
        obj: Arc::clone(&meta),
        kind: EventKind::Unpacked,
    });
    engine.drain_queues();
    assert_eq!(
        engine.subscriptions.mask(obj.id(), 0),
        EventMask::UPDATED_MANUAL | EventMask::UPDATE_REQUESTED
    );
    // Unpacked events never produce wire traffic
    assert_eq!(link.calls().len(), 0);

    // Editing back restores the original subscription set
    obj.set_metadata(Metadata::on_change(true));
    engine.dispatch(Command::ObjectEvent {
        obj: Arc::clone(&meta),
        kind: EventKind::Unpacked,
    });
    engine.drain_queues();
    assert_eq!(engine.subscriptions.mask(obj.id(), 0), initial);
}

#[tokio::test]
async fn manual_mode_ignores_auto_updates() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("ObjectPersistence", ObjId(0x1300), Metadata::manual(false))
        .unwrap();

    let link = MockLink::new();
    let (mut engine, _handle, _status) = engine_for(&registry, &link, ConnectionStatus::Connected);

    engine.dispatch(Command::ObjectEvent {
        obj: Arc::clone(&obj),
        kind: EventKind::Updated,
    });
    engine.drain_queues();
    assert_eq!(link.calls().len(), 0);

    engine.dispatch(Command::ObjectEvent {
        obj: Arc::clone(&obj),
        kind: EventKind::UpdatedManual,
    });
    engine.drain_queues();
    assert_eq!(link.sends_for(obj.id()), 1);
}

// ── Throttled toggle ──────────────────────────────────────────────────

#[tokio::test]
async fn throttled_change_narrows_mask_until_next_tick() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("EstimatedPosition", ObjId(0x1400), Metadata::throttled(500, false))
        .unwrap();

    let link = MockLink::new();
    let (mut engine, _handle, _status) = engine_for(&registry, &link, ConnectionStatus::Connected);
    assert_eq!(
        engine.subscriptions.mask(obj.id(), 0),
        on_change_mask() | EventMask::UPDATED_PERIODIC
    );

    // A change event transmits and drops the periodic admission
    engine.dispatch(Command::ObjectEvent {
        obj: Arc::clone(&obj),
        kind: EventKind::Updated,
    });
    engine.drain_queues();
    assert_eq!(link.sends_for(obj.id()), 1);
    assert_eq!(engine.subscriptions.mask(obj.id(), 0), on_change_mask());

    // The wheel's tick is a control signal: no traffic, mask restored
    engine.process_object_updates(Arc::clone(&obj), EventKind::UpdatedPeriodic, true, false);
    engine.drain_queues();
    assert_eq!(link.sends_for(obj.id()), 1);
    assert_eq!(
        engine.subscriptions.mask(obj.id(), 0),
        on_change_mask() | EventMask::UPDATED_PERIODIC
    );
}

#[tokio::test(start_paused = true)]
async fn throttled_periodic_tick_stays_off_the_wire() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("EstimatedPosition", ObjId(0x1500), Metadata::throttled(500, false))
        .unwrap();
    let link = MockLink::new();
    let (handle, _status) = spawn_engine(&registry, &link, ConnectionStatus::Connected);

    handle.object_updated(&obj);
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.object_updated(&obj);
    tokio::time::sleep(Duration::from_millis(1900)).await;

    // Both change events were sent; wheel ticks produced no traffic
    assert_eq!(link.sends_for(obj.id()), 2);
    for call in link.calls() {
        assert!(matches!(
            call,
            LinkCall::SendObject { all_instances: false, .. }
        ));
    }
}

// ── Periodic wheel (scenario 1) ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn periodic_object_emits_at_configured_rate() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("AttitudeState", ObjId(0x0001), Metadata::periodic(100, false))
        .unwrap();
    let link = MockLink::new();
    link.set_auto_complete(true);
    let (handle, _status) = spawn_engine(&registry, &link, ConnectionStatus::Connected);

    // Warm through the initial one-second arming plus the random phase
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let before = link.sends_for(obj.id());
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let emitted = link.sends_for(obj.id()) - before;

    assert!(
        (8..=11).contains(&emitted),
        "expected 8..=11 periodic emissions, got {emitted}"
    );
    for call in link.calls() {
        assert!(matches!(
            call,
            LinkCall::SendObject { acked: false, all_instances: true, .. }
        ));
    }

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.tx_errors, 0);
    assert_eq!(stats.tx_retries, 0);
}

#[tokio::test(start_paused = true)]
async fn object_registered_at_runtime_joins_the_wheel() {
    let registry = ObjectRegistry::new();
    let link = MockLink::new();
    let (_handle, _status) = spawn_engine(&registry, &link, ConnectionStatus::Connected);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let obj = registry
        .register("GyroState", ObjId(0x1600), Metadata::periodic(100, false))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert!(
        link.sends_for(obj.id()) >= 5,
        "runtime-registered object never reached the wheel"
    );
}

// ── Transactions (scenarios 2 and 3) ──────────────────────────────────

#[tokio::test(start_paused = true)]
async fn acked_send_retries_then_succeeds() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("FlightBatterySettings", ObjId(0x1700), Metadata::on_change(true))
        .unwrap();
    let mut completions = obj.subscribe_transactions();
    let link = MockLink::new();
    let (handle, _status) = spawn_engine(&registry, &link, ConnectionStatus::Connected);

    handle.object_updated(&obj);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(link.sends_for(obj.id()), 2, "one original send plus one retry");

    // The codec finally answers at t=400ms
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.transaction_completed(obj.id(), true);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(link.sends_for(obj.id()), 2, "no reissue after completion");
    assert_eq!(completions.try_recv(), Ok(true));
    assert!(completions.try_recv().is_err());

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.tx_retries, 1);
    assert_eq!(stats.tx_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn acked_send_cancels_after_retry_exhaustion() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("FlightBatterySettings", ObjId(0x1800), Metadata::on_change(true))
        .unwrap();
    let mut completions = obj.subscribe_transactions();
    let link = MockLink::new();
    let (handle, _status) = spawn_engine(&registry, &link, ConnectionStatus::Connected);

    let start = tokio::time::Instant::now();
    handle.object_updated(&obj);
    tokio::time::sleep(Duration::from_millis(810)).await;

    let timed = link.timed_calls();
    let offsets: Vec<(u128, bool)> = timed
        .iter()
        .map(|(at, call)| {
            (
                at.duration_since(start).as_millis(),
                matches!(call, LinkCall::Cancel { .. }),
            )
        })
        .collect();
    assert_eq!(
        offsets,
        vec![(0, false), (250, false), (500, false), (750, true)],
        "three issues then a cancel"
    );

    assert_eq!(completions.try_recv(), Ok(false));
    assert!(completions.try_recv().is_err());

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.tx_retries, 2);
    assert_eq!(stats.tx_errors, 1);
}

#[tokio::test]
async fn duplicate_issue_overwrites_in_flight_transaction() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("HomeLocation", ObjId(0x1900), Metadata::on_change(true))
        .unwrap();
    let link = MockLink::new();
    let (mut engine, _handle, _status) = engine_for(&registry, &link, ConnectionStatus::Connected);

    engine.dispatch(Command::ObjectEvent {
        obj: Arc::clone(&obj),
        kind: EventKind::Updated,
    });
    engine.drain_queues();
    assert_eq!(engine.transactions.len(), 1);

    // Burn the retry budget, then issue again: the fresh transaction must
    // displace the stale one rather than queue behind it
    engine
        .transactions
        .get_mut(obj.id())
        .unwrap()
        .retries_remaining = 0;
    engine.dispatch(Command::ObjectEvent {
        obj: Arc::clone(&obj),
        kind: EventKind::Updated,
    });
    engine.drain_queues();

    assert_eq!(link.sends_for(obj.id()), 2);
    assert_eq!(engine.transactions.len(), 1);
    assert_eq!(
        engine
            .transactions
            .get_mut(obj.id())
            .unwrap()
            .retries_remaining,
        MAX_RETRIES
    );
}

#[tokio::test]
async fn unexpected_completion_is_ignored() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("FlightStatus", ObjId(0x1A00), Metadata::on_change(false))
        .unwrap();
    let link = MockLink::new();
    let (mut engine, _handle, _status) = engine_for(&registry, &link, ConnectionStatus::Connected);

    engine.transaction_completed(ObjId(0xBEEF), true);

    // The engine keeps working afterwards
    engine.dispatch(Command::ObjectEvent {
        obj: Arc::clone(&obj),
        kind: EventKind::Updated,
    });
    engine.drain_queues();
    assert_eq!(link.sends_for(obj.id()), 1);
}

#[tokio::test(start_paused = true)]
async fn update_request_round_trips() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("SystemStats", ObjId(0x1B00), Metadata::on_change(false))
        .unwrap();
    let mut completions = obj.subscribe_transactions();
    let link = MockLink::new();
    link.set_auto_complete(true);
    let (handle, _status) = spawn_engine(&registry, &link, ConnectionStatus::Connected);

    handle.update_requested(&obj);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(link
        .calls()
        .iter()
        .any(|call| matches!(call, LinkCall::SendRequest { all_instances: false, .. })));
    assert_eq!(completions.try_recv(), Ok(true));

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.tx_retries, 0);
    assert_eq!(stats.tx_errors, 0);
}

// ── Queue admission (scenario 4) ──────────────────────────────────────

#[tokio::test]
async fn queue_admission_is_bounded() {
    let registry = ObjectRegistry::new();
    let mut objects = Vec::new();
    for n in 0..25u32 {
        objects.push(
            registry
                .register(&format!("Sensor{n}"), ObjId(0x2000 + n * 2), Metadata::on_change(true))
                .unwrap(),
        );
    }
    let link = MockLink::new();
    let (mut engine, _handle, _status) = engine_for(&registry, &link, ConnectionStatus::Connected);

    for obj in &objects {
        engine.process_object_updates(Arc::clone(obj), EventKind::Updated, false, true);
    }
    assert_eq!(engine.prio_queue.len(), MAX_QUEUE_SIZE);
    assert_eq!(engine.tx_errors, 5);

    engine.drain_queues();
    assert!(engine.prio_queue.is_empty());
    assert_eq!(link.calls().len(), MAX_QUEUE_SIZE);
}

#[tokio::test(start_paused = true)]
async fn burst_beyond_queue_bound_fails_the_excess() {
    let registry = ObjectRegistry::new();
    let mut objects = Vec::new();
    for n in 0..25u32 {
        objects.push(
            registry
                .register(&format!("Sensor{n}"), ObjId(0x3000 + n * 2), Metadata::on_change(true))
                .unwrap(),
        );
    }
    let mut completions: Vec<_> = objects
        .iter()
        .map(|obj| obj.subscribe_transactions())
        .collect();
    let link = MockLink::new();
    let (handle, _status) = spawn_engine(&registry, &link, ConnectionStatus::Connected);

    // The codec never answers; 25 events land in one burst
    for obj in &objects {
        handle.object_updated(obj);
    }
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(link.calls().len(), MAX_QUEUE_SIZE);
    for rx in completions.iter_mut().take(MAX_QUEUE_SIZE) {
        assert!(rx.try_recv().is_err(), "admitted events are still in flight");
    }
    for rx in completions.iter_mut().skip(MAX_QUEUE_SIZE) {
        assert_eq!(rx.try_recv(), Ok(false), "overflowed events fail immediately");
    }

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.tx_errors, 5);
}

// ── Connection gate (scenario 5) ──────────────────────────────────────

#[tokio::test]
async fn disconnected_gate_passes_only_the_whitelist() {
    let registry = ObjectRegistry::new();
    let stray = registry
        .register("NavState", ObjId(0x4000), Metadata::on_change(false))
        .unwrap();
    let gcs_stats = registry
        .register("GCSTelemetryStats", GCS_TELEMETRY_STATS, Metadata::on_change(false))
        .unwrap();
    let periodic_a = registry
        .register("AttitudeState", ObjId(0x4100), Metadata::periodic(100, false))
        .unwrap();
    let periodic_b = registry
        .register("PositionState", ObjId(0x4200), Metadata::periodic(100, false))
        .unwrap();

    let mut stray_results = stray.subscribe_transactions();
    let mut silent_results = periodic_b.subscribe_transactions();
    let link = MockLink::new();
    let (mut engine, _handle, _status) = engine_for(&registry, &link, ConnectionStatus::Disconnected);

    // A wheel pass worth of regular traffic, then two priority events
    engine.process_object_updates(Arc::clone(&periodic_a), EventKind::UpdatedPeriodic, true, false);
    engine.process_object_updates(Arc::clone(&periodic_b), EventKind::UpdatedPeriodic, true, false);
    engine.dispatch(Command::ObjectEvent {
        obj: Arc::clone(&stray),
        kind: EventKind::Updated,
    });
    engine.dispatch(Command::ObjectEvent {
        obj: Arc::clone(&gcs_stats),
        kind: EventKind::Updated,
    });
    engine.drain_queues();

    // The stray object fails, the handshake object transacts, and the
    // regular queue was dropped wholesale without completions
    assert_eq!(stray_results.try_recv(), Ok(false));
    assert_eq!(link.sends_for(gcs_stats.id()), 1);
    assert_eq!(link.sends_for(stray.id()), 0);
    assert_eq!(link.sends_for(periodic_a.id()), 0);
    assert_eq!(link.sends_for(periodic_b.id()), 0);
    assert!(silent_results.try_recv().is_err());
    assert!(engine.regular_queue.is_empty());
    assert_eq!(engine.tx_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn reconnecting_reopens_regular_traffic() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("AttitudeState", ObjId(0x4300), Metadata::periodic(100, false))
        .unwrap();
    let link = MockLink::new();
    let (_handle, status) = spawn_engine(&registry, &link, ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(link.sends_for(obj.id()), 0, "gate held while disconnected");

    status.send(ConnectionStatus::Connected).unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(link.sends_for(obj.id()) >= 8, "periodic traffic resumed");
}

// ── Clean-run law and stats ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn completing_runs_leave_no_errors() {
    let registry = ObjectRegistry::new();
    let mut objects = Vec::new();
    for n in 0..10u32 {
        objects.push(
            registry
                .register(&format!("Config{n}"), ObjId(0x5000 + n * 2), Metadata::on_change(true))
                .unwrap(),
        );
    }
    let mut completions: Vec<_> = objects
        .iter()
        .map(|obj| obj.subscribe_transactions())
        .collect();
    let link = MockLink::new();
    link.set_auto_complete(true);
    let (handle, _status) = spawn_engine(&registry, &link, ConnectionStatus::Connected);

    for obj in &objects {
        handle.object_updated(obj);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(link.calls().len(), 10);
    for rx in completions.iter_mut() {
        assert_eq!(rx.try_recv(), Ok(true));
    }

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.tx_errors, 0);
    assert_eq!(stats.tx_retries, 0);
}

#[tokio::test]
async fn stats_merge_engine_and_codec_counters() {
    let registry = ObjectRegistry::new();
    let link = MockLink::new();
    let (mut engine, _handle, _status) = engine_for(&registry, &link, ConnectionStatus::Connected);

    link.set_stats(LinkStats {
        tx_bytes: 11,
        rx_bytes: 22,
        tx_object_bytes: 33,
        rx_object_bytes: 44,
        rx_objects: 5,
        tx_objects: 6,
        tx_errors: 7,
        rx_errors: 8,
    });
    engine.tx_errors = 2;
    engine.tx_retries = 3;

    let stats = engine.stats();
    assert_eq!(stats.tx_bytes, 11);
    assert_eq!(stats.rx_bytes, 22);
    assert_eq!(stats.tx_object_bytes, 33);
    assert_eq!(stats.rx_object_bytes, 44);
    assert_eq!(stats.rx_objects, 5);
    assert_eq!(stats.tx_objects, 6);
    assert_eq!(stats.tx_errors, 9, "codec and local errors aggregate");
    assert_eq!(stats.rx_errors, 8);
    assert_eq!(stats.tx_retries, 3);

    engine.reset_stats();
    assert_eq!(engine.stats(), TelemetryStats::default());
}

#[tokio::test(start_paused = true)]
async fn shutdown_discards_pending_work() {
    let registry = ObjectRegistry::new();
    let obj = registry
        .register("FlightStatus", ObjId(0x6000), Metadata::on_change(true))
        .unwrap();
    let link = MockLink::new();
    let (handle, _status) = spawn_engine(&registry, &link, ConnectionStatus::Connected);

    handle.object_updated(&obj);
    advance(Duration::from_millis(1)).await;
    handle.shutdown();
    advance(Duration::from_millis(10)).await;

    assert!(matches!(
        handle.stats().await,
        Err(GcsTelemetryError::EngineStopped)
    ));
    // The in-flight transaction dies with the engine: no cancel, no retry
    assert_eq!(link.sends_for(obj.id()), 1);
    assert!(!link.calls().iter().any(|c| matches!(c, LinkCall::Cancel { .. })));
}
