//! Integration tests for peer removal, endpoint failures, signaling relay, and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeSet;

use sfu_controller::actors::{PeerSignal, RemovalOutcome};
use sfu_controller::notifications::{LeaveReason, Notification, Topic};
use sfu_controller::registry::ChildId;
use sfu_controller::signaling::OutboundEvent;
use sfu_controller::types::{AdmissionKey, PeerId, VoiceActivity};
use sfu_controller::WithdrawalExclusion;
use sfu_test_utils::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn peer_left(peer_id: &PeerId, reason: LeaveReason) -> Notification {
    Notification::PeerLeft {
        peer_id: peer_id.clone(),
        reason,
    }
}

#[tokio::test]
async fn test_removing_peer_twice_publishes_one_peer_left() {
    let mut conf = TestConference::start();
    let (_, mut left) = conf.service.dispatcher().register(Topic::PeerLeft);
    let a = conf.admit("a", JoinBuilder::publishes_av).await;

    let handle = conf.service.handle();
    assert_eq!(
        handle.remove_peer(a.peer_id.clone()).await.unwrap(),
        RemovalOutcome::Removed
    );
    assert_eq!(
        handle.remove_peer(a.peer_id.clone()).await.unwrap(),
        RemovalOutcome::AlreadyAbsent
    );

    assert_eq!(
        next_notification(&mut left).await,
        peer_left(&a.peer_id, LeaveReason::Removed)
    );
    // Both removals have been processed by the time the state reply arrives
    conf.state().await;
    assert!(left.try_recv().is_err(), "exactly one peer_left");
}

#[tokio::test]
async fn test_second_leave_is_a_noop() {
    let mut conf = TestConference::start();
    let (_, mut left) = conf.service.dispatcher().register(Topic::PeerLeft);
    let a = conf.admit("a", JoinBuilder::publishes_audio).await;
    let b = conf.admit("b", JoinBuilder::receive_only).await;

    conf.service.handle().signaling(leave(&a.key)).await.unwrap();
    conf.service.handle().signaling(leave(&a.key)).await.unwrap();

    assert_eq!(
        next_notification(&mut left).await,
        peer_left(&a.peer_id, LeaveReason::Left)
    );
    let state = conf.state().await;
    assert!(left.try_recv().is_err(), "no second peer_left");
    assert_eq!(state.peers.len(), 1);
    assert!(state.peer(&b.peer_id).is_some());

    conf.sync_endpoint(&b, "sync").await;
    assert_eq!(
        conf.factory.withdrawn_from(&b.peer_id).len(),
        1,
        "withdrawal sent once"
    );
}

#[tokio::test]
async fn test_events_for_unknown_key_change_nothing() {
    let mut conf = TestConference::start();
    let a = conf.admit("a", JoinBuilder::publishes_av).await;
    let b = conf.admit("b", JoinBuilder::receive_only).await;
    let before = conf.state().await;

    let never_joined = conf.service.issue_admission_key().unwrap();
    let garbage = AdmissionKey::from("garbage");
    for key in [&never_joined, &garbage] {
        let handle = conf.service.handle();
        handle.signaling(candidate(key, "candidate:1")).await.unwrap();
        handle.signaling(answer(key, "v=0")).await.unwrap();
        handle.signaling(leave(key)).await.unwrap();
    }

    let after = conf.state().await;
    assert_eq!(after.forwarding_edges, before.forwarding_edges);
    assert_eq!(after.tracks, before.tracks);
    assert_eq!(after.endpoint_children, before.endpoint_children);
    assert_eq!(after.peers.len(), 2);

    // The next event is still processed
    conf.service
        .handle()
        .signaling(answer(&a.key, "v=0 answer"))
        .await
        .unwrap();
    let expected = RecordedCommand::Signal(PeerSignal::SdpAnswer("v=0 answer".to_string()));
    conf.factory
        .wait_until(|f| f.commands(&a.peer_id).contains(&expected))
        .await;
    assert!(conf
        .factory
        .commands(&b.peer_id)
        .iter()
        .all(|c| !matches!(c, RecordedCommand::Signal(_))));
}

#[tokio::test]
async fn test_answer_track_metadata_appears_in_directory() {
    let mut conf = TestConference::start();
    let a = conf.admit("a", JoinBuilder::publishes_audio).await;

    conf.service
        .handle()
        .signaling(sfu_controller::signaling::SignalingEvent::Answer {
            key: a.key.clone(),
            sdp_answer: "v=0".to_string(),
            mid_to_track_metadata: [("0".to_string(), serde_json::json!({"label": "mic"}))]
                .into_iter()
                .collect(),
        })
        .await
        .unwrap();

    let key = conf.service.issue_admission_key().unwrap();
    conf.service
        .handle()
        .signaling(JoinBuilder::new(&key, "b").build())
        .await
        .unwrap();
    let OutboundEvent::PeerAccepted { directory, .. } =
        next_admission_result(&mut conf.outbound).await
    else {
        panic!("expected peer_accepted");
    };
    let entry = directory.first().unwrap();
    assert_eq!(entry.peer_id, a.peer_id);
    assert_eq!(
        entry.track_metadata.get("0"),
        Some(&serde_json::json!({"label": "mic"}))
    );
    assert_eq!(entry.join_track_metadata, None, "the answer replaces it");
}

#[tokio::test]
async fn test_join_track_metadata_appears_in_directory() {
    let mut conf = TestConference::start();
    let a = conf
        .admit("a", |j| {
            j.publishes_video()
                .track_metadata(serde_json::json!({"label": "camera"}))
        })
        .await;

    let key = conf.service.issue_admission_key().unwrap();
    conf.service
        .handle()
        .signaling(JoinBuilder::new(&key, "b").build())
        .await
        .unwrap();
    let OutboundEvent::PeerAccepted { directory, .. } =
        next_admission_result(&mut conf.outbound).await
    else {
        panic!("expected peer_accepted");
    };
    let entry = directory.first().unwrap();
    assert_eq!(entry.peer_id, a.peer_id);
    assert_eq!(
        entry.join_track_metadata,
        Some(serde_json::json!({"label": "camera"}))
    );
    assert!(entry.track_metadata.is_empty());
}

#[tokio::test]
async fn test_endpoint_signals_are_relayed_to_the_peer() {
    let mut conf = TestConference::start();
    let (_, mut vad) = conf.service.dispatcher().register(Topic::VoiceActivity);
    let a = conf.admit("a", JoinBuilder::publishes_audio).await;

    let notifier = conf.factory.notifier(&a.peer_id).unwrap();
    notifier
        .signal(serde_json::json!({"sdp_offer": "v=0 offer"}))
        .await
        .unwrap();
    notifier.voice_activity(VoiceActivity::Speech).await.unwrap();

    assert_eq!(
        next_outbound(&mut conf.outbound).await,
        OutboundEvent::Signal {
            peer_id: a.peer_id.clone(),
            payload: serde_json::json!({"sdp_offer": "v=0 offer"}),
        }
    );
    assert_eq!(
        next_notification(&mut vad).await,
        Notification::VoiceActivity {
            peer_id: a.peer_id.clone(),
            activity: VoiceActivity::Speech,
        }
    );
}

#[tokio::test]
async fn test_endpoint_driver_error_removes_only_that_peer() {
    let config = TestConfig::new().build();
    let factory = MockEndpointFactory::new().fail_on_signal_for("b");
    let mut conf = TestConference::start_with(&config, factory);
    let (_, mut left) = conf.service.dispatcher().register(Topic::PeerLeft);

    let a = conf.admit("a", JoinBuilder::publishes_av).await;
    let b = conf.admit("b", JoinBuilder::receive_only).await;
    let c = conf.admit("c", JoinBuilder::receive_only).await;

    conf.service
        .handle()
        .signaling(candidate(&b.key, "candidate:bad"))
        .await
        .unwrap();

    assert_eq!(
        next_notification(&mut left).await,
        peer_left(&b.peer_id, LeaveReason::EndpointFailed)
    );

    let state = conf.state().await;
    assert!(state.peer(&b.peer_id).is_none());
    assert!(state.peer(&a.peer_id).is_some());
    assert!(state.peer(&c.peer_id).is_some());
    assert_eq!(actual_edges(&state), expected_edges(&state));
    assert!(!state
        .endpoint_children
        .contains(&ChildId::Endpoint(b.peer_id.clone())));

    // The others keep working
    conf.sync_endpoint(&c, "still-alive").await;
    let published: BTreeSet<_> = a.tracks.iter().cloned().collect();
    assert_eq!(conf.factory.forwarded_to(&c.peer_id), published);
}

#[tokio::test]
async fn test_endpoint_panic_is_isolated() {
    let config = TestConfig::new().build();
    let factory = MockEndpointFactory::new().panic_on_withdraw_for("c");
    let mut conf = TestConference::start_with(&config, factory);
    let (_, mut left) = conf.service.dispatcher().register(Topic::PeerLeft);

    let a = conf.admit("a", JoinBuilder::publishes_audio).await;
    let b = conf.admit("b", JoinBuilder::publishes_video).await;
    let c = conf.admit("c", JoinBuilder::receive_only).await;

    conf.service.handle().signaling(leave(&a.key)).await.unwrap();

    assert_eq!(
        next_notification(&mut left).await,
        peer_left(&a.peer_id, LeaveReason::Left)
    );
    assert_eq!(
        next_notification(&mut left).await,
        peer_left(&c.peer_id, LeaveReason::EndpointFailed)
    );

    let state = conf.state().await;
    assert_eq!(state.peers.len(), 1);
    assert!(state.peer(&b.peer_id).unwrap().endpoint_live);
    assert!(state.forwarding_edges.is_empty(), "b has nobody to send to");
}

#[tokio::test]
async fn test_screen_share_source_is_not_told_about_withdrawals() {
    let config = TestConfig::new()
        .withdrawal_exclusion(WithdrawalExclusion::ScreenShareSource)
        .build();
    let mut conf = TestConference::start_with(&config, MockEndpointFactory::new());

    let a = conf.admit("a", JoinBuilder::publishes_av).await;
    let presenter = conf.admit("presenter", JoinBuilder::publishes_video).await;
    let viewer = conf.admit("viewer", JoinBuilder::receive_only).await;

    conf.service
        .handle()
        .set_screen_share_source(Some(presenter.peer_id.clone()))
        .await
        .unwrap();
    conf.service.handle().signaling(leave(&a.key)).await.unwrap();

    conf.sync_endpoint(&viewer, "viewer-sync").await;
    conf.sync_endpoint(&presenter, "presenter-sync").await;

    let withdrawn: BTreeSet<_> = conf
        .factory
        .withdrawn_from(&viewer.peer_id)
        .into_iter()
        .collect();
    assert_eq!(withdrawn, a.tracks.iter().cloned().collect());
    assert!(
        conf.factory.withdrawn_from(&presenter.peer_id).is_empty(),
        "screen-share source is excluded"
    );

    // The presenter's own departure is withdrawn normally and clears the marker
    conf.service
        .handle()
        .signaling(leave(&presenter.key))
        .await
        .unwrap();
    conf.sync_endpoint(&viewer, "viewer-sync-2").await;
    assert!(conf
        .factory
        .withdrawn_from(&viewer.peer_id)
        .contains(presenter.tracks.first().unwrap()));
}

#[tokio::test]
async fn test_without_exclusion_every_peer_is_told() {
    let mut conf = TestConference::start();

    let a = conf.admit("a", JoinBuilder::publishes_audio).await;
    let presenter = conf.admit("presenter", JoinBuilder::publishes_video).await;
    let viewer = conf.admit("viewer", JoinBuilder::receive_only).await;

    conf.service
        .handle()
        .set_screen_share_source(Some(presenter.peer_id.clone()))
        .await
        .unwrap();
    conf.service.handle().signaling(leave(&a.key)).await.unwrap();

    for peer in [&viewer, &presenter] {
        conf.sync_endpoint(peer, "sync").await;
        assert_eq!(conf.factory.withdrawn_from(&peer.peer_id), a.tracks);
    }
}

#[tokio::test]
async fn test_endpoint_children_follow_peer_lifetime() {
    let mut conf = TestConference::start();
    let a = conf.admit("a", JoinBuilder::publishes_audio).await;
    let audio = a.tracks.first().unwrap().clone();

    let state = conf.state().await;
    for child in [
        ChildId::Endpoint(a.peer_id.clone()),
        ChildId::FanOut(audio.clone()),
        ChildId::DiscardSink(audio.clone()),
    ] {
        assert!(state.endpoint_children.contains(&child), "{child:?} missing");
    }

    conf.service
        .handle()
        .remove_peer(a.peer_id.clone())
        .await
        .unwrap();
    assert!(conf.state().await.endpoint_children.is_empty());
    conf.factory.wait_until(|f| f.was_closed(&a.peer_id)).await;
}

#[tokio::test]
async fn test_shutdown_removes_every_peer() {
    let mut conf = TestConference::start();
    let (_, mut left) = conf.service.dispatcher().register(Topic::PeerLeft);
    let a = conf.admit("a", JoinBuilder::publishes_av).await;
    let b = conf.admit("b", JoinBuilder::receive_only).await;

    let health = conf.service.health_state();
    assert!(health.is_ready());

    let TestConference {
        service,
        mut outbound,
        factory,
        ..
    } = conf;
    service.shutdown().await.unwrap();
    assert!(!health.is_ready());

    let mut reasons = vec![
        next_notification(&mut left).await,
        next_notification(&mut left).await,
    ];
    reasons.sort_by(|x, y| x.peer_id().cmp(y.peer_id()));
    assert_eq!(
        reasons,
        vec![
            peer_left(&a.peer_id, LeaveReason::Shutdown),
            peer_left(&b.peer_id, LeaveReason::Shutdown),
        ]
    );
    factory
        .wait_until(|f| f.was_closed(&a.peer_id) && f.was_closed(&b.peer_id))
        .await;

    // No admission results after shutdown
    while let Ok(event) = outbound.try_recv() {
        assert!(matches!(event, OutboundEvent::Signal { .. }), "{event:?}");
    }
}

#[tokio::test]
async fn test_shutdown_denies_pending_joins() {
    let factory = MockEndpointFactory::new();
    let (service, mut outbound) = start_service(factory);

    let key = service.issue_admission_key().unwrap();
    service
        .handle()
        .signaling(JoinBuilder::new(&key, "waiting").build())
        .await
        .unwrap();

    service.shutdown().await.unwrap();
    assert_eq!(
        next_outbound(&mut outbound).await,
        OutboundEvent::PeerDenied {
            peer_id: PeerId::from("waiting")
        }
    );
}

#[tokio::test]
async fn test_health_server_reports_readiness() {
    let factory = MockEndpointFactory::new();
    let (service, _outbound) = start_service(factory);
    let addr = service.serve_health(None).await.unwrap();

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /ready HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(
        response.starts_with("HTTP/1.1 200"),
        "unexpected response: {response}"
    );

    service.shutdown().await.unwrap();
}
