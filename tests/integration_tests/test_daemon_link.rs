// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio::{io::AsyncWriteExt, net::TcpListener, time::sleep};
use tokio_util::sync::CancellationToken;
use warden_mgr_rs::{
    daemon::link::{DaemonEvent, DaemonLink, LinkState},
    error::WardenError,
};

use crate::integration_tests::common::{DaemonBehavior, MockDaemon, free_port};

fn link_to(port: u16, ping_interval: Duration) -> DaemonLink {
    DaemonLink::new(
        format!("127.0.0.1:{port}"),
        ping_interval,
        CancellationToken::new(),
    )
}

async fn settle(link: &DaemonLink, ticks: usize) {
    for _ in 0..ticks {
        link.tick().await;
        let _ = link.drain_events().await;
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn key_requests_are_serialized_and_deduplicated() {
    let daemon = MockDaemon::spawn(DaemonBehavior {
        answer_keys: false,
        ..DaemonBehavior::default()
    })
    .await;
    let link = link_to(daemon.port, Duration::from_secs(30));

    settle(&link, 2).await;
    assert_eq!(link.state().await, LinkState::Ready);

    link.request_keys(1, [0x01; 40]).await;
    link.request_keys(2, [0x02; 40]).await;
    // Same session again: never two overlapping requests.
    link.request_keys(1, [0x01; 40]).await;

    sleep(Duration::from_millis(100)).await;

    // Only the head of the queue is on the wire while no answer came back.
    assert_eq!(daemon.seen_key_requests(), vec![1]);
}

#[tokio::test]
#[serial_test::serial]
async fn in_flight_request_is_replayed_after_reconnect() {
    let daemon = MockDaemon::spawn(DaemonBehavior {
        drop_on_first_key_req: true,
        ..DaemonBehavior::default()
    })
    .await;
    let link = link_to(daemon.port, Duration::from_secs(30));

    settle(&link, 2).await;
    link.request_keys(7, [0x07; 40]).await;

    // The daemon hangs up on the first request; the link must reconnect
    // (1s backoff) and replay it.
    sleep(Duration::from_millis(1200)).await;
    settle(&link, 5).await;

    let mut got_keys = false;
    for _ in 0..25 {
        link.tick().await;
        for ev in link.drain_events().await {
            if let DaemonEvent::NewKeys { session_id, .. } = ev {
                assert_eq!(session_id, 7);
                got_keys = true;
            }
        }
        if got_keys {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    assert!(got_keys, "replayed request never got an answer");
    assert_eq!(daemon.seen_key_requests(), vec![7, 7]);
    assert!(daemon.connection_count() >= 2);
}

#[tokio::test]
#[serial_test::serial]
async fn unanswered_ping_stalls_and_reconnects() {
    let daemon = MockDaemon::spawn(DaemonBehavior {
        answer_pings: false,
        ..DaemonBehavior::default()
    })
    .await;
    let link = link_to(daemon.port, Duration::from_millis(200));

    settle(&link, 2).await;
    assert_eq!(daemon.connection_count(), 1);

    // First ping goes out after the interval and is never answered; the
    // next ping tick declares the link stalled and closes it.
    sleep(Duration::from_millis(250)).await;
    settle(&link, 1).await;
    sleep(Duration::from_millis(250)).await;
    settle(&link, 1).await;

    assert_ne!(link.state().await, LinkState::Ready);

    // Backoff expires and a fresh connection is made.
    sleep(Duration::from_millis(1200)).await;
    settle(&link, 3).await;

    assert_eq!(link.state().await, LinkState::Ready);
    assert!(daemon.connection_count() >= 2);
}

#[tokio::test]
async fn unreachable_daemon_surfaces_a_typed_error() {
    let port = free_port().await;
    let link = link_to(port, Duration::from_secs(30));

    link.tick().await;

    let events = link.drain_events().await;
    assert!(
        events.iter().any(|ev| matches!(
            ev,
            DaemonEvent::Fault(WardenError::DaemonUnreachable { .. })
        )),
        "expected an unreachable fault, got {events:?}"
    );
    assert_ne!(link.state().await, LinkState::Ready);
}

#[tokio::test]
async fn garbled_daemon_is_a_protocol_violation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        // Three header bytes with an opcode the protocol never defined.
        let _ = stream.write_all(&[0xFF, 0x00, 0x00]).await;
        sleep(Duration::from_secs(2)).await;
        drop(stream);
    });

    let link = link_to(port, Duration::from_secs(30));
    link.tick().await;

    let mut got_violation = false;
    for _ in 0..25 {
        for ev in link.drain_events().await {
            if matches!(
                ev,
                DaemonEvent::Fault(WardenError::DaemonProtocolViolation { .. })
            ) {
                got_violation = true;
            }
        }
        if got_violation {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(got_violation, "junk frame did not raise a protocol violation");
}

#[tokio::test]
async fn cancelled_session_leaves_the_queue() {
    let daemon = MockDaemon::spawn(DaemonBehavior {
        answer_keys: false,
        ..DaemonBehavior::default()
    })
    .await;
    let link = link_to(daemon.port, Duration::from_secs(30));

    settle(&link, 2).await;
    link.request_keys(1, [0x01; 40]).await;
    link.request_keys(2, [0x02; 40]).await;
    link.cancel_session(2).await;

    sleep(Duration::from_millis(100)).await;
    // Session 2 was still queued; it must never hit the wire.
    assert_eq!(daemon.seen_key_requests(), vec![1]);
}
