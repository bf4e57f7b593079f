//! Integration tests for the transport contract and request/reply messaging.
//!
//! # Purpose
//!
//! These tests drive [`MemoryTransport`] endpoints and [`MessageService`]
//! through their public APIs, the way the session coordinator uses them.
//! They verify:
//!
//! - Invitation: a guest only links to a host that is still listening.
//! - Loss reporting: peers of a leaving device see `OneConnectionLost` while
//!   other links remain and `AllConnectionsLost` when none do, and the
//!   device that leaves hears nothing about its own disconnect.
//! - Delivery: `send` reaches every peer, `send_to` exactly one.
//! - Replies: a request completes once every peer answered and fails on the
//!   first rejection or the loss of a peer it was waiting on.
//!
//! # Event flow
//!
//! ```text
//! Host endpoint                          Guest endpoint
//! ─────────────                          ──────────────
//! start_listening → OnListeningToGuests
//!                                        connect_to_devices([host])
//! GuestConnectionEstablished(guest) ◄──► ConnectionEstablished(host)
//! send(bytes)                       ────► Received { from: host, bytes }
//! Received { from: guest, bytes }   ◄──── send_to(host, reply)
//! ```

use std::sync::Arc;
use std::time::Duration;

use arpet_core::{ConnectionEventType, ConnectionMode, Device, ReplyStatus, ViewCommand};
use arpet_session::application::message_service::{InboundPayload, MessageError, MessageService};
use arpet_session::application::transport::{Transport, TransportEvent};
use arpet_session::infrastructure::network::{MemoryNetwork, MemoryTransport};
use tokio::sync::mpsc;

type Events = mpsc::Receiver<TransportEvent>;

fn sink() -> (mpsc::Sender<TransportEvent>, Events) {
    mpsc::channel(32)
}

/// Next event, which must be a connection event.
async fn next_connection(rx: &mut Events) -> (ConnectionEventType, Option<Device>) {
    match rx.recv().await {
        Some(TransportEvent::Connection(event)) => (event.event_type, event.device),
        other => panic!("expected a connection event, got {other:?}"),
    }
}

async fn next_frame(rx: &mut Events) -> (arpet_core::DeviceId, Vec<u8>) {
    match rx.recv().await {
        Some(TransportEvent::Received { from, bytes }) => (from, bytes),
        other => panic!("expected a data frame, got {other:?}"),
    }
}

/// A listening host plus `guests` connected guests, with their setup
/// events already consumed.
async fn star(
    network: &MemoryNetwork,
    guests: usize,
) -> (MemoryTransport, Events, Vec<(MemoryTransport, Events)>) {
    let host = network.endpoint("host");
    let (host_tx, mut host_rx) = sink();
    host.start_listening(host_tx).await.unwrap();
    assert_eq!(
        next_connection(&mut host_rx).await.0,
        ConnectionEventType::OnListeningToGuests
    );

    let mut joined = Vec::new();
    for i in 0..guests {
        let guest = network.endpoint(&format!("guest-{i}"));
        let (guest_tx, mut guest_rx) = sink();
        guest
            .connect_to_devices(vec![host.local_device()], guest_tx)
            .await
            .unwrap();
        let (event, device) = next_connection(&mut guest_rx).await;
        assert_eq!(event, ConnectionEventType::ConnectionEstablished);
        assert_eq!(device.map(|d| d.id), Some(host.local_device().id));

        let (event, device) = next_connection(&mut host_rx).await;
        assert_eq!(event, ConnectionEventType::GuestConnectionEstablished);
        assert_eq!(device.map(|d| d.id), Some(guest.local_device().id));
        joined.push((guest, guest_rx));
    }
    (host, host_rx, joined)
}

// ── Invitation ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_guest_arriving_after_host_stopped_listening_finds_no_connection() {
    // Arrange
    let network = MemoryNetwork::new();
    let (host, _host_rx, _) = star(&network, 0).await;
    host.stop_listening().await.unwrap();
    let late = network.endpoint("late");
    let (tx, mut rx) = sink();

    // Act
    let result = late.connect_to_devices(vec![host.local_device()], tx).await;

    // Assert
    assert!(result.is_ok());
    assert_eq!(
        next_connection(&mut rx).await.0,
        ConnectionEventType::NoConnectionFound
    );
    assert_eq!(late.mode(), ConnectionMode::None);
    assert_eq!(host.total_connected(), 0);
    assert!(network.listening_devices().is_empty());
}

#[tokio::test]
async fn test_connected_guests_survive_stop_listening() {
    // Arrange
    let network = MemoryNetwork::new();
    let (host, _host_rx, guests) = star(&network, 2).await;

    // Act
    host.stop_listening().await.unwrap();

    // Assert
    assert_eq!(host.total_connected(), 2);
    assert!(!host.is_listening());
    for (guest, _) in &guests {
        assert_eq!(guest.connected_devices(), vec![host.local_device().id]);
    }
}

// ── Loss reporting ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_host_sees_one_then_all_connections_lost() {
    // Arrange
    let network = MemoryNetwork::new();
    let (host, mut host_rx, mut guests) = star(&network, 2).await;
    let (second, _) = guests.pop().unwrap();
    let (first, _) = guests.pop().unwrap();

    // Act / Assert: first guest leaves, one link remains
    first.disconnect().await;
    let (event, device) = next_connection(&mut host_rx).await;
    assert_eq!(event, ConnectionEventType::OneConnectionLost);
    assert_eq!(device.map(|d| d.id), Some(first.local_device().id));
    assert_eq!(host.total_connected(), 1);

    // Act / Assert: the last guest leaves
    second.disconnect().await;
    let (event, device) = next_connection(&mut host_rx).await;
    assert_eq!(event, ConnectionEventType::AllConnectionsLost);
    assert_eq!(device.map(|d| d.id), Some(second.local_device().id));
    assert_eq!(host.total_connected(), 0);
}

#[tokio::test]
async fn test_voluntary_disconnect_is_silent_locally() {
    // Arrange
    let network = MemoryNetwork::new();
    let (host, mut host_rx, mut guests) = star(&network, 2).await;

    // Act
    host.disconnect().await;

    // Assert: every guest lost its only link
    for (guest, rx) in guests.iter_mut() {
        assert_eq!(
            next_connection(rx).await.0,
            ConnectionEventType::AllConnectionsLost
        );
        assert_eq!(guest.total_connected(), 0);
        assert_eq!(guest.mode(), ConnectionMode::None);
    }
    assert_eq!(host.mode(), ConnectionMode::None);
    assert!(host_rx.try_recv().is_err());
}

// ── Delivery ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_send_reaches_every_peer_and_send_to_only_one() {
    // Arrange
    let network = MemoryNetwork::new();
    let (host, _host_rx, mut guests) = star(&network, 2).await;
    let host_id = host.local_device().id;
    let target = guests[1].0.local_device().id;

    // Act
    let reached = host.send(vec![1, 2, 3]).await.unwrap();
    host.send_to(target, vec![9]).await.unwrap();

    // Assert
    assert_eq!(reached.len(), 2);
    for (_, rx) in guests.iter_mut() {
        assert_eq!(next_frame(rx).await, (host_id, vec![1, 2, 3]));
    }
    assert_eq!(next_frame(&mut guests[1].1).await, (host_id, vec![9]));
    assert!(guests[0].1.try_recv().is_err());
}

// ── Request / reply ───────────────────────────────────────────────────────────

/// Each guest answers the next request it receives with `status`.
async fn answer(
    guests: &mut [(MemoryTransport, Events)],
    statuses: Vec<ReplyStatus>,
) -> Vec<InboundPayload> {
    let mut payloads = Vec::new();
    for ((guest, rx), status) in guests.iter_mut().zip(statuses) {
        let service = MessageService::new(Arc::new(guest.clone()), Duration::from_secs(1));
        let (from, bytes) = next_frame(rx).await;
        let inbound = service
            .handle_inbound(from, &bytes)
            .unwrap()
            .expect("a request");
        service
            .reply(inbound.from, inbound.request_seq, status)
            .await
            .unwrap();
        payloads.push(inbound.payload);
    }
    payloads
}

/// Feeds every frame the host receives into its message service.
async fn pump_replies(service: &MessageService, rx: &mut Events, frames: usize) {
    for _ in 0..frames {
        let (from, bytes) = next_frame(rx).await;
        assert_eq!(service.handle_inbound(from, &bytes).unwrap(), None);
    }
}

#[tokio::test]
async fn test_view_command_completes_when_every_guest_replies() {
    // Arrange
    let network = MemoryNetwork::new();
    let (host, mut host_rx, mut guests) = star(&network, 2).await;
    let service = MessageService::new(Arc::new(host), Duration::from_secs(1));

    // Act
    let pending = service
        .start_view_command(ViewCommand::LookingSideBySide)
        .await
        .unwrap();
    let payloads = answer(&mut guests, vec![ReplyStatus::Ok, ReplyStatus::Ok]).await;
    pump_replies(&service, &mut host_rx, 2).await;

    // Assert
    assert_eq!(pending.wait().await, Ok(()));
    assert_eq!(
        payloads,
        vec![InboundPayload::ViewCommand(ViewCommand::LookingSideBySide); 2]
    );
    assert_eq!(service.pending_requests(), 0);
}

#[tokio::test]
async fn test_one_rejection_fails_the_request() {
    // Arrange
    let network = MemoryNetwork::new();
    let (host, mut host_rx, mut guests) = star(&network, 2).await;
    let service = MessageService::new(Arc::new(host), Duration::from_secs(1));
    let rejecter = guests[1].0.local_device().id;

    // Act
    let pending = service.start_share_cloud_anchors(vec![]).await.unwrap();
    answer(
        &mut guests,
        vec![ReplyStatus::Ok, ReplyStatus::Failed("no anchors".to_string())],
    )
    .await;
    pump_replies(&service, &mut host_rx, 2).await;

    // Assert
    assert_eq!(
        pending.wait().await,
        Err(MessageError::Rejected {
            device: rejecter,
            reason: "no anchors".to_string(),
        })
    );
}

#[tokio::test]
async fn test_losing_an_awaited_guest_fails_the_request() {
    // Arrange
    let network = MemoryNetwork::new();
    let (host, mut host_rx, mut guests) = star(&network, 2).await;
    let service = MessageService::new(Arc::new(host), Duration::from_secs(1));
    let (leaver, _) = guests.pop().unwrap();
    let leaver_id = leaver.local_device().id;

    // Act
    let pending = service
        .start_view_command(ViewCommand::SharedHost)
        .await
        .unwrap();
    leaver.disconnect().await;
    let (event, device) = next_connection(&mut host_rx).await;
    assert_eq!(event, ConnectionEventType::OneConnectionLost);
    service.on_peer_lost(device.expect("lost device").id);

    // Assert
    assert_eq!(pending.wait().await, Err(MessageError::PeerLost(leaver_id)));
}

#[tokio::test]
async fn test_request_without_peers_fails_immediately() {
    let network = MemoryNetwork::new();
    let (host, _host_rx, _) = star(&network, 0).await;
    let service = MessageService::new(Arc::new(host), Duration::from_secs(1));

    let result = service.send_view_command(ViewCommand::SharedHost).await;

    assert_eq!(result, Err(MessageError::NoPeers));
}

#[tokio::test(start_paused = true)]
async fn test_silent_guest_times_out() {
    // Arrange
    let network = MemoryNetwork::new();
    let (host, _host_rx, _guests) = star(&network, 1).await;
    let service = MessageService::new(Arc::new(host), Duration::from_secs(10));

    // Act
    let result = service.send_view_command(ViewCommand::SharedHost).await;

    // Assert
    assert!(matches!(result, Err(MessageError::Timeout { .. })));
    assert_eq!(service.pending_requests(), 0);
}
