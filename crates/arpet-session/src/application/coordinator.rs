//! Session coordinator: runs a [`SessionMachine`] on a single tokio task.
//!
//! The machine is synchronous and returns [`SessionEffect`]s; this module is
//! where those effects turn into transport calls, cloud uploads, messages and
//! timers.
//!
//! # Task layout (for beginners)
//!
//! ```text
//!   SessionHandle ──(UserIntent)──┐
//!                                 ▼
//!   Transport ──(TransportEvent)──► coordinator task ──(SessionOutput)──► UI
//!                                 ▲        │
//!   spawned jobs ──(results)──────┘        └──► spawns hosting / resolving /
//!                                                reply waits / timers
//! ```
//!
//! Only the coordinator task touches the machine, so no locking is needed.
//! Long-running work (cloud requests, waiting for replies, timers) runs in
//! spawned tasks that post their result back as a [`SessionInput`] tagged with
//! the epoch it was started in.  Work that finishes after a cancel is then
//! discarded by the machine instead of being aborted here.
//!
//! Frames are handed to the transport from the coordinator task itself, so
//! the order in which the machine asks for messages is the order in which
//! peers receive them.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arpet_core::{ConnectionEventType, Role, SessionState};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::cloud_anchor::{CloudAnchorManager, CloudAnchorService};
use super::message_service::MessageService;
use super::session::{
    SessionEffect, SessionInput, SessionMachine, SessionOutput, SessionSettings, UserIntent,
};
use super::transport::{EventSink, Transport, TransportEvent};

/// Capacity of the intent, event and output channels.
const CHANNEL_CAPACITY: usize = 64;

/// The session task has finished; intents can no longer be delivered.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("session has ended")]
pub struct SessionClosed;

/// Sends user intents to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionInput>,
}

impl SessionHandle {
    pub async fn send(&self, intent: UserIntent) -> Result<(), SessionClosed> {
        self.tx
            .send(SessionInput::User(intent))
            .await
            .map_err(|_| SessionClosed)
    }

    /// Whether the session task is still running.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub role: Role,
    pub final_state: SessionState,
    /// Whether sharing was started at any point.
    pub shared: bool,
}

/// Owns a session and drives it until it reaches `Disconnected`.
pub struct SessionCoordinator {
    machine: SessionMachine,
    transport: Arc<dyn Transport>,
    messages: Arc<MessageService>,
    input_tx: mpsc::Sender<SessionInput>,
    input_rx: mpsc::Receiver<SessionInput>,
    event_tx: EventSink,
    event_rx: mpsc::Receiver<TransportEvent>,
    output_tx: mpsc::Sender<SessionOutput>,
    follow_ups: VecDeque<SessionInput>,
    shared: bool,
}

impl SessionCoordinator {
    /// Creates a coordinator together with its intent handle and output receiver.
    pub fn new(
        settings: SessionSettings,
        reply_timeout: Duration,
        transport: Arc<dyn Transport>,
        cloud: Arc<dyn CloudAnchorService>,
    ) -> (Self, SessionHandle, mpsc::Receiver<SessionOutput>) {
        let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let coordinator = Self {
            machine: SessionMachine::new(settings, CloudAnchorManager::new(cloud)),
            messages: Arc::new(MessageService::new(Arc::clone(&transport), reply_timeout)),
            transport,
            input_tx: input_tx.clone(),
            input_rx,
            event_tx,
            event_rx,
            output_tx,
            follow_ups: VecDeque::new(),
            shared: false,
        };
        (coordinator, SessionHandle { tx: input_tx }, output_rx)
    }

    /// Runs the session until it is torn down.
    pub async fn run(mut self) -> SessionReport {
        info!("session started on {} transport", self.transport.name());

        loop {
            let input = match self.follow_ups.pop_front() {
                Some(input) => input,
                None => tokio::select! {
                    Some(input) = self.input_rx.recv() => input,
                    Some(event) = self.event_rx.recv() => match self.translate(event) {
                        Some(input) => input,
                        None => continue,
                    },
                    else => break,
                },
            };

            for effect in self.machine.handle(input) {
                self.execute(effect).await;
            }
            if self.machine.state().is_terminal() {
                break;
            }
        }

        let report = SessionReport {
            role: self.machine.role(),
            final_state: self.machine.state(),
            shared: self.shared,
        };
        info!("session ended: {report:?}");
        report
    }

    /// Turns a transport event into a machine input.
    fn translate(&mut self, event: TransportEvent) -> Option<SessionInput> {
        match event {
            TransportEvent::Connection(event) => {
                match event.event_type {
                    ConnectionEventType::OneConnectionLost => {
                        if let Some(device) = &event.device {
                            self.messages.on_peer_lost(device.id);
                        }
                    }
                    ConnectionEventType::AllConnectionsLost => self.messages.cancel_all(),
                    _ => {}
                }
                Some(SessionInput::Connection(event))
            }
            TransportEvent::Received { from, bytes } => {
                match self.messages.handle_inbound(from, &bytes) {
                    Ok(inbound) => inbound.map(SessionInput::Inbound),
                    Err(e) => {
                        warn!("dropping frame from {from}: {e}");
                        None
                    }
                }
            }
        }
    }

    async fn execute(&mut self, effect: SessionEffect) {
        match effect {
            SessionEffect::StartListening { epoch } => {
                if let Err(error) = self.transport.start_listening(self.event_tx.clone()).await {
                    self.follow_ups
                        .push_back(SessionInput::InvitationFailed { epoch, error });
                }
            }
            SessionEffect::StopListening => {
                if let Err(e) = self.transport.stop_listening().await {
                    warn!("stop listening failed: {e}");
                }
            }
            SessionEffect::FindHost { epoch } => {
                let transport = Arc::clone(&self.transport);
                let sink = self.event_tx.clone();
                self.spawn_job(async move {
                    let result = match transport.discover_hosts().await {
                        Ok(hosts) => transport.connect_to_devices(hosts, sink).await,
                        Err(e) => Err(e),
                    };
                    result
                        .err()
                        .map(|error| SessionInput::InvitationFailed { epoch, error })
                });
            }
            SessionEffect::Disconnect => self.transport.disconnect().await,
            SessionEffect::Host { epoch, request } => {
                self.spawn_job(async move {
                    let result = request.run().await;
                    Some(SessionInput::HostingFinished { epoch, result })
                });
            }
            SessionEffect::Resolve {
                epoch,
                from,
                request_seq,
                request,
            } => {
                self.spawn_job(async move {
                    let result = request.run().await;
                    Some(SessionInput::ResolvingFinished {
                        epoch,
                        from,
                        request_seq,
                        result,
                    })
                });
            }
            SessionEffect::ShareAnchors { epoch, anchors } => {
                match self.messages.start_share_cloud_anchors(anchors).await {
                    Ok(pending) => self.spawn_job(async move {
                        let result = pending.wait().await;
                        Some(SessionInput::AnchorsShared { epoch, result })
                    }),
                    Err(e) => self.follow_ups.push_back(SessionInput::AnchorsShared {
                        epoch,
                        result: Err(e),
                    }),
                }
            }
            SessionEffect::SendCommand { epoch, command } => {
                match self.messages.start_view_command(command).await {
                    Ok(pending) => self.spawn_job(async move {
                        let result = pending.wait().await;
                        Some(SessionInput::CommandDelivered {
                            epoch,
                            command,
                            result,
                        })
                    }),
                    Err(e) => self.follow_ups.push_back(SessionInput::CommandDelivered {
                        epoch,
                        command,
                        result: Err(e),
                    }),
                }
            }
            SessionEffect::Reply {
                to,
                request_seq,
                status,
            } => {
                if let Err(e) = self.messages.reply(to, request_seq, status).await {
                    warn!("reply to {to} failed: {e}");
                }
            }
            SessionEffect::StartTimer {
                epoch,
                timer,
                after,
            } => {
                debug!("timer {timer:?} in {after:?}");
                self.spawn_job(async move {
                    tokio::time::sleep(after).await;
                    Some(SessionInput::TimerFired { epoch, timer })
                });
            }
            SessionEffect::CancelPendingMessages => self.messages.cancel_all(),
            SessionEffect::Output(output) => {
                if matches!(output, SessionOutput::SharingStarted { .. }) {
                    self.shared = true;
                }
                if self.output_tx.send(output).await.is_err() {
                    debug!("output receiver dropped; {output:?} not delivered");
                }
            }
        }
    }

    /// Runs `job` on its own task and feeds its result back into the loop.
    fn spawn_job<F>(&self, job: F)
    where
        F: Future<Output = Option<SessionInput>> + Send + 'static,
    {
        let inputs = self.input_tx.clone();
        tokio::spawn(async move {
            if let Some(input) = job.await {
                // The session may have ended meanwhile; nothing is waiting then.
                let _ = inputs.send(input).await;
            }
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::cloud_anchor::MockCloudAnchorService;
    use crate::application::message_service::DEFAULT_REPLY_TIMEOUT;
    use crate::application::transport::{ConnectionError, MockTransport};
    use arpet_core::{Device, DeviceId, NotFoundTarget, Pose, Screen};

    fn online_cloud() -> Arc<dyn CloudAnchorService> {
        let mut service = MockCloudAnchorService::new();
        service.expect_has_internet_connection().return_const(true);
        Arc::new(service)
    }

    fn base_transport() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.expect_name().return_const("mock");
        mock.expect_local_device()
            .returning(|| Device::new(DeviceId::random(), "local", "mock:0"));
        mock.expect_disconnect().returning(|| ());
        mock.expect_stop_listening().returning(|| Ok(()));
        mock
    }

    #[tokio::test]
    async fn test_guest_without_hosts_sees_not_found_then_cancels() {
        // Arrange
        let mut transport = base_transport();
        transport
            .expect_discover_hosts()
            .returning(|| Err(ConnectionError::NoDevicesFound));
        let (coordinator, handle, mut outputs) = SessionCoordinator::new(
            SessionSettings::new(Pose::IDENTITY),
            DEFAULT_REPLY_TIMEOUT,
            Arc::new(transport),
            online_cloud(),
        );
        let task = tokio::spawn(coordinator.run());

        // Act
        handle.send(UserIntent::Guest).await.unwrap();
        let first = outputs.recv().await;
        let second = outputs.recv().await;
        handle.send(UserIntent::Cancel).await.unwrap();
        let report = task.await.unwrap();

        // Assert
        assert_eq!(first, Some(SessionOutput::Screen(Screen::FindingHost)));
        assert_eq!(
            second,
            Some(SessionOutput::Screen(Screen::NotFound(NotFoundTarget::Host)))
        );
        assert_eq!(report.role, Role::Guest);
        assert_eq!(report.final_state, SessionState::Disconnected);
        assert!(!report.shared);
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_listener_failure_surfaces_screen_and_returns_to_init() {
        // Arrange
        let mut transport = base_transport();
        transport
            .expect_start_listening()
            .returning(|_| Err(ConnectionError::PermissionDenied("bluetooth".into())));
        let (coordinator, handle, mut outputs) = SessionCoordinator::new(
            SessionSettings::new(Pose::IDENTITY),
            DEFAULT_REPLY_TIMEOUT,
            Arc::new(transport),
            online_cloud(),
        );
        let task = tokio::spawn(coordinator.run());

        // Act
        handle.send(UserIntent::Host).await.unwrap();
        let shown = outputs.recv().await;
        handle.send(UserIntent::Back).await.unwrap();
        let report = task.await.unwrap();

        // Assert
        assert_eq!(shown, Some(SessionOutput::Screen(Screen::BluetoothDisabled)));
        assert_eq!(report.final_state, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_sending_after_session_end_reports_closed() {
        let (coordinator, handle, _outputs) = SessionCoordinator::new(
            SessionSettings::new(Pose::IDENTITY),
            DEFAULT_REPLY_TIMEOUT,
            Arc::new(base_transport()),
            online_cloud(),
        );
        let task = tokio::spawn(coordinator.run());

        handle.send(UserIntent::Cancel).await.unwrap();
        task.await.unwrap();

        assert_eq!(handle.send(UserIntent::Host).await, Err(SessionClosed));
    }
}
