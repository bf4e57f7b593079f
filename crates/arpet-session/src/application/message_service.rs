//! Message service: request/reply messaging on top of a [`Transport`].
//!
//! Every outbound `ViewCommand` and `SharedCloudAnchors` message is a request
//! that the receiving peer answers with a `Reply` carrying the request's
//! sequence number.  A broadcast request succeeds only when **every** peer
//! that was connected at send time replied `Ok`.
//!
//! # Pending requests
//!
//! ```text
//!  start() ────► encode ──► pending[seq] = {awaiting: peers} ──► transport.send
//!                                  ▲
//!  handle_inbound(Reply{seq}) ─────┘  removes the peer; last one completes Ok
//! ```
//!
//! A `Failed` reply completes the request immediately with
//! [`MessageError::Rejected`].  A peer that drops while it still owes a reply
//! fails the request with [`MessageError::PeerLost`].  If nothing completes
//! the request within the reply timeout it fails with
//! [`MessageError::Timeout`].
//!
//! The service is `Sync`: requests can be awaited from several tasks while
//! another task feeds inbound frames in.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arpet_core::protocol::codec::encode_message_now;
use arpet_core::protocol::SequenceCounter;
use arpet_core::{
    decode_message, CloudAnchor, DeviceId, PetMessage, ProtocolError, ReplyStatus, ViewCommand,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::transport::{ConnectionError, Transport};

/// Default time a peer has to answer a request.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a request did not complete successfully.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MessageError {
    #[error("no connected peers")]
    NoPeers,
    #[error("no reply to request {seq} within {timeout:?}")]
    Timeout { seq: u64, timeout: Duration },
    #[error("{device} rejected the request: {reason}")]
    Rejected { device: DeviceId, reason: String },
    #[error("{0} disconnected before replying")]
    PeerLost(DeviceId),
    #[error("request was cancelled")]
    Cancelled,
    #[error("send failed: {0}")]
    Send(#[from] ConnectionError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A request received from a peer that must be answered with [`MessageService::reply`].
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub from: DeviceId,
    /// Sequence number to echo in the reply.
    pub request_seq: u64,
    pub payload: InboundPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    ViewCommand(ViewCommand),
    SharedCloudAnchors(Vec<CloudAnchor>),
}

#[derive(Debug)]
struct PendingRequest {
    awaiting: HashSet<DeviceId>,
    done: oneshot::Sender<Result<(), MessageError>>,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingRequest>>>;

fn lock(
    pending: &Mutex<HashMap<u64, PendingRequest>>,
) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A request that was sent and is waiting for its replies.
#[derive(Debug)]
pub struct PendingReply {
    seq: u64,
    rx: oneshot::Receiver<Result<(), MessageError>>,
    timeout: Duration,
    pending: PendingMap,
}

impl PendingReply {
    /// Sequence number the replies will refer to.
    pub fn sequence_number(&self) -> u64 {
        self.seq
    }

    /// Waits until every peer replied, one peer rejected, or the timeout elapsed.
    pub async fn wait(self) -> Result<(), MessageError> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MessageError::Cancelled),
            Err(_) => {
                lock(&self.pending).remove(&self.seq);
                warn!("request {} timed out after {:?}", self.seq, self.timeout);
                Err(MessageError::Timeout {
                    seq: self.seq,
                    timeout: self.timeout,
                })
            }
        }
    }
}

/// Sends requests, matches replies and surfaces inbound requests.
pub struct MessageService {
    transport: Arc<dyn Transport>,
    sequence: SequenceCounter,
    pending: PendingMap,
    reply_timeout: Duration,
}

impl MessageService {
    pub fn new(transport: Arc<dyn Transport>, reply_timeout: Duration) -> Self {
        Self {
            transport,
            sequence: SequenceCounter::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            reply_timeout,
        }
    }

    /// Asks every connected peer to switch its UI and waits for their replies.
    pub async fn send_view_command(&self, command: ViewCommand) -> Result<(), MessageError> {
        self.start_view_command(command).await?.wait().await
    }

    /// Shares hosted cloud anchors with every connected peer and waits for
    /// every peer to report that it resolved them.
    pub async fn share_cloud_anchors(&self, anchors: Vec<CloudAnchor>) -> Result<(), MessageError> {
        self.start_share_cloud_anchors(anchors).await?.wait().await
    }

    /// Sends a view command and returns without waiting for replies.
    ///
    /// Frames handed to the transport by consecutive `start_*` calls leave in
    /// call order.
    pub async fn start_view_command(
        &self,
        command: ViewCommand,
    ) -> Result<PendingReply, MessageError> {
        debug!("sending view command {command}");
        self.start(PetMessage::ViewCommand(command)).await
    }

    /// Shares cloud anchors and returns without waiting for replies.
    pub async fn start_share_cloud_anchors(
        &self,
        anchors: Vec<CloudAnchor>,
    ) -> Result<PendingReply, MessageError> {
        debug!("sharing {} cloud anchor(s)", anchors.len());
        self.start(PetMessage::SharedCloudAnchors(anchors)).await
    }

    /// Answers a request received from `to`.
    pub async fn reply(
        &self,
        to: DeviceId,
        request_seq: u64,
        status: ReplyStatus,
    ) -> Result<(), MessageError> {
        trace!("replying {status:?} to request {request_seq} from {to}");
        let bytes = encode_message_now(
            &PetMessage::Reply {
                request_seq,
                status,
            },
            self.sequence.next(),
        )?;
        self.transport.send_to(to, bytes).await?;
        Ok(())
    }

    /// Processes one inbound frame.
    ///
    /// Replies are matched against pending requests and consumed here.
    /// Requests are returned for the caller to act on.
    pub fn handle_inbound(
        &self,
        from: DeviceId,
        bytes: &[u8],
    ) -> Result<Option<InboundMessage>, MessageError> {
        let (envelope, _) = decode_message(bytes)?;
        let request_seq = envelope.sequence_number;
        match envelope.message {
            PetMessage::Reply {
                request_seq,
                status,
            } => {
                self.complete(from, request_seq, status);
                Ok(None)
            }
            PetMessage::ViewCommand(command) => Ok(Some(InboundMessage {
                from,
                request_seq,
                payload: InboundPayload::ViewCommand(command),
            })),
            PetMessage::SharedCloudAnchors(anchors) => Ok(Some(InboundMessage {
                from,
                request_seq,
                payload: InboundPayload::SharedCloudAnchors(anchors),
            })),
            PetMessage::Hello { device_id, name } => {
                debug!("hello from {name} ({device_id}) after handshake; ignoring");
                Ok(None)
            }
        }
    }

    /// Fails every request still waiting on `device`.
    pub fn on_peer_lost(&self, device: DeviceId) {
        let mut pending = self.lock_pending();
        let affected: Vec<u64> = pending
            .iter()
            .filter(|(_, p)| p.awaiting.contains(&device))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in affected {
            if let Some(request) = pending.remove(&seq) {
                let _ = request.done.send(Err(MessageError::PeerLost(device)));
            }
        }
    }

    /// Cancels every pending request.
    pub fn cancel_all(&self) {
        let drained: Vec<PendingRequest> = self.lock_pending().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            debug!("cancelling {} pending request(s)", drained.len());
        }
        for request in drained {
            let _ = request.done.send(Err(MessageError::Cancelled));
        }
    }

    /// Number of requests still waiting for replies.
    pub fn pending_requests(&self) -> usize {
        self.lock_pending().len()
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    async fn start(&self, message: PetMessage) -> Result<PendingReply, MessageError> {
        let peers: HashSet<DeviceId> = self.transport.connected_devices().into_iter().collect();
        if peers.is_empty() {
            return Err(MessageError::NoPeers);
        }

        let seq = self.sequence.next();
        let bytes = encode_message_now(&message, seq)?;
        let (tx, rx) = oneshot::channel();

        // Registered before sending so a fast reply cannot miss its entry.
        self.lock_pending().insert(
            seq,
            PendingRequest {
                awaiting: peers,
                done: tx,
            },
        );

        match self.transport.send(bytes).await {
            Ok(reached) if reached.is_empty() => {
                self.lock_pending().remove(&seq);
                Err(MessageError::NoPeers)
            }
            Ok(reached) => {
                self.await_only(seq, &reached);
                Ok(PendingReply {
                    seq,
                    rx,
                    timeout: self.reply_timeout,
                    pending: Arc::clone(&self.pending),
                })
            }
            Err(e) => {
                self.lock_pending().remove(&seq);
                Err(MessageError::Send(e))
            }
        }
    }

    /// Stops waiting on peers the request never reached.  Replies from the
    /// reached peers may already be in, so the request can finish here.
    fn await_only(&self, seq: u64, reached: &[DeviceId]) {
        let mut pending = self.lock_pending();
        let Some(request) = pending.get_mut(&seq) else {
            return;
        };
        request.awaiting.retain(|device| {
            let kept = reached.contains(device);
            if !kept {
                debug!("request {seq} did not reach {device}");
            }
            kept
        });
        if request.awaiting.is_empty() {
            if let Some(request) = pending.remove(&seq) {
                let _ = request.done.send(Ok(()));
            }
        }
    }

    fn complete(&self, from: DeviceId, request_seq: u64, status: ReplyStatus) {
        let mut pending = self.lock_pending();
        let Some(request) = pending.get_mut(&request_seq) else {
            debug!("reply from {from} to unknown request {request_seq}");
            return;
        };
        if !request.awaiting.remove(&from) {
            debug!("unexpected reply from {from} to request {request_seq}");
            return;
        }

        let outcome = match status {
            ReplyStatus::Failed(reason) => Some(Err(MessageError::Rejected {
                device: from,
                reason,
            })),
            ReplyStatus::Ok if request.awaiting.is_empty() => Some(Ok(())),
            ReplyStatus::Ok => None,
        };
        if let Some(outcome) = outcome {
            if let Some(request) = pending.remove(&request_seq) {
                let _ = request.done.send(outcome);
            }
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        lock(&self.pending)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
