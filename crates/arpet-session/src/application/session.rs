//! Session state machine: host/guest pairing from invitation to shared view.
//!
//! [`SessionMachine`] is a plain synchronous state machine.  It never awaits
//! anything: every input (a user intent, a transport event, a timer expiry or
//! the result of an async job) goes through [`SessionMachine::handle`], which
//! updates the state and returns a list of [`SessionEffect`]s for the caller
//! to carry out.  The async side lives in
//! [`crate::application::coordinator`].
//!
//! # States (for beginners)
//!
//! ```text
//!                 Host                                   Guest
//!   Init ──► WaitingForGuests                 Init ──► FindingHost
//!                  │ visibility timeout / Continue          │ ConnectionEstablished
//!                  ▼ (≥1 guest)                             ▼
//!              Connected ──► Pairing                    Connected ──► Pairing
//!                  (hosting, sharing)                       (anchors received, resolving)
//!                               │                                       │
//!                               ▼                                       ▼
//!                             Shared                                  Shared
//!
//!   any connected state ── AllConnectionsLost / Cancel ──► Disconnected
//! ```
//!
//! # Epochs
//!
//! Every async job and timer is tagged with the epoch that was current when
//! it started.  Cancelling, retrying or tearing down bumps the epoch, so a
//! completion that arrives afterwards is recognised as stale and dropped.
//! This is what makes cancellation idempotent and race-free without having
//! to abort the job itself.

use std::time::Duration;

use arpet_core::domain::anchor::find_by_type;
use arpet_core::{
    CloudAnchor, ConnectionEventType, DeviceId, LocalAnchor, NotFoundTarget, ObjectType,
    PetConnectionEvent, Pose, ReplyStatus, ResolvedCloudAnchor, Role, Screen, SessionState,
    ViewCommand,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cloud_anchor::{
    CloudAnchorManager, HostRequest, HostingError, ResolutionError, ResolveRequest,
};
use super::message_service::{InboundMessage, InboundPayload, MessageError};
use super::transport::ConnectionError;
use super::view_dispatch::{dispatch, DispatchAction};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Default time the host stays visible to guests.
pub const DEFAULT_HOST_VISIBILITY: Duration = Duration::from_secs(300);
/// Host visibility in the `debug_timings` profile.
pub const DEBUG_HOST_VISIBILITY: Duration = Duration::from_secs(20);
/// Default time a guest searches for a host.
pub const DEFAULT_GUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default delay between paced instruction screens.
pub const DEFAULT_SCREEN_TRANSITION: Duration = Duration::from_secs(5);
/// Default number of failed pairing attempts before the session gives up.
pub const DEFAULT_MAX_PAIRING_ATTEMPTS: u32 = 3;

/// Timer durations used by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub host_visibility: Duration,
    pub guest_timeout: Duration,
    pub screen_transition: Duration,
}

impl SessionTimings {
    /// Short visibility window for manual testing.
    pub fn debug() -> Self {
        Self {
            host_visibility: DEBUG_HOST_VISIBILITY,
            ..Self::default()
        }
    }
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            host_visibility: DEFAULT_HOST_VISIBILITY,
            guest_timeout: DEFAULT_GUEST_TIMEOUT,
            screen_transition: DEFAULT_SCREEN_TRANSITION,
        }
    }
}

/// Everything the session needs to know up front.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub timings: SessionTimings,
    pub max_pairing_attempts: u32,
    /// Anchors the host uploads.  Always contains one [`ObjectType::Pet`]
    /// anchor, the world center.
    anchors: Vec<LocalAnchor>,
}

impl SessionSettings {
    /// Settings with default timings, hosting only the world-center anchor.
    pub fn new(world_center: Pose) -> Self {
        Self {
            timings: SessionTimings::default(),
            max_pairing_attempts: DEFAULT_MAX_PAIRING_ATTEMPTS,
            anchors: vec![LocalAnchor::new(ObjectType::Pet, world_center)],
        }
    }

    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_max_pairing_attempts(mut self, attempts: u32) -> Self {
        self.max_pairing_attempts = attempts.max(1);
        self
    }

    /// Adds another scene object to host alongside the world center.
    ///
    /// A second `Pet` anchor replaces the world center.
    pub fn with_anchor(mut self, anchor: LocalAnchor) -> Self {
        if anchor.object_type == ObjectType::Pet {
            self.anchors.retain(|a| a.object_type != ObjectType::Pet);
            self.anchors.insert(0, anchor);
        } else {
            self.anchors.push(anchor);
        }
        self
    }

    pub fn anchors(&self) -> &[LocalAnchor] {
        &self.anchors
    }

    /// Pose of the world-center anchor.
    pub fn world_center(&self) -> Pose {
        self.anchors
            .iter()
            .find(|a| a.object_type == ObjectType::Pet)
            .map(|a| a.pose)
            .unwrap_or_default()
    }
}

// ── Inputs ────────────────────────────────────────────────────────────────────

/// Buttons and navigation actions from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIntent {
    /// Invite guests.
    Host,
    /// Look for an inviting host.
    Guest,
    /// Leave the flow entirely.
    Cancel,
    /// Back navigation; same as `Cancel`.
    Back,
    /// Start inviting or searching again.
    TryAgain,
    /// Re-run pairing without reconnecting.
    RetryPairing,
    /// Host: close the invitation with the guests gathered so far.
    Continue,
    /// Stop inviting (host) or searching (guest).
    CancelConnection,
    /// Show the disconnect screen and stop sharing.
    DisconnectScreen,
    /// Show the shared mode view.
    ConnectedScreen,
}

/// Timers the machine asks the caller to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Host invitation window.
    HostVisibility,
    /// Guest search window.
    GuestTimeout,
    /// Show a screen after the screen-transition delay.
    ShowScreen(Screen),
}

/// Everything that can drive the machine.
#[derive(Debug)]
pub enum SessionInput {
    User(UserIntent),
    Connection(PetConnectionEvent),
    Inbound(InboundMessage),
    TimerFired {
        epoch: u64,
        timer: TimerKind,
    },
    /// `StartListening` / `FindHost` could not be started.
    InvitationFailed {
        epoch: u64,
        error: ConnectionError,
    },
    HostingFinished {
        epoch: u64,
        result: Result<Vec<CloudAnchor>, HostingError>,
    },
    ResolvingFinished {
        epoch: u64,
        from: DeviceId,
        request_seq: u64,
        result: Result<Vec<ResolvedCloudAnchor>, ResolutionError>,
    },
    AnchorsShared {
        epoch: u64,
        result: Result<(), MessageError>,
    },
    CommandDelivered {
        epoch: u64,
        command: ViewCommand,
        result: Result<(), MessageError>,
    },
}

impl SessionInput {
    fn epoch(&self) -> Option<u64> {
        match self {
            SessionInput::User(_) | SessionInput::Connection(_) | SessionInput::Inbound(_) => None,
            SessionInput::TimerFired { epoch, .. }
            | SessionInput::InvitationFailed { epoch, .. }
            | SessionInput::HostingFinished { epoch, .. }
            | SessionInput::ResolvingFinished { epoch, .. }
            | SessionInput::AnchorsShared { epoch, .. }
            | SessionInput::CommandDelivered { epoch, .. } => Some(*epoch),
        }
    }
}

// ── Outputs ───────────────────────────────────────────────────────────────────

/// What the session tells the UI and rendering engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionOutput {
    Screen(Screen),
    /// Leave the sharing flow and return to the main hub.
    BackToHub,
    /// Start rendering the shared scene around `world_center`.
    SharingStarted { role: Role, world_center: Pose },
    /// Stop rendering the shared scene.  Emitted at most once per session.
    SharingStopped,
}

/// Work the caller must carry out on the machine's behalf.
#[derive(Debug)]
pub enum SessionEffect {
    StartListening { epoch: u64 },
    StopListening,
    /// Discover inviting hosts and connect to them.
    FindHost { epoch: u64 },
    Disconnect,
    Host { epoch: u64, request: HostRequest },
    Resolve {
        epoch: u64,
        from: DeviceId,
        request_seq: u64,
        request: ResolveRequest,
    },
    ShareAnchors { epoch: u64, anchors: Vec<CloudAnchor> },
    SendCommand { epoch: u64, command: ViewCommand },
    Reply {
        to: DeviceId,
        request_seq: u64,
        status: ReplyStatus,
    },
    StartTimer {
        epoch: u64,
        timer: TimerKind,
        after: Duration,
    },
    /// Fail every outstanding request with `Cancelled`.
    CancelPendingMessages,
    Output(SessionOutput),
}

// ── Connectivity errors ───────────────────────────────────────────────────────

/// Why the session could not reach the network or a peer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("no internet connection")]
    NoInternet,
    #[error("no inviting host found")]
    NoDevicesFound,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("link unavailable: {0}")]
    LinkUnavailable(String),
    #[error("{0} transport is not supported")]
    Unsupported(&'static str),
}

impl ConnectivityError {
    /// Screen explaining the problem to the user.
    pub fn screen(&self) -> Screen {
        match self {
            ConnectivityError::NoInternet => Screen::NoInternet,
            ConnectivityError::NoDevicesFound => Screen::NotFound(NotFoundTarget::Host),
            ConnectivityError::PermissionDenied(_) => Screen::BluetoothDisabled,
            ConnectivityError::LinkUnavailable(_) | ConnectivityError::Unsupported(_) => {
                Screen::ConnectionUnavailable
            }
        }
    }

    /// Whether the invitation cannot continue and the session returns to `Init`.
    pub fn aborts_invitation(&self) -> bool {
        !matches!(self, ConnectivityError::NoDevicesFound)
    }
}

impl From<ConnectionError> for ConnectivityError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::NoDevicesFound => ConnectivityError::NoDevicesFound,
            ConnectionError::PermissionDenied(reason) => ConnectivityError::PermissionDenied(reason),
            ConnectionError::LinkUnavailable(reason) => ConnectivityError::LinkUnavailable(reason),
            ConnectionError::Unsupported { transport } => ConnectivityError::Unsupported(transport),
            ConnectionError::UnknownDevice(device) => {
                ConnectivityError::LinkUnavailable(format!("unknown device {device}"))
            }
        }
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

/// The pairing state machine for one session.
pub struct SessionMachine {
    settings: SessionSettings,
    cloud: CloudAnchorManager,
    role: Role,
    state: SessionState,
    screen: Screen,
    epoch: u64,
    guests: usize,
    visibility_armed: bool,
    host_ready: bool,
    pairing_failed: bool,
    pairing_failures: u32,
    sharing_active: bool,
    sharing_stopped: bool,
}

impl SessionMachine {
    pub fn new(settings: SessionSettings, cloud: CloudAnchorManager) -> Self {
        Self {
            settings,
            cloud,
            role: Role::None,
            state: SessionState::Init,
            screen: Screen::Main,
            epoch: 0,
            guests: 0,
            visibility_armed: false,
            host_ready: false,
            pairing_failed: false,
            pairing_failures: 0,
            sharing_active: false,
            sharing_stopped: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The screen most recently asked for.
    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Guests connected to this host.
    pub fn guests(&self) -> usize {
        self.guests
    }

    pub fn is_sharing(&self) -> bool {
        self.sharing_active
    }

    pub fn cloud(&self) -> &CloudAnchorManager {
        &self.cloud
    }

    /// Applies one input and returns the effects to carry out, in order.
    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionEffect> {
        let mut fx = Vec::new();
        if self.state.is_terminal() {
            debug!("session is over; dropping {input:?}");
            return fx;
        }
        if let Some(epoch) = input.epoch() {
            if epoch != self.epoch {
                debug!("dropping stale input from epoch {epoch} (current {})", self.epoch);
                return fx;
            }
        }

        match input {
            SessionInput::User(intent) => self.on_intent(intent, &mut fx),
            SessionInput::Connection(event) => self.on_connection(event, &mut fx),
            SessionInput::Inbound(message) => self.on_inbound(message, &mut fx),
            SessionInput::TimerFired { timer, .. } => self.on_timer(timer, &mut fx),
            SessionInput::InvitationFailed { error, .. } => {
                self.on_connectivity_error(ConnectivityError::from(error), &mut fx)
            }
            SessionInput::HostingFinished { result, .. } => self.on_hosting_finished(result, &mut fx),
            SessionInput::ResolvingFinished {
                from,
                request_seq,
                result,
                ..
            } => self.on_resolving_finished(from, request_seq, result, &mut fx),
            SessionInput::AnchorsShared { result, .. } => self.on_anchors_shared(result, &mut fx),
            SessionInput::CommandDelivered {
                command, result, ..
            } => self.on_command_delivered(command, result, &mut fx),
        }
        fx
    }

    // ── User intents ─────────────────────────────────────────────────────────

    fn on_intent(&mut self, intent: UserIntent, fx: &mut Vec<SessionEffect>) {
        debug!("intent {intent:?} in {:?} as {}", self.state, self.role);
        match intent {
            UserIntent::Host => self.choose_role(Role::Host, fx),
            UserIntent::Guest => self.choose_role(Role::Guest, fx),
            UserIntent::Cancel | UserIntent::Back => self.teardown("user left the session", fx),
            UserIntent::TryAgain => self.try_again(fx),
            UserIntent::RetryPairing => self.retry_pairing(fx),
            UserIntent::Continue => self.close_invitation(fx),
            UserIntent::CancelConnection => self.cancel_connection(fx),
            UserIntent::DisconnectScreen => {
                let screen = match self.role {
                    Role::Guest => Screen::DisconnectGuest,
                    _ => Screen::DisconnectHost,
                };
                self.show(screen, fx);
                self.stop_sharing(fx);
            }
            UserIntent::ConnectedScreen => self.show(Screen::ModeView, fx),
        }
    }

    fn choose_role(&mut self, role: Role, fx: &mut Vec<SessionEffect>) {
        if self.role != Role::None && self.role != role {
            warn!("ignoring {role} request: this session is already {}", self.role);
            return;
        }
        if self.state != SessionState::Init {
            debug!("ignoring {role} request in {:?}", self.state);
            return;
        }
        self.start_invitation(role, fx);
    }

    fn start_invitation(&mut self, role: Role, fx: &mut Vec<SessionEffect>) {
        if !self.cloud.has_internet_connection() {
            self.on_connectivity_error(ConnectivityError::NoInternet, fx);
            return;
        }

        self.role = role;
        self.epoch += 1;
        self.guests = 0;
        self.visibility_armed = false;
        self.host_ready = false;
        self.pairing_failed = false;

        match role {
            Role::Host => {
                info!("inviting guests");
                self.state = SessionState::WaitingForGuests;
                fx.push(SessionEffect::StartListening { epoch: self.epoch });
            }
            Role::Guest => {
                info!("looking for a host");
                self.state = SessionState::FindingHost;
                self.show(Screen::FindingHost, fx);
                fx.push(SessionEffect::FindHost { epoch: self.epoch });
                fx.push(self.timer(TimerKind::GuestTimeout, self.settings.timings.guest_timeout));
            }
            Role::None => {}
        }
    }

    fn try_again(&mut self, fx: &mut Vec<SessionEffect>) {
        if self.role == Role::None {
            debug!("try again before a role was chosen");
            return;
        }
        match self.state {
            SessionState::Init | SessionState::WaitingForGuests | SessionState::FindingHost => {}
            SessionState::Connected | SessionState::Pairing if self.pairing_failed => {
                if self.attempts_exhausted() {
                    self.teardown("pairing attempts exhausted", fx);
                    return;
                }
            }
            state => {
                debug!("try again ignored in {state:?}");
                return;
            }
        }

        self.reset_links(fx);
        self.state = SessionState::Init;
        self.start_invitation(self.role, fx);
    }

    fn retry_pairing(&mut self, fx: &mut Vec<SessionEffect>) {
        if self.state != SessionState::Pairing || !self.pairing_failed {
            debug!("retry pairing ignored in {:?}", self.state);
            return;
        }
        if self.attempts_exhausted() {
            self.teardown("pairing attempts exhausted", fx);
            return;
        }
        if !self.cloud.has_internet_connection() {
            self.show(Screen::NoInternet, fx);
            return;
        }

        info!("retrying pairing (failures so far: {})", self.pairing_failures);
        self.epoch += 1;
        self.pairing_failed = false;
        // Results of the abandoned attempt are stale from here on.
        self.cloud.clear_anchors();
        match self.role {
            Role::Host => {
                self.show(Screen::CenterPet, fx);
                self.begin_hosting(fx);
            }
            Role::Guest => self.show(Screen::Waiting, fx),
            Role::None => {}
        }
    }

    fn cancel_connection(&mut self, fx: &mut Vec<SessionEffect>) {
        match (self.role, self.state) {
            (Role::None, _) | (_, SessionState::Init) => {
                debug!("nothing to cancel");
            }
            (Role::Guest, SessionState::FindingHost) => {
                info!("stopped looking for a host");
                self.reset_links(fx);
                self.state = SessionState::Init;
                self.role = Role::None;
                self.show(Screen::Main, fx);
            }
            _ => self.teardown("connection cancelled", fx),
        }
    }

    // ── Connection events ────────────────────────────────────────────────────

    fn on_connection(&mut self, event: PetConnectionEvent, fx: &mut Vec<SessionEffect>) {
        let hosting = self.role == Role::Host && self.state == SessionState::WaitingForGuests;
        let finding = self.role == Role::Guest && self.state == SessionState::FindingHost;

        match event.event_type {
            ConnectionEventType::OnListeningToGuests if hosting => {
                self.show(Screen::WaitingForGuests { guests: self.guests }, fx);
                if !self.visibility_armed {
                    self.visibility_armed = true;
                    fx.push(self.timer(
                        TimerKind::HostVisibility,
                        self.settings.timings.host_visibility,
                    ));
                }
            }
            ConnectionEventType::GuestConnectionEstablished if hosting => {
                self.guests += 1;
                match &event.device {
                    Some(device) => info!("guest {device} joined ({} total)", self.guests),
                    None => info!("guest joined ({} total)", self.guests),
                }
                self.show(Screen::WaitingForGuests { guests: self.guests }, fx);
            }
            ConnectionEventType::ConnectionEstablished if finding => {
                info!("connected to host");
                self.state = SessionState::Connected;
                self.show(Screen::InviteAcceptedGuest, fx);
                fx.push(self.timer(
                    TimerKind::ShowScreen(Screen::Waiting),
                    self.settings.timings.screen_transition,
                ));
            }
            ConnectionEventType::NoConnectionFound if finding => self.end_search(fx),
            ConnectionEventType::NoConnectionFound if hosting => {
                self.show(Screen::NotFound(NotFoundTarget::Guest), fx);
            }
            ConnectionEventType::OneConnectionLost => {
                if self.role == Role::Host {
                    self.guests = self.guests.saturating_sub(1);
                    if hosting {
                        self.show(Screen::WaitingForGuests { guests: self.guests }, fx);
                    }
                }
            }
            ConnectionEventType::AllConnectionsLost => {
                if self.state.is_connected() {
                    self.teardown("all connections lost", fx);
                } else if hosting {
                    self.guests = 0;
                    self.show(Screen::WaitingForGuests { guests: 0 }, fx);
                }
            }
            ConnectionEventType::EnableBluetoothDenied => {
                self.abort_invitation(Screen::BluetoothDisabled, fx)
            }
            ConnectionEventType::HostVisibilityDenied => {
                self.abort_invitation(Screen::DeviceNotVisible, fx)
            }
            other => debug!("ignoring {other:?} in {:?}", self.state),
        }
    }

    fn on_connectivity_error(&mut self, error: ConnectivityError, fx: &mut Vec<SessionEffect>) {
        warn!("connectivity problem: {error}");
        let finding = self.role == Role::Guest && self.state == SessionState::FindingHost;
        if error.aborts_invitation() && self.state != SessionState::Init {
            self.abort_invitation(error.screen(), fx);
        } else if finding && matches!(error, ConnectivityError::NoDevicesFound) {
            self.end_search(fx);
        } else {
            self.show(error.screen(), fx);
        }
    }

    // ── Host flow ────────────────────────────────────────────────────────────

    fn close_invitation(&mut self, fx: &mut Vec<SessionEffect>) {
        if self.role != Role::Host || self.state != SessionState::WaitingForGuests {
            debug!("no open invitation to close");
            return;
        }
        fx.push(SessionEffect::StopListening);
        self.visibility_armed = false;

        if self.guests == 0 {
            info!("invitation closed without guests");
            self.show(Screen::NotFound(NotFoundTarget::Guest), fx);
            return;
        }

        info!("invitation closed with {} guest(s)", self.guests);
        self.state = SessionState::Connected;
        self.show(Screen::InviteAcceptedHost { guests: self.guests }, fx);
        fx.push(self.timer(
            TimerKind::ShowScreen(Screen::CenterPet),
            self.settings.timings.screen_transition,
        ));
        self.begin_hosting(fx);
    }

    fn begin_hosting(&mut self, fx: &mut Vec<SessionEffect>) {
        self.state = SessionState::Pairing;
        self.host_ready = false;
        self.cloud.clear_anchors();
        match self.cloud.begin_hosting(self.settings.anchors.clone()) {
            Ok(request) => fx.push(SessionEffect::Host {
                epoch: self.epoch,
                request,
            }),
            Err(e) => self.pairing_failure(&e, fx),
        }
    }

    fn on_hosting_finished(
        &mut self,
        result: Result<Vec<CloudAnchor>, HostingError>,
        fx: &mut Vec<SessionEffect>,
    ) {
        match self.cloud.finish_hosting(result) {
            Ok(anchors) => {
                info!("host ready with {} anchor(s)", anchors.len());
                self.host_ready = true;
                fx.push(self.command(ViewCommand::SharedHost));
                fx.push(self.command(ViewCommand::LookingSideBySide));
                self.show(Screen::StayInPosition, fx);
                fx.push(SessionEffect::ShareAnchors {
                    epoch: self.epoch,
                    anchors,
                });
            }
            Err(HostingError::Cancelled) => debug!("hosting result arrived after cancel"),
            Err(e) => self.pairing_failure(&e, fx),
        }
    }

    fn on_anchors_shared(&mut self, result: Result<(), MessageError>, fx: &mut Vec<SessionEffect>) {
        match result {
            Ok(()) => {
                info!("every guest resolved the shared anchors");
                fx.push(self.command(ViewCommand::ShowModeShareAnchorView));
                self.start_sharing(Role::Host, self.settings.world_center(), fx);
            }
            Err(e) => self.pairing_failure(&e, fx),
        }
    }

    fn on_command_delivered(
        &mut self,
        command: ViewCommand,
        result: Result<(), MessageError>,
        fx: &mut Vec<SessionEffect>,
    ) {
        match result {
            Ok(()) if command == ViewCommand::ShowModeShareAnchorView => {
                fx.push(self.timer(
                    TimerKind::ShowScreen(Screen::ModeView),
                    self.settings.timings.screen_transition,
                ));
            }
            Ok(()) => debug!("guests accepted {command}"),
            Err(e) => warn!("guests did not accept {command}: {e}"),
        }
    }

    // ── Guest flow ───────────────────────────────────────────────────────────

    fn on_inbound(&mut self, message: InboundMessage, fx: &mut Vec<SessionEffect>) {
        let InboundMessage {
            from,
            request_seq,
            payload,
        } = message;
        match payload {
            InboundPayload::ViewCommand(command) => {
                self.on_view_command(command, fx);
                fx.push(SessionEffect::Reply {
                    to: from,
                    request_seq,
                    status: ReplyStatus::Ok,
                });
            }
            InboundPayload::SharedCloudAnchors(anchors) => {
                self.on_shared_anchors(from, request_seq, anchors, fx)
            }
        }
    }

    fn on_view_command(&mut self, command: ViewCommand, fx: &mut Vec<SessionEffect>) {
        if self.role != Role::Guest {
            debug!("host ignores view command {command}");
            return;
        }
        match command {
            ViewCommand::SharedHost | ViewCommand::LookingSideBySide
                if self.state == SessionState::Connected =>
            {
                self.state = SessionState::Pairing;
            }
            ViewCommand::PairingErrorView => {
                self.pairing_failed = true;
            }
            _ => {}
        }
        match dispatch(command) {
            DispatchAction::Show(screen) => self.show(screen, fx),
            DispatchAction::ShowAfterDelay(screen) => fx.push(self.timer(
                TimerKind::ShowScreen(screen),
                self.settings.timings.screen_transition,
            )),
            DispatchAction::Ignore => {}
        }
    }

    fn on_shared_anchors(
        &mut self,
        from: DeviceId,
        request_seq: u64,
        anchors: Vec<CloudAnchor>,
        fx: &mut Vec<SessionEffect>,
    ) {
        let waiting = matches!(self.state, SessionState::Connected | SessionState::Pairing);
        if self.role != Role::Guest || !waiting {
            warn!("unexpected anchors from {from} in {:?}", self.state);
            fx.push(SessionEffect::Reply {
                to: from,
                request_seq,
                status: ReplyStatus::Failed("not waiting for anchors".to_string()),
            });
            return;
        }

        info!("received {} anchor(s) from {from}", anchors.len());
        self.state = SessionState::Pairing;
        self.pairing_failed = false;
        match self.cloud.begin_resolving(anchors) {
            Ok(request) => fx.push(SessionEffect::Resolve {
                epoch: self.epoch,
                from,
                request_seq,
                request,
            }),
            Err(e) => self.resolution_failure(from, request_seq, e, fx),
        }
    }

    fn on_resolving_finished(
        &mut self,
        from: DeviceId,
        request_seq: u64,
        result: Result<Vec<ResolvedCloudAnchor>, ResolutionError>,
        fx: &mut Vec<SessionEffect>,
    ) {
        let resolved = match self.cloud.finish_resolving(result) {
            Ok(resolved) => resolved,
            Err(ResolutionError::Cancelled) => {
                debug!("resolution result arrived after cancel");
                return;
            }
            Err(e) => return self.resolution_failure(from, request_seq, e, fx),
        };

        let Some(pet) = find_by_type(&resolved, ObjectType::Pet) else {
            return self.resolution_failure(from, request_seq, ResolutionError::MissingWorldCenter, fx);
        };
        let world_center = pet.resolved_pose;
        info!("resolved {} anchor(s)", resolved.len());
        fx.push(SessionEffect::Reply {
            to: from,
            request_seq,
            status: ReplyStatus::Ok,
        });
        self.start_sharing(Role::Guest, world_center, fx);
    }

    fn resolution_failure(
        &mut self,
        from: DeviceId,
        request_seq: u64,
        error: ResolutionError,
        fx: &mut Vec<SessionEffect>,
    ) {
        fx.push(SessionEffect::Reply {
            to: from,
            request_seq,
            status: ReplyStatus::Failed(error.to_string()),
        });
        self.pairing_failure(&error, fx);
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    fn on_timer(&mut self, timer: TimerKind, fx: &mut Vec<SessionEffect>) {
        match timer {
            TimerKind::HostVisibility => {
                if self.visibility_armed {
                    info!("visibility window elapsed");
                    self.close_invitation(fx);
                }
            }
            TimerKind::GuestTimeout => {
                if self.role == Role::Guest && self.state == SessionState::FindingHost {
                    info!("no host found in time");
                    fx.push(SessionEffect::Disconnect);
                    self.end_search(fx);
                }
            }
            TimerKind::ShowScreen(screen) => self.show_paced(screen, fx),
        }
    }

    /// Ends the current search attempt.  The guest timer and any search
    /// result still in flight become stale; `TryAgain` starts a new one.
    fn end_search(&mut self, fx: &mut Vec<SessionEffect>) {
        self.epoch += 1;
        self.show(Screen::NotFound(NotFoundTarget::Host), fx);
    }

    fn show_paced(&mut self, screen: Screen, fx: &mut Vec<SessionEffect>) {
        let pairing = matches!(self.state, SessionState::Connected | SessionState::Pairing);
        let allowed = match screen {
            Screen::CenterPet | Screen::MoveAround => {
                self.role == Role::Host && pairing && !self.host_ready && !self.pairing_failed
            }
            Screen::Waiting => self.role == Role::Guest && self.state == SessionState::Connected,
            Screen::LookingSideBySide => self.role == Role::Guest && pairing && !self.pairing_failed,
            _ => true,
        };
        if !allowed {
            debug!("skipping paced {screen:?} in {:?}", self.state);
            return;
        }
        self.show(screen, fx);
        if screen == Screen::CenterPet {
            fx.push(self.timer(
                TimerKind::ShowScreen(Screen::MoveAround),
                self.settings.timings.screen_transition,
            ));
        }
    }

    // ── Shared helpers ───────────────────────────────────────────────────────

    fn show(&mut self, screen: Screen, fx: &mut Vec<SessionEffect>) {
        self.screen = screen;
        fx.push(SessionEffect::Output(SessionOutput::Screen(screen)));
    }

    fn timer(&self, timer: TimerKind, after: Duration) -> SessionEffect {
        SessionEffect::StartTimer {
            epoch: self.epoch,
            timer,
            after,
        }
    }

    fn command(&self, command: ViewCommand) -> SessionEffect {
        SessionEffect::SendCommand {
            epoch: self.epoch,
            command,
        }
    }

    fn attempts_exhausted(&self) -> bool {
        self.pairing_failures >= self.settings.max_pairing_attempts
    }

    fn pairing_failure(&mut self, error: &dyn std::fmt::Display, fx: &mut Vec<SessionEffect>) {
        self.pairing_failures += 1;
        self.pairing_failed = true;
        warn!(
            "pairing failed ({}/{}): {error}",
            self.pairing_failures, self.settings.max_pairing_attempts
        );
        if self.role == Role::Host && self.guests > 0 {
            fx.push(self.command(ViewCommand::PairingErrorView));
        }
        self.show(Screen::PairingError, fx);
    }

    fn start_sharing(&mut self, role: Role, world_center: Pose, fx: &mut Vec<SessionEffect>) {
        self.state = SessionState::Shared;
        self.sharing_active = true;
        fx.push(SessionEffect::Output(SessionOutput::SharingStarted { role, world_center }));
        fx.push(SessionEffect::Output(SessionOutput::BackToHub));
    }

    fn stop_sharing(&mut self, fx: &mut Vec<SessionEffect>) {
        if self.sharing_stopped || !(self.sharing_active || self.state.is_connected()) {
            return;
        }
        self.sharing_stopped = true;
        self.sharing_active = false;
        fx.push(SessionEffect::Output(SessionOutput::SharingStopped));
    }

    /// Drops links, pending requests and hosted anchors; invalidates in-flight jobs.
    fn reset_links(&mut self, fx: &mut Vec<SessionEffect>) {
        self.epoch += 1;
        fx.push(SessionEffect::CancelPendingMessages);
        fx.push(SessionEffect::Disconnect);
        self.cloud.clear_anchors();
        self.visibility_armed = false;
        self.guests = 0;
    }

    fn abort_invitation(&mut self, screen: Screen, fx: &mut Vec<SessionEffect>) {
        if self.state.is_connected() {
            self.stop_sharing(fx);
        }
        self.reset_links(fx);
        self.state = SessionState::Init;
        self.show(screen, fx);
    }

    fn teardown(&mut self, reason: &str, fx: &mut Vec<SessionEffect>) {
        if self.state.is_terminal() {
            return;
        }
        info!("session ending: {reason}");
        self.stop_sharing(fx);
        self.reset_links(fx);
        self.state = SessionState::Disconnected;
        fx.push(SessionEffect::Output(SessionOutput::BackToHub));
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
