//! Maps view commands received from the host onto guest screens.
//!
//! Kept free of I/O and timers: the session state machine turns the returned
//! [`DispatchAction`] into effects.

use arpet_core::{Screen, ViewCommand};
use tracing::warn;

/// What the guest UI should do in response to a view command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    /// Show the screen now.
    Show(Screen),
    /// Show the screen after the screen-transition delay.
    ShowAfterDelay(Screen),
    /// Nothing to show; the command is not understood.
    Ignore,
}

/// Decides which screen a view command maps to.
pub fn dispatch(command: ViewCommand) -> DispatchAction {
    match command {
        ViewCommand::SharedHost => DispatchAction::Show(Screen::SharedHost),
        ViewCommand::LookingSideBySide => DispatchAction::ShowAfterDelay(Screen::LookingSideBySide),
        ViewCommand::ShowModeShareAnchorView => DispatchAction::ShowAfterDelay(Screen::ModeView),
        ViewCommand::PairingErrorView => DispatchAction::Show(Screen::PairingError),
        ViewCommand::Other(code) => {
            warn!("ignoring unknown view command 0x{code:02X}");
            DispatchAction::Ignore
        }
    }
}
