//! Collaborator interfaces of the target application.
//!
//! The host never talks to rendering, UI, or input subsystems directly. It
//! only needs to send input events, ask whether a named UI element can be
//! clicked, and let the application's own update loop observe scaled
//! logical time. [`TargetApp`] captures exactly that surface;
//! [`SimulatedTarget`] is the in-process implementation the host binary
//! and the tests run against. [`Prompter`] is the operator side: show a
//! modal question and hand back the choice once it arrives.

pub mod simulated;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::engine::checkpoint::CheckpointDecision;

pub use simulated::SimulatedTarget;

/// One simulated input event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputEvent {
    /// Press and hold a key.
    KeyDown {
        /// Key name, e.g. `"space"`.
        key: String,
    },
    /// Release a held key.
    KeyUp {
        /// Key name.
        key: String,
    },
    /// Click a named UI element.
    Click {
        /// Element name.
        element: String,
    },
}

/// The narrow surface of the running application the engine drives.
pub trait TargetApp: Send + Sync {
    /// Deliver an input event.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the application rejects the
    /// event, e.g. a click on an element that is not clickable.
    fn send_input(&self, event: &InputEvent) -> std::result::Result<(), String>;

    /// Whether the named UI element exists and accepts clicks right now.
    fn is_clickable(&self, element: &str) -> bool;

    /// Host modules that code images may import or depend on.
    fn modules(&self) -> Vec<String>;

    /// Advance the application's own update loop by one logical tick.
    fn advance(&self, logical: Duration);
}

/// A modal question for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    /// Run that is waiting on the answer.
    pub run_id: String,
    /// Identifier the answer must echo.
    pub prompt_id: String,
    /// Question text.
    pub message: String,
    /// Decisions offered.
    pub choices: Vec<CheckpointDecision>,
}

/// Displays prompts and delivers the operator's choice.
pub trait Prompter: Send + Sync {
    /// Show `request` to the operator.
    ///
    /// The receiver resolves with the chosen decision. If the operator goes
    /// away the sender is dropped and the receiver reports closed.
    fn prompt(&self, request: PromptRequest) -> oneshot::Receiver<CheckpointDecision>;
}
