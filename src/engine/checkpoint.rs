//! Interactive checkpoints.
//!
//! A [`Checkpoint`] is a resumable question: the first poll freezes logical
//! time and sends the prompt, later polls look for the answer without ever
//! blocking the engine tick. `Pause` hands control back to the operator for
//! a grace interval of normal time and then asks again.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::run::{Fault, TickContext};
use crate::engine::time_flow::{TimeFlow, TimeFlowScope};
use crate::target::PromptRequest;

/// Operator decision at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointDecision {
    /// Re-attempt the failed step.
    Retry,
    /// Proceed as if the step had succeeded.
    Ignore,
    /// Terminate the run as an operator abort.
    Abort,
    /// Let logical time run normally for a while, then ask again.
    Pause,
}

impl fmt::Display for CheckpointDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Retry => "retry",
            Self::Ignore => "ignore",
            Self::Abort => "abort",
            Self::Pause => "pause",
        };
        f.write_str(name)
    }
}

impl FromStr for CheckpointDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" | "r" => Ok(Self::Retry),
            "ignore" | "i" => Ok(Self::Ignore),
            "abort" | "a" => Ok(Self::Abort),
            "pause" | "p" => Ok(Self::Pause),
            other => Err(format!("unknown decision '{other}'")),
        }
    }
}

/// Menu of decisions offered by a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceSet {
    /// Retry, ignore, abort, or pause.
    #[default]
    Full,
    /// Ignore, abort, or pause; nothing to retry.
    Proceed,
    /// Retry or abort only.
    RetryOrAbort,
}

impl ChoiceSet {
    /// Decisions in menu order.
    #[must_use]
    pub fn decisions(self) -> &'static [CheckpointDecision] {
        use CheckpointDecision::{Abort, Ignore, Pause, Retry};
        match self {
            Self::Full => &[Retry, Ignore, Abort, Pause],
            Self::Proceed => &[Ignore, Abort, Pause],
            Self::RetryOrAbort => &[Retry, Abort],
        }
    }

    /// Whether `decision` is on the menu.
    #[must_use]
    pub fn allows(self, decision: CheckpointDecision) -> bool {
        self.decisions().contains(&decision)
    }
}

enum Phase {
    Idle,
    Asking {
        prompt_id: String,
        answer: oneshot::Receiver<CheckpointDecision>,
        _frozen: TimeFlowScope,
    },
    Grace {
        remaining: Duration,
        _normal: TimeFlowScope,
    },
}

/// A question awaiting an operator decision.
pub struct Checkpoint {
    message: String,
    choices: ChoiceSet,
    phase: Phase,
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match &self.phase {
            Phase::Idle => "idle",
            Phase::Asking { .. } => "asking",
            Phase::Grace { .. } => "grace",
        };
        f.debug_struct("Checkpoint")
            .field("message", &self.message)
            .field("choices", &self.choices)
            .field("phase", &phase)
            .finish()
    }
}

impl Checkpoint {
    /// Create a checkpoint that has not asked yet.
    #[must_use]
    pub fn new(message: impl Into<String>, choices: ChoiceSet) -> Self {
        Self {
            message: message.into(),
            choices,
            phase: Phase::Idle,
        }
    }

    /// Question text.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Identifier of the prompt currently open, if any.
    #[must_use]
    pub fn open_prompt(&self) -> Option<&str> {
        match &self.phase {
            Phase::Asking { prompt_id, .. } => Some(prompt_id),
            _ => None,
        }
    }

    /// Advance the checkpoint by one tick.
    ///
    /// Returns `Ok(Some(Retry | Ignore))` once the operator resolved it and
    /// `Ok(None)` while it is still open or in a pause grace period.
    ///
    /// # Errors
    ///
    /// [`Fault::OperatorAbort`] on `Abort` or when the operator channel
    /// closes; [`Fault::Error`] if a decision outside the menu arrives.
    pub fn poll(
        &mut self,
        cx: &mut TickContext<'_>,
    ) -> Result<Option<CheckpointDecision>, Fault> {
        loop {
            match &mut self.phase {
                Phase::Idle => {
                    self.ask(cx);
                    return Ok(None);
                }
                Phase::Grace { remaining, .. } => {
                    *remaining = remaining.saturating_sub(cx.delta);
                    if !remaining.is_zero() {
                        return Ok(None);
                    }
                    // Grace is over; the normal scope drops here and the
                    // question is asked again.
                    self.phase = Phase::Idle;
                }
                Phase::Asking { answer, .. } => {
                    let received = answer.try_recv();
                    return match received {
                        Ok(decision) => self.resolve(decision, cx),
                        Err(TryRecvError::Empty) => Ok(None),
                        Err(TryRecvError::Closed) => {
                            self.phase = Phase::Idle;
                            Err(Fault::OperatorAbort(format!(
                                "operator went away while checkpoint was open: {}",
                                self.message
                            )))
                        }
                    };
                }
            }
        }
    }

    fn ask(&mut self, cx: &mut TickContext<'_>) {
        let frozen = cx.time_flow.push(TimeFlow::Frozen);
        let prompt_id = Uuid::new_v4().to_string();
        info!(
            run_id = cx.run_id,
            prompt_id = %prompt_id,
            message = %self.message,
            "checkpoint opened"
        );
        let answer = cx.operator.prompt(PromptRequest {
            run_id: cx.run_id.to_owned(),
            prompt_id: prompt_id.clone(),
            message: self.message.clone(),
            choices: self.choices.decisions().to_vec(),
        });
        self.phase = Phase::Asking {
            prompt_id,
            answer,
            _frozen: frozen,
        };
    }

    fn resolve(
        &mut self,
        decision: CheckpointDecision,
        cx: &mut TickContext<'_>,
    ) -> Result<Option<CheckpointDecision>, Fault> {
        // Leaving the asking phase drops the frozen scope.
        self.phase = Phase::Idle;
        info!(run_id = cx.run_id, %decision, "checkpoint answered");

        if !self.choices.allows(decision) {
            warn!(run_id = cx.run_id, %decision, "decision was not offered");
            return Err(Fault::Error(format!(
                "decision '{decision}' was not offered at checkpoint: {}",
                self.message
            )));
        }

        match decision {
            CheckpointDecision::Abort => Err(Fault::OperatorAbort(format!(
                "run aborted by operator at checkpoint: {}",
                self.message
            ))),
            CheckpointDecision::Pause => {
                let normal = cx.time_flow.push(TimeFlow::Normal);
                self.phase = Phase::Grace {
                    remaining: cx.pause_grace,
                    _normal: normal,
                };
                Ok(None)
            }
            CheckpointDecision::Retry | CheckpointDecision::Ignore => Ok(Some(decision)),
        }
    }
}
