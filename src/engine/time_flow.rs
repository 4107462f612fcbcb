//! Time-flow policies and their scoped activation.
//!
//! The active policy is the top of a [`TimeFlowStack`]. Activating a policy
//! returns a [`TimeFlowScope`]; dropping or releasing the scope removes
//! exactly that entry, so nested activations unwind to whatever was active
//! before them even when scopes end out of order or on an error path.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Largest accepted `Accelerated` scale.
pub const MAX_TIME_SCALE: f32 = 1000.0;

/// How logical time relates to wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFlow {
    /// Logical time equals wall time.
    #[default]
    Normal,
    /// Wall time multiplied by `scale` (> 1).
    Accelerated {
        /// Multiplier applied to each tick's elapsed wall time.
        scale: f32,
    },
    /// Every tick advances a fixed step regardless of wall time.
    FrameSkipping {
        /// Logical milliseconds per tick.
        step_ms: u32,
    },
    /// Logical time stands still.
    Frozen,
}

impl TimeFlow {
    /// Logical time that passes during a tick that took `wall`.
    ///
    /// Saturates at [`Duration::MAX`] instead of overflowing.
    #[must_use]
    pub fn logical_delta(self, wall: Duration) -> Duration {
        match self {
            Self::Normal => wall,
            Self::Accelerated { scale } => {
                Duration::try_from_secs_f64(wall.as_secs_f64() * f64::from(scale))
                    .unwrap_or(Duration::MAX)
            }
            Self::FrameSkipping { step_ms } => Duration::from_millis(u64::from(step_ms)),
            Self::Frozen => Duration::ZERO,
        }
    }

    /// Reject policies that would make logical time meaningless.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem.
    pub fn validate(self) -> std::result::Result<(), String> {
        match self {
            Self::Accelerated { scale } if !scale.is_finite() || scale <= 1.0 => Err(format!(
                "accelerated time flow needs a finite scale above 1, got {scale}"
            )),
            Self::Accelerated { scale } if scale > MAX_TIME_SCALE => Err(format!(
                "accelerated time flow scale {scale} exceeds {MAX_TIME_SCALE}"
            )),
            Self::FrameSkipping { step_ms: 0 } => {
                Err("frame-skipping time flow needs a step above 0 ms".into())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct StackInner {
    next_id: u64,
    entries: Vec<(u64, TimeFlow)>,
}

/// Stack of active time-flow policies; the bottom is implicitly `Normal`.
#[derive(Debug, Clone, Default)]
pub struct TimeFlowStack {
    inner: Arc<Mutex<StackInner>>,
}

impl TimeFlowStack {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy currently in force.
    #[must_use]
    pub fn current(&self) -> TimeFlow {
        self.inner
            .lock()
            .entries
            .last()
            .map_or(TimeFlow::Normal, |(_, flow)| *flow)
    }

    /// Logical time for a tick that took `wall` under the current policy.
    #[must_use]
    pub fn logical_delta(&self, wall: Duration) -> Duration {
        self.current().logical_delta(wall)
    }

    /// Number of active scopes.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Activate `flow` until the returned scope is released.
    #[must_use = "dropping the scope immediately deactivates the policy"]
    pub fn push(&self, flow: TimeFlow) -> TimeFlowScope {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push((id, flow));
        TimeFlowScope {
            stack: Arc::clone(&self.inner),
            id,
            flow,
            active: true,
        }
    }
}

/// Activation of one policy on a [`TimeFlowStack`].
#[derive(Debug)]
pub struct TimeFlowScope {
    stack: Arc<Mutex<StackInner>>,
    id: u64,
    flow: TimeFlow,
    active: bool,
}

impl TimeFlowScope {
    /// Policy this scope activated.
    #[must_use]
    pub fn flow(&self) -> TimeFlow {
        self.flow
    }

    /// Deactivate the policy now.
    pub fn release(mut self) {
        self.deactivate();
    }

    fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let mut inner = self.stack.lock();
        if let Some(pos) = inner.entries.iter().rposition(|(id, _)| *id == self.id) {
            inner.entries.remove(pos);
        }
    }
}

impl Drop for TimeFlowScope {
    fn drop(&mut self) {
        self.deactivate();
    }
}
