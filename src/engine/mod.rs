//! Supervised execution engine.
//!
//! The [`Engine`] owns every live [`Run`] and advances them all once per
//! [`tick`](Engine::tick). A tick never blocks: tasks suspend by returning
//! [`Progress::Pending`] and resume on a later tick. Logical time for the
//! tick comes from the engine-wide [`TimeFlowStack`], so a frozen
//! checkpoint in one run also freezes the target's own update loop.

pub mod checkpoint;
pub mod driver;
pub mod run;
pub mod script;
pub mod time_flow;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::target::TargetApp;
use crate::{AppError, Result};

pub use checkpoint::{Checkpoint, CheckpointDecision, ChoiceSet};
pub use run::{
    Fault, HeldInputs, OperatorChannel, Progress, PumpEnv, Run, RunPhase, RunReport, RunStatus,
    Task, TickContext,
};
pub use time_flow::{TimeFlow, TimeFlowScope, TimeFlowStack, MAX_TIME_SCALE};

/// Identifies a started run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    /// Run identifier.
    pub run_id: String,
    /// `Type.method` of the entry point.
    pub entry: String,
}

#[derive(Debug, Default)]
struct EngineState {
    tick: u64,
    runs: Vec<Run>,
}

/// Cooperative scheduler for runs.
pub struct Engine {
    state: Mutex<EngineState>,
    time_flow: TimeFlowStack,
    target: Arc<dyn TargetApp>,
    pause_grace: Duration,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("time_flow", &self.time_flow)
            .field("pause_grace", &self.pause_grace)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine driving `target`.
    #[must_use]
    pub fn new(target: Arc<dyn TargetApp>, pause_grace: Duration) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            time_flow: TimeFlowStack::new(),
            target,
            pause_grace,
        }
    }

    /// Engine-wide time-flow stack.
    #[must_use]
    pub fn time_flow(&self) -> &TimeFlowStack {
        &self.time_flow
    }

    /// Target application driven by this engine.
    #[must_use]
    pub fn target(&self) -> &Arc<dyn TargetApp> {
        &self.target
    }

    /// Start `task` under `flow`.
    ///
    /// The time-flow scope is applied immediately; the task itself first
    /// runs on the next tick.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` for a degenerate time-flow policy.
    pub fn start(
        &self,
        entry: impl Into<String>,
        task: Box<dyn Task>,
        flow: TimeFlow,
        operator: Arc<dyn OperatorChannel>,
        owner: Option<Uuid>,
    ) -> Result<RunHandle> {
        flow.validate().map_err(AppError::Protocol)?;

        let notify = Arc::clone(&operator);
        let mut run = Run::new(entry, task, flow, operator, owner);
        let handle = RunHandle {
            run_id: run.id().to_owned(),
            entry: run.entry().to_owned(),
        };

        // Held across the notification so no tick can pump the run before
        // its operator has heard about it.
        let mut state = self.state.lock();
        run.apply_time_flow(&self.time_flow);
        notify.started(&handle);
        info!(run_id = %handle.run_id, entry = %handle.entry, ?flow, "run started");
        state.runs.push(run);
        Ok(handle)
    }

    /// Ask one run to stop at the next tick boundary.
    ///
    /// Only runs owned by `owner` are eligible when `owner` is given.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no matching run is live.
    pub fn stop_run(&self, run_id: &str, owner: Option<Uuid>) -> Result<()> {
        let mut state = self.state.lock();
        let run = state
            .runs
            .iter_mut()
            .find(|run| run.id() == run_id && (owner.is_none() || run.owner() == owner))
            .ok_or_else(|| AppError::NotFound(format!("no live run {run_id}")))?;
        run.request_stop();
        debug!(run_id, "stop requested");
        Ok(())
    }

    /// Ask every run started by `owner` to stop. Returns how many were asked.
    pub fn stop_owned_by(&self, owner: Uuid) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        for run in state.runs.iter_mut().filter(|run| run.owner() == Some(owner)) {
            run.request_stop();
            count += 1;
        }
        count
    }

    /// Ask every run to stop.
    pub fn stop_all(&self) {
        for run in &mut self.state.lock().runs {
            run.request_stop();
        }
    }

    /// Identifiers of live runs.
    #[must_use]
    pub fn active_runs(&self) -> Vec<String> {
        self.state
            .lock()
            .runs
            .iter()
            .map(|run| run.id().to_owned())
            .collect()
    }

    /// Advance the target and every live run by one tick that took `wall`.
    ///
    /// Returns the reports of runs that ended during this tick.
    pub fn tick(&self, wall: Duration) -> Vec<RunReport> {
        let delta = self.time_flow.logical_delta(wall);
        self.target.advance(delta);

        let mut state = self.state.lock();
        state.tick += 1;
        let env = PumpEnv {
            tick: state.tick,
            delta,
            target: self.target.as_ref(),
            time_flow: &self.time_flow,
            pause_grace: self.pause_grace,
        };

        let reports: Vec<RunReport> = state
            .runs
            .iter_mut()
            .filter_map(|run| run.pump(env))
            .collect();
        state.runs.retain(|run| !run.is_torn_down());
        reports
    }
}
