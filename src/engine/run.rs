//! One supervised execution of an entry point.
//!
//! A [`Run`] owns its [`Task`], the time-flow scope it was started under,
//! and the input state the task is still holding. Each engine tick pumps it
//! once. Whatever way the task ends (clean finish, fault, panic, operator
//! abort, or a stop request) the run is torn down exactly once: held keys
//! are released, the scope is disposed, and a [`RunReport`] goes to the
//! operator.

use std::collections::BTreeSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::time_flow::{TimeFlow, TimeFlowScope, TimeFlowStack};
use crate::engine::RunHandle;
use crate::target::{InputEvent, Prompter, TargetApp};
use crate::wire::messages::{LogLevel, RunResult};

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The entry point finished cleanly.
    Completed,
    /// The entry point raised a fault or panicked.
    Faulted,
    /// The operator chose `Abort` at a checkpoint.
    OperatorAbort,
    /// A stop request ended the run.
    Cancelled,
}

/// Lifecycle of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Constructed, nothing applied yet.
    Created,
    /// The run's time-flow scope is active.
    TimeFlowApplied,
    /// Being advanced by engine ticks.
    Pumping,
    /// Finished cleanly, teardown pending.
    Completed,
    /// Faulted, teardown pending.
    Faulted,
    /// Aborted or cancelled, teardown pending.
    Aborted,
    /// Teardown done.
    TornDown,
}

/// Outcome of advancing a task by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Suspended; resume on a later tick.
    Pending,
    /// Done.
    Finished,
}

/// Why a task stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Unhandled failure inside the entry point.
    Error(String),
    /// The operator aborted the run.
    OperatorAbort(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(msg) => write!(f, "fault: {msg}"),
            Self::OperatorAbort(msg) => write!(f, "operator abort: {msg}"),
        }
    }
}

/// A cooperative unit of work advanced once per engine tick.
pub trait Task: Send {
    /// Make progress without blocking.
    ///
    /// # Errors
    ///
    /// A [`Fault`] ends the run.
    fn advance(&mut self, cx: &mut TickContext<'_>) -> Result<Progress, Fault>;
}

impl<F> Task for F
where
    F: FnMut(&mut TickContext<'_>) -> Result<Progress, Fault> + Send,
{
    fn advance(&mut self, cx: &mut TickContext<'_>) -> Result<Progress, Fault> {
        self(cx)
    }
}

/// Where a run's logs, prompts, and final report go.
pub trait OperatorChannel: Prompter {
    /// A run was accepted. Called before its first tick.
    fn started(&self, _run: &RunHandle) {}

    /// Forward one log line produced by a run.
    fn log(&self, run_id: &str, level: LogLevel, line: &str);

    /// Deliver the terminal report of a run.
    fn report(&self, report: &RunReport);
}

/// Keys a run currently holds down.
#[derive(Debug, Default)]
pub struct HeldInputs {
    keys: BTreeSet<String>,
}

impl HeldInputs {
    /// Whether nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether `key` is held.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.keys).into_iter().collect()
    }
}

/// Everything a task can touch during one tick.
pub struct TickContext<'a> {
    /// Run being advanced.
    pub run_id: &'a str,
    /// Engine tick number.
    pub tick: u64,
    /// Logical time elapsed since the previous tick.
    pub delta: Duration,
    /// Target application.
    pub target: &'a dyn TargetApp,
    /// Operator side of the run.
    pub operator: &'a dyn OperatorChannel,
    /// Engine-wide time-flow stack.
    pub time_flow: &'a TimeFlowStack,
    /// Input state owned by the run.
    pub inputs: &'a mut HeldInputs,
    /// Grace interval granted by a `Pause` decision.
    pub pause_grace: Duration,
}

impl TickContext<'_> {
    /// Press and hold `key`.
    ///
    /// # Errors
    ///
    /// [`Fault::Error`] when the target rejects the event.
    pub fn key_down(&mut self, key: &str) -> Result<(), Fault> {
        self.target
            .send_input(&InputEvent::KeyDown { key: key.to_owned() })
            .map_err(Fault::Error)?;
        self.inputs.keys.insert(key.to_owned());
        Ok(())
    }

    /// Release `key`.
    ///
    /// # Errors
    ///
    /// [`Fault::Error`] when the target rejects the event.
    pub fn key_up(&mut self, key: &str) -> Result<(), Fault> {
        self.target
            .send_input(&InputEvent::KeyUp { key: key.to_owned() })
            .map_err(Fault::Error)?;
        self.inputs.keys.remove(key);
        Ok(())
    }

    /// Click a UI element.
    ///
    /// # Errors
    ///
    /// The target's reason when the element cannot be clicked.
    pub fn click(&mut self, element: &str) -> Result<(), String> {
        self.target.send_input(&InputEvent::Click {
            element: element.to_owned(),
        })
    }

    /// Log a line on behalf of the run.
    pub fn log(&self, level: LogLevel, line: &str) {
        info!(run_id = self.run_id, ?level, line, "script log");
        self.operator.log(self.run_id, level, line);
    }
}

/// Terminal report of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: String,
    /// `Type.method` of the entry point.
    pub entry: String,
    /// Session that started the run, if any.
    pub owner: Option<Uuid>,
    /// Terminal status.
    pub status: RunStatus,
    /// True only for clean completion.
    pub completed: bool,
    /// Fault or abort description.
    pub message: Option<String>,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Stop time.
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Wire form of the report.
    #[must_use]
    pub fn to_result(&self) -> RunResult {
        RunResult {
            run_id: self.run_id.clone(),
            entry: self.entry.clone(),
            status: self.status,
            completed: self.completed,
            duration_ms: u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
            message: self.message.clone(),
            started_at: self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            finished_at: self.finished_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Per-tick inputs the engine hands to every run.
#[derive(Clone, Copy)]
pub struct PumpEnv<'a> {
    /// Engine tick number.
    pub tick: u64,
    /// Logical time elapsed since the previous tick.
    pub delta: Duration,
    /// Target application.
    pub target: &'a dyn TargetApp,
    /// Engine-wide time-flow stack.
    pub time_flow: &'a TimeFlowStack,
    /// Grace interval granted by a `Pause` decision.
    pub pause_grace: Duration,
}

/// One execution of an entry point.
pub struct Run {
    id: String,
    entry: String,
    owner: Option<Uuid>,
    flow: TimeFlow,
    phase: RunPhase,
    task: Option<Box<dyn Task>>,
    scope: Option<TimeFlowScope>,
    inputs: HeldInputs,
    operator: Arc<dyn OperatorChannel>,
    stop_requested: bool,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl fmt::Debug for Run {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("entry", &self.entry)
            .field("owner", &self.owner)
            .field("flow", &self.flow)
            .field("phase", &self.phase)
            .field("stop_requested", &self.stop_requested)
            .finish_non_exhaustive()
    }
}

impl Run {
    /// Create a run in the `Created` phase.
    #[must_use]
    pub fn new(
        entry: impl Into<String>,
        task: Box<dyn Task>,
        flow: TimeFlow,
        operator: Arc<dyn OperatorChannel>,
        owner: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entry: entry.into(),
            owner,
            flow,
            phase: RunPhase::Created,
            task: Some(task),
            scope: None,
            inputs: HeldInputs::default(),
            operator,
            stop_requested: false,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Run identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `Type.method` of the entry point.
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Session that started the run.
    #[must_use]
    pub fn owner(&self) -> Option<Uuid> {
        self.owner
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Whether teardown has happened.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.phase == RunPhase::TornDown
    }

    /// Activate the run's time-flow policy on `stack`.
    pub fn apply_time_flow(&mut self, stack: &TimeFlowStack) {
        if self.phase == RunPhase::Created {
            self.scope = Some(stack.push(self.flow));
            self.phase = RunPhase::TimeFlowApplied;
        }
    }

    /// Ask the run to stop at the next tick boundary.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Advance the task by one tick.
    ///
    /// Returns the report when this tick ended the run.
    pub fn pump(&mut self, env: PumpEnv<'_>) -> Option<RunReport> {
        if self.phase == RunPhase::TornDown {
            return None;
        }
        if self.stop_requested {
            self.phase = RunPhase::Aborted;
            return Some(self.tear_down(
                env.target,
                RunStatus::Cancelled,
                Some("stop requested".into()),
            ));
        }
        self.phase = RunPhase::Pumping;

        let Some(task) = self.task.as_mut() else {
            return Some(self.tear_down(
                env.target,
                RunStatus::Faulted,
                Some("run has no task".into()),
            ));
        };
        let mut cx = TickContext {
            run_id: &self.id,
            tick: env.tick,
            delta: env.delta,
            target: env.target,
            operator: self.operator.as_ref(),
            time_flow: env.time_flow,
            inputs: &mut self.inputs,
            pause_grace: env.pause_grace,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| task.advance(&mut cx)));

        let (status, message) = match outcome {
            Ok(Ok(Progress::Pending)) => return None,
            Ok(Ok(Progress::Finished)) => {
                self.phase = RunPhase::Completed;
                (RunStatus::Completed, None)
            }
            Ok(Err(Fault::Error(msg))) => {
                self.phase = RunPhase::Faulted;
                (RunStatus::Faulted, Some(msg))
            }
            Ok(Err(Fault::OperatorAbort(msg))) => {
                self.phase = RunPhase::Aborted;
                (RunStatus::OperatorAbort, Some(msg))
            }
            Err(payload) => {
                self.phase = RunPhase::Faulted;
                (RunStatus::Faulted, Some(panic_message(payload.as_ref())))
            }
        };
        Some(self.tear_down(env.target, status, message))
    }

    fn tear_down(
        &mut self,
        target: &dyn TargetApp,
        status: RunStatus,
        message: Option<String>,
    ) -> RunReport {
        // Dropping the task also drops any checkpoint scopes it still owns.
        self.task = None;

        for key in self.inputs.drain() {
            if let Err(err) = target.send_input(&InputEvent::KeyUp { key: key.clone() }) {
                warn!(run_id = %self.id, key = %key, %err, "failed to release held key");
            }
        }
        if let Some(scope) = self.scope.take() {
            scope.release();
        }

        let report = RunReport {
            run_id: self.id.clone(),
            entry: self.entry.clone(),
            owner: self.owner,
            status,
            completed: status == RunStatus::Completed,
            message,
            duration: self.started.elapsed(),
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        self.phase = RunPhase::TornDown;

        match (&report.status, &report.message) {
            (RunStatus::Faulted, Some(msg)) => {
                error!(run_id = %self.id, entry = %self.entry, %msg, "run faulted");
                self.operator.log(&self.id, LogLevel::Error, msg);
            }
            (RunStatus::OperatorAbort, Some(msg)) => {
                warn!(run_id = %self.id, entry = %self.entry, %msg, "run aborted by operator");
                self.operator.log(&self.id, LogLevel::Warn, msg);
            }
            _ => info!(
                run_id = %self.id,
                entry = %self.entry,
                status = ?report.status,
                duration = ?report.duration,
                "run finished"
            ),
        }
        self.operator.report(&report);
        report
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    format!("task panicked: {detail}")
}
