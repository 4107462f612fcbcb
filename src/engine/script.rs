//! Interpreter for portable code.
//!
//! [`ScriptTask`] is an explicit state machine: a call stack of frames,
//! each with a program counter, plus at most one suspension. Every engine
//! tick first resumes the suspension (if any) and then executes ops until
//! the next suspension point, the end of the entry point, or the per-tick
//! op budget.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::checkpoint::{Checkpoint, CheckpointDecision, ChoiceSet};
use crate::engine::run::{Fault, Progress, Task, TickContext};
use crate::loader::catalog::CodeUnit;
use crate::loader::image::Op;
use crate::wire::messages::LogLevel;

/// Non-suspending ops executed per tick before the task yields anyway.
pub const MAX_OPS_PER_TICK: usize = 1024;

/// Deepest allowed `Call` nesting.
pub const MAX_CALL_DEPTH: usize = 64;

struct CallFrame {
    type_name: String,
    method: String,
    body: Arc<[Op]>,
    pc: usize,
}

#[derive(Debug)]
enum Suspension {
    Timer { remaining: Duration },
    Frames { remaining: u32 },
    UntilClickable { element: String, remaining: Duration },
    Recover(Checkpoint),
    Prompt(Checkpoint),
    Release { key: String },
}

enum Resume {
    Blocked,
    Done,
    DoneAndStep,
    Replace(Suspension),
}

enum Step {
    Continue,
    Suspend(Suspension),
    Yield,
}

/// One execution of an entry point's body.
pub struct ScriptTask {
    unit: Arc<CodeUnit>,
    frames: Vec<CallFrame>,
    suspension: Option<Suspension>,
}

impl fmt::Debug for ScriptTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptTask")
            .field("depth", &self.frames.len())
            .field("location", &self.location())
            .field("suspension", &self.suspension)
            .finish_non_exhaustive()
    }
}

impl ScriptTask {
    /// Prepare to run `type_name.method` from `unit`.
    ///
    /// # Errors
    ///
    /// A description of why the method cannot be found.
    pub fn new(unit: Arc<CodeUnit>, type_name: &str, method: &str) -> Result<Self, String> {
        let body = unit.body(type_name, method)?;
        Ok(Self {
            unit,
            frames: vec![CallFrame {
                type_name: type_name.to_owned(),
                method: method.to_owned(),
                body,
                pc: 0,
            }],
            suspension: None,
        })
    }

    /// `Type.method+pc`, with the source location when symbols have it.
    fn location(&self) -> Option<String> {
        let frame = self.frames.last()?;
        let source = self
            .unit
            .location(&frame.type_name, &frame.method, frame.pc)
            .map(|source| format!(" ({source})"))
            .unwrap_or_default();
        Some(format!(
            "{}.{}+{}{source}",
            frame.type_name, frame.method, frame.pc
        ))
    }

    fn annotate(&self, fault: Fault) -> Fault {
        match (fault, self.location()) {
            (Fault::Error(msg), Some(at)) => Fault::Error(format!("{msg} at {at}")),
            (fault, _) => fault,
        }
    }

    fn step_past(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc += 1;
        }
    }

    fn resume(suspension: &mut Suspension, cx: &mut TickContext<'_>) -> Result<Resume, Fault> {
        let resume = match suspension {
            Suspension::Timer { remaining } => {
                *remaining = remaining.saturating_sub(cx.delta);
                if remaining.is_zero() {
                    Resume::Done
                } else {
                    Resume::Blocked
                }
            }
            Suspension::Frames { remaining } => {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    Resume::Done
                } else {
                    Resume::Blocked
                }
            }
            Suspension::UntilClickable { element, remaining } => {
                if cx.target.is_clickable(element) {
                    Resume::DoneAndStep
                } else {
                    *remaining = remaining.saturating_sub(cx.delta);
                    if remaining.is_zero() {
                        Resume::Replace(Suspension::Recover(Checkpoint::new(
                            format!("'{element}' did not become clickable in time"),
                            ChoiceSet::Full,
                        )))
                    } else {
                        Resume::Blocked
                    }
                }
            }
            // Retry leaves the pc on the failed op so it runs again.
            Suspension::Recover(checkpoint) => match checkpoint.poll(cx)? {
                None => Resume::Blocked,
                Some(CheckpointDecision::Retry) => Resume::Done,
                Some(_) => Resume::DoneAndStep,
            },
            Suspension::Prompt(checkpoint) => match checkpoint.poll(cx)? {
                None => Resume::Blocked,
                Some(_) => Resume::Done,
            },
            Suspension::Release { key } => {
                cx.key_up(key)?;
                Resume::Done
            }
        };
        Ok(resume)
    }

    fn execute(&mut self, op: &Op, cx: &mut TickContext<'_>) -> Result<Step, Fault> {
        let step = match op {
            Op::Log { message } => {
                cx.log(LogLevel::Info, message);
                self.step_past();
                Step::Continue
            }
            Op::Wait { seconds } => {
                let remaining = Duration::try_from_secs_f64(*seconds)
                    .map_err(|_| Fault::Error(format!("invalid wait of {seconds} seconds")))?;
                self.step_past();
                Step::Suspend(Suspension::Timer { remaining })
            }
            Op::WaitFrames { frames } => {
                self.step_past();
                Step::Suspend(Suspension::Frames { remaining: *frames })
            }
            Op::WaitUntilClickable {
                element,
                timeout_seconds,
            } => {
                let timeout = Duration::try_from_secs_f64(*timeout_seconds).map_err(|_| {
                    Fault::Error(format!("invalid timeout of {timeout_seconds} seconds"))
                })?;
                if cx.target.is_clickable(element) {
                    self.step_past();
                    Step::Continue
                } else {
                    Step::Suspend(Suspension::UntilClickable {
                        element: element.clone(),
                        remaining: timeout,
                    })
                }
            }
            Op::Click { element } => match cx.click(element) {
                Ok(()) => {
                    self.step_past();
                    Step::Continue
                }
                Err(reason) => Step::Suspend(Suspension::Recover(Checkpoint::new(
                    format!("click failed: {reason}"),
                    ChoiceSet::Full,
                ))),
            },
            Op::KeyDown { key } => {
                cx.key_down(key)?;
                self.step_past();
                Step::Continue
            }
            Op::KeyUp { key } => {
                cx.key_up(key)?;
                self.step_past();
                Step::Continue
            }
            Op::Press { key } => {
                cx.key_down(key)?;
                self.step_past();
                Step::Suspend(Suspension::Release { key: key.clone() })
            }
            Op::Call { type_name, method } => {
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(Fault::Error(format!(
                        "call depth exceeds {MAX_CALL_DEPTH} calling {type_name}.{method}"
                    )));
                }
                let body = self.unit.body(type_name, method).map_err(Fault::Error)?;
                self.step_past();
                self.frames.push(CallFrame {
                    type_name: type_name.clone(),
                    method: method.clone(),
                    body,
                    pc: 0,
                });
                Step::Continue
            }
            Op::Checkpoint { message, choices } => {
                self.step_past();
                Step::Suspend(Suspension::Prompt(Checkpoint::new(message.clone(), *choices)))
            }
            Op::Fail { message } => return Err(Fault::Error(message.clone())),
            Op::Yield => {
                self.step_past();
                Step::Yield
            }
        };
        Ok(step)
    }

    fn advance_inner(&mut self, cx: &mut TickContext<'_>) -> Result<Progress, Fault> {
        if let Some(mut suspension) = self.suspension.take() {
            match Self::resume(&mut suspension, cx)? {
                Resume::Blocked => {
                    self.suspension = Some(suspension);
                    return Ok(Progress::Pending);
                }
                Resume::Replace(next) => {
                    self.suspension = Some(next);
                    return Ok(Progress::Pending);
                }
                Resume::DoneAndStep => self.step_past(),
                Resume::Done => {}
            }
        }

        let mut budget = MAX_OPS_PER_TICK;
        loop {
            let Some(frame) = self.frames.last() else {
                return Ok(Progress::Finished);
            };
            let Some(op) = frame.body.get(frame.pc) else {
                self.frames.pop();
                continue;
            };
            if budget == 0 {
                return Ok(Progress::Pending);
            }
            budget -= 1;

            let op = op.clone();
            match self.execute(&op, cx)? {
                Step::Continue => {}
                Step::Yield => return Ok(Progress::Pending),
                Step::Suspend(suspension) => {
                    self.suspension = Some(suspension);
                    return Ok(Progress::Pending);
                }
            }
        }
    }
}

impl Task for ScriptTask {
    fn advance(&mut self, cx: &mut TickContext<'_>) -> Result<Progress, Fault> {
        self.advance_inner(cx).map_err(|fault| self.annotate(fault))
    }
}
