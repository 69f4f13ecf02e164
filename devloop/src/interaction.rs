//! Operator control over running tasks.
//!
//! Each running task has an [`InteractionController`]: a mutex-guarded state
//! block plus a condvar. The engine polls it at iteration boundaries; any
//! other thread (CLI stdin reader, embedding application) mutates it.
//!
//! - pause blocks the next checkpoint until resume or stop
//! - stop is consumed by the next checkpoint
//! - an injected message stays until a PROCEED or ESCALATE settles it
//! - a decision override applies to one iteration only

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::types::Decision;
use crate::task::TaskId;

/// What the loop should do at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Stop,
}

/// How a confirmation request was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationAnswer {
    Approved,
    /// Rejected by the operator or unanswered before the timeout.
    Rejected,
    /// The operator stopped the task while the request was pending.
    Stopped,
}

/// A PROCEED waiting for operator approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub task_id: TaskId,
    pub iteration: u32,
    pub confidence: f64,
    pub summary: String,
}

#[derive(Debug, Default)]
struct ControlState {
    paused: bool,
    stop_requested: bool,
    message: Option<String>,
    forced: Option<Decision>,
    pending: Option<ConfirmationRequest>,
    answer: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct InteractionController {
    inner: Arc<(Mutex<ControlState>, Condvar)>,
}

impl InteractionController {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ControlState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.inner.1.notify_all();
    }

    pub fn pause(&self) {
        self.state().paused = true;
        info!("pause requested");
        self.notify();
    }

    pub fn resume(&self) {
        self.state().paused = false;
        info!("resume requested");
        self.notify();
    }

    /// Ask the loop to stop at its next checkpoint. Also releases a pause.
    pub fn request_stop(&self) {
        self.state().stop_requested = true;
        info!("stop requested");
        self.notify();
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    pub fn stop_requested(&self) -> bool {
        self.state().stop_requested
    }

    /// Add operator guidance. Successive messages accumulate.
    pub fn inject_message(&self, text: impl Into<String>) {
        let text = text.into();
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut state = self.state();
        match state.message.as_mut() {
            Some(existing) => {
                existing.push_str("\n\n");
                existing.push_str(text);
            }
            None => state.message = Some(text.to_string()),
        }
        debug!(chars = text.len(), "operator message injected");
    }

    /// Force the decision of the next completed iteration.
    pub fn override_decision(&self, decision: Decision) {
        self.state().forced = Some(decision);
        info!(decision = %decision, "decision override queued");
    }

    /// Block while paused. Returns [`Checkpoint::Stop`] once per stop request.
    pub fn checkpoint(&self) -> Checkpoint {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut announced = false;
        loop {
            if state.stop_requested {
                state.stop_requested = false;
                state.paused = false;
                return Checkpoint::Stop;
            }
            if !state.paused {
                return Checkpoint::Continue;
            }
            if !announced {
                info!("paused at iteration boundary");
                announced = true;
            }
            state = cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Current operator guidance, if any.
    pub fn guidance(&self) -> Option<String> {
        self.state().message.clone()
    }

    pub fn take_override(&self) -> Option<Decision> {
        self.state().forced.take()
    }

    /// Apply an iteration's final decision: PROCEED and ESCALATE clear the message.
    pub fn settle(&self, decision: Decision) {
        if decision.is_final() {
            let mut state = self.state();
            if state.message.take().is_some() {
                debug!(decision = %decision, "operator message cleared");
            }
        }
    }

    /// Publish a confirmation request and wait for an answer.
    ///
    /// A timeout counts as a rejection. A stop requested while waiting is
    /// consumed here, as a checkpoint would.
    pub fn request_confirmation(
        &self,
        request: ConfirmationRequest,
        timeout: Duration,
    ) -> ConfirmationAnswer {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        info!(
            task = %request.task_id,
            iteration = request.iteration,
            "waiting for operator confirmation"
        );
        state.pending = Some(request);
        state.answer = None;
        cvar.notify_all();

        let deadline = Instant::now() + timeout;
        let answer = loop {
            if let Some(approved) = state.answer.take() {
                break if approved {
                    ConfirmationAnswer::Approved
                } else {
                    ConfirmationAnswer::Rejected
                };
            }
            if state.stop_requested {
                state.stop_requested = false;
                state.paused = false;
                break ConfirmationAnswer::Stopped;
            }
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                warn!("confirmation timed out");
                break ConfirmationAnswer::Rejected;
            };
            state = cvar
                .wait_timeout(state, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        state.pending = None;
        answer
    }

    /// Answer the pending confirmation. Returns false if nothing is pending.
    pub fn answer_confirmation(&self, approved: bool) -> bool {
        let mut state = self.state();
        if state.pending.is_none() {
            return false;
        }
        state.answer = Some(approved);
        drop(state);
        self.notify();
        true
    }

    pub fn pending_confirmation(&self) -> Option<ConfirmationRequest> {
        self.state().pending.clone()
    }
}

/// Controllers by task id, shared between the engine and its operators.
///
/// Also tracks which tasks have a loop running, so a task never runs twice
/// at once.
#[derive(Debug, Default)]
pub struct ControlRegistry {
    controllers: Mutex<HashMap<TaskId, InteractionController>>,
    running: Mutex<HashSet<TaskId>>,
}

/// Exclusive right to run one task's loop. Released on drop.
#[derive(Debug)]
pub struct RunClaim<'a> {
    registry: &'a ControlRegistry,
    task: TaskId,
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.registry
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task);
    }
}

impl ControlRegistry {
    /// The task's controller, created on first use so an operator can pause
    /// or inject before a run starts.
    pub fn controller(&self, task: &str) -> InteractionController {
        let mut map = self
            .controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.entry(task.to_string()).or_default().clone()
    }

    pub fn find(&self, task: &str) -> Option<InteractionController> {
        let map = self
            .controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.get(task).cloned()
    }

    /// Claim `task` for a run. `None` while another run holds it.
    pub fn claim(&self, task: &str) -> Option<RunClaim<'_>> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(task.to_string()) {
            return None;
        }
        Some(RunClaim {
            registry: self,
            task: task.to_string(),
        })
    }

    pub fn is_running(&self, task: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(task)
    }

    pub fn remove(&self, task: &str) {
        let mut map = self
            .controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.remove(task);
    }
}

/// Which gate approves PROCEED for tasks that require confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    AutoApprove,
    AutoReject,
    Operator,
}

pub trait ConfirmationGate: Send + Sync {
    fn confirm(
        &self,
        request: &ConfirmationRequest,
        controls: &InteractionController,
    ) -> ConfirmationAnswer;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl ConfirmationGate for AutoApprove {
    fn confirm(
        &self,
        _request: &ConfirmationRequest,
        _controls: &InteractionController,
    ) -> ConfirmationAnswer {
        ConfirmationAnswer::Approved
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoReject;

impl ConfirmationGate for AutoReject {
    fn confirm(
        &self,
        request: &ConfirmationRequest,
        _controls: &InteractionController,
    ) -> ConfirmationAnswer {
        info!(task = %request.task_id, "confirmation auto-rejected");
        ConfirmationAnswer::Rejected
    }
}

/// Waits for an operator answer through the task's controller.
#[derive(Debug, Clone)]
pub struct OperatorGate {
    timeout: Duration,
}

impl OperatorGate {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ConfirmationGate for OperatorGate {
    fn confirm(
        &self,
        request: &ConfirmationRequest,
        controls: &InteractionController,
    ) -> ConfirmationAnswer {
        controls.request_confirmation(request.clone(), self.timeout)
    }
}

pub fn gate_for(mode: GateMode, timeout: Duration) -> Arc<dyn ConfirmationGate> {
    match mode {
        GateMode::AutoApprove => Arc::new(AutoApprove),
        GateMode::AutoReject => Arc::new(AutoReject),
        GateMode::Operator => Arc::new(OperatorGate::new(timeout)),
    }
}
