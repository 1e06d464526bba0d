//! Import run state and cooperative cancellation.
//!
//! An [`ImportController`] owns the "import in progress" flag, the status
//! line shown to the user, and the cancellation token of the active run.
//! It is an ordinary value shared through `Arc`, so several controllers can
//! coexist (one per importer) without any process-wide state.
//!
//! ```text
//! Idle ──begin()──▶ Scanning ──▶ Converting ──▶ Generating ──▶ Writing ─┐
//!  ▲                    │            ▲                                  │
//!  │                    │            └──────────── next job ◀───────────┘
//!  └──── finish() ◀─────┴── request_cancel(): Cancelling ──▶ Cancelled
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ImportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPhase {
    Idle,
    Scanning,
    Converting,
    Generating,
    Writing,
    Cancelling,
    Cancelled,
}

#[derive(Debug)]
struct ControllerState {
    running: bool,
    cancel_requested: bool,
    token: CancellationToken,
    phase: ImportPhase,
    status: String,
}

#[derive(Debug)]
pub struct ImportController {
    state: Mutex<ControllerState>,
}

impl Default for ImportController {
    fn default() -> Self {
        Self {
            state: Mutex::new(ControllerState {
                running: false,
                cancel_requested: false,
                token: CancellationToken::new(),
                phase: ImportPhase::Idle,
                status: "idle".to_string(),
            }),
        }
    }
}

impl ImportController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a run as started. Rejected while another run is active.
    pub fn begin(self: &Arc<Self>) -> Result<RunGuard, ImportError> {
        let mut state = self.lock();
        if state.running {
            return Err(ImportError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        state.running = true;
        state.cancel_requested = false;
        state.token = token.clone();
        state.phase = ImportPhase::Scanning;
        state.status = "scanning sources".to_string();
        Ok(RunGuard {
            controller: Arc::clone(self),
            token,
            finished: false,
        })
    }

    /// Ask the active run to stop. Returns `false` when nothing is running.
    pub fn request_cancel(&self) -> bool {
        let mut state = self.lock();
        if !state.running {
            return false;
        }
        if !state.cancel_requested {
            info!("cancellation requested");
        }
        state.cancel_requested = true;
        state.token.cancel();
        state.phase = ImportPhase::Cancelling;
        state.status = "cancelling".to_string();
        true
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.lock().cancel_requested
    }

    pub fn phase(&self) -> ImportPhase {
        self.lock().phase
    }

    /// Status line suitable for display.
    pub fn status(&self) -> String {
        self.lock().status.clone()
    }

    fn update(&self, phase: ImportPhase, status: String) {
        let mut state = self.lock();
        // A pending cancellation keeps its status until the run finishes.
        if state.cancel_requested {
            return;
        }
        state.phase = phase;
        state.status = status;
    }

    fn finish(&self, phase: ImportPhase, status: String) {
        let mut state = self.lock();
        state.running = false;
        state.cancel_requested = false;
        state.phase = phase;
        state.status = status;
    }
}

/// Handle for the active run; dropping it returns the controller to idle.
#[derive(Debug)]
pub struct RunGuard {
    controller: Arc<ImportController>,
    token: CancellationToken,
    finished: bool,
}

impl RunGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn set_phase(&self, phase: ImportPhase, status: impl Into<String>) {
        self.controller.update(phase, status.into());
    }

    /// End the run with a final status.
    pub fn finish(mut self, phase: ImportPhase, status: impl Into<String>) {
        self.finished = true;
        self.controller.finish(phase, status.into());
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.controller.finish(ImportPhase::Idle, "idle".to_string());
        }
    }
}
