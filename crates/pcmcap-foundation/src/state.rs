use crate::error::AppError;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::sync::Arc;

/// Lifecycle of the single capture session.
///
/// `Stopping` is the transient phase between clearing the capturing flag and the
/// worker having joined. `Faulted` records a worker that died after exhausting
/// device recovery, so a dead loop is observable without joining it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Capturing,
    Stopping,
    Faulted { reason: String },
}

pub struct StateManager {
    state: Arc<RwLock<SessionState>>,
    state_tx: Sender<SessionState>,
    state_rx: Receiver<SessionState>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        let (state_tx, state_rx) = crossbeam_channel::unbounded();
        Self {
            state: Arc::new(RwLock::new(SessionState::Idle)),
            state_tx,
            state_rx,
        }
    }

    pub fn transition(&self, new_state: SessionState) -> Result<(), AppError> {
        let mut current = self.state.write();

        let valid = matches!(
            (&*current, &new_state),
            (SessionState::Idle, SessionState::Capturing)
                | (SessionState::Capturing, SessionState::Stopping)
                | (SessionState::Capturing, SessionState::Faulted { .. })
                | (SessionState::Faulted { .. }, SessionState::Stopping)
                | (SessionState::Stopping, SessionState::Idle)
        );

        if !valid {
            return Err(AppError::Fatal(format!(
                "invalid state transition: {:?} -> {:?}",
                *current, new_state
            )));
        }

        tracing::info!("session state: {:?} -> {:?}", *current, new_state);
        *current = new_state.clone();
        let _ = self.state_tx.send(new_state);
        Ok(())
    }

    pub fn current(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn subscribe(&self) -> Receiver<SessionState> {
        self.state_rx.clone()
    }
}
