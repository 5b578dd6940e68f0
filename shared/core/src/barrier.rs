use std::{
    fmt,
    sync::{Condvar, Mutex},
};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("barrier was cancelled")]
pub struct CancelledBarrier;

/// A rendezvous point for a fixed number of workers.
///
/// Unlike [`std::sync::Barrier`], waiting workers can be released with an error
/// by [`Barrier::cancel`], so a worker that fails mid-collective does not leave
/// its peers blocked forever.
pub trait Barrier: Send + Sync + fmt::Debug {
    fn wait(&self) -> Result<(), CancelledBarrier>;
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    cancelled: bool,
}

pub struct CancellableBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl CancellableBarrier {
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "a barrier needs at least one party");
        Self {
            parties,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }
}

impl fmt::Debug for CancellableBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableBarrier")
            .field("parties", &self.parties)
            .finish()
    }
}

impl Barrier for CancellableBarrier {
    fn wait(&self) -> Result<(), CancelledBarrier> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.cancelled {
            return Err(CancelledBarrier);
        }
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cvar.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        while generation == state.generation && !state.cancelled {
            state = self.cvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        match generation == state.generation {
            // woken by cancel before everyone arrived
            true => Err(CancelledBarrier),
            false => Ok(()),
        }
    }

    fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.cancelled = true;
        self.cvar.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancelled
    }
}
