//! Completion barrier.
//!
//! A [`Join`] counts outstanding completions. Tasks add to the count as work
//! is started, mark completions as replies arrive, and a waiter resolves once
//! the count is back at zero or any participant reported a failure.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
struct State {
    remaining: usize,
    error: Option<Error>,
}

/// Awaitable count of outstanding completions.
#[derive(Debug, Clone)]
pub struct Join {
    state: Arc<watch::Sender<State>>,
}

impl Join {
    /// A barrier waiting for `count` completions.
    pub fn new(count: usize) -> Self {
        let (state, _) = watch::channel(State {
            remaining: count,
            error: None,
        });
        Self {
            state: Arc::new(state),
        }
    }

    /// Expect `count` more completions.
    pub fn add(&self, count: usize) {
        if count > 0 {
            self.state.send_modify(|s| s.remaining += count);
        }
    }

    /// Mark one completion.
    pub fn done(&self) {
        self.state
            .send_modify(|s| s.remaining = s.remaining.saturating_sub(1));
    }

    /// Fail the barrier. Only the first error is kept.
    pub fn fail(&self, error: Error) {
        self.state.send_modify(|s| {
            if s.error.is_none() {
                s.error = Some(error);
            }
        });
    }

    pub fn remaining(&self) -> usize {
        self.state.borrow().remaining
    }

    /// The first failure, if any.
    pub fn error(&self) -> Option<Error> {
        self.state.borrow().error.clone()
    }

    /// Wait until every completion arrived or the barrier failed.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| s.remaining == 0 || s.error.is_some())
            .await
            .map_err(|_| Error::Disconnected)?;
        match &state.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
