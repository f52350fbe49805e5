//! Accounting of outstanding asynchronous operations.
//!
//! Every Read/WriteNotify takes a [`IoToken`] when it is issued and hands it
//! back when it completes. The token remembers the generation it was issued
//! in; after [`IoAccounting::reset_generation`] older tokens no longer count,
//! and anything still carrying one is recognisably stale.

use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
};

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoToken {
    generation: u32,
}

impl IoToken {
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Default)]
struct IoState {
    outstanding: u64,
    generation: u32,
}

#[derive(Debug)]
pub struct IoAccounting {
    state: Mutex<IoState>,
    drained: Condvar,
    /// Mirrors the outstanding count for async waiters
    outstanding_tx: watch::Sender<u64>,
}

impl Default for IoAccounting {
    fn default() -> Self {
        IoAccounting {
            state: Mutex::new(IoState::default()),
            drained: Condvar::new(),
            outstanding_tx: watch::Sender::new(0),
        }
    }
}

impl IoAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IoState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &IoState) {
        self.outstanding_tx.send_replace(state.outstanding);
        if state.outstanding == 0 {
            self.drained.notify_all();
        }
    }

    /// Count a newly issued operation
    pub fn begin(&self) -> IoToken {
        let mut state = self.lock();
        state.outstanding += 1;
        self.publish(&state);
        IoToken {
            generation: state.generation,
        }
    }

    /// Retire an operation. Returns false, changing nothing, if the token
    /// belongs to a generation that has since been reset.
    pub fn end(&self, token: IoToken) -> bool {
        let mut state = self.lock();
        if token.generation != state.generation {
            debug!(
                "Ignoring completion from generation {} (now {})",
                token.generation, state.generation
            );
            return false;
        }
        state.outstanding = state.outstanding.saturating_sub(1);
        self.publish(&state);
        true
    }

    pub fn is_current(&self, token: IoToken) -> bool {
        self.lock().generation == token.generation
    }

    pub fn current_generation(&self) -> u32 {
        self.lock().generation
    }

    /// Start a new generation, forgetting everything outstanding in the old one
    pub fn reset_generation(&self) -> u32 {
        let mut state = self.lock();
        state.generation = state.generation.wrapping_add(1);
        state.outstanding = 0;
        self.publish(&state);
        state.generation
    }

    pub fn outstanding(&self) -> u64 {
        self.lock().outstanding
    }

    /// Block until nothing is outstanding. Returns false on timeout.
    pub fn wait_for_drain(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .drained
            .wait_timeout_while(state, timeout, |s| s.outstanding > 0)
            .unwrap_or_else(|e| e.into_inner());
        state.outstanding == 0
    }

    /// As [`IoAccounting::wait_for_drain`], without blocking the runtime
    pub async fn wait_for_drain_async(&self, timeout: Duration) -> bool {
        let mut outstanding = self.outstanding_tx.subscribe();
        matches!(
            tokio::time::timeout(timeout, outstanding.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn begin_and_end() {
        let io = IoAccounting::new();
        let a = io.begin();
        let b = io.begin();
        assert_eq!(io.outstanding(), 2);
        assert!(io.end(a));
        assert!(!io.wait_for_drain(Duration::from_millis(10)));
        assert!(io.end(b));
        assert!(io.wait_for_drain(Duration::from_millis(10)));
    }

    #[test]
    fn stale_tokens_are_ignored() {
        let io = IoAccounting::new();
        let old = io.begin();
        let generation = io.reset_generation();
        assert_eq!(generation, old.generation() + 1);
        assert_eq!(io.outstanding(), 0);
        let new = io.begin();
        assert!(!io.is_current(old));
        assert!(!io.end(old));
        assert_eq!(io.outstanding(), 1);
        assert!(io.end(new));
    }

    #[test]
    fn drain_wakes_blocked_thread() {
        let io = Arc::new(IoAccounting::new());
        let token = io.begin();
        let waiter = {
            let io = io.clone();
            thread::spawn(move || io.wait_for_drain(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        io.end(token);
        assert!(waiter.join().unwrap());
    }

    #[tokio::test]
    async fn async_drain() {
        let io = Arc::new(IoAccounting::new());
        let token = io.begin();
        assert!(!io.wait_for_drain_async(Duration::from_millis(10)).await);
        let ender = {
            let io = io.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                io.end(token);
            })
        };
        assert!(io.wait_for_drain_async(Duration::from_secs(5)).await);
        ender.await.unwrap();
    }
}
