//! Shared run context.
//!
//! One [`SequencerContext`] is passed by `Arc` to the sequencer, the mixing
//! regulator and any API layer. It owns the published [`SequencerState`],
//! the per-run node progress and the run's cancellation token. Every run
//! gets a fresh child token of the process shutdown token, so stopping one
//! run never leaks into the next.

use std::sync::{Mutex, MutexGuard};

use hydro_core::{DomainResult, FeedingPhase, NodeAddress, SequencerState};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::sequencer::{NodeResult, RunProgress, SequencerError};

struct Inner {
    state: SequencerState,
    progress: RunProgress,
    run_token: CancellationToken,
    /// A run task exists (it may still be winding down after a stop).
    running: bool,
}

pub struct SequencerContext {
    inner: Mutex<Inner>,
    shutdown: CancellationToken,
}

impl SequencerContext {
    pub fn new(shutdown: CancellationToken) -> Self {
        let run_token = shutdown.child_token();
        Self {
            inner: Mutex::new(Inner {
                state: SequencerState::default(),
                progress: RunProgress::default(),
                run_token,
                running: false,
            }),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the published state.
    pub fn state(&self) -> SequencerState {
        self.lock().state.clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().state.active
    }

    pub fn stop_requested(&self) -> bool {
        self.lock().state.stop_requested
    }

    pub fn progress(&self) -> RunProgress {
        self.lock().progress.clone()
    }

    /// Token of the current (or last) run.
    pub fn run_token(&self) -> CancellationToken {
        self.lock().run_token.clone()
    }

    /// Starts a run over `nodes` and returns its cancellation token.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` while a previous run task has not exited.
    pub fn begin_run(&self, nodes: &[NodeAddress]) -> Result<CancellationToken, SequencerError> {
        let mut inner = self.lock();
        if inner.running || inner.state.active {
            return Err(SequencerError::AlreadyRunning);
        }
        inner.state.begin();
        inner.progress = RunProgress::new(nodes);
        inner.run_token = self.shutdown.child_token();
        inner.running = true;
        debug!(nodes = nodes.len(), "Run context armed");
        Ok(inner.run_token.clone())
    }

    /// Publishes `phase` for `node`.
    ///
    /// # Errors
    ///
    /// The run is not active or a stop was requested.
    pub fn enter(&self, phase: FeedingPhase, node: &NodeAddress) -> DomainResult<()> {
        let mut inner = self.lock();
        inner.state.enter(phase, node)?;
        debug!(node = %node, phase = %phase, "Phase entered");
        Ok(())
    }

    pub fn idle(&self) {
        self.lock().state.idle();
    }

    pub fn record(&self, node: &NodeAddress, result: &NodeResult) {
        self.lock().progress.record(node, result);
    }

    /// Forces the stopped state and cancels the run token.
    ///
    /// Returns whether a run was active. Safe to call repeatedly.
    pub fn request_stop(&self) -> bool {
        let mut inner = self.lock();
        let was_active = inner.state.active;
        inner.state.request_stop();
        inner.run_token.cancel();
        drop(inner);
        if was_active {
            info!("Stop requested for active feeding run");
        }
        was_active
    }

    /// Marks a run that ended on its own as finished.
    pub fn finish(&self) {
        self.lock().state.finish();
    }

    /// Called by the run task as its last action.
    pub fn end_run(&self) {
        let mut inner = self.lock();
        inner.running = false;
        inner.state.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<NodeAddress> {
        vec![NodeAddress::new("a"), NodeAddress::new("b")]
    }

    #[test]
    fn test_begin_refuses_while_running() {
        let ctx = SequencerContext::new(CancellationToken::new());
        ctx.begin_run(&nodes()).unwrap();
        assert!(matches!(
            ctx.begin_run(&nodes()),
            Err(SequencerError::AlreadyRunning)
        ));

        // Stopped but the task has not exited yet.
        ctx.request_stop();
        assert!(ctx.begin_run(&nodes()).is_err());

        ctx.end_run();
        assert!(ctx.begin_run(&nodes()).is_ok());
    }

    #[test]
    fn test_each_run_gets_a_fresh_token() {
        let ctx = SequencerContext::new(CancellationToken::new());
        let first = ctx.begin_run(&nodes()).unwrap();
        ctx.request_stop();
        ctx.end_run();
        assert!(first.is_cancelled());

        let second = ctx.begin_run(&nodes()).unwrap();
        assert!(!second.is_cancelled());
        assert!(!ctx.stop_requested());
    }

    #[test]
    fn test_shutdown_cancels_run() {
        let shutdown = CancellationToken::new();
        let ctx = SequencerContext::new(shutdown.clone());
        let token = ctx.begin_run(&nodes()).unwrap();
        shutdown.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_stop_is_idempotent_and_consistent() {
        let ctx = SequencerContext::new(CancellationToken::new());
        let node = NodeAddress::new("a");
        ctx.begin_run(&nodes()).unwrap();
        ctx.enter(FeedingPhase::Drain, &node).unwrap();

        assert!(ctx.request_stop());
        assert!(!ctx.request_stop());
        let state = ctx.state();
        assert_eq!(state.phase, FeedingPhase::Idle);
        assert!(!state.active);
        assert!(state.is_consistent());
        assert!(ctx.enter(FeedingPhase::Fill, &node).is_err());
    }

    #[test]
    fn test_progress_tracks_nodes() {
        let ctx = SequencerContext::new(CancellationToken::new());
        ctx.begin_run(&nodes()).unwrap();
        ctx.record(&NodeAddress::new("a"), &NodeResult::Completed);
        let progress = ctx.progress();
        assert_eq!(progress.completed, vec![NodeAddress::new("a")]);
        assert_eq!(progress.remaining, vec![NodeAddress::new("b")]);
    }
}
