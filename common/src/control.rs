//! Transfer control block shared between a caller and a running transfer.
//!
//! One [`TransferControlBlock`] is created per logical transfer and shared (behind an
//! [`std::sync::Arc`]) by the caller, the orchestrator and every parallel transfer stream. The
//! caller uses it to pause, resume or cancel the transfer from another task; the transfer uses it
//! to publish progress, count errors and decide whether to keep going.
//!
//! All state lives behind a single mutex owned by the block, so every read observes a consistent
//! snapshot.
//!
//! # Restart filtering
//!
//! When a restart path is configured, [`TransferControlBlock::filter`] skips every path up to and
//! including the restart path and admits everything after it. The restart path names the last
//! file known to have been transferred successfully, so it is skipped as well.
//!
//! ```
//! use common::control::TransferControlBlock;
//!
//! let restart = Some("/zone/home/b.txt".to_string());
//! let control = TransferControlBlock::with_settings(restart, -1).unwrap();
//! assert!(!control.filter("/zone/home/a.txt"));
//! assert!(!control.filter("/zone/home/b.txt"));
//! assert!(control.filter("/zone/home/c.txt"));
//! ```
//!
//! # Error threshold
//!
//! [`TransferControlBlock::should_abandon_for_errors`] is a pure predicate. Turning it into a
//! cancellation is done by [`TransferControlBlock::enforce_error_threshold`], which the
//! orchestrator calls at every loop boundary (and which
//! [`TransferControlBlock::should_continue`] runs first).

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

/// Default number of errors after which a transfer is cancelled.
pub const DEFAULT_MAX_ERRORS_BEFORE_CANCEL: i32 = 10;

/// `max_errors_before_cancel` value meaning "never cancel because of errors".
pub const UNLIMITED_ERRORS: i32 = -1;

#[derive(Debug, Default)]
struct State {
    cancelled: bool,
    paused: bool,
    restart_hit: bool,
    max_errors_before_cancel: i32,
    error_count: usize,
    total_files_to_transfer: usize,
    total_files_transferred_so_far: usize,
    bytes_transferred: u64,
}

#[derive(Debug)]
pub struct TransferControlBlock {
    restart_path: Option<String>,
    state: Mutex<State>,
}

impl Default for TransferControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferControlBlock {
    /// Control block without a restart path and with the default error threshold.
    pub fn new() -> Self {
        Self {
            restart_path: None,
            state: Mutex::new(State {
                max_errors_before_cancel: DEFAULT_MAX_ERRORS_BEFORE_CANCEL,
                ..Default::default()
            }),
        }
    }

    /// Control block resuming after `restart_path`, cancelling after `max_errors_before_cancel`
    /// errors (`-1` = unlimited, `0` = no threshold).
    ///
    /// An empty restart path is treated as no restart path.
    pub fn with_settings(
        restart_path: Option<String>,
        max_errors_before_cancel: i32,
    ) -> Result<Self> {
        check_max_errors(max_errors_before_cancel)?;
        Ok(Self {
            restart_path: restart_path.filter(|path| !path.is_empty()),
            state: Mutex::new(State {
                max_errors_before_cancel,
                ..Default::default()
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn restart_path(&self) -> Option<&str> {
        self.restart_path.as_deref()
    }

    /// Returns true if `path` should be transferred.
    pub fn filter(&self, path: &str) -> bool {
        let Some(restart_path) = self.restart_path.as_deref() else {
            return true;
        };
        let mut state = self.state();
        if state.restart_hit {
            return true;
        }
        if path == restart_path {
            tracing::info!("restart path {path:?} reached, transferring files after it");
            state.restart_hit = true;
        }
        false
    }

    pub fn cancel(&self) {
        let mut state = self.state();
        if !state.cancelled {
            tracing::info!("transfer cancelled");
        }
        state.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    pub fn pause(&self) {
        self.state().paused = true;
    }

    pub fn resume(&self) {
        self.state().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    pub fn report_error(&self) {
        let mut state = self.state();
        state.error_count += 1;
        tracing::debug!("transfer error reported, count: {}", state.error_count);
    }

    pub fn error_count(&self) -> usize {
        self.state().error_count
    }

    pub fn max_errors_before_cancel(&self) -> i32 {
        self.state().max_errors_before_cancel
    }

    pub fn set_max_errors_before_cancel(&self, max_errors_before_cancel: i32) -> Result<()> {
        check_max_errors(max_errors_before_cancel)?;
        self.state().max_errors_before_cancel = max_errors_before_cancel;
        Ok(())
    }

    /// True iff a positive threshold is configured and the error count has reached it.
    pub fn should_abandon_for_errors(&self) -> bool {
        abandon(&self.state())
    }

    /// Cancels the transfer if the error threshold has been reached. Returns true if the transfer
    /// is cancelled after the check.
    pub fn enforce_error_threshold(&self) -> bool {
        let mut state = self.state();
        enforce(&mut state);
        state.cancelled
    }

    /// Runs the error threshold guard and reports whether the transfer should keep going.
    pub fn should_continue(&self) -> bool {
        !self.enforce_error_threshold()
    }

    /// Waits (polling every `interval`) while the transfer is paused and not cancelled.
    pub async fn wait_while_paused(&self, interval: std::time::Duration) {
        let mut logged = false;
        loop {
            {
                let state = self.state();
                if !state.paused || state.cancelled {
                    return;
                }
            }
            if !logged {
                tracing::info!("transfer paused, waiting");
                logged = true;
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub fn total_files_to_transfer(&self) -> usize {
        self.state().total_files_to_transfer
    }

    pub fn set_total_files_to_transfer(&self, total: usize) {
        self.state().total_files_to_transfer = total;
    }

    pub fn total_files_transferred_so_far(&self) -> usize {
        self.state().total_files_transferred_so_far
    }

    /// Bumps the transferred-files counter and returns the new value.
    pub fn increment_files_transferred(&self) -> usize {
        let mut state = self.state();
        state.total_files_transferred_so_far += 1;
        state.total_files_transferred_so_far
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.state().bytes_transferred
    }

    pub fn add_bytes_transferred(&self, bytes: u64) {
        self.state().bytes_transferred += bytes;
    }
}

fn check_max_errors(max_errors_before_cancel: i32) -> Result<()> {
    if max_errors_before_cancel < UNLIMITED_ERRORS {
        return Err(Error::invalid_argument(format!(
            "max errors before cancel must be -1 or greater, got {max_errors_before_cancel}"
        )));
    }
    Ok(())
}

fn abandon(state: &State) -> bool {
    state.max_errors_before_cancel > 0
        && state.error_count >= state.max_errors_before_cancel as usize
}

fn enforce(state: &mut State) {
    if !state.cancelled && abandon(state) {
        tracing::warn!(
            "error count {} reached threshold of {}, cancelling transfer",
            state.error_count,
            state.max_errors_before_cancel
        );
        state.cancelled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    #[test]
    fn rejects_threshold_below_unlimited() {
        assert!(matches!(
            TransferControlBlock::with_settings(None, -2),
            Err(Error::InvalidArgument(_))
        ));
        let control = TransferControlBlock::new();
        assert!(control.set_max_errors_before_cancel(-5).is_err());
        assert_eq!(control.max_errors_before_cancel(), DEFAULT_MAX_ERRORS_BEFORE_CANCEL);
    }

    #[test]
    fn empty_restart_path_admits_everything() -> Result<()> {
        let control = TransferControlBlock::with_settings(Some(String::new()), -1)?;
        assert_eq!(control.restart_path(), None);
        assert!(control.filter("/a"));
        Ok(())
    }

    #[test]
    fn cancel_is_idempotent() {
        let control = TransferControlBlock::new();
        assert!(!control.is_cancelled());
        control.cancel();
        control.cancel();
        assert!(control.is_cancelled());
        assert!(!control.should_continue());
    }

    #[test]
    fn pause_and_resume() {
        let control = TransferControlBlock::new();
        control.pause();
        assert!(control.is_paused());
        control.resume();
        assert!(!control.is_paused());
    }

    #[test]
    fn threshold_triggers_cancellation_at_loop_boundary() -> Result<()> {
        let control = TransferControlBlock::with_settings(None, 2)?;
        control.report_error();
        assert!(control.should_continue());
        control.report_error();
        assert!(control.should_abandon_for_errors());
        // the predicate alone does not cancel
        assert!(!control.is_cancelled());
        assert!(!control.should_continue());
        assert!(control.is_cancelled());
        Ok(())
    }

    #[test]
    #[traced_test]
    fn threshold_cancellation_is_logged_once() -> Result<()> {
        let control = TransferControlBlock::with_settings(None, 1)?;
        control.report_error();
        assert!(control.enforce_error_threshold());
        assert!(control.enforce_error_threshold());
        assert!(logs_contain("reached threshold of 1, cancelling transfer"));
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("cancelling transfer"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one cancellation message, got {n}")),
            }
        });
        Ok(())
    }

    #[test]
    fn zero_threshold_never_abandons() -> Result<()> {
        let control = TransferControlBlock::with_settings(None, 0)?;
        for _ in 0..5 {
            control.report_error();
        }
        assert!(!control.should_abandon_for_errors());
        assert!(control.should_continue());
        Ok(())
    }

    #[test]
    fn counters() {
        let control = TransferControlBlock::new();
        control.set_total_files_to_transfer(3);
        assert_eq!(control.increment_files_transferred(), 1);
        assert_eq!(control.increment_files_transferred(), 2);
        control.add_bytes_transferred(10);
        control.add_bytes_transferred(5);
        assert_eq!(control.total_files_to_transfer(), 3);
        assert_eq!(control.total_files_transferred_so_far(), 2);
        assert_eq!(control.bytes_transferred(), 15);
    }

    #[tokio::test]
    async fn wait_while_paused_returns_on_resume() {
        let control = std::sync::Arc::new(TransferControlBlock::new());
        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move {
                control
                    .wait_while_paused(std::time::Duration::from_millis(5))
                    .await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        control.resume();
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("waiter should finish after resume")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_while_paused_returns_on_cancel() {
        let control = TransferControlBlock::new();
        control.pause();
        control.cancel();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            control.wait_while_paused(std::time::Duration::from_millis(5)),
        )
        .await
        .expect("cancelled transfer must not wait");
    }

    proptest! {
        #[test]
        fn no_restart_path_admits_all(paths in prop::collection::vec(".*", 0..20)) {
            let control = TransferControlBlock::new();
            for path in &paths {
                prop_assert!(control.filter(path));
            }
        }

        #[test]
        fn restart_path_skips_up_to_and_including_itself(
            before in prop::collection::vec("/[a-c]{1,3}", 0..10),
            after in prop::collection::vec("/[a-d]{1,3}", 0..10),
            repeats in 1usize..4,
        ) {
            let restart = "/restart".to_string();
            let control = TransferControlBlock::with_settings(Some(restart.clone()), -1).unwrap();
            for path in &before {
                prop_assert!(!control.filter(path));
            }
            prop_assert!(!control.filter(&restart));
            for _ in 0..repeats {
                prop_assert!(control.filter(&restart));
            }
            for path in &after {
                prop_assert!(control.filter(path));
            }
        }

        #[test]
        fn abandon_is_monotonic(threshold in 1i32..20, extra in 0usize..20) {
            let control = TransferControlBlock::with_settings(None, threshold).unwrap();
            for _ in 0..(threshold - 1) {
                control.report_error();
                prop_assert!(!control.should_abandon_for_errors());
            }
            control.report_error();
            prop_assert!(control.should_abandon_for_errors());
            for _ in 0..extra {
                control.report_error();
                prop_assert!(control.should_abandon_for_errors());
            }
        }

        #[test]
        fn unlimited_never_abandons(errors in 0usize..200) {
            let control = TransferControlBlock::with_settings(None, UNLIMITED_ERRORS).unwrap();
            for _ in 0..errors {
                control.report_error();
            }
            prop_assert!(!control.should_abandon_for_errors());
            prop_assert!(control.should_continue());
        }
    }
}
