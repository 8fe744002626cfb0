//! Recovery window after (re)connect
//!
//! Tracks which expected datapoints reported since the device came online
//! and declares the state synchronized once the completion policy is met or
//! the deadline passes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// When a recovery window counts as synchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "count", rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Every expected dp reported
    FullCoverage,
    /// At least this many expected dps reported
    AtLeast(usize),
}

impl CompletionPolicy {
    #[must_use]
    pub fn is_met(&self, received: usize, expected: usize) -> bool {
        match self {
            CompletionPolicy::FullCoverage => received >= expected,
            CompletionPolicy::AtLeast(n) => received >= (*n).min(expected),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Idle,
    Active,
    Complete,
}

/// Diagnostics emitted when a window closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub session: u64,
    pub duration: Duration,
    pub received: BTreeSet<u8>,
    /// Closed by the deadline rather than by coverage
    pub by_deadline: bool,
}

/// Per-device recovery session
///
/// The deadline timer is a spawned task that reports the session id back on
/// `deadline_tx`; the owner feeds it to [`RecoveryTracker::on_deadline`].
#[derive(Debug)]
pub struct RecoveryTracker {
    policy: CompletionPolicy,
    state: RecoveryState,
    expected: BTreeSet<u8>,
    received: BTreeSet<u8>,
    started: Option<Instant>,
    session: u64,
    deadline: Option<JoinHandle<()>>,
    deadline_tx: mpsc::UnboundedSender<u64>,
}

impl RecoveryTracker {
    #[must_use]
    pub fn new(policy: CompletionPolicy, deadline_tx: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            policy,
            state: RecoveryState::Idle,
            expected: BTreeSet::new(),
            received: BTreeSet::new(),
            started: None,
            session: 0,
            deadline: None,
            deadline_tx,
        }
    }

    #[must_use]
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == RecoveryState::Active
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == RecoveryState::Complete
    }

    #[must_use]
    pub fn received(&self) -> &BTreeSet<u8> {
        &self.received
    }

    /// Open (or restart) the window, returning the new session id
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&mut self, expected: BTreeSet<u8>, timeout: Duration) -> u64 {
        if let Some(handle) = self.deadline.take() {
            handle.abort();
        }

        self.session += 1;
        self.expected = expected;
        self.received.clear();
        self.started = Some(Instant::now());
        self.state = RecoveryState::Active;

        let session = self.session;
        let tx = self.deadline_tx.clone();
        self.deadline = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(session);
        }));

        tracing::info!(
            "Recovery session {} opened, expecting dps {:?} within {:?}",
            session,
            self.expected,
            timeout
        );
        session
    }

    /// Record a reported dp; returns the report if this completed the window
    pub fn observe(&mut self, dp: u8) -> Option<RecoveryReport> {
        if self.state != RecoveryState::Active || !self.expected.contains(&dp) {
            return None;
        }
        self.received.insert(dp);

        if self.policy.is_met(self.received.len(), self.expected.len()) {
            Some(self.finish(false))
        } else {
            None
        }
    }

    /// Deadline for `session` elapsed; stale sessions are ignored
    pub fn on_deadline(&mut self, session: u64) -> Option<RecoveryReport> {
        if session != self.session || self.state != RecoveryState::Active {
            tracing::debug!("Ignoring stale recovery deadline for session {}", session);
            return None;
        }
        Some(self.finish(true))
    }

    /// Abandon any active window without a report
    pub fn cancel(&mut self) {
        if let Some(handle) = self.deadline.take() {
            handle.abort();
        }
        if self.state == RecoveryState::Active {
            tracing::debug!("Recovery session {} cancelled", self.session);
            self.state = RecoveryState::Idle;
        }
    }

    fn finish(&mut self, by_deadline: bool) -> RecoveryReport {
        if let Some(handle) = self.deadline.take() {
            handle.abort();
        }
        self.state = RecoveryState::Complete;

        let report = RecoveryReport {
            session: self.session,
            duration: self.started.map(|s| s.elapsed()).unwrap_or_default(),
            received: self.received.clone(),
            by_deadline,
        };
        tracing::info!(
            "Recovery session {} complete: {:?}, dps {:?}{}",
            report.session,
            report.duration,
            report.received,
            if by_deadline { " (timeout)" } else { "" }
        );
        report
    }
}

impl Drop for RecoveryTracker {
    fn drop(&mut self) {
        if let Some(handle) = self.deadline.take() {
            handle.abort();
        }
    }
}
