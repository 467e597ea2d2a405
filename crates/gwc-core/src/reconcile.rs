use crate::connectivity::{reconcile, ConnectivityState};
use crate::issues::{derive_issues, Issue};
use crate::wire::{GatewayStatus, Snapshot};

/// Merges the shared heartbeat verdict with the view's own snapshot poll.
///
/// Issues are recomputed from scratch whenever either input changes, so the
/// exported list is always a function of the current snapshot and verdict.
#[derive(Debug, Clone, Default)]
pub struct StatusReconciler {
    shared: ConnectivityState,
    poll: ConnectivityState,
    snapshot: Option<Snapshot>,
    issues: Vec<Issue>,
    fetch_failures: u32,
}

impl StatusReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the reconciled verdict changed.
    pub fn set_shared(&mut self, shared: ConnectivityState) -> bool {
        let before = self.verdict();
        self.shared = shared;
        self.refresh_issues();
        before != self.verdict()
    }

    pub fn apply_snapshot(&mut self, snapshot: Snapshot) {
        self.poll = ConnectivityState::from_online(snapshot.gateway.online);
        self.snapshot = Some(snapshot);
        self.fetch_failures = 0;
        self.refresh_issues();
    }

    /// The last snapshot stays in place for its pass-through fields.
    pub fn apply_fetch_failure(&mut self) {
        self.poll = ConnectivityState::Offline;
        self.fetch_failures = self.fetch_failures.saturating_add(1);
        self.refresh_issues();
    }

    pub fn shared_verdict(&self) -> ConnectivityState {
        self.shared
    }

    pub fn poll_verdict(&self) -> ConnectivityState {
        self.poll
    }

    pub fn verdict(&self) -> ConnectivityState {
        reconcile(self.shared, self.poll)
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn gateway(&self) -> Option<&GatewayStatus> {
        self.snapshot.as_ref().map(|snapshot| &snapshot.gateway)
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn fetch_failures(&self) -> u32 {
        self.fetch_failures
    }

    fn refresh_issues(&mut self) {
        let verdict = self.verdict();
        self.issues = match self.snapshot.as_ref() {
            Some(snapshot) => derive_issues(snapshot, verdict),
            None => derive_issues(&Snapshot::default(), verdict)
                .into_iter()
                .filter(|issue| issue.id == "gateway-offline")
                .collect(),
        };
    }
}
