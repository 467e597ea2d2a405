use crate::client::GatewayApi;
use crate::visibility::{Visibility, VisibilityScheduler};
use gwc_core::connectivity::{ConnectivityState, HeartbeatTracker};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// The single writer of the shared connectivity verdict.
#[derive(Debug)]
pub struct ConnectivityPublisher {
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityPublisher {
    pub fn new() -> (Self, ConnectivityHandle) {
        let (tx, rx) = watch::channel(ConnectivityState::Loading);
        (Self { tx }, ConnectivityHandle { rx })
    }

    /// Returns true when the published verdict changed.
    pub fn publish(&self, state: ConnectivityState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    pub fn handle(&self) -> ConnectivityHandle {
        ConnectivityHandle {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of the shared verdict; clone freely.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    rx: watch::Receiver<ConnectivityState>,
}

impl ConnectivityHandle {
    pub fn get(&self) -> ConnectivityState {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.rx.clone()
    }
}

/// Owns the heartbeat probe and, through it, the shared verdict.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    scheduler: VisibilityScheduler,
    handle: ConnectivityHandle,
}

impl HeartbeatMonitor {
    pub fn spawn<A: GatewayApi>(
        api: Arc<A>,
        publisher: ConnectivityPublisher,
        visibility: watch::Receiver<Visibility>,
        interval: Duration,
        offline_after_misses: u32,
    ) -> Self {
        let handle = publisher.handle();
        let publisher = Arc::new(publisher);
        let tracker = Arc::new(Mutex::new(HeartbeatTracker::new(offline_after_misses)));
        let mut scheduler = VisibilityScheduler::new(visibility);
        scheduler.start_chained(interval, move || {
            let api = api.clone();
            let publisher = publisher.clone();
            let tracker = tracker.clone();
            async move {
                let outcome = api.probe_health().await;
                let state = {
                    let Ok(mut tracker) = tracker.lock() else {
                        return;
                    };
                    match &outcome {
                        Ok(()) => tracker.record_success(),
                        Err(err) => {
                            debug!(
                                event = "heartbeat_miss",
                                misses = tracker.consecutive_misses() + 1,
                                error = %err
                            );
                            tracker.record_failure()
                        }
                    }
                };
                if publisher.publish(state) {
                    info!(event = "connectivity_changed", state = %state);
                }
            }
        });
        Self { scheduler, handle }
    }

    pub fn handle(&self) -> ConnectivityHandle {
        self.handle.clone()
    }

    pub fn stop(&mut self) {
        self.scheduler.stop();
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }
}
