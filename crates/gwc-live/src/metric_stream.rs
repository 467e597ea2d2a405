use crate::push::{run_push_channel, PushConnector, PushEvent, ReconnectPolicy};
use crate::visibility::Visibility;
use gwc_core::event_stream::decode_json;
use gwc_core::metrics::{gauges, Gauge, MetricLatch, OfferOutcome};
use gwc_core::wire::MetricFrame;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricStreamView {
    pub latest: Option<MetricFrame>,
    pub connected: bool,
    pub accepted: u64,
    pub stale: u64,
    pub malformed: u64,
}

impl MetricStreamView {
    pub fn gauges(&self) -> Vec<Gauge> {
        self.latest.as_ref().map(gauges).unwrap_or_default()
    }
}

/// Live machine metrics from a push channel.
///
/// Only frames newer than the last accepted one reach the view; malformed
/// and stale frames are counted and dropped without touching the channel.
#[derive(Debug)]
pub struct MetricStream {
    view: watch::Receiver<MetricStreamView>,
    task: Option<JoinHandle<()>>,
}

impl MetricStream {
    pub fn spawn<C: PushConnector>(
        connector: C,
        policy: ReconnectPolicy,
        visibility: Option<watch::Receiver<Visibility>>,
    ) -> Self {
        let (view_tx, view) = watch::channel(MetricStreamView::default());
        let task = tokio::spawn(async move {
            let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
            tokio::join!(
                run_push_channel(connector, policy, visibility, events_tx),
                apply_events(events_rx, view_tx),
            );
        });
        Self {
            view,
            task: Some(task),
        }
    }

    pub fn view(&self) -> MetricStreamView {
        self.view.borrow().clone()
    }

    pub fn latest(&self) -> Option<MetricFrame> {
        self.view.borrow().latest.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.view.borrow().connected
    }

    pub fn subscribe(&self) -> watch::Receiver<MetricStreamView> {
        self.view.clone()
    }

    /// Closes the push channel. The last accepted frame stays readable.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!(event = "metric_stream_closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for MetricStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn apply_events(
    mut events: mpsc::Receiver<PushEvent>,
    view: watch::Sender<MetricStreamView>,
) {
    let mut latch = MetricLatch::new();
    let mut malformed = 0u64;

    while let Some(event) = events.recv().await {
        match event {
            PushEvent::Connected => {
                view.send_modify(|current| current.connected = true);
            }
            PushEvent::Disconnected { reason } => {
                debug!(event = "metric_stream_disconnected", reason = %reason);
                view.send_modify(|current| current.connected = false);
            }
            PushEvent::Message(text) => {
                let frame = match decode_json::<MetricFrame>(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        malformed += 1;
                        debug!(event = "metric_frame_malformed", error = %err, malformed);
                        view.send_modify(|current| current.malformed = malformed);
                        continue;
                    }
                };
                let timestamp = frame.timestamp;
                match latch.offer(frame) {
                    OfferOutcome::Accepted => {
                        let latest = latch.latest().cloned();
                        let accepted = latch.accepted();
                        view.send_modify(|current| {
                            current.latest = latest;
                            current.accepted = accepted;
                        });
                    }
                    OfferOutcome::Stale => {
                        debug!(event = "metric_frame_stale", timestamp);
                        let stale = latch.stale();
                        view.send_if_modified(|current| {
                            current.stale = stale;
                            false
                        });
                    }
                }
            }
        }
    }
}
