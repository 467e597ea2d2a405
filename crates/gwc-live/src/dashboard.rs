use crate::client::{ClientError, GatewayApi};
use crate::connectivity::ConnectivityHandle;
use crate::metric_stream::{MetricStream, MetricStreamView};
use crate::push::{PushConnector, ReconnectPolicy};
use crate::visibility::{Visibility, VisibilityScheduler};
use gwc_core::connectivity::ConnectivityState;
use gwc_core::issues::Issue;
use gwc_core::metrics::Gauge;
use gwc_core::reconcile::StatusReconciler;
use gwc_core::sequence::{OperationClass, SequenceGuard, SequenceToken};
use gwc_core::wire::{MetricFrame, Snapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const COMMAND_QUEUE: usize = 16;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardView {
    pub verdict: ConnectivityState,
    pub snapshot: Option<Snapshot>,
    pub issues: Vec<Issue>,
    pub metrics: Option<MetricFrame>,
    pub metrics_connected: bool,
    pub gauges: Vec<Gauge>,
    pub fetch_failures: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DashboardOptions {
    pub poll_interval: Duration,
    pub metric_policy: ReconnectPolicy,
    pub suspend_metrics_when_hidden: bool,
}

impl Default for DashboardOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(8_000),
            metric_policy: ReconnectPolicy::Fixed(Duration::from_millis(3_000)),
            suspend_metrics_when_hidden: true,
        }
    }
}

#[derive(Debug)]
enum Command {
    Poll,
}

/// Live status view: periodic snapshot poll, metric stream and the shared
/// connectivity verdict reconciled into one published view.
#[derive(Debug)]
pub struct Dashboard {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<DashboardView>,
    task: Option<JoinHandle<()>>,
}

impl Dashboard {
    pub fn spawn<A, C>(
        api: Arc<A>,
        metrics: C,
        shared: ConnectivityHandle,
        visibility: watch::Receiver<Visibility>,
        options: DashboardOptions,
    ) -> Self
    where
        A: GatewayApi,
        C: PushConnector,
    {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (view_tx, view) = watch::channel(DashboardView::default());

        let metric_visibility = options
            .suspend_metrics_when_hidden
            .then(|| visibility.clone());
        let metric_stream = MetricStream::spawn(metrics, options.metric_policy, metric_visibility);

        let mut scheduler = VisibilityScheduler::new(visibility);
        let poll_tx = commands.clone();
        scheduler.start(options.poll_interval, move || {
            let poll_tx = poll_tx.clone();
            async move {
                if poll_tx.try_send(Command::Poll).is_err() {
                    debug!(event = "snapshot_poll_skipped");
                }
            }
        });

        let actor = DashboardActor {
            api,
            reconciler: StatusReconciler::new(),
            guard: SequenceGuard::new(),
            last_applied: None,
            metrics: MetricStreamView::default(),
            view_tx,
            _scheduler: scheduler,
        };
        let task = tokio::spawn(actor.run(command_rx, shared, metric_stream));

        Self {
            commands,
            view,
            task: Some(task),
        }
    }

    pub fn view(&self) -> DashboardView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardView> {
        self.view.clone()
    }

    /// Fetches a snapshot now without waiting for the next tick.
    pub fn refresh_now(&self) -> bool {
        self.commands.try_send(Command::Poll).is_ok()
    }

    /// Stops this view's poller and metric stream; shared state is untouched.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!(event = "dashboard_closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct DashboardActor<A> {
    api: Arc<A>,
    reconciler: StatusReconciler,
    guard: SequenceGuard,
    last_applied: Option<SequenceToken>,
    metrics: MetricStreamView,
    view_tx: watch::Sender<DashboardView>,
    _scheduler: VisibilityScheduler,
}

impl<A: GatewayApi> DashboardActor<A> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        shared: ConnectivityHandle,
        metric_stream: MetricStream,
    ) {
        let mut shared_rx = shared.subscribe();
        let mut metric_rx = metric_stream.subscribe();
        let mut fetches: JoinSet<(SequenceToken, Result<Snapshot, ClientError>)> = JoinSet::new();
        let mut shared_open = true;
        let mut metrics_open = true;

        self.reconciler.set_shared(*shared_rx.borrow_and_update());
        self.metrics = metric_rx.borrow_and_update().clone();
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Poll) => {
                        let token = self.guard.next_token(OperationClass::SnapshotFetch);
                        let api = self.api.clone();
                        fetches.spawn(async move { (token, api.fetch_snapshot().await) });
                    }
                    None => break,
                },
                Some(joined) = fetches.join_next(), if !fetches.is_empty() => {
                    let Ok((token, result)) = joined else {
                        continue;
                    };
                    self.apply_fetch(token, result);
                }
                changed = shared_rx.changed(), if shared_open => {
                    if changed.is_err() {
                        shared_open = false;
                        continue;
                    }
                    let state = *shared_rx.borrow_and_update();
                    if self.reconciler.set_shared(state) {
                        debug!(event = "dashboard_verdict_changed", verdict = %self.reconciler.verdict());
                    }
                    self.publish();
                }
                changed = metric_rx.changed(), if metrics_open => {
                    if changed.is_err() {
                        metrics_open = false;
                        continue;
                    }
                    self.metrics = metric_rx.borrow_and_update().clone();
                    self.publish();
                }
            }
        }
        drop(metric_stream);
    }

    /// Fetches may overlap when the gateway answers slower than the poll
    /// interval. Any result newer than the last applied one lands; only a
    /// result overtaken by a newer applied fetch is dropped.
    fn apply_fetch(&mut self, token: SequenceToken, result: Result<Snapshot, ClientError>) {
        if let Some(applied) = self.last_applied.filter(|applied| token <= *applied) {
            debug!(event = "snapshot_fetch_superseded", token = %token, applied = %applied);
            return;
        }
        self.last_applied = Some(token);
        match result {
            Ok(snapshot) => self.reconciler.apply_snapshot(snapshot),
            Err(err) => {
                warn!(
                    event = "snapshot_fetch_failed",
                    failures = self.reconciler.fetch_failures() + 1,
                    error = %err
                );
                self.reconciler.apply_fetch_failure();
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let view = DashboardView {
            verdict: self.reconciler.verdict(),
            snapshot: self.reconciler.snapshot().cloned(),
            issues: self.reconciler.issues().to_vec(),
            metrics: self.metrics.latest.clone(),
            metrics_connected: self.metrics.connected,
            gauges: self.metrics.gauges(),
            fetch_failures: self.reconciler.fetch_failures(),
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}
