use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Visible,
    Hidden,
}

impl Visibility {
    pub fn is_visible(&self) -> bool {
        matches!(self, Visibility::Visible)
    }
}

/// Sole writer of the host visibility state.
#[derive(Debug)]
pub struct VisibilitySignal {
    tx: watch::Sender<Visibility>,
}

impl VisibilitySignal {
    pub fn new(initial: Visibility) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publishes a change; repeated writes of the same state do not wake
    /// subscribers.
    pub fn set(&self, visibility: Visibility) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == visibility {
                false
            } else {
                *current = visibility;
                true
            }
        })
    }

    pub fn get(&self) -> Visibility {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Visibility> {
        self.tx.subscribe()
    }
}

impl Default for VisibilitySignal {
    fn default() -> Self {
        Self::new(Visibility::Visible)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickMode {
    /// Each tick spawns the task and never waits on the previous run.
    WallClock,
    /// The next tick is scheduled one period after the task completes.
    Chained,
}

/// Runs a task on an interval while the host is visible.
///
/// Ticking stops on hide. On show the task runs once immediately and the
/// interval restarts from that moment. At most one timer is alive per
/// scheduler: starting again replaces the previous timer.
#[derive(Debug)]
pub struct VisibilityScheduler {
    visibility: watch::Receiver<Visibility>,
    timer: Option<JoinHandle<()>>,
}

impl VisibilityScheduler {
    pub fn new(visibility: watch::Receiver<Visibility>) -> Self {
        Self {
            visibility,
            timer: None,
        }
    }

    pub fn start<F, Fut>(&mut self, period: Duration, task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_timer(period, task, TickMode::WallClock);
    }

    pub fn start_chained<F, Fut>(&mut self, period: Duration, task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_timer(period, task, TickMode::Chained);
    }

    /// Cancels the timer and any task runs it still owns.
    pub fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .as_ref()
            .map(|timer| !timer.is_finished())
            .unwrap_or(false)
    }

    fn spawn_timer<F, Fut>(&mut self, period: Duration, task: F, mode: TickMode)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        let visibility = self.visibility.clone();
        self.timer = Some(tokio::spawn(run_timer(visibility, period, task, mode)));
    }
}

impl Drop for VisibilityScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn fresh_interval(period: Duration) -> Interval {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run_timer<F, Fut>(
    mut visibility: watch::Receiver<Visibility>,
    period: Duration,
    mut task: F,
    mode: TickMode,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    let mut visible = visibility.borrow_and_update().is_visible();
    let mut ticker = visible.then(|| fresh_interval(period));
    let mut signal_open = true;
    // Dropped with the timer, which aborts runs still in flight.
    let mut in_flight = JoinSet::new();
    // A chained run holds the ticker until it joins.
    let mut chained_busy = false;

    loop {
        tokio::select! {
            _ = next_tick(&mut ticker), if !chained_busy => {
                in_flight.spawn(task());
                chained_busy = mode == TickMode::Chained;
            }
            changed = visibility.changed(), if signal_open => {
                if changed.is_err() {
                    signal_open = false;
                    continue;
                }
                let now_visible = visibility.borrow_and_update().is_visible();
                if now_visible == visible {
                    continue;
                }
                visible = now_visible;
                if visible {
                    debug!(event = "scheduler_resumed", period_ms = period.as_millis() as u64);
                    ticker = Some(fresh_interval(period));
                } else {
                    debug!(event = "scheduler_suspended");
                    ticker = None;
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        warn!(event = "scheduled_run_panicked", mode = ?mode);
                    }
                }
                if mode == TickMode::Chained {
                    chained_busy = false;
                    if let Some(ticker) = ticker.as_mut() {
                        ticker.reset();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn counting_task(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_suppresses_ticks_and_show_runs_once_immediately() {
        let signal = VisibilitySignal::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = VisibilityScheduler::new(signal.subscribe());

        scheduler.start(Duration::from_millis(1000), counting_task(&counter));
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        time::advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        signal.set(Visibility::Hidden);
        settle().await;
        time::advance(Duration::from_millis(5000)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        signal.set(Visibility::Visible);
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        time::advance(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_hidden_waits_for_show() {
        let signal = VisibilitySignal::new(Visibility::Hidden);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = VisibilityScheduler::new(signal.subscribe());
        scheduler.start(Duration::from_millis(500), counting_task(&counter));

        time::advance(Duration::from_millis(2000)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_running());

        signal.set(Visibility::Visible);
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_timer() {
        let signal = VisibilitySignal::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut scheduler = VisibilityScheduler::new(signal.subscribe());

        scheduler.start(Duration::from_millis(100), counting_task(&first));
        settle().await;
        scheduler.start(Duration::from_millis(100), counting_task(&second));
        settle().await;

        time::advance(Duration::from_millis(300)).await;
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert!(second.load(Ordering::SeqCst) >= 2);

        scheduler.stop();
        settle().await;
        assert!(!scheduler.is_running());
        let frozen = second.load(Ordering::SeqCst);
        time::advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(second.load(Ordering::SeqCst), frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_ticks_do_not_wait_for_slow_runs() {
        let signal = VisibilitySignal::default();
        let started = Arc::new(AtomicUsize::new(0));
        let mut scheduler = VisibilityScheduler::new(signal.subscribe());
        let counter = started.clone();
        scheduler.start(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            time::sleep(Duration::from_secs(60))
        });
        settle().await;

        for _ in 0..3 {
            time::advance(Duration::from_millis(100)).await;
            settle().await;
        }
        assert_eq!(started.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn chained_ticks_wait_for_completion() {
        let signal = VisibilitySignal::default();
        let started = Arc::new(AtomicUsize::new(0));
        let mut scheduler = VisibilityScheduler::new(signal.subscribe());
        let counter = started.clone();
        scheduler.start_chained(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            time::sleep(Duration::from_millis(250))
        });
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        time::advance(Duration::from_millis(250)).await;
        settle().await;
        time::advance(Duration::from_millis(60)).await;
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        time::advance(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_chained_run_keeps_the_schedule() {
        let signal = VisibilitySignal::default();
        let started = Arc::new(AtomicUsize::new(0));
        let mut scheduler = VisibilityScheduler::new(signal.subscribe());
        let counter = started.clone();
        scheduler.start_chained(Duration::from_millis(1000), move || {
            let run = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if run == 0 {
                    panic!("first run fails");
                }
            }
        });
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_running());

        time::advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 2);

        time::advance(Duration::from_millis(1000)).await;
        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn duplicate_visibility_writes_are_suppressed() {
        let signal = VisibilitySignal::default();
        let rx = signal.subscribe();
        assert!(!signal.set(Visibility::Visible));
        assert!(!rx.has_changed().expect("open"));
        assert!(signal.set(Visibility::Hidden));
        assert!(rx.has_changed().expect("open"));
        assert_eq!(signal.get(), Visibility::Hidden);
    }
}
