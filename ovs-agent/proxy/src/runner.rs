use std::time::Duration;
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};
use tracing::{debug, trace};

/// The serialized callback a [`BoundedFrequencyRunner`] drives.
#[async_trait::async_trait]
pub trait Syncer: Send + 'static {
    async fn sync(&mut self);
}

/// Requests invocations from a runner. Cheap to clone; requests made while
/// one is already pending coalesce.
#[derive(Clone, Debug)]
pub struct RunnerHandle {
    tx: mpsc::Sender<()>,
}

impl RunnerHandle {
    /// Requests a callback invocation soon. Never blocks.
    pub fn run(&self) {
        // A full channel means a request is already pending.
        let _ = self.tx.try_send(());
    }
}

/// Serializes callback invocations and bounds their frequency: requests
/// within the minimum interval coalesce (a burst budget admits a few
/// back-to-back runs first), and an idle stretch of the maximum interval
/// triggers an invocation anyway.
pub struct BoundedFrequencyRunner {
    name: &'static str,
    min_interval: Duration,
    max_interval: Duration,
    burst: u32,
    rx: mpsc::Receiver<()>,
    handle: RunnerHandle,
}

impl BoundedFrequencyRunner {
    pub fn new(
        name: &'static str,
        min_interval: Duration,
        max_interval: Duration,
        burst: u32,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            name,
            min_interval,
            max_interval,
            burst: burst.max(1),
            rx,
            handle: RunnerHandle { tx },
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        self.handle.clone()
    }

    /// Drives `target` until the shutdown signal fires. An in-flight
    /// invocation always runs to completion first.
    pub async fn run<T: Syncer>(mut self, mut target: T, shutdown: drain::Watch) {
        let mut tokens = self.burst;
        let mut last_refill = Instant::now();
        let mut last_run = Instant::now();
        let mut pending = false;
        let mut open = true;
        let signaled = shutdown.signaled();
        tokio::pin!(signaled);
        debug!(runner = %self.name, "started");
        loop {
            refill(&mut tokens, &mut last_refill, self.min_interval, self.burst);
            let deadline = if pending {
                if self.min_interval.is_zero() || tokens > 0 {
                    Instant::now()
                } else {
                    last_refill + self.min_interval
                }
            } else {
                last_run + self.max_interval
            };
            tokio::select! {
                _ = &mut signaled => {
                    debug!(runner = %self.name, "shutting down");
                    return;
                }
                ping = self.rx.recv(), if open => match ping {
                    Some(()) => pending = true,
                    None => open = false,
                },
                _ = time::sleep_until(deadline) => {
                    if pending && !self.min_interval.is_zero() {
                        refill(&mut tokens, &mut last_refill, self.min_interval, self.burst);
                        if tokens == 0 {
                            continue;
                        }
                        tokens -= 1;
                    }
                    trace!(runner = %self.name, pending, "invoking callback");
                    target.sync().await;
                    last_run = Instant::now();
                    pending = false;
                }
            }
        }
    }
}

fn refill(tokens: &mut u32, last_refill: &mut Instant, min_interval: Duration, burst: u32) {
    if min_interval.is_zero() {
        return;
    }
    let accrued = (last_refill.elapsed().as_nanos() / min_interval.as_nanos()) as u32;
    if accrued > 0 {
        *tokens = tokens.saturating_add(accrued).min(burst);
        *last_refill += min_interval * accrued;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Recorder {
        runs: Arc<Mutex<Vec<(Instant, Instant)>>>,
        delay: Duration,
    }

    impl Recorder {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn count(&self) -> usize {
            self.runs.lock().len()
        }
    }

    #[async_trait::async_trait]
    impl Syncer for Recorder {
        async fn sync(&mut self) {
            let started = Instant::now();
            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            self.runs.lock().push((started, Instant::now()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pings_within_the_min_interval_coalesce() {
        let (_signal, watch) = drain::channel();
        let runner = BoundedFrequencyRunner::new(
            "test",
            Duration::from_millis(100),
            Duration::from_secs(3600),
            1,
        );
        let handle = runner.handle();
        let recorder = Recorder::default();
        tokio::spawn(runner.run(recorder.clone(), watch));

        handle.run();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.count(), 1);

        // Burst spent: further requests coalesce behind the min interval.
        handle.run();
        handle.run();
        handle.run();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.count(), 1);

        // The coalesced request fires once as the interval elapses.
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.count(), 2);

        // Nothing further is pending.
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(recorder.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_budget_admits_back_to_back_runs() {
        let (_signal, watch) = drain::channel();
        let runner = BoundedFrequencyRunner::new(
            "test",
            Duration::from_secs(10),
            Duration::from_secs(3600),
            2,
        );
        let handle = runner.handle();
        let recorder = Recorder::default();
        tokio::spawn(runner.run(recorder.clone(), watch));

        handle.run();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.count(), 1);

        handle.run();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.count(), 2);

        // Budget exhausted: the next request waits for a refill.
        handle.run();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.count(), 2);
        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(recorder.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_runner_fires_at_the_max_interval() {
        let (_signal, watch) = drain::channel();
        let runner = BoundedFrequencyRunner::new(
            "test",
            Duration::ZERO,
            Duration::from_secs(5),
            1,
        );
        let recorder = Recorder::default();
        tokio::spawn(runner.run(recorder.clone(), watch));

        time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(recorder.count(), 1);
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recorder.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invocations_never_overlap() {
        let (_signal, watch) = drain::channel();
        let runner = BoundedFrequencyRunner::new(
            "test",
            Duration::ZERO,
            Duration::from_secs(3600),
            1,
        );
        let handle = runner.handle();
        let recorder = Recorder::with_delay(Duration::from_millis(300));
        tokio::spawn(runner.run(recorder.clone(), watch));

        for _ in 0..5 {
            handle.run();
            time::sleep(Duration::from_millis(100)).await;
        }
        time::sleep(Duration::from_secs(2)).await;

        let runs = recorder.runs.lock();
        assert!(runs.len() >= 2);
        for pair in runs.windows(2) {
            assert!(pair[1].0 >= pair[0].1, "overlapping invocations");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_the_in_flight_invocation() {
        let (signal, watch) = drain::channel();
        let runner = BoundedFrequencyRunner::new(
            "test",
            Duration::ZERO,
            Duration::from_secs(3600),
            1,
        );
        let handle = runner.handle();
        let recorder = Recorder::with_delay(Duration::from_millis(200));
        let task = tokio::spawn(runner.run(recorder.clone(), watch));

        handle.run();
        time::sleep(Duration::from_millis(50)).await;
        signal.drain().await;
        task.await.unwrap();
        assert_eq!(recorder.count(), 1);
    }
}
