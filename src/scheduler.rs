//! Timer-driven execution of collector instances.
//!
//! Each instance gets its own tokio task and its own interval. The collector
//! itself is moved into a blocking-pool thread for the duration of a gather
//! and moved back when the gather returns, so a second gather of the same
//! instance cannot start while one is in flight: there is nothing to start it
//! with.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::collectors::{Accumulator, Collector, CollectorError, Sink};

/// Default deadline for in-flight gathers at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the runtime waits for blocking-pool threads once the scheduler
/// has stopped. Gathers still stuck after that are left behind.
pub const RUNTIME_RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a single tick of an instance did not produce a clean gather.
#[derive(Debug, Error)]
pub enum GatherError {
    #[error("gather failed: {0}")]
    Failed(#[source] CollectorError),

    #[error("gather panicked: {0}")]
    Panicked(String),

    #[error("gather did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("previous gather is still running, tick skipped")]
    StillRunning,
}

/// Structured failure record handed to the failure channel.
#[derive(Debug)]
pub struct FailureReport {
    pub plugin: String,
    pub instance_id: Uuid,
    pub error: GatherError,
    pub timestamp: DateTime<Utc>,
}

/// A configured, ready-to-run collector.
pub struct Instance {
    id: Uuid,
    plugin: String,
    collector: Box<dyn Collector>,
    interval: Duration,
    timeout: Option<Duration>,
}

impl Instance {
    pub fn new(plugin: impl Into<String>, collector: Box<dyn Collector>, interval: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            plugin: plugin.into(),
            collector,
            interval,
            timeout: None,
        }
    }

    /// Per-gather deadline. `None` waits for as long as the gather takes.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run a single gather outside any schedule. Returns the number of
    /// measurements emitted.
    pub async fn gather_once(self, sink: Arc<dyn Sink>) -> Result<usize, GatherError> {
        let acc = Accumulator::new(self.plugin.clone(), sink);
        let handle = spawn_gather(self.collector, acc);
        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, handle)
                .await
                .map_err(|_| GatherError::TimedOut(limit))?,
            None => handle.await,
        };
        match joined {
            Ok((_, result)) => result,
            Err(e) => Err(GatherError::Panicked(e.to_string())),
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("plugin", &self.plugin)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Metadata about a scheduled instance.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: Uuid,
    pub plugin: String,
    pub interval: Duration,
}

pub struct Scheduler {
    sink: Arc<dyn Sink>,
    failures: Option<mpsc::UnboundedSender<FailureReport>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
    instances: Vec<InstanceInfo>,
}

impl Scheduler {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            sink,
            failures: None,
            shutdown_tx,
            tasks: JoinSet::new(),
            instances: Vec::new(),
        }
    }

    /// Also deliver every failure report to `tx`, in addition to logging it.
    pub fn with_failure_channel(mut self, tx: mpsc::UnboundedSender<FailureReport>) -> Self {
        self.failures = Some(tx);
        self
    }

    /// Start ticking `instance`. The first gather happens immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&mut self, instance: Instance) -> Uuid {
        let info = InstanceInfo {
            id: instance.id,
            plugin: instance.plugin.clone(),
            interval: instance.interval,
        };

        let slot = Slot {
            id: instance.id,
            plugin: instance.plugin,
            interval: instance.interval,
            timeout: instance.timeout,
            sink: Arc::clone(&self.sink),
            failures: self.failures.clone(),
            state: State::Idle(instance.collector),
        };
        self.tasks.spawn(slot.run(self.shutdown_tx.subscribe()));

        tracing::info!(
            plugin = %info.plugin,
            instance = %info.id,
            interval = ?info.interval,
            "Input scheduled"
        );
        let id = info.id;
        self.instances.push(info);
        id
    }

    pub fn instances(&self) -> &[InstanceInfo] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Stop arming ticks and wait up to `deadline` for in-flight gathers.
    ///
    /// Returns `false` if some instances were abandoned at the deadline. A
    /// gather blocked in the kernel keeps its thread until it returns; only
    /// the wait is abandoned.
    pub async fn shutdown(mut self, deadline: Duration) -> bool {
        let _ = self.shutdown_tx.send(true);
        let running = self.tasks.len();

        let drained = tokio::time::timeout(deadline, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if drained {
            tracing::info!(instances = running, "Scheduler stopped");
        } else {
            let abandoned = self.tasks.len();
            tracing::warn!(abandoned, deadline = ?deadline, "Scheduler shutdown timed out, abandoning gathers");
            self.tasks.abort_all();
        }
        drained
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

type Completed = (Box<dyn Collector>, Result<usize, GatherError>);

enum State {
    /// Waiting for the next tick; the scheduler owns the collector.
    Idle(Box<dyn Collector>),
    /// A gather whose result was not awaited (it timed out).
    Busy(JoinHandle<Completed>),
    /// The collector did not come back from its thread. Only a `JoinError`
    /// leads here, and `spawn_gather` catches panics, so this is reached only
    /// if the blocking task is cancelled while the runtime shuts down.
    Lost,
}

struct Slot {
    id: Uuid,
    plugin: String,
    interval: Duration,
    timeout: Option<Duration>,
    sink: Arc<dyn Sink>,
    failures: Option<mpsc::UnboundedSender<FailureReport>>,
    state: State,
}

impl Slot {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // A slow gather delays the following ticks instead of bunching them up.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            self.tick().await;
            if matches!(self.state, State::Lost) {
                tracing::error!(plugin = %self.plugin, instance = %self.id, "Input lost, no longer scheduled");
                break;
            }
        }

        tracing::debug!(plugin = %self.plugin, instance = %self.id, "Input stopped");
    }

    async fn tick(&mut self) {
        let collector = match std::mem::replace(&mut self.state, State::Lost) {
            State::Idle(collector) => collector,
            State::Busy(handle) if !handle.is_finished() => {
                self.state = State::Busy(handle);
                self.report(GatherError::StillRunning);
                return;
            }
            State::Busy(handle) => match handle.await {
                Ok((collector, result)) => {
                    match result {
                        Ok(count) => tracing::debug!(
                            plugin = %self.plugin,
                            instance = %self.id,
                            count,
                            "Abandoned gather finished late"
                        ),
                        Err(e) => self.report(e),
                    }
                    collector
                }
                // Not a panic: those are caught in `spawn_gather`.
                Err(e) => {
                    self.report(GatherError::Panicked(e.to_string()));
                    return;
                }
            },
            State::Lost => return,
        };

        let start = Instant::now();
        let acc = Accumulator::new(self.plugin.clone(), Arc::clone(&self.sink));
        let mut handle = spawn_gather(collector, acc);

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    self.state = State::Busy(handle);
                    self.report(GatherError::TimedOut(limit));
                    return;
                }
            },
            None => (&mut handle).await,
        };

        match joined {
            Ok((collector, result)) => {
                self.state = State::Idle(collector);
                match result {
                    Ok(count) => tracing::debug!(
                        plugin = %self.plugin,
                        instance = %self.id,
                        count,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Gather complete"
                    ),
                    Err(e) => self.report(e),
                }
            }
            Err(e) => self.report(GatherError::Panicked(e.to_string())),
        }
    }

    fn report(&self, error: GatherError) {
        match &error {
            GatherError::TimedOut(_) | GatherError::StillRunning => {
                tracing::warn!(plugin = %self.plugin, instance = %self.id, error = %error, "Gather incomplete")
            }
            GatherError::Failed(_) | GatherError::Panicked(_) => {
                tracing::error!(plugin = %self.plugin, instance = %self.id, error = %error, "Gather failed")
            }
        }

        if let Some(tx) = &self.failures {
            let _ = tx.send(FailureReport {
                plugin: self.plugin.clone(),
                instance_id: self.id,
                error,
                timestamp: Utc::now(),
            });
        }
    }
}

/// Run one gather on the blocking pool. The collector always comes back,
/// panics included, unless the thread itself is torn down.
fn spawn_gather(mut collector: Box<dyn Collector>, mut acc: Accumulator) -> JoinHandle<Completed> {
    tokio::task::spawn_blocking(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| collector.gather(&mut acc)));
        let result = match outcome {
            Ok(Ok(())) => Ok(acc.emitted()),
            Ok(Err(e)) => Err(GatherError::Failed(e)),
            Err(payload) => Err(GatherError::Panicked(panic_message(payload.as_ref()))),
        };
        (collector, result)
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{ChannelSink, Measurement, SimpleCollector, Tags};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Overlap {
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
    }

    /// Sleeps inside gather and records how many gathers overlap.
    struct Sleeper {
        overlap: Arc<Overlap>,
        nap: Duration,
    }

    impl Collector for Sleeper {
        fn description(&self) -> &'static str {
            "sleeps"
        }

        fn sample_config(&self) -> &'static str {
            ""
        }

        fn gather(&mut self, acc: &mut Accumulator) -> Result<(), CollectorError> {
            let now = self.overlap.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.overlap.max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.nap);
            self.overlap.calls.fetch_add(1, Ordering::SeqCst);
            self.overlap.active.fetch_sub(1, Ordering::SeqCst);
            acc.add("naps", 1, Tags::new());
            Ok(())
        }
    }

    struct Broken;

    impl Collector for Broken {
        fn description(&self) -> &'static str {
            "always fails"
        }

        fn sample_config(&self) -> &'static str {
            ""
        }

        fn gather(&mut self, _acc: &mut Accumulator) -> Result<(), CollectorError> {
            Err(CollectorError::Parse("no data".to_string()))
        }
    }

    /// Takes a while, then fails.
    struct SlowBroken {
        nap: Duration,
    }

    impl Collector for SlowBroken {
        fn description(&self) -> &'static str {
            "fails slowly"
        }

        fn sample_config(&self) -> &'static str {
            ""
        }

        fn gather(&mut self, _acc: &mut Accumulator) -> Result<(), CollectorError> {
            std::thread::sleep(self.nap);
            Err(CollectorError::Parse("late failure".to_string()))
        }
    }

    struct Panicky {
        calls: Arc<AtomicUsize>,
    }

    impl Collector for Panicky {
        fn description(&self) -> &'static str {
            "panics"
        }

        fn sample_config(&self) -> &'static str {
            ""
        }

        fn gather(&mut self, _acc: &mut Accumulator) -> Result<(), CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("collector bug");
        }
    }

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn scheduler() -> (
        Scheduler,
        mpsc::UnboundedReceiver<Measurement>,
        mpsc::UnboundedReceiver<FailureReport>,
    ) {
        let (sink, rx) = ChannelSink::channel();
        let (fail_tx, fail_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(Arc::new(sink)).with_failure_channel(fail_tx);
        (scheduler, rx, fail_rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_gathers_never_overlap() {
        let (mut scheduler, _rx, _fail_rx) = scheduler();
        let overlap = Arc::new(Overlap::default());
        let interval = Duration::from_millis(20);
        let collector = Sleeper {
            overlap: Arc::clone(&overlap),
            nap: interval * 2,
        };
        scheduler.spawn(Instance::new("sleeper", Box::new(collector), interval));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(scheduler.shutdown(Duration::from_secs(1)).await);

        assert!(overlap.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(overlap.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_does_not_allow_overlap() {
        let (mut scheduler, _rx, mut fail_rx) = scheduler();
        let overlap = Arc::new(Overlap::default());
        let collector = Sleeper {
            overlap: Arc::clone(&overlap),
            nap: Duration::from_millis(120),
        };
        let instance = Instance::new("slow", Box::new(collector), Duration::from_millis(10))
            .with_timeout(Some(Duration::from_millis(15)));
        scheduler.spawn(instance);

        tokio::time::sleep(Duration::from_millis(400)).await;
        scheduler.shutdown(Duration::from_secs(1)).await;

        assert_eq!(overlap.max_active.load(Ordering::SeqCst), 1);
        assert!(overlap.calls.load(Ordering::SeqCst) >= 2);

        let failures = drain(&mut fail_rx);
        assert!(failures
            .iter()
            .any(|f| matches!(f.error, GatherError::TimedOut(d) if d == Duration::from_millis(15))));
        assert!(failures
            .iter()
            .any(|f| matches!(f.error, GatherError::StillRunning)));
        assert!(failures.iter().all(|f| f.plugin == "slow"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_input_is_isolated() {
        let (mut scheduler, mut rx, mut fail_rx) = scheduler();
        let interval = Duration::from_millis(20);

        let broken = scheduler.spawn(Instance::new("broken", Box::new(Broken), interval));
        let mut simple = SimpleCollector::new();
        simple
            .configure(&toml::from_str("ok = true").unwrap())
            .unwrap();
        scheduler.spawn(Instance::new("simple", Box::new(simple), interval));
        assert_eq!(scheduler.len(), 2);

        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.shutdown(Duration::from_secs(1)).await;

        let measurements = drain(&mut rx);
        assert!(measurements.len() >= 5, "only {} measurements", measurements.len());
        assert!(measurements.iter().all(|m| m.name() == "simple_state"));

        let failures = drain(&mut fail_rx);
        assert!(failures.len() >= 5);
        for failure in &failures {
            assert_eq!(failure.plugin, "broken");
            assert_eq!(failure.instance_id, broken);
            assert!(matches!(failure.error, GatherError::Failed(CollectorError::Parse(_))));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_is_contained() {
        let (mut scheduler, _rx, mut fail_rx) = scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        let collector = Panicky {
            calls: Arc::clone(&calls),
        };
        scheduler.spawn(Instance::new("panicky", Box::new(collector), Duration::from_millis(20)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(scheduler.shutdown(Duration::from_secs(1)).await);

        // same instance keeps being scheduled after each panic
        assert!(calls.load(Ordering::SeqCst) >= 2);
        let failures = drain(&mut fail_rx);
        assert!(failures.len() >= 2);
        assert!(failures
            .iter()
            .all(|f| matches!(&f.error, GatherError::Panicked(msg) if msg == "collector bug")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_abandons_stuck_gather() {
        let (mut scheduler, _rx, _fail_rx) = scheduler();
        let overlap = Arc::new(Overlap::default());
        let collector = Sleeper {
            overlap: Arc::clone(&overlap),
            nap: Duration::from_millis(500),
        };
        scheduler.spawn(Instance::new("stuck", Box::new(collector), Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let start = Instant::now();
        assert!(!scheduler.shutdown(Duration::from_millis(50)).await);
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_runtime_release_is_bounded() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let start = Instant::now();

        runtime.block_on(async {
            let (mut scheduler, _rx, _fail_rx) = scheduler();
            let collector = Sleeper {
                overlap: Arc::new(Overlap::default()),
                nap: Duration::from_secs(3),
            };
            scheduler.spawn(Instance::new("stuck", Box::new(collector), Duration::from_secs(60)));
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(!scheduler.shutdown(Duration::from_millis(50)).await);
        });
        runtime.shutdown_timeout(RUNTIME_RELEASE_TIMEOUT);

        assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_late_failure_is_reported() {
        let (mut scheduler, _rx, mut fail_rx) = scheduler();
        let collector = SlowBroken {
            nap: Duration::from_millis(60),
        };
        let instance = Instance::new("late", Box::new(collector), Duration::from_millis(10))
            .with_timeout(Some(Duration::from_millis(15)));
        scheduler.spawn(instance);

        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.shutdown(Duration::from_secs(1)).await;

        let failures = drain(&mut fail_rx);
        assert!(failures
            .iter()
            .any(|f| matches!(f.error, GatherError::TimedOut(_))));
        // every gather times out, so a Failed report can only come from an
        // abandoned gather that finished afterwards
        assert!(failures
            .iter()
            .any(|f| matches!(&f.error, GatherError::Failed(CollectorError::Parse(msg)) if msg == "late failure")));
    }

    #[tokio::test]
    async fn test_gather_once() {
        let (sink, mut rx) = ChannelSink::channel();
        let instance = Instance::new("simple", Box::new(SimpleCollector::new()), Duration::from_secs(10));
        assert_eq!(instance.plugin(), "simple");

        let count = instance.gather_once(Arc::new(sink)).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(rx.try_recv().unwrap().name(), "simple_state");

        let (sink, _rx) = ChannelSink::channel();
        let err = Instance::new("broken", Box::new(Broken), Duration::from_secs(10))
            .gather_once(Arc::new(sink))
            .await
            .unwrap_err();
        assert!(matches!(err, GatherError::Failed(_)));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
