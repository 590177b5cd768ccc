//! The cycle driver: generate, fan out, report, sleep.

use std::any::Any;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::connection::ConnectionMonitor;
use crate::observation::{Observation, ObservationSource};
use crate::sink::{Outcome, Sink, SinkError};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Running,
    Terminating,
}

/// Why the driver stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Ctrl+C, SIGTERM or an equivalent request.
    Interrupted,
    /// Something in the driver's own control flow broke.
    Fault(String),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Interrupted => write!(f, "interrupted"),
            TerminationReason::Fault(reason) => write!(f, "fault: {reason}"),
        }
    }
}

/// Outcome of one sink within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkReport {
    pub sink: String,
    pub outcome: Outcome,
}

/// Everything that happened in one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub sequence: u64,
    pub cycle_id: uuid::Uuid,
    pub started_at: DateTime<Local>,
    pub observation: Observation,
    pub outcomes: Vec<SinkReport>,
}

impl CycleReport {
    /// Outcome of the sink called `name`, if it took part.
    pub fn outcome(&self, name: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|r| r.sink == name)
            .map(|r| &r.outcome)
    }

    pub fn delivered(&self) -> usize {
        self.outcomes.iter().filter(|r| r.outcome.is_delivered()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|r| r.outcome.is_failed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|r| r.outcome.is_skipped()).count()
    }

    /// Write the cycle summary for the operator.
    pub fn log(&self) {
        let obs = &self.observation;
        tracing::info!(
            cycle = self.sequence,
            cycle_id = %self.cycle_id,
            at = %self.started_at.format("%Y-%m-%d %H:%M:%S"),
            temperature = obs.temperature,
            humidity = obs.humidity,
            insolation = obs.insolation,
            rain = %obs.rain,
            alert = %obs.alert,
            "observation"
        );

        for report in &self.outcomes {
            match &report.outcome {
                Outcome::Delivered => tracing::info!(sink = %report.sink, "delivered"),
                Outcome::Skipped => tracing::info!(sink = %report.sink, "skipped"),
                Outcome::Failed(reason) => {
                    tracing::warn!(sink = %report.sink, %reason, "failed")
                }
            }
        }

        tracing::info!(
            cycle = self.sequence,
            delivered = self.delivered(),
            failed = self.failed(),
            skipped = self.skipped(),
            "cycle complete"
        );
    }
}

/// A sink with its name cached, shareable with the blocking cycle task.
#[derive(Clone)]
struct Slot {
    name: String,
    sink: Arc<Mutex<Box<dyn Sink>>>,
}

/// Runs cycles until told to stop.
pub struct CycleDriver {
    source: Arc<Mutex<Box<dyn ObservationSource + Send>>>,
    sinks: Vec<Slot>,
    interval: Duration,
    shutdown_grace: Duration,
    state: DriverState,
    sequence: u64,
    broker_monitor: Option<ConnectionMonitor>,
}

impl CycleDriver {
    pub fn new<S>(source: S, interval: Duration) -> Self
    where
        S: ObservationSource + Send + 'static,
    {
        CycleDriver {
            source: Arc::new(Mutex::new(Box::new(source))),
            sinks: Vec::new(),
            interval,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            state: DriverState::Running,
            sequence: 0,
            broker_monitor: None,
        }
    }

    /// Append a sink. Sinks are called in the order they were added.
    pub fn with_sink<S: Sink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Slot {
            name: sink.name().to_string(),
            sink: Arc::new(Mutex::new(Box::new(sink))),
        });
        self
    }

    /// Watch the broker connection so each cycle can report it.
    pub fn with_broker_monitor(mut self, monitor: ConnectionMonitor) -> Self {
        self.broker_monitor = Some(monitor);
        self
    }

    /// How long a shutdown waits for the sink call in flight before giving up on it.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.sequence
    }

    /// One cycle: a fresh observation offered to every sink in turn.
    ///
    /// Never fails. A sink that panics is recorded as failed and the
    /// remaining sinks still run.
    pub fn run_cycle(&mut self) -> CycleReport {
        self.next_cycle().run()
    }

    fn next_cycle(&mut self) -> CycleTask {
        self.sequence += 1;
        CycleTask {
            sequence: self.sequence,
            source: self.source.clone(),
            sinks: self.sinks.clone(),
            broker_monitor: self.broker_monitor.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run cycles until `shutdown` resolves, then close every sink.
    ///
    /// `shutdown` is watched during the cycle as well as the pause. Mid-cycle,
    /// the sinks not yet called are skipped and the one in flight gets
    /// `shutdown_grace` to return; past that it is left behind and not closed.
    /// Must run on the multi-threaded tokio runtime.
    pub async fn run<F>(&mut self, shutdown: F) -> TerminationReason
    where
        F: Future<Output = TerminationReason>,
    {
        tokio::pin!(shutdown);
        tracing::info!(interval = ?self.interval, sinks = self.sinks.len(), "starting cycles");

        let reason = loop {
            let task = self.next_cycle();
            let cancel = task.cancel.clone();
            let mut cycle = tokio::task::spawn_blocking(move || task.run());

            let finished = tokio::select! {
                reason = &mut shutdown => Err(reason),
                joined = &mut cycle => Ok(joined),
            };

            match finished {
                Ok(Ok(report)) => report.log(),
                Ok(Err(e)) => break TerminationReason::Fault(format!("cycle task: {e}")),
                Err(reason) => {
                    cancel.store(true, Ordering::SeqCst);
                    tracing::info!(grace = ?self.shutdown_grace, "shutdown requested mid-cycle");
                    match tokio::time::timeout(self.shutdown_grace, cycle).await {
                        Ok(Ok(report)) => report.log(),
                        Ok(Err(e)) => tracing::error!(error = %e, "cycle task failed"),
                        Err(_) => tracing::warn!("cycle still blocked in a sink, leaving it behind"),
                    }
                    break reason;
                }
            }

            tracing::info!(next_in = ?self.interval, "waiting for the next cycle");
            tokio::select! {
                reason = &mut shutdown => break reason,
                _ = tokio::time::sleep(self.interval) => {}
            }
        };

        tokio::task::block_in_place(|| self.terminate(&reason));
        reason
    }

    /// Enter [`DriverState::Terminating`] and close every sink once.
    ///
    /// A sink still held by an abandoned cycle is not waited for.
    pub fn terminate(&mut self, reason: &TerminationReason) {
        if self.state == DriverState::Terminating {
            return;
        }
        self.state = DriverState::Terminating;

        match reason {
            TerminationReason::Interrupted => tracing::info!("interrupted, closing connections"),
            TerminationReason::Fault(e) => tracing::error!(error = %e, "stopping after a fault"),
        }

        for slot in &self.sinks {
            let mut sink = match slot.sink.try_lock() {
                Ok(sink) => sink,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    tracing::warn!(sink = %slot.name, "sink busy, not closed");
                    continue;
                }
            };
            if panic::catch_unwind(AssertUnwindSafe(|| sink.close())).is_err() {
                tracing::error!(sink = %slot.name, "sink panicked while closing");
            }
        }
        tracing::info!(cycles = self.sequence, "driver stopped");
    }
}

impl Debug for CycleDriver {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleDriver")
            .field("sinks", &self.sinks.iter().map(|s| s.name.as_str()).collect::<Vec<_>>())
            .field("interval", &self.interval)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("state", &self.state)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// One cycle's worth of work, run on a blocking thread.
struct CycleTask {
    sequence: u64,
    source: Arc<Mutex<Box<dyn ObservationSource + Send>>>,
    sinks: Vec<Slot>,
    broker_monitor: Option<ConnectionMonitor>,
    cancel: Arc<AtomicBool>,
}

impl CycleTask {
    fn run(self) -> CycleReport {
        let cycle_id = uuid::Uuid::now_v7();
        let span = tracing::info_span!("cycle", seq = self.sequence, %cycle_id);
        let _entered = span.enter();

        let started_at = Local::now();
        let observation = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_observation();

        if let Some(monitor) = &self.broker_monitor {
            tracing::debug!(broker = %monitor.state(), "broker connection");
        }

        let outcomes = self
            .sinks
            .iter()
            .map(|slot| {
                let outcome = if self.cancel.load(Ordering::SeqCst) {
                    tracing::debug!(sink = %slot.name, "shutting down, not called");
                    Outcome::Skipped
                } else {
                    let mut sink = slot.sink.lock().unwrap_or_else(PoisonError::into_inner);
                    panic::catch_unwind(AssertUnwindSafe(|| sink.publish(&observation)))
                        .unwrap_or_else(|payload| {
                            Outcome::Failed(SinkError::Internal(panic_message(payload.as_ref())))
                        })
                };

                SinkReport {
                    sink: slot.name.clone(),
                    outcome,
                }
            })
            .collect();

        CycleReport {
            sequence: self.sequence,
            cycle_id,
            started_at,
            observation,
            outcomes,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("sink panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("sink panicked: {message}")
    } else {
        "sink panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{AlertState, RainState};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Fixed(Observation);

    impl ObservationSource for Fixed {
        fn next_observation(&mut self) -> Observation {
            self.0
        }
    }

    fn observation() -> Observation {
        Observation {
            temperature: 22.5,
            humidity: 61.3,
            insolation: 48.9,
            rain: RainState::NotRaining,
            alert: AlertState::Off,
        }
    }

    enum Behaviour {
        Deliver,
        Fail,
        Panic,
        Stall(Duration),
    }

    struct Counting {
        name: &'static str,
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl Counting {
        fn new(name: &'static str, behaviour: Behaviour) -> Self {
            Counting {
                name,
                behaviour,
                calls: Arc::default(),
                closes: Arc::default(),
            }
        }
    }

    impl Sink for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn publish(&mut self, _: &Observation) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Deliver => Outcome::Delivered,
                Behaviour::Fail => Outcome::Failed(SinkError::NetworkTimeout),
                Behaviour::Panic => panic!("boom"),
                Behaviour::Stall(d) => {
                    std::thread::sleep(d);
                    Outcome::Delivered
                }
            }
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_failure_does_not_stop_fan_out() {
        let first = Counting::new("first", Behaviour::Fail);
        let second = Counting::new("second", Behaviour::Panic);
        let third = Counting::new("third", Behaviour::Deliver);
        let calls = [first.calls.clone(), second.calls.clone(), third.calls.clone()];

        let mut driver = CycleDriver::new(Fixed(observation()), Duration::from_secs(15))
            .with_sink(first)
            .with_sink(second)
            .with_sink(third);

        let report = driver.run_cycle();

        for c in &calls {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }
        assert_eq!(report.outcome("first"), Some(&Outcome::Failed(SinkError::NetworkTimeout)));
        assert_eq!(
            report.outcome("second"),
            Some(&Outcome::Failed(SinkError::Internal("sink panicked: boom".into())))
        );
        assert_eq!(report.outcome("third"), Some(&Outcome::Delivered));
        assert_eq!((report.delivered(), report.failed(), report.skipped()), (1, 2, 0));
        assert_eq!(
            report.outcomes.iter().map(|r| r.sink.as_str()).collect::<Vec<_>>(),
            ["first", "second", "third"]
        );
    }

    #[test]
    fn test_sequence_increments() {
        let mut driver = CycleDriver::new(Fixed(observation()), Duration::from_secs(15));

        assert_eq!(driver.run_cycle().sequence, 1);
        assert_eq!(driver.run_cycle().sequence, 2);
        assert_eq!(driver.cycles(), 2);
        assert_eq!(driver.state(), DriverState::Running);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_during_sleep_closes_sinks() {
        let sink = Counting::new("only", Behaviour::Deliver);
        let (calls, closes) = (sink.calls.clone(), sink.closes.clone());

        let mut driver =
            CycleDriver::new(Fixed(observation()), Duration::from_secs(3600)).with_sink(sink);

        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            TerminationReason::Interrupted
        };
        let started = Instant::now();
        let reason = driver.run(shutdown).await;

        assert!(started.elapsed() < Duration::from_secs(5));

        assert_eq!(reason, TerminationReason::Interrupted);
        assert_eq!(driver.state(), DriverState::Terminating);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runs_cycles_until_shutdown() {
        let sink = Counting::new("only", Behaviour::Fail);
        let (calls, closes) = (sink.calls.clone(), sink.closes.clone());

        let mut driver =
            CycleDriver::new(Fixed(observation()), Duration::from_millis(10)).with_sink(sink);

        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            TerminationReason::Fault("timer".into())
        };
        let reason = driver.run(shutdown).await;

        assert_eq!(reason, TerminationReason::Fault("timer".into()));
        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let sink = Counting::new("only", Behaviour::Deliver);
        let closes = sink.closes.clone();
        let mut driver = CycleDriver::new(Fixed(observation()), Duration::from_secs(15)).with_sink(sink);

        driver.terminate(&TerminationReason::Interrupted);
        driver.terminate(&TerminationReason::Interrupted);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_interrupts_stalled_sink() {
        let stalled = Counting::new("stalled", Behaviour::Stall(Duration::from_secs(2)));
        let later = Counting::new("later", Behaviour::Deliver);
        let stalled_closes = stalled.closes.clone();
        let (later_calls, later_closes) = (later.calls.clone(), later.closes.clone());

        let mut driver = CycleDriver::new(Fixed(observation()), Duration::from_secs(15))
            .with_sink(stalled)
            .with_sink(later)
            .with_shutdown_grace(Duration::from_millis(10));

        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            TerminationReason::Interrupted
        };
        let started = Instant::now();
        let reason = driver.run(shutdown).await;

        assert_eq!(reason, TerminationReason::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
        assert_eq!(driver.state(), DriverState::Terminating);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert_eq!(later_closes.load(Ordering::SeqCst), 1);
        // still inside publish, left alone
        assert_eq!(stalled_closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_waits_for_sink_in_flight() {
        let slow = Counting::new("slow", Behaviour::Stall(Duration::from_millis(200)));
        let later = Counting::new("later", Behaviour::Deliver);
        let (slow_calls, slow_closes) = (slow.calls.clone(), slow.closes.clone());
        let (later_calls, later_closes) = (later.calls.clone(), later.closes.clone());

        let mut driver = CycleDriver::new(Fixed(observation()), Duration::from_secs(15))
            .with_sink(slow)
            .with_sink(later)
            .with_shutdown_grace(Duration::from_secs(10));

        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            TerminationReason::Interrupted
        };
        let reason = driver.run(shutdown).await;

        assert_eq!(reason, TerminationReason::Interrupted);
        assert_eq!(driver.cycles(), 1);
        assert_eq!(slow_calls.load(Ordering::SeqCst), 1);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert_eq!(slow_closes.load(Ordering::SeqCst), 1);
        assert_eq!(later_closes.load(Ordering::SeqCst), 1);
    }
}
