//! Background compute scheduler and result channel
//!
//! A [`ComputeScheduler`] drives the terminal operator of one chain. The
//! owning thread calls [`ComputeScheduler::check_for_new_result`] once per
//! frame; the call never blocks. When the terminal is dirty and no worker
//! is running, a worker is started that pulls the terminal; its outcome
//! comes back over a per-run `oneshot` channel.
//!
//! Each run remembers the terminal's generation at start. A run that
//! finishes after the chain was edited again is discarded and a fresh run
//! is started in the same poll, so a stale result is never surfaced.
//!
//! The result channel is the hand-off to the consumer: [`peek`] shows the
//! current result and marks it consumed, [`extract`] moves it out once
//! [`can_apply`] holds.
//!
//! [`peek`]: ComputeScheduler::peek
//! [`extract`]: ComputeScheduler::extract
//! [`can_apply`]: ComputeScheduler::can_apply

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot::{self, error::TryRecvError};
use uuid::Uuid;

use crate::artifact::{Artifact, Payload};
use crate::config::EngineConfig;
use crate::error::{panic_message, EngineError, Result};
use crate::events::{EngineEvent, EventSink, NullEventSink};
use crate::operator::Operator;

/// Where background runs execute
#[derive(Debug, Clone, Default)]
pub enum ComputeBackend {
    /// A dedicated named OS thread per run
    #[default]
    Thread,
    /// The blocking pool of a tokio runtime
    Tokio(Handle),
}

/// Coarse state of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Computing,
    Ready,
    Failed,
}

/// What a single poll observed
#[derive(Debug)]
pub enum ComputeStatus<'a, T> {
    /// Nothing new since the last poll
    Idle,
    /// A worker is running
    Computing,
    /// A fresh result, surfaced once
    Ready(&'a Artifact<T>),
    /// A run failed; `fallback` is the failure artifact or the last result
    Failed {
        error: &'a EngineError,
        fallback: Option<&'a Artifact<T>>,
    },
}

impl<'a, T> ComputeStatus<'a, T> {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_computing(&self) -> bool {
        matches!(self, Self::Computing)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// The artifact carried by a Ready or Failed status
    pub fn artifact(&self) -> Option<&'a Artifact<T>> {
        match self {
            Self::Ready(artifact) => Some(artifact),
            Self::Failed { fallback, .. } => *fallback,
            _ => None,
        }
    }
}

/// What the worker sends back
struct RunReport<T> {
    /// `Err` carries the panic message
    outcome: std::result::Result<Result<Arc<Artifact<T>>>, String>,
    elapsed: Duration,
}

struct ActiveRun<T> {
    id: Uuid,
    snapshot: u64,
    receiver: oneshot::Receiver<RunReport<T>>,
}

/// Owned form of a status, resolved into a borrowed [`ComputeStatus`]
enum Signal {
    Idle,
    Computing,
    Ready,
    Failed,
}

/// Outcome of handling a finished run
enum Finish {
    Surface(Signal),
    Restart,
}

/// Runs one chain's terminal operator in the background
pub struct ComputeScheduler<T: Payload> {
    terminal: Operator<T>,
    label: String,
    config: EngineConfig,
    events: Arc<dyn EventSink>,
    backend: ComputeBackend,
    run: Option<ActiveRun<T>>,
    state: RunState,
    result: Option<Arc<Artifact<T>>>,
    error: Option<EngineError>,
    result_consumed: bool,
    result_timestamp: Option<u64>,
    background_fault: Option<EngineError>,
    /// Generation whose run faulted; not retried until the chain moves on
    faulted_generation: Option<u64>,
    shut_down: bool,
}

impl<T: Payload> ComputeScheduler<T> {
    pub fn new(terminal: Operator<T>) -> Self {
        let label = terminal.id().label().to_string();
        Self {
            terminal,
            label,
            config: EngineConfig::default(),
            events: Arc::new(NullEventSink),
            backend: ComputeBackend::Thread,
            run: None,
            state: RunState::Idle,
            result: None,
            error: None,
            result_consumed: false,
            result_timestamp: None,
            background_fault: None,
            faulted_generation: None,
            shut_down: false,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_backend(mut self, backend: ComputeBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Label used in events, logs and worker thread names
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn terminal(&self) -> &Operator<T> {
        &self.terminal
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_computing(&self) -> bool {
        self.run.is_some()
    }

    pub fn result_consumed(&self) -> bool {
        self.result_consumed
    }

    /// Generation the current result was computed from
    pub fn result_timestamp(&self) -> Option<u64> {
        self.result_timestamp
    }

    /// Error of the last failed run
    pub fn error(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// True when the current result may be extracted
    pub fn can_apply(&self) -> bool {
        !self.is_computing()
            && self.state == RunState::Ready
            && self.result_consumed
            && self.result.as_ref().is_some_and(|r| !r.is_failure())
    }

    /// True when [`extract`](Self::extract) would hand out the result
    ///
    /// On top of [`can_apply`](Self::can_apply), nothing besides this
    /// scheduler and the terminal's cache may hold the artifact.
    pub fn can_extract(&self) -> bool {
        if self.shut_down || !self.can_apply() {
            return false;
        }
        self.result.as_ref().is_some_and(|result| {
            let cached_by_terminal = self.terminal.caches(result);
            Arc::strong_count(result) == 1 + usize::from(cached_by_terminal)
        })
    }

    /// Poll the chain; never blocks
    pub fn check_for_new_result(&mut self) -> ComputeStatus<'_, T> {
        match self.advance() {
            Signal::Idle => ComputeStatus::Idle,
            Signal::Computing => ComputeStatus::Computing,
            Signal::Ready => match self.result.as_deref() {
                Some(artifact) => ComputeStatus::Ready(artifact),
                None => ComputeStatus::Idle,
            },
            Signal::Failed => match &self.error {
                Some(error) => ComputeStatus::Failed {
                    error,
                    fallback: self.result.as_deref(),
                },
                None => ComputeStatus::Idle,
            },
        }
    }

    fn advance(&mut self) -> Signal {
        let report = match self.run.as_mut() {
            None => None,
            Some(run) => match run.receiver.try_recv() {
                Ok(report) => Some(Some(report)),
                Err(TryRecvError::Empty) => return Signal::Computing,
                Err(TryRecvError::Closed) => Some(None),
            },
        };

        if let (Some(report), Some(run)) = (report, self.run.take()) {
            match self.finish(run, report) {
                Finish::Surface(signal) => return signal,
                Finish::Restart => return self.start_run(),
            }
        }

        if self.shut_down {
            return Signal::Idle;
        }
        let generation = self.terminal.generation();
        if !self.terminal.is_dirty() || self.faulted_generation == Some(generation) {
            return Signal::Idle;
        }
        self.start_run()
    }

    fn finish(&mut self, run: ActiveRun<T>, report: Option<RunReport<T>>) -> Finish {
        if self.shut_down {
            log::debug!(
                "chain '{}' dropped run {} after shutdown",
                self.label,
                run.id
            );
            self.state = RunState::Idle;
            return Finish::Surface(Signal::Idle);
        }

        let current = self.terminal.generation();
        let stale = current != run.snapshot;

        let Some(report) = report else {
            return self.record_fault(&run, "worker exited without reporting".to_string(), stale);
        };
        self.warn_if_slow(&run, report.elapsed);

        let result = match report.outcome {
            Ok(result) => result,
            Err(message) => return self.record_fault(&run, message, stale),
        };

        if stale {
            log::debug!(
                "chain '{}' discarding run {} (generation {} superseded by {})",
                self.label,
                run.id,
                run.snapshot,
                current
            );
            self.emit(EngineEvent::ComputeDiscarded {
                chain: self.label.clone(),
                run_id: run.id.to_string(),
                snapshot: run.snapshot,
                current,
            });
            return Finish::Restart;
        }

        match result {
            Ok(artifact) => {
                let failed = artifact.is_failure();
                self.error = artifact
                    .failure()
                    .map(|info| EngineError::derivation(&info.operator, &info.message));
                self.result = Some(artifact);
                self.result_consumed = false;
                self.result_timestamp = Some(run.snapshot);
                self.faulted_generation = None;
                self.state = if failed {
                    RunState::Failed
                } else {
                    RunState::Ready
                };
                log::debug!(
                    "chain '{}' run {} finished in {:?}{}",
                    self.label,
                    run.id,
                    report.elapsed,
                    if failed { " with failure artifact" } else { "" }
                );
                self.emit(EngineEvent::ComputeCompleted {
                    chain: self.label.clone(),
                    run_id: run.id.to_string(),
                    elapsed_ms: duration_ms(report.elapsed),
                    failed,
                });
                Finish::Surface(if failed { Signal::Failed } else { Signal::Ready })
            }
            Err(err) => {
                log::debug!("chain '{}' run {} failed: {}", self.label, run.id, err);
                self.emit(EngineEvent::ComputeFailed {
                    chain: self.label.clone(),
                    run_id: run.id.to_string(),
                    error: err.to_string(),
                });
                self.fail(run.snapshot, err);
                Finish::Surface(Signal::Failed)
            }
        }
    }

    fn record_fault(&mut self, run: &ActiveRun<T>, message: String, stale: bool) -> Finish {
        log::debug!(
            "chain '{}' run {} faulted: {}",
            self.label,
            run.id,
            message
        );
        self.emit(EngineEvent::BackgroundFault {
            chain: self.label.clone(),
            run_id: run.id.to_string(),
            message: message.clone(),
        });
        let fault = EngineError::BackgroundFault(message);
        self.background_fault = Some(fault.clone());
        if stale {
            return Finish::Restart;
        }
        self.fail(run.snapshot, fault);
        Finish::Surface(Signal::Failed)
    }

    /// Enter Failed, keeping the previous result as fallback
    fn fail(&mut self, generation: u64, err: EngineError) {
        self.state = RunState::Failed;
        self.error = Some(err);
        self.result_consumed = false;
        self.faulted_generation = Some(generation);
    }

    fn warn_if_slow(&self, run: &ActiveRun<T>, elapsed: Duration) {
        if let Some(limit) = self.config.slow_run_warn_ms {
            let elapsed_ms = duration_ms(elapsed);
            if elapsed_ms > limit {
                log::warn!(
                    "chain '{}' run {} took {}ms (limit {}ms)",
                    self.label,
                    run.id,
                    elapsed_ms,
                    limit
                );
            }
        }
    }

    fn start_run(&mut self) -> Signal {
        if self.shut_down {
            return Signal::Idle;
        }
        let snapshot = self.terminal.generation();
        match self.spawn_worker(snapshot) {
            Ok(receiver) => {
                let id = Uuid::new_v4();
                log::debug!(
                    "chain '{}' starting run {} at generation {}",
                    self.label,
                    id,
                    snapshot
                );
                self.emit(EngineEvent::ComputeStarted {
                    chain: self.label.clone(),
                    run_id: id.to_string(),
                    snapshot,
                });
                self.run = Some(ActiveRun {
                    id,
                    snapshot,
                    receiver,
                });
                self.state = RunState::Computing;
                Signal::Computing
            }
            Err(err) => {
                log::error!("chain '{}' could not start a run: {}", self.label, err);
                self.fail(snapshot, err);
                Signal::Failed
            }
        }
    }

    fn spawn_worker(&self, snapshot: u64) -> Result<oneshot::Receiver<RunReport<T>>> {
        let (sender, receiver) = oneshot::channel();
        let terminal = self.terminal.clone();
        let job = move || {
            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| terminal.get_artifact()))
                .map_err(panic_message);
            log::trace!(
                "worker for {} finished generation {} pull",
                terminal.id(),
                snapshot
            );
            let _ = sender.send(RunReport {
                outcome,
                elapsed: started.elapsed(),
            });
        };

        match &self.backend {
            ComputeBackend::Thread => {
                let name = format!("{}-{}", self.config.thread_name_prefix, self.label);
                thread::Builder::new()
                    .name(name)
                    .spawn(job)
                    .map_err(|e| EngineError::Spawn(e.to_string()))?;
            }
            ComputeBackend::Tokio(handle) => {
                handle.spawn_blocking(job);
            }
        }
        Ok(receiver)
    }

    // ------------------------------------------------------------------
    // Result channel
    // ------------------------------------------------------------------

    /// Show the current result and mark it consumed
    ///
    /// Returns the failure artifact while Failed. Repeated calls return the
    /// same artifact and never recompute.
    pub fn peek(&mut self) -> Option<&Artifact<T>> {
        if !matches!(self.state, RunState::Ready | RunState::Failed) {
            return None;
        }
        let artifact = self.result.as_deref()?;
        self.result_consumed = true;
        Some(artifact)
    }

    /// Last result for degraded display, without consuming it
    pub fn fallback(&self) -> Option<&Artifact<T>> {
        self.result.as_deref()
    }

    /// Take ownership of the current result
    ///
    /// Only valid when [`can_apply`](Self::can_apply) holds. The terminal's
    /// cache is dropped as well, so the next poll recomputes.
    pub fn extract(&mut self) -> Result<Artifact<T>> {
        if self.shut_down {
            return Err(EngineError::ShutDown);
        }
        if !self.can_apply() {
            let reason = if self.is_computing() {
                "a computation is in flight"
            } else if self.state != RunState::Ready {
                "no ready result"
            } else if !self.result_consumed {
                "the current result has not been consumed"
            } else {
                "the result is a failure artifact"
            };
            return Err(EngineError::not_ready(reason));
        }
        if !self.can_extract() {
            return Err(EngineError::ArtifactShared);
        }

        self.terminal.discard_cache();
        let Some(shared) = self.result.take() else {
            return Err(EngineError::not_ready("no ready result"));
        };
        match Arc::try_unwrap(shared) {
            Ok(artifact) => {
                self.state = RunState::Idle;
                self.result_timestamp = None;
                log::debug!("chain '{}' result extracted", self.label);
                self.emit(EngineEvent::ResultExtracted {
                    chain: self.label.clone(),
                });
                Ok(artifact)
            }
            Err(shared) => {
                self.result = Some(shared);
                Err(EngineError::ArtifactShared)
            }
        }
    }

    /// Drain the fault left by a panicking or vanished worker
    pub fn extract_background_exception(&mut self) -> Option<EngineError> {
        self.background_fault.take()
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Invalidate the chain and stop scheduling
    ///
    /// An in-flight worker is not interrupted; its result is dropped when
    /// it reports.
    pub fn force_invalidate(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.terminal.force_invalidate();
        if self.run.is_none() {
            self.state = RunState::Idle;
        }
        log::debug!("chain '{}' shut down", self.label);
        self.emit(EngineEvent::ChainShutdown {
            chain: self.label.clone(),
        });
    }

    pub fn shutdown(&mut self) {
        self.force_invalidate();
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.events.send(event) {
            log::debug!("chain '{}' event not delivered: {}", self.label, e);
        }
    }
}

impl<T: Payload> Drop for ComputeScheduler<T> {
    fn drop(&mut self) {
        if self.run.is_some() && !self.shut_down {
            self.terminal.force_invalidate();
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::builder::OperatorBuilder;
    use crate::error::DeriveError;
    use crate::events::VecEventSink;
    use crate::operator::DeriveContext;
    use crate::params::ParamSpec;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Poll until the scheduler stops reporting Computing
    fn settle<T: Payload>(scheduler: &mut ComputeScheduler<T>) -> RunState {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let computing = scheduler.check_for_new_result().is_computing();
            if !computing {
                return scheduler.state();
            }
            assert!(Instant::now() < deadline, "scheduler did not settle");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn scaled_chain(calls: Arc<AtomicUsize>) -> (Operator<f64>, Operator<f64>) {
        let source = Operator::constant("source", Artifact::new(2.0));
        let op = OperatorBuilder::new("scale", move |ctx: &DeriveContext<'_, f64>| {
            calls.fetch_add(1, Ordering::SeqCst);
            let factor = ctx.params().float("factor").unwrap_or(1.0);
            let input = ctx.input(0).ok_or("missing input")?;
            Ok(Some(Artifact::new(input.payload() * factor)))
        })
        .param(ParamSpec::float("factor", 3.0))
        .input(&source)
        .build()
        .unwrap();
        (source, op)
    }

    #[test]
    fn test_first_poll_starts_and_result_surfaces_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_source, op) = scaled_chain(calls.clone());
        let sink = Arc::new(VecEventSink::new());
        let mut scheduler = ComputeScheduler::new(op).with_event_sink(sink.clone());

        assert_eq!(scheduler.state(), RunState::Idle);
        assert!(scheduler.check_for_new_result().is_computing());
        assert!(scheduler.is_computing());

        let deadline = Instant::now() + TIMEOUT;
        let value = loop {
            if let ComputeStatus::Ready(artifact) = scheduler.check_for_new_result() {
                break *artifact.payload();
            }
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(2));
        };
        assert_eq!(value, 6.0);
        assert!(!scheduler.result_consumed());
        assert!(scheduler.result_timestamp().is_some());

        // surfaced once, state stays Ready
        assert!(scheduler.check_for_new_result().is_idle());
        assert_eq!(scheduler.state(), RunState::Ready);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let events = sink.events();
        assert!(matches!(events[0], EngineEvent::ComputeStarted { .. }));
        assert!(matches!(
            events[1],
            EngineEvent::ComputeCompleted { failed: false, .. }
        ));
    }

    #[test]
    fn test_peek_gates_extract() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_source, op) = scaled_chain(calls.clone());
        let mut scheduler = ComputeScheduler::new(op);
        assert_eq!(settle(&mut scheduler), RunState::Ready);

        assert!(!scheduler.can_apply());
        assert!(matches!(scheduler.extract(), Err(EngineError::NotReady(_))));

        let first = scheduler.peek().map(|a| a as *const Artifact<f64>);
        let second = scheduler.peek().map(|a| a as *const Artifact<f64>);
        assert_eq!(first, second);
        assert!(scheduler.can_apply());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let owned = scheduler.extract().unwrap();
        assert_eq!(owned.into_payload(), 6.0);
        assert_eq!(scheduler.state(), RunState::Idle);
        assert!(scheduler.peek().is_none());

        // cache is gone, so the next poll recomputes
        assert!(scheduler.check_for_new_result().is_computing());
        assert_eq!(settle(&mut scheduler), RunState::Ready);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_edit_after_ready_recomputes() {
        let (_source, op) = scaled_chain(Arc::new(AtomicUsize::new(0)));
        let mut scheduler = ComputeScheduler::new(op.clone());
        settle(&mut scheduler);
        scheduler.peek();

        op.set_parameter("factor", 5.0).unwrap();
        assert!(scheduler.check_for_new_result().is_computing());
        assert!(!scheduler.can_apply());
        // the previous result stays available for display
        assert_eq!(*scheduler.fallback().unwrap().payload(), 6.0);

        assert_eq!(settle(&mut scheduler), RunState::Ready);
        assert_eq!(*scheduler.peek().unwrap().payload(), 10.0);
    }

    #[test]
    fn test_failure_artifact_then_recovery() {
        let source = Operator::constant("source", Artifact::new(1.0));
        let op = OperatorBuilder::new("checked", |ctx: &DeriveContext<'_, f64>| {
            if ctx.params().bool("fail").unwrap_or(false) {
                return Err(DeriveError::new("degenerate input"));
            }
            Ok(Some(Artifact::new(ctx.input(0).map_or(0.0, |a| *a.payload()) + 1.0)))
        })
        .param(ParamSpec::bool("fail", true))
        .input(&source)
        .build()
        .unwrap();
        let mut scheduler = ComputeScheduler::new(op.clone());

        assert_eq!(settle(&mut scheduler), RunState::Failed);
        assert!(matches!(
            scheduler.error(),
            Some(EngineError::Derivation { .. })
        ));
        let fallback = scheduler.peek().unwrap();
        assert!(fallback.is_failure());
        assert_eq!(*fallback.payload(), 1.0);
        assert!(!scheduler.can_apply());

        op.set_parameter("fail", false).unwrap();
        assert_eq!(settle(&mut scheduler), RunState::Ready);
        assert_eq!(*scheduler.peek().unwrap().payload(), 2.0);
        assert!(scheduler.can_apply());
    }

    #[test]
    fn test_panicking_derivation_yields_failure_artifact() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in = attempts.clone();
        let source = Operator::constant("source", Artifact::new(vec![4u32]));
        let op = OperatorBuilder::new("explode", move |ctx: &DeriveContext<'_, Vec<u32>>| {
            attempts_in.fetch_add(1, Ordering::SeqCst);
            let input = ctx.input(0).ok_or("missing input")?;
            let fan = input.payload()[3];
            Ok(Some(Artifact::new(vec![fan])))
        })
        .input(&source)
        .build()
        .unwrap();
        let mut scheduler = ComputeScheduler::new(op.clone());

        assert_eq!(settle(&mut scheduler), RunState::Failed);
        match scheduler.error() {
            Some(EngineError::Derivation { operator, message }) => {
                assert!(operator.starts_with("explode#"));
                assert!(message.contains("index out of bounds"));
            }
            other => panic!("expected derivation error, got {:?}", other),
        }
        let fallback = scheduler.fallback().unwrap();
        assert!(fallback.is_failure());
        assert_eq!(fallback.payload(), &vec![4]);
        assert!(scheduler.extract_background_exception().is_none());

        for _ in 0..5 {
            assert!(scheduler.check_for_new_result().is_idle());
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        source.replace_artifact(Artifact::new(vec![1, 2, 3, 9])).unwrap();
        assert_eq!(settle(&mut scheduler), RunState::Ready);
        assert_eq!(scheduler.peek().unwrap().payload(), &vec![9]);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    /// Payload whose clone panics while `shatter` is set
    struct Brittle {
        value: u32,
        shatter: Arc<AtomicBool>,
    }

    impl Clone for Brittle {
        fn clone(&self) -> Self {
            if self.shatter.load(Ordering::SeqCst) {
                panic!("cloned a shattered payload");
            }
            Self {
                value: self.value,
                shatter: self.shatter.clone(),
            }
        }
    }

    #[test]
    fn test_fault_outside_derivation_is_captured_and_not_retried() {
        let shatter = Arc::new(AtomicBool::new(true));
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in = attempts.clone();
        let source = Operator::constant(
            "source",
            Artifact::new(Brittle {
                value: 3,
                shatter: shatter.clone(),
            }),
        );
        // failing forces a copy of the input, which panics in the worker
        let op = OperatorBuilder::new("reject", move |_ctx: &DeriveContext<'_, Brittle>| {
            attempts_in.fetch_add(1, Ordering::SeqCst);
            Err(DeriveError::new("rejected"))
        })
        .input(&source)
        .build()
        .unwrap();
        let sink = Arc::new(VecEventSink::new());
        let mut scheduler = ComputeScheduler::new(op.clone()).with_event_sink(sink.clone());

        assert_eq!(settle(&mut scheduler), RunState::Failed);
        assert!(matches!(
            scheduler.error(),
            Some(EngineError::BackgroundFault(_))
        ));
        assert!(scheduler.fallback().is_none());
        for _ in 0..5 {
            assert!(scheduler.check_for_new_result().is_idle());
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, EngineEvent::BackgroundFault { .. })));

        match scheduler.extract_background_exception() {
            Some(EngineError::BackgroundFault(message)) => {
                assert!(message.contains("shattered"))
            }
            other => panic!("expected fault, got {:?}", other),
        }
        assert!(scheduler.extract_background_exception().is_none());

        shatter.store(false, Ordering::SeqCst);
        op.invalidate();
        assert_eq!(settle(&mut scheduler), RunState::Failed);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let fallback = scheduler.peek().unwrap();
        assert!(fallback.is_failure());
        assert_eq!(fallback.payload().value, 3);
    }

    #[test]
    fn test_hard_error_keeps_previous_result_as_fallback() {
        let (_source, op) = scaled_chain(Arc::new(AtomicUsize::new(0)));
        let mut scheduler = ComputeScheduler::new(op.clone());
        assert_eq!(settle(&mut scheduler), RunState::Ready);
        scheduler.peek();

        // a source that never produced anything has no failure copy to offer
        let broken: Operator<f64> = Operator::new("broken", |_ctx: &DeriveContext<'_, f64>| {
            Err(DeriveError::new("no seed"))
        });
        op.set_input(&broken).unwrap();

        assert_eq!(settle(&mut scheduler), RunState::Failed);
        match scheduler.error() {
            Some(EngineError::Derivation { operator, .. }) => {
                assert!(operator.starts_with("broken#"))
            }
            other => panic!("expected derivation error, got {:?}", other),
        }
        let fallback = scheduler.fallback().unwrap();
        assert!(!fallback.is_failure());
        assert_eq!(*fallback.payload(), 6.0);
        assert!(!scheduler.can_apply());
        assert!(matches!(scheduler.extract(), Err(EngineError::NotReady(_))));
        assert!(scheduler.check_for_new_result().is_idle());
    }

    #[test]
    fn test_early_exit_without_edit_is_reported() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in = attempts.clone();
        let op: Operator<u8> = Operator::new("quitter", move |_ctx: &DeriveContext<'_, u8>| {
            attempts_in.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });
        let mut scheduler = ComputeScheduler::new(op);

        assert_eq!(settle(&mut scheduler), RunState::Failed);
        match scheduler.error() {
            Some(err @ EngineError::StoppedEarly { .. }) => {
                assert!(!err.is_cancelled());
                assert!(err.to_string().contains("without being invalidated"));
            }
            other => panic!("expected early-exit error, got {:?}", other),
        }
        assert!(scheduler.check_for_new_result().is_idle());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_result_is_not_extracted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_source, op) = scaled_chain(calls.clone());
        let mut scheduler = ComputeScheduler::new(op.clone());
        settle(&mut scheduler);
        scheduler.peek();
        assert!(scheduler.can_extract());

        let held = op.cached().unwrap();
        assert!(scheduler.can_apply());
        assert!(!scheduler.can_extract());
        assert_eq!(scheduler.extract().unwrap_err(), EngineError::ArtifactShared);

        // nothing was disturbed
        assert_eq!(scheduler.state(), RunState::Ready);
        assert!(!op.is_dirty());
        assert!(scheduler.check_for_new_result().is_idle());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(held);
        assert_eq!(scheduler.extract().unwrap().into_payload(), 6.0);
    }

    #[test]
    fn test_shutdown_drops_in_flight_result() {
        let release = Arc::new(AtomicBool::new(false));
        let release_in = release.clone();
        let source = Operator::constant("source", Artifact::new(1u32));
        let op = OperatorBuilder::new("slow", move |_ctx: &DeriveContext<'_, u32>| {
            while !release_in.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(Some(Artifact::new(7)))
        })
        .input(&source)
        .build()
        .unwrap();
        let sink = Arc::new(VecEventSink::new());
        let mut scheduler = ComputeScheduler::new(op).with_event_sink(sink.clone());

        assert!(scheduler.check_for_new_result().is_computing());
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        release.store(true, Ordering::SeqCst);

        assert_eq!(settle(&mut scheduler), RunState::Idle);
        assert!(scheduler.peek().is_none());
        assert_eq!(scheduler.extract().unwrap_err(), EngineError::ShutDown);
        assert!(!scheduler.is_computing());
        assert!(sink
            .events()
            .iter()
            .all(|e| !matches!(e, EngineEvent::ComputeCompleted { .. })));
    }

    #[test]
    fn test_worker_thread_is_named() {
        let name = Arc::new(parking_lot::Mutex::new(None));
        let name_in = name.clone();
        let op: Operator<u8> = Operator::new("mesher", move |_ctx: &DeriveContext<'_, u8>| {
            *name_in.lock() = thread::current().name().map(str::to_string);
            Ok(Some(Artifact::new(1)))
        });
        let config = EngineConfig::default().with_thread_name_prefix("tool");
        let mut scheduler = ComputeScheduler::new(op).with_config(config);

        assert_eq!(settle(&mut scheduler), RunState::Ready);
        assert_eq!(name.lock().as_deref(), Some("tool-mesher"));
    }
}
