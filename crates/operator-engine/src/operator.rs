//! Operator nodes
//!
//! An [`Operator`] derives one artifact from the artifacts of its upstream
//! operators plus its own parameters. It keeps the last output cached and
//! recomputes only when it is dirty.
//!
//! # Invalidation
//!
//! Each operator carries a monotonically increasing *generation*. Every
//! parameter change, rewiring or upstream invalidation bumps it, marks the
//! operator dirty and synchronously notifies the operator's listeners.
//! Downstream operators subscribe to their upstreams at wiring time, so an
//! edit anywhere in a chain reaches the terminal operator before
//! `invalidate()` returns.
//!
//! # Evaluation
//!
//! [`Operator::get_artifact`] is pull-based. Parameters and the upstream list
//! are snapshotted under the lock together with the generation; the
//! derivation then runs with no lock held, so the owning thread can keep
//! editing parameters while a worker computes. A result is only committed
//! if the generation has not moved in the meantime; otherwise the pull
//! reports [`EngineError::Cancelled`] and the operator stays dirty.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::artifact::{Artifact, FailureInfo, Payload};
use crate::config::EngineConfig;
use crate::error::{panic_message, DeriveError, EngineError, Result};
use crate::params::{ParamSet, ParamValue};
use crate::validation;

static NEXT_OPERATOR_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Identity of an operator: a human-readable label plus a unique serial
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperatorId {
    label: String,
    serial: u64,
}

impl OperatorId {
    fn next(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            serial: NEXT_OPERATOR_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.serial)
    }
}

/// Callback fired when an operator is invalidated
pub type Listener = Arc<dyn Fn(&OperatorId) + Send + Sync>;

/// Handle returned by [`Operator::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of a derivation: `Ok(None)` means it stopped early after
/// noticing it was invalidated
pub type DeriveResult<T> = std::result::Result<Option<Artifact<T>>, DeriveError>;

/// The computation an operator performs
pub trait Derivation<T: Payload>: Send + Sync + 'static {
    fn derive(&self, ctx: &DeriveContext<'_, T>) -> DeriveResult<T>;
}

impl<T, F> Derivation<T> for F
where
    T: Payload,
    F: Fn(&DeriveContext<'_, T>) -> DeriveResult<T> + Send + Sync + 'static,
{
    fn derive(&self, ctx: &DeriveContext<'_, T>) -> DeriveResult<T> {
        self(ctx)
    }
}

/// Cheap, sendable cancellation check for nested algorithms
///
/// Flips to cancelled as soon as the owning operator is invalidated after
/// the evaluation started.
#[derive(Debug, Clone)]
pub struct CancelToken {
    generation: Arc<AtomicU64>,
    snapshot: u64,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.generation.load(Ordering::Acquire) != self.snapshot
    }

    /// Generation the evaluation started from
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }
}

/// Everything a derivation can see during one evaluation
pub struct DeriveContext<'a, T> {
    operator: &'a OperatorId,
    inputs: &'a [Arc<Artifact<T>>],
    params: &'a ParamSet,
    token: CancelToken,
}

impl<'a, T> DeriveContext<'a, T> {
    pub fn operator(&self) -> &OperatorId {
        self.operator
    }

    /// Upstream artifacts, in wiring order
    pub fn inputs(&self) -> &[Arc<Artifact<T>>] {
        self.inputs
    }

    pub fn input(&self, index: usize) -> Option<&Artifact<T>> {
        self.inputs.get(index).map(|a| a.as_ref())
    }

    /// Parameter snapshot taken when the evaluation started
    pub fn params(&self) -> &ParamSet {
        self.params
    }

    /// True once a newer edit has superseded this evaluation
    ///
    /// Long-running derivations should check this once per internal
    /// iteration and return `Ok(None)` when it flips.
    pub fn is_invalidated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }
}

enum Source<T: Payload> {
    Derive(Box<dyn Derivation<T>>),
    Constant,
}

struct Upstream<T: Payload> {
    operator: Operator<T>,
    subscription: SubscriptionId,
}

struct State<T: Payload> {
    params: ParamSet,
    upstream: Vec<Upstream<T>>,
    cached: Option<Arc<Artifact<T>>>,
    /// Shape timestamps of the inputs the cached output was derived from
    input_stamps: Vec<u64>,
    dirty: bool,
    last_error: Option<EngineError>,
    consumed: bool,
}

struct Inner<T: Payload> {
    id: OperatorId,
    source: Source<T>,
    generation: Arc<AtomicU64>,
    state: Mutex<State<T>>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
    verbose_failures: bool,
}

impl<T: Payload> Drop for Inner<T> {
    fn drop(&mut self) {
        for upstream in self.state.get_mut().upstream.drain(..) {
            upstream.operator.unsubscribe(upstream.subscription);
        }
    }
}

/// A node in an operator chain; cloning yields another handle to the same node
pub struct Operator<T: Payload> {
    inner: Arc<Inner<T>>,
}

impl<T: Payload> Clone for Operator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> fmt::Debug for Operator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("id", &self.inner.id)
            .field("generation", &self.generation())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Outcome handed to `commit`
enum Outcome<T> {
    Derived(Artifact<T>),
    Failed(FailureInfo),
}

impl<T: Payload> Operator<T> {
    /// Create an operator from a derivation closure, with no parameters and
    /// no inputs
    ///
    /// Use [`crate::builder::OperatorBuilder`] to declare parameters and wire
    /// inputs in one go.
    pub fn new<F>(label: impl Into<String>, derive: F) -> Self
    where
        F: Fn(&DeriveContext<'_, T>) -> DeriveResult<T> + Send + Sync + 'static,
    {
        Self::from_derivation(label, derive)
    }

    /// Create an operator from any [`Derivation`] implementation
    pub fn from_derivation(label: impl Into<String>, derivation: impl Derivation<T>) -> Self {
        Self::from_parts(
            label,
            Source::Derive(Box::new(derivation)),
            ParamSet::new(),
            &EngineConfig::default(),
            None,
        )
    }

    /// A source operator holding a fixed artifact
    ///
    /// It never fails and never recomputes; [`Operator::replace_artifact`]
    /// swaps its content and invalidates everything downstream.
    pub fn constant(label: impl Into<String>, artifact: Artifact<T>) -> Self {
        Self::from_parts(
            label,
            Source::Constant,
            ParamSet::new(),
            &EngineConfig::default(),
            Some(artifact),
        )
    }

    pub(crate) fn with_derivation(
        label: impl Into<String>,
        derivation: Box<dyn Derivation<T>>,
        params: ParamSet,
        config: &EngineConfig,
    ) -> Self {
        Self::from_parts(label, Source::Derive(derivation), params, config, None)
    }

    fn from_parts(
        label: impl Into<String>,
        source: Source<T>,
        mut params: ParamSet,
        config: &EngineConfig,
        initial: Option<Artifact<T>>,
    ) -> Self {
        params.set_epsilon(config.float_epsilon);
        let dirty = initial.is_none();
        Self {
            inner: Arc::new(Inner {
                id: OperatorId::next(label),
                source,
                generation: Arc::new(AtomicU64::new(0)),
                state: Mutex::new(State {
                    params,
                    upstream: Vec::new(),
                    cached: initial.map(Arc::new),
                    input_stamps: Vec::new(),
                    dirty,
                    last_error: None,
                    consumed: false,
                }),
                listeners: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                verbose_failures: config.verbose_failures,
            }),
        }
    }

    pub fn id(&self) -> &OperatorId {
        &self.inner.id
    }

    /// True if both handles refer to the same node
    pub fn ptr_eq(&self, other: &Operator<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.inner.source, Source::Constant)
    }

    /// Current generation (modification counter)
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.state.lock().dirty
    }

    /// True once the last output was extracted
    pub fn is_consumed(&self) -> bool {
        self.inner.state.lock().consumed
    }

    /// Cached output, without triggering evaluation
    pub fn cached(&self) -> Option<Arc<Artifact<T>>> {
        self.inner.state.lock().cached.clone()
    }

    /// True if `artifact` is the very output this operator has cached
    pub fn caches(&self, artifact: &Arc<Artifact<T>>) -> bool {
        self.inner
            .state
            .lock()
            .cached
            .as_ref()
            .is_some_and(|cached| Arc::ptr_eq(cached, artifact))
    }

    /// Error recorded by the last evaluation, if it produced no artifact
    pub fn last_error(&self) -> Option<EngineError> {
        self.inner.state.lock().last_error.clone()
    }

    /// Token tied to the current generation
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            generation: Arc::clone(&self.inner.generation),
            snapshot: self.generation(),
        }
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// Set a parameter; invalidates only if the value actually changed
    pub fn set_parameter(&self, name: &str, value: impl Into<ParamValue>) -> Result<bool> {
        let changed = self.inner.state.lock().params.set(name, value)?;
        if changed {
            log::trace!("operator {} parameter '{}' changed", self.inner.id, name);
            self.invalidate();
        }
        Ok(changed)
    }

    pub fn parameter(&self, name: &str) -> Option<ParamValue> {
        self.inner.state.lock().params.get(name).cloned()
    }

    /// Snapshot of the whole parameter set
    pub fn params(&self) -> ParamSet {
        self.inner.state.lock().params.clone()
    }

    // ------------------------------------------------------------------
    // Invalidation and listeners
    // ------------------------------------------------------------------

    /// Mark dirty, bump the generation and notify listeners
    pub fn invalidate(&self) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.dirty = !self.is_constant() || state.cached.is_none();
            self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1
        };
        log::trace!(
            "operator {} invalidated (generation {})",
            self.inner.id,
            generation
        );
        self.notify();
    }

    /// Invalidate so that any in-flight evaluation is discarded
    pub fn force_invalidate(&self) {
        self.invalidate();
    }

    fn notify(&self) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&self.inner.id);
        }
    }

    /// Register a listener for invalidation of this operator
    pub fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, listener));
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(sub, _)| *sub != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    // ------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------

    pub fn upstream(&self) -> Vec<Operator<T>> {
        self.inner
            .state
            .lock()
            .upstream
            .iter()
            .map(|u| u.operator.clone())
            .collect()
    }

    /// Replace all inputs with a single input
    pub fn set_input(&self, input: &Operator<T>) -> Result<()> {
        self.set_upstream(vec![input.clone()])
    }

    /// Replace the upstream list
    ///
    /// Unsubscribes from the old inputs, subscribes to the new ones and
    /// invalidates. Fails without changing anything if the new wiring
    /// would form a cycle.
    pub fn set_upstream(&self, upstream: Vec<Operator<T>>) -> Result<()> {
        if self.is_constant() && !upstream.is_empty() {
            return Err(EngineError::InvalidOperation(format!(
                "constant source {} cannot have inputs",
                self.inner.id
            )));
        }
        validation::ensure_acyclic(self, &upstream)?;

        let old = std::mem::take(&mut self.inner.state.lock().upstream);
        for entry in old {
            entry.operator.unsubscribe(entry.subscription);
        }

        let wired: Vec<Upstream<T>> = upstream
            .into_iter()
            .map(|operator| {
                let subscription = operator.subscribe(self.downstream_listener());
                Upstream {
                    operator,
                    subscription,
                }
            })
            .collect();
        self.inner.state.lock().upstream = wired;

        self.invalidate();
        Ok(())
    }

    fn downstream_listener(&self) -> Listener {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Arc::new(move |_source: &OperatorId| {
            if let Some(inner) = weak.upgrade() {
                Operator { inner }.invalidate();
            }
        })
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Return the output, recomputing first if dirty
    ///
    /// Intended for the worker thread. Returns [`EngineError::Cancelled`]
    /// if the operator was invalidated while computing.
    pub fn get_artifact(&self) -> Result<Arc<Artifact<T>>> {
        let (snapshot, params, upstream) = {
            let state = self.inner.state.lock();
            if !state.dirty {
                match (&state.cached, &state.last_error) {
                    (Some(cached), _) if !self.upstream_changed(&state) => {
                        return Ok(Arc::clone(cached));
                    }
                    (None, Some(err)) => return Err(err.clone()),
                    _ => {}
                }
            }
            if self.is_constant() {
                return state.cached.clone().ok_or_else(|| {
                    EngineError::not_ready(format!("constant source {} is empty", self.inner.id))
                });
            }
            (
                self.generation(),
                state.params.clone(),
                state
                    .upstream
                    .iter()
                    .map(|u| u.operator.clone())
                    .collect::<Vec<_>>(),
            )
        };

        let mut inputs = Vec::with_capacity(upstream.len());
        for operator in &upstream {
            match operator.get_artifact() {
                Ok(artifact) => inputs.push(artifact),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => return self.commit_error(snapshot, err),
            }
        }

        // an upstream failure passes through unchanged
        if let Some(info) = inputs.iter().find_map(|a| a.failure()).cloned() {
            log::debug!(
                "operator {} passing through failure from {}",
                self.inner.id,
                info.operator
            );
            return self.commit(snapshot, &inputs, Outcome::Failed(info));
        }

        let Source::Derive(derivation) = &self.inner.source else {
            return Err(EngineError::InvalidOperation(format!(
                "{} has no derivation",
                self.inner.id
            )));
        };
        let ctx = DeriveContext {
            operator: &self.inner.id,
            inputs: &inputs,
            params: &params,
            token: CancelToken {
                generation: Arc::clone(&self.inner.generation),
                snapshot,
            },
        };

        let derived = panic::catch_unwind(AssertUnwindSafe(|| derivation.derive(&ctx)));
        match derived {
            Ok(Ok(Some(artifact))) => self.commit(snapshot, &inputs, Outcome::Derived(artifact)),
            Ok(Ok(None)) if ctx.is_invalidated() => {
                log::debug!("operator {} stopped early", self.inner.id);
                Err(EngineError::Cancelled)
            }
            Ok(Ok(None)) => {
                log::warn!(
                    "operator {} stopped early without being invalidated",
                    self.inner.id
                );
                Err(EngineError::StoppedEarly {
                    operator: self.inner.id.to_string(),
                })
            }
            Ok(Err(err)) => {
                if self.inner.verbose_failures {
                    log::warn!("operator {} derivation failed: {}", self.inner.id, err);
                } else {
                    log::debug!("operator {} derivation failed: {}", self.inner.id, err);
                }
                self.commit(snapshot, &inputs, Outcome::Failed(self.failure_info(err.message)))
            }
            Err(payload) => {
                let message = format!("panicked: {}", panic_message(payload));
                log::warn!("operator {} derivation {}", self.inner.id, message);
                self.commit(snapshot, &inputs, Outcome::Failed(self.failure_info(message)))
            }
        }
    }

    fn failure_info(&self, message: String) -> FailureInfo {
        FailureInfo {
            operator: self.inner.id.to_string(),
            message,
        }
    }

    /// Take ownership of the output, leaving the cache empty
    ///
    /// The operator is marked dirty so the next pull recomputes.
    pub fn extract_artifact(&self) -> Result<Artifact<T>> {
        let artifact = self.get_artifact()?;
        {
            let mut state = self.inner.state.lock();
            state.cached = None;
            state.dirty = !self.is_constant();
            state.consumed = true;
        }
        Arc::try_unwrap(artifact).map_err(|_| EngineError::ArtifactShared)
    }

    /// Drop the cached output without bumping the generation
    ///
    /// Returns false if nothing was cached.
    pub fn discard_cache(&self) -> bool {
        let mut state = self.inner.state.lock();
        let had = state.cached.take().is_some();
        if !self.is_constant() {
            state.dirty = true;
        }
        state.consumed = true;
        had
    }

    /// Swap the content of a constant source and invalidate downstream
    pub fn replace_artifact(&self, artifact: Artifact<T>) -> Result<()> {
        if !self.is_constant() {
            return Err(EngineError::InvalidOperation(format!(
                "{} is not a constant source",
                self.inner.id
            )));
        }
        self.inner.state.lock().cached = Some(Arc::new(artifact));
        self.invalidate();
        Ok(())
    }

    /// True if an upstream cache now holds a different shape than the one
    /// the cached output was derived from
    fn upstream_changed(&self, state: &State<T>) -> bool {
        if state.upstream.len() != state.input_stamps.len() {
            return true;
        }
        state
            .upstream
            .iter()
            .zip(&state.input_stamps)
            .any(|(u, stamp)| match u.operator.cached() {
                Some(current) => current.shape_timestamp() != *stamp,
                None => false,
            })
    }

    fn commit(
        &self,
        snapshot: u64,
        inputs: &[Arc<Artifact<T>>],
        outcome: Outcome<T>,
    ) -> Result<Arc<Artifact<T>>> {
        let mut state = self.inner.state.lock();
        if self.generation() != snapshot {
            return Err(EngineError::Cancelled);
        }

        // build the failure copy before touching any state
        let artifact = match outcome {
            Outcome::Derived(artifact) => Ok(artifact),
            Outcome::Failed(info) => {
                let copy = match inputs.first() {
                    Some(input) => Some(input.failure_copy(info.clone())),
                    None => state
                        .cached
                        .as_ref()
                        .filter(|c| !c.is_failure())
                        .map(|c| c.failure_copy(info.clone())),
                };
                copy.ok_or_else(|| EngineError::derivation(info.operator, info.message))
            }
        };

        state.input_stamps = inputs.iter().map(|a| a.shape_timestamp()).collect();
        state.dirty = false;
        state.consumed = false;

        let artifact = match artifact {
            Ok(artifact) => Arc::new(artifact),
            Err(err) => {
                state.cached = None;
                state.last_error = Some(err.clone());
                return Err(err);
            }
        };
        state.cached = Some(Arc::clone(&artifact));
        state.last_error = None;
        Ok(artifact)
    }

    fn commit_error(&self, snapshot: u64, err: EngineError) -> Result<Arc<Artifact<T>>> {
        let mut state = self.inner.state.lock();
        if self.generation() != snapshot {
            return Err(EngineError::Cancelled);
        }
        state.dirty = false;
        state.cached = None;
        state.input_stamps.clear();
        state.last_error = Some(err.clone());
        Err(err)
    }
}
