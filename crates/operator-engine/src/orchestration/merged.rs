//! One chain over several inputs merged into a single source artifact.

use std::sync::Arc;

use crate::artifact::{Artifact, Payload};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::EventSink;
use crate::operator::Operator;
use crate::scheduler::{ComputeBackend, ComputeScheduler, ComputeStatus};

/// How a merged chain joins its inputs and splits its result
pub trait Combine<T: Payload> {
    /// Join deep copies of the inputs into one artifact
    fn combine(&self, inputs: &[&Artifact<T>]) -> Artifact<T>;

    /// Break a merged result back into per-input pieces
    ///
    /// The default keeps the result whole.
    fn split(&self, combined: Artifact<T>) -> Vec<Artifact<T>> {
        vec![combined]
    }
}

/// Builder for [`MergedChain`]
pub struct MergedChainBuilder<T: Payload> {
    label: String,
    combiner: Box<dyn Combine<T>>,
    force_combine: bool,
    config: EngineConfig,
    events: Option<Arc<dyn EventSink>>,
    backend: ComputeBackend,
}

impl<T: Payload> MergedChainBuilder<T> {
    pub fn new(label: impl Into<String>, combiner: impl Combine<T> + 'static) -> Self {
        Self {
            label: label.into(),
            combiner: Box::new(combiner),
            force_combine: false,
            config: EngineConfig::default(),
            events: None,
            backend: ComputeBackend::Thread,
        }
    }

    /// Run the combiner even for a single input
    pub fn force_combine(mut self, force: bool) -> Self {
        self.force_combine = force;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn backend(mut self, backend: ComputeBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Merge the inputs and build the chain on top of the merged source
    ///
    /// `stages` receives the source operator and returns the terminal.
    pub fn build(
        self,
        inputs: &[&Artifact<T>],
        stages: impl FnOnce(&Operator<T>) -> Result<Operator<T>>,
    ) -> Result<MergedChain<T>> {
        let merged = merge(self.combiner.as_ref(), inputs, self.force_combine)?;
        let source = Operator::constant(format!("{}-input", self.label), merged);
        let terminal = stages(&source)?;

        let mut scheduler = ComputeScheduler::new(terminal)
            .with_label(self.label)
            .with_config(self.config)
            .with_backend(self.backend);
        if let Some(events) = self.events {
            scheduler = scheduler.with_event_sink(events);
        }

        Ok(MergedChain {
            source,
            scheduler,
            combiner: self.combiner,
            force_combine: self.force_combine,
            input_count: inputs.len(),
        })
    }
}

fn merge<T: Payload>(
    combiner: &dyn Combine<T>,
    inputs: &[&Artifact<T>],
    force_combine: bool,
) -> Result<Artifact<T>> {
    match inputs {
        [] => Err(EngineError::InvalidOperation(
            "merged chain needs at least one input".to_string(),
        )),
        [single] if !force_combine => Ok(single.duplicate()),
        _ => Ok(combiner.combine(inputs)),
    }
}

/// A single chain fed by a combination of several inputs
pub struct MergedChain<T: Payload> {
    source: Operator<T>,
    scheduler: ComputeScheduler<T>,
    combiner: Box<dyn Combine<T>>,
    force_combine: bool,
    input_count: usize,
}

impl<T: Payload> MergedChain<T> {
    pub fn builder(label: impl Into<String>, combiner: impl Combine<T> + 'static) -> MergedChainBuilder<T> {
        MergedChainBuilder::new(label, combiner)
    }

    /// The constant operator holding the merged input
    pub fn source(&self) -> &Operator<T> {
        &self.source
    }

    pub fn scheduler(&self) -> &ComputeScheduler<T> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut ComputeScheduler<T> {
        &mut self.scheduler
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    /// Re-merge new inputs into the source; invalidates the chain
    pub fn replace_inputs(&mut self, inputs: &[&Artifact<T>]) -> Result<()> {
        let merged = merge(self.combiner.as_ref(), inputs, self.force_combine)?;
        self.source.replace_artifact(merged)?;
        self.input_count = inputs.len();
        Ok(())
    }

    pub fn check_for_new_result(&mut self) -> ComputeStatus<'_, T> {
        self.scheduler.check_for_new_result()
    }

    pub fn is_computing(&self) -> bool {
        self.scheduler.is_computing()
    }

    pub fn can_apply(&self) -> bool {
        self.scheduler.can_apply()
    }

    pub fn peek(&mut self) -> Option<&Artifact<T>> {
        self.scheduler.peek()
    }

    pub fn extract(&mut self) -> Result<Artifact<T>> {
        self.scheduler.extract()
    }

    /// Extract the result and split it into per-input pieces
    ///
    /// A single input that was not force-combined comes back whole.
    pub fn extract_split(&mut self) -> Result<Vec<Artifact<T>>> {
        let combined = self.scheduler.extract()?;
        if self.input_count > 1 || self.force_combine {
            Ok(self.combiner.split(combined))
        } else {
            Ok(vec![combined])
        }
    }

    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
    }
}
