//! Fluent builders for operators and linear chains
//!
//! # Example
//!
//! ```ignore
//! let source = Operator::constant("input", Artifact::new(mesh));
//! let chain = ChainBuilder::new(source)
//!     .then(
//!         OperatorBuilder::new("supports", generate_supports)
//!             .param(ParamSpec::float("overhang_angle", 30.0).with_range(0.0, 90.0)),
//!     )
//!     .then(OperatorBuilder::new("reduce", reduce).param(ParamSpec::float("edge_length", 2.4)))
//!     .build()?;
//! let scheduler = ComputeScheduler::new(chain.terminal().clone());
//! ```

use crate::artifact::Payload;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::operator::{DeriveContext, DeriveResult, Derivation, Operator};
use crate::params::{ParamSet, ParamSpec, ParamValue};

/// Fluent builder for a single operator
pub struct OperatorBuilder<T: Payload> {
    label: String,
    derivation: Box<dyn Derivation<T>>,
    params: Vec<ParamSpec>,
    values: Vec<(String, ParamValue)>,
    inputs: Vec<Operator<T>>,
    config: Option<EngineConfig>,
}

impl<T: Payload> OperatorBuilder<T> {
    /// Start a builder from a derivation closure
    pub fn new<F>(label: impl Into<String>, derive: F) -> Self
    where
        F: Fn(&DeriveContext<'_, T>) -> DeriveResult<T> + Send + Sync + 'static,
    {
        Self::from_derivation(label, derive)
    }

    /// Start a builder from any [`Derivation`] implementation
    pub fn from_derivation(label: impl Into<String>, derivation: impl Derivation<T>) -> Self {
        Self {
            label: label.into(),
            derivation: Box::new(derivation),
            params: Vec::new(),
            values: Vec::new(),
            inputs: Vec::new(),
            config: None,
        }
    }

    /// Declare a parameter
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Set an initial value for a declared parameter
    pub fn value(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.values.push((name.into(), value.into()));
        self
    }

    /// Append an input operator
    pub fn input(mut self, input: &Operator<T>) -> Self {
        self.inputs.push(input.clone());
        self
    }

    /// Append several input operators
    pub fn inputs<'a>(mut self, inputs: impl IntoIterator<Item = &'a Operator<T>>) -> Self {
        self.inputs.extend(inputs.into_iter().cloned());
        self
    }

    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.config = Some(config.clone());
        self
    }

    /// Build the operator, declaring parameters and wiring inputs
    pub fn build(self) -> Result<Operator<T>> {
        let mut params = ParamSet::new();
        for spec in self.params {
            params.declare(spec)?;
        }
        for (name, value) in self.values {
            params.set(&name, value)?;
        }

        let config = self.config.unwrap_or_default();
        let operator = Operator::with_derivation(self.label, self.derivation, params, &config);
        if !self.inputs.is_empty() {
            operator.set_upstream(self.inputs)?;
        }
        Ok(operator)
    }
}

/// A linear chain of operators, source first
#[derive(Debug, Clone)]
pub struct Chain<T: Payload> {
    operators: Vec<Operator<T>>,
}

impl<T: Payload> Chain<T> {
    pub fn source(&self) -> &Operator<T> {
        &self.operators[0]
    }

    /// The operator whose output is the chain's result
    pub fn terminal(&self) -> &Operator<T> {
        &self.operators[self.operators.len() - 1]
    }

    pub fn get(&self, index: usize) -> Option<&Operator<T>> {
        self.operators.get(index)
    }

    /// First operator with the given label
    pub fn find(&self, label: &str) -> Option<&Operator<T>> {
        self.operators.iter().find(|op| op.id().label() == label)
    }

    pub fn operators(&self) -> &[Operator<T>] {
        &self.operators
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

/// Builds a linear chain where each stage takes the previous one as input
pub struct ChainBuilder<T: Payload> {
    source: Operator<T>,
    stages: Vec<OperatorBuilder<T>>,
    config: Option<EngineConfig>,
}

impl<T: Payload> ChainBuilder<T> {
    pub fn new(source: Operator<T>) -> Self {
        Self {
            source,
            stages: Vec::new(),
            config: None,
        }
    }

    /// Apply this config to every stage that does not set its own
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.config = Some(config.clone());
        self
    }

    /// Append a stage fed by the previous one
    pub fn then(mut self, stage: OperatorBuilder<T>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<Chain<T>> {
        let mut operators = vec![self.source];
        for mut stage in self.stages {
            if stage.config.is_none() {
                stage.config = self.config.clone();
            }
            let previous = &operators[operators.len() - 1];
            let operator = stage.input(previous).build()?;
            operators.push(operator);
        }
        Ok(Chain { operators })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Artifact;
    use crate::error::{EngineError, ParamError};

    fn scale(ctx: &DeriveContext<'_, f64>) -> DeriveResult<f64> {
        let factor = ctx.params().float("factor").unwrap_or(1.0);
        let input = ctx.input(0).ok_or("missing input")?;
        Ok(Some(Artifact::new(input.payload() * factor)))
    }

    #[test]
    fn test_chain_wires_stages_in_order() {
        let chain = ChainBuilder::new(Operator::constant("input", Artifact::new(2.0)))
            .then(
                OperatorBuilder::new("double", scale)
                    .param(ParamSpec::float("factor", 1.0))
                    .value("factor", 2.0),
            )
            .then(OperatorBuilder::new("triple", scale).param(ParamSpec::float("factor", 3.0)))
            .build()
            .unwrap();

        assert_eq!(chain.len(), 3);
        assert!(chain.get(1).unwrap().upstream()[0].ptr_eq(chain.source()));
        assert!(chain.terminal().upstream()[0].ptr_eq(chain.find("double").unwrap()));
        assert_eq!(*chain.terminal().get_artifact().unwrap().payload(), 12.0);
    }

    #[test]
    fn test_build_rejects_bad_initial_value() {
        let err = OperatorBuilder::new("double", scale)
            .param(ParamSpec::float("factor", 1.0).with_range(0.0, 4.0).strict())
            .value("factor", 10.0)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Param(ParamError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_chain_config_applies_epsilon() {
        let config = EngineConfig::default().with_float_epsilon(0.5);
        let chain = ChainBuilder::new(Operator::constant("input", Artifact::new(1.0)))
            .config(&config)
            .then(OperatorBuilder::new("scale", scale).param(ParamSpec::float("factor", 1.0)))
            .build()
            .unwrap();

        let op = chain.terminal();
        assert!(!op.set_parameter("factor", 1.25).unwrap());
        assert!(op.set_parameter("factor", 2.0).unwrap());
    }
}
