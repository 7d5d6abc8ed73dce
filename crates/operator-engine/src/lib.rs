//! Operator Engine - incremental operator chains with background compute
//!
//! This crate provides a pull-based, cached operator graph whose terminal
//! output is recomputed off the owning thread whenever a parameter or input
//! upstream changes. It supports:
//!
//! - Dirty propagation through explicit invalidation listeners
//! - Generation-stamped background runs that never surface stale results
//! - Cooperative cancellation checked by long-running derivations
//! - Failure artifacts that keep a chain usable after a derivation fails
//! - Single-consumer result ownership (peek vs. extract)
//!
//! # Architecture
//!
//! - `Operator`: a cached node deriving one artifact from its inputs
//! - `ComputeScheduler`: polls one chain, runs its terminal on a worker
//! - `ChainSet` / `MergedChain`: drive several chains from one frame loop
//! - `EventSink`: generic event streaming (not tied to any UI)
//!
//! # Example
//!
//! ```ignore
//! use operator_engine::{Artifact, ComputeScheduler, ComputeStatus, Operator, OperatorBuilder, ParamSpec};
//!
//! let input = Operator::constant("input", Artifact::new(mesh));
//! let offset = OperatorBuilder::new("offset", offset_mesh)
//!     .param(ParamSpec::float("distance", 1.0).with_range(0.0, 100.0))
//!     .input(&input)
//!     .build()?;
//!
//! let mut scheduler = ComputeScheduler::new(offset.clone());
//! // once per frame
//! if let ComputeStatus::Ready(artifact) = scheduler.check_for_new_result() {
//!     preview.show(artifact.payload());
//! }
//! ```

pub mod artifact;
pub mod builder;
pub mod config;
pub mod error;
pub mod events;
pub mod operator;
pub mod orchestration;
pub mod params;
pub mod scheduler;
pub mod validation;

// Re-export key types
pub use artifact::{keys, Artifact, FailureInfo, Metadata, Payload, ShapeCache};
pub use builder::{Chain, ChainBuilder, OperatorBuilder};
pub use config::EngineConfig;
pub use error::{ConfigError, DeriveError, EngineError, ParamError, Result};
pub use events::{
    ChannelEventSink, EngineEvent, EventError, EventSink, NullEventSink, VecEventSink,
};
pub use operator::{
    CancelToken, DeriveContext, DeriveResult, Derivation, Listener, Operator, OperatorId,
    SubscriptionId,
};
pub use orchestration::{ChainSet, ChainUpdate, Combine, MergedChain, MergedChainBuilder};
pub use params::{ParamSet, ParamSpec, ParamValue};
pub use scheduler::{ComputeBackend, ComputeScheduler, ComputeStatus, RunState};
