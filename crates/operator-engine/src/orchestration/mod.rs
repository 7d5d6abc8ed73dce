//! Orchestration layer driving several chains from one owner thread.
//!
//! Two topologies are supported:
//! - **Independent chains** ([`ChainSet`]): one chain per target artifact,
//!   each with its own scheduler, polled together once per frame and
//!   applied together only when every chain is ready.
//! - **Merged chain** ([`MergedChain`]): all inputs are deep-copied and
//!   combined into one immutable source artifact that feeds a single chain;
//!   the result can be split back into per-input pieces.
//!
//! # Example
//!
//! ```ignore
//! use operator_engine::orchestration::{ChainSet, ChainUpdate};
//!
//! let mut chains = ChainSet::new();
//! for (id, mesh) in targets {
//!     let chain = build_chain(mesh)?;
//!     chains.insert(id, ComputeScheduler::new(chain.terminal().clone()));
//! }
//!
//! // once per frame
//! chains.poll(|id, update| match update {
//!     ChainUpdate::Ready(artifact) => preview.show(id, artifact),
//!     ChainUpdate::Failed { fallback, .. } => preview.show_error(id, fallback),
//! });
//!
//! if chains.can_apply() {
//!     let results = chains.extract_all()?;
//! }
//! ```

pub mod chains;
pub mod merged;

pub use chains::{ChainSet, ChainUpdate};
pub use merged::{Combine, MergedChain, MergedChainBuilder};
