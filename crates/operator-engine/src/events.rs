//! Event types for observing background computation
//!
//! Events are sent from the scheduler to whoever owns the chain (an editor
//! UI, a log pipeline, a test) to report run starts, completions, discards
//! and faults.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Trait for sending compute events
///
/// This abstracts over the transport mechanism (channel, UI bridge, log
/// sink) so the scheduler can be used in different contexts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be delivered (e.g., channel closed)
    fn send(&self, event: EngineEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted by a compute scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A background run started from the given generation
    #[serde(rename_all = "camelCase")]
    ComputeStarted {
        chain: String,
        run_id: String,
        snapshot: u64,
    },

    /// A run finished and its result is current
    #[serde(rename_all = "camelCase")]
    ComputeCompleted {
        chain: String,
        run_id: String,
        elapsed_ms: u64,
        failed: bool,
    },

    /// A run finished but the chain was edited meanwhile
    #[serde(rename_all = "camelCase")]
    ComputeDiscarded {
        chain: String,
        run_id: String,
        snapshot: u64,
        current: u64,
    },

    /// A run finished with an error and no fallback artifact
    #[serde(rename_all = "camelCase")]
    ComputeFailed {
        chain: String,
        run_id: String,
        error: String,
    },

    /// The worker panicked or vanished
    #[serde(rename_all = "camelCase")]
    BackgroundFault {
        chain: String,
        run_id: String,
        message: String,
    },

    /// The owner took the result out of the chain
    #[serde(rename_all = "camelCase")]
    ResultExtracted { chain: String },

    /// The chain was shut down
    #[serde(rename_all = "camelCase")]
    ChainShutdown { chain: String },
}

impl EngineEvent {
    /// Label of the chain this event belongs to
    pub fn chain(&self) -> &str {
        match self {
            Self::ComputeStarted { chain, .. }
            | Self::ComputeCompleted { chain, .. }
            | Self::ComputeDiscarded { chain, .. }
            | Self::ComputeFailed { chain, .. }
            | Self::BackgroundFault { chain, .. }
            | Self::ResultExtracted { chain }
            | Self::ChainShutdown { chain } => chain,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: EngineEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: EngineEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards events into a tokio channel, e.g. towards a UI task
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEventSink {
    /// Create a sink together with the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: EngineEvent) -> Result<(), EventError> {
        self.sender
            .send(event)
            .map_err(|_| EventError::channel_closed())
    }
}
