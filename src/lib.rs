//! Deterministic workflow runtime core.
//!
//! This crate is the client-side engine of a durable-workflow system:
//! user workflows are ordinary sequential code that expresses
//! concurrency, time, external work, and signals through the
//! primitives here, while the runtime guarantees that re-executing the
//! same code against a recorded history produces identical decisions.
//! It provides:
//!
//! - A cooperative single-threaded coroutine dispatcher with
//!   deterministic scheduling (`dispatcher`)
//! - Typed `Channel`, `Selector`, and one-shot `WorkflowFuture`
//!   primitives usable only from inside a workflow
//! - A `WorkflowDriver` that couples the dispatcher to an external
//!   [`WorkflowEnvironment`] and pumps it on every decision start
//! - The workflow operation surface as methods on [`WorkflowContext`]:
//!   activities, child workflows, timers, side effects, versions,
//!   signals, and queries
//! - An in-process [`TestWorkflowEnvironment`] with a virtual clock,
//!   auto-firing timers, and synchronous activity/child execution

pub mod channel;
pub mod context;
pub(crate) mod dispatcher;
pub mod driver;
pub mod env;
pub mod error;
pub mod future;
pub mod registry;
pub mod selector;
pub mod testenv;

mod api;

pub use channel::Channel;
pub use context::{CancelHandle, WorkflowContext};
pub use driver::WorkflowDriver;
pub use env::{
    ActivityOptions, ChildWorkflowOptions, ChildWorkflowPolicy, Version, WorkflowEnvironment,
    WorkflowExecution, WorkflowInfo, WorkflowType, DEFAULT_VERSION,
};
pub use error::{PanicError, TimeoutType, WorkflowError};
pub use future::{ChildWorkflowFuture, DecodedFuture, Settable, WorkflowFuture};
pub use registry::{ActivityRegistry, WorkflowRegistry};
pub use selector::Selector;
pub use testenv::TestWorkflowEnvironment;

use serde::{de::DeserializeOwned, Serialize};

// Internal codec utilities for typed I/O (kept private; the public API
// moves bytes through `EncodedValue`)
pub(crate) mod codec {
    use crate::error::WorkflowError;
    use serde::{de::DeserializeOwned, Serialize};

    pub(crate) fn encode<T: Serialize>(v: &T) -> Result<Vec<u8>, WorkflowError> {
        serde_json::to_vec(v).map_err(WorkflowError::encode_failed)
    }

    pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WorkflowError> {
        serde_json::from_slice(bytes).map_err(WorkflowError::decode_failed)
    }
}

/// Encoded result bytes from a workflow, activity, or side effect.
///
/// Extract the typed value with [`EncodedValue::get`]:
///
/// ```ignore
/// let encoded = ctx.side_effect(|_| random_seed());
/// let seed: u64 = encoded.get()?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncodedValue(Vec<u8>);

impl EncodedValue {
    /// Encode a value into its payload form.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, WorkflowError> {
        codec::encode(value).map(EncodedValue)
    }

    /// Decode the payload into the requested type.
    pub fn get<T: DeserializeOwned>(&self) -> Result<T, WorkflowError> {
        codec::decode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        EncodedValue(bytes)
    }

    /// Empty payload, used where an operation completes without a
    /// value (timers, workflows that return nothing).
    pub fn unit() -> Self {
        EncodedValue(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
