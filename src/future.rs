//! One-shot value-or-error cells built on a channel that is closed to
//! signal readiness.
//!
//! [`WorkflowFuture`] is the read view and [`Settable`] the write view
//! of the same cell. [`DecodedFuture`] wraps a byte-payload future and
//! deserializes on `get`, which is how activity and child-workflow
//! results are surfaced typed.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;

use crate::channel::{Channel, ReceiveCallback};
use crate::context::WorkflowContext;
use crate::env::WorkflowExecution;
use crate::error::WorkflowError;
use crate::EncodedValue;

struct FutureState<T> {
    value: Option<Result<T, WorkflowError>>,
    ready: bool,
    /// Downstream futures set when this one is.
    chained: Vec<Settable<T>>,
}

struct FutureShared<T> {
    state: Mutex<FutureState<T>>,
    channel: Channel<()>,
}

/// Read view of an asynchronous result.
pub struct WorkflowFuture<T> {
    shared: Arc<FutureShared<T>>,
}

/// Write view of a [`WorkflowFuture`]. Setting twice is a programming
/// error and panics.
pub struct Settable<T> {
    shared: Arc<FutureShared<T>>,
}

impl<T> Clone for WorkflowFuture<T> {
    fn clone(&self) -> Self {
        WorkflowFuture {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Clone for Settable<T> {
    fn clone(&self) -> Self {
        Settable {
            shared: self.shared.clone(),
        }
    }
}

pub(crate) fn new_future_pair<T: Clone + Send + 'static>(
    ctx: &WorkflowContext,
) -> (WorkflowFuture<T>, Settable<T>) {
    let shared = Arc::new(FutureShared {
        state: Mutex::new(FutureState {
            value: None,
            ready: false,
            chained: Vec::new(),
        }),
        channel: Channel::new(ctx.next_channel_name(), 0),
    });
    (
        WorkflowFuture {
            shared: shared.clone(),
        },
        Settable { shared },
    )
}

impl<T: Clone + Send + 'static> WorkflowFuture<T> {
    /// Blocks until the future is ready, then returns its value or
    /// error. Every call returns the same result.
    pub async fn get(&self, ctx: &WorkflowContext) -> Result<T, WorkflowError> {
        let received = self.shared.channel.receive(ctx).await;
        if received.is_some() {
            panic!("future backing channel must only be closed, never sent to");
        }
        let st = self.shared.state.lock().unwrap();
        if !st.ready {
            panic!("future channel closed before set");
        }
        st.value.clone().expect("ready future holds a value")
    }

    /// When true, `get` is guaranteed not to block.
    pub fn is_ready(&self) -> bool {
        self.shared.state.lock().unwrap().ready
    }

    /// Selector support: if ready, return the value now; otherwise
    /// register the callback to fire when the backing channel closes.
    pub(crate) fn get_async(
        &self,
        callback: ReceiveCallback<()>,
    ) -> Option<Result<T, WorkflowError>> {
        let (_v, _ok, more) = self.shared.channel.receive_async_impl(Some(callback));
        if more {
            return None;
        }
        let st = self.shared.state.lock().unwrap();
        if !st.ready {
            panic!("future channel closed before set");
        }
        Some(st.value.clone().expect("ready future holds a value"))
    }

    pub(crate) fn value_and_error(&self) -> Option<Result<T, WorkflowError>> {
        let st = self.shared.state.lock().unwrap();
        if st.ready {
            st.value.clone()
        } else {
            None
        }
    }
}

impl<T: Clone + Send + 'static> Settable<T> {
    /// Freeze the result. Closes the backing channel and propagates to
    /// every chained future. Exactly-once.
    pub fn set(&self, result: Result<T, WorkflowError>) {
        let chained = {
            let mut st = self.shared.state.lock().unwrap();
            if st.ready {
                panic!("future already set");
            }
            st.value = Some(result.clone());
            st.ready = true;
            std::mem::take(&mut st.chained)
        };
        self.shared.channel.close();
        for downstream in chained {
            downstream.set(result.clone());
        }
    }

    pub fn set_value(&self, value: T) {
        self.set(Ok(value));
    }

    pub fn set_error(&self, err: WorkflowError) {
        self.set(Err(err));
    }

    /// Make this future resolve with the value (or error) of `other`.
    /// If `other` is already ready the value is copied now; otherwise
    /// this settable is appended to `other`'s chain.
    pub fn chain(&self, other: &WorkflowFuture<T>) {
        if self.shared.state.lock().unwrap().ready {
            panic!("future already set");
        }
        let ready_value = {
            let mut st = other.shared.state.lock().unwrap();
            if st.ready {
                st.value.clone()
            } else {
                st.chained.push(self.clone());
                None
            }
        };
        if let Some(v) = ready_value {
            self.set(v);
        }
    }
}

/// Future over encoded result bytes, decoded into the caller's type at
/// `get` time.
pub struct DecodedFuture {
    raw: WorkflowFuture<EncodedValue>,
}

impl Clone for DecodedFuture {
    fn clone(&self) -> Self {
        DecodedFuture {
            raw: self.raw.clone(),
        }
    }
}

impl DecodedFuture {
    pub(crate) fn new(ctx: &WorkflowContext) -> (DecodedFuture, Settable<EncodedValue>) {
        let (raw, settable) = new_future_pair(ctx);
        (DecodedFuture { raw }, settable)
    }

    /// Blocks until ready, then deserializes the payload.
    pub async fn get<T: DeserializeOwned>(&self, ctx: &WorkflowContext) -> Result<T, WorkflowError> {
        let payload = self.raw.get(ctx).await?;
        payload.get()
    }

    /// Blocks until ready, returning the raw payload.
    pub async fn get_raw(&self, ctx: &WorkflowContext) -> Result<EncodedValue, WorkflowError> {
        self.raw.get(ctx).await
    }

    pub fn is_ready(&self) -> bool {
        self.raw.is_ready()
    }

    /// The undecoded future, usable with [`crate::Selector::add_future`].
    pub fn raw(&self) -> &WorkflowFuture<EncodedValue> {
        &self.raw
    }
}

/// Result future of a child workflow, with an extra future resolving
/// to the child's `{workflow_id, run_id}` once it has started.
pub struct ChildWorkflowFuture {
    pub(crate) result: DecodedFuture,
    pub(crate) execution: WorkflowFuture<WorkflowExecution>,
}

impl ChildWorkflowFuture {
    pub async fn get<T: DeserializeOwned>(&self, ctx: &WorkflowContext) -> Result<T, WorkflowError> {
        self.result.get(ctx).await
    }

    pub async fn get_raw(&self, ctx: &WorkflowContext) -> Result<EncodedValue, WorkflowError> {
        self.result.get_raw(ctx).await
    }

    pub fn is_ready(&self) -> bool {
        self.result.is_ready()
    }

    /// Ready once the child workflow execution has started; use the
    /// returned execution to cancel or signal the child.
    pub fn get_child_workflow_execution(&self) -> &WorkflowFuture<WorkflowExecution> {
        &self.execution
    }
}
