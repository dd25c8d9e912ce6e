//! Multi-way wait across channel receives, channel sends, and
//! futures, with an optional default.
//!
//! Cases are probed in insertion order; the first immediately-ready
//! case fires. Otherwise callbacks are registered on every case and
//! the first one to fire wins a shared ready-latch; later callbacks
//! observe the latch and decline, so channel values are re-offered to
//! other waiters instead of being consumed by a losing branch.

use std::sync::{Arc, Mutex};

use crate::channel::{Channel, ReceiveCallback};
use crate::context::WorkflowContext;
use crate::error::WorkflowError;
use crate::future::WorkflowFuture;

/// The winning branch, latched by the first callback to fire.
type ReadyLatch = Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>;

trait SelectorCase: Send {
    /// Probe for immediate readiness, firing the user handler and
    /// returning true if so; otherwise register a latch callback.
    fn probe(&mut self, latch: &ReadyLatch) -> bool;
}

struct ReceiveCase<T> {
    channel: Channel<T>,
    handler: Arc<Mutex<Box<dyn FnMut(Option<T>, bool) + Send>>>,
}

impl<T: Send + 'static> SelectorCase for ReceiveCase<T> {
    fn probe(&mut self, latch: &ReadyLatch) -> bool {
        let latch = latch.clone();
        let handler = self.handler.clone();
        let callback: ReceiveCallback<T> = Box::new(move |slot, more| {
            let mut l = latch.lock().unwrap();
            if l.is_some() {
                return false;
            }
            let v = slot.take();
            let handler = handler.clone();
            *l = Some(Box::new(move || {
                (*handler.lock().unwrap())(v, more);
            }));
            true
        });
        let (v, ok, more) = self.channel.receive_async_impl(Some(callback));
        if ok || !more {
            (*self.handler.lock().unwrap())(v, more);
            return true;
        }
        false
    }
}

struct SendCase<T> {
    channel: Channel<T>,
    value: T,
    handler: Arc<Mutex<Box<dyn FnMut() + Send>>>,
}

impl<T: Clone + Send + 'static> SelectorCase for SendCase<T> {
    fn probe(&mut self, latch: &ReadyLatch) -> bool {
        let latch = latch.clone();
        let handler = self.handler.clone();
        let callback: Box<dyn FnMut() -> bool + Send> = Box::new(move || {
            let mut l = latch.lock().unwrap();
            if l.is_some() {
                return false;
            }
            let handler = handler.clone();
            *l = Some(Box::new(move || {
                (*handler.lock().unwrap())();
            }));
            true
        });
        if self.channel.send_async_impl(self.value.clone(), Some(callback)) {
            (*self.handler.lock().unwrap())();
            return true;
        }
        false
    }
}

type FutureHandler<T> = Box<dyn FnOnce(Result<T, WorkflowError>) + Send>;

struct FutureCase<T> {
    future: WorkflowFuture<T>,
    /// Taken when the case fires; a fired future case never fires
    /// again on later selects.
    handler: Arc<Mutex<Option<FutureHandler<T>>>>,
}

impl<T: Clone + Send + 'static> SelectorCase for FutureCase<T> {
    fn probe(&mut self, latch: &ReadyLatch) -> bool {
        if self.handler.lock().unwrap().is_none() {
            return false;
        }
        let latch = latch.clone();
        let handler = self.handler.clone();
        let future = self.future.clone();
        let callback: ReceiveCallback<()> = Box::new(move |_slot, _more| {
            let mut l = latch.lock().unwrap();
            if l.is_some() {
                return false;
            }
            let handler = handler.clone();
            let future = future.clone();
            *l = Some(Box::new(move || {
                if let Some(h) = handler.lock().unwrap().take() {
                    let result = future
                        .value_and_error()
                        .expect("future fired its ready callback");
                    h(result);
                }
            }));
            true
        });
        match self.future.get_async(callback) {
            Some(result) => {
                if let Some(h) = self.handler.lock().unwrap().take() {
                    h(result);
                }
                true
            }
            None => false,
        }
    }
}

/// Deterministic select over channels and futures. Build with the
/// `add_*` methods, then call [`Selector::select`]; a selector can be
/// selected repeatedly (typically in a loop).
pub struct Selector {
    name: String,
    cases: Vec<Box<dyn SelectorCase>>,
    default_fn: Option<Box<dyn FnMut() + Send>>,
}

impl Selector {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Selector {
            name: name.into(),
            cases: Vec::new(),
            default_fn: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire `handler` with `(value, more)` when the channel delivers;
    /// `more` is false when the channel closed.
    pub fn add_receive<T, F>(mut self, channel: &Channel<T>, handler: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(Option<T>, bool) + Send + 'static,
    {
        self.cases.push(Box::new(ReceiveCase {
            channel: channel.clone(),
            handler: Arc::new(Mutex::new(Box::new(handler))),
        }));
        self
    }

    /// Fire `handler` once the channel has accepted `value`.
    pub fn add_send<T, F>(mut self, channel: &Channel<T>, value: T, handler: F) -> Self
    where
        T: Clone + Send + 'static,
        F: FnMut() + Send + 'static,
    {
        self.cases.push(Box::new(SendCase {
            channel: channel.clone(),
            value,
            handler: Arc::new(Mutex::new(Box::new(handler))),
        }));
        self
    }

    /// Fire `handler` with the future's result when it becomes ready.
    pub fn add_future<T, F>(mut self, future: &WorkflowFuture<T>, handler: F) -> Self
    where
        T: Clone + Send + 'static,
        F: FnOnce(Result<T, WorkflowError>) + Send + 'static,
    {
        self.cases.push(Box::new(FutureCase {
            future: future.clone(),
            handler: Arc::new(Mutex::new(Some(Box::new(handler)))),
        }));
        self
    }

    /// Fire `handler` iff no case is ready at probe time.
    pub fn add_default<F>(mut self, handler: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.default_fn = Some(Box::new(handler));
        self
    }

    /// Perform one selection. Ties at probe time are broken strictly
    /// by case insertion order.
    pub async fn select(&mut self, ctx: &WorkflowContext) {
        let latch: ReadyLatch = Arc::new(Mutex::new(None));
        for case in &mut self.cases {
            if case.probe(&latch) {
                return;
            }
        }
        if let Some(default_fn) = &mut self.default_fn {
            default_fn();
            return;
        }
        let state = ctx.coroutine_state();
        loop {
            let winner = latch.lock().unwrap().take();
            if let Some(fire) = winner {
                fire();
                state.unblocked();
                return;
            }
            state
                .yield_now(format!("blocked on {}.Select", self.name))
                .await;
        }
    }
}
