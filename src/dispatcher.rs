//! Cooperative single-threaded coroutine dispatcher.
//!
//! Coroutines are async blocks polled one at a time, in spawn order,
//! with a no-op waker: a blocking primitive parks itself by returning
//! `Pending` from a [`YieldNow`] and is re-polled on the next pass.
//! The pump terminates only when every live coroutine reports that it
//! stayed blocked for a whole pass and no new coroutine was spawned,
//! so the reachable state cannot advance without external input.

use std::cell::RefCell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::context::WorkflowContext;
use crate::error::PanicError;

thread_local! {
    static LAST_PANIC_STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL_PANIC_RECORDER: Once = Once::new();

// Chain onto the process panic hook so the backtrace of a panic caught
// by the pump is still available after the unwind.
fn install_panic_recorder() {
    INSTALL_PANIC_RECORDER.call_once(|| {
        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = std::backtrace::Backtrace::force_capture().to_string();
            LAST_PANIC_STACK.with(|s| *s.borrow_mut() = Some(stack));
            prev(info);
        }));
    });
}

fn take_last_panic_stack() -> String {
    LAST_PANIC_STACK
        .with(|s| s.borrow_mut().take())
        .unwrap_or_default()
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

/// Per-coroutine scheduling state, shared between the dispatcher and
/// the context handed to the coroutine's code.
pub(crate) struct CoroutineState {
    name: String,
    /// True when the coroutine yielded and has not completed a
    /// blocking primitive since; cleared by [`CoroutineState::unblocked`].
    kept_blocked: AtomicBool,
    closed: AtomicBool,
    yield_status: Mutex<String>,
    core: Weak<DispatcherCore>,
}

impl CoroutineState {
    pub(crate) fn dispatcher(&self) -> Arc<DispatcherCore> {
        self.core
            .upgrade()
            .expect("dispatcher dropped while coroutine alive")
    }

    /// Called by a blocking primitive once it makes progress after
    /// having yielded.
    pub(crate) fn unblocked(&self) {
        self.kept_blocked.store(false, Ordering::SeqCst);
    }

    pub(crate) fn yield_now(self: &Arc<Self>, status: String) -> YieldNow {
        YieldNow {
            state: self.clone(),
            status: Some(status),
            yielded: false,
        }
    }

    fn status_line(&self) -> String {
        let status = self.yield_status.lock().unwrap();
        format!("coroutine {} [{}]", self.name, status)
    }
}

/// One-shot yield. Returns `Pending` exactly once; the resuming poll
/// marks the coroutine as kept-blocked, mirroring the rendezvous
/// protocol where the flag is set when the yield unblocks.
pub(crate) struct YieldNow {
    state: Arc<CoroutineState>,
    status: Option<String>,
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if !self.yielded {
            if let Some(status) = self.status.take() {
                *self.state.yield_status.lock().unwrap() = status;
            }
            self.yielded = true;
            Poll::Pending
        } else {
            self.state.kept_blocked.store(true, Ordering::SeqCst);
            Poll::Ready(())
        }
    }
}

struct Coroutine {
    state: Arc<CoroutineState>,
    future: Pin<Box<dyn Future<Output = ()> + Send>>,
}

/// Shared half of the dispatcher, reachable from coroutine contexts
/// through a weak reference. Holds the spawn queue and the sequence
/// counters used for auto-naming.
pub(crate) struct DispatcherCore {
    sequence: AtomicU64,
    channel_sequence: AtomicU64,
    selector_sequence: AtomicU64,
    pending: Mutex<Vec<Coroutine>>,
    closed: AtomicBool,
    executing: AtomicBool,
}

impl DispatcherCore {
    pub(crate) fn next_channel_name(&self) -> String {
        let n = self.channel_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("chan-{n}")
    }

    pub(crate) fn next_selector_name(&self) -> String {
        let n = self.selector_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("selector-{n}")
    }

    /// Queue a new coroutine. Coroutines spawned during a pump pass
    /// are adopted into the same pass.
    pub(crate) fn spawn<F, Fut>(self: &Arc<Self>, parent: &WorkflowContext, name: Option<String>, f: F)
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(CoroutineState {
            name: name.unwrap_or_else(|| seq.to_string()),
            kept_blocked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            yield_status: Mutex::new(String::new()),
            core: Arc::downgrade(self),
        });
        let ctx = parent.with_coroutine_state(state.clone());
        let future: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(f(ctx));
        self.pending.lock().unwrap().push(Coroutine { state, future });
    }
}

/// Owner of the coroutine set. `execute_until_all_blocked` is the pump
/// invoked once per decision task.
pub(crate) struct Dispatcher {
    core: Arc<DispatcherCore>,
    coroutines: Vec<Coroutine>,
}

impl Dispatcher {
    /// Create a dispatcher with a root coroutine. The context passed to
    /// the root function is a child of `root_ctx`.
    pub(crate) fn new<F, Fut>(root_ctx: &WorkflowContext, f: F) -> Self
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        install_panic_recorder();
        let core = Arc::new(DispatcherCore {
            sequence: AtomicU64::new(0),
            channel_sequence: AtomicU64::new(0),
            selector_sequence: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            executing: AtomicBool::new(false),
        });
        core.spawn(root_ctx, None, f);
        Dispatcher {
            core,
            coroutines: Vec::new(),
        }
    }

    fn adopt_spawned(&mut self) {
        let mut pending = self.core.pending.lock().unwrap();
        self.coroutines.append(&mut *pending);
    }

    /// Run coroutines one by one in deterministic order until every
    /// one of them is completed or blocked on a channel, selector, or
    /// future. Returns the captured panic if a coroutine panicked.
    pub(crate) fn execute_until_all_blocked(&mut self) -> Result<(), PanicError> {
        if self.core.closed.load(Ordering::SeqCst) {
            panic!("dispatcher is closed");
        }
        if self.core.executing.swap(true, Ordering::SeqCst) {
            panic!("execute_until_all_blocked called while it is already running");
        }
        let result = self.run_passes();
        self.core.executing.store(false, Ordering::SeqCst);
        result
    }

    fn run_passes(&mut self) -> Result<(), PanicError> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut all_blocked = false;
        // Keep running passes until no coroutine made progress
        while !all_blocked {
            all_blocked = true;
            let last_sequence = self.core.sequence.load(Ordering::SeqCst);
            self.adopt_spawned();
            let mut i = 0;
            while i < self.coroutines.len() {
                let poll = {
                    let c = &mut self.coroutines[i];
                    catch_unwind(AssertUnwindSafe(|| c.future.as_mut().poll(&mut cx)))
                };
                // a step may have spawned coroutines; give them a turn
                // within this pass
                self.adopt_spawned();
                match poll {
                    Err(payload) => {
                        let c = self.coroutines.remove(i);
                        c.state.closed.store(true, Ordering::SeqCst);
                        let message = panic_message(payload.as_ref());
                        let stack = take_last_panic_stack();
                        return Err(PanicError::new(message, stack));
                    }
                    Ok(Poll::Ready(())) => {
                        let c = self.coroutines.remove(i);
                        c.state.closed.store(true, Ordering::SeqCst);
                        all_blocked = false;
                    }
                    Ok(Poll::Pending) => {
                        all_blocked =
                            all_blocked && self.coroutines[i].state.kept_blocked.load(Ordering::SeqCst);
                        i += 1;
                    }
                }
            }
            // new coroutines mean the pass cannot be the last one
            all_blocked = all_blocked && last_sequence == self.core.sequence.load(Ordering::SeqCst);
            if self.coroutines.is_empty() {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn is_done(&self) -> bool {
        self.coroutines.is_empty() && self.core.pending.lock().unwrap().is_empty()
    }

    /// Force-terminate all coroutines by dropping them. Idempotent.
    pub(crate) fn close(&mut self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.adopt_spawned();
        for c in self.coroutines.drain(..) {
            c.state.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Yield-point status of every live coroutine, one block each.
    pub(crate) fn stack_trace(&self) -> String {
        let mut out = String::new();
        for c in &self.coroutines {
            if c.state.closed.load(Ordering::SeqCst) {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&c.state.status_line());
        }
        out
    }
}
