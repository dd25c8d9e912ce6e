use crate::EncodedValue;

/// Timeout flavors reported for activities and workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutType {
    StartToClose,
    ScheduleToStart,
    ScheduleToClose,
    Heartbeat,
}

impl std::fmt::Display for TimeoutType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimeoutType::StartToClose => "START_TO_CLOSE",
            TimeoutType::ScheduleToStart => "SCHEDULE_TO_START",
            TimeoutType::ScheduleToClose => "SCHEDULE_TO_CLOSE",
            TimeoutType::Heartbeat => "HEARTBEAT",
        };
        f.write_str(s)
    }
}

/// Error kinds surfaced to workflow code from futures and `get` calls.
///
/// Remote failures (activity, child workflow, timer) arrive as one of
/// these on the corresponding future. Framework bookkeeping violations
/// (double-set future, send on closed channel, exhausted signal buffer)
/// panic instead and are captured by the dispatcher as a [`PanicError`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkflowError {
    /// Application-level failure raised by an activity or workflow.
    #[error("{reason}")]
    Custom {
        reason: String,
        details: Option<EncodedValue>,
    },
    /// The operation exceeded one of its configured timeouts.
    #[error("timeout: {timeout_type}")]
    Timeout {
        timeout_type: TimeoutType,
        details: Option<EncodedValue>,
    },
    /// The operation was canceled through its workflow context.
    #[error("canceled")]
    Canceled { details: Option<EncodedValue> },
    /// User code panicked; the message and stack were captured.
    #[error("panic: {message}")]
    Panic { message: String, stack: String },
    /// Anything without a more specific kind, including codec and
    /// option-validation failures.
    #[error("{0}")]
    Generic(String),
    /// Sentinel returned by an activity that will complete
    /// asynchronously via `complete_activity`.
    #[error("activity result pending")]
    ResultPending,
}

impl WorkflowError {
    pub fn custom(reason: impl Into<String>) -> Self {
        WorkflowError::Custom {
            reason: reason.into(),
            details: None,
        }
    }

    pub fn canceled() -> Self {
        WorkflowError::Canceled { details: None }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, WorkflowError::Canceled { .. })
    }

    pub(crate) fn decode_failed(err: impl std::fmt::Display) -> Self {
        WorkflowError::Generic(format!("decode failed: {err}"))
    }

    pub(crate) fn encode_failed(err: impl std::fmt::Display) -> Self {
        WorkflowError::Generic(format!("encode failed: {err}"))
    }
}

/// Panic captured inside a workflow coroutine, with the panic payload
/// rendered to a message and the backtrace recorded at the panic site.
#[derive(Debug, Clone)]
pub struct PanicError {
    message: String,
    stack: String,
}

impl PanicError {
    pub(crate) fn new(message: String, stack: String) -> Self {
        Self { message, stack }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack_trace(&self) -> &str {
        &self.stack
    }
}

impl std::fmt::Display for PanicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "coroutine panic: {}", self.message)
    }
}

impl std::error::Error for PanicError {}

impl From<PanicError> for WorkflowError {
    fn from(p: PanicError) -> Self {
        WorkflowError::Panic {
            message: p.message,
            stack: p.stack,
        }
    }
}
