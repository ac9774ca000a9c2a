use thiserror::Error;

/// Failures raised by the tracking layer itself.
///
/// Operation calls return `anyhow::Result`; these errors convert into `anyhow::Error` and
/// can be recovered with `downcast_ref::<TrackingError>()`.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("operation `{name}` is not registered in the dispatch table")]
    UnknownOperation { name: String },
    #[error("failed to install hook for `{name}`: {reason}")]
    Install { name: String, reason: String },
    #[error("operation `{name}` is already claimed by another tracking session")]
    AlreadyTracked { name: String },
    #[error("failed to restore {} operation(s): {}", failed.len(), failed.join(", "))]
    Restore { failed: Vec<String> },
    #[error("cannot capture arguments for `{op}`: {reason}")]
    ArgumentCapture { op: String, reason: String },
    #[error("measuring `{op}` failed")]
    Measurement {
        op: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to start backward measurement queue: {0}")]
    BackwardQueue(#[from] std::io::Error),
}

impl TrackingError {
    pub(crate) fn capture(op: &str, reason: impl Into<String>) -> Self {
        TrackingError::ArgumentCapture {
            op: op.to_string(),
            reason: reason.into(),
        }
    }
}
