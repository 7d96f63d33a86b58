use serde::{Deserialize, Serialize};

use crate::ids::Pkr;

/// Caller's declaration that it expects a response to this send.
///
/// The kernel registers a pending response keyed by the message id; a reply
/// (or, failing that, a synthetic timeout) is delivered to `reply_to`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRequired {
    /// Destination path for the response, e.g. `client://replies`.
    pub reply_to: String,
    /// Milliseconds until a synthetic timeout response is emitted; `0`
    /// disables the timer.
    pub timeout_ms: u64,
}

impl ResponseRequired {
    pub fn new(reply_to: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            reply_to: reply_to.into(),
            timeout_ms,
        }
    }
}

/// Per-send options carried from the kernel boundary down to the handler.
#[derive(Clone, Debug, Default)]
pub struct DispatchOptions {
    /// The authenticated principal on whose behalf the send happens.
    pub caller_id: Option<Pkr>,
    /// Bypass the destination queue and run the handler in the caller's
    /// suspension context.
    pub process_immediately: bool,
    /// This message answers an earlier send; route it through the
    /// correlator instead of the destination resolver.
    pub is_response: bool,
    pub response_required: Option<ResponseRequired>,
}

impl DispatchOptions {
    pub fn caller(caller_id: Pkr) -> Self {
        Self {
            caller_id: Some(caller_id),
            ..Self::default()
        }
    }

    pub fn immediate(mut self) -> Self {
        self.process_immediately = true;
        self
    }

    pub fn response(mut self) -> Self {
        self.is_response = true;
        self
    }

    pub fn expecting_response(mut self, response_required: ResponseRequired) -> Self {
        self.response_required = Some(response_required);
        self
    }
}
