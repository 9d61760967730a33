//! Client message parsing and command-result emission.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::event::Event;

/// Messages a client may submit over the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", {..}]` event submission.
    Event(Event),
}

/// Parse one inbound text frame; unknown or malformed frames yield `None`.
pub fn parse_message(txt: &str) -> Option<ClientMessage> {
    let val: Value = serde_json::from_str(txt).ok()?;
    let arr = val.as_array()?;
    match arr.first()?.as_str()? {
        "EVENT" if arr.len() >= 2 => serde_json::from_value(arr[1].clone())
            .ok()
            .map(ClientMessage::Event),
        _ => None,
    }
}

/// Client-visible rejection reasons. `Display` is the wire contract.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("invalid: event id does not match")]
    IdMismatch,
    #[error("invalid: event signature verification failed")]
    SignatureInvalid,
    #[error("event is expired")]
    Expired,
    #[error("rate-limited: slow down")]
    RateLimited,
    #[error("rejected: content is longer than {0} bytes")]
    ContentTooLong(u64),
    #[error("rejected: created_at is more than {0} seconds in the future")]
    CreatedAtTooFar(u64),
    #[error("rejected: created_at is more than {0} seconds in the past")]
    CreatedAtTooOld(u64),
    #[error("pow: difficulty {got}<{want}")]
    IdPow { got: u32, want: u32 },
    #[error("pow: pubkey difficulty {got}<{want}")]
    PubkeyPow { got: u32, want: u32 },
    #[error("blocked: pubkey not allowed")]
    PubkeyNotAllowed,
    #[error("blocked: event kind {0} not allowed")]
    KindNotAllowed(u16),
    #[error("blocked: pubkey not admitted")]
    NotAdmitted,
    #[error("blocked: insufficient balance")]
    InsufficientBalance,
    #[error("error: event not supported")]
    Unsupported,
    #[error("error: unable to process event")]
    Unprocessable,
    #[error("{0}")]
    Vetoed(String),
}

/// Acknowledgement for one event submission.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub event_id: String,
    pub accepted: bool,
    pub reason: String,
}

impl CommandResult {
    /// Successful acknowledgement with an empty reason.
    pub fn ok(event_id: &str) -> Self {
        Self {
            event_id: event_id.into(),
            accepted: true,
            reason: String::new(),
        }
    }

    /// Rejection acknowledgement carrying a diagnostic reason.
    pub fn rejected(event_id: &str, reason: &Rejection) -> Self {
        Self {
            event_id: event_id.into(),
            accepted: false,
            reason: reason.to_string(),
        }
    }

    /// Serialize to the `["OK", id, accepted, reason]` frame.
    pub fn to_frame(&self) -> String {
        serde_json::json!(["OK", self.event_id, self.accepted, self.reason]).to_string()
    }
}

/// Per-connection outbound frame writer.
///
/// Frames are drained to the socket by the connection task in send order, so
/// acknowledgements keep the submission order of their events.
#[derive(Debug, Clone)]
pub struct CommandSink {
    tx: mpsc::UnboundedSender<String>,
}

impl CommandSink {
    /// Create a sink plus the receiving half the connection task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue one acknowledgement. A closed connection drops the frame.
    pub fn send(&self, result: &CommandResult) {
        if self.tx.send(result.to_frame()).is_err() {
            tracing::debug!(event = %result.event_id, "connection closed before acknowledgement");
        }
    }
}
