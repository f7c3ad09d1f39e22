use bincode::{Decode, Encode};

use crate::{Shape, Status};

/// Connection-scoped call identifier, allocated by the side that opens the call.
pub type CallId = u64;

/// Unit of traffic on a connection. Every frame belongs to exactly one call.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Frame {
    /// Starts a call. `timeout_ms` is the caller's remaining time, if it set a deadline.
    Open {
        call: CallId,
        method: String,
        shape: Shape,
        timeout_ms: Option<u64>,
    },
    Message {
        call: CallId,
        payload: Vec<u8>,
    },
    /// The sender will send no further messages on this call.
    HalfClose { call: CallId },
    /// Server's terminal status for the call.
    Trailer { call: CallId, status: Status },
    /// Caller abandoned the call, with the reason.
    Cancel { call: CallId, status: Status },
}

impl Frame {
    pub fn call(&self) -> CallId {
        match self {
            Frame::Open { call, .. }
            | Frame::Message { call, .. }
            | Frame::HalfClose { call }
            | Frame::Trailer { call, .. }
            | Frame::Cancel { call, .. } => *call,
        }
    }
}
