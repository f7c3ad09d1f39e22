//! Call outcomes.
//!
//! Every call ends with exactly one [`Status`]: a [`Code`] from a closed taxonomy plus a
//! human-readable message. Callers decide what to do by inspecting the code, never by
//! matching on the message text.
//!
//! # Codes
//!
//! - [`Code::Ok`]: the call succeeded.
//! - [`Code::InvalidArgument`]: the caller's input violated a precondition of the method. Only
//!   the current call fails; the connection stays up.
//! - [`Code::DeadlineExceeded`]: the caller's timeout elapsed before a terminal status arrived.
//! - [`Code::Cancelled`]: the caller abandoned the call.
//! - [`Code::Internal`]: handler fault, protocol violation or unexpected transport fault.
//! - [`Code::Unknown`]: unclassified transport failure, e.g. a lost connection.
//! - [`Code::Unimplemented`]: no handler exists for the method, or it has a different shape.
use std::fmt;

use bincode::{Decode, Encode};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum Code {
    Ok,
    InvalidArgument,
    DeadlineExceeded,
    Cancelled,
    Internal,
    Unknown,
    Unimplemented,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::Cancelled => "CANCELLED",
            Code::Internal => "INTERNAL",
            Code::Unknown => "UNKNOWN",
            Code::Unimplemented => "UNIMPLEMENTED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a call.
///
/// Two statuses are equal when their codes are equal; the message is informational only.
#[derive(Debug, Clone, Error, Encode, Decode)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for Status {}

impl From<Code> for Status {
    fn from(code: Code) -> Self {
        Self::new(code, "")
    }
}
