//! Connection transport.
//!
//! The session core consumes a transport that can open a call, carry typed messages both ways,
//! half-close either direction, and deliver a terminal status. This module provides that
//! collaborator: a [`Connection`] multiplexes any number of concurrent calls over one persistent
//! duplex byte stream, TCP or in-process.
//!
//! # Key Components
//!
//! - [`Frame`]: the unit of traffic, tagged with the call it belongs to.
//! - [`FrameReader`] / [`FrameWriter`]: bincode framing over `Read`/`Write` streams.
//! - [`Connection`]: owns the writer half and a reader thread that routes frames to sessions.
//! - [`Acceptor`]: yields each call the peer opens, as an [`IncomingCall`].
//!
//! # Binary Format
//!
//! Frames are bincode-encoded back to back with big-endian, fixed-width integers. Message
//! payloads inside frames are already-encoded application messages.
mod connection;
mod frame;
mod io;

pub use connection::{Acceptor, Connection, IncomingCall};
pub use frame::{CallId, Frame};
pub use io::{FrameReader, FrameWriter, TransportError};
