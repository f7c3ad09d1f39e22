pub mod client;
mod codec;
pub mod deadline;
pub mod server;
pub mod services;
pub mod session;
pub mod status;
mod sync;
pub mod transport;

pub use client::{Client, ClientStreamingCall, RequestSink, ResponseStream};
pub use deadline::{CancelToken, Canceller, Deadline, with_timeout};
pub use server::{CallContext, RequestStream, ResponseSink, Router, Server, Service};
pub use session::{DirectionState, Phase, Role, Session, Shape};
pub use status::{Code, Status};
pub use transport::{Acceptor, Connection, IncomingCall, TransportError};
