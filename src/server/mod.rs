//! Handler invoker.
//!
//! Accepted calls are routed by method identity (`"<service>/<method>"`) to a [`Service`],
//! which picks the handler and runs it through the shape-specific entry points on
//! [`IncomingCall`]: a handler only gets the capabilities of its shape, and whatever it returns
//! (or panics with) becomes the call's terminal status.
//!
//! # Key Components
//!
//! - [`Service`]: user-supplied method dispatch for one named service.
//! - [`Router`]: resolves method identities to services.
//! - [`Server`]: accepts connections and runs each call's handler on a [`ThreadPool`] that
//!   grows past its warm workers instead of queueing behind long-lived calls.
//! - [`CallContext`], [`RequestStream`], [`ResponseSink`]: what a handler works with.
//!
//! # Example
//! ```rust
//! use duplex::{Client, Deadline, Status};
//! use duplex::server::{Router, Server, Service};
//! use duplex::transport::{Connection, IncomingCall};
//!
//! struct Echo;
//!
//! impl Service for Echo {
//!     fn name(&self) -> &str {
//!         "echo.Echo"
//!     }
//!
//!     fn dispatch(&self, method: &str, call: IncomingCall) {
//!         match method {
//!             "Say" => call.unary(|_, text: String| Ok::<_, Status>(text)),
//!             _ => call.reject(Status::unimplemented(method.to_string())),
//!         }
//!     }
//! }
//!
//! let server = Server::new(Router::new().add_service(Echo), 2).unwrap();
//! let (connection, _server_end, acceptor) = Connection::pair().unwrap();
//! server.spawn(acceptor).unwrap();
//!
//! let client = Client::new(connection);
//! let reply: String = client
//!     .call_unary("echo.Echo/Say", "hi".to_string(), Deadline::none())
//!     .unwrap();
//! assert_eq!(reply, "hi");
//! ```
mod handler;
mod thread;

use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread as std_thread,
};

use log::{info, warn};

pub use handler::{CallContext, RequestStream, ResponseSink};
pub use thread::ThreadPool;

use crate::{
    Status,
    transport::{Acceptor, Connection, IncomingCall, TransportError},
};

/// A named group of methods.
pub trait Service: Send + Sync + 'static {
    /// Service part of the method identities this service answers.
    fn name(&self) -> &str;

    /// Serves `call`, where `method` is the identity's part after the `/`.
    ///
    /// Unknown methods should be rejected with `UNIMPLEMENTED`.
    fn dispatch(&self, method: &str, call: IncomingCall);
}

#[derive(Default)]
pub struct Router {
    services: HashMap<String, Box<dyn Service>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service<S: Service>(mut self, service: S) -> Self {
        self.services
            .insert(service.name().to_string(), Box::new(service));
        self
    }

    pub fn route(&self, call: IncomingCall) {
        let identity = call.method().to_string();
        let Some((service, method)) = identity.split_once('/') else {
            call.reject(Status::unimplemented(format!(
                "malformed method identity '{identity}'"
            )));
            return;
        };

        match self.services.get(service) {
            Some(handler) => handler.dispatch(method, call),
            None => call.reject(Status::unimplemented(format!(
                "unknown service '{service}'"
            ))),
        }
    }
}

/// Serves calls to a [`Router`] on behalf of any number of connections.
#[derive(Clone)]
pub struct Server {
    router: Arc<Router>,
    pool: Arc<ThreadPool>,
}

impl Server {
    pub fn new(router: Router, workers: usize) -> io::Result<Self> {
        Ok(Self {
            router: Arc::new(router),
            pool: Arc::new(ThreadPool::new(workers)?),
        })
    }

    /// Runs every call accepted on one connection, until the connection closes.
    pub fn serve(&self, acceptor: Acceptor) {
        while let Some(call) = acceptor.accept_call() {
            let router = Arc::clone(&self.router);
            self.pool.execute(move || router.route(call));
        }
    }

    /// Serves one connection's calls from a dedicated thread.
    pub fn spawn(&self, acceptor: Acceptor) -> io::Result<std_thread::JoinHandle<()>> {
        let server = self.clone();
        std_thread::Builder::new()
            .name("accept-calls".to_string())
            .spawn(move || server.serve(acceptor))
    }

    pub fn listen(&self, address: SocketAddr) -> Result<(), TransportError> {
        let listener = TcpListener::bind(address)?;
        info!(
            "listening at {} with {} warm handler workers",
            listener.local_addr()?,
            self.pool.size()
        );

        for stream in listener.incoming() {
            match stream.map_err(TransportError::from).and_then(Connection::accept) {
                Ok((connection, acceptor)) => {
                    info!("accepted connection from {}", connection.peer());
                    self.spawn(acceptor)?;
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}
