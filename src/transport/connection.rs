use std::{
    collections::HashMap,
    net::{TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use log::{debug, info, trace, warn};

use super::{
    CallId, Frame, FrameReader, FrameWriter, TransportError,
    io::{FrameSink, FrameSource, memory_pipe},
};
use crate::{
    Deadline, Shape, Status, codec,
    session::{Link, Role, Session},
    sync::lock,
};

/// One end of a persistent connection carrying many concurrent calls.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    peer: String,
    writer: Mutex<Box<dyn FrameSink>>,
    calls: Mutex<HashMap<CallId, Arc<Session>>>,
    next_call: AtomicU64,
    closed: AtomicBool,
}

/// A call opened by the peer, waiting for a handler.
pub struct IncomingCall {
    pub(crate) session: Arc<Session>,
}

impl IncomingCall {
    pub fn method(&self) -> &str {
        self.session.method()
    }

    pub fn shape(&self) -> Shape {
        self.session.shape()
    }

    /// Ends the call without running a handler.
    pub fn reject(self, status: Status) {
        debug!("{}: rejected with {status}", self.method());
        self.session.finish(status);
    }
}

/// Source of calls opened by the peer of a [`Connection`].
pub struct Acceptor {
    calls: mpsc::Receiver<IncomingCall>,
}

impl Acceptor {
    /// Blocks for the next incoming call; `None` once the connection is gone.
    pub fn accept_call(&self) -> Option<IncomingCall> {
        self.calls.recv().ok()
    }
}

impl Connection {
    /// Dials `address`. The returned end only opens calls; calls opened by the server side are
    /// rejected as `UNIMPLEMENTED`.
    pub fn connect(address: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(address)?;
        let (connection, _) = Self::over_tcp(stream, false)?;
        Ok(connection)
    }

    /// Wraps an accepted TCP stream, serving the calls its peer opens.
    pub fn accept(stream: TcpStream) -> Result<(Self, Acceptor), TransportError> {
        let (connection, acceptor) = Self::over_tcp(stream, true)?;
        let acceptor = acceptor.ok_or(TransportError::Closed)?;
        Ok((connection, acceptor))
    }

    /// Connected in-process pair: a calling end, and an accepting end with its acceptor.
    pub fn pair() -> Result<(Self, Self, Acceptor), TransportError> {
        let ((client_source, client_sink), (server_source, server_sink)) = memory_pipe();
        let (client, _) = Self::start(
            "memory-client".to_string(),
            Box::new(client_source),
            Box::new(client_sink),
            false,
        )?;
        let (server, acceptor) = Self::start(
            "memory-server".to_string(),
            Box::new(server_source),
            Box::new(server_sink),
            true,
        )?;
        let acceptor = acceptor.ok_or(TransportError::Closed)?;
        Ok((client, server, acceptor))
    }

    fn over_tcp(
        stream: TcpStream,
        accepting: bool,
    ) -> Result<(Self, Option<Acceptor>), TransportError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        let reader = FrameReader::new(stream.try_clone()?);
        let writer = FrameWriter::new(stream);
        Self::start(peer, Box::new(reader), Box::new(writer), accepting)
    }

    fn start(
        peer: String,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        accepting: bool,
    ) -> Result<(Self, Option<Acceptor>), TransportError> {
        let shared = Arc::new(Shared {
            peer,
            writer: Mutex::new(sink),
            calls: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let (calls, acceptor) = if accepting {
            let (tx, rx) = mpsc::channel();
            (Some(tx), Some(Acceptor { calls: rx }))
        } else {
            (None, None)
        };

        let reader = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("conn-{}", shared.peer))
            .spawn(move || drive(reader, source, calls))?;

        Ok((Self { shared }, acceptor))
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Closes the connection. Every call still in flight on either end ends `UNKNOWN`.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Opens a call and returns the caller's session for it.
    ///
    /// Fails without touching the wire if `deadline` already fired or expired.
    pub(crate) fn open_call(
        &self,
        method: &str,
        shape: Shape,
        deadline: Deadline,
    ) -> Result<Arc<Session>, Status> {
        deadline.check()?;
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }

        let call = self.shared.next_call.fetch_add(1, Ordering::Relaxed);
        let timeout_ms = deadline
            .remaining()
            .map(|left| u64::try_from(left.as_millis()).unwrap_or(u64::MAX));
        let link = CallLink {
            call,
            shared: Arc::clone(&self.shared),
        };
        let session = Session::open(method, shape, Role::Client, deadline, Box::new(link));
        if let Some(status) = session.status() {
            return Err(status);
        }

        self.shared.register(call, &session);
        debug!("{}: opening {shape} call {call} to '{method}'", self.shared.peer);
        let open = Frame::Open {
            call,
            method: method.to_string(),
            shape,
            timeout_ms,
        };
        self.shared.open(open, &session)?;

        Ok(session)
    }
}

impl Shared {
    fn write(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        trace!("{}: sending {frame:?}", self.peer);
        lock(&self.writer).write_frame(frame)
    }

    /// Writes a call's `Open` frame unless the call already ended. Holding the writer lock
    /// orders any later `Cancel` for the call after its `Open`.
    fn open(&self, frame: Frame, session: &Session) -> Result<(), Status> {
        let mut writer = lock(&self.writer);
        if let Some(status) = session.status() {
            debug!("{}: {} ended before it was opened", self.peer, session.method());
            return Err(status);
        }
        if self.closed.load(Ordering::Acquire) {
            drop(writer);
            let status = Status::from(TransportError::Closed);
            session.peer_aborted(status.clone());
            return Err(status);
        }

        trace!("{}: sending {frame:?}", self.peer);
        let written = writer.write_frame(frame);
        drop(writer);
        written.map_err(|e| {
            let status = Status::from(e);
            session.peer_aborted(status.clone());
            status
        })
    }

    fn register(&self, call: CallId, session: &Arc<Session>) {
        lock(&self.calls).insert(call, Arc::clone(session));
        // The session may have ended before it was routable; its release already ran.
        if session.is_terminal() {
            lock(&self.calls).remove(&call);
        }
    }

    fn lookup(&self, call: CallId) -> Option<Arc<Session>> {
        let session = lock(&self.calls).get(&call).cloned();
        if session.is_none() {
            trace!("{}: frame for unknown or finished call {call}", self.peer);
        }
        session
    }

    fn accept(
        self: &Arc<Self>,
        call: CallId,
        method: String,
        shape: Shape,
        timeout_ms: Option<u64>,
        acceptor: Option<&mpsc::Sender<IncomingCall>>,
    ) {
        let Some(acceptor) = acceptor else {
            warn!("{}: rejecting call {call} to '{method}', this end does not serve calls", self.peer);
            let status = Status::unimplemented(format!("'{method}' is not served by this peer"));
            if let Err(e) = self.write(Frame::Trailer { call, status }) {
                debug!("{}: failed to reject call {call}: {e}", self.peer);
            }
            return;
        };

        let deadline = match timeout_ms {
            Some(ms) => Deadline::after(Duration::from_millis(ms)),
            None => Deadline::none(),
        };
        let link = CallLink {
            call,
            shared: Arc::clone(self),
        };
        let session = Session::open(method, shape, Role::Server, deadline, Box::new(link));
        self.register(call, &session);

        info!("{}: accepted {shape} call {call} to '{}'", self.peer, session.method());
        if let Err(mpsc::SendError(incoming)) = acceptor.send(IncomingCall { session }) {
            incoming
                .session
                .finish(Status::unknown("server stopped accepting calls"));
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("{}: closing connection", self.peer);
        }
        lock(&self.writer).close();
    }

    fn shutdown(&self) {
        self.close();
        let calls: Vec<Arc<Session>> = lock(&self.calls).drain().map(|(_, s)| s).collect();
        if !calls.is_empty() {
            warn!("{}: connection lost with {} calls in flight", self.peer, calls.len());
        }
        for session in calls {
            session.peer_aborted(Status::unknown("connection closed"));
        }
    }
}

/// Shuts the connection down when the reader exits, including by panic.
struct ShutdownOnExit(Arc<Shared>);

impl Drop for ShutdownOnExit {
    fn drop(&mut self) {
        if thread::panicking() {
            warn!("{}: connection reader panicked", self.0.peer);
        }
        self.0.shutdown();
    }
}

fn drive(
    shared: Arc<Shared>,
    mut source: Box<dyn FrameSource>,
    acceptor: Option<mpsc::Sender<IncomingCall>>,
) {
    let _shutdown = ShutdownOnExit(Arc::clone(&shared));
    loop {
        let frame = match source.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("{}: peer closed the connection", shared.peer);
                break;
            }
            Err(e) => {
                warn!("{}: broken connection: {e}", shared.peer);
                break;
            }
        };
        trace!("{}: call {} received {frame:?}", shared.peer, frame.call());

        match frame {
            Frame::Open {
                call,
                method,
                shape,
                timeout_ms,
            } => shared.accept(call, method, shape, timeout_ms, acceptor.as_ref()),
            Frame::Message { call, payload } => {
                if let Some(session) = shared.lookup(call) {
                    session.deliver(payload);
                }
            }
            Frame::HalfClose { call } => {
                if let Some(session) = shared.lookup(call) {
                    session.peer_half_closed();
                }
            }
            Frame::Trailer { call, status } => {
                if let Some(session) = shared.lookup(call) {
                    session.peer_finished(status);
                }
            }
            Frame::Cancel { call, status } => {
                if let Some(session) = shared.lookup(call) {
                    debug!("{}: call {call} cancelled by peer: {status}", shared.peer);
                    session.peer_aborted(status);
                }
            }
        }
    }
}

/// Routes one session's outbound events onto the connection.
struct CallLink {
    call: CallId,
    shared: Arc<Shared>,
}

impl Link for CallLink {
    fn message(&self, payload: Vec<u8>) -> Result<(), Status> {
        if payload.len() > codec::MAX_MESSAGE_SIZE {
            return Err(Status::internal(format!(
                "message of {} bytes exceeds the {} byte limit",
                payload.len(),
                codec::MAX_MESSAGE_SIZE
            )));
        }
        self.shared
            .write(Frame::Message {
                call: self.call,
                payload,
            })
            .map_err(Status::from)
    }

    fn half_close(&self) -> Result<(), Status> {
        self.shared
            .write(Frame::HalfClose { call: self.call })
            .map_err(Status::from)
    }

    fn finish(&self, status: &Status) {
        let frame = Frame::Trailer {
            call: self.call,
            status: status.clone(),
        };
        if let Err(e) = self.shared.write(frame) {
            debug!("{}: trailer for call {} not sent: {e}", self.shared.peer, self.call);
        }
    }

    fn cancel(&self, status: &Status) {
        let frame = Frame::Cancel {
            call: self.call,
            status: status.clone(),
        };
        if let Err(e) = self.shared.write(frame) {
            debug!("{}: cancel for call {} not sent: {e}", self.shared.peer, self.call);
        }
    }

    fn release(&self) {
        lock(&self.shared.calls).remove(&self.call);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        time::Duration,
    };

    use super::*;
    use crate::{Code, DirectionState, deadline::with_timeout};

    #[test]
    fn open_call_reaches_acceptor() {
        let (client, _server, acceptor) = Connection::pair().unwrap();
        let session = client
            .open_call("echo/Echo", Shape::Unary, Deadline::none())
            .unwrap();

        let incoming = acceptor.accept_call().unwrap();
        assert_eq!(incoming.method(), "echo/Echo");
        assert_eq!(incoming.shape(), Shape::Unary);

        session.send(b"ping".to_vec()).unwrap();
        session.close_send().unwrap();
        assert_eq!(incoming.session.recv().unwrap(), Some(b"ping".to_vec()));
        assert_eq!(incoming.session.recv().unwrap(), None);

        incoming.session.send(b"pong".to_vec()).unwrap();
        incoming.session.finish(Status::ok());

        assert_eq!(session.recv().unwrap(), Some(b"pong".to_vec()));
        assert_eq!(session.recv().unwrap(), None);
        assert_eq!(session.status(), Some(Status::ok()));
    }

    #[test]
    fn expired_deadline_never_opens() {
        let (client, _server, acceptor) = Connection::pair().unwrap();
        let deadline = Deadline::after(Duration::ZERO);

        let err = client
            .open_call("echo/Echo", Shape::Unary, deadline)
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);

        client.close();
        assert!(acceptor.accept_call().is_none());
    }

    #[test]
    fn rejected_call_reports_status() {
        let (client, _server, acceptor) = Connection::pair().unwrap();
        let session = client
            .open_call("missing/Method", Shape::BidiStreaming, Deadline::none())
            .unwrap();

        acceptor
            .accept_call()
            .unwrap()
            .reject(Status::unimplemented("no such method"));

        assert_eq!(session.wait().code(), Code::Unimplemented);
    }

    #[test]
    fn caller_cancel_reaches_server() {
        let (client, _server, acceptor) = Connection::pair().unwrap();
        let session = client
            .open_call("slow/Wait", Shape::Unary, Deadline::none())
            .unwrap();
        let incoming = acceptor.accept_call().unwrap();

        session.finish(Status::cancelled("changed my mind"));

        let err = incoming.session.recv().unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
    }

    #[test]
    fn timeout_travels_with_the_call() {
        let (client, _server, acceptor) = Connection::pair().unwrap();
        let _session = client
            .open_call("slow/Wait", Shape::Unary, Deadline::after(Duration::from_secs(30)))
            .unwrap();
        let incoming = acceptor.accept_call().unwrap();

        let remaining = incoming.session.deadline().remaining().unwrap();
        assert!(remaining > Duration::from_secs(20));
    }

    #[test]
    fn closing_connection_ends_calls_unknown() {
        let (client, _server, acceptor) = Connection::pair().unwrap();
        let session = client
            .open_call("stream/Forever", Shape::BidiStreaming, Deadline::none())
            .unwrap();
        let incoming = acceptor.accept_call().unwrap();

        client.close();

        assert_eq!(session.wait().code(), Code::Unknown);
        assert_eq!(incoming.session.recv().unwrap_err().code(), Code::Unknown);
        assert_eq!(incoming.session.send_state(), DirectionState::Closed);
    }

    #[test]
    fn malformed_frame_ends_calls_unknown() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            // Wait for the call to open, then claim a payload far beyond any frame limit.
            let mut opened = [0u8; 1];
            stream.read_exact(&mut opened).unwrap();
            let mut frame = 1u32.to_be_bytes().to_vec();
            frame.extend_from_slice(&1u64.to_be_bytes());
            frame.extend_from_slice(&u64::MAX.to_be_bytes());
            stream.write_all(&frame).unwrap();
            stream
        });

        let client = Connection::connect(address).unwrap();
        let session = client
            .open_call("echo/Echo", Shape::Unary, Deadline::none())
            .unwrap();

        assert_eq!(session.wait().code(), Code::Unknown);
        assert!(client.is_closed());
        drop(peer.join().unwrap());
    }

    #[test]
    fn cancel_racing_open_never_strands_the_server() {
        let (client, _server, acceptor) = Connection::pair().unwrap();
        for _ in 0..50 {
            let (deadline, canceller) = with_timeout(None);
            let cancel = thread::spawn(move || canceller.cancel());
            let _ = client.open_call("race/Cancelled", Shape::BidiStreaming, deadline);
            cancel.join().unwrap();
        }
        let _last = client
            .open_call("race/Last", Shape::Unary, Deadline::none())
            .unwrap();

        loop {
            let incoming = acceptor.accept_call().unwrap();
            if incoming.method() == "race/Last" {
                break;
            }
            let status = incoming.session.wait_timeout(Duration::from_secs(5));
            assert_eq!(status.map(|s| s.code()), Some(Code::Cancelled));
        }
    }

    #[test]
    fn oversized_message_fails_the_call() {
        let (client, _server, acceptor) = Connection::pair().unwrap();
        let session = client
            .open_call("bulk/Upload", Shape::ClientStreaming, Deadline::none())
            .unwrap();
        let incoming = acceptor.accept_call().unwrap();

        let err = session
            .send(vec![0; codec::MAX_MESSAGE_SIZE + 1])
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(session.status().map(|s| s.code()), Some(Code::Internal));
        assert_eq!(incoming.session.wait().code(), Code::Internal);
    }

    #[test]
    fn calls_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let (_connection, acceptor) = Connection::accept(stream).unwrap();
            let incoming = acceptor.accept_call().unwrap();
            let mut total = 0u8;
            while let Some(payload) = incoming.session.recv().unwrap() {
                total += payload[0];
            }
            incoming.session.send(vec![total]).unwrap();
            incoming.session.finish(Status::ok());
        });

        let client = Connection::connect(address).unwrap();
        let session = client
            .open_call("sum/Total", Shape::ClientStreaming, Deadline::none())
            .unwrap();
        for n in [5u8, 2, 7] {
            session.send(vec![n]).unwrap();
        }
        session.close_send().unwrap();

        assert_eq!(session.recv().unwrap(), Some(vec![14]));
        assert_eq!(session.recv().unwrap(), None);
        server.join().unwrap();
        client.close();
    }
}
