//! Call dispatcher.
//!
//! [`Client`] opens calls on a [`Connection`], one entry point per call shape, and hands back
//! typed handles over the call's [`Session`]:
//!
//! - [`Client::call_unary`]: one request, one response.
//! - [`Client::call_server_streaming`]: one request, a [`ResponseStream`].
//! - [`Client::call_client_streaming`]: a [`ClientStreamingCall`] to send on, then finish.
//! - [`Client::call_bidi_streaming`]: a [`RequestSink`] and a [`ResponseStream`] that can be
//!   driven from separate threads.
//!
//! Every failure is a [`Status`]; inspect its [`Code`](crate::Code) to tell an application
//! failure such as `INVALID_ARGUMENT` from `DEADLINE_EXCEEDED` or a transport fault.
use std::{marker::PhantomData, net::ToSocketAddrs, sync::Arc};

use bincode::{Decode, Encode};
use log::debug;

use crate::{
    Deadline, Shape, Status, codec,
    session::Session,
    transport::{Connection, TransportError},
};

#[derive(Clone)]
pub struct Client {
    connection: Connection,
}

impl Client {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connect(address: impl ToSocketAddrs) -> Result<Self, TransportError> {
        Ok(Self::new(Connection::connect(address)?))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn close(&self) {
        self.connection.close();
    }

    pub fn call_unary<Req, Resp>(
        &self,
        method: &str,
        request: Req,
        deadline: Deadline,
    ) -> Result<Resp, Status>
    where
        Req: Encode,
        Resp: Decode<()>,
    {
        let session = self.connection.open_call(method, Shape::Unary, deadline)?;
        let outcome = send_request(&session, request).and_then(|_| single_response(&session));
        if let Err(status) = &outcome {
            // Local failures (encoding, protocol) must not leave the server waiting.
            session.finish(status.clone());
        }
        outcome
    }

    pub fn call_server_streaming<Req, Resp>(
        &self,
        method: &str,
        request: Req,
        deadline: Deadline,
    ) -> Result<ResponseStream<Resp>, Status>
    where
        Req: Encode,
        Resp: Decode<()>,
    {
        let session = self
            .connection
            .open_call(method, Shape::ServerStreaming, deadline)?;
        if let Err(status) = send_request(&session, request) {
            session.finish(status.clone());
            return Err(status);
        }
        Ok(ResponseStream::new(session))
    }

    pub fn call_client_streaming<Req, Resp>(
        &self,
        method: &str,
        deadline: Deadline,
    ) -> Result<ClientStreamingCall<Req, Resp>, Status>
    where
        Req: Encode,
        Resp: Decode<()>,
    {
        let session = self
            .connection
            .open_call(method, Shape::ClientStreaming, deadline)?;
        Ok(ClientStreamingCall {
            session,
            finished: false,
            _marker: PhantomData,
        })
    }

    pub fn call_bidi_streaming<Req, Resp>(
        &self,
        method: &str,
        deadline: Deadline,
    ) -> Result<(RequestSink<Req>, ResponseStream<Resp>), Status>
    where
        Req: Encode,
        Resp: Decode<()>,
    {
        let session = self
            .connection
            .open_call(method, Shape::BidiStreaming, deadline)?;
        let sink = RequestSink {
            session: Arc::clone(&session),
            _marker: PhantomData,
        };
        Ok((sink, ResponseStream::new(session)))
    }
}

fn send_request<Req: Encode>(session: &Session, request: Req) -> Result<(), Status> {
    session.send(codec::encode(request)?)?;
    session.close_send()
}

/// Reads exactly one response followed by an `OK` end of call.
fn single_response<Resp: Decode<()>>(session: &Session) -> Result<Resp, Status> {
    let payload = session.recv()?.ok_or_else(|| {
        Status::internal(format!("{}: call completed without a response", session.method()))
    })?;
    let response = codec::decode(&payload)?;

    match session.recv()? {
        None => Ok(response),
        Some(_) => Err(Status::internal(format!(
            "{}: protocol violation, more than one response",
            session.method()
        ))),
    }
}

/// Lazy, finite sequence of responses. Not restartable.
///
/// Iteration yields each response in arrival order, then ends. A non-`OK` outcome is yielded once
/// as an `Err` and ends the sequence. Dropping the stream before the call is over cancels it.
pub struct ResponseStream<Resp> {
    session: Arc<Session>,
    done: bool,
    _marker: PhantomData<fn() -> Resp>,
}

impl<Resp: Decode<()>> ResponseStream<Resp> {
    fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            done: false,
            _marker: PhantomData,
        }
    }

    /// Next response; `Ok(None)` once the call has ended `OK`.
    pub fn recv(&mut self) -> Result<Option<Resp>, Status> {
        if self.done {
            return Ok(None);
        }
        let outcome = match self.session.recv() {
            Ok(Some(payload)) => codec::decode(&payload).map(Some),
            Ok(None) => Ok(None),
            Err(status) => Err(status),
        };
        match &outcome {
            Ok(Some(_)) => {}
            Ok(None) => self.done = true,
            Err(status) => {
                self.done = true;
                self.session.finish(status.clone());
            }
        }
        outcome
    }

    /// Terminal status, once the call has ended.
    pub fn status(&self) -> Option<Status> {
        self.session.status()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl<Resp: Decode<()>> Iterator for ResponseStream<Resp> {
    type Item = Result<Resp, Status>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv().transpose()
    }
}

impl<Resp> Drop for ResponseStream<Resp> {
    fn drop(&mut self) {
        if self
            .session
            .finish(Status::cancelled("response stream dropped"))
        {
            debug!("{}: cancelled on drop", self.session.method());
        }
    }
}

/// Sending half of a bidirectional call. Dropping it half-closes the send direction.
pub struct RequestSink<Req> {
    session: Arc<Session>,
    _marker: PhantomData<fn(Req)>,
}

impl<Req: Encode> RequestSink<Req> {
    pub fn send(&self, request: Req) -> Result<(), Status> {
        self.session.send(codec::encode(request)?)
    }

    pub fn close_send(&self) -> Result<(), Status> {
        self.session.close_send()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl<Req> Drop for RequestSink<Req> {
    fn drop(&mut self) {
        if let Err(status) = self.session.close_send() {
            debug!("{}: half-close on drop failed: {status}", self.session.method());
        }
    }
}

/// Client-streaming call in progress: send any number of requests, then [`finish`].
///
/// Dropping it without finishing cancels the call.
///
/// [`finish`]: ClientStreamingCall::finish
pub struct ClientStreamingCall<Req, Resp> {
    session: Arc<Session>,
    finished: bool,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Encode, Resp: Decode<()>> ClientStreamingCall<Req, Resp> {
    pub fn send(&self, request: Req) -> Result<(), Status> {
        self.session.send(codec::encode(request)?)
    }

    /// Half-closes the call and waits for the single response.
    pub fn finish(mut self) -> Result<Resp, Status> {
        self.finished = true;
        let outcome = self
            .session
            .close_send()
            .and_then(|_| single_response(&self.session));
        if let Err(status) = &outcome {
            self.session.finish(status.clone());
        }
        outcome
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl<Req, Resp> Drop for ClientStreamingCall<Req, Resp> {
    fn drop(&mut self) {
        if !self.finished {
            self.session
                .finish(Status::cancelled("client-streaming call dropped"));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::{Code, Phase, deadline::with_timeout, transport::Acceptor};

    fn client() -> (Client, Acceptor) {
        let (connection, _server, acceptor) = Connection::pair().unwrap();
        (Client::new(connection), acceptor)
    }

    #[test]
    fn unary_round_trip() {
        let (client, acceptor) = client();
        let server = thread::spawn(move || {
            let call = acceptor.accept_call().unwrap();
            let request: u32 = codec::decode(&call.session.recv().unwrap().unwrap()).unwrap();
            call.session.send(codec::encode(request * 2).unwrap()).unwrap();
            call.session.finish(Status::ok());
        });

        let response: u32 = client
            .call_unary("math/Double", 21u32, Deadline::none())
            .unwrap();
        assert_eq!(response, 42);
        server.join().unwrap();
    }

    #[test]
    fn unary_without_response_is_internal() {
        let (client, acceptor) = client();
        let server = thread::spawn(move || {
            let call = acceptor.accept_call().unwrap();
            call.session.finish(Status::ok());
        });

        let err = client
            .call_unary::<u32, u32>("math/Nothing", 1, Deadline::none())
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        server.join().unwrap();
    }

    #[test]
    fn expired_deadline_fails_before_any_exchange() {
        let (client, acceptor) = client();
        let (deadline, _) = with_timeout(Some(Duration::ZERO));

        let err = client
            .call_unary::<u32, u32>("math/Double", 1, deadline)
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);

        client.close();
        assert!(acceptor.accept_call().is_none());
    }

    #[test]
    fn dropping_response_stream_cancels_call() {
        let (client, acceptor) = client();
        let stream: ResponseStream<u32> = client
            .call_server_streaming("count/Forever", 0u32, Deadline::none())
            .unwrap();
        let call = acceptor.accept_call().unwrap();

        drop(stream);
        assert_eq!(call.session.wait().code(), Code::Cancelled);
    }

    #[test]
    fn response_stream_yields_failure_once() {
        let (client, acceptor) = client();
        let mut stream: ResponseStream<u32> = client
            .call_server_streaming("count/Fail", 0u32, Deadline::none())
            .unwrap();
        let call = acceptor.accept_call().unwrap();
        call.session.finish(Status::internal("boom"));

        assert_eq!(stream.next().unwrap().unwrap_err().code(), Code::Internal);
        assert!(stream.next().is_none());
        assert_eq!(stream.session().phase(), Phase::Terminal);
    }

    #[test]
    fn dropping_unfinished_client_stream_cancels() {
        let (client, acceptor) = client();
        let call: ClientStreamingCall<u32, u32> = client
            .call_client_streaming("sum/Total", Deadline::none())
            .unwrap();
        call.send(1).unwrap();
        let incoming = acceptor.accept_call().unwrap();

        drop(call);
        assert_eq!(incoming.session.wait().code(), Code::Cancelled);
    }

    #[test]
    fn cancel_unblocks_finish() {
        let (client, acceptor) = client();
        let (deadline, canceller) = with_timeout(None);
        let call: ClientStreamingCall<u32, u32> = client
            .call_client_streaming("sum/Stall", deadline)
            .unwrap();
        let _incoming = acceptor.accept_call().unwrap();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        assert_eq!(call.finish().unwrap_err().code(), Code::Cancelled);
        canceller.join().unwrap();
    }
}
