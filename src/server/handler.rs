use std::{
    any::Any,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use bincode::{Decode, Encode};
use log::{debug, warn};

use crate::{
    Deadline, Shape, Status, codec, session::Session, transport::IncomingCall,
};

/// What a handler can observe about the call it serves.
pub struct CallContext {
    session: Arc<Session>,
}

impl CallContext {
    pub fn method(&self) -> &str {
        self.session.method()
    }

    /// The caller's deadline as propagated with the call.
    pub fn deadline(&self) -> &Deadline {
        self.session.deadline()
    }

    /// `true` once the caller cancelled, the deadline passed, or the call otherwise ended.
    pub fn is_cancelled(&self) -> bool {
        self.session.is_terminal() || self.session.deadline().is_expired()
    }

    /// Sleeps for `duration`, waking early with the call's status if it ends meanwhile.
    pub fn sleep(&self, duration: Duration) -> Result<(), Status> {
        match self.session.wait_timeout(duration) {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}

/// Requests arriving on a call, in send order.
pub struct RequestStream<Req> {
    session: Arc<Session>,
    _marker: PhantomData<fn() -> Req>,
}

impl<Req: Decode<()>> RequestStream<Req> {
    /// Next request; `Ok(None)` once the caller half-closed.
    pub fn recv(&mut self) -> Result<Option<Req>, Status> {
        match self.session.recv()? {
            Some(payload) => codec::decode(&payload).map(Some),
            None => Ok(None),
        }
    }
}

impl<Req: Decode<()>> Iterator for RequestStream<Req> {
    type Item = Result<Req, Status>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv().transpose()
    }
}

/// Sends responses back to the caller.
pub struct ResponseSink<Resp> {
    session: Arc<Session>,
    _marker: PhantomData<fn(Resp)>,
}

impl<Resp: Encode> ResponseSink<Resp> {
    /// Responses sent after the call ended are dropped.
    pub fn send(&self, response: Resp) -> Result<(), Status> {
        self.session.send(codec::encode(response)?)
    }
}

impl IncomingCall {
    /// Serves a unary call: one request in, one response out.
    pub fn unary<Req, Resp, F>(self, handler: F)
    where
        Req: Decode<()>,
        Resp: Encode,
        F: FnOnce(&CallContext, Req) -> Result<Resp, Status>,
    {
        self.invoke::<Req, Resp, _>(Shape::Unary, |context, mut requests, responses| {
            let request = single_request(&mut requests)?;
            let response = handler(context, request)?;
            responses.send(response)
        })
    }

    /// Serves a server-streaming call: one request in, any number of responses out.
    pub fn server_streaming<Req, Resp, F>(self, handler: F)
    where
        Req: Decode<()>,
        Resp: Encode,
        F: FnOnce(&CallContext, Req, &ResponseSink<Resp>) -> Result<(), Status>,
    {
        self.invoke::<Req, Resp, _>(Shape::ServerStreaming, |context, mut requests, responses| {
            let request = single_request(&mut requests)?;
            handler(context, request, &responses)
        })
    }

    /// Serves a client-streaming call: requests until half-close, then one response out.
    pub fn client_streaming<Req, Resp, F>(self, handler: F)
    where
        Req: Decode<()>,
        Resp: Encode,
        F: FnOnce(&CallContext, &mut RequestStream<Req>) -> Result<Resp, Status>,
    {
        self.invoke::<Req, Resp, _>(Shape::ClientStreaming, |context, mut requests, responses| {
            let response = handler(context, &mut requests)?;
            responses.send(response)
        })
    }

    /// Serves a bidirectional call: both directions stream independently.
    pub fn bidi_streaming<Req, Resp, F>(self, handler: F)
    where
        Req: Decode<()>,
        Resp: Encode,
        F: FnOnce(&CallContext, &mut RequestStream<Req>, &ResponseSink<Resp>) -> Result<(), Status>,
    {
        self.invoke::<Req, Resp, _>(Shape::BidiStreaming, |context, mut requests, responses| {
            handler(context, &mut requests, &responses)
        })
    }

    /// Runs `body` against the call and finishes the session with its outcome.
    fn invoke<Req, Resp, F>(self, shape: Shape, body: F)
    where
        F: FnOnce(&CallContext, RequestStream<Req>, ResponseSink<Resp>) -> Result<(), Status>,
    {
        let session = self.session;
        if session.shape() != shape {
            let status = Status::unimplemented(format!(
                "{} is served as {shape} but was called as {}",
                session.method(),
                session.shape()
            ));
            warn!("{status}");
            session.finish(status);
            return;
        }

        let context = CallContext {
            session: Arc::clone(&session),
        };
        let requests = RequestStream {
            session: Arc::clone(&session),
            _marker: PhantomData,
        };
        let responses = ResponseSink {
            session: Arc::clone(&session),
            _marker: PhantomData,
        };

        let outcome =
            match panic::catch_unwind(AssertUnwindSafe(|| body(&context, requests, responses))) {
                Ok(Ok(())) => Status::ok(),
                Ok(Err(status)) => status,
                Err(panic) => {
                    let status = Status::internal(panic_message(panic.as_ref()));
                    warn!("{}: handler panicked: {status}", session.method());
                    status
                }
            };

        debug!("{}: handler returned {outcome}", session.method());
        session.finish(outcome);
    }
}

fn single_request<Req: Decode<()>>(requests: &mut RequestStream<Req>) -> Result<Req, Status> {
    requests.recv()?.ok_or_else(|| {
        Status::internal(format!(
            "{}: call carried no request",
            requests.session.method()
        ))
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
