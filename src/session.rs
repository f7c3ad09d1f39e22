//! Stream sessions.
//!
//! A [`Session`] is one end of one call. The same state machine serves all four call shapes;
//! the [`Shape`] only decides whether each direction may carry more than one message.
//!
//! # States
//!
//! Each direction moves `Open -> HalfClosed -> Closed`:
//!
//! - `send`: half-closed by [`Session::close_send`], closed when the call ends.
//! - `recv`: half-closed when the peer stops sending (a half-close, or the trailer announcing the
//!   peer has finished), closed when the call ends.
//!
//! The terminal [`Status`] is stamped in the same critical section that closes both directions,
//! so it is set exactly when both directions are closed.
//!
//! A call ends in one of three ways:
//!
//! - the server finishes ([`Session::finish`]) and, for an `OK` outcome, the client drains the
//!   remaining responses before it observes the trailer;
//! - the peer's non-`OK` trailer or cancel frame arrives;
//! - the session is forced through its deadline's token (expiry or [`Canceller`]), a protocol
//!   violation, or a transport fault.
//!
//! Forced termination discards buffered messages and wakes every thread blocked in
//! [`Session::recv`] or [`Session::wait`].
//!
//! [`Canceller`]: crate::deadline::Canceller
use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use bincode::{Decode, Encode};
use log::{debug, trace, warn};

use crate::{
    Status,
    deadline::{Deadline, Subscription},
    sync::{lock, wait, wait_timeout},
};

/// Interaction pattern of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum Shape {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl Shape {
    pub fn many_requests(&self) -> bool {
        matches!(self, Shape::ClientStreaming | Shape::BidiStreaming)
    }

    pub fn many_responses(&self) -> bool {
        matches!(self, Shape::ServerStreaming | Shape::BidiStreaming)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Shape::Unary => "unary",
            Shape::ServerStreaming => "server-streaming",
            Shape::ClientStreaming => "client-streaming",
            Shape::BidiStreaming => "bidi-streaming",
        };
        f.write_str(name)
    }
}

/// Which end of the call a session represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectionState {
    #[default]
    Open,
    HalfClosed,
    Closed,
}

/// Combined view of both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// At least one direction is open.
    Active,
    /// Neither direction is open, but no terminal status yet.
    Draining,
    Terminal,
}

/// Outbound half of a session: how its events reach the peer.
pub(crate) trait Link: Send + Sync {
    fn message(&self, payload: Vec<u8>) -> Result<(), Status>;

    fn half_close(&self) -> Result<(), Status>;

    /// Server to client: the handler is done and `status` is the call's outcome.
    fn finish(&self, status: &Status);

    /// Client to server: the caller abandoned the call.
    fn cancel(&self, status: &Status);

    /// The session is terminal; stop routing peer traffic to it.
    fn release(&self);
}

#[derive(Default)]
struct SessionState {
    send: DirectionState,
    recv: DirectionState,
    sent: usize,
    received: usize,
    inbound: VecDeque<Vec<u8>>,
    /// `OK` trailer from the server, observed once `inbound` is drained.
    trailer: Option<Status>,
    terminal: Option<Status>,
    subscription: Option<Subscription>,
}

impl SessionState {
    fn finished(&self) -> bool {
        self.terminal.is_some() || self.trailer.is_some()
    }
}

pub struct Session {
    method: String,
    shape: Shape,
    role: Role,
    deadline: Deadline,
    link: Box<dyn Link>,
    state: Mutex<SessionState>,
    changed: Condvar,
}

impl Session {
    /// Creates a session and binds it to `deadline`.
    ///
    /// A deadline that already fired or expired leaves the session terminal on return.
    pub(crate) fn open(
        method: impl Into<String>,
        shape: Shape,
        role: Role,
        deadline: Deadline,
        link: Box<dyn Link>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            method: method.into(),
            shape,
            role,
            deadline,
            link,
            state: Mutex::new(SessionState::default()),
            changed: Condvar::new(),
        });
        session.bind();
        session
    }

    fn bind(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let subscribed = self
            .deadline
            .token()
            .subscribe(Box::new(move |status: &Status| {
                if let Some(session) = weak.upgrade() {
                    session.finish(status.clone());
                }
            }));

        match subscribed {
            Ok(subscription) => {
                let stale = {
                    let mut state = lock(&self.state);
                    if state.terminal.is_none() {
                        state.subscription = Some(subscription);
                        None
                    } else {
                        Some(subscription)
                    }
                };
                drop(stale);

                self.deadline.watch();
                self.deadline.enforce();
            }
            Err(reason) => {
                self.finish(reason);
            }
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub fn send_state(&self) -> DirectionState {
        lock(&self.state).send
    }

    pub fn recv_state(&self) -> DirectionState {
        lock(&self.state).recv
    }

    /// Terminal status, once stamped.
    pub fn status(&self) -> Option<Status> {
        lock(&self.state).terminal.clone()
    }

    pub fn is_terminal(&self) -> bool {
        lock(&self.state).terminal.is_some()
    }

    pub fn phase(&self) -> Phase {
        let state = lock(&self.state);
        if state.terminal.is_some() {
            Phase::Terminal
        } else if state.send == DirectionState::Open || state.recv == DirectionState::Open {
            Phase::Active
        } else {
            Phase::Draining
        }
    }

    fn many_outbound(&self) -> bool {
        match self.role {
            Role::Client => self.shape.many_requests(),
            Role::Server => self.shape.many_responses(),
        }
    }

    fn many_inbound(&self) -> bool {
        match self.role {
            Role::Client => self.shape.many_responses(),
            Role::Server => self.shape.many_requests(),
        }
    }

    /// Sends one encoded message to the peer.
    ///
    /// Messages sent once the call has ended are dropped and reported as sent.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), Status> {
        self.deadline.enforce();
        {
            let mut state = lock(&self.state);
            if state.finished() {
                trace!("{}: dropping message sent after the call ended", self.method);
                return Ok(());
            }
            if state.send != DirectionState::Open {
                return Err(Status::internal(format!(
                    "{}: send after half-close",
                    self.method
                )));
            }
            if state.sent > 0 && !self.many_outbound() {
                return Err(Status::internal(format!(
                    "{}: {} call carries a single message in this direction",
                    self.method, self.shape
                )));
            }
            state.sent += 1;
        }

        self.link.message(payload).inspect_err(|status| {
            self.finish(status.clone());
        })
    }

    /// Declares that no further messages will be sent. Repeated calls are no-ops.
    pub fn close_send(&self) -> Result<(), Status> {
        self.deadline.enforce();
        {
            let mut state = lock(&self.state);
            if state.finished() || state.send != DirectionState::Open {
                return Ok(());
            }
            state.send = DirectionState::HalfClosed;
        }
        debug!("{}: send half-closed", self.method);

        self.link.half_close().inspect_err(|status| {
            self.finish(status.clone());
        })
    }

    /// Receives the next message in arrival order.
    ///
    /// `Ok(None)` is the end-of-stream marker: the peer will send nothing more and, on the client,
    /// the call finished `OK`. A non-`OK` outcome is returned as the error.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, Status> {
        self.deadline.enforce();
        let mut state = lock(&self.state);
        loop {
            if let Some(status) = &state.terminal {
                return if status.is_ok() {
                    Ok(None)
                } else {
                    Err(status.clone())
                };
            }
            if let Some(payload) = state.inbound.pop_front() {
                return Ok(Some(payload));
            }
            if state.recv == DirectionState::HalfClosed {
                if let Some(status) = state.trailer.take() {
                    let subscription = self.stamp(&mut state, status);
                    drop(state);
                    self.retire(subscription);
                    state = lock(&self.state);
                    continue;
                }
                if self.role == Role::Server {
                    return Ok(None);
                }
            }
            state = wait(&self.changed, state);
        }
    }

    /// Blocks until the call is terminal and returns its status.
    ///
    /// On the client this only completes once every buffered response has been consumed.
    pub fn wait(&self) -> Status {
        self.deadline.enforce();
        let mut state = lock(&self.state);
        loop {
            if let Some(status) = &state.terminal {
                return status.clone();
            }
            if state.inbound.is_empty() && state.recv == DirectionState::HalfClosed {
                if let Some(status) = state.trailer.take() {
                    let subscription = self.stamp(&mut state, status.clone());
                    drop(state);
                    self.retire(subscription);
                    return status;
                }
            }
            state = wait(&self.changed, state);
        }
    }

    /// Blocks for up to `timeout`, returning early with the status if the call becomes terminal.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Status> {
        let until = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let Some(status) = &state.terminal {
                return Some(status.clone());
            }
            let now = Instant::now();
            if now >= until {
                return None;
            }
            state = wait_timeout(&self.changed, state, until - now);
        }
    }

    /// Ends the call from this side with `status`, discarding buffered messages.
    ///
    /// The server sends `status` as its trailer; the client cancels the call with it. Returns
    /// `false` if the session was already terminal, leaving it untouched.
    pub fn finish(&self, status: Status) -> bool {
        self.terminate(status, true)
    }

    fn terminate(&self, status: Status, notify_peer: bool) -> bool {
        let subscription = {
            let mut state = lock(&self.state);
            if state.terminal.is_some() {
                return false;
            }
            let discarded = state.inbound.len();
            if discarded > 0 {
                debug!("{}: discarding {discarded} unread messages", self.method);
            }
            self.stamp(&mut state, status.clone())
        };

        if notify_peer {
            match self.role {
                Role::Client => self.link.cancel(&status),
                Role::Server => self.link.finish(&status),
            }
        }
        self.retire(subscription);
        true
    }

    /// Closes both directions and records the terminal status. Caller holds the state lock.
    fn stamp(&self, state: &mut SessionState, status: Status) -> Option<Subscription> {
        debug!("{}: {:?} session terminal with {status}", self.method, self.role);
        state.inbound.clear();
        state.trailer = None;
        state.send = DirectionState::Closed;
        state.recv = DirectionState::Closed;
        state.terminal = Some(status);
        state.subscription.take()
    }

    fn retire(&self, subscription: Option<Subscription>) {
        self.changed.notify_all();
        drop(subscription);
        self.link.release();
    }

    /// Buffers a message that arrived from the peer.
    pub(crate) fn deliver(&self, payload: Vec<u8>) {
        let violation = {
            let mut state = lock(&self.state);
            if state.finished() {
                trace!("{}: dropping message for a finished call", self.method);
                return;
            }
            if state.recv != DirectionState::Open {
                warn!("{}: peer sent after half-closing, dropping", self.method);
                return;
            }
            if state.received > 0 && !self.many_inbound() {
                Some(Status::internal(format!(
                    "{}: protocol violation, {} call received more than one message",
                    self.method, self.shape
                )))
            } else {
                state.received += 1;
                state.inbound.push_back(payload);
                None
            }
        };

        match violation {
            Some(status) => {
                warn!("{status}");
                self.finish(status);
            }
            None => self.changed.notify_all(),
        }
    }

    pub(crate) fn peer_half_closed(&self) {
        {
            let mut state = lock(&self.state);
            if state.terminal.is_some() || state.recv != DirectionState::Open {
                return;
            }
            state.recv = DirectionState::HalfClosed;
        }
        debug!("{}: peer half-closed", self.method);
        self.changed.notify_all();
    }

    /// The server's trailer arrived. A failure ends the call at once; success lets the client
    /// drain what is already buffered first.
    pub(crate) fn peer_finished(&self, status: Status) {
        if !status.is_ok() {
            self.terminate(status, false);
            return;
        }

        {
            let mut state = lock(&self.state);
            if state.finished() {
                return;
            }
            state.trailer = Some(status);
            state.recv = DirectionState::HalfClosed;
        }
        self.changed.notify_all();
    }

    /// The peer ended the call (cancel frame or lost connection); nothing is sent back.
    pub(crate) fn peer_aborted(&self, status: Status) {
        self.terminate(status, false);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("method", &self.method)
            .field("shape", &self.shape)
            .field("role", &self.role)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::{Code, deadline::with_timeout};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Message(Vec<u8>),
        HalfClose,
        Finish(Code),
        Cancel(Code),
        Release,
    }

    #[derive(Default, Clone)]
    struct Tap {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl Tap {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Link for Tap {
        fn message(&self, payload: Vec<u8>) -> Result<(), Status> {
            self.push(Event::Message(payload));
            Ok(())
        }

        fn half_close(&self) -> Result<(), Status> {
            self.push(Event::HalfClose);
            Ok(())
        }

        fn finish(&self, status: &Status) {
            self.push(Event::Finish(status.code()));
        }

        fn cancel(&self, status: &Status) {
            self.push(Event::Cancel(status.code()));
        }

        fn release(&self) {
            self.push(Event::Release);
        }
    }

    fn session(shape: Shape, role: Role, deadline: Deadline) -> (Arc<Session>, Tap) {
        let tap = Tap::default();
        let session = Session::open("test/Method", shape, role, deadline, Box::new(tap.clone()));
        (session, tap)
    }

    #[test]
    fn send_after_half_close_is_internal() {
        let (session, _) = session(Shape::ClientStreaming, Role::Client, Deadline::none());
        session.send(vec![1]).unwrap();
        session.close_send().unwrap();

        let err = session.send(vec![2]).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(session.send_state(), DirectionState::HalfClosed);
    }

    #[test]
    fn single_message_direction_rejects_second_send() {
        let (session, tap) = session(Shape::Unary, Role::Client, Deadline::none());
        session.send(vec![1]).unwrap();

        assert_eq!(session.send(vec![2]).unwrap_err().code(), Code::Internal);
        assert_eq!(tap.events(), vec![Event::Message(vec![1])]);
    }

    #[test]
    fn close_send_is_idempotent() {
        let (session, tap) = session(Shape::BidiStreaming, Role::Client, Deadline::none());
        session.close_send().unwrap();
        session.close_send().unwrap();

        assert_eq!(tap.events(), vec![Event::HalfClose]);
    }

    #[test]
    fn server_receives_in_order_then_end_marker() {
        let (session, _) = session(Shape::ClientStreaming, Role::Server, Deadline::none());
        session.deliver(vec![5]);
        session.deliver(vec![2]);
        session.deliver(vec![7]);
        session.peer_half_closed();

        assert_eq!(session.recv().unwrap(), Some(vec![5]));
        assert_eq!(session.recv().unwrap(), Some(vec![2]));
        assert_eq!(session.recv().unwrap(), Some(vec![7]));
        assert_eq!(session.recv().unwrap(), None);
        assert_eq!(session.recv().unwrap(), None);
        assert_eq!(session.phase(), Phase::Active);
    }

    #[test]
    fn client_drains_before_ok_trailer() {
        let (session, tap) = session(Shape::ServerStreaming, Role::Client, Deadline::none());
        session.send(vec![12]).unwrap();
        session.close_send().unwrap();
        session.deliver(vec![2]);
        session.deliver(vec![3]);
        session.peer_finished(Status::ok());

        assert_eq!(session.phase(), Phase::Draining);
        assert!(session.status().is_none());

        assert_eq!(session.recv().unwrap(), Some(vec![2]));
        assert_eq!(session.recv().unwrap(), Some(vec![3]));
        assert_eq!(session.recv().unwrap(), None);

        assert_eq!(session.status(), Some(Status::ok()));
        assert_eq!(session.send_state(), DirectionState::Closed);
        assert_eq!(session.recv_state(), DirectionState::Closed);
        assert_eq!(session.phase(), Phase::Terminal);
        assert_eq!(tap.events().last(), Some(&Event::Release));
    }

    #[test]
    fn failed_trailer_discards_buffered_messages() {
        let (session, tap) = session(Shape::BidiStreaming, Role::Client, Deadline::none());
        session.deliver(vec![1]);
        session.peer_finished(Status::invalid_argument("bad input"));

        let err = session.recv().unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "bad input");
        // The server already knows; nothing goes back.
        assert_eq!(tap.events(), vec![Event::Release]);
    }

    #[test]
    fn second_response_on_unary_is_protocol_violation() {
        let (session, tap) = session(Shape::Unary, Role::Client, Deadline::none());
        session.deliver(vec![1]);
        session.deliver(vec![2]);

        assert_eq!(session.recv().unwrap_err().code(), Code::Internal);
        assert!(tap.events().contains(&Event::Cancel(Code::Internal)));
    }

    #[test]
    fn server_finish_stamps_terminal_and_sends_trailer() {
        let (session, tap) = session(Shape::Unary, Role::Server, Deadline::none());
        session.deliver(vec![9]);
        assert!(session.finish(Status::ok()));
        assert!(!session.finish(Status::internal("late")));

        assert_eq!(session.status(), Some(Status::ok()));
        assert_eq!(
            tap.events(),
            vec![Event::Finish(Code::Ok), Event::Release]
        );
    }

    #[test]
    fn client_finish_cancels_and_discards_buffered() {
        let (session, tap) = session(Shape::ServerStreaming, Role::Client, Deadline::none());
        session.deliver(vec![1]);
        assert!(session.finish(Status::cancelled("stream dropped")));

        assert_eq!(session.recv().unwrap_err().code(), Code::Cancelled);
        assert_eq!(
            tap.events(),
            vec![Event::Cancel(Code::Cancelled), Event::Release]
        );
    }

    #[test]
    fn send_after_terminal_is_dropped() {
        let (session, tap) = session(Shape::BidiStreaming, Role::Server, Deadline::none());
        session.peer_aborted(Status::cancelled("gone"));

        session.send(vec![1]).unwrap();
        assert_eq!(tap.events(), vec![Event::Release]);
    }

    #[test]
    fn expired_deadline_terminates_on_open() {
        let deadline = Deadline::at(Instant::now() - Duration::from_millis(1));
        let (session, tap) = session(Shape::Unary, Role::Client, deadline);

        assert_eq!(session.status().unwrap().code(), Code::DeadlineExceeded);
        assert_eq!(session.recv().unwrap_err().code(), Code::DeadlineExceeded);
        assert_eq!(
            tap.events(),
            vec![Event::Cancel(Code::DeadlineExceeded), Event::Release]
        );
    }

    #[test]
    fn cancel_twice_keeps_first_status() {
        let (deadline, canceller) = with_timeout(None);
        let (session, tap) = session(Shape::BidiStreaming, Role::Client, deadline);

        canceller.cancel();
        canceller.cancel();

        assert_eq!(session.status().unwrap().code(), Code::Cancelled);
        let cancels = tap
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Cancel(_)))
            .count();
        assert_eq!(cancels, 1);
    }

    #[test]
    fn cancel_after_terminal_is_noop() {
        let (deadline, canceller) = with_timeout(None);
        let (session, _) = session(Shape::Unary, Role::Client, deadline);
        session.deliver(vec![1]);
        session.peer_finished(Status::ok());
        assert_eq!(session.wait(), Status::ok());

        canceller.cancel();
        assert_eq!(session.status(), Some(Status::ok()));
    }

    #[test]
    fn deadline_unblocks_pending_recv() {
        let (deadline, _canceller) = with_timeout(Some(Duration::from_millis(50)));
        let (session, _) = session(Shape::BidiStreaming, Role::Client, deadline);

        let receiver = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.recv())
        };

        let err = receiver.join().unwrap().unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[test]
    fn cancel_unblocks_pending_wait() {
        let (deadline, canceller) = with_timeout(None);
        let (session, _) = session(Shape::ClientStreaming, Role::Client, deadline);

        let waiter = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.wait())
        };
        thread::sleep(Duration::from_millis(20));
        canceller.cancel();

        assert_eq!(waiter.join().unwrap().code(), Code::Cancelled);
    }

    #[test]
    fn wait_timeout_returns_none_while_active() {
        let (session, _) = session(Shape::Unary, Role::Server, Deadline::none());
        assert_eq!(session.wait_timeout(Duration::from_millis(5)), None);

        session.peer_aborted(Status::cancelled("caller left"));
        assert_eq!(
            session.wait_timeout(Duration::from_secs(1)).unwrap().code(),
            Code::Cancelled
        );
    }
}
