//! Deadlines and cancellation.
//!
//! A call's deadline is an absolute expiry instant (or none) paired with a [`CancelToken`].
//! The token is the single cancellation signal for the call: the caller's [`Canceller`], the
//! expiry watchdog and the session's blocking operations all go through it, so the send loop,
//! the receive loop and the timer never need to reference each other.
//!
//! A token fires at most once. The first reason wins; later attempts are no-ops.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use duplex::{Code, deadline::with_timeout};
//!
//! let (deadline, canceller) = with_timeout(Some(Duration::from_secs(5)));
//! assert!(deadline.check().is_ok());
//!
//! canceller.cancel();
//! canceller.cancel();
//! assert_eq!(deadline.check().unwrap_err().code(), Code::Cancelled);
//! ```
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};

use crate::{
    Status,
    sync::{lock, wait_timeout},
};

type Subscriber = Box<dyn FnOnce(&Status) + Send>;

#[derive(Default)]
struct TokenState {
    reason: Option<Status>,
    subscribers: HashMap<u64, Subscriber>,
    next_id: u64,
    watching: bool,
}

#[derive(Default)]
struct TokenInner {
    state: Mutex<TokenState>,
    changed: Condvar,
}

/// Shared, fire-once cancellation signal.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status the token fired with, if it has fired.
    pub fn reason(&self) -> Option<Status> {
        lock(&self.inner.state).reason.clone()
    }

    pub fn is_fired(&self) -> bool {
        lock(&self.inner.state).reason.is_some()
    }

    /// Fires the token. Returns `false` if it had already fired.
    ///
    /// Subscribers run on the calling thread, after the token lock is released.
    pub fn fire(&self, status: Status) -> bool {
        let subscribers = {
            let mut state = lock(&self.inner.state);
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(status.clone());
            std::mem::take(&mut state.subscribers)
        };
        self.inner.changed.notify_all();

        debug!("cancel token fired with {status}");
        for (_, subscriber) in subscribers {
            subscriber(&status);
        }
        true
    }

    /// Registers `subscriber` to run when the token fires.
    ///
    /// If the token already fired, the subscriber is dropped and the reason is returned.
    pub(crate) fn subscribe(&self, subscriber: Subscriber) -> Result<Subscription, Status> {
        let mut state = lock(&self.inner.state);
        if let Some(reason) = &state.reason {
            return Err(reason.clone());
        }

        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, subscriber);
        Ok(Subscription {
            token: self.clone(),
            id,
        })
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Live registration on a [`CancelToken`]; dropping it unregisters.
pub(crate) struct Subscription {
    token: CancelToken,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let removed = lock(&self.token.inner.state).subscribers.remove(&self.id);
        drop(removed);
        // Lets an idle watchdog notice it has nobody left to watch for.
        self.token.inner.changed.notify_all();
    }
}

/// Absolute expiry for a call, plus the call's cancellation token.
///
/// The expiry instant never changes once the deadline exists. Clones share the token.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    expires_at: Option<Instant>,
    token: CancelToken,
}

impl Deadline {
    /// A deadline that never expires. It can still be cancelled through its token.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn after(timeout: Duration) -> Self {
        Self {
            // An unrepresentable instant is as good as no deadline at all.
            expires_at: Instant::now().checked_add(timeout),
            token: CancelToken::new(),
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            expires_at: Some(instant),
            token: CancelToken::new(),
        }
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Time left before expiry; zero once expired, `None` without an expiry.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Fails with the status a call bound to this deadline would be forced to, if any.
    pub fn check(&self) -> Result<(), Status> {
        if let Some(reason) = self.token.reason() {
            return Err(reason);
        }
        if self.is_expired() {
            return Err(expired());
        }
        Ok(())
    }

    /// Fires the token with `DEADLINE_EXCEEDED` if the expiry has passed.
    pub(crate) fn enforce(&self) -> bool {
        self.is_expired() && self.token.fire(expired())
    }

    /// Starts the expiry watchdog for this deadline's token, unless one is already running.
    ///
    /// The watchdog exits once the token fires or its last subscription is dropped.
    pub(crate) fn watch(&self) {
        let Some(expires_at) = self.expires_at else {
            return;
        };

        {
            let mut state = lock(&self.token.inner.state);
            if state.watching || state.reason.is_some() {
                return;
            }
            state.watching = true;
        }

        let token = self.token.clone();
        let spawned = thread::Builder::new()
            .name("deadline-watchdog".to_string())
            .spawn(move || watchdog(token, expires_at));

        if let Err(e) = spawned {
            // Blocking session operations still check expiry on entry.
            warn!("failed to start deadline watchdog: {e}");
            lock(&self.token.inner.state).watching = false;
        }
    }
}

fn watchdog(token: CancelToken, expires_at: Instant) {
    let mut state = lock(&token.inner.state);
    loop {
        if state.reason.is_some() || state.subscribers.is_empty() {
            trace!("deadline watchdog retiring");
            state.watching = false;
            return;
        }

        let now = Instant::now();
        if now >= expires_at {
            state.watching = false;
            drop(state);
            token.fire(expired());
            return;
        }

        state = wait_timeout(&token.inner.changed, state, expires_at - now);
    }
}

fn expired() -> Status {
    Status::deadline_exceeded("deadline exceeded")
}

/// Caller-side handle that cancels the call bound to a [`Deadline`].
#[derive(Debug, Clone)]
pub struct Canceller {
    token: CancelToken,
}

impl Canceller {
    /// Forces the bound call to `CANCELLED` unless it is already terminal.
    pub fn cancel(&self) {
        if !self.token.fire(Status::cancelled("call cancelled by caller")) {
            trace!("cancel ignored, token already fired");
        }
    }
}

/// Builds a deadline `timeout` from now (none if `timeout` is `None`) and its canceller.
pub fn with_timeout(timeout: Option<Duration>) -> (Deadline, Canceller) {
    let deadline = match timeout {
        Some(timeout) => Deadline::after(timeout),
        None => Deadline::none(),
    };
    let canceller = Canceller {
        token: deadline.token.clone(),
    };
    (deadline, canceller)
}
