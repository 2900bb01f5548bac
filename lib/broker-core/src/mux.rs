//! Readiness-based event multiplexing. Registrations are tagged with an opaque `Cookie` rather
//! than a raw sentinel `Token`, so dispatch never has to remember which small integers are
//! reserved -- the reservation is encoded in the type.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::peer::PeerSlot;

const CONTROL_TOKEN: usize = 0;
const LISTEN_TOKEN: usize = 1;
const PEER_TOKEN_BASE: usize = 2;

/// Identifies what a readiness event is about. `Peer` carries the slot so dispatch can index
/// straight into the peer table without a reverse lookup.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Cookie {
    Control,
    Listen,
    Peer(PeerSlot),
}

impl Cookie {
    fn to_token(self) -> Token {
        match self {
            Cookie::Control => Token(CONTROL_TOKEN),
            Cookie::Listen => Token(LISTEN_TOKEN),
            Cookie::Peer(PeerSlot(slot)) => Token(PEER_TOKEN_BASE + slot),
        }
    }

    fn from_token(token: Token) -> Cookie {
        match token.0 {
            CONTROL_TOKEN => Cookie::Control,
            LISTEN_TOKEN => Cookie::Listen,
            raw => Cookie::Peer(PeerSlot(raw - PEER_TOKEN_BASE)),
        }
    }
}

/// One readiness notification: which registration it concerns, whether it is readable, and
/// whether it carries an error/hangup condition. The multiplexer always surfaces hangups as this
/// `error` flag rather than a distinct event kind, per the wire contract this mirrors.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub cookie: Cookie,
    pub readable: bool,
    pub error: bool,
}

/// Wraps a single `mio::Poll` plus its reusable `Events` buffer. One multiplexer instance is
/// built per worker tick cycle; a restart (§4.7) replaces it wholesale.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
}

impl Multiplexer {
    /// `capacity` should be `max_clients + 2` so one wakeup can always report every live
    /// descriptor plus the listening and control registrations.
    pub fn new(capacity: usize) -> io::Result<Multiplexer> {
        Ok(Multiplexer {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    pub fn register(&self, fd: RawFd, cookie: Cookie) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), cookie.to_token(), Interest::READABLE)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Blocks until at least one event is ready, then returns the batch in delivery order.
    ///
    /// With `timeout: None` this retries `EINTR` and spurious zero-event wakeups forever, per the
    /// normal-operation contract (§4.5: no timeout, retry on signal or empty batch). With
    /// `timeout: Some(_)` a zero-event return is a legitimate timeout expiry, not a spurious
    /// wakeup, and is returned as an empty batch instead of retried -- used only during the
    /// graceful-shutdown drain, which needs to re-check its deadline periodically.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            if self.events.is_empty() && timeout.is_none() {
                continue;
            }

            return Ok(self
                .events
                .iter()
                .map(|event| ReadyEvent {
                    cookie: Cookie::from_token(event.token()),
                    readable: event.is_readable(),
                    error: event.is_error() || event.is_read_closed(),
                })
                .collect());
        }
    }
}
