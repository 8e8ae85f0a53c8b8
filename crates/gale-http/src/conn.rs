//! Connection identity and per-connection pipeline state.
//!
//! The engine tracks two kinds of connections: client connections the
//! proxy accepts, and upstream connections it forwards over. Each has
//! a cheap shared handle ([`ConnShared`]) that messages point back to,
//! and driver-side state ([`Connection`]) holding the message
//! currently being parsed.
//!
//! Request/response pairing is a queue on the upstream connection:
//! requests are pushed when forwarded and popped in FIFO order as
//! responses complete. HTTP/1.x upstreams never reorder, so the head
//! of the queue is always the request the arriving response answers.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::msg::{Message, Method};

/// Engine-wide connection identifier, chosen by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Accepted from a downstream client.
    Client,
    /// Opened toward an origin server.
    Upstream,
}

impl std::fmt::Display for ConnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Upstream => "upstream",
        })
    }
}

/// State shared between the driver and the messages born on a
/// connection. Messages hold an `Arc` back to this so a response can
/// be routed to its client connection after the request traveled
/// through an upstream queue.
pub struct ConnShared {
    id: ConnId,
    kind: ConnKind,
    peer: Option<SocketAddr>,
    /// Requests forwarded on this (upstream) connection, oldest first,
    /// each awaiting its response. Empty for client connections.
    in_flight: Mutex<VecDeque<Message>>,
}

impl ConnShared {
    #[must_use]
    pub fn new(id: ConnId, kind: ConnKind, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            kind,
            peer,
            in_flight: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Park a forwarded request until its response arrives.
    pub fn push_in_flight(&self, req: Message) {
        debug_assert_eq!(self.kind, ConnKind::Upstream);
        self.in_flight.lock().push_back(req);
    }

    /// Claim the oldest in-flight request for an arriving response.
    /// `None` means the upstream sent a response nobody asked for.
    pub fn pop_in_flight(&self) -> Option<Message> {
        self.in_flight.lock().pop_front()
    }

    /// Take every in-flight request, oldest first. Used at teardown to
    /// answer each one on behalf of the dead upstream.
    pub fn drain_in_flight(&self) -> Vec<Message> {
        self.in_flight.lock().drain(..).collect()
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Method of the oldest in-flight request, if any. Consulted when
    /// a response starts on this connection: a response to HEAD has no
    /// body no matter what its framing headers declare.
    #[must_use]
    pub fn head_method(&self) -> Option<Method> {
        self.in_flight.lock().front().and_then(|req| req.method())
    }
}

impl std::fmt::Debug for ConnShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnShared")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .field("in_flight", &self.in_flight_len())
            .finish()
    }
}

/// Driver-side connection state: the shared handle plus the message
/// currently being assembled from the wire.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) shared: Arc<ConnShared>,
    pub(crate) msg: Option<Message>,
    /// Set once a request on this connection mandated close. Later
    /// reads are discarded; the socket stays open only to carry the
    /// responses still owed.
    pub(crate) read_closed: bool,
}

impl Connection {
    pub(crate) fn new(shared: Arc<ConnShared>) -> Self {
        Self {
            shared,
            msg: None,
            read_closed: false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
