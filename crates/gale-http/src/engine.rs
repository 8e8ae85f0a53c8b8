//! Connection lifecycle driver: feeds wire bytes to the parser,
//! forwards completed requests, pairs responses, and answers on the
//! origin's behalf when it cannot.
//!
//! The engine owns every tracked connection and one shared buffer
//! arena. The embedder pushes received bytes in through
//! [`ProxyEngine::on_data`] and supplies routing, filtering, and I/O
//! through [`ProxyHooks`]; the engine never touches a socket itself.
//!
//! A malformed or oversized message is fatal for its connection, and
//! a dead upstream never strands a client: requests still in flight
//! when an upstream goes away each get a synthesized answer so their
//! clients see a response instead of a stalled read.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use gale_core::{BufArena, BufId, LogConfig, LogEntry, LogLevel, Logger, StrError, ZStr};

use crate::build::{ConnDirective, SynthStatus, WireMessage, emit_request, emit_response,
    imf_fixdate, synth_response};
use crate::conn::{ConnId, ConnKind, ConnShared, Connection};
use crate::header::SpecialHdr;
use crate::msg::{BodyFraming, Message, Method, MsgKind, Version};
use crate::parser::{BlockReason, ParseLimits, ParseStep, StepOutcome, parse_chunk};

// ============================================================================
// Error classification
// ============================================================================

/// Coarse category attached to every logged protocol failure, meant
/// for counting and alerting rather than diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bytes that cannot be HTTP.
    Malformed,
    /// A configured limit was hit.
    ResourceExhausted,
    /// A response arrived with no request waiting for it.
    PairingViolation,
    /// Well-formed bytes carrying a known smuggling or confusion
    /// vector, such as duplicate singletons or mixed framing.
    ProtocolAnomaly,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Malformed => "malformed",
            Self::ResourceExhausted => "resource-exhausted",
            Self::PairingViolation => "pairing-violation",
            Self::ProtocolAnomaly => "protocol-anomaly",
        })
    }
}

/// Category for a parser verdict. Pairing violations never come from
/// the parser; the engine raises those itself.
#[must_use]
pub fn classify(reason: BlockReason) -> ErrorClass {
    match reason {
        BlockReason::DuplicateHeader(_) | BlockReason::AmbiguousFraming => {
            ErrorClass::ProtocolAnomaly
        }
        BlockReason::RequestLineTooLong
        | BlockReason::HeaderLineTooLong
        | BlockReason::TooManyHeaders => ErrorClass::ResourceExhausted,
        _ => ErrorClass::Malformed,
    }
}

// ============================================================================
// Hook-facing types
// ============================================================================

/// Why a send could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The connection is gone.
    Closed,
    /// The socket cannot take more data right now.
    Backpressure,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "connection closed",
            Self::Backpressure => "send buffer full",
        })
    }
}

impl std::error::Error for SendError {}

/// What the embedder should do with the connection a read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockAction {
    KeepOpen,
    Close,
}

/// Failure while rewriting a message's headers for forwarding.
#[derive(Debug)]
pub enum AdjustError {
    /// The buffer arena has no free slots for a rewritten value.
    ArenaFull,
    /// An existing header value could not be linearized.
    Materialize(StrError),
}

impl std::fmt::Display for AdjustError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArenaFull => write!(f, "buffer arena exhausted"),
            Self::Materialize(err) => write!(f, "header value unreadable: {err}"),
        }
    }
}

impl std::error::Error for AdjustError {}

/// Embedder-supplied policy and I/O. The engine calls these at fixed
/// points in the message lifecycle. Only
/// [`pick_upstream`](Self::pick_upstream), [`send`](Self::send), and
/// [`close_conn`](Self::close_conn) have no default; the rest default
/// to pass-through.
pub trait ProxyHooks {
    /// Route a completed request. `None` means no upstream is
    /// available and the client gets a 502.
    fn pick_upstream(&mut self, req: &Message, arena: &BufArena) -> Option<ConnId>;

    /// Write an assembled message to a connection's socket. The
    /// message's spans are only valid for the duration of the call;
    /// keep [`WireMessage::into_owned`] in mind for queued writers.
    fn send(&mut self, conn: ConnId, wire: &WireMessage, arena: &BufArena)
    -> Result<(), SendError>;

    /// Close a connection the engine is done with. Also called for
    /// connections the engine tears down on protocol errors.
    fn close_conn(&mut self, conn: ConnId);

    /// Verdict on a completed request. `false` answers 403 and closes
    /// the client connection.
    fn filter_request(&mut self, _req: &Message, _arena: &BufArena) -> bool {
        true
    }

    /// Verdict on a completed response, before adjustment. `false`
    /// answers the client 502 and closes the upstream. The response
    /// is mutable so a cache layer can mark it stale.
    fn filter_response(&mut self, _resp: &mut Message, _req: &Message, _arena: &BufArena) -> bool {
        true
    }

    /// Serve a request from cache. A hit is written to the client
    /// verbatim and the upstream is never consulted.
    fn cache_lookup(&mut self, _req: &Message, _arena: &BufArena) -> Option<WireMessage> {
        None
    }

    /// Observe a response on its way to the client, prior to header
    /// adjustment.
    fn cache_store(&mut self, _resp: &Message, _req: &Message, _arena: &BufArena) {}

    /// Admission verdict on a request's body accounting. `false`
    /// answers 403 and closes the client connection.
    fn admit_body(&mut self, _msg: &Message) -> bool {
        true
    }

    /// Wall-clock seconds for `Date` headers and receive stamps.
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for a [`ProxyEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Parser limits applied to every connection.
    pub limits: ParseLimits,
    /// Token named in `Via` headers added on both directions.
    pub via_token: String,
    /// `Server` header on responses the proxy makes itself.
    pub server_banner: String,
    /// Cap on distinct buffers the arena tracks at once.
    pub max_buffers: usize,
    /// Logging verbosity and format.
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: ParseLimits::default(),
            via_token: "gale".to_string(),
            server_banner: "gale".to_string(),
            max_buffers: gale_core::DEFAULT_MAX_BUFFERS,
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_limits(mut self, limits: ParseLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn with_via_token(mut self, token: impl Into<String>) -> Self {
        self.via_token = token.into();
        self
    }

    #[must_use]
    pub fn with_server_banner(mut self, banner: impl Into<String>) -> Self {
        self.server_banner = banner.into();
        self
    }

    #[must_use]
    pub fn with_max_buffers(mut self, max: usize) -> Self {
        self.max_buffers = max;
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The protocol engine: one per proxy, shared by nothing.
///
/// All methods take `&mut self`; the embedder serializes access. The
/// arena is engine-wide so spans parsed on one connection stay
/// resolvable while their message is queued against another.
pub struct ProxyEngine<H: ProxyHooks> {
    conns: HashMap<ConnId, Connection>,
    arena: BufArena,
    hooks: H,
    config: EngineConfig,
    logger: Logger,
}

impl<H: ProxyHooks> ProxyEngine<H> {
    #[must_use]
    pub fn new(hooks: H, config: EngineConfig) -> Self {
        let logger = Logger::new(config.log.clone());
        Self::with_logger(hooks, config, logger)
    }

    /// Engine with a caller-built logger, for custom sinks.
    #[must_use]
    pub fn with_logger(hooks: H, config: EngineConfig, logger: Logger) -> Self {
        Self {
            conns: HashMap::new(),
            arena: BufArena::with_limit(config.max_buffers),
            hooks,
            config,
            logger,
        }
    }

    #[must_use]
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    #[must_use]
    pub fn arena(&self) -> &BufArena {
        &self.arena
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Connections currently tracked, both kinds.
    #[must_use]
    pub fn tracked_conns(&self) -> usize {
        self.conns.len()
    }

    /// Shared handle of a tracked connection.
    #[must_use]
    pub fn conn_shared(&self, id: ConnId) -> Option<&Arc<ConnShared>> {
        self.conns.get(&id).map(|c| &c.shared)
    }

    // ------------------------------------------------------------------
    // Connection registry
    // ------------------------------------------------------------------

    /// Start tracking an accepted client connection.
    pub fn client_connected(&mut self, id: ConnId, peer: Option<SocketAddr>) {
        self.track(id, ConnKind::Client, peer);
    }

    /// Start tracking an opened upstream connection.
    pub fn upstream_connected(&mut self, id: ConnId, peer: Option<SocketAddr>) {
        self.track(id, ConnKind::Upstream, peer);
    }

    fn track(&mut self, id: ConnId, kind: ConnKind, peer: Option<SocketAddr>) {
        let shared = Arc::new(ConnShared::new(id, kind, peer));
        if let Some(old) = self.conns.insert(id, Connection::new(shared)) {
            // Reused id; the old connection is treated as dropped.
            if let Some(msg) = old.msg {
                msg.release(&self.arena);
            }
            if old.shared.kind() == ConnKind::Upstream {
                self.answer_orphans(&old.shared, SynthStatus::NotFound);
            }
        }
        if self.logger.enabled(LogLevel::Debug) {
            self.logger.log(
                &LogEntry::new(LogLevel::Debug, "engine", "connection tracked")
                    .conn(id.0)
                    .field("kind", kind),
            );
        }
    }

    /// The peer hung up. Partial parse state is dropped; if this was
    /// an upstream, every request it still owed an answer gets a 404.
    pub fn conn_dropped(&mut self, id: ConnId) {
        let Some(conn) = self.conns.remove(&id) else {
            return;
        };
        if let Some(msg) = conn.msg {
            msg.release(&self.arena);
        }
        if conn.shared.kind() == ConnKind::Upstream {
            self.answer_orphans(&conn.shared, SynthStatus::NotFound);
        }
        self.arena.reclaim();
        if self.logger.enabled(LogLevel::Debug) {
            self.logger
                .log(&LogEntry::new(LogLevel::Debug, "engine", "connection dropped").conn(id.0));
        }
    }

    /// An upstream stopped answering. Like [`Self::conn_dropped`] but
    /// the engine initiates the close and waiting clients get 504.
    pub fn upstream_timeout(&mut self, id: ConnId) {
        let Some(conn) = self.conns.remove(&id) else {
            return;
        };
        if let Some(msg) = conn.msg {
            msg.release(&self.arena);
        }
        if conn.shared.kind() == ConnKind::Upstream {
            self.answer_orphans(&conn.shared, SynthStatus::GatewayTimeout);
        }
        self.hooks.close_conn(id);
        self.arena.reclaim();
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    /// Feed bytes read from a connection. Runs the parser and every
    /// lifecycle step the bytes unlock; pipelined messages are all
    /// handled before returning. [`SockAction::Close`] means the
    /// engine no longer tracks the connection.
    pub fn on_data(&mut self, id: ConnId, bytes: Vec<u8>) -> SockAction {
        let action = self.ingest(id, bytes);
        self.arena.reclaim();
        action
    }

    fn ingest(&mut self, id: ConnId, bytes: Vec<u8>) -> SockAction {
        if bytes.is_empty() {
            return SockAction::KeepOpen;
        }
        let Some(mut buf) = self.arena.insert(bytes) else {
            self.log_exhausted(id);
            self.teardown(id, SynthStatus::NotFound);
            return SockAction::Close;
        };
        loop {
            match self.conns.get(&id) {
                None => {
                    // Torn down while a previous message was delivered.
                    self.arena.release(buf);
                    return SockAction::Close;
                }
                Some(conn) if conn.read_closed => {
                    // A close-mandating request ended this read side;
                    // the socket only stays open for the owed response.
                    self.arena.release(buf);
                    return SockAction::KeepOpen;
                }
                Some(_) => {}
            }
            let step = self.parse_step(id, buf);
            match step.outcome {
                StepOutcome::Postpone => {
                    self.arena.release(buf);
                    return SockAction::KeepOpen;
                }
                StepOutcome::Block(reason) => {
                    self.log_blocked(id, reason);
                    self.arena.release(buf);
                    self.teardown(id, SynthStatus::NotFound);
                    return SockAction::Close;
                }
                StepOutcome::Pass => {
                    let remaining = self.arena.len(buf) - step.consumed;
                    let leftover = if remaining > 0 {
                        match self.arena.split_off(buf, step.consumed) {
                            Some(rest) => Some(rest),
                            None => {
                                self.log_exhausted(id);
                                self.arena.release(buf);
                                self.teardown(id, SynthStatus::NotFound);
                                return SockAction::Close;
                            }
                        }
                    } else {
                        None
                    };
                    self.arena.release(buf);
                    let Some(msg) = self.conns.get_mut(&id).and_then(|c| c.msg.take()) else {
                        unreachable!("a passed parse always leaves a message behind");
                    };
                    let reads_done = msg.kind() == MsgKind::Request && !msg.should_keep_alive();
                    match msg.kind() {
                        MsgKind::Request => self.deliver_request(msg),
                        MsgKind::Response => self.deliver_response(msg),
                    }
                    if reads_done {
                        // No further requests are read once one
                        // mandates close; pipelined bytes are dropped.
                        if let Some(conn) = self.conns.get_mut(&id) {
                            conn.read_closed = true;
                        }
                        if let Some(rest) = leftover {
                            self.arena.release(rest);
                        }
                        return if self.conns.contains_key(&id) {
                            SockAction::KeepOpen
                        } else {
                            SockAction::Close
                        };
                    }
                    match leftover {
                        Some(rest) if self.conns.contains_key(&id) => buf = rest,
                        Some(rest) => {
                            self.arena.release(rest);
                            return SockAction::Close;
                        }
                        None => {
                            return if self.conns.contains_key(&id) {
                                SockAction::KeepOpen
                            } else {
                                SockAction::Close
                            };
                        }
                    }
                }
            }
        }
    }

    /// Run one parser step, allocating the connection's next message
    /// first if the previous one was finished.
    fn parse_step(&mut self, id: ConnId, buf: BufId) -> ParseStep {
        let now = self.hooks.now_unix();
        let Some(conn) = self.conns.get_mut(&id) else {
            unreachable!("caller checked the connection is tracked");
        };
        if conn.msg.is_none() {
            let mut msg = match conn.shared.kind() {
                ConnKind::Client => Message::new_request(Arc::clone(&conn.shared)),
                ConnKind::Upstream => Message::new_response(Arc::clone(&conn.shared)),
            };
            msg.recv_ts = now;
            // A response to HEAD has no body no matter what its
            // framing headers say. The head of the pairing queue is
            // the request this response answers.
            if conn.shared.kind() == ConnKind::Upstream
                && conn.shared.head_method() == Some(Method::Head)
            {
                msg.flags.void_body = true;
            }
            conn.msg = Some(msg);
        }
        let Some(msg) = conn.msg.as_mut() else {
            unreachable!("message allocated above");
        };
        parse_chunk(msg, &self.arena, buf, 0, &self.config.limits)
    }

    // ------------------------------------------------------------------
    // Request path
    // ------------------------------------------------------------------

    fn deliver_request(&mut self, mut req: Message) {
        let client = req.conn().id();
        let keep = req.should_keep_alive();

        if !self.hooks.admit_body(&req) {
            self.log_refused(client, "body rejected by admission control");
            self.fail_request(req, false, SynthStatus::Forbidden);
            return;
        }
        if !self.hooks.filter_request(&req, &self.arena) {
            self.log_refused(client, "request rejected by filter");
            self.fail_request(req, false, SynthStatus::Forbidden);
            return;
        }
        if let Some(cached) = self.hooks.cache_lookup(&req, &self.arena) {
            if let Err(err) = self.hooks.send(client, &cached, &self.arena) {
                self.log_send_failed(client, err);
                req.release(&self.arena);
                self.teardown(client, SynthStatus::NotFound);
                return;
            }
            req.release(&self.arena);
            if !keep {
                self.teardown(client, SynthStatus::NotFound);
            }
            return;
        }
        let Some(upstream) = self.hooks.pick_upstream(&req, &self.arena) else {
            self.log_refused(client, "no upstream available");
            self.fail_request(req, keep, SynthStatus::BadGateway);
            return;
        };
        if !self.conns.contains_key(&upstream) {
            self.log_refused(client, "routed to an untracked upstream");
            self.fail_request(req, keep, SynthStatus::InternalError);
            return;
        }
        if let Err(err) = self.adjust_request(&mut req) {
            self.log_emit_failed(client, &err.to_string());
            self.fail_request(req, keep, SynthStatus::InternalError);
            return;
        }
        let wire = match emit_request(&req) {
            Ok(wire) => wire,
            Err(err) => {
                self.log_emit_failed(client, &err.to_string());
                self.fail_request(req, keep, SynthStatus::InternalError);
                return;
            }
        };
        if let Err(err) = self.hooks.send(upstream, &wire, &self.arena) {
            self.log_send_failed(upstream, err);
            self.teardown(upstream, SynthStatus::NotFound);
            self.fail_request(req, keep, SynthStatus::InternalError);
            return;
        }
        // The request now waits on the upstream's pairing queue; its
        // spans stay live until the response arrives.
        if let Some(up) = self.conns.get(&upstream) {
            up.shared.push_in_flight(req);
        } else {
            req.release(&self.arena);
        }
    }

    // ------------------------------------------------------------------
    // Response path
    // ------------------------------------------------------------------

    fn deliver_response(&mut self, mut resp: Message) {
        let upstream = resp.conn().id();
        let shared = Arc::clone(resp.conn());
        let Some(req) = shared.pop_in_flight() else {
            self.log_unpaired(upstream);
            resp.release(&self.arena);
            return;
        };
        let client = req.conn().id();
        let keep_client = req.should_keep_alive();
        let keep_upstream = resp.should_keep_alive();

        if !self.hooks.filter_response(&mut resp, &req, &self.arena) {
            self.log_refused(upstream, "response rejected by filter");
            self.teardown(upstream, SynthStatus::NotFound);
            self.fail_response(resp, req, keep_client, SynthStatus::BadGateway);
            return;
        }
        self.hooks.cache_store(&resp, &req, &self.arena);
        if let Err(err) = self.adjust_response(&mut resp, &req) {
            self.log_emit_failed(client, &err.to_string());
            self.fail_response(resp, req, keep_client, SynthStatus::InternalError);
            return;
        }
        let wire = match emit_response(&resp) {
            Ok(wire) => wire,
            Err(err) => {
                self.log_emit_failed(client, &err.to_string());
                self.fail_response(resp, req, keep_client, SynthStatus::InternalError);
                return;
            }
        };
        if let Err(err) = self.hooks.send(client, &wire, &self.arena) {
            self.log_send_failed(client, err);
            resp.release(&self.arena);
            req.release(&self.arena);
            self.teardown(client, SynthStatus::NotFound);
            if !keep_upstream {
                self.teardown(upstream, SynthStatus::NotFound);
            }
            return;
        }
        if self.logger.enabled(LogLevel::Info) {
            self.logger.log(
                &LogEntry::new(LogLevel::Info, "engine", "response delivered")
                    .conn(client.0)
                    .field("status", resp.status().unwrap_or(0))
                    .field("wire_bytes", resp.wire_len()),
            );
        }
        resp.release(&self.arena);
        req.release(&self.arena);
        if !keep_client {
            self.teardown(client, SynthStatus::NotFound);
        }
        if !keep_upstream {
            self.teardown(upstream, SynthStatus::NotFound);
        }
    }

    // ------------------------------------------------------------------
    // Header adjustment
    // ------------------------------------------------------------------

    /// Rewrite a request for its upstream hop: record the client in
    /// `X-Forwarded-For`, add this proxy to `Via`, hold the upstream
    /// connection open, and flatten chunked framing.
    fn adjust_request(&mut self, req: &mut Message) -> Result<(), AdjustError> {
        if req.version() == Some(Version::V09) {
            // Version-less requests have no headers to rewrite.
            return Ok(());
        }
        if let Some(peer) = req.conn().peer() {
            let ip = peer.ip().to_string();
            let joined = match req.headers().get_special(SpecialHdr::XForwardedFor) {
                Some(old) if !old.is_empty() => {
                    let mut buf = vec![0u8; old.len() + 2 + ip.len()];
                    let at = old
                        .materialize_to_buffer(&self.arena, &mut buf)
                        .map_err(AdjustError::Materialize)?;
                    buf[at..at + 2].copy_from_slice(b", ");
                    buf[at + 2..].copy_from_slice(ip.as_bytes());
                    buf
                }
                _ => ip.into_bytes(),
            };
            let value = self.owned_span(joined)?;
            req.headers_mut()
                .set_or_replace(&self.arena, b"X-Forwarded-For", value, false);
        }
        let via = self.owned_span(format!("1.1 {}", self.config.via_token).into_bytes())?;
        req.headers_mut()
            .set_or_replace(&self.arena, b"Via", via, true);
        req.headers_mut()
            .set_or_replace(&self.arena, b"Connection", ZStr::lit(b"keep-alive"), false);
        self.reframe(req)
    }

    /// Rewrite a response for its client: `Connection` per the
    /// request's wish, a `Date` when the origin sent none, this proxy
    /// in `Via`, a staleness warning when the cache marked one, and
    /// flattened chunked framing.
    fn adjust_response(&mut self, resp: &mut Message, req: &Message) -> Result<(), AdjustError> {
        match ConnDirective::for_request(req) {
            ConnDirective::KeepAlive => resp.headers_mut().set_or_replace(
                &self.arena,
                b"Connection",
                ZStr::lit(b"keep-alive"),
                false,
            ),
            ConnDirective::Close => {
                resp.headers_mut()
                    .set_or_replace(&self.arena, b"Connection", ZStr::lit(b"close"), false);
            }
            ConnDirective::Omit => {}
        }
        if !resp.flags().has_date {
            let date = self.owned_span(imf_fixdate(self.hooks.now_unix()).into_bytes())?;
            resp.headers_mut()
                .set_or_replace(&self.arena, b"Date", date, false);
        }
        let via = self.owned_span(format!("1.1 {}", self.config.via_token).into_bytes())?;
        resp.headers_mut()
            .set_or_replace(&self.arena, b"Via", via, true);
        if resp.flags().stale {
            resp.headers_mut().set_or_replace(
                &self.arena,
                b"Warning",
                ZStr::lit(b"110 - \"Response is stale\""),
                true,
            );
        }
        self.reframe(resp)
    }

    /// Replace chunked framing with a plain `Content-Length` carrying
    /// the decoded size. Chunk framing bytes were already dropped at
    /// parse time, so the recorded body is exactly that long.
    fn reframe(&mut self, msg: &mut Message) -> Result<(), AdjustError> {
        if msg.flags().void_body {
            // HEAD answers keep their framing headers verbatim.
            return Ok(());
        }
        let BodyFraming::Chunked { decoded, .. } = msg.framing() else {
            return Ok(());
        };
        msg.headers_mut().remove(&self.arena, b"Transfer-Encoding");
        let value = self.owned_span(decoded.to_string().into_bytes())?;
        msg.headers_mut()
            .set_or_replace(&self.arena, b"Content-Length", value, false);
        Ok(())
    }

    /// Copy bytes into the arena and wrap them in a span. The span
    /// holds the only reference; releasing it frees the slot.
    fn owned_span(&mut self, bytes: Vec<u8>) -> Result<ZStr, AdjustError> {
        let len = bytes.len();
        let Some(id) = self.arena.insert(bytes) else {
            return Err(AdjustError::ArenaFull);
        };
        let span = ZStr::span(&self.arena, id, 0, len);
        self.arena.release(id);
        Ok(span)
    }

    // ------------------------------------------------------------------
    // Synthesized answers and teardown
    // ------------------------------------------------------------------

    /// Answer a request's client with a proxy-made response. Returns
    /// false when the send failed and the client was torn down.
    fn answer_client(&mut self, req: &Message, status: SynthStatus) -> bool {
        let client = req.conn().id();
        let wire = synth_response(
            status,
            self.hooks.now_unix(),
            &self.config.server_banner,
            ConnDirective::for_request(req),
        );
        if let Err(err) = self.hooks.send(client, &wire, &self.arena) {
            self.log_send_failed(client, err);
            self.teardown(client, SynthStatus::NotFound);
            return false;
        }
        true
    }

    /// Abandon a request: synthesize `status` to its client and drop
    /// it. `keep` false also tears the client connection down.
    fn fail_request(&mut self, req: Message, keep: bool, status: SynthStatus) {
        let client = req.conn().id();
        self.answer_client(&req, status);
        req.release(&self.arena);
        if !keep {
            self.teardown(client, SynthStatus::NotFound);
        }
    }

    /// Abandon a paired exchange: synthesize `status` to the client
    /// and drop both messages.
    fn fail_response(&mut self, resp: Message, req: Message, keep: bool, status: SynthStatus) {
        let client = req.conn().id();
        self.answer_client(&req, status);
        resp.release(&self.arena);
        req.release(&self.arena);
        if !keep {
            self.teardown(client, SynthStatus::NotFound);
        }
    }

    /// Answer every request a dead upstream still owed, oldest first.
    fn answer_orphans(&mut self, shared: &ConnShared, status: SynthStatus) {
        for req in shared.drain_in_flight() {
            let client = req.conn().id();
            let keep = req.should_keep_alive();
            if self.logger.enabled(LogLevel::Info) {
                self.logger.log(
                    &LogEntry::new(LogLevel::Info, "engine", "answering for dead upstream")
                        .conn(client.0)
                        .field("status", status.code()),
                );
            }
            if !self.answer_client(&req, status) {
                req.release(&self.arena);
                continue;
            }
            req.release(&self.arena);
            if !keep {
                self.teardown(client, SynthStatus::NotFound);
            }
        }
    }

    /// Stop tracking a connection and close its socket. In-flight
    /// requests of an upstream are answered with `orphan_status`.
    fn teardown(&mut self, id: ConnId, orphan_status: SynthStatus) {
        let Some(conn) = self.conns.remove(&id) else {
            return;
        };
        if let Some(msg) = conn.msg {
            msg.release(&self.arena);
        }
        if conn.shared.kind() == ConnKind::Upstream {
            self.answer_orphans(&conn.shared, orphan_status);
        }
        self.hooks.close_conn(id);
    }

    // ------------------------------------------------------------------
    // Logging
    // ------------------------------------------------------------------

    fn log_blocked(&self, id: ConnId, reason: BlockReason) {
        if !self.logger.enabled(LogLevel::Error) {
            return;
        }
        self.logger.log(
            &LogEntry::new(LogLevel::Error, "engine", format!("message blocked: {reason}"))
                .conn(id.0)
                .field("class", classify(reason)),
        );
    }

    fn log_unpaired(&self, id: ConnId) {
        if !self.logger.enabled(LogLevel::Warn) {
            return;
        }
        self.logger.log(
            &LogEntry::new(LogLevel::Warn, "engine", "response with no request in flight")
                .conn(id.0)
                .field("class", ErrorClass::PairingViolation),
        );
    }

    fn log_exhausted(&self, id: ConnId) {
        if !self.logger.enabled(LogLevel::Error) {
            return;
        }
        self.logger.log(
            &LogEntry::new(LogLevel::Error, "engine", "buffer arena exhausted")
                .conn(id.0)
                .field("class", ErrorClass::ResourceExhausted),
        );
    }

    fn log_refused(&self, id: ConnId, what: &str) {
        if !self.logger.enabled(LogLevel::Info) {
            return;
        }
        self.logger
            .log(&LogEntry::new(LogLevel::Info, "engine", what.to_string()).conn(id.0));
    }

    fn log_send_failed(&self, id: ConnId, err: SendError) {
        if !self.logger.enabled(LogLevel::Error) {
            return;
        }
        self.logger.log(
            &LogEntry::new(LogLevel::Error, "engine", format!("send failed: {err}")).conn(id.0),
        );
    }

    fn log_emit_failed(&self, id: ConnId, detail: &str) {
        if !self.logger.enabled(LogLevel::Error) {
            return;
        }
        self.logger.log(
            &LogEntry::new(LogLevel::Error, "engine", format!("emission failed: {detail}"))
                .conn(id.0),
        );
    }
}

impl<H: ProxyHooks> std::fmt::Debug for ProxyEngine<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEngine")
            .field("conns", &self.conns.len())
            .field("live_buffers", &self.arena.live_entries())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::WireBuilder;
    use gale_core::CaptureSink;

    const CLIENT: ConnId = ConnId(1);
    const UPSTREAM: ConnId = ConnId(7);

    /// Scripted hooks: records every send and close, answers routing
    /// and filter questions from fixed fields.
    struct Script {
        upstream: Option<ConnId>,
        filter_requests: bool,
        filter_responses: bool,
        cached: Option<Vec<u8>>,
        fail_send_to: Option<ConnId>,
        sent: Vec<(ConnId, Vec<u8>)>,
        closed: Vec<ConnId>,
        stored: usize,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                upstream: Some(UPSTREAM),
                filter_requests: true,
                filter_responses: true,
                cached: None,
                fail_send_to: None,
                sent: Vec::new(),
                closed: Vec::new(),
                stored: 0,
            }
        }
    }

    impl ProxyHooks for Script {
        fn pick_upstream(&mut self, _req: &Message, _arena: &BufArena) -> Option<ConnId> {
            self.upstream
        }

        fn send(
            &mut self,
            conn: ConnId,
            wire: &WireMessage,
            arena: &BufArena,
        ) -> Result<(), SendError> {
            if self.fail_send_to == Some(conn) {
                return Err(SendError::Closed);
            }
            self.sent.push((conn, wire.to_bytes(arena)));
            Ok(())
        }

        fn close_conn(&mut self, conn: ConnId) {
            self.closed.push(conn);
        }

        fn filter_request(&mut self, _req: &Message, _arena: &BufArena) -> bool {
            self.filter_requests
        }

        fn filter_response(
            &mut self,
            _resp: &mut Message,
            _req: &Message,
            _arena: &BufArena,
        ) -> bool {
            self.filter_responses
        }

        fn cache_lookup(&mut self, _req: &Message, _arena: &BufArena) -> Option<WireMessage> {
            self.cached.clone().map(|bytes| {
                let mut b = WireBuilder::new();
                b.owned(bytes);
                b.finish().unwrap()
            })
        }

        fn cache_store(&mut self, _resp: &Message, _req: &Message, _arena: &BufArena) {
            self.stored += 1;
        }

        fn now_unix(&self) -> u64 {
            784_111_777
        }
    }

    fn engine(script: Script) -> ProxyEngine<Script> {
        let mut eng = ProxyEngine::new(script, EngineConfig::default());
        eng.client_connected(CLIENT, Some("10.0.0.9:4321".parse().unwrap()));
        eng.upstream_connected(UPSTREAM, Some("192.0.2.80:80".parse().unwrap()));
        eng
    }

    fn sent_to(eng: &ProxyEngine<Script>, id: ConnId) -> Vec<String> {
        eng.hooks()
            .sent
            .iter()
            .filter(|(c, _)| *c == id)
            .map(|(_, b)| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    // ==== request forwarding ====

    #[test]
    fn forwards_request_with_proxy_headers() {
        let mut eng = engine(Script::default());
        let action = eng.on_data(CLIENT, b"GET /w HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        assert_eq!(action, SockAction::KeepOpen);

        let fwd = sent_to(&eng, UPSTREAM);
        assert_eq!(fwd.len(), 1);
        assert!(fwd[0].starts_with("GET /w HTTP/1.1\r\n"));
        assert!(fwd[0].contains("Host: h\r\n"));
        assert!(fwd[0].contains("X-Forwarded-For: 10.0.0.9\r\n"));
        assert!(fwd[0].contains("Via: 1.1 gale\r\n"));
        assert!(fwd[0].contains("Connection: keep-alive\r\n"));
        assert_eq!(eng.conn_shared(UPSTREAM).unwrap().in_flight_len(), 1);
    }

    #[test]
    fn appends_client_to_existing_forwarded_chain() {
        let mut eng = engine(Script::default());
        eng.on_data(
            CLIENT,
            b"GET / HTTP/1.1\r\nHost: h\r\nX-Forwarded-For: 198.51.100.7\r\n\r\n".to_vec(),
        );
        let fwd = sent_to(&eng, UPSTREAM);
        assert!(fwd[0].contains("X-Forwarded-For: 198.51.100.7, 10.0.0.9\r\n"));
    }

    #[test]
    fn pipelined_requests_forward_in_order() {
        let mut eng = engine(Script::default());
        let action = eng.on_data(
            CLIENT,
            b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n".to_vec(),
        );
        assert_eq!(action, SockAction::KeepOpen);
        let fwd = sent_to(&eng, UPSTREAM);
        assert_eq!(fwd.len(), 2);
        assert!(fwd[0].starts_with("GET /a "));
        assert!(fwd[1].starts_with("GET /b "));
        assert_eq!(eng.conn_shared(UPSTREAM).unwrap().in_flight_len(), 2);
    }

    #[test]
    fn split_request_across_reads_resumes() {
        let mut eng = engine(Script::default());
        let action = eng.on_data(CLIENT, b"GET /part HTTP/1.1\r\nHo".to_vec());
        assert_eq!(action, SockAction::KeepOpen);
        assert!(sent_to(&eng, UPSTREAM).is_empty());

        eng.on_data(CLIENT, b"st: h\r\n\r\n".to_vec());
        let fwd = sent_to(&eng, UPSTREAM);
        assert_eq!(fwd.len(), 1);
        assert!(fwd[0].contains("Host: h\r\n"));
    }

    #[test]
    fn chunked_request_reframed_with_content_length() {
        let mut eng = engine(Script::default());
        eng.on_data(
            CLIENT,
            b"POST /u HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n\
              3\r\nabc\r\n8\r\ndefghijk\r\n0\r\n\r\n"
                .to_vec(),
        );
        let fwd = sent_to(&eng, UPSTREAM);
        assert_eq!(fwd.len(), 1);
        assert!(!fwd[0].contains("Transfer-Encoding"));
        assert!(fwd[0].contains("Content-Length: 11\r\n"));
        assert!(fwd[0].ends_with("\r\n\r\nabcdefghijk"));
    }

    // ==== response pairing ====

    #[test]
    fn responses_pair_fifo_and_return_to_client() {
        let mut eng = engine(Script::default());
        eng.on_data(
            CLIENT,
            b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n".to_vec(),
        );
        let action = eng.on_data(
            UPSTREAM,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\naa\
              HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nbb"
                .to_vec(),
        );
        assert_eq!(action, SockAction::KeepOpen);

        let got = sent_to(&eng, CLIENT);
        assert_eq!(got.len(), 2);
        assert!(got[0].ends_with("aa"));
        assert!(got[1].ends_with("bb"));
        assert_eq!(eng.conn_shared(UPSTREAM).unwrap().in_flight_len(), 0);
        assert_eq!(eng.arena().live_entries(), 0);
    }

    #[test]
    fn response_gets_date_via_and_connection() {
        let mut eng = engine(Script::default());
        eng.on_data(CLIENT, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        eng.on_data(
            UPSTREAM,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
        );
        let got = sent_to(&eng, CLIENT);
        assert_eq!(got.len(), 1);
        assert!(got[0].contains("Date: Sun, 06 Nov 1994 08:49:37 GMT\r\n"));
        assert!(got[0].contains("Via: 1.1 gale\r\n"));
        assert!(got[0].contains("Connection: keep-alive\r\n"));
        assert_eq!(eng.hooks().stored, 1);
    }

    #[test]
    fn keeps_origin_date_when_present() {
        let mut eng = engine(Script::default());
        eng.on_data(CLIENT, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        eng.on_data(
            UPSTREAM,
            b"HTTP/1.1 200 OK\r\nDate: Mon, 01 Jan 2024 00:00:00 GMT\r\nContent-Length: 0\r\n\r\n"
                .to_vec(),
        );
        let got = sent_to(&eng, CLIENT);
        assert!(got[0].contains("Date: Mon, 01 Jan 2024 00:00:00 GMT\r\n"));
        assert!(!got[0].contains("Nov 1994"));
    }

    #[test]
    fn chunked_response_reframed_for_client() {
        let mut eng = engine(Script::default());
        eng.on_data(CLIENT, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        eng.on_data(
            UPSTREAM,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n0\r\n\r\n"
                .to_vec(),
        );
        let got = sent_to(&eng, CLIENT);
        assert!(!got[0].contains("Transfer-Encoding"));
        assert!(got[0].contains("Content-Length: 5\r\n"));
        assert!(got[0].ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn client_close_request_closes_after_response() {
        let mut eng = engine(Script::default());
        eng.on_data(
            CLIENT,
            b"GET / HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n".to_vec(),
        );
        // The upstream hop stays persistent regardless.
        assert!(sent_to(&eng, UPSTREAM)[0].contains("Connection: keep-alive\r\n"));

        eng.on_data(
            UPSTREAM,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
        );
        let got = sent_to(&eng, CLIENT);
        assert!(got[0].contains("Connection: close\r\n"));
        assert!(eng.hooks().closed.contains(&CLIENT));
        assert!(eng.conn_shared(CLIENT).is_none());
        assert!(eng.conn_shared(UPSTREAM).is_some());
    }

    #[test]
    fn close_request_stops_reading_pipelined_data() {
        let mut eng = engine(Script::default());
        let action = eng.on_data(
            CLIENT,
            b"GET /a HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n\
              GET /b HTTP/1.1\r\nHost: h\r\n\r\n"
                .to_vec(),
        );
        assert_eq!(action, SockAction::KeepOpen);
        assert_eq!(sent_to(&eng, UPSTREAM).len(), 1);
        assert_eq!(eng.conn_shared(UPSTREAM).unwrap().in_flight_len(), 1);

        // Reads arriving later on the half-closed connection are
        // discarded as well.
        let action = eng.on_data(CLIENT, b"GET /c HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        assert_eq!(action, SockAction::KeepOpen);
        assert_eq!(sent_to(&eng, UPSTREAM).len(), 1);

        eng.on_data(
            UPSTREAM,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
        );
        assert_eq!(sent_to(&eng, CLIENT).len(), 1);
        assert!(eng.hooks().closed.contains(&CLIENT));
        assert_eq!(eng.arena().live_entries(), 0);
    }

    #[test]
    fn head_response_completes_without_body() {
        let mut eng = engine(Script::default());
        eng.on_data(CLIENT, b"HEAD /x HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        let action = eng.on_data(
            UPSTREAM,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n".to_vec(),
        );
        assert_eq!(action, SockAction::KeepOpen);
        let got = sent_to(&eng, CLIENT);
        assert_eq!(got.len(), 1);
        assert!(got[0].contains("Content-Length: 5\r\n"));
        assert!(got[0].ends_with("\r\n\r\n"));
        assert_eq!(eng.conn_shared(UPSTREAM).unwrap().in_flight_len(), 0);
    }

    #[test]
    fn version09_exchange_closes_client() {
        let mut eng = engine(Script::default());
        eng.on_data(CLIENT, b"GET /legacy\r\n".to_vec());
        let fwd = sent_to(&eng, UPSTREAM);
        assert_eq!(fwd[0], "GET /legacy\r\n");

        eng.on_data(
            UPSTREAM,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec(),
        );
        assert_eq!(sent_to(&eng, CLIENT).len(), 1);
        assert!(eng.hooks().closed.contains(&CLIENT));
    }

    #[test]
    fn unpaired_response_dropped_connection_survives() {
        let sink = CaptureSink::new();
        let lines = sink.handle();
        let logger = Logger::with_sink(LogConfig::default(), Box::new(sink));
        let mut eng = ProxyEngine::with_logger(Script::default(), EngineConfig::default(), logger);
        eng.upstream_connected(UPSTREAM, None);

        let action = eng.on_data(
            UPSTREAM,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
        );
        assert_eq!(action, SockAction::KeepOpen);
        assert!(eng.hooks().sent.is_empty());
        assert!(eng.conn_shared(UPSTREAM).is_some());
        assert_eq!(eng.arena().live_entries(), 0);
        assert!(
            lines
                .lock()
                .iter()
                .any(|l| l.contains("no request in flight"))
        );
    }

    // ==== refusals and synthesized answers ====

    #[test]
    fn no_upstream_yields_bad_gateway() {
        let mut eng = engine(Script {
            upstream: None,
            ..Script::default()
        });
        let action = eng.on_data(CLIENT, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        assert_eq!(action, SockAction::KeepOpen);
        let got = sent_to(&eng, CLIENT);
        assert!(got[0].starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(got[0].contains("Server: gale\r\n"));
        assert!(got[0].contains("Connection: keep-alive\r\n"));
        assert_eq!(eng.arena().live_entries(), 0);
    }

    #[test]
    fn filtered_request_answers_forbidden_and_closes() {
        let mut eng = engine(Script {
            filter_requests: false,
            ..Script::default()
        });
        let action = eng.on_data(CLIENT, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        assert_eq!(action, SockAction::Close);
        let got = sent_to(&eng, CLIENT);
        assert!(got[0].starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(eng.hooks().closed.contains(&CLIENT));
        assert!(eng.conn_shared(CLIENT).is_none());
    }

    #[test]
    fn filtered_response_answers_bad_gateway_and_drops_upstream() {
        let mut eng = engine(Script {
            filter_responses: false,
            ..Script::default()
        });
        eng.on_data(CLIENT, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        let action = eng.on_data(
            UPSTREAM,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
        );
        assert_eq!(action, SockAction::Close);
        let got = sent_to(&eng, CLIENT);
        assert!(got[0].starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(eng.hooks().closed.contains(&UPSTREAM));
        assert!(eng.conn_shared(CLIENT).is_some());
        assert_eq!(eng.arena().live_entries(), 0);
    }

    #[test]
    fn cache_hit_skips_upstream() {
        let body = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nX-Cache: hit\r\n\r\nyes".to_vec();
        let mut eng = engine(Script {
            upstream: None,
            cached: Some(body.clone()),
            ..Script::default()
        });
        let action = eng.on_data(CLIENT, b"GET /c HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        assert_eq!(action, SockAction::KeepOpen);
        let got = sent_to(&eng, CLIENT);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].as_bytes(), body.as_slice());
        assert_eq!(eng.conn_shared(UPSTREAM).unwrap().in_flight_len(), 0);
    }

    #[test]
    fn upstream_send_failure_answers_internal_error() {
        let mut eng = engine(Script {
            fail_send_to: Some(UPSTREAM),
            ..Script::default()
        });
        let action = eng.on_data(CLIENT, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        assert_eq!(action, SockAction::KeepOpen);
        let got = sent_to(&eng, CLIENT);
        assert!(got[0].starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(eng.hooks().closed.contains(&UPSTREAM));
        assert!(eng.conn_shared(CLIENT).is_some());
    }

    // ==== teardown ====

    #[test]
    fn malformed_request_blocks_and_closes() {
        let mut eng = engine(Script::default());
        let action = eng.on_data(CLIENT, b"BREW /pot HTTP/1.1\r\n\r\n".to_vec());
        assert_eq!(action, SockAction::Close);
        assert!(sent_to(&eng, CLIENT).is_empty());
        assert!(eng.hooks().closed.contains(&CLIENT));
        assert_eq!(eng.arena().live_entries(), 0);
    }

    #[test]
    fn data_after_teardown_is_ignored() {
        let mut eng = engine(Script::default());
        eng.on_data(CLIENT, b"BREW /pot HTTP/1.1\r\n\r\n".to_vec());
        let action = eng.on_data(CLIENT, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        assert_eq!(action, SockAction::Close);
        assert!(sent_to(&eng, UPSTREAM).is_empty());
        assert_eq!(eng.arena().live_entries(), 0);
    }

    #[test]
    fn upstream_drop_answers_waiting_clients_not_found() {
        let mut eng = engine(Script::default());
        eng.on_data(
            CLIENT,
            b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n".to_vec(),
        );
        eng.conn_dropped(UPSTREAM);
        let got = sent_to(&eng, CLIENT);
        assert_eq!(got.len(), 2);
        assert!(got[0].starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(got[1].starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(eng.conn_shared(CLIENT).is_some());
        assert!(eng.conn_shared(UPSTREAM).is_none());
        assert_eq!(eng.arena().live_entries(), 0);
    }

    #[test]
    fn upstream_timeout_answers_gateway_timeout() {
        let mut eng = engine(Script::default());
        eng.on_data(CLIENT, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n".to_vec());
        eng.upstream_timeout(UPSTREAM);
        let got = sent_to(&eng, CLIENT);
        assert!(got[0].starts_with("HTTP/1.1 504 Gateway Timeout\r\n"));
        assert!(eng.hooks().closed.contains(&UPSTREAM));
        assert_eq!(eng.arena().live_entries(), 0);
    }

    #[test]
    fn arena_exhaustion_closes_connection() {
        let script = Script::default();
        let mut eng = ProxyEngine::new(script, EngineConfig::default().with_max_buffers(0));
        eng.client_connected(CLIENT, None);
        let action = eng.on_data(CLIENT, b"GET / HTTP/1.1\r\n".to_vec());
        assert_eq!(action, SockAction::Close);
        assert!(eng.hooks().closed.contains(&CLIENT));
    }

    // ==== classification ====

    #[test]
    fn classify_groups_reasons() {
        assert_eq!(
            classify(BlockReason::DuplicateHeader(SpecialHdr::ContentLength)),
            ErrorClass::ProtocolAnomaly
        );
        assert_eq!(
            classify(BlockReason::AmbiguousFraming),
            ErrorClass::ProtocolAnomaly
        );
        assert_eq!(
            classify(BlockReason::TooManyHeaders),
            ErrorClass::ResourceExhausted
        );
        assert_eq!(classify(BlockReason::BadMethod), ErrorClass::Malformed);
        assert_eq!(classify(BlockReason::BadChunkSize), ErrorClass::Malformed);
    }
}
