//! HTTP message representation.
//!
//! One [`Message`] covers both requests and responses; every textual
//! field is a zero-copy [`ZStr`] over the connection's buffer arena,
//! so a parsed message is a map of spans, not a copy of the wire
//! bytes. The parser continuation lives inside the message, which is
//! what makes parsing resumable at any byte boundary.

use std::sync::Arc;

use gale_core::{BufArena, ZStr};

use crate::conn::ConnShared;
use crate::header::{HeaderTable, hdr_hash_step};
use crate::parser::ParserContinuation;

/// Request methods understood by the engine. Anything else blocks at
/// the parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
}

impl Method {
    /// Wire spelling.
    #[must_use]
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Get => b"GET",
            Self::Head => b"HEAD",
            Self::Post => b"POST",
        }
    }
}

/// Protocol versions. `V09` covers the bare `METHOD uri` request form
/// with no headers section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    V09,
    V10,
    V11,
}

impl Version {
    /// Wire spelling of the version token, if the version has one.
    #[must_use]
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::V09 => b"",
            Self::V10 => b"HTTP/1.0",
            Self::V11 => b"HTTP/1.1",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgKind {
    Request,
    Response,
}

/// Per-message state bits, in the shape the lifecycle rules consume.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgFlags {
    /// `Connection: close` seen.
    pub conn_close: bool,
    /// `Connection: keep-alive` seen.
    pub conn_keep_alive: bool,
    /// Body uses chunked transfer coding.
    pub chunked: bool,
    /// Response paired with a HEAD request: headers only on the wire.
    pub void_body: bool,
    /// Served from a stale cache entry.
    pub stale: bool,
    /// A `Date` header was present on the wire.
    pub has_date: bool,
}

/// How the body is framed, with the accounting the admission-control
/// collaborator reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    ContentLength { declared: u64, received: u64 },
    Chunked { chunks: u64, decoded: u64 },
}

/// A request or response under construction or completed.
#[derive(Debug)]
pub struct Message {
    pub(crate) kind: MsgKind,
    pub(crate) method: Option<Method>,
    pub(crate) version: Option<Version>,
    pub(crate) status: Option<u16>,
    /// Request path including the query string.
    pub(crate) uri_path: ZStr,
    /// Host (with port) parsed out of an absolute-form URI; empty
    /// otherwise. A plain `Host` header lives in the table only.
    pub(crate) host: ZStr,
    /// Response reason phrase.
    pub(crate) reason: ZStr,
    pub(crate) h_tbl: HeaderTable,
    /// Body payload spans; framing bytes of chunked coding excluded.
    pub(crate) body: ZStr,
    pub(crate) framing: BodyFraming,
    pub(crate) flags: MsgFlags,
    /// Unix seconds when the message completed parsing.
    pub(crate) recv_ts: u64,
    /// Total wire bytes this message consumed.
    pub(crate) wire_len: usize,
    pub(crate) conn: Arc<ConnShared>,
    pub(crate) parser: ParserContinuation,
}

impl Message {
    #[must_use]
    pub fn new_request(conn: Arc<ConnShared>) -> Self {
        Self::new(MsgKind::Request, conn)
    }

    #[must_use]
    pub fn new_response(conn: Arc<ConnShared>) -> Self {
        Self::new(MsgKind::Response, conn)
    }

    fn new(kind: MsgKind, conn: Arc<ConnShared>) -> Self {
        Self {
            kind,
            method: None,
            version: None,
            status: None,
            uri_path: ZStr::empty(),
            host: ZStr::empty(),
            reason: ZStr::empty(),
            h_tbl: HeaderTable::new(),
            body: ZStr::empty(),
            framing: BodyFraming::None,
            flags: MsgFlags::default(),
            recv_ts: 0,
            wire_len: 0,
            conn,
            parser: ParserContinuation::new(kind),
        }
    }

    #[must_use]
    pub fn kind(&self) -> MsgKind {
        self.kind
    }

    #[must_use]
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    #[must_use]
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Response status code, once parsed.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    #[must_use]
    pub fn uri_path(&self) -> &ZStr {
        &self.uri_path
    }

    #[must_use]
    pub fn host(&self) -> &ZStr {
        &self.host
    }

    #[must_use]
    pub fn reason(&self) -> &ZStr {
        &self.reason
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderTable {
        &self.h_tbl
    }

    pub fn headers_mut(&mut self) -> &mut HeaderTable {
        &mut self.h_tbl
    }

    #[must_use]
    pub fn body(&self) -> &ZStr {
        &self.body
    }

    #[must_use]
    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    #[must_use]
    pub fn flags(&self) -> MsgFlags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut MsgFlags {
        &mut self.flags
    }

    /// Unix seconds when parsing completed; zero while in progress.
    #[must_use]
    pub fn recv_timestamp(&self) -> u64 {
        self.recv_ts
    }

    #[must_use]
    pub fn wire_len(&self) -> usize {
        self.wire_len
    }

    /// Connection this message was read from.
    #[must_use]
    pub fn conn(&self) -> &Arc<ConnShared> {
        &self.conn
    }

    /// Whether the connection should persist after this message.
    /// Precedence: mandated close, explicit keep-alive, then the
    /// version default (1.1 persists; 0.9 and bare 1.0 close).
    #[must_use]
    pub fn should_keep_alive(&self) -> bool {
        if self.flags.conn_close {
            return false;
        }
        if self.flags.conn_keep_alive {
            return true;
        }
        matches!(self.version, Some(Version::V11))
    }

    /// Scheduling/cache key: name-hash of the path and host folded
    /// with the method.
    #[must_use]
    pub fn cache_key(&self, arena: &BufArena) -> u64 {
        let fold = |seed: u64, z: &ZStr| {
            z.segments(arena).fold(seed, |h, seg| {
                seg.iter().fold(h, |h, &b| hdr_hash_step(h, b))
            })
        };
        let method = self.method.map_or(0, |m| m as u64 + 1);
        fold(crate::header::HDR_HASH_SEED, &self.uri_path)
            ^ fold(crate::header::HDR_HASH_SEED, &self.host)
            ^ method
    }

    /// Release every buffer reference this message holds. Must run
    /// before the message is dropped; the arena reclaims the buffers
    /// afterwards.
    pub fn release(&self, arena: &BufArena) {
        self.uri_path.release_spans(arena);
        self.host.release_spans(arena);
        self.reason.release_spans(arena);
        self.body.release_spans(arena);
        self.h_tbl.release_spans(arena);
        self.parser.release_spans(arena);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnId, ConnKind, ConnShared};

    fn test_conn() -> Arc<ConnShared> {
        Arc::new(ConnShared::new(ConnId(1), ConnKind::Client, None))
    }

    #[test]
    fn keep_alive_precedence() {
        let mut msg = Message::new_request(test_conn());

        msg.version = Some(Version::V11);
        assert!(msg.should_keep_alive());

        msg.flags.conn_close = true;
        assert!(!msg.should_keep_alive());

        msg.flags = MsgFlags::default();
        msg.version = Some(Version::V10);
        assert!(!msg.should_keep_alive());

        msg.flags.conn_keep_alive = true;
        assert!(msg.should_keep_alive());

        msg.flags = MsgFlags::default();
        msg.version = Some(Version::V09);
        assert!(!msg.should_keep_alive());
    }

    #[test]
    fn close_flag_beats_keep_alive_flag() {
        let mut msg = Message::new_request(test_conn());
        msg.version = Some(Version::V11);
        msg.flags.conn_close = true;
        msg.flags.conn_keep_alive = true;
        assert!(!msg.should_keep_alive());
    }

    #[test]
    fn cache_key_differs_by_path_and_method() {
        let mut arena = BufArena::new();
        let id = arena.insert(b"/a/b".to_vec()).unwrap();

        let mut m1 = Message::new_request(test_conn());
        m1.method = Some(Method::Get);
        m1.uri_path = ZStr::span(&arena, id, 0, 4);

        let mut m2 = Message::new_request(test_conn());
        m2.method = Some(Method::Get);
        m2.uri_path = ZStr::span(&arena, id, 0, 2);

        let mut m3 = Message::new_request(test_conn());
        m3.method = Some(Method::Head);
        m3.uri_path = ZStr::span(&arena, id, 0, 4);

        let k1 = m1.cache_key(&arena);
        assert_ne!(k1, m2.cache_key(&arena));
        assert_ne!(k1, m3.cache_key(&arena));

        m1.release(&arena);
        m2.release(&arena);
        m3.release(&arena);
    }
}
