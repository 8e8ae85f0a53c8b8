//! Outbound message assembly.
//!
//! A [`WireMessage`] is a list of transmission segments: static
//! literals, small owned fragments (dates, numbers), and unresolved
//! spans into arena buffers. Payload bytes are never copied into the
//! wire message; the embedder walks [`WireMessage::segments`] and
//! writes them out (or gathers them into iovecs).
//!
//! Span segments borrow from the buffers the source message still
//! references. A wire message is valid only until that message is
//! released; embedders that queue output or cache responses must call
//! [`WireMessage::into_owned`] first.

use gale_core::{BufArena, BufId, SpanPiece, ZStr};

use crate::header::{HeaderTable, SpecialHdr};
use crate::msg::{Message, Version};

// ============================================================================
// Dates
// ============================================================================

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Gregorian date from a day count since 1970-01-01.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    (if month <= 2 { year + 1 } else { year }, month, day)
}

/// Format a unix timestamp as an IMF-fixdate, e.g.
/// `Sun, 06 Nov 1994 08:49:37 GMT`.
#[must_use]
pub fn imf_fixdate(unix: u64) -> String {
    let days = unix / 86_400;
    let secs = unix % 86_400;
    let (year, month, day) = civil_from_days(days);
    let weekday = WEEKDAYS[usize::try_from((days + 4) % 7).unwrap_or(0)];
    let month = MONTHS[usize::try_from(month - 1).unwrap_or(0)];
    format!(
        "{weekday}, {day:02} {month} {year} {:02}:{:02}:{:02} GMT",
        secs / 3600,
        secs % 3600 / 60,
        secs % 60
    )
}

// ============================================================================
// Wire messages
// ============================================================================

/// One transmission segment of an assembled message.
#[derive(Debug, Clone)]
pub enum WireSeg {
    /// Static protocol text.
    Static(&'static [u8]),
    /// Bytes owned by the wire message (formatted dates, numbers).
    Owned(Box<[u8]>),
    /// Zero-copy window into an arena buffer.
    Span { id: BufId, off: usize, len: usize },
}

/// An assembled outbound message with an exact, precomputed length.
#[derive(Debug, Clone)]
pub struct WireMessage {
    segs: Vec<WireSeg>,
    total: usize,
}

impl WireMessage {
    /// Exact number of bytes [`Self::segments`] will yield.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Resolved byte slices in transmission order.
    ///
    /// # Panics
    /// If a span segment references a buffer that was already
    /// reclaimed; see the module docs for the lifetime contract.
    pub fn segments<'a>(&'a self, arena: &'a BufArena) -> impl Iterator<Item = &'a [u8]> {
        self.segs.iter().map(move |seg| match seg {
            WireSeg::Static(text) => *text,
            WireSeg::Owned(bytes) => &bytes[..],
            WireSeg::Span { id, off, len } => &arena.bytes(*id)[*off..*off + *len],
        })
    }

    /// Linearize into a fresh vector. Test and embedder convenience;
    /// transmission should gather [`Self::segments`] instead.
    #[must_use]
    pub fn to_bytes(&self, arena: &BufArena) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for seg in self.segments(arena) {
            out.extend_from_slice(seg);
        }
        out
    }

    /// Copy every span segment out of the arena so the message can
    /// outlive its source buffers (cache storage, deferred sends).
    #[must_use]
    pub fn into_owned(self, arena: &BufArena) -> Self {
        let segs = self
            .segs
            .into_iter()
            .map(|seg| match seg {
                WireSeg::Span { id, off, len } => {
                    WireSeg::Owned(arena.bytes(id)[off..off + len].into())
                }
                other => other,
            })
            .collect();
        Self {
            segs,
            total: self.total,
        }
    }
}

/// Errors detected while assembling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    MissingMethod,
    MissingVersion,
    MissingStatus,
    /// Redirect construction found no usable host.
    MissingHost,
    /// A value still open from parsing was handed to the builder.
    IncompleteValue,
    /// A value's span lengths disagree with its recorded total.
    LengthMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingMethod => f.write_str("message has no method"),
            Self::MissingVersion => f.write_str("message has no protocol version"),
            Self::MissingStatus => f.write_str("message has no status code"),
            Self::MissingHost => f.write_str("no host available for the redirect location"),
            Self::IncompleteValue => f.write_str("value is still open"),
            Self::LengthMismatch { expected, actual } => {
                write!(f, "span lengths sum to {actual}, expected {expected}")
            }
        }
    }
}

impl std::error::Error for BuildError {}

/// Accumulates segments and totals; [`Self::finish`] refuses output
/// whose byte count disagrees with the values that produced it.
#[derive(Debug, Default)]
pub struct WireBuilder {
    segs: Vec<WireSeg>,
    total: usize,
    error: Option<BuildError>,
}

impl WireBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lit(&mut self, text: &'static [u8]) {
        self.total += text.len();
        self.segs.push(WireSeg::Static(text));
    }

    pub fn owned(&mut self, bytes: Vec<u8>) {
        self.total += bytes.len();
        self.segs.push(WireSeg::Owned(bytes.into_boxed_slice()));
    }

    pub fn crlf(&mut self) {
        self.lit(b"\r\n");
    }

    /// Stage a value's spans for transmission, without copying.
    pub fn zstr(&mut self, z: &ZStr) {
        if !z.is_complete() {
            self.error.get_or_insert(BuildError::IncompleteValue);
            return;
        }
        let mut actual = 0;
        for piece in z.pieces() {
            if piece.is_empty() {
                continue;
            }
            actual += piece.len();
            self.segs.push(match piece {
                SpanPiece::Buf { id, off, len } => WireSeg::Span { id, off, len },
                SpanPiece::Lit(text) => WireSeg::Static(text),
            });
        }
        if actual != z.len() {
            self.error.get_or_insert(BuildError::LengthMismatch {
                expected: z.len(),
                actual,
            });
        }
        self.total += actual;
    }

    pub fn finish(self) -> Result<WireMessage, BuildError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(WireMessage {
            segs: self.segs,
            total: self.total,
        })
    }
}

// ============================================================================
// Synthesized responses
// ============================================================================

/// Status lines the proxy answers with on its own behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthStatus {
    Ok,
    Found,
    Forbidden,
    NotFound,
    InternalError,
    BadGateway,
    GatewayTimeout,
}

impl SynthStatus {
    #[must_use]
    pub fn status_line(self) -> &'static [u8] {
        match self {
            Self::Ok => b"HTTP/1.1 200 OK\r\n",
            Self::Found => b"HTTP/1.1 302 Found\r\n",
            Self::Forbidden => b"HTTP/1.1 403 Forbidden\r\n",
            Self::NotFound => b"HTTP/1.1 404 Not Found\r\n",
            Self::InternalError => b"HTTP/1.1 500 Internal Server Error\r\n",
            Self::BadGateway => b"HTTP/1.1 502 Bad Gateway\r\n",
            Self::GatewayTimeout => b"HTTP/1.1 504 Gateway Timeout\r\n",
        }
    }

    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Found => 302,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::InternalError => 500,
            Self::BadGateway => 502,
            Self::GatewayTimeout => 504,
        }
    }
}

/// What the `Connection` header of an outbound message should say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnDirective {
    Omit,
    KeepAlive,
    Close,
}

impl ConnDirective {
    /// Directive matching a request's keep-alive decision.
    #[must_use]
    pub fn for_request(req: &Message) -> Self {
        if req.should_keep_alive() {
            Self::KeepAlive
        } else {
            Self::Close
        }
    }
}

/// Build a bodyless response from the proxy itself: status line, Date,
/// `Content-Length: 0`, Server token, and Connection per `conn`.
#[must_use]
pub fn synth_response(
    status: SynthStatus,
    date_unix: u64,
    server: &str,
    conn: ConnDirective,
) -> WireMessage {
    let mut b = WireBuilder::new();
    b.lit(status.status_line());
    b.lit(b"Date: ");
    b.owned(imf_fixdate(date_unix).into_bytes());
    b.crlf();
    b.lit(b"Content-Length: 0\r\n");
    b.lit(b"Server: ");
    b.owned(server.as_bytes().to_vec());
    b.crlf();
    match conn {
        ConnDirective::Omit => {}
        ConnDirective::KeepAlive => b.lit(b"Connection: keep-alive\r\n"),
        ConnDirective::Close => b.lit(b"Connection: close\r\n"),
    }
    b.crlf();
    match b.finish() {
        Ok(wire) => wire,
        Err(_) => unreachable!("synthesized responses carry no spans"),
    }
}

/// Build a `302 Found` pointing back at the request's own location,
/// optionally setting a cookie. Used for sticky-session bounce.
pub fn redirect_response(
    req: &Message,
    set_cookie: Option<&[u8]>,
    date_unix: u64,
    server: &str,
    conn: ConnDirective,
) -> Result<WireMessage, BuildError> {
    let mut b = WireBuilder::new();
    b.lit(SynthStatus::Found.status_line());
    b.lit(b"Location: http://");
    if req.host().is_empty() {
        match req.headers().get_special(SpecialHdr::Host) {
            Some(host) if !host.is_empty() => b.zstr(host),
            _ => return Err(BuildError::MissingHost),
        }
    } else {
        b.zstr(req.host());
    }
    if req.uri_path().is_empty() {
        b.lit(b"/");
    } else {
        b.zstr(req.uri_path());
    }
    b.crlf();
    if let Some(cookie) = set_cookie {
        b.lit(b"Set-Cookie: ");
        b.owned(cookie.to_vec());
        b.crlf();
    }
    b.lit(b"Date: ");
    b.owned(imf_fixdate(date_unix).into_bytes());
    b.crlf();
    b.lit(b"Content-Length: 0\r\n");
    b.lit(b"Server: ");
    b.owned(server.as_bytes().to_vec());
    b.crlf();
    match conn {
        ConnDirective::Omit => {}
        ConnDirective::KeepAlive => b.lit(b"Connection: keep-alive\r\n"),
        ConnDirective::Close => b.lit(b"Connection: close\r\n"),
    }
    b.crlf();
    b.finish()
}

// ============================================================================
// Forwarding emission
// ============================================================================

fn emit_header_line(b: &mut WireBuilder, name: &ZStr, value: &ZStr) {
    b.zstr(name);
    b.lit(b": ");
    b.zstr(value);
    b.crlf();
}

fn emit_headers(b: &mut WireBuilder, tbl: &HeaderTable) {
    for field in tbl.fields() {
        if field.value.is_duplicate_group() {
            for value in field.value.duplicates() {
                emit_header_line(b, &field.name, value);
            }
        } else {
            emit_header_line(b, &field.name, &field.value);
        }
    }
}

/// Emit a parsed (and adjusted) request for the upstream socket. The
/// request line is always origin-form; an absolute-form URI was split
/// into host and path at parse time.
pub fn emit_request(req: &Message) -> Result<WireMessage, BuildError> {
    let method = req.method().ok_or(BuildError::MissingMethod)?;
    let version = req.version().ok_or(BuildError::MissingVersion)?;
    let mut b = WireBuilder::new();
    b.lit(method.as_bytes());
    b.lit(b" ");
    if req.uri_path().is_empty() {
        b.lit(b"/");
    } else {
        b.zstr(req.uri_path());
    }
    if version == Version::V09 {
        b.crlf();
        return b.finish();
    }
    b.lit(b" ");
    b.lit(version.as_bytes());
    b.crlf();
    emit_headers(&mut b, req.headers());
    b.crlf();
    if !req.body().is_empty() {
        b.zstr(req.body());
    }
    b.finish()
}

/// Emit a parsed (and adjusted) response for the client socket.
pub fn emit_response(resp: &Message) -> Result<WireMessage, BuildError> {
    let version = resp.version().ok_or(BuildError::MissingVersion)?;
    let status = resp.status().ok_or(BuildError::MissingStatus)?;
    let mut b = WireBuilder::new();
    b.lit(version.as_bytes());
    b.lit(b" ");
    b.owned(status.to_string().into_bytes());
    b.lit(b" ");
    b.zstr(resp.reason());
    b.crlf();
    emit_headers(&mut b, resp.headers());
    b.crlf();
    if !resp.body().is_empty() {
        b.zstr(resp.body());
    }
    b.finish()
}

// ============================================================================
// Tests
// ============================================================================
