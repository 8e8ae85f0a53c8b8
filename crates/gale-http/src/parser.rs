//! Incremental HTTP/1.x parser.
//!
//! One state machine covers requests and responses. It is driven one
//! buffer chunk at a time and can stop and resume at any byte
//! boundary: everything carried between calls lives in the
//! [`ParserContinuation`] embedded in the message, which holds a state
//! discriminant, a small token accumulator and the bookkeeping for the
//! currently-open zero-copy span. Consumed input is never buffered or
//! copied; header names, values, the URI and body data are recorded as
//! arena spans the moment they are seen.
//!
//! The grammar is deliberately strict. Anything that smells like
//! request smuggling (a repeated singleton header, any duplicate
//! Content-Length, Content-Length next to chunked coding, a malformed
//! X-Forwarded-For) blocks the connection rather than passing bytes
//! through for a downstream party to interpret differently.

use gale_core::{BufArena, BufId, ZStr};
use memchr::{memchr2, memchr3};

use crate::header::{SpecialHdr, HDR_HASH_SEED, hdr_hash_step};
use crate::msg::{BodyFraming, Message, Method, MsgKind, Version};

/// Parser hygiene limits, checked while the grammar is consumed.
/// Body-size admission is the embedder's call and happens outside the
/// parser.
#[derive(Debug, Clone)]
pub struct ParseLimits {
    /// Maximum request-line length in bytes.
    pub max_request_line_len: usize,
    /// Maximum header lines per message (folded continuations count
    /// toward their header's line).
    pub max_header_count: usize,
    /// Maximum length of a single header line in bytes.
    pub max_header_line_len: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_request_line_len: 8192,
            max_header_count: 100,
            max_header_line_len: 8192,
        }
    }
}

impl ParseLimits {
    #[must_use]
    pub fn with_max_request_line_len(mut self, len: usize) -> Self {
        self.max_request_line_len = len;
        self
    }

    #[must_use]
    pub fn with_max_header_count(mut self, count: usize) -> Self {
        self.max_header_count = count;
        self
    }

    #[must_use]
    pub fn with_max_header_line_len(mut self, len: usize) -> Self {
        self.max_header_line_len = len;
        self
    }
}

/// Why a message was blocked. Fatal for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    BadMethod,
    BadUri,
    BadVersion,
    BadStatus,
    BadReason,
    BadLineEnding,
    BadFold,
    BadHeaderName,
    BadHeaderValue,
    /// Second occurrence of a singleton header (any duplicate
    /// Content-Length lands here, equal values included).
    DuplicateHeader(SpecialHdr),
    /// Content-Length together with chunked Transfer-Encoding.
    AmbiguousFraming,
    BadContentLength,
    BadTransferEncoding,
    BadChunkSize,
    BadChunkFraming,
    SuspiciousForwardedFor,
    NumericOverflow,
    RequestLineTooLong,
    HeaderLineTooLong,
    TooManyHeaders,
    /// The parser was re-entered after a terminal block.
    ParserPoisoned,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::BadMethod => "unrecognized method",
            Self::BadUri => "malformed request uri",
            Self::BadVersion => "unsupported protocol version",
            Self::BadStatus => "malformed status code",
            Self::BadReason => "malformed reason phrase",
            Self::BadLineEnding => "bare CR in line ending",
            Self::BadFold => "header fold without a header",
            Self::BadHeaderName => "malformed header name",
            Self::BadHeaderValue => "control byte in header value",
            Self::DuplicateHeader(h) => {
                return write!(f, "duplicate {} header", String::from_utf8_lossy(h.name()));
            }
            Self::AmbiguousFraming => "content-length conflicts with chunked coding",
            Self::BadContentLength => "malformed content-length value",
            Self::BadTransferEncoding => "unsupported transfer coding",
            Self::BadChunkSize => "malformed chunk size line",
            Self::BadChunkFraming => "missing chunk terminator",
            Self::SuspiciousForwardedFor => "suspicious x-forwarded-for value",
            Self::NumericOverflow => "numeric field overflow",
            Self::RequestLineTooLong => "request line too long",
            Self::HeaderLineTooLong => "header line too long",
            Self::TooManyHeaders => "too many headers",
            Self::ParserPoisoned => "parser re-entered after block",
        };
        f.write_str(text)
    }
}

impl std::error::Error for BlockReason {}

/// Outcome of one [`parse_chunk`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Message complete; `consumed` may stop short of the chunk end
    /// when pipelined data follows.
    Pass,
    /// Valid so far; the rest of the message is still in flight.
    Postpone,
    /// Fatal protocol violation.
    Block(BlockReason),
}

/// One step's verdict plus how far the cursor moved.
#[derive(Debug, Clone, Copy)]
pub struct ParseStep {
    pub outcome: StepOutcome,
    pub consumed: usize,
}

// ============================================================================
// Character classes
// ============================================================================

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

fn is_host_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b':')
}

fn is_forwarded_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-')
}

fn is_value_byte(b: u8) -> bool {
    !(b < 0x20 && b != b'\t' || b == 0x7f)
}

fn is_uri_byte(b: u8) -> bool {
    (0x21..=0x7e).contains(&b)
}

fn hex_val(b: u8) -> Option<u64> {
    match b {
        b'0'..=b'9' => Some(u64::from(b - b'0')),
        b'a'..=b'f' => Some(u64::from(b - b'a' + 10)),
        b'A'..=b'F' => Some(u64::from(b - b'A' + 10)),
        _ => None,
    }
}

// ============================================================================
// Per-header value scanners
// ============================================================================
//
// Policy headers are interpreted while their bytes stream past; the
// scanners keep O(1) state so a value split across any number of
// buffers scans identically. Verdicts that a later folded
// continuation could still change are deferred to commit time.

#[derive(Debug, Default)]
struct ClScan {
    num: u64,
    digits: usize,
    trail_ws: bool,
    bad: bool,
}

impl ClScan {
    fn feed(&mut self, b: u8) -> Result<(), BlockReason> {
        match b {
            b'0'..=b'9' if !self.trail_ws => {
                self.num = self
                    .num
                    .checked_mul(10)
                    .and_then(|n| n.checked_add(u64::from(b - b'0')))
                    .ok_or(BlockReason::NumericOverflow)?;
                self.digits += 1;
            }
            b' ' | b'\t' if self.digits > 0 => self.trail_ws = true,
            _ => self.bad = true,
        }
        Ok(())
    }

    fn finalize(&self) -> Result<u64, BlockReason> {
        if self.bad || self.digits == 0 {
            return Err(BlockReason::BadContentLength);
        }
        Ok(self.num)
    }
}

const SCAN_TOKEN_CAP: usize = 12;

/// Comma-separated token matcher for `Connection`.
#[derive(Debug, Default)]
struct ConnScan {
    tok: [u8; SCAN_TOKEN_CAP],
    len: usize,
    junk: bool,
    close: bool,
    keep_alive: bool,
}

impl ConnScan {
    fn feed(&mut self, b: u8) {
        match b {
            b',' | b' ' | b'\t' => self.flush(),
            _ if is_tchar(b) => {
                if self.len < SCAN_TOKEN_CAP {
                    self.tok[self.len] = b.to_ascii_lowercase();
                    self.len += 1;
                } else {
                    self.junk = true;
                }
            }
            _ => self.junk = true,
        }
    }

    fn flush(&mut self) {
        if self.len > 0 && !self.junk {
            match &self.tok[..self.len] {
                b"close" => self.close = true,
                b"keep-alive" => self.keep_alive = true,
                _ => {}
            }
        }
        self.len = 0;
        self.junk = false;
    }
}

/// `Transfer-Encoding` must be exactly one `chunked` token.
#[derive(Debug, Default)]
struct TeScan {
    tok: [u8; SCAN_TOKEN_CAP],
    len: usize,
    bad: bool,
    chunked: bool,
}

impl TeScan {
    fn feed(&mut self, b: u8) {
        match b {
            b',' | b' ' | b'\t' => self.flush(),
            _ if is_tchar(b) => {
                if self.len < SCAN_TOKEN_CAP {
                    self.tok[self.len] = b.to_ascii_lowercase();
                    self.len += 1;
                } else {
                    self.bad = true;
                }
            }
            _ => self.bad = true,
        }
    }

    fn flush(&mut self) {
        if self.len > 0 {
            if self.chunked || &self.tok[..self.len] != b"chunked" {
                self.bad = true;
            } else {
                self.chunked = true;
            }
            self.len = 0;
        }
    }

    fn finalize(&mut self) -> Result<(), BlockReason> {
        self.flush();
        if self.bad || !self.chunked {
            return Err(BlockReason::BadTransferEncoding);
        }
        Ok(())
    }
}

/// `X-Forwarded-For`: comma-separated non-empty elements of a narrow
/// byte class, optional whitespace around each element. Violations
/// that no continuation can repair fail immediately; "last element is
/// empty" waits for commit because a fold may still extend it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum XffState {
    #[default]
    LeadWs,
    Content,
    Gap,
}

#[derive(Debug, Default)]
struct XffScan {
    state: XffState,
}

impl XffScan {
    fn feed(&mut self, b: u8) -> Result<(), BlockReason> {
        match b {
            _ if is_forwarded_byte(b) => match self.state {
                XffState::Gap => return Err(BlockReason::SuspiciousForwardedFor),
                _ => self.state = XffState::Content,
            },
            b' ' | b'\t' => {
                if self.state == XffState::Content {
                    self.state = XffState::Gap;
                }
            }
            b',' => {
                if self.state == XffState::LeadWs {
                    return Err(BlockReason::SuspiciousForwardedFor);
                }
                self.state = XffState::LeadWs;
            }
            _ => return Err(BlockReason::SuspiciousForwardedFor),
        }
        Ok(())
    }

    fn finalize(&self) -> Result<(), BlockReason> {
        if self.state == XffState::LeadWs {
            return Err(BlockReason::SuspiciousForwardedFor);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
enum ValueScan {
    #[default]
    None,
    ContentLength(ClScan),
    Connection(ConnScan),
    TransferEncoding(TeScan),
    ForwardedFor(XffScan),
}

impl ValueScan {
    fn for_special(special: Option<SpecialHdr>) -> Self {
        match special {
            Some(SpecialHdr::ContentLength) => Self::ContentLength(ClScan::default()),
            Some(SpecialHdr::Connection) => Self::Connection(ConnScan::default()),
            Some(SpecialHdr::TransferEncoding) => Self::TransferEncoding(TeScan::default()),
            Some(SpecialHdr::XForwardedFor) => Self::ForwardedFor(XffScan::default()),
            _ => Self::None,
        }
    }

    fn feed(&mut self, b: u8) -> Result<(), BlockReason> {
        match self {
            Self::None => Ok(()),
            Self::ContentLength(s) => s.feed(b),
            Self::Connection(s) => {
                s.feed(b);
                Ok(())
            }
            Self::TransferEncoding(s) => {
                s.feed(b);
                Ok(())
            }
            Self::ForwardedFor(s) => s.feed(b),
        }
    }

    fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

// ============================================================================
// Continuation
// ============================================================================

/// Which message field the currently-open span belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenField {
    None,
    UriPath,
    Host,
    Reason,
    HdrName,
    HdrValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    // Request line
    Method,
    UriStart,
    UriScheme,
    UriHost,
    UriPath,
    Eol09Lf,
    Version,
    ReqLineLf,
    // Status line
    RespVersion,
    StatusCode,
    Reason,
    RespLineLf,
    // Headers
    HdrLineStart,
    FoldOws,
    HdrName,
    HdrOws,
    HdrValue,
    HdrEolLf,
    HeadersEndLf,
    // Body
    BodyCl,
    ChunkSize,
    ChunkExt,
    ChunkSizeLf,
    ChunkData,
    ChunkDataCr,
    ChunkDataLf,
    TrailerStart,
    TrailerLine,
    TrailerLf,
    LastLf,
    // Terminals
    Complete,
    Blocked,
}

const NAME_SCRATCH: usize = 64;
const TOKEN_CAP: usize = 12;

/// Everything parsing carries across buffer boundaries. Lives inside
/// the message; O(1) in size, never a copy of unconsumed input.
#[derive(Debug)]
pub struct ParserContinuation {
    state: ParseState,
    open: OpenField,
    /// The open span was closed at a buffer end; the next buffer must
    /// contribute a fresh chunk before more bytes land in the field.
    open_needs_chunk: bool,
    // Header line under construction (committed once the next line
    // proves it is not folded).
    name: ZStr,
    value: ZStr,
    name_hash: u64,
    name_len: usize,
    name_scratch: [u8; NAME_SCRATCH],
    special: Option<SpecialHdr>,
    vscan: ValueScan,
    have_line: bool,
    value_eolen: u8,
    // Short token accumulator: method / version / scheme position.
    token: [u8; TOKEN_CAP],
    token_len: usize,
    // Limits bookkeeping.
    line_len: usize,
    hdr_lines: usize,
    // Body framing accumulation.
    cl_declared: Option<u64>,
    body_left: u64,
    received: u64,
    num: u64,
    num_digits: usize,
    chunks: u64,
    decoded: u64,
}

impl ParserContinuation {
    pub(crate) fn new(kind: MsgKind) -> Self {
        Self {
            state: match kind {
                MsgKind::Request => ParseState::Method,
                MsgKind::Response => ParseState::RespVersion,
            },
            open: OpenField::None,
            open_needs_chunk: false,
            name: ZStr::empty(),
            value: ZStr::empty(),
            name_hash: HDR_HASH_SEED,
            name_len: 0,
            name_scratch: [0; NAME_SCRATCH],
            special: None,
            vscan: ValueScan::None,
            have_line: false,
            value_eolen: 0,
            token: [0; TOKEN_CAP],
            token_len: 0,
            line_len: 0,
            hdr_lines: 0,
            cl_declared: None,
            body_left: 0,
            received: 0,
            num: 0,
            num_digits: 0,
            chunks: 0,
            decoded: 0,
        }
    }

    /// True once the message parsed to completion.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    /// True after a terminal block.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.state == ParseState::Blocked
    }

    /// Release spans held by the uncommitted header line.
    pub(crate) fn release_spans(&self, arena: &BufArena) {
        self.name.release_spans(arena);
        self.value.release_spans(arena);
    }

    fn reset_line(&mut self) {
        self.name = ZStr::empty();
        self.value = ZStr::empty();
        self.name_hash = HDR_HASH_SEED;
        self.name_len = 0;
        self.special = None;
        self.vscan = ValueScan::None;
        self.value_eolen = 0;
        self.line_len = 0;
    }
}

// ============================================================================
// Driving
// ============================================================================

/// Advance `msg` over `arena[buf][from..]`. Spans are recorded into
/// the message as parsing proceeds; the continuation inside the
/// message carries everything needed to resume at the returned
/// consumption point.
///
/// On [`StepOutcome::Postpone`] the whole tail counts as consumed and
/// the caller may drop its reference to `buf`; the message keeps the
/// spans it needs. On [`StepOutcome::Pass`] unconsumed bytes belong
/// to the next message on the connection.
pub fn parse_chunk(
    msg: &mut Message,
    arena: &BufArena,
    buf: BufId,
    from: usize,
    limits: &ParseLimits,
) -> ParseStep {
    let mut ps = std::mem::replace(&mut msg.parser, ParserContinuation::new(msg.kind));
    let step = run(msg, &mut ps, arena, buf, from, limits);
    if let StepOutcome::Block(_) = step.outcome {
        ps.state = ParseState::Blocked;
    }
    msg.wire_len += step.consumed;
    msg.parser = ps;
    step
}

fn target_mut<'a>(
    msg: &'a mut Message,
    ps: &'a mut ParserContinuation,
    field: OpenField,
) -> &'a mut ZStr {
    match field {
        OpenField::UriPath => &mut msg.uri_path,
        OpenField::Host => &mut msg.host,
        OpenField::Reason => &mut msg.reason,
        OpenField::HdrName => &mut ps.name,
        OpenField::HdrValue => &mut ps.value,
        OpenField::None => unreachable!("no open field"),
    }
}

fn ensure_open(
    msg: &mut Message,
    ps: &mut ParserContinuation,
    arena: &BufArena,
    buf: BufId,
    field: OpenField,
    at: usize,
) {
    if ps.open == field && !ps.open_needs_chunk {
        return;
    }
    debug_assert!(ps.open == OpenField::None || ps.open == field);
    let chunk = ZStr::open(arena, buf, at);
    target_mut(msg, ps, field).append_chunk(chunk);
    ps.open = field;
    ps.open_needs_chunk = false;
}

fn close_open(msg: &mut Message, ps: &mut ParserContinuation, at: usize) {
    let field = ps.open;
    if field == OpenField::None {
        return;
    }
    if ps.open_needs_chunk {
        // Nothing landed in this buffer; the field already ends at the
        // previous buffer's edge.
        target_mut(msg, ps, field).mark_complete();
    } else {
        let target = target_mut(msg, ps, field);
        target.update_open_length(at);
        target.mark_complete();
    }
    ps.open = OpenField::None;
    ps.open_needs_chunk = false;
}

/// Suspend at the buffer end: stamp the open span's length so the next
/// buffer resumes with a fresh chunk.
fn suspend(msg: &mut Message, ps: &mut ParserContinuation, end: usize) {
    if ps.open != OpenField::None && !ps.open_needs_chunk {
        let field = ps.open;
        target_mut(msg, ps, field).update_open_length(end);
        ps.open_needs_chunk = true;
    }
}

fn commit_pending(
    msg: &mut Message,
    ps: &mut ParserContinuation,
    arena: &BufArena,
) -> Result<(), BlockReason> {
    debug_assert!(ps.have_line);
    match &mut ps.vscan {
        ValueScan::None => {}
        ValueScan::ContentLength(scan) => {
            ps.cl_declared = Some(scan.finalize()?);
        }
        ValueScan::Connection(scan) => {
            scan.flush();
            msg.flags.conn_close |= scan.close;
            msg.flags.conn_keep_alive |= scan.keep_alive;
        }
        ValueScan::TransferEncoding(scan) => {
            scan.finalize()?;
            msg.flags.chunked = true;
        }
        ValueScan::ForwardedFor(scan) => scan.finalize()?,
    }
    if ps.special.is_none() && ps.name_len == 4 && &ps.name_scratch[..4] == b"date" {
        msg.flags.has_date = true;
    }
    let mut name = std::mem::take(&mut ps.name);
    let mut value = std::mem::take(&mut ps.value);
    name.mark_name_start();
    value.mark_value_start();
    value.set_eolen(ps.value_eolen);
    let result = msg
        .h_tbl
        .commit_parsed(arena, ps.special, name, value, ps.name_hash)
        .map_err(|err| match err {
            crate::header::HdrError::DuplicateSingleton(h) => BlockReason::DuplicateHeader(h),
        });
    ps.have_line = false;
    result
}

fn headers_done(msg: &mut Message, ps: &mut ParserContinuation, arena: &BufArena) -> Result<bool, BlockReason> {
    if ps.have_line {
        commit_pending(msg, ps, arena)?;
    }
    if msg.flags.chunked && ps.cl_declared.is_some() {
        return Err(BlockReason::AmbiguousFraming);
    }
    let code = msg.status.unwrap_or(0);
    let bodyless = msg.kind == MsgKind::Response
        && (msg.flags.void_body || (100..=199).contains(&code) || code == 204 || code == 304);
    if msg.flags.chunked {
        if bodyless {
            msg.framing = BodyFraming::Chunked {
                chunks: 0,
                decoded: 0,
            };
            ps.state = ParseState::Complete;
            return Ok(true);
        }
        ps.num = 0;
        ps.num_digits = 0;
        ps.state = ParseState::ChunkSize;
        return Ok(false);
    }
    if let Some(declared) = ps.cl_declared {
        msg.framing = BodyFraming::ContentLength {
            declared,
            received: 0,
        };
        if bodyless || declared == 0 {
            ps.state = ParseState::Complete;
            return Ok(true);
        }
        ps.body_left = declared;
        ps.state = ParseState::BodyCl;
        return Ok(false);
    }
    ps.state = ParseState::Complete;
    Ok(true)
}

#[allow(clippy::cast_possible_truncation)] // left < avail <= usize::MAX here
fn body_take(left: u64, avail: usize) -> usize {
    if left >= avail as u64 { avail } else { left as usize }
}

#[allow(clippy::too_many_lines)]
fn run(
    msg: &mut Message,
    ps: &mut ParserContinuation,
    arena: &BufArena,
    buf: BufId,
    from: usize,
    limits: &ParseLimits,
) -> ParseStep {
    let data = arena.bytes(buf);
    let len = data.len();
    let mut i = from;
    debug_assert!(from <= len);

    macro_rules! block {
        ($reason:expr) => {
            return ParseStep {
                outcome: StepOutcome::Block($reason),
                consumed: i - from,
            }
        };
    }
    macro_rules! pass {
        () => {
            return ParseStep {
                outcome: StepOutcome::Pass,
                consumed: i - from,
            }
        };
    }
    macro_rules! postpone {
        () => {{
            suspend(msg, ps, len);
            return ParseStep {
                outcome: StepOutcome::Postpone,
                consumed: i - from,
            };
        }};
    }
    macro_rules! next_byte {
        () => {
            match data.get(i) {
                Some(&b) => b,
                None => postpone!(),
            }
        };
    }

    loop {
        match ps.state {
            // ================================================================
            // Request line
            // ================================================================
            ParseState::Method => {
                let b = next_byte!();
                match b {
                    b'A'..=b'Z' => {
                        if ps.token_len >= TOKEN_CAP {
                            block!(BlockReason::BadMethod);
                        }
                        ps.token[ps.token_len] = b;
                        ps.token_len += 1;
                        i += 1;
                        ps.line_len += 1;
                    }
                    b' ' => {
                        msg.method = Some(match &ps.token[..ps.token_len] {
                            b"GET" => Method::Get,
                            b"HEAD" => Method::Head,
                            b"POST" => Method::Post,
                            _ => block!(BlockReason::BadMethod),
                        });
                        ps.token_len = 0;
                        i += 1;
                        ps.line_len += 1;
                        ps.state = ParseState::UriStart;
                    }
                    _ => block!(BlockReason::BadMethod),
                }
            }
            ParseState::UriStart => {
                let b = next_byte!();
                match b {
                    b'/' => ps.state = ParseState::UriPath,
                    b'h' => {
                        ps.token_len = 0;
                        ps.state = ParseState::UriScheme;
                    }
                    _ => block!(BlockReason::BadUri),
                }
            }
            ParseState::UriScheme => {
                const SCHEME: &[u8] = b"http://";
                let b = next_byte!();
                if b != SCHEME[ps.token_len] {
                    block!(BlockReason::BadUri);
                }
                ps.token_len += 1;
                i += 1;
                ps.line_len += 1;
                if ps.token_len == SCHEME.len() {
                    ps.token_len = 0;
                    ps.state = ParseState::UriHost;
                }
            }
            ParseState::UriHost => {
                if i >= len {
                    postpone!();
                }
                let mut j = i;
                while j < len && is_host_byte(data[j]) {
                    j += 1;
                }
                if j > i {
                    ensure_open(msg, ps, arena, buf, OpenField::Host, i);
                    ps.line_len += j - i;
                    if ps.line_len > limits.max_request_line_len {
                        block!(BlockReason::RequestLineTooLong);
                    }
                    i = j;
                }
                if i >= len {
                    postpone!();
                }
                if msg.host.is_empty() && ps.open != OpenField::Host {
                    // Authority may not be empty in absolute form.
                    block!(BlockReason::BadUri);
                }
                match data[i] {
                    b'/' => {
                        close_open(msg, ps, i);
                        ps.state = ParseState::UriPath;
                    }
                    b' ' => {
                        close_open(msg, ps, i);
                        i += 1;
                        ps.line_len += 1;
                        ps.token_len = 0;
                        ps.state = ParseState::Version;
                    }
                    b'\r' => {
                        close_open(msg, ps, i);
                        i += 1;
                        ps.state = ParseState::Eol09Lf;
                    }
                    b'\n' => {
                        close_open(msg, ps, i);
                        i += 1;
                        if let Some(step) = simple_request_done(msg, ps, i, from) {
                            return step;
                        }
                        pass!();
                    }
                    _ => block!(BlockReason::BadUri),
                }
            }
            ParseState::UriPath => {
                if i >= len {
                    postpone!();
                }
                let stop = memchr3(b' ', b'\r', b'\n', &data[i..len]);
                let end = stop.map_or(len, |s| i + s);
                if end > i {
                    ensure_open(msg, ps, arena, buf, OpenField::UriPath, i);
                    if data[i..end].iter().any(|&b| !is_uri_byte(b)) {
                        block!(BlockReason::BadUri);
                    }
                    ps.line_len += end - i;
                    if ps.line_len > limits.max_request_line_len {
                        block!(BlockReason::RequestLineTooLong);
                    }
                    i = end;
                }
                if i >= len {
                    postpone!();
                }
                match data[i] {
                    b' ' => {
                        close_open(msg, ps, i);
                        i += 1;
                        ps.line_len += 1;
                        ps.token_len = 0;
                        ps.state = ParseState::Version;
                    }
                    b'\r' => {
                        close_open(msg, ps, i);
                        i += 1;
                        ps.state = ParseState::Eol09Lf;
                    }
                    _ => {
                        // '\n'
                        close_open(msg, ps, i);
                        i += 1;
                        if let Some(step) = simple_request_done(msg, ps, i, from) {
                            return step;
                        }
                        pass!();
                    }
                }
            }
            ParseState::Eol09Lf => {
                let b = next_byte!();
                if b != b'\n' {
                    block!(BlockReason::BadLineEnding);
                }
                i += 1;
                if let Some(step) = simple_request_done(msg, ps, i, from) {
                    return step;
                }
                pass!();
            }
            ParseState::Version => {
                let b = next_byte!();
                match b {
                    b'\r' | b'\n' => {
                        msg.version = Some(match &ps.token[..ps.token_len] {
                            b"HTTP/1.1" => Version::V11,
                            b"HTTP/1.0" => Version::V10,
                            _ => block!(BlockReason::BadVersion),
                        });
                        i += 1;
                        if b == b'\r' {
                            ps.state = ParseState::ReqLineLf;
                        } else {
                            start_headers(ps);
                        }
                    }
                    _ => {
                        if ps.token_len >= 8 {
                            block!(BlockReason::BadVersion);
                        }
                        ps.token[ps.token_len] = b;
                        ps.token_len += 1;
                        i += 1;
                        ps.line_len += 1;
                        if ps.line_len > limits.max_request_line_len {
                            block!(BlockReason::RequestLineTooLong);
                        }
                    }
                }
            }
            ParseState::ReqLineLf => {
                let b = next_byte!();
                if b != b'\n' {
                    block!(BlockReason::BadLineEnding);
                }
                i += 1;
                start_headers(ps);
            }

            // ================================================================
            // Status line
            // ================================================================
            ParseState::RespVersion => {
                let b = next_byte!();
                match b {
                    b' ' => {
                        msg.version = Some(match &ps.token[..ps.token_len] {
                            b"HTTP/1.1" => Version::V11,
                            b"HTTP/1.0" => Version::V10,
                            _ => block!(BlockReason::BadVersion),
                        });
                        ps.token_len = 0;
                        ps.num = 0;
                        ps.num_digits = 0;
                        i += 1;
                        ps.state = ParseState::StatusCode;
                    }
                    b'\r' | b'\n' => block!(BlockReason::BadStatus),
                    _ => {
                        if ps.token_len >= 8 {
                            block!(BlockReason::BadVersion);
                        }
                        ps.token[ps.token_len] = b;
                        ps.token_len += 1;
                        i += 1;
                    }
                }
            }
            ParseState::StatusCode => {
                let b = next_byte!();
                match b {
                    b'0'..=b'9' => {
                        if ps.num_digits == 3 {
                            block!(BlockReason::BadStatus);
                        }
                        ps.num = ps.num * 10 + u64::from(b - b'0');
                        ps.num_digits += 1;
                        i += 1;
                    }
                    b' ' | b'\r' | b'\n' => {
                        if ps.num_digits != 3 || !(100..=599).contains(&ps.num) {
                            block!(BlockReason::BadStatus);
                        }
                        msg.status = u16::try_from(ps.num).ok();
                        ps.num = 0;
                        ps.num_digits = 0;
                        i += 1;
                        match b {
                            b' ' => ps.state = ParseState::Reason,
                            b'\r' => ps.state = ParseState::RespLineLf,
                            _ => start_headers(ps),
                        }
                    }
                    _ => block!(BlockReason::BadStatus),
                }
            }
            ParseState::Reason => {
                if i >= len {
                    postpone!();
                }
                let stop = memchr2(b'\r', b'\n', &data[i..len]);
                let end = stop.map_or(len, |s| i + s);
                if end > i {
                    ensure_open(msg, ps, arena, buf, OpenField::Reason, i);
                    if data[i..end].iter().any(|&b| !is_value_byte(b)) {
                        block!(BlockReason::BadReason);
                    }
                    i = end;
                }
                if i >= len {
                    postpone!();
                }
                if ps.open == OpenField::Reason {
                    close_open(msg, ps, i);
                }
                if data[i] == b'\r' {
                    i += 1;
                    ps.state = ParseState::RespLineLf;
                } else {
                    i += 1;
                    start_headers(ps);
                }
            }
            ParseState::RespLineLf => {
                let b = next_byte!();
                if b != b'\n' {
                    block!(BlockReason::BadLineEnding);
                }
                i += 1;
                start_headers(ps);
            }

            // ================================================================
            // Header section
            // ================================================================
            ParseState::HdrLineStart => {
                let b = next_byte!();
                match b {
                    b'\r' => {
                        i += 1;
                        ps.state = ParseState::HeadersEndLf;
                    }
                    b'\n' => {
                        i += 1;
                        match headers_done(msg, ps, arena) {
                            Ok(true) => pass!(),
                            Ok(false) => {}
                            Err(reason) => block!(reason),
                        }
                    }
                    b' ' | b'\t' => {
                        // Obsolete line folding: continuation of the
                        // pending header's value.
                        if !ps.have_line {
                            block!(BlockReason::BadFold);
                        }
                        ps.state = ParseState::FoldOws;
                    }
                    _ => {
                        if ps.have_line {
                            if let Err(reason) = commit_pending(msg, ps, arena) {
                                block!(reason);
                            }
                        }
                        if ps.hdr_lines >= limits.max_header_count {
                            block!(BlockReason::TooManyHeaders);
                        }
                        ps.hdr_lines += 1;
                        ps.reset_line();
                        ps.state = ParseState::HdrName;
                    }
                }
            }
            ParseState::FoldOws => {
                let b = next_byte!();
                match b {
                    b' ' | b'\t' => {
                        i += 1;
                        ps.line_len += 1;
                        if ps.line_len > limits.max_header_line_len {
                            block!(BlockReason::HeaderLineTooLong);
                        }
                    }
                    b'\r' => {
                        ps.value_eolen = 2;
                        i += 1;
                        ps.state = ParseState::HdrEolLf;
                    }
                    b'\n' => {
                        ps.value_eolen = 1;
                        i += 1;
                        ps.state = ParseState::HdrLineStart;
                    }
                    _ => {
                        // The fold reads as a single joining space.
                        if !ps.value.is_empty() {
                            ps.value.append_chunk(ZStr::lit(b" "));
                            if let Err(reason) = ps.vscan.feed(b' ') {
                                block!(reason);
                            }
                        }
                        ps.state = ParseState::HdrValue;
                    }
                }
            }
            ParseState::HdrName => {
                let b = next_byte!();
                match b {
                    b':' => {
                        if ps.name_len == 0 {
                            block!(BlockReason::BadHeaderName);
                        }
                        close_open(msg, ps, i);
                        ps.special = if ps.name_len <= NAME_SCRATCH {
                            SpecialHdr::from_name(&ps.name_scratch[..ps.name_len])
                        } else {
                            None
                        };
                        ps.vscan = ValueScan::for_special(ps.special);
                        i += 1;
                        ps.line_len += 1;
                        ps.state = ParseState::HdrOws;
                    }
                    _ if is_tchar(b) => {
                        ensure_open(msg, ps, arena, buf, OpenField::HdrName, i);
                        if ps.name_len < NAME_SCRATCH {
                            ps.name_scratch[ps.name_len] = b.to_ascii_lowercase();
                        }
                        ps.name_hash = hdr_hash_step(ps.name_hash, b);
                        ps.name_len += 1;
                        ps.line_len += 1;
                        if ps.line_len > limits.max_header_line_len {
                            block!(BlockReason::HeaderLineTooLong);
                        }
                        i += 1;
                    }
                    _ => block!(BlockReason::BadHeaderName),
                }
            }
            ParseState::HdrOws => {
                let b = next_byte!();
                match b {
                    b' ' | b'\t' => {
                        i += 1;
                        ps.line_len += 1;
                        if ps.line_len > limits.max_header_line_len {
                            block!(BlockReason::HeaderLineTooLong);
                        }
                    }
                    b'\r' => {
                        ps.value_eolen = 2;
                        ps.have_line = true;
                        i += 1;
                        ps.state = ParseState::HdrEolLf;
                    }
                    b'\n' => {
                        ps.value_eolen = 1;
                        ps.have_line = true;
                        i += 1;
                        ps.state = ParseState::HdrLineStart;
                    }
                    _ => ps.state = ParseState::HdrValue,
                }
            }
            ParseState::HdrValue => {
                if i >= len {
                    postpone!();
                }
                let stop = memchr2(b'\r', b'\n', &data[i..len]);
                let end = stop.map_or(len, |s| i + s);
                if end > i {
                    ensure_open(msg, ps, arena, buf, OpenField::HdrValue, i);
                    for &b in &data[i..end] {
                        if !is_value_byte(b) {
                            block!(BlockReason::BadHeaderValue);
                        }
                        if !ps.vscan.is_none() {
                            if let Err(reason) = ps.vscan.feed(b) {
                                block!(reason);
                            }
                        }
                    }
                    ps.line_len += end - i;
                    if ps.line_len > limits.max_header_line_len {
                        block!(BlockReason::HeaderLineTooLong);
                    }
                    i = end;
                }
                if i >= len {
                    postpone!();
                }
                close_open(msg, ps, i);
                ps.have_line = true;
                if data[i] == b'\r' {
                    ps.value_eolen = 2;
                    i += 1;
                    ps.state = ParseState::HdrEolLf;
                } else {
                    ps.value_eolen = 1;
                    i += 1;
                    ps.state = ParseState::HdrLineStart;
                }
            }
            ParseState::HdrEolLf => {
                let b = next_byte!();
                if b != b'\n' {
                    block!(BlockReason::BadLineEnding);
                }
                i += 1;
                ps.state = ParseState::HdrLineStart;
            }
            ParseState::HeadersEndLf => {
                let b = next_byte!();
                if b != b'\n' {
                    block!(BlockReason::BadLineEnding);
                }
                i += 1;
                match headers_done(msg, ps, arena) {
                    Ok(true) => pass!(),
                    Ok(false) => {}
                    Err(reason) => block!(reason),
                }
            }

            // ================================================================
            // Content-Length body
            // ================================================================
            ParseState::BodyCl => {
                if i >= len {
                    postpone!();
                }
                let take = body_take(ps.body_left, len - i);
                msg.body.append_chunk(ZStr::span(arena, buf, i, take));
                ps.received += take as u64;
                ps.body_left -= take as u64;
                i += take;
                if ps.body_left == 0 {
                    if let BodyFraming::ContentLength { declared, .. } = msg.framing {
                        msg.framing = BodyFraming::ContentLength {
                            declared,
                            received: ps.received,
                        };
                    }
                    msg.body.mark_complete();
                    ps.state = ParseState::Complete;
                    pass!();
                }
            }

            // ================================================================
            // Chunked body
            // ================================================================
            ParseState::ChunkSize => {
                let b = next_byte!();
                if let Some(v) = hex_val(b) {
                    if ps.num > u64::MAX >> 4 {
                        block!(BlockReason::NumericOverflow);
                    }
                    ps.num = (ps.num << 4) | v;
                    ps.num_digits += 1;
                    i += 1;
                } else {
                    if ps.num_digits == 0 {
                        block!(BlockReason::BadChunkSize);
                    }
                    match b {
                        b';' => {
                            i += 1;
                            ps.state = ParseState::ChunkExt;
                        }
                        b'\r' => {
                            i += 1;
                            ps.state = ParseState::ChunkSizeLf;
                        }
                        b'\n' => {
                            i += 1;
                            chunk_size_done(ps);
                        }
                        _ => block!(BlockReason::BadChunkSize),
                    }
                }
            }
            ParseState::ChunkExt => {
                if i >= len {
                    postpone!();
                }
                let stop = memchr2(b'\r', b'\n', &data[i..len]);
                let end = stop.map_or(len, |s| i + s);
                if data[i..end].iter().any(|&b| !is_value_byte(b)) {
                    block!(BlockReason::BadChunkSize);
                }
                i = end;
                if i >= len {
                    postpone!();
                }
                if data[i] == b'\r' {
                    i += 1;
                    ps.state = ParseState::ChunkSizeLf;
                } else {
                    i += 1;
                    chunk_size_done(ps);
                }
            }
            ParseState::ChunkSizeLf => {
                let b = next_byte!();
                if b != b'\n' {
                    block!(BlockReason::BadLineEnding);
                }
                i += 1;
                chunk_size_done(ps);
            }
            ParseState::ChunkData => {
                if i >= len {
                    postpone!();
                }
                let take = body_take(ps.body_left, len - i);
                msg.body.append_chunk(ZStr::span(arena, buf, i, take));
                ps.decoded += take as u64;
                ps.body_left -= take as u64;
                i += take;
                if ps.body_left == 0 {
                    ps.state = ParseState::ChunkDataCr;
                }
            }
            ParseState::ChunkDataCr => {
                let b = next_byte!();
                match b {
                    b'\r' => {
                        i += 1;
                        ps.state = ParseState::ChunkDataLf;
                    }
                    b'\n' => {
                        i += 1;
                        ps.state = ParseState::ChunkSize;
                    }
                    _ => block!(BlockReason::BadChunkFraming),
                }
            }
            ParseState::ChunkDataLf => {
                let b = next_byte!();
                if b != b'\n' {
                    block!(BlockReason::BadChunkFraming);
                }
                i += 1;
                ps.state = ParseState::ChunkSize;
            }
            ParseState::TrailerStart => {
                let b = next_byte!();
                match b {
                    b'\r' => {
                        i += 1;
                        ps.state = ParseState::LastLf;
                    }
                    b'\n' => {
                        i += 1;
                        chunked_complete(msg, ps);
                        pass!();
                    }
                    _ => ps.state = ParseState::TrailerLine,
                }
            }
            ParseState::TrailerLine => {
                if i >= len {
                    postpone!();
                }
                let stop = memchr2(b'\r', b'\n', &data[i..len]);
                let end = stop.map_or(len, |s| i + s);
                if data[i..end].iter().any(|&b| !is_value_byte(b)) {
                    block!(BlockReason::BadHeaderValue);
                }
                i = end;
                if i >= len {
                    postpone!();
                }
                if data[i] == b'\r' {
                    i += 1;
                    ps.state = ParseState::TrailerLf;
                } else {
                    i += 1;
                    ps.state = ParseState::TrailerStart;
                }
            }
            ParseState::TrailerLf => {
                let b = next_byte!();
                if b != b'\n' {
                    block!(BlockReason::BadLineEnding);
                }
                i += 1;
                ps.state = ParseState::TrailerStart;
            }
            ParseState::LastLf => {
                let b = next_byte!();
                if b != b'\n' {
                    block!(BlockReason::BadLineEnding);
                }
                i += 1;
                chunked_complete(msg, ps);
                pass!();
            }

            // ================================================================
            // Terminals
            // ================================================================
            ParseState::Complete => {
                debug_assert!(false, "parse resumed on a complete message");
                pass!();
            }
            ParseState::Blocked => {
                block!(BlockReason::ParserPoisoned);
            }
        }
    }
}

fn start_headers(ps: &mut ParserContinuation) {
    ps.state = ParseState::HdrLineStart;
    ps.have_line = false;
    ps.hdr_lines = 0;
    ps.line_len = 0;
}

/// Finish a version-less request line: HTTP/0.9, GET only, no header
/// section, connection always closes.
fn simple_request_done(
    msg: &mut Message,
    ps: &mut ParserContinuation,
    i: usize,
    from: usize,
) -> Option<ParseStep> {
    if msg.method != Some(Method::Get) {
        return Some(ParseStep {
            outcome: StepOutcome::Block(BlockReason::BadVersion),
            consumed: i - from,
        });
    }
    msg.version = Some(Version::V09);
    ps.state = ParseState::Complete;
    None
}

fn chunk_size_done(ps: &mut ParserContinuation) {
    if ps.num == 0 {
        ps.state = ParseState::TrailerStart;
    } else {
        ps.body_left = ps.num;
        ps.chunks += 1;
        ps.state = ParseState::ChunkData;
    }
    ps.num = 0;
    ps.num_digits = 0;
}

fn chunked_complete(msg: &mut Message, ps: &mut ParserContinuation) {
    msg.framing = BodyFraming::Chunked {
        chunks: ps.chunks,
        decoded: ps.decoded,
    };
    msg.body.mark_complete();
    ps.state = ParseState::Complete;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnId, ConnKind, ConnShared};
    use std::sync::Arc;

    fn test_conn() -> Arc<ConnShared> {
        Arc::new(ConnShared::new(ConnId(9), ConnKind::Client, None))
    }

    fn new_msg(kind: MsgKind) -> Message {
        match kind {
            MsgKind::Request => Message::new_request(test_conn()),
            MsgKind::Response => Message::new_response(test_conn()),
        }
    }

    fn parse_all(kind: MsgKind, input: &[u8]) -> (BufArena, Message, ParseStep) {
        let mut arena = BufArena::new();
        let buf = arena.insert(input.to_vec()).unwrap();
        let mut msg = new_msg(kind);
        let step = parse_chunk(&mut msg, &arena, buf, 0, &ParseLimits::default());
        (arena, msg, step)
    }

    /// Feed the input in `piece`-sized deliveries, each in its own
    /// buffer, resuming the same message across all of them.
    fn parse_pieces(kind: MsgKind, input: &[u8], piece: usize) -> (BufArena, Message, ParseStep) {
        let (arena, msg, step, _) = parse_pieces_tracked(kind, input, piece);
        (arena, msg, step)
    }

    fn parse_pieces_tracked(
        kind: MsgKind,
        input: &[u8],
        piece: usize,
    ) -> (BufArena, Message, ParseStep, Vec<gale_core::BufId>) {
        let mut arena = BufArena::new();
        let mut msg = new_msg(kind);
        let limits = ParseLimits::default();
        let mut bufs = Vec::new();
        let mut last = ParseStep {
            outcome: StepOutcome::Postpone,
            consumed: 0,
        };
        for chunk in input.chunks(piece) {
            let buf = arena.insert(chunk.to_vec()).unwrap();
            bufs.push(buf);
            last = parse_chunk(&mut msg, &arena, buf, 0, &limits);
            match last.outcome {
                StepOutcome::Postpone => {}
                _ => break,
            }
        }
        (arena, msg, last, bufs)
    }

    fn expect_block(step: ParseStep) -> BlockReason {
        match step.outcome {
            StepOutcome::Block(reason) => reason,
            other => panic!("expected block, got {other:?}"),
        }
    }

    // ==== Request line ====

    #[test]
    fn parses_simple_get() {
        let (arena, msg, step) = parse_all(MsgKind::Request, b"GET /a HTTP/1.1\r\n\r\n");
        assert_eq!(step.outcome, StepOutcome::Pass);
        assert_eq!(step.consumed, 19);
        assert_eq!(msg.method(), Some(Method::Get));
        assert_eq!(msg.version(), Some(Version::V11));
        assert!(msg.uri_path().equals_literal(&arena, b"/a"));
        assert!(msg.parser.is_complete());
    }

    #[test]
    fn pipelined_request_consumes_only_the_first_message() {
        let input = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let (arena, msg, step) = parse_all(MsgKind::Request, input);
        assert_eq!(step.outcome, StepOutcome::Pass);
        assert_eq!(step.consumed, 19);
        assert!(msg.uri_path().equals_literal(&arena, b"/a"));
    }

    #[test]
    fn absolute_uri_fills_host_and_path() {
        let input = b"GET http://natsys-lab.com:8080/cgi-bin/show.pl?entry=tempesta HTTP/1.1\r\n\r\n";
        let (arena, msg, step) = parse_all(MsgKind::Request, input);
        assert_eq!(step.outcome, StepOutcome::Pass);
        assert!(msg.host().equals_literal(&arena, b"natsys-lab.com:8080"));
        assert!(
            msg.uri_path()
                .equals_literal(&arena, b"/cgi-bin/show.pl?entry=tempesta")
        );
    }

    #[test]
    fn empty_authority_in_absolute_uri_blocks() {
        let (_, _, step) = parse_all(MsgKind::Request, b"GET http:///x HTTP/1.1\r\n\r\n");
        assert_eq!(expect_block(step), BlockReason::BadUri);
    }

    #[test]
    fn version_less_line_is_http09() {
        let (arena, msg, step) = parse_all(MsgKind::Request, b"GET /\r\n");
        assert_eq!(step.outcome, StepOutcome::Pass);
        assert_eq!(msg.version(), Some(Version::V09));
        assert!(msg.uri_path().equals_literal(&arena, b"/"));
        assert!(!msg.should_keep_alive());
    }

    #[test]
    fn http09_allows_only_get() {
        let (_, _, step) = parse_all(MsgKind::Request, b"POST /\r\n");
        assert_eq!(expect_block(step), BlockReason::BadVersion);
    }

    #[test]
    fn explicit_http09_version_blocks() {
        let (_, _, step) = parse_all(MsgKind::Request, b"GET / HTTP/0.9\r\n\r\n");
        assert_eq!(expect_block(step), BlockReason::BadVersion);
    }

    #[test]
    fn unknown_method_blocks() {
        let (_, _, step) = parse_all(MsgKind::Request, b"BREW /pot HTTP/1.1\r\n\r\n");
        assert_eq!(expect_block(step), BlockReason::BadMethod);
    }

    #[test]
    fn bare_lf_line_endings_are_accepted() {
        let (arena, msg, step) = parse_all(MsgKind::Request, b"GET /a HTTP/1.1\nHost: h\n\n");
        assert_eq!(step.outcome, StepOutcome::Pass);
        assert!(msg.uri_path().equals_literal(&arena, b"/a"));
        let host = msg.headers().get_special(SpecialHdr::Host).unwrap();
        assert!(host.equals_literal(&arena, b"h"));
        assert_eq!(host.eolen(), 1);
    }

    #[test]
    fn cr_without_lf_blocks() {
        let (_, _, step) = parse_all(MsgKind::Request, b"GET /a HTTP/1.1\r\rHost: h\r\n\r\n");
        assert_eq!(expect_block(step), BlockReason::BadLineEnding);
    }

    // ==== Headers ====

    #[test]
    fn header_value_records_eol_and_role_flags() {
        let (arena, msg, step) =
            parse_all(MsgKind::Request, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(step.outcome, StepOutcome::Pass);
        let field = msg.headers().special_field(SpecialHdr::Host).unwrap();
        assert!(field.name.is_name_start());
        assert!(field.value.is_value_start());
        assert!(field.value.equals_literal(&arena, b"example.com"));
        assert_eq!(field.value.eolen(), 2);
    }

    #[test]
    fn empty_host_header_is_allowed() {
        let (arena, msg, step) = parse_all(MsgKind::Request, b"GET / HTTP/1.1\r\nHost:\r\n\r\n");
        assert_eq!(step.outcome, StepOutcome::Pass);
        let host = msg.headers().get_special(SpecialHdr::Host).unwrap();
        assert!(host.is_empty());
        let _ = arena;
    }

    #[test]
    fn space_before_colon_blocks() {
        let (_, _, step) = parse_all(MsgKind::Request, b"GET / HTTP/1.1\r\nHost : h\r\n\r\n");
        assert_eq!(expect_block(step), BlockReason::BadHeaderName);
    }

    #[test]
    fn folded_continuation_joins_with_a_single_space() {
        let input = b"GET / HTTP/1.1\r\nX-Note: first\r\n\tsecond\r\n\r\n";
        let (arena, msg, step) = parse_all(MsgKind::Request, input);
        assert_eq!(step.outcome, StepOutcome::Pass);
        let value = msg.headers().find_raw(&arena, b"x-note").unwrap();
        assert!(value.equals_literal(&arena, b"first second"));
    }

    #[test]
    fn fold_after_empty_value_has_no_leading_space() {
        let input = b"GET / HTTP/1.1\r\nHost:\r\n   foo.com\r\n\r\n";
        let (arena, msg, step) = parse_all(MsgKind::Request, input);
        assert_eq!(step.outcome, StepOutcome::Pass);
        let host = msg.headers().get_special(SpecialHdr::Host).unwrap();
        assert!(host.equals_literal(&arena, b"foo.com"));
    }

    #[test]
    fn fold_before_any_header_blocks() {
        let (_, _, step) = parse_all(MsgKind::Request, b"GET / HTTP/1.1\r\n x: y\r\n\r\n");
        assert_eq!(expect_block(step), BlockReason::BadFold);
    }

    #[test]
    fn repeated_singleton_header_blocks() {
        let input = b"GET / HTTP/1.1\r\nUser-Agent: a\r\nUser-Agent: b\r\n\r\n";
        let (_, _, step) = parse_all(MsgKind::Request, input);
        assert_eq!(
            expect_block(step),
            BlockReason::DuplicateHeader(SpecialHdr::UserAgent)
        );
    }

    #[test]
    fn header_count_limit_blocks() {
        let mut arena = BufArena::new();
        let buf = arena
            .insert(b"GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\nC: 3\r\n\r\n".to_vec())
            .unwrap();
        let mut msg = new_msg(MsgKind::Request);
        let limits = ParseLimits::default().with_max_header_count(2);
        let step = parse_chunk(&mut msg, &arena, buf, 0, &limits);
        assert_eq!(expect_block(step), BlockReason::TooManyHeaders);
    }

    #[test]
    fn blocked_parser_stays_blocked() {
        let mut arena = BufArena::new();
        let buf = arena.insert(b"BREW / HTTP/1.1\r\n\r\n".to_vec()).unwrap();
        let mut msg = new_msg(MsgKind::Request);
        let limits = ParseLimits::default();
        let first = parse_chunk(&mut msg, &arena, buf, 0, &limits);
        assert!(matches!(first.outcome, StepOutcome::Block(_)));
        let again = parse_chunk(&mut msg, &arena, buf, 0, &limits);
        assert_eq!(expect_block(again), BlockReason::ParserPoisoned);
    }

    // ==== Framing policies ====

    #[test]
    fn any_duplicate_content_length_blocks_requests() {
        let input = b"POST / HTTP/1.1\r\nContent-Length: 0\r\nContent-Length: 0\r\n\r\n";
        let (_, _, step) = parse_all(MsgKind::Request, input);
        assert_eq!(
            expect_block(step),
            BlockReason::DuplicateHeader(SpecialHdr::ContentLength)
        );
    }

    #[test]
    fn any_duplicate_content_length_blocks_responses() {
        let input = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nContent-Length: 0\r\n\r\n";
        let (_, _, step) = parse_all(MsgKind::Response, input);
        assert_eq!(
            expect_block(step),
            BlockReason::DuplicateHeader(SpecialHdr::ContentLength)
        );
    }

    #[test]
    fn content_length_with_chunked_blocks() {
        let input = b"POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n";
        let (_, _, step) = parse_all(MsgKind::Request, input);
        assert_eq!(expect_block(step), BlockReason::AmbiguousFraming);
    }

    #[test]
    fn non_numeric_content_length_blocks() {
        let input = b"POST / HTTP/1.1\r\nContent-Length: 5x\r\n\r\n";
        let (_, _, step) = parse_all(MsgKind::Request, input);
        assert_eq!(expect_block(step), BlockReason::BadContentLength);
    }

    #[test]
    fn content_length_overflow_blocks() {
        let input = b"POST / HTTP/1.1\r\nContent-Length: 99999999999999999999\r\n\r\n";
        let (_, _, step) = parse_all(MsgKind::Request, input);
        assert_eq!(expect_block(step), BlockReason::NumericOverflow);
    }

    #[test]
    fn transfer_encoding_other_than_chunked_blocks() {
        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n";
        let (_, _, step) = parse_all(MsgKind::Request, input);
        assert_eq!(expect_block(step), BlockReason::BadTransferEncoding);
    }

    #[test]
    fn reads_content_length_body() {
        let input = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (arena, msg, step) = parse_all(MsgKind::Request, input);
        assert_eq!(step.outcome, StepOutcome::Pass);
        assert_eq!(step.consumed, input.len());
        assert!(msg.body().equals_literal(&arena, b"hello"));
        assert_eq!(
            msg.framing(),
            BodyFraming::ContentLength {
                declared: 5,
                received: 5
            }
        );
    }

    // ==== Chunked bodies ====

    #[test]
    fn reads_chunked_body_with_extension_and_trailer() {
        let input =
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5;x=1\r\nhello\r\n3\r\n, w\r\n0\r\nX-Sum: abc\r\n\r\n";
        let (arena, msg, step) = parse_all(MsgKind::Request, input);
        assert_eq!(step.outcome, StepOutcome::Pass);
        assert!(msg.body().equals_literal(&arena, b"hello, w"));
        assert_eq!(
            msg.framing(),
            BodyFraming::Chunked {
                chunks: 2,
                decoded: 8
            }
        );
    }

    #[test]
    fn chunk_size_overflow_blocks() {
        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nFFFFFFFFFFFFFFFF0\r\n";
        let (_, _, step) = parse_all(MsgKind::Request, input);
        assert_eq!(expect_block(step), BlockReason::NumericOverflow);
    }

    #[test]
    fn missing_chunk_terminator_blocks() {
        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nabX";
        let (_, _, step) = parse_all(MsgKind::Request, input);
        assert_eq!(expect_block(step), BlockReason::BadChunkFraming);
    }

    #[test]
    fn empty_chunk_size_line_blocks() {
        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\r\n";
        let (_, _, step) = parse_all(MsgKind::Request, input);
        assert_eq!(expect_block(step), BlockReason::BadChunkSize);
    }

    // ==== Connection and forwarding policies ====

    #[test]
    fn connection_tokens_set_flags() {
        let input = b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n";
        let (_, msg, step) = parse_all(MsgKind::Request, input);
        assert_eq!(step.outcome, StepOutcome::Pass);
        assert!(msg.flags().conn_keep_alive);
        assert!(msg.should_keep_alive());

        let input = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let (_, msg, step) = parse_all(MsgKind::Request, input);
        assert_eq!(step.outcome, StepOutcome::Pass);
        assert!(msg.flags().conn_close);
        assert!(!msg.should_keep_alive());
    }

    #[test]
    fn forwarded_for_accepts_address_lists() {
        let input = b"GET / HTTP/1.1\r\nX-Forwarded-For: 127.0.0.1, example.com , 18.29.1.1\r\n\r\n";
        let (_, _, step) = parse_all(MsgKind::Request, input);
        assert_eq!(step.outcome, StepOutcome::Pass);
    }

    #[test]
    fn forwarded_for_rejects_bracketed_and_empty_values() {
        for bad in [
            &b"GET / HTTP/1.1\r\nX-Forwarded-For: [::1]:1234\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\nX-Forwarded-For:\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\nX-Forwarded-For: ,127.0.0.1\r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\nX-Forwarded-For: 1.2.3.4, \r\n\r\n"[..],
            &b"GET / HTTP/1.1\r\nX-Forwarded-For: 1.2 3.4\r\n\r\n"[..],
        ] {
            let (_, _, step) = parse_all(MsgKind::Request, bad);
            assert_eq!(expect_block(step), BlockReason::SuspiciousForwardedFor);
        }
    }

    #[test]
    fn forwarded_for_fold_completes_trailing_element() {
        let input = b"GET / HTTP/1.1\r\nX-Forwarded-For: 1.2.3.4,\r\n 5.6.7.8\r\n\r\n";
        let (arena, msg, step) = parse_all(MsgKind::Request, input);
        assert_eq!(step.outcome, StepOutcome::Pass);
        let xff = msg.headers().get_special(SpecialHdr::XForwardedFor).unwrap();
        assert!(xff.equals_literal(&arena, b"1.2.3.4, 5.6.7.8"));
    }

    // ==== Status lines ====

    #[test]
    fn parses_status_line_and_reason() {
        let (arena, msg, step) = parse_all(MsgKind::Response, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(step.outcome, StepOutcome::Pass);
        assert_eq!(msg.status(), Some(200));
        assert!(msg.reason().equals_literal(&arena, b"OK"));
    }

    #[test]
    fn status_code_out_of_range_blocks() {
        let (_, _, step) = parse_all(MsgKind::Response, b"HTTP/1.1 099 Low\r\n\r\n");
        assert_eq!(expect_block(step), BlockReason::BadStatus);
        let (_, _, step) = parse_all(MsgKind::Response, b"HTTP/1.1 6000 Big\r\n\r\n");
        assert_eq!(expect_block(step), BlockReason::BadStatus);
    }

    #[test]
    fn bodyless_status_completes_at_headers_end() {
        let input = b"HTTP/1.1 204 No Content\r\nContent-Length: 5\r\n\r\n";
        let (_, msg, step) = parse_all(MsgKind::Response, input);
        assert_eq!(step.outcome, StepOutcome::Pass);
        assert_eq!(step.consumed, input.len());
        assert!(msg.body().is_empty());
    }

    #[test]
    fn head_paired_response_skips_declared_body() {
        let mut arena = BufArena::new();
        let buf = arena
            .insert(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n".to_vec())
            .unwrap();
        let mut msg = new_msg(MsgKind::Response);
        msg.flags_mut().void_body = true;
        let step = parse_chunk(&mut msg, &arena, buf, 0, &ParseLimits::default());
        assert_eq!(step.outcome, StepOutcome::Pass);
        assert!(msg.body().is_empty());
    }

    // ==== Chunk-boundary invariance ====

    #[test]
    fn byte_at_a_time_parse_matches_single_buffer() {
        let input = b"GET http://natsys-lab.com:8080/cgi-bin/show.pl?entry=tempesta HTTP/1.1\r\nHost: natsys-lab.com\r\nConnection: close\r\n\r\n";
        let (whole_arena, whole, step) = parse_all(MsgKind::Request, input);
        assert_eq!(step.outcome, StepOutcome::Pass);
        for piece in [1usize, 2, 3, 7, 16] {
            let (arena, msg, step) = parse_pieces(MsgKind::Request, input, piece);
            assert_eq!(step.outcome, StepOutcome::Pass, "piece size {piece}");
            assert!(msg.host().equals_literal(&arena, b"natsys-lab.com:8080"));
            assert!(
                msg.uri_path()
                    .equals_literal(&arena, b"/cgi-bin/show.pl?entry=tempesta")
            );
            assert!(msg.flags().conn_close);
            let host = msg.headers().get_special(SpecialHdr::Host).unwrap();
            assert!(host.equals_literal(&arena, b"natsys-lab.com"));
        }
        assert!(whole.host().equals_literal(&whole_arena, b"natsys-lab.com:8080"));
    }

    #[test]
    fn split_chunked_body_decodes_identically() {
        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        for piece in [1usize, 4, 9] {
            let (arena, msg, step) = parse_pieces(MsgKind::Request, input, piece);
            assert_eq!(step.outcome, StepOutcome::Pass, "piece size {piece}");
            assert!(msg.body().equals_literal(&arena, b"hello world"));
            assert_eq!(
                msg.framing(),
                BodyFraming::Chunked {
                    chunks: 2,
                    decoded: 11
                }
            );
        }
    }

    #[test]
    fn released_message_returns_all_buffers() {
        let input = b"GET /a HTTP/1.1\r\nHost: h\r\nCookie: k=v\r\n\r\n";
        let (mut arena, msg, step, bufs) = parse_pieces_tracked(MsgKind::Request, input, 5);
        assert_eq!(step.outcome, StepOutcome::Pass);
        msg.release(&arena);
        // The per-delivery insert refs still belong to the driver.
        for buf in bufs {
            arena.release(buf);
        }
        arena.reclaim();
        assert_eq!(arena.live_entries(), 0);
    }
}
