//! Zero-copy HTTP/1.x protocol engine for the gale proxy.
//!
//! Bytes arrive from the socket layer in whatever chunks the kernel
//! hands over; this crate parses them in place, never copying message
//! content. Parsed requests and responses are trees of spans
//! ([`gale_core::ZStr`]) over the original buffers, and outbound
//! messages are assembled as segment lists over those same spans.
//!
//! The crate splits into:
//!
//! - [`parser`]: a resumable state machine that consumes wire bytes
//!   and fills in a [`Message`], suspending mid-token when a read
//!   ends and picking up exactly there on the next one.
//! - [`msg`] and [`header`]: the parsed representation, with a header
//!   table that gives O(1) access to the handful of headers a proxy
//!   actually inspects.
//! - [`build`]: emission of adjusted, synthesized, and redirect
//!   responses as segment lists, copy-free where spans survive.
//! - [`conn`] and [`engine`]: pipelined request/response pairing and
//!   the full proxy lifecycle, driven by embedder hooks.
//!
//! # Example
//!
//! ```ignore
//! use gale_http::{EngineConfig, ProxyEngine, SockAction};
//!
//! let mut engine = ProxyEngine::new(hooks, EngineConfig::default());
//! engine.client_connected(conn_id, Some(peer));
//! match engine.on_data(conn_id, bytes) {
//!     SockAction::KeepOpen => {}
//!     SockAction::Close => drop_socket(conn_id),
//! }
//! ```

#![forbid(unsafe_code)]

pub mod build;
pub mod conn;
pub mod engine;
pub mod header;
pub mod msg;
pub mod parser;

pub use build::{
    BuildError, ConnDirective, SynthStatus, WireBuilder, WireMessage, WireSeg, emit_request,
    emit_response, imf_fixdate, redirect_response, synth_response,
};
pub use conn::{ConnId, ConnKind, ConnShared};
pub use engine::{
    AdjustError, EngineConfig, ErrorClass, ProxyEngine, ProxyHooks, SendError, SockAction,
    classify,
};
pub use header::{HeaderField, HeaderTable, RawSlotId, SpecialHdr, hdr_hash, hdr_hash_step};
pub use msg::{BodyFraming, Message, Method, MsgFlags, MsgKind, Version};
pub use parser::{BlockReason, ParseLimits, ParseStep, StepOutcome, parse_chunk};
