//! Core building blocks for the gale proxy engine.
//!
//! This crate holds the pieces the HTTP machinery is built on:
//!
//! - A reference-counted backing-buffer arena ([`arena`]) that owns
//!   every byte chunk delivered by the socket layer.
//! - The zero-copy string model ([`zstr`]): plain spans, compound
//!   fragments and duplicate groups over arena buffers.
//! - Structured logging ([`logging`]) with no global state.
//!
//! Nothing here performs I/O or blocks; the types are plain values
//! driven by whichever event loop owns the connection.

#![forbid(unsafe_code)]

pub mod arena;
pub mod logging;
pub mod zstr;

pub use arena::{BufArena, BufId, DEFAULT_MAX_BUFFERS};
pub use logging::{CaptureSink, LogConfig, LogEntry, LogLevel, LogSink, Logger, StderrSink};
pub use zstr::{Pieces, Segments, SpanPiece, SpanRef, StrError, ZStr};
