//! Zero-copy string model.
//!
//! A [`ZStr`] names bytes instead of holding them: a plain span into an
//! arena buffer (or a static literal), a compound sequence of chunks
//! when one logical value is scattered across non-contiguous memory,
//! or a duplicate group carrying every occurrence of a repeatable
//! header. Payload bytes are copied exactly once, and only when a
//! caller explicitly materializes the value into its own buffer.
//!
//! Parsing appends chunks as data arrives. When a buffer boundary
//! interrupts a field, the last chunk stays "open" (zero length) until
//! [`ZStr::update_open_length`] stamps the end offset, so resumption
//! never re-reads or copies consumed input.

use crate::arena::{BufArena, BufId};

/// Where a plain span's bytes live.
#[derive(Clone, Copy, Debug)]
pub enum SpanRef {
    /// Window into an arena buffer, starting at `off`.
    Buf { id: BufId, off: usize },
    /// Static literal text, used by the builder and for synthesized
    /// fragments. Not refcounted.
    Lit(&'static [u8]),
}

#[derive(Debug)]
enum ZData {
    Plain(SpanRef),
    Compound(Vec<ZStr>),
    Duplicates(Vec<ZStr>),
}

/// Zero-copy string: plain span, compound chunk sequence, or duplicate
/// group. See the module docs for the ownership rules.
#[derive(Debug)]
pub struct ZStr {
    data: ZData,
    /// Content length in bytes, excluding the line terminator.
    len: usize,
    /// Line-terminator length: 0 (none), 1 (LF) or 2 (CRLF).
    eolen: u8,
    flags: u8,
}

impl ZStr {
    /// Finalized: the end offset is known and no further chunks follow.
    pub const COMPLETE: u8 = 0x01;
    /// A header name starts at this string.
    pub const NAME: u8 = 0x02;
    /// A header value starts at this string.
    pub const VALUE: u8 = 0x04;

    /// Empty string, complete, no terminator.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            data: ZData::Plain(SpanRef::Lit(b"")),
            len: 0,
            eolen: 0,
            flags: Self::COMPLETE,
        }
    }

    /// Span over static literal bytes, complete.
    #[must_use]
    pub const fn lit(text: &'static [u8]) -> Self {
        Self {
            data: ZData::Plain(SpanRef::Lit(text)),
            len: text.len(),
            eolen: 0,
            flags: Self::COMPLETE,
        }
    }

    /// Closed span over `len` bytes of an arena buffer. Takes one
    /// reference on the buffer, dropped again by
    /// [`Self::release_spans`].
    #[must_use]
    pub fn span(arena: &BufArena, id: BufId, off: usize, len: usize) -> Self {
        arena.retain(id);
        Self {
            data: ZData::Plain(SpanRef::Buf { id, off }),
            len,
            eolen: 0,
            flags: Self::COMPLETE,
        }
    }

    /// Open span starting at `off`; its length is unknown until
    /// [`Self::update_open_length`] runs. Takes one buffer reference.
    #[must_use]
    pub fn open(arena: &BufArena, id: BufId, off: usize) -> Self {
        arena.retain(id);
        Self {
            data: ZData::Plain(SpanRef::Buf { id, off }),
            len: 0,
            eolen: 0,
            flags: 0,
        }
    }

    /// Content length in bytes, excluding the terminator. For a
    /// duplicate group this is the sum over all occurrences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the content length is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Line-terminator length (0, 1 or 2).
    #[must_use]
    pub fn eolen(&self) -> u8 {
        self.eolen
    }

    /// Content length plus terminator length.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.len + self.eolen as usize
    }

    /// Record the line terminator that followed this value on the wire.
    pub fn set_eolen(&mut self, eolen: u8) {
        debug_assert!(eolen <= 2, "terminator longer than CRLF");
        self.eolen = eolen;
    }

    #[must_use]
    pub fn is_plain(&self) -> bool {
        matches!(self.data, ZData::Plain(_))
    }

    #[must_use]
    pub fn is_compound(&self) -> bool {
        matches!(self.data, ZData::Compound(_))
    }

    #[must_use]
    pub fn is_duplicate_group(&self) -> bool {
        matches!(self.data, ZData::Duplicates(_))
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.flags & Self::COMPLETE != 0
    }

    /// Finalize: the end offset is known.
    pub fn mark_complete(&mut self) {
        self.flags |= Self::COMPLETE;
    }

    /// Mark that a header name starts at this string.
    pub fn mark_name_start(&mut self) {
        self.flags |= Self::NAME;
    }

    #[must_use]
    pub fn is_name_start(&self) -> bool {
        self.flags & Self::NAME != 0
    }

    /// Mark that a header value starts at this string.
    pub fn mark_value_start(&mut self) {
        self.flags |= Self::VALUE;
    }

    #[must_use]
    pub fn is_value_start(&self) -> bool {
        self.flags & Self::VALUE != 0
    }

    /// Convert a plain string into a one-chunk compound in place.
    /// No-op for strings that already are compounds.
    pub fn promote_to_compound(&mut self) {
        debug_assert!(
            !self.is_duplicate_group(),
            "cannot promote a duplicate group"
        );
        if let ZData::Plain(span) = self.data {
            let chunk = Self {
                data: ZData::Plain(span),
                len: self.len,
                eolen: 0,
                flags: Self::COMPLETE,
            };
            self.data = ZData::Compound(vec![chunk]);
        }
    }

    /// Attach another fragment of the same logical value. Promotes a
    /// plain string to a compound on the second fragment; appending to
    /// an empty string just takes the chunk's place.
    ///
    /// # Panics
    /// If either side is a duplicate group.
    pub fn append_chunk(&mut self, chunk: Self) {
        assert!(
            !self.is_duplicate_group() && !chunk.is_duplicate_group(),
            "duplicate groups hold whole values, not chunks"
        );
        debug_assert_eq!(chunk.eolen, 0, "terminators belong to the top-level value");
        let empty_plain =
            self.len == 0 && matches!(&self.data, ZData::Plain(SpanRef::Lit(l)) if l.is_empty());
        if empty_plain {
            self.len = chunk.len;
            if !chunk.is_complete() {
                self.flags &= !Self::COMPLETE;
            }
            self.data = chunk.data;
            return;
        }
        self.promote_to_compound();
        if let ZData::Compound(chunks) = &mut self.data {
            self.len += chunk.len;
            chunks.push(chunk);
        }
    }

    /// Fold another occurrence of the same header into this value,
    /// turning it into a duplicate group on the second occurrence.
    /// Element 0 is always the first occurrence seen.
    ///
    /// # Panics
    /// If `next` is itself a duplicate group: groups never nest.
    pub fn add_duplicate(&mut self, next: Self) {
        assert!(!next.is_duplicate_group(), "duplicate groups never nest");
        if let ZData::Duplicates(dups) = &mut self.data {
            self.len += next.len;
            dups.push(next);
            return;
        }
        let first = std::mem::replace(self, Self::empty());
        *self = Self {
            len: first.len + next.len,
            eolen: 0,
            flags: ((first.flags | next.flags) & (Self::NAME | Self::VALUE)) | Self::COMPLETE,
            data: ZData::Duplicates(vec![first, next]),
        };
    }

    /// Occurrences of this value: the group elements for a duplicate
    /// group, otherwise the value itself as a group of one.
    #[must_use]
    pub fn duplicates(&self) -> &[Self] {
        match &self.data {
            ZData::Duplicates(dups) => dups,
            _ => std::slice::from_ref(self),
        }
    }

    /// Extend the currently-open chunk up to `cursor` (an offset in the
    /// chunk's backing buffer). Used when a buffer boundary interrupted
    /// parsing and the end offset only became known later.
    ///
    /// # Panics
    /// If no open arena-backed chunk exists or `cursor` precedes it.
    pub fn update_open_length(&mut self, cursor: usize) {
        match &mut self.data {
            ZData::Plain(SpanRef::Buf { off, .. }) => {
                assert!(cursor >= *off, "cursor before open span");
                self.len = cursor - *off;
            }
            ZData::Compound(chunks) => {
                let Some(last) = chunks.last_mut() else {
                    panic!("update_open_length on an empty compound");
                };
                let old = last.len;
                last.update_open_length(cursor);
                self.len = self.len - old + last.len;
            }
            _ => panic!("update_open_length needs an arena-backed chunk"),
        }
    }

    /// Leaf byte slices of this value in order, resolving arena spans
    /// through `arena`. Duplicate-group elements appear back to back.
    pub fn segments<'a>(&'a self, arena: &'a BufArena) -> Segments<'a> {
        Segments {
            arena,
            stack: vec![self],
        }
    }

    /// Leaf spans of this value in order, without resolving them. The
    /// builder uses this to stage transmission segments that reference
    /// buffers instead of copying from them.
    pub fn pieces(&self) -> Pieces<'_> {
        Pieces { stack: vec![self] }
    }

    /// Exact byte equality against a literal.
    #[must_use]
    pub fn equals_literal(&self, arena: &BufArena, lit: &[u8]) -> bool {
        self.cmp_literal(arena, lit, false, false)
    }

    /// Case-insensitive (ASCII) equality against a literal.
    #[must_use]
    pub fn equals_literal_nocase(&self, arena: &BufArena, lit: &[u8]) -> bool {
        self.cmp_literal(arena, lit, true, false)
    }

    /// True when the value begins with `lit`.
    #[must_use]
    pub fn starts_with_literal(&self, arena: &BufArena, lit: &[u8]) -> bool {
        self.cmp_literal(arena, lit, false, true)
    }

    /// Case-insensitive (ASCII) prefix test.
    #[must_use]
    pub fn starts_with_literal_nocase(&self, arena: &BufArena, lit: &[u8]) -> bool {
        self.cmp_literal(arena, lit, true, true)
    }

    fn cmp_literal(&self, arena: &BufArena, lit: &[u8], nocase: bool, prefix: bool) -> bool {
        debug_assert!(
            !self.is_duplicate_group(),
            "literal comparison against a duplicate group is ill-posed"
        );
        if self.is_duplicate_group() {
            return false;
        }
        if prefix {
            if self.len < lit.len() {
                return false;
            }
        } else if self.len != lit.len() {
            return false;
        }
        let mut rest = lit;
        for seg in self.segments(arena) {
            if rest.is_empty() {
                break;
            }
            let take = seg.len().min(rest.len());
            let (head, tail) = rest.split_at(take);
            let seg_head = &seg[..take];
            let eq = if nocase {
                seg_head.eq_ignore_ascii_case(head)
            } else {
                seg_head == head
            };
            if !eq {
                return false;
            }
            rest = tail;
        }
        rest.is_empty()
    }

    /// Linearize the content into `dst`; this is the only copying
    /// operation. Returns the number of bytes written. The terminator
    /// is not part of the content and is not written.
    pub fn materialize_to_buffer(
        &self,
        arena: &BufArena,
        dst: &mut [u8],
    ) -> Result<usize, StrError> {
        if dst.len() < self.len {
            return Err(StrError::BufferTooSmall {
                needed: self.len,
                capacity: dst.len(),
            });
        }
        let mut at = 0;
        for seg in self.segments(arena) {
            dst[at..at + seg.len()].copy_from_slice(seg);
            at += seg.len();
        }
        debug_assert_eq!(at, self.len, "segment lengths disagree with the total");
        Ok(at)
    }

    /// Drop the buffer references held by every arena-backed span in
    /// this tree. Called when the owning message is destroyed.
    pub fn release_spans(&self, arena: &BufArena) {
        match &self.data {
            ZData::Plain(SpanRef::Buf { id, .. }) => arena.release(*id),
            ZData::Plain(SpanRef::Lit(_)) => {}
            ZData::Compound(children) | ZData::Duplicates(children) => {
                for child in children {
                    child.release_spans(arena);
                }
            }
        }
    }
}

impl Default for ZStr {
    fn default() -> Self {
        Self::empty()
    }
}

/// Iterator over the leaf byte slices of a [`ZStr`], in order.
pub struct Segments<'a> {
    arena: &'a BufArena,
    stack: Vec<&'a ZStr>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        while let Some(z) = self.stack.pop() {
            match &z.data {
                ZData::Plain(SpanRef::Buf { id, off }) => {
                    return Some(&self.arena.bytes(*id)[*off..*off + z.len]);
                }
                ZData::Plain(SpanRef::Lit(text)) => return Some(&text[..z.len]),
                ZData::Compound(children) | ZData::Duplicates(children) => {
                    self.stack.extend(children.iter().rev());
                }
            }
        }
        None
    }
}

/// One leaf span of a [`ZStr`], unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanPiece {
    /// `len` bytes of an arena buffer starting at `off`.
    Buf { id: BufId, off: usize, len: usize },
    /// Static literal bytes.
    Lit(&'static [u8]),
}

impl SpanPiece {
    /// Content length of this piece in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Buf { len, .. } => *len,
            Self::Lit(text) => text.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterator over the unresolved leaf spans of a [`ZStr`], in order.
pub struct Pieces<'a> {
    stack: Vec<&'a ZStr>,
}

impl Iterator for Pieces<'_> {
    type Item = SpanPiece;

    fn next(&mut self) -> Option<SpanPiece> {
        while let Some(z) = self.stack.pop() {
            match &z.data {
                ZData::Plain(SpanRef::Buf { id, off }) => {
                    return Some(SpanPiece::Buf {
                        id: *id,
                        off: *off,
                        len: z.len,
                    });
                }
                ZData::Plain(SpanRef::Lit(text)) => return Some(SpanPiece::Lit(&text[..z.len])),
                ZData::Compound(children) | ZData::Duplicates(children) => {
                    self.stack.extend(children.iter().rev());
                }
            }
        }
        None
    }
}

/// Errors from explicit string operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrError {
    /// Destination cannot hold the linearized content.
    BufferTooSmall { needed: usize, capacity: usize },
}

impl std::fmt::Display for StrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferTooSmall { needed, capacity } => {
                write!(f, "buffer too small: need {needed} bytes, have {capacity}")
            }
        }
    }
}

impl std::error::Error for StrError {}

// ============================================================================
// Tests
// ============================================================================
