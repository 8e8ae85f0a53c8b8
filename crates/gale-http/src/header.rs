//! Header table: fixed special slots plus growable raw slots.
//!
//! Well-known headers get dedicated slots addressed by [`SpecialHdr`]
//! for O(1) access; everything else lands in the raw block, tagged
//! with a case-insensitive hash of its name so later lookups skip the
//! byte comparison for non-matches. Raw slots are tombstoned on
//! removal, never compacted, so a [`RawSlotId`] stays valid for the
//! table's lifetime.

use gale_core::{BufArena, ZStr};

/// Number of dedicated special slots.
pub const SPECIAL_SLOTS: usize = 10;

/// Headers with dedicated table slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecialHdr {
    Host,
    Connection,
    ContentLength,
    ContentType,
    Cookie,
    SetCookie,
    Server,
    TransferEncoding,
    UserAgent,
    XForwardedFor,
}

impl SpecialHdr {
    /// Every special, in table (and emission) order.
    pub const ALL: [Self; SPECIAL_SLOTS] = [
        Self::Host,
        Self::Connection,
        Self::ContentLength,
        Self::ContentType,
        Self::Cookie,
        Self::SetCookie,
        Self::Server,
        Self::TransferEncoding,
        Self::UserAgent,
        Self::XForwardedFor,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Canonical wire name.
    #[must_use]
    pub fn name(self) -> &'static [u8] {
        match self {
            Self::Host => b"Host",
            Self::Connection => b"Connection",
            Self::ContentLength => b"Content-Length",
            Self::ContentType => b"Content-Type",
            Self::Cookie => b"Cookie",
            Self::SetCookie => b"Set-Cookie",
            Self::Server => b"Server",
            Self::TransferEncoding => b"Transfer-Encoding",
            Self::UserAgent => b"User-Agent",
            Self::XForwardedFor => b"X-Forwarded-For",
        }
    }

    /// Case-insensitive lookup by wire name.
    #[must_use]
    pub fn from_name(name: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }

    /// Singletons may appear at most once per message; a repeat is a
    /// smuggling signal and fails the parse.
    #[must_use]
    pub fn is_singleton(self) -> bool {
        matches!(
            self,
            Self::Host
                | Self::ContentLength
                | Self::ContentType
                | Self::TransferEncoding
                | Self::UserAgent
                | Self::Cookie
        )
    }
}

// ============================================================================
// Name hashing
// ============================================================================

/// FNV-1a over the lowercased name; computable byte-at-a-time so the
/// parser can hash names that straddle buffer boundaries.
pub const HDR_HASH_SEED: u64 = 0xcbf2_9ce4_8422_2325;

const HDR_HASH_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Fold one name byte into a running hash.
#[must_use]
pub fn hdr_hash_step(hash: u64, byte: u8) -> u64 {
    (hash ^ u64::from(byte.to_ascii_lowercase())).wrapping_mul(HDR_HASH_PRIME)
}

/// Hash a complete header name.
#[must_use]
pub fn hdr_hash(name: &[u8]) -> u64 {
    name.iter().fold(HDR_HASH_SEED, |h, &b| hdr_hash_step(h, b))
}

// ============================================================================
// Table
// ============================================================================

/// One stored header: the name exactly as it appeared on the wire and
/// the value, which becomes a duplicate group on repeats.
#[derive(Debug)]
pub struct HeaderField {
    pub name: ZStr,
    pub value: ZStr,
}

impl HeaderField {
    fn release_spans(&self, arena: &BufArena) {
        self.name.release_spans(arena);
        self.value.release_spans(arena);
    }
}

/// Stable identity of a raw slot; survives table growth and removal
/// of other slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawSlotId(u32);

struct RawHeader {
    hash: u64,
    field: HeaderField,
}

/// Errors surfaced while filling the table during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdrError {
    /// A singleton special header appeared a second time.
    DuplicateSingleton(SpecialHdr),
}

impl std::fmt::Display for HdrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateSingleton(hdr) => {
                write!(
                    f,
                    "duplicate {} header",
                    String::from_utf8_lossy(hdr.name())
                )
            }
        }
    }
}

impl std::error::Error for HdrError {}

/// The per-message header table.
#[derive(Default)]
pub struct HeaderTable {
    special: [Option<HeaderField>; SPECIAL_SLOTS],
    raw: Vec<Option<RawHeader>>,
}

impl std::fmt::Debug for HeaderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderTable")
            .field("specials", &self.special.iter().flatten().count())
            .field("raw", &self.raw.iter().flatten().count())
            .finish()
    }
}

impl HeaderTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live header count: occupied specials plus live raw slots.
    /// Duplicate groups count as one.
    #[must_use]
    pub fn len(&self) -> usize {
        self.special.iter().flatten().count() + self.raw.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value stored in a special slot.
    #[must_use]
    pub fn get_special(&self, id: SpecialHdr) -> Option<&ZStr> {
        self.special[id.index()].as_ref().map(|f| &f.value)
    }

    /// Full field (wire name and value) of a special slot.
    #[must_use]
    pub fn special_field(&self, id: SpecialHdr) -> Option<&HeaderField> {
        self.special[id.index()].as_ref()
    }

    /// Hash-assisted raw lookup by name (case-insensitive).
    #[must_use]
    pub fn find_raw(&self, arena: &BufArena, name: &[u8]) -> Option<&ZStr> {
        let id = self.find_raw_slot(arena, name)?;
        self.raw_field(id).map(|f| &f.value)
    }

    /// Raw lookup returning the stable slot identity.
    #[must_use]
    pub fn find_raw_slot(&self, arena: &BufArena, name: &[u8]) -> Option<RawSlotId> {
        let hash = hdr_hash(name);
        self.raw.iter().enumerate().find_map(|(i, slot)| {
            let raw = slot.as_ref()?;
            if raw.hash == hash && raw.field.name.equals_literal_nocase(arena, name) {
                u32::try_from(i).ok().map(RawSlotId)
            } else {
                None
            }
        })
    }

    /// Field behind a raw slot id, `None` once removed.
    #[must_use]
    pub fn raw_field(&self, id: RawSlotId) -> Option<&HeaderField> {
        self.raw.get(id.0 as usize)?.as_ref().map(|r| &r.field)
    }

    /// Append a raw slot unconditionally, growing the raw block.
    pub fn add(&mut self, arena: &BufArena, name: ZStr, value: ZStr) -> RawSlotId {
        let mut hash = HDR_HASH_SEED;
        for seg in name.segments(arena) {
            hash = seg.iter().fold(hash, |h, &b| hdr_hash_step(h, b));
        }
        self.push_raw(hash, HeaderField { name, value })
    }

    fn push_raw(&mut self, hash: u64, field: HeaderField) -> RawSlotId {
        let idx = u32::try_from(self.raw.len()).unwrap_or(u32::MAX);
        self.raw.push(Some(RawHeader { hash, field }));
        RawSlotId(idx)
    }

    /// Store a header the parser just finished. Routes to the special
    /// block when `special` is set, otherwise to the raw block keyed
    /// by `hash` (the parser's incremental name hash). Repeats of
    /// repeatable headers fold into a duplicate group; repeats of
    /// singletons fail the parse.
    pub fn commit_parsed(
        &mut self,
        arena: &BufArena,
        special: Option<SpecialHdr>,
        name: ZStr,
        value: ZStr,
        hash: u64,
    ) -> Result<(), HdrError> {
        if let Some(id) = special {
            match &mut self.special[id.index()] {
                slot @ None => {
                    *slot = Some(HeaderField { name, value });
                }
                Some(field) => {
                    if id.is_singleton() {
                        name.release_spans(arena);
                        value.release_spans(arena);
                        return Err(HdrError::DuplicateSingleton(id));
                    }
                    // Keep the first occurrence's name spans.
                    name.release_spans(arena);
                    field.value.add_duplicate(value);
                }
            }
            return Ok(());
        }

        let existing = self.raw.iter_mut().flatten().find(|raw| {
            raw.hash == hash && names_equal(arena, &raw.field.name, &name)
        });
        if let Some(raw) = existing {
            name.release_spans(arena);
            raw.field.value.add_duplicate(value);
        } else {
            self.push_raw(hash, HeaderField { name, value });
        }
        Ok(())
    }

    /// Replace a header's value, or insert it when absent. With
    /// `allow_duplicate` the new value is folded in as another
    /// occurrence instead of replacing. Used by the outbound
    /// adjustment path; `name` must be a canonical static name.
    pub fn set_or_replace(
        &mut self,
        arena: &BufArena,
        name: &'static [u8],
        value: ZStr,
        allow_duplicate: bool,
    ) {
        if let Some(id) = SpecialHdr::from_name(name) {
            match &mut self.special[id.index()] {
                slot @ None => {
                    *slot = Some(HeaderField {
                        name: ZStr::lit(name),
                        value,
                    });
                }
                Some(field) if allow_duplicate => field.value.add_duplicate(value),
                Some(field) => {
                    let old = std::mem::replace(&mut field.value, value);
                    old.release_spans(arena);
                }
            }
            return;
        }

        if let Some(id) = self.find_raw_slot(arena, name) {
            let Some(Some(raw)) = self.raw.get_mut(id.0 as usize) else {
                return;
            };
            if allow_duplicate {
                raw.field.value.add_duplicate(value);
            } else {
                let old = std::mem::replace(&mut raw.field.value, value);
                old.release_spans(arena);
            }
            return;
        }
        self.push_raw(hdr_hash(name), HeaderField {
            name: ZStr::lit(name),
            value,
        });
    }

    /// Drop a header entirely. Raw slots are tombstoned so other slot
    /// ids stay stable. Returns true when something was removed.
    pub fn remove(&mut self, arena: &BufArena, name: &[u8]) -> bool {
        if let Some(id) = SpecialHdr::from_name(name) {
            if let Some(field) = self.special[id.index()].take() {
                field.release_spans(arena);
                return true;
            }
            return false;
        }
        if let Some(id) = self.find_raw_slot(arena, name) {
            if let Some(slot) = self.raw.get_mut(id.0 as usize) {
                if let Some(raw) = slot.take() {
                    raw.field.release_spans(arena);
                    return true;
                }
            }
        }
        false
    }

    /// All live fields in emission order: specials first (enum order),
    /// then raw slots in arrival order.
    pub fn fields(&self) -> impl Iterator<Item = &HeaderField> {
        self.special
            .iter()
            .flatten()
            .chain(self.raw.iter().flatten().map(|r| &r.field))
    }

    /// Release every span the table holds. Called when the owning
    /// message is destroyed.
    pub fn release_spans(&self, arena: &BufArena) {
        for field in self.fields() {
            field.release_spans(arena);
        }
    }
}

fn names_equal(arena: &BufArena, a: &ZStr, b: &ZStr) -> bool {
    if a.len() != b.len() {
        return false;
    }
    // Compare two span trees case-insensitively without materializing.
    let mut left = a.segments(arena);
    let mut right = b.segments(arena);
    let (mut ls, mut rs): (&[u8], &[u8]) = (&[], &[]);
    loop {
        if ls.is_empty() {
            match left.next() {
                Some(seg) => ls = seg,
                None => return rs.is_empty() && right.all(<[u8]>::is_empty),
            }
            continue;
        }
        if rs.is_empty() {
            match right.next() {
                Some(seg) => rs = seg,
                None => return false,
            }
            continue;
        }
        let take = ls.len().min(rs.len());
        if !ls[..take].eq_ignore_ascii_case(&rs[..take]) {
            return false;
        }
        ls = &ls[take..];
        rs = &rs[take..];
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with(text: &[u8]) -> (BufArena, gale_core::BufId) {
        let mut arena = BufArena::new();
        let id = arena.insert(text.to_vec()).unwrap();
        (arena, id)
    }

    fn zstr(arena: &BufArena, id: gale_core::BufId, off: usize, len: usize) -> ZStr {
        ZStr::span(arena, id, off, len)
    }

    #[test]
    fn special_lookup_is_case_insensitive() {
        assert_eq!(SpecialHdr::from_name(b"host"), Some(SpecialHdr::Host));
        assert_eq!(
            SpecialHdr::from_name(b"CONTENT-LENGTH"),
            Some(SpecialHdr::ContentLength)
        );
        assert_eq!(SpecialHdr::from_name(b"X-Custom"), None);
    }

    #[test]
    fn commit_routes_specials_and_raws() {
        let (arena, id) = arena_with(b"Host: example.com\r\nDummy: 0\r\n");
        let mut tbl = HeaderTable::new();

        tbl.commit_parsed(
            &arena,
            Some(SpecialHdr::Host),
            zstr(&arena, id, 0, 4),
            zstr(&arena, id, 6, 11),
            hdr_hash(b"Host"),
        )
        .unwrap();
        tbl.commit_parsed(
            &arena,
            None,
            zstr(&arena, id, 19, 5),
            zstr(&arena, id, 26, 1),
            hdr_hash(b"Dummy"),
        )
        .unwrap();

        assert_eq!(tbl.len(), 2);
        assert!(
            tbl.get_special(SpecialHdr::Host)
                .unwrap()
                .equals_literal(&arena, b"example.com")
        );
        assert!(
            tbl.find_raw(&arena, b"dummy")
                .unwrap()
                .equals_literal(&arena, b"0")
        );
        assert!(tbl.find_raw(&arena, b"missing").is_none());
    }

    #[test]
    fn singleton_repeat_is_fatal() {
        let (arena, id) = arena_with(b"User-Agent: a\r\nUser-Agent: b\r\n");
        let mut tbl = HeaderTable::new();

        tbl.commit_parsed(
            &arena,
            Some(SpecialHdr::UserAgent),
            zstr(&arena, id, 0, 10),
            zstr(&arena, id, 12, 1),
            hdr_hash(b"User-Agent"),
        )
        .unwrap();
        let err = tbl
            .commit_parsed(
                &arena,
                Some(SpecialHdr::UserAgent),
                zstr(&arena, id, 15, 10),
                zstr(&arena, id, 27, 1),
                hdr_hash(b"User-Agent"),
            )
            .unwrap_err();
        assert_eq!(err, HdrError::DuplicateSingleton(SpecialHdr::UserAgent));
    }

    #[test]
    fn repeatable_special_folds_into_duplicates() {
        let (arena, id) = arena_with(b"Set-Cookie: a=1\r\nSet-Cookie: b=2\r\n");
        let mut tbl = HeaderTable::new();

        for (noff, voff) in [(0, 12), (17, 29)] {
            tbl.commit_parsed(
                &arena,
                Some(SpecialHdr::SetCookie),
                zstr(&arena, id, noff, 10),
                zstr(&arena, id, voff, 3),
                hdr_hash(b"Set-Cookie"),
            )
            .unwrap();
        }

        let value = tbl.get_special(SpecialHdr::SetCookie).unwrap();
        assert!(value.is_duplicate_group());
        let dups = value.duplicates();
        assert!(dups[0].equals_literal(&arena, b"a=1"));
        assert!(dups[1].equals_literal(&arena, b"b=2"));
        // Folded occurrences still count as one header.
        assert_eq!(tbl.len(), 1);
    }

    #[test]
    fn raw_repeat_folds_by_hash_and_name() {
        let (arena, id) = arena_with(b"Dummy: 1\r\ndummy: 2\r\n");
        let mut tbl = HeaderTable::new();

        tbl.commit_parsed(
            &arena,
            None,
            zstr(&arena, id, 0, 5),
            zstr(&arena, id, 7, 1),
            hdr_hash(b"Dummy"),
        )
        .unwrap();
        tbl.commit_parsed(
            &arena,
            None,
            zstr(&arena, id, 10, 5),
            zstr(&arena, id, 17, 1),
            hdr_hash(b"dummy"),
        )
        .unwrap();

        let value = tbl.find_raw(&arena, b"DUMMY").unwrap();
        assert!(value.is_duplicate_group());
        assert_eq!(value.duplicates().len(), 2);
    }

    #[test]
    fn set_or_replace_and_remove() {
        let (arena, id) = arena_with(b"Connection: keep-alive\r\n");
        let mut tbl = HeaderTable::new();
        tbl.commit_parsed(
            &arena,
            Some(SpecialHdr::Connection),
            zstr(&arena, id, 0, 10),
            zstr(&arena, id, 12, 10),
            hdr_hash(b"Connection"),
        )
        .unwrap();

        tbl.set_or_replace(&arena, b"Connection", ZStr::lit(b"close"), false);
        assert!(
            tbl.get_special(SpecialHdr::Connection)
                .unwrap()
                .equals_literal(&arena, b"close")
        );

        tbl.set_or_replace(&arena, b"Via", ZStr::lit(b"1.1 gale"), false);
        assert!(
            tbl.find_raw(&arena, b"via")
                .unwrap()
                .equals_literal(&arena, b"1.1 gale")
        );

        assert!(tbl.remove(&arena, b"Via"));
        assert!(!tbl.remove(&arena, b"Via"));
        assert!(tbl.find_raw(&arena, b"via").is_none());
    }

    #[test]
    fn raw_slot_ids_survive_growth_and_other_removals() {
        let (arena, id) = arena_with(b"A: 1\r\nB: 2\r\nC: 3\r\n");
        let mut tbl = HeaderTable::new();
        for (noff, voff) in [(0, 3), (6, 9), (12, 15)] {
            let name = zstr(&arena, id, noff, 1);
            let value = zstr(&arena, id, voff, 1);
            let text = arena.bytes(id)[noff..noff + 1].to_vec();
            tbl.commit_parsed(&arena, None, name, value, hdr_hash(&text))
                .unwrap();
        }

        let b_slot = tbl.find_raw_slot(&arena, b"B").unwrap();
        assert!(tbl.remove(&arena, b"A"));
        tbl.set_or_replace(&arena, b"D", ZStr::lit(b"4"), false);

        let field = tbl.raw_field(b_slot).unwrap();
        assert!(field.value.equals_literal(&arena, b"2"));
    }
}
