//! Log-entry wire layout.
//!
//! A committed chunk's payload is one entry: a fixed 32-byte head, the
//! format string (padded to 4), then the self-describing argument stream
//! (see [`encoder`](crate::encoder)).
//!
//! Head layout (little-endian):
//!
//! | off | field        |
//! |-----|--------------|
//! | 0   | category u32 |
//! | 4   | level u8     |
//! | 5   | fmt_kind u8  |
//! | 6   | pad u16      |
//! | 8   | thread_id u64|
//! | 16  | timestamp_ms u64 |
//! | 24  | fmt_len u32 (bytes) |
//! | 28  | pad u32      |

/// Severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Verbose = 0,
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Verbose),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Warning),
            4 => Some(Self::Error),
            5 => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// Encoding of the format string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FmtKind {
    Utf8 = 0,
    Utf16 = 1,
}

impl FmtKind {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Utf8),
            1 => Some(Self::Utf16),
            _ => None,
        }
    }
}

/// Size of the fixed entry head.
pub const ENTRY_HEAD_SIZE: usize = 32;

/// Parsed fixed head of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHead {
    pub category: u32,
    pub level: Level,
    pub fmt_kind: FmtKind,
    pub thread_id: u64,
    pub timestamp_ms: u64,
    pub fmt_len: u32,
}

#[inline]
pub(crate) fn round_up4(n: usize) -> usize {
    (n + 3) & !3
}

/// Total entry size for a format string of `fmt_len` bytes and an argument
/// stream of `args_len` bytes.
pub fn entry_size(fmt_len: usize, args_len: usize) -> usize {
    ENTRY_HEAD_SIZE + round_up4(fmt_len) + args_len
}

/// Writes the fixed head into `buf`. `buf` must hold at least
/// [`ENTRY_HEAD_SIZE`] bytes.
pub fn write_head(buf: &mut [u8], head: &EntryHead) {
    buf[0..4].copy_from_slice(&head.category.to_le_bytes());
    buf[4] = head.level as u8;
    buf[5] = head.fmt_kind as u8;
    buf[6..8].fill(0);
    buf[8..16].copy_from_slice(&head.thread_id.to_le_bytes());
    buf[16..24].copy_from_slice(&head.timestamp_ms.to_le_bytes());
    buf[24..28].copy_from_slice(&head.fmt_len.to_le_bytes());
    buf[28..32].fill(0);
}

/// Parses the fixed head; `None` on truncation or invalid tags.
pub fn parse_head(buf: &[u8]) -> Option<EntryHead> {
    if buf.len() < ENTRY_HEAD_SIZE {
        return None;
    }
    let category = u32::from_le_bytes(buf[0..4].try_into().ok()?);
    let level = Level::from_raw(buf[4])?;
    let fmt_kind = FmtKind::from_raw(buf[5])?;
    let thread_id = u64::from_le_bytes(buf[8..16].try_into().ok()?);
    let timestamp_ms = u64::from_le_bytes(buf[16..24].try_into().ok()?);
    let fmt_len = u32::from_le_bytes(buf[24..28].try_into().ok()?);
    if ENTRY_HEAD_SIZE + round_up4(fmt_len as usize) > buf.len() {
        return None;
    }
    Some(EntryHead {
        category,
        level,
        fmt_kind,
        thread_id,
        timestamp_ms,
        fmt_len,
    })
}

/// The format-string bytes of a parsed entry.
pub fn format_bytes<'a>(buf: &'a [u8], head: &EntryHead) -> &'a [u8] {
    &buf[ENTRY_HEAD_SIZE..ENTRY_HEAD_SIZE + head.fmt_len as usize]
}

/// The argument-stream bytes of a parsed entry.
pub fn arg_bytes<'a>(buf: &'a [u8], head: &EntryHead) -> &'a [u8] {
    &buf[ENTRY_HEAD_SIZE + round_up4(head.fmt_len as usize)..]
}
