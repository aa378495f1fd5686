//! The narrow interface to the host event-log service.
//!
//! Everything above this module talks to the service exclusively through [`EventLogApi`].
//! Two implementations are provided:
//! - [`WindowsEventLog`] (Windows only), backed by `wevtapi.dll`.
//! - [`MemoryEventLog`], an in-process store with the same status-code semantics, used for
//!   offline snapshots and for tests.
//!
//! Calls that produce variable-length output take a caller-owned byte buffer and report
//! [`Status::InsufficientBuffer`] with the required size (in bytes) when it is too small.

mod memory;
#[cfg(windows)]
mod windows;

pub use self::memory::{MemoryEventLog, MemoryRecord};
#[cfg(windows)]
pub use self::windows::WindowsEventLog;

use crate::err::{ERROR_INSUFFICIENT_BUFFER, ERROR_NO_MORE_ITEMS, EvtError, Result};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timeout value that blocks forever.
pub const INFINITE: u32 = u32::MAX;

/// An opaque native handle value. Ownership is tracked by [`crate::EvtHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub usize);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Failure status of a native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The cursor or enumeration is exhausted.
    NoMoreItems,
    /// The supplied buffer is too small, `needed` is the required size in bytes.
    InsufficientBuffer { needed: usize },
    /// Any other native status code.
    Failed(u32),
}

impl Status {
    /// Classifies a raw status code.
    pub fn from_code(code: u32, needed: usize) -> Status {
        match code {
            ERROR_NO_MORE_ITEMS => Status::NoMoreItems,
            ERROR_INSUFFICIENT_BUFFER => Status::InsufficientBuffer { needed },
            other => Status::Failed(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Status::NoMoreItems => ERROR_NO_MORE_ITEMS,
            Status::InsufficientBuffer { .. } => ERROR_INSUFFICIENT_BUFFER,
            Status::Failed(code) => *code,
        }
    }
}

pub type NativeResult<T> = std::result::Result<T, Status>;

bitflags! {
    /// `EVT_QUERY_FLAGS`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueryFlags: u32 {
        const CHANNEL_PATH = 0x1;
        const FILE_PATH = 0x2;
        const FORWARD_DIRECTION = 0x100;
        const REVERSE_DIRECTION = 0x200;
        const TOLERATE_QUERY_ERRORS = 0x1000;
    }
}

bitflags! {
    /// `EVT_SEEK_FLAGS`. The origin values are not independent bits, use [`SeekFlags::origin`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SeekFlags: u32 {
        const RELATIVE_TO_FIRST = 1;
        const RELATIVE_TO_LAST = 2;
        const RELATIVE_TO_CURRENT = 3;
        const RELATIVE_TO_BOOKMARK = 4;
        const ORIGIN_MASK = 7;
        const STRICT = 0x10000;
    }
}

impl SeekFlags {
    /// The origin part of the flags (`1..=4`, or `0` when unset).
    pub fn origin(&self) -> u32 {
        self.bits() & SeekFlags::ORIGIN_MASK.bits()
    }

    pub fn is_strict(&self) -> bool {
        self.bits() & SeekFlags::STRICT.bits() != 0
    }

    /// Parses an origin name (`first`, `last`, `current`, `bookmark` or `originmask`),
    /// optionally combined with `strict` through `|`, e.g. `last|strict`.
    ///
    /// Exactly one origin must be named, origins are values rather than bits.
    pub fn from_origin_name(name: &str) -> Result<SeekFlags> {
        let mut origin: Option<SeekFlags> = None;
        let mut strict = false;

        for part in name.split('|') {
            let part = part.trim();
            let parsed = match part.to_ascii_lowercase().as_str() {
                "first" => SeekFlags::RELATIVE_TO_FIRST,
                "last" => SeekFlags::RELATIVE_TO_LAST,
                "current" => SeekFlags::RELATIVE_TO_CURRENT,
                "bookmark" => SeekFlags::RELATIVE_TO_BOOKMARK,
                "originmask" => SeekFlags::ORIGIN_MASK,
                "strict" => {
                    if strict {
                        return Err(EvtError::invalid_argument(format!(
                            "seek origin `{}` repeats `strict`",
                            name
                        )));
                    }
                    strict = true;
                    continue;
                }
                _ => {
                    return Err(EvtError::invalid_argument(format!(
                        "unknown seek origin `{}`",
                        part
                    )));
                }
            };
            if origin.replace(parsed).is_some() {
                return Err(EvtError::invalid_argument(format!(
                    "seek origin `{}` names more than one origin",
                    name
                )));
            }
        }

        let mut flags = origin.ok_or_else(|| {
            EvtError::invalid_argument(format!("seek origin `{}` names no origin", name))
        })?;
        if strict {
            flags |= SeekFlags::STRICT;
        }
        Ok(flags)
    }
}

/// `EVT_SUBSCRIBE_FLAGS` start positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartPosition {
    FutureEvents,
    OldestRecord,
    AfterBookmark,
}

impl StartPosition {
    /// Resolves the start position with a fixed precedence:
    /// a bookmark wins over tailing, tailing wins over replaying from the oldest record.
    pub fn resolve(has_bookmark: bool, tailing: bool) -> StartPosition {
        if has_bookmark {
            StartPosition::AfterBookmark
        } else if tailing {
            StartPosition::FutureEvents
        } else {
            StartPosition::OldestRecord
        }
    }

    pub fn flags(&self) -> u32 {
        match self {
            StartPosition::FutureEvents => 1,
            StartPosition::OldestRecord => 2,
            StartPosition::AfterBookmark => 3,
        }
    }
}

/// `EVT_RENDER_FLAGS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderFlags {
    EventValues = 0,
    EventXml = 1,
    Bookmark = 2,
}

/// `EVT_RENDER_CONTEXT_FLAGS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderContextKind {
    Values = 0,
    System = 1,
    User = 2,
}

/// Output of a successful render call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendered {
    /// Bytes written into the buffer.
    pub used: usize,
    /// Number of values, for [`RenderFlags::EventValues`].
    pub property_count: usize,
}

/// Order of the values produced by a [`RenderContextKind::System`] context
/// (`EVT_SYSTEM_PROPERTY_ID`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemProperty {
    ProviderName = 0,
    ProviderGuid,
    EventId,
    Qualifiers,
    Level,
    Task,
    Opcode,
    Keywords,
    TimeCreated,
    EventRecordId,
    ActivityId,
    RelatedActivityId,
    ProcessId,
    ThreadId,
    Channel,
    Computer,
    UserId,
    Version,
}

pub const SYSTEM_PROPERTY_COUNT: usize = 18;

/// A native typed value (`EVT_VARIANT`), decoded out of a render buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Variant {
    Null,
    String(String),
    AnsiString(String),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Single(f32),
    Double(f64),
    Boolean(bool),
    Binary(Vec<u8>),
    /// Raw GUID bytes in their in-memory (mixed-endian) layout.
    Guid([u8; 16]),
    SizeT(u64),
    /// 100-nanosecond ticks since 1601-01-01 UTC.
    FileTime(u64),
    /// Binary SID.
    Sid(Vec<u8>),
    HexInt32(u32),
    HexInt64(u64),
    /// A native type this crate does not decode, carries the `EVT_VARIANT_TYPE` tag.
    Unsupported(u32),
}

impl Variant {
    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    /// The `EVT_VARIANT_TYPE` tag of this value.
    pub fn type_tag(&self) -> u32 {
        match self {
            Variant::Null => 0,
            Variant::String(_) => 1,
            Variant::AnsiString(_) => 2,
            Variant::SByte(_) => 3,
            Variant::Byte(_) => 4,
            Variant::Int16(_) => 5,
            Variant::UInt16(_) => 6,
            Variant::Int32(_) => 7,
            Variant::UInt32(_) => 8,
            Variant::Int64(_) => 9,
            Variant::UInt64(_) => 10,
            Variant::Single(_) => 11,
            Variant::Double(_) => 12,
            Variant::Boolean(_) => 13,
            Variant::Binary(_) => 14,
            Variant::Guid(_) => 15,
            Variant::SizeT(_) => 16,
            Variant::FileTime(_) => 17,
            Variant::Sid(_) => 19,
            Variant::HexInt32(_) => 20,
            Variant::HexInt64(_) => 21,
            Variant::Unsupported(tag) => *tag,
        }
    }
}

/// The primitives of the host event-log service.
///
/// Implementations must be usable from any thread, but a single handle is only ever driven by
/// one caller at a time.
pub trait EventLogApi: Send + Sync {
    /// `EvtOpenChannelEnum`
    fn open_channel_enum(&self) -> NativeResult<RawHandle>;

    /// `EvtNextChannelPath`. Writes a NUL-terminated UTF-16LE name, returns the bytes used.
    fn next_channel_path(&self, channel_enum: RawHandle, buffer: &mut [u8]) -> NativeResult<usize>;

    /// `EvtQuery`
    fn query(&self, path: &str, filter: &str, flags: QueryFlags) -> NativeResult<RawHandle>;

    /// Creates an auto-reset signal the service sets when a subscription has new records.
    fn create_signal(&self) -> NativeResult<RawHandle>;

    /// Waits for a signal, returns `false` if `timeout` (milliseconds) elapsed first.
    fn wait_signal(&self, signal: RawHandle, timeout: u32) -> NativeResult<bool>;

    fn close_signal(&self, signal: RawHandle) -> NativeResult<()>;

    /// `EvtSubscribe` in pull mode, bound to `signal`.
    fn subscribe(
        &self,
        signal: RawHandle,
        path: &str,
        filter: &str,
        bookmark: Option<RawHandle>,
        start: StartPosition,
    ) -> NativeResult<RawHandle>;

    /// `EvtNext` for exactly one record.
    fn next(&self, cursor: RawHandle, timeout: u32) -> NativeResult<RawHandle>;

    /// `EvtSeek`
    fn seek(
        &self,
        query: RawHandle,
        offset: i64,
        bookmark: Option<RawHandle>,
        timeout: u32,
        flags: SeekFlags,
    ) -> NativeResult<()>;

    /// `EvtCreateRenderContext` for the system or user properties.
    fn create_render_context(&self, kind: RenderContextKind) -> NativeResult<RawHandle>;

    /// `EvtRender`
    fn render(
        &self,
        context: Option<RawHandle>,
        fragment: RawHandle,
        flags: RenderFlags,
        buffer: &mut [u8],
    ) -> NativeResult<Rendered>;

    /// Decodes `count` values out of a buffer filled by [`EventLogApi::render`] with
    /// [`RenderFlags::EventValues`].
    fn read_values(&self, buffer: &[u8], count: usize) -> NativeResult<Vec<Variant>>;

    /// `EvtCreateBookmark`
    fn create_bookmark(&self, markup: Option<&str>) -> NativeResult<RawHandle>;

    /// `EvtUpdateBookmark`
    fn update_bookmark(&self, bookmark: RawHandle, event: RawHandle) -> NativeResult<()>;

    /// `EvtOpenPublisherMetadata`
    fn open_publisher_metadata(&self, provider: &str) -> NativeResult<RawHandle>;

    /// `EvtFormatMessage` for the event message. Writes NUL-terminated UTF-16LE text,
    /// returns the bytes used.
    fn format_event_message(
        &self,
        metadata: RawHandle,
        event: RawHandle,
        buffer: &mut [u8],
    ) -> NativeResult<usize>;

    /// `EvtClose`
    fn close(&self, handle: RawHandle) -> NativeResult<()>;

    /// Human-readable system message for a status code.
    fn format_message(&self, code: u32) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_position_precedence() {
        assert_eq!(StartPosition::resolve(true, true), StartPosition::AfterBookmark);
        assert_eq!(StartPosition::resolve(true, false), StartPosition::AfterBookmark);
        assert_eq!(StartPosition::resolve(false, true), StartPosition::FutureEvents);
        assert_eq!(StartPosition::resolve(false, false), StartPosition::OldestRecord);
    }

    #[test]
    fn test_seek_origin_is_masked() {
        let flags = SeekFlags::RELATIVE_TO_CURRENT | SeekFlags::STRICT;
        assert_eq!(flags.origin(), 3);
        assert!(flags.is_strict());
        assert!(!SeekFlags::RELATIVE_TO_LAST.is_strict());
    }

    #[test]
    fn test_seek_origin_names() {
        assert_eq!(
            SeekFlags::from_origin_name("first").unwrap(),
            SeekFlags::RELATIVE_TO_FIRST
        );
        let flags = SeekFlags::from_origin_name("last | strict").unwrap();
        assert_eq!(flags.origin(), 2);
        assert!(flags.is_strict());
        assert!(matches!(
            SeekFlags::from_origin_name("sideways"),
            Err(EvtError::InvalidArgument { .. })
        ));
        assert!(SeekFlags::from_origin_name("").is_err());
    }

    #[test]
    fn test_seek_origin_names_reject_combined_origins() {
        for name in ["first|last", "current | bookmark", "strict", "last|strict|strict"] {
            assert!(
                matches!(
                    SeekFlags::from_origin_name(name),
                    Err(EvtError::InvalidArgument { .. })
                ),
                "{} was accepted",
                name
            );
        }
        let flags = SeekFlags::from_origin_name("strict|First").unwrap();
        assert_eq!(flags, SeekFlags::RELATIVE_TO_FIRST | SeekFlags::STRICT);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(Status::from_code(259, 0), Status::NoMoreItems);
        assert_eq!(
            Status::from_code(122, 64),
            Status::InsufficientBuffer { needed: 64 }
        );
        assert_eq!(Status::from_code(5, 0), Status::Failed(5));
        assert_eq!(Status::Failed(5).code(), 5);
    }
}
