//! [`EventLogApi`] over `wevtapi.dll`.

use super::{
    EventLogApi, NativeResult, QueryFlags, RawHandle, RenderContextKind, RenderFlags, Rendered,
    SeekFlags, StartPosition, Status, Variant,
};
use crate::err::{ERROR_INSUFFICIENT_BUFFER, ERROR_INVALID_PARAMETER, describe_status};
use crate::utils::windows::SidRef;
use crate::utils::{decode_utf16_units_z, encode_utf16_units_z};

use log::trace;
use std::ffi::{CStr, c_char, c_void};
use std::ptr;

type Handle = isize;

const WAIT_OBJECT_0: u32 = 0;
const WAIT_TIMEOUT: u32 = 0x102;

const FORMAT_MESSAGE_IGNORE_INSERTS: u32 = 0x200;
const FORMAT_MESSAGE_FROM_SYSTEM: u32 = 0x1000;

const EVT_FORMAT_MESSAGE_EVENT: u32 = 1;
const EVT_VARIANT_TYPE_MASK: u32 = 0x7f;
const EVT_VARIANT_TYPE_ARRAY: u32 = 0x80;

/// `EVT_VARIANT`: an 8-byte value or pointer, a count and a type tag.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct EvtVariant {
    value: u64,
    count: u32,
    kind: u32,
}

const EVT_VARIANT_SIZE: usize = std::mem::size_of::<EvtVariant>();

#[link(name = "wevtapi")]
unsafe extern "system" {
    fn EvtOpenChannelEnum(session: Handle, flags: u32) -> Handle;
    fn EvtNextChannelPath(
        channel_enum: Handle,
        buffer_size: u32,
        buffer: *mut u16,
        buffer_used: *mut u32,
    ) -> i32;
    fn EvtQuery(session: Handle, path: *const u16, query: *const u16, flags: u32) -> Handle;
    fn EvtSubscribe(
        session: Handle,
        signal_event: Handle,
        channel_path: *const u16,
        query: *const u16,
        bookmark: Handle,
        context: *mut c_void,
        callback: *mut c_void,
        flags: u32,
    ) -> Handle;
    fn EvtNext(
        result_set: Handle,
        events_size: u32,
        events: *mut Handle,
        timeout: u32,
        flags: u32,
        returned: *mut u32,
    ) -> i32;
    fn EvtSeek(result_set: Handle, position: i64, bookmark: Handle, timeout: u32, flags: u32) -> i32;
    fn EvtCreateRenderContext(value_paths_count: u32, value_paths: *const *const u16, flags: u32)
    -> Handle;
    fn EvtRender(
        context: Handle,
        fragment: Handle,
        flags: u32,
        buffer_size: u32,
        buffer: *mut c_void,
        buffer_used: *mut u32,
        property_count: *mut u32,
    ) -> i32;
    fn EvtCreateBookmark(bookmark_xml: *const u16) -> Handle;
    fn EvtUpdateBookmark(bookmark: Handle, event: Handle) -> i32;
    fn EvtOpenPublisherMetadata(
        session: Handle,
        publisher_id: *const u16,
        log_file_path: *const u16,
        locale: u32,
        flags: u32,
    ) -> Handle;
    fn EvtFormatMessage(
        publisher_metadata: Handle,
        event: Handle,
        message_id: u32,
        value_count: u32,
        values: *const EvtVariant,
        flags: u32,
        buffer_size: u32,
        buffer: *mut u16,
        buffer_used: *mut u32,
    ) -> i32;
    fn EvtClose(object: Handle) -> i32;
}

#[link(name = "kernel32")]
unsafe extern "system" {
    fn CreateEventW(
        attributes: *mut c_void,
        manual_reset: i32,
        initial_state: i32,
        name: *const u16,
    ) -> Handle;
    fn WaitForSingleObject(handle: Handle, milliseconds: u32) -> u32;
    fn CloseHandle(handle: Handle) -> i32;
    fn GetLastError() -> u32;
    fn FormatMessageW(
        flags: u32,
        source: *const c_void,
        message_id: u32,
        language_id: u32,
        buffer: *mut u16,
        size: u32,
        arguments: *mut c_void,
    ) -> u32;
}

fn last_status(needed: usize) -> Status {
    // Safety: reads thread-local state only.
    Status::from_code(unsafe { GetLastError() }, needed)
}

fn check_handle(handle: Handle) -> NativeResult<RawHandle> {
    if handle == 0 {
        Err(last_status(0))
    } else {
        Ok(RawHandle(handle as usize))
    }
}

fn check_bool(ok: i32) -> NativeResult<()> {
    if ok == 0 { Err(last_status(0)) } else { Ok(()) }
}

fn to_wide(text: &str) -> NativeResult<Vec<u16>> {
    if text.contains('\0') {
        return Err(Status::Failed(ERROR_INVALID_PARAMETER));
    }
    Ok(encode_utf16_units_z(text))
}

fn raw(handle: Option<RawHandle>) -> Handle {
    handle.map_or(0, |h| h.0 as Handle)
}

/// Reads a NUL-terminated wide string the service placed in memory.
///
/// # Safety
/// `ptr` must be null or point at a NUL-terminated UTF-16 string.
unsafe fn read_wide_z(ptr: *const u16) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0usize;
    // Safety: guaranteed NUL-terminated by the caller.
    unsafe {
        while *ptr.add(len) != 0 {
            len += 1;
        }
        Some(decode_utf16_units_z(std::slice::from_raw_parts(ptr, len)))
    }
}

/// # Safety
/// `ptr` must be null or point at `len` readable bytes.
unsafe fn read_bytes(ptr: *const u8, len: usize) -> Option<Vec<u8>> {
    if ptr.is_null() {
        return None;
    }
    // Safety: guaranteed by the caller.
    Some(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
}

/// Decodes one `EVT_VARIANT`. Pointer-carrying values point into the render buffer.
///
/// # Safety
/// Pointers in `variant` must be valid, which holds while the buffer it was read from is alive.
unsafe fn decode_variant(variant: EvtVariant) -> Variant {
    if variant.kind & EVT_VARIANT_TYPE_ARRAY != 0 {
        return Variant::Unsupported(variant.kind);
    }
    let value = variant.value;
    let ptr = value as usize;

    // Safety: forwarded to the caller.
    unsafe {
        match variant.kind & EVT_VARIANT_TYPE_MASK {
            0 => Variant::Null,
            1 => read_wide_z(ptr as *const u16).map_or(Variant::Null, Variant::String),
            2 => {
                if ptr == 0 {
                    Variant::Null
                } else {
                    let text = CStr::from_ptr(ptr as *const c_char);
                    Variant::AnsiString(text.to_string_lossy().into_owned())
                }
            }
            3 => Variant::SByte(value as i8),
            4 => Variant::Byte(value as u8),
            5 => Variant::Int16(value as i16),
            6 => Variant::UInt16(value as u16),
            7 => Variant::Int32(value as i32),
            8 => Variant::UInt32(value as u32),
            9 => Variant::Int64(value as i64),
            10 => Variant::UInt64(value),
            11 => Variant::Single(f32::from_bits(value as u32)),
            12 => Variant::Double(f64::from_bits(value)),
            13 => Variant::Boolean(value as u32 != 0),
            14 => read_bytes(ptr as *const u8, variant.count as usize)
                .map_or(Variant::Null, Variant::Binary),
            15 => match read_bytes(ptr as *const u8, 16) {
                Some(bytes) => {
                    let mut guid = [0u8; 16];
                    guid.copy_from_slice(&bytes);
                    Variant::Guid(guid)
                }
                None => Variant::Null,
            },
            16 => Variant::SizeT(value),
            17 => Variant::FileTime(value),
            19 => {
                let len = read_bytes(ptr as *const u8, 2)
                    .and_then(|header| SidRef::encoded_len(&header));
                match len {
                    Some(len) => {
                        read_bytes(ptr as *const u8, len).map_or(Variant::Null, Variant::Sid)
                    }
                    None => Variant::Null,
                }
            }
            20 => Variant::HexInt32(value as u32),
            21 => Variant::HexInt64(value),
            other => Variant::Unsupported(other),
        }
    }
}

/// The local event-log service.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsEventLog;

impl WindowsEventLog {
    pub fn new() -> Self {
        WindowsEventLog
    }
}

impl EventLogApi for WindowsEventLog {
    fn open_channel_enum(&self) -> NativeResult<RawHandle> {
        // Safety: plain FFI call without pointers.
        check_handle(unsafe { EvtOpenChannelEnum(0, 0) })
    }

    fn next_channel_path(&self, channel_enum: RawHandle, buffer: &mut [u8]) -> NativeResult<usize> {
        let chars = (buffer.len() / 2) as u32;
        let ptr = if chars == 0 {
            ptr::null_mut()
        } else {
            buffer.as_mut_ptr().cast::<u16>()
        };
        let mut used = 0u32;

        // Safety: the buffer holds `chars` wide characters and is 2-byte aligned (render buffers
        // are 8-byte aligned).
        let ok = unsafe { EvtNextChannelPath(channel_enum.0 as Handle, chars, ptr, &mut used) };
        if ok == 0 {
            return Err(last_status(used as usize * 2));
        }
        Ok(used as usize * 2)
    }

    fn query(&self, path: &str, filter: &str, flags: QueryFlags) -> NativeResult<RawHandle> {
        let path = to_wide(path)?;
        let filter = to_wide(filter)?;
        // Safety: both strings are NUL-terminated and outlive the call.
        check_handle(unsafe { EvtQuery(0, path.as_ptr(), filter.as_ptr(), flags.bits()) })
    }

    fn create_signal(&self) -> NativeResult<RawHandle> {
        // Auto-reset, initially unset, unnamed.
        // Safety: null attributes and name are permitted.
        check_handle(unsafe { CreateEventW(ptr::null_mut(), 0, 0, ptr::null()) })
    }

    fn wait_signal(&self, signal: RawHandle, timeout: u32) -> NativeResult<bool> {
        // Safety: plain FFI call without pointers.
        match unsafe { WaitForSingleObject(signal.0 as Handle, timeout) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(last_status(0)),
        }
    }

    fn close_signal(&self, signal: RawHandle) -> NativeResult<()> {
        // Safety: plain FFI call without pointers.
        check_bool(unsafe { CloseHandle(signal.0 as Handle) })
    }

    fn subscribe(
        &self,
        signal: RawHandle,
        path: &str,
        filter: &str,
        bookmark: Option<RawHandle>,
        start: StartPosition,
    ) -> NativeResult<RawHandle> {
        let path = to_wide(path)?;
        let filter = to_wide(filter)?;
        // Safety: strings are NUL-terminated, no callback is registered (pull mode).
        check_handle(unsafe {
            EvtSubscribe(
                0,
                signal.0 as Handle,
                path.as_ptr(),
                filter.as_ptr(),
                raw(bookmark),
                ptr::null_mut(),
                ptr::null_mut(),
                start.flags(),
            )
        })
    }

    fn next(&self, cursor: RawHandle, timeout: u32) -> NativeResult<RawHandle> {
        let mut event: Handle = 0;
        let mut returned = 0u32;
        // Safety: room for exactly one handle is provided.
        let ok = unsafe { EvtNext(cursor.0 as Handle, 1, &mut event, timeout, 0, &mut returned) };
        check_bool(ok)?;
        if returned == 0 {
            return Err(Status::NoMoreItems);
        }
        Ok(RawHandle(event as usize))
    }

    fn seek(
        &self,
        query: RawHandle,
        offset: i64,
        bookmark: Option<RawHandle>,
        timeout: u32,
        flags: SeekFlags,
    ) -> NativeResult<()> {
        // Safety: plain FFI call without pointers.
        check_bool(unsafe {
            EvtSeek(
                query.0 as Handle,
                offset,
                raw(bookmark),
                timeout,
                flags.bits(),
            )
        })
    }

    fn create_render_context(&self, kind: RenderContextKind) -> NativeResult<RawHandle> {
        // Safety: no value paths are passed.
        check_handle(unsafe { EvtCreateRenderContext(0, ptr::null(), kind as u32) })
    }

    fn render(
        &self,
        context: Option<RawHandle>,
        fragment: RawHandle,
        flags: RenderFlags,
        buffer: &mut [u8],
    ) -> NativeResult<Rendered> {
        let size = u32::try_from(buffer.len()).map_err(|_| Status::Failed(ERROR_INVALID_PARAMETER))?;
        let ptr = if size == 0 {
            ptr::null_mut()
        } else {
            buffer.as_mut_ptr().cast::<c_void>()
        };
        let mut used = 0u32;
        let mut property_count = 0u32;

        // Safety: `ptr` is null or valid for `size` bytes.
        let ok = unsafe {
            EvtRender(
                raw(context),
                fragment.0 as Handle,
                flags as u32,
                size,
                ptr,
                &mut used,
                &mut property_count,
            )
        };
        if ok == 0 {
            return Err(last_status(used as usize));
        }
        trace!("EvtRender used {} bytes, {} properties", used, property_count);
        Ok(Rendered {
            used: used as usize,
            property_count: property_count as usize,
        })
    }

    fn read_values(&self, buffer: &[u8], count: usize) -> NativeResult<Vec<Variant>> {
        if count
            .checked_mul(EVT_VARIANT_SIZE)
            .is_none_or(|needed| needed > buffer.len())
        {
            return Err(Status::Failed(ERROR_INSUFFICIENT_BUFFER));
        }

        let base = buffer.as_ptr();
        let values = (0..count)
            .map(|i| {
                // Safety: bounds checked above, pointers inside refer into `buffer`.
                unsafe {
                    let variant =
                        ptr::read_unaligned(base.add(i * EVT_VARIANT_SIZE).cast::<EvtVariant>());
                    decode_variant(variant)
                }
            })
            .collect();
        Ok(values)
    }

    fn create_bookmark(&self, markup: Option<&str>) -> NativeResult<RawHandle> {
        let markup = markup.map(to_wide).transpose()?;
        let ptr = markup.as_ref().map_or(ptr::null(), |m| m.as_ptr());
        // Safety: `ptr` is null or a NUL-terminated string outliving the call.
        check_handle(unsafe { EvtCreateBookmark(ptr) })
    }

    fn update_bookmark(&self, bookmark: RawHandle, event: RawHandle) -> NativeResult<()> {
        // Safety: plain FFI call without pointers.
        check_bool(unsafe { EvtUpdateBookmark(bookmark.0 as Handle, event.0 as Handle) })
    }

    fn open_publisher_metadata(&self, provider: &str) -> NativeResult<RawHandle> {
        let provider = to_wide(provider)?;
        // Safety: `provider` is NUL-terminated, no log file path is passed.
        check_handle(unsafe { EvtOpenPublisherMetadata(0, provider.as_ptr(), ptr::null(), 0, 0) })
    }

    fn format_event_message(
        &self,
        metadata: RawHandle,
        event: RawHandle,
        buffer: &mut [u8],
    ) -> NativeResult<usize> {
        let chars = (buffer.len() / 2) as u32;
        let ptr = if chars == 0 {
            ptr::null_mut()
        } else {
            buffer.as_mut_ptr().cast::<u16>()
        };
        let mut used = 0u32;

        // Safety: the buffer holds `chars` wide characters.
        let ok = unsafe {
            EvtFormatMessage(
                metadata.0 as Handle,
                event.0 as Handle,
                0,
                0,
                ptr::null(),
                EVT_FORMAT_MESSAGE_EVENT,
                chars,
                ptr,
                &mut used,
            )
        };
        if ok == 0 {
            return Err(last_status(used as usize * 2));
        }
        Ok(used as usize * 2)
    }

    fn close(&self, handle: RawHandle) -> NativeResult<()> {
        // Safety: plain FFI call without pointers.
        check_bool(unsafe { EvtClose(handle.0 as Handle) })
    }

    fn format_message(&self, code: u32) -> String {
        let mut buffer = [0u16; 512];
        // Safety: the buffer size is passed in characters.
        let len = unsafe {
            FormatMessageW(
                FORMAT_MESSAGE_FROM_SYSTEM | FORMAT_MESSAGE_IGNORE_INSERTS,
                ptr::null(),
                code,
                0,
                buffer.as_mut_ptr(),
                buffer.len() as u32,
                ptr::null_mut(),
            )
        } as usize;

        if len == 0 {
            return describe_status(code);
        }
        decode_utf16_units_z(&buffer[..len.min(buffer.len())])
            .trim_end()
            .to_string()
    }
}
