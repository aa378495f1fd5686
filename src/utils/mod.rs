mod utf16;
pub(crate) mod windows;

pub(crate) use self::utf16::{decode_utf16le_bytes_z, encode_utf16le_bytes_z};
#[cfg(windows)]
pub(crate) use self::utf16::{decode_utf16_units_z, encode_utf16_units_z};
