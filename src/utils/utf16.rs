/// Decode a UTF-16LE byte slice until the first NUL (0x0000), if present.
///
/// Unpaired surrogates are replaced with U+FFFD, a trailing odd byte is ignored.
pub(crate) fn decode_utf16le_bytes_z(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .collect();

    decode_utf16_units_z(&units)
}

/// Decode UTF-16 code units until the first NUL (0x0000), if present.
pub(crate) fn decode_utf16_units_z(units: &[u16]) -> String {
    let end = units.iter().position(|&c| c == 0).unwrap_or(units.len());
    let slice = &units[..end];

    // Channel and provider names are almost always ASCII.
    if slice.iter().all(|&c| c <= 0x7F) {
        return slice.iter().map(|&c| char::from(c as u8)).collect();
    }

    String::from_utf16_lossy(slice)
}

/// Encode a string as NUL-terminated UTF-16 code units.
pub(crate) fn encode_utf16_units_z(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Encode a string as NUL-terminated UTF-16LE bytes.
pub(crate) fn encode_utf16le_bytes_z(s: &str) -> Vec<u8> {
    encode_utf16_units_z(s)
        .into_iter()
        .flat_map(u16::to_le_bytes)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_stops_at_nul() {
        let mut bytes = encode_utf16le_bytes_z("Application");
        bytes.extend_from_slice(&[0x41, 0x00, 0x42, 0x00]);
        assert_eq!(decode_utf16le_bytes_z(&bytes), "Application");
    }

    #[test]
    fn test_decode_non_ascii() {
        let bytes = encode_utf16le_bytes_z("Microsoft-Windows-Ünïcode/Operational");
        assert_eq!(
            decode_utf16le_bytes_z(&bytes),
            "Microsoft-Windows-Ünïcode/Operational"
        );
    }

    #[test]
    fn test_decode_replaces_unpaired_surrogates() {
        let units = [0x0041, 0xD800, 0x0042, 0x0000];
        assert_eq!(decode_utf16_units_z(&units), "A\u{FFFD}B");
    }

    #[test]
    fn test_decode_without_terminator() {
        let bytes = [0x68, 0x00, 0x69, 0x00, 0x21];
        assert_eq!(decode_utf16le_bytes_z(&bytes), "hi");
    }
}
