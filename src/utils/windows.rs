use jiff::{Timestamp, tz::Offset};
use std::fmt;
use winstructs::guid::Guid;

const WINDOWS_TO_UNIX_SECS: i64 = 11_644_473_600;
const TICKS_PER_SECOND: u64 = 10_000_000;

#[inline]
pub(crate) fn filetime_to_timestamp(filetime: u64) -> Option<Timestamp> {
    let secs = (filetime / TICKS_PER_SECOND) as i64 - WINDOWS_TO_UNIX_SECS;
    let nanos = ((filetime % TICKS_PER_SECOND) * 100) as i32;
    Timestamp::new(secs, nanos).ok()
}

/// Format a FILETIME as `YYYY/MM/DD HH:MM:SS.nnnnnnnnn` (UTC).
///
/// The fraction is the 100ns tick remainder expressed in nanoseconds, so the last two digits
/// are always zero.
pub(crate) fn format_time_created(filetime: u64) -> Option<String> {
    let ts = filetime_to_timestamp(filetime)?;
    let dt = Offset::UTC.to_datetime(ts);
    let nanos = ((filetime % TICKS_PER_SECOND) * 100) as u32;

    let mut out = String::with_capacity(29);
    push_4_digits(&mut out, dt.year() as u32);
    out.push('/');
    push_2_digits(&mut out, u32::from(dt.month() as u8));
    out.push('/');
    push_2_digits(&mut out, u32::from(dt.day() as u8));
    out.push(' ');
    push_2_digits(&mut out, u32::from(dt.hour() as u8));
    out.push(':');
    push_2_digits(&mut out, u32::from(dt.minute() as u8));
    out.push(':');
    push_2_digits(&mut out, u32::from(dt.second() as u8));
    out.push('.');
    push_9_digits(&mut out, nanos);
    Some(out)
}

/// Format a FILETIME the way event markup carries it, e.g. `2024-03-01T08:15:00.1234567Z`.
pub(crate) fn format_system_time(filetime: u64) -> Option<String> {
    let ts = filetime_to_timestamp(filetime)?;
    let dt = Offset::UTC.to_datetime(ts);
    let ticks = (filetime % TICKS_PER_SECOND) as u32;

    let mut out = String::with_capacity(28);
    push_4_digits(&mut out, dt.year() as u32);
    out.push('-');
    push_2_digits(&mut out, u32::from(dt.month() as u8));
    out.push('-');
    push_2_digits(&mut out, u32::from(dt.day() as u8));
    out.push('T');
    push_2_digits(&mut out, u32::from(dt.hour() as u8));
    out.push(':');
    push_2_digits(&mut out, u32::from(dt.minute() as u8));
    out.push(':');
    push_2_digits(&mut out, u32::from(dt.second() as u8));
    out.push('.');
    push_digits(&mut out, ticks, 7);
    out.push('Z');
    Some(out)
}

fn push_2_digits(out: &mut String, value: u32) {
    push_digits(out, value, 2)
}

fn push_4_digits(out: &mut String, value: u32) {
    push_digits(out, value, 4)
}

fn push_9_digits(out: &mut String, value: u32) {
    push_digits(out, value, 9)
}

fn push_digits(out: &mut String, value: u32, width: u32) {
    for exp in (0..width).rev() {
        let digit = (value / 10u32.pow(exp)) % 10;
        out.push(char::from(b'0' + digit as u8));
    }
}

/// Render GUID bytes in the platform's registry form, `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}`.
pub(crate) fn format_guid(bytes: &[u8; 16]) -> String {
    match Guid::from_buffer(bytes) {
        Ok(guid) => format!("{{{}}}", guid.to_string().to_ascii_uppercase()),
        Err(_) => format!("{{{}}}", hex_upper(bytes)),
    }
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Borrowed binary SID, displayed in the textual `S-R-I-S-S...` form.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SidRef<'a> {
    bytes: &'a [u8],
}

impl<'a> SidRef<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Length of a SID as encoded in its header.
    pub(crate) fn encoded_len(header: &[u8]) -> Option<usize> {
        header.get(1).map(|&count| 8 + 4 * count as usize)
    }
}

impl fmt::Display for SidRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((header, subs)) = self.bytes.split_first_chunk::<8>() else {
            return write!(f, "S-?");
        };
        // 48-bit big-endian identifier authority.
        let authority = header[2..]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
        write!(f, "S-{}-{}", header[0], authority)?;

        // Truncated sub-authorities are dropped.
        for sub in subs.chunks_exact(4).take(usize::from(header[1])) {
            write!(f, "-{}", u32::from_le_bytes([sub[0], sub[1], sub[2], sub[3]]))?;
        }
        Ok(())
    }
}

/// Encode a textual SID (`S-1-5-21-...`) into its binary layout.
pub(crate) fn parse_sid(text: &str) -> Option<Vec<u8>> {
    let mut parts = text.trim().split('-');
    if !parts.next()?.eq_ignore_ascii_case("S") {
        return None;
    }
    let revision: u8 = parts.next()?.parse().ok()?;
    let authority: u64 = parts.next()?.parse().ok()?;
    if authority >= 1 << 48 {
        return None;
    }
    let subs = parts
        .map(|p| p.parse::<u32>().ok())
        .collect::<Option<Vec<u32>>>()?;
    if subs.len() > 15 {
        return None;
    }

    let mut out = Vec::with_capacity(8 + subs.len() * 4);
    out.push(revision);
    out.push(subs.len() as u8);
    out.extend_from_slice(&authority.to_be_bytes()[2..]);
    for sub in subs {
        out.extend_from_slice(&sub.to_le_bytes());
    }
    Some(out)
}

/// Encode a textual GUID (with or without braces) into its in-memory layout.
pub(crate) fn parse_guid(text: &str) -> Option<[u8; 16]> {
    let s = text.trim().trim_start_matches('{').trim_end_matches('}');
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 5 || parts[3].len() != 4 || parts[4].len() != 12 {
        return None;
    }

    let data1 = u32::from_str_radix(parts[0], 16).ok()?;
    let data2 = u16::from_str_radix(parts[1], 16).ok()?;
    let data3 = u16::from_str_radix(parts[2], 16).ok()?;
    let tail = format!("{}{}", parts[3], parts[4]);

    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&data1.to_le_bytes());
    out[4..6].copy_from_slice(&data2.to_le_bytes());
    out[6..8].copy_from_slice(&data3.to_le_bytes());
    for (i, slot) in out[8..].iter_mut().enumerate() {
        *slot = u8::from_str_radix(tail.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // 2024-03-01T08:15:00Z plus 1234567 ticks.
    const SAMPLE_FILETIME: u64 = 133_537_545_001_234_567;

    #[test]
    fn test_time_created_format() {
        assert_eq!(
            format_time_created(SAMPLE_FILETIME).unwrap(),
            "2024/03/01 08:15:00.123456700"
        );
    }

    #[test]
    fn test_time_created_epoch() {
        assert_eq!(format_time_created(0).unwrap(), "1601/01/01 00:00:00.000000000");
    }

    #[test]
    fn test_system_time_format() {
        assert_eq!(
            format_system_time(SAMPLE_FILETIME).unwrap(),
            "2024-03-01T08:15:00.1234567Z"
        );
    }

    #[test]
    fn test_sid_roundtrips_through_text() {
        for text in ["S-1-5-18", "S-1-5-21-3623811015-3361044348-30300820-1013"] {
            let bytes = parse_sid(text).unwrap();
            assert_eq!(SidRef::encoded_len(&bytes), Some(bytes.len()));
            assert_eq!(SidRef::new(&bytes).to_string(), text);
        }
    }

    #[test]
    fn test_truncated_sid_bytes() {
        assert_eq!(SidRef::new(&[1, 1, 0, 0]).to_string(), "S-?");

        let mut bytes = parse_sid("S-1-5-21-7").unwrap();
        bytes.truncate(bytes.len() - 2);
        assert_eq!(SidRef::new(&bytes).to_string(), "S-1-5-21");
    }

    #[test]
    fn test_invalid_sid_text() {
        assert_eq!(parse_sid("X-1-5"), None);
        assert_eq!(parse_sid("S-1-five"), None);
    }

    #[test]
    fn test_guid_roundtrips_through_text() {
        let text = "{555908D1-A6D7-4695-8E1E-26931D2012F4}";
        let bytes = parse_guid(text).unwrap();
        assert_eq!(bytes[0], 0xD1);
        assert_eq!(bytes[8], 0x8E);
        assert_eq!(format_guid(&bytes).to_ascii_uppercase(), text);
    }

    #[test]
    fn test_invalid_guid_text() {
        assert_eq!(parse_guid("{not-a-guid}"), None);
    }
}
