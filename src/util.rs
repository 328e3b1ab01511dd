//! Byte-level helpers shared by the codec, the card image and the logs.

/// Render bytes as contiguous uppercase hex.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out
}

/// Big-endian unsigned integer from up to 8 bytes.
pub fn be_uint(bytes: &[u8]) -> u64 {
    debug_assert!(bytes.len() <= 8);
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Unsigned 24-bit counter value from a 3-byte big-endian slice.
pub fn counter_value(bytes: &[u8]) -> u32 {
    debug_assert_eq!(bytes.len(), 3);
    be_uint(bytes) as u32
}

/// 3-byte big-endian encoding of a 24-bit counter value.
pub fn counter_bytes(value: u32) -> [u8; 3] {
    [(value >> 16) as u8, (value >> 8) as u8, value as u8]
}

/// Signed 24-bit big-endian integer (SV balances and amounts).
pub fn signed_int3(bytes: &[u8]) -> i32 {
    debug_assert_eq!(bytes.len(), 3);
    let raw = be_uint(bytes) as i32;
    // sign-extend from bit 23
    (raw << 8) >> 8
}

/// 3-byte big-endian encoding of a signed 24-bit integer.
pub fn signed_int3_bytes(value: i32) -> [u8; 3] {
    counter_bytes((value & 0x00FF_FFFF) as u32)
}

/// A single BER-TLV data object borrowed from an encoded buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u32,
    pub value: &'a [u8],
}

/// Walk the TLV data objects at one nesting level.
///
/// Tags of one or two bytes and short/`0x81`-prefixed lengths are
/// supported, which covers the Calypso FCI/FCP grammar. Padding bytes
/// (`0x00`) between objects are skipped; a truncated object ends the
/// walk.
pub fn tlv_children(data: &[u8]) -> Vec<Tlv<'_>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x00 {
            i += 1;
            continue;
        }
        let mut tag = u32::from(data[i]);
        i += 1;
        if tag & 0x1F == 0x1F {
            if i >= data.len() {
                break;
            }
            tag = (tag << 8) | u32::from(data[i]);
            i += 1;
        }
        if i >= data.len() {
            break;
        }
        let len = match data[i] {
            0x81 => {
                i += 1;
                if i >= data.len() {
                    break;
                }
                usize::from(data[i])
            }
            l if l < 0x80 => usize::from(l),
            _ => break,
        };
        i += 1;
        if i + len > data.len() {
            break;
        }
        out.push(Tlv {
            tag,
            value: &data[i..i + len],
        });
        i += len;
    }
    out
}

/// Find the first TLV with the given tag at one nesting level.
pub fn tlv_find(data: &[u8], tag: u32) -> Option<&[u8]> {
    tlv_children(data)
        .into_iter()
        .find(|t| t.tag == tag)
        .map(|t| t.value)
}
