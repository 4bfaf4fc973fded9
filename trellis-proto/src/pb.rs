//! Protobuf primitives for the built-in gateway services.
//!
//! The gateway request/reply messages carry exactly one field: field #1 as
//! a length-delimited string (wire type 2). Unknown fields are skipped on
//! decode so clients may send richer messages.

/// Append `v` as a base-128 varint.
pub fn encode_varint(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a varint; returns (value, bytes consumed).
pub fn decode_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Encode a message whose only field is `#1: string`.
pub fn encode_string_field1(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 6);
    out.push(0x0a); // field 1, wire type 2
    encode_varint(s.len() as u64, &mut out);
    out.extend_from_slice(s);
    out
}

/// Extract field #1 (length-delimited) from a message, skipping unknown
/// fields. Returns the last occurrence if repeated, per proto3 semantics.
pub fn decode_string_field1(data: &[u8]) -> Option<Vec<u8>> {
    let mut pos = 0;
    let mut found: Option<Vec<u8>> = None;
    while pos < data.len() {
        let (tag, n) = decode_varint(&data[pos..])?;
        pos += n;
        let field = tag >> 3;
        let wire_type = tag & 0x7;
        match wire_type {
            0 => {
                let (_, n) = decode_varint(&data[pos..])?;
                pos += n;
            }
            1 => {
                pos = pos.checked_add(8)?;
                if pos > data.len() {
                    return None;
                }
            }
            2 => {
                let (len, n) = decode_varint(&data[pos..])?;
                pos += n;
                let len = usize::try_from(len).ok()?;
                let end = pos.checked_add(len)?;
                if end > data.len() {
                    return None;
                }
                if field == 1 {
                    found = Some(data[pos..end].to_vec());
                }
                pos = end;
            }
            5 => {
                pos = pos.checked_add(4)?;
                if pos > data.len() {
                    return None;
                }
            }
            _ => return None,
        }
    }
    found
}
