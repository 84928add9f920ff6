// Wire framing for the RouterOS binary API.
//
// A sentence is a sequence of length-prefixed words terminated by a
// zero-length word. Word lengths are variable-width (1-5 bytes): the high
// bits of the first byte select the width, its remaining bits plus the
// following bytes carry the value big-endian.

use bytes::{BufMut, BytesMut};

use crate::error::Error;

/// Upper bound on a single decoded sentence.
///
/// Anything larger than this almost certainly means the stream has
/// desynchronized and the bytes being read as a length are payload.
pub const DEFAULT_MAX_SENTENCE: usize = 4 * 1024 * 1024;

// ── Length encoding ──────────────────────────────────────────────────

/// Append the variable-width encoding of `len` to `buf`.
///
/// Widths: `< 0x80` 1 byte, `< 0x4000` 2 bytes (`| 0x8000`),
/// `< 0x200000` 3 bytes (`| 0xC00000`), `< 0x10000000` 4 bytes
/// (`| 0xE0000000`), otherwise a `0xF0` marker followed by 4 raw bytes.
pub fn encode_length(len: u32, buf: &mut BytesMut) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else if len < 0x4000 {
        buf.put_u16(len as u16 | 0x8000);
    } else if len < 0x0020_0000 {
        let v = len | 0x00C0_0000;
        buf.put_u8((v >> 16) as u8);
        buf.put_u16(v as u16);
    } else if len < 0x1000_0000 {
        buf.put_u32(len | 0xE000_0000);
    } else {
        buf.put_u8(0xF0);
        buf.put_u32(len);
    }
}

/// Decode one variable-width length from the front of `buf`.
///
/// Returns `(length, bytes consumed)`, or `None` when the buffer holds a
/// partial prefix. A first byte above `0xF0` can never start a valid
/// length and is reported as a decode error.
pub fn decode_length(buf: &[u8]) -> Result<Option<(u32, usize)>, Error> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    let width = match first {
        0x00..=0x7F => return Ok(Some((u32::from(first), 1))),
        0x80..=0xBF => 2,
        0xC0..=0xDF => 3,
        0xE0..=0xEF => 4,
        0xF0 => 5,
        _ => {
            return Err(Error::Decode {
                reason: format!("invalid length prefix byte 0x{first:02x}"),
            });
        }
    };

    if buf.len() < width {
        return Ok(None);
    }

    let mut value: u32 = match width {
        2 => u32::from(first & 0x3F),
        3 => u32::from(first & 0x1F),
        4 => u32::from(first & 0x0F),
        // 5-byte form: the marker byte carries no value bits
        _ => 0,
    };
    for &b in &buf[1..width] {
        value = (value << 8) | u32::from(b);
    }

    Ok(Some((value, width)))
}

// ── Sentence encoding ────────────────────────────────────────────────

/// Append the framed encoding of a full sentence to `buf`.
pub fn encode_sentence<W: AsRef<[u8]>>(words: &[W], buf: &mut BytesMut) {
    for word in words {
        let bytes = word.as_ref();
        encode_length(bytes.len() as u32, buf);
        buf.put_slice(bytes);
    }
    buf.put_u8(0);
}

// ── Sentence decoding ────────────────────────────────────────────────

/// Decode one complete sentence from the front of `buf`.
///
/// Returns the decoded words and the number of bytes consumed, or `None`
/// when the buffer does not yet hold a complete sentence, so a reader can
/// resume after the next socket read without losing position. A lone
/// terminator byte decodes as an empty word list.
///
/// Word payloads are decoded as UTF-8 with lossy replacement; the API
/// vocabulary is ASCII and anything else is operator-entered text.
pub fn decode_sentence(buf: &[u8], max_sentence: usize) -> Result<Option<(Vec<String>, usize)>, Error> {
    let mut words = Vec::new();
    let mut offset = 0usize;

    loop {
        let Some((len, len_bytes)) = decode_length(&buf[offset..])? else {
            return Ok(None);
        };
        let len = len as usize;
        let end = offset + len_bytes + len;
        if end > max_sentence {
            return Err(Error::SentenceTooLarge {
                size: end,
                max: max_sentence,
            });
        }
        if len == 0 {
            return Ok(Some((words, offset + len_bytes)));
        }
        if buf.len() < end {
            return Ok(None);
        }
        words.push(String::from_utf8_lossy(&buf[offset + len_bytes..end]).into_owned());
        offset = end;
    }
}

// ── Tests ────────────────────────────────────────────────────────────
