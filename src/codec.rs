use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use std::io::{Read, Write};
use thiserror::Error;
use uuid::Uuid;

/// Largest frame body the protocol can express with a 3 byte length prefix
pub const MAX_FRAME_LEN: usize = (1 << 21) - 1;

/// Largest body a compressed frame may inflate to
pub const MAX_DATA_LEN: usize = 1 << 23;

/// Longest string the protocol allows, in characters
pub const MAX_STRING_CHARS: usize = 32767;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("varint is longer than 5 bytes")]
    VarIntTooLong,

    #[error("insufficient data: need={need} have={have}")]
    InsufficientData { need: usize, have: usize },

    #[error("frame exceeds maximum size: len={len} max={max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("negative length prefix: {0}")]
    NegativeLength(i32),

    #[error("string too long: {len} bytes (max {max} chars)")]
    StringTooLong { len: usize, max: usize },

    #[error("invalid utf-8 string: {0}")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("zlib: {0}")]
    Zlib(std::io::Error),

    #[error("inflated body is {actual} bytes, frame declared {declared}")]
    DataLengthMismatch { declared: usize, actual: usize },
}

fn ensure(buf: &impl Buf, need: usize) -> Result<(), CodecError> {
    if buf.remaining() < need {
        return Err(CodecError::InsufficientData {
            need,
            have: buf.remaining(),
        });
    }
    Ok(())
}

/// read_varint consumes a protocol VarInt from the buffer
pub fn read_varint(buf: &mut impl Buf) -> Result<i32, CodecError> {
    let mut value: u32 = 0;
    for i in 0..5 {
        ensure(buf, 1)?;
        let byte = buf.get_u8();
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(CodecError::VarIntTooLong)
}

/// peek_varint reads a VarInt from the start of a slice without consuming it.
/// Returns the value and the number of bytes it occupies, or None if the
/// slice ends first.
pub fn peek_varint(src: &[u8]) -> Result<Option<(i32, usize)>, CodecError> {
    let mut value: u32 = 0;
    for (i, byte) in src.iter().take(5).enumerate() {
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value as i32, i + 1)));
        }
    }
    if src.len() >= 5 {
        return Err(CodecError::VarIntTooLong);
    }
    Ok(None)
}

pub fn write_varint(buf: &mut impl BufMut, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7f == 0 {
            buf.put_u8(v as u8);
            return;
        }
        buf.put_u8((v & 0x7f | 0x80) as u8);
        v >>= 7;
    }
}

pub fn varint_len(value: i32) -> usize {
    let mut v = value as u32;
    let mut len = 1;
    while v & !0x7f != 0 {
        v >>= 7;
        len += 1;
    }
    len
}

/// read_string reads a VarInt length prefixed UTF-8 string of at most
/// `max_chars` characters
pub fn read_string(buf: &mut impl Buf, max_chars: usize) -> Result<String, CodecError> {
    let len = read_varint(buf)?;
    if len < 0 {
        return Err(CodecError::NegativeLength(len));
    }
    let len = len as usize;

    // A character is at most 4 bytes of UTF-8
    if len > max_chars * 4 {
        return Err(CodecError::StringTooLong {
            len,
            max: max_chars,
        });
    }
    ensure(buf, len)?;
    let value = String::from_utf8(buf.copy_to_bytes(len).to_vec())?;
    if value.chars().count() > max_chars {
        return Err(CodecError::StringTooLong {
            len,
            max: max_chars,
        });
    }
    Ok(value)
}

pub fn write_string(buf: &mut impl BufMut, value: &str) {
    write_varint(buf, value.len() as i32);
    buf.put_slice(value.as_bytes());
}

/// read_bytes reads a VarInt-prefixed byte array of at most `max` bytes
pub fn read_bytes(buf: &mut impl Buf, max: usize) -> Result<Vec<u8>, CodecError> {
    let len = read_varint(buf)?;
    if len < 0 {
        return Err(CodecError::NegativeLength(len));
    }
    let len = len as usize;
    if len > max {
        return Err(CodecError::FrameTooLarge { len, max });
    }
    ensure(buf, len)?;
    let mut out = vec![0; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn write_bytes(buf: &mut impl BufMut, value: &[u8]) {
    write_varint(buf, value.len() as i32);
    buf.put_slice(value);
}

pub fn read_u8(buf: &mut impl Buf) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut impl Buf) -> Result<u16, CodecError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn read_i64(buf: &mut impl Buf) -> Result<i64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub fn read_uuid(buf: &mut impl Buf) -> Result<Uuid, CodecError> {
    ensure(buf, 16)?;
    Ok(Uuid::from_u128(buf.get_u128()))
}

pub fn write_uuid(buf: &mut impl BufMut, value: Uuid) {
    buf.put_u128(value.as_u128());
}

/// try_decode_frame splits one complete frame off the front of `buf` and
/// returns its body: the packet id followed by the packet fields.
///
/// Returns Ok(None) when more bytes are needed. With `compression` set the
/// frame is read in the compressed format and inflated if its data length
/// is non-zero.
pub fn try_decode_frame(buf: &mut BytesMut, compression: bool) -> Result<Option<Bytes>, CodecError> {
    let Some((len, prefix)) = peek_varint(buf)? else {
        return Ok(None);
    };
    if len < 0 {
        return Err(CodecError::NegativeLength(len));
    }
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    if buf.len() < prefix + len {
        return Ok(None);
    }

    buf.advance(prefix);
    let mut body = buf.split_to(len).freeze();
    if !compression {
        return Ok(Some(body));
    }

    match read_varint(&mut body)? {
        0 => Ok(Some(body)),
        data_len if data_len < 0 => Err(CodecError::NegativeLength(data_len)),
        data_len => inflate(&body, data_len as usize).map(Some),
    }
}

fn inflate(payload: &[u8], data_len: usize) -> Result<Bytes, CodecError> {
    if data_len > MAX_DATA_LEN {
        return Err(CodecError::FrameTooLarge {
            len: data_len,
            max: MAX_DATA_LEN,
        });
    }

    let mut out = Vec::with_capacity(data_len);
    ZlibDecoder::new(payload)
        .take(data_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(CodecError::Zlib)?;
    if out.len() != data_len {
        return Err(CodecError::DataLengthMismatch {
            declared: data_len,
            actual: out.len(),
        });
    }
    Ok(Bytes::from(out))
}

/// encode_frame appends a length prefixed frame holding `body` to `dst`.
///
/// A negative `threshold` writes the plain format. Otherwise the compressed
/// format is used and bodies of at least `threshold` bytes are deflated.
pub fn encode_frame(dst: &mut BytesMut, body: &[u8], threshold: i32) -> Result<(), CodecError> {
    if threshold < 0 {
        check_len(body.len())?;
        dst.reserve(varint_len(body.len() as i32) + body.len());
        write_varint(dst, body.len() as i32);
        dst.put_slice(body);
        return Ok(());
    }

    if body.len() < threshold as usize {
        let len = varint_len(0) + body.len();
        check_len(len)?;
        dst.reserve(varint_len(len as i32) + len);
        write_varint(dst, len as i32);
        write_varint(dst, 0);
        dst.put_slice(body);
        return Ok(());
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body).map_err(CodecError::Zlib)?;
    let payload = encoder.finish().map_err(CodecError::Zlib)?;

    let len = varint_len(body.len() as i32) + payload.len();
    check_len(len)?;
    dst.reserve(varint_len(len as i32) + len);
    write_varint(dst, len as i32);
    write_varint(dst, body.len() as i32);
    dst.put_slice(&payload);
    Ok(())
}

fn check_len(len: usize) -> Result<(), CodecError> {
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}
