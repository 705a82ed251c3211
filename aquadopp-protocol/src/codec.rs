//! Primitive codecs shared by the parameter dictionary and the sample
//! extractor.
//!
//! Every codec is a pair of plain functions (decoder, encoder) that are
//! inverses over the codec's domain. Multi-byte integers are big-endian.
//!
//! The instrument clock is six BCD bytes in the order
//! `minute, second, day, hour, year (since 2000), month`.

use crate::error::CodecError;
use crate::value::ParameterValue;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use std::fmt;

/// Seed of the instrument checksum.
pub const CHECKSUM_SEED: u16 = 0xB58C;

/// Width of the instrument clock in bytes.
pub const CLOCK_WIDTH: usize = 6;

/// Decodes exactly `width` bytes into a typed value.
pub type DecodeFn = fn(&[u8]) -> Result<ParameterValue, CodecError>;

/// Encodes a typed value into exactly `width` bytes.
pub type EncodeFn = fn(&ParameterValue, usize) -> Result<Vec<u8>, CodecError>;

/// A named decoder/encoder pair.
#[derive(Clone, Copy)]
pub struct Codec {
    pub name: &'static str,
    pub decode: DecodeFn,
    pub encode: EncodeFn,
}

impl Codec {
    pub fn decode(&self, bytes: &[u8]) -> Result<ParameterValue, CodecError> {
        (self.decode)(bytes)
    }

    pub fn encode(&self, value: &ParameterValue, width: usize) -> Result<Vec<u8>, CodecError> {
        (self.encode)(value, width)
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Codec").field(&self.name).finish()
    }
}

/// Unsigned 8-bit integer.
pub const BYTE: Codec = Codec {
    name: "byte",
    decode: decode_byte,
    encode: encode_byte,
};

/// Unsigned 16-bit big-endian integer.
pub const WORD: Codec = Codec {
    name: "word",
    decode: decode_word,
    encode: encode_word,
};

/// Signed 16-bit big-endian integer.
pub const SIGNED_WORD: Codec = Codec {
    name: "signed_word",
    decode: decode_signed_word,
    encode: encode_signed_word,
};

/// Unsigned 32-bit big-endian integer.
pub const DOUBLE_WORD: Codec = Codec {
    name: "double_word",
    decode: decode_double_word,
    encode: encode_double_word,
};

/// Six-byte BCD instrument clock.
pub const CLOCK: Codec = Codec {
    name: "clock",
    decode: decode_clock,
    encode: encode_clock,
};

/// Six-byte BCD clock that reads all zeros until it is first set. The
/// zeroed clock decodes to six zero [`ParameterValue::Bytes`].
pub const DEPLOY_CLOCK: Codec = Codec {
    name: "deploy_clock",
    decode: decode_deploy_clock,
    encode: encode_deploy_clock,
};

/// NUL-padded ASCII text.
pub const ASCII: Codec = Codec {
    name: "ascii",
    decode: decode_ascii,
    encode: encode_ascii,
};

/// Opaque bytes, carried as-is.
pub const RAW: Codec = Codec {
    name: "raw",
    decode: decode_raw,
    encode: encode_raw,
};

fn check_width(codec: &'static str, expected: usize, actual: usize) -> Result<(), CodecError> {
    if expected != actual {
        return Err(CodecError::Width {
            codec,
            expected,
            actual,
        });
    }
    Ok(())
}

fn int_in_range(
    codec: &'static str,
    value: &ParameterValue,
    width: usize,
    min: i64,
    max: i64,
) -> Result<i64, CodecError> {
    let v = value.as_int().ok_or(CodecError::Type {
        codec,
        found: value.kind(),
    })?;
    if v < min || v > max {
        return Err(CodecError::OutOfRange {
            codec,
            value: v.to_string(),
            width,
        });
    }
    Ok(v)
}

fn decode_byte(b: &[u8]) -> Result<ParameterValue, CodecError> {
    check_width("byte", 1, b.len())?;
    Ok(ParameterValue::Int(b[0] as i64))
}

fn encode_byte(v: &ParameterValue, width: usize) -> Result<Vec<u8>, CodecError> {
    check_width("byte", 1, width)?;
    let v = int_in_range("byte", v, width, 0, u8::MAX as i64)?;
    Ok(vec![v as u8])
}

fn decode_word(b: &[u8]) -> Result<ParameterValue, CodecError> {
    check_width("word", 2, b.len())?;
    Ok(ParameterValue::Int(u16::from_be_bytes([b[0], b[1]]) as i64))
}

fn encode_word(v: &ParameterValue, width: usize) -> Result<Vec<u8>, CodecError> {
    check_width("word", 2, width)?;
    let v = int_in_range("word", v, width, 0, u16::MAX as i64)?;
    Ok((v as u16).to_be_bytes().to_vec())
}

fn decode_signed_word(b: &[u8]) -> Result<ParameterValue, CodecError> {
    check_width("signed_word", 2, b.len())?;
    Ok(ParameterValue::Int(i16::from_be_bytes([b[0], b[1]]) as i64))
}

fn encode_signed_word(v: &ParameterValue, width: usize) -> Result<Vec<u8>, CodecError> {
    check_width("signed_word", 2, width)?;
    let v = int_in_range("signed_word", v, width, i16::MIN as i64, i16::MAX as i64)?;
    Ok((v as i16).to_be_bytes().to_vec())
}

fn decode_double_word(b: &[u8]) -> Result<ParameterValue, CodecError> {
    check_width("double_word", 4, b.len())?;
    Ok(ParameterValue::Int(
        u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as i64,
    ))
}

fn encode_double_word(v: &ParameterValue, width: usize) -> Result<Vec<u8>, CodecError> {
    check_width("double_word", 4, width)?;
    let v = int_in_range("double_word", v, width, 0, u32::MAX as i64)?;
    Ok((v as u32).to_be_bytes().to_vec())
}

fn from_bcd(b: u8) -> Result<u32, CodecError> {
    let (hi, lo) = (b >> 4, b & 0x0F);
    if hi > 9 || lo > 9 {
        return Err(CodecError::InvalidBcd(b));
    }
    Ok((hi * 10 + lo) as u32)
}

fn to_bcd(v: u32) -> u8 {
    (((v / 10) << 4) | (v % 10)) as u8
}

/// Decodes a six-byte instrument clock.
pub fn clock_to_datetime(b: &[u8]) -> Result<NaiveDateTime, CodecError> {
    check_width("clock", CLOCK_WIDTH, b.len())?;
    let minute = from_bcd(b[0])?;
    let second = from_bcd(b[1])?;
    let day = from_bcd(b[2])?;
    let hour = from_bcd(b[3])?;
    let year = 2000 + from_bcd(b[4])? as i32;
    let month = from_bcd(b[5])?;

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .ok_or_else(|| CodecError::InvalidClock(hex::encode(b)))
}

/// Encodes a timestamp as a six-byte instrument clock.
///
/// The clock carries whole seconds and a two-digit year, so only
/// timestamps in 2000..=2099 are representable.
pub fn datetime_to_clock(ts: &NaiveDateTime) -> Result<[u8; CLOCK_WIDTH], CodecError> {
    if !(2000..=2099).contains(&ts.year()) || ts.nanosecond() != 0 {
        return Err(CodecError::OutOfRange {
            codec: "clock",
            value: ts.to_string(),
            width: CLOCK_WIDTH,
        });
    }
    Ok([
        to_bcd(ts.minute()),
        to_bcd(ts.second()),
        to_bcd(ts.day()),
        to_bcd(ts.hour()),
        to_bcd((ts.year() - 2000) as u32),
        to_bcd(ts.month()),
    ])
}

fn decode_clock(b: &[u8]) -> Result<ParameterValue, CodecError> {
    clock_to_datetime(b).map(ParameterValue::Timestamp)
}

fn encode_clock(v: &ParameterValue, width: usize) -> Result<Vec<u8>, CodecError> {
    check_width("clock", CLOCK_WIDTH, width)?;
    let ts = v.as_timestamp().ok_or(CodecError::Type {
        codec: "clock",
        found: v.kind(),
    })?;
    Ok(datetime_to_clock(&ts)?.to_vec())
}

/// Value of a clock that was never set.
pub const UNSET_CLOCK: [u8; CLOCK_WIDTH] = [0; CLOCK_WIDTH];

fn decode_deploy_clock(b: &[u8]) -> Result<ParameterValue, CodecError> {
    if b == &UNSET_CLOCK[..] {
        return Ok(ParameterValue::Bytes(UNSET_CLOCK.to_vec()));
    }
    decode_clock(b)
}

fn encode_deploy_clock(v: &ParameterValue, width: usize) -> Result<Vec<u8>, CodecError> {
    match v {
        ParameterValue::Bytes(b) if b.as_slice() == &UNSET_CLOCK[..] => {
            check_width("deploy_clock", CLOCK_WIDTH, width)?;
            Ok(b.clone())
        }
        _ => encode_clock(v, width),
    }
}

fn decode_ascii(b: &[u8]) -> Result<ParameterValue, CodecError> {
    if !b.is_ascii() {
        return Err(CodecError::NotAscii);
    }
    let text: String = b.iter().map(|&c| c as char).collect();
    Ok(ParameterValue::Text(
        text.trim_end_matches(|c| c == '\0' || c == ' ').to_string(),
    ))
}

fn encode_ascii(v: &ParameterValue, width: usize) -> Result<Vec<u8>, CodecError> {
    let text = v.as_text().ok_or(CodecError::Type {
        codec: "ascii",
        found: v.kind(),
    })?;
    if !text.is_ascii() {
        return Err(CodecError::NotAscii);
    }
    if text.len() > width {
        return Err(CodecError::OutOfRange {
            codec: "ascii",
            value: text.to_string(),
            width,
        });
    }
    let mut out = text.as_bytes().to_vec();
    out.resize(width, 0);
    Ok(out)
}

fn decode_raw(b: &[u8]) -> Result<ParameterValue, CodecError> {
    Ok(ParameterValue::Bytes(b.to_vec()))
}

fn encode_raw(v: &ParameterValue, width: usize) -> Result<Vec<u8>, CodecError> {
    match v {
        ParameterValue::Bytes(b) => {
            check_width("raw", width, b.len())?;
            Ok(b.clone())
        }
        other => Err(CodecError::Type {
            codec: "raw",
            found: other.kind(),
        }),
    }
}

/// Decodes a signed word scaled by `scale` (e.g. 0.1 degrees per count).
pub fn decode_fixed(b: &[u8], scale: f64) -> Result<f64, CodecError> {
    check_width("fixed", 2, b.len())?;
    Ok(i16::from_be_bytes([b[0], b[1]]) as f64 * scale)
}

/// Encodes a scaled value as a signed word, rounding to the nearest count.
pub fn encode_fixed(v: f64, scale: f64) -> Result<[u8; 2], CodecError> {
    let counts = (v / scale).round();
    if !counts.is_finite() || counts < i16::MIN as f64 || counts > i16::MAX as f64 {
        return Err(CodecError::OutOfRange {
            codec: "fixed",
            value: v.to_string(),
            width: 2,
        });
    }
    Ok((counts as i16).to_be_bytes())
}

/// Composes a pressure reading from its high byte and low word.
pub fn compose_pressure(high: u8, low: u16) -> i64 {
    high as i64 * 0x10000 + low as i64
}

/// Splits a pressure reading into its high byte and low word.
pub fn split_pressure(pressure: i64) -> Result<(u8, u16), CodecError> {
    if !(0..=0xFF_FFFF).contains(&pressure) {
        return Err(CodecError::OutOfRange {
            codec: "pressure",
            value: pressure.to_string(),
            width: 3,
        });
    }
    Ok(((pressure >> 16) as u8, (pressure & 0xFFFF) as u16))
}

/// Computes the instrument checksum over `data`: the seed plus every
/// big-endian word, wrapping. An odd trailing byte is the high half of a
/// final word.
pub fn checksum(data: &[u8]) -> u16 {
    data.chunks(2).fold(CHECKSUM_SEED, |acc, w| {
        let word = u16::from_be_bytes([w[0], w.get(1).copied().unwrap_or(0)]);
        acc.wrapping_add(word)
    })
}

/// Returns `(stored, computed)` checksums of a frame whose last word is its
/// checksum, or `None` if the frame is too short to carry one.
pub fn frame_checksums(frame: &[u8]) -> Option<(u16, u16)> {
    if frame.len() < 2 {
        return None;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    Some((u16::from_be_bytes([tail[0], tail[1]]), checksum(body)))
}

/// Rewrites the trailing checksum word of `frame` to match its body.
pub fn seal(frame: &mut [u8]) {
    if frame.len() < 2 {
        return;
    }
    let split = frame.len() - 2;
    let sum = checksum(&frame[..split]);
    frame[split..].copy_from_slice(&sum.to_be_bytes());
}
