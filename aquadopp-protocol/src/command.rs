//! Instrument commands and reply scanning.
//!
//! Commands are two ASCII letters with an optional binary argument and no
//! terminator. The instrument answers with an optional fixed-length payload
//! followed by `ACK` (`06 06`), or with `NACK` (`15 15`).

use crate::codec::{self, CLOCK_WIDTH};
use crate::error::ProtocolError;
use crate::sample::SampleLayout;
use crate::signature::{HARDWARE_CONFIG, HEAD_CONFIG, USER_CONFIG};
use chrono::NaiveDateTime;
use std::ops::Range;

pub const ACK: [u8; 2] = [0x06, 0x06];
pub const NACK: [u8; 2] = [0x15, 0x15];

/// Break sequence; wakes the instrument and puts it in command mode.
pub const BREAK: &[u8] = b"@@@@@@K1W%!Q";
/// Read the identification string.
pub const READ_ID: &[u8] = b"ID";
/// Read the real-time clock.
pub const READ_CLOCK: &[u8] = b"RC";
/// Set the real-time clock, followed by six clock bytes.
pub const SET_CLOCK: &[u8] = b"SC";
/// Read the battery voltage.
pub const READ_BATTERY: &[u8] = b"BV";
/// Read hardware, head and user configuration.
pub const GET_ALL: &[u8] = b"GA";
/// Write the user configuration, followed by the 512-byte block.
pub const CONFIGURE: &[u8] = b"CC";
/// Start measurement without recorder.
pub const START_MEASUREMENT: &[u8] = b"SD";
/// Acquire one sample.
pub const ACQUIRE_SAMPLE: &[u8] = b"AS";

/// Length of the identification reply payload.
pub const ID_LENGTH: usize = 14;
/// Length of the battery voltage reply payload.
pub const BATTERY_LENGTH: usize = 2;
/// Length of the `GA` reply payload.
pub const GET_ALL_LENGTH: usize = HARDWARE_CONFIG.length + HEAD_CONFIG.length + USER_CONFIG.length;

/// A command ready to be written, with the shape of its expected reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Short name for logs and errors.
    pub name: &'static str,
    /// Bytes written to the link.
    pub bytes: Vec<u8>,
    /// Payload bytes expected before the `ACK`.
    pub reply_len: usize,
    /// Leading bytes of a binary payload. Anchored replies are located by
    /// their payload rather than by the first marker in the buffer.
    pub anchor: Option<&'static [u8]>,
}

impl Command {
    fn simple(name: &'static str, bytes: &[u8], reply_len: usize) -> Self {
        Self {
            name,
            bytes: bytes.to_vec(),
            reply_len,
            anchor: None,
        }
    }

    fn anchored(mut self, anchor: &'static [u8]) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub fn wake() -> Self {
        Self::simple("break", BREAK, 0)
    }

    pub fn read_id() -> Self {
        Self::simple("ID", READ_ID, ID_LENGTH)
    }

    pub fn read_clock() -> Self {
        Self::simple("RC", READ_CLOCK, CLOCK_WIDTH)
    }

    pub fn read_battery() -> Self {
        Self::simple("BV", READ_BATTERY, BATTERY_LENGTH)
    }

    pub fn get_all() -> Self {
        Self::simple("GA", GET_ALL, GET_ALL_LENGTH).anchored(HARDWARE_CONFIG.sync)
    }

    pub fn start_measurement() -> Self {
        Self::simple("SD", START_MEASUREMENT, 0)
    }

    /// Acquires one record laid out as `layout`.
    pub fn acquire_sample(layout: &SampleLayout) -> Self {
        Self::simple("AS", ACQUIRE_SAMPLE, layout.width()).anchored(layout.signature.sync)
    }

    pub fn set_clock(ts: &NaiveDateTime) -> Result<Self, ProtocolError> {
        let mut bytes = SET_CLOCK.to_vec();
        bytes.extend_from_slice(&codec::datetime_to_clock(ts)?);
        Ok(Self {
            name: "SC",
            bytes,
            reply_len: 0,
            anchor: None,
        })
    }

    /// Builds a `CC` command carrying `block`, which must be a sealed user
    /// configuration block.
    pub fn configure(block: &[u8]) -> Result<Self, ProtocolError> {
        if block.len() != USER_CONFIG.length || !block.starts_with(USER_CONFIG.sync) {
            return Err(ProtocolError::UnexpectedResponse {
                command: "CC".to_string(),
                detail: format!("not a user configuration block ({} bytes)", block.len()),
            });
        }
        if let Some((stored, computed)) = codec::frame_checksums(block) {
            if stored != computed {
                return Err(ProtocolError::ChecksumMismatch {
                    block: USER_CONFIG.name.to_string(),
                    expected: computed,
                    actual: stored,
                });
            }
        }
        let mut bytes = CONFIGURE.to_vec();
        bytes.extend_from_slice(block);
        Ok(Self {
            name: "CC",
            bytes,
            reply_len: 0,
            anchor: None,
        })
    }

    /// Scans `buf` for this command's reply.
    pub fn scan(&self, buf: &[u8]) -> Option<Reply> {
        match self.anchor {
            Some(anchor) => scan_anchored(buf, anchor, self.reply_len),
            None => scan_reply(buf, self.reply_len),
        }
    }
}

/// Outcome of scanning buffered reply bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The instrument acknowledged. `payload` indexes the bytes just before
    /// the `ACK`; `consumed` covers everything up to and including it.
    Ack {
        payload: Range<usize>,
        consumed: usize,
    },
    /// The instrument rejected the command.
    Nack { consumed: usize },
}

/// Scans `buf` for the reply to a command expecting `payload_len` bytes
/// before its `ACK`.
///
/// Returns `None` while the reply is incomplete. Bytes before the payload
/// (banners, echoes, line noise) are skipped. Acknowledgement markers are
/// only searched for after `payload_len` bytes so that payload bytes equal
/// to `ACK` are not mistaken for one.
pub fn scan_reply(buf: &[u8], payload_len: usize) -> Option<Reply> {
    let mut pos = payload_len;
    while pos + 2 <= buf.len() {
        let marker = &buf[pos..pos + 2];
        if marker == ACK {
            return Some(Reply::Ack {
                payload: pos - payload_len..pos,
                consumed: pos + 2,
            });
        }
        if marker == NACK {
            return Some(Reply::Nack { consumed: pos + 2 });
        }
        pos += 1;
    }
    None
}

/// Scans `buf` for a reply whose `payload_len`-byte payload starts with
/// `anchor`.
///
/// The `ACK` must follow the payload immediately. A candidate anchor not
/// followed by a marker was part of the leading noise and is skipped. A
/// `NACK` before any payload rejects the command.
pub fn scan_anchored(buf: &[u8], anchor: &[u8], payload_len: usize) -> Option<Reply> {
    for pos in 0..buf.len() {
        let rest = &buf[pos..];
        if rest.starts_with(&NACK) {
            return Some(Reply::Nack { consumed: pos + 2 });
        }
        if !rest.starts_with(anchor) {
            continue;
        }
        let end = pos + payload_len;
        let Some(marker) = buf.get(end..end + 2) else {
            return None;
        };
        if marker == ACK {
            return Some(Reply::Ack {
                payload: pos..end,
                consumed: end + 2,
            });
        }
        if marker == NACK {
            return Some(Reply::Nack { consumed: end + 2 });
        }
    }
    None
}
