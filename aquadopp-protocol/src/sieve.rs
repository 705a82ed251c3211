//! Streaming frame sieve.
//!
//! The sieve accumulates raw bytes from the link and yields every complete
//! frame whose sync bytes match a declared [`FrameSignature`]. It never
//! validates frame contents; that is the extractor's job.
//!
//! Scanning rules:
//! - Candidates are tried at each buffer position in signature declaration
//!   order; the first signature whose sync bytes match wins.
//! - A matched signature with fewer than `length` bytes buffered stops the
//!   scan until more data arrives.
//! - Trailing bytes that are still a proper prefix of some sync pattern are
//!   kept. Everything before the first possible frame start is discarded.
//!
//! The sieve's whole state is its buffer and absolute stream offset, so a
//! [`SieveSnapshot`] taken before a reconnect restores it exactly.

use crate::error::ProtocolError;
use crate::signature::{FrameSignature, AQUADOPP_SIGNATURES};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// A complete frame cut from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Signature that matched.
    pub signature: FrameSignature,
    /// Exactly `signature.length` bytes, sync bytes included.
    pub bytes: Bytes,
    /// Absolute offset of the first byte in the fed stream.
    pub offset: u64,
}

/// Saved sieve state for resuming across reconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SieveSnapshot {
    /// Absolute stream offset of the first buffered byte.
    pub offset: u64,
    /// Buffered, not yet consumed bytes.
    #[serde(with = "crate::value::hex_bytes")]
    pub buffer: Vec<u8>,
}

enum Scan {
    Complete(FrameSignature),
    Wait,
    NoMatch,
}

/// Extracts complete frames from a fragmented byte stream.
#[derive(Debug, Clone)]
pub struct FrameSieve {
    signatures: Vec<FrameSignature>,
    buffer: BytesMut,
    offset: u64,
    discarded: u64,
}

impl FrameSieve {
    /// Creates a sieve over the given signatures, in declaration order.
    pub fn new(signatures: impl IntoIterator<Item = FrameSignature>) -> Result<Self, ProtocolError> {
        let signatures: Vec<FrameSignature> = signatures.into_iter().collect();
        for sig in &signatures {
            sig.validate()?;
        }
        Ok(Self {
            signatures,
            buffer: BytesMut::with_capacity(4096),
            offset: 0,
            discarded: 0,
        })
    }

    /// Creates a sieve for every Aquadopp frame type.
    pub fn aquadopp() -> Self {
        Self {
            signatures: AQUADOPP_SIGNATURES.to_vec(),
            buffer: BytesMut::with_capacity(4096),
            offset: 0,
            discarded: 0,
        }
    }

    /// Creates a sieve that resumes from a snapshot.
    pub fn restore(
        signatures: impl IntoIterator<Item = FrameSignature>,
        snapshot: SieveSnapshot,
    ) -> Result<Self, ProtocolError> {
        let mut sieve = Self::new(signatures)?;
        sieve.offset = snapshot.offset;
        sieve.buffer.extend_from_slice(&snapshot.buffer);
        Ok(sieve)
    }

    /// Replaces the buffered state with a snapshot, keeping the signatures.
    pub fn load_snapshot(&mut self, snapshot: SieveSnapshot) {
        self.buffer.clear();
        self.buffer.extend_from_slice(&snapshot.buffer);
        self.offset = snapshot.offset;
    }

    /// Captures the buffered state.
    pub fn snapshot(&self) -> SieveSnapshot {
        SieveSnapshot {
            offset: self.offset,
            buffer: self.buffer.to_vec(),
        }
    }

    pub fn signatures(&self) -> &[FrameSignature] {
        &self.signatures
    }

    /// Appends `data` and returns an iterator over the complete frames now
    /// available. Frames are consumed from the buffer as the iterator
    /// advances; frames not pulled stay buffered for the next call.
    pub fn feed(&mut self, data: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(data);
        Frames {
            sieve: self,
            discarded: 0,
            noise: None,
        }
    }

    /// Like [`feed`](Self::feed), but keeps the bytes discarded between
    /// frames for [`Frames::take_noise`]. Command replies that arrive
    /// interleaved with frames are read from the noise.
    pub fn sift(&mut self, data: &[u8]) -> Frames<'_> {
        self.buffer.extend_from_slice(data);
        Frames {
            sieve: self,
            discarded: 0,
            noise: Some(Vec::new()),
        }
    }

    /// Cuts the next complete frame from the buffer without feeding.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let mut discarded = 0;
        self.cut(&mut discarded, None)
    }

    /// Returns the number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the buffered bytes.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Absolute stream offset of the first buffered byte.
    pub fn stream_offset(&self) -> u64 {
        self.offset
    }

    /// Total bytes discarded as noise since construction.
    pub fn total_discarded(&self) -> u64 {
        self.discarded
    }

    /// Drops every buffered byte, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.buffer.len();
        self.buffer.clear();
        self.offset += n as u64;
        self.discarded += n as u64;
        n
    }

    fn classify(&self, rest: &[u8]) -> Scan {
        for sig in &self.signatures {
            if rest.len() >= sig.sync.len() {
                if rest.starts_with(sig.sync) {
                    return if rest.len() >= sig.length {
                        Scan::Complete(*sig)
                    } else {
                        Scan::Wait
                    };
                }
            } else if sig.sync.starts_with(rest) {
                return Scan::Wait;
            }
        }
        Scan::NoMatch
    }

    fn cut(&mut self, discarded: &mut usize, noise: Option<&mut Vec<u8>>) -> Option<Frame> {
        let mut start = self.buffer.len();
        let mut found = None;
        for pos in 0..self.buffer.len() {
            match self.classify(&self.buffer[pos..]) {
                Scan::Complete(sig) => {
                    start = pos;
                    found = Some(sig);
                    break;
                }
                Scan::Wait => {
                    start = pos;
                    break;
                }
                Scan::NoMatch => {}
            }
        }

        if start > 0 {
            if let Some(noise) = noise {
                noise.extend_from_slice(&self.buffer[..start]);
            }
            self.buffer.advance(start);
            self.offset += start as u64;
            self.discarded += start as u64;
            *discarded += start;
        }

        let signature = found?;
        let offset = self.offset;
        let bytes = self.buffer.split_to(signature.length).freeze();
        self.offset += signature.length as u64;
        Some(Frame {
            signature,
            bytes,
            offset,
        })
    }
}

/// Frames produced by one [`FrameSieve::feed`] call.
pub struct Frames<'a> {
    sieve: &'a mut FrameSieve,
    discarded: usize,
    noise: Option<Vec<u8>>,
}

impl Frames<'_> {
    /// Bytes discarded as noise so far during this call.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Takes the noise kept since the last call. After a frame is pulled
    /// this is the noise in front of it; once the iterator is exhausted it
    /// is the noise behind the last frame. Always empty for
    /// [`FrameSieve::feed`].
    pub fn take_noise(&mut self) -> Vec<u8> {
        self.noise.as_mut().map(std::mem::take).unwrap_or_default()
    }
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.sieve.cut(&mut self.discarded, self.noise.as_mut())
    }
}
