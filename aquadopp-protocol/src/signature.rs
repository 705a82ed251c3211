//! Frame signatures: sync bytes plus a fixed total frame length.
//!
//! Aquadopp frames carry no length prefix that the sieve trusts. The length
//! is a property of the signature.
//!
//! ```text
//! +------+----+------+---------------------------+----------+
//! | 0xA5 | id | size | payload                   | checksum |
//! |  1   | 1  |  2   | length - 6                |    2     |
//! +------+----+------+---------------------------+----------+
//! ```

use crate::error::ProtocolError;

/// A frame type recognised by its leading sync bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameSignature {
    pub name: &'static str,
    pub sync: &'static [u8],
    pub length: usize,
}

impl FrameSignature {
    pub const fn new(name: &'static str, sync: &'static [u8], length: usize) -> Self {
        Self { name, sync, length }
    }

    /// Checks the signature can describe a frame at all.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.sync.is_empty() {
            return Err(ProtocolError::InvalidSignature {
                name: self.name.to_string(),
                reason: "sync bytes are empty".to_string(),
            });
        }
        if self.length < self.sync.len() {
            return Err(ProtocolError::InvalidSignature {
                name: self.name.to_string(),
                reason: format!(
                    "length {} is shorter than its {} sync bytes",
                    self.length,
                    self.sync.len()
                ),
            });
        }
        Ok(())
    }

    /// Value of the size word for this frame (length in 16-bit words).
    pub fn size_words(&self) -> u16 {
        (self.length / 2) as u16
    }
}

/// Leading byte of every Aquadopp binary frame.
pub const SYNC_BYTE: u8 = 0xA5;

/// User configuration block, as returned by `GA` and written by `CC`.
pub const USER_CONFIG: FrameSignature = FrameSignature::new("user_config", &[SYNC_BYTE, 0x00], 512);

/// Velocity data record streamed in autosample mode.
pub const VELOCITY: FrameSignature = FrameSignature::new("velocity", &[SYNC_BYTE, 0x01], 42);

/// Head configuration block.
pub const HEAD_CONFIG: FrameSignature = FrameSignature::new("head_config", &[SYNC_BYTE, 0x04], 224);

/// Hardware configuration block.
pub const HARDWARE_CONFIG: FrameSignature =
    FrameSignature::new("hardware_config", &[SYNC_BYTE, 0x05], 48);

/// Every frame the Aquadopp emits, in declaration order.
pub const AQUADOPP_SIGNATURES: [FrameSignature; 4] =
    [USER_CONFIG, VELOCITY, HEAD_CONFIG, HARDWARE_CONFIG];
