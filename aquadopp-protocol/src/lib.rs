//! # aquadopp-protocol
//!
//! Wire protocol for the Nortek Aquadopp current meter.
//!
//! This crate provides:
//! - Typed values and the primitive codecs between them and raw bytes
//! - Frame signatures and the streaming frame sieve
//! - Field layouts and the sample extractor
//! - Instrument commands and reply scanning
//!
//! It performs no I/O.

pub mod codec;
pub mod command;
pub mod error;
pub mod sample;
pub mod sieve;
pub mod signature;
pub mod value;

pub use codec::Codec;
pub use command::{scan_reply, Command, Reply, ACK, NACK};
pub use error::{CodecError, ProtocolError, SampleError};
pub use sample::{DecodedSample, SampleExtractor, SampleField, SampleLayout};
pub use sieve::{Frame, FrameSieve, Frames, SieveSnapshot};
pub use signature::{FrameSignature, AQUADOPP_SIGNATURES};
pub use value::{ParameterValue, ValueKind};
