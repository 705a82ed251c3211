//! Sample extraction: decoding a matched frame into named typed fields.
//!
//! A [`SampleLayout`] is an ordered list of fixed-width fields whose widths
//! add up to the frame length. Each field is decoded with one of the shared
//! codec primitives.

use crate::codec::{self, Codec};
use crate::error::{CodecError, SampleError};
use crate::sieve::Frame;
use crate::signature::{FrameSignature, HARDWARE_CONFIG, HEAD_CONFIG, VELOCITY};
use crate::value::ParameterValue;
use serde::{Deserialize, Serialize};

/// Particle type of a velocity record.
pub const VELOCITY_PARTICLE: &str = "velpt_velocity_data";
/// Particle type of a hardware configuration block.
pub const HARDWARE_CONFIG_PARTICLE: &str = "velpt_hardware_configuration";
/// Particle type of a head configuration block.
pub const HEAD_CONFIG_PARTICLE: &str = "velpt_head_configuration";

/// How a field's bytes are interpreted.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Sync bytes; must equal the signature's sync pattern.
    Sync,
    /// Size word; must equal the frame length in words.
    Size,
    /// Decoded with a codec and emitted as-is.
    Value(Codec),
    /// Signed word multiplied by a scale factor.
    Fixed(f64),
    /// High byte of a value completed by a later [`FieldKind::Low`] field.
    High,
    /// Low word; emitted combined with the preceding high byte.
    Low,
    /// Padding, skipped.
    Spare,
    /// Trailing checksum word, verified over the whole frame.
    Checksum,
}

impl FieldKind {
    /// Width required by kinds that read their bytes directly.
    fn required_width(&self) -> Option<(&'static str, usize)> {
        match self {
            FieldKind::Size => Some(("size", 2)),
            FieldKind::High => Some(("pressure_high", 1)),
            FieldKind::Low => Some(("pressure_low", 2)),
            _ => None,
        }
    }
}

/// One fixed-width field of a layout.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub width: usize,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn new(name: &'static str, width: usize, kind: FieldKind) -> Self {
        Self { name, width, kind }
    }
}

/// Field layout of one particle type.
#[derive(Debug, Clone)]
pub struct SampleLayout {
    pub particle: &'static str,
    pub signature: FrameSignature,
    pub fields: &'static [FieldSpec],
}

impl SampleLayout {
    /// Sum of the field widths.
    pub fn width(&self) -> usize {
        self.fields.iter().map(|f| f.width).sum()
    }
}

/// One decoded field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleField {
    pub name: String,
    #[serde(flatten)]
    pub value: ParameterValue,
}

/// Named typed values decoded from one frame, in layout order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedSample {
    pub particle: String,
    pub fields: Vec<SampleField>,
}

impl DecodedSample {
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

const VELOCITY_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("sync", 2, FieldKind::Sync),
    FieldSpec::new("size", 2, FieldKind::Size),
    FieldSpec::new("date_time_string", 6, FieldKind::Value(codec::CLOCK)),
    FieldSpec::new("error_code", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("analog1", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("battery_voltage", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("sound_speed_analog2", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("heading", 2, FieldKind::Fixed(0.1)),
    FieldSpec::new("pitch", 2, FieldKind::Fixed(0.1)),
    FieldSpec::new("roll", 2, FieldKind::Fixed(0.1)),
    FieldSpec::new("pressure", 1, FieldKind::High),
    FieldSpec::new("status", 1, FieldKind::Value(codec::BYTE)),
    FieldSpec::new("pressure", 2, FieldKind::Low),
    FieldSpec::new("temperature", 2, FieldKind::Fixed(0.01)),
    FieldSpec::new("velocity_beam1", 2, FieldKind::Value(codec::SIGNED_WORD)),
    FieldSpec::new("velocity_beam2", 2, FieldKind::Value(codec::SIGNED_WORD)),
    FieldSpec::new("velocity_beam3", 2, FieldKind::Value(codec::SIGNED_WORD)),
    FieldSpec::new("amplitude_beam1", 1, FieldKind::Value(codec::BYTE)),
    FieldSpec::new("amplitude_beam2", 1, FieldKind::Value(codec::BYTE)),
    FieldSpec::new("amplitude_beam3", 1, FieldKind::Value(codec::BYTE)),
    FieldSpec::new("fill", 1, FieldKind::Spare),
    FieldSpec::new("checksum", 2, FieldKind::Checksum),
];

const HARDWARE_CONFIG_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("sync", 2, FieldKind::Sync),
    FieldSpec::new("size", 2, FieldKind::Size),
    FieldSpec::new("serial_number", 14, FieldKind::Value(codec::ASCII)),
    FieldSpec::new("config", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("board_frequency", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("pic_version", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("hardware_revision", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("recorder_size", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("status", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("spare", 12, FieldKind::Spare),
    FieldSpec::new("firmware_version", 4, FieldKind::Value(codec::ASCII)),
    FieldSpec::new("checksum", 2, FieldKind::Checksum),
];

const HEAD_CONFIG_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("sync", 2, FieldKind::Sync),
    FieldSpec::new("size", 2, FieldKind::Size),
    FieldSpec::new("config", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("head_frequency", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("head_type", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("head_serial_number", 12, FieldKind::Value(codec::ASCII)),
    FieldSpec::new("system_data", 176, FieldKind::Value(codec::RAW)),
    FieldSpec::new("spare", 22, FieldKind::Spare),
    FieldSpec::new("number_beams", 2, FieldKind::Value(codec::WORD)),
    FieldSpec::new("checksum", 2, FieldKind::Checksum),
];

/// Velocity record layout (42 bytes).
pub const VELOCITY_LAYOUT: SampleLayout = SampleLayout {
    particle: VELOCITY_PARTICLE,
    signature: VELOCITY,
    fields: VELOCITY_FIELDS,
};

/// Hardware configuration layout (48 bytes).
pub const HARDWARE_CONFIG_LAYOUT: SampleLayout = SampleLayout {
    particle: HARDWARE_CONFIG_PARTICLE,
    signature: HARDWARE_CONFIG,
    fields: HARDWARE_CONFIG_FIELDS,
};

/// Head configuration layout (224 bytes).
pub const HEAD_CONFIG_LAYOUT: SampleLayout = SampleLayout {
    particle: HEAD_CONFIG_PARTICLE,
    signature: HEAD_CONFIG,
    fields: HEAD_CONFIG_FIELDS,
};

/// Decodes frames into samples using a table of layouts.
#[derive(Debug, Clone)]
pub struct SampleExtractor {
    layouts: Vec<SampleLayout>,
}

impl SampleExtractor {
    pub fn new(layouts: Vec<SampleLayout>) -> Self {
        Self { layouts }
    }

    /// Extractor for every Aquadopp particle type.
    pub fn aquadopp() -> Self {
        Self::new(vec![VELOCITY_LAYOUT, HARDWARE_CONFIG_LAYOUT, HEAD_CONFIG_LAYOUT])
    }

    pub fn layouts(&self) -> &[SampleLayout] {
        &self.layouts
    }

    /// Returns the layout for frames of the given signature, if any.
    pub fn layout_for(&self, signature: &FrameSignature) -> Option<&SampleLayout> {
        self.layouts.iter().find(|l| l.signature == *signature)
    }

    /// Decodes `bytes` as a sample of `particle`.
    pub fn extract(&self, particle: &str, bytes: &[u8]) -> Result<DecodedSample, SampleError> {
        let layout = self
            .layouts
            .iter()
            .find(|l| l.particle == particle)
            .ok_or_else(|| SampleError::UnknownParticle(particle.to_string()))?;
        extract(layout, bytes)
    }

    /// Decodes a sieved frame by its signature. Returns `None` for frame
    /// types that carry no sample.
    pub fn extract_frame(&self, frame: &Frame) -> Option<Result<DecodedSample, SampleError>> {
        self.layout_for(&frame.signature)
            .map(|layout| extract(layout, &frame.bytes))
    }
}

/// Decodes `bytes` with `layout`.
pub fn extract(layout: &SampleLayout, bytes: &[u8]) -> Result<DecodedSample, SampleError> {
    let particle = layout.particle;
    let expected = layout.width();
    if bytes.len() != expected || expected != layout.signature.length {
        return Err(SampleError::LengthMismatch {
            particle: particle.to_string(),
            expected: layout.signature.length,
            actual: bytes.len(),
        });
    }

    let field_error = |field: &str, source: CodecError| SampleError::Field {
        particle: particle.to_string(),
        field: field.to_string(),
        source,
    };

    let mut fields = Vec::with_capacity(layout.fields.len());
    let mut high: Option<u8> = None;
    let mut pos = 0;

    for spec in layout.fields {
        let raw = &bytes[pos..pos + spec.width];
        pos += spec.width;

        if let Some((codec, width)) = spec.kind.required_width() {
            if raw.len() != width {
                return Err(field_error(
                    spec.name,
                    CodecError::Width {
                        codec,
                        expected: width,
                        actual: raw.len(),
                    },
                ));
            }
        }

        let value = match spec.kind {
            FieldKind::Sync => {
                if raw != layout.signature.sync {
                    return Err(SampleError::SyncMismatch {
                        particle: particle.to_string(),
                        expected: hex::encode(layout.signature.sync),
                        actual: hex::encode(raw),
                    });
                }
                continue;
            }
            FieldKind::Size => {
                let size = u16::from_be_bytes([raw[0], raw[1]]);
                if size != layout.signature.size_words() {
                    return Err(SampleError::SizeMismatch {
                        particle: particle.to_string(),
                        expected: layout.signature.size_words(),
                        actual: size,
                    });
                }
                continue;
            }
            FieldKind::Checksum => {
                if let Some((stored, computed)) = codec::frame_checksums(bytes) {
                    if stored != computed {
                        return Err(SampleError::ChecksumMismatch {
                            particle: particle.to_string(),
                            expected: computed,
                            actual: stored,
                        });
                    }
                }
                continue;
            }
            FieldKind::Spare => continue,
            FieldKind::High => {
                high = Some(raw[0]);
                continue;
            }
            FieldKind::Low => {
                let low = u16::from_be_bytes([raw[0], raw[1]]);
                ParameterValue::Int(codec::compose_pressure(high.take().unwrap_or(0), low))
            }
            FieldKind::Fixed(scale) => codec::decode_fixed(raw, scale)
                .map(ParameterValue::Float)
                .map_err(|e| field_error(spec.name, e))?,
            FieldKind::Value(c) => c.decode(raw).map_err(|e| field_error(spec.name, e))?,
        };

        fields.push(SampleField {
            name: spec.name.to_string(),
            value,
        });
    }

    Ok(DecodedSample {
        particle: particle.to_string(),
        fields,
    })
}
