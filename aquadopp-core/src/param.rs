//! Parameter dictionary.
//!
//! A registry of [`ParameterDescriptor`]s, each owning a locator into one of
//! the instrument's response blocks, a codec and its metadata. The dictionary
//! also holds the shadow values: the last value decoded from, or
//! acknowledged by, the instrument.

use crate::error::DriverError;
use aquadopp_protocol::{Codec, ParameterValue};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A response block the instrument returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Block {
    UserConfig,
    HardwareConfig,
    HeadConfig,
    Identification,
    Battery,
    Clock,
}

impl Block {
    pub fn as_str(&self) -> &'static str {
        match self {
            Block::UserConfig => "user_config",
            Block::HardwareConfig => "hardware_config",
            Block::HeadConfig => "head_config",
            Block::Identification => "identification",
            Block::Battery => "battery",
            Block::Clock => "clock",
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a parameter lives in a block.
#[derive(Debug, Clone)]
pub enum Locator {
    /// Fixed byte range.
    Offset {
        block: Block,
        offset: usize,
        width: usize,
    },
    /// First match of a pattern anywhere in the block.
    Pattern { block: Block, regex: Regex },
}

impl Locator {
    pub fn offset(block: Block, offset: usize, width: usize) -> Self {
        Locator::Offset {
            block,
            offset,
            width,
        }
    }

    pub fn pattern(block: Block, pattern: &str) -> Result<Self, DriverError> {
        let regex = Regex::new(pattern)
            .map_err(|e| DriverError::configuration(format!("bad pattern '{}': {}", pattern, e)))?;
        Ok(Locator::Pattern { block, regex })
    }

    pub fn block(&self) -> Block {
        match self {
            Locator::Offset { block, .. } | Locator::Pattern { block, .. } => *block,
        }
    }

    /// Returns the bytes this locator addresses in `raw`.
    pub fn locate<'a>(&self, raw: &'a [u8]) -> Option<&'a [u8]> {
        match self {
            Locator::Offset { offset, width, .. } => raw.get(*offset..offset + width),
            Locator::Pattern { regex, .. } => regex.find(raw).map(|m| m.as_bytes()),
        }
    }
}

/// Who may change a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutability {
    ReadOnly,
    ReadWrite,
    /// Writable only until the instrument has been configured once.
    ImmutableAfterInit,
}

/// Accepted values beyond what the codec can represent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Domain {
    Any,
    IntRange { min: i64, max: i64 },
}

/// Declaration of one instrument parameter.
#[derive(Debug, Clone)]
pub struct ParameterDescriptor {
    pub name: String,
    pub locator: Locator,
    pub codec: Codec,
    pub mutability: Mutability,
    pub default: Option<ParameterValue>,
    pub units: Option<&'static str>,
    pub startup: bool,
    pub direct_access: bool,
    pub domain: Domain,
}

impl ParameterDescriptor {
    /// Creates a read-only descriptor with no default.
    pub fn new(name: impl Into<String>, locator: Locator, codec: Codec) -> Self {
        Self {
            name: name.into(),
            locator,
            codec,
            mutability: Mutability::ReadOnly,
            default: None,
            units: None,
            startup: false,
            direct_access: false,
            domain: Domain::Any,
        }
    }

    pub fn read_write(mut self) -> Self {
        self.mutability = Mutability::ReadWrite;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.mutability = Mutability::ImmutableAfterInit;
        self
    }

    pub fn default_value(mut self, value: impl Into<ParameterValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn units(mut self, units: &'static str) -> Self {
        self.units = Some(units);
        self
    }

    /// Marks the parameter as part of the startup set.
    pub fn startup(mut self) -> Self {
        self.startup = true;
        self
    }

    pub fn direct_access(mut self) -> Self {
        self.direct_access = true;
        self
    }

    pub fn domain(mut self, domain: Domain) -> Self {
        self.domain = domain;
        self
    }

    pub fn is_writable(&self) -> bool {
        self.mutability != Mutability::ReadOnly
    }

    /// Decodes this parameter from a raw block.
    pub fn decode(&self, raw: &[u8]) -> Result<ParameterValue, DriverError> {
        let bytes = self.locator.locate(raw).ok_or_else(|| DriverError::Decode {
            parameter: self.name.clone(),
            reason: format!("not found in {}-byte {} block", raw.len(), self.locator.block()),
        })?;
        self.codec.decode(bytes).map_err(|e| DriverError::Decode {
            parameter: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Encodes `value` to the bytes at this parameter's locator.
    pub fn encode(&self, value: &ParameterValue) -> Result<Vec<u8>, DriverError> {
        let width = match &self.locator {
            Locator::Offset { width, .. } => *width,
            Locator::Pattern { .. } => {
                return Err(DriverError::parameter(&self.name, "has no fixed location"))
            }
        };
        self.check_domain(value)?;
        self.codec
            .encode(value, width)
            .map_err(|e| DriverError::parameter(&self.name, e.to_string()))
    }

    fn check_domain(&self, value: &ParameterValue) -> Result<(), DriverError> {
        match self.domain {
            Domain::Any => Ok(()),
            Domain::IntRange { min, max } => match value.as_int() {
                Some(v) if (min..=max).contains(&v) => Ok(()),
                Some(v) => Err(DriverError::parameter(
                    &self.name,
                    format!("{} outside {}..={}", v, min, max),
                )),
                None => Err(DriverError::parameter(
                    &self.name,
                    format!("expected int, got {}", value.kind()),
                )),
            },
        }
    }
}

/// A validated write awaiting acknowledgement from the instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub name: String,
    pub value: ParameterValue,
    pub block: Block,
    pub offset: usize,
    pub bytes: Vec<u8>,
}

impl PendingWrite {
    /// Patches `raw` with the encoded bytes.
    pub fn apply_to(&self, raw: &mut [u8]) -> Result<(), DriverError> {
        let end = self.offset + self.bytes.len();
        let len = raw.len();
        let target = raw.get_mut(self.offset..end).ok_or_else(|| {
            DriverError::parameter(
                &self.name,
                format!("{}..{} outside {}-byte block", self.offset, end, len),
            )
        })?;
        target.copy_from_slice(&self.bytes);
        Ok(())
    }
}

/// Declared parameters and their shadow values.
#[derive(Debug, Clone, Default)]
pub struct ParameterDictionary {
    descriptors: Vec<ParameterDescriptor>,
    index: HashMap<String, usize>,
    values: HashMap<String, ParameterValue>,
    configured: bool,
}

impl ParameterDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor. Declaration order is the write order of
    /// batch sets.
    pub fn register(&mut self, descriptor: ParameterDescriptor) -> Result<(), DriverError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(DriverError::configuration(format!(
                "parameter '{}' registered twice",
                descriptor.name
            )));
        }
        if descriptor.is_writable() && matches!(descriptor.locator, Locator::Pattern { .. }) {
            return Err(DriverError::configuration(format!(
                "parameter '{}' is writable but located by pattern",
                descriptor.name
            )));
        }
        if let Some(default) = &descriptor.default {
            descriptor.encode(default).map_err(|e| {
                DriverError::configuration(format!(
                    "default of '{}' does not encode: {}",
                    descriptor.name, e
                ))
            })?;
        }

        self.index
            .insert(descriptor.name.clone(), self.descriptors.len());
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Decodes every parameter located in `block` from `raw`.
    ///
    /// Either all of them are stored or none is. Returns the names whose
    /// shadow value changed, in declared order.
    pub fn decode_from(&mut self, block: Block, raw: &[u8]) -> Result<Vec<String>, DriverError> {
        let decoded = self
            .descriptors
            .iter()
            .filter(|d| d.locator.block() == block)
            .map(|d| d.decode(raw).map(|v| (d.name.clone(), v)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut changed = Vec::new();
        for (name, value) in decoded {
            if self.values.get(&name) != Some(&value) {
                self.values.insert(name.clone(), value);
                changed.push(name);
            }
        }
        Ok(changed)
    }

    /// Validates and encodes a new value without changing the shadow.
    pub fn set(&self, name: &str, value: ParameterValue) -> Result<PendingWrite, DriverError> {
        let descriptor = self.descriptor_or_err(name)?;
        match descriptor.mutability {
            Mutability::ReadOnly => return Err(DriverError::parameter(name, "read-only")),
            Mutability::ImmutableAfterInit if self.configured => {
                return Err(DriverError::parameter(
                    name,
                    "immutable once the instrument is configured",
                ))
            }
            _ => {}
        }

        let bytes = descriptor.encode(&value)?;
        let (block, offset) = match &descriptor.locator {
            Locator::Offset { block, offset, .. } => (*block, *offset),
            Locator::Pattern { .. } => {
                return Err(DriverError::parameter(name, "has no fixed location"))
            }
        };
        Ok(PendingWrite {
            name: descriptor.name.clone(),
            value,
            block,
            offset,
            bytes,
        })
    }

    /// Stores an acknowledged write. Returns whether the shadow changed.
    pub fn commit(&mut self, write: PendingWrite) -> bool {
        let changed = self.values.get(&write.name) != Some(&write.value);
        self.values.insert(write.name, write.value);
        changed
    }

    /// Current shadow value; `None` if the instrument has not reported it.
    pub fn get(&self, name: &str) -> Result<Option<&ParameterValue>, DriverError> {
        self.descriptor_or_err(name)?;
        Ok(self.values.get(name))
    }

    /// Every known shadow value.
    pub fn get_all(&self) -> BTreeMap<String, ParameterValue> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Startup-flagged parameters with their defaults, in declared order.
    pub fn export_startup_set(&self) -> Vec<(String, ParameterValue)> {
        self.descriptors
            .iter()
            .filter(|d| d.startup)
            .filter_map(|d| d.default.clone().map(|v| (d.name.clone(), v)))
            .collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<&ParameterDescriptor> {
        self.index.get(name).map(|&i| &self.descriptors[i])
    }

    fn descriptor_or_err(&self, name: &str) -> Result<&ParameterDescriptor, DriverError> {
        self.descriptor(name)
            .ok_or_else(|| DriverError::parameter(name, "unknown parameter"))
    }

    /// Declaration index of `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ParameterDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Closes the window in which immutable parameters may be written.
    pub fn mark_configured(&mut self) {
        self.configured = true;
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }
}
