//! Device profiles.
//!
//! A profile is everything the generic engine needs to know about one
//! instrument variant: its frame signatures, sample layouts, parameter
//! table and per-parameter translation hooks.

use crate::error::DriverError;
use crate::param::{Block, Domain, Locator, ParameterDescriptor, ParameterDictionary};
use aquadopp_protocol::codec::{self, Codec};
use aquadopp_protocol::sample::{HARDWARE_CONFIG_LAYOUT, HEAD_CONFIG_LAYOUT, VELOCITY_LAYOUT};
use aquadopp_protocol::signature::{HARDWARE_CONFIG, HEAD_CONFIG, USER_CONFIG};
use aquadopp_protocol::{
    FrameSieve, FrameSignature, ParameterValue, SampleExtractor, SampleLayout, AQUADOPP_SIGNATURES,
};
use chrono::NaiveDateTime;
use std::collections::HashMap;

/// Converts a user-supplied value into the value the instrument stores.
pub type TranslateFn = fn(&str, &ParameterValue) -> Result<ParameterValue, DriverError>;

/// Format accepted for timestamps given as text.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Capabilities of one instrument variant.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub name: &'static str,
    pub signatures: Vec<FrameSignature>,
    pub layouts: Vec<SampleLayout>,
    pub descriptors: Vec<ParameterDescriptor>,
    /// Layout of records returned by the acquire-sample command.
    pub sample_layout: SampleLayout,
    /// Configuration frames returned by the get-all command.
    pub config_blocks: Vec<(FrameSignature, Block)>,
    hooks: HashMap<String, TranslateFn>,
}

impl DeviceProfile {
    /// Creates a profile with no parameters and no hooks.
    pub fn new(
        name: &'static str,
        signatures: Vec<FrameSignature>,
        layouts: Vec<SampleLayout>,
        sample_layout: SampleLayout,
    ) -> Self {
        Self {
            name,
            signatures,
            layouts,
            descriptors: Vec::new(),
            sample_layout,
            config_blocks: Vec::new(),
            hooks: HashMap::new(),
        }
    }

    pub fn with_parameter(mut self, descriptor: ParameterDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Installs a translation hook for `name`, replacing any existing one.
    pub fn with_hook(mut self, name: &str, hook: TranslateFn) -> Self {
        self.hooks.insert(name.to_string(), hook);
        self
    }

    /// Applies the translation hook of `name`; identity when none.
    pub fn translate(&self, name: &str, value: &ParameterValue) -> Result<ParameterValue, DriverError> {
        match self.hooks.get(name) {
            Some(hook) => hook(name, value),
            None => Ok(value.clone()),
        }
    }

    /// Builds a dictionary holding every declared parameter.
    pub fn build_dictionary(&self) -> Result<ParameterDictionary, DriverError> {
        let mut dict = ParameterDictionary::new();
        for descriptor in &self.descriptors {
            dict.register(descriptor.clone())?;
        }
        Ok(dict)
    }

    pub fn sieve(&self) -> Result<FrameSieve, DriverError> {
        Ok(FrameSieve::new(self.signatures.iter().copied())?)
    }

    pub fn extractor(&self) -> SampleExtractor {
        SampleExtractor::new(self.layouts.clone())
    }

    /// The Nortek Aquadopp current meter.
    pub fn aquadopp() -> Result<Self, DriverError> {
        let mut profile = Self::new(
            "aquadopp",
            AQUADOPP_SIGNATURES.to_vec(),
            vec![VELOCITY_LAYOUT, HARDWARE_CONFIG_LAYOUT, HEAD_CONFIG_LAYOUT],
            VELOCITY_LAYOUT,
        );
        profile.config_blocks = vec![
            (HARDWARE_CONFIG, Block::HardwareConfig),
            (HEAD_CONFIG, Block::HeadConfig),
            (USER_CONFIG, Block::UserConfig),
        ];

        for descriptor in user_config_parameters() {
            profile = profile.with_parameter(descriptor);
        }
        profile = profile
            .with_parameter(ParameterDescriptor::new(
                "instrument_serial",
                Locator::offset(Block::HardwareConfig, 4, 14),
                codec::ASCII,
            ))
            .with_parameter(ParameterDescriptor::new(
                "firmware_version",
                Locator::offset(Block::HardwareConfig, 42, 4),
                codec::ASCII,
            ))
            .with_parameter(ParameterDescriptor::new(
                "instrument_id",
                Locator::pattern(Block::Identification, r"AQD\s*[0-9]+")?,
                codec::ASCII,
            ))
            .with_parameter(
                ParameterDescriptor::new(
                    "battery_voltage",
                    Locator::offset(Block::Battery, 0, 2),
                    codec::WORD,
                )
                .units("mV"),
            )
            .with_parameter(ParameterDescriptor::new(
                "clock",
                Locator::offset(Block::Clock, 0, codec::CLOCK_WIDTH),
                codec::CLOCK,
            ));

        for name in [
            "transmit_pulse_length",
            "blanking_distance",
            "receive_length",
            "time_between_pings",
            "diagnostic_interval",
            "adjustment_sound_speed",
        ] {
            profile = profile.with_hook(name, round_to_counts);
        }
        Ok(profile.with_hook("clock_deploy", parse_timestamp))
    }

    /// Block carried by configuration frames of `signature`.
    pub fn block_for(&self, signature: &FrameSignature) -> Option<Block> {
        self.config_blocks
            .iter()
            .find(|(s, _)| s == signature)
            .map(|(_, b)| *b)
    }
}

fn user(name: &str, offset: usize, width: usize, codec: Codec) -> ParameterDescriptor {
    ParameterDescriptor::new(name, Locator::offset(Block::UserConfig, offset, width), codec)
}

fn word(name: &str, offset: usize) -> ParameterDescriptor {
    user(name, offset, 2, codec::WORD)
}

fn settable(descriptor: ParameterDescriptor) -> ParameterDescriptor {
    descriptor.startup().direct_access()
}

fn user_config_parameters() -> Vec<ParameterDescriptor> {
    let positive = Domain::IntRange {
        min: 1,
        max: u16::MAX as i64,
    };
    vec![
        settable(word("transmit_pulse_length", 4).immutable().default_value(125i64)),
        settable(word("blanking_distance", 6).read_write().default_value(49i64)),
        settable(word("receive_length", 8).immutable().default_value(32i64)),
        settable(word("time_between_pings", 10).immutable().default_value(437i64)),
        settable(
            word("time_between_burst_sequences", 12)
                .immutable()
                .default_value(512i64),
        ),
        settable(
            word("number_pings", 14)
                .immutable()
                .default_value(1i64)
                .domain(positive),
        ),
        settable(
            word("avg_interval", 16)
                .read_write()
                .default_value(1i64)
                .units("s")
                .domain(positive),
        ),
        word("user_number_beams", 18),
        word("timing_controller_mode", 20),
        settable(word("power_control_register", 22).immutable().default_value(0i64)),
        settable(
            word("compass_update_rate", 30)
                .read_write()
                .default_value(1i64)
                .units("s")
                .domain(positive),
        ),
        word("coordinate_system", 32),
        word("number_bins", 34),
        settable(word("bin_length", 36).immutable().default_value(7i64)),
        settable(
            word("measurement_interval", 38)
                .read_write()
                .default_value(1i64)
                .units("s")
                .domain(positive),
        ),
        user("deployment_name", 40, 6, codec::ASCII),
        settable(
            word("wrap_mode", 46)
                .immutable()
                .default_value(0i64)
                .domain(Domain::IntRange { min: 0, max: 1 }),
        ),
        settable(
            user("clock_deploy", 48, codec::CLOCK_WIDTH, codec::DEPLOY_CLOCK).immutable(),
        ),
        settable(
            user("diagnostic_interval", 54, 4, codec::DOUBLE_WORD)
                .immutable()
                .default_value(11250i64)
                .units("s"),
        ),
        word("mode", 58),
        settable(
            word("adjustment_sound_speed", 60)
                .immutable()
                .default_value(1525i64)
                .units("m/s"),
        ),
        settable(
            word("number_samples_diagnostic", 62)
                .immutable()
                .default_value(20i64),
        ),
        word("number_beams_cell_diagnostic", 64),
        word("number_pings_diagnostic", 66),
        word("mode_test", 68),
        settable(word("analog_input_addr", 70).immutable().default_value(0i64)),
        settable(word("sw_version", 72).immutable().default_value(13902i64)),
        user("velocity_adj_table", 76, 180, codec::RAW),
        user("comments", 256, 180, codec::ASCII),
        settable(word("wave_measurement_mode", 436).immutable().default_value(0i64)),
        settable(word("dyn_percentage_position", 438).immutable().default_value(0i64)),
        settable(word("wave_transmit_pulse", 440).immutable().default_value(0i64)),
        settable(word("wave_blanking_distance", 442).immutable().default_value(0i64)),
        settable(word("wave_cell_size", 444).immutable().default_value(0i64)),
        settable(word("number_diag_samples", 446).immutable().default_value(0i64)),
        settable(
            word("number_samples_per_burst", 452)
                .immutable()
                .default_value(0i64),
        ),
        user("user_2_spare", 454, 2, codec::RAW),
        settable(word("analog_output_scale", 456).immutable().default_value(0i64)),
    ]
}

/// Rounds a float to the nearest instrument count. Ints pass through.
fn round_to_counts(name: &str, value: &ParameterValue) -> Result<ParameterValue, DriverError> {
    match value {
        ParameterValue::Int(_) => Ok(value.clone()),
        ParameterValue::Float(f) if f.is_finite() => Ok(ParameterValue::Int(f.round() as i64)),
        other => Err(DriverError::parameter(
            name,
            format!("expected a number, got {} '{}'", other.kind(), other),
        )),
    }
}

/// Accepts a timestamp, or text in [`TIMESTAMP_FORMAT`].
fn parse_timestamp(name: &str, value: &ParameterValue) -> Result<ParameterValue, DriverError> {
    match value {
        ParameterValue::Timestamp(_) | ParameterValue::Bytes(_) => Ok(value.clone()),
        ParameterValue::Text(s) => NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT)
            .map(ParameterValue::Timestamp)
            .map_err(|e| DriverError::parameter(name, format!("'{}': {}", s, e))),
        other => Err(DriverError::parameter(
            name,
            format!("expected a timestamp, got {}", other.kind()),
        )),
    }
}
