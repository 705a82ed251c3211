//! In-process Aquadopp simulator for protocol tests.

use crate::config::ProtocolConfig;
use crate::event::EventBroadcaster;
use crate::link::Connector;
use crate::param::Block;
use crate::profile::DeviceProfile;
use crate::InstrumentProtocol;
use aquadopp_protocol::codec;
use aquadopp_protocol::command::{
    ACQUIRE_SAMPLE, BREAK, CONFIGURE, GET_ALL, READ_BATTERY, READ_CLOCK, READ_ID, SET_CLOCK,
    START_MEASUREMENT,
};
use aquadopp_protocol::signature::{HARDWARE_CONFIG, HEAD_CONFIG, USER_CONFIG, VELOCITY};
use aquadopp_protocol::{ACK, NACK};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub(crate) const INSTRUMENT_ID: &[u8; 14] = b"AQD 8493      ";
pub(crate) const SERIAL: &str = "AQD 8493";
pub(crate) const CLOCK: [u8; 6] = [0x05, 0x09, 0x22, 0x17, 0x13, 0x04];

/// Simulated instrument state, shared by every connection to it.
#[derive(Debug)]
pub(crate) struct MockDevice {
    pub user_config: Vec<u8>,
    pub hardware_config: Vec<u8>,
    pub head_config: Vec<u8>,
    pub battery_mv: u16,
    pub clock: [u8; 6],
    /// Never answer anything.
    pub mute: bool,
    /// Number of `CC` commands accepted before every later one is NACKed.
    pub accept_configures: Option<usize>,
    /// Chunks written after the `SD` acknowledgement.
    pub stream: Vec<Vec<u8>>,
    /// Close the link after writing the stream.
    pub hangup_after_stream: bool,
    /// Stream bytes still in flight when the next break arrives. Written
    /// ahead of the break's reply.
    pub break_backlog: Vec<u8>,
    /// Keep streaming through a break without acknowledging it.
    pub ignore_break: bool,
    pub refuse_connect: bool,
    pub configures: usize,
    pub commands: Vec<String>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            user_config: user_config_block(),
            hardware_config: hardware_config_block(),
            head_config: head_config_block(),
            battery_mv: 12_000,
            clock: CLOCK,
            mute: false,
            accept_configures: None,
            stream: Vec::new(),
            hangup_after_stream: false,
            break_backlog: Vec::new(),
            ignore_break: false,
            refuse_connect: false,
            configures: 0,
            commands: Vec::new(),
        }
    }

    pub fn word_at(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.user_config[offset], self.user_config[offset + 1]])
    }
}

/// A sealed user configuration block holding every startup default.
pub(crate) fn user_config_block() -> Vec<u8> {
    let profile = DeviceProfile::aquadopp().unwrap();
    let dict = profile.build_dictionary().unwrap();

    let mut block = vec![0u8; USER_CONFIG.length];
    block[..2].copy_from_slice(USER_CONFIG.sync);
    block[2..4].copy_from_slice(&USER_CONFIG.size_words().to_be_bytes());
    for (name, value) in dict.export_startup_set() {
        dict.set(&name, value).unwrap().apply_to(&mut block).unwrap();
    }
    block[18..20].copy_from_slice(&3u16.to_be_bytes()); // user_number_beams
    block[34..36].copy_from_slice(&1u16.to_be_bytes()); // number_bins
    block[40..46].copy_from_slice(b"BAY01\0");
    block[48..54].copy_from_slice(&CLOCK); // clock_deploy
    codec::seal(&mut block);
    block
}

pub(crate) fn hardware_config_block() -> Vec<u8> {
    let mut block = vec![0u8; HARDWARE_CONFIG.length];
    block[..2].copy_from_slice(HARDWARE_CONFIG.sync);
    block[2..4].copy_from_slice(&HARDWARE_CONFIG.size_words().to_be_bytes());
    block[4..18].copy_from_slice(INSTRUMENT_ID);
    block[20..22].copy_from_slice(&2000u16.to_be_bytes());
    block[42..46].copy_from_slice(b"3.37");
    codec::seal(&mut block);
    block
}

pub(crate) fn head_config_block() -> Vec<u8> {
    let mut block = vec![0u8; HEAD_CONFIG.length];
    block[..2].copy_from_slice(HEAD_CONFIG.sync);
    block[2..4].copy_from_slice(&HEAD_CONFIG.size_words().to_be_bytes());
    block[6..8].copy_from_slice(&2000u16.to_be_bytes());
    block[10..18].copy_from_slice(b"A3L 5297");
    block[220..222].copy_from_slice(&3u16.to_be_bytes());
    codec::seal(&mut block);
    block
}

/// A sealed velocity record with a recognisable heading.
pub(crate) fn velocity_record(heading_tenths: i16) -> Vec<u8> {
    velocity_record_at(heading_tenths, CLOCK)
}

pub(crate) fn velocity_record_at(heading_tenths: i16, clock: [u8; 6]) -> Vec<u8> {
    let mut f = vec![0u8; VELOCITY.length];
    f[..2].copy_from_slice(VELOCITY.sync);
    f[2..4].copy_from_slice(&VELOCITY.size_words().to_be_bytes());
    f[4..10].copy_from_slice(&clock);
    f[14..16].copy_from_slice(&120u16.to_be_bytes());
    f[16..18].copy_from_slice(&15250u16.to_be_bytes());
    f[18..20].copy_from_slice(&heading_tenths.to_be_bytes());
    f[28..30].copy_from_slice(&1850i16.to_be_bytes());
    codec::seal(&mut f);
    f
}

struct Step {
    consumed: usize,
    reply: Vec<u8>,
    stream: Vec<Vec<u8>>,
    hangup: bool,
}

impl Step {
    fn reply(consumed: usize, reply: Vec<u8>) -> Self {
        Self {
            consumed,
            reply,
            stream: Vec::new(),
            hangup: false,
        }
    }
}

fn with_ack(mut payload: Vec<u8>) -> Vec<u8> {
    payload.extend_from_slice(&ACK);
    payload
}

fn respond(device: &Mutex<MockDevice>, buf: &[u8]) -> Option<Step> {
    let mut dev = device.lock();

    if buf.first() == Some(&b'@') {
        if buf.starts_with(BREAK) {
            dev.commands.push("break".to_string());
            if dev.mute {
                return Some(Step::reply(BREAK.len(), Vec::new()));
            }
            let mut reply = std::mem::take(&mut dev.break_backlog);
            if !dev.ignore_break {
                reply.extend_from_slice(&ACK);
            }
            return Some(Step::reply(BREAK.len(), reply));
        }
        if BREAK.starts_with(buf) {
            return None;
        }
    }
    if buf.len() < 2 {
        return None;
    }

    let op = &buf[..2];
    let needed = match op {
        _ if op == SET_CLOCK => 2 + codec::CLOCK_WIDTH,
        _ if op == CONFIGURE => 2 + USER_CONFIG.length,
        _ => 2,
    };
    if buf.len() < needed {
        return None;
    }

    let name = String::from_utf8_lossy(op).to_string();
    if dev.mute {
        dev.commands.push(name);
        return Some(Step::reply(needed, Vec::new()));
    }

    let step = match op {
        _ if op == READ_ID => Step::reply(2, with_ack(INSTRUMENT_ID.to_vec())),
        _ if op == GET_ALL => {
            let mut all = dev.hardware_config.clone();
            all.extend_from_slice(&dev.head_config);
            all.extend_from_slice(&dev.user_config);
            Step::reply(2, with_ack(all))
        }
        _ if op == READ_BATTERY => Step::reply(2, with_ack(dev.battery_mv.to_be_bytes().to_vec())),
        _ if op == READ_CLOCK => Step::reply(2, with_ack(dev.clock.to_vec())),
        _ if op == SET_CLOCK => {
            dev.clock.copy_from_slice(&buf[2..8]);
            Step::reply(needed, ACK.to_vec())
        }
        _ if op == CONFIGURE => {
            let accept = dev.accept_configures.map_or(true, |n| dev.configures < n);
            let valid = matches!(codec::frame_checksums(&buf[2..needed]), Some((s, c)) if s == c);
            if accept && valid {
                dev.user_config = buf[2..needed].to_vec();
                dev.configures += 1;
                Step::reply(needed, ACK.to_vec())
            } else {
                Step::reply(needed, NACK.to_vec())
            }
        }
        _ if op == START_MEASUREMENT => Step {
            consumed: 2,
            reply: ACK.to_vec(),
            stream: std::mem::take(&mut dev.stream),
            hangup: dev.hangup_after_stream,
        },
        _ if op == ACQUIRE_SAMPLE => Step::reply(2, with_ack(velocity_record(1234))),
        // anything else is line noise
        _ => {
            return Some(Step::reply(1, Vec::new()));
        }
    };
    dev.commands.push(name);
    Some(step)
}

async fn serve(mut io: DuplexStream, device: Arc<Mutex<MockDevice>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = match io.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some(step) = respond(&device, &buf) {
            buf.drain(..step.consumed);
            if !step.reply.is_empty() && io.write_all(&step.reply).await.is_err() {
                return;
            }
            for part in step.stream {
                if io.write_all(&part).await.is_err() {
                    return;
                }
                tokio::task::yield_now().await;
            }
            if step.hangup {
                return;
            }
        }
    }
}

/// Connects to a [`MockDevice`] over an in-memory duplex pipe.
#[derive(Clone)]
pub(crate) struct DuplexConnector {
    pub device: Arc<Mutex<MockDevice>>,
}

impl DuplexConnector {
    pub fn new() -> Self {
        Self {
            device: Arc::new(Mutex::new(MockDevice::new())),
        }
    }
}

impl Connector for DuplexConnector {
    type Link = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        if self.device.lock().refuse_connect {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        let (client, server) = tokio::io::duplex(8192);
        tokio::spawn(serve(server, self.device.clone()));
        Ok(client)
    }

    fn describe(&self) -> String {
        "duplex://mock".to_string()
    }
}

/// Settings with short timeouts for tests.
pub(crate) fn test_settings() -> ProtocolConfig {
    ProtocolConfig {
        command_timeout_ms: 200,
        sample_timeout_secs: 5,
        direct_access_quiet_ms: 50,
        ..ProtocolConfig::default()
    }
}

pub(crate) fn protocol_with(
    connector: DuplexConnector,
    settings: ProtocolConfig,
) -> InstrumentProtocol<DuplexConnector> {
    InstrumentProtocol::new(
        connector,
        DeviceProfile::aquadopp().unwrap(),
        settings,
        Arc::new(EventBroadcaster::new(256)),
    )
    .unwrap()
}

/// A protocol against a fresh simulator, plus a handle on the simulator.
pub(crate) fn mock_protocol() -> (InstrumentProtocol<DuplexConnector>, Arc<Mutex<MockDevice>>) {
    let connector = DuplexConnector::new();
    let device = connector.device.clone();
    (protocol_with(connector, test_settings()), device)
}

#[test]
fn test_mock_blocks_are_sealed() {
    for block in [
        user_config_block(),
        hardware_config_block(),
        head_config_block(),
        velocity_record(0),
    ] {
        let (stored, computed) = codec::frame_checksums(&block).unwrap();
        assert_eq!(stored, computed);
    }
    let dict = DeviceProfile::aquadopp().unwrap().build_dictionary().unwrap();
    assert!(dict.descriptors().any(|d| d.locator.block() == Block::UserConfig));
}
