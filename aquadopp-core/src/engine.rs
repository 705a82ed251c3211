//! Protocol engine - drives one instrument over one link.
//!
//! Every public operation is an [`Operation`] applied through the
//! [`TransitionTable`]: the table picks the action to run, and the table's
//! target state is entered only when that action succeeds.
//!
//! Command exchanges are half-duplex: write, then read until the instrument
//! acknowledges or the command timeout fires.

use crate::config::ProtocolConfig;
use crate::error::DriverError;
use crate::event::{DriverEvent, EventBroadcaster};
use crate::fsm::{Action, ConnectionState, ProtocolEvent, TransitionTable};
use crate::link::Connector;
use crate::param::{Block, ParameterDictionary, PendingWrite};
use crate::profile::DeviceProfile;
use aquadopp_protocol::codec;
use aquadopp_protocol::{
    Command, DecodedSample, Frame, FrameSieve, ParameterValue, ProtocolError, Reply,
    SampleExtractor, SieveSnapshot,
};
use bytes::{Buf, BytesMut};
use chrono::{NaiveDateTime, Timelike, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

/// Protocol engine for one instrument session.
pub struct InstrumentProtocol<C: Connector> {
    connector: C,
    link: Option<C::Link>,
    profile: DeviceProfile,
    dictionary: ParameterDictionary,
    sieve: FrameSieve,
    extractor: SampleExtractor,
    table: TransitionTable,
    state: ConnectionState,
    events: Arc<EventBroadcaster>,
    settings: ProtocolConfig,
    /// Last user configuration block read from, or accepted by, the
    /// instrument.
    user_config: Option<Vec<u8>>,
    /// Consecutive failed commands.
    failures: u32,
    rx: BytesMut,
    last_frame_at: Instant,
}

/// Arguments of one state machine event.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Connect,
    Disconnect,
    Get(Vec<String>),
    Set {
        values: BTreeMap<String, ParameterValue>,
        startup: bool,
    },
    StartSampling,
    StopSampling,
    EnterDirectAccess,
    ExecuteDirect(Vec<u8>),
    ExitDirectAccess(Vec<u8>),
    AcquireSample,
    AcquireStatus,
    ClockSync,
}

impl Operation {
    pub fn event(&self) -> ProtocolEvent {
        match self {
            Operation::Connect => ProtocolEvent::Connect,
            Operation::Disconnect => ProtocolEvent::Disconnect,
            Operation::Get(_) => ProtocolEvent::Get,
            Operation::Set { .. } => ProtocolEvent::Set,
            Operation::StartSampling => ProtocolEvent::StartSampling,
            Operation::StopSampling => ProtocolEvent::StopSampling,
            Operation::EnterDirectAccess => ProtocolEvent::EnterDirectAccess,
            Operation::ExecuteDirect(_) => ProtocolEvent::ExecuteDirect,
            Operation::ExitDirectAccess(_) => ProtocolEvent::ExitDirectAccess,
            Operation::AcquireSample => ProtocolEvent::AcquireSample,
            Operation::AcquireStatus => ProtocolEvent::AcquireStatus,
            Operation::ClockSync => ProtocolEvent::ClockSync,
        }
    }
}

/// Result of an applied [`Operation`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done,
    Values(BTreeMap<String, ParameterValue>),
    Committed(Vec<String>),
    Output(Vec<u8>),
    Sample(DecodedSample),
    Samples(Vec<DecodedSample>),
    Clock(NaiveDateTime),
}

impl Outcome {
    fn kind(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Values(_) => "values",
            Outcome::Committed(_) => "committed",
            Outcome::Output(_) => "output",
            Outcome::Sample(_) => "sample",
            Outcome::Samples(_) => "samples",
            Outcome::Clock(_) => "clock",
        }
    }

    fn unexpected(&self, event: ProtocolEvent) -> DriverError {
        DriverError::configuration(format!("'{}' produced a {} outcome", event, self.kind()))
    }
}

impl<C: Connector> InstrumentProtocol<C> {
    /// Creates an engine in `UNCONFIGURED`.
    pub fn new(
        connector: C,
        profile: DeviceProfile,
        settings: ProtocolConfig,
        events: Arc<EventBroadcaster>,
    ) -> Result<Self, DriverError> {
        let dictionary = profile.build_dictionary()?;
        let sieve = profile.sieve()?;
        let extractor = profile.extractor();
        Ok(Self {
            connector,
            link: None,
            profile,
            dictionary,
            sieve,
            extractor,
            table: TransitionTable::standard(),
            state: ConnectionState::Unconfigured,
            events,
            rx: BytesMut::with_capacity(settings.read_buffer_size),
            settings,
            user_config: None,
            failures: 0,
            last_frame_at: Instant::now(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn dictionary(&self) -> &ParameterDictionary {
        &self.dictionary
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    // =========================================================================
    // State machine
    // =========================================================================

    /// Runs `operation` through the transition table. The table's action is
    /// performed and, when it succeeds, the table's target state entered.
    pub async fn apply(&mut self, operation: Operation) -> Result<Outcome, DriverError> {
        let event = operation.event();
        let (next, action) = self.table.dispatch(self.state, event)?;
        tracing::trace!("{} in {}: {:?}", event, self.state, action);

        let outcome = match (action, operation) {
            (Action::Handshake, Operation::Connect) => {
                self.open().await?;
                Outcome::Done
            }
            (Action::Close, Operation::Disconnect) => {
                self.close().await;
                Outcome::Done
            }
            (Action::ReadShadow, Operation::Get(names)) => {
                Outcome::Values(self.read_shadow(&names)?)
            }
            (Action::WriteParameters, Operation::Set { values, startup }) => Outcome::Committed(
                self.write_parameters(values.into_iter().collect(), startup)
                    .await?,
            ),
            (Action::StartAutosample, Operation::StartSampling) => {
                self.start_autosample().await?;
                Outcome::Done
            }
            (Action::StopAutosample, Operation::StopSampling) => {
                self.stop_autosample().await?;
                Outcome::Done
            }
            (Action::OpenPassthrough, Operation::EnterDirectAccess) => {
                self.rx.clear();
                Outcome::Done
            }
            (Action::Passthrough, Operation::ExecuteDirect(bytes)) => {
                Outcome::Output(self.passthrough(&bytes).await?)
            }
            (Action::ClosePassthrough, Operation::ExitDirectAccess(bytes)) => {
                self.close_passthrough(&bytes).await?;
                Outcome::Done
            }
            (Action::AcquireSample, Operation::AcquireSample) => {
                Outcome::Sample(self.sample_once().await?)
            }
            (Action::AcquireStatus, Operation::AcquireStatus) => {
                Outcome::Samples(self.read_status().await?)
            }
            (Action::SyncClock, Operation::ClockSync) => Outcome::Clock(self.sync_clock().await?),
            (action, _) => {
                return Err(DriverError::configuration(format!(
                    "action {:?} cannot serve '{}'",
                    action, event
                )))
            }
        };

        self.transition(next);
        Ok(outcome)
    }

    fn transition(&mut self, to: ConnectionState) {
        if to == self.state {
            return;
        }
        let from = self.state;
        tracing::info!("{} -> {}", from, to);
        self.state = to;
        self.events.notify(DriverEvent::StateChanged { from, to });
    }

    /// Drops the link and enters `LOST_CONNECTION`, if `event` allows it
    /// from the current state.
    fn lose_link(&mut self, event: ProtocolEvent, reason: String) {
        let Ok((next, Action::ReportLost)) = self.table.dispatch(self.state, event) else {
            return;
        };
        tracing::warn!("Connection lost: {}", reason);
        self.link = None;
        self.failures = 0;
        self.events
            .notify(DriverEvent::error(&DriverError::ConnectionLost { reason }));
        self.transition(next);
    }

    fn record_failure(&mut self, err: &DriverError) {
        match err {
            DriverError::Io(_) | DriverError::ConnectionLost { .. } => {
                self.lose_link(ProtocolEvent::LinkFailed, err.to_string());
            }
            _ if err.is_link_failure() => {
                self.failures += 1;
                if self.failures >= self.settings.max_consecutive_failures {
                    self.lose_link(
                        ProtocolEvent::LinkFailed,
                        format!("{} consecutive command failures, last: {}", self.failures, err),
                    );
                }
            }
            _ => {}
        }
    }

    // =========================================================================
    // Command exchange
    // =========================================================================

    async fn write_link(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        let link = self.link.as_mut().ok_or(DriverError::NotConnected)?;
        link.write_all(bytes).await?;
        link.flush().await?;
        Ok(())
    }

    /// One write/read round trip. Returns the reply payload.
    ///
    /// While autosampling, frames still arriving ahead of the reply are
    /// routed as samples and the reply is only looked for behind the last
    /// of them.
    async fn exchange(&mut self, cmd: &Command) -> Result<Vec<u8>, DriverError> {
        let streaming = self.state == ConnectionState::Autosample;
        self.rx.clear();
        self.write_link(&cmd.bytes).await?;

        let timeout = self.settings.command_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            match cmd.scan(&self.rx) {
                Some(Reply::Ack { payload, consumed }) => {
                    let payload = self.rx[payload].to_vec();
                    self.rx.advance(consumed);
                    tracing::debug!("{} <- {}", cmd.name, hex::encode(&payload));
                    return Ok(payload);
                }
                Some(Reply::Nack { consumed }) => {
                    self.rx.advance(consumed);
                    return Err(ProtocolError::Nack {
                        command: cmd.name.to_string(),
                    }
                    .into());
                }
                None => {}
            }

            let filled = self.rx.len();
            self.rx.reserve(self.settings.read_buffer_size);
            let link = self.link.as_mut().ok_or(DriverError::NotConnected)?;
            let n = tokio::time::timeout_at(deadline, link.read_buf(&mut self.rx))
                .await
                .map_err(|_| DriverError::Timeout {
                    command: cmd.name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })??;
            if n == 0 {
                return Err(DriverError::ConnectionLost {
                    reason: "link closed by peer".to_string(),
                });
            }
            if streaming {
                let chunk = self.rx.split_off(filled);
                self.sift(&chunk);
            }
        }
    }

    /// Sends a command, retrying retryable failures. Failures count towards
    /// losing the connection.
    async fn command(&mut self, cmd: Command) -> Result<Vec<u8>, DriverError> {
        let attempts = self.settings.command_retries + 1;
        let mut attempt = 1;
        loop {
            tracing::debug!("{} -> {}", cmd.name, hex::encode(&cmd.bytes));
            match self.exchange(&cmd).await {
                Ok(payload) => {
                    self.failures = 0;
                    return Ok(payload);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!("{} failed (attempt {}/{}): {}", cmd.name, attempt, attempts, e);
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!("{} failed: {}", cmd.name, e);
                    self.record_failure(&e);
                    return Err(e);
                }
            }
        }
    }

    /// Reads until the instrument has been silent for the quiet period.
    async fn drain(&mut self) -> Result<Vec<u8>, DriverError> {
        let quiet = self.settings.direct_access_quiet();
        let link = self.link.as_mut().ok_or(DriverError::NotConnected)?;
        let mut out = BytesMut::new();
        loop {
            out.reserve(self.settings.read_buffer_size);
            match tokio::time::timeout(quiet, link.read_buf(&mut out)).await {
                Err(_) => return Ok(out.to_vec()),
                Ok(Ok(0)) => {
                    return Err(DriverError::ConnectionLost {
                        reason: "link closed by peer".to_string(),
                    })
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    // =========================================================================
    // Configuration read-back
    // =========================================================================

    fn publish_changes(&self, names: &[String]) {
        for name in names {
            if let Ok(Some(value)) = self.dictionary.get(name) {
                self.events.notify(DriverEvent::ParameterUpdated {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
        }
    }

    /// Reads identification, every configuration block, battery and clock
    /// into the dictionary. Returns the samples carried by the configuration
    /// frames.
    async fn read_configuration(&mut self) -> Result<Vec<DecodedSample>, DriverError> {
        let id = self.command(Command::read_id()).await?;
        let all = self.command(Command::get_all()).await?;
        let battery = self.command(Command::read_battery()).await?;
        let clock = self.command(Command::read_clock()).await?;

        let mut blocks = HashMap::new();
        let mut samples = Vec::new();
        let mut sieve = self.profile.sieve()?;
        for frame in sieve.feed(&all) {
            let Some(block) = self.profile.block_for(&frame.signature) else {
                continue;
            };
            if let Some((stored, computed)) = codec::frame_checksums(&frame.bytes) {
                if stored != computed {
                    let err = DriverError::Protocol(ProtocolError::ChecksumMismatch {
                        block: frame.signature.name.to_string(),
                        expected: computed,
                        actual: stored,
                    });
                    self.record_failure(&err);
                    return Err(err);
                }
            }
            match self.extractor.extract_frame(&frame) {
                Some(Ok(sample)) => samples.push(sample),
                Some(Err(e)) => self.events.notify(DriverEvent::error(&e.into())),
                None => {}
            }
            blocks.insert(block, frame.bytes);
        }

        for (_, block) in &self.profile.config_blocks {
            if !blocks.contains_key(block) {
                return Err(DriverError::unexpected(
                    "GA",
                    format!("reply has no {} block", block),
                ));
            }
        }

        let mut changed = Vec::new();
        for (block, raw) in &blocks {
            changed.extend(self.dictionary.decode_from(*block, raw)?);
        }
        changed.extend(self.dictionary.decode_from(Block::Identification, &id)?);
        changed.extend(self.dictionary.decode_from(Block::Battery, &battery)?);
        changed.extend(self.dictionary.decode_from(Block::Clock, &clock)?);

        if let Some(user) = blocks.get(&Block::UserConfig) {
            self.user_config = Some(user.to_vec());
        }
        changed.sort_by_key(|name| self.dictionary.position(name));
        self.publish_changes(&changed);
        Ok(samples)
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Opens the link, wakes the instrument and reads back its full
    /// configuration. On the first successful connect the startup parameter
    /// set is applied and immutable parameters are frozen.
    pub async fn connect(&mut self) -> Result<(), DriverError> {
        self.apply(Operation::Connect).await?;
        Ok(())
    }

    async fn open(&mut self) -> Result<(), DriverError> {
        tracing::info!("Connecting to {}", self.connector.describe());
        let link = self.connector.connect().await?;
        self.link = Some(link);
        self.failures = 0;
        self.rx.clear();

        if let Err(e) = self.handshake().await {
            tracing::warn!("Handshake failed: {}", e);
            self.link = None;
            return Err(e);
        }

        tracing::info!(
            "Connected to {}",
            self.dictionary
                .get("instrument_id")
                .ok()
                .flatten()
                .map(|v| v.to_string())
                .unwrap_or_else(|| self.profile.name.to_string())
        );
        Ok(())
    }

    async fn handshake(&mut self) -> Result<(), DriverError> {
        self.command(Command::wake()).await?;
        self.read_configuration().await?;

        if !self.dictionary.is_configured() {
            if self.settings.apply_startup_on_connect {
                let batch = self.startup_batch();
                tracing::debug!("Applying {} startup parameters", batch.len());
                self.write_parameters(batch, true).await?;
            }
            self.dictionary.mark_configured();
        }
        Ok(())
    }

    /// Startup defaults overlaid with configured overrides.
    fn startup_batch(&self) -> Vec<(String, ParameterValue)> {
        let mut batch: BTreeMap<String, ParameterValue> =
            self.dictionary.export_startup_set().into_iter().collect();
        for (name, value) in &self.settings.startup_values {
            batch.insert(name.clone(), value.clone());
        }
        batch.into_iter().collect()
    }

    /// Closes the link. Legal in every state.
    pub async fn disconnect(&mut self) -> Result<(), DriverError> {
        self.apply(Operation::Disconnect).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            // best effort: the peer may already be gone
            let _ = link.shutdown().await;
        }
        self.failures = 0;
        self.rx.clear();
        tracing::info!("Disconnected from {}", self.connector.describe());
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Current shadow values of `names`. Parameters the instrument has not
    /// reported yet are omitted.
    pub async fn get<S: AsRef<str>>(
        &mut self,
        names: &[S],
    ) -> Result<BTreeMap<String, ParameterValue>, DriverError> {
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        match self.apply(Operation::Get(names)).await? {
            Outcome::Values(values) => Ok(values),
            other => Err(other.unexpected(ProtocolEvent::Get)),
        }
    }

    fn read_shadow(
        &self,
        names: &[String],
    ) -> Result<BTreeMap<String, ParameterValue>, DriverError> {
        let mut out = BTreeMap::new();
        for name in names {
            if let Some(value) = self.dictionary.get(name)? {
                out.insert(name.clone(), value.clone());
            }
        }
        Ok(out)
    }

    pub fn get_all(&self) -> BTreeMap<String, ParameterValue> {
        self.dictionary.get_all()
    }

    /// Writes a batch of parameters. Returns the names committed.
    ///
    /// The whole batch is validated and translated first, so a rejected
    /// value writes nothing. Writes are then issued in declared order; a
    /// device failure aborts the batch and leaves earlier writes committed.
    pub async fn set(
        &mut self,
        values: BTreeMap<String, ParameterValue>,
        startup: bool,
    ) -> Result<Vec<String>, DriverError> {
        match self.apply(Operation::Set { values, startup }).await? {
            Outcome::Committed(names) => Ok(names),
            other => Err(other.unexpected(ProtocolEvent::Set)),
        }
    }

    fn prepare_writes(
        &self,
        batch: Vec<(String, ParameterValue)>,
        startup: bool,
    ) -> Result<Vec<PendingWrite>, DriverError> {
        let mut writes = Vec::with_capacity(batch.len());
        for (name, value) in batch {
            let descriptor = self
                .dictionary
                .descriptor(&name)
                .ok_or_else(|| DriverError::parameter(&name, "unknown parameter"))?;
            if startup && !descriptor.startup {
                return Err(DriverError::parameter(&name, "not a startup parameter"));
            }

            let value = self.profile.translate(&name, &value)?;
            let write = self.dictionary.set(&name, value)?;
            if write.block != Block::UserConfig {
                return Err(DriverError::parameter(
                    &name,
                    format!("lives in the {} block, which is not writable", write.block),
                ));
            }
            if self.dictionary.get(&name)? == Some(&write.value) {
                tracing::debug!("{} unchanged, skipping", name);
                continue;
            }
            writes.push(write);
        }
        writes.sort_by_key(|w| self.dictionary.position(&w.name));
        Ok(writes)
    }

    async fn write_parameters(
        &mut self,
        batch: Vec<(String, ParameterValue)>,
        startup: bool,
    ) -> Result<Vec<String>, DriverError> {
        let writes = self.prepare_writes(batch, startup)?;

        let mut committed = Vec::with_capacity(writes.len());
        for write in writes {
            if let Err(e) = self.send_write(&write).await {
                tracing::warn!("Setting {} failed after {:?}: {}", write.name, committed, e);
                return Err(DriverError::SetAborted {
                    parameter: write.name,
                    committed,
                    source: Box::new(e),
                });
            }
            tracing::info!("{} = {}", write.name, write.value);
            let name = write.name.clone();
            let value = write.value.clone();
            self.dictionary.commit(write);
            self.events.notify(DriverEvent::ParameterUpdated {
                name: name.clone(),
                value,
            });
            committed.push(name);
        }
        Ok(committed)
    }

    /// Sends the user configuration block with `write` applied and waits for
    /// the acknowledgement.
    async fn send_write(&mut self, write: &PendingWrite) -> Result<(), DriverError> {
        let mut block = self
            .user_config
            .clone()
            .ok_or_else(|| DriverError::unexpected("CC", "user configuration not read yet"))?;
        write.apply_to(&mut block)?;
        codec::seal(&mut block);

        self.command(Command::configure(&block)?).await?;
        self.user_config = Some(block);
        Ok(())
    }

    // =========================================================================
    // Autosample
    // =========================================================================

    /// Starts streaming measurements.
    pub async fn start_sampling(&mut self) -> Result<(), DriverError> {
        self.apply(Operation::StartSampling).await?;
        Ok(())
    }

    async fn start_autosample(&mut self) -> Result<(), DriverError> {
        self.command(Command::start_measurement()).await?;
        self.last_frame_at = Instant::now();

        // records may follow the acknowledgement in the same read
        let leftover = self.rx.split();
        if !leftover.is_empty() {
            self.route(&leftover);
        }
        Ok(())
    }

    /// Waits for the next chunk of the sample stream and routes it.
    ///
    /// Returns the number of samples emitted. Returns immediately when not
    /// sampling. A silent stream or a closed link enters `LOST_CONNECTION`.
    pub async fn poll_stream(&mut self) -> Result<usize, DriverError> {
        if self.state != ConnectionState::Autosample {
            return Ok(0);
        }
        let timeout = self.settings.sample_timeout();
        let deadline = self.last_frame_at + timeout;
        let link = self.link.as_mut().ok_or(DriverError::NotConnected)?;

        self.rx.clear();
        self.rx.reserve(self.settings.read_buffer_size);
        match tokio::time::timeout_at(deadline, link.read_buf(&mut self.rx)).await {
            Err(_) => {
                let err = DriverError::Timeout {
                    command: "autosample".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                self.lose_link(
                    ProtocolEvent::SampleTimeout,
                    format!("no frame for {} s", timeout.as_secs()),
                );
                Err(err)
            }
            Ok(Ok(0)) => {
                let reason = "link closed by peer".to_string();
                self.lose_link(ProtocolEvent::LinkFailed, reason.clone());
                Err(DriverError::ConnectionLost { reason })
            }
            Ok(Err(e)) => {
                self.lose_link(ProtocolEvent::LinkFailed, e.to_string());
                Err(e.into())
            }
            Ok(Ok(_)) => {
                let chunk = self.rx.split();
                Ok(self.route(&chunk))
            }
        }
    }

    /// Extracts one stream frame and emits the sample. Returns whether a
    /// sample was emitted.
    fn emit(events: &EventBroadcaster, extractor: &SampleExtractor, frame: &Frame) -> bool {
        match extractor.extract_frame(frame) {
            Some(Ok(sample)) => {
                events.notify(DriverEvent::SampleAvailable(sample));
                true
            }
            Some(Err(e)) => {
                tracing::warn!("Skipping {} frame at {}: {}", frame.signature.name, frame.offset, e);
                events.notify(DriverEvent::error(&e.into()));
                false
            }
            None => {
                tracing::debug!("Ignoring {} frame", frame.signature.name);
                false
            }
        }
    }

    /// Pushes stream bytes through the sieve and emits every sample.
    fn route(&mut self, data: &[u8]) -> usize {
        let mut emitted = 0;
        let mut frames = self.sieve.feed(data);
        for frame in &mut frames {
            self.last_frame_at = Instant::now();
            if Self::emit(&self.events, &self.extractor, &frame) {
                emitted += 1;
            }
        }
        if frames.discarded() > 0 {
            tracing::warn!("Discarded {} bytes of noise", frames.discarded());
        }
        emitted
    }

    /// Routes stream bytes that arrive while a reply is pending. Frames are
    /// emitted as samples; the noise behind the last frame is appended to
    /// `rx` for reply scanning.
    fn sift(&mut self, data: &[u8]) {
        let mut frames = self.sieve.sift(data);
        while let Some(frame) = frames.next() {
            // a reply never precedes a frame
            frames.take_noise();
            self.rx.clear();
            self.last_frame_at = Instant::now();
            Self::emit(&self.events, &self.extractor, &frame);
        }
        self.rx.extend_from_slice(&frames.take_noise());
    }

    /// Breaks the instrument out of autosample.
    pub async fn stop_sampling(&mut self) -> Result<(), DriverError> {
        self.apply(Operation::StopSampling).await?;
        Ok(())
    }

    async fn stop_autosample(&mut self) -> Result<(), DriverError> {
        self.command(Command::wake()).await?;

        let dropped = self.sieve.clear();
        if dropped > 0 {
            tracing::debug!("Dropped {} bytes of an unfinished frame", dropped);
        }
        Ok(())
    }

    /// Saves the sieve buffer for a later [`restore_stream`](Self::restore_stream).
    pub fn stream_snapshot(&self) -> SieveSnapshot {
        self.sieve.snapshot()
    }

    /// Resumes the sample stream from a snapshot.
    pub fn restore_stream(&mut self, snapshot: SieveSnapshot) {
        self.sieve.load_snapshot(snapshot);
    }

    // =========================================================================
    // Direct access
    // =========================================================================

    pub async fn enter_direct_access(&mut self) -> Result<(), DriverError> {
        self.apply(Operation::EnterDirectAccess).await?;
        Ok(())
    }

    /// Writes raw bytes and returns whatever the instrument answers before
    /// going quiet.
    pub async fn execute_direct(&mut self, bytes: &[u8]) -> Result<Vec<u8>, DriverError> {
        match self.apply(Operation::ExecuteDirect(bytes.to_vec())).await? {
            Outcome::Output(output) => Ok(output),
            other => Err(other.unexpected(ProtocolEvent::ExecuteDirect)),
        }
    }

    async fn passthrough(&mut self, bytes: &[u8]) -> Result<Vec<u8>, DriverError> {
        let result = match self.write_link(bytes).await {
            Ok(()) => self.drain().await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.record_failure(e);
        }
        result
    }

    /// Writes the final passthrough bytes, then returns to command mode and
    /// reads the configuration back, since it may have changed.
    pub async fn exit_direct_access(&mut self, passthrough: &[u8]) -> Result<(), DriverError> {
        self.apply(Operation::ExitDirectAccess(passthrough.to_vec()))
            .await?;
        Ok(())
    }

    async fn close_passthrough(&mut self, passthrough: &[u8]) -> Result<(), DriverError> {
        if !passthrough.is_empty() {
            let output = self.passthrough(passthrough).await?;
            tracing::debug!("Discarded {} bytes of output", output.len());
        }
        self.command(Command::wake()).await?;
        self.read_configuration().await?;
        Ok(())
    }

    // =========================================================================
    // One-shot commands
    // =========================================================================

    /// Acquires and emits a single sample.
    pub async fn acquire_sample(&mut self) -> Result<DecodedSample, DriverError> {
        match self.apply(Operation::AcquireSample).await? {
            Outcome::Sample(sample) => Ok(sample),
            other => Err(other.unexpected(ProtocolEvent::AcquireSample)),
        }
    }

    async fn sample_once(&mut self) -> Result<DecodedSample, DriverError> {
        let layout = self.profile.sample_layout.clone();
        let record = self.command(Command::acquire_sample(&layout)).await?;
        let sample = aquadopp_protocol::sample::extract(&layout, &record)?;

        self.events
            .notify(DriverEvent::SampleAvailable(sample.clone()));
        Ok(sample)
    }

    /// Re-reads the instrument status and configuration. The configuration
    /// frames are emitted as samples.
    pub async fn acquire_status(&mut self) -> Result<Vec<DecodedSample>, DriverError> {
        match self.apply(Operation::AcquireStatus).await? {
            Outcome::Samples(samples) => Ok(samples),
            other => Err(other.unexpected(ProtocolEvent::AcquireStatus)),
        }
    }

    async fn read_status(&mut self) -> Result<Vec<DecodedSample>, DriverError> {
        let samples = self.read_configuration().await?;
        for sample in &samples {
            self.events
                .notify(DriverEvent::SampleAvailable(sample.clone()));
        }
        Ok(samples)
    }

    /// Sets the instrument clock to the host's UTC time and returns the
    /// clock read back.
    pub async fn clock_sync(&mut self) -> Result<NaiveDateTime, DriverError> {
        match self.apply(Operation::ClockSync).await? {
            Outcome::Clock(clock) => Ok(clock),
            other => Err(other.unexpected(ProtocolEvent::ClockSync)),
        }
    }

    async fn sync_clock(&mut self) -> Result<NaiveDateTime, DriverError> {
        let now = Utc::now().naive_utc();
        let now = now.with_nanosecond(0).unwrap_or(now);

        self.command(Command::set_clock(&now)?).await?;
        let clock = self.command(Command::read_clock()).await?;
        let changed = self.dictionary.decode_from(Block::Clock, &clock)?;
        self.publish_changes(&changed);

        let synced = codec::clock_to_datetime(&clock).map_err(ProtocolError::from)?;
        tracing::info!("Clock synchronised to {}", synced);
        Ok(synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::*;
    use aquadopp_protocol::command::{BREAK, GET_ALL, READ_BATTERY, READ_CLOCK, READ_ID};
    use aquadopp_protocol::ACK;
    use tokio::sync::broadcast;

    fn drain_events(rx: &mut broadcast::Receiver<DriverEvent>) -> Vec<DriverEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn values(pairs: &[(&str, ParameterValue)]) -> BTreeMap<String, ParameterValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_connect_reads_configuration() {
        let (mut protocol, device) = mock_protocol();
        let mut rx = protocol.events().subscribe();

        protocol.connect().await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::Command);

        let got = protocol
            .get(&["instrument_id", "instrument_serial", "battery_voltage", "blanking_distance"])
            .await
            .unwrap();
        assert_eq!(got["instrument_id"], ParameterValue::from("AQD 8493"));
        assert_eq!(got["instrument_serial"], ParameterValue::from(SERIAL));
        assert_eq!(got["battery_voltage"], ParameterValue::Int(12_000));
        assert_eq!(got["blanking_distance"], ParameterValue::Int(49));
        assert_eq!(
            protocol.get(&["deployment_name"]).await.unwrap()["deployment_name"],
            ParameterValue::from("BAY01")
        );

        // defaults already match: nothing written
        assert_eq!(device.lock().configures, 0);
        assert!(protocol.dictionary().is_configured());

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            DriverEvent::ParameterUpdated { name, .. } if name == "firmware_version"
        )));
        assert_eq!(
            events.last(),
            Some(&DriverEvent::StateChanged {
                from: ConnectionState::Unconfigured,
                to: ConnectionState::Command
            })
        );
    }

    #[tokio::test]
    async fn test_connect_applies_startup_overrides() {
        let connector = DuplexConnector::new();
        let device = connector.device.clone();
        let mut settings = test_settings();
        settings
            .startup_values
            .insert("avg_interval".to_string(), ParameterValue::Int(60));
        let mut protocol = protocol_with(connector, settings);

        protocol.connect().await.unwrap();
        assert_eq!(device.lock().configures, 1);
        assert_eq!(device.lock().word_at(16), 60);
        assert_eq!(
            protocol.get(&["avg_interval"]).await.unwrap()["avg_interval"],
            ParameterValue::Int(60)
        );
    }

    #[tokio::test]
    async fn test_connect_refused_stays_unconfigured() {
        let (mut protocol, device) = mock_protocol();
        device.lock().refuse_connect = true;

        let err = protocol.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(protocol.state(), ConnectionState::Unconfigured);
    }

    #[tokio::test]
    async fn test_set_translates_and_commits() {
        let (mut protocol, device) = mock_protocol();
        protocol.connect().await.unwrap();
        let mut rx = protocol.events().subscribe();

        let committed = protocol
            .set(values(&[("blanking_distance", ParameterValue::Float(50.4))]), false)
            .await
            .unwrap();
        assert_eq!(committed, vec!["blanking_distance".to_string()]);
        assert_eq!(device.lock().word_at(6), 50);
        assert_eq!(
            drain_events(&mut rx),
            vec![DriverEvent::ParameterUpdated {
                name: "blanking_distance".into(),
                value: ParameterValue::Int(50)
            }]
        );

        // same value again: no traffic
        let before = device.lock().configures;
        let committed = protocol
            .set(values(&[("blanking_distance", ParameterValue::Int(50))]), false)
            .await
            .unwrap();
        assert!(committed.is_empty());
        assert_eq!(device.lock().configures, before);
    }

    #[tokio::test]
    async fn test_set_rejects_immutable_after_connect() {
        let (mut protocol, device) = mock_protocol();
        protocol.connect().await.unwrap();

        let err = protocol
            .set(
                values(&[
                    ("avg_interval", ParameterValue::Int(2)),
                    ("transmit_pulse_length", ParameterValue::Int(500)),
                ]),
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParameterError);
        assert_eq!(device.lock().configures, 0);
        assert!(!device.lock().commands.iter().any(|c| c == "CC"));
        assert_eq!(
            protocol.get(&["transmit_pulse_length", "avg_interval"]).await.unwrap(),
            values(&[
                ("avg_interval", ParameterValue::Int(1)),
                ("transmit_pulse_length", ParameterValue::Int(125)),
            ])
        );
    }

    #[tokio::test]
    async fn test_set_startup_requires_startup_flag() {
        let (mut protocol, _device) = mock_protocol();
        protocol.connect().await.unwrap();
        let err = protocol
            .set(values(&[("mode", ParameterValue::Int(1))]), true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a startup parameter"));
    }

    #[tokio::test]
    async fn test_set_batch_aborts_and_keeps_earlier_commits() {
        let (mut protocol, device) = mock_protocol();
        protocol.connect().await.unwrap();
        device.lock().accept_configures = Some(1);

        let err = protocol
            .set(
                values(&[
                    ("avg_interval", ParameterValue::Int(2)),
                    ("blanking_distance", ParameterValue::Int(40)),
                ]),
                false,
            )
            .await
            .unwrap_err();

        match &err {
            DriverError::SetAborted {
                parameter,
                committed,
                ..
            } => {
                assert_eq!(parameter, "avg_interval");
                assert_eq!(committed, &vec!["blanking_distance".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::ProtocolException);
        assert_eq!(protocol.state(), ConnectionState::Command);

        let got = protocol.get(&["avg_interval", "blanking_distance"]).await.unwrap();
        assert_eq!(got["blanking_distance"], ParameterValue::Int(40));
        assert_eq!(got["avg_interval"], ParameterValue::Int(1));
        assert_eq!(device.lock().word_at(6), 40);
        assert_eq!(device.lock().word_at(16), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_shadow_and_loses_connection() {
        let connector = DuplexConnector::new();
        let device = connector.device.clone();
        let mut settings = test_settings();
        settings.max_consecutive_failures = 1;
        let mut protocol = protocol_with(connector, settings);
        protocol.connect().await.unwrap();
        let mut rx = protocol.events().subscribe();

        device.lock().mute = true;
        let err = protocol
            .set(values(&[("avg_interval", ParameterValue::Int(5))]), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
        assert_eq!(
            protocol.get(&["avg_interval"]).await.unwrap()["avg_interval"],
            ParameterValue::Int(1)
        );
        assert_eq!(protocol.state(), ConnectionState::LostConnection);

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            DriverEvent::Error {
                kind: ErrorKind::ConnectionLost,
                ..
            }
        )));

        // reconnect does not re-apply the startup set
        device.lock().mute = false;
        protocol.connect().await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::Command);
        assert_eq!(device.lock().configures, 0);
    }

    #[tokio::test]
    async fn test_invalid_command_in_state() {
        let (mut protocol, _device) = mock_protocol();
        let err = protocol.start_sampling().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCommand);
        let err = protocol.set(BTreeMap::new(), false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCommand);
        assert!(protocol.get(&["blanking_distance"]).await.unwrap().is_empty());
        assert_eq!(protocol.state(), ConnectionState::Unconfigured);
    }

    #[tokio::test]
    async fn test_apply_runs_table_action() {
        let (mut protocol, _device) = mock_protocol();
        let err = protocol.apply(Operation::StartSampling).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCommand);

        assert_eq!(protocol.apply(Operation::Connect).await.unwrap(), Outcome::Done);
        assert_eq!(protocol.state(), ConnectionState::Command);

        match protocol
            .apply(Operation::Get(vec!["avg_interval".to_string()]))
            .await
            .unwrap()
        {
            Outcome::Values(values) => {
                assert_eq!(values["avg_interval"], ParameterValue::Int(1))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            protocol.apply(Operation::AcquireSample).await.unwrap(),
            Outcome::Sample(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_with_unset_deploy_clock() {
        let (mut protocol, device) = mock_protocol();
        {
            let mut dev = device.lock();
            dev.user_config[48..54].fill(0);
            codec::seal(&mut dev.user_config);
        }

        protocol.connect().await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::Command);
        assert_eq!(
            protocol.get(&["clock_deploy"]).await.unwrap()["clock_deploy"],
            ParameterValue::Bytes(vec![0; 6])
        );
    }

    async fn collect_samples(
        protocol: &mut InstrumentProtocol<DuplexConnector>,
        rx: &mut broadcast::Receiver<DriverEvent>,
        want: usize,
    ) -> (Vec<DecodedSample>, Vec<DriverEvent>) {
        let mut samples = Vec::new();
        let mut others = Vec::new();
        while samples.len() < want {
            for event in drain_events(rx) {
                match event {
                    DriverEvent::SampleAvailable(s) => samples.push(s),
                    other => others.push(other),
                }
            }
            if samples.len() < want {
                protocol.poll_stream().await.unwrap();
            }
        }
        (samples, others)
    }

    #[tokio::test]
    async fn test_autosample_streams_samples() {
        let (mut protocol, device) = mock_protocol();
        protocol.connect().await.unwrap();

        let first = velocity_record(100);
        let second = velocity_record(200);
        let mut noisy = b"\r\nnoise".to_vec();
        noisy.extend_from_slice(&second);
        device.lock().stream = vec![first[..10].to_vec(), first[10..].to_vec(), noisy];

        let mut rx = protocol.events().subscribe();
        protocol.start_sampling().await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::Autosample);

        let (samples, _) = collect_samples(&mut protocol, &mut rx, 2).await;
        let headings: Vec<f64> = samples
            .iter()
            .map(|s| s.get("heading").and_then(|v| v.as_float()).unwrap())
            .collect();
        assert!((headings[0] - 10.0).abs() < 1e-9);
        assert!((headings[1] - 20.0).abs() < 1e-9);

        // get stays legal while sampling
        assert!(protocol.get(&["avg_interval"]).await.is_ok());

        protocol.stop_sampling().await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::Command);
    }

    fn sample_count(events: &[DriverEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, DriverEvent::SampleAvailable(_)))
            .count()
    }

    #[tokio::test]
    async fn test_stop_sampling_finds_ack_behind_frames() {
        let (mut protocol, device) = mock_protocol();
        protocol.connect().await.unwrap();
        protocol.start_sampling().await.unwrap();

        // minute 06, second 06: the record carries ACK bytes
        let record = velocity_record_at(300, [0x06, 0x06, 0x22, 0x17, 0x13, 0x04]);
        let mut backlog = record.clone();
        backlog.extend_from_slice(&record);
        device.lock().break_backlog = backlog;

        let mut rx = protocol.events().subscribe();
        protocol.stop_sampling().await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::Command);
        assert_eq!(sample_count(&drain_events(&mut rx)), 2);
        assert_eq!(protocol.stream_snapshot().buffer, Vec::<u8>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_sampling_ignores_ack_bytes_in_stream() {
        let (mut protocol, device) = mock_protocol();
        protocol.connect().await.unwrap();
        protocol.start_sampling().await.unwrap();
        {
            let mut dev = device.lock();
            dev.ignore_break = true;
            // day 06, hour 06
            dev.break_backlog = velocity_record_at(300, [0x05, 0x09, 0x06, 0x06, 0x13, 0x04]);
        }

        let mut rx = protocol.events().subscribe();
        let err = protocol.stop_sampling().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
        assert_eq!(protocol.state(), ConnectionState::Autosample);
        assert_eq!(sample_count(&drain_events(&mut rx)), 1);

        // the late acknowledgement still stops the stream
        device.lock().ignore_break = false;
        protocol.stop_sampling().await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::Command);
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_reported_and_skipped() {
        let (mut protocol, device) = mock_protocol();
        protocol.connect().await.unwrap();

        let mut corrupt = velocity_record(100);
        corrupt[20] ^= 0xFF;
        device.lock().stream = vec![corrupt, velocity_record(300)];

        let mut rx = protocol.events().subscribe();
        protocol.start_sampling().await.unwrap();
        let (samples, others) = collect_samples(&mut protocol, &mut rx, 1).await;

        assert_eq!(samples.len(), 1);
        assert!(others.iter().any(|e| matches!(
            e,
            DriverEvent::Error {
                kind: ErrorKind::SampleError,
                ..
            }
        )));
        assert_eq!(protocol.state(), ConnectionState::Autosample);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_loses_connection() {
        let (mut protocol, _device) = mock_protocol();
        protocol.connect().await.unwrap();
        protocol.start_sampling().await.unwrap();

        let err = protocol.poll_stream().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimeoutError);
        assert_eq!(protocol.state(), ConnectionState::LostConnection);
        assert_eq!(protocol.poll_stream().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hangup_during_autosample() {
        let (mut protocol, device) = mock_protocol();
        protocol.connect().await.unwrap();
        device.lock().hangup_after_stream = true;

        protocol.start_sampling().await.unwrap();
        let err = loop {
            match protocol.poll_stream().await {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
        assert_eq!(protocol.state(), ConnectionState::LostConnection);
    }

    #[tokio::test]
    async fn test_stream_resumes_after_reconnect() {
        let (mut protocol, device) = mock_protocol();
        protocol.connect().await.unwrap();

        let record = velocity_record(450);
        device.lock().stream = vec![record[..7].to_vec()];
        protocol.start_sampling().await.unwrap();
        while protocol.stream_snapshot().buffer.len() < 7 {
            protocol.poll_stream().await.unwrap();
        }
        let snapshot = protocol.stream_snapshot();
        protocol.disconnect().await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::Unconfigured);

        let connector = DuplexConnector {
            device: device.clone(),
        };
        let mut resumed = protocol_with(connector, test_settings());
        resumed.restore_stream(snapshot);
        resumed.connect().await.unwrap();

        device.lock().stream = vec![record[7..].to_vec()];
        let mut rx = resumed.events().subscribe();
        resumed.start_sampling().await.unwrap();
        let (samples, _) = collect_samples(&mut resumed, &mut rx, 1).await;
        let heading = samples[0].get("heading").and_then(|v| v.as_float()).unwrap();
        assert!((heading - 45.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_direct_access_roundtrip() {
        let (mut protocol, device) = mock_protocol();
        protocol.connect().await.unwrap();

        protocol.enter_direct_access().await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::DirectAccess);
        assert!(protocol
            .set(values(&[("avg_interval", ParameterValue::Int(2))]), false)
            .await
            .is_err());

        let reply = protocol.execute_direct(b"ID").await.unwrap();
        assert!(reply.starts_with(INSTRUMENT_ID));

        // reconfigure behind the driver's back
        let mut block = device.lock().user_config.clone();
        block[16..18].copy_from_slice(&7u16.to_be_bytes());
        codec::seal(&mut block);
        let passthrough = Command::configure(&block).unwrap().bytes;

        let mut rx = protocol.events().subscribe();
        protocol.exit_direct_access(&passthrough).await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::Command);
        assert_eq!(
            protocol.get(&["avg_interval"]).await.unwrap()["avg_interval"],
            ParameterValue::Int(7)
        );
        assert!(drain_events(&mut rx).contains(&DriverEvent::ParameterUpdated {
            name: "avg_interval".into(),
            value: ParameterValue::Int(7)
        }));
    }

    #[tokio::test]
    async fn test_acquire_sample_and_status() {
        let (mut protocol, _device) = mock_protocol();
        protocol.connect().await.unwrap();

        let sample = protocol.acquire_sample().await.unwrap();
        assert_eq!(sample.particle, "velpt_velocity_data");

        let samples = protocol.acquire_status().await.unwrap();
        let particles: Vec<&str> = samples.iter().map(|s| s.particle.as_str()).collect();
        assert_eq!(
            particles,
            vec!["velpt_hardware_configuration", "velpt_head_configuration"]
        );
        assert_eq!(
            samples[0].get("serial_number"),
            Some(&ParameterValue::from(SERIAL))
        );
    }

    #[tokio::test]
    async fn test_clock_sync() {
        let (mut protocol, device) = mock_protocol();
        protocol.connect().await.unwrap();

        let before = Utc::now().naive_utc() - chrono::Duration::seconds(2);
        let synced = protocol.clock_sync().await.unwrap();
        assert!(synced >= before);
        assert_ne!(device.lock().clock, CLOCK);
        assert_eq!(
            protocol.get(&["clock"]).await.unwrap()["clock"],
            ParameterValue::Timestamp(synced)
        );
    }

    #[tokio::test]
    async fn test_disconnect_from_any_state() {
        let (mut protocol, _device) = mock_protocol();
        protocol.disconnect().await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::Unconfigured);

        protocol.connect().await.unwrap();
        protocol.start_sampling().await.unwrap();
        protocol.disconnect().await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::Unconfigured);
        // shadow survives the disconnect
        assert!(!protocol.get_all().is_empty());
    }

    /// Connector handing out one scripted link.
    struct ScriptConnector(parking_lot::Mutex<Option<tokio_test::io::Mock>>);

    impl Connector for ScriptConnector {
        type Link = tokio_test::io::Mock;

        async fn connect(&self) -> std::io::Result<tokio_test::io::Mock> {
            self.0.lock().take().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "script used")
            })
        }

        fn describe(&self) -> String {
            "script".to_string()
        }
    }

    #[tokio::test]
    async fn test_handshake_byte_exact() {
        let mut all = hardware_config_block();
        all.extend(head_config_block());
        all.extend(user_config_block());
        all.extend(ACK);

        let mut id = INSTRUMENT_ID.to_vec();
        id.extend(ACK);
        let mut battery = 12_000u16.to_be_bytes().to_vec();
        battery.extend(ACK);
        let mut clock = CLOCK.to_vec();
        clock.extend(ACK);

        let mut banner = b"\r\nNortek Aquadopp\r\nCommand mode\r\n".to_vec();
        banner.extend(ACK);

        let script = tokio_test::io::Builder::new()
            .write(BREAK)
            .read(&banner)
            .write(READ_ID)
            .read(&id)
            .write(GET_ALL)
            .read(&all)
            .write(READ_BATTERY)
            .read(&battery)
            .write(READ_CLOCK)
            .read(&clock)
            .build();

        let mut settings = test_settings();
        settings.apply_startup_on_connect = false;
        let mut protocol = InstrumentProtocol::new(
            ScriptConnector(parking_lot::Mutex::new(Some(script))),
            DeviceProfile::aquadopp().unwrap(),
            settings,
            Arc::new(EventBroadcaster::new(16)),
        )
        .unwrap();

        protocol.connect().await.unwrap();
        assert_eq!(protocol.state(), ConnectionState::Command);
        assert_eq!(
            protocol.get(&["number_bins"]).await.unwrap()["number_bins"],
            ParameterValue::Int(1)
        );
        protocol.disconnect().await.unwrap();
    }
}
