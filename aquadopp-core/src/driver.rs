//! Driver task and its host-facing handle.
//!
//! The protocol engine runs on a single task. Host operations are queued to
//! it over a channel and executed one at a time; while the instrument is
//! autosampling the task also pumps the sample stream between operations.

use crate::engine::InstrumentProtocol;
use crate::error::DriverError;
use crate::event::{DriverEvent, EventBroadcaster};
use crate::fsm::ConnectionState;
use crate::link::Connector;
use aquadopp_protocol::{DecodedSample, ParameterValue, SieveSnapshot};
use chrono::NaiveDateTime;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

type Responder<T> = oneshot::Sender<Result<T, DriverError>>;

/// Host operation queued to the driver task.
enum Request {
    Connect(Responder<()>),
    Disconnect(Responder<()>),
    Get(Vec<String>, Responder<BTreeMap<String, ParameterValue>>),
    GetAll(Responder<BTreeMap<String, ParameterValue>>),
    Set(BTreeMap<String, ParameterValue>, bool, Responder<Vec<String>>),
    StartSampling(Responder<()>),
    StopSampling(Responder<()>),
    EnterDirectAccess(Responder<()>),
    ExecuteDirect(Vec<u8>, Responder<Vec<u8>>),
    ExitDirectAccess(Vec<u8>, Responder<()>),
    AcquireSample(Responder<DecodedSample>),
    AcquireStatus(Responder<Vec<DecodedSample>>),
    ClockSync(Responder<NaiveDateTime>),
    Snapshot(Responder<SieveSnapshot>),
    RestoreStream(SieveSnapshot, Responder<()>),
    Shutdown(Responder<()>),
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Connect(_) => "connect",
            Request::Disconnect(_) => "disconnect",
            Request::Get(..) => "get",
            Request::GetAll(_) => "get_all",
            Request::Set(..) => "set",
            Request::StartSampling(_) => "start_sampling",
            Request::StopSampling(_) => "stop_sampling",
            Request::EnterDirectAccess(_) => "enter_direct_access",
            Request::ExecuteDirect(..) => "execute_direct",
            Request::ExitDirectAccess(..) => "exit_direct_access",
            Request::AcquireSample(_) => "acquire_sample",
            Request::AcquireStatus(_) => "acquire_status",
            Request::ClockSync(_) => "clock_sync",
            Request::Snapshot(_) => "snapshot",
            Request::RestoreStream(..) => "restore_stream",
            Request::Shutdown(_) => "shutdown",
        }
    }
}

/// Spawns driver tasks.
pub struct Driver;

impl Driver {
    /// Moves `protocol` onto a new task and returns a handle to it.
    pub fn spawn<C: Connector>(protocol: InstrumentProtocol<C>) -> DriverHandle {
        let (tx, rx) = mpsc::channel(32);
        let state = Arc::new(RwLock::new(protocol.state()));
        let events = protocol.events().clone();
        let task = tokio::spawn(run(protocol, rx, state.clone()));
        DriverHandle {
            tx,
            state,
            events,
            task: Arc::new(parking_lot::Mutex::new(Some(task))),
        }
    }
}

/// Outcome of one turn of the driver loop.
enum Step {
    Request(Request),
    Streamed,
    Closed,
}

async fn run<C: Connector>(
    mut protocol: InstrumentProtocol<C>,
    mut rx: mpsc::Receiver<Request>,
    state: Arc<RwLock<ConnectionState>>,
) {
    tracing::debug!("Driver task started");

    loop {
        let step = if protocol.state() == ConnectionState::Autosample {
            tokio::select! {
                biased;

                request = rx.recv() => request.map_or(Step::Closed, Step::Request),

                result = protocol.poll_stream() => {
                    if let Err(e) = result {
                        tracing::debug!("Sample stream ended: {}", e);
                    }
                    Step::Streamed
                }
            }
        } else {
            rx.recv().await.map_or(Step::Closed, Step::Request)
        };

        let running = match step {
            Step::Request(request) => handle(&mut protocol, request, &state).await,
            Step::Streamed => true,
            Step::Closed => {
                tracing::debug!("All driver handles dropped");
                let _ = protocol.disconnect().await;
                false
            }
        };
        *state.write() = protocol.state();
        if !running {
            break;
        }
    }

    tracing::debug!("Driver task stopped");
}

/// Replies to the host once the cached state is current.
struct Replier<'a> {
    name: &'static str,
    events: &'a EventBroadcaster,
    state: &'a RwLock<ConnectionState>,
}

impl Replier<'_> {
    /// Sends `result` to the host, reporting failures as error events too.
    fn send<T>(&self, now: ConnectionState, reply: Responder<T>, result: Result<T, DriverError>) {
        *self.state.write() = now;
        if let Err(e) = &result {
            tracing::debug!("{} failed: {}", self.name, e);
            self.events.notify(DriverEvent::error(e));
        }
        let _ = reply.send(result);
    }
}

/// Runs one host operation. Returns `false` once the driver should stop.
async fn handle<C: Connector>(
    protocol: &mut InstrumentProtocol<C>,
    request: Request,
    state: &RwLock<ConnectionState>,
) -> bool {
    let events = protocol.events().clone();
    let out = Replier {
        name: request.name(),
        events: &events,
        state,
    };
    match request {
        Request::Connect(reply) => {
            let result = protocol.connect().await;
            out.send(protocol.state(), reply, result);
        }
        Request::Disconnect(reply) => {
            let result = protocol.disconnect().await;
            out.send(protocol.state(), reply, result);
        }
        Request::Get(names, reply) => {
            let result = protocol.get(names.as_slice()).await;
            out.send(protocol.state(), reply, result);
        }
        Request::GetAll(reply) => out.send(protocol.state(), reply, Ok(protocol.get_all())),
        Request::Set(values, startup, reply) => {
            let result = protocol.set(values, startup).await;
            out.send(protocol.state(), reply, result);
        }
        Request::StartSampling(reply) => {
            let result = protocol.start_sampling().await;
            out.send(protocol.state(), reply, result);
        }
        Request::StopSampling(reply) => {
            let result = protocol.stop_sampling().await;
            out.send(protocol.state(), reply, result);
        }
        Request::EnterDirectAccess(reply) => {
            let result = protocol.enter_direct_access().await;
            out.send(protocol.state(), reply, result);
        }
        Request::ExecuteDirect(bytes, reply) => {
            let result = protocol.execute_direct(&bytes).await;
            out.send(protocol.state(), reply, result);
        }
        Request::ExitDirectAccess(bytes, reply) => {
            let result = protocol.exit_direct_access(&bytes).await;
            out.send(protocol.state(), reply, result);
        }
        Request::AcquireSample(reply) => {
            let result = protocol.acquire_sample().await;
            out.send(protocol.state(), reply, result);
        }
        Request::AcquireStatus(reply) => {
            let result = protocol.acquire_status().await;
            out.send(protocol.state(), reply, result);
        }
        Request::ClockSync(reply) => {
            let result = protocol.clock_sync().await;
            out.send(protocol.state(), reply, result);
        }
        Request::Snapshot(reply) => {
            out.send(protocol.state(), reply, Ok(protocol.stream_snapshot()))
        }
        Request::RestoreStream(snapshot, reply) => {
            protocol.restore_stream(snapshot);
            out.send(protocol.state(), reply, Ok(()))
        }
        Request::Shutdown(reply) => {
            let result = protocol.disconnect().await;
            out.send(protocol.state(), reply, result);
            return false;
        }
    }
    true
}

/// Cloneable handle to a running driver.
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::Sender<Request>,
    state: Arc<RwLock<ConnectionState>>,
    events: Arc<EventBroadcaster>,
    task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl DriverHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Responder<T>) -> Request,
    ) -> Result<T, DriverError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| DriverError::Stopped)?;
        rx.await.map_err(|_| DriverError::Stopped)?
    }

    /// State as of the last completed operation.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    pub async fn connect(&self) -> Result<(), DriverError> {
        self.request(Request::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), DriverError> {
        self.request(Request::Disconnect).await
    }

    pub async fn get(
        &self,
        names: &[&str],
    ) -> Result<BTreeMap<String, ParameterValue>, DriverError> {
        let names = names.iter().map(|s| s.to_string()).collect();
        self.request(|reply| Request::Get(names, reply)).await
    }

    pub async fn get_all(&self) -> Result<BTreeMap<String, ParameterValue>, DriverError> {
        self.request(Request::GetAll).await
    }

    pub async fn set(
        &self,
        values: BTreeMap<String, ParameterValue>,
        startup: bool,
    ) -> Result<Vec<String>, DriverError> {
        self.request(|reply| Request::Set(values, startup, reply))
            .await
    }

    pub async fn start_sampling(&self) -> Result<(), DriverError> {
        self.request(Request::StartSampling).await
    }

    pub async fn stop_sampling(&self) -> Result<(), DriverError> {
        self.request(Request::StopSampling).await
    }

    pub async fn enter_direct_access(&self) -> Result<(), DriverError> {
        self.request(Request::EnterDirectAccess).await
    }

    pub async fn execute_direct(&self, bytes: Vec<u8>) -> Result<Vec<u8>, DriverError> {
        self.request(|reply| Request::ExecuteDirect(bytes, reply))
            .await
    }

    pub async fn exit_direct_access(&self, passthrough: Vec<u8>) -> Result<(), DriverError> {
        self.request(|reply| Request::ExitDirectAccess(passthrough, reply))
            .await
    }

    pub async fn acquire_sample(&self) -> Result<DecodedSample, DriverError> {
        self.request(Request::AcquireSample).await
    }

    pub async fn acquire_status(&self) -> Result<Vec<DecodedSample>, DriverError> {
        self.request(Request::AcquireStatus).await
    }

    pub async fn clock_sync(&self) -> Result<NaiveDateTime, DriverError> {
        self.request(Request::ClockSync).await
    }

    /// Snapshot of the sample stream buffer.
    pub async fn stream_snapshot(&self) -> Result<SieveSnapshot, DriverError> {
        self.request(Request::Snapshot).await
    }

    /// Replaces the sample stream buffer, typically with a snapshot taken
    /// from an earlier session before reconnecting.
    pub async fn restore_stream(&self, snapshot: SieveSnapshot) -> Result<(), DriverError> {
        self.request(|reply| Request::RestoreStream(snapshot, reply))
            .await
    }

    /// Disconnects and stops the driver task. Later calls on any clone fail
    /// with [`DriverError::Stopped`].
    pub async fn shutdown(&self) -> Result<(), DriverError> {
        let result = self.request(Request::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        result
    }
}
