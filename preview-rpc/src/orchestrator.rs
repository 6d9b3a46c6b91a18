//! Orchestrator - owns the preview listener, the worker process and request dispatch.
//!
//! Flow:
//! 1. Bind an ephemeral loopback port and accept worker connections
//! 2. Each accepted connection waits for ATTACH on its own task; the one that
//!    attaches becomes current and the previous one is closed along with its
//!    sender/receiver tasks
//! 3. `request_preview` spawns the worker if needed and replaces the pending request
//! 4. Sender task moves pending -> in-flight and ships it to the worker
//! 5. Receiver task matches the FRAME reply to the in-flight request
//!
//! At most one request is in flight, so a reply is matched by size alone.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Command, CommandKind, ProtocolError};
use crate::bridge::transport::{Connection, TransportError, bind_loopback};
use crate::worker::WORKER_ENTRY;

/// Invoked on the receiver task with the pixels of a fulfilled request.
pub type FrameCallback = Box<dyn FnOnce(Bytes) + Send>;

/// Arguments of one preview request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRequest {
    /// Runtime used to launch the worker.
    pub runtime_path: PathBuf,
    /// Classpath of the worker itself.
    pub worker_classpath: String,
    /// Classpath the worker loads the render entry point from.
    pub classpath: String,
    pub target: String,
    pub width: u32,
    pub height: u32,
}

impl PreviewRequest {
    pub fn new(
        runtime_path: impl Into<PathBuf>,
        worker_classpath: impl Into<String>,
        classpath: impl Into<String>,
        target: impl Into<String>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            runtime_path: runtime_path.into(),
            worker_classpath: worker_classpath.into(),
            classpath: classpath.into(),
            target: target.into(),
            width,
            height,
        }
    }
}

/// Launch parameters handed to a [`WorkerSpawner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLaunch {
    pub runtime_path: PathBuf,
    pub worker_classpath: String,
    pub entry: String,
    pub port: u16,
}

impl WorkerLaunch {
    /// `-cp <workerClasspath> <entry> <port>`
    pub fn args(&self) -> Vec<String> {
        vec![
            "-cp".to_string(),
            self.worker_classpath.clone(),
            self.entry.clone(),
            self.port.to_string(),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Handle to a spawned worker.
pub trait WorkerProcess: Send {
    fn has_exited(&mut self) -> bool;

    /// Force-terminates the worker. Must not block.
    fn kill(&mut self);
}

impl WorkerProcess for Child {
    fn has_exited(&mut self) -> bool {
        match self.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(%status, "Preview worker has exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll preview worker, assuming it exited");
                true
            }
        }
    }

    fn kill(&mut self) {
        if let Err(e) = self.start_kill() {
            tracing::trace!(error = %e, "Preview worker already gone");
        }
    }
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Box<dyn WorkerProcess>, SpawnError>;
}

/// Launches `<runtime> -cp <workerClasspath> <entry> <port>` with inherited stdout/stderr.
pub struct ProcessSpawner;

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, launch: &WorkerLaunch) -> Result<Box<dyn WorkerProcess>, SpawnError> {
        let child = ProcessCommand::new(&launch.runtime_path)
            .args(launch.args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        tracing::info!(
            pid = child.id(),
            runtime = %launch.runtime_path.display(),
            port = launch.port,
            "Spawned preview worker"
        );
        Ok(Box::new(child))
    }
}

pub struct OrchestratorConfig {
    pub worker_entry: String,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self {
            worker_entry: WORKER_ENTRY.to_string(),
            spawner: Arc::new(ProcessSpawner),
        }
    }

    pub fn with_worker_entry(mut self, entry: impl Into<String>) -> Self {
        self.worker_entry = entry.into();
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to bind preview listener: {0}")]
    Bind(io::Error),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("orchestrator is closed")]
    Closed,
    #[error("unexpected frame {width}x{height}, expected {expected_width}x{expected_height}")]
    UnexpectedFrame {
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct FrameRequest {
    classpath: String,
    target: String,
    width: u32,
    height: u32,
    on_result: FrameCallback,
}

/// What the sender task puts on the wire.
struct Dispatch {
    classpath: String,
    target: String,
    width: u32,
    height: u32,
}

struct InFlight {
    connection_id: u64,
    target: String,
    width: u32,
    height: u32,
    on_result: FrameCallback,
}

struct CurrentConnection {
    id: u64,
    connection: Arc<Connection>,
}

#[derive(Default)]
struct State {
    connection: Option<CurrentConnection>,
    pending: Option<FrameRequest>,
    in_flight: Option<InFlight>,
    worker: Option<Box<dyn WorkerProcess>>,
    connection_counter: u64,
    closed: bool,
}

impl State {
    fn is_current(&self, id: u64) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id == id)
    }

    /// Moves the pending request into flight if connection `id` may send it.
    ///
    /// A connection that is already closing keeps its slot until its close
    /// callback runs; it must not take the pending request with it.
    fn dispatch_next(&mut self, id: u64) -> Option<Dispatch> {
        let sendable = self
            .connection
            .as_ref()
            .is_some_and(|c| c.id == id && !c.connection.is_closed());
        if !sendable || self.in_flight.is_some() {
            return None;
        }
        let FrameRequest {
            classpath,
            target,
            width,
            height,
            on_result,
        } = self.pending.take()?;

        self.in_flight = Some(InFlight {
            connection_id: id,
            target: target.clone(),
            width,
            height,
            on_result,
        });
        Some(Dispatch {
            classpath,
            target,
            width,
            height,
        })
    }

    fn take_in_flight(&mut self, id: u64) -> Option<InFlight> {
        if self.in_flight.as_ref()?.connection_id != id {
            return None;
        }
        self.in_flight.take()
    }
}

struct Shared {
    state: StdMutex<State>,
    /// Signalled when a request is queued, the in-flight slot clears or a
    /// connection goes away.
    request_ready: Notify,
    /// Serialises handovers between connections that attach concurrently.
    handover: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Orchestrator state mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    fn connection_closed(&self, id: u64) {
        {
            let mut state = self.lock_state();
            if state.is_current(id) {
                state.connection = None;
            }
            if let Some(abandoned) = state.take_in_flight(id) {
                tracing::warn!(
                    connection = id,
                    preview = %abandoned.target,
                    "Abandoning in-flight frame request"
                );
            }
        }
        self.request_ready.notify_waiters();
    }
}

/// Host side of the preview bridge.
pub struct Orchestrator {
    shared: Arc<Shared>,
    config: OrchestratorConfig,
    port: u16,
    runtime: Handle,
}

impl Orchestrator {
    /// Binds the loopback listener and starts accepting worker connections.
    ///
    /// Must be called from within a tokio runtime; the orchestrator keeps
    /// using that runtime for its tasks and for spawning workers.
    pub async fn bind(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let listener = bind_loopback().await.map_err(OrchestratorError::Bind)?;
        let port = listener
            .local_addr()
            .map_err(OrchestratorError::Bind)?
            .port();

        let shared = Arc::new(Shared {
            state: StdMutex::new(State::default()),
            request_ready: Notify::new(),
            handover: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(accept_loop(Arc::clone(&shared), listener));
        tracing::info!(port, "Preview orchestrator listening");

        Ok(Self {
            shared,
            config,
            port,
            runtime: Handle::current(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Queues a frame request, replacing any request that has not been sent yet.
    ///
    /// A replaced request is dropped silently: its callback is never invoked.
    /// Spawns the worker when there is neither a live connection nor a live
    /// worker process. Safe to call from any thread.
    pub fn request_preview(
        &self,
        request: PreviewRequest,
        on_result: impl FnOnce(Bytes) + Send + 'static,
    ) -> Result<(), OrchestratorError> {
        let PreviewRequest {
            runtime_path,
            worker_classpath,
            classpath,
            target,
            width,
            height,
        } = request;

        let spawned = {
            let mut state = self.shared.lock_state();
            if state.closed {
                return Err(OrchestratorError::Closed);
            }

            tracing::debug!(preview = %target, width, height, "Frame requested");
            let superseded = state.pending.replace(FrameRequest {
                classpath,
                target,
                width,
                height,
                on_result: Box::new(on_result),
            });
            if superseded.is_some() {
                tracing::debug!("Superseded pending frame request");
            }

            let worker_alive = state
                .worker
                .as_mut()
                .is_some_and(|worker| !worker.has_exited());
            if state.connection.is_none() && !worker_alive {
                let launch = WorkerLaunch {
                    runtime_path,
                    worker_classpath,
                    entry: self.config.worker_entry.clone(),
                    port: self.port,
                };
                let _runtime = self.runtime.enter();
                self.config
                    .spawner
                    .spawn(&launch)
                    .map(|worker| state.worker = Some(worker))
            } else {
                Ok(())
            }
        };

        self.shared.request_ready.notify_waiters();
        spawned.map_err(OrchestratorError::Spawn)
    }

    /// Stops accepting, closes the current connection and kills the worker.
    ///
    /// Pending and in-flight requests are abandoned. Idempotent.
    pub async fn close(&self) {
        let (was_closed, connection, worker) = {
            let mut state = self.shared.lock_state();
            let was_closed = std::mem::replace(&mut state.closed, true);
            state.pending = None;
            state.in_flight = None;
            (was_closed, state.connection.take(), state.worker.take())
        };
        self.shared.shutdown.cancel();

        if let Some(current) = connection {
            current.connection.close().await;
        }
        if let Some(mut worker) = worker {
            worker.kill();
        }
        if !was_closed {
            tracing::info!(port = self.port, "Preview orchestrator closed");
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        let (connection, worker) = {
            let mut state = self.shared.lock_state();
            state.closed = true;
            (state.connection.take(), state.worker.take())
        };
        if let Some(mut worker) = worker {
            worker.kill();
        }
        if let Some(current) = connection {
            self.runtime
                .spawn(async move { current.connection.close().await });
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::trace!(%peer, "Accepted preview connection");
                tokio::spawn(attach(Arc::clone(&shared), stream));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept preview connection");
            }
        }
    }
    tracing::debug!("Accept loop exiting");
}

/// Waits for ATTACH and makes the connection current, closing the previous one.
async fn attach(shared: Arc<Shared>, stream: TcpStream) {
    let id = {
        let mut state = shared.lock_state();
        state.connection_counter += 1;
        state.connection_counter
    };
    let weak: Weak<Shared> = Arc::downgrade(&shared);
    let connection = Arc::new(Connection::new(
        stream,
        format!("orchestrator#{id}"),
        move || {
            if let Some(shared) = weak.upgrade() {
                shared.connection_closed(id);
            }
        },
    ));

    let first = tokio::select! {
        _ = shared.shutdown.cancelled() => {
            connection.close().await;
            return;
        }
        first = connection.receive_command() => first,
    };
    match first {
        Ok(Some(command)) if command.kind() == CommandKind::Attach => {}
        Ok(other) => {
            tracing::debug!(connection = %connection.label(), command = ?other, "Connection did not attach, closing");
            connection.close().await;
            return;
        }
        Err(e) => {
            tracing::debug!(connection = %connection.label(), error = %e, "Connection lost before attaching");
            connection.close().await;
            return;
        }
    }

    let _handover = shared.handover.lock().await;
    let previous = shared.lock_state().connection.take();
    if let Some(previous) = previous {
        tracing::info!(
            previous = %previous.connection.label(),
            current = %connection.label(),
            "Handing over to new worker connection"
        );
        previous.connection.close().await;
    }

    let installed = {
        let mut state = shared.lock_state();
        let installed = !state.closed && !connection.is_closed();
        if installed {
            state.connection = Some(CurrentConnection {
                id,
                connection: Arc::clone(&connection),
            });
        }
        installed
    };
    if !installed {
        connection.close().await;
        return;
    }

    tracing::info!(connection = %connection.label(), "Worker attached");
    tokio::spawn(sender_loop(Arc::clone(&shared), Arc::clone(&connection), id));
    tokio::spawn(receiver_loop(Arc::clone(&shared), connection, id));
    shared.request_ready.notify_waiters();
}

async fn sender_loop(shared: Arc<Shared>, connection: Arc<Connection>, id: u64) {
    loop {
        // Register interest before checking state so a notify in between is not lost.
        let notified = shared.request_ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = shared.lock_state().dispatch_next(id);
        let Some(dispatch) = next else {
            let woken = tokio::select! {
                _ = &mut notified => true,
                _ = connection.closed() => false,
            };
            if woken {
                continue;
            } else {
                break;
            }
        };

        tracing::debug!(
            connection = %connection.label(),
            preview = %dispatch.target,
            width = dispatch.width,
            height = dispatch.height,
            "Sending frame request"
        );
        match send_request(&connection, dispatch).await {
            Ok(()) => {}
            Err(TransportError::Closed) => break,
            Err(e) => {
                tracing::error!(connection = %connection.label(), error = %e, "Failed to send frame request");
                connection.close().await;
                break;
            }
        }
    }
    tracing::debug!(connection = %connection.label(), "Sender loop exiting");
}

async fn send_request(connection: &Connection, dispatch: Dispatch) -> Result<(), TransportError> {
    connection
        .send_command_with_data(&Command::preview_classpath(), dispatch.classpath.into_bytes())
        .await?;
    connection
        .send_command(&Command::frame_request(
            &dispatch.target,
            dispatch.width,
            dispatch.height,
        ))
        .await
}

async fn receiver_loop(shared: Arc<Shared>, connection: Arc<Connection>, id: u64) {
    if let Err(e) = receive_frames(&shared, &connection, id).await {
        tracing::error!(connection = %connection.label(), error = %e, "Protocol violation, dropping worker connection");
        connection.close().await;
    }
    tracing::debug!(connection = %connection.label(), "Receiver loop exiting");
}

async fn receive_frames(
    shared: &Shared,
    connection: &Connection,
    id: u64,
) -> Result<(), OrchestratorError> {
    loop {
        let command = match connection.receive_command().await {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(TransportError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if command.kind() != CommandKind::Frame {
            tracing::debug!(connection = %connection.label(), %command, "Ignoring command");
            continue;
        }

        let (width, height) = command.frame_size()?;
        let pixels = match connection.receive_data().await {
            Ok(pixels) => pixels,
            Err(TransportError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let request = shared.lock_state().take_in_flight(id);
        let Some(request) = request else {
            tracing::warn!(connection = %connection.label(), width, height, "Frame received with no request in flight");
            continue;
        };
        shared.request_ready.notify_waiters();

        if (request.width, request.height) != (width, height) {
            return Err(OrchestratorError::UnexpectedFrame {
                width,
                height,
                expected_width: request.width,
                expected_height: request.height,
            });
        }

        tracing::debug!(
            connection = %connection.label(),
            preview = %request.target,
            width,
            height,
            size = pixels.len(),
            "Frame received"
        );
        (request.on_result)(pixels);
    }
}
