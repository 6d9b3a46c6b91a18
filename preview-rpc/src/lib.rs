//! preview-rpc: out-of-process preview rendering over a loopback socket.

pub mod bridge;
pub mod orchestrator;
pub mod renderer;
pub mod worker;

pub use bridge::protocol::{Command, CommandKind, ProtocolError};
pub use bridge::transport::{Connection, TransportError};
pub use orchestrator::{
    FrameCallback, Orchestrator, OrchestratorConfig, OrchestratorError, PreviewRequest,
    ProcessSpawner, SpawnError, WorkerLaunch, WorkerProcess, WorkerSpawner,
};
pub use renderer::{
    ExecutableLoader, FnRenderer, RenderError, Renderer, RendererLoader, StaticLoader,
    parse_classpath,
};
pub use worker::{WORKER_ENTRY, WorkerError, run_worker};
