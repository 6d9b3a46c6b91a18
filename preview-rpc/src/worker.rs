//! Worker process side of the preview bridge.
//!
//! The parent side (listening, spawning, request dispatch) is in orchestrator.rs.
//!
//! Flow:
//! 1. Connect to the host's loopback port and send ATTACH
//! 2. PREVIEW_CLASSPATH + data: drop the current renderer, load a fresh one
//! 3. FRAME_REQUEST: render with the current renderer, reply FRAME + pixels
//!
//! Anything unexpected is fatal; the worker never tries to resume.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use crate::bridge::protocol::{Command, CommandKind, ProtocolError};
use crate::bridge::transport::{Connection, TransportError, connect_loopback};
use crate::renderer::{RenderError, Renderer, RendererLoader, parse_classpath};

/// Entry identifier passed on the worker command line by the default spawner.
pub const WORKER_ENTRY: &str = "preview-host";

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to connect to preview host on port {port}: {source}")]
    Connect { port: u16, source: io::Error },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to load preview classpath: {0}")]
    Load(RenderError),

    #[error("a frame is requested before preview classpath is configured")]
    MissingClasspath,

    #[error("unexpected command: '{0}'")]
    UnexpectedCommand(Command),

    #[error("invalid command: {0}")]
    InvalidCommand(#[from] ProtocolError),

    #[error("render failed: {0}")]
    Render(RenderError),
}

/// Connects to the host on `port` and serves frame requests until the host
/// goes away (`Ok`) or something fatal happens (`Err`).
pub async fn run_worker(port: u16, loader: Arc<dyn RendererLoader>) -> Result<(), WorkerError> {
    let stream = connect_loopback(port)
        .await
        .map_err(|source| WorkerError::Connect { port, source })?;
    tracing::info!(port, "Connected to preview host");

    let connection = Connection::new(stream, "worker", || {
        tracing::debug!("Preview host connection released");
    });
    PreviewHost::new(connection, loader).run().await
}

pub struct PreviewHost {
    connection: Connection,
    loader: Arc<dyn RendererLoader>,
    renderer: Option<Arc<dyn Renderer>>,
}

impl PreviewHost {
    pub fn new(connection: Connection, loader: Arc<dyn RendererLoader>) -> Self {
        Self {
            connection,
            loader,
            renderer: None,
        }
    }

    pub async fn run(mut self) -> Result<(), WorkerError> {
        let result = self.serve().await;
        self.connection.close().await;
        match result {
            Err(WorkerError::Transport(TransportError::Closed)) => {
                tracing::info!("Preview host closed the connection, exiting");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker failed");
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn serve(&mut self) -> Result<(), WorkerError> {
        self.connection.send_command(&Command::attach()).await?;

        loop {
            // Undecodable commands were already logged and dropped by the transport.
            let Some(command) = self.connection.receive_command().await? else {
                continue;
            };
            match command.kind() {
                CommandKind::PreviewClasspath => self.load_classpath().await?,
                CommandKind::FrameRequest => self.render_frame(&command).await?,
                _ => return Err(WorkerError::UnexpectedCommand(command)),
            }
        }
    }

    async fn load_classpath(&mut self) -> Result<(), WorkerError> {
        self.renderer = None;

        let payload = self.connection.receive_data().await?;
        let roots = parse_classpath(&payload).map_err(WorkerError::Load)?;
        tracing::debug!(num_roots = roots.len(), "Loading preview classpath");

        let renderer = self.loader.load(&roots).map_err(WorkerError::Load)?;
        self.renderer = Some(renderer);
        Ok(())
    }

    async fn render_frame(&mut self, command: &Command) -> Result<(), WorkerError> {
        let renderer = self
            .renderer
            .as_ref()
            .ok_or(WorkerError::MissingClasspath)?;
        let (target, width, height) = command.frame_request_args()?;

        let started = Instant::now();
        let pixels = renderer
            .render(target, width, height)
            .await
            .map_err(WorkerError::Render)?;
        tracing::debug!(
            preview = target,
            width,
            height,
            size = pixels.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rendered frame"
        );

        self.connection
            .send_command_with_data(&Command::frame(width, height), pixels)
            .await?;
        Ok(())
    }
}
