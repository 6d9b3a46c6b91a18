//! Wire layer shared by the orchestrator and the worker.
//!
//! - **protocol**: command vocabulary (ATTACH, PREVIEW_CLASSPATH, FRAME_REQUEST, FRAME)
//! - **codec**: length-prefixed framing for AsyncRead/AsyncWrite
//! - **transport**: a framed TCP connection with idempotent close

pub mod codec;
pub mod protocol;
pub mod transport;
