//! Streamed execution: live sessions over PTYs, pipes and container execs

pub(crate) mod pipe;
pub(crate) mod pty;
mod session;

pub(crate) use session::{raw_channel, InputSink, RawChunk, SessionParts};
pub use session::{
    ChunkSource, ChunkStream, ExitInfo, OutputChunk, ProcessControl, SessionId, SessionOptions,
    SessionState, StreamSession,
};
