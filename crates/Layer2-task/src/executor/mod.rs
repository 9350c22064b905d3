//! Execution backends
//!
//! - `ShellAdapter` - host execution through the platform shell
//! - `ContainerRuntime` - ephemeral containers through a `ContainerBackend`
//!
//! Both run a request to completion (`run`) or open a live session (`open`).

pub mod container;
pub mod shell;
pub mod r#trait;

pub use container::{
    ContainerBackend, ContainerLease, ContainerRuntime, ContainerSpec, DockerBackend, ExecHandle,
    ExecSpec, LogChunk, MANAGED_LABEL,
};
pub use r#trait::Executor;
pub use shell::{
    cmd_quote, posix_argv, powershell_quote, BoundedCapture, ShellAdapter, ShellInfo, ShellKind,
    ShellOutput, TRUNCATION_MARKER,
};
