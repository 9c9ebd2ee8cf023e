// Error types for dev-mode sessions and debugger attach
//
// Session and negotiation failures are `DevModeError`; the prober has its own
// small `ProbeError`; attach attempts end in `AttachError`, which is `Clone`
// so the same outcome can be handed to every observer of an attempt.

use crate::process::SessionKey;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DevModeError>;

#[derive(Debug, Error)]
pub enum DevModeError {
    #[error("dev mode is already running for {0}")]
    AlreadyRunning(SessionKey),

    #[error("dev mode has not been started for {0}")]
    NotStarted(SessionKey),

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to send input to {key}: {source}")]
    Write {
        key: SessionKey,
        #[source]
        source: io::Error,
    },

    #[error("invalid environment entry `{0}`, expected KEY=VALUE")]
    InvalidEnv(String),

    #[error("no pom.xml or build.gradle found in {0}")]
    UnsupportedProject(PathBuf),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Xml {
        path: PathBuf,
        #[source]
        source: roxmltree::Error,
    },

    #[error("{path} has no {key} entry")]
    DebugAddressMissing { path: PathBuf, key: &'static str },

    #[error("invalid debug port `{0}`")]
    InvalidPort(String),

    #[error("debug port lookup did not complete: {0}")]
    LookupTask(#[source] tokio::task::JoinError),

    #[error("could not allocate a debug port: {0}")]
    PortAllocation(#[source] io::Error),

    #[error("invalid configuration in {path}: {message}")]
    Config { path: PathBuf, message: String },
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{host}:{port} not reachable after {attempts} attempts")]
    Timeout {
        host: String,
        port: u16,
        attempts: u32,
    },

    #[error("probing {host}:{port} failed: {source}")]
    Transport {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Why an attach attempt ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("debug port for {key} was not published after {attempts} attempts")]
    DiscoveryExhausted { key: SessionKey, attempts: u32 },

    #[error("debuggee at {host}:{port} was not listening after {attempts} attempts")]
    ProbeTimeout {
        host: String,
        port: u16,
        attempts: u32,
    },

    #[error("transport error talking to {host}:{port}: {message}")]
    Transport {
        host: String,
        port: u16,
        message: String,
    },

    #[error("debugger handshake with {host}:{port} timed out")]
    ProtocolTimeout { host: String, port: u16 },
}
