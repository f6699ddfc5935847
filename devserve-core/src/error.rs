//! Error taxonomy shared across devserve crates.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration file not found at {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid configuration: {reason}")]
    #[diagnostic(help("Run `devserve config show` to inspect the current configuration."))]
    ConfigInvalid { reason: String },

    #[error("Failed to write configuration to {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No server named '{name}' in {cwd}")]
    ServerNotFound { name: String, cwd: PathBuf },

    #[error("A server named '{name}' already exists")]
    DuplicateName { name: String },

    #[error("Port {port} is outside configured range {min}-{max}")]
    #[diagnostic(help("Adjust the port range with `devserve config set portRange <min>-<max>`."))]
    PortOutOfRange { port: u32, min: u16, max: u16 },

    #[error("No available port in configured range {min}-{max}")]
    NoPortAvailable { min: u16, max: u16 },

    #[error("Failed to probe port {port}: {source}")]
    PortProbe { port: u16, source: std::io::Error },

    #[error("Failed to connect to the process backend: {reason}")]
    BackendConnect { reason: String },

    #[error("Backend failed to start '{name}': {reason}")]
    BackendStart { name: String, reason: String },

    #[error("Backend failed to stop '{name}': {reason}")]
    BackendStop { name: String, reason: String },

    #[error("Missing template variable '{{{{{name}}}}}' and no configuration key provides it")]
    TemplateMissingVariable { name: String },

    #[error("Sibling server lookup failed: {reason}")]
    TemplateLookup { reason: String },

    #[error("Invalid filter: {reason}")]
    InvalidFilter { reason: String },

    #[error("Registry error: {reason}")]
    Registry { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
