//! Error types for homeguard.

use thiserror::Error;

use crate::model::TaskStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid task transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("module already enabled: {0}")]
    ModuleAlreadyEnabled(String),

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("worker is still shutting down")]
    WorkerStopping,

    #[error("background loop did not shut down cleanly: {0}")]
    WorkerJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
