use thiserror::Error;

use crate::config::ConfigError;
use crate::jid::JidError;
use crate::task::TaskError;
use crate::xml::XmlError;

/// Top-level error of the replay tool. Task outcomes are not errors: they
/// are reported through each task's terminal state.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error(transparent)]
    Jid(#[from] JidError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode report: {0}")]
    Report(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
