use thiserror::Error;

use tether_html::{HtmlError, LockError};

use crate::view::input::AwaitKind;

/// Why a view runtime stopped.
///
/// Suspension points hand this back instead of a value so the view procedure
/// unwinds cooperatively and its cleanup hooks still run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    #[error("user aborted the view")]
    UserAbort,

    #[error("server is shutting down")]
    ServerStop,

    #[error("{0}")]
    Custom(String),
}

#[derive(Error, Debug)]
pub enum ViewError {
    #[error("view stopped: {0}")]
    Stopped(StopReason),

    /// A second `await_input` for the same kind while one is pending.
    #[error("an input slot for {0:?} is already pending")]
    InputSlotOccupied(AwaitKind),

    #[error(transparent)]
    Html(#[from] HtmlError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("{0}")]
    Custom(String),
}

impl ViewError {
    pub fn custom(message: impl Into<String>) -> Self {
        ViewError::Custom(message.into())
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        match self {
            ViewError::Stopped(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<StopReason> for ViewError {
    fn from(reason: StopReason) -> Self {
        ViewError::Stopped(reason)
    }
}

pub type ViewResult<T = ()> = Result<T, ViewError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool '{0}' is shut down")]
    ShutDown(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("invalid bus frame: {0}")]
    InvalidFrame(String),

    #[error("channel '{0}' has no queue")]
    NotAQueue(String),

    #[error("broker is shut down")]
    ShutDown,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {name}: '{value}'")]
    InvalidEnv { name: String, value: String },
}
