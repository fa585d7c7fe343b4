use derive_more::From;
use ds_core::CoreReason;
use orion_error::{ErrorCode, StructError, UvsReason};

#[derive(Debug, Clone, PartialEq, thiserror::Error, From)]
pub enum RuntimeReason {
    /// `start` called on a context that is already running.
    #[error("context already started")]
    AlreadyStarted,
    /// The context was stopped and cannot be started again.
    #[error("context stopped")]
    Stopped,
    /// The control loop ended abnormally.
    #[error("scheduler error")]
    Scheduler,
    /// Writing or reading a checkpoint failed.
    #[error("checkpoint error")]
    Checkpoint,
    #[error("{0}")]
    Core(CoreReason),
    #[error("{0}")]
    Uvs(UvsReason),
}

impl ErrorCode for RuntimeReason {
    fn error_code(&self) -> i32 {
        match self {
            Self::AlreadyStarted => 2001,
            Self::Stopped => 2002,
            Self::Scheduler => 2003,
            Self::Checkpoint => 2004,
            Self::Core(c) => c.error_code(),
            Self::Uvs(u) => u.error_code(),
        }
    }
}

pub type RuntimeError = StructError<RuntimeReason>;
pub type RuntimeResult<T> = Result<T, RuntimeError>;
