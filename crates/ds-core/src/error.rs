use derive_more::From;
use orion_error::{ErrorCode, StructError, UvsReason};

#[derive(Debug, Clone, PartialEq, thiserror::Error, From)]
pub enum CoreReason {
    /// Invalid window/slide/duration relationships or graph wiring.
    #[error("configuration error")]
    Configuration,
    /// A user-supplied function failed while a batch was evaluated.
    #[error("transformation error")]
    Transformation,
    /// A checkpoint exists but cannot be restored.
    #[error("recovery error")]
    Recovery,
    /// The graph was used in a way its lifecycle does not allow.
    #[error("graph error")]
    Graph,
    #[error("{0}")]
    Uvs(UvsReason),
}

impl ErrorCode for CoreReason {
    fn error_code(&self) -> i32 {
        match self {
            Self::Configuration => 1001,
            Self::Transformation => 1002,
            Self::Recovery => 1003,
            Self::Graph => 1004,
            Self::Uvs(u) => u.error_code(),
        }
    }
}

pub type CoreError = StructError<CoreReason>;
pub type CoreResult<T> = Result<T, CoreError>;
