use libsane::SaneError;
use thiserror::Error;

pub type Result<T, E = KsaneError> = ::core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum KsaneError {
    #[error("device '{0}' requires authentication")]
    AuthenticationRequired(String),

    #[error("failed to open device '{name}': {source}")]
    DeviceUnavailable {
        name: String,
        #[source]
        source: SaneError,
    },

    #[error("a scan is in progress")]
    Busy,

    #[error("no device is open")]
    NotOpen,

    #[error("device '{0}' is already open")]
    AlreadyOpen(String),

    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("option '{name}': {source}")]
    Option {
        name: String,
        #[source]
        source: OptionError,
    },

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptionError {
    #[error("option is hidden")]
    Hidden,

    #[error("option is not settable")]
    ReadOnly,

    #[error("value type does not match the option")]
    TypeMismatch,

    #[error("'{0}' is not one of the allowed values")]
    NotInList(String),

    #[error("can not parse '{0}'")]
    Parse(String),

    #[error("device error: {0}")]
    Device(#[from] SaneError),

    #[error("device handle is in use by a scan")]
    HandleBusy,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("unsupported frame layout {frame} at {depth} bit")]
    Unsupported { frame: String, depth: usize },

    #[error("row stride {stride} is shorter than a row of {row} bytes")]
    Stride { stride: usize, row: usize },

    #[error("buffer holds {actual} bytes, {expected} needed")]
    ShortBuffer { expected: usize, actual: usize },
}
