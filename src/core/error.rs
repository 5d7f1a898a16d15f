use std::{error::Error, io, sync::Arc};
use thiserror::Error as ThisError;

pub type BoxError = Box<dyn Error + Send + Sync>;

///
/// StartupError
///
/// Cloned out of the gate so every blocked and later caller sees the same terminal error.
///

#[derive(Clone, Debug, ThisError)]
pub enum StartupError {
    #[error("ensure_started re-entered from the startup routine on the affinity thread")]
    Reentrant,

    #[error("engine initialization failed: {0}")]
    InitializationFailed(Arc<dyn Error + Send + Sync>),

    #[error("engine initialization panicked: {0}")]
    InitializationPanicked(String),

    #[error("affinity thread is gone, startup task could not be posted")]
    AffinityThreadGone,

    #[error("gate is already bound to a different affinity thread")]
    AffinityConflict,

    #[error("calling thread has no looper to bind the engine to")]
    NoLooper,

    #[error("no main looper has been prepared")]
    NoMainLooper,
}

impl StartupError {
    /// Whether the gate has entered its terminal failed state with this error.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InitializationFailed(_)
                | Self::InitializationPanicked(_)
                | Self::AffinityThreadGone
        )
    }
}

///
/// LooperError
///

#[derive(Debug, ThisError)]
pub enum LooperError {
    #[error("a looper is already prepared on this thread")]
    AlreadyPrepared,

    #[error("the main looper is already prepared")]
    MainAlreadyPrepared,

    #[error("looper has quit")]
    Disconnected,

    #[error("failed to spawn looper thread: {0}")]
    Spawn(#[from] io::Error),
}

///
/// EngineError
///

#[derive(Debug, ThisError)]
pub enum EngineError {
    #[error("failed to load engine library {path}: {source}")]
    Load {
        path: String,
        source: libloading::Error,
    },

    #[error("engine library has no symbol {symbol}: {source}")]
    Symbol {
        symbol: String,
        source: libloading::Error,
    },

    #[error("engine init returned {0}")]
    InitReturned(i32),
}

///
/// ConfigError
///

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
}
