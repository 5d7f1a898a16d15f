pub mod core {
    pub mod config;
    pub mod error;
    pub mod logging;
}
pub mod engine {
    pub mod affinity;
    pub mod gate;
    pub mod looper;
    pub mod native;
    pub mod run_queue;
    pub mod singleton;
}
#[cfg(target_os = "android")]
pub mod android {
    pub mod bridge;
}

pub use crate::core::error::StartupError;
pub use crate::engine::{
    gate::{GateStatus, StartupGate},
    looper::{Looper, LooperHandle},
};
