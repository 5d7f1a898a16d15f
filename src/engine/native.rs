use crate::core::{config::EngineConfig, error::EngineError};
use libloading::{Library, Symbol};
use std::{ffi::c_int, fmt};

type EngineInit = unsafe extern "C" fn() -> c_int;

/// An engine living in a shared library. Started by calling its init symbol once;
/// the library stays loaded for as long as this value lives.
pub struct NativeEngine {
    _library: Library,
    path: String,
}

impl NativeEngine {
    /// The startup routine handed to the gate. Must run on the engine's affinity thread.
    pub fn start(config: &EngineConfig) -> Result<Self, EngineError> {
        log::debug!("Loading engine library {}", config.library);
        let library = unsafe { Library::new(&config.library) }.map_err(|source| {
            EngineError::Load {
                path: config.library.clone(),
                source,
            }
        })?;

        {
            let init: Symbol<EngineInit> = unsafe {
                library.get(config.init_symbol.as_bytes())
            }
            .map_err(|source| EngineError::Symbol {
                symbol: config.init_symbol.clone(),
                source,
            })?;

            let code = unsafe { init() };
            if code != 0 {
                return Err(EngineError::InitReturned(code));
            }
        }

        log::info!("Engine library {} initialized", config.library);
        Ok(Self {
            _library: library,
            path: config.library.clone(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEngine")
            .field("path", &self.path)
            .finish()
    }
}
