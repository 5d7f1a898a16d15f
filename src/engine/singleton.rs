use super::gate::StartupGate;
use crate::core::error::StartupError;
use std::sync::OnceLock;

/// An adapter that only makes sense once the engine runs: built from the started
/// engine on first access, cached for every access after that.
#[derive(Debug)]
pub struct StartedSingleton<A> {
    cell: OnceLock<A>,
}

impl<A> StartedSingleton<A> {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// The cached value, if anyone has built it yet. Never starts the engine.
    pub fn get(&self) -> Option<&A> {
        self.cell.get()
    }

    pub fn get_or_init<T>(
        &self,
        gate: &StartupGate<T>,
        require_main: bool,
        init: impl FnOnce(&T) -> A,
    ) -> Result<&A, StartupError>
    where
        T: Send + Sync + 'static,
    {
        if let Some(value) = self.cell.get() {
            return Ok(value);
        }
        gate.run_with_guaranteed_start(require_main, |engine| {
            self.cell.get_or_init(|| init(engine))
        })
    }
}

impl<A> Default for StartedSingleton<A> {
    fn default() -> Self {
        Self::new()
    }
}
