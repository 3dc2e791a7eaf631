use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::engine::{Engine, empty_engine};

/// Atomically swappable reference to the active engine.
///
/// Readers take a snapshot with [`EngineHandle::load`] and keep using it for
/// the whole request, even if a reload replaces it meanwhile.
pub struct EngineHandle {
    current: ArcSwap<Engine>,
}

impl EngineHandle {
    pub fn new(engine: Engine) -> Self {
        Self {
            current: ArcSwap::from_pointee(engine),
        }
    }

    pub fn load(&self) -> Arc<Engine> {
        self.current.load_full()
    }

    /// Install `engine` and return the one it replaced.
    pub fn replace(&self, engine: Engine) -> Arc<Engine> {
        let version = engine.audit().version.clone();
        let previous = self.current.swap(Arc::new(engine));
        tracing::info!(
            previous = %previous.audit().version,
            current = %version,
            "swapped bucketing engine"
        );
        previous
    }
}

impl Default for EngineHandle {
    fn default() -> Self {
        Self {
            current: ArcSwap::new(empty_engine()),
        }
    }
}
