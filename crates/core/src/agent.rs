use std::sync::{Arc, RwLock};

use crate::config::{Config, PluginConfig};

/// Shared holder for an immutable configuration snapshot.
///
/// Watchers publish new snapshots with [`Agent::set`]; consumers take a cheap
/// `Arc` clone once per request with [`Agent::snapshot`] and never observe a
/// partially applied update.
#[derive(Debug, Default)]
pub struct Agent<T> {
    current: RwLock<Option<Arc<T>>>,
}

pub type ConfigAgent = Agent<Config>;
pub type PluginAgent = Agent<PluginConfig>;

impl<T> Agent<T> {
    pub fn new() -> Self { Self { current: RwLock::new(None) } }

    /// Swap in a new snapshot.
    pub fn set(&self, value: T) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Some(Arc::new(value));
    }

    /// The current snapshot, or `None` before the first load.
    pub fn snapshot(&self) -> Option<Arc<T>> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether a snapshot has been published at least once.
    pub fn loaded(&self) -> bool {
        self.current.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_swap() {
        let agent: Agent<u32> = Agent::new();
        assert!(!agent.loaded());
        assert!(agent.snapshot().is_none());

        agent.set(1);
        let old = agent.snapshot().unwrap();
        agent.set(2);
        // Old snapshots stay valid after a swap.
        assert_eq!(*old, 1);
        assert_eq!(*agent.snapshot().unwrap(), 2);
        assert!(agent.loaded());
    }
}
