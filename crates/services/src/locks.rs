use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use pathway_core::model::GraphId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<GraphId, Arc<AsyncMutex<()>>>;

/// One async mutex per graph.
///
/// Every mutating entry point holds its graph's guard across the whole
/// read-plan-commit cycle, so two submissions on the same graph cannot both
/// observe the pre-completion state. Different graphs never contend. A graph's
/// entry lives only while a guard holds it or a caller waits for it.
#[derive(Debug, Default)]
pub struct GraphLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl GraphLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `graph`.
    pub async fn acquire(&self, graph: GraphId) -> GraphGuard {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(graph).or_default())
        };
        let guard = lock.lock_owned().await;
        GraphGuard {
            graph,
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Exclusive access to one graph; released on drop.
#[derive(Debug)]
pub struct GraphGuard {
    graph: GraphId,
    locks: Arc<Mutex<LockMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GraphGuard {
    fn drop(&mut self) {
        // Holding the map keeps new acquirers from cloning the entry in between.
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        if map
            .get(&self.graph)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.graph);
        }
    }
}
