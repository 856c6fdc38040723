use std::collections::HashMap;

use tokio::sync::{RwLock, watch};

/// Key-value state blob an agent owns exclusively.
pub type StateMap = HashMap<String, serde_json::Value>;

/// Observable agent state.
///
/// Mutation goes through [`AgentState::merge`] only; every merge publishes a
/// full snapshot to observers through a watch channel.
pub struct AgentState {
    values: RwLock<StateMap>,
    observers: watch::Sender<StateMap>,
}

impl AgentState {
    pub fn new(initial: StateMap) -> Self {
        let (observers, _) = watch::channel(initial.clone());
        Self {
            values: RwLock::new(initial),
            observers,
        }
    }

    /// Shallow-merge `patch` into the state and notify observers. Returns
    /// the resulting snapshot.
    pub async fn merge(&self, patch: StateMap) -> StateMap {
        let snapshot = {
            let mut values = self.values.write().await;
            for (key, value) in patch {
                values.insert(key, value);
            }
            values.clone()
        };
        self.observers.send_replace(snapshot.clone());
        snapshot
    }

    pub async fn snapshot(&self) -> StateMap {
        self.values.read().await.clone()
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values.read().await.get(key).cloned()
    }

    /// Watch state changes. The receiver observes every snapshot published
    /// after this call.
    pub fn observe(&self) -> watch::Receiver<StateMap> {
        self.observers.subscribe()
    }
}
