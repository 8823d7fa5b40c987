//! Lifecycle surface shared by every background manager

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Status snapshot reported by a manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub id: String,
    /// Configuration, runtime capability and licensing all allow the manager to work
    pub enabled: bool,
    /// This process is doing the manager's work right now. Another node may
    /// be active while this is false.
    pub running: bool,
}

/// A long-lived background manager
#[async_trait]
pub trait Manager: Send + Sync {
    fn id(&self) -> &str;

    /// Start timers. Returns false if already started or not startable.
    async fn start(&self) -> bool;

    /// Stop timers and wait for in-flight cycles.
    async fn shutdown(&self);

    async fn status(&self) -> ManagerStatus;
}

/// The set of managers run by one process
#[derive(Default)]
pub struct ManagerRegistry {
    managers: Vec<Arc<dyn Manager>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, manager: Arc<dyn Manager>) {
        self.managers.push(manager);
    }

    pub fn with(mut self, manager: Arc<dyn Manager>) -> Self {
        self.register(manager);
        self
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Start every manager; returns the ids that started
    pub async fn start_all(&self) -> Vec<String> {
        let mut started = Vec::new();
        for manager in &self.managers {
            if manager.start().await {
                info!(manager = %manager.id(), "manager started");
                started.push(manager.id().to_string());
            }
        }
        started
    }

    /// Shut managers down in reverse registration order
    pub async fn shutdown_all(&self) {
        for manager in self.managers.iter().rev() {
            manager.shutdown().await;
            info!(manager = %manager.id(), "manager stopped");
        }
    }

    pub async fn statuses(&self) -> Vec<ManagerStatus> {
        let mut statuses = Vec::with_capacity(self.managers.len());
        for manager in &self.managers {
            statuses.push(manager.status().await);
        }
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagManager {
        id: String,
        started: AtomicBool,
    }

    #[async_trait]
    impl Manager for FlagManager {
        fn id(&self) -> &str {
            &self.id
        }

        async fn start(&self) -> bool {
            !self.started.swap(true, Ordering::SeqCst)
        }

        async fn shutdown(&self) {
            self.started.store(false, Ordering::SeqCst);
        }

        async fn status(&self) -> ManagerStatus {
            ManagerStatus {
                id: self.id.clone(),
                enabled: true,
                running: self.started.load(Ordering::SeqCst),
            }
        }
    }

    fn flag(id: &str) -> Arc<dyn Manager> {
        Arc::new(FlagManager {
            id: id.to_string(),
            started: AtomicBool::new(false),
        })
    }

    #[tokio::test]
    async fn registry_starts_each_manager_once() {
        let registry = ManagerRegistry::new().with(flag("A")).with(flag("B"));
        assert_eq!(registry.start_all().await, vec!["A", "B"]);
        assert!(registry.start_all().await.is_empty());
        assert!(registry.statuses().await.iter().all(|s| s.running));

        registry.shutdown_all().await;
        assert!(registry.statuses().await.iter().all(|s| !s.running));
    }

    #[test]
    fn status_serializes_flat() {
        let status = ManagerStatus {
            id: "FILE_INDEX_MANAGER".into(),
            enabled: true,
            running: false,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["id"], "FILE_INDEX_MANAGER");
        assert_eq!(json["running"], false);
    }
}
