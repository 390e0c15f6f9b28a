//! Reconciler
//!
//! Periodically reads the model and availability as one snapshot, compiles
//! it, and swaps the kernel ruleset atomically. A failed tick is logged
//! and the next tick retries from scratch; no partial state carries over.

use std::sync::Arc;
use std::time::Duration;

use crate::application::applier::KernelApplier;
use crate::domain::ports::ConfigStore;
use crate::domain::services::RuleCompiler;
use crate::error::Error;
use crate::infrastructure::shutdown::ShutdownController;

pub struct Reconciler {
    store: Arc<dyn ConfigStore>,
    compiler: RuleCompiler,
    applier: KernelApplier,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ConfigStore>, compiler: RuleCompiler, applier: KernelApplier) -> Self {
        Self {
            store,
            compiler,
            applier,
        }
    }

    /// One reconciliation cycle: snapshot, compile, apply.
    pub async fn tick_once(&self) -> Result<(), Error> {
        let snapshot = self.store.reconcile_snapshot().await?;
        tracing::debug!("got {} active rules from store", snapshot.rules.len());

        let compiled = self.compiler.compile(&snapshot.rules, &snapshot.addresses);
        self.applier.apply(&compiled).await
    }

    /// Tick on every interval fire until shutdown. The caller runs the
    /// startup tick before starting this loop, so the interval's immediate
    /// first fire is consumed up front.
    pub async fn run(&self, interval: Duration, shutdown: ShutdownController) {
        let mut rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick_once().await {
                        tracing::error!("failed to update kernel ruleset: {}", e);
                    }
                }
                _ = rx.recv() => {
                    tracing::info!("stopping reconciler");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{MemoryKernelHandle, SqliteConfigStore};
    use crate::domain::entities::{
        NewAddress, NewBackend, NewBackendSet, NewRule, NewSourceDefinition, Protocol,
    };
    use crate::domain::source::SourceSpec;

    async fn seeded_store() -> Arc<SqliteConfigStore> {
        let store = Arc::new(SqliteConfigStore::open_in_memory().unwrap());
        let backend = store
            .create_backend(
                NewBackend {
                    name: "pool-a".to_string(),
                    description: String::new(),
                },
                "test",
            )
            .await
            .unwrap();
        store
            .create_address(
                backend.id,
                NewAddress {
                    ip: "10.0.0.10".to_string(),
                    port: 80,
                },
                "test",
            )
            .await
            .unwrap();
        let set = store
            .create_backend_set(
                NewBackendSet {
                    name: "set-a".to_string(),
                    description: String::new(),
                    backend_ids: vec![backend.id],
                },
                "test",
            )
            .await
            .unwrap();
        let def = store
            .create_source_definition(
                NewSourceDefinition {
                    name: "corp".to_string(),
                    description: String::new(),
                    spec: SourceSpec::Subnet {
                        subnet: "10.1.0.0/16".to_string(),
                    },
                },
                "test",
            )
            .await
            .unwrap();
        store
            .create_rule(
                NewRule {
                    source_definition_id: def.id,
                    destination_port: 80,
                    protocol: Protocol::Tcp,
                    backend_set_id: set.id,
                    priority: 100,
                    enabled: true,
                },
                "test",
            )
            .await
            .unwrap();
        store
    }

    fn reconciler(
        store: Arc<SqliteConfigStore>,
        kernel: Arc<MemoryKernelHandle>,
    ) -> Reconciler {
        Reconciler::new(
            store,
            RuleCompiler::with_seed(1),
            KernelApplier::new(kernel, Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn test_tick_installs_compiled_rules() {
        let store = seeded_store().await;
        let kernel = Arc::new(MemoryKernelHandle::new("nat", "prerouting"));

        reconciler(store, kernel.clone()).tick_once().await.unwrap();

        assert!(kernel.exists());
        let rules = kernel.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].user_data, "rule_id:1");
        assert_eq!(
            rules[0].dnat_target(),
            Some(("10.0.0.10".parse().unwrap(), 80))
        );
    }

    #[tokio::test]
    async fn test_failed_tick_recovers_on_next() {
        let store = seeded_store().await;
        let kernel = Arc::new(MemoryKernelHandle::new("nat", "prerouting"));
        let reconciler = reconciler(store, kernel.clone());

        kernel.set_fail_commits(true);
        assert!(reconciler.tick_once().await.is_err());
        assert!(kernel.rules().is_empty());

        kernel.set_fail_commits(false);
        reconciler.tick_once().await.unwrap();
        assert_eq!(kernel.rules().len(), 1);
    }

    #[tokio::test]
    async fn test_identical_ticks_with_fixed_selection_are_identical() {
        let store = seeded_store().await;
        let kernel = Arc::new(MemoryKernelHandle::new("nat", "prerouting"));
        let reconciler = reconciler(store, kernel.clone());

        reconciler.tick_once().await.unwrap();
        let first = kernel.rules();
        reconciler.tick_once().await.unwrap();
        let second = kernel.rules();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = seeded_store().await;
        let kernel = Arc::new(MemoryKernelHandle::new("nat", "prerouting"));
        let reconciler = reconciler(store, kernel);
        let shutdown = ShutdownController::new();

        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                reconciler
                    .run(Duration::from_secs(60), shutdown)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.shutdown();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reconciler did not stop after shutdown")
            .unwrap();
    }
}
