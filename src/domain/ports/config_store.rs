//! Configuration Store Port
//!
//! Typed access to the declarative model and the append-only audit logs.
//! Any backing store (relational, embedded, in-memory) that honors this
//! contract is acceptable: every write is transactional and appends its
//! ConfigChange row in the same transaction, writers are serialized, and
//! readers may run concurrently.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::entities::{
    ActiveRule, Address, AvailabilityLog, Backend, BackendSet, ConfigChange, NewAddress,
    NewBackend, NewBackendSet, NewRule, NewSourceDefinition, Rule, SourceDefinition,
};
use crate::error::Error;

/// Rules and availability observed as one consistent snapshot, consumed by
/// a single reconciliation tick.
#[derive(Debug, Clone, Default)]
pub struct ReconcileSnapshot {
    /// Enabled rules, priority descending, ties broken by ascending id.
    pub rules: Vec<ActiveRule>,
    /// Available addresses per backend set referenced by `rules`.
    pub addresses: HashMap<i64, Vec<Address>>,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    // ===== reads =====

    /// All backends with their addresses.
    async fn list_backends(&self) -> Result<Vec<Backend>, Error>;

    async fn get_backend(&self, id: i64) -> Result<Backend, Error>;

    async fn get_address(&self, id: i64) -> Result<Address, Error>;

    /// All backend sets with their member backends.
    async fn list_backend_sets(&self) -> Result<Vec<BackendSet>, Error>;

    async fn get_backend_set(&self, id: i64) -> Result<BackendSet, Error>;

    async fn list_source_definitions(&self) -> Result<Vec<SourceDefinition>, Error>;

    async fn get_source_definition(&self, id: i64) -> Result<SourceDefinition, Error>;

    async fn list_rules(&self) -> Result<Vec<Rule>, Error>;

    async fn get_rule(&self, id: i64) -> Result<Rule, Error>;

    /// Enabled rules with joined source fields, ordered priority
    /// descending, ties broken by ascending id.
    async fn active_rules(&self) -> Result<Vec<ActiveRule>, Error>;

    /// Currently-available addresses reachable through a backend set.
    async fn available_addresses(&self, backend_set_id: i64) -> Result<Vec<Address>, Error>;

    /// Active rules plus the availability map for every backend set they
    /// reference, observed as one consistent snapshot. The default
    /// implementation issues the two reads back to back; stores with a
    /// cheaper consistency mechanism should override it.
    async fn reconcile_snapshot(&self) -> Result<ReconcileSnapshot, Error> {
        let rules = self.active_rules().await?;
        let mut addresses = HashMap::new();
        for rule in &rules {
            if !addresses.contains_key(&rule.backend_set_id) {
                let addrs = self.available_addresses(rule.backend_set_id).await?;
                addresses.insert(rule.backend_set_id, addrs);
            }
        }
        Ok(ReconcileSnapshot { rules, addresses })
    }

    /// Configuration change log, newest first.
    async fn config_changes(&self, limit: i64, offset: i64) -> Result<Vec<ConfigChange>, Error>;

    /// Availability transition log, newest first.
    async fn availability_logs(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AvailabilityLog>, Error>;

    // ===== writes =====

    async fn create_backend(&self, draft: NewBackend, actor: &str) -> Result<Backend, Error>;

    async fn update_backend(
        &self,
        id: i64,
        draft: NewBackend,
        actor: &str,
    ) -> Result<Backend, Error>;

    /// Deletes the backend, its addresses, and its backend-set
    /// memberships in one transaction.
    async fn delete_backend(&self, id: i64, actor: &str) -> Result<(), Error>;

    async fn create_address(
        &self,
        backend_id: i64,
        draft: NewAddress,
        actor: &str,
    ) -> Result<Address, Error>;

    async fn update_address(
        &self,
        id: i64,
        draft: NewAddress,
        actor: &str,
    ) -> Result<Address, Error>;

    async fn delete_address(&self, id: i64, actor: &str) -> Result<(), Error>;

    async fn create_backend_set(
        &self,
        draft: NewBackendSet,
        actor: &str,
    ) -> Result<BackendSet, Error>;

    async fn update_backend_set(
        &self,
        id: i64,
        draft: NewBackendSet,
        actor: &str,
    ) -> Result<BackendSet, Error>;

    /// Refused with `InvariantViolation` while any rule references the set.
    async fn delete_backend_set(&self, id: i64, actor: &str) -> Result<(), Error>;

    async fn create_source_definition(
        &self,
        draft: NewSourceDefinition,
        actor: &str,
    ) -> Result<SourceDefinition, Error>;

    async fn update_source_definition(
        &self,
        id: i64,
        draft: NewSourceDefinition,
        actor: &str,
    ) -> Result<SourceDefinition, Error>;

    /// Refused with `InvariantViolation` while any rule references the
    /// definition.
    async fn delete_source_definition(&self, id: i64, actor: &str) -> Result<(), Error>;

    async fn create_rule(&self, draft: NewRule, actor: &str) -> Result<Rule, Error>;

    async fn update_rule(&self, id: i64, draft: NewRule, actor: &str) -> Result<Rule, Error>;

    async fn delete_rule(&self, id: i64, actor: &str) -> Result<(), Error>;

    /// Record an availability transition: update the address flag and
    /// `last_checked`, then append the AvailabilityLog row, in one
    /// transaction. Called only when the observed outcome differs from the
    /// stored flag.
    async fn record_transition(
        &self,
        address_id: i64,
        available: bool,
        check_error: Option<String>,
    ) -> Result<(), Error>;
}
