//! Domain Entities - the declarative routing model
//!
//! These entities mirror the configuration store's logical schema. They are
//! created and mutated only through the ConfigStore write path, which pairs
//! every mutation with a ConfigChange audit row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::source::SourceSpec;
use crate::error::Error;

/// L4 protocol selector for a routing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    /// Match any L4 protocol. The destination-port compare still applies
    /// against transport-header bytes 2..4, which is only meaningful for
    /// TCP/UDP-shaped headers; behavior for other protocols is undefined.
    All,
}

impl Protocol {
    /// Parse the storage/wire representation.
    pub fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "all" => Ok(Protocol::All),
            other => Err(Error::Validation(format!("unsupported protocol: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::All => "all",
        }
    }

    /// IPPROTO number to match on, or `None` when no L4 match is emitted.
    pub fn proto_number(&self) -> Option<u8> {
        match self {
            Protocol::Tcp => Some(6),
            Protocol::Udp => Some(17),
            Protocol::All => None,
        }
    }
}

/// A destination server pool. Owns its addresses; may be a member of many
/// backend sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub addresses: Vec<Address>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One host:port endpoint of a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub id: i64,
    pub backend_id: i64,
    pub ip: String,
    pub port: u16,
    /// Materialized current truth from the health prober.
    pub available: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A load-balancing group of backends, referenced by rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSet {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub backends: Vec<Backend>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named, typed source matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub id: i64,
    pub name: String,
    pub description: String,
    #[serde(flatten)]
    pub spec: SourceSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A routing decision: source matcher + destination port + protocol mapped
/// to a backend set at a given priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub source_definition_id: i64,
    pub destination_port: u16,
    pub protocol: Protocol,
    pub backend_set_id: i64,
    pub priority: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Join projection consumed by the rule compiler: one enabled rule with its
/// source fields inlined. Protocol stays raw so a bad row skips only the
/// rule it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRule {
    pub id: i64,
    pub priority: i64,
    pub destination_port: u16,
    pub protocol: String,
    pub backend_set_id: i64,
    pub source: SourceSpec,
}

/// Kind of a configuration mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "create" => Ok(ChangeType::Create),
            "update" => Ok(ChangeType::Update),
            "delete" => Ok(ChangeType::Delete),
            other => Err(Error::Validation(format!("unknown change type: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

/// Kind of entity a configuration mutation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Backend,
    Address,
    BackendSet,
    SourceDefinition,
    Rule,
}

impl EntityType {
    pub fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "backend" => Ok(EntityType::Backend),
            "address" => Ok(EntityType::Address),
            "backend_set" => Ok(EntityType::BackendSet),
            "source_definition" => Ok(EntityType::SourceDefinition),
            "rule" => Ok(EntityType::Rule),
            other => Err(Error::Validation(format!("unknown entity type: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Backend => "backend",
            EntityType::Address => "address",
            EntityType::BackendSet => "backend_set",
            EntityType::SourceDefinition => "source_definition",
            EntityType::Rule => "rule",
        }
    }
}

/// Append-only audit row for a configuration mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChange {
    pub id: i64,
    pub change_type: ChangeType,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub description: String,
    pub changed_by: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit row for an availability transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityLog {
    pub id: i64,
    pub address_id: i64,
    pub available: bool,
    pub check_time: DateTime<Utc>,
    /// Dial error for an unavailable transition; empty when available.
    pub check_error: String,
    pub created_at: DateTime<Utc>,
}

// ===== Draft types for the write path =====

/// Draft backend for create/update.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBackend {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl NewBackend {
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("backend name must not be empty"));
        }
        Ok(())
    }
}

/// Draft address for create/update.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAddress {
    pub ip: String,
    pub port: u16,
}

impl NewAddress {
    pub fn validate(&self) -> Result<(), Error> {
        if self.ip.parse::<std::net::Ipv4Addr>().is_err() {
            return Err(Error::Validation(format!("invalid IP address: {}", self.ip)));
        }
        if self.port == 0 {
            return Err(Error::validation("port must be in 1..65535"));
        }
        Ok(())
    }
}

/// Draft backend set for create/update. Membership is replaced wholesale.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBackendSet {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub backend_ids: Vec<i64>,
}

impl NewBackendSet {
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("backend set name must not be empty"));
        }
        Ok(())
    }
}

/// Draft source definition for create/update.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSourceDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub spec: SourceSpec,
}

impl NewSourceDefinition {
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("source definition name must not be empty"));
        }
        self.spec.validate()
    }
}

fn default_enabled() -> bool {
    true
}

/// Draft rule for create/update.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRule {
    pub source_definition_id: i64,
    pub destination_port: u16,
    pub protocol: Protocol,
    pub backend_set_id: i64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl NewRule {
    pub fn validate(&self) -> Result<(), Error> {
        if self.destination_port == 0 {
            return Err(Error::validation("destination port must be in 1..65535"));
        }
        Ok(())
    }
}
