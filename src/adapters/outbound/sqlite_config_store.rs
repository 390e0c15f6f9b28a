//! SQLite Configuration Store
//!
//! Implements ConfigStore on an embedded SQLite database. Every mutation
//! runs in one transaction together with its ConfigChange append. A coarse
//! mutex serializes access to the single connection; statements run on the
//! blocking thread pool so the async runtime is never stalled.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::domain::entities::{
    ActiveRule, Address, AvailabilityLog, Backend, BackendSet, ChangeType, ConfigChange,
    EntityType, NewAddress, NewBackend, NewBackendSet, NewRule, NewSourceDefinition, Protocol,
    Rule, SourceDefinition,
};
use crate::domain::ports::{ConfigStore, ReconcileSnapshot};
use crate::domain::source::SourceSpec;
use crate::error::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backends (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS addresses (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    backend_id   INTEGER NOT NULL REFERENCES backends(id),
    ip           TEXT NOT NULL,
    port         INTEGER NOT NULL,
    available    INTEGER NOT NULL DEFAULT 1,
    last_checked TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backend_sets (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backend_set_backends (
    backend_set_id INTEGER NOT NULL REFERENCES backend_sets(id),
    backend_id     INTEGER NOT NULL REFERENCES backends(id),
    PRIMARY KEY (backend_set_id, backend_id)
);

CREATE TABLE IF NOT EXISTS source_definitions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    type        TEXT NOT NULL CHECK (type IN ('ip', 'subnet', 'range')),
    ip_address  TEXT,
    subnet      TEXT,
    range_start TEXT,
    range_end   TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rules (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    source_definition_id INTEGER NOT NULL REFERENCES source_definitions(id),
    destination_port     INTEGER NOT NULL,
    protocol             TEXT NOT NULL CHECK (protocol IN ('tcp', 'udp', 'all')),
    backend_set_id       INTEGER NOT NULL REFERENCES backend_sets(id),
    priority             INTEGER NOT NULL DEFAULT 0,
    enabled              INTEGER NOT NULL DEFAULT 1,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config_changes (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    change_type TEXT NOT NULL CHECK (change_type IN ('create', 'update', 'delete')),
    entity_type TEXT NOT NULL CHECK (entity_type IN
                    ('backend', 'address', 'backend_set', 'source_definition', 'rule')),
    entity_id   INTEGER NOT NULL,
    description TEXT NOT NULL,
    changed_by  TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS availability_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    address_id  INTEGER NOT NULL,
    available   INTEGER NOT NULL,
    check_time  TEXT NOT NULL,
    check_error TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL
);
"#;

/// SQLite-backed configuration store.
pub struct SqliteConfigStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConfigStore {
    /// Open (or create) the database file and migrate the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Fully in-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, Error> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool, holding
    /// the store mutex for the duration.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Internal(format!("storage task failed: {}", e)))?
    }
}

// ===== row mapping =====

fn conv_err(idx: usize, e: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_address(row: &Row) -> rusqlite::Result<Address> {
    Ok(Address {
        id: row.get(0)?,
        backend_id: row.get(1)?,
        ip: row.get(2)?,
        port: row.get::<_, i64>(3)? as u16,
        available: row.get::<_, i64>(4)? != 0,
        last_checked: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const ADDRESS_COLS: &str = "id, backend_id, ip, port, available, last_checked, created_at, updated_at";

fn row_to_backend(row: &Row) -> rusqlite::Result<Backend> {
    Ok(Backend {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        addresses: Vec::new(),
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn row_to_rule(row: &Row) -> rusqlite::Result<Rule> {
    let protocol = Protocol::from_str(&row.get::<_, String>(3)?).map_err(|e| conv_err(3, e))?;
    Ok(Rule {
        id: row.get(0)?,
        source_definition_id: row.get(1)?,
        destination_port: row.get::<_, i64>(2)? as u16,
        protocol,
        backend_set_id: row.get(4)?,
        priority: row.get(5)?,
        enabled: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const RULE_COLS: &str = "id, source_definition_id, destination_port, protocol, backend_set_id, priority, enabled, created_at, updated_at";

fn spec_from_columns(
    kind: &str,
    ip_address: Option<String>,
    subnet: Option<String>,
    range_start: Option<String>,
    range_end: Option<String>,
) -> Result<SourceSpec, Error> {
    match kind {
        "ip" => Ok(SourceSpec::Ip {
            ip_address: ip_address
                .ok_or_else(|| Error::validation("source definition of type ip has no ip_address"))?,
        }),
        "subnet" => Ok(SourceSpec::Subnet {
            subnet: subnet
                .ok_or_else(|| Error::validation("source definition of type subnet has no subnet"))?,
        }),
        "range" => Ok(SourceSpec::Range {
            range_start: range_start.ok_or_else(|| {
                Error::validation("source definition of type range has no range_start")
            })?,
            range_end: range_end.ok_or_else(|| {
                Error::validation("source definition of type range has no range_end")
            })?,
        }),
        other => Err(Error::Validation(format!(
            "unknown source definition type: {}",
            other
        ))),
    }
}

/// The four nullable storage columns of a source spec, by variant.
fn spec_columns(spec: &SourceSpec) -> (Option<&str>, Option<&str>, Option<&str>, Option<&str>) {
    match spec {
        SourceSpec::Ip { ip_address } => (Some(ip_address.as_str()), None, None, None),
        SourceSpec::Subnet { subnet } => (None, Some(subnet.as_str()), None, None),
        SourceSpec::Range {
            range_start,
            range_end,
        } => (None, None, Some(range_start.as_str()), Some(range_end.as_str())),
    }
}

fn row_to_source_definition(row: &Row) -> rusqlite::Result<SourceDefinition> {
    let spec = spec_from_columns(
        &row.get::<_, String>(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    )
    .map_err(|e| conv_err(3, e))?;
    Ok(SourceDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        spec,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const SOURCE_COLS: &str =
    "id, name, description, type, ip_address, subnet, range_start, range_end, created_at, updated_at";

// ===== shared query helpers =====

fn load_addresses_for(conn: &Connection, backend_id: i64) -> Result<Vec<Address>, Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM addresses WHERE backend_id = ?1 ORDER BY id",
        ADDRESS_COLS
    ))?;
    let addresses = stmt
        .query_map(params![backend_id], row_to_address)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(addresses)
}

fn load_backend(conn: &Connection, id: i64) -> Result<Backend, Error> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, created_at, updated_at FROM backends WHERE id = ?1",
    )?;
    let mut backend = stmt
        .query_row(params![id], row_to_backend)
        .optional()?
        .ok_or(Error::NotFound("backend"))?;
    backend.addresses = load_addresses_for(conn, id)?;
    Ok(backend)
}

fn load_backend_set(conn: &Connection, id: i64) -> Result<BackendSet, Error> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, created_at, updated_at FROM backend_sets WHERE id = ?1",
    )?;
    let mut set = stmt
        .query_row(params![id], |row| {
            Ok(BackendSet {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                backends: Vec::new(),
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })
        .optional()?
        .ok_or(Error::NotFound("backend set"))?;

    let mut member_stmt = conn.prepare(
        "SELECT b.id, b.name, b.description, b.created_at, b.updated_at
         FROM backends b
         JOIN backend_set_backends bsb ON bsb.backend_id = b.id
         WHERE bsb.backend_set_id = ?1
         ORDER BY b.id",
    )?;
    let members = member_stmt
        .query_map(params![id], row_to_backend)?
        .collect::<Result<Vec<_>, _>>()?;
    set.backends = members;
    for backend in &mut set.backends {
        backend.addresses = load_addresses_for(conn, backend.id)?;
    }
    Ok(set)
}

fn load_address(conn: &Connection, id: i64) -> Result<Address, Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM addresses WHERE id = ?1",
        ADDRESS_COLS
    ))?;
    stmt.query_row(params![id], row_to_address)
        .optional()?
        .ok_or(Error::NotFound("address"))
}

fn load_rule(conn: &Connection, id: i64) -> Result<Rule, Error> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM rules WHERE id = ?1", RULE_COLS))?;
    stmt.query_row(params![id], row_to_rule)
        .optional()?
        .ok_or(Error::NotFound("rule"))
}

fn load_source_definition(conn: &Connection, id: i64) -> Result<SourceDefinition, Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM source_definitions WHERE id = ?1",
        SOURCE_COLS
    ))?;
    stmt.query_row(params![id], row_to_source_definition)
        .optional()?
        .ok_or(Error::NotFound("source definition"))
}

fn query_active_rules(conn: &Connection) -> Result<Vec<ActiveRule>, Error> {
    let mut stmt = conn.prepare(
        "SELECT r.id, r.priority, r.destination_port, r.protocol, r.backend_set_id,
                s.type, s.ip_address, s.subnet, s.range_start, s.range_end
         FROM rules r
         JOIN source_definitions s ON s.id = r.source_definition_id
         WHERE r.enabled = 1
         ORDER BY r.priority DESC, r.id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let source = spec_from_columns(
            &row.get::<_, String>(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
        )
        .map_err(|e| conv_err(5, e))?;
        Ok(ActiveRule {
            id: row.get(0)?,
            priority: row.get(1)?,
            destination_port: row.get::<_, i64>(2)? as u16,
            protocol: row.get(3)?,
            backend_set_id: row.get(4)?,
            source,
        })
    })?;

    let mut rules = Vec::new();
    for row in rows {
        match row {
            Ok(rule) => rules.push(rule),
            // corrupt source columns skip only the rule they belong to
            Err(e @ rusqlite::Error::FromSqlConversionFailure(..)) => {
                tracing::error!("skipping active rule with invalid source fields: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(rules)
}

fn query_available_addresses(conn: &Connection, backend_set_id: i64) -> Result<Vec<Address>, Error> {
    let mut stmt = conn.prepare(
        "SELECT a.id, a.backend_id, a.ip, a.port, a.available, a.last_checked, a.created_at, a.updated_at
         FROM addresses a
         JOIN backends b ON a.backend_id = b.id
         JOIN backend_set_backends bsb ON b.id = bsb.backend_id
         WHERE bsb.backend_set_id = ?1 AND a.available = 1
         ORDER BY a.id",
    )?;
    let addresses = stmt
        .query_map(params![backend_set_id], row_to_address)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(addresses)
}

fn count_rules_referencing(
    conn: &Connection,
    column: &str,
    id: i64,
) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM rules WHERE {} = ?1", column),
        params![id],
        |row| row.get(0),
    )
}

fn append_change(
    tx: &Transaction,
    change_type: ChangeType,
    entity_type: EntityType,
    entity_id: i64,
    description: &str,
    actor: &str,
    at: DateTime<Utc>,
) -> Result<(), rusqlite::Error> {
    tx.execute(
        "INSERT INTO config_changes (change_type, entity_type, entity_id, description, changed_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            change_type.as_str(),
            entity_type.as_str(),
            entity_id,
            description,
            actor,
            at
        ],
    )?;
    Ok(())
}

fn unique_to_invariant(e: rusqlite::Error, message: &str) -> Error {
    match e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::InvariantViolation(message.to_string())
        }
        other => Error::Storage(other),
    }
}

fn ensure_backend_exists(conn: &Connection, id: i64) -> Result<(), Error> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM backends WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(Error::NotFound("backend")),
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    // ===== reads =====

    async fn list_backends(&self) -> Result<Vec<Backend>, Error> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, created_at, updated_at FROM backends ORDER BY id",
            )?;
            let mut backends = stmt
                .query_map([], row_to_backend)?
                .collect::<Result<Vec<_>, _>>()?;
            for backend in &mut backends {
                backend.addresses = load_addresses_for(conn, backend.id)?;
            }
            Ok(backends)
        })
        .await
    }

    async fn get_backend(&self, id: i64) -> Result<Backend, Error> {
        self.with_conn(move |conn| load_backend(conn, id)).await
    }

    async fn get_address(&self, id: i64) -> Result<Address, Error> {
        self.with_conn(move |conn| load_address(conn, id)).await
    }

    async fn list_backend_sets(&self) -> Result<Vec<BackendSet>, Error> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM backend_sets ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids.into_iter().map(|id| load_backend_set(conn, id)).collect()
        })
        .await
    }

    async fn get_backend_set(&self, id: i64) -> Result<BackendSet, Error> {
        self.with_conn(move |conn| load_backend_set(conn, id)).await
    }

    async fn list_source_definitions(&self) -> Result<Vec<SourceDefinition>, Error> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM source_definitions ORDER BY id",
                SOURCE_COLS
            ))?;
            let defs = stmt
                .query_map([], row_to_source_definition)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(defs)
        })
        .await
    }

    async fn get_source_definition(&self, id: i64) -> Result<SourceDefinition, Error> {
        self.with_conn(move |conn| load_source_definition(conn, id))
            .await
    }

    async fn list_rules(&self) -> Result<Vec<Rule>, Error> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM rules ORDER BY id", RULE_COLS))?;
            let rules = stmt
                .query_map([], row_to_rule)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rules)
        })
        .await
    }

    async fn get_rule(&self, id: i64) -> Result<Rule, Error> {
        self.with_conn(move |conn| load_rule(conn, id)).await
    }

    async fn active_rules(&self) -> Result<Vec<ActiveRule>, Error> {
        self.with_conn(|conn| query_active_rules(conn)).await
    }

    async fn available_addresses(&self, backend_set_id: i64) -> Result<Vec<Address>, Error> {
        self.with_conn(move |conn| query_available_addresses(conn, backend_set_id))
            .await
    }

    /// Both reads run under one acquisition of the store mutex, so the
    /// reconciler observes rules and availability as a single snapshot.
    async fn reconcile_snapshot(&self) -> Result<ReconcileSnapshot, Error> {
        self.with_conn(|conn| {
            let rules = query_active_rules(conn)?;
            let mut addresses = HashMap::new();
            for rule in &rules {
                if !addresses.contains_key(&rule.backend_set_id) {
                    let addrs = query_available_addresses(conn, rule.backend_set_id)?;
                    addresses.insert(rule.backend_set_id, addrs);
                }
            }
            Ok(ReconcileSnapshot { rules, addresses })
        })
        .await
    }

    async fn config_changes(&self, limit: i64, offset: i64) -> Result<Vec<ConfigChange>, Error> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, change_type, entity_type, entity_id, description, changed_by, created_at
                 FROM config_changes ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            )?;
            let changes = stmt
                .query_map(params![limit, offset], |row| {
                    let change_type = ChangeType::from_str(&row.get::<_, String>(1)?)
                        .map_err(|e| conv_err(1, e))?;
                    let entity_type = EntityType::from_str(&row.get::<_, String>(2)?)
                        .map_err(|e| conv_err(2, e))?;
                    Ok(ConfigChange {
                        id: row.get(0)?,
                        change_type,
                        entity_type,
                        entity_id: row.get(3)?,
                        description: row.get(4)?,
                        changed_by: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(changes)
        })
        .await
    }

    async fn availability_logs(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AvailabilityLog>, Error> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, address_id, available, check_time, check_error, created_at
                 FROM availability_logs ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            )?;
            let logs = stmt
                .query_map(params![limit, offset], |row| {
                    Ok(AvailabilityLog {
                        id: row.get(0)?,
                        address_id: row.get(1)?,
                        available: row.get::<_, i64>(2)? != 0,
                        check_time: row.get(3)?,
                        check_error: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(logs)
        })
        .await
    }

    // ===== writes =====

    async fn create_backend(&self, draft: NewBackend, actor: &str) -> Result<Backend, Error> {
        draft.validate()?;
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "INSERT INTO backends (name, description, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![draft.name, draft.description, now, now],
            )
            .map_err(|e| unique_to_invariant(e, "backend name already exists"))?;
            let id = tx.last_insert_rowid();
            append_change(
                &tx,
                ChangeType::Create,
                EntityType::Backend,
                id,
                &format!("Created backend {}", draft.name),
                &actor,
                now,
            )?;
            tx.commit()?;
            Ok(Backend {
                id,
                name: draft.name,
                description: draft.description,
                addresses: Vec::new(),
                created_at: now,
                updated_at: now,
            })
        })
        .await
    }

    async fn update_backend(
        &self,
        id: i64,
        draft: NewBackend,
        actor: &str,
    ) -> Result<Backend, Error> {
        draft.validate()?;
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            load_backend(conn, id)?;
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "UPDATE backends SET name = ?1, description = ?2, updated_at = ?3 WHERE id = ?4",
                params![draft.name, draft.description, now, id],
            )
            .map_err(|e| unique_to_invariant(e, "backend name already exists"))?;
            append_change(
                &tx,
                ChangeType::Update,
                EntityType::Backend,
                id,
                &format!("Updated backend {}", draft.name),
                &actor,
                now,
            )?;
            tx.commit()?;
            load_backend(conn, id)
        })
        .await
    }

    async fn delete_backend(&self, id: i64, actor: &str) -> Result<(), Error> {
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            let backend = load_backend(conn, id)?;
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "DELETE FROM backend_set_backends WHERE backend_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM addresses WHERE backend_id = ?1", params![id])?;
            tx.execute("DELETE FROM backends WHERE id = ?1", params![id])?;
            append_change(
                &tx,
                ChangeType::Delete,
                EntityType::Backend,
                id,
                &format!("Deleted backend {}", backend.name),
                &actor,
                now,
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn create_address(
        &self,
        backend_id: i64,
        draft: NewAddress,
        actor: &str,
    ) -> Result<Address, Error> {
        draft.validate()?;
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            ensure_backend_exists(conn, backend_id)?;
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "INSERT INTO addresses (backend_id, ip, port, available, last_checked, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, NULL, ?4, ?5)",
                params![backend_id, draft.ip, i64::from(draft.port), now, now],
            )?;
            let id = tx.last_insert_rowid();
            append_change(
                &tx,
                ChangeType::Create,
                EntityType::Address,
                id,
                &format!(
                    "Added address {}:{} to backend ID {}",
                    draft.ip, draft.port, backend_id
                ),
                &actor,
                now,
            )?;
            tx.commit()?;
            Ok(Address {
                id,
                backend_id,
                ip: draft.ip,
                port: draft.port,
                available: true,
                last_checked: None,
                created_at: now,
                updated_at: now,
            })
        })
        .await
    }

    async fn update_address(
        &self,
        id: i64,
        draft: NewAddress,
        actor: &str,
    ) -> Result<Address, Error> {
        draft.validate()?;
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            load_address(conn, id)?;
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "UPDATE addresses SET ip = ?1, port = ?2, updated_at = ?3 WHERE id = ?4",
                params![draft.ip, i64::from(draft.port), now, id],
            )?;
            append_change(
                &tx,
                ChangeType::Update,
                EntityType::Address,
                id,
                &format!("Updated address {}:{}", draft.ip, draft.port),
                &actor,
                now,
            )?;
            tx.commit()?;
            load_address(conn, id)
        })
        .await
    }

    async fn delete_address(&self, id: i64, actor: &str) -> Result<(), Error> {
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            let address = load_address(conn, id)?;
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute("DELETE FROM addresses WHERE id = ?1", params![id])?;
            append_change(
                &tx,
                ChangeType::Delete,
                EntityType::Address,
                id,
                &format!("Deleted address {}:{}", address.ip, address.port),
                &actor,
                now,
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn create_backend_set(
        &self,
        draft: NewBackendSet,
        actor: &str,
    ) -> Result<BackendSet, Error> {
        draft.validate()?;
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            for backend_id in &draft.backend_ids {
                ensure_backend_exists(conn, *backend_id)
                    .map_err(|_| Error::Validation(format!("unknown backend id: {}", backend_id)))?;
            }
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "INSERT INTO backend_sets (name, description, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![draft.name, draft.description, now, now],
            )
            .map_err(|e| unique_to_invariant(e, "backend set name already exists"))?;
            let id = tx.last_insert_rowid();
            for backend_id in &draft.backend_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO backend_set_backends (backend_set_id, backend_id) VALUES (?1, ?2)",
                    params![id, backend_id],
                )?;
            }
            append_change(
                &tx,
                ChangeType::Create,
                EntityType::BackendSet,
                id,
                &format!("Created backend set {}", draft.name),
                &actor,
                now,
            )?;
            tx.commit()?;
            load_backend_set(conn, id)
        })
        .await
    }

    async fn update_backend_set(
        &self,
        id: i64,
        draft: NewBackendSet,
        actor: &str,
    ) -> Result<BackendSet, Error> {
        draft.validate()?;
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            load_backend_set(conn, id)?;
            for backend_id in &draft.backend_ids {
                ensure_backend_exists(conn, *backend_id)
                    .map_err(|_| Error::Validation(format!("unknown backend id: {}", backend_id)))?;
            }
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "UPDATE backend_sets SET name = ?1, description = ?2, updated_at = ?3 WHERE id = ?4",
                params![draft.name, draft.description, now, id],
            )
            .map_err(|e| unique_to_invariant(e, "backend set name already exists"))?;
            tx.execute(
                "DELETE FROM backend_set_backends WHERE backend_set_id = ?1",
                params![id],
            )?;
            for backend_id in &draft.backend_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO backend_set_backends (backend_set_id, backend_id) VALUES (?1, ?2)",
                    params![id, backend_id],
                )?;
            }
            append_change(
                &tx,
                ChangeType::Update,
                EntityType::BackendSet,
                id,
                &format!("Updated backend set {}", draft.name),
                &actor,
                now,
            )?;
            tx.commit()?;
            load_backend_set(conn, id)
        })
        .await
    }

    async fn delete_backend_set(&self, id: i64, actor: &str) -> Result<(), Error> {
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            let set = load_backend_set(conn, id)?;
            let referencing = count_rules_referencing(conn, "backend_set_id", id)?;
            if referencing > 0 {
                return Err(Error::in_use("backend set", referencing));
            }
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "DELETE FROM backend_set_backends WHERE backend_set_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM backend_sets WHERE id = ?1", params![id])?;
            append_change(
                &tx,
                ChangeType::Delete,
                EntityType::BackendSet,
                id,
                &format!("Deleted backend set {}", set.name),
                &actor,
                now,
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn create_source_definition(
        &self,
        draft: NewSourceDefinition,
        actor: &str,
    ) -> Result<SourceDefinition, Error> {
        draft.validate()?;
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let (ip_address, subnet, range_start, range_end) = spec_columns(&draft.spec);
            tx.execute(
                "INSERT INTO source_definitions
                 (name, description, type, ip_address, subnet, range_start, range_end, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    draft.name,
                    draft.description,
                    draft.spec.kind(),
                    ip_address,
                    subnet,
                    range_start,
                    range_end,
                    now,
                    now
                ],
            )
            .map_err(|e| unique_to_invariant(e, "source definition name already exists"))?;
            let id = tx.last_insert_rowid();
            append_change(
                &tx,
                ChangeType::Create,
                EntityType::SourceDefinition,
                id,
                &format!("Created source definition {}", draft.name),
                &actor,
                now,
            )?;
            tx.commit()?;
            load_source_definition(conn, id)
        })
        .await
    }

    async fn update_source_definition(
        &self,
        id: i64,
        draft: NewSourceDefinition,
        actor: &str,
    ) -> Result<SourceDefinition, Error> {
        draft.validate()?;
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            load_source_definition(conn, id)?;
            let tx = conn.transaction()?;
            let now = Utc::now();
            let (ip_address, subnet, range_start, range_end) = spec_columns(&draft.spec);
            tx.execute(
                "UPDATE source_definitions
                 SET name = ?1, description = ?2, type = ?3, ip_address = ?4, subnet = ?5,
                     range_start = ?6, range_end = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    draft.name,
                    draft.description,
                    draft.spec.kind(),
                    ip_address,
                    subnet,
                    range_start,
                    range_end,
                    now,
                    id
                ],
            )
            .map_err(|e| unique_to_invariant(e, "source definition name already exists"))?;
            append_change(
                &tx,
                ChangeType::Update,
                EntityType::SourceDefinition,
                id,
                &format!("Updated source definition {}", draft.name),
                &actor,
                now,
            )?;
            tx.commit()?;
            load_source_definition(conn, id)
        })
        .await
    }

    async fn delete_source_definition(&self, id: i64, actor: &str) -> Result<(), Error> {
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            let def = load_source_definition(conn, id)?;
            let referencing = count_rules_referencing(conn, "source_definition_id", id)?;
            if referencing > 0 {
                return Err(Error::in_use("source definition", referencing));
            }
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute("DELETE FROM source_definitions WHERE id = ?1", params![id])?;
            append_change(
                &tx,
                ChangeType::Delete,
                EntityType::SourceDefinition,
                id,
                &format!("Deleted source definition {}", def.name),
                &actor,
                now,
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn create_rule(&self, draft: NewRule, actor: &str) -> Result<Rule, Error> {
        draft.validate()?;
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            load_source_definition(conn, draft.source_definition_id).map_err(|_| {
                Error::Validation(format!(
                    "unknown source definition id: {}",
                    draft.source_definition_id
                ))
            })?;
            load_backend_set(conn, draft.backend_set_id).map_err(|_| {
                Error::Validation(format!("unknown backend set id: {}", draft.backend_set_id))
            })?;
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "INSERT INTO rules
                 (source_definition_id, destination_port, protocol, backend_set_id, priority, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    draft.source_definition_id,
                    i64::from(draft.destination_port),
                    draft.protocol.as_str(),
                    draft.backend_set_id,
                    draft.priority,
                    draft.enabled,
                    now,
                    now
                ],
            )?;
            let id = tx.last_insert_rowid();
            append_change(
                &tx,
                ChangeType::Create,
                EntityType::Rule,
                id,
                &format!("Created rule with priority {}", draft.priority),
                &actor,
                now,
            )?;
            tx.commit()?;
            load_rule(conn, id)
        })
        .await
    }

    async fn update_rule(&self, id: i64, draft: NewRule, actor: &str) -> Result<Rule, Error> {
        draft.validate()?;
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            load_rule(conn, id)?;
            load_source_definition(conn, draft.source_definition_id).map_err(|_| {
                Error::Validation(format!(
                    "unknown source definition id: {}",
                    draft.source_definition_id
                ))
            })?;
            load_backend_set(conn, draft.backend_set_id).map_err(|_| {
                Error::Validation(format!("unknown backend set id: {}", draft.backend_set_id))
            })?;
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "UPDATE rules
                 SET source_definition_id = ?1, destination_port = ?2, protocol = ?3,
                     backend_set_id = ?4, priority = ?5, enabled = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    draft.source_definition_id,
                    i64::from(draft.destination_port),
                    draft.protocol.as_str(),
                    draft.backend_set_id,
                    draft.priority,
                    draft.enabled,
                    now,
                    id
                ],
            )?;
            append_change(
                &tx,
                ChangeType::Update,
                EntityType::Rule,
                id,
                &format!("Updated rule with priority {}", draft.priority),
                &actor,
                now,
            )?;
            tx.commit()?;
            load_rule(conn, id)
        })
        .await
    }

    async fn delete_rule(&self, id: i64, actor: &str) -> Result<(), Error> {
        let actor = actor.to_string();
        self.with_conn(move |conn| {
            let rule = load_rule(conn, id)?;
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute("DELETE FROM rules WHERE id = ?1", params![id])?;
            append_change(
                &tx,
                ChangeType::Delete,
                EntityType::Rule,
                id,
                &format!("Deleted rule with priority {}", rule.priority),
                &actor,
                now,
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn record_transition(
        &self,
        address_id: i64,
        available: bool,
        check_error: Option<String>,
    ) -> Result<(), Error> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            // flag first, history second, same transaction
            let updated = tx.execute(
                "UPDATE addresses SET available = ?1, last_checked = ?2, updated_at = ?3 WHERE id = ?4",
                params![available, now, now, address_id],
            )?;
            if updated == 0 {
                return Err(Error::NotFound("address"));
            }
            tx.execute(
                "INSERT INTO availability_logs (address_id, available, check_time, check_error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    address_id,
                    available,
                    now,
                    check_error.unwrap_or_default(),
                    now
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
