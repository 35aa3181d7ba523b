//! SQLite-backed site registry
//!
//! The registry is the single durable store: sites with their domain, port
//! and deployment state, plus the append-only deployment records. The set
//! of ports in use is never stored on its own; it is always derived from
//! the `port` column of the `sites` table, which carries a unique index.
//! Every hostname a site routes (domain, aliases and any `www.` variant)
//! is claimed in `site_hostnames`, so no two sites can route the same name.
//! State writes are checked against [`SiteState::can_transition_to`].

use crate::audit::{AuditAction, AuditStatus, DeploymentRecord};
use crate::site::{Site, SiteState, WorkloadRef};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 3;

const SITE_COLUMNS: &str = "name, kind, domain, aliases, tls_enabled, port, state, workload_ref,
     last_step, last_error, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("site name '{0}' is already registered")]
    DuplicateName(String),
    #[error("hostname '{0}' is already routed to another site")]
    DuplicateDomain(String),
    #[error("site '{0}' not found")]
    NotFound(String),
    #[error("port {0} is already assigned to another site")]
    PortConflict(u16),
    #[error("site '{name}' cannot move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: SiteState,
        to: SiteState,
    },
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to prepare registry location: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry handle; clones share one connection
#[derive(Clone)]
pub struct Registry {
    conn: Arc<Mutex<Connection>>,
}

impl Registry {
    /// Open or create a registry at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.run_migrations()?;

        info!("Registry opened at {}", path.display());
        Ok(registry)
    }

    /// Open an in-memory registry (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.run_migrations()?;
        Ok(registry)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }

            if current_version < 3 {
                Self::migrate_v3(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: sites table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: sites");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                domain TEXT NOT NULL UNIQUE,
                aliases TEXT NOT NULL DEFAULT '[]',
                tls_enabled INTEGER NOT NULL DEFAULT 0,
                port INTEGER UNIQUE,
                state TEXT NOT NULL DEFAULT 'pending',
                workload_ref TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sites_state ON sites(state);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    /// Migration v2: deployment records and failure bookkeeping
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: deployment records");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deployment_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                run_id TEXT NOT NULL,
                site_name TEXT NOT NULL,
                action TEXT NOT NULL,
                step TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_deployment_records_site
                ON deployment_records(site_name, timestamp);

            ALTER TABLE sites ADD COLUMN last_step TEXT;
            ALTER TABLE sites ADD COLUMN last_error TEXT;

            INSERT INTO schema_migrations (version) VALUES (2);
        "#,
        )?;

        Ok(())
    }

    /// Migration v3: hostname claims, backfilled from domains and aliases
    fn migrate_v3(conn: &Connection) -> Result<()> {
        debug!("Applying migration v3: site hostnames");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS site_hostnames (
                hostname TEXT PRIMARY KEY,
                site_name TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_site_hostnames_site ON site_hostnames(site_name);

            INSERT OR IGNORE INTO site_hostnames (hostname, site_name)
                SELECT domain, name FROM sites;
            INSERT OR IGNORE INTO site_hostnames (hostname, site_name)
                SELECT json_each.value, sites.name FROM sites, json_each(sites.aliases);

            INSERT INTO schema_migrations (version) VALUES (3);
        "#,
        )?;

        Ok(())
    }

    // ==================== Site Operations ====================

    /// Reserve a site's name and every hostname it routes: its domain, its
    /// aliases and `extra_hostnames` (such as a `www.` variant). Fails with
    /// `DuplicateName` or `DuplicateDomain` without touching existing rows.
    pub fn create(&self, site: &Site, extra_hostnames: &[String]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let name_taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM sites WHERE name = ?1)",
            params![site.name],
            |row| row.get(0),
        )?;
        if name_taken {
            return Err(RegistryError::DuplicateName(site.name.clone()));
        }

        let domain_taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM sites WHERE domain = ?1)",
            params![site.domain],
            |row| row.get(0),
        )?;
        if domain_taken {
            return Err(RegistryError::DuplicateDomain(site.domain.clone()));
        }

        let hostnames = hostname_set(&site.domain, &site.aliases, extra_hostnames);
        claim_hostnames(&tx, &site.name, &hostnames)?;

        let aliases = serde_json::to_string(&site.aliases).unwrap_or_else(|_| "[]".to_string());
        tx.execute(
            "INSERT INTO sites (name, kind, domain, aliases, tls_enabled, port, state, workload_ref,
                                last_step, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                site.name,
                site.kind.to_string(),
                site.domain,
                aliases,
                site.tls_enabled,
                site.port,
                site.state.to_string(),
                site.workload_ref.as_ref().map(|r| r.as_str()),
                site.last_step,
                site.last_error,
                site.created_at,
                site.updated_at,
            ],
        )
        .map_err(|e| constraint_error(e, site))?;

        tx.commit()?;
        debug!(site = %site.name, domain = %site.domain, hostnames = hostnames.len(), "Site reserved");
        Ok(())
    }

    /// Get a site by name
    pub fn get(&self, name: &str) -> Result<Option<Site>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM sites WHERE name = ?1", SITE_COLUMNS);
        Ok(conn.query_row(&sql, params![name], site_from_row).optional()?)
    }

    /// Get the site that owns a domain
    pub fn get_by_domain(&self, domain: &str) -> Result<Option<Site>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM sites WHERE domain = ?1", SITE_COLUMNS);
        Ok(conn.query_row(&sql, params![domain], site_from_row).optional()?)
    }

    /// List all sites ordered by name
    pub fn list(&self) -> Result<Vec<Site>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM sites ORDER BY name", SITE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sites)
    }

    /// Update a site's state
    pub fn update_state(&self, name: &str, state: SiteState) -> Result<()> {
        let conn = self.conn.lock();
        check_transition(&conn, name, state)?;
        let rows = conn.execute(
            "UPDATE sites SET state = ?1, updated_at = ?2 WHERE name = ?3",
            params![state.to_string(), Utc::now(), name],
        )?;
        not_found_if_zero(rows, name)
    }

    /// Record the last step that completed for a site
    pub fn set_last_step(&self, name: &str, step: &str) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE sites SET last_step = ?1, updated_at = ?2 WHERE name = ?3",
            params![step, Utc::now(), name],
        )?;
        not_found_if_zero(rows, name)
    }

    /// Replace the routing metadata of a site (used by redeploys). The
    /// site's hostname claims are replaced in the same transaction.
    pub fn update_routing(
        &self,
        name: &str,
        aliases: &[String],
        tls_enabled: bool,
        extra_hostnames: &[String],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let domain: String = tx
            .query_row("SELECT domain FROM sites WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        claim_hostnames(&tx, name, &hostname_set(&domain, aliases, extra_hostnames))?;

        let aliases = serde_json::to_string(aliases).unwrap_or_else(|_| "[]".to_string());
        tx.execute(
            "UPDATE sites SET aliases = ?1, tls_enabled = ?2, updated_at = ?3 WHERE name = ?4",
            params![aliases, tls_enabled, Utc::now(), name],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Hostnames claimed by a site, sorted
    pub fn hostnames(&self, name: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT hostname FROM site_hostnames WHERE site_name = ?1 ORDER BY hostname")?;
        let hostnames = stmt
            .query_map(params![name], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(hostnames)
    }

    /// Set (or clear) the workload handle of a site
    pub fn set_workload_ref(&self, name: &str, workload_ref: Option<&WorkloadRef>) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE sites SET workload_ref = ?1, updated_at = ?2 WHERE name = ?3",
            params![workload_ref.map(|r| r.as_str()), Utc::now(), name],
        )?;
        not_found_if_zero(rows, name)
    }

    /// Final commit of a successful deploy
    pub fn mark_live(&self, name: &str, port: u16, workload_ref: &WorkloadRef) -> Result<()> {
        let conn = self.conn.lock();
        check_transition(&conn, name, SiteState::Live)?;
        let rows = conn.execute(
            "UPDATE sites
             SET state = 'live', port = ?1, workload_ref = ?2, last_error = NULL, updated_at = ?3
             WHERE name = ?4",
            params![port, workload_ref.as_str(), Utc::now(), name],
        )?;
        not_found_if_zero(rows, name)
    }

    /// Move a site into a failure state and keep the error for inspection
    pub fn record_failure(&self, name: &str, state: SiteState, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        check_transition(&conn, name, state)?;
        let rows = conn.execute(
            "UPDATE sites SET state = ?1, last_error = ?2, updated_at = ?3 WHERE name = ?4",
            params![state.to_string(), error, Utc::now(), name],
        )?;
        not_found_if_zero(rows, name)
    }

    /// Delete a site row and its hostname claims. Only a site in
    /// `Deleting` can be removed; returns false when there is no such row.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if current_state(&tx, name)?.is_none() {
            return Ok(false);
        }
        check_transition(&tx, name, SiteState::Deleted)?;

        tx.execute("DELETE FROM site_hostnames WHERE site_name = ?1", params![name])?;
        let rows = tx.execute("DELETE FROM sites WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(rows > 0)
    }

    // ==================== Port Operations ====================

    /// All ports currently held by a site
    pub fn used_ports(&self) -> Result<BTreeSet<u16>> {
        let conn = self.conn.lock();
        used_ports_on(&conn, None)
    }

    /// Atomically pick and assign a port to `owner`, moving it to
    /// `Provisioning`.
    ///
    /// `choose` receives the ports held by every other site and runs inside
    /// the same transaction as the write, so two concurrent callers can
    /// never be handed the same port. It must not block.
    pub fn assign_port<E, F>(&self, owner: &str, choose: F) -> std::result::Result<u16, E>
    where
        E: From<RegistryError>,
        F: FnOnce(&BTreeSet<u16>) -> std::result::Result<u16, E>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(RegistryError::from)?;

        check_transition(&tx, owner, SiteState::Provisioning)?;
        let used = used_ports_on(&tx, Some(owner))?;
        let port = choose(&used)?;

        let rows = tx
            .execute(
                "UPDATE sites SET port = ?1, state = 'provisioning', updated_at = ?2 WHERE name = ?3",
                params![port, Utc::now(), owner],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref err, _)
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    RegistryError::PortConflict(port)
                }
                other => RegistryError::Database(other),
            })?;
        if rows == 0 {
            return Err(RegistryError::NotFound(owner.to_string()).into());
        }

        tx.commit().map_err(RegistryError::from)?;
        Ok(port)
    }

    /// Detach a port from whichever site holds it. Returns whether anything
    /// was released.
    pub fn release_port(&self, port: u16) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE sites SET port = NULL, updated_at = ?1 WHERE port = ?2",
            params![Utc::now(), port],
        )?;
        Ok(rows > 0)
    }

    // ==================== Audit Operations ====================

    /// Append a deployment record
    pub fn append_record(&self, record: &DeploymentRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO deployment_records (timestamp, run_id, site_name, action, step, status, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.timestamp,
                record.run_id,
                record.site_name,
                record.action.to_string(),
                record.step,
                record.status.to_string(),
                record.message,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Deployment records, newest first, optionally for one site
    pub fn records(&self, site_name: Option<&str>, limit: usize) -> Result<Vec<DeploymentRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, run_id, site_name, action, step, status, message
             FROM deployment_records
             WHERE ?1 IS NULL OR site_name = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;

        let records = stmt
            .query_map(params![site_name, limit as i64], |row| {
                Ok(DeploymentRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    run_id: row.get(2)?,
                    site_name: row.get(3)?,
                    action: parse_column::<AuditAction>(row, 4)?,
                    step: row.get(5)?,
                    status: parse_column::<AuditStatus>(row, 6)?,
                    message: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }
}

fn used_ports_on(conn: &Connection, exclude: Option<&str>) -> Result<BTreeSet<u16>> {
    let mut stmt = conn.prepare(
        "SELECT port FROM sites WHERE port IS NOT NULL AND (?1 IS NULL OR name != ?1)",
    )?;
    let ports = stmt
        .query_map(params![exclude], |row| row.get::<_, u16>(0))?
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;
    Ok(ports)
}

/// Domain, then aliases, then extra names, without duplicates
fn hostname_set(domain: &str, aliases: &[String], extra: &[String]) -> Vec<String> {
    let mut hostnames = vec![domain.to_string()];
    for hostname in aliases.iter().chain(extra) {
        if !hostnames.contains(hostname) {
            hostnames.push(hostname.clone());
        }
    }
    hostnames
}

/// Replace `owner`'s hostname claims with `hostnames`, failing on the first
/// name another site already routes
fn claim_hostnames(conn: &Connection, owner: &str, hostnames: &[String]) -> Result<()> {
    for hostname in hostnames {
        let holder: Option<String> = conn
            .query_row(
                "SELECT site_name FROM site_hostnames WHERE hostname = ?1",
                params![hostname],
                |row| row.get(0),
            )
            .optional()?;
        if holder.is_some_and(|holder| holder != owner) {
            return Err(RegistryError::DuplicateDomain(hostname.clone()));
        }
    }

    conn.execute("DELETE FROM site_hostnames WHERE site_name = ?1", params![owner])?;
    for hostname in hostnames {
        conn.execute(
            "INSERT INTO site_hostnames (hostname, site_name) VALUES (?1, ?2)",
            params![hostname, owner],
        )?;
    }
    Ok(())
}

fn current_state(conn: &Connection, name: &str) -> Result<Option<SiteState>> {
    conn.query_row("SELECT state FROM sites WHERE name = ?1", params![name], |row| {
        parse_column::<SiteState>(row, 0)
    })
    .optional()
    .map_err(RegistryError::from)
}

/// Refuse a state write the site state machine does not allow
fn check_transition(conn: &Connection, name: &str, next: SiteState) -> Result<()> {
    let current =
        current_state(conn, name)?.ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(RegistryError::InvalidTransition {
            name: name.to_string(),
            from: current,
            to: next,
        })
    }
}

fn not_found_if_zero(rows: usize, name: &str) -> Result<()> {
    if rows == 0 {
        Err(RegistryError::NotFound(name.to_string()))
    } else {
        Ok(())
    }
}

/// Map a unique-index violation on insert to the matching duplicate error
fn constraint_error(err: rusqlite::Error, site: &Site) -> RegistryError {
    if let rusqlite::Error::SqliteFailure(ref failure, Some(ref msg)) = err {
        if failure.code == ErrorCode::ConstraintViolation {
            if msg.contains("sites.domain") {
                return RegistryError::DuplicateDomain(site.domain.clone());
            }
            if msg.contains("sites.name") {
                return RegistryError::DuplicateName(site.name.clone());
            }
            if let (true, Some(port)) = (msg.contains("sites.port"), site.port) {
                return RegistryError::PortConflict(port);
            }
        }
    }
    RegistryError::Database(err)
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<Site> {
    let aliases_raw: String = row.get(3)?;
    let aliases: Vec<String> = serde_json::from_str(&aliases_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(Site {
        name: row.get(0)?,
        kind: parse_column(row, 1)?,
        domain: row.get(2)?,
        aliases,
        tls_enabled: row.get(4)?,
        port: row.get(5)?,
        state: parse_column(row, 6)?,
        workload_ref: row.get::<_, Option<String>>(7)?.map(WorkloadRef),
        last_step: row.get(8)?,
        last_error: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::SiteKind;

    fn blog() -> Site {
        Site::pending("blog", SiteKind::Process, "blog.example.com")
    }

    #[test]
    fn test_create_and_get_site() {
        let registry = Registry::open_in_memory().unwrap();
        let site = blog().with_aliases(vec!["www.blog.example.com".to_string()]).with_tls(true);

        registry.create(&site, &[]).unwrap();

        let stored = registry.get("blog").unwrap().unwrap();
        assert_eq!(stored.name, "blog");
        assert_eq!(stored.kind, SiteKind::Process);
        assert_eq!(stored.state, SiteState::Pending);
        assert_eq!(stored.aliases, vec!["www.blog.example.com".to_string()]);
        assert!(stored.tls_enabled);
        assert_eq!(stored.port, None);

        let by_domain = registry.get_by_domain("blog.example.com").unwrap().unwrap();
        assert_eq!(by_domain.name, "blog");
        assert!(registry.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_name_and_domain() {
        let registry = Registry::open_in_memory().unwrap();
        registry.create(&blog(), &[]).unwrap();

        let same_name = Site::pending("blog", SiteKind::Process, "other.example.com");
        assert!(matches!(
            registry.create(&same_name, &[]),
            Err(RegistryError::DuplicateName(name)) if name == "blog"
        ));

        let same_domain = Site::pending("shop", SiteKind::Container, "blog.example.com");
        assert!(matches!(
            registry.create(&same_domain, &[]),
            Err(RegistryError::DuplicateDomain(domain)) if domain == "blog.example.com"
        ));

        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn test_assign_and_release_port() {
        let registry = Registry::open_in_memory().unwrap();
        registry.create(&blog(), &[]).unwrap();
        registry
            .create(&Site::pending("shop", SiteKind::Process, "shop.example.com"), &[])
            .unwrap();

        let port: std::result::Result<u16, RegistryError> = registry.assign_port("blog", |used| {
            assert!(used.is_empty());
            Ok(3000)
        });
        assert_eq!(port.unwrap(), 3000);

        let stored = registry.get("blog").unwrap().unwrap();
        assert_eq!(stored.port, Some(3000));
        assert_eq!(stored.state, SiteState::Provisioning);

        let port: std::result::Result<u16, RegistryError> = registry.assign_port("shop", |used| {
            assert!(used.contains(&3000));
            Ok(3000)
        });
        assert!(matches!(port, Err(RegistryError::PortConflict(3000))));

        assert!(registry.release_port(3000).unwrap());
        assert!(!registry.release_port(3000).unwrap());
        assert!(registry.used_ports().unwrap().is_empty());
    }

    #[test]
    fn test_assign_port_excludes_owner() {
        let registry = Registry::open_in_memory().unwrap();
        registry.create(&blog(), &[]).unwrap();
        let _: u16 = registry
            .assign_port::<RegistryError, _>("blog", |_| Ok(3005))
            .unwrap();
        registry.update_state("blog", SiteState::Routing).unwrap();
        registry.mark_live("blog", 3005, &WorkloadRef::new("blog")).unwrap();

        // Redeploying keeps the owner's own port available to it
        let port = registry
            .assign_port::<RegistryError, _>("blog", |used| {
                assert!(!used.contains(&3005));
                Ok(3005)
            })
            .unwrap();
        assert_eq!(port, 3005);
    }

    #[test]
    fn test_assign_port_unknown_site() {
        let registry = Registry::open_in_memory().unwrap();
        let result = registry.assign_port::<RegistryError, _>("ghost", |_| Ok(3000));
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
        assert!(registry.used_ports().unwrap().is_empty());
    }

    #[test]
    fn test_state_updates() {
        let registry = Registry::open_in_memory().unwrap();
        registry.create(&blog(), &[]).unwrap();

        let _: u16 = registry
            .assign_port::<RegistryError, _>("blog", |_| Ok(3000))
            .unwrap();
        registry.update_state("blog", SiteState::Routing).unwrap();
        registry.mark_live("blog", 3000, &WorkloadRef::new("blog")).unwrap();
        let live = registry.get("blog").unwrap().unwrap();
        assert_eq!(live.state, SiteState::Live);
        assert_eq!(live.port, Some(3000));
        assert_eq!(live.workload_ref, Some(WorkloadRef::new("blog")));

        registry
            .record_failure("blog", SiteState::Error, "route: nginx said no")
            .unwrap();
        let failed = registry.get("blog").unwrap().unwrap();
        assert_eq!(failed.state, SiteState::Error);
        assert_eq!(failed.last_error.as_deref(), Some("route: nginx said no"));

        assert!(matches!(
            registry.update_state("ghost", SiteState::Live),
            Err(RegistryError::NotFound(_))
        ));

        registry.update_state("blog", SiteState::Deleting).unwrap();
        assert!(registry.delete("blog").unwrap());
        assert!(!registry.delete("blog").unwrap());
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let registry = Registry::open_in_memory().unwrap();
        registry.create(&blog(), &[]).unwrap();

        assert!(matches!(
            registry.update_state("blog", SiteState::Routing),
            Err(RegistryError::InvalidTransition { from: SiteState::Pending, to: SiteState::Routing, .. })
        ));
        assert!(matches!(
            registry.mark_live("blog", 3000, &WorkloadRef::new("blog")),
            Err(RegistryError::InvalidTransition { .. })
        ));
        // Only a site being torn down can be removed
        assert!(matches!(registry.delete("blog"), Err(RegistryError::InvalidTransition { .. })));

        // A site being torn down never goes back to provisioning
        registry.update_state("blog", SiteState::Deleting).unwrap();
        let result = registry.assign_port::<RegistryError, _>("blog", |_| Ok(3000));
        assert!(matches!(
            result,
            Err(RegistryError::InvalidTransition { from: SiteState::Deleting, to: SiteState::Provisioning, .. })
        ));

        let site = registry.get("blog").unwrap().unwrap();
        assert_eq!(site.state, SiteState::Deleting);
        assert_eq!(site.port, None);
    }

    #[test]
    fn test_hostnames_are_claimed_once() {
        let registry = Registry::open_in_memory().unwrap();
        let www = vec!["www.blog.example.com".to_string()];
        let site = blog().with_aliases(vec!["shop.example.com".to_string()]);
        registry.create(&site, &www).unwrap();
        assert_eq!(
            registry.hostnames("blog").unwrap(),
            vec!["blog.example.com", "shop.example.com", "www.blog.example.com"]
        );

        // An alias of blog cannot become another site's domain
        let shop = Site::pending("shop", SiteKind::Process, "shop.example.com");
        assert!(matches!(
            registry.create(&shop, &[]),
            Err(RegistryError::DuplicateDomain(hostname)) if hostname == "shop.example.com"
        ));

        // Nor can another site list blog's www variant as an alias
        let news = Site::pending("news", SiteKind::Process, "news.example.com")
            .with_aliases(vec!["www.blog.example.com".to_string()]);
        assert!(matches!(
            registry.create(&news, &[]),
            Err(RegistryError::DuplicateDomain(hostname)) if hostname == "www.blog.example.com"
        ));
        assert!(registry.get("news").unwrap().is_none());
        assert!(registry.hostnames("news").unwrap().is_empty());

        // Dropping the alias frees it for others
        registry.update_routing("blog", &[], false, &www).unwrap();
        registry.create(&shop, &[]).unwrap();
        assert_eq!(registry.hostnames("shop").unwrap(), vec!["shop.example.com"]);

        // and blog cannot take it back
        assert!(matches!(
            registry.update_routing("blog", &["shop.example.com".to_string()], false, &www),
            Err(RegistryError::DuplicateDomain(_))
        ));
        assert!(registry.get("blog").unwrap().unwrap().aliases.is_empty());
    }

    #[test]
    fn test_delete_releases_hostnames() {
        let registry = Registry::open_in_memory().unwrap();
        registry.create(&blog(), &["www.blog.example.com".to_string()]).unwrap();
        registry.update_state("blog", SiteState::Deleting).unwrap();
        assert!(registry.delete("blog").unwrap());
        assert!(registry.hostnames("blog").unwrap().is_empty());

        let site = Site::pending("other", SiteKind::Process, "www.blog.example.com");
        registry.create(&site, &[]).unwrap();
    }

    #[test]
    fn test_reopen_file_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("registry.db");

        {
            let registry = Registry::open(&path).unwrap();
            registry.create(&blog(), &[]).unwrap();
        }

        let registry = Registry::open(&path).unwrap();
        assert!(registry.get("blog").unwrap().is_some());
    }
}
