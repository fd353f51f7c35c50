//! SQLite persistence for server and proxy records
//!
//! The registry rows are the durable source of truth for the fleet: one row
//! per backend server plus a single proxy row under a fixed identifier.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Fixed identifier of the singleton proxy row
pub const PROXY_ID: &str = "main-proxy";

/// Lifecycle state of a managed container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Provisioning,
    Running,
    Stopped,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Provisioning => "provisioning",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Failed => "failed",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "provisioning" => Status::Provisioning,
            "running" => Status::Running,
            "failed" => Status::Failed,
            _ => Status::Stopped,
        }
    }
}

/// Backend server record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub container_id: Option<String>,
    pub volume_id: String,
    pub status: Status,
    pub max_players: u32,
    pub motd: String,
    pub version: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Singleton proxy record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: String,
    pub name: String,
    pub container_id: Option<String>,
    pub volume_id: String,
    pub default_server_id: Option<String>,
    pub status: Status,
    pub port: u16,
    pub created_at: String,
    pub updated_at: String,
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Validation(format!(
                    "cannot create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;

        // WAL mode for better concurrency under parallel request handling
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

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
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );

            if current_version < 1 {
                self.migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: servers and proxy tables
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(
            r#"
            -- Backend server registry; name doubles as the network alias,
            -- so uniqueness is load-bearing for routing
            CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                container_id TEXT,
                volume_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'provisioning',
                max_players INTEGER NOT NULL DEFAULT 20,
                motd TEXT NOT NULL DEFAULT '',
                version TEXT NOT NULL DEFAULT 'LATEST',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Proxy registry; the primary key on the fixed id keeps the
            -- row a singleton even when two creators race
            CREATE TABLE IF NOT EXISTS proxy (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                container_id TEXT,
                volume_id TEXT NOT NULL,
                default_server_id TEXT,
                status TEXT NOT NULL DEFAULT 'provisioning',
                port INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_servers_name ON servers(name);

            -- Record migration
            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }

    // ==================== Server Operations ====================

    /// Insert a new server row; a duplicate name is a conflict
    pub fn create_server(&self, server: &ServerRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO servers (id, name, container_id, volume_id, status, max_players, motd, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                server.id,
                server.name,
                server.container_id,
                server.volume_id,
                server.status.as_str(),
                server.max_players,
                server.motd,
                server.version,
            ],
        )
        .map_err(|e| {
            constraint_to_conflict(
                e,
                format!("server name '{}' is already in use", server.name),
            )
        })?;
        debug!(id = %server.id, name = %server.name, "Server created in database");
        Ok(())
    }

    /// Get a server by id
    pub fn get_server(&self, id: &str) -> Result<Option<ServerRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, name, container_id, volume_id, status, max_players, motd, version,
                        created_at, updated_at
                 FROM servers WHERE id = ?1",
                params![id],
                server_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Get a server by its unique name
    pub fn get_server_by_name(&self, name: &str) -> Result<Option<ServerRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, name, container_id, volume_id, status, max_players, motd, version,
                        created_at, updated_at
                 FROM servers WHERE name = ?1",
                params![name],
                server_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// List all servers
    pub fn list_servers(&self) -> Result<Vec<ServerRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, container_id, volume_id, status, max_players, motd, version,
                    created_at, updated_at
             FROM servers ORDER BY created_at, id",
        )?;

        let servers = stmt
            .query_map([], server_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(servers)
    }

    /// Replace a server row in full
    pub fn update_server(&self, server: &ServerRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE servers
             SET name = ?2, container_id = ?3, volume_id = ?4, status = ?5,
                 max_players = ?6, motd = ?7, version = ?8, updated_at = datetime('now')
             WHERE id = ?1",
            params![
                server.id,
                server.name,
                server.container_id,
                server.volume_id,
                server.status.as_str(),
                server.max_players,
                server.motd,
                server.version,
            ],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("server '{}'", server.id)));
        }
        debug!(id = %server.id, status = server.status.as_str(), "Server updated in database");
        Ok(())
    }

    /// Hard-delete a server row
    pub fn delete_server(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM servers WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(Error::NotFound(format!("server '{}'", id)));
        }
        debug!(id, "Server deleted from database");
        Ok(())
    }

    // ==================== Proxy Operations ====================

    /// Insert the proxy row; a second insert under the same id is a conflict,
    /// which callers treat as "someone else created it"
    pub fn create_proxy(&self, proxy: &ProxyRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO proxy (id, name, container_id, volume_id, default_server_id, status, port)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                proxy.id,
                proxy.name,
                proxy.container_id,
                proxy.volume_id,
                proxy.default_server_id,
                proxy.status.as_str(),
                proxy.port,
            ],
        )
        .map_err(|e| constraint_to_conflict(e, format!("proxy '{}' already exists", proxy.id)))?;
        debug!(id = %proxy.id, "Proxy created in database");
        Ok(())
    }

    /// Get a proxy by id
    pub fn get_proxy(&self, id: &str) -> Result<Option<ProxyRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, name, container_id, volume_id, default_server_id, status, port,
                        created_at, updated_at
                 FROM proxy WHERE id = ?1",
                params![id],
                proxy_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Get a proxy by name
    pub fn get_proxy_by_name(&self, name: &str) -> Result<Option<ProxyRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, name, container_id, volume_id, default_server_id, status, port,
                        created_at, updated_at
                 FROM proxy WHERE name = ?1",
                params![name],
                proxy_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// List all proxy rows (at most one under the singleton invariant)
    pub fn list_proxies(&self) -> Result<Vec<ProxyRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, container_id, volume_id, default_server_id, status, port,
                    created_at, updated_at
             FROM proxy",
        )?;

        let proxies = stmt
            .query_map([], proxy_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(proxies)
    }

    /// Replace the proxy row in full
    pub fn update_proxy(&self, proxy: &ProxyRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE proxy
             SET name = ?2, container_id = ?3, volume_id = ?4, default_server_id = ?5,
                 status = ?6, port = ?7, updated_at = datetime('now')
             WHERE id = ?1",
            params![
                proxy.id,
                proxy.name,
                proxy.container_id,
                proxy.volume_id,
                proxy.default_server_id,
                proxy.status.as_str(),
                proxy.port,
            ],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("proxy '{}'", proxy.id)));
        }
        debug!(id = %proxy.id, status = proxy.status.as_str(), "Proxy updated in database");
        Ok(())
    }

    /// Hard-delete the proxy row
    pub fn delete_proxy(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM proxy WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(Error::NotFound(format!("proxy '{}'", id)));
        }
        debug!(id, "Proxy deleted from database");
        Ok(())
    }
}

fn server_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServerRecord> {
    let status: String = row.get(4)?;
    Ok(ServerRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        container_id: row.get(2)?,
        volume_id: row.get(3)?,
        status: Status::from_db(&status),
        max_players: row.get(5)?,
        motd: row.get(6)?,
        version: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn proxy_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProxyRecord> {
    let status: String = row.get(5)?;
    Ok(ProxyRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        container_id: row.get(2)?,
        volume_id: row.get(3)?,
        default_server_id: row.get(4)?,
        status: Status::from_db(&status),
        port: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Map UNIQUE/PRIMARY KEY violations to Conflict; pass other failures through
fn constraint_to_conflict(e: rusqlite::Error, message: String) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::Conflict(message)
        }
        _ => Error::Database(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_server(id: &str, name: &str) -> ServerRecord {
        ServerRecord {
            id: id.to_string(),
            name: name.to_string(),
            container_id: Some(format!("ctr-{}", id)),
            volume_id: format!("mc-server-{}", id),
            status: Status::Provisioning,
            max_players: 20,
            motd: format!("Minecraft Server - {}", name),
            version: "LATEST".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn sample_proxy() -> ProxyRecord {
        ProxyRecord {
            id: PROXY_ID.to_string(),
            name: "Main Proxy".to_string(),
            container_id: Some("ctr-proxy".to_string()),
            volume_id: "mc-proxy-main".to_string(),
            default_server_id: None,
            status: Status::Provisioning,
            port: 25565,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_server_crud() {
        let db = Database::open_in_memory().unwrap();

        db.create_server(&sample_server("a1", "alpha")).unwrap();

        let server = db.get_server("a1").unwrap().unwrap();
        assert_eq!(server.name, "alpha");
        assert_eq!(server.status, Status::Provisioning);
        assert_eq!(server.max_players, 20);
        assert!(!server.created_at.is_empty());

        let by_name = db.get_server_by_name("alpha").unwrap().unwrap();
        assert_eq!(by_name.id, "a1");

        let mut server = server;
        server.status = Status::Running;
        db.update_server(&server).unwrap();
        assert_eq!(
            db.get_server("a1").unwrap().unwrap().status,
            Status::Running
        );

        db.delete_server("a1").unwrap();
        assert!(db.get_server("a1").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_server_name_is_conflict() {
        let db = Database::open_in_memory().unwrap();
        db.create_server(&sample_server("a1", "alpha")).unwrap();

        let err = db
            .create_server(&sample_server("a2", "alpha"))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // the losing insert must not leave a row behind
        assert!(db.get_server("a2").unwrap().is_none());
        assert_eq!(db.list_servers().unwrap().len(), 1);
    }

    #[test]
    fn test_update_missing_server_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db.update_server(&sample_server("ghost", "ghost")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = db.delete_server("ghost").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_proxy_singleton_insert_conflicts() {
        let db = Database::open_in_memory().unwrap();
        db.create_proxy(&sample_proxy()).unwrap();

        let err = db.create_proxy(&sample_proxy()).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        assert_eq!(db.list_proxies().unwrap().len(), 1);
    }

    #[test]
    fn test_proxy_default_target_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        db.create_proxy(&sample_proxy()).unwrap();

        let mut proxy = db.get_proxy(PROXY_ID).unwrap().unwrap();
        assert!(proxy.default_server_id.is_none());

        proxy.default_server_id = Some("a1".to_string());
        db.update_proxy(&proxy).unwrap();

        let proxy = db.get_proxy(PROXY_ID).unwrap().unwrap();
        assert_eq!(proxy.default_server_id.as_deref(), Some("a1"));

        let by_name = db.get_proxy_by_name("Main Proxy").unwrap().unwrap();
        assert_eq!(by_name.id, PROXY_ID);
    }

    #[test]
    fn test_open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");

        {
            let db = Database::open(&path).unwrap();
            db.create_server(&sample_server("a1", "alpha")).unwrap();
        }

        // reopening skips already-applied migrations and keeps the data
        let db = Database::open(&path).unwrap();
        assert_eq!(db.list_servers().unwrap().len(), 1);
    }

    #[test]
    fn test_status_from_db_strings() {
        assert_eq!(Status::from_db("provisioning"), Status::Provisioning);
        assert_eq!(Status::from_db("running"), Status::Running);
        assert_eq!(Status::from_db("stopped"), Status::Stopped);
        assert_eq!(Status::from_db("failed"), Status::Failed);
        // unknown strings degrade to stopped rather than failing the read
        assert_eq!(Status::from_db("exotic"), Status::Stopped);
    }
}
