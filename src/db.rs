//! SQLite database for domain bindings and certificate material
//!
//! Both the domain registry and the certificate store persist here. Access is
//! serialized through a single connection, and uniqueness is enforced by the
//! schema so concurrent identical registrations cannot produce duplicate rows.

use crate::config::StoreLocation;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const BINDING_COLUMNS: &str =
    "id, domain, owner_email, endpoint_type, access_token, created_at, updated_at";

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // WAL keeps readers (routing, handshakes) off the writer's lock
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Open the store described by configuration
    pub fn open_location(location: &StoreLocation) -> Result<Self> {
        match location {
            StoreLocation::Memory => Self::open_in_memory(),
            StoreLocation::File(path) => Self::open(path),
        }
    }

    /// Run a store operation on the blocking pool so async callers yield instead of stalling a worker
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| anyhow::anyhow!("Storage task failed: {}", e))?
    }

    /// Run database migrations
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
                self.migrate_v1(&conn)?;
            }

            if current_version < 2 {
                self.migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: domain bindings
    fn migrate_v1(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: domain bindings");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS domain_bindings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL,
                owner_email TEXT NOT NULL,
                endpoint_type TEXT,
                access_token TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (owner_email, domain)
            );

            -- Routing looks bindings up by domain alone
            CREATE INDEX IF NOT EXISTS idx_bindings_domain ON domain_bindings(domain);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    /// Migration v2: certificate material
    fn migrate_v2(&self, conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: certificates");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS certificates (
                domain TEXT PRIMARY KEY,
                private_key TEXT NOT NULL,
                certificate TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO schema_migrations (version) VALUES (2);
        "#)?;

        Ok(())
    }

    // ==================== Domain Bindings ====================

    /// Create the (owner, domain) binding or update it in place.
    ///
    /// `endpoint_type` and `access_token` only overwrite stored values when `Some`.
    pub fn upsert_binding(
        &self,
        owner_email: &str,
        domain: &str,
        endpoint_type: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<DomainBinding> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO domain_bindings (owner_email, domain, endpoint_type, access_token)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (owner_email, domain) DO UPDATE SET
                endpoint_type = COALESCE(excluded.endpoint_type, domain_bindings.endpoint_type),
                access_token = COALESCE(excluded.access_token, domain_bindings.access_token),
                updated_at = datetime('now')",
            params![owner_email, domain, endpoint_type, access_token],
        )?;

        conn.query_row(
            &format!(
                "SELECT {} FROM domain_bindings WHERE owner_email = ?1 AND domain = ?2",
                BINDING_COLUMNS
            ),
            params![owner_email, domain],
            binding_from_row,
        )
        .context("Failed to read back domain binding")
    }

    /// All bindings owned by an account
    pub fn list_bindings(&self, owner_email: &str) -> Result<Vec<DomainBinding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM domain_bindings WHERE owner_email = ?1 ORDER BY id",
            BINDING_COLUMNS
        ))?;

        let bindings = stmt
            .query_map(params![owner_email], binding_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(bindings)
    }

    /// Delete every binding matching all four fields; NULL matches NULL
    pub fn delete_bindings(
        &self,
        owner_email: &str,
        domain: &str,
        access_token: Option<&str>,
        endpoint_type: Option<&str>,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "DELETE FROM domain_bindings
             WHERE owner_email = ?1 AND domain = ?2 AND access_token IS ?3 AND endpoint_type IS ?4",
            params![owner_email, domain, access_token, endpoint_type],
        )?;
        Ok(affected)
    }

    /// First binding for `domain`, narrowed by whichever filters are given
    pub fn find_binding_by_domain(
        &self,
        domain: &str,
        access_token: Option<&str>,
        endpoint_type: Option<&str>,
    ) -> Result<Option<DomainBinding>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM domain_bindings
                 WHERE domain = ?1
                   AND (?2 IS NULL OR access_token = ?2)
                   AND (?3 IS NULL OR endpoint_type = ?3)
                 ORDER BY id LIMIT 1",
                BINDING_COLUMNS
            ),
            params![domain, access_token, endpoint_type],
            binding_from_row,
        )
        .optional()
        .context("Failed to look up domain binding")
    }

    // ==================== Certificates ====================

    /// Store material for a domain, replacing whatever was there
    pub fn put_certificate(&self, domain: &str, private_key: &str, certificate: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO certificates (domain, private_key, certificate)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (domain) DO UPDATE SET
                private_key = excluded.private_key,
                certificate = excluded.certificate,
                updated_at = datetime('now')",
            params![domain, private_key, certificate],
        )?;
        Ok(())
    }

    pub fn get_certificate(&self, domain: &str) -> Result<Option<CertificateRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT domain, private_key, certificate, created_at, updated_at
             FROM certificates WHERE domain = ?1",
            params![domain],
            |row| {
                Ok(CertificateRecord {
                    domain: row.get(0)?,
                    private_key: row.get(1)?,
                    certificate: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .optional()
        .context("Failed to get certificate")
    }

    pub fn delete_certificate(&self, domain: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM certificates WHERE domain = ?1", params![domain])?;
        Ok(affected > 0)
    }

    /// Domains that currently have material stored
    pub fn list_certificate_domains(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT domain FROM certificates ORDER BY domain")?;
        let domains = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(domains)
    }
}

fn binding_from_row(row: &Row<'_>) -> rusqlite::Result<DomainBinding> {
    Ok(DomainBinding {
        id: row.get(0)?,
        domain: row.get(1)?,
        owner_email: row.get(2)?,
        endpoint_type: row.get(3)?,
        access_token: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

// ==================== Record Types ====================

/// One custom domain owned by one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainBinding {
    pub id: i64,
    pub domain: String,
    pub owner_email: String,
    pub endpoint_type: Option<String>,
    pub access_token: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// TLS material currently served for a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub domain: String,
    /// PEM private key
    pub private_key: String,
    /// PEM certificate chain
    pub certificate: String,
    pub created_at: String,
    pub updated_at: String,
}
