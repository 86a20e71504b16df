//! SQLite-backed device directory.
//!
//! Holds the `device` table the storage service authenticates against, along
//! with the administrative operations used by `depotd devices`.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::directory::{
    validate_device_name, DeviceCredential, DeviceDirectory, DeviceRecord, DirectoryError,
};

/// Current schema version.
const SCHEMA_VERSION: i32 = 1;

/// Device directory stored in a SQLite database.
pub struct SqliteDirectory {
    conn: Mutex<Connection>,
}

impl SqliteDirectory {
    /// Open or create a database at the given path.
    ///
    /// Parent directories are created and the schema is migrated as needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DirectoryError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DirectoryError::Unavailable(format!(
                        "failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self, DirectoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> Result<Self, DirectoryError> {
        migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, DirectoryError> {
        self.conn
            .lock()
            .map_err(|_| DirectoryError::Unavailable("connection lock poisoned".to_string()))
    }

    /// Register a new device and issue its credential.
    pub fn register_device(&self, name: &str) -> Result<DeviceCredential, DirectoryError> {
        validate_device_name(name)?;
        let credential = DeviceCredential::generate();

        self.conn()?.execute(
            "INSERT INTO device (identifier, device_name, access_token) VALUES (?1, ?2, ?3)",
            params![
                credential.device_id.to_string(),
                name,
                credential.access_token.to_string()
            ],
        )?;

        tracing::info!(device_id = %credential.device_id, "Registered device");
        Ok(credential)
    }

    /// Replace a device's access token. Returns `None` if the device is unknown.
    pub fn rotate_token(&self, identifier: &Uuid) -> Result<Option<Uuid>, DirectoryError> {
        let token = Uuid::new_v4();
        let changed = self.conn()?.execute(
            "UPDATE device SET access_token = ?1 WHERE identifier = ?2",
            params![token.to_string(), identifier.to_string()],
        )?;

        if changed == 0 {
            return Ok(None);
        }
        tracing::info!(device_id = %identifier, "Rotated device access token");
        Ok(Some(token))
    }

    /// Delete a device. Returns whether it existed.
    pub fn remove_device(&self, identifier: &Uuid) -> Result<bool, DirectoryError> {
        let changed = self.conn()?.execute(
            "DELETE FROM device WHERE identifier = ?1",
            params![identifier.to_string()],
        )?;

        if changed > 0 {
            tracing::info!(device_id = %identifier, "Removed device");
        }
        Ok(changed > 0)
    }

    /// List all devices ordered by name.
    pub fn list_devices(&self) -> Result<Vec<DeviceRecord>, DirectoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT identifier, device_name, access_token FROM device ORDER BY device_name, identifier",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut devices = Vec::new();
        for row in rows {
            let (identifier, name, access_token) = row?;
            match Uuid::parse_str(&identifier) {
                Ok(identifier) => devices.push(DeviceRecord {
                    identifier,
                    name,
                    access_token,
                }),
                Err(_) => {
                    tracing::warn!(identifier = %identifier, "Skipping device with malformed identifier");
                }
            }
        }
        Ok(devices)
    }
}

impl DeviceDirectory for SqliteDirectory {
    fn lookup(&self, identifier: &Uuid) -> Result<Option<DeviceRecord>, DirectoryError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT device_name, access_token FROM device WHERE identifier = ?1",
                params![identifier.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(name, access_token)| DeviceRecord {
            identifier: *identifier,
            name,
            access_token,
        }))
    }
}

fn migrate(conn: &mut Connection) -> Result<(), DirectoryError> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < 1 {
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            CREATE TABLE IF NOT EXISTS device (
                identifier TEXT PRIMARY KEY,
                device_name TEXT NOT NULL,
                access_token TEXT NOT NULL
            )
            "#,
            [],
        )?;
        tx.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
        tx.commit()?;
    }

    Ok(())
}
