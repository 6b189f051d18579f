//! Server-owned metadata tables (room snapshots, UI state).
//!
//! The server only creates `ui_state`; clients read and write it with
//! ordinary queries against [`MetaStorage::table`].
//!
//! With a dedicated meta database the file is attached under the namespace
//! and tables are addressed as `"ns"."sync_rooms"`. Otherwise the tables live
//! in the main database with the namespace as a prefix: `"ns_sync_rooms"`.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

use crate::database::{quote_ident, Attachment};
use crate::error::EngineError;

pub const DEFAULT_NAMESPACE: &str = "__sqlrooms";

const SYNC_ROOMS: &str = "sync_rooms";
const UI_STATE: &str = "ui_state";

#[derive(Debug, Clone)]
pub struct MetaConfig {
    pub namespace: String,
    /// Separate database file for metadata (None = main database)
    pub meta_db: Option<PathBuf>,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            meta_db: None,
        }
    }
}

impl MetaConfig {
    /// Attachment the database must carry for this layout, if any.
    pub fn attachment(&self) -> Option<Attachment> {
        self.meta_db.as_ref().map(|path| Attachment {
            alias: self.namespace.clone(),
            path: path.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MetaStorage {
    namespace: String,
    attached: bool,
}

impl MetaStorage {
    pub fn new(config: &MetaConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            attached: config.meta_db.is_some(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Fully qualified, quoted table reference.
    pub fn table(&self, name: &str) -> String {
        if self.attached {
            format!("{}.{}", quote_ident(&self.namespace), quote_ident(name))
        } else {
            quote_ident(&format!("{}_{}", self.namespace, name))
        }
    }

    pub fn ensure_schema(&self, conn: &Connection) -> Result<(), EngineError> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {rooms} (
                room_id TEXT PRIMARY KEY,
                snapshot BLOB,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS {ui} (
                key TEXT PRIMARY KEY,
                payload_json TEXT,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );",
            rooms = self.table(SYNC_ROOMS),
            ui = self.table(UI_STATE),
        ))?;
        Ok(())
    }

    pub fn load_room_snapshot(
        &self,
        conn: &Connection,
        room_id: &str,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let snapshot = conn
            .query_row(
                &format!("SELECT snapshot FROM {} WHERE room_id = ?1", self.table(SYNC_ROOMS)),
                params![room_id],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?;
        Ok(snapshot.flatten())
    }

    pub fn save_room_snapshot(
        &self,
        conn: &Connection,
        room_id: &str,
        snapshot: &[u8],
    ) -> Result<(), EngineError> {
        conn.execute(
            &format!(
                "INSERT INTO {} (room_id, snapshot, updated_at)
                 VALUES (?1, ?2, CURRENT_TIMESTAMP)
                 ON CONFLICT (room_id) DO UPDATE SET
                    snapshot = excluded.snapshot,
                    updated_at = excluded.updated_at",
                self.table(SYNC_ROOMS)
            ),
            params![room_id, snapshot],
        )?;
        Ok(())
    }

    pub fn room_ids(&self, conn: &Connection) -> Result<Vec<String>, EngineError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT room_id FROM {} ORDER BY room_id",
            self.table(SYNC_ROOMS)
        ))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}
