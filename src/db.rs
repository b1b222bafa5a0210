use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, VmediaError};
use crate::models::{NodeBootContext, ProvisionState};

/// Durable storage of node boot contexts, owned by the provisioning pipeline.
pub trait NodeStore: Send + Sync {
    fn load(&self, node_id: &str) -> Result<NodeBootContext>;
    fn save(&self, ctx: &NodeBootContext) -> Result<()>;
}

impl<T: NodeStore + ?Sized> NodeStore for Arc<T> {
    fn load(&self, node_id: &str) -> Result<NodeBootContext> {
        (**self).load(node_id)
    }

    fn save(&self, ctx: &NodeBootContext) -> Result<()> {
        (**self).save(ctx)
    }
}

#[derive(Debug)]
pub struct SqliteNodeStore {
    conn: Mutex<Connection>,
}

const NODE_COLUMNS: &str = "id, provision_state, boot_mode, driver_info, instance_info, ports, \
     deploy_iso_name, boot_iso_name, root_identifier, is_whole_disk_image";

impl SqliteNodeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("connection mutex poisoned")
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.connection();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                provision_state TEXT NOT NULL,
                boot_mode TEXT NOT NULL,
                driver_info TEXT NOT NULL,
                instance_info TEXT NOT NULL,
                ports TEXT NOT NULL,
                deploy_iso_name TEXT,
                boot_iso_name TEXT,
                root_identifier TEXT,
                is_whole_disk_image INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn fetch_node(&self, id: &str) -> Result<Option<NodeBootContext>> {
        let conn = self.connection();
        let raw = conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                params![id],
                RawNode::from_row,
            )
            .optional()?;
        raw.map(RawNode::into_context).transpose()
    }

    pub fn fetch_nodes(&self) -> Result<Vec<NodeBootContext>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id"))?;
        let rows = stmt.query_map([], RawNode::from_row)?;
        let mut nodes = Vec::new();
        for raw in rows {
            nodes.push(raw?.into_context()?);
        }
        Ok(nodes)
    }

    pub fn updated_at(&self, id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.connection();
        let ts: Option<String> = conn
            .query_row(
                "SELECT updated_at FROM nodes WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts.and_then(|ts| ts.parse().ok()))
    }

    pub fn upsert_node(&self, ctx: &NodeBootContext) -> Result<()> {
        let driver_info = serde_json::to_string(&ctx.driver_info)?;
        let instance_info = serde_json::to_string(&ctx.instance_info)?;
        let ports = serde_json::to_string(&ctx.ports)?;
        let boot_mode = serde_json::to_string(&ctx.boot_mode)?;
        let conn = self.connection();
        conn.execute(
            "INSERT INTO nodes (id, provision_state, boot_mode, driver_info, instance_info, ports, \
             deploy_iso_name, boot_iso_name, root_identifier, is_whole_disk_image, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(id) DO UPDATE SET \
             provision_state = excluded.provision_state, boot_mode = excluded.boot_mode, \
             driver_info = excluded.driver_info, instance_info = excluded.instance_info, \
             ports = excluded.ports, deploy_iso_name = excluded.deploy_iso_name, \
             boot_iso_name = excluded.boot_iso_name, root_identifier = excluded.root_identifier, \
             is_whole_disk_image = excluded.is_whole_disk_image, updated_at = excluded.updated_at",
            params![
                ctx.node_id,
                ctx.provision_state.as_str(),
                boot_mode,
                driver_info,
                instance_info,
                ports,
                ctx.deploy_iso_name,
                ctx.boot_iso_name,
                ctx.root_identifier,
                ctx.is_whole_disk_image as i32,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_node(&self, id: &str) -> Result<()> {
        let conn = self.connection();
        conn.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
        Ok(())
    }
}

impl NodeStore for SqliteNodeStore {
    fn load(&self, node_id: &str) -> Result<NodeBootContext> {
        self.fetch_node(node_id)?
            .ok_or_else(|| VmediaError::NodeNotFound(node_id.to_string()))
    }

    fn save(&self, ctx: &NodeBootContext) -> Result<()> {
        self.upsert_node(ctx)
    }
}

/// Row as stored, before the JSON columns are decoded.
struct RawNode {
    id: String,
    provision_state: String,
    boot_mode: String,
    driver_info: String,
    instance_info: String,
    ports: String,
    deploy_iso_name: Option<String>,
    boot_iso_name: Option<String>,
    root_identifier: Option<String>,
    is_whole_disk_image: bool,
}

impl RawNode {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            provision_state: row.get(1)?,
            boot_mode: row.get(2)?,
            driver_info: row.get(3)?,
            instance_info: row.get(4)?,
            ports: row.get(5)?,
            deploy_iso_name: row.get(6)?,
            boot_iso_name: row.get(7)?,
            root_identifier: row.get(8)?,
            is_whole_disk_image: row.get::<_, i32>(9)? != 0,
        })
    }

    fn into_context(self) -> Result<NodeBootContext> {
        Ok(NodeBootContext {
            node_id: self.id,
            provision_state: ProvisionState::parse(&self.provision_state),
            boot_mode: serde_json::from_str(&self.boot_mode)?,
            driver_info: serde_json::from_str(&self.driver_info)?,
            instance_info: serde_json::from_str(&self.instance_info)?,
            ports: serde_json::from_str(&self.ports)?,
            deploy_iso_name: self.deploy_iso_name,
            boot_iso_name: self.boot_iso_name,
            root_identifier: self.root_identifier,
            is_whole_disk_image: self.is_whole_disk_image,
        })
    }
}
