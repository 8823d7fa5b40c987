//! SQLite coordination store
//!
//! One database file can be opened by several processes at once; SQLite
//! serializes their writes, which is what makes lock acquisition atomic
//! across nodes.

use super::traits::{
    CursorStore, EventLog, LockRecord, LockStore, OpenStore, RelationFilter, RelationStore,
    StorageError, StorageResult, StreamCursor,
};
use crate::inference::{Inference, Relationship, RelationshipId};
use crate::stream::{NewEvent, StreamEvent};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long a writer waits for another process's write to finish
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RELATIONSHIP_COLUMNS: &str =
    "id, relation_type, from_id, to_id, start_time, stop_time, confidence, inference_json";

/// Raw relationship row as read from the database
type RelationshipRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    Option<String>,
);

/// SQLite-backed store for locks, cursors, events and relationships
///
/// Thread-safe via internal mutex on the connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            -- Leases: at most one valid holder per key
            CREATE TABLE IF NOT EXISTS locks (
                key TEXT PRIMARY KEY,
                holder_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL,
                ttl_ms INTEGER NOT NULL
            );

            -- Consumer cursors: monotonically non-decreasing
            CREATE TABLE IF NOT EXISTS cursors (
                consumer_id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Change feed: position is the replay order
            CREATE TABLE IF NOT EXISTS events (
                position INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- Relationships (base and derived)
            CREATE TABLE IF NOT EXISTS relationships (
                id TEXT PRIMARY KEY,
                relation_type TEXT NOT NULL,
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                start_time TEXT,
                stop_time TEXT,
                confidence INTEGER NOT NULL,
                rule_id TEXT,
                inference_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_relationships_from
                ON relationships(relation_type, from_id);
            CREATE INDEX IF NOT EXISTS idx_relationships_to
                ON relationships(relation_type, to_id);
            CREATE INDEX IF NOT EXISTS idx_relationships_rule
                ON relationships(rule_id);

            -- Which derived relationship cites which supporting relationship
            CREATE TABLE IF NOT EXISTS relationship_supports (
                derived_id TEXT NOT NULL,
                support_id TEXT NOT NULL,
                PRIMARY KEY (derived_id, support_id)
            );

            CREATE INDEX IF NOT EXISTS idx_supports_support
                ON relationship_supports(support_id);

            -- Enable WAL mode for concurrent reads during writes
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn parse_time(value: &str) -> StorageResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StorageError::DateParse(e.to_string()))
    }

    fn parse_optional_time(value: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
        value.as_deref().map(Self::parse_time).transpose()
    }

    fn read_relationship_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelationshipRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    }

    /// Deserialize a relationship from database columns
    fn row_to_relationship(row: RelationshipRow) -> StorageResult<Relationship> {
        let (id, relation_type, from_id, to_id, start_time, stop_time, confidence, inference_json) =
            row;
        let inference: Option<Inference> = inference_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Relationship {
            id: RelationshipId::from_string(id),
            relation_type,
            from_id,
            to_id,
            start_time: Self::parse_optional_time(start_time)?,
            stop_time: Self::parse_optional_time(stop_time)?,
            confidence: confidence.clamp(0, 100) as u8,
            inference,
        })
    }

    fn query_relationships(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<Relationship>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, Self::read_relationship_row)?;

        let mut relationships = Vec::new();
        for row in rows {
            relationships.push(Self::row_to_relationship(row?)?);
        }
        Ok(relationships)
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl LockStore for SqliteStore {
    fn try_acquire(&self, record: &LockRecord) -> StorageResult<bool> {
        let conn = self.conn()?;
        let acquired_ms = record.acquired_at.timestamp_millis();
        let expires_ms = record.expires_at().timestamp_millis();

        // A single conditional upsert: the row only changes hands when the
        // current lease expired or already belongs to this holder.
        let changed = conn.execute(
            r#"
            INSERT INTO locks (key, holder_id, acquired_at, expires_at_ms, ttl_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(key) DO UPDATE SET
                holder_id = excluded.holder_id,
                acquired_at = excluded.acquired_at,
                expires_at_ms = excluded.expires_at_ms,
                ttl_ms = excluded.ttl_ms
            WHERE locks.expires_at_ms <= ?6 OR locks.holder_id = excluded.holder_id
            "#,
            params![
                record.key,
                record.holder_id,
                record.acquired_at.to_rfc3339(),
                expires_ms,
                record.ttl_ms as i64,
                acquired_ms,
            ],
        )?;
        Ok(changed == 1)
    }

    fn renew(
        &self,
        key: &str,
        holder_id: &str,
        now: DateTime<Utc>,
        ttl_ms: u64,
    ) -> StorageResult<bool> {
        let conn = self.conn()?;
        let record = LockRecord::new(key, holder_id, now, ttl_ms);
        let changed = conn.execute(
            "UPDATE locks SET acquired_at = ?3, expires_at_ms = ?4, ttl_ms = ?5
             WHERE key = ?1 AND holder_id = ?2",
            params![
                key,
                holder_id,
                now.to_rfc3339(),
                record.expires_at().timestamp_millis(),
                ttl_ms as i64,
            ],
        )?;
        Ok(changed == 1)
    }

    fn release(&self, key: &str, holder_id: &str) -> StorageResult<bool> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "DELETE FROM locks WHERE key = ?1 AND holder_id = ?2",
            params![key, holder_id],
        )?;
        Ok(rows > 0)
    }

    fn load_lock(&self, key: &str) -> StorageResult<Option<LockRecord>> {
        let conn = self.conn()?;
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT holder_id, acquired_at, ttl_ms FROM locks WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((holder_id, acquired_at, ttl_ms)) = row else {
            return Ok(None);
        };
        Ok(Some(LockRecord::new(
            key,
            holder_id,
            Self::parse_time(&acquired_at)?,
            ttl_ms.max(0) as u64,
        )))
    }
}

impl CursorStore for SqliteStore {
    fn load_cursor(&self, consumer_id: &str) -> StorageResult<Option<StreamCursor>> {
        let conn = self.conn()?;
        let position: Option<i64> = conn
            .query_row(
                "SELECT position FROM cursors WHERE consumer_id = ?1",
                params![consumer_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(position.map(|p| StreamCursor::new(consumer_id, p.max(0) as u64)))
    }

    fn save_cursor(&self, cursor: &StreamCursor) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO cursors (consumer_id, position, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(consumer_id) DO UPDATE SET
                position = max(cursors.position, excluded.position),
                updated_at = excluded.updated_at
            "#,
            params![
                cursor.consumer_id,
                cursor.position as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

impl EventLog for SqliteStore {
    fn append(&self, event: NewEvent) -> StorageResult<u64> {
        let conn = self.conn()?;
        let event_json = serde_json::to_string(&event)?;
        conn.execute(
            "INSERT INTO events (event_type, entity_id, event_json) VALUES (?1, ?2, ?3)",
            params![event.event_type.to_string(), event.data.id, event_json],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    fn read_after(&self, position: u64, limit: usize) -> StorageResult<Vec<StreamEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT position, event_json FROM events WHERE position > ?1 ORDER BY position LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![position as i64, limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (position, event_json) = row?;
            let event: NewEvent = serde_json::from_str(&event_json)?;
            events.push(StreamEvent::at_position(event, position as u64));
        }
        Ok(events)
    }

    fn head_position(&self) -> StorageResult<u64> {
        let conn = self.conn()?;
        let head: Option<i64> =
            conn.query_row("SELECT MAX(position) FROM events", [], |row| row.get(0))?;
        Ok(head.unwrap_or(0).max(0) as u64)
    }
}

impl RelationStore for SqliteStore {
    fn save_relationship(&self, rel: &Relationship) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let inference_json = rel
            .inference
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO relationships (id, relation_type, from_id, to_id, start_time, stop_time,
                                       confidence, rule_id, inference_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                relation_type = excluded.relation_type,
                from_id = excluded.from_id,
                to_id = excluded.to_id,
                start_time = excluded.start_time,
                stop_time = excluded.stop_time,
                confidence = excluded.confidence,
                rule_id = excluded.rule_id,
                inference_json = excluded.inference_json
            "#,
            params![
                rel.id.as_str(),
                rel.relation_type,
                rel.from_id,
                rel.to_id,
                rel.start_time.map(|t| t.to_rfc3339()),
                rel.stop_time.map(|t| t.to_rfc3339()),
                rel.confidence as i64,
                rel.rule_id(),
                inference_json,
            ],
        )?;

        // Keep the support index in step with the explanation
        tx.execute(
            "DELETE FROM relationship_supports WHERE derived_id = ?1",
            params![rel.id.as_str()],
        )?;
        for support in rel.explanation() {
            tx.execute(
                "INSERT OR IGNORE INTO relationship_supports (derived_id, support_id) VALUES (?1, ?2)",
                params![rel.id.as_str(), support.as_str()],
            )?;
        }
        tx.commit()?;

        Ok(())
    }

    fn load_relationship(&self, id: &RelationshipId) -> StorageResult<Option<Relationship>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM relationships WHERE id = ?1", RELATIONSHIP_COLUMNS);
        let row = conn
            .query_row(&sql, params![id.as_str()], Self::read_relationship_row)
            .optional()?;
        row.map(Self::row_to_relationship).transpose()
    }

    fn delete_relationship(&self, id: &RelationshipId) -> StorageResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "DELETE FROM relationships WHERE id = ?1",
            params![id.as_str()],
        )?;
        tx.execute(
            "DELETE FROM relationship_supports WHERE derived_id = ?1",
            params![id.as_str()],
        )?;
        tx.commit()?;
        Ok(rows > 0)
    }

    fn find_relationships(&self, filter: &RelationFilter) -> StorageResult<Vec<Relationship>> {
        let conn = self.conn()?;

        let mut sql = format!("SELECT {} FROM relationships WHERE 1 = 1", RELATIONSHIP_COLUMNS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref relation_type) = filter.relation_type {
            sql.push_str(" AND relation_type = ?");
            params_vec.push(Box::new(relation_type.clone()));
        }

        if let Some(ref from_id) = filter.from_id {
            sql.push_str(" AND from_id = ?");
            params_vec.push(Box::new(from_id.clone()));
        }

        if let Some(ref to_id) = filter.to_id {
            sql.push_str(" AND to_id = ?");
            params_vec.push(Box::new(to_id.clone()));
        }

        if let Some(ref rule_id) = filter.rule_id {
            sql.push_str(" AND rule_id = ?");
            params_vec.push(Box::new(rule_id.clone()));
        }

        sql.push_str(" ORDER BY id");

        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|b| b.as_ref()).collect();
        Self::query_relationships(&conn, &sql, params_refs.as_slice())
    }

    fn find_supported_by(&self, support: &RelationshipId) -> StorageResult<Vec<Relationship>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM relationships WHERE id IN
                (SELECT derived_id FROM relationship_supports WHERE support_id = ?1)
             ORDER BY id",
            RELATIONSHIP_COLUMNS
        );
        Self::query_relationships(&conn, &sql, &[&support.as_str()])
    }
}
