//! SQLite persistence for key levels and order monitors.
//!
//! Persists state that has to survive restarts:
//! - Key levels extracted from trade plans (append-only, status flips to triggered)
//! - Monitored orders, so unfinished monitors resume on startup
//! - Per-order monitor journal

use crate::exchange::OrderSide;
use crate::monitor::MonitorState;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Role a key level plays in the plan it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LevelKind {
    EntryBuy,
    EntrySell,
    StopLoss,
    TakeProfit(u32),
}

impl fmt::Display for LevelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelKind::EntryBuy => f.write_str("ENTRY_BUY"),
            LevelKind::EntrySell => f.write_str("ENTRY_SELL"),
            LevelKind::StopLoss => f.write_str("STOP_LOSS"),
            LevelKind::TakeProfit(n) => write!(f, "TAKE_PROFIT_{}", n),
        }
    }
}

impl FromStr for LevelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY_BUY" => Ok(LevelKind::EntryBuy),
            "ENTRY_SELL" => Ok(LevelKind::EntrySell),
            "STOP_LOSS" => Ok(LevelKind::StopLoss),
            other => other
                .strip_prefix("TAKE_PROFIT_")
                .and_then(|n| n.parse().ok())
                .map(LevelKind::TakeProfit)
                .ok_or_else(|| format!("unknown level kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LevelStatus {
    Active,
    Triggered,
}

impl LevelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelStatus::Active => "active",
            LevelStatus::Triggered => "triggered",
        }
    }
}

impl FromStr for LevelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LevelStatus::Active),
            "triggered" => Ok(LevelStatus::Triggered),
            other => Err(format!("unknown level status '{}'", other)),
        }
    }
}

/// Stored key level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyLevel {
    pub id: i64,
    pub instrument: String,
    pub level: Decimal,
    pub kind: LevelKind,
    /// Plan or analysis the level was taken from.
    pub source_id: String,
    pub status: LevelStatus,
    pub created_at: DateTime<Utc>,
}

/// Key level to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewKeyLevel {
    pub instrument: String,
    pub level: Decimal,
    pub kind: LevelKind,
    pub source_id: String,
}

/// Resumable order monitor record.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredOrder {
    pub order_id: i64,
    pub account_id: i64,
    pub contract_id: String,
    pub expected_side: OrderSide,
    pub started_at: DateTime<Utc>,
    pub state: MonitorState,
}

/// One line of an order's monitor journal.
#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub order_id: i64,
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub detail: String,
}

/// SQLite-backed store shared by the executor, monitors and watcher.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `db_path` and initialize the schema.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Store initialized at {:?}", path);
        Ok(store)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Run raw SQL, for tests that need to break the schema.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("store connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            -- Key levels (append-only)
            CREATE TABLE IF NOT EXISTS key_levels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument TEXT NOT NULL,
                level TEXT NOT NULL,
                kind TEXT NOT NULL,
                source_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                triggered_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_levels_instrument ON key_levels(instrument);
            CREATE INDEX IF NOT EXISTS idx_levels_status ON key_levels(status);

            -- Order monitors
            CREATE TABLE IF NOT EXISTS monitored_orders (
                order_id INTEGER PRIMARY KEY,
                account_id INTEGER NOT NULL,
                contract_id TEXT NOT NULL,
                expected_side TEXT NOT NULL,
                started_at TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Monitor journal
            CREATE TABLE IF NOT EXISTS monitor_journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                event TEXT NOT NULL,
                detail TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_journal_order ON monitor_journal(order_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ==================== Key levels ====================

    /// Store new levels, skipping any whose instrument and price are already
    /// stored. Returns how many were inserted.
    pub fn insert_key_levels(&self, levels: &[NewKeyLevel]) -> Result<usize> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let now = Utc::now().to_rfc3339();
        let mut inserted = 0;

        for level in levels {
            let price = level.level.normalize().to_string();
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM key_levels WHERE instrument = ?1 AND level = ?2)",
                params![level.instrument, price],
                |row| row.get(0),
            )?;
            if exists {
                debug!(instrument = %level.instrument, level = %price, "Skipping duplicate key level");
                continue;
            }

            tx.execute(
                r#"
                INSERT INTO key_levels (instrument, level, kind, source_id, status, created_at)
                VALUES (?1, ?2, ?3, ?4, 'active', ?5)
                "#,
                params![
                    level.instrument,
                    price,
                    level.kind.to_string(),
                    level.source_id,
                    now
                ],
            )?;
            inserted += 1;
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// All levels still waiting to be acted upon.
    pub fn active_levels(&self) -> Result<Vec<KeyLevel>> {
        self.query_levels(
            "SELECT id, instrument, level, kind, source_id, status, created_at
             FROM key_levels WHERE status = 'active' ORDER BY instrument, id",
            params![],
        )
    }

    /// Levels for one instrument, or all of them.
    pub fn levels(&self, instrument: Option<&str>) -> Result<Vec<KeyLevel>> {
        match instrument {
            Some(instrument) => self.query_levels(
                "SELECT id, instrument, level, kind, source_id, status, created_at
                 FROM key_levels WHERE instrument = ?1 ORDER BY id",
                params![instrument],
            ),
            None => self.query_levels(
                "SELECT id, instrument, level, kind, source_id, status, created_at
                 FROM key_levels ORDER BY instrument, id",
                params![],
            ),
        }
    }

    /// Flip a level to triggered. Returns false if it was not active.
    pub fn mark_level_triggered(&self, id: i64) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE key_levels SET status = 'triggered', triggered_at = ?2
             WHERE id = ?1 AND status = 'active'",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    fn query_levels(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<KeyLevel>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let levels = stmt
            .query_map(args, |row| {
                Ok(KeyLevel {
                    id: row.get(0)?,
                    instrument: row.get(1)?,
                    level: parse_column(row, 2)?,
                    kind: parse_column(row, 3)?,
                    source_id: row.get(4)?,
                    status: parse_column(row, 5)?,
                    created_at: timestamp_column(row, 6)?,
                })
            })?
            .filter_map(|r| match r {
                Ok(level) => Some(level),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable key level row");
                    None
                }
            })
            .collect();
        Ok(levels)
    }

    // ==================== Monitored orders ====================

    pub fn upsert_monitored_order(&self, order: &MonitoredOrder) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO monitored_orders (order_id, account_id, contract_id, expected_side,
                                          started_at, state, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(order_id) DO UPDATE SET
                account_id = ?2,
                contract_id = ?3,
                expected_side = ?4,
                started_at = ?5,
                state = ?6,
                updated_at = ?7
            "#,
            params![
                order.order_id,
                order.account_id,
                order.contract_id,
                order.expected_side.as_str(),
                order.started_at.to_rfc3339(),
                order.state.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_monitor_state(&self, order_id: i64, state: MonitorState) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE monitored_orders SET state = ?2, updated_at = ?3 WHERE order_id = ?1",
            params![order_id, state.as_str(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            warn!(order_id, "No monitor record to update");
        }
        Ok(())
    }

    pub fn monitored_order(&self, order_id: i64) -> Result<Option<MonitoredOrder>> {
        let conn = self.conn()?;
        let order = conn
            .query_row(
                "SELECT order_id, account_id, contract_id, expected_side, started_at, state
                 FROM monitored_orders WHERE order_id = ?1",
                params![order_id],
                monitored_order_from_row,
            )
            .optional()?;
        Ok(order)
    }

    /// Records whose monitor has not reached a terminal state.
    pub fn pending_monitored_orders(&self) -> Result<Vec<MonitoredOrder>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT order_id, account_id, contract_id, expected_side, started_at, state
             FROM monitored_orders ORDER BY started_at",
        )?;
        let orders = stmt
            .query_map([], monitored_order_from_row)?
            .filter_map(|r| match r {
                Ok(order) => Some(order),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable monitor record");
                    None
                }
            })
            .filter(|o: &MonitoredOrder| !o.state.is_terminal())
            .collect();
        Ok(orders)
    }

    // ==================== Journal ====================

    pub fn append_journal(&self, order_id: i64, event: &str, detail: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO monitor_journal (order_id, timestamp, event, detail) VALUES (?1, ?2, ?3, ?4)",
            params![order_id, Utc::now().to_rfc3339(), event, detail],
        )?;
        Ok(())
    }

    pub fn journal(&self, order_id: i64) -> Result<Vec<JournalEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT order_id, timestamp, event, detail FROM monitor_journal
             WHERE order_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![order_id], |row| {
                Ok(JournalEntry {
                    order_id: row.get(0)?,
                    timestamp: timestamp_column(row, 1)?,
                    event: row.get(2)?,
                    detail: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }
}

fn monitored_order_from_row(row: &Row<'_>) -> rusqlite::Result<MonitoredOrder> {
    Ok(MonitoredOrder {
        order_id: row.get(0)?,
        account_id: row.get(1)?,
        contract_id: row.get(2)?,
        expected_side: parse_column(row, 3)?,
        started_at: timestamp_column(row, 4)?,
        state: parse_column(row, 5)?,
    })
}

fn parse_column<T: FromStr>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|_| rusqlite::Error::InvalidColumnType(idx, raw, Type::Text))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidColumnType(idx, raw, Type::Text))
}
