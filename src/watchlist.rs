// Compliance Watchlist - monitoring triggers per business
//
// Priority ordering is a fixed ordinal (URGENTE > ALTA > MEDIA > anything
// else), never alphabetical. resolve() moves an item to an explicit COMPLETED
// terminal status.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db;
use crate::error::{CoreError, CoreResult};

// ============================================================================
// PRIORITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerPriority {
    Urgente,
    Alta,
    Media,
    /// Anything else the trigger source sends; always sorted last.
    Other(String),
}

impl TriggerPriority {
    pub fn as_str(&self) -> &str {
        match self {
            TriggerPriority::Urgente => "URGENTE",
            TriggerPriority::Alta => "ALTA",
            TriggerPriority::Media => "MEDIA",
            TriggerPriority::Other(value) => value,
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "URGENTE" => TriggerPriority::Urgente,
            "ALTA" => TriggerPriority::Alta,
            "MEDIA" => TriggerPriority::Media,
            other => TriggerPriority::Other(other.to_string()),
        }
    }

    /// Fixed display ordinal: lower sorts first.
    pub fn ordinal(&self) -> u8 {
        match self {
            TriggerPriority::Urgente => 0,
            TriggerPriority::Alta => 1,
            TriggerPriority::Media => 2,
            TriggerPriority::Other(_) => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchlistStatus {
    Pending,
    Completed,
}

impl WatchlistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchlistStatus::Pending => "PENDING",
            WatchlistStatus::Completed => "COMPLETED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(WatchlistStatus::Pending),
            "COMPLETED" => Some(WatchlistStatus::Completed),
            _ => None,
        }
    }
}

/// One monitoring trigger raised against a business.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistItem {
    pub id: String,
    pub business_id: String,
    pub trigger_kind: String,
    pub description: String,
    pub priority: TriggerPriority,
    pub status: WatchlistStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Raise a new monitoring trigger, PENDING.
pub fn raise(
    conn: &Connection,
    business_id: &str,
    trigger_kind: &str,
    description: &str,
    priority: TriggerPriority,
) -> CoreResult<WatchlistItem> {
    if business_id.trim().is_empty() {
        return Err(CoreError::validation("business reference is required"));
    }
    if description.trim().is_empty() {
        return Err(CoreError::validation("trigger description must not be empty"));
    }

    let item = WatchlistItem {
        id: uuid::Uuid::new_v4().to_string(),
        business_id: business_id.to_string(),
        trigger_kind: trigger_kind.to_string(),
        description: description.to_string(),
        priority,
        status: WatchlistStatus::Pending,
        created_at: Utc::now(),
        completed_at: None,
    };

    conn.execute(
        "INSERT INTO watchlist_items (
            id, business_id, trigger_kind, description, priority, status,
            created_at, completed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
        params![
            item.id,
            item.business_id,
            item.trigger_kind,
            item.description,
            item.priority.as_str(),
            item.status.as_str(),
            item.created_at.to_rfc3339(),
        ],
    )?;

    info!(business = %business_id, kind = trigger_kind, priority = item.priority.as_str(), "watchlist trigger raised");
    Ok(item)
}

/// Mark a trigger as handled: explicit COMPLETED terminal status.
pub fn resolve(conn: &mut Connection, item_id: &str) -> CoreResult<WatchlistItem> {
    let tx = conn.transaction()?;

    let current = get_item(&tx, item_id)?
        .ok_or_else(|| CoreError::not_found("watchlist item", item_id))?;
    if current.status == WatchlistStatus::Completed {
        return Err(CoreError::invalid_state(
            WatchlistStatus::Pending.as_str(),
            current.status.as_str(),
        ));
    }

    let completed_at = Utc::now();
    tx.execute(
        "UPDATE watchlist_items SET status = 'COMPLETED', completed_at = ?1 WHERE id = ?2",
        params![completed_at.to_rfc3339(), item_id],
    )?;
    tx.commit()?;
    info!(item = %item_id, "watchlist trigger completed");

    Ok(WatchlistItem {
        status: WatchlistStatus::Completed,
        completed_at: Some(completed_at),
        ..current
    })
}

// ============================================================================
// QUERIES
// ============================================================================

const ITEM_COLUMNS: &str = "id, business_id, trigger_kind, description, priority, status, \
     created_at, completed_at";

/// Fixed priority ordinal in SQL form; keep in sync with `TriggerPriority::ordinal`.
const PRIORITY_ORDINAL_SQL: &str = "CASE priority
         WHEN 'URGENTE' THEN 0 WHEN 'ALTA' THEN 1 WHEN 'MEDIA' THEN 2 ELSE 3 END";

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WatchlistItem> {
    let priority: String = row.get(4)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let completed_at: Option<String> = row.get(7)?;
    Ok(WatchlistItem {
        id: row.get(0)?,
        business_id: row.get(1)?,
        trigger_kind: row.get(2)?,
        description: row.get(3)?,
        priority: TriggerPriority::from_str(&priority),
        status: WatchlistStatus::from_str(&status).ok_or(rusqlite::Error::InvalidQuery)?,
        created_at: db::parse_utc(&created_at).ok_or(rusqlite::Error::InvalidQuery)?,
        completed_at: completed_at.as_deref().and_then(db::parse_utc),
    })
}

pub fn get_item(conn: &Connection, item_id: &str) -> CoreResult<Option<WatchlistItem>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM watchlist_items WHERE id = ?1");
    let item = conn
        .query_row(&sql, params![item_id], item_from_row)
        .optional()?;
    Ok(item)
}

/// Open triggers, highest priority first, oldest first within a priority.
pub fn list_open(conn: &Connection) -> CoreResult<Vec<WatchlistItem>> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM watchlist_items
         WHERE status = 'PENDING'
         ORDER BY {PRIORITY_ORDINAL_SQL}, created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map([], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// All triggers for a business, newest first.
pub fn list_for_business(conn: &Connection, business_id: &str) -> CoreResult<Vec<WatchlistItem>> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM watchlist_items
         WHERE business_id = ?1 ORDER BY created_at DESC, rowid DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![business_id], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

// ============================================================================
// TESTS
// ============================================================================
