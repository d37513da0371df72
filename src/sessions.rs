// Session Aggregator - per-stall facts from a market day
//
// Raw presence rows (one per stall/business scan) come in from the field
// devices as CSV; closing a session turns them into one MarketSession plus
// its SessionDetail rows. These facts are the sole upstream source for
// absence-type transgression detection and for ledger transfer snapshots.

use anyhow::{Context as AnyhowContext, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::db;
use crate::error::{CoreError, CoreResult};

// ============================================================================
// PRESENCE KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceKind {
    /// The concession holder occupying their own stall.
    Titolare,
    /// A ranked substitute occupying a stall via the daily graduatoria.
    Spuntista,
}

impl PresenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceKind::Titolare => "TITOLARE",
            PresenceKind::Spuntista => "SPUNTISTA",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "TITOLARE" => Some(PresenceKind::Titolare),
            "SPUNTISTA" => Some(PresenceKind::Spuntista),
            _ => None,
        }
    }
}

// ============================================================================
// RAW PRESENCE ROWS (CSV import)
// ============================================================================

/// One raw per-stall presence row as scanned on the market day.
///
/// Entry/exit are zero-padded HH:MM strings; lexicographic order matches
/// chronological order within one day.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawPresenceRow {
    /// Empty for ranked substitutes still waiting for a stall assignment.
    #[serde(rename = "Stall_Id", default)]
    pub stall_id: String,

    #[serde(rename = "Business_Id")]
    pub business_id: String,

    #[serde(rename = "Presence_Kind")]
    pub presence_kind: String,

    #[serde(rename = "Entry_Time", default)]
    pub entry_time: String,

    #[serde(rename = "Exit_Time", default)]
    pub exit_time: String,

    #[serde(rename = "Amount_Charged", default)]
    pub amount_charged: f64,

    /// Cumulative presence counter for the business, as carried by the feed.
    #[serde(rename = "Presences_Count", default)]
    pub presences_count: i64,

    /// Cumulative absence counter for the business, as carried by the feed.
    #[serde(rename = "Absences_Count", default)]
    pub absences_count: i64,
}

impl RawPresenceRow {
    /// Idempotency hash for a row within one (market, date) session.
    fn compute_row_hash(&self, market_id: &str, date: NaiveDate) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}{}{}{}{}{}",
            market_id, date, self.stall_id, self.business_id, self.presence_kind, self.entry_time
        ));
        format!("{:x}", hasher.finalize())
    }
}

/// Load raw presence rows from a CSV export.
pub fn load_presence_csv(csv_path: &Path) -> Result<Vec<RawPresenceRow>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open presence CSV")?;
    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        let row: RawPresenceRow = result.context("Failed to deserialize presence row")?;
        rows.push(row);
    }
    Ok(rows)
}

// ============================================================================
// ROW VALIDATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowIssueSeverity {
    Warning,
    Error,
}

/// A per-row quality finding from boundary validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowIssue {
    pub row_index: usize,
    pub field: String,
    pub message: String,
    pub severity: RowIssueSeverity,
}

/// Validate raw rows before aggregation. Errors reject the whole batch,
/// warnings are logged and tolerated.
pub fn validate_rows(rows: &[RawPresenceRow]) -> Vec<RowIssue> {
    let mut issues = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if row.business_id.trim().is_empty() {
            issues.push(RowIssue {
                row_index: i,
                field: "business_id".to_string(),
                message: "missing business reference".to_string(),
                severity: RowIssueSeverity::Error,
            });
        }
        if PresenceKind::from_str(&row.presence_kind).is_none() {
            issues.push(RowIssue {
                row_index: i,
                field: "presence_kind".to_string(),
                message: format!("unknown presence kind '{}'", row.presence_kind),
                severity: RowIssueSeverity::Error,
            });
        }
        if row.amount_charged < 0.0 {
            issues.push(RowIssue {
                row_index: i,
                field: "amount_charged".to_string(),
                message: format!("negative charge {:.2}", row.amount_charged),
                severity: RowIssueSeverity::Error,
            });
        }
        if !row.entry_time.is_empty()
            && !row.exit_time.is_empty()
            && row.exit_time < row.entry_time
        {
            issues.push(RowIssue {
                row_index: i,
                field: "exit_time".to_string(),
                message: format!("exit {} before entry {}", row.exit_time, row.entry_time),
                severity: RowIssueSeverity::Warning,
            });
        }
    }
    issues
}

// ============================================================================
// AGGREGATES
// ============================================================================

/// One closed market day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSession {
    pub id: String,
    pub market_id: String,
    pub session_date: NaiveDate,
    pub occupied_stalls: i64,
    pub total_revenue: f64,
    pub total_presences: i64,
    pub first_entry: Option<String>,
    pub last_exit: Option<String>,
}

/// One recorded (stall, business, day) fact inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub id: String,
    pub session_id: String,
    pub stall_id: Option<String>,
    pub business_id: String,
    pub presence_kind: PresenceKind,
    pub entry_time: Option<String>,
    pub exit_time: Option<String>,
    pub amount_charged: f64,
    pub presences_count: i64,
    pub absences_count: i64,
}

/// Result of closing a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session: MarketSession,
    pub rows_recorded: usize,
    pub duplicates_dropped: usize,
}

/// Close the (market, date) session from its raw rows.
///
/// Rows sharing the same stall are deduplicated keeping the FIRST occurrence
/// encountered; this tie-break is a preserved convention and is pinned by a
/// test. Rows with no stall assigned (spuntisti awaiting assignment) are kept
/// as detail rows but excluded from the occupied-stall count. Entry/exit
/// extremes are taken across all raw rows.
pub fn close_session(
    conn: &mut Connection,
    market_id: &str,
    date: NaiveDate,
    raw_rows: &[RawPresenceRow],
) -> CoreResult<SessionOutcome> {
    let issues = validate_rows(raw_rows);
    if let Some(first_error) = issues
        .iter()
        .find(|i| i.severity == RowIssueSeverity::Error)
    {
        return Err(CoreError::validation(format!(
            "row {}: {} ({})",
            first_error.row_index, first_error.message, first_error.field
        )));
    }
    for warning in &issues {
        tracing::warn!(
            row = warning.row_index,
            field = %warning.field,
            "{}",
            warning.message
        );
    }

    // first occurrence wins for rows sharing a stall
    let mut seen_stalls: HashSet<&str> = HashSet::new();
    let mut kept: Vec<&RawPresenceRow> = Vec::new();
    let mut duplicates_dropped = 0usize;
    for row in raw_rows {
        if row.stall_id.is_empty() {
            kept.push(row);
        } else if seen_stalls.insert(row.stall_id.as_str()) {
            kept.push(row);
        } else {
            duplicates_dropped += 1;
        }
    }

    let occupied_stalls = seen_stalls.len() as i64;
    let total_revenue: f64 = kept.iter().map(|r| r.amount_charged).sum();
    let total_presences = kept.len() as i64;
    let first_entry = raw_rows
        .iter()
        .filter(|r| !r.entry_time.is_empty())
        .map(|r| r.entry_time.clone())
        .min();
    let last_exit = raw_rows
        .iter()
        .filter(|r| !r.exit_time.is_empty())
        .map(|r| r.exit_time.clone())
        .max();

    let session = MarketSession {
        id: uuid::Uuid::new_v4().to_string(),
        market_id: market_id.to_string(),
        session_date: date,
        occupied_stalls,
        total_revenue,
        total_presences,
        first_entry,
        last_exit,
    };

    let tx = conn.transaction()?;

    let inserted = tx.execute(
        "INSERT INTO market_sessions (
            id, market_id, session_date, occupied_stalls, total_revenue,
            total_presences, first_entry, last_exit, closed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            session.id,
            session.market_id,
            session.session_date.to_string(),
            session.occupied_stalls,
            session.total_revenue,
            session.total_presences,
            session.first_entry,
            session.last_exit,
            Utc::now().to_rfc3339(),
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(CoreError::conflict(format!(
                "session for {market_id} on {date} is already closed"
            )));
        }
        Err(e) => return Err(e.into()),
    }

    let mut rows_recorded = 0usize;
    for row in &kept {
        let hash = row.compute_row_hash(market_id, date);
        let result = tx.execute(
            "INSERT INTO session_details (
                id, session_id, stall_id, business_id, presence_kind,
                entered_at, exited_at, amount_charged, presences_count,
                absences_count, row_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                uuid::Uuid::new_v4().to_string(),
                session.id,
                if row.stall_id.is_empty() {
                    None
                } else {
                    Some(row.stall_id.as_str())
                },
                row.business_id,
                row.presence_kind,
                if row.entry_time.is_empty() {
                    None
                } else {
                    Some(row.entry_time.as_str())
                },
                if row.exit_time.is_empty() {
                    None
                } else {
                    Some(row.exit_time.as_str())
                },
                row.amount_charged,
                row.presences_count,
                row.absences_count,
                hash,
            ],
        );
        match result {
            Ok(_) => rows_recorded += 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                duplicates_dropped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    tx.commit()?;
    info!(
        market = market_id,
        %date,
        occupied = occupied_stalls,
        recorded = rows_recorded,
        dropped = duplicates_dropped,
        "session closed"
    );

    Ok(SessionOutcome {
        session,
        rows_recorded,
        duplicates_dropped,
    })
}

// ============================================================================
// FACT QUERIES
// ============================================================================

pub fn get_session(
    conn: &Connection,
    market_id: &str,
    date: NaiveDate,
) -> CoreResult<Option<MarketSession>> {
    let session = conn
        .query_row(
            "SELECT id, market_id, session_date, occupied_stalls, total_revenue,
                    total_presences, first_entry, last_exit
             FROM market_sessions WHERE market_id = ?1 AND session_date = ?2",
            params![market_id, date.to_string()],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MarketSession> {
    let session_date: String = row.get(2)?;
    Ok(MarketSession {
        id: row.get(0)?,
        market_id: row.get(1)?,
        session_date: db::parse_date(&session_date).ok_or(rusqlite::Error::InvalidQuery)?,
        occupied_stalls: row.get(3)?,
        total_revenue: row.get(4)?,
        total_presences: row.get(5)?,
        first_entry: row.get(6)?,
        last_exit: row.get(7)?,
    })
}

pub fn session_details(conn: &Connection, session_id: &str) -> CoreResult<Vec<SessionDetail>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, stall_id, business_id, presence_kind, entered_at,
                exited_at, amount_charged, presences_count, absences_count
         FROM session_details WHERE session_id = ?1 ORDER BY rowid",
    )?;
    let details = stmt
        .query_map(params![session_id], detail_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(details)
}

fn detail_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionDetail> {
    let kind: String = row.get(4)?;
    Ok(SessionDetail {
        id: row.get(0)?,
        session_id: row.get(1)?,
        stall_id: row.get(2)?,
        business_id: row.get(3)?,
        presence_kind: PresenceKind::from_str(&kind).ok_or(rusqlite::Error::InvalidQuery)?,
        entry_time: row.get(5)?,
        exit_time: row.get(6)?,
        amount_charged: row.get(7)?,
        presences_count: row.get(8)?,
        absences_count: row.get(9)?,
    })
}

/// One line of a business's presence history, as archived in transfer snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceFact {
    pub market_id: String,
    pub session_date: NaiveDate,
    pub stall_id: Option<String>,
    pub presence_kind: PresenceKind,
    pub amount_charged: f64,
}

/// Presence history for a business across all closed sessions, oldest first.
pub fn presence_history(conn: &Connection, business_id: &str) -> CoreResult<Vec<PresenceFact>> {
    let mut stmt = conn.prepare(
        "SELECT s.market_id, s.session_date, d.stall_id, d.presence_kind, d.amount_charged
         FROM session_details d
         JOIN market_sessions s ON s.id = d.session_id
         WHERE d.business_id = ?1
         ORDER BY s.session_date ASC",
    )?;
    let facts = stmt
        .query_map(params![business_id], |row| {
            let session_date: String = row.get(1)?;
            let kind: String = row.get(3)?;
            Ok(PresenceFact {
                market_id: row.get(0)?,
                session_date: db::parse_date(&session_date)
                    .ok_or(rusqlite::Error::InvalidQuery)?,
                stall_id: row.get(2)?,
                presence_kind: PresenceKind::from_str(&kind)
                    .ok_or(rusqlite::Error::InvalidQuery)?,
                amount_charged: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(facts)
}

/// Position of a business in the spuntisti ranking (graduatoria) of a market,
/// ordered by accumulated presences. None if the business never attended.
pub fn ranking_position(
    conn: &Connection,
    market_id: &str,
    business_id: &str,
) -> CoreResult<Option<u32>> {
    let mut stmt = conn.prepare(
        "SELECT d.business_id, SUM(d.presences_count) AS presences
         FROM session_details d
         JOIN market_sessions s ON s.id = d.session_id
         WHERE s.market_id = ?1 AND d.presence_kind = 'SPUNTISTA'
         GROUP BY d.business_id
         ORDER BY presences DESC, d.business_id ASC",
    )?;
    let ranked = stmt
        .query_map(params![market_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ranked
        .iter()
        .position(|b| b == business_id)
        .map(|i| (i + 1) as u32))
}

// ============================================================================
// TESTS
// ============================================================================
