// Storage layer - SQLite schema + reference data
// RULE: every invariant that can be a constraint IS a constraint:
//   - at most one ATTIVA concession per stall  -> partial UNIQUE index
//   - detect() idempotency key                 -> UNIQUE(stall, business, date, kind)
//   - titolarita_events append-only            -> RAISE(ABORT) triggers

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Open the market database at `path` with WAL enabled.
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).context("Failed to open market database")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Open an in-memory database (used in tests and dry runs).
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Reference data: stalls and businesses
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS stalls (
            id TEXT PRIMARY KEY,
            market_id TEXT NOT NULL,
            number TEXT NOT NULL,
            area_sqm REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_stalls_market_number
            ON stalls(market_id, number);

        CREATE TABLE IF NOT EXISTS businesses (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            tax_code TEXT NOT NULL,
            wallet_balance REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );",
    )?;

    // ==========================================================================
    // Concession ledger
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS concessions (
            id TEXT PRIMARY KEY,
            stall_id TEXT NOT NULL REFERENCES stalls(id),
            holder_id TEXT NOT NULL REFERENCES businesses(id),
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            valid_from TEXT NOT NULL,
            valid_to TEXT,
            created_at TEXT NOT NULL
        );
        -- at most one ATTIVA concession per stall, enforced by the store
        CREATE UNIQUE INDEX IF NOT EXISTS idx_concessions_one_active
            ON concessions(stall_id) WHERE status = 'ATTIVA';
        CREATE INDEX IF NOT EXISTS idx_concessions_holder ON concessions(holder_id);

        CREATE TABLE IF NOT EXISTS titolarita_events (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            stall_id TEXT NOT NULL,
            market_id TEXT NOT NULL,
            concession_before TEXT,
            concession_after TEXT,
            cedente_id TEXT,
            subentrante_id TEXT,
            document_number TEXT,
            document_date TEXT,
            balance_transferred REAL,
            snapshots TEXT,
            notes TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_titolarita_stall
            ON titolarita_events(stall_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_titolarita_market
            ON titolarita_events(market_id, created_at);

        -- audit history is append-only
        CREATE TRIGGER IF NOT EXISTS titolarita_events_no_update
            BEFORE UPDATE ON titolarita_events
            BEGIN SELECT RAISE(ABORT, 'titolarita_events is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS titolarita_events_no_delete
            BEFORE DELETE ON titolarita_events
            BEGIN SELECT RAISE(ABORT, 'titolarita_events is append-only'); END;",
    )?;

    // ==========================================================================
    // Market sessions and per-stall detail rows
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS market_sessions (
            id TEXT PRIMARY KEY,
            market_id TEXT NOT NULL,
            session_date TEXT NOT NULL,
            occupied_stalls INTEGER NOT NULL,
            total_revenue REAL NOT NULL,
            total_presences INTEGER NOT NULL,
            first_entry TEXT,
            last_exit TEXT,
            closed_at TEXT NOT NULL,
            UNIQUE(market_id, session_date)
        );

        CREATE TABLE IF NOT EXISTS session_details (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES market_sessions(id),
            stall_id TEXT,
            business_id TEXT NOT NULL,
            presence_kind TEXT NOT NULL,
            entered_at TEXT,
            exited_at TEXT,
            amount_charged REAL NOT NULL DEFAULT 0,
            presences_count INTEGER NOT NULL DEFAULT 0,
            absences_count INTEGER NOT NULL DEFAULT 0,
            row_hash TEXT UNIQUE NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_session_details_business
            ON session_details(business_id);",
    )?;

    // ==========================================================================
    // Transgressions and sanctions
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS transgressions (
            id TEXT PRIMARY KEY,
            stall_id TEXT NOT NULL,
            business_id TEXT NOT NULL,
            market_date TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            details TEXT,
            entry_time TEXT,
            sanction_id TEXT,
            archival_notes TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(stall_id, business_id, market_date, kind)
        );
        CREATE INDEX IF NOT EXISTS idx_transgressions_status ON transgressions(status);

        CREATE TABLE IF NOT EXISTS sanctions (
            id TEXT PRIMARY KEY,
            code TEXT UNIQUE NOT NULL,
            infraction_kind TEXT NOT NULL,
            amount REAL NOT NULL,
            paid_amount REAL,
            payment_status TEXT NOT NULL,
            issued_at TEXT NOT NULL,
            due_date TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS counters (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO counters (name, value) VALUES ('sanction_code', 0);",
    )?;

    // ==========================================================================
    // Watchlist, justifications, notification outbox
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS watchlist_items (
            id TEXT PRIMARY KEY,
            business_id TEXT NOT NULL,
            trigger_kind TEXT NOT NULL,
            description TEXT NOT NULL,
            priority TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS justifications (
            id TEXT PRIMARY KEY,
            business_id TEXT NOT NULL,
            market_id TEXT NOT NULL,
            market_date TEXT NOT NULL,
            kind TEXT NOT NULL,
            reason TEXT NOT NULL,
            file_ref TEXT,
            transgression_id TEXT,
            status TEXT NOT NULL,
            decision_notes TEXT,
            reviewed_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS notification_outbox (
            id TEXT PRIMARY KEY,
            topic TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            dispatched_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_outbox_status ON notification_outbox(status);",
    )?;

    Ok(())
}

// ============================================================================
// REFERENCE DATA: STALLS
// ============================================================================

/// A physical market stall ("posteggio"). Immutable reference data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stall {
    pub id: String,
    pub market_id: String,
    /// Display number painted on the ground ("12", "12bis").
    pub number: String,
    pub area_sqm: f64,
}

impl Stall {
    pub fn new(market_id: &str, number: &str, area_sqm: f64) -> Self {
        Stall {
            id: uuid::Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            number: number.to_string(),
            area_sqm,
        }
    }
}

pub fn insert_stall(conn: &Connection, stall: &Stall) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO stalls (id, market_id, number, area_sqm, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            stall.id,
            stall.market_id,
            stall.number,
            stall.area_sqm,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_stall(conn: &Connection, stall_id: &str) -> Result<Option<Stall>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT id, market_id, number, area_sqm FROM stalls WHERE id = ?1")?;
    let mut rows = stmt.query_map(params![stall_id], |row| {
        Ok(Stall {
            id: row.get(0)?,
            market_id: row.get(1)?,
            number: row.get(2)?,
            area_sqm: row.get(3)?,
        })
    })?;
    rows.next().transpose()
}

pub fn list_stalls(conn: &Connection, market_id: &str) -> Result<Vec<Stall>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, market_id, number, area_sqm FROM stalls
         WHERE market_id = ?1 ORDER BY number",
    )?;
    let stalls = stmt
        .query_map(params![market_id], |row| {
            Ok(Stall {
                id: row.get(0)?,
                market_id: row.get(1)?,
                number: row.get(2)?,
                area_sqm: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(stalls)
}

// ============================================================================
// REFERENCE DATA: BUSINESSES
// ============================================================================

/// A registered business ("impresa"). The wallet balance lives here so that
/// transfer balance application can join the ledger transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Business {
    pub id: String,
    pub name: String,
    pub tax_code: String,
    pub wallet_balance: f64,
}

impl Business {
    pub fn new(name: &str, tax_code: &str) -> Self {
        Business {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            tax_code: tax_code.to_string(),
            wallet_balance: 0.0,
        }
    }
}

pub fn insert_business(conn: &Connection, business: &Business) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO businesses (id, name, tax_code, wallet_balance, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            business.id,
            business.name,
            business.tax_code,
            business.wallet_balance,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_business(
    conn: &Connection,
    business_id: &str,
) -> Result<Option<Business>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT id, name, tax_code, wallet_balance FROM businesses WHERE id = ?1")?;
    let mut rows = stmt.query_map(params![business_id], |row| {
        Ok(Business {
            id: row.get(0)?,
            name: row.get(1)?,
            tax_code: row.get(2)?,
            wallet_balance: row.get(3)?,
        })
    })?;
    rows.next().transpose()
}

// ============================================================================
// COLUMN HELPERS
// ============================================================================

/// Parse an RFC 3339 column written by this crate.
pub(crate) fn parse_utc(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an ISO date column (YYYY-MM-DD).
pub(crate) fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_and_reference_data() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let stall = Stall::new("mercato-centro", "12", 24.0);
        insert_stall(&conn, &stall).unwrap();

        let found = get_stall(&conn, &stall.id).unwrap().unwrap();
        assert_eq!(found.number, "12");
        assert_eq!(found.market_id, "mercato-centro");

        let business = Business::new("Frutta Rossi", "RSSMRA80A01H501U");
        insert_business(&conn, &business).unwrap();
        let found = get_business(&conn, &business.id).unwrap().unwrap();
        assert_eq!(found.name, "Frutta Rossi");
        assert_eq!(found.wallet_balance, 0.0);
    }

    #[test]
    fn test_duplicate_stall_number_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        insert_stall(&conn, &Stall::new("mercato-centro", "5", 20.0)).unwrap();
        let result = insert_stall(&conn, &Stall::new("mercato-centro", "5", 18.0));
        assert!(result.is_err());

        // same number on another market is fine
        insert_stall(&conn, &Stall::new("mercato-nord", "5", 18.0)).unwrap();
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM counters", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_column_helpers() {
        let now = Utc::now();
        let parsed = parse_utc(&now.to_rfc3339()).unwrap();
        assert_eq!(parsed.timestamp(), now.timestamp());

        assert_eq!(
            parse_date("2025-11-07"),
            NaiveDate::from_ymd_opt(2025, 11, 7)
        );
        assert!(parse_date("07/11/2025").is_none());
    }
}
