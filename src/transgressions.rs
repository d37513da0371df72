// Transgression Pipeline - detection -> sanction or archival
//
// detect() is idempotent on (stall, business, market date, kind); the key is
// a UNIQUE constraint so concurrent detection jobs converge on one record.
// SANCTIONED and ARCHIVED are terminal; sanction() and archive() are atomic
// check-then-write transactions.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collaborators::InfractionCatalog;
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::notifications;

// ============================================================================
// STATUS MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransgressionStatus {
    Detected,
    Sanctioned,
    Archived,
}

impl TransgressionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransgressionStatus::Detected => "DETECTED",
            TransgressionStatus::Sanctioned => "SANCTIONED",
            TransgressionStatus::Archived => "ARCHIVED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "DETECTED" => Some(TransgressionStatus::Detected),
            "SANCTIONED" => Some(TransgressionStatus::Sanctioned),
            "ARCHIVED" => Some(TransgressionStatus::Archived),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransgressionStatus::Detected)
    }
}

/// The three UI buckets. Derived from {status, sanction presence} at query
/// time; never stored, so they cannot diverge from the authoritative status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayBucket {
    Active,
    Controlled,
    Archived,
}

impl DisplayBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayBucket::Active => "active",
            DisplayBucket::Controlled => "controlled",
            DisplayBucket::Archived => "archived",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "active" => Some(DisplayBucket::Active),
            "controlled" => Some(DisplayBucket::Controlled),
            "archived" => Some(DisplayBucket::Archived),
            _ => None,
        }
    }
}

// ============================================================================
// ENTITIES
// ============================================================================

/// A detected rule violation on a stall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transgression {
    pub id: String,
    pub stall_id: String,
    pub business_id: String,
    pub market_date: NaiveDate,
    pub kind: String,
    pub status: TransgressionStatus,
    pub details: Option<String>,
    pub entry_time: Option<String>,
    pub sanction_id: Option<String>,
    pub archival_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Overdue,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Overdue => "OVERDUE",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(PaymentStatus::Pending),
            "PAID" => Some(PaymentStatus::Paid),
            "OVERDUE" => Some(PaymentStatus::Overdue),
            _ => None,
        }
    }
}

/// A formal sanction record (verbale).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sanction {
    pub id: String,
    pub code: String,
    pub infraction_kind: String,
    pub amount: f64,
    /// Settled amount once paid; may be reduced.
    pub paid_amount: Option<f64>,
    pub payment_status: PaymentStatus,
    pub issued_at: NaiveDate,
    pub due_date: NaiveDate,
}

/// Payment terms: sanctions fall due 60 days after issue.
const PAYMENT_TERM_DAYS: i64 = 60;

// ============================================================================
// OPERATIONS
// ============================================================================

/// Record a detected violation. Idempotent on (stall, business, date, kind):
/// a second call returns the existing record. The key is enforced by the
/// store so concurrent detection jobs cannot race to create two records.
pub fn detect(
    conn: &Connection,
    stall_id: &str,
    business_id: &str,
    market_date: NaiveDate,
    kind: &str,
    details: Option<&str>,
    entry_time: Option<&str>,
) -> CoreResult<Transgression> {
    if kind.trim().is_empty() {
        return Err(CoreError::validation("transgression kind must not be empty"));
    }
    if business_id.trim().is_empty() {
        return Err(CoreError::validation("business reference is required"));
    }

    let transgression = Transgression {
        id: uuid::Uuid::new_v4().to_string(),
        stall_id: stall_id.to_string(),
        business_id: business_id.to_string(),
        market_date,
        kind: kind.to_string(),
        status: TransgressionStatus::Detected,
        details: details.map(str::to_string),
        entry_time: entry_time.map(str::to_string),
        sanction_id: None,
        archival_notes: None,
        created_at: Utc::now(),
    };

    let result = conn.execute(
        "INSERT INTO transgressions (
            id, stall_id, business_id, market_date, kind, status, details,
            entry_time, sanction_id, archival_notes, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, ?9)",
        params![
            transgression.id,
            transgression.stall_id,
            transgression.business_id,
            transgression.market_date.to_string(),
            transgression.kind,
            transgression.status.as_str(),
            transgression.details,
            transgression.entry_time,
            transgression.created_at.to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => {
            info!(stall = %stall_id, business = %business_id, kind, "transgression detected");
            Ok(transgression)
        }
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            // concurrent or repeated detection: converge on the existing record
            find_by_key(conn, stall_id, business_id, market_date, kind)?.ok_or_else(|| {
                CoreError::not_found("transgression", format!("{stall_id}/{business_id}"))
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Issue a sanction for a detected transgression. The amount comes from the
/// Infraction Catalog unless overridden; the code is PM-<year>-<6 digits>
/// from a monotone counter. Atomic check-then-write.
pub fn sanction(
    conn: &mut Connection,
    catalog: &dyn InfractionCatalog,
    transgression_id: &str,
    amount_override: Option<f64>,
) -> CoreResult<Sanction> {
    // catalog lookup stays outside the transaction: bounded collaborator call
    let transgression = get_transgression(conn, transgression_id)?
        .ok_or_else(|| CoreError::not_found("transgression", transgression_id))?;
    let amount = match amount_override {
        Some(amount) if amount > 0.0 => amount,
        Some(amount) => {
            return Err(CoreError::validation(format!(
                "sanction amount must be positive, got {amount:.2}"
            )))
        }
        None => {
            catalog
                .lookup(&transgression.kind)
                .ok_or_else(|| CoreError::not_found("infraction", transgression.kind.clone()))?
                .default_amount
        }
    };

    let tx = conn.transaction()?;

    // re-read inside the transaction: the terminal check and the write commit together
    let current = get_transgression(&tx, transgression_id)?
        .ok_or_else(|| CoreError::not_found("transgression", transgression_id))?;
    if current.status.is_terminal() {
        return Err(CoreError::invalid_state(
            TransgressionStatus::Detected.as_str(),
            current.status.as_str(),
        ));
    }

    let issued_at = Utc::now().date_naive();
    let sanction = Sanction {
        id: uuid::Uuid::new_v4().to_string(),
        code: next_sanction_code(&tx, issued_at)?,
        infraction_kind: current.kind.clone(),
        amount,
        paid_amount: None,
        payment_status: PaymentStatus::Pending,
        issued_at,
        due_date: issued_at + Duration::days(PAYMENT_TERM_DAYS),
    };

    tx.execute(
        "INSERT INTO sanctions (
            id, code, infraction_kind, amount, paid_amount, payment_status,
            issued_at, due_date
        ) VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?7)",
        params![
            sanction.id,
            sanction.code,
            sanction.infraction_kind,
            sanction.amount,
            sanction.payment_status.as_str(),
            sanction.issued_at.to_string(),
            sanction.due_date.to_string(),
        ],
    )?;
    tx.execute(
        "UPDATE transgressions SET status = 'SANCTIONED', sanction_id = ?1 WHERE id = ?2",
        params![sanction.id, transgression_id],
    )?;

    tx.commit()?;
    info!(code = %sanction.code, amount = sanction.amount, "sanction issued");

    // post-commit notification; a failure here never fails the mutation
    if let Err(e) = notifications::enqueue(
        conn,
        "sanction.issued",
        serde_json::json!({
            "code": sanction.code,
            "business_id": current.business_id,
            "amount": sanction.amount,
            "due_date": sanction.due_date,
        }),
    ) {
        warn!(error = %e, "failed to enqueue sanction notification");
    }

    Ok(sanction)
}

/// Archive a transgression with review notes. Refused once a sanction is
/// linked or the record is already archived. Atomic check-then-write.
pub fn archive(
    conn: &mut Connection,
    transgression_id: &str,
    notes: &str,
) -> CoreResult<Transgression> {
    let tx = conn.transaction()?;

    let current = get_transgression(&tx, transgression_id)?
        .ok_or_else(|| CoreError::not_found("transgression", transgression_id))?;
    if current.sanction_id.is_some() || current.status.is_terminal() {
        return Err(CoreError::invalid_state(
            TransgressionStatus::Detected.as_str(),
            current.status.as_str(),
        ));
    }

    tx.execute(
        "UPDATE transgressions SET status = 'ARCHIVED', archival_notes = ?1 WHERE id = ?2",
        params![notes, transgression_id],
    )?;
    tx.commit()?;
    info!(transgression = %transgression_id, "transgression archived");

    Ok(Transgression {
        status: TransgressionStatus::Archived,
        archival_notes: Some(notes.to_string()),
        ..current
    })
}

/// Record payment of a sanction, possibly at a reduced settled amount.
pub fn record_payment(
    conn: &mut Connection,
    sanction_id: &str,
    paid_amount: f64,
) -> CoreResult<Sanction> {
    if paid_amount <= 0.0 {
        return Err(CoreError::validation("paid amount must be positive"));
    }

    let tx = conn.transaction()?;
    let current = get_sanction(&tx, sanction_id)?
        .ok_or_else(|| CoreError::not_found("sanction", sanction_id))?;
    if current.payment_status == PaymentStatus::Paid {
        return Err(CoreError::invalid_state(
            "PENDING or OVERDUE",
            current.payment_status.as_str(),
        ));
    }

    tx.execute(
        "UPDATE sanctions SET payment_status = 'PAID', paid_amount = ?1 WHERE id = ?2",
        params![paid_amount, sanction_id],
    )?;
    tx.commit()?;
    info!(code = %current.code, paid = paid_amount, "sanction paid");

    Ok(Sanction {
        payment_status: PaymentStatus::Paid,
        paid_amount: Some(paid_amount),
        ..current
    })
}

// ============================================================================
// QUERIES
// ============================================================================

const TRANSGRESSION_COLUMNS: &str = "id, stall_id, business_id, market_date, kind, status, \
     details, entry_time, sanction_id, archival_notes, created_at";

fn transgression_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transgression> {
    let market_date: String = row.get(3)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(10)?;
    Ok(Transgression {
        id: row.get(0)?,
        stall_id: row.get(1)?,
        business_id: row.get(2)?,
        market_date: db::parse_date(&market_date).ok_or(rusqlite::Error::InvalidQuery)?,
        kind: row.get(4)?,
        status: TransgressionStatus::from_str(&status).ok_or(rusqlite::Error::InvalidQuery)?,
        details: row.get(6)?,
        entry_time: row.get(7)?,
        sanction_id: row.get(8)?,
        archival_notes: row.get(9)?,
        created_at: db::parse_utc(&created_at).ok_or(rusqlite::Error::InvalidQuery)?,
    })
}

pub fn get_transgression(
    conn: &Connection,
    transgression_id: &str,
) -> CoreResult<Option<Transgression>> {
    let sql = format!("SELECT {TRANSGRESSION_COLUMNS} FROM transgressions WHERE id = ?1");
    let transgression = conn
        .query_row(&sql, params![transgression_id], transgression_from_row)
        .optional()?;
    Ok(transgression)
}

fn find_by_key(
    conn: &Connection,
    stall_id: &str,
    business_id: &str,
    market_date: NaiveDate,
    kind: &str,
) -> CoreResult<Option<Transgression>> {
    let sql = format!(
        "SELECT {TRANSGRESSION_COLUMNS} FROM transgressions
         WHERE stall_id = ?1 AND business_id = ?2 AND market_date = ?3 AND kind = ?4"
    );
    let transgression = conn
        .query_row(
            &sql,
            params![stall_id, business_id, market_date.to_string(), kind],
            transgression_from_row,
        )
        .optional()?;
    Ok(transgression)
}

/// List transgressions for a derived display bucket, newest first.
pub fn list_by_bucket(conn: &Connection, bucket: DisplayBucket) -> CoreResult<Vec<Transgression>> {
    let predicate = match bucket {
        DisplayBucket::Active => "status = 'DETECTED'",
        DisplayBucket::Controlled => "status = 'SANCTIONED' AND sanction_id IS NOT NULL",
        DisplayBucket::Archived => "status = 'ARCHIVED'",
    };
    let sql = format!(
        "SELECT {TRANSGRESSION_COLUMNS} FROM transgressions
         WHERE {predicate} ORDER BY market_date DESC, rowid DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let transgressions = stmt
        .query_map([], transgression_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(transgressions)
}

fn sanction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sanction> {
    let payment_status: String = row.get(5)?;
    let issued_at: String = row.get(6)?;
    let due_date: String = row.get(7)?;
    Ok(Sanction {
        id: row.get(0)?,
        code: row.get(1)?,
        infraction_kind: row.get(2)?,
        amount: row.get(3)?,
        paid_amount: row.get(4)?,
        payment_status: PaymentStatus::from_str(&payment_status)
            .ok_or(rusqlite::Error::InvalidQuery)?,
        issued_at: db::parse_date(&issued_at).ok_or(rusqlite::Error::InvalidQuery)?,
        due_date: db::parse_date(&due_date).ok_or(rusqlite::Error::InvalidQuery)?,
    })
}

pub fn get_sanction(conn: &Connection, sanction_id: &str) -> CoreResult<Option<Sanction>> {
    let sanction = conn
        .query_row(
            "SELECT id, code, infraction_kind, amount, paid_amount, payment_status,
                    issued_at, due_date
             FROM sanctions WHERE id = ?1",
            params![sanction_id],
            sanction_from_row,
        )
        .optional()?;
    Ok(sanction)
}

/// One unpaid sanction line, as archived in transfer snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPayment {
    pub code: String,
    pub amount: f64,
    pub due_date: NaiveDate,
}

/// Unpaid sanctions for a business, due soonest first.
pub fn pending_payment_schedule(
    conn: &Connection,
    business_id: &str,
) -> CoreResult<Vec<PendingPayment>> {
    let mut stmt = conn.prepare(
        "SELECT s.code, s.amount, s.due_date
         FROM sanctions s
         JOIN transgressions t ON t.sanction_id = s.id
         WHERE t.business_id = ?1 AND s.payment_status != 'PAID'
         ORDER BY s.due_date ASC",
    )?;
    let schedule = stmt
        .query_map(params![business_id], |row| {
            let due_date: String = row.get(2)?;
            Ok(PendingPayment {
                code: row.get(0)?,
                amount: row.get(1)?,
                due_date: db::parse_date(&due_date).ok_or(rusqlite::Error::InvalidQuery)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(schedule)
}

/// Sanction code: PM-<year>-<zero-padded monotone counter>.
fn next_sanction_code(conn: &Connection, issued_at: NaiveDate) -> CoreResult<String> {
    conn.execute(
        "UPDATE counters SET value = value + 1 WHERE name = 'sanction_code'",
        [],
    )?;
    let value: i64 = conn.query_row(
        "SELECT value FROM counters WHERE name = 'sanction_code'",
        [],
        |row| row.get(0),
    )?;
    use chrono::Datelike;
    Ok(format!("PM-{}-{:06}", issued_at.year(), value % 1_000_000))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::entities::InfractionRegistry;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn detect_default(conn: &Connection) -> Transgression {
        detect(
            conn,
            "7",
            "biz-x",
            date(2025, 11, 7),
            "ASSENZA",
            Some("assente al controllo delle 09:00"),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_detect_is_idempotent_on_key() {
        let conn = test_conn();
        let first = detect_default(&conn);
        let second = detect_default(&conn);

        assert_eq!(first.id, second.id);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM transgressions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        // a different kind on the same day is a distinct record
        let other = detect(&conn, "7", "biz-x", date(2025, 11, 7), "USCITA_ANTICIPATA", None, None)
            .unwrap();
        assert_ne!(other.id, first.id);
    }

    #[test]
    fn test_sanction_uses_catalog_default() {
        let mut conn = test_conn();
        let catalog = InfractionRegistry::with_standard_table();
        let transgression = detect_default(&conn);

        let sanction = sanction(&mut conn, &catalog, &transgression.id, None).unwrap();
        assert_eq!(sanction.amount, 100.0);
        assert_eq!(sanction.payment_status, PaymentStatus::Pending);
        assert_eq!(sanction.due_date, sanction.issued_at + Duration::days(60));

        let updated = get_transgression(&conn, &transgression.id).unwrap().unwrap();
        assert_eq!(updated.status, TransgressionStatus::Sanctioned);
        assert_eq!(updated.sanction_id.as_deref(), Some(sanction.id.as_str()));
    }

    #[test]
    fn test_sanction_amount_override() {
        let mut conn = test_conn();
        let catalog = InfractionRegistry::with_standard_table();
        let transgression = detect_default(&conn);

        let sanction = sanction(&mut conn, &catalog, &transgression.id, Some(250.0)).unwrap();
        assert_eq!(sanction.amount, 250.0);
    }

    #[test]
    fn test_sanction_unknown_kind_without_override() {
        let mut conn = test_conn();
        let catalog = InfractionRegistry::new();
        let transgression = detect_default(&conn);

        let err = sanction(&mut conn, &catalog, &transgression.id, None).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "infraction", .. }));
    }

    #[test]
    fn test_sanction_codes_are_unique_and_monotone() {
        let mut conn = test_conn();
        let catalog = InfractionRegistry::with_standard_table();

        let mut codes = Vec::new();
        for stall in ["1", "2", "3"] {
            let t = detect(&conn, stall, "biz-x", date(2025, 11, 7), "ASSENZA", None, None)
                .unwrap();
            codes.push(sanction(&mut conn, &catalog, &t.id, None).unwrap().code);
        }

        use chrono::Datelike;
        let year = Utc::now().date_naive().year();
        for (i, code) in codes.iter().enumerate() {
            assert_eq!(*code, format!("PM-{}-{:06}", year, i + 1));
        }
    }

    // Scenario D: detect -> sanction -> archive fails InvalidState.
    #[test]
    fn test_archive_after_sanction_is_invalid() {
        let mut conn = test_conn();
        let catalog = InfractionRegistry::with_standard_table();
        let transgression = detect_default(&conn);

        sanction(&mut conn, &catalog, &transgression.id, None).unwrap();
        let err = archive(&mut conn, &transgression.id, "da chiudere").unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    #[test]
    fn test_terminal_states_stay_terminal() {
        let mut conn = test_conn();
        let catalog = InfractionRegistry::with_standard_table();

        // sanctioned: no second sanction, no archive
        let t1 = detect_default(&conn);
        sanction(&mut conn, &catalog, &t1.id, None).unwrap();
        assert!(matches!(
            sanction(&mut conn, &catalog, &t1.id, None).unwrap_err(),
            CoreError::InvalidState { .. }
        ));

        // archived: no sanction, no re-archive
        let t2 = detect(&conn, "8", "biz-y", date(2025, 11, 7), "ASSENZA", None, None).unwrap();
        archive(&mut conn, &t2.id, "giustificazione accolta").unwrap();
        assert!(matches!(
            sanction(&mut conn, &catalog, &t2.id, None).unwrap_err(),
            CoreError::InvalidState { .. }
        ));
        assert!(matches!(
            archive(&mut conn, &t2.id, "di nuovo").unwrap_err(),
            CoreError::InvalidState { .. }
        ));

        // original archival notes are unchanged
        let current = get_transgression(&conn, &t2.id).unwrap().unwrap();
        assert_eq!(
            current.archival_notes.as_deref(),
            Some("giustificazione accolta")
        );
    }

    #[test]
    fn test_display_buckets_are_derived() {
        let mut conn = test_conn();
        let catalog = InfractionRegistry::with_standard_table();

        let active = detect(&conn, "1", "biz-a", date(2025, 11, 7), "ASSENZA", None, None).unwrap();
        let controlled =
            detect(&conn, "2", "biz-b", date(2025, 11, 7), "ASSENZA", None, None).unwrap();
        let archived =
            detect(&conn, "3", "biz-c", date(2025, 11, 7), "ASSENZA", None, None).unwrap();

        sanction(&mut conn, &catalog, &controlled.id, None).unwrap();
        archive(&mut conn, &archived.id, "note").unwrap();

        let buckets = [
            (DisplayBucket::Active, active.id.clone()),
            (DisplayBucket::Controlled, controlled.id.clone()),
            (DisplayBucket::Archived, archived.id.clone()),
        ];
        for (bucket, expected_id) in buckets {
            let listed = list_by_bucket(&conn, bucket).unwrap();
            assert_eq!(listed.len(), 1, "bucket {}", bucket.as_str());
            assert_eq!(listed[0].id, expected_id);
        }
    }

    #[test]
    fn test_record_payment_with_reduction() {
        let mut conn = test_conn();
        let catalog = InfractionRegistry::with_standard_table();
        let transgression = detect_default(&conn);
        let issued = sanction(&mut conn, &catalog, &transgression.id, None).unwrap();

        let paid = record_payment(&mut conn, &issued.id, 70.0).unwrap();
        assert_eq!(paid.payment_status, PaymentStatus::Paid);
        assert_eq!(paid.paid_amount, Some(70.0));

        let err = record_payment(&mut conn, &issued.id, 70.0).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    #[test]
    fn test_pending_payment_schedule() {
        let mut conn = test_conn();
        let catalog = InfractionRegistry::with_standard_table();

        let t1 = detect(&conn, "1", "biz-x", date(2025, 11, 7), "ASSENZA", None, None).unwrap();
        let t2 = detect(&conn, "2", "biz-x", date(2025, 11, 7), "MANCATO_PAGAMENTO", None, None)
            .unwrap();
        let s1 = sanction(&mut conn, &catalog, &t1.id, None).unwrap();
        sanction(&mut conn, &catalog, &t2.id, None).unwrap();

        let schedule = pending_payment_schedule(&conn, "biz-x").unwrap();
        assert_eq!(schedule.len(), 2);

        record_payment(&mut conn, &s1.id, 100.0).unwrap();
        let schedule = pending_payment_schedule(&conn, "biz-x").unwrap();
        assert_eq!(schedule.len(), 1);
        assert_eq!(schedule[0].amount, 200.0);
    }
}
