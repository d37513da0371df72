// Concession Ledger - who holds the right to occupy a stall, over time
//
// The ledger owns two tables:
// - concessions: current holdership, one ATTIVA row per stall (partial UNIQUE index)
// - titolarita_events: append-only audit trail of every lifecycle transition
//
// Every mutation runs in a single transaction; the audit row and the
// concession rows commit together or not at all.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction as SqlTransaction};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::notifications;
use crate::sessions;
use crate::transgressions;

// ============================================================================
// CONCESSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcessionStatus {
    Attiva,
    Scaduta,
    Cessata,
}

impl ConcessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcessionStatus::Attiva => "ATTIVA",
            ConcessionStatus::Scaduta => "SCADUTA",
            ConcessionStatus::Cessata => "CESSATA",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "ATTIVA" => Some(ConcessionStatus::Attiva),
            "SCADUTA" => Some(ConcessionStatus::Scaduta),
            "CESSATA" => Some(ConcessionStatus::Cessata),
            _ => None,
        }
    }
}

/// The right of a business to occupy a specific stall for a period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concession {
    pub id: String,
    pub stall_id: String,
    pub holder_id: String,
    /// Concession type as issued ("ordinaria", "stagionale", ...).
    pub kind: String,
    /// Stored status. Display logic must go through `compute_status`.
    pub status: ConcessionStatus,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

/// Status derivation used by display and eligibility logic.
///
/// Explicit CESSATA always wins over the date comparison; an ATTIVA row is
/// still ATTIVA while valid_to is open or in the future, SCADUTA otherwise.
pub fn compute_status(concession: &Concession, today: NaiveDate) -> ConcessionStatus {
    match concession.status {
        ConcessionStatus::Cessata => ConcessionStatus::Cessata,
        _ => match concession.valid_to {
            None => ConcessionStatus::Attiva,
            Some(valid_to) if valid_to >= today => ConcessionStatus::Attiva,
            Some(_) => ConcessionStatus::Scaduta,
        },
    }
}

// ============================================================================
// TITOLARITA EVENTS (append-only)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Creazione,
    Rinnovo,
    Subingresso,
    Cessazione,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Creazione => "CREAZIONE",
            EventKind::Rinnovo => "RINNOVO",
            EventKind::Subingresso => "SUBINGRESSO",
            EventKind::Cessazione => "CESSAZIONE",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "CREAZIONE" => Some(EventKind::Creazione),
            "RINNOVO" => Some(EventKind::Rinnovo),
            "SUBINGRESSO" => Some(EventKind::Subingresso),
            "CESSAZIONE" => Some(EventKind::Cessazione),
            _ => None,
        }
    }
}

/// External document references carried by a transfer (SCIA declaration).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentRefs {
    pub scia_number: Option<String>,
    pub scia_date: Option<NaiveDate>,
}

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Opaque, versioned snapshot of the cedente's position at transfer time.
///
/// Validated for shape at write time, never parsed structurally afterwards.
/// Pure audit artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedSnapshots {
    pub version: u32,
    pub presences: serde_json::Value,
    pub ranking: serde_json::Value,
    pub payment_schedule: serde_json::Value,
}

impl ArchivedSnapshots {
    fn validate_shape(&self) -> CoreResult<()> {
        if self.version == 0 {
            return Err(CoreError::validation("snapshot version must be >= 1"));
        }
        if !self.presences.is_array() {
            return Err(CoreError::validation("presences snapshot must be an array"));
        }
        if !self.ranking.is_object() {
            return Err(CoreError::validation("ranking snapshot must be an object"));
        }
        if !self.payment_schedule.is_array() {
            return Err(CoreError::validation(
                "payment schedule snapshot must be an array",
            ));
        }
        Ok(())
    }
}

/// One audit record of a titolarità transition. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitolaritaEvent {
    pub id: String,
    pub kind: EventKind,
    pub stall_id: String,
    pub market_id: String,
    pub concession_before: Option<String>,
    pub concession_after: Option<String>,
    pub cedente_id: Option<String>,
    pub subentrante_id: Option<String>,
    pub document_number: Option<String>,
    pub document_date: Option<NaiveDate>,
    pub balance_transferred: Option<f64>,
    pub snapshots: Option<serde_json::Value>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TitolaritaEvent {
    fn new(kind: EventKind, stall_id: &str, market_id: &str) -> Self {
        TitolaritaEvent {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            stall_id: stall_id.to_string(),
            market_id: market_id.to_string(),
            concession_before: None,
            concession_after: None,
            cedente_id: None,
            subentrante_id: None,
            document_number: None,
            document_date: None,
            balance_transferred: None,
            snapshots: None,
            notes: None,
            created_at: Utc::now(),
        }
    }
}

fn insert_event(tx: &SqlTransaction, event: &TitolaritaEvent) -> CoreResult<()> {
    let snapshots_json = event
        .snapshots
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    tx.execute(
        "INSERT INTO titolarita_events (
            id, kind, stall_id, market_id, concession_before, concession_after,
            cedente_id, subentrante_id, document_number, document_date,
            balance_transferred, snapshots, notes, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            event.id,
            event.kind.as_str(),
            event.stall_id,
            event.market_id,
            event.concession_before,
            event.concession_after,
            event.cedente_id,
            event.subentrante_id,
            event.document_number,
            event.document_date.map(|d| d.to_string()),
            event.balance_transferred,
            snapshots_json,
            event.notes,
            event.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn concession_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Concession> {
    let status: String = row.get(4)?;
    let valid_from: String = row.get(5)?;
    let valid_to: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(Concession {
        id: row.get(0)?,
        stall_id: row.get(1)?,
        holder_id: row.get(2)?,
        kind: row.get(3)?,
        status: ConcessionStatus::from_str(&status).ok_or(rusqlite::Error::InvalidQuery)?,
        valid_from: db::parse_date(&valid_from).ok_or(rusqlite::Error::InvalidQuery)?,
        valid_to: valid_to.as_deref().and_then(db::parse_date),
        created_at: db::parse_utc(&created_at).ok_or(rusqlite::Error::InvalidQuery)?,
    })
}

const CONCESSION_COLUMNS: &str =
    "id, stall_id, holder_id, kind, status, valid_from, valid_to, created_at";

pub fn get_concession(conn: &Connection, concession_id: &str) -> CoreResult<Option<Concession>> {
    let sql = format!("SELECT {CONCESSION_COLUMNS} FROM concessions WHERE id = ?1");
    let concession = conn
        .query_row(&sql, params![concession_id], concession_from_row)
        .optional()?;
    Ok(concession)
}

/// The ATTIVA concession on a stall, if any.
pub fn active_concession_for_stall(
    conn: &Connection,
    stall_id: &str,
) -> CoreResult<Option<Concession>> {
    let sql = format!(
        "SELECT {CONCESSION_COLUMNS} FROM concessions WHERE stall_id = ?1 AND status = 'ATTIVA'"
    );
    let concession = conn
        .query_row(&sql, params![stall_id], concession_from_row)
        .optional()?;
    Ok(concession)
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TitolaritaEvent> {
    let kind: String = row.get(1)?;
    let document_date: Option<String> = row.get(9)?;
    let snapshots_json: Option<String> = row.get(11)?;
    let created_at: String = row.get(13)?;
    Ok(TitolaritaEvent {
        id: row.get(0)?,
        kind: EventKind::from_str(&kind).ok_or(rusqlite::Error::InvalidQuery)?,
        stall_id: row.get(2)?,
        market_id: row.get(3)?,
        concession_before: row.get(4)?,
        concession_after: row.get(5)?,
        cedente_id: row.get(6)?,
        subentrante_id: row.get(7)?,
        document_number: row.get(8)?,
        document_date: document_date.as_deref().and_then(db::parse_date),
        balance_transferred: row.get(10)?,
        snapshots: snapshots_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
        notes: row.get(12)?,
        created_at: db::parse_utc(&created_at).ok_or(rusqlite::Error::InvalidQuery)?,
    })
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Create a new ATTIVA concession on a free stall, with its CREAZIONE event.
pub fn create(
    conn: &mut Connection,
    stall_id: &str,
    holder_id: &str,
    valid_from: NaiveDate,
    kind: &str,
) -> CoreResult<Concession> {
    if kind.trim().is_empty() {
        return Err(CoreError::validation("concession kind must not be empty"));
    }

    let stall = db::get_stall(conn, stall_id)?
        .ok_or_else(|| CoreError::not_found("stall", stall_id))?;
    db::get_business(conn, holder_id)?
        .ok_or_else(|| CoreError::not_found("business", holder_id))?;

    let tx = conn.transaction()?;

    if active_concession_for_stall(&tx, stall_id)?.is_some() {
        return Err(CoreError::conflict(format!(
            "stall {} already has an active concession",
            stall.number
        )));
    }

    let concession = Concession {
        id: uuid::Uuid::new_v4().to_string(),
        stall_id: stall_id.to_string(),
        holder_id: holder_id.to_string(),
        kind: kind.to_string(),
        status: ConcessionStatus::Attiva,
        valid_from,
        valid_to: None,
        created_at: Utc::now(),
    };
    insert_concession(&tx, &concession).map_err(|e| {
        // a concurrent create can beat the pre-check; the partial index catches it
        if e.is_constraint_violation() {
            CoreError::conflict(format!(
                "stall {} already has an active concession",
                stall.number
            ))
        } else {
            e
        }
    })?;

    let mut event = TitolaritaEvent::new(EventKind::Creazione, stall_id, &stall.market_id);
    event.concession_after = Some(concession.id.clone());
    event.subentrante_id = Some(holder_id.to_string());
    insert_event(&tx, &event)?;

    tx.commit()?;
    info!(stall = %stall.number, holder = %holder_id, "concession created");
    Ok(concession)
}

fn insert_concession(tx: &SqlTransaction, concession: &Concession) -> CoreResult<()> {
    tx.execute(
        "INSERT INTO concessions (
            id, stall_id, holder_id, kind, status, valid_from, valid_to, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            concession.id,
            concession.stall_id,
            concession.holder_id,
            concession.kind,
            concession.status.as_str(),
            concession.valid_from.to_string(),
            concession.valid_to.map(|d| d.to_string()),
            concession.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Extend a concession's validity, recording the prior valid-to in a RINNOVO event.
///
/// A CESSATA concession is no longer renewable and is reported as not found.
pub fn renew(
    conn: &mut Connection,
    concession_id: &str,
    new_valid_to: NaiveDate,
) -> CoreResult<Concession> {
    let concession = get_concession(conn, concession_id)?
        .ok_or_else(|| CoreError::not_found("concession", concession_id))?;
    if concession.status == ConcessionStatus::Cessata {
        return Err(CoreError::not_found("concession", concession_id));
    }

    let market_id = market_of_stall(conn, &concession.stall_id)?;
    let tx = conn.transaction()?;

    let mut event = TitolaritaEvent::new(EventKind::Rinnovo, &concession.stall_id, &market_id);
    event.concession_before = Some(concession.id.clone());
    event.concession_after = Some(concession.id.clone());
    event.subentrante_id = Some(concession.holder_id.clone());
    event.notes = Some(match concession.valid_to {
        Some(prev) => format!("valid_to precedente: {prev}"),
        None => "valid_to precedente: aperta".to_string(),
    });
    insert_event(&tx, &event)?;

    tx.execute(
        "UPDATE concessions SET valid_to = ?1 WHERE id = ?2",
        params![new_valid_to.to_string(), concession.id],
    )?;

    tx.commit()?;
    info!(concession = %concession.id, %new_valid_to, "concession renewed");

    Ok(Concession {
        valid_to: Some(new_valid_to),
        ..concession
    })
}

/// Outcome of a subingresso transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub event: TitolaritaEvent,
    pub ceased: Concession,
    pub created: Concession,
}

/// Transfer holdership (subingresso) from the current holder to `subentrante_id`.
///
/// Runs as one transaction with four sub-steps:
/// (a) archive the cedente's presence/ranking/payment snapshots on the event,
/// (b) set the old concession CESSATA,
/// (c) create the subentrante's ATTIVA concession on the same stall,
/// (d) apply the signed balance to the subentrante's wallet.
/// Any failure rolls back all of them.
pub fn transfer(
    conn: &mut Connection,
    concession_id: &str,
    subentrante_id: &str,
    documents: DocumentRefs,
    balance_transferred: f64,
) -> CoreResult<TransferOutcome> {
    let today = Utc::now().date_naive();
    let concession = get_concession(conn, concession_id)?
        .ok_or_else(|| CoreError::not_found("concession", concession_id))?;
    if compute_status(&concession, today) != ConcessionStatus::Attiva {
        return Err(CoreError::conflict(format!(
            "concession {} is not active (status {})",
            concession.id,
            compute_status(&concession, today).as_str()
        )));
    }
    let market_id = market_of_stall(conn, &concession.stall_id)?;

    let tx = conn.transaction()?;

    // (a) archive the cedente's position at the moment of transfer
    let snapshots = ArchivedSnapshots {
        version: SNAPSHOT_VERSION,
        presences: serde_json::to_value(sessions::presence_history(
            &tx,
            &concession.holder_id,
        )?)?,
        ranking: serde_json::json!({
            "business_id": concession.holder_id,
            "position": sessions::ranking_position(&tx, &market_id, &concession.holder_id)?,
        }),
        payment_schedule: serde_json::to_value(transgressions::pending_payment_schedule(
            &tx,
            &concession.holder_id,
        )?)?,
    };
    snapshots.validate_shape()?;

    let new_concession = Concession {
        id: uuid::Uuid::new_v4().to_string(),
        stall_id: concession.stall_id.clone(),
        holder_id: subentrante_id.to_string(),
        kind: concession.kind.clone(),
        status: ConcessionStatus::Attiva,
        valid_from: today,
        valid_to: concession.valid_to,
        created_at: Utc::now(),
    };

    let mut event = TitolaritaEvent::new(EventKind::Subingresso, &concession.stall_id, &market_id);
    event.concession_before = Some(concession.id.clone());
    event.concession_after = Some(new_concession.id.clone());
    event.cedente_id = Some(concession.holder_id.clone());
    event.subentrante_id = Some(subentrante_id.to_string());
    event.document_number = documents.scia_number.clone();
    event.document_date = documents.scia_date;
    event.balance_transferred = Some(balance_transferred);
    event.snapshots = Some(serde_json::to_value(&snapshots)?);
    insert_event(&tx, &event)?;

    // (b) the cedente's concession ceases
    tx.execute(
        "UPDATE concessions SET status = 'CESSATA' WHERE id = ?1",
        params![concession.id],
    )?;

    // (c) the subentrante takes over the stall
    insert_concession(&tx, &new_concession)?;

    // (d) signed balance carry-over; negative moves debt onto the subentrante
    let updated = tx.execute(
        "UPDATE businesses SET wallet_balance = wallet_balance + ?1 WHERE id = ?2",
        params![balance_transferred, subentrante_id],
    )?;
    if updated == 0 {
        return Err(CoreError::not_found("business", subentrante_id));
    }

    tx.commit()?;
    info!(
        stall = %concession.stall_id,
        cedente = %concession.holder_id,
        subentrante = %subentrante_id,
        balance = balance_transferred,
        "subingresso completed"
    );

    // post-commit notification; a failure here never fails the mutation
    if let Err(e) = notifications::enqueue(
        conn,
        "concession.transferred",
        serde_json::json!({
            "event_id": event.id,
            "stall_id": concession.stall_id,
            "cedente_id": concession.holder_id,
            "subentrante_id": subentrante_id,
            "balance_transferred": balance_transferred,
        }),
    ) {
        warn!(error = %e, "failed to enqueue transfer notification");
    }

    Ok(TransferOutcome {
        event,
        ceased: Concession {
            status: ConcessionStatus::Cessata,
            ..concession
        },
        created: new_concession,
    })
}

/// Terminate a concession (CESSAZIONE); the stall becomes available again.
pub fn terminate(
    conn: &mut Connection,
    concession_id: &str,
    reason: &str,
) -> CoreResult<Concession> {
    let concession = get_concession(conn, concession_id)?
        .ok_or_else(|| CoreError::not_found("concession", concession_id))?;
    if concession.status == ConcessionStatus::Cessata {
        return Err(CoreError::invalid_state(
            "ATTIVA or SCADUTA",
            concession.status.as_str(),
        ));
    }
    let market_id = market_of_stall(conn, &concession.stall_id)?;

    let tx = conn.transaction()?;

    let mut event = TitolaritaEvent::new(EventKind::Cessazione, &concession.stall_id, &market_id);
    event.concession_before = Some(concession.id.clone());
    event.cedente_id = Some(concession.holder_id.clone());
    event.notes = Some(reason.to_string());
    insert_event(&tx, &event)?;

    tx.execute(
        "UPDATE concessions SET status = 'CESSATA' WHERE id = ?1",
        params![concession.id],
    )?;

    tx.commit()?;
    info!(concession = %concession.id, reason, "concession terminated");

    Ok(Concession {
        status: ConcessionStatus::Cessata,
        ..concession
    })
}

/// History scope: one stall or a whole market.
#[derive(Debug, Clone, Copy)]
pub enum HistoryScope<'a> {
    Stall(&'a str),
    Market(&'a str),
}

/// Titolarità events, most recent first. Read-only.
pub fn history(
    conn: &Connection,
    scope: HistoryScope<'_>,
    limit: usize,
) -> CoreResult<Vec<TitolaritaEvent>> {
    let (column, value) = match scope {
        HistoryScope::Stall(id) => ("stall_id", id),
        HistoryScope::Market(id) => ("market_id", id),
    };
    let sql = format!(
        "SELECT id, kind, stall_id, market_id, concession_before, concession_after,
                cedente_id, subentrante_id, document_number, document_date,
                balance_transferred, snapshots, notes, created_at
         FROM titolarita_events
         WHERE {column} = ?1
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let events = stmt
        .query_map(params![value, limit as i64], event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

fn market_of_stall(conn: &Connection, stall_id: &str) -> CoreResult<String> {
    let stall =
        db::get_stall(conn, stall_id)?.ok_or_else(|| CoreError::not_found("stall", stall_id))?;
    Ok(stall.market_id)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_business, insert_stall, setup_database, Business, Stall};

    struct Fixture {
        conn: Connection,
        stall: Stall,
        business_x: Business,
        business_y: Business,
    }

    fn fixture() -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let stall = Stall::new("mercato-centro", "12", 24.0);
        insert_stall(&conn, &stall).unwrap();

        let business_x = Business::new("Ditta X", "XXXXXX80A01H501X");
        let business_y = Business::new("Ditta Y", "YYYYYY80A01H501Y");
        insert_business(&conn, &business_x).unwrap();
        insert_business(&conn, &business_y).unwrap();

        Fixture {
            conn,
            stall,
            business_x,
            business_y,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// At most one ATTIVA concession per stall, checked store-wide.
    fn assert_single_active_invariant(conn: &Connection) {
        let worst: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(n), 0) FROM (
                    SELECT COUNT(*) AS n FROM concessions
                    WHERE status = 'ATTIVA' GROUP BY stall_id
                )",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(worst <= 1, "stall with {} active concessions", worst);
    }

    #[test]
    fn test_create_writes_concession_and_event() {
        let mut f = fixture();
        let concession = create(
            &mut f.conn,
            &f.stall.id,
            &f.business_x.id,
            date(2025, 1, 1),
            "ordinaria",
        )
        .unwrap();

        assert_eq!(concession.status, ConcessionStatus::Attiva);
        assert!(concession.valid_to.is_none());
        assert_single_active_invariant(&f.conn);

        let events = history(&f.conn, HistoryScope::Stall(&f.stall.id), 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Creazione);
        assert_eq!(events[0].concession_after.as_deref(), Some(concession.id.as_str()));
    }

    #[test]
    fn test_create_on_occupied_stall_conflicts() {
        let mut f = fixture();
        create(&mut f.conn, &f.stall.id, &f.business_x.id, date(2025, 1, 1), "ordinaria").unwrap();

        let err = create(&mut f.conn, &f.stall.id, &f.business_y.id, date(2025, 2, 1), "ordinaria")
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
        assert_single_active_invariant(&f.conn);
    }

    #[test]
    fn test_create_unknown_references() {
        let mut f = fixture();
        let err = create(&mut f.conn, "missing", &f.business_x.id, date(2025, 1, 1), "ordinaria")
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "stall", .. }));

        let err = create(&mut f.conn, &f.stall.id, "missing", date(2025, 1, 1), "ordinaria")
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "business", .. }));
    }

    #[test]
    fn test_renew_extends_and_records_prior_valid_to() {
        let mut f = fixture();
        let concession =
            create(&mut f.conn, &f.stall.id, &f.business_x.id, date(2025, 1, 1), "ordinaria")
                .unwrap();

        let renewed = renew(&mut f.conn, &concession.id, date(2030, 12, 31)).unwrap();
        assert_eq!(renewed.valid_to, Some(date(2030, 12, 31)));

        let renewed = renew(&mut f.conn, &concession.id, date(2035, 12, 31)).unwrap();
        assert_eq!(renewed.valid_to, Some(date(2035, 12, 31)));

        let events = history(&f.conn, HistoryScope::Stall(&f.stall.id), 10).unwrap();
        let last_renewal = &events[0];
        assert_eq!(last_renewal.kind, EventKind::Rinnovo);
        assert_eq!(
            last_renewal.notes.as_deref(),
            Some("valid_to precedente: 2030-12-31")
        );
    }

    // Scenario E: renew on a CESSATA concession fails NotFound.
    #[test]
    fn test_renew_after_cessation_is_not_found() {
        let mut f = fixture();
        let concession =
            create(&mut f.conn, &f.stall.id, &f.business_x.id, date(2025, 1, 1), "ordinaria")
                .unwrap();
        terminate(&mut f.conn, &concession.id, "rinuncia").unwrap();

        let err = renew(&mut f.conn, &concession.id, date(2030, 12, 31)).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    // Scenario A: transfer moves holdership, records the event, carries the balance.
    #[test]
    fn test_transfer_subingresso() {
        let mut f = fixture();
        let concession =
            create(&mut f.conn, &f.stall.id, &f.business_x.id, date(2025, 1, 1), "ordinaria")
                .unwrap();

        let outcome = transfer(
            &mut f.conn,
            &concession.id,
            &f.business_y.id,
            DocumentRefs {
                scia_number: Some("SCIA-2025-00431".to_string()),
                scia_date: Some(date(2025, 6, 15)),
            },
            -150.0,
        )
        .unwrap();

        // stall 12's active holder is now Y
        let active = active_concession_for_stall(&f.conn, &f.stall.id)
            .unwrap()
            .unwrap();
        assert_eq!(active.holder_id, f.business_y.id);
        assert_single_active_invariant(&f.conn);

        // X's former concession is CESSATA
        let old = get_concession(&f.conn, &concession.id).unwrap().unwrap();
        assert_eq!(old.status, ConcessionStatus::Cessata);

        // the event carries cedente, subentrante and the signed balance
        assert_eq!(outcome.event.cedente_id.as_deref(), Some(f.business_x.id.as_str()));
        assert_eq!(outcome.event.subentrante_id.as_deref(), Some(f.business_y.id.as_str()));
        assert_eq!(outcome.event.balance_transferred, Some(-150.0));
        assert_eq!(
            outcome.event.document_number.as_deref(),
            Some("SCIA-2025-00431")
        );

        // snapshots are present and shaped
        let snaps: ArchivedSnapshots =
            serde_json::from_value(outcome.event.snapshots.clone().unwrap()).unwrap();
        assert_eq!(snaps.version, SNAPSHOT_VERSION);
        assert!(snaps.presences.is_array());

        // debt moved onto the subentrante
        let y = db::get_business(&f.conn, &f.business_y.id).unwrap().unwrap();
        assert_eq!(y.wallet_balance, -150.0);
    }

    // Scenario B: transfer on a CESSATA concession fails ConflictError.
    #[test]
    fn test_transfer_on_ceased_concession_conflicts() {
        let mut f = fixture();
        let concession =
            create(&mut f.conn, &f.stall.id, &f.business_x.id, date(2025, 1, 1), "ordinaria")
                .unwrap();
        terminate(&mut f.conn, &concession.id, "rinuncia").unwrap();

        let err = transfer(
            &mut f.conn,
            &concession.id,
            &f.business_y.id,
            DocumentRefs::default(),
            0.0,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
    }

    /// A fault in the last sub-step (unknown subentrante wallet) must leave
    /// the pre-transfer state untouched: no event, old concession still ATTIVA.
    #[test]
    fn test_transfer_is_atomic_on_late_failure() {
        let mut f = fixture();
        let concession =
            create(&mut f.conn, &f.stall.id, &f.business_x.id, date(2025, 1, 1), "ordinaria")
                .unwrap();

        let err = transfer(
            &mut f.conn,
            &concession.id,
            "no-such-business",
            DocumentRefs::default(),
            -150.0,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "business", .. }));

        let current = get_concession(&f.conn, &concession.id).unwrap().unwrap();
        assert_eq!(current.status, ConcessionStatus::Attiva);
        assert_eq!(current.holder_id, f.business_x.id);

        let events = history(&f.conn, HistoryScope::Stall(&f.stall.id), 10).unwrap();
        assert_eq!(events.len(), 1, "only the CREAZIONE event may exist");
        assert_eq!(events[0].kind, EventKind::Creazione);
        assert_single_active_invariant(&f.conn);
    }

    /// The partial unique index is the last line of defense: no interleaving
    /// of writes, not even ones that bypass the ledger API, can leave a stall
    /// with two ATTIVA rows.
    #[test]
    fn test_store_refuses_second_active_concession() {
        let mut f = fixture();
        let concession =
            create(&mut f.conn, &f.stall.id, &f.business_x.id, date(2025, 1, 1), "ordinaria")
                .unwrap();

        // a raw INSERT simulating a competing writer hits the index
        let rogue_insert = f.conn.execute(
            "INSERT INTO concessions (
                id, stall_id, holder_id, kind, status, valid_from, valid_to, created_at
            ) VALUES ('rogue', ?1, ?2, 'ordinaria', 'ATTIVA', '2025-01-02', NULL, ?3)",
            params![f.stall.id, f.business_y.id, Utc::now().to_rfc3339()],
        );
        assert!(rogue_insert.is_err());

        // flipping a ceased row back to ATTIVA next to an active one hits it too
        terminate(&mut f.conn, &concession.id, "rinuncia").unwrap();
        create(&mut f.conn, &f.stall.id, &f.business_y.id, date(2025, 2, 1), "ordinaria").unwrap();
        let reactivate = f.conn.execute(
            "UPDATE concessions SET status = 'ATTIVA' WHERE id = ?1",
            params![concession.id],
        );
        assert!(reactivate.is_err());

        assert_single_active_invariant(&f.conn);
    }

    #[test]
    fn test_terminate_frees_the_stall() {
        let mut f = fixture();
        let concession =
            create(&mut f.conn, &f.stall.id, &f.business_x.id, date(2025, 1, 1), "ordinaria")
                .unwrap();
        terminate(&mut f.conn, &concession.id, "decadenza").unwrap();

        assert!(active_concession_for_stall(&f.conn, &f.stall.id)
            .unwrap()
            .is_none());

        // the stall is available for a new create
        create(&mut f.conn, &f.stall.id, &f.business_y.id, date(2025, 7, 1), "ordinaria").unwrap();
        assert_single_active_invariant(&f.conn);
    }

    #[test]
    fn test_terminate_twice_is_invalid_state() {
        let mut f = fixture();
        let concession =
            create(&mut f.conn, &f.stall.id, &f.business_x.id, date(2025, 1, 1), "ordinaria")
                .unwrap();
        terminate(&mut f.conn, &concession.id, "decadenza").unwrap();

        let err = terminate(&mut f.conn, &concession.id, "decadenza").unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    #[test]
    fn test_events_are_append_only() {
        let mut f = fixture();
        create(&mut f.conn, &f.stall.id, &f.business_x.id, date(2025, 1, 1), "ordinaria").unwrap();

        let update = f
            .conn
            .execute("UPDATE titolarita_events SET notes = 'tampered'", []);
        assert!(update.is_err());

        let delete = f.conn.execute("DELETE FROM titolarita_events", []);
        assert!(delete.is_err());

        let count: i64 = f
            .conn
            .query_row("SELECT COUNT(*) FROM titolarita_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_history_is_most_recent_first() {
        let mut f = fixture();
        let concession =
            create(&mut f.conn, &f.stall.id, &f.business_x.id, date(2025, 1, 1), "ordinaria")
                .unwrap();
        renew(&mut f.conn, &concession.id, date(2030, 12, 31)).unwrap();
        terminate(&mut f.conn, &concession.id, "rinuncia").unwrap();

        let events = history(&f.conn, HistoryScope::Market("mercato-centro"), 10).unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Cessazione, EventKind::Rinnovo, EventKind::Creazione]
        );

        let limited = history(&f.conn, HistoryScope::Market("mercato-centro"), 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_compute_status_derivation() {
        let today = date(2025, 6, 1);
        let mut concession = Concession {
            id: "c".to_string(),
            stall_id: "s".to_string(),
            holder_id: "b".to_string(),
            kind: "ordinaria".to_string(),
            status: ConcessionStatus::Attiva,
            valid_from: date(2025, 1, 1),
            valid_to: None,
            created_at: Utc::now(),
        };

        // open-ended: ATTIVA
        assert_eq!(compute_status(&concession, today), ConcessionStatus::Attiva);

        // valid_to today: still ATTIVA (inclusive bound)
        concession.valid_to = Some(today);
        assert_eq!(compute_status(&concession, today), ConcessionStatus::Attiva);

        // past valid_to: SCADUTA
        concession.valid_to = Some(date(2025, 5, 31));
        assert_eq!(compute_status(&concession, today), ConcessionStatus::Scaduta);

        // explicit CESSATA wins over any date
        concession.status = ConcessionStatus::Cessata;
        concession.valid_to = Some(date(2099, 1, 1));
        assert_eq!(compute_status(&concession, today), ConcessionStatus::Cessata);
    }
}
