// Notification outbox + reconciliation digest
//
// Core mutations commit first; the outbox row is a separate small write made
// after the commit, so a notification failure can never roll back a ledger
// mutation. dispatch_pending() drains the outbox at-least-once, out of band.
// reconcile_digest() re-materializes outbox rows from the authoritative
// tables, catching anything a crashed process failed to enqueue.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::collaborators::{Notification, NotificationDispatcher};
use crate::db;
use crate::error::CoreResult;

// ============================================================================
// OUTBOX MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(OutboxStatus::Pending),
            "SENT" => Some(OutboxStatus::Sent),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// ENQUEUE / DRAIN
// ============================================================================

/// Enqueue a notification for out-of-band delivery. Called after the
/// triggering mutation has committed.
pub fn enqueue(conn: &Connection, topic: &str, payload: serde_json::Value) -> CoreResult<OutboxRecord> {
    let record = OutboxRecord {
        id: uuid::Uuid::new_v4().to_string(),
        topic: topic.to_string(),
        payload,
        status: OutboxStatus::Pending,
        attempts: 0,
        last_error: None,
        created_at: Utc::now(),
    };
    conn.execute(
        "INSERT INTO notification_outbox (
            id, topic, payload, status, attempts, last_error, created_at, dispatched_at
        ) VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5, NULL)",
        params![
            record.id,
            record.topic,
            serde_json::to_string(&record.payload)?,
            record.status.as_str(),
            record.created_at.to_rfc3339(),
        ],
    )?;
    Ok(record)
}

/// Result of one outbox drain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchSummary {
    pub sent: usize,
    pub retried: usize,
    pub exhausted: usize,
}

/// Drain PENDING records through the dispatcher, at-least-once. A failed
/// delivery stays PENDING with an incremented attempt count until
/// `max_attempts`, then is marked FAILED for manual reconciliation.
pub fn dispatch_pending(
    conn: &Connection,
    dispatcher: &dyn NotificationDispatcher,
    max_attempts: i64,
) -> CoreResult<DispatchSummary> {
    let pending = list_by_status(conn, OutboxStatus::Pending)?;
    let mut summary = DispatchSummary::default();

    for record in pending {
        let notification = Notification {
            topic: record.topic.clone(),
            payload: record.payload.clone(),
        };
        match dispatcher.dispatch(&notification) {
            Ok(()) => {
                conn.execute(
                    "UPDATE notification_outbox
                     SET status = 'SENT', dispatched_at = ?1 WHERE id = ?2",
                    params![Utc::now().to_rfc3339(), record.id],
                )?;
                summary.sent += 1;
            }
            Err(e) => {
                let attempts = record.attempts + 1;
                if attempts >= max_attempts {
                    conn.execute(
                        "UPDATE notification_outbox
                         SET status = 'FAILED', attempts = ?1, last_error = ?2 WHERE id = ?3",
                        params![attempts, e, record.id],
                    )?;
                    summary.exhausted += 1;
                    warn!(topic = %record.topic, error = %e, "notification attempts exhausted");
                } else {
                    conn.execute(
                        "UPDATE notification_outbox
                         SET attempts = ?1, last_error = ?2 WHERE id = ?3",
                        params![attempts, e, record.id],
                    )?;
                    summary.retried += 1;
                }
            }
        }
    }

    if summary.sent + summary.retried + summary.exhausted > 0 {
        info!(
            sent = summary.sent,
            retried = summary.retried,
            exhausted = summary.exhausted,
            "outbox drained"
        );
    }
    Ok(summary)
}

pub fn list_by_status(conn: &Connection, status: OutboxStatus) -> CoreResult<Vec<OutboxRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, topic, payload, status, attempts, last_error, created_at
         FROM notification_outbox WHERE status = ?1 ORDER BY created_at ASC, rowid ASC",
    )?;
    let records = stmt
        .query_map(params![status.as_str()], |row| {
            let payload: String = row.get(2)?;
            let status: String = row.get(3)?;
            let created_at: String = row.get(6)?;
            Ok(OutboxRecord {
                id: row.get(0)?,
                topic: row.get(1)?,
                payload: serde_json::from_str(&payload)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                status: OutboxStatus::from_str(&status).ok_or(rusqlite::Error::InvalidQuery)?,
                attempts: row.get(4)?,
                last_error: row.get(5)?,
                created_at: db::parse_utc(&created_at).ok_or(rusqlite::Error::InvalidQuery)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

// ============================================================================
// RECONCILIATION DIGEST
// ============================================================================

/// Re-materialize outbox records from the authoritative tables: sanctions
/// issued, justification decisions, and subingresso events since `since`.
///
/// Each fact maps to a deterministic record id (hash of topic + source id),
/// so re-running the job is idempotent and only fills the gaps left by
/// enqueue failures or crashed processes. Returns the number of records
/// materialized by this run.
pub fn reconcile_digest(conn: &Connection, since: NaiveDate) -> CoreResult<usize> {
    let mut materialized = 0usize;

    // sanctions issued
    {
        let mut stmt = conn.prepare(
            "SELECT s.id, s.code, s.amount, s.due_date, t.business_id
             FROM sanctions s
             JOIN transgressions t ON t.sanction_id = s.id
             WHERE s.issued_at >= ?1",
        )?;
        let rows = stmt
            .query_map(params![since.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (id, code, amount, due_date, business_id) in rows {
            materialized += materialize(
                conn,
                "sanction.issued",
                &id,
                serde_json::json!({
                    "code": code,
                    "business_id": business_id,
                    "amount": amount,
                    "due_date": due_date,
                }),
            )?;
        }
    }

    // justification decisions
    {
        let mut stmt = conn.prepare(
            "SELECT id, business_id, status, decision_notes
             FROM justifications
             WHERE status != 'SUBMITTED' AND reviewed_at IS NOT NULL AND date(reviewed_at) >= ?1",
        )?;
        let rows = stmt
            .query_map(params![since.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (id, business_id, status, notes) in rows {
            materialized += materialize(
                conn,
                "justification.decided",
                &id,
                serde_json::json!({
                    "justification_id": id,
                    "business_id": business_id,
                    "decision": status,
                    "notes": notes,
                }),
            )?;
        }
    }

    // subingresso transfers
    {
        let mut stmt = conn.prepare(
            "SELECT id, stall_id, cedente_id, subentrante_id, balance_transferred
             FROM titolarita_events
             WHERE kind = 'SUBINGRESSO' AND date(created_at) >= ?1",
        )?;
        let rows = stmt
            .query_map(params![since.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (id, stall_id, cedente, subentrante, balance) in rows {
            materialized += materialize(
                conn,
                "concession.transferred",
                &id,
                serde_json::json!({
                    "event_id": id,
                    "stall_id": stall_id,
                    "cedente_id": cedente,
                    "subentrante_id": subentrante,
                    "balance_transferred": balance,
                }),
            )?;
        }
    }

    if materialized > 0 {
        info!(materialized, "reconciliation digest filled outbox gaps");
    }
    Ok(materialized)
}

/// Insert one digest record with a deterministic id; 0 if already present.
fn materialize(
    conn: &Connection,
    topic: &str,
    source_id: &str,
    payload: serde_json::Value,
) -> CoreResult<usize> {
    let mut hasher = Sha256::new();
    hasher.update(format!("{topic}:{source_id}"));
    let id = format!("digest-{:x}", hasher.finalize());

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO notification_outbox (
            id, topic, payload, status, attempts, last_error, created_at, dispatched_at
        ) VALUES (?1, ?2, ?3, 'PENDING', 0, NULL, ?4, NULL)",
        params![
            id,
            topic,
            serde_json::to_string(&payload)?,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(inserted)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    /// Dispatcher that fails the first `failures` deliveries, then succeeds.
    struct FlakyDispatcher {
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    impl NotificationDispatcher for FlakyDispatcher {
        fn dispatch(&self, _notification: &Notification) -> Result<(), String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err("connection refused".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_enqueue_and_drain() {
        let conn = test_conn();
        enqueue(&conn, "sanction.issued", serde_json::json!({"code": "PM-2025-000001"})).unwrap();

        let dispatcher = FlakyDispatcher {
            failures: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let summary = dispatch_pending(&conn, &dispatcher, 5).unwrap();
        assert_eq!(summary.sent, 1);

        assert!(list_by_status(&conn, OutboxStatus::Pending).unwrap().is_empty());
        assert_eq!(list_by_status(&conn, OutboxStatus::Sent).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_delivery_retries_then_succeeds() {
        let conn = test_conn();
        enqueue(&conn, "sanction.issued", serde_json::json!({})).unwrap();

        let dispatcher = FlakyDispatcher {
            failures: 2,
            calls: Arc::new(AtomicUsize::new(0)),
        };

        // two failing drains keep the record pending with attempt counts
        let summary = dispatch_pending(&conn, &dispatcher, 5).unwrap();
        assert_eq!(summary.retried, 1);
        let summary = dispatch_pending(&conn, &dispatcher, 5).unwrap();
        assert_eq!(summary.retried, 1);

        let pending = list_by_status(&conn, OutboxStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[0].last_error.as_deref(), Some("connection refused"));

        // third drain delivers
        let summary = dispatch_pending(&conn, &dispatcher, 5).unwrap();
        assert_eq!(summary.sent, 1);
    }

    #[test]
    fn test_exhausted_attempts_mark_failed() {
        let conn = test_conn();
        enqueue(&conn, "sanction.issued", serde_json::json!({})).unwrap();

        let dispatcher = FlakyDispatcher {
            failures: usize::MAX,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        dispatch_pending(&conn, &dispatcher, 2).unwrap();
        let summary = dispatch_pending(&conn, &dispatcher, 2).unwrap();
        assert_eq!(summary.exhausted, 1);

        assert_eq!(list_by_status(&conn, OutboxStatus::Failed).unwrap().len(), 1);
    }

    #[test]
    fn test_reconcile_digest_is_idempotent() {
        let conn = test_conn();

        // one justification decided directly in the store
        conn.execute(
            "INSERT INTO justifications (
                id, business_id, market_id, market_date, kind, reason, file_ref,
                transgression_id, status, decision_notes, reviewed_at, created_at
            ) VALUES ('j1', 'biz-x', 'm', '2025-11-07', 'MEDICA', 'certificato',
                      NULL, NULL, 'ACCEPTED', 'ok', ?1, ?1)",
            params![Utc::now().to_rfc3339()],
        )
        .unwrap();

        let first = reconcile_digest(&conn, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()).unwrap();
        assert_eq!(first, 1);

        // re-running fills nothing
        let second = reconcile_digest(&conn, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()).unwrap();
        assert_eq!(second, 0);

        let pending = list_by_status(&conn, OutboxStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].topic, "justification.decided");
    }
}
