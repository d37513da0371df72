// Justification Review - manually submitted excuses for market-day facts
//
// Independent of the transgression pipeline, but a justification may
// reference the transgression it argues against. ACCEPTED and REJECTED are
// terminal; there is no re-review and no overturning through this operation.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collaborators::BlobStore;
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::notifications;
use crate::transgressions;

// ============================================================================
// STATUS MODEL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JustificationStatus {
    Submitted,
    Accepted,
    Rejected,
}

impl JustificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JustificationStatus::Submitted => "SUBMITTED",
            JustificationStatus::Accepted => "ACCEPTED",
            JustificationStatus::Rejected => "REJECTED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "SUBMITTED" => Some(JustificationStatus::Submitted),
            "ACCEPTED" => Some(JustificationStatus::Accepted),
            "REJECTED" => Some(JustificationStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewDecision {
    Accept,
    Reject,
}

impl ReviewDecision {
    fn resulting_status(&self) -> JustificationStatus {
        match self {
            ReviewDecision::Accept => JustificationStatus::Accepted,
            ReviewDecision::Reject => JustificationStatus::Rejected,
        }
    }
}

/// A submitted excuse (medical certificate, early-exit notice, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Justification {
    pub id: String,
    pub business_id: String,
    pub market_id: String,
    pub market_date: NaiveDate,
    pub kind: String,
    pub reason: String,
    /// Blob-store reference; bytes never live in the core.
    pub file_ref: Option<String>,
    pub transgression_id: Option<String>,
    pub status: JustificationStatus,
    pub decision_notes: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Submit a justification for a market day, optionally linked to a
/// transgression. The file reference, if any, was already stored externally.
#[allow(clippy::too_many_arguments)]
pub fn submit(
    conn: &Connection,
    business_id: &str,
    market_id: &str,
    market_date: NaiveDate,
    kind: &str,
    reason: &str,
    file_ref: Option<&str>,
    transgression_id: Option<&str>,
) -> CoreResult<Justification> {
    if business_id.trim().is_empty() {
        return Err(CoreError::validation("business reference is required"));
    }
    if reason.trim().is_empty() {
        return Err(CoreError::validation("justification reason must not be empty"));
    }
    if let Some(t_id) = transgression_id {
        transgressions::get_transgression(conn, t_id)?
            .ok_or_else(|| CoreError::not_found("transgression", t_id))?;
    }

    let justification = Justification {
        id: uuid::Uuid::new_v4().to_string(),
        business_id: business_id.to_string(),
        market_id: market_id.to_string(),
        market_date,
        kind: kind.to_string(),
        reason: reason.to_string(),
        file_ref: file_ref.map(str::to_string),
        transgression_id: transgression_id.map(str::to_string),
        status: JustificationStatus::Submitted,
        decision_notes: None,
        reviewed_at: None,
        created_at: Utc::now(),
    };

    conn.execute(
        "INSERT INTO justifications (
            id, business_id, market_id, market_date, kind, reason, file_ref,
            transgression_id, status, decision_notes, reviewed_at, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, ?10)",
        params![
            justification.id,
            justification.business_id,
            justification.market_id,
            justification.market_date.to_string(),
            justification.kind,
            justification.reason,
            justification.file_ref,
            justification.transgression_id,
            justification.status.as_str(),
            justification.created_at.to_rfc3339(),
        ],
    )?;

    info!(business = %business_id, %market_date, kind, "justification submitted");
    Ok(justification)
}

/// Upload an attachment through the blob store, then submit with its
/// reference. The upload is a bounded collaborator call made before any
/// mutation; its failure rejects the submission.
#[allow(clippy::too_many_arguments)]
pub fn submit_with_attachment(
    conn: &Connection,
    blob_store: &dyn BlobStore,
    business_id: &str,
    market_id: &str,
    market_date: NaiveDate,
    kind: &str,
    reason: &str,
    file_name: &str,
    bytes: &[u8],
    transgression_id: Option<&str>,
) -> CoreResult<Justification> {
    let file_ref = blob_store
        .store(file_name, bytes)
        .map_err(|e| CoreError::validation(format!("attachment upload rejected: {e}")))?;
    submit(
        conn,
        business_id,
        market_id,
        market_date,
        kind,
        reason,
        Some(&file_ref),
        transgression_id,
    )
}

/// Decide a justification. Terminal: only a SUBMITTED justification can be
/// reviewed, and the decision is never overturned through this operation.
pub fn review(
    conn: &mut Connection,
    justification_id: &str,
    decision: ReviewDecision,
    notes: Option<&str>,
) -> CoreResult<Justification> {
    let tx = conn.transaction()?;

    let current = get_justification(&tx, justification_id)?
        .ok_or_else(|| CoreError::not_found("justification", justification_id))?;
    if current.status != JustificationStatus::Submitted {
        return Err(CoreError::invalid_state(
            JustificationStatus::Submitted.as_str(),
            current.status.as_str(),
        ));
    }

    let status = decision.resulting_status();
    let reviewed_at = Utc::now();
    tx.execute(
        "UPDATE justifications
         SET status = ?1, decision_notes = ?2, reviewed_at = ?3 WHERE id = ?4",
        params![
            status.as_str(),
            notes,
            reviewed_at.to_rfc3339(),
            justification_id,
        ],
    )?;
    tx.commit()?;
    info!(justification = %justification_id, decision = status.as_str(), "justification decided");

    // post-commit notification; a failure here never fails the mutation
    if let Err(e) = notifications::enqueue(
        conn,
        "justification.decided",
        serde_json::json!({
            "justification_id": justification_id,
            "business_id": current.business_id,
            "decision": status.as_str(),
            "notes": notes,
        }),
    ) {
        warn!(error = %e, "failed to enqueue justification notification");
    }

    Ok(Justification {
        status,
        decision_notes: notes.map(str::to_string),
        reviewed_at: Some(reviewed_at),
        ..current
    })
}

// ============================================================================
// QUERIES
// ============================================================================

const JUSTIFICATION_COLUMNS: &str = "id, business_id, market_id, market_date, kind, reason, \
     file_ref, transgression_id, status, decision_notes, reviewed_at, created_at";

fn justification_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Justification> {
    let market_date: String = row.get(3)?;
    let status: String = row.get(8)?;
    let reviewed_at: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    Ok(Justification {
        id: row.get(0)?,
        business_id: row.get(1)?,
        market_id: row.get(2)?,
        market_date: db::parse_date(&market_date).ok_or(rusqlite::Error::InvalidQuery)?,
        kind: row.get(4)?,
        reason: row.get(5)?,
        file_ref: row.get(6)?,
        transgression_id: row.get(7)?,
        status: JustificationStatus::from_str(&status).ok_or(rusqlite::Error::InvalidQuery)?,
        decision_notes: row.get(9)?,
        reviewed_at: reviewed_at.as_deref().and_then(db::parse_utc),
        created_at: db::parse_utc(&created_at).ok_or(rusqlite::Error::InvalidQuery)?,
    })
}

pub fn get_justification(
    conn: &Connection,
    justification_id: &str,
) -> CoreResult<Option<Justification>> {
    let sql = format!("SELECT {JUSTIFICATION_COLUMNS} FROM justifications WHERE id = ?1");
    let justification = conn
        .query_row(&sql, params![justification_id], justification_from_row)
        .optional()?;
    Ok(justification)
}

/// Justifications awaiting review, oldest first.
pub fn list_pending(conn: &Connection) -> CoreResult<Vec<Justification>> {
    let sql = format!(
        "SELECT {JUSTIFICATION_COLUMNS} FROM justifications
         WHERE status = 'SUBMITTED' ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let justifications = stmt
        .query_map([], justification_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(justifications)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryBlobStore;
    use crate::db::setup_database;
    use crate::transgressions::detect;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn submit_default(conn: &Connection) -> Justification {
        submit(
            conn,
            "biz-x",
            "mercato-centro",
            date(2025, 11, 7),
            "MEDICA",
            "certificato medico allegato",
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_submit_and_accept() {
        let mut conn = test_conn();
        let justification = submit_default(&conn);
        assert_eq!(justification.status, JustificationStatus::Submitted);

        let decided = review(
            &mut conn,
            &justification.id,
            ReviewDecision::Accept,
            Some("certificato valido"),
        )
        .unwrap();
        assert_eq!(decided.status, JustificationStatus::Accepted);
        assert_eq!(decided.decision_notes.as_deref(), Some("certificato valido"));
        assert!(decided.reviewed_at.is_some());
    }

    #[test]
    fn test_no_re_review_and_decision_unchanged() {
        let mut conn = test_conn();
        let justification = submit_default(&conn);
        review(&mut conn, &justification.id, ReviewDecision::Reject, Some("fuori termine"))
            .unwrap();

        let err = review(&mut conn, &justification.id, ReviewDecision::Accept, None).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));

        // the original decision stands
        let current = get_justification(&conn, &justification.id).unwrap().unwrap();
        assert_eq!(current.status, JustificationStatus::Rejected);
        assert_eq!(current.decision_notes.as_deref(), Some("fuori termine"));
    }

    #[test]
    fn test_review_unknown_is_not_found() {
        let mut conn = test_conn();
        let err = review(&mut conn, "missing", ReviewDecision::Accept, None).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn test_submit_validation() {
        let conn = test_conn();

        let err = submit(&conn, "", "m", date(2025, 11, 7), "MEDICA", "reason", None, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));

        let err = submit(&conn, "biz-x", "m", date(2025, 11, 7), "MEDICA", "  ", None, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn test_transgression_link_must_resolve() {
        let conn = test_conn();

        let err = submit(
            &conn,
            "biz-x",
            "m",
            date(2025, 11, 7),
            "MEDICA",
            "reason",
            None,
            Some("missing"),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "transgression", .. }));

        let transgression =
            detect(&conn, "7", "biz-x", date(2025, 11, 7), "ASSENZA", None, None).unwrap();
        let justification = submit(
            &conn,
            "biz-x",
            "m",
            date(2025, 11, 7),
            "MEDICA",
            "reason",
            None,
            Some(&transgression.id),
        )
        .unwrap();
        assert_eq!(
            justification.transgression_id.as_deref(),
            Some(transgression.id.as_str())
        );
    }

    #[test]
    fn test_submit_with_attachment_stores_reference_only() {
        let conn = test_conn();
        let store = InMemoryBlobStore::new();

        let justification = submit_with_attachment(
            &conn,
            &store,
            "biz-x",
            "mercato-centro",
            date(2025, 11, 7),
            "MEDICA",
            "certificato medico",
            "certificato.pdf",
            b"%PDF-1.4",
            None,
        )
        .unwrap();

        let file_ref = justification.file_ref.unwrap();
        assert!(file_ref.starts_with("blob://"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_list_pending_oldest_first() {
        let mut conn = test_conn();
        let first = submit_default(&conn);
        let second = submit(
            &conn,
            "biz-y",
            "mercato-centro",
            date(2025, 11, 14),
            "USCITA_ANTICIPATA",
            "guasto al furgone",
            None,
            None,
        )
        .unwrap();

        let pending = list_pending(&conn).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);

        review(&mut conn, &first.id, ReviewDecision::Accept, None).unwrap();
        let pending = list_pending(&conn).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
    }
}
