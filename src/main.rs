// Mercato Core - Operational CLI
// import presence rows, close sessions, inspect titolarità history, drain the outbox

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use std::env;
use std::path::Path;

use mercato_core::{
    ledger, notifications, sessions, open_database, setup_database, TracingDispatcher,
};

const OUTBOX_MAX_ATTEMPTS: i64 = 5;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("close-session") => run_close_session(&args[2..]),
        Some("history") => run_history(&args[2..]),
        Some("dispatch") => run_dispatch(&args[2..]),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("mercato - municipal market concession core");
    println!();
    println!("USAGE:");
    println!("  mercato close-session <db> <market-id> <YYYY-MM-DD> <presences.csv>");
    println!("  mercato history <db> (market|stall) <id> [limit]");
    println!("  mercato dispatch <db> [since YYYY-MM-DD]");
}

/// Import a presence CSV and close the market session it describes.
fn run_close_session(args: &[String]) -> Result<()> {
    let [db_path, market_id, date, csv_path] = args else {
        bail!("usage: mercato close-session <db> <market-id> <YYYY-MM-DD> <presences.csv>");
    };
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")?;

    let mut conn = open_database(Path::new(db_path))?;
    setup_database(&conn)?;

    let rows = sessions::load_presence_csv(Path::new(csv_path))?;
    println!("Loaded {} presence rows from {}", rows.len(), csv_path);

    let outcome = sessions::close_session(&mut conn, market_id, date, &rows)?;
    println!("Session {} on {} closed:", market_id, date);
    println!("  occupied stalls:  {}", outcome.session.occupied_stalls);
    println!("  total presences:  {}", outcome.session.total_presences);
    println!("  total revenue:    {:.2}", outcome.session.total_revenue);
    println!("  rows recorded:    {}", outcome.rows_recorded);
    println!("  duplicates dropped: {}", outcome.duplicates_dropped);

    Ok(())
}

/// Print titolarità history for a stall or a market, most recent first.
fn run_history(args: &[String]) -> Result<()> {
    let (db_path, scope_kind, id) = match args {
        [db, kind, id] | [db, kind, id, _] => (db, kind.as_str(), id),
        _ => bail!("usage: mercato history <db> (market|stall) <id> [limit]"),
    };
    let limit: usize = args.get(3).map(|s| s.parse()).transpose()?.unwrap_or(20);

    let conn = open_database(Path::new(db_path))?;
    setup_database(&conn)?;

    let scope = match scope_kind {
        "market" => ledger::HistoryScope::Market(id),
        "stall" => ledger::HistoryScope::Stall(id),
        other => bail!("unknown history scope '{other}', expected 'market' or 'stall'"),
    };

    let events = ledger::history(&conn, scope, limit)?;
    if events.is_empty() {
        println!("No titolarità events for {scope_kind} {id}");
        return Ok(());
    }
    for event in events {
        let parties = match (&event.cedente_id, &event.subentrante_id) {
            (Some(cedente), Some(subentrante)) => format!("{cedente} -> {subentrante}"),
            (None, Some(holder)) => holder.clone(),
            (Some(holder), None) => holder.clone(),
            (None, None) => "-".to_string(),
        };
        println!(
            "{}  {:<12}  stall {:<6}  {}",
            event.created_at.format("%Y-%m-%d %H:%M"),
            event.kind.as_str(),
            event.stall_id,
            parties
        );
    }

    Ok(())
}

/// Reconcile the notification digest and drain the outbox.
fn run_dispatch(args: &[String]) -> Result<()> {
    let Some(db_path) = args.first() else {
        bail!("usage: mercato dispatch <db> [since YYYY-MM-DD]");
    };
    let since = match args.get(1) {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")?,
        None => Utc::now().date_naive() - chrono::Duration::days(30),
    };

    let conn = open_database(Path::new(db_path))?;
    setup_database(&conn)?;

    let materialized = notifications::reconcile_digest(&conn, since)?;
    let summary = notifications::dispatch_pending(&conn, &TracingDispatcher, OUTBOX_MAX_ATTEMPTS)?;
    println!(
        "Outbox: {} materialized, {} sent, {} retried, {} exhausted",
        materialized, summary.sent, summary.retried, summary.exhausted
    );

    Ok(())
}
