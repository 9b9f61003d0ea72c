use crate::ingest;
use crate::ipc::{err, ok, Request};
use crate::months;
use chrono::{Datelike, Local};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;

fn handle_import_bank_file(conn: &Connection, req: &Request) -> serde_json::Value {
    let path = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = path else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };
    let submitted_by = req
        .params
        .get("submittedBy")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    match ingest::import_bank_file(conn, &path, submitted_by) {
        Ok(outcome) => match serde_json::to_value(&outcome) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "encode_failed", e.to_string(), None),
        },
        // Batch-level failure: one message, no partial result.
        Err(e) => err(
            &req.id,
            "import_failed",
            format!("{:#}", e),
            Some(json!({ "path": path.to_string_lossy() })),
        ),
    }
}

fn handle_list_for_student(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(carnet) = req.params.get("carnet").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing params.carnet", None);
    };
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(12);

    let run = || -> anyhow::Result<Option<serde_json::Value>> {
        let student_id: Option<String> = conn
            .query_row(
                "SELECT id FROM students WHERE carnet = ?",
                [carnet],
                |row| row.get(0),
            )
            .optional()?;
        let Some(student_id) = student_id else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT month, year, total_paid, tuition, late_fee, cash, own_checks,
                    local_checks, paying_agency, receipt_no, paid_on, processed_at, processed_by
             FROM payments WHERE student_id = ?
             ORDER BY year DESC, processed_at DESC LIMIT ?",
        )?;
        let payments = stmt
            .query_map(rusqlite::params![student_id, limit], |row| {
                let month: String = row.get(0)?;
                Ok(json!({
                    "month": month.clone(),
                    "monthDisplay": months::to_spanish(&month),
                    "year": row.get::<_, i32>(1)?,
                    "total": row.get::<_, f64>(2)?,
                    "tuition": row.get::<_, f64>(3)?,
                    "lateFee": row.get::<_, f64>(4)?,
                    "cash": row.get::<_, f64>(5)?,
                    "ownChecks": row.get::<_, f64>(6)?,
                    "localChecks": row.get::<_, f64>(7)?,
                    "payingAgency": row.get::<_, Option<String>>(8)?,
                    "receiptNo": row.get::<_, Option<String>>(9)?,
                    "paidOn": row.get::<_, Option<String>>(10)?,
                    "processedAt": row.get::<_, String>(11)?,
                    "processedBy": row.get::<_, Option<String>>(12)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(json!({ "payments": payments })))
    };

    match run() {
        Ok(Some(result)) => ok(&req.id, result),
        Ok(None) => err(
            &req.id,
            "not_found",
            format!("no student with carnet {}", carnet),
            None,
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Dashboard numbers: who has paid the current month, who is behind, and a
/// rough revenue estimate from the fee tiers.
fn handle_summary(conn: &Connection, req: &Request) -> serde_json::Value {
    let now = Local::now();
    let month = months::month_name_en(now.month()).to_string();
    let year = now.year();

    let run = || -> anyhow::Result<serde_json::Value> {
        let total_students: i64 = conn.query_row(
            "SELECT COUNT(*) FROM students WHERE active = 1",
            [],
            |r| r.get(0),
        )?;
        let paid: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT s.id)
             FROM students s JOIN payments p ON p.student_id = s.id
             WHERE s.active = 1 AND p.month = ? AND p.year = ?",
            rusqlite::params![month, year],
            |r| r.get(0),
        )?;
        let delinquent = total_students - paid;
        let pct = if total_students > 0 {
            (paid as f64 / total_students as f64 * 10000.0).round() / 100.0
        } else {
            0.0
        };
        // Fee that applies per paid student: override when set, else tier fee.
        let estimated: f64 = conn.query_row(
            "SELECT COALESCE(SUM(COALESCE(s.custom_fee, g.monthly_fee)), 0)
             FROM students s JOIN grades g ON g.id = s.grade_id
             WHERE s.active = 1 AND EXISTS (
                SELECT 1 FROM payments p
                WHERE p.student_id = s.id AND p.month = ? AND p.year = ?)",
            rusqlite::params![month, year],
            |r| r.get(0),
        )?;

        Ok(json!({
            "month": month,
            "monthDisplay": months::to_spanish(&month),
            "year": year,
            "activeStudents": total_students,
            "paidThisMonth": paid,
            "delinquent": delinquent,
            "paidPercentage": pct,
            "estimatedRevenue": estimated,
        }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(
    state: &mut crate::ipc::AppState,
    req: &Request,
) -> Option<serde_json::Value> {
    let methods = [
        "payments.importBankFile",
        "payments.listForStudent",
        "payments.summary",
    ];
    if !methods.contains(&req.method.as_str()) {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    Some(match req.method.as_str() {
        "payments.importBankFile" => handle_import_bank_file(conn, req),
        "payments.listForStudent" => handle_list_for_student(conn, req),
        _ => handle_summary(conn, req),
    })
}
