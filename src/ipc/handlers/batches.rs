use crate::ipc::{err, ok, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn handle_batches_list(conn: &Connection, req: &Request) -> serde_json::Value {
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(20);

    let run = || -> anyhow::Result<serde_json::Value> {
        let mut stmt = conn.prepare(
            "SELECT id, file_name, uploaded_by, uploaded_at, rows_total, rows_ok,
                    rows_failed, summary
             FROM upload_batches
             ORDER BY uploaded_at DESC LIMIT ?",
        )?;
        let batches = stmt
            .query_map([limit], |row| {
                let total: i64 = row.get(4)?;
                let ok_rows: i64 = row.get(5)?;
                let pct = if total > 0 {
                    (ok_rows as f64 / total as f64 * 10000.0).round() / 100.0
                } else {
                    0.0
                };
                Ok(json!({
                    "batchId": row.get::<_, String>(0)?,
                    "fileName": row.get::<_, String>(1)?,
                    "uploadedBy": row.get::<_, String>(2)?,
                    "uploadedAt": row.get::<_, String>(3)?,
                    "rowsTotal": total,
                    "rowsOk": ok_rows,
                    "rowsFailed": row.get::<_, i64>(6)?,
                    "successPercentage": pct,
                    "summary": row.get::<_, String>(7)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(json!({ "batches": batches }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_batches_detail(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(batch_id) = req.params.get("batchId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.batchId", None);
    };

    let run = || -> anyhow::Result<Option<serde_json::Value>> {
        let batch = conn
            .query_row(
                "SELECT file_name, file_sha256, uploaded_by, uploaded_at, rows_total,
                        rows_ok, rows_failed, summary
                 FROM upload_batches WHERE id = ?",
                [batch_id],
                |row| {
                    Ok(json!({
                        "batchId": batch_id,
                        "fileName": row.get::<_, String>(0)?,
                        "fileSha256": row.get::<_, String>(1)?,
                        "uploadedBy": row.get::<_, String>(2)?,
                        "uploadedAt": row.get::<_, String>(3)?,
                        "rowsTotal": row.get::<_, i64>(4)?,
                        "rowsOk": row.get::<_, i64>(5)?,
                        "rowsFailed": row.get::<_, i64>(6)?,
                        "summary": row.get::<_, String>(7)?,
                    }))
                },
            )
            .optional()?;
        let Some(mut batch) = batch else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT row_num, carnet, message, row_json
             FROM row_errors WHERE batch_id = ?
             ORDER BY row_num",
        )?;
        let errors = stmt
            .query_map([batch_id], |row| {
                let raw: String = row.get(3)?;
                let snapshot: serde_json::Value =
                    serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null);
                Ok(json!({
                    "row": row.get::<_, i64>(0)?,
                    "carnet": row.get::<_, Option<i64>>(1)?,
                    "message": row.get::<_, String>(2)?,
                    "rowData": snapshot,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        batch["errors"] = json!(errors);
        Ok(Some(batch))
    };

    match run() {
        Ok(Some(result)) => ok(&req.id, result),
        Ok(None) => err(
            &req.id,
            "not_found",
            format!("no batch with id {}", batch_id),
            None,
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(
    state: &mut crate::ipc::AppState,
    req: &Request,
) -> Option<serde_json::Value> {
    if req.method != "batches.list" && req.method != "batches.detail" {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    Some(if req.method == "batches.list" {
        handle_batches_list(conn, req)
    } else {
        handle_batches_detail(conn, req)
    })
}
