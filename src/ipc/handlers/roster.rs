use crate::ipc::{err, ok, Request};
use crate::months;
use chrono::Local;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_grades_create(conn: &Connection, req: &Request) -> serde_json::Value {
    let name = req.params.get("name").and_then(|v| v.as_str());
    let level = req.params.get("level").and_then(|v| v.as_str());
    let monthly_fee = req.params.get("monthlyFee").and_then(|v| v.as_f64());
    let (Some(name), Some(level), Some(monthly_fee)) = (name, level, monthly_fee) else {
        return err(
            &req.id,
            "bad_params",
            "grades.create needs name, level, monthlyFee",
            None,
        );
    };

    let id = Uuid::new_v4().to_string();
    let created_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    match conn.execute(
        "INSERT INTO grades(id, name, level, monthly_fee, active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        rusqlite::params![id, name, level, monthly_fee, created_at],
    ) {
        Ok(_) => ok(&req.id, json!({ "gradeId": id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_grades_list(conn: &Connection, req: &Request) -> serde_json::Value {
    let run = || -> anyhow::Result<serde_json::Value> {
        let mut stmt = conn.prepare(
            "SELECT g.id, g.name, g.level, g.monthly_fee, g.active,
                    (SELECT COUNT(*) FROM students s
                      WHERE s.grade_id = g.id AND s.active = 1)
             FROM grades g
             ORDER BY g.name",
        )?;
        let grades = stmt
            .query_map([], |row| {
                Ok(json!({
                    "gradeId": row.get::<_, String>(0)?,
                    "name": row.get::<_, String>(1)?,
                    "level": row.get::<_, String>(2)?,
                    "monthlyFee": row.get::<_, f64>(3)?,
                    "active": row.get::<_, i64>(4)? != 0,
                    "activeStudents": row.get::<_, i64>(5)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(json!({ "grades": grades }))
    };
    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(conn: &Connection, req: &Request) -> serde_json::Value {
    let carnet = req.params.get("carnet").and_then(|v| v.as_i64());
    let name = req.params.get("name").and_then(|v| v.as_str());
    let grade_id = req.params.get("gradeId").and_then(|v| v.as_str());
    let (Some(carnet), Some(name), Some(grade_id)) = (carnet, name, grade_id) else {
        return err(
            &req.id,
            "bad_params",
            "students.create needs carnet, name, gradeId",
            None,
        );
    };
    let section = req.params.get("section").and_then(|v| v.as_str());
    let custom_fee = req.params.get("customFee").and_then(|v| v.as_f64());
    let enrolled_on = req.params.get("enrolledOn").and_then(|v| v.as_str());

    let id = Uuid::new_v4().to_string();
    let created_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    match conn.execute(
        "INSERT INTO students(id, carnet, name, grade_id, section, custom_fee, active, enrolled_on, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)",
        rusqlite::params![id, carnet, name, grade_id, section, custom_fee, enrolled_on, created_at],
    ) {
        Ok(_) => ok(&req.id, json!({ "studentId": id })),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_students_update(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(carnet) = req.params.get("carnet").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing params.carnet", None);
    };

    let run = || -> anyhow::Result<Option<()>> {
        let existing = conn
            .query_row(
                "SELECT id, name, grade_id, section, custom_fee, active
                 FROM students WHERE carnet = ?",
                [carnet],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, name, grade_id, section, custom_fee, active)) = existing else {
            return Ok(None);
        };

        let name = req
            .params
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or(name);
        let grade_id = req
            .params
            .get("gradeId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or(grade_id);
        let section = match req.params.get("section") {
            Some(v) => v.as_str().map(str::to_string),
            None => section,
        };
        let custom_fee = match req.params.get("customFee") {
            Some(v) => v.as_f64(),
            None => custom_fee,
        };
        let active = req
            .params
            .get("active")
            .and_then(|v| v.as_bool())
            .map(|b| if b { 1 } else { 0 })
            .unwrap_or(active);

        conn.execute(
            "UPDATE students SET name = ?, grade_id = ?, section = ?, custom_fee = ?, active = ?
             WHERE id = ?",
            rusqlite::params![name, grade_id, section, custom_fee, active, id],
        )?;
        Ok(Some(()))
    };

    match run() {
        Ok(Some(())) => ok(&req.id, json!({ "updated": true })),
        Ok(None) => err(
            &req.id,
            "not_found",
            format!("no student with carnet {}", carnet),
            None,
        ),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_students_deactivate(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(carnet) = req.params.get("carnet").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing params.carnet", None);
    };
    // Students are never deleted; payments keep referencing them.
    match conn.execute("UPDATE students SET active = 0 WHERE carnet = ?", [carnet]) {
        Ok(0) => err(
            &req.id,
            "not_found",
            format!("no student with carnet {}", carnet),
            None,
        ),
        Ok(_) => ok(&req.id, json!({ "deactivated": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_students_list(conn: &Connection, req: &Request) -> serde_json::Value {
    let grade_id = req.params.get("gradeId").and_then(|v| v.as_str());
    let search = req.params.get("search").and_then(|v| v.as_str());
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let run = || -> anyhow::Result<serde_json::Value> {
        let mut sql = String::from(
            "SELECT s.id, s.carnet, s.name, s.grade_id, g.name, s.section, s.custom_fee,
                    g.monthly_fee, s.active
             FROM students s JOIN grades g ON g.id = s.grade_id
             WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if !include_inactive {
            sql.push_str(" AND s.active = 1");
        }
        if let Some(g) = grade_id {
            sql.push_str(" AND s.grade_id = ?");
            args.push(Box::new(g.to_string()));
        }
        if let Some(q) = search {
            if let Ok(carnet) = q.trim().parse::<i64>() {
                sql.push_str(" AND s.carnet = ?");
                args.push(Box::new(carnet));
            } else {
                sql.push_str(" AND s.name LIKE ?");
                args.push(Box::new(format!("%{}%", q.trim())));
            }
        }
        sql.push_str(" ORDER BY s.name");

        let mut stmt = conn.prepare(&sql)?;
        let students = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                let custom_fee: Option<f64> = row.get(6)?;
                let grade_fee: f64 = row.get(7)?;
                Ok(json!({
                    "studentId": row.get::<_, String>(0)?,
                    "carnet": row.get::<_, i64>(1)?,
                    "name": row.get::<_, String>(2)?,
                    "gradeId": row.get::<_, String>(3)?,
                    "gradeName": row.get::<_, String>(4)?,
                    "section": row.get::<_, Option<String>>(5)?,
                    "customFee": custom_fee,
                    // Fee that applies: the override when present, else the tier fee.
                    "applicableFee": custom_fee.unwrap_or(grade_fee),
                    "active": row.get::<_, i64>(8)? != 0,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(json!({ "students": students }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_get(conn: &Connection, req: &Request) -> serde_json::Value {
    let Some(carnet) = req.params.get("carnet").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing params.carnet", None);
    };

    let run = || -> anyhow::Result<Option<serde_json::Value>> {
        let student = conn
            .query_row(
                "SELECT s.id, s.carnet, s.name, s.grade_id, g.name, s.section,
                        s.custom_fee, g.monthly_fee, s.active, s.enrolled_on
                 FROM students s JOIN grades g ON g.id = s.grade_id
                 WHERE s.carnet = ?",
                [carnet],
                |row| {
                    let custom_fee: Option<f64> = row.get(6)?;
                    let grade_fee: f64 = row.get(7)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        json!({
                            "carnet": row.get::<_, i64>(1)?,
                            "name": row.get::<_, String>(2)?,
                            "gradeId": row.get::<_, String>(3)?,
                            "gradeName": row.get::<_, String>(4)?,
                            "section": row.get::<_, Option<String>>(5)?,
                            "customFee": custom_fee,
                            "applicableFee": custom_fee.unwrap_or(grade_fee),
                            "active": row.get::<_, i64>(8)? != 0,
                            "enrolledOn": row.get::<_, Option<String>>(9)?,
                        }),
                    ))
                },
            )
            .optional()?;
        let Some((student_id, mut student_json)) = student else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT month, year, total_paid, paid_on, receipt_no, processed_at
             FROM payments WHERE student_id = ?
             ORDER BY processed_at DESC LIMIT 12",
        )?;
        let payments = stmt
            .query_map([&student_id], |row| {
                let month: String = row.get(0)?;
                Ok(json!({
                    "month": month.clone(),
                    "monthDisplay": months::to_spanish(&month),
                    "year": row.get::<_, i32>(1)?,
                    "total": row.get::<_, f64>(2)?,
                    "paidOn": row.get::<_, Option<String>>(3)?,
                    "receiptNo": row.get::<_, Option<String>>(4)?,
                    "processedAt": row.get::<_, String>(5)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        student_json["recentPayments"] = json!(payments);
        Ok(Some(student_json))
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

pub fn try_handle(
    state: &mut crate::ipc::AppState,
    req: &Request,
) -> Option<serde_json::Value> {
    let methods = [
        "grades.create",
        "grades.list",
        "students.create",
        "students.update",
        "students.deactivate",
        "students.list",
        "students.get",
    ];
    if !methods.contains(&req.method.as_str()) {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    Some(match req.method.as_str() {
        "grades.create" => handle_grades_create(conn, req),
        "grades.list" => handle_grades_list(conn, req),
        "students.create" => handle_students_create(conn, req),
        "students.update" => handle_students_update(conn, req),
        "students.deactivate" => handle_students_deactivate(conn, req),
        "students.list" => handle_students_list(conn, req),
        _ => handle_students_get(conn, req),
    })
}
