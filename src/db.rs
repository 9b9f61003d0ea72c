use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "colegio.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            level TEXT NOT NULL,
            monthly_fee REAL NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            carnet INTEGER NOT NULL UNIQUE,
            name TEXT NOT NULL,
            grade_id TEXT NOT NULL,
            section TEXT,
            custom_fee REAL,
            active INTEGER NOT NULL DEFAULT 1,
            enrolled_on TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(grade_id) REFERENCES grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_grade ON students(grade_id)",
        [],
    )?;

    // month holds the canonical (English) month name; the UNIQUE triple below
    // is the duplicate-payment invariant.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            month TEXT NOT NULL,
            year INTEGER NOT NULL,
            paid_on TEXT,
            receipt_no TEXT,
            enrollment_fee REAL NOT NULL DEFAULT 0,
            tuition REAL NOT NULL DEFAULT 0,
            supplies REAL NOT NULL DEFAULT 0,
            transport REAL NOT NULL DEFAULT 0,
            exams REAL NOT NULL DEFAULT 0,
            bonus REAL NOT NULL DEFAULT 0,
            insurance REAL NOT NULL DEFAULT 0,
            courses REAL NOT NULL DEFAULT 0,
            other REAL NOT NULL DEFAULT 0,
            late_fee REAL NOT NULL DEFAULT 0,
            total_paid REAL NOT NULL,
            cash REAL NOT NULL DEFAULT 0,
            own_checks REAL NOT NULL DEFAULT 0,
            local_checks REAL NOT NULL DEFAULT 0,
            paying_agency TEXT,
            processed_at TEXT NOT NULL,
            processed_by TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, month, year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_student ON payments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_period ON payments(month, year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS upload_batches(
            id TEXT PRIMARY KEY,
            file_name TEXT NOT NULL,
            file_sha256 TEXT NOT NULL,
            uploaded_by TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            rows_total INTEGER NOT NULL DEFAULT 0,
            rows_ok INTEGER NOT NULL DEFAULT 0,
            rows_failed INTEGER NOT NULL DEFAULT 0,
            summary TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS row_errors(
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            row_num INTEGER NOT NULL,
            carnet INTEGER,
            message TEXT NOT NULL,
            row_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(batch_id) REFERENCES upload_batches(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_row_errors_batch ON row_errors(batch_id)",
        [],
    )?;

    Ok(conn)
}

pub struct StudentRef {
    pub id: String,
    pub name: String,
}

/// Active-roster lookup by carnet. Deactivated students do not match; their
/// historical payments stay valid regardless.
pub fn find_active_student(conn: &Connection, carnet: i64) -> anyhow::Result<Option<StudentRef>> {
    let found = conn
        .query_row(
            "SELECT id, name FROM students WHERE carnet = ? AND active = 1",
            [carnet],
            |row| {
                Ok(StudentRef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(found)
}

pub fn payment_exists(
    conn: &Connection,
    student_id: &str,
    month: &str,
    year: i32,
) -> anyhow::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM payments WHERE student_id = ? AND month = ? AND year = ?",
            rusqlite::params![student_id, month, year],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
