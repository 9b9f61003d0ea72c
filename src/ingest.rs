use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use chrono::Local;
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::bank_file::{self, BankRow, CellValue};
use crate::db;
use crate::months;

/// Error detail returned to the caller is capped; everything past the cap is
/// still counted and persisted in row_errors.
const ERROR_DETAIL_CAP: usize = 100;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub row: usize,
    pub identifier: String,
    pub name: String,
    pub error_message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPayment {
    pub identifier: i64,
    pub name: String,
    /// Canonical month name.
    pub month: String,
    pub year: i32,
    pub total: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowWarning {
    pub row: usize,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub batch_id: String,
    pub file_name: String,
    pub total_rows: usize,
    pub processed: usize,
    pub successes: usize,
    pub failures: usize,
    pub duplicates: usize,
    pub error_details: Vec<ErrorDetail>,
    pub new_payments: Vec<NewPayment>,
    pub warnings: Vec<RowWarning>,
}

#[derive(Debug)]
enum RowFailure {
    InvalidIdentifier(String),
    MissingPeriod,
    InvalidAmount(String),
    StudentNotFound(i64),
    Duplicate { month: String, year: i32 },
}

impl RowFailure {
    fn message(&self) -> String {
        match self {
            RowFailure::InvalidIdentifier(v) => format!("invalid carnet: '{}'", v),
            RowFailure::MissingPeriod => "payment month is required".to_string(),
            RowFailure::InvalidAmount(v) => format!("invalid total: '{}'", v),
            RowFailure::StudentNotFound(c) => {
                format!("no active student with carnet {}", c)
            }
            RowFailure::Duplicate { month, year } => format!(
                "payment already recorded for {} {}",
                months::to_spanish(month),
                year
            ),
        }
    }

    fn is_duplicate(&self) -> bool {
        matches!(self, RowFailure::Duplicate { .. })
    }
}

enum RowOutcome {
    Recorded {
        payment: NewPayment,
        period_guessed: bool,
        raw_period: String,
    },
    Failed(RowFailure),
}

/// Run one bank file through the full pipeline inside a single transaction.
///
/// Row failures never abort the batch: each one is counted, persisted as a
/// row_errors record and reported in the outcome. A file that cannot be read
/// at all, a header missing required columns, or a failing commit are
/// batch-fatal and surface as `Err` with nothing persisted.
pub fn import_bank_file(
    conn: &Connection,
    path: &Path,
    submitted_by: &str,
) -> anyhow::Result<ImportOutcome> {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("upload")
        .to_string();

    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
    let file_sha256 = hex_digest(&bytes);

    let rows = bank_file::read_bank_file(path)?;
    if rows.is_empty() {
        bail!("file has no data rows");
    }

    let mut warnings: Vec<RowWarning> = Vec::new();
    let prior: i64 = conn.query_row(
        "SELECT COUNT(*) FROM upload_batches WHERE file_sha256 = ?",
        [&file_sha256],
        |r| r.get(0),
    )?;
    if prior > 0 {
        warnings.push(RowWarning {
            row: 0,
            message: format!(
                "an identical file was already imported {} time(s); rows will be \
                 reported as duplicates if the payments exist",
                prior
            ),
        });
    }

    let now = Local::now();
    let today = now.format("%Y-%m-%d").to_string();
    let stamp = now.format("%Y-%m-%d %H:%M:%S").to_string();

    let batch_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO upload_batches(id, file_name, file_sha256, uploaded_by, uploaded_at, rows_total)
         VALUES(?, ?, ?, ?, ?, ?)",
        rusqlite::params![batch_id, file_name, file_sha256, submitted_by, stamp, rows.len() as i64],
    )?;

    let mut processed = 0usize;
    let mut successes = 0usize;
    let mut failures = 0usize;
    let mut duplicates = 0usize;
    let mut error_details: Vec<ErrorDetail> = Vec::new();
    let mut new_payments: Vec<NewPayment> = Vec::new();

    for row in &rows {
        processed += 1;
        match ingest_row(&tx, row, submitted_by, &today, &stamp)? {
            RowOutcome::Recorded {
                payment,
                period_guessed,
                raw_period,
            } => {
                successes += 1;
                if period_guessed {
                    warnings.push(RowWarning {
                        row: row.row_num,
                        message: format!(
                            "could not parse payment month '{}'; recorded against the \
                             current month instead",
                            raw_period
                        ),
                    });
                }
                new_payments.push(payment);
            }
            RowOutcome::Failed(failure) => {
                failures += 1;
                if failure.is_duplicate() {
                    duplicates += 1;
                }
                let message = failure.message();
                record_row_error(&tx, &batch_id, row, &message, &stamp)?;
                if error_details.len() < ERROR_DETAIL_CAP {
                    error_details.push(ErrorDetail {
                        row: row.row_num,
                        identifier: row.cell("CARNET").display(),
                        name: row.cell("NOMBRE").display(),
                        error_message: message,
                    });
                }
            }
        }
    }

    let summary = format!(
        "Processed: {}, ok: {}, failed: {}, duplicates: {}",
        processed, successes, failures, duplicates
    );
    tx.execute(
        "UPDATE upload_batches SET rows_ok = ?, rows_failed = ?, summary = ? WHERE id = ?",
        rusqlite::params![successes as i64, failures as i64, summary, batch_id],
    )?;

    tx.commit().context("batch commit failed; nothing was recorded")?;

    Ok(ImportOutcome {
        batch_id,
        file_name,
        total_rows: rows.len(),
        processed,
        successes,
        failures,
        duplicates,
        error_details,
        new_payments,
        warnings,
    })
}

fn ingest_row(
    conn: &Connection,
    row: &BankRow,
    submitted_by: &str,
    today: &str,
    stamp: &str,
) -> anyhow::Result<RowOutcome> {
    let carnet_cell = row.cell("CARNET");
    let Some(carnet) = coerce_carnet(carnet_cell) else {
        return Ok(RowOutcome::Failed(RowFailure::InvalidIdentifier(
            carnet_cell.display(),
        )));
    };

    let period_cell = row.cell("MES PAGO");
    if period_cell.is_blank() {
        return Ok(RowOutcome::Failed(RowFailure::MissingPeriod));
    }

    let total_cell = row.cell("TOTAL");
    let Some(total) = coerce_total(total_cell) else {
        return Ok(RowOutcome::Failed(RowFailure::InvalidAmount(
            total_cell.display(),
        )));
    };

    let Some(student) = db::find_active_student(conn, carnet)? else {
        return Ok(RowOutcome::Failed(RowFailure::StudentNotFound(carnet)));
    };

    let period = months::resolve_period(period_cell);
    if db::payment_exists(conn, &student.id, &period.month, period.year)? {
        return Ok(RowOutcome::Failed(RowFailure::Duplicate {
            month: period.month,
            year: period.year,
        }));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO payments(
            id, student_id, month, year, paid_on, receipt_no,
            enrollment_fee, tuition, supplies, transport, exams,
            bonus, insurance, courses, other, late_fee,
            total_paid, cash, own_checks, local_checks, paying_agency,
            processed_at, processed_by
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            student.id,
            period.month,
            period.year,
            today,
            coerce_text(row.cell("BOLETA")),
            coerce_money(row.cell("INSCRIP.")),
            coerce_money(row.cell("CUOTA")),
            coerce_money(row.cell("UTILES")),
            coerce_money(row.cell("BUS")),
            coerce_money(row.cell("EXAMENES")),
            coerce_money(row.cell("BONO")),
            coerce_money(row.cell("SEGURO")),
            coerce_money(row.cell("CURSOS")),
            coerce_money(row.cell("OTROS")),
            coerce_money(row.cell("MORA")),
            total,
            coerce_money(row.cell("EFECTIVO")),
            coerce_money(row.cell("CH.PROPIOS")),
            coerce_money(row.cell("CH.LOCALES")),
            coerce_text(row.cell("AGENCIA PAGO")),
            stamp,
            submitted_by,
        ],
    )?;

    Ok(RowOutcome::Recorded {
        payment: NewPayment {
            identifier: carnet,
            name: student.name,
            month: period.month.clone(),
            year: period.year,
            total,
        },
        period_guessed: period.guessed,
        raw_period: period_cell.display(),
    })
}

fn record_row_error(
    conn: &Connection,
    batch_id: &str,
    row: &BankRow,
    message: &str,
    stamp: &str,
) -> anyhow::Result<()> {
    // Snapshot keys sorted so audit records diff cleanly.
    let snapshot: BTreeMap<&str, serde_json::Value> = row
        .cells
        .iter()
        .map(|(k, v)| (k.as_str(), v.to_json()))
        .collect();
    let row_json = serde_json::to_string(&snapshot)?;

    conn.execute(
        "INSERT INTO row_errors(id, batch_id, row_num, carnet, message, row_json, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            batch_id,
            row.row_num as i64,
            coerce_carnet(row.cell("CARNET")),
            message,
            row_json,
            stamp,
        ],
    )?;
    Ok(())
}

/// Carnet as the bank writes it: an integer, sometimes mangled by the
/// spreadsheet into "1023.0". Zero and non-numeric are both invalid.
fn coerce_carnet(v: &CellValue) -> Option<i64> {
    let n = match v {
        CellValue::Number(n) => *n,
        CellValue::Text(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    let c = n.trunc() as i64;
    if c > 0 {
        Some(c)
    } else {
        None
    }
}

/// TOTAL is strict: a blank counts as zero, anything non-numeric fails the
/// row. This is the one amount the bank always supplies.
fn coerce_total(v: &CellValue) -> Option<f64> {
    match v {
        CellValue::Empty => Some(0.0),
        CellValue::Number(n) => Some(*n),
        CellValue::Text(s) => {
            let t = s.trim();
            if t.is_empty() {
                Some(0.0)
            } else {
                t.parse::<f64>().ok()
            }
        }
        CellValue::Date(_) => None,
    }
}

/// Optional fee components are lenient: strip thousands separators and the
/// quetzal symbol, and coerce anything unparseable to zero rather than
/// failing the row.
fn coerce_money(v: &CellValue) -> f64 {
    match v {
        CellValue::Number(n) => *n,
        CellValue::Text(s) => {
            let cleaned = s.replace(',', "").replace('Q', "");
            cleaned.trim().parse::<f64>().unwrap_or(0.0)
        }
        _ => 0.0,
    }
}

fn coerce_text(v: &CellValue) -> String {
    v.display().trim().to_string()
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn seeded_db(workspace: &Path) -> Connection {
        let conn = db::open_db(workspace).expect("open db");
        conn.execute(
            "INSERT INTO grades(id, name, level, monthly_fee, active, created_at)
             VALUES('g1', 'Primero Primaria', 'primaria', 350.0, 1, '2025-01-01')",
            [],
        )
        .expect("insert grade");
        conn.execute(
            "INSERT INTO students(id, carnet, name, grade_id, active, created_at)
             VALUES('s1', 1023, 'Ana Lopez', 'g1', 1, '2025-01-01'),
                   ('s2', 1024, 'Luis Paz', 'g1', 1, '2025-01-01'),
                   ('s3', 1025, 'Mario Diaz', 'g1', 0, '2025-01-01')",
            [],
        )
        .expect("insert students");
        conn
    }

    fn write_tsv(dir: &Path, body: &str) -> PathBuf {
        let p = dir.join("banco.xls");
        std::fs::write(&p, body).expect("write tsv");
        p
    }

    #[test]
    fn valid_row_records_one_payment() {
        let ws = temp_dir("colegiod-ingest-ok");
        let conn = seeded_db(&ws);
        let file = write_tsv(
            &ws,
            "CARNET\tNOMBRE\tMES PAGO\tTOTAL\n1023\tAna Lopez\t08/2025\t350.00\n",
        );

        let out = import_bank_file(&conn, &file, "user-1").expect("import");
        assert_eq!(out.total_rows, 1);
        assert_eq!(out.processed, 1);
        assert_eq!(out.successes, 1);
        assert_eq!(out.failures, 0);
        assert_eq!(out.duplicates, 0);

        let p = &out.new_payments[0];
        assert_eq!(p.identifier, 1023);
        assert_eq!(p.name, "Ana Lopez");
        assert_eq!(p.month, "August");
        assert_eq!(p.year, 2025);
        assert_eq!(p.total, 350.0);

        let (month, year, total, by): (String, i32, f64, String) = conn
            .query_row(
                "SELECT month, year, total_paid, processed_by FROM payments WHERE student_id = 's1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .expect("payment row");
        assert_eq!((month.as_str(), year, total, by.as_str()), ("August", 2025, 350.0, "user-1"));
    }

    #[test]
    fn same_row_twice_in_one_batch_reports_duplicate() {
        let ws = temp_dir("colegiod-ingest-dup");
        let conn = seeded_db(&ws);
        let file = write_tsv(
            &ws,
            "CARNET\tNOMBRE\tMES PAGO\tTOTAL\n\
             1023\tAna Lopez\t08/2025\t350.00\n\
             1023\tAna Lopez\t08/2025\t350.00\n",
        );

        let out = import_bank_file(&conn, &file, "user-1").expect("import");
        assert_eq!(out.successes, 1);
        assert_eq!(out.failures, 1);
        assert_eq!(out.duplicates, 1);
        assert_eq!(out.processed, out.successes + out.failures);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM payments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1, "only one payment may persist");

        // Duplicate message carries the display-locale month.
        assert!(out.error_details[0].error_message.contains("Agosto 2025"));
    }

    #[test]
    fn row_failures_are_recovered_and_audited() {
        let ws = temp_dir("colegiod-ingest-errors");
        let conn = seeded_db(&ws);
        let file = write_tsv(
            &ws,
            "CARNET\tNOMBRE\tMES PAGO\tTOTAL\n\
             abc\tNadie\t08/2025\t100\n\
             9999\tFantasma\t08/2025\t100\n\
             1025\tMario Diaz\t08/2025\t100\n\
             1024\tLuis Paz\t08/2025\tmucho\n\
             1023\tAna Lopez\t08/2025\t350.00\n",
        );

        let out = import_bank_file(&conn, &file, "user-1").expect("import");
        assert_eq!(out.processed, 5);
        assert_eq!(out.successes, 1);
        assert_eq!(out.failures, 4);
        assert_eq!(out.duplicates, 0);

        // Deactivated student behaves like an unknown carnet.
        let msgs: Vec<String> = out
            .error_details
            .iter()
            .map(|d| d.error_message.clone())
            .collect();
        assert!(msgs.iter().any(|m| m.contains("invalid carnet")));
        assert!(msgs.iter().any(|m| m.contains("carnet 9999")));
        assert!(msgs.iter().any(|m| m.contains("carnet 1025")));
        assert!(msgs.iter().any(|m| m.contains("invalid total")));

        let audited: i64 = conn
            .query_row("SELECT COUNT(*) FROM row_errors", [], |r| r.get(0))
            .unwrap();
        assert_eq!(audited, 4);

        // Batch counters match the attempted rows.
        let (total, ok, failed): (i64, i64, i64) = conn
            .query_row(
                "SELECT rows_total, rows_ok, rows_failed FROM upload_batches",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!((total, ok, failed), (5, 1, 4));
    }

    #[test]
    fn unparseable_month_is_recorded_with_a_warning() {
        let ws = temp_dir("colegiod-ingest-guess");
        let conn = seeded_db(&ws);
        let file = write_tsv(
            &ws,
            "CARNET\tNOMBRE\tMES PAGO\tTOTAL\n1023\tAna Lopez\tpendiente\t350.00\n",
        );

        let out = import_bank_file(&conn, &file, "user-1").expect("import");
        assert_eq!(out.successes, 1);
        assert!(out
            .warnings
            .iter()
            .any(|w| w.row == 2 && w.message.contains("pendiente")));
    }

    #[test]
    fn missing_required_column_is_batch_fatal() {
        let ws = temp_dir("colegiod-ingest-fatal");
        let conn = seeded_db(&ws);
        let file = write_tsv(&ws, "CARNET\tNOMBRE\tMES PAGO\n1023\tAna\t08/2025\n");

        let err = import_bank_file(&conn, &file, "user-1").unwrap_err();
        assert!(err.to_string().contains("TOTAL"));

        // Nothing persisted on batch-level failure.
        let batches: i64 = conn
            .query_row("SELECT COUNT(*) FROM upload_batches", [], |r| r.get(0))
            .unwrap();
        assert_eq!(batches, 0);
    }

    #[test]
    fn optional_components_use_lenient_money_coercion() {
        let ws = temp_dir("colegiod-ingest-money");
        let conn = seeded_db(&ws);
        let file = write_tsv(
            &ws,
            "CARNET\tNOMBRE\tMES PAGO\tTOTAL\tCUOTA\tMORA\tAGENCIA PAGO\n\
             1023\tAna Lopez\t08/2025\t350.00\tQ1,250.00\tn/a\tAgencia Central\n",
        );

        let out = import_bank_file(&conn, &file, "user-1").expect("import");
        assert_eq!(out.successes, 1);

        let (tuition, late_fee, agency): (f64, f64, String) = conn
            .query_row(
                "SELECT tuition, late_fee, paying_agency FROM payments",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(tuition, 1250.0);
        assert_eq!(late_fee, 0.0, "unparseable money coerces to zero");
        assert_eq!(agency, "Agencia Central");
    }

    #[test]
    fn reimporting_the_same_file_flags_duplicates_and_file_reuse() {
        let ws = temp_dir("colegiod-ingest-refile");
        let conn = seeded_db(&ws);
        let file = write_tsv(
            &ws,
            "CARNET\tNOMBRE\tMES PAGO\tTOTAL\n1023\tAna Lopez\t08/2025\t350.00\n",
        );

        let first = import_bank_file(&conn, &file, "user-1").expect("first import");
        assert_eq!(first.successes, 1);

        let second = import_bank_file(&conn, &file, "user-1").expect("second import");
        assert_eq!(second.successes, 0);
        assert_eq!(second.duplicates, 1);
        assert!(second.warnings.iter().any(|w| w.row == 0));
    }
}
