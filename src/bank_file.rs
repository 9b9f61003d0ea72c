use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context};
use calamine::{open_workbook, Data, Range, Reader, Xls, Xlsx};
use chrono::NaiveDateTime;

/// Semantic columns that must be present in the header row.
pub const REQUIRED_COLUMNS: [&str; 4] = ["CARNET", "NOMBRE", "MES PAGO", "TOTAL"];

/// Semantic columns filled with a default when absent. Text columns default
/// to "", numeric ones to 0.
pub const OPTIONAL_COLUMNS: [&str; 15] = [
    "BOLETA",
    "INSCRIP.",
    "CUOTA",
    "UTILES",
    "BUS",
    "EXAMENES",
    "BONO",
    "SEGURO",
    "CURSOS",
    "OTROS",
    "MORA",
    "EFECTIVO",
    "CH.PROPIOS",
    "CH.LOCALES",
    "AGENCIA PAGO",
];

const TEXT_COLUMNS: [&str; 2] = ["BOLETA", "AGENCIA PAGO"];

/// One spreadsheet cell with the source's typing erased down to what the
/// ingestion engine actually needs to distinguish.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Date(NaiveDateTime),
    Empty,
}

impl CellValue {
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Plain-text rendition, used for header comparison, error messages and
    /// lenient field coercion. Whole numbers print without a fraction so an
    /// Excel-mangled carnet ("1023.0") still reads naturally.
    pub fn display(&self) -> String {
        match self {
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            CellValue::Date(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            CellValue::Empty => String::new(),
        }
    }

    /// Serializable snapshot value for the row-error audit trail. Dates are
    /// stringified to a fixed format so the snapshot survives JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CellValue::Text(s) => serde_json::Value::String(s.clone()),
            CellValue::Number(n) => serde_json::json!(n),
            CellValue::Date(dt) => {
                serde_json::Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string())
            }
            CellValue::Empty => serde_json::Value::Null,
        }
    }
}

/// One data row, keyed by semantic column name, with its 1-based source row
/// number for error reporting.
#[derive(Debug, Clone)]
pub struct BankRow {
    pub row_num: usize,
    pub cells: HashMap<String, CellValue>,
}

impl BankRow {
    pub fn cell(&self, key: &str) -> &CellValue {
        self.cells.get(key).unwrap_or(&CellValue::Empty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// OLE/BIFF binary workbook (.xls).
    LegacyBinary,
    /// Zip-packaged workbook (.xlsx).
    ZippedWorkbook,
    /// Tab-delimited text, usually mislabeled with an .xls extension.
    TabText,
}

/// Decide how to read the file. The bank reuses the .xls extension for plain
/// tab-delimited exports, so the extension is only trusted for .xlsx; for
/// everything else the leading bytes decide.
pub fn detect_format(path: &Path) -> anyhow::Result<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if ext == "xlsx" {
        return Ok(FileFormat::ZippedWorkbook);
    }

    let mut f = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    let mut sig = [0u8; 8];
    let n = f.read(&mut sig).context("failed to read file signature")?;
    if n >= 4 && sig[..4] == [0xD0, 0xCF, 0x11, 0xE0] {
        return Ok(FileFormat::LegacyBinary);
    }
    if n >= 2 && sig[..2] == [0x09, 0x08] {
        return Ok(FileFormat::LegacyBinary);
    }
    Ok(FileFormat::TabText)
}

/// Read a bank export into uniform rows. Any parse failure here is
/// batch-fatal; per-row problems are the ingestion engine's business.
pub fn read_bank_file(path: &Path) -> anyhow::Result<Vec<BankRow>> {
    match detect_format(path)? {
        FileFormat::LegacyBinary => {
            let mut wb: Xls<_> = open_workbook(path)
                .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
            let range = match wb.worksheet_range_at(0) {
                Some(Ok(r)) => r,
                Some(Err(e)) => return Err(e).context("failed to read first worksheet"),
                None => bail!("workbook has no worksheets"),
            };
            rows_from_range(&range)
        }
        FileFormat::ZippedWorkbook => {
            let mut wb: Xlsx<_> = open_workbook(path)
                .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
            let range = match wb.worksheet_range_at(0) {
                Some(Ok(r)) => r,
                Some(Err(e)) => return Err(e).context("failed to read first worksheet"),
                None => bail!("workbook has no worksheets"),
            };
            rows_from_range(&range)
        }
        FileFormat::TabText => read_tab_text(path),
    }
}

fn rows_from_range(range: &Range<Data>) -> anyhow::Result<Vec<BankRow>> {
    let mut rows = range.rows();
    let header_cells: Vec<CellValue> = match rows.next() {
        Some(r) => r.iter().map(cell_from_data).collect(),
        None => bail!("file is empty (no header row)"),
    };
    let headers = normalize_headers(&header_cells);
    let required = map_required_columns(&headers)?;

    let mut out: Vec<BankRow> = Vec::new();
    for (i, raw) in rows.enumerate() {
        let cells: Vec<CellValue> = raw.iter().map(cell_from_data).collect();
        if cells.iter().all(|c| c.is_blank()) {
            continue;
        }
        // Header is row 1, so the first data row is 2.
        out.push(build_row(&cells, &headers, &required, i + 2));
    }
    Ok(out)
}

fn read_tab_text(path: &Path) -> anyhow::Result<Vec<BankRow>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut records = reader.records();
    let header_record = match records.next() {
        Some(r) => r.context("failed to read header line")?,
        None => bail!("file is empty (no header row)"),
    };
    let header_cells: Vec<CellValue> = header_record
        .iter()
        .map(|s| CellValue::Text(s.to_string()))
        .collect();
    let headers = normalize_headers(&header_cells);
    let required = map_required_columns(&headers)?;

    let mut out: Vec<BankRow> = Vec::new();
    for (i, rec) in records.enumerate() {
        let rec = rec.with_context(|| format!("bad tab-delimited line {}", i + 2))?;
        let cells: Vec<CellValue> = rec
            .iter()
            .map(|s| {
                if s.trim().is_empty() {
                    CellValue::Empty
                } else {
                    CellValue::Text(s.to_string())
                }
            })
            .collect();
        if cells.iter().all(|c| c.is_blank()) {
            continue;
        }
        out.push(build_row(&cells, &headers, &required, i + 2));
    }
    Ok(out)
}

fn cell_from_data(d: &Data) -> CellValue {
    match d {
        Data::Empty => CellValue::Empty,
        Data::String(s) => {
            if s.trim().is_empty() {
                CellValue::Empty
            } else {
                CellValue::Text(s.clone())
            }
        }
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Text(b.to_string()),
        Data::DateTime(t) => match t.as_datetime() {
            Some(dt) => CellValue::Date(dt),
            None => CellValue::Text(t.to_string()),
        },
        Data::DateTimeIso(s) => match NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
            Ok(dt) => CellValue::Date(dt),
            Err(_) => CellValue::Text(s.clone()),
        },
        Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(_) => CellValue::Empty,
    }
}

fn normalize_headers(cells: &[CellValue]) -> Vec<String> {
    cells
        .iter()
        .map(|c| c.display().trim().to_uppercase())
        .collect()
}

/// Locate the required columns by substring containment, first match wins.
/// All missing names are reported together so the user fixes the header once.
/// Substring matching is deliberate (the bank renames headers, e.g.
/// "TOTAL PAGADO") and carries a known ambiguity: a short token can land on
/// an unrelated column that happens to contain it.
fn map_required_columns(headers: &[String]) -> anyhow::Result<HashMap<&'static str, usize>> {
    let mut map: HashMap<&'static str, usize> = HashMap::new();
    let mut missing: Vec<&str> = Vec::new();
    for want in REQUIRED_COLUMNS {
        match headers.iter().position(|h| h.contains(want)) {
            Some(i) => {
                map.insert(want, i);
            }
            None => missing.push(want),
        }
    }
    if !missing.is_empty() {
        bail!("required column(s) not found: {}", missing.join(", "));
    }
    Ok(map)
}

fn build_row(
    cells: &[CellValue],
    headers: &[String],
    required: &HashMap<&'static str, usize>,
    row_num: usize,
) -> BankRow {
    let mut out: HashMap<String, CellValue> = HashMap::new();

    for (name, idx) in required {
        let v = cells.get(*idx).cloned().unwrap_or(CellValue::Empty);
        out.insert((*name).to_string(), v);
    }

    for opt in OPTIONAL_COLUMNS {
        let found = headers
            .iter()
            .position(|h| h.contains(opt))
            .and_then(|i| cells.get(i))
            .cloned();
        let v = match found {
            Some(v) => v,
            None if TEXT_COLUMNS.contains(&opt) => CellValue::Text(String::new()),
            None => CellValue::Number(0.0),
        };
        out.insert(opt.to_string(), v);
    }

    BankRow {
        row_num,
        cells: out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_file(name: &str, bytes: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "colegiod-bankfile-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let p = dir.join(name);
        std::fs::write(&p, bytes).expect("write temp file");
        p
    }

    #[test]
    fn ole_signature_detected_as_legacy_binary() {
        let p = temp_file(
            "banco.xls",
            &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1],
        );
        assert_eq!(detect_format(&p).unwrap(), FileFormat::LegacyBinary);
    }

    #[test]
    fn biff_signature_detected_as_legacy_binary() {
        let p = temp_file("banco.xls", &[0x09, 0x08, 0x10, 0x00]);
        assert_eq!(detect_format(&p).unwrap(), FileFormat::LegacyBinary);
    }

    #[test]
    fn xls_extension_without_signature_is_tab_text() {
        let p = temp_file("banco.xls", b"CARNET\tNOMBRE\n1023\tAna\n");
        assert_eq!(detect_format(&p).unwrap(), FileFormat::TabText);
    }

    #[test]
    fn xlsx_extension_skips_sniffing() {
        // Wrong bytes on purpose: the extension alone selects the zip reader.
        let p = temp_file("banco.xlsx", b"not a zip at all");
        assert_eq!(detect_format(&p).unwrap(), FileFormat::ZippedWorkbook);
    }

    #[test]
    fn tab_text_rows_map_required_and_optional_columns() {
        let body = "CARNET\tNOMBRE ESTUDIANTE\tMES PAGO\tTOTAL PAGADO\tMORA\n\
                    1023\tAna Lopez\t08/2025\t350.00\t25.00\n\
                    \t\t\t\t\n\
                    1024\tLuis Paz\t09/2025\t280.00\t\n";
        let p = temp_file("banco.xls", body.as_bytes());
        let rows = read_bank_file(&p).expect("read tsv");
        assert_eq!(rows.len(), 2, "blank row must be skipped");

        let r = &rows[0];
        assert_eq!(r.row_num, 2);
        assert_eq!(r.cell("CARNET"), &CellValue::Text("1023".into()));
        assert_eq!(r.cell("NOMBRE"), &CellValue::Text("Ana Lopez".into()));
        assert_eq!(r.cell("MES PAGO"), &CellValue::Text("08/2025".into()));
        assert_eq!(r.cell("TOTAL"), &CellValue::Text("350.00".into()));
        assert_eq!(r.cell("MORA"), &CellValue::Text("25.00".into()));
        // Absent optional columns default: text -> "", numeric -> 0.
        assert_eq!(r.cell("AGENCIA PAGO"), &CellValue::Text(String::new()));
        assert_eq!(r.cell("EFECTIVO"), &CellValue::Number(0.0));

        assert_eq!(rows[1].row_num, 4);
    }

    #[test]
    fn missing_required_columns_named_together() {
        let p = temp_file("banco.xls", b"CARNET\tNOMBRE\n1\tAna\n");
        let err = read_bank_file(&p).unwrap_err().to_string();
        assert!(err.contains("MES PAGO"), "{}", err);
        assert!(err.contains("TOTAL"), "{}", err);
        assert!(!err.contains("CARNET"), "{}", err);
    }

    #[test]
    fn header_match_is_case_insensitive_substring() {
        let body = "No. Carnet\tnombre completo\tmes pago\tTotal Q\n1023\tAna\t08/2025\t350\n";
        let p = temp_file("banco.xls", body.as_bytes());
        let rows = read_bank_file(&p).expect("read tsv");
        assert_eq!(rows[0].cell("CARNET"), &CellValue::Text("1023".into()));
        assert_eq!(rows[0].cell("TOTAL"), &CellValue::Text("350".into()));
    }

    #[test]
    fn empty_file_is_a_batch_level_error() {
        let p = temp_file("banco.xls", b"");
        assert!(read_bank_file(&p).is_err());
    }

    #[test]
    fn display_renders_whole_numbers_without_fraction() {
        assert_eq!(CellValue::Number(1023.0).display(), "1023");
        assert_eq!(CellValue::Number(350.5).display(), "350.5");
        assert_eq!(CellValue::Empty.display(), "");
    }
}
