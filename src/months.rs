use chrono::{Datelike, Local};

use crate::bank_file::CellValue;

/// Canonical month names, as stored in the database.
pub const MONTHS_EN: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Display names shown to end users.
pub const MONTHS_ES: [&str; 12] = [
    "Enero",
    "Febrero",
    "Marzo",
    "Abril",
    "Mayo",
    "Junio",
    "Julio",
    "Agosto",
    "Septiembre",
    "Octubre",
    "Noviembre",
    "Diciembre",
];

/// 1-12 for a month name in either locale, 0 if unrecognized.
/// English three-letter abbreviations are accepted because the bank
/// occasionally emits them ("Aug 2025").
pub fn month_number(name: &str) -> u32 {
    let t = name.trim();
    for (i, (en, es)) in MONTHS_EN.iter().zip(MONTHS_ES.iter()).enumerate() {
        if t.eq_ignore_ascii_case(en) || t.eq_ignore_ascii_case(es) {
            return (i + 1) as u32;
        }
    }
    if t.len() == 3 {
        for (i, en) in MONTHS_EN.iter().enumerate() {
            if t.eq_ignore_ascii_case(&en[..3]) {
                return (i + 1) as u32;
            }
        }
    }
    0
}

/// Canonical name for 1-12, empty string otherwise.
pub fn month_name_en(n: u32) -> &'static str {
    if (1..=12).contains(&n) {
        MONTHS_EN[(n - 1) as usize]
    } else {
        ""
    }
}

/// Display name for 1-12, empty string otherwise.
pub fn month_name_es(n: u32) -> &'static str {
    if (1..=12).contains(&n) {
        MONTHS_ES[(n - 1) as usize]
    } else {
        ""
    }
}

/// Canonical -> display. Unknown names pass through unchanged.
pub fn to_spanish(month: &str) -> String {
    let n = month_number(month);
    if n == 0 {
        month.to_string()
    } else {
        month_name_es(n).to_string()
    }
}

/// Display -> canonical. Unknown names pass through unchanged.
pub fn to_english(month: &str) -> String {
    let n = month_number(month);
    if n == 0 {
        month.to_string()
    } else {
        month_name_en(n).to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPeriod {
    /// Canonical month name.
    pub month: String,
    pub year: i32,
    /// True when nothing in the raw value could be interpreted and the
    /// current calendar month was substituted. The ingestion engine turns
    /// this into a per-row warning so the substitution stays visible.
    pub guessed: bool,
}

fn current_period() -> ResolvedPeriod {
    let now = Local::now();
    ResolvedPeriod {
        month: month_name_en(now.month()).to_string(),
        year: now.year(),
        guessed: true,
    }
}

fn resolved(month: String, year: i32) -> ResolvedPeriod {
    ResolvedPeriod {
        month,
        year,
        guessed: false,
    }
}

/// Resolve a raw "MES PAGO" cell into a (canonical month, year) pair.
///
/// The bank is inconsistent: the cell may arrive as a real spreadsheet date,
/// as "08/2025", as "Agosto 2025" / "Aug 2025", or as junk. Rules are tried
/// in that order; first match wins. Junk falls back to the current month,
/// flagged via `guessed`.
pub fn resolve_period(raw: &CellValue) -> ResolvedPeriod {
    if let CellValue::Date(dt) = raw {
        return resolved(month_name_en(dt.month()).to_string(), dt.year());
    }

    let text = raw.display().trim().to_string();
    if text.is_empty() {
        return current_period();
    }

    // Spreadsheet date serialized as text: "2025-08-01 00:00:00" or "2025-08-01".
    if text.contains('-') && (text.contains("00:00:00") || text.len() == 10) {
        let date_part = text.split_whitespace().next().unwrap_or("");
        if let Ok(d) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
            return resolved(month_name_en(d.month()).to_string(), d.year());
        }
    }

    // Bank's usual encoding: "08/2025".
    if text.contains('/') {
        let parts: Vec<&str> = text.split('/').collect();
        if parts.len() == 2 {
            if let (Ok(m), Ok(y)) = (
                parts[0].trim().parse::<u32>(),
                parts[1].trim().parse::<i32>(),
            ) {
                if (1..=12).contains(&m) {
                    return resolved(month_name_en(m).to_string(), y);
                }
            }
        }
    }

    // "Agosto 2025", "Aug 2025". An unrecognized month name passes through
    // so the duplicate check still keys on whatever the bank wrote.
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.len() >= 2 {
        if let Ok(y) = parts[1].parse::<i32>() {
            let n = month_number(parts[0]);
            let month = if n == 0 {
                title_case(parts[0])
            } else {
                month_name_en(n).to_string()
            };
            return resolved(month, y);
        }
    }

    current_period()
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn number_name_roundtrip_both_locales() {
        for n in 1..=12u32 {
            assert_eq!(month_number(month_name_en(n)), n);
            assert_eq!(month_number(month_name_es(n)), n);
        }
        assert_eq!(month_number("Brumaire"), 0);
        assert_eq!(month_name_es(0), "");
        assert_eq!(month_name_es(13), "");
    }

    #[test]
    fn display_canonical_roundtrip() {
        for es in MONTHS_ES {
            assert_eq!(to_spanish(&to_english(es)), es);
        }
        assert_eq!(to_spanish("August"), "Agosto");
        assert_eq!(to_english("Agosto"), "August");
    }

    #[test]
    fn slash_pair_resolves() {
        let p = resolve_period(&CellValue::Text("08/2025".into()));
        assert_eq!(p, resolved("August".into(), 2025));
    }

    #[test]
    fn serialized_timestamp_takes_date_branch() {
        let p = resolve_period(&CellValue::Text("2025-08-01 00:00:00".into()));
        assert_eq!(p.month, "August");
        assert_eq!(p.year, 2025);
        assert!(!p.guessed);
    }

    #[test]
    fn date_only_shape_resolves() {
        let p = resolve_period(&CellValue::Text("2025-11-03".into()));
        assert_eq!(p.month, "November");
        assert_eq!(p.year, 2025);
    }

    #[test]
    fn native_date_cell_resolves() {
        let dt = NaiveDate::from_ymd_opt(2024, 2, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let p = resolve_period(&CellValue::Date(dt));
        assert_eq!(p, resolved("February".into(), 2024));
    }

    #[test]
    fn month_name_with_year_resolves() {
        assert_eq!(
            resolve_period(&CellValue::Text("Agosto 2025".into())),
            resolved("August".into(), 2025)
        );
        assert_eq!(
            resolve_period(&CellValue::Text("aug 2025".into())),
            resolved("August".into(), 2025)
        );
    }

    #[test]
    fn junk_falls_back_to_current_month_and_is_flagged() {
        let p = resolve_period(&CellValue::Text("n/a".into()));
        assert!(p.guessed);
        assert_ne!(p.month, "");

        let q = resolve_period(&CellValue::Empty);
        assert!(q.guessed);
    }

    #[test]
    fn out_of_range_slash_month_is_not_silently_accepted() {
        // "13/2025" matches no rule; it ends in the observable fallback.
        let p = resolve_period(&CellValue::Text("13/2025".into()));
        assert!(p.guessed);
    }
}
