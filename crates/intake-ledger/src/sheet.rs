use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use calamine::{open_workbook_auto, Data, ExcelDateTime, Range, Reader};

use crate::{LedgerError, Result};

/// Number of columns (A..J) spanned by one logical ledger record.
pub const RECORD_WIDTH: u32 = 10;

/// Read access to a ledger worksheet using 1-based row/column indices.
pub trait LedgerSheet {
    fn name(&self) -> &str;

    /// Last row that may hold content, `0` for an empty sheet.
    fn row_count(&self) -> u32;

    /// Plain text of the cell at `(row, col)`, empty for blank or out-of-range cells.
    fn cell_text(&self, row: u32, col: u32) -> Cow<'_, str>;

    /// Whether any of the record columns A..J of `row` holds non-blank text.
    fn row_has_content(&self, row: u32) -> bool {
        (1..=RECORD_WIDTH).any(|col| !self.cell_text(row, col).trim().is_empty())
    }
}

/// Flatten a workbook value to the text the ledger parsers match against.
///
/// Rich text runs and formula cells arrive here already flattened to their
/// text / cached result by the workbook reader.
pub fn cell_text(value: &Data) -> Cow<'_, str> {
    match value {
        Data::Empty => Cow::Borrowed(""),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => Cow::Borrowed(s),
        Data::Int(n) => Cow::Owned(n.to_string()),
        Data::Float(n) => Cow::Owned(format_number(*n)),
        Data::Bool(b) => Cow::Owned(b.to_string()),
        Data::DateTime(dt) => Cow::Owned(format_datetime(dt)),
        Data::Error(err) => Cow::Owned(err.to_string()),
    }
}

/// ISO text for date and duration cells, so a date never reads as a serial number.
fn format_datetime(value: &ExcelDateTime) -> String {
    if value.is_duration() {
        if let Some(duration) = value.as_duration() {
            return format!("PT{}S", duration.num_seconds());
        }
    } else if let Some(datetime) = value.as_datetime() {
        return datetime.format("%Y-%m-%dT%H:%M:%S").to_string();
    }
    format!("date:{}", value.as_f64())
}

fn format_number(value: f64) -> String {
    // Lab numbers typed into Excel are stored as floats; `26203.0` must read as `26203`.
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// A worksheet loaded from a workbook file on disk.
#[derive(Debug, Clone)]
pub struct WorksheetGrid {
    name: String,
    range: Range<Data>,
}

impl WorksheetGrid {
    pub fn open(path: &Path, sheet_name: &str) -> Result<Self> {
        let mut workbook = open_workbook_auto(path).map_err(|source| LedgerError::Workbook {
            path: path.to_path_buf(),
            source,
        })?;
        if !workbook.sheet_names().iter().any(|name| name == sheet_name) {
            return Err(LedgerError::SheetNotFound(sheet_name.to_string()));
        }
        let range = workbook
            .worksheet_range(sheet_name)
            .map_err(|source| LedgerError::Workbook {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            name: sheet_name.to_string(),
            range,
        })
    }
}

impl LedgerSheet for WorksheetGrid {
    fn name(&self) -> &str {
        &self.name
    }

    fn row_count(&self) -> u32 {
        self.range.end().map(|(row, _)| row + 1).unwrap_or(0)
    }

    fn cell_text(&self, row: u32, col: u32) -> Cow<'_, str> {
        if row == 0 || col == 0 {
            return Cow::Borrowed("");
        }
        match self.range.get_value((row - 1, col - 1)) {
            Some(value) => cell_text(value),
            None => Cow::Borrowed(""),
        }
    }
}

/// Sparse in-memory worksheet.
///
/// Used by the mock automation worker as its "live" workbook and by tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySheet {
    name: String,
    cells: BTreeMap<(u32, u32), String>,
}

impl MemorySheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: BTreeMap::new(),
        }
    }

    /// Copy every non-blank record cell of another sheet.
    pub fn from_sheet<S: LedgerSheet + ?Sized>(sheet: &S) -> Self {
        let mut out = Self::new(sheet.name());
        for row in 1..=sheet.row_count() {
            for col in 1..=RECORD_WIDTH {
                let text = sheet.cell_text(row, col);
                if !text.is_empty() {
                    out.set(row, col, text.into_owned());
                }
            }
        }
        out
    }

    /// Set a cell; an empty value clears it.
    pub fn set(&mut self, row: u32, col: u32, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.cells.remove(&(row, col));
        } else {
            self.cells.insert((row, col), value);
        }
    }

    /// Set a cell addressed in A1 notation (e.g. `"J12"`).
    pub fn set_a1(&mut self, a1: &str, value: impl Into<String>) -> Result<()> {
        let (row, col) = parse_a1(a1)?;
        self.set(row, col, value);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl LedgerSheet for MemorySheet {
    fn name(&self) -> &str {
        &self.name
    }

    fn row_count(&self) -> u32 {
        self.cells
            .last_key_value()
            .map(|((row, _), _)| *row)
            .unwrap_or(0)
    }

    fn cell_text(&self, row: u32, col: u32) -> Cow<'_, str> {
        match self.cells.get(&(row, col)) {
            Some(value) => Cow::Borrowed(value.as_str()),
            None => Cow::Borrowed(""),
        }
    }
}

fn parse_a1(a1: &str) -> Result<(u32, u32)> {
    let invalid = || LedgerError::InvalidCellReference(a1.to_string());
    let trimmed = a1.trim();
    let split = trimmed
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (letters, digits) = trimmed.split_at(split);
    if letters.is_empty() || letters.len() > 3 {
        return Err(invalid());
    }

    let mut col: u32 = 0;
    for ch in letters.chars() {
        if !ch.is_ascii_alphabetic() {
            return Err(invalid());
        }
        col = col * 26 + (ch.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    let row: u32 = digits.parse().map_err(|_| invalid())?;
    if row == 0 {
        return Err(invalid());
    }
    Ok((row, col))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a1_references() {
        assert_eq!(parse_a1("A1").unwrap(), (1, 1));
        assert_eq!(parse_a1("j12").unwrap(), (12, 10));
        assert_eq!(parse_a1("AA3").unwrap(), (3, 27));
        assert!(parse_a1("A0").is_err());
        assert!(parse_a1("12").is_err());
        assert!(parse_a1("A1B").is_err());
    }

    #[test]
    fn integral_floats_read_without_decimal_part() {
        assert_eq!(cell_text(&Data::Float(26203.0)), "26203");
        assert_eq!(cell_text(&Data::Float(1.5)), "1.5");
        assert_eq!(cell_text(&Data::Int(260226801)), "260226801");
        assert_eq!(cell_text(&Data::Empty), "");
    }

    #[test]
    fn date_cells_read_as_iso_text() {
        use calamine::ExcelDateTimeType;

        let date = ExcelDateTime::new(46001.0, ExcelDateTimeType::DateTime, false);
        assert_eq!(cell_text(&Data::DateTime(date)), "2025-12-10T00:00:00");
        let duration = ExcelDateTime::new(0.5, ExcelDateTimeType::TimeDelta, false);
        assert_eq!(cell_text(&Data::DateTime(duration)), "PT43200S");
    }

    #[test]
    fn memory_sheet_row_count_tracks_last_row() {
        let mut sheet = MemorySheet::new("2026");
        assert_eq!(sheet.row_count(), 0);
        sheet.set_a1("J7", "x").unwrap();
        sheet.set_a1("A3", "26203").unwrap();
        assert_eq!(sheet.row_count(), 7);
        assert!(sheet.row_has_content(7));
        assert!(!sheet.row_has_content(5));

        sheet.set_a1("J7", "").unwrap();
        assert_eq!(sheet.row_count(), 3);
    }

    #[test]
    fn whitespace_only_cells_are_not_content() {
        let mut sheet = MemorySheet::new("2026");
        sheet.set(2, 3, " ");
        assert_eq!(sheet.row_count(), 2);
        assert!(!sheet.row_has_content(2));
    }
}
