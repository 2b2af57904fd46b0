use std::io::Cursor;

use anyhow::{anyhow, bail, Context, Result};
use calamine::{open_workbook_auto_from_rs, Data, DataType, Reader};
use shared::protocol::ManifestRow;

use crate::ManifestParser;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1";

/// Reads delivery manifests whose first row is a header and whose first two
/// columns hold the delivery date and the location.
///
/// XLSX, XLS and ODS workbooks are read from their first sheet. Anything else
/// is treated as comma- or tab-separated text.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadsheetManifestParser;

impl ManifestParser for SpreadsheetManifestParser {
    fn parse(&self, bytes: &[u8]) -> Result<Vec<ManifestRow>> {
        if bytes.starts_with(ZIP_MAGIC) || bytes.starts_with(OLE_MAGIC) {
            parse_workbook(bytes)
        } else {
            parse_delimited(bytes)
        }
    }
}

fn parse_workbook(bytes: &[u8]) -> Result<Vec<ManifestRow>> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|err| anyhow!("manifest workbook could not be opened: {err}"))?;
    let sheet = workbook
        .worksheet_range_at(0)
        .context("manifest workbook has no sheets")?
        .map_err(|err| anyhow!("first manifest sheet could not be read: {err}"))?;

    let (Some((first_row, first_col)), Some((last_row, last_col))) = (sheet.start(), sheet.end())
    else {
        return Ok(Vec::new());
    };
    let text = |row: u32, col: u32| sheet.get_value((row, col)).map(cell_text).unwrap_or_default();

    let mut rows = Vec::new();
    for row in first_row + 1..=last_row {
        if (first_col..=last_col).all(|col| text(row, col).trim().is_empty()) {
            continue;
        }
        rows.push(manifest_row(row as usize + 1, &text(row, 0), &text(row, 1))?);
    }
    Ok(rows)
}

/// Date cells come back as ISO dates; everything else as displayed.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::DateTime(_) => cell
            .as_date()
            .map(|date| date.to_string())
            .unwrap_or_else(|| cell.to_string()),
        _ => cell.to_string(),
    }
}

fn parse_delimited(bytes: &[u8]) -> Result<Vec<ManifestRow>> {
    let text = std::str::from_utf8(bytes).context("manifest is not valid UTF-8")?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let delimiter = detect_delimiter(text);
    let mut rows = Vec::new();
    for (index, record) in split_records(text, delimiter)?.into_iter().enumerate().skip(1) {
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        let location = record.get(1).map(String::as_str).unwrap_or_default();
        rows.push(manifest_row(index + 1, &record[0], location)?);
    }
    Ok(rows)
}

fn manifest_row(line: usize, date: &str, location: &str) -> Result<ManifestRow> {
    let location = location.trim();
    if location.is_empty() {
        bail!("manifest row {line} has no location");
    }
    Ok(ManifestRow {
        delivery_date: date.trim().to_string(),
        location: location.to_string(),
    })
}

fn detect_delimiter(text: &str) -> char {
    let header = text.lines().next().unwrap_or_default();
    if header.contains('\t') && !header.contains(',') {
        '\t'
    } else {
        ','
    }
}

fn split_records(text: &str, delimiter: char) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => in_quotes = true,
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            c if c == delimiter => record.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }

    if in_quotes {
        bail!("manifest ends inside a quoted field");
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
#[path = "tests/manifest_tests.rs"]
mod tests;
