//! Payload parsers that turn fetched bodies into typed records.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sportsync_core::{Game, LiveGame, Player, Record, RecordType, StatLine};
use thiserror::Error;

/// Upper bound on the payload prefix quoted in structural parse diagnostics.
pub const EXCERPT_LIMIT: usize = 200;

/// The payload does not have the shape the parser expects. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub trait RecordParser: Send + Sync {
    fn parse(&self, record_type: RecordType, body: &[u8]) -> Result<Vec<Record>, ParseError>;
}

pub fn excerpt(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(EXCERPT_LIMIT)
        .collect()
}

pub fn record_from_json(record_type: RecordType, value: JsonValue) -> Result<Record, ParseError> {
    let record = match record_type {
        RecordType::Players => serde_json::from_value::<Player>(value).map(Record::Player),
        RecordType::Games => serde_json::from_value::<Game>(value).map(Record::Game),
        RecordType::LiveGames => serde_json::from_value::<LiveGame>(value).map(Record::LiveGame),
        RecordType::Stats => serde_json::from_value::<StatLine>(value).map(Record::Stat),
    };
    record.map_err(|e| ParseError::new(format!("{record_type} record: {e}")))
}

/// JSON feeds: either a bare array of records or a `{"records": [...]}` envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFeedParser;

impl RecordParser for JsonFeedParser {
    fn parse(&self, record_type: RecordType, body: &[u8]) -> Result<Vec<Record>, ParseError> {
        let value: JsonValue = serde_json::from_slice(body)
            .map_err(|e| ParseError::new(format!("invalid json: {e}")))?;
        let items = match value {
            JsonValue::Array(items) => items,
            JsonValue::Object(mut map) => match map.remove("records") {
                Some(JsonValue::Array(items)) => items,
                _ => {
                    return Err(ParseError::new(
                        "expected a `records` array in the response object",
                    ))
                }
            },
            _ => return Err(ParseError::new("expected a json array or object")),
        };

        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                record_from_json(record_type, item)
                    .map_err(|e| ParseError::new(format!("item {index}: {e}")))
            })
            .collect()
    }
}

/// HTML stat tables. Header cells are mapped to record fields through `columns`;
/// unmapped headers are used directly when they already name a field.
#[derive(Debug, Clone)]
pub struct HtmlTableParser {
    table_selector: String,
    columns: BTreeMap<String, String>,
}

impl HtmlTableParser {
    pub fn new(table_selector: impl Into<String>, columns: BTreeMap<String, String>) -> Self {
        Self {
            table_selector: table_selector.into(),
            columns,
        }
    }

    fn field_for_header(&self, record_type: RecordType, header: &str) -> Option<String> {
        if let Some(field) = self.columns.get(header) {
            return Some(field.clone());
        }
        let normalized = header.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        record_type
            .field_names()
            .contains(&normalized.as_str())
            .then_some(normalized)
    }
}

fn selector(raw: &str) -> Result<Selector, ParseError> {
    Selector::parse(raw).map_err(|e| ParseError::new(format!("bad selector `{raw}`: {e}")))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

fn numeric_cell(field: &str, text: &str) -> Result<JsonValue, ParseError> {
    if let Ok(n) = text.parse::<i64>() {
        return Ok(JsonValue::from(n));
    }
    text.parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .map(JsonValue::from)
        .ok_or_else(|| ParseError::new(format!("column `{field}` has non-numeric value `{text}`")))
}

impl RecordParser for HtmlTableParser {
    fn parse(&self, record_type: RecordType, body: &[u8]) -> Result<Vec<Record>, ParseError> {
        let document = Html::parse_document(&String::from_utf8_lossy(body));
        let table_sel = selector(&self.table_selector)?;
        let row_sel = selector("tr")?;
        let header_sel = selector("th")?;
        let cell_sel = selector("td")?;

        let table = document.select(&table_sel).next().ok_or_else(|| {
            ParseError::new(format!("no table matches `{}`", self.table_selector))
        })?;

        let mut headers: Option<Vec<Option<String>>> = None;
        let mut records = Vec::new();
        for row in table.select(&row_sel) {
            let header_cells: Vec<String> = row.select(&header_sel).map(cell_text).collect();
            if headers.is_none() && !header_cells.is_empty() {
                headers = Some(
                    header_cells
                        .iter()
                        .map(|h| self.field_for_header(record_type, h))
                        .collect(),
                );
                continue;
            }

            let cells: Vec<String> = row.select(&cell_sel).map(cell_text).collect();
            if cells.is_empty() {
                continue;
            }
            let Some(fields) = headers.as_ref() else {
                return Err(ParseError::new("table has data rows before a header row"));
            };

            let mut object = JsonMap::new();
            for (field, text) in fields.iter().zip(cells) {
                let Some(field) = field else { continue };
                if text.is_empty() {
                    continue;
                }
                let value = if record_type.is_numeric_field(field) {
                    numeric_cell(field, &text)?
                } else {
                    JsonValue::String(text)
                };
                object.insert(field.clone(), value);
            }
            records.push(record_from_json(record_type, JsonValue::Object(object))?);
        }

        if headers.is_none() {
            return Err(ParseError::new("table has no header row"));
        }
        Ok(records)
    }
}
