use chrono::{DateTime, Duration};
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Number, Value};

use crate::config::FieldSchema;
use crate::model::{FlatRow, Identifier, RawResource};
use crate::tables::TableSink;

const SUCCESS_STATUS: &str = "success";
const FOREIGN_KEY_FIELD: &str = "account_number";
/// Shift applied to `/Date(...)` epoch values before taking the calendar date.
const DATE_OFFSET_HOURS: i64 = 4;

static DATE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/Date\((\d*)-(\d*)\)").expect("date pattern is valid"));

/// Decodes `/Date(<millis>-<offset>)` into `YYYY-MM-DD`. The embedded offset
/// is ignored in favour of the fixed shift.
pub fn decode_date(input: &str) -> Option<String> {
    let captures = DATE_PATTERN.captures(input)?;
    let millis: i64 = captures.get(1)?.as_str().parse().ok()?;
    let instant = DateTime::from_timestamp(millis / 1000, 0)?
        .checked_add_signed(Duration::hours(DATE_OFFSET_HOURS))?;
    Some(instant.format("%Y-%m-%d").to_string())
}

fn format_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        i.to_string()
    } else if let Some(u) = n.as_u64() {
        u.to_string()
    } else {
        n.as_f64().map(format_float).unwrap_or_default()
    }
}

/// Shortest round-trip text, switching to `d.ddde±XX` when the decimal
/// exponent is below -4 or at least 21.
fn format_float(f: f64) -> String {
    if f == 0.0 || !f.is_finite() {
        return f.to_string();
    }
    let scientific = format!("{:e}", f);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return f.to_string();
    };
    match exponent.parse::<i32>() {
        Ok(exp) if !(-4..21).contains(&exp) => {
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        _ => f.to_string(),
    }
}

/// Renders one JSON value as a CSV cell.
pub fn render_cell(field: &str, value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => decode_date(s).unwrap_or_else(|| s.clone()),
        Some(Value::Number(n)) => format_number(n),
        Some(Value::Bool(b)) => b.to_string(),
        Some(_) => {
            warn!("unknown type: {}", field);
            String::new()
        }
    }
}

/// Cells for `fields` read from `section`. A missing or non-object section
/// gives a row of empty cells.
pub fn flatten_section(section: Option<&Value>, fields: &[String]) -> FlatRow {
    let object = section.and_then(Value::as_object);
    fields.iter().map(|field| render_cell(field, object.and_then(|o| o.get(field)))).collect()
}

fn object_section<'a>(name: &'static str, value: Option<&'a Value>, missing: &mut Vec<&'static str>) -> Option<&'a Value> {
    let found = value.filter(|v| v.is_object());
    if found.is_none() {
        missing.push(name);
    }
    found
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlattenedRecord {
    pub primary: FlatRow,
    pub valuations: Vec<FlatRow>,
    /// Sections that were absent or of the wrong shape.
    pub missing_sections: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Unparseable(String),
    NotSuccess(Option<String>),
}

/// Turns one API document into the primary row and its valuation rows.
pub struct RecordFlattener {
    schema: FieldSchema,
}

impl RecordFlattener {
    pub fn new(schema: FieldSchema) -> Self {
        Self { schema }
    }

    pub fn flatten_payload(&self, payload: &[u8]) -> Result<FlattenedRecord, Rejection> {
        let document: Value = serde_json::from_slice(payload).map_err(|e| Rejection::Unparseable(e.to_string()))?;
        self.flatten(&document)
    }

    pub fn flatten(&self, document: &Value) -> Result<FlattenedRecord, Rejection> {
        match document.get("status").and_then(Value::as_str) {
            Some(SUCCESS_STATUS) => {}
            other => return Err(Rejection::NotSuccess(other.map(str::to_string))),
        }

        let mut missing = Vec::new();
        let property = object_section("property", document.pointer("/data/property"), &mut missing);
        let owner = object_section(
            "ownership",
            property.and_then(|p| p.get("ownership")).and_then(Value::as_array).and_then(|a| a.first()),
            &mut missing,
        );
        let characteristics =
            object_section("characteristics", property.and_then(|p| p.get("characteristics")), &mut missing);
        let sale = object_section("sales_information", property.and_then(|p| p.get("sales_information")), &mut missing);
        let geometry = object_section("geometry", property.and_then(|p| p.get("geometry")), &mut missing);

        let schema = &self.schema;
        let mut primary = flatten_section(property, &schema.property);
        primary.extend(flatten_section(owner, &schema.owner));
        primary.extend(flatten_section(characteristics, &schema.characteristics));
        primary.extend(flatten_section(sale, &schema.sale));
        primary.extend(flatten_section(geometry, &schema.geometry));

        let foreign_key = render_cell(FOREIGN_KEY_FIELD, property.and_then(|p| p.get(FOREIGN_KEY_FIELD)));
        let history = property.and_then(|p| p.get("valuation_history"));
        if history.and_then(Value::as_array).is_none() {
            missing.push("valuation_history");
        }
        let valuations = history
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| {
                        let mut row = flatten_section(Some(entry), &schema.valuation);
                        row.push(foreign_key.clone());
                        row
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(FlattenedRecord { primary, valuations, missing_sections: missing })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub received: usize,
    pub rows_written: usize,
    pub valuation_rows_written: usize,
    pub rejected: Vec<Identifier>,
    pub unparseable: Vec<Identifier>,
    pub write_errors: usize,
}

/// Single consumer of the row queue. Runs until every sender is dropped,
/// then flushes the sink.
pub fn run_transformer(
    rows: Receiver<RawResource>,
    flattener: &RecordFlattener,
    sink: &mut dyn TableSink,
) -> TransformStats {
    info!("Transformer started.");
    let mut stats = TransformStats::default();
    for resource in rows {
        stats.received += 1;
        let id = resource.id;
        let record = match flattener.flatten_payload(&resource.payload) {
            Ok(record) => record,
            Err(Rejection::NotSuccess(status)) => {
                warn!("{} {} (status: {:?})", id, String::from_utf8_lossy(&resource.payload), status);
                stats.rejected.push(id);
                continue;
            }
            Err(Rejection::Unparseable(e)) => {
                warn!("{} {} (invalid JSON: {})", id, String::from_utf8_lossy(&resource.payload), e);
                stats.unparseable.push(id);
                continue;
            }
        };
        if !record.missing_sections.is_empty() {
            debug!("{}: missing sections {:?}, cells left empty", id, record.missing_sections);
        }

        match sink.write_primary(&record.primary) {
            Ok(()) => stats.rows_written += 1,
            Err(e) => {
                error!("Failed to write row for {}: {}", id, e);
                stats.write_errors += 1;
                continue;
            }
        }
        match sink.write_valuations(&record.valuations) {
            Ok(()) => stats.valuation_rows_written += record.valuations.len(),
            Err(e) => {
                error!("Failed to write valuation history for {}: {}", id, e);
                stats.write_errors += 1;
            }
        }
    }
    if let Err(e) = sink.flush() {
        error!("Transformer error during final flush: {}", e);
    }
    info!("Transformer finished. {} received, {} rows written.", stats.received, stats.rows_written);
    stats
}
