//! Session-scoped observation sink.
//!
//! Every unit of work (a flood round trip, a hold-pool connect attempt, a
//! header fragment) ends up as one [`ObservationRecord`] appended here.
//! Records keep arrival order; exports preserve it.
//!
//! ## Export schema
//! `timestamp, response_time, status_code, size, attack_type, endpoint, error`
//!
//! JSON exports a pretty array of objects. CSV writes a header row, leaves
//! null cells empty and always quotes present optional strings, so `""` and
//! null survive a round trip as different values.

use crate::error::{FailureKind, SessionError};
use chrono::{DateTime, DurationRound, NaiveDateTime, TimeDelta, Utc};
use loadsmith_common::ExportFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Statuses at or above this count as application errors.
pub const ERROR_STATUS_THRESHOLD: u16 = 400;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const CSV_HEADER: [&str; 7] = [
    "timestamp",
    "response_time",
    "status_code",
    "size",
    "attack_type",
    "endpoint",
    "error",
];

/// One data point per completed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    #[serde(with = "timestamp_format")]
    pub timestamp: DateTime<Utc>,
    /// Seconds; 0 for failures with no measurable duration.
    pub response_time: f64,
    /// Response status, or 0 when no response arrived.
    pub status_code: u16,
    pub size: u64,
    pub attack_type: String,
    pub endpoint: Option<String>,
    pub error: Option<String>,
}

/// Outcome class derived from a record's status and error fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    ApplicationError,
    Timeout,
    Transport,
}

impl ObservationRecord {
    pub fn success(
        elapsed: Duration,
        status_code: u16,
        size: u64,
        attack_type: &str,
        endpoint: Option<&str>,
    ) -> Self {
        Self {
            timestamp: now_millis(),
            response_time: elapsed.as_secs_f64(),
            status_code,
            size,
            attack_type: attack_type.to_string(),
            endpoint: endpoint.map(str::to_string),
            error: None,
        }
    }

    pub fn failure(
        elapsed: Duration,
        failure: &FailureKind,
        attack_type: &str,
        endpoint: Option<&str>,
    ) -> Self {
        let status_code = match failure {
            FailureKind::Application(status) => *status,
            FailureKind::Timeout | FailureKind::Transport(_) => 0,
        };
        Self {
            timestamp: now_millis(),
            response_time: elapsed.as_secs_f64(),
            status_code,
            size: 0,
            attack_type: attack_type.to_string(),
            endpoint: endpoint.map(str::to_string),
            error: Some(failure.describe()),
        }
    }

    /// Keeps the response body size on a failure that still got a response.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn outcome(&self) -> Outcome {
        match self.status_code {
            0 => match &self.error {
                Some(e) if e.starts_with("timeout") => Outcome::Timeout,
                _ => Outcome::Transport,
            },
            s if s >= ERROR_STATUS_THRESHOLD => Outcome::ApplicationError,
            _ => Outcome::Success,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.status_code >= ERROR_STATUS_THRESHOLD || self.status_code == 0
    }
}

fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(now)
}

mod timestamp_format {
    use super::TIMESTAMP_FORMAT;
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

/// Aggregate view over a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub total: usize,
    /// Records that got a response below [`ERROR_STATUS_THRESHOLD`].
    pub successful: usize,
    /// Everything else; `successful + failed == total`.
    pub failed: usize,
    pub min_response_time: f64,
    pub mean_response_time: f64,
    pub max_response_time: f64,
    pub status_codes: BTreeMap<u16, usize>,
    pub per_strategy: BTreeMap<String, usize>,
}

impl Summary {
    pub fn from_records(records: &[ObservationRecord]) -> Self {
        if records.is_empty() {
            return Summary::default();
        }
        let mut summary = Summary {
            total: records.len(),
            min_response_time: f64::MAX,
            max_response_time: f64::MIN,
            ..Summary::default()
        };
        let mut total_time = 0.0;
        for r in records {
            if r.is_failure() {
                summary.failed += 1;
            } else {
                summary.successful += 1;
            }
            summary.min_response_time = summary.min_response_time.min(r.response_time);
            summary.max_response_time = summary.max_response_time.max(r.response_time);
            total_time += r.response_time;
            *summary.status_codes.entry(r.status_code).or_insert(0) += 1;
            *summary
                .per_strategy
                .entry(r.attack_type.clone())
                .or_insert(0) += 1;
        }
        summary.mean_response_time = total_time / records.len() as f64;
        summary
    }
}

/// Thread-safe, append-only (until cleared) record store for one session.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    records: Mutex<Vec<ObservationRecord>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ObservationRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, record: ObservationRecord) {
        self.lock().push(record);
    }

    pub fn snapshot(&self) -> Vec<ObservationRecord> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn summary(&self) -> Summary {
        Summary::from_records(&self.snapshot())
    }

    pub fn export<W: Write>(&self, format: ExportFormat, writer: W) -> Result<(), SessionError> {
        write_records(&self.snapshot(), format, writer)
    }

    pub fn export_to_path(
        &self,
        format: ExportFormat,
        path: impl AsRef<Path>,
    ) -> Result<(), SessionError> {
        let file = std::fs::File::create(path)?;
        self.export(format, std::io::BufWriter::new(file))
    }

    /// Appends records read from `reader` after the existing ones.
    pub fn import<R: Read>(&self, format: ExportFormat, reader: R) -> Result<usize, SessionError> {
        let records = read_records(format, reader)?;
        let n = records.len();
        self.lock().extend(records);
        Ok(n)
    }

    pub fn import_from_path(
        &self,
        format: ExportFormat,
        path: impl AsRef<Path>,
    ) -> Result<usize, SessionError> {
        let file = std::fs::File::open(path)?;
        self.import(format, std::io::BufReader::new(file))
    }
}

pub fn write_records<W: Write>(
    records: &[ObservationRecord],
    format: ExportFormat,
    mut writer: W,
) -> Result<(), SessionError> {
    match format {
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, records)?;
            writer.write_all(b"\n")?;
        }
        ExportFormat::Csv => {
            writeln!(writer, "{}", CSV_HEADER.join(","))?;
            for r in records {
                writeln!(
                    writer,
                    "{},{},{},{},{},{},{}",
                    r.timestamp.format(TIMESTAMP_FORMAT),
                    r.response_time,
                    r.status_code,
                    r.size,
                    csv_field(&r.attack_type),
                    csv_optional(r.endpoint.as_deref()),
                    csv_optional(r.error.as_deref()),
                )?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn read_records<R: Read>(
    format: ExportFormat,
    mut reader: R,
) -> Result<Vec<ObservationRecord>, SessionError> {
    match format {
        ExportFormat::Json => Ok(serde_json::from_reader(reader)?),
        ExportFormat::Csv => {
            let mut data = String::new();
            reader.read_to_string(&mut data)?;
            parse_csv(&data)
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.is_empty() || value.contains(&[',', '"', '\n', '\r'][..]) {
        quote(value)
    } else {
        value.to_string()
    }
}

fn csv_optional(value: Option<&str>) -> String {
    value.map(quote).unwrap_or_default()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

#[derive(Debug)]
struct Cell {
    text: String,
    quoted: bool,
}

fn csv_error(msg: impl Into<String>) -> SessionError {
    SessionError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        msg.into(),
    ))
}

/// Splits CSV text into rows of cells, honouring quoted newlines.
fn split_rows(data: &str) -> Result<Vec<Vec<Cell>>, SessionError> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut cell = Cell {
        text: String::new(),
        quoted: false,
    };
    let mut in_quotes = false;
    let mut chars = data.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.text.push('"');
                }
                '"' => in_quotes = false,
                _ => cell.text.push(c),
            }
            continue;
        }
        match c {
            '"' if cell.text.is_empty() && !cell.quoted => {
                cell.quoted = true;
                in_quotes = true;
            }
            ',' => row.push(std::mem::replace(
                &mut cell,
                Cell {
                    text: String::new(),
                    quoted: false,
                },
            )),
            '\r' => {}
            '\n' => {
                row.push(std::mem::replace(
                    &mut cell,
                    Cell {
                        text: String::new(),
                        quoted: false,
                    },
                ));
                rows.push(std::mem::take(&mut row));
            }
            _ => cell.text.push(c),
        }
    }
    if in_quotes {
        return Err(csv_error("unterminated quoted field"));
    }
    if !cell.text.is_empty() || cell.quoted || !row.is_empty() {
        row.push(cell);
        rows.push(row);
    }
    Ok(rows)
}

fn parse_csv(data: &str) -> Result<Vec<ObservationRecord>, SessionError> {
    let mut rows = split_rows(data)?.into_iter();
    let header = rows.next().ok_or_else(|| csv_error("missing header row"))?;
    let names: Vec<&str> = header.iter().map(|c| c.text.as_str()).collect();
    if names != CSV_HEADER {
        return Err(csv_error(format!("unexpected header: {}", names.join(","))));
    }

    let mut records = Vec::new();
    for (line, row) in rows.enumerate() {
        if row.len() != CSV_HEADER.len() {
            return Err(csv_error(format!(
                "row {} has {} fields, expected {}",
                line + 1,
                row.len(),
                CSV_HEADER.len()
            )));
        }
        let bad = |field: &str| csv_error(format!("row {}: invalid {}", line + 1, field));
        let timestamp = NaiveDateTime::parse_from_str(&row[0].text, TIMESTAMP_FORMAT)
            .map_err(|_| bad("timestamp"))?
            .and_utc();
        let optional = |cell: &Cell| {
            if cell.quoted || !cell.text.is_empty() {
                Some(cell.text.clone())
            } else {
                None
            }
        };
        records.push(ObservationRecord {
            timestamp,
            response_time: row[1].text.parse().map_err(|_| bad("response_time"))?,
            status_code: row[2].text.parse().map_err(|_| bad("status_code"))?,
            size: row[3].text.parse().map_err(|_| bad("size"))?,
            attack_type: row[4].text.clone(),
            endpoint: optional(&row[5]),
            error: optional(&row[6]),
        });
    }
    Ok(records)
}
