//! Log readers for replay

use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use tracing::warn;

use crate::error::{LoggerError, Result};

/// Accepted timestamp layouts of pipe-delimited logs
const PIPE_TIME_FORMATS: [&str; 4] = [
    "%d-%m-%Y %H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub time: NaiveDateTime,
    /// Milliseconds until the next record, 0 for the last one
    pub delay_to_next_ms: i64,
    pub values: Vec<(String, f64)>,
}

impl Record {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }
}

/// Cursor over a parsed log
pub trait LogFile: Send {
    fn next(&mut self) -> Option<&Record>;
    fn prev(&mut self) -> Option<&Record>;
    fn seek(&mut self, pos: usize) -> Option<&Record>;
    /// Index of the current record, `None` before the first `next`
    fn pos(&self) -> Option<usize>;
    fn len(&self) -> usize;
    fn start(&self) -> Option<NaiveDateTime>;
    fn end(&self) -> Option<NaiveDateTime>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Records held in memory
#[derive(Debug, Clone, Default)]
pub struct Recording {
    records: Vec<Record>,
    pos: Option<usize>,
}

impl Recording {
    fn new(mut records: Vec<Record>) -> Self {
        for i in 1..records.len() {
            let delay = (records[i].time - records[i - 1].time).num_milliseconds();
            records[i - 1].delay_to_next_ms = delay;
        }
        Self { records, pos: None }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }
}

impl LogFile for Recording {
    fn next(&mut self) -> Option<&Record> {
        let next = self.pos.map_or(0, |p| p + 1);
        if next >= self.records.len() {
            return None;
        }
        self.pos = Some(next);
        self.records.get(next)
    }

    fn prev(&mut self) -> Option<&Record> {
        let prev = self.pos?.checked_sub(1)?;
        self.pos = Some(prev);
        self.records.get(prev)
    }

    fn seek(&mut self, pos: usize) -> Option<&Record> {
        if pos >= self.records.len() {
            return None;
        }
        self.pos = Some(pos);
        self.records.get(pos)
    }

    fn pos(&self) -> Option<usize> {
        self.pos
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn start(&self) -> Option<NaiveDateTime> {
        self.records.first().map(|r| r.time)
    }

    fn end(&self) -> Option<NaiveDateTime> {
        self.records.last().map(|r| r.time)
    }
}

fn parse_error(path: &str, line: usize, reason: impl Into<String>) -> LoggerError {
    LoggerError::Parse {
        path: path.to_string(),
        line,
        reason: reason.into(),
    }
}

fn detect_time_format(stamp: &str) -> Option<&'static str> {
    PIPE_TIME_FORMATS
        .iter()
        .copied()
        .find(|f| NaiveDateTime::parse_from_str(stamp, f).is_ok())
}

/// Parse a pipe-delimited log. Lines that fail to parse are skipped with a
/// warning; a file without a single readable timestamp is an error.
pub fn parse_pipe(path: &str, text: &str) -> Result<Recording> {
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()).peekable();
    let Some((_, first)) = lines.peek() else {
        return Err(parse_error(path, 0, "no lines in file"));
    };
    let first_stamp = first.split('|').next().unwrap_or_default();
    let format = detect_time_format(first_stamp).ok_or_else(|| parse_error(path, 1, "could not detect time format"))?;

    let mut records = Vec::new();
    for (index, line) in lines {
        match parse_pipe_line(line, format) {
            Ok(record) => records.push(record),
            Err(reason) => warn!(path, line = index + 1, %reason, "Skipping log line"),
        }
    }
    Ok(Recording::new(records))
}

fn parse_pipe_line(line: &str, format: &str) -> std::result::Result<Record, String> {
    let mut fields = line.trim_end().trim_end_matches('|').split('|');
    let stamp = fields.next().unwrap_or_default();
    let time = NaiveDateTime::parse_from_str(stamp, format).map_err(|e| format!("{}: {}", stamp, e))?;
    let mut values = Vec::new();
    for field in fields {
        if field.starts_with("IMPORTANTLINE") {
            continue;
        }
        let (key, raw) = field.split_once('=').ok_or_else(|| format!("no value in '{}'", field))?;
        let value = raw
            .replacen(',', ".", 1)
            .parse::<f64>()
            .map_err(|e| format!("{}: {}", field, e))?;
        values.push((key.to_string(), value));
    }
    Ok(Record {
        time,
        delay_to_next_ms: 0,
        values,
    })
}

/// Parse a CSV log written by [`crate::writer::CsvWriter`]
pub fn parse_csv(path: &str, text: &str) -> Result<Recording> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| parse_error(path, 0, "no header"))?
        .split(',')
        .map(str::trim)
        .collect();
    if header.first() != Some(&"Time") {
        return Err(parse_error(path, 1, "first column must be Time"));
    }

    let mut records = Vec::new();
    for (index, line) in lines.enumerate() {
        let line_no = index + 2;
        let cols: Vec<&str> = line.split(',').map(str::trim).collect();
        if cols.len() != header.len() {
            return Err(parse_error(
                path,
                line_no,
                format!("{} columns, header has {}", cols.len(), header.len()),
            ));
        }
        let time = parse_csv_time(cols[0]).ok_or_else(|| parse_error(path, line_no, format!("bad time '{}'", cols[0])))?;
        let mut values = Vec::with_capacity(cols.len() - 1);
        for (name, raw) in header[1..].iter().zip(&cols[1..]) {
            if raw.is_empty() {
                continue;
            }
            let value = raw
                .parse::<f64>()
                .map_err(|e| parse_error(path, line_no, format!("{}: {}", name, e)))?;
            values.push((name.to_string(), value));
        }
        records.push(Record {
            time,
            delay_to_next_ms: 0,
            values,
        });
    }
    Ok(Recording::new(records))
}

fn parse_csv_time(s: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z")
        .map(|t| t.naive_local())
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

/// Open a log by extension: `.t5l`, `.t7l`, `.t8l` or `.csv`
pub fn open(path: &Path) -> Result<Box<dyn LogFile>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let name = path.display().to_string();
    match ext.as_str() {
        "t5l" | "t7l" | "t8l" => {
            let text = std::fs::read_to_string(path)?;
            Ok(Box::new(parse_pipe(&name, &text)?))
        }
        "csv" => {
            let text = std::fs::read_to_string(path)?;
            Ok(Box::new(parse_csv(&name, &text)?))
        }
        other => Err(LoggerError::Unsupported(format!("log file type '.{}'", other))),
    }
}
