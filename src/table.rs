//! Hourly time-indexed tables of pollutant and weather readings.
//!
//! A [`TimeSeriesTable`] maps an hour (UTC) to one optional reading per named
//! column. Timestamps are floored to the hour on insert, so the index is
//! always hourly, unique and sorted. Missing readings are `None`; they are
//! only filled (forward, then backward) when a column is pulled out as model
//! input via [`TimeSeriesTable::filled_column`].

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use tracing::debug;

use crate::error::{ModelError, NowcastError, Result};

/// Timestamp format used when writing tables to CSV.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Floors a timestamp to the start of its hour.
pub fn floor_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp().div_euclid(3600) * 3600, 0).unwrap_or(ts)
}

/// Parses the timestamp formats found in the cached CSVs and API payloads.
///
/// Accepts RFC 3339 (with `T` or a space), and naive `%Y-%m-%d %H:%M:%S` /
/// `%Y-%m-%dT%H:%M:%S` values with an optional trailing `Z`, which are read
/// as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%:z") {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = raw.trim_end_matches('Z');
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
        .map(|ts| ts.and_utc())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeriesTable {
    columns: Vec<String>,
    rows: BTreeMap<DateTime<Utc>, Vec<Option<f64>>>,
}

impl TimeSeriesTable {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for column in columns {
            table.ensure_column(&column.into());
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Returns the index of `name`, appending it (missing in every row) if new.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for row in self.rows.values_mut() {
            row.push(None);
        }
        self.columns.len() - 1
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Inserts or replaces the row at `ts` (floored to the hour).
    ///
    /// `values` follow column order; short rows are padded with `None` and
    /// extra values are dropped.
    pub fn insert_row(&mut self, ts: DateTime<Utc>, mut values: Vec<Option<f64>>) {
        values.resize(self.columns.len(), None);
        self.rows.insert(floor_hour(ts), values);
    }

    /// Sets a single cell, creating the column and the row as needed.
    pub fn set(&mut self, ts: DateTime<Utc>, column: &str, value: Option<f64>) {
        let idx = self.ensure_column(column);
        let width = self.columns.len();
        let row = self
            .rows
            .entry(floor_hour(ts))
            .or_insert_with(|| vec![None; width]);
        row[idx] = value;
    }

    pub fn get(&self, ts: DateTime<Utc>, column: &str) -> Option<f64> {
        let idx = self.column_index(column)?;
        self.rows.get(&floor_hour(ts)).and_then(|row| row[idx])
    }

    pub fn row(&self, ts: DateTime<Utc>) -> Option<&[Option<f64>]> {
        self.rows.get(&floor_hour(ts)).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, &[Option<f64>])> {
        self.rows.iter().map(|(ts, row)| (*ts, row.as_slice()))
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.rows.keys().copied()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.rows.keys().next().copied()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.rows.keys().next_back().copied()
    }

    /// Raw values of a column in timestamp order.
    pub fn column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let idx = self.column_index(name)?;
        Some(self.rows.values().map(|row| row[idx]).collect())
    }

    /// Column values with gaps forward-filled, then leading gaps back-filled.
    pub fn filled_column(&self, name: &str) -> std::result::Result<Vec<f64>, ModelError> {
        let raw = self
            .column(name)
            .ok_or_else(|| ModelError::MissingColumn(name.to_string()))?;
        let first = raw
            .iter()
            .flatten()
            .copied()
            .next()
            .ok_or_else(|| ModelError::MissingColumn(name.to_string()))?;

        let mut last = first;
        Ok(raw
            .into_iter()
            .map(|value| {
                if let Some(v) = value {
                    last = v;
                }
                last
            })
            .collect())
    }

    /// Latest timestamp at which `column` has a reading, with that reading.
    pub fn last_observed(&self, column: &str) -> Option<(DateTime<Utc>, f64)> {
        let idx = self.column_index(column)?;
        self.rows
            .iter()
            .rev()
            .find_map(|(ts, row)| row[idx].map(|v| (*ts, v)))
    }

    /// Drops trailing rows after the last reading of `column`.
    pub fn trim_trailing_missing(&self, column: &str) -> Self {
        match self.last_observed(column) {
            Some((ts, _)) => self.truncate_after(ts),
            None => Self {
                columns: self.columns.clone(),
                rows: BTreeMap::new(),
            },
        }
    }

    /// Keeps only rows at or before `ts`.
    pub fn truncate_after(&self, ts: DateTime<Utc>) -> Self {
        Self {
            columns: self.columns.clone(),
            rows: self
                .rows
                .range(..=ts)
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        }
    }

    /// Keeps the last `n` rows.
    pub fn tail(&self, n: usize) -> Self {
        let skip = self.rows.len().saturating_sub(n);
        Self {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .skip(skip)
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        }
    }

    /// Keeps the named columns, in the order given. Unknown names are added
    /// as all-missing columns.
    pub fn select(&self, columns: &[&str]) -> Self {
        let indices: Vec<Option<usize>> = columns.iter().map(|c| self.column_index(c)).collect();
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: self
                .rows
                .iter()
                .map(|(ts, row)| {
                    let picked = indices.iter().map(|idx| idx.and_then(|i| row[i])).collect();
                    (*ts, picked)
                })
                .collect(),
        }
    }

    /// Left join on timestamp: keeps this table's rows and appends the
    /// columns of `other` that this table does not already have.
    pub fn left_join(&self, other: &Self) -> Self {
        let mut joined = self.clone();
        let extra: Vec<(usize, usize)> = other
            .columns
            .iter()
            .enumerate()
            .filter(|(_, name)| !self.has_column(name))
            .map(|(src, name)| (src, joined.ensure_column(name)))
            .collect();

        for (ts, row) in joined.rows.iter_mut() {
            if let Some(other_row) = other.rows.get(ts) {
                for &(src, dst) in &extra {
                    row[dst] = other_row[src];
                }
            }
        }
        joined
    }

    /// Reindexes to every hour in `[start, end]`; hours without data become
    /// all-missing rows and rows outside the range are dropped.
    pub fn reindex_hourly(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let width = self.columns.len();
        let mut rows = BTreeMap::new();
        let mut ts = floor_hour(start);
        while ts <= end {
            let row = self.rows.get(&ts).cloned().unwrap_or_else(|| vec![None; width]);
            rows.insert(ts, row);
            ts += TimeDelta::hours(1);
        }
        Self {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Reads a table whose first column is the timestamp index.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers()?.clone();
        let mut seen = HashSet::new();
        if let Some(duplicate) = headers.iter().skip(1).find(|name| !seen.insert(*name)) {
            return Err(NowcastError::InvalidData(format!(
                "duplicate column '{duplicate}'"
            )));
        }
        let mut table = Self::new(headers.iter().skip(1));

        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            let raw_ts = record.get(0).unwrap_or_default();
            let ts = parse_timestamp(raw_ts).ok_or_else(|| {
                NowcastError::InvalidData(format!(
                    "row {}: unparseable timestamp '{raw_ts}'",
                    line + 1
                ))
            })?;

            let values = record
                .iter()
                .skip(1)
                .map(|cell| parse_cell(cell, line + 1))
                .collect::<Result<Vec<_>>>()?;
            table.insert_row(ts, values);
        }

        Ok(table)
    }

    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let table = Self::read_csv(file)?;
        debug!(
            rows = table.len(),
            columns = table.columns.len(),
            "Loaded table from CSV"
        );
        Ok(table)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(std::iter::once("timestamp").chain(self.columns.iter().map(String::as_str)))?;

        for (ts, row) in &self.rows {
            let mut record = Vec::with_capacity(row.len() + 1);
            record.push(ts.format(TIMESTAMP_FORMAT).to_string());
            record.extend(row.iter().map(|v| v.map(|v| v.to_string()).unwrap_or_default()));
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn to_csv_path(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        self.write_csv(file)
    }
}

fn parse_cell(cell: &str, line: usize) -> Result<Option<f64>> {
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    cell.parse::<f64>()
        .map(Some)
        .map_err(|_| NowcastError::InvalidData(format!("row {line}: invalid number '{cell}'")))
}
