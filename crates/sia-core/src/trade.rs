use std::path::Path;

use chrono::NaiveDateTime;
use thiserror::Error;

/// Struct-of-Arrays trade log.
///
/// All vectors are parallel: index `i` across all fields is one closed
/// trade. Profits are in account currency, timestamps in Unix seconds.
#[derive(Debug, Clone, Default)]
pub struct TradeLog {
    pub open_ts: Vec<i64>,
    pub close_ts: Vec<i64>,
    pub profit: Vec<f64>,
}

#[derive(Debug, Error)]
pub enum CsvError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl TradeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            open_ts: Vec::with_capacity(cap),
            close_ts: Vec::with_capacity(cap),
            profit: Vec::with_capacity(cap),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.close_ts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.close_ts.is_empty()
    }

    pub fn push(&mut self, open_ts: i64, close_ts: i64, profit: f64) {
        self.open_ts.push(open_ts);
        self.close_ts.push(close_ts);
        self.profit.push(profit);
    }

    /// (close_ts, profit) pairs in storage order.
    pub fn closes(&self) -> impl Iterator<Item = (i64, f64)> + '_ {
        self.close_ts.iter().copied().zip(self.profit.iter().copied())
    }

    pub fn total_profit(&self) -> f64 {
        self.profit.iter().sum()
    }

    /// Mean holding time in hours; 0.0 for an empty log.
    pub fn avg_duration_hours(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let total_secs: i64 = self
            .open_ts
            .iter()
            .zip(&self.close_ts)
            .map(|(&o, &c)| (c - o).max(0))
            .sum();
        total_secs as f64 / self.len() as f64 / 3600.0
    }

    /// Load trades from a CSV file using memory-mapped I/O.
    ///
    /// Expected format: `open_ts,close_ts,profit` with a header row.
    /// Timestamps are either Unix seconds or `YYYY-MM-DDTHH:MM:SS[..]`.
    /// Rows are returned sorted by close timestamp.
    pub fn from_csv(path: &Path) -> Result<Self, CsvError> {
        let file = std::fs::File::open(path).map_err(|e| CsvError::Io(e.to_string()))?;
        let mmap =
            unsafe { memmap2::Mmap::map(&file) }.map_err(|e| CsvError::Io(e.to_string()))?;
        Self::parse_csv_bytes(&mmap[..])
    }

    /// Parse CSV from raw bytes (testable without files).
    pub fn parse_csv_bytes(data: &[u8]) -> Result<Self, CsvError> {
        // ~30 bytes per row is a reasonable pre-allocation guess
        let mut log = Self::with_capacity(data.len() / 30);
        let len = data.len();

        // Skip header row
        let mut pos = match memchr::memchr(b'\n', data) {
            Some(nl) => nl + 1,
            None => return Ok(log),
        };

        while pos < len {
            let line_end = memchr::memchr(b'\n', &data[pos..])
                .map(|i| pos + i)
                .unwrap_or(len);

            let mut line = &data[pos..line_end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if !line.is_empty() {
                Self::parse_row(line, &mut log)?;
            }
            pos = line_end + 1;
        }

        log.sort_by_close();
        Ok(log)
    }

    fn parse_row(line: &[u8], log: &mut TradeLog) -> Result<(), CsvError> {
        let first = memchr::memchr(b',', line)
            .ok_or_else(|| CsvError::Parse("expected 3 columns, got 1".into()))?;
        let second = memchr::memchr(b',', &line[first + 1..])
            .map(|i| first + 1 + i)
            .ok_or_else(|| CsvError::Parse("expected 3 columns, got 2".into()))?;

        let open_ts = parse_timestamp(&line[..first])?;
        let close_ts = parse_timestamp(&line[first + 1..second])?;
        let profit: f64 = fast_float::parse(&line[second + 1..])
            .map_err(|_| CsvError::Parse("bad profit".into()))?;

        log.push(open_ts, close_ts, profit);
        Ok(())
    }

    /// Stable sort of all columns by close timestamp.
    pub fn sort_by_close(&mut self) {
        if self.len() < 2 {
            return;
        }
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.sort_by_key(|&i| self.close_ts[i]);

        let mut sorted = Self::with_capacity(self.len());
        for &i in &indices {
            sorted.push(self.open_ts[i], self.close_ts[i], self.profit[i]);
        }
        *self = sorted;
    }
}

/// Parse a Unix-seconds or `YYYY-MM-DDTHH:MM:SS` timestamp field.
fn parse_timestamp(bytes: &[u8]) -> Result<i64, CsvError> {
    // Plain integer first: date strings always contain '-'
    if !bytes.contains(&b'-') {
        if let Ok(ts) = fast_float::parse::<f64, _>(bytes) {
            return Ok(ts as i64);
        }
    }

    let s = std::str::from_utf8(bytes)
        .map_err(|_| CsvError::Parse("non-UTF8 timestamp".into()))?;
    // Ignore any zone suffix; inputs are UTC by contract
    let head = s
        .get(..19)
        .ok_or_else(|| CsvError::Parse(format!("timestamp too short: {s}")))?;
    let dt = NaiveDateTime::parse_from_str(head, "%Y-%m-%dT%H:%M:%S")
        .map_err(|_| CsvError::Parse(format!("bad timestamp: {s}")))?;
    Ok(dt.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv_basic() {
        let csv = b"open_ts,close_ts,profit\n\
                    2025-01-06T10:00:00Z,2025-01-06T14:00:00Z,42.5\n\
                    2025-01-07T09:00:00Z,2025-01-07T11:30:00Z,-13.0\n";

        let log = TradeLog::parse_csv_bytes(csv).unwrap();
        assert_eq!(log.len(), 2);
        assert!((log.profit[0] - 42.5).abs() < 1e-10);
        assert!((log.total_profit() - 29.5).abs() < 1e-10);
    }

    #[test]
    fn test_parse_csv_unix_seconds() {
        let csv = b"open_ts,close_ts,profit\n1736157600,1736172000,42.5\n";
        let log = TradeLog::parse_csv_bytes(csv).unwrap();
        assert_eq!(log.open_ts[0], 1736157600);
        assert_eq!(log.close_ts[0], 1736172000);
    }

    #[test]
    fn test_rows_sorted_by_close() {
        let csv = b"open_ts,close_ts,profit\n\
                    2025-01-08T09:00:00Z,2025-01-08T10:00:00Z,1.0\n\
                    2025-01-06T09:00:00Z,2025-01-06T10:00:00Z,2.0\n";
        let log = TradeLog::parse_csv_bytes(csv).unwrap();
        assert!(log.close_ts[0] < log.close_ts[1]);
        assert!((log.profit[0] - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_parse_timestamp_iso() {
        let ts = parse_timestamp(b"2025-01-01T00:00:00Z").unwrap();
        assert_eq!(ts, 1735689600);
    }

    #[test]
    fn test_parse_timestamp_offset_suffix_ignored() {
        let ts = parse_timestamp(b"2025-01-01T00:00:00+00:00").unwrap();
        assert_eq!(ts, 1735689600);
    }

    #[test]
    fn test_avg_duration_hours() {
        let mut log = TradeLog::new();
        log.push(0, 7200, 1.0);
        log.push(0, 3600, 1.0);
        assert!((log.avg_duration_hours() - 1.5).abs() < 1e-10);
    }

    #[test]
    fn test_missing_column_is_error() {
        let csv = b"open_ts,close_ts,profit\n1736157600,42.5\n";
        assert!(TradeLog::parse_csv_bytes(csv).is_err());
    }

    #[test]
    fn test_empty_file_no_rows() {
        let log = TradeLog::parse_csv_bytes(b"open_ts,close_ts,profit\n").unwrap();
        assert!(log.is_empty());
        assert_eq!(log.avg_duration_hours(), 0.0);
    }
}
