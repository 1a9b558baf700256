use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use sia_core::{AgentError, Candidate, Result};
use sia_engine::WindowResult;

/// Controller decision for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Candidate promoted to baseline.
    Accept,
    /// Candidate kept out: gate violation, overfit, or no improvement.
    Reject,
    /// Recovery escalated; baseline restored.
    Rollback,
    /// Candidate breached a hard execution limit and was discarded.
    Quarantine,
    /// No candidate was decided; the baseline carries over.
    Skip,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Decision::Accept => "accept",
            Decision::Reject => "reject",
            Decision::Rollback => "rollback",
            Decision::Quarantine => "quarantine",
            Decision::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// Per-window digest kept in the round record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub window_id: String,
    pub holdout: bool,
    pub valid: bool,
    pub score: Option<f64>,
    pub failure: Option<String>,
}

impl From<&WindowResult> for WindowSummary {
    fn from(r: &WindowResult) -> Self {
        Self {
            window_id: r.window_id.clone(),
            holdout: r.holdout,
            valid: r.valid,
            score: r.score,
            failure: r.failure.clone(),
        }
    }
}

/// Everything the controller decided about one round, one JSONL line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    pub timestamp: DateTime<Utc>,
    pub candidate_id: String,
    pub parent_id: Option<String>,
    pub decision: Decision,
    /// Mean score over valid in-sample windows.
    pub score: Option<f64>,
    pub oos_score: Option<f64>,
    pub overfit_ratio: Option<f64>,
    pub robustness_score: Option<f64>,
    pub gap_norm: Option<f64>,
    pub windows: Vec<WindowSummary>,
    /// Excerpt of the proposer's stated rationale.
    pub rationale: String,
    /// Decision detail: violation list, failure note, score comparison.
    pub note: String,
}

impl RoundRecord {
    /// One-line digest fed back to the proposer on the next round.
    pub fn summary(&self) -> String {
        let mut s = format!("round {}: {}", self.round, self.decision);
        if let Some(score) = self.score {
            s.push_str(&format!(", score {score:.2}"));
        }
        if let Some(oos) = self.oos_score {
            s.push_str(&format!(", oos {oos:.2}"));
        }
        if !self.note.is_empty() {
            s.push_str(&format!(" ({})", self.note));
        }
        s
    }
}

/// Truncate to at most `max` bytes on a char boundary.
pub(crate) fn excerpt(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Append-only JSONL journal of round outcomes.
///
/// One record per line, flushed on every append, never rewritten in place.
/// The file is the durable source for resuming analysis and for finding the
/// last accepted revision without replaying a run.
pub struct RoundJournal {
    path: PathBuf,
}

impl RoundJournal {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &RoundRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("create journal dir", e))?;
        }
        let line = serde_json::to_string(record)
            .map_err(|e| AgentError::Journal(format!("serialize round record: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_err("open journal", e))?;
        writeln!(file, "{line}").map_err(|e| io_err("append journal", e))?;
        file.flush().map_err(|e| io_err("flush journal", e))?;
        debug!(round = record.round, decision = %record.decision, "round journaled");
        Ok(())
    }

    /// All records in write order. A journal that does not exist yet reads
    /// as empty; a corrupt line is an error naming its line number.
    pub fn read_all(&self) -> Result<Vec<RoundRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|e| io_err("open journal", e))?;
        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| io_err("read journal", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| {
                AgentError::Journal(format!("journal line {} is corrupt: {e}", index + 1))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn last_accepted(&self) -> Result<Option<RoundRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .rev()
            .find(|r| r.decision == Decision::Accept))
    }
}

/// One file per promoted candidate, named by round and candidate id and
/// written via temp-file + rename so a crash never leaves a truncated
/// version behind.
pub struct VersionStore {
    dir: PathBuf,
}

impl VersionStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn persist(&self, candidate: &Candidate) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err("create version dir", e))?;
        let path = self
            .dir
            .join(format!("round_{:03}_{}.cand", candidate.round, candidate.id));
        atomic_write(&path, &candidate.content).map_err(|e| io_err("persist version", e))?;
        debug!(candidate = %candidate.id, path = %path.display(), "version persisted");
        Ok(path)
    }

    /// Exact content the candidate was persisted with.
    pub fn load(&self, candidate_id: &str) -> Result<String> {
        let path = self.find(candidate_id)?.ok_or_else(|| {
            AgentError::Journal(format!("no stored version for candidate {candidate_id}"))
        })?;
        fs::read_to_string(&path).map_err(|e| io_err("read version", e))
    }

    fn find(&self, candidate_id: &str) -> Result<Option<PathBuf>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let suffix = format!("_{candidate_id}.cand");
        for entry in fs::read_dir(&self.dir).map_err(|e| io_err("scan version dir", e))? {
            let entry = entry.map_err(|e| io_err("scan version dir", e))?;
            if entry.file_name().to_string_lossy().ends_with(&suffix) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}

pub(crate) fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

fn io_err(what: &str, e: std::io::Error) -> AgentError {
    AgentError::Journal(format!("{what}: {e}"))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn make_record(round: u32, decision: Decision, score: Option<f64>) -> RoundRecord {
        RoundRecord {
            round,
            timestamp: Utc::now(),
            candidate_id: format!("r{round:03}-aabbccdd"),
            parent_id: (round > 1).then(|| format!("r{:03}-aabbccdd", round - 1)),
            decision,
            score,
            oos_score: score.map(|s| s * 0.8),
            overfit_ratio: score.map(|_| 0.8),
            robustness_score: Some(54.38),
            gap_norm: None,
            windows: vec![WindowSummary {
                window_id: "is_a".into(),
                holdout: false,
                valid: true,
                score,
                failure: None,
            }],
            rationale: "tightened the stoploss".into(),
            note: String::new(),
        }
    }

    #[test]
    fn test_append_and_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let journal = RoundJournal::new(dir.path().join("round_log.jsonl"));
        let first = make_record(1, Decision::Accept, Some(41.0));
        let second = make_record(2, Decision::Reject, Some(40.5));
        journal.append(&first).unwrap();
        journal.append(&second).unwrap();

        let records = journal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], first);
        assert_eq!(records[1], second);
    }

    #[test]
    fn test_each_record_is_one_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("round_log.jsonl");
        let journal = RoundJournal::new(&path);
        journal.append(&make_record(1, Decision::Accept, Some(41.0))).unwrap();
        journal.append(&make_record(2, Decision::Skip, None)).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        for line in raw.lines() {
            serde_json::from_str::<RoundRecord>(line).unwrap();
        }
    }

    #[test]
    fn test_missing_journal_reads_empty() {
        let dir = TempDir::new().unwrap();
        let journal = RoundJournal::new(dir.path().join("absent.jsonl"));
        assert!(journal.read_all().unwrap().is_empty());
        assert!(journal.last_accepted().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_line_names_its_position() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("round_log.jsonl");
        let journal = RoundJournal::new(&path);
        journal.append(&make_record(1, Decision::Accept, Some(41.0))).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        let err = journal.read_all().unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_last_accepted_skips_later_non_accepts() {
        let dir = TempDir::new().unwrap();
        let journal = RoundJournal::new(dir.path().join("round_log.jsonl"));
        journal.append(&make_record(1, Decision::Accept, Some(41.0))).unwrap();
        journal.append(&make_record(2, Decision::Accept, Some(61.0))).unwrap();
        journal.append(&make_record(3, Decision::Reject, Some(60.0))).unwrap();
        journal.append(&make_record(4, Decision::Rollback, None)).unwrap();

        let last = journal.last_accepted().unwrap().unwrap();
        assert_eq!(last.round, 2);
    }

    #[test]
    fn test_summary_carries_decision_and_scores() {
        let mut record = make_record(3, Decision::Reject, Some(60.0));
        record.note = "score 60.00 did not beat 61.00 by 0.50".into();
        let s = record.summary();
        assert!(s.starts_with("round 3: reject"));
        assert!(s.contains("score 60.00"));
        assert!(s.contains("did not beat"));
    }

    #[test]
    fn test_version_store_round_trips_exact_content() {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::new(dir.path().join("candidates"));
        let candidate = Candidate::new(3, "class Strategy:\n    stoploss = -0.25\n".into(), None);

        let path = store.persist(&candidate).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            format!("round_003_{}.cand", candidate.id)
        );
        assert_eq!(store.load(&candidate.id).unwrap(), candidate.content);
    }

    #[test]
    fn test_version_store_missing_candidate_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::new(dir.path().join("candidates"));
        let err = store.load("r009-deadbeef").unwrap_err();
        assert!(err.to_string().contains("r009-deadbeef"));
    }

    #[test]
    fn test_persist_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = VersionStore::new(dir.path().join("candidates"));
        let candidate = Candidate::new(1, "content".into(), None);
        let a = store.persist(&candidate).unwrap();
        let b = store.persist(&candidate).unwrap();
        assert_eq!(a, b);
        assert_eq!(fs::read_dir(dir.path().join("candidates")).unwrap().count(), 1);
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("short", 240), "short");
        let long = "ø".repeat(200);
        let cut = excerpt(&long, 25);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= 28);
    }
}
