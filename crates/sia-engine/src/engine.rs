use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use sia_core::config::EngineConfig;
use sia_core::{Candidate, EvaluationWindow};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Failure signal from one engine invocation, with classification hints.
#[derive(Debug, Clone, Serialize)]
pub struct EngineFailure {
    pub message: String,
    pub exit_status: Option<i32>,
    pub timed_out: bool,
}

impl std::fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_status {
            Some(code) => write!(f, "{} (exit {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl EngineFailure {
    fn spawn(message: String) -> Self {
        Self {
            message,
            exit_status: None,
            timed_out: false,
        }
    }
}

/// Evaluation engine seam.
///
/// One call evaluates one candidate on one window and returns the raw
/// metrics report, still unvalidated. Implementations must be shareable
/// across the comparator's worker pool.
pub trait EvalEngine: Send + Sync {
    fn evaluate(
        &self,
        candidate: &Candidate,
        window: &EvaluationWindow,
    ) -> Result<serde_json::Value, EngineFailure>;
}

/// Blocking subprocess engine with an enforced wall-clock timeout.
///
/// Contract: the configured command receives the candidate scratch path and
/// window range through `{candidate}`, `{start}`, `{end}` and `{window}`
/// placeholders, prints the metrics report JSON on stdout and exits 0, or
/// exits non-zero with a message on stderr.
pub struct SubprocessEngine {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    scratch_dir: PathBuf,
}

impl SubprocessEngine {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            scratch_dir: PathBuf::from(&cfg.scratch_dir),
        }
    }

    fn render_args(&self, candidate_path: &str, window: &EvaluationWindow) -> Vec<String> {
        let start = window.start.format("%Y%m%d").to_string();
        let end = window.end.format("%Y%m%d").to_string();
        self.args
            .iter()
            .map(|a| {
                a.replace("{candidate}", candidate_path)
                    .replace("{start}", &start)
                    .replace("{end}", &end)
                    .replace("{window}", &window.id)
            })
            .collect()
    }

    /// Write the candidate text where the engine command can read it.
    /// One file per (candidate, window) pair so parallel evaluations never
    /// write the same path.
    fn write_scratch(
        &self,
        candidate: &Candidate,
        window: &EvaluationWindow,
    ) -> Result<PathBuf, EngineFailure> {
        std::fs::create_dir_all(&self.scratch_dir)
            .map_err(|e| EngineFailure::spawn(format!("cannot create scratch dir: {e}")))?;
        let path = self
            .scratch_dir
            .join(format!("{}_{}.py", candidate.id, window.id));
        std::fs::write(&path, &candidate.content)
            .map_err(|e| EngineFailure::spawn(format!("cannot write candidate file: {e}")))?;
        Ok(path)
    }
}

impl EvalEngine for SubprocessEngine {
    fn evaluate(
        &self,
        candidate: &Candidate,
        window: &EvaluationWindow,
    ) -> Result<serde_json::Value, EngineFailure> {
        let scratch = self.write_scratch(candidate, window)?;
        let args = self.render_args(&scratch.to_string_lossy(), window);

        debug!(
            candidate = %candidate.id,
            window = %window.id,
            command = %self.command,
            "invoking evaluation engine"
        );

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineFailure::spawn(format!("cannot spawn {}: {e}", self.command))
            })?;

        // Drain pipes on background threads so a chatty child never blocks
        // on a full pipe while we poll for exit
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_reader = std::thread::spawn(move || read_all(stdout));
        let err_reader = std::thread::spawn(move || read_all(stderr));

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = out_reader.join();
                        let _ = err_reader.join();
                        return Err(EngineFailure {
                            message: format!(
                                "evaluation timed out after {}s",
                                self.timeout.as_secs()
                            ),
                            exit_status: None,
                            timed_out: true,
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    let _ = child.kill();
                    return Err(EngineFailure::spawn(format!("wait failed: {e}")));
                }
            }
        };

        let stdout = out_reader.join().unwrap_or_default();
        let stderr = err_reader.join().unwrap_or_default();

        if !status.success() {
            let message = if stderr.trim().is_empty() {
                format!("engine exited with {status}")
            } else {
                stderr.trim().to_string()
            };
            return Err(EngineFailure {
                message,
                exit_status: status.code(),
                timed_out: false,
            });
        }

        serde_json::from_str(&stdout).map_err(|e| EngineFailure {
            message: format!("unreadable metrics report: {e}"),
            exit_status: status.code(),
            timed_out: false,
        })
    }
}

fn read_all(pipe: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use sia_core::Regime;

    fn make_window() -> EvaluationWindow {
        EvaluationWindow {
            id: "bull_2024h1".into(),
            label: String::new(),
            regime: Regime::Bull,
            start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
            holdout: false,
        }
    }

    fn make_engine(dir: &std::path::Path, args: &[&str], timeout_secs: u64) -> SubprocessEngine {
        SubprocessEngine::new(&EngineConfig {
            command: "sh".into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout_secs,
            scratch_dir: dir.to_string_lossy().into_owned(),
        })
    }

    #[test]
    fn test_render_args_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path(), &["--timerange", "{start}-{end}", "{window}"], 5);
        let args = engine.render_args("/tmp/c.py", &make_window());
        assert_eq!(args[1], "20240101-20240630");
        assert_eq!(args[2], "bull_2024h1");
    }

    #[test]
    fn test_successful_report_from_candidate_file() {
        // The candidate content itself is the report; `cat {candidate}`
        // exercises scratch-file writing and placeholder substitution
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path(), &["-c", "cat {candidate}"], 5);
        let candidate = Candidate::new(1, r#"{"total_trades": 60}"#.into(), None);
        let report = engine.evaluate(&candidate, &make_window()).unwrap();
        assert_eq!(report["total_trades"], 60);
    }

    #[test]
    fn test_nonzero_exit_is_failure_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path(), &["-c", "echo boom >&2; exit 3"], 5);
        let candidate = Candidate::new(1, "x".into(), None);
        let err = engine.evaluate(&candidate, &make_window()).unwrap_err();
        assert_eq!(err.exit_status, Some(3));
        assert!(!err.timed_out);
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn test_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path(), &["-c", "sleep 30"], 1);
        let candidate = Candidate::new(1, "x".into(), None);
        let started = Instant::now();
        let err = engine.evaluate(&candidate, &make_window()).unwrap_err();
        assert!(err.timed_out);
        assert!(err.message.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_garbage_stdout_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path(), &["-c", "echo not-json"], 5);
        let candidate = Candidate::new(1, "x".into(), None);
        let err = engine.evaluate(&candidate, &make_window()).unwrap_err();
        assert!(err.message.contains("unreadable metrics report"));
    }
}
