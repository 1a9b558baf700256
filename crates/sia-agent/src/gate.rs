use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use sia_core::config::GateConfig;
use sia_core::Candidate;
use tracing::debug;

static LEVERAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"leverage\s*[=:]\s*(-?[\d.]+)").expect("leverage regex is valid")
});
static STOPLOSS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"stoploss\s*=\s*(-?[\d.]+)").expect("stoploss regex is valid")
});

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub check: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateResult {
    pub passed: bool,
    pub violations: Vec<Violation>,
}

impl GateResult {
    /// One-line digest for the journal and for proposer feedback.
    pub fn summary(&self) -> String {
        self.violations
            .iter()
            .map(|v| format!("{}: {}", v.check, v.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Static safety checks every candidate must clear before evaluation.
///
/// The gate fails closed: content it cannot positively verify (an
/// unparseable leverage value, say) is a violation, not a pass. All checks
/// run even after the first violation so the proposer gets the full list.
pub struct SafetyGate {
    cfg: GateConfig,
}

impl SafetyGate {
    pub fn new(cfg: &GateConfig) -> Self {
        Self { cfg: cfg.clone() }
    }

    pub fn validate(&self, candidate: &Candidate) -> GateResult {
        let content = &candidate.content;
        let mut violations = Vec::new();

        if content.trim().is_empty() {
            violations.push(Violation {
                check: "non_empty".into(),
                detail: "candidate content is empty".into(),
            });
            return GateResult {
                passed: false,
                violations,
            };
        }

        for marker in &self.cfg.required_markers {
            if !content.contains(marker.as_str()) {
                violations.push(Violation {
                    check: "required_marker".into(),
                    detail: format!("required marker `{marker}` is missing"),
                });
            }
        }

        for marker in &self.cfg.forbidden_markers {
            if content.contains(marker.as_str()) {
                violations.push(Violation {
                    check: "forbidden_marker".into(),
                    detail: format!("forbidden marker `{marker}` is present"),
                });
            }
        }

        for cap in LEVERAGE_RE.captures_iter(content) {
            let raw = &cap[1];
            match raw.parse::<f64>() {
                Ok(v) if v <= self.cfg.max_leverage => {}
                Ok(v) => violations.push(Violation {
                    check: "max_leverage".into(),
                    detail: format!(
                        "leverage {v}x exceeds maximum {}x",
                        self.cfg.max_leverage
                    ),
                }),
                Err(_) => violations.push(Violation {
                    check: "max_leverage".into(),
                    detail: format!("unparseable leverage value `{raw}`"),
                }),
            }
        }

        for cap in STOPLOSS_RE.captures_iter(content) {
            let raw = &cap[1];
            match raw.parse::<f64>() {
                Ok(v) if v >= self.cfg.min_stoploss => {}
                Ok(v) => violations.push(Violation {
                    check: "min_stoploss".into(),
                    detail: format!(
                        "stoploss {v} is wider than minimum {}",
                        self.cfg.min_stoploss
                    ),
                }),
                Err(_) => violations.push(Violation {
                    check: "min_stoploss".into(),
                    detail: format!("unparseable stoploss value `{raw}`"),
                }),
            }
        }

        let passed = violations.is_empty();
        if !passed {
            debug!(
                candidate = %candidate.id,
                violations = violations.len(),
                "gate rejected candidate"
            );
        }
        GateResult { passed, violations }
    }
}
