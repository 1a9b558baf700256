use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use sia_core::config::ProposerConfig;
use sia_core::{AgentError, Result};

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?```").expect("fence regex is valid")
});

const SYSTEM_PROMPT: &str = "\
You revise automated trading strategies for a weekly-settlement account. \
Hard constraints: the weekly budget-controller integration must stay intact, \
compounding and profit reinvestment are forbidden, leverage must stay at or \
below the configured maximum, and the stoploss must stay within its floor. \
Prefer one focused change per revision over broad rewrites. \
Respond with a single JSON object and nothing else.";

/// Context the controller assembles for one proposal or repair request.
#[derive(Debug, Clone, Default)]
pub struct ProposerRequest {
    pub round: u32,
    pub current_content: String,
    pub last_summary: Option<String>,
    pub directive: Option<String>,
    pub repair: Option<String>,
}

/// A parsed, field-complete proposal.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub content: String,
    pub rationale: String,
    /// Parameter names and the values this revision sets them to.
    pub manifest: Map<String, Value>,
}

/// Source of candidate revisions.
pub trait Proposer {
    fn propose(&self, request: &ProposerRequest) -> Result<Proposal>;
}

/// Blocking OpenAI-compatible chat client.
///
/// Retries 429, 5xx and transport errors with exponential backoff capped at
/// 30 s; any other status fails immediately. Retry exhaustion surfaces as
/// [`AgentError::ProposerUnavailable`], which the controller turns into a
/// skipped round, never a crash.
pub struct HttpProposer {
    agent: ureq::Agent,
    url: String,
    model: String,
    api_key: String,
    temperature: f64,
    max_retries: u32,
}

impl HttpProposer {
    pub fn from_config(cfg: &ProposerConfig) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env).map_err(|_| {
            AgentError::ProposerUnavailable {
                attempts: 0,
                message: format!("environment variable {} is not set", cfg.api_key_env),
            }
        })?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build();
        Ok(Self {
            agent,
            url: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            model: cfg.model.clone(),
            api_key,
            temperature: cfg.temperature,
            max_retries: cfg.max_retries,
        })
    }

    fn complete(&self, system: &str, user: &str) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": self.temperature,
            "response_format": { "type": "json_object" },
            "stream": false,
        });

        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            match self
                .agent
                .post(&self.url)
                .set("Authorization", &format!("Bearer {}", self.api_key))
                .send_json(payload.clone())
            {
                Ok(resp) => {
                    let body: Value = resp.into_json().map_err(|e| {
                        AgentError::MalformedResponse(format!(
                            "response body is not JSON: {e}"
                        ))
                    })?;
                    let content = body["choices"][0]["message"]["content"]
                        .as_str()
                        .ok_or_else(|| {
                            AgentError::MalformedResponse(
                                "response carries no assistant message".into(),
                            )
                        })?;
                    info!(attempt, "proposer responded");
                    return Ok(content.to_string());
                }
                Err(ureq::Error::Status(code, resp)) if code == 429 || code >= 500 => {
                    last_error = format!("status {code}");
                    let _ = resp.into_string();
                    let wait = backoff_secs(attempt);
                    warn!(code, attempt, wait, "retryable proposer status");
                    if attempt < self.max_retries {
                        std::thread::sleep(Duration::from_secs(wait));
                    }
                }
                Err(ureq::Error::Status(code, resp)) => {
                    let body = resp.into_string().unwrap_or_default();
                    return Err(AgentError::ProposerUnavailable {
                        attempts: attempt,
                        message: format!("status {code}: {body}"),
                    });
                }
                Err(ureq::Error::Transport(t)) => {
                    last_error = t.to_string();
                    let wait = backoff_secs(attempt);
                    warn!(attempt, wait, error = %last_error, "proposer transport error");
                    if attempt < self.max_retries {
                        std::thread::sleep(Duration::from_secs(wait));
                    }
                }
            }
        }
        Err(AgentError::ProposerUnavailable {
            attempts: self.max_retries,
            message: last_error,
        })
    }
}

impl Proposer for HttpProposer {
    fn propose(&self, request: &ProposerRequest) -> Result<Proposal> {
        let raw = self.complete(SYSTEM_PROMPT, &render_user(request))?;
        parse_proposal(&raw)
    }
}

fn backoff_secs(attempt: u32) -> u64 {
    2u64.saturating_pow(attempt).min(30)
}

fn render_user(req: &ProposerRequest) -> String {
    let mut user = format!(
        "## Round {}\n\n## Current Artifact\n```\n{}\n```\n",
        req.round, req.current_content
    );
    if let Some(summary) = &req.last_summary {
        user.push_str(&format!("\n## Last Round\n{summary}\n"));
    }
    if let Some(directive) = &req.directive {
        user.push_str(&format!("\n## Search Directive\n{directive}\n"));
    }
    if let Some(repair) = &req.repair {
        user.push_str(&format!(
            "\n## Repair Context\n{repair}\n\
             Return the full corrected artifact, changing only what the \
             failure requires.\n"
        ));
    }
    user.push_str(
        "\nReturn a single JSON object with keys \"content\" (the full \
         revised artifact text), \"rationale\" (what changed and why), and \
         \"manifest\" (map of parameter names to the values you set).\n",
    );
    user
}

/// Parse the assistant message into a [`Proposal`]. Any missing required
/// field is an explicit error; nothing is silently defaulted.
fn parse_proposal(text: &str) -> Result<Proposal> {
    let value = extract_json(text)?;
    let obj = value.as_object().ok_or_else(|| {
        AgentError::MalformedResponse("proposal is not a JSON object".into())
    })?;
    let content = obj
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::MalformedResponse("proposal missing `content`".into()))?;
    let rationale = obj
        .get("rationale")
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::MalformedResponse("proposal missing `rationale`".into()))?;
    let manifest = obj
        .get("manifest")
        .and_then(Value::as_object)
        .ok_or_else(|| AgentError::MalformedResponse("proposal missing `manifest`".into()))?;
    Ok(Proposal {
        content: content.to_string(),
        rationale: rationale.to_string(),
        manifest: manifest.clone(),
    })
}

/// Pull a JSON object out of an assistant message that may wrap it in a
/// markdown fence or surrounding prose.
fn extract_json(text: &str) -> Result<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        return Ok(v);
    }
    if let Some(cap) = FENCE_RE.captures(text) {
        if let Ok(v) = serde_json::from_str::<Value>(&cap[1]) {
            return Ok(v);
        }
    }
    if let Some(span) = balanced_object(text) {
        if let Ok(v) = serde_json::from_str::<Value>(span) {
            return Ok(v);
        }
    }
    Err(AgentError::MalformedResponse(
        "no JSON object found in response".into(),
    ))
}

/// Outermost `{ ... }` span, tracking string and escape state so braces
/// inside string literals do not affect the depth count.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (i, b) in text.bytes().enumerate().skip(start) {
        if escape {
            escape = false;
            continue;
        }
        match b {
            b'\\' => escape = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_direct_json() {
        let v = extract_json(r#"{"content": "x", "rationale": "y"}"#).unwrap();
        assert_eq!(v["content"], "x");
    }

    #[test]
    fn test_extract_fenced_json() {
        let text = "Here is the revision:\n```json\n{\"content\": \"x\"}\n```\nDone.";
        let v = extract_json(text).unwrap();
        assert_eq!(v["content"], "x");
    }

    #[test]
    fn test_extract_fence_without_language_tag() {
        let text = "```\n{\"content\": \"x\"}\n```";
        let v = extract_json(text).unwrap();
        assert_eq!(v["content"], "x");
    }

    #[test]
    fn test_extract_embedded_in_prose() {
        let text = "I changed the stoploss. {\"content\": \"s\", \"n\": 1} Hope that helps!";
        let v = extract_json(text).unwrap();
        assert_eq!(v["n"], 1);
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse_the_scan() {
        let text = r#"Result: {"content": "def f():\n    return {1: 2}", "rationale": "r"}"#;
        let v = extract_json(text).unwrap();
        assert!(v["content"].as_str().unwrap().contains("{1: 2}"));
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let text = r#"Note: {"content": "say \"hi\" {", "rationale": "r"}"#;
        let v = extract_json(text).unwrap();
        assert_eq!(v["rationale"], "r");
    }

    #[test]
    fn test_no_json_is_an_error() {
        let err = extract_json("I cannot produce a revision right now.").unwrap_err();
        assert!(matches!(err, AgentError::MalformedResponse(_)));
    }

    #[test]
    fn test_parse_complete_proposal() {
        let text = r#"{"content": "class S: pass", "rationale": "tightened stop", "manifest": {"stoploss": -0.2}}"#;
        let p = parse_proposal(text).unwrap();
        assert_eq!(p.content, "class S: pass");
        assert_eq!(p.rationale, "tightened stop");
        assert_eq!(p.manifest["stoploss"], -0.2);
    }

    #[test]
    fn test_missing_field_is_named() {
        let text = r#"{"content": "x", "manifest": {}}"#;
        let err = parse_proposal(text).unwrap_err();
        assert!(err.to_string().contains("rationale"));
    }

    #[test]
    fn test_manifest_must_be_an_object() {
        let text = r#"{"content": "x", "rationale": "y", "manifest": "none"}"#;
        let err = parse_proposal(text).unwrap_err();
        assert!(err.to_string().contains("manifest"));
    }

    #[test]
    fn test_render_user_includes_optional_sections() {
        let req = ProposerRequest {
            round: 4,
            current_content: "class S: pass".into(),
            last_summary: Some("round 3: rejected (overfit)".into()),
            directive: Some("{\"mode\":\"explore\"}".into()),
            repair: None,
        };
        let user = render_user(&req);
        assert!(user.contains("## Round 4"));
        assert!(user.contains("class S: pass"));
        assert!(user.contains("## Last Round"));
        assert!(user.contains("## Search Directive"));
        assert!(!user.contains("## Repair Context"));
    }

    #[test]
    fn test_backoff_caps_at_thirty() {
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(3), 8);
        assert_eq!(backoff_secs(5), 30);
        assert_eq!(backoff_secs(12), 30);
    }
}
