use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use sia_core::config::SettlementConfig;
use sia_core::{classify_periods, MetricsRecord, TradeLog};

/// A report the aggregation boundary refuses to let through.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("report is not a JSON object")]
    NotAnObject,
    #[error("report missing required field `{0}`")]
    MissingField(&'static str),
    #[error("report field `{field}` is malformed: {detail}")]
    Malformed { field: &'static str, detail: String },
}

/// Normalizes raw engine reports into [`MetricsRecord`]s.
///
/// Engines differ in what they call things, so the core fields are resolved
/// through fixed fallback chains (`profit_total_pct` <- `profit_total`,
/// `max_drawdown_pct` <- `max_drawdown_account` <- `max_drawdown`). A report
/// missing a required field after its chain is rejected outright; a rejected
/// report never produces a partial record.
///
/// When the report carries a `trades` array, the settlement classifier runs
/// over it and the weekly/monthly fields are derived from that, not trusted
/// from the report.
pub struct MetricsAggregator {
    settlement: SettlementConfig,
}

impl MetricsAggregator {
    pub fn new(settlement: SettlementConfig) -> Self {
        Self { settlement }
    }

    pub fn normalize(&self, raw: &Value) -> Result<MetricsRecord, AggregateError> {
        if !raw.is_object() {
            return Err(AggregateError::NotAnObject);
        }

        let total_trades = match optional_number(raw, "total_trades")? {
            Some(v) => v as u32,
            None => return Err(AggregateError::MissingField("total_trades")),
        };

        let profit_total_pct = match optional_number(raw, "profit_total_pct")? {
            Some(v) => v,
            // Ratio form; scale to percent.
            None => match optional_number(raw, "profit_total")? {
                Some(v) => v * 100.0,
                None => return Err(AggregateError::MissingField("profit_total_pct")),
            },
        };

        let max_drawdown_pct = match optional_number(raw, "max_drawdown_pct")? {
            Some(v) => v,
            None => match optional_number(raw, "max_drawdown_account")? {
                Some(v) => v * 100.0,
                None => match optional_number(raw, "max_drawdown")? {
                    Some(v) => v * 100.0,
                    None => return Err(AggregateError::MissingField("max_drawdown_pct")),
                },
            },
        };

        let win_rate = match optional_number(raw, "win_rate")? {
            Some(v) => v,
            None => match optional_number(raw, "winrate")? {
                Some(v) => v,
                None => match optional_number(raw, "wins")? {
                    Some(w) if total_trades > 0 => w / total_trades as f64,
                    _ => 0.0,
                },
            },
        };

        let stake_limit_hits = match optional_number(raw, "stake_limit_hits")? {
            Some(v) => v as u32,
            None => optional_number(raw, "stake_limit_hit_count")?.unwrap_or(0.0) as u32,
        };

        let avg_trade_duration_hours = match optional_number(raw, "avg_trade_duration_hours")? {
            Some(v) => v,
            None => optional_number(raw, "avg_trade_duration_min")?
                .map(|m| m / 60.0)
                .unwrap_or(0.0),
        };

        let mut record = MetricsRecord {
            profit_total_pct,
            max_drawdown_pct,
            total_trades,
            win_rate,
            profit_factor: optional_number(raw, "profit_factor")?.unwrap_or(0.0),
            sharpe: optional_number(raw, "sharpe")?.unwrap_or(0.0),
            expectancy: optional_number(raw, "expectancy")?.unwrap_or(0.0),
            stake_limit_hits,
            avg_trade_duration_hours,
            ..MetricsRecord::default()
        };

        let trades = parse_trades(raw)?;
        if !trades.is_empty() {
            if record.avg_trade_duration_hours == 0.0 {
                record.avg_trade_duration_hours = trades.avg_duration_hours();
            }
            record.apply_settlement(&classify_periods(&trades, &self.settlement));
        }

        Ok(record)
    }
}

/// `Ok(None)` when the field is absent or null, `Err` when present but not
/// a number. Absence falls through to the next link of a chain; garbage
/// never does.
fn optional_number(raw: &Value, field: &'static str) -> Result<Option<f64>, AggregateError> {
    match raw.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_f64() {
            Some(n) => Ok(Some(n)),
            None => Err(AggregateError::Malformed {
                field,
                detail: format!("expected a number, got {v}"),
            }),
        },
    }
}

fn parse_trades(raw: &Value) -> Result<TradeLog, AggregateError> {
    let rows = match raw.get("trades") {
        None | Some(Value::Null) => return Ok(TradeLog::new()),
        Some(v) => v.as_array().ok_or(AggregateError::Malformed {
            field: "trades",
            detail: "expected an array".into(),
        })?,
    };

    let mut log = TradeLog::with_capacity(rows.len());
    let mut skipped = 0usize;
    for row in rows {
        let open = parse_ts(row, "open_ts", "open_date");
        let close = parse_ts(row, "close_ts", "close_date");
        let profit = row
            .get("profit")
            .or_else(|| row.get("profit_abs"))
            .and_then(Value::as_f64);
        match (open, close, profit) {
            (Some(o), Some(c), Some(p)) => log.push(o, c, p),
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "dropped malformed trade rows");
    }
    log.sort_by_close();
    Ok(log)
}

fn parse_ts(row: &Value, num_key: &str, date_key: &str) -> Option<i64> {
    if let Some(ts) = row.get(num_key).and_then(Value::as_i64) {
        return Some(ts);
    }
    parse_datetime(row.get(date_key)?.as_str()?)
}

fn parse_datetime(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|d| d.and_utc().timestamp())
}
