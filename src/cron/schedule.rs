//! Schedule parsing and next-run computation. Everything evaluates in UTC.

use super::types::Schedule;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule as CronExpr;
use std::str::FromStr;

/// Accept standard 5-field crontab syntax by prepending a seconds field;
/// 6/7-field crate-native syntax passes through.
pub fn normalize_expression(expression: &str) -> Result<String> {
    let expression = expression.trim();
    let field_count = expression.split_whitespace().count();

    match field_count {
        5 => Ok(format!("0 {expression}")),
        6 | 7 => Ok(expression.to_string()),
        _ => anyhow::bail!(
            "Invalid cron expression: {expression} (expected 5, 6, or 7 fields, got {field_count})"
        ),
    }
}

pub fn next_run(schedule: &Schedule, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match schedule {
        Schedule::Cron { expr } => {
            let normalized = normalize_expression(expr)?;
            let parsed = CronExpr::from_str(&normalized)
                .with_context(|| format!("Invalid cron expression: {expr}"))?;
            parsed
                .after(&from)
                .next()
                .ok_or_else(|| anyhow::anyhow!("No future occurrence for expression: {expr}"))
        }
        Schedule::Every { every_ms } => {
            if *every_ms == 0 {
                anyhow::bail!("Invalid schedule: every_ms must be > 0");
            }
            let ms = i64::try_from(*every_ms).context("every_ms is too large")?;
            from.checked_add_signed(ChronoDuration::milliseconds(ms))
                .ok_or_else(|| anyhow::anyhow!("every_ms overflowed DateTime"))
        }
        Schedule::At { at } => Ok(*at),
    }
}

pub fn validate(schedule: &Schedule, now: DateTime<Utc>) -> Result<()> {
    match schedule {
        Schedule::Cron { .. } => {
            let _ = next_run(schedule, now)?;
            Ok(())
        }
        Schedule::Every { every_ms } => {
            if *every_ms == 0 {
                anyhow::bail!("Invalid schedule: every_ms must be > 0");
            }
            Ok(())
        }
        Schedule::At { at } => {
            if *at <= now {
                anyhow::bail!("Invalid schedule: 'at' must be in the future");
            }
            Ok(())
        }
    }
}
