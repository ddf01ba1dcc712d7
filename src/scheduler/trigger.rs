//! Cron triggers.
//!
//! Accepts 5-field cron (`minute hour day month weekday`), 6/7-field cron with
//! a leading seconds field, and the `@yearly`, `@monthly`, `@weekly`,
//! `@daily` and `@hourly` shortcuts.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ChronosError, Result};

/// A parsed cron schedule that remembers its source expression.
#[derive(Debug, Clone)]
pub struct Trigger {
    expression: String,
    schedule: Box<Schedule>,
}

impl Trigger {
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = Self::normalize(expression.trim())?;
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| ChronosError::InvalidSchedule(format!("{}: {}", expression, e)))?;

        Ok(Self {
            expression: expression.trim().to_string(),
            schedule: Box::new(schedule),
        })
    }

    fn normalize(expression: &str) -> Result<String> {
        if expression.starts_with('@') {
            let expanded = match expression.to_lowercase().as_str() {
                "@yearly" | "@annually" => "0 0 0 1 1 *",
                "@monthly" => "0 0 0 1 * *",
                "@weekly" => "0 0 0 * * SUN",
                "@daily" | "@midnight" => "0 0 0 * * *",
                "@hourly" => "0 0 * * * *",
                _ => {
                    return Err(ChronosError::InvalidSchedule(format!(
                        "unknown shortcut: {}",
                        expression
                    )))
                }
            };
            return Ok(expanded.to_string());
        }

        match expression.split_whitespace().count() {
            5 => {
                let fields: Vec<&str> = expression.split_whitespace().collect();
                Ok(format!(
                    "0 {} {} {} {} {}",
                    fields[0],
                    fields[1],
                    fields[2],
                    fields[3],
                    standard_weekdays(fields[4])?
                ))
            }
            6 | 7 => Ok(expression.to_string()),
            n => Err(ChronosError::InvalidSchedule(format!(
                "{}: expected 5, 6 or 7 fields, got {}",
                expression, n
            ))),
        }
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// The next `n` occurrences strictly after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&after).take(n).collect()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Rewrite a standard cron weekday field, where 0 and 7 are Sunday, into the
/// 1 = Sunday numbering of [`Schedule`]. Numeric items are expanded to lists;
/// names, `*` and `*/n` pass through unchanged.
fn standard_weekdays(field: &str) -> Result<String> {
    let invalid = || ChronosError::InvalidSchedule(format!("invalid weekday field: {}", field));

    let mut days = Vec::new();
    for item in field.split(',') {
        if !item
            .chars()
            .all(|c| c.is_ascii_digit() || c == '-' || c == '/')
        {
            days.push(item.to_string());
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step.parse::<u32>().map_err(|_| invalid())?)),
            None => (item, None),
        };
        let (first, last): (u32, u32) = match range.split_once('-') {
            Some((first, last)) => (
                first.parse().map_err(|_| invalid())?,
                last.parse().map_err(|_| invalid())?,
            ),
            None => {
                let day: u32 = range.parse().map_err(|_| invalid())?;
                // `n/step` runs to the end of the week
                (day, if step.is_some() { 6 } else { day })
            }
        };
        let step = step.unwrap_or(1);
        if step == 0 || first > last || last > 7 {
            return Err(invalid());
        }

        for day in (first..=last).step_by(step as usize) {
            let shifted = (day % 7 + 1).to_string();
            if !days.contains(&shifted) {
                days.push(shifted);
            }
        }
    }
    Ok(days.join(","))
}

impl PartialEq for Trigger {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for Trigger {}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.expression)
    }
}

// Triggers travel as their expression and are re-parsed on arrival.
impl Serialize for Trigger {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for Trigger {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let expression = String::deserialize(deserializer)?;
        Trigger::parse(&expression).map_err(serde::de::Error::custom)
    }
}
