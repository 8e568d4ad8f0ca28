use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Agent;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
        }
    }
}

/// Reads a positive whole number of days from `options[key]`, accepting
/// either a JSON number or a numeric string.
pub fn period_in_days(options: &Value, key: &str) -> Option<i64> {
    let days = match options.get(key)? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    (days > 0).then_some(days)
}

fn within(stamp: Option<DateTime<Utc>>, days: i64, now: DateTime<Utc>) -> bool {
    stamp.is_some_and(|at| at > now - Duration::days(days))
}

/// Default `working?` derivation: valid options, failure count under the
/// threshold, and recent enough activity for whichever expected period the
/// agent declares.
pub fn default_working(
    agent: &Agent,
    option_errors: &[String],
    policy: &HealthPolicy,
    now: DateTime<Utc>,
) -> bool {
    if !option_errors.is_empty() || agent.disabled {
        return false;
    }
    if agent.consecutive_failures >= policy.failure_threshold {
        return false;
    }

    if let Some(days) = period_in_days(&agent.options, "expected_receive_period_in_days") {
        return within(agent.last_receive_at, days, now);
    }
    if let Some(days) = period_in_days(&agent.options, "expected_update_period_in_days") {
        return within(agent.last_event_at, days, now);
    }
    true
}
