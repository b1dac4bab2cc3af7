use chrono::{DateTime, Utc};

use crate::cron::CronExpr;
use crate::error::TriggerError;
use crate::types::TriggerSpec;

/// Compute the next UTC fire time for `trigger` strictly *after* `after`.
///
/// Returns `Ok(None)` when the trigger is exhausted (a `Date` whose instant
/// has passed, or a combination of exhausted triggers).
pub fn next_fire_time(
    trigger: &TriggerSpec,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, TriggerError> {
    match trigger {
        TriggerSpec::Cron { expression } => expression.parse::<CronExpr>()?.next_after(after),

        TriggerSpec::Date { at } => Ok((*at > after).then_some(*at)),

        TriggerSpec::Combined { triggers } => {
            if triggers.is_empty() {
                return Err(TriggerError::EmptyCombined);
            }
            let mut earliest: Option<DateTime<Utc>> = None;
            for sub in triggers {
                if let Some(t) = next_fire_time(sub, after)? {
                    earliest = Some(earliest.map_or(t, |e| e.min(t)));
                }
            }
            Ok(earliest)
        }
    }
}

/// Check that every part of `trigger` is well formed, without searching.
pub fn validate(trigger: &TriggerSpec) -> Result<(), TriggerError> {
    match trigger {
        TriggerSpec::Cron { expression } => expression.parse::<CronExpr>().map(|_| ()),
        TriggerSpec::Date { .. } => Ok(()),
        TriggerSpec::Combined { triggers } => {
            if triggers.is_empty() {
                return Err(TriggerError::EmptyCombined);
            }
            triggers.iter().try_for_each(validate)
        }
    }
}

/// The next `count` fire times after `after`; shorter if the trigger runs out.
///
/// Used to preview an expression before saving it.
pub fn upcoming(
    trigger: &TriggerSpec,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, TriggerError> {
    let mut out = Vec::with_capacity(count);
    let mut cursor = after;
    while out.len() < count {
        match next_fire_time(trigger, cursor)? {
            Some(t) => {
                out.push(t);
                cursor = t;
            }
            None => break,
        }
    }
    Ok(out)
}
