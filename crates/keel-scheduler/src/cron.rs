//! Cron expression parser and forward search.
//!
//! An expression is parsed once into a [`CronExpr`]: one explicit value set
//! per field. Evaluation never looks at the source text again.
//!
//! # Accepted forms
//!
//! | Fields | Layout                                         |
//! |--------|------------------------------------------------|
//! | 5      | `minute hour day-of-month month day-of-week`   |
//! | 6      | `second` + the five above                      |
//! | 7      | the six above + `year`                         |
//!
//! Each field accepts `*`, lists (`1,5`), ranges (`1-5`), steps (`*/15`,
//! `10-40/10`, `5/20`) and, for month and weekday, three-letter names.
//! Day-of-month and day-of-week also accept `?` (no restriction).
//! Day-of-month accepts `L` (last day). Day-of-week accepts `5L` (last Friday
//! of the month) and `5#3` (third Friday). Weekdays are 0-7, 0 and 7 being
//! Sunday.
//!
//! When both day fields are restricted a day matches if either one does.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};

use crate::error::TriggerError;

/// How far ahead the search looks before declaring an expression unsatisfiable.
pub const SEARCH_HORIZON_YEARS: i64 = 5;

const MONTH_NAMES: &[(&str, u32)] = &[
    ("JAN", 1),
    ("FEB", 2),
    ("MAR", 3),
    ("APR", 4),
    ("MAY", 5),
    ("JUN", 6),
    ("JUL", 7),
    ("AUG", 8),
    ("SEP", 9),
    ("OCT", 10),
    ("NOV", 11),
    ("DEC", 12),
];

const WEEKDAY_NAMES: &[(&str, u32)] = &[
    ("SUN", 0),
    ("MON", 1),
    ("TUE", 2),
    ("WED", 3),
    ("THU", 4),
    ("FRI", 5),
    ("SAT", 6),
];

/// Allowed values of a small numeric field; bit `n` set means `n` matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueSet(u64);

impl ValueSet {
    pub fn contains(&self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }

    fn from_values(values: &[u32]) -> Self {
        let mut set = ValueSet::default();
        for v in values {
            set.insert(*v);
        }
        set
    }
}

/// Seconds, minutes, hours and months.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Any,
    Values(ValueSet),
}

impl Field {
    pub fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Values(set) => set.contains(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayOfMonth {
    Any,
    Days(ValueSet),
    /// `L`: the last day of the month.
    LastDay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayOfWeek {
    Any,
    /// Weekday numbers, 0 = Sunday.
    Days(ValueSet),
    /// `d#n`: the n-th occurrence of weekday `d` in the month.
    Nth { weekday: u32, nth: u32 },
    /// `dL`: the last occurrence of weekday `d` in the month.
    Last { weekday: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Years {
    Any,
    Values(BTreeSet<i32>),
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    pub seconds: Field,
    pub minutes: Field,
    pub hours: Field,
    pub day_of_month: DayOfMonth,
    pub months: Field,
    pub day_of_week: DayOfWeek,
    pub years: Years,
}

impl FromStr for CronExpr {
    type Err = TriggerError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| TriggerError::InvalidExpression {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (sec, rest, year) = match fields.len() {
            5 => ("0", &fields[..], None),
            6 => (fields[0], &fields[1..], None),
            7 => (fields[0], &fields[1..6], Some(fields[6])),
            n => return Err(invalid(format!("expected 5, 6 or 7 fields, got {n}"))),
        };

        Ok(CronExpr {
            source: expression.trim().to_string(),
            seconds: parse_field(sec, 0, 59, &[]).map_err(|e| invalid(format!("second: {e}")))?,
            minutes: parse_field(rest[0], 0, 59, &[]).map_err(|e| invalid(format!("minute: {e}")))?,
            hours: parse_field(rest[1], 0, 23, &[]).map_err(|e| invalid(format!("hour: {e}")))?,
            day_of_month: parse_day_of_month(rest[2])
                .map_err(|e| invalid(format!("day-of-month: {e}")))?,
            months: parse_field(rest[3], 1, 12, MONTH_NAMES)
                .map_err(|e| invalid(format!("month: {e}")))?,
            day_of_week: parse_day_of_week(rest[4])
                .map_err(|e| invalid(format!("day-of-week: {e}")))?,
            years: match year {
                None => Years::Any,
                Some(y) => parse_years(y).map_err(|e| invalid(format!("year: {e}")))?,
            },
        })
    }
}

impl CronExpr {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// First matching instant strictly after `after`, at whole-second precision.
    ///
    /// `Ok(None)` means the expression is exhausted (its year list lies in the
    /// past). `Unsatisfiable` means nothing matched within the horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, TriggerError> {
        let unsatisfiable = || TriggerError::Unsatisfiable {
            expression: self.source.clone(),
        };
        let start = DateTime::<Utc>::from_timestamp(after.timestamp() + 1, 0)
            .ok_or_else(unsatisfiable)?
            .naive_utc();
        let horizon = start + Duration::days(366 * SEARCH_HORIZON_YEARS);

        let mut t = start;
        while t <= horizon {
            if let Years::Values(years) = &self.years {
                match years.range(t.year()..).next() {
                    None => return Ok(None),
                    Some(&y) if y != t.year() => {
                        t = midnight(y, 1, 1).ok_or_else(unsatisfiable)?;
                        continue;
                    }
                    Some(_) => {}
                }
            }
            if !self.months.matches(t.month()) {
                t = first_of_next_month(t).ok_or_else(unsatisfiable)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().and_hms_opt(0, 0, 0).ok_or_else(unsatisfiable)? + Duration::days(1);
                continue;
            }
            if !self.hours.matches(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0).ok_or_else(unsatisfiable)?
                    + Duration::hours(1);
                continue;
            }
            if !self.minutes.matches(t.minute()) {
                t = t
                    .date()
                    .and_hms_opt(t.hour(), t.minute(), 0)
                    .ok_or_else(unsatisfiable)?
                    + Duration::minutes(1);
                continue;
            }
            if !self.seconds.matches(t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Ok(Some(t.and_utc()));
        }

        Err(unsatisfiable())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom_any = matches!(self.day_of_month, DayOfMonth::Any);
        let dow_any = matches!(self.day_of_week, DayOfWeek::Any);
        match (dom_any, dow_any) {
            (true, true) => true,
            (false, true) => self.day_of_month_matches(date),
            (true, false) => self.day_of_week_matches(date),
            (false, false) => self.day_of_month_matches(date) || self.day_of_week_matches(date),
        }
    }

    fn day_of_month_matches(&self, date: NaiveDate) -> bool {
        match &self.day_of_month {
            DayOfMonth::Any => true,
            DayOfMonth::Days(set) => set.contains(date.day()),
            DayOfMonth::LastDay => date.day() == days_in_month(date.year(), date.month()),
        }
    }

    fn day_of_week_matches(&self, date: NaiveDate) -> bool {
        let weekday = date.weekday().num_days_from_sunday();
        match &self.day_of_week {
            DayOfWeek::Any => true,
            DayOfWeek::Days(set) => set.contains(weekday),
            DayOfWeek::Nth { weekday: w, nth } => weekday == *w && (date.day() - 1) / 7 + 1 == *nth,
            DayOfWeek::Last { weekday: w } => {
                weekday == *w && date.day() + 7 > days_in_month(date.year(), date.month())
            }
        }
    }
}

fn midnight(year: i32, month: u32, day: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    if t.month() == 12 {
        midnight(t.year() + 1, 1, 1)
    } else {
        midnight(t.year(), t.month() + 1, 1)
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

fn parse_field(token: &str, min: u32, max: u32, names: &[(&str, u32)]) -> Result<Field, String> {
    if token == "*" {
        return Ok(Field::Any);
    }
    let values = parse_list(token, min, max, max, names)?;
    Ok(Field::Values(ValueSet::from_values(&values)))
}

fn parse_day_of_month(token: &str) -> Result<DayOfMonth, String> {
    match token {
        "*" | "?" => Ok(DayOfMonth::Any),
        "L" => Ok(DayOfMonth::LastDay),
        _ => {
            let values = parse_list(token, 1, 31, 31, &[])?;
            Ok(DayOfMonth::Days(ValueSet::from_values(&values)))
        }
    }
}

fn parse_day_of_week(token: &str) -> Result<DayOfWeek, String> {
    let upper = token.to_ascii_uppercase();
    if upper == "*" || upper == "?" {
        return Ok(DayOfWeek::Any);
    }
    if let Some((day, nth)) = upper.split_once('#') {
        let weekday = parse_value(day, 0, 7, WEEKDAY_NAMES)? % 7;
        let nth: u32 = nth
            .parse()
            .map_err(|_| format!("invalid occurrence `{nth}`"))?;
        if !(1..=5).contains(&nth) {
            return Err(format!("occurrence {nth} out of range 1-5"));
        }
        return Ok(DayOfWeek::Nth { weekday, nth });
    }
    if let Some(day) = upper.strip_suffix('L') {
        if day.is_empty() {
            return Err("`L` needs a weekday, e.g. `5L`".to_string());
        }
        let weekday = parse_value(day, 0, 7, WEEKDAY_NAMES)? % 7;
        return Ok(DayOfWeek::Last { weekday });
    }

    // `*` expands to 0-6 so a step over it never yields the duplicate 7.
    let mut set = ValueSet::default();
    for v in parse_list(&upper, 0, 7, 6, WEEKDAY_NAMES)? {
        set.insert(v % 7);
    }
    Ok(DayOfWeek::Days(set))
}

fn parse_years(token: &str) -> Result<Years, String> {
    if token == "*" {
        return Ok(Years::Any);
    }
    let values = parse_list(token, 1970, 2099, 2099, &[])?;
    Ok(Years::Values(values.into_iter().map(|y| y as i32).collect()))
}

/// Expand a comma-separated list of values, ranges and steps.
///
/// `star_max` is the upper end `*` expands to, which differs from `max` only
/// for day-of-week.
fn parse_list(
    token: &str,
    min: u32,
    max: u32,
    star_max: u32,
    names: &[(&str, u32)],
) -> Result<Vec<u32>, String> {
    let mut out = BTreeSet::new();
    for part in token.split(',') {
        if part.is_empty() {
            return Err(format!("empty list element in `{token}`"));
        }
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| format!("invalid step `{s}`"))?;
                if step == 0 {
                    return Err("step must be greater than zero".to_string());
                }
                (r, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, star_max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, max, names)?, parse_value(b, min, max, names)?)
        } else {
            let v = parse_value(range, min, max, names)?;
            // `5/20` means "from 5 to the end, every 20"
            if step.is_some() {
                (v, max)
            } else {
                (v, v)
            }
        };
        if lo > hi {
            return Err(format!("range start {lo} is greater than end {hi}"));
        }
        out.extend((lo..=hi).step_by(step.unwrap_or(1) as usize));
    }
    Ok(out.into_iter().collect())
}

fn parse_value(token: &str, min: u32, max: u32, names: &[(&str, u32)]) -> Result<u32, String> {
    let upper = token.to_ascii_uppercase();
    let value = match names.iter().find(|(name, _)| *name == upper) {
        Some((_, v)) => *v,
        None => token
            .parse::<u32>()
            .map_err(|_| format!("invalid value `{token}`"))?,
    };
    if value < min || value > max {
        return Err(format!("value {value} out of range {min}-{max}"));
    }
    Ok(value)
}
