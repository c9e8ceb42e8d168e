use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;

use crate::error::IndexerError;

const PRESETS: [(&str, &str); 3] = [
    ("@hourly", "0 * * * *"),
    ("@daily", "0 2 * * *"),
    ("@weekly", "0 2 * * 0"),
];

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

const SEARCH_HORIZON_DAYS: i64 = 5 * 366;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Field {
    bits: u64,
    // false when the field was written starting with '*'
    restricted: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

struct FieldDef {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    // numeric value of names[0]
    names_base: u32,
}

const MINUTE: FieldDef = FieldDef { name: "minute", min: 0, max: 59, names: &[], names_base: 0 };
const HOUR: FieldDef = FieldDef { name: "hour", min: 0, max: 23, names: &[], names_base: 0 };
const DAY_OF_MONTH: FieldDef =
    FieldDef { name: "day-of-month", min: 1, max: 31, names: &[], names_base: 0 };
const MONTH: FieldDef =
    FieldDef { name: "month", min: 1, max: 12, names: &MONTH_NAMES, names_base: 1 };
const DAY_OF_WEEK: FieldDef =
    FieldDef { name: "day-of-week", min: 0, max: 7, names: &DAY_NAMES, names_base: 0 };

/// A parsed five-field cron expression (or one of the `@` presets)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, IndexerError> {
        let trimmed = expression.trim();
        let expanded = if trimmed.starts_with('@') {
            let lower = trimmed.to_ascii_lowercase();
            PRESETS
                .iter()
                .find(|(preset, _)| *preset == lower)
                .map(|(_, cron)| *cron)
                .ok_or_else(|| invalid(expression, "unknown preset (use @hourly, @daily or @weekly)"))?
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let mut days_of_week = parse_field(expression, fields[4], &DAY_OF_WEEK)?;
        // 7 is an alias for Sunday
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1u64 << 7)) | 1;
        }

        Ok(CronSchedule {
            expression: trimmed.to_owned(),
            minutes: parse_field(expression, fields[0], &MINUTE)?,
            hours: parse_field(expression, fields[1], &HOUR)?,
            days_of_month: parse_field(expression, fields[2], &DAY_OF_MONTH)?,
            months: parse_field(expression, fields[3], &MONTH)?,
            days_of_week,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());

        if self.days_of_month.restricted && self.days_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First matching minute strictly after `from`, with the fields read as
    /// wall-clock time in `tz`. Local times that do not exist (DST gap) are
    /// skipped; a repeated local time fires once, at its earliest instant.
    pub fn next_after(&self, from: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>, IndexerError> {
        let local = from.with_timezone(&tz).naive_local();
        let mut t = start_of_minute(local) + Duration::minutes(1);
        let horizon = t + Duration::days(SEARCH_HORIZON_DAYS);

        while t <= horizon {
            if !self.months.contains(t.month()) {
                match first_of_next_month(t) {
                    Some(next) => t = next,
                    None => break,
                }
                continue;
            }
            if !self.day_matches(t.date()) {
                match t.date().succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0)) {
                    Some(next) => t = next,
                    None => break,
                }
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = start_of_hour(t) + Duration::hours(1);
                continue;
            }
            if self.minutes.contains(t.minute()) {
                let candidate = match tz.from_local_datetime(&t) {
                    LocalResult::Single(dt) => Some(dt),
                    // A repeated wall-clock time fires once, at its first occurrence
                    LocalResult::Ambiguous(earliest, _) => Some(earliest),
                    LocalResult::None => None,
                };
                if let Some(dt) = candidate {
                    let utc = dt.with_timezone(&Utc);
                    if utc > from {
                        return Ok(utc);
                    }
                }
            }
            t += Duration::minutes(1);
        }

        Err(invalid(
            &self.expression,
            "no matching time within the next 5 years",
        ))
    }
}

/// Next fire time, as a Unix timestamp, for `expression` evaluated in the
/// named timezone after the Unix timestamp `after`.
pub fn next_run_timestamp(
    expression: &str,
    timezone: &str,
    after: i64,
) -> Result<i64, IndexerError> {
    let schedule = CronSchedule::parse(expression)?;
    let tz = parse_timezone(timezone)?;
    let from = DateTime::<Utc>::from_timestamp(after, 0)
        .ok_or_else(|| IndexerError::Error(format!("Timestamp out of range: {}", after)))?;
    Ok(schedule.next_after(from, tz)?.timestamp())
}

pub fn parse_timezone(name: &str) -> Result<Tz, IndexerError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| IndexerError::InvalidSource(format!("Unknown timezone '{}'", name)))
}

fn invalid(expr: &str, reason: impl Into<String>) -> IndexerError {
    IndexerError::InvalidSchedule {
        expr: expr.to_owned(),
        reason: reason.into(),
    }
}

fn start_of_minute(t: NaiveDateTime) -> NaiveDateTime {
    t - Duration::seconds(t.second() as i64) - Duration::nanoseconds(t.nanosecond() as i64)
}

fn start_of_hour(t: NaiveDateTime) -> NaiveDateTime {
    start_of_minute(t) - Duration::minutes(t.minute() as i64)
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_value(expr: &str, text: &str, def: &FieldDef) -> Result<u32, IndexerError> {
    let lower = text.to_ascii_lowercase();
    if let Some(pos) = def.names.iter().position(|name| *name == lower) {
        return Ok(def.names_base + pos as u32);
    }

    let value: u32 = text
        .parse()
        .map_err(|_| invalid(expr, format!("'{}' is not a valid {}", text, def.name)))?;
    if value < def.min || value > def.max {
        return Err(invalid(
            expr,
            format!(
                "{} {} is out of range {}-{}",
                def.name, value, def.min, def.max
            ),
        ));
    }
    Ok(value)
}

fn parse_field(expr: &str, text: &str, def: &FieldDef) -> Result<Field, IndexerError> {
    let mut bits = 0u64;

    for item in text.split(',') {
        if item.is_empty() {
            return Err(invalid(expr, format!("empty list entry in {}", def.name)));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(expr, format!("bad step '{}' in {}", step, def.name)))?;
                if step == 0 {
                    return Err(invalid(expr, format!("step of 0 in {}", def.name)));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (low, high) = if range == "*" {
            (def.min, def.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let low = parse_value(expr, a, def)?;
            let high = parse_value(expr, b, def)?;
            if low > high {
                return Err(invalid(
                    expr,
                    format!("range {} is backwards in {}", range, def.name),
                ));
            }
            (low, high)
        } else {
            let value = parse_value(expr, range, def)?;
            match step {
                Some(_) => (value, def.max),
                None => (value, value),
            }
        };

        let step = step.unwrap_or(1) as usize;
        for value in (low..=high).step_by(step) {
            bits |= 1u64 << value;
        }
    }

    Ok(Field {
        bits,
        restricted: !text.starts_with('*'),
    })
}
