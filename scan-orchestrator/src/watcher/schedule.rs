//! Schedule engine: decides whether a ScanConfig is due in the current window.
//!
//! Cron expressions accept the classic 5-field form, a 6-field form with a
//! trailing year, and the full 7-field form with seconds. Day-of-week values
//! use 0 (or 7) for Sunday.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use scan_api::models::ScanConfig;

use crate::{Error, Result};

/// A `[start, end]` timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl ScheduleWindow {
    /// Window of width `size` centered on `now`.
    pub fn new(now: DateTime<Utc>, size: TimeDelta) -> Self {
        let half = size.abs() / 2;
        Self {
            start: now - half,
            end: now + half,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn size(&self) -> TimeDelta {
        self.end - self.start
    }

    /// True when `t` lies within the window, bounds included.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }

    /// True when the whole window lies before `t`.
    pub fn is_before(&self, t: DateTime<Utc>) -> bool {
        self.end < t
    }

    /// True when the whole window lies after `t`.
    pub fn is_after(&self, t: DateTime<Utc>) -> bool {
        self.start > t
    }

    /// The equally sized window starting where this one ends.
    pub fn next(&self) -> Self {
        let size = self.size();
        Self {
            start: self.end,
            end: self.end + size,
        }
    }

    /// The equally sized window ending where this one starts.
    pub fn prev(&self) -> Self {
        let size = self.size();
        Self {
            start: self.start - size,
            end: self.start,
        }
    }
}

impl fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Parses a cron line into a [`Schedule`].
pub fn parse_cron(line: &str) -> Result<Schedule> {
    let normalized = normalize_cron(line);
    Schedule::from_str(&normalized).map_err(|e| Error::InvalidCron {
        expression: line.to_string(),
        reason: e.to_string(),
    })
}

/// Rewrites a cron line into the 7-field form understood by [`Schedule`].
fn normalize_cron(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.starts_with('@') {
        return trimmed.to_string();
    }

    let mut fields: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
    // 5 fields: no seconds, no year. 6 fields: no seconds, trailing year.
    if matches!(fields.len(), 5 | 6) {
        fields.insert(0, "0".to_string());
    }
    if fields.len() >= 6 {
        fields[5] = normalize_day_of_week(&fields[5]);
    }
    fields.join(" ")
}

/// Maps numeric day-of-week values (Sunday = 0 or 7) onto 1-7 (Sunday = 1).
///
/// Ranges and steps are expanded to explicit lists; anything non-numeric is
/// left untouched.
fn normalize_day_of_week(field: &str) -> String {
    let mut days: Vec<u32> = Vec::new();
    let mut passthrough: Vec<&str> = Vec::new();

    for part in field.split(',') {
        match expand_day_part(part) {
            Some(values) => days.extend(values.into_iter().map(|d| d % 7 + 1)),
            None => passthrough.push(part),
        }
    }

    days.sort_unstable();
    days.dedup();
    let mut out: Vec<String> = passthrough.into_iter().map(str::to_string).collect();
    out.extend(days.into_iter().map(|d| d.to_string()));
    out.join(",")
}

fn expand_day_part(part: &str) -> Option<Vec<u32>> {
    let (base, step) = match part.split_once('/') {
        Some((base, step)) => (base, Some(step.parse::<u32>().ok().filter(|s| *s > 0)?)),
        None => (part, None),
    };
    let (from, to) = match base.split_once('-') {
        Some((from, to)) => (from.parse::<u32>().ok()?, to.parse::<u32>().ok()?),
        None => {
            let from = base.parse::<u32>().ok()?;
            (from, if step.is_some() { 6 } else { from })
        }
    };
    if from > 7 || to > 7 || from > to {
        return None;
    }
    Some((from..=to).step_by(step.unwrap_or(1) as usize).collect())
}

/// First cadence of `cron` at or after `t`.
fn first_at_or_after(cron: &Schedule, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    cron.after(&(t - TimeDelta::seconds(1))).find(|v| *v >= t)
}

/// The single instant a cron yields, if it never fires a second time.
pub fn cron_point_in_time(cron: &Schedule) -> Option<DateTime<Utc>> {
    let mut upcoming = cron.after(&DateTime::<Utc>::UNIX_EPOCH);
    let first = upcoming.next()?;
    match upcoming.next() {
        None => Some(first),
        Some(second) if second == first => Some(first),
        Some(_) => None,
    }
}

/// True when the cron fires at least twice.
pub fn is_cron_recurring(cron: &Schedule) -> bool {
    cron.after(&DateTime::<Utc>::UNIX_EPOCH).take(2).count() == 2
}

/// A timestamp optionally governed by a cron expression.
#[derive(Debug, Clone)]
pub struct OperationTime {
    time: DateTime<Utc>,
    cron: Option<Schedule>,
}

impl OperationTime {
    /// A single point-in-time cron overrides `time`.
    pub fn new(time: DateTime<Utc>, cron: Option<Schedule>) -> Self {
        let time = cron.as_ref().and_then(cron_point_in_time).unwrap_or(time);
        Self { time, cron }
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn cron(&self) -> Option<&Schedule> {
        self.cron.as_ref()
    }

    /// The next cadence after the current time, or an unchanged copy.
    pub fn next(&self) -> Self {
        let time = self
            .cron
            .as_ref()
            .and_then(|cron| cron.after(&self.time).next())
            .unwrap_or(self.time);
        Self {
            time,
            cron: self.cron.clone(),
        }
    }

    /// The first cadence at or after `t`.
    ///
    /// Returns an unchanged copy when there is no cron or `t` is not after the
    /// current time. A cron that runs out before `t` stops at its last value.
    pub fn next_after(&self, t: DateTime<Utc>) -> Self {
        let Some(cron) = &self.cron else {
            return self.clone();
        };
        if t <= self.time {
            return self.clone();
        }

        let time = first_at_or_after(cron, t).unwrap_or_else(|| {
            cron.after(&self.time)
                .take_while(|v| *v < t)
                .last()
                .unwrap_or(self.time)
        });
        Self {
            time,
            cron: self.cron.clone(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.next().time != self.time
    }
}

/// Classification of a ScanConfig against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ScheduleState {
    Disabled,
    Unscheduled,
    NotDue,
    Due,
    Overdue,
}

/// Schedule of one ScanConfig evaluated against one window.
#[derive(Debug, Clone)]
pub struct ScanConfigSchedule {
    pub state: ScheduleState,
    pub operation_time: Option<OperationTime>,
    pub window: Option<ScheduleWindow>,
}

impl ScanConfigSchedule {
    pub fn new(config: &ScanConfig, window: ScheduleWindow) -> Result<Self> {
        if config.is_disabled() {
            return Ok(Self::unresolved(ScheduleState::Disabled));
        }

        let cron_line = config.cron_line();
        let explicit = config.operation_time();
        if cron_line.is_none() && explicit.is_none() {
            return Ok(Self::unresolved(ScheduleState::Unscheduled));
        }

        let cron = cron_line.map(parse_cron).transpose()?;
        let time = match (explicit, &cron) {
            (Some(time), _) => time,
            // Recurring cron without a stored time: start from the current window.
            (None, Some(cron)) => first_at_or_after(cron, window.start())
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            (None, None) => DateTime::<Utc>::UNIX_EPOCH,
        };
        let operation_time = OperationTime::new(time, cron);

        let state = if window.contains(operation_time.time()) {
            ScheduleState::Due
        } else if window.is_after(operation_time.time()) {
            if operation_time.is_recurring() {
                ScheduleState::Overdue
            } else {
                ScheduleState::Unscheduled
            }
        } else {
            ScheduleState::NotDue
        };

        Ok(Self {
            state,
            operation_time: Some(operation_time),
            window: Some(window),
        })
    }

    fn unresolved(state: ScheduleState) -> Self {
        Self {
            state,
            operation_time: None,
            window: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scan_api::models::RuntimeScheduleScanConfig;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn scheduled(cron_line: Option<&str>, time: Option<DateTime<Utc>>) -> ScanConfig {
        ScanConfig {
            scheduled: Some(RuntimeScheduleScanConfig {
                cron_line: cron_line.map(str::to_string),
                operation_time: time,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("0 2 * * *"), "0 0 2 * * *");
        assert_eq!(normalize_cron("0 11 17 5 * 2023"), "0 0 11 17 5 * 2023");
        assert_eq!(normalize_cron("0 0 11 * * * *"), "0 0 11 * * * *");
        assert_eq!(normalize_cron("0 9 * * 1-5"), "0 0 9 * * 2,3,4,5,6");
        assert_eq!(normalize_cron("0 9 * * 0"), "0 0 9 * * 1");
        assert_eq!(normalize_cron("0 9 * * 7"), "0 0 9 * * 1");
        assert_eq!(normalize_cron("0 9 * * MON"), "0 0 9 * * MON");
        assert_eq!(normalize_cron("@daily"), "@daily");
    }

    #[test]
    fn test_day_of_week_steps() {
        assert_eq!(normalize_day_of_week("*/2"), "*/2");
        assert_eq!(normalize_day_of_week("0/2"), "1,3,5,7");
        assert_eq!(normalize_day_of_week("0-7"), "1,2,3,4,5,6,7");
        assert_eq!(normalize_day_of_week("?"), "?");
    }

    #[test]
    fn test_parse_cron_error() {
        let err = parse_cron("not a cron").unwrap_err();
        assert!(matches!(err, Error::InvalidCron { .. }));
    }

    #[test]
    fn test_schedule_window() {
        let window = ScheduleWindow::new(at(2023, 5, 17, 10, 10), TimeDelta::minutes(6));

        assert!(window.contains(at(2023, 5, 17, 10, 10)));
        assert_eq!(window.start(), at(2023, 5, 17, 10, 7));
        assert_eq!(window.end(), at(2023, 5, 17, 10, 13));
        assert_eq!(window.next().start(), at(2023, 5, 17, 10, 13));
        assert_eq!(window.next().end(), at(2023, 5, 17, 10, 19));
        assert_eq!(window.prev().end(), window.start());
        assert_eq!(window.prev().size(), window.size());
        assert!(window.is_before(at(2023, 5, 17, 10, 14)));
        assert!(window.is_after(at(2023, 5, 17, 10, 6)));
    }

    #[test]
    fn test_window_contains_center() {
        let now = Utc::now();
        for secs in [1, 2, 30, 3600] {
            let window = ScheduleWindow::new(now, TimeDelta::seconds(secs));
            assert!(window.contains(now));
            assert_eq!(window.next().start(), window.end());
            assert_eq!(window.prev().end(), window.start());
        }
    }

    #[test]
    fn test_operation_time_without_cron() {
        let op = OperationTime::new(at(2023, 5, 17, 10, 0), None);
        assert_eq!(op.time(), at(2023, 5, 17, 10, 0));
        assert_eq!(op.next().time(), at(2023, 5, 17, 10, 0));
        assert_eq!(op.next_after(at(2023, 5, 17, 12, 0)).time(), at(2023, 5, 17, 10, 0));
        assert!(!op.is_recurring());
    }

    #[test]
    fn test_operation_time_point_in_time_cron() {
        let cron = parse_cron("0 11 17 5 * 2024").unwrap();
        let op = OperationTime::new(at(2023, 5, 17, 10, 0), Some(cron));
        assert_eq!(op.time(), at(2024, 5, 17, 11, 0));
        assert_eq!(op.next().time(), at(2024, 5, 17, 11, 0));
        assert_eq!(op.next_after(at(2023, 5, 17, 12, 0)).time(), at(2024, 5, 17, 11, 0));
        assert!(!op.is_recurring());
    }

    #[test]
    fn test_operation_time_hourly_cron() {
        let cron = parse_cron("0 11 * * * *").unwrap();
        let op = OperationTime::new(at(2023, 5, 17, 10, 0), Some(cron));
        assert_eq!(op.time(), at(2023, 5, 17, 10, 0));
        assert_eq!(op.next().time(), at(2023, 5, 17, 11, 0));
        assert_eq!(op.next_after(at(2023, 5, 18, 12, 0)).time(), at(2023, 5, 19, 11, 0));
        assert!(op.is_recurring());
    }

    #[test]
    fn test_operation_time_step_cron() {
        let cron = parse_cron("0 */8 * * * *").unwrap();
        let op = OperationTime::new(at(2023, 5, 17, 10, 0), Some(cron));
        assert_eq!(op.next().time(), at(2023, 5, 17, 16, 0));
        assert_eq!(op.next_after(at(2023, 5, 18, 12, 0)).time(), at(2023, 5, 18, 16, 0));
        assert!(op.is_recurring());
    }

    #[test]
    fn test_next_after_lands_on_cadence() {
        let cron = parse_cron("0 * * * *").unwrap();
        let op = OperationTime::new(at(2023, 5, 17, 10, 0), Some(cron));
        assert_eq!(op.next_after(at(2023, 5, 17, 13, 0)).time(), at(2023, 5, 17, 13, 0));
    }

    #[test]
    fn test_cron_helpers() {
        let future = parse_cron("0 11 17 5 * 2024").unwrap();
        assert_eq!(cron_point_in_time(&future), Some(at(2024, 5, 17, 11, 0)));
        assert!(!is_cron_recurring(&future));

        let past = parse_cron("0 11 17 5 * 2022").unwrap();
        assert_eq!(past.after(&at(2023, 5, 17, 10, 10)).next(), None);
        assert_eq!(cron_point_in_time(&past), Some(at(2022, 5, 17, 11, 0)));

        let recurring = parse_cron("0 */2 * * *").unwrap();
        assert_eq!(
            recurring.after(&at(2023, 5, 17, 10, 10)).next(),
            Some(at(2023, 5, 17, 12, 0))
        );
        assert_eq!(cron_point_in_time(&recurring), None);
        assert!(is_cron_recurring(&recurring));
    }

    #[test]
    fn test_schedule_disabled() {
        let mut config = scheduled(Some("0 2 * * *"), Some(Utc::now()));
        config.disabled = Some(true);
        let window = ScheduleWindow::new(Utc::now(), TimeDelta::minutes(5));

        let schedule = ScanConfigSchedule::new(&config, window).unwrap();
        assert_eq!(schedule.state, ScheduleState::Disabled);
        assert!(schedule.operation_time.is_none());
        assert!(schedule.window.is_none());
    }

    #[test]
    fn test_schedule_unscheduled_without_schedule() {
        let window = ScheduleWindow::new(Utc::now(), TimeDelta::minutes(5));

        let schedule = ScanConfigSchedule::new(&ScanConfig::default(), window).unwrap();
        assert_eq!(schedule.state, ScheduleState::Unscheduled);

        let schedule = ScanConfigSchedule::new(&scheduled(None, None), window).unwrap();
        assert_eq!(schedule.state, ScheduleState::Unscheduled);
        assert!(schedule.operation_time.is_none());

        let schedule = ScanConfigSchedule::new(&scheduled(Some("  "), None), window).unwrap();
        assert_eq!(schedule.state, ScheduleState::Unscheduled);
    }

    #[test]
    fn test_schedule_states() {
        let center = at(2023, 5, 17, 11, 0);
        let window = ScheduleWindow::new(center, TimeDelta::minutes(5));
        let cases = [
            (None, Some(center), ScheduleState::Due),
            (Some("0 11 17 5 * 2023"), Some(center), ScheduleState::Due),
            (Some("0 2 * * *"), Some(at(2023, 4, 17, 11, 0)), ScheduleState::Overdue),
            (None, Some(at(2023, 4, 17, 11, 0)), ScheduleState::Unscheduled),
            (None, Some(at(2023, 6, 17, 11, 0)), ScheduleState::NotDue),
            (Some("0 2 * * *"), Some(at(2023, 5, 17, 12, 0)), ScheduleState::NotDue),
        ];

        for (cron_line, time, expected) in cases {
            let schedule = ScanConfigSchedule::new(&scheduled(cron_line, time), window).unwrap();
            assert_eq!(schedule.state, expected, "cron={cron_line:?} time={time:?}");
            assert!(schedule.operation_time.is_some());
            assert_eq!(schedule.window, Some(window));
        }
    }

    #[test]
    fn test_one_shot_cron_expires() {
        let config = scheduled(Some("0 11 17 5 * 2023"), None);

        let due = ScheduleWindow::new(at(2023, 5, 17, 11, 0), TimeDelta::minutes(10));
        let schedule = ScanConfigSchedule::new(&config, due).unwrap();
        assert_eq!(schedule.state, ScheduleState::Due);

        let later = ScheduleWindow::new(at(2023, 5, 18, 11, 0), TimeDelta::minutes(10));
        let schedule = ScanConfigSchedule::new(&config, later).unwrap();
        assert_eq!(schedule.state, ScheduleState::Unscheduled);
    }

    #[test]
    fn test_recurring_cron_without_time() {
        let config = scheduled(Some("*/5 * * * *"), None);
        let window = ScheduleWindow::new(at(2023, 5, 17, 11, 0), TimeDelta::seconds(30));

        let schedule = ScanConfigSchedule::new(&config, window).unwrap();
        assert_eq!(schedule.state, ScheduleState::Due);

        let window = ScheduleWindow::new(at(2023, 5, 17, 11, 2), TimeDelta::seconds(30));
        let schedule = ScanConfigSchedule::new(&config, window).unwrap();
        assert_eq!(schedule.state, ScheduleState::NotDue);
        assert_eq!(
            schedule.operation_time.map(|op| op.time()),
            Some(at(2023, 5, 17, 11, 5))
        );
    }

    #[test]
    fn test_invalid_cron_is_error() {
        let window = ScheduleWindow::new(Utc::now(), TimeDelta::minutes(5));
        let result = ScanConfigSchedule::new(&scheduled(Some("61 * * * *"), None), window);
        assert!(matches!(result, Err(Error::InvalidCron { .. })));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ScheduleState::NotDue.to_string(), "NotDue");
        assert_eq!(ScheduleState::Overdue.to_string(), "Overdue");
    }
}
