//! Time-clock reconciliation.
//!
//! Sessions are stored one row per clock-in. Everything here is pure: callers
//! pass the sessions and the current instant, which keeps the arithmetic
//! testable without a database or a clock.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use derive_more::Display;
use serde::Serialize;
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::model::time_entry::TimeEntry;

/// Widest range accepted by listing and reporting endpoints.
pub const MAX_RANGE_DAYS: i64 = 93;

#[derive(Debug, Display, PartialEq, Eq)]
pub enum ClockError {
    #[display(fmt = "Already clocked in")]
    AlreadyActive,
    #[display(fmt = "No active clock-in found")]
    NotActive,
    #[display(fmt = "Break already running")]
    AlreadyOnBreak,
    #[display(fmt = "No break is running")]
    NotOnBreak,
    #[display(fmt = "Clock-out must be after clock-in")]
    OutBeforeIn,
    #[display(fmt = "'from' must not be after 'to'")]
    InvertedRange,
    #[display(fmt = "Range cannot exceed {} days", MAX_RANGE_DAYS)]
    RangeTooWide,
}

impl From<ClockError> for ApiError {
    fn from(e: ClockError) -> Self {
        match e {
            ClockError::AlreadyActive => ApiError::conflict(e.to_string()),
            _ => ApiError::bad_request(e.to_string()),
        }
    }
}

/// All sessions of one user on one calendar day, combined.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MergedEntry {
    pub user_id: u64,
    #[schema(value_type = String, format = "date")]
    pub work_date: NaiveDate,
    #[schema(value_type = String, format = "date-time")]
    pub first_in: DateTime<Utc>,
    /// Latest clock-out; absent while any session of the day is open
    #[schema(value_type = Option<String>, format = "date-time")]
    pub last_out: Option<DateTime<Utc>>,
    pub sessions: usize,
    pub worked_seconds: i64,
    pub break_seconds: i64,
    #[schema(example = 7.75)]
    pub total_hours: f64,
    pub is_active: bool,
    pub on_break: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct UserSummary {
    pub user_id: u64,
    pub days_worked: usize,
    pub total_seconds: i64,
    pub total_hours: f64,
    pub average_hours: f64,
}

/// Calendar day of `instant` in the business's local offset.
pub fn work_date_for(instant: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    instant.with_timezone(&offset).date_naive()
}

/// Seconds rounded to hours with two decimals.
pub fn hours(seconds: i64) -> f64 {
    (seconds as f64 / 36.0).round() / 100.0
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds().max(0)
}

/// Length of the break that is still running, if any.
pub fn running_break_seconds(entry: &TimeEntry, now: DateTime<Utc>) -> i64 {
    match entry.break_started_at {
        Some(started) => seconds_between(started, entry.clock_out.unwrap_or(now)),
        None => 0,
    }
}

/// Break time of a session, finished plus running.
pub fn session_break_seconds(entry: &TimeEntry, now: DateTime<Utc>) -> i64 {
    entry.break_seconds.max(0) + running_break_seconds(entry, now)
}

/// Worked time of a session: its span up to clock-out (or `now` while open)
/// minus every break. Never negative.
pub fn session_worked_seconds(entry: &TimeEntry, now: DateTime<Utc>) -> i64 {
    let end = entry.clock_out.unwrap_or(now);
    let gross = seconds_between(entry.clock_in, end);
    (gross - session_break_seconds(entry, now)).max(0)
}

#[derive(Default)]
struct DayAcc {
    first_in: Option<DateTime<Utc>>,
    last_out: Option<DateTime<Utc>>,
    sessions: usize,
    worked: i64,
    breaks: i64,
    active: bool,
    on_break: bool,
}

/// Group sessions by (user, work date) into one entry per group.
///
/// Output is ordered newest day first, then by user id.
pub fn merge_entries(entries: &[TimeEntry], now: DateTime<Utc>) -> Vec<MergedEntry> {
    let mut groups: BTreeMap<(NaiveDate, u64), DayAcc> = BTreeMap::new();

    for entry in entries {
        let acc = groups.entry((entry.work_date, entry.user_id)).or_default();

        acc.first_in = Some(match acc.first_in {
            Some(first) => first.min(entry.clock_in),
            None => entry.clock_in,
        });
        if let Some(out) = entry.clock_out {
            acc.last_out = Some(acc.last_out.map_or(out, |last| last.max(out)));
        }
        acc.sessions += 1;
        acc.worked += session_worked_seconds(entry, now);
        acc.breaks += session_break_seconds(entry, now);
        acc.active |= entry.is_open();
        acc.on_break |= entry.on_break();
    }

    let mut merged: Vec<MergedEntry> = groups
        .into_iter()
        .filter_map(|((work_date, user_id), acc)| {
            Some(MergedEntry {
                user_id,
                work_date,
                first_in: acc.first_in?,
                last_out: if acc.active { None } else { acc.last_out },
                sessions: acc.sessions,
                worked_seconds: acc.worked,
                break_seconds: acc.breaks,
                total_hours: hours(acc.worked),
                is_active: acc.active,
                on_break: acc.on_break,
            })
        })
        .collect();

    merged.sort_by(|a, b| {
        b.work_date
            .cmp(&a.work_date)
            .then(a.user_id.cmp(&b.user_id))
    });
    merged
}

/// The open session of `user_id`, if any.
///
/// Sessions dated today or yesterday are considered so a shift started before
/// midnight stays active after it. When several are open the newest wins.
pub fn find_active<'a>(
    entries: &'a [TimeEntry],
    user_id: u64,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<&'a TimeEntry> {
    let today = work_date_for(now, offset);
    let yesterday = today - Duration::days(1);

    entries
        .iter()
        .filter(|e| e.user_id == user_id && e.is_open())
        .filter(|e| e.work_date == today || e.work_date == yesterday)
        .max_by_key(|e| e.clock_in)
}

/// Values written when a session is closed.
#[derive(Debug, PartialEq)]
pub struct CloseSession {
    pub clock_out: DateTime<Utc>,
    pub break_seconds: i64,
}

/// Close `entry` at `at`, folding a running break into the break total.
pub fn close_session(entry: &TimeEntry, at: DateTime<Utc>) -> Result<CloseSession, ClockError> {
    if !entry.is_open() {
        return Err(ClockError::NotActive);
    }
    // A clock-out earlier than clock-in (clock skew) is pinned to clock-in.
    let clock_out = at.max(entry.clock_in);
    Ok(CloseSession {
        clock_out,
        break_seconds: entry.break_seconds.max(0) + running_break_seconds(entry, clock_out),
    })
}

pub fn start_break(entry: &TimeEntry, at: DateTime<Utc>) -> Result<DateTime<Utc>, ClockError> {
    if !entry.is_open() {
        return Err(ClockError::NotActive);
    }
    if entry.break_started_at.is_some() {
        return Err(ClockError::AlreadyOnBreak);
    }
    Ok(at.max(entry.clock_in))
}

/// New break total after ending the running break at `at`.
pub fn end_break(entry: &TimeEntry, at: DateTime<Utc>) -> Result<i64, ClockError> {
    if !entry.is_open() {
        return Err(ClockError::NotActive);
    }
    if entry.break_started_at.is_none() {
        return Err(ClockError::NotOnBreak);
    }
    Ok(entry.break_seconds.max(0) + running_break_seconds(entry, at))
}

/// Check an inclusive date range used for listing or reporting.
pub fn validate_range(from: NaiveDate, to: NaiveDate) -> Result<(), ClockError> {
    if from > to {
        return Err(ClockError::InvertedRange);
    }
    if (to - from).num_days() + 1 > MAX_RANGE_DAYS {
        return Err(ClockError::RangeTooWide);
    }
    Ok(())
}

pub fn validate_span(
    clock_in: DateTime<Utc>,
    clock_out: Option<DateTime<Utc>>,
) -> Result<(), ClockError> {
    match clock_out {
        Some(out) if out <= clock_in => Err(ClockError::OutBeforeIn),
        _ => Ok(()),
    }
}

/// Per-user totals over merged entries, ordered by user id.
pub fn summarize(merged: &[MergedEntry]) -> Vec<UserSummary> {
    let mut per_user: BTreeMap<u64, (usize, i64)> = BTreeMap::new();

    for day in merged {
        let slot = per_user.entry(day.user_id).or_default();
        slot.0 += 1;
        slot.1 += day.worked_seconds;
    }

    per_user
        .into_iter()
        .map(|(user_id, (days_worked, total_seconds))| UserSummary {
            user_id,
            days_worked,
            total_seconds,
            total_hours: hours(total_seconds),
            average_hours: if days_worked == 0 {
                0.0
            } else {
                hours(total_seconds / days_worked as i64)
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const H: i64 = 3600;

    fn at(day: u32, hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, min, 0).unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    fn session(
        id: u64,
        user_id: u64,
        clock_in: DateTime<Utc>,
        clock_out: Option<DateTime<Utc>>,
    ) -> TimeEntry {
        TimeEntry {
            id,
            user_id,
            work_date: work_date_for(clock_in, utc()),
            clock_in,
            clock_out,
            break_started_at: None,
            break_seconds: 0,
            note: None,
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn work_date_uses_local_offset() {
        let late_evening_utc = at(2, 23, 30);
        assert_eq!(work_date_for(late_evening_utc, utc()), date(2));

        let plus_two = FixedOffset::east_opt(2 * H as i32).unwrap();
        assert_eq!(work_date_for(late_evening_utc, plus_two), date(3));

        let minus_five = FixedOffset::west_opt(5 * H as i32).unwrap();
        assert_eq!(work_date_for(at(3, 2, 0), minus_five), date(2));
    }

    #[test]
    fn hours_round_to_two_decimals() {
        assert_eq!(hours(0), 0.0);
        assert_eq!(hours(H), 1.0);
        assert_eq!(hours(7 * H + 45 * 60), 7.75);
        assert_eq!(hours(20 * 60), 0.33);
    }

    #[test]
    fn closed_session_subtracts_breaks() {
        let mut s = session(1, 1, at(2, 9, 0), Some(at(2, 17, 0)));
        s.break_seconds = 30 * 60;
        assert_eq!(session_worked_seconds(&s, at(5, 0, 0)), 7 * H + 30 * 60);
    }

    #[test]
    fn open_session_counts_until_now_minus_running_break() {
        let mut s = session(1, 1, at(2, 9, 0), None);
        s.break_seconds = 15 * 60;
        s.break_started_at = Some(at(2, 12, 0));

        let now = at(2, 12, 30);
        assert_eq!(running_break_seconds(&s, now), 30 * 60);
        assert_eq!(session_worked_seconds(&s, now), 3 * H + 30 * 60 - 45 * 60);
    }

    #[test]
    fn inverted_session_counts_zero() {
        let s = session(1, 1, at(2, 17, 0), Some(at(2, 9, 0)));
        assert_eq!(session_worked_seconds(&s, at(3, 0, 0)), 0);

        let mut oversized_break = session(2, 1, at(2, 9, 0), Some(at(2, 10, 0)));
        oversized_break.break_seconds = 2 * H;
        assert_eq!(session_worked_seconds(&oversized_break, at(3, 0, 0)), 0);
    }

    #[test]
    fn merge_groups_by_user_and_day() {
        let entries = vec![
            session(1, 1, at(2, 9, 0), Some(at(2, 12, 0))),
            session(2, 1, at(2, 13, 0), Some(at(2, 17, 30))),
            session(3, 2, at(2, 8, 0), Some(at(2, 16, 0))),
            session(4, 1, at(3, 9, 0), Some(at(3, 10, 0))),
        ];

        let merged = merge_entries(&entries, at(4, 0, 0));
        assert_eq!(merged.len(), 3);

        // newest day first
        assert_eq!(merged[0].work_date, date(3));
        assert_eq!(merged[0].user_id, 1);
        assert_eq!(merged[0].worked_seconds, H);

        let day_user1 = &merged[1];
        assert_eq!((day_user1.work_date, day_user1.user_id), (date(2), 1));
        assert_eq!(day_user1.sessions, 2);
        assert_eq!(day_user1.first_in, at(2, 9, 0));
        assert_eq!(day_user1.last_out, Some(at(2, 17, 30)));
        assert_eq!(day_user1.worked_seconds, 7 * H + 30 * 60);
        assert_eq!(day_user1.total_hours, 7.5);
        assert!(!day_user1.is_active);

        assert_eq!((merged[2].work_date, merged[2].user_id), (date(2), 2));
    }

    #[test]
    fn merge_is_order_independent() {
        let a = session(1, 1, at(2, 13, 0), Some(at(2, 17, 0)));
        let b = session(2, 1, at(2, 8, 0), Some(at(2, 12, 0)));

        let forward = merge_entries(&[a.clone(), b.clone()], at(3, 0, 0));
        let backward = merge_entries(&[b, a], at(3, 0, 0));
        assert_eq!(forward, backward);
        assert_eq!(forward[0].first_in, at(2, 8, 0));
    }

    #[test]
    fn any_open_session_makes_day_active_without_last_out() {
        let mut open = session(2, 1, at(2, 13, 0), None);
        open.break_started_at = Some(at(2, 14, 0));
        let entries = vec![session(1, 1, at(2, 9, 0), Some(at(2, 12, 0))), open];

        let merged = merge_entries(&entries, at(2, 15, 0));
        assert_eq!(merged.len(), 1);
        let day = &merged[0];
        assert!(day.is_active);
        assert!(day.on_break);
        assert_eq!(day.last_out, None);
        // 3h closed + (2h open - 1h running break)
        assert_eq!(day.worked_seconds, 4 * H);
        assert_eq!(day.break_seconds, H);
    }

    #[test]
    fn active_session_found_across_midnight() {
        let overnight = session(7, 1, at(2, 22, 0), None);
        let entries = vec![overnight.clone()];

        let just_after_midnight = at(3, 1, 0);
        let found = find_active(&entries, 1, just_after_midnight, utc());
        assert_eq!(found, Some(&overnight));

        // still counted on the day it started
        let merged = merge_entries(&entries, just_after_midnight);
        assert_eq!(merged[0].work_date, date(2));
        assert_eq!(merged[0].worked_seconds, 3 * H);
    }

    #[test]
    fn stale_open_sessions_are_not_active() {
        let forgotten = session(7, 1, at(1, 9, 0), None);
        assert_eq!(find_active(&[forgotten], 1, at(3, 9, 0), utc()), None);
    }

    #[test]
    fn newest_open_session_wins_and_other_users_ignored() {
        let entries = vec![
            session(1, 1, at(2, 22, 0), None),
            session(2, 1, at(3, 8, 0), None),
            session(3, 2, at(3, 9, 0), None),
            session(4, 1, at(3, 6, 0), Some(at(3, 7, 0))),
        ];

        let found = find_active(&entries, 1, at(3, 10, 0), utc()).unwrap();
        assert_eq!(found.id, 2);
        assert_eq!(find_active(&entries, 3, at(3, 10, 0), utc()), None);
    }

    #[test]
    fn closing_folds_running_break() {
        let mut s = session(1, 1, at(2, 9, 0), None);
        s.break_seconds = 600;
        s.break_started_at = Some(at(2, 16, 30));

        let closed = close_session(&s, at(2, 17, 0)).unwrap();
        assert_eq!(closed.clock_out, at(2, 17, 0));
        assert_eq!(closed.break_seconds, 600 + 30 * 60);
    }

    #[test]
    fn closing_twice_fails() {
        let s = session(1, 1, at(2, 9, 0), Some(at(2, 10, 0)));
        assert_eq!(close_session(&s, at(2, 11, 0)), Err(ClockError::NotActive));
    }

    #[test]
    fn clock_out_before_clock_in_is_pinned() {
        let s = session(1, 1, at(2, 9, 0), None);
        let closed = close_session(&s, at(2, 8, 0)).unwrap();
        assert_eq!(closed.clock_out, at(2, 9, 0));
    }

    #[test]
    fn break_transitions_are_guarded() {
        let mut s = session(1, 1, at(2, 9, 0), None);
        assert_eq!(end_break(&s, at(2, 10, 0)), Err(ClockError::NotOnBreak));

        let started = start_break(&s, at(2, 10, 0)).unwrap();
        s.break_started_at = Some(started);
        assert_eq!(start_break(&s, at(2, 10, 5)), Err(ClockError::AlreadyOnBreak));

        assert_eq!(end_break(&s, at(2, 10, 20)), Ok(20 * 60));
    }

    #[test]
    fn breaks_need_an_open_session() {
        let s = session(1, 1, at(2, 9, 0), Some(at(2, 10, 0)));
        assert_eq!(start_break(&s, at(2, 9, 30)), Err(ClockError::NotActive));
        assert_eq!(end_break(&s, at(2, 9, 30)), Err(ClockError::NotActive));
    }

    #[test]
    fn range_validation() {
        assert!(validate_range(date(1), date(1)).is_ok());
        assert_eq!(validate_range(date(5), date(1)), Err(ClockError::InvertedRange));

        let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert!(validate_range(start, start + Duration::days(MAX_RANGE_DAYS - 1)).is_ok());
        assert_eq!(
            validate_range(start, start + Duration::days(MAX_RANGE_DAYS)),
            Err(ClockError::RangeTooWide)
        );
    }

    #[test]
    fn span_validation() {
        assert!(validate_span(at(2, 9, 0), None).is_ok());
        assert!(validate_span(at(2, 9, 0), Some(at(2, 10, 0))).is_ok());
        assert_eq!(
            validate_span(at(2, 9, 0), Some(at(2, 9, 0))),
            Err(ClockError::OutBeforeIn)
        );
    }

    #[test]
    fn summary_totals_per_user() {
        let entries = vec![
            session(1, 1, at(2, 9, 0), Some(at(2, 17, 0))),
            session(2, 1, at(3, 9, 0), Some(at(3, 13, 0))),
            session(3, 2, at(2, 9, 0), Some(at(2, 10, 30))),
        ];
        let merged = merge_entries(&entries, at(4, 0, 0));
        let summary = summarize(&merged);

        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].user_id, 1);
        assert_eq!(summary[0].days_worked, 2);
        assert_eq!(summary[0].total_hours, 12.0);
        assert_eq!(summary[0].average_hours, 6.0);
        assert_eq!(summary[1].total_hours, 1.5);
    }

    #[test]
    fn clock_errors_map_to_http_statuses() {
        use actix_web::ResponseError;
        let conflict: ApiError = ClockError::AlreadyActive.into();
        assert_eq!(conflict.status_code(), 409);
        let bad: ApiError = ClockError::NotOnBreak.into();
        assert_eq!(bad.status_code(), 400);
    }
}
