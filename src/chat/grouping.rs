//! Time-bucket grouping for session lists
//!
//! A pure function: the same sessions and the same `now` always produce
//! the same groups. Calendar comparisons happen in the time zone of `now`.

use crate::config::WeekStart;
use crate::storage::Session;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use std::fmt;

/// Display bucket, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeBucket {
    /// Same calendar day as now
    Today,
    /// Same week as now, not today
    ThisWeek,
    /// Same calendar month and year, not this week
    ThisMonth,
    /// Everything else
    Older,
}

impl TimeBucket {
    /// All buckets in display order
    pub const ALL: [TimeBucket; 4] = [
        TimeBucket::Today,
        TimeBucket::ThisWeek,
        TimeBucket::ThisMonth,
        TimeBucket::Older,
    ];

    /// Label shown above the bucket
    pub fn label(&self) -> &'static str {
        match self {
            TimeBucket::Today => "Today",
            TimeBucket::ThisWeek => "This Week",
            TimeBucket::ThisMonth => "This Month",
            TimeBucket::Older => "Older",
        }
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Sessions that fall into one bucket, newest first
#[derive(Debug, Clone, PartialEq)]
pub struct SessionGroup<'a> {
    /// Bucket the sessions belong to
    pub bucket: TimeBucket,
    /// Sessions sorted by `created_at` descending
    pub sessions: Vec<&'a Session>,
}

fn week_start_date(today: NaiveDate, week_start: WeekStart) -> NaiveDate {
    let offset = match week_start {
        WeekStart::Sunday => today.weekday().num_days_from_sunday(),
        WeekStart::Monday => today.weekday().num_days_from_monday(),
    };
    today - Duration::days(i64::from(offset))
}

/// Bucket for a single creation time
///
/// # Examples
///
/// ```
/// use chatflow::chat::grouping::{bucket_for, TimeBucket};
/// use chatflow::config::WeekStart;
/// use chrono::{TimeZone, Utc};
///
/// let now = Utc.with_ymd_and_hms(2024, 5, 29, 12, 0, 0).unwrap();
/// let created = Utc.with_ymd_and_hms(2024, 5, 27, 9, 0, 0).unwrap();
/// assert_eq!(bucket_for(&created, &now, WeekStart::Sunday), TimeBucket::ThisWeek);
/// ```
pub fn bucket_for<Tz: TimeZone>(
    created_at: &DateTime<Utc>,
    now: &DateTime<Tz>,
    week_start: WeekStart,
) -> TimeBucket {
    let today = now.date_naive();
    let created = created_at.with_timezone(&now.timezone()).date_naive();

    if created == today {
        return TimeBucket::Today;
    }

    let start = week_start_date(today, week_start);
    if created >= start && created < start + Duration::days(7) {
        return TimeBucket::ThisWeek;
    }

    if created.year() == today.year() && created.month() == today.month() {
        return TimeBucket::ThisMonth;
    }

    TimeBucket::Older
}

/// Partition sessions into ordered, non-empty time buckets
///
/// Ties on `created_at` are broken by session id so the output is fully
/// deterministic.
pub fn group_sessions<'a, Tz: TimeZone>(
    sessions: &'a [Session],
    now: &DateTime<Tz>,
    week_start: WeekStart,
) -> Vec<SessionGroup<'a>> {
    let mut groups: Vec<SessionGroup<'a>> = TimeBucket::ALL
        .iter()
        .map(|bucket| SessionGroup {
            bucket: *bucket,
            sessions: Vec::new(),
        })
        .collect();

    for session in sessions {
        let bucket = bucket_for(&session.created_at, now, week_start);
        groups[bucket as usize].sessions.push(session);
    }

    for group in &mut groups {
        group.sessions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    groups.retain(|g| !g.sessions.is_empty());
    groups
}
