//! Report-period date bookkeeping.
//!
//! Monthly reports cover the previous calendar month; weekly reports cover
//! the previous Monday-to-Sunday week in the market's local time. Churn
//! metrics need one extra trailing month, so the monthly period also carries
//! the start of the month before the report month.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

/// The calendar month a monthly report covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthPeriod {
    /// First day of the report month.
    pub start: NaiveDate,
    /// Last day of the report month.
    pub end: NaiveDate,
    /// First day of the month before the report month, for trailing-window
    /// queries such as churn.
    pub churn_start: NaiveDate,
    /// Label used in artifact names, e.g. `Mar_2024`.
    pub label: String,
    /// Number of days in the report month, for daily averages.
    pub days: u32,
}

/// The report week: previous Monday-to-Sunday week relative to a local date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekPeriod {
    /// Monday of the report week.
    pub start: NaiveDate,
    /// Label used in artifact names, e.g. `18_Mar_2024`.
    pub label: String,
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.day()) - 1)
}

/// Period for the calendar month before `today`.
pub fn previous_month(today: NaiveDate) -> MonthPeriod {
    let end = month_start(today) - Duration::days(1);
    let start = month_start(end);
    let churn_start = month_start(start - Duration::days(1));
    MonthPeriod {
        start,
        end,
        churn_start,
        label: end.format("%b_%Y").to_string(),
        days: end.day(),
    }
}

/// Period for the week before the current one, in a market's local time.
pub fn previous_week(utc_now: DateTime<Utc>, utc_offset_hours: i64) -> WeekPeriod {
    let local_today = (utc_now + Duration::hours(utc_offset_hours)).date_naive();
    let days_back = i64::from(local_today.weekday().num_days_from_monday()) + 7;
    let start = local_today - Duration::days(days_back);
    WeekPeriod {
        label: start.format("%d_%b_%Y").to_string(),
        start,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_previous_month_mid_month() {
        let p = previous_month(date(2024, 4, 15));
        assert_eq!(p.start, date(2024, 3, 1));
        assert_eq!(p.end, date(2024, 3, 31));
        assert_eq!(p.churn_start, date(2024, 2, 1));
        assert_eq!(p.label, "Mar_2024");
        assert_eq!(p.days, 31);
    }

    #[test]
    fn test_previous_month_across_year_boundary() {
        let p = previous_month(date(2024, 1, 3));
        assert_eq!(p.start, date(2023, 12, 1));
        assert_eq!(p.end, date(2023, 12, 31));
        assert_eq!(p.churn_start, date(2023, 11, 1));
        assert_eq!(p.label, "Dec_2023");
    }

    #[test]
    fn test_previous_month_february_leap_year() {
        let p = previous_month(date(2024, 3, 1));
        assert_eq!(p.start, date(2024, 2, 1));
        assert_eq!(p.end, date(2024, 2, 29));
        assert_eq!(p.days, 29);
    }

    #[test]
    fn test_previous_week_in_local_time() {
        // 2024-03-20 23:30 UTC is already Thursday 2024-03-21 in UTC+8,
        // so the previous week starts Monday 2024-03-11.
        let now = Utc.with_ymd_and_hms(2024, 3, 20, 23, 30, 0).unwrap();
        let w = previous_week(now, 8);
        assert_eq!(w.start, date(2024, 3, 11));
        assert_eq!(w.label, "11_Mar_2024");

        // In UTC+0 it is still Wednesday 2024-03-20, same report week.
        let w = previous_week(now, 0);
        assert_eq!(w.start, date(2024, 3, 11));
    }

    #[test]
    fn test_previous_week_on_a_monday() {
        let now = Utc.with_ymd_and_hms(2024, 3, 18, 1, 0, 0).unwrap();
        let w = previous_week(now, 7);
        assert_eq!(w.start, date(2024, 3, 11));
    }
}
