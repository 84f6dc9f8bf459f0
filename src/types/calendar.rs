//! Local calendar used for month bucketing, weekday and hour-of-day features

use chrono::{
    DateTime, Datelike, FixedOffset, Months, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike, Utc, Weekday,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A local calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthKey {
    pub year: i32,
    /// 1-based month
    pub month: u32,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// Months since year 0, used for arithmetic.
    pub fn index(&self) -> i64 {
        self.year as i64 * 12 + (self.month as i64 - 1)
    }

    fn from_index(index: i64) -> Self {
        Self {
            year: index.div_euclid(12) as i32,
            month: (index.rem_euclid(12) + 1) as u32,
        }
    }

    pub fn next(&self) -> Self {
        Self::from_index(self.index() + 1)
    }

    /// The month `months` before this one
    pub fn back(&self, months: u32) -> Self {
        Self::from_index(self.index() - months as i64)
    }

    /// Number of months from `self` to `later` (negative if `later` is earlier).
    pub fn months_until(&self, later: MonthKey) -> i64 {
        later.index() - self.index()
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Fixed-offset local calendar of the deployment.
#[derive(Debug, Clone, Copy)]
pub struct Calendar {
    offset: FixedOffset,
}

impl Calendar {
    /// Build a calendar from a UTC offset in minutes. Out-of-range offsets fall back to UTC.
    pub fn from_offset_minutes(minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::from_offset_minutes(0)
    }

    fn local(&self, ts: DateTime<Utc>) -> NaiveDateTime {
        ts.with_timezone(&self.offset).naive_local()
    }

    pub fn month_of(&self, ts: DateTime<Utc>) -> MonthKey {
        let local = self.local(ts);
        MonthKey::new(local.year(), local.month())
    }

    pub fn hour_of(&self, ts: DateTime<Utc>) -> u32 {
        self.local(ts).hour()
    }

    pub fn is_weekend(&self, ts: DateTime<Utc>) -> bool {
        matches!(self.local(ts).weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// `ts` moved back `months` calendar months on the local wall clock
    pub fn sub_months(&self, ts: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
        ts.with_timezone(&self.offset)
            .checked_sub_months(Months::new(months))
            .map(|local| local.with_timezone(&Utc))
    }

    /// `ts` moved forward `months` calendar months on the local wall clock
    pub fn add_months(&self, ts: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
        ts.with_timezone(&self.offset)
            .checked_add_months(Months::new(months))
            .map(|local| local.with_timezone(&Utc))
    }

    /// Local midnight on the first day of `month`, as UTC
    pub fn month_start(&self, month: MonthKey) -> Option<DateTime<Utc>> {
        let midnight = NaiveDate::from_ymd_opt(month.year, month.month, 1)?.and_hms_opt(0, 0, 0)?;
        self.offset
            .from_local_datetime(&midnight)
            .single()
            .map(|local| local.with_timezone(&Utc))
    }

    /// Start of the local month containing `now`: the default end of an
    /// evaluation window covering the last complete months.
    pub fn current_month_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.month_start(self.month_of(now)).unwrap_or(now)
    }
}

impl Default for Calendar {
    fn default() -> Self {
        Self::utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_arithmetic() {
        let dec = MonthKey::new(2023, 12);
        assert_eq!(dec.next(), MonthKey::new(2024, 1));
        assert_eq!(dec.months_until(MonthKey::new(2024, 3)), 3);
        assert_eq!(MonthKey::new(2024, 3).months_until(dec), -3);
        assert!(dec < MonthKey::new(2024, 1));
        assert_eq!(dec.to_string(), "2023-12");
        assert_eq!(MonthKey::new(2024, 2).back(3), MonthKey::new(2023, 11));
        assert_eq!(dec.back(0), dec);
    }

    #[test]
    fn test_local_calendar_shifts_day_and_month() {
        // 2024-01-31 20:00 UTC is 2024-02-01 01:30 in UTC+05:30
        let ts = Utc.with_ymd_and_hms(2024, 1, 31, 20, 0, 0).unwrap();
        let ist = Calendar::from_offset_minutes(330);
        assert_eq!(ist.month_of(ts), MonthKey::new(2024, 2));
        assert_eq!(ist.hour_of(ts), 1);
        assert_eq!(Calendar::utc().month_of(ts), MonthKey::new(2024, 1));
    }

    #[test]
    fn test_weekend_detection() {
        // 2024-03-02 is a Saturday
        let saturday = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
        let monday = Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap();
        assert!(Calendar::utc().is_weekend(saturday));
        assert!(!Calendar::utc().is_weekend(monday));
    }

    #[test]
    fn test_month_start_in_local_time() {
        let ist = Calendar::from_offset_minutes(330);
        let start = ist.month_start(MonthKey::new(2024, 7)).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 6, 30, 18, 30, 0).unwrap());

        let now = Utc.with_ymd_and_hms(2024, 7, 15, 9, 0, 0).unwrap();
        assert_eq!(ist.current_month_start(now), start);
    }

    #[test]
    fn test_month_shift_follows_local_wall_clock() {
        let ist = Calendar::from_offset_minutes(330);
        let july = ist.month_start(MonthKey::new(2024, 7)).unwrap();
        let january = ist.month_start(MonthKey::new(2024, 1)).unwrap();

        // 2024-06-30 18:30 UTC; shifting the UTC date would land on 30 December
        let start = ist.sub_months(july, 6).unwrap();
        assert_eq!(start, january);
        assert_eq!(start, Utc.with_ymd_and_hms(2023, 12, 31, 18, 30, 0).unwrap());
        assert_eq!(ist.month_of(start), MonthKey::new(2024, 1));
        assert_eq!(ist.add_months(january, 6), Some(july));
    }
}
