use chrono::{Datelike, Local, Timelike, Utc};

/// A real-time-clock snapshot queried by the `rtc.*` operators.
///
/// Snapshots are taken once, before evaluation, so that a program sees
/// one consistent instant; tests inject fixed snapshots for
/// determinism.
///
/// Numbering: month and day-of-month are one-based calendar values,
/// day-of-week is a zero-based index from the week start (Monday by
/// default, Sunday after `rtc.wss`), week-of-year is the ISO week
/// number, and time-of-day is fractional hours.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtcSnapshot {
    year: i32,
    month: u32,
    day: u32,
    // 0 = Monday.
    weekday_mon0: u32,
    // Weekday of the first day of this month, 0 = Monday.
    first_weekday_mon0: u32,
    tod_hours: f64,
    iso_week: u32,
}

impl RtcSnapshot {
    /// Builds a snapshot from a calendar date and time.
    pub fn from_datetime<T: Datelike + Timelike>(datetime: &T) -> Self {
        let weekday_mon0 = datetime.weekday().num_days_from_monday();
        let day = datetime.day();
        let first_weekday_mon0 =
            (weekday_mon0 as i64 - (i64::from(day) - 1) % 7).rem_euclid(7) as u32;

        let tod_hours = f64::from(datetime.hour())
            + f64::from(datetime.minute()) / 60.0
            + f64::from(datetime.second()) / 3600.0;

        Self {
            year: datetime.year(),
            month: datetime.month(),
            day,
            weekday_mon0,
            first_weekday_mon0,
            tod_hours,
            iso_week: datetime.iso_week().week(),
        }
    }

    /// Takes a snapshot of the current instant in the local time zone.
    #[must_use]
    pub fn now_local() -> Self {
        Self::from_datetime(&Local::now().naive_local())
    }

    /// Takes a snapshot of the current instant in UTC.
    #[must_use]
    pub fn now_utc() -> Self {
        Self::from_datetime(&Utc::now().naive_utc())
    }

    /// The calendar year.
    #[must_use]
    pub fn year(&self) -> f64 {
        f64::from(self.year)
    }

    /// The month of the year, one-based.
    #[must_use]
    pub fn month_of_year(&self) -> f64 {
        f64::from(self.month)
    }

    /// The day of the month, one-based.
    #[must_use]
    pub fn day_of_month(&self) -> f64 {
        f64::from(self.day)
    }

    /// The day of the week, zero-based from the week start.
    #[must_use]
    pub fn day_of_week(&self, week_starts_sunday: bool) -> f64 {
        let index = if week_starts_sunday {
            (self.weekday_mon0 + 1) % 7
        } else {
            self.weekday_mon0
        };
        f64::from(index)
    }

    /// The time of day as fractional hours.
    #[must_use]
    pub fn time_of_day(&self) -> f64 {
        self.tod_hours
    }

    /// The aligned week of the month: day 1 through 7 is week 1.
    #[must_use]
    pub fn aligned_week_of_month(&self) -> f64 {
        f64::from(1 + (self.day - 1) / 7)
    }

    /// The week of the month, counting partial first weeks.
    #[must_use]
    pub fn week_of_month(&self, week_starts_sunday: bool) -> f64 {
        let first = if week_starts_sunday {
            (self.first_weekday_mon0 + 1) % 7
        } else {
            self.first_weekday_mon0
        };
        f64::from(1 + (self.day - 1 + first) / 7)
    }

    /// The ISO week of the year.
    #[must_use]
    pub fn week_of_year(&self) -> f64 {
        f64::from(self.iso_week)
    }
}
