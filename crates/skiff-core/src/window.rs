use chrono::{Datelike, Months, NaiveDate, NaiveTime, TimeDelta, Weekday};
use tracing::debug;

/// The stepping unit of a window, inferred from its shape, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowUnit {
    Month,
    Week,
    Day,
}

/// Mutable date-range cursor, half-open `[lower, upper)`, used both as a
/// query filter and as a display frame. `lower < upper` always holds.
///
/// The unit is classified from the interval's shape on every step, in the
/// order month, then week, then day, so external navigation can set any
/// interval and stepping still does the right thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    lower: NaiveDate,
    upper: NaiveDate,
}

impl TimeWindow {
    pub fn try_new(lower: NaiveDate, upper: NaiveDate) -> Option<Self> {
        if lower < upper {
            Some(Self { lower, upper })
        } else {
            None
        }
    }

    /// The single-day window containing `date`.
    pub fn day(date: NaiveDate) -> Self {
        let upper = shift_days(date, 1).unwrap_or(date);
        Self { lower: date, upper }
    }

    /// The ISO week (Monday to Monday) containing `date`.
    pub fn week_of(date: NaiveDate) -> Self {
        let back = date.weekday().num_days_from_monday() as i64;
        let lower = shift_days(date, -back).unwrap_or(date);
        let upper = shift_days(lower, 7).unwrap_or(lower);
        Self { lower, upper }
    }

    /// The calendar month containing `date`.
    pub fn month_of(date: NaiveDate) -> Self {
        let lower = date.with_day(1).unwrap_or(date);
        let upper = shift_months(lower, 1).unwrap_or(lower);
        Self { lower, upper }
    }

    pub fn lower(&self) -> NaiveDate {
        self.lower
    }

    pub fn upper(&self) -> NaiveDate {
        self.upper
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.lower && date < self.upper
    }

    /// Bounds as UTC milliseconds at midnight, for query filters.
    pub fn lower_millis(&self) -> i64 {
        date_millis(self.lower)
    }

    pub fn upper_millis(&self) -> i64 {
        date_millis(self.upper)
    }

    /// Classify the window's shape. First match wins: a whole calendar
    /// month (1st to the 1st of the next month), then a Monday-to-Monday
    /// week, then anything else steps by days.
    pub fn unit(&self) -> WindowUnit {
        let is_month = self.lower.day() == 1
            && self.upper.day() == 1
            && self.lower.checked_add_months(Months::new(1)) == Some(self.upper);
        if is_month {
            return WindowUnit::Month;
        }

        let is_week = self.lower.weekday() == Weekday::Mon
            && self.upper.weekday() == Weekday::Mon
            && shift_days(self.lower, 7) == Some(self.upper);
        if is_week {
            return WindowUnit::Week;
        }

        WindowUnit::Day
    }

    /// Shift the window by `i` of its inferred units. Calendar-component
    /// arithmetic throughout, so month steps land on the 1st regardless of
    /// month length.
    pub fn step(&mut self, i: i64) {
        let shifted = match self.unit() {
            WindowUnit::Month => shift_months(self.lower, i).zip(shift_months(self.upper, i)),
            WindowUnit::Week => {
                shift_days(self.lower, 7 * i).zip(shift_days(self.upper, 7 * i))
            }
            WindowUnit::Day => shift_days(self.lower, i).zip(shift_days(self.upper, i)),
        };
        // Shift both bounds or neither, so the invariant survives overflow.
        if let Some((lower, upper)) = shifted {
            if lower < upper {
                self.lower = lower;
                self.upper = upper;
            }
        }
    }

    /// External navigation (e.g. clicking a calendar cell) replaces the
    /// interval directly. Degenerate selections are refused.
    pub fn set_from_selection(&mut self, lower: NaiveDate, upper: NaiveDate) -> bool {
        if lower >= upper {
            debug!(%lower, %upper, "ignoring degenerate window selection");
            return false;
        }
        self.lower = lower;
        self.upper = upper;
        true
    }
}

fn date_millis(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

fn shift_days(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    date.checked_add_signed(TimeDelta::days(days))
}

fn shift_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    if months >= 0 {
        date.checked_add_months(Months::new(months as u32))
    } else {
        date.checked_sub_months(Months::new((-months) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn month_shape_is_classified_first() {
        let w = TimeWindow::try_new(d(2024, 1, 1), d(2024, 2, 1)).unwrap();
        assert_eq!(w.unit(), WindowUnit::Month);
        // A December window wraps the year and still counts as a month.
        let w = TimeWindow::try_new(d(2024, 12, 1), d(2025, 1, 1)).unwrap();
        assert_eq!(w.unit(), WindowUnit::Month);
    }

    #[test]
    fn week_shape_requires_monday_bounds_seven_days_apart() {
        let w = TimeWindow::try_new(d(2024, 3, 4), d(2024, 3, 11)).unwrap();
        assert_eq!(w.unit(), WindowUnit::Week);
        // One day longer: falls through to day stepping.
        let w = TimeWindow::try_new(d(2024, 3, 4), d(2024, 3, 12)).unwrap();
        assert_eq!(w.unit(), WindowUnit::Day);
        // Seven days but starting Tuesday: not a week.
        let w = TimeWindow::try_new(d(2024, 3, 5), d(2024, 3, 12)).unwrap();
        assert_eq!(w.unit(), WindowUnit::Day);
    }

    #[test]
    fn single_day_window_steps_by_days() {
        // A lone Monday must not classify as week or month.
        let mut w = TimeWindow::day(d(2024, 3, 4));
        assert_eq!(w.unit(), WindowUnit::Day);
        w.step(1);
        assert_eq!(w.lower(), d(2024, 3, 5));
        assert_eq!(w.upper(), d(2024, 3, 6));
    }

    #[test]
    fn month_step_round_trips_across_unequal_month_lengths() {
        let mut w = TimeWindow::try_new(d(2024, 1, 1), d(2024, 2, 1)).unwrap();
        w.step(1);
        assert_eq!((w.lower(), w.upper()), (d(2024, 2, 1), d(2024, 3, 1)));
        w.step(-1);
        assert_eq!((w.lower(), w.upper()), (d(2024, 1, 1), d(2024, 2, 1)));
    }

    #[test]
    fn month_step_stays_month_shaped_over_many_steps() {
        let mut w = TimeWindow::month_of(d(2024, 1, 15));
        assert_eq!((w.lower(), w.upper()), (d(2024, 1, 1), d(2024, 2, 1)));
        for _ in 0..14 {
            w.step(1);
            assert_eq!(w.unit(), WindowUnit::Month);
        }
        assert_eq!((w.lower(), w.upper()), (d(2025, 3, 1), d(2025, 4, 1)));
    }

    #[test]
    fn week_step_shifts_both_bounds_by_seven_days() {
        let mut w = TimeWindow::week_of(d(2024, 3, 6));
        assert_eq!((w.lower(), w.upper()), (d(2024, 3, 4), d(2024, 3, 11)));
        w.step(-2);
        assert_eq!((w.lower(), w.upper()), (d(2024, 2, 19), d(2024, 2, 26)));
    }

    #[test]
    fn selection_replaces_the_interval_without_inference() {
        let mut w = TimeWindow::day(d(2024, 3, 4));
        assert!(w.set_from_selection(d(2024, 6, 1), d(2024, 7, 1)));
        assert_eq!(w.unit(), WindowUnit::Month);
        // Degenerate selections keep the previous interval.
        assert!(!w.set_from_selection(d(2024, 6, 1), d(2024, 6, 1)));
        assert_eq!(w.lower(), d(2024, 6, 1));
        assert_eq!(w.upper(), d(2024, 7, 1));
    }

    #[test]
    fn contains_is_half_open() {
        let w = TimeWindow::try_new(d(2024, 1, 1), d(2024, 2, 1)).unwrap();
        assert!(w.contains(d(2024, 1, 1)));
        assert!(w.contains(d(2024, 1, 31)));
        assert!(!w.contains(d(2024, 2, 1)));
    }

    #[test]
    fn degenerate_construction_is_refused() {
        assert!(TimeWindow::try_new(d(2024, 1, 2), d(2024, 1, 1)).is_none());
        assert!(TimeWindow::try_new(d(2024, 1, 1), d(2024, 1, 1)).is_none());
    }
}
