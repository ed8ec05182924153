use chrono::{Datelike, NaiveDate};

use crate::models::{is_school_day, YearMonth};

/// The last `n` school days strictly before `today` that fall inside
/// `month`, most recent first. Returned as days of the month.
pub fn recent_school_days(today: NaiveDate, month: YearMonth, n: usize) -> Vec<u32> {
    let last_day = month.days_in_month();
    let start = if month.contains(today) {
        today.day().saturating_sub(1)
    } else if month < YearMonth::of_date(today) {
        last_day
    } else {
        0
    };

    (1..=start)
        .rev()
        .filter(|&d| month.day(d).map(is_school_day).unwrap_or(false))
        .take(n)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn june() -> YearMonth {
        YearMonth::new(2025, 6).unwrap()
    }

    #[test]
    fn test_recent_school_days_skip_weekend() {
        // Tuesday 10th: previous school days are 9 (Mon), 6 (Fri), 5 (Thu)
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        assert_eq!(recent_school_days(today, june(), 3), vec![9, 6, 5]);
    }

    #[test]
    fn test_recent_school_days_start_of_month() {
        // Monday 2nd: the 1st is a Sunday, nothing before today
        let today = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        assert!(recent_school_days(today, june(), 3).is_empty());
    }

    #[test]
    fn test_recent_school_days_past_month() {
        // Whole of May counts when asked from June; May 31 2025 is a Saturday
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let may = YearMonth::new(2025, 5).unwrap();
        assert_eq!(recent_school_days(today, may, 2), vec![30, 29]);
    }

    #[test]
    fn test_recent_school_days_future_month_is_empty() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let july = YearMonth::new(2025, 7).unwrap();
        assert!(recent_school_days(today, july, 3).is_empty());
    }
}
