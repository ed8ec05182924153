//! Consistency checks between paired entry/exit aggregates.

use chrono::NaiveDateTime;

use crate::models::MonthlyAggregate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairCheck {
    pub in_sync: bool,
    pub reason: String,
}

/// Compare the number of completed school days (Mon–Fri, strictly before
/// today) in the entry and exit aggregates. Today is excluded because an
/// entry may precede its exit; weekends produce nothing. An absent
/// aggregate counts as zero days.
pub fn check_pair_sync(
    entry: Option<&MonthlyAggregate>,
    exit: Option<&MonthlyAggregate>,
    now: NaiveDateTime,
) -> PairCheck {
    let today = now.date();
    let entries = entry.map(|a| a.school_days_before(today)).unwrap_or(0);
    let exits = exit.map(|a| a.school_days_before(today)).unwrap_or(0);

    if entries == exits {
        PairCheck {
            in_sync: true,
            reason: format!("{} school days on both sides", entries),
        }
    } else {
        PairCheck {
            in_sync: false,
            reason: format!(
                "entry has {} school days but exit has {} before {}",
                entries, exits, today
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AggregateKey, DayRecord, Direction, PersonId, YearMonth};
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        // Tuesday
        NaiveDate::from_ymd_opt(2025, 6, 10)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn aggregate(direction: Direction, days: &[u32]) -> MonthlyAggregate {
        let month = YearMonth::new(2025, 6).unwrap();
        let key = AggregateKey::new(PersonId::new("p"), direction, month);
        let mut agg = MonthlyAggregate::empty(&key, now());
        for &d in days {
            let instant = month.day(d).unwrap().and_hms_opt(8, 0, 0).unwrap();
            agg.days.insert(d, DayRecord::new(direction, instant, 0));
        }
        agg
    }

    #[test]
    fn test_identical_school_days_in_sync() {
        let entry = aggregate(Direction::CheckIn, &[2, 3, 4, 5, 6, 9]);
        let exit = aggregate(Direction::CheckOut, &[2, 3, 4, 5, 6, 9]);
        assert!(check_pair_sync(Some(&entry), Some(&exit), now()).in_sync);
    }

    #[test]
    fn test_weekend_and_today_entries_ignored() {
        // Entry has today (10) and Saturday (7) extra
        let entry = aggregate(Direction::CheckIn, &[2, 3, 7, 9, 10]);
        let exit = aggregate(Direction::CheckOut, &[2, 3, 9]);
        assert!(check_pair_sync(Some(&entry), Some(&exit), now()).in_sync);
    }

    #[test]
    fn test_missing_exit_day_is_out_of_sync() {
        let entry = aggregate(Direction::CheckIn, &[2, 3, 4]);
        let exit = aggregate(Direction::CheckOut, &[2, 4]);
        let check = check_pair_sync(Some(&entry), Some(&exit), now());
        assert!(!check.in_sync);
        assert!(check.reason.contains("entry has 3"));
    }

    #[test]
    fn test_absent_side_counts_as_zero() {
        let entry = aggregate(Direction::CheckIn, &[2]);
        assert!(!check_pair_sync(Some(&entry), None, now()).in_sync);
        assert!(check_pair_sync(None, None, now()).in_sync);
        let weekend_only = aggregate(Direction::CheckIn, &[7, 8]);
        assert!(check_pair_sync(Some(&weekend_only), None, now()).in_sync);
    }
}
