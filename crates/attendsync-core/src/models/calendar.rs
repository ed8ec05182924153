use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A calendar month, ordered chronologically.
///
/// Serialized as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && NaiveDate::from_ymd_opt(year, month, 1).is_some() {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn of_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn of(instant: NaiveDateTime) -> Self {
        Self::of_date(instant.date())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// The calendar date of `day` in this month, if it exists.
    pub fn day(&self, day: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, day)
    }

    pub fn is_valid_day(&self, day: u32) -> bool {
        self.day(day).is_some()
    }

    pub fn days_in_month(&self) -> u32 {
        (28..=31).rev().find(|&d| self.is_valid_day(d)).unwrap_or(28)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn prev(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got '{}'", s))?;
        let year: i32 = year
            .parse()
            .map_err(|_| format!("invalid year in '{}'", s))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("invalid month in '{}'", s))?;
        Self::new(year, month).ok_or_else(|| format!("month out of range in '{}'", s))
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Monday through Friday. No holiday calendar is consulted.
pub fn is_school_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_month_ordering() {
        let may = YearMonth::new(2025, 5).unwrap();
        let june = YearMonth::new(2025, 6).unwrap();
        let next_jan = YearMonth::new(2026, 1).unwrap();
        assert!(may < june);
        assert!(june < next_jan);
        assert_eq!(YearMonth::new(2025, 12).unwrap().next(), next_jan);
        assert_eq!(next_jan.prev(), YearMonth::new(2025, 12).unwrap());
    }

    #[test]
    fn test_year_month_parse_and_display() {
        let ym: YearMonth = "2025-06".parse().unwrap();
        assert_eq!(ym.to_string(), "2025-06");
        assert!("2025-13".parse::<YearMonth>().is_err());
        assert!("june".parse::<YearMonth>().is_err());
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(YearMonth::new(2024, 2).unwrap().days_in_month(), 29);
        assert_eq!(YearMonth::new(2025, 2).unwrap().days_in_month(), 28);
        assert_eq!(YearMonth::new(2025, 6).unwrap().days_in_month(), 30);
        assert!(!YearMonth::new(2025, 6).unwrap().is_valid_day(31));
    }

    #[test]
    fn test_is_school_day() {
        // 2025-06-10 is a Tuesday, 2025-06-14 a Saturday
        assert!(is_school_day(NaiveDate::from_ymd_opt(2025, 6, 10).unwrap()));
        assert!(!is_school_day(NaiveDate::from_ymd_opt(2025, 6, 14).unwrap()));
        assert!(!is_school_day(NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()));
    }

    #[test]
    fn test_serde_as_string() {
        let ym = YearMonth::new(2025, 6).unwrap();
        let json = serde_json::to_string(&ym).unwrap();
        assert_eq!(json, "\"2025-06\"");
        let back: YearMonth = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ym);
    }
}
