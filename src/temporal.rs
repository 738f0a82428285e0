// Temporal Model - monthly reporting periods
//
// Market data is published per reference month (mes_referencia). A Period is
// that month as a value: ordered, printable as "YYYY-MM", and parsed from the
// handful of shapes the sources use.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// PERIOD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    year: i32,
    month: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse `{0}` as a year-month period")]
pub struct PeriodParseError(pub String);

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Period { year, month })
        } else {
            None
        }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Period {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn next(&self) -> Period {
        if self.month == 12 {
            Period {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Period {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Period `months` months before this one
    pub fn minus_months(&self, months: u32) -> Period {
        let index = self.year as i64 * 12 + (self.month as i64 - 1) - months as i64;
        Period {
            year: index.div_euclid(12) as i32,
            month: index.rem_euclid(12) as u32 + 1,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = PeriodParseError;

    /// Accepts "2025-01", "2025-01-15", "2025-01-15T10:00:00", "01/2025",
    /// "15/01/2025" and "202501".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PeriodParseError(s.to_string());
        let t = s.trim();

        // Full dates first
        let date_part = t.split(['T', ' ']).next().unwrap_or(t);
        if let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
            return Ok(Period::from_date(date));
        }
        if let Ok(date) = NaiveDate::parse_from_str(date_part, "%d/%m/%Y") {
            return Ok(Period::from_date(date));
        }

        let (year, month) = if let Some((y, m)) = t.split_once('-') {
            (y, m)
        } else if let Some((m, y)) = t.split_once('/') {
            (y, m)
        } else if t.len() == 6 && t.chars().all(|c| c.is_ascii_digit()) {
            (&t[..4], &t[4..])
        } else {
            return Err(err());
        };

        let year: i32 = year.trim().parse().map_err(|_| err())?;
        let month: u32 = month.trim().parse().map_err(|_| err())?;
        Period::new(year, month).ok_or_else(err)
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// PERIOD RANGE
// ============================================================================

/// Inclusive range; an open bound matches everything on that side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRange {
    pub from: Option<Period>,
    pub to: Option<Period>,
}

impl PeriodRange {
    pub fn new(from: Option<Period>, to: Option<Period>) -> Self {
        PeriodRange { from, to }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, period: &Period) -> bool {
        self.from.map_or(true, |from| *period >= from) && self.to.map_or(true, |to| *period <= to)
    }

    /// The last `years` years (at least one) up to and including `reference`
    pub fn trailing_years(reference: Period, years: u32) -> Self {
        PeriodRange {
            from: Some(reference.minus_months(years.max(1) * 12 - 1)),
            to: Some(reference),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Period {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_shapes() {
        assert_eq!(p("2025-01"), Period::new(2025, 1).unwrap());
        assert_eq!(p("2025-01-15"), Period::new(2025, 1).unwrap());
        assert_eq!(p("2025-03-31T12:00:00"), Period::new(2025, 3).unwrap());
        assert_eq!(p("01/2025"), Period::new(2025, 1).unwrap());
        assert_eq!(p("15/02/2025"), Period::new(2025, 2).unwrap());
        assert_eq!(p("202512"), Period::new(2025, 12).unwrap());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("2025-13".parse::<Period>().is_err());
        assert!("jan/2025".parse::<Period>().is_err());
        assert!("".parse::<Period>().is_err());
    }

    #[test]
    fn test_ordering_and_display() {
        assert!(p("2024-12") < p("2025-01"));
        assert_eq!(p("2025-1").to_string(), "2025-01");
    }

    #[test]
    fn test_month_arithmetic() {
        assert_eq!(p("2024-12").next(), p("2025-01"));
        assert_eq!(p("2025-02").minus_months(3), p("2024-11"));
        assert_eq!(p("2025-01").minus_months(12), p("2024-01"));
    }

    #[test]
    fn test_range() {
        let range = PeriodRange::new(Some(p("2025-01")), Some(p("2025-03")));
        assert!(range.contains(&p("2025-01")));
        assert!(range.contains(&p("2025-03")));
        assert!(!range.contains(&p("2025-04")));
        assert!(PeriodRange::all().contains(&p("1999-01")));

        let window = PeriodRange::trailing_years(p("2025-06"), 1);
        assert_eq!(window.from, Some(p("2024-07")));
        assert!(window.contains(&p("2025-06")));
        assert!(!window.contains(&p("2024-06")));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&p("2025-01")).unwrap();
        assert_eq!(json, "\"2025-01\"");
        let back: Period = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p("2025-01"));
    }
}
