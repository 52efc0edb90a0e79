//! Billing month arithmetic.

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A calendar month being invoiced, keyed as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvoiceMonth(NaiveDate);

impl InvoiceMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(Self)
    }

    /// The month containing `date`.
    pub fn containing(date: NaiveDate) -> Self {
        Self(date.with_day(1).unwrap_or(date))
    }

    /// Parse a `YYYY-MM` month key.
    pub fn parse(key: &str) -> Option<Self> {
        let (year, month) = key.split_once('-')?;
        if year.len() != 4 || month.len() != 2 {
            return None;
        }
        Self::new(year.parse().ok()?, month.parse().ok()?)
    }

    pub fn key(&self) -> String {
        self.0.format("%Y-%m").to_string()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next().first_day().pred_opt().unwrap_or(self.0)
    }

    pub fn next(&self) -> Self {
        Self(self.0.checked_add_months(Months::new(1)).unwrap_or(self.0))
    }

    pub fn previous(&self) -> Self {
        Self(self.0.checked_sub_months(Months::new(1)).unwrap_or(self.0))
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.first_day() && date <= self.last_day()
    }

    /// Label used in invoice details, e.g. `Covering May 2024`.
    pub fn covering_label(&self) -> String {
        format!("Covering {}", self.0.format("%B %Y"))
    }
}

impl fmt::Display for InvoiceMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl Serialize for InvoiceMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> Deserialize<'de> for InvoiceMonth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        InvoiceMonth::parse(&key)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid invoice month '{}'", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_key() {
        let month = InvoiceMonth::parse("2024-02").unwrap();
        assert_eq!(month.key(), "2024-02");
        assert_eq!(month.last_day(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert!(InvoiceMonth::parse("2024-2").is_none());
        assert!(InvoiceMonth::parse("2024-13").is_none());
    }

    #[test]
    fn test_previous_wraps_year() {
        let month = InvoiceMonth::new(2024, 1).unwrap();
        assert_eq!(month.previous().key(), "2023-12");
        assert_eq!(month.next().key(), "2024-02");
    }

    #[test]
    fn test_covering_label() {
        let month = InvoiceMonth::new(2023, 8).unwrap();
        assert_eq!(month.covering_label(), "Covering August 2023");
    }
}
