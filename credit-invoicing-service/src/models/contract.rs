//! Contracts carrying percentage-based partner charges.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A PLPS contract as stored by the contract administration process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub customer_id: String,
    pub active: bool,
    #[serde(default)]
    pub assets: Vec<String>,
    pub start_date: NaiveDate,
    /// `None` for open-ended (on-demand) contracts.
    pub end_date: Option<NaiveDate>,
    pub plps_percent: Decimal,
}

/// A half-open `[start_date, end_date)` window charged at `percent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractChargeInterval {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub percent: Decimal,
}

impl ContractChargeInterval {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date < self.end_date
    }
}
