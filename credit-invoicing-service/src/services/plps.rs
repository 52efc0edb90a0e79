//! Re-rating of percentage-based partner charges against contract intervals.

use crate::error::InvoicingError;
use crate::models::{Contract, ContractChargeInterval, InvoiceMonth};
use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;

/// Sorted charge intervals for one asset and invoice month.
#[derive(Debug, Clone, PartialEq)]
pub struct PlpsRecalculator {
    base_percent: Decimal,
    intervals: Vec<ContractChargeInterval>,
}

impl PlpsRecalculator {
    pub fn new(base_percent: Decimal, mut intervals: Vec<ContractChargeInterval>) -> Self {
        intervals.sort_by_key(|i| i.start_date);
        Self {
            base_percent,
            intervals,
        }
    }

    /// Build the intervals of every active contract covering `asset_id` that
    /// overlaps `month`. Open-ended contracts run to the day after month end.
    pub fn from_contracts(
        base_percent: Decimal,
        contracts: &[Contract],
        asset_id: &str,
        month: &InvoiceMonth,
    ) -> Self {
        let range_start = month.first_day();
        let range_end = month.last_day();
        let open_end = range_end.checked_add_days(Days::new(1)).unwrap_or(range_end);

        let intervals = contracts
            .iter()
            .filter(|c| c.active && c.assets.iter().any(|a| a == asset_id))
            .filter_map(|c| {
                let end_date = c.end_date.unwrap_or(open_end);
                let overlaps = c.start_date <= range_end && end_date >= range_start;
                overlaps.then_some(ContractChargeInterval {
                    start_date: c.start_date,
                    end_date,
                    percent: c.plps_percent,
                })
            })
            .collect();

        Self::new(base_percent, intervals)
    }

    pub fn intervals(&self) -> &[ContractChargeInterval] {
        &self.intervals
    }

    /// Re-rate `cost`, which was charged at the base percent on `date`, to the
    /// percent of the first interval containing that date.
    pub fn recalculate(&self, date: NaiveDate, cost: Decimal) -> Result<Decimal, InvoicingError> {
        if self.base_percent.is_zero() {
            return Err(InvoicingError::Configuration(
                "PLPS base percent must not be zero".to_string(),
            ));
        }

        self.intervals
            .iter()
            .find(|interval| interval.contains(date))
            .map(|interval| cost / self.base_percent * interval.percent)
            .ok_or(InvoicingError::NoSuitableInterval(date))
    }
}
