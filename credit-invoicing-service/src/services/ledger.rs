//! Loading and re-deriving a worker's private credit list for one month.

use crate::error::InvoicingError;
use crate::models::{Credit, CreditRecord, CreditUpdate, InvoiceMonth};
use crate::services::allocation::DISCOUNT_KEY_SUFFIX;
use crate::services::marketplace::VIRTUAL_ACCOUNT_DELIMITER;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::cmp::Ordering;

/// Remaining balances below this are treated as fully consumed.
const REMAINING_EPSILON: Decimal = dec!(0.0001);

/// The credits one product worker may draw from, in waterfall order.
#[derive(Debug, Clone)]
pub struct CreditLedger {
    month: InvoiceMonth,
    credits: Vec<Credit>,
}

impl CreditLedger {
    /// Build the ledger for `month`.
    ///
    /// Balances are re-derived from the stored utilization on every run, so
    /// running the same month twice gives the same result: entries of the
    /// current month recorded against any of `account_keys` are dropped and
    /// will be recomputed by this run.
    pub fn load(
        records: Vec<CreditRecord>,
        month: InvoiceMonth,
        account_keys: &[String],
    ) -> Result<Self, InvoicingError> {
        let mut credits = Vec::with_capacity(records.len());

        for record in records {
            if let Some(credit) = derive_credit(record, &month, account_keys)? {
                credits.push(credit);
            }
        }

        credits.sort_by(waterfall_order);

        Ok(Self { month, credits })
    }

    pub fn month(&self) -> &InvoiceMonth {
        &self.month
    }

    pub fn credits(&self) -> &[Credit] {
        &self.credits
    }

    pub fn credits_mut(&mut self) -> &mut [Credit] {
        &mut self.credits
    }

    pub fn is_empty(&self) -> bool {
        self.credits.is_empty()
    }

    pub fn get(&self, credit_id: &str) -> Option<&Credit> {
        self.credits.iter().find(|c| c.id == credit_id)
    }

    /// Write-back payloads for every credit mutated by this run.
    pub fn into_updates(self) -> Vec<CreditUpdate> {
        self.credits
            .iter()
            .filter(|c| c.touched)
            .map(|c| c.to_update(&self.month))
            .collect()
    }
}

fn derive_credit(
    record: CreditRecord,
    month: &InvoiceMonth,
    account_keys: &[String],
) -> Result<Option<Credit>, InvoicingError> {
    let entity_id = record.entity_id.ok_or_else(|| {
        InvoicingError::Configuration(format!("credit {} has no entity", record.id))
    })?;
    let end_date = record.end_date.ok_or_else(|| {
        InvoicingError::Configuration(format!("credit {} has no end date", record.id))
    })?;

    let start_month = InvoiceMonth::containing(record.start_date);
    if start_month > *month {
        return Ok(None);
    }

    let month_key = month.key();
    let mut utilization = record.utilization;
    let mut remaining = record.amount;

    if start_month < *month {
        for (key, accounts) in utilization.iter() {
            if key.as_str() < month_key.as_str() {
                remaining -= accounts.values().copied().sum::<Decimal>();
            }
        }
        if remaining < REMAINING_EPSILON {
            remaining = Decimal::ZERO;
        }
    }
    let remaining_at_period_start = remaining;

    if let Some(current) = utilization.get_mut(&month_key) {
        current.retain(|key, _| {
            !account_keys
                .iter()
                .any(|account| is_recorded_against(key, account))
        });
        remaining -= current.values().copied().sum::<Decimal>();
    }

    if remaining <= Decimal::ZERO {
        return Ok(None);
    }

    utilization.entry(month_key).or_default();

    Ok(Some(Credit {
        id: record.id,
        name: record.name,
        entity_id,
        product: record.product,
        assets: record.assets,
        scope: record.scope,
        amount: record.amount,
        remaining,
        remaining_at_period_start,
        start_date: record.start_date,
        end_date,
        utilization,
        touched: false,
        depletion_date: None,
        version: record.updated_utc,
    }))
}

/// True when the utilization `key` was written for `account`: the account
/// itself, its discount part, or one of its marketplace constituents.
fn is_recorded_against(key: &str, account: &str) -> bool {
    let Some(rest) = key.strip_prefix(account) else {
        return false;
    };
    rest.is_empty() || rest == DISCOUNT_KEY_SUFFIX || rest.starts_with(VIRTUAL_ACCOUNT_DELIMITER)
}

/// Most specific and soonest-expiring credits are drawn first.
fn waterfall_order(a: &Credit, b: &Credit) -> Ordering {
    b.assets
        .len()
        .cmp(&a.assets.len())
        .then_with(|| b.scope.len().cmp(&a.scope.len()))
        .then_with(|| a.end_date.cmp(&b.end_date))
        .then_with(|| a.start_date.cmp(&b.start_date))
        .then_with(|| a.remaining.cmp(&b.remaining))
        .then_with(|| a.id.cmp(&b.id))
}
