//! Waterfall allocation of cost against prepaid credits.

use crate::models::{Credit, InvoiceMonth};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// One cost to be offset against credits.
#[derive(Debug, Clone, Copy)]
pub struct Charge<'a> {
    pub entity_id: &'a str,
    pub asset_id: &'a str,
    /// `service/sku`, checked against credit scopes.
    pub resource: &'a str,
    /// Allocation key: an account id or a virtual marketplace account.
    pub account_key: &'a str,
    pub date: NaiveDate,
    /// Undiscounted cost.
    pub cost: Decimal,
    /// Contract discount multiplier in `(0, 1]`.
    pub discount: Option<Decimal>,
}

impl Charge<'_> {
    /// The amount the customer is billed for this charge.
    pub fn billed_cost(&self) -> Decimal {
        self.cost * self.discount.unwrap_or(Decimal::ONE)
    }
}

/// Result of allocating a single charge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Allocation {
    pub consumed: Decimal,
    /// `(credit_id, amount)` in consumption order.
    pub per_credit: Vec<(String, Decimal)>,
}

/// Walk `credits` in order and consume them against `charge`.
///
/// `credits` must already be in waterfall order. Only the credits are
/// mutated; recording spend is left to [`AllocationLedger::record`].
pub fn allocate(charge: &Charge<'_>, credits: &mut [Credit]) -> Allocation {
    let mut allocation = Allocation::default();
    let mut cost = charge.cost;
    let month_key = InvoiceMonth::containing(charge.date).key();

    for credit in credits.iter_mut() {
        if cost <= Decimal::ZERO {
            break;
        }
        if credit.entity_id != charge.entity_id
            || !credit.covers_asset(charge.asset_id)
            || !credit.covers_scope(charge.resource)
            || credit.remaining <= Decimal::ZERO
            || !credit.is_active_on(charge.date)
        {
            continue;
        }

        let consumed = cost.min(credit.remaining);
        record_utilization(credit, &month_key, charge, consumed);
        credit.remaining -= consumed;
        credit.touched = true;
        if credit.remaining.is_zero() && consumed < cost {
            credit.depletion_date = Some(charge.date);
        }

        allocation.consumed += consumed;
        allocation.per_credit.push((credit.id.clone(), consumed));

        cost -= consumed;
    }

    allocation
}

/// Suffix of the utilization key holding the discount part of a redemption.
pub const DISCOUNT_KEY_SUFFIX: &str = "-discount";

/// Utilization is split between the account key (discounted part) and
/// `<account>-discount` so the two always sum to the consumed amount.
fn record_utilization(credit: &mut Credit, month_key: &str, charge: &Charge<'_>, consumed: Decimal) {
    let accounts = credit.utilization.entry(month_key.to_string()).or_default();
    match charge.discount {
        Some(discount) if discount < Decimal::ONE => {
            let discounted = consumed * discount;
            *accounts.entry(charge.account_key.to_string()).or_default() += discounted;
            *accounts
                .entry(format!("{}{}", charge.account_key, DISCOUNT_KEY_SUFFIX))
                .or_default() += consumed - discounted;
        }
        _ => {
            *accounts.entry(charge.account_key.to_string()).or_default() += consumed;
        }
    }
}

/// Spend and credit consumption accumulated by one worker for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationLedger {
    /// Billed cost per allocation key, independent of credit coverage.
    pub spend: BTreeMap<String, Decimal>,
    /// Consumed amount per allocation key and credit.
    pub credit_consumption: BTreeMap<String, BTreeMap<String, Decimal>>,
    /// Discount part of the consumed amount per allocation key and credit,
    /// given back on the invoice as a positive credit-rank row.
    pub discount_adjustments: BTreeMap<String, BTreeMap<String, Decimal>>,
}

impl AllocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `charge` against `credits` and record the outcome.
    pub fn record(&mut self, charge: &Charge<'_>, credits: &mut [Credit]) -> Allocation {
        *self
            .spend
            .entry(charge.account_key.to_string())
            .or_default() += charge.billed_cost();

        let allocation = allocate(charge, credits);
        if allocation.per_credit.is_empty() {
            return allocation;
        }

        let consumption = self
            .credit_consumption
            .entry(charge.account_key.to_string())
            .or_default();
        for (credit_id, amount) in &allocation.per_credit {
            *consumption.entry(credit_id.clone()).or_default() += *amount;
        }

        if let Some(discount) = charge.discount.filter(|d| *d < Decimal::ONE) {
            let adjustments = self
                .discount_adjustments
                .entry(charge.account_key.to_string())
                .or_default();
            for (credit_id, amount) in &allocation.per_credit {
                *adjustments.entry(credit_id.clone()).or_default() +=
                    *amount - *amount * discount;
            }
        }

        allocation
    }

    /// Add spend that is never offset by credits, such as Flexsave savings.
    pub fn record_uncovered(&mut self, account_key: &str, amount: Decimal) {
        *self.spend.entry(account_key.to_string()).or_default() += amount;
    }

    pub fn spend_for(&self, account_key: &str) -> Decimal {
        self.spend.get(account_key).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn total_spend(&self) -> Decimal {
        self.spend.values().copied().sum()
    }

    pub fn total_consumed(&self) -> Decimal {
        self.credit_consumption
            .values()
            .flat_map(|credits| credits.values())
            .copied()
            .sum()
    }

    /// Consumption of `credit_id` summed over every allocation key.
    pub fn consumed_from(&self, credit_id: &str) -> Decimal {
        self.credit_consumption
            .values()
            .filter_map(|credits| credits.get(credit_id))
            .copied()
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProductType, Utilization};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn credit(id: &str, remaining: Decimal, end: NaiveDate) -> Credit {
        Credit {
            id: id.to_string(),
            name: id.to_string(),
            entity_id: "e1".to_string(),
            product: ProductType::AmazonWebServices,
            assets: vec![],
            scope: vec![],
            amount: remaining,
            remaining,
            remaining_at_period_start: remaining,
            start_date: day(1),
            end_date: end,
            utilization: Utilization::new(),
            touched: false,
            depletion_date: None,
            version: Utc::now(),
        }
    }

    fn charge(cost: Decimal, date: NaiveDate) -> Charge<'static> {
        Charge {
            entity_id: "e1",
            asset_id: "amazon-web-services-111",
            resource: "AmazonEC2/BoxUsage",
            account_key: "111",
            date,
            cost,
            discount: None,
        }
    }

    #[test]
    fn test_partial_then_terminal_match() {
        let mut credits = vec![credit("A", dec!(10), day(5)), credit("B", dec!(100), day(20))];
        let mut ledger = AllocationLedger::new();

        let allocation = ledger.record(&charge(dec!(15), day(3)), &mut credits);

        assert_eq!(allocation.consumed, dec!(15));
        assert_eq!(
            allocation.per_credit,
            vec![("A".to_string(), dec!(10)), ("B".to_string(), dec!(5))]
        );
        assert_eq!(credits[0].remaining, dec!(0));
        assert_eq!(credits[0].depletion_date, Some(day(3)));
        assert!(credits[0].touched);
        assert_eq!(credits[1].remaining, dec!(95));
        assert!(credits[1].depletion_date.is_none());
        assert_eq!(ledger.spend_for("111"), dec!(15));
        assert_eq!(ledger.credit_consumption["111"]["A"], dec!(10));
        assert_eq!(ledger.credit_consumption["111"]["B"], dec!(5));
    }

    #[test]
    fn test_uncovered_residual_still_counts_as_spend() {
        let mut credits = vec![credit("A", dec!(10), day(20))];
        let mut ledger = AllocationLedger::new();

        let allocation = ledger.record(&charge(dec!(25), day(3)), &mut credits);

        assert_eq!(allocation.consumed, dec!(10));
        assert_eq!(ledger.spend_for("111"), dec!(25));
        assert_eq!(credits[0].remaining, dec!(0));
    }

    #[test]
    fn test_skips_ineligible_credits() {
        let mut other_entity = credit("other", dec!(50), day(20));
        other_entity.entity_id = "e2".to_string();
        let mut other_asset = credit("asset", dec!(50), day(20));
        other_asset.assets = vec!["amazon-web-services-222".to_string()];
        let mut other_scope = credit("scope", dec!(50), day(20));
        other_scope.scope = vec!["AmazonS3/Requests".to_string()];
        let expired = credit("expired", dec!(50), day(3));
        let mut credits = vec![other_entity, other_asset, other_scope, expired];

        let allocation = allocate(&charge(dec!(5), day(3)), &mut credits);

        assert_eq!(allocation, Allocation::default());
        assert!(credits.iter().all(|c| !c.touched));
    }

    #[test]
    fn test_non_positive_cost_consumes_nothing() {
        let mut credits = vec![credit("A", dec!(10), day(20))];
        let mut ledger = AllocationLedger::new();

        ledger.record(&charge(dec!(-4), day(3)), &mut credits);

        assert_eq!(credits[0].remaining, dec!(10));
        assert_eq!(ledger.spend_for("111"), dec!(-4));
        assert!(ledger.credit_consumption.is_empty());
    }

    #[test]
    fn test_exact_cover_does_not_set_depletion_date() {
        let mut credits = vec![credit("A", dec!(10), day(20))];
        allocate(&charge(dec!(10), day(3)), &mut credits);
        assert_eq!(credits[0].remaining, dec!(0));
        assert!(credits[0].depletion_date.is_none());
    }

    #[test]
    fn test_discount_splits_utilization() {
        let mut credits = vec![credit("A", dec!(100), day(20))];
        let mut ledger = AllocationLedger::new();
        let mut discounted = charge(dec!(20), day(3));
        discounted.discount = Some(dec!(0.9));

        ledger.record(&discounted, &mut credits);

        let month = &credits[0].utilization["2024-03"];
        assert_eq!(month["111"], dec!(18.0));
        assert_eq!(month["111-discount"], dec!(2.0));
        assert_eq!(credits[0].remaining, dec!(80));
        assert_eq!(ledger.spend_for("111"), dec!(18.0));
        assert_eq!(ledger.credit_consumption["111"]["A"], dec!(20));
        assert_eq!(ledger.discount_adjustments["111"]["A"], dec!(2.0));
    }
}
