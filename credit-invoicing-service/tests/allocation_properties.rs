//! Property tests for the credit waterfall.

use chrono::{NaiveDate, TimeZone, Utc};
use credit_invoicing_service::models::{Credit, ProductType, Utilization};
use credit_invoicing_service::services::{allocate, Allocation, Charge};
use proptest::prelude::*;
use rust_decimal::Decimal;

fn cents(value: i64) -> Decimal {
    Decimal::new(value, 2)
}

fn credit(index: usize, amount_cents: i64) -> Credit {
    let amount = cents(amount_cents);
    Credit {
        id: format!("cr-{}", index),
        name: format!("Credit {}", index),
        entity_id: "ent-1".to_string(),
        product: ProductType::AmazonWebServices,
        assets: vec![],
        scope: vec![],
        amount,
        remaining: amount,
        remaining_at_period_start: amount,
        start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        end_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        utilization: Utilization::new(),
        touched: false,
        depletion_date: None,
        version: Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(),
    }
}

fn run(costs: &[(i64, u32)], credits: &mut [Credit]) -> Vec<Allocation> {
    costs
        .iter()
        .map(|(cost_cents, day)| {
            let charge = Charge {
                entity_id: "ent-1",
                asset_id: "amazon-web-services-111",
                resource: "compute/vm",
                account_key: "111",
                date: NaiveDate::from_ymd_opt(2024, 5, *day).unwrap(),
                cost: cents(*cost_cents),
                discount: None,
            };
            allocate(&charge, credits)
        })
        .collect()
}

fn costs_strategy() -> impl Strategy<Value = Vec<(i64, u32)>> {
    prop::collection::vec((-2_000i64..20_000, 1u32..=31), 0..40)
}

fn credits_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0i64..30_000, 0..6)
}

proptest! {
    #[test]
    fn remaining_never_goes_negative(costs in costs_strategy(), amounts in credits_strategy()) {
        let mut credits: Vec<Credit> =
            amounts.iter().enumerate().map(|(i, a)| credit(i, *a)).collect();

        run(&costs, &mut credits);

        for credit in &credits {
            prop_assert!(credit.remaining >= Decimal::ZERO);
            prop_assert!(credit.remaining <= credit.amount);
        }
    }

    #[test]
    fn consumption_is_conserved(costs in costs_strategy(), amounts in credits_strategy()) {
        let mut credits: Vec<Credit> =
            amounts.iter().enumerate().map(|(i, a)| credit(i, *a)).collect();

        let allocations = run(&costs, &mut credits);

        for ((cost_cents, _), allocation) in costs.iter().zip(&allocations) {
            let per_credit: Decimal = allocation.per_credit.iter().map(|(_, a)| *a).sum();
            prop_assert_eq!(allocation.consumed, per_credit);
            prop_assert!(allocation.consumed <= cents(*cost_cents).max(Decimal::ZERO));
        }

        let consumed: Decimal = allocations.iter().map(|a| a.consumed).sum();
        let drawn: Decimal = credits.iter().map(|c| c.amount - c.remaining).sum();
        prop_assert_eq!(consumed, drawn);

        for credit in &credits {
            prop_assert_eq!(credit.total_utilization(), credit.amount - credit.remaining);
        }
    }

    #[test]
    fn uncovered_cost_means_credits_are_exhausted(
        costs in costs_strategy(),
        amounts in credits_strategy(),
    ) {
        let mut credits: Vec<Credit> =
            amounts.iter().enumerate().map(|(i, a)| credit(i, *a)).collect();

        let allocations = run(&costs, &mut credits);

        let short = costs
            .iter()
            .zip(&allocations)
            .any(|((cost_cents, _), a)| a.consumed < cents(*cost_cents));
        if short {
            prop_assert!(credits.iter().all(|c| c.remaining.is_zero()));
        }
    }

    #[test]
    fn allocation_is_deterministic(costs in costs_strategy(), amounts in credits_strategy()) {
        let mut first: Vec<Credit> =
            amounts.iter().enumerate().map(|(i, a)| credit(i, *a)).collect();
        let mut second = first.clone();

        let a = run(&costs, &mut first);
        let b = run(&costs, &mut second);

        prop_assert_eq!(a, b);
        prop_assert_eq!(first, second);
    }
}
