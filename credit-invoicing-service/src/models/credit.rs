//! Prepaid credit balances.

use crate::models::{InvoiceMonth, ProductType};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Consumed amounts keyed by month (`YYYY-MM`) then allocation key
/// (account id, virtual marketplace account, or `<account>-discount`).
pub type Utilization = BTreeMap<String, BTreeMap<String, Decimal>>;

/// Alert raised on a credit when it is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditAlertKind {
    /// The credit reached zero during the run.
    Depleted,
    /// Last month's consumption exceeded what was left at the start of this month.
    BurnRate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditAlert {
    pub kind: CreditAlertKind,
    pub triggered: bool,
    pub remaining_amount: Decimal,
    pub last_month_amount: Option<Decimal>,
}

/// A credit as held by the external credit store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditRecord {
    pub id: String,
    pub customer_id: String,
    pub name: String,
    pub product: ProductType,
    pub entity_id: Option<String>,
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    pub amount: Decimal,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub utilization: Utilization,
    pub depletion_date: Option<NaiveDate>,
    #[serde(default)]
    pub alerts: BTreeMap<CreditAlertKind, CreditAlert>,
    /// Last write timestamp, used as the optimistic concurrency version.
    pub updated_utc: DateTime<Utc>,
}

/// A credit loaded for one invoicing run. Owned by exactly one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Credit {
    pub id: String,
    pub name: String,
    pub entity_id: String,
    pub product: ProductType,
    pub assets: Vec<String>,
    pub scope: Vec<String>,
    pub amount: Decimal,
    pub remaining: Decimal,
    pub remaining_at_period_start: Decimal,
    pub start_date: NaiveDate,
    /// Exclusive upper bound.
    pub end_date: NaiveDate,
    pub utilization: Utilization,
    pub touched: bool,
    pub depletion_date: Option<NaiveDate>,
    pub version: DateTime<Utc>,
}

impl Credit {
    pub fn covers_asset(&self, asset_id: &str) -> bool {
        self.assets.is_empty() || self.assets.iter().any(|a| a == asset_id)
    }

    pub fn covers_scope(&self, resource: &str) -> bool {
        self.scope.is_empty() || self.scope.iter().any(|s| s == resource)
    }

    /// True when `date` falls in `[start_date, end_date)`.
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        date >= self.start_date && date < self.end_date
    }

    pub fn month_utilization(&self, month: &InvoiceMonth) -> Decimal {
        self.utilization
            .get(&month.key())
            .map(|accounts| accounts.values().copied().sum())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn total_utilization(&self) -> Decimal {
        self.utilization
            .values()
            .flat_map(|accounts| accounts.values())
            .copied()
            .sum()
    }

    /// The alert to persist with this credit for `month`, if any.
    pub fn pending_alert(&self, month: &InvoiceMonth) -> Option<CreditAlert> {
        if self.depletion_date.is_some() {
            return Some(CreditAlert {
                kind: CreditAlertKind::Depleted,
                triggered: true,
                remaining_amount: self.remaining_at_period_start,
                last_month_amount: None,
            });
        }

        let previous = month.previous().key();
        let last_month = self.utilization.get(&previous)?;
        let last_month_amount: Decimal = last_month.values().copied().sum();

        (self.remaining_at_period_start - last_month_amount < Decimal::ZERO).then(|| CreditAlert {
            kind: CreditAlertKind::BurnRate,
            triggered: true,
            remaining_amount: self.remaining_at_period_start,
            last_month_amount: Some(last_month_amount),
        })
    }

    /// The write-back payload for a touched credit.
    pub fn to_update(&self, month: &InvoiceMonth) -> CreditUpdate {
        CreditUpdate {
            credit_id: self.id.clone(),
            utilization: self.utilization.clone(),
            depletion_date: self.depletion_date,
            alert: self.pending_alert(month),
            expected_version: self.version,
        }
    }
}

/// Mutations of one credit to persist at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditUpdate {
    pub credit_id: String,
    pub utilization: Utilization,
    pub depletion_date: Option<NaiveDate>,
    pub alert: Option<CreditAlert>,
    pub expected_version: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn credit() -> Credit {
        Credit {
            id: "cr-1".to_string(),
            name: "Launch credit".to_string(),
            entity_id: "e1".to_string(),
            product: ProductType::AmazonWebServices,
            assets: vec![],
            scope: vec![],
            amount: dec!(100),
            remaining: dec!(40),
            remaining_at_period_start: dec!(40),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            utilization: Utilization::new(),
            touched: false,
            depletion_date: None,
            version: Utc::now(),
        }
    }

    #[test]
    fn test_active_window_is_half_open() {
        let credit = credit();
        assert!(credit.is_active_on(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
        assert!(credit.is_active_on(NaiveDate::from_ymd_opt(2024, 5, 31).unwrap()));
        assert!(!credit.is_active_on(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()));
    }

    #[test]
    fn test_unrestricted_credit_covers_everything() {
        let mut credit = credit();
        assert!(credit.covers_asset("amazon-web-services-1"));
        credit.assets = vec!["amazon-web-services-2".to_string()];
        assert!(!credit.covers_asset("amazon-web-services-1"));
        assert!(credit.covers_scope("any/sku"));
    }

    #[test]
    fn test_depleted_alert_wins() {
        let mut credit = credit();
        credit.depletion_date = NaiveDate::from_ymd_opt(2024, 3, 3);
        let alert = credit
            .pending_alert(&InvoiceMonth::new(2024, 3).unwrap())
            .unwrap();
        assert_eq!(alert.kind, CreditAlertKind::Depleted);
        assert_eq!(alert.remaining_amount, dec!(40));
    }

    #[test]
    fn test_burn_rate_alert_when_last_month_exceeds_remaining() {
        let mut credit = credit();
        credit
            .utilization
            .entry("2024-02".to_string())
            .or_default()
            .insert("acct".to_string(), dec!(45));
        let alert = credit
            .pending_alert(&InvoiceMonth::new(2024, 3).unwrap())
            .unwrap();
        assert_eq!(alert.kind, CreditAlertKind::BurnRate);
        assert_eq!(alert.last_month_amount, Some(dec!(45)));

        credit.utilization.clear();
        assert!(credit
            .pending_alert(&InvoiceMonth::new(2024, 3).unwrap())
            .is_none());
    }
}
