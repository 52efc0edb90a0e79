//! Splitting an account's spend into marketplace constituents.

use crate::models::MarketplaceSettings;
use crate::services::allocation::AllocationLedger;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;

/// Constituent carrying the account's non-marketplace spend.
pub const MARKETPLACE_NONE: &str = "marketplace_none";
/// Category shared by every constituent in aggregate mode.
pub const MARKETPLACE_AGGREGATE: &str = "marketplace_aggregate";
/// Label of the non-marketplace constituent on invoice rows.
pub const MARKETPLACE_NONE_LABEL: &str = "excluding Marketplace costs";

/// Separates an account id from its marketplace constituent in allocation keys.
pub const VIRTUAL_ACCOUNT_DELIMITER: &str = "__";

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a. Stable across releases and platforms.
fn fnv1a32(input: &str) -> u32 {
    input.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Display-safe key of a marketplace service, e.g. `marketplace_1234567890`.
pub fn marketplace_key(descriptor: &str) -> String {
    format!("marketplace_{}", fnv1a32(descriptor))
}

/// Allocation key of the virtual account holding one marketplace service's spend.
pub fn virtual_account_key(account_id: &str, descriptor: &str) -> String {
    joined_key(account_id, &marketplace_key(descriptor))
}

fn joined_key(account_id: &str, key: &str) -> String {
    format!("{}{}{}", account_id, VIRTUAL_ACCOUNT_DELIMITER, key)
}

/// Split an allocation key into the account id and, for virtual accounts,
/// the marketplace constituent key.
pub fn split_allocation_key(key: &str) -> (&str, Option<&str>) {
    match key.split_once(VIRTUAL_ACCOUNT_DELIMITER) {
        Some((account_id, constituent)) => (account_id, Some(constituent)),
        None => (key, None),
    }
}

/// How an entity wants marketplace purchases invoiced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketplaceMode {
    /// Marketplace spend stays on the account row.
    None,
    /// All marketplace constituents share one category.
    Aggregate,
    /// Every marketplace service gets its own category.
    Individual,
}

impl MarketplaceMode {
    pub fn for_account(settings: &MarketplaceSettings, has_constituents: bool) -> Self {
        if !has_constituents {
            return Self::None;
        }
        match (settings.separate_invoice, settings.invoice_per_service) {
            (true, true) => Self::Individual,
            (true, false) => Self::Aggregate,
            _ => Self::None,
        }
    }

    /// Row category of a constituent. Never `marketplace_none`.
    pub fn category(&self, constituent_key: &str) -> String {
        if constituent_key == MARKETPLACE_NONE {
            return String::new();
        }
        match self {
            Self::None => String::new(),
            Self::Aggregate => MARKETPLACE_AGGREGATE.to_string(),
            Self::Individual => constituent_key.to_string(),
        }
    }
}

/// Key under which credit consumption of one entity is batched into credit rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CreditBatchKey {
    pub category: String,
    pub bucket_id: Option<String>,
}

impl CreditBatchKey {
    pub fn new(category: String, bucket_id: Option<String>) -> Self {
        Self {
            category,
            bucket_id,
        }
    }
}

impl fmt::Display for CreditBatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.category[..], &self.bucket_id) {
            ("", Some(bucket)) => write!(f, "{}", bucket),
            ("", None) => Ok(()),
            (category, Some(bucket)) => write!(f, "{}", joined_key(category, bucket)),
            (category, None) => write!(f, "{}", category),
        }
    }
}

/// One slice of an account's spend.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketplaceConstituent {
    /// `marketplace_none` or `marketplace_<hash>`.
    pub key: String,
    /// Text shown after the account id on the spend row.
    pub label: String,
    pub spend: Decimal,
    pub credits: BTreeMap<String, Decimal>,
}

/// Per-account registry of marketplace descriptors seen during allocation.
#[derive(Debug, Clone, Default)]
pub struct MarketplaceSplitter {
    descriptors: BTreeMap<String, BTreeMap<String, String>>,
}

impl MarketplaceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The allocation key for a cost of `account_id`, registering the
    /// descriptor when the cost is a marketplace purchase.
    pub fn allocation_key(&mut self, account_id: &str, marketplace: Option<&str>) -> String {
        match marketplace {
            Some(descriptor) => {
                self.descriptors
                    .entry(account_id.to_string())
                    .or_default()
                    .insert(marketplace_key(descriptor), descriptor.to_string());
                virtual_account_key(account_id, descriptor)
            }
            None => account_id.to_string(),
        }
    }

    pub fn has_constituents(&self, account_id: &str) -> bool {
        self.descriptors
            .get(account_id)
            .is_some_and(|d| !d.is_empty())
    }

    /// Split the allocated spend and credits of `account_id`.
    ///
    /// `flexsave_negations` were booked on the account's own key and are
    /// taken out of `marketplace_none` only, so the returned spends always
    /// sum to the account's spend minus the negations. Returns an empty list
    /// for accounts without marketplace purchases.
    pub fn split(
        &self,
        account_id: &str,
        ledger: &AllocationLedger,
        flexsave_negations: Decimal,
    ) -> Vec<MarketplaceConstituent> {
        let Some(descriptors) = self.descriptors.get(account_id) else {
            return Vec::new();
        };

        let mut constituents = Vec::with_capacity(descriptors.len() + 1);
        constituents.push(MarketplaceConstituent {
            key: MARKETPLACE_NONE.to_string(),
            label: MARKETPLACE_NONE_LABEL.to_string(),
            spend: ledger.spend_for(account_id) - flexsave_negations,
            credits: ledger
                .credit_consumption
                .get(account_id)
                .cloned()
                .unwrap_or_default(),
        });

        for (key, descriptor) in descriptors {
            let virtual_key = joined_key(account_id, key);
            constituents.push(MarketplaceConstituent {
                key: key.clone(),
                label: descriptor.clone(),
                spend: ledger.spend_for(&virtual_key),
                credits: ledger
                    .credit_consumption
                    .get(&virtual_key)
                    .cloned()
                    .unwrap_or_default(),
            });
        }

        constituents
    }

    /// Spend of `account_id` over its own key and every virtual account.
    pub fn account_spend(&self, account_id: &str, ledger: &AllocationLedger) -> Decimal {
        let own = ledger.spend_for(account_id);
        let virtual_spend: Decimal = self
            .descriptors
            .get(account_id)
            .into_iter()
            .flat_map(|d| d.keys())
            .map(|key| ledger.spend_for(&joined_key(account_id, key)))
            .sum();
        own + virtual_spend
    }

    /// Credit consumption of `account_id` summed over its own key and every
    /// virtual account.
    pub fn account_credits(
        &self,
        account_id: &str,
        ledger: &AllocationLedger,
    ) -> BTreeMap<String, Decimal> {
        let mut keys = vec![account_id.to_string()];
        if let Some(descriptors) = self.descriptors.get(account_id) {
            keys.extend(descriptors.keys().map(|key| joined_key(account_id, key)));
        }

        let mut credits = BTreeMap::new();
        for key in keys {
            if let Some(consumed) = ledger.credit_consumption.get(&key) {
                for (credit_id, amount) in consumed {
                    *credits.entry(credit_id.clone()).or_insert(Decimal::ZERO) += *amount;
                }
            }
        }
        credits
    }
}
