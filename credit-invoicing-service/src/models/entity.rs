//! Billing entities, buckets and asset assignments.

use crate::models::ProductType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How an entity's rows are split into invoices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoicingMode {
    /// One invoice per entity.
    Single,
    /// One invoice per entity and product type.
    #[default]
    Group,
    /// One invoice per entity bucket (and marketplace category).
    Custom,
}

impl InvoicingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "SINGLE",
            Self::Group => "GROUP",
            Self::Custom => "CUSTOM",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "SINGLE" => Self::Single,
            "CUSTOM" => Self::Custom,
            _ => Self::Group,
        }
    }
}

impl fmt::Display for InvoicingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MarketplaceSettings {
    pub separate_invoice: bool,
    pub invoice_per_service: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInvoicing {
    pub mode: InvoicingMode,
    pub default_bucket: Option<Bucket>,
    pub marketplace: MarketplaceSettings,
}

/// A billing profile that invoices are issued to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub customer_id: String,
    pub name: String,
    pub priority_id: String,
    pub currency: String,
    pub active: bool,
    pub invoicing: EntityInvoicing,
    pub buckets: Vec<Bucket>,
}

impl Entity {
    pub fn bucket(&self, bucket_id: &str) -> Option<&Bucket> {
        self.buckets.iter().find(|b| b.id == bucket_id)
    }
}

/// Per-customer invoicing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CustomerSettings {
    /// Raises the overflow threshold above the service default; never lowers it.
    pub max_line_items: Option<usize>,
}

/// Assignment of a billed asset (cloud account, billing account, subscription)
/// to an entity and optional bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSettings {
    pub asset_id: String,
    pub customer_id: String,
    pub product: ProductType,
    pub entity_id: Option<String>,
    pub bucket_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl AssetSettings {
    /// Asset ids are `<product>-<account>`; this strips the product prefix.
    pub fn account_id(&self) -> &str {
        self.asset_id
            .strip_prefix(self.product.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .unwrap_or(&self.asset_id)
    }
}
