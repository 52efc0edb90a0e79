//! Product types billed by the invoicing run.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A usage provider or package product. Each one gets its own worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProductType {
    AmazonWebServices,
    AmazonWebServicesStandalone,
    GoogleCloud,
    GoogleCloudStandalone,
    MicrosoftAzure,
    #[serde(rename = "g-suite")]
    GSuite,
    #[serde(rename = "office-365")]
    Office365,
    Looker,
    Navigator,
    Solve,
    SolveAccelerator,
}

impl ProductType {
    pub const ALL: [ProductType; 11] = [
        ProductType::MicrosoftAzure,
        ProductType::AmazonWebServices,
        ProductType::AmazonWebServicesStandalone,
        ProductType::GoogleCloudStandalone,
        ProductType::GoogleCloud,
        ProductType::GSuite,
        ProductType::Office365,
        ProductType::Looker,
        ProductType::Navigator,
        ProductType::Solve,
        ProductType::SolveAccelerator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AmazonWebServices => "amazon-web-services",
            Self::AmazonWebServicesStandalone => "amazon-web-services-standalone",
            Self::GoogleCloud => "google-cloud",
            Self::GoogleCloudStandalone => "google-cloud-standalone",
            Self::MicrosoftAzure => "microsoft-azure",
            Self::GSuite => "g-suite",
            Self::Office365 => "office-365",
            Self::Looker => "looker",
            Self::Navigator => "navigator",
            Self::Solve => "solve",
            Self::SolveAccelerator => "solve-accelerator",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }

    /// Human readable description used on spend rows.
    pub fn description(&self) -> &'static str {
        match self {
            Self::AmazonWebServices | Self::AmazonWebServicesStandalone => "Amazon Web Services",
            Self::GoogleCloud | Self::GoogleCloudStandalone => "Google Cloud",
            Self::MicrosoftAzure => "Microsoft Azure",
            Self::GSuite => "Google Workspace",
            Self::Office365 => "Office 365",
            Self::Looker => "Looker",
            Self::Navigator => "DoiT Navigator",
            Self::Solve => "DoiT Solve",
            Self::SolveAccelerator => "DoiT Solve Accelerator",
        }
    }

    /// Details text of the row that absorbs line items beyond the overflow threshold.
    /// Products without one never fold rows.
    pub fn overflow_details(&self) -> Option<&'static str> {
        match self {
            Self::AmazonWebServices => Some("Additional accounts"),
            Self::GoogleCloud => Some("Additional projects"),
            Self::MicrosoftAzure => Some("Additional Subscriptions"),
            _ => None,
        }
    }

    /// Products whose near-zero totals get a correction row.
    pub fn is_near_zero_corrected(&self) -> bool {
        matches!(self, Self::AmazonWebServices | Self::GoogleCloud)
    }

    /// Products exempt from the low-cost hold.
    pub fn skips_low_cost_hold(&self) -> bool {
        matches!(self, Self::AmazonWebServices | Self::GoogleCloud)
    }

    /// Package products that have no bucket settings and fall back to grouped invoices.
    pub fn lacks_buckets(&self) -> bool {
        matches!(self, Self::Navigator | Self::Solve)
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_type_round_trip_strings() {
        for product in ProductType::ALL {
            assert_eq!(ProductType::from_string(product.as_str()), Some(product));
        }
        assert_eq!(ProductType::from_string("oracle-cloud"), None);
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&ProductType::Office365).unwrap();
        assert_eq!(json, "\"office-365\"");
        let json = serde_json::to_string(&ProductType::AmazonWebServicesStandalone).unwrap();
        assert_eq!(json, "\"amazon-web-services-standalone\"");
    }

    #[test]
    fn test_overflow_details_only_for_usage_products() {
        assert_eq!(
            ProductType::GoogleCloud.overflow_details(),
            Some("Additional projects")
        );
        assert_eq!(ProductType::Looker.overflow_details(), None);
    }
}
