//! Configuration module for credit-invoicing-service.

use crate::services::invoices::FinalizePolicy;
use crate::workers::CoordinatorSettings;
use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct InvoicingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub store_backend: StoreBackend,
    pub database: Option<DatabaseConfig>,
    pub invoicing: InvoicingSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoicingSettings {
    pub max_invoice_rows: usize,
    pub default_max_line_items: usize,
    pub non_final_expiry_days: i64,
    pub low_cost_threshold: Decimal,
    pub plps_base_percent: Decimal,
}

impl Default for InvoicingSettings {
    fn default() -> Self {
        Self {
            max_invoice_rows: 500,
            default_max_line_items: 10,
            non_final_expiry_days: 45,
            low_cost_threshold: Decimal::ONE,
            plps_base_percent: Decimal::from(3),
        }
    }
}

impl InvoicingSettings {
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            max_invoice_rows: self.max_invoice_rows,
            default_max_line_items: self.default_max_line_items,
            finalize: FinalizePolicy {
                low_cost_threshold: self.low_cost_threshold,
                non_final_expiry: chrono::Duration::days(self.non_final_expiry_days),
            },
            plps_base_percent: self.plps_base_percent,
        }
    }
}

/// Parse an optional environment variable, failing on values that do not parse.
fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value '{}'", name, raw))
        }),
        Err(_) => Ok(default),
    }
}

impl InvoicingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let store_backend = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "postgres".to_string())
            .as_str()
        {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "STORE_BACKEND must be 'postgres' or 'memory', got '{}'",
                    other
                )))
            }
        };

        let database = match store_backend {
            StoreBackend::Postgres => Some(DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_var("DATABASE_MIN_CONNECTIONS", 2)?,
            }),
            StoreBackend::Memory => None,
        };

        let defaults = InvoicingSettings::default();
        let invoicing = InvoicingSettings {
            max_invoice_rows: parse_var("INVOICING_MAX_INVOICE_ROWS", defaults.max_invoice_rows)?,
            default_max_line_items: parse_var(
                "INVOICING_DEFAULT_MAX_LINE_ITEMS",
                defaults.default_max_line_items,
            )?,
            non_final_expiry_days: parse_var(
                "INVOICING_NON_FINAL_EXPIRY_DAYS",
                defaults.non_final_expiry_days,
            )?,
            low_cost_threshold: parse_var(
                "INVOICING_LOW_COST_THRESHOLD",
                defaults.low_cost_threshold,
            )?,
            plps_base_percent: parse_var(
                "INVOICING_PLPS_BASE_PERCENT",
                defaults.plps_base_percent,
            )?,
        };

        if invoicing.max_invoice_rows == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "INVOICING_MAX_INVOICE_ROWS must be positive"
            )));
        }
        if invoicing.plps_base_percent.is_zero() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "INVOICING_PLPS_BASE_PERCENT must not be zero"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "credit-invoicing-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            store_backend,
            database,
            invoicing,
        })
    }
}
