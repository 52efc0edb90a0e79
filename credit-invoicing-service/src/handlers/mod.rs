//! HTTP handlers for credit-invoicing-service.

pub mod health;
pub mod runs;

pub use health::{health_check, metrics_handler, readiness_check};
pub use runs::{create_run, get_run, list_invoices};
