//! End-to-end invoicing run tests against the in-memory store.

mod common;

use common::{
    asset, bucketed_entity, credit, date, entity, marketplace_usage, month, usage,
    ConcurrentEditStore, TestHarness, CUSTOMER_ID, ENTITY_ID,
};
use credit_invoicing_service::models::{
    CreditAlertKind, CustomerSettings, InvoiceRow, InvoicingMode, ProductType, RowRank, RunStatus,
};
use credit_invoicing_service::workers::InvoicingCoordinator;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use service_core::error::AppError;
use std::sync::Arc;

const AWS: ProductType = ProductType::AmazonWebServices;
const GCP: ProductType = ProductType::GoogleCloud;

async fn seed_aws_accounts(harness: &TestHarness) {
    harness
        .store
        .insert_entity(entity(ENTITY_ID, InvoicingMode::Group))
        .await;
    harness
        .store
        .insert_asset_settings(asset(AWS, "111", ENTITY_ID))
        .await;
    harness
        .store
        .insert_asset_settings(asset(AWS, "222", ENTITY_ID))
        .await;
    harness
        .store
        .insert_cost_line_items(
            CUSTOMER_ID,
            AWS,
            month(),
            vec![
                usage(AWS, "111", 1, dec!(60)),
                usage(AWS, "111", 2, dec!(40)),
                usage(AWS, "222", 1, dec!(50)),
            ],
        )
        .await;
}

#[tokio::test]
async fn test_aws_credit_consumed_in_date_order() {
    let harness = TestHarness::new();
    seed_aws_accounts(&harness).await;
    harness.store.insert_credit(credit("cr-1", AWS, dec!(120))).await;

    let summary = harness.run().await;

    assert_eq!(summary.run.status, RunStatus::Completed);
    assert_eq!(summary.run.products_failed, 0);
    assert_eq!(summary.run.invoices_created, 1);
    assert_eq!(summary.credits_written, 1);

    let documents = harness.documents_for(AWS).await;
    assert_eq!(documents.len(), 1);
    let invoice = &documents[0];
    assert_eq!(invoice.invoice_key, "ent-1-amazon-web-services");
    assert!(invoice.is_final);

    let details: Vec<&str> = invoice.rows.iter().map(|r| r.details.as_str()).collect();
    assert_eq!(details, vec!["Account #111", "Account #222", "Credit cr-1"]);
    assert_eq!(invoice.rows[0].total, dec!(100));
    assert_eq!(invoice.rows[1].total, dec!(50));
    assert_eq!(invoice.rows[2].total, dec!(-120));
    assert_eq!(invoice.rows[2].rank, RowRank::Credit);

    let stored = harness.store.credit("cr-1").await.unwrap();
    let may = &stored.utilization["2024-05"];
    assert_eq!(may["111"], dec!(70));
    assert_eq!(may["222"], dec!(50));
    assert_eq!(stored.depletion_date, Some(date(2)));
    assert!(stored.alerts.contains_key(&CreditAlertKind::Depleted));
}

#[tokio::test]
async fn test_fully_covered_invoice_gets_negative_correction() {
    let harness = TestHarness::new();
    seed_aws_accounts(&harness).await;
    harness.store.insert_credit(credit("cr-1", AWS, dec!(500))).await;

    harness.run().await;

    let invoice = &harness.documents_for(AWS).await[0];
    let correction = invoice.rows.last().unwrap();
    assert_eq!(correction.details, "Correction");
    assert_eq!(correction.total, dec!(-0.01));

    let total: Decimal = invoice.rows.iter().map(|r| r.total).sum();
    assert_eq!(total, dec!(-0.01));
}

#[tokio::test]
async fn test_rerun_rederives_credit_balance() {
    let harness = TestHarness::new();
    seed_aws_accounts(&harness).await;
    harness.store.insert_credit(credit("cr-1", AWS, dec!(80))).await;

    harness.run().await;
    let first = harness.store.credit("cr-1").await.unwrap();
    let first_rows = harness.documents_for(AWS).await[0].rows.clone();

    harness.run().await;
    let second = harness.store.credit("cr-1").await.unwrap();
    let documents = harness.documents_for(AWS).await;

    assert_eq!(first.utilization, second.utilization);
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].rows, first_rows);
    let consumed: Decimal = second.utilization["2024-05"].values().copied().sum();
    assert_eq!(consumed, dec!(80));
}

/// Seed two accounts, one with marketplace and discounted spend, and two
/// credits competing for them.
async fn seed_mixed_month(harness: &TestHarness) {
    let mut entity = bucketed_entity(ENTITY_ID, "b1", "Main");
    entity.invoicing.marketplace.separate_invoice = true;
    harness.store.insert_entity(entity).await;
    for account in ["111", "222"] {
        harness
            .store
            .insert_asset_settings(asset(AWS, account, ENTITY_ID))
            .await;
    }

    let mut discounted = usage(AWS, "222", 4, dec!(80));
    discounted.discount = Some(dec!(0.9));
    harness
        .store
        .insert_cost_line_items(
            CUSTOMER_ID,
            AWS,
            month(),
            vec![
                usage(AWS, "111", 3, dec!(45)),
                marketplace_usage("111", 2, dec!(25.2), "mangoDB"),
                marketplace_usage("111", 2, dec!(30.3), "couchDB"),
                discounted,
                usage(AWS, "222", 1, dec!(12)),
            ],
        )
        .await;
    harness.store.insert_credit(credit("cr-a", AWS, dec!(60))).await;
    harness.store.insert_credit(credit("cr-b", AWS, dec!(40))).await;
}

/// Invoice keys with their rows, in a stable order. Document and group ids
/// are left out as they are minted per run.
async fn invoice_layout(harness: &TestHarness) -> Vec<(String, i32, Vec<InvoiceRow>)> {
    let mut layout: Vec<(String, i32, Vec<InvoiceRow>)> = harness
        .store
        .documents()
        .await
        .into_iter()
        .map(|d| (d.invoice_key, d.chunk_index, d.rows))
        .collect();
    layout.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
    layout
}

#[tokio::test]
async fn test_identical_input_gives_identical_invoices() {
    let first = TestHarness::new();
    let second = TestHarness::new();
    seed_mixed_month(&first).await;
    seed_mixed_month(&second).await;

    let first_summary = first.run().await;
    let second_summary = second.run().await;

    assert_eq!(first_summary.stats, second_summary.stats);
    assert_eq!(first_summary.credits_written, 2);

    let layout = invoice_layout(&first).await;
    let keys: Vec<&str> = layout.iter().map(|(key, _, _)| key.as_str()).collect();
    assert_eq!(keys, vec!["ent-1-b1", "ent-1-b1_marketplace_aggregate"]);
    assert_eq!(layout, invoice_layout(&second).await);

    for id in ["cr-a", "cr-b"] {
        let a = first.store.credit(id).await.unwrap();
        let b = second.store.credit(id).await.unwrap();
        assert_eq!(a.utilization, b.utilization);
        assert_eq!(a.depletion_date, b.depletion_date);
    }
}

#[tokio::test]
async fn test_failed_product_does_not_block_others() {
    let harness = TestHarness::new();
    seed_aws_accounts(&harness).await;
    harness
        .store
        .insert_asset_settings(asset(GCP, "billing-1", ENTITY_ID))
        .await;
    harness
        .store
        .insert_cost_line_items(
            CUSTOMER_ID,
            GCP,
            month(),
            vec![usage(GCP, "billing-1", 3, dec!(75))],
        )
        .await;
    harness
        .store
        .fail_reads_for(GCP, "analytics dataset unavailable")
        .await;

    let summary = harness.run().await;

    assert_eq!(summary.run.status, RunStatus::Completed);
    assert_eq!(summary.run.products_failed, 1);
    assert_eq!(summary.product_errors.len(), 1);
    assert_eq!(summary.product_errors[0].product, Some(GCP));
    assert_eq!(summary.product_errors[0].kind, "database");

    assert_eq!(harness.documents_for(AWS).await.len(), 1);
    assert!(harness.documents_for(GCP).await.is_empty());
    assert_eq!(harness.store.month_errors().await.len(), 1);
}

#[tokio::test]
async fn test_failed_product_keeps_previous_documents() {
    let harness = TestHarness::new();
    seed_aws_accounts(&harness).await;
    harness
        .store
        .insert_asset_settings(asset(GCP, "billing-1", ENTITY_ID))
        .await;
    harness
        .store
        .insert_cost_line_items(
            CUSTOMER_ID,
            GCP,
            month(),
            vec![usage(GCP, "billing-1", 3, dec!(75))],
        )
        .await;

    harness.run().await;
    let previous = harness.documents_for(GCP).await;
    assert_eq!(previous.len(), 1);
    assert_eq!(previous[0].rows[0].details, "Project 'billing-1'");

    harness.store.fail_reads_for(GCP, "quota exceeded").await;
    harness.run().await;

    let current = harness.documents_for(GCP).await;
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].document_id, previous[0].document_id);
}

#[tokio::test]
async fn test_custom_invoicing_splits_marketplace_per_service() {
    let harness = TestHarness::new();
    let mut entity = bucketed_entity(ENTITY_ID, "b1", "Main");
    entity.invoicing.marketplace.separate_invoice = true;
    entity.invoicing.marketplace.invoice_per_service = true;
    harness.store.insert_entity(entity).await;
    harness
        .store
        .insert_asset_settings(asset(AWS, "111", ENTITY_ID))
        .await;
    harness
        .store
        .insert_cost_line_items(
            CUSTOMER_ID,
            AWS,
            month(),
            vec![
                usage(AWS, "111", 1, dec!(20)),
                marketplace_usage("111", 1, dec!(30), "mangoDB"),
            ],
        )
        .await;

    harness.run().await;

    let documents = harness.documents_for(AWS).await;
    assert_eq!(documents.len(), 2);

    let plain = documents
        .iter()
        .find(|d| d.invoice_key == "ent-1-b1")
        .unwrap();
    assert_eq!(plain.rows[0].rank, RowRank::BucketHeader);
    assert_eq!(plain.rows[0].details, "Main");
    assert_eq!(
        plain.rows[1].details,
        "Account #111 : excluding Marketplace costs"
    );
    assert_eq!(plain.rows[1].total, dec!(20));

    let marketplace = documents
        .iter()
        .find(|d| d.invoice_key.starts_with("ent-1-b1_marketplace_"))
        .unwrap();
    assert!(marketplace.rows[0].details.starts_with("Main_marketplace_"));
    assert_eq!(marketplace.rows[1].details, "Account #111 : mangoDB");
    assert_eq!(marketplace.rows[1].total, dec!(30));
}

#[tokio::test]
async fn test_overflow_threshold_raised_by_customer_setting() {
    let harness = TestHarness::new();
    harness
        .store
        .insert_entity(entity(ENTITY_ID, InvoicingMode::Group))
        .await;
    let mut items = Vec::new();
    for n in 0..12 {
        let account = format!("{}", 100 + n);
        harness
            .store
            .insert_asset_settings(asset(AWS, &account, ENTITY_ID))
            .await;
        items.push(usage(AWS, &account, 1, dec!(10)));
    }
    harness
        .store
        .insert_cost_line_items(CUSTOMER_ID, AWS, month(), items)
        .await;

    harness.run().await;
    let folded = &harness.documents_for(AWS).await[0];
    assert_eq!(folded.rows.len(), 11);
    assert_eq!(folded.rows[10].details, "Additional accounts");
    assert_eq!(folded.rows[10].total, dec!(20));

    harness
        .store
        .set_customer_settings(
            CUSTOMER_ID,
            CustomerSettings {
                max_line_items: Some(12),
            },
        )
        .await;
    harness.run().await;
    assert_eq!(harness.documents_for(AWS).await[0].rows.len(), 12);
}

#[tokio::test]
async fn test_inactive_entity_rows_are_dropped() {
    let harness = TestHarness::new();
    let mut inactive = entity("ent-2", InvoicingMode::Group);
    inactive.active = false;
    harness.store.insert_entity(inactive).await;
    harness
        .store
        .insert_asset_settings(asset(ProductType::Looker, "acme", "ent-2"))
        .await;
    harness
        .store
        .insert_cost_line_items(
            CUSTOMER_ID,
            ProductType::Looker,
            month(),
            vec![usage(ProductType::Looker, "acme", 1, dec!(400))],
        )
        .await;

    let summary = harness.run().await;

    assert_eq!(summary.run.products_failed, 1);
    assert_eq!(summary.product_errors[0].kind, "invalid_row");
    assert!(harness.documents_for(ProductType::Looker).await.is_empty());
}

#[tokio::test]
async fn test_excluded_billing_profile_is_not_invoiced() {
    let harness = TestHarness::new();
    let mut excluded = entity(ENTITY_ID, InvoicingMode::Group);
    excluded.priority_id = "999999".to_string();
    harness.store.insert_entity(excluded).await;
    harness
        .store
        .insert_asset_settings(asset(AWS, "111", ENTITY_ID))
        .await;
    harness
        .store
        .insert_cost_line_items(CUSTOMER_ID, AWS, month(), vec![usage(AWS, "111", 1, dec!(9))])
        .await;

    let summary = harness.run().await;

    assert_eq!(summary.run.invoices_created, 0);
    assert!(harness.store.documents().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_credit_edit_fails_the_run() {
    let harness = TestHarness::new();
    seed_aws_accounts(&harness).await;
    harness.store.insert_credit(credit("cr-1", AWS, dec!(50))).await;

    let store = Arc::new(ConcurrentEditStore {
        inner: harness.store.clone(),
    });
    let coordinator = InvoicingCoordinator::new(store, common::coordinator_settings());

    let err = coordinator
        .run(CUSTOMER_ID, month(), -2, common::closing_now())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Conflict(_)));
    assert!(harness.store.documents().await.is_empty());
    let untouched = harness.store.credit("cr-1").await.unwrap();
    assert!(untouched.utilization.is_empty());
}
