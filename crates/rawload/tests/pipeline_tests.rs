//! Pipeline tests against the in-memory stores
//!
//! These drive whole runs (schema, listing, detection, loading) without
//! Docker. The catalog is a small three-dataset graph:
//!
//! ```text
//! customers <- orders
//! products
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use rawload::catalog::{ColumnSpec, DatasetCatalog, DatasetDescriptor};
use rawload::config::FailurePolicy;
use rawload::error::ErrorKind;
use rawload::loader::LoadStatus;
use rawload::pipeline::{FailedStage, Pipeline, PipelineOptions, RunState, RunSummary};
use rawload::records::Value;
use rawload::schema::SchemaOutcome;
use rawload::store::memory::{Fault, MemoryDestination, MemoryObjectSource};
use tokio_util::sync::CancellationToken;

const CUSTOMERS: &str = "customer_id,city\nc1,sao paulo\nc2,rio\nc3,\n";
const PRODUCTS: &str = "product_id,weight_g\np1,120.5\np2,NaN\n";
const ORDERS: &str = "order_id,customer_id,purchased_at\no1,c1,2017-10-02 10:56:33\no2,c2,2018-07-24 20:41:37\n";

fn catalog() -> Arc<DatasetCatalog> {
    let customers = DatasetDescriptor::new("customers", "customers.csv", "customers_raw")
        .with_columns(vec![ColumnSpec::text("customer_id"), ColumnSpec::text("city")])
        .with_primary_key(&["customer_id"]);
    let products = DatasetDescriptor::new("products", "products.csv", "products_raw")
        .with_columns(vec![ColumnSpec::text("product_id"), ColumnSpec::float("weight_g")])
        .with_primary_key(&["product_id"]);
    let orders = DatasetDescriptor::new("orders", "orders.csv", "orders_raw")
        .with_columns(vec![
            ColumnSpec::text("order_id"),
            ColumnSpec::text("customer_id"),
            ColumnSpec::timestamp("purchased_at"),
        ])
        .with_primary_key(&["order_id"])
        .with_parents(&["customers"]);

    Arc::new(DatasetCatalog::new(vec![customers, products, orders]).unwrap())
}

fn full_source() -> Arc<MemoryObjectSource> {
    Arc::new(
        MemoryObjectSource::new("raw/")
            .with_object("customers.csv", CUSTOMERS)
            .with_object("products.csv", PRODUCTS)
            .with_object("orders.csv", ORDERS),
    )
}

fn options(policy: FailurePolicy) -> PipelineOptions {
    PipelineOptions {
        failure_policy: policy,
        batch_size: 1,
        ..PipelineOptions::default()
    }
}

async fn run_with(
    source: &Arc<MemoryObjectSource>,
    destination: &MemoryDestination,
    options: PipelineOptions,
    cancel: &CancellationToken,
) -> RunSummary {
    Pipeline::new(catalog(), source.clone(), Arc::new(destination.clone()), options)
        .run(cancel)
        .await
}

async fn run(source: &Arc<MemoryObjectSource>, destination: &MemoryDestination) -> RunSummary {
    run_with(source, destination, options(FailurePolicy::FailFast), &CancellationToken::new()).await
}

fn statuses(summary: &RunSummary) -> Vec<(&str, LoadStatus)> {
    summary
        .results
        .iter()
        .map(|r| (r.dataset.as_str(), r.status))
        .collect()
}

#[tokio::test]
async fn test_first_run_creates_schema_and_loads_everything() {
    let source = full_source();
    let destination = MemoryDestination::new();

    let summary = run(&source, &destination).await;

    assert_eq!(summary.state, RunState::Completed, "{:?}", summary.error);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.schema, Some(SchemaOutcome::Created));
    assert_eq!(
        statuses(&summary),
        vec![
            ("customers", LoadStatus::Succeeded),
            ("products", LoadStatus::Succeeded),
            ("orders", LoadStatus::Succeeded),
        ]
    );
    assert!(summary.pending.is_empty());
    assert_eq!(summary.rows_loaded(), 7);

    let customers = destination.rows("customers_raw").unwrap();
    assert_eq!(customers.len(), 3);
    assert_eq!(customers[2], vec![Value::Text("c3".into()), Value::Null]);
    let products = destination.rows("products_raw").unwrap();
    assert_eq!(products[1][1], Value::Null);
}

#[tokio::test]
async fn test_unchanged_sources_are_skipped_without_writes() {
    let source = full_source();
    let destination = MemoryDestination::new();
    run(&source, &destination).await;
    let writes = destination.write_count();

    let summary = run(&source, &destination).await;

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.schema, Some(SchemaOutcome::AlreadyPresent));
    assert!(summary.results.iter().all(|r| r.status == LoadStatus::Skipped));
    assert_eq!(destination.write_count(), writes);
}

#[tokio::test]
async fn test_changed_source_is_replaced() {
    let source = full_source();
    let destination = MemoryDestination::new();
    run(&source, &destination).await;

    source.put("customers.csv", format!("{}c4,curitiba\n", CUSTOMERS));
    let summary = run(&source, &destination).await;

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.result("customers").unwrap().status, LoadStatus::Succeeded);
    assert_eq!(summary.result("customers").unwrap().rows_loaded, 4);
    assert_eq!(summary.result("orders").unwrap().status, LoadStatus::Skipped);
    assert_eq!(destination.rows("customers_raw").unwrap().len(), 4);
}

#[tokio::test]
async fn test_header_only_source_keeps_existing_rows() {
    let source = full_source();
    let destination = MemoryDestination::new();
    run(&source, &destination).await;
    let before = destination.rows("customers_raw").unwrap();
    let writes = destination.write_count();

    source.put("customers.csv", "customer_id,city\n");
    let summary = run(&source, &destination).await;

    assert_eq!(summary.state, RunState::Completed, "{:?}", summary.error);
    let customers = summary.result("customers").unwrap();
    assert_eq!(customers.status, LoadStatus::Skipped);
    assert_eq!(customers.source_rows, Some(0));
    assert!(customers.note.as_deref().unwrap().contains("source object empty"));
    assert_eq!(summary.result("orders").unwrap().status, LoadStatus::Skipped);
    assert_eq!(destination.rows("customers_raw").unwrap(), before);
    assert_eq!(destination.write_count(), writes);
}

#[tokio::test]
async fn test_forced_recreate_reloads_everything() {
    let source = full_source();
    let destination = MemoryDestination::new();
    run(&source, &destination).await;

    let summary = run_with(
        &source,
        &destination,
        PipelineOptions {
            force_schema_recreate: true,
            ..options(FailurePolicy::FailFast)
        },
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(summary.schema, Some(SchemaOutcome::Recreated));
    assert!(summary.results.iter().all(|r| r.status == LoadStatus::Succeeded));
    assert_eq!(destination.rows("orders_raw").unwrap().len(), 2);
}

#[tokio::test]
async fn test_schema_not_ready_stops_the_run() {
    let source = full_source();
    // a partial schema is left alone, so products_raw never gets created
    let destination = MemoryDestination::new()
        .with_table("customers_raw", Vec::new())
        .with_table("orders_raw", Vec::new());

    for policy in [FailurePolicy::FailFast, FailurePolicy::ContinueIndependent] {
        let summary = run_with(&source, &destination, options(policy), &CancellationToken::new()).await;

        assert_eq!(
            summary.state,
            RunState::Failed {
                stage: FailedStage::Dataset {
                    index: 2,
                    dataset: "products".into(),
                },
            }
        );
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.error.as_ref().unwrap().kind, ErrorKind::SchemaNotReady);
        assert_eq!(summary.pending, vec!["orders".to_string()]);
        assert!(summary.result("orders").is_none());
        assert!(destination.rows("orders_raw").unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_fail_fast_stops_at_malformed_dataset() {
    let source = full_source();
    source.put("customers.csv", "customer_id,city\nc1,sp\nc2,rj,extra\n");
    let destination = MemoryDestination::new();

    let summary = run(&source, &destination).await;

    assert_eq!(
        summary.state,
        RunState::Failed {
            stage: FailedStage::Dataset {
                index: 1,
                dataset: "customers".into(),
            },
        }
    );
    assert_eq!(statuses(&summary), vec![("customers", LoadStatus::Failed)]);
    assert_eq!(summary.pending, vec!["products".to_string(), "orders".to_string()]);
    let error = summary.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::MalformedRecord);
    assert!(error.message.contains("line 3"));
    assert!(destination.rows("products_raw").unwrap().is_empty());
}

#[tokio::test]
async fn test_continue_independent_blocks_only_dependents() {
    let source = full_source();
    source.put("customers.csv", "customer_id,city\nc1,sp\nc2,rj,extra\n");
    let destination = MemoryDestination::new();

    let summary = run_with(
        &source,
        &destination,
        options(FailurePolicy::ContinueIndependent),
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(
        statuses(&summary),
        vec![
            ("customers", LoadStatus::Failed),
            ("products", LoadStatus::Succeeded),
            ("orders", LoadStatus::Blocked),
        ]
    );
    assert_eq!(
        summary.state,
        RunState::Failed {
            stage: FailedStage::Dataset {
                index: 1,
                dataset: "customers".into(),
            },
        }
    );
    assert!(summary.pending.is_empty());
    assert!(summary
        .result("orders")
        .unwrap()
        .note
        .as_deref()
        .unwrap()
        .contains("customers"));
    assert_eq!(destination.rows("products_raw").unwrap().len(), 2);
    assert!(destination.rows("orders_raw").unwrap().is_empty());
}

#[tokio::test]
async fn test_foreign_key_violation_is_a_data_error() {
    let source = full_source();
    let destination = MemoryDestination::new();
    run(&source, &destination).await;

    source.put("orders.csv", format!("{}o3,missing,\n", ORDERS));
    destination.inject_fault("orders_raw", Fault::ForeignKeyAtCommit);
    let summary = run_with(
        &source,
        &destination,
        options(FailurePolicy::ContinueIndependent),
        &CancellationToken::new(),
    )
    .await;

    let orders = summary.result("orders").unwrap();
    assert_eq!(orders.status, LoadStatus::Failed);
    assert_eq!(orders.error_kind(), Some(ErrorKind::ForeignKeyViolation));
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(destination.rows("orders_raw").unwrap().len(), 2);
}

#[tokio::test]
async fn test_failure_after_clear_keeps_previous_contents() {
    let source = full_source();
    let destination = MemoryDestination::new();
    run(&source, &destination).await;
    let before = destination.rows("customers_raw").unwrap();

    source.put("customers.csv", format!("{}c4,curitiba\n", CUSTOMERS));
    destination.inject_fault("customers_raw", Fault::InsertFails { after_chunks: 2 });
    let summary = run(&source, &destination).await;

    assert_eq!(summary.result("customers").unwrap().error_kind(), Some(ErrorKind::Database));
    assert_eq!(destination.rows("customers_raw").unwrap(), before);
    assert_eq!(summary.pending, vec!["products".to_string(), "orders".to_string()]);
}

#[tokio::test]
async fn test_missing_source_object_leaves_table_untouched() {
    let destination = MemoryDestination::new();
    run(&full_source(), &destination).await;
    let previous = destination.rows("products_raw").unwrap();

    let source = Arc::new(
        MemoryObjectSource::new("raw/")
            .with_object("customers.csv", CUSTOMERS)
            .with_object("orders.csv", ORDERS),
    );
    let summary = run(&source, &destination).await;

    assert_eq!(summary.state, RunState::Completed);
    let products = summary.result("products").unwrap();
    assert_eq!(products.status, LoadStatus::Skipped);
    assert!(products.note.as_deref().unwrap().contains("raw/products.csv"));
    assert_eq!(destination.rows("products_raw").unwrap(), previous);
}

#[tokio::test]
async fn test_empty_listing_fails_the_run() {
    let source = Arc::new(MemoryObjectSource::new("raw/"));
    // objects outside the prefix do not count
    source.put_key("archive/customers.csv", CUSTOMERS);
    let destination = MemoryDestination::new();

    let summary = run(&source, &destination).await;

    assert_eq!(
        summary.state,
        RunState::Failed {
            stage: FailedStage::Listing,
        }
    );
    assert_eq!(summary.error.as_ref().unwrap().kind, ErrorKind::NoSourceObjects);
    assert!(summary.results.is_empty());
    assert_eq!(summary.pending.len(), 3);
}

#[tokio::test]
async fn test_unreachable_database_fails_at_schema_stage() {
    let source = full_source();
    let destination = MemoryDestination::new();
    destination.set_unreachable(true);

    let summary = run(&source, &destination).await;

    assert_eq!(
        summary.state,
        RunState::Failed {
            stage: FailedStage::Schema,
        }
    );
    assert_eq!(summary.error.as_ref().unwrap().kind, ErrorKind::Connectivity);
    assert_eq!(source.download_count(), 0);
}

#[tokio::test]
async fn test_unreachable_object_store_fails_at_listing() {
    let source = full_source();
    source.set_unreachable(true);
    let destination = MemoryDestination::new();

    let summary = run(&source, &destination).await;

    assert_eq!(
        summary.state,
        RunState::Failed {
            stage: FailedStage::Listing,
        }
    );
    assert_eq!(summary.error.as_ref().unwrap().kind, ErrorKind::Connectivity);
}

#[tokio::test]
async fn test_cancelled_before_start_does_nothing() {
    let source = full_source();
    let destination = MemoryDestination::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = run_with(&source, &destination, options(FailurePolicy::FailFast), &cancel).await;

    assert_eq!(summary.state, RunState::Cancelled);
    assert_eq!(summary.exit_code(), 130);
    assert_eq!(summary.pending.len(), 3);
    assert_eq!(destination.write_count(), 0);
}

#[tokio::test]
async fn test_cancellation_mid_dataset_rolls_back_and_stops() {
    let source = full_source();
    let destination = MemoryDestination::new();
    run(&source, &destination).await;
    let before = destination.rows("customers_raw").unwrap();

    let cancel = CancellationToken::new();
    source.put("customers.csv", format!("{}c4,curitiba\n", CUSTOMERS));
    destination.inject_fault(
        "customers_raw",
        Fault::CancelAfter {
            after_chunks: 1,
            token: cancel.clone(),
        },
    );
    let summary = run_with(&source, &destination, options(FailurePolicy::FailFast), &cancel).await;

    assert_eq!(summary.state, RunState::Cancelled);
    assert_eq!(statuses(&summary), vec![("customers", LoadStatus::Cancelled)]);
    assert_eq!(summary.pending, vec!["products".to_string(), "orders".to_string()]);
    assert_eq!(destination.rows("customers_raw").unwrap(), before);
}

#[tokio::test]
async fn test_summary_renders_both_formats() {
    let source = full_source();
    let destination = MemoryDestination::new();
    let summary = run(&source, &destination).await;

    let text = summary.render_text();
    assert!(text.contains("customers_raw"));
    assert!(text.contains("State: completed"));

    let json: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
    assert_eq!(json["state"]["state"], "completed");
    assert_eq!(json["schema"], "created");
    assert_eq!(json["results"].as_array().unwrap().len(), 3);
    assert!(json["finished_at"].is_string());
}
