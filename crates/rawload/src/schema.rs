//! Schema management
//!
//! Creates the managed tables from the catalog. Creation is all-or-nothing:
//! the statements of a plan run in a single transaction.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::catalog::{DatasetCatalog, DatasetDescriptor};
use crate::error::Result;
use crate::store::{Destination, SchemaPlan};

/// Version of the table definitions generated by [`SchemaManager`]
pub const SCHEMA_DEFINITION_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaOutcome {
    /// No managed tables existed; all were created
    Created,
    /// Managed tables already existed and were left alone
    AlreadyPresent,
    /// The managed schema was dropped and rebuilt
    Recreated,
}

impl std::fmt::Display for SchemaOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaOutcome::Created => f.write_str("created"),
            SchemaOutcome::AlreadyPresent => f.write_str("already_present"),
            SchemaOutcome::Recreated => f.write_str("recreated"),
        }
    }
}

pub struct SchemaManager {
    destination: Arc<dyn Destination>,
    catalog: Arc<DatasetCatalog>,
    schema: String,
}

impl SchemaManager {
    pub fn new(destination: Arc<dyn Destination>, catalog: Arc<DatasetCatalog>, schema: impl Into<String>) -> Self {
        Self {
            destination,
            catalog,
            schema: schema.into(),
        }
    }

    /// Managed tables currently present
    pub async fn tables_exist(&self) -> Result<(bool, BTreeSet<String>)> {
        let tables = self.destination.managed_tables().await?;
        Ok((!tables.is_empty(), tables))
    }

    /// Make sure the managed tables exist, optionally rebuilding them
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self, force: bool) -> Result<SchemaOutcome> {
        let (exists, tables) = self.tables_exist().await?;

        if exists && !force {
            info!(tables = tables.len(), "Managed tables already exist, skipping schema creation");
            let missing: Vec<String> = self
                .catalog
                .table_names()
                .difference(&tables)
                .cloned()
                .collect();
            if !missing.is_empty() {
                warn!(
                    missing = %missing.join(", "),
                    "Schema is incomplete; datasets targeting these tables will fail"
                );
            }
            return Ok(SchemaOutcome::AlreadyPresent);
        }

        if exists {
            warn!(tables = tables.len(), schema = %self.schema, "Dropping and recreating managed schema");
        }

        let plan = self.plan(exists);
        self.destination.apply_schema(&plan).await?;

        let outcome = if exists {
            SchemaOutcome::Recreated
        } else {
            SchemaOutcome::Created
        };
        info!(tables = plan.tables.len(), %outcome, "Schema ready");
        Ok(outcome)
    }

    /// Statements creating every catalog table, parents first
    pub fn plan(&self, recreate: bool) -> SchemaPlan {
        let mut statements = Vec::new();
        if recreate {
            statements.push(format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema));
            statements.push(format!("CREATE SCHEMA {}", self.schema));
        } else {
            statements.push(format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema));
        }

        let mut tables = Vec::with_capacity(self.catalog.len());
        for dataset in self.catalog.load_order() {
            statements.push(create_table_sql(&self.schema, &self.catalog, dataset));
            statements.push(format!(
                "COMMENT ON TABLE {}.{} IS 'rawload schema v{}: {}'",
                self.schema, dataset.table, SCHEMA_DEFINITION_VERSION, dataset.object_name
            ));
            tables.push(dataset.table.clone());
        }

        SchemaPlan {
            recreate,
            tables,
            statements,
        }
    }
}

/// `CREATE TABLE` for one dataset with deferred foreign keys to its parents
pub fn create_table_sql(schema: &str, catalog: &DatasetCatalog, dataset: &DatasetDescriptor) -> String {
    let mut lines: Vec<String> = dataset
        .columns
        .iter()
        .map(|column| {
            let not_null = if dataset.primary_key.contains(&column.name) {
                " NOT NULL"
            } else {
                ""
            };
            format!("    {} {}{}", column.name, column.column_type.sql_type(), not_null)
        })
        .collect();

    if !dataset.primary_key.is_empty() {
        lines.push(format!("    PRIMARY KEY ({})", dataset.primary_key.join(", ")));
    }

    for parent in dataset.parents.iter().filter_map(|p| catalog.get(p)) {
        let keys = parent.primary_key.join(", ");
        lines.push(format!(
            "    FOREIGN KEY ({keys}) REFERENCES {schema}.{table} ({keys}) DEFERRABLE INITIALLY DEFERRED",
            keys = keys,
            schema = schema,
            table = parent.table,
        ));
    }

    format!("CREATE TABLE {}.{} (\n{}\n)", schema, dataset.table, lines.join(",\n"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::olist_catalog;
    use crate::records::Value;
    use crate::store::memory::MemoryDestination;

    fn manager(destination: &MemoryDestination) -> SchemaManager {
        SchemaManager::new(
            Arc::new(destination.clone()),
            Arc::new(olist_catalog().unwrap()),
            "public",
        )
    }

    #[tokio::test]
    async fn test_creates_all_tables_when_none_exist() {
        let destination = MemoryDestination::new();
        let outcome = manager(&destination).ensure_schema(false).await.unwrap();

        assert_eq!(outcome, SchemaOutcome::Created);
        assert!(destination.has_table("orders_raw"));
        assert!(destination.has_table("product_category_name_translation_raw"));
        let plans = destination.applied_plans();
        assert_eq!(plans.len(), 1);
        assert!(!plans[0].recreate);
    }

    #[tokio::test]
    async fn test_existing_tables_are_left_alone() {
        let destination = MemoryDestination::new()
            .with_table("customers_raw", vec![vec![Value::Text("c1".into())]]);
        let outcome = manager(&destination).ensure_schema(false).await.unwrap();

        assert_eq!(outcome, SchemaOutcome::AlreadyPresent);
        assert_eq!(destination.write_count(), 0);
        assert_eq!(destination.rows("customers_raw").unwrap().len(), 1);
        assert!(!destination.has_table("orders_raw"));
    }

    #[tokio::test]
    async fn test_force_recreates_schema() {
        let destination = MemoryDestination::new()
            .with_table("customers_raw", vec![vec![Value::Text("c1".into())]]);
        let outcome = manager(&destination).ensure_schema(true).await.unwrap();

        assert_eq!(outcome, SchemaOutcome::Recreated);
        assert_eq!(destination.rows("customers_raw").unwrap().len(), 0);
        let plan = &destination.applied_plans()[0];
        assert!(plan.recreate);
        assert_eq!(plan.statements[0], "DROP SCHEMA IF EXISTS public CASCADE");
    }

    #[tokio::test]
    async fn test_force_on_empty_database_creates() {
        let destination = MemoryDestination::new();
        let outcome = manager(&destination).ensure_schema(true).await.unwrap();
        assert_eq!(outcome, SchemaOutcome::Created);
    }

    #[tokio::test]
    async fn test_unreachable_destination_fails() {
        let destination = MemoryDestination::new();
        destination.set_unreachable(true);
        assert!(manager(&destination).ensure_schema(false).await.is_err());
    }

    #[test]
    fn test_plan_creates_parents_before_children() {
        let destination = MemoryDestination::new();
        let plan = manager(&destination).plan(false);
        let position = |table: &str| plan.tables.iter().position(|t| t == table).unwrap();

        assert!(position("customers_raw") < position("orders_raw"));
        assert!(position("orders_raw") < position("order_items_raw"));
        assert!(position("sellers_raw") < position("order_items_raw"));
        assert_eq!(plan.statements[0], "CREATE SCHEMA IF NOT EXISTS public");
    }

    #[test]
    fn test_create_table_sql() {
        let catalog = olist_catalog().unwrap();
        let items = catalog.require("order_items").unwrap();
        let sql = create_table_sql("public", &catalog, items);

        assert!(sql.starts_with("CREATE TABLE public.order_items_raw ("));
        assert!(sql.contains("    order_item_id BIGINT NOT NULL"));
        assert!(sql.contains("    price DOUBLE PRECISION,"));
        assert!(sql.contains("    shipping_limit_date TIMESTAMP,"));
        assert!(sql.contains("PRIMARY KEY (order_id, order_item_id)"));
        assert!(sql.contains(
            "FOREIGN KEY (order_id) REFERENCES public.orders_raw (order_id) DEFERRABLE INITIALLY DEFERRED"
        ));
        assert!(sql.contains("REFERENCES public.sellers_raw (seller_id)"));

        let geo = create_table_sql("public", &catalog, catalog.require("geolocation").unwrap());
        assert!(!geo.contains("PRIMARY KEY"));
    }
}
