//! Built-in catalog for the Olist Brazilian e-commerce CSV exports

use super::{ColumnSpec, DatasetCatalog, DatasetDescriptor};
use crate::error::Result;

/// The nine Olist datasets with their foreign-key dependencies
pub fn olist_catalog() -> Result<DatasetCatalog> {
    DatasetCatalog::new(vec![
        customers(),
        sellers(),
        products(),
        geolocation(),
        category_translation(),
        orders(),
        order_items(),
        order_payments(),
        order_reviews(),
    ])
}

fn customers() -> DatasetDescriptor {
    DatasetDescriptor::new("customers", "olist_customers_dataset.csv", "customers_raw")
        .with_columns(vec![
            ColumnSpec::text("customer_id"),
            ColumnSpec::text("customer_unique_id"),
            // zip prefixes keep their leading zeros
            ColumnSpec::text("customer_zip_code_prefix"),
            ColumnSpec::text("customer_city"),
            ColumnSpec::text("customer_state"),
        ])
        .with_primary_key(&["customer_id"])
}

fn sellers() -> DatasetDescriptor {
    DatasetDescriptor::new("sellers", "olist_sellers_dataset.csv", "sellers_raw")
        .with_columns(vec![
            ColumnSpec::text("seller_id"),
            ColumnSpec::text("seller_zip_code_prefix"),
            ColumnSpec::text("seller_city"),
            ColumnSpec::text("seller_state"),
        ])
        .with_primary_key(&["seller_id"])
}

fn products() -> DatasetDescriptor {
    // Column names keep the export's spelling ("lenght").
    DatasetDescriptor::new("products", "olist_products_dataset.csv", "products_raw")
        .with_columns(vec![
            ColumnSpec::text("product_id"),
            ColumnSpec::text("product_category_name"),
            ColumnSpec::float("product_name_lenght"),
            ColumnSpec::float("product_description_lenght"),
            ColumnSpec::float("product_photos_qty"),
            ColumnSpec::float("product_weight_g"),
            ColumnSpec::float("product_length_cm"),
            ColumnSpec::float("product_height_cm"),
            ColumnSpec::float("product_width_cm"),
        ])
        .with_primary_key(&["product_id"])
}

fn geolocation() -> DatasetDescriptor {
    DatasetDescriptor::new("geolocation", "olist_geolocation_dataset.csv", "geolocation_raw")
        .with_columns(vec![
            ColumnSpec::text("geolocation_zip_code_prefix"),
            ColumnSpec::float("geolocation_lat"),
            ColumnSpec::float("geolocation_lng"),
            ColumnSpec::text("geolocation_city"),
            ColumnSpec::text("geolocation_state"),
        ])
}

fn category_translation() -> DatasetDescriptor {
    DatasetDescriptor::new(
        "product_category_name_translation",
        "product_category_name_translation.csv",
        "product_category_name_translation_raw",
    )
    .with_columns(vec![
        ColumnSpec::text("product_category_name"),
        ColumnSpec::text("product_category_name_english"),
    ])
    .with_primary_key(&["product_category_name"])
}

fn orders() -> DatasetDescriptor {
    DatasetDescriptor::new("orders", "olist_orders_dataset.csv", "orders_raw")
        .with_columns(vec![
            ColumnSpec::text("order_id"),
            ColumnSpec::text("customer_id"),
            ColumnSpec::text("order_status"),
            ColumnSpec::timestamp("order_purchase_timestamp"),
            ColumnSpec::timestamp("order_approved_at"),
            ColumnSpec::timestamp("order_delivered_carrier_date"),
            ColumnSpec::timestamp("order_delivered_customer_date"),
            ColumnSpec::timestamp("order_estimated_delivery_date"),
        ])
        .with_primary_key(&["order_id"])
        .with_parents(&["customers"])
}

fn order_items() -> DatasetDescriptor {
    DatasetDescriptor::new("order_items", "olist_order_items_dataset.csv", "order_items_raw")
        .with_columns(vec![
            ColumnSpec::text("order_id"),
            ColumnSpec::integer("order_item_id"),
            ColumnSpec::text("product_id"),
            ColumnSpec::text("seller_id"),
            ColumnSpec::timestamp("shipping_limit_date"),
            ColumnSpec::float("price"),
            ColumnSpec::float("freight_value"),
        ])
        .with_primary_key(&["order_id", "order_item_id"])
        .with_parents(&["orders", "products", "sellers"])
}

fn order_payments() -> DatasetDescriptor {
    DatasetDescriptor::new(
        "order_payments",
        "olist_order_payments_dataset.csv",
        "order_payments_raw",
    )
    .with_columns(vec![
        ColumnSpec::text("order_id"),
        ColumnSpec::integer("payment_sequential"),
        ColumnSpec::text("payment_type"),
        ColumnSpec::integer("payment_installments"),
        ColumnSpec::float("payment_value"),
    ])
    .with_primary_key(&["order_id", "payment_sequential"])
    .with_parents(&["orders"])
}

fn order_reviews() -> DatasetDescriptor {
    // review_id alone repeats across orders in the export
    DatasetDescriptor::new("order_reviews", "olist_order_reviews_dataset.csv", "order_reviews_raw")
        .with_columns(vec![
            ColumnSpec::text("review_id"),
            ColumnSpec::text("order_id"),
            ColumnSpec::integer("review_score"),
            ColumnSpec::text("review_comment_title"),
            ColumnSpec::text("review_comment_message"),
            ColumnSpec::timestamp("review_creation_date"),
            ColumnSpec::timestamp("review_answer_timestamp"),
        ])
        .with_primary_key(&["review_id", "order_id"])
        .with_parents(&["orders"])
}
