//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;

use dataslice::{EntityDescriptor, FieldKind, FileAdapter, FileConfig, SchemaRegistry};

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("dataslice=debug")
        .try_init();
}

/// `Tenant` and `Shop` (FK to `Tenant`).
pub fn shop_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register_all([
            EntityDescriptor::builder("Tenant")
                .field("id", FieldKind::BigInt)
                .nullable_field("name", FieldKind::Text)
                .build(),
            EntityDescriptor::builder("Shop")
                .field("id", FieldKind::BigInt)
                .foreign_key("tenant_id", "Tenant")
                .nullable_field("name", FieldKind::Text)
                .build(),
        ])
        .unwrap();
    registry
}

/// `Author` and `Book` referencing each other.
pub fn library_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register_all([
            EntityDescriptor::builder("Author")
                .field("id", FieldKind::BigInt)
                .nullable_field("name", FieldKind::Text)
                .nullable_foreign_key("favorite_book", "Book")
                .build(),
            EntityDescriptor::builder("Book")
                .field("id", FieldKind::BigInt)
                .foreign_key("author_id", "Author")
                .nullable_field("title", FieldKind::Text)
                .build(),
        ])
        .unwrap();
    registry
}

/// One tenant (1000) with three shops.
pub fn seed_shops(dir: &Path) {
    write_file(dir, "tenant.csv", "id,name\n1000,Acme\n");
    write_file(
        dir,
        "shop.csv",
        "id,tenant_id,name\n1,1000,North\n2,1000,South\n3,1000,\"East, Annex\"\n",
    );
}

pub fn seed_library(dir: &Path) {
    write_file(dir, "author.csv", "id,name,favorite_book\n7,Le Guin,70\n");
    write_file(dir, "book.csv", "id,author_id,title\n70,7,The Dispossessed\n");
}

pub fn write_file(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

pub fn adapter(dir: &Path) -> FileAdapter {
    FileAdapter::new(FileConfig::new(dir))
}

pub fn overwriting_adapter(dir: &Path) -> FileAdapter {
    FileAdapter::new(FileConfig::new(dir).with_overwrite(true))
}

/// Header and data rows of a CSV file.
pub fn read_csv(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let header = reader.headers().unwrap().iter().map(String::from).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect();
    (header, rows)
}

/// Value of `column` in every row of a CSV file.
pub fn column(path: &Path, column: &str) -> Vec<String> {
    let (header, rows) = read_csv(path);
    let index = header.iter().position(|c| c == column).unwrap();
    rows.into_iter().map(|mut r| r.swap_remove(index)).collect()
}
