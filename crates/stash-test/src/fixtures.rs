//! Test fixtures for common records and schemas.

use serde_json::{Value, json};
use stash_db::{CollectionOptions, IndexSpec};

/// A person record with an in-line `id`.
#[must_use]
pub fn person(id: i64, name: &str, age: i64) -> Value {
    json!({ "id": id, "name": name, "age": age })
}

/// Three people with distinct ids and ages.
#[must_use]
pub fn people() -> Vec<Value> {
    vec![
        person(1, "ada", 36),
        person(2, "brian", 29),
        person(3, "carol", 41),
    ]
}

/// Options for a collection keyed by the `id` field.
#[must_use]
pub fn keyed_by_id() -> CollectionOptions {
    CollectionOptions::new().with_key_path("id")
}

/// Options for a collection with generated integer keys.
#[must_use]
pub fn auto_increment() -> CollectionOptions {
    CollectionOptions::new().with_auto_increment()
}

/// Index over the `age` field.
#[must_use]
pub fn by_age() -> IndexSpec {
    IndexSpec::new("by_age", "age")
}

/// Unique index over the `name` field.
#[must_use]
pub fn unique_name() -> IndexSpec {
    IndexSpec::new("by_name", "name").unique()
}
