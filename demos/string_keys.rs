//! String-keyed collections with nested documents and filtered
//! iteration: the `people` collection keyed by name, holding documents
//! with a sub-document of favorites, queried by age.
//!
//! ```bash
//! cargo run --example string_keys
//! ```

use eyre::Result;
use neversql::{Array, DataManager, DataType, Document, Filter, Value};

fn main() -> Result<()> {
    let dir = std::env::temp_dir().join("neversql-demo-people");
    let _ = std::fs::remove_dir_all(&dir);

    let mut manager = DataManager::open(&dir)?;
    manager.add_collection("people", DataType::String)?;

    let mut george = Document::new();
    george
        .insert("name", "George")
        .insert("age", 24i32)
        .insert("favorite_color", "blue");
    manager.add_value("people", "George", &george)?;

    let mut helen = Document::new();
    helen.insert("name", "Helen").insert("age", 25i32);
    {
        let mut favorites = Document::new();
        favorites.insert("favorite_color", "green");
        let mut numbers = Array::new(DataType::Int32);
        for n in [33i32, 42, 109] {
            numbers.push(Value::Int32(n))?;
        }
        favorites.insert("favorite_numbers", Value::Array(numbers));
        helen.insert("favorites", Value::Document(favorites));
    }
    manager.add_value("people", "Helen", &helen)?;

    let mut carson = Document::new();
    carson.insert("name", "Carson").insert("age", 44i32);
    manager.add_value("people", "Carson", &carson)?;

    // Everyone aged 40 or younger, in key order.
    let young = Filter::le("age", 40i32);
    for doc in manager.iter_where("people", |doc| young.matches(doc))? {
        let doc = doc?;
        println!(
            "{} is {}",
            doc.get_str("name").unwrap_or("<unnamed>"),
            doc.get_i32("age").unwrap_or_default()
        );
    }

    // Nested access on a point lookup.
    let helen = manager.retrieve("people", "Helen")?.expect("Helen exists");
    if let Some(favorites) = helen.get("favorites").and_then(Value::as_document) {
        println!(
            "Helen's favorite color is {}",
            favorites.get_str("favorite_color").unwrap_or("<none>")
        );
    }

    println!("collections: {:?}", manager.collection_names());
    Ok(())
}
