//! Walkthrough of a u64-keyed collection: create a database, insert a
//! batch of documents with auto-incrementing keys, read a few back, and
//! scan the collection in order.
//!
//! ```bash
//! cargo run --example data_manager
//! ```

use eyre::Result;
use neversql::{DataManager, DataType, Document};

fn main() -> Result<()> {
    let dir = std::env::temp_dir().join("neversql-demo-elements");
    let _ = std::fs::remove_dir_all(&dir);

    let mut manager = DataManager::open(&dir)?;
    println!("opened database at {:?}", dir);

    manager.add_collection("elements", DataType::UInt64)?;

    for i in 0..100u64 {
        let mut doc = Document::new();
        doc.insert("pk", i)
            .insert("data", format!("Entry {}", i))
            .insert("even", i % 2 == 0);
        let key = manager.add_value_auto("elements", &doc)?;
        assert_eq!(key, i);
    }
    println!("inserted 100 documents with auto-increment keys");

    for key in [0u64, 49, 99] {
        let doc = manager
            .retrieve("elements", key)?
            .expect("inserted key is present");
        println!(
            "key {:3} -> data = {:?}, even = {:?}",
            key,
            doc.get_str("data").unwrap_or("<missing>"),
            doc.get_bool("even").unwrap_or_default(),
        );
    }

    let total = manager.iter("elements")?.count();
    println!("full scan visited {} documents", total);

    let evens = manager
        .iter_where("elements", |doc| doc.get_bool("even") == Some(true))?
        .count();
    println!("{} of them have even keys", evens);

    Ok(())
}
