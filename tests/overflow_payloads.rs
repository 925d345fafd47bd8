//! # Overflow Payload Scenarios
//!
//! Documents whose serialized form exceeds the per-tree inline maximum
//! (256 bytes) must come back byte-identical through the overflow chain,
//! and the database file must actually contain overflow pages.

use neversql::btree::OVERFLOW_MAGIC;
use neversql::{DataManager, DataType, Document};
use tempfile::tempdir;

fn big_document(fill: usize) -> Document {
    let mut doc = Document::new();
    doc.insert("kind", "blob")
        .insert("payload", "x".repeat(fill));
    doc
}

/// Scans the raw database file for pages bearing the overflow magic.
fn count_overflow_pages(dir: &std::path::Path, page_size: usize) -> usize {
    let bytes = std::fs::read(dir.join("neversql.db")).unwrap();
    bytes
        .chunks(page_size)
        .filter(|page| page.len() >= 8 && page[..8] == OVERFLOW_MAGIC.to_le_bytes())
        .count()
}

#[test]
fn five_kilobyte_document_round_trips_exactly() {
    let dir = tempdir().unwrap();
    {
        let mut db = DataManager::open(dir.path()).unwrap();
        db.add_collection("big", DataType::UInt64).unwrap();

        // Serialized form is well over 4 KiB, so the chain spans pages.
        let doc = big_document(5000);
        assert!(db.add_value("big", 1u64, &doc).unwrap());

        let read_back = db.retrieve("big", 1u64).unwrap().unwrap();
        assert_eq!(read_back, doc);
        assert_eq!(read_back.get_str("payload").unwrap().len(), 5000);
    }

    // At least one page in the file is marked as an overflow page.
    assert!(count_overflow_pages(dir.path(), 4096) >= 1);
}

#[test]
fn overflow_documents_survive_reopen() {
    let dir = tempdir().unwrap();
    let doc = big_document(5000);
    {
        let mut db = DataManager::open(dir.path()).unwrap();
        db.add_collection("big", DataType::UInt64).unwrap();
        db.add_value("big", 1u64, &doc).unwrap();
    }

    let db = DataManager::open(dir.path()).unwrap();
    let read_back = db.retrieve("big", 1u64).unwrap().unwrap();
    assert_eq!(read_back, doc);
}

#[test]
fn payload_just_over_the_inline_limit_overflows() {
    let dir = tempdir().unwrap();
    {
        let mut db = DataManager::open(dir.path()).unwrap();
        db.add_collection("big", DataType::UInt64).unwrap();

        // Inline limit is 256 bytes of entry; 300 bytes of padding is
        // safely past it once field framing is added.
        let doc = big_document(300);
        db.add_value("big", 1u64, &doc).unwrap();
        assert_eq!(db.retrieve("big", 1u64).unwrap().unwrap(), doc);
    }
    assert!(count_overflow_pages(dir.path(), 4096) >= 1);
}

#[test]
fn payload_under_the_inline_limit_stays_inline() {
    let dir = tempdir().unwrap();
    {
        let mut db = DataManager::open(dir.path()).unwrap();
        db.add_collection("small", DataType::UInt64).unwrap();

        let doc = big_document(100);
        db.add_value("small", 1u64, &doc).unwrap();
        assert_eq!(db.retrieve("small", 1u64).unwrap().unwrap(), doc);
    }
    assert_eq!(count_overflow_pages(dir.path(), 4096), 0);
}

#[test]
fn many_overflow_documents_share_chains_without_mixups() {
    let dir = tempdir().unwrap();
    let mut db = DataManager::open(dir.path()).unwrap();
    db.add_collection("big", DataType::UInt64).unwrap();

    // Distinct sizes so every payload is distinguishable.
    for i in 0..20u64 {
        let mut doc = Document::new();
        doc.insert("pk", i)
            .insert("payload", format!("{}-", i).repeat(200 + i as usize * 10));
        db.add_value("big", i, &doc).unwrap();
    }

    for i in 0..20u64 {
        let doc = db.retrieve("big", i).unwrap().unwrap();
        assert_eq!(doc.get_u64("pk"), Some(i), "payload mixup at key {}", i);
        let expected = format!("{}-", i).repeat(200 + i as usize * 10);
        assert_eq!(doc.get_str("payload"), Some(expected.as_str()));
    }
}

#[test]
fn mixed_inline_and_overflow_entries_iterate_in_order() {
    let dir = tempdir().unwrap();
    let mut db = DataManager::open(dir.path()).unwrap();
    db.add_collection("mixed", DataType::UInt64).unwrap();

    for i in 0..60u64 {
        let mut doc = Document::new();
        doc.insert("pk", i);
        if i % 3 == 0 {
            doc.insert("payload", "y".repeat(900));
        } else {
            doc.insert("payload", "tiny");
        }
        db.add_value("mixed", i, &doc).unwrap();
    }

    let keys: Vec<u64> = db
        .iter("mixed")
        .unwrap()
        .map(|doc| doc.unwrap().get_u64("pk").unwrap())
        .collect();
    let expected: Vec<u64> = (0..60).collect();
    assert_eq!(keys, expected);
}

#[test]
fn overflow_works_with_string_keys() {
    let dir = tempdir().unwrap();
    let mut db = DataManager::open(dir.path()).unwrap();
    db.add_collection("big", DataType::String).unwrap();

    let doc = big_document(3000);
    db.add_value("big", "the-big-one", &doc).unwrap();

    let read_back = db.retrieve("big", "the-big-one").unwrap().unwrap();
    assert_eq!(read_back, doc);
}
