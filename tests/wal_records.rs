//! # Write-Ahead Log Record Scenarios
//!
//! Parses the records a real workload appends to `wal.log` and checks the
//! log-level invariants: strictly increasing LSNs, correct old-byte
//! capture (verified by shadow-replaying every update), and BEGIN/COMMIT
//! bracketing around each mutating transaction.

use std::collections::HashMap;

use neversql::{DataManager, DataType, Document};
use tempfile::tempdir;

#[derive(Debug)]
enum Record {
    Begin(u64),
    Commit(u64),
    Abort(u64),
    Checkpoint(u64),
    Clr(u64),
    Update {
        transaction: u64,
        lsn: u64,
        page: u64,
        offset: u16,
        old: Vec<u8>,
        new: Vec<u8>,
    },
}

fn take_u64(log: &[u8], cursor: &mut usize) -> u64 {
    let value = u64::from_le_bytes(log[*cursor..*cursor + 8].try_into().unwrap());
    *cursor += 8;
    value
}

fn parse_log(log: &[u8]) -> Vec<Record> {
    let mut records = Vec::new();
    let mut cursor = 0;
    while cursor < log.len() {
        let tag = log[cursor];
        cursor += 1;
        let transaction = take_u64(log, &mut cursor);
        records.push(match tag {
            b'b' => Record::Begin(transaction),
            b'c' => Record::Commit(transaction),
            b'a' => Record::Abort(transaction),
            b'p' => Record::Checkpoint(transaction),
            b'l' => Record::Clr(transaction),
            b'u' => {
                let lsn = take_u64(log, &mut cursor);
                let page = take_u64(log, &mut cursor);
                let offset = u16::from_le_bytes(log[cursor..cursor + 2].try_into().unwrap());
                cursor += 2;
                let size = i64::from_le_bytes(log[cursor..cursor + 8].try_into().unwrap()) as usize;
                cursor += 8;
                let old = log[cursor..cursor + size].to_vec();
                cursor += size;
                let new = log[cursor..cursor + size].to_vec();
                cursor += size;
                Record::Update {
                    transaction,
                    lsn,
                    page,
                    offset,
                    old,
                    new,
                }
            }
            other => panic!("unknown WAL record tag {:#04x} at {}", other, cursor - 9),
        });
    }
    records
}

fn run_workload(dir: &std::path::Path) -> Vec<Record> {
    {
        let mut db = DataManager::open(dir).unwrap();
        db.add_collection("elements", DataType::UInt64).unwrap();
        for i in 0..120u64 {
            let mut doc = Document::new();
            doc.insert("pk", i).insert("data", format!("Entry {}", i));
            db.add_value("elements", i, &doc).unwrap();
        }
        // One duplicate (aborted) and one overflow payload.
        let mut dup = Document::new();
        dup.insert("pk", 5u64);
        assert!(!db.add_value("elements", 5u64, &dup).unwrap());

        let mut big = Document::new();
        big.insert("payload", "z".repeat(2000));
        db.add_value("elements", 500u64, &big).unwrap();
    }
    let log = std::fs::read(dir.join("walfiles").join("wal.log")).unwrap();
    parse_log(&log)
}

#[test]
fn lsns_are_strictly_monotone() {
    let dir = tempdir().unwrap();
    let records = run_workload(dir.path());

    let lsns: Vec<u64> = records
        .iter()
        .filter_map(|record| match record {
            Record::Update { lsn, .. } => Some(*lsn),
            _ => None,
        })
        .collect();
    assert!(!lsns.is_empty());
    assert_eq!(lsns[0], 1, "LSNs start at 1");
    for pair in lsns.windows(2) {
        assert!(pair[0] < pair[1], "LSN regression: {} -> {}", pair[0], pair[1]);
    }
}

#[test]
fn update_old_bytes_match_prior_page_state() {
    let dir = tempdir().unwrap();
    let records = run_workload(dir.path());

    // Shadow-replay: every page starts zeroed (fresh allocations are
    // zero-filled), so each update's old bytes must equal the shadow
    // content at its range.
    let mut shadow: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut updates = 0;
    for record in &records {
        if let Record::Update {
            page, offset, old, new, ..
        } = record
        {
            let content = shadow.entry(*page).or_insert_with(|| vec![0u8; 4096]);
            let start = *offset as usize;
            assert_eq!(
                &content[start..start + old.len()],
                old.as_slice(),
                "old bytes mismatch on page {} offset {}",
                page,
                offset
            );
            content[start..start + new.len()].copy_from_slice(new);
            updates += 1;
        }
    }
    assert!(updates > 100, "workload produced only {} updates", updates);
}

#[test]
fn updates_are_bracketed_by_begin_and_commit() {
    let dir = tempdir().unwrap();
    let records = run_workload(dir.path());

    let mut began: Vec<u64> = Vec::new();
    let mut committed: Vec<u64> = Vec::new();
    let mut aborted: Vec<u64> = Vec::new();
    let mut updated: Vec<u64> = Vec::new();

    for record in &records {
        match record {
            Record::Begin(txn) => began.push(*txn),
            Record::Commit(txn) => committed.push(*txn),
            Record::Abort(txn) => aborted.push(*txn),
            Record::Update { transaction, .. } => updated.push(*transaction),
            Record::Checkpoint(_) | Record::Clr(_) => {}
        }
    }

    // Every transaction that wrote something was begun and resolved.
    for txn in &updated {
        assert!(began.contains(txn), "txn {} updated without BEGIN", txn);
        assert!(
            committed.contains(txn) || aborted.contains(txn),
            "txn {} never resolved",
            txn
        );
    }
    // The duplicate insert aborted without any update records.
    assert!(!aborted.is_empty());
    for txn in &aborted {
        assert!(
            !updated.contains(txn),
            "aborted txn {} has update records",
            txn
        );
    }
}

#[test]
fn commit_records_follow_their_updates() {
    let dir = tempdir().unwrap();
    let records = run_workload(dir.path());

    let mut last_update_position: HashMap<u64, usize> = HashMap::new();
    let mut commit_position: HashMap<u64, usize> = HashMap::new();
    for (position, record) in records.iter().enumerate() {
        match record {
            Record::Update { transaction, .. } => {
                last_update_position.insert(*transaction, position);
            }
            Record::Commit(txn) => {
                commit_position.insert(*txn, position);
            }
            _ => {}
        }
    }

    for (txn, update_position) in &last_update_position {
        if let Some(commit) = commit_position.get(txn) {
            assert!(
                commit > update_position,
                "txn {} committed before its last update",
                txn
            );
        }
    }
}
