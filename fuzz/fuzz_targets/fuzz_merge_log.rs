//! Fuzz target for log segment merging.
//!
//! Whatever order gossip arrives in, a held offset never changes value and
//! redelivery inserts nothing.

#![no_main]

use gossip_replica::merge::merge_log;
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;

fuzz_target!(|data: (Vec<(u8, i64)>, Vec<(u8, i64)>)| {
    let (first, second) = data;
    let first: Vec<(u64, i64)> = first.into_iter().map(|(o, v)| (u64::from(o), v)).collect();
    let second: Vec<(u64, i64)> = second.into_iter().map(|(o, v)| (u64::from(o), v)).collect();

    let mut log = BTreeMap::new();
    merge_log("k", &mut log, first.iter().copied());
    let snapshot = log.clone();

    merge_log("k", &mut log, second.iter().copied());
    for (offset, value) in &snapshot {
        assert_eq!(log.get(offset), Some(value));
    }

    let outcome = merge_log("k", &mut log, first.into_iter().chain(second));
    assert!(outcome.inserted.is_empty());
});
