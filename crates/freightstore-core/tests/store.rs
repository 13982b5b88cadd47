//! End-to-end scenarios: crash recovery, corruption handling, atomic
//! batches, and compaction churn, driven through the public API.

use std::collections::BTreeMap;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use freightstore_core::codec::{encode_record, encode_value, SYS_BOX};
use freightstore_core::{value_map, Config, FreightStore, Truck, Value};
use tempfile::TempDir;

#[test]
fn basic_put_get() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FreightStore::open(dir.path().join("store"), Config::default()).unwrap());

    store
        .put(
            "app",
            "users",
            "u1",
            value_map! { "name" => "Alice", "age" => 30i64 },
            false,
        )
        .unwrap();

    assert_eq!(
        store.get("app", "users", "u1").unwrap(),
        Some(value_map! { "name" => "Alice", "age" => 30i64 })
    );
}

#[test]
fn sync_write_survives_simulated_kill() {
    let dir = TempDir::new().unwrap();
    let v = value_map! { "payload" => "survives" };
    {
        let mut truck = Truck::open(dir.path(), "crash", Config::default()).unwrap();
        truck.write("users", "u1", v.clone(), true).unwrap();
        // Dropped without close: the index snapshot never reaches disk, so
        // reopening must rebuild it from the data file alone.
    }
    let mut truck = Truck::open(dir.path(), "crash", Config::default()).unwrap();
    assert_eq!(truck.read("users", "u1").unwrap(), Some(v));
}

#[test]
fn flipped_payload_byte_reads_absent_after_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("c.dat");
    {
        let mut truck = Truck::open(dir.path(), "c", Config::default()).unwrap();
        truck
            .write("users", "u1", value_map! { "name" => "Mallory" }, true)
            .unwrap();
        truck.close().unwrap();
    }
    {
        let mut bytes = fs::read(&path).unwrap();
        let at = bytes.windows(7).position(|w| w == b"Mallory").unwrap();
        bytes[at] ^= 0x01;
        fs::write(&path, &bytes).unwrap();
    }
    let mut truck = Truck::open(dir.path(), "c", Config::default()).unwrap();
    assert_eq!(truck.read("users", "u1").unwrap(), None);
}

#[test]
fn crash_mid_batch_applies_nothing() {
    let dir = TempDir::new().unwrap();

    // TX_START and two of three records reached disk; the commit did not.
    let mut count = BTreeMap::new();
    count.insert("count".to_string(), Value::Int(3));
    let mut bytes = encode_record(
        SYS_BOX,
        "TX_START_41",
        &encode_value(&Value::Map(count)),
    )
    .unwrap();
    for (tag, v) in [("a", 1i64), ("b", 2i64)] {
        let data = encode_value(&value_map! { "v" => v });
        bytes.extend_from_slice(&encode_record("b", tag, &data).unwrap());
    }
    fs::create_dir_all(dir.path().join("store")).unwrap();
    fs::write(dir.path().join("store").join("t.dat"), &bytes).unwrap();

    let store = Arc::new(FreightStore::open(dir.path().join("store"), Config::default()).unwrap());
    assert_eq!(store.get("t", "b", "a").unwrap(), None);
    assert_eq!(store.get("t", "b", "b").unwrap(), None);
    assert_eq!(store.get("t", "b", "c").unwrap(), None);
}

#[test]
fn cas_success_then_failure() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FreightStore::open(dir.path().join("store"), Config::default()).unwrap());

    store.put("t", "k", "t1", value_map! { "ver" => 1i64 }, false).unwrap();
    assert!(store
        .put_cas("t", "k", "t1", value_map! { "ver" => 2i64 }, "ver", Value::Int(1), false)
        .unwrap());
    assert!(!store
        .put_cas("t", "k", "t1", value_map! { "ver" => 3i64 }, "ver", Value::Int(1), false)
        .unwrap());
    assert_eq!(
        store.get("t", "k", "t1").unwrap(),
        Some(value_map! { "ver" => 2i64 })
    );
}

#[test]
fn prefix_search_returns_exact_matches() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FreightStore::open(dir.path().join("store"), Config::default()).unwrap());

    let matching = ["Alice", "Alba", "Alan", "Alfred", "Alma"];
    let other = ["Bob", "Carol", "Dave"];
    for (i, name) in matching.iter().chain(other.iter()).enumerate() {
        store
            .put("t", "users", &format!("u{}", i), value_map! { "name" => *name }, false)
            .unwrap();
    }

    let hits = store.query("t", "users", "name", "Al").unwrap();
    assert_eq!(hits.len(), 5);
    let mut names: Vec<String> = hits
        .iter()
        .map(|v| v.field("name").unwrap().as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, ["Alan", "Alba", "Alfred", "Alice", "Alma"]);
}

#[test]
fn compact_after_churn_shrinks_file_and_keeps_survivors() {
    let dir = TempDir::new().unwrap();
    // Opportunistic compaction stays out of the way so the explicit
    // compact below is what reclaims the churn.
    let mut config = Config::default();
    config.compact_threshold = 1_000_000;
    let mut truck = Truck::open(dir.path(), "churn", config).unwrap();

    for i in 0..1000i64 {
        let tag = format!("t{:04}", i);
        for round in 0..3i64 {
            truck
                .write("load", &tag, value_map! { "i" => i, "round" => round }, false)
                .unwrap();
        }
    }
    for i in 0..500i64 {
        truck.remove_tag("load", &format!("t{:04}", i), false).unwrap();
    }
    truck.flush().unwrap();
    let before = truck.data_len();

    truck.compact().unwrap();
    assert!(truck.data_len() < before);

    let survivors = truck.read_box("load").unwrap();
    assert_eq!(survivors.len(), 500);
    for i in 500..1000i64 {
        assert_eq!(
            survivors[&format!("t{:04}", i)],
            value_map! { "i" => i, "round" => 2i64 }
        );
    }
}

#[test]
fn recovery_ignores_appended_garbage() {
    let dir = TempDir::new().unwrap();
    {
        let mut truck = Truck::open(dir.path(), "g", Config::default()).unwrap();
        for i in 0..10i64 {
            truck.write("b", &format!("t{}", i), value_map! { "v" => i }, false).unwrap();
        }
        truck.close().unwrap();
    }
    {
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("g.dat"))
            .unwrap();
        let garbage: Vec<u8> = (0..251u32).map(|i| (i.wrapping_mul(97) % 251) as u8).collect();
        file.write_all(&garbage).unwrap();
    }
    let mut truck = Truck::open(dir.path(), "g", Config::default()).unwrap();
    let snapshot = truck.read_box("b").unwrap();
    assert_eq!(snapshot.len(), 10);
    assert_eq!(snapshot["t7"], value_map! { "v" => 7i64 });

    // The truck still accepts and persists writes after the noisy tail.
    truck.write("b", "t10", value_map! { "v" => 10i64 }, true).unwrap();
    assert_eq!(
        truck.read("b", "t10").unwrap(),
        Some(value_map! { "v" => 10i64 })
    );
}

#[test]
fn store_reopen_sees_closed_state() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("store");
    {
        let store = Arc::new(FreightStore::open(&root, Config::default()).unwrap());
        let mut entries = BTreeMap::new();
        for i in 0..20i64 {
            entries.insert(format!("t{}", i), value_map! { "v" => i });
        }
        store.batch("app", "bulk", entries).unwrap();
        store.close().unwrap();
    }
    let store = Arc::new(FreightStore::open(&root, Config::default()).unwrap());
    assert_eq!(store.get_box("app", "bulk").unwrap().len(), 20);
    assert_eq!(store.boxes("app").unwrap(), ["bulk"]);
}
